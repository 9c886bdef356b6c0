use std::{process::ExitCode, sync::OnceLock};

use relaymq::{config::Config, logger::LoggerManager, print_error};
use relaymq_mqtt_v3::ProxyBroker;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

static CONFIG: OnceLock<Config> = OnceLock::new();

pub fn config() -> &'static Config {
    CONFIG.get_or_init(|| {
        Config::new().unwrap_or_else(|e| {
            print_error!("{}", e);
            std::process::exit(1);
        })
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    let cfg = config();
    let logger = match LoggerManager::new(cfg.logger.clone()) {
        Ok(logger) => logger,
        Err(e) => {
            print_error!("Failed to set up logging: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = logger.init() {
        print_error!("Failed to initialize logging: {}", e);
        return ExitCode::FAILURE;
    }
    info!("Starting relaymq version {}...", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", cfg.logger.level);
    debug!("{:#?}", cfg.proxy);

    let proxy = cfg.proxy.clone();
    let broker = match tokio::task::spawn_blocking(move || ProxyBroker::start(proxy)).await {
        Ok(Ok(broker)) => broker,
        Ok(Err(e)) => {
            error!("Failed to start proxy: {}", e);
            return ExitCode::FAILURE;
        }
        Err(e) => {
            error!("Proxy start-up task failed: {}", e);
            return ExitCode::FAILURE;
        }
    };
    info!(
        "Proxy listening on {}, forwarding to {}",
        broker.local_addr(),
        cfg.proxy.broker_uri
    );

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, initiating graceful shutdown..."),
            Err(e) => error!("Could not listen for Ctrl+C, shutting down: {}", e),
        }
        signal.cancel();
    });
    shutdown.cancelled().await;

    let timeout = cfg.proxy.shutdown_timeout_millis;
    info!("Closing {} sessions", broker.session_count());
    let finished = tokio::task::spawn_blocking(move || broker.shutdown(timeout))
        .await
        .unwrap_or(false);
    if finished {
        info!("Shutdown complete");
        ExitCode::SUCCESS
    } else {
        warn!("Shutdown did not finish within {} ms", timeout);
        ExitCode::FAILURE
    }
}
