//! Installs the global `tracing` subscriber from the `[logger]` section.
//!
//! Console output (compact, pretty or JSON) and the systemd journal can be
//! enabled independently. Both use the configured level unless `RUST_LOG`
//! is set.

use std::io;

use thiserror::Error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};
use validator::{Validate, ValidationErrors};

use crate::{
    config::logger::{ConsoleConfig, JournaldConfig, LogFormat, LoggerConfig},
    print_info, print_warn,
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("Logger configuration validation error: {0}")]
    ValidationError(#[from] ValidationErrors),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("Logger initialization error: {0}")]
    InitializationError(String),

    #[error("No logging layers were configured or successfully initialized")]
    NoLayersConfigured,
}

pub struct LoggerManager {
    config: LoggerConfig,
}

impl LoggerManager {
    /// Validates `config`. Nothing is installed until [`init`](Self::init).
    pub fn new(config: LoggerConfig) -> Result<Self, LoggerError> {
        config.validate()?;
        Ok(LoggerManager { config })
    }

    /// Installs the subscriber. Call once, before the proxy starts.
    ///
    /// A journald failure is only fatal when the journal is the sole output.
    pub fn init(&self) -> Result<(), LoggerError> {
        let mut layers: Vec<BoxedLayer> = Vec::new();

        if let Some(console) = self.config.console.as_ref().filter(|c| c.enabled) {
            layers.push(console_layer(console, self.filter()));
        }

        if let Some(journald) = self.config.journald.as_ref().filter(|j| j.enabled) {
            match journald_layer(journald, self.filter()) {
                Ok(layer) => {
                    layers.push(layer);
                    print_info!("Journald logging enabled as '{}'", journald.identifier);
                }
                Err(e) if layers.is_empty() => return Err(e),
                Err(e) => print_warn!("Journald logging unavailable, console only: {}", e),
            }
        }

        if layers.is_empty() {
            return Err(LoggerError::NoLayersConfigured);
        }
        tracing_subscriber::registry()
            .with(layers)
            .try_init()
            .map_err(|e| LoggerError::InitializationError(e.to_string()))
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.config.level))
    }
}

fn console_layer(config: &ConsoleConfig, filter: EnvFilter) -> BoxedLayer {
    macro_rules! finish {
        ($layer:expr) => {{
            let layer = $layer
                .with_target(config.show_target)
                .with_thread_names(config.show_thread_names)
                .with_ansi(config.ansi_colors)
                .with_writer(io::stdout);
            if config.show_timestamps {
                layer.with_filter(filter).boxed()
            } else {
                layer.without_time().with_filter(filter).boxed()
            }
        }};
    }

    match config.format {
        LogFormat::Compact => finish!(fmt::layer().compact()),
        LogFormat::Pretty => finish!(fmt::layer().pretty()),
        LogFormat::Json => finish!(fmt::layer().json()),
    }
}

fn journald_layer(config: &JournaldConfig, filter: EnvFilter) -> Result<BoxedLayer, LoggerError> {
    let layer = tracing_journald::layer()?.with_syslog_identifier(config.identifier.clone());
    Ok(layer.with_filter(filter).boxed())
}
