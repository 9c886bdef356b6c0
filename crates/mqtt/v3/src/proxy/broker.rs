//! Accepting side of the proxy: routes each downstream CONNECT to the
//! session for its client id.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use tracing::{debug, info, warn};
use validator::Validate;

use super::session::{ProxySession, SessionSettings};
use crate::{
    channel::ChannelId,
    config::ProxyConfig,
    error::{MqttError, Result},
    handler::{ChannelEvent, HandlerId, MessageHandler},
    manager::{ChannelManager, Channels, ManagerHandle},
    message::{ConnAckMessage, ConnectMessage, ConnectReturnCode, Message},
};

/// Sessions a single CONNECT may be offered to before it is refused.
const MAX_ROUTE_ATTEMPTS: u32 = 3;

/// Longest client id MQTT 3.1 allows.
const MAX_CLIENT_ID_LEN: usize = 23;

struct SessionEntry {
    handler: HandlerId,
    closed: Arc<AtomicBool>,
}

/// Owns the listener and the client id → session map.
pub(crate) struct BrokerHandler {
    id: HandlerId,
    settings: SessionSettings,
    sessions: HashMap<String, SessionEntry>,
    session_count: Arc<AtomicUsize>,
}

impl BrokerHandler {
    fn new(id: HandlerId, settings: SessionSettings, session_count: Arc<AtomicUsize>) -> Self {
        Self {
            id,
            settings,
            sessions: HashMap::new(),
            session_count,
        }
    }

    /// Hands `downstream` to the session for its client id, creating one if
    /// none is live.
    fn route(&mut self, channels: &mut Channels, downstream: ChannelId, connect: ConnectMessage, attempt: u32) {
        self.reap_closed();

        if attempt >= MAX_ROUTE_ATTEMPTS {
            warn!(
                "Client '{}' on {}: no session accepted the connection after {} attempts",
                connect.client_id, downstream, attempt
            );
            refuse(channels, downstream, ConnectReturnCode::ServerUnavailable);
            return;
        }

        let client_id = connect.client_id.clone();
        let session = match self.sessions.get(&client_id) {
            Some(entry) => entry.handler,
            None => self.open_session(channels, &connect),
        };

        if let Err(err) = channels.detach(downstream) {
            debug!("Downstream {} gone before routing: {}", downstream, err);
            return;
        }

        let broker = self.id;
        channels.defer(move |reactor| {
            let accepted = reactor.with_handler(session, |session: &mut ProxySession, channels| {
                session.new_connection(channels, downstream, connect.clone())
            });
            if accepted != Some(true) {
                reactor.with_handler(broker, |broker: &mut BrokerHandler, channels| {
                    broker.session_refused(channels, session, downstream, connect, attempt + 1)
                });
            }
        });
    }

    fn open_session(&mut self, channels: &mut Channels, connect: &ConnectMessage) -> HandlerId {
        let settings = self.settings.clone();
        let template = connect.clone();
        let mut closed = None;
        let handler = channels.register_handler_with(|id| {
            let session = ProxySession::new(id, template, settings);
            closed = Some(session.closed_flag());
            Box::new(session)
        });
        info!("Created session {} for client '{}'", handler, connect.client_id);
        self.sessions.insert(
            connect.client_id.clone(),
            SessionEntry {
                handler,
                closed: closed.unwrap_or_else(|| Arc::new(AtomicBool::new(false))),
            },
        );
        self.session_count.store(self.sessions.len(), Ordering::Relaxed);
        handler
    }

    /// A session turned the connection down while shutting down; forget it
    /// and route again.
    fn session_refused(
        &mut self,
        channels: &mut Channels,
        session: HandlerId,
        downstream: ChannelId,
        connect: ConnectMessage,
        attempt: u32,
    ) {
        debug!(
            "Session {} refused {} for client '{}' (attempt {})",
            session, downstream, connect.client_id, attempt
        );
        if self
            .sessions
            .get(&connect.client_id)
            .is_some_and(|entry| entry.handler == session)
        {
            self.sessions.remove(&connect.client_id);
            self.session_count.store(self.sessions.len(), Ordering::Relaxed);
        }
        channels.defer(move |reactor| {
            reactor.with_handler(session, |session: &mut ProxySession, channels| session.shutdown(channels));
        });
        if channels.attach(downstream, self.id).is_ok() {
            self.route(channels, downstream, connect, attempt);
        }
    }

    fn reap_closed(&mut self) {
        let before = self.sessions.len();
        self.sessions.retain(|client_id, entry| {
            let closed = entry.closed.load(Ordering::Acquire);
            if closed {
                debug!("Reaped closed session {} for client '{}'", entry.handler, client_id);
            }
            !closed
        });
        if self.sessions.len() != before {
            self.session_count.store(self.sessions.len(), Ordering::Relaxed);
        }
    }

    fn shutdown(&mut self, channels: &mut Channels) {
        channels.stop_listening(self.id);
        info!("Shutting down {} sessions", self.sessions.len());
        for (_, entry) in self.sessions.drain() {
            let session = entry.handler;
            channels.defer(move |reactor| {
                reactor.with_handler(session, |session: &mut ProxySession, channels| session.shutdown(channels));
            });
        }
        self.session_count.store(0, Ordering::Relaxed);
    }
}

impl MessageHandler for BrokerHandler {
    fn handle(&mut self, channels: &mut Channels, channel: ChannelId, event: ChannelEvent) -> Result<()> {
        match event {
            ChannelEvent::Message(Message::Connect(connect)) => {
                if connect.client_id.is_empty() || connect.client_id.len() > MAX_CLIENT_ID_LEN {
                    warn!("Rejecting {}: invalid client id '{}'", channel, connect.client_id);
                    refuse(channels, channel, ConnectReturnCode::IdentifierRejected);
                    return Ok(());
                }
                debug!("CONNECT from client '{}' on {}", connect.client_id, channel);
                self.route(channels, channel, connect, 0);
            }
            ChannelEvent::Message(other) => {
                // The channel only lets CONNECT through before routing.
                debug!("Ignoring {} on unrouted {}", other, channel);
            }
            ChannelEvent::Closed { cause: Some(cause), .. } => {
                debug!("Unrouted {} closed: {}", channel, cause);
            }
            _ => {}
        }
        Ok(())
    }
}

fn refuse(channels: &mut Channels, channel: ChannelId, code: ConnectReturnCode) {
    let connack = Message::ConnAck(ConnAckMessage { return_code: code });
    if channels.send(channel, connack).is_ok() {
        channels.close_when_flushed(channel, Some(MqttError::RejectedConnection(code)));
    }
}

/// Running proxy: a listener on its own channel manager plus the sessions
/// it has created.
///
/// # Examples
///
/// ```ignore
/// let config = ProxyConfig {
///     broker_uri: "tcp://broker.internal:1883".into(),
///     port: 0,
///     ..ProxyConfig::default()
/// };
/// let broker = ProxyBroker::start(config)?;
/// println!("proxy listening on {}", broker.local_addr());
/// // ...
/// assert!(broker.shutdown(5_000));
/// ```
pub struct ProxyBroker {
    manager: ChannelManager,
    handler: HandlerId,
    local_addr: SocketAddr,
    session_count: Arc<AtomicUsize>,
}

impl ProxyBroker {
    pub fn start(config: ProxyConfig) -> Result<Self> {
        config.validate()?;
        let settings = SessionSettings::from_config(&config)?;
        let listen = config.listen_addr()?;
        let options = config.downstream_options();

        let manager = ChannelManager::start("mqtt-proxy")?;
        let handle = manager.handle();
        let session_count = Arc::new(AtomicUsize::new(0));
        let counter = session_count.clone();
        let handler = handle.register_handler_with(move |id| Box::new(BrokerHandler::new(id, settings, counter)))?;
        let local_addr = handle.call(move |reactor| reactor.channels().listen(listen, options, handler))??;
        info!("Proxy listening on {} for {}", local_addr, config.broker_uri);

        Ok(Self {
            manager,
            handler,
            local_addr,
            session_count,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Sessions currently known to the broker, including ones still waiting
    /// to be reaped.
    pub fn session_count(&self) -> usize {
        self.session_count.load(Ordering::Relaxed)
    }

    pub fn handle(&self) -> ManagerHandle {
        self.manager.handle()
    }

    /// Shuts every session down, stops accepting and stops the manager.
    ///
    /// Returns false if that took longer than `timeout_millis`.
    pub fn shutdown(self, timeout_millis: u64) -> bool {
        let started = Instant::now();
        let budget = Duration::from_millis(timeout_millis);
        let handler = self.handler;
        let queued = self.manager.handle().execute(move |reactor| {
            reactor.with_handler(handler, |broker: &mut BrokerHandler, channels| broker.shutdown(channels));
        });
        if let Err(err) = queued {
            warn!("Proxy shutdown could not reach the manager: {}", err);
        }
        let remaining = budget.saturating_sub(started.elapsed());
        let finished = self.manager.shutdown(remaining);
        if !finished {
            warn!("Proxy shutdown overran {} ms", timeout_millis);
        }
        finished
    }
}
