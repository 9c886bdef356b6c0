//! One proxied client id: a persistent upstream connection shared by a
//! succession of downstream connections.
//!
//! The session owns exactly one upstream channel to the real broker for its
//! whole life and at most one attached downstream channel at a time. Message
//! ids are translated in both directions:
//!
//! - downstream-originated PUBLISH/SUBSCRIBE/UNSUBSCRIBE get a fresh upstream
//!   id; the upstream acknowledgment is forwarded with the downstream id
//! - upstream-originated PUBLISH gets a downstream id; the downstream
//!   acknowledgment is forwarded upstream with the original id
//!
//! While no downstream is attached, everything bound for it is held in
//! arrival order and replayed to the next one. While the upstream is down,
//! everything bound for it is queued and replayed after the next CONNACK.
//!
//! ```text
//! Initializing ──CONNACK──▶ Up ──upstream lost──▶ Reconnecting
//!       │                   ▲                          │
//!       │                   └────────CONNACK───────────┘
//!       └──────── rejected / strategy gives up / shutdown ──▶ Closed
//! ```

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use tracing::{debug, info, warn};

use crate::{
    channel::{ChannelId, ChannelOptions},
    config::{BrokerUri, ProxyConfig},
    error::{MqttError, Result},
    handler::{ChannelEvent, HandlerId, MessageHandler},
    manager::Channels,
    message::{ConnAckMessage, ConnectMessage, ConnectReturnCode, Message, QoS, SubAckMessage},
    reconnect::{ProgressiveReconnectionStrategy, ReconnectionStrategy},
};

/// Per-session settings derived from the proxy configuration.
#[derive(Debug, Clone)]
pub(crate) struct SessionSettings {
    pub(crate) broker: BrokerUri,
    pub(crate) upstream: ChannelOptions,
    pub(crate) keep_alive_seconds: u16,
    pub(crate) drop_qos0_when_detached: bool,
    pub(crate) max_held_messages: usize,
    pub(crate) reconnect: ProgressiveReconnectionStrategy,
}

impl SessionSettings {
    pub(crate) fn from_config(config: &ProxyConfig) -> Result<Self> {
        Ok(Self {
            broker: config.broker()?,
            upstream: config.upstream_options(),
            keep_alive_seconds: u16::try_from(config.keep_alive_seconds).unwrap_or(u16::MAX),
            drop_qos0_when_detached: config.drop_qos0_when_detached,
            max_held_messages: config.max_held_messages,
            reconnect: config.reconnect.clone(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    Up,
    Reconnecting,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SessionState::Initializing => "initializing",
            SessionState::Up => "up",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Closed => "closed",
        };
        f.write_str(text)
    }
}

/// Two-way mapping between downstream and upstream message ids.
#[derive(Debug, Default)]
struct IdMap {
    by_downstream: HashMap<u16, u16>,
    by_upstream: HashMap<u16, u16>,
}

impl IdMap {
    fn insert(&mut self, downstream: u16, upstream: u16) {
        if let Some(stale) = self.by_downstream.insert(downstream, upstream) {
            self.by_upstream.remove(&stale);
        }
        if let Some(stale) = self.by_upstream.insert(upstream, downstream) {
            if stale != downstream {
                self.by_downstream.remove(&stale);
            }
        }
    }

    fn upstream_of(&self, downstream: u16) -> Option<u16> {
        self.by_downstream.get(&downstream).copied()
    }

    fn downstream_of(&self, upstream: u16) -> Option<u16> {
        self.by_upstream.get(&upstream).copied()
    }

    fn remove_by_downstream(&mut self, downstream: u16) -> Option<u16> {
        let upstream = self.by_downstream.remove(&downstream)?;
        self.by_upstream.remove(&upstream);
        Some(upstream)
    }

    fn remove_by_upstream(&mut self, upstream: u16) -> Option<u16> {
        let downstream = self.by_upstream.remove(&upstream)?;
        self.by_downstream.remove(&downstream);
        Some(downstream)
    }

    fn clear(&mut self) {
        self.by_downstream.clear();
        self.by_upstream.clear();
    }

    fn len(&self) -> usize {
        self.by_downstream.len()
    }
}

/// A downstream-bound message waiting for a downstream to attach.
#[derive(Debug)]
struct HeldMessage {
    message: Message,
    /// Upstream id of an upstream-originated QoS 1/2 publish.
    upstream_id: Option<u16>,
}

/// An upstream-bound message waiting for the upstream connection.
#[derive(Debug)]
struct PendingUpstream {
    message: Message,
    /// Downstream id to map once an upstream id is assigned.
    downstream_id: Option<u16>,
}

pub struct ProxySession {
    id: HandlerId,
    client_id: String,
    connect: ConnectMessage,
    settings: SessionSettings,
    strategy: Box<dyn ReconnectionStrategy>,
    state: SessionState,
    closed: Arc<AtomicBool>,
    upstream: Option<ChannelId>,
    downstream: Option<ChannelId>,
    /// Downstream attached but still waiting for its CONNACK.
    downstream_ready: bool,
    /// Ids of downstream-originated messages in flight upstream.
    outbound: IdMap,
    /// Ids of upstream-originated publishes in flight downstream.
    inbound: IdMap,
    held: VecDeque<HeldMessage>,
    pending_upstream: VecDeque<PendingUpstream>,
}

impl ProxySession {
    pub(crate) fn new(id: HandlerId, connect: ConnectMessage, settings: SessionSettings) -> Self {
        let strategy: Box<dyn ReconnectionStrategy> = Box::new(settings.reconnect.clone());
        Self {
            id,
            client_id: connect.client_id.clone(),
            connect,
            settings,
            strategy,
            state: SessionState::Initializing,
            closed: Arc::new(AtomicBool::new(false)),
            upstream: None,
            downstream: None,
            downstream_ready: false,
            outbound: IdMap::default(),
            inbound: IdMap::default(),
            held: VecDeque::new(),
            pending_upstream: VecDeque::new(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Flag the broker polls to reap this session.
    pub(crate) fn closed_flag(&self) -> Arc<AtomicBool> {
        self.closed.clone()
    }

    pub fn downstream(&self) -> Option<ChannelId> {
        self.downstream
    }

    pub fn upstream(&self) -> Option<ChannelId> {
        self.upstream
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    pub fn in_flight_ids(&self) -> (usize, usize) {
        (self.outbound.len(), self.inbound.len())
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            info!("Session '{}' state changed to: {}", self.client_id, state);
            self.state = state;
        }
    }

    /// Hands `downstream` to this session.
    ///
    /// Returns false when the session is closed; the caller must route the
    /// connection to a new session. An attached downstream is evicted with
    /// [`MqttError::SessionTakenOver`] before the new one gets its CONNACK.
    pub fn new_connection(&mut self, channels: &mut Channels, downstream: ChannelId, connect: ConnectMessage) -> bool {
        if self.state == SessionState::Closed {
            return false;
        }

        if let Some(previous) = self.downstream.take() {
            if previous != downstream {
                info!(
                    "Session '{}': {} takes over from {}",
                    self.client_id, downstream, previous
                );
                let unsent = channels.unsent_messages(previous).unwrap_or_default();
                self.hold_front(unsent);
                channels.close(previous, Some(MqttError::SessionTakenOver));
            }
        }

        if let Err(err) = channels.attach(downstream, self.id) {
            warn!("Session '{}' could not attach {}: {}", self.client_id, downstream, err);
            return true;
        }
        self.downstream = Some(downstream);
        self.downstream_ready = false;
        if connect.clean_session != self.connect.clean_session {
            debug!(
                "Session '{}': downstream clean_session={} ignored, upstream keeps {}",
                self.client_id, connect.clean_session, self.connect.clean_session
            );
        }

        if self.upstream.is_none() && self.state == SessionState::Initializing {
            self.open_upstream(channels);
        }
        if self.state != SessionState::Initializing {
            self.accept_downstream(channels, ConnectReturnCode::Accepted);
        }
        true
    }

    /// Closes both connections and marks the session closed.
    pub fn shutdown(&mut self, channels: &mut Channels) {
        if self.state == SessionState::Closed {
            return;
        }
        self.set_state(SessionState::Closed);
        self.closed.store(true, Ordering::Release);
        if let Some(upstream) = self.upstream {
            if channels.disconnect(upstream, None).is_err() {
                channels.close(upstream, None);
            }
        }
        if let Some(downstream) = self.downstream {
            channels.close(downstream, None);
        }
        self.retire_if_idle(channels);
    }

    fn open_upstream(&mut self, channels: &mut Channels) {
        let mut connect = self.connect.clone();
        connect.keep_alive_seconds = self.settings.keep_alive_seconds;
        let upstream = channels.connect(self.settings.broker.address(), self.settings.upstream.clone(), self.id);
        debug!("Session '{}' opening upstream {}", self.client_id, upstream);
        self.upstream = Some(upstream);
        if let Err(err) = channels.send(upstream, Message::Connect(connect)) {
            warn!("Session '{}' could not queue CONNECT: {}", self.client_id, err);
        }
        for pending in std::mem::take(&mut self.pending_upstream) {
            self.to_upstream(channels, pending.message, pending.downstream_id);
        }
    }

    fn reconnect(&mut self, channels: &mut Channels) {
        if self.state == SessionState::Reconnecting && self.upstream.is_none() {
            self.open_upstream(channels);
        }
    }

    /// Sends CONNACK downstream and replays everything held for it.
    fn accept_downstream(&mut self, channels: &mut Channels, code: ConnectReturnCode) {
        let Some(downstream) = self.downstream else {
            return;
        };
        let connack = Message::ConnAck(ConnAckMessage { return_code: code });
        if let Err(err) = channels.send(downstream, connack) {
            warn!("Session '{}' could not send CONNACK: {}", self.client_id, err);
            return;
        }
        if !code.is_accepted() {
            channels.close_when_flushed(downstream, Some(MqttError::RejectedConnection(code)));
            self.downstream = None;
            return;
        }
        self.downstream_ready = true;
        let held = std::mem::take(&mut self.held);
        if !held.is_empty() {
            info!(
                "Session '{}' replaying {} held messages to {}",
                self.client_id,
                held.len(),
                downstream
            );
        }
        for HeldMessage { message, upstream_id } in held {
            self.to_downstream(channels, message, upstream_id);
        }
    }

    /// Puts what a departed downstream never acknowledged ahead of anything
    /// already held.
    fn hold_front(&mut self, messages: Vec<Message>) {
        let mut held: VecDeque<HeldMessage> = messages
            .into_iter()
            .filter(|message| !matches!(message, Message::ConnAck(_)))
            .map(|message| {
                let upstream_id = match &message {
                    Message::Publish(_) => message.message_id().and_then(|id| self.inbound.upstream_of(id)),
                    _ => None,
                };
                HeldMessage { message, upstream_id }
            })
            .collect();
        held.extend(std::mem::take(&mut self.held));
        self.held = held;
    }

    /// Sends toward the client, or holds while none is attached.
    fn to_downstream(&mut self, channels: &mut Channels, message: Message, upstream_id: Option<u16>) {
        match self.downstream.filter(|_| self.downstream_ready) {
            Some(downstream) => match channels.send(downstream, message) {
                Ok(Some(downstream_id)) => {
                    if let Some(upstream_id) = upstream_id {
                        self.inbound.insert(downstream_id, upstream_id);
                    }
                }
                Ok(None) => {}
                Err(err) => warn!("Session '{}' dropped downstream message: {}", self.client_id, err),
            },
            None => self.hold(message, upstream_id),
        }
    }

    fn hold(&mut self, message: Message, upstream_id: Option<u16>) {
        if let Message::Publish(publish) = &message {
            if publish.qos == QoS::AtMostOnce && self.settings.drop_qos0_when_detached {
                debug!("Session '{}' dropped QoS 0 publish while detached", self.client_id);
                return;
            }
        }
        if self.held.len() >= self.settings.max_held_messages {
            // Unacknowledged upstream publishes are redelivered by the broker.
            warn!(
                "Session '{}' hold queue full ({}), dropping {}",
                self.client_id,
                self.held.len(),
                message
            );
            return;
        }
        self.held.push_back(HeldMessage { message, upstream_id });
    }

    /// Sends toward the broker, or queues while the upstream is down.
    fn to_upstream(&mut self, channels: &mut Channels, message: Message, downstream_id: Option<u16>) {
        match self.upstream {
            Some(upstream) => match channels.send(upstream, message) {
                Ok(Some(upstream_id)) => {
                    if let Some(downstream_id) = downstream_id {
                        self.outbound.insert(downstream_id, upstream_id);
                    }
                }
                Ok(None) => {}
                Err(err) => warn!("Session '{}' dropped upstream message: {}", self.client_id, err),
            },
            None => self.pending_upstream.push_back(PendingUpstream { message, downstream_id }),
        }
    }

    fn on_upstream_message(&mut self, channels: &mut Channels, message: Message) {
        match message {
            Message::ConnAck(connack) if connack.return_code.is_accepted() => {
                self.strategy.connection_established();
                self.set_state(SessionState::Up);
                if self.downstream.is_some() && !self.downstream_ready {
                    self.accept_downstream(channels, connack.return_code);
                }
            }
            Message::ConnAck(connack) => {
                warn!(
                    "Session '{}' upstream rejected: {}",
                    self.client_id, connack.return_code
                );
                if self.state == SessionState::Initializing {
                    self.accept_downstream(channels, connack.return_code);
                }
            }
            Message::Publish(mut publish) => {
                if publish.qos == QoS::AtMostOnce {
                    self.to_downstream(channels, Message::Publish(publish), None);
                    return;
                }
                let upstream_id = publish.message_id;
                let known = self.inbound.downstream_of(upstream_id).is_some()
                    || self.held.iter().any(|held| held.upstream_id == Some(upstream_id));
                if known {
                    debug!(
                        "Session '{}' ignoring redelivered publish id={}",
                        self.client_id, upstream_id
                    );
                    return;
                }
                publish.message_id = 0;
                publish.duplicate = false;
                self.to_downstream(channels, Message::Publish(publish), Some(upstream_id));
            }
            Message::PubRel { message_id, .. } => match self.inbound.downstream_of(message_id) {
                Some(downstream_id) => self.to_downstream(channels, Message::pub_rel(downstream_id), None),
                None if self.held.iter().any(|held| held.upstream_id == Some(message_id)) => {
                    debug!("Session '{}' PUBREL id={} before delivery", self.client_id, message_id);
                }
                None => self.to_upstream(channels, Message::PubComp(message_id), None),
            },
            other => debug!("Session '{}' ignoring upstream {}", self.client_id, other),
        }
    }

    fn on_upstream_ack(&mut self, channels: &mut Channels, ack: Message) {
        let forwarded = match ack {
            Message::PubAck(id) => self.outbound.remove_by_upstream(id).map(Message::PubAck),
            Message::PubRec(id) => self.outbound.downstream_of(id).map(Message::PubRec),
            Message::PubComp(id) => self.outbound.remove_by_upstream(id).map(Message::PubComp),
            Message::UnsubAck(id) => self.outbound.remove_by_upstream(id).map(Message::UnsubAck),
            Message::SubAck(suback) => self
                .outbound
                .remove_by_upstream(suback.message_id)
                .map(|message_id| {
                    Message::SubAck(SubAckMessage {
                        message_id,
                        granted_qos: suback.granted_qos,
                    })
                }),
            other => {
                debug!("Session '{}' ignoring upstream ack {}", self.client_id, other);
                None
            }
        };
        if let Some(message) = forwarded {
            self.to_downstream(channels, message, None);
        }
    }

    /// True when a request with `downstream_id` is already on its way upstream.
    fn retransmitted(&self, message: &Message, downstream_id: u16) -> bool {
        let known = self.outbound.upstream_of(downstream_id).is_some()
            || self
                .pending_upstream
                .iter()
                .any(|pending| pending.downstream_id == Some(downstream_id));
        if known {
            debug!(
                "Session '{}' ignoring retransmitted {} id={}",
                self.client_id,
                message.message_type(),
                downstream_id
            );
        }
        known
    }

    fn on_downstream_message(&mut self, channels: &mut Channels, message: Message) {
        let request = message.needs_message_id() && message.requires_ack();
        if let Some(downstream_id) = message.message_id().filter(|_| request) {
            if self.retransmitted(&message, downstream_id) {
                return;
            }
        }
        match message {
            Message::Publish(mut publish) => {
                if publish.qos == QoS::AtMostOnce {
                    self.to_upstream(channels, Message::Publish(publish), None);
                    return;
                }
                let downstream_id = publish.message_id;
                publish.message_id = 0;
                publish.duplicate = false;
                self.to_upstream(channels, Message::Publish(publish), Some(downstream_id));
            }
            Message::Subscribe(mut subscribe) => {
                let downstream_id = subscribe.message_id;
                subscribe.message_id = 0;
                subscribe.duplicate = false;
                self.to_upstream(channels, Message::Subscribe(subscribe), Some(downstream_id));
            }
            Message::Unsubscribe(mut unsubscribe) => {
                let downstream_id = unsubscribe.message_id;
                unsubscribe.message_id = 0;
                unsubscribe.duplicate = false;
                self.to_upstream(channels, Message::Unsubscribe(unsubscribe), Some(downstream_id));
            }
            Message::PubRel { message_id, .. } => match self.outbound.upstream_of(message_id) {
                Some(upstream_id) => self.to_upstream(channels, Message::pub_rel(upstream_id), None),
                None => self.to_downstream(channels, Message::PubComp(message_id), None),
            },
            other => debug!("Session '{}' ignoring downstream {}", self.client_id, other),
        }
    }

    fn on_downstream_ack(&mut self, channels: &mut Channels, ack: Message) {
        match ack {
            Message::PubAck(id) => {
                if let Some(upstream_id) = self.inbound.remove_by_downstream(id) {
                    self.to_upstream(channels, Message::PubAck(upstream_id), None);
                }
            }
            Message::PubRec(id) => {
                if let Some(upstream_id) = self.inbound.upstream_of(id) {
                    self.to_upstream(channels, Message::PubRec(upstream_id), None);
                }
            }
            Message::PubComp(id) => {
                if let Some(upstream_id) = self.inbound.remove_by_downstream(id) {
                    self.to_upstream(channels, Message::PubComp(upstream_id), None);
                }
            }
            other => debug!("Session '{}' ignoring downstream ack {}", self.client_id, other),
        }
    }

    fn on_upstream_closed(&mut self, channels: &mut Channels, cause: Option<MqttError>, undelivered: Vec<Message>) {
        self.upstream = None;
        if self.state == SessionState::Closed {
            self.retire_if_idle(channels);
            return;
        }

        let fatal = matches!(
            cause.as_ref().and_then(MqttError::rejected_code),
            Some(code) if code != ConnectReturnCode::ServerUnavailable
        );
        let delay = if fatal {
            None
        } else {
            self.strategy.connection_lost(&self.client_id, cause.as_ref())
        };

        let Some(delay) = delay else {
            warn!(
                "Session '{}' upstream lost for good: {}",
                self.client_id,
                cause.as_ref().map_or_else(|| "closed".to_string(), |c| c.to_string())
            );
            self.shutdown(channels);
            return;
        };

        warn!(
            "Session '{}' upstream lost ({}), reconnecting in {:.2} seconds",
            self.client_id,
            cause.as_ref().map_or_else(|| "closed".to_string(), |c| c.to_string()),
            delay.as_secs_f64()
        );
        if self.connect.clean_session {
            self.inbound.clear();
        }
        let mut pending: VecDeque<PendingUpstream> = undelivered
            .into_iter()
            .map(|message| PendingUpstream {
                message,
                downstream_id: None,
            })
            .collect();
        pending.extend(std::mem::take(&mut self.pending_upstream));
        self.pending_upstream = pending;

        if self.state == SessionState::Up {
            self.set_state(SessionState::Reconnecting);
        } else if self.state == SessionState::Initializing {
            self.state = SessionState::Reconnecting;
            // The waiting downstream is answered now; its traffic queues.
            self.accept_downstream(channels, ConnectReturnCode::Accepted);
        }
        let id = self.id;
        channels.schedule(delay, move |reactor| {
            reactor.with_handler(id, |session: &mut ProxySession, channels| session.reconnect(channels));
        });
    }

    fn on_downstream_closed(&mut self, channels: &mut Channels, channel: ChannelId, cause: Option<MqttError>, undelivered: Vec<Message>) {
        if self.downstream != Some(channel) {
            debug!("Session '{}' ignoring close of former downstream {}", self.client_id, channel);
            return;
        }
        match &cause {
            None => info!("Session '{}' downstream {} disconnected", self.client_id, channel),
            Some(cause) => info!("Session '{}' downstream {} lost: {}", self.client_id, channel, cause),
        }
        self.downstream = None;
        self.downstream_ready = false;
        if self.state == SessionState::Closed {
            self.retire_if_idle(channels);
            return;
        }
        self.hold_front(undelivered);
    }

    fn retire_if_idle(&mut self, channels: &mut Channels) {
        if self.upstream.is_none() && self.downstream.is_none() {
            debug!("Session '{}' released", self.client_id);
            channels.retire_handler(self.id);
        }
    }
}

impl MessageHandler for ProxySession {
    fn handle(&mut self, channels: &mut Channels, channel: ChannelId, event: ChannelEvent) -> Result<()> {
        let upstream = self.upstream == Some(channel);
        match event {
            ChannelEvent::Message(message) if upstream => self.on_upstream_message(channels, message),
            ChannelEvent::Message(message) => self.on_downstream_message(channels, message),
            ChannelEvent::Acknowledged { ack, .. } if upstream => self.on_upstream_ack(channels, ack),
            ChannelEvent::Acknowledged { ack, .. } => self.on_downstream_ack(channels, ack),
            ChannelEvent::Closed { cause, undelivered } if upstream => {
                self.on_upstream_closed(channels, cause, undelivered)
            }
            ChannelEvent::Closed { cause, undelivered } => {
                self.on_downstream_closed(channels, channel, cause, undelivered)
            }
            ChannelEvent::Opened | ChannelEvent::Attached | ChannelEvent::Detached => {
                debug!("Session '{}': {} {}", self.client_id, channel, event.name());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        channel::ChannelRole,
        manager::{testing::*, Reactor},
        message::{PublishMessage, SubscribeMessage, Subscription, UnsubscribeMessage},
    };

    type Wire = mpsc::UnboundedReceiver<Message>;

    struct Harness {
        reactor: Reactor,
        session: HandlerId,
        upstreams: mpsc::UnboundedReceiver<(ChannelId, Wire)>,
        sink: HandlerId,
    }

    /// Stands in for the broker handler that owns accepted channels.
    struct Sink;

    impl MessageHandler for Sink {
        fn handle(&mut self, _: &mut Channels, _: ChannelId, _: ChannelEvent) -> Result<()> {
            Ok(())
        }
    }

    fn settings(drop_qos0: bool) -> SessionSettings {
        let mut config = ProxyConfig {
            broker_uri: "tcp://upstream:1883".to_string(),
            drop_qos0_when_detached: drop_qos0,
            ..ProxyConfig::default()
        };
        config.reconnect.base_reconnect_millis = 10;
        SessionSettings::from_config(&config).unwrap()
    }

    impl Harness {
        fn new(drop_qos0: bool) -> Self {
            let mut reactor = reactor();
            let upstreams = reactor.connect_in_memory();
            let sink = reactor.register(Box::new(Sink));
            let settings = settings(drop_qos0);
            let session = reactor.register_with(|id| {
                Box::new(ProxySession::new(id, ConnectMessage::new("x", false, 60), settings))
            });
            Self {
                reactor,
                session,
                upstreams,
                sink,
            }
        }

        /// An accepted downstream channel that has sent CONNECT.
        fn downstream(&mut self) -> (ChannelId, Wire) {
            let (channel, wire) =
                self.reactor
                    .open_test_channel(ChannelRole::Server, ChannelOptions::default(), self.sink);
            self.reactor.inject(channel, Message::Connect(ConnectMessage::new("x", false, 60)));
            (channel, wire)
        }

        fn attach(&mut self, downstream: ChannelId) -> bool {
            let accepted = self
                .reactor
                .with_handler(self.session, |session: &mut ProxySession, channels| {
                    session.new_connection(channels, downstream, ConnectMessage::new("x", false, 60))
                })
                .unwrap();
            self.reactor.run_once();
            accepted
        }

        fn session<R>(&mut self, f: impl FnOnce(&mut ProxySession, &mut Channels) -> R) -> R {
            self.reactor.with_handler(self.session, f).unwrap()
        }

        fn upstream(&mut self) -> (ChannelId, Wire) {
            let (channel, mut wire) = self.upstreams.try_recv().unwrap();
            assert!(matches!(drain(&mut wire).as_slice(), [Message::Connect(c)] if c.client_id == "x"));
            self.reactor.inject(
                channel,
                Message::ConnAck(ConnAckMessage {
                    return_code: ConnectReturnCode::Accepted,
                }),
            );
            (channel, wire)
        }
    }

    fn publish(topic: &str, qos: QoS, id: u16) -> Message {
        let mut message = PublishMessage::new(topic, "p", qos);
        message.message_id = id;
        Message::Publish(message)
    }

    fn topics(messages: &[Message]) -> Vec<String> {
        messages
            .iter()
            .filter_map(|m| match m {
                Message::Publish(p) => Some(p.topic.clone()),
                _ => None,
            })
            .collect()
    }

    fn connack(accepted: bool) -> Message {
        Message::ConnAck(ConnAckMessage {
            return_code: if accepted {
                ConnectReturnCode::Accepted
            } else {
                ConnectReturnCode::NotAuthorized
            },
        })
    }

    #[test]
    fn test_first_connection_waits_for_upstream_connack() {
        let mut h = Harness::new(false);
        let (a, mut a_wire) = h.downstream();
        assert!(h.attach(a));
        assert!(drain(&mut a_wire).is_empty());

        let _ = h.upstream();
        assert_eq!(drain(&mut a_wire), vec![connack(true)]);
        assert_eq!(h.session(|s, _| s.state()), SessionState::Up);
    }

    #[test]
    fn test_upstream_rejection_is_forwarded_and_closes_session() {
        let mut h = Harness::new(false);
        let (a, mut a_wire) = h.downstream();
        h.attach(a);
        let (upstream, mut up_wire) = h.upstreams.try_recv().unwrap();
        drain(&mut up_wire);
        h.reactor.inject(upstream, connack(false));
        assert_eq!(h.reactor.pending_timers(), 1);
        h.reactor.run_once();

        assert_eq!(drain(&mut a_wire), vec![connack(false)]);
        assert_eq!(h.reactor.channels().state(a), None);
        assert_eq!(h.reactor.channels().state(upstream), None);
        assert!(!h.reactor.has_handler(h.session));
    }

    #[test]
    fn test_publish_ids_translated_both_ways() {
        let mut h = Harness::new(false);
        let (a, mut a_wire) = h.downstream();
        h.attach(a);
        let (upstream, mut up_wire) = h.upstream();
        drain(&mut a_wire);

        // Downstream-originated QoS 1.
        h.reactor.inject(a, publish("up", QoS::AtLeastOnce, 500));
        let sent = drain(&mut up_wire);
        let upstream_id = sent[0].message_id().unwrap();
        assert_eq!(upstream_id, 1);
        h.reactor.inject(upstream, Message::PubAck(upstream_id));
        assert_eq!(drain(&mut a_wire), vec![Message::PubAck(500)]);

        // Upstream-originated QoS 2.
        h.reactor.inject(upstream, publish("down", QoS::ExactlyOnce, 900));
        let delivered = drain(&mut a_wire);
        let downstream_id = delivered[0].message_id().unwrap();
        h.reactor.inject(upstream, publish("down", QoS::ExactlyOnce, 900));
        assert!(drain(&mut a_wire).is_empty());

        h.reactor.inject(a, Message::PubRec(downstream_id));
        assert_eq!(drain(&mut up_wire), vec![Message::PubRec(900)]);
        h.reactor.inject(upstream, Message::pub_rel(900));
        assert_eq!(drain(&mut a_wire), vec![Message::pub_rel(downstream_id)]);
        h.reactor.inject(a, Message::PubComp(downstream_id));
        assert_eq!(drain(&mut up_wire), vec![Message::PubComp(900)]);
        assert_eq!(h.session(|s, _| s.in_flight_ids()), (0, 0));
    }

    #[test]
    fn test_subscribe_translated() {
        let mut h = Harness::new(false);
        let (a, mut a_wire) = h.downstream();
        h.attach(a);
        let (upstream, mut up_wire) = h.upstream();
        drain(&mut a_wire);

        let mut subscribe = SubscribeMessage::new(vec![Subscription::new("t/#", QoS::AtLeastOnce)]);
        subscribe.message_id = 42;
        h.reactor.inject(a, Message::Subscribe(subscribe));
        let upstream_id = drain(&mut up_wire)[0].message_id().unwrap();
        h.reactor.inject(
            upstream,
            Message::SubAck(SubAckMessage {
                message_id: upstream_id,
                granted_qos: vec![QoS::AtLeastOnce],
            }),
        );
        assert_eq!(
            drain(&mut a_wire),
            vec![Message::SubAck(SubAckMessage {
                message_id: 42,
                granted_qos: vec![QoS::AtLeastOnce]
            })]
        );
    }

    #[test]
    fn test_retransmitted_requests_forwarded_once() {
        let mut h = Harness::new(false);
        let (a, mut a_wire) = h.downstream();
        h.attach(a);
        let (upstream, mut up_wire) = h.upstream();
        drain(&mut a_wire);

        let mut subscribe = SubscribeMessage::new(vec![Subscription::new("t/#", QoS::AtLeastOnce)]);
        subscribe.message_id = 42;
        h.reactor.inject(a, Message::Subscribe(subscribe.clone()));
        subscribe.duplicate = true;
        h.reactor.inject(a, Message::Subscribe(subscribe));

        let mut unsubscribe = UnsubscribeMessage::new(vec!["old/#".to_string()]);
        unsubscribe.message_id = 43;
        h.reactor.inject(a, Message::Unsubscribe(unsubscribe.clone()));
        unsubscribe.duplicate = true;
        h.reactor.inject(a, Message::Unsubscribe(unsubscribe));

        let sent = drain(&mut up_wire);
        assert_eq!(sent.len(), 2);
        assert!(matches!(sent[0], Message::Subscribe(_)));
        assert!(matches!(sent[1], Message::Unsubscribe(_)));
        h.reactor.inject(
            upstream,
            Message::SubAck(SubAckMessage {
                message_id: sent[0].message_id().unwrap(),
                granted_qos: vec![QoS::AtLeastOnce],
            }),
        );
        h.reactor.inject(upstream, Message::UnsubAck(sent[1].message_id().unwrap()));
        assert_eq!(
            drain(&mut a_wire),
            vec![
                Message::SubAck(SubAckMessage {
                    message_id: 42,
                    granted_qos: vec![QoS::AtLeastOnce]
                }),
                Message::UnsubAck(43),
            ]
        );
        assert_eq!(h.session(|s, _| s.in_flight_ids()), (0, 0));
    }

    #[test]
    fn test_upstream_id_held_between_pubrec_and_pubrel() {
        let mut h = Harness::new(false);
        let (a, mut a_wire) = h.downstream();
        h.attach(a);
        let (upstream, mut up_wire) = h.upstream();
        drain(&mut a_wire);

        h.reactor.inject(a, publish("exactly", QoS::ExactlyOnce, 7));
        let held_id = drain(&mut up_wire)[0].message_id().unwrap();
        h.reactor.inject(upstream, Message::PubRec(held_id));
        assert_eq!(drain(&mut a_wire), vec![Message::PubRec(7)]);

        // The cursor comes back round before the client releases.
        h.reactor.rewind_ids(upstream);
        h.reactor.inject(a, publish("next", QoS::AtLeastOnce, 8));
        let next_id = drain(&mut up_wire)[0].message_id().unwrap();
        assert_ne!(next_id, held_id);
        h.reactor.inject(upstream, Message::PubAck(next_id));
        assert_eq!(drain(&mut a_wire), vec![Message::PubAck(8)]);

        h.reactor.inject(a, Message::pub_rel(7));
        assert_eq!(drain(&mut up_wire), vec![Message::pub_rel(held_id)]);
        h.reactor.inject(upstream, Message::PubComp(held_id));
        assert_eq!(drain(&mut a_wire), vec![Message::PubComp(7)]);
        assert_eq!(h.session(|s, _| s.in_flight_ids()), (0, 0));
    }

    #[test]
    fn test_downstream_id_held_between_pubrec_and_pubrel() {
        let mut h = Harness::new(false);
        let (a, mut a_wire) = h.downstream();
        h.attach(a);
        let (upstream, mut up_wire) = h.upstream();
        drain(&mut a_wire);

        h.reactor.inject(upstream, publish("exactly", QoS::ExactlyOnce, 900));
        let held_id = drain(&mut a_wire)[0].message_id().unwrap();
        h.reactor.inject(a, Message::PubRec(held_id));
        assert_eq!(drain(&mut up_wire), vec![Message::PubRec(900)]);

        h.reactor.rewind_ids(a);
        h.reactor.inject(upstream, publish("next", QoS::AtLeastOnce, 901));
        let next_id = drain(&mut a_wire)[0].message_id().unwrap();
        assert_ne!(next_id, held_id);
        h.reactor.inject(a, Message::PubAck(next_id));
        assert_eq!(drain(&mut up_wire), vec![Message::PubAck(901)]);

        h.reactor.inject(upstream, Message::pub_rel(900));
        assert_eq!(drain(&mut a_wire), vec![Message::pub_rel(held_id)]);
        h.reactor.inject(a, Message::PubComp(held_id));
        assert_eq!(drain(&mut up_wire), vec![Message::PubComp(900)]);
        assert_eq!(h.session(|s, _| s.in_flight_ids()), (0, 0));
    }

    #[test]
    fn test_takeover_closes_previous_before_connack() {
        let mut h = Harness::new(false);
        let (a, mut a_wire) = h.downstream();
        h.attach(a);
        let (upstream, _up_wire) = h.upstream();
        drain(&mut a_wire);

        let (b, mut b_wire) = h.downstream();
        let accepted = h.session(|session, channels| {
            let accepted = session.new_connection(channels, b, ConnectMessage::new("x", false, 60));
            // Nothing has been flushed yet, yet the previous downstream is gone.
            assert_eq!(channels.state(a), None);
            assert_eq!(channels.queued_count(b), 1);
            accepted
        });
        assert!(accepted);
        h.reactor.run_once();

        assert!(a_wire.try_recv().is_err());
        assert_eq!(drain(&mut b_wire), vec![connack(true)]);
        assert_eq!(h.session(|s, _| s.downstream()), Some(b));

        h.reactor.inject(upstream, publish("after", QoS::AtMostOnce, 0));
        assert_eq!(topics(&drain(&mut b_wire)), vec!["after"]);
    }

    #[test]
    fn test_takeover_rehomes_unacknowledged_messages() {
        let mut h = Harness::new(false);
        let (a, mut a_wire) = h.downstream();
        h.attach(a);
        let (upstream, _up_wire) = h.upstream();
        drain(&mut a_wire);

        h.reactor.inject(upstream, publish("m1", QoS::AtLeastOnce, 11));
        h.reactor.inject(upstream, publish("m2", QoS::AtLeastOnce, 12));
        let first_ids: Vec<u16> = drain(&mut a_wire).iter().filter_map(Message::message_id).collect();

        let (b, mut b_wire) = h.downstream();
        h.attach(b);
        let replay = drain(&mut b_wire);
        assert_eq!(replay[0], connack(true));
        assert_eq!(topics(&replay[1..]), vec!["m1", "m2"]);
        for (message, id) in replay[1..].iter().zip(&first_ids) {
            assert!(message.is_duplicate());
            assert_eq!(message.message_id(), Some(*id));
        }
    }

    #[test]
    fn test_detached_messages_replayed_in_order() {
        let mut h = Harness::new(true);
        let (a, mut a_wire) = h.downstream();
        h.attach(a);
        let (upstream, mut up_wire) = h.upstream();
        drain(&mut a_wire);

        h.reactor.drop_connection(a);
        assert_eq!(h.session(|s, _| s.downstream()), None);

        h.reactor.inject(upstream, publish("h1", QoS::AtLeastOnce, 21));
        h.reactor.inject(upstream, publish("dropped", QoS::AtMostOnce, 0));
        h.reactor.inject(upstream, publish("h2", QoS::ExactlyOnce, 22));
        h.reactor.inject(upstream, publish("h1", QoS::AtLeastOnce, 21));
        assert_eq!(h.session(|s, _| s.held_count()), 2);
        // QoS 2 is answered upstream only once the client acknowledges.
        assert!(drain(&mut up_wire).is_empty());

        let (b, mut b_wire) = h.downstream();
        h.attach(b);
        let replay = drain(&mut b_wire);
        assert_eq!(replay[0], connack(true));
        assert_eq!(topics(&replay[1..]), vec!["h1", "h2"]);

        let id = replay[1].message_id().unwrap();
        h.reactor.inject(b, Message::PubAck(id));
        assert_eq!(drain(&mut up_wire), vec![Message::PubAck(21)]);
    }

    #[test]
    #[traced_test]
    fn test_upstream_loss_queues_and_replays() {
        let mut h = Harness::new(false);
        let (a, mut a_wire) = h.downstream();
        h.attach(a);
        let (upstream, mut up_wire) = h.upstream();
        drain(&mut a_wire);

        h.reactor.inject(a, publish("first", QoS::AtLeastOnce, 1));
        let first_upstream_id = drain(&mut up_wire)[0].message_id().unwrap();
        h.reactor.drop_connection(upstream);
        assert_eq!(h.session(|s, _| s.state()), SessionState::Reconnecting);
        assert!(logs_contain("upstream lost"));

        h.reactor.inject(a, publish("second", QoS::AtLeastOnce, 2));
        assert_eq!(h.reactor.pending_timers(), 1);
        h.reactor.fire_timers();

        let (upstream, mut up_wire) = h.upstream();
        let replay = drain(&mut up_wire);
        assert_eq!(topics(&replay), vec!["first", "second"]);
        assert!(replay[0].is_duplicate());
        assert_eq!(replay[0].message_id(), Some(first_upstream_id));

        let second_upstream_id = replay[1].message_id().unwrap();
        h.reactor.inject(upstream, Message::PubAck(first_upstream_id));
        h.reactor.inject(upstream, Message::PubAck(second_upstream_id));
        assert_eq!(drain(&mut a_wire), vec![Message::PubAck(1), Message::PubAck(2)]);
        assert_eq!(h.session(|s, _| s.state()), SessionState::Up);
    }

    #[test]
    fn test_closed_session_refuses_connections() {
        let mut h = Harness::new(false);
        let (a, _a_wire) = h.downstream();
        h.attach(a);
        let (upstream, mut up_wire) = h.upstream();
        let (b, _b_wire) = h.downstream();

        let accepted = h.session(|session, channels| {
            session.shutdown(channels);
            assert!(session.is_closed());
            session.new_connection(channels, b, ConnectMessage::new("x", false, 60))
        });
        assert!(!accepted);
        assert_eq!(h.reactor.channels().handler_of(b), Some(h.sink));

        h.reactor.run_once();
        assert_eq!(drain(&mut up_wire), vec![Message::Disconnect]);
        assert_eq!(h.reactor.channels().state(upstream), None);
        assert!(!h.reactor.has_handler(h.session));
    }

    #[test]
    fn test_id_map_keeps_both_directions_consistent() {
        let mut map = IdMap::default();
        map.insert(1, 100);
        map.insert(2, 100);
        assert_eq!(map.upstream_of(1), None);
        assert_eq!(map.downstream_of(100), Some(2));
        assert_eq!(map.remove_by_upstream(100), Some(2));
        assert_eq!(map.len(), 0);
    }
}
