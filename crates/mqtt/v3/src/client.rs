//! Asynchronous MQTT 3.1 client.
//!
//! [`AsyncClient`] is a cheap handle used from any thread. Every call is
//! queued to the channel manager and returns immediately; outcomes arrive on
//! the [`AsyncClientListener`] supplied at construction, on the manager
//! thread.
//!
//! The protocol side lives in `ClientHandler`, the handler attached to the
//! client's channel. It:
//!
//! - answers QoS 1 publishes with PUBACK and QoS 2 publishes with PUBREC,
//!   holding a QoS 2 message until its PUBREL so it is delivered exactly once
//! - drives outbound QoS 2 through PUBREC → PUBREL → PUBCOMP
//! - turns SUBACK/UNSUBACK/PUBACK/PUBCOMP into listener callbacks
//! - on connection loss asks the [`ReconnectionStrategy`] for a delay,
//!   reconnects with the same [`ConnectOptions`], and replays every message
//!   that was not acknowledged (DUP set for those already written)
//!
//! Rejections other than SERVER_UNAVAILABLE, explicit `disconnect`/`close`
//! and manager shutdown are not retried.
//!
//! # Examples
//!
//! ```ignore
//! struct Printer;
//!
//! impl AsyncClientListener for Printer {
//!     fn publish_received(&mut self, message: PublishMessage) {
//!         println!("{}: {:?}", message.topic, message.payload);
//!     }
//! }
//!
//! let client = AsyncClient::new("tcp://localhost:1883", Printer, ClientConfig::default())?;
//! client.connect(ConnectOptions::new("sensor-7", true))?;
//! client.subscribe(vec![Subscription::new("alerts/#", QoS::AtLeastOnce)])?;
//! client.publish(PublishMessage::new("sensors/7", "21.5", QoS::AtLeastOnce))?;
//! ```

use std::{collections::HashMap, time::Duration};

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{
    channel::{BlockingCommand, ChannelId},
    config::{BrokerUri, ClientConfig, ConnectOptions},
    error::{MqttError, Result},
    handler::{ChannelEvent, HandlerId, MessageHandler},
    manager::{ChannelManager, Channels, ManagerHandle},
    message::{
        ConnectReturnCode, Message, PublishMessage, QoS, SubAckMessage, SubscribeMessage, Subscription,
        UnsubscribeMessage,
    },
    reconnect::ReconnectionStrategy,
    state::ConnectionState,
};

/// Receives the outcome of every client operation.
///
/// All methods run on the channel manager thread and must not block. Only
/// [`publish_received`](Self::publish_received) is required.
#[allow(unused_variables)]
pub trait AsyncClientListener: Send + 'static {
    /// The broker accepted CONNECT. Called again after every reconnect.
    fn connected(&mut self, return_code: ConnectReturnCode) {}

    /// The broker refused CONNECT with `return_code`.
    fn connect_failed(&mut self, return_code: ConnectReturnCode) {}

    /// SUBACK arrived. `all_granted` is true when every topic was granted the
    /// QoS requested for it.
    fn subscribed(&mut self, requested: &[Subscription], granted: &[Subscription], all_granted: bool) {}

    fn unsubscribed(&mut self, topics: &[String]) {}

    /// A QoS 1 or 2 publish completed its acknowledgment chain.
    fn published(&mut self, message: &PublishMessage) {}

    fn publish_received(&mut self, message: PublishMessage);

    /// The client gave up on a publish that was never acknowledged.
    fn not_published(&mut self, message: PublishMessage) {}

    /// The connection is gone. `cause` is `None` for a graceful close;
    /// `reconnecting` tells whether another attempt is scheduled.
    fn disconnected(&mut self, cause: Option<&MqttError>, reconnecting: bool) {}
}

/// Handle to an MQTT client driven by a channel manager.
pub struct AsyncClient {
    handle: ManagerHandle,
    handler: HandlerId,
    state_rx: watch::Receiver<ConnectionState>,
    manager: Option<ChannelManager>,
}

impl AsyncClient {
    /// Creates a client with its own channel manager thread.
    pub fn new(broker_uri: &str, listener: impl AsyncClientListener, config: ClientConfig) -> Result<Self> {
        let manager = ChannelManager::start("mqtt-client")?;
        let mut client = Self::with_manager(manager.handle(), broker_uri, listener, config)?;
        client.manager = Some(manager);
        Ok(client)
    }

    /// Creates a client on an existing manager, sharing its thread.
    pub fn with_manager(
        handle: ManagerHandle,
        broker_uri: &str,
        listener: impl AsyncClientListener,
        config: ClientConfig,
    ) -> Result<Self> {
        validator::Validate::validate(&config)?;
        let broker = BrokerUri::parse(broker_uri)?;
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected("not connected".to_string()));
        let handler = handle.register_handler_with(|id| {
            Box::new(ClientHandler::new(id, broker, config, Box::new(listener), state_tx))
        })?;
        Ok(Self {
            handle,
            handler,
            state_rx,
            manager: None,
        })
    }

    /// Opens the connection and sends CONNECT.
    pub fn connect(&self, options: ConnectOptions) -> Result<()> {
        self.submit(move |client, channels| client.connect(channels, options, None))
    }

    pub fn subscribe(&self, subscriptions: Vec<Subscription>) -> Result<()> {
        self.submit(move |client, channels| client.subscribe(channels, subscriptions, None))
    }

    pub fn unsubscribe(&self, topics: Vec<String>) -> Result<()> {
        self.submit(move |client, channels| client.unsubscribe(channels, topics, None))
    }

    pub fn publish(&self, message: PublishMessage) -> Result<()> {
        self.submit(move |client, channels| client.publish(channels, message, None))
    }

    /// Sends DISCONNECT and closes once it is written. No reconnect follows.
    pub fn disconnect(&self) -> Result<()> {
        self.submit(move |client, channels| client.disconnect(channels, None))
    }

    /// Closes the connection without DISCONNECT. No reconnect follows.
    pub fn close(&self) -> Result<()> {
        self.submit(move |client, channels| client.close(channels))
    }

    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state_rx.borrow().is_connected()
    }

    pub fn handler_id(&self) -> HandlerId {
        self.handler
    }

    /// Disconnects and, when this client owns its manager, stops it.
    ///
    /// Returns false if the manager did not stop within `timeout`.
    pub fn shutdown(mut self, timeout: Duration) -> bool {
        if let Err(err) = self.disconnect() {
            debug!("Disconnect during shutdown skipped: {}", err);
        }
        let handler = self.handler;
        let _ = self.handle.execute(move |reactor| {
            reactor.channels().retire_handler(handler);
        });
        match self.manager.take() {
            Some(manager) => manager.shutdown(timeout),
            None => true,
        }
    }

    pub(crate) fn submit(
        &self,
        task: impl FnOnce(&mut ClientHandler, &mut Channels) + Send + 'static,
    ) -> Result<()> {
        self.handle.execute_on::<ClientHandler>(self.handler, task)
    }
}

/// Protocol state of one client, owned by the manager thread.
pub(crate) struct ClientHandler {
    id: HandlerId,
    broker: BrokerUri,
    config: ClientConfig,
    strategy: Box<dyn ReconnectionStrategy>,
    listener: Box<dyn AsyncClientListener>,
    state_tx: watch::Sender<ConnectionState>,
    options: Option<ConnectOptions>,
    channel: Option<ChannelId>,
    closing: bool,
    /// QoS 2 publishes received and answered with PUBREC, awaiting PUBREL.
    awaiting_release: HashMap<u16, PublishMessage>,
    /// Outbound QoS 2 publishes past PUBREC, awaiting PUBCOMP.
    awaiting_completion: HashMap<u16, PublishMessage>,
    /// Messages to replay on the next connection.
    backlog: Vec<(Message, Option<BlockingCommand>)>,
}

impl ClientHandler {
    fn new(
        id: HandlerId,
        broker: BrokerUri,
        config: ClientConfig,
        listener: Box<dyn AsyncClientListener>,
        state_tx: watch::Sender<ConnectionState>,
    ) -> Self {
        let strategy = config.take_strategy();
        Self {
            id,
            broker,
            config,
            strategy,
            listener,
            state_tx,
            options: None,
            channel: None,
            closing: false,
            awaiting_release: HashMap::new(),
            awaiting_completion: HashMap::new(),
            backlog: Vec::new(),
        }
    }

    fn client_id(&self) -> &str {
        self.options.as_ref().map_or("", |o| o.client_id.as_str())
    }

    fn update_state(&self, state: ConnectionState) {
        let changed = *self.state_tx.borrow() != state;
        if changed {
            info!("Client '{}' connection state changed to: {}", self.client_id(), state);
            self.state_tx.send_replace(state);
        }
    }

    pub(crate) fn connect(
        &mut self,
        channels: &mut Channels,
        options: ConnectOptions,
        completion: Option<BlockingCommand>,
    ) {
        if self.channel.is_some() {
            warn!("Client '{}' is already connected or connecting", self.client_id());
            if let Some(completion) = completion {
                completion.complete(Err(MqttError::InvalidArgument("client already connected".to_string())));
            }
            return;
        }
        if options.clean_session {
            self.awaiting_release.clear();
        }
        self.options = Some(options);
        self.closing = false;
        self.open(channels, completion);
    }

    /// Opens a channel, queues CONNECT and replays the backlog behind it.
    fn open(&mut self, channels: &mut Channels, completion: Option<BlockingCommand>) {
        let Some(options) = self.options.as_ref() else {
            return;
        };
        let keep_alive = u16::try_from(self.config.keep_alive_seconds()).unwrap_or(u16::MAX);
        let connect = options.to_connect(keep_alive);
        info!("Client '{}' connecting to {}", options.client_id, self.broker.address());

        let channel = channels.connect(self.broker.address(), self.config.channel_options(), self.id);
        self.channel = Some(channel);
        self.update_state(ConnectionState::Connecting);
        if let Err(err) = channels.send_with(channel, Message::Connect(connect), completion) {
            error!("Could not queue CONNECT on {}: {}", channel, err);
            return;
        }
        for (message, completion) in std::mem::take(&mut self.backlog) {
            if let Err(err) = channels.send_with(channel, message, completion) {
                warn!("Dropped replayed message on {}: {}", channel, err);
            }
        }
    }

    /// Timer callback after a reconnect delay.
    fn reconnect(&mut self, channels: &mut Channels) {
        if self.closing || self.channel.is_some() {
            return;
        }
        self.open(channels, None);
    }

    pub(crate) fn subscribe(
        &mut self,
        channels: &mut Channels,
        subscriptions: Vec<Subscription>,
        completion: Option<BlockingCommand>,
    ) {
        let message = Message::Subscribe(SubscribeMessage::new(subscriptions));
        self.send(channels, message, completion);
    }

    pub(crate) fn unsubscribe(
        &mut self,
        channels: &mut Channels,
        topics: Vec<String>,
        completion: Option<BlockingCommand>,
    ) {
        let message = Message::Unsubscribe(UnsubscribeMessage::new(topics));
        self.send(channels, message, completion);
    }

    pub(crate) fn publish(
        &mut self,
        channels: &mut Channels,
        mut message: PublishMessage,
        completion: Option<BlockingCommand>,
    ) {
        // Ids are assigned by the channel.
        message.message_id = 0;
        message.duplicate = false;
        self.send(channels, Message::Publish(message), completion);
    }

    fn send(&mut self, channels: &mut Channels, message: Message, completion: Option<BlockingCommand>) {
        if self.options.is_none() || self.closing {
            debug!("Client not connected, rejecting {}", message);
            if let Some(completion) = completion {
                completion.complete(Err(MqttError::NotConnected));
            }
            return;
        }
        match self.channel {
            Some(channel) => {
                if let Err(err) = channels.send_with(channel, message, completion) {
                    warn!("Client '{}' could not send: {}", self.client_id(), err);
                }
            }
            // Between connections: held until the reconnect timer fires.
            None => self.backlog.push((message, completion)),
        }
    }

    pub(crate) fn disconnect(&mut self, channels: &mut Channels, completion: Option<BlockingCommand>) {
        self.closing = true;
        match self.channel {
            Some(channel) if channels.is_open(channel) => {
                info!("Client '{}' disconnecting", self.client_id());
                if let Err(err) = channels.disconnect(channel, completion) {
                    warn!("DISCONNECT failed on {}: {}", channel, err);
                    channels.close(channel, None);
                }
            }
            Some(channel) => {
                channels.close(channel, None);
                if let Some(completion) = completion {
                    completion.complete(Ok(None));
                }
            }
            None => {
                self.give_up(None, Vec::new());
                if let Some(completion) = completion {
                    completion.complete(Ok(None));
                }
            }
        }
    }

    pub(crate) fn close(&mut self, channels: &mut Channels) {
        self.closing = true;
        match self.channel {
            Some(channel) => channels.close(channel, None),
            None => self.give_up(None, Vec::new()),
        }
    }

    fn on_message(&mut self, channels: &mut Channels, channel: ChannelId, message: Message) -> Result<()> {
        match message {
            Message::ConnAck(connack) if connack.return_code.is_accepted() => {
                info!("Client '{}' connected", self.client_id());
                self.strategy.connection_established();
                self.update_state(ConnectionState::Connected);
                self.listener.connected(connack.return_code);
            }
            Message::ConnAck(connack) => {
                warn!(
                    "Client '{}' connection rejected: {}",
                    self.client_id(),
                    connack.return_code
                );
                self.listener.connect_failed(connack.return_code);
            }
            Message::Publish(publish) => match publish.qos {
                QoS::AtMostOnce => self.listener.publish_received(publish),
                QoS::AtLeastOnce => {
                    channels.send(channel, Message::PubAck(publish.message_id))?;
                    self.listener.publish_received(publish);
                }
                QoS::ExactlyOnce => {
                    let id = publish.message_id;
                    if self.awaiting_release.contains_key(&id) {
                        debug!("Duplicate QoS 2 publish id={} on {}", id, channel);
                    } else {
                        self.awaiting_release.insert(id, publish);
                    }
                    channels.send(channel, Message::PubRec(id))?;
                }
            },
            Message::PubRel { message_id, .. } => {
                if let Some(publish) = self.awaiting_release.remove(&message_id) {
                    self.listener.publish_received(publish);
                }
                channels.send(channel, Message::PubComp(message_id))?;
            }
            Message::PubRec(id) => {
                // Duplicate PUBREC: our PUBREL may already be on its way.
                if let Err(err) = channels.send(channel, Message::pub_rel(id)) {
                    debug!("PUBREL id={} not re-sent: {}", id, err);
                }
            }
            other => debug!("Client ignoring {} on {}", other, channel),
        }
        Ok(())
    }

    fn on_acknowledged(&mut self, channels: &mut Channels, channel: ChannelId, ack: Message, original: Message) -> Result<()> {
        match (ack, original) {
            (Message::PubAck(_), Message::Publish(publish)) => self.listener.published(&publish),
            (Message::PubRec(id), Message::Publish(publish)) => {
                self.awaiting_completion.insert(id, publish);
                channels.send(channel, Message::pub_rel(id))?;
            }
            (Message::PubComp(id), Message::PubRel { .. }) => {
                if let Some(publish) = self.awaiting_completion.remove(&id) {
                    self.listener.published(&publish);
                }
            }
            (Message::SubAck(suback), Message::Subscribe(subscribe)) => {
                let (granted, all_granted) = granted_subscriptions(&subscribe.subscriptions, &suback);
                self.listener.subscribed(&subscribe.subscriptions, &granted, all_granted);
            }
            (Message::UnsubAck(_), Message::Unsubscribe(unsubscribe)) => {
                self.listener.unsubscribed(&unsubscribe.topics);
            }
            (ack, original) => debug!("Unpaired acknowledgment {} for {}", ack, original),
        }
        Ok(())
    }

    fn on_closed(&mut self, channels: &mut Channels, channel: ChannelId, cause: Option<MqttError>, undelivered: Vec<Message>) {
        if self.channel != Some(channel) {
            return;
        }
        self.channel = None;

        let retry = !self.closing && cause.as_ref().map_or(true, |cause| !is_fatal(cause));
        let delay = if retry {
            let client_id = self.client_id().to_string();
            self.strategy.connection_lost(&client_id, cause.as_ref())
        } else {
            None
        };

        let Some(delay) = delay else {
            self.give_up(cause, undelivered);
            return;
        };

        warn!(
            "Client '{}' lost connection ({}), reconnecting in {:.2} seconds",
            self.client_id(),
            cause.as_ref().map_or_else(|| "closed".to_string(), |c| c.to_string()),
            delay.as_secs_f64()
        );
        let replay = undelivered.into_iter().map(|message| (message, None));
        let queued = std::mem::take(&mut self.backlog);
        self.backlog = replay.chain(queued).collect();

        self.update_state(ConnectionState::Reconnecting(delay.as_secs_f64()));
        self.listener.disconnected(cause.as_ref(), true);
        let id = self.id;
        channels.schedule(delay, move |reactor| {
            reactor.with_handler(id, |client: &mut ClientHandler, channels| client.reconnect(channels));
        });
    }

    /// Final disconnect: reports everything still pending as not published.
    fn give_up(&mut self, cause: Option<MqttError>, undelivered: Vec<Message>) {
        let reason = cause
            .as_ref()
            .map_or_else(|| "disconnected".to_string(), |c| c.to_string());
        match &cause {
            None => info!("Client '{}' disconnected", self.client_id()),
            Some(cause) => error!("Client '{}' disconnected: {}", self.client_id(), cause),
        }
        self.update_state(ConnectionState::Disconnected(reason));
        self.listener.disconnected(cause.as_ref(), false);

        let backlog = std::mem::take(&mut self.backlog);
        let pending = undelivered
            .into_iter()
            .chain(backlog.into_iter().map(|(message, completion)| {
                if let Some(completion) = completion {
                    completion.cancel();
                }
                message
            }));
        for message in pending {
            match message {
                Message::Publish(publish) if publish.qos != QoS::AtMostOnce => self.listener.not_published(publish),
                Message::PubRel { message_id, .. } => {
                    if let Some(publish) = self.awaiting_completion.remove(&message_id) {
                        self.listener.not_published(publish);
                    }
                }
                _ => {}
            }
        }
        for (_, publish) in self.awaiting_completion.drain() {
            self.listener.not_published(publish);
        }
    }
}

impl MessageHandler for ClientHandler {
    fn handle(&mut self, channels: &mut Channels, channel: ChannelId, event: ChannelEvent) -> Result<()> {
        match event {
            ChannelEvent::Opened => {
                debug!("Client '{}' socket open on {}", self.client_id(), channel);
                Ok(())
            }
            ChannelEvent::Message(message) => self.on_message(channels, channel, message),
            ChannelEvent::Acknowledged { ack, original } => self.on_acknowledged(channels, channel, ack, original),
            ChannelEvent::Closed { cause, undelivered } => {
                self.on_closed(channels, channel, cause, undelivered);
                Ok(())
            }
            ChannelEvent::Attached | ChannelEvent::Detached => Ok(()),
        }
    }
}

/// Pairs requested topics with the QoS the broker granted for each.
fn granted_subscriptions(requested: &[Subscription], suback: &SubAckMessage) -> (Vec<Subscription>, bool) {
    let granted: Vec<Subscription> = requested
        .iter()
        .zip(suback.granted_qos.iter())
        .map(|(subscription, qos)| Subscription::new(subscription.topic.clone(), *qos))
        .collect();
    let all_granted = granted.len() == requested.len()
        && requested.iter().zip(granted.iter()).all(|(r, g)| r.qos == g.qos);
    (granted, all_granted)
}

/// Causes after which reconnecting cannot help.
fn is_fatal(cause: &MqttError) -> bool {
    match cause.root_cause() {
        MqttError::RejectedConnection(code) => *code != ConnectReturnCode::ServerUnavailable,
        MqttError::ManagerStopped | MqttError::InvalidArgument(_) | MqttError::Config(_) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use proptest::prelude::*;
    use tokio::sync::mpsc;
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        manager::{testing::*, Reactor},
        message::{ConnAckMessage, ConnectMessage},
        reconnect::{FixedReconnectionStrategy, NullReconnectStrategy},
    };

    #[derive(Debug, Clone, PartialEq)]
    enum Seen {
        Connected(ConnectReturnCode),
        ConnectFailed(ConnectReturnCode),
        Subscribed(Vec<Subscription>, bool),
        Unsubscribed(Vec<String>),
        Published(String),
        Received(String),
        NotPublished(String),
        Disconnected(Option<String>, bool),
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<Seen>>>);

    impl Recorder {
        fn take(&self) -> Vec<Seen> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    impl AsyncClientListener for Recorder {
        fn connected(&mut self, code: ConnectReturnCode) {
            self.0.lock().unwrap().push(Seen::Connected(code));
        }
        fn connect_failed(&mut self, code: ConnectReturnCode) {
            self.0.lock().unwrap().push(Seen::ConnectFailed(code));
        }
        fn subscribed(&mut self, _requested: &[Subscription], granted: &[Subscription], all: bool) {
            self.0.lock().unwrap().push(Seen::Subscribed(granted.to_vec(), all));
        }
        fn unsubscribed(&mut self, topics: &[String]) {
            self.0.lock().unwrap().push(Seen::Unsubscribed(topics.to_vec()));
        }
        fn published(&mut self, message: &PublishMessage) {
            self.0.lock().unwrap().push(Seen::Published(message.topic.clone()));
        }
        fn publish_received(&mut self, message: PublishMessage) {
            self.0.lock().unwrap().push(Seen::Received(message.topic));
        }
        fn not_published(&mut self, message: PublishMessage) {
            self.0.lock().unwrap().push(Seen::NotPublished(message.topic));
        }
        fn disconnected(&mut self, cause: Option<&MqttError>, reconnecting: bool) {
            self.0
                .lock()
                .unwrap()
                .push(Seen::Disconnected(cause.map(|c| c.to_string()), reconnecting));
        }
    }

    struct Harness {
        reactor: Reactor,
        client: HandlerId,
        opened: mpsc::UnboundedReceiver<(ChannelId, mpsc::UnboundedReceiver<Message>)>,
        seen: Recorder,
        state: watch::Receiver<ConnectionState>,
    }

    impl Harness {
        fn new(strategy: Box<dyn ReconnectionStrategy>) -> Self {
            let mut reactor = reactor();
            let opened = reactor.connect_in_memory();
            let seen = Recorder::default();
            let mut config = ClientConfig::default();
            config.set_reconnection_strategy(Some(strategy)).unwrap();
            let (state_tx, state) = watch::channel(ConnectionState::Disconnected(String::new()));
            let broker = BrokerUri::parse("tcp://broker:1883").unwrap();
            let listener = seen.clone();
            let client = reactor.register_with(|id| {
                Box::new(ClientHandler::new(id, broker, config, Box::new(listener), state_tx))
            });
            Self {
                reactor,
                client,
                opened,
                seen,
                state,
            }
        }

        fn run(&mut self, task: impl FnOnce(&mut ClientHandler, &mut Channels)) {
            self.reactor.with_handler(self.client, task).unwrap();
            self.reactor.run_once();
        }

        /// Connects and completes the handshake; returns the channel and its wire.
        fn connect(&mut self) -> (ChannelId, mpsc::UnboundedReceiver<Message>) {
            self.run(|client, channels| client.connect(channels, ConnectOptions::new("c1", false), None));
            let (channel, mut wire) = self.opened.try_recv().unwrap();
            assert!(matches!(drain(&mut wire).as_slice(), [Message::Connect(_)]));
            self.accept(channel);
            (channel, wire)
        }

        fn reconnect(&mut self) -> (ChannelId, mpsc::UnboundedReceiver<Message>) {
            self.reactor.fire_timers();
            let (channel, mut wire) = self.opened.try_recv().unwrap();
            assert!(matches!(drain(&mut wire).as_slice(), [Message::Connect(_)]));
            self.accept(channel);
            (channel, wire)
        }

        fn accept(&mut self, channel: ChannelId) {
            self.reactor.inject(
                channel,
                Message::ConnAck(ConnAckMessage {
                    return_code: ConnectReturnCode::Accepted,
                }),
            );
        }
    }

    fn publish(topic: &str, qos: QoS) -> PublishMessage {
        PublishMessage::new(topic, "payload", qos)
    }

    fn incoming(topic: &str, qos: QoS, id: u16) -> Message {
        let mut message = publish(topic, qos);
        message.message_id = id;
        Message::Publish(message)
    }

    #[test]
    fn test_connect_reports_connected() {
        let mut h = Harness::new(Box::new(NullReconnectStrategy));
        let _ = h.connect();
        assert_eq!(h.seen.take(), vec![Seen::Connected(ConnectReturnCode::Accepted)]);
        assert_eq!(*h.state.borrow(), ConnectionState::Connected);
    }

    #[test]
    fn test_rejected_connack_reports_failure_and_disconnect() {
        let mut h = Harness::new(Box::new(FixedReconnectionStrategy::new(Duration::from_millis(1), 5)));
        h.run(|client, channels| client.connect(channels, ConnectOptions::new("c1", true), None));
        let (channel, _wire) = h.opened.try_recv().unwrap();
        h.reactor.inject(
            channel,
            Message::ConnAck(ConnAckMessage {
                return_code: ConnectReturnCode::IdentifierRejected,
            }),
        );
        let seen = h.seen.take();
        assert_eq!(seen[0], Seen::ConnectFailed(ConnectReturnCode::IdentifierRejected));
        assert_eq!(
            seen[1],
            Seen::Disconnected(
                Some(MqttError::RejectedConnection(ConnectReturnCode::IdentifierRejected).to_string()),
                false
            )
        );
        assert_eq!(h.reactor.channels().state(channel), None);
        assert_eq!(h.reactor.pending_timers(), 0);
    }

    #[test]
    fn test_qos1_publish_notifies_once_despite_retransmits() {
        let mut h = Harness::new(Box::new(NullReconnectStrategy));
        let (channel, mut wire) = h.connect();
        h.seen.take();

        h.run(|client, channels| client.publish(channels, publish("t", QoS::AtLeastOnce), None));
        let sent = drain(&mut wire);
        assert_eq!(sent.len(), 1);
        let id = sent[0].message_id().unwrap();

        h.reactor.inject(channel, Message::PubAck(id));
        h.reactor.inject(channel, Message::PubAck(id));
        assert_eq!(h.seen.take(), vec![Seen::Published("t".into())]);
    }

    #[test]
    fn test_qos2_outbound_chain() {
        let mut h = Harness::new(Box::new(NullReconnectStrategy));
        let (channel, mut wire) = h.connect();
        h.seen.take();

        h.run(|client, channels| client.publish(channels, publish("q2", QoS::ExactlyOnce), None));
        let id = drain(&mut wire)[0].message_id().unwrap();
        h.reactor.inject(channel, Message::PubRec(id));
        assert_eq!(drain(&mut wire), vec![Message::pub_rel(id)]);
        assert!(h.seen.take().is_empty());

        h.reactor.inject(channel, Message::PubComp(id));
        assert_eq!(h.seen.take(), vec![Seen::Published("q2".into())]);
    }

    #[test]
    fn test_qos2_inbound_delivered_once_on_pubrel() {
        let mut h = Harness::new(Box::new(NullReconnectStrategy));
        let (channel, mut wire) = h.connect();
        h.seen.take();

        h.reactor.inject(channel, incoming("in", QoS::ExactlyOnce, 7));
        h.reactor.inject(channel, incoming("in", QoS::ExactlyOnce, 7));
        assert!(h.seen.take().is_empty());
        assert_eq!(drain(&mut wire), vec![Message::PubRec(7), Message::PubRec(7)]);

        h.reactor.inject(channel, Message::pub_rel(7));
        h.reactor.inject(channel, Message::pub_rel(7));
        assert_eq!(h.seen.take(), vec![Seen::Received("in".into())]);
        assert_eq!(drain(&mut wire), vec![Message::PubComp(7), Message::PubComp(7)]);
    }

    #[test]
    fn test_qos1_inbound_acked() {
        let mut h = Harness::new(Box::new(NullReconnectStrategy));
        let (channel, mut wire) = h.connect();
        h.seen.take();
        h.reactor.inject(channel, incoming("in", QoS::AtLeastOnce, 3));
        assert_eq!(drain(&mut wire), vec![Message::PubAck(3)]);
        assert_eq!(h.seen.take(), vec![Seen::Received("in".into())]);
    }

    #[test]
    fn test_subscribe_and_unsubscribe_callbacks() {
        let mut h = Harness::new(Box::new(NullReconnectStrategy));
        let (channel, mut wire) = h.connect();
        h.seen.take();

        let subscriptions = vec![Subscription::new("a", QoS::ExactlyOnce), Subscription::new("b", QoS::AtMostOnce)];
        h.run(move |client, channels| client.subscribe(channels, subscriptions, None));
        let id = drain(&mut wire)[0].message_id().unwrap();
        h.reactor.inject(
            channel,
            Message::SubAck(SubAckMessage {
                message_id: id,
                granted_qos: vec![QoS::AtLeastOnce, QoS::AtMostOnce],
            }),
        );
        assert_eq!(
            h.seen.take(),
            vec![Seen::Subscribed(
                vec![Subscription::new("a", QoS::AtLeastOnce), Subscription::new("b", QoS::AtMostOnce)],
                false
            )]
        );

        h.run(|client, channels| client.unsubscribe(channels, vec!["a".into()], None));
        let id = drain(&mut wire)[0].message_id().unwrap();
        h.reactor.inject(channel, Message::UnsubAck(id));
        assert_eq!(h.seen.take(), vec![Seen::Unsubscribed(vec!["a".into()])]);
    }

    #[test]
    #[traced_test]
    fn test_reconnect_replays_in_flight_with_dup() {
        let mut h = Harness::new(Box::new(FixedReconnectionStrategy::new(Duration::from_millis(10), 3)));
        let (channel, mut wire) = h.connect();
        h.seen.take();

        h.run(|client, channels| client.publish(channels, publish("one", QoS::AtLeastOnce), None));
        h.run(|client, channels| client.publish(channels, publish("two", QoS::AtLeastOnce), None));
        let ids: Vec<u16> = drain(&mut wire).iter().filter_map(Message::message_id).collect();

        h.reactor.drop_connection(channel);
        assert_eq!(
            h.seen.take(),
            vec![Seen::Disconnected(Some(MqttError::ConnectionClosed.to_string()), true)]
        );
        assert_eq!(*h.state.borrow(), ConnectionState::Reconnecting(0.01));
        assert!(logs_contain("reconnecting in 0.01 seconds"));

        // Sent while no connection exists: queued behind the replay.
        h.run(|client, channels| client.publish(channels, publish("three", QoS::AtMostOnce), None));

        let (channel, mut wire) = h.reconnect();
        let replayed = drain(&mut wire);
        assert_eq!(replayed.len(), 3);
        for (message, id) in replayed.iter().zip(&ids) {
            assert!(message.is_duplicate());
            assert_eq!(message.message_id(), Some(*id));
        }
        assert!(matches!(&replayed[2], Message::Publish(p) if p.topic == "three"));

        h.reactor.inject(channel, Message::PubAck(ids[0]));
        h.reactor.inject(channel, Message::PubAck(ids[1]));
        assert_eq!(
            h.seen.take(),
            vec![
                Seen::Connected(ConnectReturnCode::Accepted),
                Seen::Published("one".into()),
                Seen::Published("two".into())
            ]
        );
    }

    #[test]
    fn test_give_up_reports_not_published() {
        let mut h = Harness::new(Box::new(NullReconnectStrategy));
        let (channel, mut wire) = h.connect();
        h.seen.take();
        h.run(|client, channels| client.publish(channels, publish("lost", QoS::AtLeastOnce), None));
        drain(&mut wire);

        h.reactor.drop_connection(channel);
        assert_eq!(
            h.seen.take(),
            vec![
                Seen::Disconnected(Some(MqttError::ConnectionClosed.to_string()), false),
                Seen::NotPublished("lost".into())
            ]
        );
        assert!(matches!(*h.state.borrow(), ConnectionState::Disconnected(_)));
    }

    #[test]
    fn test_disconnect_is_graceful_and_final() {
        let mut h = Harness::new(Box::new(FixedReconnectionStrategy::new(Duration::from_millis(10), 3)));
        let (_channel, mut wire) = h.connect();
        h.seen.take();
        h.run(|client, channels| client.disconnect(channels, None));
        assert_eq!(drain(&mut wire), vec![Message::Disconnect]);
        assert_eq!(h.seen.take(), vec![Seen::Disconnected(None, false)]);
        assert_eq!(h.reactor.pending_timers(), 0);

        let (command, receipt) = BlockingCommand::new();
        h.run(move |client, channels| client.publish(channels, publish("late", QoS::AtMostOnce), Some(command)));
        assert!(matches!(receipt.wait(Some(Duration::from_millis(10))), Err(MqttError::NotConnected)));
    }

    #[test]
    fn test_fatal_causes() {
        assert!(is_fatal(&MqttError::RejectedConnection(ConnectReturnCode::NotAuthorized)));
        assert!(!is_fatal(&MqttError::RejectedConnection(ConnectReturnCode::ServerUnavailable)));
        assert!(!is_fatal(&MqttError::ConnectionClosed));
        assert!(is_fatal(&MqttError::invocation("connect", MqttError::ManagerStopped)));
    }

    #[test]
    fn test_connect_message_carries_options() {
        let options = ConnectOptions::new("id", false).with_credentials("u", "p");
        let connect: ConnectMessage = options.to_connect(60);
        assert_eq!(connect.client_id, "id");
        assert!(!connect.clean_session);
        assert_eq!(connect.keep_alive_seconds, 60);
        assert_eq!(connect.username.as_deref(), Some("u"));
    }

    proptest! {
        #[test]
        fn test_duplicate_pubacks_publish_once(copies in 1usize..6) {
            let mut h = Harness::new(Box::new(NullReconnectStrategy));
            let (channel, mut wire) = h.connect();
            h.seen.take();

            h.run(|client, channels| client.publish(channels, publish("t", QoS::AtLeastOnce), None));
            let id = drain(&mut wire)[0].message_id().unwrap();
            for _ in 0..copies {
                h.reactor.inject(channel, Message::PubAck(id));
            }
            prop_assert_eq!(h.seen.take(), vec![Seen::Published("t".into())]);
        }

        #[test]
        fn test_duplicated_qos2_handshake_publishes_once(
            recs in 1usize..4,
            comps in 1usize..4,
            late_recs in 0usize..3,
            late_comps in 0usize..3,
        ) {
            let mut h = Harness::new(Box::new(NullReconnectStrategy));
            let (channel, mut wire) = h.connect();
            h.seen.take();

            h.run(|client, channels| client.publish(channels, publish("q2", QoS::ExactlyOnce), None));
            let id = drain(&mut wire)[0].message_id().unwrap();
            let replies = std::iter::repeat(Message::PubRec(id))
                .take(recs)
                .chain(std::iter::repeat(Message::PubComp(id)).take(comps))
                .chain(std::iter::repeat(Message::PubRec(id)).take(late_recs))
                .chain(std::iter::repeat(Message::PubComp(id)).take(late_comps));
            for reply in replies {
                h.reactor.inject(channel, reply);
            }
            prop_assert_eq!(h.seen.take(), vec![Seen::Published("q2".into())]);
            prop_assert!(drain(&mut wire).iter().all(|m| *m == Message::pub_rel(id)));
        }

        #[test]
        fn test_duplicated_qos2_delivery_received_once(id in 1u16..=u16::MAX, publishes in 1usize..5, releases in 1usize..5) {
            let mut h = Harness::new(Box::new(NullReconnectStrategy));
            let (channel, mut wire) = h.connect();
            h.seen.take();

            for n in 0..publishes {
                let mut message = incoming("in", QoS::ExactlyOnce, id);
                if let Message::Publish(publish) = &mut message {
                    publish.duplicate = n > 0;
                }
                h.reactor.inject(channel, message);
            }
            prop_assert!(h.seen.take().is_empty());
            for _ in 0..releases {
                h.reactor.inject(channel, Message::pub_rel(id));
            }
            prop_assert_eq!(h.seen.take(), vec![Seen::Received("in".into())]);

            let replies = drain(&mut wire);
            prop_assert_eq!(replies.iter().filter(|m| **m == Message::PubRec(id)).count(), publishes);
            prop_assert_eq!(replies.iter().filter(|m| **m == Message::PubComp(id)).count(), releases);
        }
    }
}
