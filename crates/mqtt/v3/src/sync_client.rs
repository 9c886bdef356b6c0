//! Blocking facade over [`AsyncClient`].
//!
//! Each call queues the operation with a [`BlockingCommand`] attached and
//! waits for the matching acknowledgment:
//!
//! | Call          | Returns after                     |
//! |---------------|-----------------------------------|
//! | `connect`     | CONNACK                           |
//! | `subscribe`   | SUBACK                            |
//! | `unsubscribe` | UNSUBACK                          |
//! | `publish`     | write (QoS 0), PUBACK, PUBCOMP    |
//! | `disconnect`  | DISCONNECT written                |
//!
//! The wait is bounded by `ClientConfig::blocking_timeout_seconds` (0 waits
//! forever). Errors raised on the manager thread come back wrapped in
//! [`MqttError::Invocation`] naming the call that observed them.
//!
//! Calls must not be made from inside a listener callback: those run on the
//! manager thread the call would be waiting for.

use std::time::Duration;

use crate::{
    channel::{BlockingCommand, CommandResult},
    client::{AsyncClient, AsyncClientListener, ClientHandler},
    config::{ClientConfig, ConnectOptions},
    error::{MqttError, Result},
    manager::{Channels, ManagerHandle},
    message::{ConnectReturnCode, Message, PublishMessage, Subscription},
    state::ConnectionState,
};

/// Callbacks for a [`SyncClient`]. Everything else is a return value.
#[allow(unused_variables)]
pub trait MqttClientListener: Send + 'static {
    fn publish_received(&mut self, message: PublishMessage);

    fn disconnected(&mut self, cause: Option<&MqttError>, reconnecting: bool) {}
}

struct SyncListener<L>(L);

impl<L: MqttClientListener> AsyncClientListener for SyncListener<L> {
    fn publish_received(&mut self, message: PublishMessage) {
        self.0.publish_received(message);
    }

    fn disconnected(&mut self, cause: Option<&MqttError>, reconnecting: bool) {
        self.0.disconnected(cause, reconnecting);
    }
}

pub struct SyncClient {
    client: AsyncClient,
    timeout: Option<Duration>,
}

impl SyncClient {
    pub fn new(broker_uri: &str, listener: impl MqttClientListener, config: ClientConfig) -> Result<Self> {
        let timeout = config.blocking_timeout();
        let client = AsyncClient::new(broker_uri, SyncListener(listener), config)?;
        Ok(Self { client, timeout })
    }

    pub fn with_manager(
        handle: ManagerHandle,
        broker_uri: &str,
        listener: impl MqttClientListener,
        config: ClientConfig,
    ) -> Result<Self> {
        let timeout = config.blocking_timeout();
        let client = AsyncClient::with_manager(handle, broker_uri, SyncListener(listener), config)?;
        Ok(Self { client, timeout })
    }

    /// Connects and returns the broker's return code.
    pub fn connect(&self, options: ConnectOptions) -> Result<ConnectReturnCode> {
        match self.call("connect", move |client, channels, command| {
            client.connect(channels, options, Some(command))
        })? {
            Some(Message::ConnAck(connack)) => Ok(connack.return_code),
            other => Err(unexpected_reply("connect", other)),
        }
    }

    /// Subscribes and returns the subscriptions as granted.
    pub fn subscribe(&self, subscriptions: Vec<Subscription>) -> Result<Vec<Subscription>> {
        let requested = subscriptions.clone();
        match self.call("subscribe", move |client, channels, command| {
            client.subscribe(channels, subscriptions, Some(command))
        })? {
            Some(Message::SubAck(suback)) => Ok(requested
                .into_iter()
                .zip(suback.granted_qos)
                .map(|(subscription, qos)| Subscription::new(subscription.topic, qos))
                .collect()),
            other => Err(unexpected_reply("subscribe", other)),
        }
    }

    pub fn unsubscribe(&self, topics: Vec<String>) -> Result<()> {
        self.call("unsubscribe", move |client, channels, command| {
            client.unsubscribe(channels, topics, Some(command))
        })
        .map(|_| ())
    }

    pub fn publish(&self, message: PublishMessage) -> Result<()> {
        self.call("publish", move |client, channels, command| {
            client.publish(channels, message, Some(command))
        })
        .map(|_| ())
    }

    pub fn disconnect(&self) -> Result<()> {
        self.call("disconnect", move |client, channels, command| {
            client.disconnect(channels, Some(command))
        })
        .map(|_| ())
    }

    pub fn close(&self) -> Result<()> {
        self.client.close()
    }

    pub fn state(&self) -> ConnectionState {
        self.client.state()
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    pub fn shutdown(self, timeout: Duration) -> bool {
        self.client.shutdown(timeout)
    }

    fn call(
        &self,
        operation: &'static str,
        task: impl FnOnce(&mut ClientHandler, &mut Channels, BlockingCommand) + Send + 'static,
    ) -> Result<Option<Message>> {
        let (command, receipt) = BlockingCommand::new();
        self.client
            .submit(move |client, channels| task(client, channels, command))
            .map_err(|err| MqttError::invocation(operation, err))?;
        let result: CommandResult = receipt.wait(self.timeout);
        result.map_err(|err| MqttError::invocation(operation, err))
    }
}

fn unexpected_reply(operation: &'static str, reply: Option<Message>) -> MqttError {
    let detail = reply.map_or_else(|| "no reply".to_string(), |m| m.to_string());
    MqttError::invocation(
        operation,
        MqttError::InvalidArgument(format!("unexpected acknowledgment: {detail}")),
    )
}
