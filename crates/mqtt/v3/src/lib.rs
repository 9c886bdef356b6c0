//! # relaymq-mqtt-v3: MQTT 3.1 client library and session-multiplexing proxy
//!
//! Everything in this crate runs on a [`ChannelManager`]: one worker thread
//! with its own single-threaded Tokio runtime that owns every socket, frames
//! MQTT packets, keeps QoS 1/2 messages in flight until acknowledged and
//! hands decoded messages to [`MessageHandler`]s. Three facets sit on top:
//!
//! - [`AsyncClient`]: pipelines publish/subscribe traffic and reports
//!   outcomes to an [`AsyncClientListener`]
//! - [`SyncClient`]: blocks the caller until the matching acknowledgment
//! - [`ProxyBroker`]: accepts many downstream clients and funnels each client
//!   id through one durable upstream session to a real broker
//!
//! # Quick Start
//!
//! ```ignore
//! use relaymq_mqtt_v3::{ClientConfig, ConnectOptions, MqttClientListener, PublishMessage, QoS, Subscription, SyncClient};
//!
//! struct Printer;
//!
//! impl MqttClientListener for Printer {
//!     fn publish_received(&mut self, message: PublishMessage) {
//!         println!("{} -> {:?}", message.topic, message.payload);
//!     }
//! }
//!
//! let client = SyncClient::new("tcp://localhost:1883", Printer, ClientConfig::default())?;
//! client.connect(ConnectOptions::new("sensor-17", true))?;
//! client.subscribe(vec![Subscription::new("commands/#", QoS::AtLeastOnce)])?;
//! client.publish(PublishMessage::new("sensors/kitchen", "21.5", QoS::ExactlyOnce))?;
//! client.disconnect()?;
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐  ┌─────────────┐  ┌──────────────────────────┐
//! │ SyncClient │─▶│ AsyncClient │  │ ProxyBroker              │
//! └────────────┘  └──────┬──────┘  │  └─ ProxySession (per id)│
//!                        │         └────────────┬─────────────┘
//!                        ▼ tasks                ▼
//!               ┌──────────────────────────────────────┐
//!               │ ChannelManager (worker thread)       │
//!               │  Reactor: handlers + Channels        │
//!               │  Channel: queue, in-flight, timers   │
//!               └──────────────────┬───────────────────┘
//!                                  ▼
//!                       MessageCodec over TCP
//! ```
//!
//! Handlers run only on the worker thread. Application threads reach them
//! by queueing closures through a [`ManagerHandle`]; the sync client adds a
//! [`BlockingCommand`] that the channel completes when the acknowledgment
//! arrives.
//!
//! # Reconnection
//!
//! A lost connection is handed to the client's [`ReconnectionStrategy`].
//! The default [`ProgressiveReconnectionStrategy`] waits
//! `base * factor^n` milliseconds, capped at the maximum:
//!
//! ```text
//! Attempt 1: 50 ms
//! Attempt 2: 250 ms
//! Attempt 3: 1.25 s
//! ...
//! Attempt 7+: 30 s (capped)
//! ```
//!
//! Messages that were queued or in flight are sent again, with DUP set and
//! their original ids, once the broker accepts the new connection.
//!
//! # Errors
//!
//! Every fallible call returns [`Result`]. Errors raised on the worker
//! thread and re-raised by a sync call arrive wrapped in
//! [`MqttError::Invocation`]; [`MqttError::root_cause`] unwraps them.

pub mod channel;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod handler;
pub mod manager;
pub mod message;
pub mod proxy;
pub mod reconnect;
pub mod state;
pub mod sync_client;

// Re-exports: Clients
pub use client::{AsyncClient, AsyncClientListener};
pub use sync_client::{MqttClientListener, SyncClient};
// Re-exports: Configuration
pub use config::{BrokerUri, ClientConfig, ConnectOptions, ProxyConfig};
pub use reconnect::{
    FixedReconnectionStrategy, NullReconnectStrategy, ProgressiveReconnectionStrategy, ReconnectionStrategy,
    DEFAULT_MAX_RECONNECTS,
};
// Re-exports: Error handling
pub use error::{MqttError, ProtocolError, Result, TimeoutKind};
// Re-exports: Wire model
pub use codec::MessageCodec;
pub use message::{
    ConnAckMessage, ConnectMessage, ConnectReturnCode, Message, MessageType, PublishMessage, QoS, SubAckMessage,
    SubscribeMessage, Subscription, UnsubscribeMessage, Will,
};
// Re-exports: Channels and the event loop
//
// Needed only by code that writes its own handlers.
pub use channel::{BlockingCommand, ChannelId, ChannelOptions, ChannelRole, ChannelState, CommandReceipt};
pub use handler::{ChannelEvent, HandlerId, MessageHandler};
pub use manager::{ChannelManager, Channels, ManagerHandle, Reactor};
// Re-exports: Proxy
pub use proxy::{ProxyBroker, ProxySession, SessionState};
// Re-exports: State monitoring
pub use state::ConnectionState;
