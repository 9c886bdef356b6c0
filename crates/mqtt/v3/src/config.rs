//! Configuration for clients and the proxy broker.
//!
//! Two shapes live here:
//!
//! - [`ClientConfig`]: programmatic client settings. Setters take signed
//!   values and reject bad ones immediately with
//!   [`MqttError::InvalidArgument`], so a client is never built from a
//!   configuration that would misbehave at runtime.
//! - [`ProxyConfig`]: the proxy broker's settings. It is deserialized from
//!   TOML with `#[serde(default)]` and checked with `validator` at load time.
//!
//! # Examples
//!
//! ```ignore
//! let mut config = ClientConfig::default();
//! config.set_keep_alive_seconds(60)?;
//! config.set_message_resend_interval_seconds(10)?;
//! assert!(config.set_message_resend_interval_seconds(1).is_err());
//!
//! let proxy: ProxyConfig = toml::from_str(r#"
//!     broker_uri = "tcp://mqtt.example.com:1883"
//!     port = 1884
//! "#)?;
//! proxy.validate()?;
//! ```

use std::{net::SocketAddr, time::Duration};

use serde::{Deserialize, Serialize};
use url::Url;
use validator::{Validate, ValidationError};

use crate::{
    channel::{ChannelOptions, MAX_IDS_IN_FLIGHT},
    codec::MAX_REMAINING_LENGTH,
    error::{MqttError, Result},
    message::{ConnectMessage, QoS, Will},
    reconnect::{ProgressiveReconnectionStrategy, ReconnectionStrategy},
};

/// Smallest accepted message resend interval.
pub const MIN_RESEND_INTERVAL_SECONDS: u64 = 2;

/// Settings shared by the async and sync clients.
///
/// `Clone` is deep: the copy gets its own reconnection strategy with its own
/// retry counter.
#[derive(Debug, Clone, Validate)]
pub struct ClientConfig {
    blocking_timeout_seconds: u64,

    connect_timeout_seconds: u64,

    #[validate(range(max = 65535, message = "Keep alive must fit in 16 bits"))]
    keep_alive_seconds: u64,

    #[validate(range(min = 2, message = "Message resend interval must be at least 2 seconds"))]
    message_resend_interval_seconds: u64,

    reconnection_strategy: Box<dyn ReconnectionStrategy>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            blocking_timeout_seconds: 0,
            connect_timeout_seconds: 30,
            keep_alive_seconds: 300,
            message_resend_interval_seconds: 30,
            reconnection_strategy: Box::new(ProgressiveReconnectionStrategy::default()),
        }
    }
}

impl ClientConfig {
    /// Seconds a sync call waits for its acknowledgment. 0 waits forever.
    pub fn blocking_timeout_seconds(&self) -> u64 {
        self.blocking_timeout_seconds
    }

    /// The blocking timeout as a wait bound, `None` meaning no bound.
    pub fn blocking_timeout(&self) -> Option<Duration> {
        (self.blocking_timeout_seconds > 0).then(|| Duration::from_secs(self.blocking_timeout_seconds))
    }

    pub fn set_blocking_timeout_seconds(&mut self, seconds: i64) -> Result<()> {
        self.blocking_timeout_seconds = non_negative("blocking_timeout_seconds", seconds)?;
        Ok(())
    }

    pub fn connect_timeout_seconds(&self) -> u64 {
        self.connect_timeout_seconds
    }

    pub fn connect_timeout_millis(&self) -> u64 {
        self.connect_timeout_seconds * 1000
    }

    pub fn set_connect_timeout_seconds(&mut self, seconds: i64) -> Result<()> {
        self.connect_timeout_seconds = non_negative("connect_timeout_seconds", seconds)?;
        Ok(())
    }

    pub fn keep_alive_seconds(&self) -> u64 {
        self.keep_alive_seconds
    }

    pub fn set_keep_alive_seconds(&mut self, seconds: i64) -> Result<()> {
        let seconds = non_negative("keep_alive_seconds", seconds)?;
        if seconds > u64::from(u16::MAX) {
            return Err(MqttError::InvalidArgument(format!(
                "keep_alive_seconds must not exceed {}, got {seconds}",
                u16::MAX
            )));
        }
        self.keep_alive_seconds = seconds;
        Ok(())
    }

    pub fn message_resend_interval_seconds(&self) -> u64 {
        self.message_resend_interval_seconds
    }

    pub fn set_message_resend_interval_seconds(&mut self, seconds: i64) -> Result<()> {
        let seconds = non_negative("message_resend_interval_seconds", seconds)?;
        if seconds < MIN_RESEND_INTERVAL_SECONDS {
            return Err(MqttError::InvalidArgument(format!(
                "message_resend_interval_seconds must be at least {MIN_RESEND_INTERVAL_SECONDS}, got {seconds}"
            )));
        }
        self.message_resend_interval_seconds = seconds;
        Ok(())
    }

    pub fn reconnection_strategy(&self) -> &dyn ReconnectionStrategy {
        self.reconnection_strategy.as_ref()
    }

    pub fn reconnection_strategy_mut(&mut self) -> &mut dyn ReconnectionStrategy {
        self.reconnection_strategy.as_mut()
    }

    pub fn set_reconnection_strategy(&mut self, strategy: Option<Box<dyn ReconnectionStrategy>>) -> Result<()> {
        self.reconnection_strategy = strategy
            .ok_or_else(|| MqttError::InvalidArgument("reconnection_strategy must not be empty".to_string()))?;
        Ok(())
    }

    /// Deep copy of the strategy for a client to own.
    pub(crate) fn take_strategy(&self) -> Box<dyn ReconnectionStrategy> {
        self.reconnection_strategy.clone()
    }

    pub fn channel_options(&self) -> ChannelOptions {
        ChannelOptions {
            keep_alive: Duration::from_secs(self.keep_alive_seconds),
            resend_interval: Duration::from_secs(self.message_resend_interval_seconds),
            connect_timeout: Duration::from_secs(self.connect_timeout_seconds),
            ..ChannelOptions::default()
        }
    }
}

fn non_negative(field: &str, value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| MqttError::InvalidArgument(format!("{field} must not be negative, got {value}")))
}

/// Identity and credentials sent in CONNECT.
///
/// The async client keeps these to reconnect with the same identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub client_id: String,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub will: Option<Will>,
}

impl ConnectOptions {
    pub fn new(client_id: impl Into<String>, clean_session: bool) -> Self {
        Self {
            client_id: client_id.into(),
            clean_session,
            username: None,
            password: None,
            will: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_will(mut self, topic: impl Into<String>, message: impl Into<bytes::Bytes>, qos: QoS, retain: bool) -> Self {
        self.will = Some(Will {
            topic: topic.into(),
            message: message.into(),
            qos,
            retain,
        });
        self
    }

    pub(crate) fn to_connect(&self, keep_alive_seconds: u16) -> ConnectMessage {
        let mut connect = ConnectMessage::new(self.client_id.clone(), self.clean_session, keep_alive_seconds);
        connect.username = self.username.clone();
        connect.password = self.password.clone();
        connect.will = self.will.clone();
        connect
    }
}

/// A `tcp://host:port` broker address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerUri {
    pub host: String,
    pub port: u16,
}

impl BrokerUri {
    pub fn parse(uri: &str) -> Result<Self> {
        let url = Url::parse(uri).map_err(|e| MqttError::InvalidArgument(format!("invalid broker uri '{uri}': {e}")))?;
        if url.scheme() != "tcp" {
            return Err(MqttError::InvalidArgument(format!(
                "broker uri '{uri}' must use the tcp scheme"
            )));
        }
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| MqttError::InvalidArgument(format!("broker uri '{uri}' has no host")))?;
        let port = url
            .port()
            .ok_or_else(|| MqttError::InvalidArgument(format!("broker uri '{uri}' has no port")))?;
        Ok(Self {
            host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            port,
        })
    }

    /// `host:port` as accepted by `TcpStream::connect`.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

fn validate_broker_uri(uri: &str) -> std::result::Result<(), ValidationError> {
    BrokerUri::parse(uri)
        .map(|_| ())
        .map_err(|_| ValidationError::new("broker_uri").with_message("Broker URI must look like tcp://host:port".into()))
}

/// Settings for the session-multiplexing proxy broker.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ProxyConfig {
    /// Upstream broker, `tcp://host:port`.
    #[validate(custom(function = "validate_broker_uri"))]
    pub broker_uri: String,

    /// Address the proxy listens on.
    pub bind_address: String,

    /// Listen port. 0 picks any free port.
    pub port: u16,

    /// Messages in flight to the upstream broker per session; the rest queue.
    #[validate(range(min = 1, max = 65534, message = "Max in-flight broker messages must be between 1 and 65534"))]
    pub max_in_flight_broker_messages: usize,

    #[validate(range(max = 65535, message = "Keep alive must fit in 16 bits"))]
    pub keep_alive_seconds: u64,

    pub connect_timeout_seconds: u64,

    #[validate(range(min = 2, message = "Message resend interval must be at least 2 seconds"))]
    pub message_resend_interval_seconds: u64,

    #[validate(range(min = 64, max = 268435455, message = "Max message size must be between 64 and 268435455 bytes"))]
    pub max_message_size: usize,

    /// Drop QoS 0 publishes from upstream while no downstream is attached.
    pub drop_qos0_when_detached: bool,

    /// Held messages per session while no downstream is attached.
    #[validate(range(min = 1, message = "Max held messages must be at least 1"))]
    pub max_held_messages: usize,

    pub shutdown_timeout_millis: u64,

    #[validate(nested)]
    pub reconnect: ProgressiveReconnectionStrategy,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            broker_uri: "tcp://localhost:1883".to_string(),
            bind_address: "0.0.0.0".to_string(),
            port: 1883,
            max_in_flight_broker_messages: MAX_IDS_IN_FLIGHT,
            keep_alive_seconds: 300,
            connect_timeout_seconds: 30,
            message_resend_interval_seconds: 30,
            max_message_size: MAX_REMAINING_LENGTH,
            drop_qos0_when_detached: false,
            max_held_messages: 100_000,
            shutdown_timeout_millis: 5_000,
            reconnect: ProgressiveReconnectionStrategy::default(),
        }
    }
}

impl ProxyConfig {
    pub fn broker(&self) -> Result<BrokerUri> {
        BrokerUri::parse(&self.broker_uri)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let host = if self.bind_address.contains(':') {
            format!("[{}]:{}", self.bind_address, self.port)
        } else {
            format!("{}:{}", self.bind_address, self.port)
        };
        host.parse()
            .map_err(|e| MqttError::InvalidArgument(format!("invalid bind address '{}': {e}", self.bind_address)))
    }

    /// Options for the upstream channel of each session.
    pub fn upstream_options(&self) -> ChannelOptions {
        ChannelOptions {
            keep_alive: Duration::from_secs(self.keep_alive_seconds),
            resend_interval: Duration::from_secs(self.message_resend_interval_seconds),
            connect_timeout: Duration::from_secs(self.connect_timeout_seconds),
            max_in_flight: Some(self.max_in_flight_broker_messages),
            max_message_size: self.max_message_size,
        }
    }

    /// Options for accepted downstream channels. Keep-alive is replaced by
    /// the value each client sends in CONNECT.
    pub fn downstream_options(&self) -> ChannelOptions {
        ChannelOptions {
            keep_alive: Duration::from_secs(self.keep_alive_seconds),
            resend_interval: Duration::from_secs(self.message_resend_interval_seconds),
            connect_timeout: Duration::from_secs(self.connect_timeout_seconds),
            max_in_flight: None,
            max_message_size: self.max_message_size,
        }
    }
}
