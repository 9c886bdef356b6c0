//! Error handling for the MQTT channel core, clients and proxy.
//!
//! This module defines `MqttError`, the single error type returned across the
//! crate. Variants map onto the failure taxonomy the channel layer reacts to:
//!
//! **Channel-closing errors** (raised on the manager thread):
//! - `Io`: socket-level failure
//! - `Protocol`: malformed frame, unexpected message for the channel state
//! - `Timeout`: connect timeout, keep-alive read timeout
//! - `RejectedConnection`: CONNACK with a return code other than ACCEPTED
//! - `SessionTakenOver`: a proxy downstream evicted by a newer CONNECT
//!
//! **Caller-facing errors**:
//! - `Cancelled`: a blocking command was completed because its channel closed
//! - `InvalidArgument`: a configuration value was rejected at set-time
//! - `Invocation`: a worker-thread error re-raised on the calling thread
//!
//! `MqttError` is `Clone` so that one close cause can be handed to the
//! attached handler, every cancelled blocking command and the user listener.
//!
//! # Usage
//!
//! ```ignore
//! match client.publish(message) {
//!     Ok(()) => println!("acknowledged"),
//!     Err(e) if e.is_timeout() => eprintln!("no ack within the blocking timeout"),
//!     Err(e) => eprintln!("publish failed: {} (root cause: {})", e, e.root_cause()),
//! }
//! ```

use std::{fmt, io, sync::Arc};

use thiserror::Error;

use crate::message::ConnectReturnCode;

/// The unified error type for channel, client and proxy operations.
#[derive(Debug, Clone, Error)]
pub enum MqttError {
    /// Socket-level failure. Closes the channel it occurred on.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// The peer violated the wire protocol or the channel state machine.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// An operation did not complete in time.
    #[error("Timed out: {0}")]
    Timeout(TimeoutKind),

    /// The broker answered CONNECT with a non-ACCEPTED return code.
    #[error("Connection rejected by broker: {0}")]
    RejectedConnection(ConnectReturnCode),

    /// A blocking command was terminated because its channel closed.
    #[error("Command cancelled: channel closed before acknowledgment")]
    Cancelled,

    /// A configuration or call argument was rejected.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A proxy downstream was replaced by a newer connection for the same client id.
    #[error("Session taken over by a new connection for the same client id")]
    SessionTakenOver,

    /// The peer closed the socket without sending DISCONNECT.
    #[error("Connection closed by peer")]
    ConnectionClosed,

    /// Every usable message id is currently in flight on the channel.
    #[error("No message id available: {0} ids in flight")]
    IdsExhausted(usize),

    /// The target channel does not exist (never opened or already reaped).
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    /// The client has no connection and has never been asked to connect.
    #[error("Client is not connected")]
    NotConnected,

    /// The channel manager thread is gone; commands can no longer be submitted.
    #[error("Channel manager stopped")]
    ManagerStopped,

    /// Loaded configuration failed validation.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An error raised on the channel manager thread and observed by a caller on
    /// another thread. `operation` names the call that was waiting.
    #[error("{operation} failed on the channel manager thread: {root_cause}")]
    Invocation {
        operation: &'static str,
        root_cause: Box<MqttError>,
    },
}

impl MqttError {
    /// Wraps an error observed on the manager thread for a caller waiting in `operation`.
    ///
    /// Already wrapped errors are re-labelled rather than nested twice.
    pub fn invocation(operation: &'static str, cause: MqttError) -> Self {
        let root_cause = match cause {
            MqttError::Invocation { root_cause, .. } => root_cause,
            other => Box::new(other),
        };
        MqttError::Invocation {
            operation,
            root_cause,
        }
    }

    /// Returns the innermost error, looking through `Invocation`.
    pub fn root_cause(&self) -> &MqttError {
        match self {
            MqttError::Invocation { root_cause, .. } => root_cause.root_cause(),
            other => other,
        }
    }

    /// True when the root cause is a cancelled blocking command.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root_cause(), MqttError::Cancelled)
    }

    /// True when the root cause is any timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self.root_cause(), MqttError::Timeout(_))
    }

    /// Return code carried by a rejected connection, if that is the root cause.
    pub fn rejected_code(&self) -> Option<ConnectReturnCode> {
        match self.root_cause() {
            MqttError::RejectedConnection(code) => Some(*code),
            _ => None,
        }
    }
}

impl From<io::Error> for MqttError {
    fn from(err: io::Error) -> Self {
        MqttError::Io(Arc::new(err))
    }
}

impl From<validator::ValidationErrors> for MqttError {
    fn from(err: validator::ValidationErrors) -> Self {
        MqttError::Config(err.to_string())
    }
}

/// Violations of the MQTT wire format or of the channel state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Remaining length needs a 5th varint byte.
    #[error("malformed frame: remaining length exceeds 4 bytes")]
    RemainingLengthOverflow,

    /// Declared body is larger than the configured ceiling.
    #[error("malformed frame: declared length {declared} exceeds maximum {max}")]
    FrameTooLarge { declared: usize, max: usize },

    /// The body ended before a field it declares.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Upper nibble of the first byte is 0 or 15.
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    /// QoS bits set to 3.
    #[error("invalid QoS {0}")]
    InvalidQos(u8),

    /// A string field is not valid UTF-8.
    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    /// CONNACK return code outside 0..=5.
    #[error("invalid CONNACK return code {0}")]
    InvalidReturnCode(u8),

    /// A message arrived that the channel cannot accept in its current state.
    #[error("unexpected {kind} in state {state}")]
    UnexpectedMessage {
        kind: &'static str,
        state: &'static str,
    },
}

/// Which deadline elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// CONNACK not received within the connect timeout.
    Connect,
    /// Nothing read for 1.5 times the keep-alive period.
    KeepAlive,
    /// A sync caller gave up waiting for its acknowledgment.
    BlockingCommand,
    /// The manager did not stop within the shutdown budget.
    Shutdown,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TimeoutKind::Connect => "no CONNACK within connect timeout",
            TimeoutKind::KeepAlive => "keep-alive expired without traffic",
            TimeoutKind::BlockingCommand => "blocking command not acknowledged",
            TimeoutKind::Shutdown => "shutdown did not complete",
        };
        f.write_str(text)
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MqttError>;
