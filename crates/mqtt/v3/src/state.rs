//! Observable connection state of an async client.
//!
//! The client publishes every transition on a `tokio::sync::watch` channel,
//! so application code can await changes or poll the latest value.
//!
//! ```text
//! Connecting ──CONNACK(accepted)──▶ Connected
//!     ▲                                 │ connection lost
//!     │ delay elapsed                   ▼
//! Reconnecting(secs) ◀──strategy──── (lost)
//!                                       │ strategy gives up / close()
//!                                       ▼
//!                               Disconnected(reason)
//! ```
//!
//! # Examples
//!
//! ```ignore
//! let mut states = client.subscribe_state();
//! while states.changed().await.is_ok() {
//!     println!("client is now {}", *states.borrow());
//! }
//! ```

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// CONNECT written or about to be; waiting for CONNACK.
    Connecting,

    /// CONNACK accepted. Publishes and subscriptions flow.
    Connected,

    /// Connection lost; the next attempt starts in this many seconds.
    Reconnecting(f64),

    /// Not connected and not retrying. Carries the reason.
    Disconnected(String),
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Reconnecting(_) => "Reconnecting",
            ConnectionState::Disconnected(_) => "Disconnected",
        }
    }

    pub fn details(&self) -> String {
        match self {
            ConnectionState::Connecting | ConnectionState::Connected => String::new(),
            ConnectionState::Reconnecting(seconds) => format!("in {seconds} seconds"),
            ConnectionState::Disconnected(reason) => reason.clone(),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Reconnecting(_))
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())?;
        let details = self.details();
        if !details.is_empty() {
            write!(f, " ({details})")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "Connected");
        assert_eq!(ConnectionState::Reconnecting(0.25).to_string(), "Reconnecting (in 0.25 seconds)");
        assert_eq!(
            ConnectionState::Disconnected("closed by peer".into()).to_string(),
            "Disconnected (closed by peer)"
        );
    }

    #[test]
    fn test_state_predicates() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(ConnectionState::Reconnecting(1.0).is_connecting());
        assert!(ConnectionState::Connecting.is_connecting());
        assert!(!ConnectionState::Disconnected(String::new()).is_connecting());
    }
}
