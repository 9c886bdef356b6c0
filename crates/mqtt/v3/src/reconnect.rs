//! Reconnection policies consulted after a client connection is lost.
//!
//! The async client and each proxy session own one strategy. On every loss
//! the owner calls [`ReconnectionStrategy::connection_lost`]; a returned
//! delay schedules the next attempt, `None` gives up. A successful CONNACK
//! calls [`ReconnectionStrategy::connection_established`], which resets the
//! schedule.
//!
//! Strategies are only ever touched on the channel manager thread. They are
//! cloned deeply (see [`ReconnectionStrategy::clone_box`]) so a copied client
//! configuration never shares a retry counter with its source.
//!
//! # Progressive schedule
//!
//! ```text
//! delay[n] = min(base * factor^n, max)      n = 0, 1, 2, ...
//! ```
//!
//! With the defaults (base=50ms, factor=5, max=30s):
//! - Attempt 0: 50ms
//! - Attempt 1: 250ms
//! - Attempt 2: 1.25s
//! - Attempt 3: 6.25s
//! - Attempt 4+: 30s (capped)
//!
//! # Examples
//!
//! ```ignore
//! let mut strategy = ProgressiveReconnectionStrategy::default();
//! assert_eq!(strategy.connection_lost("id", None), Some(Duration::from_millis(50)));
//! assert_eq!(strategy.connection_lost("id", None), Some(Duration::from_millis(250)));
//! strategy.connection_established();
//! assert_eq!(strategy.current_retry(), 0);
//! ```

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::debug;
use validator::Validate;

use crate::error::MqttError;

/// Decides whether, and after how long, a lost connection is retried.
pub trait ReconnectionStrategy: Send + fmt::Debug {
    /// Called each time the connection for `client_id` is lost.
    ///
    /// `cause` is `None` for a graceful close. Returns the delay before the
    /// next attempt, or `None` to give up.
    fn connection_lost(&mut self, client_id: &str, cause: Option<&MqttError>) -> Option<Duration>;

    /// Called when a connection attempt is accepted by the broker.
    fn connection_established(&mut self);

    /// Retries attempted since the last established connection.
    fn current_retry(&self) -> u32;

    /// Deep copy, including retry counters.
    fn clone_box(&self) -> Box<dyn ReconnectionStrategy>;
}

impl Clone for Box<dyn ReconnectionStrategy> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Attempt limit of the progressive strategy unless configured otherwise.
pub const DEFAULT_MAX_RECONNECTS: u32 = i32::MAX as u32;

/// Exponentially growing delays, capped, with an optional attempt limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ProgressiveReconnectionStrategy {
    #[validate(range(min = 1, message = "base_reconnect_millis must be at least 1"))]
    pub base_reconnect_millis: u64,

    #[validate(range(min = 1, message = "max_reconnect_millis must be at least 1"))]
    pub max_reconnect_millis: u64,

    #[validate(range(min = 1, message = "progressive_factor must be at least 1"))]
    pub progressive_factor: u32,

    /// Defaults to [`DEFAULT_MAX_RECONNECTS`].
    pub max_number_of_reconnects: u32,

    #[serde(skip)]
    current_retry: u32,
}

impl ProgressiveReconnectionStrategy {
    pub fn new(base: Duration, max: Duration, factor: u32, max_number_of_reconnects: u32) -> Self {
        Self {
            base_reconnect_millis: base.as_millis() as u64,
            max_reconnect_millis: max.as_millis() as u64,
            progressive_factor: factor,
            max_number_of_reconnects,
            current_retry: 0,
        }
    }

    pub fn base_reconnect(&self) -> Duration {
        Duration::from_millis(self.base_reconnect_millis)
    }

    pub fn max_reconnect(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_millis)
    }

    /// Delay for attempt `n` without advancing the counter.
    pub fn delay_for(&self, n: u32) -> Duration {
        let growth = u64::from(self.progressive_factor).checked_pow(n).unwrap_or(u64::MAX);
        let millis = self
            .base_reconnect_millis
            .saturating_mul(growth)
            .min(self.max_reconnect_millis);
        Duration::from_millis(millis)
    }
}

impl Default for ProgressiveReconnectionStrategy {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(50),
            Duration::from_millis(30_000),
            5,
            DEFAULT_MAX_RECONNECTS,
        )
    }
}

impl ReconnectionStrategy for ProgressiveReconnectionStrategy {
    fn connection_lost(&mut self, client_id: &str, cause: Option<&MqttError>) -> Option<Duration> {
        if self.current_retry >= self.max_number_of_reconnects {
            debug!(
                "Client {} exhausted {} reconnect attempts (last cause: {:?})",
                client_id, self.max_number_of_reconnects, cause
            );
            return None;
        }
        let delay = self.delay_for(self.current_retry);
        self.current_retry += 1;
        Some(delay)
    }

    fn connection_established(&mut self) {
        self.current_retry = 0;
    }

    fn current_retry(&self) -> u32 {
        self.current_retry
    }

    fn clone_box(&self) -> Box<dyn ReconnectionStrategy> {
        Box::new(self.clone())
    }
}

/// The same delay every time, up to a fixed number of attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct FixedReconnectionStrategy {
    delay: Duration,
    max_number_of_reconnects: u32,
    current_retry: u32,
}

impl FixedReconnectionStrategy {
    pub fn new(delay: Duration, max_number_of_reconnects: u32) -> Self {
        Self {
            delay,
            max_number_of_reconnects,
            current_retry: 0,
        }
    }
}

impl ReconnectionStrategy for FixedReconnectionStrategy {
    fn connection_lost(&mut self, _client_id: &str, _cause: Option<&MqttError>) -> Option<Duration> {
        if self.current_retry >= self.max_number_of_reconnects {
            return None;
        }
        self.current_retry += 1;
        Some(self.delay)
    }

    fn connection_established(&mut self) {
        self.current_retry = 0;
    }

    fn current_retry(&self) -> u32 {
        self.current_retry
    }

    fn clone_box(&self) -> Box<dyn ReconnectionStrategy> {
        Box::new(self.clone())
    }
}

/// Never reconnects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NullReconnectStrategy;

impl ReconnectionStrategy for NullReconnectStrategy {
    fn connection_lost(&mut self, _client_id: &str, _cause: Option<&MqttError>) -> Option<Duration> {
        None
    }

    fn connection_established(&mut self) {}

    fn current_retry(&self) -> u32 {
        0
    }

    fn clone_box(&self) -> Box<dyn ReconnectionStrategy> {
        Box::new(*self)
    }
}
