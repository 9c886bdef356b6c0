//! Session-multiplexing proxy.
//!
//! Downstream clients connect to the [`ProxyBroker`]; each client id is
//! served by one [`ProxySession`] holding a single durable connection to
//! the real broker. A client that reconnects with the same id takes the
//! session over, and the messages in flight to its previous connection are
//! delivered on the new one.
//!
//! ```text
//! client A ─┐                        ┌───────────────┐
//!           ├─▶ ProxyBroker ─route─▶ │ ProxySession  │ ──▶ real broker
//! client B ─┘   (client id map)      │ "x"  (1 up)   │
//!                                    └───────────────┘
//! ```

mod broker;
mod session;

pub use broker::ProxyBroker;
pub use session::{ProxySession, SessionState};
