//! relaymq: an MQTT 3.1 proxy that multiplexes many short-lived client
//! connections onto one durable upstream session per client id.
//!
//! The protocol work lives in `relaymq-mqtt-v3`. This crate holds what the
//! daemon adds around it:
//!
//! * `config`: the TOML file (`[logger]` and `[proxy]`), located through
//!   `RELAYMQ_CONFIG`, plus the `print_*!` macros used before logging is up.
//! * `logger`: installs the `tracing` subscriber for console and journald.

pub mod config;
pub mod logger;
