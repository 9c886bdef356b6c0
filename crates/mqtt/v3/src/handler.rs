//! Dispatch target for channel events.
//!
//! Everything a channel observes reaches its attached handler through one
//! method, [`MessageHandler::handle`], with the event as a tagged
//! [`ChannelEvent`]. The async client, the proxy broker and each proxy
//! session implement this trait.

use std::{any::Any, fmt};

use crate::{channel::ChannelId, error::MqttError, manager::Channels, message::Message, Result};

/// Identifier of a handler registered with a channel manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub(crate) u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler-{}", self.0)
    }
}

/// Something that happened on a channel.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// The socket is connected (client role) or was accepted (server role).
    Opened,
    /// The channel was bound to this handler.
    Attached,
    /// The channel was unbound from this handler. The socket stays open.
    Detached,
    /// A frame arrived that the channel did not consume itself.
    Message(Message),
    /// An acknowledgment matched a message this end had in flight.
    Acknowledged { ack: Message, original: Message },
    /// The channel closed. `cause` is `None` for a graceful DISCONNECT.
    /// `undelivered` holds every message that was queued or in flight.
    Closed {
        cause: Option<MqttError>,
        undelivered: Vec<Message>,
    },
}

impl ChannelEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ChannelEvent::Opened => "opened",
            ChannelEvent::Attached => "attached",
            ChannelEvent::Detached => "detached",
            ChannelEvent::Message(_) => "message",
            ChannelEvent::Acknowledged { .. } => "acknowledged",
            ChannelEvent::Closed { .. } => "closed",
        }
    }
}

/// Receives events for every channel attached to it.
///
/// Called only on the channel manager thread. Returning an error closes the
/// channel the event belongs to with that error as the cause.
pub trait MessageHandler: Any + Send {
    fn handle(&mut self, channels: &mut Channels, channel: ChannelId, event: ChannelEvent) -> Result<()>;
}
