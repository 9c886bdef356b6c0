//! One MQTT connection as seen by the channel manager.
//!
//! A [`Channel`] owns everything about a single TCP endpoint that must only be
//! touched from the manager thread: the write queue, the in-flight map, the
//! message-id cursor, activity timestamps and pending blocking commands. The
//! socket itself is driven by a reader task and a writer task; the channel
//! only holds the sending half of the writer's queue.
//!
//! # State machine
//!
//! ```text
//! Disconnected ──CONNECT sent──▶ ConnectSent ──CONNACK(ACCEPTED)──▶ Open
//!      │                              │                              │
//!      └──────────────────────────────┴── error / DISCONNECT / close ─┴──▶ Closed
//! ```
//!
//! Server-role channels skip `ConnectSent`: they move to `Open` when they write
//! an accepting CONNACK.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    net::SocketAddr,
    sync::mpsc as std_mpsc,
    time::{Duration, Instant},
};

use indexmap::{IndexMap, IndexSet};
use tokio::{sync::mpsc, task::AbortHandle};
use tracing::{debug, warn};

use crate::{
    codec::MAX_REMAINING_LENGTH,
    error::{MqttError, ProtocolError, Result, TimeoutKind},
    handler::{ChannelEvent, HandlerId},
    message::{ConnectReturnCode, Message, MessageType, QoS},
};

/// Ids a channel may have outstanding at once before allocation fails.
pub const MAX_IDS_IN_FLIGHT: usize = 65_534;

/// Identifier of a channel within its manager. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub(crate) u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

/// Which side of the MQTT handshake this end plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    /// Opened with `connect`; sends CONNECT and PINGREQ.
    Client,
    /// Accepted from a listener; receives CONNECT and answers CONNACK.
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Created, handshake not yet started (OPENING).
    Disconnected,
    /// Client wrote CONNECT and waits for CONNACK.
    ConnectSent,
    Open,
    Closed,
}

impl ChannelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelState::Disconnected => "disconnected",
            ChannelState::ConnectSent => "connect_sent",
            ChannelState::Open => "open",
            ChannelState::Closed => "closed",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-channel timing and limits.
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Idle period after which a client sends PINGREQ. Zero disables keep-alive.
    pub keep_alive: Duration,
    /// Age at which an unacknowledged message is sent again with DUP set.
    pub resend_interval: Duration,
    /// Time a client channel may spend before OPEN. Zero disables it.
    pub connect_timeout: Duration,
    /// Ceiling on acknowledged messages in flight; excess waits in the write queue.
    pub max_in_flight: Option<usize>,
    /// Largest frame body accepted or produced.
    pub max_message_size: usize,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(300),
            resend_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
            max_in_flight: None,
            max_message_size: MAX_REMAINING_LENGTH,
        }
    }
}

/// Result delivered to a sync caller: the acknowledging message, if the
/// command has one.
pub type CommandResult = std::result::Result<Option<Message>, MqttError>;

/// One-shot completion for a caller blocked on another thread.
///
/// Dropping it without completing is observed by the waiter as a cancellation.
#[derive(Debug)]
pub struct BlockingCommand {
    tx: std_mpsc::SyncSender<CommandResult>,
}

/// Waiting side of a [`BlockingCommand`].
#[derive(Debug)]
pub struct CommandReceipt {
    rx: std_mpsc::Receiver<CommandResult>,
}

impl BlockingCommand {
    pub fn new() -> (Self, CommandReceipt) {
        let (tx, rx) = std_mpsc::sync_channel(1);
        (Self { tx }, CommandReceipt { rx })
    }

    pub fn complete(self, result: CommandResult) {
        // The waiter may have timed out already.
        let _ = self.tx.try_send(result);
    }

    pub fn cancel(self) {
        self.complete(Err(MqttError::Cancelled));
    }
}

impl CommandReceipt {
    /// Blocks until the command completes. `None` waits forever.
    pub fn wait(self, timeout: Option<Duration>) -> CommandResult {
        let received = match timeout {
            Some(timeout) => self.rx.recv_timeout(timeout).map_err(|err| match err {
                std_mpsc::RecvTimeoutError::Timeout => MqttError::Timeout(TimeoutKind::BlockingCommand),
                std_mpsc::RecvTimeoutError::Disconnected => MqttError::Cancelled,
            }),
            None => self.rx.recv().map_err(|_| MqttError::Cancelled),
        };
        received?
    }
}

/// What the manager must do with a frame after the channel has seen it.
#[derive(Debug)]
pub(crate) enum Receipt {
    /// Hand the event to the attached handler.
    Dispatch(ChannelEvent),
    /// Fully handled by the channel.
    Consumed,
    /// Peer sent DISCONNECT.
    Disconnected,
    /// CONNACK refused the connection: dispatch it, then close.
    Rejected(ChannelEvent, ConnectReturnCode),
}

#[derive(Debug)]
struct Outbound {
    message: Message,
    completion: Option<BlockingCommand>,
}

#[derive(Debug)]
struct InFlight {
    message: Message,
    sent_at: Instant,
    completion: Option<BlockingCommand>,
}

#[derive(Debug)]
pub(crate) struct Channel {
    id: ChannelId,
    role: ChannelRole,
    state: ChannelState,
    options: ChannelOptions,
    peer: Option<SocketAddr>,
    handler: Option<HandlerId>,
    writer: Option<mpsc::UnboundedSender<Message>>,
    reader: Option<AbortHandle>,
    write_queue: VecDeque<Outbound>,
    in_flight: IndexMap<u16, InFlight>,
    /// PUBRECs we sent, kept until the peer's PUBREL.
    awaiting_release: IndexMap<u16, InFlight>,
    /// Completions of QoS 2 publishes between PUBREC and our PUBREL.
    handover: HashMap<u16, BlockingCommand>,
    /// Ids the peer has PUBREC'd that stay reserved until our PUBREL is queued.
    released: IndexSet<u16>,
    connect_completion: Option<BlockingCommand>,
    connect_received: bool,
    next_id: u16,
    created_at: Instant,
    last_read: Instant,
    last_write: Instant,
    deadline: Option<Instant>,
}

impl Channel {
    pub(crate) fn new(id: ChannelId, role: ChannelRole, options: ChannelOptions, now: Instant) -> Self {
        let mut channel = Self {
            id,
            role,
            state: ChannelState::Disconnected,
            options,
            peer: None,
            handler: None,
            writer: None,
            reader: None,
            write_queue: VecDeque::new(),
            in_flight: IndexMap::new(),
            awaiting_release: IndexMap::new(),
            handover: HashMap::new(),
            released: IndexSet::new(),
            connect_completion: None,
            connect_received: false,
            next_id: 1,
            created_at: now,
            last_read: now,
            last_write: now,
            deadline: None,
        };
        if role == ChannelRole::Client && !channel.options.connect_timeout.is_zero() {
            channel.deadline = Some(now + channel.options.connect_timeout);
        }
        channel
    }

    pub(crate) fn id(&self) -> ChannelId {
        self.id
    }

    pub(crate) fn role(&self) -> ChannelRole {
        self.role
    }

    pub(crate) fn state(&self) -> ChannelState {
        self.state
    }

    pub(crate) fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub(crate) fn handler(&self) -> Option<HandlerId> {
        self.handler
    }

    pub(crate) fn set_handler(&mut self, handler: Option<HandlerId>) -> Option<HandlerId> {
        std::mem::replace(&mut self.handler, handler)
    }

    pub(crate) fn options(&self) -> &ChannelOptions {
        &self.options
    }

    /// Points the id cursor back at 1.
    #[cfg(test)]
    pub(crate) fn rewind_ids(&mut self) {
        self.next_id = 1;
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.writer.is_some()
    }

    pub(crate) fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub(crate) fn queued_count(&self) -> usize {
        self.write_queue.len()
    }

    pub(crate) fn in_flight_ids(&self) -> impl Iterator<Item = u16> + '_ {
        self.in_flight.keys().copied()
    }

    /// Binds the socket halves once the connection exists.
    pub(crate) fn attach_io(
        &mut self,
        writer: mpsc::UnboundedSender<Message>,
        reader: Option<AbortHandle>,
        peer: Option<SocketAddr>,
        now: Instant,
    ) {
        self.writer = Some(writer);
        self.reader = reader;
        self.peer = peer;
        self.last_read = now;
        self.last_write = now;
        self.lower_deadline(self.read_deadline());
    }

    /// Queues `message` for writing.
    ///
    /// Publishes, subscribes and unsubscribes with an unassigned id get one from
    /// the cursor. Returns the message id the message carries, if any.
    pub(crate) fn send(&mut self, mut message: Message, completion: Option<BlockingCommand>) -> Result<Option<u16>> {
        if self.state == ChannelState::Closed {
            if let Some(completion) = completion {
                completion.cancel();
            }
            return Err(MqttError::UnknownChannel(self.id.to_string()));
        }

        if message.needs_message_id() {
            match self.allocate_id() {
                Ok(id) => message.set_message_id(id),
                Err(err) => {
                    if let Some(completion) = completion {
                        completion.complete(Err(err.clone()));
                    }
                    return Err(err);
                }
            }
        } else if message.requires_ack() {
            if let Some(id) = message.message_id().filter(|id| self.id_pending(*id)) {
                let err = MqttError::InvalidArgument(format!("message id {id} already in flight on {}", self.id));
                if let Some(completion) = completion {
                    completion.complete(Err(err.clone()));
                }
                return Err(err);
            }
        }

        let message_id = message.message_id();
        let completion = match &message {
            Message::Connect(connect) => {
                self.options.keep_alive = Duration::from_secs(u64::from(connect.keep_alive_seconds));
                self.connect_completion = completion;
                None
            }
            Message::PubRel { message_id, .. } => {
                self.released.shift_remove(message_id);
                completion.or_else(|| self.handover.remove(message_id))
            }
            _ => completion,
        };
        self.write_queue.push_back(Outbound { message, completion });
        Ok(message_id)
    }

    /// Hands queued messages to the writer task.
    ///
    /// Stops at the first message the channel state or the in-flight ceiling
    /// does not allow yet. Returns true once a DISCONNECT has been written.
    pub(crate) fn flush(&mut self, now: Instant) -> bool {
        let Some(writer) = self.writer.clone() else {
            return false;
        };

        while let Some(front) = self.write_queue.front() {
            if !self.may_write(&front.message) {
                break;
            }
            if front.message.requires_ack() && self.at_in_flight_ceiling() {
                break;
            }
            let Some(Outbound { message, completion }) = self.write_queue.pop_front() else {
                break;
            };
            if writer.send(message.clone()).is_err() {
                // Writer task is gone; the I/O error event will close the channel.
                self.write_queue.push_front(Outbound { message, completion });
                return false;
            }
            self.last_write = now;
            debug!(channel = %self.id, message = %message, "queued for write");

            match &message {
                Message::Connect(_) => {
                    self.state = ChannelState::ConnectSent;
                }
                Message::ConnAck(connack) if self.role == ChannelRole::Server => {
                    if connack.return_code.is_accepted() {
                        self.state = ChannelState::Open;
                    }
                }
                Message::PubRec(id) => {
                    self.awaiting_release.insert(
                        *id,
                        InFlight {
                            message: message.clone(),
                            sent_at: now,
                            completion: None,
                        },
                    );
                    self.lower_deadline(Some(now + self.options.resend_interval));
                }
                Message::Disconnect => {
                    if let Some(completion) = completion {
                        completion.complete(Ok(None));
                    }
                    return true;
                }
                _ => {}
            }

            if message.requires_ack() {
                let Some(id) = message.message_id() else {
                    continue;
                };
                self.in_flight.insert(
                    id,
                    InFlight {
                        message,
                        sent_at: now,
                        completion,
                    },
                );
                self.lower_deadline(Some(now + self.options.resend_interval));
            } else if let Some(completion) = completion {
                completion.complete(Ok(None));
            }
        }
        false
    }

    /// Applies channel-level bookkeeping to a received frame.
    pub(crate) fn on_message(&mut self, message: Message, now: Instant) -> Result<Receipt> {
        self.last_read = now;
        if self.state == ChannelState::Closed {
            return Ok(Receipt::Consumed);
        }

        if self.role == ChannelRole::Server && !self.connect_received && !matches!(message, Message::Connect(_)) {
            return Err(self.unexpected(&message));
        }

        match message {
            Message::Connect(ref connect) => {
                if self.role != ChannelRole::Server || self.connect_received {
                    return Err(self.unexpected(&message));
                }
                self.connect_received = true;
                self.options.keep_alive = Duration::from_secs(u64::from(connect.keep_alive_seconds));
                self.lower_deadline(self.read_deadline());
                Ok(Receipt::Dispatch(ChannelEvent::Message(message)))
            }
            Message::ConnAck(connack) => {
                if self.role != ChannelRole::Client || self.state != ChannelState::ConnectSent {
                    return Err(self.unexpected(&message));
                }
                if let Some(completion) = self.connect_completion.take() {
                    completion.complete(Ok(Some(message.clone())));
                }
                if connack.return_code.is_accepted() {
                    self.state = ChannelState::Open;
                    self.deadline = Some(now);
                    Ok(Receipt::Dispatch(ChannelEvent::Message(message)))
                } else {
                    Ok(Receipt::Rejected(ChannelEvent::Message(message), connack.return_code))
                }
            }
            Message::PingReq => {
                self.write_queue.push_back(Outbound {
                    message: Message::PingResp,
                    completion: None,
                });
                Ok(Receipt::Consumed)
            }
            Message::PingResp => Ok(Receipt::Consumed),
            Message::Disconnect => Ok(Receipt::Disconnected),
            Message::PubAck(id) | Message::PubRec(id) | Message::PubComp(id) | Message::UnsubAck(id) => {
                Ok(self.acknowledge(id, message))
            }
            Message::SubAck(ref suback) => {
                let id = suback.message_id;
                Ok(self.acknowledge(id, message))
            }
            Message::PubRel { message_id, .. } => {
                self.awaiting_release.shift_remove(&message_id);
                Ok(Receipt::Dispatch(ChannelEvent::Message(message)))
            }
            Message::Publish(_) | Message::Subscribe(_) | Message::Unsubscribe(_) => {
                Ok(Receipt::Dispatch(ChannelEvent::Message(message)))
            }
        }
    }

    /// Runs keep-alive, read-timeout and retransmission duties.
    ///
    /// Returns the next instant this needs to run again, or the error that
    /// must close the channel.
    pub(crate) fn house_keeping(&mut self, now: Instant) -> Result<Option<Instant>> {
        if self.state == ChannelState::Closed {
            return Ok(None);
        }

        let mut next: Option<Instant> = None;
        let mut consider = |at: Option<Instant>| {
            if let Some(at) = at {
                next = Some(next.map_or(at, |n: Instant| n.min(at)));
            }
        };

        if self.role == ChannelRole::Client && self.state != ChannelState::Open && !self.options.connect_timeout.is_zero() {
            let deadline = self.created_at + self.options.connect_timeout;
            if now >= deadline {
                return Err(MqttError::Timeout(TimeoutKind::Connect));
            }
            consider(Some(deadline));
        }

        if let Some(read_deadline) = self.read_deadline() {
            if now >= read_deadline {
                return Err(MqttError::Timeout(TimeoutKind::KeepAlive));
            }
            consider(Some(read_deadline));
        }

        if self.state == ChannelState::Open {
            if self.role == ChannelRole::Client && !self.options.keep_alive.is_zero() && self.is_connected() {
                if now.duration_since(self.last_write) >= self.options.keep_alive {
                    debug!(channel = %self.id, "keep-alive ping");
                    self.write_now(Message::PingReq, now);
                }
                consider(Some(self.last_write + self.options.keep_alive));
            }

            let resend = self.options.resend_interval;
            let mut retransmit = Vec::new();
            for entry in self.in_flight.values_mut().chain(self.awaiting_release.values_mut()) {
                if now.duration_since(entry.sent_at) >= resend {
                    entry.message.set_duplicate();
                    entry.sent_at = now;
                    retransmit.push(entry.message.clone());
                }
                consider(Some(entry.sent_at + resend));
            }
            for message in retransmit {
                warn!(channel = %self.id, message = %message, "retransmitting unacknowledged message");
                self.write_now(message, now);
            }
        }

        self.deadline = next;
        Ok(next)
    }

    /// Drains the in-flight map, pending releases and write queue in send order.
    ///
    /// Messages that already reached the wire come back with DUP set. Blocking
    /// commands attached to them are cancelled.
    pub(crate) fn unsent_messages(&mut self) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.in_flight.len() + self.write_queue.len());
        for (_, mut entry) in self.in_flight.drain(..) {
            entry.message.set_duplicate();
            if let Some(completion) = entry.completion {
                completion.cancel();
            }
            messages.push(entry.message);
        }
        messages.extend(self.awaiting_release.drain(..).map(|(_, entry)| entry.message));
        for outbound in self.write_queue.drain(..) {
            if let Some(completion) = outbound.completion {
                completion.cancel();
            }
            if !matches!(
                outbound.message,
                Message::PingReq | Message::PingResp | Message::Disconnect | Message::Connect(_) | Message::ConnAck(_)
            ) {
                messages.push(outbound.message);
            }
        }
        messages
    }

    /// Completes every pending blocking command with `Cancelled`.
    pub(crate) fn cancel_blocking_commands(&mut self) {
        self.fail_blocking_commands(&MqttError::Cancelled);
    }

    /// Completes every pending blocking command with `err`.
    fn fail_blocking_commands(&mut self, err: &MqttError) {
        let pending = self
            .connect_completion
            .take()
            .into_iter()
            .chain(self.handover.drain().map(|(_, completion)| completion))
            .chain(self.in_flight.values_mut().filter_map(|entry| entry.completion.take()))
            .chain(self.write_queue.iter_mut().filter_map(|outbound| outbound.completion.take()));
        for completion in pending {
            completion.complete(Err(err.clone()));
        }
    }

    /// Moves to `Closed`, releases the socket halves and returns what was
    /// never acknowledged.
    ///
    /// Blocked callers see `cause`, or `Cancelled` for a graceful close.
    pub(crate) fn close(&mut self, cause: Option<&MqttError>) -> Vec<Message> {
        self.state = ChannelState::Closed;
        self.deadline = None;
        self.writer = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.fail_blocking_commands(cause.unwrap_or(&MqttError::Cancelled));
        self.released.clear();
        self.unsent_messages()
    }

    fn acknowledge(&mut self, id: u16, ack: Message) -> Receipt {
        let matched = self
            .in_flight
            .get(&id)
            .is_some_and(|entry| expected_ack(&entry.message) == Some(ack.message_type()));
        if !matched {
            if matches!(ack, Message::PubRec(_)) {
                // Duplicate PUBREC: the handler answers with PUBREL again.
                return Receipt::Dispatch(ChannelEvent::Message(ack));
            }
            debug!(channel = %self.id, message = %ack, "acknowledgment for unknown message id ignored");
            return Receipt::Consumed;
        }
        let Some(entry) = self.in_flight.shift_remove(&id) else {
            return Receipt::Consumed;
        };
        if matches!(ack, Message::PubRec(_)) {
            self.released.insert(id);
        }
        if let Some(completion) = entry.completion {
            if matches!(ack, Message::PubRec(_)) {
                self.handover.insert(id, completion);
            } else {
                completion.complete(Ok(Some(ack.clone())));
            }
        }
        Receipt::Dispatch(ChannelEvent::Acknowledged {
            ack,
            original: entry.message,
        })
    }

    fn allocate_id(&mut self) -> Result<u16> {
        let in_use = self.in_flight.len()
            + self.released.len()
            + self
                .write_queue
                .iter()
                .filter(|o| o.message.requires_ack() && o.message.message_id().is_some_and(|id| id != 0))
                .count();
        if in_use >= MAX_IDS_IN_FLIGHT {
            return Err(MqttError::IdsExhausted(in_use));
        }
        for _ in 0..u16::MAX {
            let candidate = self.next_id;
            self.next_id = if self.next_id == u16::MAX { 1 } else { self.next_id + 1 };
            if !self.id_in_use(candidate) {
                return Ok(candidate);
            }
        }
        Err(MqttError::IdsExhausted(in_use))
    }

    fn id_in_use(&self, id: u16) -> bool {
        self.handover.contains_key(&id) || self.released.contains(&id) || self.id_pending(id)
    }

    /// True when a sent or queued message awaiting acknowledgment carries `id`.
    fn id_pending(&self, id: u16) -> bool {
        self.in_flight.contains_key(&id)
            || self
                .write_queue
                .iter()
                .any(|o| o.message.requires_ack() && o.message.message_id() == Some(id))
    }

    fn may_write(&self, message: &Message) -> bool {
        match self.state {
            ChannelState::Open => true,
            ChannelState::Closed => false,
            ChannelState::Disconnected | ChannelState::ConnectSent => match self.role {
                ChannelRole::Client => matches!(message, Message::Connect(_) | Message::Disconnect),
                ChannelRole::Server => matches!(message, Message::ConnAck(_) | Message::Disconnect),
            },
        }
    }

    fn at_in_flight_ceiling(&self) -> bool {
        self.options
            .max_in_flight
            .is_some_and(|max| self.in_flight.len() >= max)
    }

    fn read_deadline(&self) -> Option<Instant> {
        if self.options.keep_alive.is_zero() || !self.is_connected() {
            return None;
        }
        if self.role == ChannelRole::Client && self.state != ChannelState::Open {
            return None;
        }
        Some(self.last_read + self.options.keep_alive.mul_f64(1.5))
    }

    fn lower_deadline(&mut self, candidate: Option<Instant>) {
        if let Some(candidate) = candidate {
            self.deadline = Some(self.deadline.map_or(candidate, |d| d.min(candidate)));
        }
    }

    fn write_now(&mut self, message: Message, now: Instant) {
        if let Some(writer) = &self.writer {
            if writer.send(message).is_ok() {
                self.last_write = now;
            }
        }
    }

    fn unexpected(&self, message: &Message) -> MqttError {
        ProtocolError::UnexpectedMessage {
            kind: message.message_type().as_str(),
            state: self.state.as_str(),
        }
        .into()
    }
}

/// Kind of acknowledgment that completes an in-flight message.
fn expected_ack(message: &Message) -> Option<MessageType> {
    match message {
        Message::Publish(p) if p.qos == QoS::AtLeastOnce => Some(MessageType::PubAck),
        Message::Publish(p) if p.qos == QoS::ExactlyOnce => Some(MessageType::PubRec),
        Message::PubRel { .. } => Some(MessageType::PubComp),
        Message::Subscribe(_) => Some(MessageType::SubAck),
        Message::Unsubscribe(_) => Some(MessageType::UnsubAck),
        _ => None,
    }
}
