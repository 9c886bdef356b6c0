//! Channel manager: one worker thread driving many channels.
//!
//! The manager owns a dedicated OS thread running a current-thread tokio
//! runtime. A single event-loop task on that runtime owns every [`Channel`],
//! every registered [`MessageHandler`] and all timers, so channel state is
//! never shared and never locked.
//!
//! Foreign threads talk to the loop only through [`ManagerHandle`], which
//! enqueues closures over the [`Reactor`]. Each socket gets a reader task
//! (`FramedRead` → decoded frames) and a writer task (`FramedWrite` ← queued
//! messages); both report back to the loop over an internal event queue.
//!
//! # Loop tick
//!
//! ```text
//! select! { command closure | socket event | next deadline (≤ 10 s) }
//!     → due timers → channel housekeeping
//!     → dispatch queued events to handlers (repeat until quiescent)
//!     → flush write queues to writer tasks
//! ```
//!
//! Events raised while a handler runs are queued and dispatched before any
//! write queue is flushed. A channel closed during a dispatch therefore
//! reports its closure before anything queued in the same round reaches the
//! wire.
//!
//! # Examples
//!
//! ```ignore
//! let manager = ChannelManager::start("mqtt-io")?;
//! let handle = manager.handle();
//! let handler = handle.register_handler(Box::new(MyHandler::default()))?;
//! handle.execute(move |reactor| {
//!     let channel = reactor.channels().connect("broker:1883", ChannelOptions::default(), handler);
//!     let _ = reactor.channels().send(channel, Message::Connect(ConnectMessage::new("id", true, 60)));
//! })?;
//! assert!(manager.shutdown(Duration::from_secs(5)));
//! ```

use std::{
    any::Any,
    cmp::{Ordering as CmpOrdering, Reverse},
    collections::{BTreeMap, BinaryHeap, HashMap, VecDeque},
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc as std_mpsc, Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use futures_util::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::{AbortHandle, JoinSet},
};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, trace, warn};

use crate::{
    channel::{BlockingCommand, Channel, ChannelId, ChannelOptions, ChannelRole, ChannelState, Receipt},
    codec::MessageCodec,
    error::{MqttError, Result, TimeoutKind},
    handler::{ChannelEvent, HandlerId, MessageHandler},
    message::Message,
};

/// Longest the loop sleeps without a deadline.
const MAX_SELECT_WAIT: Duration = Duration::from_secs(10);

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Work submitted to the event loop.
pub type Task = Box<dyn FnOnce(&mut Reactor) + Send>;

/// Owner of the worker thread.
///
/// Dropping it asks the loop to stop without waiting for it.
pub struct ChannelManager {
    name: String,
    handle: ManagerHandle,
    thread: Option<JoinHandle<()>>,
    stopped: std_mpsc::Receiver<()>,
}

impl ChannelManager {
    /// Spawns the worker thread and its event loop.
    ///
    /// # Arguments
    ///
    /// * `name` - Thread name, also used in log lines.
    ///
    /// # Returns
    ///
    /// The running manager, or an I/O error if the runtime or thread could
    /// not be created.
    pub fn start(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let (task_tx, task_rx) = mpsc::unbounded_channel::<Task>();
        let (io_tx, io_rx) = mpsc::unbounded_channel();
        let (stopped_tx, stopped) = std_mpsc::channel();
        let next_handler = Arc::new(AtomicU64::new(1));
        let handle = ManagerHandle {
            tasks: task_tx,
            next_handler: next_handler.clone(),
        };

        let thread_name = name.clone();
        let thread = thread::Builder::new().name(name.clone()).spawn(move || {
            let reactor = Reactor::new(io_tx, next_handler);
            runtime.block_on(run(thread_name, reactor, task_rx, io_rx));
            drop(runtime);
            let _ = stopped_tx.send(());
        })?;

        info!("Channel manager '{}' started", name);
        Ok(Self {
            name,
            handle,
            thread: Some(thread),
            stopped,
        })
    }

    pub fn handle(&self) -> ManagerHandle {
        self.handle.clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stops the event loop and joins the worker thread.
    ///
    /// Every channel is closed and queued writes are given until `timeout`
    /// to reach their sockets.
    ///
    /// # Returns
    ///
    /// `true` if the thread finished within `timeout`.
    pub fn shutdown(mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        if self.handle.execute(move |reactor| reactor.stop(deadline)).is_err() {
            debug!("Channel manager '{}' already stopped", self.name);
        }

        let finished = match self.stopped.recv_timeout(timeout) {
            Ok(()) | Err(std_mpsc::RecvTimeoutError::Disconnected) => true,
            Err(std_mpsc::RecvTimeoutError::Timeout) => false,
        };
        if finished {
            if let Some(thread) = self.thread.take() {
                if thread.join().is_err() {
                    error!("Channel manager '{}' worker thread panicked", self.name);
                }
            }
            info!("Channel manager '{}' stopped", self.name);
        } else {
            warn!("Channel manager '{}' did not stop within {:?}", self.name, timeout);
        }
        finished
    }
}

impl Drop for ChannelManager {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let deadline = Instant::now();
            let _ = self.handle.execute(move |reactor| reactor.stop(deadline));
        }
    }
}

/// Thread-safe entry point into a running manager.
#[derive(Clone)]
pub struct ManagerHandle {
    tasks: mpsc::UnboundedSender<Task>,
    next_handler: Arc<AtomicU64>,
}

impl ManagerHandle {
    /// Queues `task` to run on the worker thread.
    pub fn execute(&self, task: impl FnOnce(&mut Reactor) + Send + 'static) -> Result<()> {
        self.tasks
            .send(Box::new(task))
            .map_err(|_| MqttError::ManagerStopped)
    }

    /// Runs `task` on the worker thread and waits for its result.
    ///
    /// Must not be called from the worker thread itself.
    pub fn call<R: Send + 'static>(
        &self,
        task: impl FnOnce(&mut Reactor) -> R + Send + 'static,
    ) -> Result<R> {
        let (tx, rx) = std_mpsc::sync_channel(1);
        self.execute(move |reactor| {
            let _ = tx.send(task(reactor));
        })?;
        rx.recv().map_err(|_| MqttError::ManagerStopped)
    }

    /// Registers `handler` and returns its id immediately.
    ///
    /// The handler is installed before any task queued after this call runs.
    pub fn register_handler(&self, handler: Box<dyn MessageHandler>) -> Result<HandlerId> {
        self.register_handler_with(|_| handler)
    }

    /// Like [`register_handler`](Self::register_handler) for handlers that
    /// need to know their own id.
    pub fn register_handler_with(
        &self,
        build: impl FnOnce(HandlerId) -> Box<dyn MessageHandler>,
    ) -> Result<HandlerId> {
        let id = HandlerId(self.next_handler.fetch_add(1, Ordering::Relaxed));
        let handler = build(id);
        self.execute(move |reactor| reactor.insert_handler(id, handler))?;
        Ok(id)
    }

    /// Runs `task` against the handler registered as `id`, if it is an `H`.
    pub fn execute_on<H: MessageHandler>(
        &self,
        id: HandlerId,
        task: impl FnOnce(&mut H, &mut Channels) + Send + 'static,
    ) -> Result<()> {
        self.execute(move |reactor| {
            if reactor.with_handler(id, task).is_none() {
                warn!("Task for {} dropped: handler not registered", id);
            }
        })
    }
}

/// Socket-side notifications from reader, writer, connect and accept tasks.
enum IoEvent {
    Connected {
        channel: ChannelId,
        stream: TcpStream,
        peer: Option<SocketAddr>,
    },
    ConnectFailed {
        channel: ChannelId,
        error: MqttError,
    },
    Accepted {
        listener: u64,
        stream: TcpStream,
        peer: SocketAddr,
    },
    Received {
        channel: ChannelId,
        message: Message,
    },
    ReadClosed {
        channel: ChannelId,
        error: Option<MqttError>,
    },
    WriteFailed {
        channel: ChannelId,
        error: MqttError,
    },
}

struct Dispatch {
    channel: ChannelId,
    handler: HandlerId,
    event: ChannelEvent,
}

/// Scheduled task, ordered by deadline then by scheduling order.
struct Timer {
    at: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        (self.at, self.seq) == (other.at, other.seq)
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

struct Listener {
    handler: HandlerId,
    local_addr: SocketAddr,
    options: ChannelOptions,
    accept: AbortHandle,
}

/// Channel table and everything a handler may do while it runs.
///
/// Handlers receive `&mut Channels` on every event. All operations take
/// effect on the worker thread immediately; events they raise are queued and
/// dispatched after the current handler returns.
pub struct Channels {
    table: BTreeMap<ChannelId, Channel>,
    events: VecDeque<Dispatch>,
    deferred: VecDeque<Task>,
    timers: BinaryHeap<Reverse<Timer>>,
    timer_seq: u64,
    listeners: BTreeMap<u64, Listener>,
    registered: Vec<(HandlerId, Box<dyn MessageHandler>)>,
    retired: Vec<HandlerId>,
    io_tx: mpsc::UnboundedSender<IoEvent>,
    writers: JoinSet<()>,
    next_channel: u64,
    next_listener: u64,
    next_handler: Arc<AtomicU64>,
    #[cfg(test)]
    memory: Option<mpsc::UnboundedSender<(ChannelId, mpsc::UnboundedReceiver<Message>)>>,
}

impl Channels {
    fn new(io_tx: mpsc::UnboundedSender<IoEvent>, next_handler: Arc<AtomicU64>) -> Self {
        Self {
            table: BTreeMap::new(),
            events: VecDeque::new(),
            deferred: VecDeque::new(),
            timers: BinaryHeap::new(),
            timer_seq: 0,
            listeners: BTreeMap::new(),
            registered: Vec::new(),
            retired: Vec::new(),
            io_tx,
            writers: JoinSet::new(),
            next_channel: 1,
            next_listener: 1,
            next_handler,
            #[cfg(test)]
            memory: None,
        }
    }

    /// Opens a client-role channel to `addr` (`host:port`) attached to `handler`.
    ///
    /// Returns at once; the TCP connect runs in the background and the
    /// handler sees `Opened` or `Closed`. Messages sent meanwhile are queued.
    pub fn connect(&mut self, addr: impl Into<String>, options: ChannelOptions, handler: HandlerId) -> ChannelId {
        let addr = addr.into();
        let id = self.create(ChannelRole::Client, options, Some(handler));
        #[cfg(test)]
        if let Some(memory) = self.memory.clone() {
            let (tx, rx) = mpsc::unbounded_channel();
            self.attach_memory(id, tx, handler);
            let _ = memory.send((id, rx));
            return id;
        }
        let io_tx = self.io_tx.clone();
        debug!("Connecting {} to {}", id, addr);
        tokio::spawn(async move {
            let event = match TcpStream::connect(&addr).await {
                Ok(stream) => IoEvent::Connected {
                    channel: id,
                    peer: stream.peer_addr().ok(),
                    stream,
                },
                Err(err) => IoEvent::ConnectFailed {
                    channel: id,
                    error: err.into(),
                },
            };
            let _ = io_tx.send(event);
        });
        id
    }

    /// Binds `addr` and attaches every accepted connection to `handler`.
    ///
    /// Returns the bound address, which carries the chosen port when `addr`
    /// asks for port 0.
    pub fn listen(&mut self, addr: SocketAddr, options: ChannelOptions, handler: HandlerId) -> Result<SocketAddr> {
        let std_listener = std::net::TcpListener::bind(addr)?;
        std_listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(std_listener)?;
        let local_addr = listener.local_addr()?;

        let id = self.next_listener;
        self.next_listener += 1;
        let io_tx = self.io_tx.clone();
        let accept = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        if io_tx.send(IoEvent::Accepted { listener: id, stream, peer }).is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        warn!("Accept on {} failed: {}", local_addr, err);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        })
        .abort_handle();

        info!("Listening on {}", local_addr);
        self.listeners.insert(
            id,
            Listener {
                handler,
                local_addr,
                options,
                accept,
            },
        );
        Ok(local_addr)
    }

    /// Stops every accept loop feeding `handler`.
    pub fn stop_listening(&mut self, handler: HandlerId) {
        self.listeners.retain(|_, listener| {
            if listener.handler == handler {
                listener.accept.abort();
                info!("Stopped listening on {}", listener.local_addr);
                false
            } else {
                true
            }
        });
    }

    /// Wraps an already connected stream in a channel attached to `handler`.
    pub fn open_stream<S>(
        &mut self,
        stream: S,
        role: ChannelRole,
        options: ChannelOptions,
        handler: HandlerId,
        peer: Option<SocketAddr>,
    ) -> ChannelId
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let id = self.create(role, options, Some(handler));
        self.bind_stream(id, stream, peer);
        id
    }

    /// Queues `message` on `channel`. Returns the message id it carries.
    pub fn send(&mut self, channel: ChannelId, message: Message) -> Result<Option<u16>> {
        self.send_with(channel, message, None)
    }

    /// Queues `message` and completes `completion` when it is acknowledged
    /// (or written, for messages without an acknowledgment).
    pub fn send_with(
        &mut self,
        channel: ChannelId,
        message: Message,
        completion: Option<BlockingCommand>,
    ) -> Result<Option<u16>> {
        match self.table.get_mut(&channel) {
            Some(entry) => entry.send(message, completion),
            None => {
                if let Some(completion) = completion {
                    completion.cancel();
                }
                Err(MqttError::UnknownChannel(channel.to_string()))
            }
        }
    }

    /// Queues DISCONNECT; the channel closes gracefully once it is written.
    pub fn disconnect(&mut self, channel: ChannelId, completion: Option<BlockingCommand>) -> Result<()> {
        let connected = self.table.get(&channel).is_some_and(|c| c.is_connected());
        if !connected {
            self.close(channel, None);
            if let Some(completion) = completion {
                completion.complete(Ok(None));
            }
            return Ok(());
        }
        self.send_with(channel, Message::Disconnect, completion).map(|_| ())
    }

    /// Closes `channel` now. `cause` is `None` for a graceful close.
    ///
    /// The attached handler receives `Closed` with every message that was
    /// queued or in flight.
    pub fn close(&mut self, channel: ChannelId, cause: Option<MqttError>) {
        let Some(mut entry) = self.table.remove(&channel) else {
            return;
        };
        let undelivered = entry.close(cause.as_ref());
        match &cause {
            None => info!("Channel {} closed", channel),
            Some(cause) => warn!("Channel {} closed: {}", channel, cause),
        }
        if let Some(handler) = entry.handler() {
            self.events.push_back(Dispatch {
                channel,
                handler,
                event: ChannelEvent::Closed { cause, undelivered },
            });
        }
    }

    /// Closes `channel` on the next loop tick, after everything queued on it
    /// so far has been handed to its writer.
    pub fn close_when_flushed(&mut self, channel: ChannelId, cause: Option<MqttError>) {
        self.schedule(Duration::ZERO, move |reactor| reactor.channels().close(channel, cause));
    }

    /// Rebinds `channel` to `handler` without touching the socket.
    pub fn attach(&mut self, channel: ChannelId, handler: HandlerId) -> Result<()> {
        self.detach(channel)?;
        if let Some(entry) = self.table.get_mut(&channel) {
            entry.set_handler(Some(handler));
        }
        debug!("Channel {} attached to {}", channel, handler);
        self.events.push_back(Dispatch {
            channel,
            handler,
            event: ChannelEvent::Attached,
        });
        Ok(())
    }

    /// Unbinds `channel` from its handler. Events are dropped until it is
    /// attached again.
    pub fn detach(&mut self, channel: ChannelId) -> Result<()> {
        let entry = self
            .table
            .get_mut(&channel)
            .ok_or_else(|| MqttError::UnknownChannel(channel.to_string()))?;
        if let Some(previous) = entry.set_handler(None) {
            self.events.push_back(Dispatch {
                channel,
                handler: previous,
                event: ChannelEvent::Detached,
            });
        }
        Ok(())
    }

    /// Queues `event` for the handler currently attached to `channel`.
    pub fn dispatch(&mut self, channel: ChannelId, event: ChannelEvent) {
        match self.table.get(&channel).and_then(Channel::handler) {
            Some(handler) => self.events.push_back(Dispatch { channel, handler, event }),
            None => debug!("Dropped {} event for {}: no handler attached", event.name(), channel),
        }
    }

    /// Drains `channel`'s in-flight map and write queue for re-homing.
    pub fn unsent_messages(&mut self, channel: ChannelId) -> Result<Vec<Message>> {
        self.table
            .get_mut(&channel)
            .map(Channel::unsent_messages)
            .ok_or_else(|| MqttError::UnknownChannel(channel.to_string()))
    }

    /// Cancels every blocking command waiting on `channel`.
    pub fn cancel_blocking_commands(&mut self, channel: ChannelId) {
        if let Some(entry) = self.table.get_mut(&channel) {
            entry.cancel_blocking_commands();
        }
    }

    /// State of `channel`, or `None` once it has been closed and reaped.
    pub fn state(&self, channel: ChannelId) -> Option<ChannelState> {
        self.table.get(&channel).map(Channel::state)
    }

    pub fn is_open(&self, channel: ChannelId) -> bool {
        self.state(channel) == Some(ChannelState::Open)
    }

    pub fn peer_addr(&self, channel: ChannelId) -> Option<SocketAddr> {
        self.table.get(&channel).and_then(Channel::peer)
    }

    pub fn handler_of(&self, channel: ChannelId) -> Option<HandlerId> {
        self.table.get(&channel).and_then(Channel::handler)
    }

    pub fn in_flight_count(&self, channel: ChannelId) -> usize {
        self.table.get(&channel).map_or(0, Channel::in_flight_count)
    }

    pub fn queued_count(&self, channel: ChannelId) -> usize {
        self.table.get(&channel).map_or(0, Channel::queued_count)
    }

    pub fn channel_count(&self) -> usize {
        self.table.len()
    }

    /// Registers a handler from inside the loop. It is usable by the time the
    /// current handler returns.
    pub fn register_handler(&mut self, handler: Box<dyn MessageHandler>) -> HandlerId {
        self.register_handler_with(|_| handler)
    }

    pub fn register_handler_with(&mut self, build: impl FnOnce(HandlerId) -> Box<dyn MessageHandler>) -> HandlerId {
        let id = HandlerId(self.next_handler.fetch_add(1, Ordering::Relaxed));
        self.registered.push((id, build(id)));
        id
    }

    /// Removes a handler once the current dispatch finishes.
    pub fn retire_handler(&mut self, handler: HandlerId) {
        self.retired.push(handler);
    }

    /// Runs `task` on this thread after the current handler returns.
    pub fn defer(&mut self, task: impl FnOnce(&mut Reactor) + Send + 'static) {
        self.deferred.push_back(Box::new(task));
    }

    /// Runs `task` on this thread once `delay` has elapsed.
    pub fn schedule(&mut self, delay: Duration, task: impl FnOnce(&mut Reactor) + Send + 'static) {
        self.timer_seq += 1;
        self.timers.push(Reverse(Timer {
            at: Instant::now() + delay,
            seq: self.timer_seq,
            task: Box::new(task),
        }));
    }

    fn create(&mut self, role: ChannelRole, options: ChannelOptions, handler: Option<HandlerId>) -> ChannelId {
        let id = ChannelId(self.next_channel);
        self.next_channel += 1;
        let mut channel = Channel::new(id, role, options, Instant::now());
        channel.set_handler(handler);
        self.table.insert(id, channel);
        id
    }

    #[cfg(test)]
    fn attach_memory(&mut self, id: ChannelId, writer: mpsc::UnboundedSender<Message>, handler: HandlerId) {
        if let Some(channel) = self.table.get_mut(&id) {
            channel.attach_io(writer, None, None, Instant::now());
        }
        self.events.push_back(Dispatch {
            channel: id,
            handler,
            event: ChannelEvent::Opened,
        });
    }

    fn bind_stream<S>(&mut self, id: ChannelId, stream: S, peer: Option<SocketAddr>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let Some(channel) = self.table.get_mut(&id) else {
            return;
        };
        let codec = MessageCodec::new(channel.options().max_message_size);
        let (read_half, write_half) = tokio::io::split(stream);
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_frames(id, read_half, codec, self.io_tx.clone())).abort_handle();
        self.writers
            .spawn(write_frames(id, write_half, codec, writer_rx, self.io_tx.clone()));

        channel.attach_io(writer_tx, Some(reader), peer, Instant::now());
        debug!("Channel {} bound to {:?}", id, peer);
        if let Some(handler) = channel.handler() {
            self.events.push_back(Dispatch {
                channel: id,
                handler,
                event: ChannelEvent::Opened,
            });
        }
    }

    fn on_io(&mut self, event: IoEvent) {
        let now = Instant::now();
        match event {
            IoEvent::Connected { channel, stream, peer } => {
                if !self.table.contains_key(&channel) {
                    trace!("Connection for reaped channel {} dropped", channel);
                    return;
                }
                if let Err(err) = stream.set_nodelay(true) {
                    debug!("Could not disable Nagle on {}: {}", channel, err);
                }
                self.bind_stream(channel, stream, peer);
            }
            IoEvent::ConnectFailed { channel, error } => self.close(channel, Some(error)),
            IoEvent::Accepted { listener, stream, peer } => {
                let Some(entry) = self.listeners.get(&listener) else {
                    return;
                };
                let (handler, options) = (entry.handler, entry.options.clone());
                let _ = stream.set_nodelay(true);
                let id = self.create(ChannelRole::Server, options, Some(handler));
                info!("Accepted {} from {}", id, peer);
                self.bind_stream(id, stream, Some(peer));
            }
            IoEvent::Received { channel, message } => {
                let Some(entry) = self.table.get_mut(&channel) else {
                    return;
                };
                trace!("Channel {} received {}", channel, message);
                match entry.on_message(message, now) {
                    Ok(Receipt::Dispatch(event)) => self.dispatch(channel, event),
                    Ok(Receipt::Consumed) => {}
                    Ok(Receipt::Disconnected) => {
                        debug!("Channel {} received DISCONNECT", channel);
                        self.close(channel, None);
                    }
                    Ok(Receipt::Rejected(event, code)) => {
                        self.dispatch(channel, event);
                        self.close(channel, Some(MqttError::RejectedConnection(code)));
                    }
                    Err(err) => self.close(channel, Some(err)),
                }
            }
            IoEvent::ReadClosed { channel, error } => {
                self.close(channel, Some(error.unwrap_or(MqttError::ConnectionClosed)))
            }
            IoEvent::WriteFailed { channel, error } => self.close(channel, Some(error)),
        }
    }

    fn house_keeping(&mut self, now: Instant) {
        let mut failed = Vec::new();
        for (id, channel) in self.table.iter_mut() {
            if channel.deadline().is_some_and(|deadline| deadline <= now) {
                if let Err(err) = channel.house_keeping(now) {
                    failed.push((*id, err));
                }
            }
        }
        for (id, err) in failed {
            self.close(id, Some(err));
        }
    }

    fn flush(&mut self, now: Instant) {
        let mut disconnected = Vec::new();
        for (id, channel) in self.table.iter_mut() {
            if channel.flush(now) {
                disconnected.push(*id);
            }
        }
        for id in disconnected {
            self.close(id, None);
        }
    }

    fn due_timers(&mut self, now: Instant) -> Vec<Task> {
        let mut due = Vec::new();
        while self.timers.peek().is_some_and(|Reverse(timer)| timer.at <= now) {
            if let Some(Reverse(timer)) = self.timers.pop() {
                due.push(timer.task);
            }
        }
        due
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.table
            .values()
            .filter_map(Channel::deadline)
            .chain(self.timers.peek().map(|Reverse(timer)| timer.at))
            .min()
    }

    fn close_all(&mut self, cause: MqttError) {
        let ids: Vec<ChannelId> = self.table.keys().copied().collect();
        for id in ids {
            self.close(id, Some(cause.clone()));
        }
        for (_, listener) in std::mem::take(&mut self.listeners) {
            listener.accept.abort();
        }
    }

    fn reap_writers(&mut self) {
        while let Some(result) = self.writers.try_join_next() {
            if let Err(err) = result {
                if err.is_panic() {
                    error!("Writer task panicked: {}", err);
                }
            }
        }
    }
}

/// The event loop's state: handlers plus the [`Channels`] they operate on.
pub struct Reactor {
    handlers: HashMap<HandlerId, Box<dyn MessageHandler>>,
    channels: Channels,
    stop_at: Option<Instant>,
}

impl Reactor {
    fn new(io_tx: mpsc::UnboundedSender<IoEvent>, next_handler: Arc<AtomicU64>) -> Self {
        Self {
            handlers: HashMap::new(),
            channels: Channels::new(io_tx, next_handler),
            stop_at: None,
        }
    }

    pub fn channels(&mut self) -> &mut Channels {
        &mut self.channels
    }

    pub fn insert_handler(&mut self, id: HandlerId, handler: Box<dyn MessageHandler>) {
        self.handlers.insert(id, handler);
    }

    pub fn remove_handler(&mut self, id: HandlerId) -> Option<Box<dyn MessageHandler>> {
        self.handlers.remove(&id)
    }

    pub fn has_handler(&self, id: HandlerId) -> bool {
        self.handlers.contains_key(&id)
    }

    /// Calls `f` with the handler registered as `id` downcast to `H`.
    ///
    /// Returns `None` when no such handler exists or it is not an `H`.
    pub fn with_handler<H: MessageHandler, R>(
        &mut self,
        id: HandlerId,
        f: impl FnOnce(&mut H, &mut Channels) -> R,
    ) -> Option<R> {
        let mut handler = self.handlers.remove(&id)?;
        let any: &mut dyn Any = handler.as_mut();
        let result = any.downcast_mut::<H>().map(|typed| f(typed, &mut self.channels));
        self.handlers.insert(id, handler);
        self.absorb_handler_changes();
        result
    }

    /// Asks the loop to exit, giving queued writes until `deadline`.
    pub fn stop(&mut self, deadline: Instant) {
        self.stop_at = Some(deadline);
    }

    fn stopping(&self) -> bool {
        self.stop_at.is_some()
    }

    /// Runs due timers and housekeeping, dispatches until quiescent and
    /// flushes write queues.
    fn pump(&mut self, now: Instant) {
        for task in self.channels.due_timers(now) {
            self.channels.deferred.push_back(task);
        }
        self.channels.house_keeping(now);
        loop {
            self.drain();
            self.channels.flush(now);
            if self.channels.events.is_empty() && self.channels.deferred.is_empty() {
                break;
            }
        }
        self.channels.reap_writers();
    }

    fn drain(&mut self) {
        loop {
            if let Some(dispatch) = self.channels.events.pop_front() {
                self.deliver(dispatch);
            } else if let Some(task) = self.channels.deferred.pop_front() {
                task(self);
                self.absorb_handler_changes();
            } else {
                return;
            }
        }
    }

    fn deliver(&mut self, dispatch: Dispatch) {
        let Dispatch { channel, handler, event } = dispatch;
        let Some(mut target) = self.handlers.remove(&handler) else {
            debug!("Dropped {} event for {}: {} not registered", event.name(), channel, handler);
            return;
        };
        let result = target.handle(&mut self.channels, channel, event);
        self.handlers.insert(handler, target);
        self.absorb_handler_changes();
        if let Err(err) = result {
            error!("Handler {} failed on {}: {}", handler, channel, err);
            self.channels.close(channel, Some(err));
        }
    }

    fn absorb_handler_changes(&mut self) {
        for (id, handler) in self.channels.registered.drain(..) {
            self.handlers.insert(id, handler);
        }
        for id in self.channels.retired.drain(..) {
            self.handlers.remove(&id);
        }
    }
}

async fn run(
    name: String,
    mut reactor: Reactor,
    mut tasks: mpsc::UnboundedReceiver<Task>,
    mut io: mpsc::UnboundedReceiver<IoEvent>,
) {
    debug!("Channel manager '{}' event loop running", name);
    loop {
        let now = Instant::now();
        let wake_at = reactor
            .channels
            .next_deadline()
            .map_or(now + MAX_SELECT_WAIT, |deadline| deadline.min(now + MAX_SELECT_WAIT));

        tokio::select! {
            task = tasks.recv() => match task {
                Some(task) => {
                    task(&mut reactor);
                    reactor.absorb_handler_changes();
                    while let Ok(task) = tasks.try_recv() {
                        task(&mut reactor);
                        reactor.absorb_handler_changes();
                    }
                }
                None => {
                    debug!("All handles to '{}' dropped", name);
                    reactor.stop(Instant::now());
                }
            },
            Some(event) = io.recv() => reactor.channels.on_io(event),
            _ = tokio::time::sleep_until(wake_at.into()) => {}
        }

        reactor.pump(Instant::now());
        if reactor.stopping() {
            break;
        }
    }

    reactor.channels.close_all(MqttError::ManagerStopped);
    reactor.pump(Instant::now());

    let grace = reactor
        .stop_at
        .map(|deadline| deadline.saturating_duration_since(Instant::now()))
        .unwrap_or_default();
    let writers = &mut reactor.channels.writers;
    let drained = tokio::time::timeout(grace, async {
        while writers.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            "Channel manager '{}': {}; abandoning unflushed writes",
            name,
            MqttError::Timeout(TimeoutKind::Shutdown)
        );
        reactor.channels.writers.abort_all();
    }
    debug!("Channel manager '{}' event loop finished", name);
}

async fn read_frames<R>(
    channel: ChannelId,
    read_half: R,
    codec: MessageCodec,
    events: mpsc::UnboundedSender<IoEvent>,
) where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(read_half, codec);
    let error = loop {
        match frames.next().await {
            Some(Ok(message)) => {
                if events.send(IoEvent::Received { channel, message }).is_err() {
                    return;
                }
            }
            Some(Err(err)) => break Some(err),
            None => break None,
        }
    };
    let _ = events.send(IoEvent::ReadClosed { channel, error });
}

async fn write_frames<W>(
    channel: ChannelId,
    write_half: W,
    codec: MessageCodec,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    events: mpsc::UnboundedSender<IoEvent>,
) where
    W: AsyncWrite + Unpin,
{
    let mut sink = FramedWrite::new(write_half, codec);
    while let Some(message) = outbound.recv().await {
        let mut result = sink.feed(message).await;
        while result.is_ok() {
            match outbound.try_recv() {
                Ok(message) => result = sink.feed(message).await,
                Err(_) => break,
            }
        }
        if let Err(error) = result.and(sink.flush().await) {
            let _ = events.send(IoEvent::WriteFailed { channel, error });
            return;
        }
    }
    // Sender dropped: the channel closed. Flush what is left and shut down.
    if let Err(err) = sink.close().await {
        trace!("Closing writer for {}: {}", channel, err);
    }
}
