//! In-process MQTT 3.1 broker for integration tests.
//!
//! Good enough to drive the clients and the proxy over real sockets: it
//! answers the handshake and acknowledgment chains, routes publishes to
//! matching subscribers and can sever every connection on demand.

#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use futures_util::{SinkExt, StreamExt};
use relaymq_mqtt_v3::{
    ConnAckMessage, ConnectMessage, ConnectReturnCode, Message, MessageCodec, PublishMessage, QoS, SubAckMessage,
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot, watch},
};
use tokio_util::codec::Framed;

type Outbox = mpsc::UnboundedSender<PublishMessage>;

#[derive(Default)]
struct Shared {
    connack: Option<ConnectReturnCode>,
    connects: Vec<ConnectMessage>,
    received: Vec<Message>,
    subscriptions: Vec<(u64, String, QoS, Outbox)>,
    next_connection: u64,
}

pub struct FakeBroker {
    addr: SocketAddr,
    shared: Arc<Mutex<Shared>>,
    generation: watch::Sender<u64>,
    stop: Option<oneshot::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl FakeBroker {
    pub fn start() -> Self {
        Self::start_with(ConnectReturnCode::Accepted)
    }

    /// Answers every CONNECT with `connack`.
    pub fn start_with(connack: ConnectReturnCode) -> Self {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = Arc::new(Mutex::new(Shared {
            connack: Some(connack),
            ..Shared::default()
        }));
        let (generation, _) = watch::channel(0u64);
        let (stop, stopped) = oneshot::channel();

        let state = shared.clone();
        let drops = generation.subscribe();
        let thread = thread::Builder::new()
            .name("fake-broker".to_string())
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
                runtime.block_on(async move {
                    let listener = TcpListener::from_std(listener).unwrap();
                    tokio::select! {
                        _ = accept_loop(listener, state, drops) => {}
                        _ = stopped => {}
                    }
                });
            })
            .unwrap();

        Self {
            addr,
            shared,
            generation,
            stop: Some(stop),
            thread: Some(thread),
        }
    }

    pub fn uri(&self) -> String {
        format!("tcp://{}", self.addr)
    }

    pub fn connects(&self) -> Vec<ConnectMessage> {
        self.shared.lock().unwrap().connects.clone()
    }

    pub fn received(&self) -> Vec<Message> {
        self.shared.lock().unwrap().received.clone()
    }

    pub fn received_publishes(&self) -> Vec<PublishMessage> {
        self.received()
            .into_iter()
            .filter_map(|m| match m {
                Message::Publish(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    /// Severs every open connection without DISCONNECT.
    pub fn drop_all(&self) {
        self.generation.send_modify(|g| *g += 1);
    }
}

impl Drop for FakeBroker {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Mutex<Shared>>, drops: watch::Receiver<u64>) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let connection = {
            let mut state = shared.lock().unwrap();
            state.next_connection += 1;
            state.next_connection
        };
        tokio::spawn(serve(connection, stream, shared.clone(), drops.clone()));
    }
}

async fn serve(connection: u64, stream: TcpStream, shared: Arc<Mutex<Shared>>, mut drops: watch::Receiver<u64>) {
    drops.borrow_and_update();
    let mut framed = Framed::new(stream, MessageCodec::default());
    let (outbox, mut deliveries) = mpsc::unbounded_channel::<PublishMessage>();
    let mut next_id: u16 = 0;

    loop {
        let reply = tokio::select! {
            _ = drops.changed() => break,
            Some(mut publish) = deliveries.recv() => {
                if publish.qos != QoS::AtMostOnce {
                    next_id = next_id.checked_add(1).unwrap_or(1);
                    publish.message_id = next_id;
                }
                vec![Message::Publish(publish)]
            }
            frame = framed.next() => match frame {
                Some(Ok(message)) => {
                    shared.lock().unwrap().received.push(message.clone());
                    match respond(connection, message, &shared, &outbox) {
                        Some(replies) => replies,
                        None => break,
                    }
                }
                _ => break,
            },
        };
        for message in reply {
            if framed.send(message).await.is_err() {
                break;
            }
        }
    }
    shared.lock().unwrap().subscriptions.retain(|(owner, ..)| *owner != connection);
}

/// Replies for one inbound frame; `None` closes the connection.
fn respond(connection: u64, message: Message, shared: &Mutex<Shared>, outbox: &Outbox) -> Option<Vec<Message>> {
    let mut state = shared.lock().unwrap();
    let replies = match message {
        Message::Connect(connect) => {
            state.connects.push(connect);
            let return_code = state.connack.unwrap_or(ConnectReturnCode::Accepted);
            vec![Message::ConnAck(ConnAckMessage { return_code })]
        }
        Message::Subscribe(subscribe) => {
            for subscription in &subscribe.subscriptions {
                state
                    .subscriptions
                    .push((connection, subscription.topic.clone(), subscription.qos, outbox.clone()));
            }
            vec![Message::SubAck(SubAckMessage {
                message_id: subscribe.message_id,
                granted_qos: subscribe.subscriptions.iter().map(|s| s.qos).collect(),
            })]
        }
        Message::Unsubscribe(unsubscribe) => {
            state
                .subscriptions
                .retain(|(owner, filter, ..)| *owner != connection || !unsubscribe.topics.contains(filter));
            vec![Message::UnsubAck(unsubscribe.message_id)]
        }
        Message::Publish(publish) => {
            for (_, filter, granted, subscriber) in &state.subscriptions {
                if topic_matches(filter, &publish.topic) {
                    let mut delivery = PublishMessage::new(publish.topic.clone(), publish.payload.clone(), publish.qos.min(*granted));
                    delivery.retain = publish.retain;
                    let _ = subscriber.send(delivery);
                }
            }
            match publish.qos {
                QoS::AtMostOnce => Vec::new(),
                QoS::AtLeastOnce => vec![Message::PubAck(publish.message_id)],
                QoS::ExactlyOnce => vec![Message::PubRec(publish.message_id)],
            }
        }
        Message::PubRel { message_id, .. } => vec![Message::PubComp(message_id)],
        Message::PubRec(id) => vec![Message::pub_rel(id)],
        Message::PingReq => vec![Message::PingResp],
        Message::Disconnect => return None,
        _ => Vec::new(),
    };
    Some(replies)
}

/// MQTT topic filter match with `+` and `#`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut levels = topic.split('/');
    for part in filter.split('/') {
        match (part, levels.next()) {
            ("#", _) => return true,
            ("+", Some(_)) => {}
            (part, Some(level)) if part == level => {}
            _ => return false,
        }
    }
    levels.next().is_none()
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}
