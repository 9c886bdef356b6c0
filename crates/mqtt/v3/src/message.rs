//! MQTT 3.1 control packet model.
//!
//! Every packet the channel layer handles is a [`Message`]. The enum is the
//! single dispatch point for handlers: one tagged variant per packet kind, so
//! a `match` over it is checked for exhaustiveness at compile time.
//!
//! Wire encoding and decoding live in [`crate::codec`]; this module only
//! describes what a packet carries.
//!
//! # Examples
//!
//! ```ignore
//! use relaymq_mqtt_v3::{Message, PublishMessage, QoS};
//!
//! let publish = PublishMessage::new("sensors/kitchen", "21.5", QoS::AtLeastOnce);
//! let message = Message::Publish(publish);
//! assert!(message.requires_ack());
//! ```

use std::fmt;

use bytes::Bytes;

use crate::error::ProtocolError;

/// Protocol name sent in CONNECT for MQTT 3.1.
pub const PROTOCOL_NAME: &str = "MQIsdp";

/// Protocol version sent in CONNECT for MQTT 3.1.
pub const PROTOCOL_VERSION: u8 = 3;

/// Packet kind, encoded in the upper nibble of the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Connect => "CONNECT",
            MessageType::ConnAck => "CONNACK",
            MessageType::Publish => "PUBLISH",
            MessageType::PubAck => "PUBACK",
            MessageType::PubRec => "PUBREC",
            MessageType::PubRel => "PUBREL",
            MessageType::PubComp => "PUBCOMP",
            MessageType::Subscribe => "SUBSCRIBE",
            MessageType::SubAck => "SUBACK",
            MessageType::Unsubscribe => "UNSUBSCRIBE",
            MessageType::UnsubAck => "UNSUBACK",
            MessageType::PingReq => "PINGREQ",
            MessageType::PingResp => "PINGRESP",
            MessageType::Disconnect => "DISCONNECT",
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => MessageType::Connect,
            2 => MessageType::ConnAck,
            3 => MessageType::Publish,
            4 => MessageType::PubAck,
            5 => MessageType::PubRec,
            6 => MessageType::PubRel,
            7 => MessageType::PubComp,
            8 => MessageType::Subscribe,
            9 => MessageType::SubAck,
            10 => MessageType::Unsubscribe,
            11 => MessageType::UnsubAck,
            12 => MessageType::PingReq,
            13 => MessageType::PingResp,
            14 => MessageType::Disconnect,
            other => return Err(ProtocolError::UnknownMessageType(other)),
        })
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery guarantee of a PUBLISH or subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(ProtocolError::InvalidQos(other)),
        }
    }
}

/// CONNACK return code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectReturnCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadCredentials = 4,
    NotAuthorized = 5,
}

impl ConnectReturnCode {
    pub fn is_accepted(&self) -> bool {
        *self == ConnectReturnCode::Accepted
    }
}

impl TryFrom<u8> for ConnectReturnCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => ConnectReturnCode::Accepted,
            1 => ConnectReturnCode::UnacceptableProtocolVersion,
            2 => ConnectReturnCode::IdentifierRejected,
            3 => ConnectReturnCode::ServerUnavailable,
            4 => ConnectReturnCode::BadCredentials,
            5 => ConnectReturnCode::NotAuthorized,
            other => return Err(ProtocolError::InvalidReturnCode(other)),
        })
    }
}

impl fmt::Display for ConnectReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConnectReturnCode::Accepted => "ACCEPTED",
            ConnectReturnCode::UnacceptableProtocolVersion => "UNACCEPTABLE_PROTOCOL_VERSION",
            ConnectReturnCode::IdentifierRejected => "IDENTIFIER_REJECTED",
            ConnectReturnCode::ServerUnavailable => "SERVER_UNAVAILABLE",
            ConnectReturnCode::BadCredentials => "BAD_CREDENTIALS",
            ConnectReturnCode::NotAuthorized => "NOT_AUTHORIZED",
        };
        f.write_str(text)
    }
}

/// The first byte of every frame, split into its fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    pub message_type: MessageType,
    pub duplicate: bool,
    pub qos: QoS,
    pub retain: bool,
}

impl FixedHeader {
    pub fn to_byte(&self) -> u8 {
        let mut byte = (self.message_type as u8) << 4;
        if self.duplicate {
            byte |= 0x08;
        }
        byte |= (self.qos as u8) << 1;
        if self.retain {
            byte |= 0x01;
        }
        byte
    }

    pub fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        Ok(Self {
            message_type: MessageType::try_from(byte >> 4)?,
            duplicate: byte & 0x08 != 0,
            qos: QoS::try_from((byte >> 1) & 0x03)?,
            retain: byte & 0x01 != 0,
        })
    }
}

/// Last-will registered with the broker in CONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub message: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectMessage {
    pub protocol_name: String,
    pub protocol_version: u8,
    pub clean_session: bool,
    pub keep_alive_seconds: u16,
    pub client_id: String,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ConnectMessage {
    /// CONNECT for MQTT 3.1 with no will and no credentials.
    pub fn new(client_id: impl Into<String>, clean_session: bool, keep_alive_seconds: u16) -> Self {
        Self {
            protocol_name: PROTOCOL_NAME.to_string(),
            protocol_version: PROTOCOL_VERSION,
            clean_session,
            keep_alive_seconds,
            client_id: client_id.into(),
            will: None,
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAckMessage {
    pub return_code: ConnectReturnCode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub duplicate: bool,
    /// Zero until the channel assigns an id to a QoS 1/2 publish.
    pub message_id: u16,
}

impl PublishMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain: false,
            duplicate: false,
            message_id: 0,
        }
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

/// A topic filter and the QoS requested (SUBSCRIBE) or granted (SUBACK) for it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub topic: String,
    pub qos: QoS,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            qos,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeMessage {
    pub message_id: u16,
    pub duplicate: bool,
    pub subscriptions: Vec<Subscription>,
}

impl SubscribeMessage {
    pub fn new(subscriptions: Vec<Subscription>) -> Self {
        Self {
            message_id: 0,
            duplicate: false,
            subscriptions,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAckMessage {
    pub message_id: u16,
    pub granted_qos: Vec<QoS>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubscribeMessage {
    pub message_id: u16,
    pub duplicate: bool,
    pub topics: Vec<String>,
}

impl UnsubscribeMessage {
    pub fn new(topics: Vec<String>) -> Self {
        Self {
            message_id: 0,
            duplicate: false,
            topics,
        }
    }
}

/// A decoded MQTT 3.1 control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Connect(ConnectMessage),
    ConnAck(ConnAckMessage),
    Publish(PublishMessage),
    PubAck(u16),
    PubRec(u16),
    PubRel { message_id: u16, duplicate: bool },
    PubComp(u16),
    Subscribe(SubscribeMessage),
    SubAck(SubAckMessage),
    Unsubscribe(UnsubscribeMessage),
    UnsubAck(u16),
    PingReq,
    PingResp,
    Disconnect,
}

impl Message {
    pub fn pub_rel(message_id: u16) -> Self {
        Message::PubRel {
            message_id,
            duplicate: false,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Connect(_) => MessageType::Connect,
            Message::ConnAck(_) => MessageType::ConnAck,
            Message::Publish(_) => MessageType::Publish,
            Message::PubAck(_) => MessageType::PubAck,
            Message::PubRec(_) => MessageType::PubRec,
            Message::PubRel { .. } => MessageType::PubRel,
            Message::PubComp(_) => MessageType::PubComp,
            Message::Subscribe(_) => MessageType::Subscribe,
            Message::SubAck(_) => MessageType::SubAck,
            Message::Unsubscribe(_) => MessageType::Unsubscribe,
            Message::UnsubAck(_) => MessageType::UnsubAck,
            Message::PingReq => MessageType::PingReq,
            Message::PingResp => MessageType::PingResp,
            Message::Disconnect => MessageType::Disconnect,
        }
    }

    /// Header QoS. PUBREL, SUBSCRIBE and UNSUBSCRIBE are fixed at AT_LEAST_ONCE.
    pub fn qos(&self) -> QoS {
        match self {
            Message::Publish(publish) => publish.qos,
            Message::PubRel { .. } | Message::Subscribe(_) | Message::Unsubscribe(_) => QoS::AtLeastOnce,
            _ => QoS::AtMostOnce,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        match self {
            Message::Publish(publish) => publish.duplicate,
            Message::PubRel { duplicate, .. } => *duplicate,
            Message::Subscribe(subscribe) => subscribe.duplicate,
            Message::Unsubscribe(unsubscribe) => unsubscribe.duplicate,
            _ => false,
        }
    }

    /// Marks the message as a retransmission. No-op for kinds without a DUP bit.
    pub fn set_duplicate(&mut self) {
        match self {
            Message::Publish(publish) => publish.duplicate = true,
            Message::PubRel { duplicate, .. } => *duplicate = true,
            Message::Subscribe(subscribe) => subscribe.duplicate = true,
            Message::Unsubscribe(unsubscribe) => unsubscribe.duplicate = true,
            _ => {}
        }
    }

    pub fn fixed_header(&self) -> FixedHeader {
        FixedHeader {
            message_type: self.message_type(),
            duplicate: self.is_duplicate(),
            qos: self.qos(),
            retain: matches!(self, Message::Publish(publish) if publish.retain),
        }
    }

    /// Message id carried by this packet, if its kind carries one.
    ///
    /// QoS 0 PUBLISH carries none. An unassigned id reads as `Some(0)`.
    pub fn message_id(&self) -> Option<u16> {
        match self {
            Message::Publish(publish) if publish.qos != QoS::AtMostOnce => Some(publish.message_id),
            Message::PubAck(id)
            | Message::PubRec(id)
            | Message::PubComp(id)
            | Message::UnsubAck(id)
            | Message::PubRel { message_id: id, .. } => Some(*id),
            Message::Subscribe(subscribe) => Some(subscribe.message_id),
            Message::SubAck(suback) => Some(suback.message_id),
            Message::Unsubscribe(unsubscribe) => Some(unsubscribe.message_id),
            _ => None,
        }
    }

    /// Overwrites the message id. No-op for kinds without one.
    pub fn set_message_id(&mut self, id: u16) {
        match self {
            Message::Publish(publish) if publish.qos != QoS::AtMostOnce => publish.message_id = id,
            Message::PubAck(current)
            | Message::PubRec(current)
            | Message::PubComp(current)
            | Message::UnsubAck(current)
            | Message::PubRel {
                message_id: current, ..
            } => *current = id,
            Message::Subscribe(subscribe) => subscribe.message_id = id,
            Message::SubAck(suback) => suback.message_id = id,
            Message::Unsubscribe(unsubscribe) => unsubscribe.message_id = id,
            _ => {}
        }
    }

    /// True for packets the sender must keep in flight until acknowledged.
    pub fn requires_ack(&self) -> bool {
        match self {
            Message::Publish(publish) => publish.qos != QoS::AtMostOnce,
            Message::PubRel { .. } | Message::Subscribe(_) | Message::Unsubscribe(_) => true,
            _ => false,
        }
    }

    /// True when the message is waiting for the channel to allocate an id.
    pub fn needs_message_id(&self) -> bool {
        matches!(
            self,
            Message::Publish(_) | Message::Subscribe(_) | Message::Unsubscribe(_)
        ) && self.message_id() == Some(0)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message_id() {
            Some(id) => write!(f, "{}(id={})", self.message_type(), id),
            None => write!(f, "{}", self.message_type()),
        }
    }
}
