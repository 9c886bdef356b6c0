//! MQTT 3.1 wire codec.
//!
//! Frames are one header byte (kind in the high nibble, DUP/QoS/RETAIN in the
//! low nibble), a remaining-length varint of 1 to 4 bytes, then the body.
//! Strings are UTF-8 with a big-endian `u16` length prefix; message ids are
//! big-endian `u16`.
//!
//! [`MessageCodec`] plugs into `tokio_util::codec::{FramedRead, FramedWrite}`.
//! A frame that has not fully arrived yields `Ok(None)` so the reader keeps
//! buffering; a frame that can never be valid is a [`ProtocolError`].
//!
//! # Examples
//!
//! ```ignore
//! use bytes::BytesMut;
//! use tokio_util::codec::Decoder;
//! use relaymq_mqtt_v3::codec::MessageCodec;
//!
//! let mut buf = BytesMut::from(&[0x62, 0x02, 0x00, 0x01][..]);
//! let message = MessageCodec::default().decode(&mut buf)?.unwrap();
//! assert_eq!(message.message_id(), Some(1));
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    error::{MqttError, ProtocolError},
    message::{
        ConnAckMessage, ConnectMessage, ConnectReturnCode, FixedHeader, Message, MessageType,
        PublishMessage, QoS, SubAckMessage, SubscribeMessage, Subscription, UnsubscribeMessage,
        Will,
    },
};

/// Largest value a 4-byte remaining-length varint can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

const MAX_VARINT_BYTES: usize = 4;

/// Appends `len` as a remaining-length varint.
pub fn encode_remaining_length(mut len: usize, dst: &mut BytesMut) -> Result<(), ProtocolError> {
    if len > MAX_REMAINING_LENGTH {
        return Err(ProtocolError::RemainingLengthOverflow);
    }
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        dst.put_u8(byte);
        if len == 0 {
            return Ok(());
        }
    }
}

/// Reads a remaining-length varint from the start of `src`.
///
/// Returns the value and the number of bytes it occupied, or `None` when
/// `src` ends before the last varint byte.
pub fn decode_remaining_length(src: &[u8]) -> Result<Option<(usize, usize)>, ProtocolError> {
    let mut value = 0usize;
    let mut multiplier = 1usize;
    for (index, byte) in src.iter().take(MAX_VARINT_BYTES).enumerate() {
        value += (byte & 0x7F) as usize * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, index + 1)));
        }
        multiplier *= 128;
    }
    if src.len() >= MAX_VARINT_BYTES {
        Err(ProtocolError::RemainingLengthOverflow)
    } else {
        Ok(None)
    }
}

/// Length of the body `message` encodes to.
pub fn remaining_length(message: &Message) -> usize {
    match message {
        Message::Connect(connect) => {
            let mut len = string_len(&connect.protocol_name) + 1 + 1 + 2 + string_len(&connect.client_id);
            if let Some(will) = &connect.will {
                len += string_len(&will.topic) + 2 + will.message.len();
            }
            if let Some(username) = &connect.username {
                len += string_len(username);
            }
            if let Some(password) = &connect.password {
                len += string_len(password);
            }
            len
        }
        Message::ConnAck(_) => 2,
        Message::Publish(publish) => {
            let id_len = if publish.qos == QoS::AtMostOnce { 0 } else { 2 };
            string_len(&publish.topic) + id_len + publish.payload.len()
        }
        Message::PubAck(_)
        | Message::PubRec(_)
        | Message::PubRel { .. }
        | Message::PubComp(_)
        | Message::UnsubAck(_) => 2,
        Message::Subscribe(subscribe) => {
            2 + subscribe
                .subscriptions
                .iter()
                .map(|s| string_len(&s.topic) + 1)
                .sum::<usize>()
        }
        Message::SubAck(suback) => 2 + suback.granted_qos.len(),
        Message::Unsubscribe(unsubscribe) => {
            2 + unsubscribe.topics.iter().map(|t| string_len(t)).sum::<usize>()
        }
        Message::PingReq | Message::PingResp | Message::Disconnect => 0,
    }
}

/// Serializes `message` as a complete frame.
pub fn encode_message(message: &Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
    let body_len = remaining_length(message);
    dst.reserve(1 + MAX_VARINT_BYTES + body_len);
    dst.put_u8(message.fixed_header().to_byte());
    encode_remaining_length(body_len, dst)?;

    match message {
        Message::Connect(connect) => encode_connect(connect, dst)?,
        Message::ConnAck(connack) => {
            dst.put_u8(0);
            dst.put_u8(connack.return_code as u8);
        }
        Message::Publish(publish) => {
            put_string(&publish.topic, dst)?;
            if publish.qos != QoS::AtMostOnce {
                dst.put_u16(publish.message_id);
            }
            dst.put_slice(&publish.payload);
        }
        Message::PubAck(id) | Message::PubRec(id) | Message::PubComp(id) | Message::UnsubAck(id) => {
            dst.put_u16(*id)
        }
        Message::PubRel { message_id, .. } => dst.put_u16(*message_id),
        Message::Subscribe(subscribe) => {
            dst.put_u16(subscribe.message_id);
            for subscription in &subscribe.subscriptions {
                put_string(&subscription.topic, dst)?;
                dst.put_u8(subscription.qos as u8);
            }
        }
        Message::SubAck(suback) => {
            dst.put_u16(suback.message_id);
            for qos in &suback.granted_qos {
                dst.put_u8(*qos as u8);
            }
        }
        Message::Unsubscribe(unsubscribe) => {
            dst.put_u16(unsubscribe.message_id);
            for topic in &unsubscribe.topics {
                put_string(topic, dst)?;
            }
        }
        Message::PingReq | Message::PingResp | Message::Disconnect => {}
    }
    Ok(())
}

/// Serializes `message` into a fresh buffer.
pub fn encode_to_bytes(message: &Message) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_message(message, &mut buf)?;
    Ok(buf.freeze())
}

/// Parses a body whose header and remaining length have already been read.
pub fn decode_body(header: FixedHeader, mut body: Bytes) -> Result<Message, ProtocolError> {
    let message = match header.message_type {
        MessageType::Connect => Message::Connect(decode_connect(&mut body)?),
        MessageType::ConnAck => {
            expect_len(&body, 2, "CONNACK")?;
            body.advance(1);
            Message::ConnAck(ConnAckMessage {
                return_code: ConnectReturnCode::try_from(body.get_u8())?,
            })
        }
        MessageType::Publish => {
            let topic = read_string(&mut body, "PUBLISH topic")?;
            let message_id = if header.qos == QoS::AtMostOnce {
                0
            } else {
                read_u16(&mut body, "PUBLISH message id")?
            };
            Message::Publish(PublishMessage {
                topic,
                payload: body.split_off(0),
                qos: header.qos,
                retain: header.retain,
                duplicate: header.duplicate,
                message_id,
            })
        }
        MessageType::PubAck => Message::PubAck(read_id_only(&mut body, "PUBACK")?),
        MessageType::PubRec => Message::PubRec(read_id_only(&mut body, "PUBREC")?),
        MessageType::PubRel => Message::PubRel {
            message_id: read_id_only(&mut body, "PUBREL")?,
            duplicate: header.duplicate,
        },
        MessageType::PubComp => Message::PubComp(read_id_only(&mut body, "PUBCOMP")?),
        MessageType::UnsubAck => Message::UnsubAck(read_id_only(&mut body, "UNSUBACK")?),
        MessageType::Subscribe => {
            let message_id = read_u16(&mut body, "SUBSCRIBE message id")?;
            let mut subscriptions = Vec::new();
            while body.has_remaining() {
                let topic = read_string(&mut body, "SUBSCRIBE topic")?;
                let qos = QoS::try_from(read_u8(&mut body, "SUBSCRIBE qos")?)?;
                subscriptions.push(Subscription { topic, qos });
            }
            Message::Subscribe(SubscribeMessage {
                message_id,
                duplicate: header.duplicate,
                subscriptions,
            })
        }
        MessageType::SubAck => {
            let message_id = read_u16(&mut body, "SUBACK message id")?;
            let granted_qos = body
                .iter()
                .map(|byte| QoS::try_from(*byte))
                .collect::<Result<Vec<_>, _>>()?;
            Message::SubAck(SubAckMessage {
                message_id,
                granted_qos,
            })
        }
        MessageType::Unsubscribe => {
            let message_id = read_u16(&mut body, "UNSUBSCRIBE message id")?;
            let mut topics = Vec::new();
            while body.has_remaining() {
                topics.push(read_string(&mut body, "UNSUBSCRIBE topic")?);
            }
            Message::Unsubscribe(UnsubscribeMessage {
                message_id,
                duplicate: header.duplicate,
                topics,
            })
        }
        MessageType::PingReq => {
            expect_len(&body, 0, "PINGREQ")?;
            Message::PingReq
        }
        MessageType::PingResp => {
            expect_len(&body, 0, "PINGRESP")?;
            Message::PingResp
        }
        MessageType::Disconnect => {
            expect_len(&body, 0, "DISCONNECT")?;
            Message::Disconnect
        }
    };
    Ok(message)
}

/// Frame codec for `FramedRead`/`FramedWrite`.
///
/// Frames whose declared body exceeds `max_message_size` are rejected before
/// any body bytes are buffered.
#[derive(Debug, Clone, Copy)]
pub struct MessageCodec {
    max_message_size: usize,
}

impl MessageCodec {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size: max_message_size.min(MAX_REMAINING_LENGTH),
        }
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(MAX_REMAINING_LENGTH)
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = MqttError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, MqttError> {
        if src.len() < 2 {
            return Ok(None);
        }
        let Some((body_len, len_bytes)) = decode_remaining_length(&src[1..])? else {
            return Ok(None);
        };
        if body_len > self.max_message_size {
            return Err(ProtocolError::FrameTooLarge {
                declared: body_len,
                max: self.max_message_size,
            }
            .into());
        }
        let frame_len = 1 + len_bytes + body_len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let header = FixedHeader::from_byte(src[0])?;
        let mut frame = src.split_to(frame_len).freeze();
        frame.advance(1 + len_bytes);
        Ok(Some(decode_body(header, frame)?))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = MqttError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), MqttError> {
        let body_len = remaining_length(&item);
        if body_len > self.max_message_size {
            return Err(ProtocolError::FrameTooLarge {
                declared: body_len,
                max: self.max_message_size,
            }
            .into());
        }
        encode_message(&item, dst)?;
        Ok(())
    }
}

fn encode_connect(connect: &ConnectMessage, dst: &mut BytesMut) -> Result<(), ProtocolError> {
    put_string(&connect.protocol_name, dst)?;
    dst.put_u8(connect.protocol_version);

    let mut flags = 0u8;
    if connect.clean_session {
        flags |= 0x02;
    }
    if let Some(will) = &connect.will {
        flags |= 0x04 | ((will.qos as u8) << 3);
        if will.retain {
            flags |= 0x20;
        }
    }
    if connect.password.is_some() {
        flags |= 0x40;
    }
    if connect.username.is_some() {
        flags |= 0x80;
    }
    dst.put_u8(flags);
    dst.put_u16(connect.keep_alive_seconds);
    put_string(&connect.client_id, dst)?;

    if let Some(will) = &connect.will {
        put_string(&will.topic, dst)?;
        put_binary(&will.message, dst)?;
    }
    if let Some(username) = &connect.username {
        put_string(username, dst)?;
    }
    if let Some(password) = &connect.password {
        put_string(password, dst)?;
    }
    Ok(())
}

fn decode_connect(body: &mut Bytes) -> Result<ConnectMessage, ProtocolError> {
    let protocol_name = read_string(body, "CONNECT protocol name")?;
    let protocol_version = read_u8(body, "CONNECT protocol version")?;
    let flags = read_u8(body, "CONNECT flags")?;
    let keep_alive_seconds = read_u16(body, "CONNECT keep alive")?;
    let client_id = read_string(body, "CONNECT client id")?;

    let will = if flags & 0x04 != 0 {
        let topic = read_string(body, "CONNECT will topic")?;
        let message = read_binary(body, "CONNECT will message")?;
        Some(Will {
            topic,
            message,
            qos: QoS::try_from((flags >> 3) & 0x03)?,
            retain: flags & 0x20 != 0,
        })
    } else {
        None
    };
    let username = if flags & 0x80 != 0 {
        Some(read_string(body, "CONNECT username")?)
    } else {
        None
    };
    let password = if flags & 0x40 != 0 {
        Some(read_string(body, "CONNECT password")?)
    } else {
        None
    };

    Ok(ConnectMessage {
        protocol_name,
        protocol_version,
        clean_session: flags & 0x02 != 0,
        keep_alive_seconds,
        client_id,
        will,
        username,
        password,
    })
}

fn string_len(value: &str) -> usize {
    2 + value.len()
}

fn put_string(value: &str, dst: &mut BytesMut) -> Result<(), ProtocolError> {
    put_binary(value.as_bytes(), dst)
}

fn put_binary(value: &[u8], dst: &mut BytesMut) -> Result<(), ProtocolError> {
    let len = u16::try_from(value.len())
        .map_err(|_| ProtocolError::MalformedFrame(format!("field of {} bytes exceeds 65535", value.len())))?;
    dst.put_u16(len);
    dst.put_slice(value);
    Ok(())
}

fn read_u8(body: &mut Bytes, field: &'static str) -> Result<u8, ProtocolError> {
    if body.remaining() < 1 {
        return Err(truncated(field));
    }
    Ok(body.get_u8())
}

fn read_u16(body: &mut Bytes, field: &'static str) -> Result<u16, ProtocolError> {
    if body.remaining() < 2 {
        return Err(truncated(field));
    }
    Ok(body.get_u16())
}

fn read_binary(body: &mut Bytes, field: &'static str) -> Result<Bytes, ProtocolError> {
    let len = read_u16(body, field)? as usize;
    if body.remaining() < len {
        return Err(truncated(field));
    }
    Ok(body.split_to(len))
}

fn read_string(body: &mut Bytes, field: &'static str) -> Result<String, ProtocolError> {
    let raw = read_binary(body, field)?;
    String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8(field))
}

fn read_id_only(body: &mut Bytes, kind: &'static str) -> Result<u16, ProtocolError> {
    expect_len(body, 2, kind)?;
    Ok(body.get_u16())
}

fn expect_len(body: &Bytes, len: usize, kind: &'static str) -> Result<(), ProtocolError> {
    if body.len() != len {
        return Err(ProtocolError::MalformedFrame(format!(
            "{kind} body must be {len} bytes, got {}",
            body.len()
        )));
    }
    Ok(())
}

fn truncated(field: &'static str) -> ProtocolError {
    ProtocolError::MalformedFrame(format!("body ends inside {field}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Result<Option<Message>, MqttError> {
        let mut buf = BytesMut::from(bytes);
        MessageCodec::default().decode(&mut buf)
    }

    #[test]
    fn test_pubrel_wire_format() {
        let bytes = encode_to_bytes(&Message::pub_rel(1)).unwrap();
        assert_eq!(&bytes[..], &[0x62, 0x02, 0x00, 0x01]);

        let decoded = decode_all(&bytes).unwrap().unwrap();
        let header = decoded.fixed_header();
        assert_eq!(header.message_type, MessageType::PubRel);
        assert_eq!(header.qos, QoS::AtLeastOnce);
        assert!(!header.duplicate);
        assert!(!header.retain);
        assert_eq!(remaining_length(&decoded), 2);
        assert_eq!(decoded.message_id(), Some(1));
    }

    #[test]
    fn test_pubrel_every_id() {
        for id in 0..=u16::MAX {
            let bytes = encode_to_bytes(&Message::pub_rel(id)).unwrap();
            assert_eq!(&bytes[..], &[0x62, 0x02, (id >> 8) as u8, id as u8]);
            assert_eq!(decode_all(&bytes).unwrap().unwrap(), Message::pub_rel(id));
        }
    }

    #[test]
    fn test_fixed_two_byte_frames() {
        assert_eq!(&encode_to_bytes(&Message::PingReq).unwrap()[..], &[0xC0, 0x00]);
        assert_eq!(&encode_to_bytes(&Message::PingResp).unwrap()[..], &[0xD0, 0x00]);
        assert_eq!(&encode_to_bytes(&Message::Disconnect).unwrap()[..], &[0xE0, 0x00]);
    }

    #[test]
    fn test_connect_roundtrip_with_all_fields() {
        let mut connect = ConnectMessage::new("client-1", true, 300);
        connect.will = Some(Will {
            topic: "status/client-1".into(),
            message: Bytes::from_static(b"offline"),
            qos: QoS::AtLeastOnce,
            retain: true,
        });
        connect.username = Some("user".into());
        connect.password = Some("secret".into());
        let message = Message::Connect(connect);

        let bytes = encode_to_bytes(&message).unwrap();
        assert_eq!(bytes[0], 0x10);
        assert_eq!(&bytes[4..10], b"MQIsdp");
        assert_eq!(bytes[10], 3);
        assert_eq!(bytes[11], 0x02 | 0x04 | 0x08 | 0x20 | 0x40 | 0x80);

        assert_eq!(decode_all(&bytes).unwrap().unwrap(), message);
    }

    #[test]
    fn test_connack_return_code() {
        let decoded = decode_all(&[0x20, 0x02, 0x00, 0x02]).unwrap().unwrap();
        assert_eq!(
            decoded,
            Message::ConnAck(ConnAckMessage {
                return_code: ConnectReturnCode::IdentifierRejected
            })
        );
        assert!(decode_all(&[0x20, 0x02, 0x00, 0x09]).is_err());
    }

    #[test]
    fn test_publish_qos0_has_no_message_id() {
        let publish = PublishMessage::new("a/b", "hi", QoS::AtMostOnce);
        let bytes = encode_to_bytes(&Message::Publish(publish.clone())).unwrap();
        assert_eq!(&bytes[..], &[0x30, 0x07, 0x00, 0x03, b'a', b'/', b'b', b'h', b'i']);
        assert_eq!(decode_all(&bytes).unwrap().unwrap(), Message::Publish(publish));
    }

    #[test]
    fn test_publish_qos2_retain_dup() {
        let mut publish = PublishMessage::new("t", vec![1u8, 2, 3], QoS::ExactlyOnce).with_retain(true);
        publish.message_id = 0x1234;
        publish.duplicate = true;
        let bytes = encode_to_bytes(&Message::Publish(publish.clone())).unwrap();
        assert_eq!(bytes[0], 0x3D);
        assert_eq!(&bytes[5..7], &[0x12, 0x34]);
        assert_eq!(decode_all(&bytes).unwrap().unwrap(), Message::Publish(publish));
    }

    #[test]
    fn test_subscribe_and_suback() {
        let mut subscribe = SubscribeMessage::new(vec![
            Subscription::new("a/#", QoS::AtLeastOnce),
            Subscription::new("b/+", QoS::ExactlyOnce),
        ]);
        subscribe.message_id = 10;
        let bytes = encode_to_bytes(&Message::Subscribe(subscribe.clone())).unwrap();
        assert_eq!(bytes[0], 0x82);
        assert_eq!(decode_all(&bytes).unwrap().unwrap(), Message::Subscribe(subscribe));

        let suback = decode_all(&[0x90, 0x04, 0x00, 0x0A, 0x01, 0x02]).unwrap().unwrap();
        assert_eq!(
            suback,
            Message::SubAck(SubAckMessage {
                message_id: 10,
                granted_qos: vec![QoS::AtLeastOnce, QoS::ExactlyOnce]
            })
        );
    }

    #[test]
    fn test_unsubscribe_roundtrip() {
        let mut unsubscribe = UnsubscribeMessage::new(vec!["x".into(), "y/z".into()]);
        unsubscribe.message_id = 99;
        let message = Message::Unsubscribe(unsubscribe);
        let bytes = encode_to_bytes(&message).unwrap();
        assert_eq!(bytes[0], 0xA2);
        assert_eq!(decode_all(&bytes).unwrap().unwrap(), message);
    }

    #[test]
    fn test_truncated_frame_needs_more_bytes() {
        assert!(decode_all(&[0x62]).unwrap().is_none());
        assert!(decode_all(&[0x62, 0x02, 0x00]).unwrap().is_none());
        assert!(decode_all(&[0x30, 0x80]).unwrap().is_none());
    }

    #[test]
    fn test_decoder_leaves_following_frame_in_buffer() {
        let mut buf = BytesMut::from(&[0xC0, 0x00, 0x62, 0x02, 0x00][..]);
        let mut codec = MessageCodec::default();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::PingReq));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&[0x05]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::pub_rel(5)));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_five_byte_varint_is_malformed() {
        let err = decode_all(&[0x30, 0xFF, 0xFF, 0xFF, 0xFF, 0x7F]).unwrap_err();
        assert!(matches!(
            err,
            MqttError::Protocol(ProtocolError::RemainingLengthOverflow)
        ));
        let err = decode_all(&[0x30, 0xFF, 0xFF, 0xFF, 0xFF]).unwrap_err();
        assert!(matches!(
            err,
            MqttError::Protocol(ProtocolError::RemainingLengthOverflow)
        ));

        let mut buf = BytesMut::new();
        assert_eq!(
            encode_remaining_length(MAX_REMAINING_LENGTH + 1, &mut buf),
            Err(ProtocolError::RemainingLengthOverflow)
        );
    }

    #[test]
    fn test_varint_boundaries() {
        for (len, expected) in [
            (0usize, vec![0x00u8]),
            (127, vec![0x7F]),
            (128, vec![0x80, 0x01]),
            (16_383, vec![0xFF, 0x7F]),
            (16_384, vec![0x80, 0x80, 0x01]),
            (2_097_152, vec![0x80, 0x80, 0x80, 0x01]),
            (MAX_REMAINING_LENGTH, vec![0xFF, 0xFF, 0xFF, 0x7F]),
        ] {
            let mut buf = BytesMut::new();
            encode_remaining_length(len, &mut buf).unwrap();
            assert_eq!(&buf[..], &expected[..], "length {len}");
            assert_eq!(decode_remaining_length(&buf).unwrap(), Some((len, expected.len())));
        }
    }

    #[test]
    fn test_frame_ceiling() {
        let mut codec = MessageCodec::new(8);
        let mut buf = BytesMut::from(&[0x30, 0x09][..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            MqttError::Protocol(ProtocolError::FrameTooLarge { declared: 9, max: 8 })
        ));

        let mut out = BytesMut::new();
        let big = Message::Publish(PublishMessage::new("t", vec![0u8; 16], QoS::AtMostOnce));
        assert!(codec.encode(big, &mut out).is_err());
    }

    #[test]
    fn test_body_length_mismatch_is_malformed() {
        assert!(decode_all(&[0x40, 0x03, 0x00, 0x01, 0x00]).is_err());
        assert!(decode_all(&[0xC0, 0x01, 0x00]).is_err());
        assert!(decode_all(&[0x30, 0x03, 0x00, 0x05, b'a']).is_err());
    }

    #[test]
    fn test_invalid_utf8_topic() {
        let err = decode_all(&[0x30, 0x04, 0x00, 0x02, 0xC3, 0x28]).unwrap_err();
        assert!(matches!(err, MqttError::Protocol(ProtocolError::InvalidUtf8(_))));
    }
}
