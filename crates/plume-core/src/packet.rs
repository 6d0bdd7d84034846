//! MQTT packet types and codec for MQTT 3.1 and 3.1.1.
//!
//! Both directions are implemented for every packet type so the same codec
//! serves the broker and anything that needs to speak to it (bridge glue,
//! the integration tests).

use bytes::Bytes;

use crate::error::{ProtocolError, Result};

/// Protocol name / version pairs accepted in CONNECT.
pub const V311_MAGIC: &str = "MQTT";
pub const V311_VERSION: u8 = 4;
pub const V3_MAGIC: &str = "MQIsdp";
pub const V3_VERSION: u8 = 3;

/// MQTT Control Packet Types (4 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    Connack = 2,
    Publish = 3,
    Puback = 4,
    Pubrec = 5,
    Pubrel = 6,
    Pubcomp = 7,
    Subscribe = 8,
    Suback = 9,
    Unsubscribe = 10,
    Unsuback = 11,
    Pingreq = 12,
    Pingresp = 13,
    Disconnect = 14,
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::Connack),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::Puback),
            5 => Ok(PacketType::Pubrec),
            6 => Ok(PacketType::Pubrel),
            7 => Ok(PacketType::Pubcomp),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::Suback),
            10 => Ok(PacketType::Unsubscribe),
            11 => Ok(PacketType::Unsuback),
            12 => Ok(PacketType::Pingreq),
            13 => Ok(PacketType::Pingresp),
            14 => Ok(PacketType::Disconnect),
            _ => Err(ProtocolError::InvalidPacketType(value)),
        }
    }
}

/// Quality of Service levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(ProtocolError::MalformedPacket(format!(
                "Invalid QoS: {}",
                value
            ))),
        }
    }
}

/// CONNACK return codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnackCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUsernamePassword = 4,
    NotAuthorized = 5,
}

impl TryFrom<u8> for ConnackCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(ConnackCode::Accepted),
            1 => Ok(ConnackCode::UnacceptableProtocolVersion),
            2 => Ok(ConnackCode::IdentifierRejected),
            3 => Ok(ConnackCode::ServerUnavailable),
            4 => Ok(ConnackCode::BadUsernamePassword),
            5 => Ok(ConnackCode::NotAuthorized),
            _ => Err(ProtocolError::MalformedPacket(format!(
                "Invalid CONNACK return code: {}",
                value
            ))),
        }
    }
}

/// MQTT Packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    Connack(Connack),
    Publish(Publish),
    Puback { packet_id: u16 },
    Pubrec { packet_id: u16 },
    Pubrel { packet_id: u16 },
    Pubcomp { packet_id: u16 },
    Subscribe(Subscribe),
    Suback(Suback),
    Unsubscribe(Unsubscribe),
    Unsuback(Unsuback),
    Pingreq,
    Pingresp,
    Disconnect,
}

/// CONNECT packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub protocol_name: String,
    pub protocol_version: u8,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

/// Will message configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub message: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// CONNACK packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connack {
    pub session_present: bool,
    pub code: ConnackCode,
}

/// PUBLISH packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: Bytes,
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

impl Publish {
    /// Topic as a str. Topics are validated as UTF-8 at decode time.
    pub fn topic_str(&self) -> &str {
        std::str::from_utf8(&self.topic).unwrap_or("")
    }
}

/// SUBSCRIBE packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    /// Topic filters with their requested QoS.
    pub topics: Vec<(String, QoS)>,
}

/// SUBACK packet data. One return code per requested filter,
/// 0x00-0x02 = granted QoS, 0x80 = failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suback {
    pub packet_id: u16,
    pub return_codes: Vec<u8>,
}

/// UNSUBSCRIBE packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub topics: Vec<String>,
}

/// UNSUBACK packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsuback {
    pub packet_id: u16,
}

/// Cursor over a packet body.
struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn read_u8(&mut self) -> Result<u8> {
        if self.pos >= self.buf.len() {
            return Err(ProtocolError::IncompletePacket { needed: 1, have: 0 }.into());
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(b)
    }

    fn read_u16(&mut self) -> Result<u16> {
        if self.remaining() < 2 {
            return Err(ProtocolError::IncompletePacket {
                needed: 2,
                have: self.remaining(),
            }
            .into());
        }
        let val = u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(val)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(ProtocolError::IncompletePacket {
                needed: len,
                have: self.remaining(),
            }
            .into());
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        let bytes = self.read_bytes(len)?;
        // MQTT-1.5.3-2: UTF-8 string MUST NOT contain null character U+0000
        if bytes.contains(&0u8) {
            return Err(ProtocolError::MalformedPacket(
                "UTF-8 string must not contain null character".into(),
            )
            .into());
        }
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8.into())
    }

    fn read_binary(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u16()? as usize;
        let bytes = self.read_bytes(len)?;
        Ok(bytes.to_vec())
    }
}

/// Decode the remaining length field (variable byte integer, up to 4 bytes,
/// 7 bits each plus a continuation bit).
/// Returns (length, bytes_consumed) or None if more bytes are needed.
pub fn decode_remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>> {
    let mut multiplier = 1usize;
    let mut value = 0usize;

    for (i, &byte) in buf.iter().enumerate() {
        value += ((byte & 0x7F) as usize) * multiplier;

        if multiplier > 128 * 128 * 128 {
            return Err(ProtocolError::InvalidRemainingLength.into());
        }

        if (byte & 0x80) == 0 {
            return Ok(Some((value, i + 1)));
        }

        multiplier *= 128;
    }

    // Need more bytes
    Ok(None)
}

/// Encode a remaining length into the buffer.
pub fn encode_remaining_length(mut len: usize, buf: &mut Vec<u8>) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if len == 0 {
            break;
        }
    }
}

/// Try to decode a complete packet from the buffer.
/// Returns Ok(Some((packet, bytes_consumed))) on success, Ok(None) when more
/// data is needed, Err on protocol errors.
///
/// `max_packet_size` bounds the total packet length (0 = no limit); oversize
/// packets fail after the fixed header without consuming the body.
pub fn decode_packet(buf: &[u8], max_packet_size: usize) -> Result<Option<(Packet, usize)>> {
    if buf.is_empty() {
        return Ok(None);
    }

    let fixed_header = buf[0];
    let packet_type_raw = fixed_header >> 4;
    let flags = fixed_header & 0x0F;

    let Some((remaining_len, len_bytes)) = decode_remaining_length(&buf[1..])? else {
        return Ok(None);
    };

    let header_len = 1 + len_bytes;
    let total_len = header_len + remaining_len;

    if max_packet_size > 0 && total_len > max_packet_size {
        return Err(ProtocolError::PacketTooLarge {
            size: total_len,
            max: max_packet_size,
        }
        .into());
    }

    if buf.len() < total_len {
        return Ok(None);
    }

    let packet_type = PacketType::try_from(packet_type_raw)?;
    let body = &buf[header_len..total_len];

    // MQTT-3.6.1-1 / MQTT-3.8.1-1 / MQTT-3.10.1-1: fixed header flags of
    // PUBREL, SUBSCRIBE and UNSUBSCRIBE MUST be 0010.
    match packet_type {
        PacketType::Subscribe | PacketType::Unsubscribe | PacketType::Pubrel => {
            if flags != 0x02 {
                return Err(ProtocolError::MalformedPacket(format!(
                    "{:?} fixed header flags must be 0x02, got {:#04x}",
                    packet_type, flags
                ))
                .into());
            }
        }
        _ => {}
    }

    let packet = match packet_type {
        PacketType::Connect => decode_connect(body)?,
        PacketType::Connack => decode_connack(body)?,
        PacketType::Publish => decode_publish(flags, body)?,
        PacketType::Puback => Packet::Puback {
            packet_id: decode_packet_id(body)?,
        },
        PacketType::Pubrec => Packet::Pubrec {
            packet_id: decode_packet_id(body)?,
        },
        PacketType::Pubrel => Packet::Pubrel {
            packet_id: decode_packet_id(body)?,
        },
        PacketType::Pubcomp => Packet::Pubcomp {
            packet_id: decode_packet_id(body)?,
        },
        PacketType::Subscribe => decode_subscribe(body)?,
        PacketType::Suback => decode_suback(body)?,
        PacketType::Unsubscribe => decode_unsubscribe(body)?,
        PacketType::Unsuback => Packet::Unsuback(Unsuback {
            packet_id: decode_packet_id(body)?,
        }),
        PacketType::Pingreq => Packet::Pingreq,
        PacketType::Pingresp => Packet::Pingresp,
        PacketType::Disconnect => Packet::Disconnect,
    };

    Ok(Some((packet, total_len)))
}

fn decode_packet_id(body: &[u8]) -> Result<u16> {
    Decoder::new(body).read_u16()
}

fn decode_connect(body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);

    let protocol_name = dec.read_string()?;
    let protocol_version = dec.read_u8()?;

    // "MQTT" must carry version 4, "MQIsdp" version 3.
    match (protocol_name.as_str(), protocol_version) {
        (V311_MAGIC, V311_VERSION) | (V3_MAGIC, V3_VERSION) => {}
        (V311_MAGIC, v) | (V3_MAGIC, v) => {
            return Err(ProtocolError::UnsupportedProtocolVersion(v).into());
        }
        _ => return Err(ProtocolError::InvalidProtocolName(protocol_name).into()),
    }

    let flags = dec.read_u8()?;
    let clean_session = (flags & 0x02) != 0;
    let will_flag = (flags & 0x04) != 0;
    let will_qos = QoS::try_from((flags >> 3) & 0x03)?;
    let will_retain = (flags & 0x20) != 0;
    let password_flag = (flags & 0x40) != 0;
    let username_flag = (flags & 0x80) != 0;

    // Reserved bit must be 0
    if (flags & 0x01) != 0 {
        return Err(ProtocolError::InvalidConnectFlags(flags).into());
    }

    // MQTT-3.1.2-11/13: If Will Flag is 0, Will QoS MUST be 0
    if !will_flag && will_qos != QoS::AtMostOnce {
        return Err(
            ProtocolError::MalformedPacket("Will QoS must be 0 when Will Flag is 0".into()).into(),
        );
    }

    // MQTT-3.1.2-15: If Will Flag is 0, Will Retain MUST be 0
    if !will_flag && will_retain {
        return Err(ProtocolError::MalformedPacket(
            "Will Retain must be 0 when Will Flag is 0".into(),
        )
        .into());
    }

    // MQTT-3.1.2-22: If Username Flag is 0, Password Flag MUST be 0
    if !username_flag && password_flag {
        return Err(ProtocolError::MalformedPacket(
            "Password Flag must be 0 when Username Flag is 0".into(),
        )
        .into());
    }

    let keep_alive = dec.read_u16()?;
    let client_id = dec.read_string()?;

    let will = if will_flag {
        let topic = dec.read_string()?;
        let message = dec.read_binary()?;
        Some(Will {
            topic,
            message,
            qos: will_qos,
            retain: will_retain,
        })
    } else {
        None
    };

    let username = if username_flag {
        Some(dec.read_string()?)
    } else {
        None
    };

    let password = if password_flag {
        Some(dec.read_binary()?)
    } else {
        None
    };

    Ok(Packet::Connect(Connect {
        protocol_name,
        protocol_version,
        clean_session,
        keep_alive,
        client_id,
        will,
        username,
        password,
    }))
}

fn decode_connack(body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);
    let ack_flags = dec.read_u8()?;
    let code = ConnackCode::try_from(dec.read_u8()?)?;
    Ok(Packet::Connack(Connack {
        session_present: (ack_flags & 0x01) != 0,
        code,
    }))
}

fn decode_publish(flags: u8, body: &[u8]) -> Result<Packet> {
    let dup = (flags & 0x08) != 0;
    let qos = QoS::try_from((flags >> 1) & 0x03)?;
    let retain = (flags & 0x01) != 0;

    let mut dec = Decoder::new(body);
    let topic = dec.read_string()?;

    if topic.is_empty() {
        return Err(ProtocolError::MalformedPacket("empty topic name".into()).into());
    }

    let packet_id = if qos != QoS::AtMostOnce {
        let id = dec.read_u16()?;
        // MQTT-2.3.1-1: packet identifier MUST be non-zero
        if id == 0 {
            return Err(ProtocolError::MalformedPacket("zero packet identifier".into()).into());
        }
        Some(id)
    } else {
        None
    };

    let payload = dec.read_bytes(dec.remaining())?;

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain,
        topic: Bytes::copy_from_slice(topic.as_bytes()),
        packet_id,
        payload: Bytes::copy_from_slice(payload),
    }))
}

fn decode_subscribe(body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);
    let packet_id = dec.read_u16()?;

    let mut topics = Vec::new();
    while dec.remaining() > 0 {
        let topic = dec.read_string()?;

        // MQTT-4.7.3-1: topic filters must be at least one character
        if topic.is_empty() {
            return Err(ProtocolError::MalformedPacket("empty topic filter".into()).into());
        }

        let qos = QoS::try_from(dec.read_u8()?)?;
        topics.push((topic, qos));
    }

    // MQTT-3.8.3-3: SUBSCRIBE must contain at least one filter
    if topics.is_empty() {
        return Err(ProtocolError::MalformedPacket("SUBSCRIBE with no topics".into()).into());
    }

    Ok(Packet::Subscribe(Subscribe { packet_id, topics }))
}

fn decode_suback(body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);
    let packet_id = dec.read_u16()?;
    let return_codes = dec.read_bytes(dec.remaining())?.to_vec();
    Ok(Packet::Suback(Suback {
        packet_id,
        return_codes,
    }))
}

fn decode_unsubscribe(body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);
    let packet_id = dec.read_u16()?;

    let mut topics = Vec::new();
    while dec.remaining() > 0 {
        let topic = dec.read_string()?;
        if topic.is_empty() {
            return Err(ProtocolError::MalformedPacket("empty topic filter".into()).into());
        }
        topics.push(topic);
    }

    if topics.is_empty() {
        return Err(ProtocolError::MalformedPacket("UNSUBSCRIBE with no topics".into()).into());
    }

    Ok(Packet::Unsubscribe(Unsubscribe { packet_id, topics }))
}

/// Encode a packet into the provided buffer.
pub fn encode_packet(packet: &Packet, buf: &mut Vec<u8>) {
    match packet {
        Packet::Connect(connect) => encode_connect(connect, buf),
        Packet::Connack(connack) => encode_connack(connack, buf),
        Packet::Publish(publish) => encode_publish(publish, buf),
        Packet::Puback { packet_id } => encode_simple_ack(PacketType::Puback, *packet_id, buf),
        Packet::Pubrec { packet_id } => encode_simple_ack(PacketType::Pubrec, *packet_id, buf),
        Packet::Pubrel { packet_id } => encode_pubrel(*packet_id, buf),
        Packet::Pubcomp { packet_id } => encode_simple_ack(PacketType::Pubcomp, *packet_id, buf),
        Packet::Subscribe(subscribe) => encode_subscribe(subscribe, buf),
        Packet::Suback(suback) => encode_suback(suback, buf),
        Packet::Unsubscribe(unsubscribe) => encode_unsubscribe(unsubscribe, buf),
        Packet::Unsuback(unsuback) => encode_simple_ack(PacketType::Unsuback, unsuback.packet_id, buf),
        Packet::Pingreq => encode_empty(PacketType::Pingreq, buf),
        Packet::Pingresp => encode_empty(PacketType::Pingresp, buf),
        Packet::Disconnect => encode_empty(PacketType::Disconnect, buf),
    }
}

fn write_string(s: &str, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&(s.len() as u16).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn encode_connect(connect: &Connect, buf: &mut Vec<u8>) {
    let mut body = Vec::new();

    write_string(&connect.protocol_name, &mut body);
    body.push(connect.protocol_version);

    let mut flags = 0u8;
    if connect.clean_session {
        flags |= 0x02;
    }
    if let Some(ref will) = connect.will {
        flags |= 0x04;
        flags |= (will.qos as u8) << 3;
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
    body.push(flags);

    body.extend_from_slice(&connect.keep_alive.to_be_bytes());
    write_string(&connect.client_id, &mut body);

    if let Some(ref will) = connect.will {
        write_string(&will.topic, &mut body);
        body.extend_from_slice(&(will.message.len() as u16).to_be_bytes());
        body.extend_from_slice(&will.message);
    }

    if let Some(ref username) = connect.username {
        write_string(username, &mut body);
    }

    if let Some(ref password) = connect.password {
        body.extend_from_slice(&(password.len() as u16).to_be_bytes());
        body.extend_from_slice(password);
    }

    buf.push((PacketType::Connect as u8) << 4);
    encode_remaining_length(body.len(), buf);
    buf.extend_from_slice(&body);
}

fn encode_connack(connack: &Connack, buf: &mut Vec<u8>) {
    buf.push((PacketType::Connack as u8) << 4);
    buf.push(2); // Remaining length
    buf.push(if connack.session_present { 1 } else { 0 });
    buf.push(connack.code as u8);
}

/// Encode a PUBLISH packet.
pub fn encode_publish(publish: &Publish, buf: &mut Vec<u8>) {
    let mut fixed_header = (PacketType::Publish as u8) << 4;
    if publish.dup {
        fixed_header |= 0x08;
    }
    fixed_header |= (publish.qos as u8) << 1;
    if publish.retain {
        fixed_header |= 0x01;
    }
    buf.push(fixed_header);

    let topic_len = 2 + publish.topic.len();
    let packet_id_len = if publish.qos != QoS::AtMostOnce { 2 } else { 0 };
    let remaining = topic_len + packet_id_len + publish.payload.len();

    encode_remaining_length(remaining, buf);

    buf.extend_from_slice(&(publish.topic.len() as u16).to_be_bytes());
    buf.extend_from_slice(&publish.topic);

    if publish.qos != QoS::AtMostOnce {
        buf.extend_from_slice(&publish.packet_id.unwrap_or(0).to_be_bytes());
    }

    buf.extend_from_slice(&publish.payload);
}

fn encode_simple_ack(packet_type: PacketType, packet_id: u16, buf: &mut Vec<u8>) {
    buf.push((packet_type as u8) << 4);
    buf.push(2); // Remaining length
    buf.extend_from_slice(&packet_id.to_be_bytes());
}

fn encode_pubrel(packet_id: u16, buf: &mut Vec<u8>) {
    // PUBREL has fixed header flags of 0x02
    buf.push(((PacketType::Pubrel as u8) << 4) | 0x02);
    buf.push(2); // Remaining length
    buf.extend_from_slice(&packet_id.to_be_bytes());
}

fn encode_subscribe(subscribe: &Subscribe, buf: &mut Vec<u8>) {
    let mut body = Vec::new();
    body.extend_from_slice(&subscribe.packet_id.to_be_bytes());
    for (topic, qos) in &subscribe.topics {
        write_string(topic, &mut body);
        body.push(*qos as u8);
    }

    buf.push(((PacketType::Subscribe as u8) << 4) | 0x02);
    encode_remaining_length(body.len(), buf);
    buf.extend_from_slice(&body);
}

fn encode_suback(suback: &Suback, buf: &mut Vec<u8>) {
    buf.push((PacketType::Suback as u8) << 4);
    encode_remaining_length(2 + suback.return_codes.len(), buf);
    buf.extend_from_slice(&suback.packet_id.to_be_bytes());
    buf.extend_from_slice(&suback.return_codes);
}

fn encode_unsubscribe(unsubscribe: &Unsubscribe, buf: &mut Vec<u8>) {
    let mut body = Vec::new();
    body.extend_from_slice(&unsubscribe.packet_id.to_be_bytes());
    for topic in &unsubscribe.topics {
        write_string(topic, &mut body);
    }

    buf.push(((PacketType::Unsubscribe as u8) << 4) | 0x02);
    encode_remaining_length(body.len(), buf);
    buf.extend_from_slice(&body);
}

fn encode_empty(packet_type: PacketType, buf: &mut Vec<u8>) {
    buf.push((packet_type as u8) << 4);
    buf.push(0); // Remaining length
}

// === Topic Validation ===

/// Validate a topic name or filter against length and depth limits
/// (0 = no limit). Early-exits on a depth violation.
#[inline]
pub fn validate_topic(topic: &[u8], max_length: usize, max_levels: usize) -> Result<()> {
    if max_length > 0 && topic.len() > max_length {
        return Err(ProtocolError::MalformedPacket(format!(
            "topic too long: {} bytes (max {})",
            topic.len(),
            max_length
        ))
        .into());
    }

    if max_levels > 0 {
        let mut levels = 1usize;
        for &b in topic {
            if b == b'/' {
                levels += 1;
                if levels > max_levels {
                    return Err(ProtocolError::MalformedPacket(format!(
                        "topic too deep: {} levels (max {})",
                        levels, max_levels
                    ))
                    .into());
                }
            }
        }
    }

    Ok(())
}

/// Validate the wildcard placement of a topic filter.
/// '#' may appear only as the final token; '+' must occupy a whole token.
pub fn validate_filter(filter: &str) -> Result<()> {
    if filter.is_empty() {
        return Err(ProtocolError::MalformedPacket("empty topic filter".into()).into());
    }

    let tokens: Vec<&str> = filter.split('/').collect();
    for (i, token) in tokens.iter().enumerate() {
        if token.contains('#') {
            // MQTT-4.7.1-2: '#' must be the last level, alone
            if *token != "#" || i != tokens.len() - 1 {
                return Err(ProtocolError::MalformedPacket(format!(
                    "invalid '#' placement in filter {:?}",
                    filter
                ))
                .into());
            }
        } else if token.contains('+') && *token != "+" {
            // MQTT-4.7.1-3: '+' must occupy an entire level
            return Err(ProtocolError::MalformedPacket(format!(
                "invalid '+' placement in filter {:?}",
                filter
            ))
            .into());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(packet: Packet) {
        let mut buf = Vec::new();
        encode_packet(&packet, &mut buf);
        let (decoded, consumed) = decode_packet(&buf, 0).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_round_trip_connect() {
        round_trip(Packet::Connect(Connect {
            protocol_name: "MQTT".into(),
            protocol_version: 4,
            clean_session: true,
            keep_alive: 60,
            client_id: "test-client".into(),
            will: None,
            username: None,
            password: None,
        }));
    }

    #[test]
    fn test_round_trip_connect_full() {
        round_trip(Packet::Connect(Connect {
            protocol_name: "MQTT".into(),
            protocol_version: 4,
            clean_session: false,
            keep_alive: 30,
            client_id: "c1".into(),
            will: Some(Will {
                topic: "bye".into(),
                message: b"gone".to_vec(),
                qos: QoS::AtLeastOnce,
                retain: true,
            }),
            username: Some("user".into()),
            password: Some(b"secret".to_vec()),
        }));
    }

    #[test]
    fn test_round_trip_connect_v3() {
        round_trip(Packet::Connect(Connect {
            protocol_name: "MQIsdp".into(),
            protocol_version: 3,
            clean_session: true,
            keep_alive: 10,
            client_id: "legacy".into(),
            will: None,
            username: None,
            password: None,
        }));
    }

    #[test]
    fn test_round_trip_connack() {
        round_trip(Packet::Connack(Connack {
            session_present: true,
            code: ConnackCode::Accepted,
        }));
        round_trip(Packet::Connack(Connack {
            session_present: false,
            code: ConnackCode::IdentifierRejected,
        }));
    }

    #[test]
    fn test_round_trip_publish() {
        round_trip(Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: Bytes::from_static(b"a/x/c"),
            packet_id: None,
            payload: Bytes::from_static(b"hi"),
        }));
        round_trip(Packet::Publish(Publish {
            dup: true,
            qos: QoS::ExactlyOnce,
            retain: true,
            topic: Bytes::from_static(b"z"),
            packet_id: Some(3),
            payload: Bytes::from_static(b"x"),
        }));
    }

    #[test]
    fn test_round_trip_acks() {
        round_trip(Packet::Puback { packet_id: 17 });
        round_trip(Packet::Pubrec { packet_id: 1 });
        round_trip(Packet::Pubrel { packet_id: 65535 });
        round_trip(Packet::Pubcomp { packet_id: 9 });
        round_trip(Packet::Unsuback(Unsuback { packet_id: 2 }));
    }

    #[test]
    fn test_round_trip_subscribe() {
        round_trip(Packet::Subscribe(Subscribe {
            packet_id: 5,
            topics: vec![
                ("a/+/c".into(), QoS::AtMostOnce),
                ("t".into(), QoS::AtLeastOnce),
                ("z/#".into(), QoS::ExactlyOnce),
            ],
        }));
        round_trip(Packet::Suback(Suback {
            packet_id: 5,
            return_codes: vec![0, 1, 0x80],
        }));
    }

    #[test]
    fn test_round_trip_unsubscribe() {
        round_trip(Packet::Unsubscribe(Unsubscribe {
            packet_id: 7,
            topics: vec!["a/b".into(), "c".into()],
        }));
    }

    #[test]
    fn test_round_trip_empty_packets() {
        round_trip(Packet::Pingreq);
        round_trip(Packet::Pingresp);
        round_trip(Packet::Disconnect);
    }

    #[test]
    fn test_incomplete_packet_returns_none() {
        let mut buf = Vec::new();
        encode_packet(
            &Packet::Publish(Publish {
                dup: false,
                qos: QoS::AtMostOnce,
                retain: false,
                topic: Bytes::from_static(b"topic"),
                packet_id: None,
                payload: Bytes::from_static(b"payload"),
            }),
            &mut buf,
        );

        for cut in 0..buf.len() {
            assert!(decode_packet(&buf[..cut], 0).unwrap().is_none());
        }
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut buf = Vec::new();
        encode_packet(
            &Packet::Connect(Connect {
                protocol_name: "MQXX".into(),
                protocol_version: 4,
                clean_session: true,
                keep_alive: 0,
                client_id: "c".into(),
                will: None,
                username: None,
                password: None,
            }),
            &mut buf,
        );
        assert!(matches!(
            decode_packet(&buf, 0),
            Err(crate::Error::Protocol(ProtocolError::InvalidProtocolName(_)))
        ));
    }

    #[test]
    fn test_version_mismatch_rejected() {
        // "MQTT" with version byte 3 is a protocol error
        let mut buf = Vec::new();
        encode_packet(
            &Packet::Connect(Connect {
                protocol_name: "MQTT".into(),
                protocol_version: 3,
                clean_session: true,
                keep_alive: 0,
                client_id: "c".into(),
                will: None,
                username: None,
                password: None,
            }),
            &mut buf,
        );
        assert!(matches!(
            decode_packet(&buf, 0),
            Err(crate::Error::Protocol(
                ProtocolError::UnsupportedProtocolVersion(3)
            ))
        ));
    }

    #[test]
    fn test_oversize_packet_rejected() {
        let mut buf = Vec::new();
        encode_packet(
            &Packet::Publish(Publish {
                dup: false,
                qos: QoS::AtMostOnce,
                retain: false,
                topic: Bytes::from_static(b"t"),
                packet_id: None,
                payload: Bytes::from(vec![0u8; 1024]),
            }),
            &mut buf,
        );
        // Limit below the encoded size fails even with a partial buffer
        assert!(matches!(
            decode_packet(&buf[..4], 128),
            Err(crate::Error::Protocol(ProtocolError::PacketTooLarge { .. }))
        ));
    }

    #[test]
    fn test_subscribe_flags_enforced() {
        let mut buf = Vec::new();
        encode_packet(
            &Packet::Subscribe(Subscribe {
                packet_id: 1,
                topics: vec![("a".into(), QoS::AtMostOnce)],
            }),
            &mut buf,
        );
        buf[0] = (PacketType::Subscribe as u8) << 4; // clear required 0x02 flags
        assert!(decode_packet(&buf, 0).is_err());
    }

    #[test]
    fn test_zero_packet_id_rejected() {
        let mut buf = Vec::new();
        encode_packet(
            &Packet::Publish(Publish {
                dup: false,
                qos: QoS::AtLeastOnce,
                retain: false,
                topic: Bytes::from_static(b"t"),
                packet_id: Some(0),
                payload: Bytes::new(),
            }),
            &mut buf,
        );
        assert!(decode_packet(&buf, 0).is_err());
    }

    #[test]
    fn test_remaining_length_boundaries() {
        for len in [0usize, 127, 128, 16383, 16384, 2097151, 2097152] {
            let mut buf = Vec::new();
            encode_remaining_length(len, &mut buf);
            let (decoded, consumed) = decode_remaining_length(&buf).unwrap().unwrap();
            assert_eq!(decoded, len);
            assert_eq!(consumed, buf.len());
        }
    }

    #[test]
    fn test_remaining_length_overlong_rejected() {
        // Five continuation bytes exceed the four byte maximum
        let buf = [0x80u8, 0x80, 0x80, 0x80, 0x01];
        assert!(decode_remaining_length(&buf).is_err());
    }

    #[test]
    fn test_remaining_length_incomplete() {
        assert!(decode_remaining_length(&[0x80]).unwrap().is_none());
    }

    #[test]
    fn test_validate_filter() {
        assert!(validate_filter("a/+/c").is_ok());
        assert!(validate_filter("#").is_ok());
        assert!(validate_filter("a/#").is_ok());
        assert!(validate_filter("+").is_ok());
        assert!(validate_filter("").is_err());
        assert!(validate_filter("a/#/b").is_err());
        assert!(validate_filter("a/b#").is_err());
        assert!(validate_filter("a+/b").is_err());
    }

    #[test]
    fn test_validate_topic_limits() {
        assert!(validate_topic(b"a/b/c", 0, 0).is_ok());
        assert!(validate_topic(b"a/b/c", 5, 3).is_ok());
        assert!(validate_topic(b"a/b/c", 4, 0).is_err());
        assert!(validate_topic(b"a/b/c", 0, 2).is_err());
    }

    #[test]
    fn test_null_in_string_rejected() {
        // Hand-built CONNECT with a null byte inside the client id
        let mut buf = vec![0x10];
        let body: &[u8] = &[
            0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 0x3c, // header
            0x00, 0x03, b'a', 0x00, b'b', // client id "a\0b"
        ];
        encode_remaining_length(body.len(), &mut buf);
        buf.extend_from_slice(body);
        assert!(decode_packet(&buf, 0).is_err());
    }
}
