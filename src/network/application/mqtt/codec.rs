//! MQTT 3.1.1 packet encoding and decoding.
//!
//! Encoders append one complete packet (fixed header, variable header and
//! payload) to a caller supplied `Vec<u8>`. Decoders work on the packet body,
//! i.e. the bytes that follow the fixed header, and borrow from it.

use heapless::Vec as HVec;

/// MQTT protocol name from MQTT 3.1.1.
pub const PROTOCOL_NAME: &[u8] = b"MQTT";
/// MQTT protocol level for version 3.1.1.
pub const PROTOCOL_LEVEL: u8 = 4;
/// Largest value the remaining length field can carry (four bytes).
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;
/// SUBACK return code for a refused topic filter.
pub const SUBACK_FAILURE: u8 = 0x80;

const DUP_FLAG: u8 = 0x08;

/// Errors produced while encoding or decoding packets.
#[derive(Debug, PartialEq, Eq, Clone, Copy, thiserror::Error)]
pub enum CodecError {
    /// The remaining length field used more than four bytes.
    #[error("malformed remaining length")]
    MalformedRemainingLength,
    /// A packet is larger than the configured or protocol limit.
    #[error("packet of {size} bytes exceeds the limit of {max}")]
    PacketTooLarge {
        /// Size of the offending packet body.
        size: usize,
        /// The limit that was exceeded.
        max: usize,
    },
    /// A packet body is shorter than its fields require, or has trailing garbage.
    #[error("malformed packet")]
    MalformedPacket,
    /// A string field is not valid UTF-8.
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    /// Reserved QoS value 3, or any other out of range value.
    #[error("invalid QoS value {0}")]
    InvalidQoS(u8),
    /// A string field is longer than 65535 bytes.
    #[error("string of {0} bytes does not fit a length prefix")]
    StringTooLong(usize),
    /// The first header byte names a reserved packet type.
    #[error("unknown packet type in header byte {0:#04x}")]
    UnknownPacketType(u8),
}

#[cfg(feature = "defmt")]
impl defmt::Format for CodecError {
    fn format(&self, f: defmt::Formatter) {
        match self {
            CodecError::MalformedRemainingLength => defmt::write!(f, "MalformedRemainingLength"),
            CodecError::PacketTooLarge { size, max } => {
                defmt::write!(f, "PacketTooLarge({}, {})", size, max)
            }
            CodecError::MalformedPacket => defmt::write!(f, "MalformedPacket"),
            CodecError::InvalidUtf8 => defmt::write!(f, "InvalidUtf8"),
            CodecError::InvalidQoS(q) => defmt::write!(f, "InvalidQoS({})", q),
            CodecError::StringTooLong(n) => defmt::write!(f, "StringTooLong({})", n),
            CodecError::UnknownPacketType(b) => defmt::write!(f, "UnknownPacketType({})", b),
        }
    }
}

/// MQTT control packet types (the high nibble of the first header byte).
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub enum PacketType {
    /// Client request to connect to Server
    Connect = 1,
    /// Connect acknowledgment
    ConnAck = 2,
    /// Publish message
    Publish = 3,
    /// Publish acknowledgment
    PubAck = 4,
    /// Publish received (assured delivery part 1)
    PubRec = 5,
    /// Publish release (assured delivery part 2)
    PubRel = 6,
    /// Publish complete (assured delivery part 3)
    PubComp = 7,
    /// Client subscribe request
    Subscribe = 8,
    /// Subscribe acknowledgment
    SubAck = 9,
    /// Client unsubscribe request
    Unsubscribe = 10,
    /// Unsubscribe acknowledgment
    UnsubAck = 11,
    /// Ping request
    PingReq = 12,
    /// Ping response
    PingResp = 13,
    /// Client disconnect request
    Disconnect = 14,
}

impl PacketType {
    /// Packet type encoded in the first byte of a fixed header.
    pub const fn from_header(byte: u8) -> Option<Self> {
        match byte >> 4 {
            1 => Some(PacketType::Connect),
            2 => Some(PacketType::ConnAck),
            3 => Some(PacketType::Publish),
            4 => Some(PacketType::PubAck),
            5 => Some(PacketType::PubRec),
            6 => Some(PacketType::PubRel),
            7 => Some(PacketType::PubComp),
            8 => Some(PacketType::Subscribe),
            9 => Some(PacketType::SubAck),
            10 => Some(PacketType::Unsubscribe),
            11 => Some(PacketType::UnsubAck),
            12 => Some(PacketType::PingReq),
            13 => Some(PacketType::PingResp),
            14 => Some(PacketType::Disconnect),
            _ => None,
        }
    }

    /// First header byte with the flags MQTT 3.1.1 mandates for this type.
    ///
    /// PUBLISH flags are per packet and are not included.
    pub const fn header(self) -> u8 {
        let flags = match self {
            PacketType::PubRel | PacketType::Subscribe | PacketType::Unsubscribe => 0x02,
            _ => 0x00,
        };
        ((self as u8) << 4) | flags
    }
}

/// Quality of Service levels for MQTT messages.
///
/// ```rust
/// use libiot_mqtt::network::application::mqtt::QoS;
///
/// assert_eq!(QoS::AtMostOnce as u8, 0);
/// assert_eq!(QoS::try_from(2), Ok(QoS::ExactlyOnce));
/// assert!(QoS::try_from(3).is_err());
/// ```
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum QoS {
    /// **QoS 0**: At most once delivery.
    AtMostOnce = 0,
    /// **QoS 1**: At least once delivery; duplicates can occur.
    AtLeastOnce = 1,
    /// **QoS 2**: Exactly once delivery via the PUBREC/PUBREL/PUBCOMP handshake.
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(CodecError::InvalidQoS(other)),
        }
    }
}

/// A decoded fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    /// Packet type from the high nibble.
    pub packet_type: PacketType,
    /// Low nibble of the first byte.
    pub flags: u8,
    /// Number of bytes following the fixed header.
    pub remaining_length: usize,
}

/// Encode the remaining length field.
///
/// Each byte carries 7 bits of the value, least significant group first; the
/// high bit flags a continuation byte.
pub fn encode_remaining_length(mut len: usize) -> Result<HVec<u8, 4>, CodecError> {
    if len > MAX_REMAINING_LENGTH {
        return Err(CodecError::PacketTooLarge {
            size: len,
            max: MAX_REMAINING_LENGTH,
        });
    }
    let mut out = HVec::new();
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte)
            .map_err(|_| CodecError::MalformedRemainingLength)?;
        if len == 0 {
            return Ok(out);
        }
    }
}

/// Decode a remaining length field from the start of `bytes`.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the value and the
/// number of bytes it occupied.
pub fn decode_remaining_length(bytes: &[u8]) -> Result<Option<(usize, usize)>, CodecError> {
    let mut value = 0usize;
    let mut multiplier = 1usize;
    for (i, byte) in bytes.iter().enumerate() {
        if i >= 4 {
            return Err(CodecError::MalformedRemainingLength);
        }
        value += (*byte as usize & 0x7F) * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        multiplier *= 128;
    }
    if bytes.len() >= 4 {
        return Err(CodecError::MalformedRemainingLength);
    }
    Ok(None)
}

/// Decode a fixed header from the start of `bytes`.
///
/// Returns `Ok(None)` when the header is not complete yet, otherwise the
/// header and its length in bytes.
pub fn decode_fixed_header(bytes: &[u8]) -> Result<Option<(FixedHeader, usize)>, CodecError> {
    let Some(&first) = bytes.first() else {
        return Ok(None);
    };
    let packet_type = PacketType::from_header(first).ok_or(CodecError::UnknownPacketType(first))?;
    match decode_remaining_length(&bytes[1..])? {
        Some((remaining_length, used)) => Ok(Some((
            FixedHeader {
                packet_type,
                flags: first & 0x0F,
                remaining_length,
            },
            1 + used,
        ))),
        None => Ok(None),
    }
}

fn put_header(buf: &mut Vec<u8>, first: u8, remaining: usize) -> Result<(), CodecError> {
    let len = encode_remaining_length(remaining)?;
    buf.reserve(1 + len.len() + remaining);
    buf.push(first);
    buf.extend_from_slice(&len);
    Ok(())
}

fn field_len(bytes: &[u8]) -> Result<usize, CodecError> {
    if bytes.len() > u16::MAX as usize {
        return Err(CodecError::StringTooLong(bytes.len()));
    }
    Ok(2 + bytes.len())
}

fn put_field(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    buf.extend_from_slice(bytes);
}

/// Cursor over a packet body.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> Result<u8, CodecError> {
        let (&b, rest) = self.buf.split_first().ok_or(CodecError::MalformedPacket)?;
        self.buf = rest;
        Ok(b)
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        if self.buf.len() < 2 {
            return Err(CodecError::MalformedPacket);
        }
        let (head, rest) = self.buf.split_at(2);
        self.buf = rest;
        Ok(u16::from_be_bytes([head[0], head[1]]))
    }

    fn bytes(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.u16()? as usize;
        if self.buf.len() < len {
            return Err(CodecError::MalformedPacket);
        }
        let (head, rest) = self.buf.split_at(len);
        self.buf = rest;
        Ok(head)
    }

    fn str(&mut self) -> Result<&'a str, CodecError> {
        core::str::from_utf8(self.bytes()?).map_err(|_| CodecError::InvalidUtf8)
    }

    fn rest(&mut self) -> &'a [u8] {
        core::mem::take(&mut self.buf)
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Last Will and Testament fields of a CONNECT packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Will<'a> {
    /// Topic the broker publishes the will to.
    pub topic: &'a str,
    /// Will message body.
    pub payload: &'a [u8],
    /// QoS of the will message.
    pub qos: QoS,
    /// Whether the broker retains the will message.
    pub retain: bool,
}

/// CONNECT packet fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connect<'a> {
    /// Client identifier.
    pub client_id: &'a str,
    /// Keep-alive interval in seconds, 0 disables it.
    pub keep_alive: u16,
    /// Ask the broker to discard previous session state.
    pub clean_session: bool,
    /// Optional user name.
    pub username: Option<&'a str>,
    /// Optional password, only sent with a user name.
    pub password: Option<&'a [u8]>,
    /// Optional will message.
    pub will: Option<Will<'a>>,
}

/// Append a CONNECT packet to `buf`.
pub fn encode_connect(buf: &mut Vec<u8>, connect: &Connect<'_>) -> Result<(), CodecError> {
    let mut flags = 0u8;
    let mut remaining = 2 + PROTOCOL_NAME.len() + 1 + 1 + 2;
    remaining += field_len(connect.client_id.as_bytes())?;
    if connect.clean_session {
        flags |= 0x02;
    }
    if let Some(will) = &connect.will {
        flags |= 0x04 | ((will.qos as u8) << 3);
        if will.retain {
            flags |= 0x20;
        }
        remaining += field_len(will.topic.as_bytes())? + field_len(will.payload)?;
    }
    if let Some(username) = connect.username {
        flags |= 0x80;
        remaining += field_len(username.as_bytes())?;
        if let Some(password) = connect.password {
            flags |= 0x40;
            remaining += field_len(password)?;
        }
    }

    put_header(buf, PacketType::Connect.header(), remaining)?;
    put_field(buf, PROTOCOL_NAME);
    buf.push(PROTOCOL_LEVEL);
    buf.push(flags);
    buf.extend_from_slice(&connect.keep_alive.to_be_bytes());
    put_field(buf, connect.client_id.as_bytes());
    if let Some(will) = &connect.will {
        put_field(buf, will.topic.as_bytes());
        put_field(buf, will.payload);
    }
    if let Some(username) = connect.username {
        put_field(buf, username.as_bytes());
        if let Some(password) = connect.password {
            put_field(buf, password);
        }
    }
    Ok(())
}

/// CONNACK packet fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    /// The broker resumed a stored session.
    pub session_present: bool,
    /// Connect return code, 0 means accepted.
    pub return_code: u8,
}

/// Decode a CONNACK body.
pub fn decode_connack(body: &[u8]) -> Result<ConnAck, CodecError> {
    match body {
        [ack_flags, return_code] => Ok(ConnAck {
            session_present: ack_flags & 0x01 != 0,
            return_code: *return_code,
        }),
        _ => Err(CodecError::MalformedPacket),
    }
}

/// PUBLISH packet fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Publish<'a> {
    /// Re-delivery of an earlier attempt.
    pub dup: bool,
    /// Delivery guarantee.
    pub qos: QoS,
    /// Retained message flag.
    pub retain: bool,
    /// Topic name.
    pub topic: &'a str,
    /// Packet identifier, present for QoS 1 and 2.
    pub packet_id: Option<u16>,
    /// Application payload.
    pub payload: &'a [u8],
}

/// Append a PUBLISH packet to `buf`.
pub fn encode_publish(buf: &mut Vec<u8>, publish: &Publish<'_>) -> Result<(), CodecError> {
    let mut remaining = field_len(publish.topic.as_bytes())? + publish.payload.len();
    let packet_id = match (publish.qos, publish.packet_id) {
        (QoS::AtMostOnce, _) => None,
        (_, Some(id)) if id != 0 => {
            remaining += 2;
            Some(id)
        }
        _ => return Err(CodecError::MalformedPacket),
    };

    let mut first = (PacketType::Publish as u8) << 4 | (publish.qos as u8) << 1;
    if publish.dup {
        first |= DUP_FLAG;
    }
    if publish.retain {
        first |= 0x01;
    }
    put_header(buf, first, remaining)?;
    put_field(buf, publish.topic.as_bytes());
    if let Some(id) = packet_id {
        buf.extend_from_slice(&id.to_be_bytes());
    }
    buf.extend_from_slice(publish.payload);
    Ok(())
}

/// Decode a PUBLISH body; `flags` is the low nibble of the fixed header.
pub fn decode_publish(flags: u8, body: &[u8]) -> Result<Publish<'_>, CodecError> {
    let qos = QoS::try_from((flags >> 1) & 0x03)?;
    let mut reader = Reader { buf: body };
    let topic = reader.str()?;
    let packet_id = match qos {
        QoS::AtMostOnce => None,
        _ => match reader.u16()? {
            0 => return Err(CodecError::MalformedPacket),
            id => Some(id),
        },
    };
    Ok(Publish {
        dup: flags & DUP_FLAG != 0,
        qos,
        retain: flags & 0x01 != 0,
        topic,
        packet_id,
        payload: reader.rest(),
    })
}

/// Set the DUP flag of an encoded PUBLISH packet. Other packets are left untouched.
pub fn set_dup_flag(packet: &mut [u8]) {
    if let Some(first) = packet.first_mut() {
        if PacketType::from_header(*first) == Some(PacketType::Publish) {
            *first |= DUP_FLAG;
        }
    }
}

/// Encode one of the four byte packets carrying only a packet identifier:
/// PUBACK, PUBREC, PUBREL, PUBCOMP and UNSUBACK.
pub fn encode_ack(packet_type: PacketType, packet_id: u16) -> [u8; 4] {
    let id = packet_id.to_be_bytes();
    [packet_type.header(), 0x02, id[0], id[1]]
}

/// Decode the packet identifier from an ack family body.
pub fn decode_ack(body: &[u8]) -> Result<u16, CodecError> {
    match body {
        [hi, lo] => Ok(u16::from_be_bytes([*hi, *lo])),
        _ => Err(CodecError::MalformedPacket),
    }
}

/// Append a SUBSCRIBE packet for `filters` to `buf`.
pub fn encode_subscribe(
    buf: &mut Vec<u8>,
    packet_id: u16,
    filters: &[(&str, QoS)],
) -> Result<(), CodecError> {
    if filters.is_empty() {
        return Err(CodecError::MalformedPacket);
    }
    let mut remaining = 2;
    for (filter, _) in filters {
        remaining += field_len(filter.as_bytes())? + 1;
    }
    put_header(buf, PacketType::Subscribe.header(), remaining)?;
    buf.extend_from_slice(&packet_id.to_be_bytes());
    for (filter, qos) in filters {
        put_field(buf, filter.as_bytes());
        buf.push(*qos as u8);
    }
    Ok(())
}

/// Decode a SUBSCRIBE body into its packet identifier and requested filters.
pub fn decode_subscribe(body: &[u8]) -> Result<(u16, Vec<(&str, QoS)>), CodecError> {
    let mut reader = Reader { buf: body };
    let packet_id = reader.u16()?;
    let mut filters = Vec::new();
    while !reader.is_empty() {
        let filter = reader.str()?;
        let qos = QoS::try_from(reader.u8()?)?;
        filters.push((filter, qos));
    }
    if filters.is_empty() {
        return Err(CodecError::MalformedPacket);
    }
    Ok((packet_id, filters))
}

/// Decode a SUBACK body into its packet identifier and return codes.
pub fn decode_suback(body: &[u8]) -> Result<(u16, &[u8]), CodecError> {
    let mut reader = Reader { buf: body };
    let packet_id = reader.u16()?;
    let codes = reader.rest();
    if codes.is_empty() {
        return Err(CodecError::MalformedPacket);
    }
    Ok((packet_id, codes))
}

/// Append an UNSUBSCRIBE packet for `filters` to `buf`.
pub fn encode_unsubscribe(
    buf: &mut Vec<u8>,
    packet_id: u16,
    filters: &[&str],
) -> Result<(), CodecError> {
    if filters.is_empty() {
        return Err(CodecError::MalformedPacket);
    }
    let mut remaining = 2;
    for filter in filters {
        remaining += field_len(filter.as_bytes())?;
    }
    put_header(buf, PacketType::Unsubscribe.header(), remaining)?;
    buf.extend_from_slice(&packet_id.to_be_bytes());
    for filter in filters {
        put_field(buf, filter.as_bytes());
    }
    Ok(())
}

/// Decode an UNSUBSCRIBE body.
pub fn decode_unsubscribe(body: &[u8]) -> Result<(u16, Vec<&str>), CodecError> {
    let mut reader = Reader { buf: body };
    let packet_id = reader.u16()?;
    let mut filters = Vec::new();
    while !reader.is_empty() {
        filters.push(reader.str()?);
    }
    if filters.is_empty() {
        return Err(CodecError::MalformedPacket);
    }
    Ok((packet_id, filters))
}

/// PINGREQ packet.
pub const PINGREQ: [u8; 2] = [(PacketType::PingReq as u8) << 4, 0x00];
/// PINGRESP packet.
pub const PINGRESP: [u8; 2] = [(PacketType::PingResp as u8) << 4, 0x00];
/// DISCONNECT packet.
pub const DISCONNECT: [u8; 2] = [(PacketType::Disconnect as u8) << 4, 0x00];
