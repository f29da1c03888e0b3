//! Provides [Message], the unit of exchange between two peers, and its wire encoding.
//!
//! All integers are big-endian. A frame is laid out as follows:
//!
//! ```text
//! [1 byte type]
//! Keep:                      nothing else
//! otherwise:
//!   [4 bytes payload length N]
//!   Request/Response/OneWay: [4 bytes tag]
//!   Request/Response:        [4 bytes request id]
//!   [N bytes payload]
//! ```
use bytes::{Buf as _, BufMut as _};

/// Largest payload accepted when no other limit is configured.
pub(crate) const MAX_PAYLOAD_LEN: u32 = 16 * 1024 * 1024;

/// Type of a [Message]. Determines which header fields follow the type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
#[repr(u8)]
pub enum MessageType {
    /// Liveness check. Encoded as a single byte.
    Keep = 0,
    Request = 1,
    Response = 2,
    OneWay = 3,
    Close = 4,
}

impl MessageType {
    fn from_byte(value: u8) -> Result<Self, MessageParseError> {
        Ok(match value {
            0 => MessageType::Keep,
            1 => MessageType::Request,
            2 => MessageType::Response,
            3 => MessageType::OneWay,
            4 => MessageType::Close,
            value => return Err(MessageParseError::InvalidType { value }),
        })
    }

    fn has_tag(self) -> bool {
        matches!(
            self,
            MessageType::Request | MessageType::Response | MessageType::OneWay
        )
    }

    fn has_request_id(self) -> bool {
        matches!(self, MessageType::Request | MessageType::Response)
    }

    /// Size of the fixed header that precedes the payload.
    pub(crate) fn header_len(self) -> usize {
        match self {
            MessageType::Keep => 1,
            MessageType::Close => 5,
            MessageType::OneWay => 9,
            MessageType::Request | MessageType::Response => 13,
        }
    }
}

/// Error returned when a frame cannot be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageParseError {
    #[error("Invalid message type {value}")]
    InvalidType { value: u8 },
    #[error("Payload length {len} exceeds the maximum of {max} bytes")]
    PayloadTooLarge { len: u32, max: u32 },
    #[error("Frame is truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("{count} trailing bytes after frame")]
    TrailingBytes { count: usize },
}

/// A single frame exchanged between peers.
///
/// A message is never mutated once it has been sent or dispatched. Use
/// [Message::reply] to answer a request.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    type_: MessageType,
    tag: u32,
    request_id: u32,
    payload: Vec<u8>,
}

impl Message {
    pub fn keep() -> Self {
        Self {
            type_: MessageType::Keep,
            tag: 0,
            request_id: 0,
            payload: Vec::new(),
        }
    }

    /// Create a request. A `request_id` of zero means no response is expected.
    pub fn request(tag: u32, request_id: u32, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            type_: MessageType::Request,
            tag,
            request_id,
            payload: payload.into(),
        }
    }

    pub fn response(tag: u32, request_id: u32, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            type_: MessageType::Response,
            tag,
            request_id,
            payload: payload.into(),
        }
    }

    pub fn one_way(tag: u32, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            type_: MessageType::OneWay,
            tag,
            request_id: 0,
            payload: payload.into(),
        }
    }

    /// Create a close message. `reason` is informational and may be empty.
    pub fn close(reason: impl Into<Vec<u8>>) -> Self {
        Self {
            type_: MessageType::Close,
            tag: 0,
            request_id: 0,
            payload: reason.into(),
        }
    }

    /// Build the response to this message. The response carries the same tag and request id.
    pub fn reply(&self, payload: impl Into<Vec<u8>>) -> Self {
        Self::response(self.tag, self.request_id, payload)
    }

    pub fn type_(&self) -> MessageType {
        self.type_
    }

    pub fn tag(&self) -> u32 {
        self.tag
    }

    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Returns `true` if the sender of this request waits for a response.
    pub fn expects_reply(&self) -> bool {
        self.type_ == MessageType::Request && self.request_id != 0
    }

    /// Number of bytes this message occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        match self.type_ {
            MessageType::Keep => 1,
            type_ => type_.header_len() + self.payload.len(),
        }
    }

    /// Append the encoded frame to `buffer`.
    pub fn encode(&self, buffer: &mut bytes::BytesMut) {
        buffer.reserve(self.encoded_len());
        buffer.put_u8(self.type_ as u8);
        if self.type_ == MessageType::Keep {
            return;
        }
        debug_assert!(self.payload.len() <= u32::MAX as usize);
        buffer.put_u32(self.payload.len() as u32);
        if self.type_.has_tag() {
            buffer.put_u32(self.tag);
        }
        if self.type_.has_request_id() {
            buffer.put_u32(self.request_id);
        }
        buffer.put_slice(&self.payload);
    }

    pub fn build(&self) -> Vec<u8> {
        let mut buffer = bytes::BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buffer);
        buffer.to_vec()
    }

    /// Decode exactly one frame from `data`. Payloads larger than 16 MiB are rejected.
    pub fn parse(data: &[u8]) -> Result<Self, MessageParseError> {
        let mut reader = MessageReader::new(MAX_PAYLOAD_LEN);
        let mut input = data;
        match reader.put(&mut input) {
            Some(Ok(message)) => {
                if input.is_empty() {
                    Ok(message)
                } else {
                    Err(MessageParseError::TrailingBytes { count: input.len() })
                }
            }
            Some(Err(err)) => Err(err),
            None => Err(MessageParseError::Truncated {
                expected: reader.expected_len(),
                actual: data.len(),
            }),
        }
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Message")
            .field("type", &self.type_)
            .field("tag", &self.tag)
            .field("request_id", &self.request_id)
            .field("payload", &String::from_utf8_lossy(&self.payload))
            .finish()
    }
}

/// Header fields decoded before the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Header {
    type_: MessageType,
    payload_len: u32,
    tag: u32,
    request_id: u32,
}

impl Header {
    fn parse(type_: MessageType, mut data: &[u8]) -> Self {
        let payload_len = data.get_u32();
        let tag = if type_.has_tag() { data.get_u32() } else { 0 };
        let request_id = if type_.has_request_id() {
            data.get_u32()
        } else {
            0
        };
        debug_assert!(!data.has_remaining());
        Self {
            type_,
            payload_len,
            tag,
            request_id,
        }
    }

    fn into_message(self, payload: Vec<u8>) -> Message {
        Message {
            type_: self.type_,
            tag: self.tag,
            request_id: self.request_id,
            payload,
        }
    }
}

/// Buffer that is fed bytes until it produces a [Message].
///
/// Call [MessageReader::put] repeatedly until a [Message] or an error is returned.
#[derive(Debug)]
pub(crate) enum MessageReader {
    ReadingType {
        max_payload_len: u32,
    },
    ReadingHeader {
        max_payload_len: u32,
        type_: MessageType,
        buffer: crate::utils::ReadBuffer,
    },
    ReadingPayload {
        max_payload_len: u32,
        header: Header,
        buffer: crate::utils::ReadBuffer,
    },
}

impl MessageReader {
    pub(crate) fn new(max_payload_len: u32) -> Self {
        Self::ReadingType { max_payload_len }
    }

    fn max_payload_len(&self) -> u32 {
        match self {
            Self::ReadingType { max_payload_len }
            | Self::ReadingHeader {
                max_payload_len, ..
            }
            | Self::ReadingPayload {
                max_payload_len, ..
            } => *max_payload_len,
        }
    }

    /// Consume bytes from `data` until a message is complete.
    ///
    /// Returns `None` if `data` was exhausted before a message was complete.
    /// Bytes following a complete message are left in `data`.
    pub(crate) fn put(
        &mut self,
        data: &mut impl bytes::Buf,
    ) -> Option<Result<Message, MessageParseError>> {
        let max_payload_len = self.max_payload_len();
        loop {
            match self {
                Self::ReadingType { .. } => {
                    if !data.has_remaining() {
                        return None;
                    }
                    let type_ = match MessageType::from_byte(data.get_u8()) {
                        Ok(type_) => type_,
                        Err(err) => return Some(Err(err)),
                    };
                    if type_ == MessageType::Keep {
                        return Some(Ok(Message::keep()));
                    }
                    *self = Self::ReadingHeader {
                        max_payload_len,
                        type_,
                        buffer: crate::utils::ReadBuffer::new(type_.header_len() - 1),
                    };
                }
                Self::ReadingHeader { type_, buffer, .. } => {
                    let header_data = buffer.put(data)?;
                    let header = Header::parse(*type_, &header_data);
                    if header.payload_len > max_payload_len {
                        *self = Self::new(max_payload_len);
                        return Some(Err(MessageParseError::PayloadTooLarge {
                            len: header.payload_len,
                            max: max_payload_len,
                        }));
                    }
                    if header.payload_len == 0 {
                        *self = Self::new(max_payload_len);
                        return Some(Ok(header.into_message(Vec::new())));
                    }
                    *self = Self::ReadingPayload {
                        max_payload_len,
                        header,
                        buffer: crate::utils::ReadBuffer::new(header.payload_len as usize),
                    };
                }
                Self::ReadingPayload { header, buffer, .. } => {
                    let payload = buffer.put(data)?;
                    let message = header.into_message(payload);
                    *self = Self::new(max_payload_len);
                    return Some(Ok(message));
                }
            }
        }
    }

    /// Returns `true` if no byte of the next message has been consumed.
    pub(crate) fn is_empty(&self) -> bool {
        matches!(self, Self::ReadingType { .. })
    }

    fn expected_len(&self) -> usize {
        match self {
            Self::ReadingType { .. } => 1,
            Self::ReadingHeader { type_, .. } => type_.header_len(),
            Self::ReadingPayload { header, .. } => {
                header.type_.header_len() + header.payload_len as usize
            }
        }
    }
}
