//! Frame encoding and decoding.
//!
//! A frame is one MessagePack array, `[session, type, payload]` or
//! `[session, type, payload, headers]`. MessagePack is self-delimiting, so
//! the decoder walks value markers as bytes arrive, remembering how far it
//! got, and builds values only once the whole array is buffered.

use std::io::{self, Cursor};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rmp::decode::{NumValueReadError, ValueReadError};
use rmp::Marker;
use rmpv::Value;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::message::{Message, Payload};
use crate::trace::Headers;

/// Maximum frame size (10 MB).
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Codec for reading and writing protocol frames on a byte stream.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    max_size: usize,
    scan: FrameScan,
}

impl MessageCodec {
    /// Creates a codec with the default size limit.
    #[must_use]
    pub const fn new() -> Self {
        Self::with_max_size(MAX_MESSAGE_SIZE)
    }

    /// Creates a codec with a custom frame size limit.
    #[must_use]
    pub const fn with_max_size(max_size: usize) -> Self {
        Self {
            max_size,
            scan: FrameScan::new(),
        }
    }

    /// Encodes a message into a standalone buffer.
    pub fn encode_to_vec(message: &Message) -> Result<Vec<u8>, ProtocolError> {
        let mut dst = BytesMut::new();
        write_message(message, &mut dst)?;
        Ok(dst.to_vec())
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        if src.is_empty() {
            return Ok(None);
        }

        let Some(frame_len) = self.scan.advance(src, self.max_size)? else {
            return Ok(None);
        };
        let message = parse_frame(&src[..frame_len])?;
        src.advance(frame_len);
        Ok(Some(message))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let start = dst.len();
        write_message(&message, dst)?;
        let size = dst.len() - start;
        if size > self.max_size {
            dst.truncate(start);
            return Err(ProtocolError::MessageTooLarge {
                size,
                max: self.max_size,
            });
        }
        Ok(())
    }
}

fn write_message(message: &Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
    let headers = message.headers().filter(|h| !h.is_empty());
    let len = if headers.is_some() { 4 } else { 3 };

    let mut wr = dst.writer();
    rmp::encode::write_array_len(&mut wr, len).map_err(serialisation)?;
    rmp::encode::write_uint(&mut wr, message.session()).map_err(serialisation)?;
    rmp::encode::write_uint(&mut wr, message.ty()).map_err(serialisation)?;
    let dst = wr.into_inner();
    dst.put_slice(message.payload().as_bytes());

    if let Some(headers) = headers {
        let value = Value::Array(headers.entries().to_vec());
        rmpv::encode::write_value(&mut dst.writer(), &value).map_err(serialisation)?;
    }
    Ok(())
}

fn serialisation(err: impl std::fmt::Display) -> ProtocolError {
    ProtocolError::Serialisation(err.to_string())
}

/// Progress through the frame at the front of the read buffer.
///
/// Only value headers are inspected, so every buffered byte is walked at
/// most once however the frame is split across reads.
#[derive(Debug, Clone)]
struct FrameScan {
    /// Bytes of the frame already walked.
    offset: usize,
    /// Values still to walk before the outermost one is complete.
    pending: u64,
}

impl FrameScan {
    const fn new() -> Self {
        Self {
            offset: 0,
            pending: 0,
        }
    }

    /// Walks from where the previous call stopped. Returns the frame length
    /// once the outermost value is fully buffered.
    fn advance(&mut self, src: &[u8], max_size: usize) -> Result<Option<usize>, ProtocolError> {
        if self.offset == 0 || self.offset > src.len() {
            *self = Self {
                offset: 0,
                pending: 1,
            };
        }

        while self.pending > 0 {
            let Some(head) = value_head(&src[self.offset..])? else {
                return Ok(None);
            };
            let end = (self.offset as u64).saturating_add(head.len);
            if end > max_size as u64 {
                let size = usize::try_from(end).unwrap_or(usize::MAX);
                *self = Self::new();
                return Err(ProtocolError::MessageTooLarge {
                    size,
                    max: max_size,
                });
            }
            // `end` is bounded by `max_size` here.
            let end = usize::try_from(end).unwrap_or(usize::MAX);
            if end > src.len() {
                return Ok(None);
            }
            self.offset = end;
            self.pending = self.pending - 1 + head.children;
        }

        let frame_len = self.offset;
        *self = Self::new();
        Ok(Some(frame_len))
    }
}

/// Encoded size of one value, excluding its children, and how many child
/// values follow it.
struct Head {
    len: u64,
    children: u64,
}

impl Head {
    const fn scalar(header: u64, body: u64) -> Self {
        Self {
            len: header + body,
            children: 0,
        }
    }

    const fn container(header: u64, children: u64) -> Self {
        Self {
            len: header,
            children,
        }
    }
}

/// Reads the header of the value at the front of `buf`. `None` means the
/// header itself is not fully buffered yet.
fn value_head(buf: &[u8]) -> Result<Option<Head>, ProtocolError> {
    let Some(&byte) = buf.first() else {
        return Ok(None);
    };
    let size = |width: usize| -> Option<u64> {
        let bytes = buf.get(1..=width)?;
        Some(bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
    };

    let head = match Marker::from_u8(byte) {
        Marker::FixPos(_) | Marker::FixNeg(_) | Marker::Null | Marker::True | Marker::False => {
            Some(Head::scalar(1, 0))
        }
        Marker::U8 | Marker::I8 => Some(Head::scalar(2, 0)),
        Marker::U16 | Marker::I16 => Some(Head::scalar(3, 0)),
        Marker::U32 | Marker::I32 | Marker::F32 => Some(Head::scalar(5, 0)),
        Marker::U64 | Marker::I64 | Marker::F64 => Some(Head::scalar(9, 0)),
        Marker::FixStr(n) => Some(Head::scalar(1, u64::from(n))),
        Marker::Str8 | Marker::Bin8 => size(1).map(|n| Head::scalar(2, n)),
        Marker::Str16 | Marker::Bin16 => size(2).map(|n| Head::scalar(3, n)),
        Marker::Str32 | Marker::Bin32 => size(4).map(|n| Head::scalar(5, n)),
        Marker::FixArray(n) => Some(Head::container(1, u64::from(n))),
        Marker::Array16 => size(2).map(|n| Head::container(3, n)),
        Marker::Array32 => size(4).map(|n| Head::container(5, n)),
        Marker::FixMap(n) => Some(Head::container(1, 2 * u64::from(n))),
        Marker::Map16 => size(2).map(|n| Head::container(3, 2 * n)),
        Marker::Map32 => size(4).map(|n| Head::container(5, 2 * n)),
        Marker::FixExt1 => Some(Head::scalar(2, 1)),
        Marker::FixExt2 => Some(Head::scalar(2, 2)),
        Marker::FixExt4 => Some(Head::scalar(2, 4)),
        Marker::FixExt8 => Some(Head::scalar(2, 8)),
        Marker::FixExt16 => Some(Head::scalar(2, 16)),
        Marker::Ext8 => size(1).map(|n| Head::scalar(3, n)),
        Marker::Ext16 => size(2).map(|n| Head::scalar(4, n)),
        Marker::Ext32 => size(4).map(|n| Head::scalar(6, n)),
        Marker::Reserved => {
            return Err(ProtocolError::MalformedFrame(format!(
                "reserved marker 0x{byte:02x}"
            )))
        }
    };
    Ok(head)
}

/// Builds the message from exactly one complete frame.
fn parse_frame(src: &[u8]) -> Result<Message, ProtocolError> {
    match read_frame(src)? {
        Some((len, message)) if len == src.len() => Ok(message),
        _ => Err(ProtocolError::MalformedFrame(
            "frame length does not match its contents".into(),
        )),
    }
}

fn read_frame(src: &[u8]) -> Result<Option<(usize, Message)>, ProtocolError> {
    let mut rd = Cursor::new(src);

    let Some(len) = incomplete_as_none(rmp::decode::read_array_len(&mut rd).map_err(ReadError::from))? else {
        return Ok(None);
    };
    if !(3..=4).contains(&len) {
        return Err(ProtocolError::MalformedFrame(format!(
            "expected 3 or 4 elements, got {len}"
        )));
    }

    let Some(session) = incomplete_as_none(rmp::decode::read_int::<u64, _>(&mut rd).map_err(ReadError::from))? else {
        return Ok(None);
    };
    let Some(ty) = incomplete_as_none(rmp::decode::read_int::<u64, _>(&mut rd).map_err(ReadError::from))? else {
        return Ok(None);
    };

    let payload_start = position(&rd);
    let Some(payload) = incomplete_as_none(rmpv::decode::read_value(&mut rd).map_err(ReadError::from))? else {
        return Ok(None);
    };
    if !payload.is_array() {
        return Err(ProtocolError::MalformedFrame("payload is not an array".into()));
    }
    let payload_end = position(&rd);

    let headers = if len == 4 {
        let Some(value) = incomplete_as_none(rmpv::decode::read_value(&mut rd).map_err(ReadError::from))? else {
            return Ok(None);
        };
        match value {
            Value::Array(entries) => Some(Headers::new(entries)),
            Value::Nil => None,
            other => {
                return Err(ProtocolError::MalformedFrame(format!(
                    "headers must be an array, got {other}"
                )))
            }
        }
    } else {
        None
    };

    let frame_len = position(&rd);
    let payload = Payload::from_validated(Bytes::copy_from_slice(&src[payload_start..payload_end]));
    let mut message = Message::new(session, ty, payload);
    if let Some(headers) = headers {
        message = message.with_headers(headers);
    }
    Ok(Some((frame_len, message)))
}

fn position(rd: &Cursor<&[u8]>) -> usize {
    // The cursor never moves past the buffer, which is already in memory.
    usize::try_from(rd.position()).unwrap_or(usize::MAX)
}

/// Read failure flattened from the different rmp/rmpv error types.
enum ReadError {
    Incomplete,
    Malformed(String),
}

impl ReadError {
    fn from_io(err: &io::Error, display: String) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            Self::Incomplete
        } else {
            Self::Malformed(display)
        }
    }
}

impl From<ValueReadError<io::Error>> for ReadError {
    fn from(err: ValueReadError<io::Error>) -> Self {
        let display = err.to_string();
        match &err {
            ValueReadError::InvalidMarkerRead(e) | ValueReadError::InvalidDataRead(e) => {
                Self::from_io(e, display)
            }
            _ => Self::Malformed(display),
        }
    }
}

impl From<NumValueReadError<io::Error>> for ReadError {
    fn from(err: NumValueReadError<io::Error>) -> Self {
        let display = err.to_string();
        match &err {
            NumValueReadError::InvalidMarkerRead(e) | NumValueReadError::InvalidDataRead(e) => {
                Self::from_io(e, display)
            }
            _ => Self::Malformed(display),
        }
    }
}

impl From<rmpv::decode::Error> for ReadError {
    fn from(err: rmpv::decode::Error) -> Self {
        let display = err.to_string();
        match &err {
            rmpv::decode::Error::InvalidMarkerRead(e) | rmpv::decode::Error::InvalidDataRead(e) => {
                Self::from_io(e, display)
            }
            _ => Self::Malformed(display),
        }
    }
}

fn incomplete_as_none<T>(result: Result<T, ReadError>) -> Result<Option<T>, ProtocolError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(ReadError::Incomplete) => Ok(None),
        Err(ReadError::Malformed(reason)) => Err(ProtocolError::MalformedFrame(reason)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(message: &Message) -> BytesMut {
        let mut buf = BytesMut::new();
        MessageCodec::new().encode(message.clone(), &mut buf).unwrap();
        buf
    }

    #[test]
    fn frame_layout_is_session_type_payload() {
        let message = Message::new(5, 0, Payload::builder().str("echo").build());
        let buf = encode(&message);
        // fixarray(3), session 5, type 0, fixarray(1), fixstr "echo"
        assert_eq!(&buf[..], &[0x93, 0x05, 0x00, 0x91, 0xa4, b'e', b'c', b'h', b'o']);
    }

    #[test]
    fn decode_waits_for_complete_frame() {
        let message = Message::new(9, 4, Payload::builder().bin(&[1u8; 64]).build());
        let full = encode(&message);
        let mut codec = MessageCodec::new();

        for cut in [1, 3, 10, full.len() - 1] {
            let mut partial = BytesMut::from(&full[..cut]);
            assert!(codec.decode(&mut partial).unwrap().is_none(), "cut at {cut}");
            assert_eq!(partial.len(), cut);
        }

        let mut whole = full.clone();
        assert_eq!(codec.decode(&mut whole).unwrap(), Some(message));
        assert!(whole.is_empty());
    }

    #[test]
    fn large_frame_in_small_reads_is_walked_once() {
        let items = vec![Value::from(1); 1_000_000];
        let message = Message::new(2, 4, Payload::from_values(&[Value::Array(items)]));
        let full = encode(&message);

        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        let started = std::time::Instant::now();
        let mut decoded = None;
        for piece in full.chunks(8 * 1024) {
            assert!(decoded.is_none(), "frame decoded before its last byte");
            buf.extend_from_slice(piece);
            decoded = codec.decode(&mut buf).unwrap();
        }

        assert!(started.elapsed() < std::time::Duration::from_secs(5));
        assert_eq!(decoded, Some(message));
        assert!(buf.is_empty());
    }

    #[test]
    fn split_length_prefixes_are_resumed() {
        let message = Message::new(3, 0, Payload::builder().bin(&[7u8; 300]).build());
        let full = encode(&message);
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();

        // Feed one byte at a time, so every bin16 size byte arrives alone.
        for (i, byte) in full.iter().enumerate() {
            buf.extend_from_slice(&[*byte]);
            let decoded = codec.decode(&mut buf).unwrap();
            assert_eq!(decoded.is_some(), i == full.len() - 1, "byte {i}");
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn reserved_marker_is_malformed() {
        let mut buf = BytesMut::from(&[0x93, 0x01, 0x00, 0xc1][..]);
        assert!(matches!(
            MessageCodec::new().decode(&mut buf),
            Err(ProtocolError::MalformedFrame(_))
        ));
    }

    #[test]
    fn oversized_frame_is_rejected_before_it_arrives() {
        let mut codec = MessageCodec::with_max_size(1024);
        // [2, 0, [bin32 of 1 MiB]] with only the headers buffered.
        let mut buf = BytesMut::from(&[0x93, 0x02, 0x00, 0x91, 0xc6, 0x00, 0x10, 0x00, 0x00][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn decode_consumes_one_frame_at_a_time() {
        let first = Message::new(2, 0, Payload::empty());
        let second = Message::new(3, 2, Payload::empty());
        let mut buf = encode(&first);
        buf.extend_from_slice(&encode(&second));

        let mut codec = MessageCodec::new();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(first));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(second));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn headers_survive_the_wire() {
        let headers = Headers::from(crate::TraceInfo {
            trace: 1,
            span: 2,
            parent: 0,
        });
        let message = Message::new(4, 0, Payload::empty()).with_headers(headers.clone());
        let mut buf = encode(&message);
        assert_eq!(buf[0], 0x94);

        let decoded = MessageCodec::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.headers(), Some(&headers));
    }

    #[test]
    fn nil_headers_are_accepted() {
        // [1, 0, [], nil]
        let mut buf = BytesMut::from(&[0x94, 0x01, 0x00, 0x90, 0xc0][..]);
        let decoded = MessageCodec::new().decode(&mut buf).unwrap().unwrap();
        assert!(decoded.headers().is_none());
    }

    #[test]
    fn malformed_frames_are_typed_errors() {
        let mut not_array = BytesMut::from(&[0x05][..]);
        assert!(matches!(
            MessageCodec::new().decode(&mut not_array),
            Err(ProtocolError::MalformedFrame(_))
        ));

        let mut short = BytesMut::from(&[0x92, 0x01, 0x00][..]);
        assert!(matches!(
            MessageCodec::new().decode(&mut short),
            Err(ProtocolError::MalformedFrame(_))
        ));

        // Payload is an integer instead of an array.
        let mut bad_payload = BytesMut::from(&[0x93, 0x01, 0x00, 0x07][..]);
        assert!(matches!(
            MessageCodec::new().decode(&mut bad_payload),
            Err(ProtocolError::MalformedFrame(_))
        ));
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut codec = MessageCodec::with_max_size(16);
        let message = Message::new(2, 0, Payload::builder().bin(&[0u8; 64]).build());

        let mut buf = BytesMut::new();
        assert!(matches!(
            codec.encode(message.clone(), &mut buf),
            Err(ProtocolError::MessageTooLarge { .. })
        ));
        assert!(buf.is_empty());

        let mut incoming = encode(&message);
        assert!(matches!(
            codec.decode(&mut incoming),
            Err(ProtocolError::MessageTooLarge { .. })
        ));
    }
}
