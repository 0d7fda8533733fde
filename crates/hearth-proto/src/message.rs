//! The message envelope and its lazily-decoded payload.
//!
//! Writes into a `Vec<u8>` cannot fail, so encoder results in the payload
//! builder are discarded.

use std::fmt;
use std::io::Cursor;

use bytes::Bytes;
use rmpv::Value;
use serde::de::DeserializeOwned;

use crate::error::{ProtocolError, Result};
use crate::trace::Headers;

/// MessagePack encoding of an empty array.
const EMPTY_ARRAY: &[u8] = &[0x90];

/// Raw MessagePack array carried as the third element of a frame.
///
/// The bytes are kept as received. Typed views are produced on demand so
/// the dispatcher never pays for decoding chunk bodies it only forwards.
#[derive(Clone, PartialEq, Eq)]
pub struct Payload(Bytes);

impl Payload {
    /// Payload with no elements.
    #[must_use]
    pub const fn empty() -> Self {
        Self(Bytes::from_static(EMPTY_ARRAY))
    }

    /// Starts building a payload element by element.
    #[must_use]
    pub fn builder() -> PayloadBuilder {
        PayloadBuilder::default()
    }

    /// Encodes dynamic values as a payload array.
    #[must_use]
    pub fn from_values(values: &[Value]) -> Self {
        let mut builder = Self::builder();
        for value in values {
            builder = builder.value(value);
        }
        builder.build()
    }

    /// Serialises any `serde` value as the payload.
    ///
    /// The value must serialise to a sequence (tuple, `Vec`, tuple struct).
    pub fn from_serialize<T: serde::Serialize + ?Sized>(value: &T) -> Result<Self> {
        let bytes = rmp_serde::to_vec(value).map_err(|e| ProtocolError::Serialisation(e.to_string()))?;
        Self::from_raw(Bytes::from(bytes))
    }

    /// Wraps already-encoded bytes after checking they hold exactly one array.
    pub fn from_raw(bytes: Bytes) -> Result<Self> {
        let mut cursor = Cursor::new(&bytes[..]);
        let value = rmpv::decode::read_value(&mut cursor)
            .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?;
        if !value.is_array() {
            return Err(ProtocolError::InvalidPayload("payload is not an array".into()));
        }
        if usize::try_from(cursor.position()).ok() != Some(bytes.len()) {
            return Err(ProtocolError::InvalidPayload("trailing bytes after payload".into()));
        }
        Ok(Self(bytes))
    }

    /// Wraps bytes the codec has already validated.
    pub(crate) const fn from_validated(bytes: Bytes) -> Self {
        Self(bytes)
    }

    /// Returns the encoded array.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the encoded array as shared bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        self.0.clone()
    }

    /// Decodes every element.
    pub fn values(&self) -> Result<Vec<Value>> {
        match rmpv::decode::read_value(&mut Cursor::new(&self.0[..])) {
            Ok(Value::Array(items)) => Ok(items),
            Ok(_) => Err(ProtocolError::InvalidPayload("payload is not an array".into())),
            Err(e) => Err(ProtocolError::Deserialisation(e.to_string())),
        }
    }

    /// Returns the element at `index`, if present.
    pub fn get(&self, index: usize) -> Result<Option<Value>> {
        Ok(self.values()?.into_iter().nth(index))
    }

    /// Number of elements in the array.
    pub fn len(&self) -> Result<usize> {
        let mut cursor = Cursor::new(&self.0[..]);
        let len = rmp::decode::read_array_len(&mut cursor)
            .map_err(|e| ProtocolError::Deserialisation(e.to_string()))?;
        Ok(len as usize)
    }

    /// Checks whether the array has no elements.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Deserialises the whole array into a user type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        rmp_serde::from_slice(&self.0).map_err(|e| ProtocolError::Deserialisation(e.to_string()))
    }

    /// Extracts the first element as a byte string.
    ///
    /// Both MessagePack `str` and `bin` are accepted, which covers chunk
    /// bodies in either dialect.
    pub fn first_bytes(&self) -> Result<Bytes> {
        match self.get(0)? {
            Some(Value::Binary(data)) => Ok(Bytes::from(data)),
            Some(Value::String(data)) => Ok(Bytes::from(data.into_bytes())),
            Some(other) => Err(ProtocolError::InvalidPayload(format!(
                "expected str or bin, got {other}"
            ))),
            None => Err(ProtocolError::InvalidPayload("payload is empty".into())),
        }
    }

    /// Extracts the event name of an invoke payload.
    pub fn event_name(&self) -> Result<String> {
        match self.get(0) {
            Ok(Some(Value::String(name))) => name.into_str().ok_or(ProtocolError::MissingEventName),
            Ok(Some(Value::Binary(name))) => {
                String::from_utf8(name).map_err(|_| ProtocolError::MissingEventName)
            }
            _ => Err(ProtocolError::MissingEventName),
        }
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.values() {
            Ok(values) => f.debug_tuple("Payload").field(&values).finish(),
            Err(_) => f.debug_tuple("Payload").field(&self.0).finish(),
        }
    }
}

/// Incremental payload encoder.
#[derive(Debug, Default)]
pub struct PayloadBuilder {
    body: Vec<u8>,
    len: u32,
}

impl PayloadBuilder {
    /// Appends a UTF-8 string.
    #[must_use]
    pub fn str(mut self, value: &str) -> Self {
        let _ = rmp::encode::write_str(&mut self.body, value);
        self.len += 1;
        self
    }

    /// Appends raw bytes tagged as a MessagePack `str`.
    ///
    /// Peers speaking V1 expect chunk bodies as `str` even when they are not
    /// valid UTF-8.
    #[must_use]
    pub fn str_bytes(mut self, value: &[u8]) -> Self {
        // A slice longer than u32::MAX cannot be framed anyway.
        let len = u32::try_from(value.len()).unwrap_or(u32::MAX);
        let _ = rmp::encode::write_str_len(&mut self.body, len);
        self.body.extend_from_slice(value);
        self.len += 1;
        self
    }

    /// Appends a MessagePack `bin`.
    #[must_use]
    pub fn bin(mut self, value: &[u8]) -> Self {
        let _ = rmp::encode::write_bin(&mut self.body, value);
        self.len += 1;
        self
    }

    /// Appends an unsigned integer.
    #[must_use]
    pub fn uint(mut self, value: u64) -> Self {
        let _ = rmp::encode::write_uint(&mut self.body, value);
        self.len += 1;
        self
    }

    /// Appends a signed integer.
    #[must_use]
    pub fn int(mut self, value: i64) -> Self {
        let _ = rmp::encode::write_sint(&mut self.body, value);
        self.len += 1;
        self
    }

    /// Appends a `[first, second]` integer pair.
    #[must_use]
    pub fn pair(mut self, first: i64, second: i64) -> Self {
        let _ = rmp::encode::write_array_len(&mut self.body, 2);
        let _ = rmp::encode::write_sint(&mut self.body, first);
        let _ = rmp::encode::write_sint(&mut self.body, second);
        self.len += 1;
        self
    }

    /// Appends an arbitrary dynamic value.
    #[must_use]
    pub fn value(mut self, value: &Value) -> Self {
        let _ = rmpv::encode::write_value(&mut self.body, value);
        self.len += 1;
        self
    }

    /// Finishes the array.
    #[must_use]
    pub fn build(self) -> Payload {
        let mut out = Vec::with_capacity(self.body.len() + 5);
        let _ = rmp::encode::write_array_len(&mut out, self.len);
        out.extend_from_slice(&self.body);
        Payload(Bytes::from(out))
    }
}

/// A single protocol message: session id, type and payload.
///
/// Messages are immutable once built. Constructors for the protocol frames
/// live on [`crate::Dialect`]; this type is dialect-agnostic.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    session: u64,
    ty: u64,
    payload: Payload,
    headers: Option<Headers>,
}

impl Message {
    /// Creates a message without headers.
    #[must_use]
    pub const fn new(session: u64, ty: u64, payload: Payload) -> Self {
        Self {
            session,
            ty,
            payload,
            headers: None,
        }
    }

    /// Attaches headers, replacing any present.
    #[must_use]
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = if headers.is_empty() { None } else { Some(headers) };
        self
    }

    /// Session this message belongs to.
    #[must_use]
    pub const fn session(&self) -> u64 {
        self.session
    }

    /// Dialect-specific type code.
    #[must_use]
    pub const fn ty(&self) -> u64 {
        self.ty
    }

    /// The raw payload array.
    #[must_use]
    pub const fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Headers, if the frame carried any.
    #[must_use]
    pub const fn headers(&self) -> Option<&Headers> {
        self.headers.as_ref()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "message session={} type={} payload={:?}", self.session, self.ty, self.payload)
    }
}
