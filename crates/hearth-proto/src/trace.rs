//! Frame headers and the distributed-trace ids carried in them.
//!
//! Each header entry is `[indexed: bool, number: uint, value: bin]`. Trace
//! ids use three well-known numbers and store the id as a little-endian
//! `u64` in eight bytes.

use rmpv::Value;

/// Header number carrying the trace id.
pub const TRACE_ID: u64 = 80;

/// Header number carrying the span id.
pub const SPAN_ID: u64 = 81;

/// Header number carrying the parent span id.
pub const PARENT_ID: u64 = 82;

/// Headers attached to a message, kept as raw entries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers(Vec<Value>);

impl Headers {
    /// Creates headers from raw entries.
    #[must_use]
    pub const fn new(entries: Vec<Value>) -> Self {
        Self(entries)
    }

    /// Raw header entries.
    #[must_use]
    pub fn entries(&self) -> &[Value] {
        &self.0
    }

    /// Checks whether there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Appends a `[false, number, value]` entry.
    pub fn push(&mut self, number: u64, value: Vec<u8>) {
        self.0.push(Value::Array(vec![
            Value::Boolean(false),
            Value::from(number),
            Value::Binary(value),
        ]));
    }

    /// Looks up the value of the first entry with the given number.
    #[must_use]
    pub fn get(&self, number: u64) -> Option<&[u8]> {
        self.0.iter().find_map(|entry| match parse_entry(entry) {
            Some((n, value)) if n == number => Some(value),
            _ => None,
        })
    }

    /// Extracts trace ids. All three entries must be present.
    ///
    /// An entry for the parent id with an empty value means "no parent".
    #[must_use]
    pub fn trace_info(&self) -> Option<TraceInfo> {
        let trace = decode_id(self.get(TRACE_ID)?)?;
        let span = decode_id(self.get(SPAN_ID)?)?;
        let parent = match self.get(PARENT_ID)? {
            [] => 0,
            value => decode_id(value)?,
        };
        Some(TraceInfo { trace, span, parent })
    }
}

impl From<TraceInfo> for Headers {
    fn from(info: TraceInfo) -> Self {
        let mut headers = Self::default();
        headers.push(TRACE_ID, info.trace.to_le_bytes().to_vec());
        headers.push(SPAN_ID, info.span.to_le_bytes().to_vec());
        headers.push(PARENT_ID, info.parent.to_le_bytes().to_vec());
        headers
    }
}

fn parse_entry(entry: &Value) -> Option<(u64, &[u8])> {
    let Value::Array(parts) = entry else {
        return None;
    };
    let [_, number, value] = parts.as_slice() else {
        return None;
    };
    let number = number.as_u64()?;
    let value = match value {
        Value::Binary(bytes) => bytes.as_slice(),
        Value::String(s) => s.as_bytes(),
        Value::Nil => &[],
        _ => return None,
    };
    Some((number, value))
}

fn decode_id(bytes: &[u8]) -> Option<u64> {
    let raw: [u8; 8] = bytes.try_into().ok()?;
    Some(u64::from_le_bytes(raw))
}

/// Trace ids of the request a handler is serving.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TraceInfo {
    /// Id shared by every span of one distributed request.
    pub trace: u64,
    /// Id of this span.
    pub span: u64,
    /// Id of the calling span, zero at the root.
    pub parent: u64,
}

impl TraceInfo {
    /// Derives a child span for an outbound call made while serving `self`.
    #[must_use]
    pub const fn child(self, span: u64) -> Self {
        Self {
            trace: self.trace,
            span,
            parent: self.span,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_info_roundtrip() {
        let info = TraceInfo {
            trace: 0xdead_beef,
            span: 42,
            parent: 7,
        };
        let headers = Headers::from(info);
        assert_eq!(headers.trace_info(), Some(info));
    }

    #[test]
    fn empty_parent_means_root() {
        let mut headers = Headers::default();
        headers.push(TRACE_ID, 1u64.to_le_bytes().to_vec());
        headers.push(SPAN_ID, 2u64.to_le_bytes().to_vec());
        headers.push(PARENT_ID, Vec::new());

        let info = headers.trace_info().unwrap();
        assert_eq!(info.parent, 0);
        assert_eq!(info.span, 2);
    }

    #[test]
    fn missing_entry_yields_none() {
        let mut headers = Headers::default();
        headers.push(TRACE_ID, 1u64.to_le_bytes().to_vec());
        assert_eq!(headers.trace_info(), None);
    }

    #[test]
    fn unrelated_entries_are_skipped() {
        let mut headers = Headers::new(vec![Value::from(12), Value::from("junk")]);
        headers.push(TRACE_ID, 9u64.to_le_bytes().to_vec());
        headers.push(SPAN_ID, 9u64.to_le_bytes().to_vec());
        headers.push(PARENT_ID, 0u64.to_le_bytes().to_vec());
        assert_eq!(headers.trace_info().map(|t| t.trace), Some(9));
    }

    #[test]
    fn child_span_links_parent() {
        let root = TraceInfo {
            trace: 1,
            span: 1,
            parent: 0,
        };
        let child = root.child(5);
        assert_eq!(child.trace, 1);
        assert_eq!(child.parent, 1);
        assert_eq!(child.span, 5);
    }
}
