//! Bencode codec that preserves source byte ranges.
//!
//! Every parsed value remembers the `[start, end)` range of the bytes that
//! produced it, delimiters included, so slicing the original buffer at that
//! range reproduces the exact encoding. Info-hash derivation depends on this:
//! the hash covers the raw bytes of the `info` value, not a re-serialization.

use super::TorrentError;

/// Byte range `[start, end)` of a parsed value within its source buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    /// Slices `source` at this range.
    ///
    /// Panics if the span does not fit `source`; spans produced by `parse`
    /// always fit the buffer they were parsed from.
    pub fn slice<'a>(&self, source: &'a [u8]) -> &'a [u8] {
        &source[self.start..self.end]
    }

    /// Number of bytes covered by the span.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Returns true for the empty range.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// A bencode value annotated with its source span.
///
/// Values built programmatically (for serialization) carry an empty span;
/// spans are meaningful only on values returned by [`BencodeValue::parse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BencodeValue {
    kind: BencodeKind,
    span: Span,
}

/// The four bencode shapes.
///
/// Dictionaries are backed by an insertion-ordered pair list, not a sorted
/// map: serialization must reproduce the key order of the parsed input
/// byte-exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BencodeKind {
    Integer(i64),
    Bytes(Vec<u8>),
    List(Vec<BencodeValue>),
    Dict(Vec<(Vec<u8>, BencodeValue)>),
}

impl BencodeValue {
    /// Parses a complete bencode buffer.
    ///
    /// Single-pass recursive descent, O(n) in the input length. The whole
    /// buffer must be consumed; trailing bytes are rejected.
    ///
    /// # Errors
    ///
    /// - `TorrentError::MalformedEncoding` - If the buffer is not a single
    ///   well-formed bencode value
    pub fn parse(input: &[u8]) -> Result<Self, TorrentError> {
        let mut parser = Parser { input, pos: 0 };
        let value = parser.parse_value()?;
        if parser.pos != input.len() {
            return Err(malformed(format!(
                "trailing data at offset {}",
                parser.pos
            )));
        }
        Ok(value)
    }

    /// Builds an integer value (empty span).
    pub fn integer(value: i64) -> Self {
        Self {
            kind: BencodeKind::Integer(value),
            span: Span::default(),
        }
    }

    /// Builds a byte-string value (empty span).
    pub fn bytes(value: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: BencodeKind::Bytes(value.into()),
            span: Span::default(),
        }
    }

    /// Builds a list value (empty span).
    pub fn list(items: Vec<BencodeValue>) -> Self {
        Self {
            kind: BencodeKind::List(items),
            span: Span::default(),
        }
    }

    /// Builds a dictionary value preserving the given entry order (empty span).
    pub fn dict(entries: Vec<(Vec<u8>, BencodeValue)>) -> Self {
        Self {
            kind: BencodeKind::Dict(entries),
            span: Span::default(),
        }
    }

    /// Serializes canonically: dictionary keys in insertion order, integers
    /// in minimal decimal form, byte-strings unescaped.
    ///
    /// For any value returned by `parse`, the serialization equals the bytes
    /// covered by the value's span.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match &self.kind {
            BencodeKind::Integer(value) => {
                out.push(b'i');
                out.extend_from_slice(value.to_string().as_bytes());
                out.push(b'e');
            }
            BencodeKind::Bytes(bytes) => {
                out.extend_from_slice(bytes.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(bytes);
            }
            BencodeKind::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode_into(out);
                }
                out.push(b'e');
            }
            BencodeKind::Dict(entries) => {
                out.push(b'd');
                for (key, value) in entries {
                    out.extend_from_slice(key.len().to_string().as_bytes());
                    out.push(b':');
                    out.extend_from_slice(key);
                    value.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }

    /// Returns the source span of this value.
    pub fn span(&self) -> Span {
        self.span
    }

    /// Returns the underlying shape.
    pub fn kind(&self) -> &BencodeKind {
        &self.kind
    }

    /// Returns the integer payload, if this is an integer.
    pub fn as_integer(&self) -> Option<i64> {
        match &self.kind {
            BencodeKind::Integer(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the byte-string payload, if this is a byte-string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.kind {
            BencodeKind::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Returns the byte-string payload as UTF-8, if valid.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|bytes| std::str::from_utf8(bytes).ok())
    }

    /// Returns the list items, if this is a list.
    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match &self.kind {
            BencodeKind::List(items) => Some(items),
            _ => None,
        }
    }

    /// Returns the dictionary entries in insertion order, if this is a
    /// dictionary.
    pub fn as_dict(&self) -> Option<&[(Vec<u8>, BencodeValue)]> {
        match &self.kind {
            BencodeKind::Dict(entries) => Some(entries),
            _ => None,
        }
    }

    /// Looks up a dictionary key; first match wins.
    pub fn get(&self, key: &[u8]) -> Option<&BencodeValue> {
        self.as_dict()?
            .iter()
            .find(|(entry_key, _)| entry_key == key)
            .map(|(_, value)| value)
    }
}

fn malformed(reason: impl Into<String>) -> TorrentError {
    TorrentError::MalformedEncoding {
        reason: reason.into(),
    }
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Result<u8, TorrentError> {
        self.input
            .get(self.pos)
            .copied()
            .ok_or_else(|| malformed(format!("unexpected end of input at offset {}", self.pos)))
    }

    fn expect(&mut self, byte: u8) -> Result<(), TorrentError> {
        let found = self.peek()?;
        if found != byte {
            return Err(malformed(format!(
                "expected {:?} at offset {}, found {:?}",
                byte as char, self.pos, found as char
            )));
        }
        self.pos += 1;
        Ok(())
    }

    fn parse_value(&mut self) -> Result<BencodeValue, TorrentError> {
        let start = self.pos;
        let kind = match self.peek()? {
            b'i' => self.parse_integer()?,
            b'l' => self.parse_list()?,
            b'd' => self.parse_dict()?,
            b'0'..=b'9' => BencodeKind::Bytes(self.parse_byte_string()?),
            other => {
                return Err(malformed(format!(
                    "unexpected byte {:#04x} at offset {}",
                    other, self.pos
                )));
            }
        };
        Ok(BencodeValue {
            kind,
            span: Span {
                start,
                end: self.pos,
            },
        })
    }

    fn parse_integer(&mut self) -> Result<BencodeKind, TorrentError> {
        self.expect(b'i')?;
        let digits_start = self.pos;
        if self.peek()? == b'-' {
            self.pos += 1;
        }
        while self.peek()?.is_ascii_digit() {
            self.pos += 1;
        }
        let digits = &self.input[digits_start..self.pos];
        self.expect(b'e')?;

        if digits.is_empty() || digits == b"-" {
            return Err(malformed(format!(
                "integer without digits at offset {digits_start}"
            )));
        }
        // Canonical form only: no leading zeros, no negative zero.
        let unsigned = if digits[0] == b'-' { &digits[1..] } else { digits };
        if unsigned.len() > 1 && unsigned[0] == b'0' {
            return Err(malformed(format!(
                "integer with leading zero at offset {digits_start}"
            )));
        }
        if digits == b"-0" {
            return Err(malformed(format!(
                "negative zero integer at offset {digits_start}"
            )));
        }

        let text = std::str::from_utf8(digits)
            .map_err(|_| malformed(format!("non-numeric integer at offset {digits_start}")))?;
        let value = text
            .parse::<i64>()
            .map_err(|_| malformed(format!("integer out of range at offset {digits_start}")))?;
        Ok(BencodeKind::Integer(value))
    }

    fn parse_byte_string(&mut self) -> Result<Vec<u8>, TorrentError> {
        let digits_start = self.pos;
        while self.peek()?.is_ascii_digit() {
            self.pos += 1;
        }
        let digits = &self.input[digits_start..self.pos];
        self.expect(b':')?;

        if digits.is_empty() {
            return Err(malformed(format!(
                "byte-string without length at offset {digits_start}"
            )));
        }
        if digits.len() > 1 && digits[0] == b'0' {
            return Err(malformed(format!(
                "byte-string length with leading zero at offset {digits_start}"
            )));
        }

        let text = std::str::from_utf8(digits)
            .map_err(|_| malformed(format!("non-numeric length at offset {digits_start}")))?;
        let length = text
            .parse::<usize>()
            .map_err(|_| malformed(format!("length out of range at offset {digits_start}")))?;

        if self.pos + length > self.input.len() {
            return Err(malformed(format!(
                "byte-string of length {length} exceeds input at offset {}",
                self.pos
            )));
        }
        let bytes = self.input[self.pos..self.pos + length].to_vec();
        self.pos += length;
        Ok(bytes)
    }

    fn parse_list(&mut self) -> Result<BencodeKind, TorrentError> {
        self.expect(b'l')?;
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.parse_value()?);
        }
        self.pos += 1; // consume 'e'
        Ok(BencodeKind::List(items))
    }

    fn parse_dict(&mut self) -> Result<BencodeKind, TorrentError> {
        self.expect(b'd')?;
        let mut entries = Vec::new();
        while self.peek()? != b'e' {
            if !self.peek()?.is_ascii_digit() {
                return Err(malformed(format!(
                    "dictionary key must be a byte-string at offset {}",
                    self.pos
                )));
            }
            let key = self.parse_byte_string()?;
            let value = self.parse_value()?;
            entries.push((key, value));
        }
        self.pos += 1; // consume 'e'
        Ok(BencodeKind::Dict(entries))
    }
}
