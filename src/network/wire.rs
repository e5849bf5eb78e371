//! Tag-Value Wire Format
//!
//! Every field is written as a varint key `(tag << 3) | wire_type` followed by
//! its value. Scalars at their default value are omitted, which is what makes
//! sparse deltas cheap. Repeated scalars are packed behind one length prefix.
//!
//! | Wire type | Code | Used for |
//! |-----------|------|----------|
//! | Varint | 0 | integers, bools, enums |
//! | Fixed64 | 1 | skipped only |
//! | LengthDelimited | 2 | strings, bytes, sub-messages, packed scalars |
//! | Fixed32 | 5 | `f32` little-endian |

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub use crate::error::ParseError;

/// Decode result.
pub type WireResult<T> = Result<T, ParseError>;

// =============================================================================
// WIRE TYPES
// =============================================================================

/// Wire type of a field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum WireType {
    /// LEB128 varint
    Varint = 0,
    /// 8 little-endian bytes
    Fixed64 = 1,
    /// Varint length followed by bytes
    LengthDelimited = 2,
    /// 4 little-endian bytes
    Fixed32 = 5,
}

impl WireType {
    /// Parse the low three bits of a key.
    pub fn from_bits(bits: u8) -> WireResult<Self> {
        match bits {
            0 => Ok(WireType::Varint),
            1 => Ok(WireType::Fixed64),
            2 => Ok(WireType::LengthDelimited),
            5 => Ok(WireType::Fixed32),
            other => Err(ParseError::InvalidWireType(other)),
        }
    }
}

/// Zigzag-encode a signed integer.
#[inline]
pub fn zigzag_encode(n: i64) -> u64 {
    ((n << 1) ^ (n >> 63)) as u64
}

/// Zigzag-decode an unsigned integer.
#[inline]
pub fn zigzag_decode(n: u64) -> i64 {
    ((n >> 1) as i64) ^ -((n & 1) as i64)
}

// =============================================================================
// MESSAGE TRAIT
// =============================================================================

/// A message with a stable tag-value encoding.
pub trait WireMessage: Default {
    /// Write every present field.
    fn encode_fields(&self, w: &mut WireWriter);

    /// Merge one decoded field. Returns `Ok(false)` for unknown tags, which
    /// the caller skips.
    fn merge_field(&mut self, tag: u32, wire_type: WireType, r: &mut WireReader<'_>) -> WireResult<bool>;

    /// Validate after all fields are merged.
    fn finish(&mut self) -> WireResult<()> {
        Ok(())
    }

    /// Encode into a fresh vector.
    fn encode_to_vec(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        self.encode_fields(&mut w);
        w.into_vec()
    }

    /// Encode into a frozen buffer.
    fn encode_to_bytes(&self) -> Bytes {
        let mut w = WireWriter::new();
        self.encode_fields(&mut w);
        w.into_bytes()
    }

    /// Encoded size in bytes.
    fn encoded_len(&self) -> usize {
        let mut w = WireWriter::new();
        self.encode_fields(&mut w);
        w.len()
    }

    /// Decode a complete message. Unknown fields are skipped.
    fn decode(buf: &[u8]) -> WireResult<Self> {
        let mut msg = Self::default();
        let mut r = WireReader::new(buf);
        while !r.is_empty() {
            let (tag, wire_type) = r.read_key()?;
            if !msg.merge_field(tag, wire_type, &mut r)? {
                r.skip(wire_type)?;
            }
        }
        msg.finish()?;
        Ok(msg)
    }
}

// =============================================================================
// WRITER
// =============================================================================

/// Field writer backed by a growable buffer.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self { buf: BytesMut::with_capacity(64) }
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Check if nothing was written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Freeze into `Bytes`.
    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }

    /// Copy into a vector.
    pub fn into_vec(self) -> Vec<u8> {
        self.buf.to_vec()
    }

    /// Write a raw varint.
    pub fn put_varint(&mut self, mut value: u64) {
        while value >= 0x80 {
            self.buf.put_u8((value as u8) | 0x80);
            value >>= 7;
        }
        self.buf.put_u8(value as u8);
    }

    /// Write a field key.
    pub fn put_key(&mut self, tag: u32, wire_type: WireType) {
        self.put_varint(((tag as u64) << 3) | wire_type as u64);
    }

    fn put_len_delimited(&mut self, tag: u32, data: &[u8]) {
        self.put_key(tag, WireType::LengthDelimited);
        self.put_varint(data.len() as u64);
        self.buf.put_slice(data);
    }

    /// Unsigned integer, omitted at zero.
    pub fn uint64(&mut self, tag: u32, value: u64) {
        if value != 0 {
            self.put_key(tag, WireType::Varint);
            self.put_varint(value);
        }
    }

    /// Unsigned 32-bit integer, omitted at zero.
    pub fn uint32(&mut self, tag: u32, value: u32) {
        self.uint64(tag, value as u64);
    }

    /// Zigzag signed integer, omitted at zero.
    pub fn sint64(&mut self, tag: u32, value: i64) {
        if value != 0 {
            self.put_key(tag, WireType::Varint);
            self.put_varint(zigzag_encode(value));
        }
    }

    /// Zigzag signed 32-bit integer, omitted at zero.
    pub fn sint32(&mut self, tag: u32, value: i32) {
        self.sint64(tag, value as i64);
    }

    /// Bool, omitted when false.
    pub fn bool(&mut self, tag: u32, value: bool) {
        if value {
            self.put_key(tag, WireType::Varint);
            self.put_varint(1);
        }
    }

    /// Float, omitted at positive zero.
    pub fn float(&mut self, tag: u32, value: f32) {
        if value.to_bits() != 0 {
            self.put_float_unchecked(tag, value);
        }
    }

    fn put_float_unchecked(&mut self, tag: u32, value: f32) {
        self.put_key(tag, WireType::Fixed32);
        self.buf.put_f32_le(value);
    }

    /// String, omitted when empty.
    pub fn string(&mut self, tag: u32, value: &str) {
        if !value.is_empty() {
            self.put_len_delimited(tag, value.as_bytes());
        }
    }

    /// Bytes, omitted when empty.
    pub fn bytes(&mut self, tag: u32, value: &[u8]) {
        if !value.is_empty() {
            self.put_len_delimited(tag, value);
        }
    }

    /// Sub-message, always written.
    pub fn message<M: WireMessage>(&mut self, tag: u32, msg: &M) {
        let mut inner = WireWriter::new();
        msg.encode_fields(&mut inner);
        self.put_len_delimited(tag, &inner.buf);
    }

    /// Repeated sub-messages, one field per element.
    pub fn messages<M: WireMessage>(&mut self, tag: u32, msgs: &[M]) {
        for msg in msgs {
            self.message(tag, msg);
        }
    }

    /// Packed repeated unsigned integers, omitted when empty.
    pub fn packed_uint64<I>(&mut self, tag: u32, values: I)
    where
        I: IntoIterator<Item = u64>,
    {
        let mut inner = WireWriter::new();
        for v in values {
            inner.put_varint(v);
        }
        if !inner.is_empty() {
            self.put_len_delimited(tag, &inner.buf);
        }
    }

    /// Packed repeated `u32`.
    pub fn packed_uint32(&mut self, tag: u32, values: &[u32]) {
        self.packed_uint64(tag, values.iter().map(|v| *v as u64));
    }

    /// Present-if-some unsigned integer (written even when zero).
    pub fn opt_uint64(&mut self, tag: u32, value: Option<u64>) {
        if let Some(v) = value {
            self.put_key(tag, WireType::Varint);
            self.put_varint(v);
        }
    }

    /// Present-if-some `u32`.
    pub fn opt_uint32(&mut self, tag: u32, value: Option<u32>) {
        self.opt_uint64(tag, value.map(u64::from));
    }

    /// Present-if-some bool (written even when false).
    pub fn opt_bool(&mut self, tag: u32, value: Option<bool>) {
        if let Some(v) = value {
            self.put_key(tag, WireType::Varint);
            self.put_varint(v as u64);
        }
    }

    /// Present-if-some float (written even when zero).
    pub fn opt_float(&mut self, tag: u32, value: Option<f32>) {
        if let Some(v) = value {
            self.put_float_unchecked(tag, v);
        }
    }

    /// Present-if-some string (written even when empty).
    pub fn opt_string(&mut self, tag: u32, value: Option<&str>) {
        if let Some(v) = value {
            self.put_len_delimited(tag, v.as_bytes());
        }
    }

    /// Present-if-some sub-message.
    pub fn opt_message<M: WireMessage>(&mut self, tag: u32, msg: Option<&M>) {
        if let Some(m) = msg {
            self.message(tag, m);
        }
    }
}

// =============================================================================
// READER
// =============================================================================

/// Field reader over a borrowed slice. Every read checks remaining length
/// first, so truncated input fails with [`ParseError::UnexpectedEof`].
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    /// Create a reader.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Check if all input was consumed.
    pub fn is_empty(&self) -> bool {
        !self.buf.has_remaining()
    }

    /// Read a raw varint.
    pub fn read_varint(&mut self) -> WireResult<u64> {
        let mut value = 0u64;
        for i in 0..10 {
            if !self.buf.has_remaining() {
                return Err(ParseError::UnexpectedEof);
            }
            let byte = self.buf.get_u8();
            if i == 9 && byte > 1 {
                return Err(ParseError::VarintOverflow);
            }
            value |= ((byte & 0x7f) as u64) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(ParseError::VarintOverflow)
    }

    /// Read a field key.
    pub fn read_key(&mut self) -> WireResult<(u32, WireType)> {
        let key = self.read_varint()?;
        let wire_type = WireType::from_bits((key & 0x7) as u8)?;
        let tag = key >> 3;
        if tag == 0 || tag > u32::MAX as u64 {
            return Err(ParseError::InvalidTag);
        }
        Ok((tag as u32, wire_type))
    }

    fn read_len_delimited_raw(&mut self) -> WireResult<&'a [u8]> {
        let len = self.read_varint()?;
        if len > self.buf.remaining() as u64 {
            return Err(ParseError::UnexpectedEof);
        }
        let (head, tail) = self.buf.split_at(len as usize);
        self.buf = tail;
        Ok(head)
    }

    /// Skip a field's value.
    pub fn skip(&mut self, wire_type: WireType) -> WireResult<()> {
        match wire_type {
            WireType::Varint => {
                self.read_varint()?;
            }
            WireType::Fixed64 => self.advance_checked(8)?,
            WireType::Fixed32 => self.advance_checked(4)?,
            WireType::LengthDelimited => {
                self.read_len_delimited_raw()?;
            }
        }
        Ok(())
    }

    fn advance_checked(&mut self, n: usize) -> WireResult<()> {
        if self.buf.remaining() < n {
            return Err(ParseError::UnexpectedEof);
        }
        self.buf.advance(n);
        Ok(())
    }

    fn expect(tag: u32, found: WireType, expected: WireType) -> WireResult<()> {
        if found == expected {
            Ok(())
        } else {
            Err(ParseError::WireTypeMismatch {
                tag,
                expected: expected as u8,
                found: found as u8,
            })
        }
    }

    /// Unsigned integer field.
    pub fn uint64(&mut self, tag: u32, wire_type: WireType) -> WireResult<u64> {
        Self::expect(tag, wire_type, WireType::Varint)?;
        self.read_varint()
    }

    /// `u32` field; wider values are rejected.
    pub fn uint32(&mut self, tag: u32, wire_type: WireType, field: &'static str) -> WireResult<u32> {
        let value = self.uint64(tag, wire_type)?;
        u32::try_from(value).map_err(|_| ParseError::OutOfRange { field, value })
    }

    /// Zigzag signed integer field.
    pub fn sint64(&mut self, tag: u32, wire_type: WireType) -> WireResult<i64> {
        Ok(zigzag_decode(self.uint64(tag, wire_type)?))
    }

    /// Zigzag `i32` field; wider values are rejected.
    pub fn sint32(&mut self, tag: u32, wire_type: WireType, field: &'static str) -> WireResult<i32> {
        let raw = self.uint64(tag, wire_type)?;
        i32::try_from(zigzag_decode(raw)).map_err(|_| ParseError::OutOfRange { field, value: raw })
    }

    /// Bool field.
    pub fn bool(&mut self, tag: u32, wire_type: WireType) -> WireResult<bool> {
        Ok(self.uint64(tag, wire_type)? != 0)
    }

    /// Float field.
    pub fn float(&mut self, tag: u32, wire_type: WireType) -> WireResult<f32> {
        Self::expect(tag, wire_type, WireType::Fixed32)?;
        if self.buf.remaining() < 4 {
            return Err(ParseError::UnexpectedEof);
        }
        Ok(self.buf.get_f32_le())
    }

    /// String field.
    pub fn string(&mut self, tag: u32, wire_type: WireType) -> WireResult<String> {
        Self::expect(tag, wire_type, WireType::LengthDelimited)?;
        let raw = self.read_len_delimited_raw()?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| ParseError::InvalidUtf8(tag))
    }

    /// Bytes field.
    pub fn bytes(&mut self, tag: u32, wire_type: WireType) -> WireResult<Bytes> {
        Self::expect(tag, wire_type, WireType::LengthDelimited)?;
        Ok(Bytes::copy_from_slice(self.read_len_delimited_raw()?))
    }

    /// Sub-message field.
    pub fn message<M: WireMessage>(&mut self, tag: u32, wire_type: WireType) -> WireResult<M> {
        Self::expect(tag, wire_type, WireType::LengthDelimited)?;
        M::decode(self.read_len_delimited_raw()?)
    }

    /// Repeated unsigned integers, packed or one element per field.
    pub fn packed_uint64(&mut self, tag: u32, wire_type: WireType, out: &mut Vec<u64>) -> WireResult<()> {
        match wire_type {
            WireType::Varint => {
                out.push(self.read_varint()?);
                Ok(())
            }
            WireType::LengthDelimited => {
                let mut inner = WireReader::new(self.read_len_delimited_raw()?);
                while !inner.is_empty() {
                    out.push(inner.read_varint()?);
                }
                Ok(())
            }
            other => Self::expect(tag, other, WireType::LengthDelimited),
        }
    }

    /// Repeated `u32`, packed or unpacked; wider values are rejected.
    pub fn packed_uint32(
        &mut self,
        tag: u32,
        wire_type: WireType,
        field: &'static str,
        out: &mut Vec<u32>,
    ) -> WireResult<()> {
        let mut wide = Vec::new();
        self.packed_uint64(tag, wire_type, &mut wide)?;
        for value in wide {
            out.push(u32::try_from(value).map_err(|_| ParseError::OutOfRange { field, value })?);
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
