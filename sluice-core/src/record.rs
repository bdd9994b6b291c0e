//! Record types flowing through the shuffle stage.
//!
//! A record is a header describing where it came from plus a body: an
//! ordered mapping of field name to value. The shuffle stage stamps
//! provenance fields into the body and ships the bodies, so bodies carry a
//! self-describing binary encoding (every value is type-tagged).
//!
//! # Body Encoding
//!
//! ```text
//! field_count: u32
//! repeated:
//!   name:  u32 len + utf-8
//!   tag:   u8   (0 null, 1 bool, 2 int, 3 float, 4 str, 5 bytes)
//!   value: tag-dependent
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec;
use crate::CodecError;

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_STR: u8 = 4;
const TAG_BYTES: u8 = 5;

/// A single value in a record body.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Absent value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed integer value.
    Int(i64),
    /// Floating point value.
    Float(f64),
    /// UTF-8 string value.
    Str(String),
    /// Opaque bytes.
    Bytes(Bytes),
}

impl FieldValue {
    /// Returns the string value, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the boolean value, if this is a boolean.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the bytes value, if this is a byte string.
    #[must_use]
    pub const fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the encoded size of this value including its tag.
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        1 + match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::Int(_) | Self::Float(_) => 8,
            Self::Str(s) => 4 + s.len(),
            Self::Bytes(b) => 4 + b.len(),
        }
    }

    /// Encodes the value with its type tag.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Self::Null => buf.put_u8(TAG_NULL),
            Self::Bool(b) => {
                buf.put_u8(TAG_BOOL);
                buf.put_u8(u8::from(*b));
            }
            Self::Int(i) => {
                buf.put_u8(TAG_INT);
                buf.put_i64_le(*i);
            }
            Self::Float(v) => {
                buf.put_u8(TAG_FLOAT);
                buf.put_f64_le(*v);
            }
            Self::Str(s) => {
                buf.put_u8(TAG_STR);
                codec::put_str(buf, s);
            }
            Self::Bytes(b) => {
                buf.put_u8(TAG_BYTES);
                codec::put_bytes(buf, b);
            }
        }
    }

    /// Decodes a tagged value.
    ///
    /// # Errors
    /// Returns an error if the buffer is truncated or the tag is unknown.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        let tag = codec::get_u8(buf, "field value tag")?;
        match tag {
            TAG_NULL => Ok(Self::Null),
            TAG_BOOL => Ok(Self::Bool(codec::get_u8(buf, "bool value")? != 0)),
            TAG_INT => {
                codec::ensure(buf, 8, "int value")?;
                Ok(Self::Int(buf.get_i64_le()))
            }
            TAG_FLOAT => {
                codec::ensure(buf, 8, "float value")?;
                Ok(Self::Float(buf.get_f64_le()))
            }
            TAG_STR => Ok(Self::Str(codec::get_str(buf, "str value")?)),
            TAG_BYTES => Ok(Self::Bytes(codec::get_bytes(buf, "bytes value")?)),
            tag => Err(CodecError::UnknownTag {
                context: "field value",
                tag,
            }),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<Bytes> for FieldValue {
    fn from(value: Bytes) -> Self {
        Self::Bytes(value)
    }
}

/// Ordered mapping of field name to value.
///
/// Insertion order is preserved. Inserting an existing name replaces the
/// value in place without moving the field.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RecordBody {
    fields: Vec<(String, FieldValue)>,
}

impl RecordBody {
    /// Creates an empty body.
    #[must_use]
    pub const fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Adds a field, builder style.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.insert(name, value);
        self
    }

    /// Inserts or replaces a field, returning the previous value.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        value: impl Into<FieldValue>,
    ) -> Option<FieldValue> {
        let name = name.into();
        let value = value.into();
        if let Some((_, existing)) = self.fields.iter_mut().find(|(n, _)| *n == name) {
            return Some(std::mem::replace(existing, value));
        }
        self.fields.push((name, value));
        None
    }

    /// Returns the value of a field.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Returns the value of a string field.
    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(FieldValue::as_str)
    }

    /// Returns the number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns true if the body has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterates over fields in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Returns the encoded size of the body.
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        4 + self
            .fields
            .iter()
            .map(|(n, v)| 4 + n.len() + v.encoded_size())
            .sum::<usize>()
    }

    /// Encodes the body.
    #[allow(clippy::cast_possible_truncation)] // Field count bounded by limits.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.fields.len() as u32);
        for (name, value) in &self.fields {
            codec::put_str(buf, name);
            value.encode(buf);
        }
    }

    /// Decodes a body, refusing more than `fields_max` fields.
    ///
    /// # Errors
    /// Returns an error if the buffer is truncated, a value is malformed, or
    /// the field count is above `fields_max`.
    pub fn decode(buf: &mut impl Buf, fields_max: u32) -> Result<Self, CodecError> {
        let count = codec::get_u32(buf, "field count")?;
        if count > fields_max {
            return Err(CodecError::TooMany {
                context: "body fields",
                count: u64::from(count),
                max: u64::from(fields_max),
            });
        }
        let mut fields = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name = codec::get_str(buf, "field name")?;
            let value = FieldValue::decode(buf)?;
            fields.push((name, value));
        }
        Ok(Self { fields })
    }
}

/// Where a record came from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RecordHeader {
    /// Offset of the record in its source queue.
    pub offset: String,
    /// Source queue the record was read from.
    pub queue_id: String,
    /// Whether `offset` uses the long numeric format.
    pub is_long_offset_format: bool,
    /// Trace id for observability.
    pub trace_id: String,
    /// System-origin records never enter the shuffle.
    pub is_system_message: bool,
}

impl RecordHeader {
    /// Creates a header for a data record.
    #[must_use]
    pub fn new(queue_id: impl Into<String>, offset: impl Into<String>) -> Self {
        Self {
            offset: offset.into(),
            queue_id: queue_id.into(),
            ..Self::default()
        }
    }

    /// Sets the trace id.
    #[must_use]
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    /// Marks the offset as long-format.
    #[must_use]
    pub const fn with_long_offset(mut self) -> Self {
        self.is_long_offset_format = true;
        self
    }

    /// Marks the record as system-origin.
    #[must_use]
    pub const fn system(mut self) -> Self {
        self.is_system_message = true;
        self
    }

    /// Encodes the header.
    pub fn encode(&self, buf: &mut BytesMut) {
        codec::put_str(buf, &self.offset);
        codec::put_str(buf, &self.queue_id);
        buf.put_u8(u8::from(self.is_long_offset_format));
        codec::put_str(buf, &self.trace_id);
        buf.put_u8(u8::from(self.is_system_message));
    }

    /// Encodes the header into a standalone buffer.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            4 + self.offset.len() + 4 + self.queue_id.len() + 1 + 4 + self.trace_id.len() + 1,
        );
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decodes a header.
    ///
    /// # Errors
    /// Returns an error if the buffer is truncated or malformed.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        let offset = codec::get_str(buf, "header offset")?;
        let queue_id = codec::get_str(buf, "header queue id")?;
        let is_long_offset_format = codec::get_u8(buf, "header offset format")? != 0;
        let trace_id = codec::get_str(buf, "header trace id")?;
        let is_system_message = codec::get_u8(buf, "header system flag")? != 0;
        Ok(Self {
            offset,
            queue_id,
            is_long_offset_format,
            trace_id,
            is_system_message,
        })
    }
}

/// An inbound record: header plus body.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    /// Provenance header.
    pub header: RecordHeader,
    /// Ordered field mapping.
    pub body: RecordBody,
}

impl Record {
    /// Creates a record.
    #[must_use]
    pub const fn new(header: RecordHeader, body: RecordBody) -> Self {
        Self { header, body }
    }

    /// Returns true if the record is system-origin.
    #[must_use]
    pub const fn is_system_message(&self) -> bool {
        self.header.is_system_message
    }
}

/// Compression codec for shuffle envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Compression {
    /// No compression.
    None = 0,
    /// LZ4 block compression with the uncompressed size prepended.
    #[default]
    Lz4 = 1,
    /// Zstd stream compression.
    Zstd = 2,
}

impl Compression {
    /// Creates a compression from a raw byte.
    #[must_use]
    pub const fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::None),
            1 => Some(Self::Lz4),
            2 => Some(Self::Zstd),
            _ => None,
        }
    }

    /// Returns the codec name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
        }
    }
}
