//! Shuffle envelopes - the unit written to the transport for one partition.
//!
//! # Wire Frame
//!
//! ```text
//! +-------+---------+-------+-------+--------+----------+----------+
//! | magic | version | flags | codec | crc32  | body_len |   body   |
//! |  4B   |   1B    |  1B   |  1B   |   4B   |    4B    | variable |
//! +-------+---------+-------+-------+--------+----------+----------+
//! ```
//!
//! - `magic`: `SHUF`
//! - `flags`: bit 0 set when the body is compressed
//! - `crc32`: checksum of `body`
//! - plain body: partition id, owner id, trace id, record count, bodies
//! - compressed body: partition id, owner id, trace id, uncompressed length,
//!   compressed plain body

use bytes::{Buf, BufMut, Bytes, BytesMut};
use sluice_core::codec::{self, ensure};
use sluice_core::{CodecError, Compression, Limits, RecordBody};
use tracing::{debug, trace};

use crate::cache::CacheEntry;
use crate::provenance::{ORIGIN_REQUEST_ID, SHUFFLE_KEY};

/// Frame magic.
pub const ENVELOPE_MAGIC: [u8; 4] = *b"SHUF";

/// Frame format version.
pub const ENVELOPE_VERSION: u8 = 1;

const FLAG_COMPRESSED: u8 = 0x01;

/// Frame header size: magic + version + flags + codec + crc + body length.
pub const FRAME_HEADER_SIZE: usize = 4 + 1 + 1 + 1 + 4 + 4;

/// Merged records for one partition.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Destination partition id.
    pub partition_id: String,
    /// Record bodies in merge order.
    pub messages: Vec<RecordBody>,
    /// Owner of the shuffle topology.
    pub owner_id: String,
    /// Comma-joined origin trace ids, possibly empty.
    pub trace_id: String,
}

impl Envelope {
    /// Returns the encoded size of the plain body.
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        4 + self.partition_id.len()
            + 4
            + self.owner_id.len()
            + 4
            + self.trace_id.len()
            + 4
            + self
                .messages
                .iter()
                .map(RecordBody::encoded_size)
                .sum::<usize>()
    }

    /// Encodes the plain body.
    #[allow(clippy::cast_possible_truncation)] // Record count bounded by limits.
    pub fn encode(&self, buf: &mut BytesMut) {
        codec::put_str(buf, &self.partition_id);
        codec::put_str(buf, &self.owner_id);
        codec::put_str(buf, &self.trace_id);
        buf.put_u32_le(self.messages.len() as u32);
        for body in &self.messages {
            body.encode(buf);
        }
    }

    /// Encodes the plain body into a standalone buffer.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decodes a plain body.
    ///
    /// # Errors
    /// Returns an error if the buffer is malformed or exceeds the limits.
    pub fn decode(buf: &mut impl Buf, limits: &Limits) -> Result<Self, CodecError> {
        let partition_id = codec::get_str(buf, "envelope partition id")?;
        let owner_id = codec::get_str(buf, "envelope owner id")?;
        let trace_id = codec::get_str(buf, "envelope trace id")?;
        let count = codec::get_u32(buf, "envelope record count")?;
        if count > limits.envelope_records_max {
            return Err(CodecError::TooMany {
                context: "envelope records",
                count: u64::from(count),
                max: u64::from(limits.envelope_records_max),
            });
        }
        let mut messages = Vec::with_capacity(count as usize);
        for _ in 0..count {
            messages.push(RecordBody::decode(buf, limits.body_fields_max)?);
        }
        Ok(Self {
            partition_id,
            messages,
            owner_id,
            trace_id,
        })
    }
}

/// Records routed to one partition by a single ingest call.
///
/// This is the unit appended to a partition's pending batch.
#[derive(Debug, Clone, Default)]
pub struct PartialEnvelope {
    bodies: Vec<RecordBody>,
    bytes: usize,
}

impl PartialEnvelope {
    /// Creates an empty partial envelope.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bodies: Vec::new(),
            bytes: 0,
        }
    }

    /// Adds a stamped body.
    pub fn push(&mut self, body: RecordBody) {
        self.bytes += body.encoded_size();
        self.bodies.push(body);
    }

    /// Returns the bodies in arrival order.
    #[must_use]
    pub fn bodies(&self) -> &[RecordBody] {
        &self.bodies
    }

    /// Consumes the partial envelope, returning its bodies.
    #[must_use]
    pub fn into_bodies(self) -> Vec<RecordBody> {
        self.bodies
    }
}

impl FromIterator<RecordBody> for PartialEnvelope {
    fn from_iter<I: IntoIterator<Item = RecordBody>>(iter: I) -> Self {
        let mut partial = Self::new();
        for body in iter {
            partial.push(body);
        }
        partial
    }
}

impl CacheEntry for PartialEnvelope {
    fn records(&self) -> usize {
        self.bodies.len()
    }

    fn bytes(&self) -> usize {
        self.bytes
    }
}

/// Assembles envelopes for one shuffle owner.
#[derive(Debug, Clone)]
pub struct ShuffleEnvelopeBuilder {
    owner_id: String,
    trace_id_bytes_max: usize,
}

impl ShuffleEnvelopeBuilder {
    /// Creates a builder stamping `owner_id` on every envelope.
    #[must_use]
    pub fn new(owner_id: impl Into<String>, limits: &Limits) -> Self {
        Self {
            owner_id: owner_id.into(),
            trace_id_bytes_max: limits.trace_id_bytes_max as usize,
        }
    }

    /// Returns the owner id.
    #[must_use]
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Builds an envelope from bodies already in merge order.
    ///
    /// Trace aggregation is best-effort: if it fails the envelope carries an
    /// empty trace id and the build still succeeds.
    #[must_use]
    pub fn build(&self, partition_id: &str, messages: Vec<RecordBody>) -> Envelope {
        let trace_id = match aggregate_trace_ids(&messages, self.trace_id_bytes_max) {
            Ok(trace_id) => trace_id,
            Err(reason) => {
                debug!(partition = partition_id, reason, "Trace id aggregation failed");
                String::new()
            }
        };

        if tracing::enabled!(tracing::Level::TRACE) {
            let keys: Vec<&str> = messages
                .iter()
                .filter_map(|body| body.get_str(SHUFFLE_KEY))
                .collect();
            trace!(
                partition = partition_id,
                trace_id = %trace_id,
                keys = ?keys,
                "Built shuffle envelope"
            );
        }

        Envelope {
            partition_id: partition_id.to_string(),
            messages,
            owner_id: self.owner_id.clone(),
            trace_id,
        }
    }
}

/// Joins origin trace ids with commas, truncated at a trace id boundary.
fn aggregate_trace_ids(messages: &[RecordBody], bytes_max: usize) -> Result<String, &'static str> {
    let mut joined = String::new();
    for body in messages {
        let trace_id = match body.get(ORIGIN_REQUEST_ID) {
            None => continue,
            Some(value) => value.as_str().ok_or("origin trace id is not a string")?,
        };
        if trace_id.is_empty() {
            continue;
        }
        let separator = usize::from(!joined.is_empty());
        if joined.len() + separator + trace_id.len() > bytes_max {
            break;
        }
        if separator == 1 {
            joined.push(',');
        }
        joined.push_str(trace_id);
    }
    Ok(joined)
}

/// A compressed envelope; routing metadata stays readable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedEnvelope {
    /// Destination partition id.
    pub partition_id: String,
    /// Owner of the shuffle topology.
    pub owner_id: String,
    /// Comma-joined origin trace ids.
    pub trace_id: String,
    /// Codec used for `payload`.
    pub codec: Compression,
    /// Size of the plain body before compression.
    pub uncompressed_len: u32,
    /// Compressed plain body.
    pub payload: Bytes,
}

/// An envelope as handed to the producer.
#[derive(Debug, Clone, PartialEq)]
pub enum WireEnvelope {
    /// Uncompressed envelope.
    Plain(Envelope),
    /// Compressed envelope.
    Compressed(CompressedEnvelope),
}

impl WireEnvelope {
    /// Returns true if the body is compressed.
    #[must_use]
    pub const fn is_compressed(&self) -> bool {
        matches!(self, Self::Compressed(_))
    }

    /// Returns the destination partition id.
    #[must_use]
    pub fn partition_id(&self) -> &str {
        match self {
            Self::Plain(e) => &e.partition_id,
            Self::Compressed(c) => &c.partition_id,
        }
    }

    /// Returns the owner id.
    #[must_use]
    pub fn owner_id(&self) -> &str {
        match self {
            Self::Plain(e) => &e.owner_id,
            Self::Compressed(c) => &c.owner_id,
        }
    }

    /// Returns the codec of the body.
    #[must_use]
    pub const fn codec(&self) -> Compression {
        match self {
            Self::Plain(_) => Compression::None,
            Self::Compressed(c) => c.codec,
        }
    }

    fn body_size(&self) -> usize {
        match self {
            Self::Plain(e) => e.encoded_size(),
            Self::Compressed(c) => {
                4 + c.partition_id.len()
                    + 4
                    + c.owner_id.len()
                    + 4
                    + c.trace_id.len()
                    + 4
                    + 4
                    + c.payload.len()
            }
        }
    }

    /// Returns the size of the encoded frame.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.body_size()
    }

    /// Encodes the frame.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // Body size bounded by envelope_bytes_max.
    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::with_capacity(self.body_size());
        let flags = match self {
            Self::Plain(envelope) => {
                envelope.encode(&mut body);
                0
            }
            Self::Compressed(c) => {
                codec::put_str(&mut body, &c.partition_id);
                codec::put_str(&mut body, &c.owner_id);
                codec::put_str(&mut body, &c.trace_id);
                body.put_u32_le(c.uncompressed_len);
                codec::put_bytes(&mut body, &c.payload);
                FLAG_COMPRESSED
            }
        };

        let mut frame = BytesMut::with_capacity(FRAME_HEADER_SIZE + body.len());
        frame.put_slice(&ENVELOPE_MAGIC);
        frame.put_u8(ENVELOPE_VERSION);
        frame.put_u8(flags);
        frame.put_u8(self.codec() as u8);
        frame.put_u32_le(crc32fast::hash(&body));
        frame.put_u32_le(body.len() as u32);
        frame.put_slice(&body);
        frame.freeze()
    }

    /// Decodes a frame, verifying magic, version, and checksum.
    ///
    /// # Errors
    /// Returns an error if the frame is malformed or exceeds the limits.
    pub fn decode(mut frame: Bytes, limits: &Limits) -> Result<Self, CodecError> {
        ensure(&frame, FRAME_HEADER_SIZE, "envelope frame header")?;

        let mut magic = [0_u8; 4];
        frame.copy_to_slice(&mut magic);
        if magic != ENVELOPE_MAGIC {
            return Err(CodecError::BadMagic { found: magic });
        }
        let version = frame.get_u8();
        if version != ENVELOPE_VERSION {
            return Err(CodecError::UnsupportedVersion { version });
        }
        let flags = frame.get_u8();
        let codec_byte = frame.get_u8();
        let codec = Compression::from_byte(codec_byte).ok_or(CodecError::UnknownTag {
            context: "envelope codec",
            tag: codec_byte,
        })?;
        let expected = frame.get_u32_le();
        let body_len = frame.get_u32_le();
        if body_len > limits.envelope_bytes_max {
            return Err(CodecError::TooMany {
                context: "envelope bytes",
                count: u64::from(body_len),
                max: u64::from(limits.envelope_bytes_max),
            });
        }
        ensure(&frame, body_len as usize, "envelope body")?;
        let mut body = frame.split_to(body_len as usize);

        let actual = crc32fast::hash(&body);
        if actual != expected {
            return Err(CodecError::ChecksumMismatch { expected, actual });
        }

        if flags & FLAG_COMPRESSED == 0 {
            return Envelope::decode(&mut body, limits).map(Self::Plain);
        }

        let partition_id = codec::get_str(&mut body, "compressed partition id")?;
        let owner_id = codec::get_str(&mut body, "compressed owner id")?;
        let trace_id = codec::get_str(&mut body, "compressed trace id")?;
        let uncompressed_len = codec::get_u32(&mut body, "compressed length")?;
        let payload = codec::get_bytes(&mut body, "compressed payload")?;
        Ok(Self::Compressed(CompressedEnvelope {
            partition_id,
            owner_id,
            trace_id,
            codec,
            uncompressed_len,
            payload,
        }))
    }
}
