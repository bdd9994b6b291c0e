//! Provenance fields stamped into every shuffled record body.
//!
//! The consuming stage reads these back to attribute merged records to the
//! source offset they came from, which is what makes replay possible.

use sluice_core::{CodecError, FieldValue, Record, RecordBody, RecordHeader};

/// Offset of the record in its source queue.
pub const ORIGIN_OFFSET: &str = "origin_offset";
/// Source queue id.
pub const ORIGIN_QUEUE_ID: &str = "origin_queue_id";
/// Whether the origin offset uses the long format.
pub const ORIGIN_OFFSET_IS_LONG: &str = "origin_offset_is_LONG";
/// Encoded origin header.
pub const ORIGIN_MESSAGE_HEADER: &str = "origin_message_header";
/// Origin trace id.
pub const ORIGIN_REQUEST_ID: &str = "origin_request_id";
/// Resolved shuffle key.
pub const SHUFFLE_KEY: &str = "SHUFFLE_KEY";

/// Stamps provenance into a record's body and returns the body.
#[must_use]
pub fn stamp(record: Record, shuffle_key: &str) -> RecordBody {
    let Record { header, mut body } = record;
    let encoded_header = header.to_bytes();
    body.insert(ORIGIN_OFFSET, header.offset);
    body.insert(ORIGIN_QUEUE_ID, header.queue_id);
    body.insert(ORIGIN_OFFSET_IS_LONG, header.is_long_offset_format);
    body.insert(ORIGIN_MESSAGE_HEADER, encoded_header);
    body.insert(ORIGIN_REQUEST_ID, header.trace_id);
    body.insert(SHUFFLE_KEY, shuffle_key);
    body
}

/// Provenance read back from a stamped body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    /// Origin offset.
    pub offset: String,
    /// Origin queue id.
    pub queue_id: String,
    /// Origin offset format.
    pub is_long_offset_format: bool,
    /// Origin trace id.
    pub trace_id: String,
    /// Resolved shuffle key.
    pub shuffle_key: String,
}

impl Provenance {
    /// Reads provenance from a body. Returns `None` if it was never stamped.
    #[must_use]
    pub fn from_body(body: &RecordBody) -> Option<Self> {
        Some(Self {
            offset: body.get_str(ORIGIN_OFFSET)?.to_string(),
            queue_id: body.get_str(ORIGIN_QUEUE_ID)?.to_string(),
            is_long_offset_format: body.get(ORIGIN_OFFSET_IS_LONG)?.as_bool()?,
            trace_id: body.get_str(ORIGIN_REQUEST_ID).unwrap_or_default().to_string(),
            shuffle_key: body.get_str(SHUFFLE_KEY)?.to_string(),
        })
    }

    /// Decodes the full origin header stored in a body.
    ///
    /// # Errors
    /// Returns an error if the header field is missing or malformed.
    pub fn origin_header(body: &RecordBody) -> Result<RecordHeader, CodecError> {
        match body.get(ORIGIN_MESSAGE_HEADER) {
            Some(FieldValue::Bytes(bytes)) => RecordHeader::decode(&mut bytes.clone()),
            _ => Err(CodecError::Truncated {
                context: "origin header",
                needed: 1,
                remaining: 0,
            }),
        }
    }
}
