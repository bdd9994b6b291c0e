//! Compression gate - decides per envelope whether to compress.
//!
//! Envelopes whose plain body exceeds the configured threshold (or every
//! envelope, when `always` is set) are encoded and compressed. Either way the
//! result must fit in `envelope_bytes_max`; an oversized batch is rejected
//! rather than sent.

use sluice_core::{Compression, Limits};

use crate::config::CompressionConfig;
use crate::envelope::{CompressedEnvelope, Envelope, WireEnvelope};
use crate::error::{CompressionError, ShuffleError, ShuffleResult};

/// Compresses envelopes before they reach the producer.
#[derive(Debug, Clone)]
pub struct CompressionGate {
    config: CompressionConfig,
    envelope_bytes_max: usize,
}

impl CompressionGate {
    /// Creates a gate.
    #[must_use]
    pub const fn new(config: CompressionConfig, limits: &Limits) -> Self {
        Self {
            config,
            envelope_bytes_max: limits.envelope_bytes_max as usize,
        }
    }

    /// Returns true if an envelope of `size` plain bytes would be compressed.
    #[must_use]
    pub const fn should_compress(&self, size: usize) -> bool {
        !matches!(self.config.codec, Compression::None)
            && (self.config.always || size > self.config.threshold_bytes)
    }

    /// Compresses the envelope if warranted.
    ///
    /// # Errors
    /// Returns an error if the codec fails or the result is too large.
    pub fn maybe_compress(&self, envelope: Envelope) -> Result<WireEnvelope, CompressionError> {
        let size = envelope.encoded_size();
        let wire = if self.should_compress(size) {
            let uncompressed_len = u32::try_from(size).map_err(|_| CompressionError::TooLarge {
                size,
                max: self.envelope_bytes_max,
            })?;
            let payload = compress(self.config.codec, self.config.zstd_level, &envelope.to_bytes())?;
            WireEnvelope::Compressed(CompressedEnvelope {
                partition_id: envelope.partition_id,
                owner_id: envelope.owner_id,
                trace_id: envelope.trace_id,
                codec: self.config.codec,
                uncompressed_len,
                payload: payload.into(),
            })
        } else {
            WireEnvelope::Plain(envelope)
        };

        let encoded_len = wire.encoded_len();
        if encoded_len > self.envelope_bytes_max {
            return Err(CompressionError::TooLarge {
                size: encoded_len,
                max: self.envelope_bytes_max,
            });
        }
        Ok(wire)
    }
}

/// Restores the plain envelope from a wire envelope.
///
/// # Errors
/// Returns an error if decompression fails or the body is malformed.
pub fn open(wire: WireEnvelope, limits: &Limits) -> ShuffleResult<Envelope> {
    let compressed = match wire {
        WireEnvelope::Plain(envelope) => return Ok(envelope),
        WireEnvelope::Compressed(compressed) => compressed,
    };

    if compressed.uncompressed_len > limits.envelope_bytes_max {
        return Err(CompressionError::TooLarge {
            size: compressed.uncompressed_len as usize,
            max: limits.envelope_bytes_max as usize,
        }
        .into());
    }

    let plain = decompress(compressed.codec, &compressed.payload)?;
    if plain.len() != compressed.uncompressed_len as usize {
        return Err(ShuffleError::Compression(CompressionError::Codec {
            codec: compressed.codec,
            message: format!(
                "decompressed {} bytes, header says {}",
                plain.len(),
                compressed.uncompressed_len
            ),
        }));
    }

    let envelope = Envelope::decode(&mut plain.as_slice(), limits)?;
    Ok(envelope)
}

fn compress(codec: Compression, zstd_level: i32, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    match codec {
        Compression::None => Ok(data.to_vec()),
        Compression::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        Compression::Zstd => {
            zstd::stream::encode_all(data, zstd_level).map_err(|e| CompressionError::Codec {
                codec,
                message: e.to_string(),
            })
        }
    }
}

fn decompress(codec: Compression, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    match codec {
        Compression::None => Ok(data.to_vec()),
        Compression::Lz4 => {
            lz4_flex::decompress_size_prepended(data).map_err(|e| CompressionError::Codec {
                codec,
                message: e.to_string(),
            })
        }
        Compression::Zstd => zstd::stream::decode_all(data).map_err(|e| CompressionError::Codec {
            codec,
            message: e.to_string(),
        }),
    }
}
