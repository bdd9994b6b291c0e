//! Error types for sluice core operations.
//!
//! Following `TigerStyle`: all errors must be handled explicitly.
//! No silent failures, no ignored errors.

use std::fmt;

/// The result type for sluice core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in core operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A resource limit was exceeded.
    LimitExceeded {
        /// Which limit was exceeded.
        limit: &'static str,
        /// The maximum allowed value.
        max: u64,
        /// The actual value that exceeded the limit.
        actual: u64,
    },

    /// An invalid argument was provided.
    InvalidArgument {
        /// The name of the argument.
        name: &'static str,
        /// Why it was invalid.
        reason: &'static str,
    },

    /// Encoding or decoding failed.
    Codec(CodecError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LimitExceeded { limit, max, actual } => {
                write!(f, "limit exceeded: {limit} (max={max}, actual={actual})")
            }
            Self::InvalidArgument { name, reason } => {
                write!(f, "invalid argument '{name}': {reason}")
            }
            Self::Codec(err) => write!(f, "codec error: {err}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<CodecError> for Error {
    fn from(err: CodecError) -> Self {
        Self::Codec(err)
    }
}

/// Decoding failures for the binary encodings in this workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The buffer ended before the value was complete.
    Truncated {
        /// What was being decoded.
        context: &'static str,
        /// Bytes required.
        needed: usize,
        /// Bytes remaining.
        remaining: usize,
    },
    /// An unknown type tag was found.
    UnknownTag {
        /// What was being decoded.
        context: &'static str,
        /// The tag byte.
        tag: u8,
    },
    /// A string field was not valid UTF-8.
    InvalidUtf8 {
        /// What was being decoded.
        context: &'static str,
    },
    /// A decoded count exceeded its limit.
    TooMany {
        /// What was being decoded.
        context: &'static str,
        /// The decoded count.
        count: u64,
        /// The maximum allowed.
        max: u64,
    },
    /// The frame did not start with the expected magic bytes.
    BadMagic {
        /// The bytes found.
        found: [u8; 4],
    },
    /// The frame version is not supported.
    UnsupportedVersion {
        /// The version byte found.
        version: u8,
    },
    /// The payload checksum did not match.
    ChecksumMismatch {
        /// Checksum stored in the frame.
        expected: u32,
        /// Checksum computed over the payload.
        actual: u32,
    },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated {
                context,
                needed,
                remaining,
            } => write!(
                f,
                "truncated {context}: needed {needed} bytes, {remaining} remaining"
            ),
            Self::UnknownTag { context, tag } => write!(f, "unknown {context} tag: {tag:#04x}"),
            Self::InvalidUtf8 { context } => write!(f, "invalid utf-8 in {context}"),
            Self::TooMany {
                context,
                count,
                max,
            } => write!(f, "too many {context}: {count} > {max}"),
            Self::BadMagic { found } => write!(f, "bad magic: {found:?}"),
            Self::UnsupportedVersion { version } => write!(f, "unsupported version: {version}"),
            Self::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch: expected {expected:#010x}, got {actual:#010x}")
            }
        }
    }
}

impl std::error::Error for CodecError {}
