//! System limits and configuration bounds.
//!
//! Following TigerStyle: put limits on everything.
//! Every buffer, envelope, and decoded collection has an explicit maximum size.

/// System-wide limits for a shuffle stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Maximum number of destination partitions for one stage.
    pub split_count_max: u32,
    /// Maximum length of an owner name in bytes.
    pub owner_name_bytes_max: u32,
    /// Maximum size of an encoded wire envelope in bytes.
    pub envelope_bytes_max: u32,
    /// Maximum number of records merged into one envelope.
    pub envelope_records_max: u32,
    /// Maximum number of fields in a record body.
    pub body_fields_max: u32,
    /// Maximum length of the aggregated trace id in bytes.
    pub trace_id_bytes_max: u32,
}

impl Limits {
    /// Creates limits with safe defaults.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            // Topology: 4096 splits, 255-byte owner names.
            split_count_max: 4096,
            owner_name_bytes_max: 255,

            // Envelopes: 32MB on the wire, 1M records per merge.
            envelope_bytes_max: 32 * 1024 * 1024,
            envelope_records_max: 1_000_000,

            // Records: 4096 fields.
            body_fields_max: 4096,

            // Observability: 64KB of joined trace ids.
            trace_id_bytes_max: 64 * 1024,
        }
    }

    /// Validates that all limits are internally consistent.
    ///
    /// # Errors
    /// Returns an error if any limit is zero.
    pub const fn validate(&self) -> crate::Result<()> {
        if self.split_count_max == 0 {
            return Err(crate::Error::InvalidArgument {
                name: "split_count_max",
                reason: "must be positive",
            });
        }
        if self.envelope_bytes_max == 0 {
            return Err(crate::Error::InvalidArgument {
                name: "envelope_bytes_max",
                reason: "must be positive",
            });
        }
        if self.envelope_records_max == 0 {
            return Err(crate::Error::InvalidArgument {
                name: "envelope_records_max",
                reason: "must be positive",
            });
        }
        Ok(())
    }

    /// Checks a split count against the limits.
    ///
    /// # Errors
    /// Returns an error if `split_count` is zero or above `split_count_max`.
    pub const fn check_split_count(&self, split_count: u32) -> crate::Result<()> {
        if split_count == 0 {
            return Err(crate::Error::InvalidArgument {
                name: "split_count",
                reason: "must be positive",
            });
        }
        if split_count > self.split_count_max {
            return Err(crate::Error::LimitExceeded {
                limit: "split_count",
                max: self.split_count_max as u64,
                actual: split_count as u64,
            });
        }
        Ok(())
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits_valid() {
        assert!(Limits::default().validate().is_ok());
    }

    #[test]
    fn test_zero_split_count_rejected() {
        let limits = Limits::new();
        assert!(matches!(
            limits.check_split_count(0),
            Err(crate::Error::InvalidArgument { name: "split_count", .. })
        ));
    }

    #[test]
    fn test_split_count_above_max_rejected() {
        let limits = Limits::new();
        let err = limits.check_split_count(limits.split_count_max + 1).unwrap_err();
        assert!(matches!(err, crate::Error::LimitExceeded { limit: "split_count", .. }));
        assert!(limits.check_split_count(limits.split_count_max).is_ok());
    }
}
