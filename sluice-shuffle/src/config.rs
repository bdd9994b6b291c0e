//! Shuffle stage configuration.
//!
//! All values are injected at construction. [`ShuffleConfig::from_env`] reads
//! the environment once; the stage never consults ambient state afterwards.

use std::time::Duration;

use sluice_core::{Compression, Limits};

use crate::error::{ShuffleError, ShuffleResult};

/// Environment flag enabling synchronous flush-all after every ingest.
pub const ENV_WINDOW_FIRE_TEST: &str = "SLUICE_WINDOW_FIRE_TEST";

/// Environment override for the linger bound, in milliseconds.
pub const ENV_FLUSH_LINGER_MS: &str = "SLUICE_FLUSH_LINGER_MS";

/// When a partition's pending batch is flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPolicy {
    /// Flush once this many records are pending.
    pub max_records: usize,
    /// Flush once the pending bodies reach this many encoded bytes.
    pub max_bytes: usize,
    /// Flush once the oldest pending entry is this old.
    pub max_linger: Duration,
}

impl FlushPolicy {
    /// Sets the record trigger.
    #[must_use]
    pub const fn with_max_records(mut self, max: usize) -> Self {
        self.max_records = max;
        self
    }

    /// Sets the byte trigger.
    #[must_use]
    pub const fn with_max_bytes(mut self, max: usize) -> Self {
        self.max_bytes = max;
        self
    }

    /// Sets the linger trigger.
    #[must_use]
    pub const fn with_max_linger(mut self, linger: Duration) -> Self {
        self.max_linger = linger;
        self
    }
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            max_records: 1000,
            max_bytes: 1024 * 1024, // 1MB
            max_linger: Duration::from_millis(50),
        }
    }
}

/// When and how envelopes are compressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionConfig {
    /// Codec used when compressing.
    pub codec: Compression,
    /// Envelopes whose encoded size exceeds this are compressed.
    pub threshold_bytes: usize,
    /// Compress every envelope regardless of size.
    pub always: bool,
    /// Zstd compression level.
    pub zstd_level: i32,
}

impl CompressionConfig {
    /// Disables compression entirely.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            codec: Compression::None,
            threshold_bytes: usize::MAX,
            always: false,
            zstd_level: 3,
        }
    }

    /// Sets the codec.
    #[must_use]
    pub const fn with_codec(mut self, codec: Compression) -> Self {
        self.codec = codec;
        self
    }

    /// Sets the size threshold.
    #[must_use]
    pub const fn with_threshold_bytes(mut self, threshold: usize) -> Self {
        self.threshold_bytes = threshold;
        self
    }

    /// Compresses every envelope.
    #[must_use]
    pub const fn with_always(mut self, always: bool) -> Self {
        self.always = always;
        self
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            codec: Compression::Lz4,
            threshold_bytes: 64 * 1024, // 64KB
            always: false,
            zstd_level: 3,
        }
    }
}

/// Bounded retry of transient producer errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Backoff before the second attempt.
    pub initial_backoff: Duration,
    /// Upper bound on a single backoff.
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(1),
        }
    }
}

/// What happens to a batch once write retries are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExhaustedWritePolicy {
    /// Drop the batch and count it.
    #[default]
    Drop,
    /// Mark the stage unhealthy.
    Escalate,
}

/// Configuration for one shuffle stage.
#[derive(Debug, Clone)]
pub struct ShuffleConfig {
    /// Owner of the shuffle topology (e.g. window + group + version).
    pub owner_name: String,
    /// Window fed in parallel with shuffling, if any.
    pub window_name: Option<String>,
    /// Number of destination partitions.
    pub split_count: u32,
    /// Identity of the pipeline's source.
    pub source_identity: String,
    /// Pipeline namespace.
    pub namespace: String,
    /// Name of this stage.
    pub stage_name: String,
    /// Label of the stage woken on first activity.
    pub downstream_label: Option<String>,
    /// Flush every partition after every ingest.
    pub test_mode: bool,
    /// Seed for fallback keys; entropy-seeded when `None`.
    pub fallback_seed: Option<u64>,
    /// Use round-robin instead of random fallback keys.
    pub round_robin_fallback: bool,
    /// Flush triggers.
    pub flush: FlushPolicy,
    /// Compression settings.
    pub compression: CompressionConfig,
    /// Write retry settings.
    pub retry: RetryConfig,
    /// Behaviour on write exhaustion.
    pub exhausted_write_policy: ExhaustedWritePolicy,
    /// System limits.
    pub limits: Limits,
}

impl ShuffleConfig {
    /// Creates a configuration with defaults for everything but identity.
    #[must_use]
    pub fn new(owner_name: impl Into<String>, split_count: u32) -> Self {
        Self {
            owner_name: owner_name.into(),
            window_name: None,
            split_count,
            source_identity: "default-source".to_string(),
            namespace: "default".to_string(),
            stage_name: "shuffle".to_string(),
            downstream_label: None,
            test_mode: false,
            fallback_seed: None,
            round_robin_fallback: false,
            flush: FlushPolicy::default(),
            compression: CompressionConfig::default(),
            retry: RetryConfig::default(),
            exhausted_write_policy: ExhaustedWritePolicy::default(),
            limits: Limits::new(),
        }
    }

    /// Creates a configuration and applies environment overrides.
    #[must_use]
    pub fn from_env(owner_name: impl Into<String>, split_count: u32) -> Self {
        let mut config = Self::new(owner_name, split_count);
        config.test_mode = std::env::var(ENV_WINDOW_FIRE_TEST)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if let Some(linger_ms) = std::env::var(ENV_FLUSH_LINGER_MS)
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.flush.max_linger = Duration::from_millis(linger_ms);
        }
        config
    }

    /// Creates a small, fast configuration for tests.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            fallback_seed: Some(42),
            flush: FlushPolicy {
                max_records: 100,
                max_bytes: 64 * 1024,
                max_linger: Duration::from_millis(5),
            },
            retry: RetryConfig {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(4),
            },
            ..Self::new("test-owner", 4)
        }
    }

    /// Sets the window name.
    #[must_use]
    pub fn with_window(mut self, window_name: impl Into<String>) -> Self {
        self.window_name = Some(window_name.into());
        self
    }

    /// Sets the downstream stage label.
    #[must_use]
    pub fn with_downstream(mut self, label: impl Into<String>) -> Self {
        self.downstream_label = Some(label.into());
        self
    }

    /// Sets the pipeline scope.
    #[must_use]
    pub fn with_scope(
        mut self,
        source_identity: impl Into<String>,
        namespace: impl Into<String>,
        stage_name: impl Into<String>,
    ) -> Self {
        self.source_identity = source_identity.into();
        self.namespace = namespace.into();
        self.stage_name = stage_name.into();
        self
    }

    /// Enables or disables test mode.
    #[must_use]
    pub const fn with_test_mode(mut self, test_mode: bool) -> Self {
        self.test_mode = test_mode;
        self
    }

    /// Sets the fallback key seed.
    #[must_use]
    pub const fn with_fallback_seed(mut self, seed: u64) -> Self {
        self.fallback_seed = Some(seed);
        self
    }

    /// Uses round-robin fallback keys.
    #[must_use]
    pub const fn with_round_robin_fallback(mut self) -> Self {
        self.round_robin_fallback = true;
        self
    }

    /// Sets the flush policy.
    #[must_use]
    pub const fn with_flush(mut self, flush: FlushPolicy) -> Self {
        self.flush = flush;
        self
    }

    /// Sets the compression settings.
    #[must_use]
    pub const fn with_compression(mut self, compression: CompressionConfig) -> Self {
        self.compression = compression;
        self
    }

    /// Sets the retry settings.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the write exhaustion policy.
    #[must_use]
    pub const fn with_exhausted_write_policy(mut self, policy: ExhaustedWritePolicy) -> Self {
        self.exhausted_write_policy = policy;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns an error if any value is out of range.
    pub fn validate(&self) -> ShuffleResult<()> {
        self.limits.validate()?;
        self.limits.check_split_count(self.split_count)?;

        if self.owner_name.is_empty() {
            return Err(invalid("owner_name must not be empty"));
        }
        if self.owner_name.len() > self.limits.owner_name_bytes_max as usize {
            return Err(invalid(format!(
                "owner_name is {} bytes, max {}",
                self.owner_name.len(),
                self.limits.owner_name_bytes_max
            )));
        }
        if self.window_name.as_deref() == Some("") {
            return Err(invalid("window_name must not be empty when set"));
        }
        if self.flush.max_records == 0 || self.flush.max_bytes == 0 {
            return Err(invalid("flush triggers must be positive"));
        }
        if self.flush.max_records > self.limits.envelope_records_max as usize {
            return Err(invalid(format!(
                "flush max_records {} exceeds envelope_records_max {}",
                self.flush.max_records, self.limits.envelope_records_max
            )));
        }
        if self.flush.max_bytes > self.limits.envelope_bytes_max as usize {
            return Err(invalid(format!(
                "flush max_bytes {} exceeds envelope_bytes_max {}",
                self.flush.max_bytes, self.limits.envelope_bytes_max
            )));
        }
        if self.flush.max_linger.is_zero() {
            return Err(invalid("flush max_linger must be positive"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry max_attempts must be positive"));
        }
        if self.retry.initial_backoff > self.retry.max_backoff {
            return Err(invalid("retry initial_backoff exceeds max_backoff"));
        }
        Ok(())
    }
}

impl Default for ShuffleConfig {
    fn default() -> Self {
        Self::new("default-owner", 1)
    }
}

fn invalid(message: impl Into<String>) -> ShuffleError {
    ShuffleError::InvalidConfig {
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_valid() {
        assert!(ShuffleConfig::default().validate().is_ok());
        assert!(ShuffleConfig::for_testing().validate().is_ok());
    }

    #[test]
    fn test_config_rejects_zero_split_count() {
        let config = ShuffleConfig::new("owner", 0);
        assert!(matches!(
            config.validate(),
            Err(ShuffleError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_config_rejects_split_count_above_limit() {
        let config = ShuffleConfig::new("owner", Limits::new().split_count_max + 1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_rejects_empty_owner_and_window() {
        assert!(ShuffleConfig::new("", 2).validate().is_err());
        assert!(ShuffleConfig::new("owner", 2)
            .with_window("")
            .validate()
            .is_err());
    }

    #[test]
    fn test_config_rejects_flush_triggers_above_envelope_limits() {
        let mut config = ShuffleConfig::for_testing();
        config.limits.envelope_records_max = 5;
        assert!(matches!(
            config.validate(),
            Err(ShuffleError::InvalidConfig { message }) if message.contains("envelope_records_max")
        ));
        config.flush.max_records = 5;
        assert!(config.validate().is_ok());

        config.limits.envelope_bytes_max = 1024;
        assert!(matches!(
            config.validate(),
            Err(ShuffleError::InvalidConfig { message }) if message.contains("envelope_bytes_max")
        ));
        config.flush.max_bytes = 1024;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_bad_retry() {
        let config = ShuffleConfig::for_testing().with_retry(RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(1),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_builders() {
        let config = ShuffleConfig::new("win_a_g1_v1", 8)
            .with_window("win_a")
            .with_downstream("window-consumer")
            .with_scope("orders", "prod", "shuffle-1")
            .with_test_mode(true)
            .with_fallback_seed(9)
            .with_exhausted_write_policy(ExhaustedWritePolicy::Escalate);

        assert_eq!(config.window_name.as_deref(), Some("win_a"));
        assert_eq!(config.downstream_label.as_deref(), Some("window-consumer"));
        assert_eq!(config.namespace, "prod");
        assert!(config.test_mode);
        assert_eq!(config.fallback_seed, Some(9));
        assert_eq!(config.exhausted_write_policy, ExhaustedWritePolicy::Escalate);
        assert!(config.validate().is_ok());
    }
}
