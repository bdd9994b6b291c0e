//! Reusable stage setups and workloads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sluice_core::{Record, RecordBody, RecordHeader};
use sluice_shuffle::memory::{
    FieldKeyWindow, MemoryPipeline, MemoryProducer, MemoryTopologyCreator, MemoryWindowRegistry,
};
use sluice_shuffle::{
    ControlSignal, DownstreamStage, Envelope, ShuffleConfig, ShuffleResult, ShuffleStage,
    StageContext, TopologyCreator, Window,
};

/// Window registered by every [`Harness`], grouping on the `user` field.
pub const USER_WINDOW: &str = "user_window";

/// Label the harness registers its [`RecordingStage`] under.
pub const DOWNSTREAM: &str = "downstream";

/// Downstream stage that counts control signals.
#[derive(Debug, Default)]
pub struct RecordingStage {
    consumer_starts: AtomicU64,
}

impl RecordingStage {
    /// Consumer start signals received.
    #[must_use]
    pub fn consumer_starts(&self) -> u64 {
        self.consumer_starts.load(Ordering::SeqCst)
    }
}

impl DownstreamStage for RecordingStage {
    fn on_control(&self, signal: ControlSignal) {
        match signal {
            ControlSignal::ConsumerStart => {
                self.consumer_starts.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}

/// A stage wired to in-memory collaborators.
pub struct Harness {
    /// The stage under test.
    pub stage: Arc<ShuffleStage>,
    /// Topology creator; owns the producer.
    pub creator: Arc<MemoryTopologyCreator>,
    /// The registered window.
    pub window: Arc<FieldKeyWindow>,
    /// The registered downstream stage.
    pub downstream: Arc<RecordingStage>,
}

impl Harness {
    /// Test configuration pointed at the harness downstream stage.
    #[must_use]
    pub fn config() -> ShuffleConfig {
        ShuffleConfig::for_testing().with_downstream(DOWNSTREAM)
    }

    /// Creates a stage with the default user window registered.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid.
    pub fn new(config: ShuffleConfig) -> ShuffleResult<Self> {
        Self::with_window(config, FieldKeyWindow::new(USER_WINDOW, "user"))
    }

    /// Creates a stage with a custom window registered.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid.
    pub fn with_window(config: ShuffleConfig, window: FieldKeyWindow) -> ShuffleResult<Self> {
        let window = Arc::new(window);
        let windows = MemoryWindowRegistry::new();
        windows.register(Arc::clone(&window) as Arc<dyn Window>);

        let downstream = Arc::new(RecordingStage::default());
        let pipeline = MemoryPipeline::new();
        pipeline.add_stage(DOWNSTREAM, Arc::clone(&downstream) as Arc<dyn DownstreamStage>);

        let creator = Arc::new(MemoryTopologyCreator::new());
        let context = StageContext {
            windows: Arc::new(windows),
            topology: Arc::clone(&creator) as Arc<dyn TopologyCreator>,
            pipeline: Some(Arc::new(pipeline)),
        };

        Ok(Self {
            stage: Arc::new(ShuffleStage::new(config, context)?),
            creator,
            window,
            downstream,
        })
    }

    /// Creates, configures, and starts a stage.
    ///
    /// # Errors
    /// Returns an error if any lifecycle step fails.
    pub fn running(config: ShuffleConfig) -> ShuffleResult<Self> {
        let harness = Self::new(config)?;
        harness.stage.reconfigure()?;
        harness.stage.start()?;
        Ok(harness)
    }

    /// The producer every envelope is written to.
    #[must_use]
    pub fn producer(&self) -> Arc<MemoryProducer> {
        self.creator.producer()
    }

    /// Decodes every envelope written so far.
    ///
    /// # Errors
    /// Returns an error if a frame fails to decode.
    pub fn delivered(&self) -> ShuffleResult<Vec<(String, Envelope)>> {
        self.producer().envelopes(&self.stage.config().limits)
    }

    /// Records across every envelope written so far.
    ///
    /// # Errors
    /// Returns an error if a frame fails to decode.
    pub fn delivered_records(&self) -> ShuffleResult<usize> {
        self.producer().record_count(&self.stage.config().limits)
    }
}

/// Deterministic record generator for one source queue.
///
/// Offsets are sequential per queue; users, amounts, and system records are
/// drawn from a seeded RNG.
#[derive(Debug)]
pub struct Workload {
    rng: ChaCha8Rng,
    queue_id: String,
    next_offset: u64,
    users: u32,
    system_ratio: f64,
}

impl Workload {
    /// Creates a workload with 50 users and no system records.
    #[must_use]
    pub fn new(seed: u64, queue_id: impl Into<String>) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            queue_id: queue_id.into(),
            next_offset: 0,
            users: 50,
            system_ratio: 0.0,
        }
    }

    /// Sets the number of distinct users.
    #[must_use]
    pub fn with_users(mut self, users: u32) -> Self {
        self.users = users.max(1);
        self
    }

    /// Sets the fraction of system records, in `[0, 1]`.
    #[must_use]
    pub fn with_system_ratio(mut self, ratio: f64) -> Self {
        self.system_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    /// Generates the next `n` records.
    pub fn batch(&mut self, n: usize) -> Vec<Record> {
        (0..n).map(|_| self.next_record()).collect()
    }

    fn next_record(&mut self) -> Record {
        let offset = self.next_offset;
        self.next_offset += 1;

        let mut header = RecordHeader::new(self.queue_id.clone(), offset.to_string())
            .with_trace_id(format!("{}-{offset}", self.queue_id))
            .with_long_offset();
        if self.rng.gen_bool(self.system_ratio) {
            header = header.system();
        }

        let body = RecordBody::new()
            .with_field("user", format!("user-{}", self.rng.gen_range(0..self.users)))
            .with_field("amount", self.rng.gen_range(0..1_000_i64));
        Record::new(header, body)
    }
}
