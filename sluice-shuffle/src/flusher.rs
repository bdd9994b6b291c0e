//! Background flusher.
//!
//! Wakes when `ingest` signals a count or size trigger, and every
//! `max_linger / 2` for partitions that stopped receiving records. Each wake
//! flushes every partition that is ready under the flush policy.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::stage::{ShuffleStage, StageState};

/// Handle to the linger flush task.
#[derive(Debug)]
pub struct LingerFlusher {
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl LingerFlusher {
    /// Spawns the flush task on the current tokio runtime.
    ///
    /// The task wakes every `max_linger / 2` (at least 1ms).
    #[must_use]
    pub fn spawn(stage: Arc<ShuffleStage>) -> Self {
        let interval = (stage.config().flush.max_linger / 2).max(Duration::from_millis(1));
        let shutdown = Arc::new(Notify::new());
        let handle = tokio::spawn(run(stage, interval, Arc::clone(&shutdown)));
        Self { shutdown, handle }
    }

    /// Stops the task and waits for it to exit.
    pub async fn stop(self) {
        // notify_one stores a permit, so a task mid-flush still sees it.
        self.shutdown.notify_one();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Linger flusher exited abnormally");
        }
    }
}

async fn run(stage: Arc<ShuffleStage>, interval: Duration, shutdown: Arc<Notify>) {
    info!(
        owner = %stage.config().owner_name,
        interval_ms = interval.as_millis(),
        "Linger flusher started"
    );

    loop {
        tokio::select! {
            () = tokio::time::sleep(interval) => {}
            () = stage.flush_wake().notified() => {}
            () = shutdown.notified() => break,
        }

        if stage.state() == StageState::Stopped {
            break;
        }

        // Merges write to the producer synchronously and may back off.
        let flushing = Arc::clone(&stage);
        match tokio::task::spawn_blocking(move || flushing.flush_ready(Instant::now())).await {
            Ok(report) if report.merges > 0 => {
                debug!(
                    merges = report.merges,
                    delivered = report.delivered_records,
                    failed = report.failed_records,
                    "Background flush"
                );
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Background flush task failed"),
        }
    }

    info!(owner = %stage.config().owner_name, "Linger flusher stopped");
}
