//! One-shot wake-up of the downstream stage.
//!
//! The first accepted batch sends [`ControlSignal::ConsumerStart`] straight to
//! the downstream stage so an idle consumer starts reading without waiting
//! for its poll interval. The signal bypasses the transport and carries no
//! data.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::collaborators::{ControlSignal, Pipeline};
use crate::stats::ShuffleStats;

/// Fires a control signal downstream at most once.
pub struct ConsumerStartNotifier {
    fired: AtomicBool,
    pipeline: Option<Arc<dyn Pipeline>>,
    downstream_label: Option<String>,
    stats: Arc<ShuffleStats>,
}

impl ConsumerStartNotifier {
    /// Creates a notifier. With no pipeline or label it only flips its flag.
    #[must_use]
    pub fn new(
        pipeline: Option<Arc<dyn Pipeline>>,
        downstream_label: Option<String>,
        stats: Arc<ShuffleStats>,
    ) -> Self {
        Self {
            fired: AtomicBool::new(false),
            pipeline,
            downstream_label,
            stats,
        }
    }

    /// Returns true once the flag has been set.
    #[must_use]
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Sends the signal if this is the first call to win the flag.
    ///
    /// Returns true for exactly one caller over the notifier's lifetime.
    pub fn notify_if_first(&self) -> bool {
        if self.fired.load(Ordering::Acquire) {
            return false;
        }
        if self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let (Some(pipeline), Some(label)) = (&self.pipeline, &self.downstream_label) else {
            debug!("No downstream stage configured, skipping consumer start signal");
            return true;
        };

        match pipeline.stage_by_label(label) {
            Some(stage) => {
                stage.on_control(ControlSignal::ConsumerStart);
                ShuffleStats::add(&self.stats.control_signals, 1);
                debug!(downstream = %label, "Sent consumer start signal");
            }
            None => {
                warn!(
                    downstream = %label,
                    "Downstream stage not found, consumer start signal not sent"
                );
            }
        }
        true
    }
}

impl std::fmt::Debug for ConsumerStartNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerStartNotifier")
            .field("fired", &self.has_fired())
            .field("downstream_label", &self.downstream_label)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::DownstreamStage;
    use std::sync::atomic::AtomicU64;
    use std::sync::Barrier;

    #[derive(Default)]
    struct Counting(AtomicU64);

    impl DownstreamStage for Counting {
        fn on_control(&self, signal: ControlSignal) {
            assert_eq!(signal, ControlSignal::ConsumerStart);
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct OneStage(Arc<Counting>);

    impl Pipeline for OneStage {
        fn stage_by_label(&self, label: &str) -> Option<Arc<dyn DownstreamStage>> {
            (label == "consumer").then(|| Arc::clone(&self.0) as Arc<dyn DownstreamStage>)
        }
    }

    fn notifier(label: &str) -> (ConsumerStartNotifier, Arc<Counting>, Arc<ShuffleStats>) {
        let stage = Arc::new(Counting::default());
        let stats = Arc::new(ShuffleStats::default());
        let n = ConsumerStartNotifier::new(
            Some(Arc::new(OneStage(Arc::clone(&stage)))),
            Some(label.to_string()),
            Arc::clone(&stats),
        );
        (n, stage, stats)
    }

    #[test]
    fn test_notifier_fires_once() {
        let (n, stage, stats) = notifier("consumer");
        assert!(n.notify_if_first());
        assert!(!n.notify_if_first());
        assert!(n.has_fired());
        assert_eq!(stage.0.load(Ordering::SeqCst), 1);
        assert_eq!(stats.snapshot().control_signals, 1);
    }

    #[test]
    fn test_notifier_concurrent_first_arrivals() {
        const THREADS: usize = 64;
        let (n, stage, _) = notifier("consumer");
        let barrier = Barrier::new(THREADS);
        let winners = AtomicU64::new(0);

        std::thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|| {
                    barrier.wait();
                    if n.notify_if_first() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert_eq!(stage.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_notifier_missing_stage_keeps_flag() {
        let (n, stage, stats) = notifier("nobody");
        assert!(n.notify_if_first());
        assert!(n.has_fired());
        assert!(!n.notify_if_first());
        assert_eq!(stage.0.load(Ordering::SeqCst), 0);
        assert_eq!(stats.snapshot().control_signals, 0);
    }
}
