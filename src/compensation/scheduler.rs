use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, warn};

use super::engine::CompensationEngine;

/// Fixed-cadence driver for the compensation engine.
///
/// At most one sweep runs at a time: a tick that fires while the previous
/// sweep is still working is skipped rather than queued.
pub struct SweepScheduler {
    engine: Arc<CompensationEngine>,
    period: Duration,
    in_progress: Arc<AtomicBool>,
}

impl SweepScheduler {
    pub fn new(engine: Arc<CompensationEngine>, period: Duration) -> Self {
        Self {
            engine,
            period,
            in_progress: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;

                if self
                    .in_progress
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    warn!("previous compensation sweep still running, skipping this tick");
                    continue;
                }

                if let Err(e) = self.engine.run_sweep().await {
                    error!("compensation sweep failed: {e}");
                }

                self.in_progress.store(false, Ordering::Release);
            }
        })
    }
}
