// Watchdog: lease-expiry recovery for items abandoned by dead workers.
//
// The sweep only ever talks to the state store, so it can run in the same
// process as the workers or in a separate one. A late-but-alive worker is
// never disturbed: the reset is predicated on the lease (start_time) still
// being the one the sweep observed, and a terminal write that landed first
// turns the reset into a conflict no-op.

use chrono::{Duration as ChronoDuration, Utc};
use cvsift_core::{plan, BatchCounter, ItemEvent, ItemFailure, PlannedOutcome};
use cvsift_store::UpdateOutcome;
use tracing::{error, info, warn};

use crate::{Engine, EngineError};

/// What one sweep did.
#[derive(Debug, Default, Clone)]
pub struct SweepReport {
    /// Items put back in the queue with a bumped retry count.
    pub requeued: u64,
    /// Items promoted to failed at the retry ceiling.
    pub failed: u64,
    /// Expired-looking items that settled or re-leased before our write.
    pub untouched: u64,
    /// Batches that got items back and may need a worker respawned.
    pub requeued_batches: Vec<String>,
}

impl Engine {
    /// One pass over every running item whose lease has expired.
    pub async fn sweep_expired(&self) -> Result<SweepReport, EngineError> {
        let now = Utc::now();
        let lease_seconds = self.config.lease_seconds;
        let cutoff = now - ChronoDuration::seconds(lease_seconds as i64);

        let expired = self.state.expired_running(cutoff).await?;
        let mut report = SweepReport::default();

        for item in expired {
            let Some(observed_start) = item.start_time else {
                continue;
            };

            let transition = plan(
                &item,
                ItemEvent::LeaseExpired {
                    observed_start,
                    error: ItemFailure::timeout(lease_seconds),
                },
                now,
            );
            let applied = self
                .state
                .update_item_if(
                    &item.batch_id,
                    &item.item_id,
                    transition.guard,
                    transition.patch,
                )
                .await?;

            match applied {
                UpdateOutcome::Conflict => {
                    // The worker finished (or a new lease started) between
                    // our read and our write; leave it alone.
                    report.untouched += 1;
                }
                UpdateOutcome::Applied(updated) => match transition.outcome {
                    PlannedOutcome::Requeued => {
                        warn!(
                            batch_id = %item.batch_id,
                            item_id = %item.item_id,
                            retry_count = updated.retry_count,
                            "lease expired, item requeued"
                        );
                        report.requeued += 1;
                        if !report.requeued_batches.contains(&item.batch_id) {
                            report.requeued_batches.push(item.batch_id.clone());
                        }
                    }
                    PlannedOutcome::Failed => {
                        warn!(
                            batch_id = %item.batch_id,
                            item_id = %item.item_id,
                            "lease expired at retry ceiling, item failed"
                        );
                        self.state
                            .add_to_counter(&item.batch_id, BatchCounter::Failed, 1, now)
                            .await?;
                        self.recompute_completion(&item.batch_id).await?;
                        report.failed += 1;
                    }
                    _ => {}
                },
            }
        }

        if report.requeued + report.failed > 0 {
            info!(
                requeued = report.requeued,
                failed = report.failed,
                untouched = report.untouched,
                "watchdog sweep recovered items"
            );
        }
        Ok(report)
    }

    /// Periodic sweep loop. Requeued items may belong to batches whose
    /// worker died with them, so each affected running batch gets a fresh
    /// worker loop.
    pub async fn run_watchdog(self) {
        let mut ticker = tokio::time::interval(self.config.watchdog_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.sweep_expired().await {
                Ok(report) => {
                    for batch_id in &report.requeued_batches {
                        self.spawn_worker(batch_id);
                    }
                }
                Err(err) => {
                    error!(error = %err, "watchdog sweep failed");
                }
            }
        }
    }
}
