// Worker loop: claim, analyze, commit, re-enter.
//
// One worker task per batch is the default deployment; correctness does not
// depend on it (the atomic claim serializes multiple workers), but sequential
// processing is what keeps the analyzer inside external rate limits.

use std::time::Duration;

use chrono::Utc;
use cvsift_core::{new_id, plan, BatchCounter, ItemEvent, ItemRecord, PlannedOutcome};
use cvsift_store::UpdateOutcome;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::{Engine, EngineError};

impl Engine {
    /// Spawn the worker loop for a batch as a background task.
    pub fn spawn_worker(&self, batch_id: &str) -> JoinHandle<()> {
        let engine = self.clone();
        let batch_id = batch_id.to_string();
        tokio::spawn(async move {
            if let Err(err) = engine.run_worker(&batch_id).await {
                error!(batch_id, error = %err, "worker loop aborted");
            }
        })
    }

    /// Run the claim-analyze-commit loop until the batch has no more work or
    /// leaves the `running` status.
    pub async fn run_worker(&self, batch_id: &str) -> Result<(), EngineError> {
        // The job description is immutable after creation, so one read
        // serves the whole loop.
        let Some(batch) = self.state.get_batch(batch_id).await? else {
            return Ok(());
        };
        let job_description = batch.job_description;

        loop {
            let worker_id = new_id();
            let Some(item) = self.claim(batch_id, &worker_id).await? else {
                // Nothing claimable: either the batch stopped running or the
                // queue drained. Settle the books and bow out.
                self.recompute_completion(batch_id).await?;
                info!(batch_id, "worker loop done");
                return Ok(());
            };

            let backoff = self
                .execute_item(&item, &job_description, &worker_id)
                .await?;

            match backoff {
                Some(delay) => tokio::time::sleep(delay).await,
                // Yield between items so the loop never starves the runtime.
                None => tokio::task::yield_now().await,
            }
        }
    }

    /// Run one claimed item through the analyzer and commit the outcome.
    /// Returns the backoff to respect before the next claim, if any.
    async fn execute_item(
        &self,
        item: &ItemRecord,
        job_description: &str,
        worker_id: &str,
    ) -> Result<Option<Duration>, EngineError> {
        let outcome = self.analyzer.analyze(&item.file_ref, job_description).await;

        let event = match outcome {
            Ok(result) => ItemEvent::AnalysisSucceeded {
                worker_id: worker_id.to_string(),
                result,
            },
            Err(err) => {
                let transient = err.is_transient();
                ItemEvent::AnalysisFailed {
                    worker_id: worker_id.to_string(),
                    error: err.into_failure(),
                    transient,
                }
            }
        };

        let now = Utc::now();
        let transition = plan(item, event, now);
        let applied = self
            .state
            .update_item_if(
                &item.batch_id,
                &item.item_id,
                transition.guard,
                transition.patch,
            )
            .await?;

        let updated = match applied {
            UpdateOutcome::Applied(updated) => updated,
            UpdateOutcome::Conflict => {
                // The watchdog reclaimed this lease while the analyzer ran
                // and the slot moved on; the fresh attempt owns it now.
                warn!(
                    batch_id = %item.batch_id,
                    item_id = %item.item_id,
                    worker_id,
                    "terminal write fenced by a newer lease"
                );
                return Ok(None);
            }
        };

        match transition.outcome {
            PlannedOutcome::Completed => {
                info!(
                    batch_id = %item.batch_id,
                    item_id = %item.item_id,
                    retry_count = updated.retry_count,
                    "item complete"
                );
                self.state
                    .add_to_counter(&item.batch_id, BatchCounter::Completed, 1, now)
                    .await?;
                self.recompute_completion(&item.batch_id).await?;
                Ok(None)
            }
            PlannedOutcome::Failed => {
                warn!(
                    batch_id = %item.batch_id,
                    item_id = %item.item_id,
                    code = updated.error.as_ref().map(|e| e.code.as_str()).unwrap_or(""),
                    "item failed permanently"
                );
                self.state
                    .add_to_counter(&item.batch_id, BatchCounter::Failed, 1, now)
                    .await?;
                self.recompute_completion(&item.batch_id).await?;
                Ok(None)
            }
            PlannedOutcome::Requeued => {
                let delay = self.backoff_delay(updated.retry_count);
                info!(
                    batch_id = %item.batch_id,
                    item_id = %item.item_id,
                    retry_count = updated.retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "transient failure, item requeued"
                );
                Ok(Some(delay))
            }
            // Claim/cancel outcomes are never planned from analyzer results.
            PlannedOutcome::Claimed | PlannedOutcome::Cancelled => Ok(None),
        }
    }

    /// Exponential backoff for the Nth retry: `base * 2^(n-1)`, clamped.
    fn backoff_delay(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(16);
        let ms = self
            .config
            .worker_backoff_base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.config.worker_backoff_max_ms);
        Duration::from_millis(ms)
    }
}
