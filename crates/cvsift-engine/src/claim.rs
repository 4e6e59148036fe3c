// Claim engine: atomically lease one pending item to one worker.

use chrono::Utc;
use cvsift_core::{plan, BatchStatus, ItemEvent, ItemRecord};
use cvsift_store::UpdateOutcome;
use tracing::debug;

use crate::{Engine, EngineError};

impl Engine {
    /// Lease the oldest pending item of the batch to `worker_id`.
    ///
    /// Returns `None` when the batch is not running, when no pending item
    /// exists, or when claim contention exhausts the bounded retry budget.
    /// The conditional `pending -> running` write guarantees at most one
    /// worker ever observes a given lease as its own.
    pub async fn claim(
        &self,
        batch_id: &str,
        worker_id: &str,
    ) -> Result<Option<ItemRecord>, EngineError> {
        let Some(batch) = self.state.get_batch(batch_id).await? else {
            return Ok(None);
        };
        if batch.status != BatchStatus::Running {
            return Ok(None);
        }

        let attempts = self.config.claim_retries.saturating_add(1);
        for attempt in 0..attempts {
            let Some(candidate) = self.state.oldest_pending(batch_id).await? else {
                return Ok(None);
            };

            let claim = plan(
                &candidate,
                ItemEvent::Claim {
                    worker_id: worker_id.to_string(),
                },
                Utc::now(),
            );
            match self
                .state
                .update_item_if(batch_id, &candidate.item_id, claim.guard, claim.patch)
                .await?
            {
                UpdateOutcome::Applied(item) => return Ok(Some(item)),
                UpdateOutcome::Conflict => {
                    // Another claimant won; re-run the query.
                    debug!(
                        batch_id,
                        item_id = %candidate.item_id,
                        attempt,
                        "claim contention, retrying"
                    );
                }
            }
        }

        Ok(None)
    }
}
