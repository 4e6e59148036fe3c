// Batch controller: create, pause/resume/cancel, snapshots, teardown.
//
// Every operation authorizes the caller against the batch owner. Illegal
// control transitions are no-ops reported as `NotApplicable`, never errors:
// cancelling a complete batch twice must look exactly like cancelling it
// once.

use std::collections::HashSet;

use chrono::{Duration as ChronoDuration, Utc};
use cvsift_core::{new_id, sha256_hex, BatchRecord, BatchStatus, ItemRecord, ItemStatus};
use cvsift_store::{CancelSweep, UpdateOutcome};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{Engine, EngineError};

/// One uploaded candidate document.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// What batch creation returns to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct CreateReceipt {
    pub batch_id: String,
    pub total: u64,
    pub skipped_duplicates: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Pause,
    Resume,
    Cancel,
}

impl ControlAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlAction::Pause => "pause",
            ControlAction::Resume => "resume",
            ControlAction::Cancel => "cancel",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlOutcome {
    Applied,
    NotApplicable,
}

impl Engine {
    /// Create a batch: hash and dedup the files, upload the keepers, write
    /// batch and items in one transaction, and schedule the worker loop.
    ///
    /// On any failure no batch record is left visible and uploaded bytes are
    /// released.
    pub async fn create_batch(
        &self,
        owner_id: &str,
        job_description: &str,
        files: Vec<SourceFile>,
    ) -> Result<CreateReceipt, EngineError> {
        if job_description.trim().is_empty() {
            return Err(EngineError::Validation(
                "job description must not be empty".into(),
            ));
        }
        if files.is_empty() {
            return Err(EngineError::Validation(
                "at least one file is required".into(),
            ));
        }

        let now = Utc::now();
        let mut seen = HashSet::new();
        let mut kept: Vec<(SourceFile, String)> = Vec::new();
        let mut skipped_duplicates = 0u64;
        for file in files {
            let digest = sha256_hex(&file.bytes);
            if seen.insert(digest.clone()) {
                kept.push((file, digest));
            } else {
                skipped_duplicates += 1;
            }
        }

        let batch = BatchRecord::new(
            owner_id,
            job_description,
            kept.len() as u64,
            skipped_duplicates,
            now,
        );
        let batch_id = batch.batch_id.clone();

        let mut items = Vec::with_capacity(kept.len());
        for (position, (file, digest)) in kept.into_iter().enumerate() {
            let item_id = new_id();
            let file_ref = match self
                .objects
                .put(&batch_id, &item_id, &file.filename, file.bytes)
                .await
            {
                Ok(file_ref) => file_ref,
                Err(err) => {
                    self.release_uploads(&batch_id).await;
                    return Err(err.into());
                }
            };
            // Strictly increasing stamps preserve upload order in the FIFO
            // claim queue.
            let mut item = ItemRecord::new(
                &batch_id,
                file_ref,
                digest,
                self.config.max_retries,
                now + ChronoDuration::microseconds(position as i64),
            );
            item.item_id = item_id;
            items.push(item);
        }

        if let Err(err) = self.state.insert_batch(batch.clone(), items).await {
            self.release_uploads(&batch_id).await;
            return Err(err.into());
        }

        info!(
            batch_id,
            owner_id,
            total = batch.total,
            skipped_duplicates,
            "batch created"
        );

        if batch.total == 0 {
            // Every input was a duplicate of another: nothing to run.
            self.recompute_completion(&batch_id).await?;
        } else {
            self.spawn_worker(&batch_id);
        }

        Ok(CreateReceipt {
            batch_id,
            total: batch.total,
            skipped_duplicates,
        })
    }

    /// Apply a control action. Only the transitions
    /// pause: running -> paused, resume: paused -> running, and
    /// cancel: running|paused -> cancelled mutate anything; everything else
    /// is `NotApplicable`.
    pub async fn control_batch(
        &self,
        owner_id: &str,
        batch_id: &str,
        action: ControlAction,
    ) -> Result<ControlOutcome, EngineError> {
        self.load_authorized(owner_id, batch_id).await?;
        let now = Utc::now();

        let outcome = match action {
            ControlAction::Pause => {
                match self
                    .state
                    .update_batch_if(batch_id, BatchStatus::Running, BatchStatus::Paused, now)
                    .await?
                {
                    UpdateOutcome::Applied(_) => ControlOutcome::Applied,
                    UpdateOutcome::Conflict => ControlOutcome::NotApplicable,
                }
            }
            ControlAction::Resume => {
                match self
                    .state
                    .update_batch_if(batch_id, BatchStatus::Paused, BatchStatus::Running, now)
                    .await?
                {
                    UpdateOutcome::Applied(_) => {
                        self.spawn_worker(batch_id);
                        ControlOutcome::Applied
                    }
                    UpdateOutcome::Conflict => ControlOutcome::NotApplicable,
                }
            }
            ControlAction::Cancel => match self.state.cancel_sweep(batch_id, now).await? {
                CancelSweep::Cancelled { swept } => {
                    info!(batch_id, swept, "batch cancelled");
                    ControlOutcome::Applied
                }
                CancelSweep::NotApplicable(_) => ControlOutcome::NotApplicable,
            },
        };

        if outcome == ControlOutcome::Applied {
            info!(batch_id, action = action.as_str(), "control applied");
        }
        Ok(outcome)
    }

    /// Authoritative batch snapshot.
    pub async fn get_batch(
        &self,
        owner_id: &str,
        batch_id: &str,
    ) -> Result<BatchRecord, EngineError> {
        self.load_authorized(owner_id, batch_id).await
    }

    /// Item snapshots, optionally filtered by status.
    pub async fn list_items(
        &self,
        owner_id: &str,
        batch_id: &str,
        status: Option<ItemStatus>,
    ) -> Result<Vec<ItemRecord>, EngineError> {
        self.load_authorized(owner_id, batch_id).await?;
        Ok(self.state.list_items(batch_id, status).await?)
    }

    /// Delete a settled batch: items, then the batch record, then every byte
    /// under its object prefix. Idempotent across partial prior deletions.
    /// Refused while the batch is running.
    pub async fn teardown_batch(
        &self,
        owner_id: &str,
        batch_id: &str,
    ) -> Result<(), EngineError> {
        let Some(batch) = self.state.get_batch(batch_id).await? else {
            // Records already gone; make sure the bytes are too.
            self.objects.delete_all(batch_id).await?;
            return Ok(());
        };
        if batch.owner_id != owner_id {
            return Err(EngineError::Forbidden(batch_id.to_string()));
        }
        if batch.status == BatchStatus::Running {
            return Err(EngineError::IllegalState {
                batch_id: batch_id.to_string(),
                status: batch.status.as_str(),
                operation: "teardown",
            });
        }

        self.state.delete_batch(batch_id).await?;
        self.objects.delete_all(batch_id).await?;
        info!(batch_id, "batch torn down");
        Ok(())
    }

    /// Respawn worker loops for batches left `running` by a previous
    /// process (crash-safety across restarts).
    pub async fn respawn_workers(&self) -> Result<usize, EngineError> {
        let batches = self.state.running_batches().await?;
        for batch in &batches {
            self.spawn_worker(&batch.batch_id);
        }
        if !batches.is_empty() {
            info!(count = batches.len(), "respawned workers for running batches");
        }
        Ok(batches.len())
    }

    async fn load_authorized(
        &self,
        owner_id: &str,
        batch_id: &str,
    ) -> Result<BatchRecord, EngineError> {
        let batch = self
            .state
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(batch_id.to_string()))?;
        if batch.owner_id != owner_id {
            return Err(EngineError::Forbidden(batch_id.to_string()));
        }
        Ok(batch)
    }

    /// Best-effort release of uploaded bytes after a failed creation.
    async fn release_uploads(&self, batch_id: &str) {
        if let Err(err) = self.objects.delete_all(batch_id).await {
            warn!(batch_id, error = %err, "failed to release uploads for aborted creation");
        }
    }
}
