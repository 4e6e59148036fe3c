// cvsift-engine - Durable batch execution
//
// Turns an uploaded set of candidate documents into a pool of work items,
// claims them one at a time from the state store, executes each through the
// analyzer with bounded retries, recovers items abandoned by dead workers,
// and exposes pause/resume/cancel over a whole batch.
//
// The state store is the single source of truth: workers hold no in-process
// locks, and every cross-task decision rides on an atomic conditional write.

use std::sync::Arc;

use chrono::Utc;
use cvsift_config::EngineConfig;
use cvsift_core::BatchStatus;
use cvsift_store::{ObjectStore, StateStore, StoreError, UpdateOutcome};
use thiserror::Error;
use tracing::{error, info};

pub mod analyzer;
mod claim;
mod controller;
mod watchdog;
mod worker;

pub use analyzer::{Analyzer, AnalyzerError, HttpAnalyzer};
pub use controller::{ControlAction, ControlOutcome, CreateReceipt, SourceFile};
pub use watchdog::SweepReport;

/// Errors surfaced by controller operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("permission denied for batch {0}")]
    Forbidden(String),

    #[error("batch not found: {0}")]
    NotFound(String),

    #[error("batch {batch_id} is {status}: {operation} does not apply")]
    IllegalState {
        batch_id: String,
        status: &'static str,
        operation: &'static str,
    },

    #[error("storage unavailable: {0}")]
    Store(#[from] StoreError),
}

/// The batch execution engine. Cheap to clone; gateways are shared handles.
#[derive(Clone)]
pub struct Engine {
    state: Arc<dyn StateStore>,
    objects: ObjectStore,
    analyzer: Arc<dyn Analyzer>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        state: Arc<dyn StateStore>,
        objects: ObjectStore,
        analyzer: Arc<dyn Analyzer>,
        config: EngineConfig,
    ) -> Self {
        Self {
            state,
            objects,
            analyzer,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn object_store(&self) -> &ObjectStore {
        &self.objects
    }

    /// Completion recomputation: after any terminal item transition, compare
    /// the settled-slot sum against `total` and conditionally flip
    /// `running -> complete`. The conditional write makes the flip
    /// exactly-once, and a batch that left `running` (paused or cancelled)
    /// is never overwritten.
    ///
    /// Counters exceeding `total` mean the accounting invariant broke; the
    /// batch is parked in `paused` for operator intervention instead of ever
    /// reporting a bogus completion.
    pub async fn recompute_completion(&self, batch_id: &str) -> Result<(), EngineError> {
        let Some(batch) = self.state.get_batch(batch_id).await? else {
            return Ok(());
        };

        if batch.counters_overflowed() {
            error!(
                batch_id,
                total = batch.total,
                completed = batch.completed,
                failed = batch.failed,
                cancelled = batch.cancelled_count,
                "batch counters exceed total; pausing batch for operator intervention"
            );
            self.state
                .update_batch_if(batch_id, BatchStatus::Running, BatchStatus::Paused, Utc::now())
                .await?;
            return Ok(());
        }

        if batch.is_settled() && batch.status == BatchStatus::Running {
            if let UpdateOutcome::Applied(done) = self
                .state
                .update_batch_if(
                    batch_id,
                    BatchStatus::Running,
                    BatchStatus::Complete,
                    Utc::now(),
                )
                .await?
            {
                info!(
                    batch_id,
                    completed = done.completed,
                    failed = done.failed,
                    cancelled = done.cancelled_count,
                    skipped_duplicates = done.skipped_duplicates,
                    "batch complete"
                );
            }
        }

        Ok(())
    }
}
