// Item lifecycle state machine.
//
// Transitions are planned here as (guard, patch) pairs and applied atomically
// by the state store. The guard is re-evaluated against the live record under
// the store's write lock, so a stale snapshot can never overwrite a fresher
// transition: a worker's terminal write is predicated on the lease still being
// its own, and the watchdog's reset is predicated on the lease not having been
// re-issued since it was observed.

use chrono::{DateTime, Utc};

use crate::model::{ItemFailure, ItemRecord, ItemStatus};

/// Predicate checked against the live record before a patch applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemGuard {
    /// Record is currently in the given status.
    StatusIs(ItemStatus),
    /// Record is running under this worker's lease.
    RunningBy { worker_id: String },
    /// Record is running and its lease has not been re-issued since it was
    /// observed at `start_time`.
    RunningSince { start_time: DateTime<Utc> },
}

impl ItemGuard {
    pub fn admits(&self, item: &ItemRecord) -> bool {
        match self {
            ItemGuard::StatusIs(status) => item.status == *status,
            ItemGuard::RunningBy { worker_id } => {
                item.status == ItemStatus::Running && item.worker_id.as_deref() == Some(worker_id)
            }
            ItemGuard::RunningSince { start_time } => {
                item.status == ItemStatus::Running && item.start_time == Some(*start_time)
            }
        }
    }
}

/// Field updates applied when the guard admits. `None` leaves a field alone;
/// the nested options set-or-clear nullable fields.
#[derive(Debug, Clone, Default)]
pub struct ItemPatch {
    pub status: Option<ItemStatus>,
    pub worker_id: Option<Option<String>>,
    pub start_time: Option<Option<DateTime<Utc>>>,
    pub retry_count: Option<u32>,
    pub result: Option<serde_json::Value>,
    pub error: Option<Option<ItemFailure>>,
    pub last_updated_at: Option<DateTime<Utc>>,
}

impl ItemPatch {
    pub fn apply(&self, item: &mut ItemRecord) {
        if let Some(status) = self.status {
            item.status = status;
        }
        if let Some(worker_id) = &self.worker_id {
            item.worker_id = worker_id.clone();
        }
        if let Some(start_time) = self.start_time {
            item.start_time = start_time;
        }
        if let Some(retry_count) = self.retry_count {
            item.retry_count = retry_count;
        }
        if let Some(result) = &self.result {
            item.result = Some(result.clone());
        }
        if let Some(error) = &self.error {
            item.error = error.clone();
        }
        if let Some(at) = self.last_updated_at {
            item.last_updated_at = at;
        }
    }
}

/// Lifecycle events an item can receive.
#[derive(Debug, Clone)]
pub enum ItemEvent {
    /// A worker claims the item for execution.
    Claim { worker_id: String },
    /// The analyzer returned a result.
    AnalysisSucceeded {
        worker_id: String,
        result: serde_json::Value,
    },
    /// The analyzer failed; `transient` decides retry eligibility.
    AnalysisFailed {
        worker_id: String,
        error: ItemFailure,
        transient: bool,
    },
    /// The watchdog observed an expired lease.
    LeaseExpired {
        observed_start: DateTime<Utc>,
        error: ItemFailure,
    },
    /// The owning batch was cancelled while the item was still pending.
    BatchCancelled,
}

/// Where a planned transition lands, so the caller knows which batch counter
/// (if any) to bump afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlannedOutcome {
    Claimed,
    Requeued,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct TransitionPlan {
    pub guard: ItemGuard,
    pub patch: ItemPatch,
    pub outcome: PlannedOutcome,
}

/// Plan the transition for `event` against a snapshot of the item.
///
/// Retry accounting: `retry_count` counts failed attempts that re-entered the
/// queue, so a transient failure (or lease expiry) below the ceiling requeues
/// with `retry_count + 1`, and at the ceiling promotes to `failed` without a
/// further bump.
pub fn plan(item: &ItemRecord, event: ItemEvent, now: DateTime<Utc>) -> TransitionPlan {
    match event {
        ItemEvent::Claim { worker_id } => TransitionPlan {
            guard: ItemGuard::StatusIs(ItemStatus::Pending),
            patch: ItemPatch {
                status: Some(ItemStatus::Running),
                worker_id: Some(Some(worker_id)),
                start_time: Some(Some(now)),
                last_updated_at: Some(now),
                ..Default::default()
            },
            outcome: PlannedOutcome::Claimed,
        },
        ItemEvent::AnalysisSucceeded { worker_id, result } => TransitionPlan {
            guard: ItemGuard::RunningBy { worker_id },
            patch: ItemPatch {
                status: Some(ItemStatus::Complete),
                worker_id: Some(None),
                start_time: Some(None),
                result: Some(result),
                error: Some(None),
                last_updated_at: Some(now),
                ..Default::default()
            },
            outcome: PlannedOutcome::Completed,
        },
        ItemEvent::AnalysisFailed {
            worker_id,
            error,
            transient,
        } => {
            let guard = ItemGuard::RunningBy { worker_id };
            if transient && item.retry_count < item.max_retries {
                requeue(guard, item.retry_count + 1, error, now)
            } else {
                fail(guard, error, now)
            }
        }
        ItemEvent::LeaseExpired {
            observed_start,
            error,
        } => {
            let guard = ItemGuard::RunningSince {
                start_time: observed_start,
            };
            if item.retry_count < item.max_retries {
                requeue(guard, item.retry_count + 1, error, now)
            } else {
                fail(guard, error, now)
            }
        }
        ItemEvent::BatchCancelled => TransitionPlan {
            guard: ItemGuard::StatusIs(ItemStatus::Pending),
            patch: ItemPatch {
                status: Some(ItemStatus::Cancelled),
                last_updated_at: Some(now),
                ..Default::default()
            },
            outcome: PlannedOutcome::Cancelled,
        },
    }
}

/// Back to pending at the tail of the queue: refreshing `last_updated_at`
/// demotes the item behind every other pending item.
fn requeue(
    guard: ItemGuard,
    retry_count: u32,
    error: ItemFailure,
    now: DateTime<Utc>,
) -> TransitionPlan {
    TransitionPlan {
        guard,
        patch: ItemPatch {
            status: Some(ItemStatus::Pending),
            worker_id: Some(None),
            start_time: Some(None),
            retry_count: Some(retry_count),
            error: Some(Some(error)),
            last_updated_at: Some(now),
            ..Default::default()
        },
        outcome: PlannedOutcome::Requeued,
    }
}

fn fail(guard: ItemGuard, error: ItemFailure, now: DateTime<Utc>) -> TransitionPlan {
    TransitionPlan {
        guard,
        patch: ItemPatch {
            status: Some(ItemStatus::Failed),
            worker_id: Some(None),
            start_time: Some(None),
            error: Some(Some(error)),
            last_updated_at: Some(now),
            ..Default::default()
        },
        outcome: PlannedOutcome::Failed,
    }
}
