// State store abstraction.
//
// The engine needs a handful of capabilities from whatever document store
// backs it: atomic conditional writes, concurrent-safe counter increments,
// and two indexed queries (oldest pending item per batch, expired running
// items across batches). Claim correctness rests entirely on the conditional
// write; a successful write must be visible to every read that starts after
// its acknowledgement.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cvsift_core::{
    BatchCounter, BatchRecord, BatchStatus, ItemGuard, ItemPatch, ItemRecord, ItemStatus,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("batch not found: {0}")]
    BatchNotFound(String),

    #[error("item not found: {0}")]
    ItemNotFound(String),

    #[error("record already exists: {0}")]
    AlreadyExists(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Result of a conditional write: either the guard admitted and the patched
/// record is returned, or another writer got there first.
#[derive(Debug, Clone)]
pub enum UpdateOutcome<T> {
    Applied(T),
    Conflict,
}

impl<T> UpdateOutcome<T> {
    pub fn applied(self) -> Option<T> {
        match self {
            UpdateOutcome::Applied(record) => Some(record),
            UpdateOutcome::Conflict => None,
        }
    }
}

/// Result of the cancellation sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelSweep {
    /// Batch flipped to cancelled; `swept` pending items went with it.
    Cancelled { swept: u64 },
    /// Batch was already in a state cancel does not apply to.
    NotApplicable(BatchStatus),
}

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Create a batch and all of its items in a single transaction. Nothing
    /// is visible until the whole write lands.
    async fn insert_batch(
        &self,
        batch: BatchRecord,
        items: Vec<ItemRecord>,
    ) -> Result<(), StoreError>;

    async fn get_batch(&self, batch_id: &str) -> Result<Option<BatchRecord>, StoreError>;

    async fn get_item(
        &self,
        batch_id: &str,
        item_id: &str,
    ) -> Result<Option<ItemRecord>, StoreError>;

    /// Item snapshots for a batch, optionally filtered by status, in FIFO
    /// (`last_updated_at`) order.
    async fn list_items(
        &self,
        batch_id: &str,
        status: Option<ItemStatus>,
    ) -> Result<Vec<ItemRecord>, StoreError>;

    /// The claim query: oldest pending item of the batch by `last_updated_at`.
    async fn oldest_pending(&self, batch_id: &str) -> Result<Option<ItemRecord>, StoreError>;

    /// The watchdog query: running items across all batches whose lease
    /// started before `cutoff`.
    async fn expired_running(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ItemRecord>, StoreError>;

    /// Batches currently in `running` status (worker respawn after restart).
    async fn running_batches(&self) -> Result<Vec<BatchRecord>, StoreError>;

    /// Atomic conditional item write: re-evaluate `guard` against the live
    /// record and apply `patch` only if it admits.
    async fn update_item_if(
        &self,
        batch_id: &str,
        item_id: &str,
        guard: ItemGuard,
        patch: ItemPatch,
    ) -> Result<UpdateOutcome<ItemRecord>, StoreError>;

    /// Atomic conditional status flip on the batch record. The exactly-once
    /// `running -> complete` transition and pause/resume go through here.
    async fn update_batch_if(
        &self,
        batch_id: &str,
        expect: BatchStatus,
        new_status: BatchStatus,
        now: DateTime<Utc>,
    ) -> Result<UpdateOutcome<BatchRecord>, StoreError>;

    /// Concurrent-writer-safe increment of a monotonic batch counter.
    /// Advances `updated_at` and returns the updated record.
    async fn add_to_counter(
        &self,
        batch_id: &str,
        counter: BatchCounter,
        delta: u64,
        now: DateTime<Utc>,
    ) -> Result<BatchRecord, StoreError>;

    /// Single-transaction cancel: flip `running|paused -> cancelled` and move
    /// every pending item to `cancelled`, bumping `cancelled_count` by the
    /// swept count.
    async fn cancel_sweep(
        &self,
        batch_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CancelSweep, StoreError>;

    /// Teardown: delete items, then the batch. Idempotent; a missing batch
    /// is not an error.
    async fn delete_batch(&self, batch_id: &str) -> Result<(), StoreError>;
}
