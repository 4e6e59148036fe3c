// In-process state store.
//
// A single mutex around the whole table gives every trait method the
// transactional behavior the engine relies on: conditional writes, the
// multi-record create, and the cancel sweep each run under one critical
// section, so a write acknowledged here is visible to every later reader.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cvsift_core::{
    BatchCounter, BatchRecord, BatchStatus, ItemGuard, ItemPatch, ItemRecord, ItemStatus,
};
use parking_lot::Mutex;

use crate::state::{CancelSweep, StateStore, StoreError, UpdateOutcome};

#[derive(Default)]
struct Inner {
    batches: HashMap<String, BatchRecord>,
    /// batch_id -> item_id -> record
    items: HashMap<String, BTreeMap<String, ItemRecord>>,
}

/// In-memory `StateStore` implementation.
#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<Inner>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// FIFO ordering: `last_updated_at` ascending, item id as a deterministic
/// tie-break for records stamped in the same instant.
fn fifo_key(item: &ItemRecord) -> (DateTime<Utc>, String) {
    (item.last_updated_at, item.item_id.clone())
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn insert_batch(
        &self,
        batch: BatchRecord,
        items: Vec<ItemRecord>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.batches.contains_key(&batch.batch_id) {
            return Err(StoreError::AlreadyExists(batch.batch_id));
        }
        let table = items
            .into_iter()
            .map(|item| (item.item_id.clone(), item))
            .collect();
        inner.items.insert(batch.batch_id.clone(), table);
        inner.batches.insert(batch.batch_id.clone(), batch);
        Ok(())
    }

    async fn get_batch(&self, batch_id: &str) -> Result<Option<BatchRecord>, StoreError> {
        Ok(self.inner.lock().batches.get(batch_id).cloned())
    }

    async fn get_item(
        &self,
        batch_id: &str,
        item_id: &str,
    ) -> Result<Option<ItemRecord>, StoreError> {
        Ok(self
            .inner
            .lock()
            .items
            .get(batch_id)
            .and_then(|table| table.get(item_id))
            .cloned())
    }

    async fn list_items(
        &self,
        batch_id: &str,
        status: Option<ItemStatus>,
    ) -> Result<Vec<ItemRecord>, StoreError> {
        let inner = self.inner.lock();
        let mut items: Vec<ItemRecord> = inner
            .items
            .get(batch_id)
            .map(|table| {
                table
                    .values()
                    .filter(|item| status.map_or(true, |s| item.status == s))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        items.sort_by_key(fifo_key);
        Ok(items)
    }

    async fn oldest_pending(&self, batch_id: &str) -> Result<Option<ItemRecord>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner.items.get(batch_id).and_then(|table| {
            table
                .values()
                .filter(|item| item.status == ItemStatus::Pending)
                .min_by_key(|item| fifo_key(item))
                .cloned()
        }))
    }

    async fn expired_running(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ItemRecord>, StoreError> {
        let inner = self.inner.lock();
        let mut expired: Vec<ItemRecord> = inner
            .items
            .values()
            .flat_map(|table| table.values())
            .filter(|item| {
                item.status == ItemStatus::Running
                    && item.start_time.is_some_and(|start| start < cutoff)
            })
            .cloned()
            .collect();
        expired.sort_by_key(fifo_key);
        Ok(expired)
    }

    async fn running_batches(&self) -> Result<Vec<BatchRecord>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .batches
            .values()
            .filter(|batch| batch.status == BatchStatus::Running)
            .cloned()
            .collect())
    }

    async fn update_item_if(
        &self,
        batch_id: &str,
        item_id: &str,
        guard: ItemGuard,
        patch: ItemPatch,
    ) -> Result<UpdateOutcome<ItemRecord>, StoreError> {
        let mut inner = self.inner.lock();
        let item = inner
            .items
            .get_mut(batch_id)
            .and_then(|table| table.get_mut(item_id))
            .ok_or_else(|| StoreError::ItemNotFound(item_id.to_string()))?;
        if !guard.admits(item) {
            return Ok(UpdateOutcome::Conflict);
        }
        patch.apply(item);
        Ok(UpdateOutcome::Applied(item.clone()))
    }

    async fn update_batch_if(
        &self,
        batch_id: &str,
        expect: BatchStatus,
        new_status: BatchStatus,
        now: DateTime<Utc>,
    ) -> Result<UpdateOutcome<BatchRecord>, StoreError> {
        let mut inner = self.inner.lock();
        let batch = inner
            .batches
            .get_mut(batch_id)
            .ok_or_else(|| StoreError::BatchNotFound(batch_id.to_string()))?;
        if batch.status != expect {
            return Ok(UpdateOutcome::Conflict);
        }
        batch.status = new_status;
        batch.updated_at = now;
        Ok(UpdateOutcome::Applied(batch.clone()))
    }

    async fn add_to_counter(
        &self,
        batch_id: &str,
        counter: BatchCounter,
        delta: u64,
        now: DateTime<Utc>,
    ) -> Result<BatchRecord, StoreError> {
        let mut inner = self.inner.lock();
        let batch = inner
            .batches
            .get_mut(batch_id)
            .ok_or_else(|| StoreError::BatchNotFound(batch_id.to_string()))?;
        match counter {
            BatchCounter::Completed => batch.completed += delta,
            BatchCounter::Failed => batch.failed += delta,
            BatchCounter::CancelledCount => batch.cancelled_count += delta,
            BatchCounter::SkippedDuplicates => batch.skipped_duplicates += delta,
        }
        batch.updated_at = now;
        Ok(batch.clone())
    }

    async fn cancel_sweep(
        &self,
        batch_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CancelSweep, StoreError> {
        let mut inner = self.inner.lock();
        let batch = inner
            .batches
            .get_mut(batch_id)
            .ok_or_else(|| StoreError::BatchNotFound(batch_id.to_string()))?;
        match batch.status {
            BatchStatus::Running | BatchStatus::Paused => {}
            other => return Ok(CancelSweep::NotApplicable(other)),
        }

        batch.status = BatchStatus::Cancelled;
        batch.updated_at = now;

        let mut swept = 0u64;
        if let Some(table) = inner.items.get_mut(batch_id) {
            for item in table.values_mut() {
                if item.status == ItemStatus::Pending {
                    item.status = ItemStatus::Cancelled;
                    item.last_updated_at = now;
                    swept += 1;
                }
            }
        }
        if swept > 0 {
            // Same critical section as the flip: the sweep is one transaction.
            let batch = inner.batches.get_mut(batch_id).expect("batch checked above");
            batch.cancelled_count += swept;
        }
        Ok(CancelSweep::Cancelled { swept })
    }

    async fn delete_batch(&self, batch_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.items.remove(batch_id);
        inner.batches.remove(batch_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use cvsift_core::{plan, ItemEvent};

    async fn seed(store: &MemoryStateStore, item_count: usize) -> (BatchRecord, Vec<ItemRecord>) {
        let now = Utc::now();
        let batch = BatchRecord::new("owner-1", "senior rust engineer", item_count as u64, 0, now);
        let items: Vec<ItemRecord> = (0..item_count)
            .map(|i| {
                ItemRecord::new(
                    &batch.batch_id,
                    format!("{}/i{}/resume.pdf", batch.batch_id, i),
                    format!("hash-{}", i),
                    3,
                    now + Duration::microseconds(i as i64),
                )
            })
            .collect();
        store
            .insert_batch(batch.clone(), items.clone())
            .await
            .unwrap();
        (batch, items)
    }

    #[tokio::test]
    async fn test_insert_is_all_or_nothing_and_unique() {
        let store = MemoryStateStore::new();
        let (batch, items) = seed(&store, 2).await;

        let err = store
            .insert_batch(batch.clone(), items.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));

        let listed = store.list_items(&batch.batch_id, None).await.unwrap();
        assert_eq!(listed.len(), 2);
    }

    #[tokio::test]
    async fn test_oldest_pending_is_fifo() {
        let store = MemoryStateStore::new();
        let (batch, items) = seed(&store, 3).await;

        let first = store
            .oldest_pending(&batch.batch_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.item_id, items[0].item_id);

        // Requeue the head with a fresh timestamp: it moves to the tail.
        let now = Utc::now() + Duration::seconds(1);
        let claim = plan(
            &first,
            ItemEvent::Claim {
                worker_id: "w1".into(),
            },
            now,
        );
        store
            .update_item_if(&batch.batch_id, &first.item_id, claim.guard, claim.patch)
            .await
            .unwrap();
        let running = store
            .get_item(&batch.batch_id, &first.item_id)
            .await
            .unwrap()
            .unwrap();
        let requeue = plan(
            &running,
            ItemEvent::AnalysisFailed {
                worker_id: "w1".into(),
                error: cvsift_core::ItemFailure::new("rate_limited", "429"),
                transient: true,
            },
            now + Duration::seconds(1),
        );
        store
            .update_item_if(&batch.batch_id, &first.item_id, requeue.guard, requeue.patch)
            .await
            .unwrap();

        let next = store
            .oldest_pending(&batch.batch_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.item_id, items[1].item_id);
    }

    #[tokio::test]
    async fn test_conditional_write_single_winner() {
        let store = MemoryStateStore::new();
        let (batch, items) = seed(&store, 1).await;
        let target = &items[0];
        let now = Utc::now();

        let w1 = plan(
            target,
            ItemEvent::Claim {
                worker_id: "w1".into(),
            },
            now,
        );
        let w2 = plan(
            target,
            ItemEvent::Claim {
                worker_id: "w2".into(),
            },
            now,
        );

        let first = store
            .update_item_if(&batch.batch_id, &target.item_id, w1.guard, w1.patch)
            .await
            .unwrap();
        assert!(matches!(first, UpdateOutcome::Applied(_)));

        let second = store
            .update_item_if(&batch.batch_id, &target.item_id, w2.guard, w2.patch)
            .await
            .unwrap();
        assert!(matches!(second, UpdateOutcome::Conflict));

        let live = store
            .get_item(&batch.batch_id, &target.item_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(live.worker_id.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn test_expired_running_honors_cutoff() {
        let store = MemoryStateStore::new();
        let (batch, items) = seed(&store, 2).await;
        let long_ago = Utc::now() - Duration::seconds(600);

        let stale = plan(
            &items[0],
            ItemEvent::Claim {
                worker_id: "w1".into(),
            },
            long_ago,
        );
        store
            .update_item_if(&batch.batch_id, &items[0].item_id, stale.guard, stale.patch)
            .await
            .unwrap();
        let fresh = plan(
            &items[1],
            ItemEvent::Claim {
                worker_id: "w2".into(),
            },
            Utc::now(),
        );
        store
            .update_item_if(&batch.batch_id, &items[1].item_id, fresh.guard, fresh.patch)
            .await
            .unwrap();

        let cutoff = Utc::now() - Duration::seconds(90);
        let expired = store.expired_running(cutoff).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].item_id, items[0].item_id);
    }

    #[tokio::test]
    async fn test_batch_flip_is_exactly_once() {
        let store = MemoryStateStore::new();
        let (batch, _) = seed(&store, 1).await;
        let now = Utc::now();

        let first = store
            .update_batch_if(&batch.batch_id, BatchStatus::Running, BatchStatus::Complete, now)
            .await
            .unwrap();
        assert!(matches!(first, UpdateOutcome::Applied(_)));

        let second = store
            .update_batch_if(&batch.batch_id, BatchStatus::Running, BatchStatus::Complete, now)
            .await
            .unwrap();
        assert!(matches!(second, UpdateOutcome::Conflict));
    }

    #[tokio::test]
    async fn test_cancel_sweep_moves_pending_only() {
        let store = MemoryStateStore::new();
        let (batch, items) = seed(&store, 3).await;
        let now = Utc::now();

        // One item mid-flight: the sweep must not touch it.
        let claim = plan(
            &items[0],
            ItemEvent::Claim {
                worker_id: "w1".into(),
            },
            now,
        );
        store
            .update_item_if(&batch.batch_id, &items[0].item_id, claim.guard, claim.patch)
            .await
            .unwrap();

        let swept = store.cancel_sweep(&batch.batch_id, now).await.unwrap();
        assert_eq!(swept, CancelSweep::Cancelled { swept: 2 });

        let live = store.get_batch(&batch.batch_id).await.unwrap().unwrap();
        assert_eq!(live.status, BatchStatus::Cancelled);
        assert_eq!(live.cancelled_count, 2);

        let running = store
            .get_item(&batch.batch_id, &items[0].item_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(running.status, ItemStatus::Running);

        // Second cancel is a no-op with identical counters.
        let again = store.cancel_sweep(&batch.batch_id, now).await.unwrap();
        assert_eq!(again, CancelSweep::NotApplicable(BatchStatus::Cancelled));
        let after = store.get_batch(&batch.batch_id).await.unwrap().unwrap();
        assert_eq!(after.cancelled_count, 2);
    }

    #[tokio::test]
    async fn test_counters_accumulate() {
        let store = MemoryStateStore::new();
        let (batch, _) = seed(&store, 2).await;
        let now = Utc::now();

        store
            .add_to_counter(&batch.batch_id, BatchCounter::Completed, 1, now)
            .await
            .unwrap();
        let updated = store
            .add_to_counter(&batch.batch_id, BatchCounter::Completed, 1, now)
            .await
            .unwrap();
        assert_eq!(updated.completed, 2);
        assert!(updated.is_settled());
    }

    #[tokio::test]
    async fn test_delete_batch_is_idempotent() {
        let store = MemoryStateStore::new();
        let (batch, _) = seed(&store, 1).await;

        store.delete_batch(&batch.batch_id).await.unwrap();
        assert!(store.get_batch(&batch.batch_id).await.unwrap().is_none());
        store.delete_batch(&batch.batch_id).await.unwrap();
    }
}
