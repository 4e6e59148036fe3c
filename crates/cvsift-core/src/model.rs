// Batch and item records as persisted by the state store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Generate an opaque identifier (hyphen-free UUID v4).
pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Running,
    Paused,
    Cancelled,
    Complete,
}

impl BatchStatus {
    /// Terminal statuses admit no further control transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Cancelled | BatchStatus::Complete)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Running => "running",
            BatchStatus::Paused => "paused",
            BatchStatus::Cancelled => "cancelled",
            BatchStatus::Complete => "complete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    Running,
    Complete,
    Failed,
    Cancelled,
}

impl ItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemStatus::Complete | ItemStatus::Failed | ItemStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Running => "running",
            ItemStatus::Complete => "complete",
            ItemStatus::Failed => "failed",
            ItemStatus::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for ItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(ItemStatus::Pending),
            "running" => Ok(ItemStatus::Running),
            "complete" => Ok(ItemStatus::Complete),
            "failed" => Ok(ItemStatus::Failed),
            "cancelled" => Ok(ItemStatus::Cancelled),
            other => Err(format!("unknown item status: {}", other)),
        }
    }
}

/// Recorded failure detail: a short machine code plus a human message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub code: String,
    pub message: String,
}

impl ItemFailure {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Failure recorded when a worker's lease expires without a terminal write.
    pub fn timeout(lease_seconds: u64) -> Self {
        Self::new(
            "timeout",
            format!("lease expired after {}s without a terminal write", lease_seconds),
        )
    }
}

/// Monotonic batch counters updated via atomic field-increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchCounter {
    Completed,
    Failed,
    CancelledCount,
    SkippedDuplicates,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRecord {
    pub batch_id: String,
    pub owner_id: String,
    pub status: BatchStatus,
    pub job_description: String,
    /// Item slots accepted at creation; excludes intra-batch duplicates.
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled_count: u64,
    pub skipped_duplicates: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BatchRecord {
    pub fn new(
        owner_id: impl Into<String>,
        job_description: impl Into<String>,
        total: u64,
        skipped_duplicates: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            batch_id: new_id(),
            owner_id: owner_id.into(),
            status: BatchStatus::Running,
            job_description: job_description.into(),
            total,
            completed: 0,
            failed: 0,
            cancelled_count: 0,
            skipped_duplicates,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sum of all settled item slots. Meets `total` exactly at batch closure.
    /// `skipped_duplicates` does not contribute: duplicates are dropped at
    /// creation and never occupy a slot counted in `total`.
    pub fn settled(&self) -> u64 {
        self.completed + self.failed + self.cancelled_count
    }

    pub fn is_settled(&self) -> bool {
        self.settled() == self.total
    }

    /// Counter accounting broke: more settled slots than accepted slots.
    pub fn counters_overflowed(&self) -> bool {
        self.settled() > self.total
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemRecord {
    pub item_id: String,
    pub batch_id: String,
    pub file_ref: String,
    pub file_hash: String,
    pub status: ItemStatus,
    pub worker_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    /// FIFO ordering key for claims; refreshed on every transition.
    pub last_updated_at: DateTime<Utc>,
    /// Failed attempts so far; an item gets `max_retries + 1` attempts total.
    pub retry_count: u32,
    pub max_retries: u32,
    pub result: Option<serde_json::Value>,
    pub error: Option<ItemFailure>,
}

impl ItemRecord {
    pub fn new(
        batch_id: impl Into<String>,
        file_ref: impl Into<String>,
        file_hash: impl Into<String>,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            item_id: new_id(),
            batch_id: batch_id.into(),
            file_ref: file_ref.into(),
            file_hash: file_hash.into(),
            status: ItemStatus::Pending,
            worker_id: None,
            start_time: None,
            last_updated_at: now,
            retry_count: 0,
            max_retries,
            result: None,
            error: None,
        }
    }
}
