// End-to-end engine scenarios on in-memory gateways with scripted analyzers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use cvsift_config::EngineConfig;
use cvsift_core::{BatchRecord, BatchStatus, ItemRecord, ItemStatus};
use cvsift_engine::{Analyzer, AnalyzerError, ControlAction, ControlOutcome, Engine, SourceFile};
use cvsift_store::{MemoryStateStore, ObjectStore, StateStore};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::Semaphore;

/// Analyzer returning scripted outcomes per filename, then defaulting to ok.
#[derive(Default)]
struct ScriptedAnalyzer {
    scripts: Mutex<HashMap<String, Vec<Result<serde_json::Value, AnalyzerError>>>>,
}

impl ScriptedAnalyzer {
    fn script(
        &self,
        filename: &str,
        outcomes: Vec<Result<serde_json::Value, AnalyzerError>>,
    ) {
        self.scripts.lock().insert(filename.to_string(), outcomes);
    }
}

#[async_trait]
impl Analyzer for ScriptedAnalyzer {
    async fn analyze(
        &self,
        file_ref: &str,
        _job_description: &str,
    ) -> Result<serde_json::Value, AnalyzerError> {
        let filename = file_ref.rsplit('/').next().unwrap_or(file_ref);
        let mut scripts = self.scripts.lock();
        if let Some(queue) = scripts.get_mut(filename) {
            if !queue.is_empty() {
                return queue.remove(0);
            }
        }
        Ok(json!({"score": 90, "fit": "strong"}))
    }
}

/// Analyzer whose first call blocks until released; later calls pass through.
struct GatedAnalyzer {
    started: Semaphore,
    release: Semaphore,
    first_call_taken: AtomicBool,
}

impl GatedAnalyzer {
    fn new() -> Self {
        Self {
            started: Semaphore::new(0),
            release: Semaphore::new(0),
            first_call_taken: AtomicBool::new(false),
        }
    }

    async fn wait_for_start(&self) {
        self.started.acquire().await.unwrap().forget();
    }

    fn release_first_call(&self) {
        self.release.add_permits(1);
    }
}

#[async_trait]
impl Analyzer for GatedAnalyzer {
    async fn analyze(
        &self,
        _file_ref: &str,
        _job_description: &str,
    ) -> Result<serde_json::Value, AnalyzerError> {
        if !self.first_call_taken.swap(true, Ordering::SeqCst) {
            self.started.add_permits(1);
            self.release.acquire().await.unwrap().forget();
        }
        Ok(json!({"score": 71}))
    }
}

fn fast_config() -> EngineConfig {
    EngineConfig {
        worker_backoff_base_ms: 1,
        worker_backoff_max_ms: 4,
        ..EngineConfig::default()
    }
}

fn engine_with(analyzer: Arc<dyn Analyzer>, config: EngineConfig) -> (Engine, Arc<MemoryStateStore>) {
    let state = Arc::new(MemoryStateStore::new());
    let engine = Engine::new(
        state.clone(),
        ObjectStore::new_memory().unwrap(),
        analyzer,
        config,
    );
    (engine, state)
}

fn file(name: &str, bytes: &[u8]) -> SourceFile {
    SourceFile {
        filename: name.to_string(),
        bytes: bytes.to_vec(),
    }
}

async fn wait_for_batch<F>(state: &MemoryStateStore, batch_id: &str, pred: F) -> BatchRecord
where
    F: Fn(&BatchRecord) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(batch) = state.get_batch(batch_id).await.unwrap() {
                if pred(&batch) {
                    return batch;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached within 10s")
}

async fn wait_for_item<F>(state: &MemoryStateStore, batch_id: &str, pred: F) -> ItemRecord
where
    F: Fn(&ItemRecord) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            for item in state.list_items(batch_id, None).await.unwrap() {
                if pred(&item) {
                    return item;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached within 10s")
}

#[tokio::test]
async fn happy_path_three_distinct_files() {
    let analyzer = Arc::new(ScriptedAnalyzer::default());
    let (engine, state) = engine_with(analyzer, fast_config());

    let receipt = engine
        .create_batch(
            "owner-1",
            "senior backend engineer, rust preferred",
            vec![file("a.pdf", b"alpha"), file("b.pdf", b"bravo"), file("c.pdf", b"charlie")],
        )
        .await
        .unwrap();
    assert_eq!(receipt.total, 3);
    assert_eq!(receipt.skipped_duplicates, 0);

    let done = wait_for_batch(&state, &receipt.batch_id, |b| {
        b.status == BatchStatus::Complete
    })
    .await;
    assert_eq!(done.total, 3);
    assert_eq!(done.completed, 3);
    assert_eq!(done.failed, 0);
    assert_eq!(done.cancelled_count, 0);
    assert_eq!(done.skipped_duplicates, 0);

    let items = state.list_items(&receipt.batch_id, None).await.unwrap();
    assert_eq!(items.len(), 3);
    for item in items {
        assert_eq!(item.status, ItemStatus::Complete);
        assert_eq!(item.retry_count, 0);
        assert!(item.result.is_some());
        assert!(item.error.is_none());
        assert!(item.worker_id.is_none());
        assert!(item.start_time.is_none());
    }
}

#[tokio::test]
async fn duplicate_suppression() {
    let analyzer = Arc::new(ScriptedAnalyzer::default());
    let (engine, state) = engine_with(analyzer, fast_config());

    let receipt = engine
        .create_batch(
            "owner-1",
            "data analyst",
            vec![file("a.pdf", b"same"), file("a-again.pdf", b"same"), file("b.pdf", b"other")],
        )
        .await
        .unwrap();
    assert_eq!(receipt.total, 2);
    assert_eq!(receipt.skipped_duplicates, 1);

    let done = wait_for_batch(&state, &receipt.batch_id, |b| {
        b.status == BatchStatus::Complete
    })
    .await;
    assert_eq!(done.completed, 2);
    assert_eq!(done.skipped_duplicates, 1);
}

#[tokio::test]
async fn transient_retries_then_success() {
    let analyzer = Arc::new(ScriptedAnalyzer::default());
    analyzer.script(
        "a.pdf",
        vec![
            Err(AnalyzerError::transient("rate_limited", "429 from upstream")),
            Err(AnalyzerError::transient("overloaded", "503 from upstream")),
            Ok(json!({"score": 55})),
        ],
    );
    let (engine, state) = engine_with(analyzer, fast_config());

    let receipt = engine
        .create_batch("owner-1", "ml engineer", vec![file("a.pdf", b"alpha")])
        .await
        .unwrap();

    let done = wait_for_batch(&state, &receipt.batch_id, |b| {
        b.status == BatchStatus::Complete
    })
    .await;
    assert_eq!(done.completed, 1);
    assert_eq!(done.failed, 0);

    let item = &state.list_items(&receipt.batch_id, None).await.unwrap()[0];
    assert_eq!(item.status, ItemStatus::Complete);
    assert_eq!(item.retry_count, 2);
    assert_eq!(item.result, Some(json!({"score": 55})));
}

#[tokio::test]
async fn permanent_failure_settles_the_batch() {
    let analyzer = Arc::new(ScriptedAnalyzer::default());
    analyzer.script(
        "bad.pdf",
        vec![Err(AnalyzerError::permanent(
            "unparseable_document",
            "no text layer found",
        ))],
    );
    let (engine, state) = engine_with(analyzer, fast_config());

    let receipt = engine
        .create_batch("owner-1", "ml engineer", vec![file("bad.pdf", b"binary junk")])
        .await
        .unwrap();

    let done = wait_for_batch(&state, &receipt.batch_id, |b| {
        b.status == BatchStatus::Complete
    })
    .await;
    assert_eq!(done.failed, 1);
    assert_eq!(done.completed, 0);

    let item = &state.list_items(&receipt.batch_id, None).await.unwrap()[0];
    assert_eq!(item.status, ItemStatus::Failed);
    assert_eq!(item.retry_count, 0);
    let error = item.error.as_ref().unwrap();
    assert_eq!(error.code, "unparseable_document");
    assert!(item.result.is_none());
}

#[tokio::test]
async fn max_retries_zero_fails_on_first_transient() {
    let analyzer = Arc::new(ScriptedAnalyzer::default());
    analyzer.script(
        "a.pdf",
        vec![Err(AnalyzerError::transient("rate_limited", "429"))],
    );
    let config = EngineConfig {
        max_retries: 0,
        ..fast_config()
    };
    let (engine, state) = engine_with(analyzer, config);

    let receipt = engine
        .create_batch("owner-1", "ml engineer", vec![file("a.pdf", b"alpha")])
        .await
        .unwrap();

    let done = wait_for_batch(&state, &receipt.batch_id, |b| {
        b.status == BatchStatus::Complete
    })
    .await;
    assert_eq!(done.failed, 1);

    let item = &state.list_items(&receipt.batch_id, None).await.unwrap()[0];
    assert_eq!(item.status, ItemStatus::Failed);
    assert_eq!(item.retry_count, 0);
    assert_eq!(item.error.as_ref().unwrap().code, "rate_limited");
}

#[tokio::test]
async fn worker_death_recovered_by_watchdog() {
    let analyzer = Arc::new(GatedAnalyzer::new());
    let config = EngineConfig {
        // Leases expire immediately so the sweep can run without waiting.
        lease_seconds: 0,
        ..fast_config()
    };
    let (engine, state) = engine_with(analyzer.clone(), config);

    let receipt = engine
        .create_batch("owner-1", "platform engineer", vec![file("x.pdf", b"xray")])
        .await
        .unwrap();

    // First attempt claims the item and hangs inside the analyzer.
    analyzer.wait_for_start().await;
    let stuck = wait_for_item(&state, &receipt.batch_id, |i| {
        i.status == ItemStatus::Running
    })
    .await;
    let stale_worker = stuck.worker_id.clone().unwrap();

    // The watchdog reclaims the lease and requeues the item at the tail.
    let report = engine.sweep_expired().await.unwrap();
    assert_eq!(report.requeued, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(report.requeued_batches, vec![receipt.batch_id.clone()]);

    let recovered = wait_for_item(&state, &receipt.batch_id, |i| {
        i.status == ItemStatus::Pending
    })
    .await;
    assert_eq!(recovered.retry_count, 1);
    assert_eq!(recovered.error.as_ref().unwrap().code, "timeout");

    // A fresh worker picks it up and completes it.
    engine.run_worker(&receipt.batch_id).await.unwrap();
    let done = wait_for_batch(&state, &receipt.batch_id, |b| {
        b.status == BatchStatus::Complete
    })
    .await;
    assert_eq!(done.completed, 1);

    let item = &state.list_items(&receipt.batch_id, None).await.unwrap()[0];
    assert_eq!(item.status, ItemStatus::Complete);
    assert_eq!(item.retry_count, 1);
    assert_ne!(item.worker_id.as_deref(), Some(stale_worker.as_str()));

    // Release the stuck first attempt: its terminal write is fenced by the
    // fresh lease having come and gone, and nothing changes.
    analyzer.release_first_call();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let after = state.get_batch(&receipt.batch_id).await.unwrap().unwrap();
    assert_eq!(after.completed, 1);
    assert_eq!(after.status, BatchStatus::Complete);
}

#[tokio::test]
async fn cancel_mid_flight_lets_the_running_item_finish() {
    let analyzer = Arc::new(GatedAnalyzer::new());
    let (engine, state) = engine_with(analyzer.clone(), fast_config());

    let receipt = engine
        .create_batch(
            "owner-1",
            "engineering manager",
            vec![file("x.pdf", b"xray"), file("y.pdf", b"yankee"), file("z.pdf", b"zulu")],
        )
        .await
        .unwrap();

    // X is mid-analysis; Y and Z still pending.
    analyzer.wait_for_start().await;
    wait_for_item(&state, &receipt.batch_id, |i| i.status == ItemStatus::Running).await;

    let outcome = engine
        .control_batch("owner-1", &receipt.batch_id, ControlAction::Cancel)
        .await
        .unwrap();
    assert_eq!(outcome, ControlOutcome::Applied);

    let cancelled = state.get_batch(&receipt.batch_id).await.unwrap().unwrap();
    assert_eq!(cancelled.status, BatchStatus::Cancelled);
    assert_eq!(cancelled.cancelled_count, 2);

    // The in-flight item is not interrupted; its predicated write still
    // lands after the cancel, and the worker claims nothing further.
    analyzer.release_first_call();
    let x = wait_for_item(&state, &receipt.batch_id, |i| {
        i.status == ItemStatus::Complete
    })
    .await;
    assert!(x.result.is_some());

    let settled = wait_for_batch(&state, &receipt.batch_id, |b| b.completed == 1).await;
    assert_eq!(settled.status, BatchStatus::Cancelled);
    assert_eq!(settled.completed + settled.cancelled_count, settled.total);

    // The watchdog's completion re-check must not overwrite `cancelled`.
    engine.sweep_expired().await.unwrap();
    engine.recompute_completion(&receipt.batch_id).await.unwrap();
    let still = state.get_batch(&receipt.batch_id).await.unwrap().unwrap();
    assert_eq!(still.status, BatchStatus::Cancelled);
}

#[tokio::test]
async fn watchdog_is_a_noop_on_steady_state() {
    let analyzer = Arc::new(ScriptedAnalyzer::default());
    let (engine, state) = engine_with(analyzer, fast_config());

    let receipt = engine
        .create_batch("owner-1", "site reliability engineer", vec![file("a.pdf", b"alpha")])
        .await
        .unwrap();
    let done = wait_for_batch(&state, &receipt.batch_id, |b| {
        b.status == BatchStatus::Complete
    })
    .await;

    // Replaying the sweep on settled state changes nothing, however often.
    for _ in 0..3 {
        let report = engine.sweep_expired().await.unwrap();
        assert_eq!(report.requeued, 0);
        assert_eq!(report.failed, 0);
    }
    let after = state.get_batch(&receipt.batch_id).await.unwrap().unwrap();
    assert_eq!(after.completed, done.completed);
    assert_eq!(after.status, BatchStatus::Complete);
}

#[tokio::test]
async fn late_terminal_write_beats_the_watchdog() {
    // The worker finishes exactly as the lease expires: its predicated write
    // wins, and the sweep sees nothing running.
    let analyzer = Arc::new(ScriptedAnalyzer::default());
    let config = EngineConfig {
        lease_seconds: 0,
        ..fast_config()
    };
    let (engine, state) = engine_with(analyzer, config);

    let now = Utc::now();
    let batch = BatchRecord::new("owner-1", "qa engineer", 1, 0, now);
    let batch_id = batch.batch_id.clone();
    let item = ItemRecord::new(&batch_id, format!("{}/i1/a.pdf", batch_id), "h1", 3, now);
    let item_id = item.item_id.clone();
    state.insert_batch(batch, vec![item]).await.unwrap();

    let claimed = engine.claim(&batch_id, "w1").await.unwrap().unwrap();
    assert_eq!(claimed.item_id, item_id);

    // Worker's terminal write lands first.
    let transition = cvsift_core::plan(
        &claimed,
        cvsift_core::ItemEvent::AnalysisSucceeded {
            worker_id: "w1".into(),
            result: json!({"score": 12}),
        },
        Utc::now(),
    );
    state
        .update_item_if(&batch_id, &item_id, transition.guard, transition.patch)
        .await
        .unwrap();

    // The expired-lease sweep finds no running item to touch.
    let report = engine.sweep_expired().await.unwrap();
    assert_eq!(report.requeued + report.failed + report.untouched, 0);

    let item = state.get_item(&batch_id, &item_id).await.unwrap().unwrap();
    assert_eq!(item.status, ItemStatus::Complete);
}

#[tokio::test]
async fn lease_expiry_at_retry_ceiling_fails_the_item() {
    let analyzer = Arc::new(GatedAnalyzer::new());
    let config = EngineConfig {
        lease_seconds: 0,
        max_retries: 0,
        ..fast_config()
    };
    let (engine, state) = engine_with(analyzer.clone(), config);

    let receipt = engine
        .create_batch("owner-1", "devops engineer", vec![file("x.pdf", b"xray")])
        .await
        .unwrap();
    analyzer.wait_for_start().await;
    wait_for_item(&state, &receipt.batch_id, |i| i.status == ItemStatus::Running).await;

    let report = engine.sweep_expired().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.requeued, 0);

    let done = wait_for_batch(&state, &receipt.batch_id, |b| {
        b.status == BatchStatus::Complete
    })
    .await;
    assert_eq!(done.failed, 1);

    let item = &state.list_items(&receipt.batch_id, None).await.unwrap()[0];
    assert_eq!(item.status, ItemStatus::Failed);
    assert_eq!(item.error.as_ref().unwrap().code, "timeout");
}

#[tokio::test]
async fn respawn_picks_up_running_batches() {
    // A batch left running by a previous process gets a worker again.
    let analyzer = Arc::new(ScriptedAnalyzer::default());
    let (engine, state) = engine_with(analyzer, fast_config());

    let now = Utc::now();
    let batch = BatchRecord::new("owner-1", "recruiter ops", 1, 0, now);
    let batch_id = batch.batch_id.clone();
    let item = ItemRecord::new(&batch_id, format!("{}/i1/a.pdf", batch_id), "h1", 3, now);
    state.insert_batch(batch, vec![item]).await.unwrap();

    let respawned = engine.respawn_workers().await.unwrap();
    assert_eq!(respawned, 1);

    let done = wait_for_batch(&state, &batch_id, |b| b.status == BatchStatus::Complete).await;
    assert_eq!(done.completed, 1);
}
