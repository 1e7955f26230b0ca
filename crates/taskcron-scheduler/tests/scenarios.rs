// End-to-end scheduling scenarios: registry + store + engine wired together
// the way the gateway does it, with a manual clock and sequential ids.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use taskcron_scheduler::{
    ArtifactRef, EngineConfig, ExecutionSink, FailureReason, ManualClock, PutMode, RunOutcome,
    RunRecord, SchedulerError, SchedulerLoop, SequentialIds, SqliteTaskStore, Task, TaskFilter,
    TaskPage, TaskRegistry, TaskStatus, TaskStore,
};

fn at(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .expect("bad timestamp")
        .with_timezone(&Utc)
}

fn engine_config() -> EngineConfig {
    EngineConfig {
        worker_count: 2,
        dispatch_timeout: Duration::from_millis(100),
        page_size: 10,
    }
}

/// Succeeds, optionally sleeping past the dispatch timeout on the first call.
struct MarkerSink {
    calls: AtomicUsize,
    stall_first: bool,
}

impl MarkerSink {
    fn new(stall_first: bool) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            stall_first,
        }
    }
}

#[async_trait]
impl ExecutionSink for MarkerSink {
    async fn execute(&self, task: &Task) -> Result<Option<ArtifactRef>, String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.stall_first && n == 0 {
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
        Ok(Some(format!("task_{}_{}.txt", task.id, task.next_due_at.timestamp())))
    }
}

/// Delegates to SQLite but fails the first `finish_occurrence`, as if the
/// process died between a successful execution and the store update.
struct CrashOnceStore {
    inner: SqliteTaskStore,
    crashed: AtomicBool,
}

impl TaskStore for CrashOnceStore {
    fn put(&self, task: &Task, mode: PutMode) -> taskcron_scheduler::Result<()> {
        self.inner.put(task, mode)
    }
    fn get(&self, id: &str) -> taskcron_scheduler::Result<Task> {
        self.inner.get(id)
    }
    fn list_page(
        &self,
        filter: TaskFilter,
        after: Option<i64>,
        limit: usize,
    ) -> taskcron_scheduler::Result<TaskPage> {
        self.inner.list_page(filter, after, limit)
    }
    fn modify(
        &self,
        id: &str,
        f: &mut dyn FnMut(&mut Task) -> taskcron_scheduler::Result<()>,
    ) -> taskcron_scheduler::Result<Task> {
        self.inner.modify(id, f)
    }
    fn append_run(&self, record: &RunRecord) -> taskcron_scheduler::Result<()> {
        self.inner.append_run(record)
    }
    fn finish_occurrence(
        &self,
        record: &RunRecord,
        next_due_at: DateTime<Utc>,
    ) -> taskcron_scheduler::Result<()> {
        if !self.crashed.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::Storage("disk I/O error".to_string()));
        }
        self.inner.finish_occurrence(record, next_due_at)
    }
    fn count_failures(
        &self,
        task_id: &str,
        scheduled_for: DateTime<Utc>,
    ) -> taskcron_scheduler::Result<u32> {
        self.inner.count_failures(task_id, scheduled_for)
    }
    fn list_runs(&self, task_id: &str) -> taskcron_scheduler::Result<Vec<RunRecord>> {
        self.inner.list_runs(task_id)
    }
}

fn successes_for(runs: &[RunRecord], scheduled_for: DateTime<Utc>) -> usize {
    runs.iter()
        .filter(|r| r.scheduled_for == scheduled_for && r.outcome.is_success())
        .count()
}

#[tokio::test]
async fn daily_backup_runs_once_and_advances() {
    let store = Arc::new(SqliteTaskStore::open_in_memory().expect("open"));
    let clock = Arc::new(ManualClock::new(at("2024-01-01T10:00:00Z")));
    let registry = TaskRegistry::new(
        store.clone(),
        clock.clone(),
        Arc::new(SequentialIds::new("task")),
        10,
    );
    let task = registry
        .create("daily-backup", "0 3 * * *")
        .expect("create");
    assert_eq!(task.next_due_at, at("2024-01-02T03:00:00Z"));

    let sink = Arc::new(MarkerSink::new(false));
    let engine = SchedulerLoop::new(store.clone(), sink.clone(), clock.clone(), engine_config());

    let report = engine.tick(at("2024-01-02T03:00:00Z")).await.expect("tick");
    engine.wait_idle().await;
    assert_eq!(report.dispatched, vec![task.id.clone()]);

    let runs = registry.runs(&task.id).expect("runs");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].scheduled_for, at("2024-01-02T03:00:00Z"));
    assert!(runs[0].outcome.is_success());

    let stored = registry.get(&task.id).expect("get");
    assert_eq!(stored.next_due_at, at("2024-01-03T03:00:00Z"));
    assert_eq!(stored.last_run_at, Some(at("2024-01-02T03:00:00Z")));
}

#[tokio::test]
async fn timeout_then_retry_records_one_failure_then_one_success() {
    let store = Arc::new(SqliteTaskStore::open_in_memory().expect("open"));
    let clock = Arc::new(ManualClock::new(at("2024-01-01T10:00:00Z")));
    let registry = TaskRegistry::new(
        store.clone(),
        clock.clone(),
        Arc::new(SequentialIds::new("task")),
        10,
    );
    let task = registry
        .create("daily-backup", "0 3 * * *")
        .expect("create");

    let sink = Arc::new(MarkerSink::new(true));
    let engine = SchedulerLoop::new(store.clone(), sink.clone(), clock.clone(), engine_config());

    engine.tick(at("2024-01-02T03:00:00Z")).await.expect("tick");
    engine.wait_idle().await;
    assert_eq!(
        registry.get(&task.id).expect("get").next_due_at,
        at("2024-01-02T03:00:00Z")
    );

    engine.tick(at("2024-01-02T03:01:00Z")).await.expect("tick");
    engine.wait_idle().await;

    let runs = registry.runs(&task.id).expect("runs");
    assert_eq!(runs.len(), 2);
    assert!(runs
        .iter()
        .all(|r| r.scheduled_for == at("2024-01-02T03:00:00Z")));
    assert_eq!(
        runs[0].outcome,
        RunOutcome::Failure {
            reason: FailureReason::Timeout,
            missed: false
        }
    );
    assert!(runs[1].outcome.is_success());
    assert_eq!(
        registry.get(&task.id).expect("get").next_due_at,
        at("2024-01-03T03:00:00Z")
    );
}

#[tokio::test]
async fn crash_before_store_update_replays_without_duplicate_success() {
    let store = Arc::new(CrashOnceStore {
        inner: SqliteTaskStore::open_in_memory().expect("open"),
        crashed: AtomicBool::new(false),
    });
    let clock = Arc::new(ManualClock::new(at("2024-01-01T10:00:00Z")));
    let registry = TaskRegistry::new(
        store.clone(),
        clock.clone(),
        Arc::new(SequentialIds::new("task")),
        10,
    );
    let task = registry
        .create("daily-backup", "0 3 * * *")
        .expect("create");
    let occurrence = at("2024-01-02T03:00:00Z");

    let sink = Arc::new(MarkerSink::new(false));
    let engine = SchedulerLoop::new(store.clone(), sink.clone(), clock.clone(), engine_config());

    // Executes, then the store update fails: nothing recorded, not advanced.
    engine.tick(occurrence).await.expect("tick");
    engine.wait_idle().await;
    assert!(registry.runs(&task.id).expect("runs").is_empty());
    assert_eq!(registry.get(&task.id).expect("get").next_due_at, occurrence);

    // Replay after "restart": same occurrence is retried and finished once.
    let restarted =
        SchedulerLoop::new(store.clone(), sink.clone(), clock.clone(), engine_config());
    restarted.tick(at("2024-01-02T03:00:30Z")).await.expect("tick");
    restarted.wait_idle().await;
    restarted.tick(at("2024-01-02T03:00:45Z")).await.expect("tick");
    restarted.wait_idle().await;

    let runs = registry.runs(&task.id).expect("runs");
    assert_eq!(successes_for(&runs, occurrence), 1);
    assert_eq!(runs.len(), 1);
    assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
    assert_eq!(
        registry.get(&task.id).expect("get").next_due_at,
        at("2024-01-03T03:00:00Z")
    );

    // Replaying the already-finished write is rejected outright.
    let err = store
        .finish_occurrence(&runs[0], at("2024-01-03T03:00:00Z"))
        .unwrap_err();
    assert_eq!(err.kind(), "ConflictError");
    assert_eq!(
        successes_for(&registry.runs(&task.id).expect("runs"), occurrence),
        1
    );
}

#[tokio::test]
async fn listing_after_logical_delete() {
    let store = Arc::new(SqliteTaskStore::open_in_memory().expect("open"));
    let clock = Arc::new(ManualClock::new(at("2024-01-01T10:00:00Z")));
    let registry = TaskRegistry::new(
        store.clone(),
        clock.clone(),
        Arc::new(SequentialIds::new("task")),
        1,
    );
    let ids: Vec<String> = ["alpha", "beta", "gamma"]
        .iter()
        .map(|name| registry.create(name, "0 * * * *").expect("create").id)
        .collect();
    registry.delete(&ids[1]).expect("delete");
    registry.delete(&ids[1]).expect("delete is idempotent");

    let active: Vec<Task> = registry
        .list(TaskFilter::with_status(TaskStatus::Active))
        .collect::<Result<_, _>>()
        .expect("list");
    assert_eq!(
        active.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
        vec!["alpha", "gamma"]
    );

    let all: Vec<Task> = registry
        .list(TaskFilter::all())
        .collect::<Result<_, _>>()
        .expect("list");
    assert_eq!(all.len(), 3);
    assert_eq!(all[1].status, TaskStatus::Deleted);
}
