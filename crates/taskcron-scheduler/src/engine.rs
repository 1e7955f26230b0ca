use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use taskcron_core::config::SchedulerConfig;
use tokio::sync::{watch, Semaphore};
use tokio::time::MissedTickBehavior;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::{
    clock::Clock,
    error::{Result, SchedulerError},
    sink::{ArtifactRef, ExecutionSink},
    store::{TaskIter, TaskStore},
    types::{FailureReason, RunOutcome, RunRecord, Task, TaskFilter, TaskStatus},
};

/// Failed attempts allowed per occurrence before the next one abandons it.
pub const MAX_RETRIES_PER_OCCURRENCE: u32 = 1;

/// Where a tick currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickPhase {
    Idle,
    Collecting,
    Dispatching,
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Active tasks that were due at the tick's `now`.
    pub due: usize,
    /// Task ids handed to a dispatch worker.
    pub dispatched: Vec<String>,
    /// Due task ids skipped because an earlier dispatch is still running.
    pub skipped_in_flight: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub worker_count: usize,
    pub dispatch_timeout: Duration,
    pub page_size: usize,
}

impl From<&SchedulerConfig> for EngineConfig {
    fn from(c: &SchedulerConfig) -> Self {
        Self {
            worker_count: c.worker_count,
            dispatch_timeout: Duration::from_secs(c.dispatch_timeout_secs),
            page_size: c.page_size,
        }
    }
}

/// State shared between the tick loop and its dispatch workers.
struct Shared {
    store: Arc<dyn TaskStore>,
    sink: Arc<dyn ExecutionSink>,
    clock: Arc<dyn Clock>,
    /// Task ids with a dispatch in progress in this process.
    in_flight: DashSet<String>,
    dispatch_timeout: Duration,
}

/// Removes a task id from the in-flight set when dropped, including when a
/// dispatch worker panics.
struct InFlightGuard {
    shared: Arc<Shared>,
    id: String,
}

impl InFlightGuard {
    fn acquire(shared: &Arc<Shared>, id: &str) -> Option<Self> {
        shared.in_flight.insert(id.to_string()).then(|| Self {
            shared: Arc::clone(shared),
            id: id.to_string(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.shared.in_flight.remove(&self.id);
    }
}

/// Tick-driven dispatcher: finds due tasks and runs each occurrence once.
///
/// `now` always comes from the caller (or the injected clock in [`run`]),
/// never from the system clock directly.
///
/// [`run`]: SchedulerLoop::run
pub struct SchedulerLoop {
    shared: Arc<Shared>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    /// Keeps ticks strictly sequential.
    tick_lock: tokio::sync::Mutex<()>,
    phase: Mutex<TickPhase>,
    page_size: usize,
}

impl SchedulerLoop {
    pub fn new(
        store: Arc<dyn TaskStore>,
        sink: Arc<dyn ExecutionSink>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                sink,
                clock,
                in_flight: DashSet::new(),
                dispatch_timeout: config.dispatch_timeout,
            }),
            permits: Arc::new(Semaphore::new(config.worker_count.max(1))),
            tracker: TaskTracker::new(),
            tick_lock: tokio::sync::Mutex::new(()),
            phase: Mutex::new(TickPhase::Idle),
            page_size: config.page_size.max(1),
        }
    }

    pub fn phase(&self) -> TickPhase {
        *self.phase.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Number of dispatches currently running.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.len()
    }

    /// Run one tick at `now`.
    ///
    /// Returns once every due task has been handed to a worker (waiting for
    /// a free worker when all are busy). Workers may still be running when
    /// this returns; see [`wait_idle`](Self::wait_idle).
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let _serial = self.tick_lock.lock().await;

        self.set_phase(TickPhase::Collecting);
        let due = match self.collect_due(now) {
            Ok(due) => due,
            Err(e) => {
                self.set_phase(TickPhase::Idle);
                return Err(e);
            }
        };

        self.set_phase(TickPhase::Dispatching);
        let mut report = TickReport {
            due: due.len(),
            ..TickReport::default()
        };
        for task in due {
            let Some(guard) = InFlightGuard::acquire(&self.shared, &task.id) else {
                debug!(task_id = %task.id, "dispatch still in flight, skipping");
                report.skipped_in_flight.push(task.id);
                continue;
            };
            let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
                // The semaphore is never closed.
                break;
            };

            report.dispatched.push(task.id.clone());
            let shared = Arc::clone(&self.shared);
            self.tracker.spawn(async move {
                let _permit = permit;
                let _guard = guard;
                shared.dispatch(task, now).await;
            });
        }
        self.set_phase(TickPhase::Idle);

        if !report.dispatched.is_empty() {
            debug!(%now, due = report.due, dispatched = report.dispatched.len(), "tick dispatched");
        }
        Ok(report)
    }

    /// Wait for every running dispatch to finish or time out.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Tick every `tick_every` until `shutdown` broadcasts `true`, then drain.
    pub async fn run(&self, tick_every: Duration, mut shutdown: watch::Receiver<bool>) {
        info!("scheduler loop started");

        let mut interval = tokio::time::interval(tick_every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = self.shared.clock.now();
                    if let Err(e) = self.tick(now).await {
                        error!("scheduler tick error: {e}");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("scheduler loop shutting down");
                        break;
                    }
                }
            }
        }

        let pending = self.in_flight();
        if pending > 0 {
            info!(pending, "waiting for in-flight dispatches");
        }
        self.tracker.close();
        self.tracker.wait().await;
        info!("scheduler loop stopped");
    }

    // --- private helpers ---------------------------------------------------

    fn set_phase(&self, phase: TickPhase) {
        *self.phase.lock().unwrap_or_else(|p| p.into_inner()) = phase;
    }

    /// Stream Active tasks and keep the ones due at `now`.
    fn collect_due(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        TaskIter::new(
            self.shared.store.as_ref(),
            TaskFilter::with_status(TaskStatus::Active),
            self.page_size,
        )
        .filter(|task| task.as_ref().map_or(true, |t| t.is_due(now)))
        .collect()
    }
}

impl Shared {
    /// Execute the pending occurrence of `snapshot` and record the outcome.
    ///
    /// The snapshot was read before the in-flight guard was taken, so the
    /// task is read again first: a dispatch that finished in between, or a
    /// pause or delete, means there is nothing left to do for it.
    ///
    /// Never fails: every problem is logged and recorded, and anything left
    /// unrecorded is picked up again by the next tick.
    async fn dispatch(&self, snapshot: Task, now: DateTime<Utc>) {
        let task = match self.store.get(&snapshot.id) {
            Ok(task) => task,
            Err(e) => {
                error!(task_id = %snapshot.id, "cannot reload task before dispatch: {e}");
                return;
            }
        };
        if task.status != TaskStatus::Active
            || task.next_due_at != snapshot.next_due_at
            || !task.is_due(now)
        {
            debug!(
                task_id = %task.id,
                status = %task.status,
                collected_for = %snapshot.next_due_at,
                next_due_at = %task.next_due_at,
                "task changed since collection, not dispatching"
            );
            return;
        }

        let scheduled_for = task.next_due_at;
        let prior_failures = match self.store.count_failures(&task.id, scheduled_for) {
            Ok(n) => n,
            Err(e) => {
                error!(task_id = %task.id, %scheduled_for, "cannot read run history: {e}");
                return;
            }
        };

        info!(task_id = %task.id, name = %task.name, %scheduled_for, attempt = prior_failures + 1, "dispatching task");
        let started_at = self.clock.now();
        let result = self.attempt(&task).await;
        let finished_at = self.clock.now();

        let mut record = RunRecord {
            task_id: task.id.clone(),
            scheduled_for,
            started_at,
            finished_at,
            outcome: RunOutcome::Success { artifact: None },
        };

        let reason = match result {
            Ok(artifact) => {
                record.outcome = RunOutcome::Success { artifact };
                self.finish(&task, &record);
                return;
            }
            Err(SchedulerError::Dispatch(reason)) => reason,
            Err(other) => FailureReason::Sink(other.to_string()),
        };

        let failures = prior_failures + 1;
        if failures > MAX_RETRIES_PER_OCCURRENCE {
            warn!(task_id = %task.id, %scheduled_for, %reason, failures, "retry failed, occurrence missed");
            record.outcome = RunOutcome::Failure {
                reason,
                missed: true,
            };
            self.finish(&task, &record);
        } else {
            warn!(task_id = %task.id, %scheduled_for, %reason, "dispatch failed, will retry next tick");
            record.outcome = RunOutcome::Failure {
                reason,
                missed: false,
            };
            if let Err(e) = self.store.append_run(&record) {
                error!(task_id = %task.id, %scheduled_for, "failed to record failed run: {e}");
            }
        }
    }

    /// One call into the sink, bounded by the dispatch timeout.
    async fn attempt(&self, task: &Task) -> Result<Option<ArtifactRef>> {
        match tokio::time::timeout(self.dispatch_timeout, self.sink.execute(task)).await {
            Ok(Ok(artifact)) => Ok(artifact),
            Ok(Err(msg)) => Err(SchedulerError::Dispatch(FailureReason::Sink(msg))),
            Err(_) => Err(SchedulerError::Dispatch(FailureReason::Timeout)),
        }
    }

    /// Record a terminal outcome and advance the task in one atomic write.
    fn finish(&self, task: &Task, record: &RunRecord) {
        let Some(next) = task.recurrence.next_due_after(record.scheduled_for) else {
            error!(task_id = %task.id, recurrence = %task.recurrence, "no occurrence after {}", record.scheduled_for);
            return;
        };

        match self.store.finish_occurrence(record, next) {
            Ok(()) => {
                info!(task_id = %task.id, scheduled_for = %record.scheduled_for, next_due_at = %next, success = record.outcome.is_success(), "occurrence finished");
            }
            Err(SchedulerError::Conflict { reason, .. }) => {
                warn!(task_id = %task.id, "occurrence not advanced: {reason}");
            }
            Err(e) => {
                // Nothing was written; the next tick retries this occurrence.
                error!(task_id = %task.id, scheduled_for = %record.scheduled_for, "failed to finish occurrence: {e}");
            }
        }
    }
}
