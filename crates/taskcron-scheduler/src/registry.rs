use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::clock::{Clock, IdGenerator};
use crate::error::{Result, SchedulerError};
use crate::recurrence::Recurrence;
use crate::store::{PutMode, TaskIter, TaskStore};
use crate::types::{RunRecord, Task, TaskFilter, TaskStatus};

/// Fresh ids to try before giving up on a create that keeps colliding.
const MAX_ID_ATTEMPTS: usize = 3;

/// Management surface for task definitions: create, list and status changes.
///
/// Holds no state of its own; everything lives in the injected store.
pub struct TaskRegistry {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    page_size: usize,
}

impl TaskRegistry {
    pub fn new(
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        page_size: usize,
    ) -> Self {
        Self {
            store,
            clock,
            ids,
            page_size,
        }
    }

    /// Validate and persist a new Active task, first due after "now".
    #[instrument(skip(self))]
    pub fn create(&self, name: &str, recurrence: &str) -> Result<Task> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SchedulerError::Validation(
                "task name must not be empty".to_string(),
            ));
        }
        let recurrence = Recurrence::parse(recurrence)?;

        let now = self.clock.now();
        let next_due_at = recurrence
            .next_due_after(now)
            .ok_or_else(|| SchedulerError::InvalidRecurrence {
                expression: recurrence.to_string(),
                reason: format!("no occurrence after {now}"),
            })?;

        let mut last_err = None;
        for _ in 0..MAX_ID_ATTEMPTS {
            let task = Task {
                id: self.ids.generate(),
                name: name.to_string(),
                recurrence,
                created_at: now,
                last_run_at: None,
                next_due_at,
                status: TaskStatus::Active,
            };
            match self.store.put(&task, PutMode::CreateIfAbsent) {
                Ok(()) => {
                    info!(task_id = %task.id, %next_due_at, "task created");
                    return Ok(task);
                }
                Err(e @ SchedulerError::Conflict { .. }) => {
                    warn!(task_id = %task.id, "task id collision, regenerating");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            SchedulerError::Storage("task id generation exhausted".to_string())
        }))
    }

    /// Tasks in creation order. Lazy; pages are fetched as the caller iterates.
    pub fn list(&self, filter: TaskFilter) -> TaskIter<'_> {
        TaskIter::new(self.store.as_ref(), filter, self.page_size)
    }

    /// A live (non-deleted) task.
    pub fn get(&self, id: &str) -> Result<Task> {
        let task = self.store.get(id)?;
        if task.status == TaskStatus::Deleted {
            return Err(SchedulerError::TaskNotFound { id: id.to_string() });
        }
        Ok(task)
    }

    /// Run history of a task, oldest first. Deleted tasks keep their history.
    pub fn runs(&self, id: &str) -> Result<Vec<RunRecord>> {
        self.store.get(id)?;
        self.store.list_runs(id)
    }

    /// Stop scheduling a task. Pausing a paused task is a no-op.
    #[instrument(skip(self))]
    pub fn pause(&self, id: &str) -> Result<Task> {
        let task = self.store.modify(id, &mut |task| {
            match task.status {
                TaskStatus::Deleted => {
                    return Err(SchedulerError::TaskNotFound { id: task.id.clone() })
                }
                TaskStatus::Active | TaskStatus::Paused => task.status = TaskStatus::Paused,
            }
            Ok(())
        })?;
        info!(task_id = %id, "task paused");
        Ok(task)
    }

    /// Put a paused task back on the schedule.
    ///
    /// If its pending occurrence went by while paused, the schedule restarts
    /// from the next occurrence after now instead of firing a stale one.
    #[instrument(skip(self))]
    pub fn resume(&self, id: &str) -> Result<Task> {
        let now = self.clock.now();
        let task = self.store.modify(id, &mut |task| {
            match task.status {
                TaskStatus::Deleted => {
                    return Err(SchedulerError::TaskNotFound { id: task.id.clone() })
                }
                TaskStatus::Active => return Ok(()),
                TaskStatus::Paused => task.status = TaskStatus::Active,
            }
            if task.next_due_at < now {
                if let Some(next) = task.recurrence.next_due_after(now) {
                    task.next_due_at = next;
                }
            }
            Ok(())
        })?;
        info!(task_id = %id, next_due_at = %task.next_due_at, "task resumed");
        Ok(task)
    }

    /// Logical delete. Deleting an already-deleted task is a no-op.
    #[instrument(skip(self))]
    pub fn delete(&self, id: &str) -> Result<Task> {
        let task = self.store.modify(id, &mut |task| {
            task.status = TaskStatus::Deleted;
            Ok(())
        })?;
        info!(task_id = %id, "task deleted");
        Ok(task)
    }
}
