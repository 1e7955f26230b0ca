use async_trait::async_trait;

use crate::types::Task;

/// Opaque handle to whatever the sink produced (file path, message id, ...).
pub type ArtifactRef = String;

/// The work behind a task, supplied by the host.
///
/// The engine only cares whether an attempt succeeded. `execute` may take
/// arbitrarily long; the engine wraps each call in its own timeout.
#[async_trait]
pub trait ExecutionSink: Send + Sync {
    /// Run one occurrence of `task`. `task.next_due_at` is the occurrence
    /// being executed.
    async fn execute(&self, task: &Task) -> Result<Option<ArtifactRef>, String>;
}
