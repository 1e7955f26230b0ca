//! File-backed execution sink.
//!
//! Each executed occurrence drops a small marker object into the artifact
//! directory. The object key is derived from the task id and the occurrence,
//! so re-executing the same occurrence overwrites the same object.

use std::path::PathBuf;

use async_trait::async_trait;
use taskcron_scheduler::{ArtifactRef, ExecutionSink, Task};
use tracing::debug;

pub struct FileArtifactSink {
    dir: PathBuf,
}

impl FileArtifactSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn object_name(task: &Task) -> String {
        format!(
            "task_{}_{}.txt",
            task.id,
            task.next_due_at.format("%Y%m%dT%H%M%SZ")
        )
    }
}

#[async_trait]
impl ExecutionSink for FileArtifactSink {
    async fn execute(&self, task: &Task) -> Result<Option<ArtifactRef>, String> {
        let path = self.dir.join(Self::object_name(task));
        let body = format!(
            "Item created by scheduled task '{}' ({}) for occurrence {}\n",
            task.name,
            task.id,
            task.next_due_at.to_rfc3339()
        );
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| format!("write {}: {e}", path.display()))?;
        debug!(task_id = %task.id, path = %path.display(), "artifact written");
        Ok(Some(path.display().to_string()))
    }
}
