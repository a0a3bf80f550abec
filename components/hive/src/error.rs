use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("upload of program `{prog_id}` failed on worker {worker}: {reason}")]
    UploadFailed {
        prog_id: String,
        worker: usize,
        reason: String,
    },

    #[error("task `{task_id}` timed out after {}ms", .elapsed.as_millis())]
    TaskTimeout { task_id: String, elapsed: Duration },

    /// Covers runtime errors inside the entry point and programs that were
    /// never uploaded to the worker.
    #[error("task `{task_id}` failed: {reason}")]
    TaskExecution { task_id: String, reason: String },

    #[error("worker pool is shut down")]
    PoolClosed,
}

impl PoolError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, PoolError::TaskTimeout { .. })
    }
}
