//! # Hive
//!
//! A fixed pool of isolated workers executing uploaded programs.
//!
//! Programs are uploaded once to every worker and then executed any number
//! of times. Each task gets exactly one worker, a timeout that starts when
//! the worker begins running it, and exactly one terminal outcome. Workers
//! that time out or fail are terminated and replaced.

use judge::ExecutionUnit;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

mod error;
mod pool;
mod usage;
mod worker;

pub use error::PoolError;
pub use pool::WorkerPool;
pub use usage::{GpuInfo, HardwareUsage, HostProbe, StorageEstimate, SystemProbe};

/// Execution budget of a task, measured from the worker's "started" signal.
pub const TIMEOUT_MS: u64 = 5000;

/// Length of one utilization sampling window.
pub const REPORT_WINDOW_MS: u64 = 1000;

/// Builds one execution unit per worker, on the worker's own thread.
pub type UnitFactory = Arc<dyn Fn() -> Box<dyn ExecutionUnit> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub size: usize,
    pub task_timeout: Duration,
    pub report_window: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
            task_timeout: Duration::from_millis(TIMEOUT_MS),
            report_window: Duration::from_millis(REPORT_WINDOW_MS),
        }
    }
}

impl PoolConfig {
    pub fn with_size(size: usize) -> Self {
        Self {
            size,
            ..Self::default()
        }
    }
}

/// One execution request against an uploaded program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(rename = "progId")]
    pub prog_id: String,
    #[serde(rename = "taskId")]
    pub task_id: String,
    #[serde(rename = "funcArgs", default)]
    pub func_args: Vec<Value>,
}

impl Task {
    pub fn new(prog_id: impl Into<String>, task_id: impl Into<String>, func_args: Vec<Value>) -> Self {
        Self {
            prog_id: prog_id.into(),
            task_id: task_id.into(),
            func_args,
        }
    }
}
