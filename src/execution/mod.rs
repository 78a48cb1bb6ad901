//! Running a job: workers, the key router, checkpoint triggers and
//! the restart loop.
//!
//! A job runs as a series of executions. Each execution builds one
//! tokio task per worker, a checkpoint coordinator task, and pumps the
//! source from the calling task, routing every record to the worker
//! owning its key. When an execution fails, the
//! [`supervisor::RestartSupervisor`] decides whether a new execution
//! resumes from the last durable checkpoint.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod clock;
pub mod runner;
pub mod supervisor;
pub(crate) mod trigger;
pub(crate) mod worker;

pub use clock::*;
pub use runner::*;
pub use supervisor::*;

/// Index of a worker within an execution.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerIndex(pub usize);

impl fmt::Display for WorkerIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Total number of workers in an execution.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerCount(pub usize);

impl WorkerCount {
    /// Return an iter of all worker indexes.
    pub fn iter(&self) -> impl Iterator<Item = WorkerIndex> {
        (0..self.0).map(WorkerIndex)
    }
}

impl fmt::Display for WorkerCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}
