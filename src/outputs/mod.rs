//! Sinks for the values emitted by record handlers.
//!
//! Each worker gets its own sink instance, so items for one key always
//! reach the same sink in the order they were produced.

use serde::{Deserialize, Serialize};

use crate::errors::EngineResult;
use crate::execution::{WorkerCount, WorkerIndex};
use crate::recovery::model::{StateKey, StateName};

pub mod std_output;
pub mod testing_output;

pub use std_output::*;
pub use testing_output::*;

/// A value emitted downstream, tagged with where it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output<O> {
    pub key: StateKey,
    pub state: StateName,
    pub value: O,
}

/// Defines how output of the engine is written.
pub trait Sink<O>: Send {
    /// Write a single output item.
    fn write(&mut self, item: Output<O>) -> EngineResult<()>;
}

/// Builds the sink for one worker.
pub trait SinkBuilder<O>: Send + Sync {
    fn build(&self, worker: WorkerIndex, count: WorkerCount) -> EngineResult<Box<dyn Sink<O>>>;
}

impl<O, F> SinkBuilder<O> for F
where
    F: Fn(WorkerIndex, WorkerCount) -> EngineResult<Box<dyn Sink<O>>> + Send + Sync,
{
    fn build(&self, worker: WorkerIndex, count: WorkerCount) -> EngineResult<Box<dyn Sink<O>>> {
        self(worker, count)
    }
}
