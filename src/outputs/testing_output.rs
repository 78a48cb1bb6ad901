use std::sync::{Arc, Mutex};

use super::{Output, Sink, SinkBuilder};
use crate::errors::{EngineError, EngineResult};
use crate::execution::{WorkerCount, WorkerIndex};

/// Collects every item written by any worker into a shared list.
///
/// Clones share the list, so keep one to inspect what was written
/// after the job finishes. Survives restarts of the job.
#[derive(Debug)]
pub struct TestingOutput<O> {
    collected: Arc<Mutex<Vec<Output<O>>>>,
}

impl<O> Clone for TestingOutput<O> {
    fn clone(&self) -> Self {
        Self {
            collected: self.collected.clone(),
        }
    }
}

impl<O> Default for TestingOutput<O> {
    fn default() -> Self {
        Self {
            collected: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<O: Clone> TestingOutput<O> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything written so far.
    pub fn collected(&self) -> Vec<Output<O>> {
        self.collected
            .lock()
            .map(|items| items.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl<O> SinkBuilder<O> for TestingOutput<O>
where
    O: Send + 'static,
{
    fn build(&self, _worker: WorkerIndex, _count: WorkerCount) -> EngineResult<Box<dyn Sink<O>>> {
        Ok(Box::new(Self {
            collected: self.collected.clone(),
        }))
    }
}

impl<O: Send> Sink<O> for TestingOutput<O> {
    fn write(&mut self, item: Output<O>) -> EngineResult<()> {
        self.collected
            .lock()
            .map_err(|_| EngineError::Store("testing output lock poisoned".to_string()))?
            .push(item);
        Ok(())
    }
}

#[test]
fn clones_share_collected_items() {
    use crate::recovery::model::{StateKey, StateName};

    let output = TestingOutput::new();
    let mut sink = output.build(WorkerIndex(0), WorkerCount(1)).unwrap();
    sink.write(Output {
        key: StateKey::new("BJ"),
        state: StateName::new("sum"),
        value: 10,
    })
    .unwrap();
    assert_eq!(output.collected().len(), 1);
    assert_eq!(output.collected()[0].value, 10);
}
