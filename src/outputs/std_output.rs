use std::fmt::Debug;
use std::io::Write;

use super::{Output, Sink, SinkBuilder};
use crate::errors::{EngineError, EngineResult};
use crate::execution::{WorkerCount, WorkerIndex};

/// Print output to standard out, one line per item, prefixed with the
/// worker that produced it: `2> (SZ, 3)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdOutput;

impl<O> SinkBuilder<O> for StdOutput
where
    O: Debug + Send + 'static,
{
    fn build(&self, worker: WorkerIndex, _count: WorkerCount) -> EngineResult<Box<dyn Sink<O>>> {
        Ok(Box::new(StdSink { worker }))
    }
}

struct StdSink {
    worker: WorkerIndex,
}

impl<O: Debug + Send> Sink<O> for StdSink {
    fn write(&mut self, item: Output<O>) -> EngineResult<()> {
        let line = format_line(self.worker, &item);
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{line}")
            .map_err(|err| EngineError::Store(format!("error writing to stdout: {err}")))
    }
}

fn format_line<O: Debug>(worker: WorkerIndex, item: &Output<O>) -> String {
    format!("{}> ({}, {:?})", worker.0 + 1, item.key, item.value)
}

#[test]
fn line_names_worker_key_and_value() {
    use crate::recovery::model::{StateKey, StateName};

    let item = Output {
        key: StateKey::new("SZ"),
        state: StateName::new("sum"),
        value: 3,
    };
    assert_eq!(format_line(WorkerIndex(1), &item), "2> (SZ, 3)");
}
