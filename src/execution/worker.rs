//! A worker owns the accumulators of its share of keys and applies
//! records to them one at a time.

use std::sync::Arc;

use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::KeyValue;
use tokio::sync::mpsc;

use super::{WorkerCount, WorkerIndex};
use crate::errors::{EngineError, EngineResult};
use crate::job::Job;
use crate::metrics::METER_NAME;
use crate::outputs::{Output, Sink};
use crate::recovery::coordinator::{Ack, CoordinatorMsg};
use crate::recovery::model::CheckpointId;
use crate::state::{
    Accumulator, AccumulatorStore, Data, KeyContext, KeyedStateHandle, StoreSnapshot,
};
use crate::with_timer;

/// Messages on a worker's FIFO channel.
#[derive(Debug)]
pub(crate) enum WorkerMsg<I> {
    Record(I),
    /// Everything before this in the channel is covered by the
    /// checkpoint.
    Barrier(CheckpointId),
    Stop,
}

/// Where a worker's outputs go.
enum Emit<O> {
    /// At-least-once: straight to the sink.
    Direct(Box<dyn Sink<O>>),
    /// Exactly-once: held until the next barrier hands them to the
    /// coordinator.
    Staged(Vec<Output<O>>),
}

/// What a worker leaves behind when it stops.
#[derive(Debug)]
pub(crate) struct WorkerReport<A> {
    pub(crate) index: WorkerIndex,
    pub(crate) final_state: StoreSnapshot<A>,
    pub(crate) records_applied: u64,
    pub(crate) dead_letters: u64,
}

pub(crate) struct Worker<I, A, O> {
    index: WorkerIndex,
    count: WorkerCount,
    job: Arc<Job<I, A, O>>,
    handles: Vec<KeyedStateHandle<I, A, O>>,
    store: AccumulatorStore<A>,
    emit: Emit<O>,
    records_applied: u64,
    dead_letters: u64,
    labels: Vec<KeyValue>,
    records_counter: Counter<u64>,
    dead_letter_counter: Counter<u64>,
    snapshot_histogram: Histogram<f64>,
}

impl<I, A, O> Worker<I, A, O>
where
    I: Data,
    A: Accumulator,
    O: Data,
{
    /// Build a worker, restoring the keys it owns from `resume`.
    ///
    /// Without a sink, outputs are staged and handed to the
    /// coordinator with each acknowledgement.
    pub(crate) fn new(
        index: WorkerIndex,
        count: WorkerCount,
        job: Arc<Job<I, A, O>>,
        resume: Option<&StoreSnapshot<A>>,
        sink: Option<Box<dyn Sink<O>>>,
    ) -> EngineResult<Self> {
        let mut store = job.new_store()?;
        if let Some(snapshot) = resume {
            store.restore(&snapshot.owned_by(index, count)?)?;
        }
        let handles = job.handles();
        let emit = match sink {
            Some(sink) => Emit::Direct(sink),
            None => Emit::Staged(Vec::new()),
        };

        let meter = opentelemetry::global::meter(METER_NAME);
        let records_counter = meter
            .u64_counter("records_applied")
            .with_description("records applied to keyed state")
            .init();
        let dead_letter_counter = meter
            .u64_counter("dead_letters")
            .with_description("records dropped because they reached the wrong worker")
            .init();
        let snapshot_histogram = meter
            .f64_histogram("snapshot_duration_seconds")
            .with_description("time to take a worker's accumulator snapshot in seconds")
            .init();
        let labels = vec![
            KeyValue::new("job", job.name().to_string()),
            KeyValue::new("worker_index", index.0 as i64),
        ];

        Ok(Self {
            index,
            count,
            job,
            handles,
            store,
            emit,
            records_applied: 0,
            dead_letters: 0,
            labels,
            records_counter,
            dead_letter_counter,
            snapshot_histogram,
        })
    }

    /// Handle one message. Barriers return the acknowledgement to send
    /// to the coordinator.
    pub(crate) fn process(&mut self, msg: WorkerMsg<I>) -> EngineResult<Option<Ack<A, O>>> {
        match msg {
            WorkerMsg::Record(record) => {
                self.on_record(record)?;
                Ok(None)
            }
            WorkerMsg::Barrier(id) => Ok(Some(self.on_barrier(id))),
            WorkerMsg::Stop => Ok(None),
        }
    }

    fn on_record(&mut self, record: I) -> EngineResult<()> {
        let key = self.job.key_of(&record);
        let owner = key.route(self.count)?;
        if owner != self.index {
            let err = EngineError::KeyRouting {
                key,
                reason: format!("owned by worker {owner}, received by worker {}", self.index),
            };
            tracing::error!("Dropping record {record:?} as dead letter: {err}");
            self.dead_letters += 1;
            self.dead_letter_counter.add(1, &self.labels);
            return Ok(());
        }

        let mut out = Vec::new();
        let mut ctx = KeyContext::bound(&mut self.store, &key);
        self.job
            .handler()
            .on_record(&record, &mut ctx, &self.handles, &mut out)?;
        self.records_applied += 1;
        self.records_counter.add(1, &self.labels);

        match &mut self.emit {
            Emit::Direct(sink) => {
                for item in out {
                    sink.write(item)?;
                }
            }
            Emit::Staged(staged) => staged.extend(out),
        }
        Ok(())
    }

    fn on_barrier(&mut self, id: CheckpointId) -> Ack<A, O> {
        let snapshot = with_timer!(self.snapshot_histogram, self.labels, self.store.snapshot());
        let outputs = match &mut self.emit {
            Emit::Direct(_) => Vec::new(),
            Emit::Staged(staged) => std::mem::take(staged),
        };
        tracing::debug!(
            "Worker {} snapshotted {} accumulators for checkpoint {id}",
            self.index,
            snapshot.len()
        );
        Ack {
            id,
            worker: self.index,
            snapshot,
            outputs,
        }
    }

    pub(crate) fn into_report(self) -> WorkerReport<A> {
        WorkerReport {
            index: self.index,
            final_state: self.store.snapshot(),
            records_applied: self.records_applied,
            dead_letters: self.dead_letters,
        }
    }

    /// Process messages until told to stop or the channel closes.
    #[tracing::instrument(name = "worker", skip_all, fields(index = self.index.0))]
    pub(crate) async fn run(
        mut self,
        mut rx: mpsc::Receiver<WorkerMsg<I>>,
        coordinator: mpsc::UnboundedSender<CoordinatorMsg<A, O>>,
    ) -> EngineResult<WorkerReport<A>> {
        tracing::debug!("Worker {} of {} starting", self.index, self.count);
        while let Some(msg) = rx.recv().await {
            let stop = matches!(msg, WorkerMsg::Stop);
            if let Some(ack) = self.process(msg)? {
                if coordinator.send(CoordinatorMsg::Ack(ack)).is_err() {
                    tracing::warn!("Coordinator gone; dropping acknowledgement");
                }
            }
            if stop {
                break;
            }
        }
        tracing::debug!("Worker {} stopping", self.index);
        Ok(self.into_report())
    }
}
