//! Checkpoint coordinator.
//!
//! Runs as its own task next to the workers of an execution. The
//! router tells it when an attempt begins and when the barrier has been
//! injected into every worker channel; workers acknowledge with their
//! snapshot once they see the barrier. When every worker has
//! acknowledged before the deadline the attempt is assembled and
//! persisted, otherwise it is aborted and the previous durable
//! checkpoint remains the recovery point.
//!
//! In exactly-once mode the coordinator also owns the sinks. Worker
//! outputs travel with acknowledgements and are written only after a
//! checkpoint covering the records that produced them is durable.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::KeyValue;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout_at, Instant};

use crate::errors::{EngineError, EngineResult};
use crate::execution::{Clock, WorkerCount, WorkerIndex};
use crate::job::Job;
use crate::metrics::METER_NAME;
use crate::outputs::{Output, Sink};
use crate::recovery::model::*;
use crate::recovery::store::{SharedSnapshotStore, SnapshotStore};
use crate::state::{Accumulator, Data, StoreSnapshot};
use crate::with_timer;

/// A worker's answer to a barrier.
#[derive(Debug)]
pub(crate) struct Ack<A, O> {
    pub(crate) id: CheckpointId,
    pub(crate) worker: WorkerIndex,
    pub(crate) snapshot: StoreSnapshot<A>,
    /// Outputs produced since the previous barrier. Empty unless the
    /// worker is staging outputs.
    pub(crate) outputs: Vec<Output<O>>,
}

#[derive(Debug)]
pub(crate) enum CoordinatorMsg<A, O> {
    /// Sent before the barrier reaches any worker.
    Begin {
        id: CheckpointId,
        offset: SourceOffset,
    },
    /// The barrier is in every worker channel.
    Injected(CheckpointId),
    Ack(Ack<A, O>),
    /// Reply once no attempt is outstanding.
    Finish(oneshot::Sender<CoordinatorReport>),
}

/// Outcome of every checkpoint attempt of one execution.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorReport {
    pub completed: Vec<CheckpointId>,
    pub aborted: Vec<CheckpointId>,
    pub last_durable: Option<CheckpointId>,
    /// Why each aborted attempt was aborted.
    pub(crate) causes: BTreeMap<CheckpointId, EngineError>,
}

impl CoordinatorReport {
    pub fn abort_cause(&self, id: CheckpointId) -> Option<&EngineError> {
        self.causes.get(&id)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CheckpointPhase {
    Triggered,
    BarrierInjected,
    PerKeySnapshotting,
    Completed,
    Aborted,
}

/// One in-flight checkpoint.
#[derive(Debug)]
pub(crate) struct CheckpointAttempt<A> {
    id: CheckpointId,
    offset: SourceOffset,
    phase: CheckpointPhase,
    /// Set once the barrier is in every worker channel.
    deadline: Option<Instant>,
    expected: WorkerCount,
    acks: BTreeMap<WorkerIndex, StoreSnapshot<A>>,
    triggered_at: DateTime<Utc>,
}

impl<A: Accumulator> CheckpointAttempt<A> {
    pub(crate) fn new(
        id: CheckpointId,
        offset: SourceOffset,
        expected: WorkerCount,
        triggered_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            offset,
            phase: CheckpointPhase::Triggered,
            deadline: None,
            expected,
            acks: BTreeMap::new(),
            triggered_at,
        }
    }

    pub(crate) fn phase(&self) -> CheckpointPhase {
        self.phase
    }

    /// Acknowledgements are due by `deadline`. Workers might have
    /// acknowledged already.
    pub(crate) fn barrier_injected(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
        if self.phase == CheckpointPhase::Triggered {
            self.phase = CheckpointPhase::BarrierInjected;
        }
    }

    /// Record a worker's snapshot. Returns if every worker has now
    /// acknowledged.
    pub(crate) fn acknowledge(&mut self, worker: WorkerIndex, snapshot: StoreSnapshot<A>) -> bool {
        self.phase = CheckpointPhase::PerKeySnapshotting;
        self.acks.insert(worker, snapshot);
        self.is_complete()
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.acks.len() == self.expected.0
    }

    pub(crate) fn missing(&self) -> usize {
        self.expected.0.saturating_sub(self.acks.len())
    }

    fn abort(&mut self) -> EngineError {
        self.phase = CheckpointPhase::Aborted;
        EngineError::CheckpointTimeout {
            id: self.id,
            missing: self.missing(),
        }
    }

    /// Combine every worker snapshot into one snapshot of the whole
    /// job.
    pub(crate) fn assemble<I, O>(
        &mut self,
        job: &Job<I, A, O>,
    ) -> EngineResult<StoreSnapshot<A>>
    where
        I: Data,
        O: Data,
    {
        self.phase = CheckpointPhase::Completed;
        let mut assembled = StoreSnapshot::empty().with_taken_at(self.triggered_at);
        for (_worker, snapshot) in std::mem::take(&mut self.acks) {
            assembled.absorb(snapshot, |coord, left, right| job.merge(coord, left, right))?;
        }
        Ok(assembled)
    }
}

pub(crate) struct Coordinator<I, A, O> {
    job: Arc<Job<I, A, O>>,
    mode: CheckpointMode,
    count: WorkerCount,
    ack_timeout: Duration,
    retained: usize,
    /// Snapshots in a row allowed to fail to persist.
    tolerable_failures: usize,
    failed_persists: usize,
    store: SharedSnapshotStore,
    clock: Arc<dyn Clock>,
    /// One per worker in exactly-once mode, none otherwise.
    sinks: Vec<Box<dyn Sink<O>>>,
    attempts: BTreeMap<CheckpointId, CheckpointAttempt<A>>,
    /// Staged outputs per worker, by the checkpoint that covers them.
    pending: Vec<BTreeMap<CheckpointId, Vec<Output<O>>>>,
    finish: Option<oneshot::Sender<CoordinatorReport>>,
    report: CoordinatorReport,
    labels: Vec<KeyValue>,
    completed_counter: Counter<u64>,
    aborted_counter: Counter<u64>,
    persist_histogram: Histogram<f64>,
}

impl<I, A, O> Coordinator<I, A, O>
where
    I: Data,
    A: Accumulator,
    O: Data,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        job: Arc<Job<I, A, O>>,
        mode: CheckpointMode,
        count: WorkerCount,
        ack_timeout: Duration,
        retained: usize,
        tolerable_failures: usize,
        store: SharedSnapshotStore,
        clock: Arc<dyn Clock>,
        sinks: Vec<Box<dyn Sink<O>>>,
    ) -> Self {
        let meter = opentelemetry::global::meter(METER_NAME);
        let completed_counter = meter
            .u64_counter("checkpoints_completed")
            .with_description("checkpoints durably persisted")
            .init();
        let aborted_counter = meter
            .u64_counter("checkpoints_aborted")
            .with_description("checkpoints aborted before becoming durable")
            .init();
        let persist_histogram = meter
            .f64_histogram("persist_duration_seconds")
            .with_description("time to write a snapshot to the store in seconds")
            .init();
        let labels = vec![KeyValue::new("job", job.name().to_string())];

        Self {
            job,
            mode,
            count,
            ack_timeout,
            retained,
            tolerable_failures,
            failed_persists: 0,
            store,
            clock,
            sinks,
            attempts: BTreeMap::new(),
            pending: count.iter().map(|_| BTreeMap::new()).collect(),
            finish: None,
            report: CoordinatorReport::default(),
            labels,
            completed_counter,
            aborted_counter,
            persist_histogram,
        }
    }

    /// Handle messages until every sender is gone.
    ///
    /// Fails when writing released outputs to a sink fails, or when
    /// more snapshots in a row than tolerated could not be persisted.
    /// A single snapshot that can not be persisted only aborts its
    /// checkpoint. A failure is sent on `failed` while `rx` and any
    /// pending finish reply are still open.
    #[tracing::instrument(name = "checkpoint_coordinator", skip_all)]
    pub(crate) async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<CoordinatorMsg<A, O>>,
        failed: mpsc::UnboundedSender<EngineError>,
    ) -> EngineResult<CoordinatorReport> {
        if let Err(err) = self.serve(&mut rx).await {
            tracing::error!("Checkpoint coordinator failed: {err}");
            // The router might be gone already.
            let _ = failed.send(err.clone());
            return Err(err);
        }
        // Attempts still open when the execution ends will never
        // complete.
        let open: Vec<_> = self.attempts.keys().copied().collect();
        for id in open {
            self.abort(id);
        }
        Ok(self.report)
    }

    async fn serve(
        &mut self,
        rx: &mut mpsc::UnboundedReceiver<CoordinatorMsg<A, O>>,
    ) -> EngineResult<()> {
        loop {
            let next_deadline = self
                .attempts
                .values()
                .filter_map(|attempt| attempt.deadline)
                .min();
            let msg = match next_deadline {
                Some(deadline) => match timeout_at(deadline, rx.recv()).await {
                    Ok(msg) => msg,
                    Err(_elapsed) => {
                        self.expire(rx).await?;
                        continue;
                    }
                },
                None => rx.recv().await,
            };
            match msg {
                Some(msg) => self.handle(msg).await?,
                None => return Ok(()),
            }
        }
    }

    async fn handle(&mut self, msg: CoordinatorMsg<A, O>) -> EngineResult<()> {
        match msg {
            CoordinatorMsg::Begin { id, offset } => {
                tracing::debug!("Checkpoint {id} triggered at source offset {offset}");
                let attempt = CheckpointAttempt::new(id, offset, self.count, self.clock.now());
                self.attempts.insert(id, attempt);
            }
            CoordinatorMsg::Injected(id) => {
                if let Some(attempt) = self.attempts.get_mut(&id) {
                    attempt.barrier_injected(Instant::now() + self.ack_timeout);
                }
            }
            CoordinatorMsg::Ack(ack) => self.on_ack(ack).await?,
            CoordinatorMsg::Finish(reply) => self.finish = Some(reply),
        }
        self.maybe_finish();
        Ok(())
    }

    async fn on_ack(&mut self, ack: Ack<A, O>) -> EngineResult<()> {
        let Ack {
            id,
            worker,
            snapshot,
            outputs,
        } = ack;
        if !outputs.is_empty() {
            if let Some(pending) = self.pending.get_mut(worker.0) {
                pending.entry(id).or_default().extend(outputs);
            }
        }
        match self.attempts.get_mut(&id) {
            Some(attempt) => {
                if attempt.acknowledge(worker, snapshot) {
                    if let Some(attempt) = self.attempts.remove(&id) {
                        self.complete(attempt).await?;
                    }
                }
            }
            None => {
                tracing::debug!("Ignoring late acknowledgement of checkpoint {id} from worker {worker}");
            }
        }
        Ok(())
    }

    async fn complete(&mut self, mut attempt: CheckpointAttempt<A>) -> EngineResult<()> {
        let id = attempt.id;
        if self.report.last_durable.map_or(false, |last| id <= last) {
            let err = EngineError::Store(format!(
                "checkpoint {id} is older than the durable checkpoint"
            ));
            tracing::warn!("Dropping checkpoint: {err}");
            self.count_aborted(id, err);
            return Ok(());
        }
        let persisted = attempt.assemble(&self.job).and_then(|assembled| {
            PersistedSnapshot::encode(
                id,
                attempt.offset,
                self.mode,
                self.job.schema(),
                &assembled,
            )
        });
        let persisted = match persisted {
            Ok(persisted) => persisted,
            Err(err) => return self.persist_failed(id, err),
        };

        let store = self.store.clone();
        let retained = self.retained;
        let written = with_timer!(
            self.persist_histogram,
            self.labels,
            tokio::task::spawn_blocking(move || persist(&store, &persisted, retained)).await
        );
        match written {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return self.persist_failed(id, err),
            Err(err) => {
                let err = EngineError::Store(format!("snapshot write panicked: {err}"));
                return self.persist_failed(id, err);
            }
        }
        self.failed_persists = 0;

        tracing::info!("Checkpoint {id} durable at source offset {}", attempt.offset);
        self.report.completed.push(id);
        self.report.last_durable = Some(id);
        self.completed_counter.add(1, &self.labels);
        self.release(id)
    }

    /// Write every staged output covered by durable checkpoint `id`.
    fn release(&mut self, id: CheckpointId) -> EngineResult<()> {
        for (pending, sink) in self.pending.iter_mut().zip(self.sinks.iter_mut()) {
            let later = pending.split_off(&id.next());
            let covered = std::mem::replace(pending, later);
            for (_id, outputs) in covered {
                for item in outputs {
                    sink.write(item)?;
                }
            }
        }
        Ok(())
    }

    async fn expire(
        &mut self,
        rx: &mut mpsc::UnboundedReceiver<CoordinatorMsg<A, O>>,
    ) -> EngineResult<()> {
        // Acks might have queued up while the deadline passed.
        while let Ok(msg) = rx.try_recv() {
            self.handle(msg).await?;
        }
        let now = Instant::now();
        let overdue: Vec<_> = self
            .attempts
            .values()
            .filter(|attempt| attempt.deadline.map_or(false, |deadline| deadline <= now))
            .map(|attempt| attempt.id)
            .collect();
        for id in overdue {
            self.abort(id);
        }
        self.maybe_finish();
        Ok(())
    }

    fn abort(&mut self, id: CheckpointId) {
        if let Some(mut attempt) = self.attempts.remove(&id) {
            let phase = attempt.phase();
            let err = attempt.abort();
            tracing::warn!("Aborting checkpoint while {phase:?}: {err}");
            self.count_aborted(id, err);
        }
    }

    /// Abort a checkpoint whose snapshot could not be encoded or
    /// written.
    fn persist_failed(&mut self, id: CheckpointId, err: EngineError) -> EngineResult<()> {
        tracing::warn!("Aborting checkpoint {id}; snapshot not persisted: {err}");
        self.count_aborted(id, err.clone());
        self.failed_persists += 1;
        if self.failed_persists > self.tolerable_failures {
            return Err(EngineError::Store(format!(
                "{} snapshots in a row could not be persisted; last: {err}",
                self.failed_persists
            )));
        }
        Ok(())
    }

    fn count_aborted(&mut self, id: CheckpointId, cause: EngineError) {
        self.report.aborted.push(id);
        self.report.causes.insert(id, cause);
        self.aborted_counter.add(1, &self.labels);
    }

    fn maybe_finish(&mut self) {
        if self.attempts.is_empty() {
            if let Some(reply) = self.finish.take() {
                if reply.send(self.report.clone()).is_err() {
                    tracing::debug!("Nobody waiting on the checkpoint report");
                }
            }
        }
    }
}

fn persist(
    store: &SharedSnapshotStore,
    snapshot: &PersistedSnapshot,
    retained: usize,
) -> EngineResult<()> {
    let mut store = store
        .lock()
        .map_err(|_err| EngineError::Store("snapshot store lock poisoned".to_string()))?;
    store.write(snapshot)?;
    if let Err(err) = store.gc(retained) {
        // The snapshot is already durable.
        tracing::warn!("Snapshot garbage collection failed: {err}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::SystemClock;
    use crate::operators::ReducePolicy;
    use crate::outputs::{SinkBuilder, TestingOutput};
    use crate::recovery::store::{shared, InMemSnapshotStore};
    use crate::state::StateDescriptor;

    type Reading = (String, i64);

    fn job() -> Arc<Job<Reading, i64, i64>> {
        Arc::new(
            Job::builder("sums", |record: &Reading| StateKey::new(record.0.clone()))
                .state(StateDescriptor::new(
                    "sum",
                    ReducePolicy::new(0, |record: &Reading| record.1, |a, b| Ok(a + b)),
                ))
                .build()
                .unwrap(),
        )
    }

    fn worker_snapshot(key: &str, value: i64) -> StoreSnapshot<i64> {
        StoreSnapshot::from_entries(
            Utc::now(),
            [(
                StoreKey(StateName::new("sum"), StateKey::new(key)),
                Arc::new(value),
            )],
        )
    }

    fn output(key: &str, value: i64) -> Output<i64> {
        Output {
            key: StateKey::new(key),
            state: StateName::new("sum"),
            value,
        }
    }

    fn ack(id: u64, worker: usize, key: &str, value: i64) -> CoordinatorMsg<i64, i64> {
        CoordinatorMsg::Ack(Ack {
            id: CheckpointId(id),
            worker: WorkerIndex(worker),
            snapshot: worker_snapshot(key, value),
            outputs: vec![output(key, value)],
        })
    }

    /// Refuses every write, like a full disk.
    struct FullDisk;

    impl SnapshotStore for FullDisk {
        fn write(&mut self, _snapshot: &PersistedSnapshot) -> EngineResult<()> {
            Err(EngineError::Store("no space left on device".to_string()))
        }

        fn load_latest(&self) -> EngineResult<Option<PersistedSnapshot>> {
            Ok(None)
        }

        fn gc(&mut self, _retain: usize) -> EngineResult<()> {
            Ok(())
        }
    }

    /// Refuses writes of odd checkpoint ids.
    struct FlakyDisk(InMemSnapshotStore);

    impl SnapshotStore for FlakyDisk {
        fn write(&mut self, snapshot: &PersistedSnapshot) -> EngineResult<()> {
            if snapshot.checkpoint_id.0 % 2 == 1 {
                return Err(EngineError::Store("write timed out".to_string()));
            }
            self.0.write(snapshot)
        }

        fn load_latest(&self) -> EngineResult<Option<PersistedSnapshot>> {
            self.0.load_latest()
        }

        fn gc(&mut self, retain: usize) -> EngineResult<()> {
            self.0.gc(retain)
        }
    }

    struct Harness {
        tx: mpsc::UnboundedSender<CoordinatorMsg<i64, i64>>,
        handle: tokio::task::JoinHandle<EngineResult<CoordinatorReport>>,
        failed: mpsc::UnboundedReceiver<EngineError>,
        store: SharedSnapshotStore,
        output: TestingOutput<i64>,
    }

    fn start(count: usize, ack_timeout: Duration) -> Harness {
        start_with(count, ack_timeout, shared(Box::new(InMemSnapshotStore::new())), 3)
    }

    fn start_with(
        count: usize,
        ack_timeout: Duration,
        store: SharedSnapshotStore,
        tolerable_failures: usize,
    ) -> Harness {
        let output = TestingOutput::new();
        let count = WorkerCount(count);
        let sinks = count
            .iter()
            .map(|index| output.build(index, count).unwrap())
            .collect();
        let coordinator = Coordinator::new(
            job(),
            CheckpointMode::ExactlyOnce,
            count,
            ack_timeout,
            1,
            tolerable_failures,
            store.clone(),
            Arc::new(SystemClock),
            sinks,
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let (failed_tx, failed) = mpsc::unbounded_channel();
        let handle = tokio::spawn(coordinator.run(rx, failed_tx));
        Harness {
            tx,
            handle,
            failed,
            store,
            output,
        }
    }

    fn begin(id: u64, offset: u64) -> CoordinatorMsg<i64, i64> {
        CoordinatorMsg::Begin {
            id: CheckpointId(id),
            offset: SourceOffset(offset),
        }
    }

    #[test]
    fn attempt_walks_phases() {
        let mut attempt = CheckpointAttempt::new(
            CheckpointId(1),
            SourceOffset(3),
            WorkerCount(2),
            Utc::now(),
        );
        assert_eq!(attempt.phase(), CheckpointPhase::Triggered);
        attempt.barrier_injected(Instant::now());
        assert_eq!(attempt.phase(), CheckpointPhase::BarrierInjected);
        assert!(!attempt.acknowledge(WorkerIndex(0), worker_snapshot("SZ", 2)));
        assert_eq!(attempt.phase(), CheckpointPhase::PerKeySnapshotting);
        assert_eq!(attempt.missing(), 1);
        assert!(attempt.acknowledge(WorkerIndex(1), worker_snapshot("BJ", 10)));

        let assembled = attempt.assemble(&job()).unwrap();
        assert_eq!(attempt.phase(), CheckpointPhase::Completed);
        assert_eq!(assembled.len(), 2);
        assert_eq!(assembled.taken_at(), attempt.triggered_at);
    }

    #[test]
    fn abort_reports_missing_workers() {
        let mut attempt = CheckpointAttempt::<i64>::new(
            CheckpointId(4),
            SourceOffset(0),
            WorkerCount(3),
            Utc::now(),
        );
        attempt.acknowledge(WorkerIndex(0), StoreSnapshot::empty());
        let err = attempt.abort();
        assert_eq!(attempt.phase(), CheckpointPhase::Aborted);
        assert!(matches!(
            err,
            EngineError::CheckpointTimeout { missing: 2, .. }
        ));
    }

    #[tokio::test]
    async fn completed_checkpoint_is_persisted_then_released() {
        let harness = start(2, Duration::from_secs(60));
        harness.tx.send(begin(1, 3)).unwrap();
        harness.tx.send(CoordinatorMsg::Injected(CheckpointId(1))).unwrap();
        harness.tx.send(ack(1, 0, "SZ", 2)).unwrap();
        harness.tx.send(ack(1, 1, "BJ", 10)).unwrap();
        drop(harness.tx);

        let report = harness.handle.await.unwrap().unwrap();
        assert_eq!(report.completed, vec![CheckpointId(1)]);
        assert_eq!(report.last_durable, Some(CheckpointId(1)));

        let persisted = harness.store.lock().unwrap().load_latest().unwrap().unwrap();
        assert_eq!(persisted.source_offset, SourceOffset(3));
        let restored = persisted.decode::<i64>(&job().schema()).unwrap();
        assert_eq!(restored.get(&StateKey::new("BJ"), &StateName::new("sum")), Some(&10));
        assert_eq!(harness.output.collected().len(), 2);
    }

    #[tokio::test]
    async fn missing_ack_aborts_and_withholds_outputs() {
        let harness = start(2, Duration::from_millis(20));
        harness.tx.send(begin(1, 3)).unwrap();
        harness.tx.send(CoordinatorMsg::Injected(CheckpointId(1))).unwrap();
        harness.tx.send(ack(1, 0, "SZ", 2)).unwrap();
        let (reply_tx, reply_rx) = oneshot::channel();
        harness.tx.send(CoordinatorMsg::Finish(reply_tx)).unwrap();

        let report = reply_rx.await.unwrap();
        assert_eq!(report.aborted, vec![CheckpointId(1)]);
        assert!(matches!(
            report.abort_cause(CheckpointId(1)),
            Some(EngineError::CheckpointTimeout { missing: 1, .. })
        ));
        assert_eq!(report.last_durable, None);
        assert!(harness.store.lock().unwrap().load_latest().unwrap().is_none());
        assert!(harness.output.collected().is_empty());

        // Outputs of the aborted attempt go out with the next durable
        // checkpoint.
        harness.tx.send(ack(1, 1, "BJ", 10)).unwrap();
        harness.tx.send(begin(2, 5)).unwrap();
        harness.tx.send(ack(2, 0, "SZ", 3)).unwrap();
        harness.tx.send(ack(2, 1, "BJ", 11)).unwrap();
        drop(harness.tx);
        let report = harness.handle.await.unwrap().unwrap();
        assert_eq!(report.last_durable, Some(CheckpointId(2)));
        let values: Vec<_> = harness
            .output
            .collected()
            .into_iter()
            .map(|item| item.value)
            .collect();
        assert_eq!(values, vec![2, 3, 10, 11]);
    }

    #[tokio::test]
    async fn open_attempts_abort_when_execution_ends() {
        let harness = start(1, Duration::from_secs(60));
        harness.tx.send(begin(7, 1)).unwrap();
        drop(harness.tx);
        let report = harness.handle.await.unwrap().unwrap();
        assert_eq!(report.aborted, vec![CheckpointId(7)]);
        assert!(report.completed.is_empty());
    }

    #[tokio::test]
    async fn ack_deadline_starts_once_barrier_is_injected() {
        let harness = start(1, Duration::from_millis(20));
        harness.tx.send(begin(1, 2)).unwrap();
        // The router can take longer than the timeout to inject.
        tokio::time::sleep(Duration::from_millis(80)).await;
        harness.tx.send(CoordinatorMsg::Injected(CheckpointId(1))).unwrap();
        harness.tx.send(ack(1, 0, "SZ", 2)).unwrap();
        drop(harness.tx);

        let report = harness.handle.await.unwrap().unwrap();
        assert_eq!(report.completed, vec![CheckpointId(1)]);
        assert!(report.aborted.is_empty());
    }

    #[tokio::test]
    async fn failing_store_escalates_after_tolerated_failures() {
        let harness = start_with(1, Duration::from_secs(60), shared(Box::new(FullDisk)), 2);
        for id in 1..=3 {
            harness.tx.send(begin(id, id)).unwrap();
            harness.tx.send(CoordinatorMsg::Injected(CheckpointId(id))).unwrap();
            harness.tx.send(ack(id, 0, "SZ", id as i64)).unwrap();
        }

        let mut failed = harness.failed;
        let err = harness.handle.await.unwrap().unwrap_err();
        assert!(matches!(err, EngineError::Store(_)));
        assert!(err.to_string().contains("3 snapshots in a row"));
        assert!(err.is_recoverable());
        let reported = failed.try_recv().unwrap();
        assert_eq!(reported.to_string(), err.to_string());
        assert!(harness.output.collected().is_empty());
    }

    #[tokio::test]
    async fn durable_checkpoint_resets_failed_persists() {
        let store = shared(Box::new(FlakyDisk(InMemSnapshotStore::new())));
        let harness = start_with(1, Duration::from_secs(60), store, 1);
        for id in 1..=4 {
            harness.tx.send(begin(id, id)).unwrap();
            harness.tx.send(CoordinatorMsg::Injected(CheckpointId(id))).unwrap();
            harness.tx.send(ack(id, 0, "SZ", id as i64)).unwrap();
        }
        drop(harness.tx);

        let report = harness.handle.await.unwrap().unwrap();
        assert_eq!(report.completed, vec![CheckpointId(2), CheckpointId(4)]);
        assert_eq!(report.aborted, vec![CheckpointId(1), CheckpointId(3)]);
    }
}
