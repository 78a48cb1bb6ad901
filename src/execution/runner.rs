use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::trigger::{build_trigger, CheckpointTrigger};
use super::worker::{Worker, WorkerMsg, WorkerReport};
use super::{Clock, RestartDecision, RestartSupervisor, SystemClock, WorkerCount, WorkerIndex};
use crate::config::EngineConfig;
use crate::errors::{config_err, EngineError, EngineResult};
use crate::inputs::{Source, SourceBuilder};
use crate::job::Job;
use crate::metrics::METER_NAME;
use crate::outputs::SinkBuilder;
use crate::recovery::coordinator::{Coordinator, CoordinatorMsg, CoordinatorReport};
use crate::recovery::model::{CheckpointId, CheckpointMode, ResumeFrom, StateKey, StateName};
use crate::recovery::store::{build_store, shared, SharedSnapshotStore, SnapshotStore};
use crate::state::{Accumulator, Data, StoreSnapshot};

/// How long the router waits before polling a source that had
/// nothing ready.
const SOURCE_POLL_PAUSE: Duration = Duration::from_millis(1);

/// Result of a job that ran to the end of its input.
#[derive(Debug)]
pub struct JobReport<A> {
    /// Every accumulator of every worker when input ended.
    pub final_state: StoreSnapshot<A>,
    pub restarts: usize,
    /// Checkpoint outcomes, one entry per execution.
    pub checkpoints: Vec<CoordinatorReport>,
    /// Records applied by the final execution.
    pub records_applied: u64,
    pub dead_letters: u64,
}

impl<A: Accumulator> JobReport<A> {
    pub fn value(&self, key: &StateKey, name: &StateName) -> Option<&A> {
        self.final_state.get(key, name)
    }

    /// Id of the last checkpoint made durable by any execution.
    pub fn last_durable(&self) -> Option<CheckpointId> {
        self.checkpoints
            .iter()
            .rev()
            .find_map(|report| report.last_durable)
    }
}

/// Asks a running job for a checkpoint outside its regular schedule.
#[derive(Debug, Clone)]
pub struct CheckpointRequester(Arc<AtomicBool>);

impl CheckpointRequester {
    /// The router starts a checkpoint before routing its next record.
    pub fn request(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// Runs a job under the restart supervisor until its input ends or
/// the job fails.
pub struct JobRunner<I, A, O> {
    job: Arc<Job<I, A, O>>,
    config: EngineConfig,
    source_builder: Arc<dyn SourceBuilder<I>>,
    sink_builder: Arc<dyn SinkBuilder<O>>,
    store: Option<SharedSnapshotStore>,
    clock: Arc<dyn Clock>,
    requested: Arc<AtomicBool>,
}

impl<I, A, O> JobRunner<I, A, O>
where
    I: Data,
    A: Accumulator,
    O: Data,
{
    pub fn new(
        job: Job<I, A, O>,
        config: EngineConfig,
        source_builder: impl SourceBuilder<I> + 'static,
        sink_builder: impl SinkBuilder<O> + 'static,
    ) -> EngineResult<Self> {
        config.validate()?;
        Ok(Self {
            job: Arc::new(job),
            config,
            source_builder: Arc::new(source_builder),
            sink_builder: Arc::new(sink_builder),
            store: None,
            clock: Arc::new(SystemClock),
            requested: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Use this store instead of building one from the configured
    /// storage target. Lets several runs share an in-memory store.
    pub fn with_snapshot_store(mut self, store: SharedSnapshotStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Clock used for restart windows and snapshot timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn checkpoint_requester(&self) -> CheckpointRequester {
        CheckpointRequester(self.requested.clone())
    }

    pub fn job(&self) -> &Job<I, A, O> {
        &self.job
    }

    /// Run on a new multi-threaded tokio runtime.
    pub fn run_blocking(&self) -> EngineResult<JobReport<A>> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|err| config_err(&format!("error starting tokio runtime: {err}")))?;
        runtime.block_on(self.run())
    }

    #[tracing::instrument(name = "job", skip_all, fields(name = self.job.name()))]
    pub async fn run(&self) -> EngineResult<JobReport<A>> {
        let store = match &self.store {
            Some(store) => store.clone(),
            None => shared(build_store(&self.config.storage)?),
        };
        let mut supervisor = RestartSupervisor::new(&self.config.restart, self.clock.clone())?;
        let restart_counter = opentelemetry::global::meter(METER_NAME)
            .u64_counter("restarts")
            .with_description("executions restarted after a failure")
            .init();
        let labels = vec![KeyValue::new("job", self.job.name().to_string())];

        let mut checkpoints = Vec::new();
        loop {
            let outcome = match self.load_resume(&store).await {
                Ok(resume) => self.execute(&store, resume, &mut checkpoints).await,
                Err(err) => Err(err),
            };
            match outcome {
                Ok(outcome) => {
                    supervisor.finished();
                    tracing::info!(
                        "Job {} finished after {} restart(s)",
                        self.job.name(),
                        supervisor.restarts()
                    );
                    return Ok(JobReport {
                        final_state: outcome.final_state,
                        restarts: supervisor.restarts(),
                        checkpoints,
                        records_applied: outcome.records_applied,
                        dead_letters: outcome.dead_letters,
                    });
                }
                Err(err) => match supervisor.on_failure(&err) {
                    RestartDecision::Restart { delay } => {
                        restart_counter.add(1, &labels);
                        tokio::time::sleep(delay).await;
                        supervisor.resumed();
                    }
                    RestartDecision::Fail(err) => return Err(err),
                },
            }
        }
    }

    /// Read and validate the latest durable snapshot.
    #[tracing::instrument(name = "restore", skip_all)]
    async fn load_resume(
        &self,
        store: &SharedSnapshotStore,
    ) -> EngineResult<Option<(ResumeFrom, StoreSnapshot<A>)>> {
        let store = store.clone();
        let persisted = tokio::task::spawn_blocking(move || {
            let store = store
                .lock()
                .map_err(|_err| EngineError::Store("snapshot store lock poisoned".to_string()))?;
            store.load_latest()
        })
        .await
        .map_err(|err| EngineError::Store(format!("loading snapshot panicked: {err}")))??;

        match persisted {
            None => {
                tracing::info!("No durable checkpoint; starting from the beginning");
                Ok(None)
            }
            Some(persisted) => {
                let snapshot = persisted.decode::<A>(&self.job.schema())?;
                let resume = persisted.resume_from();
                tracing::info!(
                    "Resuming from checkpoint {} at source offset {} with {} accumulators",
                    resume.0,
                    resume.1,
                    snapshot.len()
                );
                Ok(Some((resume, snapshot)))
            }
        }
    }

    /// Build and run one execution.
    #[tracing::instrument(name = "execution", skip_all)]
    async fn execute(
        &self,
        store: &SharedSnapshotStore,
        resume: Option<(ResumeFrom, StoreSnapshot<A>)>,
        checkpoints: &mut Vec<CoordinatorReport>,
    ) -> EngineResult<ExecutionOutcome<A>> {
        let count = WorkerCount(self.config.parallelism);
        let mode = self.config.checkpoint.mode;
        let (resume_from, snapshot) = match resume {
            Some((resume_from, snapshot)) => (Some(resume_from), Some(snapshot)),
            None => (None, None),
        };
        tracing::info!("Starting execution with {count} workers in {mode} mode");

        let source = self
            .source_builder
            .build(resume_from.map(|resume| resume.1))?;

        let (coord_tx, coord_rx) = mpsc::unbounded_channel();
        let (fail_tx, fail_rx) = mpsc::unbounded_channel();
        let mut coord_sinks = Vec::new();
        let mut worker_txs = Vec::new();
        let mut worker_handles = Vec::new();
        for index in count.iter() {
            let sink = self.sink_builder.build(index, count)?;
            let worker_sink = match mode {
                CheckpointMode::ExactlyOnce => {
                    coord_sinks.push(sink);
                    None
                }
                CheckpointMode::AtLeastOnce => Some(sink),
            };
            let worker = Worker::new(
                index,
                count,
                self.job.clone(),
                snapshot.as_ref(),
                worker_sink,
            )?;
            let (tx, rx) = mpsc::channel(self.config.channel_capacity);
            let coord_tx = coord_tx.clone();
            let fail_tx: mpsc::UnboundedSender<EngineError> = fail_tx.clone();
            worker_handles.push(tokio::spawn(async move {
                let res = worker.run(rx, coord_tx).await;
                if let Err(err) = &res {
                    // The router might be gone already.
                    let _ = fail_tx.send(err.clone());
                }
                res
            }));
            worker_txs.push(tx);
        }

        let coordinator = Coordinator::new(
            self.job.clone(),
            mode,
            count,
            self.config.checkpoint.ack_timeout(),
            self.config.checkpoint.retained,
            self.config.checkpoint.tolerable_failed_checkpoints,
            store.clone(),
            self.clock.clone(),
            coord_sinks,
        );
        let coordinator_handle = tokio::spawn(coordinator.run(coord_rx, fail_tx));

        let execution = Execution {
            job: self.job.clone(),
            count,
            source,
            worker_txs,
            worker_handles,
            coord_tx,
            coordinator_handle,
            fail_rx,
            next_checkpoint: resume_from.unwrap_or_default().next_checkpoint(),
            requested: self.requested.clone(),
        };
        execution
            .run(build_trigger(&self.config.checkpoint), checkpoints)
            .await
    }
}

#[derive(Debug)]
struct ExecutionOutcome<A> {
    final_state: StoreSnapshot<A>,
    records_applied: u64,
    dead_letters: u64,
}

/// Everything one execution owns. The router runs on the task that
/// called [`JobRunner::run`].
struct Execution<I, A, O> {
    job: Arc<Job<I, A, O>>,
    count: WorkerCount,
    source: Box<dyn Source<I>>,
    worker_txs: Vec<mpsc::Sender<WorkerMsg<I>>>,
    worker_handles: Vec<JoinHandle<EngineResult<WorkerReport<A>>>>,
    coord_tx: mpsc::UnboundedSender<CoordinatorMsg<A, O>>,
    coordinator_handle: JoinHandle<EngineResult<CoordinatorReport>>,
    fail_rx: mpsc::UnboundedReceiver<EngineError>,
    next_checkpoint: CheckpointId,
    requested: Arc<AtomicBool>,
}

impl<I, A, O> Execution<I, A, O>
where
    I: Data,
    A: Accumulator,
    O: Data,
{
    async fn run(
        mut self,
        trigger: Box<dyn CheckpointTrigger>,
        checkpoints: &mut Vec<CoordinatorReport>,
    ) -> EngineResult<ExecutionOutcome<A>> {
        let res = match self.route(trigger).await {
            Ok(()) => self.final_checkpoint().await,
            Err(err) => Err(err),
        };
        match res {
            Ok(last_durable) => self.finish(last_durable, checkpoints).await,
            Err(err) => Err(self.abandon(err, checkpoints).await),
        }
    }

    /// Read the source until it ends, routing records and injecting
    /// barriers.
    async fn route(&mut self, mut trigger: Box<dyn CheckpointTrigger>) -> EngineResult<()> {
        loop {
            if let Ok(err) = self.fail_rx.try_recv() {
                return Err(err);
            }
            let requested = self.requested.swap(false, Ordering::Relaxed);
            if trigger.should_trigger() || requested {
                self.inject_barrier().await?;
            }
            match self.source.next() {
                Poll::Ready(Some(record)) => {
                    let index = self.job.key_of(&record).route(self.count)?;
                    self.send(index, WorkerMsg::Record(record)).await?;
                    trigger.record_dispatched();
                }
                Poll::Ready(None) => {
                    tracing::info!("Source ended at offset {}", self.source.snapshot());
                    return Ok(());
                }
                Poll::Pending => tokio::time::sleep(SOURCE_POLL_PAUSE).await,
            }
        }
    }

    async fn send(&mut self, index: WorkerIndex, msg: WorkerMsg<I>) -> EngineResult<()> {
        let sent = match self.worker_txs.get(index.0) {
            Some(tx) => tx.send(msg).await.is_ok(),
            None => false,
        };
        if sent {
            Ok(())
        } else {
            Err(self.worker_lost(index))
        }
    }

    /// The reported cause of a worker going away, if it reported one.
    fn worker_lost(&mut self, index: WorkerIndex) -> EngineError {
        self.fail_rx
            .try_recv()
            .unwrap_or(EngineError::WorkerLost(index.0))
    }

    /// Message the coordinator. If it has stopped, its reported cause
    /// is the error.
    fn notify(&mut self, msg: CoordinatorMsg<A, O>) -> EngineResult<()> {
        if self.coord_tx.send(msg).is_ok() {
            return Ok(());
        }
        Err(self
            .fail_rx
            .try_recv()
            .unwrap_or_else(|_err| EngineError::Store("checkpoint coordinator stopped".to_string())))
    }

    /// Start a checkpoint covering every record routed so far.
    async fn inject_barrier(&mut self) -> EngineResult<CheckpointId> {
        let id = self.next_checkpoint;
        self.next_checkpoint = id.next();
        self.notify(CoordinatorMsg::Begin {
            id,
            offset: self.source.snapshot(),
        })?;
        for index in self.count.iter() {
            self.send(index, WorkerMsg::Barrier(id)).await?;
        }
        self.notify(CoordinatorMsg::Injected(id))?;
        Ok(id)
    }

    /// Checkpoint the end of input and wait for it to become durable.
    async fn final_checkpoint(&mut self) -> EngineResult<CheckpointId> {
        let id = self.inject_barrier().await?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.notify(CoordinatorMsg::Finish(reply_tx))?;

        let reply = tokio::select! {
            reply = reply_rx => reply.ok(),
            Some(err) = self.fail_rx.recv() => return Err(err),
        };
        let report = match reply {
            Some(report) => report,
            None => {
                return Err(self.fail_rx.try_recv().unwrap_or_else(|_err| {
                    EngineError::Store("checkpoint coordinator stopped".to_string())
                }))
            }
        };
        if report.last_durable == Some(id) {
            Ok(id)
        } else {
            Err(report
                .abort_cause(id)
                .cloned()
                .unwrap_or(EngineError::CheckpointTimeout {
                    id,
                    missing: self.count.0,
                }))
        }
    }

    /// Stop workers after a successful final checkpoint and collect
    /// their state.
    async fn finish(
        self,
        last_durable: CheckpointId,
        checkpoints: &mut Vec<CoordinatorReport>,
    ) -> EngineResult<ExecutionOutcome<A>> {
        for tx in &self.worker_txs {
            if tx.send(WorkerMsg::Stop).await.is_err() {
                tracing::warn!("Worker stopped before being told to");
            }
        }
        drop(self.worker_txs);
        drop(self.coord_tx);

        let mut outcome = ExecutionOutcome {
            final_state: StoreSnapshot::empty(),
            records_applied: 0,
            dead_letters: 0,
        };
        for (index, handle) in self.worker_handles.into_iter().enumerate() {
            let report = handle
                .await
                .map_err(|_err| EngineError::WorkerLost(index))??;
            tracing::debug!(
                "Worker {} applied {} records",
                report.index,
                report.records_applied
            );
            outcome.records_applied += report.records_applied;
            outcome.dead_letters += report.dead_letters;
            let job = &self.job;
            outcome
                .final_state
                .absorb(report.final_state, |coord, left, right| {
                    job.merge(coord, left, right)
                })?;
        }
        let report = self
            .coordinator_handle
            .await
            .map_err(|err| EngineError::Store(format!("checkpoint coordinator panicked: {err}")))??;
        checkpoints.push(report);
        tracing::info!(
            "Execution finished; checkpoint {last_durable} holds the final state of {} accumulators",
            outcome.final_state.len()
        );
        Ok(outcome)
    }

    /// Tear down a failed execution.
    ///
    /// Workers are aborted, but the coordinator is allowed to drain so
    /// a checkpoint that already has every acknowledgement still
    /// becomes durable before the next execution loads the latest one.
    async fn abandon(
        mut self,
        err: EngineError,
        checkpoints: &mut Vec<CoordinatorReport>,
    ) -> EngineError {
        tracing::warn!("Execution failed: {err}");
        self.source.cancel();
        for handle in &self.worker_handles {
            handle.abort();
        }
        drop(self.worker_txs);
        drop(self.coord_tx);
        for handle in self.worker_handles {
            // Cancelled or failed; the cause is already known.
            let _ = handle.await;
        }
        match self.coordinator_handle.await {
            Ok(Ok(report)) => checkpoints.push(report),
            Ok(Err(coord_err)) => {
                tracing::warn!("Checkpoint coordinator failed: {coord_err}");
            }
            Err(join_err) => {
                tracing::warn!("Checkpoint coordinator panicked: {join_err}");
            }
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageTarget;
    use crate::inputs::TestingInput;
    use crate::operators::ReducePolicy;
    use crate::outputs::TestingOutput;
    use crate::recovery::store::InMemSnapshotStore;
    use crate::state::StateDescriptor;

    type Reading = (String, i64);

    fn job() -> Job<Reading, i64, i64> {
        Job::builder("sums", |record: &Reading| StateKey::new(record.0.clone()))
            .state(StateDescriptor::new(
                "sum",
                ReducePolicy::new(0, |record: &Reading| record.1, |a, b| Ok(a + b)),
            ))
            .build()
            .unwrap()
    }

    fn readings() -> Vec<Reading> {
        vec![
            ("SZ".to_string(), 1),
            ("BJ".to_string(), 10),
            ("SZ".to_string(), 1),
        ]
    }

    fn config(parallelism: usize) -> EngineConfig {
        let mut config = EngineConfig {
            parallelism,
            ..Default::default()
        };
        config.checkpoint.every_records = Some(2);
        config.restart.delay_ms = 0;
        config
    }

    #[tokio::test]
    async fn runs_to_completion() {
        let output = TestingOutput::new();
        let runner =
            JobRunner::new(job(), config(2), TestingInput::new(readings()), output.clone())
                .unwrap();
        let report = runner.run().await.unwrap();

        let sum = StateName::new("sum");
        assert_eq!(report.value(&StateKey::new("SZ"), &sum), Some(&2));
        assert_eq!(report.value(&StateKey::new("BJ"), &sum), Some(&10));
        assert_eq!(report.records_applied, 3);
        assert_eq!(report.restarts, 0);
        assert_eq!(report.last_durable(), Some(CheckpointId(2)));
        assert_eq!(output.collected().len(), 3);
    }

    #[tokio::test]
    async fn on_demand_checkpoint_is_taken() {
        let runner = JobRunner::new(
            job(),
            EngineConfig::default(),
            TestingInput::new(readings()),
            TestingOutput::new(),
        )
        .unwrap();
        runner.checkpoint_requester().request();
        let report = runner.run().await.unwrap();
        assert_eq!(
            report.checkpoints[0].completed,
            vec![CheckpointId(1), CheckpointId(2)]
        );
    }

    #[tokio::test]
    async fn checkpoint_ids_continue_after_resume() {
        let store = shared(Box::new(InMemSnapshotStore::new()));
        let runner = JobRunner::new(
            job(),
            config(1),
            TestingInput::new(readings()),
            TestingOutput::new(),
        )
        .unwrap()
        .with_snapshot_store(store.clone());
        runner.run().await.unwrap();

        // The final checkpoint already covers all input.
        let report = runner.run().await.unwrap();
        assert_eq!(report.records_applied, 0);
        assert_eq!(report.checkpoints[0].completed, vec![CheckpointId(3)]);
        let sum = StateName::new("sum");
        assert_eq!(report.value(&StateKey::new("SZ"), &sum), Some(&2));
    }

    #[test]
    fn invalid_config_is_refused() {
        let config = EngineConfig {
            parallelism: 0,
            storage: StorageTarget::InMemory,
            ..Default::default()
        };
        let err = JobRunner::new(
            job(),
            config,
            TestingInput::new(readings()),
            TestingOutput::new(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn run_blocking_builds_runtime() {
        let runner = JobRunner::new(
            job(),
            config(4),
            TestingInput::new(readings()),
            TestingOutput::new(),
        )
        .unwrap();
        let report = runner.run_blocking().unwrap();
        assert_eq!(report.final_state.len(), 2);
    }
}
