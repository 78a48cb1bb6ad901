use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use stateflow::config::{EngineConfig, StorageTarget};
use stateflow::execution::JobRunner;
use stateflow::inputs::TestingInput;
use stateflow::operators::ReducePolicy;
use stateflow::outputs::{Output, TestingOutput};
use stateflow::recovery::model::{CheckpointMode, PersistedSnapshot, StateKey, StateName};
use stateflow::recovery::store::{shared, InMemSnapshotStore, SnapshotStore, SqliteSnapshotStore};
use stateflow::state::{
    AddThenEmit, KeyContext, KeyedStateHandle, RecordHandler, StateDescriptor,
};
use stateflow::{EngineError, EngineResult, Job};

/// City, value, sequence number.
type Reading = (String, i64, u64);

/// Fails the first time it sees each listed sequence number.
struct FailOnce {
    remaining: Mutex<HashSet<u64>>,
}

impl FailOnce {
    fn new(seqs: impl IntoIterator<Item = u64>) -> Self {
        Self {
            remaining: Mutex::new(seqs.into_iter().collect()),
        }
    }
}

impl RecordHandler<Reading, i64, i64> for FailOnce {
    fn on_record(
        &self,
        record: &Reading,
        ctx: &mut KeyContext<'_, i64>,
        states: &[KeyedStateHandle<Reading, i64, i64>],
        out: &mut Vec<Output<i64>>,
    ) -> EngineResult<()> {
        if self.remaining.lock().unwrap().remove(&record.2) {
            return Err(EngineError::Combine {
                state: states[0].name().clone(),
                key: ctx.current_key().unwrap().clone(),
                cause: format!("injected failure at record {}", record.2),
            });
        }
        AddThenEmit.on_record(record, ctx, states, out)
    }
}

/// Always fails on one sequence number.
struct FailAlways(u64);

impl RecordHandler<Reading, i64, i64> for FailAlways {
    fn on_record(
        &self,
        record: &Reading,
        ctx: &mut KeyContext<'_, i64>,
        states: &[KeyedStateHandle<Reading, i64, i64>],
        out: &mut Vec<Output<i64>>,
    ) -> EngineResult<()> {
        if record.2 == self.0 {
            return Err(EngineError::Combine {
                state: states[0].name().clone(),
                key: StateKey::new(record.0.clone()),
                cause: "poison record".to_string(),
            });
        }
        AddThenEmit.on_record(record, ctx, states, out)
    }
}

/// Sleeps once on one sequence number.
struct SlowOnce {
    seq: u64,
    slept: AtomicBool,
    pause: Duration,
}

impl RecordHandler<Reading, i64, i64> for SlowOnce {
    fn on_record(
        &self,
        record: &Reading,
        ctx: &mut KeyContext<'_, i64>,
        states: &[KeyedStateHandle<Reading, i64, i64>],
        out: &mut Vec<Output<i64>>,
    ) -> EngineResult<()> {
        if record.2 == self.seq && !self.slept.swap(true, Ordering::SeqCst) {
            std::thread::sleep(self.pause);
        }
        AddThenEmit.on_record(record, ctx, states, out)
    }
}

fn summing() -> StateDescriptor<Reading, i64, i64> {
    StateDescriptor::new(
        "sum",
        ReducePolicy::new(0, |record: &Reading| record.1, |a, b| Ok(a + b)),
    )
}

fn job_with(handler: impl RecordHandler<Reading, i64, i64> + 'static) -> Job<Reading, i64, i64> {
    Job::builder("sums", |record: &Reading| StateKey::new(record.0.clone()))
        .state(summing())
        .handler(handler)
        .build()
        .unwrap()
}

fn plain_job() -> Job<Reading, i64, i64> {
    job_with(AddThenEmit)
}

fn readings(count: u64, seed: u64) -> Vec<Reading> {
    let cities = ["SZ", "BJ", "SH", "GZ", "HZ"];
    let rng = fastrand::Rng::with_seed(seed);
    (0..count)
        .map(|seq| {
            let city = cities[rng.usize(..cities.len())].to_string();
            (city, rng.i64(1..50), seq)
        })
        .collect()
}

fn running_totals(records: &[Reading]) -> BTreeMap<String, Vec<i64>> {
    let mut totals: BTreeMap<String, Vec<i64>> = BTreeMap::new();
    for (city, value, _seq) in records {
        let seen = totals.entry(city.clone()).or_default();
        let last = seen.last().copied().unwrap_or(0);
        seen.push(last + value);
    }
    totals
}

fn by_key(items: Vec<Output<i64>>) -> BTreeMap<String, Vec<i64>> {
    let mut grouped: BTreeMap<String, Vec<i64>> = BTreeMap::new();
    for item in items {
        grouped.entry(item.key.to_string()).or_default().push(item.value);
    }
    grouped
}

/// A store whose disk is full.
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

fn config(parallelism: usize, every_records: u64) -> EngineConfig {
    let mut config = EngineConfig {
        parallelism,
        ..Default::default()
    };
    config.checkpoint.every_records = Some(every_records);
    config.restart.delay_ms = 0;
    config
}

fn temp_db(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!(
        "stateflow-{name}-{}-{}.sqlite3",
        std::process::id(),
        fastrand::u64(..)
    ));
    let _ = std::fs::remove_file(&path);
    path
}

#[test]
fn exactly_once_under_injected_failures() {
    let records = readings(60, 7);
    let expected = running_totals(&records);
    let output = TestingOutput::new();
    let runner = JobRunner::new(
        job_with(FailOnce::new([7, 23, 41])),
        config(3, 5),
        TestingInput::new(records),
        output.clone(),
    )
    .unwrap();
    let report = runner.run_blocking().unwrap();

    assert_eq!(report.restarts, 3);
    // Every running total exactly once, in order per key.
    assert_eq!(by_key(output.collected()), expected);
    for (city, totals) in &expected {
        assert_eq!(
            report.value(&StateKey::new(city.as_str()), &StateName::new("sum")),
            totals.last()
        );
    }
}

#[test]
fn at_least_once_state_survives_failures() {
    let records = readings(40, 11);
    let expected = running_totals(&records);
    let mut config = config(2, 4);
    config.checkpoint.mode = CheckpointMode::AtLeastOnce;
    let output = TestingOutput::new();
    let runner = JobRunner::new(
        job_with(FailOnce::new([17])),
        config,
        TestingInput::new(records),
        output.clone(),
    )
    .unwrap();
    let report = runner.run_blocking().unwrap();

    assert_eq!(report.restarts, 1);
    let emitted = by_key(output.collected());
    for (city, totals) in &expected {
        assert_eq!(
            report.value(&StateKey::new(city.as_str()), &StateName::new("sum")),
            totals.last()
        );
        // Replayed records may be written twice, never skipped.
        let seen = &emitted[city];
        assert!(totals.iter().all(|total| seen.contains(total)));
    }
}

#[test]
fn fourth_failure_in_window_fails_job() {
    let runner = JobRunner::new(
        job_with(FailAlways(3)),
        config(2, 2),
        TestingInput::new(readings(10, 3)),
        TestingOutput::new(),
    )
    .unwrap();
    match runner.run_blocking() {
        Err(EngineError::RestartBudgetExhausted { failures, causes }) => {
            assert_eq!(failures, 4);
            assert_eq!(causes.len(), 4);
            assert!(causes[0].contains("poison record"));
        }
        other => panic!("expected exhausted restart budget, got {other:?}"),
    }
}

#[test]
fn sqlite_resume_with_different_parallelism() {
    let path = temp_db("resume");
    let records = readings(50, 5);
    let mut first_config = config(2, 3);
    first_config.storage = StorageTarget::Sqlite { path: path.clone() };
    first_config.checkpoint.retained = 2;

    // The first run only sees a prefix of the input.
    let first = JobRunner::new(
        plain_job(),
        first_config.clone(),
        TestingInput::new(records[..20].to_vec()),
        TestingOutput::new(),
    )
    .unwrap();
    let first_report = first.run_blocking().unwrap();
    assert_eq!(first_report.records_applied, 20);

    let mut second_config = first_config;
    second_config.parallelism = 3;
    let output = TestingOutput::new();
    let second = JobRunner::new(
        plain_job(),
        second_config,
        TestingInput::new(records.clone()),
        output.clone(),
    )
    .unwrap();
    let report = second.run_blocking().unwrap();

    assert_eq!(report.records_applied, 30);
    assert_eq!(output.collected().len(), 30);
    let expected = running_totals(&records);
    for (city, totals) in &expected {
        assert_eq!(
            report.value(&StateKey::new(city.as_str()), &StateName::new("sum")),
            totals.last()
        );
    }
    let ids_after_resume = &report.checkpoints[0].completed;
    assert!(ids_after_resume[0] > first_report.last_durable().unwrap());

    let store = SqliteSnapshotStore::open(&path).unwrap();
    assert_eq!(store.checkpoint_ids().unwrap().len(), 2);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn mismatched_schema_is_refused_without_restarts() {
    let store = shared(Box::new(InMemSnapshotStore::new()));
    JobRunner::new(
        plain_job(),
        config(1, 2),
        TestingInput::new(readings(5, 1)),
        TestingOutput::new(),
    )
    .unwrap()
    .with_snapshot_store(store.clone())
    .run_blocking()
    .unwrap();

    let bumped = Job::builder("sums", |record: &Reading| StateKey::new(record.0.clone()))
        .state(summing())
        .schema_version(2)
        .build()
        .unwrap();
    let err = JobRunner::new(
        bumped,
        config(1, 2),
        TestingInput::new(readings(5, 1)),
        TestingOutput::new(),
    )
    .unwrap()
    .with_snapshot_store(store.clone())
    .run_blocking()
    .unwrap_err();
    assert!(matches!(err, EngineError::IncompatibleSchema(_)));

    // The refused run left the durable snapshot alone.
    let latest = store.lock().unwrap().load_latest().unwrap().unwrap();
    assert_eq!(latest.schema.version, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn aborted_checkpoint_does_not_stall_records() {
    let records = readings(30, 9);
    let expected = running_totals(&records);
    let mut config = config(2, 2);
    config.checkpoint.ack_timeout_ms = 100;
    let runner = JobRunner::new(
        job_with(SlowOnce {
            seq: 3,
            slept: AtomicBool::new(false),
            pause: Duration::from_millis(500),
        }),
        config,
        TestingInput::new(records),
        TestingOutput::new(),
    )
    .unwrap()
    .with_snapshot_store(shared(Box::new(InMemSnapshotStore::new())));
    let report = runner.run().await.unwrap();

    let aborted: usize = report
        .checkpoints
        .iter()
        .map(|checkpoints| checkpoints.aborted.len())
        .sum();
    assert!(aborted > 0);
    for (city, totals) in &expected {
        assert_eq!(
            report.value(&StateKey::new(city.as_str()), &StateName::new("sum")),
            totals.last()
        );
    }
}

#[test]
fn infinite_sum_restores_after_checkpoint() {
    let job = || {
        Job::builder("float-sums", |record: &(String, f64)| StateKey::new(record.0.clone()))
            .state(StateDescriptor::new(
                "sum",
                ReducePolicy::new(0.0, |record: &(String, f64)| record.1, |a, b| Ok(a + b)),
            ))
            .build()
            .unwrap()
    };
    let records = vec![("SZ".to_string(), f64::MAX), ("SZ".to_string(), f64::MAX)];
    let store = shared(Box::new(InMemSnapshotStore::new()));
    let sum = StateName::new("sum");

    let first = JobRunner::new(
        job(),
        config(1, 1),
        TestingInput::new(records.clone()),
        TestingOutput::new(),
    )
    .unwrap()
    .with_snapshot_store(store.clone())
    .run_blocking()
    .unwrap();
    assert_eq!(first.value(&StateKey::new("SZ"), &sum), Some(&f64::INFINITY));
    assert!(first.last_durable().is_some());

    let resumed = JobRunner::new(
        job(),
        config(1, 1),
        TestingInput::new(records),
        TestingOutput::new(),
    )
    .unwrap()
    .with_snapshot_store(store)
    .run_blocking()
    .unwrap();
    assert_eq!(resumed.records_applied, 0);
    assert_eq!(resumed.value(&StateKey::new("SZ"), &sum), Some(&f64::INFINITY));
}

#[test]
fn unwritable_store_fails_job_through_supervisor() {
    let mut config = config(2, 2);
    config.checkpoint.tolerable_failed_checkpoints = 1;
    let output = TestingOutput::new();
    let err = JobRunner::new(
        plain_job(),
        config,
        TestingInput::new(readings(40, 2)),
        output.clone(),
    )
    .unwrap()
    .with_snapshot_store(shared(Box::new(FullDisk)))
    .run_blocking()
    .unwrap_err();

    match err {
        EngineError::RestartBudgetExhausted { failures, causes } => {
            assert_eq!(failures, 4);
            assert!(causes
                .iter()
                .all(|cause| cause.contains("could not be persisted")));
        }
        other => panic!("expected exhausted restart budget, got {other:?}"),
    }
    // Nothing was ever durable, so nothing reached the sink.
    assert!(output.collected().is_empty());
}
