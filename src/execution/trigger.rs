//! Deciding when the router starts a checkpoint.

use std::time::{Duration, Instant};

use crate::config::CheckpointConfig;

pub(crate) trait CheckpointTrigger: Send {
    /// Note that a record was handed to a worker.
    fn record_dispatched(&mut self);

    /// Should a checkpoint start now? Answering yes starts the next
    /// interval.
    fn should_trigger(&mut self) -> bool;
}

/// Checkpoint at regular system time intervals.
pub(crate) struct PeriodicTrigger {
    interval: Duration,
    interval_started: Instant,
}

impl PeriodicTrigger {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            interval_started: Instant::now(),
        }
    }
}

impl CheckpointTrigger for PeriodicTrigger {
    fn record_dispatched(&mut self) {}

    fn should_trigger(&mut self) -> bool {
        let advance = self.interval_started.elapsed() > self.interval;
        if advance {
            self.interval_started = Instant::now();
        }
        advance
    }
}

/// Checkpoint after every N records.
///
/// Deterministic, so tests know exactly which records each checkpoint
/// covers.
pub(crate) struct TestingTrigger {
    every: u64,
    dispatched: u64,
}

impl TestingTrigger {
    pub(crate) fn new(every: u64) -> Self {
        Self {
            every: every.max(1),
            dispatched: 0,
        }
    }
}

impl CheckpointTrigger for TestingTrigger {
    fn record_dispatched(&mut self) {
        self.dispatched += 1;
    }

    fn should_trigger(&mut self) -> bool {
        if self.dispatched >= self.every {
            self.dispatched = 0;
            true
        } else {
            false
        }
    }
}

pub(crate) fn build_trigger(config: &CheckpointConfig) -> Box<dyn CheckpointTrigger> {
    match config.every_records {
        Some(every) => Box::new(TestingTrigger::new(every)),
        None => Box::new(PeriodicTrigger::new(config.interval())),
    }
}

#[test]
fn testing_trigger_fires_every_n() {
    let mut trigger = TestingTrigger::new(2);
    let mut fired = Vec::new();
    for _ in 0..5 {
        trigger.record_dispatched();
        fired.push(trigger.should_trigger());
    }
    assert_eq!(fired, vec![false, true, false, true, false]);
}

#[test]
fn periodic_trigger_waits_for_interval() {
    let mut trigger = PeriodicTrigger::new(Duration::from_secs(3600));
    trigger.record_dispatched();
    assert!(!trigger.should_trigger());

    let mut trigger = PeriodicTrigger::new(Duration::ZERO);
    std::thread::sleep(Duration::from_millis(2));
    assert!(trigger.should_trigger());
}
