//! Sources of the current time for the restart supervisor.

use std::fmt::Debug;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

pub trait Clock: Debug + Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Uses the current system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Only advances when told to.
#[derive(Debug)]
pub struct TestingClock {
    current_time: Mutex<DateTime<Utc>>,
}

impl TestingClock {
    pub fn new(start_at: DateTime<Utc>) -> Self {
        Self {
            current_time: Mutex::new(start_at),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut current_time = self
            .current_time
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *current_time = *current_time + by;
    }
}

impl Clock for TestingClock {
    fn now(&self) -> DateTime<Utc> {
        *self
            .current_time
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[test]
fn testing_clock_only_moves_when_advanced() {
    use chrono::TimeZone;

    let start_at = Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap();
    let clock = TestingClock::new(start_at);
    assert_eq!(clock.now(), start_at);
    clock.advance(Duration::minutes(4));
    assert_eq!(clock.now(), start_at + Duration::minutes(4));
}
