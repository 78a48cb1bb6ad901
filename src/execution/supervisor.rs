//! Failure-rate restart policy.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Clock;
use crate::config::RestartConfig;
use crate::errors::{config_err, EngineError, EngineResult};

/// How many failure causes are kept for the terminal error.
const KEPT_CAUSES: usize = 5;

/// Lifecycle of a supervised job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Restarting,
    Finished,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Running => "running",
            Self::Restarting => "restarting",
            Self::Finished => "finished",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What to do after an execution failed.
#[derive(Debug, Clone)]
pub enum RestartDecision {
    /// Wait `delay` then resume from the last durable checkpoint.
    Restart { delay: Duration },
    /// The job is terminally failed.
    Fail(EngineError),
}

/// Allows up to `max_failures` restarts within a sliding window.
///
/// A failure restarts the job when fewer than `max_failures` earlier
/// failures happened within the window before it. Failures older than
/// the window are forgotten, so a quiet period restores the full
/// budget.
#[derive(Debug)]
pub struct RestartSupervisor {
    max_failures: usize,
    window: chrono::Duration,
    delay: Duration,
    clock: Arc<dyn Clock>,
    failures: VecDeque<DateTime<Utc>>,
    causes: VecDeque<String>,
    restarts: usize,
    status: JobStatus,
}

impl RestartSupervisor {
    pub fn new(config: &RestartConfig, clock: Arc<dyn Clock>) -> EngineResult<Self> {
        let window = chrono::Duration::from_std(config.window())
            .map_err(|err| config_err(&format!("invalid restart window: {err}")))?;
        Ok(Self {
            max_failures: config.max_failures,
            window,
            delay: config.delay(),
            clock,
            failures: VecDeque::new(),
            causes: VecDeque::new(),
            restarts: 0,
            status: JobStatus::Running,
        })
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    /// Restarts granted so far.
    pub fn restarts(&self) -> usize {
        self.restarts
    }

    /// Failures still inside the window.
    pub fn recent_failures(&self) -> usize {
        self.failures.len()
    }

    /// Record a failed execution and decide what happens next.
    pub fn on_failure(&mut self, cause: &EngineError) -> RestartDecision {
        if !cause.is_recoverable() {
            tracing::error!("Execution failed with non-recoverable error: {cause}");
            self.status = JobStatus::Failed;
            return RestartDecision::Fail(cause.clone());
        }

        let now = self.clock.now();
        self.status = JobStatus::Restarting;
        while let Some(oldest) = self.failures.front() {
            if now - *oldest > self.window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
        let earlier = self.failures.len();
        self.failures.push_back(now);
        self.causes.push_back(cause.to_string());
        while self.causes.len() > KEPT_CAUSES {
            self.causes.pop_front();
        }

        if earlier < self.max_failures {
            self.restarts += 1;
            tracing::warn!(
                "Execution failed ({} of {} allowed in window); restarting in {:?}: {cause}",
                earlier + 1,
                self.max_failures,
                self.delay
            );
            RestartDecision::Restart { delay: self.delay }
        } else {
            self.status = JobStatus::Failed;
            tracing::error!("Restart budget exhausted; failing job: {cause}");
            RestartDecision::Fail(EngineError::RestartBudgetExhausted {
                failures: self.failures.len(),
                causes: self.causes.iter().cloned().collect(),
            })
        }
    }

    /// A restarted execution is running again.
    pub fn resumed(&mut self) {
        self.status = JobStatus::Running;
    }

    pub fn finished(&mut self) {
        self.status = JobStatus::Finished;
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::execution::TestingClock;

    fn supervisor(clock: Arc<TestingClock>) -> RestartSupervisor {
        RestartSupervisor::new(&RestartConfig::default(), clock).unwrap()
    }

    fn clock() -> Arc<TestingClock> {
        Arc::new(TestingClock::new(
            Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap(),
        ))
    }

    fn failure() -> EngineError {
        EngineError::WorkerLost(0)
    }

    #[test]
    fn three_failures_restart_fourth_fails() {
        let clock = clock();
        let mut supervisor = supervisor(clock.clone());

        for _ in 0..3 {
            assert!(matches!(
                supervisor.on_failure(&failure()),
                RestartDecision::Restart { .. }
            ));
            supervisor.resumed();
            assert_eq!(supervisor.status(), JobStatus::Running);
            clock.advance(chrono::Duration::minutes(1));
        }

        match supervisor.on_failure(&failure()) {
            RestartDecision::Fail(EngineError::RestartBudgetExhausted { failures, causes }) => {
                assert_eq!(failures, 4);
                assert_eq!(causes.len(), 4);
            }
            other => panic!("unexpected decision {other:?}"),
        }
        assert_eq!(supervisor.status(), JobStatus::Failed);
        assert_eq!(supervisor.restarts(), 3);
    }

    #[test]
    fn budget_recovers_after_window() {
        let clock = clock();
        let mut supervisor = supervisor(clock.clone());

        for _ in 0..3 {
            supervisor.on_failure(&failure());
            supervisor.resumed();
        }
        clock.advance(chrono::Duration::minutes(11));
        assert!(matches!(
            supervisor.on_failure(&failure()),
            RestartDecision::Restart { .. }
        ));
        assert_eq!(supervisor.recent_failures(), 1);
    }

    #[test]
    fn restart_waits_configured_delay() {
        let mut supervisor = supervisor(clock());
        match supervisor.on_failure(&failure()) {
            RestartDecision::Restart { delay } => assert_eq!(delay, Duration::from_secs(10)),
            other => panic!("unexpected decision {other:?}"),
        }
        assert_eq!(supervisor.status(), JobStatus::Restarting);
    }

    #[test]
    fn non_recoverable_does_not_consume_budget() {
        let mut supervisor = supervisor(clock());
        let decision = supervisor.on_failure(&EngineError::IncompatibleSchema("v2".into()));
        assert!(matches!(
            decision,
            RestartDecision::Fail(EngineError::IncompatibleSchema(_))
        ));
        assert_eq!(supervisor.recent_failures(), 0);
        assert_eq!(supervisor.status(), JobStatus::Failed);
    }

    #[test]
    fn keeps_only_latest_causes() {
        let config = RestartConfig {
            max_failures: 10,
            ..RestartConfig::default()
        };
        let mut supervisor = RestartSupervisor::new(&config, clock()).unwrap();
        for index in 0..11 {
            let decision = supervisor.on_failure(&EngineError::WorkerLost(index));
            if let RestartDecision::Fail(EngineError::RestartBudgetExhausted { causes, .. }) =
                decision
            {
                assert_eq!(causes.len(), KEPT_CAUSES);
                assert_eq!(causes.last().unwrap(), "worker 10 stopped unexpectedly");
                return;
            }
        }
        panic!("budget was never exhausted");
    }
}
