//! Engine error type and helpers for adding call-site context.

use std::panic::Location;

use thiserror::Error;

use crate::recovery::model::{CheckpointId, StateKey, StateName};

/// Error returned by user-supplied functions (combine rules, key
/// functions, handlers).
pub type UserError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// A record arrived at a worker that does not own its key.
    #[error("record with key {key} can not be routed: {reason}")]
    KeyRouting { key: StateKey, reason: String },
    #[error("combine function of state {state} failed for key {key}: {cause}")]
    Combine {
        state: StateName,
        key: StateKey,
        cause: String,
    },
    #[error("state {state} does not support merging accumulators")]
    NotMergeable { state: StateName },
    #[error("state {state} was accessed without a current key")]
    IllegalStateAccess { state: StateName },
    #[error("state {state} was never declared")]
    UndeclaredState { state: StateName },
    #[error("state {state} was declared more than once")]
    DuplicateState { state: StateName },
    #[error("checkpoint {id} timed out waiting on {missing} acknowledgement(s)")]
    CheckpointTimeout { id: CheckpointId, missing: usize },
    #[error("corrupt snapshot: {0}")]
    CorruptSnapshot(String),
    #[error("incompatible snapshot: {0}")]
    IncompatibleSchema(String),
    #[error("restart budget exhausted after {failures} failures; last causes: {causes:?}")]
    RestartBudgetExhausted {
        failures: usize,
        causes: Vec<String>,
    },
    #[error("snapshot store error: {0}")]
    Store(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("telemetry setup failed: {0}")]
    Telemetry(String),
    #[error("worker {0} stopped unexpectedly")]
    WorkerLost(usize),
}

impl EngineError {
    /// Can the supervisor recover from this by restarting from the
    /// last durable checkpoint?
    ///
    /// Setup and restore errors will fail again on every restart, so
    /// they do not consume the restart budget.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::KeyRouting { .. }
            | Self::Combine { .. }
            | Self::CheckpointTimeout { .. }
            | Self::Store(_)
            | Self::WorkerLost(_) => true,
            Self::NotMergeable { .. }
            | Self::IllegalStateAccess { .. }
            | Self::UndeclaredState { .. }
            | Self::DuplicateState { .. }
            | Self::CorruptSnapshot(_)
            | Self::IncompatibleSchema(_)
            | Self::RestartBudgetExhausted { .. }
            | Self::Config(_)
            | Self::Telemetry(_) => false,
        }
    }
}

/// Wrap a foreign error into an [`EngineError`], keeping the original
/// message and recording where it was converted.
pub(crate) trait EngineException<T> {
    /// Only this needs to be implemented.
    fn into_engine_result(self, msg: String) -> EngineResult<T>;

    /// Make the existing error the cause of an engine error with an
    /// additional message.
    ///
    /// Example:
    ///     txn.commit().reraise("error committing snapshot")?;
    #[track_caller]
    fn reraise(self, msg: &str) -> EngineResult<T>
    where
        Self: Sized,
    {
        let caller = Location::caller();
        self.into_engine_result(prepend_caller(caller, msg))
    }
}

impl<T> EngineException<T> for Result<T, rusqlite::Error> {
    fn into_engine_result(self, msg: String) -> EngineResult<T> {
        self.map_err(|err| EngineError::Store(build_message(&msg, &err)))
    }
}

impl<T> EngineException<T> for Result<T, rusqlite_migration::Error> {
    fn into_engine_result(self, msg: String) -> EngineResult<T> {
        self.map_err(|err| EngineError::Store(build_message(&msg, &err)))
    }
}

/// JSON errors only happen when decoding stored data we wrote
/// ourselves, so they mean the data is damaged.
impl<T> EngineException<T> for Result<T, serde_json::Error> {
    fn into_engine_result(self, msg: String) -> EngineResult<T> {
        self.map_err(|err| EngineError::CorruptSnapshot(build_message(&msg, &err)))
    }
}

/// Accumulator bytes that do not decode are damaged.
impl<T> EngineException<T> for Result<T, bincode::Error> {
    fn into_engine_result(self, msg: String) -> EngineResult<T> {
        self.map_err(|err| EngineError::CorruptSnapshot(build_message(&msg, &err)))
    }
}

impl<T> EngineException<T> for Result<T, chrono::ParseError> {
    fn into_engine_result(self, msg: String) -> EngineResult<T> {
        self.map_err(|err| EngineError::CorruptSnapshot(build_message(&msg, &err)))
    }
}

impl<T> EngineException<T> for Result<T, tracing::subscriber::SetGlobalDefaultError> {
    fn into_engine_result(self, msg: String) -> EngineResult<T> {
        self.map_err(|err| EngineError::Telemetry(build_message(&msg, &err)))
    }
}

impl<T> EngineException<T> for Result<T, opentelemetry::metrics::MetricsError> {
    fn into_engine_result(self, msg: String) -> EngineResult<T> {
        self.map_err(|err| EngineError::Telemetry(build_message(&msg, &err)))
    }
}

/// Build a [`EngineError::Config`] with location tracking.
#[track_caller]
pub(crate) fn config_err(msg: &str) -> EngineError {
    let caller = Location::caller();
    EngineError::Config(prepend_caller(caller, msg))
}

fn build_message(msg: &str, err: &dyn std::fmt::Display) -> String {
    format!("{msg}\nCaused by => {err}")
}

/// Prepend '({caller}) ' to the message
fn prepend_caller(caller: &Location, msg: &str) -> String {
    format!("({caller}) {msg}")
}

#[test]
fn reraise_keeps_cause_and_location() {
    let res: Result<(), rusqlite::Error> = Err(rusqlite::Error::InvalidQuery);
    let err = res.reraise("error writing snapshot").unwrap_err();
    match err {
        EngineError::Store(msg) => {
            assert!(msg.starts_with("(src/errors.rs:"));
            assert!(msg.contains("error writing snapshot"));
            assert!(msg.contains("Caused by => "));
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn recoverable_classification() {
    let combine = EngineError::Combine {
        state: StateName::new("sum"),
        key: StateKey::new("SZ"),
        cause: "boom".into(),
    };
    assert!(combine.is_recoverable());
    assert!(EngineError::WorkerLost(1).is_recoverable());
    assert!(!EngineError::NotMergeable {
        state: StateName::new("sum")
    }
    .is_recoverable());
    assert!(!EngineError::IncompatibleSchema("v2".into()).is_recoverable());
}
