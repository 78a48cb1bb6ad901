//! Keyed aggregation state engine.
//!
//! For every distinct key in a stream the engine keeps one accumulator
//! per declared state, folds each record into it with a combine
//! policy, and emits the running value downstream. Accumulators are
//! checkpointed with barrier-aligned snapshots so a failed execution
//! restarts from the last durable checkpoint without losing or
//! double-counting records.
//!
//! The pieces, leaves first:
//!
//! - [`state`]: the per-worker accumulator store and keyed state
//!   handles.
//! - [`operators`]: combine policies, reduce and aggregate-with-merge.
//! - [`job`]: what a job keys by, which states it declares and what it
//!   does with each record.
//! - [`recovery`]: snapshot model, snapshot stores and the checkpoint
//!   coordinator.
//! - [`execution`]: workers, the key router, restart supervision and
//!   [`execution::JobRunner`].
//! - [`inputs`] and [`outputs`]: source and sink interfaces with
//!   testing implementations.
//!
//! ```no_run
//! use stateflow::config::EngineConfig;
//! use stateflow::demos::reducing_job;
//! use stateflow::execution::JobRunner;
//! use stateflow::inputs::CityInput;
//! use stateflow::outputs::StdOutput;
//!
//! let input = CityInput::new(0, chrono::Utc::now()).limit(100);
//! let runner = JobRunner::new(reducing_job().unwrap(), EngineConfig::default(), input, StdOutput)
//!     .unwrap();
//! runner.run_blocking().unwrap();
//! ```

pub mod config;
pub mod demos;
pub mod errors;
pub mod execution;
pub mod inputs;
pub mod job;
pub mod metrics;
pub mod operators;
pub mod outputs;
pub mod recovery;
pub mod state;
pub mod tracing;

pub use errors::{EngineError, EngineResult};
pub use execution::{JobReport, JobRunner};
pub use job::Job;
