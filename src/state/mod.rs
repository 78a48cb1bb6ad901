//! Keyed accumulator state.
//!
//! The [`AccumulatorStore`] owns one accumulator per (state name,
//! key) coordinate on a worker. Processing tasks never touch it
//! directly; they go through a [`KeyedStateHandle`] per declared
//! state, which applies the state's combine policy under the current
//! key of a [`KeyContext`].

use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub mod handle;
pub mod store;

pub use handle::*;
pub use store::*;

/// Anything that flows through the engine: records and outputs.
pub trait Data: Debug + Send + Sync + 'static {}

impl<T> Data for T where T: Debug + Send + Sync + 'static {}

/// Accumulators are cloned for copy-on-write updates and serialized
/// into snapshots.
pub trait Accumulator: Data + Clone + Serialize + DeserializeOwned {}

impl<T> Accumulator for T where T: Data + Clone + Serialize + DeserializeOwned {}
