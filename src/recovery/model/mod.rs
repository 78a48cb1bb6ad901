//! The data model for recovery.
//!
//! [`state`] names the coordinates of accumulators and their
//! serialized form, [`progress`] tracks how far the source and the
//! checkpoints got, and [`snapshot`] combines both into the durable
//! container written by the snapshot stores.

pub mod progress;
pub mod snapshot;
pub mod state;

// Re-export so you can get the whole model at once.

pub use progress::*;
pub use snapshot::*;
pub use state::*;
