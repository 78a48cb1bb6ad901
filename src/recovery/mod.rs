//! Checkpointing and recovery of keyed state.
//!
//! Overview
//! --------
//!
//! Every worker keeps the accumulators of the keys it owns in an
//! [`crate::state::AccumulatorStore`]. Periodically the router asks the
//! [`coordinator`] for a new checkpoint attempt, then injects a
//! **barrier** into every worker channel right after the last record
//! it has read from the source. Because worker channels are FIFO, a
//! worker that sees the barrier has applied exactly the records read
//! before it and none after, so the snapshot it takes at that moment
//! is consistent with the source offset recorded for the attempt.
//!
//! Snapshots are cheap: the store holds accumulators behind shared
//! pointers, so a snapshot is a copy of pointers and later updates
//! replace entries instead of mutating them.
//!
//! Once every worker has acknowledged, the coordinator assembles one
//! [`model::PersistedSnapshot`] and writes it to a
//! [`store::SnapshotStore`] off the record path. The store moves its
//! recovery pointer only after the snapshot is completely written. An
//! attempt missing acknowledgements past the ack timeout is aborted;
//! records keep flowing and the previous durable checkpoint stays the
//! recovery point.
//!
//! Resuming
//! --------
//!
//! A new execution loads the snapshot the recovery pointer references,
//! checks its format version and state schema against the job, hands
//! every worker the keys it owns under the current parallelism, and
//! rebuilds the source at the snapshot's offset. Checkpoint ids
//! continue after the resumed one.
//!
//! Outputs
//! -------
//!
//! In [`model::CheckpointMode::ExactlyOnce`] mode outputs are held by
//! the coordinator and released only when a checkpoint covering the
//! records that produced them is durable. Records replayed after a
//! restart therefore never produce duplicate sink writes. In
//! [`model::CheckpointMode::AtLeastOnce`] mode workers write outputs
//! immediately.

pub(crate) mod coordinator;
pub mod model;
pub mod store;

pub use coordinator::{CheckpointPhase, CoordinatorReport};
