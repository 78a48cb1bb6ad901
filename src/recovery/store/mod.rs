//! Durable snapshot stores.
//!
//! A store keeps completed snapshots and a recovery pointer to the
//! latest one. Writing a snapshot and moving the pointer is atomic: a
//! reader never sees the pointer reference a snapshot that is not
//! completely written.

use std::sync::{Arc, Mutex};

use crate::config::StorageTarget;
use crate::errors::EngineResult;
use crate::recovery::model::PersistedSnapshot;

pub mod in_mem;
pub mod sqlite;

pub use in_mem::*;
pub use sqlite::*;

pub trait SnapshotStore: Send {
    /// Durably write a completed snapshot, then point recovery at it.
    ///
    /// A snapshot with an id that is already stored replaces it. If
    /// this returns an error the recovery pointer has not moved.
    fn write(&mut self, snapshot: &PersistedSnapshot) -> EngineResult<()>;

    /// Snapshot the recovery pointer references, if any.
    fn load_latest(&self) -> EngineResult<Option<PersistedSnapshot>>;

    /// Discard all but the `retain` most recent snapshots. The
    /// snapshot the recovery pointer references is always kept.
    fn gc(&mut self, retain: usize) -> EngineResult<()>;
}

/// A store shared between the job runner and the checkpoint
/// coordinator. Only locked from blocking contexts.
pub type SharedSnapshotStore = Arc<Mutex<Box<dyn SnapshotStore>>>;

pub fn build_store(target: &StorageTarget) -> EngineResult<Box<dyn SnapshotStore>> {
    match target {
        StorageTarget::InMemory => Ok(Box::new(InMemSnapshotStore::new())),
        StorageTarget::Sqlite { path } => Ok(Box::new(SqliteSnapshotStore::open(path)?)),
    }
}

pub fn shared(store: Box<dyn SnapshotStore>) -> SharedSnapshotStore {
    Arc::new(Mutex::new(store))
}
