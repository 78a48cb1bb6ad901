//! Snapshot store with all data in memory.
//!
//! Survives restarts of a job within one process, which is all the
//! default configuration needs. Snapshots are kept as encoded JSON so
//! restores exercise the same decoding as durable stores.

use std::collections::BTreeMap;

use super::SnapshotStore;
use crate::errors::{EngineError, EngineResult};
use crate::recovery::model::*;

#[derive(Debug, Default)]
pub struct InMemSnapshotStore {
    snaps: BTreeMap<CheckpointId, String>,
    latest: Option<CheckpointId>,
}

impl InMemSnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids of every stored snapshot, oldest first.
    pub fn checkpoint_ids(&self) -> Vec<CheckpointId> {
        self.snaps.keys().copied().collect()
    }

    pub fn latest_id(&self) -> Option<CheckpointId> {
        self.latest
    }

    /// Store already encoded snapshot text and point recovery at it.
    pub fn write_encoded(&mut self, id: CheckpointId, encoded: String) {
        self.snaps.insert(id, encoded);
        self.latest = Some(id);
    }
}

impl SnapshotStore for InMemSnapshotStore {
    fn write(&mut self, snapshot: &PersistedSnapshot) -> EngineResult<()> {
        // Encode first so a failure leaves the pointer alone.
        let encoded = snapshot.to_json()?;
        tracing::trace!(
            "Writing snapshot {} ({} bytes)",
            snapshot.checkpoint_id,
            encoded.len()
        );
        self.write_encoded(snapshot.checkpoint_id, encoded);
        Ok(())
    }

    fn load_latest(&self) -> EngineResult<Option<PersistedSnapshot>> {
        match self.latest {
            None => Ok(None),
            Some(id) => {
                let encoded = self.snaps.get(&id).ok_or_else(|| {
                    EngineError::CorruptSnapshot(format!(
                        "recovery pointer references missing snapshot {id}"
                    ))
                })?;
                PersistedSnapshot::from_json(encoded).map(Some)
            }
        }
    }

    fn gc(&mut self, retain: usize) -> EngineResult<()> {
        let retain = retain.max(1);
        while self.snaps.len() > retain {
            let oldest = match self.snaps.keys().next() {
                Some(oldest) => *oldest,
                None => break,
            };
            if Some(oldest) == self.latest {
                break;
            }
            tracing::trace!("GC snapshot {oldest}");
            self.snaps.remove(&oldest);
        }
        Ok(())
    }
}
