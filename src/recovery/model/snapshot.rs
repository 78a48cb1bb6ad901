//! The durable snapshot container.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    CheckpointId, ResumeFrom, SourceOffset, StateBytes, StateKey, StateName, StateSchema, StoreKey,
};
use crate::errors::{config_err, EngineError, EngineException, EngineResult};
use crate::state::{Accumulator, StoreSnapshot};

/// Layout version of [`PersistedSnapshot`]. Snapshots with any other
/// version are refused on restore.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Guarantee the engine gives to the sink.
///
/// State updates are exactly-once in both modes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointMode {
    /// Outputs are held back until a checkpoint covering them is
    /// durable, so replayed records never reach the sink twice.
    ExactlyOnce,
    /// Outputs are written as soon as they are produced.
    AtLeastOnce,
}

impl Default for CheckpointMode {
    fn default() -> Self {
        Self::ExactlyOnce
    }
}

impl fmt::Display for CheckpointMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExactlyOnce => write!(f, "exactly_once"),
            Self::AtLeastOnce => write!(f, "at_least_once"),
        }
    }
}

impl FromStr for CheckpointMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exactly_once" | "EXACTLY_ONCE" => Ok(Self::ExactlyOnce),
            "at_least_once" | "AT_LEAST_ONCE" => Ok(Self::AtLeastOnce),
            other => Err(config_err(&format!("unknown checkpoint mode {other:?}"))),
        }
    }
}

/// A completed checkpoint as written to a snapshot store.
///
/// Immutable once written; the store's recovery pointer references
/// exactly one of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSnapshot {
    pub format_version: u32,
    pub schema: StateSchema,
    pub checkpoint_id: CheckpointId,
    pub source_offset: SourceOffset,
    pub mode: CheckpointMode,
    pub taken_at: DateTime<Utc>,
    pub states: BTreeMap<StateName, BTreeMap<StateKey, StateBytes>>,
}

impl PersistedSnapshot {
    /// Serialize every accumulator of a store snapshot.
    pub fn encode<A: Accumulator>(
        checkpoint_id: CheckpointId,
        source_offset: SourceOffset,
        mode: CheckpointMode,
        schema: StateSchema,
        snapshot: &StoreSnapshot<A>,
    ) -> EngineResult<Self> {
        let mut states: BTreeMap<StateName, BTreeMap<StateKey, StateBytes>> = schema
            .states
            .iter()
            .map(|(name, _discipline)| (name.clone(), BTreeMap::new()))
            .collect();
        for (StoreKey(name, key), acc) in snapshot.iter() {
            let bytes = StateBytes::ser(acc)?;
            // A value that would not restore must never become durable.
            bytes.de::<A>().map_err(|err| {
                EngineError::Store(format!("accumulator {name}/{key} would not restore: {err}"))
            })?;
            states.entry(name.clone()).or_default().insert(key.clone(), bytes);
        }
        Ok(Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            schema,
            checkpoint_id,
            source_offset,
            mode,
            taken_at: snapshot.taken_at(),
            states,
        })
    }

    /// Check this snapshot can be loaded by a job with the given
    /// schema, then deserialize every accumulator.
    ///
    /// Nothing is returned unless every entry decodes.
    pub fn decode<A: Accumulator>(&self, expected: &StateSchema) -> EngineResult<StoreSnapshot<A>> {
        if self.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(EngineError::IncompatibleSchema(format!(
                "snapshot {} has format version {}; this build reads version {}",
                self.checkpoint_id, self.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }
        if &self.schema != expected {
            return Err(EngineError::IncompatibleSchema(format!(
                "snapshot {} was written with schema {:?}; job declares {:?}",
                self.checkpoint_id, self.schema, expected
            )));
        }
        let mut entries = Vec::new();
        for (name, keyed) in &self.states {
            if !expected.contains(name) {
                return Err(EngineError::CorruptSnapshot(format!(
                    "snapshot {} holds state {name} missing from its schema",
                    self.checkpoint_id
                )));
            }
            for (key, bytes) in keyed {
                let acc: A = bytes.de()?;
                entries.push((StoreKey(name.clone(), key.clone()), Arc::new(acc)));
            }
        }
        Ok(StoreSnapshot::from_entries(self.taken_at, entries))
    }

    pub fn resume_from(&self) -> ResumeFrom {
        ResumeFrom(self.checkpoint_id, self.source_offset)
    }

    pub fn to_json(&self) -> EngineResult<String> {
        serde_json::to_string(self)
            .map_err(|err| EngineError::Store(format!("error encoding snapshot: {err}")))
    }

    pub fn from_json(json: &str) -> EngineResult<Self> {
        serde_json::from_str(json).reraise("error decoding persisted snapshot")
    }
}
