//! Data model representing state in the engine.

use std::any::type_name;
use std::fmt;
use std::hash::Hasher;

use seahash::SeaHasher;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, EngineException, EngineResult};
use crate::execution::{WorkerCount, WorkerIndex};

/// Name of one piece of state declared by a processing task.
///
/// A task can declare several independent states; accumulators are
/// never shared between names.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateName(pub String);

impl StateName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl From<&str> for StateName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl fmt::Display for StateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Key to route records and partition state.
///
/// We place restraints on this, rather than allowing any key type,
/// because the key is routed between workers, written into snapshots
/// and printed in logs: it has to be hashable, have equality, be
/// ordered and serde-able.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateKey(pub String);

impl StateKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Hash this key to find the worker that owns it.
    ///
    /// Uses [`SeaHasher`] so the assignment is stable across
    /// processes and restarts.
    pub fn route(&self, count: WorkerCount) -> EngineResult<WorkerIndex> {
        if count.0 == 0 {
            return Err(EngineError::KeyRouting {
                key: self.clone(),
                reason: "there are no workers to route to".to_string(),
            });
        }
        let mut hasher = SeaHasher::new();
        hasher.write(self.0.as_bytes());
        let index = hasher.finish() % count.0 as u64;
        Ok(WorkerIndex(index as usize))
    }
}

impl From<&str> for StateKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Coordinate of a single accumulator in the store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StoreKey(pub StateName, pub StateKey);

impl StoreKey {
    pub fn name(&self) -> &StateName {
        &self.0
    }

    pub fn key(&self) -> &StateKey {
        &self.1
    }
}

/// A serialized accumulator.
///
/// Encoded with bincode, which keeps every value a type can hold
/// (including non-finite floats) so anything written can be read back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateBytes(pub Vec<u8>);

impl StateBytes {
    /// Serialize an accumulator into bytes the recovery system can
    /// store.
    pub fn ser<T: Serialize>(obj: &T) -> EngineResult<Self> {
        bincode::serialize(obj).map(Self).map_err(|err| {
            let t_name = type_name::<T>();
            EngineError::Store(format!("error serializing state type {t_name}: {err}"))
        })
    }

    /// Deserialize these bytes from the recovery system into an
    /// accumulator.
    pub fn de<T: DeserializeOwned>(&self) -> EngineResult<T> {
        let t_name = type_name::<T>();
        bincode::deserialize(&self.0).reraise(&format!("error deserializing state type {t_name}"))
    }
}

/// Which combining discipline a declared state uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Discipline {
    Reduce,
    AggregateWithMerge,
}

/// Describes the states a job declares, in declaration order.
///
/// Written into every snapshot so a restore can refuse state written
/// by a differently shaped job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSchema {
    /// Bumped by the job author when accumulator types change.
    pub version: u32,
    pub states: Vec<(StateName, Discipline)>,
}

impl StateSchema {
    pub fn contains(&self, name: &StateName) -> bool {
        self.states.iter().any(|(declared, _)| declared == name)
    }
}

#[test]
fn state_key_serializes_as_string() {
    use serde_test::{assert_tokens, Token};

    assert_tokens(&StateKey::new("SZ"), &[Token::Str("SZ")]);
    assert_tokens(&StateName::new("sum"), &[Token::Str("sum")]);
}

#[test]
fn discipline_serializes_snake_case() {
    use serde_test::{assert_tokens, Token};

    assert_tokens(
        &Discipline::AggregateWithMerge,
        &[Token::UnitVariant {
            name: "Discipline",
            variant: "aggregate_with_merge",
        }],
    );
}

#[test]
fn route_is_stable_and_in_range() {
    let count = WorkerCount(4);
    for city in ["SZ", "BJ", "SH", "GZ", ""] {
        let key = StateKey::new(city);
        let first = key.route(count).unwrap();
        assert!(first.0 < 4);
        assert_eq!(first, key.route(count).unwrap());
    }
}

#[test]
fn route_with_no_workers_errors() {
    let err = StateKey::new("SZ").route(WorkerCount(0)).unwrap_err();
    assert!(matches!(err, EngineError::KeyRouting { .. }));
}

#[test]
fn state_bytes_decode_failure_is_corrupt() {
    let bytes = StateBytes(vec![0xff]);
    let err = bytes.de::<i64>().unwrap_err();
    assert!(matches!(err, EngineError::CorruptSnapshot(_)));
    assert_eq!(StateBytes::ser(&42_i64).unwrap().de::<i64>().unwrap(), 42);
}

#[test]
fn state_bytes_keep_non_finite_floats() {
    for value in [f64::INFINITY, f64::NEG_INFINITY] {
        assert_eq!(StateBytes::ser(&value).unwrap().de::<f64>().unwrap(), value);
    }
    assert!(StateBytes::ser(&f64::NAN).unwrap().de::<f64>().unwrap().is_nan());
}
