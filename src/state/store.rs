//! Per-worker accumulator storage.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::Accumulator;
use crate::errors::{EngineError, EngineResult};
use crate::execution::{WorkerCount, WorkerIndex};
use crate::recovery::model::{StateKey, StateName, StoreKey};

type DefaultFn<A> = Arc<dyn Fn() -> A + Send + Sync>;

/// Holds exactly one accumulator per (state name, key).
///
/// Entries are behind [`Arc`] so a snapshot is a copy of pointers:
/// updates replace the pointer and never mutate a value a snapshot
/// can see.
pub struct AccumulatorStore<A> {
    defaults: HashMap<StateName, DefaultFn<A>>,
    db: HashMap<StoreKey, Arc<A>>,
}

impl<A> fmt::Debug for AccumulatorStore<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccumulatorStore")
            .field("states", &self.defaults.keys().collect::<Vec<_>>())
            .field("entries", &self.db.len())
            .finish()
    }
}

impl<A> Default for AccumulatorStore<A> {
    fn default() -> Self {
        Self {
            defaults: HashMap::new(),
            db: HashMap::new(),
        }
    }
}

impl<A: Accumulator> AccumulatorStore<A> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a state name and the value its accumulators start
    /// from.
    pub fn declare(
        &mut self,
        name: StateName,
        default: impl Fn() -> A + Send + Sync + 'static,
    ) -> EngineResult<()> {
        match self.defaults.entry(name) {
            Entry::Occupied(entry) => Err(EngineError::DuplicateState {
                state: entry.key().clone(),
            }),
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(default));
                Ok(())
            }
        }
    }

    pub fn is_declared(&self, name: &StateName) -> bool {
        self.defaults.contains_key(name)
    }

    fn check_declared(&self, name: &StateName) -> EngineResult<()> {
        if self.is_declared(name) {
            Ok(())
        } else {
            Err(EngineError::UndeclaredState {
                state: name.clone(),
            })
        }
    }

    /// Current accumulator, created from the declared default on
    /// first touch.
    pub fn get(&mut self, key: &StateKey, name: &StateName) -> EngineResult<&A> {
        let default = self
            .defaults
            .get(name)
            .ok_or_else(|| EngineError::UndeclaredState {
                state: name.clone(),
            })?;
        let acc = self
            .db
            .entry(StoreKey(name.clone(), key.clone()))
            .or_insert_with(|| Arc::new(default()));
        Ok(&**acc)
    }

    /// Current accumulator without creating one.
    pub fn peek(&self, key: &StateKey, name: &StateName) -> Option<&A> {
        self.db
            .get(&StoreKey(name.clone(), key.clone()))
            .map(AsRef::as_ref)
    }

    pub fn put(&mut self, key: &StateKey, name: &StateName, acc: A) -> EngineResult<()> {
        self.check_declared(name)?;
        tracing::trace!("put {name}/{key} = {acc:?}");
        self.db
            .insert(StoreKey(name.clone(), key.clone()), Arc::new(acc));
        Ok(())
    }

    /// Drop the accumulator; the next [`get`](Self::get) starts from
    /// the default again.
    pub fn remove(&mut self, key: &StateKey, name: &StateName) -> EngineResult<Option<A>> {
        self.check_declared(name)?;
        tracing::trace!("remove {name}/{key}");
        Ok(self
            .db
            .remove(&StoreKey(name.clone(), key.clone()))
            .map(|acc| Arc::try_unwrap(acc).unwrap_or_else(|shared| shared.as_ref().clone())))
    }

    /// Fold a partial accumulator into the one stored at a
    /// coordinate, using the state's merge function.
    pub fn merge_entry(
        &mut self,
        key: &StateKey,
        name: &StateName,
        partial: A,
        merge: impl FnOnce(A, A) -> EngineResult<A>,
    ) -> EngineResult<()> {
        let current = self.get(key, name)?.clone();
        let merged = merge(current, partial)?;
        self.put(key, name, merged)
    }

    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }

    /// Keys holding an accumulator for one state.
    pub fn keys<'a>(&'a self, name: &'a StateName) -> impl Iterator<Item = &'a StateKey> + 'a {
        self.db
            .keys()
            .filter(move |coord| coord.name() == name)
            .map(StoreKey::key)
    }

    /// Point-in-time copy of every entry.
    ///
    /// Only pointers are copied; later updates do not show up in the
    /// returned snapshot.
    pub fn snapshot(&self) -> StoreSnapshot<A> {
        StoreSnapshot {
            taken_at: Utc::now(),
            entries: self.db.clone(),
        }
    }

    /// Replace the whole content of the store.
    ///
    /// The snapshot is validated before anything is touched: if it
    /// references an undeclared state the old content is kept.
    pub fn restore(&mut self, snapshot: &StoreSnapshot<A>) -> EngineResult<()> {
        if let Some(coord) = snapshot
            .entries
            .keys()
            .find(|coord| !self.is_declared(coord.name()))
        {
            return Err(EngineError::CorruptSnapshot(format!(
                "snapshot taken at {} holds undeclared state {}",
                snapshot.taken_at,
                coord.name()
            )));
        }
        self.db = snapshot.entries.clone();
        tracing::debug!("Restored {} accumulators", self.db.len());
        Ok(())
    }
}

/// Immutable, timestamped copy of accumulator entries.
#[derive(Debug, Clone)]
pub struct StoreSnapshot<A> {
    taken_at: DateTime<Utc>,
    entries: HashMap<StoreKey, Arc<A>>,
}

impl<A: Accumulator> StoreSnapshot<A> {
    pub fn empty() -> Self {
        Self {
            taken_at: Utc::now(),
            entries: HashMap::new(),
        }
    }

    pub fn from_entries(
        taken_at: DateTime<Utc>,
        entries: impl IntoIterator<Item = (StoreKey, Arc<A>)>,
    ) -> Self {
        Self {
            taken_at,
            entries: entries.into_iter().collect(),
        }
    }

    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }

    pub fn with_taken_at(mut self, taken_at: DateTime<Utc>) -> Self {
        self.taken_at = taken_at;
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &StateKey, name: &StateName) -> Option<&A> {
        self.entries
            .get(&StoreKey(name.clone(), key.clone()))
            .map(AsRef::as_ref)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&StoreKey, &A)> {
        self.entries
            .iter()
            .map(|(coord, acc)| (coord, acc.as_ref()))
    }

    /// Only the entries a given worker owns.
    ///
    /// Used when resuming with a different number of workers than the
    /// snapshot was taken with.
    pub fn owned_by(&self, index: WorkerIndex, count: WorkerCount) -> EngineResult<Self> {
        let mut entries = HashMap::new();
        for (coord, acc) in &self.entries {
            if coord.key().route(count)? == index {
                entries.insert(coord.clone(), acc.clone());
            }
        }
        Ok(Self {
            taken_at: self.taken_at,
            entries,
        })
    }

    /// Add all entries of another snapshot.
    ///
    /// Both sides holding the same coordinate only happens when two
    /// partial accumulators were built for one key; they are combined
    /// with `merge`.
    pub fn absorb(
        &mut self,
        other: StoreSnapshot<A>,
        mut merge: impl FnMut(&StoreKey, A, A) -> EngineResult<A>,
    ) -> EngineResult<()> {
        for (coord, acc) in other.entries {
            match self.entries.entry(coord) {
                Entry::Vacant(entry) => {
                    entry.insert(acc);
                }
                Entry::Occupied(mut entry) => {
                    let merged = merge(
                        entry.key(),
                        entry.get().as_ref().clone(),
                        acc.as_ref().clone(),
                    )?;
                    entry.insert(Arc::new(merged));
                }
            }
        }
        Ok(())
    }
}
