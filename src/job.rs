//! Definition of a keyed aggregation job.
//!
//! A job says how to key records, which states to keep per key and
//! what to do with each record. It holds no runtime state and is
//! shared by every worker of every execution.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::errors::{config_err, EngineError, EngineResult};
use crate::recovery::model::{StateKey, StateSchema, StoreKey};
use crate::state::handle::merge_error;
use crate::state::{
    Accumulator, AccumulatorStore, AddThenEmit, Data, KeyedStateHandle, RecordHandler,
    StateDescriptor,
};

type KeyFn<I> = Arc<dyn Fn(&I) -> StateKey + Send + Sync>;

pub struct Job<I, A, O> {
    name: String,
    key_fn: KeyFn<I>,
    states: Vec<StateDescriptor<I, A, O>>,
    handler: Arc<dyn RecordHandler<I, A, O>>,
    schema_version: u32,
}

impl<I, A, O> fmt::Debug for Job<I, A, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("states", &self.states)
            .field("schema_version", &self.schema_version)
            .finish()
    }
}

impl<I, A, O> Job<I, A, O>
where
    I: Data,
    A: Accumulator,
    O: Data,
{
    /// Start defining a job. `key_fn` must be pure: the same record
    /// always has the same key.
    pub fn builder(
        name: impl Into<String>,
        key_fn: impl Fn(&I) -> StateKey + Send + Sync + 'static,
    ) -> JobBuilder<I, A, O> {
        JobBuilder {
            name: name.into(),
            key_fn: Arc::new(key_fn),
            states: Vec::new(),
            handler: None,
            schema_version: 1,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key_of(&self, record: &I) -> StateKey {
        (self.key_fn)(record)
    }

    pub fn schema(&self) -> StateSchema {
        StateSchema {
            version: self.schema_version,
            states: self
                .states
                .iter()
                .map(|desc| (desc.name().clone(), desc.discipline()))
                .collect(),
        }
    }

    /// An empty store with every state of this job declared.
    pub fn new_store(&self) -> EngineResult<AccumulatorStore<A>> {
        let mut store = AccumulatorStore::new();
        for desc in &self.states {
            desc.declare_in(&mut store)?;
        }
        Ok(store)
    }

    /// One handle per declared state, in declaration order.
    pub fn handles(&self) -> Vec<KeyedStateHandle<I, A, O>> {
        self.states.iter().map(StateDescriptor::handle).collect()
    }

    pub(crate) fn handler(&self) -> &dyn RecordHandler<I, A, O> {
        self.handler.as_ref()
    }

    /// Merge two partial accumulators found for the same coordinate.
    pub(crate) fn merge(&self, coord: &StoreKey, left: A, right: A) -> EngineResult<A> {
        let desc = self
            .states
            .iter()
            .find(|desc| desc.name() == coord.name())
            .ok_or_else(|| EngineError::UndeclaredState {
                state: coord.name().clone(),
            })?;
        desc.policy()
            .merge(left, right)
            .map_err(|failure| merge_error(coord.name(), coord.key(), failure))
    }
}

pub struct JobBuilder<I, A, O> {
    name: String,
    key_fn: KeyFn<I>,
    states: Vec<StateDescriptor<I, A, O>>,
    handler: Option<Arc<dyn RecordHandler<I, A, O>>>,
    schema_version: u32,
}

impl<I, A, O> JobBuilder<I, A, O>
where
    I: Data,
    A: Accumulator,
    O: Data,
{
    /// Declare a state. Order matters: it is part of the snapshot
    /// schema.
    pub fn state(mut self, desc: StateDescriptor<I, A, O>) -> Self {
        self.states.push(desc);
        self
    }

    /// Replace the default [`AddThenEmit`] handler.
    pub fn handler(mut self, handler: impl RecordHandler<I, A, O> + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Bump when accumulator types change so old snapshots are
    /// refused instead of misread.
    pub fn schema_version(mut self, version: u32) -> Self {
        self.schema_version = version;
        self
    }

    pub fn build(self) -> EngineResult<Job<I, A, O>> {
        if self.states.is_empty() {
            return Err(config_err(&format!(
                "job {} must declare at least one state",
                self.name
            )));
        }
        let mut seen = HashSet::new();
        for desc in &self.states {
            if !seen.insert(desc.name().clone()) {
                return Err(EngineError::DuplicateState {
                    state: desc.name().clone(),
                });
            }
            desc.validate()?;
        }
        Ok(Job {
            name: self.name,
            key_fn: self.key_fn,
            states: self.states,
            handler: self.handler.unwrap_or_else(|| Arc::new(AddThenEmit)),
            schema_version: self.schema_version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::ReducePolicy;
    use crate::recovery::model::{Discipline, StateName};

    fn summing(name: &str) -> StateDescriptor<(String, i64), i64, i64> {
        StateDescriptor::new(
            name,
            ReducePolicy::new(0, |record: &(String, i64)| record.1, |a, b| Ok(a + b)),
        )
    }

    fn by_city(record: &(String, i64)) -> StateKey {
        StateKey::new(record.0.clone())
    }

    #[test]
    fn schema_lists_states_in_order() {
        let job = Job::builder("sums", by_city)
            .state(summing("b"))
            .state(summing("a"))
            .schema_version(3)
            .build()
            .unwrap();
        assert_eq!(
            job.schema(),
            StateSchema {
                version: 3,
                states: vec![
                    (StateName::new("b"), Discipline::Reduce),
                    (StateName::new("a"), Discipline::Reduce),
                ],
            }
        );
        assert_eq!(job.key_of(&("SZ".to_string(), 1)), StateKey::new("SZ"));
    }

    #[test]
    fn duplicate_states_are_rejected() {
        let err = Job::builder("sums", by_city)
            .state(summing("sum"))
            .state(summing("sum"))
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateState { .. }));
    }

    #[test]
    fn unmergeable_required_merge_is_rejected() {
        let err = Job::builder("sums", by_city)
            .state(summing("sum").requires_merge())
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::NotMergeable { .. }));
    }

    #[test]
    fn job_without_states_is_rejected() {
        let err = Job::<(String, i64), i64, i64>::builder("empty", by_city)
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn new_store_declares_every_state() {
        let job = Job::builder("sums", by_city)
            .state(summing("sum"))
            .state(summing("other"))
            .build()
            .unwrap();
        let store = job.new_store().unwrap();
        assert!(store.is_declared(&StateName::new("sum")));
        assert!(store.is_declared(&StateName::new("other")));
        assert_eq!(job.handles().len(), 2);
    }
}
