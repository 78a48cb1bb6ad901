//! Declared states and the per-key view processing tasks use.

use std::fmt;
use std::sync::Arc;

use super::{Accumulator, AccumulatorStore};
use crate::errors::{EngineError, EngineResult};
use crate::operators::{CombineFailure, CombinePolicy};
use crate::outputs::Output;
use crate::recovery::model::{Discipline, StateKey, StateName};

/// Declaration of one piece of keyed state: its name, how records
/// update it and whether the job needs to merge partial accumulators.
pub struct StateDescriptor<I, A, O> {
    name: StateName,
    policy: Arc<dyn CombinePolicy<I, A, O>>,
    requires_merge: bool,
}

impl<I, A, O> fmt::Debug for StateDescriptor<I, A, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateDescriptor")
            .field("name", &self.name)
            .field("discipline", &self.policy.discipline())
            .field("requires_merge", &self.requires_merge)
            .finish()
    }
}

impl<I, A, O> StateDescriptor<I, A, O>
where
    I: 'static,
    A: Accumulator,
    O: 'static,
{
    pub fn new(name: impl Into<StateName>, policy: impl CombinePolicy<I, A, O> + 'static) -> Self {
        Self {
            name: name.into(),
            policy: Arc::new(policy),
            requires_merge: false,
        }
    }

    /// Mark this state as needing [`CombinePolicy::merge`]. Building a
    /// job fails if the policy can not merge.
    pub fn requires_merge(mut self) -> Self {
        self.requires_merge = true;
        self
    }

    pub fn name(&self) -> &StateName {
        &self.name
    }

    pub fn discipline(&self) -> Discipline {
        self.policy.discipline()
    }

    pub(crate) fn policy(&self) -> &Arc<dyn CombinePolicy<I, A, O>> {
        &self.policy
    }

    pub(crate) fn validate(&self) -> EngineResult<()> {
        if self.requires_merge && !self.policy.supports_merge() {
            return Err(EngineError::NotMergeable {
                state: self.name.clone(),
            });
        }
        Ok(())
    }

    /// Register this state's default in a store.
    pub(crate) fn declare_in(&self, store: &mut AccumulatorStore<A>) -> EngineResult<()> {
        let policy = self.policy.clone();
        store.declare(self.name.clone(), move || policy.create())
    }

    pub fn handle(&self) -> KeyedStateHandle<I, A, O> {
        KeyedStateHandle {
            name: self.name.clone(),
            policy: self.policy.clone(),
        }
    }
}

/// The key the engine is currently processing a record for.
///
/// Built bound by the worker right before calling the record handler.
/// State handles refuse to work with an unbound context.
pub struct KeyContext<'a, A> {
    store: &'a mut AccumulatorStore<A>,
    key: Option<&'a StateKey>,
}

impl<'a, A> KeyContext<'a, A> {
    pub fn bound(store: &'a mut AccumulatorStore<A>, key: &'a StateKey) -> Self {
        Self {
            store,
            key: Some(key),
        }
    }

    pub fn unbound(store: &'a mut AccumulatorStore<A>) -> Self {
        Self { store, key: None }
    }

    /// Key of the record being processed. Handlers use it to tag
    /// what they emit.
    pub fn current_key(&self) -> Option<&'a StateKey> {
        self.key
    }
}

/// View of one declared state under the current key.
pub struct KeyedStateHandle<I, A, O> {
    name: StateName,
    policy: Arc<dyn CombinePolicy<I, A, O>>,
}

impl<I, A, O> Clone for KeyedStateHandle<I, A, O> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            policy: self.policy.clone(),
        }
    }
}

impl<I, A, O> fmt::Debug for KeyedStateHandle<I, A, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("KeyedStateHandle").field(&self.name).finish()
    }
}

impl<I, A, O> KeyedStateHandle<I, A, O>
where
    A: Accumulator,
{
    pub fn name(&self) -> &StateName {
        &self.name
    }

    fn key<'a>(&self, ctx: &KeyContext<'a, A>) -> EngineResult<&'a StateKey> {
        ctx.current_key().ok_or_else(|| EngineError::IllegalStateAccess {
            state: self.name.clone(),
        })
    }

    /// Fold a record into the current key's accumulator.
    ///
    /// On failure the accumulator is left as it was.
    pub fn add(&self, ctx: &mut KeyContext<'_, A>, record: &I) -> EngineResult<()> {
        let key = self.key(ctx)?;
        let acc = ctx.store.get(key, &self.name)?.clone();
        let updated_acc = self
            .policy
            .add(acc, record)
            .map_err(|cause| EngineError::Combine {
                state: self.name.clone(),
                key: key.clone(),
                cause: cause.to_string(),
            })?;
        ctx.store.put(key, &self.name, updated_acc)
    }

    /// Current output for the key. Never modifies the store.
    pub fn value(&self, ctx: &KeyContext<'_, A>) -> EngineResult<O> {
        let key = self.key(ctx)?;
        if !ctx.store.is_declared(&self.name) {
            return Err(EngineError::UndeclaredState {
                state: self.name.clone(),
            });
        }
        Ok(match ctx.store.peek(key, &self.name) {
            Some(acc) => self.policy.extract(acc),
            None => self.policy.extract(&self.policy.create()),
        })
    }

    /// Reset the key's accumulator to the declared default.
    pub fn clear(&self, ctx: &mut KeyContext<'_, A>) -> EngineResult<()> {
        let key = self.key(ctx)?;
        ctx.store.remove(key, &self.name)?;
        Ok(())
    }

    /// Merge a partial accumulator into the current key's one.
    pub fn merge(&self, ctx: &mut KeyContext<'_, A>, partial: A) -> EngineResult<()> {
        let key = self.key(ctx)?;
        ctx.store.merge_entry(key, &self.name, partial, |left, right| {
            self.policy
                .merge(left, right)
                .map_err(|failure| merge_error(&self.name, key, failure))
        })
    }
}

pub(crate) fn merge_error(name: &StateName, key: &StateKey, failure: CombineFailure) -> EngineError {
    match failure {
        CombineFailure::NotMergeable => EngineError::NotMergeable {
            state: name.clone(),
        },
        CombineFailure::User(cause) => EngineError::Combine {
            state: name.clone(),
            key: key.clone(),
            cause: cause.to_string(),
        },
    }
}

/// User code run for every record under its key.
pub trait RecordHandler<I, A, O>: Send + Sync {
    fn on_record(
        &self,
        record: &I,
        ctx: &mut KeyContext<'_, A>,
        states: &[KeyedStateHandle<I, A, O>],
        out: &mut Vec<Output<O>>,
    ) -> EngineResult<()>;
}

/// For each declared state, add the record then emit the updated
/// value.
#[derive(Debug, Default, Clone, Copy)]
pub struct AddThenEmit;

impl<I, A, O> RecordHandler<I, A, O> for AddThenEmit
where
    A: Accumulator,
{
    fn on_record(
        &self,
        record: &I,
        ctx: &mut KeyContext<'_, A>,
        states: &[KeyedStateHandle<I, A, O>],
        out: &mut Vec<Output<O>>,
    ) -> EngineResult<()> {
        for state in states {
            state.add(ctx, record)?;
            let value = state.value(ctx)?;
            let key = state.key(ctx)?.clone();
            out.push(Output {
                key,
                state: state.name().clone(),
                value,
            });
        }
        Ok(())
    }
}
