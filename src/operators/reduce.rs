use std::fmt;

use tracing::debug;

use super::{CombineFailure, CombinePolicy};
use crate::errors::UserError;
use crate::recovery::model::Discipline;
use crate::state::Accumulator;

type Coerce<I, A> = Box<dyn Fn(&I) -> A + Send + Sync>;
type Reducer<A> = Box<dyn Fn(A, A) -> Result<A, UserError> + Send + Sync>;

/// Implements the reduce discipline.
///
/// Each record is coerced into the accumulator type and combined with
/// the current accumulator as `reducer(old, incoming)`. There is no
/// separate accumulator type: the output is the accumulator itself.
///
/// Reducers are usually associative, so two partial accumulators can
/// be combined with the reducer too; see [`Self::mergeable`].
pub struct ReducePolicy<I, A> {
    default: A,
    coerce: Coerce<I, A>,
    reducer: Reducer<A>,
    mergeable: bool,
}

impl<I, A: fmt::Debug> fmt::Debug for ReducePolicy<I, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReducePolicy")
            .field("default", &self.default)
            .field("mergeable", &self.mergeable)
            .finish()
    }
}

impl<I, A> ReducePolicy<I, A>
where
    A: Accumulator,
{
    pub fn new(
        default: A,
        coerce: impl Fn(&I) -> A + Send + Sync + 'static,
        reducer: impl Fn(A, A) -> Result<A, UserError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            default,
            coerce: Box::new(coerce),
            reducer: Box::new(reducer),
            mergeable: false,
        }
    }

    /// Declare that the reducer is associative so partial
    /// accumulators can be merged with it.
    pub fn mergeable(mut self) -> Self {
        self.mergeable = true;
        self
    }
}

impl<A> ReducePolicy<A, A>
where
    A: Accumulator,
{
    /// Reduce records that already are of the accumulator type.
    pub fn identity(
        default: A,
        reducer: impl Fn(A, A) -> Result<A, UserError> + Send + Sync + 'static,
    ) -> Self {
        Self::new(default, A::clone, reducer)
    }
}

impl<I, A> CombinePolicy<I, A, A> for ReducePolicy<I, A>
where
    I: Send + Sync,
    A: Accumulator,
{
    fn discipline(&self) -> Discipline {
        Discipline::Reduce
    }

    fn create(&self) -> A {
        self.default.clone()
    }

    fn add(&self, acc: A, record: &I) -> Result<A, UserError> {
        let value = (self.coerce)(record);
        debug!("reduce: reducer(acc={acc:?}, value={value:?})");
        let updated_acc = (self.reducer)(acc, value)?;
        debug!("reduce: -> updated_acc={updated_acc:?}");
        Ok(updated_acc)
    }

    fn extract(&self, acc: &A) -> A {
        acc.clone()
    }

    fn supports_merge(&self) -> bool {
        self.mergeable
    }

    fn merge(&self, left: A, right: A) -> Result<A, CombineFailure> {
        if self.mergeable {
            Ok((self.reducer)(left, right)?)
        } else {
            Err(CombineFailure::NotMergeable)
        }
    }
}
