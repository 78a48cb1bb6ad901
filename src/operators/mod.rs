//! Combine policies: how an incoming record updates an accumulator.
//!
//! Two disciplines are supported. [`reduce`] folds records that are
//! coerced into the accumulator type with a pairwise function.
//! [`aggregate`] keeps a separate accumulator type with an optional
//! merge of partial accumulators.
//!
//! Policies hold no per-key state and can be called for different
//! keys from different workers at once; calls for one key are always
//! serialized by the worker owning it.

use crate::errors::UserError;
use crate::recovery::model::Discipline;

pub mod aggregate;
pub mod reduce;

pub use aggregate::*;
pub use reduce::*;

/// Why merging two accumulators did not produce a value.
#[derive(Debug)]
pub enum CombineFailure {
    /// The policy has no merge function.
    NotMergeable,
    /// The user merge function failed.
    User(UserError),
}

impl From<UserError> for CombineFailure {
    fn from(err: UserError) -> Self {
        Self::User(err)
    }
}

/// Strategy applied by a keyed state handle to its accumulator.
pub trait CombinePolicy<I, A, O>: Send + Sync {
    fn discipline(&self) -> Discipline;

    /// Value an accumulator takes on first touch.
    fn create(&self) -> A;

    /// Fold one record into the accumulator.
    fn add(&self, acc: A, record: &I) -> Result<A, UserError>;

    /// Project the accumulator into an output. Must not have side
    /// effects.
    fn extract(&self, acc: &A) -> O;

    fn supports_merge(&self) -> bool {
        false
    }

    /// Combine two partial accumulators for the same key.
    fn merge(&self, _left: A, _right: A) -> Result<A, CombineFailure> {
        Err(CombineFailure::NotMergeable)
    }
}
