use std::fmt::Debug;
use std::marker::PhantomData;

use tracing::debug;

use super::{CombineFailure, CombinePolicy};
use crate::errors::UserError;
use crate::recovery::model::Discipline;

/// Accumulator-based aggregation.
///
/// `create_accumulator` is called once when a key is first touched,
/// `add` folds one record, `get_result` is a pure projection and
/// `merge` optionally combines two partial accumulators.
pub trait AggregateFunction<I, ACC, O>: Send + Sync {
    fn create_accumulator(&self) -> ACC;

    fn add(&self, record: &I, acc: ACC) -> Result<ACC, UserError>;

    fn get_result(&self, acc: &ACC) -> O;

    fn supports_merge(&self) -> bool {
        false
    }

    fn merge(&self, _left: ACC, _right: ACC) -> Result<ACC, CombineFailure> {
        Err(CombineFailure::NotMergeable)
    }
}

type CreateFn<ACC> = Box<dyn Fn() -> ACC + Send + Sync>;
type AddFn<I, ACC> = Box<dyn Fn(&I, ACC) -> Result<ACC, UserError> + Send + Sync>;
type ResultFn<ACC, O> = Box<dyn Fn(&ACC) -> O + Send + Sync>;
type MergeFn<ACC> = Box<dyn Fn(ACC, ACC) -> Result<ACC, UserError> + Send + Sync>;

/// [`AggregateFunction`] built from closures.
pub struct AggregateFn<I, ACC, O> {
    create: CreateFn<ACC>,
    add: AddFn<I, ACC>,
    result: ResultFn<ACC, O>,
    merge: Option<MergeFn<ACC>>,
}

impl<I, ACC, O> AggregateFn<I, ACC, O> {
    pub fn new(
        create: impl Fn() -> ACC + Send + Sync + 'static,
        add: impl Fn(&I, ACC) -> Result<ACC, UserError> + Send + Sync + 'static,
        result: impl Fn(&ACC) -> O + Send + Sync + 'static,
    ) -> Self {
        Self {
            create: Box::new(create),
            add: Box::new(add),
            result: Box::new(result),
            merge: None,
        }
    }

    pub fn with_merge(
        mut self,
        merge: impl Fn(ACC, ACC) -> Result<ACC, UserError> + Send + Sync + 'static,
    ) -> Self {
        self.merge = Some(Box::new(merge));
        self
    }
}

impl<I, ACC, O> AggregateFunction<I, ACC, O> for AggregateFn<I, ACC, O> {
    fn create_accumulator(&self) -> ACC {
        (self.create)()
    }

    fn add(&self, record: &I, acc: ACC) -> Result<ACC, UserError> {
        (self.add)(record, acc)
    }

    fn get_result(&self, acc: &ACC) -> O {
        (self.result)(acc)
    }

    fn supports_merge(&self) -> bool {
        self.merge.is_some()
    }

    fn merge(&self, left: ACC, right: ACC) -> Result<ACC, CombineFailure> {
        match &self.merge {
            Some(merge) => Ok(merge(left, right)?),
            None => Err(CombineFailure::NotMergeable),
        }
    }
}

/// Values carrying a label that decides whether they belong to the
/// same aggregate.
pub trait Labeled {
    type Label: PartialEq + Debug;

    fn label(&self) -> &Self::Label;
}

/// A pair is labeled by its first field.
impl<L, V> Labeled for (L, V)
where
    L: PartialEq + Debug,
{
    type Label = L;

    fn label(&self) -> &L {
        &self.0
    }
}

/// Wraps an aggregate function so a record whose label differs from
/// the accumulator's label starts a fresh accumulator instead of being
/// folded in.
///
/// With a coarse routing key this keeps only the aggregate of the
/// latest run of equally labeled records.
pub struct LabelReplace<F> {
    inner: F,
}

impl<F> LabelReplace<F> {
    pub fn new(inner: F) -> Self {
        Self { inner }
    }
}

impl<I, ACC, O, F> AggregateFunction<I, ACC, O> for LabelReplace<F>
where
    F: AggregateFunction<I, ACC, O>,
    I: Labeled,
    ACC: Labeled<Label = I::Label>,
{
    fn create_accumulator(&self) -> ACC {
        self.inner.create_accumulator()
    }

    fn add(&self, record: &I, acc: ACC) -> Result<ACC, UserError> {
        if record.label() == acc.label() {
            self.inner.add(record, acc)
        } else {
            debug!(
                "label replace: record label {:?} != accumulator label {:?}; starting over",
                record.label(),
                acc.label()
            );
            self.inner.add(record, self.inner.create_accumulator())
        }
    }

    fn get_result(&self, acc: &ACC) -> O {
        self.inner.get_result(acc)
    }

    fn supports_merge(&self) -> bool {
        self.inner.supports_merge()
    }

    fn merge(&self, left: ACC, right: ACC) -> Result<ACC, CombineFailure> {
        self.inner.merge(left, right)
    }
}

/// Implements the aggregate-with-merge discipline on top of an
/// [`AggregateFunction`].
pub struct AggregatePolicy<F, I, ACC, O> {
    function: F,
    _types: PhantomData<fn(&I, ACC) -> O>,
}

impl<F, I, ACC, O> AggregatePolicy<F, I, ACC, O>
where
    F: AggregateFunction<I, ACC, O>,
{
    pub fn new(function: F) -> Self {
        Self {
            function,
            _types: PhantomData,
        }
    }
}

impl<F, I, ACC, O> CombinePolicy<I, ACC, O> for AggregatePolicy<F, I, ACC, O>
where
    F: AggregateFunction<I, ACC, O>,
    ACC: Debug,
{
    fn discipline(&self) -> Discipline {
        Discipline::AggregateWithMerge
    }

    fn create(&self) -> ACC {
        self.function.create_accumulator()
    }

    fn add(&self, acc: ACC, record: &I) -> Result<ACC, UserError> {
        let updated_acc = self.function.add(record, acc)?;
        debug!("aggregate: -> updated_acc={updated_acc:?}");
        Ok(updated_acc)
    }

    fn extract(&self, acc: &ACC) -> O {
        self.function.get_result(acc)
    }

    fn supports_merge(&self) -> bool {
        self.function.supports_merge()
    }

    fn merge(&self, left: ACC, right: ACC) -> Result<ACC, CombineFailure> {
        self.function.merge(left, right)
    }
}
