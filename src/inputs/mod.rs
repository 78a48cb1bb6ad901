//! Sources of records.
//!
//! A source is read by the router of an execution. It must be able to
//! report its position so checkpoints can record it, and be rebuilt
//! at a position so a restarted execution replays exactly the records
//! after the last durable checkpoint.

use std::task::Poll;

use crate::errors::EngineResult;
use crate::recovery::model::SourceOffset;

pub mod city_input;
pub mod testing_input;

pub use city_input::*;
pub use testing_input::*;

/// Defines how a source of input reads data.
pub trait Source<D>: Send {
    /// Return the next item from this input, if any.
    ///
    /// This method must _never block or wait_ on data. If there's no
    /// data yet, return [`Poll::Pending`].
    ///
    /// - [`Poll::Pending`]: no new values ready yet.
    ///
    /// - [`Poll::Ready`] with a [`Some`]: a new value has arrived.
    ///
    /// - [`Poll::Ready`] with a [`None`]: the stream has ended and
    ///   [`next`](Self::next) should not be called again.
    fn next(&mut self) -> Poll<Option<D>>;

    /// Position right after the last item returned.
    fn snapshot(&self) -> SourceOffset;

    /// Stop producing. Called when the execution reading this source
    /// fails.
    fn cancel(&mut self) {}
}

/// Builds a source positioned at a resume offset, or at the start
/// when there is none.
pub trait SourceBuilder<D>: Send + Sync {
    fn build(&self, resume_from: Option<SourceOffset>) -> EngineResult<Box<dyn Source<D>>>;
}

impl<D, F> SourceBuilder<D> for F
where
    F: Fn(Option<SourceOffset>) -> EngineResult<Box<dyn Source<D>>> + Send + Sync,
{
    fn build(&self, resume_from: Option<SourceOffset>) -> EngineResult<Box<dyn Source<D>>> {
        self(resume_from)
    }
}
