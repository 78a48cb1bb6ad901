use std::sync::Arc;
use std::task::Poll;

use super::{Source, SourceBuilder};
use crate::errors::EngineResult;
use crate::recovery::model::SourceOffset;

/// Replays a fixed list of items.
///
/// Rebuilding it at an offset skips that many items, which makes it
/// the reference source for recovery tests.
#[derive(Debug, Clone)]
pub struct TestingInput<D> {
    items: Arc<Vec<D>>,
}

impl<D> TestingInput<D> {
    pub fn new(items: Vec<D>) -> Self {
        Self {
            items: Arc::new(items),
        }
    }
}

impl<D> SourceBuilder<D> for TestingInput<D>
where
    D: Clone + Send + Sync + 'static,
{
    fn build(&self, resume_from: Option<SourceOffset>) -> EngineResult<Box<dyn Source<D>>> {
        let position = resume_from.map(|offset| offset.0 as usize).unwrap_or(0);
        Ok(Box::new(TestingSource {
            items: self.items.clone(),
            position,
            cancelled: false,
        }))
    }
}

struct TestingSource<D> {
    items: Arc<Vec<D>>,
    position: usize,
    cancelled: bool,
}

impl<D> Source<D> for TestingSource<D>
where
    D: Clone + Send + Sync,
{
    fn next(&mut self) -> Poll<Option<D>> {
        if self.cancelled {
            return Poll::Ready(None);
        }
        match self.items.get(self.position) {
            Some(item) => {
                self.position += 1;
                Poll::Ready(Some(item.clone()))
            }
            None => Poll::Ready(None),
        }
    }

    fn snapshot(&self) -> SourceOffset {
        SourceOffset(self.position as u64)
    }

    fn cancel(&mut self) {
        self.cancelled = true;
    }
}

#[test]
fn resumes_after_offset() {
    let input = TestingInput::new(vec!["a", "b", "c"]);

    let mut source = input.build(None).unwrap();
    assert_eq!(source.next(), Poll::Ready(Some("a")));
    assert_eq!(source.snapshot(), SourceOffset(1));

    let mut resumed = input.build(Some(SourceOffset(2))).unwrap();
    assert_eq!(resumed.next(), Poll::Ready(Some("c")));
    assert_eq!(resumed.next(), Poll::Ready(None));
    assert_eq!(resumed.snapshot(), SourceOffset(3));
}

#[test]
fn cancel_ends_stream() {
    let input = TestingInput::new(vec![1, 2, 3]);
    let mut source = input.build(None).unwrap();
    source.cancel();
    assert_eq!(source.next(), Poll::Ready(None));
}
