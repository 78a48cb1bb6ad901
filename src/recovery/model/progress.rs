//! Data model representing progress of the source and checkpoints.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Incrementing id of a checkpoint attempt.
///
/// Ids keep increasing across restarts: a resumed execution starts
/// numbering after the checkpoint it resumed from.
/// The default id precedes every real checkpoint.
#[derive(
    Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct CheckpointId(pub u64);

impl CheckpointId {
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Position of the source: the number of records it has emitted.
///
/// A source rebuilt with this offset emits the record right after
/// the last one covered by the snapshot.
#[derive(
    Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SourceOffset(pub u64);

impl fmt::Display for SourceOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Where a new execution should resume from.
///
/// Defaults to before the first checkpoint and the first record.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ResumeFrom(pub CheckpointId, pub SourceOffset);

impl ResumeFrom {
    /// Id the first checkpoint of the resumed execution will use.
    pub fn next_checkpoint(&self) -> CheckpointId {
        self.0.next()
    }
}

#[test]
fn default_resume_starts_at_first_checkpoint() {
    let resume = ResumeFrom::default();
    assert_eq!(resume.next_checkpoint(), CheckpointId(1));
    assert_eq!(resume.1, SourceOffset(0));
}
