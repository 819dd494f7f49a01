//! Change-feed response shapes.

use crate::error::ProtocolResult;
use crate::revision::RevId;
use crate::sequence::Sequence;
use serde::{Deserialize, Serialize};

/// One revision listed in a change entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRev {
    /// The changed revision.
    pub rev: RevId,
}

/// A single row of a `_changes` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEntry {
    /// Opaque sequence of this change.
    pub seq: Sequence,
    /// Document ID.
    pub id: String,
    /// Changed leaf revisions (`style=all_docs` lists every leaf).
    #[serde(default)]
    pub changes: Vec<ChangeRev>,
    /// Whether the winning revision is a deletion.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    /// Channels the document was removed from (Sync Gateway only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed: Option<Vec<String>>,
}

impl ChangeEntry {
    /// Creates an entry with a single changed revision.
    pub fn new(seq: impl Into<Sequence>, id: impl Into<String>, rev: RevId) -> Self {
        Self {
            seq: seq.into(),
            id: id.into(),
            changes: vec![ChangeRev { rev }],
            deleted: false,
            removed: None,
        }
    }

    /// Marks the entry as a deletion.
    pub fn with_deleted(mut self, deleted: bool) -> Self {
        self.deleted = deleted;
        self
    }

    /// Returns the changed revision IDs in feed order.
    pub fn rev_ids(&self) -> impl Iterator<Item = &RevId> {
        self.changes.iter().map(|change| &change.rev)
    }
}

/// A complete `_changes` response (normal or long-poll feed).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesResponse {
    /// Changes in server order.
    #[serde(default)]
    pub results: Vec<ChangeEntry>,
    /// Sequence to resume from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seq: Option<Sequence>,
}

impl ChangesResponse {
    /// Parses a response body.
    pub fn from_slice(body: &[u8]) -> ProtocolResult<Self> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Returns the sequence a follow-up request should resume from.
    ///
    /// Prefers `last_seq` and falls back to the sequence of the last row.
    pub fn resume_sequence(&self) -> Option<&Sequence> {
        self.last_seq
            .as_ref()
            .or_else(|| self.results.last().map(|entry| &entry.seq))
    }
}
