//! Deciding which revisions actually need to move.

use crate::error::ReplicationResult;
use crate::executor::RetryingExecutor;
use crate::sequence_map::SequenceId;
use crate::store::LocalStore;
use docsync_protocol::{RevId, RevsDiffRequest, RevsDiffResponse, Sequence};
use tracing::debug;

/// One revision waiting to be transferred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRevision {
    /// Entry in the run's sequence map.
    pub seq_id: SequenceId,
    /// Sequence the revision was discovered at.
    pub sequence: Sequence,
    /// Document ID.
    pub doc_id: String,
    /// Revision ID.
    pub rev_id: RevId,
    /// Whether the revision is a tombstone.
    pub deleted: bool,
}

/// A revision the peer is missing, with its ancestor hints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeededRevision {
    /// The revision.
    pub item: PendingRevision,
    /// Revisions of the same document the peer already has.
    pub possible_ancestors: Vec<RevId>,
}

impl NeededRevision {
    /// Highest generation among the possible ancestors.
    pub fn max_ancestor_generation(&self) -> Option<u64> {
        self.possible_ancestors.iter().map(RevId::generation).max()
    }
}

/// Result of diffing a batch.
#[derive(Debug, Default)]
pub struct BatchDiff {
    /// Revisions that must be transferred.
    pub needed: Vec<NeededRevision>,
    /// Revisions the destination already has.
    pub present: Vec<PendingRevision>,
}

/// Computes what the other side is missing.
#[derive(Debug, Clone)]
pub struct DiffResolver {
    executor: RetryingExecutor,
}

impl DiffResolver {
    /// Creates a resolver that talks to the executor's database.
    pub fn new(executor: RetryingExecutor) -> Self {
        Self { executor }
    }

    /// Push side: asks the remote through `_revs_diff`.
    ///
    /// Documents absent from the response are fully present on the remote.
    pub async fn missing_on_remote(&self, batch: Vec<PendingRevision>) -> ReplicationResult<BatchDiff> {
        if batch.is_empty() {
            return Ok(BatchDiff::default());
        }
        let mut request = RevsDiffRequest::new();
        for item in &batch {
            request.add(item.doc_id.clone(), item.rev_id.clone());
        }
        let response = self.executor.post_json("_revs_diff", &request).await?;
        let diff = RevsDiffResponse::from_slice(&response.body)?;

        let mut result = BatchDiff::default();
        for item in batch {
            match diff.get(&item.doc_id) {
                Some(entry) if entry.missing.contains(&item.rev_id) => {
                    result.needed.push(NeededRevision {
                        possible_ancestors: entry.possible_ancestors.clone(),
                        item,
                    });
                }
                _ => result.present.push(item),
            }
        }
        debug!(
            needed = result.needed.len(),
            present = result.present.len(),
            "revs_diff complete"
        );
        Ok(result)
    }

    /// Pull side: everything the local store does not already hold.
    pub fn missing_locally(
        store: &dyn LocalStore,
        batch: Vec<PendingRevision>,
    ) -> ReplicationResult<BatchDiff> {
        let mut result = BatchDiff::default();
        for item in batch {
            if store.is_revision_known(&item.doc_id, &item.rev_id)? {
                result.present.push(item);
            } else {
                result.needed.push(NeededRevision {
                    item,
                    possible_ancestors: Vec::new(),
                });
            }
        }
        Ok(result)
    }
}
