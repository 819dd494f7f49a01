//! Local storage collaborators.
//!
//! The replicator reads and writes the local database only through these
//! traits. Revision-tree maintenance, conflict resolution and winner
//! selection all happen behind [`LocalStore::insert_revision`].

use crate::error::ReplicationError;
use docsync_protocol::{RevId, Revision, Sequence};
use thiserror::Error;
use tokio::sync::broadcast;

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors reported by the storage collaborators.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Validation refused the revision. The batch continues.
    #[error("revision of {doc_id} rejected: {reason}")]
    Rejected {
        /// Document ID.
        doc_id: String,
        /// Why the revision was refused.
        reason: String,
    },

    /// The document or revision does not exist.
    #[error("document {doc_id} not found")]
    NotFound {
        /// Document ID.
        doc_id: String,
    },

    /// The store can no longer be trusted.
    #[error("fatal storage error: {0}")]
    Fatal(String),
}

impl From<StoreError> for ReplicationError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Rejected { doc_id, reason } => {
                ReplicationError::DocumentRejected { doc_id, reason }
            }
            other => ReplicationError::LocalStorage(other.to_string()),
        }
    }
}

/// One entry of the local change log.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalChange {
    /// Local sequence number.
    pub sequence: u64,
    /// The revision that was written.
    pub revision: Revision,
    /// Remote URL the revision was pulled from, if any.
    pub source: Option<String>,
}

/// Notification published by a [`LocalStore`].
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// A revision was written.
    Changed(LocalChange),
    /// A document and all its revisions were purged.
    Purged {
        /// Purged document ID.
        doc_id: String,
    },
}

/// The local revision store.
///
/// Calls are synchronous and expected to be quick; a store backed by slow
/// I/O should do its own buffering.
pub trait LocalStore: Send + Sync {
    /// Stable identifier of the local database, used in checkpoint IDs.
    fn database_id(&self) -> String;

    /// Highest local sequence assigned so far.
    fn last_sequence(&self) -> u64;

    /// Changes with a sequence above `since`, oldest first, at most `limit`.
    fn changes_since(&self, since: u64, limit: usize) -> StoreResult<Vec<LocalChange>>;

    /// Subscribes to live change notifications.
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;

    /// Loads one revision, or `None` if it is unknown or was purged.
    fn load_revision(&self, doc_id: &str, rev_id: &RevId) -> StoreResult<Option<Revision>>;

    /// Ancestry of a revision, newest first, starting with `rev_id` itself.
    fn revision_history(&self, doc_id: &str, rev_id: &RevId) -> StoreResult<Vec<RevId>>;

    /// Returns true if the revision is already stored.
    fn is_revision_known(&self, doc_id: &str, rev_id: &RevId) -> StoreResult<bool>;

    /// Every stored revision of a document, newest generation first.
    fn known_revisions(&self, doc_id: &str) -> StoreResult<Vec<RevId>>;

    /// Inserts a revision received from `source` together with its history
    /// (newest first, starting with the revision itself).
    fn insert_revision(
        &self,
        revision: Revision,
        history: Vec<RevId>,
        source: &str,
    ) -> StoreResult<()>;

    /// Locally mirrored checkpoint value.
    fn local_checkpoint(&self, checkpoint_id: &str) -> StoreResult<Option<Sequence>>;

    /// Records the checkpoint value mirrored from the remote.
    fn set_local_checkpoint(&self, checkpoint_id: &str, sequence: &Sequence) -> StoreResult<()>;
}

/// Content-addressed attachment storage.
pub trait BlobStore: Send + Sync {
    /// Reads a blob by digest.
    fn read_blob(&self, digest: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Stores a blob and returns its digest (`sha256-<hex>`).
    fn write_blob(&self, data: &[u8]) -> StoreResult<String>;
}

/// Decides whether a revision should be replicated.
pub trait RevisionFilter: Send + Sync {
    /// Returns true to replicate the revision.
    fn should_accept(&self, revision: &Revision) -> bool;
}

impl<F> RevisionFilter for F
where
    F: Fn(&Revision) -> bool + Send + Sync,
{
    fn should_accept(&self, revision: &Revision) -> bool {
        self(revision)
    }
}
