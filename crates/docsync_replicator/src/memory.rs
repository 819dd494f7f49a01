//! In-memory storage for tests and ephemeral databases.

use crate::store::{BlobStore, LocalChange, LocalStore, StoreError, StoreEvent, StoreResult};
use docsync_protocol::{JsonObject, RevId, Revision, Sequence};
use parking_lot::RwLock;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::broadcast;
use uuid::Uuid;

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct DocumentTree {
    revisions: BTreeMap<RevId, Revision>,
    parents: HashMap<RevId, Option<RevId>>,
}

impl DocumentTree {
    fn leaves(&self) -> impl Iterator<Item = &Revision> {
        self.revisions.values().filter(|revision| {
            !self
                .parents
                .values()
                .any(|parent| parent.as_ref() == Some(&revision.rev_id))
        })
    }

    /// Live leaves beat tombstones; ties go to the higher revision ID.
    fn winner(&self) -> Option<&Revision> {
        self.leaves()
            .max_by(|a, b| (!a.deleted, &a.rev_id).cmp(&(!b.deleted, &b.rev_id)))
    }

    fn history(&self, rev_id: &RevId) -> Vec<RevId> {
        let mut history = Vec::new();
        let mut cursor = Some(rev_id.clone());
        while let Some(rev) = cursor {
            if history.contains(&rev) {
                break;
            }
            cursor = self.parents.get(&rev).cloned().flatten();
            history.push(rev);
        }
        history
    }
}

#[derive(Debug, Default)]
struct Inner {
    documents: BTreeMap<String, DocumentTree>,
    log: Vec<LocalChange>,
    last_sequence: u64,
    checkpoints: HashMap<String, Sequence>,
    blobs: HashMap<String, Vec<u8>>,
    rejected: HashMap<String, String>,
    fatal: Option<String>,
}

/// A [`LocalStore`] and [`BlobStore`] kept entirely in memory.
///
/// Revision IDs for local edits are derived from a SHA-256 over the parent
/// revision and the new body, so identical edit sequences yield identical
/// revision IDs.
#[derive(Debug)]
pub struct MemoryStore {
    database_id: String,
    inner: RwLock<Inner>,
    events: broadcast::Sender<StoreEvent>,
}

impl MemoryStore {
    /// Creates an empty store with a random database ID.
    pub fn new() -> Self {
        Self::with_database_id(Uuid::new_v4().to_string())
    }

    /// Creates an empty store with a fixed database ID.
    pub fn with_database_id(database_id: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            database_id: database_id.into(),
            inner: RwLock::new(Inner::default()),
            events,
        }
    }

    /// Writes a new revision of `doc_id` on top of its current winner.
    pub fn put(&self, doc_id: &str, body: JsonObject) -> StoreResult<RevId> {
        self.edit(doc_id, body, false)
    }

    /// Writes a deletion tombstone on top of the current winner.
    pub fn delete(&self, doc_id: &str) -> StoreResult<RevId> {
        if self.get(doc_id).is_none() {
            return Err(StoreError::NotFound {
                doc_id: doc_id.to_string(),
            });
        }
        self.edit(doc_id, JsonObject::new(), true)
    }

    /// Stores `data` as a blob and writes a revision that adds it as an
    /// attachment named `name`.
    pub fn attach(
        &self,
        doc_id: &str,
        name: &str,
        content_type: &str,
        data: &[u8],
    ) -> StoreResult<RevId> {
        let digest = self.write_blob(data)?;
        let current = self.get(doc_id);
        let generation = current
            .as_ref()
            .map_or(1, |revision| revision.rev_id.generation() + 1);
        let mut body = current.map(|revision| revision.body).unwrap_or_default();
        let attachments = body
            .entry("_attachments")
            .or_insert_with(|| Value::Object(JsonObject::new()));
        if let Value::Object(attachments) = attachments {
            attachments.insert(
                name.to_string(),
                json!({
                    "content_type": content_type,
                    "digest": digest,
                    "length": data.len(),
                    "revpos": generation,
                    "stub": true,
                }),
            );
        }
        self.put(doc_id, body)
    }

    /// Removes a document and all its revisions.
    pub fn purge(&self, doc_id: &str) -> bool {
        let removed = {
            let mut inner = self.inner.write();
            inner.log.retain(|change| change.revision.doc_id != doc_id);
            inner.documents.remove(doc_id).is_some()
        };
        if removed {
            let _ = self.events.send(StoreEvent::Purged {
                doc_id: doc_id.to_string(),
            });
        }
        removed
    }

    /// Returns the winning revision, or `None` if missing or deleted.
    pub fn get(&self, doc_id: &str) -> Option<Revision> {
        let inner = self.inner.read();
        inner
            .documents
            .get(doc_id)
            .and_then(DocumentTree::winner)
            .filter(|revision| !revision.deleted)
            .cloned()
    }

    /// Number of documents whose winning revision is live.
    pub fn document_count(&self) -> usize {
        let inner = self.inner.read();
        inner
            .documents
            .values()
            .filter_map(DocumentTree::winner)
            .filter(|revision| !revision.deleted)
            .count()
    }

    /// Number of stored blobs.
    pub fn blob_count(&self) -> usize {
        self.inner.read().blobs.len()
    }

    /// Makes every future insert of `doc_id` fail validation.
    pub fn reject_doc(&self, doc_id: impl Into<String>, reason: impl Into<String>) {
        self.inner.write().rejected.insert(doc_id.into(), reason.into());
    }

    /// Makes every future write fail fatally.
    pub fn set_fatal(&self, message: impl Into<String>) {
        self.inner.write().fatal = Some(message.into());
    }

    fn edit(&self, doc_id: &str, body: JsonObject, deleted: bool) -> StoreResult<RevId> {
        let change = {
            let mut inner = self.inner.write();
            if let Some(message) = &inner.fatal {
                return Err(StoreError::Fatal(message.clone()));
            }
            let parent = inner
                .documents
                .get(doc_id)
                .and_then(DocumentTree::winner)
                .map(|revision| revision.rev_id.clone());
            let generation = parent.as_ref().map_or(1, |rev| rev.generation() + 1);
            let rev_id = RevId::new(generation, revision_digest(parent.as_ref(), deleted, &body));
            let revision = Revision {
                doc_id: doc_id.to_string(),
                rev_id: rev_id.clone(),
                deleted,
                body,
            };
            let tree = inner.documents.entry(doc_id.to_string()).or_default();
            tree.parents.insert(rev_id, parent);
            tree.revisions.insert(revision.rev_id.clone(), revision.clone());
            inner.append(revision, None)
        };
        let rev_id = change.revision.rev_id.clone();
        let _ = self.events.send(StoreEvent::Changed(change));
        Ok(rev_id)
    }
}

impl Inner {
    fn append(&mut self, revision: Revision, source: Option<String>) -> LocalChange {
        self.last_sequence += 1;
        let change = LocalChange {
            sequence: self.last_sequence,
            revision,
            source,
        };
        self.log.push(change.clone());
        change
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn revision_digest(parent: Option<&RevId>, deleted: bool, body: &JsonObject) -> String {
    let mut hasher = Sha256::new();
    if let Some(parent) = parent {
        hasher.update(parent.to_string().as_bytes());
    }
    hasher.update([u8::from(deleted)]);
    hasher.update(Value::Object(body.clone()).to_string().as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..32].to_string()
}

impl LocalStore for MemoryStore {
    fn database_id(&self) -> String {
        self.database_id.clone()
    }

    fn last_sequence(&self) -> u64 {
        self.inner.read().last_sequence
    }

    fn changes_since(&self, since: u64, limit: usize) -> StoreResult<Vec<LocalChange>> {
        let inner = self.inner.read();
        Ok(inner
            .log
            .iter()
            .filter(|change| change.sequence > since)
            .take(limit)
            .cloned()
            .collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn load_revision(&self, doc_id: &str, rev_id: &RevId) -> StoreResult<Option<Revision>> {
        let inner = self.inner.read();
        Ok(inner
            .documents
            .get(doc_id)
            .and_then(|tree| tree.revisions.get(rev_id))
            .cloned())
    }

    fn revision_history(&self, doc_id: &str, rev_id: &RevId) -> StoreResult<Vec<RevId>> {
        let inner = self.inner.read();
        let tree = inner.documents.get(doc_id).ok_or_else(|| StoreError::NotFound {
            doc_id: doc_id.to_string(),
        })?;
        Ok(tree.history(rev_id))
    }

    fn is_revision_known(&self, doc_id: &str, rev_id: &RevId) -> StoreResult<bool> {
        let inner = self.inner.read();
        Ok(inner
            .documents
            .get(doc_id)
            .is_some_and(|tree| tree.revisions.contains_key(rev_id)))
    }

    fn known_revisions(&self, doc_id: &str) -> StoreResult<Vec<RevId>> {
        let inner = self.inner.read();
        Ok(inner
            .documents
            .get(doc_id)
            .map(|tree| tree.revisions.keys().rev().cloned().collect())
            .unwrap_or_default())
    }

    fn insert_revision(
        &self,
        revision: Revision,
        history: Vec<RevId>,
        source: &str,
    ) -> StoreResult<()> {
        let change = {
            let mut inner = self.inner.write();
            if let Some(message) = &inner.fatal {
                return Err(StoreError::Fatal(message.clone()));
            }
            if let Some(reason) = inner.rejected.get(&revision.doc_id) {
                return Err(StoreError::Rejected {
                    doc_id: revision.doc_id.clone(),
                    reason: reason.clone(),
                });
            }
            let tree = inner.documents.entry(revision.doc_id.clone()).or_default();
            if tree.revisions.contains_key(&revision.rev_id) {
                return Ok(());
            }

            let mut lineage = history;
            if lineage.first() != Some(&revision.rev_id) {
                lineage.insert(0, revision.rev_id.clone());
            }
            for (index, rev) in lineage.iter().enumerate() {
                let parent = lineage.get(index + 1).cloned();
                let known = tree.parents.entry(rev.clone()).or_insert(None);
                if known.is_none() {
                    *known = parent;
                }
            }
            tree.revisions
                .insert(revision.rev_id.clone(), revision.clone());
            inner.append(revision, Some(source.to_string()))
        };
        let _ = self.events.send(StoreEvent::Changed(change));
        Ok(())
    }

    fn local_checkpoint(&self, checkpoint_id: &str) -> StoreResult<Option<Sequence>> {
        Ok(self.inner.read().checkpoints.get(checkpoint_id).cloned())
    }

    fn set_local_checkpoint(&self, checkpoint_id: &str, sequence: &Sequence) -> StoreResult<()> {
        let mut inner = self.inner.write();
        if let Some(message) = &inner.fatal {
            return Err(StoreError::Fatal(message.clone()));
        }
        inner
            .checkpoints
            .insert(checkpoint_id.to_string(), sequence.clone());
        Ok(())
    }
}

impl BlobStore for MemoryStore {
    fn read_blob(&self, digest: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.inner.read().blobs.get(digest).cloned())
    }

    fn write_blob(&self, data: &[u8]) -> StoreResult<String> {
        let digest = format!("sha256-{}", hex::encode(Sha256::digest(data)));
        self.inner
            .write()
            .blobs
            .entry(digest.clone())
            .or_insert_with(|| data.to_vec());
        Ok(digest)
    }
}
