//! Request and response bodies for the revision-diff, bulk and checkpoint
//! endpoints.

use crate::error::ProtocolResult;
use crate::revision::{JsonObject, RevId};
use crate::sequence::Sequence;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// `POST _revs_diff` body: doc ID to candidate revisions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevsDiffRequest(pub BTreeMap<String, Vec<RevId>>);

impl RevsDiffRequest {
    /// Creates an empty request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a candidate revision for a document, ignoring duplicates.
    pub fn add(&mut self, doc_id: impl Into<String>, rev: RevId) {
        let revs = self.0.entry(doc_id.into()).or_default();
        if !revs.contains(&rev) {
            revs.push(rev);
        }
    }

    /// Returns true if no revisions were added.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Serializes the body.
    pub fn to_vec(&self) -> ProtocolResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// What the server reported for one document in `_revs_diff`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevsDiffEntry {
    /// Revisions the server does not have.
    #[serde(default)]
    pub missing: Vec<RevId>,
    /// Revisions the server has that may be ancestors of the missing ones.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub possible_ancestors: Vec<RevId>,
}

/// `_revs_diff` response. Documents the server already has fully are absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevsDiffResponse(pub BTreeMap<String, RevsDiffEntry>);

impl RevsDiffResponse {
    /// Parses a response body.
    pub fn from_slice(body: &[u8]) -> ProtocolResult<Self> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Returns the entry for a document, if the server is missing anything.
    pub fn get(&self, doc_id: &str) -> Option<&RevsDiffEntry> {
        self.0.get(doc_id)
    }

    /// Returns true if the server reported `rev` of `doc_id` as missing.
    pub fn is_missing(&self, doc_id: &str, rev: &RevId) -> bool {
        self.get(doc_id)
            .is_some_and(|entry| entry.missing.contains(rev))
    }
}

/// `POST _bulk_docs` body. Replicators always send `new_edits: false`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkDocsRequest {
    /// Whether the server should assign new revision IDs.
    pub new_edits: bool,
    /// Full documents including `_revisions`.
    pub docs: Vec<JsonObject>,
}

impl BulkDocsRequest {
    /// Creates a replication upload.
    pub fn new(docs: Vec<JsonObject>) -> Self {
        Self {
            new_edits: false,
            docs,
        }
    }

    /// Serializes the body.
    pub fn to_vec(&self) -> ProtocolResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// One row of a `_bulk_docs` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkDocsResult {
    /// Document ID.
    pub id: String,
    /// Stored revision, on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    /// Error name, on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Human readable reason, on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// HTTP-style status of the row, when the server supplies one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl BulkDocsResult {
    /// Parses a response body (a JSON array of rows).
    pub fn parse_list(body: &[u8]) -> ProtocolResult<Vec<Self>> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Returns true if the row reports an error.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Best-effort status code for a failed row.
    pub fn error_status(&self) -> u16 {
        if let Some(status) = self.status {
            return status;
        }
        match self.error.as_deref() {
            Some("forbidden") => 403,
            Some("unauthorized") => 401,
            Some("conflict") => 409,
            Some("not_found") => 404,
            _ => 500,
        }
    }
}

/// One requested revision in a `_bulk_get` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkGetItem {
    /// Document ID.
    pub id: String,
    /// Requested revision.
    pub rev: RevId,
    /// Known ancestors, so the server can omit unchanged attachments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub atts_since: Vec<RevId>,
}

/// `POST _bulk_get` body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkGetRequest {
    /// Requested revisions, answered in the same order.
    pub docs: Vec<BulkGetItem>,
}

impl BulkGetRequest {
    /// Path relative to the database URL.
    pub const PATH: &'static str = "_bulk_get?revs=true&attachments=true";

    /// Serializes the body.
    pub fn to_vec(&self) -> ProtocolResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Body of a `_local/<checkpoint id>` document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointDocument {
    /// Current revision of the checkpoint document, if it exists.
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    /// Last fully replicated sequence.
    #[serde(rename = "lastSequence")]
    pub last_sequence: Sequence,
}

impl CheckpointDocument {
    /// Parses a checkpoint document.
    pub fn from_slice(body: &[u8]) -> ProtocolResult<Self> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Serializes the document.
    pub fn to_vec(&self) -> ProtocolResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}
