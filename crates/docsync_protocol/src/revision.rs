//! Revision identifiers, revision bodies, and revision histories.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A JSON object, as used for document bodies.
pub type JsonObject = serde_json::Map<String, Value>;

/// A revision identifier of the form `<generation>-<digest>`.
///
/// Ordering is by generation, then by digest. That is the order the storage
/// layer uses to pick a winning revision; the replicator only needs to parse
/// and preserve it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RevId {
    generation: u64,
    digest: String,
}

impl RevId {
    /// Creates a revision ID from its parts.
    pub fn new(generation: u64, digest: impl Into<String>) -> Self {
        Self {
            generation,
            digest: digest.into(),
        }
    }

    /// Parses a `<generation>-<digest>` string.
    pub fn parse(text: &str) -> ProtocolResult<Self> {
        let (generation, digest) = text
            .split_once('-')
            .ok_or_else(|| ProtocolError::InvalidRevId(text.to_string()))?;
        if digest.is_empty() || generation.is_empty() {
            return Err(ProtocolError::InvalidRevId(text.to_string()));
        }
        let generation: u64 = generation
            .parse()
            .map_err(|_| ProtocolError::InvalidRevId(text.to_string()))?;
        if generation == 0 {
            return Err(ProtocolError::InvalidRevId(text.to_string()));
        }
        Ok(Self::new(generation, digest))
    }

    /// Returns the generation number.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns the digest suffix.
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl fmt::Display for RevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.digest)
    }
}

impl FromStr for RevId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RevId {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RevId> for String {
    fn from(value: RevId) -> Self {
        value.to_string()
    }
}

impl Ord for RevId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.generation
            .cmp(&other.generation)
            .then_with(|| self.digest.cmp(&other.digest))
    }
}

impl PartialOrd for RevId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// One immutable version of a document.
///
/// `body` holds the user properties plus `_attachments` when present. The
/// reserved `_id`, `_rev`, `_deleted` and `_revisions` keys are never kept in
/// `body`; they are rebuilt by [`Revision::to_document`].
#[derive(Debug, Clone, PartialEq)]
pub struct Revision {
    /// Document ID.
    pub doc_id: String,
    /// Revision ID.
    pub rev_id: RevId,
    /// Whether this revision is a deletion tombstone.
    pub deleted: bool,
    /// Document properties.
    pub body: JsonObject,
}

impl Revision {
    /// Creates a live revision with an empty body.
    pub fn new(doc_id: impl Into<String>, rev_id: RevId) -> Self {
        Self {
            doc_id: doc_id.into(),
            rev_id,
            deleted: false,
            body: JsonObject::new(),
        }
    }

    /// Creates a deletion tombstone.
    pub fn tombstone(doc_id: impl Into<String>, rev_id: RevId) -> Self {
        Self {
            deleted: true,
            ..Self::new(doc_id, rev_id)
        }
    }

    /// Sets the document body.
    pub fn with_body(mut self, body: JsonObject) -> Self {
        self.body = body;
        self
    }

    /// Parses a revision from a full document JSON object.
    pub fn from_document(document: &JsonObject) -> ProtocolResult<Self> {
        let doc_id = document
            .get("_id")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::invalid_structure("document has no _id"))?;
        let rev_id = document
            .get("_rev")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::invalid_structure("document has no _rev"))?;
        let deleted = document
            .get("_deleted")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let body = document
            .iter()
            .filter(|(key, _)| !matches!(key.as_str(), "_id" | "_rev" | "_deleted" | "_revisions"))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Ok(Self {
            doc_id: doc_id.to_string(),
            rev_id: RevId::parse(rev_id)?,
            deleted,
            body,
        })
    }

    /// Renders the revision as a full document JSON object.
    pub fn to_document(&self) -> JsonObject {
        let mut document = JsonObject::new();
        document.insert("_id".into(), Value::String(self.doc_id.clone()));
        document.insert("_rev".into(), Value::String(self.rev_id.to_string()));
        if self.deleted {
            document.insert("_deleted".into(), Value::Bool(true));
        }
        for (key, value) in &self.body {
            document.insert(key.clone(), value.clone());
        }
        document
    }

    /// Returns the `_attachments` object, if any.
    pub fn attachments(&self) -> Option<&JsonObject> {
        self.body.get("_attachments").and_then(Value::as_object)
    }

    /// Returns true if any attachment is marked `"follows": true`.
    ///
    /// Such attachments travel as separate MIME parts rather than inline.
    pub fn has_following_attachments(&self) -> bool {
        self.attachments().is_some_and(|attachments| {
            attachments.values().any(|meta| {
                meta.get("follows")
                    .and_then(Value::as_bool)
                    .unwrap_or(false)
            })
        })
    }
}

/// A revision history in the `_revisions` wire format.
///
/// `ids` holds digests newest first; the revision at index `i` has
/// generation `start - i`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionHistory {
    /// Generation of the newest revision.
    pub start: u64,
    /// Digests, newest first.
    pub ids: Vec<String>,
}

impl RevisionHistory {
    /// Builds a history from revision IDs ordered newest first.
    pub fn from_rev_ids(history: &[RevId]) -> ProtocolResult<Self> {
        let newest = history
            .first()
            .ok_or_else(|| ProtocolError::invalid_structure("empty revision history"))?;
        Ok(Self {
            start: newest.generation(),
            ids: history.iter().map(|rev| rev.digest().to_string()).collect(),
        })
    }

    /// Expands the history back into revision IDs, newest first.
    pub fn to_rev_ids(&self) -> Vec<RevId> {
        self.ids
            .iter()
            .enumerate()
            .take_while(|(index, _)| (*index as u64) < self.start)
            .map(|(index, digest)| RevId::new(self.start - index as u64, digest.clone()))
            .collect()
    }

    /// Reads the `_revisions` property of a document, if present.
    pub fn from_document(document: &JsonObject) -> Option<Self> {
        document
            .get("_revisions")
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// Returns the history as a JSON value.
    pub fn to_value(&self) -> Value {
        serde_json::json!({ "start": self.start, "ids": self.ids })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn parse_rev_id() {
        let rev = RevId::parse("3-abc123").unwrap();
        assert_eq!(rev.generation(), 3);
        assert_eq!(rev.digest(), "abc123");
        assert_eq!(rev.to_string(), "3-abc123");
    }

    #[test]
    fn parse_rev_id_keeps_dashes_in_digest() {
        let rev = RevId::parse("12-ab-cd").unwrap();
        assert_eq!(rev.generation(), 12);
        assert_eq!(rev.digest(), "ab-cd");
    }

    #[test]
    fn parse_rev_id_rejects_garbage() {
        assert!(RevId::parse("").is_err());
        assert!(RevId::parse("abc").is_err());
        assert!(RevId::parse("x-abc").is_err());
        assert!(RevId::parse("0-abc").is_err());
        assert!(RevId::parse("3-").is_err());
    }

    #[test]
    fn rev_id_ordering() {
        let a = RevId::parse("2-zzz").unwrap();
        let b = RevId::parse("10-aaa").unwrap();
        let c = RevId::parse("10-bbb").unwrap();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn rev_id_serde_as_string() {
        let rev = RevId::new(4, "ff");
        assert_eq!(serde_json::to_value(&rev).unwrap(), json!("4-ff"));
        let back: RevId = serde_json::from_value(json!("4-ff")).unwrap();
        assert_eq!(back, rev);
        assert!(serde_json::from_value::<RevId>(json!("nope")).is_err());
    }

    #[test]
    fn revision_document_round_trip_strips_reserved_keys() {
        let document = json!({
            "_id": "doc1",
            "_rev": "2-b",
            "_revisions": {"start": 2, "ids": ["b", "a"]},
            "name": "alice"
        });
        let revision = Revision::from_document(document.as_object().unwrap()).unwrap();
        assert_eq!(revision.doc_id, "doc1");
        assert!(!revision.deleted);
        assert!(!revision.body.contains_key("_revisions"));
        assert_eq!(revision.body["name"], "alice");

        let rendered = revision.to_document();
        assert_eq!(rendered["_id"], "doc1");
        assert_eq!(rendered["_rev"], "2-b");
        assert!(!rendered.contains_key("_deleted"));
    }

    #[test]
    fn tombstone_renders_deleted_flag() {
        let revision = Revision::tombstone("gone", RevId::new(3, "c"));
        assert_eq!(revision.to_document()["_deleted"], true);
    }

    #[test]
    fn following_attachments_detected() {
        let body = json!({"_attachments": {"a.png": {"follows": true, "digest": "sha256-x"}}});
        let revision = Revision::new("d", RevId::new(1, "a"))
            .with_body(body.as_object().unwrap().clone());
        assert!(revision.has_following_attachments());

        let inline = json!({"_attachments": {"a.txt": {"data": "aGk="}}});
        let revision = Revision::new("d", RevId::new(1, "a"))
            .with_body(inline.as_object().unwrap().clone());
        assert!(!revision.has_following_attachments());
    }

    #[test]
    fn history_from_and_to_rev_ids() {
        let revs = vec![RevId::new(3, "c"), RevId::new(2, "b"), RevId::new(1, "a")];
        let history = RevisionHistory::from_rev_ids(&revs).unwrap();
        assert_eq!(history.start, 3);
        assert_eq!(history.ids, vec!["c", "b", "a"]);
        assert_eq!(history.to_rev_ids(), revs);
        assert!(RevisionHistory::from_rev_ids(&[]).is_err());
    }

    #[test]
    fn history_from_document() {
        let document = json!({"_revisions": {"start": 5, "ids": ["e", "d"]}});
        let history = RevisionHistory::from_document(document.as_object().unwrap()).unwrap();
        assert_eq!(history.to_rev_ids()[1], RevId::new(4, "d"));
        assert!(RevisionHistory::from_document(&JsonObject::new()).is_none());
    }

    proptest! {
        #[test]
        fn rev_id_display_parses_back(generation in 1u64..1_000_000, digest in "[a-f0-9]{1,32}") {
            let rev = RevId::new(generation, digest);
            prop_assert_eq!(RevId::parse(&rev.to_string()).unwrap(), rev);
        }
    }
}
