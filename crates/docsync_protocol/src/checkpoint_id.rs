//! Deterministic checkpoint document IDs.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Collects the parameters that identify a replication and digests them
/// into a checkpoint ID.
///
/// Filter parameters and doc IDs are canonicalized first, so two
/// configurations that differ only in insertion order get the same ID.
#[derive(Debug, Clone, Default)]
pub struct CheckpointIdBuilder {
    local_database_id: String,
    remote_url: String,
    remote_uuid: Option<String>,
    push: bool,
    filter: Option<String>,
    filter_params: BTreeMap<String, Value>,
    doc_ids: Vec<String>,
}

impl CheckpointIdBuilder {
    /// Starts a builder for a local database and remote URL.
    pub fn new(local_database_id: impl Into<String>, remote_url: impl Into<String>) -> Self {
        Self {
            local_database_id: local_database_id.into(),
            remote_url: remote_url.into(),
            ..Self::default()
        }
    }

    /// Sets the replication direction.
    pub fn push(mut self, push: bool) -> Self {
        self.push = push;
        self
    }

    /// Replaces the remote URL in the digest with a stable server UUID.
    pub fn remote_uuid(mut self, uuid: Option<String>) -> Self {
        self.remote_uuid = uuid;
        self
    }

    /// Sets the filter name.
    pub fn filter(mut self, filter: Option<String>) -> Self {
        self.filter = filter;
        self
    }

    /// Adds filter parameters.
    pub fn filter_params<I, K>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        self.filter_params
            .extend(params.into_iter().map(|(key, value)| (key.into(), value)));
        self
    }

    /// Sets the doc-ID allowlist.
    pub fn doc_ids<I, S>(mut self, doc_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.doc_ids = doc_ids.into_iter().map(Into::into).collect();
        self
    }

    /// Computes the checkpoint ID as lowercase hex SHA-256.
    pub fn build(&self) -> String {
        let mut doc_ids = self.doc_ids.clone();
        doc_ids.sort();
        doc_ids.dedup();

        let params: serde_json::Map<String, Value> = self
            .filter_params
            .iter()
            .map(|(key, value)| (key.clone(), canonical(value)))
            .collect();

        let remote = self.remote_uuid.as_deref().unwrap_or(&self.remote_url);
        let material = Value::Array(vec![
            Value::from(self.local_database_id.as_str()),
            Value::from(remote),
            Value::Bool(self.push),
            self.filter.as_deref().map_or(Value::Null, Value::from),
            Value::Object(params),
            Value::from(doc_ids),
        ]);

        let mut hasher = Sha256::new();
        hasher.update(material.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Rebuilds a JSON value with object keys in sorted order.
fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            Value::Object(
                keys.into_iter()
                    .map(|key| (key.clone(), canonical(&map[key])))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn base() -> CheckpointIdBuilder {
        CheckpointIdBuilder::new("db-uuid", "http://host:4984/db")
    }

    #[test]
    fn id_is_hex_sha256() {
        let id = base().build();
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id, base().build());
    }

    #[test]
    fn param_order_does_not_matter() {
        let a = base()
            .filter(Some("app/f".into()))
            .filter_params([("a", json!(1)), ("b", json!({"y": 1, "x": 2}))])
            .build();
        let b = base()
            .filter(Some("app/f".into()))
            .filter_params([("b", json!({"x": 2, "y": 1})), ("a", json!(1))])
            .build();
        assert_eq!(a, b);
    }

    #[test]
    fn doc_id_order_does_not_matter() {
        let a = base().doc_ids(["b", "a", "c"]).build();
        let b = base().doc_ids(["c", "a", "b"]).build();
        assert_eq!(a, b);
    }

    #[test]
    fn each_component_changes_the_id() {
        let reference = base()
            .filter(Some("f".into()))
            .filter_params([("p", json!("v"))])
            .doc_ids(["d1"]);
        let id = reference.clone().build();
        assert_ne!(id, reference.clone().filter(Some("g".into())).build());
        assert_ne!(id, reference.clone().filter_params([("p", json!("w"))]).build());
        assert_ne!(id, reference.clone().doc_ids(["d1", "d2"]).build());
        assert_ne!(id, reference.clone().push(true).build());
        assert_ne!(id, reference.clone().remote_uuid(Some("srv".into())).build());
    }

    #[test]
    fn remote_uuid_replaces_url() {
        let a = CheckpointIdBuilder::new("db", "http://one/db")
            .remote_uuid(Some("server-1".into()))
            .build();
        let b = CheckpointIdBuilder::new("db", "http://two/db")
            .remote_uuid(Some("server-1".into()))
            .build();
        assert_eq!(a, b);
    }

    proptest! {
        #[test]
        fn shuffled_inputs_share_an_id(
            params in proptest::collection::btree_map("[a-z]{1,6}", "[a-z0-9]{0,6}", 0..6),
            doc_ids in proptest::collection::vec("[a-z0-9]{1,8}", 0..8),
        ) {
            let forward: Vec<(String, Value)> =
                params.iter().map(|(k, v)| (k.clone(), json!(v))).collect();
            let mut backward = forward.clone();
            backward.reverse();
            let mut reversed_ids = doc_ids.clone();
            reversed_ids.reverse();

            let a = base().filter(Some("f".into())).filter_params(forward).doc_ids(doc_ids).build();
            let b = base().filter(Some("f".into())).filter_params(backward).doc_ids(reversed_ids).build();
            prop_assert_eq!(a, b);
        }
    }
}
