//! Change-feed request construction.
//!
//! The query string layout is fixed so that two trackers configured the same
//! way produce byte-identical requests:
//!
//! ```text
//! _changes?feed=<mode>&heartbeat=<ms>[&style=all_docs]&since=<token>&limit=<n>
//!     [&filter=<name>&<param>=<value>...]
//!     [&filter=_doc_ids&doc_ids=<json array>]
//! ```

use crate::error::ProtocolResult;
use crate::revision::JsonObject;
use crate::sequence::Sequence;
use crate::url::form_encode;
use serde_json::Value;
use std::collections::BTreeMap;

/// Default long-poll heartbeat in milliseconds.
pub const DEFAULT_HEARTBEAT_MS: u64 = 300_000;

/// Default number of rows per feed response.
pub const DEFAULT_FEED_LIMIT: usize = 50;

/// Filter name used for doc-ID allowlists.
const DOC_IDS_FILTER: &str = "_doc_ids";

/// How the change feed is consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedMode {
    /// `feed=normal`: page through the backlog, then finish.
    OneShot,
    /// `feed=longpoll`: each request waits for new changes or a heartbeat.
    LongPoll,
    /// `feed=continuous`. Rendered for completeness only; trackers refuse it.
    Continuous,
}

impl FeedMode {
    /// Returns the `feed` query value.
    pub fn as_str(self) -> &'static str {
        match self {
            FeedMode::OneShot => "normal",
            FeedMode::LongPoll => "longpoll",
            FeedMode::Continuous => "continuous",
        }
    }
}

/// Parameters of one `_changes` request.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangesFeedRequest {
    /// Feed mode.
    pub mode: FeedMode,
    /// Resume point.
    pub since: Sequence,
    /// Heartbeat interval in milliseconds.
    pub heartbeat_ms: u64,
    /// Maximum rows per response.
    pub limit: usize,
    /// Request every leaf revision (`style=all_docs`).
    pub include_conflicts: bool,
    /// Server-side filter function name.
    pub filter: Option<String>,
    /// Filter parameters, kept sorted by key.
    pub filter_params: BTreeMap<String, Value>,
    /// Doc-ID allowlist; takes precedence over `filter`.
    pub doc_ids: Option<Vec<String>>,
    /// Send parameters as a JSON POST body instead of the query string.
    pub use_post: bool,
}

impl ChangesFeedRequest {
    /// Creates a request with default heartbeat, limit and `style=all_docs`.
    pub fn new(mode: FeedMode) -> Self {
        Self {
            mode,
            since: Sequence::zero(),
            heartbeat_ms: DEFAULT_HEARTBEAT_MS,
            limit: DEFAULT_FEED_LIMIT,
            include_conflicts: true,
            filter: None,
            filter_params: BTreeMap::new(),
            doc_ids: None,
            use_post: false,
        }
    }

    /// Sets the resume point.
    pub fn with_since(mut self, since: Sequence) -> Self {
        self.since = since;
        self
    }

    /// Sets the heartbeat interval.
    pub fn with_heartbeat(mut self, heartbeat_ms: u64) -> Self {
        self.heartbeat_ms = heartbeat_ms;
        self
    }

    /// Sets the page size.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Enables or disables `style=all_docs`.
    pub fn with_conflicts(mut self, include_conflicts: bool) -> Self {
        self.include_conflicts = include_conflicts;
        self
    }

    /// Sets a named filter and its parameters.
    pub fn with_filter(
        mut self,
        name: impl Into<String>,
        params: BTreeMap<String, Value>,
    ) -> Self {
        self.filter = Some(name.into());
        self.filter_params = params;
        self
    }

    /// Restricts the feed to the given document IDs.
    pub fn with_doc_ids(mut self, doc_ids: Vec<String>) -> Self {
        self.doc_ids = Some(doc_ids);
        self
    }

    /// Switches between GET and POST.
    pub fn with_post(mut self, use_post: bool) -> Self {
        self.use_post = use_post;
        self
    }

    fn active_doc_ids(&self) -> Option<&[String]> {
        self.doc_ids.as_deref().filter(|ids| !ids.is_empty())
    }

    fn filter_name(&self) -> Option<&str> {
        if self.active_doc_ids().is_some() {
            Some(DOC_IDS_FILTER)
        } else {
            self.filter.as_deref()
        }
    }

    /// Renders the path relative to the database URL.
    ///
    /// In POST mode the filter name stays in the query string while filter
    /// parameters and doc IDs move into the body.
    pub fn path(&self) -> String {
        let mut path = format!(
            "_changes?feed={}&heartbeat={}",
            self.mode.as_str(),
            self.heartbeat_ms
        );
        if self.include_conflicts {
            path.push_str("&style=all_docs");
        }
        path.push_str("&since=");
        path.push_str(&form_encode(&self.since.to_string()));
        path.push_str(&format!("&limit={}", self.limit));

        let Some(filter) = self.filter_name() else {
            return path;
        };
        path.push_str("&filter=");
        path.push_str(&form_encode(filter));
        if self.use_post {
            return path;
        }

        if let Some(doc_ids) = self.active_doc_ids() {
            let json = Value::from(doc_ids.to_vec()).to_string();
            path.push_str("&doc_ids=");
            path.push_str(&form_encode(&json));
        } else {
            for (key, value) in &self.filter_params {
                path.push('&');
                path.push_str(&form_encode(key));
                path.push('=');
                path.push_str(&form_encode(&param_text(value)));
            }
        }
        path
    }

    /// Builds the JSON body sent in POST mode.
    ///
    /// `since` is sent in its raw form and filter parameters become top-level
    /// keys, as servers expect.
    pub fn post_body(&self) -> JsonObject {
        let mut body = JsonObject::new();
        body.insert("feed".into(), Value::from(self.mode.as_str()));
        body.insert("heartbeat".into(), Value::from(self.heartbeat_ms));
        if self.include_conflicts {
            body.insert("style".into(), Value::from("all_docs"));
        }
        body.insert("since".into(), self.since.to_json());
        body.insert("limit".into(), Value::from(self.limit));

        if let Some(filter) = self.filter_name() {
            body.insert("filter".into(), Value::from(filter));
        }
        if let Some(doc_ids) = self.active_doc_ids() {
            body.insert("doc_ids".into(), Value::from(doc_ids.to_vec()));
        } else if self.filter.is_some() {
            for (key, value) in &self.filter_params {
                body.insert(key.clone(), value.clone());
            }
        }
        body
    }

    /// Serializes [`Self::post_body`].
    pub fn post_body_bytes(&self) -> ProtocolResult<Vec<u8>> {
        Ok(serde_json::to_vec(&self.post_body())?)
    }
}

fn param_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_longpoll_path() {
        let request = ChangesFeedRequest::new(FeedMode::LongPoll);
        assert_eq!(
            request.path(),
            "_changes?feed=longpoll&heartbeat=300000&style=all_docs&since=0&limit=50"
        );
    }

    #[test]
    fn compound_since_is_encoded_in_path_but_raw_in_body() {
        let request = ChangesFeedRequest::new(FeedMode::LongPoll).with_since("1234:56".into());
        assert_eq!(
            request.path(),
            "_changes?feed=longpoll&heartbeat=300000&style=all_docs&since=1234%3A56&limit=50"
        );
        let request = request.with_post(true);
        assert_eq!(
            request.path(),
            "_changes?feed=longpoll&heartbeat=300000&style=all_docs&since=1234%3A56&limit=50"
        );
        let body = request.post_body();
        assert_eq!(body["since"], "1234:56");
        assert_eq!(body["feed"], "longpoll");
        assert_eq!(body["limit"], 50);
        assert_eq!(body["heartbeat"], 300_000);
        assert_eq!(body["style"], "all_docs");
    }

    #[test]
    fn one_shot_uses_normal_feed() {
        let request = ChangesFeedRequest::new(FeedMode::OneShot).with_since(12.into());
        assert!(request.path().starts_with("_changes?feed=normal&"));
        assert!(request.path().contains("&since=12&"));
    }

    #[test]
    fn filter_params_in_query_or_body() {
        let mut params = BTreeMap::new();
        params.insert("param".to_string(), json!("value"));
        let request = ChangesFeedRequest::new(FeedMode::LongPoll)
            .with_conflicts(false)
            .with_filter("filter", params);
        assert_eq!(
            request.path(),
            "_changes?feed=longpoll&heartbeat=300000&since=0&limit=50&filter=filter&param=value"
        );

        let request = request.with_post(true);
        assert_eq!(
            request.path(),
            "_changes?feed=longpoll&heartbeat=300000&since=0&limit=50&filter=filter"
        );
        let body = request.post_body();
        assert_eq!(body["filter"], "filter");
        assert_eq!(body["param"], "value");
    }

    #[test]
    fn filter_params_are_sorted_and_encoded() {
        let mut params = BTreeMap::new();
        params.insert("zeta".to_string(), json!("a b"));
        params.insert("alpha".to_string(), json!(3));
        let request = ChangesFeedRequest::new(FeedMode::LongPoll).with_filter("app/by", params);
        assert!(request
            .path()
            .ends_with("&filter=app%2Fby&alpha=3&zeta=a+b"));
    }

    #[test]
    fn doc_ids_filter() {
        let request = ChangesFeedRequest::new(FeedMode::LongPoll)
            .with_conflicts(false)
            .with_doc_ids(vec!["doc1".into(), "doc2".into()]);
        assert_eq!(
            request.path(),
            "_changes?feed=longpoll&heartbeat=300000&since=0&limit=50&filter=_doc_ids&doc_ids=%5B%22doc1%22%2C%22doc2%22%5D"
        );

        let request = request.with_post(true);
        assert_eq!(
            request.path(),
            "_changes?feed=longpoll&heartbeat=300000&since=0&limit=50&filter=_doc_ids"
        );
        let body = request.post_body();
        assert_eq!(body["filter"], "_doc_ids");
        assert_eq!(body["doc_ids"], json!(["doc1", "doc2"]));
        let raw = String::from_utf8(request.post_body_bytes().unwrap()).unwrap();
        assert!(raw.contains(r#"["doc1","doc2"]"#));
    }

    #[test]
    fn empty_doc_ids_are_ignored() {
        let request = ChangesFeedRequest::new(FeedMode::LongPoll).with_doc_ids(Vec::new());
        assert!(!request.path().contains("filter"));
    }
}
