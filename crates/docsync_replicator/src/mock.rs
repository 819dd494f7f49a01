//! Scripted HTTP client for tests.

use crate::transport::{HttpClient, HttpMethod, HttpRequest, HttpResponse, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::VecDeque;

/// What the mock does with a matching request.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Answer with a response.
    Respond(HttpResponse),
    /// Fail at the transport level.
    Fail(TransportError),
    /// Never answer; the caller must cancel the request.
    Hang,
}

impl MockReply {
    /// JSON response shorthand.
    pub fn json(status: u16, value: serde_json::Value) -> Self {
        Self::Respond(HttpResponse::json(status, &value))
    }

    /// `{"error":"not_found"}` with status 404.
    pub fn not_found() -> Self {
        Self::json(404, json!({"error": "not_found", "reason": "missing"}))
    }
}

impl From<HttpResponse> for MockReply {
    fn from(response: HttpResponse) -> Self {
        Self::Respond(response)
    }
}

#[derive(Debug)]
struct Rule {
    method: Option<HttpMethod>,
    pattern: String,
    queued: VecDeque<MockReply>,
    sticky: Option<MockReply>,
}

impl Rule {
    fn matches(&self, request: &HttpRequest) -> bool {
        self.method.map_or(true, |method| method == request.method)
            && request.url.contains(&self.pattern)
    }

    fn next_reply(&mut self) -> Option<MockReply> {
        self.queued.pop_front().or_else(|| self.sticky.clone())
    }
}

/// An [`HttpClient`] that replays scripted replies and records requests.
///
/// Rules match on method (optional) and a URL substring. Queued replies are
/// used once, in order; a sticky reply answers every match after the queue
/// is exhausted. The first rule with a reply available wins. Unmatched
/// requests get a 404.
#[derive(Debug, Default)]
pub struct MockHttpClient {
    rules: Mutex<Vec<Rule>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl MockHttpClient {
    /// Creates a mock with no rules.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_rule<F>(&self, method: Option<HttpMethod>, pattern: &str, update: F)
    where
        F: FnOnce(&mut Rule),
    {
        let mut rules = self.rules.lock();
        let index = match rules
            .iter()
            .position(|rule| rule.method == method && rule.pattern == pattern)
        {
            Some(index) => index,
            None => {
                rules.push(Rule {
                    method,
                    pattern: pattern.to_string(),
                    queued: VecDeque::new(),
                    sticky: None,
                });
                rules.len() - 1
            }
        };
        update(&mut rules[index]);
    }

    /// Queues a one-shot reply for requests matching `method` and `pattern`.
    pub fn enqueue(&self, method: HttpMethod, pattern: &str, reply: impl Into<MockReply>) {
        let reply = reply.into();
        self.with_rule(Some(method), pattern, |rule| rule.queued.push_back(reply));
    }

    /// Sets the reply used once the queue for `method`/`pattern` is empty.
    pub fn set_sticky(&self, method: HttpMethod, pattern: &str, reply: impl Into<MockReply>) {
        let reply = reply.into();
        self.with_rule(Some(method), pattern, |rule| rule.sticky = Some(reply));
    }

    /// Sets a sticky reply for any method.
    pub fn set_sticky_any(&self, pattern: &str, reply: impl Into<MockReply>) {
        let reply = reply.into();
        self.with_rule(None, pattern, |rule| rule.sticky = Some(reply));
    }

    /// Returns every request received so far.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    /// Returns requests whose method and URL match.
    pub fn requests_matching(&self, method: HttpMethod, pattern: &str) -> Vec<HttpRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|request| request.method == method && request.url.contains(pattern))
            .cloned()
            .collect()
    }

    /// Counts requests whose method and URL match.
    pub fn count(&self, method: HttpMethod, pattern: &str) -> usize {
        self.requests_matching(method, pattern).len()
    }

    /// Forgets recorded requests.
    pub fn clear_requests(&self) {
        self.requests.lock().clear();
    }

    fn reply_for(&self, request: &HttpRequest) -> MockReply {
        let mut rules = self.rules.lock();
        rules
            .iter_mut()
            .filter(|rule| rule.matches(request))
            .find_map(Rule::next_reply)
            .unwrap_or_else(MockReply::not_found)
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let reply = self.reply_for(&request);
        self.requests.lock().push(request);
        match reply {
            MockReply::Respond(response) => Ok(response),
            MockReply::Fail(error) => Err(error),
            MockReply::Hang => std::future::pending().await,
        }
    }
}
