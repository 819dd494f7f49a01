//! Pluggable authentication.
//!
//! An [`Authenticator`] either decorates every request with an
//! `Authorization` header or performs a cookie login before the replication
//! starts. The cookie jar itself belongs to the [`HttpClient`](crate::HttpClient).

use crate::error::ReplicationResult;
use crate::executor::RetryingExecutor;
use crate::transport::HttpRequest;
use base64::prelude::{Engine as _, BASE64_STANDARD};
use docsync_protocol::{build_relative_url, mask_credentials};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::fmt;
use tracing::{debug, info};

/// Supplies credentials to the replicator.
pub trait Authenticator: Send + Sync {
    /// Value of the `Authorization` header added to every request.
    fn authorization_header(&self) -> Option<String> {
        None
    }

    /// Returns true if the authenticator logs in to obtain a session cookie.
    fn uses_cookie_login(&self) -> bool {
        false
    }

    /// Builds the login request for a database URL.
    fn login_request(&self, db_url: &str) -> ReplicationResult<Option<HttpRequest>> {
        let _ = db_url;
        Ok(None)
    }
}

/// HTTP Basic authentication.
#[derive(Clone)]
pub struct BasicAuthenticator {
    username: String,
    password: String,
}

impl BasicAuthenticator {
    /// Creates a Basic authenticator.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl Authenticator for BasicAuthenticator {
    fn authorization_header(&self) -> Option<String> {
        let credentials = format!("{}:{}", self.username, self.password);
        Some(format!("Basic {}", BASE64_STANDARD.encode(credentials)))
    }
}

impl fmt::Debug for BasicAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuthenticator")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Name/password login against `_session`.
#[derive(Clone)]
pub struct SessionAuthenticator {
    username: String,
    password: String,
}

impl SessionAuthenticator {
    /// Creates a session authenticator.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl Authenticator for SessionAuthenticator {
    fn uses_cookie_login(&self) -> bool {
        true
    }

    fn login_request(&self, db_url: &str) -> ReplicationResult<Option<HttpRequest>> {
        let body = json!({ "name": self.username, "password": self.password });
        let request = HttpRequest::post(build_relative_url(db_url, "_session")).with_json(&body)?;
        Ok(Some(request))
    }
}

impl fmt::Debug for SessionAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionAuthenticator")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Token exchange against a provider endpoint such as `_facebook`.
#[derive(Clone)]
pub struct TokenAuthenticator {
    login_path: String,
    params: Map<String, Value>,
}

impl TokenAuthenticator {
    /// Creates an authenticator that POSTs `params` to `login_path`.
    pub fn new(login_path: impl Into<String>, params: Map<String, Value>) -> Self {
        Self {
            login_path: login_path.into(),
            params,
        }
    }

    /// Facebook token login.
    pub fn facebook(access_token: impl Into<String>, email: impl Into<String>) -> Self {
        let mut params = Map::new();
        params.insert("access_token".into(), Value::String(access_token.into()));
        params.insert("email".into(), Value::String(email.into()));
        Self::new("_facebook", params)
    }
}

impl Authenticator for TokenAuthenticator {
    fn uses_cookie_login(&self) -> bool {
        true
    }

    fn login_request(&self, db_url: &str) -> ReplicationResult<Option<HttpRequest>> {
        let mut body = self.params.clone();
        body.entry("remote_url")
            .or_insert_with(|| Value::String(db_url.to_string()));
        let request =
            HttpRequest::post(build_relative_url(db_url, &self.login_path)).with_json(&body)?;
        Ok(Some(request))
    }
}

impl fmt::Debug for TokenAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenAuthenticator")
            .field("login_path", &self.login_path)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default, Deserialize)]
struct SessionResponse {
    #[serde(default, rename = "userCtx")]
    user_ctx: UserContext,
}

#[derive(Debug, Default, Deserialize)]
struct UserContext {
    #[serde(default)]
    name: Option<String>,
}

/// Makes sure a cookie-login authenticator holds a live session.
///
/// Asks `{db}/_session` (or `/_session` if the database-scoped endpoint is
/// missing) who we are; if nobody, runs the authenticator's login request.
/// Authenticators that do not use cookie login are left alone.
pub async fn check_session(executor: &RetryingExecutor) -> ReplicationResult<()> {
    let Some(authenticator) = executor.authenticator() else {
        return Ok(());
    };
    if !authenticator.uses_cookie_login() {
        return Ok(());
    }

    let response = match executor.get("_session").await {
        Err(error) if error.status() == Some(404) => executor.get("/_session").await?,
        other => other?,
    };
    let session: SessionResponse = response.json_body()?;
    if let Some(name) = session.user_ctx.name.filter(|name| !name.is_empty()) {
        debug!(user = %name, "session is active");
        return Ok(());
    }

    let Some(login) = authenticator.login_request(executor.db_url())? else {
        return Ok(());
    };
    let url = mask_credentials(&login.url);
    executor.execute(login).await?;
    info!(url = %url, "logged in");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::error::ReplicationError;
    use crate::mock::{MockHttpClient, MockReply};
    use crate::signal::StopSignal;
    use crate::transport::HttpMethod;
    use std::sync::Arc;

    fn executor(mock: &Arc<MockHttpClient>, auth: Arc<dyn Authenticator>) -> RetryingExecutor {
        RetryingExecutor::new(
            mock.clone(),
            "http://h:4984/db",
            RetryConfig::no_retry(),
            2,
            StopSignal::never(),
        )
        .with_authenticator(Some(auth))
    }

    #[test]
    fn basic_header() {
        let auth = BasicAuthenticator::new("Aladdin", "open sesame");
        assert_eq!(
            auth.authorization_header().as_deref(),
            Some("Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ==")
        );
        assert!(!auth.uses_cookie_login());
        assert!(auth.login_request("http://h/db").unwrap().is_none());
        assert!(!format!("{auth:?}").contains("open sesame"));
    }

    #[test]
    fn session_login_request() {
        let auth = SessionAuthenticator::new("bob", "pw");
        let request = auth.login_request("http://h/db").unwrap().unwrap();
        assert_eq!(request.url, "http://h/db/_session");
        let body: Value = request.body_json().unwrap();
        assert_eq!(body, json!({"name": "bob", "password": "pw"}));
    }

    #[test]
    fn facebook_login_request() {
        let auth = TokenAuthenticator::facebook("tok", "a@b.c");
        let request = auth.login_request("http://h/db").unwrap().unwrap();
        assert_eq!(request.url, "http://h/db/_facebook");
        let body: Value = request.body_json().unwrap();
        assert_eq!(body["access_token"], "tok");
        assert_eq!(body["remote_url"], "http://h/db");
    }

    #[tokio::test]
    async fn logs_in_when_no_session() {
        let mock = Arc::new(MockHttpClient::new());
        mock.set_sticky(
            HttpMethod::Get,
            "/db/_session",
            MockReply::json(200, json!({"ok": true, "userCtx": {"name": null}})),
        );
        mock.set_sticky(HttpMethod::Post, "/db/_session", MockReply::json(200, json!({"ok": true})));

        let executor = executor(&mock, Arc::new(SessionAuthenticator::new("bob", "pw")));
        check_session(&executor).await.unwrap();
        assert_eq!(mock.count(HttpMethod::Post, "/_session"), 1);
    }

    #[tokio::test]
    async fn skips_login_with_active_session() {
        let mock = Arc::new(MockHttpClient::new());
        mock.set_sticky(
            HttpMethod::Get,
            "/db/_session",
            MockReply::json(200, json!({"userCtx": {"name": "bob"}})),
        );
        let executor = executor(&mock, Arc::new(SessionAuthenticator::new("bob", "pw")));
        check_session(&executor).await.unwrap();
        assert_eq!(mock.count(HttpMethod::Post, "/_session"), 0);
    }

    #[tokio::test]
    async fn falls_back_to_server_session() {
        let mock = Arc::new(MockHttpClient::new());
        mock.set_sticky(HttpMethod::Get, "/db/_session", MockReply::not_found());
        mock.set_sticky(
            HttpMethod::Get,
            "h:4984/_session",
            MockReply::json(200, json!({"userCtx": {"name": "bob"}})),
        );
        let executor = executor(&mock, Arc::new(SessionAuthenticator::new("bob", "pw")));
        check_session(&executor).await.unwrap();
        let urls: Vec<String> = mock.requests().into_iter().map(|r| r.url).collect();
        assert_eq!(
            urls,
            vec!["http://h:4984/db/_session", "http://h:4984/_session"]
        );
    }

    #[tokio::test]
    async fn rejected_login_is_authentication_error() {
        let mock = Arc::new(MockHttpClient::new());
        mock.set_sticky(
            HttpMethod::Get,
            "/db/_session",
            MockReply::json(200, json!({"userCtx": {"name": null}})),
        );
        mock.set_sticky(
            HttpMethod::Post,
            "/db/_session",
            MockReply::json(401, json!({"error": "unauthorized"})),
        );
        let executor = executor(&mock, Arc::new(SessionAuthenticator::new("bob", "bad")));
        let err = check_session(&executor).await.unwrap_err();
        assert!(matches!(err, ReplicationError::Authentication { .. }));
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn basic_auth_needs_no_session_check() {
        let mock = Arc::new(MockHttpClient::new());
        let executor = executor(&mock, Arc::new(BasicAuthenticator::new("bob", "pw")));
        check_session(&executor).await.unwrap();
        assert!(mock.requests().is_empty());
    }
}
