//! Retrying request executor.
//!
//! Every HTTP exchange the engine makes goes through [`RetryingExecutor`].
//! It classifies each outcome, retries transient failures with exponential
//! backoff and returns permanent failures at once. Backoff sleeps happen on
//! the calling task after the connection permit is released, so a burst of
//! retrying requests never starves fresh requests of connections.

use crate::auth::Authenticator;
use crate::config::RetryConfig;
use crate::error::{ReplicationError, ReplicationResult};
use crate::signal::StopSignal;
use crate::transport::{HttpClient, HttpMethod, HttpRequest, HttpResponse, TransportError};
use docsync_protocol::{build_relative_url, mask_credentials};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// How one attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// The server answered with this status.
    Status(u16),
    /// The exchange failed before a response arrived.
    Transport(TransportError),
}

/// One attempt of one logical request.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptRecord {
    /// Zero-based attempt number.
    pub attempt: u32,
    /// Request method.
    pub method: HttpMethod,
    /// Request URL.
    pub url: String,
    /// Outcome of the attempt.
    pub outcome: AttemptOutcome,
}

/// Receives every attempt the executor makes.
pub trait AttemptObserver: Send + Sync {
    /// Called after each attempt, successful or not.
    fn on_attempt(&self, record: &AttemptRecord);
}

impl<F> AttemptObserver for F
where
    F: Fn(&AttemptRecord) + Send + Sync,
{
    fn on_attempt(&self, record: &AttemptRecord) {
        self(record)
    }
}

/// Executes requests against one remote database with retries.
///
/// Cloning is cheap; clones share the connection limit, the observer and
/// the recorded `Server` header.
#[derive(Clone)]
pub struct RetryingExecutor {
    http: Arc<dyn HttpClient>,
    db_url: String,
    retry: RetryConfig,
    permits: Arc<Semaphore>,
    stop: StopSignal,
    headers: Arc<Vec<(String, String)>>,
    authenticator: Option<Arc<dyn Authenticator>>,
    observer: Option<Arc<dyn AttemptObserver>>,
    server: Arc<Mutex<Option<String>>>,
}

impl RetryingExecutor {
    /// Creates an executor for `db_url`.
    pub fn new(
        http: Arc<dyn HttpClient>,
        db_url: impl Into<String>,
        retry: RetryConfig,
        max_open_connections: usize,
        stop: StopSignal,
    ) -> Self {
        Self {
            http,
            db_url: db_url.into().trim_end_matches('/').to_string(),
            retry,
            permits: Arc::new(Semaphore::new(max_open_connections.max(1))),
            stop,
            headers: Arc::new(Vec::new()),
            authenticator: None,
            observer: None,
            server: Arc::new(Mutex::new(None)),
        }
    }

    /// Adds headers to every request.
    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers = Arc::new(headers);
        self
    }

    /// Attaches an authenticator.
    pub fn with_authenticator(mut self, authenticator: Option<Arc<dyn Authenticator>>) -> Self {
        self.authenticator = authenticator;
        self
    }

    /// Attaches an attempt observer.
    pub fn with_observer(mut self, observer: Option<Arc<dyn AttemptObserver>>) -> Self {
        self.observer = observer;
        self
    }

    /// Returns a clone that uses a different retry policy.
    pub fn with_retry(&self, retry: RetryConfig) -> Self {
        Self {
            retry,
            ..self.clone()
        }
    }

    /// Returns a clone that observes a different stop signal.
    pub fn with_stop(&self, stop: StopSignal) -> Self {
        Self {
            stop,
            ..self.clone()
        }
    }

    /// Returns the database URL.
    pub fn db_url(&self) -> &str {
        &self.db_url
    }

    /// Resolves a path against the database URL.
    pub fn url(&self, relative: &str) -> String {
        build_relative_url(&self.db_url, relative)
    }

    /// Returns the retry policy.
    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }

    /// Returns the attached authenticator.
    pub fn authenticator(&self) -> Option<&Arc<dyn Authenticator>> {
        self.authenticator.as_ref()
    }

    /// Returns the `Server` header of the most recent response that had one.
    pub fn server_header(&self) -> Option<String> {
        self.server.lock().clone()
    }

    /// GET `relative`.
    pub async fn get(&self, relative: &str) -> ReplicationResult<HttpResponse> {
        self.execute(HttpRequest::get(self.url(relative))).await
    }

    /// POST a JSON body to `relative`.
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        relative: &str,
        body: &T,
    ) -> ReplicationResult<HttpResponse> {
        self.execute(HttpRequest::post(self.url(relative)).with_json(body)?)
            .await
    }

    /// PUT a JSON body to `relative`.
    pub async fn put_json<T: Serialize + ?Sized>(
        &self,
        relative: &str,
        body: &T,
    ) -> ReplicationResult<HttpResponse> {
        self.execute(HttpRequest::put(self.url(relative)).with_json(body)?)
            .await
    }

    /// Executes `request`, retrying transient failures.
    ///
    /// Returns the first 2xx response. A non-2xx response or a transport
    /// failure becomes a [`ReplicationError`]; retryable ones are attempted
    /// again after `retry.delay_for_attempt(n)` until `max_retries + 1`
    /// attempts were made. A stop signal cancels the backoff sleep but not
    /// an attempt already on the wire.
    pub async fn execute(&self, request: HttpRequest) -> ReplicationResult<HttpResponse> {
        let request = self.decorate(request);
        let max_attempts = self.retry.max_attempts();
        let mut attempt = 0;
        loop {
            let error = match self.attempt(&request, attempt).await {
                Ok(response) => return Ok(response),
                Err(error) => error,
            };
            attempt += 1;
            if !error.is_retryable() || attempt >= max_attempts {
                if error.is_retryable() {
                    warn!(
                        method = %request.method,
                        url = %mask_credentials(&request.url),
                        attempts = attempt,
                        error = %error,
                        "giving up after retries"
                    );
                }
                return Err(error);
            }

            let delay = self.retry.delay_for_attempt(attempt - 1);
            debug!(
                method = %request.method,
                url = %mask_credentials(&request.url),
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying request"
            );
            tokio::select! {
                _ = self.stop.stopped() => return Err(ReplicationError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn attempt(&self, request: &HttpRequest, attempt: u32) -> ReplicationResult<HttpResponse> {
        let result = {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| ReplicationError::Cancelled)?;
            self.http.execute(request.clone()).await
        };

        if let Some(observer) = &self.observer {
            observer.on_attempt(&AttemptRecord {
                attempt,
                method: request.method,
                url: request.url.clone(),
                outcome: match &result {
                    Ok(response) => AttemptOutcome::Status(response.status),
                    Err(error) => AttemptOutcome::Transport(error.clone()),
                },
            });
        }

        let response = result?;
        if let Some(server) = response.header("Server") {
            *self.server.lock() = Some(server.to_string());
        }
        if response.is_success() {
            Ok(response)
        } else {
            Err(ReplicationError::from_response(&response))
        }
    }

    fn decorate(&self, mut request: HttpRequest) -> HttpRequest {
        for (name, value) in self.headers.iter() {
            if request.header(name).is_none() {
                request.headers.push((name.clone(), value.clone()));
            }
        }
        if request.header("Authorization").is_none() {
            if let Some(value) = self
                .authenticator
                .as_ref()
                .and_then(|auth| auth.authorization_header())
            {
                request.headers.push(("Authorization".into(), value));
            }
        }
        request
    }
}

impl fmt::Debug for RetryingExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryingExecutor")
            .field("db_url", &mask_credentials(&self.db_url))
            .field("retry", &self.retry)
            .field("available_permits", &self.permits.available_permits())
            .finish()
    }
}
