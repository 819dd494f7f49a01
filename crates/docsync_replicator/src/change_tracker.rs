//! Remote change-feed tracker.
//!
//! The tracker owns the `_changes` connection of a pull replication. It
//! pages through the backlog with `feed=normal`, reports "caught up" on the
//! first short page, then either finishes (one-shot) or switches to
//! `feed=longpoll` and keeps waiting for new changes. Transient and decoding
//! failures reconnect with exponential backoff; any other failure ends the
//! tracker. Every path out of the loop reports `stopped` exactly once.

use crate::config::BackoffConfig;
use crate::error::{ReplicationError, ReplicationResult};
use crate::executor::RetryingExecutor;
use crate::signal::{StopSignal, StopTrigger};
use crate::transport::{HttpRequest, HttpResponse};
use async_trait::async_trait;
use docsync_protocol::{mask_credentials, ChangeEntry, ChangesFeedRequest, ChangesResponse, FeedMode, Sequence};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Receives what the tracker sees.
///
/// Calls are made from the tracker task in feed order; the tracker waits for
/// each call to finish, so a slow client slows the feed down.
#[async_trait]
pub trait ChangeTrackerClient: Send + Sync {
    /// A change row arrived.
    async fn change_received(&self, change: ChangeEntry);

    /// The backlog is drained. Called at most once.
    async fn caught_up(&self);

    /// The tracker ended, with the error that ended it if any. Called
    /// exactly once.
    async fn stopped(&self, error: Option<ReplicationError>);
}

/// Follows a remote `_changes` feed.
pub struct ChangeTracker {
    executor: RetryingExecutor,
    request: ChangesFeedRequest,
    backoff: BackoffConfig,
    max_reconnects: u32,
    client: Arc<dyn ChangeTrackerClient>,
}

impl ChangeTracker {
    /// Creates a tracker.
    ///
    /// `request.mode` selects one-shot or long-poll behaviour and
    /// `request.since` the starting point. The executor should not retry on
    /// its own; the tracker applies `backoff` between reconnects.
    pub fn new(
        executor: RetryingExecutor,
        request: ChangesFeedRequest,
        backoff: BackoffConfig,
        client: Arc<dyn ChangeTrackerClient>,
    ) -> Self {
        Self {
            executor,
            request,
            backoff,
            max_reconnects: 3,
            client,
        }
    }

    /// Bounds consecutive failed reconnects of a one-shot feed. Long-poll
    /// feeds reconnect until stopped.
    pub fn with_max_reconnects(mut self, max_reconnects: u32) -> Self {
        self.max_reconnects = max_reconnects;
        self
    }

    /// Spawns the tracker task.
    pub fn start(self) -> ChangeTrackerHandle {
        let trigger = StopTrigger::new();
        let stop = trigger.signal();
        let client = self.client.clone();
        let task = tokio::spawn(async move {
            let error = self.run(&stop).await;
            client.stopped(error).await;
        });
        ChangeTrackerHandle { trigger, task }
    }

    async fn run(self, stop: &StopSignal) -> Option<ReplicationError> {
        if self.request.mode == FeedMode::Continuous {
            return Some(ReplicationError::Unsupported(
                "continuous change feeds are not supported; use long-poll".into(),
            ));
        }
        let longpoll = self.request.mode == FeedMode::LongPoll;
        let url = mask_credentials(self.executor.db_url());
        info!(url = %url, since = %self.request.since, longpoll, "change tracker started");

        let mut since = self.request.since.clone();
        let mut caught_up = false;
        let mut failures: u32 = 0;
        loop {
            let mode = if longpoll && caught_up {
                FeedMode::LongPoll
            } else {
                FeedMode::OneShot
            };
            let request = ChangesFeedRequest {
                mode,
                since: since.clone(),
                ..self.request.clone()
            };

            let outcome = tokio::select! {
                _ = stop.stopped() => return None,
                outcome = self.fetch(&request) => outcome,
            };

            let changes = match outcome {
                Ok(changes) => changes,
                Err(error) if error.is_retryable() || matches!(error, ReplicationError::Codec(_)) => {
                    failures += 1;
                    if !longpoll && failures > self.max_reconnects {
                        warn!(url = %url, error = %error, "change feed failed, giving up");
                        return Some(error);
                    }
                    let delay = self.backoff.delay_for(failures - 1);
                    warn!(
                        url = %url,
                        error = %error,
                        failures,
                        delay_ms = delay.as_millis() as u64,
                        "change feed failed, reconnecting"
                    );
                    tokio::select! {
                        _ = stop.stopped() => return None,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
                Err(error) => {
                    warn!(url = %url, error = %error, "change feed stopped on error");
                    return Some(error);
                }
            };
            failures = 0;

            let count = changes.results.len();
            let next = changes.resume_sequence().cloned();
            for change in changes.results {
                tokio::select! {
                    _ = stop.stopped() => return None,
                    _ = self.client.change_received(change) => {}
                }
            }
            if let Some(next) = next {
                since = next;
            }
            debug!(url = %url, count, since = %since, feed = mode.as_str(), "received changes");

            if mode == FeedMode::OneShot && count < request.limit {
                if !caught_up {
                    caught_up = true;
                    tokio::select! {
                        _ = stop.stopped() => return None,
                        _ = self.client.caught_up() => {}
                    }
                }
                if !longpoll {
                    return None;
                }
            }
        }
    }

    async fn fetch(&self, request: &ChangesFeedRequest) -> ReplicationResult<ChangesResponse> {
        let url = self.executor.url(&request.path());
        let http_request = if request.use_post {
            HttpRequest::post(url)
                .with_header("Content-Type", "application/json")
                .with_body(request.post_body_bytes()?)
        } else {
            HttpRequest::get(url)
        };
        let response: HttpResponse = self.executor.execute(http_request).await?;
        Ok(ChangesResponse::from_slice(&response.body)?)
    }
}

/// Controls a running [`ChangeTracker`].
#[derive(Debug)]
pub struct ChangeTrackerHandle {
    trigger: StopTrigger,
    task: JoinHandle<()>,
}

impl ChangeTrackerHandle {
    /// Cancels the feed connection or pending reconnect. Idempotent; the
    /// client still receives exactly one `stopped` call.
    pub fn stop(&self) {
        self.trigger.trigger();
    }

    /// Returns true once the tracker task has ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the tracker task to end.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// The sequence a fresh tracker should start from.
pub fn initial_since(checkpoint: Option<&Sequence>) -> Sequence {
    checkpoint.cloned().unwrap_or_else(Sequence::zero)
}
