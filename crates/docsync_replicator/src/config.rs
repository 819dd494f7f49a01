//! Configuration for replications.

use crate::error::{ReplicationError, ReplicationResult};
use docsync_protocol::{mask_credentials, CheckpointIdBuilder, DEFAULT_FEED_LIMIT, DEFAULT_HEARTBEAT_MS};
use rand::Rng;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Filter name Sync Gateway uses for channel subscriptions.
pub const CHANNELS_FILTER: &str = "sync_gateway/bychannel";

/// Direction of a replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Local changes are uploaded to the remote.
    Push,
    /// Remote changes are downloaded into the local store.
    Pull,
}

/// Whether pulls fetch documents through `_bulk_get`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BulkGetMode {
    /// Use `_bulk_get` when the server identifies as a recent Sync Gateway.
    #[default]
    Auto,
    /// Always use `_bulk_get`.
    Always,
    /// Always fetch documents one by one.
    Never,
}

/// Configuration for one replication.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Remote database URL.
    pub remote_url: String,
    /// Push or pull.
    pub direction: Direction,
    /// Keep running after catching up.
    pub continuous: bool,
    /// Filter function name.
    pub filter: Option<String>,
    /// Filter parameters.
    pub filter_params: BTreeMap<String, Value>,
    /// Doc-ID allowlist. Empty means every document.
    pub doc_ids: Vec<String>,
    /// Replaces the remote URL in the checkpoint ID.
    pub remote_uuid: Option<String>,
    /// Extra headers sent with every request.
    pub headers: Vec<(String, String)>,
    /// Create the remote database before pushing.
    pub create_target: bool,
    /// Maximum number of revisions per batch.
    pub inbox_capacity: usize,
    /// Quiescence window before a partial batch is released.
    pub processor_delay: Duration,
    /// Change-feed heartbeat.
    pub feed_heartbeat: Duration,
    /// Rows per change-feed response.
    pub feed_limit: usize,
    /// Send change-feed parameters in a POST body.
    pub use_post: bool,
    /// Per-request retry policy.
    pub retry: RetryConfig,
    /// Change-feed reconnect policy.
    pub feed_backoff: BackoffConfig,
    /// Maximum concurrent HTTP requests.
    pub max_open_connections: usize,
    /// Maximum ancestor revisions listed in `atts_since`.
    pub max_atts_since: usize,
    /// Bulk uploads at least this large are gzip-compressed.
    pub gzip_threshold: usize,
    /// Soft cap on the size of one `_bulk_docs` body.
    pub max_bulk_request_bytes: usize,
    /// Coalescing window for checkpoint writes.
    pub checkpoint_delay: Duration,
    /// `_bulk_get` policy.
    pub bulk_get: BulkGetMode,
}

impl ReplicationConfig {
    /// Creates a configuration with default tuning.
    pub fn new(remote_url: impl Into<String>, direction: Direction) -> Self {
        Self {
            remote_url: remote_url.into(),
            direction,
            continuous: false,
            filter: None,
            filter_params: BTreeMap::new(),
            doc_ids: Vec::new(),
            remote_uuid: None,
            headers: Vec::new(),
            create_target: false,
            inbox_capacity: 100,
            processor_delay: Duration::from_millis(500),
            feed_heartbeat: Duration::from_millis(DEFAULT_HEARTBEAT_MS),
            feed_limit: DEFAULT_FEED_LIMIT,
            use_post: false,
            retry: RetryConfig::default(),
            feed_backoff: BackoffConfig::default(),
            max_open_connections: 8,
            max_atts_since: 10,
            gzip_threshold: 64 * 1024,
            max_bulk_request_bytes: 4 * 1024 * 1024,
            checkpoint_delay: Duration::from_secs(2),
            bulk_get: BulkGetMode::Auto,
        }
    }

    /// Push replication to `remote_url`.
    pub fn push(remote_url: impl Into<String>) -> Self {
        Self::new(remote_url, Direction::Push)
    }

    /// Pull replication from `remote_url`.
    pub fn pull(remote_url: impl Into<String>) -> Self {
        Self::new(remote_url, Direction::Pull)
    }

    /// Sets continuous mode.
    pub fn with_continuous(mut self, continuous: bool) -> Self {
        self.continuous = continuous;
        self
    }

    /// Sets the filter name.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Adds a filter parameter.
    pub fn with_filter_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter_params.insert(name.into(), value.into());
        self
    }

    /// Sets the doc-ID allowlist.
    pub fn with_doc_ids<I, S>(mut self, doc_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.doc_ids = doc_ids.into_iter().map(Into::into).collect();
        self
    }

    /// Subscribes to Sync Gateway channels.
    ///
    /// An empty list clears a previously set channel filter.
    pub fn with_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let channels: Vec<String> = channels.into_iter().map(Into::into).collect();
        if channels.is_empty() {
            if self.filter.as_deref() == Some(CHANNELS_FILTER) {
                self.filter = None;
                self.filter_params.clear();
            }
        } else {
            self.filter = Some(CHANNELS_FILTER.to_string());
            self.filter_params.clear();
            self.filter_params
                .insert("channels".into(), Value::from(channels.join(",")));
        }
        self
    }

    /// Returns the subscribed channels, if a channel filter is set.
    pub fn channels(&self) -> Vec<String> {
        if self.filter.as_deref() != Some(CHANNELS_FILTER) {
            return Vec::new();
        }
        self.filter_params
            .get("channels")
            .and_then(Value::as_str)
            .map(|list| {
                list.split(',')
                    .filter(|channel| !channel.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Sets the remote UUID used in the checkpoint ID.
    pub fn with_remote_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.remote_uuid = Some(uuid.into());
        self
    }

    /// Adds a header sent with every request.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Creates the remote database before pushing.
    pub fn with_create_target(mut self, create_target: bool) -> Self {
        self.create_target = create_target;
        self
    }

    /// Sets the batch capacity.
    pub fn with_inbox_capacity(mut self, capacity: usize) -> Self {
        self.inbox_capacity = capacity;
        self
    }

    /// Sets the batch quiescence window.
    pub fn with_processor_delay(mut self, delay: Duration) -> Self {
        self.processor_delay = delay;
        self
    }

    /// Sets the change-feed heartbeat.
    pub fn with_feed_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.feed_heartbeat = heartbeat;
        self
    }

    /// Sets the change-feed page size.
    pub fn with_feed_limit(mut self, limit: usize) -> Self {
        self.feed_limit = limit;
        self
    }

    /// Sends change-feed parameters as a POST body.
    pub fn with_use_post(mut self, use_post: bool) -> Self {
        self.use_post = use_post;
        self
    }

    /// Sets the request retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the change-feed reconnect policy.
    pub fn with_feed_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.feed_backoff = backoff;
        self
    }

    /// Sets the HTTP concurrency limit.
    pub fn with_max_open_connections(mut self, connections: usize) -> Self {
        self.max_open_connections = connections;
        self
    }

    /// Sets the `atts_since` cap.
    pub fn with_max_atts_since(mut self, max: usize) -> Self {
        self.max_atts_since = max;
        self
    }

    /// Sets the gzip threshold for bulk uploads.
    pub fn with_gzip_threshold(mut self, bytes: usize) -> Self {
        self.gzip_threshold = bytes;
        self
    }

    /// Sets the soft size cap of one `_bulk_docs` body.
    pub fn with_max_bulk_request_bytes(mut self, bytes: usize) -> Self {
        self.max_bulk_request_bytes = bytes;
        self
    }

    /// Sets the checkpoint coalescing window.
    pub fn with_checkpoint_delay(mut self, delay: Duration) -> Self {
        self.checkpoint_delay = delay;
        self
    }

    /// Sets the `_bulk_get` policy.
    pub fn with_bulk_get(mut self, mode: BulkGetMode) -> Self {
        self.bulk_get = mode;
        self
    }

    /// Returns true for push replications.
    pub fn is_push(&self) -> bool {
        self.direction == Direction::Push
    }

    /// Returns the remote URL with credentials masked, for logging.
    pub fn masked_url(&self) -> String {
        mask_credentials(&self.remote_url)
    }

    /// Computes the checkpoint document ID for a local database.
    pub fn checkpoint_id(&self, local_database_id: &str) -> String {
        CheckpointIdBuilder::new(local_database_id, self.remote_url.as_str())
            .push(self.is_push())
            .remote_uuid(self.remote_uuid.clone())
            .filter(self.filter.clone())
            .filter_params(self.filter_params.clone())
            .doc_ids(self.doc_ids.iter().cloned())
            .build()
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> ReplicationResult<()> {
        let invalid = |message: &str| Err(ReplicationError::Unsupported(message.to_string()));
        if !(self.remote_url.starts_with("http://") || self.remote_url.starts_with("https://")) {
            return invalid("remote URL must be http or https");
        }
        if self.inbox_capacity == 0 {
            return invalid("inbox capacity must be at least 1");
        }
        if self.feed_limit == 0 {
            return invalid("feed limit must be at least 1");
        }
        if self.max_open_connections == 0 {
            return invalid("at least one connection is required");
        }
        Ok(())
    }
}

/// Retry policy for individual requests.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
    /// Add up to 25% random jitter to delays.
    pub jitter: bool,
}

impl RetryConfig {
    /// Creates a policy with `max_retries` retries and default delays.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: false,
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self::new(0).with_initial_delay(Duration::ZERO)
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Enables jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Total attempts, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay after failed attempt `attempt` (0-indexed):
    /// `initial_delay * 2^attempt`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = exponential(self.initial_delay, attempt, self.max_delay);
        if self.jitter && !delay.is_zero() {
            let factor = rand::thread_rng().gen_range(0.0..0.25);
            delay.mul_f64(1.0 + factor)
        } else {
            delay
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Reconnect policy for the change feed.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Base delay.
    pub initial_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
}

impl BackoffConfig {
    /// Creates a policy.
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
        }
    }

    /// `min(initial_delay * 2^attempts, max_delay)`.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        exponential(self.initial_delay, attempts, self.max_delay)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(300))
    }
}

fn exponential(base: Duration, exponent: u32, cap: Duration) -> Duration {
    let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(cap).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn replication_config_builder() {
        let config = ReplicationConfig::pull("http://h:4984/db")
            .with_continuous(true)
            .with_inbox_capacity(10)
            .with_processor_delay(Duration::from_millis(50))
            .with_header("X-Test", "1")
            .with_use_post(true);

        assert_eq!(config.direction, Direction::Pull);
        assert!(config.continuous);
        assert_eq!(config.inbox_capacity, 10);
        assert_eq!(config.processor_delay, Duration::from_millis(50));
        assert_eq!(config.headers, vec![("X-Test".to_string(), "1".to_string())]);
        assert!(config.use_post);
    }

    #[test]
    fn documented_defaults() {
        let config = ReplicationConfig::push("http://h/db");
        assert_eq!(config.inbox_capacity, 100);
        assert_eq!(config.processor_delay, Duration::from_millis(500));
        assert_eq!(config.feed_heartbeat, Duration::from_millis(300_000));
        assert_eq!(config.feed_limit, 50);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.max_attempts(), 4);
        assert_eq!(config.max_atts_since, 10);
        assert_eq!(config.checkpoint_delay, Duration::from_secs(2));
        assert_eq!(config.bulk_get, BulkGetMode::Auto);
        assert!(!config.use_post);
    }

    #[test]
    fn channels_round_trip() {
        let config = ReplicationConfig::pull("http://h/db").with_channels(["chan1", "chan2"]);
        assert_eq!(config.filter.as_deref(), Some(CHANNELS_FILTER));
        assert_eq!(config.filter_params["channels"], json!("chan1,chan2"));
        assert_eq!(config.channels(), vec!["chan1", "chan2"]);

        let cleared = config.with_channels(Vec::<String>::new());
        assert!(cleared.channels().is_empty());
        assert!(cleared.filter.is_none());
        assert!(cleared.filter_params.is_empty());
    }

    #[test]
    fn clearing_channels_keeps_other_filters() {
        let config = ReplicationConfig::pull("http://h/db")
            .with_filter("app/f")
            .with_channels(Vec::<String>::new());
        assert_eq!(config.filter.as_deref(), Some("app/f"));
    }

    #[test]
    fn checkpoint_id_depends_on_direction_and_filter() {
        let push = ReplicationConfig::push("http://h/db");
        let pull = ReplicationConfig::pull("http://h/db");
        assert_ne!(push.checkpoint_id("local"), pull.checkpoint_id("local"));

        let a = ReplicationConfig::pull("http://h/db")
            .with_filter("f")
            .with_filter_param("b", 2)
            .with_filter_param("a", 1);
        let b = ReplicationConfig::pull("http://h/db")
            .with_filter("f")
            .with_filter_param("a", 1)
            .with_filter_param("b", 2);
        assert_eq!(a.checkpoint_id("local"), b.checkpoint_id("local"));
        assert_ne!(
            a.checkpoint_id("local"),
            a.clone().with_filter_param("a", 9).checkpoint_id("local")
        );
    }

    #[test]
    fn masked_url_hides_credentials() {
        let config = ReplicationConfig::pull("https://bob:secret@h/db");
        assert_eq!(config.masked_url(), "https://---:---@h/db");
    }

    #[test]
    fn validation() {
        assert!(ReplicationConfig::pull("http://h/db").validate().is_ok());
        assert!(ReplicationConfig::pull("ftp://h/db").validate().is_err());
        assert!(ReplicationConfig::pull("http://h/db")
            .with_inbox_capacity(0)
            .validate()
            .is_err());
    }

    #[test]
    fn retry_delay_doubles_and_caps() {
        let retry = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(500));
        assert_eq!(retry.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_millis(500));
        assert_eq!(retry.delay_for_attempt(40), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_within_quarter() {
        let retry = RetryConfig::new(3)
            .with_initial_delay(Duration::from_millis(100))
            .with_jitter(true);
        for _ in 0..20 {
            let delay = retry.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(250));
        }
    }

    #[test]
    fn backoff_is_monotonic_until_cap() {
        let backoff = BackoffConfig::new(Duration::from_millis(10), Duration::from_secs(1));
        let delays: Vec<Duration> = (0..12).map(|n| backoff.delay_for(n)).collect();
        for pair in delays.windows(2) {
            assert!(pair[1] >= pair[0]);
            if pair[1] < backoff.max_delay {
                assert!(pair[1] > pair[0]);
            }
        }
        assert_eq!(*delays.last().unwrap(), Duration::from_secs(1));
    }
}
