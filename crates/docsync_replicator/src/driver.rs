//! The replication run loop.
//!
//! One task per run owns every piece of mutable replication state: the
//! batcher, the sequence map, the lifecycle state and the checkpoint
//! writer. The change tracker, local store notifications, lifecycle
//! commands and finished batches all arrive as messages and are handled
//! one at a time in a `select!` loop. Network transfers run in a bounded
//! set of batch tasks; their results come back to the loop, which inserts
//! pulled revisions and advances the checkpoint.

use crate::auth::{check_session, Authenticator};
use crate::batcher::Batcher;
use crate::bulk::{BulkTransferor, FetchStatus, FetchedRevision, TransferLimits, TransferStatus};
use crate::change_tracker::{initial_since, ChangeTracker, ChangeTrackerClient, ChangeTrackerHandle};
use crate::checkpoint::{CheckpointWriter, Checkpointer};
use crate::config::{BulkGetMode, ReplicationConfig, RetryConfig};
use crate::diff::{DiffResolver, PendingRevision};
use crate::error::{ReplicationError, ReplicationResult};
use crate::executor::{AttemptObserver, RetryingExecutor};
use crate::sequence_map::SequenceMap;
use crate::signal::StopTrigger;
use crate::state::{ReplicationEvent, ReplicationState, StatePublisher};
use crate::store::{BlobStore, LocalChange, LocalStore, RevisionFilter, StoreEvent};
use crate::transport::{HttpClient, HttpRequest};
use async_trait::async_trait;
use docsync_protocol::{
    server_is_sync_gateway_version, ChangeEntry, ChangesFeedRequest, FeedMode, Revision, Sequence,
};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Batches transferred concurrently per run.
pub(crate) const MAX_INFLIGHT_BATCHES: usize = 4;

/// Oldest `Sync Gateway` release with `_bulk_get`.
const BULK_GET_MIN_VERSION: &str = "0.81";

/// Lifecycle requests sent by the [`Replication`](crate::Replication) handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    Stop,
    GoOffline,
    GoOnline,
}

/// Everything a run needs from its owner.
#[derive(Clone)]
pub(crate) struct Collaborators {
    pub(crate) config: ReplicationConfig,
    pub(crate) http: Arc<dyn HttpClient>,
    pub(crate) store: Arc<dyn LocalStore>,
    pub(crate) blobs: Arc<dyn BlobStore>,
    pub(crate) filter: Option<Arc<dyn RevisionFilter>>,
    pub(crate) authenticator: Option<Arc<dyn Authenticator>>,
    pub(crate) observer: Option<Arc<dyn AttemptObserver>>,
}

/// Runs one replication session to completion.
///
/// Waits for `previous` first, so a restarted replication never overlaps
/// the run it replaces.
pub(crate) async fn run(
    parts: Collaborators,
    publisher: StatePublisher,
    pending_docs: Arc<Mutex<HashSet<String>>>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    previous: Option<JoinHandle<()>>,
) {
    if let Some(previous) = previous {
        let _ = previous.await;
    }
    let span = info_span!("replication", session = %publisher.session_id());
    async move {
        publisher.reset();
        let mut driver = Driver::new(parts, publisher, pending_docs);
        driver.execute(&mut commands).await;
    }
    .instrument(span)
    .await;
}

enum FeedEvent {
    Change(ChangeEntry),
    CaughtUp,
    Stopped(Option<ReplicationError>),
}

/// Forwards tracker callbacks into the run loop, tagged with the feed
/// generation so events from a torn-down tracker can be told apart.
struct FeedClient {
    generation: u64,
    tx: mpsc::Sender<(u64, FeedEvent)>,
}

#[async_trait]
impl ChangeTrackerClient for FeedClient {
    async fn change_received(&self, change: ChangeEntry) {
        let _ = self.tx.send((self.generation, FeedEvent::Change(change))).await;
    }

    async fn caught_up(&self) {
        let _ = self.tx.send((self.generation, FeedEvent::CaughtUp)).await;
    }

    async fn stopped(&self, error: Option<ReplicationError>) {
        let _ = self.tx.send((self.generation, FeedEvent::Stopped(error))).await;
    }
}

/// What a batch task accomplished.
#[derive(Debug, Default)]
struct BatchReport {
    /// Terminally handled, with the document-level error if any.
    resolved: Vec<(PendingRevision, Option<ReplicationError>)>,
    /// Pulled revisions waiting to be inserted.
    fetched: Vec<(PendingRevision, FetchedRevision)>,
    /// Not handled; the request carrying them failed.
    aborted: Vec<(PendingRevision, ReplicationError)>,
}

impl BatchReport {
    fn resolve_all(&mut self, items: Vec<PendingRevision>) {
        self.resolved.extend(items.into_iter().map(|item| (item, None)));
    }

    fn abort_all(&mut self, items: Vec<PendingRevision>, error: ReplicationError) {
        self.aborted
            .extend(items.into_iter().map(|item| (item, error.clone())));
    }
}

async fn push_batch(
    diff: DiffResolver,
    transfer: Arc<BulkTransferor>,
    batch: Vec<PendingRevision>,
) -> BatchReport {
    let mut report = BatchReport::default();
    debug!(size = batch.len(), "pushing batch");
    let diffed = match diff.missing_on_remote(batch.clone()).await {
        Ok(diffed) => diffed,
        Err(error) => {
            report.abort_all(batch, error);
            return report;
        }
    };
    report.resolve_all(diffed.present);
    for outcome in transfer.push(diffed.needed).await {
        match outcome.status {
            TransferStatus::Transferred | TransferStatus::Skipped => {
                report.resolved.push((outcome.item, None))
            }
            TransferStatus::Failed(error) => report.resolved.push((outcome.item, Some(error))),
            TransferStatus::Aborted(error) => report.aborted.push((outcome.item, error)),
        }
    }
    report
}

async fn pull_batch(
    store: Arc<dyn LocalStore>,
    transfer: Arc<BulkTransferor>,
    batch: Vec<PendingRevision>,
    use_bulk_get: bool,
) -> BatchReport {
    let mut report = BatchReport::default();
    debug!(size = batch.len(), "pulling batch");
    let diffed = match DiffResolver::missing_locally(store.as_ref(), batch.clone()) {
        Ok(diffed) => diffed,
        Err(error) => {
            report.abort_all(batch, error);
            return report;
        }
    };
    report.resolve_all(diffed.present);
    for outcome in transfer.pull(diffed.needed, use_bulk_get).await {
        match outcome.status {
            FetchStatus::Fetched(fetched) => report.fetched.push((outcome.item, fetched)),
            FetchStatus::Failed(error) => report.resolved.push((outcome.item, Some(error))),
            FetchStatus::Aborted(error) => report.aborted.push((outcome.item, error)),
        }
    }
    report
}

/// Result of the start-up exchange with the remote.
struct Prepared {
    since: Option<Sequence>,
    checkpointer: Checkpointer,
    server: Option<String>,
    use_bulk_get: bool,
}

/// Session check, target creation and checkpoint load. Continuous runs
/// keep retrying while the remote is unavailable.
async fn prepare_with_retry(
    executor: &RetryingExecutor,
    parts: &Collaborators,
    publisher: &StatePublisher,
) -> ReplicationResult<Prepared> {
    let mut failures = 0;
    loop {
        match prepare(executor, parts).await {
            Err(error) if parts.config.continuous && error.is_retryable() => {
                let delay = parts.config.feed_backoff.delay_for(failures);
                failures = failures.saturating_add(1);
                warn!(
                    error = %error,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "remote unavailable, retrying start-up"
                );
                publisher.error(error, false);
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

async fn prepare(executor: &RetryingExecutor, parts: &Collaborators) -> ReplicationResult<Prepared> {
    let config = &parts.config;
    check_session(executor).await?;

    if config.is_push() && config.create_target {
        let request = HttpRequest::put(executor.db_url());
        match executor.execute(request).await {
            Ok(_) => info!(url = %config.masked_url(), "created remote database"),
            Err(error) if error.status() == Some(412) => debug!("remote database already exists"),
            Err(error) => return Err(error),
        }
    }

    let checkpoint_id = config.checkpoint_id(&parts.store.database_id());
    let checkpointer = Checkpointer::new(executor.clone(), checkpoint_id);
    let since = checkpointer.load_validated(parts.store.as_ref()).await?;

    let server = executor.server_header();
    let use_bulk_get = !config.is_push()
        && match config.bulk_get {
            BulkGetMode::Always => true,
            BulkGetMode::Never => false,
            BulkGetMode::Auto => {
                server_is_sync_gateway_version(server.as_deref(), BULK_GET_MIN_VERSION)
            }
        };

    Ok(Prepared {
        since,
        checkpointer,
        server,
        use_bulk_get,
    })
}

struct Driver {
    parts: Collaborators,
    publisher: StatePublisher,
    pending_docs: Arc<Mutex<HashSet<String>>>,
    stop_trigger: StopTrigger,
    executor: RetryingExecutor,
    diff: DiffResolver,
    transfer: Arc<BulkTransferor>,
    writer: Option<CheckpointWriter>,
    batcher: Batcher<PendingRevision>,
    ready: VecDeque<Vec<PendingRevision>>,
    sequences: SequenceMap,
    batches: JoinSet<BatchReport>,
    feed_tx: mpsc::Sender<(u64, FeedEvent)>,
    feed_rx: mpsc::Receiver<(u64, FeedEvent)>,
    tracker: Option<ChangeTrackerHandle>,
    generation: u64,
    feed_failures: u32,
    feed_restart_at: Option<Instant>,
    store_events: Option<broadcast::Receiver<StoreEvent>>,
    last_seen: Option<Sequence>,
    push_seen: u64,
    checkpoint_sent: Option<Sequence>,
    caught_up: bool,
    use_bulk_get: bool,
    stopping: bool,
    changes_count: u64,
    completed_count: u64,
    idle_flush: Option<Pin<Box<dyn Future<Output = ()> + Send>>>,
}

impl Driver {
    fn new(
        parts: Collaborators,
        publisher: StatePublisher,
        pending_docs: Arc<Mutex<HashSet<String>>>,
    ) -> Self {
        let config = &parts.config;
        let stop_trigger = StopTrigger::new();
        let executor = RetryingExecutor::new(
            parts.http.clone(),
            config.remote_url.as_str(),
            config.retry.clone(),
            config.max_open_connections,
            stop_trigger.signal(),
        )
        .with_headers(config.headers.clone())
        .with_authenticator(parts.authenticator.clone())
        .with_observer(parts.observer.clone());
        let transfer = Arc::new(BulkTransferor::new(
            executor.clone(),
            parts.store.clone(),
            parts.blobs.clone(),
            TransferLimits::from_config(config),
        ));
        let (feed_tx, feed_rx) = mpsc::channel(config.inbox_capacity.max(1));

        Self {
            batcher: Batcher::new(config.inbox_capacity, config.processor_delay),
            diff: DiffResolver::new(executor.clone()),
            parts,
            publisher,
            pending_docs,
            stop_trigger,
            executor,
            transfer,
            writer: None,
            ready: VecDeque::new(),
            sequences: SequenceMap::new(),
            batches: JoinSet::new(),
            feed_tx,
            feed_rx,
            tracker: None,
            generation: 0,
            feed_failures: 0,
            feed_restart_at: None,
            store_events: None,
            last_seen: None,
            push_seen: 0,
            checkpoint_sent: None,
            caught_up: false,
            use_bulk_get: false,
            stopping: false,
            changes_count: 0,
            completed_count: 0,
            idle_flush: None,
        }
    }

    async fn execute(&mut self, commands: &mut mpsc::UnboundedReceiver<Command>) {
        if let Err(error) = self.publisher.transition(ReplicationState::Running) {
            error!(error = %error, "replication could not start");
            return;
        }
        let config = &self.parts.config;
        info!(
            url = %config.masked_url(),
            push = config.is_push(),
            continuous = config.continuous,
            "replication started"
        );

        let mut deferred = Vec::new();
        let prepared = {
            let prepare = prepare_with_retry(&self.executor, &self.parts, &self.publisher);
            tokio::pin!(prepare);
            loop {
                tokio::select! {
                    result = &mut prepare => break Some(result),
                    command = commands.recv() => match command {
                        Some(Command::Stop) | None => break None,
                        Some(command) => deferred.push(command),
                    },
                }
            }
        };

        match prepared {
            Some(Ok(prepared)) => {
                self.install(prepared);
                for command in deferred {
                    self.handle_command(command).await;
                }
                self.main_loop(commands).await;
            }
            Some(Err(error)) => {
                error!(error = %error, "replication could not reach the remote");
                self.publisher.error(error, true);
            }
            None => info!("stopped before the remote was reached"),
        }
        self.shutdown().await;
    }

    // ---- start-up ----

    fn install(&mut self, prepared: Prepared) {
        let Prepared {
            since,
            checkpointer,
            server,
            use_bulk_get,
        } = prepared;
        info!(
            checkpoint_id = %checkpointer.checkpoint_id(),
            since = ?since,
            server = ?server,
            bulk_get = use_bulk_get,
            "replication prepared"
        );
        self.use_bulk_get = use_bulk_get;
        self.publisher.update(|status| {
            status.server = server;
            status.last_sequence = since.clone();
        });
        self.writer = Some(CheckpointWriter::spawn(
            checkpointer,
            self.parts.store.clone(),
            self.publisher.clone(),
            self.parts.config.checkpoint_delay,
            since.clone(),
        ));
        self.push_seen = local_sequence(since.as_ref());
        self.checkpoint_sent = since.clone();
        self.last_seen = since;
        self.start_feed();
    }

    // ---- main loop ----

    async fn main_loop(&mut self, commands: &mut mpsc::UnboundedReceiver<Command>) {
        loop {
            self.dispatch_ready();
            self.check_quiescent();
            self.publish();
            if self.stopping {
                return;
            }

            let online = self.is_online();
            let deadline = self.batcher.deadline().filter(|_| online);
            let restart_at = self.feed_restart_at.filter(|_| online);
            let feed_open = self.ready.len() < MAX_INFLIGHT_BATCHES;
            let has_batches = !self.batches.is_empty();
            let watching_store = self.store_events.is_some();
            let flushing = self.idle_flush.is_some();

            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("replication handle dropped");
                        self.stopping = true;
                    }
                },
                Some((generation, event)) = self.feed_rx.recv(), if feed_open => {
                    self.on_feed_event(generation, event);
                }
                Some(result) = self.batches.join_next(), if has_batches => {
                    self.on_batch_result(result);
                }
                _ = sleep_until(deadline), if deadline.is_some() => {
                    if let Some(batch) = self.batcher.take_due(Instant::now()) {
                        self.ready.push_back(batch);
                    }
                }
                event = next_store_event(&mut self.store_events), if watching_store => {
                    self.on_store_event(event);
                }
                _ = wait_for(&mut self.idle_flush), if flushing => {
                    self.idle_flush = None;
                    self.enter_idle();
                }
                _ = sleep_until(restart_at), if restart_at.is_some() => {
                    self.feed_restart_at = None;
                    self.start_feed();
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Stop => {
                info!("stop requested");
                self.stopping = true;
            }
            Command::GoOffline => self.go_offline(),
            Command::GoOnline => self.go_online().await,
        }
    }

    fn is_online(&self) -> bool {
        self.publisher.state() != ReplicationState::Offline
    }

    fn go_offline(&mut self) {
        let state = self.publisher.state();
        if !matches!(state, ReplicationState::Running | ReplicationState::Idle) {
            debug!(state = %state, "ignoring go offline");
            return;
        }
        self.generation += 1;
        if let Some(tracker) = self.tracker.take() {
            tracker.stop();
        }
        self.store_events = None;
        self.feed_restart_at = None;
        self.idle_flush = None;
        let _ = self.publisher.transition(ReplicationState::Offline);
    }

    async fn go_online(&mut self) {
        let state = self.publisher.state();
        if state != ReplicationState::Offline {
            debug!(state = %state, "ignoring go online");
            return;
        }
        let _ = self.publisher.transition(ReplicationState::Running);
        self.revalidate_checkpoint().await;
        if !self.stopping {
            self.start_feed();
        }
    }

    /// Checks that the remote checkpoint still matches what this run saved.
    async fn revalidate_checkpoint(&mut self) {
        let Some(writer) = &self.writer else {
            return;
        };
        let saved = writer.saved();
        let checkpointer = Checkpointer::new(self.executor.clone(), writer.checkpoint_id());
        match checkpointer.load_validated(self.parts.store.as_ref()).await {
            Ok(remote) if remote == saved => {
                debug!(sequence = ?remote, "checkpoint confirmed")
            }
            Ok(remote) => warn!(
                remote = ?remote,
                saved = ?saved,
                "checkpoint changed while offline"
            ),
            Err(error) if error.is_terminal() => self.fail(error),
            Err(error) => {
                warn!(error = %error, "could not confirm checkpoint");
                self.publisher.error(error, false);
            }
        }
    }

    // ---- feeds ----

    fn start_feed(&mut self) {
        self.caught_up = false;
        self.generation += 1;
        if self.parts.config.is_push() {
            self.start_local_feed();
        } else {
            self.start_remote_feed();
        }
    }

    fn start_remote_feed(&mut self) {
        let config = &self.parts.config;
        let mode = if config.continuous {
            FeedMode::LongPoll
        } else {
            FeedMode::OneShot
        };
        let mut request = ChangesFeedRequest::new(mode)
            .with_since(initial_since(self.last_seen.as_ref()))
            .with_heartbeat(u64::try_from(config.feed_heartbeat.as_millis()).unwrap_or(u64::MAX))
            .with_limit(config.feed_limit)
            .with_post(config.use_post);
        if let Some(filter) = &config.filter {
            request = request.with_filter(filter.clone(), config.filter_params.clone());
        }
        if !config.doc_ids.is_empty() {
            request = request.with_doc_ids(config.doc_ids.clone());
        }

        let client = Arc::new(FeedClient {
            generation: self.generation,
            tx: self.feed_tx.clone(),
        });
        let tracker = ChangeTracker::new(
            self.executor.with_retry(RetryConfig::no_retry()),
            request,
            config.feed_backoff.clone(),
            client,
        );
        self.tracker = Some(tracker.start());
    }

    fn start_local_feed(&mut self) {
        let events = self.parts.store.subscribe();
        if let Err(error) = self.read_local_backlog() {
            self.fail(error);
            return;
        }
        debug!(since = self.push_seen, "local backlog queued");
        self.store_events = Some(events);
        self.caught_up = true;
    }

    fn read_local_backlog(&mut self) -> ReplicationResult<()> {
        let limit = self.parts.config.inbox_capacity.max(1);
        loop {
            let changes = self.parts.store.changes_since(self.push_seen, limit)?;
            let count = changes.len();
            for change in changes {
                self.on_local_change(change);
            }
            if count < limit {
                return Ok(());
            }
        }
    }

    fn on_feed_event(&mut self, generation: u64, event: FeedEvent) {
        if generation != self.generation {
            return;
        }
        match event {
            FeedEvent::Change(entry) => self.on_remote_change(entry),
            FeedEvent::CaughtUp => {
                debug!(since = ?self.last_seen, "change feed caught up");
                self.caught_up = true;
                self.feed_failures = 0;
            }
            FeedEvent::Stopped(None) => self.tracker = None,
            FeedEvent::Stopped(Some(error)) => {
                self.tracker = None;
                self.on_feed_error(error);
            }
        }
    }

    fn on_feed_error(&mut self, error: ReplicationError) {
        if error.is_terminal() || !self.parts.config.continuous {
            self.fail(error);
            return;
        }
        let delay = self.parts.config.feed_backoff.delay_for(self.feed_failures);
        self.feed_failures = self.feed_failures.saturating_add(1);
        warn!(
            error = %error,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "change feed failed, restarting"
        );
        self.publisher.error(error, false);
        self.feed_restart_at = Some(Instant::now() + delay);
    }

    fn on_remote_change(&mut self, entry: ChangeEntry) {
        let ChangeEntry {
            seq,
            id,
            changes,
            deleted,
            ..
        } = entry;
        self.last_seen = Some(seq.clone());
        let seq_id = self.sequences.add(seq.clone(), Some(id.clone()), changes.len());
        for change in changes {
            self.changes_count += 1;
            self.enqueue(PendingRevision {
                seq_id,
                sequence: seq.clone(),
                doc_id: id.clone(),
                rev_id: change.rev,
                deleted,
            });
        }
    }

    fn on_store_event(&mut self, event: Result<StoreEvent, RecvError>) {
        match event {
            Ok(StoreEvent::Changed(change)) => self.on_local_change(change),
            Ok(StoreEvent::Purged { doc_id }) => self.on_purge(&doc_id),
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "missed local change notifications, rereading");
                if let Err(error) = self.read_local_backlog() {
                    self.fail(error);
                }
            }
            Err(RecvError::Closed) => {
                warn!("local change notifications closed");
                self.store_events = None;
            }
        }
    }

    fn on_local_change(&mut self, change: LocalChange) {
        if change.sequence <= self.push_seen {
            return;
        }
        self.push_seen = change.sequence;
        let sequence = Sequence::from(change.sequence);
        self.last_seen = Some(sequence.clone());

        let revision = change.revision;
        let wanted = self.wants_push(&revision, change.source.as_deref());
        let seq_id = self.sequences.add(
            sequence.clone(),
            Some(revision.doc_id.clone()),
            usize::from(wanted),
        );
        if wanted {
            self.changes_count += 1;
            self.enqueue(PendingRevision {
                seq_id,
                sequence,
                doc_id: revision.doc_id,
                rev_id: revision.rev_id,
                deleted: revision.deleted,
            });
        }
    }

    fn wants_push(&self, revision: &Revision, source: Option<&str>) -> bool {
        let config = &self.parts.config;
        if !config.doc_ids.is_empty() && !config.doc_ids.contains(&revision.doc_id) {
            return false;
        }
        if source == Some(config.remote_url.as_str()) {
            return false;
        }
        self.parts
            .filter
            .as_ref()
            .map_or(true, |filter| filter.should_accept(revision))
    }

    fn on_purge(&mut self, doc_id: &str) {
        let mut removed = self.batcher.retain(|item| item.doc_id != doc_id);
        for batch in &mut self.ready {
            let (kept, dropped): (Vec<_>, Vec<_>) =
                batch.drain(..).partition(|item| item.doc_id != doc_id);
            *batch = kept;
            removed.extend(dropped);
        }
        self.ready.retain(|batch| !batch.is_empty());
        if !removed.is_empty() {
            debug!(doc_id, count = removed.len(), "purged document dropped from queue");
        }
        for item in removed {
            self.sequences.resolve(item.seq_id);
            self.completed_count += 1;
        }
    }

    // ---- batches ----

    fn enqueue(&mut self, item: PendingRevision) {
        if let Some(batch) = self.batcher.push(item) {
            self.ready.push_back(batch);
        }
        self.idle_flush = None;
        if self.publisher.state() == ReplicationState::Idle {
            let _ = self.publisher.transition(ReplicationState::Running);
        }
    }

    fn dispatch_ready(&mut self) {
        if self.stopping || !self.is_online() {
            return;
        }
        while self.batches.len() < MAX_INFLIGHT_BATCHES {
            let Some(batch) = self.ready.pop_front() else {
                break;
            };
            if self.parts.config.is_push() {
                let task = push_batch(self.diff.clone(), self.transfer.clone(), batch);
                self.batches.spawn(task.in_current_span());
            } else {
                let task = pull_batch(
                    self.parts.store.clone(),
                    self.transfer.clone(),
                    batch,
                    self.use_bulk_get,
                );
                self.batches.spawn(task.in_current_span());
            }
        }
    }

    fn on_batch_result(&mut self, result: Result<BatchReport, JoinError>) {
        let report = match result {
            Ok(report) => report,
            Err(join_error) => {
                error!(error = %join_error, "batch task ended abnormally");
                self.fail(ReplicationError::Cancelled);
                return;
            }
        };

        let BatchReport {
            resolved,
            fetched,
            mut aborted,
        } = report;
        for (item, error) in resolved {
            self.resolve(item, error);
        }
        for (item, fetched) in fetched {
            match self.insert(fetched) {
                Ok(()) => self.resolve(item, None),
                Err(error) if error.is_document_level() => self.resolve(item, Some(error)),
                Err(error) => aborted.push((item, error)),
            }
        }
        self.on_aborted(aborted);
    }

    fn insert(&self, fetched: FetchedRevision) -> ReplicationResult<()> {
        let FetchedRevision { revision, history } = fetched;
        if let Some(filter) = &self.parts.filter {
            if !filter.should_accept(&revision) {
                return Err(ReplicationError::DocumentRejected {
                    doc_id: revision.doc_id,
                    reason: "rejected by filter".into(),
                });
            }
        }
        self.parts
            .store
            .insert_revision(revision, history, &self.parts.config.remote_url)?;
        Ok(())
    }

    fn resolve(&mut self, item: PendingRevision, error: Option<ReplicationError>) {
        if let Some(error) = error {
            warn!(doc_id = %item.doc_id, rev = %item.rev_id, error = %error, "document not replicated");
            self.publisher.emit(ReplicationEvent::DocumentFailed {
                doc_id: item.doc_id.clone(),
                rev: item.rev_id.clone(),
                error,
            });
        }
        self.sequences.resolve(item.seq_id);
        self.completed_count += 1;
    }

    /// Items of a batch whose request failed.
    ///
    /// Retryable failures go back to the queue and stay unresolved until they
    /// succeed. Any other failure in a continuous run marks each item failed
    /// so the checkpoint can move past it.
    fn on_aborted(&mut self, aborted: Vec<(PendingRevision, ReplicationError)>) {
        let Some(error) = aborted
            .iter()
            .map(|(_, error)| error)
            .find(|error| error.is_terminal())
            .or_else(|| aborted.first().map(|(_, error)| error))
            .cloned()
        else {
            return;
        };
        if self.stopping {
            debug!(count = aborted.len(), error = %error, "batch aborted while stopping");
            return;
        }
        if error.is_terminal() || !self.parts.config.continuous {
            self.fail(error);
            return;
        }
        self.publisher.error(error.clone(), false);
        if error.is_retryable() || error == ReplicationError::Cancelled {
            warn!(count = aborted.len(), error = %error, "batch failed, queueing it again");
            for (item, _) in aborted {
                self.enqueue(item);
            }
        } else {
            warn!(count = aborted.len(), error = %error, "batch failed, skipping its revisions");
            for (item, item_error) in aborted {
                self.resolve(item, Some(item_error));
            }
        }
    }

    fn is_drained(&self) -> bool {
        self.batcher.is_empty() && self.ready.is_empty() && self.batches.is_empty()
    }

    // ---- lifecycle ----

    fn check_quiescent(&mut self) {
        if self.stopping
            || !self.caught_up
            || !self.is_drained()
            || self.publisher.state() != ReplicationState::Running
        {
            return;
        }
        if !self.parts.config.continuous {
            if self.tracker.is_none() {
                info!("replication complete");
                self.stopping = true;
            }
            return;
        }
        if self.idle_flush.is_none() {
            self.advance_checkpoint();
            match &self.writer {
                Some(writer) => self.idle_flush = Some(Box::pin(writer.flush())),
                None => self.enter_idle(),
            }
        }
    }

    fn enter_idle(&mut self) {
        if self.caught_up
            && self.is_drained()
            && self.publisher.state() == ReplicationState::Running
        {
            let _ = self.publisher.transition(ReplicationState::Idle);
        }
    }

    fn fail(&mut self, error: ReplicationError) {
        if self.stopping {
            return;
        }
        error!(error = %error, "replication failed");
        self.publisher.error(error, true);
        self.stopping = true;
    }

    fn advance_checkpoint(&mut self) {
        let Some(sequence) = self.sequences.checkpointed().cloned() else {
            return;
        };
        if self.checkpoint_sent.as_ref() == Some(&sequence) {
            return;
        }
        self.checkpoint_sent = Some(sequence.clone());
        if let Some(writer) = &self.writer {
            writer.advance(sequence.clone());
        }
        self.publisher
            .update(|status| status.last_sequence = Some(sequence));
    }

    fn publish(&mut self) {
        self.advance_checkpoint();
        self.publisher
            .progress(self.changes_count, self.completed_count);
        *self.pending_docs.lock() = self.sequences.pending_doc_ids();
    }

    async fn shutdown(&mut self) {
        self.stopping = true;
        if self.publisher.state() != ReplicationState::Stopping {
            let _ = self.publisher.transition(ReplicationState::Stopping);
        }
        self.stop_trigger.trigger();
        self.generation += 1;
        self.feed_rx.close();
        if let Some(tracker) = self.tracker.take() {
            tracker.stop();
            tracker.join().await;
        }
        self.store_events = None;
        self.idle_flush = None;

        while let Some(result) = self.batches.join_next().await {
            self.on_batch_result(result);
        }
        self.publish();

        if let Some(writer) = self.writer.take() {
            writer.close().await;
            match writer.last_error() {
                Some(error) => warn!(error = %error, "final checkpoint not saved"),
                None => debug!(saved = ?writer.saved(), "final checkpoint saved"),
            }
        }
        let _ = self.publisher.transition(ReplicationState::Stopped);
        info!(
            changes = self.changes_count,
            completed = self.completed_count,
            "replication stopped"
        );
    }
}

/// A push checkpoint is a local sequence number.
fn local_sequence(sequence: Option<&Sequence>) -> u64 {
    match sequence {
        Some(Sequence::Integer(value)) => *value,
        Some(Sequence::Text(text)) => text.parse().unwrap_or(0),
        None => 0,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn next_store_event(
    events: &mut Option<broadcast::Receiver<StoreEvent>>,
) -> Result<StoreEvent, RecvError> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_for(future: &mut Option<Pin<Box<dyn Future<Output = ()> + Send>>>) {
    match future {
        Some(future) => future.as_mut().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_checkpoints_are_local_sequences() {
        assert_eq!(local_sequence(None), 0);
        assert_eq!(local_sequence(Some(&Sequence::from(42))), 42);
        assert_eq!(local_sequence(Some(&Sequence::from("17"))), 17);
        assert_eq!(local_sequence(Some(&Sequence::from("3:1"))), 0);
    }

    #[test]
    fn batch_report_helpers() {
        let item = PendingRevision {
            seq_id: 0,
            sequence: Sequence::from(1),
            doc_id: "a".into(),
            rev_id: docsync_protocol::RevId::new(1, "x"),
            deleted: false,
        };
        let mut report = BatchReport::default();
        report.resolve_all(vec![item.clone()]);
        report.abort_all(vec![item], ReplicationError::Cancelled);
        assert_eq!(report.resolved.len(), 1);
        assert_eq!(report.aborted[0].1, ReplicationError::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_until_none_never_fires() {
        let fired = tokio::time::timeout(
            std::time::Duration::from_secs(3600),
            sleep_until(None),
        )
        .await;
        assert!(fired.is_err());
    }
}
