//! The public replication handle.

use crate::auth::Authenticator;
use crate::config::ReplicationConfig;
use crate::driver::{self, Collaborators, Command};
use crate::error::{ReplicationError, ReplicationResult};
use crate::executor::AttemptObserver;
use crate::state::{ReplicationEvent, ReplicationState, ReplicationStatus, StatePublisher};
use crate::store::{BlobStore, LocalStore, RevisionFilter};
use crate::transport::HttpClient;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

static SESSION_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn next_session_id() -> String {
    format!("repl{:03}", SESSION_COUNTER.fetch_add(1, Ordering::Relaxed) + 1)
}

struct RunHandle {
    session_id: String,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

/// A replication between a local store and one remote database.
///
/// Lifecycle methods only queue a command for the background run and return
/// at once; observe the outcome through [`Replication::subscribe_status`],
/// [`Replication::subscribe`] or [`Replication::wait_for_stop`]. Starting a
/// run must happen inside a Tokio runtime.
///
/// # Example
///
/// ```no_run
/// use docsync_replicator::{MemoryStore, MockHttpClient, Replication, ReplicationConfig};
/// use std::sync::Arc;
///
/// # async fn demo() -> docsync_replicator::ReplicationResult<()> {
/// let store = Arc::new(MemoryStore::new());
/// let replication = Replication::new(
///     ReplicationConfig::push("http://localhost:5984/db"),
///     Arc::new(MockHttpClient::new()),
///     store.clone(),
///     store,
/// );
/// replication.start()?;
/// let status = replication.wait_for_stop().await;
/// println!("pushed {} revisions", status.completed_changes_count);
/// # Ok(())
/// # }
/// ```
pub struct Replication {
    parts: Collaborators,
    status: Arc<watch::Sender<ReplicationStatus>>,
    events: broadcast::Sender<ReplicationEvent>,
    pending_docs: Arc<Mutex<HashSet<String>>>,
    run: Mutex<Option<RunHandle>>,
}

impl Replication {
    /// Creates a replication in the `Initial` state.
    pub fn new(
        config: ReplicationConfig,
        http: Arc<dyn HttpClient>,
        store: Arc<dyn LocalStore>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        let (status, _) = watch::channel(ReplicationStatus::default());
        let (events, _) = broadcast::channel(256);
        Self {
            parts: Collaborators {
                config,
                http,
                store,
                blobs,
                filter: None,
                authenticator: None,
                observer: None,
            },
            status: Arc::new(status),
            events,
            pending_docs: Arc::new(Mutex::new(HashSet::new())),
            run: Mutex::new(None),
        }
    }

    /// Replicates only revisions the filter accepts.
    ///
    /// Push runs apply it before enqueuing a local change; pull runs before
    /// inserting a fetched revision.
    pub fn with_filter(mut self, filter: impl RevisionFilter + 'static) -> Self {
        self.parts.filter = Some(Arc::new(filter));
        self
    }

    /// Authenticates every request.
    pub fn with_authenticator(mut self, authenticator: impl Authenticator + 'static) -> Self {
        self.parts.authenticator = Some(Arc::new(authenticator));
        self
    }

    /// Reports every HTTP attempt.
    pub fn with_observer(mut self, observer: impl AttemptObserver + 'static) -> Self {
        self.parts.observer = Some(Arc::new(observer));
        self
    }

    /// The configuration.
    pub fn config(&self) -> &ReplicationConfig {
        &self.parts.config
    }

    /// The checkpoint document ID this replication uses.
    pub fn checkpoint_id(&self) -> String {
        self.parts
            .config
            .checkpoint_id(&self.parts.store.database_id())
    }

    /// Starts the replication.
    ///
    /// Only legal once, from `Initial`; use [`Replication::restart`] to run
    /// again.
    pub fn start(&self) -> ReplicationResult<()> {
        let mut run = self.run.lock();
        let state = self.state();
        if run.is_some() || state != ReplicationState::Initial {
            return Err(ReplicationError::InvalidStateTransition {
                from: state.to_string(),
                to: ReplicationState::Running.to_string(),
            });
        }
        self.parts.config.validate()?;
        *run = Some(self.spawn_run(None));
        Ok(())
    }

    /// Stops the current run after draining in-flight work. Idempotent.
    pub fn stop(&self) {
        self.send(Command::Stop);
    }

    /// Tears down the feed and pauses transfers. Queued work is kept.
    pub fn go_offline(&self) {
        self.send(Command::GoOffline);
    }

    /// Re-establishes the feed after [`Replication::go_offline`].
    pub fn go_online(&self) {
        self.send(Command::GoOnline);
    }

    /// Stops the current run, if any, and starts a fresh one with the same
    /// configuration once it has stopped.
    pub fn restart(&self) -> ReplicationResult<()> {
        self.parts.config.validate()?;
        let mut run = self.run.lock();
        let previous = run.take().map(|handle| {
            let _ = handle.commands.send(Command::Stop);
            handle.task
        });
        *run = Some(self.spawn_run(previous));
        Ok(())
    }

    fn spawn_run(&self, previous: Option<JoinHandle<()>>) -> RunHandle {
        let (commands, receiver) = mpsc::unbounded_channel();
        let session_id = next_session_id();
        debug!(session = %session_id, url = %self.parts.config.masked_url(), "spawning replication run");
        let publisher =
            StatePublisher::new(session_id.clone(), self.status.clone(), self.events.clone());
        let task = tokio::spawn(driver::run(
            self.parts.clone(),
            publisher,
            self.pending_docs.clone(),
            receiver,
            previous,
        ));
        RunHandle {
            session_id,
            commands,
            task,
        }
    }

    fn send(&self, command: Command) {
        if let Some(run) = self.run.lock().as_ref() {
            // A finished run has dropped its receiver; nothing left to do.
            let _ = run.commands.send(command);
        }
    }

    /// Current status snapshot.
    pub fn status(&self) -> ReplicationStatus {
        self.status.borrow().clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ReplicationState {
        self.status.borrow().state
    }

    /// Watches the status. The receiver sees the current value at once.
    pub fn subscribe_status(&self) -> watch::Receiver<ReplicationStatus> {
        self.status.subscribe()
    }

    /// Subscribes to lifecycle, progress and error events.
    pub fn subscribe(&self) -> broadcast::Receiver<ReplicationEvent> {
        self.events.subscribe()
    }

    /// Waits until the latest run reaches `Stopped` and returns the final
    /// status.
    ///
    /// After [`Replication::restart`] this waits for the new run, not the one
    /// it replaced.
    pub async fn wait_for_stop(&self) -> ReplicationStatus {
        let session = self.run.lock().as_ref().map(|run| run.session_id.clone());
        let mut receiver = self.status.subscribe();
        let stopped = receiver
            .wait_for(|status| {
                status.state == ReplicationState::Stopped
                    && (session.is_none() || status.session_id == session)
            })
            .await
            .map(|status| status.clone());
        stopped.unwrap_or_else(|_| self.status())
    }

    /// IDs of documents with changes not yet transferred.
    pub fn pending_document_ids(&self) -> HashSet<String> {
        self.pending_docs.lock().clone()
    }

    /// Returns true if `doc_id` has changes not yet transferred.
    pub fn is_document_pending(&self, doc_id: &str) -> bool {
        self.pending_docs.lock().contains(doc_id)
    }
}

impl fmt::Debug for Replication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.status.borrow();
        f.debug_struct("Replication")
            .field("url", &self.parts.config.masked_url())
            .field("direction", &self.parts.config.direction)
            .field("state", &status.state)
            .field("session_id", &status.session_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::mock::MockHttpClient;

    fn replication(config: ReplicationConfig) -> Replication {
        let store = Arc::new(MemoryStore::new());
        Replication::new(config, Arc::new(MockHttpClient::new()), store.clone(), store)
    }

    #[test]
    fn session_ids_are_numbered() {
        let first = next_session_id();
        let second = next_session_id();
        assert!(first.starts_with("repl"));
        assert_eq!(first.len(), 7);
        let number = |id: &str| id[4..].parse::<usize>().unwrap();
        assert!(number(&second) > number(&first));
    }

    #[test]
    fn new_replication_is_initial() {
        let replication = replication(ReplicationConfig::push("http://h/db"));
        let status = replication.status();
        assert_eq!(status.state, ReplicationState::Initial);
        assert!(status.online);
        assert!(replication.pending_document_ids().is_empty());
    }

    #[test]
    fn commands_before_start_are_ignored() {
        let replication = replication(ReplicationConfig::push("http://h/db"));
        replication.stop();
        replication.go_offline();
        replication.go_online();
        assert_eq!(replication.state(), ReplicationState::Initial);
    }

    #[test]
    fn invalid_configuration_is_refused() {
        let replication = replication(ReplicationConfig::push("ftp://h/db"));
        assert!(matches!(
            replication.start(),
            Err(ReplicationError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let replication = replication(ReplicationConfig::push("http://h/db"));
        replication.start().unwrap();
        assert!(matches!(
            replication.start(),
            Err(ReplicationError::InvalidStateTransition { .. })
        ));
        replication.stop();
        replication.wait_for_stop().await;
    }

    #[tokio::test]
    async fn wait_for_stop_after_restart_waits_for_the_new_run() {
        let replication = replication(ReplicationConfig::push("http://h/db"));
        replication.start().unwrap();
        let first = replication.wait_for_stop().await;
        assert_eq!(first.state, ReplicationState::Stopped);

        replication.restart().unwrap();
        let second = replication.wait_for_stop().await;
        assert_eq!(second.state, ReplicationState::Stopped);
        assert!(second.session_id.is_some());
        assert_ne!(second.session_id, first.session_id);
        assert_eq!(replication.status().session_id, second.session_id);
    }

    #[test]
    fn checkpoint_id_depends_on_local_database() {
        let config = ReplicationConfig::pull("http://h/db");
        let a = Replication::new(
            config.clone(),
            Arc::new(MockHttpClient::new()),
            Arc::new(MemoryStore::with_database_id("a")),
            Arc::new(MemoryStore::new()),
        );
        let b = Replication::new(
            config,
            Arc::new(MockHttpClient::new()),
            Arc::new(MemoryStore::with_database_id("b")),
            Arc::new(MemoryStore::new()),
        );
        assert_ne!(a.checkpoint_id(), b.checkpoint_id());
        assert_eq!(a.checkpoint_id(), a.checkpoint_id());
    }
}
