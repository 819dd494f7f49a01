//! Checkpoint persistence.
//!
//! A replication's progress is stored on the remote as the local document
//! `_local/<checkpoint id>` with body `{"lastSequence": ...}` and mirrored
//! into the local store. [`Checkpointer`] reads and writes that document;
//! [`CheckpointWriter`] coalesces sequence advances so at most one write is
//! in flight and intermediate values are superseded rather than queued.

use crate::error::{ReplicationError, ReplicationResult};
use crate::executor::RetryingExecutor;
use crate::state::StatePublisher;
use crate::store::LocalStore;
use docsync_protocol::{CheckpointDocument, Sequence};
use parking_lot::Mutex;
use serde::Deserialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
struct PutResponse {
    rev: String,
}

/// Reads and writes one checkpoint document.
#[derive(Debug)]
pub struct Checkpointer {
    executor: RetryingExecutor,
    checkpoint_id: String,
    rev: Mutex<Option<String>>,
}

impl Checkpointer {
    /// Creates a checkpointer for `checkpoint_id`.
    pub fn new(executor: RetryingExecutor, checkpoint_id: impl Into<String>) -> Self {
        Self {
            executor,
            checkpoint_id: checkpoint_id.into(),
            rev: Mutex::new(None),
        }
    }

    /// The checkpoint document ID (without the `_local/` prefix).
    pub fn checkpoint_id(&self) -> &str {
        &self.checkpoint_id
    }

    /// Last known revision of the remote checkpoint document.
    pub fn revision(&self) -> Option<String> {
        self.rev.lock().clone()
    }

    fn path(&self) -> String {
        format!("_local/{}", self.checkpoint_id)
    }

    /// Fetches the remote checkpoint. A 404 means no checkpoint yet.
    pub async fn load(&self) -> ReplicationResult<Option<Sequence>> {
        match self.executor.get(&self.path()).await {
            Ok(response) => {
                let document = CheckpointDocument::from_slice(&response.body)?;
                *self.rev.lock() = document.rev;
                Ok(Some(document.last_sequence))
            }
            Err(error) if error.status() == Some(404) => {
                *self.rev.lock() = None;
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }

    /// Loads the remote checkpoint and trusts it only if it matches the
    /// value mirrored in the local store.
    pub async fn load_validated(
        &self,
        store: &dyn LocalStore,
    ) -> ReplicationResult<Option<Sequence>> {
        let remote = self.load().await?;
        let local = store.local_checkpoint(&self.checkpoint_id)?;
        match remote {
            Some(remote) if Some(&remote) == local.as_ref() => {
                debug!(checkpoint_id = %self.checkpoint_id, sequence = %remote, "resuming from checkpoint");
                Ok(Some(remote))
            }
            Some(remote) => {
                info!(
                    checkpoint_id = %self.checkpoint_id,
                    remote = %remote,
                    local = ?local,
                    "lastSequence mismatch, replicating from the start"
                );
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Writes `sequence` and returns the new document revision.
    ///
    /// On 409 the current revision is fetched once and the write retried
    /// once; a second conflict is a [`ReplicationError::CheckpointConflict`].
    pub async fn save(&self, sequence: &Sequence) -> ReplicationResult<String> {
        match self.put(sequence).await {
            Err(error) if error.status() == Some(409) => {
                warn!(checkpoint_id = %self.checkpoint_id, "checkpoint conflict, refreshing revision");
                self.load().await?;
                self.put(sequence).await.map_err(|error| {
                    if error.status() == Some(409) {
                        ReplicationError::CheckpointConflict {
                            checkpoint_id: self.checkpoint_id.clone(),
                        }
                    } else {
                        error
                    }
                })
            }
            other => other,
        }
    }

    async fn put(&self, sequence: &Sequence) -> ReplicationResult<String> {
        let document = CheckpointDocument {
            rev: self.revision(),
            last_sequence: sequence.clone(),
        };
        let response = self.executor.put_json(&self.path(), &document).await?;
        let saved: PutResponse = response.json_body()?;
        *self.rev.lock() = Some(saved.rev.clone());
        Ok(saved.rev)
    }
}

#[derive(Debug, Default)]
struct WriterState {
    pending: Option<Sequence>,
    saved: Option<Sequence>,
    failed: Option<Sequence>,
    last_error: Option<ReplicationError>,
    urgent: bool,
    closing: bool,
    in_flight: bool,
    waiters: Vec<oneshot::Sender<()>>,
}

impl WriterState {
    fn is_settled(&self) -> bool {
        self.pending.is_none() && !self.in_flight
    }
}

struct WriterShared {
    checkpointer: Checkpointer,
    store: Arc<dyn LocalStore>,
    publisher: StatePublisher,
    delay: Duration,
    state: Mutex<WriterState>,
    notify: Notify,
}

/// Background task that persists checkpoint advances.
pub struct CheckpointWriter {
    shared: Arc<WriterShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CheckpointWriter {
    /// Spawns the writer. `saved` is the checkpoint the run resumed from.
    ///
    /// Failures to mirror a saved checkpoint into `store` are reported
    /// through `publisher` as non-fatal errors.
    pub fn spawn(
        checkpointer: Checkpointer,
        store: Arc<dyn LocalStore>,
        publisher: StatePublisher,
        delay: Duration,
        saved: Option<Sequence>,
    ) -> Self {
        let shared = Arc::new(WriterShared {
            checkpointer,
            store,
            publisher,
            delay,
            state: Mutex::new(WriterState {
                saved,
                ..WriterState::default()
            }),
            notify: Notify::new(),
        });
        let task = tokio::spawn(run(shared.clone()));
        Self {
            shared,
            task: Mutex::new(Some(task)),
        }
    }

    /// The checkpoint ID this writer persists.
    pub fn checkpoint_id(&self) -> &str {
        self.shared.checkpointer.checkpoint_id()
    }

    /// Requests that `sequence` be persisted.
    ///
    /// Advancing to the value already saved (or already pending) is a
    /// no-op. A newer value replaces a pending one that was not yet written.
    pub fn advance(&self, sequence: Sequence) {
        {
            let mut state = self.shared.state.lock();
            if state.closing
                || state.saved.as_ref() == Some(&sequence)
                || state.pending.as_ref() == Some(&sequence)
            {
                return;
            }
            state.failed = None;
            state.pending = Some(sequence);
        }
        self.shared.notify.notify_one();
    }

    /// Skips the coalescing window for the pending value.
    ///
    /// The returned future completes once no write is pending or in flight.
    pub fn flush(&self) -> impl Future<Output = ()> + Send + 'static {
        let waiter = {
            let mut state = self.shared.state.lock();
            if state.is_settled() {
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push(tx);
                state.urgent = true;
                Some(rx)
            }
        };
        self.shared.notify.notify_one();
        async move {
            if let Some(rx) = waiter {
                let _ = rx.await;
            }
        }
    }

    /// Last successfully saved sequence.
    pub fn saved(&self) -> Option<Sequence> {
        self.shared.state.lock().saved.clone()
    }

    /// Error of the most recent failed write, cleared by a later success.
    pub fn last_error(&self) -> Option<ReplicationError> {
        self.shared.state.lock().last_error.clone()
    }

    /// Writes any pending or previously failed value once more, then stops
    /// the task. Later advances are ignored.
    pub async fn close(&self) {
        {
            let mut state = self.shared.state.lock();
            state.closing = true;
            if state.pending.is_none() {
                state.pending = state.failed.take();
            }
        }
        self.shared.notify.notify_one();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl fmt::Debug for CheckpointWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("CheckpointWriter")
            .field("checkpoint_id", &self.checkpoint_id())
            .field("pending", &state.pending)
            .field("saved", &state.saved)
            .finish()
    }
}

impl Drop for CheckpointWriter {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

async fn run(shared: Arc<WriterShared>) {
    loop {
        let notified = shared.notify.notified();
        let (has_work, closing) = {
            let state = shared.state.lock();
            (state.pending.is_some(), state.closing)
        };
        if !has_work {
            if closing {
                release_waiters(&shared);
                return;
            }
            notified.await;
            continue;
        }

        wait_for_window(&shared).await;

        let sequence = {
            let mut state = shared.state.lock();
            state.urgent = false;
            match state.pending.take() {
                Some(sequence) => {
                    state.in_flight = true;
                    sequence
                }
                None => continue,
            }
        };

        let result = shared.checkpointer.save(&sequence).await;
        if result.is_ok() {
            if let Err(error) = shared
                .store
                .set_local_checkpoint(shared.checkpointer.checkpoint_id(), &sequence)
            {
                warn!(error = %error, "failed to mirror checkpoint locally");
                shared.publisher.error(error.into(), false);
            }
        }

        let settled = {
            let mut state = shared.state.lock();
            state.in_flight = false;
            match result {
                Ok(rev) => {
                    debug!(
                        checkpoint_id = %shared.checkpointer.checkpoint_id(),
                        sequence = %sequence,
                        rev = %rev,
                        "saved checkpoint"
                    );
                    state.saved = Some(sequence);
                    state.last_error = None;
                }
                Err(error) => {
                    warn!(
                        checkpoint_id = %shared.checkpointer.checkpoint_id(),
                        sequence = %sequence,
                        error = %error,
                        "failed to save checkpoint"
                    );
                    if state.pending.is_none() && !state.closing {
                        state.failed = Some(sequence);
                    }
                    state.last_error = Some(error);
                }
            }
            state.pending.is_none()
        };
        if settled {
            release_waiters(&shared);
        }
    }
}

/// Waits out the coalescing window unless a flush or close cuts it short.
async fn wait_for_window(shared: &WriterShared) {
    if shared.delay.is_zero() {
        return;
    }
    let deadline = Instant::now() + shared.delay;
    loop {
        let notified = shared.notify.notified();
        {
            let state = shared.state.lock();
            if state.urgent || state.closing {
                return;
            }
        }
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return,
            _ = notified => {}
        }
    }
}

fn release_waiters(shared: &WriterShared) {
    let waiters = std::mem::take(&mut shared.state.lock().waiters);
    for waiter in waiters {
        let _ = waiter.send(());
    }
}
