//! Replication lifecycle state.

use crate::error::{ReplicationError, ReplicationResult};
use docsync_protocol::{RevId, Sequence};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

/// Lifecycle state of a replication run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplicationState {
    /// Created, not started yet.
    Initial,
    /// Moving changes.
    Running,
    /// Caught up with nothing in flight; waiting for new changes.
    Idle,
    /// Feed torn down until the network comes back. Queued work is kept.
    Offline,
    /// Draining outstanding work before stopping.
    Stopping,
    /// Finished. Terminal for the run.
    Stopped,
}

impl ReplicationState {
    /// Returns true if moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: ReplicationState) -> bool {
        use ReplicationState::*;
        matches!(
            (self, next),
            (Initial, Running)
                | (Running, Idle)
                | (Idle, Running)
                | (Running | Idle, Offline)
                | (Offline, Running)
                | (Running | Idle | Offline, Stopping)
                | (Stopping, Stopped)
        )
    }

    /// Returns true while the run is doing or waiting for work.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ReplicationState::Running | ReplicationState::Idle | ReplicationState::Offline
        )
    }

    /// Returns true once the run is over.
    pub fn is_stopped(self) -> bool {
        self == ReplicationState::Stopped
    }
}

impl fmt::Display for ReplicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReplicationState::Initial => "initial",
            ReplicationState::Running => "running",
            ReplicationState::Idle => "idle",
            ReplicationState::Offline => "offline",
            ReplicationState::Stopping => "stopping",
            ReplicationState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Snapshot of a replication, published on every change.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationStatus {
    /// Lifecycle state.
    pub state: ReplicationState,
    /// False while offline.
    pub online: bool,
    /// The error that last affected the whole run.
    pub last_error: Option<ReplicationError>,
    /// Revisions discovered so far.
    pub changes_count: u64,
    /// Revisions terminally resolved so far.
    pub completed_changes_count: u64,
    /// ID of the current run, such as `repl001`.
    pub session_id: Option<String>,
    /// `Server` header reported by the remote.
    pub server: Option<String>,
    /// Highest sequence up to which every change is resolved.
    pub last_sequence: Option<Sequence>,
}

impl Default for ReplicationStatus {
    fn default() -> Self {
        Self {
            state: ReplicationState::Initial,
            online: true,
            last_error: None,
            changes_count: 0,
            completed_changes_count: 0,
            session_id: None,
            server: None,
            last_sequence: None,
        }
    }
}

/// Notification emitted by a running replication.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationEvent {
    /// The lifecycle state changed.
    StateChanged {
        /// Run that changed.
        session_id: String,
        /// Previous state.
        from: ReplicationState,
        /// New state.
        to: ReplicationState,
    },
    /// Progress counters moved.
    Progress {
        /// Revisions discovered so far.
        changes_count: u64,
        /// Revisions terminally resolved so far.
        completed_changes_count: u64,
    },
    /// An error affected the whole run.
    Error {
        /// The error.
        error: ReplicationError,
        /// Whether the error stops the run.
        fatal: bool,
    },
    /// A single document could not be replicated. The run continues.
    DocumentFailed {
        /// Document ID.
        doc_id: String,
        /// Revision that failed.
        rev: RevId,
        /// Why.
        error: ReplicationError,
    },
}

/// Single writer of a replication's published state.
///
/// Every state change goes through [`StatePublisher::transition`], which
/// rejects illegal moves, updates the status snapshot, and emits a
/// [`ReplicationEvent::StateChanged`].
#[derive(Debug, Clone)]
pub struct StatePublisher {
    session_id: String,
    status: Arc<watch::Sender<ReplicationStatus>>,
    events: broadcast::Sender<ReplicationEvent>,
}

impl StatePublisher {
    /// Creates a publisher for run `session_id`.
    pub fn new(
        session_id: impl Into<String>,
        status: Arc<watch::Sender<ReplicationStatus>>,
        events: broadcast::Sender<ReplicationEvent>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            status,
            events,
        }
    }

    /// ID of the run.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Replaces the published status with a fresh one for this run.
    pub fn reset(&self) {
        self.status.send_replace(ReplicationStatus {
            session_id: Some(self.session_id.clone()),
            ..ReplicationStatus::default()
        });
    }

    /// Current state.
    pub fn state(&self) -> ReplicationState {
        self.status.borrow().state
    }

    /// Current status snapshot.
    pub fn status(&self) -> ReplicationStatus {
        self.status.borrow().clone()
    }

    /// Moves to `next`.
    pub fn transition(&self, next: ReplicationState) -> ReplicationResult<()> {
        let from = self.state();
        if !from.can_transition_to(next) {
            debug!(session = %self.session_id, from = %from, to = %next, "illegal transition rejected");
            return Err(ReplicationError::InvalidStateTransition {
                from: from.to_string(),
                to: next.to_string(),
            });
        }
        self.status.send_modify(|status| {
            status.state = next;
            status.online = next != ReplicationState::Offline;
        });
        info!(session = %self.session_id, from = %from, to = %next, "replication state changed");
        self.emit(ReplicationEvent::StateChanged {
            session_id: self.session_id.clone(),
            from,
            to: next,
        });
        Ok(())
    }

    /// Applies `update` to the status snapshot without changing state.
    pub fn update<F>(&self, update: F)
    where
        F: FnOnce(&mut ReplicationStatus),
    {
        self.status.send_modify(|status| {
            let state = status.state;
            update(status);
            status.state = state;
        });
    }

    /// Updates the progress counters, emitting an event if they moved.
    pub fn progress(&self, changes_count: u64, completed_changes_count: u64) {
        let moved = self.status.send_if_modified(|status| {
            if status.changes_count == changes_count
                && status.completed_changes_count == completed_changes_count
            {
                return false;
            }
            status.changes_count = changes_count;
            status.completed_changes_count = completed_changes_count;
            true
        });
        if moved {
            self.emit(ReplicationEvent::Progress {
                changes_count,
                completed_changes_count,
            });
        }
    }

    /// Records a run-level error.
    pub fn error(&self, error: ReplicationError, fatal: bool) {
        self.status
            .send_modify(|status| status.last_error = Some(error.clone()));
        self.emit(ReplicationEvent::Error { error, fatal });
    }

    /// Sends an event. Having no subscribers is fine.
    pub fn emit(&self, event: ReplicationEvent) {
        let _ = self.events.send(event);
    }
}
