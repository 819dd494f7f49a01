//! # docsync Replicator
//!
//! CouchDB-compatible replication engine for docsync.
//!
//! This crate provides:
//! - A retrying HTTP executor with bounded concurrency and exponential backoff
//! - A `_changes` feed tracker (one-shot and long-poll)
//! - Remote checkpoints mirrored into the local store
//! - Revision batching, `_revs_diff` resolution and bulk transfer
//!   (`_bulk_docs`, multipart uploads, `_bulk_get`)
//! - A replication state machine with status and event publishing
//! - An in-memory store and a scriptable mock HTTP client for tests
//!
//! ## Architecture
//!
//! Each run of a [`Replication`] is a single task that owns all mutable
//! replication state:
//! 1. Load and validate the checkpoint
//! 2. Follow the source feed (remote `_changes` or the local change log)
//! 3. Batch discovered revisions and diff them against the destination
//! 4. Transfer missing revisions, several batches at a time
//! 5. Advance the checkpoint as sequences resolve
//!
//! Transfers run as child tasks and report back to the run task, which is
//! the only place revisions are inserted into the local store.
//!
//! ## Key Invariants
//!
//! - The checkpoint never passes a sequence with unresolved revisions
//! - Checkpoint writes are serialized and each carries the latest `_rev`
//! - A revision is counted as completed exactly once
//! - Every state change goes through one publisher and is validated
//! - Stopping drains in-flight transfers and saves the final checkpoint

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(not(test), warn(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

mod auth;
mod batcher;
mod bulk;
mod change_tracker;
mod checkpoint;
mod config;
mod diff;
mod driver;
mod error;
mod executor;
mod memory;
mod mock;
mod replication;
mod sequence_map;
mod signal;
mod state;
mod store;
mod transport;

pub use auth::{
    check_session, Authenticator, BasicAuthenticator, SessionAuthenticator, TokenAuthenticator,
};
pub use batcher::Batcher;
pub use bulk::{
    BulkTransferor, FetchStatus, FetchedRevision, PullOutcome, PushOutcome, TransferLimits,
    TransferStatus,
};
pub use change_tracker::{initial_since, ChangeTracker, ChangeTrackerClient, ChangeTrackerHandle};
pub use checkpoint::{CheckpointWriter, Checkpointer};
pub use config::{
    BackoffConfig, BulkGetMode, Direction, ReplicationConfig, RetryConfig, CHANNELS_FILTER,
};
pub use diff::{BatchDiff, DiffResolver, NeededRevision, PendingRevision};
pub use error::{ReplicationError, ReplicationResult};
pub use executor::{AttemptObserver, AttemptOutcome, AttemptRecord, RetryingExecutor};
pub use memory::MemoryStore;
pub use mock::{MockHttpClient, MockReply};
pub use replication::Replication;
pub use sequence_map::{SequenceId, SequenceMap};
pub use signal::{StopSignal, StopTrigger};
pub use state::{ReplicationEvent, ReplicationState, ReplicationStatus, StatePublisher};
pub use store::{
    BlobStore, LocalChange, LocalStore, RevisionFilter, StoreError, StoreEvent, StoreResult,
};
pub use transport::{HttpClient, HttpMethod, HttpRequest, HttpResponse, TransportError};
