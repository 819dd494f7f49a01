//! # docsync Protocol
//!
//! Wire-protocol types for CouchDB-compatible replication.
//!
//! This crate provides:
//! - `RevId` / `Revision` / `RevisionHistory` for revision-tree identifiers
//! - `Sequence`, an opaque change-feed cursor
//! - `_changes` feed request construction and response parsing
//! - `_revs_diff`, `_bulk_docs`, `_bulk_get` and checkpoint message shapes
//! - Multipart MIME framing for documents with attachments
//! - Deterministic checkpoint IDs
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod auth;
mod change;
mod checkpoint_id;
mod error;
mod feed;
mod messages;
mod multipart;
mod revision;
mod sequence;
mod url;

pub use auth::{parse_auth_header, server_is_sync_gateway_version, SYNC_GATEWAY_SERVER_PREFIX};
pub use change::{ChangeEntry, ChangeRev, ChangesResponse};
pub use checkpoint_id::CheckpointIdBuilder;
pub use error::{ProtocolError, ProtocolResult};
pub use feed::{ChangesFeedRequest, FeedMode, DEFAULT_HEARTBEAT_MS, DEFAULT_FEED_LIMIT};
pub use messages::{
    BulkDocsRequest, BulkDocsResult, BulkGetItem, BulkGetRequest, CheckpointDocument,
    RevsDiffEntry, RevsDiffRequest, RevsDiffResponse,
};
pub use multipart::{boundary_from_content_type, parse_multipart, MultipartWriter, Part};
pub use revision::{JsonObject, RevId, Revision, RevisionHistory};
pub use sequence::Sequence;
pub use crate::url::{
    build_relative_url, encode_path_segment, form_encode, mask_credentials, server_root,
};
