//! Bulk content transfer.
//!
//! Push uploads go through `_bulk_docs`, except documents whose attachments
//! must travel with them: those are PUT one by one as `multipart/related`.
//! Pulls fetch through `_bulk_get` when the server supports it and fall
//! back to one GET per revision otherwise. Failures that concern a single
//! document are reported for that document only; failures of a whole
//! request abort every item the request carried.

use crate::config::ReplicationConfig;
use crate::diff::{NeededRevision, PendingRevision};
use crate::error::{ReplicationError, ReplicationResult};
use crate::executor::RetryingExecutor;
use crate::store::{BlobStore, LocalStore};
use crate::transport::{HttpRequest, HttpResponse};
use base64::prelude::{Engine as _, BASE64_STANDARD};
use docsync_protocol::{
    boundary_from_content_type, encode_path_segment, form_encode, parse_multipart, BulkDocsRequest,
    BulkDocsResult, BulkGetItem, BulkGetRequest, JsonObject, MultipartWriter, Part, RevId, Revision,
    RevisionHistory,
};
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Size and concurrency limits for transfers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferLimits {
    /// Bodies at least this large are gzip-compressed.
    pub gzip_threshold: usize,
    /// Soft cap on one `_bulk_docs` body.
    pub max_bulk_request_bytes: usize,
    /// Maximum ancestors listed in `atts_since`.
    pub max_atts_since: usize,
    /// Maximum concurrent per-document requests.
    pub max_open_connections: usize,
}

impl TransferLimits {
    /// Takes the limits from a replication configuration.
    pub fn from_config(config: &ReplicationConfig) -> Self {
        Self {
            gzip_threshold: config.gzip_threshold,
            max_bulk_request_bytes: config.max_bulk_request_bytes,
            max_atts_since: config.max_atts_since,
            max_open_connections: config.max_open_connections,
        }
    }
}

/// What happened to one pushed revision.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferStatus {
    /// The remote accepted the revision.
    Transferred,
    /// Nothing to send; the revision no longer exists locally.
    Skipped,
    /// The remote refused this document. Final.
    Failed(ReplicationError),
    /// The request carrying the revision failed. Not resolved.
    Aborted(ReplicationError),
}

/// Outcome of pushing one revision.
#[derive(Debug, Clone, PartialEq)]
pub struct PushOutcome {
    /// The revision.
    pub item: PendingRevision,
    /// What happened.
    pub status: TransferStatus,
}

/// A revision fetched from the remote, ready for insertion.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedRevision {
    /// The revision, with attachment bodies moved into the blob store.
    pub revision: Revision,
    /// Revision history, newest first.
    pub history: Vec<RevId>,
}

/// What happened to one pulled revision.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchStatus {
    /// The revision arrived.
    Fetched(FetchedRevision),
    /// The remote could not supply this revision. Final.
    Failed(ReplicationError),
    /// The request carrying the revision failed. Not resolved.
    Aborted(ReplicationError),
}

/// Outcome of pulling one revision.
#[derive(Debug, Clone, PartialEq)]
pub struct PullOutcome {
    /// The revision.
    pub item: PendingRevision,
    /// What happened.
    pub status: FetchStatus,
}

#[derive(Debug)]
struct AttachmentBody {
    name: String,
    content_type: Option<String>,
    data: Vec<u8>,
}

#[derive(Debug)]
struct Upload {
    item: PendingRevision,
    document: JsonObject,
    attachments: Vec<AttachmentBody>,
}

/// One answer inside a `_bulk_get` response.
#[derive(Debug)]
enum BulkGetEntry {
    Document {
        document: JsonObject,
        attachments: Vec<Part>,
    },
    Error {
        id: Option<String>,
        rev: Option<String>,
        status: u16,
        reason: String,
    },
}

impl BulkGetEntry {
    fn matches(&self, item: &PendingRevision) -> bool {
        let rev = item.rev_id.to_string();
        match self {
            BulkGetEntry::Document { document, .. } => {
                document.get("_id").and_then(Value::as_str) == Some(item.doc_id.as_str())
                    && document.get("_rev").and_then(Value::as_str) == Some(rev.as_str())
            }
            BulkGetEntry::Error { id, rev: error_rev, .. } => {
                id.as_deref() == Some(item.doc_id.as_str())
                    && error_rev.as_deref().map_or(true, |error_rev| error_rev == rev)
            }
        }
    }

    fn has_identity(&self) -> bool {
        match self {
            BulkGetEntry::Document { document, .. } => document.contains_key("_id"),
            BulkGetEntry::Error { id, .. } => id.is_some(),
        }
    }

    fn from_error_object(error: &JsonObject) -> Self {
        let text = |key: &str| error.get(key).and_then(Value::as_str).map(str::to_string);
        let status = error
            .get("status")
            .and_then(Value::as_u64)
            .and_then(|status| u16::try_from(status).ok())
            .unwrap_or_else(|| match text("error").as_deref() {
                Some("not_found") => 404,
                Some("forbidden") => 403,
                _ => 500,
            });
        BulkGetEntry::Error {
            id: text("id"),
            rev: text("rev"),
            status,
            reason: text("reason")
                .or_else(|| text("error"))
                .unwrap_or_else(|| "unknown error".into()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BulkGetJsonResponse {
    #[serde(default)]
    results: Vec<BulkGetJsonResult>,
}

#[derive(Debug, Deserialize)]
struct BulkGetJsonResult {
    #[serde(default)]
    docs: Vec<BulkGetJsonDoc>,
}

#[derive(Debug, Deserialize)]
struct BulkGetJsonDoc {
    #[serde(default)]
    ok: Option<JsonObject>,
    #[serde(default)]
    error: Option<JsonObject>,
}

/// Moves revision content between the local store and the remote.
pub struct BulkTransferor {
    executor: RetryingExecutor,
    store: Arc<dyn LocalStore>,
    blobs: Arc<dyn BlobStore>,
    limits: TransferLimits,
    multipart_supported: AtomicBool,
    bulk_get_available: AtomicBool,
}

impl BulkTransferor {
    /// Creates a transferor.
    pub fn new(
        executor: RetryingExecutor,
        store: Arc<dyn LocalStore>,
        blobs: Arc<dyn BlobStore>,
        limits: TransferLimits,
    ) -> Self {
        Self {
            executor,
            store,
            blobs,
            limits,
            multipart_supported: AtomicBool::new(true),
            bulk_get_available: AtomicBool::new(true),
        }
    }

    /// Returns false once the remote refused a multipart upload.
    pub fn multipart_supported(&self) -> bool {
        self.multipart_supported.load(Ordering::Relaxed)
    }

    // ---- push ----

    /// Uploads revisions the remote reported missing.
    pub async fn push(&self, needed: Vec<NeededRevision>) -> Vec<PushOutcome> {
        let mut outcomes = Vec::new();
        let mut plain = Vec::new();
        let mut with_attachments = Vec::new();
        for revision in needed {
            let item = revision.item.clone();
            match self.prepare_upload(revision) {
                Ok(None) => outcomes.push(PushOutcome {
                    item,
                    status: TransferStatus::Skipped,
                }),
                Ok(Some(upload)) if upload.attachments.is_empty() => plain.push(upload),
                Ok(Some(upload)) => with_attachments.push(upload),
                Err(error) => outcomes.push(PushOutcome {
                    status: document_failure(&item.doc_id, error),
                    item,
                }),
            }
        }

        let (bulk, single) = futures::join!(
            self.upload_bulk(plain),
            self.upload_all_multipart(with_attachments)
        );
        outcomes.extend(bulk);
        outcomes.extend(single);
        outcomes
    }

    fn prepare_upload(&self, needed: NeededRevision) -> ReplicationResult<Option<Upload>> {
        let item = needed.item.clone();
        let Some(revision) = self.store.load_revision(&item.doc_id, &item.rev_id)? else {
            debug!(doc_id = %item.doc_id, rev = %item.rev_id, "revision gone locally, skipping");
            return Ok(None);
        };
        let mut history = self.store.revision_history(&item.doc_id, &item.rev_id)?;
        if history.is_empty() {
            history.push(item.rev_id.clone());
        }

        let mut document = revision.to_document();
        document.insert(
            "_revisions".into(),
            RevisionHistory::from_rev_ids(&history)?.to_value(),
        );

        let known_generation = needed.max_ancestor_generation();
        let mut attachments = Vec::new();
        if let Some(Value::Object(metas)) = document.get_mut("_attachments") {
            for (name, meta) in metas.iter_mut() {
                let Value::Object(meta) = meta else {
                    continue;
                };
                let revpos = meta.get("revpos").and_then(Value::as_u64).unwrap_or(0);
                if known_generation.is_some_and(|generation| revpos > 0 && revpos <= generation) {
                    meta.remove("data");
                    meta.remove("follows");
                    meta.insert("stub".into(), Value::Bool(true));
                    continue;
                }
                if meta.contains_key("data") {
                    continue;
                }
                let digest = meta
                    .get("digest")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let data = self.blobs.read_blob(&digest)?.ok_or_else(|| {
                    ReplicationError::DocumentRejected {
                        doc_id: item.doc_id.clone(),
                        reason: format!("attachment {name} is missing locally"),
                    }
                })?;
                meta.remove("stub");
                meta.insert("follows".into(), Value::Bool(true));
                attachments.push(AttachmentBody {
                    name: name.clone(),
                    content_type: meta
                        .get("content_type")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    data,
                });
            }
        }

        Ok(Some(Upload {
            item,
            document,
            attachments,
        }))
    }

    async fn upload_bulk(&self, uploads: Vec<Upload>) -> Vec<PushOutcome> {
        let mut outcomes = Vec::new();
        for chunk in self.split_by_size(uploads) {
            outcomes.extend(self.upload_chunk(chunk).await);
        }
        outcomes
    }

    fn split_by_size(&self, uploads: Vec<Upload>) -> Vec<Vec<Upload>> {
        let mut chunks: Vec<Vec<Upload>> = Vec::new();
        let mut current = Vec::new();
        let mut current_size = 0;
        for upload in uploads {
            let size = serde_json::to_vec(&upload.document).map_or(0, |bytes| bytes.len());
            if !current.is_empty() && current_size + size > self.limits.max_bulk_request_bytes {
                chunks.push(std::mem::take(&mut current));
                current_size = 0;
            }
            current_size += size;
            current.push(upload);
        }
        if !current.is_empty() {
            chunks.push(current);
        }
        chunks
    }

    async fn upload_chunk(&self, chunk: Vec<Upload>) -> Vec<PushOutcome> {
        let (items, documents): (Vec<_>, Vec<_>) = chunk
            .into_iter()
            .map(|upload| (upload.item, upload.document))
            .unzip();
        let count = items.len();

        let result = async {
            let body = BulkDocsRequest::new(documents).to_vec()?;
            let request = self.compressed_post("_bulk_docs", body)?;
            let response = self.executor.execute(request).await?;
            Ok::<_, ReplicationError>(BulkDocsResult::parse_list(&response.body)?)
        }
        .await;

        let rows = match result {
            Ok(rows) => rows,
            Err(error) => {
                warn!(count, error = %error, "_bulk_docs failed");
                return items
                    .into_iter()
                    .map(|item| PushOutcome {
                        item,
                        status: TransferStatus::Aborted(error.clone()),
                    })
                    .collect();
            }
        };

        // Rows that name a revision only match that revision of the document.
        let errors: HashMap<(&str, Option<&str>), &BulkDocsResult> = rows
            .iter()
            .filter(|row| row.is_error())
            .map(|row| ((row.id.as_str(), row.rev.as_deref()), row))
            .collect();
        debug!(count, errors = errors.len(), "_bulk_docs complete");

        items
            .into_iter()
            .map(|item| {
                let rev = item.rev_id.to_string();
                let row = errors
                    .get(&(item.doc_id.as_str(), Some(rev.as_str())))
                    .or_else(|| errors.get(&(item.doc_id.as_str(), None)));
                let status = match row {
                    Some(row) => {
                        let reason = row
                            .reason
                            .clone()
                            .or_else(|| row.error.clone())
                            .unwrap_or_default();
                        warn!(
                            doc_id = %item.doc_id,
                            status = row.error_status(),
                            reason = %reason,
                            "remote refused document"
                        );
                        TransferStatus::Failed(ReplicationError::DocumentRejected {
                            doc_id: item.doc_id.clone(),
                            reason,
                        })
                    }
                    None => TransferStatus::Transferred,
                };
                PushOutcome { item, status }
            })
            .collect()
    }

    fn compressed_post(&self, relative: &str, body: Vec<u8>) -> ReplicationResult<HttpRequest> {
        let request = HttpRequest::post(self.executor.url(relative))
            .with_header("Content-Type", "application/json");
        if body.len() < self.limits.gzip_threshold {
            return Ok(request.with_body(body));
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&body)
            .map_err(|error| ReplicationError::Codec(error.to_string()))?;
        let compressed = encoder
            .finish()
            .map_err(|error| ReplicationError::Codec(error.to_string()))?;
        Ok(request
            .with_header("Content-Encoding", "gzip")
            .with_body(compressed))
    }

    async fn upload_all_multipart(&self, uploads: Vec<Upload>) -> Vec<PushOutcome> {
        stream::iter(uploads)
            .map(|upload| self.upload_multipart(upload))
            .buffer_unordered(self.limits.max_open_connections.max(1))
            .collect()
            .await
    }

    async fn upload_multipart(&self, upload: Upload) -> PushOutcome {
        if !self.multipart_supported() {
            return self.upload_inline(upload).await;
        }
        let request = match multipart_request(&self.executor, &upload) {
            Ok(request) => request,
            Err(error) => {
                return PushOutcome {
                    status: document_failure(&upload.item.doc_id, error),
                    item: upload.item,
                }
            }
        };
        match self.executor.execute(request).await {
            Ok(_) => PushOutcome {
                item: upload.item,
                status: TransferStatus::Transferred,
            },
            Err(error) if error.status() == Some(415) => {
                if self.multipart_supported.swap(false, Ordering::Relaxed) {
                    info!("remote refused multipart upload, sending attachments inline");
                }
                self.upload_inline(upload).await
            }
            Err(error) => PushOutcome {
                status: document_failure(&upload.item.doc_id, error),
                item: upload.item,
            },
        }
    }

    async fn upload_inline(&self, upload: Upload) -> PushOutcome {
        let Upload {
            item,
            mut document,
            attachments,
        } = upload;
        if let Some(Value::Object(metas)) = document.get_mut("_attachments") {
            for attachment in &attachments {
                if let Some(Value::Object(meta)) = metas.get_mut(&attachment.name) {
                    meta.remove("follows");
                    meta.insert(
                        "data".into(),
                        Value::String(BASE64_STANDARD.encode(&attachment.data)),
                    );
                }
            }
        }
        let path = format!("{}?new_edits=false", encode_path_segment(&item.doc_id));
        let status = match self.executor.put_json(&path, &document).await {
            Ok(_) => TransferStatus::Transferred,
            Err(error) => document_failure(&item.doc_id, error),
        };
        PushOutcome { item, status }
    }

    // ---- pull ----

    /// Fetches revisions missing locally.
    ///
    /// With `use_bulk_get`, one `_bulk_get` request carries the batch; if
    /// the endpoint does not exist the transferor remembers that and falls
    /// back to per-revision GETs for the rest of the run.
    pub async fn pull(&self, needed: Vec<NeededRevision>, use_bulk_get: bool) -> Vec<PullOutcome> {
        let items: Vec<PendingRevision> = needed.into_iter().map(|needed| needed.item).collect();
        if items.is_empty() {
            return Vec::new();
        }
        if use_bulk_get && self.bulk_get_available.load(Ordering::Relaxed) {
            match self.bulk_get(&items).await {
                Ok(outcomes) => return outcomes,
                Err(error) if matches!(error.status(), Some(404) | Some(405)) => {
                    self.bulk_get_available.store(false, Ordering::Relaxed);
                    info!("remote has no _bulk_get, fetching documents one by one");
                }
                Err(error) => {
                    warn!(count = items.len(), error = %error, "_bulk_get failed");
                    return items
                        .into_iter()
                        .map(|item| PullOutcome {
                            item,
                            status: FetchStatus::Aborted(error.clone()),
                        })
                        .collect();
                }
            }
        }

        stream::iter(items)
            .map(|item| async move {
                let status = self.fetch_one(&item).await;
                PullOutcome { item, status }
            })
            .buffer_unordered(self.limits.max_open_connections.max(1))
            .collect()
            .await
    }

    fn atts_since(&self, doc_id: &str) -> ReplicationResult<Vec<RevId>> {
        let mut known = self.store.known_revisions(doc_id)?;
        known.truncate(self.limits.max_atts_since);
        Ok(known)
    }

    async fn bulk_get(&self, items: &[PendingRevision]) -> ReplicationResult<Vec<PullOutcome>> {
        let mut request = BulkGetRequest::default();
        for item in items {
            request.docs.push(BulkGetItem {
                id: item.doc_id.clone(),
                rev: item.rev_id.clone(),
                atts_since: self.atts_since(&item.doc_id)?,
            });
        }
        let http_request = self.compressed_post(BulkGetRequest::PATH, request.to_vec()?)?;
        let response = self.executor.execute(http_request).await?;
        let entries = parse_bulk_get(&response)?;

        let mut slots: Vec<Option<FetchStatus>> = vec![None; items.len()];
        for (index, entry) in entries.into_iter().enumerate() {
            let target = items
                .iter()
                .enumerate()
                .position(|(slot, item)| slots[slot].is_none() && entry.matches(item))
                .or_else(|| {
                    (!entry.has_identity() && index < items.len() && slots[index].is_none())
                        .then_some(index)
                });
            if let Some(target) = target {
                slots[target] = Some(self.entry_status(&items[target], entry));
            }
        }

        Ok(items
            .iter()
            .cloned()
            .zip(slots)
            .map(|(item, status)| {
                let status = status.unwrap_or_else(|| {
                    FetchStatus::Failed(ReplicationError::DocumentMissingOnPeer {
                        doc_id: item.doc_id.clone(),
                        rev: Some(item.rev_id.clone()),
                    })
                });
                PullOutcome { item, status }
            })
            .collect())
    }

    fn entry_status(&self, item: &PendingRevision, entry: BulkGetEntry) -> FetchStatus {
        match entry {
            BulkGetEntry::Document {
                document,
                attachments,
            } => match self.decode_document(document, attachments) {
                Ok(fetched) => FetchStatus::Fetched(fetched),
                Err(error) => fetch_failure(error),
            },
            BulkGetEntry::Error { status, reason, .. } => {
                debug!(doc_id = %item.doc_id, rev = %item.rev_id, status, reason = %reason, "_bulk_get entry failed");
                FetchStatus::Failed(match status {
                    404 => ReplicationError::DocumentMissingOnPeer {
                        doc_id: item.doc_id.clone(),
                        rev: Some(item.rev_id.clone()),
                    },
                    401 | 403 => ReplicationError::DocumentRejected {
                        doc_id: item.doc_id.clone(),
                        reason,
                    },
                    status => ReplicationError::Protocol {
                        status,
                        message: reason,
                    },
                })
            }
        }
    }

    async fn fetch_one(&self, item: &PendingRevision) -> FetchStatus {
        let atts_since = match self.atts_since(&item.doc_id) {
            Ok(atts_since) => atts_since,
            Err(error) => return FetchStatus::Aborted(error),
        };
        let mut path = format!(
            "{}?rev={}&revs=true&attachments=true",
            encode_path_segment(&item.doc_id),
            form_encode(&item.rev_id.to_string())
        );
        if !atts_since.is_empty() {
            let list: Vec<String> = atts_since.iter().map(RevId::to_string).collect();
            path.push_str("&atts_since=");
            path.push_str(&form_encode(&Value::from(list).to_string()));
        }
        let request = HttpRequest::get(self.executor.url(&path))
            .with_header("Accept", "multipart/related, application/json");

        let response = match self.executor.execute(request).await {
            Ok(response) => response,
            Err(error) if error.status() == Some(404) => {
                return FetchStatus::Failed(ReplicationError::DocumentMissingOnPeer {
                    doc_id: item.doc_id.clone(),
                    rev: Some(item.rev_id.clone()),
                })
            }
            Err(error) => {
                return match classify_document_error(&item.doc_id, error) {
                    Ok(error) => FetchStatus::Failed(error),
                    Err(error) => FetchStatus::Aborted(error),
                }
            }
        };

        let decoded = split_document(response.content_type(), &response.body)
            .and_then(|(document, attachments)| self.decode_document(document, attachments));
        match decoded {
            Ok(fetched) => FetchStatus::Fetched(fetched),
            Err(error) => fetch_failure(error),
        }
    }

    /// Moves attachment bodies into the blob store and parses the revision.
    fn decode_document(
        &self,
        document: JsonObject,
        attachments: Vec<Part>,
    ) -> ReplicationResult<FetchedRevision> {
        let mut history = RevisionHistory::from_document(&document)
            .map(|history| history.to_rev_ids())
            .unwrap_or_default();
        let mut revision = Revision::from_document(&document)?;
        let mut parts = attachments;

        if let Some(Value::Object(metas)) = revision.body.get_mut("_attachments") {
            for (name, meta) in metas.iter_mut() {
                let Value::Object(meta) = meta else {
                    continue;
                };
                let data = if meta.get("follows").and_then(Value::as_bool) == Some(true) {
                    let part = take_part(&mut parts, name).ok_or_else(|| {
                        ReplicationError::Codec(format!("attachment {name} has no MIME part"))
                    })?;
                    Some(part.body)
                } else if let Some(Value::String(encoded)) = meta.get("data") {
                    Some(
                        BASE64_STANDARD
                            .decode(encoded)
                            .map_err(|error| ReplicationError::Codec(error.to_string()))?,
                    )
                } else {
                    None
                };
                if let Some(data) = data {
                    let digest = self.blobs.write_blob(&data)?;
                    meta.remove("data");
                    meta.remove("follows");
                    meta.insert("stub".into(), Value::Bool(true));
                    meta.insert("digest".into(), Value::String(digest));
                    meta.insert("length".into(), Value::from(data.len()));
                }
            }
        }

        if history.first() != Some(&revision.rev_id) {
            history.insert(0, revision.rev_id.clone());
        }
        Ok(FetchedRevision { revision, history })
    }
}

fn multipart_request(executor: &RetryingExecutor, upload: &Upload) -> ReplicationResult<HttpRequest> {
    let mut writer = MultipartWriter::new("related");
    writer.add_json(&upload.document)?;
    for attachment in &upload.attachments {
        writer.add_attachment(
            &attachment.name,
            attachment.content_type.as_deref(),
            attachment.data.clone(),
        );
    }
    let path = format!("{}?new_edits=false", encode_path_segment(&upload.item.doc_id));
    Ok(HttpRequest::put(executor.url(&path))
        .with_header("Content-Type", writer.content_type())
        .with_body(writer.finish()))
}

/// Splits a failed single-document exchange into final failures (`Ok`)
/// and failures that leave the document unresolved (`Err`).
fn classify_document_error(
    doc_id: &str,
    error: ReplicationError,
) -> Result<ReplicationError, ReplicationError> {
    match error {
        ReplicationError::Authentication {
            status: Some(403),
            message,
            ..
        } => Ok(ReplicationError::DocumentRejected {
            doc_id: doc_id.to_string(),
            reason: message,
        }),
        ReplicationError::Cancelled => Err(ReplicationError::Cancelled),
        error if error.is_retryable() || error.is_terminal() => Err(error),
        error => Ok(error),
    }
}

fn document_failure(doc_id: &str, error: ReplicationError) -> TransferStatus {
    match classify_document_error(doc_id, error) {
        Ok(error) => TransferStatus::Failed(error),
        Err(error) => TransferStatus::Aborted(error),
    }
}

fn fetch_failure(error: ReplicationError) -> FetchStatus {
    if error.is_retryable() || error.is_terminal() {
        FetchStatus::Aborted(error)
    } else {
        FetchStatus::Failed(error)
    }
}

/// Removes the MIME part whose `Content-Disposition` names `name`.
fn take_part(parts: &mut Vec<Part>, name: &str) -> Option<Part> {
    let index = parts.iter().position(|part| {
        part.header("Content-Disposition")
            .is_some_and(|disposition| disposition_names(disposition, name))
    })?;
    Some(parts.remove(index))
}

/// Returns true if a `filename` or `name` parameter of the disposition equals `name`.
fn disposition_names(disposition: &str, name: &str) -> bool {
    disposition
        .split(';')
        .skip(1)
        .filter_map(|param| param.split_once('='))
        .any(|(key, value)| {
            let key = key.trim();
            (key.eq_ignore_ascii_case("filename") || key.eq_ignore_ascii_case("name"))
                && value.trim().trim_matches('"') == name
        })
}

/// Splits a single-document response into the JSON body and attachment parts.
fn split_document(content_type: Option<&str>, body: &[u8]) -> ReplicationResult<(JsonObject, Vec<Part>)> {
    if let Some(boundary) = content_type.and_then(boundary_from_content_type) {
        let mut parts = parse_multipart(body, &boundary)?;
        if parts.is_empty() {
            return Err(ReplicationError::Codec("empty multipart document".into()));
        }
        let document = parts.remove(0).json_object()?;
        return Ok((document, parts));
    }
    Ok((serde_json::from_slice(body)?, Vec::new()))
}

fn parse_bulk_get(response: &HttpResponse) -> ReplicationResult<Vec<BulkGetEntry>> {
    if let Some(boundary) = response.content_type().and_then(boundary_from_content_type) {
        let mut entries = Vec::new();
        for part in parse_multipart(&response.body, &boundary)? {
            let (document, attachments) = split_document(part.content_type(), &part.body)?;
            if document.contains_key("error") && !document.contains_key("_rev") {
                entries.push(BulkGetEntry::from_error_object(&document));
            } else {
                entries.push(BulkGetEntry::Document {
                    document,
                    attachments,
                });
            }
        }
        return Ok(entries);
    }

    let parsed: BulkGetJsonResponse = response.json_body()?;
    Ok(parsed
        .results
        .into_iter()
        .flat_map(|result| result.docs)
        .filter_map(|doc| match (doc.ok, doc.error) {
            (Some(document), _) => Some(BulkGetEntry::Document {
                document,
                attachments: Vec::new(),
            }),
            (None, Some(error)) => Some(BulkGetEntry::from_error_object(&error)),
            (None, None) => None,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::memory::MemoryStore;
    use crate::mock::{MockHttpClient, MockReply};
    use crate::signal::StopSignal;
    use crate::transport::HttpMethod;
    use docsync_protocol::Sequence;
    use serde_json::json;

    fn body(value: Value) -> JsonObject {
        match value {
            Value::Object(map) => map,
            _ => JsonObject::new(),
        }
    }

    fn setup(limits: TransferLimits) -> (Arc<MockHttpClient>, Arc<MemoryStore>, BulkTransferor) {
        let mock = Arc::new(MockHttpClient::new());
        let store = Arc::new(MemoryStore::with_database_id("local"));
        let executor = RetryingExecutor::new(
            mock.clone(),
            "http://h/db",
            RetryConfig::no_retry(),
            4,
            StopSignal::never(),
        );
        let transferor = BulkTransferor::new(executor, store.clone(), store.clone(), limits);
        (mock, store, transferor)
    }

    fn limits() -> TransferLimits {
        TransferLimits::from_config(&ReplicationConfig::push("http://h/db"))
    }

    fn needed(seq: u64, doc_id: &str, rev_id: RevId) -> NeededRevision {
        NeededRevision {
            item: PendingRevision {
                seq_id: seq,
                sequence: Sequence::from(seq),
                doc_id: doc_id.into(),
                rev_id,
                deleted: false,
            },
            possible_ancestors: Vec::new(),
        }
    }

    fn statuses(outcomes: &[PushOutcome]) -> HashMap<String, TransferStatus> {
        outcomes
            .iter()
            .map(|outcome| (outcome.item.doc_id.clone(), outcome.status.clone()))
            .collect()
    }

    #[tokio::test]
    async fn bulk_docs_upload_with_history() {
        let (mock, store, transferor) = setup(limits());
        store.put("doc1", body(json!({"n": 1}))).unwrap();
        let rev = store.put("doc1", body(json!({"n": 2}))).unwrap();
        let rev2 = store.put("doc2", body(json!({"m": 1}))).unwrap();
        mock.set_sticky(
            HttpMethod::Post,
            "/_bulk_docs",
            MockReply::json(201, json!([{"id": "doc2", "error": "forbidden", "reason": "no"}])),
        );

        let outcomes = transferor
            .push(vec![needed(2, "doc1", rev.clone()), needed(3, "doc2", rev2)])
            .await;
        let statuses = statuses(&outcomes);
        assert_eq!(statuses["doc1"], TransferStatus::Transferred);
        assert!(matches!(
            &statuses["doc2"],
            TransferStatus::Failed(ReplicationError::DocumentRejected { .. })
        ));

        let request = &mock.requests_matching(HttpMethod::Post, "/_bulk_docs")[0];
        let sent: Value = request.body_json().unwrap();
        assert_eq!(sent["new_edits"], false);
        let doc1 = &sent["docs"][0];
        assert_eq!(doc1["_id"], "doc1");
        assert_eq!(doc1["_rev"], rev.to_string());
        assert_eq!(doc1["_revisions"]["start"], 2);
        assert_eq!(doc1["_revisions"]["ids"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn purged_revisions_are_skipped() {
        let (mock, _store, transferor) = setup(limits());
        let outcomes = transferor.push(vec![needed(1, "gone", RevId::new(1, "x"))]).await;
        assert_eq!(outcomes[0].status, TransferStatus::Skipped);
        assert!(mock.requests().is_empty());
    }

    #[tokio::test]
    async fn bulk_docs_errors_match_the_failed_revision() {
        let (mock, store, transferor) = setup(limits());
        let first = store.put("doc", body(json!({"n": 1}))).unwrap();
        let second = store.put("doc", body(json!({"n": 2}))).unwrap();
        mock.set_sticky(
            HttpMethod::Post,
            "/_bulk_docs",
            MockReply::json(
                201,
                json!([
                    {"id": "doc", "rev": first.to_string(), "error": "conflict", "reason": "old"},
                    {"id": "doc", "rev": second.to_string()}
                ]),
            ),
        );

        let outcomes = transferor
            .push(vec![needed(1, "doc", first.clone()), needed(2, "doc", second.clone())])
            .await;
        let by_rev: HashMap<RevId, TransferStatus> = outcomes
            .iter()
            .map(|outcome| (outcome.item.rev_id.clone(), outcome.status.clone()))
            .collect();
        assert!(matches!(
            &by_rev[&first],
            TransferStatus::Failed(ReplicationError::DocumentRejected { .. })
        ));
        assert_eq!(by_rev[&second], TransferStatus::Transferred);
    }

    #[test]
    fn attachment_parts_are_matched_by_name_only() {
        let disposition = |value: &str| {
            Part::new(
                vec![("Content-Disposition".into(), value.into())],
                value.as_bytes().to_vec(),
            )
        };
        let mut parts = vec![
            disposition("attachment; filename=\"a.txt\""),
            disposition("form-data; name=\"b.txt\""),
        ];
        assert!(take_part(&mut parts, "c.txt").is_none());
        assert_eq!(parts.len(), 2);
        let b = take_part(&mut parts, "b.txt").unwrap();
        assert_eq!(b.body, b"form-data; name=\"b.txt\"");
        let a = take_part(&mut parts, "a.txt").unwrap();
        assert_eq!(a.body, b"attachment; filename=\"a.txt\"");
        assert!(take_part(&mut parts, "a.txt").is_none());

        let mut unnamed = vec![Part::new(Vec::new(), vec![1])];
        assert!(take_part(&mut unnamed, "a.txt").is_none());
    }

    #[tokio::test]
    async fn follows_attachment_without_matching_part_is_an_error() {
        let (mock, _store, transferor) = setup(limits());
        let mut writer = MultipartWriter::with_boundary("related", "inner");
        writer
            .add_json(&body(json!({
                "_id": "doc", "_rev": "1-a",
                "_attachments": {"pic.png": {"content_type": "image/png", "revpos": 1, "follows": true, "length": 3}}
            })))
            .unwrap();
        writer.add_attachment("other.png", Some("image/png"), vec![1, 2, 3]);
        let response = HttpResponse::new(200)
            .with_header("Content-Type", writer.content_type())
            .with_body(writer.finish());
        mock.set_sticky(HttpMethod::Get, "/doc?rev=1-a", MockReply::Respond(response));

        let outcomes = transferor.pull(vec![needed(1, "doc", RevId::new(1, "a"))], false).await;
        assert!(!matches!(&outcomes[0].status, FetchStatus::Fetched(_)));
    }

    #[tokio::test]
    async fn whole_request_failure_aborts_batch() {
        let (mock, store, transferor) = setup(limits());
        let rev = store.put("doc1", body(json!({}))).unwrap();
        mock.set_sticky(HttpMethod::Post, "/_bulk_docs", MockReply::json(503, json!({})));
        let outcomes = transferor.push(vec![needed(1, "doc1", rev)]).await;
        assert!(matches!(&outcomes[0].status, TransferStatus::Aborted(error) if error.is_retryable()));
    }

    #[tokio::test]
    async fn large_uploads_are_split_and_compressed() {
        let limits = TransferLimits {
            gzip_threshold: 64,
            max_bulk_request_bytes: 200,
            ..limits()
        };
        let (mock, store, transferor) = setup(limits);
        mock.set_sticky(HttpMethod::Post, "/_bulk_docs", MockReply::json(201, json!([])));
        let filler = "x".repeat(120);
        let mut batch = Vec::new();
        for i in 0..3u64 {
            let rev = store.put(&format!("doc{i}"), body(json!({"filler": filler}))).unwrap();
            batch.push(needed(i, &format!("doc{i}"), rev));
        }

        let outcomes = transferor.push(batch).await;
        assert!(outcomes.iter().all(|o| o.status == TransferStatus::Transferred));
        let requests = mock.requests_matching(HttpMethod::Post, "/_bulk_docs");
        assert_eq!(requests.len(), 3);
        for request in requests {
            assert_eq!(request.header("Content-Encoding"), Some("gzip"));
            let sent: Value = request.body_json().unwrap();
            assert_eq!(sent["docs"].as_array().unwrap().len(), 1);
        }
    }

    #[tokio::test]
    async fn attachments_go_multipart() {
        let (mock, store, transferor) = setup(limits());
        let rev = store.attach("doc", "a.txt", "text/plain", b"hello").unwrap();
        mock.set_sticky(HttpMethod::Put, "/doc?new_edits=false", MockReply::json(201, json!({"ok": true})));

        let outcomes = transferor.push(vec![needed(1, "doc", rev)]).await;
        assert_eq!(outcomes[0].status, TransferStatus::Transferred);

        let request = &mock.requests_matching(HttpMethod::Put, "/doc?new_edits=false")[0];
        let content_type = request.header("Content-Type").unwrap();
        assert!(content_type.starts_with("multipart/related"));
        let boundary = boundary_from_content_type(content_type).unwrap();
        let parts = parse_multipart(request.body.as_ref().unwrap(), &boundary).unwrap();
        assert_eq!(parts.len(), 2);
        let document = parts[0].json_object().unwrap();
        assert_eq!(document["_attachments"]["a.txt"]["follows"], true);
        assert_eq!(parts[1].body, b"hello");
        assert_eq!(mock.count(HttpMethod::Post, "/_bulk_docs"), 0);
    }

    #[tokio::test]
    async fn unsupported_multipart_falls_back_to_inline() {
        let (mock, store, transferor) = setup(limits());
        let rev = store.attach("doc", "a.txt", "text/plain", b"hello").unwrap();
        mock.enqueue(HttpMethod::Put, "/doc?new_edits=false", MockReply::json(415, json!({})));
        mock.enqueue(HttpMethod::Put, "/doc?new_edits=false", MockReply::json(201, json!({"ok": true})));

        let outcomes = transferor.push(vec![needed(1, "doc", rev)]).await;
        assert_eq!(outcomes[0].status, TransferStatus::Transferred);
        assert!(!transferor.multipart_supported());

        let requests = mock.requests_matching(HttpMethod::Put, "/doc?new_edits=false");
        assert_eq!(requests.len(), 2);
        let inline: Value = requests[1].body_json().unwrap();
        let meta = &inline["_attachments"]["a.txt"];
        assert_eq!(meta["data"], "aGVsbG8=");
        assert!(meta.get("follows").is_none());
    }

    #[tokio::test]
    async fn ancestor_attachments_become_stubs() {
        let (mock, store, transferor) = setup(limits());
        store.attach("doc", "a.txt", "text/plain", b"hello").unwrap();
        let rev = store.put("doc", {
            let mut current = store.get("doc").unwrap().body;
            current.insert("n".into(), json!(2));
            current
        })
        .unwrap();
        mock.set_sticky(HttpMethod::Post, "/_bulk_docs", MockReply::json(201, json!([])));

        let mut revision = needed(1, "doc", rev);
        revision.possible_ancestors = vec![RevId::new(1, "whatever")];
        let outcomes = transferor.push(vec![revision]).await;
        assert_eq!(outcomes[0].status, TransferStatus::Transferred);

        let sent: Value = mock.requests_matching(HttpMethod::Post, "/_bulk_docs")[0]
            .body_json()
            .unwrap();
        assert_eq!(sent["docs"][0]["_attachments"]["a.txt"]["stub"], true);
        assert_eq!(mock.count(HttpMethod::Put, "/doc"), 0);
    }

    fn multipart_response(parts: Vec<(Vec<(String, String)>, Vec<u8>)>) -> HttpResponse {
        let mut writer = MultipartWriter::with_boundary("mixed", "outer");
        for (headers, body) in parts {
            writer.add_part(headers, body);
        }
        HttpResponse::new(200)
            .with_header("Content-Type", writer.content_type())
            .with_body(writer.finish())
    }

    fn json_part(value: Value) -> (Vec<(String, String)>, Vec<u8>) {
        (
            vec![("Content-Type".into(), "application/json".into())],
            value.to_string().into_bytes(),
        )
    }

    #[tokio::test]
    async fn bulk_get_with_missing_document() {
        let (mock, store, transferor) = setup(limits());
        let response = multipart_response(vec![
            json_part(json!({"_id": "doc1", "_rev": "1-a", "v": 1, "_revisions": {"start": 1, "ids": ["a"]}})),
            json_part(json!({"id": "doc2", "rev": "1-b", "error": "not_found", "reason": "missing", "status": 404})),
            json_part(json!({"_id": "doc3", "_rev": "2-c", "v": 3, "_revisions": {"start": 2, "ids": ["c", "z"]}})),
        ]);
        mock.set_sticky(HttpMethod::Post, "/_bulk_get", MockReply::Respond(response));
        store
            .insert_revision(Revision::new("doc3", RevId::new(1, "z")), vec![], "r")
            .unwrap();

        let outcomes = transferor
            .pull(
                vec![
                    needed(1, "doc1", RevId::new(1, "a")),
                    needed(2, "doc2", RevId::new(1, "b")),
                    needed(3, "doc3", RevId::new(2, "c")),
                ],
                true,
            )
            .await;

        assert!(matches!(&outcomes[0].status, FetchStatus::Fetched(f) if f.revision.body["v"] == 1));
        assert!(matches!(
            &outcomes[1].status,
            FetchStatus::Failed(ReplicationError::DocumentMissingOnPeer { .. })
        ));
        match &outcomes[2].status {
            FetchStatus::Fetched(fetched) => {
                assert_eq!(fetched.history, vec![RevId::new(2, "c"), RevId::new(1, "z")]);
            }
            other => unreachable!("unexpected {other:?}"),
        }

        let sent: Value = mock.requests()[0].body_json().unwrap();
        assert_eq!(sent["docs"][2]["atts_since"], json!(["1-z"]));
        assert!(sent["docs"][0].get("atts_since").is_none());
        assert!(mock.requests()[0].url.ends_with("/_bulk_get?revs=true&attachments=true"));
    }

    #[tokio::test]
    async fn bulk_get_json_results_and_attachments() {
        let (mock, store, transferor) = setup(limits());
        mock.set_sticky(
            HttpMethod::Post,
            "/_bulk_get",
            MockReply::json(
                200,
                json!({"results": [
                    {"id": "doc1", "docs": [{"ok": {
                        "_id": "doc1", "_rev": "1-a",
                        "_attachments": {"a.txt": {"content_type": "text/plain", "revpos": 1, "data": "aGVsbG8="}}
                    }}]},
                    {"id": "doc2", "docs": [{"error": {"id": "doc2", "rev": "1-b", "error": "forbidden", "reason": "no access"}}]}
                ]}),
            ),
        );

        let outcomes = transferor
            .pull(
                vec![needed(1, "doc1", RevId::new(1, "a")), needed(2, "doc2", RevId::new(1, "b"))],
                true,
            )
            .await;

        match &outcomes[0].status {
            FetchStatus::Fetched(fetched) => {
                let meta = &fetched.revision.attachments().unwrap()["a.txt"];
                assert_eq!(meta["stub"], true);
                assert_eq!(meta["length"], 5);
                let digest = meta["digest"].as_str().unwrap();
                assert_eq!(store.read_blob(digest).unwrap().unwrap(), b"hello");
            }
            other => unreachable!("unexpected {other:?}"),
        }
        assert!(matches!(
            &outcomes[1].status,
            FetchStatus::Failed(ReplicationError::DocumentRejected { .. })
        ));
    }

    #[tokio::test]
    async fn missing_bulk_get_falls_back_to_single_gets() {
        let (mock, _store, transferor) = setup(limits());
        mock.set_sticky(HttpMethod::Post, "/_bulk_get", MockReply::not_found());
        mock.set_sticky(
            HttpMethod::Get,
            "/doc%201?rev=1-a",
            MockReply::json(200, json!({"_id": "doc 1", "_rev": "1-a", "_revisions": {"start": 1, "ids": ["a"]}})),
        );

        let items = || vec![needed(1, "doc 1", RevId::new(1, "a")), needed(2, "doc2", RevId::new(1, "b"))];
        let outcomes = transferor.pull(items(), true).await;
        let by_doc: HashMap<String, FetchStatus> = outcomes
            .into_iter()
            .map(|outcome| (outcome.item.doc_id, outcome.status))
            .collect();
        assert!(matches!(by_doc["doc 1"], FetchStatus::Fetched(_)));
        assert!(matches!(
            by_doc["doc2"],
            FetchStatus::Failed(ReplicationError::DocumentMissingOnPeer { .. })
        ));

        // The fallback sticks for later batches.
        transferor.pull(items(), true).await;
        assert_eq!(mock.count(HttpMethod::Post, "/_bulk_get"), 1);

        let get = &mock.requests_matching(HttpMethod::Get, "/doc%201")[0];
        assert!(get.url.ends_with("/doc%201?rev=1-a&revs=true&attachments=true"));
        assert_eq!(get.header("Accept"), Some("multipart/related, application/json"));
    }

    #[tokio::test]
    async fn single_get_multipart_response() {
        let (mock, store, transferor) = setup(limits());
        let mut writer = MultipartWriter::with_boundary("related", "inner");
        writer
            .add_json(&body(json!({
                "_id": "doc", "_rev": "2-b",
                "_revisions": {"start": 2, "ids": ["b", "a"]},
                "_attachments": {"pic.png": {"content_type": "image/png", "revpos": 2, "follows": true, "length": 3}}
            })))
            .unwrap();
        writer.add_attachment("pic.png", Some("image/png"), vec![1, 2, 3]);
        let response = HttpResponse::new(200)
            .with_header("Content-Type", writer.content_type())
            .with_body(writer.finish());
        mock.set_sticky(HttpMethod::Get, "/doc?rev=2-b", MockReply::Respond(response));
        store
            .insert_revision(Revision::new("doc", RevId::new(1, "a")), vec![], "r")
            .unwrap();

        let outcomes = transferor.pull(vec![needed(1, "doc", RevId::new(2, "b"))], false).await;
        match &outcomes[0].status {
            FetchStatus::Fetched(fetched) => {
                assert_eq!(fetched.history.len(), 2);
                let meta = &fetched.revision.attachments().unwrap()["pic.png"];
                assert!(meta.get("follows").is_none());
                let digest = meta["digest"].as_str().unwrap();
                assert_eq!(store.read_blob(digest).unwrap().unwrap(), vec![1, 2, 3]);
            }
            other => unreachable!("unexpected {other:?}"),
        }
        let get = &mock.requests()[0];
        assert!(get.url.contains("&atts_since=%5B%221-a%22%5D"));
    }
}
