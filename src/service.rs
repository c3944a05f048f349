//! Upload coordinator: drives the two-phase init/complete protocol and mints
//! download URLs. All state changes go through compare-and-set writes so the
//! row serializes concurrent callers.

use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde_json::json;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::audit::{self, AuditLog, RequestMeta};
use crate::config::Settings;
use crate::error::AppError;
use crate::meta_store::{CompleteTransition, FileObject, FileState, MetaStore, User};
use crate::policy::{self, PolicyInput, DEFAULT_MAX_SIZE_BYTES, DEMO_MAX_SIZE_BYTES};
use crate::queue::ScanQueue;
use crate::quota::QuotaService;
use crate::s3_client::{BlobStore, BlobStoreError};

const CHECKSUM_CHUNK_SIZE: usize = 1024 * 1024;
/// Inclusive end offset of the sniff sample range request (16 KiB).
const SNIFF_SAMPLE_END: u64 = 16 * 1024 - 1;

/// The identity a request acts as: a real user row, or a signed demo session.
#[derive(Debug, Clone)]
pub enum Caller {
    User(User),
    Demo(Uuid),
}

impl Caller {
    fn is_admin(&self) -> bool {
        matches!(self, Caller::User(user) if user.is_admin())
    }
}

#[derive(Debug, Clone)]
pub struct InitUpload {
    pub original_filename: String,
    pub content_type: String,
    pub checksum_sha256: String,
    pub size_bytes: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct InitGrant {
    pub file_id: Uuid,
    pub object_key: String,
    pub upload_url: String,
    pub expires_in: u64,
    pub headers_to_include: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct CompleteOutcome {
    pub state: FileState,
    pub sniffed_content_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DownloadGrant {
    pub download_url: String,
    pub expires_in: u64,
}

#[derive(Clone)]
pub struct UploadCoordinator {
    settings: Arc<Settings>,
    store: Arc<dyn MetaStore>,
    blob: Arc<dyn BlobStore>,
    queue: Arc<dyn ScanQueue>,
    quota: QuotaService,
    audit: AuditLog,
}

impl UploadCoordinator {
    pub fn new(
        settings: Arc<Settings>,
        store: Arc<dyn MetaStore>,
        blob: Arc<dyn BlobStore>,
        queue: Arc<dyn ScanQueue>,
    ) -> Self {
        let quota = QuotaService::new(Arc::clone(&store));
        let audit = AuditLog::new(Arc::clone(&store));
        Self {
            settings,
            store,
            blob,
            queue,
            quota,
            audit,
        }
    }

    /// Reserve a FileObject row and hand back a presigned PUT URL.
    #[tracing::instrument(level = "info", skip(self, caller, req, meta))]
    pub async fn init(&self, caller: &Caller, req: &InitUpload, meta: &RequestMeta) -> Result<InitGrant, AppError> {
        let filename = req.original_filename.trim();
        if filename.is_empty() {
            return Err(AppError::Validation("original_filename must not be empty".to_owned()));
        }
        let checksum = req.checksum_sha256.trim().to_ascii_lowercase();

        let (owner_id, demo_id) = match caller {
            Caller::User(user) => {
                self.quota.enforce_init(user.id).await?;
                (user.id, None)
            }
            Caller::Demo(demo_id) => {
                if req.size_bytes.is_some_and(|size| size > DEMO_MAX_SIZE_BYTES) {
                    return Err(AppError::Validation("demo uploads are limited to 10 MiB".to_owned()));
                }
                let demo_user = self.store.ensure_demo_user(*demo_id).await?;
                (demo_user.id, Some(*demo_id))
            }
        };

        let now = OffsetDateTime::now_utc();
        let ttl = Duration::from_secs(self.settings.upload_presign_ttl_seconds);
        let file = FileObject {
            id: Uuid::new_v4(),
            owner_id,
            demo_id,
            bucket: self.settings.s3_bucket.clone(),
            object_key: format!("{}_{}", Uuid::new_v4(), filename.replace(' ', "_")),
            original_filename: filename.to_owned(),
            declared_content_type: req.content_type.clone(),
            checksum_sha256: checksum.clone(),
            checksum_verified: false,
            size_bytes: None,
            sniffed_content_type: None,
            state: FileState::Initiated,
            upload_expires_at: now + ttl,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_file(&file).await?;

        let metadata = vec![
            ("checksum-sha256".to_owned(), checksum),
            ("owner-id".to_owned(), owner_id.to_string()),
        ];
        let presigned = self
            .blob
            .presign_put(&file.bucket, &file.object_key, &req.content_type, &metadata, ttl)
            .await?;

        self.audit
            .record(Some(owner_id), audit::FILE_INIT, Some(file.id), meta, None)
            .await;

        Ok(InitGrant {
            file_id: file.id,
            object_key: file.object_key,
            upload_url: presigned.url,
            expires_in: ttl.as_secs(),
            headers_to_include: presigned.headers,
        })
    }

    /// Finalize an upload: verify the bytes landed and match the declared
    /// checksum, sniff and validate the content, then hand off to the scan
    /// queue or park the row in a terminal state.
    #[tracing::instrument(level = "info", skip(self, caller, meta))]
    pub async fn complete(&self, caller: &Caller, file_id: Uuid, meta: &RequestMeta) -> Result<CompleteOutcome, AppError> {
        let file = self.store.get_file(file_id).await?.ok_or(AppError::NotFound)?;
        authorize(caller, &file)?;
        if file.state != FileState::Initiated {
            return Err(AppError::BadState);
        }
        if OffsetDateTime::now_utc() > file.upload_expires_at {
            return Err(AppError::Expired);
        }
        let actor = actor_id(caller, &file);

        let head = match self.blob.head(&file.bucket, &file.object_key).await {
            Ok(head) => head,
            Err(BlobStoreError::NotFound) => return Err(AppError::ObjectNotUploaded),
            Err(err) => return Err(err.into()),
        };
        let size_bytes = head.content_length;

        if file.demo_id.is_some() && size_bytes > DEMO_MAX_SIZE_BYTES {
            self.settle(
                &file,
                CompleteTransition {
                    state: FileState::Quarantined,
                    checksum_verified: false,
                    size_bytes,
                    sniffed_content_type: None,
                },
                audit::UPLOAD_QUARANTINED,
                actor,
                meta,
                Some(json!({
                    "reason": "demo_size_limit",
                    "size": size_bytes,
                    "max": DEMO_MAX_SIZE_BYTES,
                })),
            )
            .await?;
            return Ok(CompleteOutcome {
                state: FileState::Quarantined,
                sniffed_content_type: None,
            });
        }

        // The checksum pass streams up to the full object; no transaction is
        // held open while it runs.
        let computed = self.stream_sha256(&file).await?;
        if computed != file.checksum_sha256 {
            self.settle(
                &file,
                CompleteTransition {
                    state: FileState::Rejected,
                    checksum_verified: false,
                    size_bytes,
                    sniffed_content_type: None,
                },
                audit::UPLOAD_REJECTED,
                actor,
                meta,
                Some(json!({
                    "reason": "checksum_mismatch",
                    "expected": file.checksum_sha256,
                    "got": computed,
                })),
            )
            .await?;
            return Ok(CompleteOutcome {
                state: FileState::Rejected,
                sniffed_content_type: None,
            });
        }

        let sample = self
            .blob
            .get_range(&file.bucket, &file.object_key, 0, SNIFF_SAMPLE_END)
            .await?;
        let sniffed = sample.as_deref().and_then(policy::sniff_mime);

        let max_size = if file.demo_id.is_some() {
            DEMO_MAX_SIZE_BYTES
        } else {
            DEFAULT_MAX_SIZE_BYTES
        };
        let validation = policy::validate_upload(&PolicyInput {
            original_filename: &file.original_filename,
            declared_content_type: &file.declared_content_type,
            sniffed_content_type: sniffed.as_deref(),
            size_bytes: Some(size_bytes),
            sample: sample.as_deref(),
            max_size_bytes: Some(max_size),
        });
        if let Err(violation) = validation {
            let mut details = violation.details;
            if let Some(object) = details.as_object_mut() {
                object.insert("reason".to_owned(), violation.reason.as_str().into());
            }
            self.settle(
                &file,
                CompleteTransition {
                    state: FileState::Quarantined,
                    checksum_verified: true,
                    size_bytes,
                    sniffed_content_type: sniffed.clone(),
                },
                audit::UPLOAD_QUARANTINED,
                actor,
                meta,
                Some(details),
            )
            .await?;
            return Ok(CompleteOutcome {
                state: FileState::Quarantined,
                sniffed_content_type: sniffed,
            });
        }

        self.settle(
            &file,
            CompleteTransition {
                state: FileState::Scanning,
                checksum_verified: true,
                size_bytes,
                sniffed_content_type: sniffed.clone(),
            },
            audit::UPLOAD_ENQUEUED,
            actor,
            meta,
            Some(json!({
                "sniffed": sniffed,
                "declared": file.declared_content_type,
            })),
        )
        .await?;
        // Enqueue only after the SCANNING commit; the worker re-checks state,
        // so duplicate delivery is safe but a premature one is not.
        self.queue.enqueue(file.id).await?;

        Ok(CompleteOutcome {
            state: FileState::Scanning,
            sniffed_content_type: sniffed,
        })
    }

    /// Presigned GET, gated on ACTIVE for everyone but admins.
    #[tracing::instrument(level = "info", skip(self, caller, meta))]
    pub async fn download_url(&self, caller: &Caller, file_id: Uuid, meta: &RequestMeta) -> Result<DownloadGrant, AppError> {
        let file = self.store.get_file(file_id).await?.ok_or(AppError::NotFound)?;
        authorize(caller, &file)?;
        if file.state != FileState::Active && !caller.is_admin() {
            return Err(AppError::NotDownloadable);
        }

        let ttl = Duration::from_secs(self.settings.download_presign_ttl_seconds);
        let disposition = attachment_disposition(&file.original_filename);
        let url = self
            .blob
            .presign_get(&file.bucket, &file.object_key, ttl, Some(&disposition), None)
            .await?;

        self.audit
            .record(actor_id(caller, &file), audit::DOWNLOAD_URL_ISSUED, Some(file.id), meta, None)
            .await;

        Ok(DownloadGrant {
            download_url: url,
            expires_in: ttl.as_secs(),
        })
    }

    pub async fn get_file(&self, caller: &Caller, file_id: Uuid) -> Result<FileObject, AppError> {
        let file = self.store.get_file(file_id).await?.ok_or(AppError::NotFound)?;
        authorize(caller, &file)?;
        Ok(file)
    }

    pub async fn list_files(&self, caller: &Caller) -> Result<Vec<FileObject>, AppError> {
        let owner_id = match caller {
            Caller::User(user) => user.id,
            // Demo owner ids equal the demo session id; a session that never
            // uploaded simply owns nothing.
            Caller::Demo(demo_id) => *demo_id,
        };
        Ok(self.store.list_files(owner_id).await?)
    }

    async fn stream_sha256(&self, file: &FileObject) -> Result<String, AppError> {
        let mut stream = match self
            .blob
            .iter_object(&file.bucket, &file.object_key, CHECKSUM_CHUNK_SIZE)
            .await
        {
            Ok(stream) => stream,
            Err(BlobStoreError::NotFound) => return Err(AppError::ObjectNotUploaded),
            Err(err) => return Err(err.into()),
        };

        let mut hasher = Sha256::new();
        while let Some(chunk) = stream.try_next().await.map_err(AppError::from)? {
            hasher.update(&chunk);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    /// Commit one INITIATED -> next transition and its audit event. A missed
    /// CAS means another `complete` call won the race.
    async fn settle(
        &self,
        file: &FileObject,
        update: CompleteTransition,
        action: &str,
        actor: Option<Uuid>,
        meta: &RequestMeta,
        details: Option<serde_json::Value>,
    ) -> Result<(), AppError> {
        let applied = self.store.transition_from_complete(file.id, &update).await?;
        if !applied {
            return Err(AppError::BadState);
        }
        self.audit.record(actor, action, Some(file.id), meta, details).await;
        Ok(())
    }
}

fn authorize(caller: &Caller, file: &FileObject) -> Result<(), AppError> {
    match caller {
        Caller::User(user) if user.is_admin() => Ok(()),
        Caller::User(user) if file.owner_id == user.id => Ok(()),
        Caller::Demo(demo_id) if file.demo_id == Some(*demo_id) => Ok(()),
        _ => Err(AppError::Forbidden),
    }
}

fn actor_id(caller: &Caller, file: &FileObject) -> Option<Uuid> {
    match caller {
        Caller::User(user) => Some(user.id),
        Caller::Demo(_) => Some(file.owner_id),
    }
}

/// RFC 5987 attr-char, i.e. everything that survives unencoded in
/// `filename*`.
const FILENAME_STAR_KEEP: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'.')
    .remove(b'-')
    .remove(b'_')
    .remove(b'~')
    .remove(b'!');

/// Content-Disposition safe against header injection: the plain `filename`
/// falls back to printable ASCII with quotes, backslashes, path separators
/// and CR/LF stripped; `filename*` carries the UTF-8 original
/// percent-encoded.
pub fn attachment_disposition(original: &str) -> String {
    let cleaned: String = original
        .chars()
        .filter(|c| !c.is_control() && !matches!(c, '/' | '\\' | '"'))
        .collect();

    let ascii: String = cleaned.chars().filter(char::is_ascii).collect();
    let ascii = if ascii.trim().is_empty() { "download".to_owned() } else { ascii };

    let encoded = utf8_percent_encode(&cleaned, FILENAME_STAR_KEEP);
    format!("attachment; filename=\"{ascii}\"; filename*=UTF-8''{encoded}")
}
