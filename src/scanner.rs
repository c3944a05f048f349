//! Background scan pipeline: the deeper half of content validation plus
//! quota admission. Safe under retries and duplicate deliveries because the
//! first action is a state check and every write is a compare-and-set.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use serde_json::json;
use uuid::Uuid;

use crate::audit::{self, AuditLog, RequestMeta};
use crate::meta_store::{FileObject, FileState, MetaStore};
use crate::policy::{self, PolicyInput, DEFAULT_MAX_SIZE_BYTES};
use crate::queue::{RedisScanQueue, ScanJob, SCAN_TIMEOUT_SECS};
use crate::quota::{QuotaError, QuotaService};
use crate::s3_client::BlobStore;

const SCAN_CHUNK_SIZE: usize = 1024 * 1024;
const SNIFF_SAMPLE_END: u64 = 16 * 1024 - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// The row vanished; nothing to do.
    Missing,
    /// The row is no longer SCANNING (duplicate delivery or lost race).
    Skip,
    Active,
    Quarantined,
}

impl ScanOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            ScanOutcome::Missing => "missing",
            ScanOutcome::Skip => "skip",
            ScanOutcome::Active => "active",
            ScanOutcome::Quarantined => "quarantined",
        }
    }
}

#[derive(Clone)]
pub struct ScanWorker {
    store: Arc<dyn MetaStore>,
    blob: Arc<dyn BlobStore>,
    quota: QuotaService,
    audit: AuditLog,
}

impl ScanWorker {
    pub fn new(store: Arc<dyn MetaStore>, blob: Arc<dyn BlobStore>) -> Self {
        let quota = QuotaService::new(Arc::clone(&store));
        let audit = AuditLog::new(Arc::clone(&store));
        Self {
            store,
            blob,
            quota,
            audit,
        }
    }

    /// Scan one object. Unexpected errors are audited as SCAN_FAIL and
    /// bubbled up so the queue retries per policy.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn scan_file(&self, file_id: Uuid) -> anyhow::Result<ScanOutcome> {
        match self.scan_inner(file_id).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.audit
                    .record(
                        None,
                        audit::SCAN_FAIL,
                        Some(file_id),
                        &RequestMeta::default(),
                        Some(json!({ "error": err.to_string() })),
                    )
                    .await;
                Err(err)
            }
        }
    }

    async fn scan_inner(&self, file_id: Uuid) -> anyhow::Result<ScanOutcome> {
        let Some(file) = self.store.get_file(file_id).await? else {
            return Ok(ScanOutcome::Missing);
        };
        if file.state != FileState::Scanning {
            return Ok(ScanOutcome::Skip);
        }

        // `complete` already measured and sniffed, but state may have
        // drifted since; re-derive everything from the store of record.
        let head = self
            .blob
            .head(&file.bucket, &file.object_key)
            .await
            .map_err(|err| anyhow::anyhow!("blob HEAD failed during scan: {err}"))?;
        let size_bytes = head.content_length;

        let sample = self
            .blob
            .get_range(&file.bucket, &file.object_key, 0, SNIFF_SAMPLE_END)
            .await
            .map_err(|err| anyhow::anyhow!("blob range read failed during scan: {err}"))?;
        let sniffed = sample.as_deref().and_then(policy::sniff_mime);

        let validation = policy::validate_upload(&PolicyInput {
            original_filename: &file.original_filename,
            declared_content_type: &file.declared_content_type,
            sniffed_content_type: sniffed.as_deref(),
            size_bytes: Some(size_bytes),
            sample: sample.as_deref(),
            max_size_bytes: Some(DEFAULT_MAX_SIZE_BYTES),
        });
        if let Err(violation) = validation {
            let mut details = violation.details;
            if let Some(object) = details.as_object_mut() {
                object.insert("reason".to_owned(), violation.reason.as_str().into());
                object.insert("sniffed".to_owned(), json!(sniffed));
                object.insert("declared".to_owned(), json!(file.declared_content_type));
            }
            return self.quarantine(&file, size_bytes, sniffed, details).await;
        }

        if let Some(required) = required_office_entries(&file.original_filename) {
            if !self.office_container_valid(&file, required).await? {
                let ext = policy::extension_of(&file.original_filename);
                return self
                    .quarantine(
                        &file,
                        size_bytes,
                        sniffed,
                        json!({ "reason": "office_zip_invalid", "ext": ext }),
                    )
                    .await;
            }
        }

        match self.quota.commit_activation(file.owner_id, size_bytes).await {
            Ok(()) => {}
            Err(QuotaError::Exceeded) => {
                return self
                    .quarantine(&file, size_bytes, sniffed, json!({ "reason": "quota_exceeded" }))
                    .await;
            }
            Err(QuotaError::Store(err)) => return Err(err.into()),
        }

        let applied = self
            .store
            .transition_from_scan(file.id, FileState::Active, Some(size_bytes), sniffed.clone())
            .await?;
        if !applied {
            // Someone else finished the row first; give the admission back.
            self.quota.release(file.owner_id, size_bytes).await?;
            return Ok(ScanOutcome::Skip);
        }

        self.audit
            .record(
                Some(file.owner_id),
                audit::SCAN_PASS,
                Some(file.id),
                &RequestMeta::default(),
                Some(json!({ "sniffed": sniffed })),
            )
            .await;
        Ok(ScanOutcome::Active)
    }

    async fn quarantine(
        &self,
        file: &FileObject,
        size_bytes: i64,
        sniffed: Option<String>,
        details: serde_json::Value,
    ) -> anyhow::Result<ScanOutcome> {
        let applied = self
            .store
            .transition_from_scan(file.id, FileState::Quarantined, Some(size_bytes), sniffed)
            .await?;
        if !applied {
            return Ok(ScanOutcome::Skip);
        }
        self.audit
            .record(
                Some(file.owner_id),
                audit::SCAN_QUARANTINED,
                Some(file.id),
                &RequestMeta::default(),
                Some(details),
            )
            .await;
        Ok(ScanOutcome::Quarantined)
    }

    /// Office OpenXML objects must be real ZIP archives carrying the content
    /// manifest plus the type-specific document part. The whole object is
    /// buffered, bounded by the global size cap.
    async fn office_container_valid(&self, file: &FileObject, required: [&'static str; 2]) -> anyhow::Result<bool> {
        let mut stream = self
            .blob
            .iter_object(&file.bucket, &file.object_key, SCAN_CHUNK_SIZE)
            .await
            .map_err(|err| anyhow::anyhow!("blob read failed during scan: {err}"))?;

        let mut payload: Vec<u8> = Vec::new();
        while let Some(chunk) = stream
            .try_next()
            .await
            .map_err(|err| anyhow::anyhow!("blob read failed during scan: {err}"))?
        {
            payload.extend_from_slice(&chunk);
            if payload.len() as i64 > DEFAULT_MAX_SIZE_BYTES {
                return Ok(false);
            }
        }

        let valid = tokio::task::spawn_blocking(move || match zip::ZipArchive::new(Cursor::new(payload)) {
            Ok(archive) => {
                let names: Vec<&str> = archive.file_names().collect();
                required.iter().all(|entry| names.contains(entry))
            }
            Err(_) => false,
        })
        .await?;
        Ok(valid)
    }

    /// Pull loop over the durable queue. Multiple workers may run this; the
    /// queue hands each job to exactly one of them.
    pub async fn run(&self, queue: RedisScanQueue) {
        tracing::info!("scan worker started");
        loop {
            if let Err(err) = queue.promote_due().await {
                tracing::warn!(error = %err, "failed to promote delayed scan jobs");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }

            let job = match queue.dequeue(5).await {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(error = %err, "scan queue dequeue failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            self.process(&queue, job).await;
        }
    }

    async fn process(&self, queue: &RedisScanQueue, job: ScanJob) {
        let outcome = tokio::time::timeout(Duration::from_secs(SCAN_TIMEOUT_SECS), self.scan_file(job.file_id)).await;
        match outcome {
            Ok(Ok(outcome)) => {
                tracing::info!(file_id = %job.file_id, attempt = job.attempt, outcome = outcome.as_str(), "scan finished");
            }
            Ok(Err(err)) => {
                self.retry_or_drop(queue, &job, &format!("{err:#}")).await;
            }
            Err(_) => {
                self.retry_or_drop(queue, &job, "scan timed out").await;
            }
        }
    }

    async fn retry_or_drop(&self, queue: &RedisScanQueue, job: &ScanJob, cause: &str) {
        match job.next_backoff_secs() {
            Some(delay) => {
                tracing::warn!(file_id = %job.file_id, attempt = job.attempt, delay, cause, "scan failed, scheduling retry");
                if let Err(err) = queue.schedule_retry(job, delay).await {
                    tracing::error!(file_id = %job.file_id, error = %err, "failed to schedule scan retry");
                }
            }
            None => {
                tracing::error!(file_id = %job.file_id, attempt = job.attempt, cause, "scan failed and retries are exhausted");
            }
        }
    }
}

fn required_office_entries(filename: &str) -> Option<[&'static str; 2]> {
    match policy::extension_of(filename)?.as_str() {
        "docx" => Some(["[Content_Types].xml", "word/document.xml"]),
        "xlsx" => Some(["[Content_Types].xml", "xl/workbook.xml"]),
        "pptx" => Some(["[Content_Types].xml", "ppt/presentation.xml"]),
        _ => None,
    }
}
