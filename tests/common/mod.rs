//! In-memory substitutes for the service's collaborators, mirroring the
//! contracts the production implementations keep (CAS transitions, per-owner
//! quota serialization, queue dedup is irrelevant here).

// Each integration-test binary includes this module and uses a subset of it.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use uuid::Uuid;

use filegate::audit::RequestMeta;
use filegate::config::Settings;
use filegate::meta_store::{
    AuditEntry, CompleteTransition, FileObject, FileState, MetaStore, MetaStoreError, UsageCounter, User, UserRole,
};
use filegate::queue::{QueueError, ScanQueue};
use filegate::rate_limit::{RateLimitError, RateLimiter, RouteLimit, Scope};
use filegate::s3_client::{BlobStore, BlobStoreError, ChunkStream, HeadInfo, PresignedUpload};
use filegate::scanner::ScanWorker;
use filegate::service::UploadCoordinator;

pub const TEST_BUCKET: &str = "test-bucket";

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn test_settings() -> Settings {
    Settings {
        env: "test".into(),
        app_debug: false,
        database_url: String::new(),
        redis_url: String::new(),
        s3_endpoint: "http://blob.internal.test".into(),
        s3_public_endpoint: Some("http://blob.public.test".into()),
        s3_access_key_id: "test-key".into(),
        s3_secret_access_key: "test-secret".into(),
        s3_bucket: TEST_BUCKET.into(),
        s3_region: "us-east-1".into(),
        jwt_secret: "test-signing-secret".into(),
        jwt_algorithm: "HS256".into(),
        jwt_expires_seconds: 3600,
        upload_presign_ttl_seconds: 900,
        download_presign_ttl_seconds: 300,
    }
}

// ---- metadata store ----

#[derive(Default)]
pub struct MemStore {
    users: Mutex<HashMap<Uuid, User>>,
    files: Mutex<HashMap<Uuid, FileObject>>,
    counters: Mutex<HashMap<Uuid, UsageCounter>>,
    pub audits: Mutex<Vec<AuditEntry>>,
}

impl MemStore {
    pub fn audit_actions(&self) -> Vec<String> {
        self.audits.lock().unwrap().iter().map(|e| e.action.clone()).collect()
    }

    pub fn last_audit_detail(&self, action: &str, key: &str) -> Option<serde_json::Value> {
        self.audits
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|e| e.action == action)
            .and_then(|e| e.details.as_ref())
            .and_then(|d| d.get(key).cloned())
    }

    pub fn seed_counter(&self, owner_id: Uuid, files_count: i64, bytes_stored: i64) {
        self.counters.lock().unwrap().insert(
            owner_id,
            UsageCounter {
                owner_id,
                files_count,
                bytes_stored,
                updated_at: OffsetDateTime::now_utc(),
            },
        );
    }

    pub fn counter(&self, owner_id: Uuid) -> Option<UsageCounter> {
        self.counters.lock().unwrap().get(&owner_id).cloned()
    }

    pub fn file(&self, id: Uuid) -> Option<FileObject> {
        self.files.lock().unwrap().get(&id).cloned()
    }

    pub fn set_upload_expires_at(&self, id: Uuid, at: OffsetDateTime) {
        if let Some(file) = self.files.lock().unwrap().get_mut(&id) {
            file.upload_expires_at = at;
        }
    }
}

#[async_trait::async_trait]
impl MetaStore for MemStore {
    async fn create_user(&self, user: &User) -> Result<(), MetaStoreError> {
        let mut users = self.users.lock().unwrap();
        if users.values().any(|u| u.email == user.email) {
            return Err(MetaStoreError::EmailTaken);
        }
        users.insert(user.id, user.clone());
        Ok(())
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<User>, MetaStoreError> {
        Ok(self.users.lock().unwrap().get(&id).cloned())
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, MetaStoreError> {
        Ok(self.users.lock().unwrap().values().find(|u| u.email == email).cloned())
    }

    async fn ensure_demo_user(&self, demo_id: Uuid) -> Result<User, MetaStoreError> {
        let mut users = self.users.lock().unwrap();
        let user = users.entry(demo_id).or_insert_with(|| User {
            id: demo_id,
            email: format!("demo-{demo_id}@demo.invalid"),
            password_hash: "!".into(),
            role: UserRole::User,
            created_at: OffsetDateTime::now_utc(),
        });
        Ok(user.clone())
    }

    async fn insert_file(&self, file: &FileObject) -> Result<(), MetaStoreError> {
        self.files.lock().unwrap().insert(file.id, file.clone());
        Ok(())
    }

    async fn get_file(&self, id: Uuid) -> Result<Option<FileObject>, MetaStoreError> {
        Ok(self.files.lock().unwrap().get(&id).cloned())
    }

    async fn list_files(&self, owner_id: Uuid) -> Result<Vec<FileObject>, MetaStoreError> {
        let mut files: Vec<FileObject> = self
            .files
            .lock()
            .unwrap()
            .values()
            .filter(|f| f.owner_id == owner_id)
            .cloned()
            .collect();
        files.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(files)
    }

    async fn transition_from_complete(&self, id: Uuid, update: &CompleteTransition) -> Result<bool, MetaStoreError> {
        if !FileState::Initiated.can_transition(update.state) {
            return Err(MetaStoreError::InvalidTransition {
                from: FileState::Initiated,
                to: update.state,
            });
        }
        let mut files = self.files.lock().unwrap();
        let Some(file) = files.get_mut(&id) else { return Ok(false) };
        if file.state != FileState::Initiated {
            return Ok(false);
        }
        file.state = update.state;
        file.checksum_verified = update.checksum_verified;
        file.size_bytes = Some(update.size_bytes);
        file.sniffed_content_type = update.sniffed_content_type.clone();
        file.updated_at = OffsetDateTime::now_utc();
        Ok(true)
    }

    async fn transition_from_scan(
        &self,
        id: Uuid,
        to: FileState,
        size_bytes: Option<i64>,
        sniffed_content_type: Option<String>,
    ) -> Result<bool, MetaStoreError> {
        if !FileState::Scanning.can_transition(to) {
            return Err(MetaStoreError::InvalidTransition {
                from: FileState::Scanning,
                to,
            });
        }
        let mut files = self.files.lock().unwrap();
        let Some(file) = files.get_mut(&id) else { return Ok(false) };
        if file.state != FileState::Scanning {
            return Ok(false);
        }
        file.state = to;
        if size_bytes.is_some() {
            file.size_bytes = size_bytes;
        }
        if sniffed_content_type.is_some() {
            file.sniffed_content_type = sniffed_content_type;
        }
        file.updated_at = OffsetDateTime::now_utc();
        Ok(true)
    }

    async fn usage_for_owner(&self, owner_id: Uuid) -> Result<UsageCounter, MetaStoreError> {
        let mut counters = self.counters.lock().unwrap();
        let counter = counters.entry(owner_id).or_insert_with(|| UsageCounter {
            owner_id,
            files_count: 0,
            bytes_stored: 0,
            updated_at: OffsetDateTime::now_utc(),
        });
        Ok(counter.clone())
    }

    async fn try_admit_active(
        &self,
        owner_id: Uuid,
        size_bytes: i64,
        max_files: i64,
        max_bytes: i64,
    ) -> Result<bool, MetaStoreError> {
        let mut counters = self.counters.lock().unwrap();
        let counter = counters.entry(owner_id).or_insert_with(|| UsageCounter {
            owner_id,
            files_count: 0,
            bytes_stored: 0,
            updated_at: OffsetDateTime::now_utc(),
        });
        let new_files = counter.files_count + 1;
        let new_bytes = counter.bytes_stored + size_bytes;
        if new_files > max_files || new_bytes > max_bytes {
            return Ok(false);
        }
        counter.files_count = new_files;
        counter.bytes_stored = new_bytes;
        counter.updated_at = OffsetDateTime::now_utc();
        Ok(true)
    }

    async fn release_usage(&self, owner_id: Uuid, size_bytes: i64) -> Result<(), MetaStoreError> {
        let mut counters = self.counters.lock().unwrap();
        if let Some(counter) = counters.get_mut(&owner_id) {
            counter.files_count = (counter.files_count - 1).max(0);
            counter.bytes_stored = (counter.bytes_stored - size_bytes).max(0);
            counter.updated_at = OffsetDateTime::now_utc();
        }
        Ok(())
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), MetaStoreError> {
        self.audits.lock().unwrap().push(entry.clone());
        Ok(())
    }
}

// ---- blob store ----

#[derive(Default)]
pub struct MemBlob {
    objects: Mutex<HashMap<(String, String), Bytes>>,
}

impl MemBlob {
    /// Simulates the client's direct PUT to the blob store.
    pub fn put(&self, bucket: &str, key: &str, data: &[u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert((bucket.to_owned(), key.to_owned()), Bytes::copy_from_slice(data));
    }

    fn get(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.objects
            .lock()
            .unwrap()
            .get(&(bucket.to_owned(), key.to_owned()))
            .cloned()
    }
}

#[async_trait::async_trait]
impl BlobStore for MemBlob {
    async fn presign_put(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        metadata: &[(String, String)],
        ttl: Duration,
    ) -> Result<PresignedUpload, BlobStoreError> {
        let mut headers = vec![("Content-Type".to_owned(), content_type.to_owned())];
        for (name, value) in metadata {
            headers.push((format!("x-amz-meta-{name}"), value.clone()));
        }
        Ok(PresignedUpload {
            url: format!("http://blob.public.test/{bucket}/{key}?X-Amz-Expires={}", ttl.as_secs()),
            headers,
        })
    }

    async fn presign_get(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
        _response_content_disposition: Option<&str>,
        _response_content_type: Option<&str>,
    ) -> Result<String, BlobStoreError> {
        Ok(format!(
            "http://blob.public.test/{bucket}/{key}?X-Amz-Expires={}&sig=test",
            ttl.as_secs()
        ))
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<HeadInfo, BlobStoreError> {
        match self.get(bucket, key) {
            Some(data) => Ok(HeadInfo {
                content_length: data.len() as i64,
            }),
            None => Err(BlobStoreError::NotFound),
        }
    }

    async fn iter_object(&self, bucket: &str, key: &str, chunk_size: usize) -> Result<ChunkStream, BlobStoreError> {
        let Some(data) = self.get(bucket, key) else {
            return Err(BlobStoreError::NotFound);
        };
        let chunks: Vec<Result<Bytes, BlobStoreError>> = data
            .chunks(chunk_size.max(1))
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        Ok(futures::stream::iter(chunks).boxed())
    }

    async fn get_range(&self, bucket: &str, key: &str, start: u64, end: u64) -> Result<Option<Bytes>, BlobStoreError> {
        let Some(data) = self.get(bucket, key) else {
            return Ok(None);
        };
        let start = start as usize;
        if start >= data.len() {
            return Ok(Some(Bytes::new()));
        }
        let end = ((end as usize) + 1).min(data.len());
        Ok(Some(data.slice(start..end)))
    }
}

// ---- scan queue ----

#[derive(Default)]
pub struct MemQueue {
    jobs: Mutex<Vec<Uuid>>,
}

impl MemQueue {
    pub fn drain(&self) -> Vec<Uuid> {
        std::mem::take(&mut *self.jobs.lock().unwrap())
    }
}

#[async_trait::async_trait]
impl ScanQueue for MemQueue {
    async fn enqueue(&self, file_id: Uuid) -> Result<(), QueueError> {
        self.jobs.lock().unwrap().push(file_id);
        Ok(())
    }
}

// ---- rate limiter ----

/// Fixed-window counter with the same key discipline as the Redis limiter.
#[derive(Default)]
pub struct MemLimiter {
    counts: Mutex<HashMap<String, u64>>,
}

#[async_trait::async_trait]
impl RateLimiter for MemLimiter {
    async fn hit(&self, scope: Scope, identity: &str, limit: &RouteLimit) -> Result<(), RateLimitError> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let key = filegate::rate_limit::window_key(scope, identity, limit, now);
        let mut counts = self.counts.lock().unwrap();
        let count = counts.entry(key).or_insert(0);
        *count += 1;
        if *count > limit.limit {
            return Err(RateLimitError::Limited);
        }
        Ok(())
    }
}

// ---- wiring ----

pub struct TestEnv {
    pub settings: Arc<Settings>,
    pub store: Arc<MemStore>,
    pub blob: Arc<MemBlob>,
    pub queue: Arc<MemQueue>,
    pub coordinator: UploadCoordinator,
    pub worker: ScanWorker,
}

pub fn test_env() -> TestEnv {
    let settings = Arc::new(test_settings());
    let store = Arc::new(MemStore::default());
    let blob = Arc::new(MemBlob::default());
    let queue = Arc::new(MemQueue::default());

    let coordinator = UploadCoordinator::new(
        Arc::clone(&settings),
        store.clone(),
        blob.clone(),
        queue.clone(),
    );
    let worker = ScanWorker::new(store.clone(), blob.clone());

    TestEnv {
        settings,
        store,
        blob,
        queue,
        coordinator,
        worker,
    }
}

pub async fn register_user(env: &TestEnv, email: &str) -> User {
    let user = User {
        id: Uuid::new_v4(),
        email: email.to_owned(),
        password_hash: "test-hash".into(),
        role: UserRole::User,
        created_at: OffsetDateTime::now_utc(),
    };
    env.store.create_user(&user).await.unwrap();
    user
}

pub fn meta() -> RequestMeta {
    RequestMeta {
        ip: Some("203.0.113.10".into()),
        user_agent: Some("filegate-tests".into()),
    }
}
