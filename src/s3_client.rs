use std::fmt::Debug;
use std::time::Duration;

use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::StreamExt;

use crate::config::Settings;

#[derive(Debug, thiserror::Error)]
pub enum BlobStoreError {
    #[error("object not found")]
    NotFound,
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct PresignedUpload {
    pub url: String,
    /// Headers the client must send verbatim to keep the signature valid.
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy)]
pub struct HeadInfo {
    pub content_length: i64,
}

pub type ChunkStream = BoxStream<'static, Result<Bytes, BlobStoreError>>;

/// Capability surface over an S3-compatible store. The service never proxies
/// client bytes; it only mints URLs and reads back what clients uploaded.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync + 'static {
    async fn presign_put(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        metadata: &[(String, String)],
        ttl: Duration,
    ) -> Result<PresignedUpload, BlobStoreError>;

    async fn presign_get(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
        response_content_disposition: Option<&str>,
        response_content_type: Option<&str>,
    ) -> Result<String, BlobStoreError>;

    async fn head(&self, bucket: &str, key: &str) -> Result<HeadInfo, BlobStoreError>;

    /// Lazy chunked read of the whole object.
    async fn iter_object(&self, bucket: &str, key: &str, chunk_size: usize) -> Result<ChunkStream, BlobStoreError>;

    /// Inclusive byte range; `Ok(None)` when the object does not exist.
    async fn get_range(&self, bucket: &str, key: &str, start: u64, end: u64) -> Result<Option<Bytes>, BlobStoreError>;
}

/// Two client handles over the same credentials: `internal` talks to the
/// store directly, `public` only signs URLs returned to clients (the
/// signature encodes the host).
pub struct S3BlobStore {
    internal: aws_sdk_s3::Client,
    public: aws_sdk_s3::Client,
}

impl Debug for S3BlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3BlobStore").finish()
    }
}

fn build_client(settings: &Settings, endpoint: &str) -> aws_sdk_s3::Client {
    let cred = Credentials::new(
        settings.s3_access_key_id.clone(),
        settings.s3_secret_access_key.clone(),
        None,
        None,
        "loaded-from-env",
    );

    let s3_config = aws_sdk_s3::config::Builder::new()
        .behavior_version(BehaviorVersion::v2023_11_09())
        .endpoint_url(endpoint)
        .credentials_provider(cred)
        .region(Region::new(settings.s3_region.clone()))
        .force_path_style(true) // apply bucket name as path param instead of pre-domain
        .build();

    aws_sdk_s3::Client::from_conf(s3_config)
}

impl S3BlobStore {
    pub fn new(settings: &Settings) -> Self {
        let internal = build_client(settings, &settings.s3_endpoint);
        let public = build_client(settings, settings.public_s3_endpoint());
        Self { internal, public }
    }

    /// HEAD then create-if-missing, tolerating creation races.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn ensure_bucket(&self, bucket: &str) -> Result<(), BlobStoreError> {
        if self.internal.head_bucket().bucket(bucket).send().await.is_ok() {
            return Ok(());
        }

        tracing::info!(bucket, "bucket missing, creating it");
        match self.internal.create_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(()),
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_bucket_already_owned_by_you() || service_err.is_bucket_already_exists() {
                    Ok(())
                } else {
                    Err(BlobStoreError::Backend(service_err.into()))
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl BlobStore for S3BlobStore {
    #[tracing::instrument(level = "debug", skip(self, metadata))]
    async fn presign_put(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        metadata: &[(String, String)],
        ttl: Duration,
    ) -> Result<PresignedUpload, BlobStoreError> {
        let presign_config = PresigningConfig::expires_in(ttl).map_err(anyhow::Error::from)?;

        let mut req = self
            .public
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type(content_type);
        for (name, value) in metadata {
            req = req.metadata(name, value);
        }
        let presigned = req.presigned(presign_config).await.map_err(anyhow::Error::from)?;

        let mut headers: Vec<(String, String)> = presigned
            .headers()
            .map(|(name, value)| (name.to_owned(), value.to_owned()))
            .collect();
        if !headers.iter().any(|(name, _)| name.eq_ignore_ascii_case("content-type")) {
            headers.push(("Content-Type".to_owned(), content_type.to_owned()));
        }

        Ok(PresignedUpload {
            url: presigned.uri().to_string(),
            headers,
        })
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn presign_get(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
        response_content_disposition: Option<&str>,
        response_content_type: Option<&str>,
    ) -> Result<String, BlobStoreError> {
        let presign_config = PresigningConfig::expires_in(ttl).map_err(anyhow::Error::from)?;

        let mut req = self.public.get_object().bucket(bucket).key(key);
        if let Some(disposition) = response_content_disposition {
            req = req.response_content_disposition(disposition);
        }
        if let Some(content_type) = response_content_type {
            req = req.response_content_type(content_type);
        }
        let presigned = req.presigned(presign_config).await.map_err(anyhow::Error::from)?;

        Ok(presigned.uri().to_string())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn head(&self, bucket: &str, key: &str) -> Result<HeadInfo, BlobStoreError> {
        let res = self.internal.head_object().bucket(bucket).key(key).send().await;
        match res {
            Ok(out) => Ok(HeadInfo {
                content_length: out.content_length().unwrap_or(0),
            }),
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_not_found() {
                    Err(BlobStoreError::NotFound)
                } else {
                    Err(BlobStoreError::Backend(service_err.into()))
                }
            }
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn iter_object(&self, bucket: &str, key: &str, chunk_size: usize) -> Result<ChunkStream, BlobStoreError> {
        let res = self.internal.get_object().bucket(bucket).key(key).send().await;
        let out = match res {
            Ok(out) => out,
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_no_such_key() {
                    return Err(BlobStoreError::NotFound);
                }
                return Err(BlobStoreError::Backend(service_err.into()));
            }
        };
        Ok(rechunk(out.body, chunk_size))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_range(&self, bucket: &str, key: &str, start: u64, end: u64) -> Result<Option<Bytes>, BlobStoreError> {
        let res = self
            .internal
            .get_object()
            .bucket(bucket)
            .key(key)
            .range(format!("bytes={start}-{end}"))
            .send()
            .await;
        let out = match res {
            Ok(out) => out,
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_no_such_key() {
                    return Ok(None);
                }
                return Err(BlobStoreError::Backend(service_err.into()));
            }
        };
        let data = out.body.collect().await.map_err(anyhow::Error::from)?;
        Ok(Some(data.into_bytes()))
    }
}

/// Re-buffer the transport's arbitrary chunk boundaries into `chunk_size`
/// pieces (the final chunk may be shorter).
fn rechunk(body: ByteStream, chunk_size: usize) -> ChunkStream {
    struct State {
        body: ByteStream,
        buf: BytesMut,
        done: bool,
    }

    let state = State {
        body,
        buf: BytesMut::new(),
        done: false,
    };

    futures::stream::try_unfold(state, move |mut state| async move {
        loop {
            if state.buf.len() >= chunk_size {
                let chunk = state.buf.split_to(chunk_size).freeze();
                return Ok(Some((chunk, state)));
            }
            if state.done {
                if state.buf.is_empty() {
                    return Ok(None);
                }
                let rest = state.buf.split().freeze();
                return Ok(Some((rest, state)));
            }
            match state.body.try_next().await {
                Ok(Some(bytes)) => state.buf.extend_from_slice(&bytes),
                Ok(None) => state.done = true,
                Err(err) => return Err(BlobStoreError::Backend(err.into())),
            }
        }
    })
    .boxed()
}
