use std::panic::Location;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::meta_store::MetaStoreError;
use crate::queue::QueueError;
use crate::quota::QuotaError;
use crate::rate_limit::RateLimitError;
use crate::s3_client::BlobStoreError;

#[inline]
#[track_caller]
pub(crate) fn log(source: &dyn std::error::Error) {
    let location = Location::caller();
    let span_trace = tracing_error::SpanTrace::capture();

    error!(
        target: "filegate",
        %location,
        error=%source,
        "span trace:\n{span_trace}"
    );
}

/// Request-level error taxonomy. Everything a handler or the coordinator can
/// fail with maps onto one HTTP status plus a `{detail}` body.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),
    #[error("Email already registered")]
    EmailTaken,
    #[error("Upload not in INITIATED state")]
    BadState,
    #[error("Upload request expired")]
    Expired,
    #[error("Object not uploaded")]
    ObjectNotUploaded,
    #[error("Missing token")]
    MissingToken,
    #[error("Invalid token")]
    InvalidToken,
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("Forbidden")]
    Forbidden,
    #[error("quota exceeded")]
    QuotaExceeded,
    #[error("File not available for download")]
    NotDownloadable,
    #[error("File not found")]
    NotFound,
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("Not implemented")]
    NotImplemented,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::EmailTaken => StatusCode::BAD_REQUEST,
            AppError::BadState | AppError::Expired | AppError::ObjectNotUploaded => StatusCode::BAD_REQUEST,
            AppError::MissingToken | AppError::InvalidToken | AppError::InvalidCredentials => StatusCode::UNAUTHORIZED,
            AppError::Forbidden | AppError::QuotaExceeded | AppError::NotDownloadable => StatusCode::FORBIDDEN,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AppError::NotImplemented => StatusCode::NOT_IMPLEMENTED,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let detail = match &self {
            AppError::Internal(err) => {
                log(err.as_ref());
                "internal server error".to_owned()
            }
            other => other.to_string(),
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

impl From<MetaStoreError> for AppError {
    fn from(err: MetaStoreError) -> Self {
        match err {
            MetaStoreError::NotFound => AppError::NotFound,
            MetaStoreError::EmailTaken => AppError::EmailTaken,
            other => AppError::Internal(other.into()),
        }
    }
}

impl From<BlobStoreError> for AppError {
    fn from(err: BlobStoreError) -> Self {
        match err {
            // Callers that care about a missing object check for it
            // explicitly; reaching this conversion means infrastructure broke.
            BlobStoreError::NotFound => AppError::Internal(anyhow::anyhow!("blob store object vanished")),
            BlobStoreError::Backend(err) => AppError::Internal(err),
        }
    }
}

impl From<QuotaError> for AppError {
    fn from(err: QuotaError) -> Self {
        match err {
            QuotaError::Exceeded => AppError::QuotaExceeded,
            QuotaError::Store(err) => err.into(),
        }
    }
}

impl From<RateLimitError> for AppError {
    fn from(err: RateLimitError) -> Self {
        match err {
            RateLimitError::Limited => AppError::RateLimited,
            RateLimitError::Backend(err) => AppError::Internal(err),
        }
    }
}

impl From<QueueError> for AppError {
    fn from(err: QueueError) -> Self {
        AppError::Internal(err.into())
    }
}
