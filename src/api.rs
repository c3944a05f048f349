//! HTTP surface: JSON handlers over the coordinator plus auth, demo-session
//! and health routes. Handlers stay thin; policy and state live below.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, HeaderMap};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::audit::RequestMeta;
use crate::auth::{
    self, create_access_token, decode_access_token, verify_demo_token, DEMO_COOKIE_MAX_AGE_SECS, DEMO_COOKIE_NAME,
};
use crate::config::Settings;
use crate::error::AppError;
use crate::meta_store::{FileObject, FileState, MetaStore, User, UserRole};
use crate::rate_limit::{self, RateLimiter, Scope};
use crate::service::{Caller, InitUpload, UploadCoordinator};

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub store: Arc<dyn MetaStore>,
    pub coordinator: Arc<UploadCoordinator>,
    pub limiter: Arc<dyn RateLimiter>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/demo/start", post(demo_start))
        .route("/files/init", post(files_init))
        .route("/files/{id}/complete", post(files_complete))
        .route("/files", get(files_list))
        .route("/files/{id}", get(files_get).delete(files_delete))
        .route("/files/{id}/download-url", post(files_download_url))
        .route("/health/live", get(health_live))
        .route("/health/ready", get(health_ready))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---- request / response bodies ----

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    email: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct TokenResponse {
    access_token: String,
    token_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct InitRequest {
    original_filename: String,
    content_type: String,
    checksum_sha256: String,
    size_bytes: Option<i64>,
}

#[derive(Debug, Serialize)]
struct InitResponse {
    file_id: Uuid,
    object_key: String,
    upload_url: String,
    expires_in: u64,
    headers_to_include: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct CompleteResponse {
    state: FileState,
    sniffed_content_type: Option<String>,
}

#[derive(Debug, Serialize)]
struct FileDetail {
    id: Uuid,
    owner_id: Uuid,
    bucket: String,
    object_key: String,
    original_filename: String,
    declared_content_type: String,
    sniffed_content_type: Option<String>,
    checksum_sha256: String,
    checksum_verified: bool,
    size_bytes: Option<i64>,
    state: FileState,
    created_at: String,
    updated_at: String,
}

impl From<FileObject> for FileDetail {
    fn from(file: FileObject) -> Self {
        FileDetail {
            id: file.id,
            owner_id: file.owner_id,
            bucket: file.bucket,
            object_key: file.object_key,
            original_filename: file.original_filename,
            declared_content_type: file.declared_content_type,
            sniffed_content_type: file.sniffed_content_type,
            checksum_sha256: file.checksum_sha256,
            checksum_verified: file.checksum_verified,
            size_bytes: file.size_bytes,
            state: file.state,
            created_at: rfc3339(file.created_at),
            updated_at: rfc3339(file.updated_at),
        }
    }
}

#[derive(Debug, Serialize)]
struct DownloadUrlResponse {
    download_url: String,
    expires_in: u64,
}

fn rfc3339(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339).unwrap_or_else(|_| ts.unix_timestamp().to_string())
}

// ---- request context helpers ----

fn client_ip(headers: &HeaderMap, addr: &SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| addr.ip().to_string())
}

fn request_meta(headers: &HeaderMap, ip: &str) -> RequestMeta {
    RequestMeta {
        ip: Some(ip.to_owned()),
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned),
    }
}

async fn bearer_user(state: &AppState, headers: &HeaderMap) -> Result<User, AppError> {
    let Some(auth_header) = headers.get(header::AUTHORIZATION).and_then(|value| value.to_str().ok()) else {
        return Err(AppError::MissingToken);
    };
    let Some((scheme, token)) = auth_header.split_once(' ') else {
        return Err(AppError::MissingToken);
    };
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AppError::MissingToken);
    }
    let user_id = decode_access_token(token.trim(), &state.settings).ok_or(AppError::InvalidToken)?;
    let user = state.store.get_user(user_id).await?.ok_or(AppError::InvalidToken)?;
    Ok(user)
}

fn demo_session(state: &AppState, headers: &HeaderMap) -> Option<Uuid> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    let now = OffsetDateTime::now_utc().unix_timestamp();
    for pair in raw.split(';') {
        if let Some((name, value)) = pair.trim().split_once('=') {
            if name == DEMO_COOKIE_NAME {
                return verify_demo_token(value, now, &state.settings.jwt_secret);
            }
        }
    }
    None
}

/// Bearer token first, demo cookie second. Routes that accept both use this.
async fn resolve_caller(state: &AppState, headers: &HeaderMap) -> Result<Caller, AppError> {
    match bearer_user(state, headers).await {
        Ok(user) => Ok(Caller::User(user)),
        Err(AppError::MissingToken) => demo_session(state, headers)
            .map(Caller::Demo)
            .ok_or(AppError::MissingToken),
        Err(err) => Err(err),
    }
}

/// Identity for user-scoped rate limits; demo traffic degrades to its IP.
fn limit_identity(caller: &Caller, ip: &str) -> String {
    match caller {
        Caller::User(user) => user.id.to_string(),
        Caller::Demo(_) => format!("ip-{ip}"),
    }
}

// ---- handlers ----

async fn register(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<RegisterRequest>,
) -> Result<Json<TokenResponse>, AppError> {
    let ip = client_ip(&headers, &addr);
    state.limiter.hit(Scope::Ip, &ip, &rate_limit::AUTH_REGISTER).await?;

    let email = payload.email.trim().to_ascii_lowercase();
    if !email.contains('@') {
        return Err(AppError::Validation("invalid email address".to_owned()));
    }
    if state.store.get_user_by_email(&email).await?.is_some() {
        return Err(AppError::EmailTaken);
    }

    let user = User {
        id: Uuid::new_v4(),
        email,
        password_hash: auth::hash_password(&payload.password)?,
        role: UserRole::User,
        created_at: OffsetDateTime::now_utc(),
    };
    state.store.create_user(&user).await?;

    let token = create_access_token(user.id, &state.settings)?;
    Ok(Json(TokenResponse {
        access_token: token,
        token_type: "bearer",
    }))
}

async fn login(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<TokenResponse>, AppError> {
    let ip = client_ip(&headers, &addr);
    state.limiter.hit(Scope::Ip, &ip, &rate_limit::AUTH_LOGIN).await?;

    let email = payload.email.trim().to_ascii_lowercase();
    let user = state
        .store
        .get_user_by_email(&email)
        .await?
        .ok_or(AppError::InvalidCredentials)?;
    if !auth::verify_password(&payload.password, &user.password_hash) {
        return Err(AppError::InvalidCredentials);
    }

    let token = create_access_token(user.id, &state.settings)?;
    Ok(Json(TokenResponse {
        access_token: token,
        token_type: "bearer",
    }))
}

async fn demo_start(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let ip = client_ip(&headers, &addr);
    state.limiter.hit(Scope::Ip, &ip, &rate_limit::DEMO_START).await?;

    let demo_id = Uuid::new_v4();
    let issued_at = OffsetDateTime::now_utc().unix_timestamp();
    let token = auth::issue_demo_token(demo_id, issued_at, DEMO_COOKIE_MAX_AGE_SECS, &state.settings.jwt_secret);

    let cookie = format!(
        "{DEMO_COOKIE_NAME}={token}; Max-Age={DEMO_COOKIE_MAX_AGE_SECS}; Path=/; HttpOnly; SameSite=Lax{}",
        if state.settings.is_prod() { "; Secure" } else { "" }
    );
    Ok(([(header::SET_COOKIE, cookie)], Json(json!({ "ok": true }))))
}

async fn files_init(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<InitRequest>,
) -> Result<Json<InitResponse>, AppError> {
    let ip = client_ip(&headers, &addr);
    let caller = resolve_caller(&state, &headers).await?;
    state
        .limiter
        .hit(Scope::User, &limit_identity(&caller, &ip), &rate_limit::FILES_INIT)
        .await?;

    let req = InitUpload {
        original_filename: payload.original_filename,
        content_type: payload.content_type,
        checksum_sha256: payload.checksum_sha256,
        size_bytes: payload.size_bytes,
    };
    let grant = state.coordinator.init(&caller, &req, &request_meta(&headers, &ip)).await?;

    Ok(Json(InitResponse {
        file_id: grant.file_id,
        object_key: grant.object_key,
        upload_url: grant.upload_url,
        expires_in: grant.expires_in,
        headers_to_include: grant.headers_to_include.into_iter().collect(),
    }))
}

async fn files_complete(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(file_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<CompleteResponse>, AppError> {
    let ip = client_ip(&headers, &addr);
    let caller = resolve_caller(&state, &headers).await?;
    state
        .limiter
        .hit(Scope::User, &limit_identity(&caller, &ip), &rate_limit::FILES_COMPLETE)
        .await?;

    let outcome = state
        .coordinator
        .complete(&caller, file_id, &request_meta(&headers, &ip))
        .await?;
    Ok(Json(CompleteResponse {
        state: outcome.state,
        sniffed_content_type: outcome.sniffed_content_type,
    }))
}

async fn files_list(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<Vec<FileDetail>>, AppError> {
    let caller = resolve_caller(&state, &headers).await?;
    let files = state.coordinator.list_files(&caller).await?;
    Ok(Json(files.into_iter().map(FileDetail::from).collect()))
}

async fn files_get(
    State(state): State<AppState>,
    Path(file_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<FileDetail>, AppError> {
    // Bearer-only route; demo sessions list their uploads instead.
    let user = bearer_user(&state, &headers).await?;
    let file = state.coordinator.get_file(&Caller::User(user), file_id).await?;
    Ok(Json(file.into()))
}

async fn files_delete(
    State(_state): State<AppState>,
    Path(_file_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    // Deletion (with its quota release) is not wired up yet.
    Err(AppError::NotImplemented)
}

async fn files_download_url(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(file_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<DownloadUrlResponse>, AppError> {
    let ip = client_ip(&headers, &addr);
    let caller = resolve_caller(&state, &headers).await?;
    state
        .limiter
        .hit(Scope::User, &limit_identity(&caller, &ip), &rate_limit::FILES_DOWNLOAD_URL)
        .await?;

    let grant = state
        .coordinator
        .download_url(&caller, file_id, &request_meta(&headers, &ip))
        .await?;
    Ok(Json(DownloadUrlResponse {
        download_url: grant.download_url,
        expires_in: grant.expires_in,
    }))
}

async fn health_live() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn health_ready() -> Json<serde_json::Value> {
    Json(json!({ "status": "degraded", "details": "readiness checks not implemented" }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarded_header_wins_over_socket_addr() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        assert_eq!(client_ip(&headers, &addr), "203.0.113.7");
    }

    #[test]
    fn socket_addr_is_the_fallback() {
        let headers = HeaderMap::new();
        let addr: SocketAddr = "192.0.2.4:1234".parse().unwrap();
        assert_eq!(client_ip(&headers, &addr), "192.0.2.4");
    }
}
