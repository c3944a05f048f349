//! Fixed-window request throttling over a shared key-value store.
//!
//! Keys are `rl:<scope>:<identity>:<route>:<window index>`; the TTL is set on
//! the first increment of a window so stale windows expire on their own.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;

#[derive(Debug, Clone, Copy)]
pub struct RouteLimit {
    pub route: &'static str,
    pub limit: u64,
    pub window_secs: u64,
}

pub const AUTH_REGISTER: RouteLimit = RouteLimit { route: "auth_register", limit: 3, window_secs: 60 };
pub const AUTH_LOGIN: RouteLimit = RouteLimit { route: "auth_login", limit: 5, window_secs: 60 };
pub const DEMO_START: RouteLimit = RouteLimit { route: "demo_start", limit: 10, window_secs: 60 };
pub const FILES_INIT: RouteLimit = RouteLimit { route: "files_init", limit: 10, window_secs: 60 };
pub const FILES_COMPLETE: RouteLimit = RouteLimit { route: "files_complete", limit: 20, window_secs: 60 };
pub const FILES_DOWNLOAD_URL: RouteLimit = RouteLimit { route: "files_download_url", limit: 30, window_secs: 60 };

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Ip,
    User,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Ip => "ip",
            Scope::User => "user",
        }
    }
}

pub fn window_key(scope: Scope, identity: &str, limit: &RouteLimit, now_secs: i64) -> String {
    let window = now_secs / limit.window_secs as i64;
    format!("rl:{}:{}:{}:{}", scope.as_str(), identity, limit.route, window)
}

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("rate limit exceeded")]
    Limited,
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

#[async_trait::async_trait]
pub trait RateLimiter: Send + Sync + 'static {
    /// Count one hit for `identity` on this route; fails with `Limited` when
    /// the post-increment count exceeds the window's budget.
    async fn hit(&self, scope: Scope, identity: &str, limit: &RouteLimit) -> Result<(), RateLimitError>;
}

#[derive(Clone)]
pub struct RedisRateLimiter {
    conn: ConnectionManager,
}

impl RedisRateLimiter {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait::async_trait]
impl RateLimiter for RedisRateLimiter {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn hit(&self, scope: Scope, identity: &str, limit: &RouteLimit) -> Result<(), RateLimitError> {
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        let key = window_key(scope, identity, limit, now);

        let mut conn = self.conn.clone();
        let count: u64 = conn
            .incr(&key, 1u64)
            .await
            .map_err(|err| RateLimitError::Backend(err.into()))?;
        if count == 1 {
            conn.expire::<_, ()>(&key, limit.window_secs as i64)
                .await
                .map_err(|err| RateLimitError::Backend(err.into()))?;
        }
        if count > limit.limit {
            return Err(RateLimitError::Limited);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_carries_scope_identity_route_and_window() {
        let key = window_key(Scope::Ip, "203.0.113.9", &AUTH_LOGIN, 125);
        assert_eq!(key, "rl:ip:203.0.113.9:auth_login:2");
    }

    #[test]
    fn window_index_rolls_over() {
        let a = window_key(Scope::User, "u1", &FILES_INIT, 59);
        let b = window_key(Scope::User, "u1", &FILES_INIT, 60);
        assert_ne!(a, b);
    }
}
