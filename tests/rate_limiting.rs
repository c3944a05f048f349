//! Fixed-window rate-limit contract, exercised through the same trait the
//! HTTP handlers use.

use filegate::rate_limit::{RateLimitError, RateLimiter, Scope, AUTH_LOGIN, FILES_INIT};

mod common;
use common::MemLimiter;

#[tokio::test]
async fn sixth_login_within_the_window_is_limited() {
    let limiter = MemLimiter::default();
    for _ in 0..5 {
        limiter
            .hit(Scope::Ip, "203.0.113.9", &AUTH_LOGIN)
            .await
            .expect("within budget");
    }
    let err = limiter.hit(Scope::Ip, "203.0.113.9", &AUTH_LOGIN).await.unwrap_err();
    assert!(matches!(err, RateLimitError::Limited));
}

#[tokio::test]
async fn identities_do_not_share_windows() {
    let limiter = MemLimiter::default();
    for _ in 0..AUTH_LOGIN.limit {
        limiter.hit(Scope::Ip, "198.51.100.1", &AUTH_LOGIN).await.unwrap();
    }
    // A different caller, and a different route for the first caller, are
    // both still within budget.
    limiter.hit(Scope::Ip, "198.51.100.2", &AUTH_LOGIN).await.unwrap();
    limiter.hit(Scope::User, "198.51.100.1", &FILES_INIT).await.unwrap();
}
