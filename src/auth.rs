//! Credential plumbing: bearer tokens, password hashes and the signed demo
//! cookie that carries an anonymous upload identity.

use std::str::FromStr;

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Argon2, PasswordHash};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use hmac::{Hmac, Mac};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use crate::config::Settings;

pub const DEMO_COOKIE_NAME: &str = "demo";
pub const DEMO_COOKIE_MAX_AGE_SECS: i64 = 2 * 60 * 60;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: Uuid,
    exp: i64,
}

pub fn create_access_token(user_id: Uuid, settings: &Settings) -> anyhow::Result<String> {
    let algorithm = Algorithm::from_str(&settings.jwt_algorithm)
        .map_err(|_| anyhow::anyhow!("unsupported JWT algorithm {:?}", settings.jwt_algorithm))?;
    let claims = Claims {
        sub: user_id,
        exp: time::OffsetDateTime::now_utc().unix_timestamp() + settings.jwt_expires_seconds as i64,
    };
    let token = jsonwebtoken::encode(
        &Header::new(algorithm),
        &claims,
        &EncodingKey::from_secret(settings.jwt_secret.as_bytes()),
    )?;
    Ok(token)
}

/// Returns the subject of a valid, unexpired bearer token.
pub fn decode_access_token(token: &str, settings: &Settings) -> Option<Uuid> {
    let algorithm = Algorithm::from_str(&settings.jwt_algorithm).ok()?;
    let data = jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(settings.jwt_secret.as_bytes()),
        &Validation::new(algorithm),
    )
    .ok()?;
    Some(data.claims.sub)
}

pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|err| anyhow::anyhow!("password hashing failed: {err}"))?;
    Ok(hash.to_string())
}

pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok()
}

/// Mint a demo session token: `base64url("<id>.<issued>.<ttl>.<hex hmac>")`
/// where the HMAC-SHA256 covers `"<id>.<issued>.<ttl>"`.
pub fn issue_demo_token(demo_id: Uuid, issued_at: i64, ttl_secs: i64, secret: &str) -> String {
    let payload = format!("{demo_id}.{issued_at}.{ttl_secs}");
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload.as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());
    URL_SAFE.encode(format!("{payload}.{signature}"))
}

/// Verify a demo token and return its demo id. Signature comparison is
/// constant-time; expiry is checked only after the signature holds.
pub fn verify_demo_token(token: &str, now_secs: i64, secret: &str) -> Option<Uuid> {
    let decoded = URL_SAFE.decode(token.as_bytes()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (payload, signature_hex) = decoded.rsplit_once('.')?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload.as_bytes());
    let signature = hex::decode(signature_hex).ok()?;
    mac.verify_slice(&signature).ok()?;

    let mut parts = payload.split('.');
    let demo_id = Uuid::parse_str(parts.next()?).ok()?;
    let issued_at: i64 = parts.next()?.parse().ok()?;
    let ttl_secs: i64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    if now_secs > issued_at + ttl_secs {
        return None;
    }
    Some(demo_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-signing-secret";

    #[test]
    fn demo_token_round_trips() {
        let demo_id = Uuid::new_v4();
        let token = issue_demo_token(demo_id, 1_000, 7_200, SECRET);
        assert_eq!(verify_demo_token(&token, 1_000, SECRET), Some(demo_id));
        assert_eq!(verify_demo_token(&token, 8_200, SECRET), Some(demo_id));
    }

    #[test]
    fn demo_token_expires() {
        let token = issue_demo_token(Uuid::new_v4(), 1_000, 7_200, SECRET);
        assert_eq!(verify_demo_token(&token, 8_201, SECRET), None);
    }

    #[test]
    fn demo_token_rejects_tampering() {
        let demo_id = Uuid::new_v4();
        let token = issue_demo_token(demo_id, 1_000, 7_200, SECRET);

        let decoded = String::from_utf8(URL_SAFE.decode(&token).unwrap()).unwrap();
        let (payload, signature) = decoded.rsplit_once('.').unwrap();
        let forged_payload = payload.replacen("7200", "9999", 1);
        let forged = URL_SAFE.encode(format!("{forged_payload}.{signature}"));

        assert_eq!(verify_demo_token(&forged, 1_000, SECRET), None);
        assert_eq!(verify_demo_token(&token, 1_000, "other-secret"), None);
        assert_eq!(verify_demo_token("%%%not-base64%%%", 1_000, SECRET), None);
    }

    #[test]
    fn password_hash_round_trips() {
        let hash = hash_password("pass1234").unwrap();
        assert!(verify_password("pass1234", &hash));
        assert!(!verify_password("wrong", &hash));
        assert!(!verify_password("pass1234", "!"));
    }

    #[test]
    fn access_token_round_trips() {
        let settings = test_settings();
        let user_id = Uuid::new_v4();
        let token = create_access_token(user_id, &settings).unwrap();
        assert_eq!(decode_access_token(&token, &settings), Some(user_id));
        assert_eq!(decode_access_token("garbage", &settings), None);
    }

    fn test_settings() -> crate::config::Settings {
        crate::config::Settings {
            env: "test".into(),
            app_debug: false,
            database_url: String::new(),
            redis_url: String::new(),
            s3_endpoint: String::new(),
            s3_public_endpoint: None,
            s3_access_key_id: String::new(),
            s3_secret_access_key: String::new(),
            s3_bucket: "test-bucket".into(),
            s3_region: "us-east-1".into(),
            jwt_secret: SECRET.into(),
            jwt_algorithm: "HS256".into(),
            jwt_expires_seconds: 3600,
            upload_presign_ttl_seconds: 900,
            download_presign_ttl_seconds: 300,
        }
    }
}
