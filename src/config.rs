use config::{Config, ConfigError, Environment};
use serde::Deserialize;

/// Process-wide configuration, loaded once at startup from the environment.
#[derive(Debug, Deserialize)]
pub struct Settings {
    #[serde(default = "defaults::env")]
    pub env: String,
    #[serde(default)]
    pub app_debug: bool,

    pub database_url: String,
    pub redis_url: String,

    /// Endpoint used for server-to-store HEAD/GET traffic.
    pub s3_endpoint: String,
    /// Endpoint baked into presigned URLs handed to clients. The signature
    /// encodes the host, so this must be the host clients can actually reach.
    /// Falls back to `s3_endpoint` when unset.
    #[serde(default)]
    pub s3_public_endpoint: Option<String>,
    pub s3_access_key_id: String,
    pub s3_secret_access_key: String,
    pub s3_bucket: String,
    #[serde(default = "defaults::s3_region")]
    pub s3_region: String,

    pub jwt_secret: String,
    #[serde(default = "defaults::jwt_algorithm")]
    pub jwt_algorithm: String,
    #[serde(default = "defaults::jwt_expires_seconds")]
    pub jwt_expires_seconds: u64,

    #[serde(default = "defaults::upload_presign_ttl_seconds")]
    pub upload_presign_ttl_seconds: u64,
    #[serde(default = "defaults::download_presign_ttl_seconds")]
    pub download_presign_ttl_seconds: u64,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let s = Config::builder().add_source(Environment::default()).build()?;
        s.try_deserialize()
    }

    pub fn is_prod(&self) -> bool {
        self.env == "prod"
    }

    pub fn public_s3_endpoint(&self) -> &str {
        self.s3_public_endpoint.as_deref().unwrap_or(&self.s3_endpoint)
    }
}

mod defaults {
    pub fn env() -> String {
        "dev".to_owned()
    }

    pub fn s3_region() -> String {
        "us-east-1".to_owned()
    }

    pub fn jwt_algorithm() -> String {
        "HS256".to_owned()
    }

    pub fn jwt_expires_seconds() -> u64 {
        3600
    }

    pub fn upload_presign_ttl_seconds() -> u64 {
        900
    }

    pub fn download_presign_ttl_seconds() -> u64 {
        300
    }
}
