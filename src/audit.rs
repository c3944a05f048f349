//! Append-only audit trail. Recording is best-effort: a failed insert is
//! logged and swallowed so it can never abort the transition it describes.

use std::sync::Arc;

use uuid::Uuid;

use crate::meta_store::{AuditEntry, MetaStore};

pub const FILE_INIT: &str = "FILE_INIT";
pub const UPLOAD_REJECTED: &str = "UPLOAD_REJECTED";
pub const UPLOAD_QUARANTINED: &str = "UPLOAD_QUARANTINED";
pub const UPLOAD_ENQUEUED: &str = "UPLOAD_ENQUEUED";
pub const SCAN_PASS: &str = "SCAN_PASS";
pub const SCAN_QUARANTINED: &str = "SCAN_QUARANTINED";
pub const SCAN_FAIL: &str = "SCAN_FAIL";
pub const DOWNLOAD_URL_ISSUED: &str = "DOWNLOAD_URL_ISSUED";

/// Client-side request context attached to audit events.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Clone)]
pub struct AuditLog {
    store: Arc<dyn MetaStore>,
}

impl AuditLog {
    pub fn new(store: Arc<dyn MetaStore>) -> Self {
        Self { store }
    }

    pub async fn record(
        &self,
        actor_user_id: Option<Uuid>,
        action: &str,
        file_id: Option<Uuid>,
        meta: &RequestMeta,
        details: Option<serde_json::Value>,
    ) {
        let entry = AuditEntry {
            actor_user_id,
            action: action.to_owned(),
            file_id,
            ip: meta.ip.clone(),
            user_agent: meta.user_agent.clone(),
            details,
        };
        if let Err(err) = self.store.append_audit(&entry).await {
            tracing::warn!(action, error = %err, "failed to append audit event");
        }
    }
}
