use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type Timestamp = time::OffsetDateTime;

/// Lifecycle of a stored object. `Active`, `Quarantined` and `Rejected` are
/// terminal; nothing exposed through the API moves a row out of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileState {
    Initiated,
    Scanning,
    Active,
    Quarantined,
    Rejected,
}

impl FileState {
    pub fn as_str(self) -> &'static str {
        match self {
            FileState::Initiated => "INITIATED",
            FileState::Scanning => "SCANNING",
            FileState::Active => "ACTIVE",
            FileState::Quarantined => "QUARANTINED",
            FileState::Rejected => "REJECTED",
        }
    }

    pub fn parse(value: &str) -> Option<FileState> {
        match value {
            "INITIATED" => Some(FileState::Initiated),
            "SCANNING" => Some(FileState::Scanning),
            "ACTIVE" => Some(FileState::Active),
            "QUARANTINED" => Some(FileState::Quarantined),
            "REJECTED" => Some(FileState::Rejected),
            _ => None,
        }
    }

    /// The closed transition set. Any pair not listed here is illegal and
    /// must be refused by every store implementation.
    pub fn can_transition(self, next: FileState) -> bool {
        matches!(
            (self, next),
            (FileState::Initiated, FileState::Scanning)
                | (FileState::Initiated, FileState::Rejected)
                | (FileState::Initiated, FileState::Quarantined)
                | (FileState::Scanning, FileState::Active)
                | (FileState::Scanning, FileState::Quarantined)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, FileState::Active | FileState::Quarantined | FileState::Rejected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    User,
}

impl UserRole {
    pub fn as_str(self) -> &'static str {
        match self {
            UserRole::Admin => "admin",
            UserRole::User => "user",
        }
    }

    pub fn parse(value: &str) -> Option<UserRole> {
        match value {
            "admin" => Some(UserRole::Admin),
            "user" => Some(UserRole::User),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub password_hash: String,
    pub role: UserRole,
    pub created_at: Timestamp,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }
}

#[derive(Debug, Clone)]
pub struct FileObject {
    pub id: Uuid,
    pub owner_id: Uuid,
    /// Present iff the uploader was an anonymous demo session; equals the id
    /// of the auto-provisioned demo user owning the row.
    pub demo_id: Option<Uuid>,
    pub bucket: String,
    pub object_key: String,
    pub original_filename: String,
    pub declared_content_type: String,
    pub checksum_sha256: String,
    pub checksum_verified: bool,
    pub size_bytes: Option<i64>,
    pub sniffed_content_type: Option<String>,
    pub state: FileState,
    pub upload_expires_at: Timestamp,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Field updates committed together with the INITIATED -> next transition at
/// the end of `complete`. One compare-and-set write covers all outcomes.
#[derive(Debug, Clone)]
pub struct CompleteTransition {
    pub state: FileState,
    pub checksum_verified: bool,
    pub size_bytes: i64,
    pub sniffed_content_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UsageCounter {
    pub owner_id: Uuid,
    pub files_count: i64,
    pub bytes_stored: i64,
    pub updated_at: Timestamp,
}

/// Audit record as inserted; id and created_at are assigned by the store.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub actor_user_id: Option<Uuid>,
    pub action: String,
    pub file_id: Option<Uuid>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum MetaStoreError {
    #[error("no such row")]
    NotFound,
    #[error("email already registered")]
    EmailTaken,
    #[error("illegal state transition {from} -> {to}")]
    InvalidTransition { from: FileState, to: FileState },
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Single source of truth for object metadata, users, quota counters and the
/// audit log.
///
/// State transitions MUST be compare-and-set on the current state so that
/// concurrent callers serialize through row identity; a missed CAS returns
/// `false` rather than overwriting.
#[async_trait::async_trait]
pub trait MetaStore: Send + Sync + 'static {
    // users
    async fn create_user(&self, user: &User) -> Result<(), MetaStoreError>;
    async fn get_user(&self, id: Uuid) -> Result<Option<User>, MetaStoreError>;
    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, MetaStoreError>;
    /// Provision the dedicated demo user whose id equals the demo session id.
    /// Idempotent; returns the (possibly pre-existing) row.
    async fn ensure_demo_user(&self, demo_id: Uuid) -> Result<User, MetaStoreError>;

    // file objects
    async fn insert_file(&self, file: &FileObject) -> Result<(), MetaStoreError>;
    async fn get_file(&self, id: Uuid) -> Result<Option<FileObject>, MetaStoreError>;
    /// All objects of one owner, newest first.
    async fn list_files(&self, owner_id: Uuid) -> Result<Vec<FileObject>, MetaStoreError>;

    /// CAS from INITIATED, committing the fields gathered by `complete`.
    /// Returns false when the row is no longer INITIATED.
    async fn transition_from_complete(&self, id: Uuid, update: &CompleteTransition) -> Result<bool, MetaStoreError>;
    /// CAS from SCANNING into `to` (ACTIVE or QUARANTINED), optionally
    /// refreshing size and sniff columns. Returns false on a missed CAS.
    async fn transition_from_scan(
        &self,
        id: Uuid,
        to: FileState,
        size_bytes: Option<i64>,
        sniffed_content_type: Option<String>,
    ) -> Result<bool, MetaStoreError>;

    // usage counters
    /// Read (lazily creating) the owner's counter.
    async fn usage_for_owner(&self, owner_id: Uuid) -> Result<UsageCounter, MetaStoreError>;
    /// Atomically admit one activation: `(files_count + 1, bytes_stored +
    /// size)` against the caps, all inside a per-owner serial section.
    /// Returns false without mutating when either cap would be exceeded.
    async fn try_admit_active(
        &self,
        owner_id: Uuid,
        size_bytes: i64,
        max_files: i64,
        max_bytes: i64,
    ) -> Result<bool, MetaStoreError>;
    /// Undo one admission (deletion path, or a lost activation race),
    /// clamped at zero.
    async fn release_usage(&self, owner_id: Uuid, size_bytes: i64) -> Result<(), MetaStoreError>;

    // audit
    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), MetaStoreError>;
}

#[cfg(test)]
mod tests {
    use super::FileState::*;

    #[test]
    fn transition_table_is_closed() {
        let all = [Initiated, Scanning, Active, Quarantined, Rejected];
        let legal = [
            (Initiated, Scanning),
            (Initiated, Rejected),
            (Initiated, Quarantined),
            (Scanning, Active),
            (Scanning, Quarantined),
        ];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition(to),
                    legal.contains(&(from, to)),
                    "{from:?} -> {to:?}"
                );
            }
        }
    }

    #[test]
    fn terminal_states_admit_nothing() {
        let all = [Initiated, Scanning, Active, Quarantined, Rejected];
        for state in [Active, Quarantined, Rejected] {
            assert!(state.is_terminal());
            for to in all {
                assert!(!state.can_transition(to));
            }
        }
    }

    #[test]
    fn state_names_round_trip() {
        for state in [Initiated, Scanning, Active, Quarantined, Rejected] {
            assert_eq!(super::FileState::parse(state.as_str()), Some(state));
        }
        assert_eq!(super::FileState::parse("UPLOADED"), None);
    }
}
