//! Per-owner storage admission. Counters move only on activation and
//! deletion; byte enforcement is deferred to activation because size is
//! unknown at init.

use std::sync::Arc;

use uuid::Uuid;

use crate::meta_store::{MetaStore, MetaStoreError};

pub const MAX_FILES: i64 = 200;
pub const MAX_BYTES: i64 = 2_000_000_000;

#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    #[error("quota exceeded")]
    Exceeded,
    #[error(transparent)]
    Store(#[from] MetaStoreError),
}

#[derive(Clone)]
pub struct QuotaService {
    store: Arc<dyn MetaStore>,
}

impl QuotaService {
    pub fn new(store: Arc<dyn MetaStore>) -> Self {
        Self { store }
    }

    /// Admission gate at `init`: refuse once the file-count cap is reached.
    pub async fn enforce_init(&self, owner_id: Uuid) -> Result<(), QuotaError> {
        let counter = self.store.usage_for_owner(owner_id).await?;
        if counter.files_count >= MAX_FILES {
            return Err(QuotaError::Exceeded);
        }
        Ok(())
    }

    /// Admission gate at activation. The store serializes this per owner, so
    /// two concurrent activations cannot both take the last slot.
    pub async fn commit_activation(&self, owner_id: Uuid, size_bytes: i64) -> Result<(), QuotaError> {
        let admitted = self
            .store
            .try_admit_active(owner_id, size_bytes, MAX_FILES, MAX_BYTES)
            .await?;
        if !admitted {
            return Err(QuotaError::Exceeded);
        }
        Ok(())
    }

    pub async fn release(&self, owner_id: Uuid, size_bytes: i64) -> Result<(), QuotaError> {
        self.store.release_usage(owner_id, size_bytes).await?;
        Ok(())
    }
}
