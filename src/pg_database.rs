use std::fmt::Debug;

use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use uuid::Uuid;

use crate::config::Settings;
use crate::meta_store::{
    AuditEntry, CompleteTransition, FileObject, FileState, MetaStore, MetaStoreError, UsageCounter, User, UserRole,
};

pub struct PostgresDatabase {
    pool: PgPool,
}

impl Debug for PostgresDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresDatabase").finish()
    }
}

fn db_err(err: sqlx::Error) -> MetaStoreError {
    MetaStoreError::Backend(err.into())
}

impl PostgresDatabase {
    pub async fn connect(settings: &Settings) -> anyhow::Result<Self> {
        let pool = PgPool::connect(&settings.database_url).await?;

        tracing::info!("starting database migration");
        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::info!("finished database migration");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn user_from_row(row: &PgRow) -> Result<User, MetaStoreError> {
    let role: String = row.try_get("role").map_err(db_err)?;
    let role = UserRole::parse(&role)
        .ok_or_else(|| MetaStoreError::Backend(anyhow::anyhow!("unknown role {role:?} in users row")))?;
    Ok(User {
        id: row.try_get("id").map_err(db_err)?,
        email: row.try_get("email").map_err(db_err)?,
        password_hash: row.try_get("password_hash").map_err(db_err)?,
        role,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn file_from_row(row: &PgRow) -> Result<FileObject, MetaStoreError> {
    let state: String = row.try_get("state").map_err(db_err)?;
    let state = FileState::parse(&state)
        .ok_or_else(|| MetaStoreError::Backend(anyhow::anyhow!("unknown state {state:?} in file_objects row")))?;
    Ok(FileObject {
        id: row.try_get("id").map_err(db_err)?,
        owner_id: row.try_get("owner_id").map_err(db_err)?,
        demo_id: row.try_get("demo_id").map_err(db_err)?,
        bucket: row.try_get("bucket").map_err(db_err)?,
        object_key: row.try_get("object_key").map_err(db_err)?,
        original_filename: row.try_get("original_filename").map_err(db_err)?,
        declared_content_type: row.try_get("declared_content_type").map_err(db_err)?,
        checksum_sha256: row.try_get("checksum_sha256").map_err(db_err)?,
        checksum_verified: row.try_get("checksum_verified").map_err(db_err)?,
        size_bytes: row.try_get("size_bytes").map_err(db_err)?,
        sniffed_content_type: row.try_get("sniffed_content_type").map_err(db_err)?,
        state,
        upload_expires_at: row.try_get("upload_expires_at").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn counter_from_row(row: &PgRow) -> Result<UsageCounter, MetaStoreError> {
    Ok(UsageCounter {
        owner_id: row.try_get("owner_id").map_err(db_err)?,
        files_count: row.try_get("files_count").map_err(db_err)?,
        bytes_stored: row.try_get("bytes_stored").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

#[async_trait::async_trait]
impl MetaStore for PostgresDatabase {
    #[tracing::instrument(level = "debug", skip(self, user))]
    async fn create_user(&self, user: &User) -> Result<(), MetaStoreError> {
        let res = sqlx::query(
            "INSERT INTO users (id, email, password_hash, role, created_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(user.id)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.role.as_str())
        .bind(user.created_at)
        .execute(&self.pool)
        .await;

        match res {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(MetaStoreError::EmailTaken),
            Err(err) => Err(db_err(err)),
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_user(&self, id: Uuid) -> Result<Option<User>, MetaStoreError> {
        let row = sqlx::query("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(user_from_row).transpose()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, MetaStoreError> {
        let row = sqlx::query("SELECT * FROM users WHERE email = $1")
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(user_from_row).transpose()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn ensure_demo_user(&self, demo_id: Uuid) -> Result<User, MetaStoreError> {
        // Unusable password sentinel; demo users can never log in.
        sqlx::query(
            "INSERT INTO users (id, email, password_hash, role, created_at) \
             VALUES ($1, $2, '!', 'user', now()) ON CONFLICT (id) DO NOTHING",
        )
        .bind(demo_id)
        .bind(format!("demo-{demo_id}@demo.invalid"))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let row = sqlx::query("SELECT * FROM users WHERE id = $1")
            .bind(demo_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        user_from_row(&row)
    }

    #[tracing::instrument(level = "debug", skip(self, file))]
    async fn insert_file(&self, file: &FileObject) -> Result<(), MetaStoreError> {
        sqlx::query(
            "INSERT INTO file_objects (id, owner_id, demo_id, bucket, object_key, original_filename, \
             declared_content_type, checksum_sha256, checksum_verified, size_bytes, sniffed_content_type, \
             state, upload_expires_at, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
        )
        .bind(file.id)
        .bind(file.owner_id)
        .bind(file.demo_id)
        .bind(&file.bucket)
        .bind(&file.object_key)
        .bind(&file.original_filename)
        .bind(&file.declared_content_type)
        .bind(&file.checksum_sha256)
        .bind(file.checksum_verified)
        .bind(file.size_bytes)
        .bind(&file.sniffed_content_type)
        .bind(file.state.as_str())
        .bind(file.upload_expires_at)
        .bind(file.created_at)
        .bind(file.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_file(&self, id: Uuid) -> Result<Option<FileObject>, MetaStoreError> {
        let row = sqlx::query("SELECT * FROM file_objects WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(file_from_row).transpose()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_files(&self, owner_id: Uuid) -> Result<Vec<FileObject>, MetaStoreError> {
        let rows = sqlx::query("SELECT * FROM file_objects WHERE owner_id = $1 ORDER BY created_at DESC")
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(file_from_row).collect()
    }

    #[tracing::instrument(level = "debug", skip(self, update))]
    async fn transition_from_complete(&self, id: Uuid, update: &CompleteTransition) -> Result<bool, MetaStoreError> {
        if !FileState::Initiated.can_transition(update.state) {
            return Err(MetaStoreError::InvalidTransition {
                from: FileState::Initiated,
                to: update.state,
            });
        }

        let res = sqlx::query(
            "UPDATE file_objects SET state = $2, checksum_verified = $3, size_bytes = $4, \
             sniffed_content_type = $5, updated_at = now() WHERE id = $1 AND state = 'INITIATED'",
        )
        .bind(id)
        .bind(update.state.as_str())
        .bind(update.checksum_verified)
        .bind(update.size_bytes)
        .bind(&update.sniffed_content_type)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(res.rows_affected() > 0)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn transition_from_scan(
        &self,
        id: Uuid,
        to: FileState,
        size_bytes: Option<i64>,
        sniffed_content_type: Option<String>,
    ) -> Result<bool, MetaStoreError> {
        if !FileState::Scanning.can_transition(to) {
            return Err(MetaStoreError::InvalidTransition {
                from: FileState::Scanning,
                to,
            });
        }

        let res = sqlx::query(
            "UPDATE file_objects SET state = $2, size_bytes = COALESCE($3, size_bytes), \
             sniffed_content_type = COALESCE($4, sniffed_content_type), updated_at = now() \
             WHERE id = $1 AND state = 'SCANNING'",
        )
        .bind(id)
        .bind(to.as_str())
        .bind(size_bytes)
        .bind(sniffed_content_type)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(res.rows_affected() > 0)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn usage_for_owner(&self, owner_id: Uuid) -> Result<UsageCounter, MetaStoreError> {
        sqlx::query(
            "INSERT INTO usage_counters (owner_id, files_count, bytes_stored, updated_at) \
             VALUES ($1, 0, 0, now()) ON CONFLICT (owner_id) DO NOTHING",
        )
        .bind(owner_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let row = sqlx::query("SELECT * FROM usage_counters WHERE owner_id = $1")
            .bind(owner_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        counter_from_row(&row)
    }

    /// The row lock on the counter is the per-owner serial section: two
    /// concurrent activations for one owner queue up here.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn try_admit_active(
        &self,
        owner_id: Uuid,
        size_bytes: i64,
        max_files: i64,
        max_bytes: i64,
    ) -> Result<bool, MetaStoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            "INSERT INTO usage_counters (owner_id, files_count, bytes_stored, updated_at) \
             VALUES ($1, 0, 0, now()) ON CONFLICT (owner_id) DO NOTHING",
        )
        .bind(owner_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let row = sqlx::query("SELECT * FROM usage_counters WHERE owner_id = $1 FOR UPDATE")
            .bind(owner_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
        let counter = counter_from_row(&row)?;

        let new_files = counter.files_count + 1;
        let new_bytes = counter.bytes_stored + size_bytes;
        if new_files > max_files || new_bytes > max_bytes {
            tx.rollback().await.map_err(db_err)?;
            return Ok(false);
        }

        sqlx::query(
            "UPDATE usage_counters SET files_count = $2, bytes_stored = $3, updated_at = now() \
             WHERE owner_id = $1",
        )
        .bind(owner_id)
        .bind(new_files)
        .bind(new_bytes)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn release_usage(&self, owner_id: Uuid, size_bytes: i64) -> Result<(), MetaStoreError> {
        sqlx::query(
            "UPDATE usage_counters SET files_count = GREATEST(files_count - 1, 0), \
             bytes_stored = GREATEST(bytes_stored - $2, 0), updated_at = now() WHERE owner_id = $1",
        )
        .bind(owner_id)
        .bind(size_bytes)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, entry))]
    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), MetaStoreError> {
        sqlx::query(
            "INSERT INTO audit_events (id, actor_user_id, action, file_id, ip, user_agent, details, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, now())",
        )
        .bind(Uuid::new_v4())
        .bind(entry.actor_user_id)
        .bind(&entry.action)
        .bind(entry.file_id)
        .bind(&entry.ip)
        .bind(&entry.user_agent)
        .bind(&entry.details)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}
