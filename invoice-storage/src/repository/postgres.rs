//! PostgreSQL metadata store

use super::{
    lease_expiry, AttachmentRecord, AttachmentRepository, PageCursor, PendingStats,
    RepositoryResult,
};
use crate::error::RepositoryError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgExecutor, PgPool};
use std::time::Duration;
use uuid::Uuid;

const MIGRATION: &str = include_str!("../../migrations/0001_attachments.sql");

const RECORD_COLUMNS: &str = "id, invoice_id, storage_path, original_name, size, mime_type, \
                              uploaded_by, created_at, deleted_at, deleted_by";

#[derive(Debug, FromRow)]
struct AttachmentRow {
    id: Uuid,
    invoice_id: String,
    storage_path: String,
    original_name: String,
    size: i64,
    mime_type: String,
    uploaded_by: String,
    created_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
    deleted_by: Option<String>,
}

impl TryFrom<AttachmentRow> for AttachmentRecord {
    type Error = RepositoryError;

    fn try_from(row: AttachmentRow) -> Result<Self, Self::Error> {
        let size = u64::try_from(row.size)
            .map_err(|_| RepositoryError::Corrupt(format!("negative size on {}", row.id)))?;
        Ok(Self {
            id: row.id,
            invoice_id: row.invoice_id,
            storage_path: row.storage_path,
            original_name: row.original_name,
            size,
            mime_type: row.mime_type,
            uploaded_by: row.uploaded_by,
            created_at: row.created_at,
            deleted_at: row.deleted_at,
            deleted_by: row.deleted_by,
        })
    }
}

fn to_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

async fn insert_record<'e, E>(executor: E, record: &AttachmentRecord) -> RepositoryResult<()>
where
    E: PgExecutor<'e>,
{
    let size = i64::try_from(record.size)
        .map_err(|_| RepositoryError::Unavailable(format!("size {} out of range", record.size)))?;

    sqlx::query(
        r"
        INSERT INTO attachments (id, invoice_id, storage_path, original_name, size,
                                 mime_type, uploaded_by, created_at, deleted_at, deleted_by)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ",
    )
    .bind(record.id)
    .bind(&record.invoice_id)
    .bind(&record.storage_path)
    .bind(&record.original_name)
    .bind(size)
    .bind(&record.mime_type)
    .bind(&record.uploaded_by)
    .bind(record.created_at)
    .bind(record.deleted_at)
    .bind(&record.deleted_by)
    .execute(executor)
    .await?;

    Ok(())
}

/// [`AttachmentRepository`] over a PostgreSQL pool
///
/// Uses the `attachments` and `maintenance_leases` tables created by
/// [`PgAttachmentRepository::migrate`].
#[derive(Debug, Clone)]
pub struct PgAttachmentRepository {
    pool: PgPool,
}

impl PgAttachmentRepository {
    /// Wrap an existing pool
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url`
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub async fn connect(database_url: &str) -> RepositoryResult<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self::new(pool))
    }

    /// Create the tables and indexes if they do not exist
    ///
    /// # Errors
    ///
    /// Returns an error if any DDL statement fails.
    pub async fn migrate(&self) -> RepositoryResult<()> {
        sqlx::raw_sql(MIGRATION).execute(&self.pool).await?;
        Ok(())
    }

    /// The underlying pool
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl AttachmentRepository for PgAttachmentRepository {
    async fn insert(&self, record: &AttachmentRecord) -> RepositoryResult<()> {
        insert_record(&self.pool, record).await
    }

    async fn insert_within_quota(
        &self,
        record: &AttachmentRecord,
        max_active: u32,
    ) -> RepositoryResult<bool> {
        let mut tx = self.pool.begin().await?;

        // serializes quota checks per invoice until commit
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&record.invoice_id)
            .execute(&mut *tx)
            .await?;

        let active: (i64,) = sqlx::query_as(
            r"
            SELECT COUNT(*) FROM attachments WHERE invoice_id = $1 AND deleted_at IS NULL
            ",
        )
        .bind(&record.invoice_id)
        .fetch_one(&mut *tx)
        .await?;
        if to_count(active.0) >= u64::from(max_active) {
            return Ok(false);
        }

        insert_record(&mut *tx, record).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn get(&self, id: Uuid) -> RepositoryResult<Option<AttachmentRecord>> {
        let query = format!("SELECT {RECORD_COLUMNS} FROM attachments WHERE id = $1");
        sqlx::query_as::<_, AttachmentRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(AttachmentRecord::try_from)
            .transpose()
    }

    async fn list_for_invoice(&self, invoice_id: &str) -> RepositoryResult<Vec<AttachmentRecord>> {
        let query = format!(
            "SELECT {RECORD_COLUMNS} FROM attachments \
             WHERE invoice_id = $1 AND deleted_at IS NULL \
             ORDER BY created_at, id"
        );
        sqlx::query_as::<_, AttachmentRow>(&query)
            .bind(invoice_id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(AttachmentRecord::try_from)
            .collect()
    }

    async fn count_active_for_invoice(&self, invoice_id: &str) -> RepositoryResult<u64> {
        let count: (i64,) = sqlx::query_as(
            r"
            SELECT COUNT(*) FROM attachments WHERE invoice_id = $1 AND deleted_at IS NULL
            ",
        )
        .bind(invoice_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(to_count(count.0))
    }

    async fn soft_delete(
        &self,
        id: Uuid,
        deleted_by: &str,
        at: DateTime<Utc>,
    ) -> RepositoryResult<bool> {
        let result = sqlx::query(
            r"
            UPDATE attachments
            SET deleted_at = $2, deleted_by = $3
            WHERE id = $1 AND deleted_at IS NULL
            ",
        )
        .bind(id)
        .bind(at)
        .bind(deleted_by)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_soft_deleted_before(
        &self,
        cutoff: DateTime<Utc>,
        after: Option<PageCursor>,
        limit: u32,
    ) -> RepositoryResult<Vec<AttachmentRecord>> {
        let query = format!(
            "SELECT {RECORD_COLUMNS} FROM attachments \
             WHERE deleted_at IS NOT NULL AND deleted_at < $1 \
               AND ($2::TIMESTAMPTZ IS NULL OR (deleted_at, id) > ($2, $3)) \
             ORDER BY deleted_at, id \
             LIMIT $4"
        );
        sqlx::query_as::<_, AttachmentRow>(&query)
            .bind(cutoff)
            .bind(after.map(|c| c.deleted_at))
            .bind(after.map(|c| c.id))
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(AttachmentRecord::try_from)
            .collect()
    }

    async fn hard_delete(&self, id: Uuid) -> RepositoryResult<bool> {
        let result = sqlx::query("DELETE FROM attachments WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn restore(&self, id: Uuid) -> RepositoryResult<bool> {
        let result = sqlx::query(
            r"
            UPDATE attachments
            SET deleted_at = NULL, deleted_by = NULL
            WHERE id = $1 AND deleted_at IS NOT NULL
            ",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn pending_stats(&self, cutoff: DateTime<Utc>) -> RepositoryResult<PendingStats> {
        let (count, oldest, newest, total_bytes, eligible): (
            i64,
            Option<DateTime<Utc>>,
            Option<DateTime<Utc>>,
            i64,
            i64,
        ) = sqlx::query_as(
            r"
            SELECT COUNT(*),
                   MIN(deleted_at),
                   MAX(deleted_at),
                   COALESCE(SUM(size), 0)::BIGINT,
                   COUNT(*) FILTER (WHERE deleted_at < $1)
            FROM attachments
            WHERE deleted_at IS NOT NULL
            ",
        )
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;

        Ok(PendingStats {
            count: to_count(count),
            oldest,
            newest,
            total_bytes: to_count(total_bytes),
            eligible: to_count(eligible),
        })
    }

    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> RepositoryResult<bool> {
        let expires_at = lease_expiry(Utc::now(), ttl);

        let result = sqlx::query(
            r"
            INSERT INTO maintenance_leases (name, holder, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (name) DO UPDATE
            SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at
            WHERE maintenance_leases.expires_at <= NOW()
               OR maintenance_leases.holder = EXCLUDED.holder
            ",
        )
        .bind(name)
        .bind(holder)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_lease(&self, name: &str, holder: &str) -> RepositoryResult<()> {
        sqlx::query("DELETE FROM maintenance_leases WHERE name = $1 AND holder = $2")
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
