//! Attachment metadata store
//!
//! The storage backends only hold bytes. Which invoice an object belongs to,
//! who uploaded it and whether it has been soft-deleted lives in an
//! [`AttachmentRepository`]. Two implementations are provided:
//!
//! - [`InMemoryAttachmentRepository`]: process-local, for tests and development
//! - [`PgAttachmentRepository`]: PostgreSQL through `sqlx` (feature `postgres`)

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryAttachmentRepository;
#[cfg(feature = "postgres")]
pub use postgres::PgAttachmentRepository;

use crate::error::RepositoryError;
use crate::storage::{StoredObject, UploadMetadata};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Result alias for metadata store operations
pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// One attachment's metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRecord {
    /// Record id
    pub id: Uuid,
    /// Owning invoice
    pub invoice_id: String,
    /// Backend path returned by `upload`
    pub storage_path: String,
    /// Name the user uploaded
    pub original_name: String,
    /// Size in bytes
    pub size: u64,
    /// Declared MIME type
    pub mime_type: String,
    /// Uploading user
    pub uploaded_by: String,
    /// Upload time
    pub created_at: DateTime<Utc>,
    /// Soft-delete time
    pub deleted_at: Option<DateTime<Utc>>,
    /// Soft-deleting user
    pub deleted_by: Option<String>,
}

impl AttachmentRecord {
    /// Builds an active record for a freshly stored object
    #[must_use]
    pub fn new(stored: &StoredObject, metadata: &UploadMetadata, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            invoice_id: metadata.invoice_id.clone(),
            storage_path: stored.path.clone(),
            original_name: metadata.original_name.clone(),
            size: stored.size,
            mime_type: metadata.mime_type.clone(),
            uploaded_by: metadata.uploaded_by.clone(),
            created_at,
            deleted_at: None,
            deleted_by: None,
        }
    }

    /// Whether the record is soft-deleted
    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Position of this record in the cleanup ordering
    #[must_use]
    pub fn cursor(&self) -> Option<PageCursor> {
        self.deleted_at.map(|deleted_at| PageCursor {
            deleted_at,
            id: self.id,
        })
    }
}

/// Keyset position in the `(deleted_at, id)` ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PageCursor {
    /// Soft-delete time of the last record seen
    pub deleted_at: DateTime<Utc>,
    /// Id of the last record seen
    pub id: Uuid,
}

/// Aggregates over soft-deleted records
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PendingStats {
    /// Soft-deleted records
    pub count: u64,
    /// Earliest `deleted_at`
    pub oldest: Option<DateTime<Utc>>,
    /// Latest `deleted_at`
    pub newest: Option<DateTime<Utc>>,
    /// Sum of their sizes
    pub total_bytes: u64,
    /// How many are past the retention cutoff
    pub eligible: u64,
}

/// Attachment metadata persistence
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AttachmentRepository: Send + Sync {
    /// Stores a new record
    ///
    /// Fails with `Conflict` if another record has the same storage path.
    async fn insert(&self, record: &AttachmentRecord) -> RepositoryResult<()>;

    /// Stores a new record unless its invoice already has `max_active`
    /// active records; `false` when the quota is full
    ///
    /// The count and the insert are atomic with respect to other calls for
    /// the same invoice.
    async fn insert_within_quota(
        &self,
        record: &AttachmentRecord,
        max_active: u32,
    ) -> RepositoryResult<bool>;

    /// Looks a record up by id, deleted or not
    async fn get(&self, id: Uuid) -> RepositoryResult<Option<AttachmentRecord>>;

    /// Active (not soft-deleted) records of one invoice
    async fn list_for_invoice(&self, invoice_id: &str) -> RepositoryResult<Vec<AttachmentRecord>>;

    /// Number of active records of one invoice
    async fn count_active_for_invoice(&self, invoice_id: &str) -> RepositoryResult<u64>;

    /// Marks a record deleted; `false` if it is missing or already deleted
    async fn soft_delete(
        &self,
        id: Uuid,
        deleted_by: &str,
        at: DateTime<Utc>,
    ) -> RepositoryResult<bool>;

    /// Soft-deleted records with `deleted_at < cutoff`, ordered by
    /// `(deleted_at, id)`, strictly after `after` when given
    async fn list_soft_deleted_before(
        &self,
        cutoff: DateTime<Utc>,
        after: Option<PageCursor>,
        limit: u32,
    ) -> RepositoryResult<Vec<AttachmentRecord>>;

    /// Removes a record; `false` if it did not exist
    async fn hard_delete(&self, id: Uuid) -> RepositoryResult<bool>;

    /// Clears `deleted_at` and `deleted_by`; `false` unless the record was soft-deleted
    async fn restore(&self, id: Uuid) -> RepositoryResult<bool>;

    /// Aggregates over all soft-deleted records
    async fn pending_stats(&self, cutoff: DateTime<Utc>) -> RepositoryResult<PendingStats>;

    /// Takes the named lease unless someone else holds an unexpired one
    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> RepositoryResult<bool>;

    /// Gives the lease up if `holder` still owns it
    async fn release_lease(&self, name: &str, holder: &str) -> RepositoryResult<()>;
}

/// Shared handle to a repository
pub type SharedRepository = Arc<dyn AttachmentRepository>;

/// Lease expiry for `ttl` from `now`, saturating on overflow
pub(crate) fn lease_expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
