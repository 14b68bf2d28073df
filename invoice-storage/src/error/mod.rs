//! Error types above the storage layer
//!
//! Backend failures are [`StorageError`]; validation failures are
//! [`ValidationError`]. The enums here wrap them for the metadata store, the
//! cleanup service and the attachment service.

use crate::storage::types::BoxError;
use crate::storage::StorageError;
use crate::validation::ValidationError;
use thiserror::Error;
use uuid::Uuid;

/// Metadata store error
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[source] BoxError),

    /// A stored row could not be mapped to a record
    #[error("Corrupt attachment row: {0}")]
    Corrupt(String),

    /// Store unavailable or rejected the operation
    #[error("Metadata store error: {0}")]
    Unavailable(String),

    /// Another record already uses this storage path
    #[error("Storage path already recorded: {0}")]
    Conflict(String),
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db.is_unique_violation() {
                return Self::Conflict(db.message().to_string());
            }
        }
        Self::Database(Box::new(err))
    }
}

/// Cleanup and admin operation error
#[derive(Debug, Error)]
pub enum CleanupError {
    /// No record with this id
    #[error("Attachment {0} not found")]
    NotFound(Uuid),

    /// Restore requested for a record that is not soft-deleted
    #[error("Attachment {0} is not deleted")]
    NotSoftDeleted(Uuid),

    /// Restore refused because the object is gone
    #[error("Attachment {id}: physical file no longer exists, cannot restore ({path})")]
    PhysicalFileMissing {
        /// Record id
        id: Uuid,
        /// Storage path the record points at
        path: String,
    },

    /// Another process holds the cleanup lease
    #[error("Cleanup already running (lease {lease} is held)")]
    AlreadyRunning {
        /// Lease name
        lease: String,
    },

    /// Backend failure
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Metadata store failure
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Attachment service error
#[derive(Debug, Error)]
pub enum AttachmentError {
    /// The upload broke one or more validation rules
    #[error("Invalid attachment: {}", join_violations(.0))]
    Validation(Vec<ValidationError>),

    /// The invoice already has the maximum number of attachments
    #[error("Invoice {invoice_id} already has {max} attachments")]
    QuotaExceeded {
        /// Invoice id
        invoice_id: String,
        /// Configured limit
        max: u32,
    },

    /// No record with this id
    #[error("Attachment {0} not found")]
    NotFound(Uuid),

    /// The record is soft-deleted
    #[error("Attachment {0} has been deleted")]
    Deleted(Uuid),

    /// Backend failure
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Metadata store failure
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl AttachmentError {
    /// Validation violations, if this is a validation failure
    #[must_use]
    pub fn violations(&self) -> &[ValidationError] {
        match self {
            Self::Validation(v) => v,
            _ => &[],
        }
    }
}

fn join_violations(violations: &[ValidationError]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
