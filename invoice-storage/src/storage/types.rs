//! Core types for attachment storage

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;

/// Boxed underlying cause carried by storage errors
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Stable error codes exposed to callers
///
/// `Display` renders the upper-snake form (`FILE_NOT_FOUND`, ...) so codes can be
/// passed through to API responses unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The object does not exist
    FileNotFound,
    /// The backend refused access
    PermissionDenied,
    /// The backend ran out of space
    DiskFull,
    /// The path failed the path-safety check
    InvalidPath,
    /// Upload failed for another reason
    UploadFailed,
    /// Delete failed for another reason
    DeleteFailed,
    /// Download failed for another reason
    DownloadFailed,
    /// Move failed for another reason
    MoveFailed,
    /// The backend lacks an optional capability
    Unsupported,
    /// Backend could not be constructed from configuration
    Configuration,
}

impl ErrorCode {
    /// Upper-snake representation of the code
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FileNotFound => "FILE_NOT_FOUND",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::DiskFull => "DISK_FULL",
            Self::InvalidPath => "INVALID_PATH",
            Self::UploadFailed => "UPLOAD_FAILED",
            Self::DeleteFailed => "DELETE_FAILED",
            Self::DownloadFailed => "DOWNLOAD_FAILED",
            Self::MoveFailed => "MOVE_FAILED",
            Self::Unsupported => "UNSUPPORTED",
            Self::Configuration => "CONFIGURATION",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage operation that produced an error, used to pick the fallback code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// `upload` / `upload_to_path`
    Upload,
    /// `download`
    Download,
    /// `delete`
    Delete,
    /// `move_object`
    Move,
    /// `exists`
    Exists,
}

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// Object not found in storage
    #[error("File not found: {0}")]
    NotFound(String),

    /// The backend denied access to the object or its directory
    #[error("Permission denied: {path}")]
    PermissionDenied {
        /// Path that was being accessed
        path: String,
        /// Underlying cause
        #[source]
        source: Option<BoxError>,
    },

    /// The backend ran out of space or quota
    #[error("Insufficient storage space while writing {path}")]
    DiskFull {
        /// Path that was being written
        path: String,
        /// Underlying cause
        #[source]
        source: Option<BoxError>,
    },

    /// Invalid or unsafe storage path
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Upload failed
    #[error("Upload failed: {message}")]
    UploadFailed {
        /// Description of the failure
        message: String,
        /// Underlying cause
        #[source]
        source: Option<BoxError>,
    },

    /// Delete failed
    #[error("Delete failed: {message}")]
    DeleteFailed {
        /// Description of the failure
        message: String,
        /// Underlying cause
        #[source]
        source: Option<BoxError>,
    },

    /// Download failed
    #[error("Download failed: {message}")]
    DownloadFailed {
        /// Description of the failure
        message: String,
        /// Underlying cause
        #[source]
        source: Option<BoxError>,
    },

    /// Move failed
    #[error("Move failed: {message}")]
    MoveFailed {
        /// Description of the failure
        message: String,
        /// Underlying cause
        #[source]
        source: Option<BoxError>,
    },

    /// The backend does not implement an optional capability
    #[error("{backend} backend does not support {operation}")]
    Unsupported {
        /// Backend that was asked
        backend: BackendKind,
        /// Name of the unsupported operation
        operation: &'static str,
    },

    /// Backend could not be built from configuration
    #[error("Storage configuration error: {0}")]
    Configuration(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    /// Returns the caller-facing error code
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::FileNotFound,
            Self::PermissionDenied { .. } => ErrorCode::PermissionDenied,
            Self::DiskFull { .. } => ErrorCode::DiskFull,
            Self::InvalidPath(_) => ErrorCode::InvalidPath,
            Self::UploadFailed { .. } => ErrorCode::UploadFailed,
            Self::DeleteFailed { .. } => ErrorCode::DeleteFailed,
            Self::DownloadFailed { .. } => ErrorCode::DownloadFailed,
            Self::MoveFailed { .. } => ErrorCode::MoveFailed,
            Self::Unsupported { .. } => ErrorCode::Unsupported,
            Self::Configuration(_) => ErrorCode::Configuration,
        }
    }

    /// Builds the generic failure variant for an operation
    pub fn failed<E>(operation: Operation, message: impl Into<String>, source: Option<E>) -> Self
    where
        E: Into<BoxError>,
    {
        let message = message.into();
        let source = source.map(Into::into);
        match operation {
            Operation::Upload => Self::UploadFailed { message, source },
            Operation::Delete => Self::DeleteFailed { message, source },
            Operation::Move => Self::MoveFailed { message, source },
            Operation::Download | Operation::Exists => Self::DownloadFailed { message, source },
        }
    }

    /// Same as [`StorageError::failed`] without an underlying cause
    pub fn failed_msg(operation: Operation, message: impl Into<String>) -> Self {
        Self::failed::<BoxError>(operation, message, None)
    }

    /// Maps an I/O error onto the taxonomy
    ///
    /// Missing files become `NotFound` except during uploads, where a missing
    /// directory is an upload failure. Callers that treat missing as success
    /// (delete, exists) must check `io::ErrorKind::NotFound` before calling this.
    #[must_use]
    pub fn from_io(err: io::Error, operation: Operation, path: &str) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound if operation != Operation::Upload => {
                Self::NotFound(path.to_string())
            }
            io::ErrorKind::PermissionDenied => Self::PermissionDenied {
                path: path.to_string(),
                source: Some(Box::new(err)),
            },
            io::ErrorKind::StorageFull | io::ErrorKind::QuotaExceeded => Self::DiskFull {
                path: path.to_string(),
                source: Some(Box::new(err)),
            },
            _ => Self::failed(operation, format!("{path}: {err}"), Some(err)),
        }
    }
}

/// Identifies a backend implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Local filesystem
    Local,
    /// SharePoint document library reached through Microsoft Graph
    SharePoint,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::SharePoint => f.write_str("sharepoint"),
        }
    }
}

/// Optional operations a backend supports beyond the core contract
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// `move_object` is implemented
    pub move_objects: bool,
    /// `upload_to_path` is implemented
    pub upload_to_path: bool,
    /// `public_url` can return a URL
    pub public_urls: bool,
}

/// Metadata accompanying an upload
///
/// Only `invoice_date` and `recurring_profile` influence where the object is
/// placed; the rest is descriptive and round-tripped to the metadata store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadMetadata {
    /// Invoice the attachment belongs to
    pub invoice_id: String,
    /// User performing the upload
    pub uploaded_by: String,
    /// Original filename as supplied by the client
    pub original_name: String,
    /// Declared MIME type
    pub mime_type: String,
    /// Invoice date, used for year/month path segments
    pub invoice_date: Option<NaiveDate>,
    /// Recurring profile name for recurring invoices
    pub recurring_profile: Option<String>,
}

impl UploadMetadata {
    /// Creates metadata for a one-time invoice
    #[must_use]
    pub fn new(
        invoice_id: impl Into<String>,
        uploaded_by: impl Into<String>,
        original_name: impl Into<String>,
        mime_type: impl Into<String>,
    ) -> Self {
        Self {
            invoice_id: invoice_id.into(),
            uploaded_by: uploaded_by.into(),
            original_name: original_name.into(),
            mime_type: mime_type.into(),
            invoice_date: None,
            recurring_profile: None,
        }
    }

    /// Sets the invoice date
    #[must_use]
    pub const fn with_invoice_date(mut self, date: NaiveDate) -> Self {
        self.invoice_date = Some(date);
        self
    }

    /// Marks the invoice as belonging to a recurring profile
    #[must_use]
    pub fn with_recurring_profile(mut self, profile: impl Into<String>) -> Self {
        self.recurring_profile = Some(profile.into());
        self
    }
}

/// An object that has been written to a backend
///
/// `path` is backend-relative and only meaningful to the backend that
/// produced it. Callers persist it verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredObject {
    /// Backend-relative storage path
    pub path: String,

    /// Size in bytes as written
    pub size: u64,

    /// Backend item identifier, when the backend assigns one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
}

impl StoredObject {
    /// Creates a stored object descriptor
    #[must_use]
    pub fn new(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
            item_id: None,
        }
    }
}

impl fmt::Display for StoredObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StoredObject(path={}, size={})", self.path, self.size)
    }
}
