//! Backend contract

use super::types::{BackendKind, Capabilities, StorageError, StorageResult, StoredObject, UploadMetadata};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// Abstraction over attachment storage backends
///
/// Every backend implements the core operations identically: paths returned by
/// [`upload`](Self::upload) are backend-relative and opaque to callers, who
/// persist them and pass them back to [`download`](Self::download),
/// [`delete`](Self::delete) and [`exists`](Self::exists).
///
/// # Implementation Requirements
///
/// Implementations must:
/// - Derive a fresh, never-reused path for every upload
/// - Reject any path failing
///   [`validate_storage_path`](crate::validation::validate_storage_path)
///   before touching I/O
/// - Treat a missing object as success in `delete` and `false` in `exists`
/// - Return [`StorageError::NotFound`] from `download` for a missing object
///
/// Optional operations are advertised through [`capabilities`](Self::capabilities).
/// Their default implementations return [`StorageError::Unsupported`] (or
/// `Ok(None)` for [`public_url`](Self::public_url)).
///
/// # Examples
///
/// ```rust,no_run
/// use bytes::Bytes;
/// use invoice_storage::storage::{AttachmentBackend, LocalBackend, UploadMetadata};
///
/// # async fn example() -> anyhow::Result<()> {
/// let backend = LocalBackend::new("/var/lib/invoices/uploads")?;
///
/// let meta = UploadMetadata::new("42", "alice", "invoice.pdf", "application/pdf");
/// let stored = backend.upload(Bytes::from_static(b"%PDF-1.7"), &meta).await?;
///
/// assert!(backend.exists(&stored.path).await?);
/// let data = backend.download(&stored.path).await?;
/// assert_eq!(&data[..], b"%PDF-1.7");
///
/// backend.delete(&stored.path).await?;
/// # Ok(())
/// # }
/// ```
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AttachmentBackend: Send + Sync {
    /// Which implementation this is
    fn kind(&self) -> BackendKind;

    /// Optional operations this backend implements
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Stores `data` under a path derived from `metadata`
    ///
    /// Expected failures (disk full, permission denied, remote rejection) are
    /// returned as typed errors, never panics.
    async fn upload(&self, data: Bytes, metadata: &UploadMetadata) -> StorageResult<StoredObject>;

    /// Reads an object into one contiguous buffer
    async fn download(&self, path: &str) -> StorageResult<Bytes>;

    /// Removes an object; deleting a missing object succeeds
    async fn delete(&self, path: &str) -> StorageResult<()>;

    /// Whether an object exists at `path`
    async fn exists(&self, path: &str) -> StorageResult<bool>;

    /// Moves an object to a new backend-relative path
    async fn move_object(&self, from: &str, to: &str) -> StorageResult<()> {
        let _ = (from, to);
        Err(StorageError::Unsupported {
            backend: self.kind(),
            operation: "move_object",
        })
    }

    /// Stores `data` at exactly `path`, bypassing path derivation
    async fn upload_to_path(&self, data: Bytes, path: &str) -> StorageResult<StoredObject> {
        let _ = (data, path);
        Err(StorageError::Unsupported {
            backend: self.kind(),
            operation: "upload_to_path",
        })
    }

    /// A URL at which the object can be viewed, for backends that have one
    async fn public_url(&self, path: &str) -> StorageResult<Option<String>> {
        let _ = path;
        Ok(None)
    }
}

/// Shared, dynamically dispatched backend
pub type SharedBackend = Arc<dyn AttachmentBackend>;
