//! invoice-storage: attachment storage for invoices
//!
//! Stores invoice attachments on the local filesystem or in a SharePoint
//! document library behind one async contract, validates uploads before they
//! reach a backend, and cleans up soft-deleted attachments after a retention
//! window.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use invoice_storage::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     observability::init()?;
//!
//!     let config = StorageConfig::load()?;
//!     for issue in validate_settings(&config.storage) {
//!         tracing::warn!(%issue, "storage misconfigured");
//!     }
//!
//!     let backend = create_backend(&config.storage)?;
//!     let repository = Arc::new(InMemoryAttachmentRepository::new());
//!     let service = AttachmentService::new(backend, repository, &config.storage);
//!
//!     let meta = UploadMetadata::new("INV-1", "alice", "scan.pdf", "application/pdf");
//!     let record = service
//!         .upload_attachment(Bytes::from_static(b"%PDF-1.7 ..."), meta)
//!         .await?;
//!     println!("stored {}", record.storage_path);
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `postgres` - `PostgreSQL` metadata store (default)

pub mod cleanup;
pub mod config;
pub mod error;
pub mod observability;
pub mod repository;
pub mod service;
pub mod storage;
pub mod validation;

pub mod prelude {
    //! Convenience re-exports for common types and traits
    //!
    //! # Examples
    //!
    //! ```rust
    //! use invoice_storage::prelude::*;
    //! ```

    // Configuration
    pub use crate::config::{CleanupSettings, StorageConfig, StorageSettings};

    // Storage backends
    pub use crate::storage::{
        create_backend, validate_settings, AttachmentBackend, BackendKind, Capabilities,
        ConfigIssue, ErrorCode, LocalBackend, SharePointBackend, SharedBackend, StorageError,
        StorageProvider, StorageResult, StoredObject, UploadMetadata,
    };

    // Validation
    pub use crate::validation::{validate_file_upload, UploadRules, ValidationError};

    // Metadata store
    #[cfg(feature = "postgres")]
    pub use crate::repository::PgAttachmentRepository;
    pub use crate::repository::{
        AttachmentRecord, AttachmentRepository, InMemoryAttachmentRepository, PendingStats,
    };

    // Services
    pub use crate::cleanup::{CleanupReport, CleanupService};
    pub use crate::service::AttachmentService;

    // Error types
    pub use crate::error::{AttachmentError, CleanupError, RepositoryError};

    pub use crate::observability;
}
