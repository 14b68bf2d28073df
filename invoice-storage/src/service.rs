//! Attachment operations over a backend and a metadata store

use crate::config::StorageSettings;
use crate::error::AttachmentError;
use crate::repository::{AttachmentRecord, SharedRepository};
use crate::storage::{SharedBackend, UploadMetadata};
use crate::validation::{validate_file_upload, UploadRules};
use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Validated uploads with quota, plus soft-delete aware reads
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use bytes::Bytes;
/// use invoice_storage::config::StorageSettings;
/// use invoice_storage::repository::InMemoryAttachmentRepository;
/// use invoice_storage::service::AttachmentService;
/// use invoice_storage::storage::{create_backend, UploadMetadata};
///
/// # async fn example() -> anyhow::Result<()> {
/// let settings = StorageSettings::default();
/// let service = AttachmentService::new(
///     create_backend(&settings)?,
///     Arc::new(InMemoryAttachmentRepository::new()),
///     &settings,
/// );
///
/// let meta = UploadMetadata::new("INV-1", "alice", "scan.pdf", "application/pdf");
/// let record = service
///     .upload_attachment(Bytes::from_static(b"%PDF-1.7 ..."), meta)
///     .await?;
/// println!("attachment {} stored at {}", record.id, record.storage_path);
/// # Ok(())
/// # }
/// ```
pub struct AttachmentService {
    backend: SharedBackend,
    repository: SharedRepository,
    rules: UploadRules,
    max_files_per_invoice: u32,
}

impl std::fmt::Debug for AttachmentService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachmentService")
            .field("backend", &self.backend.kind())
            .field("rules", &self.rules)
            .field("max_files_per_invoice", &self.max_files_per_invoice)
            .finish_non_exhaustive()
    }
}

impl AttachmentService {
    /// Create a service using the limits in `settings`
    #[must_use]
    pub fn new(
        backend: SharedBackend,
        repository: SharedRepository,
        settings: &StorageSettings,
    ) -> Self {
        Self {
            backend,
            repository,
            rules: UploadRules::from_settings(settings),
            max_files_per_invoice: settings.max_files_per_invoice,
        }
    }

    /// Upload rules in effect
    #[must_use]
    pub const fn rules(&self) -> &UploadRules {
        &self.rules
    }

    /// Validates, stores and records an attachment
    ///
    /// Nothing reaches the backend unless validation and the per-invoice
    /// quota pass. The quota is checked again when the record is stored, so
    /// concurrent uploads to one invoice cannot overshoot it. If the record
    /// cannot be stored the uploaded object is removed again.
    ///
    /// # Errors
    ///
    /// Returns `Validation` with every violated rule, `QuotaExceeded`, or the
    /// storage or repository error that stopped the upload.
    pub async fn upload_attachment(
        &self,
        data: Bytes,
        metadata: UploadMetadata,
    ) -> Result<AttachmentRecord, AttachmentError> {
        validate_file_upload(&data, &metadata.original_name, &metadata.mime_type, &self.rules)
            .map_err(|violations| {
                debug!(
                    invoice_id = %metadata.invoice_id,
                    filename = %metadata.original_name,
                    violations = violations.len(),
                    "attachment rejected"
                );
                AttachmentError::Validation(violations)
            })?;

        let active = self
            .repository
            .count_active_for_invoice(&metadata.invoice_id)
            .await?;
        if active >= u64::from(self.max_files_per_invoice) {
            return Err(AttachmentError::QuotaExceeded {
                invoice_id: metadata.invoice_id,
                max: self.max_files_per_invoice,
            });
        }

        let stored = self.backend.upload(data, &metadata).await?;
        let record = AttachmentRecord::new(&stored, &metadata, Utc::now());

        let rejection = match self
            .repository
            .insert_within_quota(&record, self.max_files_per_invoice)
            .await
        {
            Ok(true) => None,
            Ok(false) => {
                warn!(path = %stored.path, "quota filled during upload, removing uploaded object");
                Some(AttachmentError::QuotaExceeded {
                    invoice_id: metadata.invoice_id,
                    max: self.max_files_per_invoice,
                })
            }
            Err(e) => {
                warn!(path = %stored.path, error = %e, "record insert failed, removing uploaded object");
                Some(e.into())
            }
        };
        if let Some(err) = rejection {
            if let Err(cleanup) = self.backend.delete(&stored.path).await {
                warn!(path = %stored.path, error = %cleanup, "failed to remove orphaned object");
            }
            return Err(err);
        }

        info!(
            id = %record.id,
            invoice_id = %record.invoice_id,
            path = %record.storage_path,
            size = record.size,
            "attachment uploaded"
        );
        Ok(record)
    }

    /// Record and content of an active attachment
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, `Deleted` for soft-deleted records, or the backend
    /// error from the download.
    pub async fn open_attachment(&self, id: Uuid) -> Result<(AttachmentRecord, Bytes), AttachmentError> {
        let record = self.active_record(id).await?;
        let data = self.backend.download(&record.storage_path).await?;
        Ok((record, data))
    }

    /// Shareable URL of an active attachment, when the backend has one
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, `Deleted`, or the backend error.
    pub async fn attachment_url(&self, id: Uuid) -> Result<Option<String>, AttachmentError> {
        let record = self.active_record(id).await?;
        Ok(self.backend.public_url(&record.storage_path).await?)
    }

    /// Active attachments of an invoice
    ///
    /// # Errors
    ///
    /// Returns a repository error if the query fails.
    pub async fn list_attachments(
        &self,
        invoice_id: &str,
    ) -> Result<Vec<AttachmentRecord>, AttachmentError> {
        Ok(self.repository.list_for_invoice(invoice_id).await?)
    }

    /// Soft-deletes an attachment; the object stays until cleanup
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, `Deleted` if it already is, or a repository error.
    pub async fn delete_attachment(&self, id: Uuid, deleted_by: &str) -> Result<(), AttachmentError> {
        self.active_record(id).await?;
        if !self.repository.soft_delete(id, deleted_by, Utc::now()).await? {
            return Err(AttachmentError::Deleted(id));
        }
        info!(id = %id, deleted_by, "attachment soft-deleted");
        Ok(())
    }

    async fn active_record(&self, id: Uuid) -> Result<AttachmentRecord, AttachmentError> {
        let record = self
            .repository
            .get(id)
            .await?
            .ok_or(AttachmentError::NotFound(id))?;
        if record.is_deleted() {
            return Err(AttachmentError::Deleted(id));
        }
        Ok(record)
    }
}
