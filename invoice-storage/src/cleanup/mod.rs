//! Lifecycle cleanup of soft-deleted attachments
//!
//! Soft-deleted records keep their object around for a retention window so an
//! admin can restore them. [`CleanupService::run_batch`] reconciles records
//! past that window against the backend: the object is deleted first, then the
//! record, so a crash in between leaves a record that the next run retries.
//!
//! Scheduling is left to the embedding application.
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use invoice_storage::cleanup::CleanupService;
//! use invoice_storage::config::StorageConfig;
//! use invoice_storage::repository::InMemoryAttachmentRepository;
//! use invoice_storage::storage::create_backend;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = StorageConfig::load()?;
//! let backend = create_backend(&config.storage)?;
//! let repository = Arc::new(InMemoryAttachmentRepository::new());
//!
//! let cleanup = CleanupService::new(backend, repository, config.cleanup);
//! let report = cleanup.run_batch(false, None).await?;
//! println!("removed {} files", report.deleted_files);
//! # Ok(())
//! # }
//! ```

use crate::config::CleanupSettings;
use crate::error::CleanupError;
use crate::repository::{AttachmentRecord, PageCursor, PendingStats, SharedRepository};
use crate::storage::{SharedBackend, StorageError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lease name shared by every cleanup run
pub const CLEANUP_LEASE: &str = "attachment-cleanup";

/// Outcome of one cleanup run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Objects removed from the backend (would be removed, in a dry run)
    pub deleted_files: u64,
    /// Records hard-deleted (would be deleted, in a dry run)
    pub deleted_records: u64,
    /// Records whose object was already gone
    pub skipped: u64,
    /// One message per record that failed
    pub errors: Vec<String>,
    /// Whether this was a dry run
    pub dry_run: bool,
    /// Pages fetched
    pub pages: u32,
    /// `false` if any record failed
    pub success: bool,
}

enum Outcome {
    Deleted { record_removed: bool },
    Skipped,
}

/// Reconciles soft-deleted records with the backend
pub struct CleanupService {
    backend: SharedBackend,
    repository: SharedRepository,
    settings: CleanupSettings,
    holder: String,
}

impl std::fmt::Debug for CleanupService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupService")
            .field("backend", &self.backend.kind())
            .field("settings", &self.settings)
            .field("holder", &self.holder)
            .finish_non_exhaustive()
    }
}

impl CleanupService {
    /// Create a cleanup service
    #[must_use]
    pub fn new(
        backend: SharedBackend,
        repository: SharedRepository,
        settings: CleanupSettings,
    ) -> Self {
        Self {
            backend,
            repository,
            settings,
            holder: format!("cleanup-{}", Uuid::new_v4().simple()),
        }
    }

    /// Settings in use
    #[must_use]
    pub const fn settings(&self) -> &CleanupSettings {
        &self.settings
    }

    /// Records soft-deleted before this time are eligible
    ///
    /// # Errors
    ///
    /// Returns a `Configuration` storage error when the retention window
    /// reaches past the earliest representable date.
    pub fn cutoff(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, CleanupError> {
        now.checked_sub_signed(self.settings.retention()).ok_or_else(|| {
            StorageError::Configuration(format!(
                "cleanup.retention_days = {} is out of range",
                self.settings.retention_days
            ))
            .into()
        })
    }

    /// Runs one cleanup pass
    ///
    /// Walks eligible records page by page until a short page, or until
    /// `max_pages` pages when given. Per-record failures are collected in the
    /// report and leave the record soft-deleted for the next run. A dry run
    /// changes nothing and does not take the lease.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyRunning` if another run holds the lease, or a
    /// repository error if a page cannot be fetched.
    pub async fn run_batch(
        &self,
        dry_run: bool,
        max_pages: Option<u32>,
    ) -> Result<CleanupReport, CleanupError> {
        if !dry_run {
            let acquired = self
                .repository
                .try_acquire_lease(CLEANUP_LEASE, &self.holder, self.settings.lease_ttl())
                .await?;
            if !acquired {
                warn!(lease = CLEANUP_LEASE, "cleanup skipped, lease is held elsewhere");
                return Err(CleanupError::AlreadyRunning {
                    lease: CLEANUP_LEASE.to_string(),
                });
            }
        }

        let result = self.process_pages(dry_run, max_pages).await;

        if !dry_run {
            if let Err(e) = self.repository.release_lease(CLEANUP_LEASE, &self.holder).await {
                warn!(lease = CLEANUP_LEASE, error = %e, "failed to release cleanup lease");
            }
        }

        let report = result?;
        info!(
            dry_run,
            deleted_files = report.deleted_files,
            deleted_records = report.deleted_records,
            skipped = report.skipped,
            errors = report.errors.len(),
            pages = report.pages,
            "cleanup finished"
        );
        Ok(report)
    }

    async fn process_pages(
        &self,
        dry_run: bool,
        max_pages: Option<u32>,
    ) -> Result<CleanupReport, CleanupError> {
        let cutoff = self.cutoff(Utc::now())?;
        let limit = self.settings.batch_size.max(1);
        let mut report = CleanupReport {
            dry_run,
            ..CleanupReport::default()
        };
        let mut cursor: Option<PageCursor> = None;

        debug!(%cutoff, batch_size = limit, dry_run, "starting cleanup");

        loop {
            if max_pages.is_some_and(|max| report.pages >= max) {
                break;
            }

            let page = self
                .repository
                .list_soft_deleted_before(cutoff, cursor, limit)
                .await?;
            report.pages += 1;

            for record in &page {
                match self.process_record(record, dry_run).await {
                    Ok(Outcome::Deleted { record_removed }) => {
                        report.deleted_files += 1;
                        if record_removed {
                            report.deleted_records += 1;
                        }
                    }
                    Ok(Outcome::Skipped) => report.skipped += 1,
                    Err(e) => {
                        error!(
                            id = %record.id,
                            path = %record.storage_path,
                            error = %e,
                            "failed to clean up attachment"
                        );
                        report.errors.push(format!("{}: {e}", record.id));
                    }
                }
            }

            match page.last().and_then(AttachmentRecord::cursor) {
                Some(last) if page.len() >= limit as usize => cursor = Some(last),
                _ => break,
            }
        }

        report.success = report.errors.is_empty();
        Ok(report)
    }

    async fn process_record(
        &self,
        record: &AttachmentRecord,
        dry_run: bool,
    ) -> Result<Outcome, CleanupError> {
        if !self.backend.exists(&record.storage_path).await? {
            warn!(
                id = %record.id,
                path = %record.storage_path,
                "physical file already gone, skipping"
            );
            return Ok(Outcome::Skipped);
        }

        if dry_run {
            info!(
                id = %record.id,
                path = %record.storage_path,
                size = record.size,
                "dry run: would delete attachment"
            );
            return Ok(Outcome::Deleted {
                record_removed: true,
            });
        }

        self.backend.delete(&record.storage_path).await?;
        let record_removed = self.repository.hard_delete(record.id).await?;
        info!(id = %record.id, path = %record.storage_path, "attachment hard-deleted");

        Ok(Outcome::Deleted { record_removed })
    }

    /// Deletes an attachment's object and record right away
    ///
    /// Skips the retention window and works on active records too.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if there is no such record, or the backend or
    /// repository error that stopped the deletion.
    pub async fn force_delete(&self, id: Uuid) -> Result<AttachmentRecord, CleanupError> {
        let record = self
            .repository
            .get(id)
            .await?
            .ok_or(CleanupError::NotFound(id))?;

        self.backend.delete(&record.storage_path).await?;
        self.repository.hard_delete(id).await?;

        info!(id = %id, path = %record.storage_path, "attachment force-deleted");
        Ok(record)
    }

    /// Brings a soft-deleted attachment back
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, `NotSoftDeleted`, or `PhysicalFileMissing` when the
    /// object has already been removed from the backend.
    pub async fn restore(
        &self,
        id: Uuid,
        restored_by: Option<&str>,
    ) -> Result<AttachmentRecord, CleanupError> {
        let mut record = self
            .repository
            .get(id)
            .await?
            .ok_or(CleanupError::NotFound(id))?;

        if !record.is_deleted() {
            return Err(CleanupError::NotSoftDeleted(id));
        }

        if !self.backend.exists(&record.storage_path).await? {
            warn!(id = %id, path = %record.storage_path, "restore refused, physical file missing");
            return Err(CleanupError::PhysicalFileMissing {
                id,
                path: record.storage_path,
            });
        }

        if !self.repository.restore(id).await? {
            return Err(CleanupError::NotSoftDeleted(id));
        }

        record.deleted_at = None;
        record.deleted_by = None;
        info!(
            id = %id,
            restored_by = restored_by.unwrap_or("system"),
            "attachment restored"
        );
        Ok(record)
    }

    /// Counts and sizes of records awaiting cleanup
    ///
    /// # Errors
    ///
    /// Returns a repository error if the query fails.
    pub async fn stats(&self) -> Result<PendingStats, CleanupError> {
        let cutoff = self.cutoff(Utc::now())?;
        Ok(self.repository.pending_stats(cutoff).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{AttachmentRepository, InMemoryAttachmentRepository, MockAttachmentRepository};
    use crate::storage::traits::MockAttachmentBackend;
    use crate::storage::{BackendKind, Operation, StorageError, StoredObject, UploadMetadata};
    use std::sync::Arc;

    fn settings(batch_size: u32) -> CleanupSettings {
        CleanupSettings {
            retention_days: 30,
            batch_size,
            lease_ttl_secs: 60,
        }
    }

    async fn seed(repo: &InMemoryAttachmentRepository, path: &str, days_ago: i64) -> AttachmentRecord {
        let stored = StoredObject::new(path, 10);
        let meta = UploadMetadata::new("INV-1", "alice", "a.pdf", "application/pdf");
        let record = AttachmentRecord::new(&stored, &meta, Utc::now());
        repo.insert(&record).await.unwrap();
        repo.soft_delete(record.id, "bob", Utc::now() - chrono::Duration::days(days_ago))
            .await
            .unwrap();
        record
    }

    fn mock_backend() -> MockAttachmentBackend {
        let mut backend = MockAttachmentBackend::new();
        backend.expect_kind().return_const(BackendKind::Local);
        backend
    }

    #[tokio::test]
    async fn test_batch_deletes_file_then_record() {
        let repo = Arc::new(InMemoryAttachmentRepository::new());
        let old = seed(&repo, "old.pdf", 40).await;
        let recent = seed(&repo, "recent.pdf", 5).await;

        let mut backend = mock_backend();
        backend.expect_exists().times(1).returning(|_| Ok(true));
        backend
            .expect_delete()
            .withf(|p| p == "old.pdf")
            .times(1)
            .returning(|_| Ok(()));

        let service = CleanupService::new(Arc::new(backend), repo.clone(), settings(50));
        let report = service.run_batch(false, None).await.unwrap();

        assert_eq!(report.deleted_files, 1);
        assert_eq!(report.deleted_records, 1);
        assert_eq!(report.skipped, 0);
        assert!(report.success);
        assert!(repo.get(old.id).await.unwrap().is_none());
        assert!(repo.get(recent.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_missing_files_are_skipped() {
        let repo = Arc::new(InMemoryAttachmentRepository::new());
        let stale = seed(&repo, "gone.pdf", 40).await;

        let mut backend = mock_backend();
        backend.expect_exists().returning(|_| Ok(false));
        backend.expect_delete().never();

        let service = CleanupService::new(Arc::new(backend), repo.clone(), settings(50));
        let report = service.run_batch(false, None).await.unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(report.deleted_files, 0);
        assert!(report.success);
        assert!(repo.get(stale.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failed_delete_keeps_record_for_retry() {
        let repo = Arc::new(InMemoryAttachmentRepository::new());
        let failing = seed(&repo, "locked.pdf", 40).await;
        let fine = seed(&repo, "fine.pdf", 39).await;

        let mut backend = mock_backend();
        backend.expect_exists().returning(|_| Ok(true));
        backend.expect_delete().returning(|path| {
            if path == "locked.pdf" {
                Err(StorageError::failed_msg(Operation::Delete, "locked"))
            } else {
                Ok(())
            }
        });

        let service = CleanupService::new(Arc::new(backend), repo.clone(), settings(50));
        let report = service.run_batch(false, None).await.unwrap();

        assert!(!report.success);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with(&failing.id.to_string()));
        assert_eq!(report.deleted_files, 1);
        assert!(repo.get(failing.id).await.unwrap().unwrap().is_deleted());
        assert!(repo.get(fine.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dry_run_changes_nothing() {
        let repo = Arc::new(InMemoryAttachmentRepository::new());
        let record = seed(&repo, "old.pdf", 40).await;

        let mut backend = mock_backend();
        backend.expect_exists().returning(|_| Ok(true));
        backend.expect_delete().never();

        let service = CleanupService::new(Arc::new(backend), repo.clone(), settings(50));
        let report = service.run_batch(true, None).await.unwrap();

        assert!(report.dry_run);
        assert_eq!(report.deleted_files, 1);
        assert!(repo.get(record.id).await.unwrap().unwrap().is_deleted());
    }

    #[tokio::test]
    async fn test_pages_walk_past_skipped_records() {
        let repo = Arc::new(InMemoryAttachmentRepository::new());
        for i in 0..5 {
            seed(&repo, &format!("gone-{i}.pdf"), 40 + i).await;
        }

        let mut backend = mock_backend();
        backend.expect_exists().times(5).returning(|_| Ok(false));

        let service = CleanupService::new(Arc::new(backend), repo, settings(2));
        let report = service.run_batch(false, None).await.unwrap();

        assert_eq!(report.skipped, 5);
        assert_eq!(report.pages, 3);
    }

    #[tokio::test]
    async fn test_max_pages_bounds_the_run() {
        let repo = Arc::new(InMemoryAttachmentRepository::new());
        for i in 0..5 {
            seed(&repo, &format!("f-{i}.pdf"), 40 + i).await;
        }

        let mut backend = mock_backend();
        backend.expect_exists().times(2).returning(|_| Ok(true));
        backend.expect_delete().times(2).returning(|_| Ok(()));

        let service = CleanupService::new(Arc::new(backend), repo.clone(), settings(2));
        let report = service.run_batch(false, Some(1)).await.unwrap();

        assert_eq!(report.pages, 1);
        assert_eq!(report.deleted_records, 2);
        assert_eq!(repo.len(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_run_is_refused() {
        let repo = Arc::new(InMemoryAttachmentRepository::new());
        repo.try_acquire_lease(CLEANUP_LEASE, "someone-else", std::time::Duration::from_secs(60))
            .await
            .unwrap();

        let service = CleanupService::new(Arc::new(mock_backend()), repo.clone(), settings(50));
        let err = service.run_batch(false, None).await.unwrap_err();
        assert!(matches!(err, CleanupError::AlreadyRunning { .. }));

        // dry runs do not need the lease
        assert!(service.run_batch(true, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_lease_released_after_run() {
        let mut repo = MockAttachmentRepository::new();
        repo.expect_try_acquire_lease()
            .withf(|name, _, _| name == CLEANUP_LEASE)
            .times(1)
            .returning(|_, _, _| Ok(true));
        repo.expect_list_soft_deleted_before()
            .returning(|_, _, _| Ok(Vec::new()));
        repo.expect_release_lease()
            .withf(|name, holder| name == CLEANUP_LEASE && holder.starts_with("cleanup-"))
            .times(1)
            .returning(|_, _| Ok(()));

        let service = CleanupService::new(Arc::new(mock_backend()), Arc::new(repo), settings(50));
        let report = service.run_batch(false, None).await.unwrap();
        assert_eq!(report.pages, 1);
        assert!(report.success);
    }

    #[tokio::test]
    async fn test_force_delete() {
        let repo = Arc::new(InMemoryAttachmentRepository::new());
        let stored = StoredObject::new("active.pdf", 3);
        let meta = UploadMetadata::new("INV-1", "alice", "a.pdf", "application/pdf");
        let record = AttachmentRecord::new(&stored, &meta, Utc::now());
        repo.insert(&record).await.unwrap();

        let mut backend = mock_backend();
        backend
            .expect_delete()
            .withf(|p| p == "active.pdf")
            .times(1)
            .returning(|_| Ok(()));

        let service = CleanupService::new(Arc::new(backend), repo.clone(), settings(50));
        service.force_delete(record.id).await.unwrap();
        assert!(repo.is_empty());

        let missing = service.force_delete(record.id).await.unwrap_err();
        assert!(matches!(missing, CleanupError::NotFound(id) if id == record.id));
    }

    #[tokio::test]
    async fn test_restore_guard() {
        let repo = Arc::new(InMemoryAttachmentRepository::new());
        let present = seed(&repo, "present.pdf", 3).await;
        let missing = seed(&repo, "missing.pdf", 3).await;

        let mut backend = mock_backend();
        backend
            .expect_exists()
            .returning(|path| Ok(path == "present.pdf"));

        let service = CleanupService::new(Arc::new(backend), repo.clone(), settings(50));

        let restored = service.restore(present.id, Some("admin")).await.unwrap();
        assert!(!restored.is_deleted());
        assert!(!repo.get(present.id).await.unwrap().unwrap().is_deleted());

        let err = service.restore(missing.id, None).await.unwrap_err();
        assert!(err
            .to_string()
            .contains("physical file no longer exists, cannot restore"));
        assert!(repo.get(missing.id).await.unwrap().unwrap().is_deleted());

        let again = service.restore(present.id, None).await.unwrap_err();
        assert!(matches!(again, CleanupError::NotSoftDeleted(_)));
    }

    #[tokio::test]
    async fn test_out_of_range_retention_is_an_error() {
        let repo = Arc::new(InMemoryAttachmentRepository::new());
        let mut settings = settings(50);
        settings.retention_days = u32::MAX;

        let service = CleanupService::new(Arc::new(mock_backend()), repo.clone(), settings);

        let err = service.run_batch(true, None).await.unwrap_err();
        assert!(matches!(err, CleanupError::Storage(StorageError::Configuration(_))));
        assert!(err.to_string().contains("retention_days"));
        assert!(service.stats().await.is_err());

        // the lease is not left behind
        assert!(service.run_batch(false, None).await.is_err());
        assert!(repo
            .try_acquire_lease(CLEANUP_LEASE, "next-run", std::time::Duration::from_secs(1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_stats() {
        let repo = Arc::new(InMemoryAttachmentRepository::new());
        seed(&repo, "a.pdf", 40).await;
        seed(&repo, "b.pdf", 2).await;

        let service = CleanupService::new(Arc::new(mock_backend()), repo, settings(50));
        let stats = service.stats().await.unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.eligible, 1);
        assert_eq!(stats.total_bytes, 20);
        assert!(stats.oldest < stats.newest);
    }
}
