//! Local filesystem backend

use super::traits::AttachmentBackend;
use super::{random_hex, unique_filename};
use super::types::{
    BackendKind, Capabilities, Operation, StorageError, StorageResult, StoredObject, UploadMetadata,
};
use crate::validation::{sanitize_path_segment, validate_storage_path};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Datelike, Utc};
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Local filesystem storage backend
///
/// Objects live under a base directory, grouped by invoice year and either
/// recurring profile or month.
///
/// # Directory Structure
///
/// ```text
/// /var/lib/invoices/uploads/
/// └── invoices/
///     └── 2024/
///         ├── Recurring/
///         │   └── Office_Lease/
///         │       └── 1709251200000_3fa2c1d9_lease.pdf
///         └── one-time/
///             └── Mar/
///                 └── 1709251200123_a01b77e4_My_Invoice_1_Final.pdf
/// ```
///
/// Writes go to `{final}.tmp.{8 hex}` beside the destination and are renamed
/// into place, so a concurrent reader sees either nothing or the whole file.
///
/// # Examples
///
/// ```rust,no_run
/// use invoice_storage::storage::LocalBackend;
///
/// let backend = LocalBackend::new("/var/lib/invoices/uploads")?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone)]
pub struct LocalBackend {
    /// Absolute, lexically normalized base directory
    base_dir: PathBuf,
}

impl LocalBackend {
    /// Creates a backend rooted at `base_dir`
    ///
    /// The directory is created lazily on first upload. A relative path is
    /// resolved against the current working directory.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPath` if `base_dir` exists but is not a directory, and
    /// `Configuration` if it cannot be made absolute.
    pub fn new(base_dir: impl Into<PathBuf>) -> StorageResult<Self> {
        let base_dir = base_dir.into();

        // Synchronous checks are fine during construction
        if base_dir.exists() && !base_dir.is_dir() {
            return Err(StorageError::InvalidPath(format!(
                "{} is not a directory",
                base_dir.display()
            )));
        }

        let absolute = std::path::absolute(&base_dir).map_err(|e| {
            StorageError::Configuration(format!(
                "cannot resolve upload directory {}: {e}",
                base_dir.display()
            ))
        })?;

        Ok(Self {
            base_dir: normalize(&absolute),
        })
    }

    /// Base directory all paths are resolved against
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Derives the backend-relative path for a new upload
    ///
    /// `invoices/{year}/Recurring/{profile}/{unique}` for recurring invoices,
    /// `invoices/{year}/one-time/{Mon}/{unique}` otherwise. Year and month come
    /// from the invoice date when present, else from `now`.
    #[must_use]
    pub fn derive_path(metadata: &UploadMetadata, now: DateTime<Utc>) -> String {
        let date = metadata.invoice_date.unwrap_or_else(|| now.date_naive());
        let filename = unique_filename(&metadata.original_name, now);

        match metadata.recurring_profile.as_deref() {
            Some(profile) => format!(
                "invoices/{}/Recurring/{}/{filename}",
                date.year(),
                sanitize_path_segment(profile)
            ),
            None => format!(
                "invoices/{}/one-time/{}/{filename}",
                date.year(),
                date.format("%b")
            ),
        }
    }

    /// Resolves a backend-relative path to an absolute path inside the base
    fn resolve(&self, path: &str) -> StorageResult<PathBuf> {
        validate_storage_path(path)?;

        let resolved = normalize(&self.base_dir.join(path));
        if !resolved.starts_with(&self.base_dir) || resolved == self.base_dir {
            return Err(StorageError::InvalidPath(format!(
                "{path:?} resolves outside the upload directory"
            )));
        }

        Ok(resolved)
    }

    /// Backend-relative form of an absolute path inside the base
    fn relative(&self, absolute: &Path) -> String {
        absolute
            .strip_prefix(&self.base_dir)
            .unwrap_or(absolute)
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Writes `data` to `target` through a temporary sibling and a rename
    async fn write_atomic(&self, target: &Path, path: &str, data: &[u8]) -> StorageResult<()> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                warn!(parent = %parent.display(), error = %e, "local storage: create_dir_all failed");
                StorageError::from_io(e, Operation::Upload, path)
            })?;
        }

        let mut temp = target.as_os_str().to_owned();
        temp.push(format!(".tmp.{}", random_hex()));
        let temp = PathBuf::from(temp);

        let written = async {
            let mut file = fs::File::create(&temp).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp, target).await
        }
        .await;

        if let Err(e) = written {
            warn!(path = %path, temp = %temp.display(), error = %e, "local storage: write failed");
            if let Err(cleanup) = fs::remove_file(&temp).await {
                if cleanup.kind() != io::ErrorKind::NotFound {
                    debug!(temp = %temp.display(), error = %cleanup, "local storage: temp file not removed");
                }
            }
            return Err(StorageError::from_io(e, Operation::Upload, path));
        }

        Ok(())
    }

    /// Removes empty directories from `start` upward, stopping at the base
    ///
    /// Failures are logged and ignored; a non-empty directory ends the walk.
    async fn prune_empty_parents(&self, start: &Path) {
        let mut current = start.parent();

        while let Some(dir) = current {
            if dir == self.base_dir || !dir.starts_with(&self.base_dir) {
                break;
            }
            if let Err(e) = fs::remove_dir(dir).await {
                debug!(dir = %dir.display(), error = %e, "local storage: stopped pruning");
                break;
            }
            current = dir.parent();
        }
    }
}

#[async_trait]
impl AttachmentBackend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            move_objects: true,
            upload_to_path: true,
            public_urls: false,
        }
    }

    async fn upload(&self, data: Bytes, metadata: &UploadMetadata) -> StorageResult<StoredObject> {
        let path = Self::derive_path(metadata, Utc::now());
        let target = self.resolve(&path)?;

        self.write_atomic(&target, &path, &data).await?;

        debug!(path = %path, size = data.len(), invoice_id = %metadata.invoice_id, "local storage: stored");
        Ok(StoredObject::new(path, data.len() as u64))
    }

    async fn download(&self, path: &str) -> StorageResult<Bytes> {
        let target = self.resolve(path)?;

        let data = fs::read(&target)
            .await
            .map_err(|e| StorageError::from_io(e, Operation::Download, path))?;

        debug!(path = %path, size = data.len(), "local storage: read");
        Ok(Bytes::from(data))
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        let target = self.resolve(path)?;

        match fs::remove_file(&target).await {
            Ok(()) => {
                debug!(path = %path, "local storage: deleted");
                self.prune_empty_parents(&target).await;
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path, "local storage: already gone");
                Ok(())
            }
            Err(e) => Err(StorageError::from_io(e, Operation::Delete, path)),
        }
    }

    async fn exists(&self, path: &str) -> StorageResult<bool> {
        let target = self.resolve(path)?;

        match fs::metadata(&target).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::from_io(e, Operation::Exists, path)),
        }
    }

    async fn move_object(&self, from: &str, to: &str) -> StorageResult<()> {
        let source = self.resolve(from)?;
        let target = self.resolve(to)?;

        let meta = fs::metadata(&source)
            .await
            .map_err(|e| StorageError::from_io(e, Operation::Move, from))?;
        if !meta.is_file() {
            return Err(StorageError::NotFound(from.to_string()));
        }
        if fs::try_exists(&target).await.unwrap_or(false) {
            return Err(StorageError::failed_msg(
                Operation::Move,
                format!("destination {to} already exists"),
            ));
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::from_io(e, Operation::Move, to))?;
        }
        fs::rename(&source, &target)
            .await
            .map_err(|e| StorageError::from_io(e, Operation::Move, from))?;

        debug!(from = %from, to = %to, "local storage: moved");
        self.prune_empty_parents(&source).await;
        Ok(())
    }

    async fn upload_to_path(&self, data: Bytes, path: &str) -> StorageResult<StoredObject> {
        let target = self.resolve(path)?;
        let path = self.relative(&target);

        self.write_atomic(&target, &path, &data).await?;

        debug!(path = %path, size = data.len(), "local storage: stored at fixed path");
        Ok(StoredObject::new(path, data.len() as u64))
    }
}

/// Lexical normalization: drops `.` and resolves `..` without touching the disk
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
