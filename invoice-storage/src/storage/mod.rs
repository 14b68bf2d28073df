//! Attachment storage backends
//!
//! This module provides a backend-agnostic contract ([`AttachmentBackend`]) for
//! storing invoice attachments, with two implementations:
//!
//! - [`LocalBackend`]: local filesystem with atomic temp-then-rename writes
//! - [`SharePointBackend`]: SharePoint document library through Microsoft Graph
//!
//! [`create_backend`] picks one from configuration.
//!
//! # Examples
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use invoice_storage::config::StorageSettings;
//! use invoice_storage::storage::{create_backend, UploadMetadata};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let backend = create_backend(&StorageSettings::default())?;
//!
//! let meta = UploadMetadata::new("42", "alice", "invoice.pdf", "application/pdf");
//! let stored = backend.upload(Bytes::from_static(b"%PDF-1.7"), &meta).await?;
//! println!("stored at {}", stored.path);
//! # Ok(())
//! # }
//! ```

pub mod factory;
pub mod local;
pub mod remote;
pub mod traits;
pub mod types;

pub use factory::{create_backend, validate_settings, ConfigIssue, StorageProvider};
pub use local::LocalBackend;
pub use remote::{GraphOptions, SharePointBackend};
pub use traits::{AttachmentBackend, SharedBackend};
pub use types::{
    BackendKind, Capabilities, ErrorCode, Operation, StorageError, StorageResult, StoredObject,
    UploadMetadata,
};

use crate::validation::sanitize_filename;
use chrono::{DateTime, Utc};

/// `{epoch millis}_{8 hex}_{sanitized name}`
///
/// The random component keeps same-millisecond uploads of one name apart.
pub(crate) fn unique_filename(original: &str, now: DateTime<Utc>) -> String {
    format!(
        "{}_{}_{}",
        now.timestamp_millis(),
        random_hex(),
        sanitize_filename(original)
    )
}

/// Eight random lower-case hex digits
pub(crate) fn random_hex() -> String {
    hex::encode(rand::random::<[u8; 4]>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_unique_filename_shape() {
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let name = unique_filename("Q1 report.PDF", now);

        let parts: Vec<&str> = name.splitn(3, '_').collect();
        assert_eq!(parts[0], now.timestamp_millis().to_string());
        assert_eq!(parts[1].len(), 8);
        assert!(parts[1].chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(parts[2], "Q1_report.pdf");
    }

    #[test]
    fn test_unique_filename_differs_within_a_millisecond() {
        let now = Utc::now();
        let names: std::collections::HashSet<_> =
            (0..64).map(|_| unique_filename("same.pdf", now)).collect();
        assert!(names.len() > 60);
    }
}
