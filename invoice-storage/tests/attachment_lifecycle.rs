//! Upload, soft delete, restore and cleanup against real backends

use bytes::Bytes;
use chrono::{Duration, Utc};
use invoice_storage::prelude::*;
use std::sync::Arc;
use tempfile::TempDir;

const PDF: &[u8] = b"%PDF-1.7\n1 0 obj\n<< /Type /Catalog >>\nendobj\ntrailer\n%%EOF\n";
const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\x00\x00\x00\rIHDR\x00\x00\x00\x01\x00\x00\x00\x01";

struct Harness {
    _dir: TempDir,
    backend: SharedBackend,
    repository: Arc<InMemoryAttachmentRepository>,
    service: AttachmentService,
    cleanup: CleanupService,
}

fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let settings = StorageSettings {
        local: invoice_storage::config::LocalSettings {
            base_dir: dir.path().join("attachments"),
        },
        ..StorageSettings::default()
    };

    let backend = create_backend(&settings).unwrap();
    let repository = Arc::new(InMemoryAttachmentRepository::new());
    let service = AttachmentService::new(backend.clone(), repository.clone(), &settings);
    let cleanup = CleanupService::new(
        backend.clone(),
        repository.clone(),
        CleanupSettings::default(),
    );

    Harness {
        _dir: dir,
        backend,
        repository,
        service,
        cleanup,
    }
}

async fn age(h: &Harness, record: &AttachmentRecord, days: i64) {
    h.repository.restore(record.id).await.unwrap();
    h.repository
        .soft_delete(record.id, "bob", Utc::now() - Duration::days(days))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_full_lifecycle() {
    let h = harness();

    let meta = UploadMetadata::new("INV-2024-001", "alice", "Scan March.pdf", "application/pdf");
    let record = h
        .service
        .upload_attachment(Bytes::from_static(PDF), meta)
        .await
        .unwrap();

    assert!(record.storage_path.starts_with("invoices/"));
    assert!(record.storage_path.ends_with("_Scan_March.pdf"));
    assert!(h.backend.exists(&record.storage_path).await.unwrap());

    let (_, data) = h.service.open_attachment(record.id).await.unwrap();
    assert_eq!(&data[..], PDF);

    // soft delete keeps the object
    h.service.delete_attachment(record.id, "bob").await.unwrap();
    assert!(h.backend.exists(&record.storage_path).await.unwrap());
    assert!(matches!(
        h.service.open_attachment(record.id).await,
        Err(AttachmentError::Deleted(_))
    ));

    // inside the retention window nothing is removed
    let report = h.cleanup.run_batch(false, None).await.unwrap();
    assert_eq!(report, CleanupReport {
        pages: 1,
        success: true,
        ..CleanupReport::default()
    });

    // restore while the object is still there
    let restored = h.cleanup.restore(record.id, Some("admin")).await.unwrap();
    assert!(!restored.is_deleted());
    assert!(h.service.open_attachment(record.id).await.is_ok());

    // past retention: dry run reports, real run removes
    h.service.delete_attachment(record.id, "bob").await.unwrap();
    age(&h, &record, 45).await;

    let stats = h.cleanup.stats().await.unwrap();
    assert_eq!(stats.count, 1);
    assert_eq!(stats.eligible, 1);
    assert_eq!(stats.total_bytes, PDF.len() as u64);

    let dry = h.cleanup.run_batch(true, None).await.unwrap();
    assert!(dry.dry_run);
    assert_eq!(dry.deleted_files, 1);
    assert!(h.backend.exists(&record.storage_path).await.unwrap());
    assert!(h.repository.get(record.id).await.unwrap().is_some());

    let real = h.cleanup.run_batch(false, None).await.unwrap();
    assert!(real.success);
    assert_eq!(real.deleted_files, 1);
    assert_eq!(real.deleted_records, 1);
    assert!(!h.backend.exists(&record.storage_path).await.unwrap());
    assert!(h.repository.get(record.id).await.unwrap().is_none());
    assert_eq!(h.cleanup.stats().await.unwrap(), PendingStats::default());
}

#[tokio::test]
async fn test_restore_refused_when_object_is_gone() {
    let h = harness();

    let meta = UploadMetadata::new("INV-2024-002", "alice", "photo.png", "image/png");
    let record = h
        .service
        .upload_attachment(Bytes::from_static(PNG), meta)
        .await
        .unwrap();
    h.service.delete_attachment(record.id, "bob").await.unwrap();

    // someone removed the object out of band
    h.backend.delete(&record.storage_path).await.unwrap();

    let err = h.cleanup.restore(record.id, Some("admin")).await.unwrap_err();
    assert!(matches!(err, CleanupError::PhysicalFileMissing { .. }));
    assert!(err
        .to_string()
        .contains("physical file no longer exists, cannot restore"));
    assert!(h.repository.get(record.id).await.unwrap().unwrap().is_deleted());

    // cleanup counts it as skipped and leaves the record
    age(&h, &record, 60).await;
    let report = h.cleanup.run_batch(false, None).await.unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(report.deleted_records, 0);
    assert!(report.success);
}

#[tokio::test]
async fn test_force_delete_bypasses_retention() {
    let h = harness();

    let meta = UploadMetadata::new("INV-2024-003", "alice", "contract.pdf", "application/pdf");
    let record = h
        .service
        .upload_attachment(Bytes::from_static(PDF), meta)
        .await
        .unwrap();

    h.cleanup.force_delete(record.id).await.unwrap();
    assert!(!h.backend.exists(&record.storage_path).await.unwrap());
    assert!(h.repository.is_empty());
}

#[tokio::test]
async fn test_spoofed_and_oversized_uploads_leave_no_trace() {
    let h = harness();

    let spoofed = UploadMetadata::new("INV-2024-004", "mallory", "invoice.pdf", "application/pdf");
    let err = h
        .service
        .upload_attachment(Bytes::from_static(b"MZ\x90\x00\x03\x00\x00\x00"), spoofed)
        .await
        .unwrap_err();
    assert!(err
        .violations()
        .iter()
        .any(|v| matches!(v, ValidationError::SignatureMismatch { .. })));

    let big = vec![b'a'; 11 * 1024 * 1024];
    let oversized = UploadMetadata::new("INV-2024-004", "mallory", "notes.txt", "text/plain");
    let err = h
        .service
        .upload_attachment(Bytes::from(big), oversized)
        .await
        .unwrap_err();
    assert!(err
        .violations()
        .iter()
        .any(|v| matches!(v, ValidationError::FileTooLarge { .. })));

    assert!(h.repository.is_empty());
}

#[cfg(feature = "postgres")]
#[tokio::test]
#[ignore = "requires DATABASE_URL pointing at a PostgreSQL database"]
async fn test_postgres_repository_roundtrip() {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        return;
    };

    let repo = PgAttachmentRepository::connect(&url).await.unwrap();
    repo.migrate().await.unwrap();

    let stored = StoredObject::new(format!("pg-test/{}.pdf", uuid::Uuid::new_v4()), 12);
    let meta = UploadMetadata::new(
        format!("PG-{}", uuid::Uuid::new_v4()),
        "alice",
        "a.pdf",
        "application/pdf",
    );
    let record = AttachmentRecord::new(&stored, &meta, Utc::now());
    repo.insert(&record).await.unwrap();
    assert_eq!(repo.count_active_for_invoice(&meta.invoice_id).await.unwrap(), 1);

    let deleted_at = Utc::now() - Duration::days(90);
    assert!(repo.soft_delete(record.id, "bob", deleted_at).await.unwrap());

    let page = repo
        .list_soft_deleted_before(Utc::now() - Duration::days(30), None, 1000)
        .await
        .unwrap();
    assert!(page.iter().any(|r| r.id == record.id));

    let lease = format!("test-{}", uuid::Uuid::new_v4());
    let ttl = std::time::Duration::from_secs(30);
    assert!(repo.try_acquire_lease(&lease, "a", ttl).await.unwrap());
    assert!(!repo.try_acquire_lease(&lease, "b", ttl).await.unwrap());
    repo.release_lease(&lease, "a").await.unwrap();
    assert!(repo.try_acquire_lease(&lease, "b", ttl).await.unwrap());
    repo.release_lease(&lease, "b").await.unwrap();

    assert!(repo.restore(record.id).await.unwrap());
    assert!(repo.hard_delete(record.id).await.unwrap());
    assert!(repo.get(record.id).await.unwrap().is_none());
}
