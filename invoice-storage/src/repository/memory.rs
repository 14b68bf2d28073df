//! Process-local metadata store

use super::{
    lease_expiry, AttachmentRecord, AttachmentRepository, PageCursor, PendingStats,
    RepositoryResult,
};
use crate::error::RepositoryError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug)]
struct Lease {
    holder: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<Uuid, AttachmentRecord>,
    leases: HashMap<String, Lease>,
}

impl Inner {
    fn active_for(&self, invoice_id: &str) -> usize {
        self.records
            .values()
            .filter(|r| r.invoice_id == invoice_id && !r.is_deleted())
            .count()
    }

    fn insert(&mut self, record: &AttachmentRecord) -> RepositoryResult<()> {
        if self
            .records
            .values()
            .any(|r| r.storage_path == record.storage_path && r.id != record.id)
        {
            return Err(RepositoryError::Conflict(record.storage_path.clone()));
        }
        self.records.insert(record.id, record.clone());
        Ok(())
    }
}

/// In-memory [`AttachmentRepository`]
///
/// Nothing survives the process. Useful for tests and local development.
#[derive(Debug, Default)]
pub struct InMemoryAttachmentRepository {
    inner: Mutex<Inner>,
}

impl InMemoryAttachmentRepository {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records, deleted or not
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    /// Whether the store holds no records
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().records.is_empty()
    }
}

#[async_trait]
impl AttachmentRepository for InMemoryAttachmentRepository {
    async fn insert(&self, record: &AttachmentRecord) -> RepositoryResult<()> {
        self.inner.lock().insert(record)
    }

    async fn insert_within_quota(
        &self,
        record: &AttachmentRecord,
        max_active: u32,
    ) -> RepositoryResult<bool> {
        let mut inner = self.inner.lock();
        if inner.active_for(&record.invoice_id) >= max_active as usize {
            return Ok(false);
        }
        inner.insert(record)?;
        Ok(true)
    }

    async fn get(&self, id: Uuid) -> RepositoryResult<Option<AttachmentRecord>> {
        Ok(self.inner.lock().records.get(&id).cloned())
    }

    async fn list_for_invoice(&self, invoice_id: &str) -> RepositoryResult<Vec<AttachmentRecord>> {
        let mut records: Vec<_> = self
            .inner
            .lock()
            .records
            .values()
            .filter(|r| r.invoice_id == invoice_id && !r.is_deleted())
            .cloned()
            .collect();
        records.sort_by_key(|r| (r.created_at, r.id));
        Ok(records)
    }

    async fn count_active_for_invoice(&self, invoice_id: &str) -> RepositoryResult<u64> {
        Ok(self.inner.lock().active_for(invoice_id) as u64)
    }

    async fn soft_delete(
        &self,
        id: Uuid,
        deleted_by: &str,
        at: DateTime<Utc>,
    ) -> RepositoryResult<bool> {
        let mut inner = self.inner.lock();
        match inner.records.get_mut(&id) {
            Some(record) if !record.is_deleted() => {
                record.deleted_at = Some(at);
                record.deleted_by = Some(deleted_by.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_soft_deleted_before(
        &self,
        cutoff: DateTime<Utc>,
        after: Option<PageCursor>,
        limit: u32,
    ) -> RepositoryResult<Vec<AttachmentRecord>> {
        let inner = self.inner.lock();
        let mut page: Vec<(PageCursor, &AttachmentRecord)> = inner
            .records
            .values()
            .filter_map(|r| r.cursor().map(|c| (c, r)))
            .filter(|(c, _)| c.deleted_at < cutoff)
            .filter(|(c, _)| after.is_none_or(|after| *c > after))
            .collect();
        page.sort_by_key(|(c, _)| *c);

        Ok(page
            .into_iter()
            .take(limit as usize)
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn hard_delete(&self, id: Uuid) -> RepositoryResult<bool> {
        Ok(self.inner.lock().records.remove(&id).is_some())
    }

    async fn restore(&self, id: Uuid) -> RepositoryResult<bool> {
        let mut inner = self.inner.lock();
        match inner.records.get_mut(&id) {
            Some(record) if record.is_deleted() => {
                record.deleted_at = None;
                record.deleted_by = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn pending_stats(&self, cutoff: DateTime<Utc>) -> RepositoryResult<PendingStats> {
        let inner = self.inner.lock();
        let mut stats = PendingStats::default();

        for (deleted_at, record) in inner
            .records
            .values()
            .filter_map(|r| r.deleted_at.map(|d| (d, r)))
        {
            stats.count += 1;
            stats.total_bytes += record.size;
            if deleted_at < cutoff {
                stats.eligible += 1;
            }
            stats.oldest = Some(stats.oldest.map_or(deleted_at, |o| o.min(deleted_at)));
            stats.newest = Some(stats.newest.map_or(deleted_at, |n| n.max(deleted_at)));
        }

        Ok(stats)
    }

    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> RepositoryResult<bool> {
        let now = Utc::now();
        let mut inner = self.inner.lock();

        if let Some(lease) = inner.leases.get(name) {
            if lease.holder != holder && lease.expires_at > now {
                return Ok(false);
            }
        }

        inner.leases.insert(
            name.to_string(),
            Lease {
                holder: holder.to_string(),
                expires_at: lease_expiry(now, ttl),
            },
        );
        Ok(true)
    }

    async fn release_lease(&self, name: &str, holder: &str) -> RepositoryResult<()> {
        let mut inner = self.inner.lock();
        if inner.leases.get(name).is_some_and(|l| l.holder == holder) {
            inner.leases.remove(name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{StoredObject, UploadMetadata};
    use chrono::TimeZone;

    fn record(invoice: &str, size: u64) -> AttachmentRecord {
        let stored = StoredObject::new(format!("invoices/{}.pdf", Uuid::new_v4()), size);
        let meta = UploadMetadata::new(invoice, "alice", "a.pdf", "application/pdf");
        AttachmentRecord::new(&stored, &meta, Utc::now())
    }

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, d, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_soft_delete_and_restore() {
        let repo = InMemoryAttachmentRepository::new();
        let r = record("INV-1", 10);
        repo.insert(&r).await.unwrap();
        assert_eq!(repo.count_active_for_invoice("INV-1").await.unwrap(), 1);

        assert!(repo.soft_delete(r.id, "bob", day(1)).await.unwrap());
        assert!(!repo.soft_delete(r.id, "bob", day(2)).await.unwrap());
        assert_eq!(repo.count_active_for_invoice("INV-1").await.unwrap(), 0);
        assert!(repo.list_for_invoice("INV-1").await.unwrap().is_empty());

        let deleted = repo.get(r.id).await.unwrap().unwrap();
        assert_eq!(deleted.deleted_at, Some(day(1)));
        assert_eq!(deleted.deleted_by.as_deref(), Some("bob"));

        assert!(repo.restore(r.id).await.unwrap());
        assert!(!repo.restore(r.id).await.unwrap());
        assert!(!repo.get(r.id).await.unwrap().unwrap().is_deleted());
    }

    #[tokio::test]
    async fn test_duplicate_storage_path_is_a_conflict() {
        let repo = InMemoryAttachmentRepository::new();
        let first = record("INV-1", 10);
        repo.insert(&first).await.unwrap();

        let mut second = record("INV-2", 10);
        second.storage_path.clone_from(&first.storage_path);
        let err = repo.insert(&second).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(ref path) if *path == first.storage_path));
        assert!(matches!(
            repo.insert_within_quota(&second, 10).await,
            Err(RepositoryError::Conflict(_))
        ));
        assert_eq!(repo.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_quota_insert_holds_under_concurrency() {
        let repo = std::sync::Arc::new(InMemoryAttachmentRepository::new());

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let repo = repo.clone();
                tokio::spawn(async move { repo.insert_within_quota(&record("INV-9", 1), 5).await })
            })
            .collect();

        let mut accepted = 0;
        for task in tasks {
            if task.await.unwrap().unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 5);
        assert_eq!(repo.count_active_for_invoice("INV-9").await.unwrap(), 5);

        // soft-deleted records free a slot
        let first = repo.list_for_invoice("INV-9").await.unwrap()[0].id;
        repo.soft_delete(first, "bob", Utc::now()).await.unwrap();
        assert!(repo.insert_within_quota(&record("INV-9", 1), 5).await.unwrap());
        assert!(!repo.insert_within_quota(&record("INV-9", 1), 5).await.unwrap());
    }

    #[tokio::test]
    async fn test_keyset_pages() {
        let repo = InMemoryAttachmentRepository::new();
        let mut ids = Vec::new();
        for d in 1..=5 {
            let r = record("INV-2", 1);
            repo.insert(&r).await.unwrap();
            repo.soft_delete(r.id, "bob", day(d)).await.unwrap();
            ids.push(r.id);
        }
        // not past the cutoff
        let recent = record("INV-2", 1);
        repo.insert(&recent).await.unwrap();
        repo.soft_delete(recent.id, "bob", day(20)).await.unwrap();

        let cutoff = day(10);
        let first = repo.list_soft_deleted_before(cutoff, None, 2).await.unwrap();
        assert_eq!(first.iter().map(|r| r.id).collect::<Vec<_>>(), ids[..2]);

        let second = repo
            .list_soft_deleted_before(cutoff, first[1].cursor(), 2)
            .await
            .unwrap();
        assert_eq!(second.iter().map(|r| r.id).collect::<Vec<_>>(), ids[2..4]);

        let last = repo
            .list_soft_deleted_before(cutoff, second[1].cursor(), 2)
            .await
            .unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].id, ids[4]);
    }

    #[tokio::test]
    async fn test_pending_stats() {
        let repo = InMemoryAttachmentRepository::new();
        assert_eq!(repo.pending_stats(day(10)).await.unwrap(), PendingStats::default());

        for (d, size) in [(2, 100), (5, 50), (20, 7)] {
            let r = record("INV-3", size);
            repo.insert(&r).await.unwrap();
            repo.soft_delete(r.id, "bob", day(d)).await.unwrap();
        }
        repo.insert(&record("INV-3", 1000)).await.unwrap();

        let stats = repo.pending_stats(day(10)).await.unwrap();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.total_bytes, 157);
        assert_eq!(stats.eligible, 2);
        assert_eq!(stats.oldest, Some(day(2)));
        assert_eq!(stats.newest, Some(day(20)));
    }

    #[tokio::test]
    async fn test_lease_exclusion_and_takeover() {
        let repo = InMemoryAttachmentRepository::new();
        let ttl = Duration::from_secs(60);

        assert!(repo.try_acquire_lease("cleanup", "a", ttl).await.unwrap());
        assert!(!repo.try_acquire_lease("cleanup", "b", ttl).await.unwrap());
        // re-entrant for the same holder
        assert!(repo.try_acquire_lease("cleanup", "a", ttl).await.unwrap());

        // releasing someone else's lease is a no-op
        repo.release_lease("cleanup", "b").await.unwrap();
        assert!(!repo.try_acquire_lease("cleanup", "b", ttl).await.unwrap());

        repo.release_lease("cleanup", "a").await.unwrap();
        assert!(repo.try_acquire_lease("cleanup", "b", ttl).await.unwrap());

        // expired leases can be taken over
        assert!(repo.try_acquire_lease("other", "a", Duration::ZERO).await.unwrap());
        assert!(repo.try_acquire_lease("other", "b", ttl).await.unwrap());
    }
}
