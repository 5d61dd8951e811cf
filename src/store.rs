use crate::error::{LifecycleError, LifecycleResult};
use crate::models::{JobExecutionRecord, JobStatus, Listing, StorageStatus, TemporaryUpload};
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    listings: HashMap<u64, Listing>,
    idempotency: HashMap<(u64, String), u64>,
    uploads: HashMap<u64, TemporaryUpload>,
    jobs: HashMap<Uuid, JobExecutionRecord>,
}

/// Transactional record store for listings, staged uploads and job records.
///
/// Single-table helpers commit immediately. Multi-row changes that must land
/// together go through [`UnitOfWork`].
#[derive(Clone, Default)]
pub struct Database {
    tables: Arc<Mutex<Tables>>,
    listing_seq: Arc<AtomicU64>,
    upload_seq: Arc<AtomicU64>,
}

impl Database {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_listing_id(&self) -> u64 {
        self.listing_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn next_upload_id(&self) -> u64 {
        self.upload_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn begin(&self) -> UnitOfWork {
        UnitOfWork {
            db: self.clone(),
            listing_writes: Vec::new(),
            upload_writes: Vec::new(),
            after_commit: Vec::new(),
        }
    }

    /// Reads a listing for a subsequent versioned write. Rows that predate
    /// versioning are stamped with version 0 here, once, so the caller's
    /// first write compares against a real token.
    pub async fn load_listing(&self, id: u64) -> LifecycleResult<Listing> {
        let mut guard = self.tables.lock().await;
        let row = guard
            .listings
            .get_mut(&id)
            .ok_or_else(|| LifecycleError::not_found("load_listing", "listing", id))?;
        if row.version.is_none() {
            row.version = Some(0);
            info!(
                target = "listings.store",
                listing_id = id,
                "initialised missing version stamp on legacy listing"
            );
        }
        Ok(row.clone())
    }

    pub async fn find_by_idempotency_key(&self, owner_id: u64, key: &str) -> Option<Listing> {
        let guard = self.tables.lock().await;
        guard
            .idempotency
            .get(&(owner_id, key.to_string()))
            .and_then(|id| guard.listings.get(id))
            .cloned()
    }

    pub async fn listings_where(&self, filter: impl Fn(&Listing) -> bool) -> Vec<Listing> {
        let guard = self.tables.lock().await;
        guard
            .listings
            .values()
            .filter(|listing| filter(listing))
            .cloned()
            .collect()
    }

    /// Single-statement counter bump. Leaves the version untouched so view
    /// traffic never collides with edits.
    pub async fn increment_view_count(&self, id: u64, delta: u64) -> LifecycleResult<u64> {
        let mut guard = self.tables.lock().await;
        let row = guard
            .listings
            .get_mut(&id)
            .ok_or_else(|| LifecycleError::not_found("increment_view_count", "listing", id))?;
        row.view_count = row.view_count.saturating_add(delta);
        Ok(row.view_count)
    }

    pub async fn insert_upload(&self, upload: TemporaryUpload) {
        let mut guard = self.tables.lock().await;
        guard.uploads.insert(upload.id, upload);
    }

    pub async fn save_upload(&self, upload: &TemporaryUpload) {
        let mut guard = self.tables.lock().await;
        guard.uploads.insert(upload.id, upload.clone());
    }

    pub async fn get_upload(&self, id: u64) -> Option<TemporaryUpload> {
        let guard = self.tables.lock().await;
        guard.uploads.get(&id).cloned()
    }

    pub async fn delete_upload(&self, id: u64) -> bool {
        let mut guard = self.tables.lock().await;
        guard.uploads.remove(&id).is_some()
    }

    pub async fn uploads_for_listing(&self, listing_id: u64) -> Vec<TemporaryUpload> {
        let guard = self.tables.lock().await;
        let mut uploads: Vec<_> = guard
            .uploads
            .values()
            .filter(|u| u.owner_resource_id == Some(listing_id))
            .cloned()
            .collect();
        uploads.sort_by_key(|u| u.id);
        uploads
    }

    /// FAILED uploads whose retry time has come, oldest first.
    pub async fn due_failed_uploads(&self, now: DateTime<Utc>, limit: usize) -> Vec<TemporaryUpload> {
        let guard = self.tables.lock().await;
        let mut due: Vec<_> = guard
            .uploads
            .values()
            .filter(|u| u.storage_status == StorageStatus::Failed)
            .filter(|u| u.next_retry_at.is_some_and(|at| at <= now))
            .cloned()
            .collect();
        due.sort_by_key(|u| u.next_retry_at);
        due.truncate(limit);
        due
    }

    pub async fn stale_temp_uploads(&self, created_before: DateTime<Utc>) -> Vec<TemporaryUpload> {
        let guard = self.tables.lock().await;
        guard
            .uploads
            .values()
            .filter(|u| u.storage_status == StorageStatus::Temp && u.created_at < created_before)
            .cloned()
            .collect()
    }

    pub async fn insert_job(&self, record: &JobExecutionRecord) {
        let mut guard = self.tables.lock().await;
        guard.jobs.insert(record.id, record.clone());
    }

    pub async fn update_job(&self, record: &JobExecutionRecord) {
        let mut guard = self.tables.lock().await;
        guard.jobs.insert(record.id, record.clone());
    }

    pub async fn jobs_named(&self, job_name: &str) -> Vec<JobExecutionRecord> {
        let guard = self.tables.lock().await;
        let mut jobs: Vec<_> = guard
            .jobs
            .values()
            .filter(|j| j.job_name == job_name)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.start_time);
        jobs
    }

    pub async fn last_successful(&self, job_name: &str) -> Option<JobExecutionRecord> {
        self.jobs_named(job_name)
            .await
            .into_iter()
            .rev()
            .find(|j| j.status == JobStatus::Success)
    }

    #[cfg(test)]
    pub async fn insert_raw_listing(&self, listing: Listing) {
        let mut guard = self.tables.lock().await;
        if let Some(key) = listing.idempotency_key.clone() {
            guard.idempotency.insert((listing.owner_id, key), listing.id);
        }
        self.listing_seq.fetch_max(listing.id, Ordering::SeqCst);
        guard.listings.insert(listing.id, listing);
    }

    #[cfg(test)]
    pub async fn raw_listing(&self, id: u64) -> Option<Listing> {
        self.tables.lock().await.listings.get(&id).cloned()
    }
}

enum ListingWrite {
    Insert(Listing),
    Update(Listing),
}

type AfterCommit = Box<dyn FnOnce() + Send + 'static>;

/// A batch of writes applied atomically, plus callbacks that only run once
/// the batch is durable. Dropping an uncommitted unit discards both.
pub struct UnitOfWork {
    db: Database,
    listing_writes: Vec<ListingWrite>,
    upload_writes: Vec<TemporaryUpload>,
    after_commit: Vec<AfterCommit>,
}

impl UnitOfWork {
    pub fn insert_listing(&mut self, listing: Listing) {
        self.listing_writes.push(ListingWrite::Insert(listing));
    }

    /// Writes `listing` back if the stored version still equals the version
    /// it was read at.
    pub fn update_listing(&mut self, listing: Listing) {
        self.listing_writes.push(ListingWrite::Update(listing));
    }

    pub fn save_upload(&mut self, upload: TemporaryUpload) {
        self.upload_writes.push(upload);
    }

    pub fn after_commit(&mut self, hook: impl FnOnce() + Send + 'static) {
        self.after_commit.push(Box::new(hook));
    }

    /// Applies every staged write or none of them. Returns the listings as
    /// stored, with their new versions.
    pub async fn commit(self) -> LifecycleResult<Vec<Listing>> {
        let UnitOfWork {
            db,
            listing_writes,
            upload_writes,
            after_commit,
        } = self;

        let written = {
            let mut guard = db.tables.lock().await;

            for write in &listing_writes {
                match write {
                    ListingWrite::Insert(listing) => {
                        if guard.listings.contains_key(&listing.id) {
                            return Err(LifecycleError::internal(
                                "commit",
                                format!("listing {} already exists", listing.id),
                            ));
                        }
                        if let Some(key) = &listing.idempotency_key
                            && guard
                                .idempotency
                                .contains_key(&(listing.owner_id, key.clone()))
                        {
                            return Err(LifecycleError::conflict("commit", listing.id));
                        }
                    }
                    ListingWrite::Update(listing) => {
                        let stored = guard.listings.get(&listing.id).ok_or_else(|| {
                            LifecycleError::not_found("commit", "listing", listing.id)
                        })?;
                        if stored.version != listing.version {
                            warn!(
                                target = "listings.store",
                                listing_id = listing.id,
                                stored = ?stored.version,
                                presented = ?listing.version,
                                "version mismatch on listing write"
                            );
                            return Err(LifecycleError::conflict("commit", listing.id));
                        }
                    }
                }
            }

            let now = Utc::now();
            let mut written = Vec::with_capacity(listing_writes.len());
            for write in listing_writes {
                let stored = match write {
                    ListingWrite::Insert(mut listing) => {
                        listing.version = Some(listing.version.unwrap_or(0));
                        if let Some(key) = listing.idempotency_key.clone() {
                            guard.idempotency.insert((listing.owner_id, key), listing.id);
                        }
                        listing
                    }
                    ListingWrite::Update(mut listing) => {
                        let current = guard.listings.get(&listing.id);
                        // the view counter owns this column
                        listing.view_count = current.map(|c| c.view_count).unwrap_or_default();
                        listing.version = Some(listing.version.unwrap_or(0) + 1);
                        listing.updated_at = now;
                        listing
                    }
                };
                guard.listings.insert(stored.id, stored.clone());
                written.push(stored);
            }
            for upload in upload_writes {
                guard.uploads.insert(upload.id, upload);
            }
            written
        };

        debug!(
            target = "listings.store",
            listings = written.len(),
            hooks = after_commit.len(),
            "unit of work committed"
        );
        for hook in after_commit {
            hook();
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::ListingContent;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn content() -> ListingContent {
        ListingContent {
            make: "Toyota".into(),
            model: "Corolla".into(),
            year: 2018,
            price_cents: 1_000_000,
            mileage: Some(42_000),
            description: None,
            specs: json!({}),
        }
    }

    async fn seeded(db: &Database) -> Listing {
        let listing = Listing::draft(db.next_listing_id(), 7, None, content(), None);
        let mut uow = db.begin();
        uow.insert_listing(listing);
        uow.commit().await.expect("commit").remove(0)
    }

    #[tokio::test]
    async fn stale_version_is_rejected() {
        let db = Database::new();
        let listing = seeded(&db).await;

        let first = db.load_listing(listing.id).await.unwrap();
        let second = db.load_listing(listing.id).await.unwrap();

        let mut uow = db.begin();
        uow.update_listing(first);
        let stored = uow.commit().await.expect("first writer wins");
        assert_eq!(stored[0].version, Some(1));

        let mut uow = db.begin();
        uow.update_listing(second);
        let err = uow.commit().await.expect_err("second writer loses");
        assert_eq!(err.kind(), ErrorKind::ConcurrencyConflict);
    }

    #[tokio::test]
    async fn legacy_row_is_repaired_on_read() {
        let db = Database::new();
        let mut legacy = Listing::draft(41, 7, None, content(), None);
        legacy.version = None;
        db.insert_raw_listing(legacy).await;

        let loaded = db.load_listing(41).await.unwrap();
        assert_eq!(loaded.version, Some(0));
        assert_eq!(db.raw_listing(41).await.unwrap().version, Some(0));

        let mut uow = db.begin();
        uow.update_listing(loaded);
        let stored = uow.commit().await.expect("first write after repair");
        assert_eq!(stored[0].version, Some(1));
    }

    #[tokio::test]
    async fn hooks_run_only_after_successful_commit() {
        let db = Database::new();
        let listing = seeded(&db).await;
        let fired = Arc::new(AtomicUsize::new(0));

        let stale = db.load_listing(listing.id).await.unwrap();
        let mut bump = db.begin();
        bump.update_listing(db.load_listing(listing.id).await.unwrap());
        bump.commit().await.unwrap();

        let mut uow = db.begin();
        uow.update_listing(stale);
        let counter = fired.clone();
        uow.after_commit(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(uow.commit().await.is_err());
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        let mut uow = db.begin();
        uow.update_listing(db.load_listing(listing.id).await.unwrap());
        let counter = fired.clone();
        uow.after_commit(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        uow.commit().await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn view_increments_do_not_bump_version_or_get_clobbered() {
        let db = Database::new();
        let listing = seeded(&db).await;
        let read = db.load_listing(listing.id).await.unwrap();

        db.increment_view_count(listing.id, 3).await.unwrap();

        let mut uow = db.begin();
        uow.update_listing(read);
        let stored = uow.commit().await.expect("views are not contention");
        assert_eq!(stored[0].view_count, 3);
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_fails_the_whole_unit() {
        let db = Database::new();
        let first = Listing::draft(db.next_listing_id(), 7, None, content(), Some("k".into()));
        let mut uow = db.begin();
        uow.insert_listing(first);
        uow.commit().await.unwrap();

        let dup = Listing::draft(db.next_listing_id(), 7, None, content(), Some("k".into()));
        let dup_id = dup.id;
        let mut uow = db.begin();
        uow.insert_listing(dup);
        assert!(uow.commit().await.is_err());
        assert!(db.raw_listing(dup_id).await.is_none());

        let other_owner = Listing::draft(db.next_listing_id(), 8, None, content(), Some("k".into()));
        let mut uow = db.begin();
        uow.insert_listing(other_owner);
        assert!(uow.commit().await.is_ok());
    }
}
