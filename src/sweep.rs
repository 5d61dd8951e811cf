use crate::config::UploadRetryPolicy;
use crate::error::{LifecycleError, LifecycleResult};
use crate::jobs::{BackgroundTask, TaskQueue};
use crate::models::{StorageStatus, TemporaryUpload};
use crate::retry::RetryExecutor;
use crate::storage::ObjectStore;
use crate::store::Database;
use chrono::Utc;
use serde::Serialize;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

pub const RETRY_JOB: &str = "temp-upload-retry";
pub const ORPHAN_JOB: &str = "temp-upload-orphan-cleanup";
const RETRY_BATCH: usize = 100;

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrySweep {
    pub due: usize,
    pub reset: usize,
    pub exhausted: usize,
    /// Uploads whose listing can no longer take media.
    pub purged: usize,
    pub requeued_listings: usize,
    #[serde(skip)]
    pub tasks: Vec<Uuid>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OrphanSweep {
    pub candidates: usize,
    pub removed: usize,
    pub storage_failures: usize,
}

/// Periodic maintenance of staged uploads: failed files come back for
/// another finalize attempt once their backoff has passed, and files nobody
/// claimed are removed after the retention window.
#[derive(Clone)]
pub struct Sweeper {
    db: Database,
    storage: Arc<dyn ObjectStore>,
    queue: TaskQueue,
    retry: RetryExecutor,
    policy: UploadRetryPolicy,
}

impl Sweeper {
    pub fn new(
        db: Database,
        storage: Arc<dyn ObjectStore>,
        queue: TaskQueue,
        retry: RetryExecutor,
        policy: UploadRetryPolicy,
    ) -> Self {
        Self {
            db,
            storage,
            queue,
            retry,
            policy,
        }
    }

    pub async fn retry_failed_uploads(&self) -> LifecycleResult<RetrySweep> {
        let sweeper = self.clone();
        self.retry
            .execute_with_metrics(
                RETRY_JOB,
                move |_attempt| {
                    let sweeper = sweeper.clone();
                    async move { Ok::<_, LifecycleError>(sweeper.requeue_due().await) }
                },
                |summary: &RetrySweep| serde_json::to_value(summary).ok(),
            )
            .await
    }

    async fn requeue_due(&self) -> RetrySweep {
        let due = self.db.due_failed_uploads(Utc::now(), RETRY_BATCH).await;
        let mut summary = RetrySweep {
            due: due.len(),
            ..RetrySweep::default()
        };
        let mut listings = BTreeSet::new();
        let mut locked = BTreeMap::new();

        for mut upload in due {
            if let Some(listing_id) = upload.owner_resource_id {
                let is_locked = match locked.get(&listing_id) {
                    Some(known) => *known,
                    None => {
                        let known = self
                            .db
                            .load_listing(listing_id)
                            .await
                            .map(|listing| listing.status.locks_media())
                            .unwrap_or(true);
                        locked.insert(listing_id, known);
                        known
                    }
                };
                if is_locked {
                    self.purge(&upload).await;
                    summary.purged += 1;
                    continue;
                }
            }
            if upload.attempt >= self.policy.max_file_retries {
                upload.next_retry_at = None;
                self.db.save_upload(&upload).await;
                summary.exhausted += 1;
                warn!(
                    target = "listings.sweep",
                    upload_id = upload.id,
                    attempts = upload.attempt,
                    last_error = upload.last_error.as_deref().unwrap_or_default(),
                    "upload gave up after too many attempts"
                );
                continue;
            }
            upload.storage_status = StorageStatus::Temp;
            upload.next_retry_at = None;
            self.db.save_upload(&upload).await;
            summary.reset += 1;
            if let Some(listing_id) = upload.owner_resource_id {
                listings.insert(listing_id);
            }
        }

        // resubmit the whole linked set; finalized files are skipped
        for listing_id in listings {
            let upload_ids: Vec<u64> = self
                .db
                .uploads_for_listing(listing_id)
                .await
                .into_iter()
                .filter(|u| {
                    u.storage_status != StorageStatus::Failed || u.attempt < self.policy.max_file_retries
                })
                .map(|u| u.id)
                .collect();
            if upload_ids.is_empty() {
                continue;
            }
            let task = self
                .queue
                .enqueue(BackgroundTask::FinalizeMedia {
                    listing_id,
                    upload_ids,
                    actor: None,
                })
                .await;
            summary.tasks.push(task);
            summary.requeued_listings += 1;
        }

        if summary.due > 0 {
            info!(
                target = "listings.sweep",
                due = summary.due,
                reset = summary.reset,
                exhausted = summary.exhausted,
                purged = summary.purged,
                listings = summary.requeued_listings,
                "failed uploads swept"
            );
        }
        summary
    }

    async fn purge(&self, upload: &TemporaryUpload) {
        if let Err(err) = self.storage.delete(&upload.temp_ref).await {
            warn!(
                target = "listings.sweep",
                upload_id = upload.id,
                error = %err,
                "temp object delete failed during purge"
            );
        }
        self.db.delete_upload(upload.id).await;
        info!(
            target = "listings.sweep",
            upload_id = upload.id,
            listing_id = ?upload.owner_resource_id,
            "upload purged; listing no longer accepts media"
        );
    }

    pub async fn cleanup_orphans(&self) -> LifecycleResult<OrphanSweep> {
        let sweeper = self.clone();
        self.retry
            .execute_with_metrics(
                ORPHAN_JOB,
                move |_attempt| {
                    let sweeper = sweeper.clone();
                    async move { Ok::<_, LifecycleError>(sweeper.remove_orphans().await) }
                },
                |summary: &OrphanSweep| serde_json::to_value(summary).ok(),
            )
            .await
    }

    async fn remove_orphans(&self) -> OrphanSweep {
        let retention = chrono::Duration::from_std(self.policy.orphan_retention)
            .unwrap_or_else(|_| chrono::Duration::hours(48));
        let cutoff = Utc::now() - retention;
        let candidates: Vec<_> = self
            .db
            .stale_temp_uploads(cutoff)
            .await
            .into_iter()
            .filter(|u| u.owner_resource_id.is_none())
            .collect();

        let mut summary = OrphanSweep {
            candidates: candidates.len(),
            ..OrphanSweep::default()
        };
        for upload in candidates {
            if let Err(err) = self.storage.delete(&upload.temp_ref).await {
                summary.storage_failures += 1;
                warn!(
                    target = "listings.sweep",
                    upload_id = upload.id,
                    error = %err,
                    "orphan object delete failed; dropping record anyway"
                );
            }
            if self.db.delete_upload(upload.id).await {
                summary.removed += 1;
            }
        }
        if summary.removed > 0 {
            info!(
                target = "listings.sweep",
                removed = summary.removed,
                storage_failures = summary.storage_failures,
                "orphaned uploads removed"
            );
        }
        summary
    }

    /// One pass of both sweeps. Failures are already recorded and alerted on.
    pub async fn run_once(&self) {
        let _ = self.retry_failed_uploads().await;
        let _ = self.cleanup_orphans().await;
    }

    pub fn spawn(self, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                self.run_once().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobState;
    use crate::models::{JobStatus, ListingStatus, MediaStatus};
    use crate::test_support::Harness;

    fn sweeper(h: &Harness) -> Sweeper {
        Sweeper::new(
            h.db.clone(),
            h.storage.clone(),
            h.queue.clone(),
            h.service.retry_executor().clone(),
            h.policies.uploads.clone(),
        )
    }

    #[tokio::test]
    async fn due_failures_are_reset_and_finalized_again() {
        let h = Harness::new().await;
        h.directory.set_eligible(h.owner.id, true).await;
        let listing = h.listing().await;
        let f1 = h.upload(h.owner.id, "1.jpg").await;
        let f2 = h.upload(h.owner.id, "2.jpg").await;
        h.storage.fail_puts_containing(&format!("{f2}-2.jpg")).await;
        h.pipeline
            .finalize(listing.id, &[f1, f2], Some(h.owner))
            .await
            .expect_err("f2 fails");
        h.storage.heal().await;

        let mut failed = h.db.get_upload(f2).await.unwrap();
        failed.next_retry_at = Some(Utc::now() - chrono::Duration::seconds(1));
        h.db.save_upload(&failed).await;

        let summary = sweeper(&h).retry_failed_uploads().await.unwrap();
        assert_eq!(summary.reset, 1);
        assert_eq!(summary.requeued_listings, 1);

        let info = h.queue.wait_for(summary.tasks[0]).await;
        assert!(matches!(info.state, JobState::Completed { .. }), "{:?}", info.state);
        let stored = h.db.load_listing(listing.id).await.unwrap();
        assert_eq!(stored.media_status, MediaStatus::Ready);
        assert_eq!(stored.images.len(), 2);

        let jobs = h.db.jobs_named(RETRY_JOB).await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Success);
        assert!(jobs[0].metrics.is_some());
    }

    #[tokio::test]
    async fn uploads_at_the_ceiling_stop_coming_back() {
        let h = Harness::new().await;
        let id = h.upload(h.owner.id, "x.jpg").await;
        let mut upload = h.db.get_upload(id).await.unwrap();
        upload.storage_status = StorageStatus::Failed;
        upload.attempt = h.policies.uploads.max_file_retries;
        upload.next_retry_at = Some(Utc::now() - chrono::Duration::seconds(1));
        h.db.save_upload(&upload).await;

        let summary = sweeper(&h).retry_failed_uploads().await.unwrap();
        assert_eq!(summary.exhausted, 1);
        assert!(summary.tasks.is_empty());

        let stored = h.db.get_upload(id).await.unwrap();
        assert_eq!(stored.storage_status, StorageStatus::Failed);
        assert!(stored.next_retry_at.is_none());
        assert!(h.db.due_failed_uploads(Utc::now(), 10).await.is_empty());
    }

    #[tokio::test]
    async fn failures_for_sold_listings_are_purged_not_requeued() {
        let h = Harness::new().await;
        let listing = h.listing().await;
        let f1 = h.upload(h.owner.id, "1.jpg").await;
        h.storage.fail_puts_containing(&format!("{f1}-1.jpg")).await;
        h.pipeline
            .finalize(listing.id, &[f1], Some(h.owner))
            .await
            .expect_err("f1 fails");
        h.storage.heal().await;

        let mut sold = h.db.raw_listing(listing.id).await.unwrap();
        sold.status = ListingStatus::Sold;
        h.db.insert_raw_listing(sold).await;
        let mut failed = h.db.get_upload(f1).await.unwrap();
        failed.next_retry_at = Some(Utc::now() - chrono::Duration::seconds(1));
        h.db.save_upload(&failed).await;

        let summary = sweeper(&h).retry_failed_uploads().await.unwrap();
        assert_eq!(summary.purged, 1);
        assert_eq!(summary.reset, 0);
        assert!(summary.tasks.is_empty());
        assert!(h.db.get_upload(f1).await.is_none());
        assert!(!h.storage.contains(&failed.temp_ref).await);
    }

    #[tokio::test]
    async fn only_old_unclaimed_uploads_are_removed() {
        let h = Harness::new().await;
        let listing = h.listing().await;
        let old = Utc::now() - chrono::Duration::hours(72);

        let orphan = h.upload(h.owner.id, "old.jpg").await;
        let claimed = h.upload(h.owner.id, "claimed.jpg").await;
        let fresh = h.upload(h.owner.id, "fresh.jpg").await;
        for (id, linked) in [(orphan, None), (claimed, Some(listing.id))] {
            let mut upload = h.db.get_upload(id).await.unwrap();
            upload.created_at = old;
            upload.owner_resource_id = linked;
            h.db.save_upload(&upload).await;
        }
        let orphan_ref = h.db.get_upload(orphan).await.unwrap().temp_ref;

        let summary = sweeper(&h).cleanup_orphans().await.unwrap();
        assert_eq!(summary.candidates, 1);
        assert_eq!(summary.removed, 1);

        assert!(h.db.get_upload(orphan).await.is_none());
        assert!(!h.storage.contains(&orphan_ref).await);
        assert!(h.db.get_upload(claimed).await.is_some());
        assert!(h.db.get_upload(fresh).await.is_some());
        assert_eq!(
            h.db.last_successful(ORPHAN_JOB).await.map(|j| j.job_name),
            Some(ORPHAN_JOB.to_string())
        );
    }
}
