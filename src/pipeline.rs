use crate::cache::ListingCache;
use crate::config::{ListingPolicy, UploadRetryPolicy};
use crate::directory::OwnerDirectory;
use crate::error::{ErrorKind, LifecycleError, LifecycleResult};
use crate::media::{classify_upload, folder_for};
use crate::models::{
    Actor, Listing, ListingStatus, MediaKind, MediaStatus, StorageStatus, TemporaryUpload,
};
use crate::retry::{RetryExecutor, truncate_message};
use crate::status::settle_after_media_ready;
use crate::storage::{ObjectStore, permanent_path};
use crate::store::Database;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::{collections::HashSet, sync::Arc, time::Instant};
use tracing::{info, warn};

const MAX_FILE_ERROR_LEN: usize = 500;
const LINK_ATTEMPTS: u32 = 5;
pub const FINALIZE_JOB: &str = "media-finalize";

/// Per-file outcome of a finalize batch.
#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub upload_id: u64,
    pub kind: MediaKind,
    pub outcome: FileOutcome,
    pub reference: Option<String>,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOutcome {
    Finalized,
    /// Already in permanent storage from an earlier run.
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct FinalizeReport {
    pub listing_id: u64,
    pub status: ListingStatus,
    pub media_status: MediaStatus,
    pub version: Option<u64>,
    pub images: Vec<String>,
    pub video: Option<String>,
    pub banner: Option<String>,
    pub files: Vec<FileReport>,
}

/// Two-phase media commit: bytes move from temporary to permanent storage
/// file by file, and the listing record only learns about them once the
/// whole batch has landed.
#[derive(Clone)]
pub struct MediaPipeline {
    db: Database,
    storage: Arc<dyn ObjectStore>,
    directory: Arc<dyn OwnerDirectory>,
    cache: Arc<dyn ListingCache>,
    retry: RetryExecutor,
    policy: Arc<ListingPolicy>,
    upload_policy: UploadRetryPolicy,
}

struct StagedFile {
    upload: TemporaryUpload,
    kind: MediaKind,
}

impl MediaPipeline {
    pub fn new(
        db: Database,
        storage: Arc<dyn ObjectStore>,
        directory: Arc<dyn OwnerDirectory>,
        cache: Arc<dyn ListingCache>,
        retry: RetryExecutor,
        policy: Arc<ListingPolicy>,
        upload_policy: UploadRetryPolicy,
    ) -> Self {
        Self {
            db,
            storage,
            directory,
            cache,
            retry,
            policy,
            upload_policy,
        }
    }

    /// Finalizes `upload_ids` into `listing_id`. `actor: None` means the
    /// retry sweep, which acts for the listing's owners.
    pub async fn finalize(
        &self,
        listing_id: u64,
        upload_ids: &[u64],
        actor: Option<Actor>,
    ) -> LifecycleResult<FinalizeReport> {
        let mut listing = self.db.load_listing(listing_id).await?;

        if let Some(actor) = actor
            && !actor.is_admin()
            && !listing.is_owned_by(actor.id)
        {
            return Err(LifecycleError::unauthorized(
                "finalize_media",
                format!("user {} may not modify listing {listing_id}", actor.id),
            ));
        }
        if listing.status.locks_media() {
            return Err(LifecycleError::invalid_media_state(
                "finalize_media",
                listing.status,
            ));
        }

        let mut seen = HashSet::new();
        let upload_ids: Vec<u64> = upload_ids.iter().copied().filter(|id| seen.insert(*id)).collect();
        if upload_ids.is_empty() {
            return Err(LifecycleError::validation(
                "finalize_media",
                "no temporary files given",
            ));
        }

        let staged = match self.stage(&listing, &upload_ids, actor).await {
            Ok(staged) => staged,
            Err(err) if err.kind() == ErrorKind::Security => {
                warn!(
                    target = "listings.media",
                    listing_id,
                    error = %err,
                    security_event = true,
                    "finalize aborted"
                );
                self.mark_media_failed(listing_id).await;
                return Err(err);
            }
            Err(err) => return Err(err),
        };
        self.check_limits(&listing, &staged)?;

        listing = self.claim(listing, &staged).await?;

        let mut files = Vec::with_capacity(staged.len());
        for file in staged {
            files.push(self.move_file(listing_id, file).await);
        }

        let failed: Vec<u64> = files
            .iter()
            .filter(|f| f.outcome == FileOutcome::Failed)
            .map(|f| f.upload_id)
            .collect();
        if !failed.is_empty() {
            self.mark_media_failed(listing_id).await;
            return Err(LifecycleError::storage(
                "finalize_media",
                format!(
                    "{} of {} files for listing {listing_id} could not be stored (uploads {:?}); the batch can be resumed",
                    failed.len(),
                    files.len(),
                    failed
                ),
            ));
        }

        let references: Vec<(MediaKind, String)> = files
            .iter()
            .filter_map(|f| f.reference.clone().map(|reference| (f.kind, reference)))
            .collect();
        let eligible = self.directory.is_publicly_eligible(listing.owner_id).await;
        let (stored, moved) = match self.link(listing, &references, eligible).await {
            Ok(linked) => linked,
            Err(err) => {
                warn!(
                    target = "listings.media",
                    listing_id,
                    error = %err,
                    "stored files could not be linked"
                );
                if err.kind() != ErrorKind::InvalidStateForMediaChange {
                    self.mark_media_failed(listing_id).await;
                }
                return Err(err);
            }
        };
        self.cache.evict_listing(listing_id).await;

        info!(
            target = "listings.media",
            listing_id,
            files = files.len(),
            images = stored.images.len(),
            has_video = stored.video.is_some(),
            status = %stored.status,
            status_changed = moved,
            "media finalized"
        );

        Ok(FinalizeReport {
            listing_id,
            status: stored.status,
            media_status: stored.media_status,
            version: stored.version,
            images: stored.images,
            video: stored.video,
            banner: stored.banner,
            files,
        })
    }

    /// Appends the stored references and marks media READY. A concurrent
    /// write only costs a reload and a re-append; the files stay where they are.
    async fn link(
        &self,
        mut listing: Listing,
        references: &[(MediaKind, String)],
        eligible: bool,
    ) -> LifecycleResult<(Listing, bool)> {
        let listing_id = listing.id;
        let mut attempt = 1;
        loop {
            if listing.status.locks_media() {
                return Err(LifecycleError::invalid_media_state(
                    "finalize_media",
                    listing.status,
                ));
            }
            self.append_references(&mut listing, references)?;
            listing.ensure_banner();
            listing.media_status = MediaStatus::Ready;
            let moved = settle_after_media_ready(&mut listing, eligible);

            let mut uow = self.db.begin();
            uow.update_listing(listing);
            match uow.commit().await {
                Ok(mut stored) => {
                    let stored = stored.pop().ok_or_else(|| {
                        LifecycleError::internal("finalize_media", "listing write lost")
                    })?;
                    return Ok((stored, moved));
                }
                Err(err)
                    if err.kind() == ErrorKind::ConcurrencyConflict && attempt < LINK_ATTEMPTS =>
                {
                    info!(
                        target = "listings.media",
                        listing_id,
                        attempt,
                        "listing changed while files were moving; relinking"
                    );
                    attempt += 1;
                    listing = self.db.load_listing(listing_id).await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Idempotent: references already on the listing are not added twice.
    /// Re-checks the caps, since a concurrent batch may have filled them.
    fn append_references(
        &self,
        listing: &mut Listing,
        references: &[(MediaKind, String)],
    ) -> LifecycleResult<()> {
        for (kind, reference) in references {
            match kind {
                MediaKind::Image => {
                    if !listing.images.contains(reference) {
                        listing.images.push(reference.clone());
                    }
                }
                MediaKind::Video => {
                    if listing.video.as_ref().is_some_and(|video| video != reference) {
                        return Err(LifecycleError::media_limit(
                            "finalize_media",
                            format!("listing {} already has a video", listing.id),
                        ));
                    }
                    listing.video = Some(reference.clone());
                }
            }
        }
        if listing.images.len() > self.policy.max_images {
            return Err(LifecycleError::media_limit(
                "finalize_media",
                format!(
                    "listing would have {} images; at most {} are allowed",
                    listing.images.len(),
                    self.policy.max_images
                ),
            ));
        }
        Ok(())
    }

    /// Loads, authorizes and classifies every upload before any byte moves.
    async fn stage(
        &self,
        listing: &Listing,
        upload_ids: &[u64],
        actor: Option<Actor>,
    ) -> LifecycleResult<Vec<StagedFile>> {
        let mut staged = Vec::with_capacity(upload_ids.len());
        for id in upload_ids {
            let upload = self
                .db
                .get_upload(*id)
                .await
                .ok_or_else(|| LifecycleError::not_found("finalize_media", "temporary upload", id))?;

            let uploader_ok = match actor {
                Some(actor) if upload.uploader_id == actor.id => true,
                // admins and the sweep may only attach files the owners uploaded
                Some(actor) if actor.is_admin() => listing.is_owned_by(upload.uploader_id),
                Some(_) => false,
                None => listing.is_owned_by(upload.uploader_id),
            };
            if !uploader_ok {
                return Err(LifecycleError::security(
                    "finalize_media",
                    format!("upload {id} does not belong to the requesting user"),
                ));
            }
            if let Some(other) = upload.owner_resource_id
                && other != listing.id
            {
                return Err(LifecycleError::security(
                    "finalize_media",
                    format!("upload {id} is already attached to listing {other}"),
                ));
            }

            let kind = classify_upload(&upload, &self.policy)?;
            staged.push(StagedFile { upload, kind });
        }
        Ok(staged)
    }

    /// Counts what the batch would add on top of what the listing already
    /// shows. Files from an earlier run are already counted.
    fn check_limits(&self, listing: &Listing, staged: &[StagedFile]) -> LifecycleResult<()> {
        let is_new = |file: &StagedFile| match &file.upload.permanent_ref {
            Some(reference) => {
                !listing.images.contains(reference) && listing.video.as_ref() != Some(reference)
            }
            None => true,
        };
        let new_images = staged
            .iter()
            .filter(|f| f.kind == MediaKind::Image && is_new(f))
            .count();
        let new_videos = staged
            .iter()
            .filter(|f| f.kind == MediaKind::Video && is_new(f))
            .count();

        let images = listing.images.len() + new_images;
        if images > self.policy.max_images {
            return Err(LifecycleError::media_limit(
                "finalize_media",
                format!(
                    "listing would have {images} images; at most {} are allowed",
                    self.policy.max_images
                ),
            ));
        }
        let videos = usize::from(listing.video.is_some()) + new_videos;
        if videos > self.policy.max_videos {
            return Err(LifecycleError::media_limit(
                "finalize_media",
                format!(
                    "listing would have {videos} videos; at most {} are allowed",
                    self.policy.max_videos
                ),
            ));
        }
        Ok(())
    }

    /// Links the uploads to the listing and flags media as in progress.
    /// Listings already READY keep serving their current media meanwhile.
    async fn claim(&self, mut listing: Listing, staged: &[StagedFile]) -> LifecycleResult<Listing> {
        let listing_id = listing.id;
        let unlinked: Vec<TemporaryUpload> = staged
            .iter()
            .filter(|f| f.upload.owner_resource_id.is_none())
            .map(|f| {
                let mut upload = f.upload.clone();
                upload.owner_resource_id = Some(listing_id);
                upload
            })
            .collect();

        let mut attempt = 1;
        loop {
            let needs_flag = matches!(listing.media_status, MediaStatus::Init | MediaStatus::Failed);
            if unlinked.is_empty() && !needs_flag {
                return Ok(listing);
            }

            let mut uow = self.db.begin();
            for upload in &unlinked {
                uow.save_upload(upload.clone());
            }
            if !needs_flag {
                uow.commit().await?;
                return Ok(listing);
            }
            let mut flagged = listing.clone();
            flagged.media_status = MediaStatus::Processing;
            uow.update_listing(flagged);
            match uow.commit().await {
                Ok(stored) => {
                    self.cache.evict_listing(listing_id).await;
                    return stored.into_iter().next().ok_or_else(|| {
                        LifecycleError::internal("finalize_media", "listing write lost")
                    });
                }
                Err(err)
                    if err.kind() == ErrorKind::ConcurrencyConflict && attempt < LINK_ATTEMPTS =>
                {
                    attempt += 1;
                    listing = self.db.load_listing(listing_id).await?;
                    if listing.status.locks_media() {
                        return Err(LifecycleError::invalid_media_state(
                            "finalize_media",
                            listing.status,
                        ));
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn move_file(&self, listing_id: u64, file: StagedFile) -> FileReport {
        let started = Instant::now();
        let StagedFile { mut upload, kind } = file;

        if upload.storage_status == StorageStatus::Finalized
            && let Some(reference) = upload.permanent_ref.clone()
        {
            return FileReport {
                upload_id: upload.id,
                kind,
                outcome: FileOutcome::Skipped,
                reference: Some(reference),
                elapsed_ms: started.elapsed().as_millis(),
                timestamp: Utc::now(),
                error: None,
            };
        }

        let storage = self.storage.clone();
        let temp_ref = upload.temp_ref.clone();
        let path = permanent_path(listing_id, folder_for(kind), upload.id, &upload.original_filename);
        let content_type = upload.content_type.clone();
        let upload_id = upload.id;

        let result = self
            .retry
            .execute_with_metrics(
                FINALIZE_JOB,
                move |_attempt| {
                    let storage = storage.clone();
                    let temp_ref = temp_ref.clone();
                    let path = path.clone();
                    let content_type = content_type.clone();
                    async move {
                        let bytes = storage.get(&temp_ref).await?;
                        let reference = storage.put(&path, bytes, content_type.as_deref()).await?;
                        Ok::<_, LifecycleError>(reference)
                    }
                },
                |reference: &String| {
                    Some(json!({
                        "listing_id": listing_id,
                        "upload_id": upload_id,
                        "reference": reference,
                    }))
                },
            )
            .await;

        match result {
            Ok(reference) => {
                upload.storage_status = StorageStatus::Finalized;
                upload.permanent_ref = Some(reference.clone());
                upload.owner_resource_id = Some(listing_id);
                upload.next_retry_at = None;
                upload.last_error = None;
                self.db.save_upload(&upload).await;
                if let Err(err) = self.storage.delete(&upload.temp_ref).await {
                    warn!(target = "listings.media", upload_id, error = %err, "temp object cleanup failed");
                }
                FileReport {
                    upload_id,
                    kind,
                    outcome: FileOutcome::Finalized,
                    reference: Some(reference),
                    elapsed_ms: started.elapsed().as_millis(),
                    timestamp: Utc::now(),
                    error: None,
                }
            }
            Err(err) => {
                upload.storage_status = StorageStatus::Failed;
                upload.attempt += 1;
                upload.owner_resource_id = Some(listing_id);
                upload.last_error = Some(truncate_message(&err.to_string(), MAX_FILE_ERROR_LEN));
                upload.next_retry_at = if err.is_transient() {
                    let delay = self.upload_policy.delay_for(upload.attempt);
                    chrono::Duration::from_std(delay)
                        .ok()
                        .map(|delay| Utc::now() + delay)
                } else {
                    None
                };
                self.db.save_upload(&upload).await;
                warn!(
                    target = "listings.media",
                    listing_id,
                    upload_id,
                    attempt = upload.attempt,
                    next_retry_at = ?upload.next_retry_at,
                    error = %err,
                    "file finalization failed"
                );
                FileReport {
                    upload_id,
                    kind,
                    outcome: FileOutcome::Failed,
                    reference: None,
                    elapsed_ms: started.elapsed().as_millis(),
                    timestamp: Utc::now(),
                    error: upload.last_error.clone(),
                }
            }
        }
    }

    /// Records the failure on the current row, re-reading on contention.
    async fn mark_media_failed(&self, listing_id: u64) {
        let mut attempt = 1;
        loop {
            let result = match self.db.load_listing(listing_id).await {
                Ok(mut listing) => {
                    listing.media_status = MediaStatus::Failed;
                    let mut uow = self.db.begin();
                    uow.update_listing(listing);
                    uow.commit().await
                }
                Err(err) => Err(err),
            };
            match result {
                Ok(_) => {
                    self.cache.evict_listing(listing_id).await;
                    return;
                }
                Err(err)
                    if err.kind() == ErrorKind::ConcurrencyConflict && attempt < LINK_ATTEMPTS =>
                {
                    attempt += 1;
                }
                Err(err) => {
                    warn!(target = "listings.media", listing_id, error = %err, "could not record media failure");
                    return;
                }
            }
        }
    }
}
