use crate::access::{AccessPolicy, Capability};
use crate::audit::{Alerting, AuditEntry, AuditLog};
use crate::cache::ListingCache;
use crate::config::{ListingPolicy, PolicyFile};
use crate::directory::OwnerDirectory;
use crate::error::{ErrorKind, LifecycleError, LifecycleResult};
use crate::idempotency::IdempotencyGuard;
use crate::jobs::{BackgroundTask, TaskQueue, TaskRunner};
use crate::media::{classify_upload, deduplicate, sniff_content_type, validate_media_url};
use crate::models::{
    Actor, CreateListingRequest, Listing, ListingPage, ListingStatus, MediaKind, MediaStatus,
    PageRequest, PublicListing, SortOrder, StorageStatus, TemporaryUpload, UpdateListingRequest,
};
use crate::pipeline::{FinalizeReport, MediaPipeline};
use crate::retry::RetryExecutor;
use crate::status::{apply_transition, settle_after_media_ready};
use crate::storage::{ObjectStore, temp_path};
use crate::store::{Database, UnitOfWork};
use crate::validation::{PriceDecision, assess_price_change, format_bps, validate_content};
use crate::views::ViewCounter;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const MAX_PAGE_SIZE: u32 = 100;

/// External collaborators the service is wired with at start-up.
#[derive(Clone)]
pub struct Collaborators {
    pub storage: Arc<dyn ObjectStore>,
    pub directory: Arc<dyn OwnerDirectory>,
    pub cache: Arc<dyn ListingCache>,
    pub audit: Arc<dyn AuditLog>,
    pub alerting: Arc<dyn Alerting>,
    pub access: Arc<dyn AccessPolicy>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateOutcome {
    pub listing: Listing,
    /// The key matched an earlier create; nothing new was written.
    pub replayed: bool,
    pub finalize_task: Option<Uuid>,
}

/// Direct media URLs for the legacy upload path. `images` replaces the whole
/// image list when given; `video` replaces the video when given.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MediaUrls {
    #[serde(default)]
    pub images: Option<Vec<String>>,
    #[serde(default)]
    pub video: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewUpload {
    pub filename: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
    pub content_hash: Option<String>,
}

#[derive(Clone)]
pub struct ListingService {
    db: Database,
    guard: IdempotencyGuard,
    pipeline: MediaPipeline,
    retry: RetryExecutor,
    storage: Arc<dyn ObjectStore>,
    directory: Arc<dyn OwnerDirectory>,
    cache: Arc<dyn ListingCache>,
    audit: Arc<dyn AuditLog>,
    access: Arc<dyn AccessPolicy>,
    views: ViewCounter,
    queue: TaskQueue,
    policy: Arc<ListingPolicy>,
}

impl ListingService {
    pub fn new(db: Database, parts: Collaborators, policies: &PolicyFile, queue: TaskQueue) -> Self {
        let policy = Arc::new(policies.listing.clone());
        let retry = RetryExecutor::new(policies.retry.clone(), db.clone(), parts.alerting.clone());
        let pipeline = MediaPipeline::new(
            db.clone(),
            parts.storage.clone(),
            parts.directory.clone(),
            parts.cache.clone(),
            retry.clone(),
            policy.clone(),
            policies.uploads.clone(),
        );
        Self {
            guard: IdempotencyGuard::new(db.clone()),
            views: ViewCounter::new(db.clone()),
            db,
            pipeline,
            retry,
            storage: parts.storage,
            directory: parts.directory,
            cache: parts.cache,
            audit: parts.audit,
            access: parts.access,
            queue,
            policy,
        }
    }

    pub fn retry_executor(&self) -> &RetryExecutor {
        &self.retry
    }

    pub fn views(&self) -> &ViewCounter {
        &self.views
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    // ---- create / update -------------------------------------------------

    pub async fn create_listing(
        &self,
        actor: Actor,
        request: CreateListingRequest,
        idempotency_key: Option<&str>,
    ) -> LifecycleResult<CreateOutcome> {
        self.access.check(&actor, Capability::CreateListing, None)?;

        if let Some(existing) = self.guard.resolve(actor.id, idempotency_key).await {
            return Ok(CreateOutcome {
                listing: existing,
                replayed: true,
                finalize_task: None,
            });
        }

        validate_content("create_listing", &request.content, &self.policy)?;
        if request.co_owner_id == Some(actor.id) {
            return Err(LifecycleError::validation(
                "create_listing",
                "co-owner must be a different user",
            ));
        }
        let uploads = self.claimable_uploads(&actor, &request.temp_file_ids).await?;

        let key = IdempotencyGuard::normalize(idempotency_key);
        let mut listing = Listing::draft(
            self.db.next_listing_id(),
            actor.id,
            request.co_owner_id,
            request.content,
            key.clone(),
        );
        let listing_id = listing.id;

        let mut uow = self.db.begin();
        let mut finalize_task = None;
        if !uploads.is_empty() {
            listing.media_status = MediaStatus::Processing;
            let upload_ids: Vec<u64> = uploads.iter().map(|u| u.id).collect();
            for mut upload in uploads {
                upload.owner_resource_id = Some(listing_id);
                uow.save_upload(upload);
            }
            let task_id = Uuid::new_v4();
            let queue = self.queue.clone();
            uow.after_commit(move || {
                queue.submit_with_id(
                    task_id,
                    BackgroundTask::FinalizeMedia {
                        listing_id,
                        upload_ids,
                        actor: Some(actor),
                    },
                )
            });
            finalize_task = Some(task_id);
        }
        uow.insert_listing(listing);

        let stored = match uow.commit().await {
            Ok(mut written) => written
                .pop()
                .ok_or_else(|| LifecycleError::internal("create_listing", "listing write lost"))?,
            Err(err) if err.kind() == ErrorKind::ConcurrencyConflict => {
                // a concurrent create with the same key won the unique index
                if let Some(existing) = self.guard.resolve(actor.id, key.as_deref()).await {
                    return Ok(CreateOutcome {
                        listing: existing,
                        replayed: true,
                        finalize_task: None,
                    });
                }
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        self.cache.evict_listing(listing_id).await;
        self.audit.record(AuditEntry::listing(
            "CREATE",
            listing_id,
            actor.label(),
            format!("listing created by user {}", actor.id),
        ));
        info!(
            target = "listings.lifecycle",
            listing_id,
            owner_id = actor.id,
            media_files = stored.images.len(),
            finalize_task = ?finalize_task,
            "listing created"
        );
        Ok(CreateOutcome {
            listing: stored,
            replayed: false,
            finalize_task,
        })
    }

    /// Uploads a new listing may take over: staged by the caller, not yet
    /// attached anywhere, within the media limits.
    async fn claimable_uploads(&self, actor: &Actor, ids: &[u64]) -> LifecycleResult<Vec<TemporaryUpload>> {
        let mut uploads = Vec::new();
        let (mut images, mut videos) = (0usize, 0usize);
        for id in deduplicate_ids(ids) {
            let upload = self
                .db
                .get_upload(id)
                .await
                .ok_or_else(|| LifecycleError::not_found("create_listing", "temporary upload", id))?;
            if upload.uploader_id != actor.id {
                return Err(LifecycleError::security(
                    "create_listing",
                    format!("upload {id} does not belong to the requesting user"),
                ));
            }
            if upload.owner_resource_id.is_some() || upload.storage_status == StorageStatus::Finalized {
                return Err(LifecycleError::validation(
                    "create_listing",
                    format!("upload {id} is already attached to a listing"),
                ));
            }
            match classify_upload(&upload, &self.policy)? {
                MediaKind::Image => images += 1,
                MediaKind::Video => videos += 1,
            }
            uploads.push(upload);
        }
        if images > self.policy.max_images || videos > self.policy.max_videos {
            return Err(LifecycleError::media_limit(
                "create_listing",
                format!(
                    "{images} images and {videos} videos requested; limits are {} and {}",
                    self.policy.max_images, self.policy.max_videos
                ),
            ));
        }
        Ok(uploads)
    }

    pub async fn update_listing(
        &self,
        actor: Actor,
        listing_id: u64,
        request: UpdateListingRequest,
    ) -> LifecycleResult<Listing> {
        let mut listing = self
            .load_for(&actor, listing_id, Capability::ModifyListing, request.expected_version)
            .await?;
        if listing.status == ListingStatus::Deleted {
            return Err(LifecycleError::validation(
                "update_listing",
                "deleted listings cannot be edited",
            ));
        }
        validate_content("update_listing", &request.content, &self.policy)?;

        let old_price = listing.content.price_cents;
        let new_price = request.content.price_cents;
        let decision = if old_price == new_price {
            PriceDecision::Unchanged
        } else {
            if matches!(
                listing.status,
                ListingStatus::Sold | ListingStatus::Archived | ListingStatus::Deleted
            ) {
                return Err(LifecycleError::validation(
                    "update_listing",
                    format!("cannot update price when listing status is {}", listing.status),
                ));
            }
            assess_price_change(old_price, new_price, actor.is_admin(), &self.policy)
        };

        if let PriceDecision::Rejected { change_bps } = decision {
            warn!(
                target = "listings.lifecycle",
                listing_id,
                actor_id = actor.id,
                old_price,
                new_price,
                change = %format_bps(change_bps),
                "price change rejected"
            );
            self.audit.record(
                AuditEntry::listing(
                    "PRICE_CHANGE_REJECTED",
                    listing_id,
                    actor.label(),
                    format!("rejected price change {old_price} -> {new_price} ({})", format_bps(change_bps)),
                )
                .security(),
            );
            return Err(LifecycleError::price_rejected(
                "update_listing",
                format!(
                    "price change of {} exceeds the allowed {}; contact support for large adjustments",
                    format_bps(change_bps),
                    format_bps(self.policy.price_reject_bps)
                ),
            ));
        }

        listing.content = request.content;
        let stored = self.write(listing).await?;

        match decision {
            PriceDecision::Flagged { change_bps } => self.audit.record(
                AuditEntry::listing(
                    "PRICE_CHANGE_LARGE",
                    listing_id,
                    actor.label(),
                    format!("price changed {old_price} -> {new_price} ({})", format_bps(change_bps)),
                )
                .security(),
            ),
            PriceDecision::Routine { change_bps } => self.audit.record(AuditEntry::listing(
                "PRICE_UPDATE",
                listing_id,
                actor.label(),
                format!("price changed {old_price} -> {new_price} ({})", format_bps(change_bps)),
            )),
            PriceDecision::Unchanged | PriceDecision::Rejected { .. } => {}
        }
        self.audit.record(AuditEntry::listing(
            "UPDATE",
            listing_id,
            actor.label(),
            format!("listing updated by user {}", actor.id),
        ));
        Ok(stored)
    }

    // ---- status ----------------------------------------------------------

    pub async fn update_status(
        &self,
        actor: Actor,
        listing_id: u64,
        to: ListingStatus,
        expected_version: Option<u64>,
    ) -> LifecycleResult<Listing> {
        let mut listing = self
            .load_for(&actor, listing_id, Capability::ChangeStatus, expected_version)
            .await?;
        let from = listing.status;
        let eligible = to == ListingStatus::Published
            && self.directory.is_publicly_eligible(listing.owner_id).await;
        let media = media_refs(&listing);

        if !apply_transition(&mut listing, to, eligible)? {
            return Ok(listing);
        }

        let mut uow = self.db.begin();
        if to == ListingStatus::Deleted {
            self.schedule_deletes(&mut uow, media);
        }
        uow.update_listing(listing);
        let stored = self.commit_one(uow, listing_id).await?;

        self.audit.record(AuditEntry::listing(
            "STATUS_UPDATE",
            listing_id,
            actor.label(),
            format!("status changed from {from} to {to}"),
        ));
        info!(target = "listings.lifecycle", listing_id, %from, %to, active = stored.active, "status updated");
        Ok(stored)
    }

    /// Shows or hides a listing. Turning visibility on is silently downgraded
    /// for owners that may not list publicly.
    pub async fn toggle_visibility(
        &self,
        actor: Actor,
        listing_id: u64,
        visible: bool,
        expected_version: Option<u64>,
    ) -> LifecycleResult<Listing> {
        let mut listing = self
            .load_for(&actor, listing_id, Capability::ModifyListing, expected_version)
            .await?;
        if listing.status == ListingStatus::Deleted {
            return Err(LifecycleError::validation(
                "toggle_visibility",
                "deleted listings cannot be shown",
            ));
        }
        let mut visible = visible;
        if visible && !self.directory.is_publicly_eligible(listing.owner_id).await {
            info!(
                target = "listings.lifecycle",
                listing_id,
                owner_id = listing.owner_id,
                "owner cannot list publicly; visibility toggle suppressed"
            );
            visible = false;
        }
        listing.active = visible;
        let stored = self.write(listing).await?;
        self.audit.record(AuditEntry::listing(
            "VISIBILITY_UPDATE",
            listing_id,
            actor.label(),
            format!("visibility set to {visible} by user {}", actor.id),
        ));
        Ok(stored)
    }

    // ---- media -----------------------------------------------------------

    /// Legacy path: media already hosted somewhere, referenced by URL.
    pub async fn upload_media(
        &self,
        actor: Actor,
        listing_id: u64,
        media: MediaUrls,
    ) -> LifecycleResult<Listing> {
        let mut listing = self.load_media_target(&actor, listing_id).await?;
        if media.images.is_none() && media.video.is_none() {
            return Err(LifecycleError::validation("upload_media", "no media given"));
        }

        let mut superseded = Vec::new();
        if let Some(images) = media.images {
            let images = deduplicate(
                images
                    .into_iter()
                    .map(|url| url.trim().to_string())
                    .filter(|url| !url.is_empty())
                    .collect(),
            );
            if images.len() > self.policy.max_images {
                return Err(LifecycleError::media_limit(
                    "upload_media",
                    format!("at most {} images are allowed", self.policy.max_images),
                ));
            }
            for url in &images {
                validate_media_url(url, &self.policy)?;
            }
            superseded.extend(listing.images.iter().filter(|old| !images.contains(old)).cloned());
            listing.images = images;
        }
        if let Some(video) = media.video.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
            validate_media_url(&video, &self.policy)?;
            if let Some(old) = listing.video.replace(video.clone())
                && old != video
            {
                superseded.push(old);
            }
        }
        listing.ensure_banner();
        listing.media_status = MediaStatus::Ready;
        let eligible = self.directory.is_publicly_eligible(listing.owner_id).await;
        settle_after_media_ready(&mut listing, eligible);

        let mut uow = self.db.begin();
        self.schedule_deletes(&mut uow, superseded);
        uow.update_listing(listing);
        let stored = self.commit_one(uow, listing_id).await?;
        self.audit.record(AuditEntry::listing(
            "MEDIA_UPLOAD",
            listing_id,
            actor.label(),
            format!("{} images, video: {}", stored.images.len(), stored.video.is_some()),
        ));
        Ok(stored)
    }

    pub async fn finalize_media(
        &self,
        actor: Actor,
        listing_id: u64,
        upload_ids: &[u64],
    ) -> LifecycleResult<FinalizeReport> {
        self.load_for(&actor, listing_id, Capability::ManageMedia, None).await?;
        let report = self.pipeline.finalize(listing_id, upload_ids, Some(actor)).await?;
        self.audit.record(AuditEntry::listing(
            "MEDIA_FINALIZE",
            listing_id,
            actor.label(),
            format!("{} files finalized", report.files.len()),
        ));
        Ok(report)
    }

    pub async fn delete_image_at(&self, actor: Actor, listing_id: u64, index: usize) -> LifecycleResult<Listing> {
        let mut listing = self.load_media_target(&actor, listing_id).await?;
        check_index("delete_image", index, listing.images.len())?;

        let removed = listing.images.remove(index);
        if listing.banner.as_ref() == Some(&removed) {
            listing.banner = None;
        }
        listing.ensure_banner();
        let stored = self.write(listing).await?;
        self.delete_best_effort(&removed).await;
        self.audit.record(AuditEntry::listing(
            "MEDIA_DELETE",
            listing_id,
            actor.label(),
            format!("image {index} removed"),
        ));
        Ok(stored)
    }

    pub async fn replace_image_at(
        &self,
        actor: Actor,
        listing_id: u64,
        index: usize,
        url: &str,
    ) -> LifecycleResult<Listing> {
        let mut listing = self.load_media_target(&actor, listing_id).await?;
        check_index("replace_image", index, listing.images.len())?;
        let url = url.trim().to_string();
        validate_media_url(&url, &self.policy)?;
        if listing
            .images
            .iter()
            .enumerate()
            .any(|(i, existing)| i != index && *existing == url)
        {
            return Err(LifecycleError::validation(
                "replace_image",
                "image is already part of the listing",
            ));
        }

        let old = std::mem::replace(&mut listing.images[index], url.clone());
        if listing.banner.as_ref() == Some(&old) {
            listing.banner = Some(url);
        }
        listing.ensure_banner();
        let stored = self.write(listing).await?;
        if !stored.images.contains(&old) {
            self.delete_best_effort(&old).await;
        }
        self.audit.record(AuditEntry::listing(
            "MEDIA_REPLACE",
            listing_id,
            actor.label(),
            format!("image {index} replaced"),
        ));
        Ok(stored)
    }

    pub async fn delete_video(&self, actor: Actor, listing_id: u64) -> LifecycleResult<Listing> {
        let mut listing = self.load_media_target(&actor, listing_id).await?;
        let Some(video) = listing.video.take() else {
            return Err(LifecycleError::validation("delete_video", "listing has no video"));
        };
        let stored = self.write(listing).await?;
        self.delete_best_effort(&video).await;
        self.audit.record(AuditEntry::listing(
            "MEDIA_DELETE",
            listing_id,
            actor.label(),
            "video removed",
        ));
        Ok(stored)
    }

    pub async fn set_banner_at(&self, actor: Actor, listing_id: u64, index: usize) -> LifecycleResult<Listing> {
        let mut listing = self.load_media_target(&actor, listing_id).await?;
        check_index("set_banner", index, listing.images.len())?;
        listing.banner = Some(listing.images[index].clone());
        self.write(listing).await
    }

    // ---- delete ----------------------------------------------------------

    /// Moves the listing to DELETED and wipes its stored media. `hard` also
    /// purges every temporary upload linked to it, and may be repeated on an
    /// already deleted listing.
    pub async fn delete_listing(&self, actor: Actor, listing_id: u64, hard: bool) -> LifecycleResult<Listing> {
        let mut listing = self
            .load_for(&actor, listing_id, Capability::DeleteListing, None)
            .await?;
        if listing.status == ListingStatus::Deleted && !hard {
            return Ok(listing);
        }

        let media = media_refs(&listing);
        let changed = apply_transition(&mut listing, ListingStatus::Deleted, false)?;
        let linked: Vec<u64> = if hard {
            self.db
                .uploads_for_listing(listing_id)
                .await
                .into_iter()
                .map(|u| u.id)
                .collect()
        } else {
            Vec::new()
        };

        let mut uow = self.db.begin();
        self.schedule_deletes(&mut uow, media);
        if !linked.is_empty() {
            let queue = self.queue.clone();
            uow.after_commit(move || {
                queue.submit_with_id(Uuid::new_v4(), BackgroundTask::PurgeUploads { upload_ids: linked })
            });
        }
        let stored = if changed {
            uow.update_listing(listing);
            self.commit_one(uow, listing_id).await?
        } else {
            uow.commit().await?;
            listing
        };

        self.audit.record(AuditEntry::listing(
            "DELETE",
            listing_id,
            actor.label(),
            format!(
                "listing {} deleted by user {}",
                if hard { "hard" } else { "soft" },
                actor.id
            ),
        ));
        info!(target = "listings.lifecycle", listing_id, hard, "listing deleted");
        Ok(stored)
    }

    // ---- temporary uploads ----------------------------------------------

    pub async fn register_upload(&self, actor: Actor, upload: NewUpload) -> LifecycleResult<TemporaryUpload> {
        self.access.check(&actor, Capability::UploadFiles, None)?;
        if upload.bytes.is_empty() {
            return Err(LifecycleError::validation("register_upload", "file is empty"));
        }

        let content_hash = content_digest(&upload.bytes);
        if let Some(claimed) = upload.content_hash.as_deref().map(str::trim)
            && !claimed.is_empty()
            && !claimed.eq_ignore_ascii_case(&content_hash)
        {
            warn!(
                target = "listings.media",
                uploader_id = actor.id,
                claimed,
                computed = %content_hash,
                "upload checksum mismatch"
            );
            return Err(LifecycleError::validation(
                "register_upload",
                "content hash does not match the uploaded bytes",
            ));
        }

        let id = self.db.next_upload_id();
        let mut record = TemporaryUpload {
            id,
            content_hash,
            uploader_id: actor.id,
            original_filename: upload.filename,
            content_type: upload.content_type,
            detected_type: sniff_content_type(&upload.bytes).map(String::from),
            size_bytes: upload.bytes.len() as u64,
            temp_ref: String::new(),
            storage_status: StorageStatus::Temp,
            owner_resource_id: None,
            attempt: 0,
            next_retry_at: None,
            last_error: None,
            permanent_ref: None,
            created_at: Utc::now(),
        };
        classify_upload(&record, &self.policy)
            .map_err(|err| LifecycleError::validation("register_upload", err.detail()))?;

        let path = temp_path(actor.id, id, &record.original_filename);
        record.temp_ref = self
            .storage
            .put(&path, upload.bytes, record.content_type.as_deref())
            .await
            .map_err(|err| LifecycleError::storage("register_upload", err.to_string()))?;
        self.db.insert_upload(record.clone()).await;
        info!(
            target = "listings.media",
            upload_id = id,
            uploader_id = actor.id,
            size_bytes = record.size_bytes,
            "temporary upload stored"
        );
        Ok(record)
    }

    // ---- public reads ----------------------------------------------------

    /// Public detail view. Hidden listings read as missing. Counts a view for
    /// anyone but the owner.
    pub async fn get_public_listing(&self, listing_id: u64, viewer_id: Option<u64>) -> LifecycleResult<PublicListing> {
        let public = match self.cache.get_detail(listing_id).await {
            Some(hit) => hit,
            None => {
                let listing = self.db.load_listing(listing_id).await?;
                if !listing.is_publicly_visible() {
                    return Err(LifecycleError::not_found("get_listing", "listing", listing_id));
                }
                let public = PublicListing::from(&listing);
                self.cache.put_detail(&public).await;
                public
            }
        };
        self.views.record_view(listing_id, viewer_id, public.owner_id);
        Ok(public)
    }

    pub async fn list_public(&self, request: PageRequest) -> LifecycleResult<ListingPage> {
        if request.size == 0 || request.size > MAX_PAGE_SIZE {
            return Err(LifecycleError::validation(
                "list_listings",
                format!("page size must be between 1 and {MAX_PAGE_SIZE}"),
            ));
        }
        if let Some(page) = self.cache.get_page(&request).await {
            return Ok(page);
        }

        let mut visible = self.db.listings_where(Listing::is_publicly_visible).await;
        match request.sort {
            SortOrder::Newest => visible.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id))),
            SortOrder::Oldest => visible.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id))),
            SortOrder::PriceAsc => visible.sort_by_key(|l| (l.content.price_cents, l.id)),
            SortOrder::PriceDesc => visible.sort_by(|a, b| {
                b.content
                    .price_cents
                    .cmp(&a.content.price_cents)
                    .then(a.id.cmp(&b.id))
            }),
        }
        let total = visible.len();
        let items = visible
            .iter()
            .skip(request.page as usize * request.size as usize)
            .take(request.size as usize)
            .map(PublicListing::from)
            .collect();
        let page = ListingPage {
            items,
            page: request.page,
            size: request.size,
            total,
        };
        self.cache.put_page(&request, &page).await;
        Ok(page)
    }

    // ---- helpers ---------------------------------------------------------

    async fn load_for(
        &self,
        actor: &Actor,
        listing_id: u64,
        capability: Capability,
        expected_version: Option<u64>,
    ) -> LifecycleResult<Listing> {
        let listing = self.db.load_listing(listing_id).await?;
        self.access.check(actor, capability, Some(&listing))?;
        if let Some(expected) = expected_version
            && listing.version != Some(expected)
        {
            return Err(LifecycleError::conflict("version_check", listing_id));
        }
        Ok(listing)
    }

    async fn load_media_target(&self, actor: &Actor, listing_id: u64) -> LifecycleResult<Listing> {
        let listing = self
            .load_for(actor, listing_id, Capability::ManageMedia, None)
            .await?;
        if listing.status.locks_media() {
            return Err(LifecycleError::invalid_media_state("media_change", listing.status));
        }
        Ok(listing)
    }

    async fn write(&self, listing: Listing) -> LifecycleResult<Listing> {
        let listing_id = listing.id;
        let mut uow = self.db.begin();
        uow.update_listing(listing);
        self.commit_one(uow, listing_id).await
    }

    async fn commit_one(&self, uow: UnitOfWork, listing_id: u64) -> LifecycleResult<Listing> {
        let stored = uow
            .commit()
            .await?
            .pop()
            .ok_or_else(|| LifecycleError::internal("commit", "listing write lost"))?;
        self.cache.evict_listing(listing_id).await;
        Ok(stored)
    }

    fn schedule_deletes(&self, uow: &mut UnitOfWork, references: Vec<String>) {
        if references.is_empty() {
            return;
        }
        let queue = self.queue.clone();
        uow.after_commit(move || {
            queue.submit_with_id(Uuid::new_v4(), BackgroundTask::DeleteObjects { references })
        });
    }

    async fn delete_best_effort(&self, reference: &str) -> bool {
        match self.storage.delete(reference).await {
            Ok(()) => true,
            Err(err) => {
                warn!(target = "listings.media", reference, error = %err, "storage delete failed; record already updated");
                false
            }
        }
    }

    async fn purge_uploads(&self, upload_ids: &[u64]) -> usize {
        let mut purged = 0;
        for id in upload_ids {
            let Some(upload) = self.db.get_upload(*id).await else {
                continue;
            };
            if upload.storage_status != StorageStatus::Finalized {
                self.delete_best_effort(&upload.temp_ref).await;
            }
            if self.db.delete_upload(*id).await {
                purged += 1;
            }
        }
        purged
    }
}

#[async_trait]
impl TaskRunner for ListingService {
    async fn run(&self, task: BackgroundTask) -> LifecycleResult<Value> {
        match task {
            BackgroundTask::FinalizeMedia {
                listing_id,
                upload_ids,
                actor,
            } => {
                let report = self.pipeline.finalize(listing_id, &upload_ids, actor).await?;
                let label = actor.map(|a| a.label()).unwrap_or_else(|| "system".to_string());
                self.audit.record(AuditEntry::listing(
                    "MEDIA_FINALIZE",
                    listing_id,
                    label,
                    format!("{} files finalized in background", report.files.len()),
                ));
                serde_json::to_value(report)
                    .map_err(|err| LifecycleError::internal("finalize_media", err.to_string()))
            }
            BackgroundTask::DeleteObjects { references } => {
                let mut deleted = 0;
                for reference in &references {
                    if self.delete_best_effort(reference).await {
                        deleted += 1;
                    }
                }
                debug!(target = "listings.media", requested = references.len(), deleted, "objects deleted");
                Ok(json!({ "requested": references.len(), "deleted": deleted }))
            }
            BackgroundTask::PurgeUploads { upload_ids } => {
                let purged = self.purge_uploads(&upload_ids).await;
                Ok(json!({ "requested": upload_ids.len(), "purged": purged }))
            }
        }
    }
}

fn media_refs(listing: &Listing) -> Vec<String> {
    listing
        .images
        .iter()
        .cloned()
        .chain(listing.video.clone())
        .collect()
}

fn check_index(operation: &'static str, index: usize, len: usize) -> LifecycleResult<()> {
    if index >= len {
        return Err(LifecycleError::validation(
            operation,
            format!("image index {index} out of bounds for {len} images"),
        ));
    }
    Ok(())
}

fn deduplicate_ids(ids: &[u64]) -> Vec<u64> {
    let mut seen = std::collections::HashSet::new();
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

/// Lowercase hex SHA-256 of the file bytes.
fn content_digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditSeverity;
    use crate::jobs::JobState;
    use crate::models::Role;
    use crate::test_support::{Harness, content, sample_bytes};
    use std::time::Duration;

    fn create_request(temp_file_ids: Vec<u64>) -> CreateListingRequest {
        CreateListingRequest {
            content: content(1_000_000),
            co_owner_id: None,
            temp_file_ids,
        }
    }

    fn update_request(price_cents: u64, expected_version: Option<u64>) -> UpdateListingRequest {
        UpdateListingRequest {
            content: content(price_cents),
            expected_version,
        }
    }

    async fn published(h: &Harness) -> Listing {
        h.directory.set_eligible(h.owner.id, true).await;
        let listing = h.listing().await;
        let a = h.upload(h.owner.id, "a.jpg").await;
        let b = h.upload(h.owner.id, "b.jpg").await;
        h.service
            .finalize_media(h.owner, listing.id, &[a, b])
            .await
            .expect("finalize");
        h.db.load_listing(listing.id).await.unwrap()
    }

    async fn until_gone(h: &Harness, reference: &str) -> bool {
        for _ in 0..200 {
            if !h.storage.contains(reference).await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    #[tokio::test]
    async fn create_is_idempotent_per_owner_and_key() {
        let h = Harness::new().await;
        let first = h
            .service
            .create_listing(h.owner, create_request(vec![]), Some(" key-1 "))
            .await
            .unwrap();
        let second = h
            .service
            .create_listing(h.owner, create_request(vec![]), Some("key-1"))
            .await
            .unwrap();

        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(first.listing.id, second.listing.id);
        assert_eq!(first.listing.status, ListingStatus::Processing);
        assert_eq!(first.listing.media_status, MediaStatus::Init);
        assert!(first.finalize_task.is_none());
        assert_eq!(h.audit.actions(), vec!["CREATE"]);

        let other = h
            .service
            .create_listing(Actor::new(11, Role::User), create_request(vec![]), Some("key-1"))
            .await
            .unwrap();
        assert_ne!(other.listing.id, first.listing.id);
    }

    #[tokio::test]
    async fn create_with_temp_files_finalizes_in_background() {
        let h = Harness::new().await;
        h.directory.set_eligible(h.owner.id, true).await;
        let a = h.upload(h.owner.id, "front.jpg").await;
        let v = h.upload(h.owner.id, "walkaround.mp4").await;

        let outcome = h
            .service
            .create_listing(h.owner, create_request(vec![a, v, a]), None)
            .await
            .unwrap();
        assert_eq!(outcome.listing.media_status, MediaStatus::Processing);
        assert_eq!(h.db.get_upload(a).await.unwrap().owner_resource_id, Some(outcome.listing.id));

        let task = outcome.finalize_task.expect("finalize scheduled");
        let info = h.queue.wait_for(task).await;
        assert!(matches!(info.state, JobState::Completed { .. }), "{:?}", info.state);

        let stored = h.db.load_listing(outcome.listing.id).await.unwrap();
        assert_eq!(stored.status, ListingStatus::Published);
        assert_eq!(stored.media_status, MediaStatus::Ready);
        assert_eq!(stored.images.len(), 1);
        assert!(stored.video.is_some());
        assert!(stored.is_publicly_visible());
    }

    #[tokio::test]
    async fn create_refuses_someone_elses_upload() {
        let h = Harness::new().await;
        let theirs = h.upload(99, "a.jpg").await;
        let err = h
            .service
            .create_listing(h.owner, create_request(vec![theirs]), Some("k"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Security);
        assert!(h.db.find_by_idempotency_key(h.owner.id, "k").await.is_none());
    }

    #[tokio::test]
    async fn stale_expected_version_is_a_conflict() {
        let h = Harness::new().await;
        let listing = h.listing().await;
        let updated = h
            .service
            .update_listing(h.owner, listing.id, update_request(1_050_000, Some(0)))
            .await
            .unwrap();
        assert_eq!(updated.version, Some(1));

        let err = h
            .service
            .update_listing(h.owner, listing.id, update_request(1_060_000, Some(0)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConcurrencyConflict);
        assert_eq!(h.db.raw_listing(listing.id).await.unwrap().content.price_cents, 1_050_000);
    }

    #[tokio::test]
    async fn large_price_moves_are_refused_or_flagged() {
        let h = Harness::new().await;
        let listing = h.listing().await;

        let err = h
            .service
            .update_listing(h.owner, listing.id, update_request(1_900_000, None))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PriceChangeRejected);
        assert_eq!(h.db.raw_listing(listing.id).await.unwrap().version, Some(0));

        h.service
            .update_listing(h.owner, listing.id, update_request(1_500_000, None))
            .await
            .expect("50% is allowed but flagged");
        h.service
            .update_listing(h.owner, listing.id, update_request(1_600_000, None))
            .await
            .expect("routine change");

        let admin = Actor::new(1, Role::Admin);
        h.service
            .update_listing(admin, listing.id, update_request(3_500_000, None))
            .await
            .expect("admins bypass the ceiling");

        let entries = h.audit.entries();
        let rejected = entries.iter().find(|e| e.action == "PRICE_CHANGE_REJECTED").unwrap();
        assert_eq!(rejected.severity, AuditSeverity::Security);
        let flagged: Vec<_> = entries.iter().filter(|e| e.action == "PRICE_CHANGE_LARGE").collect();
        assert_eq!(flagged.len(), 2, "the 50% move and the admin move");
        assert!(entries.iter().any(|e| e.action == "PRICE_UPDATE"));
    }

    #[tokio::test]
    async fn price_is_frozen_once_sold() {
        let h = Harness::new().await;
        let listing = published(&h).await;
        h.service
            .update_status(h.owner, listing.id, ListingStatus::Sold, None)
            .await
            .unwrap();
        let err = h
            .service
            .update_listing(h.owner, listing.id, update_request(1_100_000, None))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn status_changes_follow_the_transition_table() {
        let h = Harness::new().await;
        let listing = published(&h).await;

        let reserved = h
            .service
            .update_status(h.owner, listing.id, ListingStatus::Reserved, None)
            .await
            .unwrap();
        assert!(reserved.active && !reserved.available && !reserved.sold);

        let again = h
            .service
            .update_status(h.owner, listing.id, ListingStatus::Reserved, None)
            .await
            .unwrap();
        assert_eq!(again.version, reserved.version, "same status writes nothing");

        let sold = h
            .service
            .update_status(h.owner, listing.id, ListingStatus::Sold, None)
            .await
            .unwrap();
        assert!(sold.sold && !sold.is_publicly_visible());

        let err = h
            .service
            .update_status(h.owner, listing.id, ListingStatus::Published, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);

        let stranger = Actor::new(55, Role::User);
        let err = h
            .service
            .update_status(stranger, listing.id, ListingStatus::Archived, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn visibility_is_suppressed_for_ineligible_owners() {
        let h = Harness::new().await;
        let listing = h.listing().await;
        let stored = h
            .service
            .toggle_visibility(h.owner, listing.id, true, None)
            .await
            .unwrap();
        assert!(!stored.active);

        h.directory.set_eligible(h.owner.id, true).await;
        let stored = h
            .service
            .toggle_visibility(h.owner, listing.id, true, None)
            .await
            .unwrap();
        assert!(stored.active);
    }

    #[tokio::test]
    async fn deleting_the_banner_image_moves_the_banner() {
        let h = Harness::new().await;
        let listing = h.listing().await;
        let urls: Vec<String> = ["a", "b", "c"]
            .iter()
            .map(|n| format!("https://cdn.example.com/{n}.jpg"))
            .collect();
        let stored = h
            .service
            .upload_media(
                h.owner,
                listing.id,
                MediaUrls {
                    images: Some(urls.clone()),
                    video: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(stored.banner.as_ref(), Some(&urls[0]));
        assert_eq!(stored.media_status, MediaStatus::Ready);
        assert_eq!(stored.status, ListingStatus::PendingVerification);

        let stored = h.service.delete_image_at(h.owner, listing.id, 0).await.unwrap();
        assert_eq!(stored.images, urls[1..].to_vec());
        assert_eq!(stored.banner.as_ref(), Some(&urls[1]));

        let err = h.service.delete_image_at(h.owner, listing.id, 2).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let stored = h.service.set_banner_at(h.owner, listing.id, 1).await.unwrap();
        assert_eq!(stored.banner.as_ref(), Some(&urls[2]));
        let replacement = "https://cdn.example.com/d.jpg";
        let stored = h
            .service
            .replace_image_at(h.owner, listing.id, 1, replacement)
            .await
            .unwrap();
        assert_eq!(stored.banner.as_deref(), Some(replacement));
    }

    #[tokio::test]
    async fn failed_storage_delete_does_not_fail_the_edit() {
        let h = Harness::new().await;
        h.directory.set_eligible(h.owner.id, true).await;
        let listing = h.listing().await;
        let v = h.upload(h.owner.id, "tour.mp4").await;
        h.service.finalize_media(h.owner, listing.id, &[v]).await.unwrap();
        let video = h.db.load_listing(listing.id).await.unwrap().video.unwrap();

        h.storage.fail_next_deletes(1);
        let stored = h.service.delete_video(h.owner, listing.id).await.unwrap();
        assert!(stored.video.is_none());
        assert!(h.storage.contains(&video).await, "object left behind, record wins");

        let err = h.service.delete_video(h.owner, listing.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn media_is_frozen_in_terminal_states() {
        let h = Harness::new().await;
        let listing = published(&h).await;
        h.service
            .update_status(h.owner, listing.id, ListingStatus::Archived, None)
            .await
            .unwrap();
        let err = h.service.delete_image_at(h.owner, listing.id, 0).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidStateForMediaChange);
    }

    #[tokio::test]
    async fn public_reads_hide_unpublished_and_skip_owner_views() {
        let h = Harness::new().await;
        let hidden = h.listing().await;
        let err = h.service.get_public_listing(hidden.id, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let listing = published(&h).await;
        h.service.get_public_listing(listing.id, Some(h.owner.id)).await.unwrap();
        h.service.get_public_listing(listing.id, Some(77)).await.unwrap();
        h.service.get_public_listing(listing.id, None).await.unwrap();
        assert!(h.cache.has_detail(listing.id).await);

        assert_eq!(h.service.views().flush().await, 2);
        let stored = h.db.load_listing(listing.id).await.unwrap();
        assert_eq!(stored.view_count, 2);
        assert_eq!(stored.version, listing.version, "views never bump the version");
    }

    #[tokio::test]
    async fn writes_evict_cached_pages() {
        let h = Harness::new().await;
        let listing = published(&h).await;
        let request = PageRequest {
            page: 0,
            size: 10,
            sort: SortOrder::Newest,
        };
        let page = h.service.list_public(request).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(h.cache.page_count().await, 1);

        h.service
            .update_listing(h.owner, listing.id, update_request(1_010_000, None))
            .await
            .unwrap();
        assert_eq!(h.cache.page_count().await, 0);

        let err = h
            .service
            .list_public(PageRequest { size: 0, ..request })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn soft_delete_wipes_stored_media() {
        let h = Harness::new().await;
        let listing = published(&h).await;
        let image = listing.images[0].clone();

        let deleted = h.service.delete_listing(h.owner, listing.id, false).await.unwrap();
        assert_eq!(deleted.status, ListingStatus::Deleted);
        assert!(deleted.images.is_empty() && deleted.banner.is_none());
        assert!(until_gone(&h, &image).await, "permanent media removed");

        let again = h.service.delete_listing(h.owner, listing.id, false).await.unwrap();
        assert_eq!(again.version, deleted.version);
        let err = h
            .service
            .update_listing(h.owner, listing.id, update_request(1_000_000, None))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn hard_delete_also_purges_uploads() {
        let h = Harness::new().await;
        let listing = published(&h).await;
        let uploads = h.db.uploads_for_listing(listing.id).await;
        assert_eq!(uploads.len(), 2);

        h.service.delete_listing(h.owner, listing.id, true).await.unwrap();
        for _ in 0..200 {
            if h.db.uploads_for_listing(listing.id).await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(h.db.uploads_for_listing(listing.id).await.is_empty());
    }

    #[tokio::test]
    async fn registered_uploads_are_classified_and_staged() {
        let h = Harness::new().await;
        let upload = h
            .service
            .register_upload(
                h.owner,
                NewUpload {
                    filename: "side.JPG".into(),
                    content_type: Some("image/jpeg".into()),
                    bytes: sample_bytes("side.jpg"),
                    content_hash: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(upload.storage_status, StorageStatus::Temp);
        assert_eq!(upload.content_hash, content_digest(&sample_bytes("side.jpg")));
        assert_eq!(upload.content_hash.len(), 64);
        assert_eq!(upload.detected_type.as_deref(), Some("image/jpeg"));
        assert!(h.storage.contains(&upload.temp_ref).await);

        let err = h
            .service
            .register_upload(
                h.owner,
                NewUpload {
                    filename: "notes.exe".into(),
                    content_type: None,
                    bytes: vec![1],
                    content_hash: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn digest_is_hex_sha256() {
        assert_eq!(
            content_digest(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn supplied_checksums_are_verified() {
        let h = Harness::new().await;
        let bytes = sample_bytes("front.jpg");
        let digest = content_digest(&bytes);

        let accepted = h
            .service
            .register_upload(
                h.owner,
                NewUpload {
                    filename: "front.jpg".into(),
                    content_type: None,
                    bytes: bytes.clone(),
                    content_hash: Some(digest.to_ascii_uppercase()),
                },
            )
            .await
            .expect("matching hash, any case");
        assert_eq!(accepted.content_hash, digest);

        let err = h
            .service
            .register_upload(
                h.owner,
                NewUpload {
                    filename: "front.jpg".into(),
                    content_type: None,
                    bytes,
                    content_hash: Some(content_digest(b"something else")),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(h.storage.put_count(), 1, "mismatched bytes never stored");
    }

    #[tokio::test]
    async fn renamed_executables_are_refused_at_registration() {
        let h = Harness::new().await;
        let mut bytes = b"MZ\x90\x00".to_vec();
        bytes.resize(64, 0);
        let err = h
            .service
            .register_upload(
                h.owner,
                NewUpload {
                    filename: "photo.jpg".into(),
                    content_type: Some("image/jpeg".into()),
                    bytes,
                    content_hash: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.detail().contains("application/x-msdownload"), "{}", err.detail());
        assert_eq!(h.storage.put_count(), 0);
    }
}
