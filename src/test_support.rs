use crate::access::OwnershipPolicy;
use crate::audit::testing::{MemoryAuditLog, RecordingAlerting};
use crate::cache::MemoryCache;
use crate::config::{PolicyFile, RetryPolicy, UploadRetryPolicy};
use crate::directory::StaticOwnerDirectory;
use crate::jobs::TaskQueue;
use crate::media::{file_extension, sniff_content_type};
use crate::models::{Actor, Listing, ListingContent, Role, StorageStatus, TemporaryUpload};
use crate::pipeline::MediaPipeline;
use crate::retry::RetryExecutor;
use crate::service::{Collaborators, ListingService};
use crate::storage::{MemoryObjectStore, ObjectStore, temp_path};
use crate::store::Database;
use chrono::Utc;
use serde_json::json;
use std::{sync::Arc, time::Duration};

pub const OWNER_ID: u64 = 10;

pub fn content(price_cents: u64) -> ListingContent {
    ListingContent {
        make: "Toyota".into(),
        model: "Corolla".into(),
        year: 2018,
        price_cents,
        mileage: Some(42_000),
        description: Some("one owner, full service history".into()),
        specs: json!({ "fuel": "petrol" }),
    }
}

/// 64 bytes starting with the signature of the file type `filename` names.
pub fn sample_bytes(filename: &str) -> Vec<u8> {
    let header: &[u8] = match file_extension(filename).as_deref() {
        Some("jpg" | "jpeg") => &[0xFF, 0xD8, 0xFF, 0xE0],
        Some("png") => &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A],
        Some("webp") => b"RIFF\x00\x00\x00\x00WEBPVP8 ",
        Some("mp4") => b"\x00\x00\x00\x18ftypisom",
        Some("mov") => b"\x00\x00\x00\x14ftypqt  ",
        _ => &[],
    };
    let mut bytes = header.to_vec();
    bytes.resize(64, 7);
    bytes
}

/// Fully wired in-memory service with running workers.
pub struct Harness {
    pub db: Database,
    pub storage: Arc<MemoryObjectStore>,
    pub directory: Arc<StaticOwnerDirectory>,
    pub alerts: Arc<RecordingAlerting>,
    pub audit: Arc<MemoryAuditLog>,
    pub cache: Arc<MemoryCache>,
    pub queue: TaskQueue,
    pub pipeline: MediaPipeline,
    pub service: ListingService,
    pub policies: PolicyFile,
    pub owner: Actor,
}

impl Harness {
    pub async fn new() -> Self {
        let policies = PolicyFile {
            retry: RetryPolicy {
                max_attempts: 2,
                initial_backoff: Duration::from_millis(1),
                multiplier: 2,
                jitter: 0.0,
            },
            uploads: UploadRetryPolicy {
                base_delay: Duration::from_millis(1),
                ..UploadRetryPolicy::default()
            },
            ..PolicyFile::default()
        };
        let db = Database::new();
        let storage = Arc::new(MemoryObjectStore::new());
        let directory = Arc::new(StaticOwnerDirectory::default());
        let alerts = Arc::new(RecordingAlerting::default());
        let audit = Arc::new(MemoryAuditLog::default());
        let cache = Arc::new(MemoryCache::new());

        let (queue, receiver) = TaskQueue::channel(64);
        let parts = Collaborators {
            storage: storage.clone(),
            directory: directory.clone(),
            cache: cache.clone(),
            audit: audit.clone(),
            alerting: alerts.clone(),
            access: Arc::new(OwnershipPolicy),
        };
        let service = ListingService::new(db.clone(), parts, &policies, queue.clone());
        receiver.spawn(Arc::new(service.clone()), 4);

        let pipeline = MediaPipeline::new(
            db.clone(),
            storage.clone(),
            directory.clone(),
            cache.clone(),
            RetryExecutor::new(policies.retry.clone(), db.clone(), alerts.clone()),
            Arc::new(policies.listing.clone()),
            policies.uploads.clone(),
        );

        Self {
            db,
            storage,
            directory,
            alerts,
            audit,
            cache,
            queue,
            pipeline,
            service,
            policies,
            owner: Actor::new(OWNER_ID, Role::User),
        }
    }

    /// A committed listing owned by `owner`, still PROCESSING with no media.
    pub async fn listing(&self) -> Listing {
        let listing = Listing::draft(
            self.db.next_listing_id(),
            self.owner.id,
            None,
            content(1_000_000),
            None,
        );
        let mut uow = self.db.begin();
        uow.insert_listing(listing);
        uow.commit().await.expect("seed listing").remove(0)
    }

    /// Stages `filename` as a temporary upload of `uploader_id`, with bytes
    /// that look like the extension says.
    pub async fn upload(&self, uploader_id: u64, filename: &str) -> u64 {
        self.upload_bytes(uploader_id, filename, sample_bytes(filename)).await
    }

    /// Stages arbitrary bytes, bypassing the registration checks.
    pub async fn upload_bytes(&self, uploader_id: u64, filename: &str, bytes: Vec<u8>) -> u64 {
        let id = self.db.next_upload_id();
        let size_bytes = bytes.len() as u64;
        let detected_type = sniff_content_type(&bytes).map(String::from);
        let temp_ref = self
            .storage
            .put(&temp_path(uploader_id, id, filename), bytes, None)
            .await
            .expect("stage temp bytes");
        self.db
            .insert_upload(TemporaryUpload {
                id,
                content_hash: format!("hash-{id}"),
                uploader_id,
                original_filename: filename.to_string(),
                content_type: None,
                detected_type,
                size_bytes,
                temp_ref,
                storage_status: StorageStatus::Temp,
                owner_resource_id: None,
                attempt: 0,
                next_retry_at: None,
                last_error: None,
                permanent_ref: None,
                created_at: Utc::now(),
            })
            .await;
        id
    }
}
