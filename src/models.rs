use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ListingStatus {
    Processing,
    PendingVerification,
    Published,
    Reserved,
    Sold,
    Archived,
    Deleted,
}

impl ListingStatus {
    pub const ALL: [ListingStatus; 7] = [
        ListingStatus::Processing,
        ListingStatus::PendingVerification,
        ListingStatus::Published,
        ListingStatus::Reserved,
        ListingStatus::Sold,
        ListingStatus::Archived,
        ListingStatus::Deleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ListingStatus::Processing => "PROCESSING",
            ListingStatus::PendingVerification => "PENDING_VERIFICATION",
            ListingStatus::Published => "PUBLISHED",
            ListingStatus::Reserved => "RESERVED",
            ListingStatus::Sold => "SOLD",
            ListingStatus::Archived => "ARCHIVED",
            ListingStatus::Deleted => "DELETED",
        }
    }

    pub fn from_str(input: &str) -> Option<Self> {
        match input.trim().to_uppercase().as_str() {
            "PROCESSING" => Some(ListingStatus::Processing),
            "PENDING_VERIFICATION" => Some(ListingStatus::PendingVerification),
            "PUBLISHED" | "AVAILABLE" => Some(ListingStatus::Published),
            "RESERVED" => Some(ListingStatus::Reserved),
            "SOLD" => Some(ListingStatus::Sold),
            "ARCHIVED" => Some(ListingStatus::Archived),
            "DELETED" => Some(ListingStatus::Deleted),
            _ => None,
        }
    }

    /// States in which the media set is frozen.
    pub fn locks_media(&self) -> bool {
        matches!(
            self,
            ListingStatus::Sold | ListingStatus::Archived | ListingStatus::Deleted
        )
    }
}

impl fmt::Display for ListingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MediaStatus {
    Init,
    Processing,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageStatus {
    Temp,
    Finalized,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    #[default]
    User,
    Dealer,
    Admin,
}

impl Role {
    pub fn from_str(input: &str) -> Option<Self> {
        match input.trim().to_uppercase().as_str() {
            "USER" => Some(Role::User),
            "DEALER" => Some(Role::Dealer),
            "ADMIN" => Some(Role::Admin),
            _ => None,
        }
    }
}

/// The authenticated caller of a lifecycle operation.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct Actor {
    pub id: u64,
    pub role: Role,
}

impl Actor {
    pub fn new(id: u64, role: Role) -> Self {
        Self { id, role }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn label(&self) -> String {
        format!("user-{}", self.id)
    }
}

/// Vehicle details. Only the fields the lifecycle validates are typed; the
/// rest travels through untouched in `specs`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListingContent {
    pub make: String,
    pub model: String,
    pub year: i32,
    pub price_cents: u64,
    #[serde(default)]
    pub mileage: Option<u32>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub specs: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Listing {
    pub id: u64,
    pub owner_id: u64,
    pub co_owner_id: Option<u64>,
    pub content: ListingContent,
    pub status: ListingStatus,
    pub media_status: MediaStatus,
    /// `None` only on rows written before versioning existed.
    pub version: Option<u64>,
    pub idempotency_key: Option<String>,
    pub images: Vec<String>,
    pub video: Option<String>,
    pub banner: Option<String>,
    pub active: bool,
    pub available: bool,
    pub sold: bool,
    pub view_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Listing {
    pub fn draft(
        id: u64,
        owner_id: u64,
        co_owner_id: Option<u64>,
        content: ListingContent,
        idempotency_key: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            owner_id,
            co_owner_id,
            content,
            status: ListingStatus::Processing,
            media_status: MediaStatus::Init,
            version: Some(0),
            idempotency_key,
            images: Vec::new(),
            video: None,
            banner: None,
            active: false,
            available: false,
            sold: false,
            view_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_owned_by(&self, user_id: u64) -> bool {
        self.owner_id == user_id || self.co_owner_id == Some(user_id)
    }

    pub fn is_publicly_visible(&self) -> bool {
        self.active
            && !self.sold
            && self.media_status == MediaStatus::Ready
            && matches!(
                self.status,
                ListingStatus::Published | ListingStatus::Reserved
            )
    }

    pub fn clear_media(&mut self) -> Vec<String> {
        let mut removed = std::mem::take(&mut self.images);
        removed.extend(self.video.take());
        self.banner = None;
        removed
    }

    /// Keeps the banner pointing at an image in the list, defaulting to the first.
    pub fn ensure_banner(&mut self) {
        let valid = self
            .banner
            .as_ref()
            .is_some_and(|banner| self.images.contains(banner));
        if !valid {
            self.banner = self.images.first().cloned();
        }
    }
}

/// A file staged by a client before it is attached to a listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TemporaryUpload {
    pub id: u64,
    pub content_hash: String,
    pub uploader_id: u64,
    pub original_filename: String,
    pub content_type: Option<String>,
    /// Recognised from the file's leading bytes at registration.
    #[serde(default)]
    pub detected_type: Option<String>,
    pub size_bytes: u64,
    pub temp_ref: String,
    pub storage_status: StorageStatus,
    pub owner_resource_id: Option<u64>,
    pub attempt: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub permanent_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Running,
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobExecutionRecord {
    pub id: Uuid,
    pub job_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub error_message: Option<String>,
    pub metrics: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateListingRequest {
    #[serde(flatten)]
    pub content: ListingContent,
    #[serde(default)]
    pub co_owner_id: Option<u64>,
    #[serde(default)]
    pub temp_file_ids: Vec<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateListingRequest {
    #[serde(flatten)]
    pub content: ListingContent,
    #[serde(default)]
    pub expected_version: Option<u64>,
}

/// What anonymous readers see; also the shape stored in the read caches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublicListing {
    pub id: u64,
    pub owner_id: u64,
    pub make: String,
    pub model: String,
    pub year: i32,
    pub price_cents: u64,
    pub mileage: Option<u32>,
    pub description: Option<String>,
    pub status: ListingStatus,
    pub banner: Option<String>,
    pub images: Vec<String>,
    pub video: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&Listing> for PublicListing {
    fn from(listing: &Listing) -> Self {
        Self {
            id: listing.id,
            owner_id: listing.owner_id,
            make: listing.content.make.clone(),
            model: listing.content.model.clone(),
            year: listing.content.year,
            price_cents: listing.content.price_cents,
            mileage: listing.content.mileage,
            description: listing.content.description.clone(),
            status: listing.status,
            banner: listing.banner.clone(),
            images: listing.images.clone(),
            video: listing.video.clone(),
            created_at: listing.created_at,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Newest,
    Oldest,
    PriceAsc,
    PriceDesc,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Newest => "newest",
            SortOrder::Oldest => "oldest",
            SortOrder::PriceAsc => "price_asc",
            SortOrder::PriceDesc => "price_desc",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PageRequest {
    pub page: u32,
    pub size: u32,
    #[serde(default)]
    pub sort: SortOrder,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListingPage {
    pub items: Vec<PublicListing>,
    pub page: u32,
    pub size: u32,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
