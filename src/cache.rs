use crate::models::{ListingPage, PageRequest, PublicListing};
use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Serialize, de::DeserializeOwned};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};

const DETAIL_TTL_SECS: u64 = 300;
const PAGE_TTL_SECS: u64 = 120;
const PAGE_INDEX_KEY: &str = "listings:pages";

pub fn detail_key(listing_id: u64) -> String {
    format!("listings:detail:{listing_id}")
}

pub fn page_key(request: &PageRequest) -> String {
    format!(
        "listings:page:{}:{}:{}",
        request.page,
        request.size,
        request.sort.as_str()
    )
}

/// Read-through caches for the public detail view and the public collection.
/// Cache trouble is logged and treated as a miss.
#[async_trait]
pub trait ListingCache: Send + Sync {
    async fn get_detail(&self, listing_id: u64) -> Option<PublicListing>;
    async fn put_detail(&self, listing: &PublicListing);
    async fn get_page(&self, request: &PageRequest) -> Option<ListingPage>;
    async fn put_page(&self, request: &PageRequest, page: &ListingPage);

    /// Drops the detail entry for `listing_id` and every collection page.
    async fn evict_listing(&self, listing_id: u64);
}

#[derive(Default)]
pub struct MemoryCache {
    details: RwLock<HashMap<u64, PublicListing>>,
    pages: RwLock<HashMap<String, ListingPage>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn page_count(&self) -> usize {
        self.pages.read().await.len()
    }

    #[cfg(test)]
    pub async fn has_detail(&self, listing_id: u64) -> bool {
        self.details.read().await.contains_key(&listing_id)
    }
}

#[async_trait]
impl ListingCache for MemoryCache {
    async fn get_detail(&self, listing_id: u64) -> Option<PublicListing> {
        let hit = self.details.read().await.get(&listing_id).cloned();
        crate::metrics::cache_lookup("detail", hit.is_some());
        hit
    }

    async fn put_detail(&self, listing: &PublicListing) {
        self.details.write().await.insert(listing.id, listing.clone());
    }

    async fn get_page(&self, request: &PageRequest) -> Option<ListingPage> {
        let hit = self.pages.read().await.get(&page_key(request)).cloned();
        crate::metrics::cache_lookup("page", hit.is_some());
        hit
    }

    async fn put_page(&self, request: &PageRequest, page: &ListingPage) {
        self.pages.write().await.insert(page_key(request), page.clone());
    }

    async fn evict_listing(&self, listing_id: u64) {
        self.details.write().await.remove(&listing_id);
        let mut pages = self.pages.write().await;
        let evicted = pages.len();
        pages.clear();
        debug!(target = "listings.cache", listing_id, pages = evicted, "cache evicted");
    }
}

/// Reads and drops the page index in one transaction, so a page written
/// afterwards lands in a fresh index instead of being orphaned.
fn eviction_pipeline(listing_id: u64) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic()
        .del(detail_key(listing_id))
        .ignore()
        .smembers(PAGE_INDEX_KEY)
        .del(PAGE_INDEX_KEY)
        .ignore();
    pipe
}

/// Redis-backed cache. Page keys are tracked in a set so that eviction can
/// remove every page without a key scan.
#[derive(Clone)]
pub struct RedisCache {
    client: redis::Client,
}

impl RedisCache {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    async fn redis_get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let mut conn = match self.client.get_multiplexed_async_connection().await {
            Ok(c) => c,
            Err(err) => {
                warn!(target = "listings.cache", error = %err, "redis connection failed");
                return None;
            }
        };
        let s: Option<String> = conn.get(key).await.ok().flatten();
        s.and_then(|v| serde_json::from_str(&v).ok())
    }

    async fn redis_set<T: Serialize + Sync>(&self, key: &str, value: &T, ttl_secs: u64) -> bool {
        if let Ok(mut conn) = self.client.get_multiplexed_async_connection().await
            && let Ok(json) = serde_json::to_string(value)
        {
            let result: Result<(), _> = conn.set_ex(key, json, ttl_secs).await;
            return result.is_ok();
        }
        false
    }
}

#[async_trait]
impl ListingCache for RedisCache {
    async fn get_detail(&self, listing_id: u64) -> Option<PublicListing> {
        let hit = self.redis_get(&detail_key(listing_id)).await;
        crate::metrics::cache_lookup("detail", hit.is_some());
        hit
    }

    async fn put_detail(&self, listing: &PublicListing) {
        self.redis_set(&detail_key(listing.id), listing, DETAIL_TTL_SECS)
            .await;
    }

    async fn get_page(&self, request: &PageRequest) -> Option<ListingPage> {
        let hit = self.redis_get(&page_key(request)).await;
        crate::metrics::cache_lookup("page", hit.is_some());
        hit
    }

    async fn put_page(&self, request: &PageRequest, page: &ListingPage) {
        let key = page_key(request);
        if let Ok(mut conn) = self.client.get_multiplexed_async_connection().await
            && let Ok(json) = serde_json::to_string(page)
        {
            let result: Result<(), _> = redis::pipe()
                .atomic()
                .set_ex(&key, json, PAGE_TTL_SECS)
                .ignore()
                .sadd(PAGE_INDEX_KEY, &key)
                .ignore()
                .query_async(&mut conn)
                .await;
            if let Err(err) = result {
                warn!(target = "listings.cache", key, error = %err, "page cache write failed");
            }
        }
    }

    async fn evict_listing(&self, listing_id: u64) {
        let mut conn = match self.client.get_multiplexed_async_connection().await {
            Ok(c) => c,
            Err(err) => {
                warn!(target = "listings.cache", listing_id, error = %err, "cache eviction skipped");
                return;
            }
        };
        let (pages,): (Vec<String>,) = match eviction_pipeline(listing_id).query_async(&mut conn).await {
            Ok(pages) => pages,
            Err(err) => {
                warn!(target = "listings.cache", listing_id, error = %err, "cache eviction failed");
                return;
            }
        };
        if !pages.is_empty() {
            let _: Result<(), _> = conn.del(&pages).await;
        }
        debug!(target = "listings.cache", listing_id, pages = pages.len(), "cache evicted");
    }
}
