use crate::models::Listing;
use crate::store::Database;
use tracing::info;

/// Maps `(owner, key)` to the listing a previous create produced.
#[derive(Clone)]
pub struct IdempotencyGuard {
    db: Database,
}

impl IdempotencyGuard {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Trims the key; blank keys disable deduplication.
    pub fn normalize(key: Option<&str>) -> Option<String> {
        key.map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
    }

    pub async fn resolve(&self, owner_id: u64, key: Option<&str>) -> Option<Listing> {
        let key = Self::normalize(key)?;
        let existing = self.db.find_by_idempotency_key(owner_id, &key).await?;
        info!(
            target = "listings.lifecycle",
            owner_id,
            listing_id = existing.id,
            "idempotent create replayed"
        );
        Some(existing)
    }
}
