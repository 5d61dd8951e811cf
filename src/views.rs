use crate::store::Database;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Batches listing views in memory and writes them as atomic increments.
/// Recording never waits on the record store.
#[derive(Clone)]
pub struct ViewCounter {
    db: Database,
    pending: Arc<Mutex<HashMap<u64, u64>>>,
}

impl ViewCounter {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Counts one view unless the viewer owns the listing.
    pub fn record_view(&self, listing_id: u64, viewer_id: Option<u64>, owner_id: u64) -> bool {
        if viewer_id == Some(owner_id) {
            return false;
        }
        match self.pending.lock() {
            Ok(mut pending) => {
                *pending.entry(listing_id).or_default() += 1;
                true
            }
            Err(_) => {
                warn!(target = "listings.views", listing_id, "view buffer unavailable; view dropped");
                false
            }
        }
    }

    /// Writes out everything buffered so far. Failed increments are logged
    /// and dropped.
    pub async fn flush(&self) -> u64 {
        let batch: HashMap<u64, u64> = match self.pending.lock() {
            Ok(mut pending) => std::mem::take(&mut *pending),
            Err(_) => return 0,
        };
        if batch.is_empty() {
            return 0;
        }
        let listings = batch.len();
        let mut written = 0;
        for (listing_id, delta) in batch {
            match self.db.increment_view_count(listing_id, delta).await {
                Ok(_) => written += delta,
                Err(err) => {
                    warn!(target = "listings.views", listing_id, delta, error = %err, "view increment failed")
                }
            }
        }
        crate::metrics::views_flushed(listings, written);
        debug!(target = "listings.views", listings, views = written, "views flushed");
        written
    }

    pub fn spawn_flusher(&self, every: Duration) -> JoinHandle<()> {
        let counter = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                counter.flush().await;
            }
        })
    }
}
