use async_trait::async_trait;
use std::collections::HashSet;
use tokio::sync::RwLock;

/// Answers whether an owner may currently have listings shown publicly
/// (dealer verification, account standing). Computed elsewhere.
#[async_trait]
pub trait OwnerDirectory: Send + Sync {
    async fn is_publicly_eligible(&self, owner_id: u64) -> bool;
}

/// Fixed allow-list, seeded from `PUBLIC_OWNER_IDS` or by tests.
#[derive(Default)]
pub struct StaticOwnerDirectory {
    eligible: RwLock<HashSet<u64>>,
}

impl StaticOwnerDirectory {
    pub fn new(eligible: impl IntoIterator<Item = u64>) -> Self {
        Self {
            eligible: RwLock::new(eligible.into_iter().collect()),
        }
    }

    pub async fn set_eligible(&self, owner_id: u64, eligible: bool) {
        let mut guard = self.eligible.write().await;
        if eligible {
            guard.insert(owner_id);
        } else {
            guard.remove(&owner_id);
        }
    }
}

#[async_trait]
impl OwnerDirectory for StaticOwnerDirectory {
    async fn is_publicly_eligible(&self, owner_id: u64) -> bool {
        self.eligible.read().await.contains(&owner_id)
    }
}
