use crate::directory::OwnerDirectory;
use crate::http::build_client;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct SupabaseClient {
    base_url: String,
    service_key: String,
    http: Client,
}

#[derive(Debug, Error)]
pub enum SupabaseError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
}

/// Row of the `owner_standing` view maintained by the accounts service.
#[derive(Debug, Clone, Deserialize)]
pub struct OwnerStanding {
    #[allow(dead_code)]
    pub owner_id: u64,
    pub role: String,
    #[serde(default)]
    pub dealer_status: Option<String>,
    #[serde(default)]
    pub banned: bool,
}

impl OwnerStanding {
    /// Private sellers list publicly by default; dealers only once verified.
    pub fn can_list_publicly(&self) -> bool {
        if self.banned {
            return false;
        }
        match self.role.trim().to_uppercase().as_str() {
            "DEALER" => self
                .dealer_status
                .as_deref()
                .is_some_and(|s| s.eq_ignore_ascii_case("VERIFIED")),
            "USER" | "ADMIN" => true,
            _ => false,
        }
    }
}

impl SupabaseClient {
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("SUPABASE_URL").ok()?;
        let service_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .or_else(|_| std::env::var("SUPABASE_SERVICE_KEY"))
            .ok()?;
        Some(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key,
            http: build_client(),
        })
    }

    pub async fn fetch_owner_standing(
        &self,
        owner_id: u64,
    ) -> Result<Option<OwnerStanding>, SupabaseError> {
        let url = format!(
            "{}/rest/v1/owner_standing?owner_id=eq.{}&select={}&limit=1",
            self.base_url,
            owner_id,
            urlencoding::encode("owner_id,role,dealer_status,banned"),
        );
        let response = self
            .http
            .get(url)
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
            .send()
            .await
            .map_err(|err| SupabaseError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(SupabaseError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }

        let mut payload: Vec<OwnerStanding> = response
            .json()
            .await
            .map_err(|err| SupabaseError::Deserialize(err.to_string()))?;
        Ok(payload.pop())
    }
}

#[async_trait]
impl OwnerDirectory for SupabaseClient {
    async fn is_publicly_eligible(&self, owner_id: u64) -> bool {
        match self.fetch_owner_standing(owner_id).await {
            Ok(Some(standing)) => standing.can_list_publicly(),
            Ok(None) => false,
            Err(err) => {
                warn!(target = "listings.supabase", owner_id, error = %err, "owner_standing_lookup_failed");
                false
            }
        }
    }
}
