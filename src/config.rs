use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, DurationSeconds, serde_as};
use std::{env, path::Path, str::FromStr, time::Duration};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read policy file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid policy file {path}: {source}")]
    Yaml {
        path: String,
        source: serde_yaml::Error,
    },
}

/// Product rules for listing content and media. Defaults are the production
/// values; deployments may override them through the policy file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingPolicy {
    pub max_images: usize,
    pub max_videos: usize,
    /// Price moves above this many basis points are refused for non-admins.
    pub price_reject_bps: u64,
    /// Price moves above this many basis points are audited as security events.
    pub price_flag_bps: u64,
    pub min_year: i32,
    pub max_year: i32,
    pub max_mileage: u32,
    pub max_price_cents: u64,
    pub make_len: (usize, usize),
    pub model_len: (usize, usize),
    pub max_description_len: usize,
    pub image_extensions: Vec<String>,
    pub video_extensions: Vec<String>,
    pub max_file_bytes: u64,
    /// Hosts accepted for direct media URLs; empty accepts any http(s) host.
    pub trusted_media_hosts: Vec<String>,
}

impl Default for ListingPolicy {
    fn default() -> Self {
        Self {
            max_images: 8,
            max_videos: 1,
            price_reject_bps: 8_000,
            price_flag_bps: 4_000,
            min_year: 1900,
            max_year: 2030,
            max_mileage: 9_999_999,
            max_price_cents: 99_999_999_999,
            make_len: (2, 50),
            model_len: (1, 100),
            max_description_len: 2_000,
            image_extensions: ["jpg", "jpeg", "png", "webp"]
                .into_iter()
                .map(String::from)
                .collect(),
            video_extensions: ["mp4", "mov"].into_iter().map(String::from).collect(),
            max_file_bytes: 400 * 1024 * 1024,
            trusted_media_hosts: Vec::new(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub initial_backoff: Duration,
    pub multiplier: u32,
    /// Fraction of each delay added as random jitter, 0.0 disables it.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            multiplier: 2,
            jitter: 0.0,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadRetryPolicy {
    pub max_file_retries: u32,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub base_delay: Duration,
    pub max_exponent: u32,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub orphan_retention: Duration,
}

impl Default for UploadRetryPolicy {
    fn default() -> Self {
        Self {
            max_file_retries: 3,
            base_delay: Duration::from_secs(60),
            max_exponent: 3,
            orphan_retention: Duration::from_secs(48 * 60 * 60),
        }
    }
}

impl UploadRetryPolicy {
    /// 1m, 2m, 4m, 8m, then flat.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(self.max_exponent);
        self.base_delay
            .saturating_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyFile {
    pub listing: ListingPolicy,
    pub retry: RetryPolicy,
    pub uploads: UploadRetryPolicy,
}

impl PolicyFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: display.clone(),
            source,
        })?;
        Self::parse(&raw).map_err(|source| ConfigError::Yaml {
            path: display,
            source,
        })
    }

    pub fn parse(raw: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(raw)
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub port: u16,
    pub queue_capacity: usize,
    pub worker_concurrency: usize,
    pub redis_url: Option<String>,
    pub object_store_url: Option<String>,
    pub object_store_token: Option<String>,
    pub alert_webhook_url: Option<String>,
    pub view_flush_interval: Duration,
    pub sweep_interval: Duration,
    pub public_owner_ids: Vec<u64>,
    pub policies: PolicyFile,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut policies = match env::var("LISTING_POLICY_FILE") {
            Ok(path) if !path.trim().is_empty() => {
                let loaded = PolicyFile::load(Path::new(path.trim()))?;
                info!(target = "listings.config", path = %path, "loaded listing policy file");
                loaded
            }
            _ => PolicyFile::default(),
        };

        if let Ok(raw) = env::var("TRUSTED_MEDIA_HOSTS") {
            policies.listing.trusted_media_hosts = split_list(&raw)
                .map(|host| host.to_lowercase())
                .collect();
        }

        Ok(Self {
            port: env_parse("PORT").unwrap_or(8000),
            queue_capacity: env_parse("QUEUE_CAPACITY")
                .filter(|v: &usize| *v > 0)
                .unwrap_or(256),
            worker_concurrency: env_parse("WORKER_CONCURRENCY")
                .filter(|v: &usize| *v > 0)
                .unwrap_or(8),
            redis_url: env_string("REDIS_URL"),
            object_store_url: env_string("OBJECT_STORE_URL"),
            object_store_token: env_string("OBJECT_STORE_TOKEN"),
            alert_webhook_url: env_string("ALERT_WEBHOOK_URL"),
            view_flush_interval: Duration::from_millis(
                env_parse("VIEW_FLUSH_INTERVAL_MS").unwrap_or(500),
            ),
            sweep_interval: Duration::from_secs(env_parse("SWEEP_INTERVAL_SECS").unwrap_or(120)),
            public_owner_ids: env::var("PUBLIC_OWNER_IDS")
                .map(|raw| parse_ids(&raw))
                .unwrap_or_default(),
            policies,
        })
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_ids(raw: &str) -> Vec<u64> {
    split_list(raw)
        .filter_map(|token| match token.parse::<u64>() {
            Ok(id) => Some(id),
            Err(_) => {
                warn!(target = "listings.config", "ignored malformed owner id: {token}");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_carry_production_limits() {
        let policy = PolicyFile::default();
        assert_eq!(policy.listing.max_images, 8);
        assert_eq!(policy.listing.max_videos, 1);
        assert_eq!(policy.listing.price_reject_bps, 8_000);
        assert_eq!(policy.listing.price_flag_bps, 4_000);
        assert_eq!(policy.retry.max_attempts, 3);
        assert_eq!(policy.retry.initial_backoff, Duration::from_secs(1));
        assert_eq!(policy.uploads.orphan_retention, Duration::from_secs(172_800));
    }

    #[test]
    fn yaml_overrides_only_named_fields() {
        let raw = r#"
listing:
  max_images: 12
retry:
  initial_backoff: 5
uploads:
  base_delay: 30
"#;
        let policy = PolicyFile::parse(raw).expect("parse");
        assert_eq!(policy.listing.max_images, 12);
        assert_eq!(policy.listing.max_videos, 1);
        assert_eq!(policy.retry.initial_backoff, Duration::from_millis(5));
        assert_eq!(policy.retry.max_attempts, 3);
        assert_eq!(policy.uploads.base_delay, Duration::from_secs(30));
    }

    #[test]
    fn upload_delay_doubles_then_caps() {
        let policy = UploadRetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for(2), Duration::from_secs(120));
        assert_eq!(policy.delay_for(3), Duration::from_secs(240));
        assert_eq!(policy.delay_for(4), Duration::from_secs(480));
        assert_eq!(policy.delay_for(9), Duration::from_secs(480));
    }

    #[test]
    fn huge_exponent_saturates_instead_of_overflowing() {
        let policy = PolicyFile::parse("uploads:\n  base_delay: 1\n  max_exponent: 40\n")
            .expect("parse")
            .uploads;
        assert_eq!(policy.delay_for(33), Duration::from_secs(u64::from(u32::MAX)));
        assert_eq!(policy.delay_for(1000), Duration::from_secs(u64::from(u32::MAX)));
    }

    #[test]
    fn parse_ids_skips_garbage() {
        assert_eq!(parse_ids("1, 2,x,,40"), vec![1, 2, 40]);
    }
}
