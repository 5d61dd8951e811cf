use crate::http::build_client;
use chrono::Utc;
use reqwest::Client;
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    Routine,
    Security,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEntry {
    pub entity_type: &'static str,
    pub entity_id: u64,
    pub action: &'static str,
    pub actor: String,
    pub detail: String,
    pub severity: AuditSeverity,
}

impl AuditEntry {
    pub fn listing(action: &'static str, id: u64, actor: String, detail: impl Into<String>) -> Self {
        Self {
            entity_type: "Listing",
            entity_id: id,
            action,
            actor,
            detail: detail.into(),
            severity: AuditSeverity::Routine,
        }
    }

    pub fn security(mut self) -> Self {
        self.severity = AuditSeverity::Security;
        self
    }
}

/// Append-only, best-effort. Implementations must not fail the caller.
pub trait AuditLog: Send + Sync {
    fn record(&self, entry: AuditEntry);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditLog;

impl AuditLog for TracingAuditLog {
    fn record(&self, entry: AuditEntry) {
        match entry.severity {
            AuditSeverity::Routine => info!(
                target = "listings.audit",
                entity = entry.entity_type,
                entity_id = entry.entity_id,
                action = entry.action,
                actor = %entry.actor,
                "{}",
                entry.detail
            ),
            AuditSeverity::Security => warn!(
                target = "listings.audit",
                entity = entry.entity_type,
                entity_id = entry.entity_id,
                action = entry.action,
                actor = %entry.actor,
                security_event = true,
                "{}",
                entry.detail
            ),
        }
    }
}

/// Operator notification. Fire-and-forget: a failing channel is logged and
/// never reaches the job being reported on.
pub trait Alerting: Send + Sync {
    fn notify(&self, subject: &str, body: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlerting;

impl Alerting for LogAlerting {
    fn notify(&self, subject: &str, body: &str) {
        error!(target = "listings.alert", subject, "{body}");
    }
}

/// Posts alerts as JSON to a chat/incident webhook.
#[derive(Debug, Clone)]
pub struct WebhookAlerting {
    url: String,
    http: Client,
}

impl WebhookAlerting {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            http: build_client(),
        }
    }
}

impl Alerting for WebhookAlerting {
    fn notify(&self, subject: &str, body: &str) {
        error!(target = "listings.alert", subject, "{body}");
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(target = "listings.alert", "no runtime available; webhook alert skipped");
            return;
        };
        let request = self.http.post(&self.url).json(&json!({
            "subject": subject,
            "body": body,
            "sent_at": Utc::now(),
        }));
        runtime.spawn(async move {
            match request.send().await {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => {
                    warn!(target = "listings.alert", status = %resp.status(), "alert webhook rejected")
                }
                Err(err) => warn!(target = "listings.alert", error = %err, "alert webhook failed"),
            }
        });
    }
}
