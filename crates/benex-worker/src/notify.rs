//! Operational alerting hook.
//!
//! Sweep failures and retry exhaustion are operator-facing events; the
//! alerter fans them out beyond the log stream. Alerting is best-effort:
//! a failed delivery is logged and never propagates into job handling.

use async_trait::async_trait;
use serde_json::json;

/// Destination for operator alerts.
#[async_trait]
pub trait Alerter: Send + Sync {
    async fn alert(&self, subject: &str, detail: &str);
}

/// Logs alerts and nothing else. Default when no webhook is configured.
pub struct NoopAlerter;

#[async_trait]
impl Alerter for NoopAlerter {
    async fn alert(&self, subject: &str, detail: &str) {
        tracing::error!(subject, detail, "operator alert");
    }
}

/// POSTs alerts as JSON to a configured webhook.
pub struct WebhookAlerter {
    http: reqwest::Client,
    url: String,
}

impl WebhookAlerter {
    #[must_use]
    pub fn new(url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl Alerter for WebhookAlerter {
    async fn alert(&self, subject: &str, detail: &str) {
        let payload = json!({
            "subject": subject,
            "detail": detail,
            "timestamp": chrono::Utc::now(),
        });

        match self.http.post(&self.url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                tracing::error!(
                    subject,
                    status = response.status().as_u16(),
                    "alert webhook rejected payload"
                );
            }
            Err(err) => {
                tracing::error!(subject, error = %err, "alert webhook unreachable");
            }
        }
    }
}
