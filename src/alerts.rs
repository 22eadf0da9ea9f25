//! Out-of-band alerting.
//!
//! Best-effort webhook notifications for abuse events (429s) and degraded
//! dependencies. Failures are logged and never affect the request path.

use std::time::Duration;

use reqwest::Client;
use serde_json::json;
use tracing::{debug, warn};

/// Fire-and-forget webhook alerter.
pub struct Alerter {
    client: Client,
    webhook_url: Option<String>,
}

impl Alerter {
    pub fn new(webhook_url: Option<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .expect("failed to build HTTP client"),
            webhook_url,
        }
    }

    /// Post an alert in the background. Returns immediately.
    pub fn fire(&self, kind: &str, message: String) {
        let Some(url) = self.webhook_url.clone() else {
            debug!(kind, "alert webhook not configured, dropping alert");
            return;
        };
        let client = self.client.clone();
        let kind = kind.to_string();
        tokio::spawn(async move {
            let body = json!({
                "content": format!("[{kind}] {message}"),
            });
            match client.post(&url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => warn!(kind, status = %resp.status(), "alert webhook rejected"),
                Err(e) => warn!(kind, "alert webhook failed: {e}"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fire_without_url_is_noop() {
        let alerter = Alerter::new(None);
        // Must not panic or spawn anything that errors loudly.
        alerter.fire("rate_limited", "test".into());
    }
}
