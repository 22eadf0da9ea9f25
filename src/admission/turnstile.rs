//! Cloudflare Turnstile verification.
//!
//! Bot verification never blocks outright: a failed (or unreachable)
//! verification downgrades the caller to a 10x tighter rate-limit bucket.
//! That policy lives in the gate; this module only talks to the API.

use std::time::Duration;

use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{HubError, Result};

const VERIFY_URL: &str = "https://challenges.cloudflare.com/turnstile/v0/siteverify";

/// Thin client for the Turnstile siteverify endpoint.
pub struct TurnstileVerifier {
    client: Client,
    secret: String,
    /// Overridable for tests.
    verify_url: String,
}

impl TurnstileVerifier {
    pub fn new(secret: String) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("failed to build HTTP client"),
            secret,
            verify_url: VERIFY_URL.to_string(),
        }
    }

    #[cfg(test)]
    pub fn with_url(secret: String, url: String) -> Self {
        let mut v = Self::new(secret);
        v.verify_url = url;
        v
    }

    /// Verify a client token. `Ok(true)` means the provider accepted it;
    /// `Ok(false)` means it rejected it; `Err` means the provider itself
    /// was unreachable (callers degrade rather than block).
    pub async fn verify(&self, token: &str, remote_ip: Option<&str>) -> Result<bool> {
        if token.is_empty() {
            warn!("Turnstile verification failed: no token provided");
            return Ok(false);
        }

        let mut form = vec![("secret", self.secret.as_str()), ("response", token)];
        if let Some(ip) = remote_ip {
            form.push(("remoteip", ip));
        }

        let response = self
            .client
            .post(&self.verify_url)
            .form(&form)
            .send()
            .await?
            .error_for_status()
            .map_err(HubError::Http)?;

        let body: Value = response.json().await?;
        let success = body["success"].as_bool().unwrap_or(false);
        if success {
            debug!("Turnstile verification succeeded");
        } else {
            warn!(
                "Turnstile verification failed: {:?}",
                body["error-codes"].as_array().map(|a| a.len()).unwrap_or(0)
            );
        }
        Ok(success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_token_rejected_without_network() {
        let verifier = TurnstileVerifier::new("secret".into());
        assert_eq!(verifier.verify("", None).await.unwrap(), false);
    }

    #[tokio::test]
    async fn test_unreachable_provider_is_an_error() {
        // 127.0.0.1:9 is discard; connection should fail fast.
        let verifier =
            TurnstileVerifier::with_url("secret".into(), "http://127.0.0.1:9/verify".into());
        assert!(verifier.verify("some-token", Some("1.2.3.4")).await.is_err());
    }
}
