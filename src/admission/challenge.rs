//! Challenge-response fingerprinting.
//!
//! Challenges are server-minted one-time tokens bound to the requesting
//! identifier. A client embeds the challenge in its fingerprint
//! (`fp:<challenge>:<hash>`); the first request presenting it consumes it.
//! Mint and consume are single atomic KV operations (see `kv::scripts`).

use std::sync::Arc;

use rand::RngCore;
use serde::Serialize;
use tracing::{debug, warn};

use crate::kv::{AtomicKv, ConsumeOutcome, MintOutcome};
use crate::settings::SettingsReader;

use super::{AdmissionDenial, RateLimitDenial};

/// Body of `GET /auth/challenge`.
#[derive(Debug, Clone, Serialize)]
pub struct ChallengeResponse {
    pub challenge: String,
    pub expires_in_seconds: i64,
}

/// Mints and consumes challenges.
pub struct ChallengeService {
    kv: Arc<dyn AtomicKv>,
    settings: Arc<SettingsReader>,
    /// Development mode lifts the active-challenge cap (rapid page reloads).
    is_development: bool,
}

impl ChallengeService {
    pub fn new(kv: Arc<dyn AtomicKv>, settings: Arc<SettingsReader>, is_development: bool) -> Self {
        Self {
            kv,
            settings,
            is_development,
        }
    }

    async fn enabled(&self) -> bool {
        self.settings
            .get_bool("enable_challenge_response", "ENABLE_CHALLENGE_RESPONSE", true)
            .await
    }

    async fn ttl_seconds(&self) -> i64 {
        self.settings
            .get_i64("challenge_ttl_seconds", "CHALLENGE_TTL_SECONDS", 300)
            .await
    }

    /// 32 random bytes, hex-encoded (64 chars).
    fn fresh_nonce() -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// Issue (or reuse) a challenge for `identifier`.
    pub async fn issue(
        &self,
        identifier: &str,
        now: i64,
    ) -> Result<ChallengeResponse, AdmissionDenial> {
        let ttl = self.ttl_seconds().await;
        if !self.enabled().await {
            // Feature off: hand back a sentinel so clients keep working.
            return Ok(ChallengeResponse {
                challenge: "disabled".to_string(),
                expires_in_seconds: ttl,
            });
        }

        let default_max = if self.is_development { 100 } else { 15 };
        let max_active = self
            .settings
            .get_i64(
                "max_active_challenges_per_identifier",
                "MAX_ACTIVE_CHALLENGES_PER_IDENTIFIER",
                default_max,
            )
            .await
            .max(1) as u64;
        let rate_limit_seconds = self
            .settings
            .get_i64(
                "challenge_request_rate_limit_seconds",
                "CHALLENGE_REQUEST_RATE_LIMIT_SECONDS",
                3,
            )
            .await;

        let candidate = Self::fresh_nonce();
        let outcome = match self
            .kv
            .challenge_mint(identifier, &candidate, now, ttl, max_active, rate_limit_seconds)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                // KV down: fail open with the sentinel so clients proceed
                // without a challenge; consume() accepts it symmetrically.
                warn!("challenge mint failed, returning disabled sentinel: {e}");
                return Ok(ChallengeResponse {
                    challenge: "disabled".to_string(),
                    expires_in_seconds: ttl,
                });
            }
        };

        match outcome {
            MintOutcome::Minted {
                challenge,
                expires_in,
            } => {
                debug!(identifier, "minted challenge");
                Ok(ChallengeResponse {
                    challenge,
                    expires_in_seconds: expires_in,
                })
            }
            MintOutcome::Reused {
                challenge,
                expires_in,
            } => {
                debug!(identifier, "reused fresh challenge inside rate window");
                Ok(ChallengeResponse {
                    challenge,
                    expires_in_seconds: expires_in,
                })
            }
            MintOutcome::RateLimited { retry_after } => {
                Err(AdmissionDenial::RateLimited(RateLimitDenial {
                    code: "rate_limited",
                    message: format!(
                        "Please wait {retry_after} seconds before requesting another challenge."
                    ),
                    limits: None,
                    retry_after,
                    ban_expires_at: None,
                    violation_count: None,
                }))
            }
            MintOutcome::TooManyActive {
                retry_after,
                ban_expires_at,
                violation_count,
            } => {
                warn!(identifier, violation_count, "active challenge cap hit");
                Err(AdmissionDenial::RateLimited(RateLimitDenial {
                    code: "too_many_challenges",
                    message: format!(
                        "Too many requests. Please wait {retry_after} seconds before trying again."
                    ),
                    limits: None,
                    retry_after,
                    ban_expires_at: Some(ban_expires_at),
                    violation_count: Some(violation_count),
                }))
            }
            MintOutcome::Banned {
                retry_after,
                ban_expires_at,
                violation_count,
            } => Err(AdmissionDenial::RateLimited(RateLimitDenial {
                code: "too_many_challenges",
                message: format!(
                    "Too many requests. Please wait {retry_after} seconds before trying again."
                ),
                limits: None,
                retry_after,
                ban_expires_at: Some(ban_expires_at),
                violation_count: Some(violation_count),
            })),
        }
    }

    /// Validate and consume a challenge presented in a fingerprint.
    ///
    /// `Ok(())` also covers the disabled feature and the `"disabled"`
    /// sentinel. KV failures fail open.
    pub async fn consume(
        &self,
        challenge_id: &str,
        identifier: &str,
    ) -> Result<(), AdmissionDenial> {
        if !self.enabled().await {
            return Ok(());
        }
        if challenge_id.is_empty() || challenge_id == "disabled" {
            return Ok(());
        }

        match self.kv.challenge_consume(challenge_id, identifier).await {
            Ok(ConsumeOutcome::Consumed) => {
                debug!(identifier, "challenge consumed");
                Ok(())
            }
            Ok(ConsumeOutcome::NotFound) => {
                warn!(identifier, "challenge not found or expired");
                Err(AdmissionDenial::ChallengeRejected {
                    message:
                        "Invalid or expired security challenge. Please request a new challenge."
                            .to_string(),
                })
            }
            Ok(ConsumeOutcome::Mismatch) => {
                warn!(identifier, "challenge identifier mismatch");
                Err(AdmissionDenial::ChallengeRejected {
                    message: "Security challenge mismatch. Please request a new challenge."
                        .to_string(),
                })
            }
            Err(e) => {
                // Fail open: infrastructure faults must not lock users out.
                warn!("challenge consume failed, allowing request: {e}");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    fn service() -> ChallengeService {
        let kv: Arc<dyn AtomicKv> = Arc::new(MemoryKv::new());
        let settings = Arc::new(SettingsReader::new(kv.clone()));
        ChallengeService::new(kv, settings, false)
    }

    fn now() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64
    }

    #[tokio::test]
    async fn test_issue_then_consume_roundtrip() {
        let svc = service();
        let resp = svc.issue("1.2.3.4", now()).await.unwrap();
        assert_eq!(resp.challenge.len(), 64, "32 bytes hex-encoded");
        assert_eq!(resp.expires_in_seconds, 300);
        svc.consume(&resp.challenge, "1.2.3.4").await.unwrap();
        // Second consume fails: single use.
        assert!(svc.consume(&resp.challenge, "1.2.3.4").await.is_err());
    }

    #[tokio::test]
    async fn test_consume_wrong_identifier_rejected() {
        let svc = service();
        let resp = svc.issue("1.2.3.4", now()).await.unwrap();
        let err = svc.consume(&resp.challenge, "9.9.9.9").await.unwrap_err();
        assert!(matches!(err, AdmissionDenial::ChallengeRejected { .. }));
    }

    #[tokio::test]
    async fn test_disabled_sentinel_always_passes() {
        let svc = service();
        svc.consume("disabled", "anyone").await.unwrap();
        svc.consume("", "anyone").await.unwrap();
    }

    #[tokio::test]
    async fn test_disabled_feature_returns_sentinel() {
        let kv: Arc<dyn AtomicKv> = Arc::new(MemoryKv::new());
        let settings = Arc::new(SettingsReader::new(kv.clone()));
        settings
            .write(&serde_json::json!({"enable_challenge_response": false}))
            .await
            .unwrap();
        let svc = ChallengeService::new(kv, settings, false);
        let resp = svc.issue("1.2.3.4", 1000).await.unwrap();
        assert_eq!(resp.challenge, "disabled");
        // Consume of a real-looking id also passes when disabled.
        svc.consume("deadbeef", "1.2.3.4").await.unwrap();
    }

    #[tokio::test]
    async fn test_rapid_reissue_reuses() {
        let svc = service();
        let first = svc.issue("ip", 1000).await.unwrap();
        let second = svc.issue("ip", 1001).await.unwrap();
        assert_eq!(first.challenge, second.challenge);
        assert!(second.expires_in_seconds <= first.expires_in_seconds);
    }
}
