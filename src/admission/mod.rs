//! Request admission.
//!
//! The gate runs before the query pipeline, in a fixed order: progressive
//! ban check, global sliding windows, per-identifier sliding windows,
//! challenge validation, bot verification, cost throttle. Any step may deny
//! with a typed rejection; infrastructure faults fail open (a KV outage
//! must not lock legitimate users out).

pub mod challenge;
pub mod cost_throttle;
pub mod identity;
pub mod turnstile;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{error, warn};

use crate::alerts::Alerter;
use crate::config::Config;
use crate::kv::{keys, AtomicKv};
use crate::settings::SettingsReader;
use crate::spend::pricing;

pub use challenge::{ChallengeResponse, ChallengeService};
pub use cost_throttle::{CostThrottler, ThrottleReason};
pub use identity::ClientIdentity;
pub use turnstile::TurnstileVerifier;

/// Ban ladder for repeated rate-limit violations (seconds).
pub const BAN_LADDER: [i64; 4] = [60, 300, 900, 3600];

/// A denied request, carrying everything the HTTP layer needs for the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionDenial {
    /// 429 with `Retry-After`.
    RateLimited(RateLimitDenial),
    /// 403; challenge missing from the store or bound to another identifier.
    ChallengeRejected { message: String },
    /// 429 from the cost throttle.
    CostThrottled { message: String, retry_after: i64 },
}

/// Fields of a rate-limit 429 body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDenial {
    /// `"rate_limited"` or `"too_many_challenges"`.
    pub code: &'static str,
    pub message: String,
    /// `(per_minute, per_hour)` when a window limit applies.
    pub limits: Option<(i64, i64)>,
    pub retry_after: i64,
    pub ban_expires_at: Option<i64>,
    pub violation_count: Option<u64>,
}

/// The admission gate.
pub struct AdmissionGate {
    kv: Arc<dyn AtomicKv>,
    settings: Arc<SettingsReader>,
    alerter: Arc<Alerter>,
    challenges: Arc<ChallengeService>,
    throttler: CostThrottler,
    turnstile: Option<TurnstileVerifier>,
    model: String,
}

/// Per-request admission inputs beyond the identity triple.
#[derive(Debug, Clone, Default)]
pub struct AdmissionRequest<'a> {
    /// HTTP method; `OPTIONS` skips admission entirely (CORS preflight).
    pub method: &'a str,
    /// Request path; `/admin` paths skip the global windows.
    pub path: &'a str,
    /// Bot-verification token from the request body, when supplied.
    pub turnstile_token: Option<&'a str>,
    /// Query length in characters (cost estimation).
    pub query_chars: usize,
    /// Total history length in characters (cost estimation).
    pub history_chars: usize,
    /// Whether this endpoint runs the cost throttle (query endpoints only).
    pub is_query_endpoint: bool,
}

impl AdmissionGate {
    pub fn new(
        kv: Arc<dyn AtomicKv>,
        settings: Arc<SettingsReader>,
        alerter: Arc<Alerter>,
        challenges: Arc<ChallengeService>,
        config: &Config,
    ) -> Self {
        let turnstile = if config.turnstile_enabled() {
            config
                .turnstile_secret_key
                .clone()
                .map(TurnstileVerifier::new)
        } else {
            None
        };
        let throttler =
            CostThrottler::new(kv.clone(), settings.clone(), config.is_development);
        Self {
            kv,
            settings,
            alerter,
            challenges,
            throttler,
            turnstile,
            model: config.llm_model.clone(),
        }
    }

    fn now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64
    }

    /// Run the full admission sequence for `identity`.
    pub async fn admit(
        &self,
        identity: &ClientIdentity,
        request: AdmissionRequest<'_>,
    ) -> Result<(), AdmissionDenial> {
        // CORS preflight carries no credentials worth limiting.
        if request.method.eq_ignore_ascii_case("OPTIONS") {
            return Ok(());
        }

        let now = Self::now();
        let bucket = "chat";

        // 1. Progressive ban, keyed on IP so fingerprint churn cannot evade it.
        if let Some(denial) = self.check_existing_ban(bucket, &identity.ip, now).await {
            self.reject(bucket, &denial);
            return Err(denial);
        }

        // 2. Global windows (minute, then hour). Admin paths are exempt.
        if !request.path.starts_with("/admin") {
            if let Some(denial) = self.check_global_windows(now).await {
                self.reject("global", &denial);
                return Err(denial);
            }
        }

        // 3. Per-identifier windows; violations feed the ban ladder.
        let (per_minute, per_hour) = self.chat_limits().await;
        if let Some(denial) = self
            .check_identity_windows(bucket, identity, per_minute, per_hour, now, true)
            .await
        {
            self.reject(bucket, &denial);
            return Err(denial);
        }

        // 4. Challenge validation. Challenges are bound to the IP they were
        // minted for; a fingerprint without one passes (rollout path).
        if let Some(challenge_id) = identity.challenge_id.as_deref() {
            self.challenges.consume(challenge_id, &identity.ip).await?;
        }

        // 5. Bot verification: failure or provider error downgrades to a 10x
        // tighter bucket instead of blocking.
        if let Some(verifier) = &self.turnstile {
            let verified = match verifier
                .verify(request.turnstile_token.unwrap_or(""), Some(&identity.ip))
                .await
            {
                Ok(ok) => ok,
                Err(e) => {
                    error!("Turnstile API failure, applying strict limits: {e}");
                    false
                }
            };
            if !verified {
                warn!(ip = %identity.ip, "bot verification failed, applying strict limits");
                let strict_minute = (per_minute / 10).max(1);
                let strict_hour = (per_hour / 10).max(1);
                if let Some(denial) = self
                    .check_identity_windows(
                        "chat_strict",
                        identity,
                        strict_minute,
                        strict_hour,
                        now,
                        true,
                    )
                    .await
                {
                    self.reject("chat_strict", &denial);
                    return Err(denial);
                }
            }
        }

        // 6. Cost throttle, query endpoints only. Needs a fingerprint: IP-only
        // callers are already covered by the windows above.
        if request.is_query_endpoint && identity.full_fingerprint.starts_with("fp:") {
            let estimated_input =
                ((request.query_chars + request.history_chars) / 4) as u64 + 2000;
            let estimated_cost = pricing::estimate_cost(estimated_input, 500, &self.model);
            if let Some((reason, retry_after)) = self
                .throttler
                .check(
                    &identity.stable_id,
                    &identity.full_fingerprint,
                    estimated_cost,
                    now,
                )
                .await
            {
                let denial = AdmissionDenial::CostThrottled {
                    message: reason.message(retry_after),
                    retry_after,
                };
                self.reject(bucket, &denial);
                return Err(denial);
            }
        }

        Ok(())
    }

    async fn chat_limits(&self) -> (i64, i64) {
        let per_minute = self
            .settings
            .get_i64("chat_requests_per_minute", "CHAT_REQUESTS_PER_MINUTE", 10)
            .await;
        let per_hour = self
            .settings
            .get_i64("chat_requests_per_hour", "CHAT_REQUESTS_PER_HOUR", 100)
            .await;
        (per_minute.max(1), per_hour.max(1))
    }

    async fn check_existing_ban(
        &self,
        bucket: &str,
        ip: &str,
        now: i64,
    ) -> Option<AdmissionDenial> {
        let ban_key = keys::ban(bucket, ip);
        match self.kv.check_ban(&ban_key, now).await {
            Ok(Some(expiry)) => {
                let (per_minute, per_hour) = self.chat_limits().await;
                Some(AdmissionDenial::RateLimited(RateLimitDenial {
                    code: "rate_limited",
                    message: "Too many requests. You have been temporarily banned.".to_string(),
                    limits: Some((per_minute, per_hour)),
                    retry_after: expiry - now,
                    ban_expires_at: Some(expiry),
                    violation_count: None,
                }))
            }
            Ok(None) => None,
            Err(e) => {
                error!("ban check failed, failing open: {e}");
                None
            }
        }
    }

    async fn check_global_windows(&self, now: i64) -> Option<AdmissionDenial> {
        let enabled = self
            .settings
            .get_bool("enable_global_rate_limit", "ENABLE_GLOBAL_RATE_LIMIT", true)
            .await;
        if !enabled {
            return None;
        }
        let per_minute = self
            .settings
            .get_i64(
                "global_rate_limit_per_minute",
                "GLOBAL_RATE_LIMIT_PER_MINUTE",
                1000,
            )
            .await;
        let per_hour = self
            .settings
            .get_i64(
                "global_rate_limit_per_hour",
                "GLOBAL_RATE_LIMIT_PER_HOUR",
                50_000,
            )
            .await;

        // Global windows count every request: the member is unique, never a
        // fingerprint, so duplicates are NOT deduplicated here.
        let member = format!("{now}:{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);

        // Minute first; a minute rejection short-circuits the hour check.
        for (suffix, window, limit) in [('m', 60, per_minute), ('h', 3600, per_hour)] {
            let key = keys::global_window(suffix);
            match self
                .kv
                .sliding_window_admit(&key, now, window, limit.max(1) as u64, &member, window + 60)
                .await
            {
                Ok(admit) if !admit.allowed => {
                    let retry_after = if admit.oldest_score > 0 {
                        (window - (now - admit.oldest_score)).max(1)
                    } else {
                        window
                    };
                    return Some(AdmissionDenial::RateLimited(RateLimitDenial {
                        code: "rate_limited",
                        message:
                            "Service temporarily unavailable due to high demand. Please try again shortly."
                                .to_string(),
                        limits: Some((per_minute, per_hour)),
                        retry_after,
                        ban_expires_at: None,
                        violation_count: None,
                    }));
                }
                Ok(_) => {}
                Err(e) => {
                    error!("global window check failed, failing open: {e}");
                    return None;
                }
            }
        }
        None
    }

    /// Check minute+hour windows for one identity bucket; on rejection,
    /// optionally apply the progressive ban ladder keyed on IP.
    async fn check_identity_windows(
        &self,
        bucket: &str,
        identity: &ClientIdentity,
        per_minute: i64,
        per_hour: i64,
        now: i64,
        progressive_bans: bool,
    ) -> Option<AdmissionDenial> {
        for (suffix, window, limit) in [('m', 60, per_minute), ('h', 3600, per_hour)] {
            let key = keys::window(bucket, &identity.stable_id, suffix);
            let admit = match self
                .kv
                .sliding_window_admit(
                    &key,
                    now,
                    window,
                    limit.max(1) as u64,
                    &identity.full_fingerprint,
                    window + 60,
                )
                .await
            {
                Ok(a) => a,
                Err(e) => {
                    error!("sliding window check failed, failing open: {e}");
                    return None;
                }
            };
            if admit.allowed {
                continue;
            }

            let mut retry_after = if admit.oldest_score > 0 {
                (window - (now - admit.oldest_score)).max(1)
            } else {
                window
            };
            let mut ban_expires_at = None;
            let mut violation_count = None;
            let message = if progressive_bans {
                match self
                    .kv
                    .register_violation(
                        &keys::violations(bucket, &identity.ip),
                        &keys::ban(bucket, &identity.ip),
                        now,
                        &BAN_LADDER,
                    )
                    .await
                {
                    Ok((count, expiry)) => {
                        crate::metrics::RATE_LIMIT_BANS
                            .with_label_values(&[bucket])
                            .inc();
                        retry_after = expiry - now;
                        ban_expires_at = Some(expiry);
                        violation_count = Some(count);
                    }
                    Err(e) => error!("violation registration failed: {e}"),
                }
                "Too many requests. You have been temporarily banned."
            } else {
                "Too many requests. Please slow down."
            };

            return Some(AdmissionDenial::RateLimited(RateLimitDenial {
                code: "rate_limited",
                message: message.to_string(),
                limits: Some((per_minute, per_hour)),
                retry_after,
                ban_expires_at,
                violation_count,
            }));
        }
        None
    }

    /// Record a denial: metrics plus a best-effort out-of-band alert.
    fn reject(&self, bucket: &str, denial: &AdmissionDenial) {
        crate::metrics::RATE_LIMIT_REJECTIONS
            .with_label_values(&[bucket])
            .inc();
        let summary = match denial {
            AdmissionDenial::RateLimited(d) => format!("{} ({})", d.message, d.code),
            AdmissionDenial::ChallengeRejected { message } => message.clone(),
            AdmissionDenial::CostThrottled { message, .. } => message.clone(),
        };
        self.alerter.fire("429", summary);
    }
}

// ============================================================================
// Tests
// ============================================================================
