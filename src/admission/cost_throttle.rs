//! Cost-based throttling.
//!
//! Tracks estimated spend per stable identifier in a burst window and a
//! dated daily set. Exceeding either threshold sets a throttle marker whose
//! TTL gates subsequent requests. The whole check-and-record runs as one
//! atomic KV operation.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::kv::{keys, AtomicKv, ThrottleOutcome};
use crate::settings::SettingsReader;

/// Why a request was throttled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleReason {
    /// Burst-window spend threshold.
    WindowBurst,
    /// Daily per-identifier spend cap.
    DailyLimit,
    /// An earlier violation's marker is still active.
    Active,
}

/// Per-identifier cost throttler.
pub struct CostThrottler {
    kv: Arc<dyn AtomicKv>,
    settings: Arc<SettingsReader>,
    is_development: bool,
}

impl CostThrottler {
    pub fn new(kv: Arc<dyn AtomicKv>, settings: Arc<SettingsReader>, is_development: bool) -> Self {
        Self {
            kv,
            settings,
            is_development,
        }
    }

    /// Whether throttling applies right now.
    ///
    /// The admin settings blob wins when it sets the flag explicitly (either
    /// way, in any mode). Otherwise: disabled in development, enabled in
    /// production.
    async fn enabled(&self) -> bool {
        match self
            .settings
            .get_bool_explicit("enable_cost_throttling", "ENABLE_COST_THROTTLING")
            .await
        {
            Some(explicit) => explicit,
            None => !self.is_development,
        }
    }

    /// Check (and on success record) the estimated cost for `stable_id`.
    ///
    /// Returns `None` when the request may proceed. KV failures fail open.
    pub async fn check(
        &self,
        stable_id: &str,
        full_fingerprint: &str,
        estimated_cost: f64,
        now: i64,
    ) -> Option<(ThrottleReason, i64)> {
        if !self.enabled().await {
            return None;
        }
        if stable_id.is_empty() || estimated_cost <= 0.0 {
            return None;
        }

        let mut threshold = self
            .settings
            .get_f64("high_cost_threshold_usd", "HIGH_COST_THRESHOLD_USD", 0.02)
            .await;
        let mut window_seconds = self
            .settings
            .get_i64("high_cost_window_seconds", "HIGH_COST_WINDOW_SECONDS", 600)
            .await;
        let mut duration = self
            .settings
            .get_i64(
                "cost_throttle_duration_seconds",
                "COST_THROTTLE_DURATION_SECONDS",
                30,
            )
            .await;
        let mut daily_limit = self
            .settings
            .get_f64("daily_cost_limit_usd", "DAILY_COST_LIMIT_USD", 0.25)
            .await;

        // Misconfigured settings degrade to the defaults, not to a dead gate.
        if threshold <= 0.0 {
            warn!("invalid high_cost_threshold_usd {threshold}, using 0.02");
            threshold = 0.02;
        }
        if window_seconds <= 0 {
            warn!("invalid high_cost_window_seconds {window_seconds}, using 600");
            window_seconds = 600;
        }
        if duration <= 0 {
            warn!("invalid cost_throttle_duration_seconds {duration}, using 30");
            duration = 30;
        }
        if daily_limit <= 0.0 {
            warn!("invalid daily_cost_limit_usd {daily_limit}, using 0.25");
            daily_limit = 0.25;
        }

        let today = Utc::now().format("%Y-%m-%d").to_string();
        // Member encodes the cost after the last colon; the full fingerprint
        // keeps a double-submitted request from double-counting.
        let member = format!("{full_fingerprint}:{estimated_cost}");

        let outcome = self
            .kv
            .cost_throttle(
                &keys::cost_recent(stable_id),
                &keys::cost_daily(stable_id, &today),
                &keys::throttle_marker(stable_id),
                now,
                window_seconds,
                estimated_cost,
                threshold,
                daily_limit,
                duration,
                &member,
                172_800,
            )
            .await;

        match outcome {
            Ok(ThrottleOutcome::Allowed) => None,
            Ok(ThrottleOutcome::AlreadyThrottled { retry_after }) => {
                info!(stable_id, retry_after, "request under active cost throttle");
                Some((ThrottleReason::Active, retry_after))
            }
            Ok(ThrottleOutcome::DailyLimit { retry_after }) => {
                warn!(stable_id, "daily cost limit tripped");
                Some((ThrottleReason::DailyLimit, retry_after))
            }
            Ok(ThrottleOutcome::WindowBurst { retry_after }) => {
                warn!(stable_id, "burst-window cost threshold tripped");
                Some((ThrottleReason::WindowBurst, retry_after))
            }
            Err(e) => {
                warn!("cost throttle check failed, allowing request: {e}");
                None
            }
        }
    }
}

impl ThrottleReason {
    /// User-facing message, distinguishing bursts from daily caps.
    pub fn message(&self, retry_after: i64) -> String {
        match self {
            ThrottleReason::WindowBurst | ThrottleReason::Active => format!(
                "High usage detected. Please try again in {retry_after} seconds."
            ),
            ThrottleReason::DailyLimit => {
                "Daily usage limit reached for your connection. Please try again tomorrow."
                    .to_string()
            }
        }
    }
}
