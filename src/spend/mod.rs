//! Spend ledger: atomic daily/hourly cost and token accounting.
//!
//! Counters roll over by UTC date and date-hour; old keys expire on their
//! own TTLs (48h daily, 2h hourly). The pre-flight check reserves a buffered
//! estimate atomically so concurrent callers see the correct running total;
//! after the real cost is known the difference is applied as an adjustment.

pub mod pricing;

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{error, warn};

use crate::kv::{keys, AtomicKv, SpendReservation};
use crate::settings::SettingsReader;

/// Daily counter TTL: 48 hours.
pub const DAILY_KEY_TTL: i64 = 48 * 60 * 60;
/// Hourly counter TTL: 2 hours.
pub const HOURLY_KEY_TTL: i64 = 2 * 60 * 60;

/// Safety buffer applied to estimates before reservation.
const RESERVE_BUFFER: f64 = 1.1;

/// Utilisation fraction that triggers a warning log.
const ALERT_THRESHOLD: f64 = 0.8;

/// Which limit a rejected request ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitKind {
    Daily,
    Hourly,
}

/// Outcome of the spend pre-flight.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SpendDecision {
    /// Allowed; `reserved` was added to both counters and must be settled
    /// via [`SpendLedger::record_spend`].
    Allowed { reserved: f64 },
    /// Rejected; nothing was reserved.
    Limited { kind: LimitKind },
}

/// Point-in-time usage for one period.
#[derive(Debug, Clone, Serialize)]
pub struct PeriodUsage {
    pub cost_usd: f64,
    pub limit_usd: f64,
    pub remaining_usd: f64,
    pub percentage_used: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Snapshot of both periods, served by the admin usage endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct UsageSnapshot {
    pub daily: PeriodUsage,
    pub hourly: PeriodUsage,
}

/// Atomic spend ledger over the shared KV store.
pub struct SpendLedger {
    kv: Arc<dyn AtomicKv>,
    settings: Arc<SettingsReader>,
    model: String,
}

impl SpendLedger {
    pub fn new(kv: Arc<dyn AtomicKv>, settings: Arc<SettingsReader>, model: String) -> Self {
        Self {
            kv,
            settings,
            model,
        }
    }

    /// Model whose price table governs cost math.
    pub fn model(&self) -> &str {
        &self.model
    }

    fn daily_period() -> String {
        Utc::now().format("%Y-%m-%d").to_string()
    }

    fn hourly_period() -> String {
        Utc::now().format("%Y-%m-%d-%H").to_string()
    }

    async fn limits(&self) -> (f64, f64) {
        let daily = self
            .settings
            .get_f64("daily_spend_limit_usd", "DAILY_SPEND_LIMIT_USD", 5.0)
            .await;
        let hourly = self
            .settings
            .get_f64("hourly_spend_limit_usd", "HOURLY_SPEND_LIMIT_USD", 1.0)
            .await;
        (daily, hourly)
    }

    /// Pre-flight check-and-reserve.
    ///
    /// Reserves `estimated_cost * 1.1` against both counters atomically.
    /// Zero or negative estimates are always allowed with no reservation.
    /// KV failures fail open (allow, reserve 0) so an infrastructure fault
    /// never blocks users; the post-hoc adjustment still records real spend.
    pub async fn check_spend_limit(&self, estimated_cost: f64) -> SpendDecision {
        if estimated_cost <= 0.0 {
            return SpendDecision::Allowed { reserved: 0.0 };
        }
        let buffered = estimated_cost * RESERVE_BUFFER;
        let (daily_limit, hourly_limit) = self.limits().await;
        let daily_key = keys::spend_daily_cost(&Self::daily_period());
        let hourly_key = keys::spend_hourly_cost(&Self::hourly_period());

        match self
            .kv
            .check_and_reserve_spend(
                &daily_key,
                &hourly_key,
                buffered,
                daily_limit,
                hourly_limit,
                DAILY_KEY_TTL,
                HOURLY_KEY_TTL,
            )
            .await
        {
            Ok(SpendReservation::Allowed {
                daily_total,
                hourly_total,
            }) => {
                if daily_limit > 0.0 && daily_total / daily_limit >= ALERT_THRESHOLD {
                    warn!(
                        daily_total,
                        daily_limit, "daily spend above {}% of limit", ALERT_THRESHOLD * 100.0
                    );
                }
                if hourly_limit > 0.0 && hourly_total / hourly_limit >= ALERT_THRESHOLD {
                    warn!(
                        hourly_total,
                        hourly_limit, "hourly spend above {}% of limit", ALERT_THRESHOLD * 100.0
                    );
                }
                SpendDecision::Allowed { reserved: buffered }
            }
            Ok(SpendReservation::DailyExceeded { daily_total, .. }) => {
                warn!(
                    daily_total,
                    daily_limit, buffered, "daily spend limit would be exceeded"
                );
                SpendDecision::Limited {
                    kind: LimitKind::Daily,
                }
            }
            Ok(SpendReservation::HourlyExceeded { hourly_total, .. }) => {
                warn!(
                    hourly_total,
                    hourly_limit, buffered, "hourly spend limit would be exceeded"
                );
                SpendDecision::Limited {
                    kind: LimitKind::Hourly,
                }
            }
            Err(e) => {
                error!("spend limit check failed, allowing request: {e}");
                SpendDecision::Allowed { reserved: 0.0 }
            }
        }
    }

    /// Settle a completed call: apply `actual − reserved` and record tokens.
    ///
    /// With `reserved == 0` (nothing was pre-reserved) the actual cost is
    /// added directly. Errors are logged; the stream must not fail on
    /// accounting problems.
    pub async fn record_spend(
        &self,
        actual_cost: f64,
        input_tokens: u64,
        output_tokens: u64,
        reserved: f64,
    ) {
        let delta = if reserved > 0.0 {
            actual_cost - reserved
        } else {
            actual_cost
        };
        if delta == 0.0 && input_tokens == 0 && output_tokens == 0 {
            return;
        }
        let daily = Self::daily_period();
        let hourly = Self::hourly_period();
        if let Err(e) = self
            .kv
            .adjust_spend(
                &keys::spend_daily_cost(&daily),
                &keys::spend_hourly_cost(&hourly),
                &keys::spend_daily_tokens(&daily),
                &keys::spend_hourly_tokens(&hourly),
                delta,
                input_tokens,
                output_tokens,
                DAILY_KEY_TTL,
                HOURLY_KEY_TTL,
            )
            .await
        {
            error!("spend adjustment failed (delta {delta:.6}): {e}");
        }
        self.refresh_gauges().await;
    }

    /// Read both period counters into a snapshot; zeros on KV failure.
    pub async fn get_current_usage(&self) -> UsageSnapshot {
        let (daily_limit, hourly_limit) = self.limits().await;
        let daily = Self::daily_period();
        let hourly = Self::hourly_period();

        let daily_cost = self
            .read_f64(&keys::spend_daily_cost(&daily))
            .await
            .unwrap_or(0.0);
        let hourly_cost = self
            .read_f64(&keys::spend_hourly_cost(&hourly))
            .await
            .unwrap_or(0.0);
        let daily_tokens_key = keys::spend_daily_tokens(&daily);
        let hourly_tokens_key = keys::spend_hourly_tokens(&hourly);

        UsageSnapshot {
            daily: PeriodUsage {
                cost_usd: daily_cost,
                limit_usd: daily_limit,
                remaining_usd: (daily_limit - daily_cost).max(0.0),
                percentage_used: percentage(daily_cost, daily_limit),
                input_tokens: self.read_u64(&daily_tokens_key, "input").await,
                output_tokens: self.read_u64(&daily_tokens_key, "output").await,
            },
            hourly: PeriodUsage {
                cost_usd: hourly_cost,
                limit_usd: hourly_limit,
                remaining_usd: (hourly_limit - hourly_cost).max(0.0),
                percentage_used: percentage(hourly_cost, hourly_limit),
                input_tokens: self.read_u64(&hourly_tokens_key, "input").await,
                output_tokens: self.read_u64(&hourly_tokens_key, "output").await,
            },
        }
    }

    async fn refresh_gauges(&self) {
        let usage = self.get_current_usage().await;
        crate::metrics::LLM_DAILY_COST.set(usage.daily.cost_usd);
        crate::metrics::LLM_HOURLY_COST.set(usage.hourly.cost_usd);
    }

    async fn read_f64(&self, key: &str) -> Option<f64> {
        self.kv.get_f64(key).await.unwrap_or_default()
    }

    async fn read_u64(&self, key: &str, field: &str) -> u64 {
        self.kv
            .hget_u64(key, field)
            .await
            .unwrap_or_default()
            .unwrap_or(0)
    }
}

fn percentage(cost: f64, limit: f64) -> f64 {
    if limit > 0.0 {
        (cost / limit * 100.0 * 100.0).round() / 100.0
    } else {
        0.0
    }
}
