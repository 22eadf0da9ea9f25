//! Atomic counter engine over the shared KV store.
//!
//! Every admission and spend mutation in the service goes through the
//! [`AtomicKv`] trait. Each method is a single atomic unit: the Redis
//! backend executes it as a server-side Lua script, the in-memory backend
//! under one mutex. Nothing else in the crate writes these keys; replacing
//! any of these operations with read-modify-write pairs breaks the
//! idempotency and reservation guarantees the rest of the system relies on.

pub mod keys;
pub mod memory;
pub mod redis_kv;
mod scripts;

use async_trait::async_trait;

use crate::error::Result;

pub use memory::MemoryKv;
pub use redis_kv::RedisKv;

/// Result of a sliding-window admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowAdmit {
    /// Whether the request was admitted.
    pub allowed: bool,
    /// Entries currently in the window (after this call).
    pub count: u64,
    /// Score of the oldest window entry when rejected; `0` when allowed.
    /// Used to compute `retry_after = window - (now - oldest)`.
    pub oldest_score: i64,
}

/// Result of an atomic check-and-reserve spend call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SpendReservation {
    /// Allowed; both counters were incremented by the buffered cost.
    Allowed { daily_total: f64, hourly_total: f64 },
    /// The daily limit would be exceeded. Nothing was incremented.
    DailyExceeded { daily_total: f64, hourly_total: f64 },
    /// The hourly limit would be exceeded. Nothing was incremented.
    HourlyExceeded { daily_total: f64, hourly_total: f64 },
}

/// Result of a cost-throttle check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleOutcome {
    /// Not throttled; the request's cost was recorded in both windows.
    Allowed,
    /// A throttle marker is already active.
    AlreadyThrottled { retry_after: i64 },
    /// The daily cost limit would be exceeded; marker set for 2x duration.
    DailyLimit { retry_after: i64 },
    /// The burst-window threshold would be exceeded; marker set.
    WindowBurst { retry_after: i64 },
}

/// Result of an atomic challenge mint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MintOutcome {
    /// A fresh challenge was created.
    Minted { challenge: String, expires_in: i64 },
    /// The caller re-requested within the rate window and a fresh challenge
    /// already existed; it is returned instead of erroring.
    Reused { challenge: String, expires_in: i64 },
    /// Too-frequent requests and nothing fresh to reuse.
    RateLimited { retry_after: i64 },
    /// The active-challenge cap was hit; a progressive ban was applied.
    TooManyActive {
        retry_after: i64,
        ban_expires_at: i64,
        violation_count: u64,
    },
    /// The identifier is currently banned from minting.
    Banned {
        retry_after: i64,
        ban_expires_at: i64,
        violation_count: u64,
    },
}

/// Result of an atomic challenge consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// Valid and now consumed (single use).
    Consumed,
    /// Unknown or expired challenge id.
    NotFound,
    /// The challenge was issued to a different identifier.
    Mismatch,
}

/// Atomic operations against the shared KV store.
///
/// Implementations must make each method atomic with respect to every other
/// method touching the same keys. The plain helpers at the bottom
/// (get/set/delete/scan) are for settings, usage snapshots and cache
/// payloads only, never for admission or spend decisions.
#[async_trait]
pub trait AtomicKv: Send + Sync {
    /// Sliding-window admit with idempotent members.
    ///
    /// Prunes entries with score <= `now - window_seconds`, then:
    /// - existing `member`: refresh its score to `now`, admit, count
    ///   unchanged (a retry or double-click never consumes a second slot);
    /// - window full: reject with the oldest score for retry computation;
    /// - otherwise insert `(member, now)` and refresh the key TTL.
    async fn sliding_window_admit(
        &self,
        bucket_key: &str,
        now: i64,
        window_seconds: i64,
        limit: u64,
        member: &str,
        expire_seconds: i64,
    ) -> Result<WindowAdmit>;

    /// Check both spend limits and reserve `buffered_cost` if allowed.
    ///
    /// The totals are only incremented on the allowed path; rejections
    /// return current totals untouched.
    #[allow(clippy::too_many_arguments)]
    async fn check_and_reserve_spend(
        &self,
        daily_key: &str,
        hourly_key: &str,
        buffered_cost: f64,
        daily_limit: f64,
        hourly_limit: f64,
        daily_ttl: i64,
        hourly_ttl: i64,
    ) -> Result<SpendReservation>;

    /// Apply a (possibly negative) cost adjustment and record token counts.
    #[allow(clippy::too_many_arguments)]
    async fn adjust_spend(
        &self,
        daily_cost_key: &str,
        hourly_cost_key: &str,
        daily_token_key: &str,
        hourly_token_key: &str,
        cost_delta: f64,
        input_tokens: u64,
        output_tokens: u64,
        daily_ttl: i64,
        hourly_ttl: i64,
    ) -> Result<()>;

    /// Cost-based throttling check over a burst window and a daily set.
    ///
    /// Member strings encode their cost after the last `:` (IPv6-safe
    /// parsing; non-positive or unparseable costs are ignored when summing).
    #[allow(clippy::too_many_arguments)]
    async fn cost_throttle(
        &self,
        window_key: &str,
        daily_key: &str,
        marker_key: &str,
        now: i64,
        window_seconds: i64,
        estimated_cost: f64,
        window_threshold: f64,
        daily_limit: f64,
        throttle_duration: i64,
        member: &str,
        daily_ttl: i64,
    ) -> Result<ThrottleOutcome>;

    /// Atomically mint (or reuse) a challenge for `identifier`.
    ///
    /// `candidate_id` is a caller-generated nonce used only when a fresh
    /// challenge is actually minted. Enforces the per-identifier re-request
    /// rate limit (with smart reuse of a just-minted challenge), the active
    /// cap with its progressive ban ladder, and active-set pruning.
    async fn challenge_mint(
        &self,
        identifier: &str,
        candidate_id: &str,
        now: i64,
        ttl_seconds: i64,
        max_active: u64,
        rate_limit_seconds: i64,
    ) -> Result<MintOutcome>;

    /// Atomically validate and consume a challenge (single use).
    async fn challenge_consume(&self, challenge_id: &str, identifier: &str)
        -> Result<ConsumeOutcome>;

    /// Return the ban expiry stored at `ban_key` if still active.
    /// Expired entries are deleted as a side effect.
    async fn check_ban(&self, ban_key: &str, now: i64) -> Result<Option<i64>>;

    /// Record a rate-limit violation and apply the progressive ban ladder.
    ///
    /// Increments the violation counter (24h TTL) and sets the ban key for
    /// `ladder[min(count - 1, len - 1)]` seconds. Returns
    /// `(violation_count, ban_expiry)`.
    async fn register_violation(
        &self,
        violation_key: &str,
        ban_key: &str,
        now: i64,
        ladder: &[i64],
    ) -> Result<(u64, i64)>;

    // ── Plain helpers (settings, snapshots, cache payloads) ─────────────────

    async fn get_string(&self, key: &str) -> Result<Option<String>>;
    async fn set_string_ex(&self, key: &str, value: &str, ttl_seconds: i64) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn get_f64(&self, key: &str) -> Result<Option<f64>>;
    async fn hget_u64(&self, key: &str, field: &str) -> Result<Option<u64>>;
    /// List keys matching `prefix*`. Used by the semantic-cache index rebuild
    /// and the admin cache-clear endpoint; never on the request path.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Liveness probe for readiness checks.
    async fn ping(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_admit_is_copy() {
        let a = WindowAdmit {
            allowed: true,
            count: 1,
            oldest_score: 0,
        };
        let b = a;
        assert_eq!(a, b);
    }

    #[test]
    fn test_reservation_variants_carry_totals() {
        let r = SpendReservation::DailyExceeded {
            daily_total: 4.99,
            hourly_total: 0.2,
        };
        match r {
            SpendReservation::DailyExceeded { daily_total, .. } => {
                assert!((daily_total - 4.99).abs() < 1e-9)
            }
            _ => panic!("wrong variant"),
        }
    }
}
