//! In-memory KV backend.
//!
//! Implements the same atomic contract as the Redis scripts under a single
//! mutex. Used by tests and by Redis-less development deployments; the
//! semantics here and in `scripts.rs` must stay in lockstep.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use crate::error::Result;

use super::{
    AtomicKv, ConsumeOutcome, MintOutcome, SpendReservation, ThrottleOutcome, WindowAdmit,
};

#[derive(Debug, Default)]
struct StringEntry {
    value: String,
    /// Absolute expiry in the time domain of whoever set it.
    expires_at: Option<i64>,
}

#[derive(Debug, Default)]
struct ZSet {
    /// member -> score
    members: HashMap<String, i64>,
}

#[derive(Debug, Default)]
struct Inner {
    strings: HashMap<String, StringEntry>,
    zsets: HashMap<String, ZSet>,
    hashes: HashMap<String, HashMap<String, u64>>,
    /// Float counters (INCRBYFLOAT targets) kept separate from strings so
    /// precision is not laundered through formatting.
    floats: HashMap<String, f64>,
}

/// Single-process KV store with the atomic-script semantics.
#[derive(Default)]
pub struct MemoryKv {
    inner: Mutex<Inner>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn now_secs() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory kv lock poisoned")
    }
}

/// Cost parser for throttle members: substring after the LAST colon, so
/// IPv6-style members (`2001:db8::1:0.004`) resolve to their trailing cost.
fn extract_member_cost(member: &str) -> Option<f64> {
    match member.rfind(':') {
        Some(idx) => member[idx + 1..].parse::<f64>().ok(),
        None => member.parse::<f64>().ok(),
    }
}

fn sum_costs(zset: &ZSet) -> f64 {
    zset.members
        .keys()
        .filter_map(|m| extract_member_cost(m))
        .filter(|c| *c > 0.0)
        .sum()
}

impl Inner {
    fn prune_zset(&mut self, key: &str, cutoff: i64) {
        if let Some(set) = self.zsets.get_mut(key) {
            set.members.retain(|_, score| *score > cutoff);
        }
    }

    fn zset_oldest(&self, key: &str) -> Option<(String, i64)> {
        self.zsets.get(key).and_then(|set| {
            set.members
                .iter()
                .map(|(m, s)| (m.clone(), *s))
                .min_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)))
        })
    }

    fn zset_newest(&self, key: &str) -> Option<(String, i64)> {
        self.zsets.get(key).and_then(|set| {
            set.members
                .iter()
                .map(|(m, s)| (m.clone(), *s))
                .max_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)))
        })
    }

    fn get_live_string(&mut self, key: &str, now: i64) -> Option<&StringEntry> {
        let expired = self
            .strings
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|exp| exp <= now)
            .unwrap_or(false);
        if expired {
            self.strings.remove(key);
        }
        self.strings.get(key)
    }
}

#[async_trait]
impl AtomicKv for MemoryKv {
    async fn sliding_window_admit(
        &self,
        bucket_key: &str,
        now: i64,
        window_seconds: i64,
        limit: u64,
        member: &str,
        _expire_seconds: i64,
    ) -> Result<WindowAdmit> {
        let mut inner = self.lock();
        inner.prune_zset(bucket_key, now - window_seconds);

        let known = inner
            .zsets
            .get(bucket_key)
            .map(|s| s.members.contains_key(member))
            .unwrap_or(false);
        if known {
            let set = inner.zsets.get_mut(bucket_key).expect("checked above");
            set.members.insert(member.to_string(), now);
            return Ok(WindowAdmit {
                allowed: true,
                count: set.members.len() as u64,
                oldest_score: 0,
            });
        }

        let count = inner
            .zsets
            .get(bucket_key)
            .map(|s| s.members.len() as u64)
            .unwrap_or(0);
        if count >= limit {
            let oldest = inner
                .zset_oldest(bucket_key)
                .map(|(_, score)| score)
                .unwrap_or(0);
            return Ok(WindowAdmit {
                allowed: false,
                count,
                oldest_score: oldest,
            });
        }

        inner
            .zsets
            .entry(bucket_key.to_string())
            .or_default()
            .members
            .insert(member.to_string(), now);
        Ok(WindowAdmit {
            allowed: true,
            count: count + 1,
            oldest_score: 0,
        })
    }

    async fn check_and_reserve_spend(
        &self,
        daily_key: &str,
        hourly_key: &str,
        buffered_cost: f64,
        daily_limit: f64,
        hourly_limit: f64,
        _daily_ttl: i64,
        _hourly_ttl: i64,
    ) -> Result<SpendReservation> {
        let mut inner = self.lock();
        let daily = inner.floats.get(daily_key).copied().unwrap_or(0.0);
        let hourly = inner.floats.get(hourly_key).copied().unwrap_or(0.0);

        if daily + buffered_cost >= daily_limit {
            return Ok(SpendReservation::DailyExceeded {
                daily_total: daily,
                hourly_total: hourly,
            });
        }
        if hourly + buffered_cost >= hourly_limit {
            return Ok(SpendReservation::HourlyExceeded {
                daily_total: daily,
                hourly_total: hourly,
            });
        }

        let new_daily = daily + buffered_cost;
        let new_hourly = hourly + buffered_cost;
        inner.floats.insert(daily_key.to_string(), new_daily);
        inner.floats.insert(hourly_key.to_string(), new_hourly);
        Ok(SpendReservation::Allowed {
            daily_total: new_daily,
            hourly_total: new_hourly,
        })
    }

    async fn adjust_spend(
        &self,
        daily_cost_key: &str,
        hourly_cost_key: &str,
        daily_token_key: &str,
        hourly_token_key: &str,
        cost_delta: f64,
        input_tokens: u64,
        output_tokens: u64,
        _daily_ttl: i64,
        _hourly_ttl: i64,
    ) -> Result<()> {
        let mut inner = self.lock();
        if cost_delta != 0.0 {
            *inner.floats.entry(daily_cost_key.to_string()).or_insert(0.0) += cost_delta;
            *inner
                .floats
                .entry(hourly_cost_key.to_string())
                .or_insert(0.0) += cost_delta;
        }
        for key in [daily_token_key, hourly_token_key] {
            let hash = inner.hashes.entry(key.to_string()).or_default();
            if input_tokens > 0 {
                *hash.entry("input".to_string()).or_insert(0) += input_tokens;
            }
            if output_tokens > 0 {
                *hash.entry("output".to_string()).or_insert(0) += output_tokens;
            }
        }
        Ok(())
    }

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
        _daily_ttl: i64,
    ) -> Result<ThrottleOutcome> {
        let mut inner = self.lock();

        if let Some(entry) = inner.strings.get(marker_key) {
            match entry.expires_at {
                Some(expiry) if expiry > now => {
                    return Ok(ThrottleOutcome::AlreadyThrottled {
                        retry_after: expiry - now,
                    });
                }
                // Expired marker or one without TTL: drop and continue.
                _ => {
                    inner.strings.remove(marker_key);
                }
            }
        }

        inner.prune_zset(window_key, now - window_seconds);

        let window_total = inner.zsets.get(window_key).map(sum_costs).unwrap_or(0.0);
        let daily_total = inner.zsets.get(daily_key).map(sum_costs).unwrap_or(0.0);

        if daily_total + estimated_cost >= daily_limit {
            let duration = throttle_duration * 2;
            inner.strings.insert(
                marker_key.to_string(),
                StringEntry {
                    value: now.to_string(),
                    expires_at: Some(now + duration),
                },
            );
            return Ok(ThrottleOutcome::DailyLimit {
                retry_after: duration,
            });
        }

        if window_total + estimated_cost >= window_threshold {
            inner.strings.insert(
                marker_key.to_string(),
                StringEntry {
                    value: now.to_string(),
                    expires_at: Some(now + throttle_duration),
                },
            );
            return Ok(ThrottleOutcome::WindowBurst {
                retry_after: throttle_duration,
            });
        }

        inner
            .zsets
            .entry(window_key.to_string())
            .or_default()
            .members
            .insert(member.to_string(), now);
        inner
            .zsets
            .entry(daily_key.to_string())
            .or_default()
            .members
            .insert(member.to_string(), now);
        Ok(ThrottleOutcome::Allowed)
    }

    async fn challenge_mint(
        &self,
        identifier: &str,
        candidate_id: &str,
        now: i64,
        ttl_seconds: i64,
        max_active: u64,
        rate_limit_seconds: i64,
    ) -> Result<MintOutcome> {
        let active_key = super::keys::challenge_active(identifier);
        let rate_key = super::keys::challenge_ratelimit(identifier);
        let ban_key = super::keys::challenge_ban(identifier);
        let vio_key = super::keys::challenge_violations(identifier);

        let mut inner = self.lock();
        inner.prune_zset(&active_key, now);

        let ban_value = inner.get_live_string(&ban_key, now).map(|e| e.value.clone());
        if let Some(value) = ban_value {
            match value.parse::<i64>() {
                Ok(expiry) if expiry > now => {
                    let count = inner
                        .get_live_string(&vio_key, now)
                        .and_then(|e| e.value.parse::<u64>().ok())
                        .unwrap_or(1);
                    return Ok(MintOutcome::Banned {
                        retry_after: expiry - now,
                        ban_expires_at: expiry,
                        violation_count: count,
                    });
                }
                _ => {
                    inner.strings.remove(&ban_key);
                }
            }
        }

        if let Some(last) = inner
            .get_live_string(&rate_key, now)
            .and_then(|e| e.value.parse::<i64>().ok())
        {
            let since = now - last;
            if since < rate_limit_seconds {
                if let Some((recent_id, expiry)) = inner.zset_newest(&active_key) {
                    let created = expiry - ttl_seconds;
                    if now - created < rate_limit_seconds + 2 {
                        return Ok(MintOutcome::Reused {
                            challenge: recent_id,
                            expires_in: expiry - now,
                        });
                    }
                }
                return Ok(MintOutcome::RateLimited {
                    retry_after: rate_limit_seconds - since,
                });
            }
        }
        inner.strings.insert(
            rate_key,
            StringEntry {
                value: now.to_string(),
                expires_at: Some(now + rate_limit_seconds + 1),
            },
        );

        let active = inner
            .zsets
            .get(&active_key)
            .map(|s| s.members.len() as u64)
            .unwrap_or(0);
        if active >= max_active {
            let count = {
                let entry = inner.strings.entry(vio_key.clone()).or_default();
                let next = entry.value.parse::<u64>().unwrap_or(0) + 1;
                entry.value = next.to_string();
                entry.expires_at = Some(now + 3600);
                next
            };
            let duration = if count >= 2 { 300 } else { 60 };
            let expiry = now + duration;
            inner.strings.insert(
                ban_key,
                StringEntry {
                    value: expiry.to_string(),
                    expires_at: Some(expiry),
                },
            );
            return Ok(MintOutcome::TooManyActive {
                retry_after: duration,
                ban_expires_at: expiry,
                violation_count: count,
            });
        }

        // Clean mint with no active ban clears the violation history.
        inner.strings.remove(&vio_key);

        inner.strings.insert(
            super::keys::challenge(candidate_id),
            StringEntry {
                value: identifier.to_string(),
                expires_at: Some(now + ttl_seconds),
            },
        );
        inner
            .zsets
            .entry(active_key)
            .or_default()
            .members
            .insert(candidate_id.to_string(), now + ttl_seconds);

        Ok(MintOutcome::Minted {
            challenge: candidate_id.to_string(),
            expires_in: ttl_seconds,
        })
    }

    async fn challenge_consume(
        &self,
        challenge_id: &str,
        identifier: &str,
    ) -> Result<ConsumeOutcome> {
        let chal_key = super::keys::challenge(challenge_id);
        let now = Self::now_secs();

        let mut inner = self.lock();
        let stored = match inner.get_live_string(&chal_key, now) {
            Some(entry) => entry.value.clone(),
            None => return Ok(ConsumeOutcome::NotFound),
        };
        if stored != identifier {
            return Ok(ConsumeOutcome::Mismatch);
        }
        inner.strings.remove(&chal_key);
        let active_key = super::keys::challenge_active(identifier);
        if let Some(set) = inner.zsets.get_mut(&active_key) {
            set.members.remove(challenge_id);
        }
        Ok(ConsumeOutcome::Consumed)
    }

    async fn check_ban(&self, ban_key: &str, now: i64) -> Result<Option<i64>> {
        let mut inner = self.lock();
        let expiry = inner
            .strings
            .get(ban_key)
            .and_then(|e| e.value.parse::<i64>().ok());
        match expiry {
            Some(exp) if exp > now => Ok(Some(exp)),
            Some(_) => {
                inner.strings.remove(ban_key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn register_violation(
        &self,
        violation_key: &str,
        ban_key: &str,
        now: i64,
        ladder: &[i64],
    ) -> Result<(u64, i64)> {
        let mut inner = self.lock();
        let count = {
            let entry = inner.strings.entry(violation_key.to_string()).or_default();
            let next = entry.value.parse::<u64>().unwrap_or(0) + 1;
            entry.value = next.to_string();
            entry.expires_at = Some(now + 86_400);
            next
        };
        let idx = ((count as usize).saturating_sub(1)).min(ladder.len().saturating_sub(1));
        let duration = ladder.get(idx).copied().unwrap_or(60);
        let expiry = now + duration;
        inner.strings.insert(
            ban_key.to_string(),
            StringEntry {
                value: expiry.to_string(),
                expires_at: Some(expiry),
            },
        );
        Ok((count, expiry))
    }

    async fn get_string(&self, key: &str) -> Result<Option<String>> {
        let now = Self::now_secs();
        let mut inner = self.lock();
        Ok(inner.get_live_string(key, now).map(|e| e.value.clone()))
    }

    async fn set_string_ex(&self, key: &str, value: &str, ttl_seconds: i64) -> Result<()> {
        let now = Self::now_secs();
        let mut inner = self.lock();
        inner.strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at: Some(now + ttl_seconds),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.strings.remove(key);
        inner.zsets.remove(key);
        inner.hashes.remove(key);
        inner.floats.remove(key);
        Ok(())
    }

    async fn get_f64(&self, key: &str) -> Result<Option<f64>> {
        let inner = self.lock();
        Ok(inner.floats.get(key).copied())
    }

    async fn hget_u64(&self, key: &str, field: &str) -> Result<Option<u64>> {
        let inner = self.lock();
        Ok(inner.hashes.get(key).and_then(|h| h.get(field)).copied())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let inner = self.lock();
        Ok(inner
            .strings
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
