//! Redis KV backend.
//!
//! Executes the Lua scripts from [`super::scripts`] through a shared
//! `ConnectionManager` (auto-reconnecting, cheap to clone). Script results
//! come back as heterogeneous Redis arrays; parsing lives here so callers
//! only ever see the typed outcome enums.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script, Value};

use crate::error::{HubError, Result};

use super::{
    AtomicKv, ConsumeOutcome, MintOutcome, SpendReservation, ThrottleOutcome, WindowAdmit,
};

/// Redis-backed atomic KV store.
pub struct RedisKv {
    manager: ConnectionManager,
    sliding_window: Script,
    check_and_reserve: Script,
    adjust_spend: Script,
    cost_throttle: Script,
    challenge_mint: Script,
    challenge_consume: Script,
    check_ban: Script,
    register_violation: Script,
}

impl RedisKv {
    /// Connect to Redis and pre-load the script handles.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self {
            manager,
            sliding_window: Script::new(super::scripts::SLIDING_WINDOW),
            check_and_reserve: Script::new(super::scripts::CHECK_AND_RESERVE_SPEND),
            adjust_spend: Script::new(super::scripts::ADJUST_SPEND),
            cost_throttle: Script::new(super::scripts::COST_THROTTLE),
            challenge_mint: Script::new(super::scripts::CHALLENGE_MINT),
            challenge_consume: Script::new(super::scripts::CHALLENGE_CONSUME),
            check_ban: Script::new(super::scripts::CHECK_BAN),
            register_violation: Script::new(super::scripts::REGISTER_VIOLATION),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

// ---------------------------------------------------------------------------
// Reply parsing
// ---------------------------------------------------------------------------

fn as_i64(value: &Value) -> Result<i64> {
    match value {
        Value::Int(n) => Ok(*n),
        Value::Data(bytes) => String::from_utf8_lossy(bytes)
            .parse::<i64>()
            .map_err(|e| HubError::Kv(format!("non-integer script reply: {e}"))),
        other => Err(HubError::Kv(format!("unexpected script reply: {other:?}"))),
    }
}

fn as_f64(value: &Value) -> Result<f64> {
    match value {
        Value::Int(n) => Ok(*n as f64),
        Value::Data(bytes) => String::from_utf8_lossy(bytes)
            .parse::<f64>()
            .map_err(|e| HubError::Kv(format!("non-float script reply: {e}"))),
        other => Err(HubError::Kv(format!("unexpected script reply: {other:?}"))),
    }
}

fn as_string(value: &Value) -> Result<String> {
    match value {
        Value::Data(bytes) => Ok(String::from_utf8_lossy(bytes).into_owned()),
        Value::Status(s) => Ok(s.clone()),
        other => Err(HubError::Kv(format!("unexpected script reply: {other:?}"))),
    }
}

fn as_array(value: Value, expected_len: usize) -> Result<Vec<Value>> {
    match value {
        Value::Bulk(items) if items.len() >= expected_len => Ok(items),
        other => Err(HubError::Kv(format!(
            "script reply is not an array of >= {expected_len}: {other:?}"
        ))),
    }
}

#[async_trait]
impl AtomicKv for RedisKv {
    async fn sliding_window_admit(
        &self,
        bucket_key: &str,
        now: i64,
        window_seconds: i64,
        limit: u64,
        member: &str,
        expire_seconds: i64,
    ) -> Result<WindowAdmit> {
        let mut conn = self.conn();
        let reply: Value = self
            .sliding_window
            .key(bucket_key)
            .arg(now)
            .arg(window_seconds)
            .arg(limit)
            .arg(member)
            .arg(expire_seconds)
            .invoke_async(&mut conn)
            .await?;
        let items = as_array(reply, 3)?;
        Ok(WindowAdmit {
            allowed: as_i64(&items[0])? == 1,
            count: as_i64(&items[1])?.max(0) as u64,
            oldest_score: as_i64(&items[2])?,
        })
    }

    async fn check_and_reserve_spend(
        &self,
        daily_key: &str,
        hourly_key: &str,
        buffered_cost: f64,
        daily_limit: f64,
        hourly_limit: f64,
        daily_ttl: i64,
        hourly_ttl: i64,
    ) -> Result<SpendReservation> {
        let mut conn = self.conn();
        let reply: Value = self
            .check_and_reserve
            .key(daily_key)
            .key(hourly_key)
            .arg(buffered_cost)
            .arg(daily_limit)
            .arg(hourly_limit)
            .arg(daily_ttl)
            .arg(hourly_ttl)
            .invoke_async(&mut conn)
            .await?;
        let items = as_array(reply, 3)?;
        let daily_total = as_f64(&items[1])?;
        let hourly_total = as_f64(&items[2])?;
        Ok(match as_i64(&items[0])? {
            0 => SpendReservation::Allowed {
                daily_total,
                hourly_total,
            },
            1 => SpendReservation::DailyExceeded {
                daily_total,
                hourly_total,
            },
            _ => SpendReservation::HourlyExceeded {
                daily_total,
                hourly_total,
            },
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
        daily_ttl: i64,
        hourly_ttl: i64,
    ) -> Result<()> {
        let mut conn = self.conn();
        let _: Value = self
            .adjust_spend
            .key(daily_cost_key)
            .key(hourly_cost_key)
            .key(daily_token_key)
            .key(hourly_token_key)
            .arg(cost_delta)
            .arg(input_tokens)
            .arg(output_tokens)
            .arg(daily_ttl)
            .arg(hourly_ttl)
            .invoke_async(&mut conn)
            .await?;
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
        daily_ttl: i64,
    ) -> Result<ThrottleOutcome> {
        let mut conn = self.conn();
        let reply: Value = self
            .cost_throttle
            .key(window_key)
            .key(daily_key)
            .key(marker_key)
            .arg(now)
            .arg(window_seconds)
            .arg(estimated_cost)
            .arg(window_threshold)
            .arg(daily_limit)
            .arg(throttle_duration)
            .arg(member)
            .arg(daily_ttl)
            .invoke_async(&mut conn)
            .await?;
        let items = as_array(reply, 2)?;
        let retry_after = as_i64(&items[1])?;
        Ok(match as_i64(&items[0])? {
            0 => ThrottleOutcome::Allowed,
            1 => ThrottleOutcome::AlreadyThrottled { retry_after },
            2 => ThrottleOutcome::DailyLimit { retry_after },
            _ => ThrottleOutcome::WindowBurst { retry_after },
        })
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
        let mut conn = self.conn();
        let reply: Value = self
            .challenge_mint
            .key(super::keys::challenge_active(identifier))
            .key(super::keys::challenge_ratelimit(identifier))
            .key(super::keys::challenge_ban(identifier))
            .key(super::keys::challenge_violations(identifier))
            .key(super::keys::challenge(candidate_id))
            .arg(identifier)
            .arg(candidate_id)
            .arg(now)
            .arg(ttl_seconds)
            .arg(max_active)
            .arg(rate_limit_seconds)
            .invoke_async(&mut conn)
            .await?;
        let items = as_array(reply, 2)?;
        let tag = as_string(&items[0])?;
        Ok(match tag.as_str() {
            "minted" => MintOutcome::Minted {
                challenge: as_string(&items[1])?,
                expires_in: as_i64(&items[2])?,
            },
            "reused" => MintOutcome::Reused {
                challenge: as_string(&items[1])?,
                expires_in: as_i64(&items[2])?,
            },
            "ratelimited" => MintOutcome::RateLimited {
                retry_after: as_i64(&items[1])?,
            },
            "toomany" => MintOutcome::TooManyActive {
                retry_after: as_i64(&items[1])?,
                ban_expires_at: as_i64(&items[2])?,
                violation_count: as_i64(&items[3])?.max(0) as u64,
            },
            "banned" => MintOutcome::Banned {
                retry_after: as_i64(&items[1])?,
                ban_expires_at: as_i64(&items[2])?,
                violation_count: as_i64(&items[3])?.max(0) as u64,
            },
            other => return Err(HubError::Kv(format!("unknown mint outcome tag: {other}"))),
        })
    }

    async fn challenge_consume(
        &self,
        challenge_id: &str,
        identifier: &str,
    ) -> Result<ConsumeOutcome> {
        let mut conn = self.conn();
        let reply: Value = self
            .challenge_consume
            .key(super::keys::challenge(challenge_id))
            .key(super::keys::challenge_active(identifier))
            .arg(identifier)
            .arg(challenge_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(match as_string(&reply)?.as_str() {
            "consumed" => ConsumeOutcome::Consumed,
            "mismatch" => ConsumeOutcome::Mismatch,
            _ => ConsumeOutcome::NotFound,
        })
    }

    async fn check_ban(&self, ban_key: &str, now: i64) -> Result<Option<i64>> {
        let mut conn = self.conn();
        let reply: Value = self
            .check_ban
            .key(ban_key)
            .arg(now)
            .invoke_async(&mut conn)
            .await?;
        let expiry = as_i64(&reply)?;
        Ok(if expiry > 0 { Some(expiry) } else { None })
    }

    async fn register_violation(
        &self,
        violation_key: &str,
        ban_key: &str,
        now: i64,
        ladder: &[i64],
    ) -> Result<(u64, i64)> {
        let mut conn = self.conn();
        let mut invocation = self.register_violation.prepare_invoke();
        invocation.key(violation_key).key(ban_key).arg(now).arg(86_400);
        for duration in ladder {
            invocation.arg(*duration);
        }
        let reply: Value = invocation.invoke_async(&mut conn).await?;
        let items = as_array(reply, 2)?;
        Ok((as_i64(&items[0])?.max(0) as u64, as_i64(&items[1])?))
    }

    async fn get_string(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        Ok(conn.get(key).await?)
    }

    async fn set_string_ex(&self, key: &str, value: &str, ttl_seconds: i64) -> Result<()> {
        let mut conn = self.conn();
        let _: () = redis::cmd("SETEX")
            .arg(key)
            .arg(ttl_seconds.max(1))
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: i64 = conn.del(key).await?;
        Ok(())
    }

    async fn get_f64(&self, key: &str) -> Result<Option<f64>> {
        let mut conn = self.conn();
        let raw: Option<String> = conn.get(key).await?;
        Ok(raw.and_then(|s| s.parse::<f64>().ok()))
    }

    async fn hget_u64(&self, key: &str, field: &str) -> Result<Option<u64>> {
        let mut conn = self.conn();
        let raw: Option<String> = conn.hget(key, field).await?;
        Ok(raw.and_then(|s| s.parse::<u64>().ok()))
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let pattern = format!("{prefix}*");
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(HubError::Kv(format!("unexpected PING reply: {pong}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_as_i64_accepts_int_and_bytes() {
        assert_eq!(as_i64(&Value::Int(7)).unwrap(), 7);
        assert_eq!(as_i64(&Value::Data(b"42".to_vec())).unwrap(), 42);
        assert!(as_i64(&Value::Nil).is_err());
    }

    #[test]
    fn test_as_f64_parses_stringified_totals() {
        // CHECK_AND_RESERVE_SPEND returns totals as strings.
        assert!((as_f64(&Value::Data(b"4.961".to_vec())).unwrap() - 4.961).abs() < 1e-9);
        assert!((as_f64(&Value::Int(3)).unwrap() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_as_array_length_guard() {
        let v = Value::Bulk(vec![Value::Int(1)]);
        assert!(as_array(v, 2).is_err());
    }

    #[test]
    fn test_as_string_accepts_status_and_data() {
        assert_eq!(as_string(&Value::Status("consumed".into())).unwrap(), "consumed");
        assert_eq!(as_string(&Value::Data(b"minted".to_vec())).unwrap(), "minted");
    }
}
