//! KV key layout.
//!
//! The layout is a contract (any compatible store may back it); admin
//! tooling and the ingestion pipeline address the same keys.

/// JSON-encoded abuse-prevention settings blob written by the admin API.
pub const SETTINGS: &str = "admin:settings:abuse_prevention";

/// Sliding-window set: `rl:<bucket>:<stable-id>:{m,h}`.
pub fn window(bucket: &str, stable_id: &str, suffix: char) -> String {
    format!("rl:{bucket}:{stable_id}:{suffix}")
}

/// Global sliding-window set: `rl:global:{m,h}`.
pub fn global_window(suffix: char) -> String {
    format!("rl:global:{suffix}")
}

/// Progressive ban marker keyed on IP: `rl:ban:<bucket>:<ip>`.
pub fn ban(bucket: &str, ip: &str) -> String {
    format!("rl:ban:{bucket}:{ip}")
}

/// 24-hour violation counter keyed on IP: `rl:violations:<bucket>:<ip>`.
pub fn violations(bucket: &str, ip: &str) -> String {
    format!("rl:violations:{bucket}:{ip}")
}

/// One-time challenge value: `challenge:<id>` -> identifier.
pub fn challenge(id: &str) -> String {
    format!("challenge:{id}")
}

/// Active challenges per identifier (scored by expiry).
pub fn challenge_active(identifier: &str) -> String {
    format!("challenge:active:{identifier}")
}

/// Last-mint timestamp for the challenge re-request rate limit.
pub fn challenge_ratelimit(identifier: &str) -> String {
    format!("challenge:ratelimit:{identifier}")
}

/// Challenge-abuse ban marker.
pub fn challenge_ban(identifier: &str) -> String {
    format!("challenge:ban:{identifier}")
}

/// Challenge-abuse violation counter (1h TTL).
pub fn challenge_violations(identifier: &str) -> String {
    format!("challenge:violations:{identifier}")
}

/// Global daily cost counter: `llm:cost:daily:<YYYY-MM-DD>`.
pub fn spend_daily_cost(date: &str) -> String {
    format!("llm:cost:daily:{date}")
}

/// Global hourly cost counter: `llm:cost:hourly:<YYYY-MM-DD-HH>`.
pub fn spend_hourly_cost(date_hour: &str) -> String {
    format!("llm:cost:hourly:{date_hour}")
}

/// Daily token hash (`input`/`output` fields).
pub fn spend_daily_tokens(date: &str) -> String {
    format!("llm:tokens:daily:{date}")
}

/// Hourly token hash (`input`/`output` fields).
pub fn spend_hourly_tokens(date_hour: &str) -> String {
    format!("llm:tokens:hourly:{date_hour}")
}

/// Per-identifier burst-window cost set.
pub fn cost_recent(stable_id: &str) -> String {
    format!("llm:cost:recent:{stable_id}")
}

/// Per-identifier daily cost set, dated to avoid unbounded growth.
pub fn cost_daily(stable_id: &str, date: &str) -> String {
    format!("llm:cost:daily:{stable_id}:{date}")
}

/// Cost-throttle marker; presence (with TTL) means "throttled".
pub fn throttle_marker(stable_id: &str) -> String {
    format!("llm:throttle:{stable_id}")
}

/// Pre-generated FAQ answer payload keyed by question digest.
pub fn faq_answer(digest: &str) -> String {
    format!("faq:answer:{digest}")
}

/// Persisted semantic-cache entry.
pub fn semcache(id: &str) -> String {
    format!("llm:semcache:{id}")
}

/// Prefix used to enumerate persisted semantic-cache entries.
pub const SEMCACHE_PREFIX: &str = "llm:semcache:";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_key_shapes() {
        assert_eq!(window("chat", "abc", 'm'), "rl:chat:abc:m");
        assert_eq!(global_window('h'), "rl:global:h");
        assert_eq!(ban("chat", "1.2.3.4"), "rl:ban:chat:1.2.3.4");
        assert_eq!(violations("chat", "1.2.3.4"), "rl:violations:chat:1.2.3.4");
    }

    #[test]
    fn test_spend_key_shapes() {
        assert_eq!(spend_daily_cost("2026-08-01"), "llm:cost:daily:2026-08-01");
        assert_eq!(
            spend_hourly_cost("2026-08-01-14"),
            "llm:cost:hourly:2026-08-01-14"
        );
        assert_eq!(cost_daily("u1", "2026-08-01"), "llm:cost:daily:u1:2026-08-01");
        assert_eq!(throttle_marker("u1"), "llm:throttle:u1");
    }

    #[test]
    fn test_semcache_keys_share_prefix() {
        assert!(semcache("x").starts_with(SEMCACHE_PREFIX));
    }
}
