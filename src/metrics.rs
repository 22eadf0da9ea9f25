//! Prometheus metrics registry.
//!
//! One process-wide registry rendered at `GET /metrics`. Handles are lazies
//! so any module can record without threading the registry through.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec_with_registry, register_gauge_with_registry,
    register_int_counter_vec_with_registry, register_int_counter_with_registry, CounterVec, Gauge,
    IntCounter, IntCounterVec, Registry, TextEncoder,
};

/// Process-wide metrics registry.
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Rate-limit rejections by endpoint bucket.
pub static RATE_LIMIT_REJECTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec_with_registry!(
        "rate_limit_rejections_total",
        "Requests rejected by the sliding-window rate limiter",
        &["bucket"],
        *REGISTRY
    )
    .expect("metric registration")
});

/// Progressive bans applied, by endpoint bucket.
pub static RATE_LIMIT_BANS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec_with_registry!(
        "rate_limit_bans_total",
        "Progressive bans applied",
        &["bucket"],
        *REGISTRY
    )
    .expect("metric registration")
});

/// Cache lookups by tier and outcome (`hit`/`miss`).
pub static CACHE_LOOKUPS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec_with_registry!(
        "cache_lookups_total",
        "Cache lookups by tier and outcome",
        &["tier", "outcome"],
        *REGISTRY
    )
    .expect("metric registration")
});

/// LLM calls by operation and status.
pub static LLM_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec_with_registry!(
        "llm_requests_total",
        "LLM calls by operation and status",
        &["operation", "status"],
        *REGISTRY
    )
    .expect("metric registration")
});

/// Accumulated LLM cost by operation, USD.
pub static LLM_COST_USD: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec_with_registry!(
        "llm_cost_usd_total",
        "Accumulated LLM cost in USD by operation",
        &["operation"],
        *REGISTRY
    )
    .expect("metric registration")
});

/// Current daily spend, USD (set from ledger snapshots).
pub static LLM_DAILY_COST: Lazy<Gauge> = Lazy::new(|| {
    register_gauge_with_registry!(
        "llm_daily_cost_usd",
        "Daily LLM spend in USD",
        *REGISTRY
    )
    .expect("metric registration")
});

/// Current hourly spend, USD.
pub static LLM_HOURLY_COST: Lazy<Gauge> = Lazy::new(|| {
    register_gauge_with_registry!(
        "llm_hourly_cost_usd",
        "Hourly LLM spend in USD",
        *REGISTRY
    )
    .expect("metric registration")
});

/// Chat queries accepted into the pipeline.
pub static QUERIES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter_with_registry!(
        "chat_queries_total",
        "Chat queries accepted into the pipeline",
        *REGISTRY
    )
    .expect("metric registration")
});

/// Render the registry in Prometheus text format.
pub fn render() -> String {
    // Touch the lazies so a scrape before first use still lists the families.
    Lazy::force(&RATE_LIMIT_REJECTIONS);
    Lazy::force(&RATE_LIMIT_BANS);
    Lazy::force(&CACHE_LOOKUPS);
    Lazy::force(&LLM_REQUESTS);
    Lazy::force(&LLM_COST_USD);
    Lazy::force(&LLM_DAILY_COST);
    Lazy::force(&LLM_HOURLY_COST);
    Lazy::force(&QUERIES_TOTAL);
    TextEncoder::new()
        .encode_to_string(&REGISTRY.gather())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_registered_families() {
        RATE_LIMIT_REJECTIONS.with_label_values(&["chat"]).inc();
        CACHE_LOOKUPS.with_label_values(&["exact", "hit"]).inc();
        let out = render();
        assert!(out.contains("rate_limit_rejections_total"));
        assert!(out.contains("cache_lookups_total"));
        assert!(out.contains("llm_daily_cost_usd"));
    }

    #[test]
    fn test_counters_accumulate() {
        let before = LLM_REQUESTS.with_label_values(&["generate", "success"]).get();
        LLM_REQUESTS.with_label_values(&["generate", "success"]).inc();
        assert_eq!(
            LLM_REQUESTS.with_label_values(&["generate", "success"]).get(),
            before + 1
        );
    }
}
