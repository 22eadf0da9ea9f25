//! Environment-driven service configuration.
//!
//! Everything here is read once at startup. Abuse-prevention tunables that
//! the admin dashboard can change at runtime live in [`crate::settings`]
//! instead (KV-stored JSON with env fallback); this module holds the static
//! wiring: addresses, credentials, feature flags, and pipeline tunables.

use crate::error::{HubError, Result};

/// Maximum accepted query length in characters.
pub const DEFAULT_MAX_QUERY_LENGTH: usize = 400;

/// Static service configuration, fully resolved from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address for the HTTP server, e.g. `0.0.0.0:8000`.
    pub bind_address: String,
    /// Redis connection URL. `None` selects the in-memory KV backend
    /// (development / tests only).
    pub redis_url: Option<String>,
    /// Bearer token protecting `/admin` routes. `None` disables admin auth
    /// entirely (all admin requests rejected).
    pub admin_token: Option<String>,
    /// Gemini API key. `None` selects the echo provider used in tests.
    pub gemini_api_key: Option<String>,
    /// LLM model name, also the key into the price table.
    pub llm_model: String,
    /// Base URL of the embeddings service (dense + sparse).
    pub embeddings_url: Option<String>,
    /// Webhook URL for out-of-band abuse/degradation alerts.
    pub alert_webhook_url: Option<String>,
    /// CORS origin allowed to call the API.
    pub cors_origin: Option<String>,

    /// `ENVIRONMENT=development` (or `DEBUG=true`) relaxes cost throttling.
    pub is_development: bool,
    /// Trust the leftmost `X-Forwarded-For` entry for client IPs.
    pub trust_x_forwarded_for: bool,

    // ── Feature flags ───────────────────────────────────────────────────────
    pub use_infinity_embeddings: bool,
    pub use_redis_cache: bool,
    pub use_faq_indexing: bool,
    pub use_intent_classification: bool,
    pub use_short_query_expansion: bool,
    /// Turnstile bot verification; requires the secret key to be set.
    pub enable_turnstile: bool,
    pub turnstile_secret_key: Option<String>,

    // ── Pipeline tunables ───────────────────────────────────────────────────
    pub max_query_length: usize,
    pub max_chat_history_pairs: usize,
    pub retriever_k: usize,
    pub min_vector_similarity: f32,
    pub sparse_rerank_limit: usize,
    pub faq_match_threshold: f64,
    pub semantic_cache_threshold: f32,
}

impl Config {
    /// Resolve configuration from the process environment.
    ///
    /// Only the bind address has a hard default; everything credential-like
    /// is optional so the binary can boot in degraded development mode.
    pub fn from_env() -> Result<Self> {
        let is_development = env_str("ENVIRONMENT")
            .map(|v| v.eq_ignore_ascii_case("development"))
            .unwrap_or(false)
            || env_bool("DEBUG", false);

        Ok(Self {
            bind_address: env_str("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:8000".to_string()),
            redis_url: env_str("REDIS_URL"),
            admin_token: env_str("ADMIN_TOKEN"),
            gemini_api_key: env_str("GEMINI_API_KEY").or_else(|| env_str("GOOGLE_API_KEY")),
            llm_model: env_str("LLM_MODEL_NAME")
                .unwrap_or_else(|| "gemini-2.0-flash-lite".to_string()),
            embeddings_url: env_str("EMBEDDINGS_URL"),
            alert_webhook_url: env_str("ALERT_WEBHOOK_URL"),
            cors_origin: env_str("CORS_ALLOWED_ORIGIN"),
            is_development,
            trust_x_forwarded_for: env_bool("TRUST_X_FORWARDED_FOR", false),
            use_infinity_embeddings: env_bool("USE_INFINITY_EMBEDDINGS", false),
            use_redis_cache: env_bool("USE_REDIS_CACHE", false),
            use_faq_indexing: env_bool("USE_FAQ_INDEXING", true),
            use_intent_classification: env_bool("USE_INTENT_CLASSIFICATION", true),
            use_short_query_expansion: env_bool("USE_SHORT_QUERY_EXPANSION", true),
            enable_turnstile: env_bool("ENABLE_TURNSTILE", false),
            turnstile_secret_key: env_str("TURNSTILE_SECRET_KEY"),
            max_query_length: env_parse("MAX_QUERY_LENGTH", DEFAULT_MAX_QUERY_LENGTH)?,
            max_chat_history_pairs: env_parse("MAX_CHAT_HISTORY_PAIRS", 2)?,
            retriever_k: env_parse("RETRIEVER_K", 12)?,
            min_vector_similarity: env_parse("MIN_VECTOR_SIMILARITY", 0.28_f32)?,
            sparse_rerank_limit: env_parse("SPARSE_RERANK_LIMIT", 10)?,
            faq_match_threshold: env_parse("FAQ_MATCH_THRESHOLD", 85.0_f64)?,
            semantic_cache_threshold: env_parse("SEMANTIC_CACHE_THRESHOLD", 0.95_f32)?,
        })
    }

    /// True when Turnstile verification should actually run.
    pub fn turnstile_enabled(&self) -> bool {
        self.enable_turnstile
            && self
                .turnstile_secret_key
                .as_deref()
                .map(|k| !k.is_empty())
                .unwrap_or(false)
    }
}

impl Default for Config {
    /// Test-friendly defaults: no external services, permissive flags.
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:0".to_string(),
            redis_url: None,
            admin_token: None,
            gemini_api_key: None,
            llm_model: "gemini-2.0-flash-lite".to_string(),
            embeddings_url: None,
            alert_webhook_url: None,
            cors_origin: None,
            is_development: true,
            trust_x_forwarded_for: false,
            use_infinity_embeddings: false,
            use_redis_cache: false,
            use_faq_indexing: true,
            use_intent_classification: true,
            use_short_query_expansion: true,
            enable_turnstile: false,
            turnstile_secret_key: None,
            max_query_length: DEFAULT_MAX_QUERY_LENGTH,
            max_chat_history_pairs: 2,
            retriever_k: 12,
            min_vector_similarity: 0.28,
            sparse_rerank_limit: 10,
            faq_match_threshold: 85.0,
            semantic_cache_threshold: 0.95,
        }
    }
}

// ---------------------------------------------------------------------------
// Env helpers
// ---------------------------------------------------------------------------

fn env_str(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Parse a boolean env var; accepts `true`/`1`/`yes` case-insensitively.
pub fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(v) => v
            .trim()
            .parse::<T>()
            .map_err(|_| HubError::Config(format!("invalid value for {key}: {v:?}"))),
        Err(_) => Ok(default),
    }
}
