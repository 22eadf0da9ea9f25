//! Abuse-prevention settings with KV override and env fallback.
//!
//! The admin dashboard writes a JSON blob to `admin:settings:abuse_prevention`.
//! Reads check that blob first, then the environment variable, then the
//! built-in default. A process-local cache holds the last blob read; admin
//! writes must call [`SettingsReader::invalidate`] so the next read refetches.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::kv::{keys, AtomicKv};

/// Cached reader for the KV-stored settings blob.
pub struct SettingsReader {
    kv: Arc<dyn AtomicKv>,
    /// `None` = not fetched yet; `Some(map)` = last blob read (possibly empty).
    cache: RwLock<Option<Value>>,
}

impl SettingsReader {
    pub fn new(kv: Arc<dyn AtomicKv>) -> Self {
        Self {
            kv,
            cache: RwLock::new(None),
        }
    }

    /// Drop the cached blob; the next read fetches from the KV store.
    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
    }

    /// Fetch the raw settings blob, serving from cache when warm.
    pub async fn blob(&self) -> Value {
        if let Some(cached) = self.cache.read().await.clone() {
            return cached;
        }
        let value = match self.kv.get_string(keys::SETTINGS).await {
            Ok(Some(json)) => serde_json::from_str(&json).unwrap_or_else(|e| {
                warn!("settings blob is not valid JSON, ignoring: {e}");
                Value::Object(Default::default())
            }),
            Ok(None) => Value::Object(Default::default()),
            Err(e) => {
                debug!("settings read failed, using env/defaults: {e}");
                Value::Object(Default::default())
            }
        };
        *self.cache.write().await = Some(value.clone());
        value
    }

    /// Persist a new settings blob and invalidate the cache.
    pub async fn write(&self, blob: &Value) -> crate::error::Result<()> {
        let json = serde_json::to_string(blob)?;
        // Settings have no natural expiry; a year keeps abandoned overrides
        // from living forever.
        self.kv
            .set_string_ex(keys::SETTINGS, &json, 365 * 24 * 3600)
            .await?;
        self.invalidate().await;
        Ok(())
    }

    /// Boolean setting: blob key, then env var, then default.
    pub async fn get_bool(&self, key: &str, env_var: &str, default: bool) -> bool {
        let blob = self.blob().await;
        match blob.get(key) {
            Some(Value::Bool(b)) => return *b,
            Some(Value::String(s)) => return s.eq_ignore_ascii_case("true"),
            Some(other) => {
                warn!("setting {key} has unexpected type {other:?}, using env fallback")
            }
            None => {}
        }
        crate::config::env_bool(env_var, default)
    }

    /// Tri-state boolean: `Some` only when the blob explicitly sets the key
    /// or the env var is present. Lets callers apply mode-dependent defaults
    /// (cost throttling is off in development unless explicitly enabled).
    pub async fn get_bool_explicit(&self, key: &str, env_var: &str) -> Option<bool> {
        let blob = self.blob().await;
        match blob.get(key) {
            Some(Value::Bool(b)) => return Some(*b),
            Some(Value::String(s)) => return Some(s.eq_ignore_ascii_case("true")),
            _ => {}
        }
        std::env::var(env_var)
            .ok()
            .map(|v| v.eq_ignore_ascii_case("true"))
    }

    /// Integer setting with the same precedence chain.
    pub async fn get_i64(&self, key: &str, env_var: &str, default: i64) -> i64 {
        let blob = self.blob().await;
        match blob.get(key) {
            Some(Value::Number(n)) => {
                if let Some(v) = n.as_i64() {
                    return v;
                }
            }
            Some(Value::String(s)) => {
                if let Ok(v) = s.parse::<i64>() {
                    return v;
                }
            }
            _ => {}
        }
        std::env::var(env_var)
            .ok()
            .and_then(|v| v.trim().parse::<i64>().ok())
            .unwrap_or(default)
    }

    /// Float setting with the same precedence chain.
    pub async fn get_f64(&self, key: &str, env_var: &str, default: f64) -> f64 {
        let blob = self.blob().await;
        match blob.get(key) {
            Some(Value::Number(n)) => {
                if let Some(v) = n.as_f64() {
                    return v;
                }
            }
            Some(Value::String(s)) => {
                if let Ok(v) = s.parse::<f64>() {
                    return v;
                }
            }
            _ => {}
        }
        std::env::var(env_var)
            .ok()
            .and_then(|v| v.trim().parse::<f64>().ok())
            .unwrap_or(default)
    }
}
