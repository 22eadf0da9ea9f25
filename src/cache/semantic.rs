//! Semantic vector cache (tier T4).
//!
//! One logical tier with one backend chosen at startup: the in-process
//! cosine index always exists; with KV persistence enabled, entries are
//! also written to `llm:semcache:<id>` (JSON, ~72h TTL) and the index is
//! rebuilt from a scan at startup, so cached answers survive restarts.
//!
//! Keys are dense vectors of the *rewritten standalone* query, with no
//! history in the key, so different conversation paths that rewrite to the same
//! question converge on one entry.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::kv::{keys, AtomicKv};
use crate::llm::embeddings::cosine_similarity;
use crate::retrieval::Document;

/// Default entry TTL: 72 hours.
pub const SEMANTIC_TTL_SECONDS: i64 = 72 * 3600;

/// Persisted (and in-memory) entry payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SemanticPayload {
    vector: Vec<f32>,
    answer: String,
    sources: Vec<Document>,
    expires_at: i64,
}

struct IndexEntry {
    key: String,
    vector: Vec<f32>,
    /// Inline payload when persistence is off.
    inline: Option<(String, Vec<Document>)>,
    expires_at: i64,
}

/// Vector-keyed answer cache with cosine matching.
pub struct SemanticCache {
    index: RwLock<Vec<IndexEntry>>,
    threshold: f32,
    ttl_seconds: i64,
    persist: Option<Arc<dyn AtomicKv>>,
}

impl SemanticCache {
    /// In-process only.
    pub fn in_memory(threshold: f32) -> Self {
        Self {
            index: RwLock::new(Vec::new()),
            threshold,
            ttl_seconds: SEMANTIC_TTL_SECONDS,
            persist: None,
        }
    }

    /// KV-persisted; call [`SemanticCache::load`] once at startup.
    pub fn persisted(threshold: f32, kv: Arc<dyn AtomicKv>) -> Self {
        Self {
            index: RwLock::new(Vec::new()),
            threshold,
            ttl_seconds: SEMANTIC_TTL_SECONDS,
            persist: Some(kv),
        }
    }

    fn now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64
    }

    /// Rebuild the in-process index from persisted entries.
    pub async fn load(&self) {
        let Some(kv) = &self.persist else {
            return;
        };
        let keys = match kv.scan_prefix(keys::SEMCACHE_PREFIX).await {
            Ok(k) => k,
            Err(e) => {
                warn!("semantic cache scan failed, starting empty: {e}");
                return;
            }
        };
        let now = Self::now();
        let mut index = Vec::new();
        for key in keys {
            let Ok(Some(raw)) = kv.get_string(&key).await else {
                continue;
            };
            match serde_json::from_str::<SemanticPayload>(&raw) {
                Ok(payload) if payload.expires_at > now => index.push(IndexEntry {
                    key,
                    vector: payload.vector,
                    inline: None,
                    expires_at: payload.expires_at,
                }),
                Ok(_) => {
                    let _ = kv.delete(&key).await;
                }
                Err(e) => warn!("skipping corrupt semantic cache entry {key}: {e}"),
            }
        }
        debug!(entries = index.len(), "semantic cache index loaded");
        *self.index.write().await = index;
    }

    /// Best match for `vector` at or above the similarity threshold.
    pub async fn get(&self, vector: &[f32]) -> Option<(String, Vec<Document>)> {
        let now = Self::now();
        let (best_key, inline) = {
            let index = self.index.read().await;
            let mut best: Option<(f32, &IndexEntry)> = None;
            for entry in index.iter().filter(|e| e.expires_at > now) {
                let similarity = cosine_similarity(vector, &entry.vector);
                if similarity >= self.threshold
                    && best.map(|(s, _)| similarity > s).unwrap_or(true)
                {
                    best = Some((similarity, entry));
                }
            }
            let (_, entry) = best?;
            (entry.key.clone(), entry.inline.clone())
        };

        let result = match (&self.persist, inline) {
            (_, Some(payload)) => Some(payload),
            (Some(kv), None) => match kv.get_string(&best_key).await {
                Ok(Some(raw)) => serde_json::from_str::<SemanticPayload>(&raw)
                    .ok()
                    .map(|p| (p.answer, p.sources)),
                Ok(None) => None,
                Err(e) => {
                    warn!("semantic cache payload read failed: {e}");
                    None
                }
            },
            (None, None) => None,
        };

        match result {
            Some((answer, sources))
                if answer.trim() != crate::pipeline::GENERIC_USER_ERROR_MESSAGE =>
            {
                Some((answer, sources))
            }
            _ => {
                // Entry vanished, expired mid-flight or is poisoned: drop it
                // from the index and report a miss.
                self.index.write().await.retain(|e| e.key != best_key);
                None
            }
        }
    }

    /// Store an answer keyed by its query vector. Best-effort.
    pub async fn set(&self, vector: Vec<f32>, answer: &str, sources: &[Document]) {
        let Some((answer, sources)) = super::sanitize_entry(answer, sources) else {
            return;
        };
        if vector.is_empty() {
            return;
        }
        let now = Self::now();
        let expires_at = now + self.ttl_seconds;
        let key = keys::semcache(uuid::Uuid::new_v4().simple().to_string().as_str());

        let inline = match &self.persist {
            Some(kv) => {
                let payload = SemanticPayload {
                    vector: vector.clone(),
                    answer: answer.clone(),
                    sources: sources.clone(),
                    expires_at,
                };
                match serde_json::to_string(&payload) {
                    Ok(json) => {
                        if let Err(e) = kv.set_string_ex(&key, &json, self.ttl_seconds).await {
                            warn!("semantic cache persist failed, keeping inline: {e}");
                            Some((answer, sources))
                        } else {
                            None
                        }
                    }
                    Err(e) => {
                        warn!("semantic payload serialization failed: {e}");
                        Some((answer, sources))
                    }
                }
            }
            None => Some((answer, sources)),
        };

        let mut index = self.index.write().await;
        index.retain(|e| e.expires_at > now);
        index.push(IndexEntry {
            key,
            vector,
            inline,
            expires_at,
        });
    }

    /// Drop everything, including persisted entries.
    pub async fn clear(&self) {
        if let Some(kv) = &self.persist {
            if let Ok(keys) = kv.scan_prefix(keys::SEMCACHE_PREFIX).await {
                for key in keys {
                    let _ = kv.delete(&key).await;
                }
            }
        }
        self.index.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.index.read().await.len()
    }
}
