//! Exact answer cache (tier T3).
//!
//! Keyed by the MD5 of the normalized query plus the deduplicated recent
//! user turns, so the same question in the same conversational context hits
//! without any model involvement. In-process, time-bounded (~1h), capacity
//! bounded with oldest-entry eviction.

use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde_json::json;

use crate::retrieval::Document;

/// How many trailing exchanges feed the key.
const KEY_HISTORY_EXCHANGES: usize = 3;

#[derive(Debug, Clone)]
struct ExactEntry {
    answer: String,
    sources: Vec<Document>,
    created_at: u64,
}

/// In-process exact-match cache.
pub struct ExactCache {
    entries: DashMap<String, ExactEntry>,
    ttl_seconds: u64,
    max_entries: usize,
}

impl ExactCache {
    pub fn new(ttl_seconds: u64, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl_seconds,
            max_entries: max_entries.max(1),
        }
    }

    fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    /// MD5 over `{query, history}` with sorted keys.
    ///
    /// History contribution: the user side of the last three exchanges,
    /// normalized, minus turns equal to the query itself, deduplicated with
    /// order preserved. Keeps cache keys stable across repeated or echoed
    /// turns without fragmenting on assistant output.
    pub fn cache_key(query: &str, history: &[(String, String)]) -> String {
        let normalized_query = query.trim().to_lowercase();

        let recent = if history.len() > KEY_HISTORY_EXCHANGES {
            &history[history.len() - KEY_HISTORY_EXCHANGES..]
        } else {
            history
        };
        let mut deduped: Vec<String> = Vec::new();
        for (user_turn, _assistant_turn) in recent {
            let normalized = user_turn.trim().to_lowercase();
            if normalized.is_empty() || normalized == normalized_query {
                continue;
            }
            if !deduped.contains(&normalized) {
                deduped.push(normalized);
            }
        }

        // serde_json maps are sorted, so the serialization is canonical.
        let key_data = json!({
            "history": deduped,
            "query": normalized_query,
        });
        format!("{:x}", md5::compute(key_data.to_string().as_bytes()))
    }

    /// Look up an answer for `(query, history)`.
    pub fn get(&self, query: &str, history: &[(String, String)]) -> Option<(String, Vec<Document>)> {
        let key = Self::cache_key(query, history);
        let now = Self::now();

        let hit = {
            let entry = self.entries.get(&key)?;
            if now.saturating_sub(entry.created_at) >= self.ttl_seconds {
                None
            } else if entry.answer.trim() == crate::pipeline::GENERIC_USER_ERROR_MESSAGE {
                // Poisoned entry (written before the guard existed or by an
                // older build): treat as a miss and drop it below.
                None
            } else {
                Some((entry.answer.clone(), entry.sources.clone()))
            }
        };
        if hit.is_none() {
            self.entries.remove(&key);
        }
        hit
    }

    /// Store an answer. Error answers are refused, draft sources stripped.
    pub fn set(&self, query: &str, history: &[(String, String)], answer: &str, sources: &[Document]) {
        let Some((answer, sources)) = super::sanitize_entry(answer, sources) else {
            return;
        };
        let now = Self::now();

        // Evict expired entries, then the oldest while over capacity.
        self.entries
            .retain(|_, e| now.saturating_sub(e.created_at) < self.ttl_seconds);
        while self.entries.len() >= self.max_entries {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|e| e.value().created_at)
                .map(|e| e.key().clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }

        self.entries.insert(
            Self::cache_key(query, history),
            ExactEntry {
                answer,
                sources,
                created_at: now,
            },
        );
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::GENERIC_USER_ERROR_MESSAGE;

    fn pair(user: &str, assistant: &str) -> (String, String) {
        (user.to_string(), assistant.to_string())
    }

    #[test]
    fn test_key_ignores_assistant_turns() {
        let h1 = vec![pair("what is mweb", "MWEB is...")];
        let h2 = vec![pair("what is mweb", "a totally different answer")];
        assert_eq!(
            ExactCache::cache_key("tell me more", &h1),
            ExactCache::cache_key("tell me more", &h2)
        );
    }

    #[test]
    fn test_key_drops_turns_equal_to_query() {
        let history = vec![pair("What is MWEB?", "answer")];
        assert_eq!(
            ExactCache::cache_key("what is mweb?", &history),
            ExactCache::cache_key("what is mweb?", &[])
        );
    }

    #[test]
    fn test_key_dedupes_repeated_turns() {
        let repeated = vec![pair("halving", "a"), pair("halving", "b"), pair("supply", "c")];
        let once = vec![pair("halving", "x"), pair("supply", "y")];
        assert_eq!(
            ExactCache::cache_key("next", &repeated),
            ExactCache::cache_key("next", &once)
        );
    }

    #[test]
    fn test_key_uses_last_three_exchanges() {
        let long: Vec<(String, String)> = (0..6).map(|i| pair(&format!("q{i}"), "a")).collect();
        let tail: Vec<(String, String)> = (3..6).map(|i| pair(&format!("q{i}"), "a")).collect();
        assert_eq!(
            ExactCache::cache_key("next", &long),
            ExactCache::cache_key("next", &tail)
        );
    }

    #[test]
    fn test_hit_and_miss() {
        let cache = ExactCache::new(3600, 100);
        assert!(cache.get("q", &[]).is_none());
        cache.set("q", &[], "the answer", &[Document::published("src", "c1")]);
        let (answer, sources) = cache.get("q", &[]).unwrap();
        assert_eq!(answer, "the answer");
        assert_eq!(sources.len(), 1);
        // Different history, different key.
        assert!(cache.get("q", &[pair("context", "reply")]).is_none());
    }

    #[test]
    fn test_generic_error_never_cached() {
        let cache = ExactCache::new(3600, 100);
        cache.set("q", &[], GENERIC_USER_ERROR_MESSAGE, &[]);
        assert!(cache.get("q", &[]).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_draft_sources_not_stored() {
        let cache = ExactCache::new(3600, 100);
        let mut draft = Document::published("hidden", "d1");
        draft.metadata.status = Some("draft".into());
        cache.set("q", &[], "answer", &[draft, Document::published("ok", "c1")]);
        let (_, sources) = cache.get("q", &[]).unwrap();
        assert_eq!(sources.len(), 1);
        assert!(sources[0].is_published());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let cache = ExactCache::new(3600, 2);
        cache.set("a", &[], "1", &[]);
        // Backdate "a" so eviction order is deterministic.
        if let Some(mut e) = cache.entries.get_mut(&ExactCache::cache_key("a", &[])) {
            e.created_at -= 100;
        }
        cache.set("b", &[], "2", &[]);
        cache.set("c", &[], "3", &[]);
        assert!(cache.get("a", &[]).is_none(), "oldest evicted");
        assert!(cache.get("b", &[]).is_some());
        assert!(cache.get("c", &[]).is_some());
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = ExactCache::new(1, 10);
        cache.set("q", &[], "answer", &[]);
        if let Some(mut e) = cache.entries.get_mut(&ExactCache::cache_key("q", &[])) {
            e.created_at -= 5;
        }
        assert!(cache.get("q", &[]).is_none());
        assert!(cache.is_empty(), "expired entry removed on read");
    }
}
