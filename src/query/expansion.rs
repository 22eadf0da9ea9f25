//! Short-query expansion.
//!
//! One-to-three-token queries embed poorly and under-specify sparse search.
//! When enabled, the LLM expands them into a concise standalone question
//! (5-12 words), cached in a small in-process LRU keyed by the lowercased
//! original. An expansion is only accepted when it meaningfully differs
//! from the input; any failure falls back to deterministic synonym
//! expansion.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use crate::llm::LlmClient;

use super::vocabulary;

/// Queries with at most this many tokens are candidates.
const SHORT_QUERY_TOKEN_CAP: usize = 3;
/// Expansion length cap in words.
const MAX_EXPANSION_WORDS: usize = 12;
/// LRU capacity.
const EXPANSION_CACHE_SIZE: usize = 512;

static TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[a-z0-9']+").expect("valid regex"));
static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));

const EXPANSION_SYSTEM_PROMPT: &str = "You expand very short user queries for \
retrieval in a Litecoin knowledge base.\n\
Return ONLY the expanded query text (no quotes, no markdown). \
Keep it concise and specific to Litecoin.";

/// LLM-backed short-query expander with an LRU memo.
pub struct ShortQueryExpander {
    llm: Option<Arc<dyn LlmClient>>,
    cache: Mutex<LruCache<String, String>>,
}

impl ShortQueryExpander {
    pub fn new(llm: Option<Arc<dyn LlmClient>>) -> Self {
        Self {
            llm,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(EXPANSION_CACHE_SIZE).expect("non-zero capacity"),
            )),
        }
    }

    fn token_count(query: &str) -> usize {
        TOKEN_RE.find_iter(&query.to_lowercase()).count()
    }

    /// Expand `query` when it is short enough. Returns `None` when the query
    /// is not short, or no meaningful expansion could be produced (callers
    /// keep the original).
    pub async fn expand(&self, query: &str) -> Option<String> {
        let tokens = Self::token_count(query);
        if tokens == 0 || tokens > SHORT_QUERY_TOKEN_CAP {
            return None;
        }
        let cache_key = query.trim().to_lowercase();

        if let Some(cached) = self
            .cache
            .lock()
            .expect("expansion cache lock poisoned")
            .get(&cache_key)
            .cloned()
        {
            debug!("short-query expansion cache hit: '{query}' -> '{cached}'");
            return Some(cached);
        }

        let expanded = match &self.llm {
            Some(llm) => match self.expand_via_llm(llm.as_ref(), query).await {
                Some(candidate) => Some(candidate),
                None => Self::deterministic_fallback(query),
            },
            None => Self::deterministic_fallback(query),
        };

        if let Some(expanded) = &expanded {
            self.cache
                .lock()
                .expect("expansion cache lock poisoned")
                .put(cache_key, expanded.clone());
        }
        expanded
    }

    async fn expand_via_llm(&self, llm: &dyn LlmClient, query: &str) -> Option<String> {
        let user_prompt = format!(
            "Short query: {query}\n\nExpand it into a concise standalone question \
             (5-12 words). If the query is an acronym or term (e.g., MWEB, halving), \
             expand it."
        );
        let raw = match llm.complete(EXPANSION_SYSTEM_PROMPT, &user_prompt).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("short-query expansion failed: {e}");
                return None;
            }
        };
        let candidate = WHITESPACE_RE
            .replace_all(raw.trim().trim_matches(['"', '\'']), " ")
            .trim()
            .to_string();
        if candidate.is_empty() {
            return None;
        }
        // Cap the length so a rambling model cannot bloat the prompt.
        let words: Vec<&str> = candidate.split_whitespace().collect();
        let candidate = if words.len() > MAX_EXPANSION_WORDS {
            words[..MAX_EXPANSION_WORDS].join(" ")
        } else {
            candidate
        };
        // Accept only a meaningful change.
        if candidate.to_lowercase() == query.trim().to_lowercase() {
            return None;
        }
        debug!("short query expanded: '{query}' -> '{candidate}'");
        Some(candidate)
    }

    /// Synonym-based fallback; `None` when it changes nothing.
    fn deterministic_fallback(query: &str) -> Option<String> {
        let expanded = vocabulary::expand_entities(query);
        if expanded.trim().to_lowercase() == query.trim().to_lowercase() {
            None
        } else {
            Some(expanded)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{HubError, Result};
    use crate::llm::{GenerationRequest, GenerationStream, QueryRouting};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingLlm {
        reply: Option<&'static str>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl crate::llm::LlmClient for CountingLlm {
        fn model(&self) -> &str {
            "fake"
        }
        async fn complete(&self, _system: &str, _user: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply
                .map(String::from)
                .ok_or_else(|| HubError::Llm("expansion model down".into()))
        }
        async fn route_query(&self, _system: &str, _user: &str) -> Result<QueryRouting> {
            Err(HubError::Llm("not used".into()))
        }
        async fn stream_generate(&self, _request: GenerationRequest) -> Result<GenerationStream> {
            Err(HubError::Llm("not used".into()))
        }
    }

    #[tokio::test]
    async fn test_long_queries_skipped() {
        let expander = ShortQueryExpander::new(None);
        assert!(expander
            .expand("how does the litecoin halving schedule work")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_llm_expansion_accepted_and_cached() {
        let llm = Arc::new(CountingLlm {
            reply: Some("What is the MWEB privacy upgrade in Litecoin?"),
            calls: AtomicU32::new(0),
        });
        let expander = ShortQueryExpander::new(Some(llm.clone()));
        let first = expander.expand("mweb").await.unwrap();
        assert!(first.contains("MWEB"));
        // Second call is served from the LRU: same result, no extra model call.
        let second = expander.expand("MWEB ").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unchanged_expansion_rejected_then_falls_back() {
        // Model parrots the input; the deterministic fallback still expands
        // known entities.
        let llm = Arc::new(CountingLlm {
            reply: Some("mweb"),
            calls: AtomicU32::new(0),
        });
        let expander = ShortQueryExpander::new(Some(llm));
        let out = expander.expand("mweb").await.unwrap();
        assert!(out.contains("mimblewimble"), "fallback expansion used: {out}");
    }

    #[tokio::test]
    async fn test_llm_failure_falls_back_to_synonyms() {
        let llm = Arc::new(CountingLlm {
            reply: None,
            calls: AtomicU32::new(0),
        });
        let expander = ShortQueryExpander::new(Some(llm));
        let out = expander.expand("halving").await.unwrap();
        assert!(out.contains("reduction"));
    }

    #[tokio::test]
    async fn test_unknown_short_query_without_llm_stays_unexpanded() {
        let expander = ShortQueryExpander::new(None);
        assert!(expander.expand("dinner plans").await.is_none());
    }

    #[tokio::test]
    async fn test_overlong_model_reply_truncated() {
        let llm = Arc::new(CountingLlm {
            reply: Some(
                "what is the mweb privacy upgrade and how does it interact with every \
                 wallet in the entire ecosystem today",
            ),
            calls: AtomicU32::new(0),
        });
        let expander = ShortQueryExpander::new(Some(llm));
        let out = expander.expand("mweb").await.unwrap();
        assert!(out.split_whitespace().count() <= MAX_EXPANSION_WORDS);
    }

    #[test]
    fn test_token_counting() {
        assert_eq!(ShortQueryExpander::token_count("MWEB"), 1);
        assert_eq!(ShortQueryExpander::token_count("block time?"), 2);
        assert_eq!(ShortQueryExpander::token_count(""), 0);
    }
}
