//! Query routing: does this query depend on conversation history?
//!
//! Hybrid design: a deterministic fast path catches obvious pronoun/prefix
//! dependencies to save a model call; ambiguous cases go to the LLM with a
//! structured-output schema. A deterministic anchoring pass rewrites a
//! leading ambiguous pronoun to the most recently mentioned entity before
//! either path runs. When the LLM says the query is dependent, its
//! standalone rewrite wins; otherwise the anchored query is used as-is.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use crate::llm::LlmClient;

use super::vocabulary;

/// Pronouns that guarantee history dependency in a leading position.
/// Deliberately excludes ambiguous tokens like "IT" (the industry).
const STRONG_AMBIGUOUS_TOKENS: &[&str] = &[
    "it", "this", "that", "these", "those", "they", "them", "their", "its", "he", "she", "him",
    "her", "former", "latter", "previous", "following",
];

/// Prefixes that guarantee a dependency on history.
const STRONG_PREFIXES: &[&str] = &[
    "and ",
    "also ",
    "but ",
    "so ",
    "what about",
    "how about",
    "why is that",
    "can you elaborate",
    "continue",
    "go on",
    "explain that",
    "expand on that",
];

static TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[a-z0-9']+").expect("valid regex"));

static WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z0-9'\-]+").expect("valid regex"));

const ROUTER_SYSTEM_PROMPT: &str = "You are a query router for a knowledge-base \
assistant about Litecoin.\n\
Analyze the \"Latest Query\". Does it refer to the \"Chat History\" (e.g. via \
pronouns like 'it', 'that', or implicit context)?\n\n\
1. If YES (Dependent): Rewrite the query to be fully standalone, incorporating \
the necessary context from history.\n\
2. If NO (Standalone): Return the latest query exactly as is. Do not add \
context if it's a new topic.\n\n\
Be conservative: only mark as dependent if the query is clearly referring to \
prior conversation.";

/// Routing result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteOutcome {
    /// Query to use for retrieval and caching downstream.
    pub effective_query: String,
    /// Whether the query needs the history to be understood.
    pub is_dependent: bool,
}

/// History-dependency router.
pub struct QueryRouter {
    llm: Option<Arc<dyn LlmClient>>,
}

impl QueryRouter {
    pub fn new(llm: Option<Arc<dyn LlmClient>>) -> Self {
        Self { llm }
    }

    /// Deterministic check: strong pronoun token or strong prefix.
    pub fn has_obvious_dependency(query: &str) -> bool {
        let lower = query.to_lowercase();
        if STRONG_PREFIXES.iter().any(|p| lower.starts_with(p)) {
            return true;
        }
        TOKEN_RE
            .find_iter(&lower)
            .any(|t| STRONG_AMBIGUOUS_TOKENS.contains(&t.as_str()))
    }

    /// The most recently mentioned entity in the history, scanning newest
    /// turn first: a known vocabulary term wins, else the last capitalized
    /// non-initial word.
    pub fn last_mentioned_entity(history: &[(String, String)]) -> Option<String> {
        for (user_turn, assistant_turn) in history.iter().rev() {
            for text in [assistant_turn.as_str(), user_turn.as_str()] {
                let words: Vec<&str> = WORD_RE.find_iter(text).map(|m| m.as_str()).collect();
                if let Some(entity) = words
                    .iter()
                    .rev()
                    .find(|w| vocabulary::is_known_entity(w))
                {
                    return Some(entity.to_lowercase());
                }
                // Fall back to the last capitalized word that is not the
                // sentence opener (proper-noun heuristic).
                if let Some(entity) = words
                    .iter()
                    .enumerate()
                    .rev()
                    .find(|(i, w)| {
                        *i > 0 && w.chars().next().map(char::is_uppercase).unwrap_or(false)
                    })
                    .map(|(_, w)| w.to_string())
                {
                    return Some(entity);
                }
            }
        }
        None
    }

    /// Replace a leading ambiguous pronoun with the last mentioned entity.
    ///
    /// Anti-topic-drift: "how does it work?" after a turn about MWEB becomes
    /// "how does mweb work?" before retrieval ever sees it.
    pub fn anchor_pronouns(query: &str, history: &[(String, String)]) -> String {
        let Some(entity) = Self::last_mentioned_entity(history) else {
            return query.to_string();
        };
        let mut words = query.split_whitespace();
        let Some(first) = words.next() else {
            return query.to_string();
        };
        let first_clean: String = first
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '\'')
            .collect::<String>()
            .to_lowercase();
        if STRONG_AMBIGUOUS_TOKENS.contains(&first_clean.as_str()) {
            let rest: Vec<&str> = words.collect();
            if rest.is_empty() {
                return entity;
            }
            return format!("{entity} {}", rest.join(" "));
        }
        query.to_string()
    }

    /// Route a (normalized) query against its truncated history.
    pub async fn route(&self, query: &str, history: &[(String, String)]) -> RouteOutcome {
        if history.is_empty() {
            return RouteOutcome {
                effective_query: query.to_string(),
                is_dependent: false,
            };
        }

        // Deterministic anchoring, then entity expansion for recall.
        let anchored = Self::anchor_pronouns(query, history);
        let router_input = vocabulary::expand_entities(&anchored);

        let obvious = Self::has_obvious_dependency(&router_input);
        match &self.llm {
            Some(llm) => {
                let user_prompt = Self::build_router_prompt(&router_input, history);
                match llm.route_query(ROUTER_SYSTEM_PROMPT, &user_prompt).await {
                    Ok(routing) if routing.is_dependent => {
                        debug!(
                            "router: '{router_input}' -> '{}' (dependent)",
                            routing.standalone_query
                        );
                        RouteOutcome {
                            effective_query: routing.standalone_query,
                            is_dependent: true,
                        }
                    }
                    Ok(_) => RouteOutcome {
                        effective_query: router_input,
                        // The fast path may still know better than a
                        // conservative model verdict.
                        is_dependent: obvious,
                    },
                    Err(e) => {
                        warn!("router LLM call failed, using deterministic result: {e}");
                        RouteOutcome {
                            effective_query: router_input,
                            is_dependent: obvious,
                        }
                    }
                }
            }
            None => RouteOutcome {
                effective_query: router_input,
                is_dependent: obvious,
            },
        }
    }

    /// User prompt for the structured router: the last two history messages
    /// plus the query.
    fn build_router_prompt(query: &str, history: &[(String, String)]) -> String {
        let mut lines: Vec<String> = Vec::new();
        for (user_turn, assistant_turn) in history {
            lines.push(format!("Human: {user_turn}"));
            if !assistant_turn.is_empty() {
                lines.push(format!("AI: {assistant_turn}"));
            }
        }
        let tail = if lines.len() > 2 {
            &lines[lines.len() - 2..]
        } else {
            &lines[..]
        };
        format!("Chat History:\n{}\n\nLatest Query: {query}", tail.join("\n"))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{HubError, Result};
    use crate::llm::{GenerationRequest, GenerationStream, QueryRouting};
    use async_trait::async_trait;

    fn pair(user: &str, assistant: &str) -> (String, String) {
        (user.to_string(), assistant.to_string())
    }

    /// Router LLM fake with a fixed verdict.
    struct FakeRouterLlm {
        routing: Option<QueryRouting>,
    }

    #[async_trait]
    impl crate::llm::LlmClient for FakeRouterLlm {
        fn model(&self) -> &str {
            "fake"
        }
        async fn complete(&self, _system: &str, _user: &str) -> Result<String> {
            Ok("ok".into())
        }
        async fn route_query(&self, _system: &str, _user: &str) -> Result<QueryRouting> {
            self.routing
                .clone()
                .ok_or_else(|| HubError::Llm("router down".into()))
        }
        async fn stream_generate(&self, _request: GenerationRequest) -> Result<GenerationStream> {
            Err(HubError::Llm("not used".into()))
        }
    }

    // -- Fast path ----------------------------------------------------------

    #[test]
    fn test_strong_pronoun_detected() {
        assert!(QueryRouter::has_obvious_dependency("how does it work"));
        assert!(QueryRouter::has_obvious_dependency("what are those"));
        assert!(!QueryRouter::has_obvious_dependency("how does mweb work"));
    }

    #[test]
    fn test_strong_prefix_detected() {
        assert!(QueryRouter::has_obvious_dependency("and the fees?"));
        assert!(QueryRouter::has_obvious_dependency("what about mining"));
        assert!(!QueryRouter::has_obvious_dependency("android wallets"));
    }

    // -- Anchoring ----------------------------------------------------------

    #[test]
    fn test_anchor_replaces_leading_pronoun_with_entity() {
        let history = vec![pair("tell me about mweb", "MWEB is a privacy upgrade...")];
        assert_eq!(
            QueryRouter::anchor_pronouns("it sounds complicated", &history),
            "mweb sounds complicated"
        );
    }

    #[test]
    fn test_anchor_prefers_newest_turn() {
        let history = vec![
            pair("what is scrypt", "Scrypt is..."),
            pair("what is the halving", "The halving is..."),
        ];
        assert_eq!(
            QueryRouter::anchor_pronouns("this happens when?", &history),
            "halving happens when?"
        );
    }

    #[test]
    fn test_anchor_leaves_non_pronoun_queries_alone() {
        let history = vec![pair("about mweb", "MWEB...")];
        assert_eq!(
            QueryRouter::anchor_pronouns("what is the supply cap", &history),
            "what is the supply cap"
        );
    }

    #[test]
    fn test_anchor_without_entity_is_identity() {
        let history = vec![pair("ok", "sure")];
        assert_eq!(
            QueryRouter::anchor_pronouns("it is fine", &history),
            "it is fine"
        );
    }

    #[test]
    fn test_last_entity_capitalized_fallback() {
        let history = vec![pair("who built the wallet app", "It was shipped by Moonbeam Labs")];
        // No vocabulary term in either turn: the last capitalized
        // non-initial word wins.
        let entity = QueryRouter::last_mentioned_entity(&history).unwrap();
        assert_eq!(entity, "Labs");
    }

    // -- Routing ------------------------------------------------------------

    #[tokio::test]
    async fn test_no_history_is_standalone() {
        let router = QueryRouter::new(None);
        let outcome = router.route("what is mweb", &[]).await;
        assert!(!outcome.is_dependent);
        assert_eq!(outcome.effective_query, "what is mweb");
    }

    #[tokio::test]
    async fn test_llm_rewrite_wins_when_dependent() {
        let router = QueryRouter::new(Some(Arc::new(FakeRouterLlm {
            routing: Some(QueryRouting {
                is_dependent: true,
                standalone_query: "how does mweb privacy work".into(),
            }),
        })));
        let history = vec![pair("tell me about mweb", "MWEB is...")];
        let outcome = router.route("how does it work", &history).await;
        assert!(outcome.is_dependent);
        assert_eq!(outcome.effective_query, "how does mweb privacy work");
    }

    #[tokio::test]
    async fn test_standalone_verdict_keeps_anchored_query() {
        let router = QueryRouter::new(Some(Arc::new(FakeRouterLlm {
            routing: Some(QueryRouting {
                is_dependent: false,
                standalone_query: "ignored".into(),
            }),
        })));
        let history = vec![pair("what is scrypt", "Scrypt is...")];
        let outcome = router.route("what is the supply cap", &history).await;
        assert!(!outcome.is_dependent);
        assert!(outcome.effective_query.starts_with("what is the supply cap"));
    }

    #[tokio::test]
    async fn test_router_failure_falls_back_to_fast_path() {
        let router = QueryRouter::new(Some(Arc::new(FakeRouterLlm { routing: None })));
        let history = vec![pair("about mweb", "MWEB...")];
        let outcome = router.route("what about fees", &history).await;
        // Fast path marks the prefix as dependent even though the LLM died.
        assert!(outcome.is_dependent);
    }

    #[test]
    fn test_router_prompt_uses_last_two_messages() {
        let history = vec![pair("q1", "a1"), pair("q2", "a2")];
        let prompt = QueryRouter::build_router_prompt("latest", &history);
        assert!(prompt.contains("Human: q2"));
        assert!(prompt.contains("AI: a2"));
        assert!(!prompt.contains("q1"), "older turns are dropped");
        assert!(prompt.ends_with("Latest Query: latest"));
    }
}
