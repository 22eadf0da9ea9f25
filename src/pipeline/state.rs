//! Shared per-query pipeline state.
//!
//! One mutable state value walks the stage graph; every stage reads the
//! fields it needs and writes the ones it owns. Early answers and fatal
//! errors short-circuit the walk (see `graph.rs`).

use crate::intent::Intent;
use crate::llm::embeddings::SparseVector;
use crate::retrieval::Document;

/// A terminal answer produced before generation (cache tiers, intents).
#[derive(Debug, Clone, PartialEq)]
pub struct EarlyAnswer {
    pub answer: String,
    pub sources: Vec<Document>,
    /// Which tier answered: `intent_greeting`, `intent_thanks`,
    /// `intent_faq_match`, `exact`, `semantic`.
    pub cache_type: &'static str,
}

/// Accounting and observability fields accumulated along the walk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineMetadata {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub cache_hit: bool,
    pub cache_type: Option<String>,
    pub rewritten_query: Option<String>,
    pub intent: Option<&'static str>,
    pub short_query_expanded: bool,
}

/// Mutable state shared by all stages.
#[derive(Debug, Clone, Default)]
pub struct QueryState {
    // Inputs
    pub raw_query: String,
    pub history: Vec<(String, String)>,

    // sanitize_normalize
    pub sanitized_query: String,
    pub normalized_query: String,
    pub truncated_history: Vec<(String, String)>,

    // route
    pub effective_query: String,
    pub effective_history: Vec<(String, String)>,
    pub is_dependent: bool,

    // prechecks
    pub intent: Option<Intent>,
    pub matched_faq: Option<String>,
    pub rewritten_query: String,

    // semantic_cache
    pub query_vector: Option<Vec<f32>>,
    pub query_sparse: Option<SparseVector>,

    // retrieve / resolve_parents
    pub context_docs: Vec<Document>,
    pub published_sources: Vec<Document>,
    pub retrieval_failed: bool,

    // spend_limit
    pub reserved_cost: f64,

    // terminals
    pub early: Option<EarlyAnswer>,
    pub failed: bool,

    pub metadata: PipelineMetadata,
}

impl QueryState {
    pub fn new(raw_query: String, history: Vec<(String, String)>) -> Self {
        Self {
            raw_query,
            history,
            ..Default::default()
        }
    }

    /// Record an early answer along with its cache-hit metadata.
    pub fn set_early(&mut self, answer: String, sources: Vec<Document>, cache_type: &'static str) {
        self.metadata.cache_hit = true;
        self.metadata.cache_type = Some(cache_type.to_string());
        self.early = Some(EarlyAnswer {
            answer,
            sources,
            cache_type,
        });
    }

    /// True when a stage produced a terminal outcome.
    pub fn is_terminal(&self) -> bool {
        self.early.is_some() || self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_early_answer_marks_terminal_and_metadata() {
        let mut state = QueryState::new("q".into(), Vec::new());
        assert!(!state.is_terminal());
        state.set_early("answer".into(), Vec::new(), "exact");
        assert!(state.is_terminal());
        assert!(state.metadata.cache_hit);
        assert_eq!(state.metadata.cache_type.as_deref(), Some("exact"));
    }

    #[test]
    fn test_failed_is_terminal() {
        let mut state = QueryState::new("q".into(), Vec::new());
        state.failed = true;
        assert!(state.is_terminal());
    }
}
