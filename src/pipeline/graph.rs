//! Stage graph: the directed walk with conditional early exits.

use tracing::{debug, warn};

use crate::intent::Intent;
use crate::llm::ChatMessage;
use crate::query::{sanitize, vocabulary};
use crate::spend::{pricing, LimitKind, SpendDecision};

use super::state::QueryState;
use super::Pipeline;

/// Terminal classification of a graph walk.
#[derive(Debug)]
pub(crate) enum Verdict {
    /// A cache tier or intent answered; stream it.
    Early(QueryState),
    /// Retrieval found nothing usable (and did not itself fail).
    NoMatch(QueryState),
    /// A fatal error occurred; stream the generic error.
    Failed(QueryState),
    /// The spend pre-flight rejected the request.
    SpendLimited(LimitKind),
    /// All checks passed; generate from this state.
    Generate(QueryState),
}

impl Pipeline {
    /// Walk the stage graph for one query.
    pub(crate) async fn run_graph(
        &self,
        raw_query: String,
        history: Vec<(String, String)>,
    ) -> Verdict {
        let mut state = QueryState::new(raw_query, history);

        self.sanitize_normalize(&mut state);
        self.route(&mut state).await;

        self.prechecks(&mut state).await;
        if state.failed {
            return Verdict::Failed(state);
        }
        if state.early.is_some() {
            return Verdict::Early(state);
        }

        self.semantic_cache_stage(&mut state).await;
        if state.failed {
            return Verdict::Failed(state);
        }
        if state.early.is_some() {
            return Verdict::Early(state);
        }

        self.retrieve_stage(&mut state).await;
        if state.failed {
            return Verdict::Failed(state);
        }
        self.resolve_parents_stage(&mut state).await;

        if state.published_sources.is_empty() {
            return if state.retrieval_failed {
                state.failed = true;
                Verdict::Failed(state)
            } else {
                Verdict::NoMatch(state)
            };
        }

        match self.spend_limit_stage(&mut state).await {
            Some(kind) => Verdict::SpendLimited(kind),
            None => Verdict::Generate(state),
        }
    }

    // ── sanitize_normalize ──────────────────────────────────────────────────

    fn sanitize_normalize(&self, state: &mut QueryState) {
        let max = self.config.max_query_length;
        if let Some(pattern) = sanitize::detect_prompt_injection(&state.raw_query) {
            warn!(pattern = %pattern.as_str(), "prompt injection pattern in query");
        }
        state.sanitized_query = sanitize::sanitize_query_input(&state.raw_query, max);

        let sanitized_history: Vec<(String, String)> = state
            .history
            .iter()
            .map(|(user_turn, assistant_turn)| {
                (
                    sanitize::sanitize_query_input(user_turn, max),
                    sanitize::sanitize_query_input(assistant_turn, max),
                )
            })
            .collect();
        let cap = self.config.max_chat_history_pairs;
        state.truncated_history = if sanitized_history.len() > cap {
            sanitized_history[sanitized_history.len() - cap..].to_vec()
        } else {
            sanitized_history
        };

        state.normalized_query = vocabulary::normalize_keywords(&state.sanitized_query);
    }

    // ── route ───────────────────────────────────────────────────────────────

    async fn route(&self, state: &mut QueryState) {
        if state.truncated_history.is_empty() {
            state.effective_query = state.normalized_query.clone();
            state.effective_history = Vec::new();
            state.is_dependent = false;
            return;
        }

        let outcome = self
            .router
            .route(&state.normalized_query, &state.truncated_history)
            .await;
        state.is_dependent = outcome.is_dependent;
        state.effective_query = outcome.effective_query;
        state.effective_history = if state.is_dependent {
            state.truncated_history.clone()
        } else {
            Vec::new()
        };

        // Router calls are model calls: account them so the ledger reflects
        // real spend, not just generation.
        if self.llm.is_some() {
            let prompt_tokens = pricing::estimate_tokens(&state.normalized_query) + 120;
            let output_tokens = 40;
            let cost = pricing::estimate_cost(prompt_tokens, output_tokens, self.ledger.model());
            self.ledger
                .record_spend(cost, prompt_tokens, output_tokens, 0.0)
                .await;
            crate::metrics::LLM_REQUESTS
                .with_label_values(&["router_classify", "success"])
                .inc();
            crate::metrics::LLM_COST_USD
                .with_label_values(&["router_classify"])
                .inc_by(cost);
        }
    }

    // ── prechecks: intent (T1), FAQ (T2), exact cache (T3), expansion ───────

    async fn prechecks(&self, state: &mut QueryState) {
        // Intent classification is skipped for history-dependent queries:
        // a "thanks" follow-up must not get cache-greeted.
        if self.config.use_intent_classification && !state.is_dependent {
            if let Some(classifier) = &self.intent {
                let (intent, matched_faq, static_response) =
                    classifier.classify(&state.sanitized_query);
                state.intent = Some(intent);
                state.metadata.intent = Some(intent.as_str());

                match intent {
                    Intent::Greeting | Intent::Thanks => {
                        if let Some(response) = static_response {
                            let tier = if intent == Intent::Greeting {
                                "intent_greeting"
                            } else {
                                "intent_thanks"
                            };
                            state.set_early(response.to_string(), Vec::new(), tier);
                            return;
                        }
                    }
                    Intent::FaqMatch => {
                        if let Some(matched) = matched_faq {
                            state.matched_faq = Some(matched.clone());
                            if let Some((answer, sources)) = self.faq_cache.get(&matched).await {
                                state.set_early(answer, sources, "intent_faq_match");
                                return;
                            }
                            crate::metrics::CACHE_LOOKUPS
                                .with_label_values(&["intent_faq_match", "miss"])
                                .inc();
                        }
                    }
                    Intent::Search => {}
                }
            }
        }

        // Exact cache: original query plus effective history.
        if let Some((answer, sources)) = self
            .exact_cache
            .get(&state.sanitized_query, &state.effective_history)
        {
            state.set_early(answer, sources, "exact");
            return;
        }
        crate::metrics::CACHE_LOOKUPS
            .with_label_values(&["exact", "miss"])
            .inc();

        // Short-query expansion happens after the cheap early-outs so a
        // greeting never pays for a model call.
        let mut expanded = state.effective_query.clone();
        if self.config.use_short_query_expansion && !state.is_dependent {
            if let Some(expansion) = self.expander.expand(&state.effective_query).await {
                debug!("short query expanded: '{}' -> '{expansion}'", expanded);
                expanded = expansion;
                state.metadata.short_query_expanded = true;
            }
        }

        // Post-rewrite normalization + entity expansion for retrieval recall.
        let rewritten = vocabulary::expand_entities(&vocabulary::normalize_keywords(&expanded));
        state.metadata.rewritten_query = Some(rewritten.clone());
        state.rewritten_query = rewritten;
    }

    // ── semantic_cache (T4) ─────────────────────────────────────────────────

    async fn semantic_cache_stage(&self, state: &mut QueryState) {
        if state.is_terminal() {
            return;
        }

        // Embedding generation also serves retrieval below.
        if self.config.use_infinity_embeddings || self.config.use_redis_cache {
            if let Some(embedder) = &self.embeddings {
                match embedder.embed(&[state.rewritten_query.clone()]).await {
                    Ok(output) => {
                        if let Some(vector) = output.dense.into_iter().next() {
                            let expected = embedder.dimension();
                            if expected > 0 && vector.len() != expected {
                                warn!(
                                    got = vector.len(),
                                    expected, "query vector dimension mismatch"
                                );
                            }
                            state.query_vector = Some(vector);
                        }
                        if let Some(mut sparse) = output.sparse {
                            state.query_sparse = sparse.pop();
                        }
                    }
                    Err(e) => warn!("query embedding failed: {e}"),
                }
            }
        }

        let Some(vector) = &state.query_vector else {
            return;
        };
        if let Some((answer, sources)) = self.semantic_cache.get(vector).await {
            state.set_early(answer, sources, "semantic");
            return;
        }
        crate::metrics::CACHE_LOOKUPS
            .with_label_values(&["semantic", "miss"])
            .inc();
    }

    // ── retrieve ────────────────────────────────────────────────────────────

    async fn retrieve_stage(&self, state: &mut QueryState) {
        if state.is_terminal() {
            return;
        }

        let outcome = self
            .retriever
            .retrieve(
                &state.rewritten_query,
                state.query_vector.as_deref(),
                state.query_sparse.as_ref(),
            )
            .await;

        let docs = if outcome.failed {
            // History-aware fallback: the effective query already folds in
            // the router's rewrite of any history references.
            state.retrieval_failed = true;
            match &self.fallback_sparse {
                Some(retriever) => match retriever
                    .search(&state.effective_query, self.config.retriever_k)
                    .await
                {
                    Ok(docs) => {
                        if !docs.is_empty() {
                            // The fallback produced usable context.
                            state.retrieval_failed = false;
                        }
                        docs
                    }
                    Err(e) => {
                        warn!("fallback retrieval failed: {e}");
                        Vec::new()
                    }
                },
                None => Vec::new(),
            }
        } else {
            outcome.docs
        };

        state.published_sources = docs.iter().filter(|d| d.is_published()).cloned().collect();
        state.context_docs = docs;
    }

    // ── resolve_parents ─────────────────────────────────────────────────────

    async fn resolve_parents_stage(&self, state: &mut QueryState) {
        if !self.config.use_faq_indexing || state.context_docs.is_empty() {
            return;
        }
        let resolved = self.parents.resolve(std::mem::take(&mut state.context_docs)).await;
        state.published_sources = resolved.iter().filter(|d| d.is_published()).cloned().collect();
        state.context_docs = resolved;
    }

    // ── spend_limit ─────────────────────────────────────────────────────────

    async fn spend_limit_stage(&self, state: &mut QueryState) -> Option<LimitKind> {
        if state.context_docs.is_empty() {
            return None;
        }
        let estimated_cost = {
            let prompt = build_prompt_text(state);
            let input_tokens = pricing::estimate_tokens(&prompt);
            pricing::estimate_cost(input_tokens, super::MAX_OUTPUT_TOKENS as u64, self.ledger.model())
        };
        match self.ledger.check_spend_limit(estimated_cost).await {
            SpendDecision::Allowed { reserved } => {
                state.reserved_cost = reserved;
                None
            }
            SpendDecision::Limited { kind } => Some(kind),
        }
    }
}

/// Reconstruct the full prompt text for token estimation.
pub(crate) fn build_prompt_text(state: &QueryState) -> String {
    let context: String = state
        .context_docs
        .iter()
        .map(|d| d.page_content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    let mut history_text = String::new();
    for (user_turn, assistant_turn) in &state.effective_history {
        history_text.push_str(&format!("User: {user_turn}\n"));
        if !assistant_turn.is_empty() {
            history_text.push_str(&format!("Assistant: {assistant_turn}\n"));
        }
    }
    format!(
        "{}\n\nContext:\n{context}\n\n{history_text}User: {}",
        super::SYSTEM_INSTRUCTION,
        state.sanitized_query
    )
}

/// History messages for the generation call.
pub(crate) fn history_messages(state: &QueryState) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(state.effective_history.len() * 2);
    for (user_turn, assistant_turn) in &state.effective_history {
        messages.push(ChatMessage::user(user_turn.clone()));
        if !assistant_turn.is_empty() {
            messages.push(ChatMessage::assistant(assistant_turn.clone()));
        }
    }
    messages
}

// ============================================================================
// Tests
// ============================================================================
