//! The per-query state machine.
//!
//! Stages: `sanitize_normalize -> route -> prechecks -> semantic_cache ->
//! retrieve -> resolve_parents -> spend_limit -> stream_generate`, with
//! early-exit edges after prechecks and the semantic cache, and a fatal-exit
//! edge after retrieval. Every terminal (early answer, no-match, error,
//! generated answer) is delivered through the same event stream so the
//! transport serializes exactly one envelope shape.

pub mod generate;
pub mod graph;
pub mod state;

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::cache::{ExactCache, FaqAnswerCache, SemanticCache};
use crate::config::Config;
use crate::intent::IntentClassifier;
use crate::llm::{EmbeddingClient, LlmClient};
use crate::query::{QueryRouter, ShortQueryExpander};
use crate::retrieval::{Document, HybridRetriever, ParentResolver, SparseRetriever};
use crate::spend::{LimitKind, SpendLedger};

pub use state::{EarlyAnswer, PipelineMetadata, QueryState};

/// The canonical user-facing error string. Never cached, never elaborated.
pub const GENERIC_USER_ERROR_MESSAGE: &str =
    "I encountered an error while processing your query. Please try again or rephrase your question.";

/// Friendly empty-result message, distinct from the error string.
pub const NO_KB_MATCH_RESPONSE: &str =
    "I couldn't find any relevant content in our knowledge base yet.";

/// Fixed system instruction for grounded generation: concise, no citation
/// jargon, domain-constrained.
pub const SYSTEM_INSTRUCTION: &str = "You are a neutral, factual expert on Litecoin, a \
peer-to-peer decentralized cryptocurrency. Answer exclusively from the provided \
context; do not speculate or add external knowledge. Never mention \"context\", \
\"documents\", \"sources\", or \"retrieved information\" - just answer as the expert. \
If the context does not contain sufficient information, say so clearly. Use Markdown \
headings and bullet points for structure, bold key terms, and keep answers \
comprehensive but focused. If asked for prices, state that your knowledge is static \
and recommend live sources.";

/// Output budget for a generated answer.
pub const MAX_OUTPUT_TOKENS: u32 = 2048;

/// Generation temperature.
pub const GENERATION_TEMPERATURE: f32 = 0.3;

/// When streaming a cached answer, yield to the runtime every N characters
/// so a long answer cannot monopolize the worker.
pub const CACHED_STREAM_YIELD_EVERY: usize = 10;

/// Events produced by one query. The transport maps these onto the SSE
/// envelope; `Metadata` is consumed server-side for accounting and logging.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// Published sources, sent once before the first chunk.
    Sources(Vec<Document>),
    /// A piece of answer text.
    Chunk(String),
    /// Accounting snapshot, once per query.
    Metadata(PipelineMetadata),
    /// Terminal success. `from_cache` carries the serving tier when the
    /// answer came from a cache.
    Complete { from_cache: Option<String> },
    /// Terminal failure with a sanitized message.
    Error { message: String },
}

/// Response to a query submission.
pub enum QueryResponse {
    /// Rejected by the spend pre-flight before streaming started.
    SpendLimited(LimitKind),
    /// Accepted; events follow.
    Stream(mpsc::Receiver<PipelineEvent>),
}

/// All pipeline collaborators, wired once at startup (see `context.rs`).
pub struct Pipeline {
    pub config: Config,
    pub llm: Option<Arc<dyn LlmClient>>,
    pub embeddings: Option<Arc<dyn EmbeddingClient>>,
    pub retriever: HybridRetriever,
    /// History-aware fallback when both hybrid legs fail.
    pub fallback_sparse: Option<Arc<dyn SparseRetriever>>,
    pub parents: ParentResolver,
    pub exact_cache: ExactCache,
    pub semantic_cache: SemanticCache,
    pub faq_cache: FaqAnswerCache,
    pub intent: Option<IntentClassifier>,
    pub expander: ShortQueryExpander,
    pub router: QueryRouter,
    pub ledger: Arc<SpendLedger>,
}

impl Pipeline {
    /// Submit a query. Spend-limit rejections surface before any event is
    /// produced so the transport can answer with a real 429.
    pub async fn stream_query(
        self: Arc<Self>,
        raw_query: String,
        history: Vec<(String, String)>,
    ) -> QueryResponse {
        let verdict = self.run_graph(raw_query, history).await;

        let verdict = match verdict {
            graph::Verdict::SpendLimited(kind) => return QueryResponse::SpendLimited(kind),
            other => other,
        };

        let (tx, rx) = mpsc::channel::<PipelineEvent>(64);
        let pipeline = Arc::clone(&self);
        tokio::spawn(async move {
            match verdict {
                graph::Verdict::Early(state) => {
                    pipeline.stream_early(state, tx).await;
                }
                graph::Verdict::NoMatch(state) => {
                    let _ = tx.send(PipelineEvent::Sources(Vec::new())).await;
                    let _ = tx
                        .send(PipelineEvent::Chunk(NO_KB_MATCH_RESPONSE.to_string()))
                        .await;
                    let _ = tx.send(PipelineEvent::Metadata(state.metadata)).await;
                    let _ = tx.send(PipelineEvent::Complete { from_cache: None }).await;
                }
                graph::Verdict::Failed(_state) => {
                    let _ = tx
                        .send(PipelineEvent::Error {
                            message: GENERIC_USER_ERROR_MESSAGE.to_string(),
                        })
                        .await;
                }
                graph::Verdict::Generate(state) => {
                    generate::run_generation(&pipeline, state, tx).await;
                }
                graph::Verdict::SpendLimited(_) => unreachable!("handled above"),
            }
        });
        QueryResponse::Stream(rx)
    }

    /// Stream an early (cached/static) answer with cooperative yielding.
    async fn stream_early(&self, state: QueryState, tx: mpsc::Sender<PipelineEvent>) {
        let Some(early) = state.early else {
            let _ = tx
                .send(PipelineEvent::Error {
                    message: GENERIC_USER_ERROR_MESSAGE.to_string(),
                })
                .await;
            return;
        };
        crate::metrics::CACHE_LOOKUPS
            .with_label_values(&[early.cache_type, "hit"])
            .inc();

        let published: Vec<Document> = early
            .sources
            .into_iter()
            .filter(|d| d.is_published())
            .collect();
        if tx.send(PipelineEvent::Sources(published)).await.is_err() {
            return;
        }

        // Character-granular streaming keeps cached and generated answers
        // indistinguishable on the wire; the periodic yield stops a long
        // cached answer from hogging the worker thread.
        for (i, ch) in early.answer.chars().enumerate() {
            if tx.send(PipelineEvent::Chunk(ch.to_string())).await.is_err() {
                return;
            }
            if i % CACHED_STREAM_YIELD_EVERY == 0 {
                tokio::task::yield_now().await;
            }
        }
        let _ = tx.send(PipelineEvent::Metadata(state.metadata)).await;
        let _ = tx
            .send(PipelineEvent::Complete {
                from_cache: Some(early.cache_type.to_string()),
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_facing_strings_are_distinct() {
        assert_ne!(GENERIC_USER_ERROR_MESSAGE, NO_KB_MATCH_RESPONSE);
        assert!(!GENERIC_USER_ERROR_MESSAGE.is_empty());
    }

    #[test]
    fn test_system_instruction_is_domain_constrained() {
        assert!(SYSTEM_INSTRUCTION.contains("Litecoin"));
        assert!(SYSTEM_INSTRUCTION.contains("provided"));
    }
}
