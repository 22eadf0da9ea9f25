//! Grounded answer generation and settlement.
//!
//! Streams tokens from the LLM, accounts cost against the reservation made
//! at the spend-limit stage, and back-fills the exact and semantic caches.
//! Settlement always runs: on success, on mid-stream errors, and when the
//! client has already disconnected (channel sends fail silently but the
//! adjustment still lands).

use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::llm::{GenerationRequest, StreamDelta, TokenUsage};
use crate::spend::pricing;

use super::state::QueryState;
use super::{graph, Pipeline, PipelineEvent, GENERIC_USER_ERROR_MESSAGE};

pub(crate) async fn run_generation(
    pipeline: &Pipeline,
    mut state: QueryState,
    tx: mpsc::Sender<PipelineEvent>,
) {
    let Some(llm) = pipeline.llm.clone() else {
        settle_and_fail(pipeline, &state, &tx, "no LLM provider configured").await;
        return;
    };

    let context: String = state
        .context_docs
        .iter()
        .map(|d| d.page_content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    let request = GenerationRequest {
        system: super::SYSTEM_INSTRUCTION.to_string(),
        context,
        history: graph::history_messages(&state),
        user: state.sanitized_query.clone(),
        max_output_tokens: super::MAX_OUTPUT_TOKENS,
        temperature: super::GENERATION_TEMPERATURE,
    };
    let prompt_text = graph::build_prompt_text(&state);

    // Sources go out before the first chunk of the answer.
    let _ = tx
        .send(PipelineEvent::Sources(state.published_sources.clone()))
        .await;

    let mut stream = match llm.stream_generate(request).await {
        Ok(stream) => stream,
        Err(e) => {
            error!("generation request failed: {e}");
            crate::metrics::LLM_REQUESTS
                .with_label_values(&["generate", "error"])
                .inc();
            settle_and_fail(pipeline, &state, &tx, "generation request failed").await;
            return;
        }
    };

    let mut answer = String::new();
    let mut reported_usage: Option<TokenUsage> = None;
    let mut receiver_gone = false;

    loop {
        match stream.next().await {
            Some(Ok(StreamDelta::Chunk(text))) => {
                answer.push_str(&text);
                if !receiver_gone && tx.send(PipelineEvent::Chunk(text)).await.is_err() {
                    // Client disconnected: stop emitting, keep consuming so
                    // usage metadata still arrives, then settle below.
                    receiver_gone = true;
                }
            }
            Some(Ok(StreamDelta::Usage(usage))) => {
                reported_usage = Some(usage);
            }
            Some(Err(e)) => {
                error!("generation stream failed mid-answer: {e}");
                crate::metrics::LLM_REQUESTS
                    .with_label_values(&["generate", "error"])
                    .inc();
                // Settle with whatever accumulated before surfacing the error.
                let usage = resolve_usage(reported_usage, &prompt_text, &answer);
                settle(pipeline, &state, usage).await;
                let _ = tx
                    .send(PipelineEvent::Error {
                        message: GENERIC_USER_ERROR_MESSAGE.to_string(),
                    })
                    .await;
                return;
            }
            None => break,
        }
    }

    let usage = resolve_usage(reported_usage, &prompt_text, &answer);
    let actual_cost = settle(pipeline, &state, usage).await;

    crate::metrics::LLM_REQUESTS
        .with_label_values(&["generate", "success"])
        .inc();
    crate::metrics::LLM_COST_USD
        .with_label_values(&["generate"])
        .inc_by(actual_cost);

    // Best-effort cache population; a failed write never fails the answer.
    pipeline.exact_cache.set(
        &state.sanitized_query,
        &state.effective_history,
        &answer,
        &state.published_sources,
    );
    if let Some(vector) = state.query_vector.take() {
        pipeline
            .semantic_cache
            .set(vector, &answer, &state.published_sources)
            .await;
    }

    state.metadata.input_tokens = usage.input_tokens;
    state.metadata.output_tokens = usage.output_tokens;
    state.metadata.cost_usd = actual_cost;
    let _ = tx.send(PipelineEvent::Metadata(state.metadata.clone())).await;
    let _ = tx.send(PipelineEvent::Complete { from_cache: None }).await;
}

/// Prefer provider-reported token counts; otherwise estimate locally with
/// the same estimator the reservation used.
fn resolve_usage(reported: Option<TokenUsage>, prompt_text: &str, answer: &str) -> TokenUsage {
    reported.unwrap_or_else(|| TokenUsage {
        input_tokens: pricing::estimate_tokens(prompt_text),
        output_tokens: pricing::estimate_tokens(answer),
    })
}

/// Apply the actual-minus-reserved adjustment. Returns the actual cost.
async fn settle(pipeline: &Pipeline, state: &QueryState, usage: TokenUsage) -> f64 {
    let actual_cost = pricing::estimate_cost(
        usage.input_tokens,
        usage.output_tokens,
        pipeline.ledger.model(),
    );
    pipeline
        .ledger
        .record_spend(
            actual_cost,
            usage.input_tokens,
            usage.output_tokens,
            state.reserved_cost,
        )
        .await;
    actual_cost
}

/// Settle a request that produced nothing, releasing the reservation, then
/// emit the sanitized error event.
async fn settle_and_fail(
    pipeline: &Pipeline,
    state: &QueryState,
    tx: &mpsc::Sender<PipelineEvent>,
    reason: &str,
) {
    warn!("settling failed generation: {reason}");
    pipeline
        .ledger
        .record_spend(0.0, 0, 0, state.reserved_cost)
        .await;
    let _ = tx
        .send(PipelineEvent::Error {
            message: GENERIC_USER_ERROR_MESSAGE.to_string(),
        })
        .await;
}
