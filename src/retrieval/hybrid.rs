//! Hybrid retrieval: dense vector and sparse keyword search fused.
//!
//! The two legs run in parallel. Dense hits below the similarity floor are
//! dropped (unless that would leave fewer than K). The merge is
//! deduplicated on a content prefix with sparse hits first (exact-term
//! matches outrank semantic near-misses), and the top of the merged list
//! can be re-ranked by sparse similarity to the query.

use std::sync::Arc;

use tracing::warn;

use crate::llm::embeddings::{sparse_similarity, EmbeddingClient, SparseVector};

use super::{Document, SparseRetriever, VectorIndex};

/// Content-prefix length used to deduplicate across the two legs.
const DEDUP_PREFIX_CHARS: usize = 200;

/// Document text cap when embedding candidates for re-ranking.
const RERANK_DOC_CHARS: usize = 8000;

/// Result of a hybrid retrieval round.
#[derive(Debug, Clone, Default)]
pub struct RetrievalOutcome {
    pub docs: Vec<Document>,
    /// True when the searches themselves failed (as opposed to finding
    /// nothing); drives the generic-error vs no-match distinction.
    pub failed: bool,
}

/// Fused dense + sparse retriever.
pub struct HybridRetriever {
    vector: Option<Arc<dyn VectorIndex>>,
    sparse: Option<Arc<dyn SparseRetriever>>,
    embeddings: Option<Arc<dyn EmbeddingClient>>,
    k: usize,
    min_similarity: f32,
    rerank_limit: usize,
}

impl HybridRetriever {
    pub fn new(
        vector: Option<Arc<dyn VectorIndex>>,
        sparse: Option<Arc<dyn SparseRetriever>>,
        embeddings: Option<Arc<dyn EmbeddingClient>>,
        k: usize,
        min_similarity: f32,
        rerank_limit: usize,
    ) -> Self {
        Self {
            vector,
            sparse,
            embeddings,
            k: k.max(1),
            min_similarity,
            rerank_limit,
        }
    }

    /// Run both legs and fuse the results.
    pub async fn retrieve(
        &self,
        query: &str,
        query_vector: Option<&[f32]>,
        query_sparse: Option<&SparseVector>,
    ) -> RetrievalOutcome {
        let fetch = self.k * 2;

        let dense_fut = async {
            match (&self.vector, query_vector) {
                (Some(index), Some(vector)) => match index.search_by_vector(vector, fetch).await {
                    Ok(hits) => Some(hits),
                    Err(e) => {
                        warn!("dense search failed: {e}");
                        None
                    }
                },
                _ => Some(Vec::new()),
            }
        };
        let sparse_fut = async {
            match &self.sparse {
                Some(retriever) => match retriever.search(query, fetch).await {
                    Ok(hits) => Some(hits),
                    Err(e) => {
                        warn!("sparse search failed: {e}");
                        None
                    }
                },
                None => Some(Vec::new()),
            }
        };
        let (dense_result, sparse_result) = tokio::join!(dense_fut, sparse_fut);

        // Both legs errored out: signal failure so the caller can run its
        // history-aware fallback and, if that is also empty, the generic
        // error rather than the no-match message.
        if dense_result.is_none() && sparse_result.is_none() {
            return RetrievalOutcome {
                docs: Vec::new(),
                failed: true,
            };
        }

        let dense_hits = dense_result.unwrap_or_default();
        let sparse_hits = sparse_result.unwrap_or_default();

        // Similarity floor; fall back to the unfiltered top K when the floor
        // would leave too few.
        let filtered: Vec<Document> = dense_hits
            .iter()
            .filter(|(_, score)| *score >= self.min_similarity)
            .map(|(doc, _)| doc.clone())
            .collect();
        let dense_docs: Vec<Document> = if filtered.len() < self.k {
            dense_hits.iter().take(self.k).map(|(d, _)| d.clone()).collect()
        } else {
            filtered
        };

        // Merge, sparse first, deduplicating on a content prefix.
        let mut seen: Vec<String> = Vec::new();
        let mut candidates: Vec<Document> = Vec::new();
        for doc in sparse_hits.into_iter().chain(dense_docs) {
            let key: String = doc.page_content.chars().take(DEDUP_PREFIX_CHARS).collect();
            if !seen.contains(&key) {
                seen.push(key);
                candidates.push(doc);
            }
        }

        let docs = match (query_sparse, &self.embeddings) {
            (Some(qs), Some(embedder)) if !candidates.is_empty() => {
                self.sparse_rerank(candidates, qs, embedder.as_ref()).await
            }
            _ => candidates,
        };

        RetrievalOutcome {
            docs: docs.into_iter().take(self.k).collect(),
            failed: false,
        }
    }

    /// Re-rank the top candidates by sparse similarity to the query.
    ///
    /// Only the first `rerank_limit` candidates are embedded; the rest keep
    /// their merge order behind the re-ranked prefix. Failures keep the
    /// original order.
    async fn sparse_rerank(
        &self,
        candidates: Vec<Document>,
        query_sparse: &SparseVector,
        embedder: &dyn EmbeddingClient,
    ) -> Vec<Document> {
        let head_len = self.rerank_limit.min(candidates.len());
        let (head, tail) = candidates.split_at(head_len);

        let texts: Vec<String> = head
            .iter()
            .map(|d| d.page_content.chars().take(RERANK_DOC_CHARS).collect())
            .collect();
        let output = match embedder.embed(&texts).await {
            Ok(o) => o,
            Err(e) => {
                warn!("sparse re-ranking failed, keeping merge order: {e}");
                return candidates;
            }
        };
        let Some(sparse_list) = output.sparse else {
            return candidates;
        };
        if sparse_list.len() != head.len() {
            warn!("sparse re-ranking returned wrong count, keeping merge order");
            return candidates;
        }

        let mut scored: Vec<(f32, usize)> = sparse_list
            .iter()
            .enumerate()
            .map(|(i, doc_sparse)| (sparse_similarity(query_sparse, doc_sparse), i))
            .collect();
        // Stable on the original index so ties keep merge order.
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.cmp(&b.1))
        });

        let mut reranked: Vec<Document> =
            scored.into_iter().map(|(_, i)| head[i].clone()).collect();
        reranked.extend(tail.iter().cloned());
        reranked
    }
}

// ============================================================================
// Tests
// ============================================================================
