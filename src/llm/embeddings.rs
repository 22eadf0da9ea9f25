//! Embeddings port: dense vectors plus optional sparse lexical vectors.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use crate::error::{HubError, Result};

/// Sparse lexical vector: token -> weight.
pub type SparseVector = HashMap<String, f32>;

/// Batched embedding result. `sparse` is present only when the backing
/// service produces lexical vectors alongside the dense ones.
#[derive(Debug, Clone, Default)]
pub struct EmbeddingOutput {
    pub dense: Vec<Vec<f32>>,
    pub sparse: Option<Vec<SparseVector>>,
}

/// Embedding service port.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Embed a batch of texts, preserving order.
    async fn embed(&self, texts: &[String]) -> Result<EmbeddingOutput>;

    /// Expected dense dimension (0 = unknown/unchecked).
    fn dimension(&self) -> usize;
}

/// Cosine similarity clamped to `[0, 1]`.
///
/// Returns 0.0 for empty, mismatched-length, or zero-magnitude inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    (dot / (mag_a * mag_b)).clamp(0.0, 1.0)
}

/// Sparse cosine similarity over the token intersection, clamped to `[0, 1]`.
pub fn sparse_similarity(a: &SparseVector, b: &SparseVector) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    let dot: f32 = small
        .iter()
        .filter_map(|(token, wa)| large.get(token).map(|wb| wa * wb))
        .sum();
    let mag_a: f32 = a.values().map(|w| w * w).sum::<f32>().sqrt();
    let mag_b: f32 = b.values().map(|w| w * w).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    (dot / (mag_a * mag_b)).clamp(0.0, 1.0)
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    embedding: Vec<f32>,
    #[serde(default)]
    sparse: Option<SparseVector>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingApiResponse {
    data: Vec<EmbeddingItem>,
}

/// Client for an OpenAI-compatible embeddings server that optionally returns
/// sparse vectors per item.
pub struct HttpEmbeddings {
    client: Client,
    base_url: String,
    dimension: usize,
}

impl HttpEmbeddings {
    pub fn new(base_url: String, dimension: usize) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("failed to build HTTP client"),
            base_url: base_url.trim_end_matches('/').to_string(),
            dimension,
        }
    }
}

#[async_trait]
impl EmbeddingClient for HttpEmbeddings {
    async fn embed(&self, texts: &[String]) -> Result<EmbeddingOutput> {
        if texts.is_empty() {
            return Ok(EmbeddingOutput::default());
        }
        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .json(&json!({ "input": texts }))
            .send()
            .await?
            .error_for_status()
            .map_err(HubError::Http)?;

        let parsed: EmbeddingApiResponse = response.json().await?;
        if parsed.data.len() != texts.len() {
            return Err(HubError::Embedding(format!(
                "embedding count mismatch: sent {}, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }

        let has_sparse = parsed.data.iter().all(|d| d.sparse.is_some());
        let mut dense = Vec::with_capacity(parsed.data.len());
        let mut sparse = Vec::with_capacity(parsed.data.len());
        for item in parsed.data {
            if self.dimension > 0 && item.embedding.len() != self.dimension {
                return Err(HubError::Embedding(format!(
                    "dense dimension mismatch: got {}, expected {}",
                    item.embedding.len(),
                    self.dimension
                )));
            }
            dense.push(item.embedding);
            if let Some(s) = item.sparse {
                sparse.push(s);
            }
        }
        Ok(EmbeddingOutput {
            dense,
            sparse: if has_sparse { Some(sparse) } else { None },
        })
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0f32, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0f32, 0.0];
        let b = vec![0.0f32, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_guards() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_cosine_opposite_clamps_to_zero() {
        let a = vec![1.0f32, 0.0];
        let b = vec![-1.0f32, 0.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    #[test]
    fn test_sparse_similarity_overlap() {
        let a: SparseVector = [("blocktime".to_string(), 1.0)].into_iter().collect();
        let b: SparseVector = [("blocktime".to_string(), 1.0)].into_iter().collect();
        assert!((sparse_similarity(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_sparse_similarity_disjoint_is_zero() {
        let a: SparseVector = [("halving".to_string(), 1.0)].into_iter().collect();
        let b: SparseVector = [("mweb".to_string(), 1.0)].into_iter().collect();
        assert_eq!(sparse_similarity(&a, &b), 0.0);
        assert_eq!(sparse_similarity(&SparseVector::new(), &a), 0.0);
    }

    #[test]
    fn test_sparse_similarity_partial() {
        let a: SparseVector = [("a".to_string(), 1.0), ("b".to_string(), 1.0)]
            .into_iter()
            .collect();
        let b: SparseVector = [("a".to_string(), 1.0)].into_iter().collect();
        // dot = 1, |a| = sqrt(2), |b| = 1 -> 1/sqrt(2)
        assert!((sparse_similarity(&a, &b) - 1.0 / 2.0f32.sqrt()).abs() < 1e-5);
    }

    #[test]
    fn test_api_response_parses_with_and_without_sparse() {
        let with: EmbeddingApiResponse = serde_json::from_str(
            r#"{"data": [{"embedding": [0.1, 0.2], "sparse": {"ltc": 0.7}}]}"#,
        )
        .unwrap();
        assert!(with.data[0].sparse.is_some());
        let without: EmbeddingApiResponse =
            serde_json::from_str(r#"{"data": [{"embedding": [0.1, 0.2]}]}"#).unwrap();
        assert!(without.data[0].sparse.is_none());
    }
}
