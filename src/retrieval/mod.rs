//! Retrieval: document model, storage ports, hybrid search and the parent
//! document pattern.
//!
//! The persistence engines themselves are external collaborators; only the
//! ports here ([`DocumentStore`], [`VectorIndex`], [`SparseRetriever`]) are
//! part of this crate's contract. In-memory implementations back tests and
//! small deployments.

pub mod bm25;
pub mod hybrid;
pub mod parents;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::llm::embeddings::cosine_similarity;

pub use bm25::Bm25Retriever;
pub use hybrid::{HybridRetriever, RetrievalOutcome};
pub use parents::ParentResolver;

/// Publication state of a document's source entry.
pub const STATUS_PUBLISHED: &str = "published";

/// A retrievable knowledge-base chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub page_content: String,
    #[serde(default)]
    pub metadata: DocMetadata,
}

/// Chunk metadata. Unknown fields round-trip through `extra` so cache
/// entries written by other components survive intact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocMetadata {
    /// `published` or `draft`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<String>,
    /// Synthetic FAQ question indexed for semantic matching only.
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_synthetic: bool,
    /// Owning chunk for synthetic questions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_chunk_id: Option<String>,
    /// CMS payload that owns this chunk (cascade deletes).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl Document {
    /// Plain published chunk.
    pub fn published(content: impl Into<String>, chunk_id: impl Into<String>) -> Self {
        Self {
            page_content: content.into(),
            metadata: DocMetadata {
                status: Some(STATUS_PUBLISHED.to_string()),
                chunk_id: Some(chunk_id.into()),
                ..Default::default()
            },
        }
    }

    pub fn is_published(&self) -> bool {
        self.metadata.status.as_deref() == Some(STATUS_PUBLISHED)
    }
}

/// Dense vector index over the knowledge base. Read-only at query time;
/// rebuilt by the ingestion collaborator.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Top-`k` documents by similarity to `vector`, best first.
    async fn search_by_vector(&self, vector: &[f32], k: usize) -> Result<Vec<(Document, f32)>>;
}

/// Sparse keyword retriever. `k` is per call (no retriever state to mutate
/// and restore around a search).
#[async_trait]
pub trait SparseRetriever: Send + Sync {
    async fn search(&self, query: &str, k: usize) -> Result<Vec<Document>>;
}

/// Document store port: the slices of the corpus the query path needs.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// All non-synthetic chunks that carry a `chunk_id` (parent-map source).
    async fn load_parent_chunks(&self) -> Result<Vec<Document>>;

    /// Curated FAQ questions for intent matching.
    async fn list_faq_questions(&self) -> Result<Vec<String>>;
}

// ---------------------------------------------------------------------------
// In-memory implementations
// ---------------------------------------------------------------------------

/// Brute-force cosine index. Adequate for small corpora and tests.
#[derive(Default)]
pub struct InMemoryVectorIndex {
    entries: Vec<(Vec<f32>, Document)>,
}

impl InMemoryVectorIndex {
    pub fn new(entries: Vec<(Vec<f32>, Document)>) -> Self {
        Self { entries }
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn search_by_vector(&self, vector: &[f32], k: usize) -> Result<Vec<(Document, f32)>> {
        let mut scored: Vec<(Document, f32)> = self
            .entries
            .iter()
            .map(|(v, doc)| (doc.clone(), cosine_similarity(vector, v)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }
}

/// Static document store.
pub struct InMemoryDocumentStore {
    documents: Vec<Document>,
    faq_questions: Vec<String>,
}

impl InMemoryDocumentStore {
    pub fn new(documents: Vec<Document>, faq_questions: Vec<String>) -> Self {
        Self {
            documents,
            faq_questions,
        }
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn load_parent_chunks(&self) -> Result<Vec<Document>> {
        Ok(self
            .documents
            .iter()
            .filter(|d| !d.metadata.is_synthetic && d.metadata.chunk_id.is_some())
            .cloned()
            .collect())
    }

    async fn list_faq_questions(&self) -> Result<Vec<String>> {
        Ok(self.faq_questions.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_metadata_roundtrips_unknown_fields() {
        let json = r#"{
            "page_content": "MWEB is an opt-in privacy upgrade.",
            "metadata": {
                "status": "published",
                "chunk_id": "c1",
                "source_url": "https://example.org/mweb"
            }
        }"#;
        let doc: Document = serde_json::from_str(json).unwrap();
        assert!(doc.is_published());
        assert_eq!(
            doc.metadata.extra.get("source_url").and_then(|v| v.as_str()),
            Some("https://example.org/mweb")
        );
        let back = serde_json::to_value(&doc).unwrap();
        assert_eq!(back["metadata"]["source_url"], "https://example.org/mweb");
    }

    #[test]
    fn test_draft_is_not_published() {
        let mut doc = Document::published("x", "c1");
        doc.metadata.status = Some("draft".into());
        assert!(!doc.is_published());
        doc.metadata.status = None;
        assert!(!doc.is_published());
    }

    #[tokio::test]
    async fn test_in_memory_vector_index_orders_by_similarity() {
        let index = InMemoryVectorIndex::new(vec![
            (vec![1.0, 0.0], Document::published("a", "a")),
            (vec![0.0, 1.0], Document::published("b", "b")),
            (vec![0.7, 0.7], Document::published("c", "c")),
        ]);
        let hits = index.search_by_vector(&[1.0, 0.0], 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0.page_content, "a");
        assert!(hits[0].1 > hits[1].1);
    }

    #[tokio::test]
    async fn test_store_parent_chunks_excludes_synthetics() {
        let mut synthetic = Document::published("What is MWEB?", "q1");
        synthetic.metadata.is_synthetic = true;
        synthetic.metadata.parent_chunk_id = Some("p1".into());
        let store = InMemoryDocumentStore::new(
            vec![synthetic, Document::published("parent text", "p1")],
            vec!["What is MWEB?".into()],
        );
        let parents = store.load_parent_chunks().await.unwrap();
        assert_eq!(parents.len(), 1);
        assert_eq!(parents[0].metadata.chunk_id.as_deref(), Some("p1"));
        assert_eq!(store.list_faq_questions().await.unwrap().len(), 1);
    }
}
