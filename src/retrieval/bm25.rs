//! BM25 keyword retriever.
//!
//! In-memory Okapi BM25 (k1 = 1.2, b = 0.75) over whitespace/alphanumeric
//! tokens. Serves as the sparse leg of hybrid retrieval; rebuilt whenever
//! the ingestion side refreshes the corpus.

use std::collections::HashMap;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::Result;

use super::{Document, SparseRetriever};

const K1: f32 = 1.2;
const B: f32 = 0.75;

static TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[a-z0-9']+").expect("valid regex"));

/// Lowercased alphanumeric tokens.
fn tokenize(text: &str) -> Vec<String> {
    TOKEN_RE
        .find_iter(&text.to_lowercase())
        .map(|m| m.as_str().to_string())
        .collect()
}

struct IndexedDoc {
    document: Document,
    term_counts: HashMap<String, u32>,
    length: f32,
}

/// In-memory BM25 index.
pub struct Bm25Retriever {
    docs: Vec<IndexedDoc>,
    /// term -> number of documents containing it
    doc_freq: HashMap<String, u32>,
    avg_length: f32,
}

impl Bm25Retriever {
    pub fn new(documents: Vec<Document>) -> Self {
        let mut docs = Vec::with_capacity(documents.len());
        let mut doc_freq: HashMap<String, u32> = HashMap::new();
        let mut total_length = 0.0f32;

        for document in documents {
            let tokens = tokenize(&document.page_content);
            let mut term_counts: HashMap<String, u32> = HashMap::new();
            for token in &tokens {
                *term_counts.entry(token.clone()).or_insert(0) += 1;
            }
            for term in term_counts.keys() {
                *doc_freq.entry(term.clone()).or_insert(0) += 1;
            }
            total_length += tokens.len() as f32;
            docs.push(IndexedDoc {
                document,
                term_counts,
                length: tokens.len() as f32,
            });
        }

        let avg_length = if docs.is_empty() {
            0.0
        } else {
            total_length / docs.len() as f32
        };
        Self {
            docs,
            doc_freq,
            avg_length,
        }
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    fn score(&self, doc: &IndexedDoc, query_terms: &[String]) -> f32 {
        let n = self.docs.len() as f32;
        let mut score = 0.0f32;
        for term in query_terms {
            let Some(&tf) = doc.term_counts.get(term) else {
                continue;
            };
            let df = *self.doc_freq.get(term).unwrap_or(&0) as f32;
            // Standard BM25 idf with the +1 inside the log to keep it positive.
            let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
            let tf = tf as f32;
            let denom = tf + K1 * (1.0 - B + B * doc.length / self.avg_length.max(1e-6));
            score += idf * tf * (K1 + 1.0) / denom;
        }
        score
    }
}

#[async_trait]
impl SparseRetriever for Bm25Retriever {
    async fn search(&self, query: &str, k: usize) -> Result<Vec<Document>> {
        let query_terms = tokenize(query);
        if query_terms.is_empty() || self.docs.is_empty() {
            return Ok(Vec::new());
        }
        let mut scored: Vec<(usize, f32)> = self
            .docs
            .iter()
            .enumerate()
            .map(|(i, doc)| (i, self.score(doc, &query_terms)))
            .filter(|(_, s)| *s > 0.0)
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        Ok(scored
            .into_iter()
            .take(k)
            .map(|(i, _)| self.docs[i].document.clone())
            .collect())
    }
}
