//! Parent document pattern resolution.
//!
//! Synthetic question documents are indexed for semantic matching; at serve
//! time each hit is swapped for the real content chunk its
//! `parent_chunk_id` points to. The parent map is loaded lazily from the
//! document store; stale reads after corpus updates are tolerated (missing
//! parents keep the synthetic hit as fallback).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::Result;

use super::{Document, DocumentStore};

/// Resolves synthetic question hits to their parent chunks.
pub struct ParentResolver {
    store: Arc<dyn DocumentStore>,
    map: RwLock<Option<Arc<HashMap<String, Document>>>>,
}

impl ParentResolver {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            map: RwLock::new(None),
        }
    }

    /// Drop the cached parent map; the next resolve reloads it.
    pub async fn invalidate(&self) {
        *self.map.write().await = None;
    }

    async fn parent_map(&self) -> Result<Arc<HashMap<String, Document>>> {
        if let Some(map) = self.map.read().await.clone() {
            return Ok(map);
        }
        let chunks = self.store.load_parent_chunks().await?;
        let mut map = HashMap::with_capacity(chunks.len());
        for chunk in chunks {
            if let Some(id) = chunk.metadata.chunk_id.clone() {
                map.insert(id, chunk);
            }
        }
        debug!(parents = map.len(), "loaded parent-chunk map");
        let map = Arc::new(map);
        *self.map.write().await = Some(map.clone());
        Ok(map)
    }

    /// Resolve a retrieved batch. Store failures keep the originals.
    pub async fn resolve(&self, docs: Vec<Document>) -> Vec<Document> {
        if docs.iter().all(|d| !d.metadata.is_synthetic) {
            return docs;
        }
        match self.parent_map().await {
            Ok(map) => resolve_with_map(docs, &map),
            Err(e) => {
                warn!("parent resolution failed, using original docs: {e}");
                docs
            }
        }
    }
}

/// Swap synthetic hits for their parents and deduplicate by `chunk_id`.
///
/// First occurrence wins; regular documents without a `chunk_id` are always
/// kept. A synthetic hit whose parent is missing from the map is kept as-is
/// (better a question than a lost result).
pub fn resolve_with_map(
    docs: Vec<Document>,
    parent_map: &HashMap<String, Document>,
) -> Vec<Document> {
    let mut resolved: Vec<Document> = Vec::with_capacity(docs.len());
    let mut seen: HashSet<String> = HashSet::new();

    for doc in docs {
        if doc.metadata.is_synthetic {
            match doc.metadata.parent_chunk_id.clone() {
                Some(parent_id) => {
                    if seen.contains(&parent_id) {
                        continue;
                    }
                    match parent_map.get(&parent_id) {
                        Some(parent) => {
                            seen.insert(parent_id);
                            resolved.push(parent.clone());
                        }
                        None => {
                            warn!(parent_id, "parent chunk not found, keeping synthetic hit");
                            resolved.push(doc);
                        }
                    }
                }
                // Synthetic without a parent pointer: nothing to swap.
                None => resolved.push(doc),
            }
        } else {
            match doc.metadata.chunk_id.clone() {
                Some(chunk_id) => {
                    if seen.insert(chunk_id) {
                        resolved.push(doc);
                    }
                }
                None => resolved.push(doc),
            }
        }
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::InMemoryDocumentStore;

    fn synthetic(question: &str, parent_id: &str) -> Document {
        let mut doc = Document::published(question, format!("q-{parent_id}"));
        doc.metadata.is_synthetic = true;
        doc.metadata.parent_chunk_id = Some(parent_id.to_string());
        doc
    }

    fn map(parents: &[(&str, &str)]) -> HashMap<String, Document> {
        parents
            .iter()
            .map(|(id, content)| ((*id).to_string(), Document::published(*content, *id)))
            .collect()
    }

    #[test]
    fn test_swap_and_dedupe_scenario() {
        // [Q_syn(P1), Q_syn(P1), Doc(P2)] -> [P1, P2], first occurrence wins.
        let docs = vec![
            synthetic("What is the block time?", "P1"),
            synthetic("How fast are blocks?", "P1"),
            Document::published("another chunk", "P2"),
        ];
        let resolved = resolve_with_map(docs, &map(&[("P1", "block time is 2.5 min")]));
        let ids: Vec<&str> = resolved
            .iter()
            .map(|d| d.metadata.chunk_id.as_deref().unwrap())
            .collect();
        assert_eq!(ids, vec!["P1", "P2"]);
        assert_eq!(resolved[0].page_content, "block time is 2.5 min");
    }

    #[test]
    fn test_output_has_no_duplicate_chunk_ids() {
        // Injectivity: no two output documents share a chunk_id.
        let docs = vec![
            Document::published("parent text", "P1"),
            synthetic("question about p1", "P1"),
            Document::published("parent text again", "P1"),
        ];
        let resolved = resolve_with_map(docs, &map(&[("P1", "parent text")]));
        let mut ids: Vec<&str> = resolved
            .iter()
            .filter_map(|d| d.metadata.chunk_id.as_deref())
            .collect();
        let before = ids.len();
        ids.dedup();
        assert_eq!(before, 1);
        assert_eq!(ids.len(), 1);
    }

    #[test]
    fn test_missing_parent_keeps_synthetic() {
        let docs = vec![synthetic("orphaned question", "GONE")];
        let resolved = resolve_with_map(docs, &map(&[]));
        assert_eq!(resolved.len(), 1);
        assert!(resolved[0].metadata.is_synthetic);
    }

    #[test]
    fn test_docs_without_chunk_id_pass_through() {
        let doc = Document {
            page_content: "no id".into(),
            metadata: Default::default(),
        };
        let resolved = resolve_with_map(vec![doc.clone(), doc], &map(&[]));
        assert_eq!(resolved.len(), 2, "no chunk_id, no dedupe basis");
    }

    #[tokio::test]
    async fn test_resolver_loads_lazily_and_invalidates() {
        let store = Arc::new(InMemoryDocumentStore::new(
            vec![Document::published("parent content", "P1")],
            Vec::new(),
        ));
        let resolver = ParentResolver::new(store);
        let resolved = resolver.resolve(vec![synthetic("q", "P1")]).await;
        assert_eq!(resolved[0].page_content, "parent content");
        resolver.invalidate().await;
        let resolved = resolver.resolve(vec![synthetic("q", "P1")]).await;
        assert_eq!(resolved[0].page_content, "parent content");
    }

    #[tokio::test]
    async fn test_all_regular_batch_skips_map_load() {
        // No synthetics: resolve returns the batch untouched.
        let store = Arc::new(InMemoryDocumentStore::new(Vec::new(), Vec::new()));
        let resolver = ParentResolver::new(store);
        let docs = vec![Document::published("a", "A"), Document::published("b", "B")];
        let resolved = resolver.resolve(docs.clone()).await;
        assert_eq!(resolved, docs);
    }
}
