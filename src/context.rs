//! Service context: every long-lived collaborator, wired once at startup.
//!
//! Handlers receive an `Arc<ServiceContext>`; nothing reaches for globals.
//! Construction order follows the dependency graph (KV first, pipeline
//! last); `shutdown` unwinds in reverse.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};

use crate::admission::{AdmissionGate, ChallengeService};
use crate::alerts::Alerter;
use crate::cache::{ExactCache, FaqAnswerCache, SemanticCache};
use crate::config::Config;
use crate::error::Result;
use crate::health::HealthRegistry;
use crate::intent::IntentClassifier;
use crate::kv::{AtomicKv, MemoryKv, RedisKv};
use crate::llm::embeddings::HttpEmbeddings;
use crate::llm::{EmbeddingClient, GeminiClient, LlmClient};
use crate::pipeline::Pipeline;
use crate::query::{QueryRouter, ShortQueryExpander};
use crate::retrieval::{
    Bm25Retriever, Document, DocumentStore, HybridRetriever, InMemoryDocumentStore, ParentResolver,
    SparseRetriever,
};
use crate::settings::SettingsReader;
use crate::spend::SpendLedger;

/// Exact-cache defaults: 1 hour TTL, 1000 entries.
const EXACT_CACHE_TTL: u64 = 3600;
const EXACT_CACHE_CAPACITY: usize = 1000;

/// Dense dimension expected from the embeddings service.
const EMBEDDING_DIMENSION: usize = 1024;

/// On-disk corpus snapshot (`CORPUS_PATH`), produced by the ingestion side.
#[derive(Debug, Default, Deserialize)]
struct CorpusFile {
    #[serde(default)]
    documents: Vec<Document>,
    #[serde(default)]
    faq_questions: Vec<String>,
}

/// Shared service state.
pub struct ServiceContext {
    pub config: Config,
    pub kv: Arc<dyn AtomicKv>,
    pub settings: Arc<SettingsReader>,
    pub alerter: Arc<Alerter>,
    pub challenges: Arc<ChallengeService>,
    pub gate: AdmissionGate,
    pub pipeline: Arc<Pipeline>,
    pub ledger: Arc<SpendLedger>,
    pub health: HealthRegistry,
}

impl ServiceContext {
    /// Wire everything up from configuration.
    pub async fn initialize(config: Config) -> Result<Arc<Self>> {
        // KV store first: everything leans on it.
        let kv: Arc<dyn AtomicKv> = match &config.redis_url {
            Some(url) => {
                let redis = RedisKv::connect(url).await?;
                info!("connected to Redis KV store");
                Arc::new(redis)
            }
            None => {
                warn!("REDIS_URL not set; using in-process KV store (single instance only)");
                Arc::new(MemoryKv::new())
            }
        };

        let settings = Arc::new(SettingsReader::new(kv.clone()));
        let alerter = Arc::new(Alerter::new(config.alert_webhook_url.clone()));
        let challenges = Arc::new(ChallengeService::new(
            kv.clone(),
            settings.clone(),
            config.is_development,
        ));
        let gate = AdmissionGate::new(
            kv.clone(),
            settings.clone(),
            alerter.clone(),
            challenges.clone(),
            &config,
        );
        let ledger = Arc::new(SpendLedger::new(
            kv.clone(),
            settings.clone(),
            config.llm_model.clone(),
        ));

        // Model-side collaborators.
        let llm: Option<Arc<dyn LlmClient>> = config
            .gemini_api_key
            .as_deref()
            .map(|key| Arc::new(GeminiClient::new(key, &config.llm_model)) as Arc<dyn LlmClient>);
        if llm.is_none() {
            warn!("no LLM API key configured; generation and routing degraded");
        }
        let embeddings: Option<Arc<dyn EmbeddingClient>> =
            config.embeddings_url.as_deref().map(|url| {
                Arc::new(HttpEmbeddings::new(url.to_string(), EMBEDDING_DIMENSION))
                    as Arc<dyn EmbeddingClient>
            });

        // Corpus snapshot. The real document store and vector index belong to
        // the ingestion collaborator; this core consumes a snapshot file and
        // builds its sparse index from it.
        let corpus = load_corpus();
        info!(
            documents = corpus.documents.len(),
            faq_questions = corpus.faq_questions.len(),
            "corpus snapshot loaded"
        );
        let sparse: Arc<dyn SparseRetriever> =
            Arc::new(Bm25Retriever::new(corpus.documents.clone()));
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryDocumentStore::new(
            corpus.documents,
            corpus.faq_questions.clone(),
        ));

        let intent = config.use_intent_classification.then(|| {
            IntentClassifier::new(corpus.faq_questions, config.faq_match_threshold)
        });

        let semantic_cache = if config.use_redis_cache {
            let cache = SemanticCache::persisted(config.semantic_cache_threshold, kv.clone());
            cache.load().await;
            cache
        } else {
            SemanticCache::in_memory(config.semantic_cache_threshold)
        };

        let pipeline = Arc::new(Pipeline {
            retriever: HybridRetriever::new(
                // The dense index is owned by the ingestion collaborator and
                // attached through its own adapter; absent here, the dense
                // leg simply stays idle.
                None,
                Some(sparse.clone()),
                embeddings.clone(),
                config.retriever_k,
                config.min_vector_similarity,
                config.sparse_rerank_limit,
            ),
            fallback_sparse: Some(sparse),
            parents: ParentResolver::new(store),
            exact_cache: ExactCache::new(EXACT_CACHE_TTL, EXACT_CACHE_CAPACITY),
            semantic_cache,
            faq_cache: FaqAnswerCache::new(kv.clone()),
            intent,
            expander: ShortQueryExpander::new(llm.clone()),
            router: QueryRouter::new(llm.clone()),
            llm,
            embeddings,
            ledger: ledger.clone(),
            config: config.clone(),
        });

        Ok(Arc::new(Self {
            config,
            kv,
            settings,
            alerter,
            challenges,
            gate,
            pipeline,
            ledger,
            health: HealthRegistry::new(),
        }))
    }

    /// Tear down in reverse construction order.
    pub async fn shutdown(&self) {
        info!("shutting down service context");
        // The pipeline and gate hold no OS resources of their own; the KV
        // connection manager closes with its last clone.
    }
}

fn load_corpus() -> CorpusFile {
    let Some(path) = std::env::var("CORPUS_PATH").ok().filter(|p| !p.is_empty()) else {
        return CorpusFile::default();
    };
    match std::fs::read_to_string(&path) {
        Ok(raw) => match serde_json::from_str(&raw) {
            Ok(corpus) => corpus,
            Err(e) => {
                warn!("corpus file {path} is not valid JSON, starting empty: {e}");
                CorpusFile::default()
            }
        },
        Err(e) => {
            warn!("could not read corpus file {path}, starting empty: {e}");
            CorpusFile::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_initialize_without_external_services() {
        let ctx = ServiceContext::initialize(Config::default()).await.unwrap();
        assert!(ctx.config.is_development);
        ctx.kv.ping().await.unwrap();
        ctx.shutdown().await;
    }

    #[test]
    fn test_corpus_file_parses() {
        let corpus: CorpusFile = serde_json::from_str(
            r#"{
                "documents": [
                    {"page_content": "text", "metadata": {"status": "published", "chunk_id": "c1"}}
                ],
                "faq_questions": ["What is MWEB?"]
            }"#,
        )
        .unwrap();
        assert_eq!(corpus.documents.len(), 1);
        assert_eq!(corpus.faq_questions.len(), 1);
    }
}
