//! FAQ answer cache (tier T2).
//!
//! Pre-generated answers for the curated question list, stored in the KV
//! store under `faq:answer:<md5(normalized question)>` by a background job
//! on the ingestion side. This side only reads, refreshes TTLs on write
//! paths it owns (admin repopulation), and clears.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::kv::{keys, AtomicKv};
use crate::retrieval::Document;

/// Default payload TTL: 24 hours (the background job refreshes daily).
pub const FAQ_ANSWER_TTL: i64 = 86_400;

#[derive(Debug, Serialize, Deserialize)]
struct FaqPayload {
    answer: String,
    sources: Vec<Document>,
}

/// KV-backed cache of pre-generated FAQ answers.
pub struct FaqAnswerCache {
    kv: Arc<dyn AtomicKv>,
}

impl FaqAnswerCache {
    pub fn new(kv: Arc<dyn AtomicKv>) -> Self {
        Self { kv }
    }

    /// Canonical form of a question: lowercased, whitespace collapsed,
    /// trailing question marks dropped.
    fn normalize(question: &str) -> String {
        let collapsed = question
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        collapsed.trim_end_matches('?').trim().to_string()
    }

    fn key(question: &str) -> String {
        let digest = md5::compute(Self::normalize(question).as_bytes());
        keys::faq_answer(&format!("{digest:x}"))
    }

    /// Fetch the pre-generated answer for a matched FAQ question.
    pub async fn get(&self, question: &str) -> Option<(String, Vec<Document>)> {
        let raw = match self.kv.get_string(&Self::key(question)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!("FAQ cache read failed: {e}");
                return None;
            }
        };
        let payload: FaqPayload = match serde_json::from_str(&raw) {
            Ok(p) => p,
            Err(e) => {
                warn!("FAQ cache entry is corrupt, ignoring: {e}");
                return None;
            }
        };
        if payload.answer.trim() == crate::pipeline::GENERIC_USER_ERROR_MESSAGE {
            return None;
        }
        Some((payload.answer, payload.sources))
    }

    /// Store an answer (admin repopulation path). Best-effort.
    pub async fn set(&self, question: &str, answer: &str, sources: &[Document]) {
        let Some((answer, sources)) = super::sanitize_entry(answer, sources) else {
            return;
        };
        let payload = FaqPayload { answer, sources };
        let json = match serde_json::to_string(&payload) {
            Ok(j) => j,
            Err(e) => {
                warn!("FAQ payload serialization failed: {e}");
                return;
            }
        };
        if let Err(e) = self
            .kv
            .set_string_ex(&Self::key(question), &json, FAQ_ANSWER_TTL)
            .await
        {
            warn!("FAQ cache write failed: {e}");
        }
    }

    /// Delete every stored FAQ answer.
    pub async fn clear(&self) {
        match self.kv.scan_prefix("faq:answer:").await {
            Ok(keys) => {
                for key in keys {
                    if let Err(e) = self.kv.delete(&key).await {
                        warn!("FAQ cache delete failed for {key}: {e}");
                    }
                }
            }
            Err(e) => warn!("FAQ cache clear scan failed: {e}"),
        }
    }
}
