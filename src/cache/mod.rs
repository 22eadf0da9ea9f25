//! Answer cache tiers.
//!
//! Three of the four tiers live here (the intent-static tier is the
//! classifier in [`crate::intent`]): the exact cache keyed on query +
//! history, the FAQ answer cache keyed on curated questions, and the
//! semantic vector cache keyed on the rewritten standalone query. All
//! writes are best-effort; the canonical generic-error answer is never
//! stored and never served.

pub mod exact;
pub mod faq;
pub mod semantic;

pub use exact::ExactCache;
pub use faq::FaqAnswerCache;
pub use semantic::SemanticCache;

use crate::retrieval::Document;

/// Shared write hygiene: refuse error answers, strip non-published sources.
///
/// Returns `None` when the entry must not be cached at all.
pub(crate) fn sanitize_entry(
    answer: &str,
    sources: &[Document],
) -> Option<(String, Vec<Document>)> {
    if answer.trim().is_empty() || answer.trim() == crate::pipeline::GENERIC_USER_ERROR_MESSAGE {
        return None;
    }
    let published: Vec<Document> = sources.iter().filter(|d| d.is_published()).cloned().collect();
    Some((answer.to_string(), published))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::GENERIC_USER_ERROR_MESSAGE;

    #[test]
    fn test_error_answers_never_cacheable() {
        assert!(sanitize_entry(GENERIC_USER_ERROR_MESSAGE, &[]).is_none());
        assert!(sanitize_entry("", &[]).is_none());
        assert!(sanitize_entry("  ", &[]).is_none());
    }

    #[test]
    fn test_draft_sources_stripped() {
        let published = Document::published("ok", "a");
        let mut draft = Document::published("secret", "b");
        draft.metadata.status = Some("draft".into());
        let (answer, sources) =
            sanitize_entry("real answer", &[published.clone(), draft]).unwrap();
        assert_eq!(answer, "real answer");
        assert_eq!(sources, vec![published]);
    }
}
