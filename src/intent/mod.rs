//! Intent classification (tier T1 gate).
//!
//! Routes greetings, thanks and FAQ matches away from the full pipeline
//! using fuzzy string matching only, no model calls. Long queries skip the
//! short-phrase classes entirely; FAQ matching uses a token-sort ratio so
//! word order does not defeat it.

use std::sync::RwLock;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

/// Greeting class applies to queries of at most this many words.
const GREETING_WORD_CAP: usize = 3;
/// Thanks class applies to queries of at most this many words.
const THANKS_WORD_CAP: usize = 5;
/// Fuzzy-match acceptance ratio for the short-phrase classes.
const SHORT_PHRASE_RATIO: f64 = 0.80;

static NORMALIZE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[a-z0-9]+").expect("valid regex"));

const GREETING_PATTERNS: &[&str] = &[
    "hello", "hi", "hey", "good morning", "good afternoon", "good evening", "what's up", "howdy",
    "greetings", "yo", "hiya", "sup", "hi there", "hello there", "hey there",
];

const THANKS_PATTERNS: &[&str] = &[
    "thanks", "thank you", "thx", "appreciate", "helpful", "got it", "understood", "makes sense",
    "perfect", "great", "awesome", "cool", "nice", "cheers", "ty", "tyvm", "thank you so much",
    "thanks a lot", "much appreciated",
];

/// Static response for greetings.
pub const GREETING_RESPONSE: &str = "Hello! I'm here to help you learn about Litecoin. \
     Feel free to ask me anything about Litecoin's technology, history, \
     wallets, or how to get started!";

/// Static response for thanks.
pub const THANKS_RESPONSE: &str =
    "You're welcome! Is there anything else you'd like to know about Litecoin?";

/// User intent classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Greeting,
    Thanks,
    FaqMatch,
    Search,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Greeting => "greeting",
            Intent::Thanks => "thanks",
            Intent::FaqMatch => "faq_match",
            Intent::Search => "search",
        }
    }
}

/// Classification result: the intent, the matched FAQ question (FaqMatch
/// only), and the static response (Greeting/Thanks only).
pub type Classification = (Intent, Option<String>, Option<&'static str>);

/// Fuzzy intent classifier over a refreshable FAQ question list.
pub struct IntentClassifier {
    faq_questions: RwLock<Vec<String>>,
    /// Token-sort similarity threshold on a 0-100 scale.
    faq_match_threshold: f64,
}

impl IntentClassifier {
    pub fn new(faq_questions: Vec<String>, faq_match_threshold: f64) -> Self {
        Self {
            faq_questions: RwLock::new(faq_questions),
            faq_match_threshold,
        }
    }

    /// Replace the FAQ list after an ingestion refresh.
    pub fn update_faq_questions(&self, questions: Vec<String>) {
        let mut guard = self.faq_questions.write().expect("faq list lock poisoned");
        debug!(count = questions.len(), "FAQ question list updated");
        *guard = questions;
    }

    /// Lowercase and collapse to space-separated alphanumeric tokens.
    ///
    /// Prevents substring false positives like "sup" inside "supply".
    fn normalize(text: &str) -> String {
        NORMALIZE_RE
            .find_iter(&text.to_lowercase())
            .map(|m| m.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Classify a query.
    pub fn classify(&self, query: &str) -> Classification {
        if query.trim().is_empty() {
            return (Intent::Search, None, None);
        }
        let query_lower = query.to_lowercase();
        let query_lower = query_lower.trim();

        if self.matches_short_phrase(query_lower, GREETING_PATTERNS, GREETING_WORD_CAP, 3) {
            return (Intent::Greeting, None, Some(GREETING_RESPONSE));
        }
        if self.matches_short_phrase(query_lower, THANKS_PATTERNS, THANKS_WORD_CAP, 4) {
            return (Intent::Thanks, None, Some(THANKS_RESPONSE));
        }
        if let Some(matched) = self.match_faq(query) {
            return (Intent::FaqMatch, Some(matched), None);
        }
        (Intent::Search, None, None)
    }

    /// Exact-or-fuzzy match against a short-phrase list, gated on word count
    /// and on the candidate being of comparable length.
    fn matches_short_phrase(
        &self,
        query: &str,
        patterns: &[&str],
        word_cap: usize,
        length_slack: usize,
    ) -> bool {
        if query.split_whitespace().count() > word_cap {
            return false;
        }
        let q = Self::normalize(query);
        if q.is_empty() {
            return false;
        }
        for pattern in patterns {
            let p = Self::normalize(pattern);
            if p.is_empty() {
                continue;
            }
            if q == p {
                return true;
            }
            if q.len() >= 3 && q.len().abs_diff(p.len()) <= length_slack {
                if strsim::normalized_levenshtein(&q, &p) > SHORT_PHRASE_RATIO {
                    return true;
                }
            }
        }
        false
    }

    /// Token-sort ratio: sort the token multisets, then compare. Robust to
    /// word-order differences ("what is litecoin" vs "litecoin what is").
    fn token_sort_ratio(a: &str, b: &str) -> f64 {
        let sort = |s: &str| {
            let mut tokens: Vec<&str> = NORMALIZE_RE
                .find_iter(s)
                .map(|m| m.as_str())
                .collect::<Vec<_>>();
            tokens.sort_unstable();
            tokens.join(" ")
        };
        let a_lower = a.to_lowercase();
        let b_lower = b.to_lowercase();
        strsim::normalized_levenshtein(&sort(&a_lower), &sort(&b_lower)) * 100.0
    }

    /// Best FAQ question at or above the threshold.
    fn match_faq(&self, query: &str) -> Option<String> {
        let questions = self.faq_questions.read().expect("faq list lock poisoned");
        let mut best: Option<(f64, &String)> = None;
        for question in questions.iter() {
            let score = Self::token_sort_ratio(query, question);
            if best.map(|(s, _)| score > s).unwrap_or(true) {
                best = Some((score, question));
            }
        }
        match best {
            Some((score, question)) if score >= self.faq_match_threshold => {
                debug!(score, "FAQ match");
                Some(question.clone())
            }
            _ => None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> IntentClassifier {
        IntentClassifier::new(
            vec![
                "What is MWEB?".to_string(),
                "How does the Litecoin halving work?".to_string(),
                "What is the block time of Litecoin?".to_string(),
            ],
            85.0,
        )
    }

    #[test]
    fn test_greeting_exact() {
        let (intent, _, response) = classifier().classify("hello");
        assert_eq!(intent, Intent::Greeting);
        assert_eq!(response, Some(GREETING_RESPONSE));
    }

    #[test]
    fn test_greeting_with_punctuation() {
        let (intent, _, _) = classifier().classify("Hey there!");
        assert_eq!(intent, Intent::Greeting);
    }

    #[test]
    fn test_greeting_typo_fuzzy_match() {
        let (intent, _, _) = classifier().classify("helllo");
        assert_eq!(intent, Intent::Greeting);
    }

    #[test]
    fn test_sup_does_not_match_supply() {
        let (intent, _, _) = classifier().classify("supply");
        assert_eq!(intent, Intent::Search, "'supply' must not greet");
    }

    #[test]
    fn test_long_query_with_greeting_word_is_search() {
        let (intent, _, _) = classifier().classify("hello can you explain the halving schedule");
        assert_eq!(intent, Intent::Search, "word cap gates the greeting class");
    }

    #[test]
    fn test_thanks_exact_and_phrase() {
        assert_eq!(classifier().classify("thanks").0, Intent::Thanks);
        assert_eq!(classifier().classify("thank you so much").0, Intent::Thanks);
        assert_eq!(
            classifier().classify("thanks").2,
            Some(THANKS_RESPONSE)
        );
    }

    #[test]
    fn test_thanks_word_cap() {
        let (intent, _, _) =
            classifier().classify("thanks but what about the total supply of litecoin");
        assert_eq!(intent, Intent::Search);
    }

    #[test]
    fn test_faq_match_word_order_insensitive() {
        let (intent, matched, _) = classifier().classify("MWEB is what?");
        assert_eq!(intent, Intent::FaqMatch);
        assert_eq!(matched.as_deref(), Some("What is MWEB?"));
    }

    #[test]
    fn test_faq_below_threshold_is_search() {
        let (intent, _, _) = classifier().classify("how do I configure a mining pool");
        assert_eq!(intent, Intent::Search);
    }

    #[test]
    fn test_empty_query_is_search() {
        assert_eq!(classifier().classify("  ").0, Intent::Search);
    }

    #[test]
    fn test_update_faq_questions() {
        let c = classifier();
        c.update_faq_questions(vec!["What is Scrypt?".to_string()]);
        let (intent, matched, _) = c.classify("what is scrypt");
        assert_eq!(intent, Intent::FaqMatch);
        assert_eq!(matched.as_deref(), Some("What is Scrypt?"));
        // The old list is gone.
        assert_eq!(c.classify("What is MWEB?").0, Intent::Search);
    }

    #[test]
    fn test_token_sort_ratio_symmetry() {
        let a = IntentClassifier::token_sort_ratio("what is mweb", "mweb is what");
        assert!((a - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_intent_as_str() {
        assert_eq!(Intent::FaqMatch.as_str(), "faq_match");
        assert_eq!(Intent::Search.as_str(), "search");
    }
}
