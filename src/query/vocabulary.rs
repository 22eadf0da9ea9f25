//! Domain vocabulary normalization and entity expansion.
//!
//! Normalization maps community phrasing to the canonical terms the corpus
//! is indexed under ("mimblewimble" -> "mweb") in a single compiled-regex
//! pass, longest synonym first. Expansion appends retrieval synonyms for
//! key acronyms so sparse search sees them too.

use aho_corasick::{AhoCorasick, MatchKind};
use once_cell::sync::Lazy;
use regex::Regex;

/// Synonym -> canonical term.
const SYNONYM_MAP: &[(&str, &str)] = &[
    // Privacy / MWEB
    ("mimblewimble", "mweb"),
    ("extension blocks", "mweb"),
    ("privacy upgrade", "mweb"),
    ("confidential transactions", "mweb"),
    ("stealth addresses", "mweb"),
    ("mw", "mweb"),
    ("eb", "mweb"),
    ("hogex", "mweb"),
    // Economics, supply, halving
    ("total coins", "supply"),
    ("circulating supply", "supply"),
    ("max supply", "supply"),
    ("issuance", "supply"),
    ("inflation", "supply"),
    ("halvening", "halving"),
    ("block reward reduction", "halving"),
    ("subsidy", "halving"),
    ("stock to flow", "economics"),
    ("scarcity", "economics"),
    ("digital silver", "narrative"),
    ("silver to gold", "narrative"),
    // Leadership and history
    ("charlie lee", "creator"),
    ("coblee", "creator"),
    ("founder", "creator"),
    ("litecoin foundation", "foundation"),
    ("lf", "foundation"),
    ("genesis block", "history"),
    ("fair launch", "history"),
    // Mining and security
    ("mining algorithm", "scrypt"),
    ("hashing algorithm", "scrypt"),
    ("pow", "proof of work"),
    ("hashrate", "security"),
    ("51% attack", "security"),
    ("double spend", "security"),
    ("asic", "mining hardware"),
    ("l7", "mining hardware"),
    ("merged mining", "auxpow"),
    ("doge mining", "auxpow"),
    // Layer 2, scaling, assets
    ("lightning network", "lightning"),
    ("l2", "lightning"),
    ("payment channels", "lightning"),
    ("omnilite", "smart contracts"),
    ("tokens", "ordinals"),
    ("inscriptions", "ordinals"),
    ("brc-20", "ltc-20"),
    ("taproot", "upgrades"),
    ("segwit", "upgrades"),
    ("bech32", "address format"),
    // Wallets and custody
    ("litewallet", "wallet"),
    ("loafwallet", "wallet"),
    ("electrum-ltc", "wallet"),
    ("cold storage", "custody"),
    ("hardware wallet", "custody"),
    ("ledger", "custody"),
    ("trezor", "custody"),
];

/// Key terms whose retrieval synonyms get appended on expansion.
const ENTITY_EXPANSIONS: &[(&str, &str)] = &[
    ("mweb", "mimblewimble extension blocks privacy"),
    ("scrypt", "mining algorithm proof of work"),
    ("halving", "block reward reduction schedule"),
    ("lightning", "payment channels layer 2"),
    ("ltc", "litecoin"),
    ("auxpow", "merged mining dogecoin"),
    ("ordinals", "inscriptions tokens"),
];

/// One pattern for all synonyms, longest first so multi-word phrases win.
static SYNONYM_RE: Lazy<Regex> = Lazy::new(|| {
    let mut sorted: Vec<&str> = SYNONYM_MAP.iter().map(|(s, _)| *s).collect();
    sorted.sort_by_key(|s| std::cmp::Reverse(s.len()));
    let alternation = sorted
        .iter()
        .map(|s| regex::escape(s))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r"(?i)\b({alternation})\b")).expect("valid synonym pattern")
});

/// Multi-pattern matcher over the expansion keys (leftmost-longest).
static ENTITY_MATCHER: Lazy<AhoCorasick> = Lazy::new(|| {
    AhoCorasick::builder()
        .ascii_case_insensitive(true)
        .match_kind(MatchKind::LeftmostLongest)
        .build(ENTITY_EXPANSIONS.iter().map(|(k, _)| *k))
        .expect("valid entity patterns")
});

fn canonical_for(synonym: &str) -> &'static str {
    let lower = synonym.to_lowercase();
    SYNONYM_MAP
        .iter()
        .find(|(s, _)| *s == lower)
        .map(|(_, c)| *c)
        .unwrap_or("")
}

/// Map community phrasing to canonical corpus terms.
pub fn normalize_keywords(query: &str) -> String {
    if query.is_empty() {
        return String::new();
    }
    SYNONYM_RE
        .replace_all(query, |caps: &regex::Captures| {
            canonical_for(&caps[1]).to_string()
        })
        .trim()
        .to_string()
}

/// Append retrieval synonyms for key terms present in the query.
///
/// Only terms appearing as whole words expand, and only synonym words not
/// already present are appended.
pub fn expand_entities(query: &str) -> String {
    if query.is_empty() {
        return String::new();
    }
    let lower = query.to_lowercase();
    let mut additions: Vec<&str> = Vec::new();
    for matched in ENTITY_MATCHER.find_iter(&lower) {
        // Whole-word check: aho-corasick has no boundary notion.
        let start_ok = matched.start() == 0
            || !lower.as_bytes()[matched.start() - 1].is_ascii_alphanumeric();
        let end_ok = matched.end() == lower.len()
            || !lower.as_bytes()[matched.end()].is_ascii_alphanumeric();
        if !start_ok || !end_ok {
            continue;
        }
        let (_, expansion) = ENTITY_EXPANSIONS[matched.pattern().as_usize()];
        for word in expansion.split_whitespace() {
            if !lower.contains(word) && !additions.contains(&word) {
                additions.push(word);
            }
        }
    }
    if additions.is_empty() {
        query.trim().to_string()
    } else {
        format!("{} {}", query.trim(), additions.join(" "))
    }
}

/// Canonical terms and expansion keys, used by pronoun anchoring to spot
/// the most recently mentioned entity in history.
pub fn is_known_entity(token: &str) -> bool {
    let lower = token.to_lowercase();
    ENTITY_EXPANSIONS.iter().any(|(k, _)| *k == lower)
        || SYNONYM_MAP.iter().any(|(_, c)| *c == lower)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_single_word() {
        assert_eq!(normalize_keywords("what is mimblewimble"), "what is mweb");
    }

    #[test]
    fn test_normalize_prefers_longest_phrase() {
        // "block reward reduction" must map as a phrase, not via "subsidy"
        // style single words inside it.
        assert_eq!(
            normalize_keywords("when is the block reward reduction"),
            "when is the halving"
        );
    }

    #[test]
    fn test_normalize_case_insensitive() {
        assert_eq!(normalize_keywords("Charlie Lee created it"), "creator created it");
    }

    #[test]
    fn test_normalize_word_boundaries() {
        // "pow" inside "power" must not normalize.
        assert_eq!(normalize_keywords("mining power"), "mining power");
        assert_eq!(normalize_keywords("what is pow"), "what is proof of work");
    }

    #[test]
    fn test_normalize_economics_synonyms() {
        assert_eq!(
            normalize_keywords("what is litecoin's stock to flow"),
            "what is litecoin's economics"
        );
        assert_eq!(normalize_keywords("scarcity of ltc"), "economics of ltc");
        assert_eq!(
            normalize_keywords("is inflation capped"),
            "is supply capped"
        );
    }

    #[test]
    fn test_normalize_short_aliases_are_whole_word_only() {
        // "mw" and "eb" are aliases, but must never fire inside "mweb".
        assert_eq!(normalize_keywords("what is mw"), "what is mweb");
        assert_eq!(normalize_keywords("what is mweb"), "what is mweb");
        assert_eq!(normalize_keywords("the l2 story"), "the lightning story");
        assert_eq!(normalize_keywords("an l7 miner"), "an mining hardware miner");
        assert_eq!(normalize_keywords("ask the lf"), "ask the foundation");
        assert_eq!(normalize_keywords("webb telescope"), "webb telescope");
    }

    #[test]
    fn test_normalize_tokens_to_ordinals() {
        assert_eq!(
            normalize_keywords("how do tokens work"),
            "how do ordinals work"
        );
    }

    #[test]
    fn test_expand_appends_synonyms_once() {
        let out = expand_entities("what is mweb");
        assert!(out.starts_with("what is mweb"));
        assert!(out.contains("mimblewimble"));
        assert!(out.contains("privacy"));
    }

    #[test]
    fn test_expand_skips_words_already_present() {
        let out = expand_entities("mweb privacy features");
        let privacy_count = out.matches("privacy").count();
        assert_eq!(privacy_count, 1);
    }

    #[test]
    fn test_expand_requires_whole_word() {
        assert_eq!(expand_entities("vaultcoin"), "vaultcoin");
        // "ltc" inside "ltc-20"? hyphen is a boundary, so it does expand.
        assert!(expand_entities("ltc-20 tokens").contains("litecoin"));
    }

    #[test]
    fn test_expand_no_known_terms_is_identity() {
        assert_eq!(expand_entities("how do wallets work"), "how do wallets work");
    }

    #[test]
    fn test_known_entity_lookup() {
        assert!(is_known_entity("mweb"));
        assert!(is_known_entity("MWEB"));
        assert!(is_known_entity("halving"));
        // Canonical terms count as entities for pronoun anchoring.
        assert!(is_known_entity("economics"));
        assert!(is_known_entity("foundation"));
        assert!(!is_known_entity("dinner"));
    }

    #[test]
    fn test_empty_inputs() {
        assert_eq!(normalize_keywords(""), "");
        assert_eq!(expand_entities(""), "");
    }
}
