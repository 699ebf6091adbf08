//! Rule text machinery: tokenisation, normalisation, validation filters,
//! coverage scoring, and Jaccard deduplication.
//!
//! Everything here is pure so the pipeline's behaviour is fully
//! property-testable.

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;

/// Hard cap on normalised rule length, trimmed at a word boundary.
pub const RULE_MAX_CHARS: usize = 220;

/// Accepted rule length from the generator, pre-normalisation.
pub const RAW_RULE_MIN_CHARS: usize = 4;
pub const RAW_RULE_MAX_CHARS: usize = 400;
pub const RATIONALE_MAX_CHARS: usize = 800;

/// Allowed imperative opening verbs.
pub const IMPERATIVE_OPENERS: [&str; 8] = [
    "do", "never", "always", "state", "make", "use", "provide", "redirect",
];

/// Tokens that make a rule too vague to enforce.
const FORBIDDEN_TOKENS: [&str; 6] = ["avoid", "try", "generally", "might", "maybe", "should"];

/// Pairs whose joint presence makes a rule self-contradictory.
const CONTRADICTION_PAIRS: [(&str, &str); 4] = [
    ("never", "always"),
    ("never", "unless"),
    ("do not", "but you can"),
    ("do not", "however you may"),
];

/// Common words excluded from feedback keyword sets.
const STOP_WORDS: [&str; 32] = [
    "the", "and", "for", "with", "that", "this", "from", "are", "was", "were", "has", "have",
    "had", "not", "but", "its", "it's", "their", "they", "them", "there", "which", "will",
    "would", "could", "about", "into", "than", "then", "when", "what", "also",
];

fn token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[a-z0-9']+").unwrap())
}

/// Lowercased word tokens of length >= 3.
pub fn tokenize(text: &str) -> BTreeSet<String> {
    let lower = text.to_lowercase();
    token_re()
        .find_iter(&lower)
        .map(|m| m.as_str().to_string())
        .filter(|t| t.len() >= 3)
        .collect()
}

/// Tokens of `text` with stop words removed; the keyword set used for
/// coverage scoring.
pub fn keyword_tokens(text: &str) -> BTreeSet<String> {
    let mut tokens = tokenize(text);
    for stop in STOP_WORDS {
        tokens.remove(stop);
    }
    tokens
}

/// Normalise a candidate rule into enforceable imperative form.
///
/// Collapses whitespace, truncates at a word boundary, guarantees a
/// terminal period, forces an allowed opening verb (prepending "Do " when
/// absent), and repairs the double-prefix artifacts that prepending can
/// produce.
pub fn normalise_rule(raw: &str) -> String {
    let mut cleaned = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.is_empty() {
        return cleaned;
    }

    if cleaned.len() > RULE_MAX_CHARS {
        cleaned = truncate_at_word(&cleaned, RULE_MAX_CHARS);
    }

    if !cleaned.ends_with('.') {
        cleaned.push('.');
    }

    let first_word = cleaned
        .split_whitespace()
        .next()
        .unwrap_or("")
        .trim_end_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase();
    if !IMPERATIVE_OPENERS.contains(&first_word.as_str()) {
        let mut chars = cleaned.chars();
        let lowered_head = chars.next().map(|c| c.to_lowercase().to_string());
        cleaned = format!(
            "Do {}{}",
            lowered_head.unwrap_or_default(),
            chars.as_str()
        );
    }

    // Normalised rules always start with a capital; capitalise before the
    // double-prefix repairs so they match regardless of input casing.
    let mut chars = cleaned.chars();
    if let Some(c) = chars.next() {
        cleaned = c.to_uppercase().to_string() + chars.as_str();
    }

    cleaned
        .replace("Do do ", "Do ")
        .replace("Do don't", "Do not")
        .replace("Do not not", "Do not")
}

fn truncate_at_word(s: &str, max: usize) -> String {
    let cut: String = s.chars().take(max).collect();
    match cut.rfind(' ') {
        Some(idx) if idx > 0 => cut[..idx].trim_end().to_string(),
        _ => cut.trim_end().to_string(),
    }
}

fn word_re(word: &str) -> Regex {
    Regex::new(&format!(r"(?i)\b{}\b", regex::escape(word))).unwrap()
}

/// Whether the rule still carries a forbidden vague token.
pub fn contains_forbidden_language(rule: &str) -> bool {
    FORBIDDEN_TOKENS.iter().any(|t| word_re(t).is_match(rule))
}

/// Auto-rewrite vague phrasing into enforceable phrasing. Tokens that
/// survive the rewrite cause the rule to be dropped by the caller.
pub fn rewrite_vague_language(rule: &str) -> String {
    let mut out = rule.to_string();
    out = Regex::new(r"(?i)\btry to\b")
        .unwrap()
        .replace_all(&out, "Do")
        .into_owned();
    out = word_re("avoid").replace_all(&out, "Do not").into_owned();
    out = word_re("generally").replace_all(&out, "").into_owned();
    out = word_re("might").replace_all(&out, "must").into_owned();
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Whether the rule contains both members of any contradiction pair.
pub fn is_contradictory(rule: &str) -> bool {
    let lower = rule.to_lowercase();
    CONTRADICTION_PAIRS
        .iter()
        .any(|(a, b)| lower.contains(a) && lower.contains(b))
}

/// Coverage score: feedback-keyword overlap minus a length penalty that
/// breaks ties toward concision.
pub fn score_rule(rule: &str, keywords: &BTreeSet<String>, length_penalty: f64) -> f64 {
    let coverage = tokenize(rule).intersection(keywords).count() as f64;
    coverage - length_penalty * rule.chars().count() as f64
}

/// Token Jaccard similarity; 0.0 when either side has no tokens.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}

/// Order-insensitive token signature, for global cross-criterion dedup.
pub fn rule_signature(rule: &str) -> String {
    tokenize(rule).into_iter().collect::<Vec<_>>().join("|")
}

/// A scored guardrail candidate for one criterion.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub criterion_id: String,
    pub rule: String,
    pub rationale: Option<String>,
    pub score: f64,
}

/// Drop near-duplicates: when two candidates' token sets reach the Jaccard
/// threshold, the shorter rule survives.
pub fn dedup_candidates(candidates: Vec<Candidate>, threshold: f64) -> Vec<Candidate> {
    let mut unique: Vec<Candidate> = Vec::new();
    for candidate in candidates {
        let tokens = tokenize(&candidate.rule);
        let mut superseded = false;
        unique.retain(|existing| {
            if jaccard(&tokens, &tokenize(&existing.rule)) >= threshold {
                if candidate.rule.len() < existing.rule.len() {
                    // The newcomer is shorter; drop the existing rule.
                    false
                } else {
                    superseded = true;
                    true
                }
            } else {
                true
            }
        });
        if !superseded {
            unique.push(candidate);
        }
    }
    unique
}

/// Final per-criterion ordering: score descending, then length ascending.
pub fn sort_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.rule.len().cmp(&b.rule.len()))
    });
}
