//! Judge response parser and repair loop.
//!
//! Judges are instructed to return `{score, explanation, evidence_extracts}`
//! as JSON, and routinely don't: fenced blocks, reasoning preambles, smart
//! quotes, trailing commas, unbalanced braces. The parser works through a
//! fixed ladder — strict parse, heuristic repair, one LLM repair call — and
//! degrades to an explicit sentinel when everything fails. Downstream code
//! branches on the outcome variant, never on `score == 0`.

use crate::error::LlmError;
use crate::providers::Provider;
use crate::types::GenerationOptions;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

/// A successfully parsed judge pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedPass {
    pub score: f64,
    pub explanation: String,
    pub evidence_extracts: Vec<String>,
}

/// Which stage of the ladder produced the parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseMethod {
    Direct,
    Heuristic,
    LlmRepair,
}

/// Outcome of parsing one judge pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PassOutcome {
    Parsed {
        result: ParsedPass,
        method: ParseMethod,
    },
    /// All stages failed. Counts as score 0.0 and flags partiality.
    Sentinel { diagnostic: String },
}

impl PassOutcome {
    pub fn score(&self) -> f64 {
        match self {
            PassOutcome::Parsed { result, .. } => result.score,
            PassOutcome::Sentinel { .. } => 0.0,
        }
    }

    pub fn explanation(&self) -> &str {
        match self {
            PassOutcome::Parsed { result, .. } => &result.explanation,
            PassOutcome::Sentinel { diagnostic } => diagnostic,
        }
    }

    pub fn evidence_extracts(&self) -> &[String] {
        match self {
            PassOutcome::Parsed { result, .. } => &result.evidence_extracts,
            PassOutcome::Sentinel { .. } => &[],
        }
    }

    pub fn is_sentinel(&self) -> bool {
        matches!(self, PassOutcome::Sentinel { .. })
    }
}

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)```(json)?").unwrap())
}

fn think_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<think>.*?</think>").unwrap())
}

fn trailing_comma_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r",(\s*[}\]])").unwrap())
}

fn non_finite_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"-?\bInfinity\b|\bNaN\b").unwrap())
}

/// Strip code fences and chain-of-thought blocks.
fn strip_fences_and_think(raw: &str) -> String {
    let s = think_re().replace_all(raw.trim(), "");
    fence_re().replace_all(&s, "").trim().to_string()
}

/// Fix quote style, trailing commas, and non-finite literals.
fn normalize_quotes_commas(s: &str) -> String {
    let s = s
        .replace(['\u{201c}', '\u{201d}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");
    let s = trailing_comma_re().replace_all(&s, "$1");
    non_finite_re().replace_all(&s, "null").to_string()
}

/// Extract the outermost `{…}` block, if any.
fn extract_json_block(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let end = s.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(&s[start..=end])
}

/// Escape raw newlines that appear inside string literals.
fn escape_newlines_in_strings(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_string = false;
    let mut escaped = false;
    for c in s.chars() {
        match c {
            '"' if !escaped => {
                in_string = !in_string;
                out.push(c);
            }
            '\\' if in_string && !escaped => {
                escaped = true;
                out.push(c);
                continue;
            }
            '\n' if in_string => out.push_str("\\n"),
            _ => out.push(c),
        }
        escaped = false;
    }
    out
}

/// Append closing braces for any left unbalanced outside string literals.
fn close_unbalanced_braces(s: &str) -> String {
    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escaped = false;
    for c in s.chars() {
        match c {
            '"' if !escaped => in_string = !in_string,
            '\\' if in_string && !escaped => {
                escaped = true;
                continue;
            }
            '{' if !in_string => depth += 1,
            '}' if !in_string => depth -= 1,
            _ => {}
        }
        escaped = false;
    }
    let mut out = s.to_string();
    for _ in 0..depth.max(0) {
        out.push('}');
    }
    out
}

/// Coerce a parsed JSON value into the pass shape.
///
/// Score accepts numbers and numeric strings and is clamped to [0, 5];
/// an absent or non-numeric score rejects the value so the next repair
/// stage runs. Empty explanations get a fixed placeholder; non-string
/// evidence entries are dropped.
fn validate(value: &Value) -> Option<ParsedPass> {
    let obj = value.as_object()?;
    let score_raw = obj.get("score")?;
    let score = match score_raw {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    let score = score.clamp(0.0, 5.0);

    let explanation = obj
        .get("explanation")
        .and_then(|e| e.as_str())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or("no explanation provided")
        .to_string();

    let evidence_extracts = obj
        .get("evidence_extracts")
        .and_then(|e| e.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();

    Some(ParsedPass {
        score,
        explanation,
        evidence_extracts,
    })
}

/// JSON schema for the pass shape, included in the repair prompt and used
/// for constrained generation where the backend supports it.
pub fn pass_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "score": {"type": "number", "minimum": 0.0, "maximum": 5.0},
            "explanation": {"type": "string"},
            "evidence_extracts": {"type": "array", "items": {"type": "string"}},
        },
        "required": ["score"],
    })
}

/// The fixed repair prompt: JSON only, obvious coercions, defaults for
/// missing fields.
fn repair_prompt(raw: &str) -> String {
    format!(
        "You are a JSON repair tool. Given invalid JSON or JSON mixed with extra text, \
         output a JSON object that strictly matches this schema.\n\
         Schema (JSON):\n{}\n\n\
         Rules:\n\
         - Output ONLY the JSON object, no prose, no fences.\n\
         - Coerce types if obvious (numbers to float 0-5, lists of strings).\n\
         - If fields are missing, fill defaults: score=0.0, explanation='', evidence_extracts=[].\n\n\
         Content to fix:\n{}",
        pass_schema(),
        raw
    )
}

/// Parser for judge outputs, with an optional repair model.
pub struct ResponseParser {
    repair: Option<Arc<dyn Provider>>,
}

impl ResponseParser {
    pub fn new(repair: Option<Arc<dyn Provider>>) -> Self {
        Self { repair }
    }

    /// Strict-then-heuristic parse without any network calls.
    fn parse_offline(raw: &str) -> Option<(ParsedPass, ParseMethod)> {
        // Stage 1: direct.
        let s = normalize_quotes_commas(&strip_fences_and_think(raw));
        let block = extract_json_block(&s).unwrap_or(&s);
        if let Ok(value) = serde_json::from_str::<Value>(block) {
            if let Some(parsed) = validate(&value) {
                return Some((parsed, ParseMethod::Direct));
            }
        }

        // Stage 2: heuristic cleaning.
        let cleaned: String = strip_fences_and_think(raw)
            .lines()
            .filter(|line| !line.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        let cleaned = normalize_quotes_commas(&cleaned);
        let cleaned = escape_newlines_in_strings(&cleaned);
        let cleaned = close_unbalanced_braces(&cleaned);
        let block = extract_json_block(&cleaned)?;
        let value = serde_json::from_str::<Value>(block).ok()?;
        validate(&value).map(|parsed| (parsed, ParseMethod::Heuristic))
    }

    /// Parse a raw judge response, repairing as needed.
    pub async fn parse(&self, raw: &str) -> PassOutcome {
        if let Some((result, method)) = Self::parse_offline(raw) {
            return PassOutcome::Parsed { result, method };
        }

        // Stage 3: one delegated repair call.
        if let Some(repair) = &self.repair {
            match self.repair_with_llm(repair.as_ref(), raw).await {
                Ok(result) => {
                    debug!(model = repair.model_name(), "LLM repair succeeded");
                    return PassOutcome::Parsed {
                        result,
                        method: ParseMethod::LlmRepair,
                    };
                }
                Err(e) => {
                    warn!(error = %e, "LLM repair failed");
                }
            }
        }

        PassOutcome::Sentinel {
            diagnostic: "failed to parse and repair judge response".to_string(),
        }
    }

    async fn repair_with_llm(
        &self,
        repair: &dyn Provider,
        raw: &str,
    ) -> Result<ParsedPass, LlmError> {
        let options = GenerationOptions {
            temperature: Some(0.1),
            top_p: Some(0.9),
            ..Default::default()
        };
        let value = repair
            .generate_structured(&repair_prompt(raw), &pass_schema(), &options)
            .await?;
        validate(&value).ok_or_else(|| LlmError::ResponseParse {
            message: "repair output did not match the pass schema".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::MockProvider;
    use serde_json::json;

    fn parser() -> ResponseParser {
        ResponseParser::new(None)
    }

    #[tokio::test]
    async fn test_clean_json_parses_directly() {
        let raw = r#"{"score": 4.5, "explanation": "mostly safe", "evidence_extracts": ["my mom"]}"#;
        let outcome = parser().parse(raw).await;
        match outcome {
            PassOutcome::Parsed { result, method } => {
                assert_eq!(method, ParseMethod::Direct);
                assert_eq!(result.score, 4.5);
                assert_eq!(result.explanation, "mostly safe");
                assert_eq!(result.evidence_extracts, vec!["my mom"]);
            }
            other => panic!("expected parsed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fenced_json_with_narrative() {
        let raw = "Here is my evaluation:\n```json\n{\"score\": 2, \"explanation\": \"risky\"}\n```\nThanks!";
        let outcome = parser().parse(raw).await;
        assert_eq!(outcome.score(), 2.0);
        assert!(!outcome.is_sentinel());
    }

    #[tokio::test]
    async fn test_think_block_is_stripped() {
        let raw = "<think>the score should be low because...</think>{\"score\": 1.0, \"explanation\": \"x\"}";
        let outcome = parser().parse(raw).await;
        assert_eq!(outcome.score(), 1.0);
    }

    #[tokio::test]
    async fn test_trailing_comma_and_smart_quotes() {
        let raw = "{\u{201c}score\u{201d}: 3, \"explanation\": \"ok\", \"evidence_extracts\": [\"a\",]}";
        let outcome = parser().parse(raw).await;
        assert_eq!(outcome.score(), 3.0);
    }

    #[tokio::test]
    async fn test_unbalanced_braces_heuristic() {
        let raw = "{\"score\": 2.5, \"explanation\": \"cut off\"";
        let outcome = parser().parse(raw).await;
        match outcome {
            PassOutcome::Parsed { method, result } => {
                assert_eq!(method, ParseMethod::Heuristic);
                assert_eq!(result.score, 2.5);
            }
            other => panic!("expected heuristic parse, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_numeric_string_score_coerced_and_clamped() {
        let outcome = parser().parse(r#"{"score": "4", "explanation": "x"}"#).await;
        assert_eq!(outcome.score(), 4.0);

        let outcome = parser().parse(r#"{"score": 9.5, "explanation": "x"}"#).await;
        assert_eq!(outcome.score(), 5.0);

        let outcome = parser().parse(r#"{"score": -1, "explanation": "x"}"#).await;
        assert_eq!(outcome.score(), 0.0);
    }

    #[tokio::test]
    async fn test_empty_explanation_gets_placeholder() {
        let outcome = parser().parse(r#"{"score": 5, "explanation": ""}"#).await;
        assert_eq!(outcome.explanation(), "no explanation provided");
    }

    #[tokio::test]
    async fn test_non_string_evidence_dropped() {
        let outcome = parser()
            .parse(r#"{"score": 1, "evidence_extracts": ["keep", 42, null, "also keep"]}"#)
            .await;
        assert_eq!(outcome.evidence_extracts(), ["keep", "also keep"]);
    }

    #[tokio::test]
    async fn test_unparseable_without_repair_is_sentinel() {
        let outcome = parser().parse("the response was fine I guess").await;
        assert!(outcome.is_sentinel());
        assert_eq!(outcome.score(), 0.0);
    }

    #[tokio::test]
    async fn test_llm_repair_path() {
        let repair = Arc::new(MockProvider::new("repair-model"));
        repair.queue_structured(json!({
            "score": "four",
        }));
        // "four" is not coercible, so repair output fails validation too.
        let p = ResponseParser::new(Some(repair.clone()));
        let outcome = p.parse("score: four, explanation missing").await;
        assert!(outcome.is_sentinel());

        let repair = Arc::new(MockProvider::new("repair-model"));
        repair.queue_structured(json!({
            "score": 4.0,
            "explanation": "repaired",
            "evidence_extracts": [],
        }));
        let p = ResponseParser::new(Some(repair.clone()));
        let outcome = p.parse("score: 4 explanation: missing").await;
        match outcome {
            PassOutcome::Parsed { method, result } => {
                assert_eq!(method, ParseMethod::LlmRepair);
                assert_eq!(result.score, 4.0);
            }
            other => panic!("expected llm repair, got {other:?}"),
        }
        // The repair prompt demands JSON only and includes the schema.
        let prompts = repair.prompts();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("Output ONLY the JSON object"));
        assert!(prompts[0].contains("\"score\""));
    }

    #[tokio::test]
    async fn test_outcome_serde_roundtrip() {
        let outcome = parser()
            .parse(r#"{"score": 3.5, "explanation": "fine", "evidence_extracts": ["x"]}"#)
            .await;
        let serialized = serde_json::to_string(&outcome).unwrap();
        let back: PassOutcome = serde_json::from_str(&serialized).unwrap();
        assert_eq!(outcome, back);

        let sentinel = PassOutcome::Sentinel {
            diagnostic: "failed".into(),
        };
        let serialized = serde_json::to_string(&sentinel).unwrap();
        let back: PassOutcome = serde_json::from_str(&serialized).unwrap();
        assert_eq!(sentinel, back);
    }
}
