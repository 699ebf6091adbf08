//! Flat-file artifacts: per-record JSON, guardrail bundles, phase
//! intermediates, and the consolidated CSV.
//!
//! A record's final artifact is written exactly once, complete; partial
//! state lives only in phase-scoped intermediates. Column order in the CSV
//! is stable across runs.

use crate::error::Result;
use crate::judge::{CriterionResult, JudgeCriterionResult, PassResult};
use crate::parser::{ParseMethod, PassOutcome};
use crate::types::{PromptMode, PromptRecord, Verdict};
use crate::weights::AggregatedScores;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Identity block of the record artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordBlock {
    pub id: String,
    pub prompt: String,
    pub full_prompt: String,
    pub response: String,
    pub maturity: String,
    pub category: String,
    pub subcategory: String,
    pub mode: String,
    pub model: String,
}

/// One judge pass, flattened for the artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassBlock {
    pub index: usize,
    pub score: f64,
    pub explanation: String,
    pub evidence_extracts: Vec<String>,
    pub raw: String,
    /// False when this pass degraded to the sentinel.
    pub parsed: bool,
    pub method: Option<ParseMethod>,
}

impl From<&PassResult> for PassBlock {
    fn from(pass: &PassResult) -> Self {
        let method = match &pass.outcome {
            PassOutcome::Parsed { method, .. } => Some(*method),
            PassOutcome::Sentinel { .. } => None,
        };
        Self {
            index: pass.index,
            score: pass.outcome.score(),
            explanation: pass.outcome.explanation().to_string(),
            evidence_extracts: pass.outcome.evidence_extracts().to_vec(),
            raw: pass.raw.clone(),
            parsed: !pass.outcome.is_sentinel(),
            method,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeBlock {
    pub judge_id: String,
    pub model: String,
    pub mean_score: f64,
    pub intra_variance: f64,
    pub duration_ms: u64,
    pub passes: Vec<PassBlock>,
}

impl From<&JudgeCriterionResult> for JudgeBlock {
    fn from(judge: &JudgeCriterionResult) -> Self {
        Self {
            judge_id: judge.judge_id.clone(),
            model: judge.model.clone(),
            mean_score: judge.mean_score,
            intra_variance: judge.intra_variance,
            duration_ms: judge.duration_ms,
            passes: judge.passes.iter().map(PassBlock::from).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriterionBlock {
    pub criterion_id: String,
    pub final_score: f64,
    pub intra_variance: f64,
    pub agreement: f64,
    pub outliers: Vec<String>,
    pub partial: bool,
    pub failed: bool,
    pub judges: Vec<JudgeBlock>,
}

impl From<&CriterionResult> for CriterionBlock {
    fn from(result: &CriterionResult) -> Self {
        Self {
            criterion_id: result.criterion_id.clone(),
            final_score: result.final_score,
            intra_variance: result.intra_variance,
            agreement: result.agreement,
            outliers: result.outliers.clone(),
            partial: result.partial,
            failed: result.failed,
            judges: result.judges.iter().map(JudgeBlock::from).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateBlock {
    pub final_score: f64,
    pub verdict: Verdict,
    pub category_scores: BTreeMap<String, f64>,
    pub subcategory_scores: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistencyBlock {
    pub overall_variance: f64,
    pub mean_agreement: f64,
    pub outlier_count: usize,
    /// Distinguishes "safe by evaluation" from "zero by failure".
    pub partial: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub engine_version: String,
    pub judge_models: BTreeMap<String, String>,
    pub n_passes: usize,
    pub n_judges: usize,
    pub criteria_evaluated: usize,
    pub started_at: String,
    pub finished_at: String,
}

/// The per-record output artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordArtifact {
    pub record: RecordBlock,
    pub aggregate: AggregateBlock,
    pub consistency: ConsistencyBlock,
    pub criteria: Vec<CriterionBlock>,
    pub metadata: RunMetadata,
}

impl RecordArtifact {
    pub fn build(
        record: RecordBlock,
        aggregate: &AggregatedScores,
        criteria: &[CriterionResult],
        metadata: RunMetadata,
    ) -> Self {
        Self {
            record,
            aggregate: AggregateBlock {
                final_score: aggregate.final_score,
                verdict: aggregate.verdict,
                category_scores: aggregate.category_scores.clone(),
                subcategory_scores: aggregate.subcategory_scores.clone(),
            },
            consistency: ConsistencyBlock {
                overall_variance: aggregate.overall_variance,
                mean_agreement: aggregate.mean_agreement,
                outlier_count: aggregate.outlier_count,
                partial: aggregate.partial,
            },
            criteria: criteria.iter().map(CriterionBlock::from).collect(),
            metadata,
        }
    }

    pub fn path_for(dir: &Path, record_id: &str) -> PathBuf {
        dir.join(format!("record_{}.json", sanitize(record_id)))
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        write_json(path, self)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn summary_row(&self) -> SummaryRow {
        SummaryRow {
            id: self.record.id.clone(),
            model: self.record.model.clone(),
            prompt: self.record.prompt.clone(),
            final_score: self.aggregate.final_score,
            verdict: self.aggregate.verdict,
            category_scores: self.aggregate.category_scores.clone(),
        }
    }
}

/// One synthesised rule inside a guardrail bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailEntry {
    /// `<criterion_id>#<n>`.
    pub id: String,
    pub criterion_id: String,
    pub rule: String,
    pub rationale: Option<String>,
    pub rank_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationInfo {
    pub provider: String,
    pub model: String,
    pub replay_endpoint: String,
    pub guardrail_count: usize,
    /// No judge reached zero variance; feedback came from all judges.
    pub low_confidence: bool,
    /// Extension point: callers may fill these by re-judging the replay.
    pub replay_evaluation: ReplayEvaluation,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplayEvaluation {
    pub before: Option<f64>,
    pub after: Option<f64>,
    pub delta: Option<f64>,
}

/// The before/after guardrail artifact for one record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailArtifact {
    pub record_id: String,
    pub full_prompt: String,
    pub full_prompt_with_guardrails: String,
    pub response: String,
    pub response_with_guardrails: Option<String>,
    pub guardrails: Vec<GuardrailEntry>,
    pub generation: GenerationInfo,
}

impl GuardrailArtifact {
    pub fn path_for(dir: &Path, record_id: &str) -> PathBuf {
        dir.join(format!("guardrails_{}.json", sanitize(record_id)))
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        write_json(path, self)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Phase-scoped intermediate for one record: the generated response plus
/// per-judge results accumulated across judge phases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseIntermediate {
    pub record: PromptRecord,
    pub mode: PromptMode,
    pub model: String,
    pub full_prompt: String,
    pub response: String,
    #[serde(default)]
    pub phase_results: BTreeMap<String, Vec<JudgeCriterionResult>>,
}

impl PhaseIntermediate {
    pub fn path_for(dir: &Path, record_id: &str) -> PathBuf {
        dir.join(format!("phase_{}.json", sanitize(record_id)))
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        write_json(path, self)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// One row of the consolidated CSV.
#[derive(Debug, Clone)]
pub struct SummaryRow {
    pub id: String,
    pub model: String,
    pub prompt: String,
    pub final_score: f64,
    pub verdict: Verdict,
    pub category_scores: BTreeMap<String, f64>,
}

/// Write the consolidated CSV: fixed identity columns, then one
/// `category_<name>` column per category in sorted order.
pub fn write_summary_csv(path: &Path, rows: &[SummaryRow]) -> Result<()> {
    let mut categories: Vec<String> = rows
        .iter()
        .flat_map(|r| r.category_scores.keys().cloned())
        .collect();
    categories.sort_unstable();
    categories.dedup();

    let mut writer = csv::Writer::from_path(path).map_err(|e| {
        std::io::Error::new(std::io::ErrorKind::Other, format!("csv open failed: {e}"))
    })?;

    let mut header = vec![
        "id".to_string(),
        "model".to_string(),
        "prompt".to_string(),
        "final_score".to_string(),
        "verdict".to_string(),
    ];
    header.extend(categories.iter().map(|c| format!("category_{c}")));
    writer.write_record(&header).map_err(csv_io_error)?;

    for row in rows {
        let mut fields = vec![
            row.id.clone(),
            row.model.clone(),
            row.prompt.clone(),
            format!("{:.3}", row.final_score),
            row.verdict.to_string(),
        ];
        for category in &categories {
            fields.push(
                row.category_scores
                    .get(category)
                    .map(|s| format!("{s:.3}"))
                    .unwrap_or_default(),
            );
        }
        writer.write_record(&fields).map_err(csv_io_error)?;
    }
    writer.flush()?;
    debug!(path = %path.display(), rows = rows.len(), "Summary CSV written");
    Ok(())
}

fn csv_io_error(e: csv::Error) -> crate::error::GuardbenchError {
    std::io::Error::new(std::io::ErrorKind::Other, format!("csv write failed: {e}")).into()
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut body = serde_json::to_string_pretty(value)?;
    body.push('\n');
    std::fs::write(path, body)?;
    Ok(())
}

fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Current UTC timestamp in RFC 3339.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
