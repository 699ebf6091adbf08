//! Reliable-feedback extraction.
//!
//! Guardrail synthesis trusts only judges that were fully consistent
//! across their passes (intra-pass variance exactly 0), and takes each
//! such judge's last pass as its settled opinion. When no judge is fully
//! consistent, all judges contribute and the feedback is marked
//! low-confidence.

use crate::guardrails::rules::keyword_tokens;
use crate::judge::JudgeCriterionResult;
use std::collections::BTreeSet;

/// One judge's settled feedback on a criterion.
#[derive(Debug, Clone)]
pub struct JudgeFeedback {
    pub judge_id: String,
    pub judge_mean: f64,
    pub pass_index: usize,
    pub pass_score: f64,
    pub explanation: String,
    pub evidence: Vec<String>,
}

/// Feedback for one criterion, possibly low-confidence.
#[derive(Debug, Clone)]
pub struct ReliableFeedback {
    pub items: Vec<JudgeFeedback>,
    /// No judge reached zero variance; every judge was used instead.
    pub low_confidence: bool,
}

fn feedback_from(judge: &JudgeCriterionResult) -> Option<JudgeFeedback> {
    let last = judge.passes.iter().max_by_key(|p| p.index)?;
    Some(JudgeFeedback {
        judge_id: judge.judge_id.clone(),
        judge_mean: judge.mean_score,
        pass_index: last.index,
        pass_score: last.outcome.score(),
        explanation: last.outcome.explanation().trim().to_string(),
        evidence: last.outcome.evidence_extracts().to_vec(),
    })
}

/// Extract reliable feedback from a criterion's judge results.
pub fn extract_reliable_feedback(judges: &[JudgeCriterionResult]) -> ReliableFeedback {
    let consistent: Vec<JudgeFeedback> = judges
        .iter()
        .filter(|j| j.intra_variance == 0.0 && !j.passes.is_empty())
        .filter_map(feedback_from)
        .collect();

    if !consistent.is_empty() {
        return ReliableFeedback {
            items: consistent,
            low_confidence: false,
        };
    }

    ReliableFeedback {
        items: judges.iter().filter_map(feedback_from).collect(),
        low_confidence: true,
    }
}

impl ReliableFeedback {
    /// Render the feedback section of the meta-prompt.
    pub fn to_prompt_text(&self) -> String {
        if self.items.is_empty() {
            return "No judge achieved zero variance across passes. Use the criterion \
                    specification and the prompt/response to infer failure modes."
                .to_string();
        }
        self.items
            .iter()
            .map(|item| {
                let evidence = if item.evidence.is_empty() {
                    "None".to_string()
                } else {
                    item.evidence.join(", ")
                };
                format!(
                    "- Judge {} (mean score {:.2}, last pass #{} score {:.2})\n  Explanation: {}\n  Evidence: {}",
                    item.judge_id,
                    item.judge_mean,
                    item.pass_index,
                    item.pass_score,
                    item.explanation,
                    evidence,
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Keyword set over all explanations and evidence, for coverage
    /// scoring.
    pub fn keywords(&self) -> BTreeSet<String> {
        let mut text = String::new();
        for item in &self.items {
            text.push_str(&item.explanation);
            text.push(' ');
            for chunk in &item.evidence {
                text.push_str(chunk);
                text.push(' ');
            }
        }
        keyword_tokens(&text)
    }
}
