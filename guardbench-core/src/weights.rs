//! Hierarchical weighted aggregation.
//!
//! Reduces per-criterion scores through three identically shaped levels:
//! criteria within a subcategory, subcategories within a category, and
//! categories into the final score. Each level computes
//! `Σ(wᵢ·scoreᵢ)/Σ(wᵢ)`; a missing or zero-sum weight map falls back to
//! equal weights and logs a warning so silent misconfiguration stays
//! visible.

use crate::config::WeightsConfig;
use crate::judge::CriterionResult;
use crate::registry::id_parts;
use crate::stats;
use crate::types::Verdict;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// The reduced scores and consistency metrics for one record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedScores {
    /// Final aggregate in [0, 5].
    pub final_score: f64,
    pub verdict: Verdict,
    pub category_scores: BTreeMap<String, f64>,
    /// Keyed `category.subcategory`.
    pub subcategory_scores: BTreeMap<String, f64>,
    /// Mean of all judges' intra-pass variances.
    pub overall_variance: f64,
    /// Mean of the per-criterion agreement scores.
    pub mean_agreement: f64,
    pub outlier_count: usize,
    /// Any criterion was evaluated partially or failed outright. Consumers
    /// use this to tell "safe by evaluation" from "zero by failure".
    pub partial: bool,
}

/// One weighted reduction. `children` pairs a child name with its score;
/// `weights` is the configured map for this scope, if any.
///
/// A child missing from a non-empty map receives an equal share
/// (`1/k`) of the weight rather than dropping out of the reduction.
fn weighted_level(
    children: &[(String, f64)],
    weights: Option<&BTreeMap<String, f64>>,
    level: &str,
    scope: &str,
) -> f64 {
    if children.is_empty() {
        return 0.0;
    }

    let equal_share = 1.0 / children.len() as f64;
    let applied: Vec<f64> = match weights {
        Some(map) => children
            .iter()
            .map(|(name, _)| match map.get(name) {
                Some(weight) => *weight,
                None => {
                    warn!(level, scope, child = %name, "No weight configured, using equal share");
                    equal_share
                }
            })
            .collect(),
        None => vec![0.0; children.len()],
    };

    let total: f64 = applied.iter().sum();
    let score = if total > 0.0 {
        children
            .iter()
            .zip(&applied)
            .map(|((_, score), w)| score * w)
            .sum::<f64>()
            / total
    } else {
        warn!(
            level,
            scope, "Missing or zero-sum weights, falling back to equal weights"
        );
        stats::mean(&children.iter().map(|(_, s)| *s).collect::<Vec<_>>())
    };

    debug!(level, scope, score = format!("{:.3}", score), "Level reduced");
    score.clamp(0.0, 5.0)
}

/// The three-level weighting aggregator.
pub struct WeightingAggregator {
    weights: WeightsConfig,
}

impl WeightingAggregator {
    pub fn new(weights: WeightsConfig) -> Self {
        Self { weights }
    }

    /// Reduce the criterion results for one record.
    pub fn aggregate(&self, results: &[CriterionResult]) -> AggregatedScores {
        // Group criterion scores by (category, subcategory).
        let mut grouped: BTreeMap<(String, String), Vec<(String, f64)>> = BTreeMap::new();
        for result in results {
            let (category, subcategory, name) = id_parts(&result.criterion_id);
            grouped
                .entry((category, subcategory))
                .or_default()
                .push((name, result.final_score));
        }

        // Level 1: criteria -> subcategory.
        let mut subcategory_scores = BTreeMap::new();
        for ((category, subcategory), children) in &grouped {
            let scope = format!("{category}.{subcategory}");
            let score = weighted_level(
                children,
                self.weights.criteria.get(&scope),
                "criteria",
                &scope,
            );
            subcategory_scores.insert(scope, score);
        }

        // Level 2: subcategories -> category.
        let mut by_category: BTreeMap<String, Vec<(String, f64)>> = BTreeMap::new();
        for (scope, score) in &subcategory_scores {
            let (category, subcategory) = scope
                .split_once('.')
                .unwrap_or((scope.as_str(), "default"));
            by_category
                .entry(category.to_string())
                .or_default()
                .push((subcategory.to_string(), *score));
        }
        let mut category_scores = BTreeMap::new();
        for (category, children) in &by_category {
            let score = weighted_level(
                children,
                self.weights.subcategories.get(category),
                "subcategories",
                category,
            );
            category_scores.insert(category.clone(), score);
        }

        // Level 3: categories -> final.
        let children: Vec<(String, f64)> = category_scores
            .iter()
            .map(|(name, score)| (name.clone(), *score))
            .collect();
        let final_score = weighted_level(
            &children,
            Some(&self.weights.categories).filter(|m| !m.is_empty()),
            "categories",
            "final",
        );

        // Consistency metrics across all judges and criteria.
        let all_variances: Vec<f64> = results
            .iter()
            .flat_map(|r| r.judges.iter().map(|j| j.intra_variance))
            .collect();
        let agreements: Vec<f64> = results.iter().map(|r| r.agreement).collect();
        let outlier_count = results.iter().map(|r| r.outliers.len()).sum();
        let partial = results.iter().any(|r| r.partial || r.failed);

        AggregatedScores {
            final_score,
            verdict: Verdict::from_score(final_score),
            category_scores,
            subcategory_scores,
            overall_variance: stats::mean(&all_variances),
            mean_agreement: stats::mean(&agreements),
            outlier_count,
            partial,
        }
    }
}
