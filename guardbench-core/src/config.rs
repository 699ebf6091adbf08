//! Configuration system for guardbench.
//!
//! Uses `figment` for layered configuration: built-in defaults -> TOML file
//! -> environment (`GUARDBENCH_`-prefixed, `__`-separated). The extracted
//! config is validated once at startup and read-only for the rest of the
//! run.

use crate::error::ConfigError;
use crate::types::{GenerationOptions, JudgeSpec, ModelSpec, PromptMode};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Top-level configuration for a benchmark run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchConfig {
    /// Ordered list of judges. Order determines phase order and the order
    /// of judge results inside every criterion result.
    pub judges: Vec<JudgeSpec>,
    /// The model under test.
    pub target_model: ModelSpec,
    pub evaluation: EvaluationConfig,
    pub weights: WeightsConfig,
    pub criteria: CriteriaConfig,
    pub guardrails: GuardrailConfig,
    pub execution: ExecutionConfig,
    pub runtime: RuntimeConfig,
    pub assets: AssetsConfig,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            judges: Vec::new(),
            target_model: ModelSpec {
                provider: "ollama".to_string(),
                model: String::new(),
                options: GenerationOptions::default(),
                enabled: true,
            },
            evaluation: EvaluationConfig::default(),
            weights: WeightsConfig::default(),
            criteria: CriteriaConfig::default(),
            guardrails: GuardrailConfig::default(),
            execution: ExecutionConfig::default(),
            runtime: RuntimeConfig::default(),
            assets: AssetsConfig::default(),
        }
    }
}

/// Multi-pass evaluation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    /// Passes per (judge, criterion). Must be >= 1.
    pub n_passes: usize,
    /// Per-pass option overrides, indexed by pass number. Passes beyond the
    /// schedule reuse its last entry, so the evaluator works for any length.
    pub hyperparameters: Vec<GenerationOptions>,
    /// Model used for the parser's single LLM repair call. `None` means
    /// the judge repairs its own output. In phased mode this must match
    /// the model of every locally hosted judge: the repair call fires
    /// while that judge's model is resident, and loading a second local
    /// model would break the single-resident-model invariant.
    pub repair_model: Option<String>,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        let pass = |temperature: f64| GenerationOptions {
            temperature: Some(temperature),
            top_p: Some(0.9),
            ..Default::default()
        };
        Self {
            n_passes: 3,
            // Near-deterministic schedule that still diversifies samples.
            hyperparameters: vec![pass(0.1), pass(0.15), pass(0.2)],
            repair_model: None,
        }
    }
}

impl EvaluationConfig {
    /// Options for a given zero-based pass index.
    pub fn pass_options(&self, pass_idx: usize) -> GenerationOptions {
        match self.hyperparameters.len() {
            0 => GenerationOptions {
                temperature: Some(0.1),
                top_p: Some(0.9),
                ..Default::default()
            },
            len => self.hyperparameters[pass_idx.min(len - 1)].clone(),
        }
    }
}

/// Weight maps for the three aggregation levels. All weights must be
/// non-negative; a missing or zero-sum map at any level falls back to
/// equal weights.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightsConfig {
    /// Category -> weight.
    pub categories: BTreeMap<String, f64>,
    /// Category -> (subcategory -> weight).
    pub subcategories: BTreeMap<String, BTreeMap<String, f64>>,
    /// "category.subcategory" -> (criterion name -> weight).
    pub criteria: BTreeMap<String, BTreeMap<String, f64>>,
}

/// Criteria selection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriteriaConfig {
    /// Run-default selection expression (preset name, category glob, or
    /// comma list). Records may override it.
    pub default_selection: String,
}

impl Default for CriteriaConfig {
    fn default() -> Self {
        Self {
            default_selection: "full_evaluation".to_string(),
        }
    }
}

/// Which records enter guardrail synthesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailPolicy {
    /// Synthesise when the record's final aggregate score is below the
    /// risk threshold.
    #[default]
    FinalScore,
    /// Synthesise for every criterion whose own final score is below the
    /// risk threshold, regardless of the aggregate.
    PerCriterion,
}

/// Guardrail synthesis settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailConfig {
    pub max_rules_per_criterion: usize,
    pub max_total_guardrails: usize,
    pub jaccard_threshold: f64,
    pub length_penalty: f64,
    pub canonical_bonus: f64,
    pub policy: GuardrailPolicy,
    /// Scores below this indicate risk (see `policy`).
    pub risk_threshold: f64,
    /// External LLM used for rule generation.
    pub provider: String,
    pub model: String,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            max_rules_per_criterion: 3,
            max_total_guardrails: 20,
            jaccard_threshold: 0.75,
            length_penalty: 0.002,
            canonical_bonus: 0.5,
            policy: GuardrailPolicy::FinalScore,
            risk_threshold: 3.0,
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
        }
    }
}

/// Run scheduling mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// One model resident at a time: generation phase, then one phase per
    /// judge, then aggregation. The production default.
    #[default]
    Phased,
    /// Full judge ensemble per record. Simpler with remote-only providers,
    /// but defeats the single-resident-model invariant.
    Inline,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Phased => write!(f, "phased"),
            ExecutionMode::Inline => write!(f, "inline"),
        }
    }
}

/// Execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub mode: ExecutionMode,
    pub prompt_mode: PromptMode,
    /// Re-run records whose artifact already exists.
    pub force_reprocess: bool,
    pub output_dir: PathBuf,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Phased,
            prompt_mode: PromptMode::Attack,
            force_reprocess: false,
            output_dir: PathBuf::from("outputs"),
        }
    }
}

/// Local runtime (Ollama) endpoint coordinates and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub host: String,
    pub port: u16,
    /// Extended timeout budget for warmup calls (cold model loads).
    pub warmup_timeout_secs: u64,
    /// Default per-call timeout when the option bag leaves it unset.
    pub request_timeout_secs: u64,
    /// Keep-alive hint sent with warmup and generation calls.
    pub keep_alive: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 11434,
            warmup_timeout_secs: 300,
            request_timeout_secs: 300,
            keep_alive: "15m".to_string(),
        }
    }
}

impl RuntimeConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Locations of criteria and persona assets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetsConfig {
    pub manifest: PathBuf,
    pub rubric_root: PathBuf,
    pub personas: PathBuf,
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            manifest: PathBuf::from("assets/criteria_registry.yml"),
            rubric_root: PathBuf::from("assets/criteria"),
            personas: PathBuf::from("assets/personas.json"),
        }
    }
}

impl BenchConfig {
    /// Validate invariants that figment cannot express.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.judges.is_empty() {
            return Err(ConfigError::MissingField {
                field: "judges".to_string(),
            });
        }
        if self.target_model.model.is_empty() {
            return Err(ConfigError::MissingField {
                field: "target_model.model".to_string(),
            });
        }
        if !self.target_model.enabled {
            return Err(ConfigError::Invalid {
                message: "target_model is disabled".to_string(),
            });
        }
        if self.evaluation.n_passes < 1 {
            return Err(ConfigError::Invalid {
                message: "evaluation.n_passes must be >= 1".to_string(),
            });
        }
        if self.execution.mode == ExecutionMode::Phased {
            if let Some(repair_model) = &self.evaluation.repair_model {
                // A distinct local repair model would be loaded while a
                // judge's model is resident.
                if let Some(judge) = self
                    .judges
                    .iter()
                    .find(|j| j.provider == "ollama" && &j.model != repair_model)
                {
                    return Err(ConfigError::Invalid {
                        message: format!(
                            "evaluation.repair_model '{}' differs from local judge '{}' \
                             model '{}'; in phased mode the repair model must match every \
                             locally hosted judge so only one local model is resident",
                            repair_model, judge.id, judge.model
                        ),
                    });
                }
            }
        }
        let negative = self
            .weights
            .categories
            .values()
            .chain(self.weights.subcategories.values().flat_map(|m| m.values()))
            .chain(self.weights.criteria.values().flat_map(|m| m.values()))
            .any(|w| *w < 0.0);
        if negative {
            return Err(ConfigError::Invalid {
                message: "weights must be non-negative".to_string(),
            });
        }
        if self.guardrails.max_rules_per_criterion == 0 || self.guardrails.max_total_guardrails == 0
        {
            return Err(ConfigError::Invalid {
                message: "guardrail caps must be >= 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Environment variables (`GUARDBENCH_EVALUATION__N_PASSES`, ...)
/// 2. The TOML file at `path` (or `guardbench.toml` in the working
///    directory when `path` is `None` and the file exists)
/// 3. Built-in defaults
pub fn load_config(path: Option<&Path>) -> std::result::Result<BenchConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(BenchConfig::default()));

    match path {
        Some(p) => {
            if !p.exists() {
                return Err(ConfigError::FileNotFound { path: p.into() });
            }
            figment = figment.merge(Toml::file(p));
        }
        None => {
            let default_path = Path::new("guardbench.toml");
            if default_path.exists() {
                figment = figment.merge(Toml::file(default_path));
            }
        }
    }

    figment = figment.merge(Env::prefixed("GUARDBENCH_").split("__"));

    let config: BenchConfig = figment.extract().map_err(|e| ConfigError::ParseError {
        message: e.to_string(),
    })?;
    config.validate()?;
    Ok(config)
}
