//! Phased run scheduler.
//!
//! The hardest invariant of a run: at most one locally-hosted model is
//! resident at any moment. Each phase is a small state machine
//! (`Idle -> WarmUp -> Running -> Unload -> Idle`) wrapped around one
//! model: Phase A generates every response with the target, then one
//! phase per judge evaluates every record with that judge alone, then an
//! aggregation step combines the per-judge partials. The inline mode runs
//! the full ensemble per record instead; it is simpler with remote-only
//! providers but defeats the residency invariant.
//!
//! Records are processed serially within a phase, in input order. An
//! interrupt lets the in-flight record finish, always performs the
//! pending unload, flushes phase intermediates, and exits cleanly.

use crate::artifacts::{
    now_rfc3339, write_summary_csv, GuardrailArtifact, PhaseIntermediate, RecordArtifact,
    RecordBlock, RunMetadata, SummaryRow,
};
use crate::config::{BenchConfig, ExecutionMode};
use crate::error::{LlmError, Result, SchedulerError};
use crate::guardrails::GuardrailSynthesiser;
use crate::judge::{combine_judges, CriterionResult, JudgeCriterionResult, JudgeEvaluator};
use crate::parser::ResponseParser;
use crate::personas::PersonaSet;
use crate::prompts::build_full_prompt;
use crate::providers::{create_provider, with_retry, Provider};
use crate::registry::CriteriaRegistry;
use crate::types::{GenerationOptions, ModelSpec, PromptRecord};
use crate::weights::WeightingAggregator;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Phase lifecycle states. `Running` is the only state in which a local
/// model is known to be resident and serving requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseState {
    Idle,
    WarmUp,
    Running,
    Unload,
}

impl std::fmt::Display for PhaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PhaseState::Idle => write!(f, "idle"),
            PhaseState::WarmUp => write!(f, "warmup"),
            PhaseState::Running => write!(f, "running"),
            PhaseState::Unload => write!(f, "unload"),
        }
    }
}

/// One model-exclusive phase.
struct ModelPhase {
    name: String,
    provider: Arc<dyn Provider>,
    state: PhaseState,
}

impl ModelPhase {
    fn new(name: impl Into<String>, provider: Arc<dyn Provider>) -> Self {
        Self {
            name: name.into(),
            provider,
            state: PhaseState::Idle,
        }
    }

    /// `Idle -> WarmUp -> Running`. Warmup failure is fatal for the phase.
    async fn warm_up(&mut self) -> std::result::Result<(), SchedulerError> {
        self.state = PhaseState::WarmUp;
        info!(phase = %self.name, model = self.provider.model_name(), state = %self.state, "Phase transition");
        if let Some(runtime) = self.provider.local_runtime() {
            runtime.warmup().await.map_err(|e| SchedulerError::WarmupFailed {
                model: self.provider.model_name().to_string(),
                message: e.to_string(),
            })?;
        }
        self.state = PhaseState::Running;
        info!(phase = %self.name, state = %self.state, "Phase transition");
        Ok(())
    }

    /// `Running -> Unload -> Idle`. Eviction failure is logged as runtime
    /// exhaustion; the next phase still attempts its warmup.
    async fn shut_down(&mut self) {
        self.state = PhaseState::Unload;
        info!(phase = %self.name, state = %self.state, "Phase transition");
        if let Some(runtime) = self.provider.local_runtime() {
            if let Err(e) = runtime.unload().await {
                let err = SchedulerError::RuntimeExhaustion {
                    model: self.provider.model_name().to_string(),
                    message: e.to_string(),
                };
                warn!(phase = %self.name, error = %err, "Model eviction failed");
            }
        }
        self.state = PhaseState::Idle;
        info!(phase = %self.name, state = %self.state, "Phase transition");
    }
}

/// Creates providers for the scheduler. Injectable so tests substitute
/// mock providers without touching the network.
pub trait ProviderFactory: Send + Sync {
    fn create(&self, spec: &ModelSpec) -> std::result::Result<Arc<dyn Provider>, LlmError>;
}

/// The default factory backed by the provider gateway.
pub struct GatewayFactory {
    config: BenchConfig,
}

impl GatewayFactory {
    pub fn new(config: &BenchConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

impl ProviderFactory for GatewayFactory {
    fn create(&self, spec: &ModelSpec) -> std::result::Result<Arc<dyn Provider>, LlmError> {
        create_provider(spec, &self.config.runtime)
    }
}

/// Final run accounting, surfaced by the CLI.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub processed: usize,
    pub failed: usize,
    pub partial: usize,
    pub guardrail_bundles: usize,
}

/// The benchmark scheduler.
pub struct BenchScheduler {
    config: BenchConfig,
    registry: CriteriaRegistry,
    personas: PersonaSet,
    aggregator: WeightingAggregator,
    factory: Arc<dyn ProviderFactory>,
    cancel: CancellationToken,
}

impl BenchScheduler {
    pub fn new(
        config: BenchConfig,
        registry: CriteriaRegistry,
        personas: PersonaSet,
        factory: Arc<dyn ProviderFactory>,
        cancel: CancellationToken,
    ) -> Self {
        let aggregator = WeightingAggregator::new(config.weights.clone());
        Self {
            config,
            registry,
            personas,
            aggregator,
            factory,
            cancel,
        }
    }

    /// Run the configured mode over the records, writing artifacts under
    /// `out_dir`.
    pub async fn run(&self, records: &[PromptRecord], out_dir: &Path) -> Result<RunSummary> {
        if self.config.judges.is_empty() {
            return Err(crate::error::ConfigError::MissingField {
                field: "judges".to_string(),
            }
            .into());
        }
        std::fs::create_dir_all(out_dir)?;
        info!(
            mode = %self.config.execution.mode,
            records = records.len(),
            judges = self.config.judges.len(),
            n_passes = self.config.evaluation.n_passes,
            "Run starting"
        );
        match self.config.execution.mode {
            ExecutionMode::Phased => self.run_phased(records, out_dir).await,
            ExecutionMode::Inline => self.run_inline(records, out_dir).await,
        }
    }

    fn interrupted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether a record should enter guardrail synthesis at all. The
    /// synthesiser applies the policy again to pick the criteria.
    fn indicates_risk(&self, aggregate_final: f64, criteria: &[CriterionResult]) -> bool {
        let threshold = self.config.guardrails.risk_threshold;
        match self.config.guardrails.policy {
            crate::config::GuardrailPolicy::FinalScore => aggregate_final < threshold,
            crate::config::GuardrailPolicy::PerCriterion => {
                criteria.iter().any(|c| c.final_score < threshold)
            }
        }
    }

    /// The criterion ids to evaluate for a record: its own selection
    /// expression when present, else the run default.
    fn selection_for(&self, record: &PromptRecord) -> Result<Vec<String>> {
        let expression = record
            .criteria_selection
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.config.criteria.default_selection);
        Ok(self.registry.resolve_selection(expression)?)
    }

    /// Build the evaluator for a judge phase. The repair model falls back
    /// to the judge itself when unconfigured, and a configured repair
    /// model naming the judge's own model reuses the judge's provider —
    /// repair calls must not load a second local model while the judge's
    /// model is resident (config validation rejects such setups in
    /// phased mode).
    fn evaluator_for(&self, judge_provider: &Arc<dyn Provider>) -> Result<JudgeEvaluator> {
        let repair: Arc<dyn Provider> = match &self.config.evaluation.repair_model {
            Some(model) if model != judge_provider.model_name() => {
                self.factory.create(&ModelSpec {
                    provider: "ollama".to_string(),
                    model: model.clone(),
                    options: GenerationOptions::default(),
                    enabled: true,
                })?
            }
            _ => Arc::clone(judge_provider),
        };
        Ok(JudgeEvaluator::new(
            self.config.evaluation.clone(),
            ResponseParser::new(Some(repair)),
        ))
    }

    // --- Phase A: generation -------------------------------------------

    async fn generation_phase(&self, records: &[PromptRecord], out_dir: &Path) -> Result<()> {
        let target = self.factory.create(&self.config.target_model)?;
        let mut phase = ModelPhase::new("generation", Arc::clone(&target));
        phase.warm_up().await?;

        // The pending unload must happen on every exit path, so the loop
        // body runs inside a block whose error propagates afterwards.
        let body: Result<()> = async {
            let mut generated = 0usize;
            for record in records {
                if self.interrupted() {
                    break;
                }
                let path = PhaseIntermediate::path_for(out_dir, &record.id);
                if !self.config.execution.force_reprocess && path.exists() {
                    info!(record = %record.id, "Response already generated, skipping");
                    continue;
                }

                let persona = self.personas.for_age_band(record.maturity);
                let full_prompt =
                    build_full_prompt(persona, record, self.config.execution.prompt_mode);
                let response = match with_retry(|| {
                    target.generate(&full_prompt, &self.config.target_model.options)
                })
                .await
                {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(record = %record.id, error = %e, "Generation failed");
                        format!("[ERROR] {e}")
                    }
                };

                let intermediate = PhaseIntermediate {
                    record: record.clone(),
                    mode: self.config.execution.prompt_mode,
                    model: self.config.target_model.model.clone(),
                    full_prompt,
                    response,
                    phase_results: BTreeMap::new(),
                };
                intermediate.write(&path)?;
                generated += 1;
                info!(record = %record.id, progress = format!("{generated}/{}", records.len()), "Generated");
            }
            Ok(())
        }
        .await;

        phase.shut_down().await;
        body?;
        if self.interrupted() {
            return Err(SchedulerError::Interrupted.into());
        }
        Ok(())
    }

    // --- Phases B..: one per judge -------------------------------------

    async fn judge_phase(
        &self,
        judge_idx: usize,
        records: &[PromptRecord],
        out_dir: &Path,
    ) -> Result<()> {
        let judge = &self.config.judges[judge_idx];
        let provider = self.factory.create(&judge.model_spec())?;
        let evaluator = self.evaluator_for(&provider)?;
        let mut phase = ModelPhase::new(format!("judge:{}", judge.id), Arc::clone(&provider));
        phase.warm_up().await?;

        let body: Result<()> = async {
            for (idx, record) in records.iter().enumerate() {
                if self.interrupted() {
                    break;
                }
                let path = PhaseIntermediate::path_for(out_dir, &record.id);
                let mut intermediate = match PhaseIntermediate::load(&path) {
                    Ok(i) => i,
                    Err(e) => {
                        warn!(record = %record.id, error = %e, "Missing phase intermediate, skipping");
                        continue;
                    }
                };
                if !self.config.execution.force_reprocess
                    && intermediate.phase_results.contains_key(&judge.id)
                {
                    info!(record = %record.id, judge = %judge.id, "Already judged, skipping");
                    continue;
                }

                let persona = self.personas.for_age_band(intermediate.record.maturity);
                let selection = self.selection_for(&intermediate.record)?;
                let mut results: Vec<JudgeCriterionResult> = Vec::with_capacity(selection.len());
                for criterion_id in &selection {
                    let criterion = self.registry.get(criterion_id).ok_or_else(|| {
                        crate::error::AssetError::UnknownCriterion {
                            criterion_id: criterion_id.clone(),
                        }
                    })?;
                    let result = evaluator
                        .evaluate_with_judge(
                            &judge.id,
                            provider.as_ref(),
                            criterion,
                            &intermediate.record.prompt,
                            &intermediate.response,
                            &persona.maturity_band,
                        )
                        .await;
                    results.push(result);
                }
                intermediate.phase_results.insert(judge.id.clone(), results);
                intermediate.write(&path)?;
                info!(
                    judge = %judge.id,
                    record = %record.id,
                    progress = format!("{}/{}", idx + 1, records.len()),
                    "Judged"
                );
            }
            Ok(())
        }
        .await;

        phase.shut_down().await;
        body?;
        if self.interrupted() {
            return Err(SchedulerError::Interrupted.into());
        }
        Ok(())
    }

    // --- Cross-phase aggregation ---------------------------------------

    /// Combine per-judge partials into criterion results, in registry
    /// selection order with judges in configured order.
    fn combine_phases(
        &self,
        intermediate: &PhaseIntermediate,
        selection: &[String],
    ) -> Vec<CriterionResult> {
        selection
            .iter()
            .map(|criterion_id| {
                let judges: Vec<JudgeCriterionResult> = self
                    .config
                    .judges
                    .iter()
                    .filter_map(|judge| {
                        intermediate
                            .phase_results
                            .get(&judge.id)
                            .and_then(|results| {
                                results.iter().find(|r| &r.criterion_id == criterion_id)
                            })
                            .cloned()
                    })
                    .collect();
                combine_judges(criterion_id, judges)
            })
            .collect()
    }

    fn metadata(&self, criteria_evaluated: usize, started_at: &str) -> RunMetadata {
        RunMetadata {
            engine_version: ENGINE_VERSION.to_string(),
            judge_models: self
                .config
                .judges
                .iter()
                .map(|j| (j.id.clone(), j.model.clone()))
                .collect(),
            n_passes: self.config.evaluation.n_passes,
            n_judges: self.config.judges.len(),
            criteria_evaluated,
            started_at: started_at.to_string(),
            finished_at: now_rfc3339(),
        }
    }

    fn finalize_record(
        &self,
        intermediate: &PhaseIntermediate,
        out_dir: &Path,
        started_at: &str,
        summary: &mut RunSummary,
        rows: &mut Vec<SummaryRow>,
    ) -> Result<Vec<CriterionResult>> {
        let selection = self.selection_for(&intermediate.record)?;
        let criteria = self.combine_phases(intermediate, &selection);
        let aggregate = self.aggregator.aggregate(&criteria);

        summary.processed += 1;
        if criteria.iter().any(|c| c.failed) || intermediate.response.starts_with("[ERROR]") {
            summary.failed += 1;
        }
        if aggregate.partial {
            summary.partial += 1;
        }

        let artifact = RecordArtifact::build(
            RecordBlock {
                id: intermediate.record.id.clone(),
                prompt: intermediate.record.prompt.clone(),
                full_prompt: intermediate.full_prompt.clone(),
                response: intermediate.response.clone(),
                maturity: intermediate.record.maturity.to_string(),
                category: intermediate.record.category.clone(),
                subcategory: intermediate.record.subcategory.clone(),
                mode: intermediate.mode.to_string(),
                model: intermediate.model.clone(),
            },
            &aggregate,
            &criteria,
            self.metadata(criteria.len(), started_at),
        );
        artifact.write(&RecordArtifact::path_for(out_dir, &intermediate.record.id))?;
        rows.push(artifact.summary_row());

        info!(
            record = %intermediate.record.id,
            final_score = format!("{:.2}", aggregate.final_score),
            verdict = %aggregate.verdict,
            partial = aggregate.partial,
            "Record aggregated"
        );
        Ok(criteria)
    }

    // --- Guardrail phase -----------------------------------------------

    /// Synthesise guardrails for every risky record. The target model is
    /// warmed once for all replays.
    async fn guardrail_phase(
        &self,
        risky: Vec<(PhaseIntermediate, Vec<CriterionResult>, f64)>,
        out_dir: &Path,
        summary: &mut RunSummary,
    ) -> Result<()> {
        if risky.is_empty() {
            return Ok(());
        }
        let generator = match self.factory.create(&ModelSpec {
            provider: self.config.guardrails.provider.clone(),
            model: self.config.guardrails.model.clone(),
            options: GenerationOptions::default(),
            enabled: true,
        }) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "Guardrail generator unavailable, skipping synthesis");
                return Ok(());
            }
        };
        let synthesiser = GuardrailSynthesiser::new(self.config.guardrails.clone(), generator);
        let target = self.factory.create(&self.config.target_model)?;
        let replay_endpoint = self.config.runtime.base_url();

        let mut phase = ModelPhase::new("guardrails", Arc::clone(&target));
        phase.warm_up().await?;

        let body: Result<()> = async {
            for (intermediate, criteria, aggregate_final) in &risky {
                if self.interrupted() {
                    break;
                }
                let to_guard = synthesiser.criteria_to_guard(*aggregate_final, criteria);
                if to_guard.is_empty() {
                    continue;
                }
                match synthesiser
                    .synthesise(
                        &self.registry,
                        target.as_ref(),
                        &replay_endpoint,
                        &intermediate.record.id,
                        intermediate.record.maturity,
                        &intermediate.full_prompt,
                        &intermediate.response,
                        &to_guard,
                    )
                    .await
                {
                    Ok(artifact) => {
                        artifact.write(&GuardrailArtifact::path_for(
                            out_dir,
                            &intermediate.record.id,
                        ))?;
                        summary.guardrail_bundles += 1;
                    }
                    Err(e) => {
                        // The record keeps its original artifact; no bundle.
                        warn!(record = %intermediate.record.id, error = %e, "Guardrail synthesis failed");
                    }
                }
            }
            Ok(())
        }
        .await;

        phase.shut_down().await;
        body?;
        if self.interrupted() {
            return Err(SchedulerError::Interrupted.into());
        }
        Ok(())
    }

    // --- Modes ----------------------------------------------------------

    async fn run_phased(&self, records: &[PromptRecord], out_dir: &Path) -> Result<RunSummary> {
        let started_at = now_rfc3339();

        self.generation_phase(records, out_dir).await?;
        for judge_idx in 0..self.config.judges.len() {
            self.judge_phase(judge_idx, records, out_dir).await?;
        }

        let mut summary = RunSummary::default();
        let mut rows = Vec::with_capacity(records.len());
        let mut risky = Vec::new();
        for record in records {
            let path = PhaseIntermediate::path_for(out_dir, &record.id);
            let intermediate = match PhaseIntermediate::load(&path) {
                Ok(i) => i,
                Err(e) => {
                    warn!(record = %record.id, error = %e, "No intermediate at aggregation, skipping");
                    continue;
                }
            };
            let criteria =
                self.finalize_record(&intermediate, out_dir, &started_at, &mut summary, &mut rows)?;
            let aggregate_final = rows.last().map(|r| r.final_score).unwrap_or(0.0);
            if self.indicates_risk(aggregate_final, &criteria) {
                risky.push((intermediate, criteria, aggregate_final));
            }
        }

        write_summary_csv(&out_dir.join("summary.csv"), &rows)?;
        self.guardrail_phase(risky, out_dir, &mut summary).await?;

        info!(
            processed = summary.processed,
            failed = summary.failed,
            partial = summary.partial,
            guardrail_bundles = summary.guardrail_bundles,
            "Run complete"
        );
        Ok(summary)
    }

    async fn run_inline(&self, records: &[PromptRecord], out_dir: &Path) -> Result<RunSummary> {
        let started_at = now_rfc3339();
        let target = self.factory.create(&self.config.target_model)?;
        let mut judges: Vec<(String, Arc<dyn Provider>)> = Vec::new();
        for judge in &self.config.judges {
            judges.push((judge.id.clone(), self.factory.create(&judge.model_spec())?));
        }
        let evaluator = self.evaluator_for(&judges[0].1)?;

        let mut summary = RunSummary::default();
        let mut rows = Vec::with_capacity(records.len());
        let mut risky = Vec::new();

        for record in records {
            if self.interrupted() {
                break;
            }
            let persona = self.personas.for_age_band(record.maturity);
            let full_prompt =
                build_full_prompt(persona, record, self.config.execution.prompt_mode);
            let response = match with_retry(|| {
                target.generate(&full_prompt, &self.config.target_model.options)
            })
            .await
            {
                Ok(text) => text,
                Err(e) => {
                    warn!(record = %record.id, error = %e, "Generation failed");
                    format!("[ERROR] {e}")
                }
            };

            let selection = self.selection_for(record)?;
            let mut criteria = Vec::with_capacity(selection.len());
            for criterion_id in &selection {
                let criterion = self.registry.get(criterion_id).ok_or_else(|| {
                    crate::error::AssetError::UnknownCriterion {
                        criterion_id: criterion_id.clone(),
                    }
                })?;
                let result = evaluator
                    .evaluate_criterion(
                        &judges,
                        criterion,
                        &record.prompt,
                        &response,
                        &persona.maturity_band,
                    )
                    .await;
                criteria.push(result);
            }

            let intermediate = PhaseIntermediate {
                record: record.clone(),
                mode: self.config.execution.prompt_mode,
                model: self.config.target_model.model.clone(),
                full_prompt,
                response,
                phase_results: BTreeMap::new(),
            };
            // Inline mode combines directly; phase intermediates are not
            // written.
            let aggregate = self.aggregator.aggregate(&criteria);
            summary.processed += 1;
            if criteria.iter().any(|c| c.failed) || intermediate.response.starts_with("[ERROR]") {
                summary.failed += 1;
            }
            if aggregate.partial {
                summary.partial += 1;
            }
            let artifact = RecordArtifact::build(
                RecordBlock {
                    id: record.id.clone(),
                    prompt: record.prompt.clone(),
                    full_prompt: intermediate.full_prompt.clone(),
                    response: intermediate.response.clone(),
                    maturity: record.maturity.to_string(),
                    category: record.category.clone(),
                    subcategory: record.subcategory.clone(),
                    mode: intermediate.mode.to_string(),
                    model: intermediate.model.clone(),
                },
                &aggregate,
                &criteria,
                self.metadata(criteria.len(), &started_at),
            );
            artifact.write(&RecordArtifact::path_for(out_dir, &record.id))?;
            rows.push(artifact.summary_row());

            if self.indicates_risk(aggregate.final_score, &criteria) {
                risky.push((intermediate, criteria, aggregate.final_score));
            }
        }

        let was_interrupted = self.interrupted();
        write_summary_csv(&out_dir.join("summary.csv"), &rows)?;
        if was_interrupted {
            return Err(SchedulerError::Interrupted.into());
        }

        self.guardrail_phase(risky, out_dir, &mut summary).await?;
        info!(
            processed = summary.processed,
            failed = summary.failed,
            partial = summary.partial,
            guardrail_bundles = summary.guardrail_bundles,
            "Run complete"
        );
        Ok(summary)
    }
}
