//! Error types for the guardbench engine.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering providers, configuration, assets, scheduling, and guardrail
//! synthesis. The top-level error carries the process exit-code mapping.

use std::path::PathBuf;

/// Top-level error type for the guardbench core library.
#[derive(Debug, thiserror::Error)]
pub enum GuardbenchError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Asset error: {0}")]
    Asset(#[from] AssetError),

    #[error("Provider error: {0}")]
    Llm(#[from] LlmError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Guardrail error: {0}")]
    Guardrail(#[from] GuardrailError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GuardbenchError {
    /// Process exit code for this error.
    ///
    /// 1 = configuration, 2 = criteria/persona assets, 3 = unrecoverable
    /// provider or phase failure, 4 = interrupted. IO and serialization
    /// failures surface as configuration problems (bad paths, unwritable
    /// output directories).
    pub fn exit_code(&self) -> i32 {
        match self {
            GuardbenchError::Config(_) => 1,
            GuardbenchError::Io(_) | GuardbenchError::Serialization(_) => 1,
            GuardbenchError::Asset(_) => 2,
            GuardbenchError::Llm(_) | GuardbenchError::Guardrail(_) => 3,
            GuardbenchError::Scheduler(SchedulerError::Interrupted) => 4,
            GuardbenchError::Scheduler(_) => 3,
        }
    }
}

/// Errors from LLM provider interactions.
///
/// `Transport` and `Timeout` are retried by the gateway before being
/// surfaced; `ContentUnavailable` is handed straight back so the response
/// parser can decide what to do with a malformed or empty completion.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Transport failure: {message}")]
    Transport { message: String },

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Content unavailable: {message}")]
    ContentUnavailable { message: String },

    #[error("Response parse error: {message}")]
    ResponseParse { message: String },
}

impl LlmError {
    /// Whether the gateway should retry this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::Transport { .. } | LlmError::Timeout { .. } | LlmError::RateLimited { .. }
        )
    }
}

/// Errors from the configuration system. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// Errors from criteria and persona assets. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    #[error("Criteria manifest not found: {path}")]
    ManifestNotFound { path: PathBuf },

    #[error("Rubric file for criterion '{criterion_id}' not found: {path}")]
    RubricNotFound { criterion_id: String, path: PathBuf },

    #[error("Criterion not in registry: {criterion_id}")]
    UnknownCriterion { criterion_id: String },

    #[error("Selection '{expression}' matched no criteria")]
    EmptySelection { expression: String },

    #[error("Persona file not found: {path}")]
    PersonaFileNotFound { path: PathBuf },

    #[error("Invalid asset: {message}")]
    Invalid { message: String },
}

/// Errors from the phased scheduler.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Warmup failed for model '{model}': {message}")]
    WarmupFailed { model: String, message: String },

    #[error("Local runtime failed to evict model '{model}': {message}")]
    RuntimeExhaustion { model: String, message: String },

    #[error("Phase '{phase}' failed: {message}")]
    PhaseFailed { phase: String, message: String },

    #[error("Run interrupted")]
    Interrupted,
}

/// Errors from guardrail synthesis. A failed record keeps its original
/// artifact; no bundle is emitted.
#[derive(Debug, thiserror::Error)]
pub enum GuardrailError {
    #[error("Guardrail generation failed for record '{record_id}': {message}")]
    GenerationFailed { record_id: String, message: String },

    #[error("No usable guardrails survived validation for record '{record_id}'")]
    NoRules { record_id: String },

    #[error("Replay failed: {message}")]
    ReplayFailed { message: String },
}

/// A type alias for results using the top-level `GuardbenchError`.
pub type Result<T> = std::result::Result<T, GuardbenchError>;
