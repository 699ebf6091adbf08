//! LLM provider gateway.
//!
//! Provides the `Provider` trait implemented for:
//! - Ollama's native API (locally hosted models, with warmup/unload)
//! - OpenAI-compatible APIs (OpenAI, Groq, Mistral, vLLM, LM Studio)
//! - Anthropic Messages API
//!
//! Use `create_provider()` to instantiate the appropriate provider from a
//! `ModelSpec`. All retryable calls go through `with_retry()`.

pub mod anthropic;
pub mod mock;
pub mod ollama;
pub mod openai_compat;

use crate::config::RuntimeConfig;
use crate::error::LlmError;
use crate::types::{GenerationOptions, ModelSpec};
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub use anthropic::AnthropicProvider;
pub use mock::MockProvider;
pub use ollama::OllamaProvider;
pub use openai_compat::OpenAiCompatProvider;

/// Uniform request surface over LLM backends.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Generate a completion for a single flattened prompt.
    async fn generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<String, LlmError>;

    /// Generate a completion constrained to the given JSON schema and
    /// return the parsed value.
    ///
    /// Each backend uses its own mechanism (OpenAI `response_format`,
    /// Anthropic forced tool call, Ollama JSON mode); callers see one
    /// operation.
    async fn generate_structured(
        &self,
        prompt: &str,
        schema: &Value,
        options: &GenerationOptions,
    ) -> Result<Value, LlmError>;

    /// Provider id ("ollama", "openai", "anthropic", ...).
    fn provider_name(&self) -> &str;

    /// Model name this provider is bound to.
    fn model_name(&self) -> &str;

    /// Local-runtime capability. Only providers that manage a locally
    /// hosted model return `Some`; remote providers have nothing to warm
    /// or evict.
    fn local_runtime(&self) -> Option<&dyn LocalRuntime> {
        None
    }
}

/// Operations available on locally hosted runtimes.
#[async_trait]
pub trait LocalRuntime: Send + Sync {
    /// Force-load the model with a minimal request and an extended timeout.
    async fn warmup(&self) -> Result<(), LlmError>;

    /// Instruct the runtime to evict the model from memory.
    async fn unload(&self) -> Result<(), LlmError>;
}

/// Backoff schedule for transient provider failures, indexed by attempt.
pub const RETRY_BACKOFF_SECS: [u64; 3] = [5, 10, 20];
const MAX_ATTEMPTS: usize = 3;

/// Execute an async provider operation with the gateway retry policy.
///
/// Retries transport, timeout, and rate-limit failures up to three
/// attempts total. Content-shaped failures (`ContentUnavailable`,
/// `ResponseParse`) and auth failures return immediately so the response
/// parser can decide.
pub async fn with_retry<F, Fut, T>(operation: F) -> Result<T, LlmError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let mut last_err = None;
    for attempt in 0..MAX_ATTEMPTS {
        match operation().await {
            Ok(val) => return Ok(val),
            Err(e) => {
                if !e.is_retryable() || attempt + 1 == MAX_ATTEMPTS {
                    return Err(e);
                }
                let wait = backoff_secs(attempt, &e);
                tracing::warn!(
                    attempt = attempt + 1,
                    max = MAX_ATTEMPTS,
                    backoff_secs = wait,
                    error = %e,
                    "Retrying after transient provider error"
                );
                tokio::time::sleep(Duration::from_secs(wait)).await;
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| LlmError::Transport {
        message: "all retry attempts exhausted".to_string(),
    }))
}

/// Wait before the next attempt, respecting a rate-limit hint when it is
/// longer than the scheduled backoff.
fn backoff_secs(attempt: usize, err: &LlmError) -> u64 {
    let scheduled = RETRY_BACKOFF_SECS[attempt.min(RETRY_BACKOFF_SECS.len() - 1)];
    match err {
        LlmError::RateLimited { retry_after_secs } => scheduled.max(*retry_after_secs),
        _ => scheduled,
    }
}

/// Map a reqwest transport error into the gateway taxonomy.
pub(crate) fn map_transport_error(err: reqwest::Error, timeout_secs: u64) -> LlmError {
    if err.is_timeout() {
        LlmError::Timeout { timeout_secs }
    } else {
        LlmError::Transport {
            message: err.to_string(),
        }
    }
}

/// Map a non-success HTTP status into the gateway taxonomy.
///
/// 5xx is a retryable transport failure; 401/403 is an auth failure; 429
/// carries the server's retry hint; everything else is content-shaped and
/// returned without retry.
pub(crate) fn map_status_error(
    provider: &str,
    status: reqwest::StatusCode,
    body: &str,
    retry_after: Option<u64>,
) -> LlmError {
    if status.is_server_error() {
        return LlmError::Transport {
            message: format!("{} returned {}: {}", provider, status, truncate(body, 200)),
        };
    }
    match status.as_u16() {
        401 | 403 => LlmError::AuthFailed {
            provider: provider.to_string(),
        },
        429 => LlmError::RateLimited {
            retry_after_secs: retry_after.unwrap_or(30),
        },
        _ => LlmError::ContentUnavailable {
            message: format!("{} returned {}: {}", provider, status, truncate(body, 200)),
        },
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Create a provider for the given model specification.
///
/// Routes by provider id: `"ollama"` gets the native local-runtime
/// provider (with warmup/unload), `"anthropic"` the Messages API, and
/// everything else the OpenAI-compatible provider.
pub fn create_provider(
    spec: &ModelSpec,
    runtime: &RuntimeConfig,
) -> Result<Arc<dyn Provider>, LlmError> {
    match spec.provider.as_str() {
        "ollama" => Ok(Arc::new(OllamaProvider::new(spec, runtime))),
        "anthropic" => Ok(Arc::new(AnthropicProvider::new(spec)?)),
        _ => Ok(Arc::new(OpenAiCompatProvider::new(spec)?)),
    }
}
