//! OpenAI-compatible chat completions provider.
//!
//! Covers OpenAI, Groq, Mistral, and any endpoint following the chat
//! completions format (vLLM, LM Studio). Structured output uses
//! `response_format` with an inline JSON schema.

use crate::error::LlmError;
use crate::providers::{map_status_error, map_transport_error, Provider};
use crate::types::{GenerationOptions, ModelSpec};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Known OpenAI-compatible endpoints by provider id.
fn endpoint_for(provider: &str) -> (&'static str, &'static str) {
    match provider {
        "groq" => ("https://api.groq.com/openai/v1", "GROQ_API_KEY"),
        "mistral" => ("https://api.mistral.ai/v1", "MISTRAL_API_KEY"),
        _ => ("https://api.openai.com/v1", "OPENAI_API_KEY"),
    }
}

/// OpenAI-compatible provider.
pub struct OpenAiCompatProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    provider: String,
    defaults: GenerationOptions,
}

impl OpenAiCompatProvider {
    /// Create a provider, resolving the API key from the provider's
    /// conventional environment variable.
    pub fn new(spec: &ModelSpec) -> Result<Self, LlmError> {
        let (base_url, key_env) = endpoint_for(&spec.provider);
        let api_key = std::env::var(key_env).map_err(|_| LlmError::AuthFailed {
            provider: format!("{} (env var '{}' not set)", spec.provider, key_env),
        })?;
        Ok(Self {
            client: Client::new(),
            base_url: base_url.to_string(),
            api_key,
            model: spec.model.clone(),
            provider: spec.provider.clone(),
            defaults: spec.options.clone(),
        })
    }

    fn build_body(&self, prompt: &str, options: &GenerationOptions) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
        });
        if let Some(t) = options.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = options.top_p {
            body["top_p"] = json!(p);
        }
        if let Some(ref stops) = options.stop_sequences {
            body["stop"] = json!(stops);
        }
        body
    }

    async fn request(&self, body: &Value, timeout_secs: u64) -> Result<Value, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body)
            .timeout(Duration::from_secs(timeout_secs))
            .send()
            .await
            .map_err(|e| map_transport_error(e, timeout_secs))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            let text = response.text().await.unwrap_or_default();
            return Err(map_status_error(&self.provider, status, &text, retry_after));
        }

        response.json().await.map_err(|e| LlmError::ResponseParse {
            message: format!("invalid JSON from {}: {e}", self.provider),
        })
    }

    fn extract_content(&self, body: &Value) -> Result<String, LlmError> {
        let content = body
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        if content.is_empty() {
            return Err(LlmError::ContentUnavailable {
                message: format!("empty completion from {}", self.model),
            });
        }
        Ok(content)
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    async fn generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<String, LlmError> {
        let merged = self.defaults.merged(options);
        let body = self.build_body(prompt, &merged);
        let timeout_secs = merged.request_timeout.unwrap_or(DEFAULT_TIMEOUT_SECS);
        debug!(model = %self.model, provider = %self.provider, "Chat completion request");
        let response = self.request(&body, timeout_secs).await?;
        self.extract_content(&response)
    }

    async fn generate_structured(
        &self,
        prompt: &str,
        schema: &Value,
        options: &GenerationOptions,
    ) -> Result<Value, LlmError> {
        let merged = self.defaults.merged(options);
        let mut body = self.build_body(prompt, &merged);
        body["response_format"] = json!({
            "type": "json_schema",
            "json_schema": {
                "name": "structured_output",
                "schema": schema,
                "strict": true,
            }
        });
        let timeout_secs = merged.request_timeout.unwrap_or(DEFAULT_TIMEOUT_SECS);
        let response = self.request(&body, timeout_secs).await?;
        let content = self.extract_content(&response)?;
        serde_json::from_str(&content).map_err(|e| LlmError::ResponseParse {
            message: format!("structured output was not valid JSON: {e}"),
        })
    }

    fn provider_name(&self) -> &str {
        &self.provider
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
