//! Anthropic Messages API provider.
//!
//! Key differences from OpenAI-compatible APIs:
//! - Auth via `x-api-key` header (not `Authorization: Bearer`)
//! - Required `anthropic-version` header
//! - Structured output via a forced tool call carrying the JSON schema

use crate::error::LlmError;
use crate::providers::{map_status_error, map_transport_error, Provider};
use crate::types::{GenerationOptions, ModelSpec};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_TIMEOUT_SECS: u64 = 120;
const MAX_TOKENS: u64 = 2048;

/// The tool name used to force structured output.
const STRUCTURED_TOOL: &str = "emit_structured_output";

/// Anthropic Messages API provider.
pub struct AnthropicProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    defaults: GenerationOptions,
}

impl AnthropicProvider {
    /// Create a provider, reading the API key from `ANTHROPIC_API_KEY`.
    pub fn new(spec: &ModelSpec) -> Result<Self, LlmError> {
        let api_key = std::env::var("ANTHROPIC_API_KEY").map_err(|_| LlmError::AuthFailed {
            provider: "anthropic (env var 'ANTHROPIC_API_KEY' not set)".to_string(),
        })?;
        Ok(Self {
            client: Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key,
            model: spec.model.clone(),
            defaults: spec.options.clone(),
        })
    }

    fn build_body(&self, prompt: &str, options: &GenerationOptions) -> Value {
        let mut body = json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "messages": [{"role": "user", "content": prompt}],
        });
        if let Some(t) = options.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = options.top_p {
            body["top_p"] = json!(p);
        }
        if let Some(ref stops) = options.stop_sequences {
            body["stop_sequences"] = json!(stops);
        }
        body
    }

    async fn request(&self, body: &Value, timeout_secs: u64) -> Result<Value, LlmError> {
        let url = format!("{}/messages", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
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
            return Err(map_status_error("anthropic", status, &text, retry_after));
        }

        response.json().await.map_err(|e| LlmError::ResponseParse {
            message: format!("invalid JSON from anthropic: {e}"),
        })
    }

    /// Concatenate the text content blocks of a messages response.
    fn extract_text(body: &Value) -> String {
        body.get("content")
            .and_then(|c| c.as_array())
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
                    .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default()
            .trim()
            .to_string()
    }

    /// Find the forced tool-use block and return its input.
    fn extract_tool_input(body: &Value) -> Option<Value> {
        body.get("content")
            .and_then(|c| c.as_array())?
            .iter()
            .find(|b| {
                b.get("type").and_then(|t| t.as_str()) == Some("tool_use")
                    && b.get("name").and_then(|n| n.as_str()) == Some(STRUCTURED_TOOL)
            })
            .and_then(|b| b.get("input"))
            .cloned()
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    async fn generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<String, LlmError> {
        let merged = self.defaults.merged(options);
        let body = self.build_body(prompt, &merged);
        let timeout_secs = merged.request_timeout.unwrap_or(DEFAULT_TIMEOUT_SECS);
        debug!(model = %self.model, "Anthropic messages request");
        let response = self.request(&body, timeout_secs).await?;
        let text = Self::extract_text(&response);
        if text.is_empty() {
            return Err(LlmError::ContentUnavailable {
                message: format!("empty completion from {}", self.model),
            });
        }
        Ok(text)
    }

    async fn generate_structured(
        &self,
        prompt: &str,
        schema: &Value,
        options: &GenerationOptions,
    ) -> Result<Value, LlmError> {
        let merged = self.defaults.merged(options);
        let mut body = self.build_body(prompt, &merged);
        body["tools"] = json!([{
            "name": STRUCTURED_TOOL,
            "description": "Return the structured result",
            "input_schema": schema,
        }]);
        body["tool_choice"] = json!({"type": "tool", "name": STRUCTURED_TOOL});
        let timeout_secs = merged.request_timeout.unwrap_or(DEFAULT_TIMEOUT_SECS);
        let response = self.request(&body, timeout_secs).await?;
        Self::extract_tool_input(&response).ok_or_else(|| LlmError::ResponseParse {
            message: "response did not include the forced tool call".to_string(),
        })
    }

    fn provider_name(&self) -> &str {
        "anthropic"
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_provider() -> AnthropicProvider {
        std::env::set_var("ANTHROPIC_API_KEY", "test-key");
        let spec = ModelSpec {
            provider: "anthropic".into(),
            model: "claude-sonnet-4-20250514".into(),
            options: GenerationOptions::default(),
            enabled: true,
        };
        AnthropicProvider::new(&spec).unwrap()
    }

    #[test]
    fn test_body_shape() {
        let p = test_provider();
        let options = GenerationOptions {
            temperature: Some(0.15),
            ..Default::default()
        };
        let body = p.build_body("design guardrails", &options);
        assert_eq!(body["model"], "claude-sonnet-4-20250514");
        assert_eq!(body["max_tokens"], 2048);
        assert_eq!(body["temperature"], 0.15);
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[test]
    fn test_extract_text_joins_blocks() {
        let body = json!({
            "content": [
                {"type": "text", "text": "Hello "},
                {"type": "tool_use", "name": "other", "input": {}},
                {"type": "text", "text": "world"},
            ]
        });
        assert_eq!(AnthropicProvider::extract_text(&body), "Hello world");
    }

    #[test]
    fn test_extract_tool_input() {
        let body = json!({
            "content": [
                {"type": "text", "text": "thinking"},
                {
                    "type": "tool_use",
                    "name": STRUCTURED_TOOL,
                    "input": {"guardrails": []},
                },
            ]
        });
        let input = AnthropicProvider::extract_tool_input(&body).unwrap();
        assert!(input.get("guardrails").is_some());

        let missing = json!({"content": [{"type": "text", "text": "no tools"}]});
        assert!(AnthropicProvider::extract_tool_input(&missing).is_none());
    }
}
