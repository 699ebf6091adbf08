//! Ollama native API provider.
//!
//! Talks to a local (or tunnelled) Ollama runtime via `/api/generate`.
//! This is the only provider with the local-runtime capability: `warmup`
//! forces a cold load with an extended timeout, `unload` evicts the model
//! by sending a bare request with `keep_alive: 0`.

use crate::config::RuntimeConfig;
use crate::error::LlmError;
use crate::providers::{map_status_error, map_transport_error, LocalRuntime, Provider};
use crate::types::{GenerationOptions, ModelSpec};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

/// Timeout for unload requests. Eviction is cheap; a slow runtime here
/// means the runtime itself is wedged.
const UNLOAD_TIMEOUT_SECS: u64 = 30;

/// Ollama native API provider for locally hosted models.
pub struct OllamaProvider {
    client: Client,
    base_url: String,
    model: String,
    defaults: GenerationOptions,
    default_timeout_secs: u64,
    warmup_timeout_secs: u64,
    keep_alive: String,
}

impl OllamaProvider {
    pub fn new(spec: &ModelSpec, runtime: &RuntimeConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: runtime.base_url(),
            model: spec.model.clone(),
            defaults: spec.options.clone(),
            default_timeout_secs: runtime.request_timeout_secs,
            warmup_timeout_secs: runtime.warmup_timeout_secs,
            keep_alive: runtime.keep_alive.clone(),
        }
    }

    /// Build the `/api/generate` payload from the merged option bag.
    ///
    /// `keep_alive` and `format` are top-level fields in the Ollama API;
    /// everything else nests under `options`.
    fn build_payload(&self, prompt: &str, options: &GenerationOptions, format_json: bool) -> Value {
        let mut payload = json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
        });

        let keep_alive = options
            .keep_alive
            .clone()
            .unwrap_or_else(|| self.keep_alive.clone());
        payload["keep_alive"] = Value::String(keep_alive);
        if format_json {
            payload["format"] = Value::String("json".to_string());
        }

        let mut opts = serde_json::Map::new();
        if let Some(t) = options.temperature {
            opts.insert("temperature".into(), json!(t));
        }
        if let Some(p) = options.top_p {
            opts.insert("top_p".into(), json!(p));
        }
        if let Some(n) = options.num_ctx {
            opts.insert("num_ctx".into(), json!(n));
        }
        if let Some(n) = options.num_batch {
            opts.insert("num_batch".into(), json!(n));
        }
        if let Some(g) = options.main_gpu {
            opts.insert("main_gpu".into(), json!(g));
        }
        if let Some(ref split) = options.tensor_split {
            opts.insert("tensor_split".into(), json!(split));
        }
        if let Some(ref stops) = options.stop_sequences {
            opts.insert("stop".into(), json!(stops));
        }
        if !opts.is_empty() {
            payload["options"] = Value::Object(opts);
        }

        payload
    }

    async fn request(
        &self,
        payload: &Value,
        timeout_secs: u64,
    ) -> Result<String, LlmError> {
        let url = format!("{}/api/generate", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(payload)
            .timeout(Duration::from_secs(timeout_secs))
            .send()
            .await
            .map_err(|e| map_transport_error(e, timeout_secs))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status_error("ollama", status, &body, None));
        }

        let body: Value = response.json().await.map_err(|e| LlmError::ResponseParse {
            message: format!("invalid JSON from Ollama: {e}"),
        })?;
        Ok(body
            .get("response")
            .and_then(|r| r.as_str())
            .unwrap_or("")
            .trim()
            .to_string())
    }

    fn timeout_for(&self, options: &GenerationOptions) -> u64 {
        options.request_timeout.unwrap_or(self.default_timeout_secs)
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    async fn generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<String, LlmError> {
        let merged = self.defaults.merged(options);
        let payload = self.build_payload(prompt, &merged, false);
        let timeout_secs = self.timeout_for(&merged);
        debug!(model = %self.model, timeout_secs, "Ollama generate");
        let text = self.request(&payload, timeout_secs).await?;
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
        _schema: &Value,
        options: &GenerationOptions,
    ) -> Result<Value, LlmError> {
        // Ollama constrains output with JSON mode; the schema is conveyed
        // in the prompt itself.
        let merged = self.defaults.merged(options);
        let payload = self.build_payload(prompt, &merged, true);
        let timeout_secs = self.timeout_for(&merged);
        let text = self.request(&payload, timeout_secs).await?;
        serde_json::from_str(&text).map_err(|e| LlmError::ResponseParse {
            message: format!("Ollama JSON mode returned invalid JSON: {e}"),
        })
    }

    fn provider_name(&self) -> &str {
        "ollama"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn local_runtime(&self) -> Option<&dyn LocalRuntime> {
        Some(self)
    }
}

#[async_trait]
impl LocalRuntime for OllamaProvider {
    async fn warmup(&self) -> Result<(), LlmError> {
        let merged = self.defaults.clone();
        let mut payload = self.build_payload("ok", &merged, false);
        payload["keep_alive"] = Value::String(self.keep_alive.clone());
        info!(model = %self.model, timeout_secs = self.warmup_timeout_secs, "Warming up model");
        self.request(&payload, self.warmup_timeout_secs).await?;
        info!(model = %self.model, "Warmup completed");
        Ok(())
    }

    async fn unload(&self) -> Result<(), LlmError> {
        // A bare generate with keep_alive 0 evicts the model.
        let payload = json!({
            "model": self.model,
            "prompt": "",
            "stream": false,
            "keep_alive": 0,
        });
        info!(model = %self.model, "Unloading model");
        self.request(&payload, UNLOAD_TIMEOUT_SECS).await?;
        Ok(())
    }
}
