//! A mock provider for testing and development.
//!
//! Queues canned responses behind a mutex and records every prompt it
//! receives, so tests can assert on both directions of the exchange.

use crate::error::LlmError;
use crate::providers::{LocalRuntime, Provider};
use crate::types::GenerationOptions;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Mock provider with queued responses.
pub struct MockProvider {
    model: String,
    local: bool,
    responses: Mutex<VecDeque<Result<String, LlmError>>>,
    structured: Mutex<VecDeque<Value>>,
    prompts: Mutex<Vec<String>>,
    warmups: AtomicUsize,
    unloads: AtomicUsize,
    fail_unload: bool,
}

impl MockProvider {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            local: false,
            responses: Mutex::new(VecDeque::new()),
            structured: Mutex::new(VecDeque::new()),
            prompts: Mutex::new(Vec::new()),
            warmups: AtomicUsize::new(0),
            unloads: AtomicUsize::new(0),
            fail_unload: false,
        }
    }

    /// Make this mock advertise the local-runtime capability.
    pub fn local(mut self) -> Self {
        self.local = true;
        self
    }

    /// Make `unload` fail, for exercising eviction-failure handling.
    pub fn with_failing_unload(mut self) -> Self {
        self.fail_unload = true;
        self
    }

    /// Queue a text response for the next `generate` call.
    pub fn queue_response(&self, text: &str) {
        self.responses.lock().unwrap().push_back(Ok(text.to_string()));
    }

    /// Queue the same text response `n` times.
    pub fn queue_repeated(&self, text: &str, n: usize) {
        for _ in 0..n {
            self.queue_response(text);
        }
    }

    /// Queue an error for the next `generate` call.
    pub fn queue_error(&self, err: LlmError) {
        self.responses.lock().unwrap().push_back(Err(err));
    }

    /// Queue a value for the next `generate_structured` call.
    pub fn queue_structured(&self, value: Value) {
        self.structured.lock().unwrap().push_back(value);
    }

    /// Prompts received so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn warmup_count(&self) -> usize {
        self.warmups.load(Ordering::SeqCst)
    }

    pub fn unload_count(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn generate(
        &self,
        prompt: &str,
        _options: &GenerationOptions,
    ) -> Result<String, LlmError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        match self.responses.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(format!("mock response from {}", self.model)),
        }
    }

    async fn generate_structured(
        &self,
        prompt: &str,
        _schema: &Value,
        _options: &GenerationOptions,
    ) -> Result<Value, LlmError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.structured
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| LlmError::ContentUnavailable {
                message: "no structured response queued".to_string(),
            })
    }

    fn provider_name(&self) -> &str {
        "mock"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn local_runtime(&self) -> Option<&dyn LocalRuntime> {
        if self.local {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl LocalRuntime for MockProvider {
    async fn warmup(&self) -> Result<(), LlmError> {
        self.warmups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn unload(&self) -> Result<(), LlmError> {
        self.unloads.fetch_add(1, Ordering::SeqCst);
        if self.fail_unload {
            return Err(LlmError::Transport {
                message: "runtime refused to evict".to_string(),
            });
        }
        Ok(())
    }
}
