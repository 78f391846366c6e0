//! Inference provider abstraction.
//!
//! Adapters are pure transport: they take an assembled chat request and
//! return raw model text plus usage metadata. Prompt assembly, parsing,
//! validation, retries, and circuit breaking all live in the gateway.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ClassifierError;

/// Chat message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One turn in the conversation sent to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A fully assembled inference request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
    pub max_tokens: u32,
    pub top_p: Option<f64>,
    pub top_k: Option<u32>,
    /// Demand structured JSON output from the adapter.
    pub json_only: bool,
    /// Transport-level timeout for this single call.
    pub timeout: Duration,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: 0.0,
            max_tokens: 512,
            top_p: None,
            top_k: None,
            json_only: true,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Raw model output plus usage metadata.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub text: String,
    pub tokens_used: u32,
    pub duration_ms: u64,
    /// Model tag the adapter actually served, when reported.
    pub model_version: Option<String>,
}

/// Local inference adapter — pure I/O, no business logic.
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    /// Adapter name for logs and audit metadata.
    fn name(&self) -> &str;

    /// Run one chat completion.
    async fn chat(&self, request: CompletionRequest) -> Result<CompletionResponse, ClassifierError>;

    /// Verify the endpoint is reachable and the model is served.
    async fn health_check(&self, model: &str) -> Result<(), ClassifierError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() {
        let req = CompletionRequest::new("qwen2.5:7b", vec![ChatMessage::user("hi")])
            .with_temperature(0.3)
            .with_max_tokens(256)
            .with_timeout(Duration::from_secs(5));
        assert_eq!(req.model, "qwen2.5:7b");
        assert_eq!(req.temperature, 0.3);
        assert_eq!(req.max_tokens, 256);
        assert_eq!(req.timeout, Duration::from_secs(5));
        assert!(req.json_only);
    }

    #[test]
    fn roles_serialize_lowercase() {
        let msg = ChatMessage::assistant("ok");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "assistant");
    }
}
