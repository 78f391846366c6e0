//! Ollama inference adapter.
//!
//! Talks to a local Ollama server over its chat API with JSON format mode.
//! The endpoint must resolve to a loopback address — classification never
//! leaves the machine.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::classifier::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, InferenceProvider,
};
use crate::error::ClassifierError;

/// Ollama HTTP client.
pub struct OllamaProvider {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct ChatApiRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'a str>,
    options: ChatApiOptions,
}

#[derive(Serialize)]
struct ChatApiOptions {
    temperature: f64,
    num_predict: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
}

#[derive(Deserialize)]
struct ChatApiResponse {
    model: Option<String>,
    message: ChatApiMessage,
    #[serde(default)]
    eval_count: u32,
}

#[derive(Deserialize)]
struct ChatApiMessage {
    content: String,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Deserialize)]
struct TagModel {
    name: String,
}

impl OllamaProvider {
    /// Create a client for `base_url`, rejecting non-loopback endpoints.
    pub fn new(base_url: &str) -> Result<Self, ClassifierError> {
        let url: reqwest::Url = base_url
            .parse()
            .map_err(|_| ClassifierError::NonLoopback(base_url.to_string()))?;
        if !is_loopback_host(&url) {
            return Err(ClassifierError::NonLoopback(base_url.to_string()));
        }
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        })
    }
}

fn is_loopback_host(url: &reqwest::Url) -> bool {
    match url.host() {
        Some(url::Host::Domain(d)) => d.eq_ignore_ascii_case("localhost"),
        Some(url::Host::Ipv4(ip)) => ip.is_loopback(),
        Some(url::Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}

#[async_trait]
impl InferenceProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn chat(&self, request: CompletionRequest) -> Result<CompletionResponse, ClassifierError> {
        let body = ChatApiRequest {
            model: &request.model,
            messages: &request.messages,
            stream: false,
            format: request.json_only.then_some("json"),
            options: ChatApiOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
                top_p: request.top_p,
                top_k: request.top_k,
            },
        };

        let started = Instant::now();
        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, request.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClassifierError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatApiResponse = response
            .json()
            .await
            .map_err(|e| ClassifierError::Transport(format!("malformed adapter response: {e}")))?;

        let duration_ms = started.elapsed().as_millis() as u64;
        debug!(
            model = %request.model,
            duration_ms,
            eval_count = parsed.eval_count,
            "Inference call completed"
        );

        Ok(CompletionResponse {
            text: parsed.message.content,
            tokens_used: parsed.eval_count,
            duration_ms,
            model_version: parsed.model,
        })
    }

    async fn health_check(&self, model: &str) -> Result<(), ClassifierError> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, Duration::from_secs(5)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClassifierError::Http {
                status: status.as_u16(),
                body: String::new(),
            });
        }

        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|e| ClassifierError::Transport(format!("malformed tags response: {e}")))?;

        if tags.models.iter().any(|m| m.name == model) {
            Ok(())
        } else {
            Err(ClassifierError::Transport(format!(
                "model {model} not served by endpoint"
            )))
        }
    }
}

fn map_reqwest_error(e: reqwest::Error, timeout: Duration) -> ClassifierError {
    if e.is_timeout() {
        ClassifierError::Timeout { timeout }
    } else {
        ClassifierError::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_loopback_endpoints() {
        assert!(OllamaProvider::new("http://127.0.0.1:11434").is_ok());
        assert!(OllamaProvider::new("http://localhost:11434").is_ok());
        assert!(OllamaProvider::new("http://[::1]:11434").is_ok());
    }

    #[test]
    fn rejects_remote_endpoints() {
        for bad in [
            "http://example.com:11434",
            "http://10.0.0.5:11434",
            "http://192.168.1.2",
            "not a url",
        ] {
            assert!(
                matches!(OllamaProvider::new(bad), Err(ClassifierError::NonLoopback(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn chat_request_serializes_json_format() {
        let req = ChatApiRequest {
            model: "qwen2.5:7b",
            messages: &[ChatMessage::user("classify")],
            stream: false,
            format: Some("json"),
            options: ChatApiOptions {
                temperature: 0.1,
                num_predict: 512,
                top_p: None,
                top_k: None,
            },
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["format"], "json");
        assert_eq!(v["stream"], false);
        assert_eq!(v["options"]["num_predict"], 512);
        assert!(v["options"].get("top_p").is_none());
    }
}
