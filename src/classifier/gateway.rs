//! Classifier gateway — the only path to the inference endpoint.
//!
//! Assembles prompts, demands structured JSON output, validates responses
//! against the profile's schema, retries with capped exponential backoff,
//! and routes every call through the shared circuit breaker. The model's
//! prose never influences an action: output either validates or the call
//! fails with a typed error.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::classifier::breaker::{BreakerTransition, CircuitBreaker};
use crate::classifier::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, InferenceProvider,
};
use crate::config::ClassifierConfig;
use crate::error::ClassifierError;
use crate::message::{ActionKind, ClassificationResponse, Payload};
use crate::profile::ResolvedProfile;

/// Invariant suffix appended to every effective system prompt.
const JSON_ONLY_SUFFIX: &str = "Respond with a single JSON object matching the schema. \
     Emit no prose, no code fences, no commentary.";

/// Retry backoff: base 1 s, doubling, ±20 % jitter.
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_JITTER: f64 = 0.2;

/// Gateway over a local inference adapter.
pub struct ClassifierGateway {
    provider: Arc<dyn InferenceProvider>,
    breaker: CircuitBreaker,
    config: ClassifierConfig,
}

impl ClassifierGateway {
    pub fn new(provider: Arc<dyn InferenceProvider>, config: ClassifierConfig) -> Self {
        let breaker = CircuitBreaker::new(config.breaker.clone());
        Self {
            provider,
            breaker,
            config,
        }
    }

    /// Classify one payload with one profile.
    ///
    /// `deadline` is the caller's budget and always wins; the profile's
    /// per-call timeout caps each individual attempt from above. No retry
    /// extends past the deadline, and cancellation stops retrying
    /// immediately.
    pub async fn classify(
        &self,
        profile: &ResolvedProfile,
        payload: &Payload,
        deadline: Instant,
        cancel: &CancelToken,
    ) -> Result<ClassificationResponse, ClassifierError> {
        self.breaker.acquire()?;

        let result = self.classify_attempts(profile, payload, deadline, cancel).await;

        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(e) if counts_as_breaker_failure(e) => self.breaker.record_failure(),
            Err(_) => {}
        }
        result
    }

    async fn classify_attempts(
        &self,
        profile: &ResolvedProfile,
        payload: &Payload,
        deadline: Instant,
        cancel: &CancelToken,
    ) -> Result<ClassificationResponse, ClassifierError> {
        let attempt_cap = self.config.request_timeout_secs;
        let per_attempt = profile
            .params
            .timeout
            .min(Duration::from_secs(attempt_cap));

        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(ClassifierError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ClassifierError::Cancelled);
            }
            let call_timeout = per_attempt.min(deadline - now);

            let request = assemble_request(profile, payload, call_timeout);
            let call = self.provider.chat(request);
            let outcome = tokio::select! {
                _ = cancel.cancelled() => Err(ClassifierError::Cancelled),
                r = tokio::time::timeout(call_timeout, call) => match r {
                    Ok(inner) => inner,
                    Err(_) => Err(ClassifierError::Timeout { timeout: call_timeout }),
                },
            };

            let error = match outcome {
                Ok(response) => {
                    match parse_and_validate(profile, &response) {
                        Ok(classified) => {
                            debug!(
                                profile = %profile.id,
                                message = %payload.message_id,
                                action = %classified.action,
                                confidence = classified.confidence,
                                duration_ms = classified.duration_ms,
                                "Classification completed"
                            );
                            return Ok(classified);
                        }
                        Err(reason) => {
                            warn!(
                                profile = %profile.id,
                                message = %payload.message_id,
                                %reason,
                                "Classifier response failed schema validation"
                            );
                            ClassifierError::Schema(reason)
                        }
                    }
                }
                Err(ClassifierError::Cancelled) => return Err(ClassifierError::Cancelled),
                Err(e) => e,
            };

            attempt += 1;
            if attempt > self.config.max_retries {
                return Err(error);
            }

            let backoff = backoff_with_jitter(attempt);
            if Instant::now() + backoff >= deadline {
                return Err(error);
            }
            debug!(
                profile = %profile.id,
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                "Retrying classification"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(ClassifierError::Cancelled),
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    /// Verify the endpoint serves the configured default model.
    pub async fn health_check(&self) -> Result<(), ClassifierError> {
        self.provider.health_check(&self.config.default_model).await
    }

    pub fn breaker_state(&self) -> crate::classifier::breaker::BreakerState {
        self.breaker.state()
    }

    /// Drain breaker transitions for audit recording.
    pub fn drain_breaker_transitions(&self) -> Vec<BreakerTransition> {
        self.breaker.drain_transitions()
    }
}

/// Whether an error trips the breaker: transport, timeout, HTTP ≥ 500, or a
/// final schema error after retries.
fn counts_as_breaker_failure(e: &ClassifierError) -> bool {
    match e {
        ClassifierError::Transport(_)
        | ClassifierError::Timeout { .. }
        | ClassifierError::Schema(_) => true,
        ClassifierError::Http { status, .. } => *status >= 500,
        _ => false,
    }
}

fn backoff_with_jitter(attempt: u32) -> Duration {
    let base = BACKOFF_BASE.as_secs_f64() * 2f64.powi(attempt.saturating_sub(1) as i32);
    let jitter = rand::thread_rng().gen_range(1.0 - BACKOFF_JITTER..=1.0 + BACKOFF_JITTER);
    Duration::from_secs_f64(base * jitter)
}

// ── Prompt assembly ─────────────────────────────────────────────────

fn assemble_request(
    profile: &ResolvedProfile,
    payload: &Payload,
    timeout: Duration,
) -> CompletionRequest {
    let mut messages =
        Vec::with_capacity(2 + profile.fewshot.len() * 2);
    messages.push(ChatMessage::system(format!(
        "{}\n\n{}",
        profile.system, JSON_ONLY_SUFFIX
    )));
    for example in &profile.fewshot {
        messages.push(ChatMessage::user(example.input.clone()));
        messages.push(ChatMessage::assistant(example.output.clone()));
    }
    let payload_json =
        serde_json::to_string(payload).unwrap_or_else(|_| "{}".to_string());
    messages.push(ChatMessage::user(payload_json));

    let mut request = CompletionRequest::new(profile.model.clone(), messages)
        .with_temperature(profile.params.temperature)
        .with_max_tokens(profile.params.max_tokens)
        .with_timeout(timeout);
    request.top_p = profile.params.top_p;
    request.top_k = profile.params.top_k;
    request
}

// ── Response parsing ────────────────────────────────────────────────

/// Parse cascade, first success wins: raw JSON, then the substring between
/// the first `{` and the last `}`, then the same after stripping a fenced
/// block.
fn extract_json(text: &str) -> Result<serde_json::Value, String> {
    if let Ok(v) = serde_json::from_str(text) {
        return Ok(v);
    }
    if let Some(v) = brace_slice(text) {
        return Ok(v);
    }
    let stripped = strip_fences(text);
    if let Ok(v) = serde_json::from_str(stripped) {
        return Ok(v);
    }
    if let Some(v) = brace_slice(stripped) {
        return Ok(v);
    }
    Err("no JSON object found in model output".to_string())
}

fn brace_slice(text: &str) -> Option<serde_json::Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if start >= end {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

/// Drop a leading/trailing ``` fence (with optional language tag). A
/// truncated response missing the closing fence keeps everything after the
/// opening one.
fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(after_open) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match after_open.find('\n') {
        Some(nl) => &after_open[nl + 1..],
        None => after_open,
    };
    match body.rfind("```") {
        Some(close) => body[..close].trim(),
        None => body.trim(),
    }
}

/// Validate a parsed object against the profile's response schema and build
/// the typed response. Unknown extra fields are preserved in `raw` but
/// never fail validation.
fn parse_and_validate(
    profile: &ResolvedProfile,
    response: &CompletionResponse,
) -> Result<ClassificationResponse, String> {
    let value = extract_json(&response.text)?;
    let serde_json::Value::Object(map) = value else {
        return Err("model output is not a JSON object".to_string());
    };

    for field in &profile.validation.required_fields {
        if !map.contains_key(field) {
            return Err(format!("missing required field '{field}'"));
        }
    }

    let action_token = map
        .get("action")
        .and_then(|v| v.as_str())
        .ok_or_else(|| "field 'action' must be a string".to_string())?;
    let action = ActionKind::parse(action_token)
        .ok_or_else(|| format!("unknown action token '{action_token}'"))?;
    if !profile.validation.action_allowed(&action) {
        return Err(format!(
            "action '{action_token}' not in allowed set {:?}",
            profile.validation.allowed_actions
        ));
    }

    let confidence = map
        .get("confidence")
        .and_then(|v| v.as_f64())
        .ok_or_else(|| "field 'confidence' must be a number".to_string())?;
    let [lo, hi] = profile.validation.confidence_range;
    if confidence < lo || confidence > hi {
        return Err(format!(
            "confidence {confidence} outside allowed range [{lo}, {hi}]"
        ));
    }

    let reasons = match map.get("reasons") {
        None => Vec::new(),
        Some(serde_json::Value::Array(items)) => {
            let mut reasons = Vec::with_capacity(items.len());
            for item in items {
                match item.as_str() {
                    Some(s) => reasons.push(s.to_string()),
                    None => return Err("field 'reasons' must be an array of strings".to_string()),
                }
            }
            if reasons.len() > profile.validation.max_reasons {
                return Err(format!(
                    "{} reasons exceed the maximum of {}",
                    reasons.len(),
                    profile.validation.max_reasons
                ));
            }
            reasons
        }
        Some(_) => return Err("field 'reasons' must be an array".to_string()),
    };

    let object_field = |name: &str| -> Result<serde_json::Map<String, serde_json::Value>, String> {
        match map.get(name) {
            None => Ok(serde_json::Map::new()),
            Some(serde_json::Value::Object(m)) => Ok(m.clone()),
            Some(_) => Err(format!("field '{name}' must be an object")),
        }
    };
    let features = object_field("features")?;
    let risk_factors = object_field("risk_factors")?;

    let known = ["action", "confidence", "reasons", "features", "risk_factors"];
    let raw: serde_json::Map<String, serde_json::Value> = map
        .iter()
        .filter(|(k, _)| !known.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Ok(ClassificationResponse {
        profile_id: profile.id.clone(),
        action,
        confidence,
        reasons,
        features,
        risk_factors,
        raw,
        duration_ms: response.duration_ms,
        model_version: response.model_version.clone(),
    })
}
