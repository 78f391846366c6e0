//! Core data model — messages, classification payloads, responses, decisions.
//!
//! `Message` is what the mailbox adapter delivers. `Payload` is the bounded,
//! serializable view the classifier sees — nothing else ever reaches the
//! model. `Decision` is the single reconciled verdict for one message.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ── Inbound message ─────────────────────────────────────────────────

/// A hydrated mailbox message. Immutable for the duration of a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Provider-native message id.
    pub id: String,
    /// Thread the message belongs to.
    pub thread_id: String,
    /// Canonical headers (From, Reply-To, Return-Path, List-Id,
    /// Authentication-Results, Precedence, Auto-Submitted, Date).
    pub headers: BTreeMap<String, String>,
    /// Subject line.
    pub subject: String,
    /// Plain-text body.
    pub body: String,
    /// HTML body, when the message carries one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_html: Option<String>,
    /// Labels currently on the message.
    pub labels: Vec<String>,
    /// Total message size in bytes.
    pub size: u64,
    /// Attachment descriptors.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    /// Number of messages in the thread.
    #[serde(default)]
    pub thread_length: u32,
    /// When the message was received.
    pub date: DateTime<Utc>,
}

/// An attachment descriptor. Content is never fetched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
}

// ── Authentication verdicts ─────────────────────────────────────────

/// Outcome of one authentication mechanism parsed from
/// Authentication-Results. Absent tokens are `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthVerdict {
    Pass,
    Fail,
    #[default]
    None,
    Softfail,
}

impl AuthVerdict {
    pub fn parse(token: &str) -> Self {
        match token.to_ascii_lowercase().as_str() {
            "pass" => Self::Pass,
            "fail" => Self::Fail,
            "softfail" => Self::Softfail,
            _ => Self::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::None => "none",
            Self::Softfail => "softfail",
        }
    }
}

/// The three verdict slots the extractor fills.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResults {
    pub spf: AuthVerdict,
    pub dkim: AuthVerdict,
    pub dmarc: AuthVerdict,
}

impl AuthResults {
    /// True iff any mechanism failed outright.
    pub fn any_failed(&self) -> bool {
        [self.spf, self.dkim, self.dmarc]
            .iter()
            .any(|v| *v == AuthVerdict::Fail)
    }
}

// ── Sender reputation ───────────────────────────────────────────────

/// Caller-supplied reputation record for the sender.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderReputation {
    /// Trust score in [0, 1].
    pub trust_score: f64,
    /// Age of the sender domain in days, when known.
    #[serde(default)]
    pub domain_age_days: Option<u32>,
    /// Number of previous interactions with this sender.
    #[serde(default)]
    pub previous_interactions: u32,
}

impl Default for SenderReputation {
    fn default() -> Self {
        Self {
            trust_score: 0.5,
            domain_age_days: None,
            previous_interactions: 0,
        }
    }
}

// ── Classification payload ──────────────────────────────────────────

/// The bounded view of a message handed to the classifier. This is the
/// *only* input the model sees — derived once per message, serialized as
/// JSON into the final user turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    pub message_id: String,
    pub subject: String,
    /// Body truncated at the configured byte ceiling on a UTF-8 boundary.
    pub body: String,
    pub auth: AuthResults,
    /// Sender domain, lowercased, local part stripped.
    pub sender_domain: String,
    /// List-Id header value, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_id: Option<String>,
    /// Precedence bulk/list, or Auto-Submitted other than "no".
    pub bulk: bool,
    /// Link hosts, lowercased, deduplicated in first-seen order.
    pub link_hosts: Vec<String>,
    pub size_bytes: u64,
    pub attachment_count: u32,
    pub thread_length: u32,
    pub current_labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowlist: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub denylist: Vec<String>,
    pub sender_reputation: SenderReputation,
    /// Per-field annotations for values the extractor could not parse.
    /// The raw value is preserved so the classifier still sees it.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parse_errors: BTreeMap<String, String>,
}

impl Payload {
    /// True iff the sender domain appears on the caller-supplied allowlist.
    pub fn sender_allowlisted(&self) -> bool {
        self.allowlist.iter().any(|d| d == &self.sender_domain)
    }
}

// ── Actions ─────────────────────────────────────────────────────────

/// A mailbox action token. `Label` carries the target label name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ActionKind {
    None,
    Star,
    Archive,
    Label(String),
}

impl ActionKind {
    /// Parse an action token. Accepts `none`, `star`, `archive`,
    /// `label:<name>` with a non-empty name.
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "none" => Some(Self::None),
            "star" => Some(Self::Star),
            "archive" => Some(Self::Archive),
            _ => token
                .strip_prefix("label:")
                .filter(|name| !name.is_empty())
                .map(|name| Self::Label(name.to_string())),
        }
    }

    /// Short label for logging and provenance.
    pub fn label(&self) -> &str {
        match self {
            Self::None => "none",
            Self::Star => "star",
            Self::Archive => "archive",
            Self::Label(_) => "label",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Star => write!(f, "star"),
            Self::Archive => write!(f, "archive"),
            Self::Label(name) => write!(f, "label:{name}"),
        }
    }
}

impl From<ActionKind> for String {
    fn from(a: ActionKind) -> String {
        a.to_string()
    }
}

impl TryFrom<String> for ActionKind {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, String> {
        ActionKind::parse(&s).ok_or_else(|| format!("invalid action token: {s}"))
    }
}

// ── Classification response ─────────────────────────────────────────

/// A single profile's validated verdict for one message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationResponse {
    pub profile_id: String,
    pub action: ActionKind,
    /// Raw model confidence in the profile's allowed range.
    pub confidence: f64,
    /// At most the profile's configured maximum (default 5).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<String>,
    /// Structured features the model reported (e.g. sender_domain).
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub features: serde_json::Map<String, serde_json::Value>,
    /// Structured risk factors (e.g. phishing_score).
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub risk_factors: serde_json::Map<String, serde_json::Value>,
    /// Unknown extra fields from the model, preserved but never validated.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub raw: serde_json::Map<String, serde_json::Value>,
    /// Wall-clock duration of the classifier call.
    #[serde(default)]
    pub duration_ms: u64,
    /// Model version tag reported by the inference adapter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
}

impl ClassificationResponse {
    /// Synthesize the fallback response for a failed or gated-out profile:
    /// `action = none`, `confidence = 0`, a single reason tag.
    pub fn synthesized(profile_id: &str, reason: &str) -> Self {
        Self {
            profile_id: profile_id.to_string(),
            action: ActionKind::None,
            confidence: 0.0,
            reasons: vec![reason.to_string()],
            features: serde_json::Map::new(),
            risk_factors: serde_json::Map::new(),
            raw: serde_json::Map::new(),
            duration_ms: 0,
            model_version: None,
        }
    }

    /// JSON view used by the expression evaluator for dotted field access.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

// ── Final decision ──────────────────────────────────────────────────

/// The single reconciled verdict for one message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub message_id: String,
    /// Every per-profile response that fed the resolution, in profile order.
    pub responses: Vec<ClassificationResponse>,
    pub action: ActionKind,
    /// Calibrated confidence of the chosen action.
    pub confidence: f64,
    /// Profile id (consensus) or priority-rule name that sourced the
    /// winning action; feeds the provenance label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Ordered trace of resolution steps that fired, e.g.
    /// `calibrated:spam,-0.20`, `priority:security_override`, `gate:archive`.
    pub resolution_path: Vec<String>,
    pub labels_to_add: Vec<String>,
    pub labels_to_remove: Vec<String>,
    pub dry_run: bool,
}

impl Decision {
    /// Content hash over the externally-visible outcome, used in audit
    /// metadata. Stable across runs for identical decisions.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.message_id.as_bytes());
        hasher.update(b"|");
        hasher.update(self.action.to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(format!("{:.6}", self.confidence).as_bytes());
        hasher.update(b"|");
        hasher.update(self.labels_to_add.join(",").as_bytes());
        hasher.update(b"|");
        hasher.update(self.labels_to_remove.join(",").as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_token_round_trip() {
        for token in ["none", "star", "archive", "label:Receipts"] {
            let action = ActionKind::parse(token).unwrap();
            assert_eq!(action.to_string(), token);
        }
    }

    #[test]
    fn action_rejects_unknown_tokens() {
        assert!(ActionKind::parse("delete").is_none());
        assert!(ActionKind::parse("label:").is_none());
        assert!(ActionKind::parse("").is_none());
    }

    #[test]
    fn action_serde_uses_tokens() {
        let json = serde_json::to_string(&ActionKind::Label("Work".into())).unwrap();
        assert_eq!(json, "\"label:Work\"");
        let back: ActionKind = serde_json::from_str("\"archive\"").unwrap();
        assert_eq!(back, ActionKind::Archive);
    }

    #[test]
    fn auth_verdict_parse_is_lenient() {
        assert_eq!(AuthVerdict::parse("PASS"), AuthVerdict::Pass);
        assert_eq!(AuthVerdict::parse("softfail"), AuthVerdict::Softfail);
        assert_eq!(AuthVerdict::parse("temperror"), AuthVerdict::None);
    }

    #[test]
    fn auth_any_failed() {
        let mut auth = AuthResults::default();
        assert!(!auth.any_failed());
        auth.dkim = AuthVerdict::Fail;
        assert!(auth.any_failed());
        auth.dkim = AuthVerdict::Softfail;
        assert!(!auth.any_failed());
    }

    #[test]
    fn synthesized_response_is_inert() {
        let r = ClassificationResponse::synthesized("spam", "breaker_open");
        assert!(r.action.is_none());
        assert_eq!(r.confidence, 0.0);
        assert_eq!(r.reasons, vec!["breaker_open".to_string()]);
    }

    #[test]
    fn decision_hash_is_stable_and_sensitive() {
        let base = Decision {
            message_id: "m1".into(),
            responses: vec![],
            action: ActionKind::Archive,
            confidence: 0.9,
            source: Some("spam".into()),
            resolution_path: vec![],
            labels_to_add: vec!["MailSentinel/spam/archive".into()],
            labels_to_remove: vec!["INBOX".into()],
            dry_run: false,
        };
        let same = base.clone();
        assert_eq!(base.content_hash(), same.content_hash());

        let mut different = base.clone();
        different.action = ActionKind::Star;
        assert_ne!(base.content_hash(), different.content_hash());
    }

    #[test]
    fn response_to_value_exposes_dotted_fields() {
        let mut r = ClassificationResponse::synthesized("spam", "x");
        r.risk_factors
            .insert("phishing_score".into(), serde_json::json!(0.93));
        let v = r.to_value();
        assert_eq!(v["risk_factors"]["phishing_score"], serde_json::json!(0.93));
        assert_eq!(v["profile_id"], serde_json::json!("spam"));
    }
}
