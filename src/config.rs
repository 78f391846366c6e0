//! Configuration types.
//!
//! Merge order, last wins: built-in defaults ← YAML file ← environment
//! overrides ← caller-supplied overrides. Every subsystem gets its own
//! struct so adapters can borrow just their slice.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::message::ActionKind;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mailbox: MailboxConfig,
    pub classifier: ClassifierConfig,
    pub profiles: ProfilesConfig,
    pub audit: AuditConfig,
    pub gates: GateConfig,
    pub calibration: CalibrationConfig,
    pub resolver: ResolverConfig,
    pub orchestrator: OrchestratorConfig,
    pub planner: PlannerConfig,
    pub extractor: ExtractorConfig,
}

/// Mailbox adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MailboxConfig {
    /// Messages fetched per page.
    pub page_size: u32,
    /// Token-bucket refill rate for mailbox calls, tokens per second.
    pub rate_limit_per_sec: f64,
    /// Token-bucket burst capacity.
    pub rate_limit_burst: u32,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Bounded retries for transient/rate-limited errors.
    pub retry_attempts: u32,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            rate_limit_per_sec: 5.0,
            rate_limit_burst: 10,
            request_timeout_secs: 30,
            retry_attempts: 3,
        }
    }
}

/// Classifier gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Inference endpoint. Must resolve to a loopback address.
    pub endpoint: String,
    /// Model used when a profile does not name one.
    pub default_model: String,
    /// Per-call timeout in seconds; a profile timeout caps it from above.
    pub request_timeout_secs: u64,
    /// Retries on transport or schema errors.
    pub max_retries: u32,
    /// Maximum reasons accepted in a response.
    pub max_reasons: usize,
    /// Token-bucket rate for classifier calls, tokens per second.
    pub rate_limit_per_sec: f64,
    pub rate_limit_burst: u32,
    pub breaker: BreakerConfig,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:11434".to_string(),
            default_model: "qwen2.5:7b".to_string(),
            request_timeout_secs: 30,
            max_retries: 1,
            max_reasons: 5,
            rate_limit_per_sec: 2.0,
            rate_limit_burst: 4,
            breaker: BreakerConfig::default(),
        }
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,
    /// Seconds the breaker stays open before admitting trial calls.
    pub open_secs: u64,
    /// Trial calls admitted while half-open.
    pub half_open_max: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_secs: 60,
            half_open_max: 1,
        }
    }
}

/// Profile registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilesConfig {
    /// Directory walked for YAML/JSON profile files.
    pub directory: String,
    /// When true, any quarantined profile fails `profiles validate`.
    pub strict_validation: bool,
}

impl Default for ProfilesConfig {
    fn default() -> Self {
        Self {
            directory: "profiles".to_string(),
            strict_validation: true,
        }
    }
}

/// Audit chain configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub enabled: bool,
    pub directory: String,
    /// Rotate when the current file exceeds this many bytes.
    pub max_file_bytes: u64,
    /// Rotate when the current file is older than this many seconds.
    pub max_file_age_secs: u64,
    /// Run chain verification on close.
    pub integrity_check: bool,
    /// Shared secret for per-entry signatures. Absence disables signing,
    /// not chaining.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: "data/audit".to_string(),
            max_file_bytes: 100 * 1024 * 1024,
            max_file_age_secs: 24 * 60 * 60,
            integrity_check: true,
            secret: None,
        }
    }
}

/// Safety-gate thresholds: minimum calibrated confidence per action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub archive: f64,
    pub star: f64,
    pub label: f64,
    /// Optional stricter gate for labels under `MailSentinel/Security/`.
    /// None falls back to the generic label gate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_label_threshold: Option<f64>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            archive: 0.85,
            star: 0.70,
            label: 0.60,
            security_label_threshold: None,
        }
    }
}

impl GateConfig {
    /// Gate threshold for an action. `none` is never gated.
    pub fn threshold(&self, action: &ActionKind) -> f64 {
        match action {
            ActionKind::None => 0.0,
            ActionKind::Star => self.star,
            ActionKind::Archive => self.archive,
            ActionKind::Label(name) => {
                if name.starts_with("MailSentinel/Security/") {
                    self.security_label_threshold.unwrap_or(self.label)
                } else {
                    self.label
                }
            }
        }
    }

    /// Gate name recorded in the resolution path on demotion.
    pub fn gate_name(action: &ActionKind) -> &'static str {
        match action {
            ActionKind::None => "none",
            ActionKind::Star => "star",
            ActionKind::Archive => "archive",
            ActionKind::Label(_) => "label",
        }
    }
}

/// Confidence calibration coefficients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Added when any of spf/dkim/dmarc failed. Negative.
    pub auth_failure_penalty: f64,
    /// Added when sender trust meets the threshold.
    pub trusted_sender_bonus: f64,
    /// Trust score at or above which the bonus applies.
    pub trust_threshold: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            auth_failure_penalty: -0.2,
            trusted_sender_bonus: 0.1,
            trust_threshold: 0.9,
        }
    }
}

/// How per-profile candidate actions combine into one decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightMethod {
    HighestConfidence,
    Consensus,
    #[default]
    WeightedAverage,
}

/// A cross-profile override rule evaluated before consensus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityRule {
    pub name: String,
    /// Cross-profile expression; may use `any()`, `all()`, `count()`.
    pub expression: String,
    pub action: ActionKind,
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_boost: Option<f64>,
    /// Priority rules normally skip safety gates only for gates they meet;
    /// this lets the rule ignore its gate entirely.
    #[serde(default)]
    pub override_gates: bool,
}

/// Decision resolver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub method: WeightMethod,
    /// Per-profile weights; unlisted profiles weigh 1.0.
    pub profile_weights: BTreeMap<String, f64>,
    /// Declared profile ordering, used as the final consensus tie-break.
    pub profile_order: Vec<String>,
    pub priority_rules: Vec<PriorityRule>,
    /// Archive must exceed star by at least this much to win reconciliation.
    pub star_archive_margin: f64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            method: WeightMethod::default(),
            profile_weights: BTreeMap::new(),
            profile_order: Vec::new(),
            priority_rules: Vec::new(),
            star_archive_margin: 0.2,
        }
    }
}

/// Batch orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Worker task count.
    pub workers: usize,
    /// Bounded work-queue depth.
    pub queue_depth: usize,
    /// Per-message deadline = sum of profile timeouts × this factor.
    pub deadline_safety_factor: f64,
    /// Workers block before classifier calls when the audit writer queue
    /// exceeds this depth.
    pub audit_backpressure_threshold: usize,
    /// Where the mailbox cursor checkpoint is persisted.
    pub checkpoint_path: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            queue_depth: 200,
            deadline_safety_factor: 1.5,
            audit_backpressure_threshold: 256,
            checkpoint_path: "data/checkpoint".to_string(),
        }
    }
}

/// Action planner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Emit a provenance label even for `none` decisions.
    pub provenance_on_none: bool,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            provenance_on_none: false,
        }
    }
}

/// Feature extractor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    /// Body byte ceiling; truncation lands on a UTF-8 boundary.
    pub body_limit_bytes: usize,
    /// Sender domains treated as trusted by callers.
    pub allowlist: Vec<String>,
    /// Sender domains treated as hostile by callers.
    pub denylist: Vec<String>,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            body_limit_bytes: 10 * 1024,
            allowlist: Vec::new(),
            denylist: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration with the full merge order applied. `path` is the
    /// optional YAML file; `overrides` runs last.
    pub fn load(
        path: Option<&Path>,
        overrides: impl FnOnce(&mut Config),
    ) -> Result<Config, ConfigError> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let data = std::fs::read_to_string(p)?;
                serde_yaml::from_str(&data).map_err(|e| ConfigError::Parse(e.to_string()))?
            }
            _ => Config::default(),
        };
        config.apply_env();
        overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Apply `MAILSENTINEL_*` environment overrides.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("MAILSENTINEL_CLASSIFIER_ENDPOINT") {
            self.classifier.endpoint = v;
        }
        if let Ok(v) = std::env::var("MAILSENTINEL_CLASSIFIER_MODEL") {
            self.classifier.default_model = v;
        }
        if let Ok(v) = std::env::var("MAILSENTINEL_PROFILE_DIR") {
            self.profiles.directory = v;
        }
        if let Ok(v) = std::env::var("MAILSENTINEL_AUDIT_DIR") {
            self.audit.directory = v;
        }
        if let Ok(v) = std::env::var("MAILSENTINEL_AUDIT_SECRET") {
            self.audit.secret = Some(v);
        }
        if let Some(v) = env_parse("MAILSENTINEL_WORKERS") {
            self.orchestrator.workers = v;
        }
        if let Some(v) = env_parse("MAILSENTINEL_PAGE_SIZE") {
            self.mailbox.page_size = v;
        }
    }

    /// Reject configurations the core cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.classifier.endpoint.is_empty() {
            return Err(invalid("classifier.endpoint", "must not be empty"));
        }
        if self.classifier.default_model.is_empty() {
            return Err(invalid("classifier.default_model", "must not be empty"));
        }
        if self.profiles.directory.is_empty() {
            return Err(invalid("profiles.directory", "must not be empty"));
        }
        for (key, gate) in [
            ("gates.archive", self.gates.archive),
            ("gates.star", self.gates.star),
            ("gates.label", self.gates.label),
        ] {
            if !(0.0..=1.0).contains(&gate) {
                return Err(invalid(key, "must be within [0, 1]"));
            }
        }
        if let Some(g) = self.gates.security_label_threshold {
            if !(0.0..=1.0).contains(&g) {
                return Err(invalid(
                    "gates.security_label_threshold",
                    "must be within [0, 1]",
                ));
            }
        }
        if !(0.0..=1.0).contains(&self.calibration.trust_threshold) {
            return Err(invalid("calibration.trust_threshold", "must be within [0, 1]"));
        }
        if self.orchestrator.workers == 0 {
            return Err(invalid("orchestrator.workers", "must be positive"));
        }
        if self.mailbox.page_size == 0 {
            return Err(invalid("mailbox.page_size", "must be positive"));
        }
        if self.orchestrator.deadline_safety_factor < 1.0 {
            return Err(invalid(
                "orchestrator.deadline_safety_factor",
                "must be at least 1.0",
            ));
        }
        Ok(())
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Option<T> {
    std::env::var(var).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn default_values_match_contract() {
        let c = Config::default();
        assert_eq!(c.mailbox.page_size, 100);
        assert_eq!(c.classifier.endpoint, "http://127.0.0.1:11434");
        assert_eq!(c.classifier.breaker.failure_threshold, 5);
        assert_eq!(c.classifier.breaker.open_secs, 60);
        assert_eq!(c.gates.archive, 0.85);
        assert_eq!(c.gates.star, 0.70);
        assert_eq!(c.gates.label, 0.60);
        assert_eq!(c.calibration.auth_failure_penalty, -0.2);
        assert_eq!(c.calibration.trust_threshold, 0.9);
        assert_eq!(c.orchestrator.workers, 5);
        assert_eq!(c.extractor.body_limit_bytes, 10 * 1024);
    }

    #[test]
    fn partial_yaml_fills_remaining_from_defaults() {
        let yaml = "classifier:\n  default_model: llama3.2:3b\ngates:\n  archive: 0.9\n";
        let c: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(c.classifier.default_model, "llama3.2:3b");
        assert_eq!(c.gates.archive, 0.9);
        // untouched subsystems keep defaults
        assert_eq!(c.gates.star, 0.70);
        assert_eq!(c.mailbox.page_size, 100);
    }

    #[test]
    fn out_of_range_gate_rejected() {
        let mut c = Config::default();
        c.gates.archive = 1.2;
        assert!(c.validate().is_err());
    }

    #[test]
    fn zero_workers_rejected() {
        let mut c = Config::default();
        c.orchestrator.workers = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn security_namespace_uses_stricter_gate_when_set() {
        let mut gates = GateConfig::default();
        assert_eq!(
            gates.threshold(&ActionKind::Label("MailSentinel/Security/Phish".into())),
            0.60
        );
        gates.security_label_threshold = Some(0.8);
        assert_eq!(
            gates.threshold(&ActionKind::Label("MailSentinel/Security/Phish".into())),
            0.8
        );
        assert_eq!(gates.threshold(&ActionKind::Label("Receipts".into())), 0.60);
    }

    #[test]
    fn caller_overrides_win_last() {
        let c = Config::load(None, |c| {
            c.orchestrator.workers = 2;
        })
        .unwrap();
        assert_eq!(c.orchestrator.workers, 2);
    }
}
