//! Profile data model — the on-disk skeleton and the resolved form.
//!
//! A `ProfileSkeleton` is exactly what one YAML/JSON file declares; fields a
//! child may inherit are `Option`. The registry merges skeletons along the
//! inheritance chain into `ResolvedProfile`s, which is what the rest of the
//! pipeline consumes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ProfileError;
use crate::expr::Expr;
use crate::message::ActionKind;

/// Default allowed action tokens when neither the profile nor an ancestor
/// declares a set. `label:*` admits any label name.
pub const DEFAULT_ALLOWED_ACTIONS: &[&str] = &["none", "star", "archive", "label:*"];

/// One profile file, as declared. Unknown top-level keys are a validation
/// error per the file-format contract.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileSkeleton {
    pub id: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inherits_from: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditional_execution: Option<ConditionalExecution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub model_params: ModelParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fewshot: Vec<FewShotExample>,
    #[serde(default)]
    pub response: ResponseConfig,
    #[serde(default)]
    pub policy: PolicySkeleton,
}

/// Gate deciding whether a profile runs at all for a given message,
/// evaluated against already-completed sibling responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConditionalExecution {
    pub when: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Model parameters. Unset fields inherit from the parent, then fall back
/// to crate defaults at resolve time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
}

/// A worked example sent as an alternating user/assistant turn pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FewShotExample {
    pub name: String,
    pub input: String,
    pub output: String,
}

/// Response schema declaration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResponseConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_fields: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_range: Option<[f64; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_actions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_reasons: Option<usize>,
}

/// Declared policy: ordered conditions plus a default action.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicySkeleton {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<PolicyConditionSkeleton>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_action: Option<ActionKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyConditionSkeleton {
    pub name: String,
    pub expression: String,
    pub actions: Vec<ActionKind>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_boost: Option<f64>,
}

impl ProfileSkeleton {
    /// File-level validation, run before any merging. Range checks apply
    /// only to fields the file actually sets; effective-value checks run
    /// again after the inheritance merge.
    pub fn validate(&self) -> Result<(), ProfileError> {
        let invalid = |reason: String| ProfileError::Invalid {
            id: self.id.clone(),
            reason,
        };

        if self.id.is_empty() {
            return Err(ProfileError::Invalid {
                id: "<unset>".to_string(),
                reason: "id is required".to_string(),
            });
        }
        parse_version(&self.version).map_err(|e| invalid(e))?;

        if let Some(t) = self.model_params.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(invalid(format!("temperature {t} outside [0, 2]")));
            }
        }
        if let Some(m) = self.model_params.max_tokens {
            if m == 0 {
                return Err(invalid("max_tokens must be positive".to_string()));
            }
        }
        if let Some(t) = self.model_params.timeout_secs {
            if t == 0 {
                return Err(invalid("timeout_secs must be positive".to_string()));
            }
        }
        if let Some([lo, hi]) = self.response.confidence_range {
            if !(0.0..=1.0).contains(&lo) || !(0.0..=1.0).contains(&hi) {
                return Err(invalid(format!(
                    "confidence_range [{lo}, {hi}] outside [0, 1]"
                )));
            }
            if lo >= hi {
                return Err(invalid(format!(
                    "confidence_range minimum {lo} must be below maximum {hi}"
                )));
            }
        }
        if let Some(actions) = &self.response.allowed_actions {
            for token in actions {
                if token != "label:*" && ActionKind::parse(token).is_none() {
                    return Err(invalid(format!("unknown action token '{token}'")));
                }
            }
        }
        if self.depends_on.iter().any(|d| d == &self.id)
            || self.inherits_from.as_deref() == Some(self.id.as_str())
        {
            return Err(invalid("profile depends on itself".to_string()));
        }
        Ok(())
    }
}

/// Parse `MAJOR.MINOR[.PATCH]`.
pub fn parse_version(version: &str) -> Result<(u32, u32, Option<u32>), String> {
    let parts: Vec<&str> = version.split('.').collect();
    if parts.len() < 2 || parts.len() > 3 {
        return Err(format!("version '{version}' is not MAJOR.MINOR[.PATCH]"));
    }
    let parse = |s: &str| {
        s.parse::<u32>()
            .map_err(|_| format!("version component '{s}' is not a number"))
    };
    let major = parse(parts[0])?;
    let minor = parse(parts[1])?;
    let patch = parts.get(2).map(|s| parse(s)).transpose()?;
    Ok((major, minor, patch))
}

// ── Resolved form ───────────────────────────────────────────────────

/// Effective model parameters after inheritance and defaulting.
#[derive(Debug, Clone)]
pub struct EffectiveParams {
    pub temperature: f64,
    pub max_tokens: u32,
    pub timeout: Duration,
    pub top_p: Option<f64>,
    pub top_k: Option<u32>,
}

/// Effective response validation after inheritance and defaulting.
#[derive(Debug, Clone)]
pub struct EffectiveValidation {
    pub required_fields: Vec<String>,
    pub confidence_range: [f64; 2],
    pub allowed_actions: Vec<String>,
    pub max_reasons: usize,
}

impl EffectiveValidation {
    /// Whether an action token is admitted by this profile's schema.
    pub fn action_allowed(&self, action: &ActionKind) -> bool {
        let token = action.to_string();
        self.allowed_actions.iter().any(|allowed| {
            allowed == &token || (allowed == "label:*" && token.starts_with("label:"))
        })
    }
}

/// A policy condition with its expression parsed.
#[derive(Debug, Clone)]
pub struct ResolvedCondition {
    pub name: String,
    pub expr: Expr,
    pub actions: Vec<ActionKind>,
    pub priority: i32,
    pub confidence_boost: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ResolvedPolicy {
    pub conditions: Vec<ResolvedCondition>,
    /// Applied when no condition fires. `None` with an empty condition list
    /// passes the model's own action through; `None` with conditions
    /// present falls back to `none`.
    pub default_action: Option<ActionKind>,
}

/// Conditional-execution gate with its expression parsed.
#[derive(Debug, Clone)]
pub struct ResolvedConditional {
    pub when: Expr,
    pub reason: Option<String>,
}

/// A fully merged, validated, expression-parsed profile. Never mutated;
/// registry reloads build a fresh set and swap atomically.
#[derive(Debug, Clone)]
pub struct ResolvedProfile {
    pub id: String,
    pub version: String,
    pub depends_on: Vec<String>,
    pub inherits_from: Option<String>,
    pub conditional: Option<ResolvedConditional>,
    pub model: String,
    pub params: EffectiveParams,
    pub system: String,
    pub fewshot: Vec<FewShotExample>,
    pub validation: EffectiveValidation,
    pub policy: ResolvedPolicy,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal(id: &str) -> ProfileSkeleton {
        ProfileSkeleton {
            id: id.to_string(),
            version: "1.0".to_string(),
            model: Some("qwen2.5:7b".to_string()),
            system: Some("Classify.".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn minimal_skeleton_validates() {
        minimal("spam").validate().unwrap();
    }

    #[test]
    fn version_formats() {
        assert!(parse_version("1.0").is_ok());
        assert!(parse_version("2.10.3").is_ok());
        assert!(parse_version("1").is_err());
        assert!(parse_version("1.0.0.0").is_err());
        assert!(parse_version("1.x").is_err());
        assert!(parse_version("").is_err());
    }

    #[test]
    fn temperature_range_enforced() {
        let mut p = minimal("spam");
        p.model_params.temperature = Some(2.5);
        assert!(p.validate().is_err());
        p.model_params.temperature = Some(2.0);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn confidence_range_must_be_monotonic() {
        let mut p = minimal("spam");
        p.response.confidence_range = Some([0.9, 0.1]);
        assert!(p.validate().is_err());
        p.response.confidence_range = Some([0.0, 1.0]);
        assert!(p.validate().is_ok());
        p.response.confidence_range = Some([0.0, 1.5]);
        assert!(p.validate().is_err());
    }

    #[test]
    fn self_dependency_rejected() {
        let mut p = minimal("spam");
        p.depends_on = vec!["spam".to_string()];
        assert!(p.validate().is_err());

        let mut p = minimal("spam");
        p.inherits_from = Some("spam".to_string());
        assert!(p.validate().is_err());
    }

    #[test]
    fn bad_action_token_rejected() {
        let mut p = minimal("spam");
        p.response.allowed_actions = Some(vec!["delete".to_string()]);
        assert!(p.validate().is_err());
        p.response.allowed_actions =
            Some(vec!["archive".to_string(), "label:*".to_string()]);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn unknown_top_level_keys_fail_parse() {
        let yaml = "id: spam\nversion: '1.0'\nmodell: typo\n";
        let parsed: Result<ProfileSkeleton, _> = serde_yaml::from_str(yaml);
        assert!(parsed.is_err());
    }

    #[test]
    fn label_wildcard_admits_any_label() {
        let v = EffectiveValidation {
            required_fields: vec![],
            confidence_range: [0.0, 1.0],
            allowed_actions: vec!["none".into(), "label:*".into()],
            max_reasons: 5,
        };
        assert!(v.action_allowed(&ActionKind::Label("Anything/Nested".into())));
        assert!(v.action_allowed(&ActionKind::None));
        assert!(!v.action_allowed(&ActionKind::Archive));
    }
}
