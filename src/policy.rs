//! Policy evaluator — derives a profile's proposed actions from one
//! classification response.
//!
//! Conditions run in declared order; the first whose expression is true
//! contributes its action list, priority, and optional confidence boost.
//! None firing falls back to the profile's default action. Evaluation is
//! pure; expressions were parsed at profile load, so nothing here can fail.

use tracing::debug;

use crate::message::{ActionKind, ClassificationResponse};
use crate::profile::ResolvedProfile;

/// What a profile's policy proposes for one response.
#[derive(Debug, Clone)]
pub struct PolicyOutcome {
    pub actions: Vec<ActionKind>,
    pub priority: i32,
    pub confidence_boost: Option<f64>,
    /// Name of the condition that fired, or `None` for the default action.
    pub matched: Option<String>,
}

/// Evaluate a profile's policy against its own response. Per-profile
/// conditions never see sibling responses — aggregations are reserved for
/// the resolver.
///
/// Fallback when nothing fires: the declared default action; with no
/// declared default, a profile without conditions passes the model's own
/// action through, while a profile whose conditions all missed proposes
/// `none`.
pub fn evaluate(profile: &ResolvedProfile, response: &ClassificationResponse) -> PolicyOutcome {
    let root = response.to_value();

    for condition in &profile.policy.conditions {
        if condition.expr.eval_bool(&root, &[]) {
            debug!(
                profile = %profile.id,
                condition = %condition.name,
                priority = condition.priority,
                "Policy condition fired"
            );
            return PolicyOutcome {
                actions: condition.actions.clone(),
                priority: condition.priority,
                confidence_boost: condition.confidence_boost,
                matched: Some(condition.name.clone()),
            };
        }
    }

    let fallback = match &profile.policy.default_action {
        Some(action) => action.clone(),
        None if profile.policy.conditions.is_empty() => response.action.clone(),
        None => ActionKind::None,
    };
    PolicyOutcome {
        actions: vec![fallback],
        priority: 0,
        confidence_boost: None,
        matched: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::expr::Expr;
    use crate::profile::{
        EffectiveParams, EffectiveValidation, ResolvedCondition, ResolvedPolicy,
    };

    fn profile_with(
        conditions: Vec<ResolvedCondition>,
        default: Option<ActionKind>,
    ) -> ResolvedProfile {
        ResolvedProfile {
            id: "spam".into(),
            version: "1.0".into(),
            depends_on: vec![],
            inherits_from: None,
            conditional: None,
            model: "m".into(),
            params: EffectiveParams {
                temperature: 0.1,
                max_tokens: 512,
                timeout: Duration::from_secs(30),
                top_p: None,
                top_k: None,
            },
            system: "s".into(),
            fewshot: vec![],
            validation: EffectiveValidation {
                required_fields: vec![],
                confidence_range: [0.0, 1.0],
                allowed_actions: vec!["none".into(), "star".into(), "archive".into()],
                max_reasons: 5,
            },
            policy: ResolvedPolicy {
                conditions,
                default_action: default,
            },
        }
    }

    fn condition(name: &str, expr: &str, actions: Vec<ActionKind>, priority: i32) -> ResolvedCondition {
        ResolvedCondition {
            name: name.into(),
            expr: Expr::parse(expr).unwrap(),
            actions,
            priority,
            confidence_boost: None,
        }
    }

    fn response(confidence: f64) -> ClassificationResponse {
        let mut r = ClassificationResponse::synthesized("spam", "test");
        r.confidence = confidence;
        r.action = ActionKind::Archive;
        r
    }

    #[test]
    fn first_matching_condition_wins() {
        let profile = profile_with(
            vec![
                condition("high", "confidence >= 0.9", vec![ActionKind::Archive], 10),
                condition("mid", "confidence >= 0.5", vec![ActionKind::Star], 5),
            ],
            None,
        );
        let outcome = evaluate(&profile, &response(0.95));
        assert_eq!(outcome.matched.as_deref(), Some("high"));
        assert_eq!(outcome.actions, vec![ActionKind::Archive]);
        assert_eq!(outcome.priority, 10);

        let outcome = evaluate(&profile, &response(0.6));
        assert_eq!(outcome.matched.as_deref(), Some("mid"));
        assert_eq!(outcome.actions, vec![ActionKind::Star]);
    }

    #[test]
    fn default_action_when_nothing_fires() {
        let profile = profile_with(
            vec![condition("high", "confidence >= 0.9", vec![ActionKind::Archive], 10)],
            None,
        );
        let outcome = evaluate(&profile, &response(0.1));
        assert!(outcome.matched.is_none());
        assert_eq!(outcome.actions, vec![ActionKind::None]);
        assert_eq!(outcome.priority, 0);
    }

    #[test]
    fn conditions_see_risk_factors() {
        let profile = profile_with(
            vec![condition(
                "phish",
                "risk_factors.phishing_score >= 0.8",
                vec![ActionKind::Label("MailSentinel/Security/Phishing".into())],
                100,
            )],
            None,
        );
        let mut r = response(0.5);
        r.risk_factors
            .insert("phishing_score".into(), serde_json::json!(0.93));
        let outcome = evaluate(&profile, &r);
        assert_eq!(outcome.matched.as_deref(), Some("phish"));
    }

    #[test]
    fn empty_policy_passes_model_action_through() {
        let profile = profile_with(vec![], None);
        let outcome = evaluate(&profile, &response(0.96));
        assert!(outcome.matched.is_none());
        assert_eq!(outcome.actions, vec![ActionKind::Archive]);
    }

    #[test]
    fn declared_default_overrides_model_action() {
        let profile = profile_with(vec![], Some(ActionKind::Star));
        let outcome = evaluate(&profile, &response(0.96));
        assert_eq!(outcome.actions, vec![ActionKind::Star]);
    }

    #[test]
    fn declared_order_beats_priority_field_for_selection() {
        // Selection is by declaration order; the priority field only feeds
        // the resolver's comparison between profiles.
        let profile = profile_with(
            vec![
                condition("low_pri_first", "confidence >= 0.5", vec![ActionKind::Star], 1),
                condition("high_pri_second", "confidence >= 0.5", vec![ActionKind::Archive], 99),
            ],
            None,
        );
        let outcome = evaluate(&profile, &response(0.8));
        assert_eq!(outcome.matched.as_deref(), Some("low_pri_first"));
    }
}
