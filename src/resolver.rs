//! Decision resolver — reconciles per-profile responses into one Decision.
//!
//! Pipeline: conditional gating, confidence calibration, priority-rule
//! overrides, consensus combination, star/archive reconciliation, safety
//! gates. Every step that fires appends to the decision's resolution path,
//! so a decision can always be replayed from its trace.

use serde_json::Value;
use tracing::debug;

use crate::config::{CalibrationConfig, GateConfig, PriorityRule, ResolverConfig, WeightMethod};
use crate::error::Error;
use crate::expr::Expr;
use crate::message::{ActionKind, ClassificationResponse, Decision, Payload};
use crate::policy;
use crate::profile::{Registry, ResolvedProfile};

/// Reason tag carried by responses synthesized for a gated-out profile.
pub const GATED_REASON: &str = "gated";

struct ParsedRule {
    rule: PriorityRule,
    expr: Expr,
}

/// Combines per-profile decisions under calibration, priority, and safety
/// gates. Built once per run; priority-rule expressions parse at
/// construction so malformed config is caught before any message.
pub struct DecisionResolver {
    method: WeightMethod,
    config: ResolverConfig,
    rules: Vec<ParsedRule>,
    calibration: CalibrationConfig,
    gates: GateConfig,
}

/// One vote: a profile proposing an action at a calibrated confidence.
#[derive(Debug, Clone)]
struct Candidate {
    profile_id: String,
    action: ActionKind,
    confidence: f64,
    weight: f64,
}

impl DecisionResolver {
    pub fn new(
        config: ResolverConfig,
        calibration: CalibrationConfig,
        gates: GateConfig,
    ) -> Result<Self, Error> {
        let mut rules = Vec::with_capacity(config.priority_rules.len());
        for rule in &config.priority_rules {
            let expr = Expr::parse(&rule.expression)?;
            rules.push(ParsedRule {
                rule: rule.clone(),
                expr,
            });
        }
        // Priority descending; the stable sort keeps declared order for ties,
        // including ties where both rules override gates.
        rules.sort_by_key(|r| std::cmp::Reverse(r.rule.priority));
        Ok(Self {
            method: config.method,
            config,
            rules,
            calibration,
            gates,
        })
    }

    /// Conditional gating: whether `profile` should run, given the
    /// responses completed so far. Profiles without a gate always run.
    pub fn should_run(
        &self,
        profile: &ResolvedProfile,
        completed: &[ClassificationResponse],
    ) -> bool {
        let Some(conditional) = &profile.conditional else {
            return true;
        };
        let siblings: Vec<Value> = completed.iter().map(|r| r.to_value()).collect();
        let root = responses_root(completed, None);
        conditional.when.eval_bool(&root, &siblings)
    }

    /// Resolve the completed responses for one message into a Decision.
    pub fn resolve(
        &self,
        registry: &Registry,
        responses: Vec<ClassificationResponse>,
        payload: &Payload,
        dry_run: bool,
    ) -> Decision {
        let mut trace: Vec<String> = Vec::new();

        // Calibration. Sender-legitimacy deltas apply to sender-favorable
        // verdicts; an authentication failure corroborates a hostile
        // (archive) verdict rather than undermining it, so archive is exempt.
        let delta = self.calibration_delta(payload);
        let mut calibrated: Vec<ClassificationResponse> = Vec::with_capacity(responses.len());
        for response in &responses {
            let mut c = response.clone();
            if is_gated(response) {
                calibrated.push(c);
                continue;
            }
            if delta != 0.0 && c.action != ActionKind::Archive {
                c.confidence = (c.confidence + delta).clamp(0.0, 1.0);
                trace.push(format!("calibrated:{},{:+.2}", c.profile_id, delta));
            }
            calibrated.push(c);
        }
        for response in &responses {
            if is_gated(response) {
                trace.push(format!("gated:{}", response.profile_id));
            }
        }

        // Per-profile policy evaluation over the calibrated responses.
        let candidates = self.collect_candidates(registry, &calibrated);

        // Priority overrides, highest priority first.
        if let Some(decision) = self.apply_priority_rules(
            payload,
            &calibrated,
            &candidates,
            &responses,
            dry_run,
            &mut trace,
        ) {
            return decision;
        }

        // Consensus among candidates.
        self.resolve_by_consensus(candidates, responses, payload, dry_run, trace)
    }

    fn calibration_delta(&self, payload: &Payload) -> f64 {
        let mut delta = 0.0;
        if payload.auth.any_failed() {
            delta += self.calibration.auth_failure_penalty;
        }
        if payload.sender_reputation.trust_score >= self.calibration.trust_threshold {
            delta += self.calibration.trusted_sender_bonus;
        }
        delta
    }

    fn collect_candidates(
        &self,
        registry: &Registry,
        calibrated: &[ClassificationResponse],
    ) -> Vec<Candidate> {
        let mut candidates = Vec::new();
        for response in calibrated {
            let weight = self.profile_weight(&response.profile_id);
            match registry.get(&response.profile_id) {
                Ok(profile) => {
                    let outcome = policy::evaluate(profile, response);
                    let confidence = match outcome.confidence_boost {
                        Some(boost) => (response.confidence + boost).clamp(0.0, 1.0),
                        None => response.confidence,
                    };
                    for action in outcome.actions {
                        candidates.push(Candidate {
                            profile_id: response.profile_id.clone(),
                            action,
                            confidence,
                            weight,
                        });
                    }
                }
                // Responses from profiles outside the registry (synthesized
                // stubs) vote their own action directly.
                Err(_) => candidates.push(Candidate {
                    profile_id: response.profile_id.clone(),
                    action: response.action.clone(),
                    confidence: response.confidence,
                    weight,
                }),
            }
        }
        candidates
    }

    fn profile_weight(&self, profile_id: &str) -> f64 {
        self.config
            .profile_weights
            .get(profile_id)
            .copied()
            .unwrap_or(1.0)
    }

    fn apply_priority_rules(
        &self,
        payload: &Payload,
        calibrated: &[ClassificationResponse],
        candidates: &[Candidate],
        responses: &[ClassificationResponse],
        dry_run: bool,
        trace: &mut Vec<String>,
    ) -> Option<Decision> {
        if self.rules.is_empty() {
            return None;
        }
        let payload_value = serde_json::to_value(payload).ok();
        let root = responses_root(calibrated, payload_value);
        let siblings: Vec<Value> = calibrated.iter().map(|r| r.to_value()).collect();

        for parsed in &self.rules {
            if !parsed.expr.eval_bool(&root, &siblings) {
                continue;
            }
            let base = calibrated
                .iter()
                .map(|r| r.confidence)
                .fold(0.0_f64, f64::max);
            let confidence = match parsed.rule.confidence_boost {
                Some(boost) => (base + boost).clamp(0.0, 1.0),
                None => 1.0,
            };

            // A rule may not select an action whose gate it misses unless it
            // explicitly overrides gates.
            let gate = self.gates.threshold(&parsed.rule.action);
            if confidence < gate && !parsed.rule.override_gates {
                debug!(
                    rule = %parsed.rule.name,
                    confidence,
                    gate,
                    "Priority rule matched but misses its gate"
                );
                continue;
            }

            trace.push(format!("priority:{}", parsed.rule.name));
            let mut labels = self.passing_labels(candidates);
            if let ActionKind::Label(name) = &parsed.rule.action {
                if !labels.contains(name) {
                    labels.push(name.clone());
                }
            }
            return Some(Decision {
                message_id: payload.message_id.clone(),
                responses: responses.to_vec(),
                action: parsed.rule.action.clone(),
                confidence,
                source: Some(parsed.rule.name.clone()),
                resolution_path: std::mem::take(trace),
                labels_to_add: labels,
                labels_to_remove: Vec::new(),
                dry_run,
            });
        }
        None
    }

    fn resolve_by_consensus(
        &self,
        candidates: Vec<Candidate>,
        responses: Vec<ClassificationResponse>,
        payload: &Payload,
        dry_run: bool,
        mut trace: Vec<String>,
    ) -> Decision {
        let mut groups = group_by_action(&candidates);
        trace.push(format!("consensus:{}", method_name(self.method)));

        // Star and archive are mutually exclusive: star wins unless archive
        // leads by at least the configured margin. `none` never overrides a
        // non-`none` winner, so it only competes when nothing else voted.
        let star_conf = groups_confidence(&groups, &ActionKind::Star, self.method);
        let archive_conf = groups_confidence(&groups, &ActionKind::Archive, self.method);
        if let (Some(star), Some(archive)) = (star_conf, archive_conf) {
            if archive - star >= self.config.star_archive_margin {
                groups.retain(|(a, _)| *a != ActionKind::Star);
                trace.push("reconcile:archive_over_star".to_string());
            } else {
                groups.retain(|(a, _)| *a != ActionKind::Archive);
                trace.push("reconcile:star_over_archive".to_string());
            }
        }

        let labels = self.passing_labels(&candidates);

        let non_none: Vec<&(ActionKind, Vec<Candidate>)> = groups
            .iter()
            .filter(|(a, _)| !a.is_none())
            .collect();

        let (mut action, confidence, source) = if non_none.is_empty() {
            let conf = groups
                .iter()
                .find(|(a, _)| a.is_none())
                .map(|(_, votes)| confidence_of(votes, self.method))
                .unwrap_or(0.0);
            (ActionKind::None, conf, None)
        } else {
            self.pick_winner(&non_none)
        };

        // Safety gate on the winning action.
        if !action.is_none() {
            let gate = self.gates.threshold(&action);
            if confidence < gate {
                trace.push(format!("gate:{}", GateConfig::gate_name(&action)));
                action = ActionKind::None;
            }
        }

        Decision {
            message_id: payload.message_id.clone(),
            responses,
            action,
            confidence,
            source,
            resolution_path: trace,
            labels_to_add: labels,
            labels_to_remove: Vec::new(),
            dry_run,
        }
    }

    /// Winner among non-`none` groups under the configured method, with the
    /// profile that carried the winning vote.
    fn pick_winner(
        &self,
        groups: &[&(ActionKind, Vec<Candidate>)],
    ) -> (ActionKind, f64, Option<String>) {
        match self.method {
            WeightMethod::HighestConfidence => {
                let mut best: Option<(&ActionKind, f64, &Vec<Candidate>)> = None;
                for (action, votes) in groups {
                    let conf = votes.iter().map(|c| c.confidence).fold(0.0_f64, f64::max);
                    if best.as_ref().map_or(true, |(_, b, _)| conf > *b) {
                        best = Some((action, conf, votes));
                    }
                }
                let (action, conf, votes) = best.expect("non-empty groups");
                (action.clone(), conf, top_voter(votes))
            }
            WeightMethod::Consensus => {
                // Rank by vote count, then weight sum, then earliest profile
                // in the resolver's declared ordering.
                let mut best: Option<(&ActionKind, f64, &Vec<Candidate>, (usize, f64, usize))> =
                    None;
                for (action, votes) in groups {
                    let weight_sum: f64 = votes.iter().map(|c| c.weight).sum();
                    let first_declared = votes
                        .iter()
                        .map(|c| self.declared_index(&c.profile_id))
                        .min()
                        .unwrap_or(usize::MAX);
                    let key = (votes.len(), weight_sum, first_declared);
                    let conf = votes.iter().map(|c| c.confidence).fold(0.0_f64, f64::max);
                    let better = match &best {
                        None => true,
                        Some((_, _, _, b)) => {
                            key.0 > b.0
                                || (key.0 == b.0 && key.1 > b.1)
                                || (key.0 == b.0 && key.1 == b.1 && key.2 < b.2)
                        }
                    };
                    if better {
                        best = Some((action, conf, votes, key));
                    }
                }
                let (action, conf, votes, _) = best.expect("non-empty groups");
                (action.clone(), conf, top_voter(votes))
            }
            WeightMethod::WeightedAverage => {
                let mut best: Option<(&ActionKind, f64, f64, &Vec<Candidate>)> = None;
                for (action, votes) in groups {
                    let weight_sum: f64 = votes.iter().map(|c| c.weight).sum();
                    let score: f64 = votes.iter().map(|c| c.weight * c.confidence).sum();
                    let conf = if weight_sum > 0.0 { score / weight_sum } else { 0.0 };
                    if best.as_ref().map_or(true, |(_, b, _, _)| score > *b) {
                        best = Some((action, score, conf, votes));
                    }
                }
                let (action, _, conf, votes) = best.expect("non-empty groups");
                (action.clone(), conf, top_voter(votes))
            }
        }
    }

    /// Labels proposed by any candidate, kept when their group confidence
    /// meets the label gate, deduplicated in first-seen order.
    fn passing_labels(&self, candidates: &[Candidate]) -> Vec<String> {
        let mut labels = Vec::new();
        for candidate in candidates {
            if let ActionKind::Label(name) = &candidate.action {
                if labels.contains(name) {
                    continue;
                }
                if self.passing_label_confidence(candidates, name).is_some() {
                    labels.push(name.clone());
                }
            }
        }
        labels
    }

    fn passing_label_confidence(&self, candidates: &[Candidate], label: &str) -> Option<f64> {
        let action = ActionKind::Label(label.to_string());
        let votes: Vec<Candidate> = candidates
            .iter()
            .filter(|c| c.action == action)
            .cloned()
            .collect();
        if votes.is_empty() {
            return None;
        }
        let conf = confidence_of(&votes, self.method);
        (conf >= self.gates.threshold(&action)).then_some(conf)
    }

    fn declared_index(&self, profile_id: &str) -> usize {
        self.config
            .profile_order
            .iter()
            .position(|id| id == profile_id)
            .unwrap_or(usize::MAX)
    }
}

/// Highest-confidence voter in a group; first seen wins ties.
fn top_voter(votes: &[Candidate]) -> Option<String> {
    let mut best: Option<&Candidate> = None;
    for vote in votes {
        if best.map_or(true, |b| vote.confidence > b.confidence) {
            best = Some(vote);
        }
    }
    best.map(|c| c.profile_id.clone())
}

fn is_gated(response: &ClassificationResponse) -> bool {
    response.reasons.first().map(String::as_str) == Some(GATED_REASON)
}

/// Root object for cross-profile expressions: one key per completed
/// profile, plus the payload when available.
fn responses_root(responses: &[ClassificationResponse], payload: Option<Value>) -> Value {
    let mut map = serde_json::Map::new();
    for response in responses {
        map.insert(response.profile_id.clone(), response.to_value());
    }
    if let Some(p) = payload {
        map.insert("payload".to_string(), p);
    }
    Value::Object(map)
}

fn method_name(method: WeightMethod) -> &'static str {
    match method {
        WeightMethod::HighestConfidence => "highest_confidence",
        WeightMethod::Consensus => "consensus",
        WeightMethod::WeightedAverage => "weighted_average",
    }
}

fn group_by_action(candidates: &[Candidate]) -> Vec<(ActionKind, Vec<Candidate>)> {
    let mut groups: Vec<(ActionKind, Vec<Candidate>)> = Vec::new();
    for candidate in candidates {
        match groups.iter_mut().find(|(a, _)| *a == candidate.action) {
            Some((_, votes)) => votes.push(candidate.clone()),
            None => groups.push((candidate.action.clone(), vec![candidate.clone()])),
        }
    }
    groups
}

fn groups_confidence(
    groups: &[(ActionKind, Vec<Candidate>)],
    action: &ActionKind,
    method: WeightMethod,
) -> Option<f64> {
    groups
        .iter()
        .find(|(a, _)| a == action)
        .map(|(_, votes)| confidence_of(votes, method))
}

/// Group confidence under a method: max for highest-confidence/consensus,
/// weighted mean for weighted-average.
fn confidence_of(votes: &[Candidate], method: WeightMethod) -> f64 {
    match method {
        WeightMethod::HighestConfidence | WeightMethod::Consensus => {
            votes.iter().map(|c| c.confidence).fold(0.0_f64, f64::max)
        }
        WeightMethod::WeightedAverage => {
            let weight_sum: f64 = votes.iter().map(|c| c.weight).sum();
            if weight_sum <= 0.0 {
                return 0.0;
            }
            votes.iter().map(|c| c.weight * c.confidence).sum::<f64>() / weight_sum
        }
    }
}
