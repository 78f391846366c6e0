//! Action planner — translates a Decision into the minimal idempotent set
//! of mailbox label operations.
//!
//! The planner always examines the message's *current* label set, so
//! replaying a decision on an unchanged mailbox yields zero operations and
//! replay after partial application converges.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::PlannerConfig;
use crate::message::{ActionKind, Decision};

/// System label for starred messages.
pub const STARRED: &str = "STARRED";
/// System label whose absence means "archived".
pub const INBOX: &str = "INBOX";
/// Namespace prefix for labels this system creates.
pub const LABEL_PREFIX: &str = "MailSentinel/";

/// The label mutations planned for one message. Empty add/remove sets mean
/// the mailbox already reflects the decision.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionPlan {
    pub message_id: String,
    pub add_labels: Vec<String>,
    pub remove_labels: Vec<String>,
    /// Planner notes recorded into the audit trail, e.g. `idempotent:noop`.
    pub notes: Vec<String>,
    /// Planned under dry-run: record, never dispatch.
    pub dry_run: bool,
}

impl ActionPlan {
    pub fn is_noop(&self) -> bool {
        self.add_labels.is_empty() && self.remove_labels.is_empty()
    }
}

/// Plans mailbox operations from decisions.
pub struct ActionPlanner {
    config: PlannerConfig,
}

impl ActionPlanner {
    pub fn new(config: PlannerConfig) -> Self {
        Self { config }
    }

    /// Build the minimal operation set for `decision` given the message's
    /// current labels.
    pub fn plan(&self, decision: &Decision, current_labels: &[String]) -> ActionPlan {
        let mut wanted: Vec<String> = Vec::new();
        let mut unwanted: Vec<String> = Vec::new();

        match &decision.action {
            ActionKind::None => {}
            ActionKind::Star => wanted.push(STARRED.to_string()),
            ActionKind::Archive => unwanted.push(INBOX.to_string()),
            ActionKind::Label(name) => wanted.push(name.clone()),
        }

        for label in &decision.labels_to_add {
            if !wanted.contains(label) {
                wanted.push(label.clone());
            }
        }
        for label in &decision.labels_to_remove {
            if !unwanted.contains(label) {
                unwanted.push(label.clone());
            }
        }

        if let Some(provenance) = self.provenance_label(decision) {
            if !wanted.contains(&provenance) {
                wanted.push(provenance);
            }
        }

        let add_labels: Vec<String> = wanted
            .into_iter()
            .filter(|l| !current_labels.contains(l))
            .collect();
        let remove_labels: Vec<String> = unwanted
            .into_iter()
            .filter(|l| current_labels.contains(l))
            .collect();

        let mut notes = Vec::new();
        if add_labels.is_empty() && remove_labels.is_empty() {
            notes.push("idempotent:noop".to_string());
            debug!(message = %decision.message_id, "Decision already applied, no operations");
        }

        ActionPlan {
            message_id: decision.message_id.clone(),
            add_labels,
            remove_labels,
            notes,
            dry_run: decision.dry_run,
        }
    }

    /// `MailSentinel/<profile>/<action>` for every non-`none` decision;
    /// `none` decisions get one only when configured to.
    fn provenance_label(&self, decision: &Decision) -> Option<String> {
        let source = decision.source.as_deref()?;
        if decision.action.is_none() && !self.config.provenance_on_none {
            return None;
        }
        Some(format!(
            "{LABEL_PREFIX}{source}/{}",
            decision.action.label()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planner() -> ActionPlanner {
        ActionPlanner::new(PlannerConfig::default())
    }

    fn decision(action: ActionKind, source: Option<&str>) -> Decision {
        Decision {
            message_id: "m1".into(),
            responses: vec![],
            action,
            confidence: 0.9,
            source: source.map(String::from),
            resolution_path: vec![],
            labels_to_add: vec![],
            labels_to_remove: vec![],
            dry_run: false,
        }
    }

    #[test]
    fn star_adds_starred_and_provenance() {
        let plan = planner().plan(
            &decision(ActionKind::Star, Some("invoices")),
            &["INBOX".to_string()],
        );
        assert_eq!(
            plan.add_labels,
            vec!["STARRED".to_string(), "MailSentinel/invoices/star".to_string()]
        );
        assert!(plan.remove_labels.is_empty());
    }

    #[test]
    fn archive_removes_inbox() {
        let plan = planner().plan(
            &decision(ActionKind::Archive, Some("spam")),
            &["INBOX".to_string()],
        );
        assert_eq!(plan.remove_labels, vec!["INBOX".to_string()]);
        assert!(plan
            .add_labels
            .contains(&"MailSentinel/spam/archive".to_string()));
    }

    #[test]
    fn archive_of_already_archived_is_partial() {
        // INBOX already absent: only the provenance label remains to add.
        let plan = planner().plan(&decision(ActionKind::Archive, Some("spam")), &[]);
        assert!(plan.remove_labels.is_empty());
        assert_eq!(plan.add_labels, vec!["MailSentinel/spam/archive".to_string()]);
    }

    #[test]
    fn replay_on_converged_state_is_noop() {
        let d = decision(ActionKind::Star, Some("invoices"));
        let converged = vec![
            "INBOX".to_string(),
            "STARRED".to_string(),
            "MailSentinel/invoices/star".to_string(),
        ];
        let plan = planner().plan(&d, &converged);
        assert!(plan.is_noop());
        assert_eq!(plan.notes, vec!["idempotent:noop".to_string()]);
    }

    #[test]
    fn label_action_ensures_label() {
        let plan = planner().plan(
            &decision(ActionKind::Label("Receipts".into()), Some("invoices")),
            &["INBOX".to_string()],
        );
        assert!(plan.add_labels.contains(&"Receipts".to_string()));
        assert!(plan
            .add_labels
            .contains(&"MailSentinel/invoices/label".to_string()));
    }

    #[test]
    fn merged_labels_are_planned() {
        let mut d = decision(ActionKind::Star, Some("a"));
        d.labels_to_add = vec!["Work".into(), "Urgent".into()];
        let plan = planner().plan(&d, &["Work".to_string()]);
        // Work already present, Urgent planned
        assert!(plan.add_labels.contains(&"Urgent".to_string()));
        assert!(!plan.add_labels.contains(&"Work".to_string()));
    }

    #[test]
    fn none_decision_plans_nothing_by_default() {
        let plan = planner().plan(&decision(ActionKind::None, Some("spam")), &["INBOX".into()]);
        assert!(plan.is_noop());
    }

    #[test]
    fn none_decision_provenance_when_configured() {
        let planner = ActionPlanner::new(PlannerConfig {
            provenance_on_none: true,
        });
        let plan = planner.plan(&decision(ActionKind::None, Some("spam")), &[]);
        assert_eq!(plan.add_labels, vec!["MailSentinel/spam/none".to_string()]);
    }

    #[test]
    fn dry_run_flag_propagates() {
        let mut d = decision(ActionKind::Archive, Some("spam"));
        d.dry_run = true;
        let plan = planner().plan(&d, &["INBOX".to_string()]);
        assert!(plan.dry_run);
        assert!(!plan.is_noop());
    }
}
