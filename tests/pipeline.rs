//! End-to-end pipeline tests: fixture messages through extract → classify
//! (scripted inference) → resolve → plan → apply → audit, asserting on
//! mailbox state and the audit chain.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use mailsentinel::audit::AuditChain;
use mailsentinel::classifier::{
    ClassifierGateway, CompletionRequest, CompletionResponse, InferenceProvider,
};
use mailsentinel::config::Config;
use mailsentinel::error::ClassifierError;
use mailsentinel::mailbox::InMemoryMailbox;
use mailsentinel::message::Message;
use mailsentinel::orchestrator::{Orchestrator, RunOptions};
use mailsentinel::profile::Registry;

// ── Scripted inference ──────────────────────────────────────────────

type Route = Arc<dyn Fn(&serde_json::Value) -> Result<String, ClassifierError> + Send + Sync>;

/// Routes each chat call by model name to a canned response function that
/// sees the payload JSON from the final user turn.
struct RoutedProvider {
    routes: HashMap<String, Route>,
    calls: AtomicU32,
}

impl RoutedProvider {
    fn new() -> Self {
        Self {
            routes: HashMap::new(),
            calls: AtomicU32::new(0),
        }
    }

    fn route(
        mut self,
        model: &str,
        f: impl Fn(&serde_json::Value) -> Result<String, ClassifierError> + Send + Sync + 'static,
    ) -> Self {
        self.routes.insert(model.to_string(), Arc::new(f));
        self
    }

    fn respond(self, model: &str, json: &str) -> Self {
        let json = json.to_string();
        self.route(model, move |_| Ok(json.clone()))
    }

    fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceProvider for RoutedProvider {
    fn name(&self) -> &str {
        "routed"
    }

    async fn chat(&self, request: CompletionRequest) -> Result<CompletionResponse, ClassifierError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let payload: serde_json::Value = request
            .messages
            .last()
            .and_then(|m| serde_json::from_str(&m.content).ok())
            .unwrap_or(serde_json::Value::Null);
        let route = self
            .routes
            .get(&request.model)
            .unwrap_or_else(|| panic!("no route for model {}", request.model));
        route(&payload).map(|text| CompletionResponse {
            text,
            tokens_used: 12,
            duration_ms: 2,
            model_version: Some(request.model.clone()),
        })
    }

    async fn health_check(&self, _model: &str) -> Result<(), ClassifierError> {
        Ok(())
    }
}

// ── Fixtures ────────────────────────────────────────────────────────

fn write_profile(dir: &Path, file: &str, yaml: &str) {
    std::fs::write(dir.join(file), yaml).unwrap();
}

fn spam_profile() -> &'static str {
    "id: spam\nversion: '1.0'\nmodel: model-spam\nsystem: Detect spam and phishing.\n"
}

fn message(id: &str, subject: &str, headers: &[(&str, &str)]) -> Message {
    Message {
        id: id.into(),
        thread_id: format!("t-{id}"),
        headers: headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        subject: subject.into(),
        body: "Hello.".into(),
        body_html: None,
        labels: vec!["INBOX".into()],
        size: 64,
        attachments: vec![],
        thread_length: 1,
        date: Utc::now(),
    }
}

struct Harness {
    _profile_dir: tempfile::TempDir,
    audit_dir: tempfile::TempDir,
    state_dir: tempfile::TempDir,
    mailbox: Arc<InMemoryMailbox>,
    orchestrator: Orchestrator,
}

impl Harness {
    fn new(profiles: &[(&str, &str)], provider: RoutedProvider, messages: Vec<Message>) -> Self {
        Self::with_config(profiles, provider, messages, |_| {})
    }

    fn with_config(
        profiles: &[(&str, &str)],
        provider: RoutedProvider,
        messages: Vec<Message>,
        tweak: impl FnOnce(&mut Config),
    ) -> Self {
        let profile_dir = tempfile::tempdir().unwrap();
        for (file, yaml) in profiles {
            write_profile(profile_dir.path(), file, yaml);
        }
        let audit_dir = tempfile::tempdir().unwrap();
        let state_dir = tempfile::tempdir().unwrap();

        let mut config = Config::default();
        config.profiles.directory = profile_dir.path().display().to_string();
        config.audit.directory = audit_dir.path().display().to_string();
        config.orchestrator.checkpoint_path = state_dir
            .path()
            .join("checkpoint")
            .display()
            .to_string();
        config.orchestrator.workers = 2;
        config.classifier.rate_limit_per_sec = 0.0;
        config.mailbox.rate_limit_per_sec = 0.0;
        tweak(&mut config);

        let registry = Registry::load_all(profile_dir.path()).unwrap();
        assert!(
            registry.quarantined().is_empty(),
            "fixture profiles must load cleanly: {:?}",
            registry
                .quarantined()
                .iter()
                .map(|q| format!("{}: {}", q.unit, q.reason))
                .collect::<Vec<_>>()
        );

        let gateway = Arc::new(ClassifierGateway::new(
            Arc::new(provider),
            config.classifier.clone(),
        ));
        let mailbox = Arc::new(InMemoryMailbox::new(messages));
        let audit = Arc::new(AuditChain::open(config.audit.clone()).unwrap());
        let orchestrator = Orchestrator::new(
            config,
            Arc::new(registry),
            gateway,
            mailbox.clone(),
            audit,
        )
        .unwrap();

        Harness {
            _profile_dir: profile_dir,
            audit_dir,
            state_dir,
            mailbox,
            orchestrator,
        }
    }

    async fn apply(&self) -> mailsentinel::orchestrator::BatchSummary {
        self.orchestrator
            .run(RunOptions {
                dry_run: false,
                ..Default::default()
            })
            .await
            .unwrap()
    }

    fn audit_entries(&self) -> Vec<serde_json::Value> {
        let mut entries = Vec::new();
        let mut files: Vec<_> = std::fs::read_dir(self.audit_dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        files.sort();
        for file in files {
            for line in std::fs::read_to_string(file).unwrap().lines() {
                if !line.trim().is_empty() {
                    entries.push(serde_json::from_str(line).unwrap());
                }
            }
        }
        entries
    }

    fn verify_audit(&self) -> usize {
        AuditChain::verify_dir(self.audit_dir.path(), None).unwrap()
    }

    fn resolution_path_of(&self, message_id: &str) -> Vec<String> {
        self.audit_entries()
            .iter()
            .find(|e| {
                e["event_type"] == "classified" && e["message_id"] == message_id
            })
            .map(|e| {
                e["metadata"]["resolution_path"]
                    .as_array()
                    .unwrap()
                    .iter()
                    .map(|v| v.as_str().unwrap().to_string())
                    .collect()
            })
            .unwrap_or_default()
    }
}

// ── Scenarios ───────────────────────────────────────────────────────

#[tokio::test]
async fn obvious_phishing_is_archived_with_provenance() {
    let provider = RoutedProvider::new().respond(
        "model-spam",
        r#"{"action": "archive", "confidence": 0.96,
            "reasons": ["auth failed", "lookalike domain"],
            "risk_factors": {"phishing_score": 0.95}}"#,
    );
    let msg = message(
        "m1",
        "Your account will be closed",
        &[
            ("From", "security <alerts@applle-secure.com>"),
            (
                "Authentication-Results",
                "mx; dkim=fail; spf=fail; dmarc=fail",
            ),
        ],
    );
    let h = Harness::new(&[("spam.yaml", spam_profile())], provider, vec![msg]);

    let summary = h.apply().await;
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.action_counts.get("archive"), Some(&1));

    let labels = h.mailbox.labels_of("m1").unwrap();
    assert!(!labels.contains(&"INBOX".to_string()), "archived");
    assert!(labels.contains(&"MailSentinel/spam/archive".to_string()));

    // classified then action_applied, chained and verifiable
    let entries = h.audit_entries();
    let kinds: Vec<&str> = entries
        .iter()
        .filter(|e| e["message_id"] == "m1")
        .map(|e| e["event_type"].as_str().unwrap())
        .collect();
    assert_eq!(kinds, vec!["classified", "action_applied"]);
    h.verify_audit();
}

#[tokio::test]
async fn authenticated_invoice_is_starred() {
    let provider = RoutedProvider::new()
        .respond("model-spam", r#"{"action": "none", "confidence": 0.5}"#)
        .respond("model-invoices", r#"{"action": "star", "confidence": 0.88}"#);
    let msg = message(
        "m1",
        "Invoice #12345",
        &[
            ("From", "billing@acme-corp.com"),
            (
                "Authentication-Results",
                "mx; dkim=pass; spf=pass; dmarc=pass",
            ),
        ],
    );
    let h = Harness::new(
        &[
            ("spam.yaml", spam_profile()),
            (
                "invoices.yaml",
                "id: invoices\nversion: '1.0'\nmodel: model-invoices\nsystem: Spot invoices worth attention.\n",
            ),
        ],
        provider,
        vec![msg],
    );

    let summary = h.apply().await;
    assert_eq!(summary.action_counts.get("star"), Some(&1));

    let labels = h.mailbox.labels_of("m1").unwrap();
    assert!(labels.contains(&"STARRED".to_string()));
    assert!(labels.contains(&"MailSentinel/invoices/star".to_string()));
    assert!(labels.contains(&"INBOX".to_string()), "not archived");
}

#[tokio::test]
async fn star_beats_archive_within_margin() {
    let provider = RoutedProvider::new()
        .respond("model-spam", r#"{"action": "archive", "confidence": 0.86}"#)
        .respond("model-work", r#"{"action": "star", "confidence": 0.80}"#);
    let h = Harness::new(
        &[
            ("spam.yaml", spam_profile()),
            (
                "work.yaml",
                "id: work_priority\nversion: '1.0'\nmodel: model-work\nsystem: Find work-critical mail.\n",
            ),
        ],
        provider,
        vec![message("m1", "Quarterly report", &[("From", "boss@corp.com")])],
    );

    let summary = h.apply().await;
    assert_eq!(summary.action_counts.get("star"), Some(&1));
    let labels = h.mailbox.labels_of("m1").unwrap();
    assert!(labels.contains(&"STARRED".to_string()));
    assert!(labels.contains(&"INBOX".to_string()));
    assert!(h
        .resolution_path_of("m1")
        .contains(&"reconcile:star_over_archive".to_string()));
}

#[tokio::test]
async fn gated_demotion_leaves_mailbox_untouched() {
    let provider = RoutedProvider::new()
        .respond("model-spam", r#"{"action": "archive", "confidence": 0.82}"#);
    let h = Harness::new(
        &[("spam.yaml", spam_profile())],
        provider,
        vec![message("m1", "Maybe spam", &[("From", "x@y.com")])],
    );

    let summary = h.apply().await;
    assert_eq!(summary.action_counts.get("none"), Some(&1));
    assert_eq!(
        h.mailbox.labels_of("m1").unwrap(),
        vec!["INBOX".to_string()],
        "mailbox must not change under a gated decision"
    );
    assert_eq!(h.mailbox.modify_call_count(), 0);
    assert!(h
        .resolution_path_of("m1")
        .contains(&"gate:archive".to_string()));
}

#[tokio::test]
async fn conditional_execution_skips_profile() {
    let provider = RoutedProvider::new()
        .respond("model-spam", r#"{"action": "archive", "confidence": 0.9}"#)
        .route("model-security", |_| {
            panic!("security_alerts must not run when spam is confident")
        });
    let h = Harness::new(
        &[
            ("spam.yaml", spam_profile()),
            (
                "security.yaml",
                "id: security_alerts\nversion: '1.0'\nmodel: model-security\n\
                 system: Deep-scan suspicious mail.\ndepends_on: [spam]\n\
                 conditional_execution:\n  when: spam.confidence < 0.7\n  reason: spam already confident\n",
            ),
        ],
        provider,
        vec![message("m1", "Verify your account", &[("From", "x@y.com")])],
    );

    h.apply().await;
    assert!(h
        .resolution_path_of("m1")
        .contains(&"gated:security_alerts".to_string()));
}

#[tokio::test]
async fn breaker_opens_after_consecutive_failures() {
    let provider = RoutedProvider::new().route("model-spam", |_| {
        Err(ClassifierError::Transport("connection refused".into()))
    });
    let messages = (0..7)
        .map(|i| message(&format!("m{i}"), "msg", &[("From", "a@b.com")]))
        .collect();
    let h = Harness::with_config(
        &[("spam.yaml", spam_profile())],
        provider,
        messages,
        |config| {
            config.classifier.max_retries = 0;
            config.orchestrator.workers = 1; // keep failures strictly ordered
        },
    );

    let summary = h.apply().await;
    // every message resolves to none via synthesized stubs
    assert_eq!(summary.action_counts.get("none"), Some(&7));
    assert_eq!(h.mailbox.modify_call_count(), 0);

    // breaker transition recorded as a classifier config change
    let entries = h.audit_entries();
    let transition = entries
        .iter()
        .find(|e| {
            e["event_type"] == "config_changed"
                && e["metadata"]["subsystem"] == "classifier"
                && e["metadata"]["breaker_to"] == "open"
        })
        .expect("breaker transition audited");
    assert_eq!(transition["metadata"]["breaker_from"], "closed");

    // breaker_open stubs appear once the threshold is crossed
    let classified: Vec<&serde_json::Value> = entries
        .iter()
        .filter(|e| e["event_type"] == "classified")
        .collect();
    assert_eq!(classified.len(), 7);
    h.verify_audit();
}

#[tokio::test]
async fn breaker_open_skips_provider_calls() {
    let provider = Arc::new(RoutedProvider::new().route("model-spam", |_| {
        Err(ClassifierError::Transport("connection refused".into()))
    }));
    let messages: Vec<Message> = (0..8)
        .map(|i| message(&format!("m{i}"), "msg", &[("From", "a@b.com")]))
        .collect();

    let profile_dir = tempfile::tempdir().unwrap();
    write_profile(profile_dir.path(), "spam.yaml", spam_profile());
    let audit_dir = tempfile::tempdir().unwrap();
    let state_dir = tempfile::tempdir().unwrap();

    let mut config = Config::default();
    config.profiles.directory = profile_dir.path().display().to_string();
    config.audit.directory = audit_dir.path().display().to_string();
    config.orchestrator.checkpoint_path =
        state_dir.path().join("checkpoint").display().to_string();
    config.classifier.max_retries = 0;
    config.classifier.rate_limit_per_sec = 0.0;
    config.mailbox.rate_limit_per_sec = 0.0;
    config.orchestrator.workers = 1;

    let registry = Registry::load_all(profile_dir.path()).unwrap();
    let gateway = Arc::new(ClassifierGateway::new(
        provider.clone(),
        config.classifier.clone(),
    ));
    let mailbox = Arc::new(InMemoryMailbox::new(messages));
    let audit = Arc::new(AuditChain::open(config.audit.clone()).unwrap());
    let orchestrator =
        Orchestrator::new(config, Arc::new(registry), gateway, mailbox, audit).unwrap();

    let summary = orchestrator.run(RunOptions::default()).await.unwrap();
    assert_eq!(summary.processed, 8);
    // five failures trip the breaker; the remaining three fail fast without
    // ever reaching the adapter
    assert_eq!(provider.call_count(), 5);
}

#[tokio::test]
async fn dry_run_plans_but_never_dispatches() {
    let provider = RoutedProvider::new().respond(
        "model-spam",
        r#"{"action": "archive", "confidence": 0.96}"#,
    );
    let h = Harness::new(
        &[("spam.yaml", spam_profile())],
        provider,
        vec![message("m1", "spam", &[("From", "a@b.com")])],
    );

    let summary = h
        .orchestrator
        .run(RunOptions {
            dry_run: true,
            ..Default::default()
        })
        .await
        .unwrap();

    assert!(summary.dry_run);
    assert_eq!(summary.action_counts.get("archive"), Some(&1));
    assert_eq!(h.mailbox.modify_call_count(), 0);
    assert_eq!(h.mailbox.labels_of("m1").unwrap(), vec!["INBOX".to_string()]);

    // decision still audited, no action_applied entry
    let entries = h.audit_entries();
    assert!(entries.iter().any(|e| e["event_type"] == "classified"));
    assert!(!entries.iter().any(|e| e["event_type"] == "action_applied"));
}

#[tokio::test]
async fn replaying_a_batch_is_idempotent() {
    let respond = || {
        RoutedProvider::new().respond(
            "model-spam",
            r#"{"action": "archive", "confidence": 0.96}"#,
        )
    };
    let h = Harness::new(
        &[("spam.yaml", spam_profile())],
        respond(),
        vec![message("m1", "spam", &[("From", "a@b.com")])],
    );

    h.apply().await;
    let calls_after_first = h.mailbox.modify_call_count();
    assert_eq!(calls_after_first, 1);
    let labels_after_first = h.mailbox.labels_of("m1").unwrap();

    // Second pass over the already-converged mailbox: decisions repeat but
    // the planner emits no operations.
    h.apply().await;
    assert_eq!(h.mailbox.modify_call_count(), calls_after_first);
    assert_eq!(h.mailbox.labels_of("m1").unwrap(), labels_after_first);
}

#[tokio::test]
async fn multi_page_batches_checkpoint_cursor() {
    let provider = RoutedProvider::new().respond(
        "model-spam",
        r#"{"action": "none", "confidence": 0.3}"#,
    );
    let messages = (0..5)
        .map(|i| message(&format!("m{i}"), "msg", &[("From", "a@b.com")]))
        .collect();
    let h = Harness::with_config(
        &[("spam.yaml", spam_profile())],
        provider,
        messages,
        |config| config.mailbox.page_size = 2,
    );

    let summary = h.apply().await;
    assert_eq!(summary.total, 5);
    assert_eq!(summary.processed, 5);

    // the mid-batch cursor was persisted
    let checkpoint = std::fs::read_to_string(
        h.state_dir.path().join("checkpoint"),
    )
    .unwrap();
    assert!(!checkpoint.trim().is_empty());
}

#[tokio::test]
async fn decisions_are_deterministic_across_runs() {
    let build = || {
        let provider = RoutedProvider::new()
            .respond("model-spam", r#"{"action": "archive", "confidence": 0.86}"#)
            .respond("model-work", r#"{"action": "star", "confidence": 0.80}"#);
        Harness::new(
            &[
                ("spam.yaml", spam_profile()),
                (
                    "work.yaml",
                    "id: work_priority\nversion: '1.0'\nmodel: model-work\nsystem: Find work-critical mail.\n",
                ),
            ],
            provider,
            vec![message("m1", "report", &[("From", "boss@corp.com")])],
        )
    };

    let a = build();
    a.apply().await;
    let b = build();
    b.apply().await;

    let decision_of = |h: &Harness| {
        h.audit_entries()
            .into_iter()
            .find(|e| e["event_type"] == "classified")
            .unwrap()
    };
    let da = decision_of(&a);
    let db = decision_of(&b);
    assert_eq!(da["action"], db["action"]);
    assert_eq!(da["confidence"], db["confidence"]);
    assert_eq!(
        da["metadata"]["resolution_path"],
        db["metadata"]["resolution_path"]
    );
    assert_eq!(
        da["metadata"]["decision_sha256"],
        db["metadata"]["decision_sha256"]
    );
}

#[tokio::test]
async fn schema_garbage_falls_back_to_none() {
    let provider = RoutedProvider::new().respond("model-spam", "I think this is spam, maybe?");
    let h = Harness::with_config(
        &[("spam.yaml", spam_profile())],
        provider,
        vec![message("m1", "spam?", &[("From", "a@b.com")])],
        |config| config.classifier.max_retries = 0,
    );

    let summary = h.apply().await;
    assert_eq!(summary.action_counts.get("none"), Some(&1));
    assert_eq!(h.mailbox.modify_call_count(), 0);
}

#[tokio::test]
async fn provider_called_once_per_profile_per_message() {
    let provider = RoutedProvider::new()
        .respond("model-spam", r#"{"action": "none", "confidence": 0.2}"#);
    let messages: Vec<Message> = (0..3)
        .map(|i| message(&format!("m{i}"), "msg", &[("From", "a@b.com")]))
        .collect();

    // Keep the provider Arc outside the harness to count calls.
    let provider = Arc::new(provider);
    let profile_dir = tempfile::tempdir().unwrap();
    write_profile(profile_dir.path(), "spam.yaml", spam_profile());
    let audit_dir = tempfile::tempdir().unwrap();
    let state_dir = tempfile::tempdir().unwrap();

    let mut config = Config::default();
    config.profiles.directory = profile_dir.path().display().to_string();
    config.audit.directory = audit_dir.path().display().to_string();
    config.orchestrator.checkpoint_path =
        state_dir.path().join("checkpoint").display().to_string();
    config.classifier.rate_limit_per_sec = 0.0;
    config.mailbox.rate_limit_per_sec = 0.0;

    let registry = Registry::load_all(profile_dir.path()).unwrap();
    let gateway = Arc::new(ClassifierGateway::new(
        provider.clone(),
        config.classifier.clone(),
    ));
    let mailbox = Arc::new(InMemoryMailbox::new(messages));
    let audit = Arc::new(AuditChain::open(config.audit.clone()).unwrap());
    let orchestrator =
        Orchestrator::new(config, Arc::new(registry), gateway, mailbox, audit).unwrap();

    orchestrator.run(RunOptions::default()).await.unwrap();
    assert_eq!(provider.call_count(), 3);
}

#[tokio::test]
async fn reputation_records_reach_calibration() {
    // Trusted sender at 0.95 lifts a 0.65 star verdict over the 0.70 gate.
    let provider = RoutedProvider::new()
        .respond("model-spam", r#"{"action": "star", "confidence": 0.65}"#);
    let h = Harness::new(
        &[("spam.yaml", spam_profile())],
        provider,
        vec![message("m1", "hello", &[("From", "ceo@trusted.com")])],
    );

    let mut reputations = BTreeMap::new();
    reputations.insert(
        "trusted.com".to_string(),
        mailsentinel::message::SenderReputation {
            trust_score: 0.95,
            domain_age_days: Some(4000),
            previous_interactions: 12,
        },
    );
    let summary = h
        .orchestrator
        .run(RunOptions {
            dry_run: false,
            reputations,
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(summary.action_counts.get("star"), Some(&1));
    let path = h.resolution_path_of("m1");
    assert!(path.iter().any(|t| t.starts_with("calibrated:spam,+0.10")));
}
