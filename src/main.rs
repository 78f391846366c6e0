use std::path::Path;
use std::sync::Arc;

use mailsentinel::audit::AuditChain;
use mailsentinel::cancel::CancelSource;
use mailsentinel::classifier::{ClassifierGateway, OllamaProvider};
use mailsentinel::config::Config;
use mailsentinel::error::{Error, ErrorClass};
use mailsentinel::extractor::FeatureExtractor;
use mailsentinel::mailbox::InMemoryMailbox;
use mailsentinel::message::{Message, SenderReputation};
use mailsentinel::orchestrator::{Orchestrator, RunOptions};
use mailsentinel::profile::Registry;

/// Exit codes: 0 success, 2 validation failure, 3 integrity failure,
/// 4 external-dependency failure, 1 generic error.
const EXIT_VALIDATION: i32 = 2;
const EXIT_INTEGRITY: i32 = 3;
const EXIT_DEPENDENCY: i32 = 4;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let code = dispatch(&args).await;
    std::process::exit(code);
}

async fn dispatch(args: &[String]) -> i32 {
    let verbs: Vec<&str> = args.iter().map(String::as_str).collect();
    match verbs.as_slice() {
        ["run", rest @ ..] => cmd_run(rest).await,
        ["profiles", "validate"] => cmd_profiles_validate(),
        ["profiles", "test", profile_id, fixtures] => {
            cmd_profiles_test(profile_id, fixtures).await
        }
        ["audit", "verify"] => cmd_audit_verify(),
        ["config", "validate"] => cmd_config_validate(),
        _ => {
            eprintln!("mailsentinel v{}", env!("CARGO_PKG_VERSION"));
            eprintln!("usage:");
            eprintln!("  mailsentinel run [--apply] [--resume] [--query <q>]");
            eprintln!("  mailsentinel profiles validate");
            eprintln!("  mailsentinel profiles test <profile> <fixture-dir>");
            eprintln!("  mailsentinel audit verify");
            eprintln!("  mailsentinel config validate");
            1
        }
    }
}

fn load_config() -> Result<Config, i32> {
    let path = std::env::var("MAILSENTINEL_CONFIG")
        .unwrap_or_else(|_| "mailsentinel.yaml".to_string());
    Config::load(Some(Path::new(&path)), |_| {}).map_err(|e| {
        eprintln!("configuration error: {e}");
        EXIT_VALIDATION
    })
}

fn exit_code_for(error: &Error) -> i32 {
    match error.class() {
        ErrorClass::Validation => EXIT_VALIDATION,
        ErrorClass::Integrity => EXIT_INTEGRITY,
        ErrorClass::Transient
        | ErrorClass::Schema
        | ErrorClass::BreakerOpen
        | ErrorClass::Fatal => EXIT_DEPENDENCY,
        ErrorClass::Cancelled => 1,
    }
}

/// Triage a batch. Messages come from the fixture directory named by
/// MAILSENTINEL_FIXTURES — provider connectors live outside this crate and
/// plug in through the `MailboxAdapter` trait.
async fn cmd_run(rest: &[&str]) -> i32 {
    let config = match load_config() {
        Ok(c) => c,
        Err(code) => return code,
    };

    let mut options = RunOptions {
        dry_run: !rest.contains(&"--apply"),
        resume: rest.contains(&"--resume"),
        ..Default::default()
    };
    if let Some(pos) = rest.iter().position(|a| *a == "--query") {
        if let Some(q) = rest.get(pos + 1) {
            options.query = q.to_string();
        }
    }

    let registry = match Registry::load_all(Path::new(&config.profiles.directory)) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("profile load error: {e}");
            return EXIT_VALIDATION;
        }
    };
    if registry.is_empty() {
        eprintln!("no profiles loaded from {}", config.profiles.directory);
        return EXIT_VALIDATION;
    }

    let provider = match OllamaProvider::new(&config.classifier.endpoint) {
        Ok(p) => Arc::new(p),
        Err(e) => {
            eprintln!("classifier endpoint rejected: {e}");
            return EXIT_VALIDATION;
        }
    };
    let gateway = Arc::new(ClassifierGateway::new(provider, config.classifier.clone()));
    if let Err(e) = gateway.health_check().await {
        eprintln!("classifier health check failed: {e}");
        return EXIT_DEPENDENCY;
    }

    let mailbox = match fixture_mailbox() {
        Ok(m) => m,
        Err(code) => return code,
    };

    let audit = match AuditChain::open(config.audit.clone()) {
        Ok(a) => Arc::new(a),
        Err(e) => {
            eprintln!("audit chain error: {e}");
            return EXIT_INTEGRITY;
        }
    };

    let orchestrator =
        match Orchestrator::new(config, Arc::new(registry), gateway, mailbox, audit) {
            Ok(o) => o,
            Err(e) => {
                eprintln!("resolver configuration error: {e}");
                return EXIT_VALIDATION;
            }
        };

    let (source, token) = CancelSource::new();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupt received, draining batch");
            source.cancel();
        }
    });

    match orchestrator.run_with_cancel(options, token).await {
        Ok(summary) => {
            println!(
                "processed {} of {} messages ({} failed), avg confidence {:.2}{}",
                summary.processed,
                summary.total,
                summary.failed,
                summary.avg_confidence,
                if summary.dry_run { " [dry run]" } else { "" },
            );
            for (action, count) in &summary.action_counts {
                println!("  {action}: {count}");
            }
            0
        }
        Err(e) => {
            eprintln!("batch failed: {e}");
            exit_code_for(&e)
        }
    }
}

fn cmd_profiles_validate() -> i32 {
    let config = match load_config() {
        Ok(c) => c,
        Err(code) => return code,
    };
    let registry = match Registry::load_all(Path::new(&config.profiles.directory)) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("profile load error: {e}");
            return EXIT_VALIDATION;
        }
    };

    println!("loaded {} profile(s): {:?}", registry.len(), registry.ids());
    println!("order: {:?}", registry.order());
    for q in registry.quarantined() {
        println!("quarantined {}: {}", q.unit, q.reason);
    }
    if config.profiles.strict_validation && !registry.quarantined().is_empty() {
        EXIT_VALIDATION
    } else {
        0
    }
}

/// Run one profile over fixture messages and print each validated response.
async fn cmd_profiles_test(profile_id: &str, fixtures: &str) -> i32 {
    let config = match load_config() {
        Ok(c) => c,
        Err(code) => return code,
    };
    let registry = match Registry::load_all(Path::new(&config.profiles.directory)) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("profile load error: {e}");
            return EXIT_VALIDATION;
        }
    };
    let profile = match registry.get(profile_id) {
        Ok(p) => p.clone(),
        Err(e) => {
            eprintln!("{e}");
            return EXIT_VALIDATION;
        }
    };

    let messages = match load_fixture_messages(Path::new(fixtures)) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("fixture error: {e}");
            return EXIT_VALIDATION;
        }
    };

    let provider = match OllamaProvider::new(&config.classifier.endpoint) {
        Ok(p) => Arc::new(p),
        Err(e) => {
            eprintln!("classifier endpoint rejected: {e}");
            return EXIT_VALIDATION;
        }
    };
    let gateway = ClassifierGateway::new(provider, config.classifier.clone());
    let extractor = FeatureExtractor::new(config.extractor.clone());
    let token = mailsentinel::cancel::CancelToken::never();

    let mut failures = 0;
    for message in &messages {
        let payload = extractor.extract(message, SenderReputation::default());
        let deadline = std::time::Instant::now() + profile.params.timeout;
        match gateway.classify(&profile, &payload, deadline, &token).await {
            Ok(response) => println!(
                "{}: action={} confidence={:.2} reasons={:?}",
                message.id, response.action, response.confidence, response.reasons
            ),
            Err(e) => {
                println!("{}: FAILED ({e})", message.id);
                failures += 1;
            }
        }
    }
    if failures > 0 {
        EXIT_DEPENDENCY
    } else {
        0
    }
}

fn cmd_audit_verify() -> i32 {
    let config = match load_config() {
        Ok(c) => c,
        Err(code) => return code,
    };
    match AuditChain::verify_dir(
        Path::new(&config.audit.directory),
        config.audit.secret.as_deref(),
    ) {
        Ok(count) => {
            println!("verified {count} audit entries");
            0
        }
        Err(e) => {
            eprintln!("audit verification failed: {e}");
            EXIT_INTEGRITY
        }
    }
}

fn cmd_config_validate() -> i32 {
    match load_config() {
        Ok(_) => {
            println!("configuration ok");
            0
        }
        Err(code) => code,
    }
}

// ── Fixture loading ─────────────────────────────────────────────────

fn fixture_mailbox() -> Result<Arc<InMemoryMailbox>, i32> {
    let dir = std::env::var("MAILSENTINEL_FIXTURES").map_err(|_| {
        eprintln!("MAILSENTINEL_FIXTURES not set (mailbox connectors plug in via the adapter trait)");
        EXIT_VALIDATION
    })?;
    let messages = load_fixture_messages(Path::new(&dir)).map_err(|e| {
        eprintln!("fixture error: {e}");
        EXIT_VALIDATION
    })?;
    Ok(Arc::new(InMemoryMailbox::new(messages)))
}

fn load_fixture_messages(dir: &Path) -> Result<Vec<Message>, String> {
    let mut paths: Vec<_> = std::fs::read_dir(dir)
        .map_err(|e| e.to_string())?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
        .collect();
    paths.sort();

    let mut messages = Vec::with_capacity(paths.len());
    for path in paths {
        let data = std::fs::read_to_string(&path).map_err(|e| e.to_string())?;
        let message: Message = serde_json::from_str(&data)
            .map_err(|e| format!("{}: {e}", path.display()))?;
        messages.push(message);
    }
    if messages.is_empty() {
        return Err(format!("no .json fixtures under {}", dir.display()));
    }
    Ok(messages)
}
