//! Batch orchestrator — drives pages of messages through the pipeline with
//! bounded concurrency, rate limits, checkpointing, and cooperative
//! cancellation.
//!
//! Workers pull from a bounded queue (one shared receiver, doorway-style)
//! and never share mutable state beyond the read-only registry snapshot,
//! the circuit breaker inside the gateway, and the audit writer. The audit
//! writer is a single task fed by a bounded channel; a full channel is the
//! backpressure signal that stalls workers before new classifier calls.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::audit::{AuditChain, EventRecord, EventType};
use crate::cancel::{CancelSource, CancelToken};
use crate::classifier::ClassifierGateway;
use crate::config::Config;
use crate::error::{BatchError, ClassifierError, Error, ErrorClass, MailboxError};
use crate::extractor::FeatureExtractor;
use crate::mailbox::{MailboxAdapter, MailboxPage};
use crate::message::{
    ClassificationResponse, Decision, Message, Payload, SenderReputation,
};
use crate::planner::{ActionPlan, ActionPlanner};
use crate::profile::Registry;
use crate::ratelimit::TokenBucket;
use crate::resolver::{DecisionResolver, GATED_REASON};

/// Per-batch run parameters.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Mailbox search query. The default excludes provider spam/trash.
    pub query: String,
    /// Plan and record everything, dispatch nothing.
    pub dry_run: bool,
    /// Resume from the persisted cursor checkpoint.
    pub resume: bool,
    /// Sender-reputation records keyed by sender domain.
    pub reputations: BTreeMap<String, SenderReputation>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            query: "-in:spam -in:trash".to_string(),
            dry_run: false,
            resume: false,
            reputations: BTreeMap::new(),
        }
    }
}

/// Aggregate statistics for one batch.
#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    pub total: usize,
    pub processed: usize,
    pub failed: usize,
    pub action_counts: BTreeMap<String, usize>,
    pub avg_confidence: f64,
    pub duration: Duration,
    pub dry_run: bool,
}

/// Outcome of one message's trip through the pipeline.
struct MessageOutcome {
    decision: Decision,
    applied: bool,
}

#[derive(Clone)]
struct WorkerCtx {
    config: Arc<Config>,
    options: Arc<RunOptions>,
    registry: Arc<Registry>,
    extractor: Arc<FeatureExtractor>,
    gateway: Arc<ClassifierGateway>,
    resolver: Arc<DecisionResolver>,
    planner: Arc<ActionPlanner>,
    mailbox: Arc<dyn MailboxAdapter>,
    classifier_bucket: Arc<TokenBucket>,
    mailbox_bucket: Arc<TokenBucket>,
    audit_tx: mpsc::Sender<EventRecord>,
    cancel: CancelToken,
    deadline_per_message: Duration,
}

/// Drives batches of messages through extract → classify → resolve → plan
/// → apply → audit.
pub struct Orchestrator {
    config: Arc<Config>,
    registry: Arc<Registry>,
    extractor: Arc<FeatureExtractor>,
    gateway: Arc<ClassifierGateway>,
    resolver: Arc<DecisionResolver>,
    planner: Arc<ActionPlanner>,
    mailbox: Arc<dyn MailboxAdapter>,
    audit: Arc<AuditChain>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        registry: Arc<Registry>,
        gateway: Arc<ClassifierGateway>,
        mailbox: Arc<dyn MailboxAdapter>,
        audit: Arc<AuditChain>,
    ) -> Result<Self, Error> {
        let resolver = DecisionResolver::new(
            config.resolver.clone(),
            config.calibration.clone(),
            config.gates.clone(),
        )?;
        Ok(Self {
            extractor: Arc::new(FeatureExtractor::new(config.extractor.clone())),
            planner: Arc::new(ActionPlanner::new(config.planner.clone())),
            resolver: Arc::new(resolver),
            config: Arc::new(config),
            registry,
            gateway,
            mailbox,
            audit,
        })
    }

    /// Run a batch to completion or cancellation.
    pub async fn run(&self, options: RunOptions) -> Result<BatchSummary, Error> {
        let (source, token) = CancelSource::new();
        let _source = source;
        self.run_with_cancel(options, token).await
    }

    /// Run a batch under an external cancellation token.
    pub async fn run_with_cancel(
        &self,
        options: RunOptions,
        cancel: CancelToken,
    ) -> Result<BatchSummary, Error> {
        let started = Instant::now();
        let options = Arc::new(options);

        self.append_direct(
            EventRecord::new(EventType::SystemStart)
                .meta("query", serde_json::Value::String(options.query.clone()))
                .meta("dry_run", serde_json::Value::Bool(options.dry_run)),
        )
        .await?;
        for id in self.registry.order() {
            if let Ok(profile) = self.registry.get(id) {
                self.append_direct(
                    EventRecord::new(EventType::ProfileLoaded)
                        .profile(id.clone())
                        .meta(
                            "version",
                            serde_json::Value::String(profile.version.clone()),
                        ),
                )
                .await?;
            }
        }

        let result = self.run_inner(options.clone(), cancel, started).await;

        let stop_meta = match &result {
            Ok(summary) => EventRecord::new(EventType::SystemStop)
                .meta("processed", serde_json::json!(summary.processed))
                .meta("failed", serde_json::json!(summary.failed)),
            Err(e) => EventRecord::new(EventType::SystemStop)
                .meta("error", serde_json::Value::String(e.to_string())),
        };
        // Best effort: the chain may be the thing that failed.
        let _ = self.append_direct(stop_meta).await;

        result
    }

    async fn run_inner(
        &self,
        options: Arc<RunOptions>,
        cancel: CancelToken,
        started: Instant,
    ) -> Result<BatchSummary, Error> {
        let orch = &self.config.orchestrator;
        let (halt_source, halt_token) = CancelSource::new();
        let halt_source = Arc::new(halt_source);

        // Audit writer: bounded queue, single appender. A full queue blocks
        // workers before their next classifier call.
        let (audit_tx, mut audit_rx) =
            mpsc::channel::<EventRecord>(orch.audit_backpressure_threshold.max(1));
        let writer_chain = self.audit.clone();
        let writer_halt = halt_source.clone();
        let writer = tokio::spawn(async move {
            while let Some(record) = audit_rx.recv().await {
                let chain = writer_chain.clone();
                let appended =
                    tokio::task::spawn_blocking(move || chain.append(record)).await;
                match appended {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => {
                        error!(error = %e, "Audit write failed, halting batch");
                        writer_halt.cancel();
                        return Some(Error::Audit(e));
                    }
                    Err(join) => {
                        error!(error = %join, "Audit writer task failed, halting batch");
                        writer_halt.cancel();
                        return Some(Error::Batch(BatchError::Halted(join.to_string())));
                    }
                }
            }
            None
        });

        // Effective cancellation: caller token or internal halt.
        let (merged_source, merged_token) = CancelSource::new();
        {
            let caller = cancel.clone();
            let halt = halt_token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = caller.cancelled() => merged_source.cancel(),
                    _ = halt.cancelled() => merged_source.cancel(),
                }
            });
        }

        let ctx = WorkerCtx {
            config: self.config.clone(),
            options: options.clone(),
            registry: self.registry.clone(),
            extractor: self.extractor.clone(),
            gateway: self.gateway.clone(),
            resolver: self.resolver.clone(),
            planner: self.planner.clone(),
            mailbox: self.mailbox.clone(),
            classifier_bucket: Arc::new(TokenBucket::new(
                self.config.classifier.rate_limit_per_sec,
                self.config.classifier.rate_limit_burst,
            )),
            mailbox_bucket: Arc::new(TokenBucket::new(
                self.config.mailbox.rate_limit_per_sec,
                self.config.mailbox.rate_limit_burst,
            )),
            audit_tx: audit_tx.clone(),
            cancel: merged_token.clone(),
            deadline_per_message: self.per_message_budget(),
        };

        let (work_tx, work_rx) = mpsc::channel::<Message>(orch.queue_depth.max(1));
        let work_rx = Arc::new(Mutex::new(work_rx));
        let (result_tx, mut result_rx) =
            mpsc::channel::<Result<MessageOutcome, Error>>(orch.queue_depth.max(1));

        let mut workers = Vec::with_capacity(orch.workers);
        for index in 0..orch.workers {
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            let ctx = ctx.clone();
            workers.push(tokio::spawn(async move {
                debug!(worker = index, "Worker started");
                loop {
                    let message = { work_rx.lock().await.recv().await };
                    let Some(message) = message else { break };
                    let outcome = process_message(&ctx, message).await;
                    if result_tx.send(outcome).await.is_err() {
                        break;
                    }
                }
                debug!(worker = index, "Worker finished");
            }));
        }
        drop(result_tx);

        let mut summary = BatchSummary {
            dry_run: options.dry_run,
            ..Default::default()
        };
        let mut confidence_sum = 0.0_f64;
        let mut batch_error: Option<Error> = None;

        let mut cursor: Option<String> = if options.resume {
            load_checkpoint(Path::new(&orch.checkpoint_path)).await
        } else {
            None
        };

        'pages: loop {
            if merged_token.is_cancelled() {
                break;
            }
            ctx.mailbox_bucket.acquire().await;
            let page = match self
                .fetch_page_with_retry(cursor.as_deref(), &options.query, &merged_token)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    batch_error = Some(e);
                    break;
                }
            };

            let count = page.messages.len();
            summary.total += count;
            info!(count, cursor = cursor.as_deref().unwrap_or(""), "Fetched page");

            // Feed the queue and collect results concurrently, so a page
            // larger than the queue can never wedge the dispatcher.
            let mut pending = page.messages.into_iter();
            let mut next_message = pending.next();
            let mut received = 0usize;
            let mut aborted = false;
            while received < count && !aborted {
                match next_message.take() {
                    Some(message) => tokio::select! {
                        permit = work_tx.reserve() => match permit {
                            Ok(permit) => {
                                permit.send(message);
                                next_message = pending.next();
                            }
                            Err(_) => aborted = true,
                        },
                        result = result_rx.recv() => {
                            next_message = Some(message);
                            received += 1;
                            aborted = tally_result(
                                result,
                                &mut summary,
                                &mut confidence_sum,
                                &mut batch_error,
                                &halt_source,
                            );
                        }
                    },
                    None => {
                        let result = result_rx.recv().await;
                        received += 1;
                        aborted = tally_result(
                            result,
                            &mut summary,
                            &mut confidence_sum,
                            &mut batch_error,
                            &halt_source,
                        );
                    }
                }
            }
            if aborted {
                break 'pages;
            }

            // Page complete: persist the cursor for crash recovery.
            if let Some(next) = &page.next_cursor {
                save_checkpoint(Path::new(&orch.checkpoint_path), next).await;
            }

            if batch_error.is_some() || merged_token.is_cancelled() {
                break;
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        // Let workers drain, then flush the audit queue. Closing the result
        // channel keeps a late worker send from blocking the join.
        drop(work_tx);
        result_rx.close();
        for worker in workers {
            let _ = worker.await;
        }
        drop(ctx);
        drop(audit_tx);
        let writer_error = writer.await.ok().flatten();

        if let Some(e) = batch_error.or(writer_error) {
            return Err(e);
        }
        if cancel.is_cancelled() {
            return Err(Error::Batch(BatchError::Cancelled));
        }

        summary.avg_confidence = if summary.processed > 0 {
            confidence_sum / summary.processed as f64
        } else {
            0.0
        };
        summary.duration = started.elapsed();
        info!(
            processed = summary.processed,
            failed = summary.failed,
            duration_ms = summary.duration.as_millis() as u64,
            "Batch complete"
        );
        Ok(summary)
    }

    /// Per-message context budget: the sum of every profile's timeout,
    /// scaled by the configured safety factor.
    fn per_message_budget(&self) -> Duration {
        let total: Duration = self
            .registry
            .order()
            .iter()
            .filter_map(|id| self.registry.get(id).ok())
            .map(|p| p.params.timeout)
            .sum();
        let scaled = total.as_secs_f64() * self.config.orchestrator.deadline_safety_factor;
        Duration::from_secs_f64(scaled.max(1.0))
    }

    async fn fetch_page_with_retry(
        &self,
        cursor: Option<&str>,
        query: &str,
        cancel: &CancelToken,
    ) -> Result<MailboxPage, Error> {
        let attempts = self.config.mailbox.retry_attempts.max(1);
        let mut last: Option<MailboxError> = None;
        for attempt in 0..attempts {
            if cancel.is_cancelled() {
                return Err(Error::Batch(BatchError::Cancelled));
            }
            match self
                .mailbox
                .list_page(cursor, query, self.config.mailbox.page_size)
                .await
            {
                Ok(page) => return Ok(page),
                Err(e) => match e.class() {
                    ErrorClass::Transient => {
                        let backoff = retry_backoff(&e, attempt);
                        warn!(error = %e, attempt, "Page fetch failed, retrying");
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(Error::Batch(BatchError::Cancelled)),
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        last = Some(e);
                    }
                    _ => return Err(Error::Mailbox(e)),
                },
            }
        }
        Err(Error::Mailbox(last.unwrap_or(MailboxError::Transient(
            "page fetch retries exhausted".into(),
        ))))
    }

    async fn append_direct(&self, record: EventRecord) -> Result<(), Error> {
        let chain = self.audit.clone();
        tokio::task::spawn_blocking(move || chain.append(record))
            .await
            .map_err(|e| Error::Batch(BatchError::Halted(e.to_string())))?
            .map_err(Error::Audit)?;
        Ok(())
    }
}

/// Fold one worker result into the batch summary. Returns true when the
/// result stream has ended and the page loop must stop.
fn tally_result(
    result: Option<Result<MessageOutcome, Error>>,
    summary: &mut BatchSummary,
    confidence_sum: &mut f64,
    batch_error: &mut Option<Error>,
    halt: &Arc<CancelSource>,
) -> bool {
    match result {
        Some(Ok(outcome)) => {
            summary.processed += 1;
            *confidence_sum += outcome.decision.confidence;
            *summary
                .action_counts
                .entry(outcome.decision.action.to_string())
                .or_insert(0) += 1;
            if outcome.applied {
                debug!(message = %outcome.decision.message_id, "Actions applied");
            }
            false
        }
        Some(Err(e)) => {
            summary.failed += 1;
            match e.class() {
                ErrorClass::Cancelled => {}
                ErrorClass::Fatal | ErrorClass::Integrity => {
                    error!(error = %e, "Halting batch");
                    *batch_error = Some(e);
                    halt.cancel();
                }
                _ => warn!(error = %e, "Message failed"),
            }
            false
        }
        None => true,
    }
}

// ── Per-message pipeline ────────────────────────────────────────────

async fn process_message(ctx: &WorkerCtx, message: Message) -> Result<MessageOutcome, Error> {
    if ctx.cancel.is_cancelled() {
        return Err(Error::Batch(BatchError::Cancelled));
    }

    // A: extract, then attach the caller-supplied reputation record.
    let mut payload = ctx
        .extractor
        .extract(&message, SenderReputation::default());
    if let Some(reputation) = ctx.options.reputations.get(&payload.sender_domain) {
        payload.sender_reputation = reputation.clone();
    }

    let deadline = Instant::now() + ctx.deadline_per_message;

    // B/C/D: classify with each profile in dependency order, honoring
    // conditional-execution gates against already-completed responses.
    let mut completed: Vec<ClassificationResponse> = Vec::new();
    for id in ctx.registry.order() {
        let Ok(profile) = ctx.registry.get(id) else {
            continue;
        };
        if !ctx.resolver.should_run(profile, &completed) {
            debug!(profile = %id, message = %message.id, "Profile gated out");
            completed.push(ClassificationResponse::synthesized(id, GATED_REASON));
            continue;
        }

        // Backpressure: make sure the audit queue has room before spending
        // inference time.
        match ctx.audit_tx.reserve().await {
            Ok(permit) => drop(permit),
            Err(_) => return Err(Error::Batch(BatchError::Halted("audit writer gone".into()))),
        }
        ctx.classifier_bucket.acquire().await;

        match ctx
            .gateway
            .classify(profile, &payload, deadline, &ctx.cancel)
            .await
        {
            Ok(response) => completed.push(response),
            Err(ClassifierError::Cancelled) if ctx.cancel.is_cancelled() => {
                return Err(Error::Batch(BatchError::Cancelled));
            }
            Err(e) => {
                debug!(profile = %id, message = %message.id, error = %e, "Classification failed, synthesizing stub");
                completed.push(ClassificationResponse::synthesized(id, e.reason_tag()));
            }
        }
    }

    // Breaker transitions ride the audit chain as classifier config changes.
    for transition in ctx.gateway.drain_breaker_transitions() {
        let record = EventRecord::new(EventType::ConfigChanged)
            .meta("subsystem", serde_json::Value::String("classifier".into()))
            .meta(
                "breaker_from",
                serde_json::Value::String(transition.from.as_str().into()),
            )
            .meta(
                "breaker_to",
                serde_json::Value::String(transition.to.as_str().into()),
            )
            .meta(
                "consecutive_failures",
                serde_json::json!(transition.consecutive_failures),
            );
        send_audit(ctx, record).await?;
    }

    // E: resolve.
    let decision = ctx
        .resolver
        .resolve(&ctx.registry, completed, &payload, ctx.options.dry_run);

    // F: plan against the message's current labels.
    let plan = ctx.planner.plan(&decision, &message.labels);

    // G: the decision is recorded whether or not anything gets dispatched.
    let mut classified = EventRecord::new(EventType::Classified)
        .message(message.id.clone())
        .action(decision.action.to_string())
        .confidence(decision.confidence)
        .meta(
            "resolution_path",
            serde_json::json!(decision.resolution_path),
        )
        .meta("payload_sha256", serde_json::json!(payload_fingerprint(&payload)))
        .meta("decision_sha256", serde_json::json!(decision.content_hash()))
        .meta("dry_run", serde_json::json!(decision.dry_run));
    if let Some(source) = &decision.source {
        classified = classified.profile(source.clone());
    }
    send_audit(ctx, classified).await?;

    if plan.is_noop() {
        debug!(message = %message.id, "No operations needed");
        return Ok(MessageOutcome {
            decision,
            applied: false,
        });
    }

    // Cancellation discards planned-but-undispatched actions; the decision
    // entry above is already in the audit queue and will flush.
    if ctx.cancel.is_cancelled() {
        return Err(Error::Batch(BatchError::Cancelled));
    }

    if ctx.options.dry_run {
        debug!(
            message = %message.id,
            add = ?plan.add_labels,
            remove = ?plan.remove_labels,
            "Dry run: operations planned, not dispatched"
        );
        return Ok(MessageOutcome {
            decision,
            applied: false,
        });
    }

    apply_plan(ctx, &plan).await?;

    let applied = EventRecord::new(EventType::ActionApplied)
        .message(message.id.clone())
        .action(decision.action.to_string())
        .confidence(decision.confidence)
        .meta("labels_added", serde_json::json!(plan.add_labels))
        .meta("labels_removed", serde_json::json!(plan.remove_labels));
    send_audit(ctx, applied).await?;

    Ok(MessageOutcome {
        decision,
        applied: true,
    })
}

/// Dispatch a plan through the mailbox adapter with bounded retries for
/// transient and rate-limited errors.
async fn apply_plan(ctx: &WorkerCtx, plan: &ActionPlan) -> Result<(), Error> {
    // Any label the plan adds may not exist yet; creation is idempotent.
    for label in &plan.add_labels {
        ctx.mailbox_bucket.acquire().await;
        retry_mailbox(ctx, || ctx.mailbox.ensure_label(label)).await?;
    }

    ctx.mailbox_bucket.acquire().await;
    retry_mailbox(ctx, || {
        ctx.mailbox
            .modify_labels(&plan.message_id, &plan.add_labels, &plan.remove_labels)
    })
    .await?;
    Ok(())
}

async fn retry_mailbox<T, F, Fut>(ctx: &WorkerCtx, mut call: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, MailboxError>>,
{
    let attempts = ctx.config.mailbox.retry_attempts.max(1);
    let mut last: Option<MailboxError> = None;
    for attempt in 0..attempts {
        if ctx.cancel.is_cancelled() {
            return Err(Error::Batch(BatchError::Cancelled));
        }
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) => match e.class() {
                ErrorClass::Transient => {
                    let backoff = retry_backoff(&e, attempt);
                    warn!(error = %e, attempt, "Mailbox call failed, retrying");
                    tokio::select! {
                        _ = ctx.cancel.cancelled() => return Err(Error::Batch(BatchError::Cancelled)),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    last = Some(e);
                }
                _ => return Err(Error::Mailbox(e)),
            },
        }
    }
    Err(Error::Mailbox(last.unwrap_or(MailboxError::Transient(
        "mailbox retries exhausted".into(),
    ))))
}

fn retry_backoff(error: &MailboxError, attempt: u32) -> Duration {
    if let MailboxError::RateLimited {
        retry_after: Some(after),
    } = error
    {
        return *after;
    }
    Duration::from_millis(1000 * 2u64.saturating_pow(attempt))
}

async fn send_audit(ctx: &WorkerCtx, record: EventRecord) -> Result<(), Error> {
    ctx.audit_tx
        .send(record)
        .await
        .map_err(|_| Error::Batch(BatchError::Halted("audit writer gone".into())))
}

fn payload_fingerprint(payload: &Payload) -> String {
    let json = serde_json::to_string(payload).unwrap_or_default();
    hex::encode(Sha256::digest(json.as_bytes()))
}

// ── Checkpointing ───────────────────────────────────────────────────

async fn save_checkpoint(path: &Path, cursor: &str) {
    if let Some(parent) = path.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    if let Err(e) = tokio::fs::write(path, cursor).await {
        warn!(error = %e, path = %path.display(), "Failed to persist checkpoint");
    }
}

async fn load_checkpoint(path: &Path) -> Option<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(cursor) if !cursor.trim().is_empty() => Some(cursor.trim().to_string()),
        _ => None,
    }
}
