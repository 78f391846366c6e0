//! Error types for MailSentinel.
//!
//! Every failure mode carries a recovery class: the orchestrator keys its
//! retry/halt behavior off `Error::class`, never off string matching.

use std::time::Duration;

/// Recovery class for a failure. Each class has exactly one recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bounded retry with backoff.
    Transient,
    /// Classifier returned non-conforming JSON; retry once, else synthesize.
    Schema,
    /// Circuit breaker is open; fail fast per message, continue batch.
    BreakerOpen,
    /// Profile or config rejected at load; quarantine unit, continue.
    Validation,
    /// Audit-chain hash mismatch; halt orchestrator.
    Integrity,
    /// Auth expired or unrecoverable I/O; stop batch, checkpoint, surface.
    Fatal,
    /// Caller deadline or signal; drain, flush audit, return.
    Cancelled,
}

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Profile error: {0}")]
    Profile(#[from] ProfileError),

    #[error("Expression error: {0}")]
    Expr(#[from] ExprError),

    #[error("Classifier error: {0}")]
    Classifier(#[from] ClassifierError),

    #[error("Mailbox error: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("Audit error: {0}")]
    Audit(#[from] AuditError),

    #[error("Batch error: {0}")]
    Batch(#[from] BatchError),
}

impl Error {
    /// Recovery class driving orchestrator behavior.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Config(_) => ErrorClass::Validation,
            Self::Profile(_) => ErrorClass::Validation,
            Self::Expr(_) => ErrorClass::Validation,
            Self::Classifier(e) => e.class(),
            Self::Mailbox(e) => e.class(),
            Self::Audit(e) => e.class(),
            Self::Batch(e) => e.class(),
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Profile loading and validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("Profile {id} invalid: {reason}")]
    Invalid { id: String, reason: String },

    #[error("Failed to parse profile file {file}: {reason}")]
    Parse { file: String, reason: String },

    #[error("Profile {id} depends on unknown profile {dependency}")]
    MissingDependency { id: String, dependency: String },

    #[error("Dependency cycle among profiles: {cycle}")]
    Cycle { cycle: String },

    #[error("Profile not found: {0}")]
    NotFound(String),

    #[error("IO error reading profile directory: {0}")]
    Io(#[from] std::io::Error),
}

/// Expression parse/evaluation errors.
#[derive(Debug, thiserror::Error)]
pub enum ExprError {
    #[error("Parse error at offset {offset}: {message}")]
    Parse { offset: usize, message: String },

    #[error("Type error: {0}")]
    Type(String),
}

/// Classifier gateway errors. The closed set of failure modes for a
/// classification call — never reuse one kind for another.
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("Transport error calling inference endpoint: {0}")]
    Transport(String),

    #[error("Inference endpoint returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Classification timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Response failed schema validation: {0}")]
    Schema(String),

    #[error("Circuit breaker is open")]
    BreakerOpen,

    #[error("Inference endpoint {0} is not a loopback address")]
    NonLoopback(String),

    #[error("Classification cancelled")]
    Cancelled,
}

impl ClassifierError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Transport(_) | Self::Timeout { .. } | Self::Http { .. } => ErrorClass::Transient,
            Self::Schema(_) => ErrorClass::Schema,
            Self::BreakerOpen => ErrorClass::BreakerOpen,
            Self::NonLoopback(_) => ErrorClass::Fatal,
            Self::Cancelled => ErrorClass::Cancelled,
        }
    }

    /// Short tag identifying the failure class, used as the reason on
    /// synthesized fallback responses.
    pub fn reason_tag(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport_error",
            Self::Http { .. } => "http_error",
            Self::Timeout { .. } => "timeout",
            Self::Schema(_) => "schema_error",
            Self::BreakerOpen => "breaker_open",
            Self::NonLoopback(_) => "non_loopback",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Mailbox adapter errors, classified by the adapter.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Transient mailbox error: {0}")]
    Transient(String),

    #[error("Mailbox rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Mailbox authentication expired")]
    AuthExpired,

    #[error("Fatal mailbox error: {0}")]
    Fatal(String),
}

impl MailboxError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Transient(_) | Self::RateLimited { .. } => ErrorClass::Transient,
            Self::AuthExpired | Self::Fatal(_) => ErrorClass::Fatal,
        }
    }
}

/// Audit chain errors.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("Integrity failure at entry {index}: {reason}")]
    Integrity { index: usize, reason: String },

    #[error("Failed to serialize audit entry: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Audit write failed: {0}")]
    Io(#[from] std::io::Error),
}

impl AuditError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Integrity { .. } => ErrorClass::Integrity,
            Self::Serialize(_) | Self::Io(_) => ErrorClass::Fatal,
        }
    }
}

/// Batch orchestration errors.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("Batch cancelled")]
    Cancelled,

    #[error("Batch halted: {0}")]
    Halted(String),
}

impl BatchError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Cancelled => ErrorClass::Cancelled,
            Self::Halted(_) => ErrorClass::Fatal,
        }
    }
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
