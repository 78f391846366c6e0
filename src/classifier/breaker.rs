//! Circuit breaker protecting the inference endpoint.
//!
//! Three states. Closed counts consecutive failures and opens at the
//! configured threshold. Open fails fast until the open interval elapses,
//! then admits up to H half-open trial calls: all succeeding closes the
//! breaker, any failing reopens it. A single owner holds the state under an
//! internal lock; callers only see the operation API.
//!
//! State transitions are queued as events for the audit chain — the breaker
//! itself never does I/O.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::info;

use crate::config::BreakerConfig;
use crate::error::ClassifierError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// A recorded state transition, drained by the caller into the audit chain.
#[derive(Debug, Clone)]
pub struct BreakerTransition {
    pub from: BreakerState,
    pub to: BreakerState,
    pub at: DateTime<Utc>,
    pub consecutive_failures: u32,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// Trial calls admitted since entering half-open.
    trials_admitted: u32,
    trials_succeeded: u32,
    transitions: Vec<BreakerTransition>,
}

/// The breaker. One instance is shared by every worker in a batch.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trials_admitted: 0,
                trials_succeeded: 0,
                transitions: Vec::new(),
            }),
        }
    }

    /// Gate a call. Fails fast with `BreakerOpen` while open; while
    /// half-open, admits at most the configured number of trials.
    pub fn acquire(&self) -> Result<(), ClassifierError> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= Duration::from_secs(self.config.open_secs) {
                    transition(&mut inner, BreakerState::HalfOpen);
                    inner.trials_admitted = 1;
                    inner.trials_succeeded = 0;
                    Ok(())
                } else {
                    Err(ClassifierError::BreakerOpen)
                }
            }
            BreakerState::HalfOpen => {
                if inner.trials_admitted < self.config.half_open_max {
                    inner.trials_admitted += 1;
                    Ok(())
                } else {
                    Err(ClassifierError::BreakerOpen)
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::Closed => inner.consecutive_failures = 0,
            BreakerState::HalfOpen => {
                inner.trials_succeeded += 1;
                if inner.trials_succeeded >= self.config.half_open_max {
                    inner.consecutive_failures = 0;
                    transition(&mut inner, BreakerState::Closed);
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Record a terminal call failure (transport, timeout, HTTP ≥ 500, or
    /// final schema error after retries).
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.opened_at = Some(Instant::now());
                    transition(&mut inner, BreakerState::Open);
                }
            }
            BreakerState::HalfOpen => {
                inner.consecutive_failures += 1;
                inner.opened_at = Some(Instant::now());
                transition(&mut inner, BreakerState::Open);
            }
            BreakerState::Open => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    /// Drain queued transitions for audit recording.
    pub fn drain_transitions(&self) -> Vec<BreakerTransition> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        std::mem::take(&mut inner.transitions)
    }
}

fn transition(inner: &mut Inner, to: BreakerState) {
    let from = inner.state;
    inner.state = to;
    info!(
        from = from.as_str(),
        to = to.as_str(),
        consecutive_failures = inner.consecutive_failures,
        "Circuit breaker state changed"
    );
    inner.transitions.push(BreakerTransition {
        from,
        to,
        at: Utc::now(),
        consecutive_failures: inner.consecutive_failures,
    });
}
