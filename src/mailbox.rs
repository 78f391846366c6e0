//! Mailbox adapter seam — pure I/O, no triage logic.
//!
//! Provider connectors implement `MailboxAdapter`; the core consumes typed
//! Messages and applies idempotent label operations through it. Errors are
//! classified by the adapter so the orchestrator can pick a recovery policy
//! without inspecting provider details.
//!
//! `InMemoryMailbox` is the reference implementation used by tests and by
//! `profiles test` fixtures.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::MailboxError;
use crate::message::Message;

/// One page of hydrated messages plus the opaque resume cursor.
#[derive(Debug, Clone)]
pub struct MailboxPage {
    pub messages: Vec<Message>,
    pub next_cursor: Option<String>,
}

/// Operations the core requires of a mailbox provider.
#[async_trait]
pub trait MailboxAdapter: Send + Sync {
    /// Adapter name for logs and audit metadata.
    fn name(&self) -> &str;

    /// Fetch a page of messages matching `query`, starting at `cursor`.
    /// The default query excludes provider spam/trash.
    async fn list_page(
        &self,
        cursor: Option<&str>,
        query: &str,
        max_results: u32,
    ) -> Result<MailboxPage, MailboxError>;

    /// Idempotent label modification.
    async fn modify_labels(
        &self,
        message_id: &str,
        add: &[String],
        remove: &[String],
    ) -> Result<(), MailboxError>;

    /// Idempotent label creation; returns the provider's label id.
    async fn ensure_label(&self, name: &str) -> Result<String, MailboxError>;

    async fn health_check(&self) -> Result<(), MailboxError>;
}

/// In-memory mailbox backed by a message map. Label state is live, so
/// planner idempotence is observable across repeated runs.
#[derive(Default)]
pub struct InMemoryMailbox {
    inner: Mutex<InMemoryState>,
}

#[derive(Default)]
struct InMemoryState {
    order: Vec<String>,
    messages: BTreeMap<String, Message>,
    labels: Vec<String>,
    modify_calls: u32,
}

impl InMemoryMailbox {
    pub fn new(messages: Vec<Message>) -> Self {
        let mut state = InMemoryState::default();
        for message in messages {
            state.order.push(message.id.clone());
            state.messages.insert(message.id.clone(), message);
        }
        Self {
            inner: Mutex::new(state),
        }
    }

    /// Current labels of a message, for assertions and re-planning.
    pub fn labels_of(&self, message_id: &str) -> Option<Vec<String>> {
        let state = self.inner.lock().expect("mailbox lock poisoned");
        state.messages.get(message_id).map(|m| m.labels.clone())
    }

    /// Number of `modify_labels` calls that reached the adapter.
    pub fn modify_call_count(&self) -> u32 {
        self.inner.lock().expect("mailbox lock poisoned").modify_calls
    }

    /// Labels created through `ensure_label`.
    pub fn created_labels(&self) -> Vec<String> {
        self.inner.lock().expect("mailbox lock poisoned").labels.clone()
    }
}

#[async_trait]
impl MailboxAdapter for InMemoryMailbox {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn list_page(
        &self,
        cursor: Option<&str>,
        _query: &str,
        max_results: u32,
    ) -> Result<MailboxPage, MailboxError> {
        let state = self.inner.lock().expect("mailbox lock poisoned");
        let start: usize = cursor
            .map(|c| c.parse().map_err(|_| MailboxError::Fatal(format!("bad cursor {c}"))))
            .transpose()?
            .unwrap_or(0);
        let start = start.min(state.order.len());
        let end = (start + max_results as usize).min(state.order.len());
        let messages = state.order[start..end]
            .iter()
            .map(|id| state.messages[id].clone())
            .collect();
        let next_cursor = (end < state.order.len()).then(|| end.to_string());
        Ok(MailboxPage {
            messages,
            next_cursor,
        })
    }

    async fn modify_labels(
        &self,
        message_id: &str,
        add: &[String],
        remove: &[String],
    ) -> Result<(), MailboxError> {
        let mut state = self.inner.lock().expect("mailbox lock poisoned");
        state.modify_calls += 1;
        let message = state
            .messages
            .get_mut(message_id)
            .ok_or_else(|| MailboxError::Fatal(format!("unknown message {message_id}")))?;
        for label in add {
            if !message.labels.contains(label) {
                message.labels.push(label.clone());
            }
        }
        message.labels.retain(|l| !remove.contains(l));
        Ok(())
    }

    async fn ensure_label(&self, name: &str) -> Result<String, MailboxError> {
        let mut state = self.inner.lock().expect("mailbox lock poisoned");
        if !state.labels.iter().any(|l| l == name) {
            state.labels.push(name.to_string());
        }
        Ok(format!("label_{name}"))
    }

    async fn health_check(&self) -> Result<(), MailboxError> {
        Ok(())
    }
}
