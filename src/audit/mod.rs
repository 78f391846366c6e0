//! Tamper-evident audit chain.

pub mod chain;

pub use chain::{AuditChain, AuditEntry, EventRecord, EventType};
