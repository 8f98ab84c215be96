//! Audit events: safety-relevant operations emit a structured event.
//!
//! Sinks carry the event out-of-band (tracing, test capture); the brake
//! additionally persists its transitions as `safety.audit` records through
//! the store. Events never contain plaintext, key material, or AAD.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use crate::types::RecordId;

/// What happened.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum AuditAction {
    BrakeEngaged { scopes: Vec<String> },
    BrakeDisengaged,
    /// The consent gate was bypassed on an administrative path.
    GateBypassed,
    /// A stored envelope failed authentication during retrieval; the record
    /// was elided from the result set.
    DecryptFailed { id: RecordId },
    /// A retrieval channel degraded (backend unavailable).
    ChannelDegraded { channel: String },
    EmbeddingsRebuilt { count: usize },
}

/// A structured audit event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    pub actor: String,
    pub success: bool,
    pub detail: Option<String>,
}

impl AuditEvent {
    pub fn new(timestamp: DateTime<Utc>, action: AuditAction) -> Self {
        Self { timestamp, action, actor: "system".into(), success: true, detail: None }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_failure(mut self) -> Self {
        self.success = false;
        self
    }
}

/// Where audit events go. Synchronous so sinks stay free of runtime
/// dependencies; async sinks can bridge with a channel.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Logs events via `tracing`.
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        tracing::info!(
            timestamp = %event.timestamp,
            action = ?event.action,
            actor = %event.actor,
            success = event.success,
            detail = ?event.detail,
            "audit"
        );
    }
}

/// Collects events in memory (tests).
#[derive(Default)]
pub struct InMemoryAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().expect("audit sink lock").clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().expect("audit sink lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        self.events.lock().expect("audit sink lock").push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_sink_captures_events() {
        let sink = InMemoryAuditSink::new();
        sink.record(AuditEvent::new(Utc::now(), AuditAction::GateBypassed));
        sink.record(
            AuditEvent::new(Utc::now(), AuditAction::DecryptFailed { id: 7 }).with_failure(),
        );
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert!(events[0].success);
        assert!(!events[1].success);
    }

    #[test]
    fn events_serialize_for_persistence() {
        let event = AuditEvent::new(
            Utc::now(),
            AuditAction::BrakeEngaged { scopes: vec!["writes".into()] },
        )
        .with_detail("operator request");
        let json = serde_json::to_string(&event).unwrap();
        let back: AuditEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(back.action, AuditAction::BrakeEngaged { .. }));
    }
}
