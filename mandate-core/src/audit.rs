//! Audit trail.
//!
//! Two kinds of entries are produced:
//!
//! - [`AuthorizationRecord`]: one per `authorize` call, naming the decision,
//!   the stage reached and the check that failed.
//! - [`AuditEvent`]: lifecycle events from the registries (key registration,
//!   rotation and revocation, delegation revocation, witness and budget
//!   changes).
//!
//! Both go to an injected [`AuditSink`].

use crate::authorizer::{AuthStage, Check};
use crate::crypto::PublicKey;
use crate::error::ReasonCode;
use crate::identity::EntityId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Mutex;
use tracing::{error, info};

/// Lifecycle event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    KeyRegistered,
    KeyRotated,
    KeyRevoked,
    DelegationRevoked,
    RevocationRejected,
    WitnessRegistered,
    WitnessTrustAdjusted,
    BudgetAccountCreated,
    BudgetAlert,
}

/// A registry lifecycle event.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    /// Unique event ID
    pub id: String,

    pub event_type: AuditEventType,

    /// When this event occurred (engine clock)
    pub timestamp: DateTime<Utc>,

    /// Who/what triggered this event
    pub actor: String,

    /// Entity or record the event is about, when different from the actor
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,

    /// Public key involved (short fingerprint)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_fingerprint: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,

    /// Related IDs (delegation ids, hashes)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub related_ids: Vec<String>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, actor: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            id: format!("evt_{}", uuid::Uuid::now_v7().simple()),
            event_type,
            timestamp: at,
            actor: actor.into(),
            subject: None,
            key_fingerprint: None,
            details: None,
            related_ids: Vec::new(),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_key(mut self, key: &PublicKey) -> Self {
        self.key_fingerprint = Some(key.fingerprint());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_related(mut self, id: impl Into<String>) -> Self {
        self.related_ids.push(id.into());
        self
    }
}

/// Outcome of one authorization request, as recorded.
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationRecord {
    /// Unique record ID
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub delegation_id: String,
    /// Hex content hash of the delegation, when it could be computed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delegation_hash: Option<String>,
    pub delegator: EntityId,
    pub delegatee: EntityId,
    pub action: String,
    pub resource: String,
    /// "allow" or "deny"
    pub decision: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<ReasonCode>,
    /// Check that denied the request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_check: Option<Check>,
    /// Last state the request reached
    pub reached: AuthStage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Budget balance after deduction (allowed requests only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_budget: Option<u64>,
    pub latency_us: u64,
}

impl AuthorizationRecord {
    pub fn is_allowed(&self) -> bool {
        self.decision == "allow"
    }
}

/// Destination for audit entries.
pub trait AuditSink: Send + Sync + std::fmt::Debug {
    fn event(&self, event: AuditEvent);

    fn authorization(&self, record: &AuthorizationRecord);
}

/// Emits entries as JSON through `tracing` under the `mandate::audit` target.
#[derive(Debug, Default)]
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn event(&self, event: AuditEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => info!(target: "mandate::audit", kind = "event", "{}", json),
            Err(e) => error!(target: "mandate::audit", error = %e, "Failed to serialize audit event"),
        }
    }

    fn authorization(&self, record: &AuthorizationRecord) {
        match serde_json::to_string(record) {
            Ok(json) => info!(target: "mandate::audit", kind = "authorization", "{}", json),
            Err(e) => {
                error!(target: "mandate::audit", error = %e, "Failed to serialize authorization record")
            }
        }
    }
}

/// Keeps entries in memory, for tests and for export.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<AuditEvent>>,
    records: Mutex<Vec<AuthorizationRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn records(&self) -> Vec<AuthorizationRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Take every event recorded so far.
    pub fn drain_events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|mut e| std::mem::take(&mut *e))
            .unwrap_or_default()
    }
}

impl AuditSink for MemorySink {
    fn event(&self, event: AuditEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }

    fn authorization(&self, record: &AuthorizationRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record.clone());
        }
    }
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NoOpSink;

impl AuditSink for NoOpSink {
    fn event(&self, _event: AuditEvent) {}

    fn authorization(&self, _record: &AuthorizationRecord) {}
}
