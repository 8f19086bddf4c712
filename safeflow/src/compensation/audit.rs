//! Append-only audit trail of a compensating transaction.

use super::handler::{HandlerId, ResourceType};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    /// A rollback handler was registered.
    Registered,
    /// A registration arrived after commit and was dropped.
    RegistrationDropped,
    /// The transaction committed; pending handlers were discarded.
    Committed,
    /// Unwind started.
    UnwindStarted,
    /// One compensation action ran.
    Compensated,
    /// Unwind finished.
    UnwindCompleted,
    /// Unwind was requested on a committed transaction and ignored.
    UnwindSkipped,
}

/// Result of the audited step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuditOutcome {
    /// The step succeeded.
    Ok,
    /// The step failed.
    Failed {
        /// Failure reason.
        reason: String,
    },
}

impl AuditOutcome {
    /// Returns true for [`AuditOutcome::Ok`].
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// One row of the audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Position in the log, starting at 0.
    pub seq: u64,
    /// When the entry was written.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub event: AuditEvent,
    /// Handler involved, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler_id: Option<HandlerId>,
    /// Resource kind involved, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<ResourceType>,
    /// Resource identifier involved, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    /// Whether the handler was critical.
    #[serde(default)]
    pub critical: bool,
    /// Outcome of the step.
    pub outcome: AuditOutcome,
}

impl AuditEntry {
    /// Converts to the structured event payload handed to event sinks.
    #[must_use]
    pub fn to_event(&self, transaction: &str) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({}));
        if let Some(map) = value.as_object_mut() {
            map.insert("transaction".to_string(), serde_json::json!(transaction));
        }
        value
    }
}

/// Builder-ish draft used by the transaction before an entry gets its sequence number.
#[derive(Debug, Clone)]
pub(crate) struct AuditDraft {
    pub event: AuditEvent,
    pub handler_id: Option<HandlerId>,
    pub resource_type: Option<ResourceType>,
    pub resource_id: Option<String>,
    pub critical: bool,
    pub outcome: AuditOutcome,
}

impl AuditDraft {
    pub const fn new(event: AuditEvent) -> Self {
        Self {
            event,
            handler_id: None,
            resource_type: None,
            resource_id: None,
            critical: false,
            outcome: AuditOutcome::Ok,
        }
    }

    pub fn resource(
        mut self,
        handler_id: HandlerId,
        resource_type: ResourceType,
        resource_id: &str,
        critical: bool,
    ) -> Self {
        self.handler_id = Some(handler_id);
        self.resource_type = Some(resource_type);
        self.resource_id = Some(resource_id.to_string());
        self.critical = critical;
        self
    }

    pub fn failed(mut self, reason: impl Into<String>) -> Self {
        self.outcome = AuditOutcome::Failed {
            reason: reason.into(),
        };
        self
    }
}

/// Thread-safe append-only audit log.
#[derive(Debug, Default)]
pub struct AuditLog {
    entries: RwLock<Vec<AuditEntry>>,
}

impl AuditLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn append(&self, draft: AuditDraft) -> AuditEntry {
        let mut entries = self.entries.write();
        let entry = AuditEntry {
            seq: u64::try_from(entries.len()).unwrap_or(u64::MAX),
            timestamp: Utc::now(),
            event: draft.event,
            handler_id: draft.handler_id,
            resource_type: draft.resource_type,
            resource_id: draft.resource_id,
            critical: draft.critical,
            outcome: draft.outcome,
        };
        entries.push(entry.clone());
        entry
    }

    /// Returns a copy of all entries.
    #[must_use]
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.read().clone()
    }

    /// Returns entries of one event kind.
    #[must_use]
    pub fn entries_of(&self, event: AuditEvent) -> Vec<AuditEntry> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.event == event)
            .cloned()
            .collect()
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
