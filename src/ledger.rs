//! Event ledger: append-only audit trail for approvals and browser jobs.
//!
//! Every terminal transition is paired with exactly one event. A failed
//! append degrades observability but never rolls back the business write,
//! so callers go through [`record`] which downgrades failures to a warning.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;

/// What an event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum EventSubject {
    Approval(Uuid),
    Job(Uuid),
}

impl std::fmt::Display for EventSubject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Approval(id) => write!(f, "approval:{id}"),
            Self::Job(id) => write!(f, "job:{id}"),
        }
    }
}

/// Event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // ── Approvals ───────────────────────────────────────────────────
    Approved,
    Rejected,
    Edited,
    /// Policy engine denied the send.
    Denied,
    Sent,
    /// Delegated to a browser job for a manual send.
    Opened,
    RetryScheduled,
    Failed,
    DeadLettered,
    SentManual,

    // ── Browser jobs ────────────────────────────────────────────────
    JobSubmitted,
    JobDispatched,
    JobRunning,
    /// One self-healing sub-step.
    RecoveryStep,
    WaitingForHuman,
    JobResumed,
    JobSucceeded,
    JobFailed,
    JobCancelled,
    /// A human handoff exceeded its TTL and the job was cancelled.
    HandoffExpired,
    /// Artifact capture failed (non-fatal).
    ArtifactWarning,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Edited => "edited",
            Self::Denied => "denied",
            Self::Sent => "sent",
            Self::Opened => "opened",
            Self::RetryScheduled => "retry_scheduled",
            Self::Failed => "failed",
            Self::DeadLettered => "dead_lettered",
            Self::SentManual => "sent_manual",
            Self::JobSubmitted => "job_submitted",
            Self::JobDispatched => "job_dispatched",
            Self::JobRunning => "job_running",
            Self::RecoveryStep => "recovery_step",
            Self::WaitingForHuman => "waiting_for_human",
            Self::JobResumed => "job_resumed",
            Self::JobSucceeded => "job_succeeded",
            Self::JobFailed => "job_failed",
            Self::JobCancelled => "job_cancelled",
            Self::HandoffExpired => "handoff_expired",
            Self::ArtifactWarning => "artifact_warning",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An immutable audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub subject: EventSubject,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    /// Ties together every event produced while handling one item.
    pub correlation_id: Uuid,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl Event {
    pub fn new(subject: EventSubject, event_type: EventType, correlation_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject,
            event_type,
            timestamp: Utc::now(),
            correlation_id,
            details: serde_json::Value::Null,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Append-only audit sink.
#[async_trait]
pub trait EventLedger: Send + Sync {
    async fn append(&self, event: &Event) -> Result<(), StoreError>;

    /// All events for a subject, in append order.
    async fn list_for(&self, subject: EventSubject) -> Result<Vec<Event>, StoreError>;
}

/// Append an event, logging instead of failing when the ledger is unavailable.
pub async fn record(ledger: &dyn EventLedger, event: Event) {
    if let Err(e) = ledger.append(&event).await {
        tracing::warn!(
            subject = %event.subject,
            event_type = %event.event_type,
            "Failed to append event: {e}"
        );
    }
}

/// In-process ledger.
#[derive(Default)]
pub struct InMemoryLedger {
    events: RwLock<Vec<Event>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every event appended so far.
    pub async fn events(&self) -> Vec<Event> {
        self.events.read().await.clone()
    }

    /// Count events of `event_type` for `subject`.
    pub async fn count(&self, subject: EventSubject, event_type: EventType) -> usize {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.subject == subject && e.event_type == event_type)
            .count()
    }
}

#[async_trait]
impl EventLedger for InMemoryLedger {
    async fn append(&self, event: &Event) -> Result<(), StoreError> {
        self.events.write().await.push(event.clone());
        Ok(())
    }

    async fn list_for(&self, subject: EventSubject) -> Result<Vec<Event>, StoreError> {
        Ok(self
            .events
            .read()
            .await
            .iter()
            .filter(|e| e.subject == subject)
            .cloned()
            .collect())
    }
}
