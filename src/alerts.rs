//! Operator alerts: broadcast fan-out for conditions a human must see.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Why an operator is being alerted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// An approval exhausted its retries.
    DeadLettered,
    /// A browser job is paused waiting for a person.
    HandoffRequired,
    /// A paused browser job was cancelled because nobody resumed it in time.
    HandoffExpired,
}

/// An operator-visible alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorAlert {
    pub kind: AlertKind,
    /// Approval or job ID.
    pub subject_id: Uuid,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

impl OperatorAlert {
    pub fn new(kind: AlertKind, subject_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            kind,
            subject_id,
            message: message.into(),
            raised_at: Utc::now(),
        }
    }
}

/// Broadcast bus for operator alerts.
pub struct AlertBus {
    tx: broadcast::Sender<OperatorAlert>,
}

impl AlertBus {
    pub fn new() -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Arc::new(Self { tx })
    }

    /// Subscribe to alerts. Each operator surface calls this.
    pub fn subscribe(&self) -> broadcast::Receiver<OperatorAlert> {
        self.tx.subscribe()
    }

    /// Raise an alert. Always logged; delivered to any live subscribers.
    pub fn raise(&self, alert: OperatorAlert) {
        warn!(
            kind = ?alert.kind,
            subject_id = %alert.subject_id,
            "Operator alert: {}",
            alert.message
        );
        // Ok if nobody is listening yet
        let _ = self.tx.send(alert);
    }
}
