//! Channel adapter interface.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::approval::Approval;

/// Result of a single send attempt. Every call site must handle every case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum SendOutcome {
    /// Delivered.
    Sent,
    /// Delivery continues in a browser job that a person must finish.
    NeedsManualOpen(Uuid),
    /// Transient failure; eligible for retry with backoff.
    RetryableError(String),
    /// Permanent failure; never retried.
    FatalError(String),
}

/// Proof that the policy engine allowed this approval.
///
/// Only the router can construct one, so an adapter cannot be invoked on
/// an approval that skipped the policy gate.
#[derive(Debug, Clone)]
pub struct Cleared {
    approval: Approval,
}

impl Cleared {
    pub(crate) fn new(approval: Approval) -> Self {
        Self { approval }
    }

    pub fn approval(&self) -> &Approval {
        &self.approval
    }

    /// String field from the payload, if present.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.approval.payload.get(key).and_then(|v| v.as_str())
    }
}

/// Per-channel send capability.
///
/// Adapters never inspect approval status; the router guarantees the
/// approval was claimed and allowed before calling `send`.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Channel name this adapter serves (matches `Approval::channel`).
    fn name(&self) -> &str;

    async fn send(&self, cleared: &Cleared) -> SendOutcome;
}

/// Channel name to adapter lookup.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ChannelAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own name, replacing any previous one.
    pub fn register(&mut self, adapter: Arc<dyn ChannelAdapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn ChannelAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, channel: &str) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters.get(channel).cloned()
    }

    pub fn channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl ChannelAdapter for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        async fn send(&self, cleared: &Cleared) -> SendOutcome {
            match cleared.payload_str("body") {
                Some(_) => SendOutcome::Sent,
                None => SendOutcome::FatalError("missing body".into()),
            }
        }
    }

    #[tokio::test]
    async fn registry_dispatches_by_name() {
        let registry = AdapterRegistry::new().with(Arc::new(Echo));
        assert_eq!(registry.channels(), vec!["echo".to_string()]);
        let adapter = registry.get("echo").unwrap();

        let ok = Cleared::new(Approval::new("echo", "x", serde_json::json!({"body": "hi"})));
        assert_eq!(adapter.send(&ok).await, SendOutcome::Sent);

        let bad = Cleared::new(Approval::new("echo", "x", serde_json::json!({})));
        assert!(matches!(adapter.send(&bad).await, SendOutcome::FatalError(_)));
        assert!(registry.get("fax").is_none());
    }

    #[test]
    fn outcome_serializes_tagged() {
        let json = serde_json::to_value(SendOutcome::RetryableError("busy".into())).unwrap();
        assert_eq!(json["outcome"], "retryable_error");
        assert_eq!(json["detail"], "busy");
    }
}
