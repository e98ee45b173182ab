//! Error types for the dispatch router and browser orchestrator.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),
}

impl Error {
    /// Whether the underlying condition is the storage backend being unreachable.
    pub fn is_storage_unavailable(&self) -> bool {
        matches!(self, Self::Store(StoreError::Unavailable(_)))
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage-boundary errors shared by every persistence collaborator.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Optimistic version check failed, or the record is leased by another claimant.
    #[error("Conflict on {entity} {id}: {reason}")]
    Conflict {
        entity: String,
        id: String,
        reason: String,
    },

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Illegal status transition for {id}: {from} -> {to}")]
    InvalidTransition { id: Uuid, from: String, to: String },

    /// Backend unreachable. The current batch must abort without partial writes.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn conflict(entity: &str, id: impl ToString, reason: impl Into<String>) -> Self {
        Self::Conflict {
            entity: entity.to_string(),
            id: id.to_string(),
            reason: reason.into(),
        }
    }

    pub fn not_found(entity: &str, id: impl ToString) -> Self {
        Self::NotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Errors raised while constructing or configuring channel adapters.
///
/// Send-time failures are not errors: they are reported through
/// [`crate::channels::SendOutcome`].
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("No adapter registered for channel {0}")]
    UnknownChannel(String),

    #[error("Invalid payload for channel {name}: {reason}")]
    InvalidPayload { name: String, reason: String },
}

/// Browser job control errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Job {id} already in state {state}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        state: String,
        target: String,
    },

    #[error("Invalid job spec: {reason}")]
    InvalidSpec { reason: String },

    #[error("Orchestrator is shutting down")]
    ShuttingDown,

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),
}

/// Failure classification for browser-mediated work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Locator did not resolve to an element.
    Selector,
    /// Page load or redirect failed.
    Navigation,
    /// A challenge screen requires a human.
    Challenge,
    /// An operation exceeded its deadline.
    Timeout,
    Unknown,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Selector => "selector",
            Self::Navigation => "navigation",
            Self::Challenge => "challenge",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Errors reported by a browser driver or context.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DriverError {
    #[error("Locator {locator} did not resolve: {reason}")]
    Selector { locator: String, reason: String },

    #[error("Navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    #[error("Challenge detected: {0}")]
    Challenge(String),

    #[error("Operation {operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    #[error("Capability not supported by driver: {0}")]
    Unsupported(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Driver failure: {0}")]
    Other(String),
}

impl DriverError {
    /// Classify into the job-level failure kind.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Selector { .. } => FailureKind::Selector,
            Self::Navigation { .. } => FailureKind::Navigation,
            Self::Challenge(_) => FailureKind::Challenge,
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::Unsupported(_) | Self::Cancelled | Self::Other(_) => FailureKind::Unknown,
        }
    }
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_errors_classify() {
        let sel = DriverError::Selector {
            locator: "#send".into(),
            reason: "no match".into(),
        };
        assert_eq!(sel.kind(), FailureKind::Selector);
        assert_eq!(
            DriverError::Challenge("captcha".into()).kind(),
            FailureKind::Challenge
        );
        assert_eq!(
            DriverError::Timeout {
                operation: "navigate".into(),
                timeout: Duration::from_secs(1)
            }
            .kind(),
            FailureKind::Timeout
        );
        assert_eq!(DriverError::Other("boom".into()).kind(), FailureKind::Unknown);
    }

    #[test]
    fn unavailable_is_detected_through_top_level() {
        let err: Error = StoreError::Unavailable("db down".into()).into();
        assert!(err.is_storage_unavailable());
        let err: Error = StoreError::conflict("approval", "a1", "version").into();
        assert!(!err.is_storage_unavailable());
    }

    #[test]
    fn failure_kind_display() {
        assert_eq!(FailureKind::Navigation.to_string(), "navigation");
        assert_eq!(FailureKind::Unknown.to_string(), "unknown");
    }
}
