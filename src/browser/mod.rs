//! Browser job orchestration for semi-automated channels.

pub mod artifacts;
pub mod driver;
pub mod healing;
pub mod orchestrator;
pub mod state;
pub mod store;

pub use artifacts::{Artifact, ArtifactKind, CaptureReason};
pub use driver::{BrowserContext, BrowserDriver, HttpDriver, StepLimits};
pub use healing::RecoveryStrategy;
pub use orchestrator::{Orchestrator, RecoveryReport};
pub use state::{
    BrowserJob, Checkpoint, HandoffGate, JobFailure, JobSpec, JobState, JobStatus, Locator,
    Progress, SubStep, TaskStep,
};
pub use store::{InMemoryJobStore, JobStore};
