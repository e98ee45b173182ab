//! Dispatch router: claims approved items and drives them to delivery.

pub mod backoff;
pub mod dispatcher;
pub mod ticker;

use async_trait::async_trait;
use uuid::Uuid;

use crate::browser::JobState;
use crate::error::StoreError;

pub use backoff::Backoff;
pub use dispatcher::{BatchReport, Router, RouterDeps};
pub use ticker::{drain_once, parse_schedule, spawn_drain_ticker};

/// Read access to browser jobs backing opened approvals.
#[async_trait]
pub trait JobTracker: Send + Sync {
    async fn job_state(&self, job_id: Uuid) -> Result<Option<JobState>, StoreError>;
}
