//! Job persistence: the checkpoint store that makes human handoff crash-safe.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::state::BrowserJob;
use crate::error::StoreError;

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert or replace the full job record.
    async fn save(&self, job: &BrowserJob) -> Result<(), StoreError>;

    async fn load(&self, id: Uuid) -> Result<Option<BrowserJob>, StoreError>;

    /// Jobs not yet in a terminal state.
    async fn list_active(&self) -> Result<Vec<BrowserJob>, StoreError>;
}

/// In-process job store.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<Uuid, BrowserJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn save(&self, job: &BrowserJob) -> Result<(), StoreError> {
        self.jobs.write().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<Option<BrowserJob>, StoreError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn list_active(&self) -> Result<Vec<BrowserJob>, StoreError> {
        let mut jobs: Vec<BrowserJob> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| !j.state.is_terminal())
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }
}
