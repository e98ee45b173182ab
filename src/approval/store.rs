//! Approval store interface and an in-process implementation.
//!
//! The store is the serialization point for claims: `claim` and `update`
//! succeed only when the caller's expected version matches the stored one,
//! so two overlapping router invocations can never both move a record out
//! of `approved`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::model::{Approval, ApprovalPatch, ApprovalStatus, ClaimLease};
use crate::error::StoreError;

/// Persistence boundary for approvals.
#[async_trait]
pub trait ApprovalStore: Send + Sync {
    /// Insert a freshly drafted approval.
    async fn insert(&self, approval: &Approval) -> Result<(), StoreError>;

    /// Get an approval by ID.
    async fn get(&self, id: Uuid) -> Result<Option<Approval>, StoreError>;

    /// List non-archived approvals with `status`, oldest first, up to `limit`.
    async fn list_by_status(
        &self,
        status: ApprovalStatus,
        limit: usize,
    ) -> Result<Vec<Approval>, StoreError>;

    /// List `approved` records claimable at `now`, oldest first, up to `limit`.
    ///
    /// Not-yet-due retries and records under an unexpired lease are filtered
    /// before the limit applies, so a backlog of waiting retries never hides
    /// due work.
    async fn list_claimable(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Approval>, StoreError>;

    /// Atomically acquire an `approved` record at `expected_version`.
    ///
    /// Fails with `Conflict` when the version moved, the status is no longer
    /// `approved`, or another claimant holds an unexpired lease. On success the
    /// version is bumped and the returned record carries the lease.
    async fn claim(
        &self,
        id: Uuid,
        expected_version: u64,
        lease: ClaimLease,
        now: DateTime<Utc>,
    ) -> Result<Approval, StoreError>;

    /// Apply `patch` if the stored version equals `expected_version`.
    ///
    /// Rejects writes to terminal records and status changes that are not
    /// edges of the approval state machine.
    async fn update(
        &self,
        id: Uuid,
        patch: ApprovalPatch,
        expected_version: u64,
    ) -> Result<Approval, StoreError>;

    /// Flag terminal approvals last updated before `cutoff` as archived.
    /// Returns the number archived.
    async fn archive_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// Validate a patch against the current record. Shared by every backend.
pub fn check_patch(current: &Approval, patch: &ApprovalPatch) -> Result<(), StoreError> {
    if current.status.is_terminal() {
        return Err(StoreError::InvalidTransition {
            id: current.id,
            from: current.status.to_string(),
            to: patch
                .status
                .map(|s| s.to_string())
                .unwrap_or_else(|| current.status.to_string()),
        });
    }
    if let Some(target) = patch.status
        && target != current.status
        && !current.status.can_transition_to(target)
    {
        return Err(StoreError::InvalidTransition {
            id: current.id,
            from: current.status.to_string(),
            to: target.to_string(),
        });
    }
    Ok(())
}

/// Validate a claim against the current record. Shared by every backend.
pub fn check_claim(
    current: &Approval,
    expected_version: u64,
    claimant: &str,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    if current.version != expected_version {
        return Err(StoreError::conflict(
            "approval",
            current.id,
            format!(
                "expected version {expected_version}, found {}",
                current.version
            ),
        ));
    }
    if !current.is_claimable_by(claimant, now) {
        return Err(StoreError::conflict(
            "approval",
            current.id,
            format!("not claimable (status {}, leased {})", current.status, current.lease.is_some()),
        ));
    }
    Ok(())
}

/// In-process approval store guarded by a single lock.
pub struct InMemoryApprovalStore {
    approvals: RwLock<HashMap<Uuid, Approval>>,
}

impl InMemoryApprovalStore {
    pub fn new() -> Self {
        Self {
            approvals: RwLock::new(HashMap::new()),
        }
    }

    /// Number of stored approvals (archived included).
    pub async fn len(&self) -> usize {
        self.approvals.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.approvals.read().await.is_empty()
    }
}

impl Default for InMemoryApprovalStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ApprovalStore for InMemoryApprovalStore {
    async fn insert(&self, approval: &Approval) -> Result<(), StoreError> {
        let mut approvals = self.approvals.write().await;
        if approvals.contains_key(&approval.id) {
            return Err(StoreError::conflict("approval", approval.id, "already exists"));
        }
        approvals.insert(approval.id, approval.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Approval>, StoreError> {
        Ok(self.approvals.read().await.get(&id).cloned())
    }

    async fn list_by_status(
        &self,
        status: ApprovalStatus,
        limit: usize,
    ) -> Result<Vec<Approval>, StoreError> {
        let approvals = self.approvals.read().await;
        let mut matching: Vec<Approval> = approvals
            .values()
            .filter(|a| a.status == status && !a.archived)
            .cloned()
            .collect();
        matching.sort_by_key(|a| a.created_at);
        matching.truncate(limit);
        Ok(matching)
    }

    async fn list_claimable(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Approval>, StoreError> {
        let approvals = self.approvals.read().await;
        let mut claimable: Vec<Approval> = approvals
            .values()
            .filter(|a| {
                a.status == ApprovalStatus::Approved && !a.archived && a.is_due(now) && a.is_unleased(now)
            })
            .cloned()
            .collect();
        claimable.sort_by_key(|a| a.created_at);
        claimable.truncate(limit);
        Ok(claimable)
    }

    async fn claim(
        &self,
        id: Uuid,
        expected_version: u64,
        lease: ClaimLease,
        now: DateTime<Utc>,
    ) -> Result<Approval, StoreError> {
        let mut approvals = self.approvals.write().await;
        let current = approvals
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("approval", id))?;

        check_claim(current, expected_version, &lease.claimant, now)?;

        current.lease = Some(lease);
        current.version += 1;
        current.updated_at = now;
        debug!(approval_id = %id, version = current.version, "Approval claimed");
        Ok(current.clone())
    }

    async fn update(
        &self,
        id: Uuid,
        patch: ApprovalPatch,
        expected_version: u64,
    ) -> Result<Approval, StoreError> {
        let mut approvals = self.approvals.write().await;
        let current = approvals
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("approval", id))?;

        if current.version != expected_version {
            return Err(StoreError::conflict(
                "approval",
                id,
                format!(
                    "expected version {expected_version}, found {}",
                    current.version
                ),
            ));
        }
        check_patch(current, &patch)?;

        current.apply(&patch, Utc::now());
        Ok(current.clone())
    }

    async fn archive_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut approvals = self.approvals.write().await;
        let mut count = 0;
        for approval in approvals.values_mut() {
            if approval.status.is_terminal() && !approval.archived && approval.updated_at < cutoff {
                approval.archived = true;
                count += 1;
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approved() -> Approval {
        Approval::new("email", "alice@example.com", serde_json::json!({"body": "hi"}))
            .with_status(ApprovalStatus::Approved)
    }

    fn lease(claimant: &str, now: DateTime<Utc>) -> ClaimLease {
        ClaimLease {
            claimant: claimant.into(),
            until: now + chrono::Duration::seconds(60),
        }
    }

    #[tokio::test]
    async fn claim_bumps_version_and_sets_lease() {
        let store = InMemoryApprovalStore::new();
        let approval = approved();
        store.insert(&approval).await.unwrap();

        let now = Utc::now();
        let claimed = store
            .claim(approval.id, 1, lease("r1", now), now)
            .await
            .unwrap();
        assert_eq!(claimed.version, 2);
        assert_eq!(claimed.lease.unwrap().claimant, "r1");
    }

    #[tokio::test]
    async fn stale_version_claim_conflicts() {
        let store = InMemoryApprovalStore::new();
        let approval = approved();
        store.insert(&approval).await.unwrap();
        let now = Utc::now();

        store.claim(approval.id, 1, lease("r1", now), now).await.unwrap();
        let err = store
            .claim(approval.id, 1, lease("r2", now), now)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn leased_record_cannot_be_claimed_by_another_even_at_current_version() {
        let store = InMemoryApprovalStore::new();
        let approval = approved();
        store.insert(&approval).await.unwrap();
        let now = Utc::now();

        let claimed = store.claim(approval.id, 1, lease("r1", now), now).await.unwrap();
        let err = store
            .claim(approval.id, claimed.version, lease("r2", now), now)
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        // After the lease expires another claimant may take over.
        let later = now + chrono::Duration::seconds(120);
        assert!(store
            .claim(approval.id, claimed.version, lease("r2", later), later)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn pending_records_are_not_claimable() {
        let store = InMemoryApprovalStore::new();
        let approval = Approval::new("email", "a", serde_json::json!({}));
        store.insert(&approval).await.unwrap();
        let now = Utc::now();
        assert!(store.claim(approval.id, 1, lease("r1", now), now).await.is_err());
    }

    #[tokio::test]
    async fn update_enforces_version_and_edges() {
        let store = InMemoryApprovalStore::new();
        let approval = approved();
        store.insert(&approval).await.unwrap();

        let err = store
            .update(approval.id, ApprovalPatch::status(ApprovalStatus::Sent), 7)
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let err = store
            .update(approval.id, ApprovalPatch::status(ApprovalStatus::SentManual), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        let sent = store
            .update(approval.id, ApprovalPatch::status(ApprovalStatus::Sent), 1)
            .await
            .unwrap();
        assert_eq!(sent.status, ApprovalStatus::Sent);

        // Terminal records are immutable.
        let err = store
            .update(approval.id, ApprovalPatch::default().with_attempts(3), sent.version)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn list_by_status_filters_and_limits() {
        let store = InMemoryApprovalStore::new();
        for _ in 0..3 {
            store.insert(&approved()).await.unwrap();
        }
        store
            .insert(&Approval::new("email", "p", serde_json::json!({})))
            .await
            .unwrap();

        assert_eq!(store.list_by_status(ApprovalStatus::Approved, 10).await.unwrap().len(), 3);
        assert_eq!(store.list_by_status(ApprovalStatus::Approved, 2).await.unwrap().len(), 2);
        assert_eq!(store.list_by_status(ApprovalStatus::Pending, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn claimable_listing_skips_waiting_retries_before_limiting() {
        let store = InMemoryApprovalStore::new();
        let now = Utc::now();
        for _ in 0..5 {
            let mut waiting = approved();
            waiting.created_at = now - chrono::Duration::hours(1);
            waiting.next_attempt_at = Some(now + chrono::Duration::minutes(30));
            store.insert(&waiting).await.unwrap();
        }
        let leased = approved();
        store.insert(&leased).await.unwrap();
        store.claim(leased.id, 1, lease("r1", now), now).await.unwrap();
        let fresh = approved();
        store.insert(&fresh).await.unwrap();

        let listed = store.list_claimable(now, 2).await.unwrap();
        assert_eq!(listed.iter().map(|a| a.id).collect::<Vec<_>>(), vec![fresh.id]);

        // Expired leases and due retries come back.
        let later = now + chrono::Duration::hours(1);
        assert_eq!(store.list_claimable(later, 10).await.unwrap().len(), 7);
    }

    #[tokio::test]
    async fn archive_only_touches_old_terminal_records() {
        let store = InMemoryApprovalStore::new();
        let a = approved();
        store.insert(&a).await.unwrap();
        store
            .update(a.id, ApprovalPatch::status(ApprovalStatus::Sent), 1)
            .await
            .unwrap();
        store.insert(&approved()).await.unwrap();

        let archived = store
            .archive_terminal_before(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(archived, 1);
        assert!(store.get(a.id).await.unwrap().unwrap().archived);
        assert!(store.list_by_status(ApprovalStatus::Sent, 10).await.unwrap().is_empty());
    }
}
