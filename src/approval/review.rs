//! Human review: approve, reject, and edit drafted approvals.
//!
//! These are the only transitions out of `pending`. Each write is guarded by
//! the caller's expected version and paired with a ledger event.

use serde_json::json;
use tracing::info;
use uuid::Uuid;

use super::model::{Approval, ApprovalPatch, ApprovalStatus};
use super::store::ApprovalStore;
use crate::error::StoreError;
use crate::ledger::{self, Event, EventLedger, EventSubject, EventType};

/// Approve a pending approval for dispatch.
pub async fn approve(
    store: &dyn ApprovalStore,
    ledger: &dyn EventLedger,
    id: Uuid,
    expected_version: u64,
) -> Result<Approval, StoreError> {
    let approval = store
        .update(id, ApprovalPatch::status(ApprovalStatus::Approved), expected_version)
        .await?;
    info!(approval_id = %id, "Approval approved");
    ledger::record(
        ledger,
        Event::new(EventSubject::Approval(id), EventType::Approved, id),
    )
    .await;
    Ok(approval)
}

/// Reject a pending approval.
pub async fn reject(
    store: &dyn ApprovalStore,
    ledger: &dyn EventLedger,
    id: Uuid,
    expected_version: u64,
    reason: &str,
) -> Result<Approval, StoreError> {
    let approval = store
        .update(
            id,
            ApprovalPatch::status(ApprovalStatus::Rejected).with_error(reason),
            expected_version,
        )
        .await?;
    info!(approval_id = %id, "Approval rejected");
    ledger::record(
        ledger,
        Event::new(EventSubject::Approval(id), EventType::Rejected, id)
            .with_details(json!({ "reason": reason })),
    )
    .await;
    Ok(approval)
}

/// Replace the payload of a non-terminal approval.
///
/// The claim lease, if any, is kept: the router holding it notices the
/// version change before sending and re-evaluates the fresh content.
pub async fn edit_payload(
    store: &dyn ApprovalStore,
    ledger: &dyn EventLedger,
    id: Uuid,
    expected_version: u64,
    payload: serde_json::Value,
) -> Result<Approval, StoreError> {
    let patch = ApprovalPatch {
        payload: Some(payload),
        ..Default::default()
    };
    let approval = store.update(id, patch, expected_version).await?;
    info!(approval_id = %id, version = approval.version, "Approval payload edited");
    ledger::record(
        ledger,
        Event::new(EventSubject::Approval(id), EventType::Edited, id)
            .with_details(json!({ "version": approval.version })),
    )
    .await;
    Ok(approval)
}
