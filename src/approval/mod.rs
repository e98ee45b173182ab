//! Approvals: model, storage boundary, and human review.

pub mod model;
pub mod review;
pub mod store;

pub use model::{Approval, ApprovalPatch, ApprovalStatus, ClaimLease};
pub use store::{ApprovalStore, InMemoryApprovalStore};
