//! Outreach Dispatch: approval-gated dispatch router and browser job orchestrator.

pub mod alerts;
pub mod api;
pub mod approval;
pub mod browser;
pub mod channels;
pub mod config;
pub mod error;
pub mod ledger;
pub mod policy;
pub mod router;
pub mod store;
