//! Persistence layer: libSQL-backed storage for approvals, events, policy state, and jobs.

pub mod libsql_backend;
pub mod migrations;

pub use libsql_backend::LibSqlStore;
