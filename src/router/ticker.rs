//! In-process drain ticker driven by a cron schedule.
//!
//! Deployments without an external scheduler can set `DISPATCH_DRAIN_CRON`;
//! each firing runs one batch, reconciles opened approvals, and archives.

use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use cron::Schedule;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::Router;
use crate::error::ConfigError;

/// Parse a cron expression (seconds field included).
pub fn parse_schedule(expr: &str) -> Result<Schedule, ConfigError> {
    Schedule::from_str(expr).map_err(|e| ConfigError::InvalidValue {
        key: "DISPATCH_DRAIN_CRON".into(),
        message: format!("invalid cron: {e}"),
    })
}

/// Run one drain cycle now.
pub async fn drain_once(router: &Router) {
    let batch = router.config().default_batch;
    match router.process_approved(batch).await {
        Ok(report) if report.processed > 0 => info!(?report, "Scheduled drain processed items"),
        Ok(_) => {}
        Err(e) => error!("Scheduled drain failed: {e}"),
    }
    if let Err(e) = router.reconcile_opened().await {
        warn!("Opened-approval reconciliation failed: {e}");
    }
    if let Err(e) = router.archive_terminal(Utc::now()).await {
        warn!("Archival failed: {e}");
    }
}

/// Spawn the ticker. Sleeps until each upcoming fire time.
pub fn spawn_drain_ticker(router: Arc<Router>, schedule: Schedule) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let Some(next) = schedule.upcoming(Utc).next() else {
                warn!("Drain schedule has no upcoming fire time; ticker stopped");
                return;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;
            drain_once(&router).await;
        }
    })
}
