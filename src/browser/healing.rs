//! Self-healing: bounded recovery attempted before a step failure surfaces.
//!
//! Each round tries, in order: dismissing known interstitials, alternate
//! locators, and a reload from the last checkpoint. Every attempt is recorded
//! as its own sub-step. A detected challenge gate ends recovery immediately so
//! the job can be handed to a person.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use super::driver::{self, BrowserContext, StepLimits};
use super::state::{SubStep, TaskStep};
use crate::error::DriverError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    DismissInterstitials,
    AlternateLocator,
    ReloadFromCheckpoint,
}

impl RecoveryStrategy {
    pub const ORDER: [RecoveryStrategy; 3] = [
        Self::DismissInterstitials,
        Self::AlternateLocator,
        Self::ReloadFromCheckpoint,
    ];
}

impl std::fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::DismissInterstitials => "dismiss_interstitials",
            Self::AlternateLocator => "alternate_locator",
            Self::ReloadFromCheckpoint => "reload_from_checkpoint",
        };
        write!(f, "{s}")
    }
}

/// How recovery ended.
#[derive(Debug)]
pub enum HealOutcome {
    /// The step now succeeds; carries its extracted value, if any.
    Recovered(Option<String>),
    /// A gate requiring a person was detected.
    Challenge(String),
    Cancelled,
    /// Every round failed; carries the last error seen.
    Exhausted(DriverError),
}

/// Inputs for one recovery episode.
pub struct HealRequest<'a> {
    pub job_id: Uuid,
    pub step: &'a TaskStep,
    pub step_index: usize,
    /// Where to reload from.
    pub checkpoint_url: Option<&'a str>,
    pub rounds: u32,
    pub limits: StepLimits,
    pub cancel: &'a CancellationToken,
}

/// Run the recovery rounds for a failed step.
pub async fn heal(
    ctx: &mut dyn BrowserContext,
    req: HealRequest<'_>,
    initial: DriverError,
    substeps: &mut Vec<SubStep>,
) -> HealOutcome {
    let mut last_error = initial;

    for round in 1..=req.rounds {
        for strategy in RecoveryStrategy::ORDER {
            if req.cancel.is_cancelled() {
                return HealOutcome::Cancelled;
            }

            let attempt = match strategy {
                RecoveryStrategy::DismissInterstitials => dismiss_and_retry(ctx, &req).await,
                RecoveryStrategy::AlternateLocator => try_alternates(ctx, &req).await,
                RecoveryStrategy::ReloadFromCheckpoint => reload_and_retry(ctx, &req).await,
            };

            let (outcome, detail) = match attempt {
                Attempt::Succeeded(value, detail) => (Some(HealOutcome::Recovered(value)), detail),
                Attempt::Skipped(detail) => (None, detail),
                Attempt::Gate(name) => (
                    Some(HealOutcome::Challenge(name.clone())),
                    format!("gate detected: {name}"),
                ),
                Attempt::Failed(DriverError::Cancelled) => {
                    (Some(HealOutcome::Cancelled), "cancelled".to_string())
                }
                Attempt::Failed(DriverError::Challenge(name)) => (
                    Some(HealOutcome::Challenge(name.clone())),
                    format!("challenge: {name}"),
                ),
                Attempt::Failed(e) => {
                    let detail = e.to_string();
                    last_error = e;
                    (None, detail)
                }
            };

            let succeeded = matches!(outcome, Some(HealOutcome::Recovered(_)));
            info!(
                job_id = %req.job_id,
                round,
                strategy = %strategy,
                step = req.step_index,
                succeeded,
                "Recovery sub-step: {detail}"
            );
            substeps.push(SubStep {
                round,
                strategy,
                step_index: req.step_index,
                detail,
                succeeded,
                at: Utc::now(),
            });

            if let Some(outcome) = outcome {
                return outcome;
            }
        }
    }

    HealOutcome::Exhausted(last_error)
}

enum Attempt {
    Succeeded(Option<String>, String),
    /// Strategy had nothing to try.
    Skipped(String),
    Gate(String),
    Failed(DriverError),
}

async fn retry_primary(ctx: &mut dyn BrowserContext, req: &HealRequest<'_>) -> Result<Option<String>, DriverError> {
    driver::execute_step(ctx, req.step, None, req.limits, req.cancel).await
}

async fn dismiss_and_retry(ctx: &mut dyn BrowserContext, req: &HealRequest<'_>) -> Attempt {
    let dismissed = match driver::guarded(
        req.cancel,
        req.limits.step,
        "dismiss_interstitials",
        ctx.dismiss_interstitials(),
    )
    .await
    {
        Ok(d) => d,
        Err(e) => return Attempt::Failed(e),
    };
    if dismissed.is_empty() {
        return Attempt::Skipped("no interstitials found".into());
    }
    let detail = format!("dismissed {}", dismissed.join(", "));
    match retry_primary(ctx, req).await {
        Ok(value) => Attempt::Succeeded(value, detail),
        Err(e) => Attempt::Failed(e),
    }
}

async fn try_alternates(ctx: &mut dyn BrowserContext, req: &HealRequest<'_>) -> Attempt {
    let alternates = req
        .step
        .locator()
        .map(|l| l.alternates.as_slice())
        .unwrap_or_default();
    if alternates.is_empty() {
        return Attempt::Skipped("no alternate locators".into());
    }

    let mut last = None;
    for alternate in alternates {
        match driver::execute_step(ctx, req.step, Some(alternate.as_str()), req.limits, req.cancel).await {
            Ok(value) => return Attempt::Succeeded(value, format!("resolved via {alternate:?}")),
            Err(e @ (DriverError::Cancelled | DriverError::Challenge(_))) => return Attempt::Failed(e),
            Err(e) => last = Some(e),
        }
    }
    match last {
        Some(e) => Attempt::Failed(e),
        None => Attempt::Skipped("no alternate locators".into()),
    }
}

async fn reload_and_retry(ctx: &mut dyn BrowserContext, req: &HealRequest<'_>) -> Attempt {
    let reloaded = match req.checkpoint_url {
        Some(url) => driver::guarded(req.cancel, req.limits.navigation, "reload", ctx.navigate(url)).await,
        None => driver::guarded(req.cancel, req.limits.navigation, "reload", ctx.reload()).await,
    };
    if let Err(e) = reloaded {
        return Attempt::Failed(e);
    }

    match driver::guarded(req.cancel, req.limits.step, "detect_gate", ctx.detect_gate()).await {
        Ok(Some(gate)) => return Attempt::Gate(gate),
        Ok(None) => {}
        Err(e) => return Attempt::Failed(e),
    }

    match retry_primary(ctx, req).await {
        Ok(value) => Attempt::Succeeded(value, "reloaded and retried".into()),
        Err(e) => Attempt::Failed(e),
    }
}
