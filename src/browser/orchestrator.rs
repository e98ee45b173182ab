//! Browser job orchestrator: worker pool, profile slots, handoff, and TTL.
//!
//! Every job mutation goes through [`Inner::mutate`], which validates the
//! change on a copy, persists it, and only then publishes it to the live
//! table. A crash therefore never leaves the live table ahead of the store,
//! and a job waiting for a person is always resumable from its checkpoint.
//!
//! The table lock is held only to look entries up. Each job has its own
//! mutex, so a slow store write for one job never stalls another.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::artifacts::{self, CaptureReason, Captured};
use super::driver::{self, BrowserContext, BrowserDriver, StepLimits};
use super::healing::{self, HealOutcome, HealRequest};
use super::state::{
    BrowserJob, Checkpoint, HandoffGate, JobFailure, JobSpec, JobState, JobStatus, Progress,
    SubStep, TaskStep,
};
use super::store::JobStore;
use crate::alerts::{AlertBus, AlertKind, OperatorAlert};
use crate::config::OrchestratorConfig;
use crate::error::{DriverError, JobError, StoreError};
use crate::ledger::{self, Event, EventLedger, EventSubject, EventType};
use crate::router::JobTracker;

/// A job in the live table plus its cancel flag.
struct LiveJob {
    job: Mutex<BrowserJob>,
    cancel: CancellationToken,
}

impl LiveJob {
    fn new(job: BrowserJob, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            job: Mutex::new(job),
            cancel,
        })
    }
}

struct Inner {
    config: OrchestratorConfig,
    driver: Arc<dyn BrowserDriver>,
    store: Arc<dyn JobStore>,
    ledger: Arc<dyn EventLedger>,
    alerts: Arc<AlertBus>,
    jobs: RwLock<HashMap<Uuid, Arc<LiveJob>>>,
    /// One permit per browser context the pool may hold.
    workers: Arc<Semaphore>,
    /// Per-profile execution slots.
    profiles: Mutex<HashMap<String, Arc<Semaphore>>>,
    closing: AtomicBool,
}

/// What happened to the recovered jobs at startup.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub waiting: usize,
    pub requeued: usize,
    pub interrupted: usize,
}

/// Runs browser jobs. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        driver: Arc<dyn BrowserDriver>,
        store: Arc<dyn JobStore>,
        ledger: Arc<dyn EventLedger>,
        alerts: Arc<AlertBus>,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.max_workers.max(1)));
        Self {
            inner: Arc::new(Inner {
                config,
                driver,
                store,
                ledger,
                alerts,
                jobs: RwLock::new(HashMap::new()),
                workers,
                profiles: Mutex::new(HashMap::new()),
                closing: AtomicBool::new(false),
            }),
        }
    }

    /// Accept a job and queue it for a worker.
    pub async fn submit(&self, spec: JobSpec) -> Result<Uuid, JobError> {
        if self.inner.closing.load(Ordering::SeqCst) {
            return Err(JobError::ShuttingDown);
        }
        spec.validate()?;

        let job = BrowserJob::new(spec);
        self.inner.store.save(&job).await?;

        let id = job.id;
        let cancel = CancellationToken::new();
        info!(job_id = %id, profile = %job.spec.profile, url = %job.spec.url, "Browser job submitted");
        self.inner
            .emit(
                &job,
                EventType::JobSubmitted,
                json!({ "url": job.spec.url, "profile": job.spec.profile }),
            )
            .await;
        self.inner
            .jobs
            .write()
            .await
            .insert(id, LiveJob::new(job, cancel.clone()));

        self.spawn_worker(id, cancel);
        Ok(id)
    }

    /// Current state, progress, artifacts, and error.
    pub async fn status(&self, id: Uuid) -> Result<JobStatus, JobError> {
        if let Some(job) = self.inner.snapshot(id).await {
            return Ok(job.status());
        }
        match self.inner.store.load(id).await? {
            Some(job) => Ok(job.status()),
            None => Err(JobError::NotFound { id }),
        }
    }

    /// Cancel a non-terminal job. In-flight driver calls are aborted at
    /// their next suspension point.
    pub async fn cancel(&self, id: Uuid, reason: &str) -> Result<(), JobError> {
        if !self.inner.is_live(id).await {
            return Err(self.inner.not_live(id, JobState::Cancelled).await);
        }
        let job = self
            .inner
            .mutate(id, |job| {
                job.transition_to(JobState::Cancelled, Some(reason.to_string()))
            })
            .await?;
        self.inner.trip(id).await;

        info!(job_id = %id, "Browser job cancelled: {reason}");
        self.inner
            .emit(&job, EventType::JobCancelled, json!({ "reason": reason }))
            .await;
        Ok(())
    }

    /// Resume a job waiting for a person. Only valid from WAITING_FOR_HUMAN.
    pub async fn resume(&self, id: Uuid, note: &str) -> Result<(), JobError> {
        if !self.inner.is_live(id).await {
            return Err(self.inner.not_live(id, JobState::Resumed).await);
        }
        let job = self
            .inner
            .mutate(id, |job| {
                job.transition_to(JobState::Resumed, Some(note.to_string()))?;
                job.resume_note = Some(note.to_string());
                // A confirmation gate is passed by the resume itself.
                if job.gate == Some(HandoffGate::Confirmation)
                    && let Some(cp) = job.checkpoint.as_mut()
                {
                    cp.step_index += 1;
                    cp.progress.steps_done = cp.step_index;
                    job.progress = cp.progress.clone();
                }
                job.gate = None;
                Ok(())
            })
            .await?;

        info!(job_id = %id, "Browser job resumed: {note}");
        self.inner
            .emit(&job, EventType::JobResumed, json!({ "note": note }))
            .await;

        let cancel = self.inner.token(id).await.unwrap_or_default();
        self.spawn_worker(id, cancel);
        Ok(())
    }

    /// Cancel every handoff older than the TTL. Each expired job produces
    /// exactly one `HandoffExpired` event and one operator alert.
    pub async fn expire_handoffs(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let ttl = self.inner.config.handoff_ttl();
        let mut candidates = Vec::new();
        for (id, live) in self.inner.entries().await {
            if live.job.lock().await.handoff_expired(ttl, now) {
                candidates.push(id);
            }
        }

        let mut expired = Vec::new();
        for id in candidates {
            let result = self
                .inner
                .mutate(id, |job| {
                    // Re-checked under the job lock: a concurrent resume or
                    // cancel wins and this sweep skips the job.
                    if !job.handoff_expired(ttl, now) {
                        return Err(JobError::InvalidTransition {
                            id,
                            state: job.state.to_string(),
                            target: JobState::Cancelled.to_string(),
                        });
                    }
                    job.transition_to(JobState::Cancelled, Some("handoff TTL expired".into()))
                })
                .await;

            match result {
                Ok(job) => {
                    self.inner.trip(id).await;
                    warn!(job_id = %id, "Handoff expired; job cancelled");
                    self.inner
                        .emit(
                            &job,
                            EventType::HandoffExpired,
                            json!({ "ttl_secs": self.inner.config.handoff_ttl_secs }),
                        )
                        .await;
                    self.inner.alerts.raise(OperatorAlert::new(
                        AlertKind::HandoffExpired,
                        id,
                        format!("Job {id} waited for a person past its TTL and was cancelled"),
                    ));
                    expired.push(id);
                }
                Err(e) => debug!(job_id = %id, "Skipping handoff expiry: {e}"),
            }
        }
        expired
    }

    /// Evict terminal jobs past the retention window from the live table.
    /// They stay in the job store.
    pub async fn prune(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::seconds(self.inner.config.retention_secs as i64);
        let mut stale = Vec::new();
        for (id, live) in self.inner.entries().await {
            let job = live.job.lock().await;
            if job.state.is_terminal() && job.finished_at.is_some_and(|at| at + retention <= now) {
                stale.push(id);
            }
        }
        if stale.is_empty() {
            return 0;
        }

        // Terminal jobs never change again, so the earlier check still holds.
        let mut jobs = self.inner.jobs.write().await;
        stale.iter().filter(|id| jobs.remove(*id).is_some()).count()
    }

    /// Number of jobs in the live table.
    pub async fn live_jobs(&self) -> usize {
        self.inner.jobs.read().await.len()
    }

    /// Reload persisted jobs after a restart.
    ///
    /// Waiting jobs keep their checkpoint, queued and resumed jobs are
    /// re-enqueued, and jobs that held a worker when the process died are
    /// failed as interrupted.
    pub async fn recover(&self) -> Result<RecoveryReport, JobError> {
        let mut report = RecoveryReport::default();

        for job in self.inner.store.list_active().await? {
            let id = job.id;
            let state = job.state;
            let cancel = CancellationToken::new();
            {
                let mut jobs = self.inner.jobs.write().await;
                if jobs.contains_key(&id) {
                    continue;
                }
                jobs.insert(id, LiveJob::new(job, cancel.clone()));
            }

            match state {
                JobState::WaitingForHuman => report.waiting += 1,
                JobState::Queued | JobState::Resumed => {
                    report.requeued += 1;
                    self.spawn_worker(id, cancel);
                }
                JobState::Dispatched | JobState::Running => {
                    report.interrupted += 1;
                    let err = DriverError::Other("interrupted".into());
                    self.inner.fail(id, &err, Vec::new()).await;
                }
                JobState::Succeeded | JobState::Failed | JobState::Cancelled => {}
            }
        }

        info!(
            waiting = report.waiting,
            requeued = report.requeued,
            interrupted = report.interrupted,
            "Browser jobs recovered"
        );
        Ok(report)
    }

    /// Periodically expire handoffs and prune old jobs.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let orchestrator = self.clone();
        let period = Duration::from_secs(self.inner.config.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let now = Utc::now();
                let expired = orchestrator.expire_handoffs(now).await;
                let pruned = orchestrator.prune(now).await;
                if !expired.is_empty() || pruned > 0 {
                    debug!(expired = expired.len(), pruned, "Job sweep");
                }
            }
        })
    }

    /// Stop accepting new jobs.
    pub fn shutdown(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);
    }

    fn spawn_worker(&self, id: Uuid, cancel: CancellationToken) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            run_job(inner, id, cancel).await;
        });
    }
}

#[async_trait]
impl JobTracker for Orchestrator {
    async fn job_state(&self, job_id: Uuid) -> Result<Option<JobState>, StoreError> {
        if let Some(live) = self.inner.live(job_id).await {
            return Ok(Some(live.job.lock().await.state));
        }
        Ok(self.inner.store.load(job_id).await?.map(|j| j.state))
    }
}

impl Inner {
    /// Validate `f` on a copy, persist it, then publish it.
    async fn mutate<F>(&self, id: Uuid, f: F) -> Result<BrowserJob, JobError>
    where
        F: FnOnce(&mut BrowserJob) -> Result<(), JobError>,
    {
        let live = self.live(id).await.ok_or(JobError::NotFound { id })?;
        let mut job = live.job.lock().await;
        let mut draft = job.clone();
        f(&mut draft)?;
        draft.updated_at = Utc::now();
        self.store.save(&draft).await?;
        *job = draft.clone();
        Ok(draft)
    }

    /// Look up a live entry. The table lock is released on return.
    async fn live(&self, id: Uuid) -> Option<Arc<LiveJob>> {
        self.jobs.read().await.get(&id).cloned()
    }

    async fn entries(&self) -> Vec<(Uuid, Arc<LiveJob>)> {
        self.jobs
            .read()
            .await
            .iter()
            .map(|(id, live)| (*id, Arc::clone(live)))
            .collect()
    }

    async fn is_live(&self, id: Uuid) -> bool {
        self.jobs.read().await.contains_key(&id)
    }

    /// Error for a control request on a job that is not in the live table.
    async fn not_live(&self, id: Uuid, target: JobState) -> JobError {
        match self.store.load(id).await {
            Ok(Some(job)) => JobError::InvalidTransition {
                id,
                state: job.state.to_string(),
                target: target.to_string(),
            },
            Ok(None) => JobError::NotFound { id },
            Err(e) => JobError::Store(e),
        }
    }

    async fn token(&self, id: Uuid) -> Option<CancellationToken> {
        self.live(id).await.map(|l| l.cancel.clone())
    }

    /// Set the job's cancel flag.
    async fn trip(&self, id: Uuid) {
        if let Some(token) = self.token(id).await {
            token.cancel();
        }
    }

    async fn profile_slot(&self, profile: &str) -> Arc<Semaphore> {
        let mut profiles = self.profiles.lock().await;
        Arc::clone(
            profiles
                .entry(profile.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.config.tabs_per_profile.max(1)))),
        )
    }

    fn limits(&self) -> StepLimits {
        StepLimits {
            step: self.config.step_timeout(),
            navigation: self.config.nav_timeout(),
        }
    }

    async fn emit(&self, job: &BrowserJob, event_type: EventType, details: serde_json::Value) {
        ledger::record(
            self.ledger.as_ref(),
            Event::new(EventSubject::Job(job.id), event_type, job.correlation_id).with_details(details),
        )
        .await;
    }

    async fn emit_warnings(&self, id: Uuid, warnings: &[String]) {
        let Some(job) = self.snapshot(id).await else {
            return;
        };
        for warning in warnings {
            warn!(job_id = %id, "Artifact capture failed: {warning}");
            self.emit(&job, EventType::ArtifactWarning, json!({ "warning": warning }))
                .await;
        }
    }

    async fn snapshot(&self, id: Uuid) -> Option<BrowserJob> {
        let live = self.live(id).await?;
        let job = live.job.lock().await.clone();
        Some(job)
    }

    /// Terminal failure with classification and whatever artifacts were captured.
    async fn fail(&self, id: Uuid, err: &DriverError, captured: Vec<super::artifacts::Artifact>) {
        let failure = JobFailure {
            kind: err.kind(),
            message: err.to_string(),
        };
        let result = self
            .mutate(id, |job| {
                job.artifacts.extend(captured);
                job.error = Some(failure.clone());
                job.transition_to(JobState::Failed, Some(failure.message.clone()))
            })
            .await;

        match result {
            Ok(job) => {
                error!(job_id = %id, kind = %failure.kind, "Browser job failed: {}", failure.message);
                self.emit(
                    &job,
                    EventType::JobFailed,
                    json!({ "kind": failure.kind, "message": failure.message }),
                )
                .await;
            }
            Err(e) => debug!(job_id = %id, "Failure not recorded: {e}"),
        }
    }
}

/// How a worker's run ended.
enum Ending {
    Succeeded,
    Failed(DriverError),
    Handoff {
        gate: HandoffGate,
        reason: String,
        step_index: usize,
        progress: Progress,
        location: String,
    },
    Cancelled,
}

async fn run_job(inner: Arc<Inner>, id: Uuid, cancel: CancellationToken) {
    let Some(profile) = inner.snapshot(id).await.map(|j| j.spec.profile) else {
        return;
    };

    // Profile slot first, so a job blocked on its profile does not hold a worker.
    let slot = inner.profile_slot(&profile).await;
    let _profile_permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        permit = slot.acquire_owned() => match permit {
            Ok(p) => p,
            Err(_) => return,
        },
    };
    let _worker_permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        permit = Arc::clone(&inner.workers).acquire_owned() => match permit {
            Ok(p) => p,
            Err(_) => return,
        },
    };

    let job = match inner
        .mutate(id, |job| match job.state {
            JobState::Queued => job.transition_to(JobState::Dispatched, None),
            JobState::Resumed => Ok(()),
            other => Err(JobError::InvalidTransition {
                id,
                state: other.to_string(),
                target: JobState::Dispatched.to_string(),
            }),
        })
        .await
    {
        Ok(job) => job,
        Err(e) => {
            debug!(job_id = %id, "Worker not starting: {e}");
            return;
        }
    };
    if job.state == JobState::Dispatched {
        inner
            .emit(&job, EventType::JobDispatched, json!({ "profile": profile }))
            .await;
    }

    let opened = driver::guarded(
        &cancel,
        inner.config.nav_timeout(),
        "open_context",
        inner.driver.open_context(&profile),
    )
    .await;
    let mut ctx = match opened {
        Ok(ctx) => ctx,
        Err(DriverError::Cancelled) => return,
        Err(e) => {
            inner.fail(id, &e, Vec::new()).await;
            return;
        }
    };

    let ending = execute(&inner, id, &cancel, ctx.as_mut(), job).await;
    finish(&inner, id, ctx.as_mut(), ending).await;
    ctx.close().await;
}

async fn execute(
    inner: &Inner,
    id: Uuid,
    cancel: &CancellationToken,
    ctx: &mut dyn BrowserContext,
    job: BrowserJob,
) -> Ending {
    let limits = inner.limits();
    let plan = job.spec.plan();

    match inner
        .mutate(id, |j| j.transition_to(JobState::Running, None))
        .await
    {
        Ok(running) => inner.emit(&running, EventType::JobRunning, json!({})).await,
        Err(_) => return Ending::Cancelled,
    }

    let (mut index, mut progress, mut location) = match &job.checkpoint {
        Some(cp) => (cp.step_index, cp.progress.clone(), cp.location.clone()),
        None => (0, job.progress.clone(), job.spec.url.clone()),
    };
    progress.steps_total = plan.len();

    // Restore the page the job was on before it paused.
    if index > 0 && index < plan.len() {
        match driver::guarded(cancel, limits.navigation, "navigate", ctx.navigate(&location)).await {
            Ok(()) => {}
            Err(DriverError::Cancelled) => return Ending::Cancelled,
            Err(e) => return Ending::Failed(e),
        }
    }

    let mut first_retry_captured = job.retries > 0;

    while index < plan.len() {
        if cancel.is_cancelled() {
            return Ending::Cancelled;
        }
        let step = &plan[index];

        if let TaskStep::HumanGate { prompt } = step {
            return Ending::Handoff {
                gate: HandoffGate::Confirmation,
                reason: prompt.clone(),
                step_index: index,
                progress,
                location,
            };
        }

        let value = match driver::execute_step(ctx, step, None, limits, cancel).await {
            Ok(value) => value,
            Err(DriverError::Cancelled) => return Ending::Cancelled,
            Err(DriverError::Challenge(name)) => {
                return Ending::Handoff {
                    gate: HandoffGate::Challenge,
                    reason: name,
                    step_index: index,
                    progress,
                    location,
                };
            }
            Err(e) => {
                if !first_retry_captured {
                    first_retry_captured = true;
                    let captured = artifacts::capture_bundle(ctx, CaptureReason::FirstRetry).await;
                    store_captured(inner, id, captured).await;
                }
                if inner
                    .mutate(id, |j| {
                        j.retries += 1;
                        Ok(())
                    })
                    .await
                    .is_err()
                {
                    return Ending::Cancelled;
                }

                let mut substeps = Vec::new();
                let outcome = healing::heal(
                    ctx,
                    HealRequest {
                        job_id: id,
                        step,
                        step_index: index,
                        checkpoint_url: Some(location.as_str()),
                        rounds: inner.config.recovery_rounds,
                        limits,
                        cancel,
                    },
                    e,
                    &mut substeps,
                )
                .await;
                record_substeps(inner, id, substeps).await;

                match outcome {
                    HealOutcome::Recovered(value) => value,
                    HealOutcome::Cancelled => return Ending::Cancelled,
                    HealOutcome::Challenge(name) => {
                        return Ending::Handoff {
                            gate: HandoffGate::Challenge,
                            reason: name,
                            step_index: index,
                            progress,
                            location,
                        };
                    }
                    HealOutcome::Exhausted(e) => return Ending::Failed(e),
                }
            }
        };

        if matches!(step, TaskStep::Navigate { .. }) {
            match driver::guarded(cancel, limits.step, "detect_gate", ctx.detect_gate()).await {
                Ok(Some(gate)) => {
                    return Ending::Handoff {
                        gate: HandoffGate::Challenge,
                        reason: gate,
                        step_index: index,
                        progress,
                        location,
                    };
                }
                Ok(None) => {}
                Err(DriverError::Cancelled) => return Ending::Cancelled,
                Err(e) => debug!(job_id = %id, "Gate detection failed: {e}"),
            }
        }

        if let (TaskStep::Extract { field, .. }, Some(value)) = (step, value) {
            progress.extracted.insert(field.clone(), value);
        }
        index += 1;
        progress.steps_done = index;
        if let Some(url) = ctx.current_url() {
            location = url;
        }

        let checkpoint = Checkpoint {
            location: location.clone(),
            step_index: index,
            progress: progress.clone(),
            artifacts: Vec::new(),
            saved_at: Utc::now(),
        };
        let saved = inner
            .mutate(id, |j| {
                if j.state != JobState::Running {
                    return Err(JobError::InvalidTransition {
                        id,
                        state: j.state.to_string(),
                        target: JobState::Running.to_string(),
                    });
                }
                j.progress = progress.clone();
                j.checkpoint = Some(Checkpoint {
                    artifacts: j.artifacts.clone(),
                    ..checkpoint
                });
                Ok(())
            })
            .await;
        if saved.is_err() {
            return Ending::Cancelled;
        }
    }

    Ending::Succeeded
}

async fn finish(inner: &Inner, id: Uuid, ctx: &mut dyn BrowserContext, ending: Ending) {
    match ending {
        Ending::Succeeded => {
            let captured = artifacts::capture_final(ctx).await;
            inner.emit_warnings(id, &captured.warnings).await;
            let finals = captured.artifacts;
            let result = inner
                .mutate(id, |job| {
                    artifacts::retain_success(&mut job.artifacts, finals);
                    job.error = None;
                    job.transition_to(JobState::Succeeded, None)
                })
                .await;
            match result {
                Ok(job) => {
                    info!(job_id = %id, elapsed = ?job.elapsed(), "Browser job succeeded");
                    inner
                        .emit(
                            &job,
                            EventType::JobSucceeded,
                            json!({ "extracted": job.progress.extracted }),
                        )
                        .await;
                }
                Err(e) => debug!(job_id = %id, "Success not recorded: {e}"),
            }
        }
        Ending::Failed(err) => {
            let captured = artifacts::capture_bundle(ctx, CaptureReason::Failure).await;
            inner.emit_warnings(id, &captured.warnings).await;
            inner.fail(id, &err, captured.artifacts).await;
        }
        Ending::Handoff {
            gate,
            reason,
            step_index,
            progress,
            location,
        } => {
            let result = inner
                .mutate(id, |job| {
                    job.checkpoint = Some(Checkpoint {
                        location,
                        step_index,
                        progress: progress.clone(),
                        artifacts: job.artifacts.clone(),
                        saved_at: Utc::now(),
                    });
                    job.progress = progress;
                    job.gate = Some(gate);
                    job.transition_to(JobState::WaitingForHuman, Some(reason.clone()))
                })
                .await;
            match result {
                Ok(job) => {
                    info!(job_id = %id, gate = ?gate, "Browser job waiting for a person: {reason}");
                    inner
                        .emit(
                            &job,
                            EventType::WaitingForHuman,
                            json!({ "gate": gate, "reason": reason, "step": step_index }),
                        )
                        .await;
                    inner.alerts.raise(OperatorAlert::new(
                        AlertKind::HandoffRequired,
                        id,
                        format!("Job {id} needs a person: {reason}"),
                    ));
                }
                Err(e) => debug!(job_id = %id, "Handoff not recorded: {e}"),
            }
        }
        Ending::Cancelled => {
            // The cancel request already moved the job to CANCELLED; only
            // flush whatever partial artifacts the context still has.
            let captured = artifacts::capture_bundle(ctx, CaptureReason::Cancelled).await;
            store_captured(inner, id, captured).await;
            debug!(job_id = %id, "Browser job worker stopped after cancel");
        }
    }
}

/// Append captured artifacts and report capture warnings.
async fn store_captured(inner: &Inner, id: Uuid, captured: Captured) {
    if !captured.warnings.is_empty() {
        inner.emit_warnings(id, &captured.warnings).await;
    }
    if captured.artifacts.is_empty() {
        return;
    }
    let artifacts = captured.artifacts;
    if let Err(e) = inner
        .mutate(id, |job| {
            job.artifacts.extend(artifacts);
            Ok(())
        })
        .await
    {
        warn!(job_id = %id, "Failed to store artifacts: {e}");
    }
}

async fn record_substeps(inner: &Inner, id: Uuid, substeps: Vec<SubStep>) {
    if substeps.is_empty() {
        return;
    }
    let recorded = substeps.clone();
    let job = match inner
        .mutate(id, |job| {
            for substep in recorded {
                job.record_substep(substep);
            }
            Ok(())
        })
        .await
    {
        Ok(job) => job,
        Err(e) => {
            debug!(job_id = %id, "Sub-steps not recorded: {e}");
            return;
        }
    };
    for substep in substeps {
        inner
            .emit(
                &job,
                EventType::RecoveryStep,
                json!({
                    "round": substep.round,
                    "strategy": substep.strategy,
                    "step": substep.step_index,
                    "detail": substep.detail,
                    "succeeded": substep.succeeded,
                }),
            )
            .await;
    }
}
