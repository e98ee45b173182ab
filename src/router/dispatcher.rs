//! Batch processing of approved items.
//!
//! Per item: claim (versioned, leased) → policy gate → stale-content check →
//! rate-limit commit → adapter send under a timeout → outcome write → event.
//! The claim is the only serialization point; nothing here relies on
//! process-local locking for correctness.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::JobTracker;
use super::backoff::Backoff;
use crate::alerts::{AlertBus, AlertKind, OperatorAlert};
use crate::approval::{Approval, ApprovalPatch, ApprovalStatus, ApprovalStore, ClaimLease};
use crate::browser::JobState;
use crate::channels::{AdapterRegistry, Cleared, SendOutcome};
use crate::config::{RetryConfig, RouterConfig};
use crate::error::{Error, StoreError};
use crate::ledger::{self, Event, EventLedger, EventSubject, EventType};
use crate::policy::{
    self, Decision, DenyReason, DncSet, DncSource, PolicyRules, RateLimitCounter, RateWindow,
};

/// Times one item may be re-claimed because it was edited mid-flight.
const MAX_REEVALUATIONS: usize = 3;

/// Times an outcome write is re-applied after a version conflict.
const MAX_WRITE_ATTEMPTS: usize = 3;

/// Upper bound on opened approvals examined per reconciliation pass.
const RECONCILE_LIMIT: usize = 1000;

/// Counts for one `process_approved` invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    /// Items claimed and driven to an outcome.
    pub processed: usize,
    pub sent: usize,
    /// Denied by policy or failed fatally.
    pub failed: usize,
    pub dead_lettered: usize,
    /// Delegated to a browser job.
    pub opened: usize,
    /// Scheduled for another attempt.
    pub retried: usize,
    /// Lost to another claimant or abandoned after repeated edits.
    pub skipped: usize,
}

/// Collaborators the router needs.
pub struct RouterDeps {
    pub store: Arc<dyn ApprovalStore>,
    pub ledger: Arc<dyn EventLedger>,
    pub counters: Arc<dyn RateLimitCounter>,
    pub dnc: Arc<dyn DncSource>,
    pub adapters: AdapterRegistry,
    pub alerts: Arc<AlertBus>,
}

/// Per-item result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemResult {
    Sent,
    Opened,
    Retried,
    DeadLettered,
    Failed,
    Skipped,
    /// Storage became unreachable; the batch stops.
    Halted,
}

/// What to record for a claimed item.
enum Disposition {
    Denied(DenyReason),
    Outcome(SendOutcome),
}

pub struct Router {
    store: Arc<dyn ApprovalStore>,
    ledger: Arc<dyn EventLedger>,
    counters: Arc<dyn RateLimitCounter>,
    dnc: Arc<dyn DncSource>,
    adapters: AdapterRegistry,
    alerts: Arc<AlertBus>,
    jobs: Option<Arc<dyn JobTracker>>,
    rules: PolicyRules,
    backoff: Backoff,
    retry: RetryConfig,
    config: RouterConfig,
}

impl Router {
    pub fn new(deps: RouterDeps, rules: PolicyRules, retry: RetryConfig, config: RouterConfig) -> Self {
        Self {
            store: deps.store,
            ledger: deps.ledger,
            counters: deps.counters,
            dnc: deps.dnc,
            adapters: deps.adapters,
            alerts: deps.alerts,
            jobs: None,
            rules,
            backoff: Backoff::new(&retry),
            retry,
            config,
        }
    }

    /// Attach the browser job tracker used by `reconcile_opened`.
    pub fn with_job_tracker(mut self, jobs: Arc<dyn JobTracker>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Process up to `max_batch` due approvals.
    pub async fn process_approved(&self, max_batch: usize) -> Result<BatchReport, Error> {
        self.process_approved_at(max_batch, Utc::now()).await
    }

    /// Process up to `max_batch` approvals due at `now`.
    ///
    /// If storage becomes unavailable mid-batch, items already written stay
    /// written, remaining items are left untouched, and the call fails.
    pub async fn process_approved_at(
        &self,
        max_batch: usize,
        now: DateTime<Utc>,
    ) -> Result<BatchReport, Error> {
        if max_batch == 0 {
            return Ok(BatchReport::default());
        }

        let candidates = self.store.list_claimable(now, max_batch).await?;
        if candidates.is_empty() {
            return Ok(BatchReport::default());
        }

        let dnc = self.dnc.load().await?;
        let halted = AtomicBool::new(false);
        // Overlapping invocations on one router must not share a lease.
        let claimant = format!("{}#{}", self.config.claimant, Uuid::new_v4());
        debug!(%claimant, candidates = candidates.len(), "Dispatch batch starting");

        let results: Vec<ItemResult> = futures::stream::iter(candidates)
            .map(|approval| self.process_one(approval, &claimant, &dnc, now, &halted))
            .buffer_unordered(self.config.batch_concurrency.max(1))
            .collect()
            .await;

        let mut report = BatchReport::default();
        for result in results {
            match result {
                ItemResult::Sent => report.sent += 1,
                ItemResult::Opened => report.opened += 1,
                ItemResult::Retried => report.retried += 1,
                ItemResult::DeadLettered => report.dead_lettered += 1,
                ItemResult::Failed => report.failed += 1,
                ItemResult::Skipped | ItemResult::Halted => {
                    report.skipped += 1;
                    continue;
                }
            }
            report.processed += 1;
        }

        if halted.load(Ordering::SeqCst) {
            error!(?report, "Storage unavailable; batch aborted");
            return Err(StoreError::Unavailable("storage unavailable during batch".into()).into());
        }

        info!(
            processed = report.processed,
            sent = report.sent,
            failed = report.failed,
            dead_lettered = report.dead_lettered,
            opened = report.opened,
            retried = report.retried,
            skipped = report.skipped,
            "Dispatch batch complete"
        );
        Ok(report)
    }

    async fn process_one(
        &self,
        approval: Approval,
        claimant: &str,
        dnc: &DncSet,
        now: DateTime<Utc>,
        halted: &AtomicBool,
    ) -> ItemResult {
        let id = approval.id;
        let mut expected = approval.version;

        for _ in 0..MAX_REEVALUATIONS {
            if halted.load(Ordering::SeqCst) {
                return ItemResult::Skipped;
            }

            let lease = ClaimLease {
                claimant: claimant.to_string(),
                until: now + self.config.claim_lease(),
            };
            let claimed = match self.store.claim(id, expected, lease, now).await {
                Ok(claimed) => claimed,
                Err(e) if e.is_conflict() => {
                    // Edited between listing and claiming, or taken by another
                    // invocation. Only the former is worth another look.
                    debug!(approval_id = %id, "Claim conflict: {e}");
                    match self.store.get(id).await {
                        Ok(Some(fresh))
                            if fresh.is_due(now)
                                && fresh.is_claimable_by(claimant, now)
                                && fresh.version != expected =>
                        {
                            expected = fresh.version;
                            continue;
                        }
                        Ok(_) => return ItemResult::Skipped,
                        Err(e) => return self.storage_failure(id, e, halted),
                    }
                }
                Err(e) => return self.storage_failure(id, e, halted),
            };

            let keys = self.rules.window_keys(now);
            let snapshot = match self.counters.snapshot(&claimed.channel, &keys).await {
                Ok(s) => s,
                Err(e) => return self.storage_failure(id, e, halted),
            };

            if let Decision::Deny(reason) = policy::evaluate(&claimed, &snapshot, dnc, &self.rules, now) {
                return self.record(claimed, Disposition::Denied(reason), now, halted).await;
            }

            // Never send content older than what is stored.
            match self.store.get(id).await {
                Ok(Some(current)) if current.version == claimed.version => {}
                Ok(Some(current)) if !holds_lease(&current, claimant, now) => {
                    warn!(approval_id = %id, "Lease lost before send; skipping");
                    return ItemResult::Skipped;
                }
                Ok(Some(current)) => {
                    info!(
                        approval_id = %id,
                        claimed = claimed.version,
                        current = current.version,
                        "Approval edited after claim; re-evaluating"
                    );
                    expected = current.version;
                    continue;
                }
                Ok(None) => return ItemResult::Skipped,
                Err(e) => return self.storage_failure(id, e, halted),
            }

            let caps = self.rules.caps_for(&claimed.channel);
            match self.counters.try_acquire(&claimed.channel, &keys, caps).await {
                Ok(true) => {}
                Ok(false) => {
                    let window = match self.counters.snapshot(&claimed.channel, &keys).await {
                        Ok(s) => caps.exceeded(&s).unwrap_or(RateWindow::Hourly),
                        Err(_) => RateWindow::Hourly,
                    };
                    return self
                        .record(claimed, Disposition::Denied(DenyReason::RateLimited { window }), now, halted)
                        .await;
                }
                Err(e) => return self.storage_failure(id, e, halted),
            }

            let outcome = self.send(claimed.clone()).await;
            return self.record(claimed, Disposition::Outcome(outcome), now, halted).await;
        }

        // Kept changing under us; let the lease lapse and pick it up next run.
        warn!(approval_id = %id, "Approval re-evaluated {MAX_REEVALUATIONS} times; deferring");
        self.release(id, claimant).await;
        ItemResult::Skipped
    }

    /// Invoke the channel adapter under the send timeout.
    async fn send(&self, approval: Approval) -> SendOutcome {
        let Some(adapter) = self.adapters.get(&approval.channel) else {
            return SendOutcome::FatalError(format!(
                "no adapter registered for channel {}",
                approval.channel
            ));
        };

        let cleared = Cleared::new(approval);
        let timeout = self.config.send_timeout();
        match tokio::time::timeout(timeout, adapter.send(&cleared)).await {
            Ok(outcome) => outcome,
            Err(_) => SendOutcome::RetryableError(format!("timeout after {timeout:?}")),
        }
    }

    /// Write the disposition of a claimed approval and append its event.
    async fn record(
        &self,
        claimed: Approval,
        disposition: Disposition,
        now: DateTime<Utc>,
        halted: &AtomicBool,
    ) -> ItemResult {
        let id = claimed.id;
        let base = ApprovalPatch::default().releasing_claim();

        let (patch, event_type, details, result) = match disposition {
            Disposition::Denied(reason) => (
                ApprovalPatch {
                    status: Some(ApprovalStatus::Failed),
                    ..base
                }
                .with_error(format!("denied: {reason}")),
                EventType::Denied,
                serde_json::to_value(&reason).unwrap_or_default(),
                ItemResult::Failed,
            ),
            Disposition::Outcome(SendOutcome::Sent) => (
                ApprovalPatch {
                    status: Some(ApprovalStatus::Sent),
                    ..base
                }
                .with_next_attempt_at(None),
                EventType::Sent,
                json!({ "channel": claimed.channel, "attempt": claimed.attempts + 1 }),
                ItemResult::Sent,
            ),
            Disposition::Outcome(SendOutcome::NeedsManualOpen(job_id)) => (
                ApprovalPatch {
                    status: Some(ApprovalStatus::ApprovedOpened),
                    ..base
                }
                .with_job_ref(job_id),
                EventType::Opened,
                json!({ "job_id": job_id }),
                ItemResult::Opened,
            ),
            Disposition::Outcome(SendOutcome::RetryableError(reason)) => {
                let attempts = claimed.attempts.saturating_add(1);
                if attempts < self.retry.max_attempts {
                    let delay = self.backoff.jittered(attempts);
                    let next = now
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::seconds(self.retry.cap_secs as i64));
                    (
                        base.with_attempts(attempts)
                            .with_error(reason.clone())
                            .with_next_attempt_at(Some(next)),
                        EventType::RetryScheduled,
                        json!({ "attempt": attempts, "next_attempt_at": next, "error": reason }),
                        ItemResult::Retried,
                    )
                } else {
                    (
                        ApprovalPatch {
                            status: Some(ApprovalStatus::Failed),
                            ..base
                        }
                        .with_attempts(attempts)
                        .with_error(reason.clone())
                        .with_next_attempt_at(None),
                        EventType::DeadLettered,
                        json!({ "attempts": attempts, "error": reason }),
                        ItemResult::DeadLettered,
                    )
                }
            }
            Disposition::Outcome(SendOutcome::FatalError(reason)) => (
                ApprovalPatch {
                    status: Some(ApprovalStatus::Failed),
                    ..base
                }
                .with_error(reason.clone()),
                EventType::Failed,
                json!({ "error": reason }),
                ItemResult::Failed,
            ),
        };

        let written = match self.write(id, patch, claimed.version).await {
            Ok(written) => written,
            Err(e) => {
                if result == ItemResult::Sent || result == ItemResult::Opened {
                    error!(approval_id = %id, "Delivered but outcome not recorded: {e}");
                }
                return self.storage_failure(id, e, halted);
            }
        };

        info!(
            approval_id = %id,
            channel = %written.channel,
            status = %written.status,
            event = %event_type,
            "Approval processed"
        );
        ledger::record(
            self.ledger.as_ref(),
            Event::new(EventSubject::Approval(id), event_type, id).with_details(details),
        )
        .await;

        if result == ItemResult::DeadLettered {
            self.alerts.raise(OperatorAlert::new(
                AlertKind::DeadLettered,
                id,
                format!(
                    "Approval {id} on {} dead-lettered after {} attempts: {}",
                    written.channel,
                    written.attempts,
                    written.last_error.as_deref().unwrap_or("unknown error")
                ),
            ));
        }
        result
    }

    /// Apply `patch`, re-reading and re-applying on version conflicts.
    /// The outcome is a fact once the send happened, so a concurrent edit
    /// must not swallow it.
    async fn write(&self, id: Uuid, patch: ApprovalPatch, mut expected: u64) -> Result<Approval, StoreError> {
        let mut last = None;
        for _ in 0..MAX_WRITE_ATTEMPTS {
            match self.store.update(id, patch.clone(), expected).await {
                Ok(written) => return Ok(written),
                Err(e) if e.is_conflict() => {
                    debug!(approval_id = %id, "Outcome write conflict; re-reading: {e}");
                    let fresh = self
                        .store
                        .get(id)
                        .await?
                        .ok_or_else(|| StoreError::not_found("approval", id))?;
                    expected = fresh.version;
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or_else(|| StoreError::conflict("approval", id, "write retries exhausted")))
    }

    /// Best-effort lease release.
    async fn release(&self, id: Uuid, claimant: &str) {
        if let Ok(Some(current)) = self.store.get(id).await
            && current.lease.as_ref().is_some_and(|l| l.claimant == claimant)
            && let Err(e) = self
                .store
                .update(id, ApprovalPatch::default().releasing_claim(), current.version)
                .await
        {
            debug!(approval_id = %id, "Lease release failed: {e}");
        }
    }

    fn storage_failure(&self, id: Uuid, e: StoreError, halted: &AtomicBool) -> ItemResult {
        match e {
            StoreError::Unavailable(_) => {
                error!(approval_id = %id, "Storage unavailable: {e}");
                halted.store(true, Ordering::SeqCst);
                ItemResult::Halted
            }
            other => {
                warn!(approval_id = %id, "Skipping approval after storage error: {other}");
                ItemResult::Skipped
            }
        }
    }

    // ── Manual completion ───────────────────────────────────────────

    /// Record that a person completed an opened (semi-automated) send.
    pub async fn confirm_manual(&self, id: Uuid) -> Result<Approval, StoreError> {
        let written = self
            .finish_opened(id, ApprovalPatch::status(ApprovalStatus::SentManual))
            .await?;
        info!(approval_id = %id, "Manual send confirmed");
        ledger::record(
            self.ledger.as_ref(),
            Event::new(EventSubject::Approval(id), EventType::SentManual, id)
                .with_details(json!({ "job_id": written.job_ref })),
        )
        .await;
        Ok(written)
    }

    /// Record that an opened send will not happen.
    pub async fn fail_manual(&self, id: Uuid, reason: &str) -> Result<Approval, StoreError> {
        let written = self
            .finish_opened(id, ApprovalPatch::status(ApprovalStatus::Failed).with_error(reason))
            .await?;
        info!(approval_id = %id, "Manual send failed: {reason}");
        ledger::record(
            self.ledger.as_ref(),
            Event::new(EventSubject::Approval(id), EventType::Failed, id)
                .with_details(json!({ "error": reason, "job_id": written.job_ref })),
        )
        .await;
        Ok(written)
    }

    async fn finish_opened(&self, id: Uuid, patch: ApprovalPatch) -> Result<Approval, StoreError> {
        let current = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| StoreError::not_found("approval", id))?;
        if current.status != ApprovalStatus::ApprovedOpened {
            return Err(StoreError::InvalidTransition {
                id,
                from: current.status.to_string(),
                to: patch
                    .status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| current.status.to_string()),
            });
        }
        self.write(id, patch, current.version).await
    }

    /// Fail opened approvals whose browser job ended without a send.
    /// Returns how many were failed.
    pub async fn reconcile_opened(&self) -> Result<usize, Error> {
        let Some(jobs) = self.jobs.as_ref() else {
            return Ok(0);
        };

        let opened = self
            .store
            .list_by_status(ApprovalStatus::ApprovedOpened, RECONCILE_LIMIT)
            .await?;

        let mut failed = 0;
        for approval in opened {
            let Some(job_id) = approval.job_ref else {
                continue;
            };
            let state = match jobs.job_state(job_id).await? {
                Some(state) => state,
                None => {
                    warn!(approval_id = %approval.id, job_id = %job_id, "Backing job not found");
                    continue;
                }
            };
            if !matches!(state, JobState::Failed | JobState::Cancelled) {
                continue;
            }

            let reason = format!("browser job {job_id} ended {state}");
            match self.fail_manual(approval.id, &reason).await {
                Ok(_) => failed += 1,
                Err(e) if e.is_conflict() => debug!(approval_id = %approval.id, "Reconcile conflict: {e}"),
                Err(StoreError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(failed)
    }

    /// Flag terminal approvals past the archive window.
    pub async fn archive_terminal(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let cutoff = now - chrono::Duration::days(i64::from(self.config.archive_after_days));
        let archived = self.store.archive_terminal_before(cutoff).await?;
        if archived > 0 {
            info!(archived, "Archived terminal approvals");
        }
        Ok(archived)
    }
}

/// Whether `claimant` still holds an unexpired lease on `approval`.
fn holds_lease(approval: &Approval, claimant: &str, now: DateTime<Utc>) -> bool {
    approval
        .lease
        .as_ref()
        .is_some_and(|l| l.claimant == claimant && l.until > now)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use super::*;
    use crate::approval::InMemoryApprovalStore;
    use crate::channels::ChannelAdapter;
    use crate::ledger::InMemoryLedger;
    use crate::policy::{ChannelCaps, DncEntry, InMemoryRateCounter, StaticDncSource};

    /// Adapter returning a fixed outcome and counting calls.
    struct Fixed {
        outcome: SendOutcome,
        calls: AtomicUsize,
    }

    impl Fixed {
        fn new(outcome: SendOutcome) -> Arc<Self> {
            Arc::new(Self {
                outcome,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ChannelAdapter for Fixed {
        fn name(&self) -> &str {
            "email"
        }
        async fn send(&self, _cleared: &Cleared) -> SendOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome.clone()
        }
    }

    struct Harness {
        router: Router,
        store: Arc<InMemoryApprovalStore>,
        ledger: Arc<InMemoryLedger>,
    }

    fn harness(adapter: Arc<Fixed>, rules: PolicyRules, dnc: Vec<DncEntry>) -> Harness {
        let store = Arc::new(InMemoryApprovalStore::new());
        let ledger = Arc::new(InMemoryLedger::new());
        let deps = RouterDeps {
            store: store.clone(),
            ledger: ledger.clone(),
            counters: Arc::new(InMemoryRateCounter::new()),
            dnc: Arc::new(StaticDncSource::new(dnc)),
            adapters: AdapterRegistry::new().with(adapter),
            alerts: AlertBus::new(),
        };
        let retry = RetryConfig {
            jitter_pct: 0.0,
            ..RetryConfig::default()
        };
        Harness {
            router: Router::new(deps, rules, retry, RouterConfig::default()),
            store,
            ledger,
        }
    }

    async fn seed(store: &InMemoryApprovalStore, target: &str) -> Approval {
        let approval = Approval::new("email", target, serde_json::json!({"body": "hello"}))
            .with_status(ApprovalStatus::Approved);
        store.insert(&approval).await.unwrap();
        approval
    }

    #[tokio::test]
    async fn zero_batch_does_nothing() {
        let adapter = Fixed::new(SendOutcome::Sent);
        let h = harness(adapter.clone(), PolicyRules::permissive(), vec![]);
        seed(&h.store, "a@example.com").await;

        let report = h.router.process_approved(0).await.unwrap();
        assert_eq!(report, BatchReport::default());
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn sent_outcome_is_recorded_once() {
        let adapter = Fixed::new(SendOutcome::Sent);
        let h = harness(adapter, PolicyRules::permissive(), vec![]);
        let a = seed(&h.store, "a@example.com").await;

        let report = h.router.process_approved(10).await.unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(report.processed, 1);

        let stored = h.store.get(a.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ApprovalStatus::Sent);
        assert!(stored.lease.is_none());
        assert_eq!(h.ledger.count(EventSubject::Approval(a.id), EventType::Sent).await, 1);

        // A second run finds nothing left to do.
        let again = h.router.process_approved(10).await.unwrap();
        assert_eq!(again, BatchReport::default());
    }

    #[tokio::test]
    async fn dnc_denial_never_reaches_adapter() {
        let adapter = Fixed::new(SendOutcome::Sent);
        let h = harness(
            adapter.clone(),
            PolicyRules::permissive(),
            vec![DncEntry::new("Blocked@Example.com", "email", "unsubscribed")],
        );
        let a = seed(&h.store, "blocked@example.com").await;

        let report = h.router.process_approved(10).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 0);

        let stored = h.store.get(a.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ApprovalStatus::Failed);
        assert!(stored.last_error.unwrap().contains("dnc"));
        assert_eq!(h.ledger.count(EventSubject::Approval(a.id), EventType::Denied).await, 1);
    }

    #[tokio::test]
    async fn rate_cap_denies_overflow() {
        let adapter = Fixed::new(SendOutcome::Sent);
        let rules = PolicyRules::permissive().with_caps(
            "email",
            ChannelCaps {
                hourly: None,
                daily: Some(2),
            },
        );
        let h = harness(adapter.clone(), rules, vec![]);
        for i in 0..3 {
            seed(&h.store, &format!("user{i}@example.com")).await;
        }

        let report = h.router.process_approved(10).await.unwrap();
        assert_eq!(report.sent, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retryable_schedules_backoff() {
        let adapter = Fixed::new(SendOutcome::RetryableError("smtp 451".into()));
        let h = harness(adapter, PolicyRules::permissive(), vec![]);
        let a = seed(&h.store, "a@example.com").await;
        let now = Utc::now();

        let report = h.router.process_approved_at(10, now).await.unwrap();
        assert_eq!(report.retried, 1);

        let stored = h.store.get(a.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ApprovalStatus::Approved);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.next_attempt_at, Some(now + chrono::Duration::seconds(60)));
        assert!(stored.lease.is_none());

        // Not due yet.
        let early = h.router.process_approved_at(10, now).await.unwrap();
        assert_eq!(early, BatchReport::default());
    }

    #[tokio::test]
    async fn fatal_error_fails_without_retry() {
        let adapter = Fixed::new(SendOutcome::FatalError("mailbox does not exist".into()));
        let h = harness(adapter, PolicyRules::permissive(), vec![]);
        let a = seed(&h.store, "a@example.com").await;

        let report = h.router.process_approved(10).await.unwrap();
        assert_eq!(report.failed, 1);
        let stored = h.store.get(a.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ApprovalStatus::Failed);
        assert_eq!(stored.attempts, 0);
        assert_eq!(h.ledger.count(EventSubject::Approval(a.id), EventType::Failed).await, 1);
    }

    #[tokio::test]
    async fn missing_adapter_is_fatal() {
        let adapter = Fixed::new(SendOutcome::Sent);
        let h = harness(adapter, PolicyRules::permissive(), vec![]);
        let approval = Approval::new("fax", "555-0100", serde_json::json!({}))
            .with_status(ApprovalStatus::Approved);
        h.store.insert(&approval).await.unwrap();

        let report = h.router.process_approved(10).await.unwrap();
        assert_eq!(report.failed, 1);
        let stored = h.store.get(approval.id).await.unwrap().unwrap();
        assert!(stored.last_error.unwrap().contains("no adapter"));
    }

    #[tokio::test]
    async fn manual_confirmation_requires_opened() {
        let job_id = Uuid::new_v4();
        let adapter = Fixed::new(SendOutcome::NeedsManualOpen(job_id));
        let h = harness(adapter, PolicyRules::permissive(), vec![]);
        let a = seed(&h.store, "a@example.com").await;

        let report = h.router.process_approved(10).await.unwrap();
        assert_eq!(report.opened, 1);
        let opened = h.store.get(a.id).await.unwrap().unwrap();
        assert_eq!(opened.status, ApprovalStatus::ApprovedOpened);
        assert_eq!(opened.job_ref, Some(job_id));

        let confirmed = h.router.confirm_manual(a.id).await.unwrap();
        assert_eq!(confirmed.status, ApprovalStatus::SentManual);
        assert_eq!(h.ledger.count(EventSubject::Approval(a.id), EventType::SentManual).await, 1);

        let err = h.router.fail_manual(a.id, "too late").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    struct FailedJobs;

    #[async_trait]
    impl JobTracker for FailedJobs {
        async fn job_state(&self, _job_id: Uuid) -> Result<Option<JobState>, StoreError> {
            Ok(Some(JobState::Cancelled))
        }
    }

    #[tokio::test]
    async fn reconcile_fails_opened_with_dead_job() {
        let adapter = Fixed::new(SendOutcome::NeedsManualOpen(Uuid::new_v4()));
        let mut h = harness(adapter, PolicyRules::permissive(), vec![]);
        h.router = h.router.with_job_tracker(Arc::new(FailedJobs));
        let a = seed(&h.store, "a@example.com").await;
        h.router.process_approved(10).await.unwrap();

        assert_eq!(h.router.reconcile_opened().await.unwrap(), 1);
        let stored = h.store.get(a.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ApprovalStatus::Failed);
        assert!(stored.last_error.unwrap().contains("CANCELLED"));
    }

    #[tokio::test]
    async fn archive_flags_old_terminal_records() {
        let adapter = Fixed::new(SendOutcome::Sent);
        let h = harness(adapter, PolicyRules::permissive(), vec![]);
        let a = seed(&h.store, "a@example.com").await;
        h.router.process_approved(10).await.unwrap();

        assert_eq!(h.router.archive_terminal(Utc::now()).await.unwrap(), 0);
        let later = Utc::now() + chrono::Duration::days(31);
        assert_eq!(h.router.archive_terminal(later).await.unwrap(), 1);
        assert!(h.store.get(a.id).await.unwrap().unwrap().archived);
    }
}
