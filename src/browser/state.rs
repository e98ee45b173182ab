//! Browser job state machine and job records.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::artifacts::Artifact;
use super::healing::RecoveryStrategy;
use crate::error::{FailureKind, JobError};

/// Transition history is capped to prevent unbounded growth.
const MAX_TRANSITIONS: usize = 200;

/// Same cap for recorded recovery sub-steps.
const MAX_SUBSTEPS: usize = 200;

/// State of a browser job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Accepted, waiting for a worker and a profile slot.
    Queued,
    /// A worker holds the job and is opening a browser context.
    Dispatched,
    /// Steps are executing.
    Running,
    /// Paused on a gate only a person can pass.
    WaitingForHuman,
    /// An operator resumed the job; waiting for a worker again.
    Resumed,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    /// Check if this state allows transitioning to another state.
    ///
    /// Besides the main lifecycle, `Dispatched -> Failed` and
    /// `Resumed -> Failed` exist for jobs that die before any step runs: the
    /// browser context cannot be opened, or the process restarted while a
    /// worker held the job. Neither passes through `Running`, so no
    /// `JobRunning` event is emitted for work that never started.
    pub fn can_transition_to(&self, target: JobState) -> bool {
        use JobState::*;

        if target == Cancelled {
            return !self.is_terminal();
        }

        matches!(
            (self, target),
            (Queued, Dispatched) |
            (Dispatched, Running) | (Dispatched, Failed) |
            (Running, Succeeded) | (Running, Failed) | (Running, WaitingForHuman) |
            (WaitingForHuman, Resumed) |
            (Resumed, Running) | (Resumed, Failed)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Whether a worker should be holding compute for this job.
    pub fn holds_worker(&self) -> bool {
        matches!(self, Self::Dispatched | Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Dispatched => "DISPATCHED",
            Self::Running => "RUNNING",
            Self::WaitingForHuman => "WAITING_FOR_HUMAN",
            Self::Resumed => "RESUMED",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(Self::Queued),
            "DISPATCHED" => Ok(Self::Dispatched),
            "RUNNING" => Ok(Self::Running),
            "WAITING_FOR_HUMAN" => Ok(Self::WaitingForHuman),
            "RESUMED" => Ok(Self::Resumed),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            _ => Err(format!("Unknown job state: {s}")),
        }
    }
}

/// A state transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: JobState,
    pub to: JobState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Element locator: a primary expression plus fallbacks tried during
/// self-healing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locator {
    pub primary: String,
    #[serde(default)]
    pub alternates: Vec<String>,
}

impl Locator {
    pub fn new(primary: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            alternates: Vec::new(),
        }
    }

    pub fn or(mut self, alternate: impl Into<String>) -> Self {
        self.alternates.push(alternate.into());
        self
    }
}

/// One step of a browser task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TaskStep {
    Navigate { url: String },
    Click { locator: Locator },
    Fill { locator: Locator, value: String },
    /// Read the element's text into `progress.extracted[field]`.
    Extract { locator: Locator, field: String },
    WaitFor { locator: Locator },
    /// Explicit pause for a person (e.g. confirming a semi-automated send).
    HumanGate { prompt: String },
}

impl TaskStep {
    pub fn locator(&self) -> Option<&Locator> {
        match self {
            Self::Click { locator }
            | Self::Fill { locator, .. }
            | Self::Extract { locator, .. }
            | Self::WaitFor { locator } => Some(locator),
            Self::Navigate { .. } | Self::HumanGate { .. } => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Navigate { .. } => "navigate",
            Self::Click { .. } => "click",
            Self::Fill { .. } => "fill",
            Self::Extract { .. } => "extract",
            Self::WaitFor { .. } => "wait_for",
            Self::HumanGate { .. } => "human_gate",
        }
    }
}

fn default_profile() -> String {
    "default".to_string()
}

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Start page.
    pub url: String,
    /// Browser profile (shared session/cookie state).
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default)]
    pub steps: Vec<TaskStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    /// Approval this job backs, for semi-automated sends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<Uuid>,
}

impl JobSpec {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            profile: default_profile(),
            steps: Vec::new(),
            correlation_id: None,
            approval_id: None,
        }
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = profile.into();
        self
    }

    pub fn step(mut self, step: TaskStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn validate(&self) -> Result<(), JobError> {
        let invalid = |reason: String| JobError::InvalidSpec { reason };

        check_url(&self.url).map_err(invalid)?;
        if self.profile.trim().is_empty() {
            return Err(invalid("profile must not be empty".into()));
        }
        for (i, step) in self.steps.iter().enumerate() {
            if let TaskStep::Navigate { url } = step {
                check_url(url).map_err(|e| invalid(format!("step {i}: {e}")))?;
            }
            if let Some(locator) = step.locator()
                && locator.primary.trim().is_empty()
            {
                return Err(invalid(format!("step {i}: empty locator")));
            }
        }
        Ok(())
    }

    /// The executed plan: the start page followed by the task steps.
    pub fn plan(&self) -> Vec<TaskStep> {
        let mut plan = Vec::with_capacity(self.steps.len() + 1);
        plan.push(TaskStep::Navigate {
            url: self.url.clone(),
        });
        plan.extend(self.steps.iter().cloned());
        plan
    }
}

fn check_url(raw: &str) -> Result<(), String> {
    let url = reqwest::Url::parse(raw).map_err(|e| format!("invalid url {raw:?}: {e}"))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(format!("unsupported url scheme {other:?}")),
    }
}

/// How far a job got.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub steps_total: usize,
    pub steps_done: usize,
    #[serde(default)]
    pub extracted: BTreeMap<String, String>,
}

/// Why a job is waiting for a person.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffGate {
    /// Challenge screen; the step is retried after resume.
    Challenge,
    /// Explicit confirmation step; passed on resume.
    Confirmation,
}

/// Persisted resume point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Page the job was on.
    pub location: String,
    /// Index into the plan of the next step to execute.
    pub step_index: usize,
    pub progress: Progress,
    pub artifacts: Vec<Artifact>,
    pub saved_at: DateTime<Utc>,
}

/// One self-healing attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubStep {
    pub round: u32,
    pub strategy: RecoveryStrategy,
    pub step_index: usize,
    pub detail: String,
    pub succeeded: bool,
    pub at: DateTime<Utc>,
}

/// Terminal failure with its classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
}

/// A browser job and everything the orchestrator knows about it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserJob {
    pub id: Uuid,
    pub correlation_id: Uuid,
    pub spec: JobSpec,
    pub state: JobState,
    pub progress: Progress,
    pub artifacts: Vec<Artifact>,
    pub error: Option<JobFailure>,
    pub checkpoint: Option<Checkpoint>,
    pub gate: Option<HandoffGate>,
    pub substeps: Vec<SubStep>,
    /// Healing episodes so far; the first one triggers an artifact capture.
    pub retries: u32,
    pub waiting_since: Option<DateTime<Utc>>,
    pub resume_note: Option<String>,
    pub transitions: Vec<StateTransition>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BrowserJob {
    pub fn new(spec: JobSpec) -> Self {
        let id = Uuid::new_v4();
        let now = Utc::now();
        Self {
            id,
            correlation_id: spec.correlation_id.unwrap_or(id),
            progress: Progress {
                steps_total: spec.steps.len() + 1,
                ..Default::default()
            },
            spec,
            state: JobState::Queued,
            artifacts: Vec::new(),
            error: None,
            checkpoint: None,
            gate: None,
            substeps: Vec::new(),
            retries: 0,
            waiting_since: None,
            resume_note: None,
            transitions: Vec::new(),
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Transition to a new state.
    pub fn transition_to(
        &mut self,
        new_state: JobState,
        reason: Option<String>,
    ) -> Result<(), JobError> {
        if !self.state.can_transition_to(new_state) {
            return Err(JobError::InvalidTransition {
                id: self.id,
                state: self.state.to_string(),
                target: new_state.to_string(),
            });
        }

        let now = Utc::now();
        self.transitions.push(StateTransition {
            from: self.state,
            to: new_state,
            timestamp: now,
            reason,
        });
        if self.transitions.len() > MAX_TRANSITIONS {
            let drain_count = self.transitions.len() - MAX_TRANSITIONS;
            self.transitions.drain(..drain_count);
        }

        self.state = new_state;
        self.updated_at = now;

        match new_state {
            JobState::WaitingForHuman => self.waiting_since = Some(now),
            JobState::Resumed => self.waiting_since = None,
            s if s.is_terminal() => {
                self.finished_at = Some(now);
                self.waiting_since = None;
            }
            _ => {}
        }
        Ok(())
    }

    pub fn record_substep(&mut self, substep: SubStep) {
        self.substeps.push(substep);
        if self.substeps.len() > MAX_SUBSTEPS {
            let drain_count = self.substeps.len() - MAX_SUBSTEPS;
            self.substeps.drain(..drain_count);
        }
    }

    /// Whether a human handoff has outlived `ttl` at `now`.
    pub fn handoff_expired(&self, ttl: chrono::Duration, now: DateTime<Utc>) -> bool {
        self.state == JobState::WaitingForHuman
            && self.waiting_since.is_some_and(|since| since + ttl <= now)
    }

    /// Wall-clock time from creation to completion (or now).
    pub fn elapsed(&self) -> Duration {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        let duration = end.signed_duration_since(self.created_at);
        Duration::from_secs(duration.num_seconds().max(0) as u64)
    }

    pub fn status(&self) -> JobStatus {
        JobStatus {
            id: self.id,
            state: self.state,
            progress: self.progress.clone(),
            artifacts: self.artifacts.clone(),
            error: self.error.clone(),
            substeps: self.substeps.clone(),
            waiting_since: self.waiting_since,
        }
    }
}

/// Externally visible job status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub id: Uuid,
    pub state: JobState,
    pub progress: Progress,
    pub artifacts: Vec<Artifact>,
    pub error: Option<JobFailure>,
    pub substeps: Vec<SubStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waiting_since: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [JobState; 8] = [
        JobState::Queued,
        JobState::Dispatched,
        JobState::Running,
        JobState::WaitingForHuman,
        JobState::Resumed,
        JobState::Succeeded,
        JobState::Failed,
        JobState::Cancelled,
    ];

    #[test]
    fn state_transitions_valid() {
        assert!(JobState::Queued.can_transition_to(JobState::Dispatched));
        assert!(JobState::Dispatched.can_transition_to(JobState::Running));
        assert!(JobState::Running.can_transition_to(JobState::Succeeded));
        assert!(JobState::Running.can_transition_to(JobState::WaitingForHuman));
        assert!(JobState::WaitingForHuman.can_transition_to(JobState::Resumed));
        assert!(JobState::Resumed.can_transition_to(JobState::Running));
    }

    #[test]
    fn state_transitions_invalid() {
        assert!(!JobState::Queued.can_transition_to(JobState::Running));
        assert!(!JobState::WaitingForHuman.can_transition_to(JobState::Running));
        assert!(!JobState::Succeeded.can_transition_to(JobState::Running));
        assert!(!JobState::Failed.can_transition_to(JobState::Queued));
    }

    #[test]
    fn failures_before_any_step_skip_running() {
        assert!(JobState::Dispatched.can_transition_to(JobState::Failed));
        assert!(JobState::Resumed.can_transition_to(JobState::Failed));
        assert!(!JobState::Queued.can_transition_to(JobState::Failed));
        assert!(!JobState::WaitingForHuman.can_transition_to(JobState::Failed));
    }

    #[test]
    fn cancel_allowed_from_every_non_terminal_state() {
        for state in ALL {
            assert_eq!(
                state.can_transition_to(JobState::Cancelled),
                !state.is_terminal(),
                "{state}"
            );
        }
    }

    #[test]
    fn terminal_states_are_final() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn job_transitions_track_timestamps() {
        let mut job = BrowserJob::new(JobSpec::new("https://example.com"));
        job.transition_to(JobState::Dispatched, None).unwrap();
        job.transition_to(JobState::Running, None).unwrap();
        job.transition_to(JobState::WaitingForHuman, Some("captcha".into()))
            .unwrap();
        assert!(job.waiting_since.is_some());
        job.transition_to(JobState::Cancelled, None).unwrap();
        assert!(job.waiting_since.is_none());
        assert!(job.finished_at.is_some());
        assert!(job.transition_to(JobState::Running, None).is_err());
        assert_eq!(job.transitions.len(), 4);
    }

    #[test]
    fn transition_history_capped() {
        let mut job = BrowserJob::new(JobSpec::new("https://example.com"));
        job.transition_to(JobState::Dispatched, None).unwrap();
        job.transition_to(JobState::Running, None).unwrap();
        for _ in 0..150 {
            job.transition_to(JobState::WaitingForHuman, None).unwrap();
            job.transition_to(JobState::Resumed, None).unwrap();
            job.transition_to(JobState::Running, None).unwrap();
        }
        assert!(job.transitions.len() <= MAX_TRANSITIONS);
    }

    #[test]
    fn handoff_expiry_uses_waiting_since() {
        let mut job = BrowserJob::new(JobSpec::new("https://example.com"));
        job.transition_to(JobState::Dispatched, None).unwrap();
        job.transition_to(JobState::Running, None).unwrap();
        job.transition_to(JobState::WaitingForHuman, None).unwrap();
        let since = job.waiting_since.unwrap();
        let ttl = chrono::Duration::minutes(10);
        assert!(!job.handoff_expired(ttl, since + chrono::Duration::minutes(9)));
        assert!(job.handoff_expired(ttl, since + ttl));
    }

    #[test]
    fn spec_validation() {
        assert!(JobSpec::new("https://example.com").validate().is_ok());
        assert!(JobSpec::new("ftp://example.com").validate().is_err());
        assert!(JobSpec::new("not a url").validate().is_err());
        assert!(
            JobSpec::new("https://example.com")
                .step(TaskStep::Click {
                    locator: Locator::new("  ")
                })
                .validate()
                .is_err()
        );
    }

    #[test]
    fn plan_starts_with_navigation() {
        let spec = JobSpec::new("https://example.com").step(TaskStep::Extract {
            locator: Locator::new("<h1>(.*?)</h1>"),
            field: "title".into(),
        });
        let plan = spec.plan();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].name(), "navigate");
        assert_eq!(BrowserJob::new(spec).progress.steps_total, 2);
    }

    #[test]
    fn task_step_json_shape() {
        let step: TaskStep = serde_json::from_value(serde_json::json!({
            "action": "extract",
            "locator": {"primary": "<title>(.*?)</title>"},
            "field": "title"
        }))
        .unwrap();
        assert_eq!(step.name(), "extract");
        assert!(step.locator().unwrap().alternates.is_empty());
        assert_eq!(serde_json::to_string(&JobState::WaitingForHuman).unwrap(), "\"WAITING_FOR_HUMAN\"");
    }
}
