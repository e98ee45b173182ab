//! Approval data model: outbound intents, their statuses, and patches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of an approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Drafted, awaiting human review.
    Pending,
    /// Signed off by a human; eligible for dispatch (also used while a retry is scheduled).
    Approved,
    /// Rejected by a human.
    Rejected,
    /// Delivered by a direct channel.
    Sent,
    /// Terminally failed (policy denial, fatal error, or dead letter).
    Failed,
    /// Handed to a semi-automated browser job; awaiting manual confirmation.
    ApprovedOpened,
    /// Manually confirmed as sent.
    SentManual,
}

impl ApprovalStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: ApprovalStatus) -> bool {
        use ApprovalStatus::*;

        matches!(
            (self, target),
            (Pending, Approved) | (Pending, Rejected) |
            (Approved, Sent) | (Approved, Failed) | (Approved, ApprovedOpened) |
            (ApprovedOpened, SentManual) | (ApprovedOpened, Failed)
        )
    }

    /// Terminal statuses never leave.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Sent | Self::Failed | Self::Rejected | Self::SentManual
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::ApprovedOpened => "approved_opened",
            Self::SentManual => "sent_manual",
        }
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ApprovalStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            "approved_opened" => Ok(Self::ApprovedOpened),
            "sent_manual" => Ok(Self::SentManual),
            _ => Err(format!("Unknown approval status: {}", s)),
        }
    }
}

/// Exclusive processing lease taken by a router invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimLease {
    pub claimant: String,
    pub until: DateTime<Utc>,
}

impl ClaimLease {
    /// A lease blocks other claimants until it expires.
    pub fn blocks(&self, claimant: &str, now: DateTime<Utc>) -> bool {
        self.claimant != claimant && self.until > now
    }
}

/// A unit of outbound intent awaiting or holding human sign-off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub id: Uuid,
    /// Channel name (e.g. "email", "telegram", "linkedin").
    pub channel: String,
    /// Recipient identity on that channel.
    pub target: String,
    /// Channel-specific message content.
    pub payload: serde_json::Value,
    pub status: ApprovalStatus,
    /// Delivery attempts that ended in a retryable failure.
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Optimistic concurrency version; bumped on every write.
    pub version: u64,
    /// Earliest time a pending retry may be claimed again.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Browser job backing a semi-automated send.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_ref: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<ClaimLease>,
    #[serde(default)]
    pub archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Approval {
    /// Create a new pending approval.
    pub fn new(
        channel: impl Into<String>,
        target: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            channel: channel.into(),
            target: target.into(),
            payload,
            status: ApprovalStatus::Pending,
            attempts: 0,
            last_error: None,
            version: 1,
            next_attempt_at: None,
            job_ref: None,
            lease: None,
            archived: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the status directly (seeding stores and tests).
    pub fn with_status(mut self, status: ApprovalStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Whether a pending retry is due.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.is_none_or(|at| at <= now)
    }

    /// Whether no unexpired lease is held on the record, by anyone.
    pub fn is_unleased(&self, now: DateTime<Utc>) -> bool {
        self.lease.as_ref().is_none_or(|l| l.until <= now)
    }

    /// Whether the record may be claimed by `claimant` right now.
    pub fn is_claimable_by(&self, claimant: &str, now: DateTime<Utc>) -> bool {
        self.status == ApprovalStatus::Approved
            && !self.archived
            && !self.lease.as_ref().is_some_and(|l| l.blocks(claimant, now))
    }

    /// Apply a patch in place. Status edges are validated by the caller.
    pub fn apply(&mut self, patch: &ApprovalPatch, now: DateTime<Utc>) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(attempts) = patch.attempts {
            self.attempts = attempts;
        }
        if let Some(ref last_error) = patch.last_error {
            self.last_error = last_error.clone();
        }
        if let Some(next) = patch.next_attempt_at {
            self.next_attempt_at = next;
        }
        if let Some(job_ref) = patch.job_ref {
            self.job_ref = Some(job_ref);
        }
        if let Some(ref payload) = patch.payload {
            self.payload = payload.clone();
        }
        if patch.release_claim {
            self.lease = None;
        }
        self.version += 1;
        self.updated_at = now;
    }
}

/// Partial update applied under an optimistic version check.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApprovalPatch {
    pub status: Option<ApprovalStatus>,
    pub attempts: Option<u32>,
    pub last_error: Option<Option<String>>,
    pub next_attempt_at: Option<Option<DateTime<Utc>>>,
    pub job_ref: Option<Uuid>,
    pub payload: Option<serde_json::Value>,
    /// Drop the claim lease as part of this write.
    pub release_claim: bool,
}

impl ApprovalPatch {
    pub fn status(status: ApprovalStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(Some(error.into()));
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_next_attempt_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.next_attempt_at = Some(at);
        self
    }

    pub fn with_job_ref(mut self, job_ref: Uuid) -> Self {
        self.job_ref = Some(job_ref);
        self
    }

    pub fn releasing_claim(mut self) -> Self {
        self.release_claim = true;
        self
    }
}
