//! Semi-automated adapter: prepares the send in a browser job and hands the
//! final click to a person.

use async_trait::async_trait;

use crate::browser::{JobSpec, Orchestrator, TaskStep};
use crate::channels::{ChannelAdapter, Cleared, SendOutcome};
use crate::error::JobError;

/// Adapter for channels without a sending API (e.g. LinkedIn).
///
/// Payload fields: `url` (required), `profile` (optional browser profile),
/// `steps` (optional task steps that prepare the message). A confirmation
/// gate is always appended so the job pauses before anything is sent.
pub struct BrowserSendAdapter {
    channel: String,
    orchestrator: Orchestrator,
}

impl BrowserSendAdapter {
    pub fn new(channel: impl Into<String>, orchestrator: Orchestrator) -> Self {
        Self {
            channel: channel.into(),
            orchestrator,
        }
    }
}

/// Translate an approval into the browser job that prepares it.
pub(crate) fn job_spec_for(cleared: &Cleared) -> Result<JobSpec, String> {
    let approval = cleared.approval();
    let url = cleared
        .payload_str("url")
        .ok_or_else(|| "payload has no url".to_string())?;

    let mut spec = JobSpec::new(url);
    if let Some(profile) = cleared.payload_str("profile") {
        spec = spec.with_profile(profile);
    }
    if let Some(steps) = approval.payload.get("steps") {
        spec.steps = serde_json::from_value(steps.clone())
            .map_err(|e| format!("invalid steps: {e}"))?;
    }
    spec.steps.push(TaskStep::HumanGate {
        prompt: format!("Confirm send to {} on {}", approval.target, approval.channel),
    });
    spec.correlation_id = Some(approval.id);
    spec.approval_id = Some(approval.id);
    Ok(spec)
}

#[async_trait]
impl ChannelAdapter for BrowserSendAdapter {
    fn name(&self) -> &str {
        &self.channel
    }

    async fn send(&self, cleared: &Cleared) -> SendOutcome {
        let spec = match job_spec_for(cleared) {
            Ok(spec) => spec,
            Err(reason) => return SendOutcome::FatalError(reason),
        };

        match self.orchestrator.submit(spec).await {
            Ok(job_id) => {
                tracing::info!(
                    approval_id = %cleared.approval().id,
                    job_id = %job_id,
                    channel = %self.channel,
                    "Semi-automated send opened"
                );
                SendOutcome::NeedsManualOpen(job_id)
            }
            Err(JobError::InvalidSpec { reason }) => SendOutcome::FatalError(reason),
            Err(e) => SendOutcome::RetryableError(e.to_string()),
        }
    }
}
