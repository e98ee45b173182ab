//! Artifact capture policy.
//!
//! Failures and the first healing episode of a job capture a full bundle
//! (trace, screenshot, network log). A successful job keeps only its final
//! screenshot. Capture never aborts a job: each failed capture becomes a
//! warning the orchestrator records as an event.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::driver::BrowserContext;

/// Upper bound on a single capture.
const CAPTURE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Trace,
    Screenshot,
    NetworkLog,
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Trace => "trace",
            Self::Screenshot => "screenshot",
            Self::NetworkLog => "network_log",
        };
        write!(f, "{s}")
    }
}

/// Why an artifact was captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureReason {
    Failure,
    FirstRetry,
    Handoff,
    Cancelled,
    Final,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub reason: CaptureReason,
    /// Driver-provided content or reference (path, base64, text).
    pub content: String,
    pub captured_at: DateTime<Utc>,
}

/// Result of a capture pass.
#[derive(Debug, Default)]
pub struct Captured {
    pub artifacts: Vec<Artifact>,
    pub warnings: Vec<String>,
}

const BUNDLE: [ArtifactKind; 3] = [
    ArtifactKind::Trace,
    ArtifactKind::Screenshot,
    ArtifactKind::NetworkLog,
];

async fn capture_one(
    ctx: &mut dyn BrowserContext,
    kind: ArtifactKind,
    reason: CaptureReason,
    out: &mut Captured,
) {
    match tokio::time::timeout(CAPTURE_TIMEOUT, ctx.capture(kind)).await {
        Ok(Ok(content)) => out.artifacts.push(Artifact {
            kind,
            reason,
            content,
            captured_at: Utc::now(),
        }),
        Ok(Err(e)) => out.warnings.push(format!("{kind} capture failed: {e}")),
        Err(_) => out
            .warnings
            .push(format!("{kind} capture timed out after {CAPTURE_TIMEOUT:?}")),
    }
}

/// Capture trace, screenshot, and network log.
pub async fn capture_bundle(ctx: &mut dyn BrowserContext, reason: CaptureReason) -> Captured {
    let mut out = Captured::default();
    for kind in BUNDLE {
        capture_one(ctx, kind, reason, &mut out).await;
    }
    out
}

/// Capture the final screenshot of a successful job.
pub async fn capture_final(ctx: &mut dyn BrowserContext) -> Captured {
    let mut out = Captured::default();
    capture_one(ctx, ArtifactKind::Screenshot, CaptureReason::Final, &mut out).await;
    out
}

/// Success retention: drop everything except the final screenshot.
pub fn retain_success(artifacts: &mut Vec<Artifact>, finals: Vec<Artifact>) {
    artifacts.clear();
    artifacts.extend(
        finals
            .into_iter()
            .filter(|a| a.kind == ArtifactKind::Screenshot && a.reason == CaptureReason::Final),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(kind: ArtifactKind, reason: CaptureReason) -> Artifact {
        Artifact {
            kind,
            reason,
            content: "x".into(),
            captured_at: Utc::now(),
        }
    }

    #[test]
    fn success_keeps_only_final_screenshot() {
        let mut artifacts = vec![
            artifact(ArtifactKind::Trace, CaptureReason::FirstRetry),
            artifact(ArtifactKind::Screenshot, CaptureReason::FirstRetry),
            artifact(ArtifactKind::NetworkLog, CaptureReason::FirstRetry),
        ];
        retain_success(
            &mut artifacts,
            vec![artifact(ArtifactKind::Screenshot, CaptureReason::Final)],
        );
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].kind, ArtifactKind::Screenshot);
        assert_eq!(artifacts[0].reason, CaptureReason::Final);
    }

    #[test]
    fn success_without_final_screenshot_keeps_nothing() {
        let mut artifacts = vec![artifact(ArtifactKind::Trace, CaptureReason::FirstRetry)];
        retain_success(&mut artifacts, vec![]);
        assert!(artifacts.is_empty());
    }

    #[test]
    fn kind_display() {
        assert_eq!(ArtifactKind::NetworkLog.to_string(), "network_log");
    }
}
