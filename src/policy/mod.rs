//! Policy engine: pure evaluation of suppression, send-window, and rate rules.
//!
//! Check order is fixed: DNC, then send window, then rate cap. The first
//! failing check decides the denial reason.

pub mod counters;
pub mod dnc;
pub mod window;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::approval::Approval;
use crate::config::PolicyConfig;
use crate::error::ConfigError;

pub use counters::{ChannelCaps, InMemoryRateCounter, RateLimitCounter, RateSnapshot, RateWindow, WindowKeys};
pub use dnc::{DncEntry, DncSet, DncSource, StaticDncSource};
pub use window::{SendWindow, WindowZone};

/// Why a send was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DenyReason {
    /// Identity is suppressed on this channel.
    Dnc { detail: String },
    OutOfWindow,
    RateLimited { window: RateWindow },
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dnc { detail } => write!(f, "dnc: {detail}"),
            Self::OutOfWindow => write!(f, "out_of_window"),
            Self::RateLimited { window } => write!(f, "rate_limited ({window})"),
        }
    }
}

/// Outcome of a policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

/// Compiled policy rules.
#[derive(Debug, Clone)]
pub struct PolicyRules {
    window: Option<SendWindow>,
    caps: HashMap<String, ChannelCaps>,
    zone: WindowZone,
}

impl PolicyRules {
    /// Rules with no window and no caps.
    pub fn permissive() -> Self {
        Self {
            window: None,
            caps: HashMap::new(),
            zone: WindowZone::default(),
        }
    }

    pub fn from_config(config: &PolicyConfig) -> Result<Self, ConfigError> {
        let window = config.send_window.as_ref().map(SendWindow::parse).transpose()?;
        let zone = window.as_ref().map(SendWindow::zone).unwrap_or_default();

        let mut caps: HashMap<String, ChannelCaps> = HashMap::new();
        for (channel, cap) in &config.daily_cap {
            caps.entry(channel.clone()).or_default().daily = Some(*cap);
        }
        for (channel, cap) in &config.hourly_cap {
            caps.entry(channel.clone()).or_default().hourly = Some(*cap);
        }

        Ok(Self {
            window,
            caps,
            zone,
        })
    }

    pub fn with_window(mut self, window: SendWindow) -> Self {
        self.zone = window.zone();
        self.window = Some(window);
        self
    }

    pub fn with_caps(mut self, channel: impl Into<String>, caps: ChannelCaps) -> Self {
        self.caps.insert(channel.into(), caps);
        self
    }

    pub fn caps_for(&self, channel: &str) -> ChannelCaps {
        self.caps.get(channel).copied().unwrap_or_default()
    }

    /// Counter buckets containing `now`, aligned to the window's timezone
    /// at the offset in effect at `now`.
    pub fn window_keys(&self, now: DateTime<Utc>) -> WindowKeys {
        WindowKeys::at(now, self.zone.offset_at(now))
    }
}

/// Evaluate whether `approval` may be sent at `now`.
///
/// Pure: no I/O, same inputs give the same decision.
pub fn evaluate(
    approval: &Approval,
    counters: &RateSnapshot,
    dnc: &DncSet,
    rules: &PolicyRules,
    now: DateTime<Utc>,
) -> Decision {
    if let Some(detail) = dnc.matches(&approval.target, &approval.channel) {
        return Decision::Deny(DenyReason::Dnc {
            detail: detail.to_string(),
        });
    }

    if let Some(ref window) = rules.window
        && !window.contains(now)
    {
        return Decision::Deny(DenyReason::OutOfWindow);
    }

    if let Some(window) = rules.caps_for(&approval.channel).exceeded(counters) {
        return Decision::Deny(DenyReason::RateLimited { window });
    }

    Decision::Allow
}
