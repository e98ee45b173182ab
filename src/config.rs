//! Configuration types.
//!
//! Every numeric constant that shapes retry, policy, or orchestration
//! behaviour lives here and is supplied externally (environment or a
//! deserialized config document). Logic never hard-codes them.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConfigError;

/// Complete configuration for a dispatch deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub router: RouterConfig,
    pub retry: RetryConfig,
    pub policy: PolicyConfig,
    pub orchestrator: OrchestratorConfig,
    pub api: ApiConfig,
}

impl DispatchConfig {
    /// Build the full configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            router: RouterConfig::from_env(),
            retry: RetryConfig::from_env(),
            policy: PolicyConfig::from_env()?,
            orchestrator: OrchestratorConfig::from_env(),
            api: ApiConfig::from_env(),
        })
    }

    /// Parse a JSON configuration document.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

/// Router batch behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Identity written into claim leases.
    pub claimant: String,
    /// Items processed in parallel within one invocation.
    pub batch_concurrency: usize,
    /// Default batch size when the trigger does not supply one.
    pub default_batch: usize,
    /// How long a claim lease is honoured before another invocation may take over.
    pub claim_lease_secs: u64,
    /// Deadline for a single adapter send.
    pub send_timeout_secs: u64,
    /// Optional cron expression for an in-process drain ticker.
    pub drain_cron: Option<String>,
    /// Terminal approvals older than this are flagged archived.
    pub archive_after_days: u32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            claimant: format!("router-{}", Uuid::new_v4()),
            batch_concurrency: 4,
            default_batch: 50,
            claim_lease_secs: 300,
            send_timeout_secs: 30,
            drain_cron: None,
            archive_after_days: 30,
        }
    }
}

impl RouterConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            claimant: std::env::var("DISPATCH_CLAIMANT").unwrap_or(defaults.claimant),
            batch_concurrency: env_parse("DISPATCH_BATCH_CONCURRENCY", defaults.batch_concurrency),
            default_batch: env_parse("DISPATCH_DEFAULT_BATCH", defaults.default_batch),
            claim_lease_secs: env_parse("DISPATCH_CLAIM_LEASE_SECS", defaults.claim_lease_secs),
            send_timeout_secs: env_parse("DISPATCH_SEND_TIMEOUT_SECS", defaults.send_timeout_secs),
            drain_cron: std::env::var("DISPATCH_DRAIN_CRON").ok(),
            archive_after_days: env_parse("DISPATCH_ARCHIVE_AFTER_DAYS", defaults.archive_after_days),
        }
    }

    pub fn claim_lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.claim_lease_secs as i64)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }
}

/// Retry and backoff for retryable channel failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts after which a retryable failure is dead-lettered.
    pub max_attempts: u32,
    pub base_secs: u64,
    pub factor: f64,
    pub cap_secs: u64,
    /// Symmetric jitter, as a percentage of the computed delay.
    pub jitter_pct: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_secs: 60,
            factor: 2.0,
            cap_secs: 3600,
            jitter_pct: 10.0,
        }
    }
}

impl RetryConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_attempts: env_parse("DISPATCH_MAX_ATTEMPTS", defaults.max_attempts),
            base_secs: env_parse("DISPATCH_BACKOFF_BASE_SECS", defaults.base_secs),
            factor: env_parse("DISPATCH_BACKOFF_FACTOR", defaults.factor),
            cap_secs: env_parse("DISPATCH_BACKOFF_CAP_SECS", defaults.cap_secs),
            jitter_pct: env_parse("DISPATCH_BACKOFF_JITTER_PCT", defaults.jitter_pct),
        }
    }
}

/// Raw send-window option: `{start, end, timezone}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendWindowConfig {
    /// `HH:MM` local time.
    pub start: String,
    /// `HH:MM` local time.
    pub end: String,
    /// `UTC` or a fixed offset such as `+02:00`.
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

/// Raw policy options as recognized by the policy engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub send_window: Option<SendWindowConfig>,
    /// Channel name to daily cap.
    pub daily_cap: HashMap<String, u32>,
    /// Channel name to hourly cap.
    pub hourly_cap: HashMap<String, u32>,
}

impl PolicyConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let send_window = match std::env::var("DISPATCH_SEND_WINDOW") {
            Ok(raw) => {
                let (start, end) = raw.split_once('-').ok_or_else(|| ConfigError::InvalidValue {
                    key: "DISPATCH_SEND_WINDOW".into(),
                    message: format!("expected HH:MM-HH:MM, got {raw:?}"),
                })?;
                Some(SendWindowConfig {
                    start: start.trim().to_string(),
                    end: end.trim().to_string(),
                    timezone: std::env::var("DISPATCH_SEND_TZ").unwrap_or_else(|_| default_timezone()),
                })
            }
            Err(_) => None,
        };

        Ok(Self {
            send_window,
            daily_cap: parse_caps("DISPATCH_DAILY_CAPS")?,
            hourly_cap: parse_caps("DISPATCH_HOURLY_CAPS")?,
        })
    }
}

/// Parse `email=200,telegram=50` from an environment variable.
fn parse_caps(key: &str) -> Result<HashMap<String, u32>, ConfigError> {
    let raw = std::env::var(key).unwrap_or_default();
    parse_cap_list(key, &raw)
}

pub(crate) fn parse_cap_list(key: &str, raw: &str) -> Result<HashMap<String, u32>, ConfigError> {
    let mut caps = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (channel, value) = pair.split_once('=').ok_or_else(|| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected channel=cap, got {pair:?}"),
        })?;
        let cap = value.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("cap for {channel} is not a number: {value:?}"),
        })?;
        caps.insert(channel.trim().to_string(), cap);
    }
    Ok(caps)
}

/// Browser job orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Worker pool size; each worker holds one browser context.
    pub max_workers: usize,
    /// Concurrent contexts allowed per browser profile.
    pub tabs_per_profile: usize,
    /// Self-healing rounds before a step failure is surfaced.
    pub recovery_rounds: u32,
    /// How long a job may wait for a human before it is cancelled.
    pub handoff_ttl_secs: u64,
    pub step_timeout_secs: u64,
    pub nav_timeout_secs: u64,
    /// Terminal jobs older than this are evicted from the live table.
    pub retention_secs: u64,
    /// Interval of the handoff TTL sweeper.
    pub sweep_interval_secs: u64,
    /// Channels delivered through a browser job instead of a direct API.
    pub channels: Vec<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            tabs_per_profile: 1,
            recovery_rounds: 3,
            handoff_ttl_secs: 24 * 3600,
            step_timeout_secs: 30,
            nav_timeout_secs: 45,
            retention_secs: 7 * 24 * 3600,
            sweep_interval_secs: 30,
            channels: Vec::new(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_workers: env_parse("BROWSER_MAX_WORKERS", defaults.max_workers),
            tabs_per_profile: env_parse("BROWSER_TABS_PER_PROFILE", defaults.tabs_per_profile),
            recovery_rounds: env_parse("BROWSER_RECOVERY_ROUNDS", defaults.recovery_rounds),
            handoff_ttl_secs: env_parse("BROWSER_HANDOFF_TTL_SECS", defaults.handoff_ttl_secs),
            step_timeout_secs: env_parse("BROWSER_STEP_TIMEOUT_SECS", defaults.step_timeout_secs),
            nav_timeout_secs: env_parse("BROWSER_NAV_TIMEOUT_SECS", defaults.nav_timeout_secs),
            retention_secs: env_parse("BROWSER_RETENTION_SECS", defaults.retention_secs),
            sweep_interval_secs: env_parse("BROWSER_SWEEP_INTERVAL_SECS", defaults.sweep_interval_secs),
            channels: std::env::var("BROWSER_CHANNELS")
                .map(|raw| {
                    raw.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or(defaults.channels),
        }
    }

    pub fn handoff_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.handoff_ttl_secs as i64)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn nav_timeout(&self) -> Duration {
        Duration::from_secs(self.nav_timeout_secs)
    }
}

/// Control surface and storage location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub port: u16,
    pub db_path: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: 8088,
            db_path: "./data/dispatch.db".to_string(),
        }
    }
}

impl ApiConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env_parse("DISPATCH_API_PORT", defaults.port),
            db_path: std::env::var("DISPATCH_DB_PATH").unwrap_or(defaults.db_path),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_list_parses_pairs() {
        let caps = parse_cap_list("K", "email=200, telegram = 50").unwrap();
        assert_eq!(caps.get("email"), Some(&200));
        assert_eq!(caps.get("telegram"), Some(&50));
    }

    #[test]
    fn cap_list_rejects_garbage() {
        assert!(parse_cap_list("K", "email").is_err());
        assert!(parse_cap_list("K", "email=lots").is_err());
        assert!(parse_cap_list("K", "").unwrap().is_empty());
    }

    #[test]
    fn json_config_fills_defaults() {
        let cfg = DispatchConfig::from_json(
            r#"{
                "policy": {
                    "send_window": {"start": "09:00", "end": "17:00", "timezone": "+02:00"},
                    "daily_cap": {"email": 100}
                },
                "retry": {"max_attempts": 3}
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.retry.base_secs, 60);
        assert_eq!(cfg.policy.daily_cap.get("email"), Some(&100));
        let window = cfg.policy.send_window.unwrap();
        assert_eq!(window.timezone, "+02:00");
        assert_eq!(cfg.orchestrator.recovery_rounds, 3);
    }

    #[test]
    fn defaults_are_sane() {
        let cfg = DispatchConfig::default();
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.orchestrator.tabs_per_profile, 1);
        assert!(cfg.router.claimant.starts_with("router-"));
        assert_eq!(cfg.orchestrator.handoff_ttl(), chrono::Duration::hours(24));
    }
}
