//! Rate-limit counters: per (channel, window) send counts.
//!
//! The policy engine reads a [`RateSnapshot`]; the router then commits the
//! send with [`RateLimitCounter::try_acquire`], an atomic check-and-increment
//! so concurrent routers cannot jointly breach a cap.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::StoreError;

/// Which cap window a limit applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateWindow {
    Hourly,
    Daily,
}

impl std::fmt::Display for RateWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hourly => write!(f, "hourly"),
            Self::Daily => write!(f, "daily"),
        }
    }
}

/// Bucket keys for the windows containing a given instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowKeys {
    pub hourly: String,
    pub daily: String,
}

impl WindowKeys {
    /// Buckets are aligned to local time at `offset`.
    pub fn at(now: DateTime<Utc>, offset: FixedOffset) -> Self {
        let local = now.with_timezone(&offset);
        Self {
            hourly: format!("h:{}", local.format("%Y-%m-%dT%H")),
            daily: format!("d:{}", local.format("%Y-%m-%d")),
        }
    }
}

/// Counts observed for a channel at evaluation time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateSnapshot {
    pub hourly: u32,
    pub daily: u32,
}

/// Configured caps for one channel. `None` means uncapped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelCaps {
    pub hourly: Option<u32>,
    pub daily: Option<u32>,
}

impl ChannelCaps {
    /// The first window whose cap is already reached by `snapshot`.
    pub fn exceeded(&self, snapshot: &RateSnapshot) -> Option<RateWindow> {
        if self.hourly.is_some_and(|cap| snapshot.hourly >= cap) {
            Some(RateWindow::Hourly)
        } else if self.daily.is_some_and(|cap| snapshot.daily >= cap) {
            Some(RateWindow::Daily)
        } else {
            None
        }
    }

    pub fn is_uncapped(&self) -> bool {
        self.hourly.is_none() && self.daily.is_none()
    }
}

/// Shared counter service.
#[async_trait]
pub trait RateLimitCounter: Send + Sync {
    /// Read current counts without modifying them.
    async fn snapshot(&self, channel: &str, keys: &WindowKeys) -> Result<RateSnapshot, StoreError>;

    /// Increment both windows if and only if neither would exceed its cap.
    /// Returns `false` (and changes nothing) when a cap is reached.
    async fn try_acquire(
        &self,
        channel: &str,
        keys: &WindowKeys,
        caps: ChannelCaps,
    ) -> Result<bool, StoreError>;
}

/// In-process counter: a mutex-guarded map.
#[derive(Default)]
pub struct InMemoryRateCounter {
    counts: Mutex<HashMap<(String, String), u32>>,
}

impl InMemoryRateCounter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitCounter for InMemoryRateCounter {
    async fn snapshot(&self, channel: &str, keys: &WindowKeys) -> Result<RateSnapshot, StoreError> {
        let counts = self.counts.lock().await;
        let get = |key: &str| {
            counts
                .get(&(channel.to_string(), key.to_string()))
                .copied()
                .unwrap_or(0)
        };
        Ok(RateSnapshot {
            hourly: get(&keys.hourly),
            daily: get(&keys.daily),
        })
    }

    async fn try_acquire(
        &self,
        channel: &str,
        keys: &WindowKeys,
        caps: ChannelCaps,
    ) -> Result<bool, StoreError> {
        let mut counts = self.counts.lock().await;
        let hourly_key = (channel.to_string(), keys.hourly.clone());
        let daily_key = (channel.to_string(), keys.daily.clone());
        let current = RateSnapshot {
            hourly: counts.get(&hourly_key).copied().unwrap_or(0),
            daily: counts.get(&daily_key).copied().unwrap_or(0),
        };
        if caps.exceeded(&current).is_some() {
            return Ok(false);
        }
        *counts.entry(hourly_key).or_insert(0) += 1;
        *counts.entry(daily_key).or_insert(0) += 1;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use chrono::TimeZone;

    fn keys() -> WindowKeys {
        WindowKeys::at(
            Utc.with_ymd_and_hms(2026, 5, 1, 10, 15, 0).unwrap(),
            FixedOffset::east_opt(0).unwrap(),
        )
    }

    #[test]
    fn keys_follow_local_offset() {
        let now = Utc.with_ymd_and_hms(2026, 5, 1, 23, 30, 0).unwrap();
        let k = WindowKeys::at(now, FixedOffset::east_opt(3600).unwrap());
        assert_eq!(k.daily, "d:2026-05-02");
        assert_eq!(k.hourly, "h:2026-05-02T00");
    }

    #[test]
    fn exceeded_reports_hourly_first() {
        let caps = ChannelCaps {
            hourly: Some(2),
            daily: Some(2),
        };
        assert_eq!(caps.exceeded(&RateSnapshot { hourly: 2, daily: 2 }), Some(RateWindow::Hourly));
        assert_eq!(caps.exceeded(&RateSnapshot { hourly: 1, daily: 2 }), Some(RateWindow::Daily));
        assert_eq!(caps.exceeded(&RateSnapshot { hourly: 1, daily: 1 }), None);
        assert!(ChannelCaps::default().is_uncapped());
    }

    #[tokio::test]
    async fn acquire_stops_at_cap() {
        let counter = InMemoryRateCounter::new();
        let caps = ChannelCaps {
            hourly: None,
            daily: Some(2),
        };
        assert!(counter.try_acquire("email", &keys(), caps).await.unwrap());
        assert!(counter.try_acquire("email", &keys(), caps).await.unwrap());
        assert!(!counter.try_acquire("email", &keys(), caps).await.unwrap());
        assert_eq!(
            counter.snapshot("email", &keys()).await.unwrap(),
            RateSnapshot { hourly: 2, daily: 2 }
        );
        // Other channels are independent.
        assert!(counter.try_acquire("telegram", &keys(), caps).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_acquires_never_breach_cap() {
        let counter = Arc::new(InMemoryRateCounter::new());
        let caps = ChannelCaps {
            hourly: Some(10),
            daily: None,
        };
        let mut handles = Vec::new();
        for _ in 0..50 {
            let counter = Arc::clone(&counter);
            handles.push(tokio::spawn(async move {
                counter.try_acquire("email", &keys(), caps).await.unwrap()
            }));
        }
        let mut granted = 0;
        for h in handles {
            if h.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 10);
    }
}
