//! Send window: local-time interval during which sends are permitted.
//!
//! The timezone is either an IANA zone name, whose offset follows daylight
//! saving, or a fixed `UTC`/`±HH:MM` offset.

use chrono::{DateTime, FixedOffset, NaiveTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;

use crate::config::SendWindowConfig;
use crate::error::ConfigError;

/// Timezone a send window and its rate buckets are evaluated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowZone {
    Fixed(FixedOffset),
    Named(Tz),
}

impl WindowZone {
    /// Parse an IANA name (`America/New_York`) or a fixed offset.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let tz = raw.trim();
        if let Ok(offset) = parse_offset(tz) {
            return Ok(Self::Fixed(offset));
        }
        tz.parse::<Tz>()
            .map(Self::Named)
            .map_err(|_| ConfigError::InvalidValue {
                key: "send_window.timezone".to_string(),
                message: format!("unknown timezone {raw:?}; use a zone name like Europe/Paris, UTC, or +02:00"),
            })
    }

    /// UTC offset in effect at `now`.
    pub fn offset_at(&self, now: DateTime<Utc>) -> FixedOffset {
        match self {
            Self::Fixed(offset) => *offset,
            Self::Named(tz) => tz.offset_from_utc_datetime(&now.naive_utc()).fix(),
        }
    }
}

impl Default for WindowZone {
    fn default() -> Self {
        Self::Fixed(Utc.fix())
    }
}

/// A compiled send window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendWindow {
    start: NaiveTime,
    end: NaiveTime,
    zone: WindowZone,
}

impl SendWindow {
    pub fn new(start: NaiveTime, end: NaiveTime, zone: WindowZone) -> Self {
        Self { start, end, zone }
    }

    /// Compile the raw `{start, end, timezone}` option.
    pub fn parse(config: &SendWindowConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            start: parse_time("send_window.start", &config.start)?,
            end: parse_time("send_window.end", &config.end)?,
            zone: WindowZone::parse(&config.timezone)?,
        })
    }

    pub fn zone(&self) -> WindowZone {
        self.zone
    }

    /// Whether `now` falls inside the window.
    ///
    /// `start == end` means open all day; `start > end` wraps past midnight.
    /// The start is inclusive and the end exclusive.
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.zone.offset_at(now)).time();
        if self.start == self.end {
            true
        } else if self.start < self.end {
            local >= self.start && local < self.end
        } else {
            local >= self.start || local < self.end
        }
    }
}

fn parse_time(key: &str, raw: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw.trim(), "%H:%M:%S"))
        .map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        })
}

/// Parse `UTC`, `Z`, `+02:00`, `-0530` into a fixed offset.
pub fn parse_offset(raw: &str) -> Result<FixedOffset, ConfigError> {
    let invalid = || ConfigError::InvalidValue {
        key: "send_window.timezone".to_string(),
        message: format!("unsupported timezone {raw:?}; use UTC or a fixed offset like +02:00"),
    };

    let tz = raw.trim();
    if tz.is_empty() || tz.eq_ignore_ascii_case("utc") || tz == "Z" {
        return FixedOffset::east_opt(0).ok_or_else(invalid);
    }

    let (sign, rest) = match tz.as_bytes().first() {
        Some(b'+') => (1, &tz[1..]),
        Some(b'-') => (-1, &tz[1..]),
        _ => return Err(invalid()),
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let hours: i32 = digits[..2].parse().map_err(|_| invalid())?;
    let minutes: i32 = digits[2..].parse().map_err(|_| invalid())?;
    if hours > 14 || minutes > 59 {
        return Err(invalid());
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn window(start: &str, end: &str, tz: &str) -> SendWindow {
        SendWindow::parse(&SendWindowConfig {
            start: start.into(),
            end: end.into(),
            timezone: tz.into(),
        })
        .unwrap()
    }

    fn utc(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, m, 0).unwrap()
    }

    #[test]
    fn daytime_window_bounds() {
        let w = window("09:00", "17:00", "UTC");
        assert!(!w.contains(utc(8, 59)));
        assert!(w.contains(utc(9, 0)));
        assert!(w.contains(utc(16, 59)));
        assert!(!w.contains(utc(17, 0)));
    }

    #[test]
    fn overnight_window_wraps() {
        let w = window("22:00", "06:00", "UTC");
        assert!(w.contains(utc(23, 30)));
        assert!(w.contains(utc(2, 0)));
        assert!(!w.contains(utc(12, 0)));
    }

    #[test]
    fn offset_shifts_local_time() {
        // 07:30 UTC is 09:30 at +02:00.
        let w = window("09:00", "17:00", "+02:00");
        assert!(w.contains(utc(7, 30)));
        assert!(!w.contains(utc(15, 30)));
    }

    #[test]
    fn equal_bounds_mean_always_open() {
        let w = window("00:00", "00:00", "UTC");
        assert!(w.contains(utc(3, 0)));
        assert!(w.contains(utc(21, 0)));
    }

    #[test]
    fn offsets_parse() {
        assert_eq!(parse_offset("UTC").unwrap().local_minus_utc(), 0);
        assert_eq!(parse_offset("-0530").unwrap().local_minus_utc(), -(5 * 3600 + 30 * 60));
        assert_eq!(parse_offset("+02:00").unwrap().local_minus_utc(), 7200);
        assert!(parse_offset("Europe/Paris").is_err());
        assert!(parse_offset("+25:00").is_err());
    }

    #[test]
    fn zone_names_and_offsets_parse() {
        assert_eq!(WindowZone::parse("UTC").unwrap(), WindowZone::default());
        assert!(matches!(WindowZone::parse("+02:00").unwrap(), WindowZone::Fixed(_)));
        assert_eq!(
            WindowZone::parse("America/New_York").unwrap(),
            WindowZone::Named(chrono_tz::America::New_York)
        );
        assert!(matches!(
            WindowZone::parse("Mars/Olympus"),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn named_zone_follows_daylight_saving() {
        // New York springs forward on 2026-03-08: 09:00 local is 14:00 UTC
        // the day before and 13:00 UTC the day after.
        let w = window("09:00", "17:00", "America/New_York");
        let before = Utc.with_ymd_and_hms(2026, 3, 7, 13, 30, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2026, 3, 9, 13, 30, 0).unwrap();
        assert!(!w.contains(before));
        assert!(w.contains(after));

        let zone = w.zone();
        assert_eq!(zone.offset_at(before).local_minus_utc(), -5 * 3600);
        assert_eq!(zone.offset_at(after).local_minus_utc(), -4 * 3600);
    }

    #[test]
    fn bad_times_are_config_errors() {
        let err = SendWindow::parse(&SendWindowConfig {
            start: "nine".into(),
            end: "17:00".into(),
            timezone: "UTC".into(),
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
