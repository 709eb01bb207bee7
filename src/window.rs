use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use chrono_tz::Tz;
use thiserror::Error;

const SECS_PER_HOUR: i64 = 3600;
const KEY_FORMAT: &str = "%Y-%m-%dT%H:%MZ";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum WindowParseError {
    #[error("Invalid window key '{0}', expected YYYY-MM-DDTHH:00Z")]
    Malformed(String),

    #[error("Window key '{0}' is not aligned to the start of an hour")]
    Unaligned(String),
}

/// One hour-long accounting epoch, identified by its UTC start hour.
///
/// Windows are ordered by time and serialize as their canonical key
/// (`2024-01-01T10:00Z`), which also sorts lexicographically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Window {
    hour: i64,
}

impl Window {
    /// The window that contains the given instant.
    pub fn containing(at: DateTime<Utc>) -> Self {
        Self {
            hour: at.timestamp().div_euclid(SECS_PER_HOUR),
        }
    }

    /// Build a window from its hour index (hours since the Unix epoch).
    pub fn from_hour(hour: i64) -> Self {
        Self { hour }
    }

    /// Parse a canonical window key.
    pub fn parse(key: &str) -> Result<Self, WindowParseError> {
        let parsed = NaiveDateTime::parse_from_str(key.trim(), KEY_FORMAT)
            .map_err(|_| WindowParseError::Malformed(key.to_string()))?;
        let at = parsed.and_utc();
        let window = Self::containing(at);
        if window.start() != at {
            return Err(WindowParseError::Unaligned(key.to_string()));
        }
        Ok(window)
    }

    pub fn hour_index(&self) -> i64 {
        self.hour
    }

    pub fn start(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.hour * SECS_PER_HOUR, 0).unwrap_or_default()
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.next().start()
    }

    pub fn next(&self) -> Self {
        Self {
            hour: self.hour + 1,
        }
    }

    /// Canonical sortable identifier.
    pub fn key(&self) -> String {
        self.start().format(KEY_FORMAT).to_string()
    }

    /// Human-readable rendering of the hour in the given timezone,
    /// e.g. `2024-01-01 10:00-11:00 UTC`.
    pub fn label(&self, tz: &Tz) -> String {
        let start = self.start().with_timezone(tz);
        let end = self.end().with_timezone(tz);
        format!(
            "{}-{} {}",
            start.format("%Y-%m-%d %H:%M"),
            end.format("%H:%M"),
            start.format("%Z")
        )
    }

    pub fn is_current(&self, now: DateTime<Utc>) -> bool {
        *self == Self::containing(now)
    }

    /// Time elapsed since the window started, as seen from `now`.
    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        now - self.start()
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl serde::Serialize for Window {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.key())
    }
}

impl<'de> serde::Deserialize<'de> for Window {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let key = String::deserialize(deserializer)?;
        Window::parse(&key).map_err(serde::de::Error::custom)
    }
}

/// Source of wall-clock time for window derivation.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn current_window(&self) -> Window {
        Window::containing(self.now())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. Used to exercise window rollover.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(at.timestamp_millis()),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        self.millis.store(at.timestamp_millis(), Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.millis
            .fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst)).unwrap_or_default()
    }
}

/// In-process cache of the current window, invalidated when the hour changes.
pub struct CurrentWindowCache {
    hour: AtomicI64,
}

impl CurrentWindowCache {
    pub fn new(window: Window) -> Self {
        Self {
            hour: AtomicI64::new(window.hour),
        }
    }

    /// Compare the cached window against `observed`.
    ///
    /// Returns the previously cached window when the hour has moved on and
    /// this caller won the swap; every other caller sees `None`.
    pub fn observe(&self, observed: Window) -> Option<Window> {
        let stored = self.hour.load(Ordering::Acquire);
        if stored == observed.hour {
            return None;
        }
        self.hour
            .compare_exchange(stored, observed.hour, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(Window::from_hour)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, s).unwrap()
    }

    #[test]
    fn test_window_truncates_to_hour() {
        let window = Window::containing(at(2024, 1, 1, 10, 42, 17));
        assert_eq!(window.start(), at(2024, 1, 1, 10, 0, 0));
        assert_eq!(window.end(), at(2024, 1, 1, 11, 0, 0));
        assert_eq!(window.key(), "2024-01-01T10:00Z");
    }

    #[test]
    fn test_window_parse_round_trips_key() {
        let window = Window::parse("2024-01-01T10:00Z").unwrap();
        assert_eq!(window, Window::containing(at(2024, 1, 1, 10, 59, 59)));
        assert_eq!(window.to_string(), "2024-01-01T10:00Z");
    }

    #[test]
    fn test_window_parse_rejects_bad_keys() {
        assert!(matches!(
            Window::parse("yesterday"),
            Err(WindowParseError::Malformed(_))
        ));
        assert!(matches!(
            Window::parse("2024-01-01T10:30Z"),
            Err(WindowParseError::Unaligned(_))
        ));
    }

    #[test]
    fn test_window_keys_sort_like_windows() {
        let a = Window::containing(at(2024, 1, 1, 9, 0, 0));
        let b = Window::containing(at(2024, 1, 1, 10, 0, 0));
        assert!(a < b);
        assert!(a.key() < b.key());
        assert_eq!(a.next(), b);
    }

    #[test]
    fn test_window_label_utc() {
        let window = Window::containing(at(2024, 1, 1, 10, 5, 0));
        assert_eq!(window.label(&chrono_tz::UTC), "2024-01-01 10:00-11:00 UTC");
    }

    #[test]
    fn test_is_current() {
        let window = Window::containing(at(2024, 1, 1, 10, 0, 0));
        assert!(window.is_current(at(2024, 1, 1, 10, 59, 59)));
        assert!(!window.is_current(at(2024, 1, 1, 11, 0, 0)));
    }

    #[test]
    fn test_manual_clock_advances_windows() {
        let clock = ManualClock::new(at(2024, 1, 1, 10, 59, 0));
        let first = clock.current_window();
        clock.advance(Duration::minutes(2));
        assert_eq!(clock.current_window(), first.next());
    }

    #[test]
    fn test_window_cache_reports_rollover_once() {
        let w10 = Window::containing(at(2024, 1, 1, 10, 0, 0));
        let cache = CurrentWindowCache::new(w10);
        assert_eq!(cache.observe(w10), None);
        assert_eq!(cache.observe(w10.next()), Some(w10));
        assert_eq!(cache.observe(w10.next()), None);
        assert_eq!(cache.observe(w10.next().next()), Some(w10.next()));
    }

    #[test]
    fn test_window_serializes_as_key() {
        let window = Window::containing(at(2024, 1, 1, 10, 0, 0));
        let json = serde_json::to_string(&window).unwrap();
        assert_eq!(json, "\"2024-01-01T10:00Z\"");
        let back: Window = serde_json::from_str(&json).unwrap();
        assert_eq!(back, window);
    }
}
