use std::time::Duration;

/// Rows untouched for longer than this are treated as absent.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Time-based expiry policy shared by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention(Option<Duration>);

impl Default for Retention {
    fn default() -> Self {
        Self(Some(DEFAULT_RETENTION))
    }
}

impl Retention {
    pub const fn new(window: Duration) -> Self {
        Self(Some(window))
    }

    pub const fn disabled() -> Self {
        Self(None)
    }

    pub const fn window(&self) -> Option<Duration> {
        self.0
    }

    /// Oldest timestamp (unix millis) that still counts as live at `now_ms`.
    pub fn cutoff_ms(&self, now_ms: i64) -> i64 {
        match self.0 {
            Some(window) => {
                let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
                now_ms.saturating_sub(window_ms)
            }
            None => i64::MIN,
        }
    }

    pub fn is_expired(&self, timestamp_ms: i64, now_ms: i64) -> bool {
        timestamp_ms < self.cutoff_ms(now_ms)
    }
}

impl From<Option<Duration>> for Retention {
    fn from(window: Option<Duration>) -> Self {
        Self(window)
    }
}

/// Current time as unix milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
