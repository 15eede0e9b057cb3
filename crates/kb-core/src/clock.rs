//! Monotonic wall-clock source (spec §4.A).
//!
//! Grounded on `agentor-orchestrator/src/engine.rs`, which threads an
//! `Instant`-derived duration through its phases instead of calling
//! `Instant::now()`/`Utc::now()` ad hoc; here the same indirection lets
//! policy and guard tests run against a fixed clock.

use chrono::{DateTime, Utc};

/// Supplies the current time. Production code uses [`SystemClock`]; tests
/// use a fixed or stepped implementation.
pub trait Clock: Send + Sync {
    /// Current UTC time.
    fn now(&self) -> DateTime<Utc>;

    /// Current UTC time as epoch milliseconds, for state records.
    fn now_ms(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

/// Reads time from the OS clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock fixed at construction time, or advanced explicitly by tests.
#[derive(Debug, Clone)]
pub struct FixedClock {
    at: std::sync::Arc<std::sync::Mutex<DateTime<Utc>>>,
}

impl FixedClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            at: std::sync::Arc::new(std::sync::Mutex::new(at)),
        }
    }

    /// Advance the clock by `duration`, returning the new time.
    pub fn advance(&self, duration: chrono::Duration) -> DateTime<Utc> {
        let mut guard = self.at.lock().unwrap_or_else(|p| p.into_inner());
        *guard += duration;
        *guard
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.at.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_advances() {
        let start = "2026-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let clock = FixedClock::new(start);
        assert_eq!(clock.now(), start);
        let next = clock.advance(chrono::Duration::minutes(5));
        assert_eq!(next, start + chrono::Duration::minutes(5));
        assert_eq!(clock.now(), next);
    }
}
