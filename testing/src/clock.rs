//! Deterministic clocks.

use checkout_core::environment::Clock;
use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex, PoisonError};

/// Clock that always returns the same instant.
///
/// # Example
///
/// ```
/// use checkout_testing::FixedClock;
/// use checkout_core::environment::Clock;
/// use chrono::Utc;
///
/// let clock = FixedClock::new(Utc::now());
/// assert_eq!(clock.now(), clock.now());
/// ```
#[derive(Debug, Clone, Copy)]
pub struct FixedClock {
    time: DateTime<Utc>,
}

impl FixedClock {
    /// Clock pinned at `time`.
    #[must_use]
    pub const fn new(time: DateTime<Utc>) -> Self {
        Self { time }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.time
    }
}

/// Clock that tests move forward explicitly.
///
/// Clones share the same time, so a test can keep one handle and give
/// another to the services under test.
#[derive(Debug, Clone)]
pub struct MockClock {
    time: Arc<Mutex<DateTime<Utc>>>,
}

impl MockClock {
    /// Clock starting at `time`.
    #[must_use]
    pub fn new(time: DateTime<Utc>) -> Self {
        Self {
            time: Arc::new(Mutex::new(time)),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
        *time += by;
    }

    /// Sets the clock.
    pub fn set(&self, to: DateTime<Utc>) {
        *self.time.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.time.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// 2025-01-01 00:00:00 UTC.
#[must_use]
pub fn epoch() -> DateTime<Utc> {
    DateTime::from_timestamp(1_735_689_600, 0).unwrap_or_default()
}

/// Fixed clock at [`epoch`].
#[must_use]
pub fn test_clock() -> FixedClock {
    FixedClock::new(epoch())
}

/// Movable clock starting at [`epoch`].
#[must_use]
pub fn mock_clock() -> MockClock {
    MockClock::new(epoch())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_is_fixed() {
        let clock = test_clock();
        assert_eq!(clock.now(), clock.now());
        assert_eq!(clock.now().to_rfc3339(), "2025-01-01T00:00:00+00:00");
    }

    #[test]
    fn mock_clock_clones_share_time() {
        let clock = mock_clock();
        let handle = clock.clone();

        handle.advance(Duration::minutes(16));

        assert_eq!(clock.now(), epoch() + Duration::minutes(16));
    }
}
