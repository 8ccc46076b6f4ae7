//! Injected dependencies that are not persistence.

use chrono::{DateTime, Utc};

/// Source of the current time.
///
/// Services never call `Utc::now()` directly so tests can pin or advance time.
///
/// # Examples
///
/// ```
/// use checkout_core::environment::{Clock, SystemClock};
///
/// let clock = SystemClock;
/// let earlier = clock.now();
/// assert!(clock.now() >= earlier);
/// ```
pub trait Clock: Send + Sync {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
