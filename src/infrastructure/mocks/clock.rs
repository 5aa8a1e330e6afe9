//! Mock clock for testing.

use crate::application::ports::Clock;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

/// Mock clock for testing.
///
/// Allows tests to control time progression explicitly, enabling deterministic
/// testing of windows, TTLs and cool-downs.
///
/// # Examples
///
/// ```rust,ignore
/// use service_guard::infrastructure::mocks::MockClock;
/// use service_guard::application::ports::Clock;
/// use std::time::{Duration, Instant};
///
/// let start = Instant::now();
/// let clock = MockClock::new(start);
///
/// // Time starts at the specified instant
/// assert_eq!(clock.now(), start);
///
/// // Advance time explicitly
/// clock.advance(Duration::from_secs(10));
/// assert_eq!(clock.now(), start + Duration::from_secs(10));
///
/// // Or set to a specific instant
/// let new_time = start + Duration::from_secs(100);
/// clock.set(new_time);
/// assert_eq!(clock.now(), new_time);
/// ```
///
/// # Thread Safety
///
/// `MockClock` is thread-safe and can be cloned to share across threads.
/// All clones share the same underlying time value, so advancing time in
/// one clone affects all clones.
///
/// Wall-clock time starts at the Unix epoch and moves in lockstep with the
/// monotonic instant.
#[derive(Debug, Clone)]
pub struct MockClock {
    state: Arc<Mutex<MockTime>>,
}

#[derive(Debug)]
struct MockTime {
    start: Instant,
    current: Instant,
    wall_start: SystemTime,
}

impl MockClock {
    /// Create a mock clock starting at a specific instant.
    pub fn new(start: Instant) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockTime {
                start,
                current: start,
                wall_start: SystemTime::UNIX_EPOCH,
            })),
        }
    }

    /// Create a mock clock whose wall-clock time starts at `wall_start`.
    pub fn with_wall_clock(start: Instant, wall_start: SystemTime) -> Self {
        let clock = Self::new(start);
        clock.lock().wall_start = wall_start;
        clock
    }

    /// Advance the clock by a duration.
    pub fn advance(&self, duration: Duration) {
        self.lock().current += duration;
    }

    /// Set the clock to a specific instant.
    pub fn set(&self, instant: Instant) {
        self.lock().current = instant;
    }

    /// Time elapsed since the clock was created.
    pub fn elapsed(&self) -> Duration {
        let state = self.lock();
        state.current.saturating_duration_since(state.start)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockTime> {
        self.state
            .lock()
            .expect("MockClock mutex poisoned - a test thread panicked while holding the lock")
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        self.lock().current
    }

    fn wall_clock(&self) -> SystemTime {
        let state = self.lock();
        state.wall_start + state.current.saturating_duration_since(state.start)
    }
}
