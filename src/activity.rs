use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;

/// Tracks when a session was last used by a caller.
///
/// Every job submission, status poll, stream connection or input write
/// touches the tracker; the expiration sweep compares [`idle_for`] against
/// the configured timeout.
///
/// [`idle_for`]: ActivityTracker::idle_for
#[derive(Clone)]
pub struct ActivityTracker {
    last: Arc<Mutex<(Instant, SystemTime)>>,
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ActivityTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityTracker")
            .field("idle_ms", &self.last_activity_ms())
            .finish()
    }
}

impl ActivityTracker {
    /// Create a new tracker seeded with the current instant.
    pub fn new() -> Self {
        Self {
            last: Arc::new(Mutex::new((Instant::now(), SystemTime::now()))),
        }
    }

    /// Record activity. Safe to call from blocking threads.
    pub fn touch(&self) {
        *self.last.lock() = (Instant::now(), SystemTime::now());
    }

    /// Time since the last activity.
    pub fn idle_for(&self) -> Duration {
        self.last.lock().0.elapsed()
    }

    /// Return how many milliseconds have elapsed since the last activity.
    pub fn last_activity_ms(&self) -> u64 {
        self.idle_for().as_millis() as u64
    }

    /// Wall-clock time of the last activity.
    pub fn last_activity_at(&self) -> SystemTime {
        self.last.lock().1
    }

    /// Whether the tracker has been idle for longer than `timeout`.
    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.idle_for() > timeout
    }
}
