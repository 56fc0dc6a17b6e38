//! Activity clock and idle-nudge policy

use parking_lot::Mutex;
use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

struct ClockState {
    last_activity: Instant,
    threshold: Duration,
}

/// Last-activity timestamp plus a randomised quiet threshold.
///
/// Shared between the capture pump, the playback worker and the session loop.
pub struct ActivityClock {
    state: Mutex<ClockState>,
    rearm_range_ms: (u64, u64),
}

impl ActivityClock {
    /// `first_range_ms` seeds the initial threshold, `rearm_range_ms` is used
    /// after every nudge.
    pub fn new(first_range_ms: (u64, u64), rearm_range_ms: (u64, u64)) -> Self {
        Self {
            state: Mutex::new(ClockState {
                last_activity: Instant::now(),
                threshold: roll(first_range_ms),
            }),
            rearm_range_ms,
        }
    }

    /// Record activity now.
    pub fn touch(&self) {
        self.touch_at(Instant::now());
    }

    pub fn touch_at(&self, at: Instant) {
        let mut state = self.state.lock();
        if at > state.last_activity {
            state.last_activity = at;
        }
    }

    pub fn last_activity(&self) -> Instant {
        self.state.lock().last_activity
    }

    pub fn threshold(&self) -> Duration {
        self.state.lock().threshold
    }

    pub fn quiet_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.state.lock().last_activity)
    }

    /// Decide whether a nudge is due.
    ///
    /// Fires only when nothing is playing and the quiet time exceeds the
    /// current threshold. Firing counts as activity and re-rolls the threshold.
    pub fn check_nudge(&self, now: Instant, playback_active: bool) -> bool {
        let mut state = self.state.lock();
        let quiet = now.saturating_duration_since(state.last_activity);
        if playback_active || quiet <= state.threshold {
            return false;
        }

        state.last_activity = now;
        state.threshold = roll(self.rearm_range_ms);
        debug!(
            "Idle nudge due after {:?} of quiet, next threshold {:?}",
            quiet, state.threshold
        );
        true
    }
}

fn roll((lo, hi): (u64, u64)) -> Duration {
    if hi <= lo {
        return Duration::from_millis(lo);
    }
    Duration::from_millis(rand::rng().random_range(lo..hi))
}
