// =============================================================================
// Timer Manager — named one-shot countdown timers with a 1 Hz ticker
// =============================================================================
//
// Names are unique per manager; starting an existing name replaces the prior
// timer. The single background ticker wakes once per second, runs every
// callback whose deadline passed, and removes it — worst-case callback
// latency is one tick. A panicking callback is contained and logged; it
// neither kills the ticker nor skips other timers.
//
// State is in-memory only. Cooldown lockouts are re-armed from the store by
// the lockout manager on startup, so nothing here needs to survive a crash.
// =============================================================================

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, error};

type TimerCallback = Box<dyn FnOnce() + Send>;

struct TimerEntry {
    deadline: Instant,
    callback: TimerCallback,
}

#[derive(Default)]
pub struct TimerManager {
    timers: Mutex<HashMap<String, TimerEntry>>,
}

impl TimerManager {
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------------
    // Scheduling
    // -------------------------------------------------------------------------

    /// Schedule a one-shot callback `duration_seconds` from now. Replaces any
    /// existing timer of the same name. Zero duration fires on the next tick.
    /// (Durations are unsigned; a negative duration cannot be expressed.)
    pub fn start(
        &self,
        name: impl Into<String>,
        duration_seconds: u64,
        callback: impl FnOnce() + Send + 'static,
    ) {
        let name = name.into();
        let deadline = Instant::now() + Duration::from_secs(duration_seconds);
        let replaced = self
            .timers
            .lock()
            .insert(name.clone(), TimerEntry { deadline, callback: Box::new(callback) })
            .is_some();
        debug!(timer = %name, duration_seconds, replaced, "timer started");
    }

    /// Cancel a timer. Returns whether one existed.
    pub fn cancel(&self, name: &str) -> bool {
        let existed = self.timers.lock().remove(name).is_some();
        if existed {
            debug!(timer = %name, "timer cancelled");
        }
        existed
    }

    /// Remaining whole seconds, or 0 for unknown / already-due timers.
    pub fn remaining(&self, name: &str) -> u64 {
        self.timers
            .lock()
            .get(name)
            .map(|entry| entry.deadline.saturating_duration_since(Instant::now()).as_secs())
            .unwrap_or(0)
    }

    pub fn has(&self, name: &str) -> bool {
        self.timers.lock().contains_key(name)
    }

    // -------------------------------------------------------------------------
    // Ticker
    // -------------------------------------------------------------------------

    /// Run every callback whose deadline has passed. Called by the ticker;
    /// public so tests can drive time deterministically.
    pub fn run_due(&self, now: Instant) {
        // Pop due entries first so a callback can start new timers without
        // deadlocking on the map lock.
        let due: Vec<(String, TimerCallback)> = {
            let mut timers = self.timers.lock();
            let names: Vec<String> = timers
                .iter()
                .filter(|(_, entry)| entry.deadline <= now)
                .map(|(name, _)| name.clone())
                .collect();
            names
                .into_iter()
                .filter_map(|name| timers.remove(&name).map(|entry| (name, entry.callback)))
                .collect()
        };

        for (name, callback) in due {
            debug!(timer = %name, "timer fired");
            if catch_unwind(AssertUnwindSafe(callback)).is_err() {
                error!(timer = %name, "timer callback panicked");
            }
        }
    }

    /// Spawn the 1 Hz background ticker.
    pub fn spawn_ticker(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                manager.run_due(Instant::now());
            }
        })
    }
}

impl std::fmt::Debug for TimerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerManager")
            .field("active_timers", &self.timers.lock().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn due_timer_fires_and_is_removed() {
        let manager = TimerManager::new();
        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();
        manager.start("t1", 1, move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        assert!(manager.has("t1"));
        manager.run_due(Instant::now() + Duration::from_secs(2));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!manager.has("t1"));

        // Already consumed: running again does nothing.
        manager.run_due(Instant::now() + Duration::from_secs(10));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn not_yet_due_timer_does_not_fire() {
        let manager = TimerManager::new();
        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();
        manager.start("t1", 60, move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        manager.run_due(Instant::now());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(manager.has("t1"));
        assert!(manager.remaining("t1") >= 58);
    }

    #[test]
    fn zero_duration_fires_on_next_tick() {
        let manager = TimerManager::new();
        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();
        manager.start("t0", 0, move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        manager.run_due(Instant::now());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn starting_existing_name_replaces_timer() {
        let manager = TimerManager::new();
        let fired = Arc::new(AtomicU32::new(0));

        let f = fired.clone();
        manager.start("t", 1, move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        let f = fired.clone();
        manager.start("t", 600, move || {
            f.fetch_add(100, Ordering::SeqCst);
        });

        // The first callback was replaced; at +2s only the 600 s timer
        // exists and it is not yet due.
        manager.run_due(Instant::now() + Duration::from_secs(2));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(manager.remaining("t") > 500);
    }

    #[test]
    fn cancel_prevents_firing() {
        let manager = TimerManager::new();
        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();
        manager.start("t", 1, move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert!(manager.cancel("t"));
        assert!(!manager.cancel("t"));
        manager.run_due(Instant::now() + Duration::from_secs(5));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn panicking_callback_does_not_skip_other_timers() {
        let manager = TimerManager::new();
        let fired = Arc::new(AtomicU32::new(0));

        manager.start("bad", 0, || panic!("boom"));
        let f = fired.clone();
        manager.start("good", 0, move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        manager.run_due(Instant::now() + Duration::from_secs(1));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!manager.has("bad"));
    }

    #[test]
    fn callback_may_start_new_timer() {
        let manager = Arc::new(TimerManager::new());
        let fired = Arc::new(AtomicU32::new(0));

        let m = manager.clone();
        let f = fired.clone();
        manager.start("outer", 0, move || {
            f.fetch_add(1, Ordering::SeqCst);
            m.start("inner", 0, || {});
        });

        manager.run_due(Instant::now() + Duration::from_secs(1));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(manager.has("inner"));
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_latency_is_at_most_one_second() {
        let manager = Arc::new(TimerManager::new());
        let fired = Arc::new(AtomicU32::new(0));
        let handle = manager.spawn_ticker();

        let f = fired.clone();
        manager.start("t", 2, move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        // Strictly before the deadline: no fire.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        // Deadline + one tick: must have fired.
        tokio::time::sleep(Duration::from_millis(1600)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        handle.abort();
    }
}
