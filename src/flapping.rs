//! # Flapping detector — crash-loop detection with cooldown.
//!
//! Tracks a sliding window of recent exit timestamps per watcher. Once the
//! window holds the configured number of exits it is evaluated and cleared:
//!
//! ```text
//! duration = newest - oldest - tick_interval
//!
//! duration <= window   → flapping
//!     tries < max_retry  → Retry    (stop watcher, restart after the cooldown)
//!     tries >= max_retry → Exhausted (stop watcher, stays down until started)
//! duration > window    → Healthy   (clear window, reset tries)
//! ```
//!
//! ## Rules
//! - The window never grows past the attempt threshold; reaching it always
//!   evaluates and clears.
//! - Settings come from the watcher's live options **per check** (late
//!   binding): editing `attempts`/`window`/`retry_in`/`max_retry` takes
//!   effect on the next evaluation.
//! - A watcher with `active = false` is still tracked; the caller receives
//!   the verdict but must not act on it.
//! - At most one pending restart deadline per watcher; arming again replaces
//!   it, and [`reset`](FlappingDetector::reset) clears it so a manual stop is
//!   never undone by a stale retry.
//! - The automatic restart does **not** clear `tries`: the retry budget is
//!   only given back by an operator start/stop or a healthy window. A watcher
//!   that keeps crashing through its cooldowns therefore reaches `Exhausted`.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::config::FlappingConfig;

/// Result of evaluating a full exit window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Exits are spread out; counters were reset.
    Healthy,
    /// Flapping; a retry is granted after `retry_in`.
    Retry {
        /// Cooldown before the automatic restart.
        retry_in: Duration,
    },
    /// Flapping with the retry budget spent; the watcher stays down.
    Exhausted,
}

/// Per-watcher detector state.
#[derive(Default)]
struct WatcherFlap {
    timeline: VecDeque<Instant>,
    tries: usize,
    retry_at: Option<Instant>,
}

/// Crash-loop detector for every watcher of one arbiter.
///
/// Owned by the arbiter and fed from the management tick: each reap appends
/// a timestamp via [`record_exit`](FlappingDetector::record_exit), then
/// [`check`](FlappingDetector::check) evaluates the window against the
/// watcher's live settings.
#[derive(Default)]
pub struct FlappingDetector {
    states: HashMap<String, WatcherFlap>,
}

impl FlappingDetector {
    /// Creates an empty detector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one exit for `watcher` at time `at`.
    ///
    /// The window is bounded by `attempts`; older entries fall off the
    /// front.
    pub fn record_exit(&mut self, watcher: &str, at: Instant, attempts: usize) {
        let state = self.states.entry(watcher.to_lowercase()).or_default();
        state.timeline.push_back(at);
        while state.timeline.len() > attempts.max(1) {
            state.timeline.pop_front();
        }
    }

    /// Evaluates the window once it is full. Returns `None` while more exits
    /// are needed.
    ///
    /// `tick_interval` is subtracted from the observed span because exits are
    /// only noticed at tick granularity; without the correction a slow tick
    /// would make healthy watchers look flappy.
    pub fn check(
        &mut self,
        watcher: &str,
        settings: &FlappingConfig,
        tick_interval: Duration,
    ) -> Option<Verdict> {
        let state = self.states.entry(watcher.to_lowercase()).or_default();
        if state.timeline.len() < settings.attempts.max(1) {
            return None;
        }

        let oldest = *state.timeline.front()?;
        let newest = *state.timeline.back()?;
        let duration = newest
            .duration_since(oldest)
            .saturating_sub(tick_interval);
        let window = Duration::from_secs_f64(settings.window.max(0.0));

        state.timeline.clear();
        if duration <= window {
            if state.tries < settings.max_retry {
                state.tries += 1;
                info!(
                    watcher,
                    tries = state.tries,
                    retry_in = settings.retry_in,
                    "flapping detected"
                );
                Some(Verdict::Retry {
                    retry_in: Duration::from_secs_f64(settings.retry_in.max(0.0)),
                })
            } else {
                state.tries = 0;
                info!(watcher, "flapping detected: max retry limit");
                Some(Verdict::Exhausted)
            }
        } else {
            state.tries = 0;
            debug!(watcher, "exit window healthy");
            Some(Verdict::Healthy)
        }
    }

    /// Schedules the automatic restart for `watcher` at `now + retry_in`,
    /// replacing any pending deadline. The arbiter collects due restarts on
    /// its tick via [`take_due_retries`](FlappingDetector::take_due_retries).
    ///
    /// `tries` is left untouched: the restart consumes budget, it does not
    /// refill it.
    pub fn arm_retry(&mut self, watcher: &str, retry_in: Duration, now: Instant) {
        let state = self.states.entry(watcher.to_lowercase()).or_default();
        state.retry_at = Some(now + retry_in);
    }

    /// Watchers whose restart deadline has passed as of `now`, sorted by
    /// name. Each deadline is cleared as it is taken.
    pub fn take_due_retries(&mut self, now: Instant) -> Vec<String> {
        let mut due = Vec::new();
        for (name, state) in &mut self.states {
            if state.retry_at.is_some_and(|at| at <= now) {
                state.retry_at = None;
                due.push(name.clone());
            }
        }
        due.sort();
        due
    }

    /// Clears window, tries, and any pending restart for `watcher`.
    ///
    /// Called when the watcher is started or stopped by hand, so a stale
    /// retry cannot resurrect it and the operator gets a fresh budget.
    pub fn reset(&mut self, watcher: &str) {
        if let Some(state) = self.states.get_mut(&watcher.to_lowercase()) {
            state.timeline.clear();
            state.tries = 0;
            state.retry_at = None;
        }
    }

    /// Drops all state for `watcher` (watcher removed).
    pub fn forget(&mut self, watcher: &str) {
        self.states.remove(&watcher.to_lowercase());
    }

    /// Retry count currently consumed for `watcher`.
    pub fn tries(&self, watcher: &str) -> usize {
        self.states
            .get(&watcher.to_lowercase())
            .map(|s| s.tries)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(attempts: usize, window: f64, retry_in: f64, max_retry: usize) -> FlappingConfig {
        FlappingConfig {
            attempts,
            window,
            retry_in,
            max_retry,
            active: true,
        }
    }

    #[test]
    fn window_below_threshold_gives_no_verdict() {
        let mut det = FlappingDetector::new();
        let s = settings(3, 1.0, 1.0, 1);
        det.record_exit("w", Instant::now(), s.attempts);
        det.record_exit("w", Instant::now(), s.attempts);
        assert_eq!(det.check("w", &s, Duration::ZERO), None);
    }

    #[test]
    fn rapid_exits_grant_a_retry_then_exhaust() {
        let mut det = FlappingDetector::new();
        let s = settings(2, 1.0, 1.0, 1);
        let now = Instant::now();

        det.record_exit("w", now, s.attempts);
        det.record_exit("w", now + Duration::from_millis(100), s.attempts);
        assert_eq!(
            det.check("w", &s, Duration::ZERO),
            Some(Verdict::Retry { retry_in: Duration::from_secs(1) })
        );
        assert_eq!(det.tries("w"), 1);

        // Second burst: the single retry is spent.
        det.record_exit("w", now, s.attempts);
        det.record_exit("w", now + Duration::from_millis(100), s.attempts);
        assert_eq!(det.check("w", &s, Duration::ZERO), Some(Verdict::Exhausted));
        assert_eq!(det.tries("w"), 0, "exhaustion resets the counter");
    }

    #[test]
    fn slow_exits_reset_counters() {
        let mut det = FlappingDetector::new();
        let s = settings(2, 1.0, 1.0, 3);
        let now = Instant::now();

        det.record_exit("w", now, s.attempts);
        det.record_exit("w", now + Duration::from_millis(200), s.attempts);
        assert!(matches!(det.check("w", &s, Duration::ZERO), Some(Verdict::Retry { .. })));

        det.record_exit("w", now, s.attempts);
        det.record_exit("w", now + Duration::from_secs(5), s.attempts);
        assert_eq!(det.check("w", &s, Duration::ZERO), Some(Verdict::Healthy));
        assert_eq!(det.tries("w"), 0);
    }

    #[test]
    fn tick_interval_is_subtracted_from_the_span() {
        let mut det = FlappingDetector::new();
        let s = settings(2, 1.0, 1.0, 1);
        let now = Instant::now();

        // 1.5s apart, but a 1s tick means the real spacing fits the window.
        det.record_exit("w", now, s.attempts);
        det.record_exit("w", now + Duration::from_millis(1500), s.attempts);
        assert!(matches!(
            det.check("w", &s, Duration::from_secs(1)),
            Some(Verdict::Retry { .. })
        ));
    }

    #[test]
    fn late_binding_settings_apply_on_next_check() {
        let mut det = FlappingDetector::new();
        let now = Instant::now();

        // Window of 2 first, then the operator raises attempts to 3 live.
        det.record_exit("w", now, 3);
        det.record_exit("w", now + Duration::from_millis(50), 3);
        let widened = settings(3, 1.0, 1.0, 1);
        assert_eq!(det.check("w", &widened, Duration::ZERO), None);
    }

    #[test]
    fn retry_fires_only_after_its_deadline() {
        let mut det = FlappingDetector::new();
        let now = Instant::now();
        det.arm_retry("w", Duration::from_secs(1), now);

        assert!(det.take_due_retries(now).is_empty());
        let later = now + Duration::from_secs(2);
        assert_eq!(det.take_due_retries(later), vec!["w".to_string()]);
        // Taken once; the deadline is gone.
        assert!(det.take_due_retries(later).is_empty());
    }

    #[test]
    fn reset_clears_a_pending_retry() {
        let mut det = FlappingDetector::new();
        let now = Instant::now();
        det.arm_retry("w", Duration::ZERO, now);
        det.reset("w");
        assert!(det.take_due_retries(now + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn arming_again_replaces_the_deadline() {
        let mut det = FlappingDetector::new();
        let now = Instant::now();
        det.arm_retry("w", Duration::ZERO, now);
        det.arm_retry("w", Duration::from_secs(60), now);
        assert!(det.take_due_retries(now + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn retry_budget_survives_the_automatic_restart() {
        let mut det = FlappingDetector::new();
        let s = settings(2, 1.0, 0.0, 1);
        let now = Instant::now();

        det.record_exit("w", now, s.attempts);
        det.record_exit("w", now + Duration::from_millis(50), s.attempts);
        assert!(matches!(det.check("w", &s, Duration::ZERO), Some(Verdict::Retry { .. })));

        // The cooldown elapses and the watcher is restarted; the consumed
        // retry stays on the books.
        det.arm_retry("w", Duration::ZERO, now);
        assert_eq!(det.take_due_retries(now), vec!["w".to_string()]);
        assert_eq!(det.tries("w"), 1);

        // Second burst spends the budget.
        det.record_exit("w", now, s.attempts);
        det.record_exit("w", now + Duration::from_millis(50), s.attempts);
        assert_eq!(det.check("w", &s, Duration::ZERO), Some(Verdict::Exhausted));
    }
}
