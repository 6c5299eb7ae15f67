use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use super::patterns;
use crate::multiplexer::Multiplexer;

/// Liveness listings are cached this long to bound subprocess overhead.
const LIVE_CACHE_TTL: Duration = Duration::from_secs(2);
/// A second activity change inside this window confirms sustained work.
const SPIKE_WINDOW: Duration = Duration::from_secs(1);
const SPIKE_THRESHOLD: u32 = 2;
/// Keep reporting running this long after the last confirmation, absorbing
/// detection gaps between polls.
const RUNNING_COOLDOWN: Duration = Duration::from_secs(2);
const CAPTURE_SCROLLBACK: u32 = 50;

/// Observed liveness/activity of a multiplexer session.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionActivity {
    Running,
    Waiting,
    Idle,
    Dead,
}

/// Injectable time source so spike/cooldown behavior is testable without
/// real delays.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Per-session-name detection state. Discarded the moment the name leaves
/// the live list; a session reappearing under the same name starts fresh.
struct StatusTracker {
    /// Last moment running was confirmed (busy indicator or spike).
    last_running: Option<Instant>,
    /// Cleared when running is confirmed; set again by `acknowledge`.
    acknowledged: bool,
    last_activity: Option<i64>,
    spike_start: Option<Instant>,
    spike_count: u32,
}

impl StatusTracker {
    fn new() -> Self {
        Self {
            last_running: None,
            acknowledged: true,
            last_activity: None,
            spike_start: None,
            spike_count: 0,
        }
    }

    fn confirm_running(&mut self, now: Instant) {
        self.last_running = Some(now);
        self.acknowledged = false;
        self.spike_start = None;
        self.spike_count = 0;
    }
}

struct DetectorState {
    trackers: HashMap<String, StatusTracker>,
    live: HashMap<String, i64>,
    live_fetched_at: Option<Instant>,
}

/// Heuristic status classifier over rendered pane text and activity
/// timestamps. Never returns an error: any capture or listing failure
/// degrades to the best available guess from cached state.
pub struct StatusDetector {
    mux: Arc<dyn Multiplexer>,
    clock: Arc<dyn Clock>,
    state: Mutex<DetectorState>,
}

impl StatusDetector {
    pub fn new(mux: Arc<dyn Multiplexer>) -> Self {
        Self::with_clock(mux, Arc::new(SystemClock))
    }

    pub fn with_clock(mux: Arc<dyn Multiplexer>, clock: Arc<dyn Clock>) -> Self {
        Self {
            mux,
            clock,
            state: Mutex::new(DetectorState {
                trackers: HashMap::new(),
                live: HashMap::new(),
                live_fetched_at: None,
            }),
        }
    }

    pub fn get_status(&self, name: &str) -> SessionActivity {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.refresh_live(&mut state, now);
        self.classify(&mut state, name, now)
    }

    /// Batch variant: one liveness refresh, then per-name classification.
    pub fn get_all_statuses(&self, names: &[String]) -> HashMap<String, SessionActivity> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.refresh_live(&mut state, now);
        names
            .iter()
            .map(|name| (name.clone(), self.classify(&mut state, name, now)))
            .collect()
    }

    /// Mark a session's needs-attention state as seen by the operator;
    /// `waiting` becomes `idle` on the next read. Changes nothing else.
    pub fn acknowledge(&self, name: &str) {
        let mut state = self.state.lock();
        if let Some(tracker) = state.trackers.get_mut(name) {
            tracker.acknowledged = true;
        }
    }

    fn refresh_live(&self, state: &mut DetectorState, now: Instant) {
        let stale = state
            .live_fetched_at
            .map(|at| now.duration_since(at) >= LIVE_CACHE_TTL)
            .unwrap_or(true);
        if !stale {
            return;
        }

        match self.mux.list_sessions() {
            Ok(sessions) => {
                state.live = sessions
                    .into_iter()
                    .map(|s| (s.name, s.last_activity))
                    .collect();
                state.live_fetched_at = Some(now);
            }
            Err(e) => {
                // No new information this poll; keep the previous cache
                tracing::warn!("Failed to list multiplexer sessions: {}", e);
            }
        }
    }

    /// Priority-ordered classification. The order (dead > busy > waiting >
    /// spike > cooldown > acknowledged) is itself part of the contract.
    fn classify(&self, state: &mut DetectorState, name: &str, now: Instant) -> SessionActivity {
        if !state.live.contains_key(name) {
            state.trackers.remove(name);
            return SessionActivity::Dead;
        }

        let pane = self
            .mux
            .capture_pane(name, CAPTURE_SCROLLBACK)
            .unwrap_or_default();
        let activity = self.mux.session_activity(name).ok();

        let tracker = state
            .trackers
            .entry(name.to_string())
            .or_insert_with(StatusTracker::new);

        if patterns::is_busy(&pane) {
            tracker.confirm_running(now);
            return SessionActivity::Running;
        }

        if patterns::is_waiting_prompt(&pane) {
            return SessionActivity::Waiting;
        }

        if let Some(ts) = activity {
            let changed = tracker.last_activity.map(|prev| prev != ts).unwrap_or(false);
            tracker.last_activity = Some(ts);

            if changed {
                match tracker.spike_start {
                    // Second change inside an open window: sustained
                    // activity, not a one-off blip
                    Some(start) if now.duration_since(start) <= SPIKE_WINDOW => {
                        tracker.spike_count += 1;
                        if tracker.spike_count >= SPIKE_THRESHOLD {
                            tracker.confirm_running(now);
                            return SessionActivity::Running;
                        }
                    }
                    _ => {
                        tracker.spike_start = Some(now);
                        tracker.spike_count = 1;
                    }
                }
            } else if let Some(start) = tracker.spike_start {
                if now.duration_since(start) > SPIKE_WINDOW {
                    tracker.spike_start = None;
                    tracker.spike_count = 0;
                }
            }
        }

        // An unresolved spike window holds the previous stable classification
        // below rather than flapping
        if let Some(last) = tracker.last_running {
            if now.duration_since(last) < RUNNING_COOLDOWN {
                return SessionActivity::Running;
            }
        }

        if tracker.acknowledged {
            SessionActivity::Idle
        } else {
            SessionActivity::Waiting
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multiplexer::testing::FakeMultiplexer;

    struct FakeClock {
        now: Mutex<Instant>,
    }

    impl FakeClock {
        fn new() -> Self {
            Self {
                now: Mutex::new(Instant::now()),
            }
        }

        fn advance(&self, duration: Duration) {
            *self.now.lock() += duration;
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> Instant {
            *self.now.lock()
        }
    }

    fn detector() -> (Arc<FakeMultiplexer>, Arc<FakeClock>, StatusDetector) {
        let mux = Arc::new(FakeMultiplexer::new());
        let clock = Arc::new(FakeClock::new());
        let detector = StatusDetector::with_clock(
            Arc::clone(&mux) as Arc<dyn Multiplexer>,
            Arc::clone(&clock) as Arc<dyn Clock>,
        );
        (mux, clock, detector)
    }

    #[test]
    fn test_unknown_session_is_dead() {
        let (_mux, _clock, detector) = detector();
        assert_eq!(detector.get_status("ghost"), SessionActivity::Dead);
    }

    #[test]
    fn test_busy_indicator_forces_running_then_cooldown() {
        let (mux, clock, detector) = detector();
        mux.add_session("w");
        mux.set_pane("w", "✻ Pondering… (esc to interrupt)\n");
        assert_eq!(detector.get_status("w"), SessionActivity::Running);

        // Indicator gone but still inside the 2s cooldown
        mux.set_pane("w", "$ \n");
        clock.advance(Duration::from_millis(1500));
        assert_eq!(detector.get_status("w"), SessionActivity::Running);

        // Cooldown expired, running never acknowledged: needs attention
        clock.advance(Duration::from_secs(3));
        assert_eq!(detector.get_status("w"), SessionActivity::Waiting);

        detector.acknowledge("w");
        assert_eq!(detector.get_status("w"), SessionActivity::Idle);
    }

    #[test]
    fn test_waiting_prompt_detected() {
        let (mux, _clock, detector) = detector();
        mux.add_session("w");
        mux.set_pane("w", "Do you want to run this command?\n❯ 1. Yes\n");
        assert_eq!(detector.get_status("w"), SessionActivity::Waiting);
    }

    #[test]
    fn test_single_activity_blip_does_not_mean_running() {
        let (mux, clock, detector) = detector();
        mux.add_session("w");

        // Baseline observation
        assert_eq!(detector.get_status("w"), SessionActivity::Idle);

        mux.set_activity("w", 100);
        assert_eq!(detector.get_status("w"), SessionActivity::Idle);

        // 900ms with no further change: the spike path must stay quiet
        clock.advance(Duration::from_millis(900));
        assert_eq!(detector.get_status("w"), SessionActivity::Idle);
    }

    #[test]
    fn test_two_activity_changes_within_window_mean_running() {
        let (mux, clock, detector) = detector();
        mux.add_session("w");
        assert_eq!(detector.get_status("w"), SessionActivity::Idle);

        mux.set_activity("w", 100);
        assert_eq!(detector.get_status("w"), SessionActivity::Idle);

        clock.advance(Duration::from_millis(400));
        mux.set_activity("w", 101);
        assert_eq!(detector.get_status("w"), SessionActivity::Running);
    }

    #[test]
    fn test_changes_outside_window_open_a_new_one() {
        let (mux, clock, detector) = detector();
        mux.add_session("w");
        assert_eq!(detector.get_status("w"), SessionActivity::Idle);

        mux.set_activity("w", 100);
        assert_eq!(detector.get_status("w"), SessionActivity::Idle);

        clock.advance(Duration::from_secs(3));
        mux.set_activity("w", 101);
        assert_eq!(detector.get_status("w"), SessionActivity::Idle);
    }

    #[test]
    fn test_dead_discards_tracker_and_reappearance_starts_fresh() {
        let (mux, clock, detector) = detector();
        mux.add_session("w");
        mux.set_pane("w", "Compacting… (esc to interrupt)\n");
        assert_eq!(detector.get_status("w"), SessionActivity::Running);

        mux.remove_session("w");
        clock.advance(Duration::from_secs(3));
        assert_eq!(detector.get_status("w"), SessionActivity::Dead);

        // Same name, brand-new session: the unacknowledged flag from the
        // first life must not leak through
        mux.add_session("w");
        clock.advance(Duration::from_secs(3));
        assert_eq!(detector.get_status("w"), SessionActivity::Idle);
    }

    #[test]
    fn test_capture_failure_degrades_gracefully() {
        let (mux, _clock, detector) = detector();
        mux.add_session("w");
        *mux.fail_captures.lock() = true;
        assert_eq!(detector.get_status("w"), SessionActivity::Idle);
    }

    #[test]
    fn test_get_all_statuses_covers_every_name() {
        let (mux, _clock, detector) = detector();
        mux.add_session("a");
        mux.add_session("b");
        mux.set_pane("b", "Reticulating… 3k tokens (esc to interrupt)\n");

        let statuses = detector.get_all_statuses(&[
            "a".to_string(),
            "b".to_string(),
            "ghost".to_string(),
        ]);
        assert_eq!(statuses["a"], SessionActivity::Idle);
        assert_eq!(statuses["b"], SessionActivity::Running);
        assert_eq!(statuses["ghost"], SessionActivity::Dead);
    }
}
