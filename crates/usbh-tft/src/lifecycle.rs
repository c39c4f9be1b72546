use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// The inferred lifecycle phase of the device (§3, §4.4).
///
/// The device gives no in-band phase signal; this is reconstructed purely
/// from elapsed time, command counts, tag-mismatch rate, and error signals
/// observed by the orchestrator and the keep-alive task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Unknown,
    Animation,
    Connecting,
    Connected,
    Disconnected,
}

/// Tunable thresholds behind the phase-transition triggers of §4.4.
///
/// The precise condition the device itself uses to leave its animation
/// sequence is unknown (design note 9a); these are a best-effort proxy and
/// are deliberately kept configurable rather than hard-coded.
#[derive(Debug, Clone, Copy)]
pub struct LifecycleConfig {
    /// Minimum time in Animation before considering Connecting (default 55s).
    pub animation_min_elapsed: Duration,
    /// Window size, in CSWs, for the rolling tag-mismatch rate (default 20).
    pub mismatch_rate_window: usize,
    /// Mismatch rate below which Animation → Connecting is allowed (default 0.5).
    pub mismatch_rate_threshold: f32,
    /// Consecutive clean CSWs required for Connecting → Connected (default 3).
    pub connecting_consecutive_clean: u32,
    /// Silence in Connected after which the device is presumed disconnected (default 5s).
    pub connected_silence_timeout: Duration,
    /// Time in Disconnected with no successful command before re-entering
    /// Animation, mirroring the device's own countdown (default 10s).
    pub disconnected_recovery_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            animation_min_elapsed: Duration::from_secs(55),
            mismatch_rate_window: 20,
            mismatch_rate_threshold: 0.5,
            connecting_consecutive_clean: 3,
            connected_silence_timeout: Duration::from_secs(5),
            disconnected_recovery_timeout: Duration::from_secs(10),
        }
    }
}

/// Per-phase counters retained for [`crate::transport::Statistics`] (§3).
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseCounters {
    pub commands_issued: u64,
    pub successful_csws: u64,
    pub tag_mismatches: u64,
    pub pipe_errors: u64,
}

/// A phase transition, returned by the machine so the orchestrator can log
/// and record it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: Phase,
    pub to: Phase,
}

/// The lifecycle state machine (§4.4).
///
/// Purely observational: it never issues I/O itself. It is fed from three
/// sources — the orchestrator after every CSW or error, the keep-alive task
/// after its own probe, and a wall-clock check consulted at the start of
/// every operation (`before_operation`).
#[derive(Debug)]
pub struct LifecycleMachine {
    config: LifecycleConfig,
    phase: Phase,
    entered_at: Instant,
    counters: PhaseCounters,
    mismatch_window: VecDeque<bool>,
    consecutive_clean: u32,
    last_csw_at: Option<Instant>,
    any_success_since_entry: bool,
}

impl LifecycleMachine {
    pub fn new(config: LifecycleConfig, now: Instant) -> Self {
        Self {
            config,
            phase: Phase::Unknown,
            entered_at: now,
            counters: PhaseCounters::default(),
            mismatch_window: VecDeque::with_capacity(20),
            consecutive_clean: 0,
            last_csw_at: None,
            any_success_since_entry: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn elapsed_in_phase(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.entered_at)
    }

    pub fn counters(&self) -> PhaseCounters {
        self.counters
    }

    /// Time since the last CSW was observed, across phase boundaries —
    /// `None` if no CSW has ever been seen on this handle. Distinct from
    /// `elapsed_in_phase`, which resets on every phase transition and says
    /// nothing about how recently the wire was actually used.
    pub fn elapsed_since_last_csw(&self, now: Instant) -> Option<Duration> {
        self.last_csw_at.map(|t| now.saturating_duration_since(t))
    }

    /// Force the machine back to Unknown: the explicit `close()`/re-`open()`
    /// path, and also used after a policy-driven `reset_device()`.
    pub fn force_unknown(&mut self, now: Instant) {
        self.enter(Phase::Unknown, now);
    }

    /// Jump directly to an arbitrary phase, bypassing the normal trigger
    /// table. Not reachable from production code paths; exists only so the
    /// scripted-device test suite can exercise a phase's behavior (pacing,
    /// tag policy, the Connected-silence timeout) without first waiting out
    /// the real-time Animation/Connecting climb that would otherwise be
    /// needed to reach it.
    #[doc(hidden)]
    pub fn force_phase_for_testing(&mut self, phase: Phase, now: Instant) {
        self.enter(phase, now);
    }

    fn enter(&mut self, phase: Phase, now: Instant) {
        self.phase = phase;
        self.entered_at = now;
        self.counters = PhaseCounters::default();
        self.consecutive_clean = 0;
        self.any_success_since_entry = false;
    }

    fn transition(&mut self, to: Phase, now: Instant) -> Option<Transition> {
        if to == self.phase {
            return None;
        }
        let from = self.phase;
        self.enter(to, now);
        Some(Transition { from, to })
    }

    /// Wall-clock check, consulted at the start of every transport operation
    /// _and_ by a bare `current_phase()`/`statistics()` query (§4.4: "a
    /// wall-clock check consulted at the start of every operation" reflects
    /// time-based transitions even to a caller that never issues another
    /// command — e.g. S4's "exactly 5s later, `current_phase()` reports
    /// Disconnected" with no intervening `execute()` call).
    ///
    /// Only the `Unknown -> Animation` edge is excluded here: that one is
    /// specifically gated on "the first transport operation after `open()`"
    /// (§4.4), not on elapsed time, so a caller merely polling the phase
    /// before issuing anything must not be the thing that starts the clock.
    pub fn check_wall_clock(&mut self, now: Instant) -> Option<Transition> {
        match self.phase {
            Phase::Unknown => None,
            Phase::Animation => {
                if self.elapsed_in_phase(now) >= self.config.animation_min_elapsed
                    && self.mismatch_rate() < self.config.mismatch_rate_threshold
                {
                    self.transition(Phase::Connecting, now)
                } else {
                    None
                }
            }
            Phase::Connected => {
                let silent = match self.last_csw_at {
                    Some(t) => now.saturating_duration_since(t) >= self.config.connected_silence_timeout,
                    None => false,
                };
                if silent {
                    self.transition(Phase::Disconnected, now)
                } else {
                    None
                }
            }
            Phase::Disconnected => {
                if !self.any_success_since_entry
                    && self.elapsed_in_phase(now) >= self.config.disconnected_recovery_timeout
                {
                    self.transition(Phase::Animation, now)
                } else {
                    None
                }
            }
            Phase::Connecting => None,
        }
    }

    /// Wall-clock check, consulted at the start of every transport operation:
    /// the `Unknown -> Animation` entry trigger plus every time-based edge in
    /// [`check_wall_clock`].
    pub fn before_operation(&mut self, now: Instant) -> Option<Transition> {
        if self.phase == Phase::Unknown {
            return self.transition(Phase::Animation, now);
        }
        self.check_wall_clock(now)
    }

    /// Feed the outcome of one CSW exchange into the machine.
    ///
    /// `tag_matched` reflects whether the device echoed the tag we expected,
    /// independent of whether the phase's tag policy treated that as a
    /// failure — the rolling mismatch-rate trigger needs the raw signal even
    /// in phases (Animation, Disconnected, Unknown) that never fail on it.
    pub fn after_csw(&mut self, now: Instant, scsi_success: bool, tag_matched: bool) -> Option<Transition> {
        self.counters.commands_issued += 1;
        if scsi_success {
            self.counters.successful_csws += 1;
        }
        if !tag_matched {
            self.counters.tag_mismatches += 1;
        }
        self.last_csw_at = Some(now);
        self.push_mismatch_sample(!tag_matched);

        let is_clean = scsi_success && tag_matched;
        if is_clean {
            self.any_success_since_entry = true;
        }

        match self.phase {
            Phase::Connecting => {
                if is_clean {
                    self.consecutive_clean += 1;
                    if self.consecutive_clean >= self.config.connecting_consecutive_clean {
                        return self.transition(Phase::Connected, now);
                    }
                } else {
                    self.consecutive_clean = 0;
                }
                None
            }
            Phase::Disconnected => {
                if scsi_success {
                    self.transition(Phase::Animation, now)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Feed a pipe error (stall/timeout on the wire) into the machine. Pipe
    /// errors are counted but, per §4.4, do not themselves drive a
    /// transition — only silence or `DeviceGone` moves Connected → Disconnected.
    pub fn after_pipe_error(&mut self) {
        self.counters.pipe_errors += 1;
    }

    /// A `DeviceGone` condition was observed. Per §4.4 this forces a move to
    /// Disconnected regardless of the phase it happened in.
    pub fn after_device_gone(&mut self, now: Instant) -> Option<Transition> {
        self.counters.pipe_errors += 1;
        self.transition(Phase::Disconnected, now)
    }

    fn push_mismatch_sample(&mut self, mismatched: bool) {
        if self.mismatch_window.len() == self.config.mismatch_rate_window {
            self.mismatch_window.pop_front();
        }
        self.mismatch_window.push_back(mismatched);
    }

    fn mismatch_rate(&self) -> f32 {
        if self.mismatch_window.is_empty() {
            return 0.0;
        }
        let mismatches = self.mismatch_window.iter().filter(|m| **m).count();
        mismatches as f32 / self.mismatch_window.len() as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_moves_to_animation_on_first_operation() {
        let mut lm = LifecycleMachine::new(LifecycleConfig::default(), Instant::now());
        let t = lm.before_operation(Instant::now()).unwrap();
        assert_eq!(t, Transition { from: Phase::Unknown, to: Phase::Animation });
    }

    #[test]
    fn bare_wall_clock_check_never_leaves_unknown_on_its_own() {
        // A caller polling the phase before issuing any command must not be
        // what starts the Animation clock — only an actual operation does.
        let mut lm = LifecycleMachine::new(LifecycleConfig::default(), Instant::now());
        let later = Instant::now() + Duration::from_secs(120);
        assert!(lm.check_wall_clock(later).is_none());
        assert_eq!(lm.phase(), Phase::Unknown);
    }

    #[test]
    fn bare_wall_clock_check_still_applies_time_based_edges() {
        let mut lm = LifecycleMachine::new(LifecycleConfig::default(), Instant::now());
        let t0 = Instant::now();
        lm.transition(Phase::Connected, t0);
        lm.after_csw(t0, true, true);
        let later = t0 + Duration::from_secs(6);
        let t = lm.check_wall_clock(later).unwrap();
        assert_eq!(t.to, Phase::Disconnected);
    }

    #[test]
    fn connecting_needs_three_consecutive_clean_csws() {
        let mut lm = LifecycleMachine::new(LifecycleConfig::default(), Instant::now());
        let now = Instant::now();
        lm.before_operation(now);
        // force into Connecting directly for the test
        lm.transition(Phase::Connecting, now);
        assert!(lm.after_csw(now, true, true).is_none());
        assert!(lm.after_csw(now, true, true).is_none());
        let t = lm.after_csw(now, true, true).unwrap();
        assert_eq!(t.to, Phase::Connected);
    }

    #[test]
    fn connecting_resets_streak_on_dirty_csw() {
        let mut lm = LifecycleMachine::new(LifecycleConfig::default(), Instant::now());
        let now = Instant::now();
        lm.transition(Phase::Connecting, now);
        lm.after_csw(now, true, true);
        lm.after_csw(now, false, true);
        lm.after_csw(now, true, true);
        assert!(lm.after_csw(now, true, true).is_none());
    }

    #[test]
    fn connected_times_out_after_silence() {
        let mut lm = LifecycleMachine::new(LifecycleConfig::default(), Instant::now());
        let t0 = Instant::now();
        lm.transition(Phase::Connected, t0);
        lm.after_csw(t0, true, true);
        let later = t0 + Duration::from_secs(6);
        let t = lm.before_operation(later).unwrap();
        assert_eq!(t.to, Phase::Disconnected);
    }

    #[test]
    fn device_gone_forces_disconnected_from_any_phase() {
        let mut lm = LifecycleMachine::new(LifecycleConfig::default(), Instant::now());
        let now = Instant::now();
        lm.transition(Phase::Animation, now);
        let t = lm.after_device_gone(now).unwrap();
        assert_eq!(t.to, Phase::Disconnected);
    }

    #[test]
    fn disconnected_recovers_to_animation_after_timeout() {
        let mut lm = LifecycleMachine::new(LifecycleConfig::default(), Instant::now());
        let t0 = Instant::now();
        lm.transition(Phase::Disconnected, t0);
        let later = t0 + Duration::from_secs(11);
        let t = lm.before_operation(later).unwrap();
        assert_eq!(t.to, Phase::Animation);
    }
}
