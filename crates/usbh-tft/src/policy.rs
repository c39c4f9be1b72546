use std::time::Duration;

use crate::lifecycle::Phase;

/// When to clear endpoint halts (and, eventually, reset the device) after a
/// `PipeStall` (§4.5's "Clear halts on PipeStall?" column).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallRecovery {
    /// Never attempt recovery; the stall is surfaced immediately (Disconnected).
    Never,
    /// Clear halts on both endpoints and retry.
    ClearHalts,
    /// Clear halts on the first stall of an operation; call `reset_device()`
    /// on the second (Connected: "yes on 1st, reset on 2nd").
    ClearThenReset,
}

/// The per-phase pacing and retry table (§4.5).
///
/// A static lookup, not a trait hierarchy — the design deliberately treats
/// lifecycle phase as data rather than behavior, so there is exactly one
/// place (this struct) that encodes "what do we do in phase X".
#[derive(Debug, Clone, Copy)]
pub struct PhasePolicy {
    pub pre_delay: Duration,
    pub post_delay: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub stall_recovery: StallRecovery,
    pub accept_scsi_failure: bool,
}

/// The full per-phase table. `Unknown` is not named explicitly in §4.5;
/// we give it the same (maximally conservative, no retries) policy as
/// `Disconnected`, since in both the transport has no basis to believe
/// retrying will help.
#[derive(Debug, Clone, Copy)]
pub struct PolicyTable {
    pub animation: PhasePolicy,
    pub connecting: PhasePolicy,
    pub connected: PhasePolicy,
    pub disconnected: PhasePolicy,
}

impl PolicyTable {
    pub fn for_phase(&self, phase: Phase) -> PhasePolicy {
        match phase {
            Phase::Animation => self.animation,
            Phase::Connecting => self.connecting,
            Phase::Connected => self.connected,
            Phase::Disconnected | Phase::Unknown => self.disconnected,
        }
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        let backoff_base = Duration::from_millis(100);
        Self {
            animation: PhasePolicy {
                pre_delay: Duration::from_millis(200),
                post_delay: Duration::from_millis(0),
                max_retries: 5,
                backoff_base,
                stall_recovery: StallRecovery::ClearHalts,
                accept_scsi_failure: true,
            },
            connecting: PhasePolicy {
                pre_delay: Duration::from_millis(50),
                post_delay: Duration::from_millis(50),
                max_retries: 3,
                backoff_base,
                stall_recovery: StallRecovery::ClearHalts,
                accept_scsi_failure: true,
            },
            connected: PhasePolicy {
                pre_delay: Duration::from_millis(20),
                // The allowed range is 50-100ms; we fix the midpoint rather
                // than pull in a `rand` dependency for a single deterministic
                // pacing knob.
                post_delay: Duration::from_millis(75),
                max_retries: 3,
                backoff_base,
                stall_recovery: StallRecovery::ClearThenReset,
                accept_scsi_failure: false,
            },
            disconnected: PhasePolicy {
                pre_delay: Duration::from_millis(0),
                post_delay: Duration::from_millis(0),
                max_retries: 0,
                backoff_base,
                stall_recovery: StallRecovery::Never,
                accept_scsi_failure: false,
            },
        }
    }
}

impl PhasePolicy {
    /// Backoff delay for the `n`th retry (0-indexed), doubling from `backoff_base`.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff_base.saturating_mul(1u32 << attempt.min(16))
    }
}
