use std::collections::VecDeque;

use crate::lifecycle::Phase;

/// A host-assigned command tag, echoed back by the device in the matching CSW.
pub type Tag = u32;

/// Horizon of the tag-history ring (§3: "last 50").
const HISTORY_CAPACITY: usize = 50;

/// Result of validating a returned CSW tag against the one the host assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagOutcome {
    /// The tag is acceptable under the current phase's policy.
    Accept,
    /// The tag is not acceptable; the orchestrator should treat this as a failure.
    Mismatch,
    /// The device appears to have reset its internal tag counter.
    SuspectedReset,
}

/// The result of [`TagMonitor::validate`]: both the control-flow outcome
/// (what the orchestrator should do) and whether the tag actually matched
/// (used by the lifecycle machine's rolling mismatch-rate trigger even in
/// phases — Animation, Disconnected, Unknown — whose policy never fails on
/// a mismatched tag).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagValidation {
    pub outcome: TagOutcome,
    pub tag_matched: bool,
}

#[derive(Debug, Clone, Copy)]
struct TagRecord {
    tag: Tag,
    outcome: TagOutcome,
    #[allow(dead_code)]
    phase: Phase,
}

/// A rollup of the tag-history ring, exposed through
/// [`crate::transport::Statistics`] so a caller can see how the last
/// [`HISTORY_CAPACITY`] validations broke down without reaching into the
/// monitor's internals.
#[derive(Debug, Clone, Copy)]
pub struct TagHistorySummary {
    pub next_tag: Tag,
    pub history_len: usize,
    pub accepted: usize,
    pub mismatches: usize,
    pub suspected_resets: usize,
}

/// Generates, tracks, and validates command tags (§4.3).
///
/// Owns the "next tag to assign" counter and a bounded ring of the last
/// [`HISTORY_CAPACITY`] `(tag, outcome, phase)` tuples, used only to bound
/// memory — the reset heuristic itself is a pure function of `(expected,
/// actual)` and does not need to walk the ring.
#[derive(Debug)]
pub struct TagMonitor {
    next: Tag,
    history: VecDeque<TagRecord>,
}

impl TagMonitor {
    pub fn new() -> Self {
        Self {
            next: 1,
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
        }
    }

    /// Return the next tag and advance the counter. Never yields `0`: the
    /// counter wraps from `u32::MAX` straight back to `1`.
    pub fn next(&mut self) -> Tag {
        let tag = self.next;
        self.next = if self.next == u32::MAX { 1 } else { self.next + 1 };
        tag
    }

    /// Validate a returned tag under the phase-keyed policy of §4.3.
    ///
    /// The reset heuristic (`actual < 5` while `expected > 100`) is checked
    /// first and overrides the phase policy — a suspected reset is
    /// meaningful in every phase, not just Connected.
    pub fn validate(&mut self, expected: Tag, actual: Tag, phase: Phase) -> TagValidation {
        let tag_matched = expected == actual;

        let outcome = if actual < 5 && expected > 100 {
            TagOutcome::SuspectedReset
        } else {
            match phase {
                Phase::Animation | Phase::Disconnected | Phase::Unknown => TagOutcome::Accept,
                Phase::Connecting => {
                    if expected.abs_diff(actual) < 10 {
                        TagOutcome::Accept
                    } else {
                        TagOutcome::Mismatch
                    }
                }
                Phase::Connected => {
                    if tag_matched {
                        TagOutcome::Accept
                    } else {
                        TagOutcome::Mismatch
                    }
                }
            }
        };

        self.record(expected, outcome, phase);
        TagValidation { outcome, tag_matched }
    }

    /// Rebase the counter after a [`TagOutcome::SuspectedReset`] and flush
    /// the history ring, per §4.3's recovery instruction.
    pub fn rebase(&mut self, observed: Tag) {
        self.next = observed.wrapping_add(1).max(1);
        self.history.clear();
    }

    /// Reset the counter to `1`, as happens after `reset_device()` (§4.5:
    /// "reset on 2nd" clears halts and forces the tag counter back to 1).
    pub fn reset(&mut self) {
        self.next = 1;
        self.history.clear();
    }

    fn record(&mut self, tag: Tag, outcome: TagOutcome, phase: Phase) {
        if self.history.len() == HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(TagRecord { tag, outcome, phase });
    }

    /// Whether `tag` appears twice within the current history horizon —
    /// used by the property-test suite to check tag uniqueness (§8, property 1).
    pub fn appears_more_than_once(&self, tag: Tag) -> bool {
        self.history.iter().filter(|r| r.tag == tag).count() > 1
    }

    /// Summarize the history ring's outcome counts and the current counter.
    pub fn summary(&self) -> TagHistorySummary {
        let mut accepted = 0;
        let mut mismatches = 0;
        let mut suspected_resets = 0;
        for record in &self.history {
            match record.outcome {
                TagOutcome::Accept => accepted += 1,
                TagOutcome::Mismatch => mismatches += 1,
                TagOutcome::SuspectedReset => suspected_resets += 1,
            }
        }
        TagHistorySummary {
            next_tag: self.next,
            history_len: self.history.len(),
            accepted,
            mismatches,
            suspected_resets,
        }
    }
}

impl Default for TagMonitor {
    fn default() -> Self {
        Self::new()
    }
}
