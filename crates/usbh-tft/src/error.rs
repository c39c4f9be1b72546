use std::time::Duration;

use crate::lifecycle::Phase;

/// Discriminant for [`Error`], without the per-failure context payload.
///
/// Matches the closed error taxonomy every caller of [`crate::transport::Transport`]
/// is guaranteed to observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    PipeStall,
    ResourceBusy,
    Timeout,
    TagMismatch,
    InvalidCsw,
    DeviceGone,
    ScsiFailure,
    Cancelled,
}

/// Context carried by every [`Error`] variant: phase at failure, the tag
/// involved, time spent in that phase so far, and which retry attempt this was.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorContext {
    pub phase: Phase,
    pub tag: u32,
    pub elapsed_in_phase: Duration,
    pub attempt: u32,
}

/// The closed set of errors the transport can surface to a caller.
///
/// Each variant carries the context needed to diagnose it (§3, §7 of the
/// design): the phase the device was believed to be in, the tag of the
/// in-flight command, and how many attempts had been made. This is a plain
/// discriminated union, not an exception type — stalls, mismatches, and
/// non-zero SCSI statuses are expected control flow, not bugs.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("bulk endpoint stalled (tag={tag}, phase={phase:?}, attempt={attempt})")]
    PipeStall {
        phase: Phase,
        tag: u32,
        elapsed_in_phase: Duration,
        attempt: u32,
    },

    #[error("device reported itself busy (tag={tag}, phase={phase:?})")]
    ResourceBusy {
        phase: Phase,
        tag: u32,
        elapsed_in_phase: Duration,
        attempt: u32,
    },

    #[error("bulk transfer timed out (tag={tag}, phase={phase:?}, attempt={attempt})")]
    Timeout {
        phase: Phase,
        tag: u32,
        elapsed_in_phase: Duration,
        attempt: u32,
    },

    #[error("CSW tag mismatch: expected {expected}, got {actual} (phase={phase:?})")]
    TagMismatch {
        expected: u32,
        actual: u32,
        phase: Phase,
        tag: u32,
        elapsed_in_phase: Duration,
        attempt: u32,
    },

    #[error("invalid CSW: {reason} (tag={tag}, phase={phase:?})")]
    InvalidCsw {
        reason: &'static str,
        phase: Phase,
        tag: u32,
        elapsed_in_phase: Duration,
        attempt: u32,
    },

    #[error("device is gone; handle is poisoned (tag={tag}, phase={phase:?})")]
    DeviceGone {
        phase: Phase,
        tag: u32,
        elapsed_in_phase: Duration,
        attempt: u32,
    },

    #[error("SCSI command failed with status {status} (tag={tag}, phase={phase:?})")]
    ScsiFailure {
        status: u8,
        phase: Phase,
        tag: u32,
        elapsed_in_phase: Duration,
        attempt: u32,
    },

    #[error("operation cancelled (tag={tag}, phase={phase:?})")]
    Cancelled {
        phase: Phase,
        tag: u32,
        elapsed_in_phase: Duration,
        attempt: u32,
    },
}

impl Error {
    /// The variant's discriminant, without its context payload.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::PipeStall { .. } => ErrorKind::PipeStall,
            Error::ResourceBusy { .. } => ErrorKind::ResourceBusy,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::TagMismatch { .. } => ErrorKind::TagMismatch,
            Error::InvalidCsw { .. } => ErrorKind::InvalidCsw,
            Error::DeviceGone { .. } => ErrorKind::DeviceGone,
            Error::ScsiFailure { .. } => ErrorKind::ScsiFailure,
            Error::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    /// The context (phase, tag, elapsed time, attempt count) common to every variant.
    pub fn context(&self) -> ErrorContext {
        match *self {
            Error::PipeStall { phase, tag, elapsed_in_phase, attempt }
            | Error::ResourceBusy { phase, tag, elapsed_in_phase, attempt }
            | Error::Timeout { phase, tag, elapsed_in_phase, attempt }
            | Error::TagMismatch { phase, tag, elapsed_in_phase, attempt, .. }
            | Error::InvalidCsw { phase, tag, elapsed_in_phase, attempt, .. }
            | Error::DeviceGone { phase, tag, elapsed_in_phase, attempt }
            | Error::ScsiFailure { phase, tag, elapsed_in_phase, attempt, .. }
            | Error::Cancelled { phase, tag, elapsed_in_phase, attempt } => ErrorContext {
                phase,
                tag,
                elapsed_in_phase,
                attempt,
            },
        }
    }

    /// Whether this error poisons the handle per invariant I4: only
    /// [`ErrorKind::DeviceGone`] does, and any failure to re-synchronize
    /// CBW/CSW ordering after a failed recovery (callers of `execute` never
    /// see that second case directly — it is folded into `DeviceGone`).
    pub fn poisons(&self) -> bool {
        matches!(self, Error::DeviceGone { .. })
    }
}

/// Errors that can occur while opening a [`crate::transport::Transport`] handle.
#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error("no device matching {vendor:#06x}:{product:#06x} was found")]
    NotFound { vendor: u16, product: u16 },
    #[error("device found but its interface is already claimed elsewhere")]
    Busy,
    #[error("insufficient permissions to open the device")]
    PermissionDenied,
}
