use thiserror::Error;

use crate::{
    clock::{TimerHandle, Timestamp},
    transport::TransportError,
};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Rule engine is not ready yet")]
    NotReady,
    #[error("Rule engine was already started")]
    AlreadyStarted,
    #[error("Unmatched fire request for timer {handle} at {at}: {reason}")]
    UnmatchedFireRequest {
        handle: TimerHandle,
        at: Timestamp,
        reason: UnmatchedReason,
    },
    #[error("Rule callback failed ({origin}): {message}")]
    RuleCallbackFailure { origin: String, message: String },
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Rule engine has been stopped")]
    Stopped,
}

/// Why a fire request could not be matched to an armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmatchedReason {
    /// The requested timestamp lies after the current clock reading.
    ClockNotReached { now: Timestamp },
    /// The timer is armed, but for a later point in time.
    NotDue { scheduled: Timestamp },
    /// No armed timer with that handle (never created, fired or cancelled).
    UnknownTimer,
}

impl std::fmt::Display for UnmatchedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnmatchedReason::ClockNotReached { now } => write!(f, "clock is only at {}", now),
            UnmatchedReason::NotDue { scheduled } => write!(f, "timer is scheduled for {}", scheduled),
            UnmatchedReason::UnknownTimer => f.write_str("no such armed timer"),
        }
    }
}
