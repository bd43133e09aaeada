use std::fmt;

use tokio::sync::watch;

use crate::error::EngineError;

/// Engine readiness. Transitions only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReadinessState {
    /// Created, `start()` not called yet.
    Idle,
    Starting,
    AwaitingMetadataSync,
    Ready,
}

impl fmt::Display for ReadinessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReadinessState::Idle => "idle",
            ReadinessState::Starting => "starting",
            ReadinessState::AwaitingMetadataSync => "awaiting metadata sync",
            ReadinessState::Ready => "ready",
        };
        f.write_str(name)
    }
}

/// Owned readiness state of one engine instance.
#[derive(Clone, Debug)]
pub struct Lifecycle {
    state: watch::Sender<ReadinessState>,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ReadinessState::Idle);
        Self { state }
    }

    pub fn state(&self) -> ReadinessState {
        *self.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ReadinessState::Ready
    }

    /// `Idle -> Starting`. Any later call fails with `AlreadyStarted`.
    pub(crate) fn begin_start(&self) -> Result<(), EngineError> {
        let started = self.state.send_if_modified(|state| {
            if *state == ReadinessState::Idle {
                *state = ReadinessState::Starting;
                true
            } else {
                false
            }
        });
        if started {
            log::debug!("Lifecycle: idle -> starting");
            Ok(())
        } else {
            Err(EngineError::AlreadyStarted)
        }
    }

    /// `Starting -> AwaitingMetadataSync`, once the subscription set is issued.
    pub(crate) fn subscriptions_issued(&self) {
        self.advance(ReadinessState::Starting, ReadinessState::AwaitingMetadataSync);
    }

    /// `AwaitingMetadataSync -> Ready`. Returns `true` if this call made the
    /// engine ready.
    pub(crate) fn metadata_synced(&self) -> bool {
        self.advance(ReadinessState::AwaitingMetadataSync, ReadinessState::Ready)
    }

    fn advance(&self, from: ReadinessState, to: ReadinessState) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if changed {
            log::debug!("Lifecycle: {} -> {}", from, to);
        } else {
            log::debug!("Lifecycle: ignoring transition {} -> {} in state {}", from, to, self.state());
        }
        changed
    }

    /// A one-shot signal that completes when the engine reaches `Ready`.
    pub fn ready_signal(&self) -> ReadySignal {
        ReadySignal {
            receiver: self.state.subscribe(),
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves once, when the engine becomes ready. There is no built-in timeout;
/// wrap the call in `tokio::time::timeout` if one is needed.
pub struct ReadySignal {
    receiver: watch::Receiver<ReadinessState>,
}

impl ReadySignal {
    /// Fails with [`EngineError::Stopped`] if the engine went away first.
    pub async fn wait(mut self) -> Result<(), EngineError> {
        self.receiver
            .wait_for(|state| *state == ReadinessState::Ready)
            .await
            .map(|_| ())
            .map_err(|_| EngineError::Stopped)
    }
}
