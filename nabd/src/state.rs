//! High-level daemon state machine
//!
//! Five states: `idle`, `playing`, `interactive`, `recording`, `asleep`.
//! The scheduler is the only caller; every observed change is broadcast to
//! all writers as a `state` frame.

use nab_common::RabbitState;
use tracing::debug;

/// Legal transitions, mirroring the daemon's lifecycle:
/// items start and complete between `idle` and `playing`; the interactive
/// slot toggles `idle`/`interactive`; audio capture nests `recording` inside
/// whichever awake state the hold arrived in; `asleep` is entered from
/// `idle` via a drained sleep barrier and left on wakeup.
fn is_legal(from: RabbitState, to: RabbitState) -> bool {
    use RabbitState::*;
    matches!(
        (from, to),
        (Idle, Playing)
            | (Playing, Idle)
            | (Idle, Asleep)
            | (Asleep, Idle)
            | (Idle, Interactive)
            | (Interactive, Idle)
            | (Interactive, Playing)
            | (Playing, Interactive)
            | (Idle, Recording)
            | (Recording, Idle)
            | (Interactive, Recording)
            | (Recording, Interactive)
            | (Playing, Recording)
            | (Recording, Playing)
    )
}

/// The scheduler's view of the current state.
pub struct StateMachine {
    current: RabbitState,
}

impl StateMachine {
    pub fn new() -> Self {
        Self { current: RabbitState::Idle }
    }

    pub fn current(&self) -> RabbitState {
        self.current
    }

    /// Move to `to`. Returns the new state if this was an actual change
    /// (the caller broadcasts it), `None` when already there.
    pub fn transition(&mut self, to: RabbitState) -> Option<RabbitState> {
        if self.current == to {
            return None;
        }
        debug_assert!(
            is_legal(self.current, to),
            "illegal state transition {} -> {}",
            self.current,
            to
        );
        debug!("state {} -> {}", self.current, to);
        self.current = to;
        Some(to)
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
