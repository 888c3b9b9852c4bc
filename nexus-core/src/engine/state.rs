//! Engine lifecycle state and the atomic cell that carries it.
//!
//! One [`StateCell`] is created by the owner of a lifecycle (the
//! [`Engine`](super::Engine), or a standalone worker pool) and shared with
//! every worker thread.  Transitions are compare-and-swap so that concurrent
//! `start`/`stop`/`pause`/`resume` callers cannot both win.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of an engine or worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum EngineState {
    /// No workers are running; configuration may change.
    Stopped = 0,
    /// Workers are pulling and executing tasks.
    Running = 1,
    /// Workers are alive but do not pull new tasks.
    Paused = 2,
    /// An unrecoverable fault occurred; only `reset()` leaves this state.
    Error = 3,
}

impl EngineState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Stopped,
            1 => Self::Running,
            2 => Self::Paused,
            _ => Self::Error,
        }
    }

    /// Whether new submissions are accepted in this state.
    ///
    /// Paused engines still queue work; it is dispatched on `resume()`.
    pub fn accepts_work(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    /// Whether worker threads must leave their loop.
    pub(crate) fn is_terminal_for_workers(self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Atomic holder for an [`EngineState`].
///
/// Stores use `Release`, loads use `Acquire`, so a worker that observes a
/// transition also observes everything the transitioning thread wrote first.
#[derive(Debug)]
pub struct StateCell {
    raw: AtomicU8,
}

impl StateCell {
    /// Create a cell in the `Stopped` state.
    pub fn new() -> Self {
        Self {
            raw: AtomicU8::new(EngineState::Stopped as u8),
        }
    }

    /// Current state.
    pub fn load(&self) -> EngineState {
        EngineState::from_u8(self.raw.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`; returns `false` if the cell held something else.
    pub fn transition(&self, from: EngineState, to: EngineState) -> bool {
        self.raw
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Unconditionally enter `state`, returning the previous one.
    pub fn force(&self, state: EngineState) -> EngineState {
        EngineState::from_u8(self.raw.swap(state as u8, Ordering::AcqRel))
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_initial_state_is_stopped() {
        let cell = StateCell::new();
        assert_eq!(cell.load(), EngineState::Stopped);
    }

    #[test]
    fn test_transition_requires_expected_state() {
        let cell = StateCell::new();
        assert!(!cell.transition(EngineState::Running, EngineState::Paused));
        assert!(cell.transition(EngineState::Stopped, EngineState::Running));
        assert!(cell.transition(EngineState::Running, EngineState::Paused));
        assert_eq!(cell.load(), EngineState::Paused);
    }

    #[test]
    fn test_force_returns_previous() {
        let cell = StateCell::new();
        assert_eq!(cell.force(EngineState::Error), EngineState::Stopped);
        assert_eq!(cell.load(), EngineState::Error);
    }

    #[test]
    fn test_concurrent_start_has_single_winner() {
        let cell = Arc::new(StateCell::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cell = cell.clone();
                std::thread::spawn(move || {
                    cell.transition(EngineState::Stopped, EngineState::Running)
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().expect("thread panicked"))
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_display_and_accepts_work() {
        assert_eq!(EngineState::Paused.to_string(), "paused");
        assert!(EngineState::Running.accepts_work());
        assert!(EngineState::Paused.accepts_work());
        assert!(!EngineState::Stopped.accepts_work());
        assert!(!EngineState::Error.accepts_work());
    }
}
