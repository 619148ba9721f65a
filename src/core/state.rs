//! # Runner state machine.
//!
//! `Done` is absorbing. Transitions are published through a `tokio::sync::watch`
//! channel so `stop` can wait for the terminal state from any task.

/// Observable state of a runner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    /// Constructed, `run` not yet called.
    Idle,
    /// An attempt is being spawned or is running.
    Running,
    /// Waiting out the restart interval.
    Backoff,
    /// Stop requested; the child is being terminated.
    Stopping,
    /// Terminal.
    Done,
}

impl RunState {
    /// Whether the state is terminal.
    #[inline]
    pub fn is_done(&self) -> bool {
        matches!(self, RunState::Done)
    }
}
