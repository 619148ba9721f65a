//! # Backend seam.
//!
//! A [`Backend`] knows how to launch one attempt of a workload; the returned
//! [`Attempt`] owns the child (process, or container + task) until `cleanup`.
//! The lifecycle driver owns everything else: restart policy, backoff, stop
//! handling and the log sink.

use std::fmt;

use async_trait::async_trait;
use nix::sys::signal::Signal;

use crate::error::{AttemptError, RunnerError};
use crate::logsink::LogSink;

/// Terminal status of one attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitStatus {
    /// The child exited with a code.
    Code(i32),
    /// The child was terminated by a signal.
    Signal(i32),
}

impl ExitStatus {
    /// Only exit code 0 counts as success.
    #[inline]
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Code(0))
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Code(code) => write!(f, "exit code {code}"),
            ExitStatus::Signal(sig) => write!(f, "signal {sig}"),
        }
    }
}

/// Launches attempts of one workload.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Rejects configurations this backend cannot run. Called before the log file is opened.
    fn validate(&self) -> Result<(), RunnerError> {
        Ok(())
    }

    /// Spawns attempt number `attempt` (1-based) with stdout/stderr bound to `sink`.
    async fn spawn(&self, attempt: u32, sink: &LogSink) -> Result<Box<dyn Attempt>, AttemptError>;
}

/// One running child.
#[async_trait]
pub trait Attempt: Send {
    /// Waits for the child to exit. Must be cancel-safe: dropping the future
    /// and calling `wait` again resumes waiting.
    async fn wait(&mut self) -> Result<ExitStatus, AttemptError>;

    /// Delivers `signal` to the child. A child that is already gone is not an error.
    async fn signal(&mut self, signal: Signal) -> Result<(), AttemptError>;

    /// Releases every resource of the attempt. Called exactly once, after the child exited.
    async fn cleanup(self: Box<Self>) -> Result<(), AttemptError>;
}
