//! Error types used by the runners and the image import pipeline.
//!
//! - [`RunnerError`]: terminal failure of [`Runner::run`](crate::Runner::run) or
//!   [`Runner::stop`](crate::Runner::stop).
//! - [`AttemptError`]: failure of one spawn attempt inside a backend; the lifecycle
//!   driver decides whether it is absorbed by the restart loop or surfaced.
//! - [`ImportError`]: aggregated failure of an image import batch.
//!
//! Every enum offers `as_label` (stable snake_case label for logs).

use std::path::PathBuf;

use thiserror::Error;

use crate::core::ExitStatus;

/// # Errors returned by a runner.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RunnerError {
    /// Invalid [`Args`](crate::Args) or options missing for the chosen backend.
    #[error("invalid configuration: {reason}")]
    Config {
        /// What is wrong.
        reason: String,
    },

    /// The workload log file could not be created or opened.
    #[error("failed to open log file {path:?}: {source}")]
    LogSetup {
        /// Path of the log file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The child could not be launched.
    #[error("failed to spawn {id}: {source}")]
    Spawn {
        /// Workload id.
        id: String,
        /// Backend failure.
        #[source]
        source: AttemptError,
    },

    /// The child ran and exited unsuccessfully.
    #[error("{id} exited with {status}")]
    ExitFailure {
        /// Workload id.
        id: String,
        /// Terminal status of the child.
        status: ExitStatus,
    },

    /// Post-run cleanup failed; the child's resources may still exist.
    #[error("teardown of {id} failed: {source}{}", prior_suffix(.prior))]
    Teardown {
        /// Workload id.
        id: String,
        /// Cleanup failure.
        #[source]
        source: AttemptError,
        /// Error the attempt ended with before teardown, if any.
        prior: Option<Box<RunnerError>>,
    },

    /// `run` was invoked on a runner that already ran.
    #[error("runner {id} was already started")]
    AlreadyStarted {
        /// Workload id.
        id: String,
    },
}

fn prior_suffix(prior: &Option<Box<RunnerError>>) -> String {
    match prior {
        Some(err) => format!(" (after: {err})"),
        None => String::new(),
    }
}

impl RunnerError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            RunnerError::Config { .. } => "runner_config",
            RunnerError::LogSetup { .. } => "runner_log_setup",
            RunnerError::Spawn { .. } => "runner_spawn",
            RunnerError::ExitFailure { .. } => "runner_exit_failure",
            RunnerError::Teardown { .. } => "runner_teardown",
            RunnerError::AlreadyStarted { .. } => "runner_already_started",
        }
    }

    pub(crate) fn config(reason: impl Into<String>) -> Self {
        RunnerError::Config {
            reason: reason.into(),
        }
    }
}

/// # Errors produced by a backend while driving one attempt.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum AttemptError {
    /// Launching the child failed (exec error, container/task create or start).
    #[error("spawn: {reason}")]
    Spawn {
        /// Failure details.
        reason: String,
    },

    /// Waiting for the child failed.
    #[error("wait: {reason}")]
    Wait {
        /// Failure details.
        reason: String,
    },

    /// Delivering a signal failed.
    #[error("signal: {reason}")]
    Signal {
        /// Failure details.
        reason: String,
    },

    /// Releasing the attempt's resources failed.
    #[error("cleanup: {reason}")]
    Cleanup {
        /// Failure details.
        reason: String,
    },
}

impl AttemptError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            AttemptError::Spawn { .. } => "attempt_spawn",
            AttemptError::Wait { .. } => "attempt_wait",
            AttemptError::Signal { .. } => "attempt_signal",
            AttemptError::Cleanup { .. } => "attempt_cleanup",
        }
    }

    pub(crate) fn spawn(reason: impl ToString) -> Self {
        AttemptError::Spawn {
            reason: reason.to_string(),
        }
    }

    pub(crate) fn wait(reason: impl ToString) -> Self {
        AttemptError::Wait {
            reason: reason.to_string(),
        }
    }

    pub(crate) fn signal(reason: impl ToString) -> Self {
        AttemptError::Signal {
            reason: reason.to_string(),
        }
    }

    pub(crate) fn cleanup(reason: impl ToString) -> Self {
        AttemptError::Cleanup {
            reason: reason.to_string(),
        }
    }
}

/// # Failure of an image import batch.
///
/// Every request of the batch is attempted; this error lists all that failed.
#[derive(Error, Debug)]
#[error("{} of {total} image import(s) failed: {}", failures.len(), summary(.failures))]
pub struct ImportError {
    /// Number of requests in the batch.
    pub total: usize,
    /// One entry per failed request, in request order.
    pub failures: Vec<ImportFailure>,
}

/// A single failed import request.
#[derive(Debug)]
pub struct ImportFailure {
    /// Archive path of the request.
    pub path: PathBuf,
    /// Why it failed.
    pub reason: String,
}

fn summary(failures: &[ImportFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.path.display(), f.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

impl ImportError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        "image_import_failed"
    }
}
