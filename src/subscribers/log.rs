//! # LogWriter: lifecycle events as `tracing` records
//!
//! The default subscriber of every runner. Each [`Event`] becomes one `tracing`
//! record with structured fields, so the host's subscriber decides formatting.
//!
//! ## Example output (fmt subscriber)
//! ```text
//! INFO runvisor: attempt starting runner="udevd" attempt=1
//! WARN runvisor: attempt exited runner="udevd" attempt=1 exit="exit code 1"
//! INFO runvisor: restart scheduled runner="udevd" attempt=1 delay_ms=100
//! WARN runvisor: grace window elapsed, killing runner="udevd" attempt=2 timeout_ms=10000
//! ```

use async_trait::async_trait;

use crate::events::{Event, EventKind};
use crate::subscribers::Subscribe;

/// Event writer subscriber backed by `tracing`.
#[derive(Default)]
pub struct LogWriter;

impl LogWriter {
    /// Construct a new [`LogWriter`].
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Subscribe for LogWriter {
    async fn on_event(&self, e: &Event) {
        let runner = e.runner.as_deref().unwrap_or("-");
        let reason = e.reason.as_deref().unwrap_or("");
        match e.kind {
            EventKind::RunStarting => {
                tracing::info!(target: "runvisor", runner, policy = reason, "run starting");
            }
            EventKind::AttemptStarting => {
                tracing::info!(target: "runvisor", runner, attempt = e.attempt, "attempt starting");
            }
            EventKind::AttemptExited => {
                let exit = e.exit.as_deref().unwrap_or("unknown");
                if exit == "exit code 0" {
                    tracing::info!(target: "runvisor", runner, attempt = e.attempt, exit, "attempt exited");
                } else {
                    tracing::warn!(target: "runvisor", runner, attempt = e.attempt, exit, "attempt exited");
                }
            }
            EventKind::AttemptFailed => {
                tracing::warn!(target: "runvisor", runner, attempt = e.attempt, error = reason, "attempt failed to spawn");
            }
            EventKind::BackoffScheduled => {
                tracing::info!(target: "runvisor", runner, attempt = e.attempt, delay_ms = e.delay_ms, "restart scheduled");
            }
            EventKind::StopRequested => {
                tracing::info!(target: "runvisor", runner, "stop requested");
            }
            EventKind::TerminateSent => {
                tracing::debug!(target: "runvisor", runner, attempt = e.attempt, timeout_ms = e.timeout_ms, "sent SIGTERM");
            }
            EventKind::KillEscalated => {
                tracing::warn!(target: "runvisor", runner, attempt = e.attempt, timeout_ms = e.timeout_ms, "grace window elapsed, killing");
            }
            EventKind::TeardownFailed => {
                tracing::error!(target: "runvisor", runner, attempt = e.attempt, error = reason, "teardown failed");
            }
            EventKind::RunFinished => {
                if reason.is_empty() {
                    tracing::info!(target: "runvisor", runner, "run finished");
                } else {
                    tracing::error!(target: "runvisor", runner, error = reason, "run finished with error");
                }
            }
            EventKind::SubscriberOverflow => {
                tracing::warn!(target: "runvisor", subscriber = runner, reason, "subscriber dropped event");
            }
            EventKind::SubscriberPanicked => {
                tracing::error!(target: "runvisor", subscriber = runner, info = reason, "subscriber panicked");
            }
        }
    }

    fn name(&self) -> &'static str {
        "LogWriter"
    }
}
