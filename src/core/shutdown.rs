//! # Bounded-time termination of one attempt.
//!
//! ```text
//! SIGTERM ──► wait(grace) ──► exited      → status
//!                        └──► elapsed     → SIGKILL ──► wait → status
//! ```
//!
//! A failed SIGTERM delivery skips the grace window and escalates immediately.

use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::time;

use crate::core::backend::{Attempt, ExitStatus};
use crate::error::AttemptError;
use crate::events::{Bus, Event, EventKind};

/// Terminates `child` politely, escalating to SIGKILL after `grace`, and reaps it.
pub(crate) async fn terminate(
    child: &mut dyn Attempt,
    grace: Duration,
    bus: &Bus,
    id: &str,
    attempt: u32,
) -> Result<ExitStatus, AttemptError> {
    match child.signal(Signal::SIGTERM).await {
        Ok(()) => {
            bus.publish(
                Event::new(EventKind::TerminateSent)
                    .with_runner(id)
                    .with_attempt(attempt)
                    .with_timeout(grace),
            );
            if let Ok(res) = time::timeout(grace, child.wait()).await {
                return res;
            }
        }
        Err(e) => {
            tracing::warn!(runner = id, attempt, error = %e, "SIGTERM failed, escalating");
        }
    }

    bus.publish(
        Event::new(EventKind::KillEscalated)
            .with_runner(id)
            .with_attempt(attempt)
            .with_timeout(grace),
    );
    child.signal(Signal::SIGKILL).await?;
    child.wait().await
}
