//! # Lifecycle events emitted by runners.
//!
//! The [`EventKind`] enum classifies what happened; the [`Event`] struct carries
//! metadata such as timestamps, runner id, attempt number, exit status and delays.
//!
//! ## Ordering guarantees
//! Each event has a globally unique sequence number (`seq`) that increases monotonically.
//!
//! ## Example
//! ```rust
//! use std::time::Duration;
//! use runvisor::{Event, EventKind};
//!
//! let ev = Event::new(EventKind::BackoffScheduled)
//!     .with_runner("udevd")
//!     .with_attempt(3)
//!     .with_delay(Duration::from_millis(100));
//!
//! assert_eq!(ev.kind, EventKind::BackoffScheduled);
//! assert_eq!(ev.runner.as_deref(), Some("udevd"));
//! assert_eq!(ev.delay_ms, Some(100));
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, SystemTime};

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of runner events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // === Subscriber events ===
    /// Subscriber panicked during event processing.
    ///
    /// Sets `runner` (subscriber name) and `reason` (panic message).
    SubscriberPanicked,

    /// Subscriber dropped an event (queue full or worker closed).
    ///
    /// Sets `runner` (subscriber name) and `reason`.
    SubscriberOverflow,

    // === Runner lifecycle ===
    /// `run` entered the running state.
    ///
    /// Sets `runner` and `reason` (restart policy label).
    RunStarting,

    /// A new attempt is about to be spawned.
    ///
    /// Sets `runner` and `attempt` (1-based).
    AttemptStarting,

    /// The child of an attempt exited on its own.
    ///
    /// Sets `runner`, `attempt` and `exit` (human-readable status).
    AttemptExited,

    /// The attempt could not be spawned.
    ///
    /// Sets `runner`, `attempt` and `reason`.
    AttemptFailed,

    /// Next attempt scheduled after `delay_ms`.
    ///
    /// Sets `runner`, `attempt` (previous attempt) and `delay_ms`.
    BackoffScheduled,

    // === Shutdown ===
    /// `stop` was requested while the runner was active.
    StopRequested,

    /// Polite termination (SIGTERM) delivered to the child.
    ///
    /// Sets `runner`, `attempt` and `timeout_ms` (grace window).
    TerminateSent,

    /// The grace window elapsed; the child was force-killed (SIGKILL).
    ///
    /// Sets `runner`, `attempt` and `timeout_ms`.
    KillEscalated,

    /// Cleanup of an attempt failed.
    ///
    /// Sets `runner`, `attempt` and `reason`.
    TeardownFailed,

    /// `run` reached its terminal state.
    ///
    /// Sets `runner` and, on failure, `reason`.
    RunFinished,
}

/// Runner event with optional metadata.
#[derive(Clone, Debug)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,
    /// Event classification.
    pub kind: EventKind,
    /// Workload id of the runner (or subscriber name for subscriber events).
    pub runner: Option<Arc<str>>,
    /// Attempt count (starting from 1).
    pub attempt: Option<u32>,
    /// Exit status of the attempt, rendered.
    pub exit: Option<Arc<str>>,
    /// Grace window in milliseconds.
    pub timeout_ms: Option<u32>,
    /// Backoff delay before next attempt in milliseconds.
    pub delay_ms: Option<u32>,
    /// Human-readable reason (errors, policy, overflow details).
    pub reason: Option<Arc<str>>,
}

impl Event {
    /// Creates a new event of the given kind with current timestamp and next sequence number.
    pub fn new(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            runner: None,
            attempt: None,
            exit: None,
            timeout_ms: None,
            delay_ms: None,
            reason: None,
        }
    }

    /// Attaches the runner id.
    #[inline]
    pub fn with_runner(mut self, id: impl Into<Arc<str>>) -> Self {
        self.runner = Some(id.into());
        self
    }

    /// Attaches an attempt count.
    #[inline]
    pub fn with_attempt(mut self, n: u32) -> Self {
        self.attempt = Some(n);
        self
    }

    /// Attaches a rendered exit status.
    #[inline]
    pub fn with_exit(mut self, exit: impl ToString) -> Self {
        self.exit = Some(exit.to_string().into());
        self
    }

    /// Attaches a human-readable reason.
    #[inline]
    pub fn with_reason(mut self, reason: impl Into<Arc<str>>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attaches a grace window (stored as milliseconds).
    #[inline]
    pub fn with_timeout(mut self, d: Duration) -> Self {
        self.timeout_ms = Some(millis(d));
        self
    }

    /// Attaches a backoff delay (stored as milliseconds).
    #[inline]
    pub fn with_delay(mut self, d: Duration) -> Self {
        self.delay_ms = Some(millis(d));
        self
    }

    /// Creates a subscriber overflow event.
    #[inline]
    pub fn subscriber_overflow(subscriber: &'static str, reason: &'static str) -> Self {
        Event::new(EventKind::SubscriberOverflow)
            .with_runner(subscriber)
            .with_reason(format!("subscriber={subscriber} reason={reason}"))
    }

    /// Creates a subscriber panic event.
    #[inline]
    pub fn subscriber_panicked(subscriber: &'static str, info: String) -> Self {
        Event::new(EventKind::SubscriberPanicked)
            .with_runner(subscriber)
            .with_reason(info)
    }
}

fn millis(d: Duration) -> u32 {
    d.as_millis().min(u128::from(u32::MAX)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_increase() {
        let a = Event::new(EventKind::AttemptStarting);
        let b = Event::new(EventKind::AttemptStarting);
        assert!(b.seq > a.seq);
    }

    #[test]
    fn durations_saturate_at_u32() {
        let ev = Event::new(EventKind::TerminateSent).with_timeout(Duration::from_secs(u64::MAX));
        assert_eq!(ev.timeout_ms, Some(u32::MAX));
    }
}
