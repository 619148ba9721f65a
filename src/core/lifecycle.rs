//! # Lifecycle: single-workload supervisor.
//!
//! Drives one workload through its [`Backend`] with:
//! - restarts per [`RestartPolicy`](crate::RestartPolicy),
//! - a fixed, cancellable restart interval,
//! - bounded-time termination on `stop` (see [`shutdown`](super::shutdown)),
//! - one log file for all attempts.
//!
//! ## Architecture
//! ```text
//! run() ──► validate ──► open log sink
//!
//! loop {
//!   ├─► token cancelled?                 → done (Ok)
//!   ├─► publish AttemptStarting
//!   ├─► backend.spawn(attempt, sink)
//!   │       ├─ Err ─► note in log, outcome = Spawn error
//!   │       └─ Ok  ─► select { child.wait(), token.cancelled() }
//!   │                    ├─ cancelled ─► terminate ─► cleanup ─► done (Ok)
//!   │                    └─ exited    ─► cleanup ─► outcome = exit status
//!   ├─► policy.decide(outcome)
//!   │     ├─ Finish  → done (outcome)
//!   │     └─ Restart → publish BackoffScheduled, sleep(interval) | cancelled → done (Ok)
//! }
//! ```
//!
//! ## Rules
//! - Attempts run **sequentially** (never concurrent for one runner).
//! - Every suspension point selects against the runner's single [`CancellationToken`].
//! - Cleanup runs for every spawned attempt, whatever the path out of it.
//! - A teardown failure is fatal and is never masked by a restart.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::{select, sync::watch, task::JoinHandle, time};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::args::Args;
use crate::config::Options;
use crate::core::backend::{Attempt, Backend, ExitStatus};
use crate::core::shutdown;
use crate::core::state::RunState;
use crate::error::{AttemptError, RunnerError};
use crate::events::{Bus, Event, EventKind};
use crate::logsink::LogSink;
use crate::policies::Decision;
use crate::subscribers::SubscriberSet;

/// How one attempt ended.
enum AttemptEnd {
    /// Stop was requested and the child was torn down.
    Stopped,
    /// The child exited on its own and was cleaned up.
    Exited(ExitStatus),
    /// Waiting on the child failed; it was killed and cleaned up.
    Lost(AttemptError),
}

/// Supervises one workload with a given backend.
///
/// A `Lifecycle` is single-use: `run` drives it to [`RunState::Done`] once; `stop`
/// may be called from any task, any number of times.
pub struct Lifecycle<B: Backend> {
    args: Args,
    opts: Options,
    backend: B,
    bus: Bus,
    token: CancellationToken,
    state: watch::Sender<RunState>,
    stopped_before_start: AtomicBool,
    teardown_failure: Mutex<Option<String>>,
}

impl<B: Backend> Lifecycle<B> {
    /// Creates an idle lifecycle.
    pub fn new(args: Args, opts: Options, backend: B) -> Self {
        let bus = Bus::new(opts.bus_capacity_clamped());
        Self {
            args,
            opts,
            backend,
            bus,
            token: CancellationToken::new(),
            state: watch::channel(RunState::Idle).0,
            stopped_before_start: AtomicBool::new(false),
            teardown_failure: Mutex::new(None),
        }
    }

    /// Workload id.
    pub fn id(&self) -> &str {
        &self.args.id
    }

    /// Current state.
    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// Event bus of this runner; receivers see events published after subscribing.
    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Runs the workload until the policy finishes it or `stop` is called.
    pub async fn run(&self) -> Result<(), RunnerError> {
        let mut started = false;
        self.state.send_if_modified(|s| {
            if *s == RunState::Idle {
                *s = RunState::Running;
                started = true;
                true
            } else {
                false
            }
        });
        if !started {
            if self.stopped_before_start.load(Ordering::Acquire) {
                return Ok(());
            }
            return Err(RunnerError::AlreadyStarted {
                id: self.args.id.clone(),
            });
        }

        let done = DoneGuard { state: &self.state };
        let listener = Listener::start(&self.bus, &self.opts);

        self.bus.publish(
            Event::new(EventKind::RunStarting)
                .with_runner(self.id())
                .with_reason(self.opts.restart.as_label()),
        );
        let res = self.drive().await;

        if let Err(RunnerError::Teardown { source, .. }) = &res {
            if let Ok(mut slot) = self.teardown_failure.lock() {
                *slot = Some(source.to_string());
            }
        }
        let mut finished = Event::new(EventKind::RunFinished).with_runner(self.id());
        if let Err(e) = &res {
            finished = finished.with_reason(e.to_string());
        }
        self.bus.publish(finished);

        listener.finish().await;
        drop(done);
        res
    }

    /// Requests shutdown and waits until the runner is terminal.
    ///
    /// - idle → done immediately (a later `run` returns `Ok` without spawning);
    /// - running/backoff → cancels the token, waits for teardown;
    /// - done → no-op.
    ///
    /// Returns an error only if the teardown it waited for failed. All callers
    /// that waited on the same teardown get the same error.
    pub async fn stop(&self) -> Result<(), RunnerError> {
        let mut was_idle = false;
        self.state.send_if_modified(|s| {
            if *s == RunState::Idle {
                *s = RunState::Done;
                self.stopped_before_start.store(true, Ordering::Release);
                was_idle = true;
                true
            } else {
                false
            }
        });
        if was_idle {
            self.token.cancel();
            return Ok(());
        }
        if self.state().is_done() {
            return Ok(());
        }

        if !self.token.is_cancelled() {
            self.bus
                .publish(Event::new(EventKind::StopRequested).with_runner(self.id()));
            self.token.cancel();
        }

        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        rx.wait_for(RunState::is_done).await.ok();

        // Every caller that waited sees the failure; it is never consumed.
        let failure = self
            .teardown_failure
            .lock()
            .ok()
            .and_then(|slot| slot.clone());
        match failure {
            Some(reason) => Err(RunnerError::Teardown {
                id: self.args.id.clone(),
                source: AttemptError::Cleanup { reason },
                prior: None,
            }),
            None => Ok(()),
        }
    }

    async fn drive(&self) -> Result<(), RunnerError> {
        self.args.validate()?;
        self.backend.validate()?;

        let mut sink = LogSink::new(&self.opts.log_path, &self.args.id);
        sink.open()?;
        let res = self.supervise(&sink).await;
        sink.close();
        res
    }

    async fn supervise(&self, sink: &LogSink) -> Result<(), RunnerError> {
        let id = self.id();
        let mut attempt: u32 = 0;

        loop {
            if self.token.is_cancelled() {
                return Ok(());
            }
            attempt = attempt.saturating_add(1);
            self.set_state(RunState::Running);
            self.bus.publish(
                Event::new(EventKind::AttemptStarting)
                    .with_runner(id)
                    .with_attempt(attempt),
            );

            let outcome = match self.backend.spawn(attempt, sink).await {
                Err(e) => {
                    self.bus.publish(
                        Event::new(EventKind::AttemptFailed)
                            .with_runner(id)
                            .with_attempt(attempt)
                            .with_reason(e.to_string()),
                    );
                    sink.note(&format!("attempt {attempt}: spawn failed: {e}"));
                    Err(RunnerError::Spawn {
                        id: id.to_string(),
                        source: e,
                    })
                }
                Ok(child) => match self.supervise_attempt(child, attempt).await? {
                    AttemptEnd::Stopped => return Ok(()),
                    AttemptEnd::Exited(status) => {
                        self.bus.publish(
                            Event::new(EventKind::AttemptExited)
                                .with_runner(id)
                                .with_attempt(attempt)
                                .with_exit(status),
                        );
                        if status.success() {
                            Ok(())
                        } else {
                            Err(RunnerError::ExitFailure {
                                id: id.to_string(),
                                status,
                            })
                        }
                    }
                    AttemptEnd::Lost(e) => {
                        self.bus.publish(
                            Event::new(EventKind::AttemptFailed)
                                .with_runner(id)
                                .with_attempt(attempt)
                                .with_reason(e.to_string()),
                        );
                        Err(RunnerError::Spawn {
                            id: id.to_string(),
                            source: e,
                        })
                    }
                },
            };

            if self.opts.restart.decide(outcome.is_ok()) == Decision::Finish {
                return outcome;
            }

            let delay = self.opts.restart_interval;
            self.set_state(RunState::Backoff);
            self.bus.publish(
                Event::new(EventKind::BackoffScheduled)
                    .with_runner(id)
                    .with_attempt(attempt)
                    .with_delay(delay),
            );
            select! {
                _ = time::sleep(delay) => {}
                _ = self.token.cancelled() => return Ok(()),
            }
        }
    }

    /// Waits for one spawned child, tears it down, and reports how it ended.
    async fn supervise_attempt(
        &self,
        mut child: Box<dyn Attempt>,
        attempt: u32,
    ) -> Result<AttemptEnd, RunnerError> {
        let id = self.id();
        let waited = select! {
            biased;
            _ = self.token.cancelled() => None,
            res = child.wait() => Some(res),
        };

        match waited {
            None => {
                self.set_state(RunState::Stopping);
                let grace = self.opts.graceful_shutdown_timeout;
                let terminated =
                    shutdown::terminate(child.as_mut(), grace, &self.bus, id, attempt).await;
                let cleaned = child.cleanup().await;
                match (terminated, cleaned) {
                    (_, Err(e)) | (Err(e), Ok(())) => Err(self.teardown_failed(attempt, e, None)),
                    (Ok(_), Ok(())) => Ok(AttemptEnd::Stopped),
                }
            }
            Some(Ok(status)) => match child.cleanup().await {
                Ok(()) => Ok(AttemptEnd::Exited(status)),
                Err(e) => {
                    let prior = (!status.success()).then(|| RunnerError::ExitFailure {
                        id: id.to_string(),
                        status,
                    });
                    Err(self.teardown_failed(attempt, e, prior))
                }
            },
            Some(Err(lost)) => {
                tracing::warn!(runner = id, attempt, error = %lost, "lost track of child, killing");
                let killed = child.signal(nix::sys::signal::Signal::SIGKILL).await;
                let cleaned = child.cleanup().await;
                match (killed, cleaned) {
                    (_, Err(e)) | (Err(e), Ok(())) => {
                        let prior = RunnerError::Spawn {
                            id: id.to_string(),
                            source: lost,
                        };
                        Err(self.teardown_failed(attempt, e, Some(prior)))
                    }
                    (Ok(()), Ok(())) => Ok(AttemptEnd::Lost(lost)),
                }
            }
        }
    }

    fn teardown_failed(
        &self,
        attempt: u32,
        source: AttemptError,
        prior: Option<RunnerError>,
    ) -> RunnerError {
        tracing::error!(runner = self.id(), attempt, error = %source, "teardown failed");
        self.bus.publish(
            Event::new(EventKind::TeardownFailed)
                .with_runner(self.id())
                .with_attempt(attempt)
                .with_reason(source.to_string()),
        );
        RunnerError::Teardown {
            id: self.args.id.clone(),
            source,
            prior: prior.map(Box::new),
        }
    }

    fn set_state(&self, next: RunState) {
        self.state.send_if_modified(|s| {
            if s.is_done() || *s == next {
                false
            } else {
                *s = next;
                true
            }
        });
    }
}

/// Forces `Done` when `run` returns or its future is dropped mid-flight.
struct DoneGuard<'a> {
    state: &'a watch::Sender<RunState>,
}

impl Drop for DoneGuard<'_> {
    fn drop(&mut self) {
        self.state.send_replace(RunState::Done);
    }
}

/// Forwards bus events to the configured subscribers for the duration of one run.
struct Listener {
    handle: JoinHandle<()>,
    _stop: DropGuard,
    stop: CancellationToken,
}

impl Listener {
    fn start(bus: &Bus, opts: &Options) -> Self {
        let set = SubscriberSet::new(opts.subscribers.clone(), bus.clone());
        let mut rx = bus.subscribe();
        let stop = CancellationToken::new();
        let stop_rx = stop.clone();

        let handle = tokio::spawn(async move {
            loop {
                select! {
                    biased;
                    ev = rx.recv() => match ev {
                        Ok(ev) => set.emit(&ev),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                    _ = stop_rx.cancelled() => {
                        while let Ok(ev) = rx.try_recv() {
                            set.emit(&ev);
                        }
                        break;
                    }
                }
            }
            set.shutdown().await;
        });

        Self {
            handle,
            _stop: stop.clone().drop_guard(),
            stop,
        }
    }

    /// Flushes pending events to subscribers and waits for them.
    async fn finish(self) {
        self.stop.cancel();
        let _ = self.handle.await;
    }
}
