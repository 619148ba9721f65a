//! # runvisor
//!
//! **Runvisor** runs the services of a minimal host init: each service is a long-lived
//! workload executed either as a native process or as a containerd task, with its
//! output appended to `<log_path>/<id>.log`.
//!
//! A [`Runner`] owns one workload. `run` drives it through restarts until the
//! [`RestartPolicy`] finishes it or `stop` is observed; `stop` terminates it politely
//! (SIGTERM), escalates to SIGKILL after the grace window, and waits for teardown.
//!
//! ## Architecture
//! ```text
//!      Args + Options
//!            │
//!            ▼
//!  ┌───────────────────┐        ┌─────────────────────────────┐
//!  │   ServiceRunner   │        │ Lifecycle (core)            │
//!  │  ├ ProcessRunner ─┼──────► │ - restart policy + interval │
//!  │  └ ContainerRunner┼──────► │ - cancellation token        │
//!  └───────────────────┘        │ - log sink                  │
//!                               │ - state (watch)             │
//!                               └──────┬───────────────┬──────┘
//!                              Backend │               │ publish
//!                   ┌──────────────────┴───┐           ▼
//!                   ▼                      ▼          Bus ──► SubscriberSet ──► LogWriter
//!          ProcessBackend          ContainerBackend
//!        (fork/exec, pgroup)     (containerd gRPC, FIFOs)
//! ```
//!
//! ### Lifecycle
//! ```text
//! run() ─► validate ─► open log ─► loop {
//!   spawn attempt ─► select { exit, stop }
//!     ├─ stop ─► SIGTERM ─► grace ─► SIGKILL ─► cleanup ─► Ok
//!     └─ exit ─► cleanup ─► policy.decide(success)
//!                  ├─ Finish  ─► return outcome
//!                  └─ Restart ─► sleep(restart_interval) | stop ─► Ok
//! }
//! ```
//!
//! ## Features
//! | Area            | Description                                              | Key types / traits                           |
//! |-----------------|----------------------------------------------------------|----------------------------------------------|
//! | **Runners**     | Supervise one workload with run/stop semantics.          | [`Runner`], [`ServiceRunner`]                |
//! | **Backends**    | Host processes and containerd tasks.                     | [`ProcessRunner`], [`ContainerRunner`]       |
//! | **Policies**    | When to respawn.                                         | [`RestartPolicy`]                            |
//! | **Images**      | Load OCI layout archives into containerd.                | [`import`], [`ImportRequest`]                |
//! | **Events**      | Lifecycle events fanned out to subscribers.              | [`Event`], [`Subscribe`], [`LogWriter`]      |
//! | **Errors**      | Typed errors for runs, attempts and imports.             | [`RunnerError`], [`ImportError`]             |
//! | **Configuration** | Workload identity and supervision options.             | [`Args`], [`Options`]                        |
//!
//! ## Example
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use runvisor::{Args, Options, RestartPolicy, Runner, ServiceRunner};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let opts = Options::default()
//!         .with_type(RestartPolicy::Forever)
//!         .with_restart_interval(Duration::from_millis(500));
//!     let runner = Arc::new(ServiceRunner::new(
//!         Args::new("getty", ["/sbin/agetty", "ttyS0"]),
//!         opts,
//!     ));
//!
//!     let r = Arc::clone(&runner);
//!     let service = tokio::spawn(async move { r.run().await });
//!
//!     tokio::time::sleep(Duration::from_secs(60)).await;
//!     runner.stop().await?;
//!     service.await??;
//!     Ok(())
//! }
//! ```
mod args;
mod config;
mod containerd;
mod core;
mod error;
mod events;
mod logsink;
mod policies;
mod process;
mod runner;
mod subscribers;

// ---- Public re-exports ----

pub use crate::core::{Attempt, Backend, ExitStatus, Lifecycle, RunState};
pub use args::Args;
pub use config::{DEFAULT_LOG_PATH, DEFAULT_NAMESPACE, Options};
pub use containerd::{
    ClientError, ContainerRecord, ContainerRunner, ContainerRuntime, Containerd,
    ContentDescriptor, ContentStream, DEFAULT_RUNTIME, DEFAULT_SNAPSHOTTER, DEFAULT_SOCKET,
    ImageDefaults, ImageRecord, ImportOption, ImportRequest, OciSpecOpt, ResolvedImage,
    RootfsMount, SPEC_TYPE_URL, SpecFn, TaskIo, chain_id, import, import_with, resolve,
    shared_client,
};
pub use error::{AttemptError, ImportError, ImportFailure, RunnerError};
pub use events::{Bus, Event, EventKind};
pub use logsink::LogSink;
pub use policies::{Decision, RestartPolicy};
pub use process::{DEFAULT_PATH, ProcessRunner};
pub use runner::{Runner, ServiceRunner};
pub use subscribers::{LogWriter, Subscribe, SubscriberSet};
