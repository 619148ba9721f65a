//! # Runner contract.
//!
//! A [`Runner`] supervises one workload:
//! - `run` blocks until the workload is finished per its restart policy, or until
//!   `stop` is observed and teardown completed;
//! - `stop` may be called from any task at any time, also before `run` or after it
//!   returned, and returns once the runner is terminal.
//!
//! [`ServiceRunner`] picks a backend at construction: a host process, or a
//! containerd task when [`Options::container_image`](crate::Options::container_image)
//! is set.

use async_trait::async_trait;

use crate::args::Args;
use crate::config::Options;
use crate::containerd::ContainerRunner;
use crate::core::RunState;
use crate::error::RunnerError;
use crate::events::Bus;
use crate::process::ProcessRunner;

/// Supervisor of one workload.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Workload id.
    fn id(&self) -> &str;

    /// Runs the workload to completion or until stopped.
    async fn run(&self) -> Result<(), RunnerError>;

    /// Stops the workload and waits for teardown.
    async fn stop(&self) -> Result<(), RunnerError>;
}

/// Runner over either backend.
pub enum ServiceRunner {
    /// Host process.
    Process(ProcessRunner),
    /// containerd task.
    Container(ContainerRunner),
}

impl ServiceRunner {
    /// Builds a container runner when an image is configured, a process runner otherwise.
    pub fn new(args: Args, opts: Options) -> Self {
        if opts.container_image().is_some() {
            ServiceRunner::Container(ContainerRunner::new(args, opts))
        } else {
            ServiceRunner::Process(ProcessRunner::new(args, opts))
        }
    }

    /// Current state.
    pub fn state(&self) -> RunState {
        match self {
            ServiceRunner::Process(r) => r.state(),
            ServiceRunner::Container(r) => r.state(),
        }
    }

    /// Lifecycle event bus.
    pub fn bus(&self) -> &Bus {
        match self {
            ServiceRunner::Process(r) => r.bus(),
            ServiceRunner::Container(r) => r.bus(),
        }
    }
}

#[async_trait]
impl Runner for ServiceRunner {
    fn id(&self) -> &str {
        match self {
            ServiceRunner::Process(r) => r.id(),
            ServiceRunner::Container(r) => r.id(),
        }
    }

    async fn run(&self) -> Result<(), RunnerError> {
        match self {
            ServiceRunner::Process(r) => r.run().await,
            ServiceRunner::Container(r) => r.run().await,
        }
    }

    async fn stop(&self) -> Result<(), RunnerError> {
        match self {
            ServiceRunner::Process(r) => r.stop().await,
            ServiceRunner::Container(r) => r.stop().await,
        }
    }
}
