//! # Container runner over containerd.
//!
//! Each attempt of a [`ContainerRunner`] goes through:
//! ```text
//! pre-cleanup(id) ─► resolve image ─► OCI spec ─► prepare snapshot
//!      ─► create container ─► FIFOs + copiers ─► create task ─► start task
//! ```
//! and is torn down (always, also after a natural exit) in reverse:
//! ```text
//! await exit ─► delete task ─► delete container ─► remove snapshot ─► drain FIFOs
//! ```
//! Pre-cleanup removes whatever a crashed predecessor left under the same id
//! (task, container, snapshot); absence is success.
//!
//! The image must already be in the namespace; runners never pull.

mod client;
mod image;
mod import;
mod io;
mod runtime;
mod spec;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use tokio::time;

pub use client::{Containerd, DEFAULT_SOCKET, SPEC_TYPE_URL, shared_client};
pub use image::{ImageDefaults, ResolvedImage, chain_id, resolve};
pub use import::{ImportOption, ImportRequest, import, import_with};
pub use runtime::{
    ClientError, ContainerRecord, ContainerRuntime, ContentDescriptor, ContentStream, ImageRecord,
    RootfsMount, TaskIo,
};
pub use spec::{OciSpecOpt, SpecFn};

use self::io::FifoSet;
use self::runtime::ignore_not_found;
use crate::args::Args;
use crate::config::Options;
use crate::core::{Attempt, Backend, ExitStatus, Lifecycle, RunState};
use crate::error::{AttemptError, RunnerError};
use crate::events::Bus;
use crate::logsink::LogSink;
use crate::process::child_env;
use crate::runner::Runner;

/// Runtime handler of created containers.
pub const DEFAULT_RUNTIME: &str = "io.containerd.runc.v2";

/// Snapshotter of container root filesystems.
pub const DEFAULT_SNAPSHOTTER: &str = "overlayfs";

/// Upper bound on waiting for a leftover task to die during pre-cleanup.
const PRECLEANUP_WAIT: Duration = Duration::from_secs(5);

/// Runner for a workload executed as a containerd task.
pub struct ContainerRunner {
    inner: Lifecycle<ContainerBackend>,
}

impl ContainerRunner {
    /// Creates an idle runner using the shared client on [`DEFAULT_SOCKET`].
    pub fn new(args: Args, opts: Options) -> Self {
        let backend = ContainerBackend::new(&args, &opts, Source::Shared);
        Self {
            inner: Lifecycle::new(args, opts, backend),
        }
    }

    /// Creates an idle runner on an explicit runtime.
    pub fn with_runtime(args: Args, opts: Options, runtime: Arc<dyn ContainerRuntime>) -> Self {
        let backend = ContainerBackend::new(&args, &opts, Source::Given(runtime));
        Self {
            inner: Lifecycle::new(args, opts, backend),
        }
    }

    /// Current state.
    pub fn state(&self) -> RunState {
        self.inner.state()
    }

    /// Lifecycle event bus.
    pub fn bus(&self) -> &Bus {
        self.inner.bus()
    }
}

#[async_trait]
impl Runner for ContainerRunner {
    fn id(&self) -> &str {
        self.inner.id()
    }

    async fn run(&self) -> Result<(), RunnerError> {
        self.inner.run().await
    }

    async fn stop(&self) -> Result<(), RunnerError> {
        self.inner.stop().await
    }
}

enum Source {
    Shared,
    Given(Arc<dyn ContainerRuntime>),
}

/// Spawns containerd tasks.
pub(crate) struct ContainerBackend {
    source: Source,
    id: String,
    ns: String,
    image: Option<String>,
    argv: Vec<String>,
    env: Vec<(String, String)>,
    spec_opts: Vec<OciSpecOpt>,
}

impl ContainerBackend {
    fn new(args: &Args, opts: &Options, source: Source) -> Self {
        let mut env = child_env(args, opts);
        // The image decides PATH unless the caller set one.
        if !args.env.iter().chain(opts.env.iter()).any(|(k, _)| k == "PATH") {
            env.retain(|(k, _)| k != "PATH");
        }
        Self {
            source,
            id: args.id.clone(),
            ns: opts.namespace().to_string(),
            image: opts.container_image().map(str::to_string),
            argv: args.process_args.clone(),
            env,
            spec_opts: opts.oci_spec_opts.clone(),
        }
    }

    async fn runtime(&self) -> Result<Arc<dyn ContainerRuntime>, ClientError> {
        match &self.source {
            Source::Given(rt) => Ok(Arc::clone(rt)),
            Source::Shared => {
                let rt: Arc<dyn ContainerRuntime> = shared_client().await?;
                Ok(rt)
            }
        }
    }

    /// Removes task, container and snapshot left under this id.
    async fn precleanup(&self, rt: &dyn ContainerRuntime) -> Result<(), ClientError> {
        let (ns, id) = (self.ns.as_str(), self.id.as_str());
        match rt.kill_task(ns, id, Signal::SIGKILL as i32).await {
            Ok(()) => {
                tracing::info!(ns, id, "killing leftover task");
                match time::timeout(PRECLEANUP_WAIT, rt.wait_task(ns, id)).await {
                    Ok(res) => {
                        ignore_not_found(res.map(|_| ()))?;
                    }
                    Err(_) => tracing::warn!(ns, id, "leftover task did not exit in time"),
                }
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        ignore_not_found(rt.delete_task(ns, id).await)?;
        ignore_not_found(rt.delete_container(ns, id).await)?;
        ignore_not_found(rt.remove_snapshot(ns, DEFAULT_SNAPSHOTTER, id).await)?;
        Ok(())
    }

    /// Undoes a partially completed spawn; returns the first failure.
    async fn rollback(
        &self,
        rt: &dyn ContainerRuntime,
        fifos: Option<FifoSet>,
    ) -> Result<(), ClientError> {
        let (ns, id) = (self.ns.as_str(), self.id.as_str());
        let mut first = None;
        for res in [
            ignore_not_found(rt.delete_task(ns, id).await),
            ignore_not_found(rt.delete_container(ns, id).await),
            ignore_not_found(rt.remove_snapshot(ns, DEFAULT_SNAPSHOTTER, id).await),
        ] {
            if let Err(e) = res {
                first.get_or_insert(e);
            }
        }
        if let Some(fifos) = fifos {
            if let Err(e) = fifos.close().await {
                first.get_or_insert(e.into());
            }
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Backend for ContainerBackend {
    fn validate(&self) -> Result<(), RunnerError> {
        if self.image.is_none() {
            return Err(RunnerError::config(format!(
                "{}: container image is required",
                self.id
            )));
        }
        Ok(())
    }

    async fn spawn(&self, attempt: u32, sink: &LogSink) -> Result<Box<dyn Attempt>, AttemptError> {
        let (ns, id) = (self.ns.as_str(), self.id.as_str());
        let image = self
            .image
            .as_deref()
            .ok_or_else(|| AttemptError::spawn("no container image"))?;
        let rt = self.runtime().await.map_err(AttemptError::spawn)?;

        self.precleanup(rt.as_ref())
            .await
            .map_err(|e| AttemptError::spawn(format!("pre-cleanup: {e}")))?;

        let resolved = resolve(rt.as_ref(), ns, image)
            .await
            .map_err(|e| AttemptError::spawn(format!("image {image}: {e}")))?;
        let oci = spec::generate(&resolved.defaults, &self.argv, &self.env, &self.spec_opts)
            .map_err(AttemptError::spawn)?;

        let rootfs = rt
            .prepare_snapshot(ns, DEFAULT_SNAPSHOTTER, id, &resolved.chain_id)
            .await
            .map_err(|e| AttemptError::spawn(format!("prepare snapshot: {e}")))?;

        let record = ContainerRecord {
            id: id.to_string(),
            image: image.to_string(),
            runtime: DEFAULT_RUNTIME.to_string(),
            snapshotter: DEFAULT_SNAPSHOTTER.to_string(),
            snapshot_key: id.to_string(),
            spec: oci,
        };
        let mut fifos = None;
        let started = async {
            rt.create_container(ns, record)
                .await
                .map_err(|e| format!("create container: {e}"))?;
            let set = FifoSet::create(ns, id, attempt, sink).map_err(|e| format!("fifos: {e}"))?;
            let task_io = set.io().clone();
            fifos = Some(set);
            rt.create_task(ns, id, rootfs, &task_io)
                .await
                .map_err(|e| format!("create task: {e}"))?;
            rt.start_task(ns, id)
                .await
                .map_err(|e| format!("start task: {e}"))
        }
        .await;

        match started {
            Ok(pid) => {
                tracing::debug!(ns, id, attempt, pid, "task started");
                Ok(Box::new(ContainerAttempt {
                    rt,
                    ns: self.ns.clone(),
                    id: self.id.clone(),
                    fifos,
                    exited: None,
                }))
            }
            Err(reason) => match self.rollback(rt.as_ref(), fifos).await {
                Ok(()) => Err(AttemptError::spawn(reason)),
                Err(e) => Err(AttemptError::spawn(format!("{reason}; rollback: {e}"))),
            },
        }
    }
}

/// One started task.
struct ContainerAttempt {
    rt: Arc<dyn ContainerRuntime>,
    ns: String,
    id: String,
    fifos: Option<FifoSet>,
    exited: Option<ExitStatus>,
}

#[async_trait]
impl Attempt for ContainerAttempt {
    async fn wait(&mut self) -> Result<ExitStatus, AttemptError> {
        if let Some(status) = self.exited {
            return Ok(status);
        }
        let code = self
            .rt
            .wait_task(&self.ns, &self.id)
            .await
            .map_err(AttemptError::wait)?;
        let status = ExitStatus::Code(code as i32);
        self.exited = Some(status);
        Ok(status)
    }

    async fn signal(&mut self, signal: Signal) -> Result<(), AttemptError> {
        ignore_not_found(self.rt.kill_task(&self.ns, &self.id, signal as i32).await)
            .map_err(|e| AttemptError::signal(format!("{signal}: {e}")))
    }

    async fn cleanup(mut self: Box<Self>) -> Result<(), AttemptError> {
        let (ns, id) = (self.ns.clone(), self.id.clone());
        if self.exited.is_none() {
            match self.rt.wait_task(&ns, &id).await {
                Ok(code) => self.exited = Some(ExitStatus::Code(code as i32)),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(AttemptError::cleanup(format!("await exit: {e}"))),
            }
        }
        ignore_not_found(self.rt.delete_task(&ns, &id).await)
            .map_err(|e| AttemptError::cleanup(format!("delete task: {e}")))?;
        ignore_not_found(self.rt.delete_container(&ns, &id).await)
            .map_err(|e| AttemptError::cleanup(format!("delete container: {e}")))?;
        ignore_not_found(self.rt.remove_snapshot(&ns, DEFAULT_SNAPSHOTTER, &id).await)
            .map_err(|e| AttemptError::cleanup(format!("remove snapshot: {e}")))?;
        if let Some(fifos) = self.fifos.take() {
            fifos
                .close()
                .await
                .map_err(|e| AttemptError::cleanup(format!("log streams: {e}")))?;
        }
        Ok(())
    }
}
