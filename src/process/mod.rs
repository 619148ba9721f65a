//! # Native process runner.
//!
//! Launches `process_args` directly on the host:
//! - environment is cleared, then `PATH`, [`Args::env`] and [`Options::env`] are applied
//!   (later entries win);
//! - stdin is `/dev/null`, stdout and stderr are duplicates of the log sink descriptor;
//! - the child leads its own process group, so SIGTERM/SIGKILL reach every descendant.
//!
//! ## Example
//! ```no_run
//! use std::sync::Arc;
//! use runvisor::{Args, Options, ProcessRunner, RestartPolicy, Runner};
//!
//! # async fn demo() -> Result<(), runvisor::RunnerError> {
//! let runner = Arc::new(ProcessRunner::new(
//!     Args::new("udevd", ["/sbin/udevd"]),
//!     Options::default().with_type(RestartPolicy::Forever),
//! ));
//!
//! let r = Arc::clone(&runner);
//! let handle = tokio::spawn(async move { r.run().await });
//! // ...
//! runner.stop().await?;
//! # let _ = handle.await;
//! # Ok(())
//! # }
//! ```

use std::process::Stdio;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::process::{Child, Command};

use crate::args::Args;
use crate::config::Options;
use crate::core::{Attempt, Backend, ExitStatus, Lifecycle, RunState};
use crate::error::{AttemptError, RunnerError};
use crate::events::Bus;
use crate::logsink::LogSink;
use crate::runner::Runner;

/// `PATH` given to children when the host has none.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Runner for a workload executed as a host process.
pub struct ProcessRunner {
    inner: Lifecycle<ProcessBackend>,
}

impl ProcessRunner {
    /// Creates an idle runner.
    pub fn new(args: Args, opts: Options) -> Self {
        let backend = ProcessBackend::new(&args, &opts);
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
impl Runner for ProcessRunner {
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

/// Spawns host processes.
pub(crate) struct ProcessBackend {
    argv: Vec<String>,
    env: Vec<(String, String)>,
}

impl ProcessBackend {
    fn new(args: &Args, opts: &Options) -> Self {
        Self {
            argv: args.process_args.clone(),
            env: child_env(args, opts),
        }
    }
}

/// Builds the child environment: `PATH`, then args env, then options env.
pub(crate) fn child_env(args: &Args, opts: &Options) -> Vec<(String, String)> {
    let path = std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string());
    let mut env: Vec<(String, String)> = vec![("PATH".to_string(), path)];
    for (key, value) in args.env.iter().chain(opts.env.iter()) {
        match env.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value.clone(),
            None => env.push((key.clone(), value.clone())),
        }
    }
    env
}

#[async_trait]
impl Backend for ProcessBackend {
    async fn spawn(&self, _attempt: u32, sink: &LogSink) -> Result<Box<dyn Attempt>, AttemptError> {
        Ok(Box::new(self.launch(sink)?))
    }
}

impl ProcessBackend {
    fn launch(&self, sink: &LogSink) -> Result<ProcessAttempt, AttemptError> {
        let Some((exe, rest)) = self.argv.split_first() else {
            return Err(AttemptError::spawn("empty argv"));
        };
        let stdout = sink.stdio().map_err(AttemptError::spawn)?;
        let stderr = sink.stdio().map_err(AttemptError::spawn)?;

        let mut cmd = Command::new(exe);
        cmd.args(rest)
            .env_clear()
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0)
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| AttemptError::spawn(format!("{exe}: {e}")))?;
        let pid = child
            .id()
            .ok_or_else(|| AttemptError::spawn(format!("{exe}: exited before its pid was read")))?;

        Ok(ProcessAttempt {
            child,
            pgid: Pid::from_raw(pid as i32),
            exited: None,
        })
    }
}

/// One running host process (and its process group).
struct ProcessAttempt {
    child: Child,
    pgid: Pid,
    exited: Option<ExitStatus>,
}

#[async_trait]
impl Attempt for ProcessAttempt {
    async fn wait(&mut self) -> Result<ExitStatus, AttemptError> {
        if let Some(status) = self.exited {
            return Ok(status);
        }
        let status = self.child.wait().await.map_err(AttemptError::wait)?;
        let status = to_exit_status(status);
        self.exited = Some(status);
        Ok(status)
    }

    async fn signal(&mut self, signal: Signal) -> Result<(), AttemptError> {
        match killpg(self.pgid, signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(AttemptError::signal(format!(
                "{signal} to group {}: {e}",
                self.pgid
            ))),
        }
    }

    /// Kills descendants that outlived the leader; they would keep the log
    /// descriptor open.
    ///
    /// While the leader is unreaped its pid, and so the group id, cannot be reused.
    /// After reaping, the group id stays ours only as long as members remain, so the
    /// group is checked with a null signal first and left alone when empty.
    async fn cleanup(mut self: Box<Self>) -> Result<(), AttemptError> {
        if self.exited.is_none() {
            self.kill_group()?;
            self.wait().await.map_err(AttemptError::cleanup)?;
            return Ok(());
        }
        match killpg(self.pgid, None) {
            Err(Errno::ESRCH) => Ok(()),
            _ => self.kill_group(),
        }
    }
}

impl ProcessAttempt {
    fn kill_group(&self) -> Result<(), AttemptError> {
        match killpg(self.pgid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(AttemptError::cleanup(format!(
                "kill group {}: {e}",
                self.pgid
            ))),
        }
    }
}

fn to_exit_status(status: std::process::ExitStatus) -> ExitStatus {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => ExitStatus::Code(code),
        (None, Some(sig)) => ExitStatus::Signal(sig),
        (None, None) => ExitStatus::Code(-1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_layers_override_in_order() {
        let args = Args::new("svc", ["/bin/true"])
            .with_env("A", "args")
            .with_env("B", "args");
        let opts = Options::default().with_env([("B", "opts"), ("PATH", "/opt/bin")]);

        let env = child_env(&args, &opts);
        assert_eq!(
            env,
            vec![
                ("PATH".to_string(), "/opt/bin".to_string()),
                ("A".to_string(), "args".to_string()),
                ("B".to_string(), "opts".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn missing_executable_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let args = Args::new("missing", ["/nonexistent/binary"]);
        let backend = ProcessBackend::new(&args, &Options::default());
        let mut sink = LogSink::new(dir.path(), "missing");
        sink.open().unwrap();

        let err = backend.spawn(1, &sink).await.err().unwrap();
        assert_eq!(err.as_label(), "attempt_spawn");
        assert!(err.to_string().contains("/nonexistent/binary"));
    }

    #[tokio::test]
    async fn signal_exit_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let args = Args::new("sleeper", ["/bin/sh", "-c", "sleep 30"]);
        let backend = ProcessBackend::new(&args, &Options::default());
        let mut sink = LogSink::new(dir.path(), "sleeper");
        sink.open().unwrap();

        let mut child = backend.spawn(1, &sink).await.unwrap();
        child.signal(Signal::SIGKILL).await.unwrap();
        let status = child.wait().await.unwrap();
        assert_eq!(status, ExitStatus::Signal(Signal::SIGKILL as i32));
        child.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn cleanup_kills_survivors_of_the_leader() {
        let dir = tempfile::tempdir().unwrap();
        let args = Args::new("forker", ["/bin/sh", "-c", "(sleep 0.3; echo late) & echo early"]);
        let backend = ProcessBackend::new(&args, &Options::default());
        let mut sink = LogSink::new(dir.path(), "forker");
        sink.open().unwrap();

        let mut child = backend.launch(&sink).unwrap();
        assert_eq!(child.wait().await.unwrap(), ExitStatus::Code(0));
        assert!(killpg(child.pgid, None).is_ok(), "background job already gone");

        Box::new(child).cleanup().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        sink.close();

        let log = std::fs::read_to_string(dir.path().join("forker.log")).unwrap();
        assert_eq!(log, "early\n");
    }

    #[tokio::test]
    async fn cleanup_leaves_an_emptied_group_alone() {
        let dir = tempfile::tempdir().unwrap();
        let args = Args::new("lone", ["/bin/sh", "-c", "exit 0"]);
        let backend = ProcessBackend::new(&args, &Options::default());
        let mut sink = LogSink::new(dir.path(), "lone");
        sink.open().unwrap();

        let mut child = backend.launch(&sink).unwrap();
        child.wait().await.unwrap();
        let pgid = child.pgid;
        assert_eq!(killpg(pgid, None), Err(Errno::ESRCH));

        Box::new(child).cleanup().await.unwrap();
    }
}
