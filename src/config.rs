//! # Runner options.
//!
//! Provides [`Options`], the value carried into runner construction. Both backends
//! read the common fields; container-only fields are ignored by the process backend.
//!
//! ## Sentinel values
//! - `container_image = ""` → no image (container backend rejects it)
//! - `namespace = ""` → treated as the default namespace
//!
//! ## Example
//! ```rust
//! use std::time::Duration;
//! use runvisor::{Options, RestartPolicy};
//!
//! let opts = Options::default()
//!     .with_type(RestartPolicy::Once)
//!     .with_log_path("/var/log/services")
//!     .with_restart_interval(Duration::from_millis(5));
//!
//! assert_eq!(opts.restart, RestartPolicy::Once);
//! assert!(opts.container_image().is_none());
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::containerd::OciSpecOpt;
use crate::policies::RestartPolicy;
use crate::subscribers::{LogWriter, Subscribe};

/// Default container runtime namespace for system services.
pub const DEFAULT_NAMESPACE: &str = "system";

/// Default directory for workload log files.
pub const DEFAULT_LOG_PATH: &str = "/var/log";

/// Options shaping supervision of one workload.
///
/// ## Field semantics
/// - `restart`: restart policy (`Type` in the runner contract)
/// - `log_path`: directory where `<id>.log` is appended
/// - `env`: environment added after [`Args::env`](crate::Args)
/// - `restart_interval`: fixed wait between an exit and the next spawn
/// - `graceful_shutdown_timeout`: time between SIGTERM and SIGKILL on stop
/// - `namespace`, `container_image`, `oci_spec_opts`: container backend only
/// - `subscribers`, `bus_capacity`: lifecycle event delivery
#[derive(Clone)]
pub struct Options {
    /// Restart policy.
    pub restart: RestartPolicy,
    /// Directory of the workload log file.
    pub log_path: PathBuf,
    /// Additional environment variables.
    pub env: Vec<(String, String)>,
    /// Minimum wait between a child's exit and the next spawn. Ignored under `Once`.
    pub restart_interval: Duration,
    /// Time granted after SIGTERM before escalating to SIGKILL.
    pub graceful_shutdown_timeout: Duration,
    /// Container runtime namespace.
    pub namespace: String,
    /// Image reference the container is created from.
    pub container_image: String,
    /// Ordered transforms applied to the generated OCI runtime spec.
    pub oci_spec_opts: Vec<OciSpecOpt>,
    /// Lifecycle event subscribers.
    pub subscribers: Vec<Arc<dyn Subscribe>>,
    /// Capacity of the lifecycle event bus (min 1).
    pub bus_capacity: usize,
}

impl Options {
    /// Sets the restart policy.
    pub fn with_type(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    /// Sets the log directory.
    pub fn with_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = path.into();
        self
    }

    /// Appends environment variables.
    pub fn with_env<I, K, V>(mut self, env: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(env.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Sets the restart interval.
    pub fn with_restart_interval(mut self, interval: Duration) -> Self {
        self.restart_interval = interval;
        self
    }

    /// Sets the graceful shutdown timeout.
    pub fn with_graceful_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.graceful_shutdown_timeout = timeout;
        self
    }

    /// Sets the container runtime namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Sets the container image reference.
    pub fn with_container_image(mut self, image: impl Into<String>) -> Self {
        self.container_image = image.into();
        self
    }

    /// Appends OCI spec transforms (applied in order).
    pub fn with_oci_spec_opts(mut self, opts: impl IntoIterator<Item = OciSpecOpt>) -> Self {
        self.oci_spec_opts.extend(opts);
        self
    }

    /// Replaces the lifecycle event subscribers.
    pub fn with_subscribers(mut self, subscribers: Vec<Arc<dyn Subscribe>>) -> Self {
        self.subscribers = subscribers;
        self
    }

    /// Sets the event bus capacity.
    pub fn with_bus_capacity(mut self, capacity: usize) -> Self {
        self.bus_capacity = capacity;
        self
    }

    /// Returns the container image, if one is configured.
    #[inline]
    pub fn container_image(&self) -> Option<&str> {
        Some(self.container_image.as_str()).filter(|s| !s.is_empty())
    }

    /// Returns the namespace, falling back to [`DEFAULT_NAMESPACE`].
    #[inline]
    pub fn namespace(&self) -> &str {
        if self.namespace.is_empty() {
            DEFAULT_NAMESPACE
        } else {
            &self.namespace
        }
    }

    /// Returns a bus capacity clamped to a minimum of 1.
    #[inline]
    pub fn bus_capacity_clamped(&self) -> usize {
        self.bus_capacity.max(1)
    }
}

impl Default for Options {
    /// Default options:
    ///
    /// - `restart = Forever`
    /// - `log_path = /var/log`
    /// - `restart_interval = 100ms`
    /// - `graceful_shutdown_timeout = 10s`
    /// - `namespace = system`
    /// - `subscribers = [LogWriter]`, `bus_capacity = 1024`
    fn default() -> Self {
        Self {
            restart: RestartPolicy::default(),
            log_path: PathBuf::from(DEFAULT_LOG_PATH),
            env: Vec::new(),
            restart_interval: Duration::from_millis(100),
            graceful_shutdown_timeout: Duration::from_secs(10),
            namespace: DEFAULT_NAMESPACE.to_string(),
            container_image: String::new(),
            oci_spec_opts: Vec::new(),
            subscribers: vec![Arc::new(LogWriter::new())],
            bus_capacity: 1024,
        }
    }
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("restart", &self.restart)
            .field("log_path", &self.log_path)
            .field("env", &self.env)
            .field("restart_interval", &self.restart_interval)
            .field("graceful_shutdown_timeout", &self.graceful_shutdown_timeout)
            .field("namespace", &self.namespace)
            .field("container_image", &self.container_image)
            .field("oci_spec_opts", &self.oci_spec_opts.len())
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = Options::default();
        assert_eq!(opts.restart, RestartPolicy::Forever);
        assert_eq!(opts.log_path, PathBuf::from("/var/log"));
        assert_eq!(opts.restart_interval, Duration::from_millis(100));
        assert_eq!(opts.graceful_shutdown_timeout, Duration::from_secs(10));
        assert_eq!(opts.namespace(), "system");
        assert_eq!(opts.subscribers.len(), 1);
    }

    #[test]
    fn sentinels_are_hidden_by_accessors() {
        let opts = Options::default()
            .with_namespace("")
            .with_container_image("")
            .with_bus_capacity(0);
        assert_eq!(opts.namespace(), DEFAULT_NAMESPACE);
        assert_eq!(opts.container_image(), None);
        assert_eq!(opts.bus_capacity_clamped(), 1);
    }

    #[test]
    fn env_accumulates_in_order() {
        let opts = Options::default()
            .with_env([("A", "1")])
            .with_env([("B", "2"), ("A", "3")]);
        assert_eq!(
            opts.env,
            vec![
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "2".to_string()),
                ("A".to_string(), "3".to_string()),
            ]
        );
    }
}
