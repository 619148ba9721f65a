//! # Container runtime seam.
//!
//! [`ContainerRuntime`] is the narrow set of daemon operations the container backend
//! and the image importer need. [`Containerd`](super::Containerd) implements it over
//! gRPC; any other implementation (an in-memory double, a different socket) can be
//! handed to [`ContainerRunner::with_runtime`](super::ContainerRunner::with_runtime).
//!
//! Every call is scoped to a namespace.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

/// Chunks of one blob, in order. An `Err` item aborts the write without committing.
pub type ContentStream = BoxStream<'static, std::io::Result<Vec<u8>>>;

/// Errors reported by a [`ContainerRuntime`].
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ClientError {
    /// The addressed object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The object already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Any other status returned by the daemon.
    #[error("{0}")]
    Status(String),

    /// The daemon could not be reached.
    #[error("transport: {0}")]
    Transport(String),

    /// Local I/O failed (FIFOs, archives).
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Image metadata is missing or malformed.
    #[error("invalid image: {0}")]
    InvalidImage(String),

    /// The runtime spec could not be built or encoded.
    #[error("runtime spec: {0}")]
    Spec(String),
}

impl ClientError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            ClientError::NotFound(_) => "client_not_found",
            ClientError::AlreadyExists(_) => "client_already_exists",
            ClientError::Status(_) => "client_status",
            ClientError::Transport(_) => "client_transport",
            ClientError::Io(_) => "client_io",
            ClientError::InvalidImage(_) => "client_invalid_image",
            ClientError::Spec(_) => "client_spec",
        }
    }

    /// True when the addressed object is absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }
}

/// Treats "absent" as success.
pub(crate) fn ignore_not_found(res: Result<(), ClientError>) -> Result<(), ClientError> {
    match res {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

/// Content-addressed blob reference.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContentDescriptor {
    /// Media type of the blob.
    pub media_type: String,
    /// `<algorithm>:<hex>` digest.
    pub digest: String,
    /// Size in bytes.
    pub size: i64,
}

/// A named image in the image store.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImageRecord {
    /// Image reference (e.g. `docker.io/library/busybox:latest`).
    pub name: String,
    /// Index or manifest the name points at.
    pub target: ContentDescriptor,
    /// Image labels.
    pub labels: HashMap<String, String>,
}

/// One filesystem mount produced by the snapshotter.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RootfsMount {
    /// Mount type (`overlay`, `bind`, ...).
    pub kind: String,
    /// Mount source.
    pub source: String,
    /// Mount options.
    pub options: Vec<String>,
}

/// Container metadata record.
#[derive(Clone, Debug)]
pub struct ContainerRecord {
    /// Container id.
    pub id: String,
    /// Image reference.
    pub image: String,
    /// Runtime handler name.
    pub runtime: String,
    /// Snapshotter holding the root filesystem.
    pub snapshotter: String,
    /// Snapshot key of the root filesystem.
    pub snapshot_key: String,
    /// OCI runtime spec.
    pub spec: oci_spec::runtime::Spec,
}

/// Standard stream endpoints of a task (paths to FIFOs).
///
/// stdin is always closed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskIo {
    /// FIFO receiving the task's stdout.
    pub stdout: PathBuf,
    /// FIFO receiving the task's stderr.
    pub stderr: PathBuf,
}

/// Daemon operations used by the container backend and the importer.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    /// Looks up an image by name.
    async fn get_image(&self, ns: &str, name: &str) -> Result<ImageRecord, ClientError>;

    /// Creates an image record, replacing any existing one with the same name.
    async fn put_image(&self, ns: &str, image: ImageRecord) -> Result<(), ClientError>;

    /// Reads a whole blob from the content store.
    async fn read_content(&self, ns: &str, digest: &str) -> Result<Vec<u8>, ClientError>;

    /// Streams a blob into the content store and commits it with `labels`.
    ///
    /// The write is held by `lease` when one is given. An already-present blob is
    /// `AlreadyExists` and keeps its labels.
    async fn write_content(
        &self,
        ns: &str,
        lease: Option<&str>,
        desc: &ContentDescriptor,
        labels: HashMap<String, String>,
        data: ContentStream,
    ) -> Result<(), ClientError>;

    /// Sets `labels` on a stored blob, keeping its other labels.
    async fn label_content(
        &self,
        ns: &str,
        digest: &str,
        labels: HashMap<String, String>,
    ) -> Result<(), ClientError>;

    /// Creates a lease; content written under it is kept until the lease is deleted.
    async fn create_lease(&self, ns: &str, id: &str) -> Result<(), ClientError>;

    /// Deletes a lease, leaving its content to the garbage collector's references.
    async fn delete_lease(&self, ns: &str, id: &str) -> Result<(), ClientError>;

    /// Prepares an active snapshot `key` on top of `parent` and returns its mounts.
    async fn prepare_snapshot(
        &self,
        ns: &str,
        snapshotter: &str,
        key: &str,
        parent: &str,
    ) -> Result<Vec<RootfsMount>, ClientError>;

    /// Removes a snapshot.
    async fn remove_snapshot(&self, ns: &str, snapshotter: &str, key: &str)
    -> Result<(), ClientError>;

    /// Creates a container record.
    async fn create_container(&self, ns: &str, container: ContainerRecord)
    -> Result<(), ClientError>;

    /// Deletes a container record.
    async fn delete_container(&self, ns: &str, id: &str) -> Result<(), ClientError>;

    /// Creates the task of container `id` on the given root filesystem.
    async fn create_task(
        &self,
        ns: &str,
        id: &str,
        rootfs: Vec<RootfsMount>,
        io: &TaskIo,
    ) -> Result<(), ClientError>;

    /// Starts a created task; returns its pid.
    async fn start_task(&self, ns: &str, id: &str) -> Result<u32, ClientError>;

    /// Blocks until the task exits; returns its exit status.
    ///
    /// Dropping the future must not affect the task.
    async fn wait_task(&self, ns: &str, id: &str) -> Result<u32, ClientError>;

    /// Delivers a signal to every process of the task.
    async fn kill_task(&self, ns: &str, id: &str, signal: i32) -> Result<(), ClientError>;

    /// Deletes a stopped task.
    async fn delete_task(&self, ns: &str, id: &str) -> Result<(), ClientError>;
}
