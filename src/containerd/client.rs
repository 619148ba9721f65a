//! gRPC implementation of [`ContainerRuntime`] over the containerd socket.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use containerd_client::services::v1::container::Runtime;
use containerd_client::services::v1::containers_client::ContainersClient;
use containerd_client::services::v1::content_client::ContentClient;
use containerd_client::services::v1::images_client::ImagesClient;
use containerd_client::services::v1::leases_client::LeasesClient;
use containerd_client::services::v1::snapshots::snapshots_client::SnapshotsClient;
use containerd_client::services::v1::snapshots::{PrepareSnapshotRequest, RemoveSnapshotRequest};
use containerd_client::services::v1::tasks_client::TasksClient;
use containerd_client::services::v1::{
    Container, CreateContainerRequest, CreateImageRequest, CreateRequest as CreateLeaseRequest,
    CreateTaskRequest, DeleteContainerRequest, DeleteRequest as DeleteLeaseRequest,
    DeleteTaskRequest, GetImageRequest, Image, Info, KillRequest, ReadContentRequest,
    StartRequest, UpdateImageRequest, UpdateRequest as UpdateContentRequest, WaitRequest,
    WriteAction, WriteContentRequest,
};
use containerd_client::types::{Descriptor, Mount};
use futures::StreamExt;
use tokio::sync::{OnceCell, mpsc};
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::Channel;
use tonic::{Code, Request, Status};

use super::runtime::{
    ClientError, ContainerRecord, ContainerRuntime, ContentDescriptor, ContentStream, ImageRecord,
    RootfsMount, TaskIo,
};

/// Well-known containerd socket.
pub const DEFAULT_SOCKET: &str = "/run/containerd/containerd.sock";

/// Type URL of an OCI runtime spec wrapped in a protobuf `Any`.
pub const SPEC_TYPE_URL: &str = "types.containerd.io/opencontainers/runtime-spec/1/Spec";

const NAMESPACE_HEADER: &str = "containerd-namespace";
const LEASE_HEADER: &str = "containerd-lease";

/// Write messages queued ahead of the daemon.
const WRITES_IN_FLIGHT: usize = 2;

static SHARED: OnceCell<Arc<Containerd>> = OnceCell::const_new();

/// Returns the process-wide client for [`DEFAULT_SOCKET`], connecting on first use.
///
/// A failed connection is not cached; the next call retries.
pub async fn shared_client() -> Result<Arc<Containerd>, ClientError> {
    SHARED
        .get_or_try_init(|| async { Containerd::connect(DEFAULT_SOCKET).await.map(Arc::new) })
        .await
        .cloned()
}

/// containerd client; cheap to clone, safe to share between tasks.
#[derive(Clone, Debug)]
pub struct Containerd {
    channel: Channel,
    socket: PathBuf,
}

impl Containerd {
    /// Connects to the daemon listening on `socket`.
    pub async fn connect(socket: impl AsRef<Path>) -> Result<Self, ClientError> {
        let socket = socket.as_ref().to_path_buf();
        let channel = containerd_client::connect(&socket)
            .await
            .map_err(|e| ClientError::Transport(format!("{}: {e}", socket.display())))?;
        tracing::debug!(socket = %socket.display(), "connected to containerd");
        Ok(Self { channel, socket })
    }

    /// Socket this client is connected to.
    pub fn socket(&self) -> &Path {
        &self.socket
    }
}

impl From<Status> for ClientError {
    fn from(status: Status) -> Self {
        let msg = status.message().to_string();
        match status.code() {
            Code::NotFound => ClientError::NotFound(msg),
            Code::AlreadyExists => ClientError::AlreadyExists(msg),
            Code::Unavailable => ClientError::Transport(msg),
            code => ClientError::Status(format!("{code:?}: {msg}")),
        }
    }
}

/// Wraps `msg` in a request scoped to namespace `ns`.
fn scoped<T>(msg: T, ns: &str) -> Result<Request<T>, ClientError> {
    let value: MetadataValue<Ascii> = ns
        .parse()
        .map_err(|_| ClientError::Status(format!("invalid namespace {ns:?}")))?;
    let mut req = Request::new(msg);
    req.metadata_mut().insert(NAMESPACE_HEADER, value);
    Ok(req)
}

/// Attaches `lease` to a request, if any.
fn leased<T>(mut req: Request<T>, lease: Option<&str>) -> Result<Request<T>, ClientError> {
    if let Some(lease) = lease {
        let value: MetadataValue<Ascii> = lease
            .parse()
            .map_err(|_| ClientError::Status(format!("invalid lease {lease:?}")))?;
        req.metadata_mut().insert(LEASE_HEADER, value);
    }
    Ok(req)
}

fn to_descriptor(desc: &ContentDescriptor) -> Descriptor {
    Descriptor {
        media_type: desc.media_type.clone(),
        digest: desc.digest.clone(),
        size: desc.size,
        ..Default::default()
    }
}

fn to_image(image: ImageRecord) -> Image {
    Image {
        name: image.name,
        labels: image.labels,
        target: Some(to_descriptor(&image.target)),
        ..Default::default()
    }
}

fn from_image(image: Image) -> Result<ImageRecord, ClientError> {
    let target = image
        .target
        .ok_or_else(|| ClientError::InvalidImage(format!("{} has no target", image.name)))?;
    Ok(ImageRecord {
        name: image.name,
        labels: image.labels,
        target: ContentDescriptor {
            media_type: target.media_type,
            digest: target.digest,
            size: target.size,
        },
    })
}

#[async_trait]
impl ContainerRuntime for Containerd {
    async fn get_image(&self, ns: &str, name: &str) -> Result<ImageRecord, ClientError> {
        let req = GetImageRequest {
            name: name.to_string(),
            ..Default::default()
        };
        let resp = ImagesClient::new(self.channel.clone())
            .get(scoped(req, ns)?)
            .await?
            .into_inner();
        let image = resp
            .image
            .ok_or_else(|| ClientError::NotFound(format!("image {name}")))?;
        from_image(image)
    }

    async fn put_image(&self, ns: &str, image: ImageRecord) -> Result<(), ClientError> {
        let mut client = ImagesClient::new(self.channel.clone());
        let image = to_image(image);
        let create = CreateImageRequest {
            image: Some(image.clone()),
            ..Default::default()
        };
        match client.create(scoped(create, ns)?).await {
            Ok(_) => Ok(()),
            Err(status) if status.code() == Code::AlreadyExists => {
                let update = UpdateImageRequest {
                    image: Some(image),
                    ..Default::default()
                };
                client.update(scoped(update, ns)?).await?;
                Ok(())
            }
            Err(status) => Err(status.into()),
        }
    }

    async fn read_content(&self, ns: &str, digest: &str) -> Result<Vec<u8>, ClientError> {
        let req = ReadContentRequest {
            digest: digest.to_string(),
            ..Default::default()
        };
        let mut stream = ContentClient::new(self.channel.clone())
            .read(scoped(req, ns)?)
            .await?
            .into_inner();
        let mut data = Vec::new();
        while let Some(chunk) = stream.message().await? {
            data.extend_from_slice(&chunk.data);
        }
        Ok(data)
    }

    async fn write_content(
        &self,
        ns: &str,
        lease: Option<&str>,
        desc: &ContentDescriptor,
        labels: HashMap<String, String>,
        mut data: ContentStream,
    ) -> Result<(), ClientError> {
        let reference = format!("runvisor-{}", desc.digest);
        let total = desc.size;
        let expected = desc.digest.clone();

        let (tx, mut rx) = mpsc::channel::<WriteContentRequest>(WRITES_IN_FLIGHT);
        let outgoing = futures::stream::poll_fn(move |cx| rx.poll_recv(cx));
        let req = leased(scoped(outgoing, ns)?, lease)?;
        let mut client = ContentClient::new(self.channel.clone());

        let call = async move {
            let mut responses = client.write(req).await?.into_inner();
            while responses.message().await?.is_some() {}
            Ok::<(), ClientError>(())
        };
        // A failed send means the call already ended; its result is what gets reported.
        let feed = async move {
            let mut offset: i64 = 0;
            while let Some(chunk) = data.next().await {
                let chunk = chunk?;
                let len = chunk.len() as i64;
                let write = WriteContentRequest {
                    action: WriteAction::Write as i32,
                    r#ref: reference.clone(),
                    total,
                    expected: expected.clone(),
                    offset,
                    data: chunk,
                    ..Default::default()
                };
                if tx.send(write).await.is_err() {
                    return Ok(());
                }
                offset += len;
            }
            let commit = WriteContentRequest {
                action: WriteAction::Commit as i32,
                r#ref: reference,
                total,
                expected,
                offset,
                labels,
                ..Default::default()
            };
            tx.send(commit).await.ok();
            Ok::<(), ClientError>(())
        };

        // Dropping the sender without a commit abandons the write.
        let (called, fed) = tokio::join!(call, feed);
        fed?;
        called
    }

    async fn label_content(
        &self,
        ns: &str,
        digest: &str,
        labels: HashMap<String, String>,
    ) -> Result<(), ClientError> {
        let paths = labels.keys().map(|k| format!("labels.{k}")).collect();
        let req = UpdateContentRequest {
            info: Some(Info {
                digest: digest.to_string(),
                labels,
                ..Default::default()
            }),
            update_mask: Some(prost_types::FieldMask { paths }),
        };
        ContentClient::new(self.channel.clone())
            .update(scoped(req, ns)?)
            .await?;
        Ok(())
    }

    async fn create_lease(&self, ns: &str, id: &str) -> Result<(), ClientError> {
        let req = CreateLeaseRequest {
            id: id.to_string(),
            ..Default::default()
        };
        LeasesClient::new(self.channel.clone())
            .create(scoped(req, ns)?)
            .await?;
        Ok(())
    }

    async fn delete_lease(&self, ns: &str, id: &str) -> Result<(), ClientError> {
        let req = DeleteLeaseRequest {
            id: id.to_string(),
            ..Default::default()
        };
        LeasesClient::new(self.channel.clone())
            .delete(scoped(req, ns)?)
            .await?;
        Ok(())
    }

    async fn prepare_snapshot(
        &self,
        ns: &str,
        snapshotter: &str,
        key: &str,
        parent: &str,
    ) -> Result<Vec<RootfsMount>, ClientError> {
        let req = PrepareSnapshotRequest {
            snapshotter: snapshotter.to_string(),
            key: key.to_string(),
            parent: parent.to_string(),
            ..Default::default()
        };
        let resp = SnapshotsClient::new(self.channel.clone())
            .prepare(scoped(req, ns)?)
            .await?
            .into_inner();
        Ok(resp
            .mounts
            .into_iter()
            .map(|m| RootfsMount {
                kind: m.r#type,
                source: m.source,
                options: m.options,
            })
            .collect())
    }

    async fn remove_snapshot(
        &self,
        ns: &str,
        snapshotter: &str,
        key: &str,
    ) -> Result<(), ClientError> {
        let req = RemoveSnapshotRequest {
            snapshotter: snapshotter.to_string(),
            key: key.to_string(),
            ..Default::default()
        };
        SnapshotsClient::new(self.channel.clone())
            .remove(scoped(req, ns)?)
            .await?;
        Ok(())
    }

    async fn create_container(
        &self,
        ns: &str,
        container: ContainerRecord,
    ) -> Result<(), ClientError> {
        let spec = serde_json::to_vec(&container.spec)
            .map_err(|e| ClientError::Spec(e.to_string()))?;
        let req = CreateContainerRequest {
            container: Some(Container {
                id: container.id,
                image: container.image,
                runtime: Some(Runtime {
                    name: container.runtime,
                    options: None,
                }),
                spec: Some(prost_types::Any {
                    type_url: SPEC_TYPE_URL.to_string(),
                    value: spec,
                }),
                snapshotter: container.snapshotter,
                snapshot_key: container.snapshot_key,
                ..Default::default()
            }),
            ..Default::default()
        };
        ContainersClient::new(self.channel.clone())
            .create(scoped(req, ns)?)
            .await?;
        Ok(())
    }

    async fn delete_container(&self, ns: &str, id: &str) -> Result<(), ClientError> {
        let req = DeleteContainerRequest {
            id: id.to_string(),
            ..Default::default()
        };
        ContainersClient::new(self.channel.clone())
            .delete(scoped(req, ns)?)
            .await?;
        Ok(())
    }

    async fn create_task(
        &self,
        ns: &str,
        id: &str,
        rootfs: Vec<RootfsMount>,
        io: &TaskIo,
    ) -> Result<(), ClientError> {
        let req = CreateTaskRequest {
            container_id: id.to_string(),
            rootfs: rootfs
                .into_iter()
                .map(|m| Mount {
                    r#type: m.kind,
                    source: m.source,
                    options: m.options,
                    ..Default::default()
                })
                .collect(),
            stdout: io.stdout.to_string_lossy().into_owned(),
            stderr: io.stderr.to_string_lossy().into_owned(),
            terminal: false,
            ..Default::default()
        };
        TasksClient::new(self.channel.clone())
            .create(scoped(req, ns)?)
            .await?;
        Ok(())
    }

    async fn start_task(&self, ns: &str, id: &str) -> Result<u32, ClientError> {
        let req = StartRequest {
            container_id: id.to_string(),
            ..Default::default()
        };
        let resp = TasksClient::new(self.channel.clone())
            .start(scoped(req, ns)?)
            .await?
            .into_inner();
        Ok(resp.pid)
    }

    async fn wait_task(&self, ns: &str, id: &str) -> Result<u32, ClientError> {
        let req = WaitRequest {
            container_id: id.to_string(),
            ..Default::default()
        };
        let resp = TasksClient::new(self.channel.clone())
            .wait(scoped(req, ns)?)
            .await?
            .into_inner();
        Ok(resp.exit_status)
    }

    async fn kill_task(&self, ns: &str, id: &str, signal: i32) -> Result<(), ClientError> {
        let req = KillRequest {
            container_id: id.to_string(),
            signal: signal as u32,
            all: true,
            ..Default::default()
        };
        TasksClient::new(self.channel.clone())
            .kill(scoped(req, ns)?)
            .await?;
        Ok(())
    }

    async fn delete_task(&self, ns: &str, id: &str) -> Result<(), ClientError> {
        let req = DeleteTaskRequest {
            container_id: id.to_string(),
            ..Default::default()
        };
        TasksClient::new(self.channel.clone())
            .delete(scoped(req, ns)?)
            .await?;
        Ok(())
    }
}
