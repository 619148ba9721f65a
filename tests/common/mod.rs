//! Shared helpers for integration tests: tracing setup, an in-memory containerd
//! double that runs container processes on the host, and OCI layout archives.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::TryStreamExt;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use runvisor::{
    ClientError, ContainerRecord, ContainerRuntime, ContentDescriptor, ContentStream, ImageRecord,
    RootfsMount, TaskIo,
};
use sha2::{Digest, Sha256};
use tokio::sync::watch;

pub const MANIFEST_MEDIA: &str = "application/vnd.oci.image.manifest.v1+json";
pub const CONFIG_MEDIA: &str = "application/vnd.oci.image.config.v1+json";
pub const INDEX_MEDIA: &str = "application/vnd.oci.image.index.v1+json";
pub const LAYER_MEDIA: &str = "application/vnd.oci.image.layer.v1.tar";

/// Environment of the image inside [`oci_layout_archive`].
pub const ARCHIVE_ENV: &[&str] = &["PATH=/usr/bin:/bin"];

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Blobs of a one-layer image.
pub struct ImageBlobs {
    pub config: Vec<u8>,
    pub manifest: Vec<u8>,
    pub layer: Vec<u8>,
    pub diff_id: String,
}

pub fn image_blobs(env: &[&str]) -> ImageBlobs {
    image_blobs_with(env, b"layer")
}

/// Blobs of an image whose single, uncompressed layer is `layer`.
pub fn image_blobs_with(env: &[&str], layer: &[u8]) -> ImageBlobs {
    let diff_id = digest(layer);
    let config = serde_json::json!({
        "architecture": "amd64",
        "os": "linux",
        "config": { "Env": env },
        "rootfs": { "type": "layers", "diff_ids": [diff_id] },
    })
    .to_string()
    .into_bytes();
    let manifest = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": MANIFEST_MEDIA,
        "config": { "mediaType": CONFIG_MEDIA, "digest": digest(&config), "size": config.len() },
        "layers": [{ "mediaType": LAYER_MEDIA, "digest": diff_id, "size": layer.len() }],
    })
    .to_string()
    .into_bytes();
    ImageBlobs {
        config,
        manifest,
        layer: layer.to_vec(),
        diff_id,
    }
}

/// Writes an OCI image layout archive whose single manifest is named `ref_name`.
pub fn oci_layout_archive(dir: &Path, file: &str, ref_name: &str) -> PathBuf {
    oci_layout_archive_with(dir, file, ref_name, b"layer", b"layer").0
}

/// Like [`oci_layout_archive`], with a chosen layer. The layer blob is named after
/// `layer` but holds `stored`, so passing different bytes yields a corrupt archive.
pub fn oci_layout_archive_with(
    dir: &Path,
    file: &str,
    ref_name: &str,
    layer: &[u8],
    stored: &[u8],
) -> (PathBuf, ImageBlobs) {
    let blobs = image_blobs_with(ARCHIVE_ENV, layer);
    let index = serde_json::json!({
        "schemaVersion": 2,
        "manifests": [{
            "mediaType": MANIFEST_MEDIA,
            "digest": digest(&blobs.manifest),
            "size": blobs.manifest.len(),
            "annotations": { "org.opencontainers.image.ref.name": ref_name },
        }],
    })
    .to_string()
    .into_bytes();

    let path = dir.join(file);
    let mut builder = tar::Builder::new(File::create(&path).unwrap());
    let mut append = |name: String, data: &[u8]| {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, data).unwrap();
    };
    append("oci-layout".into(), br#"{"imageLayoutVersion":"1.0.0"}"#);
    append("index.json".into(), &index);
    for (named, data) in [
        (&blobs.config[..], &blobs.config[..]),
        (&blobs.manifest[..], &blobs.manifest[..]),
        (layer, stored),
    ] {
        let hex = digest(named).trim_start_matches("sha256:").to_string();
        append(format!("blobs/sha256/{hex}"), data);
    }
    builder.into_inner().unwrap();
    (path, blobs)
}

type Key = (String, String);

fn key(ns: &str, name: &str) -> Key {
    (ns.to_string(), name.to_string())
}

struct FakeTask {
    io: TaskIo,
    spec: oci_spec::runtime::Spec,
    pid: Option<u32>,
    exit: Arc<watch::Sender<Option<u32>>>,
}

impl FakeTask {
    fn exited(&self) -> bool {
        self.exit.borrow().is_some()
    }
}

#[derive(Default)]
struct State {
    images: HashMap<Key, ImageRecord>,
    content: HashMap<Key, Vec<u8>>,
    content_labels: HashMap<Key, HashMap<String, String>>,
    chunks: HashMap<Key, usize>,
    leases: HashSet<Key>,
    snapshots: HashSet<Key>,
    containers: HashMap<Key, ContainerRecord>,
    tasks: HashMap<Key, FakeTask>,
}

/// In-memory containerd that runs each task's process on the host.
///
/// Bind mounts of the OCI spec are honoured by rewriting their destinations to their
/// sources in the process arguments.
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<State>,
    calls: Mutex<Vec<String>>,
    pub fail_delete_container: AtomicBool,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Seeds an unpacked image `name` in `ns`.
    pub fn with_image(self: Arc<Self>, ns: &str, name: &str) -> Arc<Self> {
        let blobs = image_blobs(&["PATH=/usr/local/bin:/usr/bin:/bin", "IMAGE=1"]);
        let mut st = self.state.lock().unwrap();
        st.content.insert(key(ns, &digest(&blobs.config)), blobs.config.clone());
        st.content.insert(key(ns, &digest(&blobs.manifest)), blobs.manifest.clone());
        st.snapshots.insert(key(ns, &blobs.diff_id));
        st.images.insert(
            key(ns, name),
            ImageRecord {
                name: name.to_string(),
                target: ContentDescriptor {
                    media_type: MANIFEST_MEDIA.to_string(),
                    digest: digest(&blobs.manifest),
                    size: blobs.manifest.len() as i64,
                },
                labels: HashMap::new(),
            },
        );
        drop(st);
        self
    }

    /// Leaves a container, a created task and a snapshot under `id`, as a crash would.
    pub fn with_leftover(self: Arc<Self>, ns: &str, id: &str) -> Arc<Self> {
        let mut st = self.state.lock().unwrap();
        st.snapshots.insert(key(ns, id));
        st.containers.insert(
            key(ns, id),
            ContainerRecord {
                id: id.to_string(),
                image: "leftover".to_string(),
                runtime: runvisor::DEFAULT_RUNTIME.to_string(),
                snapshotter: runvisor::DEFAULT_SNAPSHOTTER.to_string(),
                snapshot_key: id.to_string(),
                spec: oci_spec::runtime::Spec::default(),
            },
        );
        st.tasks.insert(
            key(ns, id),
            FakeTask {
                io: TaskIo {
                    stdout: PathBuf::from("/dev/null"),
                    stderr: PathBuf::from("/dev/null"),
                },
                spec: oci_spec::runtime::Spec::default(),
                pid: None,
                exit: Arc::new(watch::channel(None).0),
            },
        );
        drop(st);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn image(&self, ns: &str, name: &str) -> Option<ImageRecord> {
        self.state.lock().unwrap().images.get(&key(ns, name)).cloned()
    }

    pub fn has_content(&self, ns: &str, digest: &str) -> bool {
        self.state.lock().unwrap().content.contains_key(&key(ns, digest))
    }

    pub fn content_labels(&self, ns: &str, digest: &str) -> HashMap<String, String> {
        let st = self.state.lock().unwrap();
        st.content_labels.get(&key(ns, digest)).cloned().unwrap_or_default()
    }

    /// Number of chunks the stored blob arrived in.
    pub fn chunks_written(&self, ns: &str, digest: &str) -> usize {
        let st = self.state.lock().unwrap();
        st.chunks.get(&key(ns, digest)).copied().unwrap_or_default()
    }

    /// Leases still held in `ns`.
    pub fn leases(&self, ns: &str) -> Vec<String> {
        let st = self.state.lock().unwrap();
        st.leases
            .iter()
            .filter(|(n, _)| n == ns)
            .map(|(_, id)| id.clone())
            .collect()
    }

    /// Containers, tasks and snapshots left for `id` (image layers excluded).
    pub fn leftovers(&self, ns: &str, id: &str) -> usize {
        let st = self.state.lock().unwrap();
        let k = key(ns, id);
        usize::from(st.containers.contains_key(&k))
            + usize::from(st.tasks.contains_key(&k))
            + usize::from(st.snapshots.contains(&k))
    }

    fn record(&self, op: &str, id: &str) {
        self.calls.lock().unwrap().push(format!("{op} {id}"));
    }
}

fn not_found(what: impl Into<String>) -> ClientError {
    ClientError::NotFound(what.into())
}

/// Process argv and env of a spec, with bind-mount destinations mapped to host paths.
fn host_command(spec: &oci_spec::runtime::Spec) -> (Vec<String>, Vec<(String, String)>) {
    let process = spec.process().clone().unwrap_or_default();
    let binds: Vec<(String, String)> = spec
        .mounts()
        .clone()
        .unwrap_or_default()
        .iter()
        .filter(|m| m.typ().as_deref() == Some("bind"))
        .filter_map(|m| {
            let src = m.source().as_ref()?.to_string_lossy().into_owned();
            Some((m.destination().to_string_lossy().into_owned(), src))
        })
        .collect();
    let argv = process
        .args()
        .clone()
        .unwrap_or_default()
        .into_iter()
        .map(|arg| {
            binds
                .iter()
                .fold(arg, |arg, (dst, src)| arg.replace(dst.as_str(), src.as_str()))
        })
        .collect();
    let env = process
        .env()
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter_map(|kv| kv.split_once('=').map(|(k, v)| (k.to_string(), v.to_string())))
        .collect();
    (argv, env)
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn get_image(&self, ns: &str, name: &str) -> Result<ImageRecord, ClientError> {
        self.image(ns, name)
            .ok_or_else(|| not_found(format!("image {name}")))
    }

    async fn put_image(&self, ns: &str, image: ImageRecord) -> Result<(), ClientError> {
        self.record("put_image", &image.name);
        let mut st = self.state.lock().unwrap();
        st.images.insert(key(ns, &image.name), image);
        Ok(())
    }

    async fn read_content(&self, ns: &str, digest: &str) -> Result<Vec<u8>, ClientError> {
        let st = self.state.lock().unwrap();
        st.content
            .get(&key(ns, digest))
            .cloned()
            .ok_or_else(|| not_found(format!("content {digest}")))
    }

    async fn write_content(
        &self,
        ns: &str,
        lease: Option<&str>,
        desc: &ContentDescriptor,
        labels: HashMap<String, String>,
        mut data: ContentStream,
    ) -> Result<(), ClientError> {
        self.record(&format!("write_content[{}]", lease.unwrap_or_default()), &desc.digest);
        let k = key(ns, &desc.digest);
        if self.state.lock().unwrap().content.contains_key(&k) {
            return Err(ClientError::AlreadyExists(desc.digest.clone()));
        }
        let mut blob = Vec::new();
        let mut chunks = 0;
        while let Some(chunk) = data.try_next().await? {
            blob.extend_from_slice(&chunk);
            chunks += 1;
        }
        if blob.len() as i64 != desc.size || digest(&blob) != desc.digest {
            return Err(ClientError::Status(format!("digest mismatch for {}", desc.digest)));
        }
        let mut st = self.state.lock().unwrap();
        st.content.insert(k.clone(), blob);
        st.content_labels.insert(k.clone(), labels);
        st.chunks.insert(k, chunks);
        Ok(())
    }

    async fn label_content(
        &self,
        ns: &str,
        digest: &str,
        labels: HashMap<String, String>,
    ) -> Result<(), ClientError> {
        self.record("label_content", digest);
        let mut st = self.state.lock().unwrap();
        let k = key(ns, digest);
        if !st.content.contains_key(&k) {
            return Err(not_found(format!("content {digest}")));
        }
        st.content_labels.entry(k).or_default().extend(labels);
        Ok(())
    }

    async fn create_lease(&self, ns: &str, id: &str) -> Result<(), ClientError> {
        self.record("create_lease", id);
        if self.state.lock().unwrap().leases.insert(key(ns, id)) {
            Ok(())
        } else {
            Err(ClientError::AlreadyExists(format!("lease {id}")))
        }
    }

    async fn delete_lease(&self, ns: &str, id: &str) -> Result<(), ClientError> {
        self.record("delete_lease", id);
        if self.state.lock().unwrap().leases.remove(&key(ns, id)) {
            Ok(())
        } else {
            Err(not_found(format!("lease {id}")))
        }
    }

    async fn prepare_snapshot(
        &self,
        ns: &str,
        _snapshotter: &str,
        key_: &str,
        parent: &str,
    ) -> Result<Vec<RootfsMount>, ClientError> {
        self.record("prepare_snapshot", key_);
        let mut st = self.state.lock().unwrap();
        if !st.snapshots.contains(&key(ns, parent)) {
            return Err(not_found(format!("snapshot {parent}")));
        }
        if !st.snapshots.insert(key(ns, key_)) {
            return Err(ClientError::AlreadyExists(format!("snapshot {key_}")));
        }
        Ok(vec![RootfsMount {
            kind: "bind".to_string(),
            source: "/".to_string(),
            options: vec!["rbind".to_string(), "ro".to_string()],
        }])
    }

    async fn remove_snapshot(
        &self,
        ns: &str,
        _snapshotter: &str,
        key_: &str,
    ) -> Result<(), ClientError> {
        self.record("remove_snapshot", key_);
        let mut st = self.state.lock().unwrap();
        if st.containers.contains_key(&key(ns, key_)) {
            return Err(ClientError::Status(format!("snapshot {key_} in use")));
        }
        if st.snapshots.remove(&key(ns, key_)) {
            Ok(())
        } else {
            Err(not_found(format!("snapshot {key_}")))
        }
    }

    async fn create_container(
        &self,
        ns: &str,
        container: ContainerRecord,
    ) -> Result<(), ClientError> {
        self.record("create_container", &container.id);
        let mut st = self.state.lock().unwrap();
        let k = key(ns, &container.id);
        if st.containers.contains_key(&k) {
            return Err(ClientError::AlreadyExists(format!("container {}", container.id)));
        }
        st.containers.insert(k, container);
        Ok(())
    }

    async fn delete_container(&self, ns: &str, id: &str) -> Result<(), ClientError> {
        self.record("delete_container", id);
        if self.fail_delete_container.load(Ordering::SeqCst) {
            return Err(ClientError::Status(format!("container {id}: device busy")));
        }
        let mut st = self.state.lock().unwrap();
        let k = key(ns, id);
        if st.tasks.contains_key(&k) {
            return Err(ClientError::Status(format!("container {id} has a task")));
        }
        st.containers
            .remove(&k)
            .map(|_| ())
            .ok_or_else(|| not_found(format!("container {id}")))
    }

    async fn create_task(
        &self,
        ns: &str,
        id: &str,
        _rootfs: Vec<RootfsMount>,
        io: &TaskIo,
    ) -> Result<(), ClientError> {
        self.record("create_task", id);
        let mut st = self.state.lock().unwrap();
        let k = key(ns, id);
        let spec = st
            .containers
            .get(&k)
            .map(|c| c.spec.clone())
            .ok_or_else(|| not_found(format!("container {id}")))?;
        if st.tasks.contains_key(&k) {
            return Err(ClientError::AlreadyExists(format!("task {id}")));
        }
        st.tasks.insert(
            k,
            FakeTask {
                io: io.clone(),
                spec,
                pid: None,
                exit: Arc::new(watch::channel(None).0),
            },
        );
        Ok(())
    }

    async fn start_task(&self, ns: &str, id: &str) -> Result<u32, ClientError> {
        self.record("start_task", id);
        let mut st = self.state.lock().unwrap();
        let task = st
            .tasks
            .get_mut(&key(ns, id))
            .ok_or_else(|| not_found(format!("task {id}")))?;
        let (argv, env) = host_command(&task.spec);
        let Some((exe, rest)) = argv.split_first() else {
            return Err(ClientError::Status("empty process args".into()));
        };
        let stdout = std::fs::OpenOptions::new().write(true).open(&task.io.stdout)?;
        let stderr = std::fs::OpenOptions::new().write(true).open(&task.io.stderr)?;
        let mut child = tokio::process::Command::new(exe)
            .args(rest)
            .env_clear()
            .envs(env)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0)
            .spawn()
            .map_err(|e| ClientError::Status(format!("exec {exe}: {e}")))?;
        let pid = child.id().unwrap_or_default();
        task.pid = Some(pid);

        let exit = Arc::clone(&task.exit);
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status
                    .code()
                    .map(|c| c as u32)
                    .or_else(|| status.signal().map(|s| 128 + s as u32))
                    .unwrap_or(255),
                Err(_) => 255,
            };
            exit.send_replace(Some(code));
        });
        Ok(pid)
    }

    async fn wait_task(&self, ns: &str, id: &str) -> Result<u32, ClientError> {
        let mut rx = {
            let st = self.state.lock().unwrap();
            st.tasks
                .get(&key(ns, id))
                .map(|t| t.exit.subscribe())
                .ok_or_else(|| not_found(format!("task {id}")))?
        };
        let code = *rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ClientError::Status(format!("task {id} vanished")))?;
        Ok(code.unwrap_or_default())
    }

    async fn kill_task(&self, ns: &str, id: &str, signal: i32) -> Result<(), ClientError> {
        self.record(&format!("kill_task({signal})"), id);
        let st = self.state.lock().unwrap();
        let task = st
            .tasks
            .get(&key(ns, id))
            .ok_or_else(|| not_found(format!("task {id}")))?;
        if task.exited() {
            return Err(not_found(format!("task {id}: process already finished")));
        }
        match task.pid {
            Some(pid) => {
                let sig = Signal::try_from(signal)
                    .map_err(|e| ClientError::Status(e.to_string()))?;
                killpg(Pid::from_raw(pid as i32), sig)
                    .map_err(|e| ClientError::Status(e.to_string()))
            }
            None => {
                task.exit.send_replace(Some(128 + signal as u32));
                Ok(())
            }
        }
    }

    async fn delete_task(&self, ns: &str, id: &str) -> Result<(), ClientError> {
        self.record("delete_task", id);
        let mut st = self.state.lock().unwrap();
        let k = key(ns, id);
        match st.tasks.get(&k) {
            None => Err(not_found(format!("task {id}"))),
            Some(task) if task.pid.is_some() && !task.exited() => {
                Err(ClientError::Status(format!("task {id} is running")))
            }
            Some(_) => {
                st.tasks.remove(&k);
                Ok(())
            }
        }
    }
}
