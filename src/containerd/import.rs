//! # Image import.
//!
//! Loads OCI image layout archives (`index.json` + `blobs/<alg>/<hex>`) into the
//! content store and names them in the image store.
//!
//! A batch never stops at the first failure: every request is attempted and
//! [`ImportError`] lists all that failed. Images from requests that succeeded stay
//! imported.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use futures::StreamExt;
use oci_spec::image::{ANNOTATION_REF_NAME, ImageIndex, ImageManifest, MediaType};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use super::client;
use super::image;
use super::runtime::{ClientError, ContainerRuntime, ContentDescriptor, ContentStream, ImageRecord};
use crate::error::{ImportError, ImportFailure};

/// Blobs up to this size are read whole so manifests and indexes can be labelled.
const INSPECT_LIMIT: u64 = 4 << 20;

/// Read size when streaming larger blobs.
const READ_CHUNK: usize = 1 << 20;

/// Chunks buffered between the archive reader and the content writer.
const CHUNKS_IN_FLIGHT: usize = 4;

/// Prefix of the labels through which the garbage collector reaches child blobs.
const GC_REF_CONTENT: &str = "containerd.io/gc.ref.content";

static LEASE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Option shaping one import request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImportOption {
    /// Creates an image with this name pointing at the archive's index.
    IndexName(String),
    /// Adds a label to every image the request creates.
    Label(String, String),
}

/// One archive to import.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImportRequest {
    /// Path of the archive.
    pub path: PathBuf,
    /// Options, applied in order.
    pub options: Vec<ImportOption>,
}

impl ImportRequest {
    /// Creates a request without options.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            options: Vec::new(),
        }
    }

    /// Appends an option.
    pub fn with_option(mut self, option: ImportOption) -> Self {
        self.options.push(option);
        self
    }
}

/// Imports every request into namespace `ns` through the shared containerd client.
pub async fn import(ns: &str, requests: &[ImportRequest]) -> Result<Vec<ImageRecord>, ImportError> {
    match client::shared_client().await {
        Ok(rt) => import_with(rt.as_ref(), ns, requests).await,
        Err(e) => Err(ImportError {
            total: requests.len(),
            failures: requests
                .iter()
                .map(|r| ImportFailure {
                    path: r.path.clone(),
                    reason: e.to_string(),
                })
                .collect(),
        }),
    }
}

/// Imports every request into namespace `ns` through `rt`.
///
/// Returns the created image records, or every failure of the batch.
pub async fn import_with(
    rt: &dyn ContainerRuntime,
    ns: &str,
    requests: &[ImportRequest],
) -> Result<Vec<ImageRecord>, ImportError> {
    let mut images = Vec::new();
    let mut failures = Vec::new();

    for req in requests {
        match import_one(rt, ns, req).await {
            Ok(mut created) => {
                for image in &created {
                    tracing::info!(ns, image = %image.name, digest = %image.target.digest, "image imported");
                }
                images.append(&mut created);
            }
            Err(e) => {
                tracing::warn!(ns, path = %req.path.display(), error = %e, "image import failed");
                failures.push(ImportFailure {
                    path: req.path.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    if failures.is_empty() {
        Ok(images)
    } else {
        Err(ImportError {
            total: requests.len(),
            failures,
        })
    }
}

/// Imports one archive under a lease that is released whatever the outcome.
async fn import_one(
    rt: &dyn ContainerRuntime,
    ns: &str,
    req: &ImportRequest,
) -> Result<Vec<ImageRecord>, ClientError> {
    // TODO: add a containerd.io/gc.expire label so a crash mid-import does not pin content.
    let lease = format!(
        "runvisor-import-{}-{}",
        std::process::id(),
        LEASE_SEQ.fetch_add(1, Ordering::Relaxed)
    );
    rt.create_lease(ns, &lease).await?;
    let imported = import_leased(rt, ns, &lease, req).await;
    if let Err(e) = rt.delete_lease(ns, &lease).await {
        tracing::warn!(ns, lease, error = %e, "import lease not released");
    }
    imported
}

async fn import_leased(
    rt: &dyn ContainerRuntime,
    ns: &str,
    lease: &str,
    req: &ImportRequest,
) -> Result<Vec<ImageRecord>, ClientError> {
    let (tx, mut rx) = mpsc::channel(1);
    let path = req.path.clone();
    let walker = tokio::task::spawn_blocking(move || {
        if let Err(e) = walk_layout(&path, &tx) {
            tx.blocking_send(Err(e)).ok();
        }
    });

    let mut index_blob = None;
    while let Some(entry) = rx.recv().await {
        match entry? {
            LayoutEntry::Index(data) => index_blob = Some(data),
            LayoutEntry::Blob(blob) => write_blob(rt, ns, lease, blob).await?,
        }
    }
    walker
        .await
        .map_err(|e| ClientError::Io(io::Error::other(e)))?;
    let index_blob = index_blob.ok_or_else(|| no_index(&req.path))?;

    let index: ImageIndex = image::parse("index.json", &index_blob)?;
    let index_desc = ContentDescriptor {
        media_type: MediaType::ImageIndex.to_string(),
        digest: sha256_digest(&index_blob),
        size: index_blob.len() as i64,
    };
    let index_labels = child_labels(&index_blob);
    write_blob(
        rt,
        ns,
        lease,
        Blob {
            desc: index_desc.clone(),
            labels: index_labels,
            data: futures::stream::iter([Ok(index_blob)]).boxed(),
        },
    )
    .await?;

    let mut labels = HashMap::new();
    let mut records = Vec::new();
    for option in &req.options {
        match option {
            ImportOption::IndexName(name) => records.push(ImageRecord {
                name: name.clone(),
                target: index_desc.clone(),
                labels: HashMap::new(),
            }),
            ImportOption::Label(k, v) => {
                labels.insert(k.clone(), v.clone());
            }
        }
    }
    for manifest in index.manifests() {
        let name = manifest
            .annotations()
            .as_ref()
            .and_then(|a| a.get(ANNOTATION_REF_NAME));
        if let Some(name) = name {
            records.push(ImageRecord {
                name: name.clone(),
                target: ContentDescriptor {
                    media_type: manifest.media_type().to_string(),
                    digest: manifest.digest().to_string(),
                    size: manifest.size() as i64,
                },
                labels: HashMap::new(),
            });
        }
    }
    if records.is_empty() {
        tracing::warn!(ns, path = %req.path.display(), "archive imported without any image name");
    }

    for record in &mut records {
        record.labels.extend(labels.clone());
        rt.put_image(ns, record.clone()).await?;
    }
    Ok(records)
}

/// Writes one blob; a blob already in the store only gains the labels.
async fn write_blob(
    rt: &dyn ContainerRuntime,
    ns: &str,
    lease: &str,
    blob: Blob,
) -> Result<(), ClientError> {
    let Blob { desc, labels, data } = blob;
    match rt
        .write_content(ns, Some(lease), &desc, labels.clone(), data)
        .await
    {
        Ok(()) => Ok(()),
        Err(ClientError::AlreadyExists(_)) if labels.is_empty() => Ok(()),
        Err(ClientError::AlreadyExists(_)) => rt.label_content(ns, &desc.digest, labels).await,
        Err(e) => Err(e),
    }
}

/// Labels naming the blobs an index or manifest refers to; empty for anything else.
fn child_labels(blob: &[u8]) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    if let Ok(index) = serde_json::from_slice::<ImageIndex>(blob) {
        for (i, manifest) in index.manifests().iter().enumerate() {
            labels.insert(format!("{GC_REF_CONTENT}.m.{i}"), manifest.digest().to_string());
        }
    } else if let Ok(manifest) = serde_json::from_slice::<ImageManifest>(blob) {
        labels.insert(
            format!("{GC_REF_CONTENT}.config"),
            manifest.config().digest().to_string(),
        );
        for (i, layer) in manifest.layers().iter().enumerate() {
            labels.insert(format!("{GC_REF_CONTENT}.l.{i}"), layer.digest().to_string());
        }
    }
    labels
}

/// One archive entry handed from the reader thread to the importer.
enum LayoutEntry {
    Index(Vec<u8>),
    Blob(Blob),
}

struct Blob {
    desc: ContentDescriptor,
    labels: HashMap<String, String>,
    data: ContentStream,
}

fn no_index(path: &Path) -> ClientError {
    ClientError::InvalidImage(format!(
        "{}: not an OCI image layout (no index.json)",
        path.display()
    ))
}

/// Reads the archive entry by entry, in archive order.
///
/// Small blobs are sent whole with their child labels. Larger ones are sent as a
/// chunk stream fed while the importer writes them, so only a few chunks are ever
/// held in memory. sha256 blobs are checked against their names as they are read.
fn walk_layout(
    path: &Path,
    tx: &mpsc::Sender<Result<LayoutEntry, ClientError>>,
) -> Result<(), ClientError> {
    let mut archive = tar::Archive::new(File::open(path)?);
    let mut has_index = false;

    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry.path()?.to_string_lossy().trim_start_matches("./").to_string();
        if name == "index.json" {
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            has_index = true;
            if tx.blocking_send(Ok(LayoutEntry::Index(data))).is_err() {
                return Ok(());
            }
            continue;
        }
        let Some((alg, hex_digest)) = name.strip_prefix("blobs/").and_then(|r| r.split_once('/'))
        else {
            continue;
        };
        let digest = format!("{alg}:{hex_digest}");
        let size = entry.size();
        let desc = ContentDescriptor {
            media_type: String::new(),
            digest: digest.clone(),
            size: size as i64,
        };
        let verify = alg == "sha256";

        if size <= INSPECT_LIMIT {
            let mut data = Vec::with_capacity(size as usize);
            entry.read_to_end(&mut data)?;
            if verify && sha256_digest(&data) != digest {
                return Err(mismatch(&digest));
            }
            let blob = Blob {
                desc,
                labels: child_labels(&data),
                data: futures::stream::iter([Ok(data)]).boxed(),
            };
            if tx.blocking_send(Ok(LayoutEntry::Blob(blob))).is_err() {
                return Ok(());
            }
        } else {
            let (chunks_tx, chunks_rx) = mpsc::channel(CHUNKS_IN_FLIGHT);
            let data = futures::stream::unfold(chunks_rx, |mut rx| async move {
                rx.recv().await.map(|chunk| (chunk, rx))
            })
            .boxed();
            let blob = Blob {
                desc,
                labels: HashMap::new(),
                data,
            };
            if tx.blocking_send(Ok(LayoutEntry::Blob(blob))).is_err() {
                return Ok(());
            }
            stream_entry(&mut entry, &digest, verify, &chunks_tx);
        }
    }

    if has_index {
        Ok(())
    } else {
        Err(no_index(path))
    }
}

/// Feeds one entry into `chunks`, ending with an error item on a read failure or a
/// digest mismatch. Stops quietly once the writer has gone away.
fn stream_entry(
    entry: &mut impl Read,
    digest: &str,
    verify: bool,
    chunks: &mpsc::Sender<io::Result<Vec<u8>>>,
) {
    let mut hasher = Sha256::new();
    loop {
        let mut chunk = vec![0; READ_CHUNK];
        let n = match entry.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                chunks.blocking_send(Err(e)).ok();
                return;
            }
        };
        chunk.truncate(n);
        hasher.update(&chunk);
        if chunks.blocking_send(Ok(chunk)).is_err() {
            return;
        }
    }
    let actual = format!("sha256:{}", hex::encode(hasher.finalize()));
    if verify && actual != digest {
        let err = io::Error::new(io::ErrorKind::InvalidData, mismatch(digest).to_string());
        chunks.blocking_send(Err(err)).ok();
    }
}

fn mismatch(digest: &str) -> ClientError {
    ClientError::InvalidImage(format!("blob {digest} does not match its content"))
}

pub(crate) fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}
