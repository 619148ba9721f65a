//! # Image resolution.
//!
//! Walks an image record down to what a container needs:
//! ```text
//! ImageRecord.target ──► index? ──(host platform)──► manifest ──► config blob
//!                                                                    │
//!                              rootfs.diff_ids ──► chain id ◄────────┘
//! ```
//! The chain id names the unpacked snapshot the container's rootfs is prepared on.

use oci_spec::image::{Arch, Descriptor, ImageConfiguration, ImageIndex, ImageManifest, MediaType, Os};
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};

use super::runtime::{ClientError, ContainerRuntime};

/// Media type of a Docker manifest list, the pre-OCI spelling of an index.
const MEDIA_DOCKER_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";

/// Process defaults an image carries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageDefaults {
    /// `KEY=VALUE` entries.
    pub env: Vec<String>,
    /// Working directory, if set.
    pub working_dir: Option<String>,
    /// Numeric `uid[:gid]`, if the image names one.
    pub user: Option<(u32, u32)>,
}

/// An image resolved for the host platform.
#[derive(Debug, Clone)]
pub struct ResolvedImage {
    /// Image reference.
    pub name: String,
    /// Snapshot chain id of the top layer.
    pub chain_id: String,
    /// Process defaults from the image config.
    pub defaults: ImageDefaults,
}

/// Resolves `name` in namespace `ns` to its chain id and process defaults.
pub async fn resolve(
    rt: &dyn ContainerRuntime,
    ns: &str,
    name: &str,
) -> Result<ResolvedImage, ClientError> {
    let record = rt.get_image(ns, name).await?;
    let mut digest = record.target.digest;
    let mut blob = rt.read_content(ns, &digest).await?;

    if is_index(&record.target.media_type, &blob) {
        let index: ImageIndex = parse(&digest, &blob)?;
        let manifest = select_platform(index.manifests()).ok_or_else(|| {
            ClientError::InvalidImage(format!(
                "{name}: no manifest for {}/{}",
                Os::default(),
                Arch::default()
            ))
        })?;
        digest = manifest.digest().to_string();
        blob = rt.read_content(ns, &digest).await?;
    }

    let manifest: ImageManifest = parse(&digest, &blob)?;
    let config_digest = manifest.config().digest().to_string();
    let config_blob = rt.read_content(ns, &config_digest).await?;
    let config = parse_config(&config_digest, &config_blob)?;

    let chain_id = chain_id(config.rootfs().diff_ids())
        .ok_or_else(|| ClientError::InvalidImage(format!("{name}: image has no layers")))?;
    let run = config.config().clone().unwrap_or_default();
    let user = run.user().as_deref().and_then(parse_user);
    if user.is_none() && run.user().as_deref().is_some_and(|u| !u.is_empty()) {
        tracing::debug!(image = name, user = ?run.user(), "non-numeric image user ignored");
    }

    Ok(ResolvedImage {
        name: name.to_string(),
        chain_id,
        defaults: ImageDefaults {
            env: run.env().clone().unwrap_or_default(),
            working_dir: run.working_dir().clone().filter(|d| !d.is_empty()),
            user,
        },
    })
}

pub(crate) fn parse<T: DeserializeOwned>(digest: &str, blob: &[u8]) -> Result<T, ClientError> {
    serde_json::from_slice(blob).map_err(|e| ClientError::InvalidImage(format!("{digest}: {e}")))
}

/// Parses an image config; `history` is optional in the wild.
fn parse_config(digest: &str, blob: &[u8]) -> Result<ImageConfiguration, ClientError> {
    let mut value: serde_json::Value = parse(digest, blob)?;
    if let Some(obj) = value.as_object_mut() {
        obj.entry("history")
            .or_insert_with(|| serde_json::Value::Array(Vec::new()));
    }
    serde_json::from_value(value).map_err(|e| ClientError::InvalidImage(format!("{digest}: {e}")))
}

fn is_index(media_type: &str, blob: &[u8]) -> bool {
    match MediaType::from(media_type) {
        MediaType::ImageIndex => true,
        MediaType::Other(other) if other == MEDIA_DOCKER_LIST => true,
        MediaType::Other(other) if other.is_empty() => {
            serde_json::from_slice::<serde_json::Value>(blob)
                .map(|v| v.get("manifests").is_some())
                .unwrap_or(false)
        }
        _ => false,
    }
}

/// Picks the manifest matching the host; a lone manifest without platform is accepted.
fn select_platform(manifests: &[Descriptor]) -> Option<&Descriptor> {
    let (os, arch) = (Os::default(), Arch::default());
    manifests
        .iter()
        .find(|d| {
            d.platform()
                .as_ref()
                .is_some_and(|p| *p.os() == os && *p.architecture() == arch)
        })
        .or_else(|| match manifests {
            [only] if only.platform().is_none() => Some(only),
            _ => None,
        })
}

/// Computes the chain id of a layer stack:
/// `chain(0) = diff(0)`, `chain(n) = sha256(chain(n-1) + " " + diff(n))`.
pub fn chain_id(diff_ids: &[String]) -> Option<String> {
    let (first, rest) = diff_ids.split_first()?;
    Some(rest.iter().fold(first.clone(), |parent, diff| {
        let digest = Sha256::digest(format!("{parent} {diff}").as_bytes());
        format!("sha256:{}", hex::encode(digest))
    }))
}

/// Parses a numeric `uid` or `uid:gid`.
fn parse_user(user: &str) -> Option<(u32, u32)> {
    match user.split_once(':') {
        Some((uid, gid)) => Some((uid.parse().ok()?, gid.parse().ok()?)),
        None => {
            let uid = user.parse().ok()?;
            Some((uid, 0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(hex: char, platform: Option<(&str, &str)>) -> Descriptor {
        let mut value = serde_json::json!({
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "digest": format!("sha256:{}", hex.to_string().repeat(64)),
            "size": 0,
        });
        if let Some((os, arch)) = platform {
            value["platform"] = serde_json::json!({ "os": os, "architecture": arch });
        }
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn chain_id_of_single_layer_is_its_diff_id() {
        assert_eq!(chain_id(&["sha256:aa".into()]).as_deref(), Some("sha256:aa"));
        assert_eq!(chain_id(&[]), None);
    }

    #[test]
    fn chain_id_depends_on_layer_order() {
        let a = "sha256:aa".to_string();
        let b = "sha256:bb".to_string();
        let ab = chain_id(&[a.clone(), b.clone()]).unwrap();
        let ba = chain_id(&[b, a]).unwrap();
        assert_ne!(ab, ba);
        assert!(ab.starts_with("sha256:"));
        assert_eq!(ab.len(), "sha256:".len() + 64);
    }

    #[test]
    fn user_forms() {
        assert_eq!(parse_user("1000"), Some((1000, 0)));
        assert_eq!(parse_user("1000:100"), Some((1000, 100)));
        assert_eq!(parse_user("nobody"), None);
        assert_eq!(parse_user("1:wheel"), None);
    }

    #[test]
    fn platform_selection_prefers_host() {
        let (os, arch) = (Os::default().to_string(), Arch::default().to_string());
        let host = desc('a', Some((os.as_str(), arch.as_str())));
        let other = desc('b', Some(("windows", "s390x")));

        let manifests = [other.clone(), host.clone()];
        let picked = select_platform(&manifests).unwrap();
        assert_eq!(picked.digest(), host.digest());

        assert!(select_platform(&[other]).is_none());
        let lone = [desc('c', None)];
        assert_eq!(select_platform(&lone).unwrap().digest(), lone[0].digest());
    }

    #[test]
    fn host_arch_uses_oci_spelling() {
        let arch = Arch::default().to_string();
        match std::env::consts::ARCH {
            "x86_64" => assert_eq!(arch, "amd64"),
            "aarch64" => assert_eq!(arch, "arm64"),
            "powerpc64" if cfg!(target_endian = "big") => assert_eq!(arch, "ppc64"),
            _ => assert!(!arch.is_empty()),
        }
    }

    #[test]
    fn index_detection_without_media_type() {
        assert!(is_index("", br#"{"manifests":[]}"#));
        assert!(!is_index("", br#"{"config":{}}"#));
        assert!(is_index("application/vnd.oci.image.index.v1+json", b""));
        assert!(is_index(MEDIA_DOCKER_LIST, b""));
    }

    #[test]
    fn config_without_history_is_accepted() {
        let blob = br#"{"architecture":"amd64","os":"linux","config":{"Env":["A=1"],"User":"10:20"},"rootfs":{"type":"layers","diff_ids":["sha256:aa"]}}"#;
        let config = parse_config("sha256:cfg", blob).unwrap();
        assert_eq!(config.rootfs().diff_ids(), &vec!["sha256:aa".to_string()]);
        let run = config.config().clone().unwrap();
        assert_eq!(run.env().clone().unwrap(), vec!["A=1".to_string()]);
        assert_eq!(run.user().as_deref().and_then(parse_user), Some((10, 20)));
    }
}
