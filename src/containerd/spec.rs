//! # OCI runtime spec generation.
//!
//! The spec of one container is built in layers, each overriding the previous:
//! 1. `Spec::default()` (a plain Linux container);
//! 2. image defaults (env, working dir, numeric user);
//! 3. `process_args` and the merged environment of the runner;
//! 4. every [`OciSpecOpt`] of [`Options`](crate::Options), in order.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use oci_spec::runtime::{Mount, MountBuilder, Process, Spec};

use super::image::ImageDefaults;
use super::runtime::ClientError;

/// Caller-supplied spec transform.
pub type SpecFn = dyn Fn(&mut Spec) -> Result<(), String> + Send + Sync;

/// One transform of the generated OCI runtime spec.
#[derive(Clone)]
pub enum OciSpecOpt {
    /// Appends mounts.
    Mounts(Vec<Mount>),
    /// Appends a bind mount of a host path.
    BindMount {
        /// Host path.
        source: PathBuf,
        /// Path inside the container.
        destination: PathBuf,
        /// Mount read-only.
        read_only: bool,
    },
    /// Sets or overrides environment variables.
    Env(Vec<(String, String)>),
    /// Runs the process as `uid:gid`.
    User {
        /// User id.
        uid: u32,
        /// Group id.
        gid: u32,
    },
    /// Sets the working directory.
    Cwd(PathBuf),
    /// Sets the hostname.
    Hostname(String),
    /// Arbitrary transform.
    Custom(Arc<SpecFn>),
}

impl OciSpecOpt {
    /// Bind-mounts host `source` at `destination`.
    pub fn bind_mount(
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        read_only: bool,
    ) -> Self {
        OciSpecOpt::BindMount {
            source: source.into(),
            destination: destination.into(),
            read_only,
        }
    }

    /// Wraps a closure as a transform.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&mut Spec) -> Result<(), String> + Send + Sync + 'static,
    {
        OciSpecOpt::Custom(Arc::new(f))
    }

    fn apply(&self, spec: &mut Spec) -> Result<(), ClientError> {
        match self {
            OciSpecOpt::Mounts(mounts) => add_mounts(spec, mounts.iter().cloned()),
            OciSpecOpt::BindMount {
                source,
                destination,
                read_only,
            } => {
                let mode = if *read_only { "ro" } else { "rw" };
                let mount = MountBuilder::default()
                    .destination(destination.clone())
                    .typ("bind")
                    .source(source.clone())
                    .options(vec!["rbind".to_string(), mode.to_string()])
                    .build()
                    .map_err(|e| ClientError::Spec(e.to_string()))?;
                add_mounts(spec, [mount]);
            }
            OciSpecOpt::Env(env) => {
                with_process(spec, |p| {
                    let merged = merge_env(p.env().clone().unwrap_or_default(), env);
                    p.set_env(Some(merged));
                });
            }
            OciSpecOpt::User { uid, gid } => with_process(spec, |p| {
                let mut user = p.user().clone();
                user.set_uid(*uid).set_gid(*gid);
                p.set_user(user);
            }),
            OciSpecOpt::Cwd(dir) => with_process(spec, |p| {
                p.set_cwd(dir.clone());
            }),
            OciSpecOpt::Hostname(name) => {
                spec.set_hostname(Some(name.clone()));
            }
            OciSpecOpt::Custom(f) => f(spec).map_err(ClientError::Spec)?,
        }
        Ok(())
    }
}

impl fmt::Debug for OciSpecOpt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OciSpecOpt::Mounts(m) => f.debug_tuple("Mounts").field(&m.len()).finish(),
            OciSpecOpt::BindMount {
                source,
                destination,
                read_only,
            } => f
                .debug_struct("BindMount")
                .field("source", source)
                .field("destination", destination)
                .field("read_only", read_only)
                .finish(),
            OciSpecOpt::Env(env) => f.debug_tuple("Env").field(env).finish(),
            OciSpecOpt::User { uid, gid } => f
                .debug_struct("User")
                .field("uid", uid)
                .field("gid", gid)
                .finish(),
            OciSpecOpt::Cwd(dir) => f.debug_tuple("Cwd").field(dir).finish(),
            OciSpecOpt::Hostname(h) => f.debug_tuple("Hostname").field(h).finish(),
            OciSpecOpt::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Builds the runtime spec of one container.
pub(crate) fn generate(
    defaults: &ImageDefaults,
    argv: &[String],
    env: &[(String, String)],
    opts: &[OciSpecOpt],
) -> Result<Spec, ClientError> {
    let mut spec = Spec::default();

    with_process(&mut spec, |p| {
        let base = p.env().clone().unwrap_or_default();
        let image_env = defaults.env.iter().filter_map(|kv| {
            kv.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
        });
        let image_env: Vec<_> = image_env.collect();
        let merged = merge_env(merge_env(base, &image_env), env);
        p.set_env(Some(merged));
        p.set_args(Some(argv.to_vec()));
        if let Some(dir) = &defaults.working_dir {
            p.set_cwd(PathBuf::from(dir));
        }
        if let Some((uid, gid)) = defaults.user {
            let mut user = p.user().clone();
            user.set_uid(uid).set_gid(gid);
            p.set_user(user);
        }
    });

    for opt in opts {
        opt.apply(&mut spec)?;
    }
    Ok(spec)
}

fn with_process(spec: &mut Spec, f: impl FnOnce(&mut Process)) {
    let mut process = spec.process().clone().unwrap_or_default();
    f(&mut process);
    spec.set_process(Some(process));
}

fn add_mounts(spec: &mut Spec, extra: impl IntoIterator<Item = Mount>) {
    let mut mounts = spec.mounts().clone().unwrap_or_default();
    mounts.extend(extra);
    spec.set_mounts(Some(mounts));
}

/// Applies `overrides` to `KEY=VALUE` entries; replaced keys keep their position.
fn merge_env(mut base: Vec<String>, overrides: &[(String, String)]) -> Vec<String> {
    for (key, value) in overrides {
        let entry = format!("{key}={value}");
        let prefix = format!("{key}=");
        match base.iter_mut().find(|kv| kv.starts_with(&prefix)) {
            Some(slot) => *slot = entry,
            None => base.push(entry),
        }
    }
    base
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    fn pairs(kv: &[(&str, &str)]) -> Vec<(String, String)> {
        kv.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn args_and_env_override_image_defaults() {
        let defaults = ImageDefaults {
            env: vec!["PATH=/image/bin".into(), "LANG=C".into()],
            working_dir: Some("/srv".into()),
            user: Some((1000, 1000)),
        };
        let spec = generate(
            &defaults,
            &argv(&["/bin/sh", "-c", "true"]),
            &pairs(&[("LANG", "en_US"), ("MODE", "x")]),
            &[],
        )
        .unwrap();

        let process = spec.process().as_ref().unwrap();
        assert_eq!(process.args().as_ref().unwrap(), &argv(&["/bin/sh", "-c", "true"]));
        let env = process.env().as_ref().unwrap();
        assert!(env.contains(&"PATH=/image/bin".to_string()));
        assert!(env.contains(&"LANG=en_US".to_string()));
        assert!(env.contains(&"MODE=x".to_string()));
        assert!(!env.contains(&"LANG=C".to_string()));
        assert_eq!(process.cwd(), &PathBuf::from("/srv"));
        assert_eq!(process.user().uid(), 1000);
    }

    #[test]
    fn opts_apply_in_order() {
        let opts = vec![
            OciSpecOpt::Cwd("/first".into()),
            OciSpecOpt::Env(pairs(&[("A", "1")])),
            OciSpecOpt::custom(|spec| {
                spec.set_hostname(Some("custom".into()));
                Ok(())
            }),
            OciSpecOpt::Cwd("/second".into()),
            OciSpecOpt::Env(pairs(&[("A", "2")])),
            OciSpecOpt::User { uid: 7, gid: 8 },
        ];
        let spec = generate(&ImageDefaults::default(), &argv(&["true"]), &[], &opts).unwrap();

        let process = spec.process().as_ref().unwrap();
        assert_eq!(process.cwd(), &PathBuf::from("/second"));
        assert!(process.env().as_ref().unwrap().contains(&"A=2".to_string()));
        assert_eq!((process.user().uid(), process.user().gid()), (7, 8));
        assert_eq!(spec.hostname().as_deref(), Some("custom"));
    }

    #[test]
    fn bind_mount_is_appended() {
        let before = Spec::default().mounts().clone().unwrap_or_default().len();
        let spec = generate(
            &ImageDefaults::default(),
            &argv(&["true"]),
            &[],
            &[OciSpecOpt::bind_mount("/host/flags", "/flags", true)],
        )
        .unwrap();

        let mounts = spec.mounts().as_ref().unwrap();
        assert_eq!(mounts.len(), before + 1);
        let bind = mounts.last().unwrap();
        assert_eq!(bind.destination(), &PathBuf::from("/flags"));
        assert_eq!(bind.source().as_ref().unwrap(), &PathBuf::from("/host/flags"));
        assert!(bind.options().as_ref().unwrap().contains(&"ro".to_string()));
    }

    #[test]
    fn failing_custom_opt_is_spec_error() {
        let err = generate(
            &ImageDefaults::default(),
            &argv(&["true"]),
            &[],
            &[OciSpecOpt::custom(|_| Err("nope".into()))],
        )
        .unwrap_err();
        assert_eq!(err.as_label(), "client_spec");
    }
}
