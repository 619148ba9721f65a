//! # Workload identity and invocation.
//!
//! [`Args`] names a workload and says what to execute. The `id` doubles as the log
//! file stem and, in the container backend, as the container/task identifier, so it
//! has to be both filesystem-safe and acceptable to the container runtime.

use crate::error::RunnerError;

/// Longest identifier the container runtime accepts.
const MAX_ID_LEN: usize = 76;

/// Identity and invocation of a workload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Args {
    /// Short unique name: log file stem and container/task id.
    pub id: String,
    /// Non-empty argv; `process_args[0]` is the executable inside the chosen rootfs.
    pub process_args: Vec<String>,
    /// Extra environment for the child.
    pub env: Vec<(String, String)>,
}

impl Args {
    /// Creates args from an id and an argv.
    pub fn new<I, S>(id: impl Into<String>, process_args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            process_args: process_args.into_iter().map(Into::into).collect(),
            env: Vec::new(),
        }
    }

    /// Returns args with an extra environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Checks the invariants every backend relies on.
    pub fn validate(&self) -> Result<(), RunnerError> {
        if self.id.is_empty() {
            return Err(RunnerError::config("workload id is empty"));
        }
        if self.id.len() > MAX_ID_LEN {
            return Err(RunnerError::config(format!(
                "workload id {:?} is longer than {MAX_ID_LEN} characters",
                self.id
            )));
        }
        let mut chars = self.id.chars();
        let first_ok = chars.next().is_some_and(|c| c.is_ascii_alphanumeric());
        let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
        if !first_ok || !rest_ok {
            return Err(RunnerError::config(format!(
                "workload id {:?} must match [A-Za-z0-9][A-Za-z0-9_.-]*",
                self.id
            )));
        }
        match self.process_args.first() {
            None => Err(RunnerError::config(format!(
                "{}: process args are empty",
                self.id
            ))),
            Some(exe) if exe.is_empty() => Err(RunnerError::config(format!(
                "{}: executable path is empty",
                self.id
            ))),
            Some(_) => Ok(()),
        }
    }
}
