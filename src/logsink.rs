//! # Per-workload log file.
//!
//! [`LogSink`] owns `<log_path>/<id>.log` for the duration of one `run`. The file is
//! opened once, in append-create mode, before the first spawn; every attempt's
//! stdout and stderr are bound to duplicates of that single descriptor, so bytes of
//! attempt N land before bytes of attempt N+1 without any user-space buffering.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use crate::error::RunnerError;

/// Permissions of newly created log files.
const LOG_FILE_MODE: u32 = 0o640;

/// Append-only log file shared by all attempts of one run.
#[derive(Debug)]
pub struct LogSink {
    path: PathBuf,
    file: Option<File>,
}

impl LogSink {
    /// Creates a closed sink for `<dir>/<id>.log`.
    pub fn new(dir: &Path, id: &str) -> Self {
        Self {
            path: dir.join(format!("{id}.log")),
            file: None,
        }
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the file is currently open.
    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Opens the file (creating the directory if needed). No-op when already open.
    pub fn open(&mut self) -> Result<(), RunnerError> {
        if self.file.is_some() {
            return Ok(());
        }
        let setup_err = |source| RunnerError::LogSetup {
            path: self.path.clone(),
            source,
        };
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(setup_err)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(LOG_FILE_MODE)
            .open(&self.path)
            .map_err(setup_err)?;
        self.file = Some(file);
        Ok(())
    }

    /// Duplicates the descriptor for use by a child or a stream copier.
    pub fn try_clone_file(&self) -> io::Result<File> {
        match &self.file {
            Some(file) => file.try_clone(),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("log sink {} is not open", self.path.display()),
            )),
        }
    }

    /// Duplicates the descriptor as a child stdio handle.
    pub fn stdio(&self) -> io::Result<Stdio> {
        self.try_clone_file().map(Stdio::from)
    }

    /// Appends one diagnostic line; silently skipped when the sink is closed.
    pub fn note(&self, line: &str) {
        if let Some(mut file) = self.file.as_ref() {
            let _ = writeln!(file, "[runvisor] {line}");
        }
    }

    /// Closes the file. Closing a never-opened sink is a no-op.
    pub fn close(&mut self) {
        self.file = None;
    }
}
