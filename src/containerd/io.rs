//! # Task stream plumbing.
//!
//! A task writes stdout and stderr into two FIFOs created per attempt under
//! `$TMPDIR/runvisor-fifo/<namespace>/<id>-<attempt>/`. Each FIFO is drained by a
//! copier task into a duplicate of the log sink descriptor.
//!
//! Copiers open their FIFO read-write, so the task side never blocks on open and the
//! copier never sees EOF while the task's writers come and go. On [`FifoSet::close`]
//! they read what is still buffered, flush, and stop.

use std::io;
use std::path::{Path, PathBuf};

use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::select;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::runtime::TaskIo;
use crate::logsink::LogSink;

const FIFO_ROOT: &str = "runvisor-fifo";
const COPY_BUF: usize = 8 * 1024;

/// FIFOs and copiers of one attempt.
pub(crate) struct FifoSet {
    dir: PathBuf,
    io: TaskIo,
    drain: CancellationToken,
    copiers: Vec<JoinHandle<io::Result<()>>>,
}

impl FifoSet {
    /// Creates the FIFOs and starts copying them into `sink`.
    pub(crate) fn create(ns: &str, id: &str, attempt: u32, sink: &LogSink) -> io::Result<Self> {
        let dir = std::env::temp_dir()
            .join(FIFO_ROOT)
            .join(ns)
            .join(format!("{id}-{attempt}"));
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        std::fs::create_dir_all(&dir)?;

        let io = TaskIo {
            stdout: dir.join("stdout"),
            stderr: dir.join("stderr"),
        };
        let mut set = Self {
            dir,
            io,
            drain: CancellationToken::new(),
            copiers: Vec::with_capacity(2),
        };
        for path in [set.io.stdout.clone(), set.io.stderr.clone()] {
            if let Err(e) = set.spawn_copier(&path, sink) {
                set.abort();
                return Err(e);
            }
        }
        Ok(set)
    }

    /// Stream endpoints to hand to the task.
    pub(crate) fn io(&self) -> &TaskIo {
        &self.io
    }

    fn spawn_copier(&mut self, path: &Path, sink: &LogSink) -> io::Result<()> {
        mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(io::Error::from)?;
        let rx = pipe::OpenOptions::new()
            .read_write(true)
            .open_receiver(path)?;
        let out = tokio::fs::File::from_std(sink.try_clone_file()?);
        let drain = self.drain.clone();
        self.copiers.push(tokio::spawn(copy_fifo(rx, out, drain)));
        Ok(())
    }

    /// Drains remaining bytes, stops the copiers, and removes the FIFO directory.
    pub(crate) async fn close(mut self) -> io::Result<()> {
        self.drain.cancel();
        let mut first_err = None;
        for copier in self.copiers.drain(..) {
            let res = match copier.await {
                Ok(res) => res,
                Err(join) => Err(io::Error::other(join)),
            };
            if let Err(e) = res {
                first_err.get_or_insert(e);
            }
        }
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            if e.kind() != io::ErrorKind::NotFound {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stops copiers without draining and removes the directory (best effort).
    fn abort(&mut self) {
        for copier in self.copiers.drain(..) {
            copier.abort();
        }
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

impl Drop for FifoSet {
    fn drop(&mut self) {
        if !self.copiers.is_empty() {
            self.abort();
        }
    }
}

async fn copy_fifo(
    mut rx: pipe::Receiver,
    mut out: tokio::fs::File,
    drain: CancellationToken,
) -> io::Result<()> {
    let mut buf = vec![0u8; COPY_BUF];
    loop {
        select! {
            biased;
            _ = drain.cancelled() => {
                loop {
                    match rx.try_read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => out.write_all(&buf[..n]).await?,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) => return Err(e),
                    }
                }
                break;
            }
            res = rx.read(&mut buf) => {
                let n = res?;
                if n == 0 {
                    break;
                }
                out.write_all(&buf[..n]).await?;
            }
        }
    }
    out.flush().await
}
