//! Capture sinks
//!
//! A sink receives the raw capture stream of exactly one session. Sinks are
//! created per target by a [`SinkFactory`] and owned by that session.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::target::Target;

/// Destination for one session's capture bytes.
pub struct CaptureSink {
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    artifact: Option<PathBuf>,
    viewer: Option<Child>,
}

impl std::fmt::Debug for CaptureSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSink")
            .field("artifact", &self.artifact)
            .field("viewer", &self.viewer.as_ref().and_then(Child::id))
            .finish_non_exhaustive()
    }
}

impl CaptureSink {
    /// Create (or truncate) a capture file.
    pub async fn file(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = tokio::fs::File::create(&path).await?;
        Ok(Self {
            writer: Box::new(file),
            artifact: Some(path),
            viewer: None,
        })
    }

    /// Write to this process's stdout.
    #[must_use]
    pub fn stdout() -> Self {
        Self::from_writer(tokio::io::stdout(), None)
    }

    /// Spawn a viewer and write to its stdin.
    pub fn viewer(command: &[String]) -> io::Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty viewer command"))?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("viewer stdin was not captured"))?;
        debug!(viewer = %program, pid = ?child.id(), "Viewer started");
        Ok(Self {
            writer: Box::new(stdin),
            artifact: None,
            viewer: Some(child),
        })
    }

    /// Wrap an arbitrary writer.
    #[must_use]
    pub fn from_writer<W>(writer: W, artifact: Option<PathBuf>) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            writer: Box::new(writer),
            artifact,
            viewer: None,
        }
    }

    /// File the capture lands in, if any.
    #[must_use]
    pub fn artifact(&self) -> Option<&Path> {
        self.artifact.as_deref()
    }

    pub fn writer(&mut self) -> &mut (dyn AsyncWrite + Send + Unpin) {
        &mut *self.writer
    }

    /// Flush and close the sink.
    ///
    /// A viewer is waited for after a natural end so the operator can keep
    /// inspecting; after an operator stop it is killed.
    pub async fn finish(mut self, stopped_by_operator: bool) -> io::Result<()> {
        let closed = async {
            self.writer.flush().await?;
            self.writer.shutdown().await
        }
        .await;
        if let Err(e) = &closed {
            if e.kind() != io::ErrorKind::BrokenPipe {
                warn!(error = %e, "Failed to close capture sink");
            }
        }
        drop(self.writer);

        if let Some(mut viewer) = self.viewer.take() {
            if stopped_by_operator {
                let _ = viewer.start_kill();
            }
            let status = viewer.wait().await?;
            debug!(%status, "Viewer exited");
        }

        match closed {
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
            other => other,
        }
    }
}

/// Opens one sink per target.
#[async_trait]
pub trait SinkFactory: Send + Sync {
    async fn open(&self, target: &Target) -> io::Result<CaptureSink>;

    /// Whether sinks for several targets can coexist. Shared destinations
    /// (stdout, a single viewer) cannot.
    fn supports_multiple_targets(&self) -> bool {
        true
    }
}

/// One `.pcap` file per target under a directory.
#[derive(Debug, Clone)]
pub struct FileSinkFactory {
    dir: PathBuf,
}

impl FileSinkFactory {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<dir>/<namespace>_<pod>[_<container>].pcap`
    #[must_use]
    pub fn path_for(&self, target: &Target) -> PathBuf {
        let mut name = format!("{}_{}", target.namespace, target.pod);
        if let Some(container) = &target.container {
            name.push('_');
            name.push_str(container);
        }
        name.push_str(".pcap");
        self.dir.join(name)
    }
}

#[async_trait]
impl SinkFactory for FileSinkFactory {
    async fn open(&self, target: &Target) -> io::Result<CaptureSink> {
        CaptureSink::file(self.path_for(target)).await
    }
}

/// Raw capture bytes on stdout, e.g. for `| wireshark -k -i -`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdoutSinkFactory;

#[async_trait]
impl SinkFactory for StdoutSinkFactory {
    async fn open(&self, _target: &Target) -> io::Result<CaptureSink> {
        Ok(CaptureSink::stdout())
    }

    fn supports_multiple_targets(&self) -> bool {
        false
    }
}

/// A local viewer process per capture.
#[derive(Debug, Clone)]
pub struct ViewerSinkFactory {
    command: Vec<String>,
}

impl ViewerSinkFactory {
    #[must_use]
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl SinkFactory for ViewerSinkFactory {
    async fn open(&self, _target: &Target) -> io::Result<CaptureSink> {
        CaptureSink::viewer(&self.command)
    }

    fn supports_multiple_targets(&self) -> bool {
        false
    }
}
