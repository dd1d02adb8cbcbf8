//! Exec stream multiplexing
//!
//! Copies a remote command's stdout into a capture sink and its stderr into
//! a second writer, then decodes the exit status. Operator cancellation ends
//! the copy early and counts as a clean stop.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::StreamError;
use crate::gateway::{BoxedReader, BoxedWriter, ExecChannels, RemoteStatus};

const COPY_BUFFER: usize = 32 * 1024;

/// What a finished stream produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamSummary {
    /// Bytes written to the stdout sink
    pub bytes: u64,
    /// Capture ended because the operator cancelled
    pub stopped_by_operator: bool,
}

/// An open remote command.
pub struct RemoteCommand {
    stdin: Option<BoxedWriter>,
    stdout: Option<BoxedReader>,
    stderr: Option<BoxedReader>,
    status: BoxFuture<'static, Option<RemoteStatus>>,
}

impl From<ExecChannels> for RemoteCommand {
    fn from(channels: ExecChannels) -> Self {
        Self {
            stdin: channels.stdin,
            stdout: channels.stdout,
            stderr: channels.stderr,
            status: channels.status,
        }
    }
}

impl RemoteCommand {
    /// Take the input channel. `None` when the exec was opened without stdin.
    pub fn take_stdin(&mut self) -> Option<BoxedWriter> {
        self.stdin.take()
    }

    /// Relay output until the command exits or `cancel` fires.
    ///
    /// Exit 0 and cancellation are `Ok`. A non-zero exit is
    /// `StreamError::RemoteExit`; a connection that closes without a status is
    /// `StreamError::Transport`.
    pub async fn pump<O, E>(
        self,
        stdout_sink: &mut O,
        stderr_sink: &mut E,
        cancel: &CancellationToken,
    ) -> Result<StreamSummary, StreamError>
    where
        O: AsyncWrite + Unpin + Send + ?Sized,
        E: AsyncWrite + Unpin + Send + ?Sized,
    {
        let Self {
            stdin,
            stdout,
            stderr,
            status,
        } = self;
        // Unused input is closed so the remote side sees EOF.
        drop(stdin);

        let mut bytes = 0u64;
        let mut stderr_bytes = 0u64;
        let outcome = {
            let relay = async {
                let (out, err) = tokio::join!(
                    copy_counted(stdout, stdout_sink, &mut bytes),
                    copy_counted(stderr, stderr_sink, &mut stderr_bytes),
                );
                out?;
                err?;
                Ok::<_, StreamError>(status.await)
            };
            tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                result = relay => Some(result),
            }
        };

        let Some(result) = outcome else {
            let _ = stdout_sink.flush().await;
            debug!(bytes, stderr_bytes, "Stream stopped by operator");
            return Ok(StreamSummary {
                bytes,
                stopped_by_operator: true,
            });
        };

        match result? {
            Some(RemoteStatus::Success) => Ok(StreamSummary {
                bytes,
                stopped_by_operator: false,
            }),
            Some(RemoteStatus::Exit(code)) => Err(StreamError::RemoteExit { code }),
            Some(RemoteStatus::Failure(message)) => Err(StreamError::Rejected(message)),
            None => Err(StreamError::Transport(
                "connection closed without an exit status".to_string(),
            )),
        }
    }
}

async fn copy_counted<W>(
    reader: Option<BoxedReader>,
    writer: &mut W,
    counter: &mut u64,
) -> Result<(), StreamError>
where
    W: AsyncWrite + Unpin + Send + ?Sized,
{
    let Some(mut reader) = reader else {
        return Ok(());
    };
    let mut buf = vec![0u8; COPY_BUFFER];
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| StreamError::Transport(e.to_string()))?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await.map_err(StreamError::Sink)?;
        writer.flush().await.map_err(StreamError::Sink)?;
        *counter += n as u64;
    }
    Ok(())
}

/// Writer that turns each complete line into a log event.
///
/// Remote stderr (e.g. tcpdump's "listening on ..." banner) is routed here so
/// it never mixes with capture bytes.
#[derive(Debug)]
pub struct LogLines {
    source: String,
    pending: Vec<u8>,
}

impl LogLines {
    #[must_use]
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            pending: Vec::new(),
        }
    }

    fn emit(&self, line: &[u8]) {
        let text = String::from_utf8_lossy(line);
        let text = text.trim_end();
        if !text.is_empty() {
            info!(target: "knet::remote", source = %self.source, "{text}");
        }
    }
}

impl AsyncWrite for LogLines {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.pending.extend_from_slice(buf);
        while let Some(pos) = this.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = this.pending.drain(..=pos).collect();
            this.emit(&line);
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.pending.is_empty() {
            let rest = std::mem::take(&mut this.pending);
            this.emit(&rest);
        }
        Poll::Ready(Ok(()))
    }
}

/// Forward everything from `input` to the remote stdin, then close it.
pub async fn forward_stdin<R>(mut input: R, mut remote: BoxedWriter) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let copied = tokio::io::copy(&mut input, &mut remote).await?;
    remote.shutdown().await?;
    Ok(copied)
}
