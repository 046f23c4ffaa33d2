//! Bidirectional byte proxy between a local TCP connection and a remote
//! data stream.
//!
//! Each direction runs its own copier. When a copier's source reaches EOF
//! it half-closes its destination so the peer observes end-of-data, and the
//! opposite direction keeps running until its own source ends. Completion
//! is declared only after both directions finish.

use gunnel_transport::TunnelStream;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

const COPY_BUF_SIZE: usize = 32 * 1024;

/// Copy bytes from `reader` to `writer` until EOF, then half-close the
/// writer. Returns the byte count.
///
/// `read_timeout` bounds each individual read; it applies on the direction
/// reading the remote stream, mirroring the transport's per-call deadline.
/// A timed-out or peer-reset direction ends quietly; the other direction is
/// left to finish on its own half-close.
pub async fn copy_half<R, W>(
    mut reader: R,
    mut writer: W,
    read_timeout: Option<Duration>,
    direction: &'static str,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut total: u64 = 0;

    let result = loop {
        let read = match read_timeout {
            Some(deadline) => match timeout(deadline, reader.read(&mut buf)).await {
                Ok(read) => read,
                Err(_) => {
                    warn!(direction, total, "copy read deadline exceeded");
                    break Ok(());
                }
            },
            None => reader.read(&mut buf).await,
        };

        let n = match read {
            Ok(0) => {
                trace!(direction, total, "EOF reached, copy complete");
                break Ok(());
            }
            Ok(n) => n,
            Err(e) if is_normal_close(&e) => {
                trace!(direction, total, "peer closed, copy complete");
                break Ok(());
            }
            Err(e) => break Err(e),
        };

        if let Err(e) = writer.write_all(&buf[..n]).await {
            if is_normal_close(&e) {
                trace!(direction, total, "destination closed, copy complete");
                break Ok(());
            }
            break Err(e);
        }
        total += n as u64;
    };

    // Signal end-of-data to the destination regardless of how the copy
    // ended; the source's read side stays untouched.
    if let Err(e) = writer.shutdown().await {
        if !is_normal_close(&e) {
            debug!(direction, error = %e, "failed to half-close destination");
        }
    }

    result.map(|_| total)
}

fn is_normal_close(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

/// A tunnel between a local TCP connection and a remote data stream.
pub struct Tunnel {
    local: TcpStream,
    remote: TunnelStream,
    stream_read_timeout: Duration,
}

impl Tunnel {
    pub fn new(local: TcpStream, remote: TunnelStream) -> Self {
        Self {
            local,
            remote,
            stream_read_timeout: Duration::from_secs(15),
        }
    }

    pub fn with_stream_read_timeout(mut self, deadline: Duration) -> Self {
        self.stream_read_timeout = deadline;
        self
    }

    /// Run both copiers to completion and close everything.
    ///
    /// Returns `(local_to_remote, remote_to_local)` byte counts. Per-
    /// direction errors are logged, not propagated; the peer's half-close
    /// drives the surviving direction to its own end.
    pub async fn proxy(self) -> (u64, u64) {
        let (local_read, local_write) = self.local.into_split();
        let (remote_write, remote_read) = self.remote.split();

        let to_remote = async {
            match copy_half(local_read, remote_write, None, "local_to_remote").await {
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, direction = "local_to_remote", "copy failed");
                    0
                }
            }
        };

        let deadline = self.stream_read_timeout;
        let to_local = async {
            match copy_half(remote_read, local_write, Some(deadline), "remote_to_local").await {
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, direction = "remote_to_local", "copy failed");
                    0
                }
            }
        };

        let (sent, received) = tokio::join!(to_remote, to_local);
        debug!(sent, received, "tunnel complete");
        (sent, received)
    }
}
