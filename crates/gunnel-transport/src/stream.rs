//! Framed tunnel streams over quinn bidirectional streams.

use crate::{TransportError, TransportResult};
use bytes::BytesMut;
use gunnel_metrics::{MetricsRegistry, StreamInfo};
use gunnel_proto::{Frame, Message, ProtoError, HEADER_SIZE};
use quinn::{RecvStream, SendStream};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

const RECV_CHUNK: usize = 8192;

/// Stream identifier in the form `strm-<initiator>-<num>`.
pub(crate) fn stream_id_label(id: quinn::StreamId) -> String {
    let initiator = match id.initiator() {
        quinn::Side::Client => "client",
        quinn::Side::Server => "server",
    };
    format!("strm-{}-{}", initiator, id.index())
}

/// Marks the stream info inactive when the last owner lets go, so metrics
/// and the janitor see streams that were dropped without an explicit close.
struct ActiveTag(Arc<StreamInfo>);

impl Drop for ActiveTag {
    fn drop(&mut self) {
        self.0.mark_inactive();
    }
}

/// One bidirectional stream of a session: either the control stream or a
/// per-request data stream.
///
/// Reads and writes carry a deadline that refreshes on every successful
/// call; a deadline miss surfaces as the transient
/// [`TransportError::Timeout`]. The stream's cancellation token fires when
/// the session closes, the janitor sweeps it, or either side resets.
pub struct TunnelStream {
    send: SendStream,
    recv: RecvStream,
    id: String,
    info: Arc<StreamInfo>,
    metrics: MetricsRegistry,
    cancel: CancellationToken,
    io_deadline: Duration,
    /// Bytes read past the last decoded frame; raw reads drain this first.
    recv_buf: BytesMut,
    tag: ActiveTag,
}

impl TunnelStream {
    pub(crate) fn new(
        send: SendStream,
        recv: RecvStream,
        metrics: MetricsRegistry,
        cancel: CancellationToken,
        io_deadline: Duration,
    ) -> Self {
        let id = stream_id_label(send.id());
        let info = metrics.register_stream(id.clone());
        Self {
            send,
            recv,
            id,
            tag: ActiveTag(info.clone()),
            info,
            metrics,
            cancel,
            io_deadline,
            recv_buf: BytesMut::with_capacity(RECV_CHUNK),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn info(&self) -> &Arc<StreamInfo> {
        &self.info
    }

    pub fn set_subdomain(&self, subdomain: &str) {
        self.info.set_subdomain(subdomain);
    }

    /// Handle that fires when the stream is torn down from either side.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Encode and write one message as a single write.
    pub async fn send_message(&mut self, msg: &Message) -> TransportResult<()> {
        let encoded = msg.encode()?;
        self.write_all(&encoded).await?;

        trace!(stream_id = %self.id, kind = %msg.kind(), size = encoded.len(), "sent message");
        Ok(())
    }

    /// Read the next framed message.
    ///
    /// Frames with an unknown kind byte are logged and skipped rather than
    /// failing the stream. Returns `Ok(None)` on a clean end of stream.
    ///
    /// No I/O deadline applies here: control streams legitimately sit idle
    /// between messages, and liveness is the heartbeat watchdog's job.
    /// Callers that need a bound (e.g. the readiness wait) wrap the call in
    /// their own timeout.
    pub async fn recv_message(&mut self) -> TransportResult<Option<Message>> {
        recv_message_inner(
            &mut self.recv,
            &mut self.recv_buf,
            &self.id,
            &self.info,
            &self.metrics,
            &self.cancel,
        )
        .await
    }

    /// Read raw bytes, draining anything buffered past the framed phase
    /// first. Returns `Ok(0)` on end of stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> TransportResult<usize> {
        if !self.recv_buf.is_empty() {
            let n = self.recv_buf.len().min(buf.len());
            buf[..n].copy_from_slice(&self.recv_buf.split_to(n));
            self.metrics.record_in(&self.info, n);
            return Ok(n);
        }

        let cancel = self.cancel.clone();
        let read = tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            read = timeout(self.io_deadline, self.recv.read(buf)) => read,
        };

        match read {
            Err(_) => Err(TransportError::Timeout),
            Ok(Ok(Some(n))) => {
                self.metrics.record_in(&self.info, n);
                Ok(n)
            }
            Ok(Ok(None)) => Ok(0),
            Ok(Err(e)) => Err(self.map_read_error(e)),
        }
    }

    /// Write all bytes within the deadline.
    pub async fn write_all(&mut self, buf: &[u8]) -> TransportResult<()> {
        let cancel = self.cancel.clone();
        let write = tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            write = timeout(self.io_deadline, self.send.write_all(buf)) => write,
        };

        match write {
            Err(_) => Err(TransportError::Timeout),
            Ok(Ok(())) => {
                self.metrics.record_out(&self.info, buf.len());
                Ok(())
            }
            Ok(Err(e)) => Err(self.map_write_error(e)),
        }
    }

    /// Half-close: finish the send side so the peer observes EOF, keeping
    /// the receive side open.
    pub fn close_write(&mut self) -> TransportResult<()> {
        // Finishing an already-finished stream is a no-op.
        let _ = self.send.finish();
        Ok(())
    }

    /// Close both directions and mark the stream inactive. Idempotent.
    pub fn close(&mut self) {
        let _ = self.send.finish();
        let _ = self.recv.stop(quinn::VarInt::from_u32(0));
        self.info.mark_inactive();
        self.cancel.cancel();
    }

    /// Split into halves for concurrent use by separate tasks.
    pub fn split(self) -> (SendHalf, RecvHalf) {
        let send = SendHalf {
            send: self.send,
            id: self.id.clone(),
            info: self.info.clone(),
            metrics: self.metrics.clone(),
            cancel: self.cancel.clone(),
            io_deadline: self.io_deadline,
        };
        let recv = RecvHalf {
            recv: self.recv,
            recv_buf: self.recv_buf,
            id: self.id,
            info: self.info,
            metrics: self.metrics,
            cancel: self.cancel,
            _tag: self.tag,
        };
        (send, recv)
    }

    fn map_read_error(&self, e: quinn::ReadError) -> TransportError {
        match e {
            quinn::ReadError::ConnectionLost(_) => TransportError::ConnectionClosed,
            quinn::ReadError::Reset(_) => {
                self.cancel.cancel();
                TransportError::StreamClosed
            }
            _ => TransportError::StreamClosed,
        }
    }

    fn map_write_error(&self, e: quinn::WriteError) -> TransportError {
        match e {
            quinn::WriteError::ConnectionLost(_) => TransportError::ConnectionClosed,
            quinn::WriteError::Stopped(_) => {
                self.cancel.cancel();
                TransportError::StreamClosed
            }
            _ => TransportError::StreamClosed,
        }
    }
}

/// Shared framed-receive loop used by both the whole stream and its read
/// half.
async fn recv_message_inner(
    recv: &mut RecvStream,
    recv_buf: &mut BytesMut,
    id: &str,
    info: &Arc<StreamInfo>,
    metrics: &MetricsRegistry,
    cancel: &CancellationToken,
) -> TransportResult<Option<Message>> {
    loop {
        if let Some(frame) = Frame::decode(recv_buf)? {
            match Message::from_frame(&frame) {
                Ok(msg) => {
                    metrics.record_in(info, HEADER_SIZE + frame.payload.len());
                    trace!(stream_id = %id, kind = %msg.kind(), "received message");
                    return Ok(Some(msg));
                }
                Err(ProtoError::UnknownType(kind)) => {
                    warn!(stream_id = %id, kind, "dropping frame with unknown type");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }

        let read = tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            read = recv.read_chunk(RECV_CHUNK, true) => read,
        };

        match read {
            Ok(Some(chunk)) => recv_buf.extend_from_slice(&chunk.bytes),
            Ok(None) => {
                if recv_buf.is_empty() {
                    return Ok(None);
                }
                return Err(ProtoError::MalformedFrame("stream ended mid-frame").into());
            }
            Err(quinn::ReadError::ConnectionLost(_)) => {
                return Err(TransportError::ConnectionClosed)
            }
            Err(quinn::ReadError::Reset(_)) => {
                cancel.cancel();
                return Err(TransportError::StreamClosed);
            }
            Err(_) => return Err(TransportError::StreamClosed),
        }
    }
}

/// Write half of a split stream. `poll_shutdown` finishes the QUIC send
/// side, which the peer observes as EOF.
pub struct SendHalf {
    send: SendStream,
    id: String,
    info: Arc<StreamInfo>,
    metrics: MetricsRegistry,
    cancel: CancellationToken,
    io_deadline: Duration,
}

impl SendHalf {
    pub fn info(&self) -> &Arc<StreamInfo> {
        &self.info
    }

    /// Encode and write one message as a single write, bounded by the
    /// write deadline.
    pub async fn send_message(&mut self, msg: &Message) -> TransportResult<()> {
        let encoded = msg.encode()?;

        let cancel = self.cancel.clone();
        let write = tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            write = timeout(self.io_deadline, self.send.write_all(&encoded)) => write,
        };

        match write {
            Err(_) => Err(TransportError::Timeout),
            Ok(Ok(())) => {
                self.metrics.record_out(&self.info, encoded.len());
                trace!(stream_id = %self.id, kind = %msg.kind(), "sent message");
                Ok(())
            }
            Ok(Err(quinn::WriteError::ConnectionLost(_))) => {
                Err(TransportError::ConnectionClosed)
            }
            Ok(Err(quinn::WriteError::Stopped(_))) => {
                self.cancel.cancel();
                Err(TransportError::StreamClosed)
            }
            Ok(Err(_)) => Err(TransportError::StreamClosed),
        }
    }

    /// Finish the send side; the peer observes EOF.
    pub fn close_write(&mut self) -> TransportResult<()> {
        let _ = self.send.finish();
        Ok(())
    }
}

impl AsyncWrite for SendHalf {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.send), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_flush(Pin::new(&mut self.send), cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_shutdown(Pin::new(&mut self.send), cx)
    }
}

/// Read half of a split stream. Bytes buffered during the framed phase are
/// yielded before new transport reads.
pub struct RecvHalf {
    recv: RecvStream,
    recv_buf: BytesMut,
    id: String,
    info: Arc<StreamInfo>,
    metrics: MetricsRegistry,
    cancel: CancellationToken,
    // Keeps the stream marked active until this half is dropped.
    _tag: ActiveTag,
}

impl RecvHalf {
    pub fn info(&self) -> &Arc<StreamInfo> {
        &self.info
    }

    /// Read the next framed message; see [`TunnelStream::recv_message`].
    pub async fn recv_message(&mut self) -> TransportResult<Option<Message>> {
        recv_message_inner(
            &mut self.recv,
            &mut self.recv_buf,
            &self.id,
            &self.info,
            &self.metrics,
            &self.cancel,
        )
        .await
    }
}

impl AsyncRead for RecvHalf {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.recv_buf.is_empty() {
            let n = self.recv_buf.len().min(buf.remaining());
            let chunk = self.recv_buf.split_to(n);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.recv).poll_read(cx, buf)
    }
}

#[cfg(test)]
mod tests {
    // Stream behaviour requires a live QUIC pair and is covered by the
    // integration tests in tests/transport_roundtrip.rs.
}
