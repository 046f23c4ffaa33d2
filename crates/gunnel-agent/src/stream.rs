//! Per-request data stream handling on the agent side.

use crate::config::BackendConfig;
use gunnel_proto::Message;
use gunnel_transport::TunnelStream;
use gunnel_tunnel::Tunnel;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Serve one data stream opened by the hub.
///
/// The first frame decides everything: `BeginStream` starts a proxied
/// request, control kinds close the stream, anything else is answered with
/// an error.
pub async fn handle_stream(
    mut stream: TunnelStream,
    backends: Arc<HashMap<String, BackendConfig>>,
    dial_timeout: Duration,
) {
    let stream_id = stream.id().to_string();

    match stream.recv_message().await {
        Ok(Some(Message::BeginStream { subdomain })) => {
            handle_begin_stream(stream, &subdomain, &backends, dial_timeout).await;
        }
        Ok(Some(Message::Disconnect { reason })) => {
            info!(stream_id, reason, "hub closed the stream");
            stream.close();
        }
        Ok(Some(Message::EndStream { .. })) => {
            debug!(stream_id, "received end stream");
            stream.close();
        }
        Ok(Some(Message::Error { message })) => {
            error!(stream_id, message, "hub sent error");
            stream.close();
        }
        Ok(Some(other)) => {
            warn!(stream_id, kind = %other.kind(), "unexpected first message on data stream");
            let _ = stream
                .send_message(&Message::Error {
                    message: "Unknown message type".to_string(),
                })
                .await;
            stream.close();
        }
        Ok(None) => {
            debug!(stream_id, "stream ended before any message");
            stream.close();
        }
        Err(e) => {
            error!(stream_id, error = %e, "failed to read first message");
            stream.close();
        }
    }
}

async fn handle_begin_stream(
    mut stream: TunnelStream,
    subdomain: &str,
    backends: &HashMap<String, BackendConfig>,
    dial_timeout: Duration,
) {
    let stream_id = stream.id().to_string();

    let Some(backend) = backends.get(subdomain) else {
        error!(stream_id, subdomain, "no backend found for subdomain");
        let _ = stream
            .send_message(&Message::Error {
                message: format!("no backend found for subdomain: {subdomain}"),
            })
            .await;
        stream.close();
        return;
    };

    stream.set_subdomain(subdomain);

    // Readiness goes out before the dial so the hub can start writing the
    // request while we connect.
    if let Err(e) = stream
        .send_message(&Message::ConnectionReady {
            subdomain: subdomain.to_string(),
        })
        .await
    {
        error!(stream_id, error = %e, "failed to send connection ready");
        stream.close();
        return;
    }

    let backend_addr = backend.addr();
    let local = match timeout(dial_timeout, TcpStream::connect(&backend_addr)).await {
        Ok(Ok(conn)) => conn,
        Ok(Err(e)) => {
            error!(stream_id, backend = %backend_addr, error = %e, "failed to connect to backend");
            stream.close();
            return;
        }
        Err(_) => {
            error!(stream_id, backend = %backend_addr, "timed out connecting to backend");
            stream.close();
            return;
        }
    };

    debug!(stream_id, subdomain, backend = %backend_addr, "proxying request");

    let (sent, received) = Tunnel::new(local, stream).proxy().await;
    debug!(stream_id, sent, received, "request complete");
}
