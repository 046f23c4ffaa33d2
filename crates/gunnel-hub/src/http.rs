//! HTTP front-end plumbing: request-head parsing, subdomain extraction,
//! and raw-socket response writing.
//!
//! The front-end works on raw connections rather than a full HTTP server:
//! the hub only needs the request head to route, and the body bytes are
//! forwarded verbatim to the agent.

use serde::Serialize;
use std::net::IpAddr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const MAX_HEADERS: usize = 100;
const MAX_HEAD_SIZE: usize = 64 * 1024;
const MAX_BODY_SIZE: usize = 32 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("request too large")]
    TooLarge,

    #[error("connection closed while reading request")]
    Closed,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parsed request line and headers.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub header_len: usize,
    pub content_length: Option<usize>,
}

impl RequestHead {
    /// First header value matching `name`, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Read one full HTTP request (head plus Content-Length body) off the
/// connection, returning the parsed head and the raw bytes to forward.
pub async fn read_request<S>(conn: &mut S) -> Result<(RequestHead, Vec<u8>), HttpError>
where
    S: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    let head = loop {
        if buf.len() > MAX_HEAD_SIZE {
            return Err(HttpError::TooLarge);
        }

        let n = conn.read(&mut chunk).await?;
        if n == 0 {
            return Err(HttpError::Closed);
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(&buf) {
            Ok(httparse::Status::Complete(header_len)) => {
                let method = req.method.unwrap_or("").to_string();
                let path = req.path.unwrap_or("/").to_string();
                let parsed_headers: Vec<(String, String)> = req
                    .headers
                    .iter()
                    .map(|h| {
                        (
                            h.name.to_string(),
                            String::from_utf8_lossy(h.value).to_string(),
                        )
                    })
                    .collect();

                let content_length = parsed_headers
                    .iter()
                    .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, v)| v.trim().parse::<usize>().ok());

                break RequestHead {
                    method,
                    path,
                    headers: parsed_headers,
                    header_len,
                    content_length,
                };
            }
            Ok(httparse::Status::Partial) => continue,
            Err(e) => return Err(HttpError::Malformed(e.to_string())),
        }
    };

    let body_len = head.content_length.unwrap_or(0);
    if body_len > MAX_BODY_SIZE {
        return Err(HttpError::TooLarge);
    }

    let total = head.header_len + body_len;
    while buf.len() < total {
        let n = conn.read(&mut chunk).await?;
        if n == 0 {
            return Err(HttpError::Closed);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    buf.truncate(total);

    Ok((head, buf))
}

/// Extract the routing subdomain from a Host header value.
///
/// Splits off the port, strips IPv6 brackets and any trailing dot, and
/// returns the leftmost DNS label. IP literals and dot-less hosts have no
/// subdomain.
pub fn extract_subdomain(host_port: &str) -> String {
    let trimmed = host_port.trim();

    // Split host and port. Bracketed IPv6 first, then a single
    // colon-separated port; a bare IPv6 literal keeps all its colons.
    let host = if let Some(end) = trimmed.rfind(']') {
        &trimmed[..=end]
    } else if trimmed.matches(':').count() == 1 {
        trimmed.rsplit_once(':').map(|(h, _)| h).unwrap_or(trimmed)
    } else {
        // No port, or a bare IPv6 literal that keeps all its colons.
        trimmed
    };

    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    let host = host.strip_suffix('.').unwrap_or(host);

    if host.parse::<IpAddr>().is_ok() {
        return String::new();
    }

    match host.split_once('.') {
        Some((label, rest)) if !rest.is_empty() => label.to_string(),
        _ => String::new(),
    }
}

/// A response produced by a collaborator handler (dashboard, ACME).
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn json<T: Serialize>(status: u16, value: &T) -> Self {
        Self {
            status,
            content_type: "application/json".to_string(),
            body: serde_json::to_vec(value).unwrap_or_default(),
        }
    }
}

/// Write a response head and body to the raw connection.
pub async fn write_response<S>(conn: &mut S, resp: &HttpResponse) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        resp.status,
        reason_phrase(resp.status),
        resp.content_type,
        resp.body.len()
    );
    conn.write_all(head.as_bytes()).await?;
    conn.write_all(&resp.body).await?;
    conn.flush().await
}

/// Write the JSON error body every user-facing failure uses.
pub async fn send_json_error<S>(conn: &mut S, status: u16, message: &str)
where
    S: AsyncWrite + Unpin,
{
    #[derive(Serialize)]
    struct ErrorBody<'a> {
        message: &'a str,
    }

    let resp = HttpResponse::json(status, &ErrorBody { message });
    if let Err(e) = write_response(conn, &resp).await {
        tracing::warn!(error = %e, "failed to write error response");
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "",
    }
}
