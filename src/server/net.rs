//! Reactor-side networking: read one HTTP/1.1 request, write one response.
//!
//! Each connection runs on its own task, so all I/O for a session is
//! serialized without a per-session lock. The loop reads a request, hands the
//! target to the server's get-handler (which runs on the worker pool and
//! completes through a oneshot back into this task), shapes the wire
//! response, writes it, and either loops for the next request (keep-alive) or
//! shuts the stream down.
//!
//! Every read and write is armed with the 30-second idle deadline. Re-arming
//! at each I/O boundary is the contract, not an optimization: a stale
//! deadline tears down connections that are still making progress.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::api::response::{error_text, serialize_metadata, GetResponse, ResponseBody};

use super::session::Session;
use super::ServerCore;

/// Idle deadline re-armed at every I/O boundary.
pub(crate) const IDLE_DEADLINE: Duration = Duration::from_secs(30);

/// Maximum accepted size of a request head.
pub(crate) const HEADER_LIMIT: usize = 1024;

/// Maximum accepted size of a request body.
pub(crate) const BODY_LIMIT: usize = 2048;

/// Value of the `Server` header stamped on every response.
pub(crate) const SERVER_NAME: &str = "Iris RESTful Server";

// =============================================================================
// Request Head
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Method {
    Get,
    Head,
    Other,
}

#[derive(Debug)]
pub(crate) struct RequestHead {
    pub method: Method,
    pub target: String,
    pub minor_version: u8,
    pub keep_alive: bool,
    pub content_length: usize,
}

/// Parse a complete request head (through the blank line).
pub(crate) fn parse_request_head(raw: &[u8]) -> Result<RequestHead, String> {
    let text =
        std::str::from_utf8(raw).map_err(|_| "request head is not valid UTF-8".to_string())?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split(' ').filter(|part| !part.is_empty());
    let method = match parts.next() {
        Some("GET") => Method::Get,
        Some("HEAD") => Method::Head,
        Some(_) => Method::Other,
        None => return Err("empty request line".to_string()),
    };
    let target = parts
        .next()
        .ok_or_else(|| "request line missing target".to_string())?
        .to_string();
    let minor_version = match parts.next() {
        Some("HTTP/1.1") => 1,
        Some("HTTP/1.0") => 0,
        Some(other) => return Err(format!("unsupported HTTP version {other}")),
        None => return Err("request line missing HTTP version".to_string()),
    };

    let mut keep_alive = minor_version == 1;
    let mut content_length = 0usize;
    for line in lines {
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match name.trim().to_ascii_lowercase().as_str() {
            "connection" => {
                let value = value.to_ascii_lowercase();
                if value.contains("close") {
                    keep_alive = false;
                } else if value.contains("keep-alive") {
                    keep_alive = true;
                }
            }
            "content-length" => {
                content_length = value
                    .parse()
                    .map_err(|_| format!("invalid Content-Length value '{value}'"))?;
            }
            _ => {}
        }
    }

    Ok(RequestHead {
        method,
        target,
        minor_version,
        keep_alive,
        content_length,
    })
}

fn find_head_end(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|index| index + 4)
}

// =============================================================================
// Reading
// =============================================================================

pub(crate) enum ReadOutcome {
    Request(RequestHead),
    /// Clean end of stream or idle deadline; close without a response.
    Close,
    /// Synthesize an error response, then close.
    Reject {
        status: u16,
        message: String,
    },
}

enum Fill {
    Data,
    Eof,
    TimedOut,
    Error(io::Error),
}

async fn fill<S: AsyncRead + Unpin>(stream: &mut S, buffer: &mut Vec<u8>) -> Fill {
    let mut chunk = [0u8; 1024];
    match timeout(IDLE_DEADLINE, stream.read(&mut chunk)).await {
        Err(_) => Fill::TimedOut,
        Ok(Ok(0)) => Fill::Eof,
        Ok(Ok(count)) => {
            buffer.extend_from_slice(&chunk[..count]);
            Fill::Data
        }
        Ok(Err(error)) => Fill::Error(error),
    }
}

fn reject_431() -> ReadOutcome {
    ReadOutcome::Reject {
        status: 431,
        message: format!("Iris RESTful API HTTP header-length limit ({HEADER_LIMIT} bytes) exceeded"),
    }
}

fn reject_undefined(message: impl std::fmt::Display) -> ReadOutcome {
    ReadOutcome::Reject {
        status: 520,
        message: format!("Iris RESTful API encountered undefined error: {message}"),
    }
}

/// Read one HTTP/1.1 request from the stream. `buffer` persists across
/// keep-alive requests so pipelined bytes are not lost.
pub(crate) async fn read_request<S>(stream: &mut S, buffer: &mut Vec<u8>) -> ReadOutcome
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(head_end) = find_head_end(buffer) {
            if head_end > HEADER_LIMIT {
                return reject_431();
            }
            let head = match parse_request_head(&buffer[..head_end]) {
                Ok(head) => head,
                Err(message) => return reject_undefined(message),
            };
            if head.content_length > BODY_LIMIT {
                return ReadOutcome::Reject {
                    status: 413,
                    message: format!(
                        "Iris RESTful API payload-length limit ({BODY_LIMIT} bytes) exceeded"
                    ),
                };
            }

            // Consume the body before handing the request on; bodies on
            // GET/HEAD are tolerated and discarded.
            let total = head_end + head.content_length;
            while buffer.len() < total {
                match fill(stream, buffer).await {
                    Fill::Data => {}
                    Fill::Eof | Fill::TimedOut => return ReadOutcome::Close,
                    Fill::Error(error) => return reject_undefined(error),
                }
            }
            buffer.drain(..total);
            return ReadOutcome::Request(head);
        }

        if buffer.len() > HEADER_LIMIT {
            return reject_431();
        }
        match fill(stream, buffer).await {
            Fill::Data => {}
            Fill::Eof | Fill::TimedOut => return ReadOutcome::Close,
            Fill::Error(error) => return reject_undefined(error),
        }
    }
}

// =============================================================================
// Writing
// =============================================================================

pub(crate) enum WireBody {
    Text(String),
    Buffer(Bytes),
    File(PathBuf),
}

pub(crate) struct WireResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: WireBody,
    pub keep_alive: bool,
    pub head_only: bool,
    pub cors: Option<String>,
    pub minor_version: u8,
    pub extra_headers: Vec<(&'static str, String)>,
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        431 => "Request Header Fields Too Large",
        520 => "Unknown Error",
        _ => "Unknown Error",
    }
}

async fn timed_write<S: AsyncWrite + Unpin>(stream: &mut S, bytes: &[u8]) -> io::Result<()> {
    match timeout(IDLE_DEADLINE, stream.write_all(bytes)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "write deadline expired",
        )),
    }
}

/// Convert a worker-produced response into its wire shape.
pub(crate) fn shape_wire(
    response: GetResponse,
    head: &RequestHead,
    cors: Option<String>,
) -> WireResponse {
    let (status, content_type, body) = match response.body {
        ResponseBody::Tile { data } => (200, "image/jpeg", WireBody::Buffer(data)),
        ResponseBody::Metadata { info } => (
            200,
            "application/json",
            WireBody::Text(serialize_metadata(&info)),
        ),
        ResponseBody::File { path, mime } => (200, mime, WireBody::File(path)),
        ResponseBody::MalformedRequest { message } => {
            (400, "text/plain", WireBody::Text(error_text(&message)))
        }
        ResponseBody::FileNotFound { message } => {
            (404, "text/plain", WireBody::Text(error_text(&message)))
        }
        ResponseBody::Undefined { message } => {
            (520, "text/plain", WireBody::Text(error_text(&message)))
        }
    };

    WireResponse {
        status,
        content_type,
        body,
        keep_alive: response.keep_alive,
        head_only: head.method == Method::Head,
        cors,
        minor_version: head.minor_version,
        extra_headers: Vec::new(),
    }
}

/// Write a complete response. File bodies that vanished between the worker's
/// existence check and this write degrade to a 404 text response.
pub(crate) async fn write_response<S>(stream: &mut S, mut response: WireResponse) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    use std::fmt::Write as _;

    let mut file = None;
    let content_length = match &response.body {
        WireBody::Text(text) => text.len() as u64,
        WireBody::Buffer(bytes) => bytes.len() as u64,
        WireBody::File(path) => match tokio::fs::File::open(path).await {
            Ok(handle) => {
                let length = handle.metadata().await?.len();
                file = Some(handle);
                length
            }
            Err(error) => {
                debug!(path = %path.display(), %error, "file vanished before response write");
                let text = format!("File '{}' not found", path.display());
                let length = text.len() as u64;
                response.status = 404;
                response.content_type = "text/plain";
                response.body = WireBody::Text(text);
                length
            }
        },
    };

    let mut head = String::with_capacity(256);
    let _ = write!(
        head,
        "HTTP/1.{} {} {}\r\n",
        response.minor_version,
        response.status,
        reason_phrase(response.status)
    );
    let _ = write!(head, "Server: {SERVER_NAME}\r\n");
    let _ = write!(head, "Content-Type: {}\r\n", response.content_type);
    if let Some(origin) = &response.cors {
        let _ = write!(head, "Access-Control-Allow-Origin: {origin}\r\n");
    }
    for (name, value) in &response.extra_headers {
        let _ = write!(head, "{name}: {value}\r\n");
    }
    let _ = write!(head, "Content-Length: {content_length}\r\n");
    let _ = write!(
        head,
        "Connection: {}\r\n\r\n",
        if response.keep_alive { "keep-alive" } else { "close" }
    );

    timed_write(stream, head.as_bytes()).await?;

    if !response.head_only {
        match response.body {
            WireBody::Text(text) => timed_write(stream, text.as_bytes()).await?,
            WireBody::Buffer(bytes) => timed_write(stream, &bytes).await?,
            WireBody::File(_) => {
                if let Some(mut handle) = file {
                    match timeout(IDLE_DEADLINE, tokio::io::copy(&mut handle, stream)).await {
                        Ok(result) => {
                            result?;
                        }
                        Err(_) => {
                            return Err(io::Error::new(
                                io::ErrorKind::TimedOut,
                                "write deadline expired",
                            ))
                        }
                    }
                }
            }
        }
    }

    match timeout(IDLE_DEADLINE, stream.flush()).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "write deadline expired",
        )),
    }
}

// =============================================================================
// Session Loop
// =============================================================================

/// Serve one connection until it closes, times out, or stops keeping alive.
pub(crate) async fn session_loop<S>(core: Arc<ServerCore>, mut stream: S, remote: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let session = Session::new(remote);
    let mut buffer = Vec::new();

    loop {
        match read_request(&mut stream, &mut buffer).await {
            ReadOutcome::Close => break,
            ReadOutcome::Reject { status, message } => {
                let wire = WireResponse {
                    status,
                    content_type: "text/plain",
                    body: WireBody::Text(message),
                    keep_alive: false,
                    head_only: false,
                    cors: core.allow_origin(),
                    minor_version: 1,
                    extra_headers: Vec::new(),
                };
                let _ = write_response(&mut stream, wire).await;
                break;
            }
            ReadOutcome::Request(head) => match head.method {
                Method::Get | Method::Head => {
                    let (completion, receiver) = oneshot::channel();
                    core.clone()
                        .on_get(session.clone(), head.target.clone(), completion);
                    let mut response = match receiver.await {
                        Ok(response) => response,
                        Err(_) => {
                            GetResponse::undefined("request processing was dropped before completion")
                        }
                    };
                    response.keep_alive = head.keep_alive;

                    let keep_alive = head.keep_alive;
                    let wire = shape_wire(response, &head, core.allow_origin());
                    if write_response(&mut stream, wire).await.is_err() {
                        break;
                    }
                    if !keep_alive {
                        break;
                    }
                }
                Method::Other => {
                    // Unsupported verbs get an explicit 405 rather than the
                    // silent drop HTTP/1.1 would tolerate.
                    let wire = WireResponse {
                        status: 405,
                        content_type: "text/plain",
                        body: WireBody::Text("Method Not Allowed".to_string()),
                        keep_alive: head.keep_alive,
                        head_only: false,
                        cors: core.allow_origin(),
                        minor_version: head.minor_version,
                        extra_headers: vec![("Allow", "GET, HEAD".to_string())],
                    };
                    if write_response(&mut stream, wire).await.is_err() {
                        break;
                    }
                    if !head.keep_alive {
                        break;
                    }
                }
            },
        }
    }

    close_stream(&mut stream, remote).await;
}

fn is_benign_shutdown(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

async fn close_stream<S: AsyncWrite + Unpin>(stream: &mut S, remote: SocketAddr) {
    match timeout(IDLE_DEADLINE, stream.shutdown()).await {
        Err(_) | Ok(Ok(())) => {}
        Ok(Err(error)) if is_benign_shutdown(&error) => {}
        Ok(Err(error)) => warn!(%remote, %error, "error closing the stream"),
    }
}

// =============================================================================
// Tests
// =============================================================================
