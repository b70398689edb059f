//! Shared utilities for end-to-end tests: synthetic slide containers, a
//! server fixture, and a minimal HTTP/1.1 client.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use iris_restful::{Config, RestServer};

/// Payload bytes of the synthetic container's tiles, in layer-major order:
/// layer 0 is a 2x1 grid, layer 1 is a 1x1 grid.
pub const TILE_PAYLOADS: &[&[u8]] = &[b"tile-0-0", b"tile-0-1", b"tile-1-0"];

const HEADER_SIZE: usize = 32;
const LAYER_HEADER_SIZE: usize = 12;
const TILE_ENTRY_SIZE: usize = 12;

/// Assemble a well-formed Iris container with two layers (2x1 at scale 0.25
/// and 1x1 at scale 1.0), format `FORMAT_R8G8B8`, encoding `image/jpeg`.
pub fn build_container(metadata: &[u8]) -> Vec<u8> {
    let layers: &[(u32, u32, f32)] = &[(2, 1, 0.25), (1, 1, 1.0)];

    let table_len: usize = layers
        .iter()
        .map(|(x, y, _)| LAYER_HEADER_SIZE + (x * y) as usize * TILE_ENTRY_SIZE)
        .sum();
    let mut payload_offset = (HEADER_SIZE + table_len + metadata.len()) as u64;

    let mut data = Vec::new();
    data.extend_from_slice(b"IRIS");
    data.extend_from_slice(&1u32.to_le_bytes()); // version
    data.extend_from_slice(&2u32.to_le_bytes()); // FORMAT_R8G8B8
    data.extend_from_slice(&2u32.to_le_bytes()); // ENCODING_JPEG
    data.extend_from_slice(&512u32.to_le_bytes());
    data.extend_from_slice(&256u32.to_le_bytes());
    data.extend_from_slice(&(layers.len() as u32).to_le_bytes());
    data.extend_from_slice(&(metadata.len() as u32).to_le_bytes());

    let mut payload_iter = TILE_PAYLOADS.iter();
    for (x, y, scale) in layers {
        data.extend_from_slice(&x.to_le_bytes());
        data.extend_from_slice(&y.to_le_bytes());
        data.extend_from_slice(&scale.to_bits().to_le_bytes());
        for _ in 0..(x * y) {
            let payload = payload_iter.next().unwrap();
            data.extend_from_slice(&payload_offset.to_le_bytes());
            data.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            payload_offset += payload.len() as u64;
        }
    }

    data.extend_from_slice(metadata);
    for payload in TILE_PAYLOADS {
        data.extend_from_slice(payload);
    }
    data
}

/// Write a synthetic container as `{id}.iris` under `dir`.
pub fn write_slide_file(dir: &Path, id: &str) -> PathBuf {
    let path = dir.join(format!("{id}.iris"));
    std::fs::write(&path, build_container(b"{}")).unwrap();
    path
}

/// Bind a plain-HTTP server on an ephemeral port and serve it in the
/// background; returns the address to connect to.
pub async fn start_server(
    slide_dir: &Path,
    doc_root: Option<&Path>,
    cors: Option<&str>,
) -> SocketAddr {
    let config = Config {
        port: 0,
        slide_dir: slide_dir.to_path_buf(),
        cert: None,
        key: None,
        cors: cors.map(String::from),
        doc_root: doc_root.map(Path::to_path_buf),
        http_only: true,
        verbose: false,
    };

    let server = RestServer::bind(&config).await.unwrap();
    let port = server.local_addr().unwrap().port();
    tokio::spawn(server.serve());

    SocketAddr::from(([127, 0, 0, 1], port))
}

/// A parsed HTTP/1.1 response.
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Case-insensitive single-header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(header, _)| *header == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

/// Read one response off the stream: head, then exactly `Content-Length`
/// body bytes (none for `head_only`), leaving the connection usable for the
/// next keep-alive request.
pub async fn read_response(stream: &mut TcpStream, head_only: bool) -> HttpResponse {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 1024];

    let head_end = loop {
        if let Some(position) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
            break position + 4;
        }
        let count = stream.read(&mut chunk).await.unwrap();
        assert!(count > 0, "connection closed before response head completed");
        buffer.extend_from_slice(&chunk[..count]);
    };

    let head = String::from_utf8(buffer[..head_end].to_vec()).unwrap();
    let mut lines = head.split("\r\n");
    let status: u16 = lines
        .next()
        .unwrap()
        .split(' ')
        .nth(1)
        .expect("status line")
        .parse()
        .unwrap();
    let headers: Vec<(String, String)> = lines
        .filter(|line| !line.is_empty())
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_string()))
        .collect();

    let content_length: usize = headers
        .iter()
        .find(|(name, _)| name == "content-length")
        .map(|(_, value)| value.parse().unwrap())
        .unwrap_or(0);

    let mut body = buffer[head_end..].to_vec();
    if head_only {
        assert!(body.is_empty(), "HEAD response must not carry a body");
        return HttpResponse {
            status,
            headers,
            body,
        };
    }
    while body.len() < content_length {
        let count = stream.read(&mut chunk).await.unwrap();
        assert!(count > 0, "connection closed mid-body");
        body.extend_from_slice(&chunk[..count]);
    }
    body.truncate(content_length);

    HttpResponse {
        status,
        headers,
        body,
    }
}

/// Open a connection, send one GET, and read the response.
pub async fn get(addr: SocketAddr, target: &str) -> HttpResponse {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    send_request(&mut stream, "GET", target, true).await;
    read_response(&mut stream, false).await
}

/// Write a request with standard headers on an existing connection.
pub async fn send_request(stream: &mut TcpStream, method: &str, target: &str, keep_alive: bool) {
    let connection = if keep_alive { "keep-alive" } else { "close" };
    let raw = format!(
        "{method} {target} HTTP/1.1\r\nHost: localhost\r\nConnection: {connection}\r\n\r\n"
    );
    stream.write_all(raw.as_bytes()).await.unwrap();
}
