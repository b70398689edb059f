//! End-to-end tests against a live listener on an ephemeral port.
//!
//! The server runs in plain-HTTP mode for determinism; TLS configuration is
//! covered by unit tests in the library. Each test synthesizes a slide
//! container in a temporary directory and speaks raw HTTP/1.1 over a TCP
//! socket, so the full pipeline is exercised: acceptor, request reader,
//! worker dispatch, slide directory, and response writer.

mod common;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use common::{
    get, read_response, send_request, start_server, write_slide_file, TILE_PAYLOADS,
};

// =============================================================================
// Metadata and Tiles
// =============================================================================

#[tokio::test]
async fn test_metadata_request() {
    let dir = tempfile::tempdir().unwrap();
    write_slide_file(dir.path(), "demo");
    let addr = start_server(dir.path(), None, None).await;

    let response = get(addr, "/slides/demo/metadata").await;

    assert_eq!(response.status, 200);
    assert_eq!(response.header("content-type"), Some("application/json"));
    assert_eq!(response.header("server"), Some("Iris RESTful Server"));

    let value: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(value["type"], "slide_metadata");
    assert_eq!(value["encoding"], "image/jpeg");
    assert!(value["extent"]["layers"].as_array().unwrap().len() >= 1);
    // The metadata blob is a pass-through, not part of the JSON schema.
    assert!(value.get("metadata").is_none());
}

#[tokio::test]
async fn test_tile_request_returns_exact_bytes() {
    let dir = tempfile::tempdir().unwrap();
    write_slide_file(dir.path(), "demo");
    let addr = start_server(dir.path(), None, None).await;

    let response = get(addr, "/slides/demo/layers/0/tiles/0").await;

    assert_eq!(response.status, 200);
    assert_eq!(response.header("content-type"), Some("image/jpeg"));
    assert_eq!(&response.body[..], TILE_PAYLOADS[0]);
}

#[tokio::test]
async fn test_dicom_frame_maps_to_same_tile() {
    let dir = tempfile::tempdir().unwrap();
    write_slide_file(dir.path(), "demo");
    let addr = start_server(dir.path(), None, None).await;

    let native = get(addr, "/slides/demo/layers/0/tiles/0").await;
    let dicom = get(addr, "/studies/anything/series/demo/instances/0/frames/0").await;

    assert_eq!(dicom.status, 200);
    assert_eq!(native.body, dicom.body);
}

#[tokio::test]
async fn test_layer_out_of_bounds_is_404() {
    let dir = tempfile::tempdir().unwrap();
    write_slide_file(dir.path(), "demo");
    let addr = start_server(dir.path(), None, None).await;

    let response = get(addr, "/slides/demo/layers/99/tiles/0").await;

    assert_eq!(response.status, 404);
    assert!(response.body_text().contains("out of bounds"));
}

#[tokio::test]
async fn test_unknown_identifier_is_404() {
    let dir = tempfile::tempdir().unwrap();
    write_slide_file(dir.path(), "demo");
    let addr = start_server(dir.path(), None, None).await;

    let response = get(addr, "/slides/nope/metadata").await;

    assert_eq!(response.status, 404);
    assert!(response.body_text().contains("nope"));
}

#[tokio::test]
async fn test_non_numeric_layer_is_400() {
    let dir = tempfile::tempdir().unwrap();
    write_slide_file(dir.path(), "demo");
    let addr = start_server(dir.path(), None, None).await;

    let response = get(addr, "/slides/demo/layers/abc/tiles/0").await;

    assert_eq!(response.status, 400);
    assert!(response.body_text().contains("numerical 'layers'"));
}

#[tokio::test]
async fn test_mixed_case_target_is_normalized() {
    let dir = tempfile::tempdir().unwrap();
    write_slide_file(dir.path(), "demo");
    let addr = start_server(dir.path(), None, None).await;

    let response = get(addr, "/Slides/Demo/Layers/0/Tiles/1").await;

    assert_eq!(response.status, 200);
    assert_eq!(&response.body[..], TILE_PAYLOADS[1]);
}

// =============================================================================
// Connection Behavior
// =============================================================================

#[tokio::test]
async fn test_keep_alive_serves_sequential_requests() {
    let dir = tempfile::tempdir().unwrap();
    write_slide_file(dir.path(), "demo");
    let addr = start_server(dir.path(), None, None).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();

    send_request(&mut stream, "GET", "/slides/demo/layers/0/tiles/0", true).await;
    let first = read_response(&mut stream, false).await;
    assert_eq!(first.status, 200);
    assert_eq!(first.header("connection"), Some("keep-alive"));
    assert_eq!(&first.body[..], TILE_PAYLOADS[0]);

    // Same connection, different tile of the same slide (sticky session).
    send_request(&mut stream, "GET", "/slides/demo/layers/0/tiles/1", true).await;
    let second = read_response(&mut stream, false).await;
    assert_eq!(second.status, 200);
    assert_eq!(&second.body[..], TILE_PAYLOADS[1]);
}

#[tokio::test]
async fn test_connection_close_is_honored() {
    let dir = tempfile::tempdir().unwrap();
    write_slide_file(dir.path(), "demo");
    let addr = start_server(dir.path(), None, None).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    send_request(&mut stream, "GET", "/slides/demo/metadata", false).await;
    let response = read_response(&mut stream, false).await;

    assert_eq!(response.status, 200);
    assert_eq!(response.header("connection"), Some("close"));

    // The server shuts the stream down after the response.
    let mut rest = Vec::new();
    tokio::io::AsyncReadExt::read_to_end(&mut stream, &mut rest)
        .await
        .unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_head_request_carries_headers_without_body() {
    let dir = tempfile::tempdir().unwrap();
    write_slide_file(dir.path(), "demo");
    let addr = start_server(dir.path(), None, None).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    send_request(&mut stream, "HEAD", "/slides/demo/layers/0/tiles/0", false).await;
    let response = read_response(&mut stream, true).await;

    assert_eq!(response.status, 200);
    assert_eq!(response.header("content-type"), Some("image/jpeg"));
    assert_eq!(
        response.header("content-length"),
        Some(TILE_PAYLOADS[0].len().to_string().as_str())
    );
    assert!(response.body.is_empty());
}

#[tokio::test]
async fn test_unsupported_method_gets_405() {
    let dir = tempfile::tempdir().unwrap();
    write_slide_file(dir.path(), "demo");
    let addr = start_server(dir.path(), None, None).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    send_request(&mut stream, "PATCH", "/slides/demo/metadata", false).await;
    let response = read_response(&mut stream, false).await;

    assert_eq!(response.status, 405);
    assert_eq!(response.header("allow"), Some("GET, HEAD"));
}

#[tokio::test]
async fn test_oversized_headers_get_431() {
    let dir = tempfile::tempdir().unwrap();
    write_slide_file(dir.path(), "demo");
    let addr = start_server(dir.path(), None, None).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let raw = format!(
        "GET /slides/demo/metadata HTTP/1.1\r\nHost: localhost\r\nX-Padding: {}\r\n\r\n",
        "a".repeat(2000)
    );
    stream.write_all(raw.as_bytes()).await.unwrap();
    let response = read_response(&mut stream, false).await;

    assert_eq!(response.status, 431);
    assert!(response.body_text().contains("header-length limit"));
}

#[tokio::test]
async fn test_oversized_body_gets_413() {
    let dir = tempfile::tempdir().unwrap();
    write_slide_file(dir.path(), "demo");
    let addr = start_server(dir.path(), None, None).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let raw = "PUT /upload HTTP/1.1\r\nHost: localhost\r\nContent-Length: 4096\r\n\r\n";
    stream.write_all(raw.as_bytes()).await.unwrap();
    let response = read_response(&mut stream, false).await;

    assert_eq!(response.status, 413);
    assert!(response.body_text().contains("payload-length limit"));
}

// =============================================================================
// CORS
// =============================================================================

#[tokio::test]
async fn test_cors_defaults_to_wildcard() {
    let dir = tempfile::tempdir().unwrap();
    write_slide_file(dir.path(), "demo");
    let addr = start_server(dir.path(), None, None).await;

    let response = get(addr, "/slides/demo/metadata").await;
    assert_eq!(response.header("access-control-allow-origin"), Some("*"));
}

#[tokio::test]
async fn test_explicit_cors_value_is_literal() {
    let dir = tempfile::tempdir().unwrap();
    write_slide_file(dir.path(), "demo");
    let addr = start_server(dir.path(), None, Some("https://v.example")).await;

    let response = get(addr, "/slides/demo/metadata").await;
    assert_eq!(
        response.header("access-control-allow-origin"),
        Some("https://v.example")
    );
}

#[tokio::test]
async fn test_cors_suppressed_when_file_serving() {
    let slides = tempfile::tempdir().unwrap();
    write_slide_file(slides.path(), "demo");
    let www = tempfile::tempdir().unwrap();
    std::fs::write(www.path().join("index.html"), "<html>viewer</html>").unwrap();

    let addr = start_server(slides.path(), Some(www.path()), None).await;

    let response = get(addr, "/slides/demo/metadata").await;
    assert_eq!(response.status, 200);
    assert!(response.header("access-control-allow-origin").is_none());
}

// =============================================================================
// Static Files
// =============================================================================

#[tokio::test]
async fn test_root_serves_index_from_doc_root() {
    let slides = tempfile::tempdir().unwrap();
    write_slide_file(slides.path(), "demo");
    let www = tempfile::tempdir().unwrap();
    std::fs::write(www.path().join("index.html"), "<html>viewer</html>").unwrap();

    let addr = start_server(slides.path(), Some(www.path()), None).await;

    let response = get(addr, "/").await;
    assert_eq!(response.status, 200);
    assert_eq!(response.header("content-type"), Some("text/html"));
    assert_eq!(response.body_text(), "<html>viewer</html>");
}

#[tokio::test]
async fn test_missing_static_file_is_404() {
    let slides = tempfile::tempdir().unwrap();
    write_slide_file(slides.path(), "demo");
    let www = tempfile::tempdir().unwrap();

    let addr = start_server(slides.path(), Some(www.path()), None).await;

    let response = get(addr, "/nope.html").await;
    assert_eq!(response.status, 404);
    assert!(response.body_text().contains("not found"));
}

#[tokio::test]
async fn test_file_request_without_doc_root_is_404() {
    let dir = tempfile::tempdir().unwrap();
    write_slide_file(dir.path(), "demo");
    let addr = start_server(dir.path(), None, None).await;

    let response = get(addr, "/index.html").await;
    assert_eq!(response.status, 404);
    assert!(response.body_text().contains("not configured"));
}
