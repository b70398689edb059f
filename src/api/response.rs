//! Response model and metadata serialization.
//!
//! Responses are a tagged union aligned with the parsed request; the tag is
//! the exhaustive switch the session task uses to shape the wire response
//! (string body, in-memory byte buffer, or file body). The `keep_alive` bit
//! is stamped by the session task to mirror the request before the response
//! is written.

use std::path::PathBuf;

use bytes::Bytes;
use serde::Serialize;

use crate::codec::{Extent, PixelFormat, SlideInfo, TileEncoding};

/// Body text used when an error response carries no message of its own.
pub const GENERIC_ERROR: &str =
    "Undefined GET request error. The Iris RESTful server did not elaborate on what happened.";

/// A response to a GET request, produced on a worker thread.
#[derive(Debug)]
pub struct GetResponse {
    pub body: ResponseBody,
    /// Mirrors the request's HTTP keep-alive semantics; set by the session
    /// task, not the worker.
    pub keep_alive: bool,
}

/// The payload variants a GET can produce.
#[derive(Debug)]
pub enum ResponseBody {
    /// Pre-encoded tile bytes, served as `image/jpeg`.
    Tile { data: Bytes },
    /// Slide geometry and encoding, served as JSON.
    Metadata { info: SlideInfo },
    /// A static file resolved under the document root.
    File { path: PathBuf, mime: &'static str },
    MalformedRequest { message: String },
    FileNotFound { message: String },
    Undefined { message: String },
}

impl GetResponse {
    fn new(body: ResponseBody) -> Self {
        Self {
            body,
            keep_alive: false,
        }
    }

    pub fn tile(data: Bytes) -> Self {
        Self::new(ResponseBody::Tile { data })
    }

    pub fn metadata(info: SlideInfo) -> Self {
        Self::new(ResponseBody::Metadata { info })
    }

    pub fn file(path: PathBuf, mime: &'static str) -> Self {
        Self::new(ResponseBody::File { path, mime })
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ResponseBody::MalformedRequest {
            message: message.into(),
        })
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ResponseBody::FileNotFound {
            message: message.into(),
        })
    }

    pub fn undefined(message: impl Into<String>) -> Self {
        Self::new(ResponseBody::Undefined {
            message: message.into(),
        })
    }
}

// =============================================================================
// Metadata JSON
// =============================================================================

#[derive(Serialize)]
struct LayerJson {
    x_tiles: u32,
    y_tiles: u32,
    scale: f32,
}

#[derive(Serialize)]
struct ExtentJson {
    width: u32,
    height: u32,
    layers: Vec<LayerJson>,
}

#[derive(Serialize)]
struct MetadataJson {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    encoding: Option<&'static str>,
    extent: ExtentJson,
}

fn format_label(format: PixelFormat) -> Option<&'static str> {
    match format {
        PixelFormat::Undefined => None,
        PixelFormat::B8G8R8 => Some("FORMAT_B8G8R8"),
        PixelFormat::R8G8B8 => Some("FORMAT_R8G8B8"),
        PixelFormat::B8G8R8A8 => Some("FORMAT_B8G8R8A8"),
        PixelFormat::R8G8B8A8 => Some("FORMAT_R8G8B8A8"),
    }
}

fn encoding_label(encoding: TileEncoding) -> Option<&'static str> {
    match encoding {
        TileEncoding::Undefined => None,
        TileEncoding::Iris => Some("image/iris"),
        TileEncoding::Jpeg => Some("image/jpeg"),
        TileEncoding::Avif => Some("image/avif"),
    }
}

fn extent_json(extent: &Extent) -> ExtentJson {
    ExtentJson {
        width: extent.width,
        height: extent.height,
        layers: extent
            .layers
            .iter()
            .map(|layer| LayerJson {
                x_tiles: layer.x_tiles,
                y_tiles: layer.y_tiles,
                scale: layer.scale,
            })
            .collect(),
    }
}

/// Serialize slide metadata to the `slide_metadata` JSON document. Undefined
/// format and encoding fields are omitted.
pub fn serialize_metadata(info: &SlideInfo) -> String {
    let document = MetadataJson {
        kind: "slide_metadata",
        format: format_label(info.format),
        encoding: encoding_label(info.encoding),
        extent: extent_json(&info.extent),
    };
    serde_json::to_string(&document).unwrap()
}

/// The `text/plain` body for an error response: the carried message, or the
/// generic fallback when empty.
pub fn error_text(message: &str) -> String {
    if message.is_empty() {
        GENERIC_ERROR.to_string()
    } else {
        message.to_string()
    }
}

// =============================================================================
// Tests
// =============================================================================
