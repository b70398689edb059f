//! Request-target parsing for the two REST dialects.
//!
//! Targets are lowercased before tokenising, so the grammar is
//! case-insensitive. The first non-empty path segment selects the dialect:
//! `slides` for the native API, `studies` for DICOMweb WADO-RS, and a
//! recognized file extension on the last segment for static-file requests.
//! Anything else is malformed, with a descriptive message carried back to
//! the client as the 400 body.

/// Which REST dialect produced a parsed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Iris,
    Dicom,
}

/// A parsed GET request-target.
#[derive(Debug, Clone, PartialEq)]
pub enum GetRequest {
    Tile {
        protocol: Protocol,
        id: String,
        layer: u32,
        tile: u32,
    },
    Metadata {
        protocol: Protocol,
        id: String,
    },
    File {
        path: String,
        mime: &'static str,
    },
    Malformed {
        error: String,
    },
}

/// The command word is the final path segment.
enum Command {
    Tile,
    Metadata,
    Undefined,
}

/// Closed extension-to-MIME table for static-file requests.
const MIME_TABLE: &[(&str, &str)] = &[
    (".htm", "text/html"),
    (".html", "text/html"),
    (".php", "text/html"),
    (".css", "text/css"),
    (".txt", "text/plain"),
    (".js", "application/javascript"),
    (".json", "application/json"),
    (".xml", "application/xml"),
    (".dzi", "image/dzi"),
    (".png", "image/png"),
    (".jpe", "image/jpeg"),
    (".jpeg", "image/jpeg"),
    (".jpg", "image/jpeg"),
    (".gif", "image/gif"),
    (".bmp", "image/bmp"),
    (".ico", "image/vnd.microsoft.icon"),
    (".tiff", "image/tiff"),
    (".tif", "image/tiff"),
    (".svg", "image/svg+xml"),
    (".svgz", "image/svg+xml"),
];

fn malformed(error: impl Into<String>) -> GetRequest {
    GetRequest::Malformed {
        error: error.into(),
    }
}

/// MIME type for the extension of the last path segment, if recognized.
fn mime_for(target: &str) -> Option<&'static str> {
    let last = target.rsplit('/').next().unwrap_or("");
    let dot = last.rfind('.')?;
    let extension = &last[dot..];
    MIME_TABLE
        .iter()
        .find(|(known, _)| *known == extension)
        .map(|(_, mime)| *mime)
}

/// Decide the command from the tail of the target: a trailing digit means a
/// tile index, the literal `metadata` means a metadata request.
fn command_of(target: &str) -> Command {
    let last = target.rsplit('/').find(|t| !t.is_empty()).unwrap_or("");
    if last.chars().last().is_some_and(|c| c.is_ascii_digit()) {
        Command::Tile
    } else if last == "metadata" {
        Command::Metadata
    } else {
        Command::Undefined
    }
}

/// Parse a GET request-target into its tagged representation.
pub fn parse_get_request(target: &str) -> GetRequest {
    let target = target.to_ascii_lowercase();
    let mut tokens = target.split('/').filter(|t| !t.is_empty());

    let Some(first) = tokens.next() else {
        // Bare root: rewrite to the index document.
        return GetRequest::File {
            path: "/index.html".to_string(),
            mime: "text/html",
        };
    };

    match first {
        "slides" => parse_iris_request(tokens, &target),
        "studies" => parse_dicom_request(tokens, &target),
        _ if mime_for(&target).is_some() => parse_file_request(&target),
        _ => malformed(
            "Undefined GET request protocol. Please follow either IrisRESTful or DICOMweb WADO-RS API",
        ),
    }
}

fn parse_iris_request<'a>(
    mut tokens: impl Iterator<Item = &'a str>,
    target: &str,
) -> GetRequest {
    match command_of(target) {
        Command::Tile => {
            let id = tokens.next().unwrap_or_default().to_string();
            if tokens.next() != Some("layers") {
                return malformed(
                    "Expected 'layers' following slide identifier in IrisRESTful GET tile command target URL",
                );
            }
            let Some(layer) = tokens.next().and_then(|t| t.parse::<u32>().ok()) else {
                return malformed(
                    "Expected numerical 'layers' value in IrisRESTful GET tile command target URL.",
                );
            };
            if tokens.next() != Some("tiles") {
                return malformed(
                    "Expected 'tiles' following layer index in IrisRESTful GET tile command target URL",
                );
            }
            let Some(tile) = tokens.next().and_then(|t| t.parse::<u32>().ok()) else {
                return malformed(
                    "Expected single numerical 'tiles' value in IrisRESTful GET tile command target URL.",
                );
            };
            GetRequest::Tile {
                protocol: Protocol::Iris,
                id,
                layer,
                tile,
            }
        }
        Command::Metadata => GetRequest::Metadata {
            protocol: Protocol::Iris,
            id: tokens.next().unwrap_or_default().to_string(),
        },
        Command::Undefined => malformed(
            "Undefined command sequence (last token) in IrisRESTful target URL. Please ensure your command conforms to the IrisRESTful API.",
        ),
    }
}

fn parse_dicom_request<'a>(
    mut tokens: impl Iterator<Item = &'a str>,
    target: &str,
) -> GetRequest {
    // The study identifier is parsed but currently unused; the series
    // identifier names the slide.
    let _study = tokens.next().unwrap_or_default();

    match command_of(target) {
        Command::Tile => {
            if tokens.next() != Some("series") {
                return malformed(
                    "Expected 'series' following study identifier in DICOM/WADO-RS target URL.",
                );
            }
            let id = tokens.next().unwrap_or_default().to_string();
            if tokens.next() != Some("instances") {
                return malformed(
                    "Expected 'instances' following series in DICOM/WADO-RS target URL.",
                );
            }
            let Some(layer) = tokens.next().and_then(|t| t.parse::<u32>().ok()) else {
                return malformed(
                    "Expected numerical 'instances' value in DICOM/WADO-RS target URL representing the resolution layer.",
                );
            };
            if tokens.next() != Some("frames") {
                return malformed(
                    "Expected 'frames' following resolution instance in DICOM/WADO-RS target URL.",
                );
            }
            let Some(tile) = tokens.next().and_then(|t| t.parse::<u32>().ok()) else {
                return malformed(
                    "Expected numerical 'frames' value in DICOM/WADO-RS target URL representing the tile index.",
                );
            };
            GetRequest::Tile {
                protocol: Protocol::Dicom,
                id,
                layer,
                tile,
            }
        }
        Command::Metadata => {
            if tokens.next() != Some("series") {
                return malformed(
                    "Expected 'series' following study in DICOM/WADO-RS target URL. Please ensure metadata requests conform to IrisRESTful API compliant WADO-RS commands.",
                );
            }
            GetRequest::Metadata {
                protocol: Protocol::Dicom,
                id: tokens.next().unwrap_or_default().to_string(),
            }
        }
        Command::Undefined => malformed(
            "Undefined command sequence (last token) in DICOM/WADO-RS target URL. Please ensure your command conforms to IrisRESTful API compliant WADO-RS commands.",
        ),
    }
}

fn parse_file_request(target: &str) -> GetRequest {
    if !target.starts_with('/') || target.contains("..") {
        return malformed("Illegal request-target");
    }
    match mime_for(target) {
        Some(mime) => GetRequest::File {
            path: target.to_string(),
            mime,
        },
        None => {
            let last = target.rsplit('/').next().unwrap_or_default();
            malformed(format!("Unrecognized file type {last}"))
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
