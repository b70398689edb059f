use std::path::PathBuf;

use thiserror::Error;

/// Errors produced while opening or validating a slide container.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The file could not be read or mapped.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The file does not carry the Iris container magic.
    #[error("not an Iris slide file")]
    NotIrisFile,

    /// The container version is not supported by this reader.
    #[error("unsupported Iris container version {0}")]
    UnsupportedVersion(u32),

    /// The file is shorter than a structure it claims to contain.
    #[error("truncated container: {context} extends past end of file")]
    Truncated { context: &'static str },

    /// A structural field holds a value the reader cannot accept.
    #[error("invalid container structure: {0}")]
    InvalidStructure(String),
}

/// Errors produced when a tile request falls outside a slide's tile table.
#[derive(Debug, Error)]
pub enum SlideError {
    /// Requested resolution layer does not exist.
    #[error("layer {layer} is out of bounds for slide with {layer_count} layers")]
    LayerOutOfBounds { layer: u32, layer_count: usize },

    /// Requested tile index does not exist within the layer.
    #[error("tile {tile} is out of bounds for layer {layer} with {tile_count} tiles")]
    TileOutOfBounds {
        tile: u32,
        layer: u32,
        tile_count: usize,
    },
}

/// Fatal errors raised while bringing the server up.
///
/// Nothing inside the running server maps to this type; once `serve` is
/// entered, failures are logged and handled per-session.
#[derive(Debug, Error)]
pub enum StartupError {
    /// Configuration rejected before any socket was opened.
    #[error("configuration error: {0}")]
    InvalidConfig(String),

    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    /// TLS material could not be loaded or generated.
    #[error("TLS setup failed: {0}")]
    Tls(String),

    /// A certificate or key file was missing or unreadable.
    #[error("cannot read {path}: {source}")]
    CertificateRead {
        path: PathBuf,
        source: std::io::Error,
    },
}
