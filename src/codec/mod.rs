//! Reader for the Iris slide container format.
//!
//! An Iris container is a self-describing, tile-indexed binary file: a fixed
//! header describing the pixel format, tile encoding and pyramid extent,
//! followed by one record block per resolution layer whose entries point at
//! pre-encoded tile payloads elsewhere in the file, followed by a free-form
//! metadata blob.
//!
//! The reader memory-maps the file once, validates every structural field
//! against the file length up front, and exposes an immutable abstraction
//! (the tile table). After `SlideFile::open` returns, tile reads are plain
//! slice copies out of the map and can never run past the end of the file.
//!
//! # Layout
//!
//! All integers are little-endian.
//!
//! ```text
//! offset  size  field
//! 0       4     magic "IRIS"
//! 4       4     version (currently 1)
//! 8       4     pixel format
//! 12      4     tile encoding
//! 16      4     extent width (pixels, layer with scale 1.0)
//! 20      4     extent height
//! 24      4     layer count
//! 28      4     metadata blob length
//! 32      ...   layer records, lowest resolution first:
//!                 x_tiles u32, y_tiles u32, scale f32,
//!                 then x_tiles*y_tiles tile entries {offset u64, size u32}
//! ...     ...   metadata blob
//! ```

use std::fs::File;
use std::path::Path;
use std::sync::RwLock;

use bytes::Bytes;
use memmap2::Mmap;

use crate::error::CodecError;

/// Magic bytes at the front of every Iris container.
pub const MAGIC: [u8; 4] = *b"IRIS";

/// The only container version this reader understands.
pub const VERSION: u32 = 1;

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 32;

/// Size of a per-layer record header (x_tiles, y_tiles, scale).
pub const LAYER_HEADER_SIZE: usize = 12;

/// Size of one tile table entry (offset u64, size u32).
pub const TILE_ENTRY_SIZE: usize = 12;

/// Upper bound on pyramid depth accepted by the validator.
const MAX_LAYERS: u32 = 64;

// =============================================================================
// Abstraction Types
// =============================================================================

/// Pixel channel ordering of decoded tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelFormat {
    #[default]
    Undefined,
    B8G8R8,
    R8G8B8,
    B8G8R8A8,
    R8G8B8A8,
}

impl PixelFormat {
    fn from_u32(raw: u32) -> Result<Self, CodecError> {
        match raw {
            0 => Ok(Self::Undefined),
            1 => Ok(Self::B8G8R8),
            2 => Ok(Self::R8G8B8),
            3 => Ok(Self::B8G8R8A8),
            4 => Ok(Self::R8G8B8A8),
            other => Err(CodecError::InvalidStructure(format!(
                "unknown pixel format value {other}"
            ))),
        }
    }
}

/// Compression applied to the stored tile payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TileEncoding {
    #[default]
    Undefined,
    Iris,
    Jpeg,
    Avif,
}

impl TileEncoding {
    fn from_u32(raw: u32) -> Result<Self, CodecError> {
        match raw {
            0 => Ok(Self::Undefined),
            1 => Ok(Self::Iris),
            2 => Ok(Self::Jpeg),
            3 => Ok(Self::Avif),
            other => Err(CodecError::InvalidStructure(format!(
                "unknown tile encoding value {other}"
            ))),
        }
    }
}

/// Tile grid shape of one resolution layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerExtent {
    /// Number of tile columns.
    pub x_tiles: u32,
    /// Number of tile rows.
    pub y_tiles: u32,
    /// Scale of this layer relative to the full-resolution extent.
    pub scale: f32,
}

/// Pixel extent of the slide plus the per-layer tile grids.
#[derive(Debug, Clone, PartialEq)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
    pub layers: Vec<LayerExtent>,
}

/// Location of one pre-encoded tile payload within the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileEntry {
    pub offset: u64,
    pub size: u32,
}

/// Immutable description of a validated container.
///
/// `tiles[layer][index]` locates the payload for linear tile `index` of the
/// given resolution layer; `extent.layers[layer]` carries the matching grid
/// shape.
#[derive(Debug, Clone)]
pub struct SlideAbstraction {
    pub format: PixelFormat,
    pub encoding: TileEncoding,
    pub extent: Extent,
    pub tiles: Vec<Vec<TileEntry>>,
    /// Free-form metadata blob carried through for forward compatibility.
    pub metadata: Bytes,
}

impl SlideAbstraction {
    /// Number of resolution layers in the pyramid.
    pub fn layer_count(&self) -> usize {
        self.tiles.len()
    }

    /// Number of tiles in the given layer, if it exists.
    pub fn tile_count(&self, layer: usize) -> Option<usize> {
        self.tiles.get(layer).map(Vec::len)
    }
}

/// The subset of the abstraction reported to metadata requests.
#[derive(Debug, Clone)]
pub struct SlideInfo {
    pub format: PixelFormat,
    pub encoding: TileEncoding,
    pub extent: Extent,
    /// Free-form metadata blob; carried through but not part of the visible
    /// JSON schema.
    pub metadata: Bytes,
}

// =============================================================================
// Structure Parsing
// =============================================================================

fn read_u32(data: &[u8], offset: usize, context: &'static str) -> Result<u32, CodecError> {
    let end = offset
        .checked_add(4)
        .ok_or(CodecError::Truncated { context })?;
    let bytes = data
        .get(offset..end)
        .ok_or(CodecError::Truncated { context })?;
    Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
}

fn read_u64(data: &[u8], offset: usize, context: &'static str) -> Result<u64, CodecError> {
    let end = offset
        .checked_add(8)
        .ok_or(CodecError::Truncated { context })?;
    let bytes = data
        .get(offset..end)
        .ok_or(CodecError::Truncated { context })?;
    Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
}

fn read_f32(data: &[u8], offset: usize, context: &'static str) -> Result<f32, CodecError> {
    Ok(f32::from_bits(read_u32(data, offset, context)?))
}

/// Quick check that a byte region begins with an Iris container header.
pub fn is_iris_codec_file(data: &[u8]) -> bool {
    data.len() >= 8 && data[..4] == MAGIC && read_u32(data, 4, "version").is_ok_and(|v| v == VERSION)
}

/// Walk the complete structure, verifying that every record and every tile
/// payload lies within the file.
pub fn validate_file_structure(data: &[u8]) -> Result<(), CodecError> {
    abstract_file_structure(data).map(|_| ())
}

/// Parse the container structure into an immutable [`SlideAbstraction`].
pub fn abstract_file_structure(data: &[u8]) -> Result<SlideAbstraction, CodecError> {
    if data.len() < HEADER_SIZE {
        return Err(CodecError::Truncated { context: "header" });
    }
    if data[..4] != MAGIC {
        return Err(CodecError::NotIrisFile);
    }
    let version = read_u32(data, 4, "header")?;
    if version != VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }

    let format = PixelFormat::from_u32(read_u32(data, 8, "header")?)?;
    let encoding = TileEncoding::from_u32(read_u32(data, 12, "header")?)?;
    let width = read_u32(data, 16, "header")?;
    let height = read_u32(data, 20, "header")?;
    let layer_count = read_u32(data, 24, "header")?;
    let metadata_len = read_u32(data, 28, "header")? as usize;

    if layer_count == 0 {
        return Err(CodecError::InvalidStructure(
            "container declares zero resolution layers".into(),
        ));
    }
    if layer_count > MAX_LAYERS {
        return Err(CodecError::InvalidStructure(format!(
            "container declares {layer_count} layers (limit {MAX_LAYERS})"
        )));
    }

    let file_len = data.len() as u64;
    let mut cursor = HEADER_SIZE;
    let mut layers = Vec::with_capacity(layer_count as usize);
    let mut tiles = Vec::with_capacity(layer_count as usize);

    for _ in 0..layer_count {
        let x_tiles = read_u32(data, cursor, "layer record")?;
        let y_tiles = read_u32(data, cursor + 4, "layer record")?;
        let scale = read_f32(data, cursor + 8, "layer record")?;
        cursor += LAYER_HEADER_SIZE;

        if x_tiles == 0 || y_tiles == 0 {
            return Err(CodecError::InvalidStructure(
                "layer declares an empty tile grid".into(),
            ));
        }
        let tile_count = x_tiles as u64 * y_tiles as u64;
        if tile_count > u32::MAX as u64 {
            return Err(CodecError::InvalidStructure(
                "layer tile grid exceeds addressable tile count".into(),
            ));
        }

        let mut entries = Vec::with_capacity(tile_count as usize);
        for _ in 0..tile_count {
            let offset = read_u64(data, cursor, "tile entry")?;
            let size = read_u32(data, cursor + 8, "tile entry")?;
            cursor += TILE_ENTRY_SIZE;

            let end = offset
                .checked_add(size as u64)
                .ok_or(CodecError::Truncated {
                    context: "tile payload",
                })?;
            if end > file_len {
                return Err(CodecError::Truncated {
                    context: "tile payload",
                });
            }
            entries.push(TileEntry { offset, size });
        }

        layers.push(LayerExtent {
            x_tiles,
            y_tiles,
            scale,
        });
        tiles.push(entries);
    }

    let metadata_end = cursor
        .checked_add(metadata_len)
        .ok_or(CodecError::Truncated {
            context: "metadata blob",
        })?;
    if metadata_end as u64 > file_len {
        return Err(CodecError::Truncated {
            context: "metadata blob",
        });
    }
    let metadata = Bytes::copy_from_slice(&data[cursor..metadata_end]);

    Ok(SlideAbstraction {
        format,
        encoding,
        extent: Extent {
            width,
            height,
            layers,
        },
        tiles,
        metadata,
    })
}

// =============================================================================
// SlideFile
// =============================================================================

/// An open, validated, memory-mapped slide container.
pub struct SlideFile {
    mmap: Mmap,
    /// Shared/exclusive lock guarding readers against map invalidation.
    /// The serving path only ever takes the shared side; a writer resizing
    /// the container must hold the exclusive side.
    pub resize: RwLock<()>,
    pub abstraction: SlideAbstraction,
}

impl SlideFile {
    /// Open, map and validate a container file.
    pub fn open(path: &Path) -> Result<Self, CodecError> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        if !is_iris_codec_file(&mmap) {
            return Err(CodecError::NotIrisFile);
        }
        let abstraction = abstract_file_structure(&mmap)?;

        Ok(Self {
            mmap,
            resize: RwLock::new(()),
            abstraction,
        })
    }

    /// The raw mapped bytes of the container.
    pub fn data(&self) -> &[u8] {
        &self.mmap
    }
}

impl std::fmt::Debug for SlideFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlideFile")
            .field("len", &self.mmap.len())
            .field("layers", &self.abstraction.layer_count())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::build_container;

    #[test]
    fn test_magic_detection() {
        let data = build_container(b"");
        assert!(is_iris_codec_file(&data));

        assert!(!is_iris_codec_file(b"JPEG"));
        assert!(!is_iris_codec_file(b""));

        let mut wrong_version = data.clone();
        wrong_version[4..8].copy_from_slice(&9u32.to_le_bytes());
        assert!(!is_iris_codec_file(&wrong_version));
    }

    #[test]
    fn test_abstract_structure() {
        let data = build_container(b"{\"stain\":\"H&E\"}");
        let slide = abstract_file_structure(&data).unwrap();

        assert_eq!(slide.format, PixelFormat::R8G8B8);
        assert_eq!(slide.encoding, TileEncoding::Jpeg);
        assert_eq!(slide.extent.width, 512);
        assert_eq!(slide.extent.height, 256);
        assert_eq!(slide.layer_count(), 2);
        assert_eq!(slide.tile_count(0), Some(2));
        assert_eq!(slide.tile_count(1), Some(1));
        assert_eq!(slide.extent.layers[0].x_tiles, 2);
        assert_eq!(slide.extent.layers[1].scale, 1.0);
        assert_eq!(&slide.metadata[..], b"{\"stain\":\"H&E\"}");

        // Tile entries resolve to the payload bytes we wrote.
        let entry = slide.tiles[0][1];
        let payload = &data[entry.offset as usize..(entry.offset + entry.size as u64) as usize];
        assert_eq!(payload, b"tile-0-1");
    }

    #[test]
    fn test_rejects_truncated_header() {
        let data = build_container(b"");
        let err = abstract_file_structure(&data[..16]).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { .. }));
    }

    #[test]
    fn test_rejects_wrong_magic() {
        let mut data = build_container(b"");
        data[..4].copy_from_slice(b"TIFF");
        assert!(matches!(
            abstract_file_structure(&data),
            Err(CodecError::NotIrisFile)
        ));
    }

    #[test]
    fn test_rejects_tile_past_end_of_file() {
        let mut data = build_container(b"");
        // Corrupt the first tile entry's offset to point past the file end.
        let entry_offset = HEADER_SIZE + LAYER_HEADER_SIZE;
        data[entry_offset..entry_offset + 8].copy_from_slice(&u64::MAX.to_le_bytes());
        assert!(matches!(
            abstract_file_structure(&data),
            Err(CodecError::Truncated { .. })
        ));
    }

    #[test]
    fn test_rejects_zero_layers() {
        let mut data = build_container(b"");
        data[24..28].copy_from_slice(&0u32.to_le_bytes());
        assert!(matches!(
            abstract_file_structure(&data),
            Err(CodecError::InvalidStructure(_))
        ));
    }

    #[test]
    fn test_validate_accepts_wellformed() {
        let data = build_container(b"meta");
        assert!(validate_file_structure(&data).is_ok());
    }

    #[test]
    fn test_slide_file_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.iris");
        std::fs::write(&path, build_container(b"blob")).unwrap();

        let slide = SlideFile::open(&path).unwrap();
        assert_eq!(slide.abstraction.layer_count(), 2);
        assert!(is_iris_codec_file(slide.data()));
    }

    #[test]
    fn test_slide_file_open_rejects_foreign_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-a-slide.iris");
        std::fs::write(&path, b"PK\x03\x04 definitely a zip").unwrap();

        assert!(matches!(
            SlideFile::open(&path),
            Err(CodecError::NotIrisFile)
        ));
    }
}
