//! Shared helpers for unit tests: synthesize Iris slide containers.

use std::path::{Path, PathBuf};

use crate::codec::{HEADER_SIZE, LAYER_HEADER_SIZE, MAGIC, TILE_ENTRY_SIZE, VERSION};

/// Payload bytes of the synthetic container's tiles, in layer-major order:
/// layer 0 is a 2x1 grid, layer 1 is a 1x1 grid.
pub(crate) const TILE_PAYLOADS: &[&[u8]] = &[b"tile-0-0", b"tile-0-1", b"tile-1-0"];

/// Assemble a well-formed container with two layers (2x1 at scale 0.25 and
/// 1x1 at scale 1.0), format `FORMAT_R8G8B8`, encoding `image/jpeg`, and the
/// given metadata blob.
pub(crate) fn build_container(metadata: &[u8]) -> Vec<u8> {
    let layers: &[(u32, u32, f32)] = &[(2, 1, 0.25), (1, 1, 1.0)];

    let table_len: usize = layers
        .iter()
        .map(|(x, y, _)| LAYER_HEADER_SIZE + (x * y) as usize * TILE_ENTRY_SIZE)
        .sum();
    let mut payload_offset = (HEADER_SIZE + table_len + metadata.len()) as u64;

    let mut data = Vec::new();
    data.extend_from_slice(&MAGIC);
    data.extend_from_slice(&VERSION.to_le_bytes());
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
pub(crate) fn write_slide_file(dir: &Path, id: &str) -> PathBuf {
    let path = dir.join(format!("{id}.iris"));
    std::fs::write(&path, build_container(b"{}")).unwrap();
    path
}
