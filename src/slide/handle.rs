//! Shared-ownership wrapper over an open, validated slide container.
//!
//! A handle is immutable after construction; concurrent readers never block
//! each other. The directory installs an on-last-release hook, which runs
//! exactly once, on whichever thread drops the final strong reference.

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use bytes::Bytes;
use tracing::debug;

use crate::codec::{SlideFile, SlideInfo};
use crate::error::{CodecError, SlideError};

type ReleaseHook = Box<dyn FnOnce() + Send>;

pub struct SlideHandle {
    id: String,
    file: SlideFile,
    on_release: Mutex<Option<ReleaseHook>>,
}

impl SlideHandle {
    /// Open, map and validate the container at `path`.
    pub fn open(id: &str, path: &Path) -> Result<Self, CodecError> {
        let file = SlideFile::open(path)?;
        debug!(id, path = %path.display(), "slide opened");
        Ok(Self {
            id: id.to_string(),
            file,
            on_release: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether this handle serves the given slide identifier. Sessions use
    /// this to short-circuit directory lookups across successive requests.
    pub fn matches(&self, id: &str) -> bool {
        self.id == id
    }

    /// Slide geometry and encoding for metadata responses.
    pub fn info(&self) -> SlideInfo {
        let abstraction = &self.file.abstraction;
        SlideInfo {
            format: abstraction.format,
            encoding: abstraction.encoding,
            extent: abstraction.extent.clone(),
            metadata: abstraction.metadata.clone(),
        }
    }

    pub fn layer_count(&self) -> usize {
        self.file.abstraction.layer_count()
    }

    pub fn tile_count(&self, layer: u32) -> Option<usize> {
        self.file.abstraction.tile_count(layer as usize)
    }

    /// Copy the pre-encoded payload of one tile out of the mapped file.
    ///
    /// The copy is deliberate: the network write outlives the request scope,
    /// and the map may be invalidated by a writer holding the codec's
    /// exclusive resize lock.
    pub fn tile(&self, layer: u32, tile: u32) -> Result<Bytes, SlideError> {
        let _read_guard = self
            .file
            .resize
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        let layers = &self.file.abstraction.tiles;
        let entries = layers
            .get(layer as usize)
            .ok_or(SlideError::LayerOutOfBounds {
                layer,
                layer_count: layers.len(),
            })?;
        let entry = entries
            .get(tile as usize)
            .ok_or(SlideError::TileOutOfBounds {
                tile,
                layer,
                tile_count: entries.len(),
            })?;

        // Entry bounds were validated against the file length at open time.
        let start = entry.offset as usize;
        let end = start + entry.size as usize;
        Ok(Bytes::copy_from_slice(&self.file.data()[start..end]))
    }

    /// Install the hook run when the last strong reference drops. Set once,
    /// by the directory, right after insertion.
    pub fn set_on_release(&self, hook: impl FnOnce() + Send + 'static) {
        let mut slot = self
            .on_release
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = Some(Box::new(hook));
    }
}

impl Drop for SlideHandle {
    fn drop(&mut self) {
        debug!(id = %self.id, "slide released");
        let hook = self
            .on_release
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(hook) = hook {
            hook();
        }
    }
}

impl std::fmt::Debug for SlideHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlideHandle")
            .field("id", &self.id)
            .field("layers", &self.layer_count())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::test_utils::{write_slide_file, TILE_PAYLOADS};

    fn open_sample(id: &str) -> (tempfile::TempDir, SlideHandle) {
        let dir = tempfile::tempdir().unwrap();
        let path = write_slide_file(dir.path(), id);
        let handle = SlideHandle::open(id, &path).unwrap();
        (dir, handle)
    }

    #[test]
    fn test_tile_returns_exact_payload_bytes() {
        let (_dir, handle) = open_sample("demo");

        assert_eq!(&handle.tile(0, 0).unwrap()[..], TILE_PAYLOADS[0]);
        assert_eq!(&handle.tile(0, 1).unwrap()[..], TILE_PAYLOADS[1]);
        assert_eq!(&handle.tile(1, 0).unwrap()[..], TILE_PAYLOADS[2]);
    }

    #[test]
    fn test_layer_out_of_bounds() {
        let (_dir, handle) = open_sample("demo");

        let error = handle.tile(99, 0).unwrap_err();
        assert!(matches!(error, SlideError::LayerOutOfBounds { .. }));
        assert!(error.to_string().contains("out of bounds"));
    }

    #[test]
    fn test_tile_out_of_bounds() {
        let (_dir, handle) = open_sample("demo");

        let error = handle.tile(1, 5).unwrap_err();
        assert!(matches!(error, SlideError::TileOutOfBounds { .. }));
        assert!(error.to_string().contains("out of bounds"));
    }

    #[test]
    fn test_matches_identifier() {
        let (_dir, handle) = open_sample("demo");
        assert!(handle.matches("demo"));
        assert!(!handle.matches("other"));
    }

    #[test]
    fn test_info_reports_extent() {
        let (_dir, handle) = open_sample("demo");
        let info = handle.info();
        assert_eq!(info.extent.width, 512);
        assert_eq!(info.extent.height, 256);
        assert_eq!(info.extent.layers.len(), 2);
    }

    #[test]
    fn test_release_hook_runs_once_on_last_drop() {
        let (_dir, handle) = open_sample("demo");
        let handle = Arc::new(handle);
        let runs = Arc::new(AtomicUsize::new(0));

        {
            let runs = runs.clone();
            handle.set_on_release(move || {
                runs.fetch_add(1, Ordering::SeqCst);
            });
        }

        let second = handle.clone();
        drop(handle);
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        drop(second);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_open_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = SlideHandle::open("ghost", &dir.path().join("ghost.iris"));
        assert!(matches!(result, Err(CodecError::Io(_))));
    }
}
