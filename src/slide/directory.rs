//! Process-wide directory of currently-open slides.
//!
//! The directory maps identifiers to weak references; lifetime is driven
//! entirely by the sessions holding strong handles. Lookups take the read
//! lock; the miss path opens the file outside any lock, then re-checks under
//! the write lock so a competing open wins by retention (the loser's
//! duplicate open is discarded). Eviction is hook-driven: the last strong
//! drop removes the entry, re-checking under the write lock in case the same
//! identifier was re-inserted in between.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use tracing::warn;

use crate::error::CodecError;

use super::handle::SlideHandle;

type DirectoryMap = HashMap<String, Weak<SlideHandle>>;

#[derive(Clone, Default)]
pub struct SlideDirectory {
    entries: Arc<RwLock<DirectoryMap>>,
    lookups: Arc<AtomicUsize>,
}

impl SlideDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up or open the slide `{slide_dir}/{id}.iris`.
    ///
    /// Returns `None` when the file is missing or fails validation; the
    /// failure is logged here and surfaced to the client as a 404.
    pub fn get_slide(&self, id: &str, slide_dir: &Path) -> Option<Arc<SlideHandle>> {
        let path = slide_dir.join(format!("{id}.iris"));
        self.get_slide_with(id, || SlideHandle::open(id, &path))
    }

    /// Lookup with an injected opener; the seam the tests use to observe
    /// open calls and stretch the race window.
    pub fn get_slide_with(
        &self,
        id: &str,
        open: impl FnOnce() -> Result<SlideHandle, CodecError>,
    ) -> Option<Arc<SlideHandle>> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = entries.get(id).and_then(Weak::upgrade) {
                return Some(existing);
            }
        }

        // Miss: open outside any lock, so a slow open never stalls readers.
        let opened = match open() {
            Ok(slide) => Arc::new(slide),
            Err(error) => {
                warn!(id, %error, "failed to open slide");
                return None;
            }
        };

        {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = entries.get(id).and_then(Weak::upgrade) {
                // A competing request opened the same slide first; keep the
                // retained handle and discard this one.
                drop(entries);
                return Some(existing);
            }
            entries.insert(id.to_string(), Arc::downgrade(&opened));
        }

        let entries = self.entries.clone();
        let key = id.to_string();
        opened.set_on_release(move || {
            {
                let map = entries.read().unwrap_or_else(PoisonError::into_inner);
                if !map.contains_key(&key) {
                    return;
                }
            }
            let mut map = entries.write().unwrap_or_else(PoisonError::into_inner);
            // Remove only if the entry is still the expired one; the same
            // identifier may have been re-inserted since the last drop.
            if map.get(&key).is_some_and(|entry| entry.upgrade().is_none()) {
                map.remove(&key);
            }
        });

        Some(opened)
    }

    /// Number of lookups served since creation, for assertions in tests; a
    /// session's sticky slide answers repeat requests without one.
    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::Relaxed)
    }

    /// Number of live entries, counting expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Tests
// =============================================================================
