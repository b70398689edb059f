//! Per-connection session state.
//!
//! A session lives for the duration of one TCP/TLS connection. Besides the
//! remote endpoint (for logging) it carries at most one strong slide
//! reference: the sticky slide, which spares a directory lookup per request
//! while a viewer pans and zooms within a single slide. The reactor's
//! read-after-write loop guarantees at most one in-flight request per
//! session, so a plain mutex-guarded slot is sufficient for visibility of
//! the worker's writes.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::slide::SlideHandle;

pub struct Session {
    remote: SocketAddr,
    slide: Mutex<Option<Arc<SlideHandle>>>,
}

impl Session {
    pub fn new(remote: SocketAddr) -> Arc<Self> {
        debug!(%remote, "session opened");
        Arc::new(Self {
            remote,
            slide: Mutex::new(None),
        })
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// The retained slide, if it serves the given identifier.
    pub fn sticky_slide(&self, id: &str) -> Option<Arc<SlideHandle>> {
        self.slide
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|slide| slide.matches(id))
            .cloned()
    }

    /// Replace the retained slide. Releasing the previous handle here may
    /// trigger directory eviction if this session was its last holder.
    pub fn retain_slide(&self, slide: Arc<SlideHandle>) {
        *self.slide.lock().unwrap_or_else(PoisonError::into_inner) = Some(slide);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        debug!(remote = %self.remote, "session expired");
    }
}

// =============================================================================
// Tests
// =============================================================================
