use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use crate::foundation::core::PixelRect;
use crate::image::image::Image;
use crate::render::context::AbortToken;

const WAIT_POLL: Duration = Duration::from_millis(10);

/// Per-node registry coordinating concurrent renderers of shared images.
///
/// Contract: at most one renderer per (image, pixel). Pixel claims live in
/// the image bitmap; this registry adds the renderer refcount and the wait
/// primitive. Only un-abortable renders may wait here; an abortable
/// producer can vanish, so abortable renders degrade to the two-state
/// bitmap and never block on a peer.
pub struct TrimapCoordinator {
    entries: Mutex<Vec<Entry>>,
}

struct Entry {
    image: Weak<Image>,
    ptr: usize,
    renderers: usize,
    state: Arc<WaitState>,
}

struct WaitState {
    lock: Mutex<()>,
    cond: Condvar,
}

/// Registration of one live renderer on one image. Dropping it without
/// [`publish`](Self::publish) is a bug in the caller; the resolver pairs
/// every mark with an unmark on all exit paths.
pub struct RenderMark<'a> {
    coordinator: &'a TrimapCoordinator,
    image: Arc<Image>,
    state: Arc<WaitState>,
}

impl TrimapCoordinator {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Register a renderer for `image`.
    pub fn mark_being_rendered<'a>(&'a self, image: &Arc<Image>) -> RenderMark<'a> {
        let ptr = Arc::as_ptr(image) as usize;
        let mut entries = self.entries.lock().expect("trimap registry lock");
        let state = match entries.iter_mut().find(|e| e.ptr == ptr) {
            Some(entry) => {
                entry.renderers += 1;
                entry.state.clone()
            }
            None => {
                let state = Arc::new(WaitState {
                    lock: Mutex::new(()),
                    cond: Condvar::new(),
                });
                entries.push(Entry {
                    image: Arc::downgrade(image),
                    ptr,
                    renderers: 1,
                    state: state.clone(),
                });
                state
            }
        };
        RenderMark {
            coordinator: self,
            image: image.clone(),
            state,
        }
    }

    /// Block while any pixel of `region` is being rendered elsewhere.
    /// Returns `false` when the wait was abandoned because the enclosing
    /// render aborted.
    pub fn wait_for_elsewhere(
        &self,
        image: &Arc<Image>,
        region: PixelRect,
        abort: &AbortToken,
    ) -> bool {
        let state = self.state_for(image);
        loop {
            if !image.has_pending(region) {
                return true;
            }
            if abort.is_aborted() {
                return false;
            }
            match &state {
                Some(s) => {
                    let guard = s.lock.lock().expect("trimap wait lock");
                    let _ = s
                        .cond
                        .wait_timeout(guard, WAIT_POLL)
                        .expect("trimap wait lock");
                }
                // Pending pixels with no registered renderer: the producer is
                // between publish and unregister, spin briefly.
                None => std::thread::sleep(WAIT_POLL),
            }
        }
    }

    /// Wake waiters after bitmap transitions made directly on the image.
    pub fn notify(&self, image: &Arc<Image>) {
        if let Some(state) = self.state_for(image) {
            state.cond.notify_all();
        }
    }

    fn state_for(&self, image: &Arc<Image>) -> Option<Arc<WaitState>> {
        let ptr = Arc::as_ptr(image) as usize;
        let entries = self.entries.lock().expect("trimap registry lock");
        entries.iter().find(|e| e.ptr == ptr).map(|e| e.state.clone())
    }

    fn unregister(&self, image: &Arc<Image>) {
        let ptr = Arc::as_ptr(image) as usize;
        let mut entries = self.entries.lock().expect("trimap registry lock");
        if let Some(pos) = entries.iter().position(|e| e.ptr == ptr) {
            entries[pos].renderers -= 1;
            if entries[pos].renderers == 0 {
                entries.swap_remove(pos);
            }
        }
        // Opportunistically drop entries whose image died with the cache.
        entries.retain(|e| e.renderers > 0 && e.image.upgrade().is_some());
    }
}

impl Default for TrimapCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderMark<'_> {
    /// Resolve this renderer's pending pixels in `region` and wake waiters.
    pub fn publish(&self, region: PixelRect, failed: bool) {
        self.image.publish(region, failed);
        self.state.cond.notify_all();
    }

    pub fn notify(&self) {
        self.state.cond.notify_all();
    }
}

impl Drop for RenderMark<'_> {
    fn drop(&mut self) {
        self.coordinator.unregister(&self.image);
        self.state.cond.notify_all();
    }
}

#[cfg(test)]
#[path = "../../tests/unit/render/trimap.rs"]
mod tests;
