use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::cache::key::ImageKey;
use crate::foundation::core::MipLevel;
use crate::image::image::Image;
use crate::image::plane::StorageMode;

/// Process-wide content-addressed store of rendered plane images.
///
/// Lookup tolerates bit-depth and component mismatches (the resolver converts
/// on egress); mip level and storage must match. Eviction is LRU by byte
/// budget, and [`is_almost_full`](Self::is_almost_full) fires at a watermark
/// below the budget so the resolver can stop pinning partial hits before the
/// cache starts thrashing.
pub struct ImageCache {
    max_bytes: usize,
    almost_full_ratio: f64,
    inner: Mutex<CacheInner>,
}

#[derive(Default)]
struct CacheInner {
    buckets: HashMap<u64, Vec<CacheEntry>>,
    used_bytes: usize,
    tick: u64,
}

struct CacheEntry {
    key: ImageKey,
    image: Arc<Image>,
    bytes: usize,
    last_used: u64,
}

impl ImageCache {
    pub fn new(max_bytes: usize, almost_full_ratio: f64) -> Arc<Self> {
        Arc::new(Self {
            max_bytes,
            almost_full_ratio: almost_full_ratio.clamp(0.0, 1.0),
            inner: Mutex::new(CacheInner::default()),
        })
    }

    /// Find a reusable image for `key`. The stored image may be in a
    /// different bit depth or component set than the caller wants.
    pub fn lookup(&self, key: &ImageKey, mip: MipLevel, storage: StorageMode) -> Option<Arc<Image>> {
        let mut inner = self.inner.lock().expect("cache lock");
        inner.tick += 1;
        let tick = inner.tick;
        let bucket = inner.buckets.get_mut(&key.bucket())?;
        let entry = bucket.iter_mut().find(|e| {
            e.key == *key && e.image.mip_level() == mip && e.image.storage() == storage
        })?;
        entry.last_used = tick;
        Some(entry.image.clone())
    }

    pub fn insert(&self, key: ImageKey, image: Arc<Image>) {
        image.set_key(key.clone());
        let bytes = image.byte_size();
        let mut inner = self.inner.lock().expect("cache lock");
        inner.tick += 1;
        let tick = inner.tick;
        let bucket = inner.buckets.entry(key.bucket()).or_default();
        if let Some(old) = bucket.iter().position(|e| e.key == key) {
            let old = bucket.swap_remove(old);
            inner.used_bytes -= old.bytes;
        }
        let bucket = inner.buckets.entry(key.bucket()).or_default();
        bucket.push(CacheEntry {
            key,
            image,
            bytes,
            last_used: tick,
        });
        inner.used_bytes += bytes;
        self.evict_past_budget(&mut inner);
    }

    /// Atomic replacement used by the resize-without-write-lock path: the
    /// entry currently holding `old` is replaced by `new` under one lock
    /// acquisition; absent entries are inserted.
    pub fn swap_or_insert(&self, old: &Arc<Image>, new: Arc<Image>, key: ImageKey) {
        new.set_key(key.clone());
        let bytes = new.byte_size();
        let mut inner = self.inner.lock().expect("cache lock");
        inner.tick += 1;
        let tick = inner.tick;
        let bucket = inner.buckets.entry(key.bucket()).or_default();
        let mut delta = bytes as isize;
        if let Some(pos) = bucket
            .iter()
            .position(|e| Arc::ptr_eq(&e.image, old) || e.key == key)
        {
            let removed = bucket.swap_remove(pos);
            delta -= removed.bytes as isize;
        }
        let bucket = inner.buckets.entry(key.bucket()).or_default();
        bucket.push(CacheEntry {
            key,
            image: new,
            bytes,
            last_used: tick,
        });
        inner.used_bytes = inner.used_bytes.saturating_add_signed(delta);
        self.evict_past_budget(&mut inner);
    }

    pub fn remove(&self, key: &ImageKey) {
        let mut inner = self.inner.lock().expect("cache lock");
        if let Some(bucket) = inner.buckets.get_mut(&key.bucket()) {
            let mut freed = 0;
            bucket.retain(|e| {
                if e.key == *key {
                    freed += e.bytes;
                    false
                } else {
                    true
                }
            });
            inner.used_bytes -= freed;
        }
    }

    /// Drop the entry holding exactly this image object, if still present.
    pub fn remove_if_matches(&self, image: &Arc<Image>) {
        let mut inner = self.inner.lock().expect("cache lock");
        let mut freed = 0;
        for bucket in inner.buckets.values_mut() {
            bucket.retain(|e| {
                if Arc::ptr_eq(&e.image, image) {
                    freed += e.bytes;
                    false
                } else {
                    true
                }
            });
        }
        inner.used_bytes -= freed;
    }

    /// Advisory pressure signal: the resolver drops partial cache hits and
    /// re-renders full regions once this fires.
    pub fn is_almost_full(&self) -> bool {
        let inner = self.inner.lock().expect("cache lock");
        inner.used_bytes as f64 >= self.max_bytes as f64 * self.almost_full_ratio
    }

    pub fn used_bytes(&self) -> usize {
        self.inner.lock().expect("cache lock").used_bytes
    }

    pub fn capacity_bytes(&self) -> usize {
        self.max_bytes
    }

    fn evict_past_budget(&self, inner: &mut CacheInner) {
        while inner.used_bytes > self.max_bytes {
            let mut victim: Option<(u64, usize, u64)> = None;
            for (&bucket_key, bucket) in inner.buckets.iter() {
                for (i, e) in bucket.iter().enumerate() {
                    if victim.is_none_or(|(_, _, lru)| e.last_used < lru) {
                        victim = Some((bucket_key, i, e.last_used));
                    }
                }
            }
            let Some((bucket_key, i, _)) = victim else {
                break;
            };
            let bucket = inner.buckets.get_mut(&bucket_key).expect("victim bucket");
            let removed = bucket.swap_remove(i);
            inner.used_bytes -= removed.bytes;
        }
    }
}

#[cfg(test)]
#[path = "../../tests/unit/cache/store.rs"]
mod tests;
