use super::*;
use crate::foundation::core::{FrameTime, NodeId, PixelRect, ViewIndex};
use crate::image::image::ImageParams;
use crate::image::plane::{BitDepth, FieldingOrder, ImagePremult, PlaneDesc};
use kurbo::Rect;

fn image(side: i64) -> Arc<Image> {
    Image::new(ImageParams {
        desc: PlaneDesc::rgba(),
        rod: Rect::new(0.0, 0.0, side as f64, side as f64),
        bounds: PixelRect::new(0, 0, side, side),
        mip: MipLevel::FULL,
        par: 1.0,
        depth: BitDepth::Float,
        premult: ImagePremult::Premultiplied,
        fielding: FieldingOrder::None,
        storage: StorageMode::Ram,
    })
}

fn key(node: u64, time: f64) -> ImageKey {
    ImageKey {
        node: NodeId(node),
        node_hash: node.wrapping_mul(31),
        frame_varying: false,
        time: FrameTime(time),
        view: ViewIndex(0),
        draft: false,
        full_scale: false,
    }
}

#[test]
fn insert_then_lookup_hits() {
    let cache = ImageCache::new(1 << 20, 0.85);
    let img = image(4);
    cache.insert(key(1, 0.0), img.clone());
    let hit = cache
        .lookup(&key(1, 0.0), MipLevel::FULL, StorageMode::Ram)
        .unwrap();
    assert!(Arc::ptr_eq(&hit, &img));
    assert!(
        cache
            .lookup(&key(1, 1.0), MipLevel::FULL, StorageMode::Ram)
            .is_none()
    );
    assert!(
        cache
            .lookup(&key(1, 0.0), MipLevel(1), StorageMode::Ram)
            .is_none()
    );
}

#[test]
fn lru_eviction_under_byte_budget() {
    let one_image = image(8).byte_size();
    let cache = ImageCache::new(one_image * 2, 0.85);
    cache.insert(key(1, 0.0), image(8));
    cache.insert(key(2, 0.0), image(8));
    // Touch the first so the second is the LRU victim.
    cache.lookup(&key(1, 0.0), MipLevel::FULL, StorageMode::Ram);
    cache.insert(key(3, 0.0), image(8));

    assert!(
        cache
            .lookup(&key(1, 0.0), MipLevel::FULL, StorageMode::Ram)
            .is_some()
    );
    assert!(
        cache
            .lookup(&key(2, 0.0), MipLevel::FULL, StorageMode::Ram)
            .is_none()
    );
    assert!(cache.used_bytes() <= cache.capacity_bytes());
}

#[test]
fn almost_full_watermark_fires_before_budget() {
    let one_image = image(8).byte_size();
    let cache = ImageCache::new(one_image * 4, 0.5);
    assert!(!cache.is_almost_full());
    cache.insert(key(1, 0.0), image(8));
    cache.insert(key(2, 0.0), image(8));
    assert!(cache.is_almost_full());
    assert!(cache.used_bytes() <= cache.capacity_bytes());
}

#[test]
fn swap_replaces_in_place() {
    let cache = ImageCache::new(1 << 20, 0.85);
    let old = image(4);
    cache.insert(key(1, 0.0), old.clone());
    let new = image(8);
    cache.swap_or_insert(&old, new.clone(), key(1, 0.0));
    let hit = cache
        .lookup(&key(1, 0.0), MipLevel::FULL, StorageMode::Ram)
        .unwrap();
    assert!(Arc::ptr_eq(&hit, &new));
}

#[test]
fn remove_if_matches_only_removes_that_object() {
    let cache = ImageCache::new(1 << 20, 0.85);
    let a = image(4);
    cache.insert(key(1, 0.0), a.clone());
    cache.insert(key(2, 0.0), image(4));

    let unrelated = image(4);
    cache.remove_if_matches(&unrelated);
    assert!(
        cache
            .lookup(&key(1, 0.0), MipLevel::FULL, StorageMode::Ram)
            .is_some()
    );

    cache.remove_if_matches(&a);
    assert!(
        cache
            .lookup(&key(1, 0.0), MipLevel::FULL, StorageMode::Ram)
            .is_none()
    );
    assert!(
        cache
            .lookup(&key(2, 0.0), MipLevel::FULL, StorageMode::Ram)
            .is_some()
    );
}
