use std::sync::{Arc, Mutex, RwLock};

use kurbo::Rect;

use crate::cache::key::ImageKey;
use crate::foundation::core::{MipLevel, PixelRect};
use crate::image::bitmap::Bitmap;
use crate::image::plane::{BitDepth, FieldingOrder, ImagePremult, PlaneDesc, StorageMode};

/// Construction bundle for [`Image`].
#[derive(Clone, Debug)]
pub struct ImageParams {
    pub desc: PlaneDesc,
    pub rod: Rect,
    pub bounds: PixelRect,
    pub mip: MipLevel,
    pub par: f64,
    pub depth: BitDepth,
    pub premult: ImagePremult,
    pub fielding: FieldingOrder,
    pub storage: StorageMode,
}

/// One plane's pixels plus its render-state bitmap.
///
/// Shared across threads through the cache; pixel writes go through the
/// buffer lock, render coordination through the bitmap lock. Pixels are held
/// at working precision; `bit_depth` is the advertised depth used for
/// conversion decisions on egress.
pub struct Image {
    desc: PlaneDesc,
    mip: MipLevel,
    par: f64,
    depth: BitDepth,
    premult: ImagePremult,
    fielding: FieldingOrder,
    storage: StorageMode,
    rod: Mutex<Rect>,
    key: Mutex<Option<ImageKey>>,
    buf: RwLock<PixelBuf>,
    bitmap: Mutex<Bitmap>,
}

struct PixelBuf {
    bounds: PixelRect,
    data: Vec<f32>,
}

impl PixelBuf {
    fn idx(&self, x: i64, y: i64, channels: usize) -> usize {
        let w = self.bounds.width();
        (((y - self.bounds.y1) * w + (x - self.bounds.x1)) as usize) * channels
    }
}

impl Image {
    pub fn new(params: ImageParams) -> Arc<Self> {
        let channels = params.desc.channels() as usize;
        let len = params.bounds.area() as usize * channels;
        Arc::new(Self {
            desc: params.desc,
            mip: params.mip,
            par: params.par,
            depth: params.depth,
            premult: params.premult,
            fielding: params.fielding,
            storage: params.storage,
            rod: Mutex::new(params.rod),
            key: Mutex::new(None),
            buf: RwLock::new(PixelBuf {
                bounds: params.bounds,
                data: vec![0.0; len],
            }),
            bitmap: Mutex::new(Bitmap::new(params.bounds)),
        })
    }

    pub fn desc(&self) -> &PlaneDesc {
        &self.desc
    }

    pub fn channels(&self) -> usize {
        self.desc.channels() as usize
    }

    pub fn mip_level(&self) -> MipLevel {
        self.mip
    }

    pub fn pixel_aspect(&self) -> f64 {
        self.par
    }

    pub fn bit_depth(&self) -> BitDepth {
        self.depth
    }

    pub fn premult(&self) -> ImagePremult {
        self.premult
    }

    pub fn fielding(&self) -> FieldingOrder {
        self.fielding
    }

    pub fn storage(&self) -> StorageMode {
        self.storage
    }

    pub fn bounds(&self) -> PixelRect {
        self.buf.read().expect("image buffer lock").bounds
    }

    pub fn rod(&self) -> Rect {
        *self.rod.lock().expect("image rod lock")
    }

    /// Widen the stored RoD. Cached images can disagree with a freshly
    /// computed RoD under the same hash; the union keeps bounds legal.
    pub fn merge_rod(&self, rod: Rect) {
        let mut cur = self.rod.lock().expect("image rod lock");
        *cur = cur.union(rod);
    }

    pub fn key(&self) -> Option<ImageKey> {
        self.key.lock().expect("image key lock").clone()
    }

    pub fn set_key(&self, key: ImageKey) {
        *self.key.lock().expect("image key lock") = Some(key);
    }

    /// Current buffer size in bytes, as accounted by the cache.
    pub fn byte_size(&self) -> usize {
        self.buf.read().expect("image buffer lock").data.len() * std::mem::size_of::<f32>()
    }

    /// Metadata-flip copy onto another storage backend. The actual
    /// upload/download primitive is an external collaborator; the resolver
    /// only needs the storage tag and an independent buffer.
    pub fn with_storage(self: &Arc<Self>, storage: StorageMode) -> Arc<Self> {
        let buf = self.buf.read().expect("image buffer lock");
        let out = Image::new(ImageParams {
            desc: self.desc.clone(),
            rod: self.rod(),
            bounds: buf.bounds,
            mip: self.mip,
            par: self.par,
            depth: self.depth,
            premult: self.premult,
            fielding: self.fielding,
            storage,
        });
        out.buf.write().expect("image buffer lock").data.copy_from_slice(&buf.data);
        out.bitmap
            .lock()
            .expect("image bitmap lock")
            .mark_rendered(buf.bounds);
        if let Some(k) = self.key() {
            out.set_key(k);
        }
        out
    }

    /// Grow the allocation in place so it covers `new_bounds`.
    ///
    /// Returns whether a resize happened. Grown pixels are zero; the bitmap
    /// marks them rendered when `mark_grown_rendered` (zero is the correct
    /// content outside the RoD).
    pub fn ensure_bounds(&self, new_bounds: PixelRect, mark_grown_rendered: bool) -> bool {
        let mut buf = self.buf.write().expect("image buffer lock");
        if buf.bounds.contains(new_bounds) {
            return false;
        }
        let merged = buf.bounds.union(new_bounds);
        let channels = self.channels();
        let mut data = vec![0.0f32; merged.area() as usize * channels];
        let old_bounds = buf.bounds;
        let w = merged.width();
        for y in old_bounds.y1..old_bounds.y2 {
            let src = buf.idx(old_bounds.x1, y, channels);
            let src_end = src + old_bounds.width() as usize * channels;
            let dst = (((y - merged.y1) * w + (old_bounds.x1 - merged.x1)) as usize) * channels;
            data[dst..dst + (src_end - src)].copy_from_slice(&buf.data[src..src_end]);
        }
        buf.bounds = merged;
        buf.data = data;
        self.bitmap
            .lock()
            .expect("image bitmap lock")
            .resize(merged, mark_grown_rendered);
        true
    }

    /// Resize-by-copy variant for callers that may already hold a read lock
    /// on this image: returns a fresh image covering `new_bounds` to be
    /// swapped into the cache, or `None` when the bounds already fit.
    pub fn copy_and_resize_if_needed(
        self: &Arc<Self>,
        new_bounds: PixelRect,
        mark_grown_rendered: bool,
    ) -> Option<Arc<Image>> {
        let buf = self.buf.read().expect("image buffer lock");
        if buf.bounds.contains(new_bounds) {
            return None;
        }
        let merged = buf.bounds.union(new_bounds);
        let out = Image::new(ImageParams {
            desc: self.desc.clone(),
            rod: self.rod(),
            bounds: merged,
            mip: self.mip,
            par: self.par,
            depth: self.depth,
            premult: self.premult,
            fielding: self.fielding,
            storage: self.storage,
        });
        {
            let mut dst = out.buf.write().expect("image buffer lock");
            let channels = self.channels();
            for y in buf.bounds.y1..buf.bounds.y2 {
                let src = buf.idx(buf.bounds.x1, y, channels);
                let src_end = src + buf.bounds.width() as usize * channels;
                let d = dst.idx(buf.bounds.x1, y, channels);
                dst.data[d..d + (src_end - src)].copy_from_slice(&buf.data[src..src_end]);
            }
        }
        {
            let src_bitmap = self.bitmap.lock().expect("image bitmap lock");
            let mut dst_bitmap = out.bitmap.lock().expect("image bitmap lock");
            *dst_bitmap = src_bitmap.clone();
            dst_bitmap.resize(merged, mark_grown_rendered);
        }
        if let Some(k) = self.key() {
            out.set_key(k);
        }
        Some(out)
    }

    /// Write a constant colour over `region` (clipped to bounds).
    pub fn fill(&self, region: PixelRect, color: [f32; 4]) {
        let mut buf = self.buf.write().expect("image buffer lock");
        let Some(r) = region.intersect(buf.bounds) else {
            return;
        };
        let channels = self.channels();
        for y in r.y1..r.y2 {
            for x in r.x1..r.x2 {
                let i = buf.idx(x, y, channels);
                for c in 0..channels {
                    buf.data[i + c] = color[c.min(3)];
                }
            }
        }
    }

    /// Copy `region` (in this image's pixel space) from `src`, converting
    /// component counts. Pixels outside `src`'s bounds become transparent
    /// black. Both images must share a mip level.
    pub fn copy_from(&self, src: &Image, region: PixelRect) {
        debug_assert_eq!(self.mip, src.mip);
        let src_buf = src.buf.read().expect("image buffer lock");
        let mut dst_buf = self.buf.write().expect("image buffer lock");
        let Some(r) = region.intersect(dst_buf.bounds) else {
            return;
        };
        let sc = src.channels();
        let dc = self.channels();
        for y in r.y1..r.y2 {
            for x in r.x1..r.x2 {
                let px = if src_buf.bounds.contains_point(x, y) {
                    let i = src_buf.idx(x, y, sc);
                    expand_rgba(&src_buf.data[i..i + sc], src.desc())
                } else {
                    [0.0; 4]
                };
                let di = dst_buf.idx(x, y, dc);
                store_rgba(&mut dst_buf.data[di..di + dc], self.desc(), px);
            }
        }
    }

    /// Point sample, expanded to RGBA. Outside bounds: transparent black.
    pub fn read_pixel(&self, x: i64, y: i64) -> [f32; 4] {
        let buf = self.buf.read().expect("image buffer lock");
        if !buf.bounds.contains_point(x, y) {
            return [0.0; 4];
        }
        let c = self.channels();
        let i = buf.idx(x, y, c);
        expand_rgba(&buf.data[i..i + c], self.desc())
    }

    /// Box-filter this image down into `dst` over `dst_region` (given in
    /// `dst`'s pixel space). `dst` must be at a coarser mip level.
    pub fn downscale_mip_map(&self, dst: &Image, dst_region: PixelRect) {
        debug_assert!(dst.mip >= self.mip);
        let shift = dst.mip.0 - self.mip.0;
        let factor = 1i64 << shift.min(31);
        let src_buf = self.buf.read().expect("image buffer lock");
        let mut dst_buf = dst.buf.write().expect("image buffer lock");
        let Some(r) = dst_region.intersect(dst_buf.bounds) else {
            return;
        };
        let sc = self.channels();
        let dc = dst.channels();
        for y in r.y1..r.y2 {
            for x in r.x1..r.x2 {
                let mut acc = [0.0f64; 4];
                let mut n = 0u32;
                for sy in (y * factor)..(y * factor + factor) {
                    for sx in (x * factor)..(x * factor + factor) {
                        if src_buf.bounds.contains_point(sx, sy) {
                            let i = src_buf.idx(sx, sy, sc);
                            let px = expand_rgba(&src_buf.data[i..i + sc], self.desc());
                            for c in 0..4 {
                                acc[c] += f64::from(px[c]);
                            }
                            n += 1;
                        }
                    }
                }
                let px = if n == 0 {
                    [0.0; 4]
                } else {
                    [
                        (acc[0] / f64::from(n)) as f32,
                        (acc[1] / f64::from(n)) as f32,
                        (acc[2] / f64::from(n)) as f32,
                        (acc[3] / f64::from(n)) as f32,
                    ]
                };
                let di = dst_buf.idx(x, y, dc);
                store_rgba(&mut dst_buf.data[di..di + dc], dst.desc(), px);
            }
        }
        drop(dst_buf);
        dst.bitmap
            .lock()
            .expect("image bitmap lock")
            .mark_rendered(r);
    }

    // Bitmap facade. All trimap transitions of this image funnel through
    // these under the bitmap lock.

    pub fn claim_rest(&self, region: PixelRect) -> (Vec<PixelRect>, bool) {
        self.bitmap.lock().expect("image bitmap lock").claim(region)
    }

    pub fn rest_to_render(&self, region: PixelRect) -> Vec<PixelRect> {
        self.bitmap
            .lock()
            .expect("image bitmap lock")
            .rest_to_render(region)
    }

    pub fn rest_unrendered(&self, region: PixelRect) -> (Vec<PixelRect>, bool) {
        self.bitmap
            .lock()
            .expect("image bitmap lock")
            .rest_unrendered(region)
    }

    pub fn publish(&self, region: PixelRect, failed: bool) {
        self.bitmap
            .lock()
            .expect("image bitmap lock")
            .publish(region, failed);
    }

    pub fn mark_rendered(&self, region: PixelRect) {
        self.bitmap
            .lock()
            .expect("image bitmap lock")
            .mark_rendered(region);
    }

    pub fn clear_bitmap(&self, region: PixelRect) {
        self.bitmap.lock().expect("image bitmap lock").clear(region);
    }

    pub fn set_bitmap_dirty_zone(&self, zone: PixelRect) {
        self.bitmap
            .lock()
            .expect("image bitmap lock")
            .set_dirty_zone(zone);
    }

    pub fn has_pending(&self, region: PixelRect) -> bool {
        self.bitmap
            .lock()
            .expect("image bitmap lock")
            .has_pending(region)
    }

    pub fn is_fully_rendered(&self, region: PixelRect) -> bool {
        self.bitmap
            .lock()
            .expect("image bitmap lock")
            .is_fully_rendered(region)
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("desc", &self.desc)
            .field("bounds", &self.bounds())
            .field("mip", &self.mip)
            .field("depth", &self.depth)
            .field("storage", &self.storage)
            .finish()
    }
}

fn expand_rgba(px: &[f32], desc: &PlaneDesc) -> [f32; 4] {
    match px.len() {
        1 => {
            if desc.is_color_plane() {
                // Alpha-only colour plane.
                [0.0, 0.0, 0.0, px[0]]
            } else {
                [px[0], 0.0, 0.0, 0.0]
            }
        }
        2 => [px[0], px[1], 0.0, 0.0],
        3 => [px[0], px[1], px[2], 1.0],
        _ => [px[0], px[1], px[2], px[3]],
    }
}

fn store_rgba(out: &mut [f32], desc: &PlaneDesc, px: [f32; 4]) {
    match out.len() {
        1 => out[0] = if desc.is_color_plane() { px[3] } else { px[0] },
        2 => out.copy_from_slice(&px[..2]),
        3 => out.copy_from_slice(&px[..3]),
        _ => out.copy_from_slice(&px),
    }
}

#[cfg(test)]
#[path = "../../tests/unit/image/image.rs"]
mod tests;
