use std::sync::Arc;

use crate::foundation::core::PixelRect;
use crate::foundation::error::ResolveResult;
use crate::image::image::{Image, ImageParams};
use crate::image::plane::{BitDepth, ImagePremult, PlaneDesc, StorageMode};

/// Egress conversion policy for one returned plane.
#[derive(Clone, Copy, Debug)]
pub struct ConvertPolicy {
    /// Fill alpha with 0 instead of 1 when widening RGB to RGBA. Dictated by
    /// the caller node's metadata.
    pub alpha0_for_rgb_to_rgba: bool,
    /// Premultiplication state the output claims; used to decide whether an
    /// RGBA source must be unpremultiplied when narrowing to RGB.
    pub output_premult: ImagePremult,
}

/// Convert `src` to the requested component set and bit depth if they differ.
///
/// GL textures pass through untouched (the GL pipeline owns their format).
/// Returns the input image unchanged when no conversion is needed.
pub fn convert_plane_if_needed(
    src: &Arc<Image>,
    roi: PixelRect,
    target_desc: &PlaneDesc,
    target_depth: BitDepth,
    policy: ConvertPolicy,
) -> ResolveResult<Arc<Image>> {
    if src.storage() == StorageMode::GlTexture {
        return Ok(src.clone());
    }
    if src.desc().channels() == target_desc.channels() && src.bit_depth() == target_depth {
        return Ok(src.clone());
    }

    let bounds = src.bounds();
    let out = Image::new(ImageParams {
        desc: target_desc.clone(),
        rod: src.rod(),
        bounds,
        mip: src.mip_level(),
        par: src.pixel_aspect(),
        depth: target_depth,
        premult: src.premult(),
        fielding: src.fielding(),
        storage: src.storage(),
    });
    if let Some(key) = src.key() {
        out.set_key(key);
    }

    let region = roi.intersect(bounds).unwrap_or(bounds);
    let widen_alpha0 =
        policy.alpha0_for_rgb_to_rgba && src.channels() == 3 && target_desc.channels() == 4;
    let unpremult = policy.output_premult == ImagePremult::Premultiplied
        && src.channels() == 4
        && target_desc.channels() == 3;

    for y in region.y1..region.y2 {
        for x in region.x1..region.x2 {
            let mut px = src.read_pixel(x, y);
            if widen_alpha0 {
                px[3] = 0.0;
            }
            if unpremult && px[3] > 0.0 {
                px[0] /= px[3];
                px[1] /= px[3];
                px[2] /= px[3];
            }
            out.fill(PixelRect::new(x, y, x + 1, y + 1), px);
        }
    }
    out.mark_rendered(region);
    Ok(out)
}
