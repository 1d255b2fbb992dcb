use super::*;
use crate::image::plane::PlaneDesc;

fn params(desc: PlaneDesc, bounds: PixelRect, mip: MipLevel) -> ImageParams {
    ImageParams {
        desc,
        rod: Rect::new(
            bounds.x1 as f64,
            bounds.y1 as f64,
            bounds.x2 as f64,
            bounds.y2 as f64,
        ),
        bounds,
        mip,
        par: 1.0,
        depth: BitDepth::Float,
        premult: ImagePremult::Premultiplied,
        fielding: FieldingOrder::None,
        storage: StorageMode::Ram,
    }
}

#[test]
fn fill_and_read_round_trip() {
    let img = Image::new(params(
        PlaneDesc::rgba(),
        PixelRect::new(0, 0, 4, 4),
        MipLevel::FULL,
    ));
    img.fill(PixelRect::new(0, 0, 4, 4), [1.0, 0.0, 0.0, 1.0]);
    assert_eq!(img.read_pixel(2, 2), [1.0, 0.0, 0.0, 1.0]);
    assert_eq!(img.read_pixel(9, 9), [0.0; 4]);
}

#[test]
fn ensure_bounds_grows_and_keeps_content() {
    let img = Image::new(params(
        PlaneDesc::rgba(),
        PixelRect::new(0, 0, 4, 4),
        MipLevel::FULL,
    ));
    img.fill(PixelRect::new(0, 0, 4, 4), [0.5, 0.5, 0.5, 1.0]);
    img.mark_rendered(PixelRect::new(0, 0, 4, 4));

    assert!(!img.ensure_bounds(PixelRect::new(1, 1, 3, 3), true));
    assert!(img.ensure_bounds(PixelRect::new(0, 0, 8, 8), true));
    assert_eq!(img.bounds(), PixelRect::new(0, 0, 8, 8));
    assert_eq!(img.read_pixel(2, 2), [0.5, 0.5, 0.5, 1.0]);
    assert_eq!(img.read_pixel(6, 6), [0.0; 4]);
    // Grown area was zero-filled and marked rendered.
    assert!(img.is_fully_rendered(PixelRect::new(0, 0, 8, 8)));
}

#[test]
fn copy_and_resize_leaves_original_untouched() {
    let img = Image::new(params(
        PlaneDesc::rgba(),
        PixelRect::new(0, 0, 4, 4),
        MipLevel::FULL,
    ));
    img.fill(PixelRect::new(0, 0, 4, 4), [0.0, 1.0, 0.0, 1.0]);
    img.mark_rendered(PixelRect::new(0, 0, 4, 4));

    let grown = img
        .copy_and_resize_if_needed(PixelRect::new(0, 0, 6, 6), false)
        .unwrap();
    assert_eq!(img.bounds(), PixelRect::new(0, 0, 4, 4));
    assert_eq!(grown.bounds(), PixelRect::new(0, 0, 6, 6));
    assert_eq!(grown.read_pixel(3, 3), [0.0, 1.0, 0.0, 1.0]);
    assert_eq!(
        grown.rest_to_render(PixelRect::new(0, 0, 6, 6)).len(),
        2,
        "grown band is unrendered"
    );
    assert!(
        img.copy_and_resize_if_needed(PixelRect::new(1, 1, 3, 3), false)
            .is_none()
    );
}

#[test]
fn copy_from_converts_components() {
    let rgba = Image::new(params(
        PlaneDesc::rgba(),
        PixelRect::new(0, 0, 4, 4),
        MipLevel::FULL,
    ));
    rgba.fill(PixelRect::new(0, 0, 4, 4), [0.25, 0.5, 0.75, 0.5]);

    let rgb = Image::new(params(
        PlaneDesc::rgb(),
        PixelRect::new(0, 0, 4, 4),
        MipLevel::FULL,
    ));
    rgb.copy_from(&rgba, PixelRect::new(0, 0, 4, 4));
    // RGB drops alpha; the expanded read reports opaque.
    assert_eq!(rgb.read_pixel(1, 1), [0.25, 0.5, 0.75, 1.0]);

    let alpha = Image::new(params(
        PlaneDesc::alpha(),
        PixelRect::new(0, 0, 4, 4),
        MipLevel::FULL,
    ));
    alpha.copy_from(&rgba, PixelRect::new(0, 0, 4, 4));
    assert_eq!(alpha.read_pixel(1, 1)[3], 0.5);
}

#[test]
fn downscale_averages_blocks() {
    let full = Image::new(params(
        PlaneDesc::rgba(),
        PixelRect::new(0, 0, 4, 4),
        MipLevel::FULL,
    ));
    full.fill(PixelRect::new(0, 0, 2, 4), [1.0, 1.0, 1.0, 1.0]);
    full.fill(PixelRect::new(2, 0, 4, 4), [0.0, 0.0, 0.0, 1.0]);

    let half = Image::new(params(
        PlaneDesc::rgba(),
        PixelRect::new(0, 0, 2, 2),
        MipLevel(1),
    ));
    full.downscale_mip_map(&half, PixelRect::new(0, 0, 2, 2));
    assert_eq!(half.read_pixel(0, 0), [1.0, 1.0, 1.0, 1.0]);
    assert_eq!(half.read_pixel(1, 1), [0.0, 0.0, 0.0, 1.0]);
    assert!(half.is_fully_rendered(PixelRect::new(0, 0, 2, 2)));
}
