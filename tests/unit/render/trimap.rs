use super::*;
use crate::foundation::core::MipLevel;
use crate::image::image::{Image, ImageParams};
use crate::image::plane::{BitDepth, FieldingOrder, ImagePremult, PlaneDesc, StorageMode};
use kurbo::Rect;
use std::time::Instant;

fn image8() -> Arc<Image> {
    Image::new(ImageParams {
        desc: PlaneDesc::rgba(),
        rod: Rect::new(0.0, 0.0, 8.0, 8.0),
        bounds: PixelRect::new(0, 0, 8, 8),
        mip: MipLevel::FULL,
        par: 1.0,
        depth: BitDepth::Float,
        premult: ImagePremult::Premultiplied,
        fielding: FieldingOrder::None,
        storage: StorageMode::Ram,
    })
}

#[test]
fn wait_returns_immediately_when_nothing_pending() {
    let coord = TrimapCoordinator::new();
    let img = image8();
    assert!(coord.wait_for_elsewhere(&img, PixelRect::new(0, 0, 8, 8), &AbortToken::unabortable()));
}

#[test]
fn waiter_blocks_until_publish() {
    let coord = Arc::new(TrimapCoordinator::new());
    let img = image8();
    let region = PixelRect::new(0, 0, 8, 8);

    let mark = coord.mark_being_rendered(&img);
    let (claimed, pending) = img.claim_rest(region);
    assert_eq!(claimed.len(), 1);
    assert!(!pending);

    let waiter = {
        let coord = coord.clone();
        let img = img.clone();
        std::thread::spawn(move || {
            coord.wait_for_elsewhere(&img, region, &AbortToken::unabortable())
        })
    };

    std::thread::sleep(std::time::Duration::from_millis(30));
    mark.publish(region, false);
    drop(mark);
    assert!(waiter.join().unwrap());
    assert!(img.is_fully_rendered(region));
}

#[test]
fn aborted_waiter_gives_up() {
    let coord = Arc::new(TrimapCoordinator::new());
    let img = image8();
    let region = PixelRect::new(0, 0, 8, 8);
    let _mark = coord.mark_being_rendered(&img);
    img.claim_rest(region);

    let token = AbortToken::abortable();
    token.abort();
    let start = Instant::now();
    assert!(!coord.wait_for_elsewhere(&img, region, &token));
    assert!(start.elapsed().as_millis() < 500, "abort poll must be prompt");
}

#[test]
fn failed_publish_releases_pixels_for_takeover() {
    let coord = TrimapCoordinator::new();
    let img = image8();
    let region = PixelRect::new(0, 0, 8, 8);

    {
        let mark = coord.mark_being_rendered(&img);
        img.claim_rest(region);
        mark.publish(region, true);
    }

    // The original renderer abandoned the render; a second requester takes
    // over instead of waiting.
    let (claimed, pending) = img.claim_rest(region);
    assert_eq!(claimed, vec![region]);
    assert!(!pending);
}
