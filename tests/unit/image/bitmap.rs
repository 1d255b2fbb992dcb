use super::*;

fn b8() -> Bitmap {
    Bitmap::new(PixelRect::new(0, 0, 8, 8))
}

#[test]
fn fresh_bitmap_has_one_rect_to_render() {
    let b = b8();
    let rects = b.rest_to_render(PixelRect::new(0, 0, 8, 8));
    assert_eq!(rects, vec![PixelRect::new(0, 0, 8, 8)]);
}

#[test]
fn half_rendered_leaves_exactly_the_other_half() {
    let mut b = b8();
    let bottom = PixelRect::new(0, 0, 8, 4);
    let top = PixelRect::new(0, 4, 8, 8);
    b.mark_rendered(bottom);
    assert_eq!(b.rest_to_render(PixelRect::new(0, 0, 8, 8)), vec![top]);
    assert!(b.is_fully_rendered(bottom));
    assert!(!b.is_fully_rendered(top));
}

#[test]
fn claim_marks_pending_and_second_claim_sees_it() {
    let mut b = b8();
    let (rects, pending) = b.claim(PixelRect::new(0, 0, 8, 8));
    assert_eq!(rects, vec![PixelRect::new(0, 0, 8, 8)]);
    assert!(!pending);

    // Overlapping claim gets nothing but learns someone else is rendering.
    let (rects, pending) = b.claim(PixelRect::new(2, 2, 6, 6));
    assert!(rects.is_empty());
    assert!(pending);
    assert!(b.has_pending(PixelRect::new(0, 0, 8, 8)));
}

#[test]
fn publish_success_then_failure_path() {
    let mut b = b8();
    let region = PixelRect::new(0, 0, 4, 4);
    b.claim(region);
    b.publish(region, false);
    assert!(b.is_fully_rendered(region));

    let region2 = PixelRect::new(4, 0, 8, 4);
    b.claim(region2);
    b.publish(region2, true);
    assert!(!b.has_pending(region2));
    assert_eq!(b.rest_to_render(region2), vec![region2]);
}

#[test]
fn pending_counts_as_unrendered_in_degraded_query() {
    let mut b = b8();
    b.claim(PixelRect::new(0, 0, 8, 8));
    assert_eq!(
        b.rest_to_render(PixelRect::new(0, 0, 8, 8)),
        vec![PixelRect::new(0, 0, 8, 8)]
    );
    let (unrendered, pending) = b.rest_unrendered(PixelRect::new(0, 0, 8, 8));
    assert!(unrendered.is_empty());
    assert!(pending);
}

#[test]
fn scan_merges_rows_into_disjoint_rects() {
    let mut b = b8();
    // Render an L shape; the remainder must come back as disjoint rects
    // covering the exact area.
    b.mark_rendered(PixelRect::new(0, 0, 4, 8));
    b.mark_rendered(PixelRect::new(0, 0, 8, 2));
    let rects = b.rest_to_render(PixelRect::new(0, 0, 8, 8));
    let total: u64 = rects.iter().map(|r| r.area()).sum();
    assert_eq!(total, 6 * 4);
    for (i, a) in rects.iter().enumerate() {
        for bb in &rects[i + 1..] {
            assert!(a.intersect(*bb).is_none(), "rects overlap: {a:?} {bb:?}");
        }
    }
}

#[test]
fn region_beyond_bounds_counts_as_unrendered() {
    let mut b = b8();
    b.mark_rendered(PixelRect::new(0, 0, 8, 8));
    // A query over a larger region reports the band outside the current
    // allocation, even though no bitmap storage backs it yet.
    let rects = b.rest_to_render(PixelRect::new(0, 0, 8, 16));
    assert_eq!(rects, vec![PixelRect::new(0, 8, 8, 16)]);
    assert!(!b.is_fully_rendered(PixelRect::new(0, 0, 8, 16)));
}

#[test]
fn resize_keeps_overlap_state() {
    let mut b = b8();
    b.mark_rendered(PixelRect::new(0, 0, 8, 4));
    b.resize(PixelRect::new(0, 0, 16, 8), false);
    assert!(b.is_fully_rendered(PixelRect::new(0, 0, 8, 4)));
    assert_eq!(
        b.rest_to_render(PixelRect::new(8, 0, 16, 4)),
        vec![PixelRect::new(8, 0, 16, 4)]
    );
}

#[test]
fn dirty_zone_restricts_scanning() {
    let mut b = b8();
    b.set_dirty_zone(PixelRect::new(0, 0, 4, 4));
    let rects = b.rest_to_render(PixelRect::new(0, 0, 8, 8));
    assert_eq!(rects, vec![PixelRect::new(0, 0, 4, 4)]);
}
