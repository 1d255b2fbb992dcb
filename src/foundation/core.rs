use smallvec::SmallVec;

pub use kurbo::{Affine, Point, Rect, Vec2};

/// Timeline position in frames. Fractional values are legal (retimers).
#[derive(Clone, Copy, Debug, Default, PartialEq, PartialOrd, serde::Serialize, serde::Deserialize)]
pub struct FrameTime(pub f64);

impl FrameTime {
    /// Stable bit pattern used for hashing and cache-key equality.
    pub fn to_bits(self) -> u64 {
        self.0.to_bits()
    }
}

impl Eq for FrameTime {}

impl std::hash::Hash for FrameTime {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.to_bits().hash(state);
    }
}

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct ViewIndex(pub u32);

impl ViewIndex {
    pub const MAIN: ViewIndex = ViewIndex(0);
}

/// Power-of-two downscale index. Level 0 is full resolution, level k is 1/2^k.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct MipLevel(pub u32);

impl MipLevel {
    pub const FULL: MipLevel = MipLevel(0);

    pub fn scale(self) -> f64 {
        1.0 / f64::from(1u32 << self.0.min(31))
    }

    pub fn is_full(self) -> bool {
        self.0 == 0
    }
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct NodeId(pub u64);

/// Integer pixel rectangle, half-open: `[x1, x2) x [y1, y2)`.
///
/// Canonical-space rectangles are `kurbo::Rect`; this is the pixel-grid
/// counterpart at a given mip level and pixel aspect ratio.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct PixelRect {
    pub x1: i64,
    pub y1: i64,
    pub x2: i64,
    pub y2: i64,
}

impl PixelRect {
    pub fn new(x1: i64, y1: i64, x2: i64, y2: i64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn from_size(x: i64, y: i64, w: i64, h: i64) -> Self {
        Self {
            x1: x,
            y1: y,
            x2: x + w,
            y2: y + h,
        }
    }

    pub fn is_empty(self) -> bool {
        self.x2 <= self.x1 || self.y2 <= self.y1
    }

    pub fn width(self) -> i64 {
        (self.x2 - self.x1).max(0)
    }

    pub fn height(self) -> i64 {
        (self.y2 - self.y1).max(0)
    }

    pub fn area(self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    pub fn contains(self, other: PixelRect) -> bool {
        other.is_empty()
            || (other.x1 >= self.x1 && other.x2 <= self.x2 && other.y1 >= self.y1 && other.y2 <= self.y2)
    }

    pub fn contains_point(self, x: i64, y: i64) -> bool {
        x >= self.x1 && x < self.x2 && y >= self.y1 && y < self.y2
    }

    pub fn intersect(self, other: PixelRect) -> Option<PixelRect> {
        let r = PixelRect {
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
            x2: self.x2.min(other.x2),
            y2: self.y2.min(other.y2),
        };
        (!r.is_empty()).then_some(r)
    }

    pub fn union(self, other: PixelRect) -> PixelRect {
        if self.is_empty() {
            return other;
        }
        if other.is_empty() {
            return self;
        }
        PixelRect {
            x1: self.x1.min(other.x1),
            y1: self.y1.min(other.y1),
            x2: self.x2.max(other.x2),
            y2: self.y2.max(other.y2),
        }
    }

    /// Map this pixel rect (at `mip`, with pixel aspect `par`) to canonical
    /// coordinates. The aspect ratio applies to x only.
    pub fn to_canonical(self, mip: MipLevel, par: f64) -> Rect {
        let up = f64::from(1u32 << mip.0.min(31));
        Rect::new(
            self.x1 as f64 * par * up,
            self.y1 as f64 * up,
            self.x2 as f64 * par * up,
            self.y2 as f64 * up,
        )
    }

    /// Split into a grid of tiles no larger than `tile` on a side, aligned to
    /// multiples of `tile`. Used by the per-tile identity optimisation.
    pub fn split_tiles(self, tile: i64) -> SmallVec<[PixelRect; 8]> {
        let mut out = SmallVec::new();
        if self.is_empty() || tile <= 0 {
            return out;
        }
        let mut y = self.y1;
        while y < self.y2 {
            let ty2 = (align_up(y + 1, tile)).min(self.y2);
            let mut x = self.x1;
            while x < self.x2 {
                let tx2 = (align_up(x + 1, tile)).min(self.x2);
                out.push(PixelRect::new(x, y, tx2, ty2));
                x = tx2;
            }
            y = ty2;
        }
        out
    }
}

fn align_up(v: i64, to: i64) -> i64 {
    v.div_euclid(to) * to + if v.rem_euclid(to) == 0 { 0 } else { to }
}

/// Enclosing pixel rectangle of a canonical rect at a mip level.
///
/// Inverse of [`PixelRect::to_canonical`], rounded outward so every covered
/// canonical point maps to a covered pixel.
pub fn canonical_to_pixel_enclosing(r: Rect, mip: MipLevel, par: f64) -> PixelRect {
    let scale = mip.scale();
    PixelRect {
        x1: (r.x0 * scale / par).floor() as i64,
        y1: (r.y0 * scale).floor() as i64,
        x2: (r.x1 * scale / par).ceil() as i64,
        y2: (r.y1 * scale).ceil() as i64,
    }
}

pub fn rect_is_null(r: Rect) -> bool {
    r.width() <= 0.0 || r.height() <= 0.0
}
