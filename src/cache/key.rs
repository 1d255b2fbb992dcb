use crate::foundation::core::{FrameTime, NodeId, ViewIndex};
use crate::foundation::math::StableHasher;

/// Content address of one cached plane image.
///
/// Two keys collide iff every field matches; the cache buckets entries by
/// [`bucket`](Self::bucket) and disambiguates by equality. Draft and
/// non-draft renders occupy distinct keys so a high-quality result can
/// satisfy a draft request through a second lookup.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ImageKey {
    pub node: NodeId,
    /// Fingerprint over all inputs influencing the node's output.
    pub node_hash: u64,
    pub frame_varying: bool,
    pub time: FrameTime,
    pub view: ViewIndex,
    pub draft: bool,
    /// True when the image was rendered at full scale on behalf of a
    /// downscaled request (render-full-then-downscale).
    pub full_scale: bool,
}

impl ImageKey {
    pub fn bucket(&self) -> u64 {
        let mut h = StableHasher::new();
        h.write_u64(self.node.0);
        h.write_u64(self.node_hash);
        h.write_bool(self.frame_varying);
        h.write_u64(self.time.to_bits());
        h.write_u32(self.view.0);
        h.write_bool(self.draft);
        h.write_bool(self.full_scale);
        h.finish()
    }

    /// The non-draft twin of this key, looked up first for draft requests.
    pub fn as_non_draft(&self) -> ImageKey {
        ImageKey {
            draft: false,
            ..self.clone()
        }
    }
}

#[cfg(test)]
#[path = "../../tests/unit/cache/key.rs"]
mod tests;
