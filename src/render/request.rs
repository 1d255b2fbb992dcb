use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use kurbo::Rect;

use crate::foundation::core::{FrameTime, MipLevel, NodeId, PixelRect, ViewIndex};
use crate::foundation::error::{ResolveError, ResolveResult};
use crate::graph::effect::RegionOfDefinition;
use crate::graph::node::Node;
use crate::image::plane::{BitDepth, PlaneDesc, StorageMode};
use crate::render::identity::{ResolvedIdentity, resolve_identity};

/// One render-region-of-interest call. Stack-scoped to a single resolution.
#[derive(Clone)]
pub struct RenderRequest {
    pub time: FrameTime,
    pub view: ViewIndex,
    pub mip: MipLevel,
    /// Pixel region at `mip`. Empty region returns an empty success.
    pub roi: PixelRect,
    /// Requested component planes. Empty set returns an empty success.
    pub planes: Vec<PlaneDesc>,
    pub bit_depth: BitDepth,
    pub return_storage: StorageMode,
    pub bypass_cache: bool,
    pub allow_gpu: bool,
    /// Downstream node driving this request, when any.
    pub caller: Option<Arc<Node>>,
    /// The caller's own render time; GPU storage is demoted when it differs
    /// from `time` (the result would be computed more than once uncached).
    pub caller_time: FrameTime,
    pub precomputed_rod: Option<Rect>,
    /// Caller already holds a read lock on the cached image: bound growth
    /// must go through the copy-and-swap path instead of a write lock.
    pub called_from_get_image: bool,
}

impl RenderRequest {
    pub fn new(time: FrameTime, roi: PixelRect, planes: Vec<PlaneDesc>) -> Self {
        Self {
            time,
            view: ViewIndex::MAIN,
            mip: MipLevel::FULL,
            roi,
            planes,
            bit_depth: BitDepth::Float,
            return_storage: StorageMode::Ram,
            bypass_cache: false,
            allow_gpu: true,
            caller: None,
            caller_time: time,
            precomputed_rod: None,
            called_from_get_image: false,
        }
    }
}

/// Pre-computed per-(time, view) answers reused across one frame render.
pub struct FrameViewRequest {
    /// `None` when the effect reported a null region of definition.
    pub rod: Option<RegionOfDefinition>,
    pub identity: ResolvedIdentity,
    /// Concatenated upstream transforms per input slot.
    pub transforms: BTreeMap<usize, kurbo::Affine>,
    pub frames_needed: BTreeMap<usize, Vec<(FrameTime, ViewIndex)>>,
}

/// Optional pre-pass cache: populated once per frame so the resolver's hot
/// path skips repeated region-of-definition and identity queries.
#[derive(Default)]
pub struct RequestPass {
    map: Mutex<HashMap<(NodeId, u64, u32), Arc<FrameViewRequest>>>,
}

impl RequestPass {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self, node: NodeId, time: FrameTime, view: ViewIndex) -> Option<Arc<FrameViewRequest>> {
        self.map
            .lock()
            .expect("request pass lock")
            .get(&(node, time.to_bits(), view.0))
            .cloned()
    }

    /// Walk the tree from `node`, computing RoD, identity and needed frames
    /// for every (node, time, view) the render will visit.
    pub fn prime(
        &self,
        node: &Arc<Node>,
        time: FrameTime,
        view: ViewIndex,
        mip: MipLevel,
    ) -> ResolveResult<()> {
        let key = (node.id(), time.to_bits(), view.0);
        if self.map.lock().expect("request pass lock").contains_key(&key) {
            return Ok(());
        }

        let effect = node.effect();
        let rod = effect
            .region_of_definition(time, view, mip)
            .map_err(|e| ResolveError::effect(format!("region_of_definition: {e}")))?;
        let identity = match &rod {
            Some(info) => {
                let px = crate::foundation::core::canonical_to_pixel_enclosing(
                    info.rect,
                    mip,
                    effect.pixel_aspect(),
                );
                resolve_identity(node, time, mip, px, view)?
            }
            None => ResolvedIdentity::NotIdentity,
        };
        let frames_needed = effect
            .frames_needed(time, view, mip)
            .map_err(|e| ResolveError::effect(format!("frames_needed: {e}")))?;
        let transforms = crate::render::resolver::collect_input_transforms(node, time, view);

        self.map.lock().expect("request pass lock").insert(
            key,
            Arc::new(FrameViewRequest {
                rod,
                identity,
                transforms,
                frames_needed: frames_needed.clone(),
            }),
        );

        for (slot, frames) in &frames_needed {
            if let Some(up) = node.input(*slot) {
                for (t, v) in frames {
                    self.prime(&up, *t, *v, mip)?;
                }
            }
        }
        Ok(())
    }
}
