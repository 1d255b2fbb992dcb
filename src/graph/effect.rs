use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use kurbo::{Affine, Rect};

use crate::foundation::core::{FrameTime, MipLevel, PixelRect, ViewIndex};
use crate::foundation::error::ResolveResult;
use crate::foundation::math::StableHasher;
use crate::image::image::Image;
use crate::image::plane::PlaneDesc;

/// Render-scale capability. `Maybe` effects settle to `Yes`/`No` after their
/// first region-of-definition query; the resolver re-asks at that point.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScaleSupport {
    No,
    Yes,
    Maybe,
}

/// Declared concurrency contract of an effect's render action.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadSafety {
    /// One render at a time across the whole plug-in.
    Unsafe,
    /// One render per instance; clones allow parallelism.
    InstanceSafe,
    /// One render per image.
    FullySafe,
    /// The host may additionally slice the region into tiles on a pool.
    FullySafeFrame,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GlSupport {
    No,
    Yes,
    Needed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViewInvariance {
    NotInvariant,
    OnlyPassThroughPlanesVariant,
    AllViewsInvariant,
}

/// Answer of the identity hook.
#[derive(Clone, Debug, PartialEq)]
pub enum IdentityVerdict {
    NotIdentity,
    /// No input backs the identity: the region is transparent black.
    Transparent,
    /// Identity of this same node at another time and/or view.
    SelfAtTimeView { time: FrameTime, view: ViewIndex },
    /// Identity of input `input` at the given time and view.
    PassThrough {
        input: usize,
        time: FrameTime,
        view: ViewIndex,
    },
}

/// Region of definition plus the project-format marker.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RegionOfDefinition {
    pub rect: Rect,
    pub project_format: bool,
}

/// What the components-needed hook reports for one call.
#[derive(Clone, Debug, Default)]
pub struct ComponentsNeeded {
    /// Planes consumed per input slot; slot `usize::MAX` is unused here, the
    /// node's own output planes live in `produced`.
    pub per_input: BTreeMap<usize, Vec<PlaneDesc>>,
    /// Planes this node produces.
    pub produced: Vec<PlaneDesc>,
    /// Channels of the colour plane the kernel actually writes.
    pub process_channels: [bool; 4],
    /// The kernel wants every requested plane shape mirrored on all inputs.
    pub process_all: bool,
    /// Planes not produced here flow through from this input untouched.
    pub pass_through: Option<PassThroughSource>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PassThroughSource {
    pub input: usize,
    pub time: FrameTime,
    pub view: ViewIndex,
}

/// Arguments shared by the begin/end sequence-render bracket.
#[derive(Clone, Debug)]
pub struct SequenceArgs {
    pub first: FrameTime,
    pub last: FrameTime,
    pub step: f64,
    pub interactive: bool,
    pub mip: MipLevel,
    pub sequential: bool,
    pub draft: bool,
    pub view: ViewIndex,
    pub use_gl: bool,
    pub gl_data: Option<GlRenderData>,
}

/// Per-render payload an effect attaches to a GL context.
pub type GlRenderData = Arc<dyn Any + Send + Sync>;

/// Outcome of attaching a GL context; failures use the error channel.
pub enum GlAttach {
    Attached(Option<GlRenderData>),
    OutOfMemory,
}

/// Opaque GPU context handle. Creation and pooling are external; the
/// resolver only needs the texture-size limit and an identity.
pub struct GlContext {
    pub max_texture_size: i64,
    pub renderer: String,
}

/// One tile render call.
pub struct RenderTileArgs<'a> {
    pub rect: PixelRect,
    pub time: FrameTime,
    pub view: ViewIndex,
    /// Mip level the kernel actually renders at (0 under
    /// render-full-then-downscale).
    pub mapped_mip: MipLevel,
    /// The effect's declared frame range.
    pub frame_range: (FrameTime, FrameTime),
    /// Render-target image per plane, all pre-allocated over `rect`.
    pub planes: &'a BTreeMap<PlaneDesc, Arc<Image>>,
    /// Input images per input slot, as produced by the recursive input pass.
    pub inputs: &'a BTreeMap<usize, BTreeMap<PlaneDesc, Arc<Image>>>,
    pub process_channels: [bool; 4],
    /// Concatenated upstream transforms per input slot, when collected.
    pub input_transforms: &'a BTreeMap<usize, Affine>,
    pub use_gl: bool,
    pub gl_data: Option<GlRenderData>,
}

/// The uniform capability surface of every effect in the graph.
///
/// All hooks return `ResolveResult`: the `Err` channel is the barrier that
/// keeps plug-in failures from unwinding the resolver.
pub trait Effect: Send + Sync {
    fn label(&self) -> &str;

    fn region_of_definition(
        &self,
        time: FrameTime,
        view: ViewIndex,
        mip: MipLevel,
    ) -> ResolveResult<Option<RegionOfDefinition>>;

    fn components_needed(
        &self,
        time: FrameTime,
        view: ViewIndex,
    ) -> ResolveResult<ComponentsNeeded>;

    fn is_identity(
        &self,
        _time: FrameTime,
        _mip: MipLevel,
        _region: PixelRect,
        _view: ViewIndex,
    ) -> ResolveResult<IdentityVerdict> {
        Ok(IdentityVerdict::NotIdentity)
    }

    fn frame_range(&self) -> (FrameTime, FrameTime) {
        (FrameTime(f64::MIN), FrameTime(f64::MAX))
    }

    /// Upstream frames required to render `time`/`view`. The default asks
    /// every connected input for the same frame and view.
    fn frames_needed(
        &self,
        time: FrameTime,
        view: ViewIndex,
        _mip: MipLevel,
    ) -> ResolveResult<BTreeMap<usize, Vec<(FrameTime, ViewIndex)>>> {
        let mut out = BTreeMap::new();
        for input in 0..self.input_count() {
            out.insert(input, vec![(time, view)]);
        }
        Ok(out)
    }

    fn begin_sequence_render(&self, _args: &SequenceArgs) -> ResolveResult<()> {
        Ok(())
    }

    fn end_sequence_render(&self, _args: &SequenceArgs) -> ResolveResult<()> {
        Ok(())
    }

    fn render(&self, args: &RenderTileArgs<'_>) -> ResolveResult<()>;

    /// Mix the effect's parameter state into the node fingerprint.
    fn param_fingerprint(&self, _h: &mut StableHasher) {}

    fn pixel_aspect(&self) -> f64 {
        1.0
    }

    fn premult(&self) -> crate::image::plane::ImagePremult {
        crate::image::plane::ImagePremult::Premultiplied
    }

    fn fielding(&self) -> crate::image::plane::FieldingOrder {
        crate::image::plane::FieldingOrder::None
    }

    /// Bit depth the kernel renders in; callers convert on egress.
    fn preferred_depth(&self) -> crate::image::plane::BitDepth {
        crate::image::plane::BitDepth::Float
    }

    fn input_count(&self) -> usize {
        0
    }

    fn input_is_mask(&self, _input: usize) -> bool {
        false
    }

    /// A channel selector on `input` makes identity redirections fetch the
    /// selector's planes instead of the caller's.
    fn has_channel_selector(&self, _input: usize) -> bool {
        false
    }

    /// Declares this effect a pure affine resampling of one input, foldable
    /// into downstream sampling.
    fn transform_at(
        &self,
        _time: FrameTime,
        _view: ViewIndex,
    ) -> Option<(usize, Affine)> {
        None
    }

    fn supports_render_scale(&self) -> ScaleSupport {
        ScaleSupport::Yes
    }

    fn supports_tiles(&self) -> bool {
        true
    }

    fn supports_multi_resolution(&self) -> bool {
        true
    }

    fn thread_safety(&self) -> ThreadSafety {
        ThreadSafety::FullySafe
    }

    fn gl_support(&self) -> GlSupport {
        GlSupport::No
    }

    fn supports_concurrent_gl_renders(&self) -> bool {
        false
    }

    fn view_invariance(&self) -> ViewInvariance {
        ViewInvariance::NotInvariant
    }

    fn is_writer(&self) -> bool {
        false
    }

    /// True when output varies over time even with static parameters
    /// (readers of image sequences, animated generators).
    fn is_frame_varying(&self) -> bool {
        false
    }

    fn is_reader(&self) -> bool {
        false
    }

    fn is_multi_planar(&self) -> bool {
        false
    }

    fn is_paint_node(&self) -> bool {
        false
    }

    /// Disk-cache nodes push their output to disk-backed storage.
    fn is_disk_cache(&self) -> bool {
        false
    }

    /// RGB→RGBA widening on egress fills alpha with 0 for callers that ask.
    fn uses_alpha0_for_rgb_to_rgba(&self) -> bool {
        false
    }

    /// Sequential writers bracket their own sequence renders.
    fn manages_sequence_bracketing(&self) -> bool {
        false
    }

    /// Spawn an instance that may render concurrently with this one,
    /// sharing state through it. `None` means the effect cannot be cloned
    /// and instance-safety falls back to the per-instance lock.
    fn render_clone(&self) -> Option<Arc<dyn Effect>> {
        None
    }

    fn attach_gl_context(&self, _ctx: &GlContext) -> ResolveResult<GlAttach> {
        Ok(GlAttach::Attached(None))
    }

    fn detach_gl_context(&self, _ctx: &GlContext, _data: Option<GlRenderData>) {}
}
