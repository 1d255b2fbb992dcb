use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use kurbo::Affine;
use rayon::prelude::*;

use crate::foundation::core::{
    FrameTime, MipLevel, PixelRect, ViewIndex, canonical_to_pixel_enclosing,
};
use crate::foundation::error::{ResolveError, ResolveResult};
use crate::graph::effect::{
    GlAttach, GlRenderData, RenderTileArgs, SequenceArgs, ThreadSafety,
};
use crate::graph::node::Node;
use crate::image::image::Image;
use crate::image::plane::{BitDepth, ImagePremult, PlaneDesc};
use crate::render::context::{FrameContext, install_snapshot, snapshot_contexts};
use crate::render::request::RenderRequest;
use crate::render::resolver::{PlaneMap, Resolver};

/// Working state of one plane across a resolution.
#[derive(Clone, Default)]
pub struct PlaneState {
    /// The cached (render-mapped) image; full scale when rendering at full
    /// resolution on behalf of a downscaled request.
    pub fullscale: Option<Arc<Image>>,
    /// The image handed back to the caller; equals `fullscale` unless
    /// render-full-then-downscale is active.
    pub downscale: Option<Arc<Image>>,
    /// Resized copy pending an atomic cache swap (the no-write-lock path).
    pub swap: Option<Arc<Image>>,
    /// Pointer marker of the originally looked-up cached image, compared
    /// after the pressure-relief re-lookup. Never dereferenced.
    pub original_cached_ptr: Option<usize>,
    /// This resolution allocated (or replaced) the cached image itself. Only
    /// such planes are evicted on the failure path; abort never removes
    /// other renders' cache entries.
    pub allocated_on_the_fly: bool,
}

impl PlaneState {
    pub fn render_mapped(&self, render_full: bool) -> Option<Arc<Image>> {
        if render_full {
            self.fullscale.clone()
        } else {
            self.downscale.clone()
        }
    }
}

/// Redirection target of an identity-tagged rectangle. `None` renders
/// transparent black.
#[derive(Clone)]
pub struct IdentityRedirect {
    pub target: Option<Arc<Node>>,
    pub time: FrameTime,
    pub view: ViewIndex,
}

#[derive(Clone)]
pub struct RectToRender {
    pub rect: PixelRect,
    pub identity: Option<IdentityRedirect>,
    /// Input images per slot, produced by the recursive input pass.
    pub inputs: BTreeMap<usize, PlaneMap>,
}

/// Everything the tile dispatcher works on for one resolution.
pub struct PlanesToRender {
    pub planes: BTreeMap<PlaneDesc, PlaneState>,
    pub rects: Vec<RectToRender>,
    pub use_gl: bool,
    pub output_premult: ImagePremult,
}

impl PlanesToRender {
    pub fn new(use_gl: bool, output_premult: ImagePremult) -> Self {
        Self {
            planes: BTreeMap::new(),
            rects: Vec::new(),
            use_gl,
            output_premult,
        }
    }

    pub fn first_cached(&self) -> Option<Arc<Image>> {
        self.planes.values().next().and_then(|s| s.fullscale.clone())
    }
}

#[derive(Default)]
pub struct DispatchOutput {
    /// Another thread is producing overlapping pixels; the resolver must
    /// wait on the trimap before returning.
    pub took_image_lock: bool,
}

pub(crate) struct DispatchArgs<'a> {
    pub node: &'a Arc<Node>,
    pub ctx: &'a Arc<FrameContext>,
    pub planes: &'a PlanesToRender,
    pub time: FrameTime,
    pub view: ViewIndex,
    pub req_mip: MipLevel,
    pub mapped_mip: MipLevel,
    pub render_full: bool,
    pub par: f64,
    pub process_channels: [bool; 4],
    pub input_transforms: &'a BTreeMap<usize, Affine>,
    pub trimap_enabled: bool,
    pub requested_planes: &'a [PlaneDesc],
    pub bit_depth: BitDepth,
    pub bypass_cache: bool,
}

impl Resolver {
    /// Run the rects of one resolution through the effect, honouring its
    /// declared thread safety. Lock order is plug-in, then instance, then
    /// image; the per-image discipline is the trimap claim itself.
    pub(crate) fn dispatch_tiles(&self, args: &DispatchArgs<'_>) -> ResolveResult<DispatchOutput> {
        let effect = args.node.effect().clone();
        let safety = effect.thread_safety();
        let use_gl = args.planes.use_gl;

        let use_clone = safety == ThreadSafety::InstanceSafe
            || (safety != ThreadSafety::Unsafe && use_gl && !effect.supports_concurrent_gl_renders());
        let render_node = if use_clone {
            args.node
                .acquire_render_clone()
                .unwrap_or_else(|| args.node.clone())
        } else {
            args.node.clone()
        };
        let is_clone = render_node.is_render_clone();

        let _plugin_guard = (safety == ThreadSafety::Unsafe)
            .then(|| args.node.plugin().render_lock.lock().expect("plugin render lock"));
        let _instance_guard = (safety == ThreadSafety::InstanceSafe && !is_clone)
            .then(|| args.node.instance_lock().lock().expect("instance render lock"));

        let mut gl_data: Option<GlRenderData> = None;
        let mut _gl_guard = None;
        let gl_ctx = args.ctx.gl.clone();
        if use_gl {
            let Some(gl) = &gl_ctx else {
                return Err(ResolveError::effect(
                    "GPU storage selected without an attached GL context",
                ));
            };
            if !effect.supports_concurrent_gl_renders() {
                _gl_guard = Some(args.node.plugin().gl_lock.lock().expect("plugin gl lock"));
            }
            match render_node
                .effect()
                .attach_gl_context(gl)
                .map_err(|e| ResolveError::effect(format!("attach_gl_context: {e}")))?
            {
                GlAttach::OutOfMemory => {
                    if is_clone {
                        args.node.release_render_clone(render_node);
                    }
                    return Err(ResolveError::OutOfGpuMemory);
                }
                GlAttach::Attached(data) => gl_data = data,
            }
        }

        let seq = SequenceArgs {
            first: args.time,
            last: args.time,
            step: 1.0,
            interactive: args.ctx.user_interaction,
            mip: args.mapped_mip,
            sequential: args.ctx.sequential,
            draft: args.ctx.draft,
            view: args.view,
            use_gl,
            gl_data: gl_data.clone(),
        };
        let bracket = !(effect.is_writer() && effect.manages_sequence_bracketing());

        let result = self.dispatch_bracketed(args, &render_node, bracket, &seq, gl_data.clone());

        if use_gl && let Some(gl) = &gl_ctx {
            render_node.effect().detach_gl_context(gl, gl_data);
        }
        if is_clone {
            args.node.release_render_clone(render_node);
        }
        result
    }

    fn dispatch_bracketed(
        &self,
        args: &DispatchArgs<'_>,
        render_node: &Arc<Node>,
        bracket: bool,
        seq: &SequenceArgs,
        gl_data: Option<GlRenderData>,
    ) -> ResolveResult<DispatchOutput> {
        if bracket {
            render_node
                .effect()
                .begin_sequence_render(seq)
                .map_err(|e| ResolveError::effect(format!("begin_sequence_render: {e}")))?;
        }

        let effect = render_node.effect();
        let fan_out = effect.thread_safety() == ThreadSafety::FullySafeFrame
            && args.ctx.tiles_supported
            && args.planes.rects.len() > 1
            && !args.planes.use_gl
            && !effect.is_paint_node()
            && self.in_flight.load(Ordering::Relaxed) < self.pool.current_num_threads();

        let tiles: ResolveResult<bool> = if fan_out {
            let snapshot = snapshot_contexts();
            self.in_flight
                .fetch_add(args.planes.rects.len(), Ordering::Relaxed);
            let outcomes: Vec<ResolveResult<bool>> = self.pool.install(|| {
                args.planes
                    .rects
                    .par_iter()
                    .map(|r| {
                        let _tls = install_snapshot(&snapshot);
                        self.render_tile(render_node, args, r, gl_data.clone())
                    })
                    .collect()
            });
            self.in_flight
                .fetch_sub(args.planes.rects.len(), Ordering::Relaxed);
            fold_outcomes(outcomes)
        } else {
            let mut took = false;
            let mut res = Ok(());
            for r in &args.planes.rects {
                match self.render_tile(render_node, args, r, gl_data.clone()) {
                    Ok(t) => took |= t,
                    Err(e) => {
                        res = Err(e);
                        break;
                    }
                }
            }
            res.map(|()| took)
        };

        // The end hook runs whenever begin ran, including after a failed
        // tile; an end failure only surfaces when the tiles succeeded.
        if bracket {
            let end = render_node
                .effect()
                .end_sequence_render(seq)
                .map_err(|e| ResolveError::effect(format!("end_sequence_render: {e}")));
            let took = tiles?;
            end?;
            return Ok(DispatchOutput {
                took_image_lock: took,
            });
        }
        tiles.map(|took| DispatchOutput {
            took_image_lock: took,
        })
    }

    /// Render one rect: claim its unrendered pixels, run the kernel (or the
    /// identity redirection) over each claimed sub-rect, publish the claims.
    fn render_tile(
        &self,
        render_node: &Arc<Node>,
        args: &DispatchArgs<'_>,
        r: &RectToRender,
        gl_data: Option<GlRenderData>,
    ) -> ResolveResult<bool> {
        if args.ctx.abort.is_aborted() {
            return Err(ResolveError::Aborted);
        }

        let mut targets: BTreeMap<PlaneDesc, Arc<Image>> = BTreeMap::new();
        for (desc, state) in &args.planes.planes {
            let Some(img) = state.render_mapped(args.render_full) else {
                return Err(ResolveError::validation(format!(
                    "plane '{}' dispatched without an allocated image",
                    desc.layer()
                )));
            };
            targets.insert(desc.clone(), img);
        }
        let Some(first) = targets.values().next().cloned() else {
            return Ok(false);
        };

        let (claims, pending) = if args.trimap_enabled {
            first.claim_rest(r.rect)
        } else {
            (first.rest_to_render(r.rect), false)
        };
        let took = args.trimap_enabled && pending;
        if claims.is_empty() {
            return Ok(took);
        }

        let outcome = match &r.identity {
            Some(redirect) => self.render_identity_tile(args, r, redirect, &targets, &claims),
            None => self.render_effect_tile(render_node, args, r, &targets, &claims, gl_data),
        };

        match outcome {
            Ok(()) => Ok(took),
            Err(e) => {
                // Release every claim this tile held so another renderer can
                // take over; the resolver evicts the image on failure.
                for sub in &claims {
                    self.publish_claims(args, &targets, &first, *sub, true);
                }
                Err(e)
            }
        }
    }

    fn render_effect_tile(
        &self,
        render_node: &Arc<Node>,
        args: &DispatchArgs<'_>,
        r: &RectToRender,
        targets: &BTreeMap<PlaneDesc, Arc<Image>>,
        claims: &[PixelRect],
        gl_data: Option<GlRenderData>,
    ) -> ResolveResult<()> {
        let first = targets.values().next().expect("non-empty targets").clone();
        for sub in claims {
            if args.ctx.abort.is_aborted() {
                return Err(ResolveError::Aborted);
            }
            let tile_args = RenderTileArgs {
                rect: *sub,
                time: args.time,
                view: args.view,
                mapped_mip: args.mapped_mip,
                frame_range: render_node.effect().frame_range(),
                planes: targets,
                inputs: &r.inputs,
                process_channels: args.process_channels,
                input_transforms: args.input_transforms,
                use_gl: args.planes.use_gl,
                gl_data: gl_data.clone(),
            };
            render_node
                .effect()
                .render(&tile_args)
                .map_err(|e| match e {
                    ResolveError::Aborted | ResolveError::OutOfGpuMemory => e,
                    other => ResolveError::effect(format!("render: {other}")),
                })?;
            self.publish_claims(args, targets, &first, *sub, false);
            self.downscale_tile(args, *sub);
            if let Some(stats) = &args.ctx.stats {
                stats.tiles_rendered.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// An identity rect renders the chain terminus and copies its pixels in.
    fn render_identity_tile(
        &self,
        args: &DispatchArgs<'_>,
        r: &RectToRender,
        redirect: &IdentityRedirect,
        targets: &BTreeMap<PlaneDesc, Arc<Image>>,
        claims: &[PixelRect],
    ) -> ResolveResult<()> {
        let first = targets.values().next().expect("non-empty targets").clone();
        let id_planes: PlaneMap = match &redirect.target {
            None => PlaneMap::new(),
            Some(target) => {
                let canonical = r.rect.to_canonical(args.mapped_mip, args.par);
                let roi = canonical_to_pixel_enclosing(
                    canonical,
                    args.mapped_mip,
                    target.effect().pixel_aspect(),
                );
                let mut sub =
                    RenderRequest::new(redirect.time, roi, args.requested_planes.to_vec());
                sub.view = redirect.view;
                sub.mip = args.mapped_mip;
                sub.bit_depth = args.bit_depth;
                sub.bypass_cache = args.bypass_cache;
                sub.caller = Some(args.node.clone());
                sub.caller_time = args.time;
                sub.allow_gpu = false;
                self.render_roi(target, &sub)?
            }
        };

        for sub in claims {
            for (desc, img) in targets {
                img.fill(*sub, [0.0; 4]);
                if let Some(src) = best_plane_match(&id_planes, desc) {
                    img.copy_from(src, *sub);
                }
            }
            self.publish_claims(args, targets, &first, *sub, false);
            self.downscale_tile(args, *sub);
        }
        if let Some(stats) = &args.ctx.stats {
            stats
                .identity_rects
                .fetch_add(claims.len() as u64, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Publish `sub` across every plane. Pixels were claimed on the first
    /// plane only; sibling planes advance together and get marked directly.
    fn publish_claims(
        &self,
        args: &DispatchArgs<'_>,
        targets: &BTreeMap<PlaneDesc, Arc<Image>>,
        first: &Arc<Image>,
        sub: PixelRect,
        failed: bool,
    ) {
        for img in targets.values() {
            if Arc::ptr_eq(img, first) {
                if args.trimap_enabled {
                    img.publish(sub, failed);
                } else if failed {
                    img.clear_bitmap(sub);
                } else {
                    img.mark_rendered(sub);
                }
            } else if failed {
                img.clear_bitmap(sub);
            } else {
                img.mark_rendered(sub);
            }
            args.node.trimap.notify(img);
        }
    }

    /// Under render-full-then-downscale, fold a freshly rendered full-scale
    /// rect down into the caller-facing image.
    fn downscale_tile(&self, args: &DispatchArgs<'_>, sub: PixelRect) {
        if !args.render_full {
            return;
        }
        for state in args.planes.planes.values() {
            if let (Some(full), Some(down)) = (&state.fullscale, &state.downscale)
                && !Arc::ptr_eq(full, down)
            {
                let canonical = sub.to_canonical(MipLevel::FULL, args.par);
                let dst = canonical_to_pixel_enclosing(canonical, args.req_mip, args.par);
                full.downscale_mip_map(down, dst);
            }
        }
    }
}

fn fold_outcomes(outcomes: Vec<ResolveResult<bool>>) -> ResolveResult<bool> {
    let mut took = false;
    let mut saw_abort = false;
    let mut saw_oom = false;
    for outcome in outcomes {
        match outcome {
            Ok(t) => took |= t,
            Err(ResolveError::Aborted) => saw_abort = true,
            Err(ResolveError::OutOfGpuMemory) => saw_oom = true,
            Err(e) => return Err(e),
        }
    }
    if saw_oom {
        return Err(ResolveError::OutOfGpuMemory);
    }
    if saw_abort {
        return Err(ResolveError::Aborted);
    }
    Ok(took)
}

fn best_plane_match<'a>(planes: &'a PlaneMap, desc: &PlaneDesc) -> Option<&'a Arc<Image>> {
    planes.get(desc).or_else(|| {
        desc.is_color_plane()
            .then(|| {
                planes
                    .iter()
                    .find(|(p, _)| p.is_color_plane())
                    .map(|(_, img)| img)
            })
            .flatten()
    })
}
