use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use kurbo::{Affine, Rect};
use tracing::{debug, warn};

use crate::cache::key::ImageKey;
use crate::cache::store::ImageCache;
use crate::foundation::core::{
    FrameTime, MipLevel, PixelRect, ViewIndex, canonical_to_pixel_enclosing, rect_is_null,
};
use crate::foundation::error::{ResolveError, ResolveResult};
use crate::graph::effect::{GlSupport, RegionOfDefinition, ScaleSupport};
use crate::graph::node::Node;
use crate::image::convert::{ConvertPolicy, convert_plane_if_needed};
use crate::image::image::{Image, ImageParams};
use crate::image::plane::{ImagePremult, PlaneDesc, StorageMode};
use crate::render::context::{FrameContext, FrameContextBinding, current_context};
use crate::render::dispatch::{
    DispatchArgs, DispatchOutput, IdentityRedirect, PlaneState, PlanesToRender, RectToRender,
};
use crate::render::identity::{ChainTerminus, ResolvedIdentity, chase_identity_chain, resolve_identity};
use crate::render::planes::{NegotiatedPlanes, negotiate_planes};
use crate::render::request::RenderRequest;

/// Output of one resolution: one image per requested plane.
pub type PlaneMap = BTreeMap<PlaneDesc, Arc<Image>>;

/// Host-level knobs of the resolver.
#[derive(Clone, Debug)]
pub struct RenderSettings {
    pub cache_max_bytes: usize,
    /// Fraction of the byte budget at which the cache reports almost-full.
    pub cache_almost_full_ratio: f64,
    /// Worker threads for tile fan-out. `None` uses the rayon default.
    pub threads: Option<usize>,
    pub transform_concatenation: bool,
    /// Tile side used by the per-tile identity optimisation.
    pub identity_tile_size: i64,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            cache_max_bytes: 512 * 1024 * 1024,
            cache_almost_full_ratio: 0.85,
            threads: None,
            transform_concatenation: true,
            identity_tile_size: 128,
        }
    }
}

/// The render-request resolver.
///
/// Process singletons (cache, settings, worker pool) are bound here once and
/// travel with the resolver instead of being reached ambiently; everything
/// else a resolution needs rides in the per-thread frame context.
pub struct Resolver {
    cache: Arc<ImageCache>,
    settings: RenderSettings,
    pub(crate) pool: rayon::ThreadPool,
    pub(crate) in_flight: AtomicUsize,
}

impl Resolver {
    pub fn new(settings: RenderSettings) -> ResolveResult<Self> {
        let cache = ImageCache::new(settings.cache_max_bytes, settings.cache_almost_full_ratio);
        Self::with_cache(settings, cache)
    }

    pub fn with_cache(settings: RenderSettings, cache: Arc<ImageCache>) -> ResolveResult<Self> {
        if let Some(n) = settings.threads
            && n == 0
        {
            return Err(ResolveError::validation("settings 'threads' must be >= 1 when set"));
        }
        let mut builder = rayon::ThreadPoolBuilder::new();
        if let Some(n) = settings.threads {
            builder = builder.num_threads(n);
        }
        let pool = builder
            .build()
            .map_err(|e| ResolveError::validation(format!("failed to build worker pool: {e}")))?;
        Ok(Self {
            cache,
            settings,
            pool,
            in_flight: AtomicUsize::new(0),
        })
    }

    pub fn cache(&self) -> &Arc<ImageCache> {
        &self.cache
    }

    pub fn settings(&self) -> &RenderSettings {
        &self.settings
    }

    /// Resolve one render-region-of-interest request.
    ///
    /// `OutOfGpuMemory` never escapes: the request is retried with GPU
    /// rendering disabled, or fails when the effect is GPU-only.
    #[tracing::instrument(level = "debug", skip_all, fields(node = %node.label(), time = req.time.0, view = req.view.0))]
    pub fn render_roi(&self, node: &Arc<Node>, req: &RenderRequest) -> ResolveResult<PlaneMap> {
        match self.render_roi_guarded(node, req) {
            Err(ResolveError::OutOfGpuMemory) => {
                if node.effect().gl_support() == GlSupport::Needed {
                    return Err(ResolveError::effect(format!(
                        "node '{}' ran out of video memory and renders on GPU only",
                        node.label()
                    )));
                }
                debug!("out of video memory, retrying without GPU");
                let mut retry = req.clone();
                retry.allow_gpu = false;
                match self.render_roi_guarded(node, &retry) {
                    Err(ResolveError::OutOfGpuMemory) => Err(ResolveError::effect(
                        "out of video memory on a CPU retry".to_string(),
                    )),
                    other => other,
                }
            }
            other => other,
        }
    }

    fn render_roi_guarded(&self, node: &Arc<Node>, req: &RenderRequest) -> ResolveResult<PlaneMap> {
        // Phase 1: early-outs and render-clone forwarding.
        if req.planes.is_empty() {
            debug!(node = node.label(), "early out: no planes requested");
            return Ok(PlaneMap::new());
        }
        if req.roi.is_empty() {
            debug!(node = node.label(), "early out: empty region of interest");
            return Ok(PlaneMap::new());
        }
        if let Some(primary) = node.primary() {
            return self.render_roi_guarded(&primary, req);
        }

        // Phase 2: frame context, synthesising one if the caller skipped the
        // bind step (contract violation, but renderable).
        let mut _synth_binding: Option<FrameContextBinding> = None;
        let ctx = match current_context(node.id()) {
            Some(ctx) => ctx,
            None => {
                warn!(
                    node = node.label(),
                    "no frame context bound for this render; synthesising one"
                );
                let ctx = FrameContext::synthesized(node, crate::render::context::AbortToken::abortable());
                _synth_binding = Some(FrameContextBinding::bind(node.id(), ctx.clone()));
                ctx
            }
        };
        if ctx.abort.is_aborted() {
            return Err(ResolveError::Aborted);
        }

        let effect = node.effect().clone();
        let node_hash = ctx.node_hash;
        let par = effect.pixel_aspect();
        let tiles_supported = ctx.tiles_supported;
        let pre = ctx
            .request_pass
            .as_ref()
            .and_then(|p| p.get(node.id(), req.time, req.view));

        // Phase 3: render-scale policy.
        let mut supports_rs = effect.supports_render_scale();
        let mut render_full = supports_rs == ScaleSupport::No && !req.mip.is_full();
        let mut mapped_mip = if render_full { MipLevel::FULL } else { req.mip };

        // Phase 4: region of definition.
        let rod_info: Option<RegionOfDefinition> = if let Some(r) = req.precomputed_rod {
            Some(RegionOfDefinition {
                rect: r,
                project_format: false,
            })
        } else if let Some(p) = &pre {
            p.rod
        } else {
            effect
                .region_of_definition(req.time, req.view, mapped_mip)
                .map_err(|e| ResolveError::effect(format!("region_of_definition: {e}")))?
        };
        let Some(rod_info) = rod_info else {
            debug!(node = node.label(), "early out: null region of definition");
            return Ok(PlaneMap::new());
        };
        let rod = rod_info.rect;
        if rect_is_null(rod) {
            return Ok(PlaneMap::new());
        }
        if supports_rs == ScaleSupport::Maybe && !req.mip.is_full() {
            // The RoD query may have settled the maybe.
            supports_rs = effect.supports_render_scale();
            render_full = supports_rs == ScaleSupport::No;
            mapped_mip = if render_full { MipLevel::FULL } else { req.mip };
        }

        // Phase 5: working RoI in render-mapped pixel space.
        let downscaled_bounds = canonical_to_pixel_enclosing(rod, req.mip, par);
        let upscaled_bounds = canonical_to_pixel_enclosing(rod, MipLevel::FULL, par);
        let mapped_bounds = if render_full { upscaled_bounds } else { downscaled_bounds };
        let mut roi = if render_full {
            canonical_to_pixel_enclosing(req.roi.to_canonical(req.mip, par), MipLevel::FULL, par)
        } else {
            req.roi
        };
        if tiles_supported {
            roi = match roi.intersect(mapped_bounds) {
                Some(r) => r,
                None => return Ok(PlaneMap::new()),
            };
        } else {
            roi = mapped_bounds;
        }
        let mut alloc_down = downscaled_bounds;
        let mut alloc_up = upscaled_bounds;
        if tiles_supported {
            alloc_up = match alloc_up.intersect(roi) {
                Some(r) => r,
                None => return Ok(PlaneMap::new()),
            };
            if let Some(r) = alloc_down.intersect(if render_full {
                canonical_to_pixel_enclosing(roi.to_canonical(MipLevel::FULL, par), req.mip, par)
            } else {
                roi
            }) {
                alloc_down = r;
            }
        }

        // Phase 6: plane negotiation and upstream pass-through planes.
        let neg = negotiate_planes(node, &req.planes, req.time, req.view)?;
        let mut output = PlaneMap::new();
        for (plane, src_node) in &neg.fetch_upstream {
            let mut up = req.clone();
            up.planes = vec![plane.clone()];
            up.precomputed_rod = None;
            up.caller = Some(node.clone());
            up.caller_time = req.time;
            let rendered = self.render_roi(src_node, &up)?;
            match rendered.into_values().next() {
                Some(img) => {
                    output.insert(plane.clone(), img);
                }
                None => return Ok(output),
            }
        }
        if neg.produce_here.is_empty() {
            return Ok(output);
        }

        // Phase 7: whole-RoI identity.
        let pixel_rod_at_req = canonical_to_pixel_enclosing(rod, req.mip, par);
        let identity = if let Some(p) = &pre {
            p.identity.clone()
        } else {
            resolve_identity(node, req.time, mapped_mip, pixel_rod_at_req, req.view)?
        };
        match identity {
            ResolvedIdentity::NotIdentity => {}
            ResolvedIdentity::TransparentBlack => return Ok(output),
            ResolvedIdentity::SelfRedirect { time, view } => {
                let mut redirected = req.clone();
                redirected.time = time;
                redirected.view = view;
                redirected.precomputed_rod = None;
                let planes = self.render_roi(node, &redirected)?;
                output.extend(planes);
                return Ok(output);
            }
            ResolvedIdentity::Redirect {
                input,
                target,
                time,
                view,
            } => {
                let mut redirected = req.clone();
                redirected.time = time;
                redirected.view = view;
                // The identity input's RoD may differ; never pin ours on it.
                redirected.precomputed_rod = None;
                let selector = effect.has_channel_selector(input);
                if selector
                    && let Some(comps) = neg.needed_per_input.get(&input)
                {
                    redirected.planes = comps
                        .iter()
                        .filter(|p| p.channels() > 0)
                        .cloned()
                        .collect();
                } else {
                    redirected.planes = neg.produce_here.clone();
                }
                let planes = self.render_roi(&target, &redirected)?;
                if selector {
                    // Potentially different components came back; convert to
                    // what the caller asked for.
                    let policy = ConvertPolicy {
                        alpha0_for_rgb_to_rgba: req
                            .caller
                            .as_ref()
                            .is_some_and(|c| c.effect().uses_alpha0_for_rgb_to_rgba()),
                        output_premult: output_premult_for(&neg, &effect),
                    };
                    for (plane, img) in planes {
                        let wanted = requested_desc_for(&plane, &req.planes);
                        let converted =
                            convert_plane_if_needed(&img, req.roi, &wanted, req.bit_depth, policy)?;
                        output.insert(plane, converted);
                    }
                } else {
                    output.extend(planes);
                }
                return Ok(output);
            }
        }

        // Partially view-variant effects collapse the remaining planes onto
        // the main view.
        if req.view != ViewIndex::MAIN
            && effect.view_invariance()
                == crate::graph::effect::ViewInvariance::OnlyPassThroughPlanesVariant
        {
            let mut redirected = req.clone();
            redirected.view = ViewIndex::MAIN;
            redirected.precomputed_rod = None;
            let planes = self.render_roi(node, &redirected)?;
            output.extend(planes);
            return Ok(output);
        }

        // Phase 8: transform concatenation.
        let input_transforms: BTreeMap<usize, Affine> = if let Some(p) = &pre {
            p.transforms.clone()
        } else if self.settings.transform_concatenation {
            collect_input_transforms(node, req.time, req.view)
        } else {
            BTreeMap::new()
        };

        // Phase 9: storage selection.
        let mut storage = StorageMode::Ram;
        if effect.is_disk_cache() {
            storage = StorageMode::Disk;
        } else if let Some(gl) = &ctx.gl {
            let support = effect.gl_support();
            if support == GlSupport::Needed || (support == GlSupport::Yes && req.allow_gpu) {
                storage = StorageMode::GlTexture;
                if support == GlSupport::Yes {
                    let too_large = roi.width() >= gl.max_texture_size
                        || roi.height() >= gl.max_texture_size;
                    if node.consumer_count() > 1 || req.caller_time != req.time || too_large {
                        storage = StorageMode::Ram;
                    }
                }
            }
        }
        let use_gl = storage == StorageMode::GlTexture;
        if use_gl && render_full {
            // GL renders always support render scale.
            render_full = false;
            mapped_mip = req.mip;
            roi = if tiles_supported {
                match req.roi.intersect(downscaled_bounds) {
                    Some(r) => r,
                    None => return Ok(output),
                }
            } else {
                downscaled_bounds
            };
            alloc_down = downscaled_bounds;
            if tiles_supported && let Some(r) = alloc_down.intersect(roi) {
                alloc_down = r;
            }
        }
        let create_in_cache = !use_gl;
        let scale_one_upstream = render_full && !effect.supports_multi_resolution();

        // Phase 10: cache lookup per plane.
        let frame_varying = node.frame_varying_recursive();
        let key = ImageKey {
            node: node.id(),
            node_hash,
            frame_varying,
            time: req.time,
            view: req.view,
            draft: ctx.draft,
            full_scale: render_full && !scale_one_upstream,
        };
        let output_premult = output_premult_for(&neg, &effect);
        let mut planes_to_render = PlanesToRender::new(use_gl, output_premult);
        let mut completed: Vec<(PlaneDesc, Arc<Image>)> = Vec::new();
        let do_lookup = create_in_cache && !(effect.is_writer() && ctx.sequential);
        let mut missing_plane = false;
        for plane in &neg.produce_here {
            let mut found: Option<Arc<Image>> = None;
            if do_lookup {
                // Draft requests look up the non-draft key first so a
                // high-quality result satisfies them.
                let mut keys = vec![key.clone()];
                if ctx.draft {
                    keys.insert(0, key.as_non_draft());
                }
                for k in &keys {
                    if let Some(img) = self.cache.lookup(k, mapped_mip, storage) {
                        found = Some(img);
                        break;
                    }
                }
                if let Some(stats) = &ctx.stats {
                    let counter = if found.is_some() {
                        &stats.cache_hits
                    } else {
                        &stats.cache_misses
                    };
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            }
            if req.bypass_cache && let Some(img) = found.take() {
                self.cache.remove_if_matches(&img);
            }
            if let Some(img) = &found {
                if missing_plane {
                    if img.rest_to_render(roi).is_empty() {
                        completed.push((plane.clone(), img.clone()));
                        continue;
                    }
                    self.cache.remove_if_matches(img);
                    found = None;
                }
            } else if !missing_plane {
                missing_plane = true;
                // One plane misses: siblings either are complete and get
                // returned, or get evicted so all planes advance together.
                let planes_so_far = std::mem::take(&mut planes_to_render.planes);
                for (p, st) in planes_so_far {
                    match &st.fullscale {
                        Some(img) if img.rest_to_render(roi).is_empty() => {
                            completed.push((p, img.clone()));
                        }
                        Some(img) => {
                            self.cache.remove_if_matches(img);
                            planes_to_render.planes.insert(p, PlaneState::default());
                        }
                        None => {
                            planes_to_render.planes.insert(p, st);
                        }
                    }
                }
            }
            let state = PlaneState {
                fullscale: found.clone(),
                downscale: found,
                ..PlaneState::default()
            };
            planes_to_render.planes.insert(plane.clone(), state);
        }

        if planes_to_render.planes.is_empty() {
            // Everything was cached and fully covered.
            return self.egress(req, completed, &mut planes_to_render, EgressArgs {
                key: &key,
                alloc_down,
                render_full,
                has_something: false,
                par,
            }, output);
        }

        let frames_needed = if let Some(p) = &pre {
            p.frames_needed.clone()
        } else {
            effect
                .frames_needed(req.time, req.view, mapped_mip)
                .map_err(|e| ResolveError::effect(format!("frames_needed: {e}")))?
        };

        // Phase 11: rectangles left to render.
        let trimap_enabled = !ctx.abort.is_abortable();
        let cache_pressure = self.cache.is_almost_full();
        let mut redo_lookup = false;
        let mut being_rendered_elsewhere = false;
        let mut rects_left: Vec<PixelRect> = match planes_to_render.first_cached() {
            None => vec![roi],
            Some(img) => {
                let mut rects = if trimap_enabled {
                    let (rects, pending) = img.rest_unrendered(roi);
                    being_rendered_elsewhere = pending;
                    rects
                } else {
                    img.rest_to_render(roi)
                };
                if !rects.is_empty() && (use_gl || cache_pressure) {
                    // Holding a partial hit under pressure pins images at
                    // every level of the tree; release and render the full
                    // RoI instead.
                    rects = vec![roi];
                    being_rendered_elsewhere = false;
                    for st in planes_to_render.planes.values_mut() {
                        st.original_cached_ptr =
                            st.fullscale.as_ref().map(|i| Arc::as_ptr(i) as usize);
                        st.fullscale = None;
                        st.downscale = None;
                    }
                    if cache_pressure {
                        redo_lookup = true;
                    }
                } else if !tiles_supported && !rects.is_empty() {
                    rects = vec![roi];
                }
                rects
            }
        };

        // Phase 12: per-tile identity optimisation.
        let optim = self.identity_optim_region(node, req, mapped_mip, par, &rects_left, tiles_supported)?;
        let mut rects =
            self.build_rects(node, req, mapped_mip, &rects_left, optim)?;

        // Phase 13: recursive input renders.
        for rect in &mut rects {
            if rect.identity.is_none() {
                rect.inputs = self.render_rect_inputs(
                    node,
                    &neg,
                    &frames_needed,
                    rect.rect,
                    req,
                    mapped_mip,
                    scale_one_upstream,
                    par,
                )?;
            }
        }

        // Phase 14: re-lookup after input renders when pressure cleared the
        // pointers. A different object means another writer moved things;
        // discard and re-render.
        if redo_lookup {
            let mut all_match = true;
            for st in planes_to_render.planes.values_mut() {
                let mut keys = vec![key.clone()];
                if ctx.draft {
                    keys.insert(0, key.as_non_draft());
                }
                let mut found = None;
                for k in &keys {
                    if let Some(img) = self.cache.lookup(k, mapped_mip, storage) {
                        found = Some(img);
                        break;
                    }
                }
                match (&found, st.original_cached_ptr) {
                    (Some(img), Some(ptr)) if Arc::as_ptr(img) as usize == ptr => {
                        st.fullscale = found.clone();
                        st.downscale = found;
                    }
                    _ => {
                        all_match = false;
                        break;
                    }
                }
            }
            if !all_match {
                for st in planes_to_render.planes.values_mut() {
                    st.fullscale = None;
                    st.downscale = None;
                }
                rects_left = vec![roi];
                let optim = self.identity_optim_region(node, req, mapped_mip, par, &rects_left, tiles_supported)?;
                rects = self.build_rects(node, req, mapped_mip, &rects_left, optim)?;
                for rect in &mut rects {
                    if rect.identity.is_none() {
                        rect.inputs = self.render_rect_inputs(
                            node,
                            &neg,
                            &frames_needed,
                            rect.rect,
                            req,
                            mapped_mip,
                            scale_one_upstream,
                            par,
                        )?;
                    }
                }
            }
        }
        planes_to_render.rects = rects;
        let has_something = !planes_to_render.rects.is_empty();

        // Phase 15: allocate or grow plane images.
        if has_something {
            for (plane, st) in planes_to_render.planes.iter_mut() {
                match &st.fullscale {
                    None => {
                        let (full, down) = self.allocate_plane(
                            &key,
                            rod,
                            plane,
                            &effect,
                            par,
                            req.mip,
                            mapped_mip,
                            alloc_down,
                            alloc_up,
                            render_full,
                            storage,
                            create_in_cache,
                            output_premult,
                        );
                        st.fullscale = Some(full);
                        st.downscale = Some(down);
                        st.allocated_on_the_fly = true;
                    }
                    Some(img) => {
                        let img = img.clone();
                        img.merge_rod(rod);
                        let needed = if render_full { alloc_up } else { alloc_down };
                        if req.called_from_get_image {
                            if let Some(grown) = img.copy_and_resize_if_needed(needed, false) {
                                st.swap = Some(img.clone());
                                st.fullscale = Some(grown.clone());
                                st.allocated_on_the_fly = true;
                                if !render_full {
                                    st.downscale = Some(grown);
                                }
                            }
                        } else {
                            img.ensure_bounds(needed, false);
                        }
                        if render_full {
                            let full = st.fullscale.clone().expect("fullscale image");
                            let needs_separate = st
                                .downscale
                                .as_ref()
                                .is_none_or(|d| Arc::ptr_eq(d, &full));
                            if full.mip_level().is_full() && needs_separate {
                                let down = Image::new(ImageParams {
                                    desc: plane.clone(),
                                    rod,
                                    bounds: alloc_down,
                                    mip: req.mip,
                                    par,
                                    depth: effect.preferred_depth(),
                                    premult: output_premult,
                                    fielding: effect.fielding(),
                                    storage: StorageMode::Ram,
                                });
                                full.downscale_mip_map(&down, alloc_down);
                                st.downscale = Some(down);
                            }
                        }
                    }
                }
            }
        }

        // Trimap registration: renderers become visible to concurrent
        // requests before any pixel work starts.
        let mut marks = Vec::new();
        if trimap_enabled && (has_something || being_rendered_elsewhere) {
            for st in planes_to_render.planes.values() {
                if let Some(img) = st.render_mapped(render_full) {
                    marks.push(node.trimap.mark_being_rendered(&img));
                }
            }
        }

        // Phases 16/17: dispatch, then trimap publication or rollback.
        let dispatch_result: ResolveResult<DispatchOutput> = if has_something {
            self.dispatch_tiles(&DispatchArgs {
                node,
                ctx: &ctx,
                planes: &planes_to_render,
                time: req.time,
                view: req.view,
                req_mip: req.mip,
                mapped_mip,
                render_full,
                par,
                process_channels: neg.process_channels,
                input_transforms: &input_transforms,
                trimap_enabled,
                requested_planes: &neg.produce_here,
                bit_depth: req.bit_depth,
                bypass_cache: req.bypass_cache,
            })
        } else {
            Ok(DispatchOutput::default())
        };

        let rollback = |err: ResolveError| -> ResolveError {
            for st in planes_to_render.planes.values() {
                if let Some(img) = st.render_mapped(render_full) {
                    img.publish(roi, true);
                    // Evict only what this resolution placed; a failing
                    // request never corrupts other renders' cache entries.
                    if st.allocated_on_the_fly {
                        self.cache.remove_if_matches(&img);
                    }
                    node.trimap.notify(&img);
                }
            }
            err
        };
        let out = match dispatch_result {
            Err(e) => return Err(rollback(e)),
            Ok(out) => out,
        };
        if ctx.abort.is_aborted() {
            return Err(rollback(ResolveError::Aborted));
        }
        if (out.took_image_lock || being_rendered_elsewhere) && trimap_enabled {
            for st in planes_to_render.planes.values() {
                if let Some(img) = st.render_mapped(render_full)
                    && !node.trimap.wait_for_elsewhere(&img, roi, &ctx.abort)
                {
                    return Err(ResolveError::Aborted);
                }
            }
        }
        drop(marks);

        // Phases 18/19: egress conversion and return.
        self.egress(req, completed, &mut planes_to_render, EgressArgs {
            key: &key,
            alloc_down,
            render_full,
            has_something,
            par,
        }, output)
    }

    /// Canonical intersection of input RoDs, when the per-tile identity
    /// optimisation applies (mask input or differing input RoDs).
    fn identity_optim_region(
        &self,
        node: &Arc<Node>,
        req: &RenderRequest,
        mapped_mip: MipLevel,
        par: f64,
        rects_left: &[PixelRect],
        tiles_supported: bool,
    ) -> ResolveResult<Option<PixelRect>> {
        if !tiles_supported || rects_left.is_empty() || node.input_count() == 0 {
            return Ok(None);
        }
        let effect = node.effect();
        let mut intersection: Option<Rect> = None;
        let mut first_rod: Option<Rect> = None;
        let mut has_mask = false;
        let mut differing = false;
        for slot in 0..node.input_count() {
            let Some(input) = node.input(slot) else {
                continue;
            };
            if effect.input_is_mask(slot) {
                has_mask = true;
            }
            let rod = input
                .effect()
                .region_of_definition(req.time, req.view, mapped_mip)
                .map_err(|e| ResolveError::effect(format!("input region_of_definition: {e}")))?;
            let Some(rod) = rod else {
                continue;
            };
            match (&mut intersection, first_rod) {
                (None, _) => {
                    intersection = Some(rod.rect);
                    first_rod = Some(rod.rect);
                }
                (Some(acc), Some(first)) => {
                    if rod.rect != first {
                        differing = true;
                    }
                    *acc = acc.intersect(rod.rect);
                }
                _ => {}
            }
        }
        match intersection {
            Some(rect) if has_mask || differing => {
                Ok(Some(canonical_to_pixel_enclosing(rect, mapped_mip, par)))
            }
            _ => Ok(None),
        }
    }

    /// Turn the remaining rects into render units, splitting into tiles and
    /// chasing identity chains outside the input-RoD intersection.
    fn build_rects(
        &self,
        node: &Arc<Node>,
        req: &RenderRequest,
        mapped_mip: MipLevel,
        rects_left: &[PixelRect],
        optim_region: Option<PixelRect>,
    ) -> ResolveResult<Vec<RectToRender>> {
        let mut out = Vec::new();
        let Some(inputs_intersection) = optim_region else {
            for r in rects_left {
                if !r.is_empty() {
                    out.push(RectToRender {
                        rect: *r,
                        identity: None,
                        inputs: BTreeMap::new(),
                    });
                }
            }
            return Ok(out);
        };

        for r in rects_left {
            let mut bbox: Option<PixelRect> = None;
            for tile in r.split_tiles(self.settings.identity_tile_size) {
                let mut redirect: Option<IdentityRedirect> = None;
                if tile.intersect(inputs_intersection).is_none() {
                    match resolve_identity(node, req.time, mapped_mip, tile, req.view)? {
                        ResolvedIdentity::NotIdentity => {}
                        ResolvedIdentity::TransparentBlack => {
                            redirect = Some(IdentityRedirect {
                                target: None,
                                time: req.time,
                                view: req.view,
                            });
                        }
                        ResolvedIdentity::SelfRedirect { time, view } => {
                            redirect = Some(IdentityRedirect {
                                target: Some(node.clone()),
                                time,
                                view,
                            });
                        }
                        ResolvedIdentity::Redirect {
                            target, time, view, ..
                        } => {
                            redirect = Some(
                                match chase_identity_chain(&target, time, mapped_mip, tile, view)? {
                                    ChainTerminus::Node { node, time, view } => IdentityRedirect {
                                        target: Some(node),
                                        time,
                                        view,
                                    },
                                    ChainTerminus::Transparent => IdentityRedirect {
                                        target: None,
                                        time,
                                        view,
                                    },
                                },
                            );
                        }
                    }
                }
                match redirect {
                    Some(redirect) => out.push(RectToRender {
                        rect: tile,
                        identity: Some(redirect),
                        inputs: BTreeMap::new(),
                    }),
                    None => bbox = Some(bbox.map_or(tile, |b| b.union(tile))),
                }
            }
            if let Some(b) = bbox {
                out.push(RectToRender {
                    rect: b,
                    identity: None,
                    inputs: BTreeMap::new(),
                });
            }
        }
        Ok(out)
    }

    /// Render every upstream image one rect needs, mapping the rect's pixel
    /// footprint back to each input's canonical space.
    #[allow(clippy::too_many_arguments)]
    fn render_rect_inputs(
        &self,
        node: &Arc<Node>,
        neg: &NegotiatedPlanes,
        frames_needed: &BTreeMap<usize, Vec<(FrameTime, ViewIndex)>>,
        rect: PixelRect,
        req: &RenderRequest,
        mapped_mip: MipLevel,
        scale_one_upstream: bool,
        par: f64,
    ) -> ResolveResult<BTreeMap<usize, PlaneMap>> {
        let canonical = rect.to_canonical(mapped_mip, par);
        let input_mip = if scale_one_upstream { MipLevel::FULL } else { req.mip };
        let mut out = BTreeMap::new();
        for (slot, frames) in frames_needed {
            if node.input(*slot).is_none() {
                continue;
            }
            let Some((effective, _)) = concatenated_input(
                node,
                *slot,
                req.time,
                req.view,
                self.settings.transform_concatenation,
            ) else {
                continue;
            };
            let planes = match neg.needed_per_input.get(slot) {
                Some(planes) if !planes.is_empty() => planes.clone(),
                Some(_) => continue,
                None => vec![PlaneDesc::rgba()],
            };
            let roi = canonical_to_pixel_enclosing(
                canonical,
                input_mip,
                effective.effect().pixel_aspect(),
            );
            let mut plane_map = PlaneMap::new();
            for (time, view) in frames {
                let mut sub = RenderRequest::new(*time, roi, planes.clone());
                sub.view = *view;
                sub.mip = input_mip;
                sub.bit_depth = effective.effect().preferred_depth();
                sub.bypass_cache = req.bypass_cache;
                sub.allow_gpu = false;
                sub.caller = Some(node.clone());
                sub.caller_time = req.time;
                let rendered = self.render_roi(&effective, &sub)?;
                for (plane, img) in rendered {
                    plane_map.entry(plane).or_insert(img);
                }
                if let Some(ctx) = current_context(node.id())
                    && let Some(stats) = &ctx.stats
                {
                    stats.upstream_renders.fetch_add(1, Ordering::Relaxed);
                }
            }
            if !plane_map.is_empty() {
                out.insert(*slot, plane_map);
            }
        }
        Ok(out)
    }

    #[allow(clippy::too_many_arguments)]
    fn allocate_plane(
        &self,
        key: &ImageKey,
        rod: Rect,
        plane: &PlaneDesc,
        effect: &Arc<dyn crate::graph::effect::Effect>,
        par: f64,
        req_mip: MipLevel,
        mapped_mip: MipLevel,
        alloc_down: PixelRect,
        alloc_up: PixelRect,
        render_full: bool,
        storage: StorageMode,
        create_in_cache: bool,
        premult: ImagePremult,
    ) -> (Arc<Image>, Arc<Image>) {
        let full_bounds = if render_full { alloc_up } else { alloc_down };
        let full = Image::new(ImageParams {
            desc: plane.clone(),
            rod,
            bounds: full_bounds,
            mip: mapped_mip,
            par,
            depth: effect.preferred_depth(),
            premult,
            fielding: effect.fielding(),
            storage,
        });
        full.set_key(key.clone());
        if create_in_cache {
            self.cache.insert(key.clone(), full.clone());
        }
        let down = if render_full {
            Image::new(ImageParams {
                desc: plane.clone(),
                rod,
                bounds: alloc_down,
                mip: req_mip,
                par,
                depth: effect.preferred_depth(),
                premult,
                fielding: effect.fielding(),
                storage: StorageMode::Ram,
            })
        } else {
            full.clone()
        };
        (full, down)
    }

    fn egress(
        &self,
        req: &RenderRequest,
        completed: Vec<(PlaneDesc, Arc<Image>)>,
        planes_to_render: &mut PlanesToRender,
        args: EgressArgs<'_>,
        mut output: PlaneMap,
    ) -> ResolveResult<PlaneMap> {
        let policy = ConvertPolicy {
            alpha0_for_rgb_to_rgba: req
                .caller
                .as_ref()
                .is_some_and(|c| c.effect().uses_alpha0_for_rgb_to_rgba()),
            output_premult: planes_to_render.output_premult,
        };

        for (plane, img) in completed {
            let wanted = requested_desc_for(&plane, &req.planes);
            let mut converted =
                convert_plane_if_needed(&img, req.roi, &wanted, req.bit_depth, policy)?;
            if converted.storage() != req.return_storage {
                converted = converted.with_storage(req.return_storage);
            }
            output.insert(wanted, converted);
        }

        let planes = std::mem::take(&mut planes_to_render.planes);
        for (plane, st) in planes {
            // Work done in a resized copy swaps into the cache atomically.
            if let (Some(old), Some(new)) = (&st.swap, &st.fullscale) {
                self.cache.swap_or_insert(old, new.clone(), args.key.clone());
            }

            let mut returned = match (&st.downscale, &st.fullscale) {
                (Some(down), _) => down.clone(),
                (None, Some(full)) => full.clone(),
                (None, None) => continue,
            };
            if args.render_full
                && !args.has_something
                && let Some(full) = &st.fullscale
                && full.mip_level().is_full()
                && returned.mip_level() != req.mip
            {
                // Cache hit at full scale on behalf of a downscaled request:
                // the caller-facing image still has to be produced.
                let down = Image::new(ImageParams {
                    desc: plane.clone(),
                    rod: full.rod(),
                    bounds: args.alloc_down,
                    mip: req.mip,
                    par: args.par,
                    depth: full.bit_depth(),
                    premult: full.premult(),
                    fielding: full.fielding(),
                    storage: StorageMode::Ram,
                });
                full.downscale_mip_map(&down, args.alloc_down);
                returned = down;
            }

            let wanted = requested_desc_for(&plane, &req.planes);
            let mut converted =
                convert_plane_if_needed(&returned, req.roi, &wanted, req.bit_depth, policy)?;
            if converted.storage() != req.return_storage {
                converted = converted.with_storage(req.return_storage);
            }
            output.insert(wanted, converted);
        }

        Ok(output)
    }
}

struct EgressArgs<'a> {
    key: &'a ImageKey,
    alloc_down: PixelRect,
    render_full: bool,
    has_something: bool,
    par: f64,
}

/// Concatenable transforms per input slot of `node`.
pub(crate) fn collect_input_transforms(
    node: &Arc<Node>,
    time: FrameTime,
    view: ViewIndex,
) -> BTreeMap<usize, Affine> {
    let mut out = BTreeMap::new();
    for slot in 0..node.input_count() {
        if let Some((_, Some(xf))) = concatenated_input(node, slot, time, view, true) {
            out.insert(slot, xf);
        }
    }
    out
}

/// Walk through consecutive declared-transform effects upstream of `slot`,
/// composing their affines, so the chain renders its source image once and
/// this node samples through the folded transform.
fn concatenated_input(
    node: &Arc<Node>,
    slot: usize,
    time: FrameTime,
    view: ViewIndex,
    enabled: bool,
) -> Option<(Arc<Node>, Option<Affine>)> {
    let mut cur = node.input(slot)?;
    if !enabled {
        return Some((cur, None));
    }
    let mut composed: Option<Affine> = None;
    while let Some((src_slot, affine)) = cur.effect().transform_at(time, view) {
        composed = Some(match composed {
            Some(prev) => prev * affine,
            None => affine,
        });
        match cur.input(src_slot) {
            Some(next) => cur = next,
            None => break,
        }
    }
    Some((cur, composed))
}

fn output_premult_for(
    neg: &NegotiatedPlanes,
    effect: &Arc<dyn crate::graph::effect::Effect>,
) -> ImagePremult {
    match neg.output_planes.first() {
        Some(plane) if plane.is_color_plane() => effect.premult(),
        _ => ImagePremult::Opaque,
    }
}

/// Map a produced plane back to the requested descriptor it satisfies.
fn requested_desc_for(produced: &PlaneDesc, requested: &[PlaneDesc]) -> PlaneDesc {
    if produced.is_color_plane() {
        requested
            .iter()
            .find(|p| p.is_color_plane())
            .cloned()
            .unwrap_or_else(|| produced.clone())
    } else {
        produced.clone()
    }
}
