//! Tilework is the render-request resolver core of a node-graph image
//! compositor.
//!
//! Given a request to produce a region of an output image at a time, view,
//! mip level and set of component planes, it computes (or retrieves from
//! cache) the pixels, descending recursively through a DAG of effect nodes.
//!
//! # Resolution overview
//!
//! 1. **Negotiate**: requested planes split into locally-produced and
//!    fetched-upstream ([`negotiate_planes`])
//! 2. **Collapse**: identity effects redirect the whole call upstream
//!    ([`resolve_identity`])
//! 3. **Decompose**: cached pixels are subtracted and the remainder split
//!    into tiles, with per-tile identity chasing
//! 4. **Render**: tiles run through the [`Effect`] kernel under its declared
//!    thread safety, coordinated per pixel by a three-state bitmap
//! 5. **Return**: planes convert to the requested depth, components and
//!    storage on egress
//!
//! The key design constraints:
//!
//! - **No unsafe**: `unsafe` is forbidden in this crate.
//! - **At most one renderer per pixel**: concurrent requests on a shared
//!   image coordinate through the trimap; waiters block, never re-render.
//! - **Synchronous recursion**: upstream renders happen on the calling
//!   thread, so the abort token and per-thread frame contexts stay coherent.
//! - **No ambient globals**: cache, settings and worker pool ride on the
//!   [`Resolver`]; per-frame state rides on a bound [`FrameContext`].
#![forbid(unsafe_code)]

mod cache;
mod foundation;
mod graph;
mod image;
mod render;

pub use cache::key::ImageKey;
pub use cache::store::ImageCache;
pub use foundation::core::{
    Affine, FrameTime, MipLevel, NodeId, PixelRect, Point, Rect, Vec2, ViewIndex,
    canonical_to_pixel_enclosing, rect_is_null,
};
pub use foundation::error::{ResolveError, ResolveResult};
pub use foundation::math::StableHasher;
pub use graph::effect::{
    ComponentsNeeded, Effect, GlAttach, GlContext, GlRenderData, GlSupport, IdentityVerdict,
    PassThroughSource, RegionOfDefinition, RenderTileArgs, ScaleSupport, SequenceArgs,
    ThreadSafety, ViewInvariance,
};
pub use graph::node::{Node, PluginHandle};
pub use image::bitmap::Bitmap;
pub use image::convert::{ConvertPolicy, convert_plane_if_needed};
pub use image::image::{Image, ImageParams};
pub use image::plane::{BitDepth, FieldingOrder, ImagePremult, PlaneDesc, StorageMode};
pub use render::context::{
    AbortToken, FrameContext, FrameContextBinding, RenderStats, RenderStatsSnapshot,
    TreeRenderOpts, TreeRenderScope, current_context, install_snapshot, snapshot_contexts,
};
pub use render::dispatch::{IdentityRedirect, PlaneState, PlanesToRender, RectToRender};
pub use render::identity::{ChainTerminus, ResolvedIdentity, chase_identity_chain, resolve_identity};
pub use render::planes::{NegotiatedPlanes, negotiate_planes};
pub use render::request::{FrameViewRequest, RenderRequest, RequestPass};
pub use render::resolver::{PlaneMap, RenderSettings, Resolver};
pub use render::trimap::{RenderMark, TrimapCoordinator};
