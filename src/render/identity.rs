use std::sync::Arc;

use crate::foundation::core::{FrameTime, MipLevel, PixelRect, ViewIndex};
use crate::foundation::error::{ResolveError, ResolveResult};
use crate::graph::effect::{IdentityVerdict, ViewInvariance};
use crate::graph::node::Node;

/// Resolved identity status of one node over one region.
#[derive(Clone)]
pub enum ResolvedIdentity {
    NotIdentity,
    /// No input backs the redirection: the region is transparent black.
    TransparentBlack,
    /// Identity of this node itself at a substituted time and/or view.
    SelfRedirect { time: FrameTime, view: ViewIndex },
    /// Identity of input `input`.
    Redirect {
        input: usize,
        target: Arc<Node>,
        time: FrameTime,
        view: ViewIndex,
    },
}

/// Query the identity hook and normalise its sentinels.
///
/// The self-redirection answer is accepted only when it actually changes the
/// (time, view) pair; anything else would recurse forever and is treated as
/// non-identity. All-views-invariant effects short-circuit any off-main view
/// to view 0 without consulting the hook.
pub fn resolve_identity(
    node: &Arc<Node>,
    time: FrameTime,
    mip: MipLevel,
    region: PixelRect,
    view: ViewIndex,
) -> ResolveResult<ResolvedIdentity> {
    let invariance = node.effect().view_invariance();
    if view != ViewIndex::MAIN && invariance == ViewInvariance::AllViewsInvariant {
        return Ok(ResolvedIdentity::SelfRedirect {
            time,
            view: ViewIndex::MAIN,
        });
    }

    let verdict = node
        .effect()
        .is_identity(time, mip, region, view)
        .map_err(|e| ResolveError::effect(format!("is_identity: {e}")))?;

    Ok(match verdict {
        IdentityVerdict::NotIdentity => ResolvedIdentity::NotIdentity,
        IdentityVerdict::Transparent => ResolvedIdentity::TransparentBlack,
        IdentityVerdict::SelfAtTimeView { time: t, view: v } => {
            let v = if invariance == ViewInvariance::AllViewsInvariant {
                ViewIndex::MAIN
            } else {
                v
            };
            if t != time || v != view {
                ResolvedIdentity::SelfRedirect { time: t, view: v }
            } else {
                ResolvedIdentity::NotIdentity
            }
        }
        IdentityVerdict::PassThrough {
            input,
            time: t,
            view: v,
        } => match node.input(input) {
            Some(target) => ResolvedIdentity::Redirect {
                input,
                target,
                time: t,
                view: v,
            },
            None => ResolvedIdentity::TransparentBlack,
        },
    })
}

/// Where an identity chain ends for one tile.
pub enum ChainTerminus {
    /// Render this node at the substituted time/view.
    Node {
        node: Arc<Node>,
        time: FrameTime,
        view: ViewIndex,
    },
    /// The chain fell off the graph: transparent black.
    Transparent,
}

/// Follow an identity chain upstream from `start` until a node that actually
/// renders. Stops on: a non-identity node, a self-redirection, a cycle, or a
/// missing upstream input (transparent).
pub fn chase_identity_chain(
    start: &Arc<Node>,
    time: FrameTime,
    mip: MipLevel,
    region: PixelRect,
    view: ViewIndex,
) -> ResolveResult<ChainTerminus> {
    let mut node = start.clone();
    let mut time = time;
    let mut view = view;
    loop {
        match resolve_identity(&node, time, mip, region, view)? {
            ResolvedIdentity::NotIdentity | ResolvedIdentity::SelfRedirect { .. } => {
                return Ok(ChainTerminus::Node { node, time, view });
            }
            ResolvedIdentity::TransparentBlack => return Ok(ChainTerminus::Transparent),
            ResolvedIdentity::Redirect {
                target,
                time: t,
                view: v,
                ..
            } => {
                if target.id() == node.id() {
                    // A node claiming to be identity of itself through an
                    // input is a cycle; stop here.
                    return Ok(ChainTerminus::Node { node, time, view });
                }
                node = target;
                time = t;
                view = v;
            }
        }
    }
}

#[cfg(test)]
#[path = "../../tests/unit/render/identity.rs"]
mod tests;
