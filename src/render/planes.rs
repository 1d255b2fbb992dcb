use std::collections::BTreeMap;
use std::sync::Arc;

use crate::foundation::core::{FrameTime, ViewIndex};
use crate::foundation::error::{ResolveError, ResolveResult};
use crate::graph::effect::PassThroughSource;
use crate::graph::node::Node;
use crate::image::plane::PlaneDesc;

/// Result of reconciling the requested planes against what this node can do.
pub struct NegotiatedPlanes {
    /// Planes rendered locally, in this node's own component layout (the
    /// colour plane is substituted when layouts differ; egress converts).
    pub produce_here: Vec<PlaneDesc>,
    /// Planes produced by a specific upstream node, fetched untouched.
    pub fetch_upstream: Vec<(PlaneDesc, Arc<Node>)>,
    /// The node's declared output planes.
    pub output_planes: Vec<PlaneDesc>,
    pub process_channels: [bool; 4],
    /// Planes consumed per input slot, after process-all unification.
    pub needed_per_input: BTreeMap<usize, Vec<PlaneDesc>>,
    pub pass_through: Option<PassThroughSource>,
}

/// Apply the §-ordered negotiation rules: colour substitution first, then
/// local production, then upstream fetch, then silent drop (the kernel sees
/// transparent black for dropped planes).
pub fn negotiate_planes(
    node: &Arc<Node>,
    requested: &[PlaneDesc],
    time: FrameTime,
    view: ViewIndex,
) -> ResolveResult<NegotiatedPlanes> {
    let effect = node.effect();
    let mut needed = effect
        .components_needed(time, view)
        .map_err(|e| ResolveError::effect(format!("components_needed: {e}")))?;

    if needed.process_all {
        // A multiplanar kernel wants every input to mirror the negotiated
        // plane shapes: unify the per-input needs to the requested vector,
        // with the colour plane mapped to this node's own layout.
        let mut unified = Vec::new();
        for req in requested {
            let plane = if req.is_color_plane() {
                needed
                    .produced
                    .iter()
                    .find(|p| p.is_color_plane())
                    .cloned()
                    .unwrap_or_else(|| req.clone())
            } else {
                req.clone()
            };
            if !unified.contains(&plane) {
                unified.push(plane);
            }
        }
        for planes in needed.per_input.values_mut() {
            *planes = unified.clone();
        }
    }

    let available = node.components_available(time)?;

    let mut produce_here = Vec::new();
    let mut fetch_upstream = Vec::new();
    let mut push_local = |plane: PlaneDesc, list: &mut Vec<PlaneDesc>| {
        if !list.contains(&plane) {
            list.push(plane);
        }
    };

    for req in requested {
        if req.is_color_plane() {
            if let Some(own) = needed.produced.iter().find(|p| p.is_color_plane()) {
                push_local(own.clone(), &mut produce_here);
                continue;
            }
            if let Some((plane, src)) = available.iter().find(|(p, _)| p.is_color_plane()) {
                if src.id() == node.id() {
                    push_local(plane.clone(), &mut produce_here);
                } else {
                    fetch_upstream.push((plane.clone(), src.clone()));
                }
            }
            continue;
        }
        match available.get(req) {
            Some(src) if src.id() == node.id() => push_local(req.clone(), &mut produce_here),
            Some(src) => fetch_upstream.push((req.clone(), src.clone())),
            None => {} // dropped: kernel reads transparent black
        }
    }

    Ok(NegotiatedPlanes {
        produce_here,
        fetch_upstream,
        output_planes: needed.produced,
        process_channels: needed.process_channels,
        needed_per_input: needed.per_input,
        pass_through: needed.pass_through,
    })
}

#[cfg(test)]
#[path = "../../tests/unit/render/planes.rs"]
mod tests;
