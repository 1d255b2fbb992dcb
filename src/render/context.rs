use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::foundation::core::NodeId;
use crate::graph::effect::GlContext;
use crate::graph::node::Node;
use crate::render::request::RequestPass;

/// Cooperative cancellation token carried by a frame render.
///
/// A token can be created un-abortable: the trimap wait protocol is only
/// legal for those, since a waiter must be able to rely on the producer
/// finishing.
#[derive(Clone)]
pub struct AbortToken {
    flag: Arc<AtomicBool>,
    abortable: bool,
}

impl AbortToken {
    pub fn abortable() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            abortable: true,
        }
    }

    pub fn unabortable() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            abortable: false,
        }
    }

    pub fn abort(&self) {
        if self.abortable {
            self.flag.store(true, Ordering::Release);
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.abortable && self.flag.load(Ordering::Acquire)
    }

    pub fn is_abortable(&self) -> bool {
        self.abortable
    }
}

/// Aggregated per-frame render counters.
#[derive(Default)]
pub struct RenderStats {
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub tiles_rendered: AtomicU64,
    pub identity_rects: AtomicU64,
    pub upstream_renders: AtomicU64,
}

impl RenderStats {
    pub fn snapshot(&self) -> RenderStatsSnapshot {
        RenderStatsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            tiles_rendered: self.tiles_rendered.load(Ordering::Relaxed),
            identity_rects: self.identity_rects.load(Ordering::Relaxed),
            upstream_renders: self.upstream_renders.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RenderStatsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub tiles_rendered: u64,
    pub identity_rects: u64,
    pub upstream_renders: u64,
}

/// Per-node state of the enclosing frame render.
///
/// Bound onto a per-thread stack before resolution starts; the tile
/// dispatcher snapshots the stacks onto its workers so expressions evaluated
/// there still observe their originating render.
#[derive(Clone)]
pub struct FrameContext {
    pub node_hash: u64,
    pub abort: AbortToken,
    pub gl: Option<Arc<GlContext>>,
    pub draft: bool,
    pub sequential: bool,
    pub user_interaction: bool,
    pub tiles_supported: bool,
    pub stats: Option<Arc<RenderStats>>,
    pub request_pass: Option<Arc<RequestPass>>,
}

impl FrameContext {
    /// Minimal context for a caller that skipped the bind step.
    pub fn synthesized(node: &Node, abort: AbortToken) -> Arc<Self> {
        Arc::new(Self {
            node_hash: node.node_hash(),
            abort,
            gl: None,
            draft: false,
            sequential: false,
            user_interaction: true,
            tiles_supported: node.effect().supports_tiles(),
            stats: None,
            request_pass: None,
        })
    }
}

thread_local! {
    static FRAME_STACKS: RefCell<HashMap<NodeId, Vec<Arc<FrameContext>>>> =
        RefCell::new(HashMap::new());
}

/// RAII binding of one node's frame context onto the current thread.
pub struct FrameContextBinding {
    node: NodeId,
}

impl FrameContextBinding {
    pub fn bind(node: NodeId, ctx: Arc<FrameContext>) -> Self {
        FRAME_STACKS.with(|s| s.borrow_mut().entry(node).or_default().push(ctx));
        Self { node }
    }
}

impl Drop for FrameContextBinding {
    fn drop(&mut self) {
        FRAME_STACKS.with(|s| {
            let mut stacks = s.borrow_mut();
            if let Some(stack) = stacks.get_mut(&self.node) {
                stack.pop();
                if stack.is_empty() {
                    stacks.remove(&self.node);
                }
            }
        });
    }
}

pub fn current_context(node: NodeId) -> Option<Arc<FrameContext>> {
    FRAME_STACKS.with(|s| s.borrow().get(&node).and_then(|stack| stack.last().cloned()))
}

/// Copy of the top frame context of every node on this thread. Installed
/// onto workers before tile fan-out; inherited TLS is not enough because the
/// pool threads outlive any single render.
pub fn snapshot_contexts() -> Vec<(NodeId, Arc<FrameContext>)> {
    FRAME_STACKS.with(|s| {
        s.borrow()
            .iter()
            .filter_map(|(id, stack)| stack.last().map(|ctx| (*id, ctx.clone())))
            .collect()
    })
}

pub fn install_snapshot(snapshot: &[(NodeId, Arc<FrameContext>)]) -> Vec<FrameContextBinding> {
    snapshot
        .iter()
        .map(|(id, ctx)| FrameContextBinding::bind(*id, ctx.clone()))
        .collect()
}

/// Options for binding a whole render tree at once.
#[derive(Clone)]
pub struct TreeRenderOpts {
    pub abort: AbortToken,
    pub gl: Option<Arc<GlContext>>,
    pub draft: bool,
    pub sequential: bool,
    pub user_interaction: bool,
    pub stats: Option<Arc<RenderStats>>,
    pub request_pass: Option<Arc<RequestPass>>,
}

impl Default for TreeRenderOpts {
    fn default() -> Self {
        Self {
            abort: AbortToken::abortable(),
            gl: None,
            draft: false,
            sequential: false,
            user_interaction: true,
            stats: None,
            request_pass: None,
        }
    }
}

/// Binds a frame context for `root` and everything upstream of it, for the
/// lifetime of the returned scope. This is the caller-facing entry point;
/// resolving a node without a binding works but warns.
pub struct TreeRenderScope {
    _bindings: Vec<FrameContextBinding>,
}

impl TreeRenderScope {
    pub fn bind(root: &Arc<Node>, opts: TreeRenderOpts) -> Self {
        let mut bindings = Vec::new();
        let mut seen = Vec::new();
        bind_recursive(root, &opts, &mut bindings, &mut seen);
        Self {
            _bindings: bindings,
        }
    }
}

fn bind_recursive(
    node: &Arc<Node>,
    opts: &TreeRenderOpts,
    bindings: &mut Vec<FrameContextBinding>,
    seen: &mut Vec<NodeId>,
) {
    if seen.contains(&node.id()) {
        return;
    }
    seen.push(node.id());
    let ctx = Arc::new(FrameContext {
        node_hash: node.node_hash(),
        abort: opts.abort.clone(),
        gl: opts.gl.clone(),
        draft: opts.draft,
        sequential: opts.sequential,
        user_interaction: opts.user_interaction,
        tiles_supported: node.effect().supports_tiles(),
        stats: opts.stats.clone(),
        request_pass: opts.request_pass.clone(),
    });
    bindings.push(FrameContextBinding::bind(node.id(), ctx));
    for slot in 0..node.input_count() {
        if let Some(up) = node.input(slot) {
            bind_recursive(&up, opts, bindings, seen);
        }
    }
}
