use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::foundation::core::{FrameTime, NodeId, ViewIndex};
use crate::foundation::error::{ResolveError, ResolveResult};
use crate::foundation::math::StableHasher;
use crate::graph::effect::Effect;
use crate::image::plane::PlaneDesc;
use crate::render::trimap::TrimapCoordinator;

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

/// Per-plug-in shared state: the serialisation locks that back the
/// `Unsafe` thread-safety level and non-concurrent GL renders.
pub struct PluginHandle {
    pub name: String,
    pub(crate) render_lock: Mutex<()>,
    pub(crate) gl_lock: Mutex<()>,
}

impl PluginHandle {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            render_lock: Mutex::new(()),
            gl_lock: Mutex::new(()),
        })
    }
}

/// One node of the effect graph.
///
/// The graph is a DAG by editor invariant; callers quiesce edits while a
/// render is in flight. Render clones are siblings of a primary node: they
/// share its identity, instance lock and inputs, and exist so instance-safe
/// effects can render concurrently.
pub struct Node {
    id: NodeId,
    label: String,
    effect: Arc<dyn Effect>,
    plugin: Arc<PluginHandle>,
    inputs: RwLock<Vec<Option<Arc<Node>>>>,
    consumers: AtomicUsize,
    primary: Option<Weak<Node>>,
    clones: Mutex<Vec<Arc<Node>>>,
    instance_lock: Arc<Mutex<()>>,
    pub(crate) trimap: TrimapCoordinator,
}

impl Node {
    pub fn new(label: impl Into<String>, effect: Arc<dyn Effect>, plugin: Arc<PluginHandle>) -> Arc<Self> {
        let inputs = vec![None; effect.input_count()];
        Arc::new(Self {
            id: NodeId(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed)),
            label: label.into(),
            effect,
            plugin,
            inputs: RwLock::new(inputs),
            consumers: AtomicUsize::new(0),
            primary: None,
            clones: Mutex::new(Vec::new()),
            instance_lock: Arc::new(Mutex::new(())),
            trimap: TrimapCoordinator::new(),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn effect(&self) -> &Arc<dyn Effect> {
        &self.effect
    }

    pub fn plugin(&self) -> &Arc<PluginHandle> {
        &self.plugin
    }

    pub(crate) fn instance_lock(&self) -> &Arc<Mutex<()>> {
        &self.instance_lock
    }

    pub fn connect_input(&self, slot: usize, upstream: Option<Arc<Node>>) -> ResolveResult<()> {
        let mut inputs = self.inputs.write().expect("node inputs lock");
        if slot >= inputs.len() {
            return Err(ResolveError::validation(format!(
                "input slot {slot} out of range for node '{}'",
                self.label
            )));
        }
        if let Some(old) = &inputs[slot] {
            old.consumers.fetch_sub(1, Ordering::Relaxed);
        }
        if let Some(new) = &upstream {
            new.consumers.fetch_add(1, Ordering::Relaxed);
        }
        inputs[slot] = upstream;
        Ok(())
    }

    pub fn input(&self, slot: usize) -> Option<Arc<Node>> {
        if let Some(primary) = self.primary() {
            return primary.input(slot);
        }
        self.inputs.read().expect("node inputs lock").get(slot).cloned().flatten()
    }

    pub fn input_count(&self) -> usize {
        self.effect.input_count()
    }

    /// Number of downstream nodes consuming this output. More than one
    /// demotes GPU storage, since GPU renders bypass the cache.
    pub fn consumer_count(&self) -> usize {
        match self.primary() {
            Some(p) => p.consumer_count(),
            None => self.consumers.load(Ordering::Relaxed),
        }
    }

    pub fn is_render_clone(&self) -> bool {
        self.primary.is_some()
    }

    pub fn primary(&self) -> Option<Arc<Node>> {
        self.primary.as_ref().and_then(Weak::upgrade)
    }

    /// Pop an idle render clone or spawn one from the effect. `None` when
    /// the effect cannot clone itself.
    pub fn acquire_render_clone(self: &Arc<Self>) -> Option<Arc<Node>> {
        if let Some(clone) = self.clones.lock().expect("clone pool lock").pop() {
            return Some(clone);
        }
        let effect = self.effect.render_clone()?;
        Some(Arc::new(Self {
            id: self.id,
            label: self.label.clone(),
            effect,
            plugin: self.plugin.clone(),
            inputs: RwLock::new(Vec::new()),
            consumers: AtomicUsize::new(0),
            primary: Some(Arc::downgrade(self)),
            clones: Mutex::new(Vec::new()),
            instance_lock: self.instance_lock.clone(),
            trimap: TrimapCoordinator::new(),
        }))
    }

    pub fn release_render_clone(&self, clone: Arc<Node>) {
        if clone.is_render_clone() {
            self.clones.lock().expect("clone pool lock").push(clone);
        }
    }

    /// Fingerprint over everything upstream that influences this node's
    /// output. Time and view live in the cache key, not in the hash.
    pub fn node_hash(&self) -> u64 {
        if let Some(primary) = self.primary() {
            return primary.node_hash();
        }
        let mut h = StableHasher::new();
        self.hash_into(&mut h);
        h.finish()
    }

    fn hash_into(&self, h: &mut StableHasher) {
        h.write_str(self.effect.label());
        h.write_str(&self.label);
        self.effect.param_fingerprint(h);
        let inputs = self.inputs.read().expect("node inputs lock");
        h.write_u64(inputs.len() as u64);
        for input in inputs.iter() {
            match input {
                Some(up) => {
                    h.write_bool(true);
                    up.hash_into(h);
                }
                None => h.write_bool(false),
            }
        }
    }

    /// True when this node or anything upstream varies frame to frame.
    pub fn frame_varying_recursive(&self) -> bool {
        if self.effect.is_frame_varying() {
            return true;
        }
        let inputs = self.inputs.read().expect("node inputs lock");
        inputs
            .iter()
            .flatten()
            .any(|up| up.frame_varying_recursive())
    }

    /// Every plane reachable at this node's output, mapped to the node that
    /// actually produces it. Own planes shadow upstream ones; the rest flows
    /// through the declared pass-through input.
    pub fn components_available(
        self: &Arc<Self>,
        time: FrameTime,
    ) -> ResolveResult<BTreeMap<PlaneDesc, Arc<Node>>> {
        let mut out = BTreeMap::new();
        let needed = self
            .effect
            .components_needed(time, ViewIndex::MAIN)
            .map_err(|e| ResolveError::effect(format!("components_needed: {e}")))?;
        for plane in &needed.produced {
            out.insert(plane.clone(), self.clone());
        }
        if let Some(pt) = needed.pass_through
            && let Some(upstream) = self.input(pt.input)
        {
            for (plane, node) in upstream.components_available(pt.time)? {
                out.entry(plane).or_insert(node);
            }
        }
        Ok(out)
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("clone", &self.is_render_clone())
            .finish()
    }
}
