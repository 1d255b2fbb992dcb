//! Shared effect fixtures for the end-to-end resolver tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use kurbo::Rect;
use tilework::{
    ComponentsNeeded, Effect, FrameTime, GlAttach, GlContext, GlSupport, IdentityVerdict,
    MipLevel, Node, PixelRect, PlaneDesc, PluginHandle, RegionOfDefinition, RenderSettings,
    RenderTileArgs, ResolveResult, Resolver, ScaleSupport, StableHasher, ThreadSafety, ViewIndex,
};

/// Rendezvous for the concurrent-render tests: the kernel parks inside
/// `render` until the test releases it.
#[derive(Clone, Default)]
pub struct Gate {
    inner: Arc<(Mutex<GateState>, Condvar)>,
}

#[derive(Default)]
struct GateState {
    started: bool,
    released: bool,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wait_started(&self) {
        let (lock, cond) = &*self.inner;
        let mut state = lock.lock().unwrap();
        while !state.started {
            state = cond.wait(state).unwrap();
        }
    }

    pub fn release(&self) {
        let (lock, cond) = &*self.inner;
        lock.lock().unwrap().released = true;
        cond.notify_all();
    }

    fn enter(&self) {
        let (lock, cond) = &*self.inner;
        let mut state = lock.lock().unwrap();
        state.started = true;
        cond.notify_all();
        while !state.released {
            state = cond.wait(state).unwrap();
        }
    }
}

type IdentityFn = Box<dyn Fn(FrameTime, PixelRect) -> IdentityVerdict + Send + Sync>;

/// Scriptable effect covering the capability matrix the resolver consumes.
pub struct TestEffect {
    pub name: String,
    pub color: Mutex<[f32; 4]>,
    pub rod: Option<Rect>,
    pub inputs: usize,
    pub identity: Mutex<Option<IdentityVerdict>>,
    pub identity_fn: Option<IdentityFn>,
    pub renders: AtomicUsize,
    pub rendered_rects: Mutex<Vec<PixelRect>>,
    pub attach_calls: AtomicUsize,
    pub attach_oom_once: AtomicBool,
    pub safety: ThreadSafety,
    pub tiles: bool,
    pub scale: ScaleSupport,
    pub gl: GlSupport,
    pub gate: Option<Gate>,
}

impl TestEffect {
    pub fn solid(name: &str, color: [f32; 4], rod: Rect) -> Self {
        Self {
            name: name.to_string(),
            color: Mutex::new(color),
            rod: Some(rod),
            inputs: 0,
            identity: Mutex::new(None),
            identity_fn: None,
            renders: AtomicUsize::new(0),
            rendered_rects: Mutex::new(Vec::new()),
            attach_calls: AtomicUsize::new(0),
            attach_oom_once: AtomicBool::new(false),
            safety: ThreadSafety::FullySafe,
            tiles: true,
            scale: ScaleSupport::Yes,
            gl: GlSupport::No,
            gate: None,
        }
    }

    pub fn with_inputs(mut self, n: usize) -> Self {
        self.inputs = n;
        self
    }

    pub fn with_identity(self, verdict: IdentityVerdict) -> Self {
        *self.identity.lock().unwrap() = Some(verdict);
        self
    }

    pub fn with_safety(mut self, safety: ThreadSafety) -> Self {
        self.safety = safety;
        self
    }

    pub fn without_tiles(mut self) -> Self {
        self.tiles = false;
        self
    }

    pub fn with_gl(mut self, gl: GlSupport) -> Self {
        self.gl = gl;
        self
    }

    pub fn with_gate(mut self, gate: Gate) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_identity_fn(
        mut self,
        f: impl Fn(FrameTime, PixelRect) -> IdentityVerdict + Send + Sync + 'static,
    ) -> Self {
        self.identity_fn = Some(Box::new(f));
        self
    }

    pub fn set_color(&self, color: [f32; 4]) {
        *self.color.lock().unwrap() = color;
    }

    pub fn render_count(&self) -> usize {
        self.renders.load(Ordering::SeqCst)
    }

    pub fn rects_rendered(&self) -> Vec<PixelRect> {
        self.rendered_rects.lock().unwrap().clone()
    }
}

impl Effect for TestEffect {
    fn label(&self) -> &str {
        &self.name
    }

    fn region_of_definition(
        &self,
        _time: FrameTime,
        _view: ViewIndex,
        _mip: MipLevel,
    ) -> ResolveResult<Option<RegionOfDefinition>> {
        Ok(self.rod.map(|rect| RegionOfDefinition {
            rect,
            project_format: false,
        }))
    }

    fn components_needed(
        &self,
        _time: FrameTime,
        _view: ViewIndex,
    ) -> ResolveResult<ComponentsNeeded> {
        let mut per_input = BTreeMap::new();
        for i in 0..self.inputs {
            per_input.insert(i, vec![PlaneDesc::rgba()]);
        }
        Ok(ComponentsNeeded {
            per_input,
            produced: vec![PlaneDesc::rgba()],
            process_channels: [true; 4],
            process_all: false,
            pass_through: None,
        })
    }

    fn is_identity(
        &self,
        time: FrameTime,
        _mip: MipLevel,
        region: PixelRect,
        _view: ViewIndex,
    ) -> ResolveResult<IdentityVerdict> {
        if let Some(f) = &self.identity_fn {
            return Ok(f(time, region));
        }
        Ok(self
            .identity
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(IdentityVerdict::NotIdentity))
    }

    fn render(&self, args: &RenderTileArgs<'_>) -> ResolveResult<()> {
        self.renders.fetch_add(1, Ordering::SeqCst);
        self.rendered_rects.lock().unwrap().push(args.rect);
        if let Some(gate) = &self.gate {
            gate.enter();
        }
        let color = *self.color.lock().unwrap();
        for img in args.planes.values() {
            img.fill(args.rect, color);
        }
        Ok(())
    }

    fn param_fingerprint(&self, h: &mut StableHasher) {
        h.write_str(&self.name);
    }

    fn input_count(&self) -> usize {
        self.inputs
    }

    fn supports_render_scale(&self) -> ScaleSupport {
        self.scale
    }

    fn supports_tiles(&self) -> bool {
        self.tiles
    }

    fn thread_safety(&self) -> ThreadSafety {
        self.safety
    }

    fn gl_support(&self) -> GlSupport {
        self.gl
    }

    fn attach_gl_context(&self, _ctx: &GlContext) -> ResolveResult<GlAttach> {
        self.attach_calls.fetch_add(1, Ordering::SeqCst);
        if self.attach_oom_once.swap(false, Ordering::SeqCst) {
            return Ok(GlAttach::OutOfMemory);
        }
        Ok(GlAttach::Attached(None))
    }
}

pub fn plugin() -> Arc<PluginHandle> {
    PluginHandle::new("test-plugin")
}

pub fn node_with(effect: TestEffect) -> (Arc<Node>, Arc<TestEffect>) {
    let effect = Arc::new(effect);
    let node = Node::new(effect.name.clone(), effect.clone(), plugin());
    (node, effect)
}

pub fn resolver() -> Resolver {
    Resolver::new(RenderSettings {
        threads: Some(2),
        ..RenderSettings::default()
    })
    .unwrap()
}

pub const RED: [f32; 4] = [1.0, 0.0, 0.0, 1.0];
pub const GREEN: [f32; 4] = [0.0, 1.0, 0.0, 1.0];

pub fn rod(size: f64) -> Rect {
    Rect::new(0.0, 0.0, size, size)
}
