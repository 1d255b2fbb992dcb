use super::*;
use crate::foundation::math::StableHasher;
use crate::graph::effect::{ComponentsNeeded, Effect, RegionOfDefinition, RenderTileArgs};
use crate::graph::node::PluginHandle;
use crate::image::plane::PlaneDesc;
use kurbo::Rect;

struct StubEffect {
    name: &'static str,
    verdict: IdentityVerdict,
    inputs: usize,
    invariance: ViewInvariance,
}

impl StubEffect {
    fn solid(name: &'static str) -> Self {
        Self {
            name,
            verdict: IdentityVerdict::NotIdentity,
            inputs: 0,
            invariance: ViewInvariance::NotInvariant,
        }
    }

    fn pass(name: &'static str, input: usize, time: f64) -> Self {
        Self {
            name,
            verdict: IdentityVerdict::PassThrough {
                input,
                time: FrameTime(time),
                view: ViewIndex::MAIN,
            },
            inputs: input + 1,
            invariance: ViewInvariance::NotInvariant,
        }
    }
}

impl Effect for StubEffect {
    fn label(&self) -> &str {
        self.name
    }

    fn region_of_definition(
        &self,
        _time: FrameTime,
        _view: ViewIndex,
        _mip: MipLevel,
    ) -> ResolveResult<Option<RegionOfDefinition>> {
        Ok(Some(RegionOfDefinition {
            rect: Rect::new(0.0, 0.0, 8.0, 8.0),
            project_format: false,
        }))
    }

    fn components_needed(
        &self,
        _time: FrameTime,
        _view: ViewIndex,
    ) -> ResolveResult<ComponentsNeeded> {
        Ok(ComponentsNeeded {
            produced: vec![PlaneDesc::rgba()],
            ..ComponentsNeeded::default()
        })
    }

    fn is_identity(
        &self,
        _time: FrameTime,
        _mip: MipLevel,
        _region: PixelRect,
        _view: ViewIndex,
    ) -> ResolveResult<IdentityVerdict> {
        Ok(self.verdict.clone())
    }

    fn render(&self, _args: &RenderTileArgs<'_>) -> ResolveResult<()> {
        Ok(())
    }

    fn input_count(&self) -> usize {
        self.inputs
    }

    fn view_invariance(&self) -> ViewInvariance {
        self.invariance
    }

    fn param_fingerprint(&self, h: &mut StableHasher) {
        h.write_str(self.name);
    }
}

fn node(effect: StubEffect) -> Arc<Node> {
    Node::new(effect.name, Arc::new(effect), PluginHandle::new("stub"))
}

const REGION: PixelRect = PixelRect {
    x1: 0,
    y1: 0,
    x2: 8,
    y2: 8,
};

#[test]
fn missing_identity_input_is_transparent_black() {
    let a = node(StubEffect::pass("a", 0, 1.0));
    let resolved =
        resolve_identity(&a, FrameTime(1.0), MipLevel::FULL, REGION, ViewIndex::MAIN).unwrap();
    assert!(matches!(resolved, ResolvedIdentity::TransparentBlack));
}

#[test]
fn self_redirect_to_same_time_and_view_is_rejected() {
    let mut e = StubEffect::solid("a");
    e.verdict = IdentityVerdict::SelfAtTimeView {
        time: FrameTime(2.0),
        view: ViewIndex::MAIN,
    };
    let a = node(e);
    let same =
        resolve_identity(&a, FrameTime(2.0), MipLevel::FULL, REGION, ViewIndex::MAIN).unwrap();
    assert!(matches!(same, ResolvedIdentity::NotIdentity));

    let different =
        resolve_identity(&a, FrameTime(3.0), MipLevel::FULL, REGION, ViewIndex::MAIN).unwrap();
    assert!(
        matches!(different, ResolvedIdentity::SelfRedirect { time, .. } if time == FrameTime(2.0))
    );
}

#[test]
fn all_views_invariant_short_circuits_to_main_view() {
    let mut e = StubEffect::solid("a");
    e.invariance = ViewInvariance::AllViewsInvariant;
    let a = node(e);
    let resolved =
        resolve_identity(&a, FrameTime(0.0), MipLevel::FULL, REGION, ViewIndex(2)).unwrap();
    assert!(matches!(
        resolved,
        ResolvedIdentity::SelfRedirect { view, .. } if view == ViewIndex::MAIN
    ));
    // The hook is never consulted for the main view of an invariant effect.
    let main = resolve_identity(&a, FrameTime(0.0), MipLevel::FULL, REGION, ViewIndex::MAIN)
        .unwrap();
    assert!(matches!(main, ResolvedIdentity::NotIdentity));
}

#[test]
fn chain_chases_to_the_terminus() {
    let c = node(StubEffect::solid("c"));
    let b = node(StubEffect::pass("b", 0, 4.0));
    let a = node(StubEffect::pass("a", 0, 4.0));
    b.connect_input(0, Some(c.clone())).unwrap();
    a.connect_input(0, Some(b.clone())).unwrap();

    let ResolvedIdentity::Redirect { target, time, view, .. } =
        resolve_identity(&a, FrameTime(4.0), MipLevel::FULL, REGION, ViewIndex::MAIN).unwrap()
    else {
        panic!("expected a redirect");
    };
    assert_eq!(target.id(), b.id());

    let terminus =
        chase_identity_chain(&target, time, MipLevel::FULL, REGION, view).unwrap();
    match terminus {
        ChainTerminus::Node { node, time, .. } => {
            assert_eq!(node.id(), c.id());
            assert_eq!(time, FrameTime(4.0));
        }
        ChainTerminus::Transparent => panic!("chain should end on a concrete node"),
    }
}

#[test]
fn chain_with_dangling_tail_is_transparent() {
    let b = node(StubEffect::pass("b", 0, 0.0));
    let a = node(StubEffect::pass("a", 0, 0.0));
    a.connect_input(0, Some(b.clone())).unwrap();

    let ResolvedIdentity::Redirect { target, time, view, .. } =
        resolve_identity(&a, FrameTime(0.0), MipLevel::FULL, REGION, ViewIndex::MAIN).unwrap()
    else {
        panic!("expected a redirect");
    };
    let terminus = chase_identity_chain(&target, time, MipLevel::FULL, REGION, view).unwrap();
    assert!(matches!(terminus, ChainTerminus::Transparent));
}
