use super::*;
use crate::foundation::core::MipLevel;
use crate::graph::effect::{
    ComponentsNeeded, Effect, PassThroughSource, RegionOfDefinition, RenderTileArgs,
};
use crate::graph::node::PluginHandle;
use kurbo::Rect;

struct PlanesEffect {
    name: &'static str,
    produced: Vec<PlaneDesc>,
    pass_through: Option<PassThroughSource>,
    process_all: bool,
    inputs: usize,
}

impl Effect for PlanesEffect {
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
            rect: Rect::new(0.0, 0.0, 4.0, 4.0),
            project_format: false,
        }))
    }

    fn components_needed(
        &self,
        _time: FrameTime,
        _view: ViewIndex,
    ) -> ResolveResult<ComponentsNeeded> {
        let mut per_input = std::collections::BTreeMap::new();
        for i in 0..self.inputs {
            per_input.insert(i, vec![PlaneDesc::rgba()]);
        }
        Ok(ComponentsNeeded {
            per_input,
            produced: self.produced.clone(),
            process_channels: [true; 4],
            process_all: self.process_all,
            pass_through: self.pass_through,
        })
    }

    fn render(&self, _args: &RenderTileArgs<'_>) -> ResolveResult<()> {
        Ok(())
    }

    fn input_count(&self) -> usize {
        self.inputs
    }
}

fn make(name: &'static str, produced: Vec<PlaneDesc>, inputs: usize) -> PlanesEffect {
    PlanesEffect {
        name,
        produced,
        pass_through: None,
        process_all: false,
        inputs,
    }
}

const T0: FrameTime = FrameTime(0.0);

#[test]
fn color_plane_substitutes_the_node_layout() {
    let node = Node::new(
        "n",
        Arc::new(make("n", vec![PlaneDesc::rgba()], 0)),
        PluginHandle::new("p"),
    );
    let neg = negotiate_planes(&node, &[PlaneDesc::rgb()], T0, ViewIndex::MAIN).unwrap();
    // The caller asked for RGB; the node renders its own RGBA and the
    // conversion happens on egress.
    assert_eq!(neg.produce_here, vec![PlaneDesc::rgba()]);
    assert!(neg.fetch_upstream.is_empty());
}

#[test]
fn upstream_plane_is_fetched_not_rendered() {
    let up = Node::new(
        "up",
        Arc::new(make("up", vec![PlaneDesc::rgba(), PlaneDesc::depth()], 0)),
        PluginHandle::new("p"),
    );
    let mut through = make("n", vec![PlaneDesc::rgba()], 1);
    through.pass_through = Some(PassThroughSource {
        input: 0,
        time: T0,
        view: ViewIndex::MAIN,
    });
    let node = Node::new("n", Arc::new(through), PluginHandle::new("p"));
    node.connect_input(0, Some(up.clone())).unwrap();

    let neg = negotiate_planes(
        &node,
        &[PlaneDesc::rgba(), PlaneDesc::depth(), PlaneDesc::motion()],
        T0,
        ViewIndex::MAIN,
    )
    .unwrap();
    assert_eq!(neg.produce_here, vec![PlaneDesc::rgba()]);
    assert_eq!(neg.fetch_upstream.len(), 1);
    let (plane, src) = &neg.fetch_upstream[0];
    assert_eq!(*plane, PlaneDesc::depth());
    assert_eq!(src.id(), up.id());
    // The motion plane exists nowhere: silently dropped.
}

#[test]
fn process_all_unifies_input_needs() {
    let mut e = make("n", vec![PlaneDesc::rgba()], 2);
    e.process_all = true;
    let node = Node::new("n", Arc::new(e), PluginHandle::new("p"));
    let neg = negotiate_planes(
        &node,
        &[PlaneDesc::rgb(), PlaneDesc::motion()],
        T0,
        ViewIndex::MAIN,
    )
    .unwrap();
    for planes in neg.needed_per_input.values() {
        assert_eq!(planes, &vec![PlaneDesc::rgba(), PlaneDesc::motion()]);
    }
}

#[test]
fn duplicate_color_requests_collapse() {
    let node = Node::new(
        "n",
        Arc::new(make("n", vec![PlaneDesc::rgba()], 0)),
        PluginHandle::new("p"),
    );
    let neg = negotiate_planes(
        &node,
        &[PlaneDesc::rgb(), PlaneDesc::rgba(), PlaneDesc::alpha()],
        T0,
        ViewIndex::MAIN,
    )
    .unwrap();
    assert_eq!(neg.produce_here, vec![PlaneDesc::rgba()]);
}
