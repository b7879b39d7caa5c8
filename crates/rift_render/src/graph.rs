use glam::Mat4;

use rift_core::layers::LayerMask;
use rift_core::portal::{Portal, PortalId, PortalSet};

use crate::camera::EyeCamera;
use crate::window::ViewWindow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GraphLimits {
    pub max_depth: u32,
}

impl Default for GraphLimits {
    fn default() -> Self {
        Self { max_depth: 4 }
    }
}

/// One virtual view in the per-frame tree. Depth 0 is a physical camera;
/// every deeper node is the world seen through one more portal.
#[derive(Debug, Clone)]
pub struct RenderNode {
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub depth: u32,
    /// The portal this node looks through. `None` at a root.
    pub portal: Option<PortalId>,
    pub camera: EyeCamera,
    /// Product of every ancestor portal's teleport, root to here.
    pub teleport: Mat4,
    pub cull_mask: LayerMask,
    pub window: ViewWindow,
    pub valid: bool,
}

/// Arena of render nodes, rebuilt from scratch every frame and cleared
/// wholesale. Slots are indices, parents always precede children.
#[derive(Debug, Default)]
pub struct RenderGraph {
    nodes: Vec<RenderNode>,
    roots: Vec<NodeId>,
}

impl RenderGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.roots.clear();
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn get(&self, id: NodeId) -> Option<&RenderNode> {
        self.nodes.get(id.index())
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &RenderNode)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (NodeId(i as u32), node))
    }

    pub fn invalidate(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.get_mut(id.index()) {
            node.valid = false;
        }
    }

    /// Rebuilds the tree: one root per eye, then recursive discovery of
    /// every linked portal whose window stays visible through its parent.
    /// At the root, visibility merges all eyes' windows so a portal caught
    /// by one eye is rendered for both.
    pub fn build(
        &mut self,
        portals: &PortalSet,
        eyes: &[EyeCamera],
        mask: LayerMask,
        limits: &GraphLimits,
    ) {
        self.clear();
        if eyes.is_empty() {
            return;
        }

        for eye in eyes {
            let root = self.push_node(RenderNode {
                parent: None,
                children: Vec::new(),
                depth: 0,
                portal: None,
                camera: *eye,
                teleport: Mat4::IDENTITY,
                cull_mask: mask,
                window: ViewWindow::FULL,
                valid: true,
            });
            self.roots.push(root);
        }

        for (id, portal) in portals.iter() {
            if !portal.is_linked() {
                continue;
            }
            let mut combined = ViewWindow::EMPTY;
            for eye in eyes {
                if facing_away(eye, portal) {
                    continue;
                }
                combined = ViewWindow::combine(
                    combined,
                    ViewWindow::of_bounds(
                        eye.view_projection(),
                        portal.local_bounds(),
                        portal.pose(),
                    ),
                );
            }
            if !combined.is_visible_through(&ViewWindow::FULL) {
                continue;
            }
            let mut window = combined;
            window.clamp_inside(&ViewWindow::FULL);

            for root_index in 0..self.roots.len() {
                if facing_away(&eyes[root_index], portal) {
                    continue;
                }
                let root = self.roots[root_index];
                self.spawn_child(root, id, portal, window, portals, limits);
            }
        }
    }

    fn spawn_child(
        &mut self,
        parent: NodeId,
        portal_id: PortalId,
        portal: &Portal,
        window: ViewWindow,
        portals: &PortalSet,
        limits: &GraphLimits,
    ) {
        let parent_node = &self.nodes[parent.index()];
        if parent_node.depth >= limits.max_depth {
            return;
        }

        // Everything seen through the surface lies beyond it. The stored
        // window keeps the portal's screen rect, but its depth must run to
        // far or deeper portals would be culled against the surface's own
        // thin z slab.
        let mut window = window;
        window.max.z = 1.0;

        let step = portal.modify_matrix(Mat4::IDENTITY);
        let depth = parent_node.depth + 1;
        let camera = parent_node.camera.teleported(step);
        let teleport = step * parent_node.teleport;
        let cull_mask = portal.modify_layer_mask(parent_node.cull_mask);

        let child = self.push_node(RenderNode {
            parent: Some(parent),
            children: Vec::new(),
            depth,
            portal: Some(portal_id),
            camera,
            teleport,
            cull_mask,
            window,
            valid: true,
        });
        self.nodes[parent.index()].children.push(child);
        self.discover_children(child, portals, limits);
    }

    fn discover_children(&mut self, parent: NodeId, portals: &PortalSet, limits: &GraphLimits) {
        if self.nodes[parent.index()].depth >= limits.max_depth {
            return;
        }
        let camera = self.nodes[parent.index()].camera;
        let parent_window = self.nodes[parent.index()].window;
        let view_proj = camera.view_projection();

        for (id, portal) in portals.iter() {
            if !portal.is_linked() {
                continue;
            }
            if facing_away(&camera, portal) {
                continue;
            }
            let mut window =
                ViewWindow::of_bounds(view_proj, portal.local_bounds(), portal.pose());
            if !window.is_visible_through(&parent_window) {
                continue;
            }
            window.clamp_inside(&parent_window);
            self.spawn_child(parent, id, portal, window, portals, limits);
        }
    }

    fn push_node(&mut self, node: RenderNode) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }
}

/// A camera on a portal's back side never looks through it.
fn facing_away(camera: &EyeCamera, portal: &Portal) -> bool {
    (camera.position() - portal.center()).dot(portal.normal()) <= 0.0
}

#[cfg(test)]
mod tests {
    use glam::{Mat4, Vec2, Vec3};
    use std::f32::consts::PI;

    use super::{GraphLimits, RenderGraph};
    use crate::camera::EyeCamera;
    use rift_core::layers::{Layer, LayerMask};
    use rift_core::portal::{Portal, PortalId, PortalSet};

    fn looking_neg_z(position: Vec3) -> EyeCamera {
        EyeCamera::looking(position, Vec3::NEG_Z, Vec3::Y)
    }

    fn linked_pair(set: &mut PortalSet, pose_a: Mat4, pose_b: Mat4) -> (PortalId, PortalId) {
        let a = set.insert(Portal::new(pose_a, Vec2::new(1.0, 1.0)));
        let b = set.insert(Portal::new(pose_b, Vec2::new(1.0, 1.0)));
        assert!(set.link(a, b));
        (a, b)
    }

    #[test]
    fn single_portal_spawns_one_child() {
        let mut set = PortalSet::new();
        let (a, _) = linked_pair(
            &mut set,
            Mat4::IDENTITY,
            Mat4::from_translation(Vec3::new(50.0, 0.0, 0.0)),
        );

        let mut graph = RenderGraph::new();
        graph.build(
            &set,
            &[looking_neg_z(Vec3::new(0.0, 0.0, 5.0))],
            LayerMask::all(),
            &GraphLimits::default(),
        );

        assert_eq!(graph.len(), 2);
        let root = graph.get(graph.roots()[0]).unwrap();
        assert_eq!(root.children.len(), 1);

        let child = graph.get(root.children[0]).unwrap();
        assert_eq!(child.depth, 1);
        assert_eq!(child.portal, Some(a));
        assert_eq!(child.teleport, set.teleport_matrix(a).unwrap());
        // the exit pose turns the camera around and carries it to the exit
        let expected = set.teleport_matrix(a).unwrap().transform_point3(Vec3::new(0.0, 0.0, 5.0));
        assert!((child.camera.position() - expected).length() < 1e-4);
    }

    #[test]
    fn child_window_keeps_its_rect_but_reaches_far() {
        let mut set = PortalSet::new();
        linked_pair(
            &mut set,
            Mat4::IDENTITY,
            Mat4::from_translation(Vec3::new(50.0, 0.0, 0.0)),
        );

        let mut graph = RenderGraph::new();
        graph.build(
            &set,
            &[looking_neg_z(Vec3::new(0.0, 0.0, 5.0))],
            LayerMask::all(),
            &GraphLimits::default(),
        );

        let root = graph.get(graph.roots()[0]).unwrap();
        let child = graph.get(root.children[0]).unwrap();
        // the screen rect stays tight for viewport fitting
        assert!(child.window.min.x > -1.0 && child.window.max.x < 1.0);
        assert!(child.window.min.y > -1.0 && child.window.max.y < 1.0);
        // the depth range reaches the far plane so a portal seen through
        // this one still overlaps the stored window on z
        assert!(child.window.min.z > 0.0);
        assert_eq!(child.window.max.z, 1.0);
    }

    #[test]
    fn mirror_pair_recurses_to_the_depth_cutoff() {
        let mut set = PortalSet::new();
        // two portals on opposite walls facing each other
        linked_pair(
            &mut set,
            Mat4::from_rotation_y(PI),
            Mat4::from_translation(Vec3::new(0.0, 0.0, -6.0)),
        );

        let mut graph = RenderGraph::new();
        let eye = EyeCamera::looking(Vec3::new(0.0, 0.0, -3.0), Vec3::Z, Vec3::Y);
        graph.build(&set, &[eye], LayerMask::all(), &GraphLimits { max_depth: 3 });

        assert_eq!(graph.len(), 4);
        let deepest = graph.nodes().map(|(_, n)| n.depth).max().unwrap();
        assert_eq!(deepest, 3);

        // each level is a straight chain
        for (_, node) in graph.nodes() {
            assert!(node.children.len() <= 1);
        }
    }

    #[test]
    fn unlinked_and_back_side_portals_spawn_nothing() {
        let mut set = PortalSet::new();
        // unlinked portal straight ahead
        set.insert(Portal::new(Mat4::IDENTITY, Vec2::new(1.0, 1.0)));
        // linked pair that faces away from the camera
        linked_pair(
            &mut set,
            Mat4::from_rotation_y(PI),
            Mat4::from_translation(Vec3::new(50.0, 0.0, 0.0)),
        );

        let mut graph = RenderGraph::new();
        graph.build(
            &set,
            &[looking_neg_z(Vec3::new(0.0, 0.0, 5.0))],
            LayerMask::all(),
            &GraphLimits::default(),
        );

        assert_eq!(graph.len(), 1);
        assert!(graph.get(graph.roots()[0]).unwrap().children.is_empty());
    }

    #[test]
    fn child_mask_goes_through_the_portal_remap() {
        let mut set = PortalSet::new();
        let a = set.insert(Portal::new(Mat4::IDENTITY, Vec2::new(1.0, 1.0)));
        let b = set.insert(Portal::new(
            Mat4::from_translation(Vec3::new(50.0, 0.0, 0.0)),
            Vec2::new(1.0, 1.0),
        ));
        assert!(set.link(a, b));
        {
            let portal = set.get_mut(a).unwrap();
            portal.uses_layers = true;
            portal.layer_remap.set(Layer::PROPS, Layer::DEFAULT);
        }

        let mut graph = RenderGraph::new();
        let mask = LayerMask::WORLD | LayerMask::PROPS;
        graph.build(
            &set,
            &[looking_neg_z(Vec3::new(0.0, 0.0, 5.0))],
            mask,
            &GraphLimits::default(),
        );

        let root = graph.get(graph.roots()[0]).unwrap();
        let child = graph.get(root.children[0]).unwrap();
        assert_eq!(child.cull_mask, LayerMask::WORLD | LayerMask::DEFAULT);
        assert_eq!(root.cull_mask, mask);
    }

    #[test]
    fn one_eye_seeing_a_portal_spawns_it_for_both() {
        let mut set = PortalSet::new();
        // small portal far enough right that only the right eye's frustum
        // catches it
        linked_pair(
            &mut set,
            Mat4::from_translation(Vec3::new(6.5, 0.0, 0.0)),
            Mat4::from_translation(Vec3::new(0.0, 50.0, 0.0)),
        );
        // shrink it after linking
        let (first, _) = set.iter().next().unwrap();
        set.get_mut(first).unwrap().half_extents = Vec2::new(0.2, 0.2);

        let eyes = [
            looking_neg_z(Vec3::new(-0.5, 0.0, 5.0)),
            looking_neg_z(Vec3::new(0.5, 0.0, 5.0)),
        ];
        let mut graph = RenderGraph::new();
        graph.build(&set, &eyes, LayerMask::all(), &GraphLimits::default());

        assert_eq!(graph.roots().len(), 2);
        for &root in graph.roots() {
            assert_eq!(graph.get(root).unwrap().children.len(), 1);
        }
    }

    #[test]
    fn rebuild_replaces_the_previous_frame() {
        let mut set = PortalSet::new();
        linked_pair(
            &mut set,
            Mat4::IDENTITY,
            Mat4::from_translation(Vec3::new(50.0, 0.0, 0.0)),
        );

        let mut graph = RenderGraph::new();
        let eye = looking_neg_z(Vec3::new(0.0, 0.0, 5.0));
        graph.build(&set, &[eye], LayerMask::all(), &GraphLimits::default());
        let first = graph.len();
        graph.build(&set, &[eye], LayerMask::all(), &GraphLimits::default());

        assert_eq!(graph.len(), first);
    }
}
