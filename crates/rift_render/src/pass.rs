use glam::Mat4;
use tracing::{debug, error, warn};

use rift_core::layers::LayerMask;
use rift_core::portal::{PortalId, PortalSet};

use crate::backend::{
    extract_frustum_planes, CullRequest, PaintContext, PainterRegistry, RenderState,
    RenderTargets, SceneBackend, TargetDesc, TargetFormat, TargetHandle,
};
use crate::camera::clip_projection_at_plane;
use crate::graph::{NodeId, RenderGraph};
use crate::settings::{RenderSettings, RenderStrategy};

/// One nested view in flight: the parent state to restore, the state the
/// child draws with, and the target leased for it, if any.
#[derive(Debug, Clone, Copy)]
struct PassFrame {
    node: NodeId,
    portal: PortalId,
    /// Entry surface local-to-world, captured at push time.
    surface: Mat4,
    saved: RenderState,
    state: RenderState,
    target: Option<TargetHandle>,
    viewport: (u32, u32, u32, u32),
}

/// Counters for one `execute` call. Push/pop imbalance and contract
/// violations both mean a bug in the caller or the graph, not bad content.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassStats {
    pub pushes: u32,
    pub pops: u32,
    pub drawn_nodes: u32,
    pub skipped_nodes: u32,
    pub truncated_nodes: u32,
    pub shadow_fallbacks: u32,
    pub pooled_targets: u32,
    pub contract_violations: u32,
}

/// Drives a built [`RenderGraph`] depth-first: draw a view, then for each
/// child push a frame, draw the child's subtree, pop and composite the
/// result onto the entry surface. The stack is explicit so a misnested
/// begin/complete shows up as a counted violation instead of corrupting
/// the parent view.
///
/// All pipeline work goes through the [`SceneBackend`], [`RenderTargets`]
/// and [`PainterRegistry`] seams; several stacks over the same backend are
/// fine as long as their executes do not interleave.
pub struct PortalPassStack {
    settings: RenderSettings,
    stack: Vec<PassFrame>,
    stats: PassStats,
}

impl PortalPassStack {
    pub fn new(settings: RenderSettings) -> Self {
        Self {
            settings: settings.sanitize(),
            stack: Vec::new(),
            stats: PassStats::default(),
        }
    }

    pub fn settings(&self) -> &RenderSettings {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: RenderSettings) {
        self.settings = settings.sanitize();
    }

    /// Number of nested passes currently in flight.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn stats(&self) -> PassStats {
        self.stats
    }

    /// Renders the subtree under `root`, which draws to the main target
    /// with `target_size` pixels. Returns the counters for this call.
    #[allow(clippy::too_many_arguments)]
    pub fn execute(
        &mut self,
        graph: &RenderGraph,
        root: NodeId,
        target_size: (u32, u32),
        portals: &PortalSet,
        backend: &mut dyn SceneBackend,
        targets: &mut dyn RenderTargets,
        painters: &mut PainterRegistry,
    ) -> PassStats {
        self.stats = PassStats::default();
        self.stack.clear();

        let Some(node) = graph.get(root) else {
            error!("portal pass cannot resolve its root node");
            self.stats.contract_violations += 1;
            return self.stats;
        };
        if !node.valid {
            debug!("portal pass root was invalidated, nothing to draw");
            self.stats.skipped_nodes += 1;
            return self.stats;
        }

        let state = RenderState {
            view: node.camera.view_matrix(),
            projection: node.camera.projection_matrix(),
            target: None,
            shadows: self.settings.shadows,
            stencil_ref: 0,
        };
        self.draw_with_children(
            graph,
            root,
            &state,
            target_size,
            portals,
            backend,
            targets,
            painters,
        );

        if !self.stack.is_empty() {
            error!(
                "portal pass finished with {} unbalanced frames",
                self.stack.len()
            );
            self.stats.contract_violations += self.stack.len() as u32;
            self.stack.clear();
        }
        self.stats
    }

    /// Pushes a frame for `child` and returns the state its subtree draws
    /// with. `None` means the child was skipped and no frame was pushed.
    #[allow(clippy::too_many_arguments)]
    pub fn begin_pass(
        &mut self,
        graph: &RenderGraph,
        child: NodeId,
        parent_state: &RenderState,
        target_size: (u32, u32),
        portals: &PortalSet,
        targets: &mut dyn RenderTargets,
    ) -> Option<RenderState> {
        let Some(node) = graph.get(child) else {
            error!("portal pass cannot resolve a child node");
            self.stats.contract_violations += 1;
            return None;
        };
        if !node.valid {
            debug!("skipping an invalidated portal view");
            self.stats.skipped_nodes += 1;
            return None;
        }
        if node.depth > self.settings.max_recursion_depth {
            self.stats.truncated_nodes += 1;
            return None;
        }
        let Some(portal_id) = node.portal else {
            error!("non-root render node carries no portal");
            self.stats.contract_violations += 1;
            return None;
        };
        let Some(portal) = portals.get(portal_id) else {
            warn!("portal destroyed between graph build and pass execution");
            self.stats.skipped_nodes += 1;
            return None;
        };
        let Some(partner) = portals.partner_of(portal_id).and_then(|id| portals.get(id))
        else {
            warn!("portal unlinked between graph build and pass execution");
            self.stats.skipped_nodes += 1;
            return None;
        };

        let view = node.camera.view_matrix();
        let eye = node.camera.position();
        let viewport = node.window.viewport_rect(target_size.0, target_size.1);

        let (state, target) = match self.settings.strategy {
            RenderStrategy::Stencil => {
                // the child shares the parent target; anything between the
                // virtual camera and the exit surface is only clipped away
                // when the projection refit is on
                let projection = if self.settings.refit_stencil_projection {
                    clip_projection_at_plane(
                        view,
                        parent_state.projection,
                        partner.center(),
                        partner.normal(),
                        eye,
                    )
                } else {
                    parent_state.projection
                };
                let state = RenderState {
                    view,
                    projection,
                    target: parent_state.target,
                    shadows: parent_state.shadows,
                    stencil_ref: parent_state.stencil_ref + 1,
                };
                (state, None)
            }
            RenderStrategy::Texture => {
                let scale = self.settings.target_scale;
                let desc = TargetDesc {
                    width: ((viewport.2 as f32 * scale) as u32).max(1),
                    height: ((viewport.3 as f32 * scale) as u32).max(1),
                    layers: 1,
                    format: TargetFormat::Rgba8,
                };
                let handle = targets.request(&desc);
                self.stats.pooled_targets += 1;

                let fitted = node.camera.window_fit_projection(&node.window);
                let projection = clip_projection_at_plane(
                    view,
                    fitted,
                    partner.center(),
                    partner.normal(),
                    eye,
                );
                let state = RenderState {
                    view,
                    projection,
                    target: Some(handle),
                    shadows: parent_state.shadows,
                    stencil_ref: 0,
                };
                (state, Some(handle))
            }
        };

        self.stack.push(PassFrame {
            node: child,
            portal: portal_id,
            surface: portal.pose(),
            saved: *parent_state,
            state,
            target,
            viewport,
        });
        self.stats.pushes += 1;
        Some(state)
    }

    /// Pops the innermost frame, releases its target and composites the
    /// child onto the entry surface under the restored parent state. The
    /// released target stays readable until the next lease, so the painter
    /// may still sample it.
    pub fn complete_pass(
        &mut self,
        expected: NodeId,
        backend: &mut dyn SceneBackend,
        targets: &mut dyn RenderTargets,
        painters: &mut PainterRegistry,
    ) {
        let Some(frame) = self.stack.pop() else {
            error!("portal pass completion without a matching begin");
            self.stats.contract_violations += 1;
            return;
        };
        if frame.node != expected {
            error!("portal pass completions are out of order");
            self.stats.contract_violations += 1;
        }
        if let Some(handle) = frame.target {
            targets.release(handle);
        }

        let ctx = PaintContext {
            portal: frame.portal,
            surface: frame.surface,
            state: frame.saved,
            source: frame.target,
            viewport: frame.viewport,
            stencil_ref: frame.state.stencil_ref,
        };
        painters.for_portal(frame.portal).paint(&ctx, backend);
        self.stats.pops += 1;
    }

    #[allow(clippy::too_many_arguments)]
    fn draw_with_children(
        &mut self,
        graph: &RenderGraph,
        id: NodeId,
        state: &RenderState,
        target_size: (u32, u32),
        portals: &PortalSet,
        backend: &mut dyn SceneBackend,
        targets: &mut dyn RenderTargets,
        painters: &mut PainterRegistry,
    ) {
        let Some(node) = graph.get(id) else {
            return;
        };
        self.draw_view(state, node.cull_mask, backend);

        for &child in &node.children {
            let Some(child_state) =
                self.begin_pass(graph, child, state, target_size, portals, targets)
            else {
                continue;
            };
            // the stencil silhouette goes in before the child view draws
            if self.settings.strategy == RenderStrategy::Stencil {
                if let Some(frame) = self.stack.last() {
                    let ctx = PaintContext {
                        portal: frame.portal,
                        surface: frame.surface,
                        state: frame.saved,
                        source: None,
                        viewport: frame.viewport,
                        stencil_ref: frame.state.stencil_ref,
                    };
                    painters.for_portal(ctx.portal).mask(&ctx, backend);
                }
            }
            self.draw_with_children(
                graph,
                child,
                &child_state,
                target_size,
                portals,
                backend,
                targets,
                painters,
            );
            self.complete_pass(child, backend, targets, painters);
        }
    }

    /// Cull, shadow setup, scene draw. A failed cull still draws, unculled
    /// and unshadowed, so one bad camera never blanks the whole view.
    fn draw_view(&mut self, state: &RenderState, mask: LayerMask, backend: &mut dyn SceneBackend) {
        let request = CullRequest {
            planes: extract_frustum_planes(state.projection * state.view),
            mask,
        };
        let (token, shadows) = match backend.cull(&request) {
            Ok(token) => {
                let mut shadows = state.shadows;
                if shadows && !backend.prepare_shadows(state, token) {
                    self.stats.shadow_fallbacks += 1;
                    shadows = false;
                }
                (Some(token), shadows)
            }
            Err(err) => {
                warn!("culling a portal view failed, drawing unculled: {err}");
                if state.shadows {
                    self.stats.shadow_fallbacks += 1;
                }
                (None, false)
            }
        };
        backend.draw_scene(state, token, shadows);
        self.stats.drawn_nodes += 1;
    }
}
