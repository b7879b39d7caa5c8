use std::fmt;

use glam::Mat4;
use rustc_hash::FxHashMap;

use rift_core::layers::LayerMask;
use rift_core::portal::PortalId;

pub type FrustumPlanes = [[f32; 4]; 6];

/// Normalized left/right/bottom/top/near/far planes of a view-projection,
/// as `ax + by + cz + d` with the inside on the positive side.
pub fn extract_frustum_planes(vp: Mat4) -> FrustumPlanes {
    let m = vp.to_cols_array_2d();
    let row0 = [m[0][0], m[1][0], m[2][0], m[3][0]];
    let row1 = [m[0][1], m[1][1], m[2][1], m[3][1]];
    let row2 = [m[0][2], m[1][2], m[2][2], m[3][2]];
    let row3 = [m[0][3], m[1][3], m[2][3], m[3][3]];

    let planes = [
        [row3[0] + row0[0], row3[1] + row0[1], row3[2] + row0[2], row3[3] + row0[3]],
        [row3[0] - row0[0], row3[1] - row0[1], row3[2] - row0[2], row3[3] - row0[3]],
        [row3[0] + row1[0], row3[1] + row1[1], row3[2] + row1[2], row3[3] + row1[3]],
        [row3[0] - row1[0], row3[1] - row1[1], row3[2] - row1[2], row3[3] - row1[3]],
        [row3[0] + row2[0], row3[1] + row2[1], row3[2] + row2[2], row3[3] + row2[3]],
        [row3[0] - row2[0], row3[1] - row2[1], row3[2] - row2[2], row3[3] - row2[3]],
    ];

    let mut result = [[0.0f32; 4]; 6];
    for (i, p) in planes.iter().enumerate() {
        let len = (p[0] * p[0] + p[1] * p[1] + p[2] * p[2]).sqrt();
        if len > 0.0001 {
            result[i] = [p[0] / len, p[1] / len, p[2] / len, p[3] / len];
        }
    }
    result
}

#[derive(Debug, Clone, Copy)]
pub struct CullRequest {
    pub planes: FrustumPlanes,
    pub mask: LayerMask,
}

/// Opaque receipt for a completed cull, handed back to the draw calls that
/// consume its results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CullToken(pub u32);

#[derive(Debug)]
pub enum CullError {
    /// The backend could not derive culling parameters for this camera.
    BadCamera,
    /// The backend is not in a state where culling is possible.
    Unavailable,
}

impl fmt::Display for CullError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CullError::BadCamera => write!(f, "could not derive culling parameters"),
            CullError::Unavailable => write!(f, "culling backend unavailable"),
        }
    }
}

impl std::error::Error for CullError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetFormat {
    Rgba8,
    Rgba16Float,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetDesc {
    pub width: u32,
    pub height: u32,
    pub layers: u32,
    pub format: TargetFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetHandle(pub u32);

/// Everything a nested pass saves before diverting the pipeline and
/// restores on pop. `target: None` means the main target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderState {
    pub view: Mat4,
    pub projection: Mat4,
    pub target: Option<TargetHandle>,
    pub shadows: bool,
    pub stencil_ref: u32,
}

/// The scene cull/draw collaborator. Geometry, materials and the shadow
/// implementation are all on the far side of this seam.
pub trait SceneBackend {
    fn cull(&mut self, request: &CullRequest) -> Result<CullToken, CullError>;
    /// Per-view shadow setup. Returns false when shadows could not be set
    /// up and the view should draw unshadowed.
    fn prepare_shadows(&mut self, state: &RenderState, token: CullToken) -> bool;
    /// `token: None` draws conservatively without cull results.
    fn draw_scene(&mut self, state: &RenderState, token: Option<CullToken>, shadows: bool);
}

/// Offscreen target lease. A released handle may be reused by the next
/// request; its contents stay valid until then.
pub trait RenderTargets {
    fn request(&mut self, desc: &TargetDesc) -> TargetHandle;
    fn release(&mut self, handle: TargetHandle);
}

/// What a surface composite gets to work with when a child pass finishes.
#[derive(Debug, Clone, Copy)]
pub struct PaintContext {
    pub portal: PortalId,
    /// Portal surface local-to-world, for placing the surface quad.
    pub surface: Mat4,
    /// The parent state the composite draws into.
    pub state: RenderState,
    /// Child color target under the texture strategy, `None` for stencil.
    pub source: Option<TargetHandle>,
    /// Pixel rect the child occupies on the parent target.
    pub viewport: (u32, u32, u32, u32),
    pub stencil_ref: u32,
}

pub trait SurfacePainter {
    /// Stencil-strategy entry hook, called right after the child frame is
    /// pushed and before anything in the child view draws. `ctx.state` is
    /// the parent state the silhouette is drawn under; `ctx.stencil_ref` is
    /// the child's reference the mask raises the silhouette to.
    fn mask(&mut self, _ctx: &PaintContext, _backend: &mut dyn SceneBackend) {}

    fn paint(&mut self, ctx: &PaintContext, backend: &mut dyn SceneBackend);
}

/// Composite that draws nothing. Keeps unregistered portals harmless.
pub struct NullPainter;

impl SurfacePainter for NullPainter {
    fn paint(&mut self, _ctx: &PaintContext, _backend: &mut dyn SceneBackend) {}
}

/// Painter fan-out keyed by portal id, with a shared fallback. A small
/// closed set of painter implementations hangs off the trait; nothing here
/// inspects concrete types.
pub struct PainterRegistry {
    painters: FxHashMap<PortalId, Box<dyn SurfacePainter>>,
    fallback: Box<dyn SurfacePainter>,
}

impl Default for PainterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PainterRegistry {
    pub fn new() -> Self {
        Self {
            painters: FxHashMap::default(),
            fallback: Box::new(NullPainter),
        }
    }

    pub fn with_fallback(fallback: Box<dyn SurfacePainter>) -> Self {
        Self {
            painters: FxHashMap::default(),
            fallback,
        }
    }

    pub fn insert(&mut self, portal: PortalId, painter: Box<dyn SurfacePainter>) {
        self.painters.insert(portal, painter);
    }

    pub fn remove(&mut self, portal: PortalId) {
        self.painters.remove(&portal);
    }

    pub fn for_portal(&mut self, portal: PortalId) -> &mut dyn SurfacePainter {
        match self.painters.get_mut(&portal) {
            Some(painter) => painter.as_mut(),
            None => self.fallback.as_mut(),
        }
    }
}

/// Backend fake that records every call. Used by pass and graph tests and
/// by the headless tools' dry-run mode.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    pub culls: Vec<CullRequest>,
    pub draws: Vec<(RenderState, Option<CullToken>, bool)>,
    pub shadow_preps: u32,
    pub fail_cull: bool,
    pub fail_shadows: bool,
    next_token: u32,
}

impl SceneBackend for RecordingBackend {
    fn cull(&mut self, request: &CullRequest) -> Result<CullToken, CullError> {
        if self.fail_cull {
            return Err(CullError::BadCamera);
        }
        self.culls.push(*request);
        let token = CullToken(self.next_token);
        self.next_token += 1;
        Ok(token)
    }

    fn prepare_shadows(&mut self, _state: &RenderState, _token: CullToken) -> bool {
        if self.fail_shadows {
            return false;
        }
        self.shadow_preps += 1;
        true
    }

    fn draw_scene(&mut self, state: &RenderState, token: Option<CullToken>, shadows: bool) {
        self.draws.push((*state, token, shadows));
    }
}

/// Target pool fake that only counts leases.
#[derive(Debug, Default)]
pub struct CountingTargets {
    pub live: u32,
    pub peak: u32,
    pub requests: Vec<TargetDesc>,
    next: u32,
}

impl RenderTargets for CountingTargets {
    fn request(&mut self, desc: &TargetDesc) -> TargetHandle {
        self.live += 1;
        self.peak = self.peak.max(self.live);
        self.requests.push(*desc);
        let handle = TargetHandle(self.next);
        self.next += 1;
        handle
    }

    fn release(&mut self, _handle: TargetHandle) {
        self.live = self.live.saturating_sub(1);
    }
}
