use glam::{Mat4, Vec3};
use tracing::debug;

use crate::layers::LayerMask;
use crate::math::safe_normalize;
use crate::portal::{Portal, PortalId, PortalSet};

const CROSS_EPS: f32 = 0.001;

/// A pointer path as a pure function of its parameter. Curved paths are
/// sampled into a polyline in one call instead of being traced over frames.
#[derive(Debug, Clone, Copy)]
pub enum CastPath {
    Straight {
        origin: Vec3,
        direction: Vec3,
        max_distance: f32,
    },
    Parabolic {
        origin: Vec3,
        velocity: Vec3,
        gravity: Vec3,
        duration: f32,
    },
    Bezier {
        points: [Vec3; 4],
    },
}

impl CastPath {
    /// Position along the path at `t` in `[0, 1]`.
    pub fn point_at(&self, t: f32) -> Vec3 {
        let t = t.clamp(0.0, 1.0);
        match *self {
            CastPath::Straight {
                origin,
                direction,
                max_distance,
            } => origin + safe_normalize(direction, Vec3::NEG_Z) * (t * max_distance),
            CastPath::Parabolic {
                origin,
                velocity,
                gravity,
                duration,
            } => {
                let s = t * duration;
                origin + velocity * s + gravity * (0.5 * s * s)
            }
            CastPath::Bezier { points } => {
                let u = 1.0 - t;
                points[0] * (u * u * u)
                    + points[1] * (3.0 * u * u * t)
                    + points[2] * (3.0 * u * t * t)
                    + points[3] * (t * t * t)
            }
        }
    }

    /// Samples the path into `segments + 1` points, endpoints included.
    pub fn polyline(&self, segments: usize) -> Vec<Vec3> {
        let segments = segments.max(1);
        (0..=segments)
            .map(|i| self.point_at(i as f32 / segments as f32))
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CastLimits {
    pub max_crossings: u32,
    pub samples: u32,
    pub scene_mask: LayerMask,
    pub max_scene_distance: f32,
}

impl Default for CastLimits {
    fn default() -> Self {
        Self {
            max_crossings: 8,
            samples: 32,
            scene_mask: LayerMask::all().difference(LayerMask::PORTAL_SURFACE),
            max_scene_distance: 256.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SceneHit {
    pub point: Vec3,
    pub normal: Vec3,
    pub distance: f32,
}

/// Scene geometry query the caster delegates to after the portal walk.
/// `direction` is unit length, so `distance` is in world units.
pub trait SceneRaycaster {
    fn raycast(
        &self,
        origin: Vec3,
        direction: Vec3,
        max_distance: f32,
        mask: LayerMask,
    ) -> Option<SceneHit>;
}

#[derive(Debug, Clone, Copy)]
pub struct PortalCrossing {
    pub portal: PortalId,
    /// Crossing point on the entry surface, in the frame the path was
    /// travelling in when it arrived.
    pub point: Vec3,
    pub direction: Vec3,
}

#[derive(Debug, Clone)]
pub struct PortalCast {
    pub crossings: Vec<PortalCrossing>,
    /// The sampled path with every post-crossing point carried into the
    /// frame it physically appears in, so the beam renders piecewise.
    pub polyline: Vec<Vec3>,
    pub hit: Option<SceneHit>,
    /// `hit` carried back through the crossings in reverse, in the origin
    /// frame, for cursor presentation.
    pub presented_hit: Option<SceneHit>,
    pub truncated: bool,
}

impl PortalCast {
    /// Crossed portal ids in order, the shape `teleport_difference` expects.
    pub fn crossing_sequence(&self) -> Vec<PortalId> {
        self.crossings.iter().map(|c| c.portal).collect()
    }
}

/// Walks `path` segment by segment against the portal set only, teleporting
/// the remaining polyline at each crossing, then issues a single scene
/// raycast in the fully transformed frame, along the final segment's heading
/// and no farther than the remaining path length. Crossings beyond
/// `max_crossings` truncate the walk instead of erroring.
pub fn cast_through_portals(
    portals: &PortalSet,
    path: &CastPath,
    limits: &CastLimits,
    scene: &dyn SceneRaycaster,
) -> PortalCast {
    let mut points = path.polyline(limits.samples.max(1) as usize);
    let mut crossings: Vec<PortalCrossing> = Vec::new();
    let mut truncated = false;
    let mut frame_origin = points[0];
    let mut frame_start = 0;

    let mut i = 0;
    while i + 1 < points.len() {
        let p0 = points[i];
        let p1 = points[i + 1];

        let mut nearest: Option<(PortalId, f32, Vec3)> = None;
        for (id, portal) in portals.iter() {
            if !portal.is_linked() {
                continue;
            }
            let Some((t, point)) = segment_crossing(portal, p0, p1) else {
                continue;
            };
            if nearest.map_or(true, |(_, best, _)| t < best) {
                nearest = Some((id, t, point));
            }
        }

        let Some((id, _, point)) = nearest else {
            i += 1;
            continue;
        };

        if crossings.len() >= limits.max_crossings as usize {
            truncated = true;
            break;
        }
        let Some(teleport) = portals.teleport_matrix(id) else {
            debug!("portal lost its link mid-cast, ignoring the crossing");
            i += 1;
            continue;
        };

        crossings.push(PortalCrossing {
            portal: id,
            point,
            direction: safe_normalize(p1 - p0, Vec3::NEG_Z),
        });

        // Continue the same segment from the crossing point, with the rest
        // of the polyline carried into the exit frame. The exit surface
        // itself cannot re-trigger: the carried point sits at zero depth.
        points[i] = point;
        for p in points.iter_mut().skip(i) {
            *p = teleport.transform_point3(*p);
        }
        frame_origin = points[i];
        frame_start = i;
    }

    // The scene ray leaves along the path's final heading and never reaches
    // past the pointer's own remaining length.
    let end = points[points.len() - 1];
    let mut direction = safe_normalize(end - points[points.len() - 2], Vec3::ZERO);
    if direction == Vec3::ZERO {
        direction = safe_normalize(end - frame_origin, Vec3::NEG_Z);
    }
    let reach: f32 = points[frame_start..]
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).length())
        .sum();

    let hit = scene.raycast(
        frame_origin,
        direction,
        reach.min(limits.max_scene_distance),
        limits.scene_mask,
    );

    let mut undo = Mat4::IDENTITY;
    for crossing in crossings.iter().rev() {
        let Some(partner) = portals.partner_of(crossing.portal) else {
            continue;
        };
        let Some(back) = portals.teleport_matrix(partner) else {
            continue;
        };
        undo = back * undo;
    }
    let presented_hit = hit.map(|h| SceneHit {
        point: undo.transform_point3(h.point),
        normal: safe_normalize(undo.transform_vector3(h.normal), h.normal),
        distance: h.distance,
    });

    PortalCast {
        crossings,
        polyline: points,
        hit,
        presented_hit,
        truncated,
    }
}

/// Front-side plane crossing within one segment, then a bounds check in the
/// portal's local frame. Mirrors the eye-crossing test used for physical
/// teleports.
fn segment_crossing(portal: &Portal, p0: Vec3, p1: Vec3) -> Option<(f32, Vec3)> {
    let normal = portal.normal();
    let center = portal.center();
    let d0 = (p0 - center).dot(normal);
    let d1 = (p1 - center).dot(normal);
    if !(d0 > CROSS_EPS && d1 <= CROSS_EPS) {
        return None;
    }

    let denom = d0 - d1;
    if denom.abs() <= f32::EPSILON {
        return None;
    }

    let t = (d0 / denom).clamp(0.0, 1.0);
    let point = p0.lerp(p1, t);
    let local = portal.pose().inverse().transform_point3(point);
    if local.x.abs() > portal.half_extents.x || local.y.abs() > portal.half_extents.y {
        return None;
    }
    Some((t, point))
}
