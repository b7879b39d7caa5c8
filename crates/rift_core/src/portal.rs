use glam::{Mat4, Vec2, Vec3};
use rustc_hash::FxHashMap;
use tracing::warn;

use crate::layers::{Layer, LayerMask, LayerRemap, Tag};
use crate::math::{flip_y, safe_normalize, Aabb};
use crate::trace::Teleportable;

/// Portal surfaces are flat quads, but window culling projects a thin slab so
/// a surface seen edge-on still produces a non-degenerate window.
pub const PORTAL_SLAB_HALF_DEPTH: f32 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortalId {
    index: u32,
    generation: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct PortalLink {
    pub partner: PortalId,
    /// World-to-world mapping: a point entering this portal's front face
    /// reappears at the partner, turned half way around.
    pub teleport: Mat4,
}

#[derive(Debug, Clone)]
pub struct Portal {
    pose: Mat4,
    pub half_extents: Vec2,
    pub uses_teleport: bool,
    pub uses_tag: bool,
    pub uses_layers: bool,
    pub tag_map: FxHashMap<Tag, Tag>,
    pub layer_remap: LayerRemap,
    link: Option<PortalLink>,
}

impl Portal {
    pub fn new(pose: Mat4, half_extents: Vec2) -> Self {
        Self {
            pose,
            half_extents,
            uses_teleport: true,
            uses_tag: false,
            uses_layers: false,
            tag_map: FxHashMap::default(),
            layer_remap: LayerRemap::default(),
            link: None,
        }
    }

    pub fn pose(&self) -> Mat4 {
        self.pose
    }

    pub fn link(&self) -> Option<&PortalLink> {
        self.link.as_ref()
    }

    pub fn is_linked(&self) -> bool {
        self.link.is_some()
    }

    pub fn center(&self) -> Vec3 {
        self.pose.transform_point3(Vec3::ZERO)
    }

    pub fn normal(&self) -> Vec3 {
        safe_normalize(self.pose.transform_vector3(Vec3::Z), Vec3::Z)
    }

    /// Thin slab around the surface quad, in portal-local units.
    pub fn local_bounds(&self) -> Aabb {
        Aabb::from_half_extents(Vec3::new(
            self.half_extents.x,
            self.half_extents.y,
            PORTAL_SLAB_HALF_DEPTH,
        ))
    }

    pub fn modify_matrix(&self, matrix: Mat4) -> Mat4 {
        match &self.link {
            Some(link) if self.uses_teleport => link.teleport * matrix,
            _ => matrix,
        }
    }

    pub fn modify_point(&self, point: Vec3) -> Vec3 {
        match &self.link {
            Some(link) if self.uses_teleport => link.teleport.transform_point3(point),
            _ => point,
        }
    }

    pub fn modify_vector(&self, vector: Vec3) -> Vec3 {
        match &self.link {
            Some(link) if self.uses_teleport => link.teleport.transform_vector3(vector),
            _ => vector,
        }
    }

    pub fn modify_direction(&self, direction: Vec3) -> Vec3 {
        safe_normalize(self.modify_vector(direction), direction)
    }

    pub fn modify_tag(&self, tag: Tag) -> Tag {
        if self.uses_tag {
            self.tag_map.get(&tag).copied().unwrap_or(tag)
        } else {
            tag
        }
    }

    pub fn modify_layer(&self, layer: Layer) -> Layer {
        if self.uses_layers {
            self.layer_remap.remap(layer)
        } else {
            layer
        }
    }

    pub fn modify_layer_mask(&self, mask: LayerMask) -> LayerMask {
        if self.uses_layers {
            self.layer_remap.remap_mask(mask)
        } else {
            mask
        }
    }

    /// One full crossing: matrix, tag and layer, each gated by its capability
    /// flag. Unlinked portals leave the target untouched.
    pub fn teleport(&self, target: &mut dyn Teleportable) {
        if self.link.is_none() {
            return;
        }
        if self.uses_teleport {
            target.set_world_matrix(self.modify_matrix(target.world_matrix()));
        }
        if self.uses_tag {
            target.set_tag(self.modify_tag(target.tag()));
        }
        if self.uses_layers {
            target.set_layer(self.modify_layer(target.layer()));
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    portal: Option<Portal>,
}

/// Generational arena of portals. Stale ids resolve to `None`, which is how
/// every consumer observes a destroyed portal.
#[derive(Debug, Default)]
pub struct PortalSet {
    slots: Vec<Slot>,
}

impl PortalSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, portal: Portal) -> PortalId {
        if let Some(index) = self.slots.iter().position(|slot| slot.portal.is_none()) {
            let slot = &mut self.slots[index];
            slot.portal = Some(portal);
            return PortalId {
                index: index as u32,
                generation: slot.generation,
            };
        }

        self.slots.push(Slot {
            generation: 0,
            portal: Some(portal),
        });
        PortalId {
            index: (self.slots.len() - 1) as u32,
            generation: 0,
        }
    }

    pub fn remove(&mut self, id: PortalId) -> Option<Portal> {
        self.unlink(id);
        let slot = self.slot_mut(id)?;
        let portal = slot.portal.take();
        if portal.is_some() {
            slot.generation = slot.generation.wrapping_add(1);
        }
        portal
    }

    pub fn get(&self, id: PortalId) -> Option<&Portal> {
        self.slot(id)?.portal.as_ref()
    }

    pub fn get_mut(&mut self, id: PortalId) -> Option<&mut Portal> {
        self.slot_mut(id)?.portal.as_mut()
    }

    pub fn contains(&self, id: PortalId) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.portal.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (PortalId, &Portal)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            let portal = slot.portal.as_ref()?;
            Some((
                PortalId {
                    index: index as u32,
                    generation: slot.generation,
                },
                portal,
            ))
        })
    }

    /// Pairs `a` with `b`, replacing any previous pairing on either side, and
    /// writes the two mutually inverse teleport matrices.
    pub fn link(&mut self, a: PortalId, b: PortalId) -> bool {
        if a == b {
            warn!("refusing to link a portal to itself");
            return false;
        }
        if !self.contains(a) || !self.contains(b) {
            warn!("cannot link: unresolvable portal id");
            return false;
        }

        self.unlink(a);
        self.unlink(b);

        let pose_a = self.get(a).map(Portal::pose).unwrap_or(Mat4::IDENTITY);
        let pose_b = self.get(b).map(Portal::pose).unwrap_or(Mat4::IDENTITY);

        if let Some(portal) = self.get_mut(a) {
            portal.link = Some(PortalLink {
                partner: b,
                teleport: teleport_between(pose_a, pose_b),
            });
        }
        if let Some(portal) = self.get_mut(b) {
            portal.link = Some(PortalLink {
                partner: a,
                teleport: teleport_between(pose_b, pose_a),
            });
        }
        true
    }

    /// Clears the pairing on `id` and on its partner, if any.
    pub fn unlink(&mut self, id: PortalId) {
        let partner = self.partner_of(id);
        if let Some(portal) = self.get_mut(id) {
            portal.link = None;
        }
        if let Some(partner) = partner {
            if let Some(portal) = self.get_mut(partner) {
                portal.link = None;
            }
        }
    }

    pub fn partner_of(&self, id: PortalId) -> Option<PortalId> {
        Some(self.get(id)?.link()?.partner)
    }

    /// Updates a pose and refreshes the teleport matrices of the pairing it
    /// participates in. Poses are only mutable through here so a stale
    /// teleport matrix cannot survive a move.
    pub fn set_pose(&mut self, id: PortalId, pose: Mat4) {
        let Some(portal) = self.get_mut(id) else {
            return;
        };
        portal.pose = pose;
        if let Some(partner) = self.partner_of(id) {
            let pose_partner = self
                .get(partner)
                .map(Portal::pose)
                .unwrap_or(Mat4::IDENTITY);
            if let Some(portal) = self.get_mut(id) {
                portal.link = Some(PortalLink {
                    partner,
                    teleport: teleport_between(pose, pose_partner),
                });
            }
            if let Some(portal) = self.get_mut(partner) {
                portal.link = Some(PortalLink {
                    partner: id,
                    teleport: teleport_between(pose_partner, pose),
                });
            }
        }
    }

    /// The net matrix one crossing of `id` applies, identity for a linked
    /// portal whose teleport capability is off, `None` when the crossing
    /// cannot be resolved at all.
    pub fn teleport_matrix(&self, id: PortalId) -> Option<Mat4> {
        let portal = self.get(id)?;
        let link = portal.link()?;
        Some(if portal.uses_teleport {
            link.teleport
        } else {
            Mat4::IDENTITY
        })
    }

    fn slot(&self, id: PortalId) -> Option<&Slot> {
        let slot = self.slots.get(id.index as usize)?;
        (slot.generation == id.generation).then_some(slot)
    }

    fn slot_mut(&mut self, id: PortalId) -> Option<&mut Slot> {
        let slot = self.slots.get_mut(id.index as usize)?;
        (slot.generation == id.generation).then_some(slot)
    }
}

fn teleport_between(entry_pose: Mat4, exit_pose: Mat4) -> Mat4 {
    exit_pose * flip_y() * entry_pose.inverse()
}

#[cfg(test)]
mod tests {
    use glam::{Mat4, Quat, Vec2, Vec3};

    use super::{Portal, PortalSet};
    use crate::layers::{Layer, LayerMask, Tag};

    fn set_with_pair(pose_a: Mat4, pose_b: Mat4) -> (PortalSet, super::PortalId, super::PortalId) {
        let mut set = PortalSet::new();
        let a = set.insert(Portal::new(pose_a, Vec2::new(1.0, 2.0)));
        let b = set.insert(Portal::new(pose_b, Vec2::new(1.0, 2.0)));
        assert!(set.link(a, b));
        (set, a, b)
    }

    #[test]
    fn linked_teleports_are_mutually_inverse() {
        let pose_a = Mat4::from_rotation_translation(
            Quat::from_rotation_y(0.7),
            Vec3::new(1.0, 2.0, 3.0),
        );
        let pose_b = Mat4::from_rotation_translation(
            Quat::from_rotation_x(-0.3),
            Vec3::new(-4.0, 0.5, 9.0),
        );
        let (set, a, b) = set_with_pair(pose_a, pose_b);

        let t_ab = set.teleport_matrix(a).unwrap();
        let t_ba = set.teleport_matrix(b).unwrap();
        let round_trip = t_ba * t_ab;
        let p = Vec3::new(0.2, -1.0, 4.0);
        assert!((round_trip.transform_point3(p) - p).length() < 1e-4);
    }

    #[test]
    fn identity_pair_maps_front_to_back() {
        let (set, a, _) = set_with_pair(
            Mat4::IDENTITY,
            Mat4::from_translation(Vec3::new(10.0, 0.0, 0.0)),
        );

        let mapped = set
            .get(a)
            .unwrap()
            .modify_point(Vec3::new(0.0, 0.0, 1.0));
        assert!((mapped - Vec3::new(10.0, 0.0, -1.0)).length() < 1e-5);
    }

    #[test]
    fn removing_a_portal_unlinks_its_partner() {
        let (mut set, a, b) = set_with_pair(Mat4::IDENTITY, Mat4::IDENTITY);
        assert!(set.get(b).unwrap().is_linked());

        set.remove(a);
        assert!(set.get(a).is_none());
        assert!(!set.get(b).unwrap().is_linked());
        assert!(set.teleport_matrix(b).is_none());
    }

    #[test]
    fn stale_ids_do_not_resolve_after_reuse() {
        let mut set = PortalSet::new();
        let a = set.insert(Portal::new(Mat4::IDENTITY, Vec2::ONE));
        set.remove(a);
        let reused = set.insert(Portal::new(Mat4::IDENTITY, Vec2::ONE));

        assert!(set.get(a).is_none());
        assert!(set.get(reused).is_some());
        assert_ne!(a, reused);
    }

    #[test]
    fn relink_replaces_previous_pairing() {
        let mut set = PortalSet::new();
        let a = set.insert(Portal::new(Mat4::IDENTITY, Vec2::ONE));
        let b = set.insert(Portal::new(Mat4::IDENTITY, Vec2::ONE));
        let c = set.insert(Portal::new(Mat4::IDENTITY, Vec2::ONE));

        assert!(set.link(a, b));
        assert!(set.link(a, c));

        assert_eq!(set.partner_of(a), Some(c));
        assert_eq!(set.partner_of(c), Some(a));
        assert_eq!(set.partner_of(b), None);
    }

    #[test]
    fn moving_a_portal_refreshes_both_teleports() {
        let (mut set, a, b) = set_with_pair(
            Mat4::IDENTITY,
            Mat4::from_translation(Vec3::new(5.0, 0.0, 0.0)),
        );

        set.set_pose(b, Mat4::from_translation(Vec3::new(0.0, 7.0, 0.0)));

        let mapped = set.get(a).unwrap().modify_point(Vec3::ZERO);
        assert!((mapped - Vec3::new(0.0, 7.0, 0.0)).length() < 1e-5);

        let t_ab = set.teleport_matrix(a).unwrap();
        let t_ba = set.teleport_matrix(b).unwrap();
        let p = Vec3::new(1.0, 1.0, 1.0);
        assert!(((t_ba * t_ab).transform_point3(p) - p).length() < 1e-4);
    }

    #[test]
    fn capability_flags_gate_each_channel() {
        let (mut set, a, _) = set_with_pair(
            Mat4::IDENTITY,
            Mat4::from_translation(Vec3::new(3.0, 0.0, 0.0)),
        );
        {
            let portal = set.get_mut(a).unwrap();
            portal.uses_teleport = false;
            portal.uses_tag = true;
            portal.tag_map.insert(Tag(1), Tag(2));
            portal.uses_layers = true;
            portal.layer_remap.set(Layer::PROPS, Layer(9));
        }

        let portal = set.get(a).unwrap();
        let p = Vec3::new(0.5, 0.5, 0.5);
        assert_eq!(portal.modify_point(p), p);
        assert_eq!(set.teleport_matrix(a), Some(Mat4::IDENTITY));
        assert_eq!(portal.modify_tag(Tag(1)), Tag(2));
        assert_eq!(portal.modify_tag(Tag(7)), Tag(7));
        assert_eq!(
            portal.modify_layer_mask(LayerMask::PROPS),
            Layer(9).mask()
        );
    }
}
