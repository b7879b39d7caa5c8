use std::collections::VecDeque;

use glam::Mat4;
use tracing::{debug, warn};

use crate::layers::{Layer, Tag};
use crate::portal::{PortalId, PortalSet};

/// What a crossing mutates on a tracked object. Trigger detection lives
/// outside the core; it calls into [`PortalTrace`] with ids and one of these.
pub trait Teleportable {
    fn world_matrix(&self) -> Mat4;
    fn set_world_matrix(&mut self, matrix: Mat4);
    fn tag(&self) -> Tag;
    fn set_tag(&mut self, tag: Tag);
    fn layer(&self) -> Layer;
    fn set_layer(&mut self, layer: Layer);
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackedBody {
    pub matrix: Mat4,
    pub tag: Tag,
    pub layer: Layer,
}

impl TrackedBody {
    pub fn at(matrix: Mat4) -> Self {
        Self {
            matrix,
            tag: Tag::NONE,
            layer: Layer::DEFAULT,
        }
    }
}

impl Teleportable for TrackedBody {
    fn world_matrix(&self) -> Mat4 {
        self.matrix
    }

    fn set_world_matrix(&mut self, matrix: Mat4) {
        self.matrix = matrix;
    }

    fn tag(&self) -> Tag {
        self.tag
    }

    fn set_tag(&mut self, tag: Tag) {
        self.tag = tag;
    }

    fn layer(&self) -> Layer {
        self.layer
    }

    fn set_layer(&mut self, layer: Layer) {
        self.layer = layer;
    }
}

/// Ordered chain of portal crossings separating an object's home frame from
/// its live frame. Entry order is application order: the first element was
/// crossed first. The chain stays minimal — the add operations cancel an
/// entry instead of stacking it against its own partner.
#[derive(Debug, Clone, Default)]
pub struct PortalTrace {
    chain: VecDeque<PortalId>,
    gaps: u32,
}

impl PortalTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// Crossings that could not be resolved (portal destroyed or unlinked
    /// mid-trace) and were skipped instead of applied.
    pub fn gaps(&self) -> u32 {
        self.gaps
    }

    pub fn clear(&mut self) {
        self.chain.clear();
        self.gaps = 0;
    }

    /// The object's origin crossed `portal` outgoing: the chain grows at the
    /// front by the partner, or cancels an existing front entry.
    pub fn add_start_teleport(&mut self, portal: PortalId, portals: &PortalSet) {
        if self.chain.front() == Some(&portal) {
            self.chain.pop_front();
            return;
        }
        let Some(partner) = portals.partner_of(portal) else {
            warn!("start teleport through an unlinked portal ignored");
            return;
        };
        self.chain.push_front(partner);
    }

    /// The object itself crossed `portal`: the chain grows at the back, or
    /// cancels a back entry that was this portal's partner.
    pub fn add_end_teleport(&mut self, portal: PortalId, portals: &PortalSet) {
        let Some(partner) = portals.partner_of(portal) else {
            warn!("end teleport through an unlinked portal ignored");
            return;
        };
        if self.chain.back() == Some(&partner) {
            self.chain.pop_back();
        } else {
            self.chain.push_back(portal);
        }
    }

    /// Reconciles the chain against `new_sequence`, physically moving
    /// `target` only for the parts that changed: the shared prefix is left
    /// alone, the stale suffix is undone back to front, the new suffix is
    /// applied in order. Work is O(prefix + changed suffix), and an unchanged
    /// prefix is never re-applied — repeated float composition is not
    /// idempotent.
    pub fn teleport_difference(
        &mut self,
        target: &mut dyn Teleportable,
        new_sequence: &[PortalId],
        portals: &PortalSet,
    ) {
        let mut prefix = 0;
        while prefix < self.chain.len()
            && prefix < new_sequence.len()
            && self.chain[prefix] == new_sequence[prefix]
        {
            prefix += 1;
        }

        while self.chain.len() > prefix {
            let Some(id) = self.chain.pop_back() else {
                break;
            };
            self.undo_one(id, target, portals);
        }

        for &id in &new_sequence[prefix..] {
            self.apply_one(id, target, portals);
            self.chain.push_back(id);
        }
    }

    /// Forward sequence, front first.
    pub fn portals(&self) -> impl Iterator<Item = PortalId> + '_ {
        self.chain.iter().copied()
    }

    /// The exact undo walk: reverse order, each entry replaced by its
    /// partner. Restartable; entries that no longer resolve are skipped.
    pub fn undo_portals<'a>(
        &'a self,
        portals: &'a PortalSet,
    ) -> impl Iterator<Item = PortalId> + 'a {
        self.chain
            .iter()
            .rev()
            .filter_map(move |&id| portals.partner_of(id))
    }

    /// Composes every forward teleport into one matrix and applies it once.
    /// Read-only: nothing on the trace or the target changes, which is what
    /// "where would this appear" queries need.
    pub fn apply_portals(&self, portals: &PortalSet, matrix: Mat4) -> Mat4 {
        let mut composed = Mat4::IDENTITY;
        for &id in &self.chain {
            match portals.teleport_matrix(id) {
                Some(teleport) => composed = teleport * composed,
                None => debug!("skipping unresolvable portal in composed apply"),
            }
        }
        composed * matrix
    }

    fn apply_one(&mut self, id: PortalId, target: &mut dyn Teleportable, portals: &PortalSet) {
        match portals.get(id) {
            Some(portal) if portal.is_linked() => portal.teleport(target),
            _ => {
                warn!("skipping unresolvable portal in forward teleport");
                self.gaps += 1;
            }
        }
    }

    fn undo_one(&mut self, id: PortalId, target: &mut dyn Teleportable, portals: &PortalSet) {
        let partner = portals.partner_of(id);
        match partner.and_then(|partner| portals.get(partner)) {
            Some(portal) if portal.is_linked() => portal.teleport(target),
            _ => {
                warn!("skipping unresolvable portal in undo walk");
                self.gaps += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use glam::{Mat4, Quat, Vec2, Vec3};

    use super::{PortalTrace, TrackedBody};
    use crate::portal::{Portal, PortalId, PortalSet};

    fn pair(set: &mut PortalSet, pose_a: Mat4, pose_b: Mat4) -> (PortalId, PortalId) {
        let a = set.insert(Portal::new(pose_a, Vec2::new(1.0, 2.0)));
        let b = set.insert(Portal::new(pose_b, Vec2::new(1.0, 2.0)));
        assert!(set.link(a, b));
        (a, b)
    }

    fn three_pairs(set: &mut PortalSet) -> [PortalId; 3] {
        let (a, _) = pair(
            set,
            Mat4::from_translation(Vec3::new(0.0, 0.0, 0.0)),
            Mat4::from_rotation_translation(
                Quat::from_rotation_y(1.1),
                Vec3::new(8.0, 0.0, -2.0),
            ),
        );
        let (b, _) = pair(
            set,
            Mat4::from_translation(Vec3::new(0.0, 5.0, 0.0)),
            Mat4::from_rotation_translation(
                Quat::from_rotation_x(0.4),
                Vec3::new(-3.0, 1.0, 6.0),
            ),
        );
        let (c, _) = pair(
            set,
            Mat4::from_rotation_translation(Quat::from_rotation_z(0.9), Vec3::new(2.0, -4.0, 1.0)),
            Mat4::from_translation(Vec3::new(0.0, 0.0, 12.0)),
        );
        [a, b, c]
    }

    fn assert_close(a: Mat4, b: Mat4) {
        let da = a.to_cols_array();
        let db = b.to_cols_array();
        for (x, y) in da.iter().zip(db.iter()) {
            assert!((x - y).abs() < 1e-3, "matrices differ: {a:?} vs {b:?}");
        }
    }

    fn naive_reset_then_apply(
        portals: &PortalSet,
        old: &[PortalId],
        new: &[PortalId],
        start: Mat4,
    ) -> Mat4 {
        let mut m = start;
        for &id in old.iter().rev() {
            if let Some(partner) = portals.partner_of(id) {
                if let Some(t) = portals.teleport_matrix(partner) {
                    m = t * m;
                }
            }
        }
        for &id in new {
            if let Some(t) = portals.teleport_matrix(id) {
                m = t * m;
            }
        }
        m
    }

    fn assert_minimal(trace: &PortalTrace, portals: &PortalSet) {
        let chain: Vec<_> = trace.portals().collect();
        for w in chain.windows(2) {
            assert_ne!(Some(w[1]), portals.partner_of(w[0]), "adjacent inverse pair");
        }
    }

    #[test]
    fn empty_trace_gains_new_sequence() {
        let mut set = PortalSet::new();
        let [a, b, _] = three_pairs(&mut set);
        let mut trace = PortalTrace::new();
        let start = Mat4::from_translation(Vec3::new(0.3, 0.0, 0.9));
        let mut body = TrackedBody::at(start);

        trace.teleport_difference(&mut body, &[a, b], &set);

        assert_eq!(trace.portals().collect::<Vec<_>>(), vec![a, b]);
        let expected =
            set.teleport_matrix(b).unwrap() * set.teleport_matrix(a).unwrap() * start;
        assert_close(body.matrix, expected);
        assert_eq!(trace.gaps(), 0);
    }

    #[test]
    fn emptying_a_trace_undoes_everything() {
        let mut set = PortalSet::new();
        let [a, ..] = three_pairs(&mut set);
        let mut trace = PortalTrace::new();
        let start = Mat4::from_translation(Vec3::new(-2.0, 1.0, 4.0));
        let mut body = TrackedBody::at(start);

        trace.teleport_difference(&mut body, &[a], &set);
        trace.teleport_difference(&mut body, &[], &set);

        assert!(trace.is_empty());
        assert_close(body.matrix, start);
    }

    #[test]
    fn shared_prefix_is_left_untouched() {
        let mut set = PortalSet::new();
        let [a, b, c] = three_pairs(&mut set);
        let mut trace = PortalTrace::new();
        let start = Mat4::IDENTITY;
        let mut body = TrackedBody::at(start);

        trace.teleport_difference(&mut body, &[a, b], &set);
        let after_ab = body.matrix;
        trace.teleport_difference(&mut body, &[a, c], &set);

        assert_eq!(trace.portals().collect::<Vec<_>>(), vec![a, c]);
        // b undone, c applied, a's contribution still present
        let expected = set.teleport_matrix(c).unwrap()
            * set.teleport_matrix(set.partner_of(b).unwrap()).unwrap()
            * after_ab;
        assert_close(body.matrix, expected);
    }

    #[test]
    fn difference_matches_naive_reset_for_varied_sequences() {
        let mut set = PortalSet::new();
        let [a, b, c] = three_pairs(&mut set);
        let cases: [(&[PortalId], &[PortalId]); 6] = [
            (&[], &[a, b, c]),
            (&[a], &[a]),
            (&[a, b], &[b, a]),
            (&[a, b, c], &[a, b]),
            (&[c, a], &[c, b, a]),
            (&[a, b, c], &[]),
        ];

        for (old, new) in cases {
            let start = Mat4::from_rotation_translation(
                Quat::from_rotation_y(0.25),
                Vec3::new(1.0, 2.0, 3.0),
            );
            let mut trace = PortalTrace::new();
            let mut body = TrackedBody::at(start);
            trace.teleport_difference(&mut body, old, &set);

            let naive = naive_reset_then_apply(&set, old, new, body.matrix);
            trace.teleport_difference(&mut body, new, &set);

            assert_eq!(trace.portals().collect::<Vec<_>>(), new.to_vec());
            assert_close(body.matrix, naive);
        }
    }

    #[test]
    fn repeated_difference_is_a_no_op() {
        let mut set = PortalSet::new();
        let [a, b, _] = three_pairs(&mut set);
        let mut trace = PortalTrace::new();
        let mut body = TrackedBody::at(Mat4::IDENTITY);

        trace.teleport_difference(&mut body, &[a, b], &set);
        let settled = body.matrix;
        trace.teleport_difference(&mut body, &[a, b], &set);

        assert_eq!(body.matrix, settled);
        assert_eq!(trace.portals().collect::<Vec<_>>(), vec![a, b]);
    }

    #[test]
    fn add_operations_cancel_inverse_pairs() {
        let mut set = PortalSet::new();
        let [a, b, _] = three_pairs(&mut set);
        let a_partner = set.partner_of(a).unwrap();
        let mut trace = PortalTrace::new();

        trace.add_end_teleport(a, &set);
        trace.add_end_teleport(b, &set);
        assert_minimal(&trace, &set);

        // crossing back through b's partner cancels b
        let b_partner = set.partner_of(b).unwrap();
        trace.add_end_teleport(b_partner, &set);
        assert_eq!(trace.portals().collect::<Vec<_>>(), vec![a]);

        // origin-side crossing through a's stored entry cancels at the front
        trace.add_start_teleport(a, &set);
        assert!(trace.is_empty());

        // and an origin-side crossing on an empty trace records the partner
        trace.add_start_teleport(a, &set);
        assert_eq!(trace.portals().collect::<Vec<_>>(), vec![a_partner]);
        assert_minimal(&trace, &set);
    }

    #[test]
    fn interleaved_adds_keep_the_chain_minimal() {
        let mut set = PortalSet::new();
        let [a, b, c] = three_pairs(&mut set);
        let mut trace = PortalTrace::new();

        for &id in &[a, b, c, a, b] {
            trace.add_end_teleport(id, &set);
            assert_minimal(&trace, &set);
            trace.add_start_teleport(id, &set);
            assert_minimal(&trace, &set);
        }
    }

    #[test]
    fn unlinked_portal_adds_are_ignored() {
        let mut set = PortalSet::new();
        let lone = set.insert(Portal::new(Mat4::IDENTITY, Vec2::ONE));
        let mut trace = PortalTrace::new();

        trace.add_end_teleport(lone, &set);
        trace.add_start_teleport(lone, &set);

        assert!(trace.is_empty());
        assert_eq!(trace.gaps(), 0);
    }

    #[test]
    fn destroyed_portal_leaves_a_gap_but_not_corruption() {
        let mut set = PortalSet::new();
        let [a, b, _] = three_pairs(&mut set);
        let mut trace = PortalTrace::new();
        let start = Mat4::from_translation(Vec3::new(0.0, 1.0, 0.0));
        let mut body = TrackedBody::at(start);

        let t_a = set.teleport_matrix(a).unwrap();
        let t_b = set.teleport_matrix(b).unwrap();
        let undo_a = set.teleport_matrix(set.partner_of(a).unwrap()).unwrap();

        trace.teleport_difference(&mut body, &[a, b], &set);
        set.remove(b);
        trace.teleport_difference(&mut body, &[], &set);

        assert!(trace.is_empty());
        assert_eq!(trace.gaps(), 1);
        // b's undo was skipped, a's still ran
        assert_close(body.matrix, undo_a * t_b * t_a * start);
    }

    #[test]
    fn composed_apply_matches_stepwise_application() {
        let mut set = PortalSet::new();
        let [a, b, c] = three_pairs(&mut set);
        let mut trace = PortalTrace::new();
        let start = Mat4::from_translation(Vec3::new(4.0, 4.0, 4.0));
        let mut body = TrackedBody::at(start);

        trace.teleport_difference(&mut body, &[a, b, c], &set);
        let composed = trace.apply_portals(&set, start);

        assert_close(composed, body.matrix);
        // read-only: the trace itself did not change
        assert_eq!(trace.portals().collect::<Vec<_>>(), vec![a, b, c]);
    }

    #[test]
    fn undo_portals_reports_the_reverse_partner_walk() {
        let mut set = PortalSet::new();
        let [a, b, _] = three_pairs(&mut set);
        let mut trace = PortalTrace::new();
        let mut body = TrackedBody::at(Mat4::IDENTITY);

        trace.teleport_difference(&mut body, &[a, b], &set);

        let undo: Vec<_> = trace.undo_portals(&set).collect();
        assert_eq!(
            undo,
            vec![set.partner_of(b).unwrap(), set.partner_of(a).unwrap()]
        );
        // restartable
        assert_eq!(trace.undo_portals(&set).count(), 2);
    }
}
