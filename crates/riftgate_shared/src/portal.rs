use glam::Vec3;

use crate::math;
use crate::types::{PhysicsState, PortalFace, PortalId, PortalPlane};

/// A single oriented portal plane with A/B faces.
///
/// Portals are value objects: linking, unlinking and destruction are driven
/// by the owning manager, never by the portal itself. A linked pair is an
/// unordered bidirectional relation with at most one twin per portal.
#[derive(Debug, Clone)]
pub struct Portal {
    id: PortalId,
    plane: PortalPlane,
    linked_portal: Option<PortalId>,
    active: bool,
    recursive: bool,
    /// Motion of the portal itself, for moving portals.
    physics_state: PhysicsState,
    max_recursion_depth: u32,
}

impl Portal {
    pub fn new(id: PortalId, plane: PortalPlane) -> Self {
        Self {
            id,
            plane,
            linked_portal: None,
            active: true,
            recursive: false,
            physics_state: PhysicsState::default(),
            max_recursion_depth: 3,
        }
    }

    pub fn id(&self) -> PortalId {
        self.id
    }

    pub fn plane(&self) -> &PortalPlane {
        &self.plane
    }

    pub fn set_plane(&mut self, plane: PortalPlane) {
        self.plane = plane;
    }

    pub fn linked_portal(&self) -> Option<PortalId> {
        self.linked_portal
    }

    pub fn set_linked_portal(&mut self, portal_id: Option<PortalId>) {
        self.linked_portal = portal_id;
    }

    pub fn is_linked(&self) -> bool {
        self.linked_portal.is_some()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub fn is_recursive(&self) -> bool {
        self.recursive
    }

    pub fn set_recursive(&mut self, recursive: bool) {
        self.recursive = recursive;
    }

    pub fn physics_state(&self) -> &PhysicsState {
        &self.physics_state
    }

    pub fn set_physics_state(&mut self, state: PhysicsState) {
        self.physics_state = state;
    }

    pub fn max_recursion_depth(&self) -> u32 {
        self.max_recursion_depth
    }

    pub fn set_max_recursion_depth(&mut self, depth: u32) {
        self.max_recursion_depth = depth;
    }

    pub fn face_normal(&self, face: PortalFace) -> Vec3 {
        self.plane.face_normal(face)
    }

    /// Rectangle test in the plane's local axes.
    pub fn is_point_in_bounds(&self, point: Vec3) -> bool {
        math::is_point_in_portal_bounds(point, &self.plane)
    }

    pub fn corner_points(&self) -> [Vec3; 4] {
        math::portal_corners(&self.plane)
    }

    /// True when `position` lies on the open side of the given face.
    pub fn is_facing_position(&self, position: Vec3, face: PortalFace) -> bool {
        self.face_normal(face).dot(position - self.plane.center) > 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PortalFace;

    fn test_portal() -> Portal {
        Portal::new(
            1,
            PortalPlane {
                center: Vec3::ZERO,
                normal: Vec3::X,
                up: Vec3::Y,
                right: Vec3::Z,
                width: 2.0,
                height: 3.0,
                active_face: PortalFace::A,
            },
        )
    }

    #[test]
    fn bounds_test_uses_local_axes() {
        let portal = test_portal();
        assert!(portal.is_point_in_bounds(Vec3::new(0.0, 1.4, 0.9)));
        assert!(!portal.is_point_in_bounds(Vec3::new(0.0, 1.6, 0.0)));
        assert!(!portal.is_point_in_bounds(Vec3::new(0.0, 0.0, 1.1)));
    }

    #[test]
    fn facing_depends_on_face() {
        let portal = test_portal();
        let in_front = Vec3::new(2.0, 0.0, 0.0);
        assert!(portal.is_facing_position(in_front, PortalFace::A));
        assert!(!portal.is_facing_position(in_front, PortalFace::B));
    }

    #[test]
    fn corners_span_the_rectangle() {
        let portal = test_portal();
        let corners = portal.corner_points();
        assert_eq!(corners[0], Vec3::new(0.0, -1.5, -1.0));
        assert_eq!(corners[2], Vec3::new(0.0, 1.5, 1.0));
    }
}
