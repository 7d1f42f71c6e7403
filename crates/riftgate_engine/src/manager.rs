//! Top-level façade over the teleport engine.
//!
//! Owns the portal table, the registered entity set and the sub-managers,
//! receives the four physics events from the host and routes them to the
//! teleport manager, and produces recursive render passes for the renderer.
//! The host drives one frame as: physics events, then [`PortalManager::update`],
//! then [`PortalManager::calculate_render_passes`] when it prepares the frame.

use glam::Vec3;
use rustc_hash::FxHashSet;
use tracing::{debug, info, warn};

use riftgate_shared::chain::{EntityChainState, PhysicsConstraintState, TeleportState};
use riftgate_shared::math;
use riftgate_shared::portal::Portal;
use riftgate_shared::types::{
    CameraParams, CenterOfMassConfig, ClippingPlane, EntityId, MergeStrategy, PhysicsState,
    PortalFace, PortalId, PortalPlane, RenderPassDescriptor,
};

use crate::center_of_mass::{CenterOfMassManager, CenterOfMassProvider};
use crate::clipping::ClippingStats;
use crate::error::{PortalError, TeleportError};
use crate::interfaces::{Host, PortalPhysicsEventReceiver};
use crate::settings::EngineSettings;
use crate::teleport::{BatchSyncStats, PortalTable, TeleportManager};

pub struct PortalManager {
    host: Host,
    settings: EngineSettings,

    portals: PortalTable,
    registered_entities: FxHashSet<EntityId>,
    next_portal_id: PortalId,

    teleport: TeleportManager,
    center_of_mass: CenterOfMassManager,
}

impl PortalManager {
    pub fn new(host: Host) -> Self {
        Self::with_settings(host, EngineSettings::default())
    }

    pub fn with_settings(host: Host, settings: EngineSettings) -> Self {
        let settings = settings.sanitize();

        let mut teleport = TeleportManager::new();
        teleport.set_ghost_sync_frequency(settings.ghost_sync_frequency);
        teleport.set_logical_update_frequency(settings.logical_update_frequency);
        teleport.set_logical_entity_control_mode(settings.use_logical_entity_control);
        teleport.set_auto_swap_on_center_cross(settings.auto_swap_on_center_cross);
        teleport.set_max_concurrent_teleports(settings.max_concurrent_teleports);
        teleport.set_default_clipping_quality(settings.clipping_quality);
        teleport.set_clipping_defaults(
            settings.min_segment_visibility,
            settings.smooth_transition_blend_distance,
        );

        info!(
            logical_control = settings.use_logical_entity_control,
            sync_hz = settings.ghost_sync_frequency,
            "portal engine ready"
        );

        Self {
            host,
            settings,
            portals: PortalTable::default(),
            registered_entities: FxHashSet::default(),
            next_portal_id: 1,
            teleport,
            center_of_mass: CenterOfMassManager::default(),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn set_center_of_mass_provider(&mut self, provider: Box<dyn CenterOfMassProvider>) {
        self.center_of_mass.set_provider(provider);
    }

    /// Per-frame tick: refresh recursive flags, advance the teleport state
    /// machine (which drives the logical entities), then the center-of-mass
    /// auto-update pass.
    pub fn update(&mut self, delta_time: f32) {
        self.update_portal_recursive_states();
        self.teleport.update(delta_time, &mut self.host, &self.portals);
        self.center_of_mass.update_auto_update_entities(delta_time);
    }

    // === portal management ===

    pub fn create_portal(&mut self, plane: PortalPlane) -> PortalId {
        let id = self.next_portal_id;
        self.next_portal_id += 1;

        let mut portal = Portal::new(id, plane);
        portal.set_max_recursion_depth(self.settings.default_max_recursion_depth);
        self.portals.insert(id, portal);

        debug!(portal_id = id, "portal created");
        id
    }

    pub fn destroy_portal(&mut self, portal_id: PortalId) {
        if !self.portals.contains_key(&portal_id) {
            return;
        }
        self.unlink_portal(portal_id);
        self.portals.remove(&portal_id);
        debug!(portal_id, "portal destroyed");
    }

    /// Links two portals into a traversable pair. Any previous link on
    /// either side is broken first.
    pub fn link_portals(&mut self, portal1: PortalId, portal2: PortalId) -> Result<(), PortalError> {
        if portal1 == portal2 {
            return Err(PortalError::SelfLink(portal1));
        }
        if !self.portals.contains_key(&portal1) {
            return Err(PortalError::InvalidPortal(portal1));
        }
        if !self.portals.contains_key(&portal2) {
            return Err(PortalError::InvalidPortal(portal2));
        }

        self.unlink_portal(portal1);
        self.unlink_portal(portal2);

        if let Some(portal) = self.portals.get_mut(&portal1) {
            portal.set_linked_portal(Some(portal2));
        }
        if let Some(portal) = self.portals.get_mut(&portal2) {
            portal.set_linked_portal(Some(portal1));
        }

        self.host.notify(|events| events.on_portals_linked(portal1, portal2));
        debug!(portal1, portal2, "portals linked");
        Ok(())
    }

    pub fn unlink_portal(&mut self, portal_id: PortalId) {
        let Some(linked_id) = self.portals.get(&portal_id).and_then(|p| p.linked_portal()) else {
            return;
        };

        if let Some(portal) = self.portals.get_mut(&portal_id) {
            portal.set_linked_portal(None);
        }
        if let Some(linked) = self.portals.get_mut(&linked_id) {
            portal_unlink_guard(linked, portal_id);
        }

        self.host
            .notify(|events| events.on_portals_unlinked(portal_id, linked_id));
    }

    pub fn portal(&self, portal_id: PortalId) -> Option<&Portal> {
        self.portals.get(&portal_id)
    }

    pub fn portal_mut(&mut self, portal_id: PortalId) -> Option<&mut Portal> {
        self.portals.get_mut(&portal_id)
    }

    pub fn update_portal_plane(&mut self, portal_id: PortalId, plane: PortalPlane) {
        if let Some(portal) = self.portals.get_mut(&portal_id) {
            portal.set_plane(plane);
        }
    }

    /// Motion state for moving portals; feeds the relative-velocity term of
    /// the physics mapping.
    pub fn update_portal_physics_state(&mut self, portal_id: PortalId, state: PhysicsState) {
        if let Some(portal) = self.portals.get_mut(&portal_id) {
            portal.set_physics_state(state);
        }
    }

    pub fn portal_count(&self) -> usize {
        self.portals.len()
    }

    // === entity management ===

    pub fn register_entity(&mut self, entity_id: EntityId) -> Result<(), PortalError> {
        if !self.host.physics_data.is_entity_valid(entity_id) {
            return Err(PortalError::UnknownEntity(entity_id));
        }
        self.registered_entities.insert(entity_id);
        Ok(())
    }

    pub fn unregister_entity(&mut self, entity_id: EntityId) {
        self.registered_entities.remove(&entity_id);
        self.teleport.cleanup_entity(&mut self.host, entity_id);
        self.center_of_mass.remove_entity(entity_id);
    }

    pub fn registered_entity_count(&self) -> usize {
        self.registered_entities.len()
    }

    pub fn teleporting_entity_count(&self) -> usize {
        self.teleport.teleporting_entity_count()
    }

    // === center of mass ===

    /// Stores the policy and pushes the resolved local offset to the host,
    /// which uses it for center-crossing detection.
    pub fn set_entity_center_of_mass_config(&mut self, entity_id: EntityId, config: CenterOfMassConfig) {
        self.center_of_mass.set_entity_config(entity_id, config);
        let offset = self.center_of_mass.local_center_of_mass(entity_id);
        self.host.physics.set_entity_center_of_mass(entity_id, offset);
    }

    pub fn entity_center_of_mass_config(&self, entity_id: EntityId) -> Option<&CenterOfMassConfig> {
        self.center_of_mass.entity_config(entity_id)
    }

    // === physics event receiver plumbing ===

    fn handle_intersect_start(&mut self, entity_id: EntityId, portal_id: PortalId) {
        let Some(portal) = self.portals.get(&portal_id) else {
            warn!(entity_id, portal_id, "intersect event for unknown portal");
            return;
        };
        if !portal.is_active() || !portal.is_linked() {
            debug!(entity_id, portal_id, "portal inactive or unlinked, event dropped");
            return;
        }
        self.teleport
            .on_intersect_start(&mut self.host, &self.portals, entity_id, portal_id);
    }

    fn handle_center_crossed(&mut self, entity_id: EntityId, portal_id: PortalId, crossed_face: PortalFace) {
        if !self.portals.get(&portal_id).is_some_and(|p| p.is_linked()) {
            return;
        }
        self.teleport.on_center_crossed(
            &mut self.host,
            &self.portals,
            entity_id,
            portal_id,
            crossed_face,
        );
    }

    fn handle_fully_passed(&mut self, entity_id: EntityId, portal_id: PortalId) {
        let Some(portal) = self.portals.get(&portal_id) else {
            return;
        };
        let target = portal.linked_portal();
        self.teleport
            .on_fully_passed(&mut self.host, entity_id, portal_id, target);
    }

    fn handle_exit_portal(&mut self, entity_id: EntityId, portal_id: PortalId) {
        self.teleport
            .on_exit_portal(&mut self.host, &self.portals, entity_id, portal_id);
    }

    // === teleport state queries ===

    pub fn teleport_state(&self, entity_id: EntityId) -> Option<&TeleportState> {
        self.teleport.teleport_state(entity_id)
    }

    pub fn is_entity_teleporting(&self, entity_id: EntityId) -> bool {
        self.teleport.is_entity_teleporting(entity_id)
    }

    pub fn chain_state(&self, entity_id: EntityId) -> Option<&EntityChainState> {
        self.teleport.chain_state(entity_id)
    }

    pub fn chain_main_entity(&self, entity_id: EntityId) -> Option<EntityId> {
        self.teleport.chain_main_entity(entity_id)
    }

    pub fn chain_length(&self, entity_id: EntityId) -> usize {
        self.teleport.chain_length(entity_id)
    }

    pub fn is_logical_entity_constrained(&self, entity_id: EntityId) -> bool {
        self.teleport.is_logical_entity_constrained(entity_id)
    }

    pub fn logical_entity_constraint(&self, entity_id: EntityId) -> Option<&PhysicsConstraintState> {
        self.teleport.logical_entity_constraint(entity_id)
    }

    pub fn set_logical_entity_merge_strategy(&mut self, entity_id: EntityId, strategy: MergeStrategy) {
        self.teleport.set_logical_entity_merge_strategy(entity_id, strategy);
    }

    // === batch sync ===

    pub fn set_entity_batch_sync(&mut self, entity_id: EntityId, enable: bool, sync_group_id: u32) {
        self.teleport.set_entity_batch_sync(entity_id, enable, sync_group_id);
    }

    /// Ghost batches are grouped by portal, so the portal id doubles as the
    /// sync group.
    pub fn force_sync_portal_ghosts(&mut self, portal_id: PortalId) {
        self.teleport.force_batch_sync_group(&mut self.host, portal_id);
    }

    pub fn batch_sync_stats(&self) -> BatchSyncStats {
        self.teleport.batch_sync_stats()
    }

    // === clipping ===

    pub fn set_entity_clipping_quality(&mut self, entity_id: EntityId, quality_level: u8) {
        self.teleport.set_entity_clipping_quality(entity_id, quality_level);
    }

    pub fn set_multi_segment_smooth_transitions(
        &mut self,
        entity_id: EntityId,
        enable: bool,
        blend_distance: f32,
    ) {
        self.teleport.set_smooth_transitions(entity_id, enable, blend_distance);
    }

    pub fn entity_visible_segment_count(&self, entity_id: EntityId, camera_position: Vec3) -> usize {
        self.teleport.visible_segment_count(entity_id, camera_position)
    }

    pub fn set_multi_segment_clipping_debug_mode(&mut self, enable: bool) {
        self.teleport.set_clipping_debug_mode(enable);
    }

    pub fn multi_segment_clipping_stats(&self) -> ClippingStats {
        self.teleport.clipping_stats()
    }

    /// Single-plane clip for the legacy path: the active source face of the
    /// portal the entity is currently teleporting through.
    pub fn entity_clipping_plane(&self, entity_id: EntityId) -> Option<ClippingPlane> {
        let state = self.teleport.teleport_state(entity_id)?;
        if !state.is_teleporting {
            return None;
        }
        let portal = self.portals.get(&state.source_portal)?;
        let plane = portal.plane();
        Some(ClippingPlane::from_point_and_normal(
            plane.center,
            plane.face_normal(state.active_source_face),
        ))
    }

    // === rendering ===

    pub fn is_portal_visible(&self, portal_id: PortalId, camera: &CameraParams) -> bool {
        let (Some(portal), Some(query)) = (self.portals.get(&portal_id), self.host.render_query.as_deref())
        else {
            return false;
        };
        query.is_point_in_view_frustum(portal.plane().center, camera)
    }

    /// Walks every linked, in-frustum portal and produces the recursive
    /// render passes, stopping at `max_recursion_depth` or at a portal that
    /// can see itself.
    pub fn calculate_render_passes(
        &self,
        main_camera: &CameraParams,
        max_recursion_depth: u32,
    ) -> Vec<RenderPassDescriptor> {
        let mut passes = Vec::new();
        if !self.host.supports_rendering() {
            return passes;
        }

        let visible: Vec<PortalId> = self
            .portals
            .iter()
            .filter(|(id, portal)| portal.is_linked() && self.is_portal_visible(**id, main_camera))
            .map(|(id, _)| *id)
            .collect();

        for portal_id in visible {
            self.collect_recursive_passes(portal_id, main_camera, 0, max_recursion_depth, &mut passes);
        }

        passes
    }

    fn collect_recursive_passes(
        &self,
        portal_id: PortalId,
        current_camera: &CameraParams,
        depth: u32,
        max_depth: u32,
        passes: &mut Vec<RenderPassDescriptor>,
    ) {
        if depth >= max_depth {
            return;
        }
        let Some(portal) = self.portals.get(&portal_id) else {
            return;
        };
        let Some(linked) = portal.linked_portal().and_then(|id| self.portals.get(&id)) else {
            return;
        };

        let source_face = PortalFace::A;
        let target_face = PortalFace::B;

        let virtual_camera = math::calculate_portal_camera(
            current_camera,
            portal.plane(),
            linked.plane(),
            source_face,
            target_face,
        );

        let clipping_plane = ClippingPlane::from_point_and_normal(
            linked.plane().center,
            linked.plane().face_normal(target_face),
        );

        passes.push(RenderPassDescriptor {
            virtual_camera,
            clipping_plane,
            should_clip: true,
            use_stencil_buffer: true,
            stencil_ref_value: depth + 1,
            source_portal_id: portal_id,
            recursion_depth: depth,
        });

        if math::is_portal_recursive(portal.plane(), linked.plane(), &virtual_camera) {
            return;
        }

        for (next_id, next_portal) in &self.portals {
            if *next_id != portal_id
                && next_portal.is_linked()
                && self.is_portal_visible(*next_id, &virtual_camera)
            {
                self.collect_recursive_passes(*next_id, &virtual_camera, depth + 1, max_depth, passes);
            }
        }
    }

    /// Refreshes each portal's recursive flag against the main camera and
    /// reports transitions exactly once.
    fn update_portal_recursive_states(&mut self) {
        let Some(query) = self.host.render_query.as_deref() else {
            return;
        };
        let camera = query.get_main_camera();

        let mut transitions: Vec<(PortalId, bool)> = Vec::new();
        for (portal_id, portal) in &self.portals {
            let recursive = match portal.linked_portal().and_then(|id| self.portals.get(&id)) {
                Some(linked) => math::is_portal_recursive(portal.plane(), linked.plane(), &camera),
                None => false,
            };
            if recursive != portal.is_recursive() {
                transitions.push((*portal_id, recursive));
            }
        }

        for (portal_id, recursive) in transitions {
            if let Some(portal) = self.portals.get_mut(&portal_id) {
                portal.set_recursive(recursive);
            }
            self.host
                .notify(|events| events.on_portal_recursive_state(portal_id, recursive));
        }
    }

    // === manual teleport bypass ===

    /// Immediately writes the transformed transform and physics, skipping
    /// the chain machinery. Kept for hosts that teleport small props without
    /// seamless rendering.
    pub fn teleport_entity(
        &mut self,
        entity_id: EntityId,
        source_portal: PortalId,
        target_portal: PortalId,
    ) -> Result<(), TeleportError> {
        let (Some(source), Some(target)) = (
            self.portals.get(&source_portal),
            self.portals.get(&target_portal),
        ) else {
            return Err(TeleportError::InvalidPortal);
        };
        if !source.is_active() || !target.is_active() {
            return Err(TeleportError::InvalidPortal);
        }
        if !source.is_linked() {
            return Err(TeleportError::NoLinkedPortal);
        }
        if !self.host.physics_data.is_entity_valid(entity_id) {
            return Err(TeleportError::InvalidPortal);
        }

        let transform = self.host.physics_data.get_entity_transform(entity_id);
        let physics = self.host.physics_data.get_entity_physics_state(entity_id);

        // The body's cross-section (its two smallest extents) must fit the
        // narrower of the two openings.
        let (bounds_min, bounds_max) = self.host.physics_data.get_entity_bounds(entity_id);
        let size = (bounds_max - bounds_min) * transform.scale;
        let mut extents = [size.x.abs(), size.y.abs(), size.z.abs()];
        extents.sort_by(f32::total_cmp);
        let mut opening = [
            source.plane().width.min(target.plane().width),
            source.plane().height.min(target.plane().height),
        ];
        opening.sort_by(f32::total_cmp);
        if extents[0] > opening[0] || extents[1] > opening[1] {
            return Err(TeleportError::TooLarge);
        }

        let new_transform = math::transform_through_portal(
            &transform,
            source.plane(),
            target.plane(),
            PortalFace::A,
            PortalFace::B,
        );
        let new_physics = math::transform_physics_state_through_portal(
            &physics,
            source.plane(),
            target.plane(),
            PortalFace::A,
            PortalFace::B,
        );

        self.host.physics.set_entity_transform(entity_id, &new_transform);
        self.host.physics.set_entity_physics_state(entity_id, &new_physics);

        self.host.notify(|events| {
            events.on_entity_teleport_begin(entity_id, source_portal, target_portal);
            events.on_entity_teleport_complete(
                entity_id,
                Some(source_portal),
                Some(target_portal),
            );
        });

        Ok(())
    }
}

impl PortalPhysicsEventReceiver for PortalManager {
    fn on_entity_intersect_portal_start(&mut self, entity_id: EntityId, portal_id: PortalId) {
        self.handle_intersect_start(entity_id, portal_id);
    }

    fn on_entity_center_crossed_portal(
        &mut self,
        entity_id: EntityId,
        portal_id: PortalId,
        crossed_face: PortalFace,
    ) {
        self.handle_center_crossed(entity_id, portal_id, crossed_face);
    }

    fn on_entity_fully_passed_portal(&mut self, entity_id: EntityId, portal_id: PortalId) {
        self.handle_fully_passed(entity_id, portal_id);
    }

    fn on_entity_exit_portal(&mut self, entity_id: EntityId, portal_id: PortalId) {
        self.handle_exit_portal(entity_id, portal_id);
    }
}

fn portal_unlink_guard(linked: &mut Portal, expected_twin: PortalId) {
    if linked.linked_portal() == Some(expected_twin) {
        linked.set_linked_portal(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{AllSeeingRenderQuery, MockEvent, MockHost, NullRenderManipulator};
    use glam::Quat;

    const TOLERANCE: f32 = 1e-4;

    fn facing_planes() -> (PortalPlane, PortalPlane) {
        (
            PortalPlane {
                center: Vec3::new(-5.0, 0.0, 0.0),
                normal: Vec3::X,
                up: Vec3::Y,
                right: Vec3::Z,
                width: 2.0,
                height: 3.0,
                active_face: PortalFace::A,
            },
            PortalPlane {
                center: Vec3::new(5.0, 0.0, 0.0),
                normal: Vec3::NEG_X,
                up: Vec3::Y,
                right: Vec3::NEG_Z,
                width: 2.0,
                height: 3.0,
                active_face: PortalFace::A,
            },
        )
    }

    fn manager_with_linked_pair(mock: &MockHost) -> (PortalManager, PortalId, PortalId) {
        let mut manager = PortalManager::new(mock.build_host());
        let (p_plane, q_plane) = facing_planes();
        let p = manager.create_portal(p_plane);
        let q = manager.create_portal(q_plane);
        manager.link_portals(p, q).unwrap();
        (manager, p, q)
    }

    #[test]
    fn linking_is_bidirectional_and_validated() {
        let mock = MockHost::new();
        let (mut manager, p, q) = manager_with_linked_pair(&mock);

        assert_eq!(manager.portal(p).unwrap().linked_portal(), Some(q));
        assert_eq!(manager.portal(q).unwrap().linked_portal(), Some(p));
        assert!(mock
            .world
            .borrow()
            .events
            .contains(&MockEvent::PortalsLinked(p, q)));

        assert!(matches!(
            manager.link_portals(p, p),
            Err(PortalError::SelfLink(id)) if id == p
        ));
        assert!(matches!(
            manager.link_portals(p, 99),
            Err(PortalError::InvalidPortal(99))
        ));

        manager.unlink_portal(p);
        assert_eq!(manager.portal(p).unwrap().linked_portal(), None);
        assert_eq!(manager.portal(q).unwrap().linked_portal(), None);
        assert!(mock
            .world
            .borrow()
            .events
            .contains(&MockEvent::PortalsUnlinked(p, q)));
    }

    #[test]
    fn destroying_a_portal_breaks_its_twin_link() {
        let mock = MockHost::new();
        let (mut manager, p, q) = manager_with_linked_pair(&mock);

        manager.destroy_portal(p);
        assert!(manager.portal(p).is_none());
        assert_eq!(manager.portal(q).unwrap().linked_portal(), None);
        assert_eq!(manager.portal_count(), 1);
    }

    #[test]
    fn events_route_through_the_full_chain_lifecycle() {
        let mock = MockHost::new();
        mock.world
            .borrow_mut()
            .add_entity(7, Vec3::new(-4.0, 0.0, 0.0), Vec3::new(-2.0, 0.0, 0.0));
        let (mut manager, p, _q) = manager_with_linked_pair(&mock);

        manager.on_entity_intersect_portal_start(7, p);
        assert_eq!(manager.chain_length(7), 2);
        assert!(manager.is_entity_teleporting(7));

        manager.on_entity_center_crossed_portal(7, p, PortalFace::A);
        let ghost_id = mock.world.borrow().created_nodes[0].0;
        assert_eq!(manager.chain_main_entity(7), Some(ghost_id));

        manager.on_entity_exit_portal(7, p);
        assert_eq!(manager.chain_length(7), 1);
        assert!(mock
            .world
            .borrow()
            .events
            .contains(&MockEvent::TeleportComplete(7)));
    }

    #[test]
    fn events_for_unlinked_portals_are_dropped() {
        let mock = MockHost::new();
        mock.world.borrow_mut().add_entity(7, Vec3::ZERO, Vec3::ZERO);
        let mut manager = PortalManager::new(mock.build_host());
        let (p_plane, _) = facing_planes();
        let p = manager.create_portal(p_plane);

        manager.on_entity_intersect_portal_start(7, p);
        assert_eq!(manager.chain_length(7), 0);
    }

    #[test]
    fn registration_validates_against_the_host() {
        let mock = MockHost::new();
        mock.world.borrow_mut().add_entity(7, Vec3::ZERO, Vec3::ZERO);
        let mut manager = PortalManager::new(mock.build_host());

        assert!(manager.register_entity(7).is_ok());
        assert!(matches!(
            manager.register_entity(8),
            Err(PortalError::UnknownEntity(8))
        ));
        assert_eq!(manager.registered_entity_count(), 1);

        manager.unregister_entity(7);
        assert_eq!(manager.registered_entity_count(), 0);
    }

    #[test]
    fn manual_teleport_writes_the_mapped_state() {
        let mock = MockHost::new();
        mock.world
            .borrow_mut()
            .add_entity(7, Vec3::new(-3.0, 0.0, 0.0), Vec3::new(-1.0, 0.0, 0.0));
        let (mut manager, p, q) = manager_with_linked_pair(&mock);

        manager.teleport_entity(7, p, q).unwrap();

        let world = mock.world.borrow();
        let (_, transform) = world.direct_transforms.last().unwrap();
        assert!((transform.position - Vec3::new(3.0, 0.0, 0.0)).length() < TOLERANCE);
        assert!(
            (world.physics[&7].linear_velocity - Vec3::new(-1.0, 0.0, 0.0)).length() < TOLERANCE
        );
        assert!(world.events.contains(&MockEvent::TeleportBegin(7)));
        assert!(world.events.contains(&MockEvent::TeleportComplete(7)));
        drop(world);

        // No chain was created by the bypass path.
        assert_eq!(manager.chain_length(7), 0);

        assert_eq!(manager.teleport_entity(7, p, 42), Err(TeleportError::InvalidPortal));
        assert_eq!(manager.teleport_entity(99, p, q), Err(TeleportError::InvalidPortal));
    }

    #[test]
    fn manual_teleport_requires_a_linked_source() {
        let mock = MockHost::new();
        mock.world.borrow_mut().add_entity(7, Vec3::ZERO, Vec3::ZERO);
        let mut manager = PortalManager::new(mock.build_host());
        let (p_plane, q_plane) = facing_planes();
        let p = manager.create_portal(p_plane);
        let q = manager.create_portal(q_plane);

        assert_eq!(manager.teleport_entity(7, p, q), Err(TeleportError::NoLinkedPortal));
        assert!(mock.world.borrow().direct_transforms.is_empty());
    }

    #[test]
    fn manual_teleport_rejects_oversized_entities() {
        let mock = MockHost::new();
        {
            let mut world = mock.world.borrow_mut();
            world.add_entity(7, Vec3::new(-3.0, 0.0, 0.0), Vec3::ZERO);
            // 10 units on every axis; the portals open 2 by 3.
            world.bounds.insert(7, (Vec3::splat(-5.0), Vec3::splat(5.0)));
        }
        let (mut manager, p, q) = manager_with_linked_pair(&mock);

        assert_eq!(manager.teleport_entity(7, p, q), Err(TeleportError::TooLarge));
        assert!(mock.world.borrow().direct_transforms.is_empty());
    }

    #[test]
    fn render_passes_recurse_with_depth_stencils() {
        let mock = MockHost::new();
        let host = mock
            .build_host()
            .with_render(Box::new(AllSeeingRenderQuery::default()), Box::new(NullRenderManipulator));
        let mut manager = PortalManager::new(host);
        let (p_plane, q_plane) = facing_planes();
        let p = manager.create_portal(p_plane);
        let q = manager.create_portal(q_plane);
        manager.link_portals(p, q).unwrap();

        let camera = CameraParams {
            position: Vec3::new(0.0, 0.0, 0.0),
            rotation: Quat::IDENTITY,
            ..CameraParams::default()
        };

        let passes = manager.calculate_render_passes(&camera, 3);
        assert!(!passes.is_empty());
        for pass in &passes {
            assert!(pass.recursion_depth < 3);
            assert_eq!(pass.stencil_ref_value, pass.recursion_depth + 1);
            assert!(pass.should_clip);
            assert!(pass.use_stencil_buffer);
        }
        assert!(passes.iter().any(|pass| pass.recursion_depth == 2));

        // The clip plane sits on the destination portal.
        let first = passes.iter().find(|pass| pass.source_portal_id == p).unwrap();
        let q_center = Vec3::new(5.0, 0.0, 0.0);
        assert!(first.clipping_plane.signed_distance(q_center).abs() < TOLERANCE);
    }

    #[test]
    fn render_passes_need_render_support() {
        let mock = MockHost::new();
        let (manager, _, _) = manager_with_linked_pair(&mock);
        let passes = manager.calculate_render_passes(&CameraParams::default(), 3);
        assert!(passes.is_empty());
    }

    #[test]
    fn recursive_state_transitions_fire_once() {
        let mock = MockHost::new();
        let query = AllSeeingRenderQuery {
            camera: CameraParams {
                // Mapped through the pair this camera looks back at the
                // source portal's front.
                position: Vec3::new(6.0, 0.0, 0.0),
                ..CameraParams::default()
            },
        };
        let host = mock
            .build_host()
            .with_render(Box::new(query), Box::new(NullRenderManipulator));
        let mut manager = PortalManager::new(host);
        let (p_plane, q_plane) = facing_planes();
        let p = manager.create_portal(p_plane);
        let q = manager.create_portal(q_plane);
        manager.link_portals(p, q).unwrap();

        manager.update(0.016);
        manager.update(0.016);

        let world = mock.world.borrow();
        assert_eq!(
            world.count_events(|e| matches!(e, MockEvent::RecursiveState(id, true) if *id == p)),
            1
        );
        drop(world);
        assert!(manager.portal(p).unwrap().is_recursive());
    }

    #[test]
    fn entity_clipping_plane_uses_the_active_source_face() {
        let mock = MockHost::new();
        mock.world
            .borrow_mut()
            .add_entity(7, Vec3::new(-4.0, 0.0, 0.0), Vec3::new(-2.0, 0.0, 0.0));
        let (mut manager, p, _q) = manager_with_linked_pair(&mock);

        assert!(manager.entity_clipping_plane(7).is_none());
        manager.on_entity_intersect_portal_start(7, p);

        let plane = manager.entity_clipping_plane(7).unwrap();
        assert!((plane.normal - Vec3::X).length() < TOLERANCE);
        assert!((plane.distance - (-5.0)).abs() < TOLERANCE);
    }

    #[test]
    fn center_of_mass_config_reaches_the_host() {
        let mock = MockHost::new();
        mock.world.borrow_mut().add_entity(7, Vec3::ZERO, Vec3::ZERO);
        let mut manager = PortalManager::new(mock.build_host());

        manager.set_entity_center_of_mass_config(
            7,
            CenterOfMassConfig::custom_point(Vec3::new(0.0, 0.5, 0.0)),
        );

        assert!(manager.entity_center_of_mass_config(7).is_some());
        let world = mock.world.borrow();
        assert_eq!(
            world.center_of_mass_offsets,
            vec![(7, Vec3::new(0.0, 0.5, 0.0))]
        );
    }

    #[test]
    fn update_drives_logical_sync_after_events() {
        let mock = MockHost::new();
        mock.world
            .borrow_mut()
            .add_entity(7, Vec3::new(-4.0, 0.0, 0.0), Vec3::new(-2.0, 0.0, 0.0));
        let (mut manager, p, _q) = manager_with_linked_pair(&mock);

        manager.on_entity_intersect_portal_start(7, p);
        assert!(mock.world.borrow().forced_states.is_empty());

        manager.update(1.0);
        assert!(!mock.world.borrow().forced_states.is_empty());
    }
}
