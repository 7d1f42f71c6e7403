//! Host capability seams.
//!
//! The engine never owns entities, pixels or collision detection; it reads
//! physics state through [`PhysicsDataProvider`], writes side effects
//! through [`PhysicsManipulator`], and uses the optional render/event
//! capabilities when the host provides them. All calls are synchronous.

use glam::Vec3;
use riftgate_shared::chain::{
    ChainNodeCreateDescriptor, GhostEntitySnapshot, PhysicsConstraintState,
};
use riftgate_shared::types::{
    CameraParams, CenterOfMassConfig, ClippingPlane, EntityDescription, EntityId, MergeStrategy,
    LogicalEntityId, PhysicsState, PortalFace, PortalId, Transform,
};

/// Read-only physics queries. Required.
pub trait PhysicsDataProvider {
    fn get_entity_transform(&self, entity_id: EntityId) -> Transform;
    fn get_entity_physics_state(&self, entity_id: EntityId) -> PhysicsState;
    /// Local-space AABB as (min, max).
    fn get_entity_bounds(&self, entity_id: EntityId) -> (Vec3, Vec3);
    fn is_entity_valid(&self, entity_id: EntityId) -> bool;
    fn get_entity_description(&self, entity_id: EntityId) -> EntityDescription;

    fn get_entities_transforms(&self, entity_ids: &[EntityId]) -> Vec<Transform> {
        entity_ids.iter().map(|id| self.get_entity_transform(*id)).collect()
    }

    fn get_entities_physics_states(&self, entity_ids: &[EntityId]) -> Vec<PhysicsState> {
        entity_ids.iter().map(|id| self.get_entity_physics_state(*id)).collect()
    }

    fn get_entities_descriptions(&self, entity_ids: &[EntityId]) -> Vec<EntityDescription> {
        entity_ids.iter().map(|id| self.get_entity_description(*id)).collect()
    }

    /// World-space center of mass under the entity's configured policy.
    fn calculate_entity_center_of_mass(&self, entity_id: EntityId) -> Vec3;

    fn has_center_of_mass_config(&self, _entity_id: EntityId) -> bool {
        false
    }

    fn get_entity_center_of_mass_config(&self, _entity_id: EntityId) -> CenterOfMassConfig {
        CenterOfMassConfig::default()
    }
}

/// Physics side effects the engine requests from the host. Required.
///
/// The host owns every entity; the engine only ever asks.
pub trait PhysicsManipulator {
    fn set_entity_transform(&mut self, entity_id: EntityId, transform: &Transform);
    fn set_entity_physics_state(&mut self, entity_id: EntityId, state: &PhysicsState);
    fn set_entity_collision_enabled(&mut self, entity_id: EntityId, enabled: bool);
    fn set_entity_visible(&mut self, entity_id: EntityId, visible: bool);
    fn set_entity_velocity(&mut self, entity_id: EntityId, velocity: Vec3);
    fn set_entity_angular_velocity(&mut self, entity_id: EntityId, angular_velocity: Vec3);

    /// Returns the new ghost's id, or `None` if the host refused.
    fn create_ghost_entity(
        &mut self,
        source_entity_id: EntityId,
        ghost_transform: &Transform,
        ghost_physics: &PhysicsState,
    ) -> Option<EntityId>;

    fn create_full_functional_ghost(
        &mut self,
        description: &EntityDescription,
        ghost_transform: &Transform,
        ghost_physics: &PhysicsState,
        source_face: PortalFace,
        target_face: PortalFace,
    ) -> Option<EntityId>;

    fn destroy_ghost_entity(&mut self, ghost_entity_id: EntityId);
    fn update_ghost_entity(
        &mut self,
        ghost_entity_id: EntityId,
        transform: &Transform,
        physics: &PhysicsState,
    );
    fn set_ghost_entity_bounds(&mut self, ghost_entity_id: EntityId, bounds_min: Vec3, bounds_max: Vec3);
    fn sync_ghost_entities(&mut self, snapshots: &[GhostEntitySnapshot]);

    /// Returns the new node entity's id, or `None` if the host refused.
    fn create_chain_node_entity(&mut self, descriptor: &ChainNodeCreateDescriptor) -> Option<EntityId>;
    fn destroy_chain_node_entity(&mut self, node_entity_id: EntityId);

    fn set_entity_clipping_plane(&mut self, entity_id: EntityId, plane: &ClippingPlane);
    fn disable_entity_clipping(&mut self, entity_id: EntityId);
    fn set_entities_clipping_states(
        &mut self,
        entity_ids: &[EntityId],
        planes: &[ClippingPlane],
        enabled: &[bool],
    );

    fn swap_entity_roles(&mut self, main_entity_id: EntityId, ghost_entity_id: EntityId) -> bool;

    /// Swaps which entity carries the main role.
    ///
    /// Contract: the host must NOT touch either entity's own physical state
    /// (position, velocity, orientation) — only the control role changes.
    /// Returning false means the host refused; the engine leaves its own
    /// state untouched.
    fn swap_entity_roles_with_faces(
        &mut self,
        main_entity_id: EntityId,
        ghost_entity_id: EntityId,
        source_face: PortalFace,
        target_face: PortalFace,
    ) -> bool;

    fn set_entity_functional_state(&mut self, entity_id: EntityId, fully_functional: bool);
    fn copy_all_entity_properties(&mut self, source: EntityId, target: EntityId) -> bool;

    /// Local-space center-of-mass offset the host should use for crossing
    /// detection.
    fn set_entity_center_of_mass(&mut self, entity_id: EntityId, center_offset: Vec3);

    /// `engine_controlled = false` makes the host treat the entity as
    /// kinematic while a logical entity drives it.
    fn set_entity_physics_engine_controlled(&mut self, entity_id: EntityId, engine_controlled: bool);

    fn detect_entity_collision_constraints(
        &mut self,
        entity_id: EntityId,
    ) -> Option<PhysicsConstraintState>;

    fn force_set_entity_physics_state(
        &mut self,
        entity_id: EntityId,
        transform: &Transform,
        physics: &PhysicsState,
    );

    fn force_set_entities_physics_states(
        &mut self,
        entity_ids: &[EntityId],
        transforms: &[Transform],
        physics: &[PhysicsState],
    ) {
        for ((id, transform), state) in entity_ids.iter().zip(transforms).zip(physics) {
            self.force_set_entity_physics_state(*id, transform, state);
        }
    }

    fn create_physics_simulation_proxy(
        &mut self,
        template_entity_id: EntityId,
        initial_transform: &Transform,
        initial_physics: &PhysicsState,
    ) -> Option<EntityId>;
    fn destroy_physics_simulation_proxy(&mut self, proxy_entity_id: EntityId);
    fn apply_force_to_proxy(&mut self, proxy_entity_id: EntityId, force: Vec3, application_point: Vec3);
    fn apply_torque_to_proxy(&mut self, proxy_entity_id: EntityId, torque: Vec3);
    fn clear_forces_on_proxy(&mut self, proxy_entity_id: EntityId);
    fn set_proxy_physics_material(
        &mut self,
        proxy_entity_id: EntityId,
        friction: f32,
        restitution: f32,
        linear_damping: f32,
        angular_damping: f32,
    );

    /// Current accumulated (force, torque) on the entity, if the host tracks
    /// them.
    fn get_entity_applied_forces(&mut self, entity_id: EntityId) -> Option<(Vec3, Vec3)>;
}

/// Render-side queries. Optional; recursion rendering degrades without it.
pub trait RenderQuery {
    fn get_main_camera(&self) -> CameraParams;
    fn is_point_in_view_frustum(&self, point: Vec3, camera: &CameraParams) -> bool;
}

/// Render side effects. Optional.
pub trait RenderManipulator {
    fn set_entity_render_enabled(&mut self, entity_id: EntityId, enabled: bool);
    fn set_clipping_plane(&mut self, plane: &ClippingPlane);
    fn disable_clipping_plane(&mut self);
    fn render_portal_recursive_view(&mut self, portal_id: PortalId, recursion_depth: u32);
}

/// Notifications back to the host. Optional; every method has a default so
/// hosts implement only what they care about. A `false` return means the
/// host refused or failed; the engine logs and continues.
#[allow(unused_variables)]
pub trait PortalEventHandler {
    fn on_entity_teleport_begin(
        &mut self,
        entity_id: EntityId,
        from_portal: PortalId,
        to_portal: PortalId,
    ) -> bool {
        true
    }

    fn on_entity_teleport_complete(
        &mut self,
        entity_id: EntityId,
        from_portal: Option<PortalId>,
        to_portal: Option<PortalId>,
    ) -> bool {
        true
    }

    fn on_ghost_entity_created(
        &mut self,
        main_entity: EntityId,
        ghost_entity: EntityId,
        portal: PortalId,
    ) -> bool {
        true
    }

    fn on_ghost_entity_destroyed(
        &mut self,
        main_entity: EntityId,
        ghost_entity: EntityId,
        portal: Option<PortalId>,
    ) -> bool {
        true
    }

    /// Fired after a successful role swap so the host can migrate camera,
    /// input and audio focus. Both transforms are post-swap reads.
    #[allow(clippy::too_many_arguments)]
    fn on_entity_roles_swapped(
        &mut self,
        old_main_entity: EntityId,
        old_ghost_entity: EntityId,
        new_main_entity: EntityId,
        new_ghost_entity: EntityId,
        portal: Option<PortalId>,
        main_transform: &Transform,
        ghost_transform: &Transform,
    ) -> bool {
        true
    }

    fn on_portals_linked(&mut self, portal1: PortalId, portal2: PortalId) {}
    fn on_portals_unlinked(&mut self, portal1: PortalId, portal2: PortalId) {}
    fn on_portal_recursive_state(&mut self, portal_id: PortalId, is_recursive: bool) {}

    fn on_logical_entity_created(
        &mut self,
        logical_id: LogicalEntityId,
        main_entity: EntityId,
        ghost_entity: Option<EntityId>,
    ) {
    }

    fn on_logical_entity_destroyed(
        &mut self,
        logical_id: LogicalEntityId,
        main_entity: EntityId,
        ghost_entity: Option<EntityId>,
    ) {
    }

    fn on_logical_entity_constrained(
        &mut self,
        logical_id: LogicalEntityId,
        constraint: &PhysicsConstraintState,
    ) {
    }

    fn on_logical_entity_constraint_released(&mut self, logical_id: LogicalEntityId) {}

    fn on_logical_entity_state_merged(&mut self, logical_id: LogicalEntityId, strategy: MergeStrategy) {}
}

/// The four events the host physics engine feeds the engine, in temporal
/// order, per entity. Crossing detection happens host-side; these are the
/// only way state enters the engine.
pub trait PortalPhysicsEventReceiver {
    /// Entity AABB started intersecting the portal plane.
    fn on_entity_intersect_portal_start(&mut self, entity_id: EntityId, portal_id: PortalId);
    /// Entity center of mass crossed the plane; triggers the role migration.
    fn on_entity_center_crossed_portal(
        &mut self,
        entity_id: EntityId,
        portal_id: PortalId,
        crossed_face: PortalFace,
    );
    /// Entity AABB is entirely behind the plane.
    fn on_entity_fully_passed_portal(&mut self, entity_id: EntityId, portal_id: PortalId);
    /// Entity AABB no longer intersects the portal plane.
    fn on_entity_exit_portal(&mut self, entity_id: EntityId, portal_id: PortalId);
}

/// The host capability bundle the engine is constructed with. The two
/// physics interfaces are required; everything else is optional and guarded
/// at each call site.
pub struct Host {
    pub physics_data: Box<dyn PhysicsDataProvider>,
    pub physics: Box<dyn PhysicsManipulator>,
    pub render_query: Option<Box<dyn RenderQuery>>,
    pub render: Option<Box<dyn RenderManipulator>>,
    pub events: Option<Box<dyn PortalEventHandler>>,
}

impl Host {
    pub fn new(
        physics_data: Box<dyn PhysicsDataProvider>,
        physics: Box<dyn PhysicsManipulator>,
    ) -> Self {
        Self {
            physics_data,
            physics,
            render_query: None,
            render: None,
            events: None,
        }
    }

    pub fn with_render(
        mut self,
        query: Box<dyn RenderQuery>,
        manipulator: Box<dyn RenderManipulator>,
    ) -> Self {
        self.render_query = Some(query);
        self.render = Some(manipulator);
        self
    }

    pub fn with_events(mut self, events: Box<dyn PortalEventHandler>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn supports_rendering(&self) -> bool {
        self.render_query.is_some() && self.render.is_some()
    }

    /// Runs `f` against the event handler when the host registered one.
    pub fn notify(&mut self, f: impl FnOnce(&mut dyn PortalEventHandler)) {
        if let Some(events) = self.events.as_deref_mut() {
            f(events);
        }
    }
}
