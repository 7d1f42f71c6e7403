//! Recording mock host shared by the manager tests.

use std::cell::RefCell;
use std::rc::Rc;

use glam::Vec3;
use rustc_hash::FxHashMap;

use riftgate_shared::chain::{
    ChainNodeCreateDescriptor, GhostEntitySnapshot, PhysicsConstraintState,
};
use riftgate_shared::types::{
    CameraParams, ClippingPlane, EntityDescription, EntityId, LogicalEntityId, MergeStrategy,
    PhysicsState, PortalFace, PortalId, Transform,
};

use crate::interfaces::{
    Host, PhysicsDataProvider, PhysicsManipulator, PortalEventHandler, RenderManipulator,
    RenderQuery,
};

#[derive(Debug, Clone, PartialEq)]
pub enum MockEvent {
    TeleportBegin(EntityId),
    TeleportComplete(EntityId),
    GhostCreated { main: EntityId, ghost: EntityId },
    GhostDestroyed { main: EntityId, ghost: EntityId },
    RolesSwapped { old_main: EntityId, new_main: EntityId },
    PortalsLinked(PortalId, PortalId),
    PortalsUnlinked(PortalId, PortalId),
    RecursiveState(PortalId, bool),
    LogicalCreated(LogicalEntityId),
    LogicalDestroyed(LogicalEntityId),
    LogicalConstrained(LogicalEntityId),
    LogicalConstraintReleased(LogicalEntityId),
    LogicalMerged(LogicalEntityId, MergeStrategy),
}

#[derive(Default)]
pub struct MockWorld {
    pub transforms: FxHashMap<EntityId, Transform>,
    pub physics: FxHashMap<EntityId, PhysicsState>,
    pub bounds: FxHashMap<EntityId, (Vec3, Vec3)>,
    pub constraints: FxHashMap<EntityId, PhysicsConstraintState>,
    pub applied_forces: FxHashMap<EntityId, (Vec3, Vec3)>,

    pub next_spawned_id: EntityId,
    pub refuse_node_creation: bool,
    pub refuse_role_swap: bool,

    pub created_nodes: Vec<(EntityId, ChainNodeCreateDescriptor)>,
    pub destroyed_nodes: Vec<EntityId>,
    pub destroyed_ghosts: Vec<EntityId>,
    pub role_swaps: Vec<(EntityId, EntityId, PortalFace, PortalFace)>,
    pub functional_states: Vec<(EntityId, bool)>,
    pub engine_control_changes: Vec<(EntityId, bool)>,
    pub forced_states: Vec<(EntityId, Transform, PhysicsState)>,
    pub direct_transforms: Vec<(EntityId, Transform)>,
    pub clipping_calls: Vec<(EntityId, usize)>,
    pub clipping_disabled: Vec<EntityId>,
    pub center_of_mass_offsets: Vec<(EntityId, Vec3)>,
    pub batch_sync_sizes: Vec<usize>,
    pub updated_ghosts: Vec<EntityId>,
    pub proxies: Vec<EntityId>,
    pub proxy_forces: Vec<(EntityId, Vec3)>,
    pub proxy_torques: Vec<(EntityId, Vec3)>,
    pub events: Vec<MockEvent>,
}

impl MockWorld {
    pub fn add_entity(&mut self, entity_id: EntityId, position: Vec3, linear_velocity: Vec3) {
        self.transforms
            .insert(entity_id, Transform::new(position, glam::Quat::IDENTITY));
        self.physics.insert(
            entity_id,
            PhysicsState {
                linear_velocity,
                ..PhysicsState::default()
            },
        );
        self.bounds
            .insert(entity_id, (Vec3::splat(-0.5), Vec3::splat(0.5)));
    }

    pub fn count_events(&self, matcher: impl Fn(&MockEvent) -> bool) -> usize {
        self.events.iter().filter(|event| matcher(event)).count()
    }
}

pub struct MockDataProvider {
    pub world: Rc<RefCell<MockWorld>>,
}

impl PhysicsDataProvider for MockDataProvider {
    fn get_entity_transform(&self, entity_id: EntityId) -> Transform {
        self.world
            .borrow()
            .transforms
            .get(&entity_id)
            .copied()
            .unwrap_or_default()
    }

    fn get_entity_physics_state(&self, entity_id: EntityId) -> PhysicsState {
        self.world
            .borrow()
            .physics
            .get(&entity_id)
            .copied()
            .unwrap_or_default()
    }

    fn get_entity_bounds(&self, entity_id: EntityId) -> (Vec3, Vec3) {
        self.world
            .borrow()
            .bounds
            .get(&entity_id)
            .copied()
            .unwrap_or((Vec3::splat(-0.5), Vec3::splat(0.5)))
    }

    fn is_entity_valid(&self, entity_id: EntityId) -> bool {
        self.world.borrow().transforms.contains_key(&entity_id)
    }

    fn get_entity_description(&self, entity_id: EntityId) -> EntityDescription {
        EntityDescription {
            entity_id,
            transform: self.get_entity_transform(entity_id),
            physics: self.get_entity_physics_state(entity_id),
            ..EntityDescription::default()
        }
    }

    fn calculate_entity_center_of_mass(&self, entity_id: EntityId) -> Vec3 {
        self.get_entity_transform(entity_id).position
    }
}

pub struct MockManipulator {
    pub world: Rc<RefCell<MockWorld>>,
}

impl PhysicsManipulator for MockManipulator {
    fn set_entity_transform(&mut self, entity_id: EntityId, transform: &Transform) {
        let mut world = self.world.borrow_mut();
        world.transforms.insert(entity_id, *transform);
        world.direct_transforms.push((entity_id, *transform));
    }

    fn set_entity_physics_state(&mut self, entity_id: EntityId, state: &PhysicsState) {
        self.world.borrow_mut().physics.insert(entity_id, *state);
    }

    fn set_entity_collision_enabled(&mut self, _entity_id: EntityId, _enabled: bool) {}
    fn set_entity_visible(&mut self, _entity_id: EntityId, _visible: bool) {}

    fn set_entity_velocity(&mut self, entity_id: EntityId, velocity: Vec3) {
        if let Some(state) = self.world.borrow_mut().physics.get_mut(&entity_id) {
            state.linear_velocity = velocity;
        }
    }

    fn set_entity_angular_velocity(&mut self, entity_id: EntityId, angular_velocity: Vec3) {
        if let Some(state) = self.world.borrow_mut().physics.get_mut(&entity_id) {
            state.angular_velocity = angular_velocity;
        }
    }

    fn create_ghost_entity(
        &mut self,
        _source_entity_id: EntityId,
        ghost_transform: &Transform,
        ghost_physics: &PhysicsState,
    ) -> Option<EntityId> {
        let mut world = self.world.borrow_mut();
        if world.refuse_node_creation {
            return None;
        }
        let id = 1000 + world.next_spawned_id;
        world.next_spawned_id += 1;
        world.transforms.insert(id, *ghost_transform);
        world.physics.insert(id, *ghost_physics);
        Some(id)
    }

    fn create_full_functional_ghost(
        &mut self,
        description: &EntityDescription,
        ghost_transform: &Transform,
        ghost_physics: &PhysicsState,
        _source_face: PortalFace,
        _target_face: PortalFace,
    ) -> Option<EntityId> {
        self.create_ghost_entity(description.entity_id, ghost_transform, ghost_physics)
    }

    fn destroy_ghost_entity(&mut self, ghost_entity_id: EntityId) {
        let mut world = self.world.borrow_mut();
        world.transforms.remove(&ghost_entity_id);
        world.physics.remove(&ghost_entity_id);
        world.destroyed_ghosts.push(ghost_entity_id);
    }

    fn update_ghost_entity(
        &mut self,
        ghost_entity_id: EntityId,
        transform: &Transform,
        physics: &PhysicsState,
    ) {
        let mut world = self.world.borrow_mut();
        world.transforms.insert(ghost_entity_id, *transform);
        world.physics.insert(ghost_entity_id, *physics);
        world.updated_ghosts.push(ghost_entity_id);
    }

    fn set_ghost_entity_bounds(&mut self, ghost_entity_id: EntityId, bounds_min: Vec3, bounds_max: Vec3) {
        self.world
            .borrow_mut()
            .bounds
            .insert(ghost_entity_id, (bounds_min, bounds_max));
    }

    fn sync_ghost_entities(&mut self, snapshots: &[GhostEntitySnapshot]) {
        self.world.borrow_mut().batch_sync_sizes.push(snapshots.len());
    }

    fn create_chain_node_entity(&mut self, descriptor: &ChainNodeCreateDescriptor) -> Option<EntityId> {
        let mut world = self.world.borrow_mut();
        if world.refuse_node_creation {
            return None;
        }
        let id = 1000 + world.next_spawned_id;
        world.next_spawned_id += 1;
        world.transforms.insert(id, descriptor.target_transform);
        world.physics.insert(id, descriptor.target_physics);
        world
            .bounds
            .insert(id, (Vec3::splat(-0.5), Vec3::splat(0.5)));
        world.created_nodes.push((id, descriptor.clone()));
        Some(id)
    }

    fn destroy_chain_node_entity(&mut self, node_entity_id: EntityId) {
        let mut world = self.world.borrow_mut();
        world.transforms.remove(&node_entity_id);
        world.physics.remove(&node_entity_id);
        world.destroyed_nodes.push(node_entity_id);
    }

    fn set_entity_clipping_plane(&mut self, entity_id: EntityId, _plane: &ClippingPlane) {
        self.world.borrow_mut().clipping_calls.push((entity_id, 1));
    }

    fn disable_entity_clipping(&mut self, entity_id: EntityId) {
        self.world.borrow_mut().clipping_disabled.push(entity_id);
    }

    fn set_entities_clipping_states(
        &mut self,
        entity_ids: &[EntityId],
        planes: &[ClippingPlane],
        _enabled: &[bool],
    ) {
        let mut world = self.world.borrow_mut();
        for entity_id in entity_ids {
            world.clipping_calls.push((*entity_id, planes.len()));
        }
    }

    fn swap_entity_roles(&mut self, main_entity_id: EntityId, ghost_entity_id: EntityId) -> bool {
        self.swap_entity_roles_with_faces(main_entity_id, ghost_entity_id, PortalFace::A, PortalFace::B)
    }

    fn swap_entity_roles_with_faces(
        &mut self,
        main_entity_id: EntityId,
        ghost_entity_id: EntityId,
        source_face: PortalFace,
        target_face: PortalFace,
    ) -> bool {
        let mut world = self.world.borrow_mut();
        if world.refuse_role_swap {
            return false;
        }
        // Role swaps never touch physical state; only the record is kept.
        world
            .role_swaps
            .push((main_entity_id, ghost_entity_id, source_face, target_face));
        true
    }

    fn set_entity_functional_state(&mut self, entity_id: EntityId, fully_functional: bool) {
        self.world
            .borrow_mut()
            .functional_states
            .push((entity_id, fully_functional));
    }

    fn copy_all_entity_properties(&mut self, _source: EntityId, _target: EntityId) -> bool {
        true
    }

    fn set_entity_center_of_mass(&mut self, entity_id: EntityId, center_offset: Vec3) {
        self.world
            .borrow_mut()
            .center_of_mass_offsets
            .push((entity_id, center_offset));
    }

    fn set_entity_physics_engine_controlled(&mut self, entity_id: EntityId, engine_controlled: bool) {
        self.world
            .borrow_mut()
            .engine_control_changes
            .push((entity_id, engine_controlled));
    }

    fn detect_entity_collision_constraints(
        &mut self,
        entity_id: EntityId,
    ) -> Option<PhysicsConstraintState> {
        self.world.borrow().constraints.get(&entity_id).copied()
    }

    fn force_set_entity_physics_state(
        &mut self,
        entity_id: EntityId,
        transform: &Transform,
        physics: &PhysicsState,
    ) {
        let mut world = self.world.borrow_mut();
        world.transforms.insert(entity_id, *transform);
        world.physics.insert(entity_id, *physics);
        world.forced_states.push((entity_id, *transform, *physics));
    }

    fn create_physics_simulation_proxy(
        &mut self,
        _template_entity_id: EntityId,
        initial_transform: &Transform,
        initial_physics: &PhysicsState,
    ) -> Option<EntityId> {
        let mut world = self.world.borrow_mut();
        let id = 9000 + world.next_spawned_id;
        world.next_spawned_id += 1;
        world.transforms.insert(id, *initial_transform);
        world.physics.insert(id, *initial_physics);
        world.proxies.push(id);
        Some(id)
    }

    fn destroy_physics_simulation_proxy(&mut self, proxy_entity_id: EntityId) {
        let mut world = self.world.borrow_mut();
        world.transforms.remove(&proxy_entity_id);
        world.physics.remove(&proxy_entity_id);
        world.proxies.retain(|id| *id != proxy_entity_id);
    }

    fn apply_force_to_proxy(&mut self, proxy_entity_id: EntityId, force: Vec3, _application_point: Vec3) {
        self.world
            .borrow_mut()
            .proxy_forces
            .push((proxy_entity_id, force));
    }

    fn apply_torque_to_proxy(&mut self, proxy_entity_id: EntityId, torque: Vec3) {
        self.world
            .borrow_mut()
            .proxy_torques
            .push((proxy_entity_id, torque));
    }

    fn clear_forces_on_proxy(&mut self, _proxy_entity_id: EntityId) {}

    fn set_proxy_physics_material(
        &mut self,
        _proxy_entity_id: EntityId,
        _friction: f32,
        _restitution: f32,
        _linear_damping: f32,
        _angular_damping: f32,
    ) {
    }

    fn get_entity_applied_forces(&mut self, entity_id: EntityId) -> Option<(Vec3, Vec3)> {
        self.world.borrow().applied_forces.get(&entity_id).copied()
    }
}

pub struct MockEventHandler {
    pub world: Rc<RefCell<MockWorld>>,
}

impl PortalEventHandler for MockEventHandler {
    fn on_entity_teleport_begin(
        &mut self,
        entity_id: EntityId,
        _from_portal: PortalId,
        _to_portal: PortalId,
    ) -> bool {
        self.world
            .borrow_mut()
            .events
            .push(MockEvent::TeleportBegin(entity_id));
        true
    }

    fn on_entity_teleport_complete(
        &mut self,
        entity_id: EntityId,
        _from_portal: Option<PortalId>,
        _to_portal: Option<PortalId>,
    ) -> bool {
        self.world
            .borrow_mut()
            .events
            .push(MockEvent::TeleportComplete(entity_id));
        true
    }

    fn on_ghost_entity_created(
        &mut self,
        main_entity: EntityId,
        ghost_entity: EntityId,
        _portal: PortalId,
    ) -> bool {
        self.world.borrow_mut().events.push(MockEvent::GhostCreated {
            main: main_entity,
            ghost: ghost_entity,
        });
        true
    }

    fn on_ghost_entity_destroyed(
        &mut self,
        main_entity: EntityId,
        ghost_entity: EntityId,
        _portal: Option<PortalId>,
    ) -> bool {
        self.world.borrow_mut().events.push(MockEvent::GhostDestroyed {
            main: main_entity,
            ghost: ghost_entity,
        });
        true
    }

    fn on_entity_roles_swapped(
        &mut self,
        old_main_entity: EntityId,
        _old_ghost_entity: EntityId,
        new_main_entity: EntityId,
        _new_ghost_entity: EntityId,
        _portal: Option<PortalId>,
        _main_transform: &Transform,
        _ghost_transform: &Transform,
    ) -> bool {
        self.world.borrow_mut().events.push(MockEvent::RolesSwapped {
            old_main: old_main_entity,
            new_main: new_main_entity,
        });
        true
    }

    fn on_portals_linked(&mut self, portal1: PortalId, portal2: PortalId) {
        self.world
            .borrow_mut()
            .events
            .push(MockEvent::PortalsLinked(portal1, portal2));
    }

    fn on_portals_unlinked(&mut self, portal1: PortalId, portal2: PortalId) {
        self.world
            .borrow_mut()
            .events
            .push(MockEvent::PortalsUnlinked(portal1, portal2));
    }

    fn on_portal_recursive_state(&mut self, portal_id: PortalId, is_recursive: bool) {
        self.world
            .borrow_mut()
            .events
            .push(MockEvent::RecursiveState(portal_id, is_recursive));
    }

    fn on_logical_entity_created(
        &mut self,
        logical_id: LogicalEntityId,
        _main_entity: EntityId,
        _ghost_entity: Option<EntityId>,
    ) {
        self.world
            .borrow_mut()
            .events
            .push(MockEvent::LogicalCreated(logical_id));
    }

    fn on_logical_entity_destroyed(
        &mut self,
        logical_id: LogicalEntityId,
        _main_entity: EntityId,
        _ghost_entity: Option<EntityId>,
    ) {
        self.world
            .borrow_mut()
            .events
            .push(MockEvent::LogicalDestroyed(logical_id));
    }

    fn on_logical_entity_constrained(
        &mut self,
        logical_id: LogicalEntityId,
        _constraint: &PhysicsConstraintState,
    ) {
        self.world
            .borrow_mut()
            .events
            .push(MockEvent::LogicalConstrained(logical_id));
    }

    fn on_logical_entity_constraint_released(&mut self, logical_id: LogicalEntityId) {
        self.world
            .borrow_mut()
            .events
            .push(MockEvent::LogicalConstraintReleased(logical_id));
    }

    fn on_logical_entity_state_merged(&mut self, logical_id: LogicalEntityId, strategy: MergeStrategy) {
        self.world
            .borrow_mut()
            .events
            .push(MockEvent::LogicalMerged(logical_id, strategy));
    }
}

/// Render query that sees everything, so render-pass tests are deterministic.
pub struct AllSeeingRenderQuery {
    pub camera: CameraParams,
}

impl Default for AllSeeingRenderQuery {
    fn default() -> Self {
        Self {
            camera: CameraParams::default(),
        }
    }
}

impl RenderQuery for AllSeeingRenderQuery {
    fn get_main_camera(&self) -> CameraParams {
        self.camera
    }

    fn is_point_in_view_frustum(&self, _point: Vec3, _camera: &CameraParams) -> bool {
        true
    }
}

pub struct NullRenderManipulator;

impl RenderManipulator for NullRenderManipulator {
    fn set_entity_render_enabled(&mut self, _entity_id: EntityId, _enabled: bool) {}
    fn set_clipping_plane(&mut self, _plane: &ClippingPlane) {}
    fn disable_clipping_plane(&mut self) {}
    fn render_portal_recursive_view(&mut self, _portal_id: PortalId, _recursion_depth: u32) {}
}

pub struct MockHost {
    pub world: Rc<RefCell<MockWorld>>,
}

impl MockHost {
    pub fn new() -> Self {
        Self {
            world: Rc::new(RefCell::new(MockWorld::default())),
        }
    }

    pub fn data(&self) -> MockDataProvider {
        MockDataProvider {
            world: self.world.clone(),
        }
    }

    pub fn physics(&self) -> MockManipulator {
        MockManipulator {
            world: self.world.clone(),
        }
    }

    pub fn events(&self) -> MockEventHandler {
        MockEventHandler {
            world: self.world.clone(),
        }
    }

    /// Full capability bundle backed by this mock world.
    pub fn build_host(&self) -> Host {
        Host::new(Box::new(self.data()), Box::new(self.physics()))
            .with_events(Box::new(self.events()))
    }
}
