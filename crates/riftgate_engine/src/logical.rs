//! Unified physics control over chain members.
//!
//! A logical entity binds the members of one chain into a single physics
//! abstraction: member states merge into one unified state under a chosen
//! strategy, the most restrictive constraint wins for everyone, and the
//! unified state is pushed back so the members never drift apart. While a
//! member is controlled here the host must treat it as kinematic
//! (`set_entity_physics_engine_controlled(id, false)`); destruction always
//! hands control back.

use glam::Vec3;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use riftgate_shared::chain::{LogicalEntityState, PhysicsConstraintState};
use riftgate_shared::types::{
    EntityId, LogicalEntityId, MergeStrategy, PhysicsState, Transform,
};

use crate::interfaces::Host;

const MASS_EPSILON: f32 = 0.001;
const WEIGHT_EPSILON: f32 = 0.001;
const VELOCITY_EPSILON: f32 = 0.001;

#[derive(Debug, Clone, Copy, Default)]
pub struct LogicalEntityStats {
    pub total_logical_entities: usize,
    pub constrained_entities: usize,
    pub unified_mode_entities: usize,
}

pub struct LogicalEntityManager {
    logical_entities: FxHashMap<LogicalEntityId, LogicalEntityState>,
    entity_to_logical: FxHashMap<EntityId, LogicalEntityId>,
    next_logical_id: LogicalEntityId,
    update_frequency: f32,
    time_since_update: f32,
}

impl Default for LogicalEntityManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LogicalEntityManager {
    pub fn new() -> Self {
        Self {
            logical_entities: FxHashMap::default(),
            entity_to_logical: FxHashMap::default(),
            next_logical_id: 1,
            update_frequency: 60.0,
            time_since_update: 0.0,
        }
    }

    pub fn set_update_frequency(&mut self, frequency: f32) {
        self.update_frequency = frequency.max(1.0);
    }

    /// Binds a main/ghost pair into one logical entity. Both members stop
    /// being engine controlled until the logical entity is destroyed.
    pub fn create_logical_entity(
        &mut self,
        host: &mut Host,
        main_entity_id: EntityId,
        ghost_entity_id: Option<EntityId>,
        strategy: MergeStrategy,
    ) -> LogicalEntityId {
        let logical_id = self.allocate_id();

        let mut state = LogicalEntityState::new(logical_id, main_entity_id);
        state.ghost_entity_id = ghost_entity_id;
        state.merge_strategy = strategy;
        state.ignore_engine_physics = true;
        state.primary_entity_id = Some(main_entity_id);

        let (main_weight, ghost_weight) = default_weights(strategy);
        state.main_weight = main_weight;
        state.ghost_weight = ghost_weight;
        state.use_physics_simulation =
            matches!(strategy, MergeStrategy::ForceSummation | MergeStrategy::PhysicsSimulation);

        state.controlled_entities.push(main_entity_id);
        state.entity_weights.push(main_weight);
        if let Some(ghost) = ghost_entity_id {
            state.controlled_entities.push(ghost);
            state.entity_weights.push(ghost_weight);
        }

        self.entity_to_logical.insert(main_entity_id, logical_id);
        if let Some(ghost) = ghost_entity_id {
            self.entity_to_logical.insert(ghost, logical_id);
        }

        host.physics
            .set_entity_physics_engine_controlled(main_entity_id, false);
        if let Some(ghost) = ghost_entity_id {
            host.physics.set_entity_physics_engine_controlled(ghost, false);
        }

        self.logical_entities.insert(logical_id, state);
        self.remerge(host, logical_id);

        host.notify(|events| {
            events.on_logical_entity_created(logical_id, main_entity_id, ghost_entity_id)
        });

        debug!(logical_id, main_entity_id, ?ghost_entity_id, "logical entity created");
        logical_id
    }

    /// Binds an arbitrary member list (a whole chain) under one logical
    /// entity. Weights default to 1 when the caller supplies fewer than one
    /// per member.
    pub fn create_multi_entity_control(
        &mut self,
        host: &mut Host,
        entities: &[EntityId],
        weights: &[f32],
    ) -> Option<LogicalEntityId> {
        let first = *entities.first()?;
        let logical_id = self.allocate_id();

        let mut state = LogicalEntityState::new(logical_id, first);
        state.primary_entity_id = Some(first);
        state.ignore_engine_physics = true;
        state.controlled_entities = entities.to_vec();
        state.entity_weights = (0..entities.len())
            .map(|i| weights.get(i).copied().unwrap_or(1.0))
            .collect();

        for entity_id in entities {
            self.entity_to_logical.insert(*entity_id, logical_id);
            host.physics.set_entity_physics_engine_controlled(*entity_id, false);
        }

        self.logical_entities.insert(logical_id, state);
        self.remerge(host, logical_id);

        host.notify(|events| {
            events.on_logical_entity_created(logical_id, first, entities.get(1).copied())
        });

        debug!(logical_id, members = entities.len(), "multi-entity logical control created");
        Some(logical_id)
    }

    /// Restores engine control for every member and drops the record.
    pub fn destroy_logical_entity(&mut self, host: &mut Host, logical_id: LogicalEntityId) {
        let Some(state) = self.logical_entities.remove(&logical_id) else {
            return;
        };

        let mut members = state.controlled_entities.clone();
        members.push(state.main_entity_id);
        if let Some(ghost) = state.ghost_entity_id {
            members.push(ghost);
        }
        members.sort_unstable();
        members.dedup();

        for entity_id in &members {
            host.physics.set_entity_physics_engine_controlled(*entity_id, true);
            self.entity_to_logical.remove(entity_id);
        }

        if let Some(proxy) = state.simulation_proxy_entity {
            host.physics.destroy_physics_simulation_proxy(proxy);
        }

        host.notify(|events| {
            events.on_logical_entity_destroyed(
                logical_id,
                state.main_entity_id,
                state.ghost_entity_id,
            )
        });

        debug!(logical_id, "logical entity destroyed, engine control restored");
    }

    pub fn add_controlled_entity(
        &mut self,
        host: &mut Host,
        logical_id: LogicalEntityId,
        entity_id: EntityId,
        weight: f32,
    ) -> bool {
        let Some(state) = self.logical_entities.get_mut(&logical_id) else {
            return false;
        };
        if state.controlled_entities.contains(&entity_id) {
            return false;
        }

        state.controlled_entities.push(entity_id);
        state.entity_weights.push(weight);
        self.entity_to_logical.insert(entity_id, logical_id);
        host.physics.set_entity_physics_engine_controlled(entity_id, false);
        true
    }

    pub fn remove_controlled_entity(
        &mut self,
        host: &mut Host,
        logical_id: LogicalEntityId,
        entity_id: EntityId,
    ) -> bool {
        let Some(state) = self.logical_entities.get_mut(&logical_id) else {
            return false;
        };
        let Some(index) = state
            .controlled_entities
            .iter()
            .position(|id| *id == entity_id)
        else {
            return false;
        };

        state.controlled_entities.remove(index);
        if index < state.entity_weights.len() {
            state.entity_weights.remove(index);
        }
        if index < state.entity_transforms.len() {
            state.entity_transforms.remove(index);
        }
        if index < state.entity_physics.len() {
            state.entity_physics.remove(index);
        }
        if state.primary_entity_id == Some(entity_id) {
            state.primary_entity_id = state.controlled_entities.first().copied();
        }

        self.entity_to_logical.remove(&entity_id);
        host.physics.set_entity_physics_engine_controlled(entity_id, true);
        true
    }

    pub fn set_primary_controlled_entity(&mut self, logical_id: LogicalEntityId, entity_id: EntityId) {
        if let Some(state) = self.logical_entities.get_mut(&logical_id) {
            if state.controlled_entities.contains(&entity_id) {
                state.primary_entity_id = Some(entity_id);
            } else {
                warn!(logical_id, entity_id, "primary entity is not a controlled member");
            }
        }
    }

    pub fn set_merge_strategy(&mut self, logical_id: LogicalEntityId, strategy: MergeStrategy) {
        if let Some(state) = self.logical_entities.get_mut(&logical_id) {
            state.merge_strategy = strategy;
        }
    }

    pub fn set_entity_weights(&mut self, logical_id: LogicalEntityId, main_weight: f32, ghost_weight: f32) {
        if let Some(state) = self.logical_entities.get_mut(&logical_id) {
            state.main_weight = main_weight;
            state.ghost_weight = ghost_weight;
            if let Some(weight) = state.entity_weights.get_mut(0) {
                *weight = main_weight;
            }
            if let Some(weight) = state.entity_weights.get_mut(1) {
                *weight = ghost_weight;
            }
        }
    }

    pub fn set_unified_physics_mode(&mut self, logical_id: LogicalEntityId, enabled: bool) {
        if let Some(state) = self.logical_entities.get_mut(&logical_id) {
            state.physics_unified_mode = enabled;
        }
    }

    pub fn set_logical_pivot_point(&mut self, logical_id: LogicalEntityId, pivot: Vec3) {
        if let Some(state) = self.logical_entities.get_mut(&logical_id) {
            state.complex_merge_config.logical_pivot_point = pivot;
        }
    }

    pub fn set_leverage_arms(&mut self, logical_id: LogicalEntityId, main_arm: f32, ghost_arm: f32) {
        if let Some(state) = self.logical_entities.get_mut(&logical_id) {
            state.complex_merge_config.main_entity_leverage = main_arm;
            state.complex_merge_config.ghost_entity_leverage = ghost_arm;
        }
    }

    pub fn set_physics_simulation_enabled(&mut self, logical_id: LogicalEntityId, enabled: bool) {
        if let Some(state) = self.logical_entities.get_mut(&logical_id) {
            state.use_physics_simulation = enabled;
        }
    }

    /// Rate-limited merge/constrain/sync pass over every logical entity.
    pub fn update(&mut self, delta_time: f32, host: &mut Host) {
        self.time_since_update += delta_time;
        if self.time_since_update < 1.0 / self.update_frequency {
            return;
        }
        self.time_since_update = 0.0;

        let ids: Vec<LogicalEntityId> = self.logical_entities.keys().copied().collect();
        for logical_id in ids {
            if let Some(state) = self.logical_entities.get_mut(&logical_id) {
                refresh_logical_entity(state, host, true);
            }
        }
    }

    /// Immediately re-merges and re-syncs one logical entity.
    pub fn force_update(&mut self, host: &mut Host, logical_id: LogicalEntityId) {
        if let Some(state) = self.logical_entities.get_mut(&logical_id) {
            refresh_logical_entity(state, host, true);
        }
    }

    /// Re-merges without pushing the unified state back to the members.
    /// Used while events are being processed, where the members' own
    /// physical states must stay untouched.
    pub fn remerge(&mut self, host: &mut Host, logical_id: LogicalEntityId) {
        if let Some(state) = self.logical_entities.get_mut(&logical_id) {
            refresh_logical_entity(state, host, false);
        }
    }

    pub fn logical_entity_state(&self, logical_id: LogicalEntityId) -> Option<&LogicalEntityState> {
        self.logical_entities.get(&logical_id)
    }

    pub fn logical_entity_by_physical_entity(&self, entity_id: EntityId) -> Option<LogicalEntityId> {
        self.entity_to_logical.get(&entity_id).copied()
    }

    pub fn is_constrained(&self, logical_id: LogicalEntityId) -> bool {
        self.logical_entities
            .get(&logical_id)
            .is_some_and(|state| state.constraint_state.is_blocked)
    }

    pub fn constraint_state(&self, logical_id: LogicalEntityId) -> Option<&PhysicsConstraintState> {
        self.logical_entities
            .get(&logical_id)
            .filter(|state| state.constraint_state.is_blocked)
            .map(|state| &state.constraint_state)
    }

    pub fn logical_entity_count(&self) -> usize {
        self.logical_entities.len()
    }

    pub fn statistics(&self) -> LogicalEntityStats {
        let mut stats = LogicalEntityStats {
            total_logical_entities: self.logical_entities.len(),
            ..LogicalEntityStats::default()
        };
        for state in self.logical_entities.values() {
            if state.constraint_state.is_blocked {
                stats.constrained_entities += 1;
            }
            if state.physics_unified_mode {
                stats.unified_mode_entities += 1;
            }
        }
        stats
    }

    fn allocate_id(&mut self) -> LogicalEntityId {
        let id = self.next_logical_id;
        self.next_logical_id += 1;
        id
    }
}

fn default_weights(strategy: MergeStrategy) -> (f32, f32) {
    match strategy {
        MergeStrategy::MainPriority => (1.0, 0.0),
        MergeStrategy::GhostPriority => (0.0, 1.0),
        MergeStrategy::WeightedAverage => (0.5, 0.5),
        MergeStrategy::ForceSummation | MergeStrategy::PhysicsSimulation => (1.0, 1.0),
        MergeStrategy::MostRestrictive | MergeStrategy::CustomLogic => (0.5, 0.5),
    }
}

/// One full cycle for a single logical entity: collect member state, merge
/// per strategy, combine and apply constraints, sync the unified state back.
fn refresh_logical_entity(state: &mut LogicalEntityState, host: &mut Host, sync_back: bool) {
    collect_member_states(state, host);
    if state.entity_transforms.is_empty() {
        return;
    }

    if state.controlled_entities.len() > 2 {
        calculate_chain_mass_properties(state);
        match state.merge_strategy {
            MergeStrategy::ForceSummation => merge_forces(state),
            MergeStrategy::WeightedAverage => merge_weighted_average(state),
            MergeStrategy::PhysicsSimulation => merge_forces(state),
            MergeStrategy::MostRestrictive => merge_most_restrictive(state),
            _ => merge_forces(state),
        }
    } else {
        merge_two_body(state);
    }

    let logical_id = state.logical_id;
    let strategy = state.merge_strategy;
    host.notify(|events| events.on_logical_entity_state_merged(logical_id, strategy));

    apply_member_constraints(state, host);

    if state.use_physics_simulation && state.merge_strategy == MergeStrategy::PhysicsSimulation {
        run_simulation_proxy(state, host);
    }

    if sync_back {
        sync_unified_state_to_members(state, host);
    }
}

fn collect_member_states(state: &mut LogicalEntityState, host: &mut Host) {
    state.entity_transforms.clear();
    state.entity_physics.clear();
    state.segment_forces.clear();
    state.segment_torques.clear();

    for entity_id in state.controlled_entities.clone() {
        if !host.physics_data.is_entity_valid(entity_id) {
            warn!(entity_id, "skipping invalid member while collecting states");
            state.entity_transforms.push(Transform::default());
            state.entity_physics.push(PhysicsState::default());
            state.segment_forces.push(Vec3::ZERO);
            state.segment_torques.push(Vec3::ZERO);
            continue;
        }

        state
            .entity_transforms
            .push(host.physics_data.get_entity_transform(entity_id));
        state
            .entity_physics
            .push(host.physics_data.get_entity_physics_state(entity_id));

        let (force, torque) = host
            .physics
            .get_entity_applied_forces(entity_id)
            .unwrap_or((Vec3::ZERO, Vec3::ZERO));
        state.segment_forces.push(force);
        state.segment_torques.push(torque);
    }
}

/// Total mass, center of mass and inertia of the chain. Effective mass is
/// member mass times weight; inertia uses the parallel-axis theorem on the
/// diagonal tensors. A chain of (effectively) massless members falls back
/// to the geometric mean of positions with unit mass.
fn calculate_chain_mass_properties(state: &mut LogicalEntityState) {
    let mut total_mass = 0.0;
    let mut weighted_position = Vec3::ZERO;

    for index in 0..state.controlled_entities.len() {
        let effective_mass = state.entity_physics[index].mass * state.weight_of(index);
        total_mass += effective_mass;
        weighted_position += state.entity_transforms[index].position * effective_mass;
    }

    if total_mass > MASS_EPSILON {
        state.center_of_mass = weighted_position / total_mass;
        state.total_mass = total_mass;
    } else {
        let sum: Vec3 = state
            .entity_transforms
            .iter()
            .map(|t| t.position)
            .sum();
        state.center_of_mass = sum / state.entity_transforms.len().max(1) as f32;
        state.total_mass = 1.0;
    }

    let mut total_inertia = Vec3::ZERO;
    for index in 0..state.controlled_entities.len() {
        let effective_mass = state.entity_physics[index].mass * state.weight_of(index);
        let offset = state.entity_transforms[index].position - state.center_of_mass;
        let offset_squared = offset.length_squared();
        total_inertia += state.entity_physics[index].inertia_tensor_diagonal * effective_mass;
        total_inertia += Vec3::splat(offset_squared) * effective_mass;
    }

    state.unified_transform.position = state.center_of_mass;
    state.unified_physics.mass = state.total_mass;
    state.unified_physics.inertia_tensor_diagonal = total_inertia;
}

/// FORCE_SUMMATION: weighted sums of forces and torques plus the lever-arm
/// torque of each member about the chain center of mass; velocities are
/// weighted averages.
fn merge_forces(state: &mut LogicalEntityState) {
    state.total_applied_force = Vec3::ZERO;
    state.total_applied_torque = Vec3::ZERO;
    let mut linear = Vec3::ZERO;
    let mut angular = Vec3::ZERO;
    let mut total_weight = 0.0;

    for index in 0..state.controlled_entities.len() {
        let weight = state.weight_of(index);
        total_weight += weight;

        state.total_applied_force += state.segment_forces[index] * weight;
        state.total_applied_torque += state.segment_torques[index] * weight;
        linear += state.entity_physics[index].linear_velocity * weight;
        angular += state.entity_physics[index].angular_velocity * weight;
    }

    if total_weight > WEIGHT_EPSILON {
        state.unified_physics.linear_velocity = linear / total_weight;
        state.unified_physics.angular_velocity = angular / total_weight;
    }

    for index in 0..state.controlled_entities.len() {
        let arm = state.entity_transforms[index].position - state.center_of_mass;
        state.total_applied_torque += arm.cross(state.segment_forces[index]);
    }
}

/// WEIGHTED_AVERAGE: every physical quantity is a weighted mean.
fn merge_weighted_average(state: &mut LogicalEntityState) {
    let mut linear = Vec3::ZERO;
    let mut angular = Vec3::ZERO;
    let mut force = Vec3::ZERO;
    let mut torque = Vec3::ZERO;
    let mut total_weight = 0.0;

    for index in 0..state.controlled_entities.len() {
        let weight = state.weight_of(index);
        total_weight += weight;
        linear += state.entity_physics[index].linear_velocity * weight;
        angular += state.entity_physics[index].angular_velocity * weight;
        force += state.segment_forces[index] * weight;
        torque += state.segment_torques[index] * weight;
    }

    if total_weight > WEIGHT_EPSILON {
        state.unified_physics.linear_velocity = linear / total_weight;
        state.unified_physics.angular_velocity = angular / total_weight;
        state.total_applied_force = force / total_weight;
        state.total_applied_torque = torque / total_weight;
    }
}

/// MOST_RESTRICTIVE: the slowest member's velocities become the base, so a
/// blocked ghost stops the whole body; forces still sum so nothing is lost
/// when the obstruction clears.
fn merge_most_restrictive(state: &mut LogicalEntityState) {
    let mut slowest_index = 0;
    let mut slowest_speed = f32::MAX;
    for (index, physics) in state.entity_physics.iter().enumerate() {
        let speed = physics.linear_velocity.length();
        if speed < slowest_speed {
            slowest_speed = speed;
            slowest_index = index;
        }
    }

    state.unified_physics.linear_velocity = state.entity_physics[slowest_index].linear_velocity;
    state.unified_physics.angular_velocity = state.entity_physics[slowest_index].angular_velocity;

    state.total_applied_force = Vec3::ZERO;
    state.total_applied_torque = Vec3::ZERO;
    for index in 0..state.controlled_entities.len() {
        state.total_applied_force += state.segment_forces[index];
        state.total_applied_torque += state.segment_torques[index];
    }
}

/// Two-member merge used while a chain is just a main/ghost pair.
fn merge_two_body(state: &mut LogicalEntityState) {
    let main_transform = state.entity_transforms[0];
    let main_physics = state.entity_physics[0];
    let ghost = state.entity_transforms.get(1).copied().zip(state.entity_physics.get(1).copied());

    let Some((ghost_transform, ghost_physics)) = ghost else {
        state.unified_transform = main_transform;
        state.unified_physics = main_physics;
        state.center_of_mass = main_transform.position;
        return;
    };

    match state.merge_strategy {
        MergeStrategy::MainPriority => {
            state.unified_transform = main_transform;
            state.unified_physics = main_physics;
        }
        MergeStrategy::GhostPriority => {
            state.unified_transform = ghost_transform;
            state.unified_physics = ghost_physics;
        }
        MergeStrategy::WeightedAverage
        | MergeStrategy::ForceSummation
        | MergeStrategy::PhysicsSimulation => {
            let total = state.main_weight + state.ghost_weight;
            let (main_norm, ghost_norm) = if total > WEIGHT_EPSILON {
                (state.main_weight / total, state.ghost_weight / total)
            } else {
                (0.5, 0.5)
            };

            state.unified_transform = Transform {
                position: main_transform.position * main_norm
                    + ghost_transform.position * ghost_norm,
                rotation: main_transform.rotation,
                scale: main_transform.scale * main_norm + ghost_transform.scale * ghost_norm,
            };
            state.unified_physics = main_physics;
            state.unified_physics.linear_velocity = main_physics.linear_velocity * main_norm
                + ghost_physics.linear_velocity * ghost_norm;
            state.unified_physics.angular_velocity = main_physics.angular_velocity * main_norm
                + ghost_physics.angular_velocity * ghost_norm;
            state.unified_physics.mass =
                main_physics.mass * main_norm + ghost_physics.mass * ghost_norm;

            state.total_applied_force =
                state.segment_forces[0] * state.main_weight + state.segment_forces[1] * state.ghost_weight;
            state.total_applied_torque = state.segment_torques[0] * state.main_weight
                + state.segment_torques[1] * state.ghost_weight;
        }
        MergeStrategy::MostRestrictive | MergeStrategy::CustomLogic => {
            let main_speed = main_physics.linear_velocity.length();
            let ghost_speed = ghost_physics.linear_velocity.length();
            state.unified_transform = main_transform;
            state.unified_physics = if main_speed <= ghost_speed {
                main_physics
            } else {
                ghost_physics
            };

            state.total_applied_force = state.segment_forces[0] + state.segment_forces[1];
            state.total_applied_torque = state.segment_torques[0] + state.segment_torques[1];
        }
    }

    state.center_of_mass = state.unified_transform.position;
}

/// Queries every member for collision constraints and applies the combined
/// result to the unified state: the blocked components of the velocity are
/// removed, then the mean allowed velocity is layered on. Transition edges
/// fire the constrained/released notifications exactly once.
fn apply_member_constraints(state: &mut LogicalEntityState, host: &mut Host) {
    state.segment_constraints.clear();
    let mut combined_allowed = Vec3::ZERO;
    let mut combined_normal = Vec3::ZERO;
    let mut blocked_count = 0u32;

    for entity_id in state.controlled_entities.clone() {
        let constraint = host
            .physics
            .detect_entity_collision_constraints(entity_id)
            .unwrap_or_default();

        if constraint.is_blocked {
            combined_allowed += constraint.allowed_velocity;
            combined_normal += constraint.blocking_normal;
            blocked_count += 1;
        }
        state.segment_constraints.push(constraint);
    }

    state.has_distributed_constraints = blocked_count > 0;
    let was_blocked = state.constraint_state.is_blocked;

    if blocked_count == 0 {
        state.constraint_state = PhysicsConstraintState::default();
        if was_blocked {
            let logical_id = state.logical_id;
            host.notify(|events| events.on_logical_entity_constraint_released(logical_id));
        }
        return;
    }

    combined_allowed /= blocked_count as f32;
    let combined_normal = combined_normal.normalize_or_zero();

    state.constraint_state.is_blocked = true;
    state.constraint_state.allowed_velocity = combined_allowed;
    state.constraint_state.blocking_normal = combined_normal;

    let velocity = state.unified_physics.linear_velocity;
    let into_blocker = velocity.dot(combined_normal);
    if into_blocker < 0.0 {
        state.unified_physics.linear_velocity = velocity - combined_normal * into_blocker;
    }
    if combined_allowed.length() > VELOCITY_EPSILON {
        state.unified_physics.linear_velocity += combined_allowed;
    }

    if !was_blocked {
        let logical_id = state.logical_id;
        let constraint = state.constraint_state;
        host.notify(|events| events.on_logical_entity_constrained(logical_id, &constraint));
    }
}

/// PHYSICS_SIMULATION support: the merged force and torque drive a host-side
/// proxy body; whatever the external integrator made of last frame's inputs
/// is read back as the unified state.
fn run_simulation_proxy(state: &mut LogicalEntityState, host: &mut Host) {
    if state.simulation_proxy_entity.is_none() {
        state.simulation_proxy_entity = host.physics.create_physics_simulation_proxy(
            state.main_entity_id,
            &state.unified_transform,
            &state.unified_physics,
        );
        if let Some(proxy) = state.simulation_proxy_entity {
            let physics = &state.unified_physics;
            host.physics.set_proxy_physics_material(
                proxy,
                physics.friction,
                physics.restitution,
                physics.linear_damping,
                physics.angular_damping,
            );
        } else {
            warn!(logical_id = state.logical_id, "host refused simulation proxy creation");
            return;
        }
    }

    let Some(proxy) = state.simulation_proxy_entity else {
        return;
    };

    if host.physics_data.is_entity_valid(proxy) {
        state.unified_transform = host.physics_data.get_entity_transform(proxy);
        let proxy_physics = host.physics_data.get_entity_physics_state(proxy);
        state.unified_physics.linear_velocity = proxy_physics.linear_velocity;
        state.unified_physics.angular_velocity = proxy_physics.angular_velocity;
    }

    host.physics.clear_forces_on_proxy(proxy);
    host.physics
        .apply_force_to_proxy(proxy, state.total_applied_force, state.center_of_mass);
    host.physics.apply_torque_to_proxy(proxy, state.total_applied_torque);
}

/// Pushes the unified state to every member, keeping each one's rigid
/// offset from the chain center of mass.
fn sync_unified_state_to_members(state: &mut LogicalEntityState, host: &mut Host) {
    if state.controlled_entities.len() > 2 {
        for index in 0..state.controlled_entities.len() {
            let entity_id = state.controlled_entities[index];
            let mut target_transform = state.unified_transform;
            if let Some(member_transform) = state.entity_transforms.get(index) {
                let offset = member_transform.position - state.center_of_mass;
                target_transform.position = state.unified_transform.position + offset;
            }
            host.physics.force_set_entity_physics_state(
                entity_id,
                &target_transform,
                &state.unified_physics,
            );
        }
    } else {
        host.physics.force_set_entity_physics_state(
            state.main_entity_id,
            &state.unified_transform,
            &state.unified_physics,
        );
        if let Some(ghost) = state.ghost_entity_id {
            host.physics.force_set_entity_physics_state(
                ghost,
                &state.unified_transform,
                &state.unified_physics,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockEvent, MockHost};

    const TOLERANCE: f32 = 1e-4;

    #[test]
    fn creation_disables_engine_control_for_both_members() {
        let mock = MockHost::new();
        mock.world.borrow_mut().add_entity(1, Vec3::ZERO, Vec3::ZERO);
        mock.world
            .borrow_mut()
            .add_entity(2, Vec3::new(10.0, 0.0, 0.0), Vec3::ZERO);
        let mut host = mock.build_host();

        let mut manager = LogicalEntityManager::new();
        let logical_id =
            manager.create_logical_entity(&mut host, 1, Some(2), MergeStrategy::WeightedAverage);

        let world = mock.world.borrow();
        assert!(world.engine_control_changes.contains(&(1, false)));
        assert!(world.engine_control_changes.contains(&(2, false)));
        assert_eq!(world.count_events(|e| matches!(e, MockEvent::LogicalCreated(_))), 1);
        drop(world);

        assert_eq!(manager.logical_entity_by_physical_entity(1), Some(logical_id));
        assert_eq!(manager.logical_entity_by_physical_entity(2), Some(logical_id));

        let state = manager.logical_entity_state(logical_id).unwrap();
        assert!((state.main_weight - 0.5).abs() < TOLERANCE);
        assert!((state.ghost_weight - 0.5).abs() < TOLERANCE);
    }

    #[test]
    fn most_restrictive_blocked_ghost_stops_the_pair() {
        let mock = MockHost::new();
        {
            let mut world = mock.world.borrow_mut();
            world.add_entity(1, Vec3::ZERO, Vec3::new(1.0, 0.0, 0.0));
            world.add_entity(2, Vec3::new(10.0, 0.0, 0.0), Vec3::new(1.0, 0.0, 0.0));
            world.constraints.insert(
                2,
                PhysicsConstraintState {
                    is_blocked: true,
                    blocking_normal: Vec3::new(-1.0, 0.0, 0.0),
                    allowed_velocity: Vec3::ZERO,
                    contact_point: Vec3::new(10.5, 0.0, 0.0),
                    blocking_entity: None,
                },
            );
        }
        let mut host = mock.build_host();

        let mut manager = LogicalEntityManager::new();
        let logical_id =
            manager.create_logical_entity(&mut host, 1, Some(2), MergeStrategy::MostRestrictive);

        mock.world.borrow_mut().forced_states.clear();
        manager.update(1.0, &mut host);

        let state = manager.logical_entity_state(logical_id).unwrap();
        assert!(state.unified_physics.linear_velocity.x <= TOLERANCE);
        assert!(state.constraint_state.is_blocked);

        // The unified velocity's component along the blocking normal never
        // points into the blocker.
        let along_normal = state
            .unified_physics
            .linear_velocity
            .dot(Vec3::new(-1.0, 0.0, 0.0));
        assert!(along_normal >= -TOLERANCE);

        let world = mock.world.borrow();
        let forced: Vec<EntityId> = world.forced_states.iter().map(|(id, _, _)| *id).collect();
        assert!(forced.contains(&1));
        assert!(forced.contains(&2));
        let velocities: Vec<Vec3> = world
            .forced_states
            .iter()
            .map(|(_, _, physics)| physics.linear_velocity)
            .collect();
        assert!(velocities.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(world.count_events(|e| matches!(e, MockEvent::LogicalConstrained(_))), 1);
    }

    #[test]
    fn constraint_release_fires_once() {
        let mock = MockHost::new();
        {
            let mut world = mock.world.borrow_mut();
            world.add_entity(1, Vec3::ZERO, Vec3::new(1.0, 0.0, 0.0));
            world.add_entity(2, Vec3::new(10.0, 0.0, 0.0), Vec3::new(1.0, 0.0, 0.0));
            world.constraints.insert(
                2,
                PhysicsConstraintState {
                    is_blocked: true,
                    blocking_normal: Vec3::new(-1.0, 0.0, 0.0),
                    ..PhysicsConstraintState::default()
                },
            );
        }
        let mut host = mock.build_host();

        let mut manager = LogicalEntityManager::new();
        let logical_id =
            manager.create_logical_entity(&mut host, 1, Some(2), MergeStrategy::MostRestrictive);

        manager.update(1.0, &mut host);
        assert!(manager.is_constrained(logical_id));

        mock.world.borrow_mut().constraints.clear();
        manager.update(1.0, &mut host);
        manager.update(1.0, &mut host);

        assert!(!manager.is_constrained(logical_id));
        let world = mock.world.borrow();
        assert_eq!(
            world.count_events(|e| matches!(e, MockEvent::LogicalConstraintReleased(_))),
            1
        );
    }

    #[test]
    fn chain_mass_properties_use_parallel_axis() {
        let mock = MockHost::new();
        {
            let mut world = mock.world.borrow_mut();
            world.add_entity(1, Vec3::new(0.0, 0.0, 0.0), Vec3::ZERO);
            world.add_entity(2, Vec3::new(10.0, 0.0, 0.0), Vec3::ZERO);
            world.add_entity(3, Vec3::new(20.0, 0.0, 0.0), Vec3::ZERO);
        }
        let mut host = mock.build_host();

        let mut manager = LogicalEntityManager::new();
        let logical_id = manager
            .create_multi_entity_control(&mut host, &[1, 2, 3], &[1.0, 1.0, 1.0])
            .unwrap();

        let state = manager.logical_entity_state(logical_id).unwrap();
        assert!((state.center_of_mass - Vec3::new(10.0, 0.0, 0.0)).length() < TOLERANCE);
        assert!((state.total_mass - 3.0).abs() < TOLERANCE);
        // Unit local inertia plus m*r^2 terms: 3*1 + (100 + 0 + 100).
        assert!((state.unified_physics.inertia_tensor_diagonal.x - 203.0).abs() < 1e-2);
    }

    #[test]
    fn massless_chain_falls_back_to_geometric_mean() {
        let mock = MockHost::new();
        {
            let mut world = mock.world.borrow_mut();
            for (id, x) in [(1u64, 0.0f32), (2, 6.0), (3, 12.0)] {
                world.add_entity(id, Vec3::new(x, 0.0, 0.0), Vec3::ZERO);
                world.physics.get_mut(&id).unwrap().mass = 0.0;
            }
        }
        let mut host = mock.build_host();

        let mut manager = LogicalEntityManager::new();
        let logical_id = manager
            .create_multi_entity_control(&mut host, &[1, 2, 3], &[])
            .unwrap();

        let state = manager.logical_entity_state(logical_id).unwrap();
        assert!((state.center_of_mass - Vec3::new(6.0, 0.0, 0.0)).length() < TOLERANCE);
        assert!((state.total_mass - 1.0).abs() < TOLERANCE);
    }

    #[test]
    fn force_summation_adds_lever_arm_torque() {
        let mock = MockHost::new();
        {
            let mut world = mock.world.borrow_mut();
            world.add_entity(1, Vec3::new(0.0, 0.0, 0.0), Vec3::ZERO);
            world.add_entity(2, Vec3::new(10.0, 0.0, 0.0), Vec3::ZERO);
            world.add_entity(3, Vec3::new(20.0, 0.0, 0.0), Vec3::ZERO);
            // Force on the tail member, perpendicular to the chain axis.
            world
                .applied_forces
                .insert(3, (Vec3::new(0.0, 2.0, 0.0), Vec3::ZERO));
        }
        let mut host = mock.build_host();

        let mut manager = LogicalEntityManager::new();
        let logical_id = manager
            .create_multi_entity_control(&mut host, &[1, 2, 3], &[])
            .unwrap();
        manager.set_merge_strategy(logical_id, MergeStrategy::ForceSummation);
        manager.update(1.0, &mut host);

        let state = manager.logical_entity_state(logical_id).unwrap();
        assert!((state.total_applied_force - Vec3::new(0.0, 2.0, 0.0)).length() < TOLERANCE);
        // Arm (10,0,0) x force (0,2,0) = (0,0,20).
        assert!((state.total_applied_torque - Vec3::new(0.0, 0.0, 20.0)).length() < TOLERANCE);
    }

    #[test]
    fn chain_sync_preserves_member_offsets() {
        let mock = MockHost::new();
        {
            let mut world = mock.world.borrow_mut();
            world.add_entity(1, Vec3::new(0.0, 0.0, 0.0), Vec3::new(1.0, 0.0, 0.0));
            world.add_entity(2, Vec3::new(10.0, 0.0, 0.0), Vec3::new(1.0, 0.0, 0.0));
            world.add_entity(3, Vec3::new(20.0, 0.0, 0.0), Vec3::new(1.0, 0.0, 0.0));
        }
        let mut host = mock.build_host();

        let mut manager = LogicalEntityManager::new();
        let logical_id = manager
            .create_multi_entity_control(&mut host, &[1, 2, 3], &[])
            .unwrap();
        manager.set_merge_strategy(logical_id, MergeStrategy::WeightedAverage);

        mock.world.borrow_mut().forced_states.clear();
        manager.update(1.0, &mut host);

        let world = mock.world.borrow();
        let positions: FxHashMap<EntityId, Vec3> = world
            .forced_states
            .iter()
            .map(|(id, transform, _)| (*id, transform.position))
            .collect();

        let delta_12 = positions[&2] - positions[&1];
        let delta_23 = positions[&3] - positions[&2];
        assert!((delta_12 - Vec3::new(10.0, 0.0, 0.0)).length() < TOLERANCE);
        assert!((delta_23 - Vec3::new(10.0, 0.0, 0.0)).length() < TOLERANCE);
    }

    #[test]
    fn destruction_restores_engine_control() {
        let mock = MockHost::new();
        mock.world.borrow_mut().add_entity(1, Vec3::ZERO, Vec3::ZERO);
        mock.world.borrow_mut().add_entity(2, Vec3::ONE, Vec3::ZERO);
        let mut host = mock.build_host();

        let mut manager = LogicalEntityManager::new();
        let logical_id =
            manager.create_logical_entity(&mut host, 1, Some(2), MergeStrategy::MainPriority);
        manager.destroy_logical_entity(&mut host, logical_id);

        let world = mock.world.borrow();
        assert!(world.engine_control_changes.contains(&(1, true)));
        assert!(world.engine_control_changes.contains(&(2, true)));
        assert_eq!(world.count_events(|e| matches!(e, MockEvent::LogicalDestroyed(_))), 1);
        drop(world);

        assert_eq!(manager.logical_entity_by_physical_entity(1), None);
        assert!(manager.logical_entity_state(logical_id).is_none());
    }

    #[test]
    fn physics_simulation_routes_forces_through_a_proxy() {
        let mock = MockHost::new();
        {
            let mut world = mock.world.borrow_mut();
            world.add_entity(1, Vec3::ZERO, Vec3::ZERO);
            world.add_entity(2, Vec3::new(10.0, 0.0, 0.0), Vec3::ZERO);
            world.add_entity(3, Vec3::new(20.0, 0.0, 0.0), Vec3::ZERO);
            world.applied_forces.insert(1, (Vec3::new(5.0, 0.0, 0.0), Vec3::ZERO));
        }
        let mut host = mock.build_host();

        let mut manager = LogicalEntityManager::new();
        let logical_id = manager
            .create_multi_entity_control(&mut host, &[1, 2, 3], &[])
            .unwrap();
        manager.set_merge_strategy(logical_id, MergeStrategy::PhysicsSimulation);
        manager.set_physics_simulation_enabled(logical_id, true);

        manager.update(1.0, &mut host);

        let world = mock.world.borrow();
        assert_eq!(world.proxies.len(), 1);
        assert!(!world.proxy_forces.is_empty());
        let (_, force) = world.proxy_forces[0];
        assert!((force - Vec3::new(5.0, 0.0, 0.0)).length() < TOLERANCE);
    }
}
