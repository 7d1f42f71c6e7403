use glam::Vec3;

use crate::types::{
    ClippingPlane, CrossingState, EntityId, EntityKind, LogicalEntityId, MergeStrategy,
    PhysicsState, PortalFace, PortalId, Transform,
};

/// Collision constraint reported by the host for one entity.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PhysicsConstraintState {
    pub is_blocked: bool,
    pub blocking_normal: Vec3,
    pub allowed_velocity: Vec3,
    pub contact_point: Vec3,
    pub blocking_entity: Option<EntityId>,
}

/// One segment of a teleporting body: the main body or a ghost clone on the
/// far side of a portal boundary.
#[derive(Debug, Clone)]
pub struct EntityChainNode {
    pub entity_id: EntityId,
    pub kind: EntityKind,
    /// Portal this segment entered through (none for the original node).
    pub entry_portal: Option<PortalId>,
    /// Linked twin of `entry_portal`; consecutive nodes share a pair boundary.
    pub exit_portal: Option<PortalId>,
    pub chain_position: usize,
    pub segment_length: f32,
    pub transform: Transform,
    pub physics_state: PhysicsState,
    pub requires_clipping: bool,
    pub clipping_plane: ClippingPlane,
    pub entry_face: PortalFace,
    pub exit_face: PortalFace,
    pub is_constrained: bool,
    pub constraint_state: PhysicsConstraintState,
}

impl EntityChainNode {
    pub fn new(entity_id: EntityId, kind: EntityKind) -> Self {
        Self {
            entity_id,
            kind,
            entry_portal: None,
            exit_portal: None,
            chain_position: 0,
            segment_length: 0.0,
            transform: Transform::default(),
            physics_state: PhysicsState::default(),
            requires_clipping: false,
            clipping_plane: ClippingPlane::default(),
            entry_face: PortalFace::A,
            exit_face: PortalFace::B,
            is_constrained: false,
            constraint_state: PhysicsConstraintState::default(),
        }
    }
}

/// Ordered list of segments representing one logical body straddling one or
/// more portal pairs.
///
/// Index 0 is the oldest segment (the side being exited); the last index is
/// the newest (the side being entered). Exactly one node is `Main` and
/// `main_position` points at it. Every structural change bumps
/// `chain_version`.
#[derive(Debug, Clone)]
pub struct EntityChainState {
    pub logical_entity_id: Option<LogicalEntityId>,
    pub original_entity_id: EntityId,
    pub chain: Vec<EntityChainNode>,
    pub main_position: usize,
    pub total_chain_length: f32,
    pub center_of_mass_world_pos: Vec3,
    pub unified_physics_state: PhysicsState,
    pub total_applied_force: Vec3,
    pub total_applied_torque: Vec3,
    pub is_actively_teleporting: bool,
    pub chain_version: u32,
    pub last_update_timestamp: u64,
    pub enable_batch_sync: bool,
    pub sync_group_id: u32,
}

impl EntityChainState {
    pub fn new(original_entity_id: EntityId) -> Self {
        Self {
            logical_entity_id: None,
            original_entity_id,
            chain: Vec::new(),
            main_position: 0,
            total_chain_length: 0.0,
            center_of_mass_world_pos: Vec3::ZERO,
            unified_physics_state: PhysicsState::default(),
            total_applied_force: Vec3::ZERO,
            total_applied_torque: Vec3::ZERO,
            is_actively_teleporting: false,
            chain_version: 0,
            last_update_timestamp: 0,
            enable_batch_sync: false,
            sync_group_id: 0,
        }
    }

    pub fn main_node(&self) -> Option<&EntityChainNode> {
        self.chain.get(self.main_position)
    }

    pub fn main_entity(&self) -> Option<EntityId> {
        self.main_node().map(|node| node.entity_id)
    }

    pub fn position_of(&self, entity_id: EntityId) -> Option<usize> {
        self.chain.iter().position(|node| node.entity_id == entity_id)
    }

    /// Restores `chain_position` numbering after nodes were added or removed.
    pub fn renumber(&mut self) {
        for (index, node) in self.chain.iter_mut().enumerate() {
            node.chain_position = index;
        }
    }

    pub fn recompute_total_length(&mut self) {
        self.total_chain_length = self.chain.iter().map(|node| node.segment_length).sum();
    }
}

/// Everything the host needs to spawn one new chain segment.
#[derive(Debug, Clone)]
pub struct ChainNodeCreateDescriptor {
    /// Entity whose properties the new segment copies.
    pub source_entity_id: EntityId,
    pub target_transform: Transform,
    pub target_physics: PhysicsState,
    pub through_portal: PortalId,
    pub entry_face: PortalFace,
    pub exit_face: PortalFace,
    pub full_functionality: bool,
}

/// Tuning for force/torque merging of a logical entity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComplexMergeConfig {
    pub merge_forces: bool,
    pub merge_torques: bool,
    pub consider_leverage: bool,
    pub use_physics_simulation: bool,
    pub main_entity_leverage: f32,
    pub ghost_entity_leverage: f32,
    /// World-space pivot for lever-arm torque.
    pub logical_pivot_point: Vec3,
}

impl Default for ComplexMergeConfig {
    fn default() -> Self {
        Self {
            merge_forces: true,
            merge_torques: true,
            consider_leverage: true,
            use_physics_simulation: true,
            main_entity_leverage: 1.0,
            ghost_entity_leverage: 1.0,
            logical_pivot_point: Vec3::ZERO,
        }
    }
}

/// The unified physics abstraction over all members of a chain.
///
/// While a logical entity controls its members, the host treats them as
/// kinematic; this record is the authoritative source of their shared state.
#[derive(Debug, Clone)]
pub struct LogicalEntityState {
    pub logical_id: LogicalEntityId,
    pub main_entity_id: EntityId,
    pub ghost_entity_id: Option<EntityId>,
    pub controlled_entities: Vec<EntityId>,
    pub entity_weights: Vec<f32>,
    pub entity_transforms: Vec<Transform>,
    pub entity_physics: Vec<PhysicsState>,
    /// Member currently carrying the center of mass.
    pub primary_entity_id: Option<EntityId>,
    pub total_mass: f32,
    pub center_of_mass: Vec3,
    pub segment_forces: Vec<Vec3>,
    pub segment_torques: Vec<Vec3>,
    pub segment_constraints: Vec<PhysicsConstraintState>,
    pub has_distributed_constraints: bool,
    pub unified_transform: Transform,
    pub unified_physics: PhysicsState,
    pub constraint_state: PhysicsConstraintState,
    pub complex_merge_config: ComplexMergeConfig,
    pub total_applied_force: Vec3,
    pub total_applied_torque: Vec3,
    pub merge_strategy: MergeStrategy,
    pub main_weight: f32,
    pub ghost_weight: f32,
    pub physics_unified_mode: bool,
    pub ignore_engine_physics: bool,
    pub use_physics_simulation: bool,
    pub simulation_proxy_entity: Option<EntityId>,
}

impl LogicalEntityState {
    pub fn new(logical_id: LogicalEntityId, main_entity_id: EntityId) -> Self {
        Self {
            logical_id,
            main_entity_id,
            ghost_entity_id: None,
            controlled_entities: Vec::new(),
            entity_weights: Vec::new(),
            entity_transforms: Vec::new(),
            entity_physics: Vec::new(),
            primary_entity_id: None,
            total_mass: 0.0,
            center_of_mass: Vec3::ZERO,
            segment_forces: Vec::new(),
            segment_torques: Vec::new(),
            segment_constraints: Vec::new(),
            has_distributed_constraints: false,
            unified_transform: Transform::default(),
            unified_physics: PhysicsState::default(),
            constraint_state: PhysicsConstraintState::default(),
            complex_merge_config: ComplexMergeConfig::default(),
            total_applied_force: Vec3::ZERO,
            total_applied_torque: Vec3::ZERO,
            merge_strategy: MergeStrategy::ForceSummation,
            main_weight: 1.0,
            ghost_weight: 1.0,
            physics_unified_mode: true,
            ignore_engine_physics: false,
            use_physics_simulation: false,
            simulation_proxy_entity: None,
        }
    }

    pub fn weight_of(&self, index: usize) -> f32 {
        self.entity_weights.get(index).copied().unwrap_or(1.0)
    }
}

/// Per-entity teleport bookkeeping kept alongside the chain for hosts that
/// still think in source/target portal pairs.
#[derive(Debug, Clone)]
pub struct TeleportState {
    pub entity_id: EntityId,
    pub logical_entity_id: Option<LogicalEntityId>,
    pub source_portal: PortalId,
    pub target_portal: Option<PortalId>,
    pub crossing_state: CrossingState,
    pub previous_state: CrossingState,
    /// 0.0 at entry, 1.0 once fully through.
    pub transition_progress: f32,
    pub is_teleporting: bool,
    pub source_face: PortalFace,
    pub target_face: PortalFace,
    pub active_source_face: PortalFace,
    pub active_target_face: PortalFace,
    pub face_configuration_locked: bool,
    pub ghost_entity_id: Option<EntityId>,
    pub seamless_mode: bool,
    pub role_swapped: bool,
    pub enable_batch_sync: bool,
    pub sync_group_id: u32,
    pub requires_full_sync: bool,
    pub is_high_priority: bool,
    pub center_has_crossed: bool,
    pub crossing_point: Vec3,
    pub use_logical_entity_physics: bool,
    pub merge_strategy: MergeStrategy,
}

impl TeleportState {
    pub fn new(entity_id: EntityId, source_portal: PortalId) -> Self {
        Self {
            entity_id,
            logical_entity_id: None,
            source_portal,
            target_portal: None,
            crossing_state: CrossingState::NotTouching,
            previous_state: CrossingState::NotTouching,
            transition_progress: 0.0,
            is_teleporting: false,
            source_face: PortalFace::A,
            target_face: PortalFace::B,
            active_source_face: PortalFace::A,
            active_target_face: PortalFace::B,
            face_configuration_locked: false,
            ghost_entity_id: None,
            seamless_mode: true,
            role_swapped: false,
            enable_batch_sync: false,
            sync_group_id: 0,
            requires_full_sync: false,
            is_high_priority: false,
            center_has_crossed: false,
            crossing_point: Vec3::ZERO,
            use_logical_entity_physics: true,
            merge_strategy: MergeStrategy::MostRestrictive,
        }
    }
}

/// Snapshot used to push a ghost's mirrored state to the host, either one at
/// a time or in batches grouped by `sync_group_id` on the teleport state.
#[derive(Debug, Clone)]
pub struct GhostEntitySnapshot {
    pub main_entity_id: EntityId,
    pub ghost_entity_id: EntityId,
    pub main_transform: Transform,
    pub ghost_transform: Transform,
    pub main_physics: PhysicsState,
    pub ghost_physics: PhysicsState,
    pub main_bounds_min: Vec3,
    pub main_bounds_max: Vec3,
    pub ghost_bounds_min: Vec3,
    pub ghost_bounds_max: Vec3,
    pub source_face: PortalFace,
    pub target_face: PortalFace,
    pub has_full_functionality: bool,
    pub sync_priority: u32,
    pub requires_immediate_sync: bool,
    pub timestamp: u64,
}

/// What a ghost sync carries and how often it runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GhostSyncConfig {
    pub sync_transform: bool,
    pub sync_physics: bool,
    pub sync_bounds: bool,
    pub sync_properties: bool,
    /// Hz.
    pub sync_frequency: f32,
    pub transform_threshold: f32,
    pub velocity_threshold: f32,
}

impl Default for GhostSyncConfig {
    fn default() -> Self {
        Self {
            sync_transform: true,
            sync_physics: true,
            sync_bounds: true,
            sync_properties: false,
            sync_frequency: 60.0,
            transform_threshold: 0.001,
            velocity_threshold: 0.01,
        }
    }
}
