//! Per-entity chain lifecycle.
//!
//! Every teleporting body is an ordered chain of segments: the oldest at
//! index 0 (the side being exited), the newest at the end (the side being
//! entered). The four host physics events drive the lifecycle: intersect
//! extends the chain with a ghost on the far side, a center crossing
//! migrates the main role forward, an exit shrinks the chain from the
//! front, and a chain of one is a finished teleport.

use glam::Vec3;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use riftgate_shared::chain::{
    ChainNodeCreateDescriptor, EntityChainState, EntityChainNode, GhostEntitySnapshot,
    PhysicsConstraintState, TeleportState,
};
use riftgate_shared::math;
use riftgate_shared::portal::Portal;
use riftgate_shared::types::{
    ClippingPlane, CrossingState, EntityId, EntityKind, MergeStrategy, PortalFace, PortalId,
};

use crate::clipping::{ClippingStats, MultiSegmentClippingManager};
use crate::interfaces::Host;
use crate::logical::LogicalEntityManager;

/// Portal table owned by the façade and lent to the event handlers, so a
/// chain can resolve the planes of every boundary it straddles.
pub type PortalTable = FxHashMap<PortalId, Portal>;

const MAIN_NODE_WEIGHT: f32 = 1.5;
const HEAD_NODE_WEIGHT: f32 = 1.2;
const TAIL_WEIGHT_BASE: f32 = 0.8;
const TAIL_WEIGHT_STEP: f32 = 0.1;
const TAIL_WEIGHT_FLOOR: f32 = 0.3;
/// Long chains hand their merged forces to a host-side simulation proxy.
const PHYSICS_SIMULATION_CHAIN_LENGTH: usize = 3;

#[derive(Debug, Clone, Copy, Default)]
pub struct BatchSyncStats {
    pub total_entities: usize,
    pub batch_enabled_entities: usize,
    pub pending_sync_count: usize,
    pub last_batch_sync_time: f32,
}

pub struct TeleportManager {
    entity_chains: FxHashMap<EntityId, EntityChainState>,
    chain_node_to_original: FxHashMap<EntityId, EntityId>,
    active_teleports: FxHashMap<EntityId, TeleportState>,
    ghost_snapshots: FxHashMap<EntityId, GhostEntitySnapshot>,

    logical: LogicalEntityManager,
    clipping: MultiSegmentClippingManager,

    sync_frequency: f32,
    time_since_individual_sync: f32,
    time_since_batch_sync: f32,
    clock_ms: u64,
    use_logical_entity_control: bool,
    auto_swap_on_center_cross: bool,
    max_concurrent_teleports: usize,
    default_clipping_quality: u8,
}

impl Default for TeleportManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TeleportManager {
    pub fn new() -> Self {
        Self {
            entity_chains: FxHashMap::default(),
            chain_node_to_original: FxHashMap::default(),
            active_teleports: FxHashMap::default(),
            ghost_snapshots: FxHashMap::default(),
            logical: LogicalEntityManager::new(),
            clipping: MultiSegmentClippingManager::new(),
            sync_frequency: 60.0,
            time_since_individual_sync: 0.0,
            time_since_batch_sync: 0.0,
            clock_ms: 0,
            use_logical_entity_control: true,
            auto_swap_on_center_cross: true,
            max_concurrent_teleports: 10,
            default_clipping_quality: 2,
        }
    }

    pub fn set_ghost_sync_frequency(&mut self, frequency: f32) {
        self.sync_frequency = frequency.max(1.0);
    }

    pub fn set_logical_update_frequency(&mut self, frequency: f32) {
        self.logical.set_update_frequency(frequency);
    }

    /// With logical control on (the default), chain members are driven by
    /// the unified logical entity and the snapshot sync is disabled; the
    /// logical sync-back is authoritative.
    pub fn set_logical_entity_control_mode(&mut self, enabled: bool) {
        self.use_logical_entity_control = enabled;
    }

    pub fn set_auto_swap_on_center_cross(&mut self, enabled: bool) {
        self.auto_swap_on_center_cross = enabled;
    }

    pub fn set_max_concurrent_teleports(&mut self, limit: usize) {
        self.max_concurrent_teleports = limit.max(1);
    }

    pub fn set_default_clipping_quality(&mut self, quality_level: u8) {
        self.default_clipping_quality = quality_level;
    }

    pub fn set_clipping_defaults(&mut self, min_visibility: f32, blend_distance: f32) {
        self.clipping.set_default_visibility_threshold(min_visibility);
        self.clipping.set_default_blend_distance(blend_distance);
    }

    // === update loop ===

    pub fn update(&mut self, delta_time: f32, host: &mut Host, portals: &PortalTable) {
        self.clock_ms += (delta_time * 1000.0) as u64;

        if self.use_logical_entity_control {
            self.logical.update(delta_time, host);
        } else {
            self.sync_ghosts(delta_time, host, portals);
        }

        self.cleanup_completed_teleports();
    }

    // === event handlers ===

    /// Extends the chain when an entity starts intersecting a linked portal.
    /// Duplicate events for a boundary the chain already covers are ignored;
    /// a host refusing the node creation leaves everything untouched.
    pub fn on_intersect_start(
        &mut self,
        host: &mut Host,
        portals: &PortalTable,
        entity_id: EntityId,
        portal_id: PortalId,
    ) {
        let Some((portal, target)) = linked_pair(portals, portal_id) else {
            warn!(entity_id, portal_id, "intersect event for an unlinked or inactive portal");
            return;
        };

        let original = self.resolve_original(entity_id).unwrap_or(entity_id);
        if !self.entity_chains.contains_key(&original)
            && self.entity_chains.len() >= self.max_concurrent_teleports
        {
            warn!(entity_id, "concurrent teleport limit reached, event dropped");
            return;
        }
        self.ensure_chain(host, original);

        let entry_face = PortalFace::A;
        let exit_face = PortalFace::B;
        let target_id = target.id();

        let Some(chain) = self.entity_chains.get_mut(&original) else {
            return;
        };

        if chain
            .chain
            .iter()
            .any(|node| node.exit_portal == Some(target_id))
        {
            debug!(entity_id, portal_id, "chain already covers this boundary, ignoring");
            return;
        }

        let Some(reference) = chain.main_node() else {
            return;
        };

        let node_transform = math::transform_through_portal(
            &reference.transform,
            portal.plane(),
            target.plane(),
            entry_face,
            exit_face,
        );
        let node_physics = math::transform_physics_state_through_portal(
            &reference.physics_state,
            portal.plane(),
            target.plane(),
            entry_face,
            exit_face,
        );

        let descriptor = ChainNodeCreateDescriptor {
            source_entity_id: entity_id,
            target_transform: node_transform,
            target_physics: node_physics,
            through_portal: portal_id,
            entry_face,
            exit_face,
            full_functionality: true,
        };

        let Some(node_id) = host.physics.create_chain_node_entity(&descriptor) else {
            warn!(entity_id, portal_id, "host refused chain node creation, chain not extended");
            return;
        };

        let (bounds_min, bounds_max) = host.physics_data.get_entity_bounds(reference.entity_id);
        let (ghost_min, ghost_max, _) = math::transform_bounds_through_portal(
            bounds_min,
            bounds_max,
            &reference.transform,
            portal.plane(),
            target.plane(),
            entry_face,
            exit_face,
        );
        host.physics.set_ghost_entity_bounds(node_id, ghost_min, ghost_max);

        let mut node = EntityChainNode::new(node_id, EntityKind::Ghost);
        node.entry_portal = Some(portal_id);
        node.exit_portal = Some(target_id);
        node.chain_position = chain.chain.len();
        node.segment_length = (node_transform.position
            - chain.chain.last().map(|n| n.transform.position).unwrap_or_default())
        .length();
        node.transform = node_transform;
        node.physics_state = node_physics;
        node.entry_face = entry_face;
        node.exit_face = exit_face;
        chain.chain.push(node);
        chain.recompute_total_length();
        chain.chain_version += 1;
        chain.is_actively_teleporting = true;
        chain.last_update_timestamp = self.clock_ms;

        self.chain_node_to_original.insert(node_id, original);

        host.notify(|events| {
            events.on_ghost_entity_created(original, node_id, portal_id);
        });

        let snapshot = build_snapshot(
            chain,
            node_id,
            (ghost_min, ghost_max),
            entry_face,
            exit_face,
            self.clock_ms,
            host,
        );
        if let Some(snapshot) = snapshot {
            self.ghost_snapshots.insert(original, snapshot);
        }

        let camera = estimate_camera_position(chain, host);
        self.clipping
            .setup_chain_clipping(chain, camera, host.physics.as_mut());
        self.clipping
            .set_entity_quality(original, self.default_clipping_quality);
        update_chain_clip_fields(chain, portals, &self.clipping, host);

        if self.use_logical_entity_control {
            sync_chain_to_logical(chain, &mut self.logical, host);
        }

        let state = self
            .active_teleports
            .entry(original)
            .or_insert_with(|| TeleportState::new(original, portal_id));
        state.source_portal = portal_id;
        state.target_portal = Some(target_id);
        state.crossing_state = CrossingState::Crossing;
        state.is_teleporting = true;
        state.seamless_mode = true;
        state.source_face = entry_face;
        state.target_face = exit_face;
        state.active_source_face = entry_face;
        state.active_target_face = exit_face;
        state.sync_group_id = portal_id;
        state.logical_entity_id = self.entity_chains[&original].logical_entity_id;
        state.ghost_entity_id = first_ghost_of(&self.entity_chains[&original]);

        host.notify(|events| {
            events.on_entity_teleport_begin(original, portal_id, target_id);
        });
    }

    /// Migrates the main role forward when the crossing node carries it.
    /// The host confirms the role swap first; refusal leaves the chain (and
    /// its version) untouched.
    pub fn on_center_crossed(
        &mut self,
        host: &mut Host,
        portals: &PortalTable,
        entity_id: EntityId,
        portal_id: PortalId,
        crossed_face: PortalFace,
    ) {
        let Some(original) = self.resolve_original(entity_id) else {
            debug!(entity_id, portal_id, "center crossing for an entity without a chain");
            return;
        };
        let Some(chain) = self.entity_chains.get_mut(&original) else {
            return;
        };

        let Some(node_position) = chain.position_of(entity_id) else {
            warn!(entity_id, original, "crossing node not present in its own chain");
            return;
        };

        let migrates = self.auto_swap_on_center_cross
            && node_position == chain.main_position
            && node_position + 1 < chain.chain.len();

        if migrates {
            let old_main = chain.chain[node_position].entity_id;
            let new_main = chain.chain[node_position + 1].entity_id;
            let target_face = crossed_face.opposite();

            if !host
                .physics
                .swap_entity_roles_with_faces(old_main, new_main, crossed_face, target_face)
            {
                warn!(old_main, new_main, "host refused role swap, chain unchanged");
                return;
            }

            chain.chain[node_position].kind = EntityKind::Ghost;
            chain.chain[node_position + 1].kind = EntityKind::Main;
            chain.main_position = node_position + 1;
            chain.chain_version += 1;
            chain.last_update_timestamp = self.clock_ms;

            host.physics.set_entity_functional_state(new_main, true);

            let main_transform = host.physics_data.get_entity_transform(new_main);
            let ghost_transform = host.physics_data.get_entity_transform(old_main);
            host.notify(|events| {
                events.on_entity_roles_swapped(
                    old_main,
                    new_main,
                    new_main,
                    old_main,
                    Some(portal_id),
                    &main_transform,
                    &ghost_transform,
                );
            });

            let camera = estimate_camera_position(chain, host);
            self.clipping
                .setup_chain_clipping(chain, camera, host.physics.as_mut());
            update_chain_clip_fields(chain, portals, &self.clipping, host);

            if self.use_logical_entity_control {
                sync_chain_to_logical(chain, &mut self.logical, host);
            }

            debug!(original, old_main, new_main, "main role migrated forward");
        }

        if let Some(state) = self.active_teleports.get_mut(&original) {
            state.active_source_face = crossed_face;
            state.active_target_face = crossed_face.opposite();
            state.center_has_crossed = true;
            state.crossing_point = host.physics_data.calculate_entity_center_of_mass(entity_id);
            if migrates {
                state.role_swapped = true;
                state.crossing_state = CrossingState::Teleported;
            }
        }
    }

    /// Marks the teleport state finished. No chain node is touched here;
    /// shrinking waits for the exit event.
    pub fn on_fully_passed(
        &mut self,
        host: &mut Host,
        entity_id: EntityId,
        portal_id: PortalId,
        target_portal_id: Option<PortalId>,
    ) {
        let original = self.resolve_original(entity_id).unwrap_or(entity_id);
        let Some(state) = self.active_teleports.get_mut(&original) else {
            return;
        };

        state.crossing_state = CrossingState::Teleported;
        state.is_teleporting = false;
        state.transition_progress = 1.0;

        host.notify(|events| {
            events.on_entity_teleport_complete(original, Some(portal_id), target_portal_id);
        });
    }

    /// Shrinks the chain from the front: the oldest segment is no longer
    /// relevant once the body has left its boundary. A chain reduced to one
    /// node completes the teleport; an emptied chain dissolves entirely.
    pub fn on_exit_portal(
        &mut self,
        host: &mut Host,
        portals: &PortalTable,
        entity_id: EntityId,
        portal_id: PortalId,
    ) {
        let Some(original) = self.resolve_original(entity_id) else {
            debug!(entity_id, portal_id, "exit event for an entity without a chain");
            return;
        };
        let Some(mut chain) = self.entity_chains.remove(&original) else {
            return;
        };

        if chain.chain.is_empty() {
            self.dissolve_chain(host, original, chain);
            return;
        }

        let removed = chain.chain.remove(0);
        if removed.kind == EntityKind::Ghost {
            host.physics.destroy_chain_node_entity(removed.entity_id);
            let removed_id = removed.entity_id;
            let entry_portal = removed.entry_portal;
            host.notify(|events| {
                events.on_ghost_entity_destroyed(original, removed_id, entry_portal);
            });
        }
        self.chain_node_to_original.remove(&removed.entity_id);

        chain.main_position = chain.main_position.saturating_sub(1);
        chain.renumber();
        chain.recompute_total_length();
        chain.chain_version += 1;
        chain.last_update_timestamp = self.clock_ms;

        debug_assert!(chain.chain.is_empty() || chain.main_position < chain.chain.len());
        if !chain.chain.is_empty() && chain.main_position >= chain.chain.len() {
            chain.main_position = chain.chain.len() - 1;
        }

        if chain.chain.is_empty() {
            self.dissolve_chain(host, original, chain);
            return;
        }

        if chain.chain.len() == 1 {
            let final_entity = chain.chain[0].entity_id;
            if chain.chain[0].kind == EntityKind::Ghost {
                chain.chain[0].kind = EntityKind::Main;
                chain.main_position = 0;
                host.physics.set_entity_functional_state(final_entity, true);
            }
            chain.is_actively_teleporting = false;

            if let Some(state) = self.active_teleports.get_mut(&original) {
                state.crossing_state = CrossingState::Teleported;
                state.is_teleporting = false;
                state.transition_progress = 1.0;
                state.ghost_entity_id = None;
            }

            let from_portal = removed.entry_portal.or(Some(portal_id));
            let to_portal = chain.chain[0].entry_portal;
            host.notify(|events| {
                events.on_entity_teleport_complete(original, from_portal, to_portal);
            });

            debug!(original, final_entity, "chain teleport completed");
        }

        let camera = estimate_camera_position(&chain, host);
        self.clipping
            .setup_chain_clipping(&chain, camera, host.physics.as_mut());
        update_chain_clip_fields(&mut chain, portals, &self.clipping, host);

        if self.use_logical_entity_control {
            sync_chain_to_logical(&mut chain, &mut self.logical, host);
        }

        self.entity_chains.insert(original, chain);
    }

    // === chain queries ===

    pub fn chain_state(&self, original_entity_id: EntityId) -> Option<&EntityChainState> {
        self.entity_chains.get(&original_entity_id)
    }

    pub fn chain_main_entity(&self, original_entity_id: EntityId) -> Option<EntityId> {
        self.entity_chains
            .get(&original_entity_id)
            .and_then(|chain| chain.main_entity())
    }

    pub fn chain_length(&self, original_entity_id: EntityId) -> usize {
        self.entity_chains
            .get(&original_entity_id)
            .map(|chain| chain.chain.len())
            .unwrap_or(0)
    }

    pub fn teleport_state(&self, entity_id: EntityId) -> Option<&TeleportState> {
        self.active_teleports.get(&entity_id)
    }

    pub fn ghost_snapshot(&self, entity_id: EntityId) -> Option<&GhostEntitySnapshot> {
        self.ghost_snapshots.get(&entity_id)
    }

    pub fn is_entity_teleporting(&self, entity_id: EntityId) -> bool {
        self.active_teleports
            .get(&entity_id)
            .is_some_and(|state| state.is_teleporting)
    }

    pub fn teleporting_entity_count(&self) -> usize {
        self.active_teleports
            .values()
            .filter(|state| state.is_teleporting)
            .count()
    }

    // === cleanup ===

    /// Drops every piece of teleport state the entity still owns, restoring
    /// logical control and clipping on the way out.
    pub fn cleanup_entity(&mut self, host: &mut Host, entity_id: EntityId) {
        if let Some(logical_id) = self.logical.logical_entity_by_physical_entity(entity_id) {
            self.logical.destroy_logical_entity(host, logical_id);
        }
        self.clipping
            .cleanup_entity_clipping(entity_id, host.physics.as_mut());

        if let Some(chain) = self.entity_chains.remove(&entity_id) {
            for node in &chain.chain {
                self.chain_node_to_original.remove(&node.entity_id);
                if node.kind == EntityKind::Ghost {
                    host.physics.destroy_chain_node_entity(node.entity_id);
                }
            }
        }

        self.chain_node_to_original.remove(&entity_id);
        self.active_teleports.remove(&entity_id);
        self.ghost_snapshots.remove(&entity_id);
    }

    fn cleanup_completed_teleports(&mut self) {
        let finished: Vec<EntityId> = self
            .active_teleports
            .iter()
            .filter(|(_, state)| {
                !state.is_teleporting && state.crossing_state == CrossingState::Teleported
            })
            .map(|(id, _)| *id)
            .collect();

        for entity_id in finished {
            self.active_teleports.remove(&entity_id);
            self.ghost_snapshots.remove(&entity_id);
        }
    }

    fn dissolve_chain(&mut self, host: &mut Host, original: EntityId, chain: EntityChainState) {
        if let Some(logical_id) = chain.logical_entity_id {
            self.logical.destroy_logical_entity(host, logical_id);
        }
        self.clipping
            .cleanup_entity_clipping(original, host.physics.as_mut());
        self.chain_node_to_original.remove(&original);
        self.active_teleports.remove(&original);
        self.ghost_snapshots.remove(&original);
        debug!(original, "chain dissolved");
    }

    // === batch sync control ===

    pub fn set_entity_batch_sync(&mut self, entity_id: EntityId, enable: bool, sync_group_id: u32) {
        if let Some(state) = self.active_teleports.get_mut(&entity_id) {
            state.enable_batch_sync = enable;
            state.sync_group_id = sync_group_id;
        }
        if let Some(chain) = self.entity_chains.get_mut(&entity_id) {
            chain.enable_batch_sync = enable;
            chain.sync_group_id = sync_group_id;
        }
    }

    /// Immediately pushes every snapshot in the group to the host as one
    /// batch.
    pub fn force_batch_sync_group(&mut self, host: &mut Host, sync_group_id: u32) {
        let mut batch = Vec::new();
        for (entity_id, state) in &self.active_teleports {
            if state.enable_batch_sync
                && state.sync_group_id == sync_group_id
                && state.ghost_entity_id.is_some()
            {
                if let Some(snapshot) = self.ghost_snapshots.get_mut(entity_id) {
                    snapshot.requires_immediate_sync = true;
                    snapshot.timestamp = self.clock_ms;
                    batch.push(snapshot.clone());
                }
            }
        }

        if !batch.is_empty() {
            host.physics.sync_ghost_entities(&batch);
            self.time_since_batch_sync = 0.0;
        }
    }

    pub fn batch_sync_stats(&self) -> BatchSyncStats {
        let mut stats = BatchSyncStats {
            total_entities: self.active_teleports.len(),
            last_batch_sync_time: self.time_since_batch_sync,
            ..BatchSyncStats::default()
        };
        for state in self.active_teleports.values() {
            if state.enable_batch_sync {
                stats.batch_enabled_entities += 1;
            }
            if state.ghost_entity_id.is_some() && state.requires_full_sync {
                stats.pending_sync_count += 1;
            }
        }
        stats
    }

    // === logical entity control ===

    pub fn logical_entities(&self) -> &LogicalEntityManager {
        &self.logical
    }

    pub fn set_logical_entity_merge_strategy(&mut self, entity_id: EntityId, strategy: MergeStrategy) {
        if let Some(logical_id) = self.logical.logical_entity_by_physical_entity(entity_id) {
            self.logical.set_merge_strategy(logical_id, strategy);
        }
    }

    pub fn is_logical_entity_constrained(&self, entity_id: EntityId) -> bool {
        self.logical
            .logical_entity_by_physical_entity(entity_id)
            .is_some_and(|logical_id| self.logical.is_constrained(logical_id))
    }

    pub fn logical_entity_constraint(&self, entity_id: EntityId) -> Option<&PhysicsConstraintState> {
        self.logical
            .logical_entity_by_physical_entity(entity_id)
            .and_then(|logical_id| self.logical.constraint_state(logical_id))
    }

    pub fn force_update_logical_entity(&mut self, host: &mut Host, entity_id: EntityId) {
        if let Some(logical_id) = self.logical.logical_entity_by_physical_entity(entity_id) {
            self.logical.force_update(host, logical_id);
        }
    }

    // === clipping control ===

    pub fn set_entity_clipping_quality(&mut self, entity_id: EntityId, quality_level: u8) {
        self.clipping.set_entity_quality(entity_id, quality_level);
    }

    pub fn set_smooth_transitions(&mut self, entity_id: EntityId, enable: bool, blend_distance: f32) {
        self.clipping
            .set_smooth_transitions(entity_id, enable, blend_distance);
    }

    pub fn visible_segment_count(&self, entity_id: EntityId, camera_position: Vec3) -> usize {
        self.clipping.visible_segment_count(entity_id, camera_position)
    }

    pub fn set_clipping_debug_mode(&mut self, enable: bool) {
        self.clipping.set_debug_mode(enable);
    }

    pub fn clipping_stats(&self) -> ClippingStats {
        self.clipping.stats()
    }

    // === internals ===

    fn resolve_original(&self, entity_id: EntityId) -> Option<EntityId> {
        if let Some(original) = self.chain_node_to_original.get(&entity_id) {
            return Some(*original);
        }
        self.entity_chains
            .contains_key(&entity_id)
            .then_some(entity_id)
    }

    /// Seeds a single-node chain around the original entity. The original
    /// maps to itself in the node table, so every later resolver finds it.
    fn ensure_chain(&mut self, host: &mut Host, original: EntityId) {
        if self.entity_chains.contains_key(&original) {
            return;
        }

        let mut chain = EntityChainState::new(original);
        chain.is_actively_teleporting = true;

        let mut node = EntityChainNode::new(original, EntityKind::Main);
        node.transform = host.physics_data.get_entity_transform(original);
        node.physics_state = host.physics_data.get_entity_physics_state(original);
        chain.chain.push(node);

        self.chain_node_to_original.insert(original, original);

        if self.use_logical_entity_control {
            chain.logical_entity_id =
                self.logical.create_multi_entity_control(host, &[original], &[]);
        }

        self.entity_chains.insert(original, chain);
        debug!(original, "chain state created");
    }

    /// Snapshot-cache sync used when logical control is off. High-priority
    /// entities sync every tick; batch groups sync together at half the
    /// individual rate.
    fn sync_ghosts(&mut self, delta_time: f32, host: &mut Host, portals: &PortalTable) {
        self.time_since_individual_sync += delta_time;
        self.time_since_batch_sync += delta_time;

        let individual_interval = 1.0 / self.sync_frequency;
        let batch_interval = 1.0 / (self.sync_frequency * 0.5);
        let individual_due = self.time_since_individual_sync >= individual_interval;
        let batch_due = self.time_since_batch_sync >= batch_interval;

        let mut batches: FxHashMap<u32, Vec<GhostEntitySnapshot>> = FxHashMap::default();
        let mut individual: Vec<EntityId> = Vec::new();

        for (entity_id, state) in &self.active_teleports {
            if state.ghost_entity_id.is_none() {
                continue;
            }

            let urgent = state.is_high_priority || state.requires_full_sync;
            if state.enable_batch_sync && !urgent {
                if batch_due {
                    if let Some(snapshot) = self.ghost_snapshots.get(entity_id) {
                        batches
                            .entry(state.sync_group_id)
                            .or_default()
                            .push(snapshot.clone());
                    }
                }
            } else if urgent || individual_due {
                individual.push(*entity_id);
            }
        }

        for (_, mut group) in batches.drain() {
            for snapshot in &mut group {
                snapshot.timestamp = self.clock_ms;
            }
            host.physics.sync_ghost_entities(&group);
        }
        if batch_due {
            self.time_since_batch_sync = 0.0;
        }
        if individual_due {
            self.time_since_individual_sync = 0.0;
        }

        for entity_id in individual {
            self.refresh_and_push_ghost(host, portals, entity_id);
        }
    }

    /// Recomputes one ghost's mirrored state from the current main state and
    /// pushes it to the host.
    fn refresh_and_push_ghost(&mut self, host: &mut Host, portals: &PortalTable, entity_id: EntityId) {
        let Some(state) = self.active_teleports.get(&entity_id) else {
            return;
        };
        let Some(ghost_id) = state.ghost_entity_id else {
            return;
        };
        let Some(target_id) = state.target_portal else {
            return;
        };
        let (Some(source), Some(target)) =
            (portals.get(&state.source_portal), portals.get(&target_id))
        else {
            warn!(entity_id, "portals for ghost sync no longer exist");
            return;
        };

        let main_transform = host.physics_data.get_entity_transform(entity_id);
        let main_physics = host.physics_data.get_entity_physics_state(entity_id);

        let ghost_transform = math::transform_through_portal(
            &main_transform,
            source.plane(),
            target.plane(),
            state.active_source_face,
            state.active_target_face,
        );
        let ghost_physics = math::transform_physics_state_through_portal(
            &main_physics,
            source.plane(),
            target.plane(),
            state.active_source_face,
            state.active_target_face,
        );

        host.physics
            .update_ghost_entity(ghost_id, &ghost_transform, &ghost_physics);

        if let Some(snapshot) = self.ghost_snapshots.get_mut(&entity_id) {
            snapshot.main_transform = main_transform;
            snapshot.main_physics = main_physics;
            snapshot.ghost_transform = ghost_transform;
            snapshot.ghost_physics = ghost_physics;
            snapshot.timestamp = self.clock_ms;
        }
    }
}

fn linked_pair(portals: &PortalTable, portal_id: PortalId) -> Option<(&Portal, &Portal)> {
    let portal = portals.get(&portal_id)?;
    if !portal.is_active() {
        return None;
    }
    let target = portals.get(&portal.linked_portal()?)?;
    if !target.is_active() {
        return None;
    }
    Some((portal, target))
}

fn first_ghost_of(chain: &EntityChainState) -> Option<EntityId> {
    chain
        .chain
        .iter()
        .enumerate()
        .find(|(index, _)| *index != chain.main_position)
        .map(|(_, node)| node.entity_id)
}

fn estimate_camera_position(chain: &EntityChainState, host: &Host) -> Vec3 {
    if let Some(query) = host.render_query.as_deref() {
        return query.get_main_camera().position;
    }
    // Behind and slightly above the main segment; good enough for LOD.
    match chain.main_node() {
        Some(node) => node.transform.position + Vec3::new(0.0, 2.0, -5.0),
        None => Vec3::new(0.0, 2.0, -5.0),
    }
}

fn node_weight(node: &EntityChainNode) -> f32 {
    if node.kind == EntityKind::Main {
        MAIN_NODE_WEIGHT
    } else if node.chain_position == 0 {
        HEAD_NODE_WEIGHT
    } else {
        (TAIL_WEIGHT_BASE - TAIL_WEIGHT_STEP * node.chain_position as f32).max(TAIL_WEIGHT_FLOOR)
    }
}

/// Keeps the logical entity's member list, primary entity and strategy in
/// step with the chain. The merge runs without sync-back; the periodic
/// update pushes states, never the event path.
fn sync_chain_to_logical(
    chain: &mut EntityChainState,
    logical: &mut LogicalEntityManager,
    host: &mut Host,
) {
    let Some(logical_id) = chain.logical_entity_id else {
        return;
    };

    let members: Vec<EntityId> = chain.chain.iter().map(|node| node.entity_id).collect();
    let weights: Vec<f32> = chain.chain.iter().map(node_weight).collect();

    let current: Vec<EntityId> = logical
        .logical_entity_state(logical_id)
        .map(|state| state.controlled_entities.clone())
        .unwrap_or_default();

    for entity_id in &current {
        if !members.contains(entity_id) {
            logical.remove_controlled_entity(host, logical_id, *entity_id);
        }
    }
    for (index, entity_id) in members.iter().enumerate() {
        if !current.contains(entity_id) {
            logical.add_controlled_entity(host, logical_id, *entity_id, weights[index]);
        }
    }

    if let Some(primary) = chain.main_entity() {
        logical.set_primary_controlled_entity(logical_id, primary);
    }

    let strategy = if chain.is_actively_teleporting {
        MergeStrategy::ForceSummation
    } else if chain.chain.len() > PHYSICS_SIMULATION_CHAIN_LENGTH {
        MergeStrategy::PhysicsSimulation
    } else {
        MergeStrategy::WeightedAverage
    };
    logical.set_merge_strategy(logical_id, strategy);
    logical.set_physics_simulation_enabled(logical_id, strategy == MergeStrategy::PhysicsSimulation);
    logical.remerge(host, logical_id);

    if let Some(state) = logical.logical_entity_state(logical_id) {
        chain.unified_physics_state = state.unified_physics;
        chain.center_of_mass_world_pos = state.center_of_mass;
        chain.total_applied_force = state.total_applied_force;
        chain.total_applied_torque = state.total_applied_torque;
    }
}

/// Per-node single-plane clipping at each segment's entry portal. Applied
/// only while the multi-segment set is inactive for the chain, as the
/// fallback path for hosts on the cheapest quality tier.
fn update_chain_clip_fields(
    chain: &mut EntityChainState,
    portals: &PortalTable,
    clipping: &MultiSegmentClippingManager,
    host: &mut Host,
) {
    let multi_active = clipping.requires_multi_segment_clipping(chain.original_entity_id);

    for node in &mut chain.chain {
        match node.entry_portal.and_then(|id| portals.get(&id)) {
            Some(portal) => {
                node.requires_clipping = true;
                node.clipping_plane = ClippingPlane::from_point_and_normal(
                    portal.plane().center,
                    portal.plane().face_normal(node.entry_face),
                );
                if !multi_active {
                    host.physics
                        .set_entity_clipping_plane(node.entity_id, &node.clipping_plane);
                }
            }
            None => {
                node.requires_clipping = false;
                if !multi_active {
                    host.physics.disable_entity_clipping(node.entity_id);
                }
            }
        }
    }
}

/// Snapshot of the main/ghost mirror pair for the sync cache.
fn build_snapshot(
    chain: &EntityChainState,
    ghost_id: EntityId,
    ghost_bounds: (Vec3, Vec3),
    source_face: PortalFace,
    target_face: PortalFace,
    timestamp: u64,
    host: &mut Host,
) -> Option<GhostEntitySnapshot> {
    let main = chain.main_node()?;
    let ghost = chain.chain.iter().find(|node| node.entity_id == ghost_id)?;
    let (main_min, main_max) = host.physics_data.get_entity_bounds(main.entity_id);

    Some(GhostEntitySnapshot {
        main_entity_id: main.entity_id,
        ghost_entity_id: ghost_id,
        main_transform: main.transform,
        ghost_transform: ghost.transform,
        main_physics: main.physics_state,
        ghost_physics: ghost.physics_state,
        main_bounds_min: main_min,
        main_bounds_max: main_max,
        ghost_bounds_min: ghost_bounds.0,
        ghost_bounds_max: ghost_bounds.1,
        source_face,
        target_face,
        has_full_functionality: true,
        sync_priority: 0,
        requires_immediate_sync: false,
        timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockEvent, MockHost};
    use glam::Quat;
    use riftgate_shared::types::{PortalPlane, Transform};

    const TOLERANCE: f32 = 1e-4;
    const ENTITY: EntityId = 7;

    fn facing_portals() -> PortalTable {
        let mut p = Portal::new(
            1,
            PortalPlane {
                center: Vec3::new(-5.0, 0.0, 0.0),
                normal: Vec3::X,
                up: Vec3::Y,
                right: Vec3::Z,
                width: 2.0,
                height: 3.0,
                active_face: PortalFace::A,
            },
        );
        let mut q = Portal::new(
            2,
            PortalPlane {
                center: Vec3::new(5.0, 0.0, 0.0),
                normal: Vec3::NEG_X,
                up: Vec3::Y,
                right: Vec3::NEG_Z,
                width: 2.0,
                height: 3.0,
                active_face: PortalFace::A,
            },
        );
        p.set_linked_portal(Some(2));
        q.set_linked_portal(Some(1));

        let mut portals = PortalTable::default();
        portals.insert(1, p);
        portals.insert(2, q);
        portals
    }

    fn seeded_mock() -> MockHost {
        let mock = MockHost::new();
        mock.world
            .borrow_mut()
            .add_entity(ENTITY, Vec3::new(-4.0, 0.0, 0.0), Vec3::new(-2.0, 0.0, 0.0));
        mock
    }

    #[test]
    fn intersect_start_extends_the_chain() {
        let mock = seeded_mock();
        let mut host = mock.build_host();
        let portals = facing_portals();

        let mut manager = TeleportManager::new();
        manager.on_intersect_start(&mut host, &portals, ENTITY, 1);

        assert_eq!(manager.chain_length(ENTITY), 2);
        let chain = manager.chain_state(ENTITY).unwrap();
        assert_eq!(chain.chain_version, 1);
        assert_eq!(chain.main_position, 0);

        let main = &chain.chain[0];
        assert_eq!(main.kind, EntityKind::Main);
        assert_eq!(main.entity_id, ENTITY);
        assert!((main.transform.position - Vec3::new(-4.0, 0.0, 0.0)).length() < TOLERANCE);

        let ghost = &chain.chain[1];
        assert_eq!(ghost.kind, EntityKind::Ghost);
        assert!((ghost.transform.position - Vec3::new(4.0, 0.0, 0.0)).length() < TOLERANCE);
        assert!(
            (ghost.physics_state.linear_velocity - Vec3::new(-2.0, 0.0, 0.0)).length() < TOLERANCE
        );
        assert_eq!(ghost.entry_portal, Some(1));
        assert_eq!(ghost.exit_portal, Some(2));

        let world = mock.world.borrow();
        assert_eq!(world.created_nodes.len(), 1);
        let ghost_id = world.created_nodes[0].0;
        assert!(world
            .events
            .contains(&MockEvent::GhostCreated { main: ENTITY, ghost: ghost_id }));
        assert!(world.events.contains(&MockEvent::TeleportBegin(ENTITY)));
        drop(world);

        assert!(manager.is_entity_teleporting(ENTITY));
        let state = manager.teleport_state(ENTITY).unwrap();
        assert_eq!(state.source_portal, 1);
        assert_eq!(state.target_portal, Some(2));
        assert_eq!(state.crossing_state, CrossingState::Crossing);
    }

    #[test]
    fn duplicate_intersect_events_are_ignored() {
        let mock = seeded_mock();
        let mut host = mock.build_host();
        let portals = facing_portals();

        let mut manager = TeleportManager::new();
        manager.on_intersect_start(&mut host, &portals, ENTITY, 1);
        manager.on_intersect_start(&mut host, &portals, ENTITY, 1);

        assert_eq!(manager.chain_length(ENTITY), 2);
        assert_eq!(mock.world.borrow().created_nodes.len(), 1);
        assert_eq!(manager.chain_state(ENTITY).unwrap().chain_version, 1);
    }

    #[test]
    fn refused_node_creation_is_a_safe_no_op() {
        let mock = seeded_mock();
        mock.world.borrow_mut().refuse_node_creation = true;
        let mut host = mock.build_host();
        let portals = facing_portals();

        let mut manager = TeleportManager::new();
        manager.on_intersect_start(&mut host, &portals, ENTITY, 1);

        assert_eq!(manager.chain_length(ENTITY), 1);
        assert_eq!(manager.chain_state(ENTITY).unwrap().chain_version, 0);
        let world = mock.world.borrow();
        assert!(world
            .events
            .iter()
            .all(|e| !matches!(e, MockEvent::GhostCreated { .. })));
    }

    #[test]
    fn center_crossing_migrates_the_main_role() {
        let mock = seeded_mock();
        let mut host = mock.build_host();
        let portals = facing_portals();

        let mut manager = TeleportManager::new();
        manager.on_intersect_start(&mut host, &portals, ENTITY, 1);
        let ghost_id = mock.world.borrow().created_nodes[0].0;
        let transform_before = mock.world.borrow().transforms[&ENTITY];
        let physics_before = mock.world.borrow().physics[&ENTITY];

        manager.on_center_crossed(&mut host, &portals, ENTITY, 1, PortalFace::A);

        let chain = manager.chain_state(ENTITY).unwrap();
        assert_eq!(chain.main_position, 1);
        assert_eq!(chain.chain[0].kind, EntityKind::Ghost);
        assert_eq!(chain.chain[1].kind, EntityKind::Main);
        assert_eq!(chain.chain_version, 2);

        let world = mock.world.borrow();
        assert_eq!(
            world.role_swaps,
            vec![(ENTITY, ghost_id, PortalFace::A, PortalFace::B)]
        );
        assert!(world.events.contains(&MockEvent::RolesSwapped {
            old_main: ENTITY,
            new_main: ghost_id
        }));
        assert!(world.functional_states.contains(&(ghost_id, true)));

        // The engine never touches either entity's own physical state.
        assert!(world.forced_states.is_empty());
        assert_eq!(world.transforms[&ENTITY], transform_before);
        assert_eq!(world.physics[&ENTITY], physics_before);
    }

    #[test]
    fn refused_role_swap_leaves_the_chain_untouched() {
        let mock = seeded_mock();
        let mut host = mock.build_host();
        let portals = facing_portals();

        let mut manager = TeleportManager::new();
        manager.on_intersect_start(&mut host, &portals, ENTITY, 1);
        mock.world.borrow_mut().refuse_role_swap = true;

        manager.on_center_crossed(&mut host, &portals, ENTITY, 1, PortalFace::A);

        let chain = manager.chain_state(ENTITY).unwrap();
        assert_eq!(chain.main_position, 0);
        assert_eq!(chain.chain[0].kind, EntityKind::Main);
        assert_eq!(chain.chain_version, 1);
        assert!(mock
            .world
            .borrow()
            .events
            .iter()
            .all(|e| !matches!(e, MockEvent::RolesSwapped { .. })));
    }

    #[test]
    fn exit_shrinks_from_the_front_and_completes() {
        let mock = seeded_mock();
        let mut host = mock.build_host();
        let portals = facing_portals();

        let mut manager = TeleportManager::new();
        manager.on_intersect_start(&mut host, &portals, ENTITY, 1);
        let ghost_id = mock.world.borrow().created_nodes[0].0;
        manager.on_center_crossed(&mut host, &portals, ENTITY, 1, PortalFace::A);

        manager.on_exit_portal(&mut host, &portals, ENTITY, 1);

        assert_eq!(manager.chain_length(ENTITY), 1);
        assert_eq!(manager.chain_main_entity(ENTITY), Some(ghost_id));
        let chain = manager.chain_state(ENTITY).unwrap();
        assert_eq!(chain.chain[0].kind, EntityKind::Main);
        assert!(!chain.is_actively_teleporting);

        let world = mock.world.borrow();
        // The former main, retagged ghost by the migration, is the trailing
        // segment and gets destroyed.
        assert!(world.destroyed_nodes.contains(&ENTITY));
        assert!(world
            .events
            .contains(&MockEvent::GhostDestroyed { main: ENTITY, ghost: ENTITY }));
        assert!(world.events.contains(&MockEvent::TeleportComplete(ENTITY)));
    }

    #[test]
    fn chain_version_strictly_increases_across_mutations() {
        let mock = seeded_mock();
        let mut host = mock.build_host();
        let portals = facing_portals();

        let mut manager = TeleportManager::new();
        manager.on_intersect_start(&mut host, &portals, ENTITY, 1);
        let v1 = manager.chain_state(ENTITY).unwrap().chain_version;
        manager.on_center_crossed(&mut host, &portals, ENTITY, 1, PortalFace::A);
        let v2 = manager.chain_state(ENTITY).unwrap().chain_version;
        manager.on_exit_portal(&mut host, &portals, ENTITY, 1);
        let v3 = manager.chain_state(ENTITY).unwrap().chain_version;

        assert!(v1 < v2 && v2 < v3);
    }

    #[test]
    fn exit_on_a_lone_node_dissolves_the_chain() {
        let mock = seeded_mock();
        let mut host = mock.build_host();
        let portals = facing_portals();

        let mut manager = TeleportManager::new();
        manager.on_intersect_start(&mut host, &portals, ENTITY, 1);
        let ghost_id = mock.world.borrow().created_nodes[0].0;
        manager.on_center_crossed(&mut host, &portals, ENTITY, 1, PortalFace::A);
        manager.on_exit_portal(&mut host, &portals, ENTITY, 1);
        assert_eq!(manager.chain_length(ENTITY), 1);

        manager.on_exit_portal(&mut host, &portals, ghost_id, 2);

        assert!(manager.chain_state(ENTITY).is_none());
        // Engine control handed back when the logical entity dissolved.
        assert!(mock
            .world
            .borrow()
            .engine_control_changes
            .contains(&(ghost_id, true)));
    }

    #[test]
    fn events_from_ghost_nodes_resolve_to_the_original_chain() {
        let mock = seeded_mock();
        let mut host = mock.build_host();
        let portals = facing_portals();

        let mut manager = TeleportManager::new();
        manager.on_intersect_start(&mut host, &portals, ENTITY, 1);
        let ghost_id = mock.world.borrow().created_nodes[0].0;

        // The ghost drifting into the target portal extends the same chain
        // through the opposite boundary.
        manager.on_intersect_start(&mut host, &portals, ghost_id, 2);

        assert_eq!(manager.chain_length(ENTITY), 3);
        let chain = manager.chain_state(ENTITY).unwrap();
        assert_eq!(chain.chain[2].entry_portal, Some(2));
        assert_eq!(chain.chain[2].exit_portal, Some(1));
    }

    #[test]
    fn chain_strategy_follows_chain_state() {
        let mock = seeded_mock();
        let mut host = mock.build_host();
        let portals = facing_portals();

        let mut manager = TeleportManager::new();
        manager.on_intersect_start(&mut host, &portals, ENTITY, 1);

        let chain = manager.chain_state(ENTITY).unwrap();
        let logical_id = chain.logical_entity_id.unwrap();
        let logical_state = manager.logical_entities().logical_entity_state(logical_id).unwrap();
        assert_eq!(logical_state.merge_strategy, MergeStrategy::ForceSummation);
        assert_eq!(logical_state.controlled_entities.len(), 2);
    }

    #[test]
    fn snapshot_sync_batches_by_group_when_logical_control_is_off() {
        let mock = seeded_mock();
        let mut host = mock.build_host();
        let portals = facing_portals();

        let mut manager = TeleportManager::new();
        manager.set_logical_entity_control_mode(false);
        manager.on_intersect_start(&mut host, &portals, ENTITY, 1);
        manager.set_entity_batch_sync(ENTITY, true, 1);

        manager.update(1.0, &mut host, &portals);

        let world = mock.world.borrow();
        assert_eq!(world.batch_sync_sizes, vec![1]);
        assert!(world.updated_ghosts.is_empty());
    }

    #[test]
    fn snapshot_sync_updates_ghosts_individually_by_default() {
        let mock = seeded_mock();
        let mut host = mock.build_host();
        let portals = facing_portals();

        let mut manager = TeleportManager::new();
        manager.set_logical_entity_control_mode(false);
        manager.on_intersect_start(&mut host, &portals, ENTITY, 1);
        let ghost_id = mock.world.borrow().created_nodes[0].0;

        manager.update(1.0, &mut host, &portals);

        let world = mock.world.borrow();
        assert!(world.batch_sync_sizes.is_empty());
        assert_eq!(world.updated_ghosts, vec![ghost_id]);
    }

    #[test]
    fn ghost_sync_is_disabled_under_logical_control() {
        let mock = seeded_mock();
        let mut host = mock.build_host();
        let portals = facing_portals();

        let mut manager = TeleportManager::new();
        manager.on_intersect_start(&mut host, &portals, ENTITY, 1);

        manager.update(1.0, &mut host, &portals);

        let world = mock.world.borrow();
        assert!(world.batch_sync_sizes.is_empty());
        assert!(world.updated_ghosts.is_empty());
        // The logical entity sync-back is authoritative instead.
        assert!(!world.forced_states.is_empty());
    }

    #[test]
    fn force_batch_sync_flushes_a_group_immediately() {
        let mock = seeded_mock();
        let mut host = mock.build_host();
        let portals = facing_portals();

        let mut manager = TeleportManager::new();
        manager.set_logical_entity_control_mode(false);
        manager.on_intersect_start(&mut host, &portals, ENTITY, 1);
        manager.set_entity_batch_sync(ENTITY, true, 99);

        manager.force_batch_sync_group(&mut host, 99);
        assert_eq!(mock.world.borrow().batch_sync_sizes, vec![1]);

        let stats = manager.batch_sync_stats();
        assert_eq!(stats.total_entities, 1);
        assert_eq!(stats.batch_enabled_entities, 1);
    }

    #[test]
    fn cleanup_entity_destroys_ghosts_and_restores_control() {
        let mock = seeded_mock();
        let mut host = mock.build_host();
        let portals = facing_portals();

        let mut manager = TeleportManager::new();
        manager.on_intersect_start(&mut host, &portals, ENTITY, 1);
        let ghost_id = mock.world.borrow().created_nodes[0].0;

        manager.cleanup_entity(&mut host, ENTITY);

        assert!(manager.chain_state(ENTITY).is_none());
        assert!(manager.teleport_state(ENTITY).is_none());
        let world = mock.world.borrow();
        assert!(world.destroyed_nodes.contains(&ghost_id));
        assert!(world.engine_control_changes.contains(&(ENTITY, true)));
    }

    #[test]
    fn fully_passed_marks_the_state_finished() {
        let mock = seeded_mock();
        let mut host = mock.build_host();
        let portals = facing_portals();

        let mut manager = TeleportManager::new();
        manager.on_intersect_start(&mut host, &portals, ENTITY, 1);
        manager.on_fully_passed(&mut host, ENTITY, 1, Some(2));

        let state = manager.teleport_state(ENTITY).unwrap();
        assert_eq!(state.crossing_state, CrossingState::Teleported);
        assert!(!state.is_teleporting);
        assert!((state.transition_progress - 1.0).abs() < TOLERANCE);
        assert!(mock
            .world
            .borrow()
            .events
            .contains(&MockEvent::TeleportComplete(ENTITY)));
    }

    #[test]
    fn unknown_portal_is_rejected() {
        let mock = seeded_mock();
        let mut host = mock.build_host();
        let portals = facing_portals();

        let mut manager = TeleportManager::new();
        manager.on_intersect_start(&mut host, &portals, ENTITY, 42);
        assert_eq!(manager.chain_length(ENTITY), 0);

        let mut unlinked = PortalTable::default();
        unlinked.insert(
            3,
            Portal::new(3, PortalPlane::default()),
        );
        manager.on_intersect_start(&mut host, &unlinked, ENTITY, 3);
        assert_eq!(manager.chain_length(ENTITY), 0);
    }

    #[test]
    fn ghost_transform_mirrors_rotation_and_unused_face_pairs() {
        // Entity sitting off-axis exercises the right/up components too.
        let mock = MockHost::new();
        mock.world.borrow_mut().add_entity(
            ENTITY,
            Vec3::new(-4.0, 1.0, 0.5),
            Vec3::new(-1.0, 0.0, 0.0),
        );
        mock.world
            .borrow_mut()
            .transforms
            .insert(ENTITY, Transform::new(Vec3::new(-4.0, 1.0, 0.5), Quat::from_rotation_y(0.3)));
        let mut host = mock.build_host();
        let portals = facing_portals();

        let mut manager = TeleportManager::new();
        manager.on_intersect_start(&mut host, &portals, ENTITY, 1);

        let chain = manager.chain_state(ENTITY).unwrap();
        let ghost = &chain.chain[1];
        // right (z=0.5) maps through opposing right axes to -0.5.
        assert!((ghost.transform.position - Vec3::new(4.0, 1.0, -0.5)).length() < TOLERANCE);
        assert!((ghost.transform.rotation.length() - 1.0).abs() < 1e-3);
    }
}
