//! Multi-segment clip management for entity chains.
//!
//! A chain of L segments renders as L slices of the same logical body. The
//! manager derives L-1 mid-planes between consecutive segments and hands each
//! segment the pair of planes bounding its slice, plus alpha, stencil and
//! LOD data. Side effects go through the `PhysicsManipulator` passed into
//! each call; the manager itself never touches the renderer.

use std::time::Instant;

use glam::Vec3;
use rustc_hash::FxHashMap;
use tracing::debug;

use riftgate_shared::chain::EntityChainState;
use riftgate_shared::types::{ClippingPlane, EntityId};

use crate::interfaces::PhysicsManipulator;

const PARALLEL_TOLERANCE: f32 = 0.95;
/// Planes closer than this (1 cm) with matching normals are duplicates.
const DUPLICATE_DISTANCE_THRESHOLD: f32 = 0.01;
const GHOST_ALPHA_FLOOR: f32 = 0.3;
const GHOST_ALPHA_FALLOFF: f32 = 0.2;
const LOD_ALPHA_FLOOR: f32 = 0.1;
const LOD_DISTANCE_FALLOFF: f32 = 0.01;

/// Clip assignment for one chain segment.
#[derive(Debug, Clone)]
pub struct SegmentClippingDescriptor {
    pub entity_id: EntityId,
    /// One plane for the chain ends, two for interior segments. Each plane
    /// keeps its segment in the positive half-space.
    pub clipping_planes: Vec<ClippingPlane>,
    pub plane_enabled: Vec<bool>,
    /// Distance-from-main falloff, before LOD.
    pub alpha: f32,
    /// `alpha` scaled by camera distance.
    pub lod_alpha: f32,
    /// Unique per segment within a chain, 1-based.
    pub stencil_ref: u32,
    pub visible: bool,
    pub use_advanced_stencil: bool,
}

#[derive(Debug, Clone)]
struct ChainClippingConfig {
    main_position: usize,
    node_positions: Vec<Vec3>,
    descriptors: Vec<SegmentClippingDescriptor>,
    enable_smooth_transitions: bool,
    transition_blend_distance: f32,
    max_visible_segments: usize,
    min_segment_visibility_threshold: f32,
}

impl Default for ChainClippingConfig {
    fn default() -> Self {
        Self {
            main_position: 0,
            node_positions: Vec::new(),
            descriptors: Vec::new(),
            enable_smooth_transitions: true,
            transition_blend_distance: 0.5,
            max_visible_segments: 6,
            min_segment_visibility_threshold: 0.05,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ClippingStats {
    pub active_entity_count: usize,
    pub total_clipping_planes: usize,
    pub total_visible_segments: usize,
    pub average_segments_per_entity: f32,
    pub frame_setup_time_ms: f32,
}

pub struct MultiSegmentClippingManager {
    active_configs: FxHashMap<EntityId, ChainClippingConfig>,
    config_versions: FxHashMap<EntityId, u32>,
    /// Template for chains seen for the first time.
    defaults: ChainClippingConfig,
    debug_mode: bool,
    last_setup_time_ms: f32,
}

impl Default for MultiSegmentClippingManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MultiSegmentClippingManager {
    pub fn new() -> Self {
        Self {
            active_configs: FxHashMap::default(),
            config_versions: FxHashMap::default(),
            defaults: ChainClippingConfig::default(),
            debug_mode: false,
            last_setup_time_ms: 0.0,
        }
    }

    pub fn set_default_visibility_threshold(&mut self, threshold: f32) {
        self.defaults.min_segment_visibility_threshold = threshold.clamp(0.0, 1.0);
    }

    pub fn set_default_blend_distance(&mut self, blend_distance: f32) {
        self.defaults.transition_blend_distance = blend_distance.max(0.0);
    }

    /// Rebuilds and applies the clip set for a chain. Single-node chains
    /// clear any leftover clipping instead.
    pub fn setup_chain_clipping(
        &mut self,
        chain: &EntityChainState,
        camera_position: Vec3,
        physics: &mut dyn PhysicsManipulator,
    ) -> bool {
        let started = Instant::now();

        if chain.chain.is_empty() {
            return false;
        }
        if chain.chain.len() == 1 {
            self.cleanup_entity_clipping(chain.original_entity_id, physics);
            return true;
        }

        let previous = self
            .active_configs
            .remove(&chain.original_entity_id)
            .unwrap_or_else(|| self.defaults.clone());

        let mut config = ChainClippingConfig {
            main_position: chain.main_position,
            node_positions: chain.chain.iter().map(|n| n.transform.position).collect(),
            descriptors: Vec::with_capacity(chain.chain.len()),
            ..previous
        };

        let mut planes = inter_node_clipping_planes(chain);
        deduplicate_planes(&mut planes);

        for (index, node) in chain.chain.iter().enumerate() {
            let mut clipping_planes = Vec::with_capacity(2);

            if index > 0 {
                if let Some(front) = planes.get(index - 1) {
                    clipping_planes.push(*front);
                }
            }
            if let Some(back) = planes.get(index) {
                if index < chain.chain.len() - 1 {
                    clipping_planes.push(back.flipped());
                }
            }

            let distance_from_main = index.abs_diff(chain.main_position);
            let alpha = if distance_from_main == 0 {
                1.0
            } else {
                (1.0 - GHOST_ALPHA_FALLOFF * distance_from_main as f32).max(GHOST_ALPHA_FLOOR)
            };

            let plane_enabled = vec![true; clipping_planes.len()];
            config.descriptors.push(SegmentClippingDescriptor {
                entity_id: node.entity_id,
                clipping_planes,
                plane_enabled,
                alpha,
                lod_alpha: alpha,
                stencil_ref: index as u32 + 1,
                visible: true,
                use_advanced_stencil: true,
            });
        }

        apply_lod(&mut config, camera_position);

        for descriptor in &config.descriptors {
            if descriptor.visible {
                physics.set_entities_clipping_states(
                    &[descriptor.entity_id],
                    &descriptor.clipping_planes,
                    &descriptor.plane_enabled,
                );
            } else {
                physics.disable_entity_clipping(descriptor.entity_id);
            }
        }

        if self.debug_mode {
            debug!(
                entity = chain.original_entity_id,
                segments = config.descriptors.len(),
                planes = planes.len(),
                "chain clipping rebuilt"
            );
        }

        self.config_versions
            .insert(chain.original_entity_id, chain.chain_version);
        self.active_configs.insert(chain.original_entity_id, config);
        self.last_setup_time_ms = started.elapsed().as_secs_f32() * 1000.0;
        true
    }

    /// Re-applies clipping only when the chain actually changed shape since
    /// the last setup.
    pub fn update_chain_clipping(
        &mut self,
        chain: &EntityChainState,
        camera_position: Vec3,
        physics: &mut dyn PhysicsManipulator,
    ) -> bool {
        if !self.active_configs.contains_key(&chain.original_entity_id) {
            return false;
        }
        if self.config_versions.get(&chain.original_entity_id) == Some(&chain.chain_version) {
            return true;
        }
        self.setup_chain_clipping(chain, camera_position, physics)
    }

    pub fn cleanup_entity_clipping(
        &mut self,
        original_entity_id: EntityId,
        physics: &mut dyn PhysicsManipulator,
    ) {
        let Some(config) = self.active_configs.remove(&original_entity_id) else {
            return;
        };
        self.config_versions.remove(&original_entity_id);

        for descriptor in &config.descriptors {
            physics.disable_entity_clipping(descriptor.entity_id);
        }
    }

    /// Re-applies every stored clip set, e.g. after the host recreated its
    /// render resources.
    pub fn refresh_all(&mut self, physics: &mut dyn PhysicsManipulator) {
        for config in self.active_configs.values() {
            for descriptor in &config.descriptors {
                if descriptor.visible {
                    physics.set_entities_clipping_states(
                        &[descriptor.entity_id],
                        &descriptor.clipping_planes,
                        &descriptor.plane_enabled,
                    );
                }
            }
        }
    }

    pub fn entity_descriptors(&self, original_entity_id: EntityId) -> Option<&[SegmentClippingDescriptor]> {
        self.active_configs
            .get(&original_entity_id)
            .map(|config| config.descriptors.as_slice())
    }

    pub fn requires_multi_segment_clipping(&self, original_entity_id: EntityId) -> bool {
        self.active_configs
            .get(&original_entity_id)
            .is_some_and(|config| config.descriptors.len() > 1)
    }

    /// Segments that survive the LOD alpha threshold at this camera
    /// position, capped by the configured maximum.
    pub fn visible_segment_count(&self, original_entity_id: EntityId, camera_position: Vec3) -> usize {
        let Some(config) = self.active_configs.get(&original_entity_id) else {
            return 0;
        };

        let visible = config
            .descriptors
            .iter()
            .zip(&config.node_positions)
            .filter(|(descriptor, position)| {
                descriptor.alpha * lod_factor(**position, camera_position)
                    >= config.min_segment_visibility_threshold
            })
            .count();

        visible.min(config.max_visible_segments)
    }

    /// 0 = cheapest, 3 = full stencil pipeline with smooth transitions.
    pub fn set_entity_quality(&mut self, original_entity_id: EntityId, quality_level: u8) {
        let Some(config) = self.active_configs.get_mut(&original_entity_id) else {
            return;
        };

        let (smooth, max_segments) = match quality_level {
            0 => (false, 2),
            1 => (false, 4),
            2 => (true, 6),
            _ => (true, 8),
        };
        config.enable_smooth_transitions = smooth;
        config.max_visible_segments = max_segments;
    }

    pub fn set_smooth_transitions(
        &mut self,
        original_entity_id: EntityId,
        enable: bool,
        blend_distance: f32,
    ) {
        if let Some(config) = self.active_configs.get_mut(&original_entity_id) {
            config.enable_smooth_transitions = enable;
            config.transition_blend_distance = blend_distance;
        }
    }

    pub fn set_debug_mode(&mut self, enable: bool) {
        self.debug_mode = enable;
    }

    pub fn stats(&self) -> ClippingStats {
        let mut stats = ClippingStats {
            active_entity_count: self.active_configs.len(),
            frame_setup_time_ms: self.last_setup_time_ms,
            ..ClippingStats::default()
        };

        for config in self.active_configs.values() {
            for descriptor in &config.descriptors {
                stats.total_clipping_planes += descriptor.clipping_planes.len();
                if descriptor.visible {
                    stats.total_visible_segments += 1;
                }
            }
        }

        if stats.active_entity_count > 0 {
            stats.average_segments_per_entity =
                stats.total_visible_segments as f32 / stats.active_entity_count as f32;
        }

        stats
    }
}

/// The L-1 planes between consecutive chain segments: each passes through
/// the midpoint of the pair with its normal along the segment direction.
fn inter_node_clipping_planes(chain: &EntityChainState) -> Vec<ClippingPlane> {
    let mut planes = Vec::new();
    for window in chain.chain.windows(2) {
        let current = window[0].transform.position;
        let next = window[1].transform.position;
        let midpoint = (current + next) * 0.5;
        let mut direction = (next - current).normalize_or_zero();
        if direction == Vec3::ZERO {
            direction = Vec3::X;
        }
        planes.push(ClippingPlane::from_point_and_normal(midpoint, direction));
    }
    planes
}

/// Removes only true duplicates: near-parallel normals AND offsets within a
/// centimeter. Merely parallel planes separate distinct segments and must
/// survive.
fn deduplicate_planes(planes: &mut Vec<ClippingPlane>) {
    let mut kept: Vec<ClippingPlane> = Vec::with_capacity(planes.len());
    for plane in planes.iter() {
        let duplicate = kept.iter().any(|existing| {
            existing.normal.dot(plane.normal).abs() >= PARALLEL_TOLERANCE
                && (existing.distance.abs() - plane.distance.abs()).abs()
                    < DUPLICATE_DISTANCE_THRESHOLD
        });
        if !duplicate {
            kept.push(*plane);
        }
    }
    *planes = kept;
}

fn lod_factor(position: Vec3, camera_position: Vec3) -> f32 {
    let distance = (position - camera_position).length();
    (1.0 - distance * LOD_DISTANCE_FALLOFF).max(LOD_ALPHA_FLOOR)
}

fn apply_lod(config: &mut ChainClippingConfig, camera_position: Vec3) {
    let threshold = config.min_segment_visibility_threshold;
    for (descriptor, position) in config.descriptors.iter_mut().zip(&config.node_positions) {
        descriptor.lod_alpha = descriptor.alpha * lod_factor(*position, camera_position);
        descriptor.visible = descriptor.lod_alpha >= threshold;
    }
}

/// True when `point` is in the kept half-space of every enabled plane.
pub fn is_point_visible(point: Vec3, clipping_planes: &[ClippingPlane]) -> bool {
    clipping_planes
        .iter()
        .filter(|plane| plane.enabled)
        .all(|plane| plane.signed_distance(point) >= 0.0)
}

/// Fraction of the AABB's corners that survive the clip set.
pub fn visibility_ratio(bounds_min: Vec3, bounds_max: Vec3, clipping_planes: &[ClippingPlane]) -> f32 {
    if clipping_planes.is_empty() {
        return 1.0;
    }
    let corners = riftgate_shared::math::aabb_corners(bounds_min, bounds_max);
    let visible = corners
        .iter()
        .filter(|corner| is_point_visible(**corner, clipping_planes))
        .count();
    visible as f32 / corners.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockHost;
    use riftgate_shared::chain::{EntityChainNode, EntityChainState};
    use riftgate_shared::types::{EntityKind, Transform};
    use glam::Quat;

    fn collinear_chain() -> EntityChainState {
        let mut chain = EntityChainState::new(1);
        for (index, x) in [0.0, 10.0, 20.0].into_iter().enumerate() {
            let mut node = EntityChainNode::new(
                if index == 0 { 1 } else { 100 + index as u64 },
                if index == 0 { EntityKind::Main } else { EntityKind::Ghost },
            );
            node.chain_position = index;
            node.transform = Transform::new(Vec3::new(x, 0.0, 0.0), Quat::IDENTITY);
            chain.chain.push(node);
        }
        chain.main_position = 0;
        chain.chain_version = 1;
        chain
    }

    #[test]
    fn three_segment_chain_gets_two_mid_planes() {
        let chain = collinear_chain();
        let planes = inter_node_clipping_planes(&chain);

        assert_eq!(planes.len(), 2);
        assert!((planes[0].normal - Vec3::X).length() < 1e-4);
        assert!((planes[0].distance - 5.0).abs() < 1e-4);
        assert!((planes[1].normal - Vec3::X).length() < 1e-4);
        assert!((planes[1].distance - 15.0).abs() < 1e-4);
    }

    #[test]
    fn descriptors_pair_planes_and_fade_alpha() {
        let host = MockHost::new();
        let chain = collinear_chain();

        let mut manager = MultiSegmentClippingManager::new();
        // Camera on the main node keeps its LOD factor at 1.
        assert!(manager.setup_chain_clipping(&chain, Vec3::ZERO, &mut host.physics()));

        let descriptors = manager.entity_descriptors(1).unwrap();
        assert_eq!(descriptors.len(), 3);

        assert_eq!(descriptors[0].clipping_planes.len(), 1);
        assert_eq!(descriptors[1].clipping_planes.len(), 2);
        assert_eq!(descriptors[2].clipping_planes.len(), 1);

        assert!((descriptors[0].alpha - 1.0).abs() < 1e-4);
        assert!((descriptors[1].alpha - 0.8).abs() < 1e-4);
        assert!((descriptors[2].alpha - 0.6).abs() < 1e-4);

        // Every segment keeps its own node in the positive half-space.
        for (descriptor, node) in descriptors.iter().zip(&chain.chain) {
            for plane in &descriptor.clipping_planes {
                assert!(plane.signed_distance(node.transform.position) > 0.0);
            }
        }

        let stencil_refs: Vec<u32> = descriptors.iter().map(|d| d.stencil_ref).collect();
        assert_eq!(stencil_refs, vec![1, 2, 3]);
    }

    #[test]
    fn parallel_but_distant_planes_survive_dedup() {
        let mut planes = vec![
            ClippingPlane::from_point_and_normal(Vec3::new(5.0, 0.0, 0.0), Vec3::X),
            ClippingPlane::from_point_and_normal(Vec3::new(15.0, 0.0, 0.0), Vec3::X),
        ];
        deduplicate_planes(&mut planes);
        assert_eq!(planes.len(), 2);

        let mut duplicates = vec![
            ClippingPlane::from_point_and_normal(Vec3::new(5.0, 0.0, 0.0), Vec3::X),
            ClippingPlane::from_point_and_normal(Vec3::new(5.005, 0.0, 0.0), Vec3::X),
        ];
        deduplicate_planes(&mut duplicates);
        assert_eq!(duplicates.len(), 1);
    }

    #[test]
    fn distant_segments_are_culled_by_lod() {
        let host = MockHost::new();
        let mut chain = collinear_chain();
        // Fourth segment, three hops from the main and far from the camera:
        // 0.4 alpha * 0.1 LOD floor drops below the visibility threshold.
        let mut tail = EntityChainNode::new(103, EntityKind::Ghost);
        tail.chain_position = 3;
        tail.transform = Transform::new(Vec3::new(500.0, 0.0, 0.0), Quat::IDENTITY);
        chain.chain.push(tail);

        let mut manager = MultiSegmentClippingManager::new();
        manager.setup_chain_clipping(&chain, Vec3::ZERO, &mut host.physics());

        let descriptors = manager.entity_descriptors(1).unwrap();
        assert!(descriptors[0].visible);
        assert!(!descriptors[3].visible);
        assert_eq!(manager.visible_segment_count(1, Vec3::ZERO), 3);
        assert!(host.world.borrow().clipping_disabled.contains(&103));
    }

    #[test]
    fn version_gate_skips_unchanged_chains() {
        let host = MockHost::new();
        let chain = collinear_chain();

        let mut manager = MultiSegmentClippingManager::new();
        manager.setup_chain_clipping(&chain, Vec3::ZERO, &mut host.physics());
        let calls_after_setup = host.world.borrow().clipping_calls.len();

        assert!(manager.update_chain_clipping(&chain, Vec3::ZERO, &mut host.physics()));
        assert_eq!(host.world.borrow().clipping_calls.len(), calls_after_setup);

        let mut changed = chain.clone();
        changed.chain_version += 1;
        assert!(manager.update_chain_clipping(&changed, Vec3::ZERO, &mut host.physics()));
        assert!(host.world.borrow().clipping_calls.len() > calls_after_setup);
    }

    #[test]
    fn cleanup_disables_clipping_for_every_segment() {
        let host = MockHost::new();
        let chain = collinear_chain();

        let mut manager = MultiSegmentClippingManager::new();
        manager.setup_chain_clipping(&chain, Vec3::ZERO, &mut host.physics());
        manager.cleanup_entity_clipping(1, &mut host.physics());

        assert!(!manager.requires_multi_segment_clipping(1));
        let world = host.world.borrow();
        assert!(world.clipping_disabled.contains(&1));
        assert!(world.clipping_disabled.contains(&101));
        assert!(world.clipping_disabled.contains(&102));
    }

    #[test]
    fn point_visibility_respects_half_spaces() {
        let planes = vec![ClippingPlane::from_point_and_normal(Vec3::ZERO, Vec3::X)];
        assert!(is_point_visible(Vec3::new(1.0, 0.0, 0.0), &planes));
        assert!(!is_point_visible(Vec3::new(-1.0, 0.0, 0.0), &planes));

        let ratio = visibility_ratio(Vec3::splat(-1.0), Vec3::splat(1.0), &planes);
        assert!((ratio - 0.5).abs() < 1e-4);
    }
}
