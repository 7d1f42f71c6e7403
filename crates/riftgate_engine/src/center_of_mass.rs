use glam::Vec3;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use riftgate_shared::types::{
    CenterOfMassConfig, CenterOfMassResult, CenterOfMassType, EntityId, Transform, WeightedPoint,
};

/// Host-side data the center-of-mass policies may need. Every query is
/// optional: a missing answer falls back toward the geometric center.
pub trait CenterOfMassProvider {
    /// Local-space transform of a named bone, if the entity has one.
    fn get_bone_transform(&self, entity_id: EntityId, bone_name: &str) -> Option<Transform>;
    fn has_mesh_changed(&self, entity_id: EntityId) -> bool;
    /// Local-space mass sample points, empty when unknown.
    fn get_mass_distribution(&self, entity_id: EntityId) -> Vec<WeightedPoint>;
    /// Milliseconds, host clock. Stamped onto cached results.
    fn current_timestamp(&self) -> u64;
}

/// Resolves each entity's center of mass under its configured policy.
///
/// Results are cached per entity; the cache drops when the config changes or
/// the host reports a mesh change for auto-updating entities. Any policy
/// that cannot be evaluated resolves to the geometric center — the result is
/// still marked valid so crossing detection never stalls on a bad rig.
pub struct CenterOfMassManager {
    configs: FxHashMap<EntityId, CenterOfMassConfig>,
    cache: FxHashMap<EntityId, CenterOfMassResult>,
    auto_update_timers: FxHashMap<EntityId, f32>,
    provider: Option<Box<dyn CenterOfMassProvider>>,
    fallback_clock: u64,
}

impl Default for CenterOfMassManager {
    fn default() -> Self {
        Self::new(None)
    }
}

impl CenterOfMassManager {
    pub fn new(provider: Option<Box<dyn CenterOfMassProvider>>) -> Self {
        Self {
            configs: FxHashMap::default(),
            cache: FxHashMap::default(),
            auto_update_timers: FxHashMap::default(),
            provider,
            fallback_clock: 0,
        }
    }

    pub fn set_provider(&mut self, provider: Box<dyn CenterOfMassProvider>) {
        self.provider = Some(provider);
    }

    pub fn set_entity_config(&mut self, entity_id: EntityId, config: CenterOfMassConfig) {
        self.configs.insert(entity_id, config);
        self.cache.remove(&entity_id);
    }

    pub fn entity_config(&self, entity_id: EntityId) -> Option<&CenterOfMassConfig> {
        self.configs.get(&entity_id)
    }

    pub fn remove_entity(&mut self, entity_id: EntityId) {
        self.configs.remove(&entity_id);
        self.cache.remove(&entity_id);
        self.auto_update_timers.remove(&entity_id);
    }

    pub fn cached_result(&self, entity_id: EntityId) -> Option<&CenterOfMassResult> {
        self.cache.get(&entity_id)
    }

    pub fn force_recalculate(&mut self, entity_id: EntityId) {
        self.cache.remove(&entity_id);
        debug!(entity_id, "center of mass cache dropped, will recalculate");
    }

    /// World-space center of mass for the entity at `entity_transform`.
    pub fn world_center_of_mass(&mut self, entity_id: EntityId, entity_transform: &Transform) -> Vec3 {
        let Some(config) = self.configs.get(&entity_id).cloned() else {
            return entity_transform.transform_point(Vec3::ZERO);
        };

        let cached_is_fresh = self.cache.contains_key(&entity_id)
            && (!config.auto_update_on_mesh_change
                || self
                    .provider
                    .as_ref()
                    .is_some_and(|p| !p.has_mesh_changed(entity_id)));

        if cached_is_fresh {
            let cached = self.cache[&entity_id];
            return entity_transform.transform_point(cached.local_position);
        }

        let result = self.calculate(entity_id, &config, entity_transform);
        self.cache.insert(entity_id, result);
        result.world_position
    }

    /// Local-space center of mass under the entity's config.
    pub fn local_center_of_mass(&mut self, entity_id: EntityId) -> Vec3 {
        let Some(config) = self.configs.get(&entity_id).cloned() else {
            return Vec3::ZERO;
        };
        self.calculate(entity_id, &config, &Transform::default())
            .local_position
    }

    /// Drops stale caches for entities that auto-refresh on mesh changes.
    /// Each entity checks at its own configured frequency.
    pub fn update_auto_update_entities(&mut self, delta_time: f32) {
        let mut stale = Vec::new();

        for (entity_id, config) in &self.configs {
            if !config.auto_update_on_mesh_change {
                continue;
            }
            let timer = self.auto_update_timers.entry(*entity_id).or_insert(0.0);
            *timer += delta_time;
            if *timer < config.update_frequency.max(f32::EPSILON) {
                continue;
            }
            *timer = 0.0;

            if self.provider.as_ref().is_some_and(|p| p.has_mesh_changed(*entity_id)) {
                stale.push(*entity_id);
            }
        }

        for entity_id in stale {
            self.cache.remove(&entity_id);
            debug!(entity_id, "mesh changed, center of mass will recalculate");
        }
    }

    fn calculate(
        &mut self,
        entity_id: EntityId,
        config: &CenterOfMassConfig,
        entity_transform: &Transform,
    ) -> CenterOfMassResult {
        let local_position = match config.kind {
            CenterOfMassType::GeometricCenter => Vec3::ZERO,
            CenterOfMassType::CustomPoint => config.custom_point,
            CenterOfMassType::BoneAttachment => self.resolve_bone(entity_id, config),
            CenterOfMassType::WeightedAverage => {
                if config.weighted_points.is_empty() {
                    warn!(entity_id, "weighted-average center of mass with no points, using geometric center");
                    Vec3::ZERO
                } else {
                    weighted_average(&config.weighted_points)
                }
            }
            CenterOfMassType::PhysicsCenter => self.resolve_mass_distribution(entity_id, &[]),
            CenterOfMassType::DynamicCalculated => {
                self.resolve_mass_distribution(entity_id, &config.weighted_points)
            }
        };

        CenterOfMassResult {
            local_position,
            world_position: entity_transform.transform_point(local_position),
            is_valid: true,
            calculation_time: self.timestamp(),
        }
    }

    fn resolve_bone(&self, entity_id: EntityId, config: &CenterOfMassConfig) -> Vec3 {
        let Some(attachment) = config.bone_attachment.as_ref() else {
            warn!(entity_id, "bone-attachment center of mass with no bone configured, using geometric center");
            return Vec3::ZERO;
        };

        match self
            .provider
            .as_ref()
            .and_then(|p| p.get_bone_transform(entity_id, &attachment.bone_name))
        {
            Some(bone_transform) => bone_transform.transform_point(attachment.offset),
            None => {
                warn!(
                    entity_id,
                    bone = %attachment.bone_name,
                    "bone not found, falling back to geometric center"
                );
                Vec3::ZERO
            }
        }
    }

    /// Mass distribution from the host, then configured weighted points,
    /// then the geometric center.
    fn resolve_mass_distribution(&self, entity_id: EntityId, configured: &[WeightedPoint]) -> Vec3 {
        let mass_points = self
            .provider
            .as_ref()
            .map(|p| p.get_mass_distribution(entity_id))
            .unwrap_or_default();

        if !mass_points.is_empty() {
            weighted_average(&mass_points)
        } else if !configured.is_empty() {
            weighted_average(configured)
        } else {
            Vec3::ZERO
        }
    }

    fn timestamp(&mut self) -> u64 {
        match self.provider.as_ref() {
            Some(provider) => provider.current_timestamp(),
            None => {
                self.fallback_clock += 1;
                self.fallback_clock
            }
        }
    }
}

fn weighted_average(points: &[WeightedPoint]) -> Vec3 {
    let mut weighted_sum = Vec3::ZERO;
    let mut total_weight = 0.0;
    for point in points {
        weighted_sum += point.position * point.weight;
        total_weight += point.weight;
    }

    if total_weight > 1e-4 {
        weighted_sum / total_weight
    } else {
        points.first().map(|p| p.position).unwrap_or(Vec3::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Quat;
    use std::cell::Cell;
    use std::rc::Rc;

    struct StubProvider {
        bone: Option<Transform>,
        mass_points: Vec<WeightedPoint>,
        mesh_changed: Rc<Cell<bool>>,
    }

    impl CenterOfMassProvider for StubProvider {
        fn get_bone_transform(&self, _entity_id: EntityId, _bone_name: &str) -> Option<Transform> {
            self.bone
        }

        fn has_mesh_changed(&self, _entity_id: EntityId) -> bool {
            self.mesh_changed.get()
        }

        fn get_mass_distribution(&self, _entity_id: EntityId) -> Vec<WeightedPoint> {
            self.mass_points.clone()
        }

        fn current_timestamp(&self) -> u64 {
            42
        }
    }

    #[test]
    fn custom_point_transforms_into_world_space() {
        let mut manager = CenterOfMassManager::default();
        manager.set_entity_config(1, CenterOfMassConfig::custom_point(Vec3::new(0.0, 1.0, 0.0)));

        let transform = Transform::new(Vec3::new(5.0, 0.0, 0.0), Quat::IDENTITY);
        let world = manager.world_center_of_mass(1, &transform);
        assert_eq!(world, Vec3::new(5.0, 1.0, 0.0));
    }

    #[test]
    fn missing_bone_falls_back_to_geometric_center() {
        let mut manager = CenterOfMassManager::new(Some(Box::new(StubProvider {
            bone: None,
            mass_points: Vec::new(),
            mesh_changed: Rc::new(Cell::new(false)),
        })));
        manager.set_entity_config(1, CenterOfMassConfig::bone_attachment("hip", Vec3::ONE));

        let world = manager.world_center_of_mass(1, &Transform::default());
        assert_eq!(world, Vec3::ZERO);
        assert!(manager.cached_result(1).unwrap().is_valid);
    }

    #[test]
    fn empty_weighted_list_returns_geometric_center() {
        let mut manager = CenterOfMassManager::default();
        manager.set_entity_config(1, CenterOfMassConfig::weighted_points(Vec::new()));
        assert_eq!(manager.local_center_of_mass(1), Vec3::ZERO);
    }

    #[test]
    fn zero_total_weight_returns_first_point() {
        let mut manager = CenterOfMassManager::default();
        manager.set_entity_config(
            1,
            CenterOfMassConfig::weighted_points(vec![
                WeightedPoint {
                    position: Vec3::new(2.0, 0.0, 0.0),
                    weight: 0.0,
                },
                WeightedPoint {
                    position: Vec3::new(4.0, 0.0, 0.0),
                    weight: 0.0,
                },
            ]),
        );
        assert_eq!(manager.local_center_of_mass(1), Vec3::new(2.0, 0.0, 0.0));
    }

    #[test]
    fn cache_survives_until_mesh_change() {
        let mesh_changed = Rc::new(Cell::new(false));
        let mut manager = CenterOfMassManager::new(Some(Box::new(StubProvider {
            bone: None,
            mass_points: vec![WeightedPoint {
                position: Vec3::new(1.0, 0.0, 0.0),
                weight: 1.0,
            }],
            mesh_changed: mesh_changed.clone(),
        })));

        let mut config = CenterOfMassConfig::physics_center(true);
        config.update_frequency = 0.0;
        manager.set_entity_config(1, config);

        let transform = Transform::default();
        manager.world_center_of_mass(1, &transform);
        let first_time = manager.cached_result(1).unwrap().calculation_time;
        assert_eq!(first_time, 42);

        manager.update_auto_update_entities(0.2);
        assert!(manager.cached_result(1).is_some());

        mesh_changed.set(true);
        manager.update_auto_update_entities(0.2);
        assert!(manager.cached_result(1).is_none());
    }
}
