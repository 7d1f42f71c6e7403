use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

/// Portal identifier, allocated by the engine (monotonic, never reused).
pub type PortalId = u32;

/// Entity identifier, assigned by the host application.
pub type EntityId = u64;

/// Logical entity identifier, allocated by the engine (monotonic).
pub type LogicalEntityId = u64;

/// The two oriented sides of a portal plane.
///
/// Face A is the side the plane normal points toward; face B is the opposite
/// side. A body entering one face of a portal emerges at the paired face of
/// the linked portal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortalFace {
    A,
    B,
}

impl PortalFace {
    pub fn opposite(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

/// Role of an entity within the teleport system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    /// The node carrying the body's center of mass.
    Main,
    /// A host-created clone on the far side of a portal boundary.
    Ghost,
    /// Transitional role used while control migrates.
    Hybrid,
    /// The unified control layer over a whole chain.
    Logical,
}

/// How the states of a chain's members are merged into one unified state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeStrategy {
    MainPriority,
    GhostPriority,
    /// If any member is blocked, the whole logical entity stops.
    MostRestrictive,
    WeightedAverage,
    /// Sum forces and torques (with lever arms) across all members.
    ForceSummation,
    /// Force summation fed through a host-side simulation proxy.
    PhysicsSimulation,
    CustomLogic,
}

/// Position, orientation and scale of an entity in world space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
        }
    }
}

impl Transform {
    pub fn new(position: Vec3, rotation: Quat) -> Self {
        Self {
            position,
            rotation,
            scale: Vec3::ONE,
        }
    }

    pub fn transform_point(&self, point: Vec3) -> Vec3 {
        self.position + self.rotation * (point * self.scale)
    }

    pub fn inverse_transform_point(&self, point: Vec3) -> Vec3 {
        let unrotated = self.rotation.inverse() * (point - self.position);
        Vec3::new(
            if self.scale.x.abs() > f32::EPSILON { unrotated.x / self.scale.x } else { unrotated.x },
            if self.scale.y.abs() > f32::EPSILON { unrotated.y / self.scale.y } else { unrotated.y },
            if self.scale.z.abs() > f32::EPSILON { unrotated.z / self.scale.z } else { unrotated.z },
        )
    }
}

/// Rigid body state as reported by (and pushed back to) the host physics
/// engine. Scalar material properties ride along unchanged through portals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhysicsState {
    pub linear_velocity: Vec3,
    pub angular_velocity: Vec3,
    pub mass: f32,
    pub applied_force: Vec3,
    pub applied_torque: Vec3,
    pub center_of_mass_local: Vec3,
    /// Ixx, Iyy, Izz of the diagonalized inertia tensor.
    pub inertia_tensor_diagonal: Vec3,
    pub friction: f32,
    pub restitution: f32,
    pub linear_damping: f32,
    pub angular_damping: f32,
}

impl Default for PhysicsState {
    fn default() -> Self {
        Self {
            linear_velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            mass: 1.0,
            applied_force: Vec3::ZERO,
            applied_torque: Vec3::ZERO,
            center_of_mass_local: Vec3::ZERO,
            inertia_tensor_diagonal: Vec3::ONE,
            friction: 0.5,
            restitution: 0.3,
            linear_damping: 0.01,
            angular_damping: 0.01,
        }
    }
}

/// Oriented rectangle defining one side of a portal pair.
///
/// Invariant: `right`, `up` and `normal` are unit length and mutually
/// perpendicular. The normal points toward face A; face B looks the other
/// way.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PortalPlane {
    pub center: Vec3,
    pub normal: Vec3,
    pub up: Vec3,
    pub right: Vec3,
    pub width: f32,
    pub height: f32,
    pub active_face: PortalFace,
}

impl Default for PortalPlane {
    fn default() -> Self {
        Self {
            center: Vec3::ZERO,
            normal: Vec3::Z,
            up: Vec3::Y,
            right: Vec3::X,
            width: 2.0,
            height: 3.0,
            active_face: PortalFace::A,
        }
    }
}

impl PortalPlane {
    pub fn face_normal(&self, face: PortalFace) -> Vec3 {
        match face {
            PortalFace::A => self.normal,
            PortalFace::B => -self.normal,
        }
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }
}

/// Plane used to slice rendered geometry; the positive half-space is kept.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ClippingPlane {
    pub normal: Vec3,
    pub distance: f32,
    pub enabled: bool,
}

impl ClippingPlane {
    pub fn from_point_and_normal(point: Vec3, normal: Vec3) -> Self {
        let normal = normal.normalize_or_zero();
        Self {
            normal,
            distance: normal.dot(point),
            enabled: true,
        }
    }

    /// Positive when `point` is on the kept side.
    pub fn signed_distance(&self, point: Vec3) -> f32 {
        self.normal.dot(point) - self.distance
    }

    /// Same plane with the kept half-space inverted.
    pub fn flipped(&self) -> Self {
        Self {
            normal: -self.normal,
            distance: -self.distance,
            enabled: self.enabled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraParams {
    pub position: Vec3,
    pub rotation: Quat,
    /// Vertical field of view in degrees.
    pub fov: f32,
    pub near_plane: f32,
    pub far_plane: f32,
    pub aspect_ratio: f32,
}

impl Default for CameraParams {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            fov: 75.0,
            near_plane: 0.1,
            far_plane: 1000.0,
            aspect_ratio: 16.0 / 9.0,
        }
    }
}

/// One recursive view the renderer must draw for a visible portal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderPassDescriptor {
    pub virtual_camera: CameraParams,
    /// Clip at the destination face so geometry behind it never leaks in.
    pub clipping_plane: ClippingPlane,
    pub should_clip: bool,
    pub use_stencil_buffer: bool,
    pub stencil_ref_value: u32,
    pub source_portal_id: PortalId,
    pub recursion_depth: u32,
}

/// Where the eight AABB corners of an entity fall relative to a portal plane.
///
/// A corner lying on the plane (within epsilon) is counted on both sides, so
/// `front_count + back_count >= total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BoundsAnalysis {
    pub front_count: u32,
    pub back_count: u32,
    pub total: u32,
}

impl BoundsAnalysis {
    pub fn crossing_ratio(&self) -> f32 {
        if self.total == 0 {
            0.0
        } else {
            self.back_count as f32 / self.total as f32
        }
    }
}

/// Debounced crossing state of an entity against one portal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrossingState {
    NotTouching,
    Crossing,
    Teleported,
}

/// Full description of a host entity, used when cloning ghosts.
#[derive(Debug, Clone)]
pub struct EntityDescription {
    pub entity_id: EntityId,
    pub kind: EntityKind,
    pub transform: Transform,
    pub physics: PhysicsState,
    /// Center of mass relative to the entity origin.
    pub center_of_mass: Vec3,
    pub bounds_min: Vec3,
    pub bounds_max: Vec3,
    pub counterpart_id: Option<EntityId>,
    pub associated_portal: Option<PortalId>,
    pub is_fully_functional: bool,
}

impl Default for EntityDescription {
    fn default() -> Self {
        Self {
            entity_id: 0,
            kind: EntityKind::Main,
            transform: Transform::default(),
            physics: PhysicsState::default(),
            center_of_mass: Vec3::ZERO,
            bounds_min: Vec3::splat(-0.5),
            bounds_max: Vec3::splat(0.5),
            counterpart_id: None,
            associated_portal: None,
            is_fully_functional: true,
        }
    }
}

/// How an entity's center of mass is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CenterOfMassType {
    GeometricCenter,
    PhysicsCenter,
    CustomPoint,
    BoneAttachment,
    WeightedAverage,
    DynamicCalculated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoneAttachment {
    pub bone_name: String,
    pub offset: Vec3,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightedPoint {
    /// Local-space position.
    pub position: Vec3,
    pub weight: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CenterOfMassConfig {
    pub kind: CenterOfMassType,
    pub custom_point: Vec3,
    pub bone_attachment: Option<BoneAttachment>,
    pub weighted_points: Vec<WeightedPoint>,
    pub consider_physics_mass: bool,
    pub auto_update_on_mesh_change: bool,
    /// Seconds between auto-update checks.
    pub update_frequency: f32,
}

impl Default for CenterOfMassConfig {
    fn default() -> Self {
        Self {
            kind: CenterOfMassType::GeometricCenter,
            custom_point: Vec3::ZERO,
            bone_attachment: None,
            weighted_points: Vec::new(),
            consider_physics_mass: false,
            auto_update_on_mesh_change: false,
            update_frequency: 0.1,
        }
    }
}

impl CenterOfMassConfig {
    pub fn custom_point(point: Vec3) -> Self {
        Self {
            kind: CenterOfMassType::CustomPoint,
            custom_point: point,
            ..Self::default()
        }
    }

    pub fn bone_attachment(bone_name: impl Into<String>, offset: Vec3) -> Self {
        Self {
            kind: CenterOfMassType::BoneAttachment,
            bone_attachment: Some(BoneAttachment {
                bone_name: bone_name.into(),
                offset,
            }),
            ..Self::default()
        }
    }

    pub fn weighted_points(points: Vec<WeightedPoint>) -> Self {
        Self {
            kind: CenterOfMassType::WeightedAverage,
            weighted_points: points,
            ..Self::default()
        }
    }

    pub fn physics_center(auto_update: bool) -> Self {
        Self {
            kind: CenterOfMassType::PhysicsCenter,
            consider_physics_mass: true,
            auto_update_on_mesh_change: auto_update,
            ..Self::default()
        }
    }
}

/// Cached outcome of a center-of-mass resolution.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CenterOfMassResult {
    pub local_position: Vec3,
    pub world_position: Vec3,
    pub is_valid: bool,
    pub calculation_time: u64,
}
