//! Stateless portal mathematics.
//!
//! Every function here is a pure function of its arguments. Points flip
//! their forward component when mapped through a pair (front of the source
//! face lands behind the destination face); directions keep theirs, so a
//! body moving into the source face emerges moving away from the
//! destination plane on the side it appears on.

use glam::{Mat3, Quat, Vec3};

use crate::types::{
    BoundsAnalysis, CameraParams, CrossingState, PhysicsState, PortalFace, PortalPlane, Transform,
};

pub const EPSILON: f32 = 1e-6;

/// Signed distance from `point` to the plane through `plane_center` with
/// `plane_normal`; positive on the normal side.
pub fn signed_distance_to_plane(point: Vec3, plane_center: Vec3, plane_normal: Vec3) -> f32 {
    (point - plane_center).dot(plane_normal)
}

pub fn project_point_on_plane(point: Vec3, plane_center: Vec3, plane_normal: Vec3) -> Vec3 {
    point - plane_normal * signed_distance_to_plane(point, plane_center, plane_normal)
}

/// Shortest-arc rotation taking `from` to `to`. Handles the antiparallel
/// case by rotating about an arbitrary perpendicular axis.
pub fn rotate_from_to(from: Vec3, to: Vec3) -> Quat {
    let from = from.normalize_or_zero();
    let to = to.normalize_or_zero();
    if from == Vec3::ZERO || to == Vec3::ZERO {
        return Quat::IDENTITY;
    }
    Quat::from_rotation_arc(from, to)
}

/// Uniform scale applied to anything passing the pair, from the area ratio.
/// Degenerate source rectangles scale by 1.
pub fn calculate_scale_factor(source: &PortalPlane, target: &PortalPlane) -> f32 {
    let source_area = source.area();
    if source_area < EPSILON {
        return 1.0;
    }
    (target.area() / source_area).sqrt()
}

/// Maps a free vector's (right, up, forward) components from the source face
/// basis onto the target face basis. Length-preserving for orthonormal
/// plane axes; the forward component is carried over unflipped.
fn map_vector_between_faces(
    vector: Vec3,
    source: &PortalPlane,
    target: &PortalPlane,
    source_face: PortalFace,
    target_face: PortalFace,
) -> Vec3 {
    let right = vector.dot(source.right);
    let up = vector.dot(source.up);
    let forward = vector.dot(source.face_normal(source_face));

    target.right * right + target.up * up + target.face_normal(target_face) * forward
}

/// Maps a world-space point through a linked pair.
///
/// The forward component is negated: a point in front of the source face
/// lands behind the destination face, which is what makes a body entering
/// one side appear to emerge from the other.
pub fn transform_point_through_portal(
    point: Vec3,
    source: &PortalPlane,
    target: &PortalPlane,
    source_face: PortalFace,
    target_face: PortalFace,
) -> Vec3 {
    let relative = point - source.center;
    let right = relative.dot(source.right);
    let up = relative.dot(source.up);
    let forward = relative.dot(source.face_normal(source_face));

    let scale = calculate_scale_factor(source, target);

    target.center
        + target.right * (right * scale)
        + target.up * (up * scale)
        + target.face_normal(target_face) * (-forward * scale)
}

/// Maps a direction through a linked pair; the result is re-normalized.
pub fn transform_direction_through_portal(
    direction: Vec3,
    source: &PortalPlane,
    target: &PortalPlane,
    source_face: PortalFace,
    target_face: PortalFace,
) -> Vec3 {
    map_vector_between_faces(direction, source, target, source_face, target_face)
        .normalize_or_zero()
}

/// Maps a full transform through a linked pair: position via the point map,
/// scale via the area-ratio factor, rotation composed with the face-to-face
/// rotation.
pub fn transform_through_portal(
    transform: &Transform,
    source: &PortalPlane,
    target: &PortalPlane,
    source_face: PortalFace,
    target_face: PortalFace,
) -> Transform {
    let position =
        transform_point_through_portal(transform.position, source, target, source_face, target_face);

    let portal_rotation = rotate_from_to(
        source.face_normal(source_face),
        -target.face_normal(target_face),
    );

    let scale = calculate_scale_factor(source, target);

    Transform {
        position,
        rotation: portal_rotation * transform.rotation,
        scale: transform.scale * scale,
    }
}

/// Maps a physics state through a linked pair. Velocities map as free
/// vectors (magnitude preserved); mass and the scalar material properties
/// ride along unchanged.
pub fn transform_physics_state_through_portal(
    state: &PhysicsState,
    source: &PortalPlane,
    target: &PortalPlane,
    source_face: PortalFace,
    target_face: PortalFace,
) -> PhysicsState {
    PhysicsState {
        linear_velocity: map_vector_between_faces(
            state.linear_velocity,
            source,
            target,
            source_face,
            target_face,
        ),
        angular_velocity: map_vector_between_faces(
            state.angular_velocity,
            source,
            target,
            source_face,
            target_face,
        ),
        applied_force: map_vector_between_faces(
            state.applied_force,
            source,
            target,
            source_face,
            target_face,
        ),
        applied_torque: map_vector_between_faces(
            state.applied_torque,
            source,
            target,
            source_face,
            target_face,
        ),
        ..*state
    }
}

/// Physics-state map for moving portals: after the base map, the entity
/// inherits the relative motion of the pair. Both the linear and the angular
/// corrections are `target portal motion - mapped source portal motion`; a
/// rotation maps angular velocity vectors directly, so no magnitude rescale
/// is involved.
pub fn transform_physics_state_with_portal_velocity(
    entity_state: &PhysicsState,
    source_portal_state: &PhysicsState,
    target_portal_state: &PhysicsState,
    source: &PortalPlane,
    target: &PortalPlane,
    source_face: PortalFace,
    target_face: PortalFace,
) -> PhysicsState {
    let mut state = transform_physics_state_through_portal(
        entity_state,
        source,
        target,
        source_face,
        target_face,
    );

    let mapped_source_velocity = map_vector_between_faces(
        source_portal_state.linear_velocity,
        source,
        target,
        source_face,
        target_face,
    );
    state.linear_velocity += target_portal_state.linear_velocity - mapped_source_velocity;

    let mapped_source_angular = map_vector_between_faces(
        source_portal_state.angular_velocity,
        source,
        target,
        source_face,
        target_face,
    );
    state.angular_velocity += target_portal_state.angular_velocity - mapped_source_angular;

    state
}

/// Rectangle test in the plane's local axes.
pub fn is_point_in_portal_bounds(point: Vec3, plane: &PortalPlane) -> bool {
    let relative = point - plane.center;
    relative.dot(plane.right).abs() <= plane.width * 0.5
        && relative.dot(plane.up).abs() <= plane.height * 0.5
}

/// Intersection of the segment `start..end` with the portal rectangle, if
/// any.
pub fn line_intersects_portal_plane(start: Vec3, end: Vec3, plane: &PortalPlane) -> Option<Vec3> {
    let direction = end - start;
    let length = direction.length();
    if length < EPSILON {
        return None;
    }
    let direction = direction / length;

    let denominator = direction.dot(plane.normal);
    if denominator.abs() < EPSILON {
        return None;
    }

    let t = (plane.center - start).dot(plane.normal) / denominator;
    if !(0.0..=length).contains(&t) {
        return None;
    }

    let intersection = start + direction * t;
    is_point_in_portal_bounds(intersection, plane).then_some(intersection)
}

/// The eight corners of a local-space AABB.
pub fn aabb_corners(bounds_min: Vec3, bounds_max: Vec3) -> [Vec3; 8] {
    [
        Vec3::new(bounds_min.x, bounds_min.y, bounds_min.z),
        Vec3::new(bounds_max.x, bounds_min.y, bounds_min.z),
        Vec3::new(bounds_min.x, bounds_max.y, bounds_min.z),
        Vec3::new(bounds_max.x, bounds_max.y, bounds_min.z),
        Vec3::new(bounds_min.x, bounds_min.y, bounds_max.z),
        Vec3::new(bounds_max.x, bounds_min.y, bounds_max.z),
        Vec3::new(bounds_min.x, bounds_max.y, bounds_max.z),
        Vec3::new(bounds_max.x, bounds_max.y, bounds_max.z),
    ]
}

/// Counts the entity's world-space AABB corners on each side of the portal
/// plane. Corners on the plane count on both sides, which keeps the
/// crossing state from flickering when a face rests exactly on the plane.
pub fn analyze_entity_bounding_box(
    bounds_min: Vec3,
    bounds_max: Vec3,
    transform: &Transform,
    plane: &PortalPlane,
) -> BoundsAnalysis {
    let mut analysis = BoundsAnalysis {
        front_count: 0,
        back_count: 0,
        total: 8,
    };

    for corner in aabb_corners(bounds_min, bounds_max) {
        let world = transform.transform_point(corner);
        let distance = signed_distance_to_plane(world, plane.center, plane.normal);
        if distance > EPSILON {
            analysis.front_count += 1;
        } else if distance < -EPSILON {
            analysis.back_count += 1;
        } else {
            analysis.front_count += 1;
            analysis.back_count += 1;
        }
    }

    analysis
}

/// Debounced crossing-state transition from a bounds analysis.
pub fn determine_crossing_state(
    analysis: &BoundsAnalysis,
    previous: CrossingState,
) -> CrossingState {
    let has_front = analysis.front_count > 0;
    let has_back = analysis.back_count > 0;

    if has_front && has_back {
        CrossingState::Crossing
    } else if analysis.back_count == analysis.total && previous == CrossingState::Crossing {
        CrossingState::Teleported
    } else if analysis.front_count == analysis.total {
        CrossingState::NotTouching
    } else {
        previous
    }
}

/// True when the entity's AABB straddles the plane AND its projection onto
/// the plane overlaps the portal rectangle.
pub fn does_entity_intersect_portal(
    bounds_min: Vec3,
    bounds_max: Vec3,
    transform: &Transform,
    plane: &PortalPlane,
) -> bool {
    let corners = aabb_corners(bounds_min, bounds_max).map(|c| transform.transform_point(c));

    let mut has_positive = false;
    let mut has_negative = false;
    for corner in &corners {
        let distance = signed_distance_to_plane(*corner, plane.center, plane.normal);
        if distance > EPSILON {
            has_positive = true;
        } else if distance < -EPSILON {
            has_negative = true;
        } else {
            has_positive = true;
            has_negative = true;
        }
    }

    if !has_positive || !has_negative {
        return false;
    }

    let mut min_right = f32::MAX;
    let mut max_right = f32::MIN;
    let mut min_up = f32::MAX;
    let mut max_up = f32::MIN;

    for corner in &corners {
        let projected = project_point_on_plane(*corner, plane.center, plane.normal);
        let relative = projected - plane.center;
        let right = relative.dot(plane.right);
        let up = relative.dot(plane.up);
        min_right = min_right.min(right);
        max_right = max_right.max(right);
        min_up = min_up.min(up);
        max_up = max_up.max(up);
    }

    let half_width = plane.width * 0.5;
    let half_height = plane.height * 0.5;

    max_right >= -half_width && min_right <= half_width && max_up >= -half_height && min_up <= half_height
}

/// True once every AABB corner sits strictly behind the plane.
pub fn is_entity_fully_through_portal(
    bounds_min: Vec3,
    bounds_max: Vec3,
    transform: &Transform,
    plane: &PortalPlane,
) -> bool {
    aabb_corners(bounds_min, bounds_max).iter().all(|corner| {
        let world = transform.transform_point(*corner);
        signed_distance_to_plane(world, plane.center, plane.normal) < -EPSILON
    })
}

/// World-space corners of the portal rectangle: lower-left, lower-right,
/// upper-right, upper-left.
pub fn portal_corners(plane: &PortalPlane) -> [Vec3; 4] {
    let right = plane.right * (plane.width * 0.5);
    let up = plane.up * (plane.height * 0.5);
    [
        plane.center - right - up,
        plane.center + right - up,
        plane.center + right + up,
        plane.center - right + up,
    ]
}

/// Maps an entity's local AABB through a pair: the transform goes through
/// the full map, the corners go world -> through pair -> new local space,
/// and the result is their new local AABB.
pub fn transform_bounds_through_portal(
    bounds_min: Vec3,
    bounds_max: Vec3,
    transform: &Transform,
    source: &PortalPlane,
    target: &PortalPlane,
    source_face: PortalFace,
    target_face: PortalFace,
) -> (Vec3, Vec3, Transform) {
    let new_transform = transform_through_portal(transform, source, target, source_face, target_face);

    let mut new_min = Vec3::MAX;
    let mut new_max = Vec3::MIN;
    for corner in aabb_corners(bounds_min, bounds_max) {
        let world = transform.transform_point(corner);
        let mapped = transform_point_through_portal(world, source, target, source_face, target_face);
        let local = new_transform.inverse_transform_point(mapped);
        new_min = new_min.min(local);
        new_max = new_max.max(local);
    }

    (new_min, new_max, new_transform)
}

/// Virtual camera seen through a pair. The orientation is rebuilt from the
/// mapped forward/up axes through a full basis-to-quaternion conversion;
/// composing shortest-arc rotations here drifts roll and visibly tilts the
/// portal view.
pub fn calculate_portal_camera(
    camera: &CameraParams,
    source: &PortalPlane,
    target: &PortalPlane,
    source_face: PortalFace,
    target_face: PortalFace,
) -> CameraParams {
    let mut virtual_camera = *camera;

    virtual_camera.position =
        transform_point_through_portal(camera.position, source, target, source_face, target_face);

    let forward = camera.rotation * Vec3::NEG_Z;
    let up = camera.rotation * Vec3::Y;

    let new_forward =
        transform_direction_through_portal(forward, source, target, source_face, target_face);
    let new_up = transform_direction_through_portal(up, source, target, source_face, target_face);

    let new_right = new_forward.cross(new_up).normalize_or_zero();
    let new_up = new_right.cross(new_forward).normalize_or_zero();

    if new_right != Vec3::ZERO && new_up != Vec3::ZERO {
        let basis = Mat3::from_cols(new_right, new_up, -new_forward);
        virtual_camera.rotation = Quat::from_mat3(&basis).normalize();
    }

    virtual_camera
}

/// A portal pair is recursive when the camera, mapped through the pair, is
/// looking back at the front of the first portal: the portal can see
/// itself and rendering must terminate at a configured depth.
pub fn is_portal_recursive(
    portal: &PortalPlane,
    linked: &PortalPlane,
    camera: &CameraParams,
) -> bool {
    let virtual_position = transform_point_through_portal(
        camera.position,
        portal,
        linked,
        PortalFace::A,
        PortalFace::B,
    );

    let to_portal = portal.center - virtual_position;
    let distance = to_portal.length();
    if distance < 0.1 {
        return true;
    }

    (to_portal / distance).dot(portal.normal) > 0.0
}
