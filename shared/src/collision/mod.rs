/*!
Collision root module.

Scene queries used by the floor probe and the movement state machine. parry
provides the narrow phase and a BVH serves as broad phase over static colliders.

- types:        shared data types (Transform, StaticShape, CapsuleSpec, HitResult)
- broad:        broad-phase helpers (swept AABBs, candidate queries)
- narrow_phase: thin wrappers over parry queries (shape casts, contacts, rays)
- query:        the `SceneQuery` trait movement code is written against
- world:        `StaticWorld`, the parry-backed scene
*/

pub mod broad;
pub mod narrow_phase;
pub mod query;
pub mod types;
pub mod world;

pub use query::SceneQuery;
pub use types::{
    CapsuleSpec, FluidVolume, HitResult, Iso, Penetration, Quat, StaticShape, SurfaceId,
    Transform, Vec3, WalkableSlopeOverride,
};
pub use world::StaticWorld;

/// Build a `StaticShape::Plane` from a world-space plane pose:
/// - normal = rotation * +Y
/// - dist = dot(normal, translation) + optional offset
#[inline]
pub fn plane_from_pose(rotation: Quat, translation: Vec3, offset_along_normal: f32) -> StaticShape {
    let normal = rotation * Vec3::new(0.0, 1.0, 0.0);
    let dist = normal.dot(&translation) + offset_along_normal;
    StaticShape::Plane { normal, dist }
}

/// Build a `StaticShape::Cuboid` with given half extents and pose.
#[inline]
pub fn cuboid_from_pose(half_extents: Vec3, translation: Vec3, rotation: Quat) -> StaticShape {
    StaticShape::Cuboid {
        half_extents,
        transform: Transform {
            translation,
            rotation,
        },
    }
}
