/*!
Core collision types and math aliases shared by the collision submodules.

This module contains no algorithms. It defines the data exchanged between:
- broad (static world acceleration structures and candidate queries)
- narrow_phase (parry time-of-impact, contact and ray queries)
- world (the concrete scene implementing [`SceneQuery`](super::SceneQuery))
- the floor probe and the movement state machine

Conventions: +Y is up. A character capsule is always upright, so its rotation
never takes part in collision queries.
*/

use nalgebra as na;
use rapier3d::parry::shape as pshape;
use serde::{Deserialize, Serialize};

/// Common math aliases for clarity and consistency.
pub type Vec3 = na::Vector3<f32>;
pub type Quat = na::UnitQuaternion<f32>;
pub type Iso = na::Isometry3<f32>;

/// A rigid transform (isometry) in world space.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub translation: Vec3,
    pub rotation: Quat,
}

impl Default for Transform {
    fn default() -> Self {
        Self::identity()
    }
}

impl Transform {
    pub fn identity() -> Self {
        Self::new(Vec3::zeros(), Quat::identity())
    }

    #[inline]
    pub fn new(translation: Vec3, rotation: Quat) -> Self {
        Self {
            translation,
            rotation,
        }
    }

    #[inline]
    pub fn from_translation(translation: Vec3) -> Self {
        Self::new(translation, Quat::identity())
    }

    /// Convert to nalgebra `Isometry3` for use with parry narrow-phase queries.
    #[inline]
    pub fn iso(&self) -> Iso {
        Iso::from_parts(
            na::Translation3::new(self.translation.x, self.translation.y, self.translation.z),
            self.rotation,
        )
    }

    #[inline]
    pub fn transform_point(&self, local: &Vec3) -> Vec3 {
        self.rotation * local + self.translation
    }

    #[inline]
    pub fn inverse_transform_point(&self, world: &Vec3) -> Vec3 {
        self.rotation.inverse() * (world - self.translation)
    }
}

/// Static collision shapes supported by the world.
///
/// - Plane: infinite plane in world-space represented by its normal and offset (dist)
///   satisfying: normal ⋅ x = dist.
/// - Cuboid: oriented box with half-extents in local space, placed by `transform`.
/// - Capsule: `half_height` is the half-length of the cylinder section only.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum StaticShape {
    Plane {
        /// World-space unit normal of the plane.
        normal: Vec3,
        /// Plane offset along the normal, i.e., normal ⋅ x = dist.
        dist: f32,
    },
    Cuboid {
        half_extents: Vec3,
        transform: Transform,
    },
    Sphere {
        radius: f32,
        /// Translation used; rotation ignored.
        transform: Transform,
    },
    Capsule {
        radius: f32,
        half_height: f32,
        transform: Transform,
    },
}

/// Upright capsule of a moving agent.
///
/// `half_height` is the full half height, hemispheres included, so the
/// capsule spans `center.y - half_height ..= center.y + half_height`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CapsuleSpec {
    pub radius: f32,
    pub half_height: f32,
}

impl CapsuleSpec {
    /// # Panics
    /// On non-positive radius or a half height smaller than the radius. A capsule like that
    /// cannot be simulated and indicates broken configuration.
    pub fn new(radius: f32, half_height: f32) -> Self {
        assert!(
            radius > 0.0 && radius.is_finite(),
            "capsule radius must be positive, got {radius}"
        );
        assert!(
            half_height >= radius && half_height.is_finite(),
            "capsule half height {half_height} must be >= radius {radius}"
        );
        Self {
            radius,
            half_height,
        }
    }

    /// Half length of the straight cylinder section.
    #[inline]
    pub fn segment_half_height(&self) -> f32 {
        (self.half_height - self.radius).max(0.0)
    }

    /// Parry shape used by the narrow phase.
    pub fn shape(&self) -> pshape::Capsule {
        pshape::Capsule::new_y(self.segment_half_height(), self.radius)
    }

    /// Returns a copy shrunk by absolute amounts, clamped to stay a valid capsule.
    pub fn shrunk(&self, radius_shrink: f32, height_shrink: f32) -> Self {
        let radius = (self.radius - radius_shrink).max(0.01);
        let half_height = (self.half_height - height_shrink).max(radius);
        Self {
            radius,
            half_height,
        }
    }
}

/// Identifier of a collider in the scene. Used as the hit object handle and as a movement base.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SurfaceId(pub u32);

/// Per-surface adjustment of the walkable threshold.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum WalkableSlopeOverride {
    #[default]
    Default,
    /// Lets steeper slopes be walked: threshold becomes `min(current, floor_y)`.
    Increase(f32),
    /// Only flatter slopes are walkable: threshold becomes `max(current, floor_y)`.
    Decrease(f32),
    Unwalkable,
}

impl WalkableSlopeOverride {
    pub fn modify_walkable_floor_y(&self, current: f32) -> f32 {
        match *self {
            Self::Default => current,
            Self::Increase(floor_y) => current.min(floor_y),
            Self::Decrease(floor_y) => current.max(floor_y),
            // Above any unit normal's Y.
            Self::Unwalkable => 2.0,
        }
    }
}

/// Closest blocking hit of a sweep or trace.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HitResult {
    /// Fraction of the trace at which the shape stops, pulled back from the surface by a skin.
    pub time: f32,
    /// Distance along the trace to the exact contact (no pullback).
    pub distance: f32,
    /// Shape center (or ray point) where movement stops.
    pub location: Vec3,
    pub impact_point: Vec3,
    /// For sweeps: direction from the impact point toward the shape center.
    pub normal: Vec3,
    /// Surface normal of the hit object at the impact point.
    pub impact_normal: Vec3,
    pub start_penetrating: bool,
    pub penetration_depth: f32,
    pub trace_start: Vec3,
    pub trace_end: Vec3,
    pub surface: SurfaceId,
    pub walkable_override: WalkableSlopeOverride,
}

impl HitResult {
    /// Hit describing an initial overlap at the start of a trace.
    pub fn penetrating(
        start: Vec3,
        end: Vec3,
        normal: Vec3,
        depth: f32,
        impact_point: Vec3,
        surface: SurfaceId,
        walkable_override: WalkableSlopeOverride,
    ) -> Self {
        Self {
            time: 0.0,
            distance: 0.0,
            location: start,
            impact_point,
            normal,
            impact_normal: normal,
            start_penetrating: true,
            penetration_depth: depth,
            trace_start: start,
            trace_end: end,
            surface,
            walkable_override,
        }
    }

    #[inline]
    pub fn trace_length(&self) -> f32 {
        (self.trace_end - self.trace_start).norm()
    }

    /// True for a normal blocking hit that did not start in penetration.
    #[inline]
    pub fn is_valid_blocking_hit(&self) -> bool {
        !self.start_penetrating
    }
}

/// Minimum translation that separates a shape from the deepest overlap.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Penetration {
    /// Unit direction to push the shape out.
    pub normal: Vec3,
    pub depth: f32,
    pub surface: SurfaceId,
}

/// Liquid the probe point is immersed in.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FluidVolume {
    /// World Y of the liquid surface.
    pub surface_y: f32,
    /// Bottom of the volume.
    pub bottom_y: f32,
    pub friction: f32,
    pub terminal_velocity: f32,
}
