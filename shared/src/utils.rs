use crate::collision::{Quat, Vec3};
use crate::constants::{KINDA_SMALL, SMALL_NUMBER};
use nalgebra::{Vector2, Vector3};

/// Minimum planar length required to derive a yaw.
pub const YAW_EPS: f32 = 1.0e-6;

/// Yaw (radians, about +Y) facing along a planar XZ direction. Yaw 0 faces -Z.
pub fn yaw_from_xz(xz: Vector2<f32>) -> Option<f32> {
    if xz.norm_squared() > YAW_EPS {
        return Some((-xz[0]).atan2(-xz[1]));
    }

    None
}

/// Yaw of a rotation using the same convention as [`yaw_from_xz`].
pub fn yaw_of(rotation: &Quat) -> f32 {
    let forward = rotation * Vec3::new(0.0, 0.0, -1.0);
    yaw_from_xz(to_planar(&forward)).unwrap_or(0.0)
}

pub fn quat_from_yaw(yaw: f32) -> Quat {
    Quat::from_axis_angle(&Vector3::y_axis(), yaw)
}

/// XZ projection as a 2D vector (x, z).
#[inline]
pub fn to_planar(v: &Vec3) -> Vector2<f32> {
    Vector2::new(v.x, v.z)
}

#[inline]
pub fn from_planar(v: Vector2<f32>, y: f32) -> Vec3 {
    Vec3::new(v.x, y, v.y)
}

/// Copy of `v` with the vertical component removed.
#[inline]
pub fn horizontal(v: &Vec3) -> Vec3 {
    Vec3::new(v.x, 0.0, v.z)
}

#[inline]
pub fn size_2d(v: &Vec3) -> f32 {
    (v.x * v.x + v.z * v.z).sqrt()
}

#[inline]
pub fn size_squared_2d(v: &Vec3) -> f32 {
    v.x * v.x + v.z * v.z
}

/// Planar (XZ) distance squared between two world positions.
pub fn planar_distance_sq(a: &Vec3, b: &Vec3) -> f32 {
    let x = b.x - a.x;
    let z = b.z - a.z;
    x * x + z * z
}

pub fn safe_normal(v: &Vec3) -> Vec3 {
    let sq = v.norm_squared();
    if sq < SMALL_NUMBER {
        Vec3::zeros()
    } else {
        v / sq.sqrt()
    }
}

pub fn safe_normal_2d(v: &Vec3) -> Vec3 {
    safe_normal(&horizontal(v))
}

pub fn is_nearly_zero(v: &Vec3) -> bool {
    v.x.abs() <= KINDA_SMALL && v.y.abs() <= KINDA_SMALL && v.z.abs() <= KINDA_SMALL
}

pub fn clamp_max_size(v: &Vec3, max: f32) -> Vec3 {
    if max < KINDA_SMALL {
        return Vec3::zeros();
    }
    let sq = v.norm_squared();
    if sq > max * max {
        v * (max / sq.sqrt())
    } else {
        *v
    }
}

/// Clamps the horizontal part of `v`, keeping Y.
pub fn clamp_max_size_2d(v: &Vec3, max: f32) -> Vec3 {
    if max < KINDA_SMALL {
        return Vec3::new(0.0, v.y, 0.0);
    }
    let sq = size_squared_2d(v);
    if sq > max * max {
        let scale = max / sq.sqrt();
        Vec3::new(v.x * scale, v.y, v.z * scale)
    } else {
        *v
    }
}

/// Removes the component of `v` along `normal`.
#[inline]
pub fn vector_plane_project(v: &Vec3, normal: &Vec3) -> Vec3 {
    v - normal * v.dot(normal)
}

/// Rotates `current` yaw toward `target` yaw by at most `max_delta` radians.
pub fn step_yaw_toward(current: f32, target: f32, max_delta: f32) -> f32 {
    let mut delta = (target - current) % std::f32::consts::TAU;
    if delta > std::f32::consts::PI {
        delta -= std::f32::consts::TAU;
    } else if delta < -std::f32::consts::PI {
        delta += std::f32::consts::TAU;
    }
    current + delta.clamp(-max_delta, max_delta)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaw_round_trips_through_quaternion() {
        let dir = Vector2::new(0.6, -0.8);
        let yaw = yaw_from_xz(dir).unwrap();
        let facing = quat_from_yaw(yaw) * Vec3::new(0.0, 0.0, -1.0);
        assert!((facing.x - 0.6).abs() < 1.0e-5);
        assert!((facing.z + 0.8).abs() < 1.0e-5);
    }

    #[test]
    fn clamp_2d_preserves_vertical() {
        let v = clamp_max_size_2d(&Vec3::new(30.0, -7.0, 40.0), 5.0);
        assert!((size_2d(&v) - 5.0).abs() < 1.0e-4);
        assert_eq!(v.y, -7.0);
    }

    #[test]
    fn yaw_step_takes_the_short_way_round() {
        let next = step_yaw_toward(3.0, -3.0, 0.1);
        assert!(next > 3.0, "expected to wrap past pi, got {next}");
    }
}
