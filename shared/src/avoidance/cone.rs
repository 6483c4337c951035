//! Velocity obstacle cones in the horizontal displacement plane.
//!
//! Points are displacements over the prediction horizon, stored as 2D (x, z).

use nalgebra::{Rotation2, Vector2};

pub type Vec2 = Vector2<f32>;

/// Half-plane through `point`; positive side is `normal`.
#[derive(Clone, Copy, Debug)]
pub struct HalfPlane {
    pub point: Vec2,
    pub normal: Vec2,
}

impl HalfPlane {
    #[inline]
    pub fn signed_distance(&self, p: &Vec2) -> f32 {
        (p - self.point).dot(&self.normal)
    }
}

/// Wedge of displacements that collide with another agent.
///
/// A point is inside when it is strictly on the positive side of both planes.
#[derive(Clone, Copy, Debug)]
pub struct VelocityCone {
    pub planes: [HalfPlane; 2],
}

impl VelocityCone {
    /// Cone with apex `apex` opening toward `relative_position`, wide enough to
    /// cover a disc of `combined_radius` around it.
    ///
    /// Returns `None` when the two centers coincide.
    pub fn new(apex: Vec2, relative_position: Vec2, combined_radius: f32) -> Option<Self> {
        let distance = relative_position.norm();
        if distance <= f32::EPSILON {
            return None;
        }
        let toward = relative_position / distance;
        // Overlapping agents get a half-plane.
        let half_angle = (combined_radius / distance).min(1.0).asin();

        let side = |angle: f32| {
            let edge = Rotation2::new(angle) * toward;
            let mut normal = Vec2::new(-edge.y, edge.x);
            if normal.dot(&toward) < 0.0 {
                normal = -normal;
            }
            HalfPlane { point: apex, normal }
        };
        Some(Self {
            planes: [side(half_angle), side(-half_angle)],
        })
    }

    #[inline]
    pub fn contains(&self, p: &Vec2) -> bool {
        self.planes[0].signed_distance(p) > 0.0 && self.planes[1].signed_distance(p) > 0.0
    }
}

/// Pull `desired` back toward `base` until it leaves every cone.
///
/// Each cone that clips the segment is dropped from further tests, so the walk
/// ends after at most one clip per cone.
pub fn avoid_cones(cones: &[VelocityCone], base: Vec2, desired: Vec2) -> Vec2 {
    let mut active: Vec<&VelocityCone> = cones.iter().collect();
    let mut current = desired;

    while let Some(pos) = active.iter().position(|c| c.contains(&current)) {
        let cone = active.swap_remove(pos);
        let base_dist = [cone.planes[0].signed_distance(&base), cone.planes[1].signed_distance(&base)];
        let cur_dist = [cone.planes[0].signed_distance(&current), cone.planes[1].signed_distance(&current)];

        if base_dist[0] > 0.0 && base_dist[1] > 0.0 {
            // Base is inside too; nowhere to go along this line.
            return base;
        }

        // The segment enters the wedge once it is inside both planes.
        let mut entry = 0.0_f32;
        for i in 0..2 {
            if base_dist[i] <= 0.0 {
                let t = base_dist[i] / (base_dist[i] - cur_dist[i]);
                entry = entry.max(t);
            }
        }
        current = base + (current - base) * entry;
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cone_ahead() -> VelocityCone {
        // Obstacle 200 ahead on +x, combined radius 90.
        VelocityCone::new(Vec2::zeros(), Vec2::new(200.0, 0.0), 90.0).unwrap()
    }

    #[test]
    fn straight_ahead_is_inside_and_behind_is_not() {
        let cone = cone_ahead();
        assert!(cone.contains(&Vec2::new(10.0, 0.0)));
        assert!(!cone.contains(&Vec2::new(-10.0, 0.0)));
        // asin(0.45) is about 26.7 degrees.
        let at = |deg: f32| Rotation2::new(deg.to_radians()) * Vec2::new(10.0, 0.0);
        assert!(cone.contains(&at(23.0)));
        assert!(!cone.contains(&at(40.0)));
        assert!(!cone.contains(&at(-40.0)));
    }

    #[test]
    fn clipping_toward_base_stops_on_the_cone_edge() {
        let offset = VelocityCone::new(Vec2::new(0.0, 5.0), Vec2::new(200.0, 0.0), 90.0).unwrap();
        let desired = Vec2::new(10.0, 0.0);
        assert!(offset.contains(&desired));
        let base = Vec2::new(0.0, 0.0);
        let clipped = avoid_cones(&[offset], base, desired);
        assert!(clipped.norm() < desired.norm());
        assert!(!offset.contains(&(clipped * 0.999)));
    }

    #[test]
    fn base_inside_cone_collapses_to_base() {
        let cone = VelocityCone::new(Vec2::new(-5.0, 0.0), Vec2::new(200.0, 0.0), 90.0).unwrap();
        let clipped = avoid_cones(&[cone], Vec2::zeros(), Vec2::new(10.0, 0.0));
        assert_eq!(clipped, Vec2::zeros());
    }

    #[test]
    fn coincident_centers_build_no_cone() {
        assert!(VelocityCone::new(Vec2::zeros(), Vec2::zeros(), 10.0).is_none());
    }
}
