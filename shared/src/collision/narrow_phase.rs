use nalgebra as na;
use rapier3d::parry::{
    query::{self, Ray, ShapeCastOptions, ShapeCastStatus},
    shape::{self as pshape, Shape},
};

use super::types::{Iso, Vec3};

/// Outcome of casting the moving capsule against one collider.
#[derive(Clone, Copy, Debug)]
pub enum CapsuleCast {
    /// The capsule reaches the collider at `toi` (fraction of the translation).
    Hit {
        toi: f32,
        /// Contact point on the capsule, relative to the capsule center at impact.
        witness_local: Vec3,
        /// Direction from the contact toward the capsule center.
        normal: Vec3,
        /// World-space surface normal of the collider at the contact.
        impact_normal: Vec3,
    },
    /// The capsule already overlaps the collider at the start of the cast.
    Penetrating {
        depth: f32,
        /// Push-out direction for the capsule.
        normal: Vec3,
        point: Vec3,
    },
}

fn unit_to_vec(n: &na::Unit<na::Vector3<f32>>) -> Vec3 {
    let n = n.into_inner();
    Vec3::new(n.x, n.y, n.z)
}

/// Cast an upright capsule along `vel` against a single collider.
///
/// The capsule is never rotated, so its local-space witness and normal are already
/// world-aligned. Contacts that merely touch at the start of the cast and whose
/// normal does not oppose the motion are ignored so sliding along a surface works.
pub fn cast_capsule(
    capsule_iso: &Iso,
    capsule: &pshape::Capsule,
    vel: &Vec3,
    max_toi: f32,
    other_iso: &Iso,
    other: &dyn Shape,
    penetration_tolerance: f32,
) -> Option<CapsuleCast> {
    let mut opts = ShapeCastOptions::with_max_time_of_impact(max_toi);
    opts.stop_at_penetration = true;
    let hit = query::cast_shapes(
        capsule_iso,
        vel,
        capsule as &dyn Shape,
        other_iso,
        &na::Vector3::zeros(),
        other,
        opts,
    )
    .ok()
    .flatten()?;

    if hit.status == ShapeCastStatus::PenetratingOrWithinTargetDist {
        let contact = capsule_contact(capsule_iso, capsule, other_iso, other, 0.0)?;
        let push = -unit_to_vec(&contact.normal1);
        if contact.dist < -penetration_tolerance {
            return Some(CapsuleCast::Penetrating {
                depth: -contact.dist,
                normal: push,
                point: contact.point2.coords,
            });
        }
        // Touching: block only if moving into the surface.
        if vel.dot(&push) >= 0.0 {
            return None;
        }
        let center = capsule_iso.translation.vector;
        return Some(CapsuleCast::Hit {
            toi: 0.0,
            witness_local: contact.point1.coords - center,
            normal: push,
            impact_normal: push,
        });
    }

    let normal = -unit_to_vec(&hit.normal1);
    if vel.dot(&normal) >= 0.0 {
        return None;
    }
    let impact_normal = other_iso.rotation * unit_to_vec(&hit.normal2);
    Some(CapsuleCast::Hit {
        toi: hit.time_of_impact,
        witness_local: hit.witness1.coords,
        normal,
        impact_normal,
    })
}

/// World-space contact between the capsule and a collider, if closer than `prediction`.
pub fn capsule_contact(
    capsule_iso: &Iso,
    capsule: &pshape::Capsule,
    other_iso: &Iso,
    other: &dyn Shape,
    prediction: f32,
) -> Option<query::Contact> {
    query::contact(capsule_iso, capsule as &dyn Shape, other_iso, other, prediction)
        .ok()
        .flatten()
}

/// Ray cast against one collider. `dir` must be unit length so the returned time is a distance.
pub fn ray_cast(
    origin: Vec3,
    dir: Vec3,
    max_dist: f32,
    other_iso: &Iso,
    other: &dyn Shape,
) -> Option<(f32, Vec3)> {
    let ray = Ray::new(na::Point3::from(origin), dir);
    other
        .cast_ray_and_get_normal(other_iso, &ray, max_dist, true)
        .map(|hit| (hit.time_of_impact, hit.normal))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rapier3d::parry::shape::HalfSpace;

    fn ground() -> (Iso, HalfSpace) {
        (Iso::identity(), HalfSpace::new(na::Vector3::y_axis()))
    }

    #[test]
    fn falling_capsule_hits_ground_at_expected_fraction() {
        let capsule = pshape::Capsule::new_y(1.0, 0.5);
        let (iso, plane) = ground();
        // Bottom starts 2.0 above the plane and moves down by 4.0.
        let start = Iso::translation(0.0, 3.5, 0.0);
        let vel = Vec3::new(0.0, -4.0, 0.0);

        let cast = cast_capsule(&start, &capsule, &vel, 1.0, &iso, &plane, 0.01);
        match cast {
            Some(CapsuleCast::Hit {
                toi,
                normal,
                impact_normal,
                ..
            }) => {
                assert!((toi - 0.5).abs() < 1.0e-3, "toi = {toi}");
                assert!(normal.y > 0.99);
                assert!(impact_normal.y > 0.99);
            }
            other => panic!("expected a hit, got {other:?}"),
        }
    }

    #[test]
    fn moving_away_from_touching_surface_is_not_blocked() {
        let capsule = pshape::Capsule::new_y(1.0, 0.5);
        let (iso, plane) = ground();
        let start = Iso::translation(0.0, 1.5, 0.0);
        let up = Vec3::new(0.0, 1.0, 0.0);

        assert!(cast_capsule(&start, &capsule, &up, 1.0, &iso, &plane, 0.01).is_none());
    }

    #[test]
    fn deep_overlap_reports_penetration() {
        let capsule = pshape::Capsule::new_y(1.0, 0.5);
        let (iso, plane) = ground();
        let start = Iso::translation(0.0, 1.0, 0.0);
        let vel = Vec3::new(1.0, 0.0, 0.0);

        match cast_capsule(&start, &capsule, &vel, 1.0, &iso, &plane, 0.01) {
            Some(CapsuleCast::Penetrating { depth, normal, .. }) => {
                assert!((depth - 0.5).abs() < 1.0e-3);
                assert!(normal.y > 0.99);
            }
            other => panic!("expected penetration, got {other:?}"),
        }
    }

    #[test]
    fn ray_reports_distance_and_normal() {
        let (iso, plane) = ground();
        let (dist, normal) = ray_cast(
            Vec3::new(0.0, 5.0, 0.0),
            Vec3::new(0.0, -1.0, 0.0),
            10.0,
            &iso,
            &plane,
        )
        .unwrap();
        assert!((dist - 5.0).abs() < 1.0e-4);
        assert!(normal.y > 0.99);
    }
}
