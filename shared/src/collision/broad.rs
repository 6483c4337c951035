use nalgebra as na;
use rapier3d::parry::{
    bounding_volume::Aabb,
    partitioning::{Bvh, BvhBuildStrategy},
};

use super::types::{CapsuleSpec, Vec3};

/// Broad-phase accelerator over the finite colliders of a scene.
///
/// Notes:
/// - Finite shapes are stored as world-space AABBs in a BVH.
/// - `finite_indices` maps each BVH leaf back to its collider index.
/// - Planes are infinite, so they are listed in `plane_indices` and always tested.
pub struct WorldAccel {
    pub bvh: Bvh,
    pub finite_indices: Vec<usize>,
    pub plane_indices: Vec<usize>,
}

impl WorldAccel {
    /// Build from one optional AABB per collider. `None` marks an infinite (plane) collider.
    pub fn build(aabbs: &[Option<Aabb>]) -> Self {
        let mut leaves: Vec<Aabb> = Vec::new();
        let mut finite_indices = Vec::new();
        let mut plane_indices = Vec::new();

        for (i, aabb) in aabbs.iter().enumerate() {
            match aabb {
                Some(aabb) => {
                    leaves.push(*aabb);
                    finite_indices.push(i);
                }
                None => plane_indices.push(i),
            }
        }

        Self {
            bvh: Bvh::from_leaves(BvhBuildStrategy::Binned, &leaves),
            finite_indices,
            plane_indices,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.finite_indices.is_empty() && self.plane_indices.is_empty()
    }

    /// Collider indices whose AABB intersects `region`, followed by every plane.
    pub fn query_candidates(&self, region: &Aabb) -> Vec<usize> {
        let mut out: Vec<usize> = if self.finite_indices.is_empty() {
            Vec::new()
        } else {
            self.bvh
                .intersect_aabb(region)
                .map(|leaf_idx| self.finite_indices[leaf_idx as usize])
                .collect()
        };
        out.extend_from_slice(&self.plane_indices);
        out
    }
}

/// Swept AABB of an upright capsule moving from `start` to `end`, inflated by `skin`.
pub fn swept_capsule_aabb(capsule: &CapsuleSpec, start: Vec3, end: Vec3, skin: f32) -> Aabb {
    let half = Vec3::new(capsule.radius, capsule.half_height, capsule.radius);
    let a = Aabb::new(na::Point3::from(start - half), na::Point3::from(start + half));
    let b = Aabb::new(na::Point3::from(end - half), na::Point3::from(end + half));
    aabb_inflate(&aabb_union(&a, &b), skin)
}

/// AABB of a segment, inflated by `skin`.
pub fn segment_aabb(start: Vec3, end: Vec3, skin: f32) -> Aabb {
    let mins = na::Point3::new(start.x.min(end.x), start.y.min(end.y), start.z.min(end.z));
    let maxs = na::Point3::new(start.x.max(end.x), start.y.max(end.y), start.z.max(end.z));
    aabb_inflate(&Aabb::new(mins, maxs), skin)
}

fn aabb_union(a: &Aabb, b: &Aabb) -> Aabb {
    let min = na::Point3::new(
        a.mins.x.min(b.mins.x),
        a.mins.y.min(b.mins.y),
        a.mins.z.min(b.mins.z),
    );
    let max = na::Point3::new(
        a.maxs.x.max(b.maxs.x),
        a.maxs.y.max(b.maxs.y),
        a.maxs.z.max(b.maxs.z),
    );
    Aabb {
        mins: min,
        maxs: max,
    }
}

fn aabb_inflate(a: &Aabb, margin: f32) -> Aabb {
    if margin <= 0.0 {
        return *a;
    }
    let delta = na::Vector3::new(margin, margin, margin);
    Aabb {
        mins: a.mins - delta,
        maxs: a.maxs + delta,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swept_aabb_covers_both_ends() {
        let capsule = CapsuleSpec::new(1.0, 2.0);
        let aabb = swept_capsule_aabb(
            &capsule,
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(10.0, 0.0, 0.0),
            0.5,
        );
        assert_eq!(aabb.mins.x, -1.5);
        assert_eq!(aabb.maxs.x, 11.5);
        assert_eq!(aabb.maxs.y, 2.5);
    }

    #[test]
    fn planes_are_always_candidates() {
        let accel = WorldAccel::build(&[None]);
        let far = segment_aabb(Vec3::new(1.0e4, 0.0, 0.0), Vec3::new(1.0e4, 1.0, 0.0), 0.0);
        assert_eq!(accel.query_candidates(&far), vec![0]);
    }
}
