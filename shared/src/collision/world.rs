use log::debug;
use nalgebra as na;
use rapier3d::parry::{bounding_volume::Aabb, shape::SharedShape};

use super::broad::{WorldAccel, segment_aabb, swept_capsule_aabb};
use super::narrow_phase::{CapsuleCast, capsule_contact, cast_capsule, ray_cast};
use super::query::SceneQuery;
use super::types::{
    CapsuleSpec, FluidVolume, HitResult, Iso, Penetration, StaticShape, SurfaceId, Transform, Vec3,
    WalkableSlopeOverride,
};
use crate::constants::{KINDA_SMALL, PENETRATION_TOLERANCE, SWEEP_SKIN};

struct Collider {
    shape: SharedShape,
    iso: Iso,
    walkable_override: WalkableSlopeOverride,
    dynamic: bool,
}

impl Collider {
    fn aabb(&self) -> Option<Aabb> {
        if self.shape.as_halfspace().is_some() {
            None
        } else {
            Some(self.shape.compute_aabb(&self.iso))
        }
    }

    /// Face normal of a box at `point` that most opposes `direction`.
    ///
    /// Edge and corner contacts touch several faces; the blended contact normal
    /// would make the top of a ledge look like a slope. Other shapes keep `fallback`.
    fn opposing_face_normal(&self, point: &Vec3, direction: &Vec3, fallback: Vec3) -> Vec3 {
        let Some(cuboid) = self.shape.as_cuboid() else {
            return fallback;
        };
        let local = self.iso.inverse_transform_point(&na::Point3::from(*point));
        let half = cuboid.half_extents;
        let tolerance = FACE_TOLERANCE.max(half.max() * 1.0e-4);

        let mut best: Option<(f32, Vec3)> = None;
        for axis in 0..3 {
            for sign in [-1.0_f32, 1.0] {
                if (local[axis] * sign - half[axis]).abs() > tolerance {
                    continue;
                }
                let mut local_normal = na::Vector3::zeros();
                local_normal[axis] = sign;
                let normal = self.iso.rotation * local_normal;
                let facing = normal.dot(direction);
                if best.is_none_or(|(f, _)| facing < f) {
                    best = Some((facing, normal));
                }
            }
        }
        best.map_or(fallback, |(_, n)| n)
    }
}

/// Distance from a box face within which a contact point counts as on that face.
const FACE_TOLERANCE: f32 = 0.01;

/// Axis-aligned liquid volume.
#[derive(Clone, Copy, Debug)]
struct FluidRegion {
    mins: Vec3,
    maxs: Vec3,
    friction: f32,
    terminal_velocity: f32,
}

/// Scene made of parry shapes with a BVH broad phase.
///
/// Colliders can be flagged dynamic and moved between ticks to act as moving bases.
pub struct StaticWorld {
    colliders: Vec<Collider>,
    fluids: Vec<FluidRegion>,
    accel: WorldAccel,
}

impl Default for StaticWorld {
    fn default() -> Self {
        Self::new()
    }
}

fn shape_from_def(def: &StaticShape) -> (SharedShape, Iso) {
    match *def {
        StaticShape::Plane { normal, dist } => {
            let unit_n = na::Unit::new_normalize(normal);
            let origin = unit_n.into_inner() * dist;
            (
                SharedShape::halfspace(unit_n),
                Iso::translation(origin.x, origin.y, origin.z),
            )
        }
        StaticShape::Cuboid {
            half_extents,
            transform,
        } => (
            SharedShape::cuboid(half_extents.x, half_extents.y, half_extents.z),
            transform.iso(),
        ),
        StaticShape::Sphere { radius, transform } => (
            SharedShape::ball(radius),
            Transform::from_translation(transform.translation).iso(),
        ),
        StaticShape::Capsule {
            radius,
            half_height,
            transform,
        } => (SharedShape::capsule_y(half_height, radius), transform.iso()),
    }
}

impl StaticWorld {
    pub fn new() -> Self {
        Self {
            colliders: Vec::new(),
            fluids: Vec::new(),
            accel: WorldAccel::build(&[]),
        }
    }

    pub fn from_shapes(shapes: impl IntoIterator<Item = StaticShape>) -> Self {
        let mut world = Self::new();
        for shape in shapes {
            world.push_collider(&shape, WalkableSlopeOverride::Default, false);
        }
        world.rebuild_accel();
        world
    }

    pub fn add_shape(&mut self, shape: StaticShape) -> SurfaceId {
        self.add_shape_with(shape, WalkableSlopeOverride::Default, false)
    }

    pub fn add_shape_with(
        &mut self,
        shape: StaticShape,
        walkable_override: WalkableSlopeOverride,
        dynamic: bool,
    ) -> SurfaceId {
        let id = self.push_collider(&shape, walkable_override, dynamic);
        self.rebuild_accel();
        id
    }

    /// Liquid filling the box `mins..maxs`. Its surface is `maxs.y`.
    pub fn add_fluid(&mut self, mins: Vec3, maxs: Vec3, friction: f32, terminal_velocity: f32) {
        self.fluids.push(FluidRegion {
            mins,
            maxs,
            friction,
            terminal_velocity,
        });
    }

    /// Moves a collider. Returns false for an unknown id.
    pub fn set_collider_transform(&mut self, id: SurfaceId, transform: Transform) -> bool {
        let Some(collider) = self.colliders.get_mut(id.0 as usize) else {
            return false;
        };
        collider.iso = transform.iso();
        debug!("collider {:?} moved to {:?}", id, transform.translation);
        self.rebuild_accel();
        true
    }

    pub fn len(&self) -> usize {
        self.colliders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.colliders.is_empty()
    }

    fn push_collider(
        &mut self,
        def: &StaticShape,
        walkable_override: WalkableSlopeOverride,
        dynamic: bool,
    ) -> SurfaceId {
        let (shape, iso) = shape_from_def(def);
        let id = SurfaceId(self.colliders.len() as u32);
        self.colliders.push(Collider {
            shape,
            iso,
            walkable_override,
            dynamic,
        });
        id
    }

    fn rebuild_accel(&mut self) {
        let aabbs: Vec<Option<Aabb>> = self.colliders.iter().map(Collider::aabb).collect();
        self.accel = WorldAccel::build(&aabbs);
    }

    fn penetration_at(&self, center: Vec3, capsule: &CapsuleSpec) -> Option<(Penetration, Vec3)> {
        let shape = capsule.shape();
        let iso = Iso::translation(center.x, center.y, center.z);
        let region = swept_capsule_aabb(capsule, center, center, KINDA_SMALL);

        let mut deepest: Option<(Penetration, Vec3)> = None;
        for idx in self.accel.query_candidates(&region) {
            let collider = &self.colliders[idx];
            let Some(contact) = capsule_contact(&iso, &shape, &collider.iso, &*collider.shape, 0.0)
            else {
                continue;
            };
            if contact.dist >= -PENETRATION_TOLERANCE {
                continue;
            }
            let depth = -contact.dist;
            if deepest.as_ref().is_none_or(|(p, _)| depth > p.depth) {
                let n = contact.normal1.into_inner();
                deepest = Some((
                    Penetration {
                        normal: -Vec3::new(n.x, n.y, n.z),
                        depth,
                        surface: SurfaceId(idx as u32),
                    },
                    contact.point2.coords,
                ));
            }
        }
        deepest
    }
}

impl SceneQuery for StaticWorld {
    fn sweep_capsule(&self, start: Vec3, end: Vec3, capsule: &CapsuleSpec) -> Option<HitResult> {
        let delta = end - start;
        let len = delta.norm();

        if len <= KINDA_SMALL {
            return self.penetration_at(start, capsule).map(|(pen, point)| {
                let collider = &self.colliders[pen.surface.0 as usize];
                HitResult::penetrating(
                    start,
                    end,
                    pen.normal,
                    pen.depth,
                    point,
                    pen.surface,
                    collider.walkable_override,
                )
            });
        }

        let shape = capsule.shape();
        let iso = Iso::translation(start.x, start.y, start.z);
        let region = swept_capsule_aabb(capsule, start, end, SWEEP_SKIN);

        let mut best: Option<(f32, usize, CapsuleCast)> = None;
        for idx in self.accel.query_candidates(&region) {
            let collider = &self.colliders[idx];
            let Some(cast) = cast_capsule(
                &iso,
                &shape,
                &delta,
                1.0,
                &collider.iso,
                &*collider.shape,
                PENETRATION_TOLERANCE,
            ) else {
                continue;
            };
            let toi = match cast {
                // Overlaps sort before any time-zero touch.
                CapsuleCast::Penetrating { .. } => -1.0,
                CapsuleCast::Hit { toi, .. } => toi,
            };
            if best.as_ref().is_none_or(|(t, _, _)| toi < *t) {
                best = Some((toi, idx, cast));
            }
        }

        let (_, idx, cast) = best?;
        let collider = &self.colliders[idx];
        let surface = SurfaceId(idx as u32);
        match cast {
            CapsuleCast::Penetrating {
                depth,
                normal,
                point,
            } => Some(HitResult::penetrating(
                start,
                end,
                normal,
                depth,
                point,
                surface,
                collider.walkable_override,
            )),
            CapsuleCast::Hit {
                toi,
                witness_local,
                normal,
                impact_normal,
            } => {
                let distance = toi * len;
                let time = ((distance - SWEEP_SKIN).max(0.0) / len).min(toi);
                let contact_center = start + delta * toi;
                let impact_point = contact_center + witness_local;
                Some(HitResult {
                    time,
                    distance,
                    location: start + delta * time,
                    impact_point,
                    normal,
                    impact_normal: collider.opposing_face_normal(&impact_point, &delta, impact_normal),
                    start_penetrating: false,
                    penetration_depth: 0.0,
                    trace_start: start,
                    trace_end: end,
                    surface,
                    walkable_override: collider.walkable_override,
                })
            }
        }
    }

    fn line_trace(&self, start: Vec3, end: Vec3) -> Option<HitResult> {
        let delta = end - start;
        let len = delta.norm();
        if len <= KINDA_SMALL {
            return None;
        }
        let dir = delta / len;
        let region = segment_aabb(start, end, KINDA_SMALL);

        let mut best: Option<(f32, Vec3, usize)> = None;
        for idx in self.accel.query_candidates(&region) {
            let collider = &self.colliders[idx];
            if let Some((dist, normal)) = ray_cast(start, dir, len, &collider.iso, &*collider.shape)
            {
                if best.as_ref().is_none_or(|(d, _, _)| dist < *d) {
                    best = Some((dist, normal, idx));
                }
            }
        }

        let (dist, normal, idx) = best?;
        let location = start + dir * dist;
        Some(HitResult {
            time: dist / len,
            distance: dist,
            location,
            impact_point: location,
            normal,
            impact_normal: normal,
            start_penetrating: dist <= 0.0,
            penetration_depth: 0.0,
            trace_start: start,
            trace_end: end,
            surface: SurfaceId(idx as u32),
            walkable_override: self.colliders[idx].walkable_override,
        })
    }

    fn overlap_capsule(&self, center: Vec3, capsule: &CapsuleSpec) -> bool {
        self.penetration_at(center, capsule).is_some()
    }

    fn compute_penetration(&self, center: Vec3, capsule: &CapsuleSpec) -> Option<Penetration> {
        self.penetration_at(center, capsule).map(|(pen, _)| pen)
    }

    fn fluid_at(&self, point: Vec3) -> Option<FluidVolume> {
        self.fluids
            .iter()
            .find(|f| {
                (f.mins.x..=f.maxs.x).contains(&point.x)
                    && (f.mins.y..=f.maxs.y).contains(&point.y)
                    && (f.mins.z..=f.maxs.z).contains(&point.z)
            })
            .map(|f| FluidVolume {
                surface_y: f.maxs.y,
                bottom_y: f.mins.y,
                friction: f.friction,
                terminal_velocity: f.terminal_velocity,
            })
    }

    fn base_transform(&self, base: SurfaceId) -> Option<Transform> {
        let collider = self.colliders.get(base.0 as usize)?;
        Some(Transform::new(
            collider.iso.translation.vector,
            collider.iso.rotation,
        ))
    }

    fn is_dynamic_base(&self, base: SurfaceId) -> bool {
        self.colliders
            .get(base.0 as usize)
            .is_some_and(|c| c.dynamic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_world() -> StaticWorld {
        StaticWorld::from_shapes([StaticShape::Plane {
            normal: Vec3::new(0.0, 1.0, 0.0),
            dist: 0.0,
        }])
    }

    fn wall(x: f32) -> StaticShape {
        StaticShape::Cuboid {
            half_extents: Vec3::new(10.0, 200.0, 200.0),
            transform: Transform::from_translation(Vec3::new(x + 10.0, 200.0, 0.0)),
        }
    }

    #[test]
    fn sweep_down_stops_just_above_plane() {
        let world = flat_world();
        let capsule = CapsuleSpec::new(34.0, 88.0);
        let hit = world
            .sweep_capsule(
                Vec3::new(0.0, 100.0, 0.0),
                Vec3::new(0.0, 50.0, 0.0),
                &capsule,
            )
            .expect("plane below");

        assert!(!hit.start_penetrating);
        assert!((hit.distance - 12.0).abs() < 1.0e-2, "distance {}", hit.distance);
        assert!(hit.location.y > 88.0 && hit.location.y < 88.0 + 2.0 * SWEEP_SKIN);
        assert!(hit.impact_normal.y > 0.99);
        assert!(hit.impact_point.y.abs() < 1.0e-2);
    }

    #[test]
    fn horizontal_sweep_hits_wall_face() {
        let mut world = flat_world();
        world.add_shape(wall(100.0));
        let capsule = CapsuleSpec::new(34.0, 88.0);
        let hit = world
            .sweep_capsule(
                Vec3::new(0.0, 90.0, 0.0),
                Vec3::new(200.0, 90.0, 0.0),
                &capsule,
            )
            .expect("wall ahead");

        assert_eq!(hit.surface, SurfaceId(1));
        assert!((hit.distance - 66.0).abs() < 1.0e-2);
        assert!(hit.impact_normal.x < -0.99);
    }

    #[test]
    fn box_edge_reports_the_face_that_opposes_the_sweep() {
        let world = StaticWorld::from_shapes([StaticShape::Cuboid {
            half_extents: Vec3::new(50.0, 50.0, 50.0),
            transform: Transform::from_translation(Vec3::new(0.0, -50.0, 0.0)),
        }]);
        let capsule = CapsuleSpec::new(34.0, 88.0);
        // Capsule axis 20 past the edge: the hemisphere lands on the edge.
        let hit = world
            .sweep_capsule(Vec3::new(70.0, 100.0, 0.0), Vec3::new(70.0, 0.0, 0.0), &capsule)
            .expect("edge below");
        assert!(hit.normal.y < 0.9, "contact normal {:?}", hit.normal);
        assert!(hit.impact_normal.y > 0.99, "impact normal {:?}", hit.impact_normal);
        assert!((hit.impact_point.x - 50.0).abs() < 0.1);
    }

    #[test]
    fn sinking_capsule_reports_penetration() {
        let world = flat_world();
        let capsule = CapsuleSpec::new(34.0, 88.0);
        let pen = world
            .compute_penetration(Vec3::new(0.0, 80.0, 0.0), &capsule)
            .expect("overlapping ground");
        assert!((pen.depth - 8.0).abs() < 1.0e-2);
        assert!(pen.normal.y > 0.99);
        assert!(world.overlap_capsule(Vec3::new(0.0, 80.0, 0.0), &capsule));
        assert!(!world.overlap_capsule(Vec3::new(0.0, 90.0, 0.0), &capsule));
    }

    #[test]
    fn line_trace_finds_ground() {
        let world = flat_world();
        let hit = world
            .line_trace(Vec3::new(3.0, 10.0, 3.0), Vec3::new(3.0, -10.0, 3.0))
            .unwrap();
        assert!((hit.time - 0.5).abs() < 1.0e-4);
        assert!(hit.location.y.abs() < 1.0e-4);
    }

    #[test]
    fn fluid_reports_surface_height() {
        let mut world = flat_world();
        world.add_fluid(Vec3::new(-50.0, 0.0, -50.0), Vec3::new(50.0, 120.0, 50.0), 0.3, 4000.0);
        let fluid = world.fluid_at(Vec3::new(0.0, 60.0, 0.0)).unwrap();
        assert_eq!(fluid.surface_y, 120.0);
        assert!(world.fluid_at(Vec3::new(0.0, 130.0, 0.0)).is_none());
    }

    #[test]
    fn moving_a_dynamic_collider_updates_base_transform() {
        let mut world = flat_world();
        let platform = world.add_shape_with(
            StaticShape::Cuboid {
                half_extents: Vec3::new(100.0, 5.0, 100.0),
                transform: Transform::from_translation(Vec3::new(0.0, 50.0, 0.0)),
            },
            WalkableSlopeOverride::Default,
            true,
        );
        assert!(world.is_dynamic_base(platform));
        world.set_collider_transform(
            platform,
            Transform::from_translation(Vec3::new(10.0, 50.0, 0.0)),
        );
        let t = world.base_transform(platform).unwrap();
        assert_eq!(t.translation.x, 10.0);
    }
}
