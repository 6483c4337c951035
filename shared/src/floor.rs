/*!
Downward floor probe for an upright capsule.

A probe sweeps a slightly shortened capsule down from the agent's center,
rejects grazing hits near the capsule rim and falls back to a line trace when
the sweep is unreliable. `find_floor` layers the perch check on top so an
agent standing at a ledge can keep its footing.

Distances reported here are measured from the capsule bottom down to the hit.
*/

use log::trace;

use crate::collision::{CapsuleSpec, HitResult, SceneQuery, Vec3};
use crate::config::MovementSettings;
use crate::constants::{KINDA_SMALL, MAX_FLOOR_DIST, MIN_FLOOR_DIST, SWEEP_EDGE_REJECT_DISTANCE};
use crate::constants::{FLOOR_SWEEP_SHRINK_SCALE, FLOOR_SWEEP_SHRINK_SCALE_OVERLAP};
use crate::utils::{planar_distance_sq, size_squared_2d};

/// Outcome of a downward floor probe.
///
/// `floor_dist` is only meaningful while `blocking_hit` is set, and a walkable floor
/// always implies a blocking hit.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FloorResult {
    pub blocking_hit: bool,
    pub walkable_floor: bool,
    /// The walkable classification came from the line trace fallback.
    pub line_trace: bool,
    /// Distance from the capsule bottom to the sweep hit.
    pub floor_dist: f32,
    /// Distance from the capsule bottom to the line trace hit.
    pub line_dist: f32,
    pub hit: Option<HitResult>,
}

impl FloorResult {
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    #[inline]
    pub fn is_walkable_floor(&self) -> bool {
        self.blocking_hit && self.walkable_floor
    }

    pub fn set_from_sweep(&mut self, hit: Option<HitResult>, sweep_floor_dist: f32, walkable: bool) {
        self.blocking_hit = hit.is_some_and(|h| h.is_valid_blocking_hit());
        self.walkable_floor = walkable;
        self.line_trace = false;
        self.floor_dist = sweep_floor_dist;
        self.line_dist = 0.0;
        self.hit = hit;
    }

    /// Takes the surface data of a line trace while keeping the sweep's stop location.
    pub fn set_from_line_trace(
        &mut self,
        line_hit: &HitResult,
        sweep_floor_dist: f32,
        line_dist: f32,
        walkable: bool,
    ) {
        if !self.blocking_hit {
            return;
        }
        let mut merged = *line_hit;
        if let Some(old) = self.hit {
            merged.time = old.time;
            merged.impact_point = old.impact_point;
            merged.location = old.location;
            merged.trace_start = old.trace_start;
            merged.trace_end = old.trace_end;
        }
        self.hit = Some(merged);
        self.line_trace = true;
        self.floor_dist = sweep_floor_dist;
        self.line_dist = line_dist;
        self.walkable_floor = walkable;
    }

    pub fn get_distance_to_floor(&self) -> f32 {
        if self.line_trace {
            self.line_dist
        } else {
            self.floor_dist
        }
    }

    /// Impact normal of the floor, if any.
    pub fn impact_normal(&self) -> Option<Vec3> {
        self.hit.map(|h| h.impact_normal)
    }
}

/// True when a blocking hit can be stood on for the given walkable threshold.
///
/// Faces whose normal Y is below `KINDA_SMALL` are never walkable, whatever the
/// per-surface override says.
pub fn is_walkable(hit: &HitResult, walkable_floor_y: f32) -> bool {
    if !hit.is_valid_blocking_hit() {
        return false;
    }
    if hit.impact_normal.y < KINDA_SMALL {
        return false;
    }
    let threshold = hit.walkable_override.modify_walkable_floor_y(walkable_floor_y);
    hit.impact_normal.y >= threshold
}

/// Whether `impact_point` is far enough inside the capsule rim to be trusted as floor.
pub fn is_within_edge_tolerance(capsule_location: &Vec3, impact_point: &Vec3, radius: f32) -> bool {
    let dist_sq = planar_distance_sq(capsule_location, impact_point);
    let reduced = (radius - SWEEP_EDGE_REJECT_DISTANCE).max(SWEEP_EDGE_REJECT_DISTANCE + KINDA_SMALL);
    dist_sq < reduced * reduced
}

/// Floor queries for one capsule against one scene.
pub struct FloorProbe<'a> {
    pub scene: &'a dyn SceneQuery,
    pub capsule: CapsuleSpec,
    pub walkable_floor_y: f32,
    pub max_step_height: f32,
    pub perch_radius_threshold: f32,
    pub perch_additional_height: f32,
}

impl<'a> FloorProbe<'a> {
    pub fn new(scene: &'a dyn SceneQuery, capsule: CapsuleSpec, settings: &MovementSettings) -> Self {
        Self {
            scene,
            capsule,
            walkable_floor_y: settings.walkable_floor_y(),
            max_step_height: settings.max_step_height,
            perch_radius_threshold: settings.perch_radius_threshold,
            perch_additional_height: settings.perch_additional_height,
        }
    }

    #[inline]
    pub fn is_walkable(&self, hit: &HitResult) -> bool {
        is_walkable(hit, self.walkable_floor_y)
    }

    pub fn get_perch_radius_threshold(&self) -> f32 {
        self.perch_radius_threshold.max(0.0)
    }

    /// Radius of the narrower capsule used by the perch probe.
    pub fn get_valid_perch_radius(&self) -> f32 {
        let radius = self.capsule.radius;
        (radius - self.get_perch_radius_threshold()).clamp(0.11, radius)
    }

    /// Probe the floor below `location`.
    ///
    /// `line_distance` and `sweep_distance` are measured below the capsule bottom;
    /// the sweep must reach at least as far as the line. `sweep_radius` may be
    /// narrower than the capsule (perch probes). A previous downward sweep from the
    /// same spot can be passed in `downward_sweep` to skip the capsule sweep.
    pub fn compute_floor_dist(
        &self,
        location: Vec3,
        line_distance: f32,
        sweep_distance: f32,
        sweep_radius: f32,
        downward_sweep: Option<&HitResult>,
    ) -> FloorResult {
        let mut floor = FloorResult::default();
        let radius = self.capsule.radius;
        let half_height = self.capsule.half_height;

        let mut skip_sweep = false;
        if let Some(cached) = downward_sweep.filter(|h| h.is_valid_blocking_hit()) {
            let vertical = cached.trace_start.y > cached.trace_end.y
                && size_squared_2d(&(cached.trace_start - cached.trace_end)) <= KINDA_SMALL;
            if vertical && is_within_edge_tolerance(&location, &cached.impact_point, radius) {
                skip_sweep = true;
                let walkable = self.is_walkable(cached);
                let dist = location.y - cached.location.y;
                floor.set_from_sweep(Some(*cached), dist, walkable);
                if walkable {
                    return floor;
                }
            }
        }

        if sweep_distance < line_distance {
            debug_assert!(false, "floor sweep shorter than line trace");
            return floor;
        }

        if !skip_sweep && sweep_distance > 0.0 && sweep_radius > 0.0 {
            let mut shrink_height = (half_height - radius) * (1.0 - FLOOR_SWEEP_SHRINK_SCALE);
            let mut trace_dist = sweep_distance + shrink_height;
            let mut shape = CapsuleSpec {
                radius: sweep_radius,
                half_height: (half_height - shrink_height).max(sweep_radius),
            };
            let mut hit = self
                .scene
                .sweep_capsule(location, location - Vec3::y() * trace_dist, &shape);

            if let Some(first) = hit {
                if first.start_penetrating
                    || !is_within_edge_tolerance(&location, &first.impact_point, shape.radius)
                {
                    // Narrower and shorter to dodge whatever we are brushing against.
                    let reduced = (shape.radius - SWEEP_EDGE_REJECT_DISTANCE - KINDA_SMALL).max(0.0);
                    if reduced > KINDA_SMALL {
                        shrink_height = (half_height - radius) * (1.0 - FLOOR_SWEEP_SHRINK_SCALE_OVERLAP);
                        trace_dist = sweep_distance + shrink_height;
                        shape = CapsuleSpec {
                            radius: reduced,
                            half_height: (half_height - shrink_height).max(reduced),
                        };
                        hit = self
                            .scene
                            .sweep_capsule(location, location - Vec3::y() * trace_dist, &shape);
                    }
                }

                // Negative distances are kept so the height adjustment can pull out of penetration.
                let max_penetration_adjust = MAX_FLOOR_DIST.max(radius);
                let time = hit.map_or(1.0, |h| h.time);
                let sweep_result = (time * trace_dist - shrink_height).max(-max_penetration_adjust);

                floor.set_from_sweep(hit, sweep_result, false);
                if let Some(h) = hit.as_ref() {
                    if h.is_valid_blocking_hit() && self.is_walkable(h) && sweep_result <= sweep_distance {
                        floor.walkable_floor = true;
                        return floor;
                    }
                }
            }
        }

        // A sweep that missed everything is final. A sweep stuck in penetration still gets a line trace.
        let penetrating = floor.hit.is_some_and(|h| h.start_penetrating);
        if !floor.blocking_hit && !penetrating {
            floor.floor_dist = sweep_distance;
            return floor;
        }

        if line_distance > 0.0 {
            let shrink_height = half_height;
            let trace_dist = line_distance + shrink_height;
            if let Some(hit) = self
                .scene
                .line_trace(location, location - Vec3::y() * trace_dist)
            {
                if hit.time > 0.0 {
                    let max_penetration_adjust = MAX_FLOOR_DIST.max(radius);
                    let line_result = (hit.time * trace_dist - shrink_height).max(-max_penetration_adjust);
                    floor.blocking_hit = true;
                    if line_result <= line_distance && self.is_walkable(&hit) {
                        let sweep_dist = floor.floor_dist;
                        floor.set_from_line_trace(&hit, sweep_dist, line_result, true);
                        return floor;
                    }
                }
            }
        }

        floor.walkable_floor = false;
        floor
    }

    /// Full floor check including perching. `on_ground` extends the probe so walking
    /// agents keep contact with floors up to a step below them.
    pub fn find_floor(&self, location: Vec3, on_ground: bool, downward_sweep: Option<&HitResult>) -> FloorResult {
        let height_check_adjust = if on_ground {
            MAX_FLOOR_DIST + KINDA_SMALL
        } else {
            -MAX_FLOOR_DIST
        };
        let sweep_dist = MAX_FLOOR_DIST.max(self.max_step_height + height_check_adjust);
        let line_dist = sweep_dist;

        let mut floor = self.compute_floor_dist(location, line_dist, sweep_dist, self.capsule.radius, downward_sweep);

        if !floor.blocking_hit || floor.line_trace {
            return floor;
        }
        let Some(hit) = floor.hit else {
            return floor;
        };
        if !self.should_compute_perch_result(&hit, true) {
            return floor;
        }

        let mut max_perch_floor_dist = MAX_FLOOR_DIST.max(self.max_step_height + height_check_adjust);
        if on_ground {
            max_perch_floor_dist += self.perch_additional_height.max(0.0);
        }

        match self.compute_perch_result(self.get_valid_perch_radius(), &hit, max_perch_floor_dist) {
            Some(perch) => {
                // Keep the height adjustment from lifting us past the perch distance.
                let avg_floor_dist = (MIN_FLOOR_DIST + MAX_FLOOR_DIST) * 0.5;
                let move_up_dist = avg_floor_dist - floor.floor_dist;
                if move_up_dist + perch.floor_dist >= max_perch_floor_dist {
                    floor.floor_dist = avg_floor_dist;
                }

                if !floor.walkable_floor {
                    if let Some(perch_hit) = perch.hit {
                        let sweep_dist = floor.floor_dist;
                        floor.set_from_line_trace(&perch_hit, sweep_dist, sweep_dist.max(MIN_FLOOR_DIST), true);
                    }
                }
            }
            None => {
                trace!("floor: no perch at {:?}", location);
                floor.walkable_floor = false;
            }
        }
        floor
    }

    /// A perch probe is worth running for a hit out near the capsule rim.
    pub fn should_compute_perch_result(&self, hit: &HitResult, check_radius: bool) -> bool {
        if !hit.is_valid_blocking_hit() {
            return false;
        }
        if self.get_perch_radius_threshold() <= SWEEP_EDGE_REJECT_DISTANCE {
            return false;
        }
        if check_radius {
            let dist_sq = planar_distance_sq(&hit.impact_point, &hit.location);
            let stand_on_edge = self.get_valid_perch_radius();
            if dist_sq <= stand_on_edge * stand_on_edge {
                return false;
            }
        }
        true
    }

    /// Probe with a narrower capsule from the hit location. Returns the perch floor
    /// when it is walkable within `max_floor_dist`.
    pub fn compute_perch_result(&self, test_radius: f32, hit: &HitResult, max_floor_dist: f32) -> Option<FloorResult> {
        if max_floor_dist <= 0.0 {
            return None;
        }

        let half_height = self.capsule.half_height;
        let hit_above_base = (hit.impact_point.y - (hit.location.y - half_height)).max(0.0);
        let perch_line_dist = (max_floor_dist - hit_above_base).max(0.0);
        let perch_sweep_dist = max_floor_dist.max(0.0);
        let actual_sweep_dist = perch_sweep_dist + self.capsule.radius;

        let perch = self.compute_floor_dist(hit.location, perch_line_dist, actual_sweep_dist, test_radius, None);
        if !perch.is_walkable_floor() {
            return None;
        }
        if hit_above_base + perch.floor_dist > max_floor_dist {
            return None;
        }
        Some(perch)
    }

    /// Move `location` vertically so a walkable floor sits inside the hover band.
    ///
    /// Returns true when the capsule moved. The floor distance in `floor` is kept
    /// in step with the move.
    pub fn adjust_floor_height(&self, location: &mut Vec3, floor: &mut FloorResult) -> bool {
        if !floor.is_walkable_floor() {
            return false;
        }

        let mut old_floor_dist = floor.floor_dist;
        if floor.line_trace {
            if old_floor_dist < MIN_FLOOR_DIST && floor.line_dist >= MIN_FLOOR_DIST {
                // Would climb unwalkable walls.
                return false;
            }
            old_floor_dist = floor.line_dist;
        }

        if (MIN_FLOOR_DIST..=MAX_FLOOR_DIST).contains(&old_floor_dist) {
            return false;
        }

        let initial_y = location.y;
        let avg_floor_dist = (MIN_FLOOR_DIST + MAX_FLOOR_DIST) * 0.5;
        let move_dist = avg_floor_dist - old_floor_dist;
        let target = *location + Vec3::y() * move_dist;

        match self.scene.sweep_capsule(*location, target, &self.capsule) {
            None => {
                *location = target;
                floor.floor_dist += move_dist;
            }
            Some(hit) if hit.start_penetrating => {
                // Stuck; leave the penetration to the depenetration pass.
                return false;
            }
            Some(hit) if move_dist > 0.0 => {
                *location = hit.location;
                floor.floor_dist += location.y - initial_y;
            }
            Some(hit) => {
                *location = hit.location;
                // Pulled back by the sweep skin, so this is the gap to the floor.
                floor.floor_dist = (hit.distance - (initial_y - location.y)).max(0.0);
                if self.is_walkable(&hit) {
                    let dist = floor.floor_dist;
                    floor.set_from_sweep(Some(hit), dist, true);
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collision::{StaticShape, StaticWorld, SurfaceId, Transform, WalkableSlopeOverride};

    fn ground() -> StaticWorld {
        StaticWorld::from_shapes([StaticShape::Plane {
            normal: Vec3::new(0.0, 1.0, 0.0),
            dist: 0.0,
        }])
    }

    fn probe(world: &StaticWorld) -> FloorProbe<'_> {
        FloorProbe::new(world, CapsuleSpec::new(34.0, 88.0), &MovementSettings::default())
    }

    fn synthetic_hit(normal: Vec3, walkable_override: WalkableSlopeOverride) -> HitResult {
        HitResult {
            time: 0.5,
            distance: 1.0,
            location: Vec3::new(0.0, 90.0, 0.0),
            impact_point: Vec3::zeros(),
            normal,
            impact_normal: normal,
            start_penetrating: false,
            penetration_depth: 0.0,
            trace_start: Vec3::new(0.0, 91.0, 0.0),
            trace_end: Vec3::new(0.0, 89.0, 0.0),
            surface: SurfaceId(0),
            walkable_override,
        }
    }

    #[test]
    fn standing_on_flat_ground_settles_into_hover_band() {
        let world = ground();
        let probe = probe(&world);
        let mut location = Vec3::new(0.0, 88.0 + 4.0, 0.0);

        let mut floor = probe.find_floor(location, true, None);
        assert!(floor.is_walkable_floor());
        assert!(!floor.line_trace);
        assert!(floor.floor_dist > MAX_FLOOR_DIST);

        assert!(probe.adjust_floor_height(&mut location, &mut floor));
        assert!(
            (MIN_FLOOR_DIST..=MAX_FLOOR_DIST).contains(&floor.floor_dist),
            "tracked floor dist {}",
            floor.floor_dist
        );

        let fresh = probe.find_floor(location, true, None);
        assert!(fresh.is_walkable_floor());
        assert!(
            (MIN_FLOOR_DIST..=MAX_FLOOR_DIST).contains(&fresh.floor_dist),
            "measured floor dist {}",
            fresh.floor_dist
        );
    }

    #[test]
    fn cached_sweep_and_full_probe_agree() {
        let world = ground();
        let probe = probe(&world);
        let start = Vec3::new(5.0, 120.0, -3.0);
        let capsule = probe.capsule;
        let sweep = world
            .sweep_capsule(start, start - Vec3::y() * 100.0, &capsule)
            .unwrap();
        let location = sweep.location;

        let cached = probe.compute_floor_dist(location, 10.0, 10.0, capsule.radius, Some(&sweep));
        let full = probe.compute_floor_dist(location, 10.0, 10.0, capsule.radius, None);
        assert_eq!(cached.walkable_floor, full.walkable_floor);
        assert!(cached.walkable_floor);
    }

    #[test]
    fn probe_that_misses_reports_sweep_distance() {
        let world = ground();
        let probe = probe(&world);
        let floor = probe.compute_floor_dist(Vec3::new(0.0, 500.0, 0.0), 10.0, 20.0, 34.0, None);
        assert!(!floor.blocking_hit);
        assert!(!floor.is_walkable_floor());
        assert_eq!(floor.floor_dist, 20.0);
    }

    #[test]
    fn walkable_threshold_is_monotonic() {
        let walkable_y = MovementSettings::default().walkable_floor_y();
        let overrides = [
            WalkableSlopeOverride::Default,
            WalkableSlopeOverride::Increase(0.0),
            WalkableSlopeOverride::Decrease(0.2),
            WalkableSlopeOverride::Unwalkable,
        ];

        for i in 0..=20 {
            let y = walkable_y + (1.0 - walkable_y) * i as f32 / 20.0;
            let n = Vec3::new((1.0 - y * y).max(0.0).sqrt(), y, 0.0);
            assert!(is_walkable(&synthetic_hit(n, WalkableSlopeOverride::Default), walkable_y));
        }

        for i in 0..=20 {
            let y = -(i as f32) / 20.0;
            let n = Vec3::new((1.0 - y * y).max(0.0).sqrt(), y, 0.0);
            for ov in overrides {
                assert!(!is_walkable(&synthetic_hit(n, ov), walkable_y));
            }
        }
    }

    #[test]
    fn vertical_faces_are_never_walkable() {
        let wall = Vec3::new(1.0, 0.0, 0.0);
        assert!(!is_walkable(&synthetic_hit(wall, WalkableSlopeOverride::Increase(0.0)), 0.0));
    }

    #[test]
    fn unwalkable_override_rejects_flat_ground() {
        let up = Vec3::new(0.0, 1.0, 0.0);
        assert!(!is_walkable(&synthetic_hit(up, WalkableSlopeOverride::Unwalkable), 0.71));
    }

    #[test]
    fn edge_tolerance_uses_reduced_radius() {
        let center = Vec3::new(0.0, 50.0, 0.0);
        assert!(is_within_edge_tolerance(&center, &Vec3::new(33.0, 0.0, 0.0), 34.0));
        assert!(!is_within_edge_tolerance(&center, &Vec3::new(33.9, 0.0, 0.0), 34.0));
        // Tiny capsules never drop below the reject distance itself.
        assert!(is_within_edge_tolerance(&center, &Vec3::new(0.1, 0.0, 0.0), 0.05));
    }

    #[test]
    fn perch_is_only_considered_outside_the_perch_radius() {
        let world = ground();
        let mut probe = probe(&world);
        let up = Vec3::new(0.0, 1.0, 0.0);
        let mut hit = synthetic_hit(up, WalkableSlopeOverride::Default);

        // Threshold at or under the reject distance disables perching.
        assert!(!probe.should_compute_perch_result(&hit, true));

        probe.perch_radius_threshold = 10.0;
        assert_eq!(probe.get_valid_perch_radius(), 24.0);
        hit.impact_point = Vec3::new(20.0, 0.0, 0.0);
        assert!(!probe.should_compute_perch_result(&hit, true));
        hit.impact_point = Vec3::new(30.0, 0.0, 0.0);
        assert!(probe.should_compute_perch_result(&hit, true));
    }

    #[test]
    fn perch_probe_finds_flat_ground_under_narrow_capsule() {
        let world = ground();
        let mut probe = probe(&world);
        probe.perch_radius_threshold = 10.0;
        let mut hit = synthetic_hit(Vec3::new(0.0, 1.0, 0.0), WalkableSlopeOverride::Default);
        hit.location = Vec3::new(0.0, 90.0, 0.0);
        hit.impact_point = Vec3::new(30.0, 0.0, 0.0);

        let perch = probe
            .compute_perch_result(probe.get_valid_perch_radius(), &hit, 40.0)
            .expect("ground is reachable");
        assert!(perch.is_walkable_floor());
    }

    #[test]
    fn ledge_box_reports_its_top_as_floor() {
        let mut world = ground();
        world.add_shape(StaticShape::Cuboid {
            half_extents: Vec3::new(100.0, 20.0, 100.0),
            transform: Transform::from_translation(Vec3::new(0.0, 20.0, 0.0)),
        });
        let probe = probe(&world);
        let floor = probe.find_floor(Vec3::new(0.0, 40.0 + 88.0 + 2.0, 0.0), true, None);
        assert!(floor.is_walkable_floor());
        assert_eq!(floor.hit.map(|h| h.surface), Some(SurfaceId(1)));
    }
}
