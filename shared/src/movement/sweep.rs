use log::{debug, trace};

use super::{CharacterMovement, MovementMode};
use crate::collision::{HitResult, Quat, SceneQuery, SurfaceId, Vec3};
use crate::constants::{KINDA_SMALL, MIN_FLOOR_DIST, PENETRATION_PULLBACK};
use crate::floor::FloorResult;
use crate::utils::{clamp_max_size, is_nearly_zero, safe_normal, safe_normal_2d, vector_plane_project};

/// Fraction of the requested move completed by a sweep; 1 when nothing was hit.
#[inline]
pub(crate) fn hit_time(hit: &Option<HitResult>) -> f32 {
    hit.as_ref().map_or(1.0, |h| h.time)
}

#[inline]
pub(crate) fn is_valid_blocking(hit: &Option<HitResult>) -> bool {
    hit.as_ref().is_some_and(HitResult::is_valid_blocking_hit)
}

#[inline]
pub(crate) fn is_start_penetrating(hit: &Option<HitResult>) -> bool {
    hit.as_ref().is_some_and(|h| h.start_penetrating)
}

/// Snapshot of the character pose taken before a tentative multi-part move.
///
/// Either [`MoveTransaction::commit`] keeps everything done since the snapshot or
/// [`MoveTransaction::revert`] puts the pose back as if nothing happened.
#[must_use = "a transaction must be committed or reverted"]
#[derive(Clone, Copy, Debug)]
pub struct MoveTransaction {
    location: Vec3,
    rotation: Quat,
    floor: FloorResult,
    base: Option<SurfaceId>,
    just_teleported: bool,
}

impl MoveTransaction {
    pub fn begin(character: &CharacterMovement) -> Self {
        Self {
            location: character.location,
            rotation: character.rotation,
            floor: character.current_floor,
            base: character.base,
            just_teleported: character.just_teleported,
        }
    }

    pub fn commit(self) {}

    pub fn revert(self, character: &mut CharacterMovement) {
        character.location = self.location;
        character.rotation = self.rotation;
        character.current_floor = self.floor;
        character.base = self.base;
        character.just_teleported = self.just_teleported;
    }
}

impl CharacterMovement {
    /// Move the capsule by `delta`, stopping at the first blocking hit when sweeping.
    pub fn move_updated_component(
        &mut self,
        delta: Vec3,
        new_rotation: Quat,
        sweep: bool,
        scene: &dyn SceneQuery,
    ) -> Option<HitResult> {
        self.rotation = new_rotation;
        if is_nearly_zero(&delta) {
            return None;
        }

        let hit = if sweep {
            let end = self.location + delta;
            let hit = scene.sweep_capsule(self.location, end, &self.capsule);
            match &hit {
                None => self.location = end,
                Some(h) if !h.start_penetrating => self.location = h.location,
                Some(_) => {}
            }
            hit
        } else {
            self.location += delta;
            None
        };

        self.update_physics_volume(scene);
        hit
    }

    /// [`move_updated_component`](Self::move_updated_component) that first tries to pop
    /// out of an initial overlap and then retries the move once.
    pub fn safe_move_updated_component(
        &mut self,
        delta: Vec3,
        new_rotation: Quat,
        sweep: bool,
        scene: &dyn SceneQuery,
    ) -> Option<HitResult> {
        let mut hit = self.move_updated_component(delta, new_rotation, sweep, scene);

        if let Some(stuck) = hit.filter(|h| h.start_penetrating) {
            let adjustment = self.get_penetration_adjustment(&stuck);
            if self.resolve_penetration(adjustment, &stuck, new_rotation, scene) {
                hit = self.move_updated_component(delta, new_rotation, sweep, scene);
            }
        }
        hit
    }

    /// Push-out vector for a penetrating hit, limited by the depenetration cap.
    pub fn get_penetration_adjustment(&self, hit: &HitResult) -> Vec3 {
        if !hit.start_penetrating {
            return Vec3::zeros();
        }
        let depth = if hit.penetration_depth > 0.0 {
            hit.penetration_depth
        } else {
            PENETRATION_PULLBACK
        };
        let result = hit.normal * (depth + PENETRATION_PULLBACK);
        clamp_max_size(&result, self.settings.max_depenetration)
    }

    /// Try to move out of penetration. Returns true when the capsule moved.
    pub fn resolve_penetration(
        &mut self,
        adjustment: Vec3,
        hit: &HitResult,
        new_rotation: Quat,
        scene: &dyn SceneQuery,
    ) -> bool {
        if adjustment == Vec3::zeros() {
            return false;
        }

        if !scene.overlap_capsule(hit.trace_start + adjustment, &self.capsule) {
            // Free spot; teleport there.
            self.location = hit.trace_start + adjustment;
            self.rotation = new_rotation;
            self.update_physics_volume(scene);
            self.just_teleported = true;
            trace!("movement: depenetrated by {:?}", adjustment);
            return true;
        }

        let moved_ok = |h: &Option<HitResult>| !is_start_penetrating(h);

        let sweep_out = self.move_updated_component(adjustment, new_rotation, true, scene);
        let mut moved = moved_ok(&sweep_out);

        if let Some(second) = sweep_out.filter(|h| h.start_penetrating) {
            // Combine both push-outs to escape two surfaces at once.
            let second_mtd = self.get_penetration_adjustment(&second);
            let combined = adjustment + second_mtd;
            if second_mtd != adjustment && combined != Vec3::zeros() {
                let h = self.move_updated_component(combined, new_rotation, true, scene);
                moved = moved_ok(&h);
            }
        }

        if !moved {
            let move_delta = hit.trace_end - hit.trace_start;
            if move_delta != Vec3::zeros() {
                let h = self.move_updated_component(adjustment + move_delta, new_rotation, true, scene);
                moved = moved_ok(&h);
            }
        }

        if !moved {
            debug!(
                "movement: stuck in geometry at {:?} (depth {:.3})",
                self.location, hit.penetration_depth
            );
        }
        self.just_teleported |= moved;
        moved
    }

    /// Slide `delta` along the plane of `normal`, scaled by the remaining `time`.
    pub fn compute_slide_vector(&self, delta: Vec3, time: f32, normal: &Vec3, hit: &HitResult) -> Vec3 {
        let result = vector_plane_project(&delta, normal) * time;
        if self.movement_mode == MovementMode::Falling {
            self.handle_slope_boosting(result, delta, time, normal, hit)
        } else {
            result
        }
    }

    /// Keep a slide from gaining more height than the move asked for.
    pub fn handle_slope_boosting(
        &self,
        slide_result: Vec3,
        delta: Vec3,
        time: f32,
        normal: &Vec3,
        _hit: &HitResult,
    ) -> Vec3 {
        let mut result = slide_result;
        if result.y > 0.0 {
            let y_limit = delta.y * time;
            if result.y - y_limit > KINDA_SMALL {
                if y_limit > 0.0 {
                    // Rescale the whole vector so the direction holds.
                    result *= y_limit / result.y;
                } else {
                    result = Vec3::zeros();
                }

                // The rest goes horizontally along the surface.
                let remainder = slide_result - result;
                let remainder_xz = Vec3::new(remainder.x, 0.0, remainder.z);
                let normal_xz = safe_normal_2d(normal);
                result += vector_plane_project(&remainder_xz, &normal_xz);
            }
        }
        result
    }

    /// Redirect a slide that hit a second surface.
    pub fn two_wall_adjust(&self, delta: &mut Vec3, hit: &HitResult, old_hit_normal: &Vec3) {
        let in_delta = *delta;
        let hit_normal = hit.normal;

        if old_hit_normal.dot(&hit_normal) <= 0.0 {
            // Corner of 90 degrees or less: move along the crease.
            let desired = *delta;
            let crease = safe_normal(&hit_normal.cross(old_hit_normal));
            *delta = crease * delta.dot(&crease) * (1.0 - hit.time);
            if desired.dot(delta) < 0.0 {
                *delta = -*delta;
            }
        } else {
            let desired = *delta;
            *delta = self.compute_slide_vector(*delta, 1.0 - hit.time, &hit_normal, hit);
            if delta.dot(&desired) <= 0.0 {
                *delta = Vec3::zeros();
            } else if (hit_normal.dot(old_hit_normal) - 1.0).abs() < KINDA_SMALL {
                // Same wall again; nudge away to break the tie.
                *delta += hit_normal * 0.01;
            }
        }

        if self.is_moving_on_ground() {
            if delta.y > 0.0 {
                // Slide up walkable surfaces only; everything else is a vertical barrier.
                let walkable_floor_y = self.settings.walkable_floor_y();
                if (hit.normal.y >= walkable_floor_y || self.is_walkable(hit))
                    && hit.normal.y > KINDA_SMALL
                {
                    let time = 1.0 - hit.time;
                    let scaled = safe_normal(delta) * in_delta.norm();
                    *delta = Vec3::new(in_delta.x, scaled.y / hit.normal.y, in_delta.z) * time;
                    if delta.y > self.settings.max_step_height {
                        *delta *= self.settings.max_step_height / delta.y;
                    }
                } else {
                    delta.y = 0.0;
                }
            } else if delta.y < 0.0
                && self.current_floor.floor_dist < MIN_FLOOR_DIST
                && self.current_floor.blocking_hit
            {
                delta.y = 0.0;
            }
        }
    }

    /// Slide along the surface that blocked a move, trying a second surface once.
    ///
    /// Returns the fraction of `delta` that was applied.
    pub fn slide_along_surface(
        &mut self,
        delta: Vec3,
        time: f32,
        in_normal: Vec3,
        hit: &mut Option<HitResult>,
        scene: &dyn SceneQuery,
    ) -> f32 {
        let Some(first) = *hit else {
            return 0.0;
        };

        let mut normal = in_normal;
        if self.is_moving_on_ground() {
            if normal.y > 0.0 {
                // Never get pushed up an unwalkable surface.
                if !self.is_walkable(&first) {
                    normal = safe_normal_2d(&normal);
                }
            } else if normal.y < -KINDA_SMALL {
                // Impacts on the upper capsule must not push us into the floor.
                if self.current_floor.floor_dist < MIN_FLOOR_DIST && self.current_floor.blocking_hit {
                    if let Some(floor_hit) = self.current_floor.hit {
                        let floor_normal = floor_hit.normal;
                        let opposed = delta.dot(&floor_normal) < 0.0 && floor_normal.y < 1.0 - 1e-5;
                        if opposed {
                            normal = floor_normal;
                        }
                    }
                    normal = safe_normal_2d(&normal);
                }
            }
        }

        let old_hit_normal = normal;
        let mut slide_delta = self.compute_slide_vector(delta, time, &normal, &first);
        if slide_delta.dot(&delta) <= 0.0 {
            return 0.0;
        }

        let rotation = self.rotation;
        *hit = self.safe_move_updated_component(slide_delta, rotation, true, scene);
        let first_hit_percent = hit_time(hit);
        let mut percent_applied = first_hit_percent;

        if let Some(second) = hit.filter(HitResult::is_valid_blocking_hit) {
            self.two_wall_adjust(&mut slide_delta, &second, &old_hit_normal);

            // Only if significant and not back against the original move.
            let significant = slide_delta.norm_squared() > 1e-6;
            if significant && slide_delta.dot(&delta) > 0.0 {
                *hit = self.safe_move_updated_component(slide_delta, rotation, true, scene);
                percent_applied += hit_time(hit) * (1.0 - first_hit_percent);
            }
        }

        percent_applied.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collision::{CapsuleSpec, StaticShape, StaticWorld};
    use crate::config::MovementSettings;

    fn character_at(location: Vec3) -> CharacterMovement {
        let mut cm = CharacterMovement::new(MovementSettings::default(), CapsuleSpec::new(34.0, 88.0));
        cm.location = location;
        cm
    }

    fn wall_world() -> StaticWorld {
        let mut world = StaticWorld::new();
        // Wall facing -X at x = 100.
        world.add_shape(StaticShape::Plane {
            normal: Vec3::new(-1.0, 0.0, 0.0),
            dist: -100.0,
        });
        world
    }

    #[test]
    fn swept_move_stops_short_of_wall() {
        let world = wall_world();
        let mut cm = character_at(Vec3::new(0.0, 200.0, 0.0));
        let rotation = cm.rotation;
        let hit = cm.safe_move_updated_component(Vec3::new(200.0, 0.0, 0.0), rotation, true, &world);
        let hit = hit.expect("wall should block");
        assert!(hit.is_valid_blocking_hit());
        assert!(cm.location.x <= 100.0 - 34.0 + 1e-3);
        assert!(cm.location.x > 100.0 - 34.0 - 1.0);
    }

    #[test]
    fn slide_keeps_tangential_motion_along_wall() {
        let world = wall_world();
        let mut cm = character_at(Vec3::new(0.0, 200.0, 0.0));
        cm.movement_mode = MovementMode::Flying;
        let rotation = cm.rotation;
        let delta = Vec3::new(200.0, 0.0, 50.0);
        let mut hit = cm.safe_move_updated_component(delta, rotation, true, &world);
        let normal = hit.expect("blocked").normal;
        let remaining = 1.0 - hit_time(&hit);
        let applied = cm.slide_along_surface(delta, remaining, normal, &mut hit, &world);
        assert!(applied > 0.0);
        assert!(cm.location.z > 10.0);
        assert!(cm.location.x <= 100.0 - 34.0 + 1e-3);
    }

    #[test]
    fn penetration_is_resolved_before_the_move() {
        let mut world = StaticWorld::new();
        world.add_shape(StaticShape::Plane {
            normal: Vec3::y(),
            dist: 0.0,
        });
        // Capsule bottom 5 units below the ground.
        let mut cm = character_at(Vec3::new(0.0, 83.0, 0.0));
        let rotation = cm.rotation;
        cm.safe_move_updated_component(Vec3::new(10.0, 0.0, 0.0), rotation, true, &world);
        assert!(cm.location.y >= 88.0 - 0.01, "still buried at {:?}", cm.location);
        assert!(cm.just_teleported);
    }

    #[test]
    fn transaction_revert_restores_pose() {
        let mut cm = character_at(Vec3::new(1.0, 2.0, 3.0));
        let txn = MoveTransaction::begin(&cm);
        cm.location = Vec3::new(9.0, 9.0, 9.0);
        cm.just_teleported = true;
        txn.revert(&mut cm);
        assert_eq!(cm.location, Vec3::new(1.0, 2.0, 3.0));
        assert!(!cm.just_teleported);
    }

    #[test]
    fn crease_between_two_walls_keeps_direction() {
        let cm = character_at(Vec3::zeros());
        let mut delta = Vec3::new(10.0, 0.0, 10.0);
        let mut hit = HitResult::penetrating(
            Vec3::zeros(),
            Vec3::zeros(),
            Vec3::new(0.0, 0.0, -1.0),
            0.0,
            Vec3::zeros(),
            SurfaceId(0),
            Default::default(),
        );
        hit.start_penetrating = false;
        hit.time = 0.0;
        // Floor-ish first normal, wall second: crease runs along +X.
        cm.two_wall_adjust(&mut delta, &hit, &Vec3::new(0.0, 1.0, 0.0));
        assert!(delta.x > 0.0);
        assert!(delta.z.abs() < 1e-4);
    }
}
