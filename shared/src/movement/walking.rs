use log::{debug, trace};

use super::sweep::{hit_time, is_valid_blocking};
use super::{CharacterMovement, MoveTransaction, MovementContext, MovementMode, StepDownResult};
use crate::collision::{HitResult, SceneQuery, SurfaceId, Vec3};
use crate::constants::{KINDA_SMALL, MAX_FLOOR_DIST, MAX_STEP_SIDE_Y, MIN_FLOOR_DIST, MIN_TICK_TIME};
use crate::floor::{is_within_edge_tolerance, FloorResult};
use crate::utils::{horizontal, is_nearly_zero, safe_normal, size_2d};

const GRAVITY_DIR: Vec3 = Vec3::new(0.0, -1.0, 0.0);

impl CharacterMovement {
    pub(crate) fn phys_walking(&mut self, dt: f32, iterations: u32, ctx: &mut MovementContext<'_>) {
        if dt < MIN_TICK_TIME {
            return;
        }
        let scene = ctx.scene;
        if !self.settings.can_walk {
            self.acceleration = Vec3::zeros();
            self.velocity = Vec3::zeros();
            return;
        }

        self.just_teleported = false;
        let mut checked_fall = false;
        let mut tried_ledge_move = false;
        let mut remaining = dt;
        let mut iterations = iterations;

        while remaining >= MIN_TICK_TIME
            && iterations < self.settings.max_simulation_iterations
            && self.movement_mode == MovementMode::Walking
        {
            iterations += 1;
            self.just_teleported = false;
            let time_tick = self.get_simulation_time_step(remaining, iterations);
            remaining -= time_tick;

            let old_base = self.base;
            let old_location = self.location;
            let old_floor = self.current_floor;

            self.restore_pre_additive_root_motion_velocity();
            self.maintain_horizontal_ground_velocity();
            let old_velocity = self.velocity;
            self.acceleration.y = 0.0;

            if !self.root_motion_overrides_velocity() {
                let braking = self.get_max_braking_deceleration();
                self.calc_velocity(time_tick, self.settings.ground_friction, false, braking);
                self.calc_avoidance_velocity(time_tick, ctx);
            }
            self.apply_root_motion_to_velocity(time_tick, scene);

            if self.is_falling() {
                // Root motion lifted us off.
                self.start_new_physics(remaining + time_tick, iterations - 1, ctx);
                return;
            }

            let move_velocity = self.velocity;
            let delta = move_velocity * time_tick;
            let zero_delta = is_nearly_zero(&delta);
            let mut step_down = StepDownResult::default();

            if zero_delta {
                remaining = 0.0;
            } else {
                self.move_along_floor(move_velocity, time_tick, &mut step_down, scene);

                if self.is_falling() {
                    let desired_dist = delta.norm();
                    if desired_dist > KINDA_SMALL {
                        let actual_dist = size_2d(&(self.location - old_location));
                        remaining += time_tick * (1.0 - (actual_dist / desired_dist).min(1.0));
                    }
                    self.start_new_physics(remaining, iterations, ctx);
                    return;
                } else if self.is_swimming() {
                    self.start_swimming(old_location, old_velocity, time_tick, remaining, iterations, ctx);
                    return;
                }
            }

            // Step-up may already have probed the floor.
            self.current_floor = if step_down.computed_floor {
                step_down.floor
            } else {
                self.find_floor(self.location, zero_delta, None, scene)
            };

            let check_ledges = !self.can_walk_off_ledges();
            if check_ledges && !self.current_floor.is_walkable_floor() {
                let new_delta = if tried_ledge_move {
                    Vec3::zeros()
                } else {
                    self.get_ledge_move(old_location, delta, GRAVITY_DIR, scene)
                };
                if new_delta != Vec3::zeros() {
                    self.revert_move(old_location, old_base, old_floor, false, scene);
                    tried_ledge_move = true;
                    self.velocity = new_delta / time_tick;
                    remaining += time_tick;
                    continue;
                }

                let must_jump = zero_delta || old_base.is_none();
                if (must_jump || !checked_fall)
                    && self.check_fall(delta, old_location, remaining, time_tick, iterations, must_jump, ctx)
                {
                    return;
                }
                checked_fall = true;

                self.revert_move(old_location, old_base, old_floor, true, scene);
                break;
            }

            if self.current_floor.is_walkable_floor() {
                self.adjust_floor_height(scene);
                self.set_base_from_floor(scene);
            } else if remaining <= 0.0 {
                if let Some(mut hit) = self.current_floor.hit.filter(|h| h.start_penetrating) {
                    // Pop out of the floor instead of sweeping down again.
                    hit.trace_end = hit.trace_start + Vec3::new(0.0, MAX_FLOOR_DIST, 0.0);
                    let adjustment = self.get_penetration_adjustment(&hit);
                    let rotation = self.rotation;
                    self.resolve_penetration(adjustment, &hit, rotation, scene);
                    self.force_next_floor_check = true;
                }
            }

            if self.is_swimming() {
                let velocity = self.velocity;
                self.start_swimming(old_location, velocity, time_tick, remaining, iterations, ctx);
                return;
            }

            let floor_penetrating = self.current_floor.hit.is_some_and(|h| h.start_penetrating);
            if !self.current_floor.is_walkable_floor() && !floor_penetrating {
                let must_jump = self.just_teleported || zero_delta || old_base.is_none();
                if (must_jump || !checked_fall)
                    && self.check_fall(delta, old_location, remaining, time_tick, iterations, must_jump, ctx)
                {
                    return;
                }
                checked_fall = true;
            }

            if self.is_moving_on_ground()
                && !self.just_teleported
                && !self.root_motion_overrides_velocity()
                && time_tick >= MIN_TICK_TIME
            {
                // Velocity is what we actually moved.
                self.velocity = (self.location - old_location) / time_tick;
                self.maintain_horizontal_ground_velocity();
            }

            if self.location == old_location {
                // Stuck; later iterations would be too.
                break;
            }
        }

        if self.is_moving_on_ground() {
            self.maintain_horizontal_ground_velocity();
        }
    }

    /// Move along the current floor, stepping up barriers and sliding along walls.
    pub fn move_along_floor(
        &mut self,
        in_velocity: Vec3,
        dt: f32,
        out_step_down: &mut StepDownResult,
        scene: &dyn SceneQuery,
    ) {
        if !self.current_floor.is_walkable_floor() {
            return;
        }

        let delta = horizontal(&in_velocity) * dt;
        let floor_hit = self.current_floor.hit;
        let ramp_vector = self.compute_ground_movement_delta(delta, floor_hit.as_ref(), self.current_floor.line_trace);
        let rotation = self.rotation;
        let mut hit = self.safe_move_updated_component(ramp_vector, rotation, true, scene);

        if let Some(stuck) = hit.filter(|h| h.start_penetrating) {
            // Deflect off it rather than hitch for the rest of the update.
            self.slide_along_surface(delta, 1.0, stuck.normal, &mut hit, scene);
            if hit.is_some_and(|h| h.start_penetrating) {
                debug!("movement: stuck in geometry while walking at {:?}", self.location);
            }
            return;
        }

        if !is_valid_blocking(&hit) {
            return;
        }

        let mut percent_time_applied = hit_time(&hit);
        if let Some(ramp) = hit {
            if ramp.time > 0.0 && ramp.normal.y > KINDA_SMALL && self.is_walkable(&ramp) {
                // Another walkable ramp.
                let initial_percent_remaining = 1.0 - percent_time_applied;
                let ramp_vector = self.compute_ground_movement_delta(delta * initial_percent_remaining, Some(&ramp), false);
                hit = self.safe_move_updated_component(ramp_vector, rotation, true, scene);
                let second_hit_percent = hit_time(&hit) * initial_percent_remaining;
                percent_time_applied = (percent_time_applied + second_hit_percent).clamp(0.0, 1.0);
            }
        }

        let Some(barrier) = hit.filter(HitResult::is_valid_blocking_hit) else {
            return;
        };

        if self.can_step_up(&barrier) {
            let pre_step_up_location = self.location;
            let remaining_delta = delta * (1.0 - percent_time_applied);
            if !self.step_up(GRAVITY_DIR, remaining_delta, &barrier, Some(out_step_down), scene) {
                trace!("movement: step up failed at {:?}", barrier.impact_point);
                self.slide_along_surface(delta, 1.0 - percent_time_applied, barrier.normal, &mut hit, scene);
            } else {
                trace!("movement: stepped up to {:?}", self.location);
                if !self.settings.maintain_horizontal_ground_velocity {
                    // Velocity must not pick up the step height.
                    self.just_teleported = true;
                    let step_up_time_slice = (1.0 - percent_time_applied) * dt;
                    if !self.root_motion_overrides_velocity() && step_up_time_slice >= KINDA_SMALL {
                        self.velocity = (self.location - pre_step_up_location) / step_up_time_slice;
                        self.velocity.y = 0.0;
                    }
                }
            }
        } else {
            self.slide_along_surface(delta, 1.0 - percent_time_applied, barrier.normal, &mut hit, scene);
        }
    }

    /// Project a horizontal move onto a walkable ramp.
    pub fn compute_ground_movement_delta(
        &self,
        delta: Vec3,
        ramp_hit: Option<&HitResult>,
        hit_from_line_trace: bool,
    ) -> Vec3 {
        let Some(hit) = ramp_hit else {
            return delta;
        };
        let floor_normal = hit.impact_normal;
        let contact_normal = hit.normal;

        if floor_normal.y < 1.0 - KINDA_SMALL
            && floor_normal.y > KINDA_SMALL
            && contact_normal.y > KINDA_SMALL
            && !hit_from_line_trace
            && self.is_walkable(hit)
        {
            let floor_dot_delta = floor_normal.dot(&delta);
            let ramp_movement = Vec3::new(delta.x, -floor_dot_delta / floor_normal.y, delta.z);
            return if self.settings.maintain_horizontal_ground_velocity {
                ramp_movement
            } else {
                safe_normal(&ramp_movement) * delta.norm()
            };
        }
        delta
    }

    pub fn can_step_up(&self, hit: &HitResult) -> bool {
        hit.is_valid_blocking_hit() && !self.is_falling()
    }

    /// Climb over a low barrier: up by the step height, forward, then back down.
    ///
    /// Every sub-move is rolled back when the step is rejected.
    pub fn step_up(
        &mut self,
        grav_dir: Vec3,
        delta: Vec3,
        in_hit: &HitResult,
        out_step_down: Option<&mut StepDownResult>,
        scene: &dyn SceneQuery,
    ) -> bool {
        let max_step_height = self.settings.max_step_height;
        if !self.can_step_up(in_hit) || max_step_height <= 0.0 || grav_dir == Vec3::zeros() {
            return false;
        }

        let old_location = self.location;
        let radius = self.capsule.radius;
        let half_height = self.capsule.half_height;

        // Top of the capsule is touching.
        let initial_impact_y = in_hit.impact_point.y;
        if initial_impact_y > old_location.y + (half_height - radius) {
            return false;
        }

        let mut step_travel_up_height = max_step_height;
        let mut step_travel_down_height = step_travel_up_height;
        let step_side_y = -in_hit.impact_normal.dot(&grav_dir);
        let mut pawn_initial_floor_base_y = old_location.y - half_height;
        let mut pawn_floor_point_y = pawn_initial_floor_base_y;

        if self.is_moving_on_ground() && self.current_floor.is_walkable_floor() {
            // Measure the step from the floor, not from the hover height.
            let floor_dist = self.current_floor.get_distance_to_floor().max(0.0);
            pawn_initial_floor_base_y -= floor_dist;
            step_travel_up_height = (step_travel_up_height - floor_dist).max(0.0);
            step_travel_down_height = max_step_height + MAX_FLOOR_DIST * 2.0;

            let hit_vertical_face = !is_within_edge_tolerance(&in_hit.location, &in_hit.impact_point, radius);
            match self.current_floor.hit {
                Some(floor_hit) if !self.current_floor.line_trace && !hit_vertical_face => {
                    pawn_floor_point_y = floor_hit.impact_point.y;
                }
                _ => pawn_floor_point_y -= self.current_floor.floor_dist,
            }
        }

        // Impact is below us.
        if initial_impact_y <= pawn_initial_floor_base_y {
            return false;
        }

        let transaction = MoveTransaction::begin(self);
        let rotation = self.rotation;

        let sweep_up = self.move_updated_component(-grav_dir * step_travel_up_height, rotation, true, scene);
        if sweep_up.is_some_and(|h| h.start_penetrating) {
            transaction.revert(self);
            return false;
        }

        let mut hit = self.move_updated_component(delta, rotation, true, scene);
        if let Some(forward) = hit {
            if forward.start_penetrating {
                transaction.revert(self);
                return false;
            }
            if self.is_falling() {
                transaction.commit();
                return true;
            }

            let forward_hit_time = forward.time;
            let forward_slide_amount =
                self.slide_along_surface(delta, 1.0 - forward.time, forward.normal, &mut hit, scene);

            if self.is_falling() {
                transaction.revert(self);
                return false;
            }
            // Neither the forward move nor the slide got anywhere.
            if forward_hit_time == 0.0 && forward_slide_amount == 0.0 {
                transaction.revert(self);
                return false;
            }
        }

        let rotation = self.rotation;
        let down = self.move_updated_component(grav_dir * step_travel_down_height, rotation, true, scene);
        if down.is_some_and(|h| h.start_penetrating) {
            transaction.revert(self);
            return false;
        }

        let mut step_down_result = StepDownResult::default();
        if let Some(down_hit) = down.filter(HitResult::is_valid_blocking_hit) {
            let delta_y = down_hit.impact_point.y - pawn_floor_point_y;
            if delta_y > max_step_height {
                trace!("movement: step up rejected, too high ({delta_y:.2})");
                transaction.revert(self);
                return false;
            }

            if !self.is_walkable(&down_hit) {
                let normal_towards_me = delta.dot(&down_hit.impact_normal) < 0.0;
                if normal_towards_me {
                    trace!("movement: step up rejected, unwalkable normal opposes the move");
                    transaction.revert(self);
                    return false;
                }
                // Sliding off an unwalkable surface below is fine; ending up higher is not.
                if down_hit.location.y > old_location.y {
                    trace!("movement: step up rejected, unwalkable surface above start");
                    transaction.revert(self);
                    return false;
                }
            }

            if !is_within_edge_tolerance(&down_hit.location, &down_hit.impact_point, radius) {
                trace!("movement: step up rejected, outside edge tolerance");
                transaction.revert(self);
                return false;
            }

            if delta_y > 0.0 && !self.can_step_up(&down_hit) {
                transaction.revert(self);
                return false;
            }

            if out_step_down.is_some() {
                let floor = self.find_floor(self.location, false, Some(&down_hit), scene);
                // A real step we cannot perch on: slide along it instead.
                if down_hit.location.y > old_location.y && !floor.blocking_hit && step_side_y < MAX_STEP_SIDE_Y {
                    transaction.revert(self);
                    return false;
                }
                step_down_result = StepDownResult {
                    computed_floor: true,
                    floor,
                };
            }
        }

        if let Some(out) = out_step_down {
            *out = step_down_result;
        }
        transaction.commit();

        self.just_teleported |= !self.settings.maintain_horizontal_ground_velocity;
        true
    }

    pub fn can_walk_off_ledges(&self) -> bool {
        if !self.settings.can_walk_off_ledges_when_crouching && self.is_crouched {
            return false;
        }
        self.settings.can_walk_off_ledges
    }

    /// True when stepping sideways by `side_step` from `old_location` keeps us on walkable ground.
    pub fn check_ledge_direction(
        &self,
        old_location: Vec3,
        side_step: Vec3,
        grav_dir: Vec3,
        scene: &dyn SceneQuery,
    ) -> bool {
        let side_dest = old_location + side_step;
        let mut hit = scene.sweep_capsule(old_location, side_dest, &self.capsule);

        if hit.is_some_and(|h| !self.is_walkable(&h)) {
            return false;
        }
        if hit.is_none() {
            let down = grav_dir * (self.settings.max_step_height + self.settings.ledge_check_threshold);
            hit = scene.sweep_capsule(side_dest, side_dest + down, &self.capsule);
        }
        hit.is_some_and(|h| h.time < 1.0 && self.is_walkable(&h))
    }

    /// Sideways move that avoids walking off a ledge, or zero when there is none.
    pub fn get_ledge_move(&self, old_location: Vec3, delta: Vec3, grav_dir: Vec3, scene: &dyn SceneQuery) -> Vec3 {
        if delta == Vec3::zeros() {
            return Vec3::zeros();
        }
        let mut side_dir = Vec3::new(delta.z, 0.0, -delta.x);

        if self.check_ledge_direction(old_location, side_dir, grav_dir, scene) {
            return side_dir;
        }
        side_dir = -side_dir;
        if self.check_ledge_direction(old_location, side_dir, grav_dir, scene) {
            return side_dir;
        }
        Vec3::zeros()
    }

    /// Start falling when allowed to leave the floor. Returns true when physics was handed off.
    pub fn check_fall(
        &mut self,
        delta: Vec3,
        old_location: Vec3,
        remaining: f32,
        time_tick: f32,
        iterations: u32,
        must_jump: bool,
        ctx: &mut MovementContext<'_>,
    ) -> bool {
        if must_jump || self.can_walk_off_ledges() {
            if self.is_moving_on_ground() {
                self.start_falling(iterations, remaining, time_tick, delta, old_location, ctx);
            }
            return true;
        }
        false
    }

    /// Switch to falling and continue with the unused part of the sub-step.
    pub fn start_falling(
        &mut self,
        iterations: u32,
        remaining: f32,
        time_tick: f32,
        delta: Vec3,
        sub_location: Vec3,
        ctx: &mut MovementContext<'_>,
    ) {
        let desired_dist = delta.norm();
        let actual_dist = size_2d(&(self.location - sub_location));
        let remaining = if desired_dist < KINDA_SMALL {
            0.0
        } else {
            remaining + time_tick * (1.0 - (actual_dist / desired_dist).min(1.0))
        };

        if self.is_moving_on_ground() {
            trace!("movement: walked off ledge at {:?}", self.location);
            self.set_movement_mode(MovementMode::Falling, ctx.scene);
        }
        self.start_new_physics(remaining, iterations, ctx);
    }

    /// Undo a walking sub-step.
    pub fn revert_move(
        &mut self,
        old_location: Vec3,
        old_base: Option<SurfaceId>,
        old_floor: FloorResult,
        fail_move: bool,
        scene: &dyn SceneQuery,
    ) {
        self.location = old_location;
        self.just_teleported = false;

        // A base that cannot have moved is still valid, and so is its floor.
        let base_unchanged = old_base.is_some_and(|b| {
            !scene.is_dynamic_base(b) || (Some(b) == self.base && scene.base_transform(b) == self.old_base_transform)
        });
        if base_unchanged {
            self.current_floor = old_floor;
            self.set_base(old_base, scene);
        } else {
            self.set_base(None, scene);
        }

        if fail_move {
            self.velocity = Vec3::zeros();
            self.acceleration = Vec3::zeros();
        }
    }

    /// Walking projected onto the ground below by a line trace, without sweeping.
    pub(crate) fn phys_nav_walking(&mut self, dt: f32, iterations: u32, ctx: &mut MovementContext<'_>) {
        if dt < MIN_TICK_TIME {
            return;
        }
        let scene = ctx.scene;

        self.restore_pre_additive_root_motion_velocity();
        self.maintain_horizontal_ground_velocity();
        self.acceleration.y = 0.0;

        if !self.root_motion_overrides_velocity() {
            let braking = self.get_max_braking_deceleration();
            self.calc_velocity(dt, self.settings.ground_friction, false, braking);
            self.calc_avoidance_velocity(dt, ctx);
        }
        self.apply_root_motion_to_velocity(dt, scene);

        if self.is_falling() {
            self.start_new_physics(dt, iterations, ctx);
            return;
        }
        let iterations = iterations + 1;

        let old_location = self.location;
        let delta_move = horizontal(&self.velocity) * dt;
        let dest = self.get_actor_feet_location() + delta_move;

        let Some(ground) = self.find_nav_floor(dest, scene) else {
            debug!("movement: no nav floor under {:?}", dest);
            self.start_falling(iterations, dt, dt, delta_move, old_location, ctx);
            return;
        };

        let hover = (MIN_FLOOR_DIST + MAX_FLOOR_DIST) * 0.5;
        let new_location = Vec3::new(dest.x, ground.impact_point.y + hover + self.capsule.half_height, dest.z);
        let adjusted = new_location - old_location;
        if !is_nearly_zero(&adjusted) {
            let rotation = self.rotation;
            self.safe_move_updated_component(adjusted, rotation, false, scene);
        }
        self.current_floor = FloorResult {
            blocking_hit: true,
            walkable_floor: true,
            line_trace: true,
            floor_dist: hover,
            line_dist: hover,
            hit: Some(ground),
        };

        if !self.just_teleported && !self.has_anim_root_motion() && !self.current_root_motion.has_velocity() {
            self.velocity = (self.location - old_location) / dt;
            self.maintain_horizontal_ground_velocity();
        }
        self.just_teleported = false;
    }

    /// Ground point under `feet`, searched within the nav walking trace band.
    pub fn find_nav_floor(&self, feet: Vec3, scene: &dyn SceneQuery) -> Option<HitResult> {
        let start = feet + Vec3::new(0.0, self.settings.nav_walking_floor_trace_up, 0.0);
        let end = feet - Vec3::new(0.0, self.settings.nav_walking_floor_trace_down, 0.0);
        scene
            .line_trace(start, end)
            .filter(|h| h.is_valid_blocking_hit() && self.is_walkable(h))
    }
}
