use log::trace;

use super::{CharacterMovement, MovementContext, MovementMode};
use crate::collision::{HitResult, SceneQuery, Vec3};
use crate::constants::{KINDA_SMALL, MIN_TICK_TIME, VERTICAL_SLOPE_NORMAL_Y};
use crate::floor::is_within_edge_tolerance;
use crate::utils::{clamp_max_size, horizontal, safe_normal, safe_normal_2d, size_squared_2d, vector_plane_project};

/// Times per falling update the sub-step may be cut short to land exactly on the jump apex.
const MAX_JUMP_APEX_ATTEMPTS: u32 = 2;
const APEX_TIME_MINIMUM: f32 = 1.0e-4;

impl CharacterMovement {
    pub(crate) fn phys_falling(&mut self, dt: f32, iterations: u32, ctx: &mut MovementContext<'_>) {
        if dt < MIN_TICK_TIME {
            return;
        }
        let scene = ctx.scene;

        let mut fall_acceleration = self.get_falling_lateral_acceleration(dt);
        fall_acceleration.y = 0.0;
        let has_limited_air_control = size_squared_2d(&fall_acceleration) > 0.0;

        let mut remaining = dt;
        let mut iterations = iterations;
        let mut apex_attempts = 0;

        while remaining >= MIN_TICK_TIME && iterations < self.settings.max_simulation_iterations {
            iterations += 1;
            let mut time_tick = self.get_simulation_time_step(remaining, iterations);
            remaining -= time_tick;

            let old_location = self.location;
            let rotation = self.rotation;
            self.just_teleported = false;

            let old_velocity_with_root_motion = self.velocity;
            self.restore_pre_additive_root_motion_velocity();
            let old_velocity = self.velocity;

            let max_decel = self.get_max_braking_deceleration();
            if !self.root_motion_overrides_velocity() {
                // Lateral input only; gravity is applied below.
                let saved_accel = self.acceleration;
                self.acceleration = fall_acceleration;
                self.velocity.y = 0.0;
                self.calc_velocity(time_tick, self.settings.falling_lateral_friction, false, max_decel);
                self.velocity.y = old_velocity.y;
                self.acceleration = saved_accel;
            }

            let gravity = Vec3::new(0.0, self.get_gravity_y(), 0.0);
            let gravity_time = time_tick;

            // Jump hold time runs out while airborne.
            if self.jump_force_time_remaining > 0.0 {
                let jump_force_time = self.jump_force_time_remaining.min(time_tick);
                self.jump_force_time_remaining -= jump_force_time;
                if self.jump_force_time_remaining <= 0.0 {
                    self.reset_jump_state();
                }
            }

            self.velocity = self.new_fall_velocity(self.velocity, gravity, gravity_time);
            self.apply_root_motion_to_velocity(time_tick, scene);

            // Stop the sub-step exactly at the apex so frame rate does not clip jump height.
            if old_velocity_with_root_motion.y > 0.0 && self.velocity.y <= 0.0 && apex_attempts < MAX_JUMP_APEX_ATTEMPTS {
                let derived_accel = (self.velocity - old_velocity_with_root_motion) / time_tick;
                if derived_accel.y.abs() > KINDA_SMALL {
                    let time_to_apex = -old_velocity_with_root_motion.y / derived_accel.y;
                    if (APEX_TIME_MINIMUM..time_tick).contains(&time_to_apex) {
                        self.velocity = old_velocity_with_root_motion + derived_accel * time_to_apex;
                        self.velocity.y = 0.0;
                        remaining += time_tick - time_to_apex;
                        time_tick = time_to_apex;
                        iterations -= 1;
                        apex_attempts += 1;
                    }
                }
            }

            // Midpoint integration.
            let adjusted = (old_velocity_with_root_motion + self.velocity) * 0.5 * time_tick;
            let mut hit = self.safe_move_updated_component(adjusted, rotation, true, scene);

            let mut last_move_time_slice = time_tick;
            let mut sub_time_tick_remaining = time_tick * (1.0 - hit.map_or(1.0, |h| h.time));

            if self.is_swimming() {
                remaining += sub_time_tick_remaining;
                self.start_swimming(old_location, old_velocity, time_tick, remaining, iterations, ctx);
                return;
            }

            if let Some(first) = hit {
                if self.is_valid_landing_spot(self.location, &first, scene) {
                    remaining += sub_time_tick_remaining;
                    self.process_landed(&first, remaining, iterations, ctx);
                    return;
                }

                // Deflect using the final velocity so the slide keeps the whole gravity step.
                let mut adjusted = self.velocity * time_tick;

                // An edge we clipped may have walkable ground on top of it.
                if !first.start_penetrating && self.should_check_for_valid_landing_spot(&first) {
                    let location = self.location;
                    let floor = self.floor_probe(scene).find_floor(location, false, None);
                    if let Some(floor_hit) = floor.hit.filter(|_| floor.is_walkable_floor()) {
                        if self.is_valid_landing_spot(location, &floor_hit, scene) {
                            remaining += sub_time_tick_remaining;
                            self.process_landed(&floor_hit, remaining, iterations, ctx);
                            return;
                        }
                    }
                }

                if !self.is_falling() {
                    return;
                }

                let mut velocity_no_air_control = old_velocity;
                let mut air_control_accel = self.acceleration;
                if has_limited_air_control {
                    velocity_no_air_control = self.velocity_without_air_control(old_velocity, time_tick, max_decel);
                    velocity_no_air_control = self.new_fall_velocity(velocity_no_air_control, gravity, gravity_time);
                    air_control_accel = (self.velocity - velocity_no_air_control) / time_tick;
                    let air_control_delta_v =
                        self.limit_air_control(last_move_time_slice, air_control_accel, &first, false, scene) * last_move_time_slice;
                    adjusted = (velocity_no_air_control + air_control_delta_v) * last_move_time_slice;
                }

                let old_hit_normal = first.normal;
                let old_hit_impact_normal = first.impact_normal;
                let mut delta = self.compute_slide_vector(adjusted, 1.0 - first.time, &old_hit_normal, &first);

                if sub_time_tick_remaining > KINDA_SMALL && !self.just_teleported {
                    let new_velocity = delta / sub_time_tick_remaining;
                    self.velocity = if self.has_anim_root_motion() {
                        Vec3::new(self.velocity.x, new_velocity.y, self.velocity.z)
                    } else {
                        new_velocity
                    };
                }

                if sub_time_tick_remaining > KINDA_SMALL && delta.dot(&adjusted) > 0.0 {
                    hit = self.safe_move_updated_component(delta, rotation, true, scene);

                    if let Some(second) = hit {
                        // Second wall.
                        last_move_time_slice = sub_time_tick_remaining;
                        sub_time_tick_remaining *= 1.0 - second.time;

                        if self.is_valid_landing_spot(self.location, &second, scene) {
                            remaining += sub_time_tick_remaining;
                            self.process_landed(&second, remaining, iterations, ctx);
                            return;
                        }
                        if !self.is_falling() {
                            return;
                        }

                        // Deflect as if the last move had no air control.
                        if has_limited_air_control && second.normal.y > VERTICAL_SLOPE_NORMAL_Y {
                            let last_move_no_air_control = velocity_no_air_control * last_move_time_slice;
                            delta = self.compute_slide_vector(last_move_no_air_control, 1.0, &old_hit_normal, &second);
                        }

                        self.two_wall_adjust(&mut delta, &second, &old_hit_normal);

                        if has_limited_air_control {
                            let air_control_delta_v = self.limit_air_control(
                                sub_time_tick_remaining,
                                air_control_accel,
                                &second,
                                false,
                                scene,
                            ) * sub_time_tick_remaining;
                            // Never back into the first wall.
                            if air_control_delta_v.dot(&old_hit_normal) > 0.0 {
                                delta += air_control_delta_v * sub_time_tick_remaining;
                            }
                        }

                        if sub_time_tick_remaining > KINDA_SMALL && !self.just_teleported {
                            let new_velocity = delta / sub_time_tick_remaining;
                            self.velocity = if self.has_anim_root_motion() {
                                Vec3::new(self.velocity.x, new_velocity.y, self.velocity.z)
                            } else {
                                new_velocity
                            };
                        }

                        // Straddling two slopes, neither walkable.
                        let ditch = old_hit_impact_normal.y > 0.0
                            && second.impact_normal.y > 0.0
                            && delta.y.abs() <= KINDA_SMALL
                            && second.impact_normal.dot(&old_hit_impact_normal) < 0.0;

                        hit = self.safe_move_updated_component(delta, rotation, true, scene);
                        if let Some(third) = hit.filter(|h| h.time == 0.0) {
                            // Stuck: side step out of the crease.
                            let mut side_delta = safe_normal_2d(&(old_hit_normal + third.impact_normal));
                            if side_delta == Vec3::zeros() {
                                side_delta = safe_normal(&Vec3::new(old_hit_normal.z, 0.0, -old_hit_normal.x));
                            }
                            hit = self.safe_move_updated_component(side_delta, rotation, true, scene);
                        }

                        let stuck = hit.is_some_and(|h| h.time == 0.0);
                        let lands = hit.is_some_and(|h| self.is_valid_landing_spot(self.location, &h, scene));
                        if ditch || lands || stuck {
                            trace!("movement: settled in a crease at {:?}", self.location);
                            let landing = hit.unwrap_or(second);
                            self.process_landed(&landing, 0.0, iterations, ctx);
                            return;
                        }
                    }
                }
            }

            if size_squared_2d(&self.velocity) <= KINDA_SMALL * 10.0 {
                self.velocity.x = 0.0;
                self.velocity.z = 0.0;
            }
        }
    }

    /// Lateral velocity of this sub-step had there been no input.
    fn velocity_without_air_control(&mut self, old_velocity: Vec3, time_tick: f32, max_decel: f32) -> Vec3 {
        let saved_accel = self.acceleration;
        let saved_velocity = self.velocity;
        self.acceleration = Vec3::zeros();
        self.velocity = Vec3::new(old_velocity.x, 0.0, old_velocity.z);
        self.calc_velocity(time_tick, self.settings.falling_lateral_friction, false, max_decel);
        let result = Vec3::new(self.velocity.x, old_velocity.y, self.velocity.z);
        self.acceleration = saved_accel;
        self.velocity = saved_velocity;
        result
    }

    /// Input acceleration scaled down for steering in the air.
    pub fn get_falling_lateral_acceleration(&self, dt: f32) -> Vec3 {
        let mut fall_acceleration = horizontal(&self.acceleration);
        if !self.has_anim_root_motion() && size_squared_2d(&fall_acceleration) > 0.0 {
            fall_acceleration = self.get_air_control(dt, self.settings.air_control, fall_acceleration);
            fall_acceleration = clamp_max_size(&fall_acceleration, self.get_max_acceleration());
        }
        fall_acceleration
    }

    pub fn get_air_control(&self, dt: f32, air_control: f32, fall_acceleration: Vec3) -> Vec3 {
        let air_control = if air_control != 0.0 {
            self.boost_air_control(dt, air_control, fall_acceleration)
        } else {
            air_control
        };
        fall_acceleration * air_control
    }

    /// Extra air control while moving slowly, for a burst of initial steering.
    pub fn boost_air_control(&self, _dt: f32, air_control: f32, _fall_acceleration: Vec3) -> f32 {
        let threshold = self.settings.air_control_boost_velocity_threshold;
        if self.settings.air_control_boost_multiplier > 0.0 && size_squared_2d(&self.velocity) < threshold * threshold {
            (self.settings.air_control_boost_multiplier * air_control).min(1.0)
        } else {
            air_control
        }
    }

    /// Keep air control from pushing into a wall we hit.
    pub fn limit_air_control(
        &self,
        _dt: f32,
        fall_acceleration: Vec3,
        hit: &HitResult,
        check_for_valid_landing_spot: bool,
        scene: &dyn SceneQuery,
    ) -> Vec3 {
        if hit.start_penetrating {
            // Only out of the penetration.
            return if fall_acceleration.dot(&hit.normal) > 0.0 {
                fall_acceleration
            } else {
                Vec3::zeros()
            };
        }
        if hit.normal.y > VERTICAL_SLOPE_NORMAL_Y
            && (!check_for_valid_landing_spot || !self.is_valid_landing_spot(hit.location, hit, scene))
            && fall_acceleration.dot(&hit.normal) < 0.0
        {
            // Parallel to the wall only; into it could push us up.
            let normal_2d = safe_normal_2d(&hit.normal);
            return vector_plane_project(&fall_acceleration, &normal_2d);
        }
        fall_acceleration
    }

    /// Whether a falling capsule at `location` can stand where `hit` touched.
    pub fn is_valid_landing_spot(&self, location: Vec3, hit: &HitResult, scene: &dyn SceneQuery) -> bool {
        if !hit.start_penetrating {
            if !self.is_walkable(hit) {
                return false;
            }
            // Above the lower hemisphere: sliding down a wall.
            let lower_hemisphere_y = hit.location.y - self.capsule.half_height + self.capsule.radius;
            if hit.impact_point.y >= lower_hemisphere_y {
                return false;
            }
            if !is_within_edge_tolerance(&hit.location, &hit.impact_point, self.capsule.radius) {
                return false;
            }
        } else if hit.normal.y < KINDA_SMALL {
            // Push-out from a wall, not from a floor.
            return false;
        }

        self.floor_probe(scene)
            .find_floor(location, self.is_moving_on_ground(), Some(hit))
            .is_walkable_floor()
    }

    /// True when the hit grazed an edge whose top might be walkable.
    pub fn should_check_for_valid_landing_spot(&self, hit: &HitResult) -> bool {
        hit.normal.y > KINDA_SMALL
            && (hit.normal - hit.impact_normal).abs().max() > KINDA_SMALL
            && is_within_edge_tolerance(&self.location, &hit.impact_point, self.capsule.radius)
    }

    /// Land and continue the remaining time in the new mode.
    pub fn process_landed(&mut self, hit: &HitResult, remaining: f32, iterations: u32, ctx: &mut MovementContext<'_>) {
        if self.is_falling() {
            if self.ground_movement_mode == MovementMode::NavWalking
                && self.find_nav_floor(self.get_actor_feet_location(), ctx.scene).is_none()
            {
                // Avoid bouncing between nav walking and falling off the nav floor.
                self.ground_movement_mode = MovementMode::Walking;
            }
            self.set_post_landed_physics(hit, ctx.scene);
        }
        trace!("movement: landed at {:?} on {:?}", self.location, hit.surface);
        self.start_new_physics(remaining, iterations, ctx);
    }

    pub fn set_post_landed_physics(&mut self, _hit: &HitResult, scene: &dyn SceneQuery) {
        if self.settings.can_swim && self.is_in_water() {
            self.set_movement_mode(MovementMode::Swimming, scene);
        } else {
            self.set_movement_mode(self.ground_movement_mode, scene);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collision::{cuboid_from_pose, CapsuleSpec, Quat, StaticShape, StaticWorld};
    use crate::config::MovementSettings;
    use crate::network::{MoveFlag, MoveFlags};

    const DT: f32 = 1.0 / 60.0;

    fn ground() -> StaticWorld {
        let mut world = StaticWorld::new();
        world.add_shape(StaticShape::Plane {
            normal: Vec3::y(),
            dist: 0.0,
        });
        world
    }

    fn faller(world: &StaticWorld, at: Vec3) -> CharacterMovement {
        let mut cm = CharacterMovement::new(MovementSettings::default(), CapsuleSpec::new(34.0, 88.0)).at(at);
        cm.set_movement_mode(MovementMode::Falling, world);
        cm
    }

    #[test]
    fn falling_lands_on_the_ground_and_walks() {
        let world = ground();
        let mut cm = faller(&world, Vec3::new(0.0, 300.0, 0.0));
        let mut ctx = MovementContext::new(&world);
        let mut landed = false;
        for _ in 0..120 {
            cm.perform_movement(DT, &mut ctx);
            if cm.movement_mode == MovementMode::Walking {
                landed = true;
                break;
            }
            assert!(cm.velocity.y <= 0.0);
        }
        assert!(landed);
        assert_eq!(cm.velocity.y, 0.0);
        let gap = cm.location.y - 88.0;
        assert!((1.9..=2.4).contains(&gap), "gap {gap}");
    }

    #[test]
    fn jump_reaches_the_analytic_apex() {
        let world = ground();
        let mut cm = CharacterMovement::new(MovementSettings::default(), CapsuleSpec::new(34.0, 88.0))
            .at(Vec3::new(0.0, 90.0, 0.0));
        cm.movement_mode = MovementMode::None;
        cm.set_movement_mode(MovementMode::Walking, &world);
        let start_y = cm.location.y;
        let mut ctx = MovementContext::new(&world);

        let flags = MoveFlags::from_flags(&[MoveFlag::JumpPressed]);
        cm.move_autonomous(DT, flags, Vec3::zeros(), &mut ctx);
        let mut peak = cm.location.y;
        for _ in 0..120 {
            cm.move_autonomous(DT, MoveFlags::empty(), Vec3::zeros(), &mut ctx);
            peak = peak.max(cm.location.y);
            if cm.is_moving_on_ground() {
                break;
            }
        }
        assert!(cm.is_moving_on_ground());
        let v = cm.settings.jump_y_velocity;
        let g = cm.get_gravity_y().abs();
        let expected = v * v / (2.0 * g);
        assert!((peak - start_y - expected).abs() < 1.0, "peak {} vs {}", peak - start_y, expected);
    }

    #[test]
    fn air_control_is_a_fraction_of_ground_acceleration() {
        let world = ground();
        let mut cm = faller(&world, Vec3::new(0.0, 1000.0, 0.0));
        cm.acceleration = Vec3::new(2048.0, 0.0, 0.0);
        cm.velocity = Vec3::new(500.0, 0.0, 0.0);
        let lateral = cm.get_falling_lateral_acceleration(DT);
        assert!((lateral.x - 2048.0 * cm.settings.air_control).abs() < 1e-2);

        // Slow enough for the boost.
        cm.velocity = Vec3::zeros();
        let boosted = cm.get_falling_lateral_acceleration(DT);
        assert!(boosted.x > lateral.x);
    }

    #[test]
    fn air_control_into_a_slope_stays_parallel_to_it() {
        let world = ground();
        let cm = faller(&world, Vec3::new(0.0, 1000.0, 0.0));
        let normal = Vec3::new(-1.0, 0.2, 0.0).normalize();
        let hit = HitResult {
            time: 0.5,
            distance: 1.0,
            location: cm.location,
            impact_point: cm.location + Vec3::new(34.0, 0.0, 0.0),
            normal,
            impact_normal: normal,
            start_penetrating: false,
            penetration_depth: 0.0,
            trace_start: cm.location,
            trace_end: cm.location + Vec3::x(),
            surface: crate::collision::SurfaceId(0),
            walkable_override: Default::default(),
        };
        let limited = cm.limit_air_control(DT, Vec3::new(100.0, 0.0, 50.0), &hit, false, &world);
        assert!(limited.x.abs() < 1e-3);
        assert!((limited.z - 50.0).abs() < 1e-3);
    }

    #[test]
    fn wall_contact_is_not_a_landing_spot() {
        let mut world = ground();
        world.add_shape(cuboid_from_pose(Vec3::new(50.0, 500.0, 500.0), Vec3::new(150.0, 500.0, 0.0), Quat::identity()));
        let mut cm = faller(&world, Vec3::new(0.0, 400.0, 0.0));
        let mut ctx = MovementContext::new(&world);
        cm.velocity = Vec3::new(600.0, 0.0, 0.0);
        for _ in 0..20 {
            cm.perform_movement(DT, &mut ctx);
        }
        assert!(cm.is_falling());
        assert!(cm.location.x + 34.0 <= 100.5);
        assert!(cm.velocity.x.abs() < 1.0);
    }

    #[test]
    fn landing_on_a_low_box_edge_uses_its_top() {
        let mut world = ground();
        world.add_shape(cuboid_from_pose(Vec3::new(50.0, 20.0, 50.0), Vec3::new(0.0, 20.0, 0.0), Quat::identity()));
        // Axis 20 past the box edge at x = 50.
        let mut cm = faller(&world, Vec3::new(70.0, 200.0, 0.0));
        let mut ctx = MovementContext::new(&world);
        for _ in 0..120 {
            cm.perform_movement(DT, &mut ctx);
            if cm.is_moving_on_ground() {
                break;
            }
        }
        assert!(cm.is_moving_on_ground());
        let feet = cm.get_actor_feet_location().y;
        assert!(feet > 40.0, "feet at {feet}");
    }
}
