use log::{debug, trace};

use super::{CharacterMovement, MovementContext, MovementMode};
use crate::collision::{FluidVolume, HitResult, SceneQuery, Vec3};
use crate::constants::{KINDA_SMALL, MIN_TICK_TIME};
use crate::utils::{clamp_max_size, horizontal, safe_normal, safe_normal_2d, size_2d};

/// Vertical speed a character settles to while bobbing at the surface.
const SWIM_BOB_SPEED: f32 = -80.0;
/// Offset from the water line so the end point lands on the intended side of it.
const WATER_LINE_OFFSET: f32 = 0.1;

impl CharacterMovement {
    #[inline]
    pub fn is_in_water(&self) -> bool {
        self.fluid.is_some()
    }

    /// Re-sample the fluid at the capsule center and react to entering or leaving it.
    pub(crate) fn update_physics_volume(&mut self, scene: &dyn SceneQuery) {
        let fluid = scene.fluid_at(self.location);
        let changed = fluid.is_some() != self.fluid.is_some();
        self.fluid = fluid;
        if changed {
            self.physics_volume_changed(scene);
        }
    }

    fn physics_volume_changed(&mut self, scene: &dyn SceneQuery) {
        if self.movement_mode == MovementMode::None {
            return;
        }
        if self.is_in_water() {
            if self.settings.can_swim && !self.is_swimming() {
                debug!("movement: entered water at {:?}", self.location);
                self.set_movement_mode(MovementMode::Swimming, scene);
            }
        } else if self.is_swimming() {
            debug!("movement: left water at {:?}", self.location);
            self.set_movement_mode(MovementMode::Falling, scene);

            // Climbing out onto a low ledge.
            if self.acceleration.y > 0.0 {
                if let Some(jump_dir) = self.should_jump_out_of_water() {
                    if jump_dir.dot(&self.acceleration) > 0.0 {
                        if let Some(wall_normal) = self.check_water_jump(jump_dir, scene) {
                            self.jump_out_of_water(wall_normal);
                        }
                    }
                }
            }
        }
    }

    /// Fraction of the capsule height below the water surface, 0 out of water.
    pub fn immersion_depth(&self) -> f32 {
        let Some(fluid) = self.fluid else {
            return 0.0;
        };
        let half_height = self.capsule.half_height;
        if half_height == 0.0 || self.settings.buoyancy == 0.0 {
            return 1.0;
        }
        let bottom = self.location.y - half_height;
        ((fluid.surface_y - bottom) / (2.0 * half_height)).clamp(0.0, 1.0)
    }

    pub(crate) fn phys_swimming(&mut self, dt: f32, iterations: u32, ctx: &mut MovementContext<'_>) {
        if dt < MIN_TICK_TIME {
            return;
        }
        let scene = ctx.scene;
        self.restore_pre_additive_root_motion_velocity();

        let depth = self.immersion_depth();
        let net_buoyancy = self.settings.buoyancy * depth;
        let original_accel_y = self.acceleration.y;
        let max_swim_speed = self.settings.max_swim_speed;
        let mut limited_up_accel = false;

        if !self.root_motion_overrides_velocity() && self.velocity.y > 0.33 * max_swim_speed && net_buoyancy != 0.0 {
            // Damp upward speed near the surface.
            self.velocity.y = (0.33 * max_swim_speed).max(self.velocity.y * depth * depth);
        } else if depth < 0.65 {
            limited_up_accel = self.acceleration.y > 0.0;
            self.acceleration.y = self.acceleration.y.min(0.1);
        }

        let iterations = iterations + 1;
        let mut old_location = self.location;
        self.just_teleported = false;

        if !self.root_motion_overrides_velocity() {
            let friction = 0.5 * self.fluid.map_or(0.0, |f| f.friction) * depth;
            let max_decel = self.get_max_braking_deceleration();
            self.calc_velocity(dt, friction, true, max_decel);
            self.velocity.y += self.get_gravity_y() * dt * (1.0 - net_buoyancy);
        }
        self.apply_root_motion_to_velocity(dt, scene);

        let mut adjusted = self.velocity * dt;
        let (air_time, mut hit) = self.swim(adjusted, scene);
        let remaining = dt * air_time;

        if !self.is_swimming() {
            self.start_new_physics(remaining, iterations, ctx);
            return;
        }

        if let Some(first) = hit {
            if limited_up_accel && self.velocity.y >= 0.0 {
                // Let the character climb along an obstacle at the surface.
                self.velocity.y += original_accel_y * dt;
                adjusted = self.velocity * (1.0 - first.time) * dt;
                (_, hit) = self.swim(adjusted, scene);
                if !self.is_swimming() {
                    self.start_new_physics(remaining, iterations, ctx);
                    return;
                }
            }

            let grav_dir = Vec3::new(0.0, -1.0, 0.0);
            let up_down = grav_dir.dot(&safe_normal(&self.velocity));
            let mut stepped_up = false;
            if let Some(wall) = hit {
                if wall.impact_normal.y.abs() < 0.2 && up_down < 0.5 && up_down > -0.2 && self.can_step_up(&wall) {
                    let step_y = self.location.y;
                    let real_velocity = self.velocity;
                    // Moving up; keeps the step from reading as a fall if we leave the water.
                    self.velocity.y = 1.0;
                    stepped_up = self.step_up(grav_dir, adjusted * (1.0 - wall.time), &wall, None, scene);
                    if stepped_up {
                        if !self.is_swimming() {
                            self.start_new_physics(remaining, iterations, ctx);
                            return;
                        }
                        old_location.y = self.location.y + (old_location.y - step_y);
                    }
                    self.velocity = real_velocity;
                }

                if !stepped_up {
                    self.slide_along_surface(adjusted, 1.0 - wall.time, wall.normal, &mut hit, scene);
                }
            }
        }

        if !self.root_motion_overrides_velocity() && !self.just_teleported && dt - remaining > KINDA_SMALL {
            let water_jump = !self.is_in_water();
            let velocity_y = self.velocity.y;
            self.velocity = (self.location - old_location) / (dt - remaining);
            if water_jump {
                self.velocity.y = velocity_y;
            }
        }

        if !self.is_in_water() && self.is_swimming() {
            self.set_movement_mode(MovementMode::Falling, scene);
        }

        if !self.is_swimming() {
            self.start_new_physics(remaining, iterations, ctx);
        }
    }

    /// Move through the water. When the move leaves the water the character is
    /// pulled back to the water line; returns the unused fraction of the move.
    pub fn swim(&mut self, delta: Vec3, scene: &dyn SceneQuery) -> (f32, Option<HitResult>) {
        let start = self.location;
        let fluid = self.fluid;
        let rotation = self.rotation;
        let mut hit = self.safe_move_updated_component(delta, rotation, true, scene);
        let mut air_time = 0.0;

        if let (false, Some(fluid)) = (self.is_in_water(), fluid) {
            let location = self.location;
            let end = find_water_line(&fluid, start, location, false);
            let desired_dist = delta.norm();
            if end != location && desired_dist > KINDA_SMALL {
                air_time = (end - location).norm() / desired_dist;
                if (location - start).dot(&(end - location)) > 0.0 {
                    air_time = 0.0;
                }
                hit = self.safe_move_updated_component(end - location, rotation, true, scene);
            }
        }
        (air_time, hit)
    }

    /// Continue a move that just entered the water, refunding the time spent below the surface.
    pub(crate) fn start_swimming(
        &mut self,
        old_location: Vec3,
        old_velocity: Vec3,
        time_tick: f32,
        remaining: f32,
        iterations: u32,
        ctx: &mut MovementContext<'_>,
    ) {
        if remaining < MIN_TICK_TIME || time_tick < MIN_TICK_TIME {
            return;
        }
        let mut remaining = remaining;

        if !self.root_motion_overrides_velocity() && !self.just_teleported {
            // End velocity of a constant-acceleration sub-step is twice the average minus the start.
            let average = (self.location - old_location) / time_tick;
            self.velocity = clamp_max_size(&(average * 2.0 - old_velocity), self.terminal_velocity());
        }

        if let Some(fluid) = self.fluid {
            let location = self.location;
            let end = find_water_line(&fluid, location, old_location, true);
            if end != location {
                let actual_dist = (location - old_location).norm();
                if actual_dist > KINDA_SMALL {
                    remaining += time_tick * (end - location).norm() / actual_dist;
                }
                let rotation = self.rotation;
                self.move_updated_component(end - location, rotation, true, ctx.scene);
            }
        }

        if !self.root_motion_overrides_velocity() && self.velocity.y > 2.0 * SWIM_BOB_SPEED && self.velocity.y < 0.0 {
            // Smooth bobbing on entry; a hard dive keeps its speed.
            self.velocity.y = SWIM_BOB_SPEED - size_2d(&self.velocity) * 0.7;
        }

        trace!("movement: started swimming at {:?}, {remaining}s left", self.location);
        if remaining >= MIN_TICK_TIME && iterations < self.settings.max_simulation_iterations {
            self.phys_swimming(remaining, iterations, ctx);
        }
    }

    /// Controller forward when it pitches up enough to leave the water with a jump.
    pub fn should_jump_out_of_water(&self) -> Option<Vec3> {
        let forward = self.control_rotation * Vec3::new(0.0, 0.0, -1.0);
        let pitch = forward.y.clamp(-1.0, 1.0).asin().to_degrees();
        (self.velocity.y > 0.0 && pitch >= self.settings.jump_out_of_water_pitch).then_some(forward)
    }

    /// Look for a low wall ahead that the character can climb out onto.
    ///
    /// Returns the direction into the wall when there is room above it.
    pub fn check_water_jump(&self, jump_dir: Vec3, scene: &dyn SceneQuery) -> Option<Vec3> {
        let check_norm = safe_normal_2d(&jump_dir);
        let radius = self.capsule.radius;
        let check_point = self.location + check_norm * (1.2 * radius);

        let wall = scene.sweep_capsule(self.location, check_point, &self.capsule)?;
        let wall_normal = -wall.impact_normal;

        let start = self.location + Vec3::new(0.0, self.settings.max_out_of_water_step_height, 0.0);
        let end = start + wall_normal * (3.2 * radius);
        match scene.line_trace(start, end) {
            None => Some(wall_normal),
            Some(high) if self.is_walkable(&high) => Some(wall_normal),
            Some(_) => None,
        }
    }

    /// Launch out of the water toward the wall.
    pub fn jump_out_of_water(&mut self, wall_normal: Vec3) {
        let lateral = safe_normal_2d(&wall_normal) * size_2d(&self.velocity).max(self.settings.max_swim_speed * 0.5);
        self.velocity = horizontal(&lateral);
        self.velocity.y = self.settings.out_of_water_y;
        debug!("movement: jumped out of water, velocity {:?}", self.velocity);
    }
}

/// Point where the segment from `in_water` to `out_of_water` crosses the surface.
///
/// `inside` picks which side of the line the result sits on. Segments that leave
/// through a side or the bottom keep `out_of_water`.
pub fn find_water_line(fluid: &FluidVolume, in_water: Vec3, out_of_water: Vec3, inside: bool) -> Vec3 {
    let span = in_water.y - out_of_water.y;
    if out_of_water.y <= fluid.surface_y || in_water.y > fluid.surface_y || span.abs() <= KINDA_SMALL {
        return out_of_water;
    }
    let t = (fluid.surface_y - out_of_water.y) / span;
    let line = out_of_water + (in_water - out_of_water) * t;
    let dir = safe_normal(&(in_water - out_of_water));
    if inside {
        line + dir * WATER_LINE_OFFSET
    } else {
        line - dir * WATER_LINE_OFFSET
    }
}
