use log::trace;

use super::{CharacterMovement, MovementMode};
use crate::collision::{SceneQuery, Vec3};
use crate::constants::{
    BRAKE_TO_STOP_VELOCITY, KINDA_SMALL, MAX_BRAKING_SUBSTEP, MIN_TICK_TIME, SMALL_NUMBER,
};
use crate::utils::{clamp_max_size, safe_normal, size_2d};

/// Speed over the cap that still counts as "at" the cap.
const OVER_VELOCITY_PERCENT: f32 = 1.01;

impl CharacterMovement {
    pub fn get_gravity_y(&self) -> f32 {
        self.settings.gravity_y
    }

    pub fn get_max_speed(&self) -> f32 {
        match self.movement_mode {
            MovementMode::Walking | MovementMode::NavWalking => {
                if self.is_crouched {
                    self.settings.max_walk_speed_crouched
                } else {
                    self.settings.max_walk_speed
                }
            }
            MovementMode::Falling => self.settings.max_walk_speed,
            MovementMode::Swimming => self.settings.max_swim_speed,
            MovementMode::Flying => self.settings.max_fly_speed,
            MovementMode::Custom => self.settings.max_custom_speed,
            MovementMode::None => 0.0,
        }
    }

    #[inline]
    pub fn get_max_acceleration(&self) -> f32 {
        self.settings.max_acceleration
    }

    pub fn get_max_braking_deceleration(&self) -> f32 {
        match self.movement_mode {
            MovementMode::Walking | MovementMode::NavWalking => {
                self.settings.braking_deceleration_walking
            }
            MovementMode::Falling => self.settings.braking_deceleration_falling,
            MovementMode::Swimming => self.settings.braking_deceleration_swimming,
            MovementMode::Flying => self.settings.braking_deceleration_flying,
            MovementMode::Custom | MovementMode::None => 0.0,
        }
    }

    /// Lowest speed analog input can request while on the ground.
    pub fn get_min_analog_speed(&self) -> f32 {
        match self.movement_mode {
            MovementMode::Walking | MovementMode::NavWalking | MovementMode::Falling => {
                self.settings.min_analog_walk_speed
            }
            _ => 0.0,
        }
    }

    /// Fraction of max acceleration requested by the current input, in [0, 1].
    pub fn compute_analog_input_modifier(&self) -> f32 {
        let max_accel = self.get_max_acceleration();
        if self.acceleration.norm_squared() > 0.0 && max_accel > SMALL_NUMBER {
            (self.acceleration.norm() / max_accel).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    pub fn is_exceeding_max_speed(&self, max_speed: f32) -> bool {
        let max_speed = max_speed.max(0.0);
        self.velocity.norm_squared() > max_speed * max_speed * OVER_VELOCITY_PERCENT
    }

    /// Integrate input acceleration, friction and braking into the velocity.
    ///
    /// Does nothing while animation root motion drives the character.
    pub fn calc_velocity(&mut self, dt: f32, friction: f32, fluid: bool, braking_deceleration: f32) {
        if self.has_anim_root_motion() || dt < MIN_TICK_TIME {
            return;
        }

        let friction = friction.max(0.0);
        let max_speed =
            (self.get_max_speed() * self.analog_input_modifier).max(self.get_min_analog_speed());

        let zero_acceleration = self.acceleration == Vec3::zeros();
        let velocity_over_max = self.is_exceeding_max_speed(max_speed);

        if zero_acceleration || velocity_over_max {
            let old_velocity = self.velocity;
            let braking_friction = if self.settings.use_separate_braking_friction {
                self.settings.braking_friction
            } else {
                friction
            };
            self.apply_velocity_braking(dt, braking_friction, braking_deceleration);

            // Braking never takes us below the cap we started above while still pushing forward.
            if velocity_over_max
                && self.velocity.norm_squared() < max_speed * max_speed
                && self.acceleration.dot(&old_velocity) > 0.0
            {
                self.velocity = safe_normal(&old_velocity) * max_speed;
            }
        } else {
            // Friction limits how fast the velocity turns toward the input.
            let accel_dir = safe_normal(&self.acceleration);
            let speed = self.velocity.norm();
            self.velocity -= (self.velocity - accel_dir * speed) * (dt * friction).min(1.0);
        }

        if fluid {
            self.velocity *= 1.0 - (friction * dt).min(1.0);
        }

        let new_max_input_speed = if self.is_exceeding_max_speed(max_speed) {
            self.velocity.norm()
        } else {
            max_speed
        };
        self.velocity += self.acceleration * dt;
        self.velocity = clamp_max_size(&self.velocity, new_max_input_speed);
    }

    /// Slow the velocity down with friction and constant deceleration.
    ///
    /// Integrates in slices of at most [`MAX_BRAKING_SUBSTEP`] so results do not depend
    /// on frame rate. The velocity never reverses and snaps to zero below
    /// [`BRAKE_TO_STOP_VELOCITY`].
    pub fn apply_velocity_braking(&mut self, dt: f32, friction: f32, braking_deceleration: f32) {
        if self.velocity == Vec3::zeros() || self.has_anim_root_motion() || dt < MIN_TICK_TIME {
            return;
        }

        let friction_factor = self.settings.braking_friction_factor.max(0.0);
        let friction = (friction * friction_factor).max(0.0);
        let braking_deceleration = braking_deceleration.max(0.0);
        let zero_friction = friction == 0.0;
        let zero_braking = braking_deceleration == 0.0;
        if zero_friction && zero_braking {
            return;
        }

        let old_velocity = self.velocity;
        // Fixed for the whole call so the deceleration cannot swing around.
        let rev_accel = if zero_braking {
            Vec3::zeros()
        } else {
            safe_normal(&self.velocity) * -braking_deceleration
        };

        let mut remaining = dt;
        while remaining >= MIN_TICK_TIME {
            let slice = if remaining > MAX_BRAKING_SUBSTEP && !zero_friction {
                MAX_BRAKING_SUBSTEP.min(remaining * 0.5)
            } else {
                remaining
            };
            remaining -= slice;

            self.velocity += (self.velocity * -friction + rev_accel) * slice;

            if self.velocity.dot(&old_velocity) <= 0.0 {
                self.velocity = Vec3::zeros();
                return;
            }
        }

        let speed_sq = self.velocity.norm_squared();
        if speed_sq <= KINDA_SMALL
            || (!zero_braking && speed_sq <= BRAKE_TO_STOP_VELOCITY * BRAKE_TO_STOP_VELOCITY)
        {
            self.velocity = Vec3::zeros();
        }
    }

    /// Velocity after `dt` seconds of gravity, limited to the terminal velocity of the current volume.
    pub fn new_fall_velocity(&self, initial: Vec3, gravity: Vec3, dt: f32) -> Vec3 {
        let mut result = initial;
        if dt > 0.0 {
            result += gravity * dt;

            let terminal = self.terminal_velocity().abs();
            if result.norm_squared() > terminal * terminal {
                let gravity_dir = safe_normal(&gravity);
                if result.dot(&gravity_dir) > terminal {
                    result = result - gravity_dir * result.dot(&gravity_dir) + gravity_dir * terminal;
                }
            }
        }
        result
    }

    /// Length of the next sub-step of a move with `remaining` seconds left.
    pub fn get_simulation_time_step(&self, remaining: f32, iterations: u32) -> f32 {
        let mut remaining = remaining;
        let max_step = self.settings.max_simulation_time_step;
        if remaining > max_step {
            if iterations < self.settings.max_simulation_iterations {
                remaining = max_step.min(remaining * 0.5);
            } else {
                trace!(
                    "movement: last iteration {iterations} consumes remaining {remaining:.4}s"
                );
            }
        }
        remaining.max(MIN_TICK_TIME)
    }

    /// Keep ground velocity horizontal.
    pub fn maintain_horizontal_ground_velocity(&mut self) {
        if self.velocity.y != 0.0 {
            if self.settings.maintain_horizontal_ground_velocity {
                self.velocity.y = 0.0;
            } else {
                let speed = self.velocity.norm();
                let dir = Vec3::new(self.velocity.x, 0.0, self.velocity.z);
                self.velocity = safe_normal(&dir) * speed;
            }
        }
    }

    pub fn has_anim_root_motion(&self) -> bool {
        self.anim_root_motion.is_some()
    }

    /// Undo last sub-step's additive root motion so it is not applied twice.
    pub fn restore_pre_additive_root_motion_velocity(&mut self) {
        if self.current_root_motion.is_additive_velocity_applied {
            self.velocity = self.current_root_motion.last_pre_additive_velocity;
            self.current_root_motion.is_additive_velocity_applied = false;
        }
    }

    /// True when root motion replaces the computed velocity this sub-step.
    pub(crate) fn root_motion_overrides_velocity(&self) -> bool {
        self.has_anim_root_motion() || self.current_root_motion.has_override_velocity()
    }

    /// Fold animation root motion or root motion sources into the velocity.
    ///
    /// Upward root motion lifts a grounded character into falling.
    pub(crate) fn apply_root_motion_to_velocity(&mut self, dt: f32, scene: &dyn SceneQuery) {
        if self.has_anim_root_motion() && dt > 0.0 {
            let mut result = self.anim_root_motion_velocity;
            if self.movement_mode == MovementMode::Falling {
                // Keep gravity.
                result.y = self.velocity.y;
            }
            self.velocity = result;
            return;
        }

        let old_velocity = self.velocity;
        let mut applied = false;
        if self.current_root_motion.has_override_velocity() {
            self.current_root_motion
                .accumulate_override_velocity(&self.rotation, &mut self.velocity);
            applied = true;
        }
        if self.current_root_motion.has_additive_velocity() {
            self.current_root_motion.last_pre_additive_velocity = self.velocity;
            self.current_root_motion
                .accumulate_additive_velocity(&self.rotation, &mut self.velocity);
            self.current_root_motion.is_additive_velocity_applied = true;
            applied = true;
        }

        let applied_delta_y = self.velocity.y - old_velocity.y;
        if applied && applied_delta_y != 0.0 && self.is_moving_on_ground() {
            let liftoff_bound = if self.current_root_motion.last_sensitive_liftoff {
                SMALL_NUMBER
            } else {
                (self.get_gravity_y().abs() * dt).max(SMALL_NUMBER)
            };
            if applied_delta_y > liftoff_bound {
                trace!(
                    "movement: root motion lifts off with {applied_delta_y:.2} (bound {liftoff_bound:.2})"
                );
                self.set_movement_mode(MovementMode::Falling, scene);
            }
        }
    }

    /// Planar speed, handy for tests and animation.
    pub fn ground_speed(&self) -> f32 {
        size_2d(&self.velocity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collision::CapsuleSpec;
    use crate::config::MovementSettings;

    fn walker() -> CharacterMovement {
        CharacterMovement::new(MovementSettings::default(), CapsuleSpec::new(34.0, 88.0))
    }

    #[test]
    fn braking_converges_to_exact_zero_without_reversal() {
        let mut cm = walker();
        let start = Vec3::new(600.0, 0.0, -250.0);
        cm.velocity = start;
        let dt = 1.0 / 60.0;
        for _ in 0..600 {
            let before = cm.velocity;
            cm.apply_velocity_braking(dt, 8.0, 2048.0);
            assert!(cm.velocity.dot(&start) >= 0.0, "velocity reversed");
            assert!(cm.velocity.norm() <= before.norm() + 1e-3);
            if cm.velocity == Vec3::zeros() {
                return;
            }
        }
        panic!("braking did not stop: {:?}", cm.velocity);
    }

    #[test]
    fn braking_result_is_independent_of_frame_rate() {
        let mut coarse = walker();
        let mut fine = walker();
        coarse.velocity = Vec3::new(500.0, 0.0, 0.0);
        fine.velocity = coarse.velocity;

        coarse.apply_velocity_braking(0.1, 2.0, 0.0);
        for _ in 0..10 {
            fine.apply_velocity_braking(0.01, 2.0, 0.0);
        }
        assert!((coarse.velocity.x - fine.velocity.x).abs() < 10.0);
    }

    #[test]
    fn acceleration_is_capped_at_max_speed() {
        let mut cm = walker();
        cm.acceleration = Vec3::new(cm.get_max_acceleration(), 0.0, 0.0);
        cm.analog_input_modifier = cm.compute_analog_input_modifier();
        for _ in 0..200 {
            cm.calc_velocity(1.0 / 60.0, cm.settings.ground_friction, false, 2048.0);
        }
        let max = cm.get_max_speed();
        assert!((cm.velocity.norm() - max).abs() < 1.0, "{}", cm.velocity.norm());
    }

    #[test]
    fn fall_velocity_respects_terminal_velocity() {
        let cm = walker();
        let gravity = Vec3::new(0.0, cm.get_gravity_y(), 0.0);
        let v = cm.new_fall_velocity(Vec3::new(100.0, -3990.0, 0.0), gravity, 1.0);
        assert!((v.y + cm.settings.terminal_velocity).abs() < 1e-2);
        assert_eq!(v.x, 100.0);
    }

    #[test]
    fn sub_steps_halve_until_the_iteration_cap() {
        let cm = walker();
        let max = cm.settings.max_simulation_time_step;
        assert_eq!(cm.get_simulation_time_step(max * 0.5, 1), max * 0.5);
        assert_eq!(cm.get_simulation_time_step(max * 4.0, 1), max);
        assert_eq!(cm.get_simulation_time_step(max * 1.5, 1), max.min(max * 0.75));
        let last = cm.settings.max_simulation_iterations;
        assert_eq!(cm.get_simulation_time_step(max * 4.0, last), max * 4.0);
        assert_eq!(cm.get_simulation_time_step(0.0, 1), MIN_TICK_TIME);
    }
}
