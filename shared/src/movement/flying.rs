use super::{CharacterMovement, MovementContext};
use crate::collision::Vec3;
use crate::constants::MIN_TICK_TIME;
use crate::utils::safe_normal;

/// Friction of open air when the character is in no fluid volume.
const DEFAULT_FLUID_FRICTION: f32 = 0.3;

impl CharacterMovement {
    pub(crate) fn phys_flying(&mut self, dt: f32, iterations: u32, ctx: &mut MovementContext<'_>) {
        if dt < MIN_TICK_TIME {
            return;
        }
        let scene = ctx.scene;
        self.restore_pre_additive_root_motion_velocity();

        if !self.root_motion_overrides_velocity() {
            let friction = 0.5 * self.fluid.map_or(DEFAULT_FLUID_FRICTION, |f| f.friction);
            let max_decel = self.get_max_braking_deceleration();
            self.calc_velocity(dt, friction, true, max_decel);
        }
        self.apply_root_motion_to_velocity(dt, scene);

        let _iterations = iterations + 1;
        self.just_teleported = false;
        let mut old_location = self.location;
        let adjusted = self.velocity * dt;
        let rotation = self.rotation;
        let mut hit = self.safe_move_updated_component(adjusted, rotation, true, scene);

        if let Some(first) = hit {
            let grav_dir = Vec3::new(0.0, -1.0, 0.0);
            let up_down = grav_dir.dot(&safe_normal(&self.velocity));
            let mut stepped_up = false;
            if first.impact_normal.y.abs() < 0.2 && up_down < 0.5 && up_down > -0.2 && self.can_step_up(&first) {
                let step_y = self.location.y;
                stepped_up = self.step_up(grav_dir, adjusted * (1.0 - first.time), &first, None, scene);
                if stepped_up {
                    old_location.y = self.location.y + (old_location.y - step_y);
                }
            }
            if !stepped_up {
                self.slide_along_surface(adjusted, 1.0 - first.time, first.normal, &mut hit, scene);
            }
        }

        if !self.just_teleported && !self.root_motion_overrides_velocity() {
            self.velocity = (self.location - old_location) / dt;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collision::{cuboid_from_pose, CapsuleSpec, Quat, StaticWorld};
    use crate::config::MovementSettings;
    use crate::movement::MovementMode;
    use crate::network::MoveFlags;

    const DT: f32 = 1.0 / 60.0;

    fn flyer(world: &StaticWorld) -> CharacterMovement {
        let mut cm = CharacterMovement::new(MovementSettings::default(), CapsuleSpec::new(34.0, 88.0))
            .at(Vec3::new(0.0, 500.0, 0.0));
        cm.set_movement_mode(MovementMode::Flying, world);
        cm
    }

    #[test]
    fn flying_ignores_gravity() {
        let world = StaticWorld::new();
        let mut cm = flyer(&world);
        let mut ctx = MovementContext::new(&world);
        for _ in 0..60 {
            cm.perform_movement(DT, &mut ctx);
        }
        assert_eq!(cm.movement_mode, MovementMode::Flying);
        assert!((cm.location.y - 500.0).abs() < 1e-3);
    }

    #[test]
    fn flying_accelerates_in_three_dimensions_up_to_the_cap() {
        let world = StaticWorld::new();
        let mut cm = flyer(&world);
        let mut ctx = MovementContext::new(&world);
        let accel = Vec3::new(1.0, 1.0, 0.0).normalize() * 2048.0;
        for _ in 0..120 {
            cm.move_autonomous(DT, MoveFlags::empty(), accel, &mut ctx);
        }
        assert!(cm.velocity.norm() <= cm.settings.max_fly_speed + 1.0);
        assert!(cm.velocity.y > 300.0);
        assert!((cm.velocity.x - cm.velocity.y).abs() < 1.0);
    }

    #[test]
    fn flying_into_a_wall_slides_along_it() {
        let mut world = StaticWorld::new();
        world.add_shape(cuboid_from_pose(Vec3::new(50.0, 1000.0, 1000.0), Vec3::new(150.0, 500.0, 0.0), Quat::identity()));
        let mut cm = flyer(&world);
        let mut ctx = MovementContext::new(&world);
        let accel = Vec3::new(1.0, 0.0, 1.0).normalize() * 2048.0;
        for _ in 0..120 {
            cm.move_autonomous(DT, MoveFlags::empty(), accel, &mut ctx);
        }
        assert!(cm.location.x + 34.0 <= 100.5);
        assert!(cm.location.z > 100.0);
    }
}
