use log::warn;

use super::{CharacterMovement, MovementContext};
use crate::constants::MIN_TICK_TIME;

/// Game-defined integrator for [`MovementMode::Custom`](super::MovementMode::Custom).
///
/// `character.custom_movement_mode` tells which sub-mode is running. The
/// integrator owns the whole update and may switch modes through
/// [`CharacterMovement::set_movement_mode`] and continue with
/// [`CharacterMovement::start_new_physics`].
pub trait CustomMovement: Send + Sync {
    fn phys_custom(&mut self, character: &mut CharacterMovement, dt: f32, iterations: u32, ctx: &mut MovementContext<'_>);
}

impl CharacterMovement {
    pub(crate) fn phys_custom(&mut self, dt: f32, iterations: u32, ctx: &mut MovementContext<'_>) {
        if dt < MIN_TICK_TIME {
            return;
        }
        // Detached while running so the integrator can borrow the character.
        let Some(mut custom) = self.custom_movement.take() else {
            warn!("movement: custom mode {} has no integrator", self.custom_movement_mode);
            return;
        };
        custom.phys_custom(self, dt, iterations, ctx);
        if self.custom_movement.is_none() {
            self.custom_movement = Some(custom);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collision::{CapsuleSpec, StaticWorld, Vec3};
    use crate::config::MovementSettings;
    use crate::movement::MovementMode;

    /// Sub-mode 0 rises at a fixed speed; sub-mode 1 hands over to falling.
    struct Ladder {
        climb_speed: f32,
    }

    impl CustomMovement for Ladder {
        fn phys_custom(&mut self, character: &mut CharacterMovement, dt: f32, iterations: u32, ctx: &mut MovementContext<'_>) {
            match character.custom_movement_mode {
                0 => {
                    character.velocity = Vec3::new(0.0, self.climb_speed, 0.0);
                    let rotation = character.rotation;
                    character.safe_move_updated_component(character.velocity * dt, rotation, true, ctx.scene);
                }
                _ => {
                    character.set_movement_mode(MovementMode::Falling, ctx.scene);
                    character.start_new_physics(dt, iterations + 1, ctx);
                }
            }
        }
    }

    fn climber(world: &StaticWorld, sub_mode: u8) -> CharacterMovement {
        let mut cm = CharacterMovement::new(MovementSettings::default(), CapsuleSpec::new(34.0, 88.0))
            .at(Vec3::new(0.0, 500.0, 0.0));
        cm.set_custom_movement(Box::new(Ladder { climb_speed: 120.0 }));
        cm.set_movement_mode_with_custom(MovementMode::Custom, sub_mode, world);
        cm
    }

    #[test]
    fn custom_integrator_drives_the_character() {
        let world = StaticWorld::new();
        let mut cm = climber(&world, 0);
        let mut ctx = MovementContext::new(&world);
        cm.perform_movement(0.5, &mut ctx);
        assert!((cm.location.y - 560.0).abs() < 1e-3);
        assert!(cm.custom_movement.is_some());
    }

    #[test]
    fn custom_integrator_can_hand_off_to_another_mode() {
        let world = StaticWorld::new();
        let mut cm = climber(&world, 1);
        let mut ctx = MovementContext::new(&world);
        cm.perform_movement(0.1, &mut ctx);
        assert_eq!(cm.movement_mode, MovementMode::Falling);
        assert!(cm.location.y < 500.0);
        assert!(cm.custom_movement.is_some());
    }

    #[test]
    fn custom_mode_without_integrator_stays_put() {
        let world = StaticWorld::new();
        let mut cm = CharacterMovement::new(MovementSettings::default(), CapsuleSpec::new(34.0, 88.0))
            .at(Vec3::new(0.0, 500.0, 0.0));
        cm.set_movement_mode_with_custom(MovementMode::Custom, 3, &world);
        let mut ctx = MovementContext::new(&world);
        cm.perform_movement(0.1, &mut ctx);
        assert_eq!(cm.location, Vec3::new(0.0, 500.0, 0.0));
    }
}
