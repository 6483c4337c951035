use log::trace;
use serde::{Deserialize, Serialize};
use strider_shared::utils::safe_normal;
use strider_shared::{
    CharacterMovement, MovementContext, MovementMode, Quat, SceneQuery, SmoothingMode, SmoothingSettings,
    SurfaceId, Vec3,
};

use crate::smoothing::{NetworkSmoothing, ReplaySample};

/// Movement state the server replicates for characters other clients do not control.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplicatedMovement {
    pub location: Vec3,
    pub rotation: Quat,
    pub velocity: Vec3,
    pub base: Option<SurfaceId>,
    /// Packed movement mode.
    pub mode: u8,
    /// Server time of the update.
    pub server_time_stamp: f32,
}

/// A remote character, extrapolated from replicated state and smoothed for display.
pub struct SimulatedProxy {
    pub character: CharacterMovement,
    pub smoothing: NetworkSmoothing,
}

impl SimulatedProxy {
    pub fn new(character: CharacterMovement, settings: SmoothingSettings) -> Self {
        Self {
            character,
            smoothing: NetworkSmoothing::new(settings),
        }
    }

    /// Take a replicated update. The capsule jumps, the mesh follows through smoothing.
    pub fn receive_replicated_movement(&mut self, state: &ReplicatedMovement, scene: &dyn SceneQuery, now: f32) {
        if self.smoothing.mode() == SmoothingMode::Replay {
            self.smoothing.add_replay_sample(ReplaySample {
                time: state.server_time_stamp,
                location: state.location,
                rotation: state.rotation,
                velocity: state.velocity,
            });
            return;
        }

        let old_location = self.character.location;
        let old_rotation = self.character.rotation;
        self.character.velocity = state.velocity;
        self.character.set_base(state.base, scene);
        self.character.apply_network_movement_mode(state.mode, scene);
        self.smoothing.smooth_correction(
            &mut self.character,
            old_location,
            old_rotation,
            state.location,
            state.rotation,
            state.server_time_stamp,
            now,
        );
        self.character.force_next_floor_check = true;
        self.character.save_base_location(scene);
        trace!(
            "proxy: update at {} moved capsule {:.2}",
            state.server_time_stamp,
            (state.location - old_location).norm()
        );
    }

    /// Extrapolate along the replicated velocity, then advance smoothing.
    pub fn simulated_tick(&mut self, dt: f32, ctx: &mut MovementContext<'_>) {
        if self.smoothing.mode() != SmoothingMode::Replay && self.character.movement_mode != MovementMode::None {
            self.simulate_movement(dt, ctx);
        }
        self.smoothing.smooth_client_position_interpolate(dt, &mut self.character);
    }

    /// Keep moving the way the server last saw the character move, without input.
    fn simulate_movement(&mut self, dt: f32, ctx: &mut MovementContext<'_>) {
        let character = &mut self.character;
        // A unit acceleration keeps the velocity from braking without adding speed.
        character.acceleration = safe_normal(&character.velocity);
        character.analog_input_modifier = 1.0;
        character.pressed_jump = false;
        character.perform_movement(dt, ctx);
    }

    /// Where to draw the mesh.
    pub fn visual_pose(&self) -> (Vec3, Quat) {
        self.smoothing.visual_pose(&self.character)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strider_shared::{CapsuleSpec, MovementSettings, StaticShape, StaticWorld};

    fn world() -> StaticWorld {
        let mut world = StaticWorld::new();
        world.add_shape(StaticShape::Plane {
            normal: Vec3::y(),
            dist: 0.0,
        });
        world
    }

    fn proxy(world: &StaticWorld, mode: SmoothingMode) -> SimulatedProxy {
        let mut cm = CharacterMovement::new(MovementSettings::default(), CapsuleSpec::new(34.0, 88.0))
            .at(Vec3::new(0.0, 90.2, 0.0));
        cm.set_movement_mode(MovementMode::Walking, world);
        SimulatedProxy::new(
            cm,
            SmoothingSettings {
                mode,
                ..SmoothingSettings::default()
            },
        )
    }

    fn walking() -> u8 {
        MovementMode::Walking.pack(0, MovementMode::Walking)
    }

    #[test]
    fn proxy_keeps_walking_between_updates() {
        let world = world();
        let mut proxy = proxy(&world, SmoothingMode::Exponential);
        let state = ReplicatedMovement {
            location: Vec3::new(0.0, 90.2, 0.0),
            rotation: Quat::identity(),
            velocity: Vec3::new(300.0, 0.0, 0.0),
            base: None,
            mode: walking(),
            server_time_stamp: 1.0,
        };
        proxy.receive_replicated_movement(&state, &world, 1.0);

        let mut ctx = MovementContext::new(&world);
        for _ in 0..10 {
            proxy.simulated_tick(0.01, &mut ctx);
        }
        assert!((proxy.character.location.x - 30.0).abs() < 1.0, "{:?}", proxy.character.location);
        assert!((proxy.character.velocity.x - 300.0).abs() < 1.0);
    }

    #[test]
    fn correction_is_hidden_then_blended_out() {
        let world = world();
        let mut proxy = proxy(&world, SmoothingMode::Exponential);
        let state = ReplicatedMovement {
            location: Vec3::new(20.0, 90.2, 0.0),
            rotation: Quat::identity(),
            velocity: Vec3::zeros(),
            base: None,
            mode: walking(),
            server_time_stamp: 1.0,
        };
        proxy.receive_replicated_movement(&state, &world, 1.0);
        assert_eq!(proxy.character.location.x, 20.0);
        assert!(proxy.visual_pose().0.x.abs() < 1e-3);

        let mut ctx = MovementContext::new(&world);
        for _ in 0..30 {
            proxy.simulated_tick(1.0 / 60.0, &mut ctx);
        }
        assert!(proxy.smoothing.smoothing_complete);
        assert!((proxy.visual_pose().0.x - 20.0).abs() < 1e-3);
    }

    #[test]
    fn replay_mode_only_records_samples() {
        let world = world();
        let mut proxy = proxy(&world, SmoothingMode::Replay);
        let state = ReplicatedMovement {
            location: Vec3::new(20.0, 90.2, 0.0),
            rotation: Quat::identity(),
            velocity: Vec3::zeros(),
            base: None,
            mode: walking(),
            server_time_stamp: 1.0,
        };
        proxy.receive_replicated_movement(&state, &world, 1.0);
        assert_eq!(proxy.character.location.x, 0.0);
        assert_eq!(proxy.smoothing.replay_samples().len(), 1);
    }
}
