use bevy::prelude::*;
use nalgebra as na;
use strider_shared::{MovementContext, StaticWorld};

use crate::proxy::SimulatedProxy;

/// Collision scene simulated proxies extrapolate against.
#[derive(Resource, Default)]
pub struct MovementScene(pub StaticWorld);

/// Movement units (centimetres) to render units.
#[derive(Resource, Clone, Copy, Debug)]
pub struct RenderScale(pub f32);

/// A remote character drawn through its smoothed pose.
#[derive(Component)]
pub struct SimulatedCharacter(pub SimulatedProxy);

/// Ticks simulated characters and writes their smoothed pose into `Transform`.
pub struct StriderSmoothingPlugin {
    /// Render units per movement unit.
    pub render_scale: f32,
}

impl Default for StriderSmoothingPlugin {
    fn default() -> Self {
        Self { render_scale: 0.01 }
    }
}

impl Plugin for StriderSmoothingPlugin {
    fn build(&self, app: &mut App) {
        tracing::debug!("smoothing plugin: render scale {}", self.render_scale);
        app.insert_resource(RenderScale(self.render_scale));
        app.init_resource::<MovementScene>();
        app.add_systems(Update, tick_simulated_characters);
    }
}

fn tick_simulated_characters(
    time: Res<Time>,
    scene: Res<MovementScene>,
    scale: Res<RenderScale>,
    mut query: Query<(&mut Transform, &mut SimulatedCharacter)>,
) {
    let dt = time.delta_secs();
    for (mut transform, mut simulated) in query.iter_mut() {
        if dt > 0.0 {
            let mut ctx = MovementContext::new(&scene.0);
            ctx.world_time = time.elapsed_secs();
            simulated.0.simulated_tick(dt, &mut ctx);
        }
        let (location, rotation) = simulated.0.visual_pose();
        transform.translation = to_render_translation(&location, scale.0);
        transform.rotation = to_render_rotation(&rotation);
    }
}

fn to_render_translation(v: &na::Vector3<f32>, scale: f32) -> Vec3 {
    Vec3::new(v.x, v.y, v.z) * scale
}

fn to_render_rotation(q: &na::UnitQuaternion<f32>) -> Quat {
    Quat::from_xyzw(q.i, q.j, q.k, q.w)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ReplicatedMovement;
    use std::time::Duration;
    use strider_shared::{CapsuleSpec, CharacterMovement, MovementMode, MovementSettings, SmoothingSettings};

    #[test]
    fn transform_follows_the_smoothed_pose() {
        let mut app = App::new();
        app.add_plugins(StriderSmoothingPlugin::default());
        let mut time = Time::<()>::default();
        time.advance_by(Duration::from_millis(16));
        app.insert_resource(time);

        let character = CharacterMovement::new(MovementSettings::default(), CapsuleSpec::new(34.0, 88.0))
            .at(strider_shared::Vec3::new(100.0, 500.0, 0.0));
        let mut proxy = SimulatedProxy::new(character, SmoothingSettings::default());
        let scene = StaticWorld::new();
        proxy.receive_replicated_movement(
            &ReplicatedMovement {
                location: strider_shared::Vec3::new(100.0, 500.0, 0.0),
                rotation: strider_shared::Quat::identity(),
                velocity: strider_shared::Vec3::zeros(),
                base: None,
                mode: MovementMode::Flying.pack(0, MovementMode::Walking),
                server_time_stamp: 1.0,
            },
            &scene,
            1.0,
        );

        let entity = app
            .world_mut()
            .spawn((Transform::default(), SimulatedCharacter(proxy)))
            .id();
        app.update();

        let transform = app.world().get::<Transform>(entity).copied().unwrap_or_default();
        assert!((transform.translation - Vec3::new(1.0, 5.0, 0.0)).length() < 1e-3);
    }
}
