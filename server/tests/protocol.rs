//! Client and server driven against each other over a zero-latency link.

use strider_client::ClientPrediction;
use strider_server::ServerMoveHandler;
use strider_shared::collision::cuboid_from_pose;
use strider_shared::{
    CapsuleSpec, CharacterMovement, ClientAdjustment, MoveMessage, MovementContext, MovementMode,
    MovementSettings, NetworkSettings, Quat, StaticShape, StaticWorld, Vec3,
};

fn ground() -> StaticWorld {
    let mut world = StaticWorld::new();
    world.add_shape(StaticShape::Plane {
        normal: Vec3::y(),
        dist: 0.0,
    });
    world
}

fn walker(world: &StaticWorld) -> CharacterMovement {
    let mut cm = CharacterMovement::new(MovementSettings::default(), CapsuleSpec::new(34.0, 88.0))
        .at(Vec3::new(0.0, 90.2, 0.0));
    cm.set_movement_mode(MovementMode::Walking, world);
    cm
}

struct Session {
    client_world: StaticWorld,
    server_world: StaticWorld,
    client: ClientPrediction,
    server: ServerMoveHandler,
    client_character: CharacterMovement,
    server_character: CharacterMovement,
    corrections: usize,
    moves_sent: usize,
}

impl Session {
    fn new(client_world: StaticWorld, server_world: StaticWorld, settings: NetworkSettings) -> Self {
        let client_character = walker(&client_world);
        let server_character = walker(&server_world);
        Self {
            client: ClientPrediction::new(settings.clone()),
            server: ServerMoveHandler::new(settings, 0.0),
            client_world,
            server_world,
            client_character,
            server_character,
            corrections: 0,
            moves_sent: 0,
        }
    }

    /// One client tick of `client_dt` at server time `now`.
    fn tick(&mut self, client_dt: f32, accel: Vec3, now: f32) {
        let mut ctx = MovementContext::new(&self.client_world);
        let messages = self
            .client
            .replicate_move_to_server(&mut self.client_character, &mut ctx, client_dt, accel, now);

        let mut ctx = MovementContext::new(&self.server_world);
        for message in &messages {
            self.moves_sent += match message {
                MoveMessage::Dual { .. } | MoveMessage::DualHybridRootMotion { .. } => 2,
                MoveMessage::Single(_) | MoveMessage::Old(_) => 1,
            };
            self.server
                .server_move(message, &mut self.server_character, &mut ctx, now);
        }

        if let Some(adjustment) = self.server.send_client_adjustment(&self.server_character, now) {
            if !adjustment.is_ack() {
                self.corrections += 1;
            }
            self.client
                .client_adjust_position(&adjustment, &mut self.client_character, &self.client_world);
        }
    }

    fn run(&mut self, ticks: usize, dt: f32, client_dt: f32, accel: Vec3, start: f32) -> f32 {
        let mut now = start;
        for _ in 0..ticks {
            now += dt;
            self.tick(client_dt, accel, now);
        }
        now
    }
}

#[test]
fn honest_client_is_never_corrected() {
    let mut session = Session::new(ground(), ground(), NetworkSettings::default());
    let dt = 1.0 / 120.0;
    let now = session.run(120, dt, dt, Vec3::new(2048.0, 0.0, 500.0), 0.0);
    session.run(60, dt, dt, Vec3::zeros(), now);

    assert_eq!(session.corrections, 0);
    assert!(session.client_character.location.x > 300.0);
    let gap = (session.client_character.location - session.server_character.location).norm();
    assert!(gap < 0.1, "client and server differ by {gap}");
}

#[test]
fn unseen_wall_is_corrected_and_replayed() {
    let mut server_world = ground();
    server_world.add_shape(cuboid_from_pose(
        Vec3::new(10.0, 200.0, 500.0),
        Vec3::new(300.0, 200.0, 0.0),
        Quat::identity(),
    ));
    let mut session = Session::new(ground(), server_world, NetworkSettings::default());

    let dt = 1.0 / 60.0;
    let now = session.run(90, dt, dt, Vec3::new(2048.0, 0.0, 0.0), 0.0);
    session.run(60, dt, dt, Vec3::zeros(), now);

    assert!(session.corrections > 0);
    // Wall face at x = 290 and capsule radius 34.
    assert!(session.server_character.location.x < 257.0);
    let gap = (session.client_character.location - session.server_character.location).norm();
    assert!(gap < 2.0, "client still {gap} away from the server");
}

#[test]
fn fast_client_clock_does_not_buy_distance() {
    let mut session = Session::new(ground(), ground(), NetworkSettings::default());
    let dt = 1.0 / 60.0;
    // Client claims twice the time that really passes.
    session.run(120, dt, 2.0 * dt, Vec3::new(2048.0, 0.0, 0.0), 0.0);

    let travelled = session.server_character.location.x;
    // Two real seconds at 600 cm/s plus the tolerated margin.
    assert!(travelled < 600.0 * (2.0 + 0.25) + 50.0, "server moved {travelled}");
    assert!(travelled > 600.0);
    assert!(session.server.data.lifetime_raw_time_discrepancy > 1.0);
}

#[test]
fn combining_sends_fewer_moves_for_the_same_path() {
    let dt = 1.0 / 120.0;
    let accel = Vec3::new(2048.0, 0.0, 0.0);

    let mut combined = Session::new(ground(), ground(), NetworkSettings::default());
    combined.run(120, dt, dt, accel, 0.0);

    let mut separate = Session::new(
        ground(),
        ground(),
        NetworkSettings {
            enable_move_combining: false,
            ..NetworkSettings::default()
        },
    );
    separate.run(120, dt, dt, accel, 0.0);

    assert!(combined.moves_sent < separate.moves_sent);
    assert_eq!(combined.corrections, 0);
    assert_eq!(separate.corrections, 0);
    let gap = (combined.server_character.location - separate.server_character.location).norm();
    assert!(gap < 5.0, "paths differ by {gap}");
}

#[test]
fn correction_to_the_predicted_state_changes_nothing() {
    let world = ground();
    let mut client = ClientPrediction::new(NetworkSettings {
        enable_move_combining: false,
        ..NetworkSettings::default()
    });
    let mut character = walker(&world);
    let mut ctx = MovementContext::new(&world);

    let mut now = 0.0;
    for _ in 0..10 {
        now += 0.05;
        client.replicate_move_to_server(&mut character, &mut ctx, 1.0 / 60.0, Vec3::new(2048.0, 0.0, 0.0), now);
    }
    let before = character.location;
    let corrected = client.data.saved_moves[4].clone();

    client.client_adjust_position(
        &ClientAdjustment::AdjustPosition {
            timestamp: corrected.timestamp,
            new_loc: corrected.saved_location,
            new_vel: corrected.saved_velocity,
            base: corrected.end_base,
            mode: corrected.end_packed_movement_mode,
        },
        &mut character,
        &world,
    );
    assert!(client.client_update_position(&mut character, &mut ctx));
    assert!((character.location - before).norm() < 1e-2);
}
