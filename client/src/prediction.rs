use log::{debug, info, trace, warn};
use strider_shared::network::{OldMove, pack_view, unpack_view};
use strider_shared::quantize::quantize_acceleration;
use strider_shared::root_motion::RootMotionIdMappings;
use strider_shared::{
    CharacterMovement, ClientAdjustment, ClientMove, MoveMessage, MovementContext, NetworkSettings, Quat,
    RootMotionSourceGroup, SceneQuery, SurfaceId, Vec3,
};

use crate::saved_move::{PostUpdateMode, SavedMove};

/// Fastest and slowest allowed send intervals.
const MIN_NET_SEND_DELTA_TIME: f32 = 1.0 / 120.0;
const MAX_NET_SEND_DELTA_TIME: f32 = 1.0 / 5.0;

/// Move buffers and clocks of an autonomous proxy.
#[derive(Debug, Default)]
pub struct ClientPredictionData {
    /// Unacknowledged moves, oldest first. A held pending move is always last.
    pub saved_moves: Vec<SavedMove>,
    free_moves: Vec<SavedMove>,
    has_pending_move: bool,
    pub last_acked_move: Option<SavedMove>,
    /// Movement clock, stamped on every move.
    pub current_time_stamp: f32,
    /// Wall clock of the last send.
    pub client_update_time: f32,
    /// A correction arrived and the saved moves must be replayed.
    pub update_position: bool,
    root_motion_id_mappings: RootMotionIdMappings,
}

impl ClientPredictionData {
    /// The move held back for combining or sending with the next one.
    pub fn pending_move(&self) -> Option<&SavedMove> {
        if self.has_pending_move { self.saved_moves.last() } else { None }
    }

    fn take_pending_move(&mut self) -> Option<SavedMove> {
        if !self.has_pending_move {
            return None;
        }
        self.has_pending_move = false;
        self.saved_moves.pop()
    }

    /// Advance the movement clock by `dt` and return the delta to simulate.
    ///
    /// The clock wraps back by `min_time_between_time_stamp_resets` once it passes it,
    /// so the float keeps its precision over long sessions.
    pub fn update_time_stamp_and_delta_time(
        &mut self,
        dt: f32,
        character: &mut CharacterMovement,
        settings: &NetworkSettings,
    ) -> f32 {
        if self.current_time_stamp > settings.min_time_between_time_stamp_resets {
            info!(
                "client_move: timestamp reset at {}, {} saved moves",
                self.current_time_stamp,
                self.saved_moves.len()
            );
            for m in self.saved_moves.iter_mut().chain(self.last_acked_move.as_mut()) {
                m.old_time_stamp_before_reset = true;
            }
            character
                .current_root_motion
                .apply_time_stamp_reset(settings.min_time_between_time_stamp_resets);
            self.current_time_stamp -= settings.min_time_between_time_stamp_resets;
        }

        self.current_time_stamp += dt;
        let mut client_delta_time = dt;
        // The server derives deltas from timestamps; use the same rounding.
        if let Some(last) = self.saved_moves.last()
            && self.current_time_stamp > last.timestamp
        {
            client_delta_time = self.current_time_stamp - last.timestamp;
        }
        client_delta_time.min(settings.max_move_delta_time)
    }

    /// A cleared move from the free pool. A full buffer is dropped first.
    pub fn create_saved_move(&mut self, settings: &NetworkSettings) -> SavedMove {
        if self.saved_moves.len() >= settings.max_saved_move_count {
            warn!(
                "client_move: {} unacknowledged moves, dropping them all",
                self.saved_moves.len()
            );
            let dropped: Vec<_> = self.saved_moves.drain(..).collect();
            for m in dropped {
                self.free_move(m, settings);
            }
            self.has_pending_move = false;
        }
        let mut m = self.free_moves.pop().unwrap_or_default();
        m.clear();
        m
    }

    pub fn free_move(&mut self, m: SavedMove, settings: &NetworkSettings) {
        if self.free_moves.len() < settings.max_free_move_count {
            self.free_moves.push(m);
        }
    }

    /// Index of the saved move stamped `timestamp`.
    pub fn get_saved_move_index(&self, timestamp: f32) -> Option<usize> {
        if let Some(acked) = &self.last_acked_move
            && !acked.old_time_stamp_before_reset
            && timestamp <= acked.timestamp
        {
            return None;
        }
        self.saved_moves.iter().position(|m| m.timestamp == timestamp)
    }

    /// Make the move at `index` the last acknowledged one and drop everything older.
    pub fn ack_move(&mut self, index: usize, settings: &NetworkSettings) {
        if index >= self.saved_moves.len() {
            return;
        }
        let mut acked: Vec<_> = self.saved_moves.drain(..=index).collect();
        let Some(newest) = acked.pop() else {
            return;
        };
        for m in acked {
            self.free_move(m, settings);
        }
        if let Some(previous) = self.last_acked_move.replace(newest) {
            self.free_move(previous, settings);
        }
        if self.saved_moves.is_empty() {
            self.has_pending_move = false;
        }
    }
}

/// Client side of the movement protocol for the locally controlled character.
#[derive(Debug)]
pub struct ClientPrediction {
    pub settings: NetworkSettings,
    pub data: ClientPredictionData,
    /// Connection speed in bytes per second.
    pub net_speed: u32,
    pub player_count: u32,
}

impl ClientPrediction {
    pub fn new(settings: NetworkSettings) -> Self {
        Self {
            settings,
            data: ClientPredictionData::default(),
            net_speed: u32::MAX,
            player_count: 1,
        }
    }

    /// Simulate one tick of local input and return whatever should go to the server now.
    ///
    /// Replays saved moves first when a correction arrived since the last tick.
    pub fn replicate_move_to_server(
        &mut self,
        character: &mut CharacterMovement,
        ctx: &mut MovementContext<'_>,
        dt: f32,
        new_accel: Vec3,
        now: f32,
    ) -> Vec<MoveMessage> {
        self.client_update_position(character, ctx);

        let delta_time = self
            .data
            .update_time_stamp_and_delta_time(dt, character, &self.settings);

        // Oldest unacknowledged move the server must not miss. The last move may still combine.
        let old_move = {
            let candidates = self.data.saved_moves.len().saturating_sub(1);
            let last_acked = self.data.last_acked_move.as_ref();
            self.data.saved_moves[..candidates]
                .iter()
                .find(|m| m.is_important_move(last_acked, &self.settings))
                .filter(|m| !m.old_time_stamp_before_reset)
                .map(|m| OldMove {
                    timestamp: m.timestamp,
                    accel: m.acceleration,
                    flags: m.get_compressed_flags(),
                })
        };

        // The server sees the view and input at wire precision; simulate with the same.
        character.control_rotation = unpack_view(&pack_view(&character.control_rotation));
        let mut new_move = self.data.create_saved_move(&self.settings);
        new_move.set_move_for(
            character,
            self.data.current_time_stamp,
            delta_time,
            quantize_acceleration(new_accel),
        );
        new_move.set_initial_relative_location(character, ctx.scene);

        if self.settings.enable_move_combining {
            self.try_combine_with_pending(&mut new_move, character, ctx.scene);
        }

        character.move_autonomous(
            new_move.delta_time,
            new_move.get_compressed_flags(),
            new_move.acceleration,
            ctx,
        );
        new_move.post_update(character, PostUpdateMode::Record);
        self.data.saved_moves.push(new_move);

        let net_move_delta = self
            .get_client_net_send_delta_time(self.data.saved_moves.last(), character)
            .clamp(MIN_NET_SEND_DELTA_TIME, MAX_NET_SEND_DELTA_TIME);
        if !self.data.has_pending_move && now - self.data.client_update_time < net_move_delta {
            trace!("client_move: holding move {}", self.data.current_time_stamp);
            self.data.has_pending_move = true;
            return Vec::new();
        }

        let mut messages = Vec::with_capacity(2);
        if let Some(old) = old_move {
            messages.push(MoveMessage::Old(old));
        }
        let count = self.data.saved_moves.len();
        let current = &self.data.saved_moves[count - 1];
        let current_move = client_move_for(current);
        let pending = if self.data.has_pending_move {
            count.checked_sub(2).map(|i| &self.data.saved_moves[i])
        } else {
            None
        };
        messages.push(match pending {
            Some(pending) if current.anim_root_motion.is_some() && pending.anim_root_motion.is_none() => {
                MoveMessage::DualHybridRootMotion {
                    pending: client_move_for(pending),
                    current: current_move,
                }
            }
            Some(pending) => MoveMessage::Dual {
                pending: client_move_for(pending),
                current: current_move,
            },
            None => MoveMessage::Single(current_move),
        });

        self.data.has_pending_move = false;
        self.data.client_update_time = now;
        messages
    }

    /// Fold the held move into `new_move` and rewind the character to where it started.
    fn try_combine_with_pending(
        &mut self,
        new_move: &mut SavedMove,
        character: &mut CharacterMovement,
        scene: &dyn SceneQuery,
    ) {
        let Some(pending) = self.data.pending_move() else {
            return;
        };
        if !pending.can_combine_with(new_move, self.settings.max_move_delta_time, &self.settings) {
            return;
        }
        let reverted = pending.get_reverted_location(scene);
        if scene.overlap_capsule(reverted, character.capsule()) {
            debug!("client_move: not combining, start location {reverted:?} is blocked");
            return;
        }
        let Some(pending) = self.data.take_pending_move() else {
            return;
        };
        new_move.combine_with(&pending, character, reverted, scene);
        new_move.set_initial_position(character);
        new_move.set_initial_relative_location(character, scene);
        character.save_base_location(scene);
        trace!(
            "client_move: combined {} into {}, dt {}",
            pending.timestamp, new_move.timestamp, new_move.delta_time
        );
        self.data.free_move(pending, &self.settings);
    }

    /// Interval between sends, longer on slow connections, in crowded sessions and while idle.
    pub fn get_client_net_send_delta_time(&self, new_move: Option<&SavedMove>, character: &CharacterMovement) -> f32 {
        let s = &self.settings;
        let mut delta = if self.net_speed > s.client_net_send_move_throttle_at_net_speed
            && self.player_count <= s.client_net_send_move_throttle_over_players_count
        {
            s.client_net_send_move_delta_time
        } else {
            s.client_net_send_move_delta_time_throttled
                .max(2.0 * s.client_net_send_move_delta_time)
        };

        let idle = new_move.is_some_and(|m| m.acceleration == Vec3::zeros()) && character.velocity == Vec3::zeros();
        let same_view = match (new_move, &self.data.last_acked_move) {
            (Some(m), Some(acked)) => m.start_control_rotation == acked.start_control_rotation,
            _ => false,
        };
        if idle && same_view {
            delta = delta.max(s.client_net_send_move_delta_time_stationary);
        }
        delta
    }

    /// The server accepted the move stamped `timestamp`.
    pub fn client_ack_good_move(&mut self, timestamp: f32) {
        match self.data.get_saved_move_index(timestamp) {
            Some(index) => self.data.ack_move(index, &self.settings),
            None => trace!("client_move: ack for unknown move {timestamp}"),
        }
    }

    /// Apply any server response. Corrections snap the character and schedule a replay.
    pub fn client_adjust_position(
        &mut self,
        adjustment: &ClientAdjustment,
        character: &mut CharacterMovement,
        scene: &dyn SceneQuery,
    ) {
        match adjustment {
            ClientAdjustment::AckGoodMove { timestamp } => self.client_ack_good_move(*timestamp),
            ClientAdjustment::VeryShortAdjustPosition {
                timestamp,
                new_loc,
                base,
                mode,
            } => self.adjust_position(*timestamp, *new_loc, Vec3::zeros(), None, *base, *mode, character, scene),
            ClientAdjustment::AdjustPosition {
                timestamp,
                new_loc,
                new_vel,
                base,
                mode,
            } => self.adjust_position(*timestamp, *new_loc, *new_vel, None, *base, *mode, character, scene),
            ClientAdjustment::AdjustRootMotionSourcePosition {
                timestamp,
                root_motion,
                new_loc,
                new_rot,
                new_vel,
                base,
                mode,
            } => {
                self.adjust_root_motion_sources(*timestamp, root_motion, character);
                self.adjust_position(
                    *timestamp,
                    *new_loc,
                    *new_vel,
                    Some(*new_rot),
                    *base,
                    *mode,
                    character,
                    scene,
                );
            }
        }
    }

    /// Match the server's sources to ours and take their state, here and on the corrected move.
    fn adjust_root_motion_sources(
        &mut self,
        timestamp: f32,
        server_root_motion: &RootMotionSourceGroup,
        character: &mut CharacterMovement,
    ) {
        let Some(index) = self.data.get_saved_move_index(timestamp) else {
            return;
        };
        let mut server = server_root_motion.clone();
        self.data.root_motion_id_mappings.convert_server_ids_to_local_ids(
            &character.current_root_motion,
            &mut server,
            timestamp,
        );
        server.cull_invalid_sources();

        self.data.saved_moves[index]
            .saved_root_motion
            .update_state_from(&server, false);
        character.current_root_motion.update_state_from(&server, false);
    }

    #[allow(clippy::too_many_arguments)]
    fn adjust_position(
        &mut self,
        timestamp: f32,
        new_loc: Vec3,
        new_vel: Vec3,
        new_rot: Option<Quat>,
        new_base: Option<SurfaceId>,
        mode: u8,
        character: &mut CharacterMovement,
        scene: &dyn SceneQuery,
    ) {
        let Some(index) = self.data.get_saved_move_index(timestamp) else {
            if let Some(acked) = &self.data.last_acked_move {
                info!(
                    "client_move: no move for correction {}, last acked {}, current {}",
                    timestamp, acked.timestamp, self.data.current_time_stamp
                );
            }
            return;
        };
        let predicted = self.data.saved_moves[index].saved_location;
        self.data.ack_move(index, &self.settings);

        character.location = new_loc;
        character.velocity = new_vel;
        if let Some(rotation) = new_rot {
            character.rotation = rotation;
        }
        character.set_base(new_base, scene);
        character.apply_network_movement_mode(mode, scene);
        character.just_teleported = true;
        character.force_next_floor_check = true;
        character.save_base_location(scene);

        debug!(
            "client_move: corrected {} by {:.2} to {:?}",
            timestamp,
            (new_loc - predicted).norm(),
            new_loc
        );
        self.data.update_position = true;
    }

    /// Replay every unacknowledged move from the corrected state. Returns whether anything ran.
    pub fn client_update_position(&mut self, character: &mut CharacterMovement, ctx: &mut MovementContext<'_>) -> bool {
        if !self.data.update_position {
            return false;
        }
        self.data.update_position = false;
        if self.data.saved_moves.is_empty() {
            return false;
        }

        let real_acceleration = character.acceleration;
        let real_analog = character.analog_input_modifier;
        let real_control_rotation = character.control_rotation;
        let real_pressed_jump = character.pressed_jump;
        let real_wants_to_crouch = character.wants_to_crouch;
        let was_replaying = ctx.replaying;
        let real_movement_time = ctx.movement_time;
        ctx.replaying = true;
        character.force_next_floor_check = true;

        let mut moves = std::mem::take(&mut self.data.saved_moves);
        for m in &mut moves {
            m.prep_move_for(character);
            character.control_rotation = unpack_view(&m.packed_view());
            ctx.movement_time = Some(m.timestamp - m.delta_time);
            character.move_autonomous(m.delta_time, m.get_compressed_flags(), m.acceleration, ctx);
            m.post_update(character, PostUpdateMode::Replay);
        }
        trace!("client_move: replayed {} moves to {:?}", moves.len(), character.location);
        self.data.saved_moves = moves;

        // Its start state no longer matches what was simulated.
        if self.data.has_pending_move
            && let Some(pending) = self.data.saved_moves.last_mut()
        {
            pending.force_no_combine = true;
        }

        ctx.replaying = was_replaying;
        ctx.movement_time = real_movement_time;
        character.acceleration = real_acceleration;
        character.analog_input_modifier = real_analog;
        character.control_rotation = real_control_rotation;
        character.pressed_jump = real_pressed_jump;
        character.wants_to_crouch = real_wants_to_crouch;
        true
    }
}

fn client_move_for(m: &SavedMove) -> ClientMove {
    ClientMove::new(
        m.timestamp,
        m.acceleration,
        m.saved_location,
        m.get_compressed_flags(),
        m.packed_view(),
        m.end_packed_movement_mode,
        m.end_base,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use strider_shared::{CapsuleSpec, MoveFlags, MovementMode, MovementSettings, StaticShape, StaticWorld};

    const DT: f32 = 1.0 / 60.0;

    fn world() -> StaticWorld {
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

    fn no_combining() -> NetworkSettings {
        NetworkSettings {
            enable_move_combining: false,
            ..NetworkSettings::default()
        }
    }

    #[test]
    fn held_move_goes_out_with_the_next_one() {
        let world = world();
        let mut cm = walker(&world);
        let mut client = ClientPrediction::new(no_combining());
        let mut ctx = MovementContext::new(&world);
        let accel = Vec3::new(2048.0, 0.0, 0.0);

        let first = client.replicate_move_to_server(&mut cm, &mut ctx, DT, accel, 1.0);
        assert_eq!(first.len(), 1);
        let held = client.replicate_move_to_server(&mut cm, &mut ctx, DT, accel, 1.001);
        assert!(held.is_empty());
        assert!(client.data.pending_move().is_some());

        let sent = client.replicate_move_to_server(&mut cm, &mut ctx, DT, accel, 1.001);
        assert!(matches!(sent.as_slice(), [MoveMessage::Dual { .. }]));
        assert!(client.data.pending_move().is_none());
        assert_eq!(client.data.saved_moves.len(), 3);
    }

    #[test]
    fn steady_input_is_combined() {
        let world = world();
        let mut cm = walker(&world);
        let mut client = ClientPrediction::new(NetworkSettings::default());
        let mut ctx = MovementContext::new(&world);
        let accel = Vec3::new(2048.0, 0.0, 0.0);

        client.replicate_move_to_server(&mut cm, &mut ctx, DT, accel, 1.0);
        // Within one send interval: first held, second folded into it.
        client.replicate_move_to_server(&mut cm, &mut ctx, DT, accel, 1.001);
        client.replicate_move_to_server(&mut cm, &mut ctx, DT, accel, 1.002);
        assert_eq!(client.data.saved_moves.len(), 2);
        let pending = client.data.pending_move().map(|m| m.delta_time).unwrap_or_default();
        assert!((pending - 2.0 * DT).abs() < 1e-4, "pending dt {pending}");
    }

    #[test]
    fn combined_move_ends_where_separate_moves_do() {
        let world = world();
        let accel = Vec3::new(2048.0, 0.0, 0.0);
        let mut ctx = MovementContext::new(&world);

        // Two identical characters brought to full walking speed.
        let mut combined_cm = walker(&world);
        let mut separate_cm = walker(&world);
        for _ in 0..120 {
            combined_cm.move_autonomous(DT, MoveFlags::empty(), accel, &mut ctx);
            separate_cm.move_autonomous(DT, MoveFlags::empty(), accel, &mut ctx);
        }
        assert!((combined_cm.velocity.x - 600.0).abs() < 1e-3);

        let mut combined = ClientPrediction::new(NetworkSettings::default());
        let mut separate = ClientPrediction::new(no_combining());
        for now in [1.0, 1.001, 1.002] {
            combined.replicate_move_to_server(&mut combined_cm, &mut ctx, DT, accel, now);
            separate.replicate_move_to_server(&mut separate_cm, &mut ctx, DT, accel, now);
        }
        let pending = combined.data.pending_move().map(|m| m.delta_time).unwrap_or_default();
        assert!((pending - 2.0 * DT).abs() < 1e-4, "moves were not combined");
        assert_eq!(separate.data.saved_moves.len(), 3);

        let gap = (combined_cm.location - separate_cm.location).norm();
        assert!(gap < 1e-2, "combined move ended {gap} away");
        assert!((combined_cm.velocity - separate_cm.velocity).norm() < 1e-3);
    }

    #[test]
    fn ack_drops_older_moves() {
        let world = world();
        let mut cm = walker(&world);
        let mut client = ClientPrediction::new(no_combining());
        let mut ctx = MovementContext::new(&world);

        let mut now = 1.0;
        for _ in 0..5 {
            client.replicate_move_to_server(&mut cm, &mut ctx, DT, Vec3::new(2048.0, 0.0, 0.0), now);
            now += 0.1;
        }
        let third = client.data.saved_moves[2].timestamp;
        client.client_ack_good_move(third);
        assert_eq!(client.data.saved_moves.len(), 2);
        assert_eq!(client.data.last_acked_move.as_ref().map(|m| m.timestamp), Some(third));

        // Acks for older moves are ignored.
        client.client_ack_good_move(client.data.saved_moves[0].timestamp - DT);
        assert_eq!(client.data.saved_moves.len(), 2);
    }

    #[test]
    fn correction_replays_unacknowledged_moves() {
        let world = world();
        let mut cm = walker(&world);
        let mut client = ClientPrediction::new(no_combining());
        let mut ctx = MovementContext::new(&world);
        let accel = Vec3::new(2048.0, 0.0, 0.0);

        let mut now = 1.0;
        for _ in 0..6 {
            client.replicate_move_to_server(&mut cm, &mut ctx, DT, accel, now);
            now += 0.1;
        }
        let corrected = client.data.saved_moves[2].clone();
        let predicted_end = cm.location;

        // Server puts the character 50 units to the side at move three.
        let shift = Vec3::new(0.0, 0.0, 50.0);
        client.client_adjust_position(
            &ClientAdjustment::AdjustPosition {
                timestamp: corrected.timestamp,
                new_loc: corrected.saved_location + shift,
                new_vel: corrected.saved_velocity,
                base: corrected.end_base,
                mode: corrected.end_packed_movement_mode,
            },
            &mut cm,
            &world,
        );
        assert_eq!(client.data.saved_moves.len(), 3);
        assert!(client.client_update_position(&mut cm, &mut ctx));
        assert!((cm.location - (predicted_end + shift)).norm() < 0.5, "{:?}", cm.location);
        assert!(!client.client_update_position(&mut cm, &mut ctx));
    }

    /// Location, velocity, rotation, mode and the saved move stamps.
    fn snapshot(client: &ClientPrediction, cm: &CharacterMovement) -> (Vec3, Vec3, Quat, u8, Vec<f32>) {
        (
            cm.location,
            cm.velocity,
            cm.rotation,
            cm.pack_network_movement_mode(),
            client.data.saved_moves.iter().map(|m| m.timestamp).collect(),
        )
    }

    #[test]
    fn repeated_corrections_change_nothing() {
        let world = world();
        let corrections: [fn(&SavedMove) -> ClientAdjustment; 4] = [
            |m| ClientAdjustment::AckGoodMove { timestamp: m.timestamp },
            |m| ClientAdjustment::VeryShortAdjustPosition {
                timestamp: m.timestamp,
                new_loc: m.saved_location + Vec3::new(0.0, 0.0, 5.0),
                base: m.end_base,
                mode: m.end_packed_movement_mode,
            },
            |m| ClientAdjustment::AdjustPosition {
                timestamp: m.timestamp,
                new_loc: m.saved_location + Vec3::new(0.0, 0.0, 5.0),
                new_vel: m.saved_velocity,
                base: m.end_base,
                mode: m.end_packed_movement_mode,
            },
            |m| ClientAdjustment::AdjustRootMotionSourcePosition {
                timestamp: m.timestamp,
                root_motion: RootMotionSourceGroup::default(),
                new_loc: m.saved_location + Vec3::new(0.0, 0.0, 5.0),
                new_rot: strider_shared::utils::quat_from_yaw(0.5),
                new_vel: m.saved_velocity,
                base: m.end_base,
                mode: m.end_packed_movement_mode,
            },
        ];

        for make in corrections {
            let mut cm = walker(&world);
            let mut client = ClientPrediction::new(no_combining());
            let mut ctx = MovementContext::new(&world);
            let mut now = 1.0;
            for _ in 0..6 {
                client.replicate_move_to_server(&mut cm, &mut ctx, DT, Vec3::new(2048.0, 0.0, 0.0), now);
                now += 0.1;
            }
            let adjustment = make(&client.data.saved_moves[2]);

            client.client_adjust_position(&adjustment, &mut cm, &world);
            client.client_update_position(&mut cm, &mut ctx);
            // Local turn after the correction was handled.
            cm.rotation = strider_shared::utils::quat_from_yaw(-1.0);
            let before = snapshot(&client, &cm);

            client.client_adjust_position(&adjustment, &mut cm, &world);
            assert!(!client.client_update_position(&mut cm, &mut ctx), "{adjustment:?}");
            assert_eq!(snapshot(&client, &cm), before, "{adjustment:?}");
        }
    }

    #[test]
    fn clock_wraps_and_marks_old_moves() {
        let world = world();
        let mut cm = walker(&world);
        let settings = NetworkSettings {
            min_time_between_time_stamp_resets: 1.0,
            ..no_combining()
        };
        let mut client = ClientPrediction::new(settings);
        let mut ctx = MovementContext::new(&world);

        let mut now = 0.0;
        for _ in 0..12 {
            now += 0.11;
            client.replicate_move_to_server(&mut cm, &mut ctx, 0.11, Vec3::zeros(), now);
        }
        assert!(client.data.current_time_stamp < 1.0);
        assert!(client.data.saved_moves.iter().any(|m| m.old_time_stamp_before_reset));
        assert!(client.data.saved_moves.last().is_some_and(|m| !m.old_time_stamp_before_reset));
    }

    #[test]
    fn full_buffer_is_dropped() {
        let world = world();
        let mut cm = walker(&world);
        let settings = NetworkSettings {
            max_saved_move_count: 4,
            ..no_combining()
        };
        let mut client = ClientPrediction::new(settings);
        let mut ctx = MovementContext::new(&world);

        let mut now = 1.0;
        for _ in 0..5 {
            client.replicate_move_to_server(&mut cm, &mut ctx, DT, Vec3::zeros(), now);
            now += 0.1;
        }
        assert_eq!(client.data.saved_moves.len(), 1);
    }

    #[test]
    fn crowded_sessions_send_less_often() {
        let world = world();
        let cm = walker(&world);
        let mut client = ClientPrediction::new(NetworkSettings::default());
        let fast = client.get_client_net_send_delta_time(None, &cm);
        client.player_count = 64;
        let slow = client.get_client_net_send_delta_time(None, &cm);
        assert!(slow > fast);
    }
}
