use log::{debug, info, trace};
use strider_shared::network::{OldMove, unpack_view};
use strider_shared::{
    CharacterMovement, ClientAdjustment, ClientMove, MovementContext, MoveMessage, NetworkSettings, Vec3,
};

use crate::prediction::{PendingAdjustment, ServerPredictionData, TimeDiscrepancyReport};

/// Hooks for project policy on suspicious clients.
pub trait MoveObserver: Send {
    /// A client's clock ran ahead of the server by more than the allowed margin.
    fn on_time_discrepancy_detected(&mut self, report: &TimeDiscrepancyReport) {
        info!(
            "server_move: time discrepancy detected, current {:.3}s, lifetime raw {:.3}s over {:.1}s, this move {:.3}s",
            report.current_time_discrepancy,
            report.lifetime_raw_time_discrepancy,
            report.lifetime,
            report.current_move_error
        );
    }
}

/// Observer that only logs.
#[derive(Debug, Default)]
pub struct LogObserver;

impl MoveObserver for LogObserver {}

/// Authoritative move processing for one connection.
///
/// Feed every received [`MoveMessage`] to [`server_move`](Self::server_move) and
/// call [`send_client_adjustment`](Self::send_client_adjustment) once per server tick.
pub struct ServerMoveHandler {
    pub settings: NetworkSettings,
    pub data: ServerPredictionData,
    observer: Box<dyn MoveObserver>,
    last_client_good_move_ack_time: f32,
    last_client_adjustment_time: f32,
    network_large_client_correction: bool,
}

impl ServerMoveHandler {
    pub fn new(settings: NetworkSettings, now: f32) -> Self {
        Self {
            settings,
            data: ServerPredictionData::new(now),
            observer: Box::new(LogObserver),
            last_client_good_move_ack_time: f32::NEG_INFINITY,
            last_client_adjustment_time: f32::NEG_INFINITY,
            network_large_client_correction: false,
        }
    }

    pub fn with_observer(mut self, observer: Box<dyn MoveObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Simulate the moves in `msg` on the server's copy of the character.
    ///
    /// Returns false when the newest move was rejected for its timestamp.
    pub fn server_move(
        &mut self,
        msg: &MoveMessage,
        character: &mut CharacterMovement,
        ctx: &mut MovementContext<'_>,
        now: f32,
    ) -> bool {
        match msg {
            MoveMessage::Single(m) => self.process_client_move(m, true, character, ctx, now),
            MoveMessage::Dual { pending, current } => {
                self.process_client_move(pending, false, character, ctx, now);
                self.process_client_move(current, true, character, ctx, now)
            }
            MoveMessage::DualHybridRootMotion { pending, current } => {
                // The held move predates the animation root motion.
                let anim = character.anim_root_motion.take();
                self.process_client_move(pending, false, character, ctx, now);
                character.anim_root_motion = anim;
                self.process_client_move(current, true, character, ctx, now)
            }
            MoveMessage::Old(m) => self.server_move_old(m, character, ctx, now),
        }
    }

    fn process_client_move(
        &mut self,
        m: &ClientMove,
        check_client_error: bool,
        character: &mut CharacterMovement,
        ctx: &mut MovementContext<'_>,
        now: f32,
    ) -> bool {
        let Some(dt) = self.begin_move(m.timestamp, true, character, now) else {
            return false;
        };
        character.control_rotation = unpack_view(&m.view);
        if dt > 0.0 {
            ctx.movement_time = Some(m.timestamp - dt);
            character.move_autonomous(dt, m.flags, m.accel, ctx);
        }
        if check_client_error {
            self.server_move_handle_client_error(m, dt, character, now);
        }
        true
    }

    /// Replay an old important move. Its end location is never checked.
    fn server_move_old(
        &mut self,
        m: &OldMove,
        character: &mut CharacterMovement,
        ctx: &mut MovementContext<'_>,
        now: f32,
    ) -> bool {
        // Old moves are resent until acked, so arriving stale is expected.
        let Some(dt) = self.begin_move(m.timestamp, false, character, now) else {
            return false;
        };
        if dt > 0.0 {
            ctx.movement_time = Some(m.timestamp - dt);
            character.move_autonomous(dt, m.flags, m.accel, ctx);
        }
        true
    }

    /// Verify the timestamp and account for the move. Returns the delta time to simulate.
    fn begin_move(
        &mut self,
        timestamp: f32,
        force_update_when_stale: bool,
        character: &mut CharacterMovement,
        now: f32,
    ) -> Option<f32> {
        let (check, report) = self.data.verify_client_time_stamp(timestamp, now, &self.settings);
        if let Some(report) = report {
            self.observer.on_time_discrepancy_detected(&report);
        }
        if !check.valid {
            if force_update_when_stale && self.data.last_request_needs_forced_updates {
                // The client keeps resending moves we already have; make the next reply a correction.
                self.data.force_client_update = true;
            }
            trace!(
                "server_move: timestamp expired {}, current {}",
                timestamp, self.data.current_client_time_stamp
            );
            return None;
        }
        if check.reset_detected {
            character
                .current_root_motion
                .apply_time_stamp_reset(self.settings.min_time_between_time_stamp_resets);
        }

        let dt = self.data.get_server_move_delta_time(timestamp, &self.settings);
        self.data.accept_move(timestamp, dt, now);
        Some(dt)
    }

    /// Queue a correction when the client disagrees with the server, an ack otherwise.
    pub fn server_move_handle_client_error(
        &mut self,
        m: &ClientMove,
        dt: f32,
        character: &CharacterMovement,
        now: f32,
    ) {
        // Rate limit corrections, but a newer move received this tick may replace one.
        if self.data.last_update_time != now
            && now - self.data.last_update_time < self.settings.client_error_update_rate_limit
        {
            return;
        }

        self.network_large_client_correction = self.data.force_client_update;
        if self.data.force_client_update || self.server_check_client_error(m, character) {
            self.data.pending_adjustment = PendingAdjustment {
                timestamp: m.timestamp,
                delta_time: dt,
                new_loc: character.location,
                new_vel: character.velocity,
                new_rot: character.rotation,
                new_base: character.base,
                movement_mode: character.pack_network_movement_mode(),
                ack_good_move: false,
            };
            self.data.last_update_time = now;
            debug!(
                "server_move: correction queued for {} at {:?}, client reported {:?}",
                m.timestamp, character.location, m.client_loc
            );
        } else {
            self.data.pending_adjustment.timestamp = m.timestamp;
            self.data.pending_adjustment.ack_good_move = true;
        }
        self.data.force_client_update = false;
    }

    /// Whether the client's reported end state is beyond tolerance.
    pub fn server_check_client_error(&mut self, m: &ClientMove, character: &CharacterMovement) -> bool {
        let loc_diff = character.location - m.client_loc;
        if loc_diff.norm_squared() > self.settings.max_position_error_squared {
            return true;
        }
        if character.pack_network_movement_mode() != m.client_mode {
            // Mode disagreements are corrected on the fast cadence.
            self.network_large_client_correction = true;
            return true;
        }
        false
    }

    /// Turn the pending adjustment into a message, at most once per server tick.
    ///
    /// Throttled adjustments are dropped; a still-wrong client is caught by its next move.
    pub fn send_client_adjustment(&mut self, character: &CharacterMovement, now: f32) -> Option<ClientAdjustment> {
        let pending = self.data.pending_adjustment;
        if pending.timestamp <= 0.0 {
            return None;
        }

        let mut adjustment = None;
        if pending.ack_good_move {
            if now - self.last_client_good_move_ack_time > self.settings.min_time_between_client_ack_good_moves {
                self.last_client_good_move_ack_time = now;
                adjustment = Some(ClientAdjustment::AckGoodMove {
                    timestamp: pending.timestamp,
                });
            }
        } else {
            let normal = self.settings.min_time_between_client_adjustments;
            let large = self.settings.min_time_between_client_adjustments_large_correction;
            let threshold = if self.network_large_client_correction {
                normal.min(large)
            } else {
                normal.max(large)
            };
            if now - self.last_client_adjustment_time > threshold {
                self.last_client_adjustment_time = now;
                adjustment = Some(if character.current_root_motion.has_active_root_motion_sources() {
                    ClientAdjustment::AdjustRootMotionSourcePosition {
                        timestamp: pending.timestamp,
                        root_motion: character.current_root_motion.clone(),
                        new_loc: pending.new_loc,
                        new_rot: pending.new_rot,
                        new_vel: pending.new_vel,
                        base: pending.new_base,
                        mode: pending.movement_mode,
                    }
                } else if pending.new_vel == Vec3::zeros() {
                    ClientAdjustment::VeryShortAdjustPosition {
                        timestamp: pending.timestamp,
                        new_loc: pending.new_loc,
                        base: pending.new_base,
                        mode: pending.movement_mode,
                    }
                } else {
                    ClientAdjustment::AdjustPosition {
                        timestamp: pending.timestamp,
                        new_loc: pending.new_loc,
                        new_vel: pending.new_vel,
                        base: pending.new_base,
                        mode: pending.movement_mode,
                    }
                });
            } else {
                trace!("server_move: correction for {} throttled", pending.timestamp);
            }
        }

        self.data.pending_adjustment.timestamp = 0.0;
        self.data.pending_adjustment.ack_good_move = false;
        self.data.force_client_update = false;
        adjustment
    }
}
