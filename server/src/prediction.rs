use log::{debug, info, trace};
use strider_shared::{MIN_TICK_TIME, NetworkSettings, Quat, SurfaceId, Vec3};

/// Correction or acknowledgement waiting for the next [`send_client_adjustment`].
///
/// [`send_client_adjustment`]: crate::ServerMoveHandler::send_client_adjustment
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PendingAdjustment {
    /// Client timestamp of the move this answers; zero when nothing is pending.
    pub timestamp: f32,
    pub delta_time: f32,
    pub new_loc: Vec3,
    pub new_vel: Vec3,
    pub new_rot: Quat,
    pub new_base: Option<SurfaceId>,
    pub movement_mode: u8,
    pub ack_good_move: bool,
}

impl Default for PendingAdjustment {
    fn default() -> Self {
        Self {
            timestamp: 0.0,
            delta_time: 0.0,
            new_loc: Vec3::zeros(),
            new_vel: Vec3::zeros(),
            new_rot: Quat::identity(),
            new_base: None,
            movement_mode: 0,
            ack_good_move: false,
        }
    }
}

/// Outcome of looking at an incoming timestamp.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeStampCheck {
    pub valid: bool,
    /// The client restarted its clock.
    pub reset_detected: bool,
}

/// Server side movement state of one connection.
#[derive(Clone, Debug, Default)]
pub struct ServerPredictionData {
    pub pending_adjustment: PendingAdjustment,

    /// Timestamp of the last accepted move.
    pub current_client_time_stamp: f32,
    /// Timestamp of the last received move, accepted or not.
    pub last_received_client_time_stamp: f32,
    pub last_request_needs_forced_updates: bool,
    /// Sum of the delta times the server actually simulated.
    pub server_accumulated_client_time_stamp: f64,
    /// Server time of the last movement update.
    pub server_time_stamp: f32,
    /// Server time of the last accepted move; `None` until the first one.
    pub server_time_stamp_last_server_move: Option<f32>,
    /// Server time a correction was last queued.
    pub last_update_time: f32,
    pub last_time_stamp_reset_server_time: f32,
    pub force_client_update: bool,

    /// Accumulated client time ahead (positive) or behind (negative) of the server.
    pub time_discrepancy: f32,
    /// Unbounded sum of every move's timing error, for diagnostics.
    pub lifetime_raw_time_discrepancy: f32,
    pub resolving_time_discrepancy: bool,
    pub time_discrepancy_resolution_move_delta_override: f32,
    pub time_discrepancy_accumulated_client_deltas_since_last_server_tick: f32,
    pub world_creation_time: f32,
}

/// Timing error that pushed a client over the allowed margin.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimeDiscrepancyReport {
    pub current_time_discrepancy: f32,
    pub lifetime_raw_time_discrepancy: f32,
    pub lifetime: f32,
    pub current_move_error: f32,
}

impl ServerPredictionData {
    pub fn new(world_creation_time: f32) -> Self {
        Self {
            world_creation_time,
            ..Default::default()
        }
    }

    /// Whether `timestamp` may be simulated: newer than the last accepted one,
    /// or an intentional clock reset.
    pub fn is_client_time_stamp_valid(&self, timestamp: f32, settings: &NetworkSettings) -> TimeStampCheck {
        let mut check = TimeStampCheck {
            valid: false,
            reset_detected: false,
        };
        if timestamp <= 0.0 || !timestamp.is_finite() {
            return check;
        }

        let delta = timestamp - self.current_client_time_stamp;
        // Very large jumps only happen around a reset.
        if delta.abs() > settings.min_time_between_time_stamp_resets * 0.5 {
            check.reset_detected = true;
            // A big forward jump is an outdated move from before the reset.
            check.valid = delta < 0.0;
            return check;
        }

        check.valid = timestamp > self.current_client_time_stamp && delta >= MIN_TICK_TIME;
        check
    }

    /// Validate `timestamp` and update the clock bookkeeping.
    ///
    /// Returns the check result; on a detected reset the caller rebases any
    /// timestamped state it owns by `min_time_between_time_stamp_resets`.
    pub fn verify_client_time_stamp(
        &mut self,
        timestamp: f32,
        now: f32,
        settings: &NetworkSettings,
    ) -> (TimeStampCheck, Option<TimeDiscrepancyReport>) {
        let check = self.is_client_time_stamp_valid(timestamp, settings);
        let mut report = None;
        let mut needs_forced_update = false;

        if check.valid {
            if check.reset_detected {
                info!(
                    "server_move: timestamp reset detected, current {} new {}",
                    self.current_client_time_stamp, timestamp
                );
                self.last_time_stamp_reset_server_time = now;
                self.current_client_time_stamp -= settings.min_time_between_time_stamp_resets;
            } else {
                report = self.process_client_time_stamp_for_time_discrepancy(timestamp, now, settings);
            }
        } else if check.reset_detected {
            debug!(
                "server_move: timestamp expired before reset, current {} received {}",
                self.current_client_time_stamp, timestamp
            );
        } else {
            trace!(
                "server_move: stale timestamp {} (current {})",
                timestamp, self.current_client_time_stamp
            );
            needs_forced_update = timestamp <= self.last_received_client_time_stamp;
        }

        self.last_received_client_time_stamp = timestamp;
        self.last_request_needs_forced_updates = needs_forced_update;
        (check, report)
    }

    /// Track client time against server time and, once the client runs too far
    /// ahead, shrink its move delta times until the stolen time is paid back.
    ///
    /// Returns a report when the discrepancy first crosses the allowed margin.
    pub fn process_client_time_stamp_for_time_discrepancy(
        &mut self,
        client_time_stamp: f32,
        now: f32,
        settings: &NetworkSettings,
    ) -> Option<TimeDiscrepancyReport> {
        if !settings.movement_time_discrepancy_detection {
            return None;
        }
        let last_server_move = self.server_time_stamp_last_server_move?;

        let server_delta = now - last_server_move;
        let client_delta = client_time_stamp - self.current_client_time_stamp;
        let client_error = client_delta - server_delta;
        self.lifetime_raw_time_discrepancy += client_error;

        // Bounded discrepancy with drift forgiveness.
        let raw = self.time_discrepancy + client_error;
        let mut new_time_discrepancy = raw;
        let drift = settings.movement_time_discrepancy_drift_allowance;
        if drift > 0.0 {
            new_time_discrepancy = if new_time_discrepancy > 0.0 {
                (new_time_discrepancy - server_delta * drift).max(0.0)
            } else {
                (new_time_discrepancy + server_delta * drift).min(0.0)
            };
        }
        new_time_discrepancy = new_time_discrepancy.max(settings.movement_time_discrepancy_min_time_margin);

        // Share of this move's error that survived the bounds.
        let effective_client_error = if raw != 0.0 {
            client_error * (new_time_discrepancy / raw)
        } else {
            client_error
        };

        self.resolving_time_discrepancy = self.resolving_time_discrepancy && self.time_discrepancy > 0.0;

        let mut report = None;
        if !self.resolving_time_discrepancy {
            if new_time_discrepancy > settings.movement_time_discrepancy_max_time_margin {
                if settings.movement_time_discrepancy_resolution {
                    self.resolving_time_discrepancy = true;
                    // This move's own error is not allowed to count.
                    self.time_discrepancy = new_time_discrepancy - effective_client_error;
                } else {
                    // Detect only; start over.
                    self.time_discrepancy = 0.0;
                }
                report = Some(TimeDiscrepancyReport {
                    current_time_discrepancy: new_time_discrepancy,
                    lifetime_raw_time_discrepancy: self.lifetime_raw_time_discrepancy,
                    lifetime: now - self.world_creation_time,
                    current_move_error: client_error,
                });
            } else {
                self.time_discrepancy = new_time_discrepancy;
            }
        }

        if self.resolving_time_discrepancy {
            if settings.movement_time_discrepancy_force_corrections_during_resolution {
                self.force_client_update = true;
            }

            // Moves are bounded by real server time while resolving.
            let server_delta_since_last_update = now - self.server_time_stamp;
            let first_move_this_tick = server_delta_since_last_update > 0.0;
            let base_delta_time = self.get_base_server_move_delta_time(client_time_stamp, settings);

            if !first_move_this_tick {
                self.time_discrepancy_accumulated_client_deltas_since_last_server_tick += base_delta_time;
            }

            let server_bound_delta_time = (base_delta_time
                + self.time_discrepancy_accumulated_client_deltas_since_last_server_tick)
                .min(server_delta_since_last_update)
                .max(0.0);

            if first_move_this_tick {
                self.time_discrepancy_accumulated_client_deltas_since_last_server_tick = 0.0;
            }

            let rate = settings.movement_time_discrepancy_resolution_rate.clamp(0.0, 1.0);
            let mut time_to_pay_back = (server_bound_delta_time * rate).min(self.time_discrepancy.max(0.0));
            let mut delta_time_after_payback = server_bound_delta_time - time_to_pay_back;

            if delta_time_after_payback < MIN_TICK_TIME {
                delta_time_after_payback = MIN_TICK_TIME;
                time_to_pay_back = (server_bound_delta_time - MIN_TICK_TIME).max(0.0).min(time_to_pay_back);
            }

            self.time_discrepancy_resolution_move_delta_override = delta_time_after_payback;
            self.time_discrepancy = (self.time_discrepancy - time_to_pay_back)
                .max(settings.movement_time_discrepancy_min_time_margin);
            trace!(
                "server_move: resolving time discrepancy, delta {} paid back {} remaining {}",
                delta_time_after_payback, time_to_pay_back, self.time_discrepancy
            );
        }
        report
    }

    /// Delta time to simulate for a move stamped `client_time_stamp`.
    pub fn get_server_move_delta_time(&self, client_time_stamp: f32, settings: &NetworkSettings) -> f32 {
        if self.resolving_time_discrepancy {
            self.time_discrepancy_resolution_move_delta_override
        } else {
            self.get_base_server_move_delta_time(client_time_stamp, settings)
        }
    }

    /// Client reported delta, capped against lag spikes and speed hacks.
    pub fn get_base_server_move_delta_time(&self, client_time_stamp: f32, settings: &NetworkSettings) -> f32 {
        settings
            .max_move_delta_time
            .min(client_time_stamp - self.current_client_time_stamp)
    }

    /// Record an accepted move at server time `now`.
    pub(crate) fn accept_move(&mut self, timestamp: f32, delta_time: f32, now: f32) {
        self.current_client_time_stamp = timestamp;
        self.server_accumulated_client_time_stamp += f64::from(delta_time);
        self.server_time_stamp = now;
        self.server_time_stamp_last_server_move = Some(now);
    }
}
