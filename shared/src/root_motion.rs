/*!
Root motion sources: scripted velocity contributions (dashes, knockbacks,
move-to targets) that drive a character alongside or instead of input.

Sources live in a [`RootMotionSourceGroup`] owned by the character. Each tick the
group prepares every source for the coming move, then the movement code pulls
the highest-priority override velocity and the sum of the additive velocities.

Server and client assign local ids independently, so replicated sources are
paired with local ones by structural [`RootMotionSource::matches`], never by id.
*/

use log::{trace, warn};
use serde::{Deserialize, Serialize};

use crate::bitmask_flags::BitmaskFlags;
use crate::collision::{Quat, Vec3};
use crate::constants::{KINDA_SMALL, ROOT_MOTION_MAPPING_VALIDITY, SMALL_NUMBER};
use crate::define_bitmask_flags;
use crate::utils::clamp_max_size_2d;

/// Id 0 is never handed out.
pub const INVALID_ROOT_MOTION_ID: u16 = 0;

/// Marker for a source without a scheduled start time.
pub const INVALID_START_TIME: f32 = -1.0e30;

define_bitmask_flags!(RootMotionStatus, u8, {
    Prepared,
    Finished,
    MarkedForRemoval,
});

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccumulateMode {
    /// Replaces velocity. Only the highest-priority override applies.
    #[default]
    Override,
    /// Adds on top of whatever velocity the movement mode computed.
    Additive,
}

/// What happens to character velocity when a source is removed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum FinishVelocity {
    #[default]
    MaintainLastRootMotionVelocity,
    SetVelocity(Vec3),
    /// Clamp horizontal speed, and upward speed, to this value.
    ClampVelocity(f32),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RootMotionKind {
    /// Fixed velocity for the whole duration.
    ConstantForce { force: Vec3 },
    /// Push away from (or pull toward) a point inside `radius`.
    RadialForce {
        location: Vec3,
        radius: f32,
        strength: f32,
        is_push: bool,
        no_vertical_force: bool,
        fixed_world_direction: Option<Vec3>,
    },
    /// Travel from `start_location` to `target_location` over the duration.
    MoveToForce {
        start_location: Vec3,
        target_location: Vec3,
        restrict_speed_to_expected: bool,
    },
}

impl RootMotionKind {
    fn same_kind(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

/// Component-wise closeness, as used for matching replicated sources.
fn points_are_near(a: &Vec3, b: &Vec3, dist: f32) -> bool {
    (a.x - b.x).abs() <= dist && (a.y - b.y).abs() <= dist && (a.z - b.z).abs() <= dist
}

/// Per-tick state the sources read from the character.
#[derive(Clone, Copy, Debug)]
pub struct RootMotionContext {
    pub location: Vec3,
    pub rotation: Quat,
    /// Movement clock at the start of this move, when known.
    pub movement_time: Option<f32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RootMotionSource {
    pub instance_name: String,
    pub kind: RootMotionKind,
    pub accumulate_mode: AccumulateMode,
    pub priority: u16,
    pub local_id: u16,
    pub start_time: f32,
    pub current_time: f32,
    pub previous_time: f32,
    /// Negative disables time-out.
    pub duration: f32,
    pub in_local_space: bool,
    pub needs_simulated_catchup: bool,
    pub disable_partial_end_tick: bool,
    /// Any upward velocity lifts a walking character off the ground.
    pub use_sensitive_liftoff_check: bool,
    pub finish_velocity: FinishVelocity,
    pub status: BitmaskFlags<u8>,
    /// Velocity prepared for the current move.
    pub prepared_velocity: Vec3,
}

impl RootMotionSource {
    fn base(instance_name: &str, kind: RootMotionKind, duration: f32) -> Self {
        Self {
            instance_name: instance_name.to_owned(),
            kind,
            accumulate_mode: AccumulateMode::Override,
            priority: 0,
            local_id: INVALID_ROOT_MOTION_ID,
            start_time: INVALID_START_TIME,
            current_time: 0.0,
            previous_time: 0.0,
            duration,
            in_local_space: false,
            needs_simulated_catchup: false,
            disable_partial_end_tick: false,
            use_sensitive_liftoff_check: false,
            finish_velocity: FinishVelocity::default(),
            status: BitmaskFlags::empty(),
            prepared_velocity: Vec3::zeros(),
        }
    }

    /// Constant velocity. Partial end ticks are disabled so the last frame keeps full speed.
    pub fn constant_force(instance_name: &str, force: Vec3, duration: f32) -> Self {
        let mut source = Self::base(instance_name, RootMotionKind::ConstantForce { force }, duration);
        source.disable_partial_end_tick = true;
        source
    }

    pub fn radial_force(instance_name: &str, location: Vec3, radius: f32, strength: f32, is_push: bool, duration: f32) -> Self {
        Self::base(
            instance_name,
            RootMotionKind::RadialForce {
                location,
                radius,
                strength,
                is_push,
                no_vertical_force: false,
                fixed_world_direction: None,
            },
            duration,
        )
    }

    pub fn move_to_force(instance_name: &str, start_location: Vec3, target_location: Vec3, duration: f32) -> Self {
        Self::base(
            instance_name,
            RootMotionKind::MoveToForce {
                start_location,
                target_location,
                restrict_speed_to_expected: false,
            },
            duration,
        )
    }

    pub fn with_mode(mut self, mode: AccumulateMode) -> Self {
        self.accumulate_mode = mode;
        self
    }

    pub fn with_priority(mut self, priority: u16) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_finish_velocity(mut self, finish: FinishVelocity) -> Self {
        self.finish_velocity = finish;
        self
    }

    #[inline]
    pub fn is_time_out_enabled(&self) -> bool {
        self.duration >= 0.0
    }

    #[inline]
    pub fn is_start_time_valid(&self) -> bool {
        self.start_time != INVALID_START_TIME
    }

    #[inline]
    pub fn has_status(&self, flag: RootMotionStatus) -> bool {
        self.status.has(flag)
    }

    /// Structural identity used to pair replicated sources with local ones.
    pub fn matches(&self, other: &RootMotionSource) -> bool {
        if !self.kind.same_kind(&other.kind)
            || self.priority != other.priority
            || self.in_local_space != other.in_local_space
            || self.instance_name != other.instance_name
            || (self.duration - other.duration).abs() > SMALL_NUMBER
        {
            return false;
        }

        match (&self.kind, &other.kind) {
            (RootMotionKind::ConstantForce { force: a }, RootMotionKind::ConstantForce { force: b }) => {
                points_are_near(a, b, 0.1)
            }
            (
                RootMotionKind::RadialForce {
                    location: la,
                    radius: ra,
                    strength: sa,
                    is_push: pa,
                    no_vertical_force: na,
                    fixed_world_direction: fa,
                },
                RootMotionKind::RadialForce {
                    location: lb,
                    radius: rb,
                    strength: sb,
                    is_push: pb,
                    no_vertical_force: nb,
                    fixed_world_direction: fb,
                },
            ) => {
                let dirs_match = match (fa, fb) {
                    (None, None) => true,
                    (Some(a), Some(b)) => points_are_near(a, b, 1.0e-3),
                    _ => false,
                };
                pa == pb
                    && na == nb
                    && dirs_match
                    && points_are_near(la, lb, 1.0)
                    && (ra - rb).abs() <= SMALL_NUMBER
                    && (sa - sb).abs() <= SMALL_NUMBER
            }
            (
                RootMotionKind::MoveToForce {
                    target_location: ta,
                    restrict_speed_to_expected: ra,
                    ..
                },
                RootMotionKind::MoveToForce {
                    target_location: tb,
                    restrict_speed_to_expected: rb,
                    ..
                },
            ) => ra == rb && points_are_near(ta, tb, 0.1),
            _ => false,
        }
    }

    pub fn matches_and_has_same_state(&self, other: &RootMotionSource) -> bool {
        self.matches(other) && self.status == other.status && self.current_time == other.current_time
    }

    /// Copy status and time from a matched source. A pending removal is never undone.
    pub fn update_state_from(&mut self, other: &RootMotionSource, mark_for_simulated_catchup: bool) -> bool {
        if !self.kind.same_kind(&other.kind) {
            return false;
        }
        self.needs_simulated_catchup = mark_for_simulated_catchup;
        let was_marked = self.has_status(RootMotionStatus::MarkedForRemoval);
        self.status = other.status;
        if was_marked {
            self.status.add(RootMotionStatus::MarkedForRemoval);
        }
        self.set_time(other.current_time);
        true
    }

    pub fn set_time(&mut self, new_time: f32) {
        self.previous_time = self.current_time;
        self.current_time = new_time;
        self.check_time_out();
    }

    fn check_time_out(&mut self) {
        if self.is_time_out_enabled() {
            let timed_out = self.current_time >= self.duration;
            self.status.set(RootMotionStatus::Finished, timed_out);
        }
    }

    /// Compute this source's velocity for the coming move and advance its clock.
    ///
    /// `simulation_time` is how much of the source's timeline this move covers, which
    /// differs from `movement_tick_time` during partial ticks and catch-up.
    pub fn prepare_root_motion(&mut self, simulation_time: f32, movement_tick_time: f32, ctx: &RootMotionContext) {
        self.prepared_velocity = Vec3::zeros();

        match &self.kind {
            RootMotionKind::ConstantForce { force } => {
                let multiplier = if movement_tick_time > SMALL_NUMBER {
                    simulation_time / movement_tick_time
                } else {
                    1.0
                };
                self.prepared_velocity = force * multiplier;
            }
            RootMotionKind::RadialForce {
                location,
                radius,
                strength,
                is_push,
                no_vertical_force,
                fixed_world_direction,
            } => {
                let mut force = Vec3::zeros();
                let offset = location - ctx.location;
                if offset.norm() < *radius {
                    force = match fixed_world_direction {
                        Some(dir) => dir * *strength,
                        None => {
                            let dir = offset.try_normalize(SMALL_NUMBER).unwrap_or_else(Vec3::zeros);
                            if *is_push { -dir * *strength } else { dir * *strength }
                        }
                    };
                }
                if *no_vertical_force {
                    force.y = 0.0;
                }
                if simulation_time != movement_tick_time && movement_tick_time > SMALL_NUMBER {
                    force *= simulation_time / movement_tick_time;
                }
                self.prepared_velocity = force;
            }
            RootMotionKind::MoveToForce {
                start_location,
                target_location,
                restrict_speed_to_expected,
            } => {
                if self.duration > SMALL_NUMBER && movement_tick_time > SMALL_NUMBER {
                    let move_fraction = (self.current_time + simulation_time) / self.duration;
                    let current_target = start_location.lerp(target_location, move_fraction);
                    let mut force = (current_target - ctx.location) / movement_tick_time;

                    if *restrict_speed_to_expected && force.norm_squared() > KINDA_SMALL * KINDA_SMALL {
                        let previous_fraction = self.current_time / self.duration;
                        let expected_location = start_location.lerp(target_location, previous_fraction);
                        let expected_speed = ((current_target - expected_location) / movement_tick_time).norm();
                        // cm/s of slack
                        let error_allowance = 0.5;
                        if force.norm_squared() > (expected_speed + error_allowance).powi(2) {
                            force = force.normalize() * expected_speed;
                        }
                    }
                    self.prepared_velocity = force;
                } else {
                    warn!("root_motion: move-to source '{}' prepared without a duration", self.instance_name);
                }
            }
        }

        self.set_time(self.current_time + simulation_time);
    }

    fn world_velocity(&self, rotation: &Quat) -> Vec3 {
        if self.in_local_space {
            rotation * self.prepared_velocity
        } else {
            self.prepared_velocity
        }
    }
}

/// Opaque per-tick displacement and rotation extracted from animation, in local space.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnimRootMotion {
    pub translation: Vec3,
    pub rotation: Quat,
}

impl AnimRootMotion {
    /// World-space velocity that covers the translation in `dt`.
    pub fn velocity(&self, component_rotation: &Quat, dt: f32) -> Vec3 {
        if dt <= 0.0 {
            return Vec3::zeros();
        }
        component_rotation * self.translation / dt
    }
}

/// All root motion sources acting on one character.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RootMotionSourceGroup {
    pub sources: Vec<RootMotionSource>,
    pub pending: Vec<RootMotionSource>,
    pub has_additive_sources: bool,
    pub has_override_sources: bool,
    pub last_pre_additive_velocity: Vec3,
    pub is_additive_velocity_applied: bool,
    pub last_sensitive_liftoff: bool,
    #[serde(skip)]
    local_id_generator: u16,
}

impl RootMotionSourceGroup {
    pub fn has_active_root_motion_sources(&self) -> bool {
        !self.sources.is_empty() || !self.pending.is_empty()
    }

    pub fn has_override_velocity(&self) -> bool {
        self.has_override_sources
    }

    pub fn has_additive_velocity(&self) -> bool {
        self.has_additive_sources
    }

    pub fn has_velocity(&self) -> bool {
        self.has_override_sources || self.has_additive_sources
    }

    /// Queue a source. It becomes active on the next prepare. Returns its local id.
    pub fn apply_root_motion_source(&mut self, mut source: RootMotionSource) -> u16 {
        self.local_id_generator = self.local_id_generator.wrapping_add(1);
        if self.local_id_generator == INVALID_ROOT_MOTION_ID {
            self.local_id_generator = self.local_id_generator.wrapping_add(1);
        }
        source.local_id = self.local_id_generator;
        trace!("root_motion: pending [{}] {}", source.local_id, source.instance_name);
        self.pending.push(source);
        self.local_id_generator
    }

    pub fn get_root_motion_source(&self, instance_name: &str) -> Option<&RootMotionSource> {
        self.sources
            .iter()
            .chain(self.pending.iter())
            .find(|s| s.instance_name == instance_name)
    }

    pub fn get_root_motion_source_by_id(&self, id: u16) -> Option<&RootMotionSource> {
        self.sources.iter().chain(self.pending.iter()).find(|s| s.local_id == id)
    }

    /// Mark every source with this name for removal. Empty names are ignored.
    pub fn remove_root_motion_source(&mut self, instance_name: &str) {
        if instance_name.is_empty() {
            return;
        }
        for source in self.sources.iter_mut().chain(self.pending.iter_mut()) {
            if source.instance_name == instance_name {
                source.status.add(RootMotionStatus::MarkedForRemoval);
            }
        }
    }

    pub fn remove_root_motion_source_by_id(&mut self, id: u16) {
        if id == INVALID_ROOT_MOTION_ID {
            return;
        }
        for source in self.sources.iter_mut().chain(self.pending.iter_mut()) {
            if source.local_id == id {
                source.status.add(RootMotionStatus::MarkedForRemoval);
            }
        }
    }

    /// Drop finished and removed sources, applying their finish-velocity rules to `velocity`.
    pub fn clean_up_invalid_root_motion(&mut self, dt: f32, rotation: &Quat, velocity: &mut Vec3) {
        let sources = std::mem::take(&mut self.sources);
        let mut kept = Vec::with_capacity(sources.len());
        for source in sources {
            if !source.has_status(RootMotionStatus::MarkedForRemoval) && !source.has_status(RootMotionStatus::Finished) {
                kept.push(source);
                continue;
            }

            // Hand an additive source's momentum back to the character instead of stopping dead.
            if source.accumulate_mode == AccumulateMode::Additive && self.is_additive_velocity_applied && dt > 0.0 {
                self.last_pre_additive_velocity += source.world_velocity(rotation);
            }

            match source.finish_velocity {
                FinishVelocity::ClampVelocity(clamp) => {
                    // Only upward speed is clamped so falls are not slowed.
                    *velocity = clamp_max_size_2d(velocity, clamp);
                    velocity.y = velocity.y.min(clamp);
                    if self.is_additive_velocity_applied {
                        let mut v = clamp_max_size_2d(&self.last_pre_additive_velocity, clamp);
                        v.y = v.y.min(clamp);
                        self.last_pre_additive_velocity = v;
                    }
                }
                FinishVelocity::SetVelocity(set) => {
                    *velocity = set;
                    if self.is_additive_velocity_applied {
                        self.last_pre_additive_velocity = set;
                    }
                }
                FinishVelocity::MaintainLastRootMotionVelocity => {}
            }
            trace!("root_motion: removing [{}] {}", source.local_id, source.instance_name);
        }
        self.sources = kept;

        self.pending.retain(|s| {
            !s.has_status(RootMotionStatus::MarkedForRemoval) && !s.has_status(RootMotionStatus::Finished)
        });
    }

    /// Activate pending sources, sort by priority and prepare each source for a move of `dt`.
    pub fn prepare_root_motion(&mut self, dt: f32, ctx: &RootMotionContext, force_prepare_all: bool) {
        self.sources.append(&mut self.pending);
        // Stable, highest priority first.
        self.sources.sort_by(|a, b| b.priority.cmp(&a.priority));

        self.has_override_sources = false;
        self.has_additive_sources = false;
        self.last_sensitive_liftoff = false;

        for source in &mut self.sources {
            if !source.has_status(RootMotionStatus::Prepared) || force_prepare_all {
                let mut simulation_time = dt;

                if source.needs_simulated_catchup {
                    let correction = source.previous_time - source.current_time;
                    if correction > 0.0 {
                        // Close half the gap per update, never more than half a second.
                        simulation_time += (correction * 0.5).min(0.5);
                    }
                }

                let not_started = source.current_time == 0.0;
                if not_started && source.is_start_time_valid() {
                    if let Some(movement_time) = ctx.movement_time.filter(|t| *t >= 0.0) {
                        if source.start_time > movement_time {
                            let end_time = movement_time + simulation_time;
                            simulation_time = if end_time <= source.start_time {
                                0.0
                            } else {
                                end_time - source.start_time
                            };
                        }
                    }
                }

                if source.is_time_out_enabled() && !source.disable_partial_end_tick {
                    if source.current_time + simulation_time >= source.duration {
                        // Just past the end so the source finishes this tick.
                        simulation_time = source.duration - source.current_time + KINDA_SMALL;
                    }
                }

                source.prepare_root_motion(simulation_time.max(0.0), dt, ctx);
                source.status.add(RootMotionStatus::Prepared);
                source.needs_simulated_catchup = false;
            }

            self.last_sensitive_liftoff |= source.use_sensitive_liftoff_check;
            match source.accumulate_mode {
                AccumulateMode::Additive => self.has_additive_sources = true,
                AccumulateMode::Override => self.has_override_sources = true,
            }
        }
    }

    /// Replace `velocity` with the highest-priority override source.
    pub fn accumulate_override_velocity(&self, rotation: &Quat, velocity: &mut Vec3) {
        if let Some(source) = self
            .sources
            .iter()
            .find(|s| s.accumulate_mode == AccumulateMode::Override)
        {
            *velocity = source.world_velocity(rotation);
        }
    }

    /// Add every additive source to `velocity`.
    pub fn accumulate_additive_velocity(&self, rotation: &Quat, velocity: &mut Vec3) {
        for source in self
            .sources
            .iter()
            .filter(|s| s.accumulate_mode == AccumulateMode::Additive)
        {
            *velocity += source.world_velocity(rotation);
        }
    }

    /// Push scheduled start times later by at least `new_start_time`.
    pub fn set_pending_root_motion_source_min_start_times(&mut self, new_start_time: f32) {
        for source in &mut self.pending {
            source.start_time = source.start_time.max(new_start_time);
        }
    }

    /// Rebase start times after the client timestamp wrapped back by `dt`.
    pub fn apply_time_stamp_reset(&mut self, dt: f32) {
        for source in self.sources.iter_mut().chain(self.pending.iter_mut()) {
            if source.is_start_time_valid() {
                source.start_time -= dt;
            }
        }
    }

    /// Take status and time from `other`, whose ids were already mapped to ours.
    pub fn update_state_from(&mut self, other: &RootMotionSourceGroup, mark_for_simulated_catchup: bool) {
        self.is_additive_velocity_applied = other.is_additive_velocity_applied;
        self.last_pre_additive_velocity = other.last_pre_additive_velocity;

        for theirs in other.sources.iter().filter(|s| s.local_id != INVALID_ROOT_MOTION_ID) {
            for ours in self.sources.iter_mut().filter(|s| s.local_id == theirs.local_id) {
                if !ours.matches(theirs) {
                    warn!(
                        "root_motion: [{}] '{}' shares an id with non-matching '{}'",
                        ours.local_id, ours.instance_name, theirs.instance_name
                    );
                    continue;
                }
                if ours.update_state_from(theirs, mark_for_simulated_catchup) {
                    ours.status.remove(RootMotionStatus::Prepared);
                } else {
                    ours.status.add(RootMotionStatus::MarkedForRemoval);
                }
            }
        }
    }

    /// Drop sources that could not be paired with a local id.
    pub fn cull_invalid_sources(&mut self) {
        self.sources.retain(|s| s.local_id != INVALID_ROOT_MOTION_ID);
    }

    pub fn clear(&mut self) {
        let generator = self.local_id_generator;
        *self = Self::default();
        self.local_id_generator = generator;
    }

    /// Take every source and flag from a recorded copy, keeping this group's id generator.
    pub fn restore_from(&mut self, saved: &RootMotionSourceGroup) {
        let generator = self.local_id_generator;
        *self = saved.clone();
        self.local_id_generator = generator;
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct IdMapping {
    server_id: u16,
    local_id: u16,
    time_stamp: f32,
}

impl IdMapping {
    fn is_still_valid(&self, current_time_stamp: f32) -> bool {
        self.time_stamp >= current_time_stamp - ROOT_MOTION_MAPPING_VALIDITY
    }
}

/// Remembers which server id corresponds to which local id.
#[derive(Clone, Debug, Default)]
pub struct RootMotionIdMappings {
    mappings: Vec<IdMapping>,
}

impl RootMotionIdMappings {
    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Rewrite the ids of replicated `server` sources into ids of `local` sources.
    ///
    /// Unpaired sources end up with [`INVALID_ROOT_MOTION_ID`].
    pub fn convert_server_ids_to_local_ids(
        &mut self,
        local: &RootMotionSourceGroup,
        server: &mut RootMotionSourceGroup,
        time_stamp: f32,
    ) {
        self.mappings.retain(|m| m.is_still_valid(time_stamp));

        for server_source in &mut server.sources {
            let server_id = server_source.local_id;
            server_source.local_id = INVALID_ROOT_MOTION_ID;

            if let Some(mapping) = self.mappings.iter_mut().find(|m| m.server_id == server_id) {
                server_source.local_id = mapping.local_id;
                mapping.time_stamp = time_stamp;
                continue;
            }

            let candidate = local.sources.iter().find(|l| {
                l.matches(server_source) && !self.mappings.iter().any(|m| m.local_id == l.local_id)
            });
            match candidate {
                Some(local_source) => {
                    server_source.local_id = local_source.local_id;
                    self.mappings.push(IdMapping {
                        server_id,
                        local_id: local_source.local_id,
                        time_stamp,
                    });
                }
                None => warn!(
                    "root_motion: no local match for server source [{}] '{}'",
                    server_id, server_source.instance_name
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RootMotionContext {
        RootMotionContext {
            location: Vec3::zeros(),
            rotation: Quat::identity(),
            movement_time: None,
        }
    }

    #[test]
    fn local_ids_skip_zero_and_increase() {
        let mut group = RootMotionSourceGroup::default();
        let a = group.apply_root_motion_source(RootMotionSource::constant_force("dash", Vec3::x(), 1.0));
        let b = group.apply_root_motion_source(RootMotionSource::constant_force("dash", Vec3::x(), 1.0));
        assert_ne!(a, INVALID_ROOT_MOTION_ID);
        assert_eq!(b, a + 1);
        assert!(group.has_active_root_motion_sources());
    }

    #[test]
    fn prepare_sorts_by_priority_and_override_takes_highest() {
        let mut group = RootMotionSourceGroup::default();
        group.apply_root_motion_source(
            RootMotionSource::constant_force("low", Vec3::new(100.0, 0.0, 0.0), 1.0).with_priority(1),
        );
        group.apply_root_motion_source(
            RootMotionSource::constant_force("high", Vec3::new(0.0, 0.0, 300.0), 1.0).with_priority(5),
        );
        group.prepare_root_motion(0.1, &ctx(), false);

        assert!(group.pending.is_empty());
        assert_eq!(group.sources[0].instance_name, "high");
        assert!(group.has_override_velocity());

        let mut v = Vec3::new(1.0, 2.0, 3.0);
        group.accumulate_override_velocity(&Quat::identity(), &mut v);
        assert_eq!(v, Vec3::new(0.0, 0.0, 300.0));
    }

    #[test]
    fn additive_sources_sum_onto_velocity() {
        let mut group = RootMotionSourceGroup::default();
        for _ in 0..2 {
            group.apply_root_motion_source(
                RootMotionSource::constant_force("wind", Vec3::new(10.0, 0.0, 0.0), -1.0)
                    .with_mode(AccumulateMode::Additive),
            );
        }
        group.prepare_root_motion(0.05, &ctx(), false);
        let mut v = Vec3::new(5.0, 0.0, 0.0);
        group.accumulate_additive_velocity(&Quat::identity(), &mut v);
        assert_eq!(v.x, 25.0);
        assert!(!group.has_override_velocity());
    }

    #[test]
    fn finished_source_clamps_velocity_on_removal() {
        let mut group = RootMotionSourceGroup::default();
        group.apply_root_motion_source(
            RootMotionSource::constant_force("burst", Vec3::new(1000.0, 0.0, 0.0), 0.1)
                .with_finish_velocity(FinishVelocity::ClampVelocity(200.0)),
        );
        group.prepare_root_motion(0.2, &ctx(), false);
        assert!(group.sources[0].has_status(RootMotionStatus::Finished));

        let mut v = Vec3::new(1000.0, 500.0, 0.0);
        group.clean_up_invalid_root_motion(0.2, &Quat::identity(), &mut v);
        assert!(group.sources.is_empty());
        assert!((v.x - 200.0).abs() < 1.0e-3);
        assert_eq!(v.y, 200.0);
    }

    #[test]
    fn partial_end_tick_stops_at_duration() {
        let mut group = RootMotionSourceGroup::default();
        let target = Vec3::new(100.0, 0.0, 0.0);
        group.apply_root_motion_source(RootMotionSource::move_to_force("to", Vec3::zeros(), target, 0.1));
        group.prepare_root_motion(0.5, &ctx(), false);
        let source = &group.sources[0];
        assert!(source.current_time <= 0.1 + 2.0 * KINDA_SMALL);
        assert!(source.has_status(RootMotionStatus::Finished));
        // Reach the target over the whole move.
        assert!((source.prepared_velocity.x - 200.0).abs() < 1.0);
    }

    #[test]
    fn update_state_never_undoes_removal() {
        let mut ours = RootMotionSource::constant_force("dash", Vec3::x(), 1.0);
        ours.status.add(RootMotionStatus::MarkedForRemoval);
        let mut theirs = ours.clone();
        theirs.status.clear();
        theirs.current_time = 0.4;

        assert!(ours.update_state_from(&theirs, false));
        assert!(ours.has_status(RootMotionStatus::MarkedForRemoval));
        assert_eq!(ours.current_time, 0.4);
    }

    #[test]
    fn server_ids_map_to_structurally_matching_local_sources() {
        let mut local = RootMotionSourceGroup::default();
        local.apply_root_motion_source(RootMotionSource::constant_force("jumppad", Vec3::y() * 800.0, 0.3));
        local.prepare_root_motion(0.0, &ctx(), false);
        let local_id = local.sources[0].local_id;

        let mut server = local.clone();
        server.sources[0].local_id = 77;
        server.sources[0].prepared_velocity.y = 795.0;

        let mut mappings = RootMotionIdMappings::default();
        mappings.convert_server_ids_to_local_ids(&local, &mut server, 10.0);
        assert_eq!(server.sources[0].local_id, local_id);
        assert_eq!(mappings.len(), 1);

        // The mapping expires after the validity window.
        server.sources[0].local_id = 77;
        let empty = RootMotionSourceGroup::default();
        mappings.convert_server_ids_to_local_ids(&empty, &mut server, 10.0 + ROOT_MOTION_MAPPING_VALIDITY + 1.0);
        assert_eq!(server.sources[0].local_id, INVALID_ROOT_MOTION_ID);
        server.cull_invalid_sources();
        assert!(server.sources.is_empty());
    }

    #[test]
    fn time_stamp_reset_rebases_start_times() {
        let mut group = RootMotionSourceGroup::default();
        let mut source = RootMotionSource::constant_force("late", Vec3::x(), 1.0);
        source.start_time = 239.0;
        group.apply_root_motion_source(source);
        group.apply_time_stamp_reset(240.0);
        assert_eq!(group.pending[0].start_time, -1.0);
    }
}
