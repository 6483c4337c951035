use log::{debug, trace};

use super::{CustomMovement, MovementContext, MovementMode};
use crate::avoidance::{AvoidanceAgent, AvoidanceGroups, AvoidanceManager, AvoidanceUid};
use crate::collision::{CapsuleSpec, FluidVolume, HitResult, Quat, SceneQuery, SurfaceId, Transform, Vec3};
use crate::config::MovementSettings;
use crate::constants::{KINDA_SMALL, MAX_FLOOR_DIST, MIN_TICK_TIME, SMALL_NUMBER};
use crate::floor::{self, FloorProbe, FloorResult};
use crate::network::{MoveFlag, MoveFlags};
use crate::root_motion::{AnimRootMotion, RootMotionContext, RootMotionSource, RootMotionSourceGroup};
use crate::utils::{clamp_max_size, horizontal, is_nearly_zero, quat_from_yaw, step_yaw_toward, yaw_from_xz, yaw_of, to_planar};

/// Floor found while stepping up, so the walking loop can skip its own probe.
#[derive(Clone, Copy, Debug, Default)]
pub struct StepDownResult {
    pub computed_floor: bool,
    pub floor: FloorResult,
}

/// Movement state of one character.
///
/// Location is the capsule center. All mutation goes through the movement
/// functions so that client, server and replay run the same code.
pub struct CharacterMovement {
    pub settings: MovementSettings,

    pub location: Vec3,
    pub rotation: Quat,
    /// Rotation requested by the controller (view rotation on the wire).
    pub control_rotation: Quat,
    pub velocity: Vec3,
    /// Input acceleration for the current move.
    pub acceleration: Vec3,
    pub analog_input_modifier: f32,

    pub(crate) capsule: CapsuleSpec,
    standing_half_height: f32,

    pub movement_mode: MovementMode,
    pub custom_movement_mode: u8,
    /// Mode used when landing: walking or nav walking.
    pub ground_movement_mode: MovementMode,
    pub current_floor: FloorResult,
    pub force_next_floor_check: bool,
    pub just_teleported: bool,

    pub base: Option<SurfaceId>,
    pub(crate) old_base_transform: Option<Transform>,
    /// Velocity of the dynamic base measured over the last update.
    pub base_velocity: Vec3,

    pub is_crouched: bool,
    pub wants_to_crouch: bool,
    pub crouch_maintains_base_location: bool,

    pub pressed_jump: bool,
    pub was_jumping: bool,
    pub jump_key_hold_time: f32,
    pub jump_force_time_remaining: f32,
    pub jump_current_count: u32,

    /// Velocity change queued by `add_impulse`, applied on the next move.
    pub pending_impulse: Vec3,
    /// Acceleration queued by `add_force`, applied over the next move.
    pub pending_force: Vec3,
    /// Velocity set by `launch_character`, applied on the next move.
    pub pending_launch_velocity: Vec3,

    pub current_root_motion: RootMotionSourceGroup,
    /// Animation root motion for the next move; consumed by `perform_movement`.
    pub anim_root_motion: Option<AnimRootMotion>,
    pub anim_root_motion_velocity: Vec3,

    pub avoidance_uid: Option<AvoidanceUid>,
    pub avoidance_groups: AvoidanceGroups,
    pub groups_to_avoid: AvoidanceGroups,
    pub groups_to_ignore: AvoidanceGroups,
    pub avoidance_consideration_radius: f32,
    pub avoidance_lock_velocity: Vec3,
    pub avoidance_lock_timer: f32,
    was_avoidance_updated: bool,

    pub(crate) fluid: Option<FluidVolume>,
    last_update_location: Vec3,
    last_update_velocity: Vec3,
    pub(crate) custom_movement: Option<Box<dyn CustomMovement>>,
}

impl CharacterMovement {
    pub fn new(settings: MovementSettings, capsule: CapsuleSpec) -> Self {
        let ground_movement_mode = if settings.use_nav_walking {
            MovementMode::NavWalking
        } else {
            MovementMode::Walking
        };
        let crouch_maintains_base_location = settings.crouch_maintains_base_location;
        Self {
            settings,
            location: Vec3::zeros(),
            rotation: Quat::identity(),
            control_rotation: Quat::identity(),
            velocity: Vec3::zeros(),
            acceleration: Vec3::zeros(),
            analog_input_modifier: 0.0,
            capsule,
            standing_half_height: capsule.half_height,
            movement_mode: ground_movement_mode,
            custom_movement_mode: 0,
            ground_movement_mode,
            current_floor: FloorResult::default(),
            force_next_floor_check: true,
            just_teleported: false,
            base: None,
            old_base_transform: None,
            base_velocity: Vec3::zeros(),
            is_crouched: false,
            wants_to_crouch: false,
            crouch_maintains_base_location,
            pressed_jump: false,
            was_jumping: false,
            jump_key_hold_time: 0.0,
            jump_force_time_remaining: 0.0,
            jump_current_count: 0,
            pending_impulse: Vec3::zeros(),
            pending_force: Vec3::zeros(),
            pending_launch_velocity: Vec3::zeros(),
            current_root_motion: RootMotionSourceGroup::default(),
            anim_root_motion: None,
            anim_root_motion_velocity: Vec3::zeros(),
            avoidance_uid: None,
            avoidance_groups: AvoidanceGroups::new(1),
            groups_to_avoid: AvoidanceGroups::all(),
            groups_to_ignore: AvoidanceGroups::empty(),
            avoidance_consideration_radius: 500.0,
            avoidance_lock_velocity: Vec3::zeros(),
            avoidance_lock_timer: 0.0,
            was_avoidance_updated: false,
            fluid: None,
            last_update_location: Vec3::zeros(),
            last_update_velocity: Vec3::zeros(),
            custom_movement: None,
        }
    }

    /// Builder-style placement used when spawning.
    pub fn at(mut self, location: Vec3) -> Self {
        self.location = location;
        self.last_update_location = location;
        self
    }

    pub fn set_custom_movement(&mut self, custom: Box<dyn CustomMovement>) {
        self.custom_movement = Some(custom);
    }

    #[inline]
    pub fn capsule(&self) -> &CapsuleSpec {
        &self.capsule
    }

    #[inline]
    pub fn standing_half_height(&self) -> f32 {
        self.standing_half_height
    }

    /// Bottom of the capsule.
    pub fn get_actor_feet_location(&self) -> Vec3 {
        self.location - Vec3::y() * self.capsule.half_height
    }

    #[inline]
    pub fn is_moving_on_ground(&self) -> bool {
        self.movement_mode.is_moving_on_ground()
    }

    #[inline]
    pub fn is_falling(&self) -> bool {
        self.movement_mode == MovementMode::Falling
    }

    #[inline]
    pub fn is_swimming(&self) -> bool {
        self.movement_mode == MovementMode::Swimming
    }

    #[inline]
    pub fn is_flying(&self) -> bool {
        self.movement_mode == MovementMode::Flying
    }

    pub fn is_walkable(&self, hit: &HitResult) -> bool {
        floor::is_walkable(hit, self.settings.walkable_floor_y())
    }

    pub(crate) fn floor_probe<'s>(&self, scene: &'s dyn SceneQuery) -> FloorProbe<'s> {
        FloorProbe::new(scene, self.capsule, &self.settings)
    }

    /// Probe the floor under `location`.
    ///
    /// With `can_use_cached` the current floor is reused unless a floor check was
    /// forced or the character teleported.
    pub fn find_floor(
        &mut self,
        location: Vec3,
        can_use_cached: bool,
        downward_sweep: Option<&HitResult>,
        scene: &dyn SceneQuery,
    ) -> FloorResult {
        if can_use_cached && !self.force_next_floor_check && !self.just_teleported {
            return self.current_floor;
        }
        self.force_next_floor_check = false;
        self.floor_probe(scene)
            .find_floor(location, self.is_moving_on_ground(), downward_sweep)
    }

    /// Re-center the capsule in the hover band over the current floor.
    pub fn adjust_floor_height(&mut self, scene: &dyn SceneQuery) {
        let mut location = self.location;
        let mut floor = self.current_floor;
        if self.floor_probe(scene).adjust_floor_height(&mut location, &mut floor) {
            self.location = location;
            self.current_floor = floor;
            self.just_teleported |= !self.settings.maintain_horizontal_ground_velocity;
        }
    }

    pub fn get_base(&self) -> Option<SurfaceId> {
        self.base
    }

    pub fn set_base(&mut self, base: Option<SurfaceId>, scene: &dyn SceneQuery) {
        if self.base != base {
            trace!("movement: base {:?} -> {:?}", self.base, base);
            self.base = base;
            self.base_velocity = Vec3::zeros();
        }
        self.save_base_location(scene);
    }

    pub fn set_base_from_floor(&mut self, scene: &dyn SceneQuery) {
        let base = if self.current_floor.is_walkable_floor() {
            self.current_floor.hit.map(|h| h.surface)
        } else {
            None
        };
        self.set_base(base, scene);
    }

    /// Remember the base transform so the next update can follow its motion.
    pub fn save_base_location(&mut self, scene: &dyn SceneQuery) {
        self.old_base_transform = self.base.and_then(|b| scene.base_transform(b));
    }

    pub fn set_movement_mode(&mut self, mode: MovementMode, scene: &dyn SceneQuery) {
        self.set_movement_mode_with_custom(mode, 0, scene);
    }

    pub fn set_movement_mode_with_custom(&mut self, mode: MovementMode, custom: u8, scene: &dyn SceneQuery) {
        let custom = if mode == MovementMode::Custom { custom } else { 0 };
        let mode = if mode == MovementMode::NavWalking && !self.settings.use_nav_walking {
            MovementMode::Walking
        } else {
            mode
        };

        if self.movement_mode == mode && (mode != MovementMode::Custom || custom == self.custom_movement_mode) {
            return;
        }

        let previous = self.movement_mode;
        let previous_custom = self.custom_movement_mode;
        self.movement_mode = mode;
        self.custom_movement_mode = custom;
        self.on_movement_mode_changed(previous, previous_custom, scene);
    }

    /// Mode, custom sub-mode and ground mode in their one-byte wire form.
    pub fn pack_network_movement_mode(&self) -> u8 {
        self.movement_mode
            .pack(self.custom_movement_mode, self.ground_movement_mode)
    }

    /// Adopt a mode received from the other side of the connection.
    pub fn apply_network_movement_mode(&mut self, packed: u8, scene: &dyn SceneQuery) {
        let (mode, custom, ground) = MovementMode::unpack(packed);
        self.ground_movement_mode = ground;
        self.set_movement_mode_with_custom(mode, custom, scene);
    }

    fn on_movement_mode_changed(&mut self, previous: MovementMode, previous_custom: u8, scene: &dyn SceneQuery) {
        trace!(
            "movement: mode {:?}({}) -> {:?}({})",
            previous, previous_custom, self.movement_mode, self.custom_movement_mode
        );

        if previous == MovementMode::NavWalking
            && self.movement_mode == MovementMode::Walking
            && scene.overlap_capsule(self.location, &self.capsule)
        {
            // Cannot leave nav walking while inside geometry.
            debug!("movement: staying in nav walking, capsule overlaps at {:?}", self.location);
            self.movement_mode = MovementMode::NavWalking;
            return;
        }

        match self.movement_mode {
            MovementMode::Walking | MovementMode::NavWalking => {
                self.velocity.y = 0.0;
                self.crouch_maintains_base_location = self.settings.crouch_maintains_base_location;
                self.ground_movement_mode = self.movement_mode;
                if self.movement_mode == MovementMode::Walking {
                    self.current_floor = self.find_floor(self.location, false, None, scene);
                    self.adjust_floor_height(scene);
                    self.set_base_from_floor(scene);
                }
            }
            _ => {
                self.current_floor.clear();
                self.crouch_maintains_base_location = false;
                if self.movement_mode == MovementMode::Falling {
                    self.velocity += self.base_velocity;
                }
                self.set_base(None, scene);
                if self.movement_mode == MovementMode::None {
                    self.velocity = Vec3::zeros();
                    self.acceleration = Vec3::zeros();
                    self.reset_jump_state();
                }
            }
        }

        if !self.pressed_jump || !self.is_falling() {
            self.reset_jump_state();
        }
    }

    /// Run the integrator for the current mode over `dt`.
    pub fn start_new_physics(&mut self, dt: f32, iterations: u32, ctx: &mut MovementContext<'_>) {
        if dt < MIN_TICK_TIME || iterations >= self.settings.max_simulation_iterations {
            return;
        }

        match self.movement_mode {
            MovementMode::None => {}
            MovementMode::Walking => self.phys_walking(dt, iterations, ctx),
            MovementMode::NavWalking => self.phys_nav_walking(dt, iterations, ctx),
            MovementMode::Falling => self.phys_falling(dt, iterations, ctx),
            MovementMode::Swimming => self.phys_swimming(dt, iterations, ctx),
            MovementMode::Flying => self.phys_flying(dt, iterations, ctx),
            MovementMode::Custom => self.phys_custom(dt, iterations, ctx),
        }
    }

    /// Apply input flags, jump and acceleration, then move. This is the unit the
    /// client predicts, the server re-simulates and replay re-runs.
    pub fn move_autonomous(&mut self, dt: f32, flags: MoveFlags, new_accel: Vec3, ctx: &mut MovementContext<'_>) {
        self.update_from_compressed_flags(flags);
        self.check_jump_input(dt, ctx.scene);
        self.acceleration = clamp_max_size(&new_accel, self.get_max_acceleration());
        self.analog_input_modifier = self.compute_analog_input_modifier();
        self.perform_movement(dt, ctx);
    }

    /// Advance the character by `dt` seconds.
    pub fn perform_movement(&mut self, dt: f32, ctx: &mut MovementContext<'_>) {
        if self.movement_mode == MovementMode::None {
            self.anim_root_motion = None;
            self.clear_accumulated_forces();
            return;
        }
        let scene = ctx.scene;

        self.force_next_floor_check |= self.is_moving_on_ground() && self.location != self.last_update_location;

        // Fold external velocity changes into the saved pre-additive velocity.
        if self.current_root_motion.has_additive_velocity() {
            let adjustment = self.velocity - self.last_update_velocity;
            self.current_root_motion.last_pre_additive_velocity += adjustment;
        }

        let old_location = self.location;
        self.avoidance_lock_timer -= dt;
        self.was_avoidance_updated = false;
        self.register_for_avoidance(ctx);

        self.maybe_update_based_movement(dt, scene);

        let has_root_motion_sources = self.current_root_motion.has_active_root_motion_sources();
        if has_root_motion_sources && !ctx.replaying {
            let rotation = self.rotation;
            self.current_root_motion
                .clean_up_invalid_root_motion(dt, &rotation, &mut self.velocity);
        }

        // Replayed moves already carry their forces in the corrected state.
        if !ctx.replaying {
            self.apply_accumulated_forces(dt, scene);
        }

        self.update_character_state_before_movement(scene);

        if !ctx.replaying {
            self.handle_pending_launch(scene);
            self.clear_accumulated_forces();
        }

        if has_root_motion_sources && !ctx.replaying {
            let rm_ctx = RootMotionContext {
                location: self.location,
                rotation: self.rotation,
                movement_time: ctx.movement_time,
            };
            self.current_root_motion.prepare_root_motion(dt, &rm_ctx, true);
        }

        if let Some(anim) = self.anim_root_motion {
            self.anim_root_motion_velocity = anim.velocity(&self.rotation, dt);
            let mut result = self.anim_root_motion_velocity;
            if self.is_falling() {
                result.y = self.velocity.y;
            }
            self.velocity = result;
        } else if self.current_root_motion.has_override_velocity() && dt > 0.0 {
            let rotation = self.rotation;
            self.current_root_motion
                .accumulate_override_velocity(&rotation, &mut self.velocity);
        }

        self.clear_jump_input(dt);

        self.start_new_physics(dt, 0, ctx);

        self.update_character_state_after_movement(scene);

        if self.anim_root_motion.is_none() {
            self.physics_rotation(dt);
        }
        if let Some(anim) = self.anim_root_motion.take() {
            self.rotation = anim.rotation * self.rotation;
        }

        if self.settings.use_rvo_avoidance && !self.was_avoidance_updated {
            // Others still need our position even when we did not steer.
            if let Some(manager) = ctx.avoidance.as_deref_mut() {
                manager.update_rvo(&*self);
            }
        }

        self.save_base_location(scene);
        trace!(
            "movement: {:?} moved {:.2} to {:?} v={:?}",
            self.movement_mode,
            (self.location - old_location).norm(),
            self.location,
            self.velocity
        );
        self.last_update_location = self.location;
        self.last_update_velocity = self.velocity;
    }

    /// Queue a root motion source. Returns its local id.
    pub fn apply_root_motion_source(&mut self, source: RootMotionSource) -> u16 {
        self.current_root_motion.apply_root_motion_source(source)
    }

    /// Queue a velocity change for the next move. Without `velocity_change` the
    /// impulse is divided by the character's mass.
    pub fn add_impulse(&mut self, impulse: Vec3, velocity_change: bool) {
        if impulse == Vec3::zeros() || self.movement_mode == MovementMode::None {
            return;
        }
        if velocity_change {
            self.pending_impulse += impulse;
        } else if self.settings.mass > SMALL_NUMBER {
            self.pending_impulse += impulse / self.settings.mass;
        }
    }

    /// Queue a force, applied over the duration of the next move.
    pub fn add_force(&mut self, force: Vec3) {
        if force == Vec3::zeros() || self.movement_mode == MovementMode::None {
            return;
        }
        if self.settings.mass > SMALL_NUMBER {
            self.pending_force += force / self.settings.mass;
        }
    }

    /// Launch into the air on the next move.
    ///
    /// Without an override the matching part of the current velocity is kept and
    /// the launch velocity is added to it.
    pub fn launch_character(&mut self, launch_velocity: Vec3, xz_override: bool, y_override: bool) {
        if self.movement_mode == MovementMode::None {
            return;
        }
        let mut final_velocity = launch_velocity;
        if !xz_override {
            final_velocity.x += self.velocity.x;
            final_velocity.z += self.velocity.z;
        }
        if !y_override {
            final_velocity.y += self.velocity.y;
        }
        self.pending_launch_velocity = final_velocity;
    }

    /// Drop queued impulses, forces and launches.
    pub fn clear_accumulated_forces(&mut self) {
        self.pending_impulse = Vec3::zeros();
        self.pending_force = Vec3::zeros();
        self.pending_launch_velocity = Vec3::zeros();
    }

    /// Fold queued impulses and forces into the velocity. A grounded character
    /// whose upward push beats one tick of gravity starts falling.
    ///
    /// The pending launch velocity is left for `handle_pending_launch`.
    pub fn apply_accumulated_forces(&mut self, dt: f32, scene: &dyn SceneQuery) {
        if self.pending_impulse.y != 0.0 || self.pending_force.y != 0.0 {
            let lift = self.pending_impulse.y + (self.pending_force.y + self.get_gravity_y()) * dt;
            if self.is_moving_on_ground() && lift > SMALL_NUMBER {
                debug!("movement: accumulated forces lift off the ground ({lift:.2})");
                self.set_movement_mode(MovementMode::Falling, scene);
            }
        }
        self.velocity += self.pending_impulse + self.pending_force * dt;
        self.pending_impulse = Vec3::zeros();
        self.pending_force = Vec3::zeros();
    }

    /// Apply a queued launch. Returns true when one was pending.
    pub fn handle_pending_launch(&mut self, scene: &dyn SceneQuery) -> bool {
        if self.pending_launch_velocity == Vec3::zeros() {
            return false;
        }
        self.velocity = self.pending_launch_velocity;
        self.set_movement_mode(MovementMode::Falling, scene);
        self.pending_launch_velocity = Vec3::zeros();
        self.force_next_floor_check = true;
        true
    }

    /// Place the character without sweeping.
    pub fn teleport(&mut self, location: Vec3, scene: &dyn SceneQuery) {
        self.location = location;
        self.just_teleported = true;
        self.force_next_floor_check = true;
        self.update_physics_volume(scene);
    }

    // ---- input flags and jumping ----

    pub fn update_from_compressed_flags(&mut self, flags: MoveFlags) {
        self.pressed_jump = flags.has(MoveFlag::JumpPressed);
        self.wants_to_crouch = flags.has(MoveFlag::WantsToCrouch);
    }

    pub fn get_compressed_flags(&self) -> MoveFlags {
        let mut flags = MoveFlags::empty();
        flags.set(MoveFlag::JumpPressed, self.pressed_jump);
        flags.set(MoveFlag::WantsToCrouch, self.wants_to_crouch);
        flags
    }

    /// Press the jump input.
    pub fn jump(&mut self) {
        self.pressed_jump = true;
        self.jump_key_hold_time = 0.0;
    }

    /// Release the jump input.
    pub fn stop_jumping(&mut self) {
        self.pressed_jump = false;
        self.reset_jump_state();
    }

    pub fn reset_jump_state(&mut self) {
        self.pressed_jump = false;
        self.was_jumping = false;
        self.jump_key_hold_time = 0.0;
        self.jump_force_time_remaining = 0.0;
        if !self.is_falling() {
            self.jump_current_count = 0;
        }
    }

    pub fn can_attempt_jump(&self) -> bool {
        self.settings.can_jump
            && !self.wants_to_crouch
            && (self.is_moving_on_ground() || self.is_falling())
    }

    pub fn can_jump(&self) -> bool {
        if self.is_crouched || !self.can_attempt_jump() {
            return false;
        }
        let max_hold = self.settings.jump_max_hold_time;
        let max_count = self.settings.jump_max_count;
        if !self.was_jumping || max_hold <= 0.0 {
            self.jump_current_count < max_count
        } else {
            let key_held = self.pressed_jump && self.jump_key_hold_time < max_hold;
            key_held
                && (self.jump_current_count < max_count
                    || (self.was_jumping && self.jump_current_count == max_count))
        }
    }

    /// Launch upward. Returns true when the jump happened.
    pub fn do_jump(&mut self, scene: &dyn SceneQuery) -> bool {
        if !self.can_jump() {
            return false;
        }
        self.velocity.y = self.velocity.y.max(self.settings.jump_y_velocity);
        self.set_movement_mode(MovementMode::Falling, scene);
        true
    }

    pub fn check_jump_input(&mut self, _dt: f32, scene: &dyn SceneQuery) {
        if !self.pressed_jump {
            return;
        }
        // A first jump while already airborne spends one count.
        if self.jump_current_count == 0 && self.is_falling() {
            self.jump_current_count += 1;
        }
        let did_jump = self.can_jump() && self.do_jump(scene);
        if did_jump && !self.was_jumping {
            self.jump_current_count += 1;
            self.jump_force_time_remaining = self.settings.jump_max_hold_time;
        }
        self.was_jumping = did_jump;
    }

    pub fn clear_jump_input(&mut self, dt: f32) {
        if self.pressed_jump {
            self.jump_key_hold_time += dt;
            if self.jump_key_hold_time >= self.settings.jump_max_hold_time {
                self.pressed_jump = false;
            }
        } else {
            self.jump_force_time_remaining = 0.0;
            self.was_jumping = false;
        }
    }

    // ---- crouching ----

    pub fn can_crouch_in_current_state(&self) -> bool {
        self.settings.can_crouch && (self.is_falling() || self.is_moving_on_ground())
    }

    fn update_character_state_before_movement(&mut self, scene: &dyn SceneQuery) {
        if self.is_crouched && (!self.wants_to_crouch || !self.can_crouch_in_current_state()) {
            self.uncrouch(scene);
        } else if !self.is_crouched && self.wants_to_crouch && self.can_crouch_in_current_state() {
            self.crouch(scene);
        }
    }

    fn update_character_state_after_movement(&mut self, scene: &dyn SceneQuery) {
        if self.is_crouched && !self.can_crouch_in_current_state() {
            self.uncrouch(scene);
        }
    }

    /// Shrink to the crouched capsule, keeping the feet in place when grounded.
    pub fn crouch(&mut self, scene: &dyn SceneQuery) {
        if !self.can_crouch_in_current_state() {
            return;
        }
        let radius = self.capsule.radius;
        let crouched = self.settings.crouched_half_height.max(radius);
        if self.capsule.half_height == crouched {
            self.is_crouched = true;
            return;
        }

        let adjust = self.capsule.half_height - crouched;
        self.capsule = CapsuleSpec::new(radius, crouched);
        if self.crouch_maintains_base_location {
            let rotation = self.rotation;
            self.move_updated_component(Vec3::new(0.0, -adjust, 0.0), rotation, true, scene);
        }
        self.is_crouched = true;
        self.force_next_floor_check = true;
        trace!("movement: crouched, half height {crouched}");
    }

    /// Grow back to standing height unless the taller capsule would be blocked.
    pub fn uncrouch(&mut self, scene: &dyn SceneQuery) {
        let standing = CapsuleSpec::new(self.capsule.radius, self.standing_half_height);
        let adjust = self.standing_half_height - self.capsule.half_height;
        // Slightly taller to avoid touching.
        let test = CapsuleSpec::new(standing.radius, standing.half_height + KINDA_SMALL * 10.0);

        let mut target = self.location;
        let encroached = if self.crouch_maintains_base_location {
            target.y += adjust;
            let mut blocked = scene.overlap_capsule(target, &test);
            if blocked && self.is_moving_on_ground() {
                // Something barely overhead; try standing closer to the floor.
                let min_floor_dist = KINDA_SMALL * 10.0;
                if self.current_floor.blocking_hit && self.current_floor.floor_dist > min_floor_dist {
                    target.y -= self.current_floor.floor_dist - min_floor_dist;
                    blocked = scene.overlap_capsule(target, &test);
                }
            }
            blocked
        } else {
            scene.overlap_capsule(target, &test)
        };

        if encroached {
            trace!("movement: cannot stand up at {:?}", self.location);
            return;
        }

        self.location = target;
        self.capsule = standing;
        self.is_crouched = false;
        self.force_next_floor_check = true;
        self.update_physics_volume(scene);
    }

    // ---- movement bases ----

    /// Carry the character along with a moving base.
    fn maybe_update_based_movement(&mut self, dt: f32, scene: &dyn SceneQuery) {
        let Some(base) = self.base else {
            return;
        };
        if !scene.is_dynamic_base(base) {
            return;
        }
        let (Some(old), Some(new)) = (self.old_base_transform, scene.base_transform(base)) else {
            return;
        };
        if old == new {
            self.base_velocity = Vec3::zeros();
            return;
        }

        let delta_quat = new.rotation * old.rotation.inverse();
        let rotation_changed = delta_quat.angle() > 1e-6;
        let final_rotation = if rotation_changed {
            quat_from_yaw(yaw_of(&(delta_quat * self.rotation)))
        } else {
            self.rotation
        };
        if rotation_changed {
            self.control_rotation = quat_from_yaw(yaw_of(&(delta_quat * self.control_rotation)));
        }

        // Follow the point under the feet, not the capsule center.
        let base_offset = Vec3::y() * self.capsule.half_height;
        let local = old.inverse_transform_point(&(self.location - base_offset));
        let new_world = new.transform_point(&local) + base_offset;
        let mut delta = new_world - self.location;

        let base_move = new.translation - old.translation;
        if !rotation_changed && base_move.x == 0.0 && base_move.z == 0.0 {
            delta.x = 0.0;
            delta.z = 0.0;
        }
        if dt > 0.0 {
            self.base_velocity = base_move / dt;
        }

        let expected = self.location + delta;
        self.safe_move_updated_component(delta, final_rotation, true, scene);
        if !is_nearly_zero(&(self.location - expected)) {
            debug!(
                "movement: unable to follow base {:?}, off by {:?}",
                base,
                self.location - expected
            );
        }
    }

    // ---- rotation ----

    /// Turn the capsule toward the acceleration or the control yaw.
    pub fn physics_rotation(&mut self, dt: f32) {
        let current = yaw_of(&self.rotation);
        let desired = if self.settings.orient_rotation_to_movement {
            if self.acceleration.norm_squared() < KINDA_SMALL {
                return;
            }
            match yaw_from_xz(to_planar(&self.acceleration)) {
                Some(yaw) => yaw,
                None => return,
            }
        } else {
            yaw_of(&self.control_rotation)
        };

        let tolerance = 1e-3_f32.to_radians();
        let diff = (desired - current).sin().abs();
        if diff <= tolerance && (desired - current).cos() > 0.0 {
            return;
        }

        let new_yaw = if self.settings.orient_rotation_to_movement {
            let max_delta = self.settings.rotation_rate_yaw.to_radians() * dt;
            step_yaw_toward(current, desired, max_delta)
        } else {
            desired
        };
        self.rotation = quat_from_yaw(new_yaw);
    }

    // ---- avoidance ----

    fn register_for_avoidance(&mut self, ctx: &mut MovementContext<'_>) {
        if !self.settings.use_rvo_avoidance {
            return;
        }
        if let Some(manager) = ctx.avoidance.as_deref_mut() {
            let registered = self.avoidance_uid.is_some_and(|uid| manager.is_registered(uid));
            if !registered {
                let weight = self.settings.avoidance_weight;
                manager.register_movement_component(self, weight);
            }
        }
    }

    /// Replace the ground velocity with an avoidance-adjusted one.
    ///
    /// A changed velocity is held for the manager's lock time so the agent commits to it.
    pub fn calc_avoidance_velocity(&mut self, _dt: f32, ctx: &mut MovementContext<'_>) {
        if !self.settings.use_rvo_avoidance || self.settings.avoidance_weight >= 1.0 {
            return;
        }
        let Some(manager) = ctx.avoidance.as_deref_mut() else {
            return;
        };
        if self.velocity == Vec3::zeros() || !self.is_moving_on_ground() {
            return;
        }

        if self.avoidance_lock_timer > 0.0 {
            self.velocity = self.avoidance_lock_velocity;
        } else {
            let new_velocity = manager.get_avoidance_velocity_for_component(&*self);
            let lock_after_avoid = manager.settings().lock_time_after_avoid;
            let lock_after_clean = manager.settings().lock_time_after_clean;
            if (new_velocity - self.velocity).abs().max() > 1e-4 {
                self.velocity = new_velocity;
                self.set_avoidance_velocity_lock(manager, lock_after_avoid);
            } else {
                self.set_avoidance_velocity_lock(manager, lock_after_clean);
            }
        }

        manager.update_rvo(&*self);
        self.was_avoidance_updated = true;
    }

    fn set_avoidance_velocity_lock(&mut self, manager: &mut AvoidanceManager, duration: f32) {
        if let Some(uid) = self.avoidance_uid {
            manager.override_to_max_weight(uid, duration);
        }
        self.avoidance_lock_velocity = self.velocity;
        self.avoidance_lock_timer = duration;
    }

    /// Terminal speed of the volume the character is in.
    pub fn terminal_velocity(&self) -> f32 {
        self.fluid
            .map_or(self.settings.terminal_velocity, |f| f.terminal_velocity)
    }

    /// Probe depth used by the ground movement code.
    pub(crate) fn floor_sweep_distance(&self) -> f32 {
        let height_check_adjust = if self.is_moving_on_ground() {
            MAX_FLOOR_DIST + KINDA_SMALL
        } else {
            -MAX_FLOOR_DIST
        };
        MAX_FLOOR_DIST.max(self.settings.max_step_height + height_check_adjust)
    }
}

impl AvoidanceAgent for CharacterMovement {
    fn rvo_avoidance_uid(&self) -> Option<AvoidanceUid> {
        self.avoidance_uid
    }

    fn set_rvo_avoidance_uid(&mut self, uid: AvoidanceUid) {
        self.avoidance_uid = Some(uid);
    }

    fn rvo_avoidance_origin(&self) -> Vec3 {
        self.get_actor_feet_location()
    }

    fn rvo_avoidance_radius(&self) -> f32 {
        self.capsule.radius
    }

    fn rvo_avoidance_height(&self) -> f32 {
        self.capsule.half_height
    }

    fn rvo_avoidance_consideration_radius(&self) -> f32 {
        self.avoidance_consideration_radius
    }

    fn rvo_avoidance_weight(&self) -> f32 {
        self.settings.avoidance_weight
    }

    fn velocity_for_rvo_consideration(&self) -> Vec3 {
        horizontal(&self.velocity)
    }

    fn avoidance_group_mask(&self) -> AvoidanceGroups {
        self.avoidance_groups
    }

    fn groups_to_avoid_mask(&self) -> AvoidanceGroups {
        self.groups_to_avoid
    }

    fn groups_to_ignore_mask(&self) -> AvoidanceGroups {
        self.groups_to_ignore
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collision::{StaticShape, StaticWorld};

    fn ground() -> StaticWorld {
        let mut world = StaticWorld::new();
        world.add_shape(StaticShape::Plane {
            normal: Vec3::y(),
            dist: 0.0,
        });
        world
    }

    fn standing(world: &StaticWorld) -> CharacterMovement {
        let mut cm = CharacterMovement::new(MovementSettings::default(), CapsuleSpec::new(34.0, 88.0))
            .at(Vec3::new(0.0, 90.0, 0.0));
        cm.movement_mode = MovementMode::None;
        cm.set_movement_mode(MovementMode::Walking, world);
        cm
    }

    #[test]
    fn entering_walking_settles_into_hover_band() {
        let world = ground();
        let cm = standing(&world);
        assert!(cm.current_floor.is_walkable_floor());
        let gap = cm.location.y - 88.0;
        assert!((1.9..=2.4).contains(&gap), "gap {gap}");
    }

    #[test]
    fn jump_switches_to_falling_with_upward_velocity() {
        let world = ground();
        let mut cm = standing(&world);
        let mut ctx = MovementContext::new(&world);
        cm.jump();
        cm.move_autonomous(1.0 / 60.0, cm.get_compressed_flags(), Vec3::zeros(), &mut ctx);
        assert!(cm.is_falling());
        assert!(cm.velocity.y > 0.0);
        assert_eq!(cm.jump_current_count, 1);
        assert!(cm.location.y > 90.0);
    }

    #[test]
    fn single_jump_count_blocks_air_jump() {
        let world = ground();
        let mut cm = standing(&world);
        let mut ctx = MovementContext::new(&world);
        let dt = 1.0 / 60.0;
        cm.jump();
        cm.move_autonomous(dt, cm.get_compressed_flags(), Vec3::zeros(), &mut ctx);
        cm.stop_jumping();
        cm.move_autonomous(dt, MoveFlags::empty(), Vec3::zeros(), &mut ctx);
        let vy = cm.velocity.y;
        cm.jump();
        cm.move_autonomous(dt, cm.get_compressed_flags(), Vec3::zeros(), &mut ctx);
        assert!(cm.velocity.y < vy, "second jump should not relaunch");
    }

    #[test]
    fn crouch_keeps_feet_and_uncrouch_restores_height() {
        let world = ground();
        let mut cm = standing(&world);
        let feet = cm.get_actor_feet_location().y;
        cm.crouch(&world);
        assert!(cm.is_crouched);
        assert_eq!(cm.capsule().half_height, 40.0);
        assert!((cm.get_actor_feet_location().y - feet).abs() < 0.5);

        cm.wants_to_crouch = false;
        cm.uncrouch(&world);
        assert!(!cm.is_crouched);
        assert_eq!(cm.capsule().half_height, 88.0);
        assert!((cm.get_actor_feet_location().y - feet).abs() < 2.5);
    }

    #[test]
    fn uncrouch_is_refused_under_a_low_ceiling() {
        let mut world = ground();
        let mut cm = standing(&world);
        cm.crouch(&world);
        assert!(cm.is_crouched);
        // Ceiling 120 units above the floor.
        world.add_shape(StaticShape::Plane {
            normal: -Vec3::y(),
            dist: -120.0,
        });
        cm.uncrouch(&world);
        assert!(cm.is_crouched);
    }

    #[test]
    fn rotation_turns_toward_acceleration_at_the_yaw_rate() {
        let world = ground();
        let mut cm = standing(&world);
        cm.settings.orient_rotation_to_movement = true;
        cm.settings.rotation_rate_yaw = 90.0;
        // Face +X: yaw of -90 degrees in the -Z forward convention.
        cm.acceleration = Vec3::new(1000.0, 0.0, 0.0);
        cm.physics_rotation(0.5);
        let yaw = yaw_of(&cm.rotation).to_degrees();
        assert!((yaw.abs() - 45.0).abs() < 0.5, "yaw {yaw}");
    }

    #[test]
    fn upward_impulse_lifts_a_walking_character() {
        let world = ground();
        let mut cm = standing(&world);
        let mut ctx = MovementContext::new(&world);
        cm.add_impulse(Vec3::new(0.0, 500.0, 0.0), true);
        cm.move_autonomous(1.0 / 60.0, MoveFlags::empty(), Vec3::zeros(), &mut ctx);
        assert!(cm.is_falling());
        assert!(cm.velocity.y > 400.0, "{:?}", cm.velocity);
        assert!(cm.location.y > 90.0);
        assert_eq!(cm.pending_impulse, Vec3::zeros());
    }

    #[test]
    fn force_weaker_than_gravity_keeps_walking() {
        let world = ground();
        let mut cm = standing(&world);
        let mut ctx = MovementContext::new(&world);
        // Half of gravity, scaled by mass.
        cm.add_force(Vec3::new(0.0, 490.0 * cm.settings.mass, 0.0));
        cm.move_autonomous(1.0 / 60.0, MoveFlags::empty(), Vec3::zeros(), &mut ctx);
        assert!(cm.is_moving_on_ground());
        assert!(cm.velocity.y.abs() < 1e-3, "{:?}", cm.velocity);
        assert_eq!(cm.pending_force, Vec3::zeros());
    }

    #[test]
    fn launch_replaces_or_adds_to_velocity() {
        let world = ground();
        let mut cm = standing(&world);
        let mut ctx = MovementContext::new(&world);
        cm.velocity = Vec3::new(200.0, 0.0, 0.0);
        cm.launch_character(Vec3::new(0.0, 600.0, 0.0), false, true);
        assert_eq!(cm.pending_launch_velocity, Vec3::new(200.0, 600.0, 0.0));
        cm.perform_movement(1.0 / 60.0, &mut ctx);
        assert!(cm.is_falling());
        assert!(cm.velocity.y > 550.0);
        assert!(cm.velocity.x > 150.0);
        assert_eq!(cm.pending_launch_velocity, Vec3::zeros());
    }

    #[test]
    fn replayed_moves_leave_queued_impulses_alone() {
        let world = ground();
        let mut cm = standing(&world);
        let mut ctx = MovementContext::new(&world);
        ctx.replaying = true;
        cm.add_impulse(Vec3::new(0.0, 500.0, 0.0), true);
        cm.perform_movement(1.0 / 60.0, &mut ctx);
        assert!(cm.is_moving_on_ground());
        assert_eq!(cm.pending_impulse, Vec3::new(0.0, 500.0, 0.0));

        // The next live move consumes it.
        ctx.replaying = false;
        cm.perform_movement(1.0 / 60.0, &mut ctx);
        assert!(cm.is_falling());
    }

    #[test]
    fn packed_flags_round_trip_jump_and_crouch() {
        let world = ground();
        let mut cm = standing(&world);
        cm.pressed_jump = true;
        cm.wants_to_crouch = true;
        let flags = cm.get_compressed_flags();
        let mut other = standing(&world);
        other.update_from_compressed_flags(flags);
        assert!(other.pressed_jump && other.wants_to_crouch);
    }
}
