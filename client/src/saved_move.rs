use strider_shared::floor::FloorResult;
use strider_shared::network::pack_view;
use strider_shared::quantize::PackedView;
use strider_shared::utils::safe_normal;
use strider_shared::{
    AnimRootMotion, CharacterMovement, MoveFlags, NetworkSettings, Quat, RootMotionSourceGroup, SceneQuery,
    SurfaceId, Vec3,
};

/// Which part of a saved move [`SavedMove::post_update`] is recording.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PostUpdateMode {
    /// First simulation of the move. Root motion state is captured.
    Record,
    /// Re-simulation after a correction. Only the end state is refreshed.
    Replay,
}

/// One locally simulated move, kept until the server acknowledges it.
#[derive(Clone, Debug)]
pub struct SavedMove {
    pub timestamp: f32,
    pub delta_time: f32,
    pub acceleration: Vec3,
    pub accel_mag: f32,
    pub accel_normal: Vec3,
    pub max_speed: f32,

    pub pressed_jump: bool,
    pub wants_to_crouch: bool,
    pub was_jumping: bool,
    pub jump_key_hold_time: f32,
    pub jump_force_time_remaining: f32,
    pub jump_current_count: u32,
    pub jump_max_count: u32,

    pub start_location: Vec3,
    pub start_relative_location: Option<Vec3>,
    pub start_velocity: Vec3,
    pub start_rotation: Quat,
    pub start_control_rotation: Quat,
    pub start_base: Option<SurfaceId>,
    pub start_floor: FloorResult,
    pub start_packed_movement_mode: u8,
    pub start_capsule_radius: f32,
    pub start_capsule_half_height: f32,
    pub start_has_root_motion_sources: bool,

    pub saved_location: Vec3,
    pub saved_velocity: Vec3,
    pub saved_rotation: Quat,
    pub saved_control_rotation: Quat,
    pub end_base: Option<SurfaceId>,
    pub end_packed_movement_mode: u8,

    pub anim_root_motion: Option<AnimRootMotion>,
    pub saved_root_motion: RootMotionSourceGroup,

    /// Set for moves that must be sent as they are.
    pub force_no_combine: bool,
    /// The move was stamped before the client clock wrapped.
    pub old_time_stamp_before_reset: bool,
}

impl Default for SavedMove {
    fn default() -> Self {
        Self {
            timestamp: 0.0,
            delta_time: 0.0,
            acceleration: Vec3::zeros(),
            accel_mag: 0.0,
            accel_normal: Vec3::zeros(),
            max_speed: 0.0,
            pressed_jump: false,
            wants_to_crouch: false,
            was_jumping: false,
            jump_key_hold_time: 0.0,
            jump_force_time_remaining: 0.0,
            jump_current_count: 0,
            jump_max_count: 1,
            start_location: Vec3::zeros(),
            start_relative_location: None,
            start_velocity: Vec3::zeros(),
            start_rotation: Quat::identity(),
            start_control_rotation: Quat::identity(),
            start_base: None,
            start_floor: FloorResult::default(),
            start_packed_movement_mode: 0,
            start_capsule_radius: 0.0,
            start_capsule_half_height: 0.0,
            start_has_root_motion_sources: false,
            saved_location: Vec3::zeros(),
            saved_velocity: Vec3::zeros(),
            saved_rotation: Quat::identity(),
            saved_control_rotation: Quat::identity(),
            end_base: None,
            end_packed_movement_mode: 0,
            anim_root_motion: None,
            saved_root_motion: RootMotionSourceGroup::default(),
            force_no_combine: false,
            old_time_stamp_before_reset: false,
        }
    }
}

impl SavedMove {
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Capture the input for a move of `dt` ending at `timestamp`, and the state it starts from.
    pub fn set_move_for(
        &mut self,
        character: &CharacterMovement,
        timestamp: f32,
        dt: f32,
        new_accel: Vec3,
    ) {
        self.timestamp = timestamp;
        self.delta_time = dt;
        self.acceleration = new_accel;
        self.accel_mag = new_accel.norm();
        self.accel_normal = safe_normal(&new_accel);
        self.max_speed = character.get_max_speed();
        self.pressed_jump = character.pressed_jump;
        self.wants_to_crouch = character.wants_to_crouch;
        self.anim_root_motion = character.anim_root_motion;
        // Jumps and root motion must reach the server exactly as simulated.
        self.force_no_combine |= self.pressed_jump || self.anim_root_motion.is_some();
        self.set_initial_position(character);
    }

    /// Snapshot the character state this move starts from.
    pub fn set_initial_position(&mut self, character: &CharacterMovement) {
        self.start_location = character.location;
        self.start_velocity = character.velocity;
        self.start_rotation = character.rotation;
        self.start_control_rotation = character.control_rotation;
        self.start_base = character.base;
        self.start_floor = character.current_floor;
        self.start_packed_movement_mode = character.pack_network_movement_mode();
        self.start_capsule_radius = character.capsule().radius;
        self.start_capsule_half_height = character.capsule().half_height;
        self.start_has_root_motion_sources = character.current_root_motion.has_active_root_motion_sources();
        self.start_relative_location = None;

        self.was_jumping = character.was_jumping;
        self.jump_key_hold_time = character.jump_key_hold_time;
        self.jump_force_time_remaining = character.jump_force_time_remaining;
        self.jump_current_count = character.jump_current_count;
        self.jump_max_count = character.settings.jump_max_count;
    }

    /// Remember where a dynamic base had the character, so a revert follows the base.
    pub fn set_initial_relative_location(&mut self, character: &CharacterMovement, scene: &dyn SceneQuery) {
        self.start_relative_location = character
            .base
            .filter(|base| scene.is_dynamic_base(*base))
            .and_then(|base| scene.base_transform(base))
            .map(|transform| transform.inverse_transform_point(&character.location));
    }

    /// Record the state after the move ran.
    pub fn post_update(&mut self, character: &CharacterMovement, mode: PostUpdateMode) {
        self.saved_location = character.location;
        self.saved_velocity = character.velocity;
        self.saved_rotation = character.rotation;
        self.saved_control_rotation = character.control_rotation;
        self.end_base = character.base;
        self.end_packed_movement_mode = character.pack_network_movement_mode();

        if mode == PostUpdateMode::Record && character.current_root_motion.has_active_root_motion_sources() {
            self.saved_root_motion = character.current_root_motion.clone();
        }
    }

    /// Restore per-move state before the move is simulated again.
    pub fn prep_move_for(&self, character: &mut CharacterMovement) {
        character.anim_root_motion = self.anim_root_motion;
        if self.saved_root_motion.has_active_root_motion_sources()
            || character.current_root_motion.has_active_root_motion_sources()
        {
            character.current_root_motion.restore_from(&self.saved_root_motion);
        }
        character.was_jumping = self.was_jumping;
        character.jump_key_hold_time = self.jump_key_hold_time;
        character.jump_force_time_remaining = self.jump_force_time_remaining;
        character.jump_current_count = self.jump_current_count;
    }

    pub fn get_compressed_flags(&self) -> MoveFlags {
        let mut flags = MoveFlags::empty();
        flags.set(strider_shared::MoveFlag::JumpPressed, self.pressed_jump);
        flags.set(strider_shared::MoveFlag::WantsToCrouch, self.wants_to_crouch);
        flags
    }

    pub fn packed_view(&self) -> PackedView {
        pack_view(&self.saved_control_rotation)
    }

    pub fn has_root_motion(&self) -> bool {
        self.anim_root_motion.is_some()
            || self.start_has_root_motion_sources
            || self.saved_root_motion.has_active_root_motion_sources()
    }

    /// Whether losing this move would leave the server with a different picture than
    /// the last acknowledged move gave it.
    pub fn is_important_move(&self, last_acked: Option<&SavedMove>, settings: &NetworkSettings) -> bool {
        let Some(last_acked) = last_acked else {
            return false;
        };
        if self.get_compressed_flags() != last_acked.get_compressed_flags() {
            return true;
        }
        if self.start_packed_movement_mode != last_acked.end_packed_movement_mode
            || self.end_packed_movement_mode != last_acked.end_packed_movement_mode
        {
            return true;
        }
        if self.acceleration != last_acked.acceleration
            && ((self.accel_mag - last_acked.accel_mag).abs() > settings.accel_mag_threshold
                || self.accel_normal.dot(&last_acked.accel_normal) < settings.accel_dot_threshold)
        {
            return true;
        }
        false
    }

    /// Whether `new` can be folded into this still unsent move.
    pub fn can_combine_with(&self, new: &SavedMove, max_delta: f32, settings: &NetworkSettings) -> bool {
        if self.force_no_combine || new.force_no_combine || self.old_time_stamp_before_reset {
            return false;
        }
        if self.has_root_motion() || new.has_root_motion() {
            return false;
        }
        if self.pressed_jump || new.pressed_jump {
            return false;
        }

        let zero_accel = self.acceleration == Vec3::zeros();
        if zero_accel != (new.acceleration == Vec3::zeros()) {
            return false;
        }
        if zero_accel {
            if self.start_velocity != Vec3::zeros() || new.start_velocity != Vec3::zeros() {
                return false;
            }
        } else {
            if self.delta_time + new.delta_time >= max_delta {
                return false;
            }
            if self.accel_normal.dot(&new.accel_normal) < settings.accel_dot_threshold_combine {
                return false;
            }
        }

        if (self.max_speed - new.max_speed).abs() > settings.max_speed_threshold_combine {
            return false;
        }
        if (self.max_speed == 0.0) != (new.max_speed == 0.0) {
            return false;
        }
        if (self.jump_key_hold_time == 0.0) != (new.jump_key_hold_time == 0.0)
            || (self.jump_force_time_remaining == 0.0) != (new.jump_force_time_remaining == 0.0)
            || self.was_jumping != new.was_jumping
            || self.jump_current_count != new.jump_current_count
            || self.jump_max_count != new.jump_max_count
        {
            return false;
        }
        if self.get_compressed_flags() != new.get_compressed_flags() {
            return false;
        }
        if self.start_base != new.start_base {
            return false;
        }
        if self.start_packed_movement_mode != new.start_packed_movement_mode
            || self.end_packed_movement_mode != new.start_packed_movement_mode
        {
            return false;
        }
        self.start_capsule_radius == new.start_capsule_radius
            && self.start_capsule_half_height == new.start_capsule_half_height
    }

    /// Where the character was when `self` started, following a dynamic base.
    pub fn get_reverted_location(&self, scene: &dyn SceneQuery) -> Vec3 {
        match (self.start_base, self.start_relative_location) {
            (Some(base), Some(relative)) => scene
                .base_transform(base)
                .map(|transform| transform.transform_point(&relative))
                .unwrap_or(self.start_location),
            _ => self.start_location,
        }
    }

    /// Put the character back where `old` started and take over its time.
    ///
    /// The control rotation is left alone so the combined move faces where the player looks now.
    pub fn combine_with(
        &mut self,
        old: &SavedMove,
        character: &mut CharacterMovement,
        reverted_location: Vec3,
        scene: &dyn SceneQuery,
    ) {
        character.location = reverted_location;
        character.rotation = old.start_rotation;
        character.velocity = old.start_velocity;
        character.set_base(old.start_base, scene);
        character.current_floor = old.start_floor;

        self.delta_time += old.delta_time;

        character.jump_force_time_remaining = old.jump_force_time_remaining;
        character.jump_key_hold_time = old.jump_key_hold_time;
        character.jump_current_count = old.jump_current_count;
        character.was_jumping = old.was_jumping;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strider_shared::{CapsuleSpec, MovementMode, MovementSettings, StaticShape, StaticWorld};

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

    fn recorded(cm: &CharacterMovement, timestamp: f32, accel: Vec3) -> SavedMove {
        let mut m = SavedMove::default();
        m.set_move_for(cm, timestamp, 1.0 / 60.0, accel);
        m.post_update(cm, PostUpdateMode::Record);
        m
    }

    #[test]
    fn same_direction_moves_combine() {
        let world = world();
        let cm = walker(&world);
        let settings = NetworkSettings::default();
        let a = recorded(&cm, 0.1, Vec3::new(1000.0, 0.0, 0.0));
        let b = recorded(&cm, 0.11, Vec3::new(1000.0, 0.0, 10.0));
        assert!(a.can_combine_with(&b, settings.max_move_delta_time, &settings));
    }

    #[test]
    fn turning_or_jumping_prevents_combining() {
        let world = world();
        let mut cm = walker(&world);
        let settings = NetworkSettings::default();
        let a = recorded(&cm, 0.1, Vec3::new(1000.0, 0.0, 0.0));
        let turned = recorded(&cm, 0.11, Vec3::new(0.0, 0.0, 1000.0));
        assert!(!a.can_combine_with(&turned, settings.max_move_delta_time, &settings));

        cm.pressed_jump = true;
        let jumped = recorded(&cm, 0.12, Vec3::new(1000.0, 0.0, 0.0));
        assert!(jumped.force_no_combine);
        assert!(!a.can_combine_with(&jumped, settings.max_move_delta_time, &settings));
    }

    #[test]
    fn idle_moves_combine_only_at_rest() {
        let world = world();
        let mut cm = walker(&world);
        let settings = NetworkSettings::default();
        let a = recorded(&cm, 0.1, Vec3::zeros());
        let b = recorded(&cm, 0.11, Vec3::zeros());
        assert!(a.can_combine_with(&b, settings.max_move_delta_time, &settings));

        cm.velocity = Vec3::new(100.0, 0.0, 0.0);
        let sliding = recorded(&cm, 0.12, Vec3::zeros());
        assert!(!a.can_combine_with(&sliding, settings.max_move_delta_time, &settings));
    }

    #[test]
    fn combined_time_stays_under_the_cap() {
        let world = world();
        let cm = walker(&world);
        let settings = NetworkSettings::default();
        let mut a = recorded(&cm, 0.1, Vec3::new(1000.0, 0.0, 0.0));
        a.delta_time = 0.1;
        let mut b = recorded(&cm, 0.15, Vec3::new(1000.0, 0.0, 0.0));
        b.delta_time = 0.05;
        assert!(!a.can_combine_with(&b, settings.max_move_delta_time, &settings));
    }

    #[test]
    fn important_when_input_changes_a_lot() {
        let world = world();
        let mut cm = walker(&world);
        let settings = NetworkSettings::default();
        let acked = recorded(&cm, 0.1, Vec3::new(1000.0, 0.0, 0.0));

        let similar = recorded(&cm, 0.2, Vec3::new(1000.0, 0.0, 0.5));
        assert!(!similar.is_important_move(Some(&acked), &settings));

        let reversed = recorded(&cm, 0.3, Vec3::new(-1000.0, 0.0, 0.0));
        assert!(reversed.is_important_move(Some(&acked), &settings));

        cm.wants_to_crouch = true;
        let crouching = recorded(&cm, 0.4, Vec3::new(1000.0, 0.0, 0.0));
        assert!(crouching.is_important_move(Some(&acked), &settings));
        assert!(!crouching.is_important_move(None, &settings));
    }

    #[test]
    fn combine_reverts_to_the_older_start() {
        let world = world();
        let mut cm = walker(&world);
        let old = recorded(&cm, 0.1, Vec3::new(1000.0, 0.0, 0.0));
        cm.location.x += 10.0;
        cm.velocity = Vec3::new(300.0, 0.0, 0.0);
        let mut new = recorded(&cm, 0.12, Vec3::new(1000.0, 0.0, 0.0));

        let reverted = old.get_reverted_location(&world);
        new.combine_with(&old, &mut cm, reverted, &world);
        assert_eq!(cm.location, old.start_location);
        assert_eq!(cm.velocity, Vec3::zeros());
        assert!((new.delta_time - 2.0 / 60.0).abs() < 1e-6);
    }
}
