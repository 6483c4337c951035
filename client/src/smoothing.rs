//! Presentation-only smoothing of corrected characters.
//!
//! Corrections move the capsule immediately. The rendered mesh keeps an offset
//! from the capsule that decays to zero, so the player never sees the pop.

use log::trace;
use strider_shared::constants::{KINDA_SMALL, SMALL_NUMBER};
use strider_shared::{CharacterMovement, Quat, SmoothingMode, SmoothingSettings, Vec3};

/// How far past the target the linear mode may extrapolate while still moving.
const LINEAR_LERP_LIMIT: f32 = 1.15;
/// Share of the correction interval the client clock may run ahead of the server.
const MAX_CLIENT_TIME_AHEAD_PERCENT: f32 = 0.15;
/// Replay samples older than this behind the playback clock are dropped.
const REPLAY_SAMPLE_WINDOW: f32 = 1.0;

/// One recorded state of a character, for playback.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReplaySample {
    pub time: f32,
    pub location: Vec3,
    pub rotation: Quat,
    pub velocity: Vec3,
}

/// Render offset state for one character.
#[derive(Clone, Debug)]
pub struct NetworkSmoothing {
    pub settings: SmoothingSettings,
    /// Correction on a listen server host, which uses the shorter smoothing times.
    pub is_listen_server: bool,
    /// World-space offset from the capsule to the rendered mesh.
    pub mesh_translation_offset: Vec3,
    pub original_mesh_translation_offset: Vec3,
    pub mesh_rotation_offset: Quat,
    pub original_mesh_rotation_offset: Quat,
    pub mesh_rotation_target: Quat,
    pub smoothing_server_time_stamp: f32,
    pub smoothing_client_time_stamp: f32,
    pub last_correction_delta: f32,
    pub last_correction_time: Option<f32>,
    pub smoothing_complete: bool,
    replay_samples: Vec<ReplaySample>,
    pub replay_time: f32,
}

impl NetworkSmoothing {
    pub fn new(settings: SmoothingSettings) -> Self {
        Self {
            settings,
            is_listen_server: false,
            mesh_translation_offset: Vec3::zeros(),
            original_mesh_translation_offset: Vec3::zeros(),
            mesh_rotation_offset: Quat::identity(),
            original_mesh_rotation_offset: Quat::identity(),
            mesh_rotation_target: Quat::identity(),
            smoothing_server_time_stamp: 0.0,
            smoothing_client_time_stamp: 0.0,
            last_correction_delta: 0.0,
            last_correction_time: None,
            smoothing_complete: true,
            replay_samples: Vec::new(),
            replay_time: 0.0,
        }
    }

    pub fn mode(&self) -> SmoothingMode {
        self.settings.mode
    }

    fn smooth_net_update_time(&self) -> f32 {
        if self.is_listen_server {
            self.settings.listen_server_smooth_net_update_time
        } else {
            self.settings.smooth_net_update_time
        }
    }

    fn smooth_net_update_rotation_time(&self) -> f32 {
        if self.is_listen_server {
            self.settings.listen_server_smooth_net_update_rotation_time
        } else {
            self.settings.smooth_net_update_rotation_time
        }
    }

    /// Move the capsule from its old pose to a corrected one while the mesh stays put.
    ///
    /// `server_time_stamp` is the server time of the update and `now` the local clock.
    #[allow(clippy::too_many_arguments)]
    pub fn smooth_correction(
        &mut self,
        character: &mut CharacterMovement,
        old_location: Vec3,
        old_rotation: Quat,
        new_location: Vec3,
        new_rotation: Quat,
        server_time_stamp: f32,
        now: f32,
    ) {
        match self.mode() {
            SmoothingMode::Disabled => {
                character.location = new_location;
                character.rotation = new_rotation;
                self.mesh_translation_offset = Vec3::zeros();
                self.mesh_rotation_offset = Quat::identity();
                self.smoothing_complete = true;
                return;
            }
            SmoothingMode::Replay => {
                // Playback drives the capsule from samples instead.
                return;
            }
            SmoothingMode::Linear | SmoothingMode::Exponential => {}
        }

        let new_to_old = old_location - new_location;
        let dist_sq = new_to_old.norm_squared();
        let max_dist = self.settings.max_smooth_net_update_dist;
        let no_smooth_dist = self.settings.no_smooth_net_update_dist;
        self.mesh_translation_offset = if dist_sq > max_dist * max_dist {
            if dist_sq > no_smooth_dist * no_smooth_dist {
                Vec3::zeros()
            } else {
                self.mesh_translation_offset + new_to_old.normalize() * max_dist
            }
        } else {
            self.mesh_translation_offset + new_to_old
        };

        if self.mode() == SmoothingMode::Linear {
            self.original_mesh_translation_offset = self.mesh_translation_offset;
            // Rotation is interpolated on the capsule itself.
            self.original_mesh_rotation_offset = old_rotation;
            self.mesh_rotation_offset = old_rotation;
            self.mesh_rotation_target = new_rotation;
            character.location = new_location;
        } else {
            // Keep the mesh's world rotation across the capsule's change.
            self.mesh_rotation_offset = (new_rotation.inverse() * old_rotation) * self.mesh_rotation_offset;
            self.mesh_rotation_target = Quat::identity();
            character.location = new_location;
            character.rotation = new_rotation;
        }

        // A client running ahead is pulled halfway back so the next interval reads a little longer.
        if self.smoothing_client_time_stamp > self.smoothing_server_time_stamp {
            self.smoothing_client_time_stamp =
                0.5 * (self.smoothing_server_time_stamp + self.smoothing_client_time_stamp);
        }

        let mut old_server_time_stamp = self.smoothing_server_time_stamp;
        self.smoothing_server_time_stamp = server_time_stamp;
        if self.last_correction_time.is_none() {
            self.smoothing_client_time_stamp = server_time_stamp;
            old_server_time_stamp = server_time_stamp;
        }

        // Never fall too far behind or run ahead of the newest server time.
        let server_delta_time = self.smoothing_server_time_stamp - old_server_time_stamp;
        let max_offset = self.settings.max_client_smoothing_delta_time;
        let min_offset = self.smooth_net_update_time().min(max_offset);
        let max_delta = (server_delta_time * 1.25).clamp(min_offset, max_offset);
        self.smoothing_client_time_stamp = self.smoothing_client_time_stamp.clamp(
            self.smoothing_server_time_stamp - max_delta,
            self.smoothing_server_time_stamp,
        );

        self.last_correction_delta = self.smoothing_server_time_stamp - self.smoothing_client_time_stamp;
        self.last_correction_time = Some(now);
        self.smoothing_complete = false;
        trace!(
            "smoothing: correction by {:.2}, offset {:?}, delta {:.3}",
            dist_sq.sqrt(),
            self.mesh_translation_offset,
            self.last_correction_delta
        );
    }

    /// Advance the offsets by `dt`.
    pub fn smooth_client_position_interpolate(&mut self, dt: f32, character: &mut CharacterMovement) {
        match self.mode() {
            SmoothingMode::Disabled => {
                self.smoothing_complete = true;
            }
            SmoothingMode::Linear => self.interpolate_linear(dt, character),
            SmoothingMode::Exponential => self.interpolate_exponential(dt, character),
            SmoothingMode::Replay => self.interpolate_replay(dt, character),
        }
    }

    fn interpolate_linear(&mut self, dt: f32, character: &mut CharacterMovement) {
        self.smoothing_client_time_stamp += dt;

        let target_delta = self.last_correction_delta;
        let lerp_percent = if target_delta > SMALL_NUMBER {
            let max_time_ahead = target_delta * MAX_CLIENT_TIME_AHEAD_PERCENT;
            self.smoothing_client_time_stamp = self
                .smoothing_client_time_stamp
                .min(self.smoothing_server_time_stamp + max_time_ahead);
            let remaining = self.smoothing_server_time_stamp - self.smoothing_client_time_stamp;
            ((target_delta - remaining) / target_delta).clamp(0.0, LINEAR_LERP_LIMIT)
        } else {
            1.0
        };

        if lerp_percent >= 1.0 - KINDA_SMALL {
            if character.velocity.norm_squared() < KINDA_SMALL * KINDA_SMALL {
                self.mesh_translation_offset = Vec3::zeros();
                self.smoothing_client_time_stamp = self.smoothing_server_time_stamp;
                self.smoothing_complete = true;
            } else {
                // Moving characters may overshoot slightly.
                self.mesh_translation_offset = self.original_mesh_translation_offset * (1.0 - lerp_percent);
                self.smoothing_complete = lerp_percent >= LINEAR_LERP_LIMIT;
            }
            self.mesh_rotation_offset = self.mesh_rotation_target;
        } else {
            self.mesh_translation_offset = self.original_mesh_translation_offset * (1.0 - lerp_percent);
            self.mesh_rotation_offset = fast_lerp(
                &self.original_mesh_rotation_offset,
                &self.mesh_rotation_target,
                lerp_percent,
            );
        }
        character.rotation = self.mesh_rotation_offset;
    }

    fn interpolate_exponential(&mut self, dt: f32, character: &CharacterMovement) {
        // Stopped characters settle twice as fast.
        let smooth_location_time = if character.velocity == Vec3::zeros() {
            0.5 * self.smooth_net_update_time()
        } else {
            self.smooth_net_update_time()
        };
        if dt < smooth_location_time {
            self.mesh_translation_offset *= 1.0 - dt / smooth_location_time;
        } else {
            self.mesh_translation_offset = Vec3::zeros();
        }

        let rotation_time = self.smooth_net_update_rotation_time();
        if dt < rotation_time {
            self.mesh_rotation_offset = fast_lerp(&self.mesh_rotation_offset, &self.mesh_rotation_target, dt / rotation_time);
        } else {
            self.mesh_rotation_offset = self.mesh_rotation_target;
        }

        if self.mesh_translation_offset.norm() < 1e-2 && self.mesh_rotation_offset.angle_to(&self.mesh_rotation_target) < 1e-4 {
            self.smoothing_complete = true;
            self.mesh_translation_offset = Vec3::zeros();
            self.mesh_rotation_offset = self.mesh_rotation_target;
        }
    }

    /// Playback is driven by recorded samples and never completes.
    fn interpolate_replay(&mut self, dt: f32, character: &mut CharacterMovement) {
        self.replay_time += dt;
        let now = self.replay_time;
        let stale = self
            .replay_samples
            .iter()
            .take_while(|s| s.time <= now - REPLAY_SAMPLE_WINDOW)
            .count();
        self.replay_samples.drain(..stale);

        let bracket = self
            .replay_samples
            .windows(2)
            .find(|pair| now >= pair[0].time && now <= pair[1].time);
        if let Some([a, b]) = bracket.map(|pair| [pair[0], pair[1]]) {
            let span = b.time - a.time;
            let alpha = if span > SMALL_NUMBER {
                ((now - a.time) / span).clamp(0.0, 1.0)
            } else {
                1.0
            };
            character.location = a.location.lerp(&b.location, alpha);
            character.rotation = fast_lerp(&a.rotation, &b.rotation, alpha);
            character.velocity = a.velocity.lerp(&b.velocity, alpha);
        }

        self.mesh_translation_offset = Vec3::zeros();
        self.mesh_rotation_offset = Quat::identity();
        self.smoothing_complete = false;
    }

    /// Record a sample for playback. Samples must arrive in time order.
    pub fn add_replay_sample(&mut self, sample: ReplaySample) {
        if self.replay_samples.last().is_some_and(|last| last.time > sample.time) {
            trace!("smoothing: dropping out of order replay sample at {}", sample.time);
            return;
        }
        self.replay_samples.push(sample);
    }

    pub fn replay_samples(&self) -> &[ReplaySample] {
        &self.replay_samples
    }

    /// World pose the mesh should be drawn at for `character`.
    pub fn visual_pose(&self, character: &CharacterMovement) -> (Vec3, Quat) {
        let location = character.location + self.mesh_translation_offset;
        let rotation = match self.mode() {
            // Linear rotates the capsule itself.
            SmoothingMode::Linear | SmoothingMode::Replay | SmoothingMode::Disabled => character.rotation,
            SmoothingMode::Exponential => character.rotation * self.mesh_rotation_offset,
        };
        (location, rotation)
    }
}

/// Normalized lerp along the shorter arc.
fn fast_lerp(a: &Quat, b: &Quat, t: f32) -> Quat {
    let a = a.into_inner();
    let mut b = b.into_inner();
    if a.coords.dot(&b.coords) < 0.0 {
        b = -b;
    }
    Quat::new_normalize(a * (1.0 - t) + b * t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strider_shared::utils::quat_from_yaw;
    use strider_shared::{CapsuleSpec, MovementSettings};

    fn character() -> CharacterMovement {
        CharacterMovement::new(MovementSettings::default(), CapsuleSpec::new(34.0, 88.0))
    }

    fn smoothing(mode: SmoothingMode) -> NetworkSmoothing {
        NetworkSmoothing::new(SmoothingSettings {
            mode,
            ..SmoothingSettings::default()
        })
    }

    #[test]
    fn exponential_offset_decays_to_nothing() {
        let mut cm = character();
        let mut s = smoothing(SmoothingMode::Exponential);
        let old = Vec3::new(0.0, 0.0, 0.0);
        let new = Vec3::new(40.0, 0.0, 0.0);
        s.smooth_correction(&mut cm, old, Quat::identity(), new, Quat::identity(), 1.0, 1.0);

        assert_eq!(cm.location, new);
        // The mesh has not moved yet.
        assert_eq!(s.visual_pose(&cm).0, old);
        assert!(!s.smoothing_complete);

        for _ in 0..60 {
            s.smooth_client_position_interpolate(1.0 / 60.0, &mut cm);
        }
        assert!(s.smoothing_complete);
        assert_eq!(s.visual_pose(&cm).0, new);
    }

    #[test]
    fn exponential_rotation_offset_keeps_the_mesh_facing() {
        let mut cm = character();
        let mut s = smoothing(SmoothingMode::Exponential);
        let turned = quat_from_yaw(0.8);
        s.smooth_correction(&mut cm, Vec3::zeros(), Quat::identity(), Vec3::zeros(), turned, 1.0, 1.0);
        assert!(s.visual_pose(&cm).1.angle_to(&Quat::identity()) < 1e-4);
    }

    #[test]
    fn far_corrections_snap() {
        let mut cm = character();
        let mut s = smoothing(SmoothingMode::Exponential);
        let new = Vec3::new(1000.0, 0.0, 0.0);
        s.smooth_correction(&mut cm, Vec3::zeros(), Quat::identity(), new, Quat::identity(), 1.0, 1.0);
        assert_eq!(s.mesh_translation_offset, Vec3::zeros());

        let mid = Vec3::new(300.0, 0.0, 0.0);
        let mut s = smoothing(SmoothingMode::Exponential);
        s.smooth_correction(&mut cm, Vec3::zeros(), Quat::identity(), mid, Quat::identity(), 1.0, 1.0);
        assert!((s.mesh_translation_offset.norm() - 256.0).abs() < 1e-3);
    }

    #[test]
    fn linear_offset_reaches_zero_over_the_update_interval() {
        let mut cm = character();
        let mut s = smoothing(SmoothingMode::Linear);
        s.smooth_correction(&mut cm, Vec3::zeros(), Quat::identity(), Vec3::new(10.0, 0.0, 0.0), Quat::identity(), 1.0, 1.0);
        // Second update 0.1s later sets the interval.
        s.smooth_correction(&mut cm, Vec3::new(10.0, 0.0, 0.0), Quat::identity(), Vec3::new(20.0, 0.0, 0.0), Quat::identity(), 1.1, 1.1);
        assert!(s.last_correction_delta > 0.0);

        let start = s.mesh_translation_offset.norm();
        s.smooth_client_position_interpolate(s.last_correction_delta * 0.5, &mut cm);
        let halfway = s.mesh_translation_offset.norm();
        assert!(halfway < start && halfway > 0.0);

        for _ in 0..30 {
            s.smooth_client_position_interpolate(1.0 / 60.0, &mut cm);
        }
        assert!(s.smoothing_complete);
        assert_eq!(s.mesh_translation_offset, Vec3::zeros());
    }

    #[test]
    fn disabled_snaps_immediately() {
        let mut cm = character();
        let mut s = smoothing(SmoothingMode::Disabled);
        let new = Vec3::new(5.0, 0.0, 0.0);
        s.smooth_correction(&mut cm, Vec3::zeros(), Quat::identity(), new, Quat::identity(), 1.0, 1.0);
        assert!(s.smoothing_complete);
        assert_eq!(s.visual_pose(&cm).0, new);
    }

    #[test]
    fn replay_interpolates_between_samples() {
        let mut cm = character();
        let mut s = smoothing(SmoothingMode::Replay);
        for (time, x) in [(0.0, 0.0), (0.5, 50.0), (1.0, 100.0)] {
            s.add_replay_sample(ReplaySample {
                time,
                location: Vec3::new(x, 0.0, 0.0),
                rotation: Quat::identity(),
                velocity: Vec3::new(100.0, 0.0, 0.0),
            });
        }
        s.smooth_client_position_interpolate(0.75, &mut cm);
        assert!((cm.location.x - 75.0).abs() < 1e-3);
        assert!(!s.smoothing_complete);

        // Out of order samples are ignored.
        s.add_replay_sample(ReplaySample {
            time: 0.2,
            location: Vec3::zeros(),
            rotation: Quat::identity(),
            velocity: Vec3::zeros(),
        });
        assert_eq!(s.replay_samples().len(), 3);
    }
}
