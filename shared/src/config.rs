//! Tunable movement, networking, avoidance and smoothing settings.
//!
//! Every struct deserializes from TOML with `#[serde(default)]`, so a config
//! file only needs to list the values it overrides.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Per-agent movement tuning. Distances are world units, times are seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MovementSettings {
    /// Signed gravity along Y. Negative pulls down.
    pub gravity_y: f32,
    /// Steepest walkable slope in degrees.
    pub walkable_floor_angle: f32,
    pub max_step_height: f32,
    pub perch_radius_threshold: f32,
    pub perch_additional_height: f32,
    pub ledge_check_threshold: f32,
    pub can_walk_off_ledges: bool,
    pub can_walk_off_ledges_when_crouching: bool,
    pub maintain_horizontal_ground_velocity: bool,

    pub max_walk_speed: f32,
    pub max_walk_speed_crouched: f32,
    pub max_swim_speed: f32,
    pub max_fly_speed: f32,
    pub max_custom_speed: f32,
    pub max_acceleration: f32,
    pub min_analog_walk_speed: f32,

    pub ground_friction: f32,
    pub braking_deceleration_walking: f32,
    pub braking_deceleration_falling: f32,
    pub braking_deceleration_swimming: f32,
    pub braking_deceleration_flying: f32,
    pub braking_friction_factor: f32,
    /// When set, braking uses `braking_friction` instead of the mode's friction.
    pub use_separate_braking_friction: bool,
    pub braking_friction: f32,

    pub air_control: f32,
    pub air_control_boost_multiplier: f32,
    pub air_control_boost_velocity_threshold: f32,
    pub falling_lateral_friction: f32,
    pub terminal_velocity: f32,

    /// Divides impulses and forces that are not velocity changes.
    pub mass: f32,

    pub jump_y_velocity: f32,
    pub jump_max_hold_time: f32,
    pub jump_max_count: u32,

    pub buoyancy: f32,
    pub out_of_water_y: f32,
    pub max_out_of_water_step_height: f32,
    /// Control pitch in degrees at or above which leaving the water becomes a jump.
    pub jump_out_of_water_pitch: f32,

    pub max_simulation_time_step: f32,
    pub max_simulation_iterations: u32,
    pub max_depenetration: f32,

    pub crouched_half_height: f32,
    pub crouch_maintains_base_location: bool,

    pub orient_rotation_to_movement: bool,
    /// Degrees per second.
    pub rotation_rate_yaw: f32,

    pub nav_walking_floor_trace_up: f32,
    pub nav_walking_floor_trace_down: f32,

    pub can_walk: bool,
    pub can_swim: bool,
    pub can_fly: bool,
    pub can_crouch: bool,
    pub can_jump: bool,

    /// Ground mode a landing falls back to ("Walking" or "NavWalking").
    pub use_nav_walking: bool,
    pub use_rvo_avoidance: bool,
    pub avoidance_weight: f32,
}

impl Default for MovementSettings {
    fn default() -> Self {
        Self {
            gravity_y: -980.0,
            walkable_floor_angle: 44.765,
            max_step_height: 45.0,
            perch_radius_threshold: 0.0,
            perch_additional_height: 40.0,
            ledge_check_threshold: 4.0,
            can_walk_off_ledges: true,
            can_walk_off_ledges_when_crouching: false,
            maintain_horizontal_ground_velocity: true,

            max_walk_speed: 600.0,
            max_walk_speed_crouched: 300.0,
            max_swim_speed: 300.0,
            max_fly_speed: 600.0,
            max_custom_speed: 600.0,
            max_acceleration: 2048.0,
            min_analog_walk_speed: 0.0,

            ground_friction: 8.0,
            braking_deceleration_walking: 2048.0,
            braking_deceleration_falling: 0.0,
            braking_deceleration_swimming: 0.0,
            braking_deceleration_flying: 0.0,
            braking_friction_factor: 2.0,
            use_separate_braking_friction: false,
            braking_friction: 0.0,

            air_control: 0.05,
            air_control_boost_multiplier: 2.0,
            air_control_boost_velocity_threshold: 25.0,
            falling_lateral_friction: 0.0,
            terminal_velocity: 4000.0,

            mass: 100.0,

            jump_y_velocity: 420.0,
            jump_max_hold_time: 0.0,
            jump_max_count: 1,

            buoyancy: 1.0,
            out_of_water_y: 420.0,
            max_out_of_water_step_height: 40.0,
            jump_out_of_water_pitch: 11.25,

            max_simulation_time_step: 0.05,
            max_simulation_iterations: 8,
            max_depenetration: 100.0,

            crouched_half_height: 40.0,
            crouch_maintains_base_location: true,

            orient_rotation_to_movement: false,
            rotation_rate_yaw: 360.0,

            nav_walking_floor_trace_up: 50.0,
            nav_walking_floor_trace_down: 50.0,

            can_walk: true,
            can_swim: true,
            can_fly: true,
            can_crouch: true,
            can_jump: true,

            use_nav_walking: false,
            use_rvo_avoidance: false,
            avoidance_weight: 0.5,
        }
    }
}

impl MovementSettings {
    /// Minimum normal Y of a walkable surface, derived from `walkable_floor_angle`.
    pub fn walkable_floor_y(&self) -> f32 {
        self.walkable_floor_angle.to_radians().cos()
    }

    /// Overwrites the walkable angle from a normal-Y threshold.
    pub fn set_walkable_floor_y(&mut self, floor_y: f32) {
        self.walkable_floor_angle = floor_y.clamp(0.0, 1.0).acos().to_degrees();
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=90.0).contains(&self.walkable_floor_angle) {
            return Err(ConfigError::Invalid {
                field: "movement.walkable_floor_angle",
                reason: "must be within [0, 90] degrees",
            });
        }
        if self.max_simulation_time_step <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "movement.max_simulation_time_step",
                reason: "must be positive",
            });
        }
        if self.max_simulation_iterations == 0 {
            return Err(ConfigError::Invalid {
                field: "movement.max_simulation_iterations",
                reason: "must be at least 1",
            });
        }
        if self.max_step_height < 0.0 || self.perch_additional_height < 0.0 {
            return Err(ConfigError::Invalid {
                field: "movement.max_step_height",
                reason: "step and perch heights cannot be negative",
            });
        }
        if self.mass <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "movement.mass",
                reason: "must be positive",
            });
        }
        if self.crouched_half_height <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "movement.crouched_half_height",
                reason: "must be positive",
            });
        }
        if !(0.0..=1.0).contains(&self.avoidance_weight) {
            return Err(ConfigError::Invalid {
                field: "movement.avoidance_weight",
                reason: "must be within [0, 1]",
            });
        }
        Ok(())
    }
}

/// Prediction, reconciliation and anti-cheat tuning shared by client and server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    pub max_move_delta_time: f32,
    pub max_position_error_squared: f32,
    /// Server skips error checks while less than this has passed since the last correction.
    pub client_error_update_rate_limit: f32,

    pub movement_time_discrepancy_detection: bool,
    pub movement_time_discrepancy_resolution: bool,
    pub movement_time_discrepancy_max_time_margin: f32,
    pub movement_time_discrepancy_min_time_margin: f32,
    pub movement_time_discrepancy_resolution_rate: f32,
    pub movement_time_discrepancy_drift_allowance: f32,
    pub movement_time_discrepancy_force_corrections_during_resolution: bool,

    pub min_time_between_time_stamp_resets: f32,

    pub max_saved_move_count: usize,
    pub max_free_move_count: usize,
    pub enable_move_combining: bool,
    pub client_net_send_move_delta_time: f32,
    pub client_net_send_move_delta_time_throttled: f32,
    /// Send interval while standing still with an unchanged view.
    pub client_net_send_move_delta_time_stationary: f32,
    pub client_net_send_move_throttle_at_net_speed: u32,
    pub client_net_send_move_throttle_over_players_count: u32,

    pub min_time_between_client_ack_good_moves: f32,
    pub min_time_between_client_adjustments: f32,
    pub min_time_between_client_adjustments_large_correction: f32,

    pub accel_dot_threshold_combine: f32,
    pub max_speed_threshold_combine: f32,
    pub accel_dot_threshold: f32,
    pub accel_mag_threshold: f32,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            max_move_delta_time: 0.125,
            max_position_error_squared: 3.0,
            client_error_update_rate_limit: 0.0,

            movement_time_discrepancy_detection: true,
            movement_time_discrepancy_resolution: true,
            movement_time_discrepancy_max_time_margin: 0.25,
            movement_time_discrepancy_min_time_margin: -0.25,
            movement_time_discrepancy_resolution_rate: 1.0,
            movement_time_discrepancy_drift_allowance: 0.0,
            movement_time_discrepancy_force_corrections_during_resolution: false,

            min_time_between_time_stamp_resets: 240.0,

            max_saved_move_count: 96,
            max_free_move_count: 96,
            enable_move_combining: true,
            client_net_send_move_delta_time: 0.0166,
            client_net_send_move_delta_time_throttled: 0.0222,
            client_net_send_move_delta_time_stationary: 0.0833,
            client_net_send_move_throttle_at_net_speed: 10_000,
            client_net_send_move_throttle_over_players_count: 10,

            min_time_between_client_ack_good_moves: 0.1,
            min_time_between_client_adjustments: 0.1,
            min_time_between_client_adjustments_large_correction: 0.05,

            accel_dot_threshold_combine: 0.996,
            max_speed_threshold_combine: 10.0,
            accel_dot_threshold: 0.9,
            accel_mag_threshold: 1.0,
        }
    }
}

impl NetworkSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_move_delta_time <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "network.max_move_delta_time",
                reason: "must be positive",
            });
        }
        if !(0.0..=1.0).contains(&self.movement_time_discrepancy_resolution_rate) {
            return Err(ConfigError::Invalid {
                field: "network.movement_time_discrepancy_resolution_rate",
                reason: "must be within [0, 1]",
            });
        }
        if self.movement_time_discrepancy_min_time_margin > 0.0 {
            return Err(ConfigError::Invalid {
                field: "network.movement_time_discrepancy_min_time_margin",
                reason: "must not be positive",
            });
        }
        if self.min_time_between_time_stamp_resets <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "network.min_time_between_time_stamp_resets",
                reason: "must be positive",
            });
        }
        if self.max_saved_move_count == 0 {
            return Err(ConfigError::Invalid {
                field: "network.max_saved_move_count",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }
}

/// Reciprocal velocity obstacle registry tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AvoidanceSettings {
    pub default_time_to_live: f32,
    pub lock_time_after_avoid: f32,
    pub lock_time_after_clean: f32,
    pub delta_time_to_predict: f32,
    pub artificial_radius_expansion: f32,
    pub height_check_margin: f32,
    pub avoidance_consideration_radius: f32,
}

impl Default for AvoidanceSettings {
    fn default() -> Self {
        Self {
            default_time_to_live: 1.5,
            lock_time_after_avoid: 0.2,
            lock_time_after_clean: 0.001,
            delta_time_to_predict: 0.5,
            artificial_radius_expansion: 1.5,
            height_check_margin: 10.0,
            avoidance_consideration_radius: 500.0,
        }
    }
}

impl AvoidanceSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_time_to_live <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "avoidance.default_time_to_live",
                reason: "must be positive",
            });
        }
        if self.delta_time_to_predict <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "avoidance.delta_time_to_predict",
                reason: "must be positive",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SmoothingMode {
    Disabled,
    Linear,
    #[default]
    Exponential,
    Replay,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmoothingSettings {
    pub mode: SmoothingMode,
    pub smooth_net_update_time: f32,
    pub smooth_net_update_rotation_time: f32,
    pub listen_server_smooth_net_update_time: f32,
    pub listen_server_smooth_net_update_rotation_time: f32,
    pub max_smooth_net_update_dist: f32,
    pub no_smooth_net_update_dist: f32,
    pub max_client_smoothing_delta_time: f32,
}

impl Default for SmoothingSettings {
    fn default() -> Self {
        Self {
            mode: SmoothingMode::Exponential,
            smooth_net_update_time: 0.1,
            smooth_net_update_rotation_time: 0.05,
            listen_server_smooth_net_update_time: 0.04,
            listen_server_smooth_net_update_rotation_time: 0.04,
            max_smooth_net_update_dist: 256.0,
            no_smooth_net_update_dist: 384.0,
            max_client_smoothing_delta_time: 0.5,
        }
    }
}

impl SmoothingSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.smooth_net_update_time <= 0.0 || self.smooth_net_update_rotation_time <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "smoothing.smooth_net_update_time",
                reason: "smoothing times must be positive",
            });
        }
        if self.no_smooth_net_update_dist < self.max_smooth_net_update_dist {
            return Err(ConfigError::Invalid {
                field: "smoothing.no_smooth_net_update_dist",
                reason: "must not be smaller than max_smooth_net_update_dist",
            });
        }
        Ok(())
    }
}

/// Everything a world needs to run the movement core.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StriderConfig {
    pub movement: MovementSettings,
    pub network: NetworkSettings,
    pub avoidance: AvoidanceSettings,
    pub smoothing: SmoothingSettings,
}

impl StriderConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.movement.validate()?;
        self.network.validate()?;
        self.avoidance.validate()?;
        self.smoothing.validate()
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config = StriderConfig::from_toml_str("").unwrap();
        assert_eq!(config, StriderConfig::default());
    }

    #[test]
    fn partial_sections_override_only_listed_values() {
        let config = StriderConfig::from_toml_str(
            r#"
            [movement]
            max_walk_speed = 450.0

            [network]
            max_position_error_squared = 0.25
            "#,
        )
        .unwrap();

        assert_eq!(config.movement.max_walk_speed, 450.0);
        assert_eq!(config.movement.max_step_height, 45.0);
        assert_eq!(config.network.max_position_error_squared, 0.25);
        assert_eq!(config.smoothing.mode, SmoothingMode::Exponential);
    }

    #[test]
    fn default_walkable_angle_matches_point_seventy_one() {
        let floor_y = MovementSettings::default().walkable_floor_y();
        assert!((floor_y - 0.71).abs() < 1.0e-3, "floor_y = {floor_y}");
    }

    #[test]
    fn out_of_range_resolution_rate_is_rejected() {
        let err = StriderConfig::from_toml_str(
            r#"
            [network]
            movement_time_discrepancy_resolution_rate = 2.0
            "#,
        )
        .unwrap_err();

        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = StriderConfig::from_toml_str("movement = [").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
