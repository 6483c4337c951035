pub mod avoidance;
pub mod bitmask_flags;
pub mod collision;
pub mod config;
pub mod constants;
pub mod floor;
pub mod movement;
pub mod network;
pub mod quantize;
pub mod root_motion;
pub mod utils;

pub use avoidance::{AvoidanceAgent, AvoidanceGroups, AvoidanceManager, AvoidanceUid};
pub use collision::{
    CapsuleSpec, FluidVolume, HitResult, Quat, SceneQuery, StaticShape, StaticWorld, SurfaceId,
    Transform, Vec3,
};
pub use config::{
    AvoidanceSettings, ConfigError, MovementSettings, NetworkSettings, SmoothingMode,
    SmoothingSettings, StriderConfig,
};
pub use constants::{
    BRAKE_TO_STOP_VELOCITY, KINDA_SMALL, MAX_FLOOR_DIST, MIN_FLOOR_DIST, MIN_TICK_TIME,
    SWEEP_EDGE_REJECT_DISTANCE,
};
pub use floor::FloorResult;
pub use movement::{CharacterMovement, MovementContext, MovementMode};
pub use network::{ClientAdjustment, ClientMove, MoveFlag, MoveFlags, MoveMessage};
pub use root_motion::{AnimRootMotion, RootMotionSource, RootMotionSourceGroup};
