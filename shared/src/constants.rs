/// Smallest simulation slice (seconds). Sub-steps never go below this.
pub const MIN_TICK_TIME: f32 = 1.0e-6;

/// Lower bound of the "hover" band kept between the capsule bottom and a walkable floor.
pub const MIN_FLOOR_DIST: f32 = 1.9;

/// Upper bound of the hover band. Floors further than this trigger a height adjustment.
pub const MAX_FLOOR_DIST: f32 = 2.4;

/// Hits this close to the capsule rim are treated as edge grazes during floor sweeps.
pub const SWEEP_EDGE_REJECT_DISTANCE: f32 = 0.15;

/// Speed below which active braking snaps velocity to zero.
pub const BRAKE_TO_STOP_VELOCITY: f32 = 10.0;

/// Generic "close enough to zero" tolerance used for normals and comparisons.
pub const KINDA_SMALL: f32 = 1.0e-4;

/// Tighter epsilon for squared lengths.
pub const SMALL_NUMBER: f32 = 1.0e-8;

/// Maximum vertical component of a hit normal that is still considered a "side" hit
/// when deciding whether a step-up can start.
pub const MAX_STEP_SIDE_Y: f32 = 0.08;

/// Normals with |y| below this are vertical walls.
pub const VERTICAL_SLOPE_NORMAL_Y: f32 = 0.001;

/// Braking is integrated in slices no longer than this (seconds).
pub const MAX_BRAKING_SUBSTEP: f32 = 1.0 / 33.0;

/// Distance movement is pulled back from a blocking surface after a sweep.
pub const SWEEP_SKIN: f32 = 0.1;

/// Contacts shallower than this are touching, not penetrating.
pub const PENETRATION_TOLERANCE: f32 = 0.01;

/// Extra distance added to the penetration push-out.
pub const PENETRATION_PULLBACK: f32 = 0.125;

/// Size of the capsule shrink used by the floor sweep (fraction of radius).
pub const FLOOR_SWEEP_SHRINK_SCALE: f32 = 0.9;

/// Shrink fraction used for the retry after an edge graze.
pub const FLOOR_SWEEP_SHRINK_SCALE_OVERLAP: f32 = 0.1;

/// Seconds a root-motion server->local ID mapping stays valid after it was last refreshed.
pub const ROOT_MOTION_MAPPING_VALIDITY: f32 = 3.0;
