/*!
Kinematic state machine for an upright capsule character.

[`CharacterMovement`] owns the agent state and integrates it one move at a time.
Each movement mode has its own integrator (`phys_walking`, `phys_falling`, ...)
selected through [`MovementMode`]; the integrators split the move into bounded
sub-steps and hand off to each other when the mode changes mid-move.

Submodules:
- character: the agent state, `perform_movement`, jump, crouch, bases, rotation
- velocity:  acceleration, friction and braking
- sweep:     collision-aware moves, sliding and depenetration
- walking:   ground movement, step-up, ledges, nav walking
- falling:   air control and landing
- swimming:  buoyancy, water line and jumping out of water
- flying
- custom:    game-defined modes
*/

mod character;
mod custom;
mod falling;
mod flying;
mod sweep;
mod swimming;
mod velocity;
mod walking;

pub use character::{CharacterMovement, StepDownResult};
pub use custom::CustomMovement;
pub use sweep::MoveTransaction;

use serde::{Deserialize, Serialize};

use crate::avoidance::AvoidanceManager;
use crate::collision::SceneQuery;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MovementMode {
    /// Movement disabled.
    None = 0,
    #[default]
    Walking = 1,
    /// Walking projected onto a navigation floor instead of swept against geometry.
    NavWalking = 2,
    Falling = 3,
    Swimming = 4,
    Flying = 5,
    Custom = 6,
}

const MODE_BITS: u8 = 0b0000_0111;
const GROUND_BIT: u8 = 0b0000_1000;
const CUSTOM_SHIFT: u8 = 4;

/// Highest custom sub-mode that survives packing.
pub const MAX_PACKED_CUSTOM_MODE: u8 = 0x0f;

impl MovementMode {
    fn from_bits(bits: u8) -> Self {
        match bits {
            1 => Self::Walking,
            2 => Self::NavWalking,
            3 => Self::Falling,
            4 => Self::Swimming,
            5 => Self::Flying,
            6 => Self::Custom,
            _ => Self::None,
        }
    }

    #[inline]
    pub fn is_moving_on_ground(self) -> bool {
        matches!(self, Self::Walking | Self::NavWalking)
    }

    /// Pack the mode, the custom sub-mode and the ground mode into one byte.
    ///
    /// Layout: bits 0..3 mode, bit 3 ground mode (set for nav walking), bits 4..8 custom sub-mode.
    pub fn pack(self, custom: u8, ground: MovementMode) -> u8 {
        debug_assert!(custom <= MAX_PACKED_CUSTOM_MODE, "custom sub-mode {custom} does not fit");
        let custom = if self == Self::Custom { custom & MAX_PACKED_CUSTOM_MODE } else { 0 };
        let ground_bit = if ground == Self::NavWalking { GROUND_BIT } else { 0 };
        (self as u8 & MODE_BITS) | ground_bit | (custom << CUSTOM_SHIFT)
    }

    /// Inverse of [`MovementMode::pack`]: (mode, custom sub-mode, ground mode).
    pub fn unpack(packed: u8) -> (MovementMode, u8, MovementMode) {
        let mode = Self::from_bits(packed & MODE_BITS);
        let ground = if packed & GROUND_BIT != 0 {
            Self::NavWalking
        } else {
            Self::Walking
        };
        let custom = if mode == Self::Custom { packed >> CUSTOM_SHIFT } else { 0 };
        (mode, custom, ground)
    }
}

/// Per-call collaborators of the movement code.
///
/// The scene and the avoidance registry belong to the simulated world and are
/// lent to each character update; nothing here is global.
pub struct MovementContext<'a> {
    pub scene: &'a dyn SceneQuery,
    pub avoidance: Option<&'a mut AvoidanceManager>,
    /// World clock in seconds.
    pub world_time: f32,
    /// Movement clock (client timestamp) at the start of the move, used to start
    /// scheduled root motion partway through a tick.
    pub movement_time: Option<f32>,
    /// Set while the client replays saved moves. Root motion state then comes from the move.
    pub replaying: bool,
}

impl<'a> MovementContext<'a> {
    pub fn new(scene: &'a dyn SceneQuery) -> Self {
        Self {
            scene,
            avoidance: None,
            world_time: 0.0,
            movement_time: None,
            replaying: false,
        }
    }

    pub fn with_avoidance(mut self, avoidance: &'a mut AvoidanceManager) -> Self {
        self.avoidance = Some(avoidance);
        self
    }
}
