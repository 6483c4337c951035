use serde::{Deserialize, Serialize};

use super::MoveFlags;
use crate::collision::{Quat, SurfaceId, Vec3};
use crate::movement::MovementMode;
use crate::quantize::{PackedView, quantize_acceleration, quantize_location};
use crate::root_motion::RootMotionSourceGroup;

/// One client move as the server sees it.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientMove {
    /// Client movement clock at the end of the move.
    pub timestamp: f32,
    /// Input acceleration, rounded to tenths.
    pub accel: Vec3,
    /// Where the client ended up, world space, rounded to hundredths.
    pub client_loc: Vec3,
    pub flags: MoveFlags,
    pub view: PackedView,
    /// Client movement mode after the move, see [`MovementMode::pack`].
    pub client_mode: u8,
    pub base: Option<SurfaceId>,
}

impl ClientMove {
    /// Build a move with the wire precision already applied, so the client
    /// simulates with exactly what the server will receive.
    pub fn new(
        timestamp: f32,
        accel: Vec3,
        client_loc: Vec3,
        flags: MoveFlags,
        view: PackedView,
        client_mode: u8,
        base: Option<SurfaceId>,
    ) -> Self {
        Self {
            timestamp,
            accel: quantize_acceleration(accel),
            client_loc: quantize_location(client_loc),
            flags,
            view,
            client_mode,
            base,
        }
    }

    /// Movement mode the client reported.
    pub fn mode(&self) -> MovementMode {
        MovementMode::unpack(self.client_mode).0
    }
}

/// An old important move resent after a newer one; only its input is replayed.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct OldMove {
    pub timestamp: f32,
    pub accel: Vec3,
    pub flags: MoveFlags,
}

/// Client to server movement call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MoveMessage {
    Single(ClientMove),
    /// A held pending move and the newest move sent together. The pending
    /// move's end location is not checked.
    Dual { pending: ClientMove, current: ClientMove },
    /// Like `Dual`, but only the current move runs with animation root motion.
    DualHybridRootMotion { pending: ClientMove, current: ClientMove },
    Old(OldMove),
}

impl MoveMessage {
    /// Timestamp of the newest move carried.
    pub fn timestamp(&self) -> f32 {
        match self {
            Self::Single(m) => m.timestamp,
            Self::Dual { current, .. } | Self::DualHybridRootMotion { current, .. } => current.timestamp,
            Self::Old(m) => m.timestamp,
        }
    }
}

/// Server to client response to a move.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ClientAdjustment {
    /// The move at `timestamp` matched the server.
    AckGoodMove { timestamp: f32 },
    /// Correction of a character at rest: location only.
    VeryShortAdjustPosition {
        timestamp: f32,
        new_loc: Vec3,
        base: Option<SurfaceId>,
        mode: u8,
    },
    AdjustPosition {
        timestamp: f32,
        new_loc: Vec3,
        new_vel: Vec3,
        base: Option<SurfaceId>,
        mode: u8,
    },
    /// Correction that also carries the server's root motion sources. Their ids
    /// are server-local and are matched to the client's by content.
    AdjustRootMotionSourcePosition {
        timestamp: f32,
        root_motion: RootMotionSourceGroup,
        new_loc: Vec3,
        new_rot: Quat,
        new_vel: Vec3,
        base: Option<SurfaceId>,
        mode: u8,
    },
}

impl ClientAdjustment {
    pub fn timestamp(&self) -> f32 {
        match self {
            Self::AckGoodMove { timestamp }
            | Self::VeryShortAdjustPosition { timestamp, .. }
            | Self::AdjustPosition { timestamp, .. }
            | Self::AdjustRootMotionSourcePosition { timestamp, .. } => *timestamp,
        }
    }

    pub fn is_ack(&self) -> bool {
        matches!(self, Self::AckGoodMove { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::MoveFlag;

    #[test]
    fn client_move_is_built_at_wire_precision() {
        let m = ClientMove::new(
            1.5,
            Vec3::new(100.04, 0.0, -3.06),
            Vec3::new(1.234, 90.0049, 0.0),
            MoveFlags::from_flags(&[MoveFlag::JumpPressed]),
            PackedView::default(),
            MovementMode::Falling.pack(0, MovementMode::Walking),
            None,
        );
        assert!((m.accel.x - 100.0).abs() < 1e-4);
        assert!((m.accel.z + 3.1).abs() < 1e-4);
        assert!((m.client_loc.x - 1.23).abs() < 1e-4);
        assert_eq!(m.mode(), MovementMode::Falling);
    }

    #[test]
    fn message_timestamp_is_the_newest_move() {
        let older = ClientMove::new(1.0, Vec3::zeros(), Vec3::zeros(), MoveFlags::empty(), PackedView::default(), 1, None);
        let newer = ClientMove { timestamp: 1.1, ..older };
        let msg = MoveMessage::Dual {
            pending: older,
            current: newer,
        };
        assert_eq!(msg.timestamp(), 1.1);
        assert!(ClientAdjustment::AckGoodMove { timestamp: 1.1 }.is_ack());
    }
}
