//! Wire contract between a predicting client and the authoritative server.
//!
//! Messages are plain serde types; moving them between peers is up to the caller.

mod messages;

pub use messages::{ClientAdjustment, ClientMove, MoveMessage, OldMove};

use nalgebra::{UnitQuaternion, Vector3};

use crate::bitmask_flags::BitmaskFlags;
use crate::collision::{Quat, Vec3};
use crate::quantize::PackedView;
use crate::utils::{quat_from_yaw, yaw_from_xz, to_planar};

crate::define_bitmask_flags!(MoveFlag, u8, {
    JumpPressed,
    WantsToCrouch,
    Reserved1,
    Reserved2,
    Custom0,
    Custom1,
    Custom2,
    Custom3,
});

/// Input flags of one move, one byte on the wire.
pub type MoveFlags = BitmaskFlags<u8>;

/// Pack a control rotation into its wire form. Roll is not used by movement and is sent as zero.
pub fn pack_view(rotation: &Quat) -> PackedView {
    let forward = rotation * Vec3::new(0.0, 0.0, -1.0);
    let yaw = yaw_from_xz(to_planar(&forward)).unwrap_or(0.0);
    let pitch = forward.y.clamp(-1.0, 1.0).asin();
    PackedView::pack(yaw, pitch, 0.0)
}

/// Inverse of [`pack_view`] up to quantization.
pub fn unpack_view(view: &PackedView) -> Quat {
    let (yaw, pitch, _) = view.unpack();
    quat_from_yaw(yaw) * UnitQuaternion::from_axis_angle(&Vector3::x_axis(), pitch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn move_flags_fit_in_one_byte() {
        let flags = MoveFlags::from_flags(&[MoveFlag::JumpPressed, MoveFlag::Custom3]);
        assert_eq!(flags.bits(), 0b1000_0001);
        assert!(flags.has(MoveFlag::JumpPressed));
        assert!(!flags.has(MoveFlag::WantsToCrouch));
    }

    #[test]
    fn view_survives_packing() {
        let rotation = quat_from_yaw(1.2) * UnitQuaternion::from_axis_angle(&Vector3::x_axis(), 0.3);
        let back = unpack_view(&pack_view(&rotation));
        let a = rotation * Vec3::new(0.0, 0.0, -1.0);
        let b = back * Vec3::new(0.0, 0.0, -1.0);
        assert!((a - b).norm() < 1.0e-3);
    }
}
