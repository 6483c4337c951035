use crate::collision::Vec3;
use std::f32::consts::TAU;

/// Quantize an angle in radians into a u16 [0, 65535].
pub fn compress_axis_to_short(angle_radians: f32) -> u16 {
    const SCALE: f32 = 65536.0 / TAU;
    // Cast through i32 so negative angles wrap into the 0..65535 range.
    (angle_radians * SCALE).round() as i32 as u16
}

/// Dequantize a `u16` angle back into radians in [0, 2π).
pub fn decompress_axis_from_short(code: u16) -> f32 {
    const REV_SCALE: f32 = TAU / 65536.0;
    (code as f32) * REV_SCALE
}

pub fn compress_axis_to_byte(angle_radians: f32) -> u8 {
    const SCALE: f32 = 256.0 / TAU;
    (angle_radians * SCALE).round() as i32 as u8
}

pub fn decompress_axis_from_byte(code: u8) -> f32 {
    (code as f32) * (TAU / 256.0)
}

/// Control rotation as it travels on the wire: yaw and pitch packed into 32 bits, roll in 8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct PackedView {
    pub yaw_pitch: u32,
    pub roll: u8,
}

impl PackedView {
    pub fn pack(yaw: f32, pitch: f32, roll: f32) -> Self {
        let yaw_q = compress_axis_to_short(yaw) as u32;
        let pitch_q = compress_axis_to_short(pitch) as u32;
        Self {
            yaw_pitch: (yaw_q << 16) | pitch_q,
            roll: compress_axis_to_byte(roll),
        }
    }

    /// Returns (yaw, pitch, roll) in radians, each in [0, 2π).
    pub fn unpack(&self) -> (f32, f32, f32) {
        let yaw = decompress_axis_from_short((self.yaw_pitch >> 16) as u16);
        let pitch = decompress_axis_from_short((self.yaw_pitch & 0xFFFF) as u16);
        (yaw, pitch, decompress_axis_from_byte(self.roll))
    }
}

/// Round each component to `1 / scale` units. `scale = 10.0` keeps one decimal.
pub fn quantize_vector(v: Vec3, scale: f32) -> Vec3 {
    v.map(|c| (c * scale).round() / scale)
}

/// Acceleration precision on the wire.
pub fn quantize_acceleration(accel: Vec3) -> Vec3 {
    quantize_vector(accel, 10.0)
}

/// Location precision on the wire.
pub fn quantize_location(loc: Vec3) -> Vec3 {
    quantize_vector(loc, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    #[test]
    fn short_axis_error_is_below_one_step() {
        let step = TAU / 65536.0;
        for angle in [0.0, 0.3, PI * 0.5, PI, 1.5 * PI, 6.2] {
            let back = decompress_axis_from_short(compress_axis_to_short(angle));
            assert!((back - angle).abs() <= step, "angle {angle} -> {back}");
        }
    }

    #[test]
    fn negative_angles_wrap_into_positive_range() {
        let back = decompress_axis_from_short(compress_axis_to_short(-PI * 0.5));
        assert!((back - 1.5 * PI).abs() < 1.0e-3);
    }

    #[test]
    fn packed_view_keeps_yaw_and_pitch_separate() {
        let view = PackedView::pack(1.0, 0.25, 0.0);
        let (yaw, pitch, roll) = view.unpack();
        assert!((yaw - 1.0).abs() < 1.0e-3);
        assert!((pitch - 0.25).abs() < 1.0e-3);
        assert_eq!(roll, 0.0);
    }

    #[test]
    fn acceleration_rounds_to_tenths() {
        let q = quantize_acceleration(Vec3::new(1.04, -2.06, 0.0));
        assert!((q.x - 1.0).abs() < 1.0e-5);
        assert!((q.y + 2.1).abs() < 1.0e-5);
    }
}
