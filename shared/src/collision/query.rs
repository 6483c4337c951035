use super::types::{CapsuleSpec, FluidVolume, HitResult, Penetration, SurfaceId, Transform, Vec3};

/// Collision queries the movement core consumes.
///
/// Every query returns at most the closest blocking result. Capsules are always upright.
pub trait SceneQuery {
    /// Sweep a capsule from `start` to `end` and return the first blocking hit.
    ///
    /// A capsule that already overlaps geometry at `start` yields a hit with
    /// `start_penetrating` set and a push-out normal.
    fn sweep_capsule(&self, start: Vec3, end: Vec3, capsule: &CapsuleSpec) -> Option<HitResult>;

    /// Trace a ray segment and return the first blocking hit.
    fn line_trace(&self, start: Vec3, end: Vec3) -> Option<HitResult>;

    /// True when the capsule at `center` overlaps any blocking geometry.
    fn overlap_capsule(&self, center: Vec3, capsule: &CapsuleSpec) -> bool;

    /// Deepest overlap of the capsule at `center`, if any.
    fn compute_penetration(&self, center: Vec3, capsule: &CapsuleSpec) -> Option<Penetration>;

    /// Liquid volume containing `point`.
    fn fluid_at(&self, point: Vec3) -> Option<FluidVolume>;

    /// Current world transform of a movement base.
    fn base_transform(&self, base: SurfaceId) -> Option<Transform>;

    /// Whether the base can move between ticks.
    fn is_dynamic_base(&self, _base: SurfaceId) -> bool {
        false
    }
}
