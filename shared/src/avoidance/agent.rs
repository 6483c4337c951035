use crate::collision::Vec3;

use super::{AvoidanceGroups, AvoidanceUid};

/// What an agent has to answer to take part in avoidance.
///
/// The manager reads these once per registration or refresh and hands the
/// agent its UID back through [`AvoidanceAgent::set_rvo_avoidance_uid`].
pub trait AvoidanceAgent {
    fn rvo_avoidance_uid(&self) -> Option<AvoidanceUid>;
    fn set_rvo_avoidance_uid(&mut self, uid: AvoidanceUid);

    /// Feet location of the agent.
    fn rvo_avoidance_origin(&self) -> Vec3;
    fn rvo_avoidance_radius(&self) -> f32;
    fn rvo_avoidance_height(&self) -> f32;
    /// Only agents within this horizontal distance are considered.
    fn rvo_avoidance_consideration_radius(&self) -> f32;
    /// 0 yields fully, 1 never yields.
    fn rvo_avoidance_weight(&self) -> f32;
    fn velocity_for_rvo_consideration(&self) -> Vec3;

    /// Groups this agent belongs to.
    fn avoidance_group_mask(&self) -> AvoidanceGroups;
    fn groups_to_avoid_mask(&self) -> AvoidanceGroups;
    fn groups_to_ignore_mask(&self) -> AvoidanceGroups;
}

/// A static navigation boundary segment.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NavEdge {
    pub start: Vec3,
    pub end: Vec3,
}

/// Source of navigation edges that avoidance headings must not cross.
pub trait NavEdgeProvider {
    /// Edges within `radius` of `origin`.
    fn edges_near(&self, origin: Vec3, radius: f32) -> Vec<NavEdge>;
}

/// Fixed list of edges, for levels without a navigation mesh.
impl NavEdgeProvider for Vec<NavEdge> {
    fn edges_near(&self, origin: Vec3, radius: f32) -> Vec<NavEdge> {
        let radius_sq = radius * radius;
        self.iter()
            .filter(|e| distance_to_segment_2d_sq(&origin, e) <= radius_sq)
            .copied()
            .collect()
    }
}

fn distance_to_segment_2d_sq(point: &Vec3, edge: &NavEdge) -> f32 {
    let (px, pz) = (point.x - edge.start.x, point.z - edge.start.z);
    let (dx, dz) = (edge.end.x - edge.start.x, edge.end.z - edge.start.z);
    let len_sq = dx * dx + dz * dz;
    let t = if len_sq > 0.0 {
        ((px * dx + pz * dz) / len_sq).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let (ex, ez) = (px - dx * t, pz - dz * t);
    ex * ex + ez * ez
}
