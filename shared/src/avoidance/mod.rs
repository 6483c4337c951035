/*!
Reciprocal velocity obstacle avoidance.

[`AvoidanceManager`] is a registry of moving agents owned by the simulated
world and lent to each character update. Agents register once, refresh their
record every tick and ask for a steering velocity that keeps them out of every
neighbour's velocity obstacle. Records that stop being refreshed expire and
their slots are reused.
*/

mod agent;
mod cone;
mod uid;

pub use agent::{AvoidanceAgent, NavEdge, NavEdgeProvider};
pub use cone::{avoid_cones, VelocityCone};
pub use uid::AvoidanceUid;

use log::{debug, trace};

use crate::bitmask_flags::BitmaskFlags;
use crate::collision::Vec3;
use crate::config::AvoidanceSettings;
use crate::utils::{horizontal, size_2d, to_planar};
use cone::Vec2;

/// Avoidance group bits; 32 groups.
pub type AvoidanceGroups = BitmaskFlags<u32>;

/// Heading offsets tried when the direct path is blocked, each on both sides.
const SAMPLE_ANGLES_DEG: [f32; 4] = [23.0, 40.0, 55.0, 85.0];

/// One registered agent as seen by every other agent.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AvoidanceRecord {
    pub center: Vec3,
    /// Horizontal velocity.
    pub velocity: Vec3,
    /// Radius including the artificial expansion.
    pub radius: f32,
    pub half_height: f32,
    pub weight: f32,
    pub group_mask: AvoidanceGroups,
    pub groups_to_avoid: AvoidanceGroups,
    pub groups_to_ignore: AvoidanceGroups,
    pub test_radius_2d: f32,
    pub remaining_time_to_live: f32,
    /// World time until which the agent acts as an immovable obstacle.
    pub override_weight_time: f32,
}

impl AvoidanceRecord {
    fn from_agent(agent: &dyn AvoidanceAgent, weight: f32, settings: &AvoidanceSettings) -> Self {
        Self {
            center: agent.rvo_avoidance_origin(),
            velocity: horizontal(&agent.velocity_for_rvo_consideration()),
            radius: agent.rvo_avoidance_radius() * settings.artificial_radius_expansion,
            half_height: agent.rvo_avoidance_height(),
            weight: weight.clamp(0.0, 1.0),
            group_mask: agent.avoidance_group_mask(),
            groups_to_avoid: agent.groups_to_avoid_mask(),
            groups_to_ignore: agent.groups_to_ignore_mask(),
            test_radius_2d: agent.rvo_avoidance_consideration_radius(),
            remaining_time_to_live: settings.default_time_to_live,
            override_weight_time: 0.0,
        }
    }

    #[inline]
    pub fn is_expired(&self) -> bool {
        self.remaining_time_to_live <= 0.0
    }

    /// True when this agent does not steer around `other_groups`.
    pub fn should_ignore_group(&self, other_groups: AvoidanceGroups) -> bool {
        !self.groups_to_avoid.intersects(other_groups) || self.groups_to_ignore.intersects(other_groups)
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    record: AvoidanceRecord,
}

#[derive(Default)]
pub struct AvoidanceManager {
    settings: AvoidanceSettings,
    slots: Vec<Slot>,
    free_slots: Vec<u32>,
    current_time: f32,
    /// Time left until the next expiry pass; `None` when no record is alive.
    expiry_timer: Option<f32>,
    nav_edges: Option<Box<dyn NavEdgeProvider + Send + Sync>>,
}

impl AvoidanceManager {
    pub fn new(settings: AvoidanceSettings) -> Self {
        Self {
            settings,
            ..Default::default()
        }
    }

    pub fn settings(&self) -> &AvoidanceSettings {
        &self.settings
    }

    /// Headings toward these edges are rejected.
    pub fn set_nav_edges(&mut self, provider: Option<Box<dyn NavEdgeProvider + Send + Sync>>) {
        self.nav_edges = provider;
    }

    pub fn current_time(&self) -> f32 {
        self.current_time
    }

    /// Number of live records.
    pub fn object_count(&self) -> usize {
        self.slots.iter().filter(|s| !s.record.is_expired()).count()
    }

    pub fn is_registered(&self, uid: AvoidanceUid) -> bool {
        self.record(uid).is_some()
    }

    /// Live record behind `uid`. Stale and expired handles resolve to `None`.
    pub fn record(&self, uid: AvoidanceUid) -> Option<&AvoidanceRecord> {
        self.slots
            .get(uid.index as usize)
            .filter(|s| s.generation == uid.generation && !s.record.is_expired())
            .map(|s| &s.record)
    }

    fn record_mut(&mut self, uid: AvoidanceUid) -> Option<&mut AvoidanceRecord> {
        self.slots
            .get_mut(uid.index as usize)
            .filter(|s| s.generation == uid.generation && !s.record.is_expired())
            .map(|s| &mut s.record)
    }

    /// Add `agent` to the registry, reusing an expired slot when one is free.
    pub fn register_movement_component(&mut self, agent: &mut dyn AvoidanceAgent, weight: f32) -> AvoidanceUid {
        let record = AvoidanceRecord::from_agent(agent, weight, &self.settings);
        let uid = match self.free_slots.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.generation = slot.generation.wrapping_add(1);
                slot.record = record;
                AvoidanceUid {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot { generation: 0, record });
                AvoidanceUid { index, generation: 0 }
            }
        };
        agent.set_rvo_avoidance_uid(uid);

        if self.expiry_timer.is_none() {
            self.expiry_timer = Some(self.settings.default_time_to_live * 0.5);
        }
        debug!("avoidance: registered {uid}, {} live", self.object_count());
        uid
    }

    /// Refresh the agent's record and reset its time to live.
    pub fn update_rvo(&mut self, agent: &dyn AvoidanceAgent) {
        let Some(uid) = agent.rvo_avoidance_uid() else {
            return;
        };
        let now = self.current_time;
        let settings = self.settings.clone();
        let Some(record) = self.record_mut(uid) else {
            trace!("avoidance: update for unregistered {uid}");
            return;
        };
        let override_weight_time = record.override_weight_time;
        *record = AvoidanceRecord::from_agent(agent, agent.rvo_avoidance_weight(), &settings);
        record.override_weight_time = override_weight_time;
        if override_weight_time > now {
            record.weight = 1.0;
        }
    }

    /// Make the agent an immovable obstacle for the next `duration` seconds.
    pub fn override_to_max_weight(&mut self, uid: AvoidanceUid, duration: f32) {
        let now = self.current_time;
        if let Some(record) = self.record_mut(uid) {
            record.override_weight_time = now + duration;
        }
    }

    /// Advance the registry clock and run expiry passes that fall due.
    pub fn tick(&mut self, dt: f32) {
        self.current_time += dt;
        let mut budget = dt;
        while let Some(remaining) = self.expiry_timer {
            if remaining > budget {
                self.expiry_timer = Some(remaining - budget);
                break;
            }
            budget -= remaining;
            self.remove_outdated_objects();
        }
    }

    /// Halve the time to live of every live record; expire the ones already halved.
    ///
    /// The pass repeats every half time to live while anything is alive, so a
    /// record not refreshed between two passes expires.
    pub fn remove_outdated_objects(&mut self) {
        let half_ttl = self.settings.default_time_to_live * 0.5;
        let mut any_alive = false;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let record = &mut slot.record;
            if record.is_expired() {
                continue;
            }
            if record.remaining_time_to_live > half_ttl {
                record.remaining_time_to_live = half_ttl;
                any_alive = true;
            } else {
                record.remaining_time_to_live = 0.0;
                let index = index as u32;
                if !self.free_slots.contains(&index) {
                    self.free_slots.push(index);
                }
                trace!("avoidance: slot {index} expired");
            }
        }
        self.expiry_timer = any_alive.then_some(half_ttl);
    }

    /// Steering velocity for a registered or unregistered agent.
    pub fn get_avoidance_velocity_for_component(&self, agent: &dyn AvoidanceAgent) -> Vec3 {
        let uid = agent.rvo_avoidance_uid();
        // A registered agent queries with the weight the others see for it.
        let weight = match uid.and_then(|uid| self.record(uid)) {
            Some(record) if record.override_weight_time > self.current_time => 1.0,
            Some(record) => record.weight,
            None => agent.rvo_avoidance_weight(),
        };
        let query = AvoidanceRecord::from_agent(agent, weight, &self.settings);
        self.get_avoidance_velocity_ignoring(&query, uid)
    }

    /// Steering velocity for `query`, skipping the record `ignore`.
    ///
    /// Returns the query velocity unchanged when nothing obstructs it, and a
    /// zero vector when every sampled heading is blocked.
    pub fn get_avoidance_velocity_ignoring(&self, query: &AvoidanceRecord, ignore: Option<AvoidanceUid>) -> Vec3 {
        let horizon = self.settings.delta_time_to_predict;
        if horizon <= 0.0 {
            return query.velocity;
        }
        let desired = to_planar(&query.velocity) * horizon;
        let max_speed = size_2d(&query.velocity) * horizon;
        let my_center = to_planar(&query.center);

        let mut cones = Vec::new();
        let mut unobstructed = true;

        for (index, slot) in self.slots.iter().enumerate() {
            let other = &slot.record;
            let is_self = ignore.is_some_and(|uid| uid.index as usize == index && uid.generation == slot.generation);
            if is_self || other.is_expired() || query.should_ignore_group(other.group_mask) {
                continue;
            }
            let relative = to_planar(&other.center) - my_center;
            if relative.norm_squared() > query.test_radius_2d * query.test_radius_2d {
                continue;
            }
            if (other.center.y - query.center.y).abs()
                > other.half_height + query.half_height + self.settings.height_check_margin
            {
                continue;
            }
            // Moving away from it.
            if desired.dot(&relative) <= 0.0 {
                continue;
            }

            let other_velocity = to_planar(&other.velocity);
            let my_velocity = to_planar(&query.velocity);
            let reciprocates = other.override_weight_time <= self.current_time && other_velocity.dot(&relative) < 0.0;
            let apex = if reciprocates {
                let other_weight = (other.weight + (1.0 - query.weight)) * 0.5;
                my_velocity.lerp(&other_velocity, other_weight) * horizon
            } else {
                other_velocity * horizon
            };

            let Some(cone) = VelocityCone::new(apex, relative, query.radius + other.radius) else {
                continue;
            };
            if unobstructed && cone.contains(&desired) {
                unobstructed = false;
            }
            cones.push(cone);
        }

        if unobstructed {
            return query.velocity;
        }

        let edges = self
            .nav_edges
            .as_ref()
            .map(|p| p.edges_near(query.center, max_speed))
            .unwrap_or_default();

        let heading = desired.y.atan2(desired.x);
        let mut best_score = 0.0_f32;
        let mut best = Vec2::zeros();
        for offset in SAMPLE_ANGLES_DEG {
            for angle in [heading - offset.to_radians(), heading + offset.to_radians()] {
                let sample = Vec2::new(angle.cos(), angle.sin()) * max_speed;
                // Cannot beat the best so far even unclipped.
                if sample.dot(&desired) * sample.norm_squared() <= best_score {
                    continue;
                }
                if crosses_any_edge(&query.center, &sample, &edges, self.settings.height_check_margin) {
                    continue;
                }
                let candidate = avoid_cones(&cones, Vec2::zeros(), sample);
                let score = candidate.dot(&desired) * candidate.norm_squared();
                if score > best_score {
                    best_score = score;
                    best = candidate;
                }
            }
        }

        trace!(
            "avoidance: obstructed by {} cones, {:?} -> {:?}",
            cones.len(),
            desired,
            best
        );
        let out = best / horizon;
        Vec3::new(out.x, 0.0, out.y)
    }
}

fn crosses_any_edge(origin: &Vec3, displacement: &Vec2, edges: &[NavEdge], height_margin: f32) -> bool {
    let a0 = to_planar(origin);
    let a1 = a0 + displacement;
    edges.iter().any(|edge| {
        let near_height = (edge.start.y - origin.y).abs() <= height_margin || (edge.end.y - origin.y).abs() <= height_margin;
        near_height && segments_intersect_2d(a0, a1, to_planar(&edge.start), to_planar(&edge.end))
    })
}

fn segments_intersect_2d(a0: Vec2, a1: Vec2, b0: Vec2, b1: Vec2) -> bool {
    let cross = |u: Vec2, v: Vec2| u.x * v.y - u.y * v.x;
    let da = a1 - a0;
    let db = b1 - b0;
    let denom = cross(da, db);
    if denom.abs() <= f32::EPSILON {
        return false;
    }
    let t = cross(b0 - a0, db) / denom;
    let u = cross(b0 - a0, da) / denom;
    (0.0..=1.0).contains(&t) && (0.0..=1.0).contains(&u)
}
