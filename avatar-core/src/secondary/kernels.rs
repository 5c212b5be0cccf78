//! Pure per-element stage functions. Each takes one bone (or collider) plus read-only
//! inputs and returns the new value; the pipeline decides how they fan out.

use std::f32::consts::TAU;

use glam::{Mat4, Quat, Vec3};

use super::buffers::{BoneState, CapsuleWorld, SphereWorld};
use super::settings::{StiffnessMode, Wind};
use super::topology::{BoneParams, CapsuleParams, ColliderRef, SphereParams};

/// Below this length a direction is considered degenerate.
pub const DEGENERATE_EPS: f32 = 1e-6;

/// Per-substep constants for the predict stage.
#[derive(Debug, Clone, Copy)]
pub struct StepEnv {
    pub dt: f32,
    pub world_gravity: Vec3,
    /// Wind displacement for this substep (already scaled by dt²).
    pub wind: Vec3,
    pub mode: StiffnessMode,
}

pub fn max_axis_scale(m: &Mat4) -> f32 {
    m.x_axis.truncate().length().max(m.y_axis.truncate().length()).max(m.z_axis.truncate().length())
}

pub fn sphere_world(p: &SphereParams, node_world: &Mat4) -> SphereWorld {
    SphereWorld { center: node_world.transform_point3(p.offset), radius: p.radius * max_axis_scale(node_world) }
}

pub fn capsule_world(p: &CapsuleParams, node_world: &Mat4) -> CapsuleWorld {
    CapsuleWorld {
        head: node_world.transform_point3(p.offset),
        radius: p.radius * max_axis_scale(node_world),
        tail: node_world.transform_point3(p.tail),
        _pad: 0.0,
    }
}

pub fn wind_offset(wind: &Wind, time: f32, dt: f32) -> Vec3 {
    if wind.amplitude == 0.0 {
        return Vec3::ZERO;
    }
    let dir = wind.direction.try_normalize().unwrap_or(Vec3::ZERO);
    dir * wind.amplitude * (TAU * wind.frequency * time + wind.phase).sin() * dt * dt
}

/// Kinematic bones snap to their animated target with zero velocity.
pub fn kinematic_bone(state: BoneState, target: Vec3) -> BoneState {
    if target.is_finite() {
        BoneState::at(target)
    } else {
        BoneState::at(state.current)
    }
}

/// Where the bind pose puts this bone, given its parent's current position.
pub fn rest_target(parent_current: Vec3, root_rotation: Quat, params: &BoneParams) -> Vec3 {
    parent_current + root_rotation * params.rest_offset
}

/// Verlet step for one dynamic bone.
///
/// `Compatible` pulls toward the rest target from the pre-step position and lets the
/// pull flow into velocity. `Decoupled` integrates first, then shifts both current and
/// previous by the same correction so stiffness never turns into motion.
pub fn predict_bone(state: BoneState, params: &BoneParams, parent_current: Vec3, root_rotation: Quat, env: &StepEnv) -> BoneState {
    let cur = state.current;
    let inertia = (cur - state.previous) * (1.0 - params.drag);
    let gravity = (params.gravity_dir * params.gravity_power + env.world_gravity) * (env.dt * env.dt);
    let target = rest_target(parent_current, root_rotation, params);
    let free = cur + inertia + gravity + env.wind;
    match env.mode {
        StiffnessMode::Compatible => BoneState::new(free + (target - cur) * params.stiffness, cur),
        StiffnessMode::Decoupled => {
            let correction = (target - free) * params.stiffness;
            BoneState::new(free + correction, cur + correction)
        }
    }
}

/// Hard distance constraint: put the bone exactly `rest_length` from its parent.
pub fn constrain_bone(current: Vec3, parent_current: Vec3, params: &BoneParams, root_rotation: Quat) -> Vec3 {
    let delta = current - parent_current;
    let len = delta.length();
    let dir = if len.is_finite() && len > DEGENERATE_EPS {
        delta / len
    } else {
        (root_rotation * params.rest_offset).try_normalize().unwrap_or(Vec3::NEG_Y)
    };
    parent_current + dir * params.rest_length
}

/// Signed distance between a sphere collider and a sphere of `point_radius` at `point`,
/// plus the unit direction from the collider toward the point. Negative means overlap.
pub fn sphere_signed_distance(center: Vec3, radius: f32, point: Vec3, point_radius: f32) -> (f32, Vec3) {
    let to_point = point - center;
    let dist = to_point.length();
    let dir = if dist > DEGENERATE_EPS { to_point / dist } else { Vec3::Y };
    (dist - radius - point_radius, dir)
}

pub fn closest_point_on_segment(head: Vec3, tail: Vec3, point: Vec3) -> Vec3 {
    let seg = tail - head;
    let t = (point - head).dot(seg);
    let len_sq = seg.length_squared();
    if t <= 0.0 {
        head
    } else if t >= len_sq {
        tail
    } else {
        head + seg * (t / len_sq)
    }
}

pub fn capsule_signed_distance(head: Vec3, tail: Vec3, radius: f32, point: Vec3, point_radius: f32) -> (f32, Vec3) {
    sphere_signed_distance(closest_point_on_segment(head, tail, point), radius, point, point_radius)
}

/// Push a bone out of every referenced collider, one after another in order.
pub fn collide_bone(mut pos: Vec3, hit_radius: f32, refs: &[ColliderRef], spheres: &[SphereWorld], capsules: &[CapsuleWorld]) -> Vec3 {
    for r in refs {
        let (dist, dir) = match *r {
            ColliderRef::Sphere(i) => {
                let s = &spheres[i as usize];
                sphere_signed_distance(s.center, s.radius, pos, hit_radius)
            }
            ColliderRef::Capsule(i) => {
                let c = &capsules[i as usize];
                capsule_signed_distance(c.head, c.tail, c.radius, pos, hit_radius)
            }
        };
        if dist < 0.0 {
            pos += dir * -dist;
        }
    }
    pos
}
