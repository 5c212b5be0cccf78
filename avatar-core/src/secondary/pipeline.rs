//! One frame of spring-bone work: collider refresh, then N substeps of
//! kinematic → predict → constrain → collide. Every stage is a parallel fan-out
//! that completes for all bones before the next one starts.

use glam::{Mat4, Quat, Vec3};
use rayon::prelude::*;

use super::buffers::{BoneState, ChainPose, PhysicsBuffers};
use super::kernels::{self, StepEnv};
use super::settings::SpringSettings;

/// Per-frame snapshot of everything animation owns.
#[derive(Debug, Clone, Default)]
pub struct FrameInputs {
    /// World pose of each chain's root node, indexed by chain.
    pub roots: Vec<ChainPose>,
    /// World matrix of each sphere collider's node, indexed like the sphere table.
    pub sphere_nodes: Vec<Mat4>,
    pub capsule_nodes: Vec<Mat4>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub substeps: u32,
    /// Bones that produced a non-finite value and kept their last good position.
    pub fallbacks: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct ComputePipeline {
    settings: SpringSettings,
}

impl ComputePipeline {
    pub fn new(settings: SpringSettings) -> Self { Self { settings } }

    pub fn settings(&self) -> &SpringSettings { &self.settings }

    /// Run `substeps` fixed steps. With zero substeps only the kinematic copy happens.
    pub fn run_frame(&self, buffers: &mut PhysicsBuffers, inputs: &FrameInputs, substeps: u32) -> FrameStats {
        let mut stats = FrameStats { substeps, fallbacks: 0 };
        if buffers.bone_count() == 0 {
            return stats;
        }

        stats.fallbacks += self.refresh_colliders(buffers, inputs);
        self.begin_frame(buffers, inputs);

        if substeps == 0 {
            self.kinematic_stage(buffers, 1, 1);
        }
        let dt = self.settings.substep_dt;
        for k in 0..substeps {
            let settling = buffers.settle_frames_left > 0;
            let env = StepEnv {
                dt,
                world_gravity: self.settings.gravity,
                wind: kernels::wind_offset(&self.settings.wind, buffers.time, dt),
                mode: self.settings.stiffness_mode,
            };
            self.kinematic_stage(buffers, k + 1, substeps);
            stats.fallbacks += self.predict_stage(buffers, &env);
            stats.fallbacks += self.constraint_stage(buffers);
            stats.fallbacks += self.collision_stage(buffers);
            if settling {
                buffers.state.par_iter_mut().for_each(|s| s.previous = s.current);
            }
            buffers.time += dt;
        }

        buffers.pose_from.copy_from_slice(&buffers.pose_to);
        buffers.settle_frames_left = buffers.settle_frames_left.saturating_sub(1);
        buffers.frames += 1;
        if stats.fallbacks > 0 {
            log::warn!("spring bones: {} non-finite results replaced by last good values", stats.fallbacks);
        }
        stats
    }

    /// Colliders whose node matrix yields a non-finite shape keep last frame's shape.
    fn refresh_colliders(&self, buffers: &mut PhysicsBuffers, inputs: &FrameInputs) -> usize {
        let PhysicsBuffers { topology, spheres, capsules, .. } = buffers;
        let mut stale = 0;
        if inputs.sphere_nodes.len() == spheres.len() {
            stale += spheres
                .par_iter_mut()
                .zip(topology.spheres.par_iter())
                .zip(inputs.sphere_nodes.par_iter())
                .map(|((out, p), m)| {
                    let world = kernels::sphere_world(p, m);
                    if world.is_finite() {
                        *out = world;
                        0
                    } else {
                        1
                    }
                })
                .sum::<usize>();
        } else {
            log::debug!("sphere inputs ({}) do not match table ({}); keeping last frame", inputs.sphere_nodes.len(), spheres.len());
        }
        if inputs.capsule_nodes.len() == capsules.len() {
            stale += capsules
                .par_iter_mut()
                .zip(topology.capsules.par_iter())
                .zip(inputs.capsule_nodes.par_iter())
                .map(|((out, p), m)| {
                    let world = kernels::capsule_world(p, m);
                    if world.is_finite() {
                        *out = world;
                        0
                    } else {
                        1
                    }
                })
                .sum::<usize>();
        } else {
            log::debug!("capsule inputs ({}) do not match table ({}); keeping last frame", inputs.capsule_nodes.len(), capsules.len());
        }
        stale
    }

    fn begin_frame(&self, buffers: &mut PhysicsBuffers, inputs: &FrameInputs) {
        for (to, new) in buffers.pose_to.iter_mut().zip(&inputs.roots) {
            if new.translation.is_finite() {
                to.translation = new.translation;
            }
            if new.rotation.is_finite() && new.rotation.length_squared() > 0.0 {
                to.rotation = new.rotation.normalize();
            }
        }
        if !buffers.initialized {
            buffers.pose_from.copy_from_slice(&buffers.pose_to);
            place_at_rest(buffers);
            buffers.initialized = true;
        }
    }

    /// Chain roots follow their animated pose, interpolated over the frame's substeps.
    fn kinematic_stage(&self, buffers: &mut PhysicsBuffers, step: u32, of: u32) {
        let last = step >= of;
        let alpha = step as f32 / of as f32;
        let PhysicsBuffers { topology, state, pose_from, pose_to, root_rotation, .. } = buffers;

        root_rotation
            .par_iter_mut()
            .zip(pose_from.par_iter().zip(pose_to.par_iter()))
            .for_each(|(rot, (from, to))| {
                *rot = if last { to.rotation } else { from.rotation.slerp(to.rotation, alpha) };
            });

        state.par_iter_mut().zip(topology.bones.par_iter()).for_each(|(s, p)| {
            if !p.is_kinematic() {
                return;
            }
            let c = p.chain as usize;
            let target = if last {
                pose_to[c].translation
            } else {
                pose_from[c].translation.lerp(pose_to[c].translation, alpha)
            };
            *s = kernels::kinematic_bone(*s, target);
        });
    }

    fn predict_stage(&self, buffers: &mut PhysicsBuffers, env: &StepEnv) -> usize {
        let PhysicsBuffers { topology, state, scratch, root_rotation, .. } = buffers;
        let current = state.as_slice();
        let fallbacks = scratch
            .par_iter_mut()
            .enumerate()
            .map(|(i, out)| {
                let p = &topology.bones[i];
                let s = current[i];
                let parent = match p.parent() {
                    Some(parent) if !p.is_kinematic() => parent,
                    _ => {
                        *out = s;
                        return 0;
                    }
                };
                let next = kernels::predict_bone(s, p, current[parent].current, root_rotation[p.chain as usize], env);
                if next.is_finite() {
                    *out = next;
                    0
                } else {
                    *out = BoneState::at(s.current);
                    1
                }
            })
            .sum();
        std::mem::swap(state, scratch);
        fallbacks
    }

    /// Root-to-tip: each depth level is a barrier so children see constrained parents.
    fn constraint_stage(&self, buffers: &mut PhysicsBuffers) -> usize {
        let PhysicsBuffers { topology, state, root_rotation, level_updates, .. } = buffers;
        let mut fallbacks = 0;
        for level in &topology.levels {
            level_updates.clear();
            let positions = state.as_slice();
            level_updates.par_extend(level.par_iter().map(|&b| {
                let p = &topology.bones[b as usize];
                let cur = positions[b as usize].current;
                let parent = positions[p.parent as usize].current;
                (b, kernels::constrain_bone(cur, parent, p, root_rotation[p.chain as usize]))
            }));
            for &(b, pos) in level_updates.iter() {
                if pos.is_finite() {
                    state[b as usize].current = pos;
                } else {
                    fallbacks += 1;
                }
            }
        }
        fallbacks
    }

    fn collision_stage(&self, buffers: &mut PhysicsBuffers) -> usize {
        let PhysicsBuffers { topology, state, spheres, capsules, .. } = buffers;
        let (spheres, capsules) = (spheres.as_slice(), capsules.as_slice());
        state
            .par_iter_mut()
            .zip(topology.bones.par_iter())
            .map(|(s, p)| {
                if p.is_kinematic() {
                    return 0;
                }
                let refs = topology.colliders_of(p.chain as usize);
                if refs.is_empty() {
                    return 0;
                }
                let pos = kernels::collide_bone(s.current, p.hit_radius, refs, spheres, capsules);
                if pos.is_finite() {
                    s.current = pos;
                    0
                } else {
                    1
                }
            })
            .sum()
    }
}

/// Lay every chain out in its bind shape relative to its (live) root, at rest.
fn place_at_rest(buffers: &mut PhysicsBuffers) {
    let PhysicsBuffers { topology, state, pose_to, root_rotation, .. } = buffers;
    for (c, chain) in topology.chains.iter().enumerate() {
        root_rotation[c] = pose_to[c].rotation;
        state[chain.root as usize] = BoneState::at(pose_to[c].translation);
    }
    for b in topology.dynamic_in_order() {
        let p = &topology.bones[b];
        let parent = state[p.parent as usize].current;
        let rot: Quat = root_rotation[p.chain as usize];
        let target: Vec3 = kernels::rest_target(parent, rot, p);
        state[b] = BoneState::at(target);
    }
}
