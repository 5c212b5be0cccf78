//! Flat parameter tables for one skeleton configuration.

use std::collections::HashSet;
use std::ops::Range;

use bytemuck::{Pod, Zeroable};
use glam::Vec3;

use super::SpringBoneError;
use crate::model::schema::{ColliderShape, SpringBoneDesc};
use crate::rig::Skeleton;

pub const NO_PARENT: u32 = u32::MAX;
/// Rest lengths are never allowed to reach zero.
pub const MIN_REST_LENGTH: f32 = 1e-4;

/// Per-bone constants, laid out as a 64-byte GPU-style row.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct BoneParams {
    /// Bind-pose offset from the parent, in the chain root's bind-local frame.
    pub rest_offset: Vec3,
    pub rest_length: f32,
    pub gravity_dir: Vec3,
    pub gravity_power: f32,
    pub hit_radius: f32,
    pub stiffness: f32,
    pub drag: f32,
    pub parent: u32,
    pub node: u32,
    pub chain: u32,
    pub depth: u32,
    pub kinematic: u32,
}

impl BoneParams {
    pub fn is_kinematic(&self) -> bool { self.kinematic != 0 }

    pub fn parent(&self) -> Option<usize> {
        (self.parent != NO_PARENT).then_some(self.parent as usize)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct SphereParams {
    pub offset: Vec3,
    pub radius: f32,
    pub node: u32,
    pub _pad: [u32; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct CapsuleParams {
    pub offset: Vec3,
    pub radius: f32,
    pub tail: Vec3,
    pub node: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColliderRef {
    Sphere(u32),
    Capsule(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChainInfo {
    pub name: String,
    /// Index of the kinematic root bone.
    pub root: u32,
    pub bones: Range<usize>,
    /// Slice of `Topology::collider_refs` this chain collides against, in group order.
    pub colliders: Range<usize>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Topology {
    pub bones: Vec<BoneParams>,
    pub spheres: Vec<SphereParams>,
    pub capsules: Vec<CapsuleParams>,
    pub chains: Vec<ChainInfo>,
    pub collider_refs: Vec<ColliderRef>,
    /// Dynamic bones grouped by depth: `levels[0]` holds depth 1, and so on.
    pub levels: Vec<Vec<u32>>,
}

impl Topology {
    /// Walk every chain against the rig's current (bind) pose.
    pub fn build(skeleton: &Skeleton, desc: &SpringBoneDesc) -> Result<Self, SpringBoneError> {
        let mut topo = Topology::default();

        // Collider tables, one slot per described collider.
        let mut slots = Vec::with_capacity(desc.colliders.len());
        for (index, c) in desc.colliders.iter().enumerate() {
            let node = skeleton
                .find(&c.node)
                .ok_or_else(|| SpringBoneError::UnknownColliderNode { index, node: c.node.clone() })?
                as u32;
            match c.shape {
                ColliderShape::Sphere { offset, radius } => {
                    slots.push(ColliderRef::Sphere(topo.spheres.len() as u32));
                    topo.spheres.push(SphereParams { offset, radius: radius.max(0.0), node, _pad: [0; 3] });
                }
                ColliderShape::Capsule { offset, tail, radius } => {
                    slots.push(ColliderRef::Capsule(topo.capsules.len() as u32));
                    topo.capsules.push(CapsuleParams { offset, radius: radius.max(0.0), tail, node });
                }
            }
        }

        for (ci, spring) in desc.springs.iter().enumerate() {
            if spring.joints.is_empty() {
                return Err(SpringBoneError::EmptyChain(spring.name.clone()));
            }

            let colliders_start = topo.collider_refs.len();
            let mut seen = HashSet::new();
            for &g in &spring.collider_groups {
                let group = desc.collider_groups.get(g).ok_or_else(|| SpringBoneError::ColliderGroupOutOfRange {
                    chain: spring.name.clone(),
                    group: g,
                    len: desc.collider_groups.len(),
                })?;
                for &c in &group.colliders {
                    let slot = *slots.get(c).ok_or_else(|| SpringBoneError::ColliderOutOfRange {
                        group: group.name.clone(),
                        collider: c,
                        len: slots.len(),
                    })?;
                    if seen.insert(c) {
                        topo.collider_refs.push(slot);
                    }
                }
            }

            let first = topo.bones.len();
            let mut prev_node = None;
            let mut root_rot_inv = glam::Quat::IDENTITY;
            for (depth, joint) in spring.joints.iter().enumerate() {
                let node = skeleton.find(&joint.node).ok_or_else(|| SpringBoneError::UnknownNode {
                    chain: spring.name.clone(),
                    node: joint.node.clone(),
                })?;

                let gravity_dir = joint.gravity_dir.try_normalize().unwrap_or(Vec3::NEG_Y);
                let mut bone = BoneParams {
                    gravity_dir,
                    gravity_power: joint.gravity_power.max(0.0),
                    hit_radius: joint.hit_radius.max(0.0),
                    stiffness: joint.stiffness.clamp(0.0, 1.0),
                    drag: joint.drag.clamp(0.0, 1.0),
                    parent: NO_PARENT,
                    node: node as u32,
                    chain: ci as u32,
                    depth: depth as u32,
                    ..Default::default()
                };

                match prev_node {
                    None => {
                        bone.kinematic = 1;
                        root_rot_inv = skeleton.world_rotation(node).inverse();
                    }
                    Some(parent_node) => {
                        if !skeleton.is_ancestor(parent_node, node) {
                            return Err(SpringBoneError::BrokenChain {
                                chain: spring.name.clone(),
                                parent: skeleton.node(parent_node).name.clone(),
                                child: joint.node.clone(),
                            });
                        }
                        let offset = skeleton.world_translation(node) - skeleton.world_translation(parent_node);
                        let length = offset.length();
                        bone.parent = (topo.bones.len() - 1) as u32;
                        if length.is_finite() && length >= MIN_REST_LENGTH {
                            bone.rest_length = length;
                            bone.rest_offset = root_rot_inv * offset;
                        } else {
                            bone.rest_length = MIN_REST_LENGTH;
                            bone.rest_offset = root_rot_inv * (gravity_dir * MIN_REST_LENGTH);
                        }
                        let level = depth - 1;
                        if topo.levels.len() <= level {
                            topo.levels.resize_with(level + 1, Vec::new);
                        }
                        topo.levels[level].push(topo.bones.len() as u32);
                    }
                }
                topo.bones.push(bone);
                prev_node = Some(node);
            }

            topo.chains.push(ChainInfo {
                name: spring.name.clone(),
                root: first as u32,
                bones: first..topo.bones.len(),
                colliders: colliders_start..topo.collider_refs.len(),
            });
        }

        Ok(topo)
    }

    /// (bones, spheres, capsules)
    pub fn counts(&self) -> (usize, usize, usize) {
        (self.bones.len(), self.spheres.len(), self.capsules.len())
    }

    pub fn colliders_of(&self, chain: usize) -> &[ColliderRef] {
        &self.collider_refs[self.chains[chain].colliders.clone()]
    }

    /// Dynamic bones, parents before children.
    pub fn dynamic_in_order(&self) -> impl Iterator<Item = usize> + '_ {
        self.levels.iter().flatten().map(|&b| b as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{load_from_yaml_str, SAMPLE_AVATAR_YAML};

    fn sample() -> (Skeleton, SpringBoneDesc) {
        let desc = load_from_yaml_str(SAMPLE_AVATAR_YAML).unwrap();
        let sk = Skeleton::from_desc(&desc).unwrap();
        (sk, desc.spring_bone)
    }

    #[test]
    fn sample_builds_expected_tables() {
        let (sk, desc) = sample();
        let topo = Topology::build(&sk, &desc).unwrap();
        assert_eq!(topo.counts(), (11, 1, 1));
        assert_eq!(topo.chains.len(), 3);
        for chain in &topo.chains {
            let root = &topo.bones[chain.root as usize];
            assert!(root.is_kinematic());
            assert_eq!(root.parent(), None);
            for b in chain.bones.clone().skip(1) {
                assert!(!topo.bones[b].is_kinematic());
                assert_eq!(topo.bones[b].parent(), Some(b - 1));
            }
        }
        let hair = &topo.bones[1];
        assert!((hair.rest_length - 0.15).abs() < 1e-5);
        assert!((hair.rest_offset - Vec3::new(0.0, -0.15, 0.0)).length() < 1e-5);
        assert_eq!(topo.levels.len(), 3);
        assert_eq!(topo.levels[0].len(), 3);
        assert_eq!(topo.colliders_of(0), &[ColliderRef::Sphere(0), ColliderRef::Capsule(0)]);
        assert!(topo.colliders_of(2).is_empty());
    }

    #[test]
    fn dynamic_order_puts_parents_first() {
        let (sk, desc) = sample();
        let topo = Topology::build(&sk, &desc).unwrap();
        let order: Vec<usize> = topo.dynamic_in_order().collect();
        assert_eq!(order.len(), 8);
        for (pos, &b) in order.iter().enumerate() {
            if let Some(p) = topo.bones[b].parent() {
                if !topo.bones[p].is_kinematic() {
                    assert!(order[..pos].contains(&p));
                }
            }
        }
    }

    #[test]
    fn duplicate_group_colliders_are_deduplicated() {
        let (sk, mut desc) = sample();
        desc.collider_groups[1].colliders = vec![1, 0];
        let topo = Topology::build(&sk, &desc).unwrap();
        assert_eq!(topo.colliders_of(0), &[ColliderRef::Sphere(0), ColliderRef::Capsule(0)]);
    }

    #[test]
    fn parameters_are_clamped() {
        let (sk, mut desc) = sample();
        let j = &mut desc.springs[0].joints[1];
        j.stiffness = 4.0;
        j.drag = -1.0;
        j.gravity_dir = Vec3::ZERO;
        let topo = Topology::build(&sk, &desc).unwrap();
        assert_eq!(topo.bones[1].stiffness, 1.0);
        assert_eq!(topo.bones[1].drag, 0.0);
        assert_eq!(topo.bones[1].gravity_dir, Vec3::NEG_Y);
    }

    #[test]
    fn setup_errors_are_reported() {
        let (sk, desc) = sample();

        let mut d = desc.clone();
        d.springs[0].joints[2].node = "nope".into();
        assert!(matches!(Topology::build(&sk, &d), Err(SpringBoneError::UnknownNode { .. })));

        let mut d = desc.clone();
        d.springs[0].joints.swap(1, 2);
        assert!(matches!(Topology::build(&sk, &d), Err(SpringBoneError::BrokenChain { .. })));

        let mut d = desc.clone();
        d.springs[1].collider_groups.push(9);
        assert!(matches!(Topology::build(&sk, &d), Err(SpringBoneError::ColliderGroupOutOfRange { .. })));

        let mut d = desc.clone();
        d.collider_groups[0].colliders.push(7);
        assert!(matches!(Topology::build(&sk, &d), Err(SpringBoneError::ColliderOutOfRange { .. })));

        let mut d = desc;
        d.springs[2].joints.clear();
        let err = Topology::build(&sk, &d).unwrap_err();
        assert_eq!(err, SpringBoneError::EmptyChain("ribbon".into()));
        assert_eq!(err.to_string(), "chain 'ribbon' has no joints");
    }

    #[test]
    fn empty_description_is_valid() {
        let (sk, _) = sample();
        let topo = Topology::build(&sk, &SpringBoneDesc::default()).unwrap();
        assert_eq!(topo.counts(), (0, 0, 0));
        assert!(topo.levels.is_empty());
    }
}
