//! Persistent per-instance state: parameter tables, Verlet positions, collider world shapes.

use bytemuck::{Pod, Zeroable};
use glam::{Quat, Vec3};

use super::topology::{BoneParams, CapsuleParams, SphereParams, Topology};
use super::SpringBoneError;
use crate::model::schema::SpringBoneDesc;
use crate::rig::Skeleton;

/// Verlet pair for one bone, laid out as two padded vec4 rows.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct BoneState {
    pub current: Vec3,
    pub _pad0: f32,
    pub previous: Vec3,
    pub _pad1: f32,
}

impl BoneState {
    pub fn new(current: Vec3, previous: Vec3) -> Self {
        Self { current, _pad0: 0.0, previous, _pad1: 0.0 }
    }

    /// At rest: previous equals current.
    pub fn at(position: Vec3) -> Self { Self::new(position, position) }

    pub fn is_finite(&self) -> bool { self.current.is_finite() && self.previous.is_finite() }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct SphereWorld {
    pub center: Vec3,
    pub radius: f32,
}

impl SphereWorld {
    pub fn is_finite(&self) -> bool { self.center.is_finite() && self.radius.is_finite() }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct CapsuleWorld {
    pub head: Vec3,
    pub radius: f32,
    pub tail: Vec3,
    pub _pad: f32,
}

impl CapsuleWorld {
    pub fn is_finite(&self) -> bool { self.head.is_finite() && self.tail.is_finite() && self.radius.is_finite() }
}

/// Animated pose of a chain root.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChainPose {
    pub translation: Vec3,
    pub rotation: Quat,
}

impl Default for ChainPose {
    fn default() -> Self { Self { translation: Vec3::ZERO, rotation: Quat::IDENTITY } }
}

/// Owns every array the pipeline reads or writes for one skeleton instance.
///
/// Sized once by `allocate`; `populate` fills the tables and refuses descriptions
/// whose counts disagree with the allocation.
#[derive(Debug, Clone, Default)]
pub struct PhysicsBuffers {
    pub(super) topology: Topology,
    pub(super) state: Vec<BoneState>,
    pub(super) scratch: Vec<BoneState>,
    pub(super) spheres: Vec<SphereWorld>,
    pub(super) capsules: Vec<CapsuleWorld>,
    /// Per chain: last frame's root pose and the pose this frame moves toward.
    pub(super) pose_from: Vec<ChainPose>,
    pub(super) pose_to: Vec<ChainPose>,
    /// Per chain root rotation for the substep being run.
    pub(super) root_rotation: Vec<Quat>,
    pub(super) level_updates: Vec<(u32, Vec3)>,
    pub(super) time: f32,
    pub(super) initialized: bool,
    pub(super) settle_frames_left: u32,
    pub(super) frames: u64,
}

impl PhysicsBuffers {
    /// Zero-filled storage for the given element counts.
    pub fn allocate(num_bones: usize, num_spheres: usize, num_capsules: usize) -> Self {
        log::debug!("allocating spring buffers: {num_bones} bones, {num_spheres} spheres, {num_capsules} capsules");
        Self {
            topology: Topology {
                bones: vec![BoneParams::zeroed(); num_bones],
                spheres: vec![SphereParams::zeroed(); num_spheres],
                capsules: vec![CapsuleParams::zeroed(); num_capsules],
                ..Default::default()
            },
            state: vec![BoneState::zeroed(); num_bones],
            scratch: vec![BoneState::zeroed(); num_bones],
            spheres: vec![SphereWorld::zeroed(); num_spheres],
            capsules: vec![CapsuleWorld::zeroed(); num_capsules],
            ..Default::default()
        }
    }

    /// Allocate exactly what `desc` needs and populate from the skeleton's current (bind) pose.
    pub fn for_description(skeleton: &Skeleton, desc: &SpringBoneDesc) -> Result<Self, SpringBoneError> {
        let topo = Topology::build(skeleton, desc)?;
        let (bones, spheres, capsules) = topo.counts();
        let mut buffers = Self::allocate(bones, spheres, capsules);
        buffers.populate_from(skeleton, topo)?;
        Ok(buffers)
    }

    /// Walk the chains and fill parameter tables and initial positions.
    pub fn populate(&mut self, skeleton: &Skeleton, desc: &SpringBoneDesc) -> Result<(), SpringBoneError> {
        let topo = Topology::build(skeleton, desc)?;
        self.populate_from(skeleton, topo)
    }

    fn populate_from(&mut self, skeleton: &Skeleton, topo: Topology) -> Result<(), SpringBoneError> {
        check_count("bone", topo.bones.len(), self.topology.bones.len())?;
        check_count("sphere collider", topo.spheres.len(), self.topology.spheres.len())?;
        check_count("capsule collider", topo.capsules.len(), self.topology.capsules.len())?;

        self.topology.bones.copy_from_slice(&topo.bones);
        self.topology.spheres.copy_from_slice(&topo.spheres);
        self.topology.capsules.copy_from_slice(&topo.capsules);
        self.topology.chains = topo.chains;
        self.topology.collider_refs = topo.collider_refs;
        self.topology.levels = topo.levels;

        for (state, params) in self.state.iter_mut().zip(&self.topology.bones) {
            *state = BoneState::at(skeleton.world_translation(params.node as usize));
        }
        self.scratch.copy_from_slice(&self.state);

        self.pose_to = self
            .topology
            .chains
            .iter()
            .map(|c| {
                let node = self.topology.bones[c.root as usize].node as usize;
                ChainPose { translation: skeleton.world_translation(node), rotation: skeleton.world_rotation(node) }
            })
            .collect();
        self.pose_from = self.pose_to.clone();
        self.root_rotation = self.pose_to.iter().map(|p| p.rotation).collect();
        self.level_updates = Vec::with_capacity(self.topology.levels.iter().map(Vec::len).max().unwrap_or(0));
        self.time = 0.0;
        self.initialized = false;
        self.frames = 0;

        log::debug!(
            "populated spring buffers: {} chains, {} bones ({} dynamic), {} collider refs",
            self.topology.chains.len(),
            self.topology.bones.len(),
            self.topology.levels.iter().map(Vec::len).sum::<usize>(),
            self.topology.collider_refs.len()
        );
        Ok(())
    }

    pub fn set_settling_frames(&mut self, frames: u32) { self.settle_frames_left = frames; }

    pub fn bone_count(&self) -> usize { self.topology.bones.len() }
    pub fn sphere_count(&self) -> usize { self.topology.spheres.len() }
    pub fn capsule_count(&self) -> usize { self.topology.capsules.len() }
    pub fn topology(&self) -> &Topology { &self.topology }
    pub fn params(&self) -> &[BoneParams] { &self.topology.bones }
    pub fn state(&self) -> &[BoneState] { &self.state }
    pub fn spheres(&self) -> &[SphereWorld] { &self.spheres }
    pub fn capsules(&self) -> &[CapsuleWorld] { &self.capsules }
    pub fn time(&self) -> f32 { self.time }
    /// Frames run since populate.
    pub fn frames(&self) -> u64 { self.frames }

    pub fn positions(&self) -> Vec<Vec3> { self.state.iter().map(|s| s.current).collect() }

    /// Raw state rows, e.g. for bitwise comparison or upload.
    pub fn state_bytes(&self) -> &[u8] { bytemuck::cast_slice(&self.state) }
    pub fn params_bytes(&self) -> &[u8] { bytemuck::cast_slice(&self.topology.bones) }
}

fn check_count(what: &'static str, declared: usize, allocated: usize) -> Result<(), SpringBoneError> {
    if declared != allocated {
        return Err(SpringBoneError::CountMismatch { what, declared, allocated });
    }
    Ok(())
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
    fn allocate_zero_fills() {
        let b = PhysicsBuffers::allocate(4, 2, 1);
        assert_eq!(b.bone_count(), 4);
        assert_eq!(b.sphere_count(), 2);
        assert_eq!(b.capsule_count(), 1);
        assert!(b.state_bytes().iter().all(|&x| x == 0));
        assert!(b.params_bytes().iter().all(|&x| x == 0));
        assert_eq!(b.state_bytes().len(), 4 * std::mem::size_of::<BoneState>());
    }

    #[test]
    fn populate_places_bones_at_bind_pose() {
        let (sk, desc) = sample();
        let mut b = PhysicsBuffers::allocate(11, 1, 1);
        b.populate(&sk, &desc).unwrap();
        for (s, p) in b.state().iter().zip(b.params()) {
            assert_eq!(s.current, sk.world_translation(p.node as usize));
            assert_eq!(s.current, s.previous);
        }
        assert_eq!(b.pose_from.len(), 3);
    }

    #[test]
    fn count_mismatch_is_fatal() {
        let (sk, desc) = sample();
        let mut b = PhysicsBuffers::allocate(3, 1, 1);
        assert_eq!(
            b.populate(&sk, &desc),
            Err(SpringBoneError::CountMismatch { what: "bone", declared: 11, allocated: 3 })
        );
        let mut b = PhysicsBuffers::allocate(11, 0, 1);
        assert!(matches!(
            b.populate(&sk, &desc),
            Err(SpringBoneError::CountMismatch { what: "sphere collider", .. })
        ));
    }

    #[test]
    fn zero_bones_is_valid() {
        let (sk, _) = sample();
        let b = PhysicsBuffers::for_description(&sk, &SpringBoneDesc::default()).unwrap();
        assert_eq!(b.bone_count(), 0);
        assert!(b.positions().is_empty());
    }

    #[test]
    fn layouts_are_gpu_friendly() {
        assert_eq!(std::mem::size_of::<BoneState>(), 32);
        assert_eq!(std::mem::size_of::<BoneParams>(), 64);
        assert_eq!(std::mem::size_of::<SphereWorld>(), 16);
        assert_eq!(std::mem::size_of::<CapsuleWorld>(), 32);
    }
}
