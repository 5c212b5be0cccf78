//! Frame driver: turns variable frame times into fixed substeps, submits frames to the
//! compute context and hands finished positions back to the rig without waiting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, TryLockError};

use glam::Vec3;

use super::buffers::{ChainPose, PhysicsBuffers};
use super::pipeline::{ComputePipeline, FrameInputs};
use super::settings::SpringSettings;
use super::SpringBoneError;
use crate::compute::ComputeContext;
use crate::model::schema::SpringBoneDesc;
use crate::rig::Skeleton;

/// Outcome of a readback attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readback {
    /// Positions of this many dynamic bones were written into the rig.
    Applied { bones: usize },
    /// The latest submitted frame has not finished; nothing was touched.
    Pending,
}

/// State shared with in-flight jobs. Replaced wholesale on reconfigure.
struct Shared {
    buffers: Mutex<PhysicsBuffers>,
    completed: AtomicU64,
    signal: Mutex<()>,
    done: Condvar,
}

impl Shared {
    fn new(buffers: PhysicsBuffers) -> Arc<Self> {
        Arc::new(Self { buffers: Mutex::new(buffers), completed: AtomicU64::new(0), signal: Mutex::new(()), done: Condvar::new() })
    }

    fn lock_buffers(&self) -> MutexGuard<'_, PhysicsBuffers> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `None` when the buffers are busy.
    fn try_snapshot(&self) -> Option<Vec<Vec3>> {
        match self.buffers.try_lock() {
            Ok(guard) => Some(guard.positions()),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner().positions()),
            Err(TryLockError::WouldBlock) => None,
        }
    }
}

/// Marks a generation complete when dropped, so a panicking frame still releases `flush`.
struct Completion {
    shared: Arc<Shared>,
    generation: u64,
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.shared.completed.fetch_max(self.generation, Ordering::AcqRel);
        let _guard = self.shared.signal.lock().unwrap_or_else(PoisonError::into_inner);
        self.shared.done.notify_all();
    }
}

/// Rig nodes the simulator reads from and writes to, resolved once per configuration.
#[derive(Debug, Clone, Default)]
struct RigLayout {
    bones: usize,
    chain_roots: Vec<usize>,
    sphere_nodes: Vec<usize>,
    capsule_nodes: Vec<usize>,
    /// (bone, node) pairs of dynamic bones, grouped root-to-tip by depth.
    write_levels: Vec<Vec<(usize, usize)>>,
}

impl RigLayout {
    fn of(buffers: &PhysicsBuffers) -> Self {
        let topo = buffers.topology();
        Self {
            bones: topo.bones.len(),
            chain_roots: topo.chains.iter().map(|c| topo.bones[c.root as usize].node as usize).collect(),
            sphere_nodes: topo.spheres.iter().map(|s| s.node as usize).collect(),
            capsule_nodes: topo.capsules.iter().map(|c| c.node as usize).collect(),
            write_levels: topo
                .levels
                .iter()
                .map(|level| level.iter().map(|&b| (b as usize, topo.bones[b as usize].node as usize)).collect())
                .collect(),
        }
    }

    fn gather(&self, skeleton: &Skeleton) -> FrameInputs {
        FrameInputs {
            roots: self
                .chain_roots
                .iter()
                .map(|&n| ChainPose { translation: skeleton.world_translation(n), rotation: skeleton.world_rotation(n) })
                .collect(),
            sphere_nodes: self.sphere_nodes.iter().map(|&n| skeleton.world_matrix(n)).collect(),
            capsule_nodes: self.capsule_nodes.iter().map(|&n| skeleton.world_matrix(n)).collect(),
        }
    }

    fn dynamic_bones(&self) -> usize { self.write_levels.iter().map(Vec::len).sum() }
}

#[derive(Default)]
pub struct SimulatorBuilder {
    context: Option<Arc<ComputeContext>>,
    settings: SpringSettings,
    buffers: Option<PhysicsBuffers>,
}

impl SimulatorBuilder {
    pub fn context(mut self, context: Arc<ComputeContext>) -> Self {
        self.context = Some(context);
        self
    }

    pub fn settings(mut self, settings: SpringSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Use pre-allocated storage instead of sizing it from the description.
    /// `build` fails with `CountMismatch` if the counts disagree.
    pub fn buffers(mut self, buffers: PhysicsBuffers) -> Self {
        self.buffers = Some(buffers);
        self
    }

    /// Populate from the rig's current pose, which is taken as the bind pose.
    pub fn build(self, skeleton: &Skeleton, springs: &SpringBoneDesc) -> Result<SpringBoneSimulator, SpringBoneError> {
        let context = self.context.ok_or(SpringBoneError::MissingContext)?;
        self.settings.validate()?;
        let buffers = match self.buffers {
            Some(mut buffers) => {
                buffers.populate(skeleton, springs)?;
                buffers
            }
            None => PhysicsBuffers::for_description(skeleton, springs)?,
        };
        Ok(SpringBoneSimulator::with_buffers(context, self.settings, buffers))
    }
}

/// Drives one skeleton instance's spring bones.
pub struct SpringBoneSimulator {
    context: Arc<ComputeContext>,
    pipeline: ComputePipeline,
    shared: Arc<Shared>,
    layout: RigLayout,
    submitted: u64,
    accumulator: f32,
}

impl SpringBoneSimulator {
    pub fn builder() -> SimulatorBuilder { SimulatorBuilder::default() }

    fn with_buffers(context: Arc<ComputeContext>, settings: SpringSettings, mut buffers: PhysicsBuffers) -> Self {
        buffers.set_settling_frames(settings.settling_frames);
        let layout = RigLayout::of(&buffers);
        log::debug!(
            "spring simulator on {:?}: {} chains, {} dynamic bones",
            context,
            layout.chain_roots.len(),
            layout.dynamic_bones()
        );
        Self {
            context,
            pipeline: ComputePipeline::new(settings),
            shared: Shared::new(buffers),
            layout,
            submitted: 0,
            accumulator: 0.0,
        }
    }

    pub fn settings(&self) -> &SpringSettings { self.pipeline.settings() }

    pub fn bone_count(&self) -> usize { self.layout.bones }

    /// Advance by `dt` seconds of animation time. Reads the rig's current world matrices,
    /// enqueues the frame and returns the number of substeps it will run.
    ///
    /// Zero, negative and non-finite `dt` do nothing. Elapsed time beyond `max_substeps`
    /// substeps is dropped.
    pub fn update(&mut self, dt: f32, skeleton: &Skeleton) -> u32 {
        if !dt.is_finite() || dt <= f32::EPSILON {
            return 0;
        }
        let settings = self.pipeline.settings();
        let step = settings.substep_dt;
        let max = settings.max_substeps;

        self.accumulator += dt;
        let wanted = (self.accumulator / step).floor();
        let substeps = if wanted > max as f32 {
            log::debug!("clamping {wanted} substeps to {max}; dropping {:.4}s", self.accumulator - max as f32 * step);
            self.accumulator = 0.0;
            max
        } else {
            self.accumulator = (self.accumulator - wanted * step).max(0.0);
            wanted as u32
        };

        self.submit(skeleton, substeps);
        substeps
    }

    fn submit(&mut self, skeleton: &Skeleton, substeps: u32) {
        self.submitted += 1;
        let inputs = self.layout.gather(skeleton);
        let done = Completion { shared: Arc::clone(&self.shared), generation: self.submitted };
        let fanout = self.context.fanout();
        let pipeline = self.pipeline;
        self.context.submit(Box::new(move || {
            let mut guard = done.shared.lock_buffers();
            let buffers: &mut PhysicsBuffers = &mut guard;
            fanout.install(|| pipeline.run_frame(buffers, &inputs, substeps));
            drop(guard);
            drop(done);
        }));
    }

    /// True when the most recent submission has finished.
    pub fn is_idle(&self) -> bool { self.shared.completed.load(Ordering::Acquire) >= self.submitted }

    /// Block until the most recent submission has finished.
    pub fn flush(&self) {
        let mut guard = self.shared.signal.lock().unwrap_or_else(PoisonError::into_inner);
        while !self.is_idle() {
            guard = self.shared.done.wait(guard).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Snapshot of every bone's current position, or `None` if nothing has been submitted
    /// yet or work is still in flight.
    pub fn positions(&self) -> Option<Vec<Vec3>> {
        if self.submitted == 0 || !self.is_idle() {
            return None;
        }
        self.shared.try_snapshot()
    }

    /// Copy finished positions into the rig's dynamic nodes, root-to-tip.
    /// Never waits: returns `Pending` if nothing has been submitted yet or the latest
    /// frame is still running.
    pub fn write_back(&self, skeleton: &mut Skeleton) -> Readback {
        if self.submitted == 0 {
            return Readback::Pending;
        }
        let Some(positions) = self.positions() else {
            log::trace!("readback skipped: generation {} still in flight", self.submitted);
            return Readback::Pending;
        };

        let mut bones = 0;
        for level in &self.layout.write_levels {
            for &(bone, node) in level {
                if skeleton.set_world_translation(node, positions[bone]) {
                    bones += 1;
                }
            }
            // intermediate nodes between joints
            skeleton.update_world_matrices();
        }
        Readback::Applied { bones }
    }

    /// Rebuild buffers for a new description. Frames already in flight finish on the old storage.
    pub fn reconfigure(&mut self, skeleton: &Skeleton, springs: &SpringBoneDesc) -> Result<(), SpringBoneError> {
        let mut buffers = PhysicsBuffers::for_description(skeleton, springs)?;
        buffers.set_settling_frames(self.settings().settling_frames);
        self.layout = RigLayout::of(&buffers);
        self.shared = Shared::new(buffers);
        self.submitted = 0;
        self.accumulator = 0.0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{load_from_yaml_str, SAMPLE_AVATAR_YAML};
    use crate::secondary::settings::StiffnessMode;

    fn sample() -> (Skeleton, SpringBoneDesc, SpringSettings) {
        let desc = load_from_yaml_str(SAMPLE_AVATAR_YAML).unwrap();
        let sk = Skeleton::from_desc(&desc).unwrap();
        (sk, desc.spring_bone, desc.physics)
    }

    impl SpringBoneSimulator {
        fn lock(&self) -> MutexGuard<'_, PhysicsBuffers> { self.shared.lock_buffers() }
    }

    fn immediate() -> Arc<ComputeContext> { Arc::new(ComputeContext::immediate().unwrap()) }

    fn sim(ctx: Arc<ComputeContext>, sk: &Skeleton, springs: &SpringBoneDesc, settings: SpringSettings) -> SpringBoneSimulator {
        SpringBoneSimulator::builder().context(ctx).settings(settings).build(sk, springs).unwrap()
    }

    #[test]
    fn build_requires_context() {
        let (sk, springs, _) = sample();
        let err = SpringBoneSimulator::builder().build(&sk, &springs).err();
        assert_eq!(err, Some(SpringBoneError::MissingContext));
    }

    #[test]
    fn build_rejects_bad_settings_and_counts() {
        let (sk, springs, settings) = sample();
        let err = SpringBoneSimulator::builder()
            .context(immediate())
            .settings(SpringSettings { substep_dt: 0.0, ..settings })
            .build(&sk, &springs)
            .err();
        assert!(matches!(err, Some(SpringBoneError::InvalidSettings(_))));

        let err = SpringBoneSimulator::builder()
            .context(immediate())
            .buffers(PhysicsBuffers::allocate(11, 2, 1))
            .build(&sk, &springs)
            .err();
        assert_eq!(err, Some(SpringBoneError::CountMismatch { what: "sphere collider", declared: 1, allocated: 2 }));

        let ok = SpringBoneSimulator::builder()
            .context(immediate())
            .buffers(PhysicsBuffers::allocate(11, 1, 1))
            .build(&sk, &springs);
        assert_eq!(ok.map(|s| s.bone_count()).ok(), Some(11));
    }

    #[test]
    fn accumulator_turns_time_into_bounded_substeps() {
        let (sk, springs, _) = sample();
        let settings = SpringSettings { substep_dt: 0.01, max_substeps: 4, ..Default::default() };
        let mut s = sim(immediate(), &sk, &springs, settings);
        assert_eq!(s.update(0.0, &sk), 0);
        assert_eq!(s.update(-1.0, &sk), 0);
        assert_eq!(s.update(f32::NAN, &sk), 0);
        assert_eq!(s.update(0.025, &sk), 2);
        assert_eq!(s.update(0.006, &sk), 1);
        assert_eq!(s.update(10.0, &sk), 4);
        // excess time was dropped, not carried
        assert_eq!(s.update(0.005, &sk), 0);
    }

    #[test]
    fn positions_stay_finite_for_hostile_time_steps() {
        let (mut sk, springs, settings) = sample();
        let mut s = sim(immediate(), &sk, &springs, settings);
        let hips = sk.find("hips").unwrap();
        let steps = [0.0, 1e-9, 1e-3, 1.0 / 60.0, 10.0, 1e6, f32::MAX, f32::INFINITY, f32::NAN, -1.0, 1.0 / 30.0];
        for (i, dt) in steps.iter().cycle().take(120).enumerate() {
            sk.set_local_translation(hips, Vec3::new((i as f32 * 0.3).sin() * 0.4, 1.0, 0.0));
            sk.update_world_matrices();
            s.update(*dt, &sk);
            let p = s.positions().unwrap();
            assert!(p.iter().all(|v| v.is_finite()), "non-finite after dt={dt}");
            s.write_back(&mut sk);
        }
    }

    #[test]
    fn kinematic_roots_match_animation_exactly() {
        let (mut sk, springs, settings) = sample();
        let mut s = sim(immediate(), &sk, &springs, settings);
        let hips = sk.find("hips").unwrap();
        let roots: Vec<usize> = ["hair_l0", "hair_r0", "ribbon0"].iter().map(|n| sk.find(n).unwrap()).collect();
        for frame in 0..30 {
            sk.set_local_translation(hips, Vec3::new(0.05 * frame as f32, 1.0, 0.02 * frame as f32));
            sk.update_world_matrices();
            s.update(1.0 / 60.0, &sk);
            let p = s.positions().unwrap();
            for (bone, &node) in [0, 4, 8].iter().zip(&roots) {
                assert_eq!(p[*bone], sk.world_translation(node));
            }
            s.write_back(&mut sk);
        }
    }

    #[test]
    fn write_back_places_dynamic_nodes_and_is_idempotent() {
        let (mut sk, springs, settings) = sample();
        let mut s = sim(immediate(), &sk, &springs, settings);
        assert_eq!(s.write_back(&mut sk), Readback::Pending);
        assert_eq!(s.positions(), None);

        let hair_root = sk.find("hair_l0").unwrap();
        let root_local = sk.node(hair_root).local;
        for _ in 0..20 {
            s.update(1.0 / 60.0, &sk);
        }
        assert_eq!(s.write_back(&mut sk), Readback::Applied { bones: 8 });
        let first: Vec<_> = sk.nodes().iter().map(|n| n.local).collect();
        assert_eq!(s.write_back(&mut sk), Readback::Applied { bones: 8 });
        let second: Vec<_> = sk.nodes().iter().map(|n| n.local).collect();
        assert_eq!(first, second);

        // kinematic roots are never written
        assert_eq!(sk.node(hair_root).local, root_local);
        let p = s.positions().unwrap();
        let tip = sk.find("hair_l3").unwrap();
        assert!((sk.world_translation(tip) - p[3]).length() < 1e-4);
    }

    #[test]
    fn rest_lengths_hold_across_frames() {
        let (mut sk, springs, settings) = sample();
        let mut s = sim(immediate(), &sk, &springs, SpringSettings { stiffness_mode: StiffnessMode::Compatible, ..settings });
        let rest: Vec<(usize, usize, f32)> = {
            let guard = s.lock();
            guard.params().iter().enumerate().filter_map(|(b, p)| p.parent().map(|parent| (b, parent, p.rest_length))).collect()
        };
        let head = sk.find("head").unwrap();
        for i in 0..90 {
            sk.set_local_rotation(head, glam::Quat::from_rotation_y((i as f32 * 0.2).sin()));
            sk.update_world_matrices();
            s.update(1.0 / 60.0, &sk);
            let p = s.positions().unwrap();
            for &(b, parent, len) in &rest {
                let d = (p[b] - p[parent]).length();
                // collision runs after the constraint, so allow a little slack here
                assert!((d - len).abs() <= len * 0.05, "bone {b}: {d} vs {len}");
            }
        }
    }

    #[test]
    fn threaded_updates_then_readback_never_block() {
        let (mut sk, springs, settings) = sample();
        let ctx = Arc::new(ComputeContext::threaded(2).unwrap());
        let mut s = sim(ctx, &sk, &springs, settings);
        for _ in 0..10 {
            s.update(1.0 / 60.0, &sk);
        }
        // may or may not be ready yet; either answer is fine
        let _ = s.write_back(&mut sk);
        s.flush();
        assert!(s.is_idle());
        assert_eq!(s.write_back(&mut sk), Readback::Applied { bones: 8 });
        assert!(s.positions().unwrap().iter().all(|p| p.is_finite()));
    }

    #[test]
    fn threaded_and_immediate_agree() {
        let (sk, springs, settings) = sample();
        let mut a = sim(immediate(), &sk, &springs, settings);
        let mut b = sim(Arc::new(ComputeContext::threaded(3).unwrap()), &sk, &springs, settings);
        for _ in 0..15 {
            a.update(1.0 / 60.0, &sk);
            b.update(1.0 / 60.0, &sk);
        }
        b.flush();
        assert_eq!(a.lock().state_bytes(), b.lock().state_bytes());
    }

    #[test]
    fn reconfigure_swaps_storage() {
        let (sk, springs, settings) = sample();
        let mut s = sim(immediate(), &sk, &springs, settings);
        s.update(1.0 / 30.0, &sk);
        let mut fewer = springs.clone();
        fewer.springs.truncate(1);
        s.reconfigure(&sk, &fewer).unwrap();
        assert_eq!(s.bone_count(), 4);
        assert!(s.is_idle());
        assert_eq!(s.positions(), None);
        s.update(1.0 / 30.0, &sk);
        assert_eq!(s.positions().map(|p| p.len()), Some(4));
    }
}
