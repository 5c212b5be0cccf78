use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use avatar_core::compute::ComputeContext;
use avatar_core::model::{self, schema::ColliderShape};
use avatar_core::rig::Skeleton;
use avatar_core::secondary::{Readback, SpringBoneSimulator, StiffnessMode};
use avatar_core::VERSION;
use clap::{Parser, Subcommand, ValueEnum};
use glam::Vec3;
use serde::Serialize;

mod plot;

#[derive(Parser, Debug)]
#[command(name = "avatar", version = VERSION, about = "Spring-bone secondary motion tools")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load an avatar description and list its rig, chains and colliders
    Inspect { path: PathBuf },
    /// Sway the avatar's root and run the spring bones for a number of frames
    Simulate {
        path: PathBuf,
        #[arg(long, default_value_t = 120)]
        frames: u32,
        /// Frame time in seconds
        #[arg(long, default_value_t = 1.0 / 60.0)]
        dt: f32,
        /// Side-to-side sway amplitude of the root, in world units
        #[arg(long, default_value_t = 0.2)]
        sway: f32,
        /// Sway frequency in Hz
        #[arg(long, default_value_t = 0.8)]
        sway_hz: f32,
        /// Fan-out worker threads (0 = all cores)
        #[arg(long, default_value_t = 0)]
        threads: usize,
        /// Run every frame inline on the calling thread
        #[arg(long)]
        immediate: bool,
        #[arg(long, value_enum)]
        stiffness: Option<Stiffness>,
        /// Override the settling grace period from the file
        #[arg(long)]
        settle: Option<u32>,
        /// Write every read-back frame's positions as JSON
        #[arg(long)]
        json: Option<PathBuf>,
        /// Write a side-view (X/Y) trace of chain tips as PNG
        #[arg(long)]
        plot: Option<PathBuf>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Stiffness {
    Compatible,
    Decoupled,
}

impl From<Stiffness> for StiffnessMode {
    fn from(s: Stiffness) -> Self {
        match s {
            Stiffness::Compatible => StiffnessMode::Compatible,
            Stiffness::Decoupled => StiffnessMode::Decoupled,
        }
    }
}

#[derive(Serialize)]
struct Trace {
    avatar: String,
    dt: f32,
    substep_dt: f32,
    chains: Vec<String>,
    frames: Vec<FrameRecord>,
}

#[derive(Serialize)]
struct FrameRecord {
    frame: u32,
    time: f32,
    substeps: u32,
    /// World position of each chain's tip, in chain order.
    tips: Vec<[f32; 3]>,
    /// Every simulated bone, in chain order.
    bones: Vec<[f32; 3]>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    match cli.cmd {
        Command::Inspect { path } => inspect(&path)?,
        Command::Simulate { path, frames, dt, sway, sway_hz, threads, immediate, stiffness, settle, json, plot } => {
            let opts = SimOptions { frames, dt, sway, sway_hz, threads, immediate, stiffness, settle };
            let trace = simulate(&path, &opts)?;
            if let Some(out) = json {
                let file = std::fs::File::create(&out).with_context(|| format!("creating {}", out.display()))?;
                serde_json::to_writer_pretty(std::io::BufWriter::new(file), &trace)?;
                println!("Wrote {} frames to {}", trace.frames.len(), out.display());
            }
            if let Some(out) = plot {
                let tips: Vec<Vec<Vec3>> = (0..trace.chains.len())
                    .map(|c| trace.frames.iter().map(|f| Vec3::from_array(f.tips[c])).collect())
                    .collect();
                plot::side_view(&tips, 512, 512)
                    .save(&out)
                    .with_context(|| format!("writing {}", out.display()))?;
                println!("Wrote tip trace to {}", out.display());
            }
        }
    }
    Ok(())
}

fn inspect(path: &Path) -> Result<()> {
    let desc = model::load_from_path(path)?;
    let skeleton = Skeleton::from_desc(&desc)?;
    println!("Loaded avatar: {}", desc.id);
    println!("  nodes: {}", skeleton.len());
    for node in skeleton.nodes() {
        let parent = node.parent.map(|p| skeleton.node(p).name.as_str()).unwrap_or("-");
        println!("    {:<12} parent={:<12} local={:?}", node.name, parent, node.local.translation.to_array());
    }
    let sb = &desc.spring_bone;
    println!("  colliders: {}", sb.colliders.len());
    for (i, c) in sb.colliders.iter().enumerate() {
        match c.shape {
            ColliderShape::Sphere { offset, radius } => {
                println!("    [{i}] sphere on {} offset={:?} r={radius:.3}", c.node, offset.to_array())
            }
            ColliderShape::Capsule { offset, tail, radius } => println!(
                "    [{i}] capsule on {} {:?} -> {:?} r={radius:.3}",
                c.node,
                offset.to_array(),
                tail.to_array()
            ),
        }
    }
    println!("  collider groups: {}", sb.collider_groups.len());
    for (i, g) in sb.collider_groups.iter().enumerate() {
        println!("    [{i}] {} -> colliders {:?}", g.name, g.colliders);
    }
    println!("  chains: {}", sb.springs.len());
    for s in &sb.springs {
        let joints: Vec<&str> = s.joints.iter().map(|j| j.node.as_str()).collect();
        println!("    {} ({} joints, groups {:?}): {}", s.name, joints.len(), s.collider_groups, joints.join(" -> "));
    }
    let p = &desc.physics;
    println!(
        "  physics: substep={:.5}s max_substeps={} settle={} stiffness={:?} wind amp={:.2} hz={:.2}",
        p.substep_dt, p.max_substeps, p.settling_frames, p.stiffness_mode, p.wind.amplitude, p.wind.frequency
    );
    Ok(())
}

struct SimOptions {
    frames: u32,
    dt: f32,
    sway: f32,
    sway_hz: f32,
    threads: usize,
    immediate: bool,
    stiffness: Option<Stiffness>,
    settle: Option<u32>,
}

fn simulate(path: &Path, opts: &SimOptions) -> Result<Trace> {
    let desc = model::load_from_path(path)?;
    let mut skeleton = Skeleton::from_desc(&desc)?;

    let mut settings = desc.physics;
    if let Some(s) = opts.stiffness {
        settings.stiffness_mode = s.into();
    }
    if let Some(frames) = opts.settle {
        settings.settling_frames = frames;
    }

    let context = if opts.immediate {
        ComputeContext::immediate()?
    } else {
        ComputeContext::threaded(opts.threads)?
    };
    log::info!("compute context: {} ({} fan-out workers)", context.label(), context.workers());
    let mut sim = SpringBoneSimulator::builder()
        .context(Arc::new(context))
        .settings(settings)
        .build(&skeleton, &desc.spring_bone)?;

    let root = skeleton
        .nodes()
        .iter()
        .position(|n| n.parent.is_none())
        .context("avatar has no root node")?;
    let rest = skeleton.node(root).local.translation;
    let tips: Vec<usize> = desc
        .spring_bone
        .springs
        .iter()
        .filter_map(|s| s.joints.last())
        .map(|j| skeleton.find(&j.node).with_context(|| format!("unknown tip node '{}'", j.node)))
        .collect::<Result<_>>()?;

    let mut trace = Trace {
        avatar: desc.id.clone(),
        dt: opts.dt,
        substep_dt: settings.substep_dt,
        chains: desc.spring_bone.springs.iter().map(|s| s.name.clone()).collect(),
        frames: Vec::new(),
    };
    let mut pending = 0u32;
    let mut time = 0.0f32;
    for frame in 0..opts.frames {
        time += opts.dt;
        let offset = opts.sway * (std::f32::consts::TAU * opts.sway_hz * time).sin();
        skeleton.set_local_translation(root, rest + Vec3::new(offset, 0.0, 0.0));
        skeleton.update_world_matrices();

        let substeps = sim.update(opts.dt, &skeleton);
        match sim.write_back(&mut skeleton) {
            Readback::Applied { .. } => {
                let bones = sim.positions().unwrap_or_default();
                trace.frames.push(FrameRecord {
                    frame,
                    time,
                    substeps,
                    tips: tips.iter().map(|&n| skeleton.world_translation(n).to_array()).collect(),
                    bones: bones.iter().map(|p| p.to_array()).collect(),
                });
            }
            Readback::Pending => pending += 1,
        }
    }

    sim.flush();
    if let Readback::Applied { bones } = sim.write_back(&mut skeleton) {
        log::debug!("final readback wrote {bones} bones");
    }
    println!(
        "Simulated {} frames of '{}' ({} read back, {} pending)",
        opts.frames,
        desc.id,
        trace.frames.len(),
        pending
    );
    for (name, &tip) in trace.chains.iter().zip(&tips) {
        let p = skeleton.world_translation(tip);
        println!("  {:<12} tip = ({:+.4}, {:+.4}, {:+.4})", name, p.x, p.y, p.z);
    }
    Ok(trace)
}
