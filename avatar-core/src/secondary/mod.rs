//! Secondary motion: substepped Verlet spring-bone chains with sphere/capsule collision.
//!
//! Layout, leaves first:
//! - `topology`: flat per-bone and per-collider parameter tables built from a rig + description.
//! - `buffers`: the per-instance state arrays (positions, params, collider world shapes).
//! - `kernels`: pure per-element stage functions.
//! - `pipeline`: one frame of substeps, each running kinematic → predict → constrain → collide
//!   with a barrier between stages.
//! - `orchestrator`: fixed-step accumulator, asynchronous submission and non-blocking readback.

pub mod buffers;
pub mod kernels;
pub mod orchestrator;
pub mod pipeline;
pub mod settings;
pub mod topology;

use thiserror::Error;

pub use buffers::PhysicsBuffers;
pub use orchestrator::{Readback, SimulatorBuilder, SpringBoneSimulator};
pub use settings::{SpringSettings, StiffnessMode, Wind};
pub use topology::Topology;

/// Setup-time failures. Runtime conditions (odd time steps, degenerate geometry,
/// readback not ready) are handled locally and never reported through this type.
#[derive(Debug, Error, PartialEq)]
pub enum SpringBoneError {
    #[error("{what} count mismatch: description declares {declared}, buffers hold {allocated}")]
    CountMismatch { what: &'static str, declared: usize, allocated: usize },
    #[error("no compute context supplied")]
    MissingContext,
    #[error("chain '{chain}' references unknown node '{node}'")]
    UnknownNode { chain: String, node: String },
    #[error("chain '{chain}': '{child}' is not a descendant of '{parent}'")]
    BrokenChain { chain: String, parent: String, child: String },
    #[error("chain '{0}' has no joints")]
    EmptyChain(String),
    #[error("chain '{chain}' references collider group {group}, only {len} defined")]
    ColliderGroupOutOfRange { chain: String, group: usize, len: usize },
    #[error("collider group '{group}' references collider {collider}, only {len} defined")]
    ColliderOutOfRange { group: String, collider: usize, len: usize },
    #[error("collider {index} is attached to unknown node '{node}'")]
    UnknownColliderNode { index: usize, node: String },
    #[error("invalid spring settings: {0}")]
    InvalidSettings(String),
}
