use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

use crate::secondary::settings::SpringSettings;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvatarDesc {
    pub id: String,
    pub nodes: Vec<NodeDesc>,
    #[serde(default)]
    pub spring_bone: SpringBoneDesc,
    #[serde(default)]
    pub physics: SpringSettings,
}

/// One scene node. Nodes may be listed in any order; parents are resolved by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDesc {
    pub name: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub translation: Vec3,
    #[serde(default = "identity_rotation")]
    pub rotation: Quat,
    #[serde(default = "unit_scale")]
    pub scale: Vec3,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpringBoneDesc {
    pub colliders: Vec<ColliderDesc>,
    pub collider_groups: Vec<ColliderGroupDesc>,
    pub springs: Vec<SpringDesc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColliderDesc {
    pub node: String,
    pub shape: ColliderShape,
}

/// Collider primitive in the owning node's local space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ColliderShape {
    Sphere {
        #[serde(default)]
        offset: Vec3,
        radius: f32,
    },
    Capsule {
        #[serde(default)]
        offset: Vec3,
        tail: Vec3,
        radius: f32,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColliderGroupDesc {
    pub name: String,
    /// Indices into `SpringBoneDesc::colliders`.
    pub colliders: Vec<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpringDesc {
    pub name: String,
    /// Root first. The first joint follows animation, the rest are simulated.
    pub joints: Vec<JointDesc>,
    /// Indices into `SpringBoneDesc::collider_groups`.
    #[serde(default)]
    pub collider_groups: Vec<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JointDesc {
    pub node: String,
    #[serde(default = "default_hit_radius")]
    pub hit_radius: f32,
    #[serde(default = "default_stiffness")]
    pub stiffness: f32,
    #[serde(default = "default_drag")]
    pub drag: f32,
    #[serde(default)]
    pub gravity_power: f32,
    #[serde(default = "default_gravity_dir")]
    pub gravity_dir: Vec3,
}

fn identity_rotation() -> Quat { Quat::IDENTITY }
fn unit_scale() -> Vec3 { Vec3::ONE }
fn default_hit_radius() -> f32 { 0.02 }
fn default_stiffness() -> f32 { 1.0 }
fn default_drag() -> f32 { 0.4 }
fn default_gravity_dir() -> Vec3 { Vec3::NEG_Y }
