//! Rigging foundations: the shared scene graph that animation writes into and
//! spring-bone readback writes back into.

use std::collections::{HashMap, HashSet};

use glam::{Mat4, Quat, Vec3};
use thiserror::Error;

use crate::model::schema::{AvatarDesc, NodeDesc};

#[derive(Debug, Error, PartialEq)]
pub enum RigError {
    #[error("node '{node}' references unknown parent '{parent}'")]
    UnknownParent { node: String, parent: String },
    #[error("duplicate node name '{0}'")]
    DuplicateNode(String),
    #[error("node hierarchy contains a cycle through '{0}'")]
    Cycle(String),
    #[error("parent index {parent} is not an existing node")]
    ParentOutOfRange { parent: usize },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub translation: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self { translation: Vec3::ZERO, rotation: Quat::IDENTITY, scale: Vec3::ONE }
    }
}

impl Transform {
    pub fn from_translation(translation: Vec3) -> Self {
        Self { translation, ..Default::default() }
    }

    pub fn matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.translation)
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub parent: Option<usize>,
    pub local: Transform,
    world: Mat4,
}

impl Node {
    pub fn world_matrix(&self) -> Mat4 { self.world }
}

/// Node hierarchy stored parent-before-child, so a single forward pass refreshes world matrices.
#[derive(Debug, Clone, Default)]
pub struct Skeleton {
    nodes: Vec<Node>,
    by_name: HashMap<String, usize>,
}

impl Skeleton {
    pub fn new() -> Self { Self::default() }

    /// Build from a description and compute world matrices. The result is the bind pose.
    pub fn from_desc(desc: &AvatarDesc) -> Result<Self, RigError> {
        let mut skeleton = Self::new();
        let mut pending: Vec<&NodeDesc> = desc.nodes.iter().collect();
        let declared: HashSet<&str> = desc.nodes.iter().map(|n| n.name.as_str()).collect();

        for n in &desc.nodes {
            if let Some(p) = &n.parent {
                if !declared.contains(p.as_str()) {
                    return Err(RigError::UnknownParent { node: n.name.clone(), parent: p.clone() });
                }
            }
        }

        while !pending.is_empty() {
            let before = pending.len();
            let mut rest = Vec::with_capacity(pending.len());
            for n in pending {
                let parent = match &n.parent {
                    None => None,
                    Some(p) => match skeleton.find(p) {
                        Some(idx) => Some(idx),
                        None => {
                            rest.push(n);
                            continue;
                        }
                    },
                };
                let local = Transform { translation: n.translation, rotation: n.rotation, scale: n.scale };
                skeleton.add_node(&n.name, parent, local)?;
            }
            if rest.len() == before {
                return Err(RigError::Cycle(rest[0].name.clone()));
            }
            pending = rest;
        }

        skeleton.update_world_matrices();
        Ok(skeleton)
    }

    /// Append a node. The parent must already exist, which keeps the storage topologically ordered.
    pub fn add_node(&mut self, name: &str, parent: Option<usize>, local: Transform) -> Result<usize, RigError> {
        if self.by_name.contains_key(name) {
            return Err(RigError::DuplicateNode(name.to_string()));
        }
        if let Some(p) = parent {
            if p >= self.nodes.len() {
                return Err(RigError::ParentOutOfRange { parent: p });
            }
        }
        let idx = self.nodes.len();
        let parent_world = parent.map(|p| self.nodes[p].world).unwrap_or(Mat4::IDENTITY);
        self.nodes.push(Node { name: name.to_string(), parent, local, world: parent_world * local.matrix() });
        self.by_name.insert(name.to_string(), idx);
        Ok(idx)
    }

    pub fn len(&self) -> usize { self.nodes.len() }
    pub fn is_empty(&self) -> bool { self.nodes.is_empty() }
    pub fn nodes(&self) -> &[Node] { &self.nodes }
    pub fn node(&self, idx: usize) -> &Node { &self.nodes[idx] }
    pub fn find(&self, name: &str) -> Option<usize> { self.by_name.get(name).copied() }

    pub fn set_local_translation(&mut self, idx: usize, translation: Vec3) {
        self.nodes[idx].local.translation = translation;
    }

    pub fn set_local_rotation(&mut self, idx: usize, rotation: Quat) {
        self.nodes[idx].local.rotation = rotation;
    }

    pub fn update_world_matrices(&mut self) {
        for i in 0..self.nodes.len() {
            self.refresh_world(i);
        }
    }

    fn refresh_world(&mut self, idx: usize) {
        let parent_world = self.parent_world_matrix(idx);
        let node = &mut self.nodes[idx];
        node.world = parent_world * node.local.matrix();
    }

    pub fn world_matrix(&self, idx: usize) -> Mat4 { self.nodes[idx].world }

    pub fn parent_world_matrix(&self, idx: usize) -> Mat4 {
        self.nodes[idx].parent.map(|p| self.nodes[p].world).unwrap_or(Mat4::IDENTITY)
    }

    pub fn world_translation(&self, idx: usize) -> Vec3 {
        self.nodes[idx].world.w_axis.truncate()
    }

    pub fn world_rotation(&self, idx: usize) -> Quat {
        let (_, rotation, _) = self.nodes[idx].world.to_scale_rotation_translation();
        rotation
    }

    /// Place a node at a world position by rewriting its parent-local translation.
    /// Only this node's cached world matrix is refreshed; descendants need `update_world_matrices`.
    /// Returns false and leaves the node untouched when no finite local translation exists
    /// (non-finite target or a degenerate parent).
    pub fn set_world_translation(&mut self, idx: usize, world: Vec3) -> bool {
        let local = self.parent_world_matrix(idx).inverse().transform_point3(world);
        if !local.is_finite() {
            return false;
        }
        self.nodes[idx].local.translation = local;
        self.refresh_world(idx);
        true
    }

    /// True when `ancestor` lies on the parent path of `node` (a node is not its own ancestor).
    pub fn is_ancestor(&self, ancestor: usize, node: usize) -> bool {
        let mut cur = self.nodes[node].parent;
        while let Some(p) = cur {
            if p == ancestor {
                return true;
            }
            cur = self.nodes[p].parent;
        }
        false
    }
}
