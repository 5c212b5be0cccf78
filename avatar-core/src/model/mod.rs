//! Avatar descriptions: node hierarchy, spring chains, colliders and physics settings.

pub mod schema;

use anyhow::{Context, Result};
use schema::AvatarDesc;

/// Sample avatar shipped with the crate (two hair tails and a ribbon).
pub const SAMPLE_AVATAR_YAML: &str = include_str!("../../assets/twin_tails.yaml");

pub fn load_from_yaml_str(s: &str) -> Result<AvatarDesc> {
    let desc: AvatarDesc = serde_yaml::from_str(s)?;
    Ok(desc)
}

pub fn load_from_json_str(s: &str) -> Result<AvatarDesc> {
    let desc: AvatarDesc = serde_json::from_str(s)?;
    Ok(desc)
}

/// Load a description from disk. `.json` files go through serde_json, everything else is YAML.
pub fn load_from_path<P: AsRef<std::path::Path>>(path: P) -> Result<AvatarDesc> {
    let path = path.as_ref();
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("reading avatar description {}", path.display()))?;
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if is_json {
        load_from_json_str(&data)
    } else {
        load_from_yaml_str(&data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schema::ColliderShape;

    #[test]
    fn sample_avatar_parses() {
        let desc = load_from_yaml_str(SAMPLE_AVATAR_YAML).unwrap();
        assert_eq!(desc.id, "twin_tails");
        assert_eq!(desc.spring_bone.springs.len(), 3);
        assert_eq!(desc.spring_bone.colliders.len(), 2);
        assert!(matches!(desc.spring_bone.colliders[0].shape, ColliderShape::Sphere { .. }));
        assert!(matches!(desc.spring_bone.colliders[1].shape, ColliderShape::Capsule { .. }));
        assert!(desc.physics.substep_dt > 0.0);
    }

    #[test]
    fn joint_defaults_fill_missing_fields() {
        let yaml = r#"
id: bare
nodes:
  - name: root
  - name: tip
    parent: root
    translation: [0.0, -1.0, 0.0]
spring_bone:
  springs:
    - name: chain
      joints:
        - node: root
        - node: tip
"#;
        let desc = load_from_yaml_str(yaml).unwrap();
        let joint = &desc.spring_bone.springs[0].joints[1];
        assert_eq!(joint.stiffness, 1.0);
        assert_eq!(joint.drag, 0.4);
        assert_eq!(joint.gravity_power, 0.0);
        assert_eq!(joint.gravity_dir, glam::Vec3::NEG_Y);
        assert!(desc.spring_bone.colliders.is_empty());
        assert_eq!(desc.nodes[0].scale, glam::Vec3::ONE);
    }

    #[test]
    fn json_round_trips_through_loader() {
        let desc = load_from_yaml_str(SAMPLE_AVATAR_YAML).unwrap();
        let json = serde_json::to_string(&desc).unwrap();
        let back = load_from_json_str(&json).unwrap();
        assert_eq!(back.nodes.len(), desc.nodes.len());
        assert_eq!(back.spring_bone.springs[0].joints.len(), desc.spring_bone.springs[0].joints.len());
    }
}
