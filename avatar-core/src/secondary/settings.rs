use glam::Vec3;
use serde::{Deserialize, Serialize};

use super::SpringBoneError;

/// How the per-joint stiffness pull enters the Verlet step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StiffnessMode {
    /// Pull is folded into the predicted position and becomes part of the next step's
    /// velocity, where drag eats into it. Chains may come to rest away from their bind pose.
    Compatible,
    /// Pull is applied after integration to both current and previous positions:
    /// a positional correction that carries no velocity and is not attenuated by drag.
    #[default]
    Decoupled,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Wind {
    pub direction: Vec3,
    /// Acceleration amplitude in units/s².
    pub amplitude: f32,
    /// Hz.
    pub frequency: f32,
    /// Radians.
    pub phase: f32,
}

impl Default for Wind {
    fn default() -> Self {
        Self { direction: Vec3::X, amplitude: 0.0, frequency: 0.5, phase: 0.0 }
    }
}

/// Global spring-bone parameters shared by every chain of one simulator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpringSettings {
    /// World gravity added on top of each joint's own gravity.
    pub gravity: Vec3,
    /// Fixed substep duration in seconds.
    pub substep_dt: f32,
    /// Upper bound on substeps per `update`; excess elapsed time is dropped.
    pub max_substeps: u32,
    pub wind: Wind,
    /// Frames after populate during which velocity is discarded every substep.
    pub settling_frames: u32,
    pub stiffness_mode: StiffnessMode,
}

impl Default for SpringSettings {
    fn default() -> Self {
        Self {
            gravity: Vec3::ZERO,
            substep_dt: 1.0 / 120.0,
            max_substeps: 8,
            wind: Wind::default(),
            settling_frames: 0,
            stiffness_mode: StiffnessMode::Decoupled,
        }
    }
}

impl SpringSettings {
    pub fn validate(&self) -> Result<(), SpringBoneError> {
        if !self.substep_dt.is_finite() || self.substep_dt <= 0.0 {
            return Err(SpringBoneError::InvalidSettings(format!(
                "substep_dt must be a positive finite number, got {}",
                self.substep_dt
            )));
        }
        if self.max_substeps == 0 {
            return Err(SpringBoneError::InvalidSettings("max_substeps must be at least 1".into()));
        }
        if !self.gravity.is_finite() || !self.wind.direction.is_finite() {
            return Err(SpringBoneError::InvalidSettings("gravity and wind direction must be finite".into()));
        }
        if !self.wind.amplitude.is_finite() || !self.wind.frequency.is_finite() || !self.wind.phase.is_finite() {
            return Err(SpringBoneError::InvalidSettings("wind parameters must be finite".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(SpringSettings::default().validate().is_ok());
    }

    #[test]
    fn rejects_degenerate_substeps() {
        let s = SpringSettings { substep_dt: 0.0, ..Default::default() };
        assert!(matches!(s.validate(), Err(SpringBoneError::InvalidSettings(_))));
        let s = SpringSettings { substep_dt: f32::NAN, ..Default::default() };
        assert!(s.validate().is_err());
        let s = SpringSettings { max_substeps: 0, ..Default::default() };
        assert!(s.validate().is_err());
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let s: SpringSettings = serde_yaml::from_str("max_substeps: 3\nstiffness_mode: compatible\n").unwrap();
        assert_eq!(s.max_substeps, 3);
        assert_eq!(s.stiffness_mode, StiffnessMode::Compatible);
        assert_eq!(s.substep_dt, SpringSettings::default().substep_dt);
        assert_eq!(s.wind, Wind::default());
    }
}
