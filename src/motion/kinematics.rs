// src/motion/kinematics.rs
use crate::geometry::{Axis, Vector};

use super::MotionError;

/// Physical travel limits of a Cartesian machine.
#[derive(Debug, Clone, PartialEq)]
pub struct TravelEnvelope {
    /// `[min, max]` for X, Y, Z
    limits: [[f32; 2]; 3],
}

impl TravelEnvelope {
    pub fn new(limits: [[f32; 2]; 3]) -> Self {
        Self { limits }
    }

    pub fn limits(&self, axis: Axis) -> Option<[f32; 2]> {
        self.limits.get(axis.index()).copied()
    }

    pub fn contains(&self, axis: Axis, value: f32) -> bool {
        match self.limits(axis) {
            Some([min, max]) => value.is_finite() && value >= min && value <= max,
            // The extruder is unbounded.
            None => value.is_finite(),
        }
    }

    /// Check the spatial axes of `target` selected by `axes`.
    pub fn check(&self, target: &Vector, axes: &[Axis]) -> Result<(), MotionError> {
        for &axis in axes {
            if !self.contains(axis, target[axis]) {
                return Err(MotionError::out_of_range(axis, target[axis]));
            }
        }
        Ok(())
    }
}
