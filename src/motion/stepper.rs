// src/motion/stepper.rs - Millimeter targets to integer motor steps
use std::time::Duration;

use crate::geometry::{Axis, Vector};

/// One block of motor motion handed to the driver.
#[derive(Debug, Clone, PartialEq)]
pub struct StepSegment {
    /// Signed step count per motor (X, Y, Z, E), direction inversion already applied.
    pub steps: [i64; 4],
    pub duration: Duration,
}

impl StepSegment {
    pub fn is_empty(&self) -> bool {
        self.steps.iter().all(|&s| s == 0)
    }

    pub fn steps(&self, axis: Axis) -> i64 {
        self.steps[axis.index()]
    }

    /// True when the motor turns in its positive direction.
    pub fn direction(&self, axis: Axis) -> bool {
        self.steps[axis.index()] >= 0
    }
}

#[derive(Debug, Clone)]
pub struct StepGenerator {
    steps_per_mm: [f32; 4],
    direction_invert: [bool; 4],
    current_steps: [i64; 4],
}

impl StepGenerator {
    pub fn new(steps_per_mm: [f32; 4], direction_invert: [bool; 4]) -> Self {
        Self {
            steps_per_mm,
            direction_invert,
            current_steps: [0; 4],
        }
    }

    pub fn steps_per_mm(&self) -> [f32; 4] {
        self.steps_per_mm
    }

    /// Motor position in millimeters, quantised to whole steps.
    pub fn position(&self) -> Vector {
        let mut position = Vector::ZERO;
        for axis in Axis::ALL {
            let i = axis.index();
            position[axis] = self.current_steps[i] as f32 / self.steps_per_mm[i];
        }
        position
    }

    /// Declare the motors to be at `position` without moving them.
    pub fn set_position(&mut self, position: &Vector) {
        for axis in Axis::ALL {
            self.current_steps[axis.index()] = self.to_steps(axis, position[axis]);
        }
    }

    pub fn set_axis(&mut self, axis: Axis, value: f32) {
        self.current_steps[axis.index()] = self.to_steps(axis, value);
    }

    fn to_steps(&self, axis: Axis, mm: f32) -> i64 {
        (mm * self.steps_per_mm[axis.index()]).round() as i64
    }

    /// Steps needed to reach `target` (motor millimeters) in `duration`. The target
    /// becomes the new reference position.
    pub fn step_to(&mut self, target: &Vector, duration: Duration) -> StepSegment {
        let mut steps = [0i64; 4];
        for axis in Axis::ALL {
            let i = axis.index();
            let target_steps = self.to_steps(axis, target[axis]);
            let delta = target_steps.saturating_sub(self.current_steps[i]);
            self.current_steps[i] = target_steps;
            steps[i] = if self.direction_invert[i] { delta.saturating_neg() } else { delta };
        }
        StepSegment { steps, duration }
    }
}
