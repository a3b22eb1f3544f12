// src/motion/mod.rs - Compensated motion, homing and bed calibration
pub mod calibration;
pub mod compensation;
pub mod controller;
pub mod kinematics;
pub mod stepper;

use thiserror::Error;

use crate::geometry::Axis;
use crate::hardware::HardwareError;

pub use calibration::{BedCalibration, PositionRecord, ProbePoint};
pub use compensation::{BacklashCompensator, BedLevelCompensation, Compensation, CurrentTiering, SkewCompensation};
pub use controller::{MotionController, MoveTarget};
pub use kinematics::TravelEnvelope;
pub use stepper::{StepGenerator, StepSegment};

#[derive(Debug, Error)]
pub enum MotionError {
    #[error("Move out of range: {axis} {value}")]
    OutOfRange { axis: char, value: f32 },
    #[error("Accelerometer not working")]
    SensorNotWorking,
    #[error("Homing failed: travel limit reached without contact")]
    HomingOutOfRange,
    #[error("Bed calibration requires homed X and Y")]
    NotHomed,
    #[error("Probe out of range at {0}")]
    ProbeOutOfRange(ProbePoint),
    #[error("Bed calibration produced a degenerate plane")]
    DegenerateFit,
    #[error("Motion aborted")]
    Aborted,
    #[error(transparent)]
    Hardware(#[from] HardwareError),
}

impl MotionError {
    pub fn out_of_range(axis: Axis, value: f32) -> Self {
        MotionError::OutOfRange { axis: axis.letter(), value }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionState {
    Idle,
    Homing,
    Calibrating,
    Moving,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Positioning {
    Absolute,
    Relative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Units {
    Millimeters,
    Inches,
}

impl Units {
    pub fn to_mm(self, value: f32) -> f32 {
        match self {
            Units::Millimeters => value,
            Units::Inches => value * 25.4,
        }
    }
}

/// Motor drive current level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CurrentTier {
    Low,
    Medium,
    High,
}
