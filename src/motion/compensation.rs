// src/motion/compensation.rs - Per-segment corrections between logical and motor position
use crate::config::{BacklashConfig, CurrentTierConfig, MotionConfig};
use crate::geometry::{Axis, Vector};

use super::calibration::BedCalibration;
use super::CurrentTier;

const DIRECTION_EPSILON: f32 = 1e-6;

/// A correction that depends only on where the head logically is.
pub trait Compensation: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;
    /// Offset added to the motor target for `logical`.
    fn offset(&self, calibration: &BedCalibration, logical: &Vector) -> Vector;
}

/// Follows the fitted bed plane in Z.
#[derive(Debug, Clone, Copy, Default)]
pub struct BedLevelCompensation;

impl Compensation for BedLevelCompensation {
    fn name(&self) -> &'static str {
        "bed-leveling"
    }

    fn offset(&self, calibration: &BedCalibration, logical: &Vector) -> Vector {
        Vector::point(0.0, 0.0, calibration.height_at(logical.x, logical.y))
    }
}

/// Shifts X and Y in proportion to height to square a leaning gantry.
#[derive(Debug, Clone, Copy, Default)]
pub struct SkewCompensation;

impl Compensation for SkewCompensation {
    fn name(&self) -> &'static str {
        "skew"
    }

    fn offset(&self, calibration: &BedCalibration, logical: &Vector) -> Vector {
        let (skew_x, skew_y) = calibration.skew();
        Vector::point(skew_x * logical.z, skew_y * logical.z, 0.0)
    }
}

/// Position-dependent corrections enabled in `config`, in application order.
pub fn pipeline(config: &MotionConfig) -> Vec<Box<dyn Compensation>> {
    let mut stages: Vec<Box<dyn Compensation>> = Vec::new();
    if config.bed_leveling.enabled {
        stages.push(Box::new(BedLevelCompensation));
    }
    if config.skew.enabled {
        stages.push(Box::new(SkewCompensation));
    }
    for stage in &stages {
        tracing::info!("Enabled {} compensation", stage.name());
    }
    stages
}

/// Takes up mechanical slack on X and Y when an axis reverses.
///
/// The accumulated offset is part of every motor target, so after a reversal the
/// motors stay shifted by the slack until the axis reverses back.
#[derive(Debug, Clone)]
pub struct BacklashCompensator {
    enabled: bool,
    amount: [f32; 2],
    feedrate: f32,
    /// -1, 0 (unknown) or 1 per axis
    last_direction: [i8; 2],
    offset: [f32; 2],
}

impl BacklashCompensator {
    pub fn new(config: &BacklashConfig) -> Self {
        Self {
            enabled: config.enabled,
            amount: [config.x, config.y],
            feedrate: config.feedrate,
            last_direction: [0; 2],
            offset: [0.0; 2],
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// mm/min for the pre-travel moves.
    pub fn feedrate(&self) -> f32 {
        self.feedrate
    }

    pub fn offset(&self) -> Vector {
        Vector::point(self.offset[0], self.offset[1], 0.0)
    }

    /// Record the direction of the next segment's logical `delta`. Returns the
    /// pre-travel to run first when X or Y reverses.
    pub fn prepare(&mut self, delta: &Vector) -> Option<Vector> {
        if !self.enabled {
            return None;
        }
        let mut pre_travel = Vector::ZERO;
        let mut reversed = false;
        for (i, axis) in [Axis::X, Axis::Y].into_iter().enumerate() {
            let direction = if delta[axis] > DIRECTION_EPSILON {
                1
            } else if delta[axis] < -DIRECTION_EPSILON {
                -1
            } else {
                continue;
            };
            if self.last_direction[i] != 0 && self.last_direction[i] != direction {
                let travel = f32::from(direction) * self.amount[i];
                self.offset[i] += travel;
                pre_travel[axis] = travel;
                reversed = true;
            }
            self.last_direction[i] = direction;
        }
        reversed.then_some(pre_travel)
    }

    /// Forget direction history, e.g. after homing.
    pub fn reset(&mut self) {
        self.last_direction = [0; 2];
        self.offset = [0.0; 2];
    }
}

/// Picks the drive current from the Z height band.
#[derive(Debug, Clone)]
pub struct CurrentTiering {
    enabled: bool,
    medium_height: f32,
    high_height: f32,
    active: Option<CurrentTier>,
}

impl CurrentTiering {
    pub fn new(config: &CurrentTierConfig) -> Self {
        Self {
            enabled: config.enabled,
            medium_height: config.medium_height,
            high_height: config.high_height,
            active: None,
        }
    }

    pub fn tier_for(&self, z: f32) -> CurrentTier {
        if !self.enabled {
            CurrentTier::High
        } else if z < self.medium_height {
            CurrentTier::Low
        } else if z < self.high_height {
            CurrentTier::Medium
        } else {
            CurrentTier::High
        }
    }

    /// The tier to switch to for height `z`, or `None` if it is already active.
    pub fn update(&mut self, z: f32) -> Option<CurrentTier> {
        let tier = self.tier_for(z);
        if self.active == Some(tier) {
            return None;
        }
        self.active = Some(tier);
        Some(tier)
    }

    pub fn active(&self) -> Option<CurrentTier> {
        self.active
    }

    /// The drivers lost their setting, e.g. because they were disabled.
    pub fn reset(&mut self) {
        self.active = None;
    }
}
