//! Persisted bed model: probe heights, fitted plane and gantry skew.
//!
//! Heights are measured relative to the center contact, which is also the Z
//! reference. The plane is refitted from the stored heights on load, so the image
//! only holds raw measurements and the two skew coefficients.

use std::fmt;

use crate::config::CalibrationConfig;
use crate::geometry::{Plane, Vector};
use crate::hardware::storage::{layout, Storage, StorageError};

use super::MotionError;

/// Where the bed is probed, in probing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbePoint {
    FrontLeft,
    FrontRight,
    BackLeft,
    BackRight,
    Center,
}

impl ProbePoint {
    pub const ORDER: [ProbePoint; 5] = [
        ProbePoint::FrontLeft,
        ProbePoint::FrontRight,
        ProbePoint::BackLeft,
        ProbePoint::BackRight,
        ProbePoint::Center,
    ];

    /// Logical X/Y of the probe point.
    pub fn position(self, config: &CalibrationConfig) -> (f32, f32) {
        let left = config.probe_inset;
        let right = config.bed_width - config.probe_inset;
        let front = config.probe_inset;
        let back = config.bed_depth - config.probe_inset;
        match self {
            ProbePoint::FrontLeft => (left, front),
            ProbePoint::FrontRight => (right, front),
            ProbePoint::BackLeft => (left, back),
            ProbePoint::BackRight => (right, back),
            ProbePoint::Center => (config.bed_width / 2.0, config.bed_depth / 2.0),
        }
    }
}

impl fmt::Display for ProbePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProbePoint::FrontLeft => "front-left",
            ProbePoint::FrontRight => "front-right",
            ProbePoint::BackLeft => "back-left",
            ProbePoint::BackRight => "back-right",
            ProbePoint::Center => "center",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BedCalibration {
    heights: [f32; 5],
    skew: [f32; 2],
    /// `None` until a complete calibration exists; every offset is zero then.
    plane: Option<Plane>,
}

impl BedCalibration {
    /// Fit the plane and derive skew from five heights in [`ProbePoint::ORDER`].
    pub fn from_probes(heights: [f32; 5], config: &CalibrationConfig) -> Result<Self, MotionError> {
        let skew = derive_skew(&heights, config);
        Self::with_skew(heights, skew, config).ok_or(MotionError::DegenerateFit)
    }

    fn with_skew(heights: [f32; 5], skew: [f32; 2], config: &CalibrationConfig) -> Option<Self> {
        if !heights.iter().chain(skew.iter()).all(|v| v.is_finite()) {
            return None;
        }
        let points: Vec<Vector> = ProbePoint::ORDER
            .iter()
            .zip(heights)
            .map(|(point, z)| {
                let (x, y) = point.position(config);
                Vector::point(x, y, z)
            })
            .collect();
        let plane = Plane::fit(&points)?;
        Some(Self {
            heights,
            skew,
            plane: Some(plane),
        })
    }

    pub fn is_valid(&self) -> bool {
        self.plane.is_some()
    }

    pub fn heights(&self) -> [f32; 5] {
        self.heights
    }

    pub fn plane(&self) -> Option<&Plane> {
        self.plane.as_ref()
    }

    /// Bed height above the Z reference at (x, y).
    pub fn height_at(&self, x: f32, y: f32) -> f32 {
        self.plane.map_or(0.0, |plane| plane.height_at(x, y))
    }

    pub fn skew(&self) -> (f32, f32) {
        if self.is_valid() {
            (self.skew[0], self.skew[1])
        } else {
            (0.0, 0.0)
        }
    }

    /// Read the stored model. Missing, erased or degenerate data yields an
    /// uncalibrated model rather than an error.
    pub fn load(storage: &dyn Storage, config: &CalibrationConfig) -> Result<Self, StorageError> {
        if layout::read_u8(storage, layout::CALIBRATION_VALID)? != 1 {
            return Ok(Self::default());
        }
        let mut heights = [0.0f32; 5];
        for (i, height) in heights.iter_mut().enumerate() {
            *height = layout::read_f32(storage, layout::PROBE_HEIGHTS + i * 4)?;
        }
        let skew = [
            layout::read_f32(storage, layout::SKEW_X)?,
            layout::read_f32(storage, layout::SKEW_Y)?,
        ];
        match Self::with_skew(heights, skew, config) {
            Some(calibration) => Ok(calibration),
            None => {
                tracing::warn!("Stored bed calibration is unusable, ignoring it");
                Ok(Self::default())
            }
        }
    }

    /// Write the model. The valid flag is cleared first and set last.
    pub fn store(&self, storage: &mut dyn Storage) -> Result<(), StorageError> {
        layout::write_u8(storage, layout::CALIBRATION_VALID, 0)?;
        for (i, height) in self.heights.iter().enumerate() {
            layout::write_f32(storage, layout::PROBE_HEIGHTS + i * 4, *height)?;
        }
        layout::write_f32(storage, layout::SKEW_X, self.skew[0])?;
        layout::write_f32(storage, layout::SKEW_Y, self.skew[1])?;
        layout::write_u8(storage, layout::CALIBRATION_VALID, u8::from(self.is_valid()))
    }
}

/// Skew from the corner twist. A planar bed has no twist; what remains after the
/// plane is the lean of the gantry, split between X and Y.
pub fn derive_skew(heights: &[f32; 5], config: &CalibrationConfig) -> [f32; 2] {
    let [front_left, front_right, back_left, back_right, _] = *heights;
    let twist = (back_left - front_left) - (back_right - front_right);
    let width = config.bed_width - 2.0 * config.probe_inset;
    let depth = config.bed_depth - 2.0 * config.probe_inset;
    if width <= 0.0 || depth <= 0.0 {
        return [0.0; 2];
    }
    [twist / (2.0 * depth), twist / (2.0 * width)]
}

/// Last known head position, saved at completion points.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PositionRecord {
    pub position: [f32; 3],
    pub valid: [bool; 3],
    pub extruded: f32,
}

impl PositionRecord {
    pub fn load(storage: &dyn Storage) -> Result<Self, StorageError> {
        let mut record = Self::default();
        let bits = layout::read_u8(storage, layout::POSITION_VALID)?;
        for i in 0..3 {
            let value = layout::read_f32(storage, layout::LAST_POSITION + i * 4)?;
            // An erased validity byte has every bit set.
            record.valid[i] = bits != 0xFF && bits & (1 << i) != 0 && value.is_finite();
            record.position[i] = if value.is_finite() { value } else { 0.0 };
        }
        let extruded = layout::read_f32(storage, layout::EXTRUDED_MM)?;
        record.extruded = if extruded.is_finite() { extruded } else { 0.0 };
        Ok(record)
    }

    pub fn store(&self, storage: &mut dyn Storage) -> Result<(), StorageError> {
        for (i, value) in self.position.iter().enumerate() {
            layout::write_f32(storage, layout::LAST_POSITION + i * 4, *value)?;
        }
        let bits = self
            .valid
            .iter()
            .enumerate()
            .fold(0u8, |acc, (i, &valid)| if valid { acc | (1 << i) } else { acc });
        layout::write_u8(storage, layout::POSITION_VALID, bits)?;
        layout::write_f32(storage, layout::EXTRUDED_MM, self.extruded)
    }
}
