// src/hardware/mod.rs - Narrow interfaces to the peripherals the firmware drives
pub mod storage;

use thiserror::Error;

use crate::motion::{CurrentTier, StepSegment};

pub use storage::{FileStorage, MemoryStorage, Storage, StorageError};

#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("Motor driver fault: {0}")]
    Driver(String),
    #[error("Motors are disabled")]
    MotorsDisabled,
}

/// Hotend heater. Regulation internals live behind this interface.
pub trait Heater: Send {
    fn is_working(&self) -> bool;
    /// Returns false when the collaborator refuses the target. `wait` is a hint only;
    /// waiting itself is done by the caller so it can observe an emergency stop.
    fn set_temperature(&mut self, target: f32, wait: bool) -> bool;
    fn temperature(&mut self) -> f32;
}

/// Calibrated accelerometer used as the tilt and contact sensor.
pub trait TiltSensor: Send {
    fn is_working(&self) -> bool;
    /// Acceleration in g along X, Y and Z.
    fn read_axes(&mut self) -> [f32; 3];
}

/// Stepper drivers for X, Y, Z and E.
pub trait MotorDriver: Send {
    fn set_enabled(&mut self, enabled: bool);
    fn set_current(&mut self, tier: CurrentTier);
    /// Run one segment to completion.
    fn execute(&mut self, segment: &StepSegment) -> Result<(), HardwareError>;
}

/// Fan and LED: duty level in percent, no feedback.
pub trait LevelOutput: Send {
    fn set_level(&mut self, level: u8);
}

/// Outgoing half of the serial link.
pub trait Transport: Send {
    /// Returns false if the bytes were not sent. With `must_fit` the whole write is
    /// dropped when it does not fit; otherwise it is best effort.
    fn send(&mut self, bytes: &[u8], must_fit: bool) -> bool;
}

/// Every collaborator the printer context owns.
pub struct Peripherals {
    pub heater: Box<dyn Heater>,
    pub sensor: Box<dyn TiltSensor>,
    pub motors: Box<dyn MotorDriver>,
    pub fan: Box<dyn LevelOutput>,
    pub led: Box<dyn LevelOutput>,
    pub transport: Box<dyn Transport>,
    pub storage: Box<dyn Storage>,
}

impl std::fmt::Debug for Peripherals {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peripherals").finish_non_exhaustive()
    }
}
