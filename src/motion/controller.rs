// src/motion/controller.rs - Logical position, compensated moves, homing and probing
use std::time::Duration;

use crate::config::{CalibrationConfig, Config, HomingConfig, MotionConfig};
use crate::gcode::{Command, EmergencyStop};
use crate::geometry::{Axis, Vector};
use crate::hardware::{MotorDriver, TiltSensor};

use super::calibration::{BedCalibration, PositionRecord, ProbePoint};
use super::compensation::{self, BacklashCompensator, Compensation, CurrentTiering};
use super::kinematics::TravelEnvelope;
use super::stepper::StepGenerator;
use super::{MotionError, MotionState, Positioning, Units};

/// Axis words of a move or set-position command, in command units.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MoveTarget {
    pub x: Option<f32>,
    pub y: Option<f32>,
    pub z: Option<f32>,
    pub e: Option<f32>,
    pub feedrate: Option<f32>,
}

impl MoveTarget {
    pub fn from_command(command: &Command) -> Self {
        Self {
            x: command.x(),
            y: command.y(),
            z: command.z(),
            e: command.e(),
            feedrate: command.f(),
        }
    }

    fn axes(&self) -> [(Axis, Option<f32>); 4] {
        [(Axis::X, self.x), (Axis::Y, self.y), (Axis::Z, self.z), (Axis::E, self.e)]
    }

    pub fn has_axis(&self) -> bool {
        self.axes().iter().any(|(_, value)| value.is_some())
    }
}

pub struct MotionController {
    config: MotionConfig,
    homing: HomingConfig,
    probing: CalibrationConfig,
    envelope: TravelEnvelope,
    stepper: StepGenerator,
    compensations: Vec<Box<dyn Compensation>>,
    backlash: BacklashCompensator,
    tiering: CurrentTiering,
    calibration: BedCalibration,
    position: Vector,
    valid: [bool; 3],
    positioning: Positioning,
    extruder_positioning: Positioning,
    units: Units,
    /// mm/min
    feedrate: f32,
    state: MotionState,
    motors_enabled: bool,
    extruded: f32,
    motors: Box<dyn MotorDriver>,
    sensor: Box<dyn TiltSensor>,
    stop: EmergencyStop,
}

impl std::fmt::Debug for MotionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MotionController")
            .field("state", &self.state)
            .field("position", &self.position)
            .field("valid", &self.valid)
            .field("calibration", &self.calibration)
            .finish_non_exhaustive()
    }
}

impl MotionController {
    pub fn new(config: &Config, motors: Box<dyn MotorDriver>, sensor: Box<dyn TiltSensor>, stop: EmergencyStop) -> Self {
        let motion = &config.motion;
        let mut controller = Self {
            config: motion.clone(),
            homing: config.homing.clone(),
            probing: config.calibration.clone(),
            envelope: TravelEnvelope::new(motion.envelope),
            stepper: StepGenerator::new(motion.steps_per_mm, motion.invert_direction),
            compensations: compensation::pipeline(motion),
            backlash: BacklashCompensator::new(&motion.backlash),
            tiering: CurrentTiering::new(&motion.current),
            calibration: BedCalibration::default(),
            position: Vector::ZERO,
            valid: [false; 3],
            positioning: Positioning::Absolute,
            extruder_positioning: Positioning::Absolute,
            units: Units::Millimeters,
            feedrate: motion.default_feedrate,
            state: MotionState::Idle,
            motors_enabled: false,
            extruded: 0.0,
            motors,
            sensor,
            stop,
        };
        let motor = controller.motor_target(&controller.position);
        controller.stepper.set_position(&motor);
        controller
    }

    pub fn state(&self) -> MotionState {
        self.state
    }

    pub fn position(&self) -> Vector {
        self.position
    }

    pub fn is_valid(&self, axis: Axis) -> bool {
        self.valid.get(axis.index()).copied().unwrap_or(true)
    }

    pub fn units(&self) -> Units {
        self.units
    }

    pub fn set_units(&mut self, units: Units) {
        self.units = units;
    }

    /// G90/G91: applies to every axis, the extruder included.
    pub fn set_positioning(&mut self, positioning: Positioning) {
        self.positioning = positioning;
        self.extruder_positioning = positioning;
    }

    /// M82/M83
    pub fn set_extruder_positioning(&mut self, positioning: Positioning) {
        self.extruder_positioning = positioning;
    }

    pub fn positioning(&self) -> (Positioning, Positioning) {
        (self.positioning, self.extruder_positioning)
    }

    pub fn feedrate(&self) -> f32 {
        self.feedrate
    }

    pub fn calibration(&self) -> &BedCalibration {
        &self.calibration
    }

    /// Replace the bed model. The motors are not moved; the next move absorbs the change.
    pub fn set_calibration(&mut self, calibration: BedCalibration) {
        tracing::info!(valid = calibration.is_valid(), "Bed calibration applied");
        self.calibration = calibration;
    }

    pub fn sensor_working(&self) -> bool {
        self.sensor.is_working()
    }

    pub fn motors_enabled(&self) -> bool {
        self.motors_enabled
    }

    /// Total positive extrusion in millimeters.
    pub fn extruded(&self) -> f32 {
        self.extruded
    }

    pub fn set_extruded(&mut self, extruded: f32) {
        self.extruded = extruded;
    }

    pub fn motor_position(&self) -> Vector {
        self.stepper.position()
    }

    /// Motor position for a logical position: every enabled compensation plus the
    /// current backlash offset.
    pub fn motor_target(&self, logical: &Vector) -> Vector {
        let mut target = *logical;
        for stage in &self.compensations {
            target += stage.offset(&self.calibration, logical);
        }
        target + self.backlash.offset()
    }

    pub fn set_motors_enabled(&mut self, enabled: bool) {
        self.motors.set_enabled(enabled);
        self.motors_enabled = enabled;
        if !enabled {
            // X and Y can be pushed by hand once unpowered; Z holds on its lead screw.
            self.valid[Axis::X.index()] = false;
            self.valid[Axis::Y.index()] = false;
            self.backlash.reset();
            self.tiering.reset();
        }
        tracing::info!("Motors {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn position_record(&self) -> PositionRecord {
        PositionRecord {
            position: [self.position.x, self.position.y, self.position.z],
            valid: self.valid,
            extruded: self.extruded,
        }
    }

    /// Restore what survives a power cycle: Z, its validity and the extrusion total.
    pub fn restore(&mut self, record: &PositionRecord) {
        self.extruded = record.extruded;
        if record.valid[Axis::Z.index()] {
            self.position.z = record.position[Axis::Z.index()];
            self.valid[Axis::Z.index()] = true;
            let motor = self.motor_target(&self.position);
            self.stepper.set_axis(Axis::Z, motor.z);
            tracing::info!("Restored Z position {:.3}", self.position.z);
        }
    }

    fn resolve(&self, request: &MoveTarget) -> (Vector, Vec<Axis>) {
        let mut target = self.position;
        let mut present = Vec::new();
        for (axis, value) in request.axes() {
            let Some(value) = value else { continue };
            let mm = self.units.to_mm(value);
            let positioning = if axis == Axis::E { self.extruder_positioning } else { self.positioning };
            target[axis] = match positioning {
                Positioning::Absolute => mm,
                Positioning::Relative => self.position[axis] + mm,
            };
            present.push(axis);
        }
        (target, present)
    }

    fn apply_feedrate(&mut self, request: &MoveTarget) {
        if let Some(feedrate) = request.feedrate {
            let feedrate = self.units.to_mm(feedrate);
            if feedrate.is_finite() && feedrate > 0.0 {
                self.feedrate = feedrate;
            }
        }
    }

    /// G0/G1. Fails without touching the position when a target is outside the
    /// travel envelope. On an emergency stop the last completed segment is kept.
    pub fn linear_move(&mut self, request: &MoveTarget) -> Result<(), MotionError> {
        let (target, present) = self.resolve(request);
        let spatial: Vec<Axis> = present.iter().copied().filter(|&a| a != Axis::E).collect();
        self.envelope.check(&target, &spatial)?;
        if !target.is_finite() {
            return Err(MotionError::out_of_range(Axis::E, target.e));
        }
        self.apply_feedrate(request);
        if present.is_empty() || target == self.position {
            return Ok(());
        }

        self.state = MotionState::Moving;
        tracing::debug!("Move to X{:.3} Y{:.3} Z{:.3} E{:.3}", target.x, target.y, target.z, target.e);
        let result = self.run_segments(target);
        self.state = MotionState::Idle;
        result
    }

    fn run_segments(&mut self, end: Vector) -> Result<(), MotionError> {
        let start = self.position;
        // Extrusion is not segmented; an extrude-only move is a single segment.
        let travel = (end - start).spatial_length();
        let count = (travel / self.config.segment_length).ceil().max(1.0) as usize;
        let feedrate = self.feedrate;
        for i in 1..=count {
            if self.stop.is_active() {
                tracing::warn!("Move aborted at X{:.3} Y{:.3} Z{:.3}", self.position.x, self.position.y, self.position.z);
                return Err(MotionError::Aborted);
            }
            let waypoint = if i == count { end } else { start.lerp(&end, i as f32 / count as f32) };
            self.execute_segment(waypoint, feedrate)?;
        }
        Ok(())
    }

    fn execute_segment(&mut self, to: Vector, feedrate: f32) -> Result<(), MotionError> {
        let from = self.position;
        let delta = to - from;
        if let Some(pre_travel) = self.backlash.prepare(&delta) {
            let motor = self.motor_target(&from);
            tracing::debug!("Backlash pre-travel X{:.3} Y{:.3}", pre_travel.x, pre_travel.y);
            self.drive(&motor, duration_for(pre_travel.spatial_length(), self.backlash.feedrate()))?;
        }
        if let Some(tier) = self.tiering.update(to.z) {
            tracing::debug!("Motor current {:?}", tier);
            self.motors.set_current(tier);
        }
        let motor = self.motor_target(&to);
        self.drive(&motor, duration_for(travel_distance(&delta), feedrate))?;
        self.position = to;
        self.extruded += delta.e.max(0.0);
        Ok(())
    }

    fn drive(&mut self, motor: &Vector, duration: Duration) -> Result<(), MotionError> {
        if !self.motors_enabled {
            self.set_motors_enabled(true);
        }
        let segment = self.stepper.step_to(motor, duration);
        if segment.is_empty() {
            return Ok(());
        }
        self.motors.execute(&segment)?;
        Ok(())
    }

    /// G92. Redefines the logical position of the given axes without moving and
    /// marks them valid. Positions outside the travel envelope are rejected.
    pub fn set_position(&mut self, request: &MoveTarget) -> Result<(), MotionError> {
        let mut target = self.position;
        let mut present = Vec::new();
        for (axis, value) in request.axes() {
            let Some(value) = value else { continue };
            target[axis] = self.units.to_mm(value);
            present.push(axis);
        }
        let spatial: Vec<Axis> = present.iter().copied().filter(|&a| a != Axis::E).collect();
        self.envelope.check(&target, &spatial)?;
        if !target.e.is_finite() {
            return Err(MotionError::out_of_range(Axis::E, target.e));
        }

        self.position = target;
        let motor = self.motor_target(&self.position);
        for axis in present {
            if let Some(valid) = self.valid.get_mut(axis.index()) {
                *valid = true;
            }
            self.stepper.set_axis(axis, motor[axis]);
        }
        Ok(())
    }

    fn contact(&mut self) -> bool {
        self.sensor.read_axes()[1] > self.homing.tilt_threshold
    }

    /// G28. Drives X and Y toward the minimum corner until the accelerometer reports
    /// the head against the frame, which becomes X0 Y0.
    pub fn home(&mut self) -> Result<(), MotionError> {
        if !self.sensor.is_working() {
            return Err(MotionError::SensorNotWorking);
        }
        tracing::info!("Homing X/Y");
        self.state = MotionState::Homing;
        let result = self.run_homing();
        self.state = MotionState::Idle;
        match &result {
            Ok(()) => tracing::info!("Homing complete"),
            Err(e) => {
                tracing::error!("Homing failed: {}", e);
                self.valid[Axis::X.index()] = false;
                self.valid[Axis::Y.index()] = false;
            }
        }
        result
    }

    fn run_homing(&mut self) -> Result<(), MotionError> {
        let step = self.homing.step;
        let iterations = (self.homing.max_travel / step).ceil() as usize;
        let duration = duration_for(step * std::f32::consts::SQRT_2, self.homing.feedrate);
        let mut found = false;
        for _ in 0..=iterations {
            if self.stop.is_active() {
                return Err(MotionError::Aborted);
            }
            if !self.sensor.is_working() {
                return Err(MotionError::SensorNotWorking);
            }
            if self.contact() {
                found = true;
                break;
            }
            let mut motor = self.stepper.position();
            motor.x -= step;
            motor.y -= step;
            self.drive(&motor, duration)?;
        }
        if !found {
            return Err(MotionError::HomingOutOfRange);
        }

        self.backlash.reset();
        self.position.x = 0.0;
        self.position.y = 0.0;
        self.valid[Axis::X.index()] = true;
        self.valid[Axis::Y.index()] = true;
        self.stepper.set_axis(Axis::X, 0.0);
        self.stepper.set_axis(Axis::Y, 0.0);
        Ok(())
    }

    /// G32. Probes the bed and applies the result. The previous model stays in
    /// effect unless every probe succeeds; persisting is left to the caller.
    pub fn calibrate_bed(&mut self) -> Result<BedCalibration, MotionError> {
        if !self.valid[Axis::X.index()] || !self.valid[Axis::Y.index()] {
            return Err(MotionError::NotHomed);
        }
        if !self.sensor.is_working() {
            return Err(MotionError::SensorNotWorking);
        }
        tracing::info!("Calibrating bed");
        self.state = MotionState::Calibrating;
        let previous = std::mem::take(&mut self.calibration);
        self.backlash.reset();
        let result = self.run_calibration();
        self.state = MotionState::Idle;
        match result {
            Ok((calibration, center_contact)) => {
                self.calibration = calibration.clone();
                // Z0 is nozzle contact at the bed center.
                let motor_z = self.stepper.position().z;
                self.stepper.set_axis(Axis::Z, motor_z - center_contact);
                self.position.z = motor_z - center_contact;
                self.valid[Axis::Z.index()] = true;
                let motor = self.motor_target(&self.position);
                self.drive(&motor, duration_for(self.probing.clearance, self.probing.feedrate))?;
                tracing::info!(skew = ?calibration.skew(), "Bed calibration complete");
                Ok(calibration)
            }
            Err(e) => {
                tracing::error!("Bed calibration failed: {}", e);
                self.calibration = previous;
                self.valid[Axis::Z.index()] = false;
                Err(e)
            }
        }
    }

    /// Probe every point with compensation disabled. Returns the model and the
    /// motor Z of the center contact.
    fn run_calibration(&mut self) -> Result<(BedCalibration, f32), MotionError> {
        let mut contacts = [0.0f32; 5];
        for (i, point) in ProbePoint::ORDER.into_iter().enumerate() {
            let (x, y) = point.position(&self.probing);
            let mut motor = self.stepper.position();
            let distance = Vector::point(x - motor.x, y - motor.y, 0.0).spatial_length();
            motor.x = x;
            motor.y = y;
            self.drive(&motor, duration_for(distance, self.probing.feedrate))?;
            self.position.x = x;
            self.position.y = y;

            contacts[i] = self.probe_down(point)?;
            tracing::debug!("Contact at {} ({:.1}, {:.1}): {:.3}", point, x, y, contacts[i]);

            let mut lift = self.stepper.position();
            lift.z += self.probing.clearance;
            self.drive(&lift, duration_for(self.probing.clearance, self.probing.feedrate))?;
        }
        let center = contacts[4];
        let heights = contacts.map(|z| z - center);
        let calibration = BedCalibration::from_probes(heights, &self.probing)?;
        Ok((calibration, center))
    }

    fn probe_down(&mut self, point: ProbePoint) -> Result<f32, MotionError> {
        let start = self.stepper.position().z;
        let step_duration = duration_for(self.probing.probe_step, self.probing.feedrate);
        loop {
            if self.stop.is_active() {
                return Err(MotionError::Aborted);
            }
            if !self.sensor.is_working() {
                return Err(MotionError::SensorNotWorking);
            }
            if self.contact() {
                return Ok(self.stepper.position().z);
            }
            let mut motor = self.stepper.position();
            if start - motor.z >= self.probing.max_descent {
                return Err(MotionError::ProbeOutOfRange(point));
            }
            motor.z -= self.probing.probe_step;
            self.drive(&motor, step_duration)?;
        }
    }
}

/// Spatial distance, or extruder travel for extrude-only moves.
fn travel_distance(delta: &Vector) -> f32 {
    let spatial = delta.spatial_length();
    if spatial > 0.0 { spatial } else { delta.e.abs() }
}

fn duration_for(distance: f32, feedrate: f32) -> Duration {
    if feedrate.is_nan() || feedrate <= 0.0 || !distance.is_finite() {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f32(distance / (feedrate / 60.0)).unwrap_or(Duration::ZERO)
}
