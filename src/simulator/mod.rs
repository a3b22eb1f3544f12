// src/simulator/mod.rs - Simulated machine behind the hardware interfaces
use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::Config;
use crate::geometry::{Axis, Vector};
use crate::hardware::{Heater, HardwareError, LevelOutput, MotorDriver, Peripherals, Storage, TiltSensor, Transport};
use crate::motion::{CurrentTier, StepSegment};

/// Acceleration reported on Y while the head is against the frame or the bed.
const CONTACT_SPIKE: f32 = 1.0;

/// Physical state shared by all simulated collaborators.
#[derive(Debug, Clone)]
pub struct SimWorld {
    /// Physical nozzle position; X/Y zero is the homing corner.
    head: Vector,
    steps_per_mm: [f32; 4],
    invert_direction: [bool; 4],
    /// Surface height at front-left, front-right, back-left, back-right.
    bed_corners: [f32; 4],
    bed_size: (f32, f32),
    motors_enabled: bool,
    current: Option<CurrentTier>,
    segments: usize,
    realtime: bool,
    sensor_working: bool,
    sensor_noise: f32,
    heater_working: bool,
    heater_target: f32,
    heater_temp: f32,
    heat_rate: f32,
    ambient: f32,
    fan_level: u8,
    led_level: u8,
}

impl SimWorld {
    pub fn new(config: &Config) -> Self {
        let sim = &config.simulator;
        let [x, y, z] = sim.start_position;
        Self {
            head: Vector::point(x, y, z),
            steps_per_mm: config.motion.steps_per_mm,
            invert_direction: config.motion.invert_direction,
            bed_corners: sim.bed_corners,
            bed_size: (config.calibration.bed_width, config.calibration.bed_depth),
            motors_enabled: false,
            current: None,
            segments: 0,
            realtime: sim.realtime,
            sensor_working: true,
            sensor_noise: sim.sensor_noise,
            heater_working: true,
            heater_target: 0.0,
            heater_temp: sim.ambient,
            heat_rate: sim.heat_rate,
            ambient: sim.ambient,
            fan_level: 0,
            led_level: 0,
        }
    }

    pub fn head(&self) -> Vector {
        self.head
    }

    pub fn set_head(&mut self, head: Vector) {
        self.head = head;
    }

    /// Bilinear surface height under (x, y).
    pub fn bed_height(&self, x: f32, y: f32) -> f32 {
        let (width, depth) = self.bed_size;
        let u = if width > 0.0 { (x / width).clamp(0.0, 1.0) } else { 0.0 };
        let v = if depth > 0.0 { (y / depth).clamp(0.0, 1.0) } else { 0.0 };
        let [front_left, front_right, back_left, back_right] = self.bed_corners;
        let front = front_left + (front_right - front_left) * u;
        let back = back_left + (back_right - back_left) * u;
        front + (back - front) * v
    }

    fn in_contact(&self) -> bool {
        let cornered = self.head.x <= 0.0 && self.head.y <= 0.0;
        cornered || self.head.z <= self.bed_height(self.head.x, self.head.y)
    }

    pub fn motors_enabled(&self) -> bool {
        self.motors_enabled
    }

    pub fn current(&self) -> Option<CurrentTier> {
        self.current
    }

    pub fn segments_executed(&self) -> usize {
        self.segments
    }

    pub fn set_sensor_working(&mut self, working: bool) {
        self.sensor_working = working;
    }

    pub fn set_heater_working(&mut self, working: bool) {
        self.heater_working = working;
    }

    pub fn heater_target(&self) -> f32 {
        self.heater_target
    }

    pub fn fan_level(&self) -> u8 {
        self.fan_level
    }

    pub fn led_level(&self) -> u8 {
        self.led_level
    }

    fn apply(&mut self, segment: &StepSegment) {
        for axis in Axis::ALL {
            let i = axis.index();
            let mut mm = segment.steps[i] as f32 / self.steps_per_mm[i];
            if self.invert_direction[i] {
                mm = -mm;
            }
            self.head[axis] += mm;
        }
        // The frame stops X and Y at the homing corner.
        self.head.x = self.head.x.max(0.0);
        self.head.y = self.head.y.max(0.0);
        self.segments += 1;
    }
}

/// Owner of the shared world; hands out collaborators bound to it.
#[derive(Debug, Clone)]
pub struct Simulator {
    world: Arc<Mutex<SimWorld>>,
}

impl Simulator {
    pub fn new(config: &Config) -> Self {
        tracing::info!(
            "Simulated machine at X{} Y{} Z{}",
            config.simulator.start_position[0],
            config.simulator.start_position[1],
            config.simulator.start_position[2]
        );
        Self {
            world: Arc::new(Mutex::new(SimWorld::new(config))),
        }
    }

    pub fn world(&self) -> MutexGuard<'_, SimWorld> {
        lock(&self.world)
    }

    pub fn peripherals(&self, transport: Box<dyn Transport>, storage: Box<dyn Storage>) -> Peripherals {
        Peripherals {
            heater: Box::new(SimHeater { world: self.world.clone() }),
            sensor: Box::new(SimSensor { world: self.world.clone() }),
            motors: Box::new(SimMotors { world: self.world.clone() }),
            fan: Box::new(SimLevel { world: self.world.clone(), output: LevelKind::Fan }),
            led: Box::new(SimLevel { world: self.world.clone(), output: LevelKind::Led }),
            transport,
            storage,
        }
    }
}

fn lock(world: &Mutex<SimWorld>) -> MutexGuard<'_, SimWorld> {
    world.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn noise(amplitude: f32) -> f32 {
    amplitude * (rand::random::<f32>() - 0.5)
}

pub struct SimMotors {
    world: Arc<Mutex<SimWorld>>,
}

impl MotorDriver for SimMotors {
    fn set_enabled(&mut self, enabled: bool) {
        lock(&self.world).motors_enabled = enabled;
    }

    fn set_current(&mut self, tier: CurrentTier) {
        lock(&self.world).current = Some(tier);
    }

    fn execute(&mut self, segment: &StepSegment) -> Result<(), HardwareError> {
        let realtime = {
            let mut world = lock(&self.world);
            if !world.motors_enabled {
                return Err(HardwareError::MotorsDisabled);
            }
            world.apply(segment);
            world.realtime
        };
        if realtime {
            std::thread::sleep(segment.duration);
        }
        Ok(())
    }
}

pub struct SimSensor {
    world: Arc<Mutex<SimWorld>>,
}

impl TiltSensor for SimSensor {
    fn is_working(&self) -> bool {
        lock(&self.world).sensor_working
    }

    fn read_axes(&mut self) -> [f32; 3] {
        let world = lock(&self.world);
        let amplitude = world.sensor_noise;
        let spike = if world.in_contact() { CONTACT_SPIKE } else { 0.0 };
        [noise(amplitude), spike + noise(amplitude), 1.0 + noise(amplitude)]
    }
}

/// Moves a fixed number of degrees toward its target per reading.
pub struct SimHeater {
    world: Arc<Mutex<SimWorld>>,
}

impl Heater for SimHeater {
    fn is_working(&self) -> bool {
        lock(&self.world).heater_working
    }

    fn set_temperature(&mut self, target: f32, wait: bool) -> bool {
        let mut world = lock(&self.world);
        if !world.heater_working || !target.is_finite() || target < 0.0 {
            return false;
        }
        tracing::debug!("Simulated heater target {:.1} (wait: {})", target, wait);
        world.heater_target = target;
        true
    }

    fn temperature(&mut self) -> f32 {
        let mut world = lock(&self.world);
        let goal = if world.heater_target > 0.0 { world.heater_target } else { world.ambient };
        let step = world.heat_rate;
        let delta = (goal - world.heater_temp).clamp(-step, step);
        world.heater_temp += delta;
        world.heater_temp
    }
}

#[derive(Debug, Clone, Copy)]
enum LevelKind {
    Fan,
    Led,
}

pub struct SimLevel {
    world: Arc<Mutex<SimWorld>>,
    output: LevelKind,
}

impl LevelOutput for SimLevel {
    fn set_level(&mut self, level: u8) {
        let mut world = lock(&self.world);
        match self.output {
            LevelKind::Fan => world.fan_level = level,
            LevelKind::Led => world.led_level = level,
        }
    }
}

/// Writes responses to stdout.
#[derive(Debug, Default)]
pub struct StdoutTransport;

impl Transport for StdoutTransport {
    fn send(&mut self, bytes: &[u8], _must_fit: bool) -> bool {
        let mut out = std::io::stdout().lock();
        out.write_all(bytes).and_then(|_| out.flush()).is_ok()
    }
}

/// Keeps every response line, for tests and scripted runs.
#[derive(Debug, Clone, Default)]
pub struct RecordingTransport {
    lines: Arc<Mutex<Vec<String>>>,
    partial: String,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    /// Remove and return everything recorded so far.
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.lines.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }
}

impl Transport for RecordingTransport {
    fn send(&mut self, bytes: &[u8], _must_fit: bool) -> bool {
        self.partial.push_str(&String::from_utf8_lossy(bytes));
        let mut lines = self.lines.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        while let Some(end) = self.partial.find('\n') {
            lines.push(self.partial[..end].to_string());
            self.partial.replace_range(..=end, "");
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bed_height_interpolates_corners() {
        let mut config = Config::default();
        config.simulator.bed_corners = [0.0, 1.0, 2.0, 3.0];
        let world = SimWorld::new(&config);
        assert_eq!(world.bed_height(0.0, 0.0), 0.0);
        assert_eq!(world.bed_height(100.0, 100.0), 3.0);
        assert!((world.bed_height(50.0, 50.0) - 1.5).abs() < 1e-6);
        assert_eq!(world.bed_height(-10.0, 0.0), 0.0);
    }

    #[test]
    fn test_steps_move_head_and_frame_stops_it() {
        let config = Config::default();
        let sim = Simulator::new(&config);
        let mut motors = SimMotors { world: sim.world.clone() };
        let segment = StepSegment { steps: [-200 * 20, 0, 646, 0], duration: std::time::Duration::ZERO };
        assert!(matches!(motors.execute(&segment), Err(HardwareError::MotorsDisabled)));
        motors.set_enabled(true);
        motors.execute(&segment).unwrap();
        let head = sim.world().head();
        assert_eq!(head.x, 0.0);
        assert_eq!(head.y, 50.0);
        assert!((head.z - 9.0).abs() < 1e-5);
    }

    #[test]
    fn test_sensor_spikes_on_contact() {
        let mut config = Config::default();
        config.simulator.sensor_noise = 0.0;
        let sim = Simulator::new(&config);
        let mut sensor = SimSensor { world: sim.world.clone() };
        assert_eq!(sensor.read_axes()[1], 0.0);
        sim.world().set_head(Vector::point(30.0, 30.0, -0.01));
        assert_eq!(sensor.read_axes()[1], CONTACT_SPIKE);
        sim.world().set_head(Vector::point(0.0, 0.0, 5.0));
        assert_eq!(sensor.read_axes()[1], CONTACT_SPIKE);
    }

    #[test]
    fn test_heater_approaches_target() {
        let config = Config::default();
        let sim = Simulator::new(&config);
        let mut heater = SimHeater { world: sim.world.clone() };
        assert!(heater.set_temperature(40.0, false));
        let first = heater.temperature();
        assert_eq!(first, config.simulator.ambient + config.simulator.heat_rate);
        for _ in 0..10 {
            heater.temperature();
        }
        assert_eq!(heater.temperature(), 40.0);
    }

    #[test]
    fn test_recording_transport_splits_lines() {
        let mut transport = RecordingTransport::new();
        let handle = transport.clone();
        transport.send(b"ok\nrs N", false);
        transport.send(b"4\n", false);
        assert_eq!(handle.lines(), vec!["ok".to_string(), "rs N4".to_string()]);
        assert_eq!(handle.take().len(), 2);
        assert!(handle.lines().is_empty());
    }
}
