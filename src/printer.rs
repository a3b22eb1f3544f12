// src/printer.rs - Application context: queue consumer, dispatch and responses
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Notify;

use crate::config::Config;
use crate::gcode::{
    Command, CommandQueue, CommandReceiver, DeliveryProtocol, Dequeued, EmergencyStop, ParserConfig, Response,
    SharedQueue, Verdict,
};
use crate::geometry::Axis;
use crate::hardware::storage::layout;
use crate::hardware::{HardwareError, Heater, LevelOutput, Peripherals, Storage, StorageError, Transport};
use crate::motion::{BedCalibration, MotionController, MotionError, MoveTarget, PositionRecord, Positioning, Units};

#[derive(Debug, Error)]
pub enum PrinterError {
    #[error("Unknown command")]
    UnknownCommand,
    #[error("Heater not working")]
    HeaterNotWorking,
    #[error("Accelerometer not working")]
    SensorNotWorking,
    #[error("Invalid tool T{0}")]
    InvalidTool(u8),
    #[error("Temperature out of range: {0}")]
    TemperatureOutOfRange(f32),
    #[error("Heater rejected target {0}")]
    HeaterRejected(f32),
    #[error("Heater did not reach {0} in time")]
    HeaterTimeout(f32),
    #[error("Missing parameter {0}")]
    MissingParameter(char),
    #[error("Invalid parameter {0}")]
    InvalidParameter(char),
    #[error(transparent)]
    Motion(#[from] MotionError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Hardware(#[from] HardwareError),
}

/// Commands that answer even when the heater or the accelerometer is down.
fn exempt_from_health_check(command: &Command) -> bool {
    if command.host_command().is_some() {
        return true;
    }
    command.g().is_none() && matches!(command.m(), Some(105 | 110 | 114 | 115 | 117 | 618 | 619))
}

/// Owns every piece of firmware state. The main loop is the only writer of
/// responses; the receive side only fills the queue.
pub struct Printer {
    config: Config,
    queue: SharedQueue,
    stop: EmergencyStop,
    wake: Arc<Notify>,
    protocol: DeliveryProtocol,
    motion: MotionController,
    heater: Box<dyn Heater>,
    fan: Box<dyn LevelOutput>,
    led: Box<dyn LevelOutput>,
    transport: Box<dyn Transport>,
    storage: Box<dyn Storage>,
    serial_number: String,
    boot_count: u32,
    target_temperature: f32,
}

impl std::fmt::Debug for Printer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Printer")
            .field("serial_number", &self.serial_number)
            .field("boot_count", &self.boot_count)
            .field("protocol", &self.protocol)
            .field("motion", &self.motion)
            .finish_non_exhaustive()
    }
}

impl Printer {
    pub fn new(config: Config, peripherals: Peripherals) -> Result<Self, PrinterError> {
        let Peripherals {
            heater,
            sensor,
            motors,
            fan,
            led,
            transport,
            mut storage,
        } = peripherals;

        let stop = EmergencyStop::new();
        let queue = SharedQueue::new(CommandQueue::new(config.protocol.queue_capacity, stop.clone()));
        let mut motion = MotionController::new(&config, motors, sensor, stop.clone());

        if layout::read_serial_number(storage.as_ref())?.is_none() {
            tracing::info!("Blank storage, writing serial number {}", config.printer.serial_number);
            layout::write_serial_number(storage.as_mut(), &config.printer.serial_number)?;
        }
        let serial_number = layout::read_serial_number(storage.as_ref())?.unwrap_or_default();

        let boot_count = match layout::read_u32(storage.as_ref(), layout::BOOT_COUNTER)? {
            u32::MAX => 1,
            count => count + 1,
        };
        layout::write_u32(storage.as_mut(), layout::BOOT_COUNTER, boot_count)?;

        motion.set_calibration(BedCalibration::load(storage.as_ref(), &config.calibration)?);
        motion.restore(&PositionRecord::load(storage.as_ref())?);

        tracing::info!("Printer {} starting, boot #{}", serial_number, boot_count);
        Ok(Self {
            config,
            queue,
            stop,
            wake: Arc::new(Notify::new()),
            protocol: DeliveryProtocol::new(),
            motion,
            heater,
            fan,
            led,
            transport,
            storage,
            serial_number,
            boot_count,
            target_temperature: 0.0,
        })
    }

    /// Producer handle for the receive side.
    pub fn receiver(&self) -> CommandReceiver {
        CommandReceiver::new(
            self.queue.clone(),
            ParserConfig::from(&self.config.protocol),
            self.config.protocol.line_buffer,
            self.wake.clone(),
        )
    }

    pub fn queue(&self) -> &SharedQueue {
        &self.queue
    }

    pub fn emergency_stop(&self) -> &EmergencyStop {
        &self.stop
    }

    pub fn protocol(&self) -> &DeliveryProtocol {
        &self.protocol
    }

    pub fn motion(&self) -> &MotionController {
        &self.motion
    }

    pub fn serial_number(&self) -> &str {
        &self.serial_number
    }

    pub fn boot_count(&self) -> u32 {
        self.boot_count
    }

    /// One step of the main loop. Returns false when there was nothing to do.
    pub fn process_next(&mut self) -> bool {
        let next = self.queue.lock().take_next();
        match next {
            Dequeued::Empty => false,
            Dequeued::Discarded(command) => {
                tracing::debug!("Discarded '{}'", command);
                true
            }
            Dequeued::StopCompleted(stops) => {
                self.finish_emergency_stop(&stops);
                true
            }
            Dequeued::Dispatch(command) => {
                self.dispatch(command);
                true
            }
        }
    }

    /// Process until the queue is empty.
    pub fn drain(&mut self) {
        while self.process_next() {}
    }

    /// Numbered stop lines are sequenced like any other line; the confirmation
    /// echoes the last one that was accepted or already seen.
    fn finish_emergency_stop(&mut self, stops: &[Command]) {
        tracing::warn!("Emergency stop complete");
        self.heater.set_temperature(0.0, false);
        self.target_temperature = 0.0;
        self.fan.set_level(0);

        let mut line = None;
        for stop in stops {
            match self.protocol.check(stop) {
                Verdict::Accept { line: accepted } => line = accepted,
                Verdict::Skip { line: seen } => line = Some(seen),
                Verdict::Resend { .. } => {}
            }
        }
        self.send(Response::ok().with_line(line));
    }

    fn dispatch(&mut self, command: Command) {
        tracing::debug!("Dispatch '{}'", command);
        if !exempt_from_health_check(&command) {
            if let Err(e) = self.check_health() {
                tracing::error!("Rejected '{}': {}", command, e);
                self.send(Response::Error { message: e.to_string(), line: None });
                return;
            }
        }

        let line = match self.protocol.check(&command) {
            Verdict::Accept { line } => line,
            verdict => {
                if let Some(response) = Option::<Response>::from(verdict) {
                    self.send(response);
                }
                return;
            }
        };

        let response = self.execute(&command).unwrap_or_else(|e| {
            tracing::warn!("'{}' failed: {}", command, e);
            Response::Error { message: e.to_string(), line: None }
        });
        self.send(response.with_line(line));
    }

    fn check_health(&self) -> Result<(), PrinterError> {
        if !self.heater.is_working() {
            return Err(PrinterError::HeaterNotWorking);
        }
        if !self.motion.sensor_working() {
            return Err(PrinterError::SensorNotWorking);
        }
        Ok(())
    }

    /// Write a response unless an emergency stop is draining.
    fn send(&mut self, response: Response) {
        if self.stop.is_active() {
            tracing::debug!("Suppressed '{}' during emergency stop", response);
            return;
        }
        let wire = response.to_wire();
        if !self.transport.send(wire.as_bytes(), false) {
            tracing::warn!("Transport dropped '{}'", response);
        }
    }

    /// Periodic idle notice; nothing is sent while work is pending.
    pub fn idle_tick(&mut self) {
        let pending = !self.queue.lock().is_empty();
        if !pending && !self.stop.is_active() {
            self.send(Response::Wait);
        }
    }

    fn execute(&mut self, command: &Command) -> Result<Response, PrinterError> {
        if let Some(text) = command.host_command() {
            tracing::info!("Host command: {}", text);
            return Ok(Response::ok());
        }
        if let Some(g) = command.g() {
            return self.execute_g(g, command);
        }
        if let Some(m) = command.m() {
            return self.execute_m(m, command);
        }
        match command.t() {
            Some(0) => Ok(Response::ok()),
            Some(tool) => Err(PrinterError::InvalidTool(tool)),
            None => Err(PrinterError::UnknownCommand),
        }
    }

    fn execute_g(&mut self, code: u16, command: &Command) -> Result<Response, PrinterError> {
        match code {
            0 | 1 => self.motion.linear_move(&MoveTarget::from_command(command))?,
            4 => {
                let millis = match (command.p(), command.s()) {
                    (Some(p), _) => i64::from(p),
                    (None, Some(s)) => i64::from(s) * 1000,
                    (None, None) => 0,
                };
                self.dwell(Duration::from_millis(millis.max(0) as u64));
            }
            20 => self.motion.set_units(Units::Inches),
            21 => self.motion.set_units(Units::Millimeters),
            28 => {
                self.motion.home()?;
                self.persist_position()?;
            }
            32 => {
                let calibration = self.motion.calibrate_bed()?;
                calibration.store(self.storage.as_mut())?;
                self.persist_position()?;
            }
            90 => self.motion.set_positioning(Positioning::Absolute),
            91 => self.motion.set_positioning(Positioning::Relative),
            92 => self.motion.set_position(&MoveTarget::from_command(command))?,
            _ => return Err(PrinterError::UnknownCommand),
        }
        Ok(Response::ok())
    }

    fn execute_m(&mut self, code: u16, command: &Command) -> Result<Response, PrinterError> {
        match code {
            17 => self.motion.set_motors_enabled(true),
            18 | 84 => {
                self.persist_position()?;
                self.motion.set_motors_enabled(false);
            }
            82 => self.motion.set_extruder_positioning(Positioning::Absolute),
            83 => self.motion.set_extruder_positioning(Positioning::Relative),
            104 => self.set_temperature(command, false)?,
            109 => self.set_temperature(command, true)?,
            105 => {
                let temperature = self.heater.temperature();
                return Ok(Response::ok_with(format!("T:{:.2} /{:.2}", temperature, self.target_temperature)));
            }
            106 => {
                let duty = command.s().unwrap_or(255).clamp(0, 255);
                self.fan.set_level((duty * 100 / 255) as u8);
            }
            107 => self.fan.set_level(0),
            110 => self.protocol.reset(command.n()),
            114 => {
                let p = self.motion.position();
                return Ok(Response::ok_with(format!("X:{:.3} Y:{:.3} Z:{:.3} E:{:.3}", p.x, p.y, p.z, p.e)));
            }
            115 => {
                let printer = &self.config.printer;
                return Ok(Response::ok_with(format!(
                    "FIRMWARE_NAME:{} FIRMWARE_VERSION:{} MACHINE_TYPE:{} EXTRUDER_COUNT:1 SERIAL_NUMBER:{}",
                    printer.firmware_name, printer.firmware_version, printer.machine_type, self.serial_number
                )));
            }
            117 => {
                let flag = |axis| u8::from(self.motion.is_valid(axis));
                return Ok(Response::ok_with(format!(
                    "XV:{} YV:{} ZV:{}",
                    flag(Axis::X),
                    flag(Axis::Y),
                    flag(Axis::Z)
                )));
            }
            400 => {}
            420 => {
                let level = command.t().ok_or(PrinterError::MissingParameter('T'))?;
                self.led.set_level(level.min(100));
            }
            618 => return self.write_storage(command),
            619 => return self.read_storage(command),
            _ => return Err(PrinterError::UnknownCommand),
        }
        Ok(Response::ok())
    }

    fn set_temperature(&mut self, command: &Command, wait: bool) -> Result<(), PrinterError> {
        let target = command.s().ok_or(PrinterError::MissingParameter('S'))? as f32;
        let band = self.config.heater.min_temp..=self.config.heater.max_temp;
        if target != 0.0 && !band.contains(&target) {
            return Err(PrinterError::TemperatureOutOfRange(target));
        }
        if !self.heater.set_temperature(target, wait) {
            return Err(PrinterError::HeaterRejected(target));
        }
        self.target_temperature = target;
        tracing::info!("Heater target {:.1}", target);
        if wait && target > 0.0 {
            self.wait_for_temperature(target)?;
        }
        Ok(())
    }

    /// Busy-wait for the heater, leaving early on an emergency stop.
    fn wait_for_temperature(&mut self, target: f32) -> Result<(), PrinterError> {
        let heater = &self.config.heater;
        let deadline = Instant::now() + Duration::from_millis(heater.timeout_ms);
        let poll = Duration::from_millis(heater.poll_ms);
        let tolerance = heater.tolerance;
        loop {
            if self.stop.is_active() {
                return Ok(());
            }
            if !self.heater.is_working() {
                return Err(PrinterError::HeaterNotWorking);
            }
            let temperature = self.heater.temperature();
            if (temperature - target).abs() <= tolerance {
                tracing::info!("Heater reached {:.1}", temperature);
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(PrinterError::HeaterTimeout(target));
            }
            std::thread::sleep(poll);
        }
    }

    fn dwell(&self, duration: Duration) {
        let poll = Duration::from_millis(self.config.heater.poll_ms.max(1));
        let deadline = Instant::now() + duration;
        loop {
            if self.stop.is_active() {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            std::thread::sleep(poll.min(deadline - now));
        }
    }

    fn storage_field(&self, command: &Command) -> Result<(usize, usize), PrinterError> {
        let offset = command.s().ok_or(PrinterError::MissingParameter('S'))?;
        let offset = usize::try_from(offset).map_err(|_| PrinterError::InvalidParameter('S'))?;
        let len = usize::from(command.t().unwrap_or(1));
        if !(1..=4).contains(&len) {
            return Err(PrinterError::InvalidParameter('T'));
        }
        Ok((offset, len))
    }

    /// M618: write a raw storage field, then reload everything derived from storage.
    fn write_storage(&mut self, command: &Command) -> Result<Response, PrinterError> {
        let (offset, len) = self.storage_field(command)?;
        let value = command.p().ok_or(PrinterError::MissingParameter('P'))?;
        layout::write_field(self.storage.as_mut(), offset, len, value as u32)?;
        self.motion
            .set_calibration(BedCalibration::load(self.storage.as_ref(), &self.config.calibration)?);
        self.serial_number = layout::read_serial_number(self.storage.as_ref())?.unwrap_or_default();
        let stored = layout::read_field(self.storage.as_ref(), offset, len)?;
        tracing::info!("Storage 0x{:02X} ({} bytes) set to {}", offset, len, stored);
        Ok(Response::ok_with(format!("PT:{} DT:{}", offset, stored)))
    }

    /// M619
    fn read_storage(&mut self, command: &Command) -> Result<Response, PrinterError> {
        let (offset, len) = self.storage_field(command)?;
        let value = layout::read_field(self.storage.as_ref(), offset, len)?;
        Ok(Response::ok_with(format!("PT:{} DT:{}", offset, value)))
    }

    fn persist_position(&mut self) -> Result<(), PrinterError> {
        self.motion.position_record().store(self.storage.as_mut())?;
        Ok(())
    }

    /// Main loop: processes the queue whenever the receive side signals, sends
    /// the idle notice while nothing arrives, and stops when `shutdown` resolves.
    /// Must run on a multi-threaded runtime; command execution blocks.
    pub async fn run<F>(mut self, shutdown: F) -> Result<(), PrinterError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let wake = self.wake.clone();
        let mut interval = tokio::time::interval(self.config.protocol.wait_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;
        tracing::info!("Printer ready");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested");
                    break;
                }
                _ = wake.notified() => {
                    tokio::task::block_in_place(|| self.drain());
                    interval.reset();
                }
                _ = interval.tick() => self.idle_tick(),
            }
        }

        tokio::task::block_in_place(|| self.drain());
        self.shutdown()
    }

    /// Turn the heater off and save the position.
    pub fn shutdown(&mut self) -> Result<(), PrinterError> {
        tracing::info!("Shutting down printer");
        self.heater.set_temperature(0.0, false);
        self.fan.set_level(0);
        self.persist_position()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gcode::checksum;
    use crate::hardware::MemoryStorage;
    use crate::simulator::{RecordingTransport, Simulator};

    fn printer() -> (Printer, RecordingTransport, Simulator) {
        printer_with(|_| {})
    }

    fn printer_with(adjust: impl FnOnce(&mut Config)) -> (Printer, RecordingTransport, Simulator) {
        let mut config = Config::default();
        config.simulator.sensor_noise = 0.0;
        config.heater.poll_ms = 1;
        adjust(&mut config);
        let sim = Simulator::new(&config);
        let transport = RecordingTransport::new();
        let peripherals = sim.peripherals(
            Box::new(transport.clone()),
            Box::new(MemoryStorage::new(layout::IMAGE_SIZE)),
        );
        (Printer::new(config, peripherals).unwrap(), transport, sim)
    }

    fn run(printer: &mut Printer, line: &str) {
        printer.receiver().receive_line(line);
        printer.drain();
    }

    fn numbered(body: &str) -> String {
        format!("{}*{}", body, checksum(body.as_bytes()))
    }

    #[test]
    fn test_boot_seeds_storage() {
        let (printer, _, _) = printer();
        assert_eq!(printer.boot_count(), 1);
        assert_eq!(printer.serial_number(), "0000000000000000");
    }

    #[test]
    fn test_unknown_command() {
        let (mut printer, out, _) = printer();
        run(&mut printer, "G999");
        run(&mut printer, "X10");
        assert_eq!(out.lines(), vec!["Error: Unknown command", "Error: Unknown command"]);
    }

    #[test]
    fn test_reports() {
        let (mut printer, out, _) = printer();
        run(&mut printer, "M114");
        run(&mut printer, "M117");
        run(&mut printer, "M115");
        let lines = out.lines();
        assert_eq!(lines[0], "ok X:0.000 Y:0.000 Z:0.000 E:0.000");
        assert_eq!(lines[1], "ok XV:0 YV:0 ZV:0");
        assert!(lines[2].contains("SERIAL_NUMBER:0000000000000000"));
    }

    #[test]
    fn test_numbered_error_carries_line_number() {
        let (mut printer, out, _) = printer();
        run(&mut printer, &numbered("N0 T3"));
        run(&mut printer, &numbered("N1 T0"));
        assert_eq!(out.lines(), vec!["Error: Invalid tool T3 N0", "ok N1"]);
        assert_eq!(printer.protocol().expected(), 2);
    }

    #[test]
    fn test_health_precondition() {
        let (mut printer, out, sim) = printer();
        sim.world().set_sensor_working(false);
        run(&mut printer, &numbered("N0 G1 X5"));
        run(&mut printer, "M105");
        let lines = out.lines();
        assert_eq!(lines[0], "Error: Accelerometer not working");
        assert!(lines[1].starts_with("ok T:"));
        // The rejected line was never sequenced.
        assert_eq!(printer.protocol().expected(), 0);
    }

    #[test]
    fn test_temperature_commands() {
        let (mut printer, out, sim) = printer();
        run(&mut printer, "M104 S400");
        run(&mut printer, "M104 S0");
        run(&mut printer, "M109 S200");
        run(&mut printer, "M105");
        let lines = out.lines();
        assert_eq!(lines[0], "Error: Temperature out of range: 400");
        assert_eq!(lines[1], "ok");
        assert_eq!(lines[2], "ok");
        assert!(lines[3].starts_with("ok T:"));
        assert!(lines[3].ends_with(" /200.00"));
        assert_eq!(sim.world().heater_target(), 200.0);
    }

    #[test]
    fn test_heater_wait_times_out() {
        let (mut printer, out, _) = printer_with(|config| {
            config.simulator.heat_rate = 0.0;
            config.heater.timeout_ms = 20;
        });
        run(&mut printer, "M109 S200");
        assert_eq!(out.lines(), vec!["Error: Heater did not reach 200 in time"]);
    }

    #[test]
    fn test_failed_heater_blocks_dispatch() {
        let (mut printer, out, sim) = printer();
        sim.world().set_heater_working(false);
        run(&mut printer, "G1 X1");
        run(&mut printer, "M114");
        assert_eq!(out.lines(), vec!["Error: Heater not working", "ok X:0.000 Y:0.000 Z:0.000 E:0.000"]);
    }

    #[test]
    fn test_dwell_waits() {
        let (mut printer, out, _) = printer();
        let start = Instant::now();
        run(&mut printer, "G4 P30");
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(out.lines(), vec!["ok"]);
    }

    #[test]
    fn test_fan_and_led_levels() {
        let (mut printer, _, sim) = printer();
        run(&mut printer, "M106 S255");
        assert_eq!(sim.world().fan_level(), 100);
        run(&mut printer, "M106 S128");
        assert_eq!(sim.world().fan_level(), 50);
        run(&mut printer, "M107");
        assert_eq!(sim.world().fan_level(), 0);
        run(&mut printer, "M420 T250");
        assert_eq!(sim.world().led_level(), 100);
    }

    #[test]
    fn test_storage_read_write() {
        let (mut printer, out, _) = printer();
        run(&mut printer, "M618 S80 T2 P4660");
        run(&mut printer, "M619 S80 T2");
        run(&mut printer, "M619 S127 T4");
        let lines = out.lines();
        assert_eq!(lines[0], "ok PT:80 DT:4660");
        assert_eq!(lines[1], "ok PT:80 DT:4660");
        assert!(lines[2].starts_with("Error: Storage range"));
    }

    #[test]
    fn test_idle_notice() {
        let (mut printer, out, _) = printer();
        printer.idle_tick();
        printer.receiver().receive_line("M400");
        printer.idle_tick();
        printer.drain();
        assert_eq!(out.lines(), vec!["wait", "ok"]);
    }
}
