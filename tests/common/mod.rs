// Shared setup for the printer-level integration tests
#![allow(dead_code)]

use micro_firmware::gcode::checksum;
use micro_firmware::hardware::{MemoryStorage, Storage};
use micro_firmware::simulator::{RecordingTransport, Simulator};
use micro_firmware::{Config, Printer};

pub struct Harness {
    pub printer: Printer,
    pub out: RecordingTransport,
    pub sim: Simulator,
}

impl Harness {
    /// Send lines and process everything that was queued.
    pub fn send(&mut self, lines: &[&str]) -> Vec<String> {
        let mut receiver = self.printer.receiver();
        for line in lines {
            receiver.receive(format!("{}\n", line).as_bytes());
            self.printer.drain();
        }
        self.out.take()
    }
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.simulator.sensor_noise = 0.0;
    config.heater.poll_ms = 1;
    config
}

pub fn harness_with(config: Config, storage: Box<dyn Storage>) -> Harness {
    let sim = Simulator::new(&config);
    let out = RecordingTransport::new();
    let peripherals = sim.peripherals(Box::new(out.clone()), storage);
    let printer = Printer::new(config, peripherals).expect("printer starts");
    Harness { printer, out, sim }
}

pub fn harness() -> Harness {
    let config = test_config();
    let size = config.storage.size;
    harness_with(config, Box::new(MemoryStorage::new(size)))
}

/// A numbered line with a correct checksum.
pub fn numbered(n: u64, body: &str) -> String {
    let line = format!("N{} {}", n, body);
    format!("{}*{}", line, checksum(line.as_bytes()))
}
