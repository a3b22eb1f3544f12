//! Firmware core for a small single-extruder printer.
//!
//! Lines arrive through a [`gcode::CommandReceiver`], are parsed and queued, and the
//! [`Printer`] consumes the queue on its own loop: line-number sequencing, device
//! health checks, dispatch into motion, heater, fan, LED and storage, then one
//! response per command. Hardware sits behind the traits in [`hardware`];
//! [`simulator`] provides a complete simulated machine.

pub mod config;
pub mod gcode;
pub mod geometry;
pub mod hardware;
pub mod motion;
pub mod printer;
pub mod simulator;

pub use config::Config;
pub use printer::{Printer, PrinterError};
