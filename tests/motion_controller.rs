// Homing, probing and compensated moves against the simulated machine

mod common;

use common::{harness, harness_with, test_config, Harness};
use micro_firmware::geometry::Axis;
use micro_firmware::hardware::MemoryStorage;
use micro_firmware::motion::CurrentTier;

fn tilted_bed() -> Harness {
    let mut config = test_config();
    // Planar bed rising 0.3 mm across each axis.
    config.simulator.bed_corners = [0.0, 0.3, 0.3, 0.6];
    let size = config.storage.size;
    harness_with(config, Box::new(MemoryStorage::new(size)))
}

fn near(actual: f32, expected: f32, tolerance: f32) -> bool {
    (actual - expected).abs() <= tolerance
}

#[test]
fn test_homing_finds_the_corner() {
    let mut h = harness();
    assert_eq!(h.send(&["M117"]), vec!["ok XV:0 YV:0 ZV:0"]);
    assert_eq!(h.send(&["G28"]), vec!["ok"]);
    assert_eq!(h.send(&["M117"]), vec!["ok XV:1 YV:1 ZV:0"]);

    let head = h.sim.world().head();
    assert_eq!((head.x, head.y), (0.0, 0.0));
    assert!(h.sim.world().motors_enabled());
}

#[test]
fn test_move_after_homing_lands_on_target() {
    let mut h = harness();
    h.send(&["G28"]);
    assert_eq!(h.send(&["G1 X10 Y10 F3000"]), vec!["ok"]);
    let head = h.sim.world().head();
    assert!(near(head.x, 10.0, 0.06), "x = {}", head.x);
    assert!(near(head.y, 10.0, 0.06), "y = {}", head.y);
    assert_eq!(h.send(&["M114"]), vec!["ok X:10.000 Y:10.000 Z:0.000 E:0.000"]);
}

#[test]
fn test_homing_fails_without_sensor() {
    let mut h = harness();
    h.sim.world().set_sensor_working(false);
    assert_eq!(h.send(&["G28"]), vec!["Error: Accelerometer not working"]);
    assert_eq!(h.send(&["M117"]), vec!["ok XV:0 YV:0 ZV:0"]);
}

#[test]
fn test_calibration_requires_homing() {
    let mut h = harness();
    let lines = h.send(&["G32"]);
    assert_eq!(lines.len(), 1);
    assert!(lines[0].starts_with("Error:"), "{}", lines[0]);
}

#[test]
fn test_calibration_follows_the_bed() {
    let mut h = tilted_bed();
    h.send(&["G28"]);
    assert_eq!(h.send(&["G32"]), vec!["ok"]);
    assert!(h.printer.motion().calibration().is_valid());
    assert!(h.printer.motion().is_valid(Axis::Z));

    // Z0 at the center touches the bed.
    h.send(&["G1 X50 Y50 Z0"]);
    let head = h.sim.world().head();
    let bed = h.sim.world().bed_height(head.x, head.y);
    assert!(near(head.z, bed, 0.08), "center: head {} bed {}", head.z, bed);

    // So does Z0 at a corner, through the fitted plane.
    h.send(&["G1 X12 Y12 Z0"]);
    let head = h.sim.world().head();
    let bed = h.sim.world().bed_height(head.x, head.y);
    assert!(near(head.z, bed, 0.08), "corner: head {} bed {}", head.z, bed);

    // The probed heights are relative to the center.
    let heights = h.printer.motion().calibration().heights();
    assert_eq!(heights[4], 0.0);
    assert!(heights[0] < 0.0 && heights[3] > 0.0);
}

#[test]
fn test_calibration_is_stored() {
    let mut h = tilted_bed();
    h.send(&["G28", "G32"]);
    let lines = h.send(&["M619 S44 T1"]);
    assert_eq!(lines, vec!["ok PT:44 DT:1"]);
}

#[test]
fn test_current_follows_height() {
    let mut h = harness();
    h.send(&["G92 Z0", "G1 Z10"]);
    assert_eq!(h.sim.world().current(), Some(CurrentTier::Low));
    h.send(&["G1 Z50"]);
    assert_eq!(h.sim.world().current(), Some(CurrentTier::Medium));
    h.send(&["G1 Z100"]);
    assert_eq!(h.sim.world().current(), Some(CurrentTier::High));
}

#[test]
fn test_out_of_range_move_is_rejected() {
    let mut h = harness();
    assert_eq!(h.send(&["G1 Y98"]), vec!["Error: Move out of range: Y 98"]);
    assert_eq!(h.sim.world().segments_executed(), 0);
}

#[test]
fn test_disabling_motors_forgets_xy() {
    let mut h = harness();
    h.send(&["G28", "G92 Z4"]);
    assert_eq!(h.send(&["M18"]), vec!["ok"]);
    assert!(!h.sim.world().motors_enabled());
    assert_eq!(h.send(&["M117"]), vec!["ok XV:0 YV:0 ZV:1"]);
}
