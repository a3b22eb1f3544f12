// Emergency stop: queue drain, single confirmation, interrupted waits

mod common;

use std::time::Duration;

use common::{harness, harness_with, numbered, test_config};
use micro_firmware::gcode::Enqueued;
use micro_firmware::hardware::MemoryStorage;

#[test]
fn test_stop_discards_queued_commands_and_confirms_once() {
    let mut h = harness();
    let mut receiver = h.printer.receiver();
    for line in ["G1 X5", "G1 X6", "M106 S255"] {
        assert_eq!(receiver.receive_line(line), Some(Enqueued::Queued));
    }
    assert_eq!(receiver.receive_line("M112"), Some(Enqueued::EmergencyStop { discarding: 3 }));
    assert!(h.printer.emergency_stop().is_active());

    h.printer.drain();
    assert_eq!(h.out.take(), vec!["ok"]);
    assert!(!h.printer.emergency_stop().is_active());
    assert_eq!(h.printer.motion().position().x, 0.0);
    assert_eq!(h.sim.world().fan_level(), 0);

    // Normal processing resumes.
    assert_eq!(h.send(&["M114"]), vec!["ok X:0.000 Y:0.000 Z:0.000 E:0.000"]);
}

#[test]
fn test_numbered_stop_is_sequenced() {
    let mut h = harness();
    assert_eq!(h.send(&[&numbered(0, "M105")]), vec!["ok N0 T:25.00 /0.00"]);
    assert_eq!(h.send(&[&numbered(1, "M112")]), vec!["ok N1"]);
    assert_eq!(h.printer.protocol().expected(), 2);
    assert_eq!(h.send(&[&numbered(2, "M400")]), vec!["ok N2"]);

    // A resent stop still stops, and is acknowledged as already seen.
    assert_eq!(h.send(&[&numbered(1, "M112")]), vec!["ok N1"]);
    assert_eq!(h.send(&[&numbered(3, "M400")]), vec!["ok N3"]);
    assert_eq!(h.printer.protocol().expected(), 4);
}

#[test]
fn test_stop_on_empty_queue() {
    let mut h = harness();
    assert_eq!(h.send(&["M0"]), vec!["ok"]);
}

#[test]
fn test_commands_after_stop_survive() {
    let mut h = harness();
    let mut receiver = h.printer.receiver();
    receiver.receive_line("G1 X5");
    receiver.receive_line("M112");
    receiver.receive_line("M400");
    h.printer.drain();
    assert_eq!(h.out.take(), vec!["ok", "ok"]);
    assert_eq!(h.printer.motion().position().x, 0.0);
}

#[test]
fn test_idle_notice_is_silent_during_stop() {
    let mut h = harness();
    let mut receiver = h.printer.receiver();
    receiver.receive_line("G1 X5");
    receiver.receive_line("M112");
    h.printer.idle_tick();
    assert!(h.out.lines().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_interrupts_dwell_in_run_loop() {
    let mut config = test_config();
    config.protocol.wait_interval_ms = 60_000;
    let size = config.storage.size;
    let h = harness_with(config, Box::new(MemoryStorage::new(size)));
    let out = h.out.clone();
    let mut receiver = h.printer.receiver();

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let task = tokio::spawn(h.printer.run(async {
        let _ = shutdown_rx.await;
    }));

    receiver.receive(b"G4 S30\nG1 X5\nG1 X6\n");
    tokio::time::sleep(Duration::from_millis(50)).await;
    receiver.receive(b"M112\n");

    let mut waited = Duration::ZERO;
    while out.lines().is_empty() && waited < Duration::from_secs(5) {
        tokio::time::sleep(Duration::from_millis(10)).await;
        waited += Duration::from_millis(10);
    }
    assert_eq!(out.lines(), vec!["ok"]);

    let _ = shutdown_tx.send(());
    task.await.unwrap().unwrap();
}
