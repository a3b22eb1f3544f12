// Parser behaviour on arbitrary and checksummed input

use micro_firmware::gcode::{checksum, parse_line, Param, ParserConfig};
use proptest::prelude::*;

fn parse(line: &str) -> micro_firmware::gcode::Command {
    parse_line(line, &ParserConfig::default())
}

#[test]
fn test_full_line() {
    let body = "N12 G1 X10.5 Y-3 Z0.2 E1.25 F1500";
    let command = parse(&format!("{}*{} ; perimeter", body, checksum(body.as_bytes())));
    assert_eq!(command.n(), Some(12));
    assert_eq!(command.g(), Some(1));
    assert_eq!(command.x(), Some(10.5));
    assert_eq!(command.y(), Some(-3.0));
    assert_eq!(command.z(), Some(0.2));
    assert_eq!(command.e(), Some(1.25));
    assert_eq!(command.f(), Some(1500.0));
    assert!(command.has_valid_checksum());
}

#[test]
fn test_comment_and_blank_lines_are_empty() {
    assert!(parse("").is_empty());
    assert!(parse("   ").is_empty());
    assert!(parse("; only a comment").is_empty());
}

#[test]
fn test_malformed_numbers_are_dropped() {
    let command = parse("G1 X1.2.3 Yabc Z4");
    assert_eq!(command.g(), Some(1));
    assert_eq!(command.z(), Some(4.0));
    assert!(!command.has(Param::Y));
}

#[test]
fn test_host_command_escape() {
    let command = parse("@pause now");
    assert_eq!(command.host_command(), Some("pause now"));

    let disabled = ParserConfig { host_commands: false, ..ParserConfig::default() };
    assert!(parse_line("@pause now", &disabled).host_command().is_none());
}

proptest! {
    #[test]
    fn parse_never_panics(line in ".{0,120}") {
        let _ = parse(&line);
    }

    #[test]
    fn generated_checksums_validate(n in 0u64..1_000_000, x in -500i32..500, f in 1u32..10_000) {
        let body = format!("N{} G1 X{} F{}", n, x, f);
        let command = parse(&format!("{}*{}", body, checksum(body.as_bytes())));
        prop_assert!(command.has_valid_checksum());
        prop_assert_eq!(command.n(), Some(n));
        prop_assert_eq!(command.x(), Some(x as f32));
    }

    #[test]
    fn wrong_checksums_are_rejected(n in 0u64..1_000_000, delta in 1u16..256) {
        let body = format!("N{} M105", n);
        let wrong = (u16::from(checksum(body.as_bytes())) + delta) % 256;
        let command = parse(&format!("{}*{}", body, wrong));
        prop_assert!(command.has_checksum());
        prop_assert!(!command.has_valid_checksum());
    }
}
