//! Line parser for the printer command language.
//!
//! A line is reduced to a [`Command`]: a bitmask of the parameter letters that were
//! present plus one typed value per letter. Parsing is total. Malformed numbers are
//! dropped, a bad checksum only leaves the valid-checksum flag unset, and blank or
//! comment-only lines produce an empty command.
//!
//! ```text
//! N12 G1 X10.5 Y-3 F1500*93 ; comment
//! ^^^ ^^ ^^^^^ ^^^ ^^^^^ ^^^
//!  |   |   |    |    |    checksum: XOR of every byte before '*'
//!  |   |   |    |    feedrate (float)
//!  |   |   float parameters
//!  |   command number (unsigned)
//!  line number (unsigned, 64-bit)
//! ```

use super::command::{Command, Param};
use crate::config::ProtocolConfig;

/// Parser options.
#[derive(Debug, Clone, PartialEq)]
pub struct ParserConfig {
    pub host_commands: bool,
    pub host_escape: char,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            host_commands: true,
            host_escape: '@',
        }
    }
}

impl From<&ProtocolConfig> for ParserConfig {
    fn from(config: &ProtocolConfig) -> Self {
        Self {
            host_commands: config.host_commands,
            host_escape: config.host_escape,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ValueKind {
    Unsigned,
    Signed,
    Float,
}

fn kind_of(param: Param) -> ValueKind {
    match param {
        Param::G | Param::M | Param::T | Param::N => ValueKind::Unsigned,
        Param::S | Param::P => ValueKind::Signed,
        _ => ValueKind::Float,
    }
}

/// XOR of all bytes.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc ^ b)
}

/// Parse one line of text. Never fails.
pub fn parse_line(line: &str, config: &ParserConfig) -> Command {
    let mut command = Command::default();

    // The checksum covers every byte before '*', leading whitespace included.
    let mut body = line.trim_end_matches(&['\r', '\n'][..]);
    if let Some(comment) = body.find(';') {
        body = &body[..comment];
    }

    if let Some(star) = body.rfind('*') {
        let expected = checksum(&body.as_bytes()[..star]);
        let digits = body[star + 1..].trim();
        let valid = !digits.is_empty()
            && digits.bytes().all(|b| b.is_ascii_digit())
            && digits.parse::<u32>().is_ok_and(|value| value == u32::from(expected));
        command.mark_checksum(valid);
        body = &body[..star];
    }

    let body = body.trim();
    if body.is_empty() {
        return Command::default();
    }

    if config.host_commands && body.starts_with(config.host_escape) {
        let text = body[config.host_escape.len_utf8()..].trim();
        command.set_host_command(text);
        return command;
    }

    let bytes = body.as_bytes();
    let mut seen = [false; Param::LETTERS.len()];
    let mut pos = 0;
    while pos < bytes.len() {
        let letter = bytes[pos] as char;
        pos += 1;
        let Some(param) = Param::from_letter(letter) else {
            continue;
        };
        let slot = param as usize;
        if seen[slot] {
            continue;
        }
        let (stored, consumed) = match kind_of(param) {
            ValueKind::Unsigned => match scan_unsigned(&bytes[pos..]) {
                Some((value, len)) => (value.is_some_and(|v| command.set_unsigned(param, v)), len),
                None => (false, 0),
            },
            ValueKind::Signed => match scan_signed(&bytes[pos..]) {
                Some((value, len)) => (value.is_some_and(|v| command.set_signed(param, v)), len),
                None => (false, 0),
            },
            ValueKind::Float => match scan_float(&bytes[pos..]) {
                Some((value, len)) => (value.is_some_and(|v| command.set_float(param, v)), len),
                None => (false, 0),
            },
        };
        pos += consumed;
        if stored {
            seen[slot] = true;
        }
    }

    command
}

/// Digits at the start of `bytes`. Returns the parsed value (None on overflow) and the
/// number of bytes consumed, or None when there are no digits.
fn scan_unsigned(bytes: &[u8]) -> Option<(Option<u64>, usize)> {
    let len = bytes.iter().take_while(|b| b.is_ascii_digit()).count();
    if len == 0 {
        return None;
    }
    let text = std::str::from_utf8(&bytes[..len]).ok()?;
    Some((text.parse::<u64>().ok(), len))
}

fn scan_signed(bytes: &[u8]) -> Option<(Option<i64>, usize)> {
    let sign = usize::from(matches!(bytes.first(), Some(b'+') | Some(b'-')));
    let digits = bytes[sign..].iter().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }
    let len = sign + digits;
    let text = std::str::from_utf8(&bytes[..len]).ok()?;
    Some((text.parse::<i64>().ok(), len))
}

fn scan_float(bytes: &[u8]) -> Option<(Option<f32>, usize)> {
    let sign = usize::from(matches!(bytes.first(), Some(b'+') | Some(b'-')));
    let int_digits = bytes[sign..].iter().take_while(|b| b.is_ascii_digit()).count();
    let mut len = sign + int_digits;
    let mut frac_digits = 0;
    if bytes.get(len) == Some(&b'.') {
        frac_digits = bytes[len + 1..].iter().take_while(|b| b.is_ascii_digit()).count();
        len += 1 + frac_digits;
    }
    if int_digits + frac_digits == 0 {
        return None;
    }
    let text = std::str::from_utf8(&bytes[..len]).ok()?;
    Some((text.parse::<f32>().ok(), len))
}
