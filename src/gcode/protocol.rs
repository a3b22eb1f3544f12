// src/gcode/protocol.rs - Numbered delivery: acknowledge, resend, skip
use std::fmt;

use super::command::Command;

/// What the sequencing rules decided for one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Run the handler. `line` is the accepted number, if the command carried one.
    Accept { line: Option<u64> },
    /// Already processed; acknowledge without reprocessing.
    Skip { line: u64 },
    /// Ask the sender to resend from `expected`.
    Resend { expected: u64 },
}

/// Expected-line-number bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct DeliveryProtocol {
    expected: u64,
}

impl DeliveryProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expected(&self) -> u64 {
        self.expected
    }

    /// Protocol reset (`M110`): the next accepted line is `line + 1`, or 0 when
    /// no line number was given.
    pub fn reset(&mut self, line: Option<u64>) {
        self.expected = line.map_or(0, |n| n.wrapping_add(1));
        tracing::info!("Line numbering reset, expecting N{}", self.expected);
    }

    /// Apply the sequencing rules. Accepting a numbered command advances the
    /// expected number; every other verdict leaves the state untouched. `M110` is
    /// accepted at any number and performs its reset in the handler.
    pub fn check(&mut self, command: &Command) -> Verdict {
        let Some(line) = command.n() else {
            return Verdict::Accept { line: None };
        };
        if command.has_checksum() && !command.has_valid_checksum() {
            return self.resend();
        }
        if is_reset(command) {
            return Verdict::Accept { line: Some(line) };
        }
        if line < self.expected {
            return Verdict::Skip { line };
        }
        if line > self.expected || !command.has_valid_checksum() {
            return self.resend();
        }
        self.expected = self.expected.wrapping_add(1);
        Verdict::Accept { line: Some(line) }
    }

    fn resend(&self) -> Verdict {
        tracing::warn!("Requesting resend from N{}", self.expected);
        Verdict::Resend { expected: self.expected }
    }
}

fn is_reset(command: &Command) -> bool {
    command.g().is_none() && command.m() == Some(110)
}

/// A line written back to the sender.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// `ok`, optionally followed by data such as `T:215.0`.
    Ok { data: Option<String>, line: Option<u64> },
    Resend { expected: u64 },
    Skip { line: u64 },
    Error { message: String, line: Option<u64> },
    /// Idle notice while nothing is pending.
    Wait,
}

impl Response {
    pub fn ok() -> Self {
        Response::Ok { data: None, line: None }
    }

    /// `ok` followed by report data.
    pub fn ok_with(data: impl Into<String>) -> Self {
        Response::Ok { data: Some(data.into()), line: None }
    }

    pub fn with_line(self, number: Option<u64>) -> Self {
        match self {
            Response::Ok { data, .. } => Response::Ok { data, line: number },
            Response::Error { message, .. } => Response::Error { message, line: number },
            other => other,
        }
    }

    /// Wire form including the newline terminator.
    pub fn to_wire(&self) -> String {
        format!("{}\n", self)
    }
}

impl From<Verdict> for Option<Response> {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Accept { .. } => None,
            Verdict::Skip { line } => Some(Response::Skip { line }),
            Verdict::Resend { expected } => Some(Response::Resend { expected }),
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Ok { data, line } => {
                write!(f, "ok")?;
                if let Some(line) = line {
                    write!(f, " N{}", line)?;
                }
                if let Some(data) = data {
                    write!(f, " {}", data)?;
                }
                Ok(())
            }
            Response::Resend { expected } => write!(f, "rs N{}", expected),
            Response::Skip { line } => write!(f, "skip N{}", line),
            Response::Error { message, line } => {
                write!(f, "Error: {}", message)?;
                if let Some(line) = line {
                    write!(f, " N{}", line)?;
                }
                Ok(())
            }
            Response::Wait => write!(f, "wait"),
        }
    }
}
