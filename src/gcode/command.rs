// src/gcode/command.rs - One parsed command line

use std::fmt;

/// Parameter letters understood by the parser, plus the two flags that are not letters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    G,
    M,
    T,
    S,
    P,
    X,
    Y,
    Z,
    F,
    E,
    N,
    HostCommand,
    ValidChecksum,
}

impl Param {
    /// Letters that start a numeric token, in mask order.
    pub const LETTERS: [Param; 11] = [
        Param::G,
        Param::M,
        Param::T,
        Param::S,
        Param::P,
        Param::X,
        Param::Y,
        Param::Z,
        Param::F,
        Param::E,
        Param::N,
    ];

    pub fn from_letter(c: char) -> Option<Param> {
        match c.to_ascii_uppercase() {
            'G' => Some(Param::G),
            'M' => Some(Param::M),
            'T' => Some(Param::T),
            'S' => Some(Param::S),
            'P' => Some(Param::P),
            'X' => Some(Param::X),
            'Y' => Some(Param::Y),
            'Z' => Some(Param::Z),
            'F' => Some(Param::F),
            'E' => Some(Param::E),
            'N' => Some(Param::N),
            _ => None,
        }
    }

    const fn bit(self) -> u16 {
        1 << (self as u16)
    }
}

/// Bitmask of the parameters present in a [`Command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ParamMask(u16);

impl ParamMask {
    pub const EMPTY: ParamMask = ParamMask(0);

    pub fn contains(&self, param: Param) -> bool {
        self.0 & param.bit() != 0
    }

    pub fn insert(&mut self, param: Param) {
        self.0 |= param.bit();
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn bits(&self) -> u16 {
        self.0
    }
}

/// A parsed line. A value is meaningful only when its bit is set in the mask;
/// the accessors enforce that by returning `Option`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Command {
    mask: ParamMask,
    g: u16,
    m: u16,
    t: u8,
    s: i32,
    p: i32,
    x: f32,
    y: f32,
    z: f32,
    f: f32,
    e: f32,
    n: u64,
    host: Option<String>,
    /// A `*` checksum marker was present, whether or not it matched.
    checksum_seen: bool,
}

macro_rules! accessor {
    ($name:ident, $ty:ty, $param:expr) => {
        pub fn $name(&self) -> Option<$ty> {
            self.mask.contains($param).then_some(self.$name)
        }
    };
}

impl Command {
    accessor!(g, u16, Param::G);
    accessor!(m, u16, Param::M);
    accessor!(t, u8, Param::T);
    accessor!(s, i32, Param::S);
    accessor!(p, i32, Param::P);
    accessor!(x, f32, Param::X);
    accessor!(y, f32, Param::Y);
    accessor!(z, f32, Param::Z);
    accessor!(f, f32, Param::F);
    accessor!(e, f32, Param::E);
    accessor!(n, u64, Param::N);

    pub fn mask(&self) -> ParamMask {
        self.mask
    }

    pub fn has(&self, param: Param) -> bool {
        self.mask.contains(param)
    }

    pub fn is_empty(&self) -> bool {
        self.mask.is_empty()
    }

    pub fn host_command(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn has_valid_checksum(&self) -> bool {
        self.has(Param::ValidChecksum)
    }

    pub fn has_checksum(&self) -> bool {
        self.checksum_seen
    }

    /// `M0` and `M112` bypass the queue and trigger the emergency stop.
    pub fn is_emergency_stop(&self) -> bool {
        self.g().is_none() && matches!(self.m(), Some(0) | Some(112))
    }

    pub(crate) fn set_unsigned(&mut self, param: Param, value: u64) -> bool {
        let stored = match param {
            Param::G => u16::try_from(value).map(|v| self.g = v).is_ok(),
            Param::M => u16::try_from(value).map(|v| self.m = v).is_ok(),
            Param::T => u8::try_from(value).map(|v| self.t = v).is_ok(),
            Param::N => {
                self.n = value;
                true
            }
            _ => false,
        };
        if stored {
            self.mask.insert(param);
        }
        stored
    }

    pub(crate) fn set_signed(&mut self, param: Param, value: i64) -> bool {
        let stored = match param {
            Param::S => i32::try_from(value).map(|v| self.s = v).is_ok(),
            Param::P => i32::try_from(value).map(|v| self.p = v).is_ok(),
            _ => false,
        };
        if stored {
            self.mask.insert(param);
        }
        stored
    }

    pub(crate) fn set_float(&mut self, param: Param, value: f32) -> bool {
        if !value.is_finite() {
            return false;
        }
        match param {
            Param::X => self.x = value,
            Param::Y => self.y = value,
            Param::Z => self.z = value,
            Param::F => self.f = value,
            Param::E => self.e = value,
            _ => return false,
        }
        self.mask.insert(param);
        true
    }

    pub(crate) fn set_host_command(&mut self, text: &str) {
        self.host = Some(text.to_string());
        self.mask.insert(Param::HostCommand);
    }

    pub(crate) fn mark_checksum(&mut self, valid: bool) {
        self.checksum_seen = true;
        if valid {
            self.mask.insert(Param::ValidChecksum);
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(host) = &self.host {
            return write!(f, "@{}", host);
        }
        let mut words = Vec::new();
        if let Some(n) = self.n() {
            words.push(format!("N{}", n));
        }
        if let Some(g) = self.g() {
            words.push(format!("G{}", g));
        }
        if let Some(m) = self.m() {
            words.push(format!("M{}", m));
        }
        if let Some(t) = self.t() {
            words.push(format!("T{}", t));
        }
        if let Some(s) = self.s() {
            words.push(format!("S{}", s));
        }
        if let Some(p) = self.p() {
            words.push(format!("P{}", p));
        }
        for (value, letter) in [(self.x(), 'X'), (self.y(), 'Y'), (self.z(), 'Z'), (self.e(), 'E'), (self.f(), 'F')] {
            if let Some(v) = value {
                words.push(format!("{}{}", letter, v));
            }
        }
        write!(f, "{}", words.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessors_follow_mask() {
        let mut cmd = Command::default();
        assert!(cmd.is_empty());
        assert_eq!(cmd.x(), None);
        assert!(cmd.set_float(Param::X, 12.5));
        assert_eq!(cmd.x(), Some(12.5));
        assert_eq!(cmd.y(), None);
        assert!(cmd.has(Param::X));
        assert!(!cmd.is_empty());
    }

    #[test]
    fn test_out_of_range_values_are_not_stored() {
        let mut cmd = Command::default();
        assert!(!cmd.set_unsigned(Param::T, 300));
        assert_eq!(cmd.t(), None);
        assert!(!cmd.set_signed(Param::S, i64::MAX));
        assert_eq!(cmd.s(), None);
        assert!(!cmd.set_float(Param::E, f32::INFINITY));
        assert!(cmd.is_empty());
    }

    #[test]
    fn test_emergency_stop_detection() {
        let mut cmd = Command::default();
        cmd.set_unsigned(Param::M, 112);
        assert!(cmd.is_emergency_stop());
        let mut cmd = Command::default();
        cmd.set_unsigned(Param::M, 0);
        assert!(cmd.is_emergency_stop());
        let mut cmd = Command::default();
        cmd.set_unsigned(Param::M, 104);
        assert!(!cmd.is_emergency_stop());
    }

    #[test]
    fn test_display() {
        let mut cmd = Command::default();
        cmd.set_unsigned(Param::N, 7);
        cmd.set_unsigned(Param::G, 1);
        cmd.set_float(Param::X, 10.0);
        assert_eq!(cmd.to_string(), "N7 G1 X10");
    }
}
