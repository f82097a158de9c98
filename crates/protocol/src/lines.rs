//! Modem control-line bitmasks
//!
//! Three encodings meet in the bridge:
//!
//! - [`HostLines`]: what the USB host sets with `SET_CONTROL_LINE_STATE`
//!   (DTR/RTS, CDC ACM layout).
//! - [`SerialState`]: what the function reports back to the host with the
//!   `SERIAL_STATE` notification (DCD/DSR/RI, CDC ACM layout).
//! - [`ModemLines`]: what the control-channel multiplexer speaks, which uses
//!   the classic `TIOCM_*` layout.
//!
//! Only DTR travels towards the modem; only carrier, ring and DSR travel
//! back to the host.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign, Not};

/// Control lines driven by the USB host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct HostLines(u8);

impl HostLines {
    /// Data terminal ready: host is ready for data r/w
    pub const DTR: Self = Self(1 << 0);
    /// Request to send (unused with full duplex)
    pub const RTS: Self = Self(1 << 1);

    const ALL: u8 = Self::DTR.0 | Self::RTS.0;

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits_truncate(bits: u8) -> Self {
        Self(bits & Self::ALL)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for HostLines {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Serial state reported to the USB host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SerialState(u8);

impl SerialState {
    /// Data carrier detect
    pub const DCD: Self = Self(1 << 0);
    /// Data set ready
    pub const DSR: Self = Self(1 << 1);
    /// Ring indicator
    pub const RI: Self = Self(1 << 3);

    const ALL: u8 = Self::DCD.0 | Self::DSR.0 | Self::RI.0;

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits_truncate(bits: u8) -> Self {
        Self(bits & Self::ALL)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for SerialState {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for SerialState {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Modem lines in the control multiplexer's `TIOCM_*` layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ModemLines(u32);

impl ModemLines {
    pub const DTR: Self = Self(0x002);
    pub const RTS: Self = Self(0x004);
    pub const CD: Self = Self(0x040);
    pub const RI: Self = Self(0x080);
    pub const DSR: Self = Self(0x100);

    const ALL: u32 = Self::DTR.0 | Self::RTS.0 | Self::CD.0 | Self::RI.0 | Self::DSR.0;

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::ALL)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Lines the modem should see for the given host control lines
    pub fn from_host(lines: HostLines) -> Self {
        if lines.contains(HostLines::DTR) {
            Self::DTR
        } else {
            Self::empty()
        }
    }

    /// Serial state the host should see for these modem lines
    pub fn to_serial_state(self) -> SerialState {
        let mut state = SerialState::empty();
        if self.contains(Self::RI) {
            state |= SerialState::RI;
        }
        if self.contains(Self::CD) {
            state |= SerialState::DCD;
        }
        if self.contains(Self::DSR) {
            state |= SerialState::DSR;
        }
        state
    }
}

impl BitOr for ModemLines {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Complement within the defined lines, used as the "clear" mask of a set
impl Not for ModemLines {
    type Output = Self;

    fn not(self) -> Self {
        Self(!self.0 & Self::ALL)
    }
}

impl fmt::Display for ModemLines {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#05x}", self.0)
    }
}

impl fmt::Display for SerialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_dtr_reaches_modem() {
        assert_eq!(ModemLines::from_host(HostLines::DTR), ModemLines::DTR);
        assert_eq!(
            ModemLines::from_host(HostLines::DTR | HostLines::RTS),
            ModemLines::DTR
        );
        assert!(ModemLines::from_host(HostLines::RTS).is_empty());
        assert!(ModemLines::from_host(HostLines::empty()).is_empty());
    }

    #[test]
    fn test_modem_status_to_serial_state() {
        let lines = ModemLines::CD | ModemLines::RI | ModemLines::DSR;
        let state = lines.to_serial_state();
        assert!(state.contains(SerialState::DCD));
        assert!(state.contains(SerialState::RI));
        assert!(state.contains(SerialState::DSR));
        assert_eq!(state.bits(), 0b1011);
    }

    #[test]
    fn test_outgoing_lines_are_not_reported_to_host() {
        let lines = ModemLines::DTR | ModemLines::RTS;
        assert!(lines.to_serial_state().is_empty());
    }

    #[test]
    fn test_clear_mask_is_complement() {
        let clear = !ModemLines::DTR;
        assert!(!clear.contains(ModemLines::DTR));
        assert!(clear.contains(ModemLines::RTS));
        assert!(clear.contains(ModemLines::DSR));
        assert_eq!(!ModemLines::empty(), ModemLines::from_bits_truncate(u32::MAX));
    }

    #[test]
    fn test_truncate_drops_unknown_bits() {
        assert_eq!(HostLines::from_bits_truncate(0xff).bits(), 0x03);
        assert_eq!(SerialState::from_bits_truncate(0xff).bits(), 0x0b);
        assert_eq!(ModemLines::from_bits_truncate(0x1).bits(), 0);
    }
}
