//! End-of-string (EOS) termination policy.
//!
//! The driver packs the EOS byte and the mode bits into one integer: the low
//! byte is the character, `REOS`/`XEOS`/`BIN` sit above it.

use bitflags::bitflags;

bitflags! {
    /// How the EOS character is used.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EosMode: u16 {
        /// Terminate reads when the EOS character is received
        const REOS = gpib_sys::REOS as u16;
        /// Assert EOI whenever the EOS character is sent
        const XEOS = gpib_sys::XEOS as u16;
        /// Compare all 8 bits of the EOS character, not just the low 7
        const BIN = gpib_sys::BIN as u16;
    }
}

impl EosMode {
    /// Parse a mode name as used in configuration files.
    pub fn from_config_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "reos" => Some(Self::REOS),
            "xeos" => Some(Self::XEOS),
            "bin" => Some(Self::BIN),
            _ => None,
        }
    }
}

/// EOS character and mode for a session.
///
/// The default matches a plain linux-gpib device: character `\0`, no mode bits,
/// so reads end on EOI or on a full buffer only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EosPolicy {
    /// The termination byte
    pub character: u8,
    /// Mode bits
    pub mode: EosMode,
}

impl EosPolicy {
    /// No EOS handling.
    pub const NONE: EosPolicy = EosPolicy {
        character: 0,
        mode: EosMode::empty(),
    };

    /// Terminate reads on `character`.
    pub fn read_until(character: u8) -> Self {
        Self {
            character,
            mode: EosMode::REOS,
        }
    }

    /// Add mode bits.
    pub fn with_mode(mut self, mode: EosMode) -> Self {
        self.mode |= mode;
        self
    }

    /// The packed value passed to `ibdev` and `ibconfig(IbcEOS*)`.
    pub fn raw(self) -> i32 {
        i32::from(self.character) | i32::from(self.mode.bits())
    }

    /// Whether reads stop early on the EOS character.
    pub fn terminates_reads(self) -> bool {
        self.mode.contains(EosMode::REOS)
    }

    /// Whether `byte` matches the EOS character under this policy.
    pub fn matches(self, byte: u8) -> bool {
        if self.mode.contains(EosMode::BIN) {
            byte == self.character
        } else {
            (byte & 0x7f) == (self.character & 0x7f)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packed_value() {
        let policy = EosPolicy::read_until(b'\n');
        assert_eq!(policy.raw(), 0x400 | 0x0a);

        let policy = policy.with_mode(EosMode::BIN | EosMode::XEOS);
        assert_eq!(policy.raw(), 0x400 | 0x800 | 0x1000 | 0x0a);
        assert_eq!(EosPolicy::NONE.raw(), 0);
    }

    #[test]
    fn test_seven_bit_match() {
        let policy = EosPolicy::read_until(b'\n');
        assert!(policy.matches(b'\n'));
        assert!(policy.matches(b'\n' | 0x80));

        let binary = policy.with_mode(EosMode::BIN);
        assert!(!binary.matches(b'\n' | 0x80));
    }

    #[test]
    fn test_mode_names() {
        assert_eq!(EosMode::from_config_name("REOS"), Some(EosMode::REOS));
        assert_eq!(EosMode::from_config_name("bin"), Some(EosMode::BIN));
        assert_eq!(EosMode::from_config_name("eoi"), None);
    }
}
