//! Bus addressing.

use std::fmt;

use crate::error::{GpibError, Result};

/// Highest valid primary or secondary address.
pub const MAX_ADDRESS: u8 = 30;

/// Number of board minors linux-gpib creates (`/dev/gpib0` .. `/dev/gpib15`).
pub const MAX_BOARDS: u32 = 16;

/// Offset linux-gpib expects in front of a secondary address.
const SECONDARY_BASE: i32 = 0x60;

/// Whether a session talks to the controller board itself or to a device on its bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    /// Controller board handle (board-level operations)
    Board,
    /// Addressed device handle
    Device,
}

/// Board index plus optional primary/secondary address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    board: u32,
    primary: Option<u8>,
    secondary: Option<u8>,
}

impl Address {
    /// The controller board itself.
    pub fn board(board: u32) -> Result<Self> {
        validate_board(board)?;
        Ok(Self {
            board,
            primary: None,
            secondary: None,
        })
    }

    /// A device at `primary` on `board`.
    pub fn device(board: u32, primary: u8) -> Result<Self> {
        validate_board(board)?;
        validate_address("primary", primary)?;
        Ok(Self {
            board,
            primary: Some(primary),
            secondary: None,
        })
    }

    /// Add a secondary address. Only valid for device addresses.
    pub fn with_secondary(mut self, secondary: u8) -> Result<Self> {
        if self.primary.is_none() {
            return Err(GpibError::InvalidArgument(
                "a secondary address requires a primary address".to_string(),
            ));
        }
        validate_address("secondary", secondary)?;
        self.secondary = Some(secondary);
        Ok(self)
    }

    /// Board index.
    pub fn board_index(&self) -> u32 {
        self.board
    }

    /// Primary address, `None` for a board.
    pub fn primary(&self) -> Option<u8> {
        self.primary
    }

    /// Secondary address, if any.
    pub fn secondary(&self) -> Option<u8> {
        self.secondary
    }

    /// Board or device.
    pub fn kind(&self) -> SessionKind {
        if self.primary.is_some() {
            SessionKind::Device
        } else {
            SessionKind::Board
        }
    }

    /// Secondary address in the form `ibdev`/`ibln` expect: 0 for none,
    /// otherwise `0x60 + sad`.
    pub fn raw_secondary(&self) -> i32 {
        encode_secondary(self.secondary)
    }
}

/// Encode an optional secondary address for the driver.
pub fn encode_secondary(secondary: Option<u8>) -> i32 {
    secondary.map_or(0, |sad| SECONDARY_BASE + i32::from(sad))
}

pub(crate) fn validate_address(which: &str, value: u8) -> Result<()> {
    if value > MAX_ADDRESS {
        return Err(GpibError::InvalidArgument(format!(
            "{} address {} out of range 0..={}",
            which, value, MAX_ADDRESS
        )));
    }
    Ok(())
}

fn validate_board(board: u32) -> Result<()> {
    if board >= MAX_BOARDS {
        return Err(GpibError::InvalidArgument(format!(
            "board index {} out of range 0..{}",
            board, MAX_BOARDS
        )));
    }
    Ok(())
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gpib{}", self.board)?;
        if let Some(pad) = self.primary {
            write!(f, "::{}", pad)?;
        }
        if let Some(sad) = self.secondary {
            write!(f, "::{}", sad)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_address() {
        let addr = Address::device(0, 22).unwrap();
        assert_eq!(addr.kind(), SessionKind::Device);
        assert_eq!(addr.primary(), Some(22));
        assert_eq!(addr.raw_secondary(), 0);
        assert_eq!(addr.to_string(), "gpib0::22");
    }

    #[test]
    fn test_secondary_encoding() {
        let addr = Address::device(1, 5).unwrap().with_secondary(3).unwrap();
        assert_eq!(addr.raw_secondary(), 0x63);
        assert_eq!(addr.to_string(), "gpib1::5::3");
    }

    #[test]
    fn test_rejects_out_of_range() {
        assert!(Address::device(0, 31).is_err());
        assert!(Address::device(0, 1).unwrap().with_secondary(31).is_err());
        assert!(Address::board(MAX_BOARDS).is_err());
    }

    #[test]
    fn test_board_cannot_have_secondary() {
        let err = Address::board(0).unwrap().with_secondary(1).unwrap_err();
        assert!(matches!(err, GpibError::InvalidArgument(_)));
    }
}
