//! Driver status decoding.
//!
//! Every linux-gpib call leaves three thread-local values behind: the `ibsta`
//! status word, the `iberr` error code (meaningful only when `ibsta` has the
//! `ERR` bit) and the `ibcnt` transfer count. [`Completion`] captures all three
//! on the worker thread right after the call, and [`Completion::classify`]
//! turns a failed completion into exactly one [`ErrorKind`].
//!
//! The mapping is total: every known error code has a documented kind and any
//! code the library might add later falls back to [`ErrorKind::HardwareFault`].

use std::fmt;

use bitflags::bitflags;

bitflags! {
    /// The `ibsta` status word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Status: u16 {
        /// Device clear received (device mode)
        const DCAS = gpib_sys::DCAS as u16;
        /// Device trigger received (device mode)
        const DTAS = gpib_sys::DTAS as u16;
        /// Board is addressed as listener
        const LACS = gpib_sys::LACS as u16;
        /// Board is addressed as talker
        const TACS = gpib_sys::TACS as u16;
        /// ATN line is asserted
        const ATN = gpib_sys::ATN as u16;
        /// Board is controller-in-charge
        const CIC = gpib_sys::CIC as u16;
        /// Remote state
        const REM = gpib_sys::REM as u16;
        /// Lockout state
        const LOK = gpib_sys::LOK as u16;
        /// I/O completed
        const CMPL = gpib_sys::CMPL as u16;
        /// Clear, trigger or interface clear event received
        const EVENT = gpib_sys::EVENT as u16;
        /// Board has been serial polled
        const SPOLL = gpib_sys::SPOLL as u16;
        /// Device is requesting service
        const RQS = gpib_sys::RQS as u16;
        /// SRQ line is asserted
        const SRQI = gpib_sys::SRQI as u16;
        /// END or EOS detected during read
        const END = gpib_sys::END as u16;
        /// Timeout
        const TIMO = gpib_sys::TIMO as u16;
        /// Error, see `iberr`
        const ERR = gpib_sys::ERR as u16;
    }
}

impl Status {
    /// Decode a raw `ibsta` value, dropping unknown bits.
    pub fn from_raw(raw: i32) -> Self {
        Self::from_bits_truncate(raw as u16)
    }

    /// Whether the call that produced this status failed.
    pub fn is_error(self) -> bool {
        self.contains(Self::ERR)
    }

    /// Whether the call that produced this status timed out.
    pub fn is_timeout(self) -> bool {
        self.contains(Self::TIMO)
    }
}

/// The `iberr` error code of a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverErrorCode {
    /// System error (`EDVR`); the OS errno is in the count field
    SystemError,
    /// Board is not controller-in-charge (`ECIC`)
    NotControllerInCharge,
    /// No listeners on the bus (`ENOL`)
    NoListener,
    /// Board not addressed correctly (`EADR`)
    AddressingFailed,
    /// Invalid argument (`EARG`)
    InvalidArgument,
    /// Board is not system controller (`ESAC`)
    NotSystemController,
    /// I/O operation aborted (`EABO`)
    Aborted,
    /// Board does not exist (`ENEB`)
    NoBoard,
    /// DMA error (`EDMA`)
    Dma,
    /// Asynchronous I/O in progress (`EOIP`)
    AsyncInProgress,
    /// Board lacks the capability (`ECAP`)
    NoCapability,
    /// File system error (`EFSO`)
    FileSystem,
    /// Bus error while sending command bytes (`EBUS`)
    BusCommand,
    /// Serial poll status byte queue overflow (`ESTB`)
    StatusByteLost,
    /// SRQ line stuck on (`ESRQ`)
    SrqStuck,
    /// Table problem (`ETAB`)
    Table,
    /// A code this crate does not know about
    Unknown(i32),
}

impl DriverErrorCode {
    /// Every code linux-gpib documents, in numeric order.
    pub const KNOWN: [DriverErrorCode; 16] = [
        Self::SystemError,
        Self::NotControllerInCharge,
        Self::NoListener,
        Self::AddressingFailed,
        Self::InvalidArgument,
        Self::NotSystemController,
        Self::Aborted,
        Self::NoBoard,
        Self::Dma,
        Self::AsyncInProgress,
        Self::NoCapability,
        Self::FileSystem,
        Self::BusCommand,
        Self::StatusByteLost,
        Self::SrqStuck,
        Self::Table,
    ];

    /// Decode a raw `iberr` value.
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            gpib_sys::EDVR => Self::SystemError,
            gpib_sys::ECIC => Self::NotControllerInCharge,
            gpib_sys::ENOL => Self::NoListener,
            gpib_sys::EADR => Self::AddressingFailed,
            gpib_sys::EARG => Self::InvalidArgument,
            gpib_sys::ESAC => Self::NotSystemController,
            gpib_sys::EABO => Self::Aborted,
            gpib_sys::ENEB => Self::NoBoard,
            gpib_sys::EDMA => Self::Dma,
            gpib_sys::EOIP => Self::AsyncInProgress,
            gpib_sys::ECAP => Self::NoCapability,
            gpib_sys::EFSO => Self::FileSystem,
            gpib_sys::EBUS => Self::BusCommand,
            gpib_sys::ESTB => Self::StatusByteLost,
            gpib_sys::ESRQ => Self::SrqStuck,
            gpib_sys::ETAB => Self::Table,
            other => Self::Unknown(other),
        }
    }

    /// The raw `iberr` value.
    pub fn raw(self) -> i32 {
        match self {
            Self::SystemError => gpib_sys::EDVR,
            Self::NotControllerInCharge => gpib_sys::ECIC,
            Self::NoListener => gpib_sys::ENOL,
            Self::AddressingFailed => gpib_sys::EADR,
            Self::InvalidArgument => gpib_sys::EARG,
            Self::NotSystemController => gpib_sys::ESAC,
            Self::Aborted => gpib_sys::EABO,
            Self::NoBoard => gpib_sys::ENEB,
            Self::Dma => gpib_sys::EDMA,
            Self::AsyncInProgress => gpib_sys::EOIP,
            Self::NoCapability => gpib_sys::ECAP,
            Self::FileSystem => gpib_sys::EFSO,
            Self::BusCommand => gpib_sys::EBUS,
            Self::StatusByteLost => gpib_sys::ESTB,
            Self::SrqStuck => gpib_sys::ESRQ,
            Self::Table => gpib_sys::ETAB,
            Self::Unknown(raw) => raw,
        }
    }

    /// The error kind this code is reported as when the call did not time out.
    pub fn kind(self) -> ErrorKind {
        match self {
            Self::NoListener | Self::AddressingFailed => ErrorKind::Addressing,
            Self::NotControllerInCharge
            | Self::NotSystemController
            | Self::Aborted
            | Self::AsyncInProgress
            | Self::BusCommand
            | Self::StatusByteLost
            | Self::SrqStuck
            | Self::Table => ErrorKind::Bus,
            Self::InvalidArgument | Self::NoCapability => ErrorKind::InvalidArgument,
            Self::SystemError | Self::NoBoard | Self::Dma | Self::FileSystem | Self::Unknown(_) => {
                ErrorKind::HardwareFault
            }
        }
    }

    /// Short description, as in the linux-gpib manual.
    pub fn description(self) -> &'static str {
        match self {
            Self::SystemError => "system error",
            Self::NotControllerInCharge => "board is not controller-in-charge",
            Self::NoListener => "no listeners on the bus",
            Self::AddressingFailed => "board not addressed correctly",
            Self::InvalidArgument => "invalid argument",
            Self::NotSystemController => "board is not system controller",
            Self::Aborted => "I/O operation aborted",
            Self::NoBoard => "GPIB board does not exist",
            Self::Dma => "DMA error",
            Self::AsyncInProgress => "asynchronous I/O in progress",
            Self::NoCapability => "board lacks the requested capability",
            Self::FileSystem => "file system error",
            Self::BusCommand => "bus error while sending command bytes",
            Self::StatusByteLost => "serial poll status byte lost",
            Self::SrqStuck => "SRQ line stuck",
            Self::Table => "table problem",
            Self::Unknown(_) => "unknown driver error",
        }
    }
}

impl fmt::Display for DriverErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(raw) => write!(f, "{} ({})", self.description(), raw),
            _ => f.write_str(self.description()),
        }
    }
}

/// Semantic outcome of a failed driver call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No valid handle; nothing was sent
    NotConnected,
    /// The driver-level timeout elapsed
    Timeout,
    /// Nobody answered at the address, or addressing failed
    Addressing,
    /// Arbitration or protocol violation on the bus
    Bus,
    /// The handle or board is unusable; the session is faulted
    HardwareFault,
    /// The caller or the driver rejected an argument
    InvalidArgument,
    /// The operation is not allowed in the current lifecycle state
    InvalidState,
    /// The caller stopped waiting
    Cancelled,
    /// Configuration could not be loaded or is invalid
    Config,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotConnected => "not connected",
            Self::Timeout => "timeout",
            Self::Addressing => "addressing error",
            Self::Bus => "bus error",
            Self::HardwareFault => "hardware fault",
            Self::InvalidArgument => "invalid argument",
            Self::InvalidState => "invalid state",
            Self::Cancelled => "cancelled",
            Self::Config => "configuration error",
        };
        f.write_str(name)
    }
}

/// Snapshot of `ibsta`/`iberr`/`ibcnt` taken right after one driver call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Completion {
    /// The status word
    pub status: Status,
    /// Raw `iberr`; only meaningful when `status` has `ERR`
    pub error: i32,
    /// Bytes transferred (or the OS errno after `EDVR`)
    pub count: usize,
}

impl Completion {
    /// A successful completion that moved `count` bytes.
    pub fn ok(count: usize) -> Self {
        Self {
            status: Status::CMPL,
            error: 0,
            count,
        }
    }

    /// A successful completion with extra status bits (e.g. `END`).
    pub fn ok_with(status: Status, count: usize) -> Self {
        Self {
            status: status | Status::CMPL,
            error: 0,
            count,
        }
    }

    /// A failed completion with the given error code.
    pub fn failed(code: DriverErrorCode, count: usize) -> Self {
        Self {
            status: Status::ERR,
            error: code.raw(),
            count,
        }
    }

    /// A timed-out completion. linux-gpib reports these as `ERR | TIMO` with `EABO`.
    pub fn timed_out(count: usize) -> Self {
        Self {
            status: Status::ERR | Status::TIMO,
            error: gpib_sys::EABO,
            count,
        }
    }

    /// Build from the raw thread-local values.
    pub fn from_raw(ibsta: i32, iberr: i32, ibcnt: i64) -> Self {
        Self {
            status: Status::from_raw(ibsta),
            error: iberr,
            count: usize::try_from(ibcnt).unwrap_or(0),
        }
    }

    /// Whether the call failed.
    pub fn is_error(&self) -> bool {
        self.status.is_error()
    }

    /// The decoded error code, if the call failed.
    pub fn error_code(&self) -> Option<DriverErrorCode> {
        self.is_error()
            .then(|| DriverErrorCode::from_raw(self.error))
    }

    /// Classify a completion. `None` means success.
    ///
    /// `TIMO` takes precedence over the error code, since linux-gpib reports
    /// a timeout as an aborted operation.
    pub fn classify(&self) -> Option<ErrorKind> {
        if self.status.is_timeout() {
            return Some(ErrorKind::Timeout);
        }
        self.error_code().map(DriverErrorCode::kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_raw_truncates() {
        let status = Status::from_raw(0x8000 | 0x4000 | 0x10000);
        assert!(status.is_error());
        assert!(status.is_timeout());
        assert_eq!(status.bits(), 0xC000);
    }

    #[test]
    fn test_error_code_raw_roundtrip_for_known_codes() {
        for code in DriverErrorCode::KNOWN {
            assert_eq!(DriverErrorCode::from_raw(code.raw()), code);
        }
        assert_eq!(DriverErrorCode::from_raw(9), DriverErrorCode::Unknown(9));
    }

    #[test]
    fn test_timeout_wins_over_error_code() {
        let completion = Completion::timed_out(12);
        assert_eq!(completion.classify(), Some(ErrorKind::Timeout));
        assert_eq!(completion.count, 12);
    }

    #[test]
    fn test_success_is_unclassified() {
        assert_eq!(Completion::ok(4).classify(), None);
        assert_eq!(Completion::ok_with(Status::END, 4).classify(), None);
        // A stale iberr without ERR is ignored
        let stale = Completion {
            status: Status::CMPL,
            error: gpib_sys::ENOL,
            count: 0,
        };
        assert_eq!(stale.classify(), None);
    }

    #[test]
    fn test_from_raw_negative_count() {
        let completion = Completion::from_raw(gpib_sys::CMPL, 0, -1);
        assert_eq!(completion.count, 0);
    }

    #[test]
    fn test_unknown_code_display_keeps_value() {
        let code = DriverErrorCode::Unknown(42);
        assert!(code.to_string().contains("42"));
        assert_eq!(code.kind(), ErrorKind::HardwareFault);
    }
}
