//! Synchronous driver seam.
//!
//! [`GpibDriver`] is the blocking collaborator a session drives through the
//! offload bridge. Each method performs one library call and returns the
//! [`Completion`] captured on the calling thread, together with any output
//! value. Implementations never translate status; that is the session's job.
//!
//! [`LinuxGpib`] is the real implementation over `gpib-sys`. Tests and demos
//! use [`MockDriver`](crate::mock::MockDriver).

use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_long, c_short, c_void};

use bitflags::bitflags;

use crate::status::{Completion, Status};
use crate::timeout::Timeout;

/// Driver-issued descriptor for an open board or device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(pub i32);

impl Handle {
    /// Whether the driver returned a usable descriptor.
    pub fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

/// Parameters for opening a device descriptor (`ibdev`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceParams {
    /// Board index
    pub board: u32,
    /// Primary address
    pub primary: u8,
    /// Secondary address, already encoded (0 or `0x60 + sad`)
    pub secondary: i32,
    /// Initial I/O timeout
    pub timeout: Timeout,
    /// Assert EOI with the last byte of each write
    pub send_eoi: bool,
    /// Packed EOS character and mode
    pub eos: i32,
}

/// Options accepted by `ibask` and `ibconfig`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum ConfigOption {
    PrimaryAddress,
    SecondaryAddress,
    Timeout,
    SendEoi,
    ParallelPollConfig,
    Readdressing,
    AutoPoll,
    CicProtocol,
    Irq,
    SystemController,
    RemoteEnable,
    EosRead,
    EosWrite,
    EosCompareBinary,
    EosChar,
    ParallelPollMode2,
    Timing,
    Dma,
    ReadAdjust,
    WriteAdjust,
    EventQueue,
    SerialPollBit,
    SendLocalLockout,
    SerialPollTime,
    ParallelPollTime,
    EndBitIsNormal,
    Unaddress,
    HighSpeedCableLength,
    IndividualStatus,
    RequestService,
    BoardNumber,
}

impl ConfigOption {
    /// The raw `Iba*`/`Ibc*` code.
    pub fn raw(self) -> i32 {
        match self {
            Self::PrimaryAddress => gpib_sys::IbcPAD,
            Self::SecondaryAddress => gpib_sys::IbcSAD,
            Self::Timeout => gpib_sys::IbcTMO,
            Self::SendEoi => gpib_sys::IbcEOT,
            Self::ParallelPollConfig => gpib_sys::IbcPPC,
            Self::Readdressing => gpib_sys::IbcREADDR,
            Self::AutoPoll => gpib_sys::IbcAUTOPOLL,
            Self::CicProtocol => gpib_sys::IbcCICPROT,
            Self::Irq => gpib_sys::IbcIRQ,
            Self::SystemController => gpib_sys::IbcSC,
            Self::RemoteEnable => gpib_sys::IbcSRE,
            Self::EosRead => gpib_sys::IbcEOSrd,
            Self::EosWrite => gpib_sys::IbcEOSwrt,
            Self::EosCompareBinary => gpib_sys::IbcEOScmp,
            Self::EosChar => gpib_sys::IbcEOSchar,
            Self::ParallelPollMode2 => gpib_sys::IbcPP2,
            Self::Timing => gpib_sys::IbcTIMING,
            Self::Dma => gpib_sys::IbcDMA,
            Self::ReadAdjust => gpib_sys::IbcReadAdjust,
            Self::WriteAdjust => gpib_sys::IbcWriteAdjust,
            Self::EventQueue => gpib_sys::IbcEventQueue,
            Self::SerialPollBit => gpib_sys::IbcSPollBit,
            Self::SendLocalLockout => gpib_sys::IbcSendLLO,
            Self::SerialPollTime => gpib_sys::IbcSPollTime,
            Self::ParallelPollTime => gpib_sys::IbcPPollTime,
            Self::EndBitIsNormal => gpib_sys::IbcEndBitIsNormal,
            Self::Unaddress => gpib_sys::IbcUnAddr,
            Self::HighSpeedCableLength => gpib_sys::IbcHSCableLength,
            Self::IndividualStatus => gpib_sys::IbcIst,
            Self::RequestService => gpib_sys::IbcRsv,
            Self::BoardNumber => gpib_sys::IbcBNA,
        }
    }
}

bitflags! {
    /// Control and handshake line status from `iblines`.
    ///
    /// The low byte says which lines the board can monitor, the high byte
    /// which of those are currently asserted.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BusLines: u16 {
        #[allow(missing_docs)]
        const VALID_DAV = gpib_sys::ValidDAV as u16;
        #[allow(missing_docs)]
        const VALID_NDAC = gpib_sys::ValidNDAC as u16;
        #[allow(missing_docs)]
        const VALID_NRFD = gpib_sys::ValidNRFD as u16;
        #[allow(missing_docs)]
        const VALID_IFC = gpib_sys::ValidIFC as u16;
        #[allow(missing_docs)]
        const VALID_REN = gpib_sys::ValidREN as u16;
        #[allow(missing_docs)]
        const VALID_SRQ = gpib_sys::ValidSRQ as u16;
        #[allow(missing_docs)]
        const VALID_ATN = gpib_sys::ValidATN as u16;
        #[allow(missing_docs)]
        const VALID_EOI = gpib_sys::ValidEOI as u16;
        #[allow(missing_docs)]
        const DAV = gpib_sys::BusDAV as u16;
        #[allow(missing_docs)]
        const NDAC = gpib_sys::BusNDAC as u16;
        #[allow(missing_docs)]
        const NRFD = gpib_sys::BusNRFD as u16;
        #[allow(missing_docs)]
        const IFC = gpib_sys::BusIFC as u16;
        #[allow(missing_docs)]
        const REN = gpib_sys::BusREN as u16;
        #[allow(missing_docs)]
        const SRQ = gpib_sys::BusSRQ as u16;
        #[allow(missing_docs)]
        const ATN = gpib_sys::BusATN as u16;
        #[allow(missing_docs)]
        const EOI = gpib_sys::BusEOI as u16;
    }
}

/// Blocking GPIB driver operations.
///
/// Implementations must be callable from any worker thread. A session never
/// issues two calls for the same handle at once, but different sessions may
/// call into the same driver concurrently.
pub trait GpibDriver: Send + Sync + 'static {
    /// Open a device descriptor (`ibdev`).
    fn open_device(&self, params: &DeviceParams) -> (Handle, Completion);

    /// Open the board descriptor for `board` and verify it is present.
    fn open_board(&self, board: u32) -> (Handle, Completion);

    /// Release a descriptor (`ibonl(ud, 0)`).
    fn close(&self, handle: Handle) -> Completion;

    /// Write data bytes (`ibwrt`).
    fn write(&self, handle: Handle, data: &[u8]) -> Completion;

    /// Read up to `buf.len()` bytes (`ibrd`); `count` says how many arrived.
    fn read(&self, handle: Handle, buf: &mut [u8]) -> Completion;

    /// Write command bytes with ATN asserted (`ibcmd`).
    fn command(&self, handle: Handle, data: &[u8]) -> Completion;

    /// Selective device clear (`ibclr`).
    fn clear(&self, handle: Handle) -> Completion;

    /// Interface clear (`ibsic`).
    fn interface_clear(&self, handle: Handle) -> Completion;

    /// Assert or release REN (`ibsre`).
    fn remote_enable(&self, handle: Handle, enable: bool) -> Completion;

    /// Serial poll (`ibrsp`).
    fn serial_poll(&self, handle: Handle) -> (u8, Completion);

    /// Group execute trigger (`ibtrg`).
    fn trigger(&self, handle: Handle) -> Completion;

    /// Go to local (`ibloc`).
    fn go_to_local(&self, handle: Handle) -> Completion;

    /// Set the I/O timeout (`ibtmo`).
    fn set_timeout(&self, handle: Handle, timeout: Timeout) -> Completion;

    /// Enable or disable EOI on the last write byte (`ibeot`).
    fn set_eot(&self, handle: Handle, send_eoi: bool) -> Completion;

    /// Query a configuration value (`ibask`).
    fn ask(&self, handle: Handle, option: ConfigOption) -> (i32, Completion);

    /// Change a configuration value (`ibconfig`).
    fn config(&self, handle: Handle, option: ConfigOption, value: i32) -> Completion;

    /// Check for a listener at an address (`ibln`).
    fn listener(&self, handle: Handle, primary: u8, secondary: i32) -> (bool, Completion);

    /// Read the control line status (`iblines`).
    fn lines(&self, handle: Handle) -> (BusLines, Completion);

    /// Wait for any of the status bits in `mask` (`ibwait`).
    fn wait(&self, handle: Handle, mask: Status) -> Completion;

    /// Library version string (`ibvers`).
    fn version(&self) -> String;
}

/// The linux-gpib user-space library.
///
/// Without the `hardware` feature every call reports "no GPIB board".
#[derive(Debug, Clone, Copy, Default)]
pub struct LinuxGpib;

impl LinuxGpib {
    /// Whether this build links the real `libgpib` rather than the stubs.
    pub const fn is_linked() -> bool {
        gpib_sys::sdk_linked()
    }

    /// Read the thread-local status left behind by the last call on this thread.
    #[allow(unsafe_code)]
    fn completion() -> Completion {
        // SAFETY: plain reads of thread-local driver state
        unsafe {
            Completion::from_raw(
                gpib_sys::ThreadIbsta(),
                gpib_sys::ThreadIberr(),
                i64::from(gpib_sys::ThreadIbcntl()),
            )
        }
    }
}

#[allow(unsafe_code)]
impl GpibDriver for LinuxGpib {
    fn open_device(&self, params: &DeviceParams) -> (Handle, Completion) {
        // SAFETY: scalar arguments only
        let ud = unsafe {
            gpib_sys::ibdev(
                params.board as c_int,
                c_int::from(params.primary),
                params.secondary,
                params.timeout.raw(),
                c_int::from(params.send_eoi),
                params.eos,
            )
        };
        (Handle(ud), Self::completion())
    }

    fn open_board(&self, board: u32) -> (Handle, Completion) {
        // Board descriptors are the board index itself; asking for the
        // board's primary address confirms the minor exists and is configured.
        let ud = board as c_int;
        let mut value: c_int = 0;
        // SAFETY: value outlives the call
        unsafe { gpib_sys::ibask(ud, gpib_sys::IbcPAD, &mut value) };
        (Handle(ud), Self::completion())
    }

    fn close(&self, handle: Handle) -> Completion {
        // SAFETY: scalar arguments only
        unsafe { gpib_sys::ibonl(handle.0, 0) };
        Self::completion()
    }

    fn write(&self, handle: Handle, data: &[u8]) -> Completion {
        // SAFETY: data is valid for data.len() bytes for the duration of the call
        unsafe {
            gpib_sys::ibwrt(
                handle.0,
                data.as_ptr() as *const c_void,
                data.len() as c_long,
            )
        };
        Self::completion()
    }

    fn read(&self, handle: Handle, buf: &mut [u8]) -> Completion {
        // SAFETY: buf is valid for writes of buf.len() bytes
        unsafe {
            gpib_sys::ibrd(
                handle.0,
                buf.as_mut_ptr() as *mut c_void,
                buf.len() as c_long,
            )
        };
        let mut completion = Self::completion();
        completion.count = completion.count.min(buf.len());
        completion
    }

    fn command(&self, handle: Handle, data: &[u8]) -> Completion {
        // SAFETY: data is valid for data.len() bytes for the duration of the call
        unsafe {
            gpib_sys::ibcmd(
                handle.0,
                data.as_ptr() as *const c_void,
                data.len() as c_long,
            )
        };
        Self::completion()
    }

    fn clear(&self, handle: Handle) -> Completion {
        // SAFETY: scalar arguments only
        unsafe { gpib_sys::ibclr(handle.0) };
        Self::completion()
    }

    fn interface_clear(&self, handle: Handle) -> Completion {
        // SAFETY: scalar arguments only
        unsafe { gpib_sys::ibsic(handle.0) };
        Self::completion()
    }

    fn remote_enable(&self, handle: Handle, enable: bool) -> Completion {
        // SAFETY: scalar arguments only
        unsafe { gpib_sys::ibsre(handle.0, c_int::from(enable)) };
        Self::completion()
    }

    fn serial_poll(&self, handle: Handle) -> (u8, Completion) {
        let mut byte: c_char = 0;
        // SAFETY: byte outlives the call
        unsafe { gpib_sys::ibrsp(handle.0, &mut byte) };
        (byte as u8, Self::completion())
    }

    fn trigger(&self, handle: Handle) -> Completion {
        // SAFETY: scalar arguments only
        unsafe { gpib_sys::ibtrg(handle.0) };
        Self::completion()
    }

    fn go_to_local(&self, handle: Handle) -> Completion {
        // SAFETY: scalar arguments only
        unsafe { gpib_sys::ibloc(handle.0) };
        Self::completion()
    }

    fn set_timeout(&self, handle: Handle, timeout: Timeout) -> Completion {
        // SAFETY: scalar arguments only
        unsafe { gpib_sys::ibtmo(handle.0, timeout.raw()) };
        Self::completion()
    }

    fn set_eot(&self, handle: Handle, send_eoi: bool) -> Completion {
        // SAFETY: scalar arguments only
        unsafe { gpib_sys::ibeot(handle.0, c_int::from(send_eoi)) };
        Self::completion()
    }

    fn ask(&self, handle: Handle, option: ConfigOption) -> (i32, Completion) {
        let mut value: c_int = 0;
        // SAFETY: value outlives the call
        unsafe { gpib_sys::ibask(handle.0, option.raw(), &mut value) };
        (value, Self::completion())
    }

    fn config(&self, handle: Handle, option: ConfigOption, value: i32) -> Completion {
        // SAFETY: scalar arguments only
        unsafe { gpib_sys::ibconfig(handle.0, option.raw(), value) };
        Self::completion()
    }

    fn listener(&self, handle: Handle, primary: u8, secondary: i32) -> (bool, Completion) {
        let mut found: c_short = 0;
        // SAFETY: found outlives the call
        unsafe { gpib_sys::ibln(handle.0, c_int::from(primary), secondary, &mut found) };
        (found != 0, Self::completion())
    }

    fn lines(&self, handle: Handle) -> (BusLines, Completion) {
        let mut lines: c_short = 0;
        // SAFETY: lines outlives the call
        unsafe { gpib_sys::iblines(handle.0, &mut lines) };
        (
            BusLines::from_bits_truncate(lines as u16),
            Self::completion(),
        )
    }

    fn wait(&self, handle: Handle, mask: Status) -> Completion {
        // SAFETY: scalar arguments only
        unsafe { gpib_sys::ibwait(handle.0, c_int::from(mask.bits())) };
        Self::completion()
    }

    fn version(&self) -> String {
        let mut ptr: *mut c_char = std::ptr::null_mut();
        // SAFETY: ibvers stores a pointer to a static, nul-terminated string
        unsafe {
            gpib_sys::ibvers(&mut ptr);
            if ptr.is_null() {
                "unknown".to_string()
            } else {
                CStr::from_ptr(ptr).to_string_lossy().into_owned()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_option_codes() {
        assert_eq!(ConfigOption::PrimaryAddress.raw(), 0x1);
        assert_eq!(ConfigOption::Timeout.raw(), 0x3);
        assert_eq!(ConfigOption::EosChar.raw(), 0xf);
        assert_eq!(ConfigOption::BoardNumber.raw(), 0x200);
    }

    #[test]
    fn test_bus_lines_high_bit() {
        let lines = BusLines::from_bits_truncate(0x8080);
        assert!(lines.contains(BusLines::VALID_EOI));
        assert!(lines.contains(BusLines::EOI));
    }

    #[cfg(not(feature = "hardware"))]
    #[test]
    fn test_stub_library_reports_no_board() {
        assert!(!LinuxGpib::is_linked());
        let driver = LinuxGpib;
        let (_, completion) = driver.open_board(0);
        assert!(completion.is_error());
        assert_eq!(
            completion.error_code(),
            Some(crate::status::DriverErrorCode::NoBoard)
        );
        assert!(driver.version().contains("stub"));
    }
}
