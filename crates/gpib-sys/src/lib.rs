//! Low-level FFI bindings for the Linux GPIB user-space library.
//!
//! This crate provides raw, unsafe declarations for `libgpib`, the user-space
//! half of the linux-gpib driver package. Every `ib*` call blocks the calling
//! thread until the bus operation completes or the configured timeout expires.
//!
//! # Thread-local status
//!
//! linux-gpib keeps `ibsta`, `iberr` and `ibcnt` per thread. The values must
//! be read with [`ThreadIbsta`], [`ThreadIberr`] and [`ThreadIbcntl`] on the
//! same thread, immediately after the call they describe.
//!
//! # Safety
//!
//! All functions in this crate are `unsafe` as they are direct FFI bindings.
//! For a safe, non-blocking wrapper use the `async_gpib` crate instead.
//!
//! # Features
//!
//! - `gpib-sdk`: link against the system `libgpib`. Without this feature the
//!   functions are stubs that report "no GPIB board" (`ERR` with `ENEB`), which
//!   lets the workspace build and test on machines without linux-gpib.

#![allow(non_upper_case_globals)]
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]
#![allow(missing_docs)]
#![allow(unsafe_code)]

use std::os::raw::c_int;

// ibsta status bits
pub const DCAS: c_int = 0x1;
pub const DTAS: c_int = 0x2;
pub const LACS: c_int = 0x4;
pub const TACS: c_int = 0x8;
pub const ATN: c_int = 0x10;
pub const CIC: c_int = 0x20;
pub const REM: c_int = 0x40;
pub const LOK: c_int = 0x80;
pub const CMPL: c_int = 0x100;
pub const EVENT: c_int = 0x200;
pub const SPOLL: c_int = 0x400;
pub const RQS: c_int = 0x800;
pub const SRQI: c_int = 0x1000;
pub const END: c_int = 0x2000;
pub const TIMO: c_int = 0x4000;
pub const ERR: c_int = 0x8000;

// iberr error codes
pub const EDVR: c_int = 0;
pub const ECIC: c_int = 1;
pub const ENOL: c_int = 2;
pub const EADR: c_int = 3;
pub const EARG: c_int = 4;
pub const ESAC: c_int = 5;
pub const EABO: c_int = 6;
pub const ENEB: c_int = 7;
pub const EDMA: c_int = 8;
pub const EOIP: c_int = 10;
pub const ECAP: c_int = 11;
pub const EFSO: c_int = 12;
pub const EBUS: c_int = 14;
pub const ESTB: c_int = 15;
pub const ESRQ: c_int = 16;
pub const ETAB: c_int = 20;

// Timeout values for ibtmo / ibdev
pub const TNONE: c_int = 0;
pub const T10us: c_int = 1;
pub const T30us: c_int = 2;
pub const T100us: c_int = 3;
pub const T300us: c_int = 4;
pub const T1ms: c_int = 5;
pub const T3ms: c_int = 6;
pub const T10ms: c_int = 7;
pub const T30ms: c_int = 8;
pub const T100ms: c_int = 9;
pub const T300ms: c_int = 10;
pub const T1s: c_int = 11;
pub const T3s: c_int = 12;
pub const T10s: c_int = 13;
pub const T30s: c_int = 14;
pub const T100s: c_int = 15;
pub const T300s: c_int = 16;
pub const T1000s: c_int = 17;

// End-of-string mode bits (ORed with the EOS character)
pub const REOS: c_int = 0x400;
pub const XEOS: c_int = 0x800;
pub const BIN: c_int = 0x1000;

// ibask / ibconfig option codes (Iba* and Ibc* share values)
pub const IbcPAD: c_int = 0x1;
pub const IbcSAD: c_int = 0x2;
pub const IbcTMO: c_int = 0x3;
pub const IbcEOT: c_int = 0x4;
pub const IbcPPC: c_int = 0x5;
pub const IbcREADDR: c_int = 0x6;
pub const IbcAUTOPOLL: c_int = 0x7;
pub const IbcCICPROT: c_int = 0x8;
pub const IbcIRQ: c_int = 0x9;
pub const IbcSC: c_int = 0xa;
pub const IbcSRE: c_int = 0xb;
pub const IbcEOSrd: c_int = 0xc;
pub const IbcEOSwrt: c_int = 0xd;
pub const IbcEOScmp: c_int = 0xe;
pub const IbcEOSchar: c_int = 0xf;
pub const IbcPP2: c_int = 0x10;
pub const IbcTIMING: c_int = 0x11;
pub const IbcDMA: c_int = 0x12;
pub const IbcReadAdjust: c_int = 0x13;
pub const IbcWriteAdjust: c_int = 0x14;
pub const IbcEventQueue: c_int = 0x15;
pub const IbcSPollBit: c_int = 0x16;
pub const IbcSendLLO: c_int = 0x17;
pub const IbcSPollTime: c_int = 0x18;
pub const IbcPPollTime: c_int = 0x19;
pub const IbcEndBitIsNormal: c_int = 0x1a;
pub const IbcUnAddr: c_int = 0x1b;
pub const IbcHSCableLength: c_int = 0x1f;
pub const IbcIst: c_int = 0x20;
pub const IbcRsv: c_int = 0x21;
pub const IbcBNA: c_int = 0x200;

// iblines bits
pub const ValidDAV: i16 = 0x01;
pub const ValidNDAC: i16 = 0x02;
pub const ValidNRFD: i16 = 0x04;
pub const ValidIFC: i16 = 0x08;
pub const ValidREN: i16 = 0x10;
pub const ValidSRQ: i16 = 0x20;
pub const ValidATN: i16 = 0x40;
pub const ValidEOI: i16 = 0x80;
pub const BusDAV: i16 = 0x100;
pub const BusNDAC: i16 = 0x200;
pub const BusNRFD: i16 = 0x400;
pub const BusIFC: i16 = 0x800;
pub const BusREN: i16 = 0x1000;
pub const BusSRQ: i16 = 0x2000;
pub const BusATN: i16 = 0x4000;
pub const BusEOI: i16 = -0x8000;

#[cfg(feature = "gpib-sdk")]
mod ffi {
    use std::os::raw::{c_char, c_int, c_long, c_short, c_void};

    extern "C" {
        pub fn ibask(ud: c_int, option: c_int, value: *mut c_int) -> c_int;
        pub fn ibclr(ud: c_int) -> c_int;
        pub fn ibcmd(ud: c_int, cmd: *const c_void, cnt: c_long) -> c_int;
        pub fn ibconfig(ud: c_int, option: c_int, value: c_int) -> c_int;
        pub fn ibdev(
            board_index: c_int,
            pad: c_int,
            sad: c_int,
            timo: c_int,
            send_eoi: c_int,
            eosmode: c_int,
        ) -> c_int;
        pub fn ibeot(ud: c_int, v: c_int) -> c_int;
        pub fn iblines(ud: c_int, line_status: *mut c_short) -> c_int;
        pub fn ibln(ud: c_int, pad: c_int, sad: c_int, found_listener: *mut c_short) -> c_int;
        pub fn ibloc(ud: c_int) -> c_int;
        pub fn ibonl(ud: c_int, onl: c_int) -> c_int;
        pub fn ibrd(ud: c_int, buf: *mut c_void, count: c_long) -> c_int;
        pub fn ibrsp(ud: c_int, spr: *mut c_char) -> c_int;
        pub fn ibsic(ud: c_int) -> c_int;
        pub fn ibsre(ud: c_int, v: c_int) -> c_int;
        pub fn ibtmo(ud: c_int, v: c_int) -> c_int;
        pub fn ibtrg(ud: c_int) -> c_int;
        pub fn ibwait(ud: c_int, mask: c_int) -> c_int;
        pub fn ibwrt(ud: c_int, buf: *const c_void, count: c_long) -> c_int;
        pub fn ibvers(version: *mut *mut c_char);

        pub fn ThreadIbsta() -> c_int;
        pub fn ThreadIberr() -> c_int;
        pub fn ThreadIbcnt() -> c_int;
        pub fn ThreadIbcntl() -> c_long;
    }
}

#[cfg(not(feature = "gpib-sdk"))]
mod stubs;

#[cfg(feature = "gpib-sdk")]
pub use ffi::*;
#[cfg(not(feature = "gpib-sdk"))]
pub use stubs::*;

/// Whether this build links the real linux-gpib library.
pub const fn sdk_linked() -> bool {
    cfg!(feature = "gpib-sdk")
}
