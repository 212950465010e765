//! Stub implementations used when the `gpib-sdk` feature is disabled.
//!
//! Every call fails as if no GPIB board were installed: the return value and
//! `ThreadIbsta` report `ERR`, `ThreadIberr` reports `ENEB`, and no bytes are
//! transferred. Nothing here touches the pointers it is handed except
//! `ibvers`, which stores a static string.

use std::os::raw::{c_char, c_int, c_long, c_short, c_void};

use crate::{ENEB, ERR};

const STUB_VERSION: &[u8] = b"stub (gpib-sdk disabled)\0";

pub unsafe extern "C" fn ibask(_ud: c_int, _option: c_int, _value: *mut c_int) -> c_int {
    ERR
}

pub unsafe extern "C" fn ibclr(_ud: c_int) -> c_int {
    ERR
}

pub unsafe extern "C" fn ibcmd(_ud: c_int, _cmd: *const c_void, _cnt: c_long) -> c_int {
    ERR
}

pub unsafe extern "C" fn ibconfig(_ud: c_int, _option: c_int, _value: c_int) -> c_int {
    ERR
}

pub unsafe extern "C" fn ibdev(
    _board_index: c_int,
    _pad: c_int,
    _sad: c_int,
    _timo: c_int,
    _send_eoi: c_int,
    _eosmode: c_int,
) -> c_int {
    -1
}

pub unsafe extern "C" fn ibeot(_ud: c_int, _v: c_int) -> c_int {
    ERR
}

pub unsafe extern "C" fn iblines(_ud: c_int, _line_status: *mut c_short) -> c_int {
    ERR
}

pub unsafe extern "C" fn ibln(
    _ud: c_int,
    _pad: c_int,
    _sad: c_int,
    _found_listener: *mut c_short,
) -> c_int {
    ERR
}

pub unsafe extern "C" fn ibloc(_ud: c_int) -> c_int {
    ERR
}

pub unsafe extern "C" fn ibonl(_ud: c_int, _onl: c_int) -> c_int {
    ERR
}

pub unsafe extern "C" fn ibrd(_ud: c_int, _buf: *mut c_void, _count: c_long) -> c_int {
    ERR
}

pub unsafe extern "C" fn ibrsp(_ud: c_int, _spr: *mut c_char) -> c_int {
    ERR
}

pub unsafe extern "C" fn ibsic(_ud: c_int) -> c_int {
    ERR
}

pub unsafe extern "C" fn ibsre(_ud: c_int, _v: c_int) -> c_int {
    ERR
}

pub unsafe extern "C" fn ibtmo(_ud: c_int, _v: c_int) -> c_int {
    ERR
}

pub unsafe extern "C" fn ibtrg(_ud: c_int) -> c_int {
    ERR
}

pub unsafe extern "C" fn ibwait(_ud: c_int, _mask: c_int) -> c_int {
    ERR
}

pub unsafe extern "C" fn ibwrt(_ud: c_int, _buf: *const c_void, _count: c_long) -> c_int {
    ERR
}

pub unsafe extern "C" fn ibvers(version: *mut *mut c_char) {
    if !version.is_null() {
        *version = STUB_VERSION.as_ptr() as *mut c_char;
    }
}

pub unsafe extern "C" fn ThreadIbsta() -> c_int {
    ERR
}

pub unsafe extern "C" fn ThreadIberr() -> c_int {
    ENEB
}

pub unsafe extern "C" fn ThreadIbcnt() -> c_int {
    0
}

pub unsafe extern "C" fn ThreadIbcntl() -> c_long {
    0
}
