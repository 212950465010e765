//! Every driver error code maps to exactly one documented error kind.

use async_gpib::{Address, Completion, DriverErrorCode, ErrorKind, GpibError, Status};

fn expected(code: DriverErrorCode) -> ErrorKind {
    use DriverErrorCode::*;
    match code {
        NoListener | AddressingFailed => ErrorKind::Addressing,
        NotControllerInCharge | NotSystemController | Aborted | AsyncInProgress | BusCommand
        | StatusByteLost | SrqStuck | Table => ErrorKind::Bus,
        InvalidArgument | NoCapability => ErrorKind::InvalidArgument,
        SystemError | NoBoard | Dma | FileSystem | Unknown(_) => ErrorKind::HardwareFault,
    }
}

#[test]
fn test_every_known_code_is_classified() {
    let address = Address::device(0, 22).unwrap();
    for code in DriverErrorCode::KNOWN {
        assert_eq!(DriverErrorCode::from_raw(code.raw()), code);

        let completion = Completion::failed(code, 0);
        assert_eq!(completion.classify(), Some(expected(code)), "{code:?}");

        let err = GpibError::from_completion("read", address, &completion)
            .unwrap_or_else(|| panic!("{code:?} translated to success"));
        assert_eq!(err.kind(), expected(code), "{code:?}");
        assert_eq!(err.is_fatal(), expected(code) == ErrorKind::HardwareFault);
    }
}

#[test]
fn test_unknown_codes_are_hardware_faults() {
    for raw in [9, 13, 17, 21, 99, -1] {
        let code = DriverErrorCode::from_raw(raw);
        assert_eq!(code, DriverErrorCode::Unknown(raw));
        assert_eq!(code.kind(), ErrorKind::HardwareFault);
        assert!(code.to_string().contains(&raw.to_string()));
    }
}

#[test]
fn test_timeout_bit_wins_over_error_code() {
    for code in DriverErrorCode::KNOWN {
        let completion = Completion {
            status: Status::ERR | Status::TIMO,
            error: code.raw(),
            count: 3,
        };
        assert_eq!(completion.classify(), Some(ErrorKind::Timeout), "{code:?}");
    }
}

#[test]
fn test_error_code_ignored_without_err_bit() {
    let completion = Completion {
        status: Status::CMPL | Status::END,
        error: DriverErrorCode::NoBoard.raw(),
        count: 12,
    };
    assert_eq!(completion.classify(), None);
}

#[test]
fn test_mid_transfer_errors_carry_count() {
    let address = Address::device(0, 7).unwrap();
    let completion = Completion::failed(DriverErrorCode::NoListener, 4);
    let err = GpibError::from_completion("write", address, &completion).unwrap();
    assert_eq!(err.transferred(), Some(4));
    assert!(err.to_string().contains("no listeners"));

    let completion = Completion::failed(DriverErrorCode::BusCommand, 2);
    let err = GpibError::from_completion("command", address, &completion).unwrap();
    assert_eq!(err.kind(), ErrorKind::Bus);
    assert_eq!(err.transferred(), Some(2));
}
