//! Error types for GPIB sessions.
//!
//! Raw driver status never leaves a session: every failed call is translated
//! into a [`GpibError`] whose [`ErrorKind`] tells the caller what happened.
//!
//! - "Nothing happened": [`GpibError::NotConnected`], [`GpibError::InvalidState`],
//!   [`GpibError::InvalidArgument`]. No bytes reached the bus.
//! - "Failed mid-transfer": [`GpibError::Timeout`], [`GpibError::Addressing`],
//!   [`GpibError::Bus`]. Some bytes may already be on the wire; the count is
//!   carried in the error.
//! - "Adapter unusable": [`GpibError::HardwareFault`] and
//!   [`GpibError::WorkerPanicked`]. The session is faulted and only accepts
//!   `disconnect()`.

use thiserror::Error;

use crate::address::Address;
use crate::session::SessionState;
use crate::status::{Completion, DriverErrorCode, ErrorKind};

/// Result type alias for GPIB operations.
pub type Result<T> = std::result::Result<T, GpibError>;

/// Errors returned by [`GpibSession`](crate::GpibSession) and its helpers.
#[derive(Error, Debug)]
pub enum GpibError {
    /// The session holds no handle
    #[error("{operation} on {address}: not connected")]
    NotConnected {
        /// Operation that was attempted
        operation: &'static str,
        /// Session address
        address: Address,
    },

    /// The driver timeout elapsed
    #[error("{operation} on {address} timed out ({transferred} bytes transferred)")]
    Timeout {
        /// Operation that timed out
        operation: &'static str,
        /// Session address
        address: Address,
        /// Bytes moved before the timeout
        transferred: usize,
    },

    /// No listener at the address, or the board could not address it
    #[error("{operation} on {address}: {code} ({transferred} bytes transferred)")]
    Addressing {
        /// Operation that failed
        operation: &'static str,
        /// Session address
        address: Address,
        /// Driver error code
        code: DriverErrorCode,
        /// Bytes moved before the failure
        transferred: usize,
    },

    /// Arbitration or protocol failure on the bus
    #[error("{operation} on {address}: bus error: {code} ({transferred} bytes transferred)")]
    Bus {
        /// Operation that failed
        operation: &'static str,
        /// Session address
        address: Address,
        /// Driver error code
        code: DriverErrorCode,
        /// Bytes moved before the failure
        transferred: usize,
    },

    /// The handle or board is gone; the session is faulted
    #[error("{operation} on {address}: hardware fault: {code}{detail}")]
    HardwareFault {
        /// Operation that failed
        operation: &'static str,
        /// Session address
        address: Address,
        /// Driver error code
        code: DriverErrorCode,
        /// Extra context (e.g. the OS errno after a system error)
        detail: String,
    },

    /// Caller-level contract violation, or an argument the driver rejected
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// `connect()` failed; the session stays disconnected
    #[error("Failed to connect to {address}: {reason}")]
    Connection {
        /// Session address
        address: Address,
        /// What the driver reported
        kind: ErrorKind,
        /// Human-readable reason
        reason: String,
    },

    /// Operation not allowed in the current lifecycle state
    #[error("{operation} not allowed while session is {state}")]
    InvalidState {
        /// Operation that was attempted
        operation: &'static str,
        /// State the session was in
        state: SessionState,
    },

    /// The caller stopped waiting; the native call ran to completion and its result was dropped
    #[error("{operation} cancelled")]
    Cancelled {
        /// Operation that was cancelled
        operation: &'static str,
    },

    /// The blocking call panicked on its worker thread
    #[error("{operation}: driver call panicked: {message}")]
    WorkerPanicked {
        /// Operation that panicked
        operation: &'static str,
        /// Panic payload, if it was a string
        message: String,
    },

    /// Configuration could not be loaded or failed validation
    #[error("Configuration error: {0}")]
    Config(String),
}

impl GpibError {
    /// Translate a driver completion. Returns `None` for a successful call.
    pub fn from_completion(
        operation: &'static str,
        address: Address,
        completion: &Completion,
    ) -> Option<Self> {
        let kind = completion.classify()?;
        let code = DriverErrorCode::from_raw(completion.error);
        let transferred = completion.count;
        Some(match kind {
            ErrorKind::Timeout => Self::Timeout {
                operation,
                address,
                transferred,
            },
            ErrorKind::Addressing => Self::Addressing {
                operation,
                address,
                code,
                transferred,
            },
            ErrorKind::Bus => Self::Bus {
                operation,
                address,
                code,
                transferred,
            },
            ErrorKind::InvalidArgument => {
                Self::InvalidArgument(format!("{} on {}: {}", operation, address, code))
            }
            _ => Self::HardwareFault {
                operation,
                address,
                code,
                detail: match code {
                    // After EDVR the count field holds the OS errno
                    DriverErrorCode::SystemError if transferred != 0 => {
                        format!(" (errno {})", transferred)
                    }
                    _ => String::new(),
                },
            },
        })
    }

    /// Kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotConnected { .. } => ErrorKind::NotConnected,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Addressing { .. } => ErrorKind::Addressing,
            Self::Bus { .. } => ErrorKind::Bus,
            Self::HardwareFault { .. } | Self::WorkerPanicked { .. } => ErrorKind::HardwareFault,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::Connection { kind, .. } => *kind,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// Bytes moved before a mid-transfer failure.
    pub fn transferred(&self) -> Option<usize> {
        match self {
            Self::Timeout { transferred, .. }
            | Self::Addressing { transferred, .. }
            | Self::Bus { transferred, .. } => Some(*transferred),
            _ => None,
        }
    }

    /// Check if this is a driver timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if the session was left unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::HardwareFault { .. } | Self::WorkerPanicked { .. })
    }

    /// Check if the operation was rejected because no handle was held.
    pub fn is_not_connected(&self) -> bool {
        matches!(self, Self::NotConnected { .. })
    }

    /// Check if this is a connect-time failure.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    /// Check if the caller stopped waiting.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

impl From<figment::Error> for GpibError {
    fn from(err: figment::Error) -> Self {
        Self::Config(err.to_string())
    }
}
