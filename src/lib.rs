//! # async_gpib
//!
//! Async sessions for GPIB (IEEE-488) instruments on top of the linux-gpib
//! user-space library.
//!
//! linux-gpib only offers blocking calls. This crate runs each of them on a
//! tokio blocking worker, one call at a time per session, and turns the
//! driver's status words into typed errors.
//!
//! ## Crate Structure
//!
//! - **`session`**: [`GpibSession`], its builder and lifecycle state machine.
//!   This is the type most users need.
//! - **`offload`**: the bridge that moves blocking calls onto worker threads
//!   and serializes them per session.
//! - **`driver`**: the [`GpibDriver`] seam and [`LinuxGpib`], the real library.
//! - **`mock`**: [`MockDriver`], an in-memory echo instrument for tests.
//! - **`status`**, **`timeout`**, **`termination`**, **`address`**: typed
//!   versions of the driver's status words, timeout table, EOS settings and
//!   bus addresses.
//! - **`error`**: [`GpibError`] and the [`Result`] alias.
//! - **`config`** / **`logging`**: figment configuration and tracing setup for
//!   applications.
//!
//! ## Feature flags
//!
//! - `hardware`: link against `libgpib`. Without it the crate builds
//!   everywhere and [`LinuxGpib`] reports that no board exists.
//! - `hardware_tests`: enable tests that need a real board.

pub mod address;
pub mod config;
pub mod driver;
pub mod error;
pub mod logging;
pub mod mock;
pub mod offload;
pub mod session;
pub mod status;
pub mod termination;
pub mod timeout;

pub use address::{Address, SessionKind};
pub use config::{ConfigError, GpibConfig, SessionConfig};
pub use driver::{BusLines, ConfigOption, GpibDriver, Handle, LinuxGpib};
pub use error::{GpibError, Result};
pub use mock::MockDriver;
pub use offload::{Offload, OffloadError};
pub use session::{cancellable, with_deadline, GpibSession, SessionBuilder, SessionState};
pub use status::{Completion, DriverErrorCode, ErrorKind, Status};
pub use termination::{EosMode, EosPolicy};
pub use timeout::Timeout;
