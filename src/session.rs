//! Async GPIB sessions.
//!
//! A [`GpibSession`] owns one driver handle, either a controller board or an
//! addressed device, and runs every driver call through its own
//! [`Offload`] slot. Calls on one session never overlap and complete in the
//! order they were issued. Calls on two sessions that share a board are not
//! ordered against each other; coordinating them is up to the caller.
//!
//! ## Lifecycle
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnecting -> Disconnected
//!                                   |                ^
//!                                   v                |
//!                                Faulted ------------+
//! ```
//!
//! A session becomes [`SessionState::Faulted`] when the driver reports that
//! the handle or board is gone, or when a driver call panics. A faulted session
//! only accepts [`GpibSession::disconnect`], which always succeeds.
//!
//! ## Cancellation
//!
//! Dropping an operation future (directly, through [`cancellable`], or through
//! [`with_deadline`]) stops the wait but not the driver call. The abandoned
//! call keeps the session's slot until the driver returns, state updates from
//! that call are still applied, and its data is discarded.
//!
//! ## Example
//!
//! ```no_run
//! use async_gpib::{GpibSession, Timeout};
//!
//! # async fn demo() -> async_gpib::Result<()> {
//! let dmm = GpibSession::device(0, 22)
//!     .with_timeout(Timeout::T3s)
//!     .build_linux()?;
//!
//! dmm.connect().await?;
//! dmm.write(b"*IDN?\n").await?;
//! let reply = dmm.read(256).await?;
//! println!("{}", String::from_utf8_lossy(&reply));
//! dmm.disconnect().await?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::address::{encode_secondary, validate_address, Address, SessionKind};
use crate::driver::{BusLines, ConfigOption, DeviceParams, GpibDriver, Handle, LinuxGpib};
use crate::error::{GpibError, Result};
use crate::offload::{Offload, OffloadError};
use crate::status::{Completion, ErrorKind, Status};
use crate::termination::EosPolicy;
use crate::timeout::Timeout;

/// Largest buffer a single `read` may request.
pub const MAX_READ_LENGTH: usize = 16 * 1024 * 1024;

/// Lifecycle state of a [`GpibSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No handle held
    Disconnected,
    /// `connect()` in progress
    Connecting,
    /// Handle held, I/O allowed
    Connected,
    /// `disconnect()` in progress
    Disconnecting,
    /// The handle is unusable; only `disconnect()` is allowed
    Faulted,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// Builder for [`GpibSession`].
///
/// Address validation is deferred to [`SessionBuilder::build`] so that the
/// builder chain itself never fails.
#[derive(Debug, Clone)]
pub struct SessionBuilder {
    board: u32,
    primary: Option<u8>,
    secondary: Option<u8>,
    timeout: Timeout,
    send_eoi: bool,
    eos: EosPolicy,
}

impl SessionBuilder {
    fn new(board: u32, primary: Option<u8>) -> Self {
        Self {
            board,
            primary,
            secondary: None,
            timeout: Timeout::default(),
            send_eoi: true,
            eos: EosPolicy::NONE,
        }
    }

    /// Set the secondary address (devices only).
    pub fn with_secondary_address(mut self, secondary: u8) -> Self {
        self.secondary = Some(secondary);
        self
    }

    /// Set the driver I/O timeout. Default is 10 s.
    pub fn with_timeout(mut self, timeout: Timeout) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the driver I/O timeout from a duration, rounding up.
    pub fn with_timeout_duration(self, timeout: Option<Duration>) -> Self {
        self.with_timeout(Timeout::from_duration(timeout))
    }

    /// Assert EOI with the last byte of each write. Default is on.
    pub fn with_send_eoi(mut self, send_eoi: bool) -> Self {
        self.send_eoi = send_eoi;
        self
    }

    /// Set the EOS policy. Default is none.
    pub fn with_eos(mut self, eos: EosPolicy) -> Self {
        self.eos = eos;
        self
    }

    /// Validate the address and create a disconnected session.
    pub fn build(self, driver: Arc<dyn GpibDriver>) -> Result<GpibSession> {
        let mut address = match self.primary {
            Some(pad) => Address::device(self.board, pad)?,
            None => Address::board(self.board)?,
        };
        if let Some(sad) = self.secondary {
            address = address.with_secondary(sad)?;
        }

        Ok(GpibSession {
            address,
            send_eoi: self.send_eoi,
            eos: self.eos,
            driver,
            offload: Offload::new(),
            shared: Arc::new(Mutex::new(Inner {
                state: SessionState::Disconnected,
                handle: None,
                timeout: self.timeout,
                send_eoi: self.send_eoi,
                last: None,
            })),
        })
    }

    /// Build a session over the linux-gpib library.
    pub fn build_linux(self) -> Result<GpibSession> {
        self.build(Arc::new(LinuxGpib))
    }
}

#[derive(Debug)]
struct Inner {
    state: SessionState,
    handle: Option<Handle>,
    timeout: Timeout,
    send_eoi: bool,
    last: Option<Completion>,
}

type Shared = Arc<Mutex<Inner>>;

/// A driver setting changed by an offloaded call.
#[derive(Debug, Clone, Copy)]
enum Effect {
    Timeout(Timeout),
    SendEoi(bool),
}

/// Applies the outcome of one offloaded call to the session state.
///
/// Lives inside the worker closure, so the outcome is recorded even when the
/// caller has stopped waiting. If the closure is dropped without running, the
/// state goes back to `restore`; if it unwinds, the state becomes `on_panic`.
struct Pending {
    shared: Shared,
    address: Address,
    restore: Option<SessionState>,
    on_panic: SessionState,
    done: bool,
}

impl Pending {
    fn new(shared: Shared, address: Address) -> Self {
        Self {
            shared,
            address,
            restore: None,
            on_panic: SessionState::Faulted,
            done: false,
        }
    }

    fn restore_to(mut self, state: SessionState) -> Self {
        self.restore = Some(state);
        self
    }

    fn on_panic(mut self, state: SessionState) -> Self {
        self.on_panic = state;
        self
    }

    /// Record an I/O completion; a fatal status faults the session.
    fn record(mut self, operation: &'static str, completion: &Completion, effect: Option<Effect>) {
        self.done = true;
        let mut inner = self.shared.lock();
        inner.last = Some(*completion);
        match effect {
            Some(Effect::Timeout(timeout)) => inner.timeout = timeout,
            Some(Effect::SendEoi(send_eoi)) => inner.send_eoi = send_eoi,
            None => {}
        }
        if completion.classify() == Some(ErrorKind::HardwareFault)
            && inner.state == SessionState::Connected
        {
            warn!(
                address = %self.address,
                op = operation,
                code = ?completion.error_code(),
                "Driver reported a fatal error, session faulted"
            );
            inner.state = SessionState::Faulted;
        }
    }

    fn opened(
        mut self,
        handle: Option<Handle>,
        completion: &Completion,
        timeout: Timeout,
        send_eoi: bool,
    ) {
        self.done = true;
        let mut inner = self.shared.lock();
        inner.last = Some(*completion);
        match handle {
            Some(handle) => {
                inner.handle = Some(handle);
                inner.timeout = timeout;
                inner.send_eoi = send_eoi;
                inner.state = SessionState::Connected;
            }
            None => inner.state = SessionState::Disconnected,
        }
    }

    fn closed(mut self, completion: Option<Completion>) {
        self.done = true;
        let mut inner = self.shared.lock();
        if completion.is_some() {
            inner.last = completion;
        }
        inner.handle = None;
        inner.state = SessionState::Disconnected;
    }
}

impl Drop for Pending {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let mut inner = self.shared.lock();
        if std::thread::panicking() {
            inner.state = self.on_panic;
            if self.on_panic == SessionState::Disconnected {
                inner.handle = None;
            }
        } else if let Some(state) = self.restore {
            inner.state = state;
        }
    }
}

/// An async session with one GPIB board or device.
///
/// All methods take `&self`; a session can be shared between tasks behind an
/// `Arc`, and concurrent calls are queued on its worker slot.
pub struct GpibSession {
    address: Address,
    send_eoi: bool,
    eos: EosPolicy,
    driver: Arc<dyn GpibDriver>,
    offload: Offload,
    shared: Shared,
}

impl fmt::Debug for GpibSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpibSession")
            .field("address", &self.address)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl GpibSession {
    /// Start building a session for the device at `primary` on `board`.
    pub fn device(board: u32, primary: u8) -> SessionBuilder {
        SessionBuilder::new(board, Some(primary))
    }

    /// Start building a session for the controller `board` itself.
    pub fn board(board: u32) -> SessionBuilder {
        SessionBuilder::new(board, None)
    }

    /// The session address.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Board or device.
    pub fn kind(&self) -> SessionKind {
        self.address.kind()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.shared.lock().state
    }

    /// Whether a usable handle is held.
    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// The configured driver timeout.
    pub fn timeout(&self) -> Timeout {
        self.shared.lock().timeout
    }

    /// The EOS policy the session was built with.
    pub fn eos(&self) -> EosPolicy {
        self.eos
    }

    /// Whether writes currently assert EOI on the last byte.
    ///
    /// Starts at the configured value on every connect and follows
    /// `config(ConfigOption::SendEoi, ..)` and failed EOI restores.
    pub fn send_eoi(&self) -> bool {
        self.shared.lock().send_eoi
    }

    /// `ibsta` of the most recent completed driver call.
    pub fn last_status(&self) -> Option<Status> {
        self.shared.lock().last.map(|c| c.status)
    }

    /// `ibcnt` of the most recent completed driver call.
    pub fn last_count(&self) -> Option<usize> {
        self.shared.lock().last.map(|c| c.count)
    }

    /// Acquire a driver handle.
    ///
    /// Fails with [`GpibError::Connection`] if the driver refuses the address
    /// or the board does not exist; the session then stays disconnected.
    /// Calling `connect` on a session that is not disconnected is an
    /// [`GpibError::InvalidState`] error.
    pub async fn connect(&self) -> Result<()> {
        let timeout = {
            let mut inner = self.shared.lock();
            if inner.state != SessionState::Disconnected {
                return Err(GpibError::InvalidState {
                    operation: "connect",
                    state: inner.state,
                });
            }
            inner.state = SessionState::Connecting;
            inner.timeout
        };

        let pending = Pending::new(self.shared.clone(), self.address)
            .restore_to(SessionState::Disconnected);
        let slot = self
            .offload
            .acquire()
            .await
            .map_err(|e| bridge_error("connect", e))?;

        debug!(address = %self.address, timeout = %timeout, "Opening GPIB handle");
        let driver = Arc::clone(&self.driver);
        let address = self.address;
        let send_eoi = self.send_eoi;
        let params = address.primary().map(|primary| DeviceParams {
            board: address.board_index(),
            primary,
            secondary: address.raw_secondary(),
            timeout,
            send_eoi,
            eos: self.eos.raw(),
        });

        let (handle, completion) = slot
            .run(move || {
                let (handle, completion) = match params {
                    Some(params) => driver.open_device(&params),
                    None => {
                        let (handle, mut completion) = driver.open_board(address.board_index());
                        if handle.is_valid() && !completion.is_error() {
                            completion = driver.set_timeout(handle, timeout);
                        }
                        (handle, completion)
                    }
                };
                let opened = handle.is_valid() && !completion.is_error();
                if !opened && handle.is_valid() && params.is_some() {
                    driver.close(handle);
                }
                pending.opened(opened.then_some(handle), &completion, timeout, send_eoi);
                (handle, completion)
            })
            .await
            .map_err(|e| bridge_error("connect", e))?;

        if handle.is_valid() && !completion.is_error() {
            info!(address = %self.address, "GPIB session connected");
            return Ok(());
        }

        let (kind, reason) = match completion.error_code() {
            Some(code) => (
                completion.classify().unwrap_or(ErrorKind::HardwareFault),
                code.description().to_string(),
            ),
            None => (
                ErrorKind::HardwareFault,
                "driver returned no handle".to_string(),
            ),
        };
        warn!(address = %self.address, reason = %reason, "GPIB connect failed");
        Err(GpibError::Connection {
            address: self.address,
            kind,
            reason,
        })
    }

    /// Release the driver handle.
    ///
    /// Safe to call at any time: on a disconnected session it does nothing,
    /// and on a faulted session it always succeeds. Waits for any abandoned
    /// call still holding the worker slot before releasing the handle.
    pub async fn disconnect(&self) -> Result<()> {
        let (handle, previous) = loop {
            let state = {
                let mut inner = self.shared.lock();
                match inner.state {
                    SessionState::Disconnected => return Ok(()),
                    SessionState::Connecting => {
                        return Err(GpibError::InvalidState {
                            operation: "disconnect",
                            state: inner.state,
                        })
                    }
                    SessionState::Disconnecting => None,
                    previous @ (SessionState::Connected | SessionState::Faulted) => {
                        inner.state = SessionState::Disconnecting;
                        Some((inner.handle, previous))
                    }
                }
            };
            match state {
                Some(found) => break found,
                // Another disconnect is running; wait for it and look again
                None => self
                    .offload
                    .drain()
                    .await
                    .map_err(|e| bridge_error("disconnect", e))?,
            }
        };

        let pending = Pending::new(self.shared.clone(), self.address)
            .restore_to(previous)
            .on_panic(SessionState::Disconnected);
        let slot = self
            .offload
            .acquire()
            .await
            .map_err(|e| bridge_error("disconnect", e))?;

        let driver = Arc::clone(&self.driver);
        let result = slot
            .run(move || {
                let completion = handle.map(|h| driver.close(h));
                pending.closed(completion);
                completion
            })
            .await;

        match result {
            Ok(Some(completion)) => warn_release_error(self.address, &completion),
            Ok(None) => {}
            Err(OffloadError::Panicked(message)) => {
                warn!(address = %self.address, message = %message, "Releasing GPIB handle panicked");
            }
            Err(e) => return Err(bridge_error("disconnect", e)),
        }
        info!(address = %self.address, "GPIB session disconnected");
        Ok(())
    }

    /// Connect, run `f`, then disconnect whether or not `f` succeeded.
    ///
    /// The error from `f` wins over a disconnect error.
    pub async fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a GpibSession) -> BoxFuture<'a, Result<T>>,
    {
        self.connect().await?;
        let result = f(self).await;
        let closed = self.disconnect().await;
        let value = result?;
        closed?;
        Ok(value)
    }

    /// Write data bytes (`ibwrt`) and return how many were sent.
    ///
    /// An empty buffer returns 0 without touching the driver.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            self.handle_for("write")?;
            return Ok(0);
        }
        debug!(address = %self.address, bytes = data.len(), data = ?String::from_utf8_lossy(data), "Writing data");
        let data = data.to_vec();
        let (_, completion) = self
            .dispatch("write", move |driver, handle| {
                ((), driver.write(handle, &data))
            })
            .await?;
        Ok(completion.count)
    }

    /// Write with a one-off EOI setting, restoring the current setting afterwards.
    ///
    /// Switch, write and restore run as one driver call. If the restore fails
    /// its error is returned and [`GpibSession::send_eoi`] reports the setting
    /// left on the handle.
    pub async fn write_with_eoi(&self, data: &[u8], send_eoi: bool) -> Result<usize> {
        if data.is_empty() {
            self.handle_for("write")?;
            return Ok(0);
        }
        debug!(address = %self.address, bytes = data.len(), send_eoi, "Writing data");
        let data = data.to_vec();
        let address = self.address;
        let (_, completion) = self
            .dispatch_with("write", move |driver, handle, current_eoi| {
                if send_eoi == current_eoi {
                    return ((), driver.write(handle, &data), None);
                }
                let switched = driver.set_eot(handle, send_eoi);
                if switched.is_error() {
                    return ((), switched, None);
                }
                let completion = driver.write(handle, &data);
                let restored = driver.set_eot(handle, current_eoi);
                if restored.is_error() {
                    warn!(address = %address, code = ?restored.error_code(), "Failed to restore EOI setting");
                    let reported = if completion.is_error() { completion } else { restored };
                    return ((), reported, Some(Effect::SendEoi(send_eoi)));
                }
                ((), completion, None)
            })
            .await?;
        Ok(completion.count)
    }

    /// Read up to `max_length` bytes (`ibrd`).
    ///
    /// Stops early on END or on the EOS character when the EOS policy says so,
    /// and returns exactly what the driver delivered.
    pub async fn read(&self, max_length: usize) -> Result<Vec<u8>> {
        if max_length > MAX_READ_LENGTH {
            return Err(GpibError::InvalidArgument(format!(
                "read length {} exceeds {}",
                max_length, MAX_READ_LENGTH
            )));
        }
        if max_length == 0 {
            self.handle_for("read")?;
            return Ok(Vec::new());
        }
        let (data, _) = self
            .dispatch("read", move |driver, handle| {
                let mut buf = vec![0u8; max_length];
                let completion = driver.read(handle, &mut buf);
                buf.truncate(completion.count);
                (buf, completion)
            })
            .await?;
        debug!(address = %self.address, bytes = data.len(), data = ?String::from_utf8_lossy(&data), "Data read");
        Ok(data)
    }

    /// Send command bytes with ATN asserted (`ibcmd`). Board sessions only.
    pub async fn command(&self, bytes: &[u8]) -> Result<usize> {
        self.require(SessionKind::Board, "command")?;
        debug!(address = %self.address, bytes = bytes.len(), "Sending bus commands");
        let bytes = bytes.to_vec();
        let (_, completion) = self
            .dispatch("command", move |driver, handle| {
                ((), driver.command(handle, &bytes))
            })
            .await?;
        Ok(completion.count)
    }

    /// Selective device clear (`ibclr`). Device sessions only.
    pub async fn clear(&self) -> Result<()> {
        self.require(SessionKind::Device, "clear")?;
        self.dispatch("clear", |driver, handle| ((), driver.clear(handle)))
            .await?;
        Ok(())
    }

    /// Pulse IFC (`ibsic`). Board sessions only.
    pub async fn interface_clear(&self) -> Result<()> {
        self.require(SessionKind::Board, "interface_clear")?;
        self.dispatch("interface_clear", |driver, handle| {
            ((), driver.interface_clear(handle))
        })
        .await?;
        Ok(())
    }

    /// Assert or release the REN line (`ibsre`). Board sessions only.
    pub async fn remote_enable(&self, enable: bool) -> Result<()> {
        self.require(SessionKind::Board, "remote_enable")?;
        self.dispatch("remote_enable", move |driver, handle| {
            ((), driver.remote_enable(handle, enable))
        })
        .await?;
        Ok(())
    }

    /// Serial poll the device (`ibrsp`) and return its status byte. Device sessions only.
    pub async fn serial_poll(&self) -> Result<u8> {
        self.require(SessionKind::Device, "serial_poll")?;
        let (status_byte, _) = self
            .dispatch("serial_poll", |driver, handle| driver.serial_poll(handle))
            .await?;
        Ok(status_byte)
    }

    /// Group execute trigger (`ibtrg`). Device sessions only.
    pub async fn trigger(&self) -> Result<()> {
        self.require(SessionKind::Device, "trigger")?;
        self.dispatch("trigger", |driver, handle| ((), driver.trigger(handle)))
            .await?;
        Ok(())
    }

    /// Return to local mode (`ibloc`).
    pub async fn go_to_local(&self) -> Result<()> {
        self.dispatch("go_to_local", |driver, handle| {
            ((), driver.go_to_local(handle))
        })
        .await?;
        Ok(())
    }

    /// Change the driver I/O timeout (`ibtmo`).
    pub async fn set_timeout(&self, timeout: Timeout) -> Result<()> {
        self.dispatch_with("set_timeout", move |driver, handle, _| {
            let completion = driver.set_timeout(handle, timeout);
            let effect = (!completion.is_error()).then_some(Effect::Timeout(timeout));
            ((), completion, effect)
        })
        .await?;
        debug!(address = %self.address, timeout = %timeout, "Timeout changed");
        Ok(())
    }

    /// Ask the driver for the timeout currently in effect.
    pub async fn query_timeout(&self) -> Result<Timeout> {
        let raw = self.ask(ConfigOption::Timeout).await?;
        Timeout::from_raw(raw).ok_or_else(|| {
            GpibError::InvalidArgument(format!("driver reported unknown timeout value {}", raw))
        })
    }

    /// Query a configuration value (`ibask`).
    pub async fn ask(&self, option: ConfigOption) -> Result<i32> {
        let (value, _) = self
            .dispatch("ask", move |driver, handle| driver.ask(handle, option))
            .await?;
        Ok(value)
    }

    /// Change a configuration value (`ibconfig`) and return the resulting status.
    ///
    /// Changing [`ConfigOption::Timeout`] or [`ConfigOption::SendEoi`] also
    /// updates the session's view of that setting.
    pub async fn config(&self, option: ConfigOption, value: i32) -> Result<Status> {
        let (_, completion) = self
            .dispatch_with("config", move |driver, handle, _| {
                let completion = driver.config(handle, option, value);
                let effect = match option {
                    _ if completion.is_error() => None,
                    ConfigOption::Timeout => Timeout::from_raw(value).map(Effect::Timeout),
                    ConfigOption::SendEoi => Some(Effect::SendEoi(value != 0)),
                    _ => None,
                };
                ((), completion, effect)
            })
            .await?;
        Ok(completion.status)
    }

    /// Check whether a listener is present at `primary`/`secondary` (`ibln`).
    pub async fn listener(&self, primary: u8, secondary: Option<u8>) -> Result<bool> {
        validate_address("primary", primary)?;
        if let Some(sad) = secondary {
            validate_address("secondary", sad)?;
        }
        let secondary = encode_secondary(secondary);
        let (found, _) = self
            .dispatch("listener", move |driver, handle| {
                driver.listener(handle, primary, secondary)
            })
            .await?;
        Ok(found)
    }

    /// Read the control and handshake line status (`iblines`). Board sessions only.
    pub async fn lines(&self) -> Result<BusLines> {
        self.require(SessionKind::Board, "lines")?;
        let (lines, _) = self
            .dispatch("lines", |driver, handle| driver.lines(handle))
            .await?;
        Ok(lines)
    }

    /// Wait for any of the events in `mask` (`ibwait`).
    ///
    /// Returns the status word once the wait ends. A wait that ends because
    /// the driver timeout elapsed is a [`GpibError::Timeout`].
    pub async fn wait(&self, mask: Status) -> Result<Status> {
        let (_, completion) = self
            .dispatch("wait", move |driver, handle| {
                ((), driver.wait(handle, mask))
            })
            .await?;
        Ok(completion.status)
    }

    /// Version string of the driver library (`ibvers`).
    pub async fn version(&self) -> Result<String> {
        let driver = Arc::clone(&self.driver);
        self.offload
            .run(move || driver.version())
            .await
            .map_err(|e| bridge_error("version", e))
    }

    fn require(&self, kind: SessionKind, operation: &'static str) -> Result<()> {
        if self.kind() != kind {
            let what = match kind {
                SessionKind::Board => "board",
                SessionKind::Device => "device",
            };
            return Err(GpibError::InvalidArgument(format!(
                "{} is only available on {} sessions, not {}",
                operation, what, self.address
            )));
        }
        Ok(())
    }

    fn handle_for(&self, operation: &'static str) -> Result<Handle> {
        let inner = self.shared.lock();
        match (inner.state, inner.handle) {
            (SessionState::Connected, Some(handle)) => Ok(handle),
            (SessionState::Disconnected, _) | (SessionState::Connected, None) => {
                Err(GpibError::NotConnected {
                    operation,
                    address: self.address,
                })
            }
            (state, _) => Err(GpibError::InvalidState { operation, state }),
        }
    }

    /// Run one driver call on the session's slot and translate its status.
    async fn dispatch<T, F>(&self, operation: &'static str, f: F) -> Result<(T, Completion)>
    where
        F: FnOnce(&dyn GpibDriver, Handle) -> (T, Completion) + Send + 'static,
        T: Send + 'static,
    {
        self.dispatch_with(operation, move |driver, handle, _| {
            let (value, completion) = f(driver, handle);
            (value, completion, None)
        })
        .await
    }

    /// [`Self::dispatch`] for calls that change a cached driver setting.
    ///
    /// `f` also gets the EOI setting in effect when the slot was acquired and
    /// returns the setting it changed, which is recorded on the worker.
    async fn dispatch_with<T, F>(&self, operation: &'static str, f: F) -> Result<(T, Completion)>
    where
        F: FnOnce(&dyn GpibDriver, Handle, bool) -> (T, Completion, Option<Effect>) + Send + 'static,
        T: Send + 'static,
    {
        self.handle_for(operation)?;
        let slot = self
            .offload
            .acquire()
            .await
            .map_err(|e| bridge_error(operation, e))?;
        // The state may have changed while waiting for the slot
        let handle = self.handle_for(operation)?;
        let current_eoi = self.shared.lock().send_eoi;

        let driver = Arc::clone(&self.driver);
        let pending = Pending::new(self.shared.clone(), self.address);
        let (value, completion) = slot
            .run(move || {
                let (value, completion, effect) = f(driver.as_ref(), handle, current_eoi);
                pending.record(operation, &completion, effect);
                (value, completion)
            })
            .await
            .map_err(|e| bridge_error(operation, e))?;

        match GpibError::from_completion(operation, self.address, &completion) {
            Some(err) => {
                debug!(address = %self.address, op = operation, error = %err, "Driver call failed");
                Err(err)
            }
            None => Ok((value, completion)),
        }
    }
}

fn bridge_error(operation: &'static str, err: OffloadError) -> GpibError {
    match err {
        OffloadError::Cancelled | OffloadError::Closed => GpibError::Cancelled { operation },
        OffloadError::Panicked(message) => GpibError::WorkerPanicked { operation, message },
    }
}

impl Drop for GpibSession {
    fn drop(&mut self) {
        let handle = {
            let mut inner = self.shared.lock();
            let handle = inner.handle.take();
            inner.state = SessionState::Disconnected;
            handle
        };
        let Some(handle) = handle else {
            return;
        };
        warn!(address = %self.address, "GPIB session dropped while connected, releasing handle");

        let release = Release {
            driver: Arc::clone(&self.driver),
            handle,
            address: self.address,
            armed: true,
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let offload = self.offload.clone();
                let address = self.address;
                runtime.spawn(async move {
                    // Queue behind any abandoned call still using the handle
                    match offload.run(move || release.close()).await {
                        Ok(completion) => warn_release_error(address, &completion),
                        Err(OffloadError::Panicked(message)) => {
                            warn!(address = %address, message = %message, "Releasing GPIB handle panicked");
                        }
                        // The closure was dropped unrun and released the handle itself
                        Err(_) => {}
                    }
                });
            }
            Err(_) => {
                let completion = release.close();
                warn_release_error(self.address, &completion);
            }
        }
    }
}

/// A handle owned by a dropped session.
///
/// Released on a worker when possible; if the release task or its closure is
/// dropped without running, the handle is closed on the dropping thread.
struct Release {
    driver: Arc<dyn GpibDriver>,
    handle: Handle,
    address: Address,
    armed: bool,
}

impl Release {
    fn close(mut self) -> Completion {
        self.armed = false;
        self.driver.close(self.handle)
    }
}

impl Drop for Release {
    fn drop(&mut self) {
        if !self.armed || std::thread::panicking() {
            return;
        }
        self.armed = false;
        debug!(address = %self.address, "Release task did not run, closing handle in place");
        let completion = self.driver.close(self.handle);
        warn_release_error(self.address, &completion);
    }
}

fn warn_release_error(address: Address, completion: &Completion) {
    if completion.is_error() {
        warn!(
            address = %address,
            code = ?completion.error_code(),
            "Releasing GPIB handle reported an error"
        );
    }
}

/// Race `operation` against `cancel`.
///
/// When `cancel` resolves first the operation future is dropped and
/// [`GpibError::Cancelled`] is returned. The driver call it started keeps
/// running on its worker; see the module docs.
pub async fn cancellable<T, F, C>(operation: &'static str, fut: F, cancel: C) -> Result<T>
where
    F: Future<Output = Result<T>>,
    C: Future<Output = ()>,
{
    tokio::select! {
        biased;
        result = fut => result,
        _ = cancel => {
            debug!(op = operation, "Caller cancelled the wait");
            Err(GpibError::Cancelled { operation })
        }
    }
}

/// Give `fut` at most `deadline` to finish.
///
/// This is a caller-side limit layered over the driver timeout, which stays
/// authoritative for the bus transfer itself.
pub async fn with_deadline<T, F>(operation: &'static str, deadline: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    cancellable(operation, fut, tokio::time::sleep(deadline)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockCall, MockDriver};
    use crate::status::DriverErrorCode;
    use tracing_test::traced_test;

    fn device(mock: &Arc<MockDriver>) -> GpibSession {
        GpibSession::device(0, 22)
            .with_timeout(Timeout::T3s)
            .build(mock.clone())
            .unwrap()
    }

    #[test]
    fn test_builder_defaults() {
        let session = GpibSession::device(0, 5)
            .build(Arc::new(MockDriver::new()))
            .unwrap();
        assert_eq!(session.timeout(), Timeout::T10s);
        assert!(session.send_eoi());
        assert_eq!(session.eos(), EosPolicy::NONE);
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(session.last_status(), None);
    }

    #[test]
    fn test_builder_rejects_bad_address() {
        let err = GpibSession::device(0, 31)
            .build(Arc::new(MockDriver::new()))
            .unwrap_err();
        assert!(matches!(err, GpibError::InvalidArgument(_)));

        let err = GpibSession::board(0)
            .with_secondary_address(2)
            .build(Arc::new(MockDriver::new()))
            .unwrap_err();
        assert!(matches!(err, GpibError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_connect_passes_device_parameters() {
        let mock = Arc::new(MockDriver::new());
        let session = GpibSession::device(1, 9)
            .with_secondary_address(4)
            .with_timeout(Timeout::T3s)
            .with_send_eoi(false)
            .with_eos(EosPolicy::read_until(b'\n'))
            .build(mock.clone())
            .unwrap();
        session.connect().await.unwrap();

        let params = mock.last_open().unwrap();
        assert_eq!(params.board, 1);
        assert_eq!(params.primary, 9);
        assert_eq!(params.secondary, 0x64);
        assert_eq!(params.timeout, Timeout::T3s);
        assert!(!params.send_eoi);
        assert_eq!(params.eos, 0x400 | 0x0a);
    }

    #[tokio::test]
    async fn test_board_connect_sets_timeout() {
        let mock = Arc::new(MockDriver::new());
        let board = GpibSession::board(0)
            .with_timeout(Timeout::T1s)
            .build(mock.clone())
            .unwrap();
        board.connect().await.unwrap();
        assert_eq!(
            mock.calls(),
            vec![MockCall::OpenBoard(0), MockCall::SetTimeout(Timeout::T1s)]
        );
    }

    #[tokio::test]
    async fn test_reentrant_connect_is_invalid_state() {
        let mock = Arc::new(MockDriver::new());
        let session = device(&mock);
        session.connect().await.unwrap();

        let err = session.connect().await.unwrap_err();
        assert!(matches!(
            err,
            GpibError::InvalidState {
                operation: "connect",
                state: SessionState::Connected
            }
        ));
        assert_eq!(mock.open_count(), 1);
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let session = device(&Arc::new(MockDriver::new()));
        assert!(session.read(10).await.unwrap_err().is_not_connected());
        assert!(session.clear().await.unwrap_err().is_not_connected());
        assert!(session.write(b"").await.unwrap_err().is_not_connected());
    }

    #[tokio::test]
    async fn test_board_only_operations_on_device() {
        let mock = Arc::new(MockDriver::new());
        let session = device(&mock);
        session.connect().await.unwrap();

        let err = session.remote_enable(true).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = session.interface_clear().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_fatal_error_faults_session() {
        let mock = Arc::new(MockDriver::new());
        let session = device(&mock);
        session.connect().await.unwrap();

        mock.fail_next(Completion::failed(DriverErrorCode::NoBoard, 0));
        let err = session.read(16).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(session.state(), SessionState::Faulted);

        let err = session.write(b"x").await.unwrap_err();
        assert!(matches!(
            err,
            GpibError::InvalidState {
                state: SessionState::Faulted,
                ..
            }
        ));

        session.disconnect().await.unwrap();
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(mock.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_panic_faults_session() {
        let mock = Arc::new(MockDriver::new());
        let session = device(&mock);
        session.connect().await.unwrap();

        mock.panic_next();
        let err = session.clear().await.unwrap_err();
        assert!(matches!(err, GpibError::WorkerPanicked { .. }));
        assert_eq!(session.state(), SessionState::Faulted);
        session.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_last_status_and_count() {
        let mock = Arc::new(MockDriver::new());
        let session = device(&mock);
        session.connect().await.unwrap();

        assert_eq!(session.write(b"*IDN?\n").await.unwrap(), 6);
        assert_eq!(session.last_count(), Some(6));
        assert!(session.last_status().unwrap().contains(Status::CMPL));
    }

    #[tokio::test]
    async fn test_write_with_eoi_restores_setting() {
        let mock = Arc::new(MockDriver::new());
        let session = device(&mock);
        session.connect().await.unwrap();
        mock.clear_calls();

        session.write_with_eoi(b"AB", false).await.unwrap();
        assert_eq!(
            mock.calls(),
            vec![
                MockCall::SetEot(false),
                MockCall::Write(b"AB".to_vec()),
                MockCall::SetEot(true),
            ]
        );
    }

    #[tokio::test]
    async fn test_set_timeout_updates_cached_value() {
        let mock = Arc::new(MockDriver::new());
        let session = device(&mock);
        session.connect().await.unwrap();

        session.set_timeout(Timeout::T100ms).await.unwrap();
        assert_eq!(session.timeout(), Timeout::T100ms);
        assert_eq!(session.query_timeout().await.unwrap(), Timeout::T100ms);
    }

    #[tokio::test]
    async fn test_cancelled_set_timeout_still_updates_cache() {
        let mock = Arc::new(MockDriver::new().with_latency(Duration::from_millis(200)));
        let session = device(&mock);
        session.connect().await.unwrap();

        let err = with_deadline(
            "set_timeout",
            Duration::from_millis(20),
            session.set_timeout(Timeout::T100ms),
        )
        .await
        .unwrap_err();
        assert!(err.is_cancelled());

        // Disconnect waits for the abandoned call, so the driver has applied it
        session.disconnect().await.unwrap();
        assert_eq!(session.timeout(), Timeout::T100ms);

        session.connect().await.unwrap();
        assert_eq!(mock.last_open().unwrap().timeout, Timeout::T100ms);
    }

    #[tokio::test]
    async fn test_config_timeout_updates_cache() {
        let mock = Arc::new(MockDriver::new());
        let session = device(&mock);
        session.connect().await.unwrap();

        session
            .config(ConfigOption::Timeout, Timeout::T30s.raw())
            .await
            .unwrap();
        assert_eq!(session.timeout(), Timeout::T30s);
    }

    #[tokio::test]
    async fn test_failed_eoi_restore_is_reported() {
        let mock = Arc::new(MockDriver::new());
        let session = device(&mock);
        session.connect().await.unwrap();

        // set_eot(false) and the write succeed, the restore fails
        mock.fail_after(2, Completion::failed(DriverErrorCode::InvalidArgument, 0));
        let err = session.write_with_eoi(b"AB", false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(session.state(), SessionState::Connected);

        assert!(!session.send_eoi());
        assert_eq!(session.ask(ConfigOption::SendEoi).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_write_with_eoi_follows_configured_eot() {
        let mock = Arc::new(MockDriver::new());
        let session = device(&mock);
        session.connect().await.unwrap();

        session.config(ConfigOption::SendEoi, 0).await.unwrap();
        assert!(!session.send_eoi());
        mock.clear_calls();

        session.write_with_eoi(b"A", false).await.unwrap();
        assert_eq!(mock.calls(), vec![MockCall::Write(b"A".to_vec())]);

        mock.clear_calls();
        session.write_with_eoi(b"B", true).await.unwrap();
        assert_eq!(
            mock.calls(),
            vec![
                MockCall::SetEot(true),
                MockCall::Write(b"B".to_vec()),
                MockCall::SetEot(false),
            ]
        );
        assert_eq!(session.ask(ConfigOption::SendEoi).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reconnect_resets_send_eoi() {
        let mock = Arc::new(MockDriver::new());
        let session = device(&mock);
        session.connect().await.unwrap();
        session.config(ConfigOption::SendEoi, 0).await.unwrap();
        session.disconnect().await.unwrap();

        session.connect().await.unwrap();
        assert!(session.send_eoi());
        assert!(mock.last_open().unwrap().send_eoi);
    }

    #[tokio::test]
    async fn test_read_length_limit() {
        let session = device(&Arc::new(MockDriver::new()));
        let err = session.read(MAX_READ_LENGTH + 1).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_with_deadline_cancels() {
        let mock = Arc::new(MockDriver::new().with_latency(Duration::from_millis(200)));
        let session = device(&mock);
        session.connect().await.unwrap();

        let err = with_deadline("read", Duration::from_millis(20), session.read(8))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[test]
    #[traced_test]
    fn test_drop_outside_runtime_logs_release_error() {
        let mock = Arc::new(MockDriver::new());
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let session = runtime.block_on(async {
            let session = device(&mock);
            session.connect().await.unwrap();
            session
        });
        drop(runtime);

        mock.fail_next_close(Completion::failed(DriverErrorCode::SystemError, 5));
        drop(session);

        assert!(mock.calls().iter().any(|call| matches!(call, MockCall::Close(_))));
        assert!(logs_contain("dropped while connected"));
        assert!(logs_contain("Releasing GPIB handle reported an error"));
    }

    #[tokio::test]
    async fn test_drop_releases_handle() {
        let mock = Arc::new(MockDriver::new());
        {
            let session = device(&mock);
            session.connect().await.unwrap();
            assert_eq!(mock.open_handles(), 1);
        }
        // Release runs on a blocking worker
        for _ in 0..50 {
            if mock.open_handles() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(mock.open_handles(), 0);
    }
}
