//! Scriptable in-memory driver.
//!
//! `MockDriver` behaves like a single instrument that echoes whatever it is
//! sent: written bytes are queued and handed back by the next reads. Reading
//! from an empty queue times out, the way a silent instrument would.
//!
//! Beyond the echo it can inject failures, add per-call latency, record every
//! call, and count how many calls are executing at once.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::driver::{BusLines, ConfigOption, DeviceParams, GpibDriver, Handle};
use crate::status::{Completion, DriverErrorCode, Status};
use crate::termination::{EosMode, EosPolicy};
use crate::timeout::Timeout;

/// One recorded driver call.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum MockCall {
    OpenDevice(DeviceParams),
    OpenBoard(u32),
    Close(Handle),
    Write(Vec<u8>),
    Read(usize),
    Command(Vec<u8>),
    Clear,
    InterfaceClear,
    RemoteEnable(bool),
    SerialPoll,
    Trigger,
    GoToLocal,
    SetTimeout(Timeout),
    SetEot(bool),
    Ask(ConfigOption),
    Config(ConfigOption, i32),
    Listener(u8, i32),
    Lines,
    Wait(Status),
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<MockCall>,
    next_handle: i32,
    open: HashSet<i32>,
    opened_total: usize,
    last_open: Option<DeviceParams>,
    config: HashMap<(i32, ConfigOption), i32>,
    echo: VecDeque<u8>,
    next_failure: Option<(usize, Completion)>,
    open_failure: Option<DriverErrorCode>,
    close_failure: Option<Completion>,
    panic_next: bool,
    panic_next_close: bool,
    status_byte: u8,
    listeners: HashSet<u8>,
    lines: BusLines,
    events: Status,
}

/// In-memory [`GpibDriver`] for tests and demos.
#[derive(Debug)]
pub struct MockDriver {
    state: Mutex<MockState>,
    latency: Duration,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks concurrently executing calls.
struct ActiveCall<'a>(&'a MockDriver);

impl<'a> ActiveCall<'a> {
    fn enter(driver: &'a MockDriver) -> Self {
        let now = driver.active.fetch_add(1, Ordering::SeqCst) + 1;
        driver.max_active.fetch_max(now, Ordering::SeqCst);
        Self(driver)
    }
}

impl Drop for ActiveCall<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockDriver {
    /// A driver with no latency and an empty echo queue.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                next_handle: 100,
                // Idle bus: every line monitored, only NDAC asserted
                lines: BusLines::from_bits_truncate(0x00ff) | BusLines::NDAC,
                ..Default::default()
            }),
            latency: Duration::ZERO,
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    /// Block every I/O call for `latency` before it completes.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Answer `ibln` with "present" for `primary`.
    pub fn with_listener(self, primary: u8) -> Self {
        self.state.lock().listeners.insert(primary);
        self
    }

    /// Queue bytes for the next reads.
    pub fn queue_read(&self, data: &[u8]) {
        self.state.lock().echo.extend(data.iter().copied());
    }

    /// Make the next I/O call (not open or close) complete with `completion`.
    pub fn fail_next(&self, completion: Completion) {
        self.fail_after(0, completion);
    }

    /// Let `skip` I/O calls succeed, then complete the one after with `completion`.
    pub fn fail_after(&self, skip: usize, completion: Completion) {
        self.state.lock().next_failure = Some((skip, completion));
    }

    /// Make the next close complete with `completion`. The handle stays open.
    pub fn fail_next_close(&self, completion: Completion) {
        self.state.lock().close_failure = Some(completion);
    }

    /// Make the next close panic. The handle stays open.
    pub fn panic_next_close(&self) {
        self.state.lock().panic_next_close = true;
    }

    /// Make the next open fail with `code`.
    pub fn fail_next_open(&self, code: DriverErrorCode) {
        self.state.lock().open_failure = Some(code);
    }

    /// Make the next I/O call panic.
    pub fn panic_next(&self) {
        self.state.lock().panic_next = true;
    }

    /// Status byte returned by serial polls.
    pub fn set_status_byte(&self, status_byte: u8) {
        self.state.lock().status_byte = status_byte;
    }

    /// Events that satisfy `ibwait`. A wait whose mask matches none of them times out.
    pub fn raise_events(&self, events: Status) {
        self.state.lock().events |= events;
    }

    /// Every call made so far.
    pub fn calls(&self) -> Vec<MockCall> {
        self.state.lock().calls.clone()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Handles currently open.
    pub fn open_handles(&self) -> usize {
        self.state.lock().open.len()
    }

    /// Successful opens so far.
    pub fn open_count(&self) -> usize {
        self.state.lock().opened_total
    }

    /// Parameters of the most recent device open.
    pub fn last_open(&self) -> Option<DeviceParams> {
        self.state.lock().last_open
    }

    /// Highest number of calls that were ever executing at once.
    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Calls executing right now.
    pub fn active_calls(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Shared prologue of every I/O call: count, delay, record, then either
    /// hand back an injected failure or run `f` against the state.
    fn io<T: Default>(
        &self,
        handle: Handle,
        call: MockCall,
        f: impl FnOnce(&mut MockState) -> (T, Completion),
    ) -> (T, Completion) {
        let _active = ActiveCall::enter(self);
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }

        let mut state = self.state.lock();
        state.calls.push(call);
        if std::mem::take(&mut state.panic_next) {
            drop(state);
            panic!("injected driver panic");
        }
        match state.next_failure.take() {
            Some((0, failure)) => return (T::default(), failure),
            Some((skip, failure)) => state.next_failure = Some((skip - 1, failure)),
            None => {}
        }
        if !state.open.contains(&handle.0) {
            // Stale descriptor: linux-gpib fails with EDVR / EBADF
            return (T::default(), Completion::failed(DriverErrorCode::SystemError, 9));
        }
        f(&mut state)
    }
}

impl GpibDriver for MockDriver {
    fn open_device(&self, params: &DeviceParams) -> (Handle, Completion) {
        let mut state = self.state.lock();
        state.calls.push(MockCall::OpenDevice(*params));
        if let Some(code) = state.open_failure.take() {
            return (Handle(-1), Completion::failed(code, 0));
        }
        let ud = state.next_handle;
        state.next_handle += 1;
        state.open.insert(ud);
        state.opened_total += 1;
        state.last_open = Some(*params);
        let settings = [
            (ConfigOption::PrimaryAddress, i32::from(params.primary)),
            (ConfigOption::SecondaryAddress, params.secondary),
            (ConfigOption::Timeout, params.timeout.raw()),
            (ConfigOption::SendEoi, i32::from(params.send_eoi)),
            (ConfigOption::EosChar, params.eos & 0xff),
            (ConfigOption::EosRead, params.eos & gpib_sys::REOS),
            (ConfigOption::EosCompareBinary, params.eos & gpib_sys::BIN),
        ];
        for (option, value) in settings {
            state.config.insert((ud, option), value);
        }
        (Handle(ud), Completion::ok(0))
    }

    fn open_board(&self, board: u32) -> (Handle, Completion) {
        let mut state = self.state.lock();
        state.calls.push(MockCall::OpenBoard(board));
        if let Some(code) = state.open_failure.take() {
            return (Handle(board as i32), Completion::failed(code, 0));
        }
        let ud = board as i32;
        state.open.insert(ud);
        state.opened_total += 1;
        state
            .config
            .insert((ud, ConfigOption::SystemController), 1);
        (Handle(ud), Completion::ok(0))
    }

    fn close(&self, handle: Handle) -> Completion {
        let mut state = self.state.lock();
        state.calls.push(MockCall::Close(handle));
        if std::mem::take(&mut state.panic_next_close) {
            drop(state);
            panic!("injected close panic");
        }
        if let Some(failure) = state.close_failure.take() {
            return failure;
        }
        state.config.retain(|(ud, _), _| *ud != handle.0);
        if state.open.remove(&handle.0) {
            Completion::ok(0)
        } else {
            Completion::failed(DriverErrorCode::SystemError, 9)
        }
    }

    fn write(&self, handle: Handle, data: &[u8]) -> Completion {
        self.io(handle, MockCall::Write(data.to_vec()), |state| {
            state.echo.extend(data.iter().copied());
            ((), Completion::ok(data.len()))
        })
        .1
    }

    fn read(&self, handle: Handle, buf: &mut [u8]) -> Completion {
        self.io(handle, MockCall::Read(buf.len()), |state| {
            if state.echo.is_empty() {
                return ((), Completion::timed_out(0));
            }
            let eos = EosPolicy {
                character: state
                    .config
                    .get(&(handle.0, ConfigOption::EosChar))
                    .map_or(0, |c| *c as u8),
                mode: EosMode::from_bits_truncate(
                    (state
                        .config
                        .get(&(handle.0, ConfigOption::EosRead))
                        .copied()
                        .unwrap_or(0)
                        | state
                            .config
                            .get(&(handle.0, ConfigOption::EosCompareBinary))
                            .copied()
                            .unwrap_or(0)) as u16,
                ),
            };

            let mut count = 0;
            let mut ended = false;
            while count < buf.len() {
                let Some(byte) = state.echo.pop_front() else {
                    break;
                };
                buf[count] = byte;
                count += 1;
                if eos.terminates_reads() && eos.matches(byte) {
                    ended = true;
                    break;
                }
            }
            if state.echo.is_empty() {
                ended = true;
            }
            let status = if ended { Status::END } else { Status::empty() };
            ((), Completion::ok_with(status, count))
        })
        .1
    }

    fn command(&self, handle: Handle, data: &[u8]) -> Completion {
        self.io(handle, MockCall::Command(data.to_vec()), |_| {
            ((), Completion::ok(data.len()))
        })
        .1
    }

    fn clear(&self, handle: Handle) -> Completion {
        self.io(handle, MockCall::Clear, |state| {
            state.echo.clear();
            ((), Completion::ok(0))
        })
        .1
    }

    fn interface_clear(&self, handle: Handle) -> Completion {
        self.io(handle, MockCall::InterfaceClear, |_| ((), Completion::ok(0)))
            .1
    }

    fn remote_enable(&self, handle: Handle, enable: bool) -> Completion {
        self.io(handle, MockCall::RemoteEnable(enable), |state| {
            state.lines.set(BusLines::REN, enable);
            ((), Completion::ok(0))
        })
        .1
    }

    fn serial_poll(&self, handle: Handle) -> (u8, Completion) {
        self.io(handle, MockCall::SerialPoll, |state| {
            (state.status_byte, Completion::ok(1))
        })
    }

    fn trigger(&self, handle: Handle) -> Completion {
        self.io(handle, MockCall::Trigger, |_| ((), Completion::ok(0)))
            .1
    }

    fn go_to_local(&self, handle: Handle) -> Completion {
        self.io(handle, MockCall::GoToLocal, |_| ((), Completion::ok(0)))
            .1
    }

    fn set_timeout(&self, handle: Handle, timeout: Timeout) -> Completion {
        self.io(handle, MockCall::SetTimeout(timeout), |state| {
            state
                .config
                .insert((handle.0, ConfigOption::Timeout), timeout.raw());
            ((), Completion::ok(0))
        })
        .1
    }

    fn set_eot(&self, handle: Handle, send_eoi: bool) -> Completion {
        self.io(handle, MockCall::SetEot(send_eoi), |state| {
            state
                .config
                .insert((handle.0, ConfigOption::SendEoi), i32::from(send_eoi));
            ((), Completion::ok(0))
        })
        .1
    }

    fn ask(&self, handle: Handle, option: ConfigOption) -> (i32, Completion) {
        self.io(handle, MockCall::Ask(option), |state| {
            let value = state
                .config
                .get(&(handle.0, option))
                .copied()
                .unwrap_or(0);
            (value, Completion::ok(0))
        })
    }

    fn config(&self, handle: Handle, option: ConfigOption, value: i32) -> Completion {
        self.io(handle, MockCall::Config(option, value), |state| {
            state.config.insert((handle.0, option), value);
            ((), Completion::ok(0))
        })
        .1
    }

    fn listener(&self, handle: Handle, primary: u8, secondary: i32) -> (bool, Completion) {
        self.io(handle, MockCall::Listener(primary, secondary), |state| {
            (state.listeners.contains(&primary), Completion::ok(0))
        })
    }

    fn lines(&self, handle: Handle) -> (BusLines, Completion) {
        self.io(handle, MockCall::Lines, |state| {
            (state.lines, Completion::ok(0))
        })
    }

    fn wait(&self, handle: Handle, mask: Status) -> Completion {
        self.io(handle, MockCall::Wait(mask), |state| {
            let hit = state.events & mask;
            if hit.is_empty() && !mask.is_empty() {
                ((), Completion::ok_with(Status::TIMO, 0))
            } else {
                ((), Completion::ok_with(hit, 0))
            }
        })
        .1
    }

    fn version(&self) -> String {
        "mock 4.3.6".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(mock: &MockDriver, eos: i32) -> Handle {
        let (handle, completion) = mock.open_device(&DeviceParams {
            board: 0,
            primary: 22,
            secondary: 0,
            timeout: Timeout::T3s,
            send_eoi: true,
            eos,
        });
        assert!(!completion.is_error());
        handle
    }

    #[test]
    fn test_echo_and_end() {
        let mock = MockDriver::new();
        let handle = open(&mock, 0);
        mock.write(handle, b"hello");

        let mut buf = [0u8; 3];
        let completion = mock.read(handle, &mut buf);
        assert_eq!(&buf, b"hel");
        assert!(!completion.status.contains(Status::END));

        let mut buf = [0u8; 8];
        let completion = mock.read(handle, &mut buf);
        assert_eq!(&buf[..completion.count], b"lo");
        assert!(completion.status.contains(Status::END));
    }

    #[test]
    fn test_read_stops_on_eos() {
        let mock = MockDriver::new();
        let handle = open(&mock, EosPolicy::read_until(b'\n').raw());
        mock.queue_read(b"1.5\n2.5\n");

        let mut buf = [0u8; 16];
        let completion = mock.read(handle, &mut buf);
        assert_eq!(&buf[..completion.count], b"1.5\n");
        assert!(completion.status.contains(Status::END));
    }

    #[test]
    fn test_empty_queue_times_out() {
        let mock = MockDriver::new();
        let handle = open(&mock, 0);
        let completion = mock.read(handle, &mut [0u8; 4]);
        assert!(completion.status.is_timeout());
    }

    #[test]
    fn test_stale_handle_is_system_error() {
        let mock = MockDriver::new();
        let handle = open(&mock, 0);
        mock.close(handle);
        let completion = mock.clear(handle);
        assert_eq!(completion.error_code(), Some(DriverErrorCode::SystemError));
    }

    #[test]
    fn test_fail_after_skips_calls() {
        let mock = MockDriver::new();
        let handle = open(&mock, 0);
        mock.fail_after(1, Completion::failed(DriverErrorCode::InvalidArgument, 0));

        assert!(!mock.trigger(handle).is_error());
        let completion = mock.trigger(handle);
        assert_eq!(completion.error_code(), Some(DriverErrorCode::InvalidArgument));
        assert!(!mock.trigger(handle).is_error());
    }

    #[test]
    fn test_failed_close_keeps_handle() {
        let mock = MockDriver::new();
        let handle = open(&mock, 0);
        mock.fail_next_close(Completion::failed(DriverErrorCode::SystemError, 5));

        assert!(mock.close(handle).is_error());
        assert_eq!(mock.open_handles(), 1);
        assert!(!mock.close(handle).is_error());
        assert_eq!(mock.open_handles(), 0);
    }

    #[test]
    fn test_wait_without_event_times_out() {
        let mock = MockDriver::new();
        let handle = open(&mock, 0);
        assert!(mock.wait(handle, Status::SRQI).status.is_timeout());

        mock.raise_events(Status::SRQI);
        let completion = mock.wait(handle, Status::SRQI | Status::TIMO);
        assert!(completion.status.contains(Status::SRQI));
        assert!(!completion.status.is_timeout());
    }
}
