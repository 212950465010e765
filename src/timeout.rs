//! Driver timeout enumeration.
//!
//! linux-gpib does not take arbitrary durations: `ibtmo` and `ibdev` accept
//! one of eighteen fixed values. A requested [`Duration`] is rounded up to the
//! smallest value that is at least as long, saturating at 1000 s.

use std::fmt;
use std::time::Duration;

/// One of the driver's fixed I/O timeout values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Timeout {
    /// Wait forever
    None,
    /// 10 µs
    T10us,
    /// 30 µs
    T30us,
    /// 100 µs
    T100us,
    /// 300 µs
    T300us,
    /// 1 ms
    T1ms,
    /// 3 ms
    T3ms,
    /// 10 ms
    T10ms,
    /// 30 ms
    T30ms,
    /// 100 ms
    T100ms,
    /// 300 ms
    T300ms,
    /// 1 s
    T1s,
    /// 3 s
    T3s,
    /// 10 s
    T10s,
    /// 30 s
    T30s,
    /// 100 s
    T100s,
    /// 300 s
    T300s,
    /// 1000 s
    T1000s,
}

impl Default for Timeout {
    fn default() -> Self {
        Self::T10s
    }
}

impl Timeout {
    /// Every finite value, shortest first.
    pub const FINITE: [Timeout; 17] = [
        Self::T10us,
        Self::T30us,
        Self::T100us,
        Self::T300us,
        Self::T1ms,
        Self::T3ms,
        Self::T10ms,
        Self::T30ms,
        Self::T100ms,
        Self::T300ms,
        Self::T1s,
        Self::T3s,
        Self::T10s,
        Self::T30s,
        Self::T100s,
        Self::T300s,
        Self::T1000s,
    ];

    /// The value passed to `ibtmo`.
    pub fn raw(self) -> i32 {
        match self {
            Self::None => gpib_sys::TNONE,
            Self::T10us => gpib_sys::T10us,
            Self::T30us => gpib_sys::T30us,
            Self::T100us => gpib_sys::T100us,
            Self::T300us => gpib_sys::T300us,
            Self::T1ms => gpib_sys::T1ms,
            Self::T3ms => gpib_sys::T3ms,
            Self::T10ms => gpib_sys::T10ms,
            Self::T30ms => gpib_sys::T30ms,
            Self::T100ms => gpib_sys::T100ms,
            Self::T300ms => gpib_sys::T300ms,
            Self::T1s => gpib_sys::T1s,
            Self::T3s => gpib_sys::T3s,
            Self::T10s => gpib_sys::T10s,
            Self::T30s => gpib_sys::T30s,
            Self::T100s => gpib_sys::T100s,
            Self::T300s => gpib_sys::T300s,
            Self::T1000s => gpib_sys::T1000s,
        }
    }

    /// Decode a value returned by `ibask(IbaTMO)`.
    pub fn from_raw(raw: i32) -> Option<Self> {
        if raw == gpib_sys::TNONE {
            return Some(Self::None);
        }
        Self::FINITE.into_iter().find(|t| t.raw() == raw)
    }

    /// The duration this value stands for; `None` for [`Timeout::None`].
    pub fn duration(self) -> Option<Duration> {
        let micros: u64 = match self {
            Self::None => return None,
            Self::T10us => 10,
            Self::T30us => 30,
            Self::T100us => 100,
            Self::T300us => 300,
            Self::T1ms => 1_000,
            Self::T3ms => 3_000,
            Self::T10ms => 10_000,
            Self::T30ms => 30_000,
            Self::T100ms => 100_000,
            Self::T300ms => 300_000,
            Self::T1s => 1_000_000,
            Self::T3s => 3_000_000,
            Self::T10s => 10_000_000,
            Self::T30s => 30_000_000,
            Self::T100s => 100_000_000,
            Self::T300s => 300_000_000,
            Self::T1000s => 1_000_000_000,
        };
        Some(Duration::from_micros(micros))
    }

    /// Round a duration up to the nearest driver value.
    ///
    /// `None` means no timeout. Anything above 1000 s saturates at
    /// [`Timeout::T1000s`].
    pub fn from_duration(timeout: Option<Duration>) -> Self {
        let Some(requested) = timeout else {
            return Self::None;
        };
        Self::FINITE
            .into_iter()
            .find(|t| t.duration().is_some_and(|d| d >= requested))
            .unwrap_or(Self::T1000s)
    }

    /// Round a timeout in seconds, as given in configuration files.
    ///
    /// Negative or NaN values are treated as zero.
    pub fn from_secs_f64(secs: Option<f64>) -> Self {
        Self::from_duration(secs.map(|s| {
            if s > 0.0 {
                Duration::try_from_secs_f64(s).unwrap_or(Duration::MAX)
            } else {
                Duration::ZERO
            }
        }))
    }
}

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.duration() {
            None => f.write_str("none"),
            Some(d) if d < Duration::from_millis(1) => write!(f, "{}us", d.as_micros()),
            Some(d) if d < Duration::from_secs(1) => write!(f, "{}ms", d.as_millis()),
            Some(d) => write!(f, "{}s", d.as_secs()),
        }
    }
}
