//! Wall-clock time with millisecond precision, and the clocks that tell it.
use std::sync::{atomic, Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// Local time.
///
/// This clock is monotonic.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Ord, PartialOrd, Default, Hash)]
pub struct LocalTime {
    /// Milliseconds since Epoch.
    millis: u128,
}

impl std::fmt::Display for LocalTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_millis())
    }
}

impl LocalTime {
    /// Construct a local time from the current system time.
    pub fn now() -> Self {
        static LAST: atomic::AtomicU64 = atomic::AtomicU64::new(0);

        let now = Self::from(SystemTime::now()).as_millis();
        let last = LAST.fetch_max(now, atomic::Ordering::SeqCst);

        // If the current time is in the past, return the last recorded time instead.
        Self::from_millis(now.max(last))
    }

    /// Construct a local time from whole seconds since Epoch.
    pub const fn from_secs(secs: u64) -> Self {
        Self {
            millis: secs as u128 * 1000,
        }
    }

    /// Construct a local time from milliseconds since Epoch.
    pub const fn from_millis(millis: u64) -> Self {
        Self {
            millis: millis as u128,
        }
    }

    /// Whole seconds since Epoch.
    pub fn as_secs(&self) -> u64 {
        (self.millis / 1000) as u64
    }

    /// Milliseconds since Epoch.
    pub fn as_millis(&self) -> u64 {
        self.millis.min(u64::MAX as u128) as u64
    }

    /// Get the duration since the given time, or zero if `earlier` is later than `self`.
    pub fn duration_since(&self, earlier: LocalTime) -> LocalDuration {
        LocalDuration::from_millis(self.millis.saturating_sub(earlier.millis))
    }

    /// Elapse time.
    ///
    /// Adds the given duration to the time.
    pub fn elapse(&mut self, duration: LocalDuration) {
        self.millis += duration.as_millis()
    }
}

/// Convert a `SystemTime` into a local time.
impl From<SystemTime> for LocalTime {
    fn from(system: SystemTime) -> Self {
        let millis = system
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();

        Self { millis }
    }
}

/// Substract two local times. Yields a duration.
impl std::ops::Sub<LocalTime> for LocalTime {
    type Output = LocalDuration;

    fn sub(self, other: LocalTime) -> LocalDuration {
        LocalDuration(self.millis.saturating_sub(other.millis))
    }
}

/// Substract a duration from a local time. Yields a local time.
impl std::ops::Sub<LocalDuration> for LocalTime {
    type Output = LocalTime;

    fn sub(self, other: LocalDuration) -> LocalTime {
        LocalTime {
            millis: self.millis.saturating_sub(other.0),
        }
    }
}

/// Add a duration to a local time. Yields a local time.
impl std::ops::Add<LocalDuration> for LocalTime {
    type Output = LocalTime;

    fn add(self, other: LocalDuration) -> LocalTime {
        LocalTime {
            millis: self.millis + other.0,
        }
    }
}

/// Time duration as measured locally.
#[derive(Debug, Copy, Clone, PartialOrd, Ord, PartialEq, Eq, Default)]
pub struct LocalDuration(u128);

impl LocalDuration {
    /// Create a new duration from whole seconds.
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs as u128 * 1000)
    }

    /// Create a new duration from whole minutes.
    pub const fn from_mins(mins: u64) -> Self {
        Self::from_secs(mins * 60)
    }

    /// Create a new duration from whole hours.
    pub const fn from_hours(hours: u64) -> Self {
        Self::from_mins(hours * 60)
    }

    /// Create a new duration from whole days.
    pub const fn from_days(days: u64) -> Self {
        Self::from_hours(days * 24)
    }

    /// Construct a new duration from milliseconds.
    pub const fn from_millis(millis: u128) -> Self {
        Self(millis)
    }

    /// Return the number of minutes in this duration.
    pub const fn as_mins(&self) -> u64 {
        self.as_secs() / 60
    }

    /// Return the number of seconds in this duration.
    pub const fn as_secs(&self) -> u64 {
        (self.0 / 1000) as u64
    }

    /// Return the number of milliseconds in this duration.
    pub const fn as_millis(&self) -> u128 {
        self.0
    }
}

impl std::fmt::Display for LocalDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.as_millis() < 1000 {
            write!(f, "{} millisecond(s)", self.as_millis())
        } else if self.as_secs() < 60 {
            write!(f, "{} second(s)", self.as_secs())
        } else if self.as_mins() < 60 {
            write!(f, "{} minute(s)", self.as_mins())
        } else {
            write!(f, "{} hour(s)", self.as_mins() / 60)
        }
    }
}

impl std::ops::Add<LocalDuration> for LocalDuration {
    type Output = LocalDuration;

    fn add(self, other: LocalDuration) -> LocalDuration {
        LocalDuration(self.0 + other.0)
    }
}

impl std::ops::Mul<u64> for LocalDuration {
    type Output = LocalDuration;

    fn mul(self, other: u64) -> LocalDuration {
        LocalDuration(self.0 * other as u128)
    }
}

impl From<LocalDuration> for std::time::Duration {
    fn from(other: LocalDuration) -> Self {
        std::time::Duration::from_millis(other.0 as u64)
    }
}

/// Clock that tells the time.
pub trait Clock: Clone + Send + Sync + 'static {
    /// Tell the time in local time.
    fn local_time(&self) -> LocalTime;
}

/// The operating system's wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn local_time(&self) -> LocalTime {
        LocalTime::now()
    }
}

/// A fixed time is a clock that never moves.
impl Clock for LocalTime {
    fn local_time(&self) -> LocalTime {
        *self
    }
}

/// Clock with interior mutability, shared between threads.
///
/// Every clone tells the same time, so tests can move time forward for a pool
/// that owns one of the clones.
#[derive(Debug, Clone)]
pub struct RefClock {
    inner: Arc<Mutex<LocalTime>>,
}

impl RefClock {
    /// Elapse time.
    pub fn elapse(&self, duration: LocalDuration) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapse(duration)
    }

    /// Set the time.
    pub fn set(&self, time: LocalTime) {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner()) = time;
    }
}

impl From<LocalTime> for RefClock {
    fn from(other: LocalTime) -> Self {
        Self {
            inner: Arc::new(Mutex::new(other)),
        }
    }
}

impl Clock for RefClock {
    fn local_time(&self) -> LocalTime {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
