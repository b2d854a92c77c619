//! Monotonic timestamps, spans, and signed cross-node clock offsets.
//!
//! All coordination timing runs in whole microseconds on the node's monotonic
//! clock. Cross-node timestamps (interval start times, heartbeat stamps) are
//! only comparable after correction by a [`ClockOffset`] estimated against the
//! peer's clock.

use serde::{Deserialize, Serialize};

/// Monotonic timestamp in microseconds since the node clock's origin.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[repr(transparent)]
pub struct Timestamp(u64);

/// Non-negative span between two timestamps, in microseconds.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[repr(transparent)]
pub struct TimeSpan(u64);

impl Timestamp {
    pub const ZERO: Self = Self(0);

    /// Create a timestamp from raw microseconds.
    #[inline]
    #[must_use]
    pub const fn from_micros(us: u64) -> Self {
        Self(us)
    }

    /// Raw microsecond value.
    #[inline]
    #[must_use]
    pub const fn as_micros(self) -> u64 {
        self.0
    }

    /// Span since `earlier`, saturating to zero if `earlier` is in the future.
    #[inline]
    #[must_use]
    pub const fn since(self, earlier: Self) -> TimeSpan {
        TimeSpan(self.0.saturating_sub(earlier.0))
    }
}

impl TimeSpan {
    pub const ZERO: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn from_micros(us: u64) -> Self {
        Self(us)
    }

    #[inline]
    #[must_use]
    pub const fn from_millis(ms: u64) -> Self {
        Self(ms * 1_000)
    }

    #[inline]
    #[must_use]
    pub const fn from_secs(s: u64) -> Self {
        Self(s * 1_000_000)
    }

    #[inline]
    #[must_use]
    pub const fn as_micros(self) -> u64 {
        self.0
    }

    /// Multiply by an integer factor (saturating).
    #[inline]
    #[must_use]
    pub const fn saturating_mul(self, factor: u64) -> Self {
        Self(self.0.saturating_mul(factor))
    }

    /// Integer division; a zero divisor yields zero rather than panicking.
    #[inline]
    #[must_use]
    pub const fn div_by(self, divisor: u64) -> Self {
        if divisor == 0 { Self(0) } else { Self(self.0 / divisor) }
    }
}

impl core::ops::Add<TimeSpan> for Timestamp {
    type Output = Self;
    #[inline]
    fn add(self, rhs: TimeSpan) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl core::ops::Sub<TimeSpan> for Timestamp {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: TimeSpan) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl core::ops::Sub for Timestamp {
    type Output = TimeSpan;
    #[inline]
    fn sub(self, rhs: Self) -> TimeSpan {
        self.since(rhs)
    }
}

impl core::ops::Add for TimeSpan {
    type Output = Self;
    #[inline]
    fn add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl core::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}us", self.0)
    }
}

impl core::fmt::Display for TimeSpan {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}us", self.0)
    }
}

/// Signed offset between this node's clock and a peer's clock, in microseconds.
///
/// `apply` maps a peer timestamp into the local timeline. The offset is seeded
/// once at the startup barrier and refined whenever a round-trip message with
/// known one-way latency arrives; refinement is a simple exponential blend so
/// one noisy sample cannot yank the estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClockOffset {
    micros: i64,
}

impl ClockOffset {
    /// Seed the offset from the startup synchronization barrier.
    #[inline]
    #[must_use]
    pub const fn from_micros(micros: i64) -> Self {
        Self { micros }
    }

    /// Raw signed microsecond value.
    #[inline]
    #[must_use]
    pub const fn as_micros(self) -> i64 {
        self.micros
    }

    /// Map a peer-clock timestamp onto the local timeline.
    #[inline]
    #[must_use]
    pub fn apply(self, peer: Timestamp) -> Timestamp {
        let corrected = peer.as_micros() as i64 + self.micros;
        Timestamp::from_micros(corrected.max(0) as u64)
    }

    /// Map a local timestamp back onto the peer's timeline (inverse of
    /// [`Self::apply`]).
    #[inline]
    #[must_use]
    pub fn unapply(self, local: Timestamp) -> Timestamp {
        let corrected = local.as_micros() as i64 - self.micros;
        Timestamp::from_micros(corrected.max(0) as u64)
    }

    /// Refine from a round-trip sample.
    ///
    /// `peer_stamp` is the peer's clock when it sent, `local_receive` ours on
    /// arrival, `one_way` the known one-way latency of the path. The fresh
    /// sample is blended at 1/8 weight into the running estimate.
    pub fn refine(&mut self, peer_stamp: Timestamp, local_receive: Timestamp, one_way: TimeSpan) {
        let sample =
            local_receive.as_micros() as i64 - one_way.as_micros() as i64 - peer_stamp.as_micros() as i64;
        self.micros += (sample - self.micros) / 8;
    }
}

/// Node-local monotonic clock backed by [`minstant::Instant`].
///
/// All timestamps handed to the coordination components come from one clock
/// instance, so they share an origin and stay comparable.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: minstant::Instant,
}

impl Clock {
    #[must_use]
    pub fn new() -> Self {
        Self { origin: minstant::Instant::now() }
    }

    /// Current monotonic timestamp.
    #[must_use]
    pub fn now(&self) -> Timestamp {
        Timestamp::from_micros(self.origin.elapsed().as_micros() as u64)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
