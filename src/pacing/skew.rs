//! Clock-skew estimation between an input node and the compute fleet.
//!
//! Wall clocks on different hosts drift; interval start times reported by
//! inputs are only comparable on one reference timeline. The estimator is
//! seeded once at the startup synchronization barrier and refined
//! opportunistically whenever a round-trip message with known one-way
//! latency arrives.

use crate::time::{ClockOffset, TimeSpan, Timestamp};

/// Estimates the offset between the local clock and the fleet's reference
/// timeline (the compute side's clock).
///
/// Internally the offset is held in fleet-to-local orientation:
/// `local = fleet + offset`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SkewEstimator {
    offset: ClockOffset,
    seeded: bool,
}

impl SkewEstimator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the startup barrier has seeded the estimate.
    #[inline]
    #[must_use]
    pub const fn is_seeded(&self) -> bool {
        self.seeded
    }

    /// Current signed offset estimate in microseconds (fleet-to-local).
    #[inline]
    #[must_use]
    pub const fn offset_micros(&self) -> i64 {
        self.offset.as_micros()
    }

    /// Seeds the estimate from the startup barrier exchange: we sent at
    /// `local_send`, the peer stamped `peer_stamp`, the echo returned at
    /// `local_recv`. One-way latency is taken as half the round trip.
    pub fn seed_barrier(
        &mut self,
        local_send: Timestamp,
        peer_stamp: Timestamp,
        local_recv: Timestamp,
    ) {
        let one_way = local_recv.since(local_send).div_by(2);
        let offset = local_recv.as_micros() as i64
            - one_way.as_micros() as i64
            - peer_stamp.as_micros() as i64;
        self.offset = ClockOffset::from_micros(offset);
        self.seeded = true;
    }

    /// Opportunistic refinement from a message carrying a peer timestamp
    /// whose one-way latency is known. Ignored until seeded.
    pub fn refine(&mut self, peer_stamp: Timestamp, local_recv: Timestamp, one_way: TimeSpan) {
        if !self.seeded {
            return;
        }
        self.offset.refine(peer_stamp, local_recv, one_way);
    }

    /// Maps a local timestamp onto the fleet timeline.
    #[inline]
    #[must_use]
    pub fn to_fleet(&self, local: Timestamp) -> Timestamp {
        self.offset.unapply(local)
    }

    /// Maps a fleet-timeline timestamp onto the local clock.
    #[inline]
    #[must_use]
    pub fn to_local(&self, fleet: Timestamp) -> Timestamp {
        self.offset.apply(fleet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn barrier_seed_recovers_symmetric_offset() {
        let mut skew = SkewEstimator::new();
        // Fleet clock runs 400us behind ours; RTT 100us.
        // We send at local 1000 (fleet 600); peer stamps 650; echo lands at
        // local 1100.
        skew.seed_barrier(
            Timestamp::from_micros(1_000),
            Timestamp::from_micros(650),
            Timestamp::from_micros(1_100),
        );
        assert!(skew.is_seeded());
        assert_eq!(skew.offset_micros(), 400);
        assert_eq!(skew.to_fleet(Timestamp::from_micros(1_400)), Timestamp::from_micros(1_000));
        assert_eq!(skew.to_local(Timestamp::from_micros(1_000)), Timestamp::from_micros(1_400));
    }

    #[test]
    fn refine_is_ignored_before_seeding() {
        let mut skew = SkewEstimator::new();
        skew.refine(Timestamp::from_micros(10), Timestamp::from_micros(20), TimeSpan::ZERO);
        assert!(!skew.is_seeded());
        assert_eq!(skew.offset_micros(), 0);
    }

    #[test]
    fn round_trip_mapping_is_inverse() {
        let mut skew = SkewEstimator::new();
        skew.seed_barrier(
            Timestamp::from_micros(500),
            Timestamp::from_micros(2_000),
            Timestamp::from_micros(700),
        );
        let local = Timestamp::from_micros(5_000);
        assert_eq!(skew.to_local(skew.to_fleet(local)), local);
    }
}
