//! Input-side pacing: proposals in, concrete send deadlines out.
//!
//! # Design
//!
//! The pacer walks the interval stream round by round. For each round it
//! answers "when does the next round fire?": if the input is behind the
//! round the proposal expects it to be in, the answer is *now*; otherwise
//! the remainder of the current round period. When an interval's proposal
//! has not arrived, the previous interval is extrapolated forward at the
//! same pace — the pacer never blocks waiting for a proposal.
//!
//! Finishing an interval produces an [`IntervalActual`] (duration, rounds,
//! per-compute blockage histogram) which the input loop piggybacks onto its
//! next status message.

use std::collections::{BTreeMap, VecDeque};

use crate::config::CoreConfig;
use crate::pacing::interval::{IntervalActual, IntervalInfo};
use crate::pacing::skew::SkewEstimator;
use crate::time::Timestamp;
use crate::trace::{debug, trace};
use crate::types::{ConnectionId, IntervalIndex, TimesliceIndex};

/// The interval currently being sent.
struct RunningInterval {
    info: IntervalInfo,
    /// Local-clock start of the interval.
    started_at: Timestamp,
    rounds_sent: u32,
    /// Rounds stalled on each compute connection's buffer room.
    blockage: Vec<u64>,
}

impl RunningInterval {
    fn new(info: IntervalInfo, started_at: Timestamp) -> Self {
        let computes = info.compute_count as usize;
        Self { info, started_at, rounds_sent: 0, blockage: vec![0; computes] }
    }
}

/// Per-input-node pacing state.
pub struct IntervalPacer {
    proposals: BTreeMap<u64, IntervalInfo>,
    skew: SkewEstimator,
    current: RunningInterval,
    /// Finished actuals awaiting piggyback onto status messages.
    finished: VecDeque<IntervalActual>,
}

impl IntervalPacer {
    /// Creates a pacer seeded with the same interval-0 parameters the
    /// coordinator seeds, so sending can begin before any proposal arrives.
    /// `start` is the local time of the startup barrier.
    #[must_use]
    pub fn new(config: &CoreConfig, skew: SkewEstimator, start: Timestamp) -> Self {
        let slices = u64::from(config.rounds_per_interval) * u64::from(config.compute_count);
        let seed = IntervalInfo {
            index: IntervalIndex::ZERO,
            start_timeslice: TimesliceIndex::ZERO,
            end_timeslice: TimesliceIndex(slices - 1),
            round_count: config.rounds_per_interval,
            start_time: skew.to_fleet(start),
            duration: config.initial_interval_duration,
            compute_count: config.compute_count,
        };
        Self {
            proposals: BTreeMap::new(),
            skew,
            current: RunningInterval::new(seed, start),
            finished: VecDeque::new(),
        }
    }

    /// Skew estimator snapshot.
    #[must_use]
    pub const fn skew(&self) -> &SkewEstimator {
        &self.skew
    }

    /// Skew estimator, for opportunistic refinement by the event loop.
    pub fn skew_mut(&mut self) -> &mut SkewEstimator {
        &mut self.skew
    }

    /// The interval currently being paced.
    #[must_use]
    pub const fn current_interval(&self) -> &IntervalInfo {
        &self.current.info
    }

    /// Index of the interval whose proposal the input is currently asking
    /// the compute side about.
    #[must_use]
    pub const fn asking_about(&self) -> IntervalIndex {
        self.current.info.index.next()
    }

    /// Records a proposal from an inbound compute status message.
    ///
    /// Proposals for the current or past intervals are ignored: boundaries
    /// are immutable once an interval has started.
    pub fn record_proposal(&mut self, info: IntervalInfo) {
        if info.index <= self.current.info.index {
            trace!(interval = %info.index, "stale proposal ignored");
            return;
        }
        self.proposals.entry(info.index.as_u64()).or_insert(info);
    }

    /// First timeslice of the round that fires next.
    #[must_use]
    pub fn next_round_start(&self) -> TimesliceIndex {
        let info = &self.current.info;
        TimesliceIndex(
            info.start_timeslice.as_u64()
                + u64::from(self.current.rounds_sent) * u64::from(info.compute_count),
        )
    }

    /// When the next round should fire.
    ///
    /// `now` if the pacer is at or behind the round the proposal expects,
    /// otherwise the start of the round it is ahead into.
    #[must_use]
    pub fn next_fire_time(&self, now: Timestamp) -> Timestamp {
        let info = &self.current.info;
        let per_round = info.duration_per_round();
        let elapsed = now.since(self.current.started_at);
        let expected_round = if per_round.as_micros() == 0 {
            u64::from(info.round_count)
        } else {
            elapsed.as_micros() / per_round.as_micros()
        };
        if u64::from(self.current.rounds_sent) <= expected_round {
            now
        } else {
            self.current.started_at + per_round.saturating_mul(u64::from(self.current.rounds_sent))
        }
    }

    /// Notes that a round send stalled on `compute`'s buffer room.
    pub fn note_blocked(&mut self, compute: ConnectionId) {
        if let Some(slot) = self.current.blockage.get_mut(compute.idx()) {
            *slot += 1;
        }
    }

    /// Records one fully-sent round; on interval rollover the measured
    /// [`IntervalActual`] is queued and the next interval begins — from its
    /// proposal if one arrived, extrapolated otherwise.
    pub fn note_round_sent(&mut self, now: Timestamp) {
        self.current.rounds_sent += 1;
        if self.current.rounds_sent < self.current.info.round_count {
            return;
        }

        let info = self.current.info;
        let actual = IntervalActual {
            index: info.index,
            start_time: self.skew.to_fleet(self.current.started_at),
            duration: now.since(self.current.started_at),
            round_count: self.current.rounds_sent,
            blockage: std::mem::take(&mut self.current.blockage),
        };
        debug!(interval = %info.index, duration = %actual.duration, "interval fully sent");
        self.finished.push_back(actual);

        let next = self
            .proposals
            .remove(&info.index.next().as_u64())
            .unwrap_or_else(|| info.extrapolate());
        // Never start earlier than the proposal asks for; never stall if the
        // schedule is already behind.
        let scheduled = self.skew.to_local(next.start_time);
        let started_at = scheduled.max(now);
        // Proposals older than the one just adopted will not be consulted.
        self.proposals.retain(|&k, _| k > next.index.as_u64());
        self.current = RunningInterval::new(next, started_at);
    }

    /// Pops one finished interval's actual metadata for piggybacking.
    #[must_use]
    pub fn take_actual(&mut self) -> Option<IntervalActual> {
        self.finished.pop_front()
    }
}

/// Round-robin compute target selection with a frozen-modulus failure
/// policy.
///
/// The target of timeslice `t` is `t mod compute_count` over the target list
/// in force when `t` was scheduled. When a failure decision removes a
/// compute connection at `timeslice_trigger`, timeslices before the trigger
/// keep their old mapping (already-scheduled, possibly unacked sends are not
/// remapped); timeslices at or after it use the reduced list.
pub struct TargetSelector {
    epochs: Vec<Epoch>,
}

struct Epoch {
    from: TimesliceIndex,
    targets: Vec<ConnectionId>,
}

impl TargetSelector {
    /// Creates a selector over compute connections `0..compute_count`.
    ///
    /// # Panics
    ///
    /// Panics if `compute_count` is zero.
    #[must_use]
    pub fn new(compute_count: u32) -> Self {
        assert!(compute_count > 0, "compute_count must be > 0");
        let targets = (0..compute_count).map(ConnectionId).collect();
        Self { epochs: vec![Epoch { from: TimesliceIndex::ZERO, targets }] }
    }

    /// Target compute connection for a timeslice.
    #[must_use]
    pub fn target(&self, ts: TimesliceIndex) -> ConnectionId {
        let epoch = self
            .epochs
            .iter()
            .rev()
            .find(|e| e.from <= ts)
            .expect("epoch 0 covers every timeslice");
        let idx = (ts.as_u64() % epoch.targets.len() as u64) as usize;
        epoch.targets[idx]
    }

    /// Targets currently in force for newly scheduled timeslices.
    #[must_use]
    pub fn live_targets(&self) -> &[ConnectionId] {
        &self.epochs.last().expect("at least one epoch").targets
    }

    /// Removes a failed compute connection for timeslices at or after
    /// `trigger`; earlier timeslices keep the old modulus.
    pub fn remove(&mut self, failed: ConnectionId, trigger: TimesliceIndex) {
        let mut targets = self.live_targets().to_vec();
        targets.retain(|&c| c != failed);
        assert!(!targets.is_empty(), "cannot remove the last compute connection");
        self.epochs.push(Epoch { from: trigger, targets });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::TimeSpan;

    fn config() -> CoreConfig {
        // 4 rounds per interval, 3 computes, 1ms initial duration.
        let mut cfg = CoreConfig::new(4, 3).with_rounds_per_interval(4);
        cfg.initial_interval_duration = TimeSpan::from_millis(1);
        cfg
    }

    fn at(us: u64) -> Timestamp {
        Timestamp::from_micros(us)
    }

    fn pacer() -> IntervalPacer {
        IntervalPacer::new(&config(), SkewEstimator::new(), at(0))
    }

    #[test]
    fn fires_immediately_when_behind_schedule() {
        let p = pacer();
        // 4 rounds over 1ms: 250us per round. At t=600us we should already
        // be in round 2 but have sent none.
        assert_eq!(p.next_fire_time(at(600)), at(600));
    }

    #[test]
    fn waits_out_the_round_period_when_ahead() {
        let mut p = pacer();
        p.note_round_sent(at(10));
        p.note_round_sent(at(20));
        // Two rounds sent almost instantly; round 2 is due at 500us.
        assert_eq!(p.next_fire_time(at(30)), at(500));
        // Once the wall clock catches up, fire at once.
        assert_eq!(p.next_fire_time(at(500)), at(500));
    }

    #[test]
    fn round_starts_walk_the_timeslice_stream() {
        let mut p = pacer();
        assert_eq!(p.next_round_start(), TimesliceIndex(0));
        p.note_round_sent(at(250));
        assert_eq!(p.next_round_start(), TimesliceIndex(3));
        p.note_round_sent(at(500));
        assert_eq!(p.next_round_start(), TimesliceIndex(6));
    }

    #[test]
    fn rollover_produces_the_actual_and_adopts_the_proposal() {
        let mut p = pacer();
        let proposal = IntervalInfo {
            index: IntervalIndex(1),
            start_timeslice: TimesliceIndex(12),
            end_timeslice: TimesliceIndex(23),
            round_count: 4,
            start_time: at(1_100),
            duration: TimeSpan::from_micros(800),
            compute_count: 3,
        };
        p.record_proposal(proposal);

        p.note_blocked(ConnectionId(2));
        for n in 1..=4u64 {
            p.note_round_sent(at(n * 300));
        }
        let actual = p.take_actual().expect("interval 0 finished");
        assert_eq!(actual.index, IntervalIndex(0));
        assert_eq!(actual.duration, TimeSpan::from_micros(1_200));
        assert_eq!(actual.round_count, 4);
        assert_eq!(actual.blockage, vec![0, 0, 1]);

        assert_eq!(p.current_interval().index, IntervalIndex(1));
        assert_eq!(p.current_interval().duration, TimeSpan::from_micros(800));
        assert_eq!(p.next_round_start(), TimesliceIndex(12));
    }

    #[test]
    fn missing_proposal_extrapolates_and_never_blocks() {
        let mut p = pacer();
        for n in 1..=4u64 {
            p.note_round_sent(at(n * 250));
        }
        let _ = p.take_actual();
        let current = p.current_interval();
        assert_eq!(current.index, IntervalIndex(1));
        assert_eq!(current.duration, TimeSpan::from_millis(1), "previous pace carried forward");
        assert_eq!(current.start_timeslice, TimesliceIndex(12));
        // Pacing continues without any proposal.
        assert!(p.next_fire_time(at(1_100)) >= at(1_100));
    }

    #[test]
    fn stale_proposals_are_ignored() {
        let mut p = pacer();
        let stale = *p.current_interval();
        p.record_proposal(stale);
        assert_eq!(p.current_interval().index, IntervalIndex(0));
    }

    #[test]
    fn selector_round_robins_over_computes() {
        let sel = TargetSelector::new(3);
        assert_eq!(sel.target(TimesliceIndex(0)), ConnectionId(0));
        assert_eq!(sel.target(TimesliceIndex(1)), ConnectionId(1));
        assert_eq!(sel.target(TimesliceIndex(2)), ConnectionId(2));
        assert_eq!(sel.target(TimesliceIndex(3)), ConnectionId(0));
    }

    #[test]
    fn selector_freezes_the_modulus_before_the_trigger() {
        let mut sel = TargetSelector::new(3);
        sel.remove(ConnectionId(1), TimesliceIndex(9));

        // Already-scheduled timeslices keep the old mapping, even onto the
        // dead connection.
        assert_eq!(sel.target(TimesliceIndex(4)), ConnectionId(1));
        assert_eq!(sel.target(TimesliceIndex(8)), ConnectionId(2));

        // From the trigger on, the reduced modulus applies.
        assert_eq!(sel.target(TimesliceIndex(9)), ConnectionId(2));
        assert_eq!(sel.target(TimesliceIndex(10)), ConnectionId(0));
        assert_eq!(sel.live_targets(), &[ConnectionId(0), ConnectionId(2)]);
    }
}
