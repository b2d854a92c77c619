//! Compute-side interval aggregation and pace proposal.
//!
//! # Design
//!
//! Once every live input connection has reported its actual timing for
//! interval *i*, the coordinator computes the authoritative actual:
//!
//! - start time = midpoint between earliest and latest reported start,
//! - duration = **median** of reported durations,
//! - round count = average reported round count, rounded.
//!
//! It then proposes interval *i+2*. Pacers finishing *i* extrapolate *i+1*
//! on their own at rollover, so *i+2* is the earliest interval a proposal
//! can still reach before it starts. Boundaries chain from the previous
//! proposal across the extrapolated gap; duration = the median of the last
//! K authoritative durations,
//! optionally shrunk by a bounded **speed-up phase**. The phase starts when
//! the mean proposed-vs-actual deviation over the last K intervals drops
//! below a configured percentage, and runs for at most a configured number
//! of intervals, so a single fast interval never permanently changes the
//! baseline pace.

use std::collections::{BTreeMap, VecDeque};

use crate::config::CoreConfig;
use crate::pacing::interval::{IntervalActual, IntervalInfo, median_span};
use crate::protocol::ProtocolError;
use crate::time::{TimeSpan, Timestamp};
use crate::trace::{debug, info};
use crate::types::{ConnectionId, IntervalIndex, TimesliceIndex};

/// The authoritative (observed) timing of a completed interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthoritativeActual {
    pub index: IntervalIndex,
    pub start_time: Timestamp,
    pub duration: TimeSpan,
    pub round_count: u32,
}

/// Per-interval report collection, one slot per input connection.
struct Pending {
    reports: Vec<Option<IntervalActual>>,
}

impl Pending {
    fn new(input_count: usize) -> Self {
        Self { reports: vec![None; input_count] }
    }
}

/// Aggregates input reports and proposes the pace for upcoming intervals.
pub struct IntervalCoordinator {
    input_live: Vec<bool>,
    compute_count: u32,
    rounds_per_interval: u32,
    history_len: usize,
    speedup_threshold_percent: u32,
    speedup_percent: u32,
    speedup_interval_limit: u32,

    pending: BTreeMap<u64, Pending>,
    /// Authoritative durations of the last K completed intervals.
    actual_durations: VecDeque<TimeSpan>,
    /// `(proposed, actual)` duration pairs of the last K completed intervals.
    accuracy: VecDeque<(TimeSpan, TimeSpan)>,
    /// Proposals by interval index, retained for piggybacking and accuracy
    /// judgement until their interval completes.
    proposals: BTreeMap<u64, IntervalInfo>,
    /// Remaining intervals in the current speed-up phase.
    speedup_remaining: u32,
    /// Index of the next interval to be proposed.
    next_proposal: IntervalIndex,
    /// Most recent authoritative actual, for tests and status export.
    last_actual: Option<AuthoritativeActual>,
}

impl IntervalCoordinator {
    /// Creates a coordinator and seeds the proposal for interval 0 at the
    /// configured initial pace.
    #[must_use]
    pub fn new(config: &CoreConfig) -> Self {
        let mut coordinator = Self {
            input_live: vec![true; config.input_count as usize],
            compute_count: config.compute_count,
            rounds_per_interval: config.rounds_per_interval,
            history_len: config.duration_history,
            speedup_threshold_percent: config.speedup_threshold_percent,
            speedup_percent: config.speedup_percent,
            speedup_interval_limit: config.speedup_interval_limit,
            pending: BTreeMap::new(),
            actual_durations: VecDeque::new(),
            accuracy: VecDeque::new(),
            proposals: BTreeMap::new(),
            speedup_remaining: 0,
            next_proposal: IntervalIndex::ZERO,
            last_actual: None,
        };
        let seed = IntervalInfo {
            index: IntervalIndex::ZERO,
            start_timeslice: TimesliceIndex::ZERO,
            end_timeslice: TimesliceIndex(
                u64::from(config.rounds_per_interval) * u64::from(config.compute_count) - 1,
            ),
            round_count: config.rounds_per_interval,
            start_time: Timestamp::ZERO,
            duration: config.initial_interval_duration,
            compute_count: config.compute_count,
        };
        coordinator.proposals.insert(0, seed);
        coordinator.next_proposal = IntervalIndex(1);
        coordinator
    }

    /// The proposal for `index`, if one has been made.
    #[must_use]
    pub fn proposal(&self, index: IntervalIndex) -> Option<&IntervalInfo> {
        self.proposals.get(&index.as_u64())
    }

    /// The most recently completed authoritative actual.
    #[must_use]
    pub const fn last_actual(&self) -> Option<AuthoritativeActual> {
        self.last_actual
    }

    /// Records one input's actual timing for an interval.
    ///
    /// Returns the completed interval's index once the last live input has
    /// reported, after folding the authoritative actual into the history and
    /// proposing the next interval.
    ///
    /// A duplicate report for the same interval replaces the previous one.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::UnknownConnection`] for an out-of-range input.
    pub fn record_actual(
        &mut self,
        input: ConnectionId,
        actual: IntervalActual,
    ) -> Result<Option<IntervalIndex>, ProtocolError> {
        if input.idx() >= self.input_live.len() {
            return Err(ProtocolError::UnknownConnection(input));
        }
        let index = actual.index;
        let input_count = self.input_live.len();
        let pending = self
            .pending
            .entry(index.as_u64())
            .or_insert_with(|| Pending::new(input_count));
        pending.reports[input.idx()] = Some(actual);

        if !self.interval_fully_reported(index) {
            return Ok(None);
        }
        self.complete_interval(index);
        Ok(Some(index))
    }

    /// Marks an input as failed so aggregation no longer waits on it, and
    /// re-checks intervals that were only blocked on its report.
    ///
    /// Returns the indices of intervals completed by the removal.
    pub fn note_input_failed(&mut self, failed: ConnectionId) -> Vec<IntervalIndex> {
        if failed.idx() >= self.input_live.len() {
            return Vec::new();
        }
        self.input_live[failed.idx()] = false;
        let candidates: Vec<IntervalIndex> =
            self.pending.keys().map(|&k| IntervalIndex(k)).collect();
        let mut completed = Vec::new();
        for index in candidates {
            if self.interval_fully_reported(index) {
                self.complete_interval(index);
                completed.push(index);
            }
        }
        completed
    }

    /// Reduces the compute count used for future interval boundaries after a
    /// compute-side failure.
    pub fn note_compute_count(&mut self, compute_count: u32) {
        assert!(compute_count > 0, "compute_count must be > 0");
        self.compute_count = compute_count;
    }

    fn interval_fully_reported(&self, index: IntervalIndex) -> bool {
        let Some(pending) = self.pending.get(&index.as_u64()) else {
            return false;
        };
        self.input_live
            .iter()
            .zip(&pending.reports)
            .all(|(&live, report)| !live || report.is_some())
    }

    fn complete_interval(&mut self, index: IntervalIndex) {
        let Some(pending) = self.pending.remove(&index.as_u64()) else {
            return;
        };
        let reports: Vec<IntervalActual> =
            pending.reports.into_iter().flatten().collect();
        if reports.is_empty() {
            // Every reporter died before reporting; nothing to aggregate.
            return;
        }

        let earliest = reports.iter().map(|r| r.start_time).min().unwrap_or(Timestamp::ZERO);
        let latest = reports.iter().map(|r| r.start_time).max().unwrap_or(Timestamp::ZERO);
        let start_time = Timestamp::from_micros((earliest.as_micros() + latest.as_micros()) / 2);

        let mut durations: Vec<TimeSpan> = reports.iter().map(|r| r.duration).collect();
        let duration = median_span(&mut durations);

        let round_sum: u64 = reports.iter().map(|r| u64::from(r.round_count)).sum();
        let count = reports.len() as u64;
        // Average, rounded to nearest.
        let round_count = ((round_sum + count / 2) / count) as u32;

        let actual = AuthoritativeActual { index, start_time, duration, round_count };
        self.last_actual = Some(actual);
        debug!(interval = %index, duration = %duration, rounds = round_count, "interval actual");

        let judged = self.proposals.get(&index.as_u64()).copied();
        if let Some(proposed) = judged {
            self.accuracy.push_back((proposed.duration, duration));
            while self.accuracy.len() > self.history_len {
                self.accuracy.pop_front();
            }
        }
        self.actual_durations.push_back(duration);
        while self.actual_durations.len() > self.history_len {
            self.actual_durations.pop_front();
        }

        // Drop proposals at or below the completed interval; they have been
        // judged and will not be asked about again.
        self.proposals.retain(|&k, _| k > index.as_u64());

        // Pacers finishing `index` extrapolate `index + 1` themselves at
        // rollover; a proposal for it could never arrive in time. The
        // earliest useful proposal is `index + 2`.
        let target = IntervalIndex(index.as_u64() + 2);
        if self.next_proposal < target {
            self.next_proposal = target;
        }
        if self.next_proposal == target {
            self.propose_next(judged, actual);
        }
    }

    /// Mean |proposed - actual| over the accuracy window, as a percentage of
    /// the actual duration.
    fn mean_deviation_percent(&self) -> Option<u64> {
        if self.accuracy.is_empty() {
            return None;
        }
        let mut percent_sum = 0u64;
        for &(proposed, actual) in &self.accuracy {
            if actual == TimeSpan::ZERO {
                return None;
            }
            let diff = proposed.as_micros().abs_diff(actual.as_micros());
            percent_sum += diff * 100 / actual.as_micros();
        }
        Some(percent_sum / self.accuracy.len() as u64)
    }

    fn propose_next(&mut self, judged: Option<IntervalInfo>, actual: AuthoritativeActual) {
        let index = self.next_proposal;

        let mut durations: Vec<TimeSpan> = self.actual_durations.iter().copied().collect();
        let baseline = median_span(&mut durations);

        match self.mean_deviation_percent() {
            Some(dev) if dev < u64::from(self.speedup_threshold_percent) => {
                if self.speedup_remaining == 0 {
                    info!(interval = %index, deviation_percent = dev, "entering speed-up phase");
                    self.speedup_remaining = self.speedup_interval_limit;
                }
            }
            _ => self.speedup_remaining = 0,
        }
        let duration = if self.speedup_remaining > 0 {
            self.speedup_remaining -= 1;
            baseline
                .saturating_mul(u64::from(100 - self.speedup_percent))
                .div_by(100)
        } else {
            baseline
        };

        // The proposed interval sits one extrapolated interval past the
        // judged one. The gap chains with the judged proposal's own round
        // and compute counts, matching what the pacers extrapolate, so the
        // timeslice stream stays seamless.
        let start_timeslice = judged.map_or_else(
            || {
                TimesliceIndex(
                    index.as_u64()
                        * u64::from(self.rounds_per_interval)
                        * u64::from(self.compute_count),
                )
            },
            |prev| {
                let gap = u64::from(prev.round_count) * u64::from(prev.compute_count);
                TimesliceIndex(prev.end_timeslice.as_u64() + 1 + gap)
            },
        );
        let bridge = judged.map_or(actual.duration, |prev| prev.duration);
        let start_time = actual.start_time + actual.duration + bridge;

        let slices = u64::from(self.rounds_per_interval) * u64::from(self.compute_count);
        let info = IntervalInfo {
            index,
            start_timeslice,
            end_timeslice: TimesliceIndex(start_timeslice.as_u64() + slices - 1),
            round_count: self.rounds_per_interval,
            start_time,
            duration,
            compute_count: self.compute_count,
        };
        debug!(interval = %index, duration = %duration, "interval proposed");
        self.proposals.insert(index.as_u64(), info);
        self.next_proposal = index.next();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CoreConfig {
        CoreConfig::new(4, 3).with_rounds_per_interval(10)
    }

    fn actual(index: u64, start_us: u64, duration_us: u64, rounds: u32) -> IntervalActual {
        IntervalActual {
            index: IntervalIndex(index),
            start_time: Timestamp::from_micros(start_us),
            duration: TimeSpan::from_micros(duration_us),
            round_count: rounds,
            blockage: vec![0; 3],
        }
    }

    fn conn(n: u32) -> ConnectionId {
        ConnectionId(n)
    }

    /// Drives one interval to completion with identical reports.
    fn report_all(c: &mut IntervalCoordinator, index: u64, duration_us: u64) {
        for input in 0..4 {
            c.record_actual(conn(input), actual(index, index * 1_000, duration_us, 10)).unwrap();
        }
    }

    #[test]
    fn seeds_interval_zero_at_initial_pace() {
        let cfg = config();
        let c = IntervalCoordinator::new(&cfg);
        let seed = c.proposal(IntervalIndex::ZERO).expect("seed proposal");
        assert_eq!(seed.duration, cfg.initial_interval_duration);
        assert_eq!(seed.start_timeslice, TimesliceIndex::ZERO);
        assert_eq!(seed.end_timeslice, TimesliceIndex(29)); // 10 rounds x 3 computes
    }

    #[test]
    fn interval_completes_only_after_every_input_reports() {
        let mut c = IntervalCoordinator::new(&config());
        for input in 0..3 {
            assert_eq!(
                c.record_actual(conn(input), actual(0, 0, 95_000, 10)).unwrap(),
                None,
                "incomplete report set must not complete the interval"
            );
        }
        let done = c.record_actual(conn(3), actual(0, 0, 95_000, 10)).unwrap();
        assert_eq!(done, Some(IntervalIndex(0)));
        assert!(c.proposal(IntervalIndex(1)).is_none(), "pacers extrapolate interval 1 themselves");
        assert!(c.proposal(IntervalIndex(2)).is_some(), "proposal lands two intervals ahead");
    }

    #[test]
    fn authoritative_actual_uses_midpoint_median_and_average() {
        let mut c = IntervalCoordinator::new(&config());
        c.record_actual(conn(0), actual(0, 100, 90_000, 10)).unwrap();
        c.record_actual(conn(1), actual(0, 300, 100_000, 10)).unwrap();
        c.record_actual(conn(2), actual(0, 200, 110_000, 11)).unwrap();
        c.record_actual(conn(3), actual(0, 180, 400_000, 9)).unwrap();

        let a = c.last_actual().expect("completed");
        assert_eq!(a.start_time, Timestamp::from_micros(200)); // midpoint of 100 and 300
        assert_eq!(a.duration, TimeSpan::from_micros(105_000)); // median, not mean
        assert_eq!(a.round_count, 10); // (10+10+11+9)/4
    }

    #[test]
    fn proposal_boundaries_chain_without_gaps() {
        let mut c = IntervalCoordinator::new(&config());
        report_all(&mut c, 0, 100_000);
        // Seed 0 ends at timeslice 29; the extrapolated interval 1 covers
        // 30..=59, so proposal 2 picks up at 60.
        let p2 = *c.proposal(IntervalIndex(2)).expect("proposal 2");
        assert_eq!(p2.start_timeslice, TimesliceIndex(60));
        assert_eq!(p2.end_timeslice, TimesliceIndex(89));

        report_all(&mut c, 1, 100_000);
        let p3 = *c.proposal(IntervalIndex(3)).expect("proposal 3");
        assert_eq!(p3.start_timeslice, TimesliceIndex(90));
    }

    #[test]
    fn outlier_interval_shifts_proposal_by_at_most_the_speedup_percent() {
        let cfg = config();
        let mut c = IntervalCoordinator::new(&cfg);
        report_all(&mut c, 0, 100_000);
        report_all(&mut c, 1, 102_000);
        // One interval 10x slower than the rest.
        report_all(&mut c, 2, 1_000_000);
        report_all(&mut c, 3, 98_000);

        let proposed = c.proposal(IntervalIndex(5)).expect("proposal 5").duration.as_micros();
        let baseline = 101_000; // median of the window
        let floor = baseline * u64::from(100 - cfg.speedup_percent) / 100;
        assert!(
            proposed >= floor && proposed <= baseline,
            "proposal {proposed} outside [{floor}, {baseline}]"
        );
    }

    #[test]
    fn speedup_phase_is_bounded() {
        let cfg = config();
        let mut c = IntervalCoordinator::new(&cfg);
        // Interval 0 actual matches the seed proposal exactly: deviation 0,
        // below threshold, so the coordinator speeds up.
        report_all(&mut c, 0, cfg.initial_interval_duration.as_micros());
        let shrunk = cfg
            .initial_interval_duration
            .saturating_mul(u64::from(100 - cfg.speedup_percent))
            .div_by(100);
        assert_eq!(
            c.proposal(IntervalIndex(2)).unwrap().duration,
            shrunk,
            "speed-up shrinks the median"
        );

        report_all(&mut c, 1, cfg.initial_interval_duration.as_micros());
        assert_eq!(c.proposal(IntervalIndex(3)).unwrap().duration, shrunk, "phase still running");

        // The workload does not actually speed up, so deviation climbs to
        // the threshold and the next proposal returns to the plain median.
        report_all(&mut c, 2, cfg.initial_interval_duration.as_micros());
        assert_eq!(
            c.proposal(IntervalIndex(4)).unwrap().duration,
            cfg.initial_interval_duration,
            "phase must not stick"
        );
    }

    #[test]
    fn failed_input_no_longer_blocks_aggregation() {
        let mut c = IntervalCoordinator::new(&config());
        for input in 0..3 {
            c.record_actual(conn(input), actual(0, 0, 100_000, 10)).unwrap();
        }
        // Input 3 dies without reporting.
        let completed = c.note_input_failed(conn(3));
        assert_eq!(completed, vec![IntervalIndex(0)]);
        assert!(c.proposal(IntervalIndex(2)).is_some());

        // Subsequent intervals need only the three survivors.
        for input in 0..3 {
            c.record_actual(conn(input), actual(1, 0, 100_000, 10)).unwrap();
        }
        assert!(c.proposal(IntervalIndex(3)).is_some());
    }

    #[test]
    fn unknown_input_is_rejected() {
        let mut c = IntervalCoordinator::new(&config());
        assert!(matches!(
            c.record_actual(conn(9), actual(0, 0, 1, 1)),
            Err(ProtocolError::UnknownConnection(_))
        ));
    }
}
