//! Interval metadata exchanged between inputs and computes.

use serde::{Deserialize, Serialize};

use crate::time::{TimeSpan, Timestamp};
use crate::types::{IntervalIndex, TimesliceIndex};

/// A proposed interval: the pace every input should follow.
///
/// Created strictly in increasing index order by the coordinator. Once
/// proposed, the `start_timeslice..=end_timeslice` boundaries are immutable;
/// only the duration statistics may later be replaced by observed actuals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalInfo {
    pub index: IntervalIndex,
    /// First timeslice of the interval.
    pub start_timeslice: TimesliceIndex,
    /// Last timeslice of the interval (inclusive).
    pub end_timeslice: TimesliceIndex,
    /// Rounds in the interval.
    pub round_count: u32,
    /// Expected start on the compute fleet's reference timeline.
    pub start_time: Timestamp,
    /// Proposed wall duration of the whole interval.
    pub duration: TimeSpan,
    /// Compute nodes participating (timeslices per round).
    pub compute_count: u32,
}

impl IntervalInfo {
    /// Wall duration of one round under this proposal.
    #[must_use]
    pub fn duration_per_round(&self) -> TimeSpan {
        self.duration.div_by(u64::from(self.round_count))
    }

    /// The proposal extrapolated one interval forward at the same pace.
    ///
    /// Used by pacers when the next proposal has not arrived yet; pacing is
    /// never blocked waiting for one.
    #[must_use]
    pub fn extrapolate(&self) -> Self {
        let slices = u64::from(self.round_count) * u64::from(self.compute_count);
        let start = self.end_timeslice.next();
        Self {
            index: self.index.next(),
            start_timeslice: start,
            end_timeslice: TimesliceIndex(start.as_u64() + slices - 1),
            round_count: self.round_count,
            start_time: self.start_time + self.duration,
            duration: self.duration,
            compute_count: self.compute_count,
        }
    }
}

/// An input's measured timing for one fully-sent interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalActual {
    pub index: IntervalIndex,
    /// Observed start, corrected onto the compute fleet's timeline.
    pub start_time: Timestamp,
    /// Observed wall duration.
    pub duration: TimeSpan,
    /// Rounds actually sent.
    pub round_count: u32,
    /// Per-compute blockage histogram: rounds this input stalled waiting for
    /// remote buffer room on each compute connection.
    pub blockage: Vec<u64>,
}

/// Median of a set of spans. The median — not the mean — resists one slow or
/// fast outlier dominating the pace for the whole fleet.
///
/// # Panics
///
/// Panics if `spans` is empty.
#[must_use]
pub fn median_span(spans: &mut [TimeSpan]) -> TimeSpan {
    assert!(!spans.is_empty(), "median of empty set");
    spans.sort_unstable();
    let mid = spans.len() / 2;
    if spans.len() % 2 == 1 {
        spans[mid]
    } else {
        TimeSpan::from_micros((spans[mid - 1].as_micros() + spans[mid].as_micros()) / 2)
    }
}
