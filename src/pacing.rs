//! Adaptive interval pacing.
//!
//! The timeslice stream is divided into **rounds** (one timeslice per compute
//! node) and **intervals** (a configured run of rounds). Each compute node's
//! [`IntervalCoordinator`] aggregates the actual interval timings reported by
//! every input into one authoritative statistic and proposes the next
//! interval's pace; each input's [`IntervalPacer`] translates the proposal,
//! corrected for clock skew, into concrete send deadlines.

pub mod coordinator;
pub mod interval;
pub mod pacer;
pub mod skew;

pub use coordinator::{AuthoritativeActual, IntervalCoordinator};
pub use interval::{IntervalActual, IntervalInfo};
pub use pacer::{IntervalPacer, TargetSelector};
pub use skew::SkewEstimator;
