//! Leaderless failure handling: adaptive liveness tracking and a
//! deterministic max/min consensus over per-connection failure reports.

pub mod consensus;
pub mod monitor;

pub use consensus::{FailureConsensus, FailureDecision, FailureReport};
pub use monitor::{FailureMonitor, LivenessStatus, LivenessTransition};
