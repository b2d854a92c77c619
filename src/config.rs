//! Timing and sizing configuration for the coordination core.
//!
//! These parameters control interval pacing, heartbeat liveness thresholds,
//! completion timeouts, and status-message batching. One [`CoreConfig`] is
//! built per node process and shared by reference with every component.
//!
//! # Tuning Guidelines
//!
//! - **Local cluster (< 1ms RTT)**: aggressive defaults, short sweeps.
//! - **Datacenter (1-10ms RTT)**: the defaults.
//! - **WAN (> 50ms RTT)**: long liveness factors, wide intervals.
//!
//! The liveness thresholds are *factors over measured latency*, not absolute
//! durations: a connection is suspected after `inactive_factor` times its
//! average inter-heartbeat latency of silence, and declared dead after
//! `timeout_factor` times. `timeout_factor > inactive_factor` always.

use crate::time::TimeSpan;

/// Configuration for one node's coordination core.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Timeslices per pacing round (one per compute node).
    ///
    /// Fixed at connection establishment; equals the compute-node count.
    pub compute_count: u32,

    /// Number of input nodes feeding the pipeline.
    pub input_count: u32,

    /// Rounds per pacing interval.
    ///
    /// Pacing statistics are aggregated and a fresh duration proposed once
    /// per interval. Larger values smooth the pace, smaller values react
    /// faster to load changes.
    ///
    /// **Default**: 128 rounds
    pub rounds_per_interval: u32,

    /// Initial proposed duration for interval 0, before any measurement.
    ///
    /// **Default**: 100ms
    pub initial_interval_duration: TimeSpan,

    /// Window of past intervals over which the proposed duration is derived
    /// (median of actuals) and proposal accuracy is judged.
    ///
    /// **Default**: 4 intervals
    pub duration_history: usize,

    /// Mean proposed-vs-actual deviation (percent of actual) below which the
    /// coordinator enters a speed-up phase.
    ///
    /// **Default**: 5%
    pub speedup_threshold_percent: u32,

    /// Percentage by which a speed-up phase shrinks the proposed duration.
    ///
    /// **Default**: 10%
    pub speedup_percent: u32,

    /// Maximum consecutive intervals a speed-up phase may run.
    ///
    /// Bounding the phase keeps one fast interval from permanently dragging
    /// the baseline pace; outside the phase the plain median is proposed.
    ///
    /// **Default**: 3 intervals
    pub speedup_interval_limit: u32,

    /// Silence factor over average heartbeat latency before a connection is
    /// classified `Inactive` and active probing begins.
    ///
    /// **Default**: 30
    pub inactive_factor: u64,

    /// Silence factor over average heartbeat latency before a connection is
    /// declared `TimedOut` (terminal).
    ///
    /// **Default**: 50
    pub timeout_factor: u64,

    /// Bounded history length for per-connection heartbeat latency averaging.
    ///
    /// **Default**: 16 samples
    pub latency_history: usize,

    /// Assumed inter-heartbeat latency before any sample has been observed.
    ///
    /// **Default**: 10ms
    pub initial_latency: TimeSpan,

    /// Age after which a pending timeslice record is swept to `TimedOut`.
    ///
    /// Guarantees the completion watermark cannot stall indefinitely behind
    /// one missing contribution.
    ///
    /// **Default**: 10s
    pub completion_timeout: TimeSpan,

    /// Wait before an unacknowledged failure-decision broadcast is resent.
    ///
    /// **Default**: 500ms
    pub decision_retransmit_wait: TimeSpan,

    /// Maximum descriptor records carried by one status message.
    ///
    /// Caps message size; additional records ride in subsequent messages.
    ///
    /// **Default**: 64 records
    pub max_desc_per_status: usize,

    /// Remote data ring size per connection, as a power-of-two exponent
    /// (bytes).
    ///
    /// **Default**: 20 (1 MiB)
    pub data_ring_exp: u32,

    /// Remote descriptor ring size per connection, as a power-of-two
    /// exponent (records).
    ///
    /// **Default**: 12 (4096 records)
    pub desc_ring_exp: u32,
}

impl CoreConfig {
    /// Creates a configuration with validation.
    ///
    /// # Panics
    ///
    /// Panics if `timeout_factor <= inactive_factor`, any count is zero, or
    /// the history windows are empty.
    #[must_use]
    pub fn new(input_count: u32, compute_count: u32) -> Self {
        let config = Self {
            compute_count,
            input_count,
            rounds_per_interval: 128,
            initial_interval_duration: TimeSpan::from_millis(100),
            duration_history: 4,
            speedup_threshold_percent: 5,
            speedup_percent: 10,
            speedup_interval_limit: 3,
            inactive_factor: 30,
            timeout_factor: 50,
            latency_history: 16,
            initial_latency: TimeSpan::from_millis(10),
            completion_timeout: TimeSpan::from_secs(10),
            decision_retransmit_wait: TimeSpan::from_millis(500),
            max_desc_per_status: 64,
            data_ring_exp: 20,
            desc_ring_exp: 12,
        };
        config.validate();
        config
    }

    /// Configuration for local clusters: tight liveness, short intervals.
    #[must_use]
    pub fn local(input_count: u32, compute_count: u32) -> Self {
        let config = Self {
            rounds_per_interval: 64,
            initial_interval_duration: TimeSpan::from_millis(20),
            inactive_factor: 10,
            timeout_factor: 20,
            initial_latency: TimeSpan::from_millis(2),
            completion_timeout: TimeSpan::from_secs(2),
            decision_retransmit_wait: TimeSpan::from_millis(100),
            ..Self::new(input_count, compute_count)
        };
        config.validate();
        config
    }

    /// Configuration for WAN links: generous liveness, wide intervals.
    #[must_use]
    pub fn wan(input_count: u32, compute_count: u32) -> Self {
        let config = Self {
            rounds_per_interval: 256,
            initial_interval_duration: TimeSpan::from_millis(500),
            inactive_factor: 60,
            timeout_factor: 120,
            initial_latency: TimeSpan::from_millis(100),
            completion_timeout: TimeSpan::from_secs(60),
            decision_retransmit_wait: TimeSpan::from_secs(2),
            ..Self::new(input_count, compute_count)
        };
        config.validate();
        config
    }

    /// Builder-style setter for the liveness factors.
    ///
    /// # Panics
    ///
    /// Panics if `timeout <= inactive`.
    #[must_use]
    pub fn with_liveness_factors(mut self, inactive: u64, timeout: u64) -> Self {
        self.inactive_factor = inactive;
        self.timeout_factor = timeout;
        self.validate();
        self
    }

    /// Builder-style setter for rounds per interval.
    #[must_use]
    pub fn with_rounds_per_interval(mut self, rounds: u32) -> Self {
        self.rounds_per_interval = rounds;
        self.validate();
        self
    }

    /// Builder-style setter for the completion timeout.
    #[must_use]
    pub const fn with_completion_timeout(mut self, timeout: TimeSpan) -> Self {
        self.completion_timeout = timeout;
        self
    }

    /// Builder-style setter for the initial heartbeat latency assumption.
    #[must_use]
    pub const fn with_initial_latency(mut self, latency: TimeSpan) -> Self {
        self.initial_latency = latency;
        self
    }

    fn validate(&self) {
        assert!(self.input_count > 0, "input_count must be > 0");
        assert!(self.compute_count > 0, "compute_count must be > 0");
        assert!(self.rounds_per_interval > 0, "rounds_per_interval must be > 0");
        assert!(self.duration_history > 0, "duration_history must be > 0");
        assert!(self.latency_history > 0, "latency_history must be > 0");
        assert!(self.max_desc_per_status > 0, "max_desc_per_status must be > 0");
        assert!(self.data_ring_exp < 64, "data_ring_exp must be < 64");
        assert!(self.desc_ring_exp < 64, "desc_ring_exp must be < 64");
        assert!(
            self.timeout_factor > self.inactive_factor,
            "timeout_factor must exceed inactive_factor"
        );
    }
}
