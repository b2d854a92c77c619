//! Adaptive-timeout heartbeat liveness tracking.
//!
//! # Design
//!
//! Thresholds are factors over the *measured* inter-heartbeat latency, not
//! absolute durations, so a connection that naturally heartbeats slowly is
//! not suspected early and a fast one is not given a long leash. The
//! latency average runs over a bounded ring of recent samples.
//!
//! Transitions: `Active → Inactive` when silence exceeds
//! `inactive_factor x avg_latency` (the node then probes the connection
//! actively instead of only listening); `Inactive → TimedOut` when silence
//! exceeds `timeout_factor x avg_latency`. `TimedOut` is terminal: a
//! connection declared dead never comes back under the same id.

use std::collections::VecDeque;

use crate::config::CoreConfig;
use crate::protocol::ProtocolError;
use crate::time::{TimeSpan, Timestamp};
use crate::trace::{info, warn};
use crate::types::ConnectionId;

/// Liveness classification of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessStatus {
    /// Heartbeats arriving within tolerance.
    Active,
    /// Suspiciously silent; being probed.
    Inactive,
    /// Declared dead. Terminal.
    TimedOut,
}

/// One sweep-observed status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessTransition {
    pub connection: ConnectionId,
    pub status: LivenessStatus,
}

/// Per-connection heartbeat bookkeeping.
#[derive(Debug)]
struct HeartbeatState {
    last_received: Timestamp,
    latencies: VecDeque<TimeSpan>,
    status: LivenessStatus,
}

impl HeartbeatState {
    fn new(now: Timestamp) -> Self {
        Self { last_received: now, latencies: VecDeque::new(), status: LivenessStatus::Active }
    }

    fn avg_latency(&self, initial: TimeSpan) -> TimeSpan {
        if self.latencies.is_empty() {
            return initial;
        }
        let sum: u64 = self.latencies.iter().map(|l| l.as_micros()).sum();
        TimeSpan::from_micros(sum / self.latencies.len() as u64)
    }
}

/// Heartbeat liveness monitor over this node's connections.
pub struct FailureMonitor {
    states: Vec<HeartbeatState>,
    inactive_factor: u64,
    timeout_factor: u64,
    history: usize,
    initial_latency: TimeSpan,
}

impl FailureMonitor {
    /// Creates a monitor for `connection_count` connections, all `Active`
    /// with `now` as their last-received time.
    #[must_use]
    pub fn new(config: &CoreConfig, connection_count: u32, now: Timestamp) -> Self {
        Self {
            states: (0..connection_count).map(|_| HeartbeatState::new(now)).collect(),
            inactive_factor: config.inactive_factor,
            timeout_factor: config.timeout_factor,
            history: config.latency_history,
            initial_latency: config.initial_latency,
        }
    }

    /// Current classification of a connection.
    #[must_use]
    pub fn status(&self, connection: ConnectionId) -> Option<LivenessStatus> {
        self.states.get(connection.idx()).map(|s| s.status)
    }

    /// Average inter-heartbeat latency for a connection.
    #[must_use]
    pub fn avg_latency(&self, connection: ConnectionId) -> Option<TimeSpan> {
        self.states.get(connection.idx()).map(|s| s.avg_latency(self.initial_latency))
    }

    /// True when the connection should be actively probed with outbound
    /// heartbeats rather than only listened to.
    #[must_use]
    pub fn is_probing(&self, connection: ConnectionId) -> bool {
        self.status(connection) == Some(LivenessStatus::Inactive)
    }

    /// Records a received heartbeat (or any message serving as one).
    ///
    /// Resets an `Inactive` connection to `Active`. A `TimedOut` connection
    /// stays dead: its heartbeat is logged and dropped.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::UnknownConnection`] for an out-of-range connection.
    pub fn note_heartbeat(
        &mut self,
        connection: ConnectionId,
        now: Timestamp,
    ) -> Result<(), ProtocolError> {
        let state = self
            .states
            .get_mut(connection.idx())
            .ok_or(ProtocolError::UnknownConnection(connection))?;
        if state.status == LivenessStatus::TimedOut {
            warn!(connection = %connection, "heartbeat from a timed-out connection, ignored");
            return Ok(());
        }
        let latency = now.since(state.last_received);
        state.latencies.push_back(latency);
        while state.latencies.len() > self.history {
            state.latencies.pop_front();
        }
        state.last_received = now;
        state.status = LivenessStatus::Active;
        Ok(())
    }

    /// Reclassifies every connection against the current silence and returns
    /// the transitions observed, one step per sweep.
    pub fn sweep(&mut self, now: Timestamp) -> Vec<LivenessTransition> {
        let mut transitions = Vec::new();
        for (idx, state) in self.states.iter_mut().enumerate() {
            let connection = ConnectionId(idx as u32);
            let silence = now.since(state.last_received);
            let avg = state.avg_latency(self.initial_latency);
            match state.status {
                LivenessStatus::Active
                    if silence > avg.saturating_mul(self.inactive_factor) =>
                {
                    state.status = LivenessStatus::Inactive;
                    info!(connection = %connection, silence = %silence, "connection inactive, probing");
                    transitions
                        .push(LivenessTransition { connection, status: LivenessStatus::Inactive });
                }
                LivenessStatus::Inactive
                    if silence > avg.saturating_mul(self.timeout_factor) =>
                {
                    state.status = LivenessStatus::TimedOut;
                    warn!(connection = %connection, silence = %silence, "connection timed out");
                    transitions
                        .push(LivenessTransition { connection, status: LivenessStatus::TimedOut });
                }
                _ => {}
            }
        }
        transitions
    }
}
