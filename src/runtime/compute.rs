//! Compute-node event loop.
//!
//! # Design
//!
//! The mirror of the input loop: one single-threaded cooperative pass
//! drains transport events into the [`ComputeCore`] façade and the
//! per-input receive state, fires due timers (liveness and completion
//! sweeps), and issues acknowledge/status exchanges when something changed.
//! The compute side consumes contributions as they arrive, so its ack
//! pointers trail the peer's write pointers by at most one loop pass.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::CoreConfig;
use crate::failure::{FailureMonitor, LivenessStatus};
use crate::flow::FlowPointers;
use crate::protocol::{ComputeStatus, InputStatus, StatusMessage};
use crate::runtime::mediator::ComputeCore;
use crate::runtime::scheduler::TimerQueue;
use crate::time::Timestamp;
use crate::trace::{debug, warn};
use crate::transport::{PendingSend, Transport, TransportEvent};
use crate::types::{ConnectionId, HeartbeatSeq, IntervalIndex, TimesliceIndex};

/// Loop-internal timer payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    LivenessSweep,
    CompletionSweep,
}

/// Per-input-connection receive state.
struct Inbound {
    /// Peer write pointers as last announced.
    peer_write: FlowPointers,
    /// What this node has consumed and released back.
    acked: FlowPointers,
    /// Acked pointers as of the last issued exchange.
    synced_ack: FlowPointers,
    /// The interval the input last asked a proposal for.
    asked: IntervalIndex,
    /// Last heartbeat sequence received, echoed back.
    heartbeat: HeartbeatSeq,
    /// The mandatory startup exchange has been issued.
    started: bool,
    peer_finalized: bool,
    finalize_sent: bool,
    in_flight: Option<PendingSend>,
}

impl Inbound {
    fn new() -> Self {
        Self {
            peer_write: FlowPointers::default(),
            acked: FlowPointers::default(),
            synced_ack: FlowPointers::default(),
            asked: IntervalIndex::ZERO,
            heartbeat: HeartbeatSeq(0),
            started: false,
            peer_finalized: false,
            finalize_sent: false,
            in_flight: None,
        }
    }

    fn due_for_sync(&self) -> bool {
        if self.finalize_sent {
            return false;
        }
        !self.started || self.acked != self.synced_ack || self.peer_finalized
    }
}

/// One compute node's coordination loop over its input connections.
pub struct ComputeNode<T: Transport> {
    id: ConnectionId,
    config: CoreConfig,
    transport: T,
    core: ComputeCore,
    monitor: FailureMonitor,
    inbound: Vec<Inbound>,
    timers: TimerQueue<TimerKind>,
    heartbeat: HeartbeatSeq,
    abort: Arc<AtomicBool>,
    finalizing: bool,
}

impl<T: Transport> ComputeNode<T> {
    /// Builds the loop state for compute node `id` and schedules the first
    /// sweeps at `now`.
    #[must_use]
    pub fn new(
        config: &CoreConfig,
        id: ConnectionId,
        transport: T,
        abort: Arc<AtomicBool>,
        now: Timestamp,
    ) -> Self {
        let mut timers = TimerQueue::new();
        timers.schedule(now + config.initial_latency, TimerKind::LivenessSweep);
        timers.schedule(now + config.completion_timeout, TimerKind::CompletionSweep);
        Self {
            id,
            config: config.clone(),
            transport,
            core: ComputeCore::new(config),
            monitor: FailureMonitor::new(config, config.input_count, now),
            inbound: (0..config.input_count).map(|_| Inbound::new()).collect(),
            timers,
            heartbeat: HeartbeatSeq::generate(),
            abort,
            finalizing: false,
        }
    }

    /// The coordination core, for inspection and application callbacks.
    #[must_use]
    pub const fn core(&self) -> &ComputeCore {
        &self.core
    }

    /// The completion watermark.
    #[must_use]
    pub fn watermark(&self) -> Option<TimesliceIndex> {
        self.core.watermark()
    }

    /// True once every input connection has completed its finalize
    /// handshake.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.inbound.iter().all(|rx| rx.finalize_sent)
    }

    /// Earliest deadline the loop is waiting on, if any.
    pub fn next_deadline(&mut self) -> Option<Timestamp> {
        self.timers.next_deadline()
    }

    /// Runs one cooperative loop pass at `now`.
    pub fn run_once(&mut self, now: Timestamp) {
        while let Some(event) = self.transport.poll() {
            self.dispatch(event, now);
        }

        if self.abort.load(Ordering::Relaxed) && !self.finalizing {
            self.finalizing = true;
            debug!(node = %self.id, "abort requested, echoing finalize to all inputs");
        }

        let mut due = Vec::new();
        while let Some(kind) = self.timers.pop_due(now) {
            due.push(kind);
        }
        for kind in due {
            match kind {
                TimerKind::LivenessSweep => self.sweep_liveness(now),
                TimerKind::CompletionSweep => self.sweep_completions(now),
            }
        }

        self.flush_status(now);
    }

    fn dispatch(&mut self, event: TransportEvent, now: Timestamp) {
        match event {
            TransportEvent::SendComplete { connection, pending } => {
                if let Some(rx) = self.inbound.get_mut(connection.idx()) {
                    if rx.in_flight == Some(pending) {
                        rx.in_flight = None;
                    }
                }
            }
            TransportEvent::Heartbeat { connection, seq } => {
                if let Err(err) = self.monitor.note_heartbeat(connection, now) {
                    warn!(error = %err, "heartbeat dispatch failed");
                    return;
                }
                if let Some(rx) = self.inbound.get_mut(connection.idx()) {
                    rx.heartbeat = seq;
                }
            }
            TransportEvent::Received { connection, message } => {
                if let Err(err) = self.monitor.note_heartbeat(connection, now) {
                    warn!(error = %err, "heartbeat dispatch failed");
                    return;
                }
                match message {
                    StatusMessage::Input(status) => self.on_status(connection, status, now),
                    StatusMessage::Compute(_) => {
                        warn!(
                            connection = %connection,
                            "compute status received by a compute node, discarded"
                        );
                    }
                }
            }
        }
    }

    fn on_status(&mut self, input: ConnectionId, status: InputStatus, now: Timestamp) {
        let Some(rx) = self.inbound.get_mut(input.idx()) else {
            warn!(connection = %input, "status from unknown connection, discarded");
            return;
        };
        if status.write.data < rx.peer_write.data || status.write.desc < rx.peer_write.desc {
            warn!(connection = %input, "write pointers moved backwards, discarded");
            return;
        }
        rx.peer_write = status.write;
        rx.asked = status.asking_interval;
        rx.heartbeat = status.heartbeat;
        if status.finalize {
            rx.peer_finalized = true;
        }
        // The coordination core only needs the timeslice of each record;
        // payload consumption is the application's side of the seam.
        rx.acked = status.write;

        for record in &status.descriptors {
            match self.core.on_contribution(input, record.timeslice, now) {
                Ok(_) => {}
                Err(err) => warn!(connection = %input, error = %err, "contribution discarded"),
            }
        }
        if let Some(actual) = status.interval_actual {
            if let Err(err) = self.core.on_interval_actual(input, actual) {
                warn!(connection = %input, error = %err, "interval actual discarded");
            }
        }
        if let Some(report) = status.failure_report {
            match self.core.on_failure_report(report, now) {
                Ok(Some(decision)) => {
                    debug!(failed = %decision.failed, "decision reached from piggybacked report");
                }
                Ok(None) => {}
                Err(err) => warn!(connection = %input, error = %err, "failure report discarded"),
            }
        }
        if let Some((role, failed)) = status.decision_ack {
            if let Err(err) = self.core.on_decision_ack(failed, role, input) {
                warn!(connection = %input, error = %err, "decision ack discarded");
            }
        }
    }

    fn sweep_liveness(&mut self, now: Timestamp) {
        self.heartbeat = self.heartbeat.next();
        for input in self.core.live_inputs() {
            if self.monitor.status(input) == Some(LivenessStatus::TimedOut) {
                continue;
            }
            if let Err(err) = self.transport.send_heartbeat(input, self.heartbeat) {
                warn!(connection = %input, error = %err, "heartbeat send failed");
            }
        }
        for transition in self.monitor.sweep(now) {
            match transition.status {
                LivenessStatus::Inactive => {
                    self.heartbeat = self.heartbeat.next();
                    if let Err(err) =
                        self.transport.send_heartbeat(transition.connection, self.heartbeat)
                    {
                        warn!(error = %err, "probe heartbeat failed");
                    }
                }
                LivenessStatus::TimedOut => {
                    // Stop waiting on the silent input; its failure decision
                    // still needs the surviving inputs' reports.
                    match self.core.on_reporter_lost(transition.connection, now) {
                        Ok(_) => {}
                        Err(err) => warn!(error = %err, "reporter removal failed"),
                    }
                }
                LivenessStatus::Active => {}
            }
        }
        self.timers.schedule(now + self.config.initial_latency, TimerKind::LivenessSweep);
    }

    fn sweep_completions(&mut self, now: Timestamp) {
        let swept = self.core.sweep_completions(now);
        if !swept.is_empty() {
            warn!(count = swept.len(), "timeslices timed out awaiting contributions");
        }
        self.timers.schedule(now + self.config.completion_timeout, TimerKind::CompletionSweep);
    }

    fn flush_status(&mut self, now: Timestamp) {
        for idx in 0..self.inbound.len() {
            let connection = ConnectionId(idx as u32);
            let pending_decision = self
                .core
                .decisions_due(now)
                .into_iter()
                .find(|(to, _)| *to == connection)
                .map(|(_, decision)| decision);

            let rx = &self.inbound[idx];
            if rx.in_flight.is_some() {
                continue;
            }
            let finalize_now = (rx.peer_finalized || self.finalizing) && !rx.finalize_sent;
            if !rx.due_for_sync() && pending_decision.is_none() && !finalize_now {
                continue;
            }

            let status = ComputeStatus {
                ack: rx.acked,
                proposal: self.core.proposal(rx.asked).copied(),
                finalize: finalize_now,
                abort: self.finalizing,
                decision: pending_decision,
                heartbeat_ack: rx.heartbeat,
                stamp: now,
            };
            match self.transport.send(connection, StatusMessage::Compute(status)) {
                Ok(pending) => {
                    if let Some(decision) = pending_decision {
                        self.core.mark_decision_broadcast(&decision, connection, now);
                    }
                    let rx = &mut self.inbound[idx];
                    rx.in_flight = Some(pending);
                    rx.synced_ack = rx.acked;
                    rx.started = true;
                    if finalize_now {
                        rx.finalize_sent = true;
                    }
                }
                Err(err) => {
                    warn!(connection = %connection, error = %err, "status send failed, will retry");
                }
            }
        }
    }
}
