//! Input-node event loop.
//!
//! # Design
//!
//! One single-threaded cooperative loop per input node process. Each
//! [`InputNode::run_once`] pass (a) drains transport events and dispatches
//! them synchronously into the ledgers, pacer and monitor, (b) checks the
//! process-wide abort flag, (c) fires due timers (pacing rounds, liveness
//! sweeps), and (d) issues whatever status exchanges became due. Nothing
//! blocks; all waiting is a timer deadline.
//!
//! Protocol violations from a misbehaving peer are logged and discarded —
//! they never take the loop down.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::CoreConfig;
use crate::failure::{FailureDecision, FailureMonitor, FailureReport, LivenessStatus};
use crate::flow::FlowLedger;
use crate::pacing::{IntervalActual, IntervalPacer, SkewEstimator, TargetSelector};
use crate::protocol::{ComputeStatus, DescriptorRecord, InputStatus, StatusMessage};
use crate::runtime::scheduler::TimerQueue;
use crate::time::Timestamp;
use crate::trace::{debug, warn};
use crate::transport::{PendingSend, Transport, TransportEvent};
use crate::types::{ConnectionId, DescIndex, HeartbeatSeq, Role, TimesliceIndex};

/// Application seam producing this input's share of each timeslice.
///
/// `contribution_size` must return a stable size for a given timeslice until
/// that timeslice has been sent; the loop may ask more than once while
/// waiting for buffer room.
pub trait ContributionSource {
    /// Payload size in bytes of this input's contribution to `ts`.
    fn contribution_size(&mut self, ts: TimesliceIndex) -> u64;
}

/// Loop-internal timer payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    PaceRound,
    LivenessSweep,
}

/// Entries retained for round-trip correlation; late echoes past this many
/// newer heartbeats are simply not sampled.
const HEARTBEAT_WINDOW: usize = 32;

/// Sliding window of recently sent heartbeat sequences and their send times.
///
/// When a compute status echoes one of them, the elapsed round trip (halved)
/// gives the one-way latency a skew-refinement sample needs.
struct HeartbeatLog {
    current: HeartbeatSeq,
    sent: VecDeque<(HeartbeatSeq, Timestamp)>,
}

impl HeartbeatLog {
    fn new() -> Self {
        Self { current: HeartbeatSeq::generate(), sent: VecDeque::new() }
    }

    /// Advances to a fresh sequence and remembers its send time.
    fn advance(&mut self, now: Timestamp) -> HeartbeatSeq {
        self.current = self.current.next();
        self.sent.push_back((self.current, now));
        if self.sent.len() > HEARTBEAT_WINDOW {
            self.sent.pop_front();
        }
        self.current
    }

    /// Send time of an echoed sequence. The match and everything older are
    /// dropped; an unknown echo yields nothing.
    fn match_echo(&mut self, echo: HeartbeatSeq) -> Option<Timestamp> {
        let pos = self.sent.iter().position(|&(seq, _)| seq == echo)?;
        let (_, sent_at) = self.sent[pos];
        self.sent.drain(..=pos);
        Some(sent_at)
    }
}

/// Padding before a `bytes`-sized write at `offset` so it does not straddle
/// the wrap point of a ring of `size` bytes.
fn wrap_skip(offset: u64, bytes: u64, size: u64) -> u64 {
    let pos = offset & (size - 1);
    if pos + bytes > size { size - pos } else { 0 }
}

/// Per-compute-connection outbound state.
struct Outbound {
    ledger: FlowLedger,
    next_desc: u64,
    descriptors: Vec<DescriptorRecord>,
    actuals: Vec<IntervalActual>,
    reports: Vec<FailureReport>,
    acks: Vec<(Role, ConnectionId)>,
    in_flight: Option<PendingSend>,
}

impl Outbound {
    fn new(config: &CoreConfig) -> Self {
        Self {
            ledger: FlowLedger::new(config.data_ring_exp, config.desc_ring_exp),
            next_desc: 0,
            descriptors: Vec::new(),
            actuals: Vec::new(),
            reports: Vec::new(),
            acks: Vec::new(),
            in_flight: None,
        }
    }

    fn has_piggyback(&self) -> bool {
        !self.descriptors.is_empty()
            || !self.actuals.is_empty()
            || !self.reports.is_empty()
            || !self.acks.is_empty()
    }
}

/// One input node's coordination loop over its compute connections.
pub struct InputNode<T: Transport, S: ContributionSource> {
    id: ConnectionId,
    config: CoreConfig,
    transport: T,
    source: S,
    outbound: Vec<Outbound>,
    pacer: IntervalPacer,
    selector: TargetSelector,
    monitor: FailureMonitor,
    heartbeats: HeartbeatLog,
    timers: TimerQueue<TimerKind>,
    abort: Arc<AtomicBool>,
    finalizing: bool,
}

impl<T: Transport, S: ContributionSource> InputNode<T, S> {
    /// Builds the loop state for input node `id` and schedules the first
    /// pacing round and liveness sweep at `now`.
    #[must_use]
    pub fn new(
        config: &CoreConfig,
        id: ConnectionId,
        transport: T,
        source: S,
        abort: Arc<AtomicBool>,
        now: Timestamp,
    ) -> Self {
        let outbound = (0..config.compute_count).map(|_| Outbound::new(config)).collect();
        let mut timers = TimerQueue::new();
        timers.schedule(now, TimerKind::PaceRound);
        timers.schedule(now + config.initial_latency, TimerKind::LivenessSweep);
        Self {
            id,
            config: config.clone(),
            transport,
            source,
            outbound,
            pacer: IntervalPacer::new(config, SkewEstimator::new(), now),
            selector: TargetSelector::new(config.compute_count),
            monitor: FailureMonitor::new(config, config.compute_count, now),
            heartbeats: HeartbeatLog::new(),
            timers,
            abort,
            finalizing: false,
        }
    }

    /// Seeds the clock-skew estimate from the startup barrier round trip.
    pub fn seed_skew(
        &mut self,
        local_send: Timestamp,
        peer_stamp: Timestamp,
        local_recv: Timestamp,
    ) {
        self.pacer.skew_mut().seed_barrier(local_send, peer_stamp, local_recv);
    }

    /// Queues a failure report about a connection this node observed dead
    /// through means other than its own heartbeat monitor (the data source
    /// noticing a missing input peer, for example).
    pub fn report_failure(&mut self, report: FailureReport) {
        self.queue_report(report);
    }

    /// Requests a graceful shutdown: every connection drains, then sends
    /// its terminal exchange.
    pub fn request_finalize(&mut self) {
        self.finalizing = true;
        for outbound in &mut self.outbound {
            outbound.ledger.request_finalize(false);
        }
    }

    /// True once every compute connection has completed its finalize
    /// handshake.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.outbound.iter().all(|o| o.ledger.is_finalized())
    }

    /// Compute connections still in the send rotation.
    #[must_use]
    pub fn live_targets(&self) -> &[ConnectionId] {
        self.selector.live_targets()
    }

    /// The interval currently being paced.
    #[must_use]
    pub fn current_interval_index(&self) -> u64 {
        self.pacer.current_interval().index.as_u64()
    }

    /// Pace of the interval currently being sent, in microseconds.
    #[must_use]
    pub fn current_interval_duration_micros(&self) -> u64 {
        self.pacer.current_interval().duration.as_micros()
    }

    /// Current fleet-to-local clock offset estimate, in microseconds.
    #[must_use]
    pub fn skew_offset_micros(&self) -> i64 {
        self.pacer.skew().offset_micros()
    }

    /// Timeslices sent so far (first timeslice of the unsent round).
    #[must_use]
    pub fn sent_watermark(&self) -> TimesliceIndex {
        self.pacer.next_round_start()
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
            debug!(node = %self.id, "abort requested, finalizing all connections");
            for outbound in &mut self.outbound {
                outbound.ledger.request_finalize(true);
            }
        }

        // Collect first so a timer rescheduled for "now" waits for the next
        // pass instead of spinning this one.
        let mut due = Vec::new();
        while let Some(kind) = self.timers.pop_due(now) {
            due.push(kind);
        }
        for kind in due {
            match kind {
                TimerKind::PaceRound => self.pace(now),
                TimerKind::LivenessSweep => self.sweep(now),
            }
        }

        self.flush_status(now);
    }

    fn dispatch(&mut self, event: TransportEvent, now: Timestamp) {
        match event {
            TransportEvent::SendComplete { connection, pending } => {
                if let Some(outbound) = self.outbound.get_mut(connection.idx()) {
                    if outbound.in_flight == Some(pending) {
                        outbound.in_flight = None;
                    }
                }
            }
            TransportEvent::Heartbeat { connection, .. } => {
                if let Err(err) = self.monitor.note_heartbeat(connection, now) {
                    warn!(error = %err, "heartbeat dispatch failed");
                }
            }
            TransportEvent::Received { connection, message } => {
                if let Err(err) = self.monitor.note_heartbeat(connection, now) {
                    warn!(error = %err, "heartbeat dispatch failed");
                    return;
                }
                match message {
                    StatusMessage::Compute(status) => self.on_status(connection, status, now),
                    StatusMessage::Input(_) => {
                        warn!(
                            connection = %connection,
                            "input status received by an input node, discarded"
                        );
                    }
                }
            }
        }
    }

    fn on_status(&mut self, compute: ConnectionId, status: ComputeStatus, now: Timestamp) {
        let Some(outbound) = self.outbound.get_mut(compute.idx()) else {
            warn!(connection = %compute, "status from unknown connection, discarded");
            return;
        };
        if outbound.ledger.note_remote_ack(status.ack) {
            // The peer's ack also measures how far our own stream has
            // drained toward finalize.
            outbound.ledger.note_local_ack(status.ack.data, status.ack.desc);
        }
        if status.finalize {
            outbound.ledger.note_peer_finalize();
        }
        if let Some(sent_at) = self.heartbeats.match_echo(status.heartbeat_ack) {
            // An echoed heartbeat closes a round trip; half of it stands in
            // for the one-way latency of the peer's stamp.
            let one_way = now.since(sent_at).div_by(2);
            self.pacer.skew_mut().refine(status.stamp, now, one_way);
        }
        if let Some(proposal) = status.proposal {
            self.pacer.record_proposal(proposal);
        }
        if let Some(decision) = status.decision {
            self.on_decision(compute, decision);
        }
    }

    fn on_decision(&mut self, from: ConnectionId, decision: FailureDecision) {
        if decision.failed_role == Role::Compute
            && self.selector.live_targets().contains(&decision.failed)
        {
            debug!(
                failed = %decision.failed,
                trigger = %decision.timeslice_trigger,
                "removing failed compute from target rotation"
            );
            self.selector.remove(decision.failed, decision.timeslice_trigger);
            if let Some(outbound) = self.outbound.get_mut(decision.failed.idx()) {
                // No terminal exchange reaches a dead peer; close the ledger
                // locally.
                outbound.ledger.request_finalize(true);
                outbound.ledger.mark_synced();
            }
        }
        if let Some(outbound) = self.outbound.get_mut(from.idx()) {
            outbound.acks.push((decision.failed_role, decision.failed));
        }
    }

    /// Attempts to send the next round: one contribution per timeslice of
    /// the round, all-or-nothing so a round is never torn across retries.
    fn pace(&mut self, now: Timestamp) {
        if self.finalizing {
            return; // no new sends after abort; the timer stays unscheduled
        }
        let start = self.pacer.next_round_start();
        let computes = u64::from(self.pacer.current_interval().compute_count);

        let mut plan = Vec::with_capacity(computes as usize);
        // After a failure, several slices of one round may target the same
        // compute; room is checked against the round's cumulative plan.
        let mut planned = vec![(0u64, 0u64); self.outbound.len()];
        let mut blocked = false;
        for k in 0..computes {
            let ts = TimesliceIndex(start.as_u64() + k);
            let target = self.selector.target(ts);
            let size = self.source.contribution_size(ts);
            let Some(outbound) = self.outbound.get(target.idx()) else { continue };
            let (bytes_ahead, descs_ahead) = planned[target.idx()];
            let offset = outbound.ledger.data().write().wrapping_add(bytes_ahead);
            let skip = wrap_skip(offset, size, outbound.ledger.data().size());
            if !outbound.ledger.has_room(bytes_ahead + skip + size, descs_ahead + 1) {
                self.pacer.note_blocked(target);
                blocked = true;
            }
            planned[target.idx()] = (bytes_ahead + skip + size, descs_ahead + 1);
            plan.push((ts, target, size));
        }

        if !blocked {
            for (ts, target, size) in plan {
                let Some(outbound) = self.outbound.get_mut(target.idx()) else { continue };
                let skip = outbound.ledger.skip_before_write(size);
                let offset = outbound.ledger.data().write().wrapping_add(skip);
                outbound.ledger.note_sent(skip + size, 1);
                outbound.descriptors.push(DescriptorRecord {
                    index: DescIndex(outbound.next_desc),
                    timeslice: ts,
                    offset,
                    size,
                });
                outbound.next_desc += 1;
            }
            self.pacer.note_round_sent(now);
            if let Some(actual) = self.pacer.take_actual() {
                // Every compute runs its own coordinator; each gets the
                // report.
                for &target in self.selector.live_targets() {
                    if let Some(outbound) = self.outbound.get_mut(target.idx()) {
                        outbound.actuals.push(actual.clone());
                    }
                }
            }
        }
        self.timers.schedule(self.pacer.next_fire_time(now).max(now), TimerKind::PaceRound);
    }

    fn sweep(&mut self, now: Timestamp) {
        // Status exchanges fire only on change, so liveness traffic cannot
        // ride on them alone; every sweep sends one bare heartbeat per live
        // connection.
        let seq = self.heartbeats.advance(now);
        for &target in self.selector.live_targets() {
            if self.monitor.status(target) == Some(LivenessStatus::TimedOut) {
                continue;
            }
            if let Err(err) = self.transport.send_heartbeat(target, seq) {
                warn!(connection = %target, error = %err, "heartbeat send failed");
            }
        }
        for transition in self.monitor.sweep(now) {
            match transition.status {
                LivenessStatus::Inactive => {
                    // Probe actively instead of only listening.
                    let seq = self.heartbeats.advance(now);
                    if let Err(err) = self.transport.send_heartbeat(transition.connection, seq) {
                        warn!(error = %err, "probe heartbeat failed");
                    }
                }
                LivenessStatus::TimedOut => {
                    let report = FailureReport {
                        reporter: self.id,
                        failed: transition.connection,
                        failed_role: Role::Compute,
                        last_completed_desc: self.last_acked_desc(transition.connection),
                        timeslice_trigger: self.pacer.next_round_start(),
                    };
                    self.queue_report(report);
                }
                LivenessStatus::Active => {}
            }
        }
        self.timers.schedule(now + self.config.initial_latency, TimerKind::LivenessSweep);
    }

    /// Highest descriptor position the failed compute acknowledged, as
    /// locally known.
    fn last_acked_desc(&self, compute: ConnectionId) -> DescIndex {
        self.outbound
            .get(compute.idx())
            .map_or(DescIndex::ZERO, |o| DescIndex(o.ledger.desc().remote_ack()))
    }

    fn queue_report(&mut self, report: FailureReport) {
        for &target in self.selector.live_targets() {
            // Failed ids are role-qualified; only a compute failure names
            // one of our targets.
            if report.failed_role == Role::Compute && target == report.failed {
                continue;
            }
            if let Some(outbound) = self.outbound.get_mut(target.idx()) {
                outbound.reports.push(report);
            }
        }
    }

    fn flush_status(&mut self, now: Timestamp) {
        for idx in 0..self.outbound.len() {
            let connection = ConnectionId(idx as u32);
            let outbound = &self.outbound[idx];
            if outbound.in_flight.is_some() {
                continue;
            }
            if outbound.ledger.is_finalized()
                || (!outbound.ledger.due_for_sync() && !outbound.has_piggyback())
            {
                continue;
            }

            // Peek the piggyback cargo; it is only consumed once the send
            // was accepted, so a full transport queue retries losslessly.
            let batch_len = outbound.descriptors.len().min(self.config.max_desc_per_status);
            let descriptors = outbound.descriptors[..batch_len].to_vec();
            let interval_actual = outbound.actuals.first().cloned();
            let failure_report = outbound.reports.first().copied();
            let decision_ack = outbound.acks.first().copied();
            let (finalize, abort) = if outbound.ledger.terminal_due() {
                outbound.ledger.finalize_flags()
            } else {
                (false, false)
            };
            let heartbeat = self.heartbeats.advance(now);

            let status = InputStatus {
                write: outbound.ledger.write_pointers(),
                finalize,
                abort,
                descriptors,
                interval_actual,
                asking_interval: self.pacer.asking_about(),
                heartbeat,
                failure_report,
                decision_ack,
            };
            let sent_actual = status.interval_actual.is_some();
            let sent_report = status.failure_report.is_some();
            let sent_ack = status.decision_ack.is_some();
            match self.transport.send(connection, StatusMessage::Input(status)) {
                Ok(pending) => {
                    let outbound = &mut self.outbound[idx];
                    outbound.descriptors.drain(..batch_len);
                    if sent_actual {
                        outbound.actuals.remove(0);
                    }
                    if sent_report {
                        outbound.reports.remove(0);
                    }
                    if sent_ack {
                        outbound.acks.remove(0);
                    }
                    outbound.in_flight = Some(pending);
                    outbound.ledger.mark_synced();
                }
                Err(err) => {
                    warn!(connection = %connection, error = %err, "status send failed, will retry");
                }
            }
        }
    }
}
