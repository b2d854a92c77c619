//! Compute-side coordination façade.
//!
//! # Design
//!
//! [`IntervalCoordinator`], [`CompletionTracker`] and [`FailureConsensus`]
//! each need the others' reactions: a failure decision must undo
//! completions, shrink the contribution set, and unblock interval
//! aggregation; a lost reporter may in turn complete other pending
//! proceedings. Instead of object-to-object back references, [`ComputeCore`]
//! owns all three and exposes only the cross-component operations, applying
//! each decision's consequences through a worklist so chained decisions
//! settle in one call.

use crate::completion::{ArrivalOutcome, CompletionTracker, TimesliceRecord};
use crate::config::CoreConfig;
use crate::failure::{FailureConsensus, FailureDecision, FailureReport};
use crate::pacing::{AuthoritativeActual, IntervalActual, IntervalCoordinator, IntervalInfo};
use crate::protocol::ProtocolError;
use crate::time::Timestamp;
use crate::trace::info;
use crate::types::{ConnectionId, IntervalIndex, Role, TimesliceIndex};

/// One compute node's coordination state, single-owner, no locks.
pub struct ComputeCore {
    coordinator: IntervalCoordinator,
    tracker: CompletionTracker,
    consensus: FailureConsensus,
    live_computes: u32,
    /// Resolved records within this many timeslices of the watermark are
    /// kept: a late failure report may still name a trigger slightly behind
    /// it.
    prune_margin: u64,
}

impl ComputeCore {
    /// Builds the core for one compute node process.
    #[must_use]
    pub fn new(config: &CoreConfig) -> Self {
        Self {
            coordinator: IntervalCoordinator::new(config),
            tracker: CompletionTracker::new(config.input_count, config.completion_timeout),
            consensus: FailureConsensus::new(
                config.input_count,
                config.decision_retransmit_wait,
            ),
            live_computes: config.compute_count,
            prune_margin: 2
                * u64::from(config.rounds_per_interval)
                * u64::from(config.compute_count),
        }
    }

    /// Records one contribution arrival.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::UnknownConnection`] for an out-of-range input.
    pub fn on_contribution(
        &mut self,
        input: ConnectionId,
        ts: TimesliceIndex,
        now: Timestamp,
    ) -> Result<ArrivalOutcome, ProtocolError> {
        self.tracker.note_arrival(input, ts, now)
    }

    /// Records one input's measured interval timing.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::UnknownConnection`] for an out-of-range input.
    pub fn on_interval_actual(
        &mut self,
        input: ConnectionId,
        actual: IntervalActual,
    ) -> Result<Option<IntervalIndex>, ProtocolError> {
        self.coordinator.record_actual(input, actual)
    }

    /// The pace proposal for `index`, for piggybacking onto outbound status.
    #[must_use]
    pub fn proposal(&self, index: IntervalIndex) -> Option<&IntervalInfo> {
        self.coordinator.proposal(index)
    }

    /// The completion watermark.
    #[must_use]
    pub fn watermark(&self) -> Option<TimesliceIndex> {
        self.tracker.last_ordered_completed()
    }

    /// Total timeslices completed so far.
    #[must_use]
    pub fn completed_count(&self) -> u64 {
        self.tracker.completed_count()
    }

    /// Sweeps stalled timeslices to `TimedOut` (watermark liveness), then
    /// prunes resolved records no failure decision can reach anymore: records
    /// further than the margin below the watermark, unless an open proceeding
    /// still pins an earlier trigger.
    pub fn sweep_completions(&mut self, now: Timestamp) -> Vec<TimesliceIndex> {
        let swept = self.tracker.sweep_timeouts(now);
        let floor = self.tracker.next_unresolved().as_u64().saturating_sub(self.prune_margin);
        let limit = match self.consensus.earliest_open_trigger() {
            Some(trigger) => trigger.as_u64().min(floor),
            None => floor,
        };
        self.tracker.prune_below(TimesliceIndex(limit));
        swept
    }

    /// Completion record view, for inspection.
    #[must_use]
    pub fn completion_record(&self, ts: TimesliceIndex) -> Option<&TimesliceRecord> {
        self.tracker.record(ts)
    }

    /// The most recently aggregated authoritative interval actual.
    #[must_use]
    pub const fn last_interval_actual(&self) -> Option<AuthoritativeActual> {
        self.coordinator.last_actual()
    }

    /// Folds one failure report in; if it completes the proceeding, the
    /// decision's consequences are applied before returning it.
    ///
    /// # Errors
    ///
    /// Propagates the consensus table's protocol violations (unknown or
    /// lost reporter, report for a decided failure).
    pub fn on_failure_report(
        &mut self,
        report: FailureReport,
        now: Timestamp,
    ) -> Result<Option<FailureDecision>, ProtocolError> {
        let mut decided = self.consensus.add_report(report)?;
        let mut queue: Vec<FailureDecision> = decided.into_iter().collect();
        // A failed input is itself a reporter; the proceeding about it (and
        // any other pending one) must not wait on its report.
        if report.failed_role == Role::Input && decided.is_none() {
            let unblocked = self.consensus.note_reporter_lost(report.failed);
            decided = unblocked
                .iter()
                .copied()
                .find(|d| d.failed == report.failed && d.failed_role == Role::Input);
            queue.extend(unblocked);
        }
        self.apply_decisions(queue, now)?;
        Ok(decided)
    }

    /// Marks an input reporter as lost (its heartbeat timed out locally).
    ///
    /// Pending proceedings stop waiting on it; any decisions that reach
    /// quorum through its removal are applied and returned.
    ///
    /// # Errors
    ///
    /// Propagates tracker violations while applying chained decisions.
    pub fn on_reporter_lost(
        &mut self,
        input: ConnectionId,
        now: Timestamp,
    ) -> Result<Vec<FailureDecision>, ProtocolError> {
        let decided = self.consensus.note_reporter_lost(input);
        self.apply_decisions(decided.clone(), now)?;
        Ok(decided)
    }

    /// Decisions awaiting (re)broadcast to surviving inputs.
    #[must_use]
    pub fn decisions_due(&self, now: Timestamp) -> Vec<(ConnectionId, FailureDecision)> {
        self.consensus.retransmit_due(now)
    }

    /// Notes that a decision was sent to one input at `now`.
    pub fn mark_decision_broadcast(
        &mut self,
        decision: &FailureDecision,
        to: ConnectionId,
        now: Timestamp,
    ) {
        self.consensus.mark_broadcast(decision, to, now);
    }

    /// Records an input's decision ack.
    ///
    /// Returns true once every surviving input has acked, i.e. the failed
    /// connection's capacity is reclaimed.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::UnknownConnection`] for an unknown input or an ack
    /// with no matching proceeding.
    pub fn on_decision_ack(
        &mut self,
        failed: ConnectionId,
        role: Role,
        from: ConnectionId,
    ) -> Result<bool, ProtocolError> {
        self.consensus.note_ack(failed, role, from)
    }

    /// Surviving input connections.
    #[must_use]
    pub fn live_inputs(&self) -> Vec<ConnectionId> {
        self.consensus.survivors()
    }

    /// Compute connections still in the pipeline.
    #[must_use]
    pub const fn live_computes(&self) -> u32 {
        self.live_computes
    }

    fn apply_decisions(
        &mut self,
        mut queue: Vec<FailureDecision>,
        now: Timestamp,
    ) -> Result<(), ProtocolError> {
        while let Some(decision) = queue.pop() {
            info!(
                failed = %decision.failed,
                role = %decision.failed_role,
                trigger = %decision.timeslice_trigger,
                "applying failure decision"
            );
            match decision.failed_role {
                Role::Input => {
                    // Everything the dead input contributed past the trigger
                    // will be resupplied; completions there are void.
                    self.tracker
                        .undo_arrivals_from(decision.failed, decision.timeslice_trigger)?;
                    self.tracker.shrink_connections(decision.failed, now)?;
                    self.coordinator.note_input_failed(decision.failed);
                    // The dead input was also a reporter; dropping it may
                    // complete other pending proceedings.
                    queue.extend(self.consensus.note_reporter_lost(decision.failed));
                }
                Role::Compute => {
                    self.live_computes -= 1;
                    self.coordinator.note_compute_count(self.live_computes);
                }
            }
        }
        Ok(())
    }
}
