//! Deterministic, leaderless consensus over failure reports.
//!
//! # Design
//!
//! When a connection is declared dead, every surviving reporter sends its
//! locally known facts: the highest descriptor it fully processed for the
//! failed peer and the earliest timeslice after which it has committed
//! nothing further involving that peer. Once one report per surviving
//! reporter has arrived, the decision is computed as
//!
//! - `last_completed_desc` = **max** over reports (the most permissive
//!   bound — never discard data any report confirms is safe), and
//! - `timeslice_trigger` = **min** over reports (the most conservative cut
//!   point — never proceed past data another node has not yet seen).
//!
//! Max and min are order-independent, so every surviving node that collects
//! the same report set computes a bit-identical decision without a leader
//! or any message-ordering requirement.
//!
//! The decision is broadcast to every surviving reporter; unacknowledged
//! broadcasts are retransmitted after a bounded wait. Only once every
//! survivor has acked is the failed connection's capacity considered
//! reclaimed.
//!
//! Reporter ids and failed ids live in different spaces: reporters index
//! this node's peer connections, while the failed id names a connection on
//! either side of the pipeline and is qualified by its [`Role`].
//! Proceedings are keyed by `(role, id)`, so only reporters are
//! bounds-checked here.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::protocol::ProtocolError;
use crate::time::{TimeSpan, Timestamp};
use crate::trace::{debug, info};
use crate::types::{ConnectionId, DescIndex, Role, TimesliceIndex};

/// One surviving reporter's locally known facts about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    pub reporter: ConnectionId,
    pub failed: ConnectionId,
    /// Which side of the pipeline the failed connection is on.
    pub failed_role: Role,
    /// Highest descriptor index the reporter fully processed for the failed
    /// connection.
    pub last_completed_desc: DescIndex,
    /// Earliest timeslice after which the reporter has committed no further
    /// work involving the failed connection.
    pub timeslice_trigger: TimesliceIndex,
}

/// The joint decision over all surviving reporters' facts. Immutable once
/// computed; only the ack bookkeeping around it grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDecision {
    pub failed: ConnectionId,
    pub failed_role: Role,
    pub last_completed_desc: DescIndex,
    pub timeslice_trigger: TimesliceIndex,
}

/// Collection state for one failed connection.
struct Proceeding {
    reports: Vec<Option<FailureReport>>,
    decision: Option<FailureDecision>,
    /// Which surviving reporters have acked the broadcast decision.
    acked: Vec<bool>,
    /// When the decision was last sent to each reporter.
    broadcast_at: Vec<Option<Timestamp>>,
}

impl Proceeding {
    fn new(reporter_count: usize) -> Self {
        Self {
            reports: vec![None; reporter_count],
            decision: None,
            acked: vec![false; reporter_count],
            broadcast_at: vec![None; reporter_count],
        }
    }

    fn decide(&mut self, live: &[bool]) -> Option<FailureDecision> {
        if self.decision.is_some() {
            return None;
        }
        let all_reported = live
            .iter()
            .zip(&self.reports)
            .all(|(&live, report)| !live || report.is_some());
        if !all_reported {
            return None;
        }
        let mut reports = self.reports.iter().flatten();
        let first = reports.next()?;
        let mut decision = FailureDecision {
            failed: first.failed,
            failed_role: first.failed_role,
            last_completed_desc: first.last_completed_desc,
            timeslice_trigger: first.timeslice_trigger,
        };
        for r in reports {
            decision.last_completed_desc = decision.last_completed_desc.max(r.last_completed_desc);
            decision.timeslice_trigger = decision.timeslice_trigger.min(r.timeslice_trigger);
        }
        self.decision = Some(decision);
        Some(decision)
    }
}

/// Report table and decision/ack bookkeeping for this node.
pub struct FailureConsensus {
    /// Surviving reporters. A lost reporter neither reports nor acks.
    live: Vec<bool>,
    proceedings: BTreeMap<(Role, u32), Proceeding>,
    retransmit_wait: TimeSpan,
}

impl FailureConsensus {
    /// Creates a consensus table over `reporter_count` reporter connections.
    #[must_use]
    pub fn new(reporter_count: u32, retransmit_wait: TimeSpan) -> Self {
        Self {
            live: vec![true; reporter_count as usize],
            proceedings: BTreeMap::new(),
            retransmit_wait,
        }
    }

    fn check(&self, reporter: ConnectionId) -> Result<(), ProtocolError> {
        if reporter.idx() >= self.live.len() || !self.live[reporter.idx()] {
            return Err(ProtocolError::UnknownConnection(reporter));
        }
        Ok(())
    }

    /// Surviving reporter ids.
    #[must_use]
    pub fn survivors(&self) -> Vec<ConnectionId> {
        self.live
            .iter()
            .enumerate()
            .filter_map(|(idx, &live)| live.then(|| ConnectionId(idx as u32)))
            .collect()
    }

    /// Adds one report for a failed connection, opening the proceeding on
    /// first report.
    ///
    /// Returns the decision once the last surviving reporter has reported.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::UnknownConnection`] if the reporter is out of
    ///   range or no longer a survivor.
    /// - [`ProtocolError::AlreadyDecided`] if a decision for this failure
    ///   already exists.
    pub fn add_report(
        &mut self,
        report: FailureReport,
    ) -> Result<Option<FailureDecision>, ProtocolError> {
        self.check(report.reporter)?;

        let reporter_count = self.live.len();
        let proceeding = self
            .proceedings
            .entry((report.failed_role, report.failed.0))
            .or_insert_with(|| Proceeding::new(reporter_count));
        if proceeding.decision.is_some() {
            return Err(ProtocolError::AlreadyDecided(report.failed));
        }
        debug!(
            reporter = %report.reporter,
            failed = %report.failed,
            trigger = %report.timeslice_trigger,
            "failure report collected"
        );
        proceeding.reports[report.reporter.idx()] = Some(report);

        let decision = proceeding.decide(&self.live);
        if let Some(decision) = decision {
            info!(
                failed = %decision.failed,
                trigger = %decision.timeslice_trigger,
                "failure decision reached"
            );
        }
        Ok(decision)
    }

    /// Marks a reporter as lost: pending proceedings no longer wait on it
    /// and its ack is no longer required.
    ///
    /// Returns the decisions newly reached by its removal.
    pub fn note_reporter_lost(&mut self, reporter: ConnectionId) -> Vec<FailureDecision> {
        if reporter.idx() >= self.live.len() {
            return Vec::new();
        }
        self.live[reporter.idx()] = false;
        let mut decided = Vec::new();
        for proceeding in self.proceedings.values_mut() {
            if let Some(decision) = proceeding.decide(&self.live) {
                info!(
                    failed = %decision.failed,
                    trigger = %decision.timeslice_trigger,
                    "failure decision reached after reporter loss"
                );
                decided.push(decision);
            }
        }
        decided
    }

    /// The decision for a failed connection, once reached.
    #[must_use]
    pub fn decision(&self, failed: ConnectionId, role: Role) -> Option<FailureDecision> {
        self.proceedings.get(&(role, failed.0)).and_then(|p| p.decision)
    }

    /// Marks the decision as broadcast to one reporter at `now`.
    pub fn mark_broadcast(&mut self, decision: &FailureDecision, to: ConnectionId, now: Timestamp) {
        if let Some(proceeding) =
            self.proceedings.get_mut(&(decision.failed_role, decision.failed.0))
        {
            if let Some(slot) = proceeding.broadcast_at.get_mut(to.idx()) {
                *slot = Some(now);
            }
        }
    }

    /// Records a reporter's acknowledgement of the broadcast decision.
    ///
    /// Returns true once every surviving reporter has acked.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::UnknownConnection`] for a lost or out-of-range
    /// reporter, or an ack for a failure with no proceeding.
    pub fn note_ack(
        &mut self,
        failed: ConnectionId,
        role: Role,
        from: ConnectionId,
    ) -> Result<bool, ProtocolError> {
        self.check(from)?;
        let proceeding = self
            .proceedings
            .get_mut(&(role, failed.0))
            .ok_or(ProtocolError::UnknownConnection(failed))?;
        proceeding.acked[from.idx()] = true;
        Ok(self.is_reclaimed(failed, role))
    }

    /// True once the decision exists and every surviving reporter has acked
    /// it: the failed connection's capacity may be reclaimed and its
    /// outstanding timeslices reassigned.
    #[must_use]
    pub fn is_reclaimed(&self, failed: ConnectionId, role: Role) -> bool {
        let Some(proceeding) = self.proceedings.get(&(role, failed.0)) else {
            return false;
        };
        proceeding.decision.is_some()
            && self
                .live
                .iter()
                .zip(&proceeding.acked)
                .all(|(&live, &acked)| !live || acked)
    }

    /// Earliest timeslice still pinned by an open proceeding.
    ///
    /// An undecided proceeding pins everything: its eventual trigger is the
    /// min over reports still to come, so no lower bound exists yet. A
    /// decided proceeding pins its trigger until every surviving reporter
    /// has acked and the capacity is reclaimed. `None` once nothing is
    /// pinned.
    #[must_use]
    pub fn earliest_open_trigger(&self) -> Option<TimesliceIndex> {
        let mut earliest: Option<TimesliceIndex> = None;
        for proceeding in self.proceedings.values() {
            let pinned = match proceeding.decision {
                None => Some(TimesliceIndex::ZERO),
                Some(decision) => {
                    let all_acked = self
                        .live
                        .iter()
                        .zip(&proceeding.acked)
                        .all(|(&live, &acked)| !live || acked);
                    (!all_acked).then_some(decision.timeslice_trigger)
                }
            };
            if let Some(ts) = pinned {
                earliest = Some(earliest.map_or(ts, |e| e.min(ts)));
            }
        }
        earliest
    }

    /// Reporters whose broadcast is unacknowledged and older than the
    /// retransmit wait (or never sent), paired with the decision to resend.
    #[must_use]
    pub fn retransmit_due(&self, now: Timestamp) -> Vec<(ConnectionId, FailureDecision)> {
        let mut due = Vec::new();
        for proceeding in self.proceedings.values() {
            let Some(decision) = proceeding.decision else { continue };
            for (idx, &live) in self.live.iter().enumerate() {
                if !live || proceeding.acked[idx] {
                    continue;
                }
                let resend = match proceeding.broadcast_at[idx] {
                    None => true,
                    Some(sent) => now.since(sent) > self.retransmit_wait,
                };
                if resend {
                    due.push((ConnectionId(idx as u32), decision));
                }
            }
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(reporter: u32, failed: u32, desc: u64, trigger: u64) -> FailureReport {
        FailureReport {
            reporter: ConnectionId(reporter),
            failed: ConnectionId(failed),
            failed_role: Role::Compute,
            last_completed_desc: DescIndex(desc),
            timeslice_trigger: TimesliceIndex(trigger),
        }
    }

    fn consensus(reporters: u32) -> FailureConsensus {
        FailureConsensus::new(reporters, TimeSpan::from_millis(500))
    }

    fn at(us: u64) -> Timestamp {
        Timestamp::from_micros(us)
    }

    #[test]
    fn decision_requires_every_survivor() {
        let mut c = consensus(3);
        assert_eq!(c.add_report(report(0, 7, 100, 50)).unwrap(), None);
        assert_eq!(c.add_report(report(1, 7, 120, 48)).unwrap(), None);
        let decision = c.add_report(report(2, 7, 90, 55)).unwrap().expect("all survivors reported");
        assert_eq!(decision.failed, ConnectionId(7));
        assert_eq!(decision.last_completed_desc, DescIndex(120), "max of reports");
        assert_eq!(decision.timeslice_trigger, TimesliceIndex(48), "min of reports");
    }

    #[test]
    fn decision_is_permutation_independent() {
        let reports = [report(0, 7, 100, 50), report(1, 7, 120, 48), report(2, 7, 90, 55)];
        let orders: [[usize; 3]; 6] =
            [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];
        let mut decisions = Vec::new();
        for order in orders {
            let mut c = consensus(3);
            let mut last = None;
            for &i in &order {
                last = c.add_report(reports[i]).unwrap();
            }
            decisions.push(last.expect("decided"));
        }
        assert!(decisions.windows(2).all(|w| w[0] == w[1]), "same decision in every order");
    }

    #[test]
    fn report_for_a_decided_failure_is_a_violation() {
        let mut c = consensus(2);
        c.add_report(report(0, 5, 10, 5)).unwrap();
        c.add_report(report(1, 5, 12, 4)).unwrap();
        assert!(matches!(
            c.add_report(report(0, 5, 99, 1)),
            Err(ProtocolError::AlreadyDecided(_))
        ));
    }

    #[test]
    fn lost_reporter_unblocks_a_pending_proceeding() {
        let mut c = consensus(3);
        c.add_report(report(0, 7, 10, 5)).unwrap();
        c.add_report(report(1, 7, 12, 4)).unwrap();

        let decided = c.note_reporter_lost(ConnectionId(2));
        assert_eq!(decided.len(), 1);
        assert_eq!(decided[0].timeslice_trigger, TimesliceIndex(4));
        assert_eq!(c.survivors(), vec![ConnectionId(0), ConnectionId(1)]);
    }

    #[test]
    fn lost_reporter_is_rejected_afterwards() {
        let mut c = consensus(3);
        c.note_reporter_lost(ConnectionId(1));
        assert!(matches!(
            c.add_report(report(1, 7, 1, 1)),
            Err(ProtocolError::UnknownConnection(_))
        ));
    }

    #[test]
    fn reclaim_waits_for_every_ack() {
        let mut c = consensus(2);
        c.add_report(report(0, 5, 10, 5)).unwrap();
        c.add_report(report(1, 5, 12, 4)).unwrap();
        assert!(!c.is_reclaimed(ConnectionId(5), Role::Compute));

        assert!(!c.note_ack(ConnectionId(5), Role::Compute, ConnectionId(0)).unwrap());
        assert!(c.note_ack(ConnectionId(5), Role::Compute, ConnectionId(1)).unwrap());
        assert!(c.is_reclaimed(ConnectionId(5), Role::Compute));
        assert!(!c.is_reclaimed(ConnectionId(5), Role::Input), "role qualifies the key");
    }

    #[test]
    fn open_proceedings_pin_the_earliest_trigger() {
        let mut c = consensus(2);
        assert_eq!(c.earliest_open_trigger(), None);

        // Undecided: the eventual trigger is unknown, so everything is
        // pinned.
        c.add_report(report(0, 5, 10, 40)).unwrap();
        assert_eq!(c.earliest_open_trigger(), Some(TimesliceIndex::ZERO));

        assert!(c.add_report(report(1, 5, 12, 35)).unwrap().is_some());
        assert_eq!(c.earliest_open_trigger(), Some(TimesliceIndex(35)), "min of the triggers");

        // The pin holds until the last surviving reporter acks.
        c.note_ack(ConnectionId(5), Role::Compute, ConnectionId(0)).unwrap();
        assert_eq!(c.earliest_open_trigger(), Some(TimesliceIndex(35)));
        c.note_ack(ConnectionId(5), Role::Compute, ConnectionId(1)).unwrap();
        assert_eq!(c.earliest_open_trigger(), None, "reclaimed proceedings pin nothing");
    }

    #[test]
    fn unacked_broadcasts_retransmit_after_the_wait() {
        let mut c = consensus(2);
        c.add_report(report(0, 5, 10, 5)).unwrap();
        let decision = c.add_report(report(1, 5, 12, 4)).unwrap().unwrap();

        // Never sent yet: both survivors due immediately.
        let due = c.retransmit_due(at(0));
        assert_eq!(due, vec![(ConnectionId(0), decision), (ConnectionId(1), decision)]);

        c.mark_broadcast(&decision, ConnectionId(0), at(0));
        c.mark_broadcast(&decision, ConnectionId(1), at(0));
        assert!(c.retransmit_due(at(100_000)).is_empty(), "within the wait");

        c.note_ack(ConnectionId(5), Role::Compute, ConnectionId(0)).unwrap();
        let due = c.retransmit_due(at(700_000));
        assert_eq!(due, vec![(ConnectionId(1), decision)], "only the silent survivor resends");
    }
}
