//! Ordered timeslice completion tracking with bounded staleness.
//!
//! Each compute node reassembles timeslices from one contribution per input
//! connection. The tracker records arrivals, detects completion exactly once
//! per timeslice, and maintains the **watermark**: the highest timeslice
//! index below which every timeslice is known `Complete` or `TimedOut`.
//!
//! # Design
//!
//! - Records live in an index-ordered map and are created lazily on first
//!   contribution. Resolved records are retained until [`CompletionTracker::prune_below`]
//!   because a failure decision may still reopen them via
//!   [`CompletionTracker::undo_arrival`].
//! - The watermark advances through resolved records in index order; a
//!   pending record is never skipped. Indices with no record belong to other
//!   compute nodes' routing classes and are vacuously resolved. A periodic
//!   sweep times out stale `Pending` records so one missing contribution
//!   cannot stall the watermark forever.
//! - `undo_arrival` is the only operation that moves the watermark backward,
//!   and only in direct response to a failure decision.
//!
//! # Invariants
//!
//! - A record's arrived set only grows (except through `undo_arrival`).
//! - A record reaches `Complete` exactly once, when every live connection
//!   has contributed.

use std::collections::BTreeMap;

use crate::protocol::ProtocolError;
use crate::time::{TimeSpan, Timestamp};
use crate::trace::{debug, trace};
use crate::types::{ConnectionId, TimesliceIndex};

/// Lifecycle of one timeslice record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimesliceState {
    /// Some contributions still missing.
    Pending,
    /// Every live connection has contributed.
    Complete,
    /// Swept after exceeding the completion timeout.
    TimedOut,
}

/// Outcome of recording one contribution arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrivalOutcome {
    /// Contribution recorded; the timeslice is still incomplete.
    Recorded,
    /// This contribution completed the timeslice.
    Completed {
        /// Time from first arrival to completion.
        span: TimeSpan,
    },
    /// The connection had already contributed to this timeslice.
    Duplicate,
    /// The timeslice was already resolved; the contribution is discarded.
    Late,
}

/// Outcome of undoing a contribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoOutcome {
    /// The contribution was removed from a pending record.
    Removed,
    /// The record was `Complete`; it has been reopened and the watermark
    /// rewound.
    Reopened,
    /// No such contribution was recorded.
    NoContribution,
}

/// Transient per-timeslice assembly state.
#[derive(Debug, Clone)]
pub struct TimesliceRecord {
    arrived: Vec<bool>,
    first_arrival: Timestamp,
    state: TimesliceState,
    completion_span: Option<TimeSpan>,
}

impl TimesliceRecord {
    fn new(connection_count: usize, now: Timestamp) -> Self {
        Self {
            arrived: vec![false; connection_count],
            first_arrival: now,
            state: TimesliceState::Pending,
            completion_span: None,
        }
    }

    /// Current lifecycle state.
    #[inline]
    #[must_use]
    pub const fn state(&self) -> TimesliceState {
        self.state
    }

    /// Timestamp of the first contribution.
    #[inline]
    #[must_use]
    pub const fn first_arrival(&self) -> Timestamp {
        self.first_arrival
    }

    /// First-arrival-to-completion span, once complete.
    #[inline]
    #[must_use]
    pub const fn completion_span(&self) -> Option<TimeSpan> {
        self.completion_span
    }
}

/// Per-compute-node completion tracker.
pub struct CompletionTracker {
    records: BTreeMap<u64, TimesliceRecord>,
    /// Which input connections are still live; dead ones no longer count
    /// toward completion.
    live: Vec<bool>,
    /// First timeslice index not yet resolved. Every index below is
    /// `Complete` or `TimedOut`.
    next_unresolved: u64,
    /// Age at which a pending record is swept to `TimedOut`.
    timeout: TimeSpan,
    completed: u64,
    timed_out: u64,
}

impl CompletionTracker {
    /// Creates a tracker expecting one contribution per connection.
    ///
    /// # Panics
    ///
    /// Panics if `connection_count` is zero.
    #[must_use]
    pub fn new(connection_count: u32, timeout: TimeSpan) -> Self {
        assert!(connection_count > 0, "connection_count must be > 0");
        Self {
            records: BTreeMap::new(),
            live: vec![true; connection_count as usize],
            next_unresolved: 0,
            timeout,
            completed: 0,
            timed_out: 0,
        }
    }

    /// The watermark: highest index below which every timeslice is resolved.
    ///
    /// `None` until timeslice 0 resolves.
    #[must_use]
    pub fn last_ordered_completed(&self) -> Option<TimesliceIndex> {
        self.next_unresolved.checked_sub(1).map(TimesliceIndex)
    }

    /// First timeslice index not yet resolved.
    #[inline]
    #[must_use]
    pub const fn next_unresolved(&self) -> TimesliceIndex {
        TimesliceIndex(self.next_unresolved)
    }

    /// Total timeslices that reached `Complete`.
    #[inline]
    #[must_use]
    pub const fn completed_count(&self) -> u64 {
        self.completed
    }

    /// Total timeslices swept to `TimedOut`.
    #[inline]
    #[must_use]
    pub const fn timed_out_count(&self) -> u64 {
        self.timed_out
    }

    /// Record view for inspection.
    #[must_use]
    pub fn record(&self, ts: TimesliceIndex) -> Option<&TimesliceRecord> {
        self.records.get(&ts.as_u64())
    }

    fn check_connection(&self, connection: ConnectionId) -> Result<(), ProtocolError> {
        if connection.idx() >= self.live.len() {
            return Err(ProtocolError::UnknownConnection(connection));
        }
        Ok(())
    }

    fn all_live_arrived(live: &[bool], arrived: &[bool]) -> bool {
        live.iter().zip(arrived).all(|(&l, &a)| !l || a)
    }

    /// Records a contribution arrival for `ts` from `connection`.
    ///
    /// Creates the record on first contribution, grows the arrived set, and
    /// on completion attempts to advance the watermark.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::UnknownConnection`] for an out-of-range connection
    /// index; the tracker is left untouched.
    pub fn note_arrival(
        &mut self,
        connection: ConnectionId,
        ts: TimesliceIndex,
        now: Timestamp,
    ) -> Result<ArrivalOutcome, ProtocolError> {
        self.check_connection(connection)?;

        let record = self
            .records
            .entry(ts.as_u64())
            .or_insert_with(|| TimesliceRecord::new(self.live.len(), now));

        match record.state {
            TimesliceState::Complete | TimesliceState::TimedOut => {
                return Ok(ArrivalOutcome::Late);
            }
            TimesliceState::Pending => {}
        }
        if record.arrived[connection.idx()] {
            return Ok(ArrivalOutcome::Duplicate);
        }
        record.arrived[connection.idx()] = true;
        trace!(connection = %connection, ts = %ts, "contribution arrived");

        if Self::all_live_arrived(&self.live, &record.arrived) {
            let span = now.since(record.first_arrival);
            record.state = TimesliceState::Complete;
            record.completion_span = Some(span);
            self.completed += 1;
            debug!(ts = %ts, span = %span, "timeslice complete");
            self.advance_watermark();
            Ok(ArrivalOutcome::Completed { span })
        } else {
            Ok(ArrivalOutcome::Recorded)
        }
    }

    /// Sweeps pending records older than the completion timeout to
    /// `TimedOut`, oldest first, then advances the watermark.
    ///
    /// Returns the newly timed-out indices in increasing order.
    pub fn sweep_timeouts(&mut self, now: Timestamp) -> Vec<TimesliceIndex> {
        let mut swept = Vec::new();
        for (&idx, record) in &mut self.records {
            if record.state != TimesliceState::Pending {
                continue;
            }
            if now.since(record.first_arrival) > self.timeout {
                record.state = TimesliceState::TimedOut;
                self.timed_out += 1;
                swept.push(TimesliceIndex(idx));
            }
        }
        if !swept.is_empty() {
            debug!(count = swept.len(), "pending timeslices timed out");
            self.advance_watermark();
        }
        swept
    }

    /// Removes `connection`'s contribution to `ts`.
    ///
    /// If the record was `Complete` it is reopened and the watermark rewound
    /// to just before `ts`. This is the only operation that may move the
    /// watermark backward; callers invoke it only on a failure decision.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::UnknownConnection`] for an out-of-range connection.
    pub fn undo_arrival(
        &mut self,
        connection: ConnectionId,
        ts: TimesliceIndex,
    ) -> Result<UndoOutcome, ProtocolError> {
        self.check_connection(connection)?;

        let Some(record) = self.records.get_mut(&ts.as_u64()) else {
            return Ok(UndoOutcome::NoContribution);
        };
        if !record.arrived[connection.idx()] {
            return Ok(UndoOutcome::NoContribution);
        }
        record.arrived[connection.idx()] = false;

        match record.state {
            TimesliceState::Complete => {
                record.state = TimesliceState::Pending;
                record.completion_span = None;
                self.completed -= 1;
                if ts.as_u64() < self.next_unresolved {
                    debug!(ts = %ts, "watermark rewound by undo");
                    self.next_unresolved = ts.as_u64();
                }
                Ok(UndoOutcome::Reopened)
            }
            TimesliceState::Pending | TimesliceState::TimedOut => Ok(UndoOutcome::Removed),
        }
    }

    /// Undoes every contribution from `connection` at or after `from`.
    ///
    /// Used when a failure decision names `from` as its timeslice trigger:
    /// everything the dead connection contributed past the trigger must be
    /// resupplied by whichever survivor inherits its share.
    ///
    /// Returns the indices whose records were reopened from `Complete`.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::UnknownConnection`] for an out-of-range connection.
    pub fn undo_arrivals_from(
        &mut self,
        connection: ConnectionId,
        from: TimesliceIndex,
    ) -> Result<Vec<TimesliceIndex>, ProtocolError> {
        self.check_connection(connection)?;
        let affected: Vec<u64> = self
            .records
            .range(from.as_u64()..)
            .filter(|(_, r)| r.arrived[connection.idx()])
            .map(|(&idx, _)| idx)
            .collect();
        let mut reopened = Vec::new();
        for idx in affected {
            if self.undo_arrival(connection, TimesliceIndex(idx))? == UndoOutcome::Reopened {
                reopened.push(TimesliceIndex(idx));
            }
        }
        Ok(reopened)
    }

    /// Marks `connection` as dead: it no longer counts toward completion.
    ///
    /// Pending records that were only waiting on the dead connection become
    /// complete immediately and the watermark advances past them.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::UnknownConnection`] for an out-of-range connection.
    pub fn shrink_connections(
        &mut self,
        failed: ConnectionId,
        now: Timestamp,
    ) -> Result<(), ProtocolError> {
        self.check_connection(failed)?;
        self.live[failed.idx()] = false;

        let mut newly_complete = 0u64;
        for record in self.records.values_mut() {
            if record.state == TimesliceState::Pending
                && Self::all_live_arrived(&self.live, &record.arrived)
            {
                record.state = TimesliceState::Complete;
                record.completion_span = Some(now.since(record.first_arrival));
                newly_complete += 1;
            }
        }
        self.completed += newly_complete;
        if newly_complete > 0 {
            self.advance_watermark();
        }
        debug!(failed = %failed, newly_complete, "connection removed from full set");
        Ok(())
    }

    /// Drops resolved records below `ts` that the watermark has passed.
    ///
    /// Call once resolved timeslices can no longer be targeted by a failure
    /// decision.
    pub fn prune_below(&mut self, ts: TimesliceIndex) {
        let limit = ts.as_u64().min(self.next_unresolved);
        self.records.retain(|&idx, _| idx >= limit);
    }

    fn advance_watermark(&mut self) {
        // Timeslices routed to other compute nodes never get a record here;
        // the watermark steps over those to the next known record. Only a
        // pending record holds it back. Records are created in increasing
        // index order (per-connection FIFO), so a skipped index cannot
        // materialize later.
        while let Some((&idx, record)) = self.records.range(self.next_unresolved..).next() {
            match record.state {
                TimesliceState::Complete | TimesliceState::TimedOut => {
                    self.next_unresolved = idx + 1;
                }
                TimesliceState::Pending => break,
            }
        }
    }
}
