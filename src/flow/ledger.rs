//! Per-connection credit ledger: pointer synchronization for two streams.
//!
//! Each connection moves two independent streams into a remote ring buffer:
//! payload **data** bytes and **descriptor** records. The ledger tracks four
//! pointers per stream (local write, local ack, last-synced copies, remote
//! ack) and answers the two questions the event loop asks on every pass:
//! *may I send this much?* and *is a status exchange due?*
//!
//! # Design
//!
//! - Pointers are free-running u64 counters; ring positions are `ptr & mask`.
//!   Free space is `remote_ack + size - local_write`, valid across wrap.
//! - A status exchange is triggered only when local pointers moved since the
//!   last exchange or an inbound update still needs acknowledgement — never
//!   on a fixed timer. Two mandatory empty exchanges bracket the connection:
//!   one at startup, one terminal at finalize.
//! - Finalize first drains (`local_ack == local_write` on both streams,
//!   unless aborting), then the terminal exchange becomes due. After the
//!   peer's terminal message, no further remote update is admissible.
//!
//! # Invariants
//!
//! - `local_ack <= local_write` per stream, always.
//! - `remote_ack` is monotone: stale inbound updates are ignored.

use serde::{Deserialize, Serialize};

use crate::trace::warn;

/// Pointer pair snapshot carried by status messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FlowPointers {
    /// Data stream position (bytes).
    pub data: u64,
    /// Descriptor stream position (records).
    pub desc: u64,
}

/// One stream's free-running pointer set.
#[derive(Debug, Clone)]
pub struct StreamLedger {
    write: u64,
    ack: u64,
    remote_ack: u64,
    size: u64,
}

impl StreamLedger {
    /// Creates a stream ledger over a remote ring of `1 << size_exp` units.
    ///
    /// # Panics
    ///
    /// Panics if `size_exp >= 64`.
    #[must_use]
    pub fn new(size_exp: u32) -> Self {
        assert!(size_exp < 64, "buffer size exponent must be < 64");
        Self { write: 0, ack: 0, remote_ack: 0, size: 1u64 << size_exp }
    }

    /// Remote ring capacity in stream units.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Local write pointer.
    #[inline]
    #[must_use]
    pub const fn write(&self) -> u64 {
        self.write
    }

    /// Local acknowledge pointer.
    #[inline]
    #[must_use]
    pub const fn ack(&self) -> u64 {
        self.ack
    }

    /// Remote acknowledge pointer as last observed from inbound messages.
    #[inline]
    #[must_use]
    pub const fn remote_ack(&self) -> u64 {
        self.remote_ack
    }

    /// Free units remaining in the remote ring.
    #[inline]
    #[must_use]
    pub const fn free(&self) -> u64 {
        // Wrapping arithmetic keeps this correct across u64 pointer wrap.
        self.remote_ack.wrapping_add(self.size).wrapping_sub(self.write)
    }

    fn advance_write(&mut self, units: u64) {
        self.write = self.write.wrapping_add(units);
    }

    fn advance_ack(&mut self, to: u64) {
        if to > self.ack {
            debug_assert!(to <= self.write, "local ack must not pass local write");
            self.ack = to.min(self.write);
        }
    }

    /// Folds an inbound remote-ack update in; returns false for stale values.
    fn fold_remote_ack(&mut self, ack: u64) -> bool {
        if ack < self.remote_ack {
            return false;
        }
        self.remote_ack = ack;
        true
    }
}

/// Lifecycle of the connection's finalize handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FinalizeState {
    /// Normal operation.
    Running,
    /// Finalize requested; waiting to drain (or aborting immediately).
    Requested { abort: bool },
    /// Terminal exchange issued; the connection is done.
    Finalized { abort: bool },
}

/// Credit-based pointer ledger for one connection.
pub struct FlowLedger {
    data: StreamLedger,
    desc: StreamLedger,
    /// Local pointers as of the last issued exchange.
    synced_write: FlowPointers,
    synced_ack: FlowPointers,
    /// An inbound update arrived and still needs acknowledgement.
    inbound_pending: bool,
    /// The mandatory startup exchange has been issued.
    startup_synced: bool,
    finalize: FinalizeState,
    /// The peer's terminal message has been seen.
    peer_finalized: bool,
}

impl FlowLedger {
    /// Creates a ledger for a remote data ring of `1 << data_size_exp` bytes
    /// and a descriptor ring of `1 << desc_size_exp` records.
    #[must_use]
    pub fn new(data_size_exp: u32, desc_size_exp: u32) -> Self {
        Self {
            data: StreamLedger::new(data_size_exp),
            desc: StreamLedger::new(desc_size_exp),
            synced_write: FlowPointers::default(),
            synced_ack: FlowPointers::default(),
            inbound_pending: false,
            startup_synced: false,
            finalize: FinalizeState::Running,
            peer_finalized: false,
        }
    }

    /// Data stream view.
    #[inline]
    #[must_use]
    pub const fn data(&self) -> &StreamLedger {
        &self.data
    }

    /// Descriptor stream view.
    #[inline]
    #[must_use]
    pub const fn desc(&self) -> &StreamLedger {
        &self.desc
    }

    /// Local write pointers for the next outbound status message.
    #[inline]
    #[must_use]
    pub const fn write_pointers(&self) -> FlowPointers {
        FlowPointers { data: self.data.write, desc: self.desc.write }
    }

    /// Local acknowledge pointers for the next outbound status message.
    #[inline]
    #[must_use]
    pub const fn ack_pointers(&self) -> FlowPointers {
        FlowPointers { data: self.data.ack, desc: self.desc.ack }
    }

    /// True iff the remote rings have room for `bytes` of payload **and**
    /// `descriptors` records. Both streams are checked independently; both
    /// must hold. Running out of room is backpressure, not an error.
    #[must_use]
    pub fn has_room(&self, bytes: u64, descriptors: u64) -> bool {
        self.data.free() >= bytes && self.desc.free() >= descriptors
    }

    /// Bytes of padding to emit before a `bytes`-sized write so it never
    /// straddles the data ring's wrap point. The padding counts as sent
    /// data; callers include it in the following [`Self::note_sent`].
    #[must_use]
    pub fn skip_before_write(&self, bytes: u64) -> u64 {
        let size = self.data.size();
        let offset = self.data.write() & (size - 1);
        if offset + bytes > size { size - offset } else { 0 }
    }

    /// Records a completed transmit of `bytes` payload and `descriptors`
    /// records.
    ///
    /// # Panics
    ///
    /// Debug-asserts that the send was covered by [`Self::has_room`].
    pub fn note_sent(&mut self, bytes: u64, descriptors: u64) {
        debug_assert!(self.has_room(bytes, descriptors), "send issued without room");
        self.data.advance_write(bytes);
        self.desc.advance_write(descriptors);
    }

    /// Advances the local acknowledge pointers (units this node has released
    /// back to its peer). Backward movement is ignored.
    pub fn note_local_ack(&mut self, data: u64, desc: u64) {
        self.data.advance_ack(data);
        self.desc.advance_ack(desc);
    }

    /// Folds an inbound remote-ack pointer update in.
    ///
    /// Returns false (and leaves the ledger untouched) when the update is
    /// stale on either stream or arrives after the peer's terminal message.
    pub fn note_remote_ack(&mut self, ack: FlowPointers) -> bool {
        if self.peer_finalized {
            warn!(data = ack.data, desc = ack.desc, "remote ack after terminal message, discarded");
            return false;
        }
        // Staleness is checked on both streams before either moves; a
        // half-applied update would desynchronize free-space accounting.
        if ack.data < self.data.remote_ack || ack.desc < self.desc.remote_ack {
            return false;
        }
        self.data.fold_remote_ack(ack.data);
        self.desc.fold_remote_ack(ack.desc);
        self.inbound_pending = true;
        true
    }

    /// Marks the peer's terminal message as seen. Later remote updates are
    /// inadmissible.
    pub fn note_peer_finalize(&mut self) {
        self.peer_finalized = true;
        self.inbound_pending = true;
    }

    /// True once the peer's terminal message has arrived.
    #[inline]
    #[must_use]
    pub const fn peer_finalized(&self) -> bool {
        self.peer_finalized
    }

    /// Requests the finalize sequence. With `abort` set the drain requirement
    /// is waived and the terminal exchange becomes due immediately.
    pub fn request_finalize(&mut self, abort: bool) {
        match self.finalize {
            FinalizeState::Running => self.finalize = FinalizeState::Requested { abort },
            FinalizeState::Requested { abort: prior } if abort && !prior => {
                // Escalate a graceful finalize to an abort.
                self.finalize = FinalizeState::Requested { abort: true };
            }
            _ => {}
        }
    }

    /// True iff every sent unit has been acknowledged locally on both streams.
    #[must_use]
    pub const fn is_drained(&self) -> bool {
        self.data.ack == self.data.write && self.desc.ack == self.desc.write
    }

    /// True once the terminal exchange has been issued.
    #[must_use]
    pub const fn is_finalized(&self) -> bool {
        matches!(self.finalize, FinalizeState::Finalized { .. })
    }

    /// True when the *next* issued exchange is the terminal one.
    #[must_use]
    pub fn terminal_due(&self) -> bool {
        matches!(self.finalize, FinalizeState::Requested { abort } if abort || self.is_drained())
    }

    /// Finalize/abort flags for the next outbound status message.
    #[must_use]
    pub fn finalize_flags(&self) -> (bool, bool) {
        match self.finalize {
            FinalizeState::Running => (false, false),
            FinalizeState::Requested { abort } | FinalizeState::Finalized { abort } => (true, abort),
        }
    }

    /// True iff a status exchange should be issued now.
    ///
    /// Exchanges fire only on change, not on a timer: local pointers moved,
    /// an inbound update needs acknowledgement, the mandatory startup
    /// exchange has not happened yet, or the terminal exchange is due.
    #[must_use]
    pub fn due_for_sync(&self) -> bool {
        if self.is_finalized() {
            return false;
        }
        if !self.startup_synced {
            return true;
        }
        if self.inbound_pending {
            return true;
        }
        if self.terminal_due() {
            return true;
        }
        let write = self.write_pointers();
        let ack = self.ack_pointers();
        write != self.synced_write || ack != self.synced_ack
    }

    /// Snapshots pointers after an exchange has been issued; transitions to
    /// `Finalized` when the issued exchange was the terminal one.
    pub fn mark_synced(&mut self) {
        self.synced_write = self.write_pointers();
        self.synced_ack = self.ack_pointers();
        self.inbound_pending = false;
        self.startup_synced = true;
        if let FinalizeState::Requested { abort } = self.finalize {
            if abort || self.is_drained() {
                self.finalize = FinalizeState::Finalized { abort };
            }
        }
    }
}
