//! Deadline-ordered timer queue for the node event loops.
//!
//! # Design
//!
//! All "waiting" in an event loop is a future callback at a computed
//! deadline, never a sleep. The queue is a binary heap of `(deadline,
//! slot, generation)` entries over a slab of payloads. Cancellation is
//! lazy: it bumps the slot's generation and leaves the heap entry behind;
//! stale entries are skipped on pop. A [`TimerHandle`] therefore stays
//! valid (and inert) even after its timer fired or was cancelled.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::time::Timestamp;

/// Handle to one scheduled timer, used for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle {
    slot: usize,
    generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct HeapEntry {
    deadline: Timestamp,
    slot: usize,
    generation: u64,
}

struct Slot<T> {
    generation: u64,
    payload: Option<T>,
}

/// Deadline-ordered callback queue.
pub struct TimerQueue<T> {
    heap: BinaryHeap<Reverse<HeapEntry>>,
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
}

impl<T> TimerQueue<T> {
    #[must_use]
    pub fn new() -> Self {
        Self { heap: BinaryHeap::new(), slots: Vec::new(), free: Vec::new() }
    }

    /// Number of live (not yet fired or cancelled) timers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Schedules `payload` to come due at `deadline`.
    pub fn schedule(&mut self, deadline: Timestamp, payload: T) -> TimerHandle {
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot].payload = Some(payload);
                slot
            }
            None => {
                self.slots.push(Slot { generation: 0, payload: Some(payload) });
                self.slots.len() - 1
            }
        };
        let generation = self.slots[slot].generation;
        self.heap.push(Reverse(HeapEntry { deadline, slot, generation }));
        TimerHandle { slot, generation }
    }

    /// Cancels a timer, returning its payload if it had not yet fired.
    ///
    /// Cancelling an already-fired or already-cancelled handle is a no-op.
    pub fn cancel(&mut self, handle: TimerHandle) -> Option<T> {
        let slot = self.slots.get_mut(handle.slot)?;
        if slot.generation != handle.generation {
            return None;
        }
        let payload = slot.payload.take();
        if payload.is_some() {
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(handle.slot);
        }
        payload
    }

    /// Pops the next timer due at or before `now`, if any.
    pub fn pop_due(&mut self, now: Timestamp) -> Option<T> {
        while let Some(&Reverse(entry)) = self.heap.peek() {
            if entry.deadline > now {
                return None;
            }
            self.heap.pop();
            let slot = &mut self.slots[entry.slot];
            if slot.generation != entry.generation {
                continue; // cancelled, or the slot was reused
            }
            let payload = slot.payload.take();
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(entry.slot);
            if payload.is_some() {
                return payload;
            }
        }
        None
    }

    /// Deadline of the earliest live timer. Discards stale heap entries on
    /// the way, so repeated calls stay cheap.
    pub fn next_deadline(&mut self) -> Option<Timestamp> {
        while let Some(&Reverse(entry)) = self.heap.peek() {
            let slot = &self.slots[entry.slot];
            if slot.generation == entry.generation && slot.payload.is_some() {
                return Some(entry.deadline);
            }
            self.heap.pop();
        }
        None
    }
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
