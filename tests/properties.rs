//! Property tests: pointer accounting, watermark monotonicity, and
//! consensus order-independence under randomized interleavings.

use proptest::prelude::*;

use cadence::completion::CompletionTracker;
use cadence::failure::{FailureConsensus, FailureReport};
use cadence::flow::{FlowLedger, FlowPointers};
use cadence::time::{TimeSpan, Timestamp};
use cadence::types::{ConnectionId, DescIndex, Role, TimesliceIndex};

/// One randomized step against a [`FlowLedger`].
#[derive(Debug, Clone)]
enum LedgerOp {
    /// Attempt a send of this many payload bytes plus one descriptor.
    Send(u64),
    /// Locally release this percentage of the unacked span.
    LocalAck(u8),
    /// Fold in a remote ack covering this percentage of the unacked span.
    RemoteAck(u8),
}

fn ledger_op() -> impl Strategy<Value = LedgerOp> {
    prop_oneof![
        (1u64..=256).prop_map(LedgerOp::Send),
        (0u8..=100).prop_map(LedgerOp::LocalAck),
        (0u8..=100).prop_map(LedgerOp::RemoteAck),
    ]
}

fn partial(from: u64, to: u64, percent: u8) -> u64 {
    from + (to - from) * u64::from(percent) / 100
}

proptest! {
    /// Write pointers only grow, acks never pass writes, and the ledger
    /// never claims more free room than the ring holds — under any
    /// interleaving of sends and acks.
    #[test]
    fn ledger_pointers_stay_consistent(ops in proptest::collection::vec(ledger_op(), 1..200)) {
        // 1 KiB data ring, 16-record descriptor ring.
        let mut l = FlowLedger::new(10, 4);
        let mut prev_write = l.write_pointers();

        for op in ops {
            match op {
                LedgerOp::Send(bytes) => {
                    let skip = l.skip_before_write(bytes);
                    if l.has_room(skip + bytes, 1) {
                        l.note_sent(skip + bytes, 1);
                    }
                }
                LedgerOp::LocalAck(percent) => {
                    let data = partial(l.data().ack(), l.data().write(), percent);
                    let desc = partial(l.desc().ack(), l.desc().write(), percent);
                    l.note_local_ack(data, desc);
                }
                LedgerOp::RemoteAck(percent) => {
                    let ack = FlowPointers {
                        data: partial(l.data().remote_ack(), l.data().write(), percent),
                        desc: partial(l.desc().remote_ack(), l.desc().write(), percent),
                    };
                    let _ = l.note_remote_ack(ack);
                }
            }

            let write = l.write_pointers();
            prop_assert!(write.data >= prev_write.data, "data write moved backwards");
            prop_assert!(write.desc >= prev_write.desc, "desc write moved backwards");
            prev_write = write;

            prop_assert!(l.data().ack() <= l.data().write(), "data ack passed write");
            prop_assert!(l.desc().ack() <= l.desc().write(), "desc ack passed write");
            prop_assert!(l.data().remote_ack() <= l.data().write(), "remote ack passed write");
            prop_assert!(l.data().free() <= l.data().size(), "free exceeds ring size");
            prop_assert!(l.desc().free() <= l.desc().size(), "free exceeds ring size");
            prop_assert!(
                l.data().write() - l.data().remote_ack() <= l.data().size(),
                "outstanding data overran the remote ring"
            );
            prop_assert!(
                l.desc().write() - l.desc().remote_ack() <= l.desc().size(),
                "outstanding descriptors overran the remote ring"
            );
        }
    }

    /// The watermark never moves backwards (absent a failure decision) and
    /// resolves everything once all contributions have arrived, no matter
    /// how arrivals interleave across connections.
    #[test]
    fn watermark_is_monotone_under_arbitrary_arrival_order(
        arrivals in Just(
            (0u32..3)
                .flat_map(|c| (0u64..20).map(move |t| (c, t)))
                .collect::<Vec<_>>()
        )
        .prop_shuffle()
    ) {
        let mut tracker = CompletionTracker::new(3, TimeSpan::from_secs(1));
        let mut watermark = None;
        for (step, (c, t)) in arrivals.into_iter().enumerate() {
            tracker
                .note_arrival(ConnectionId(c), TimesliceIndex(t), Timestamp::from_micros(step as u64))
                .expect("known connection");
            let next = tracker.last_ordered_completed();
            prop_assert!(next >= watermark, "watermark moved backwards: {watermark:?} -> {next:?}");
            watermark = next;
        }
        prop_assert_eq!(watermark, Some(TimesliceIndex(19)));
        prop_assert_eq!(tracker.completed_count(), 20);
    }

    /// Max/min folding makes the decision identical for every report
    /// arrival order.
    #[test]
    fn consensus_decision_is_order_independent(
        descs in proptest::collection::vec(0u64..1000, 5),
        triggers in proptest::collection::vec(0u64..1000, 5),
        order in Just((0..5usize).collect::<Vec<_>>()).prop_shuffle(),
    ) {
        let mut consensus = FailureConsensus::new(5, TimeSpan::from_millis(100));
        let mut decision = None;
        for &i in &order {
            let report = FailureReport {
                reporter: ConnectionId(i as u32),
                failed: ConnectionId(0),
                failed_role: Role::Compute,
                last_completed_desc: DescIndex(descs[i]),
                timeslice_trigger: TimesliceIndex(triggers[i]),
            };
            decision = consensus.add_report(report).expect("live reporter");
        }
        let decision = decision.expect("last surviving report decides");
        prop_assert_eq!(decision.last_completed_desc, DescIndex(*descs.iter().max().expect("nonempty")));
        prop_assert_eq!(decision.timeslice_trigger, TimesliceIndex(*triggers.iter().min().expect("nonempty")));
    }
}
