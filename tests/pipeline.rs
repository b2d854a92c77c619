//! End-to-end pipeline tests over an in-memory loopback transport.
//!
//! Four phases are exercised across the scenarios:
//! 1. Input nodes pace timeslice rounds to their compute targets
//! 2. Compute nodes assemble contributions and advance their watermarks
//! 3. Interval actuals flow back and proposals flow forward
//! 4. Failures are detected by heartbeat silence, decided by consensus,
//!    and survivors keep the pipeline moving
//!
//! # Running with tracing
//!
//! ```bash
//! RUST_LOG=cadence=debug cargo test --features tracing steady_pipeline -- --nocapture
//! ```

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::AtomicBool;

use cadence::config::CoreConfig;
use cadence::failure::FailureReport;
use cadence::runtime::{ComputeNode, ContributionSource, InputNode};
use cadence::time::{TimeSpan, Timestamp};
use cadence::transport::{PendingSend, Transport, TransportError, TransportEvent};
use cadence::types::{ConnectionId, DescIndex, HeartbeatSeq, IntervalIndex, Role, TimesliceIndex};

static INIT_TRACING: Once = Once::new();

/// Initialize tracing for tests (only once).
fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        cadence::init_tracing();
    });
}

/// Which node a loopback endpoint belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Input(usize),
    Compute(usize),
}

/// Shared in-memory message fabric between all nodes of one pipeline.
struct Network {
    input_inboxes: Vec<VecDeque<TransportEvent>>,
    compute_inboxes: Vec<VecDeque<TransportEvent>>,
    /// Dead nodes silently swallow everything sent to them; the sender
    /// cannot tell, exactly like a crashed peer behind a healthy link.
    dead_inputs: Vec<bool>,
    dead_computes: Vec<bool>,
}

impl Network {
    fn new(inputs: usize, computes: usize) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            input_inboxes: (0..inputs).map(|_| VecDeque::new()).collect(),
            compute_inboxes: (0..computes).map(|_| VecDeque::new()).collect(),
            dead_inputs: vec![false; inputs],
            dead_computes: vec![false; computes],
        }))
    }
}

/// One node's handle onto the shared fabric.
struct Loopback {
    net: Rc<RefCell<Network>>,
    endpoint: Endpoint,
    next_pending: u64,
}

impl Loopback {
    fn new(net: Rc<RefCell<Network>>, endpoint: Endpoint) -> Self {
        Self { net, endpoint, next_pending: 0 }
    }
}

impl Transport for Loopback {
    fn send(
        &mut self,
        connection: ConnectionId,
        message: cadence::protocol::StatusMessage,
    ) -> Result<PendingSend, TransportError> {
        let mut net = self.net.borrow_mut();
        let pending = PendingSend(self.next_pending);
        self.next_pending += 1;
        match self.endpoint {
            Endpoint::Input(i) => {
                let to = connection.idx();
                if to >= net.compute_inboxes.len() {
                    return Err(TransportError::NoRoute(connection));
                }
                if !net.dead_computes[to] {
                    let event = TransportEvent::Received {
                        connection: ConnectionId(i as u32),
                        message,
                    };
                    net.compute_inboxes[to].push_back(event);
                }
                net.input_inboxes[i]
                    .push_back(TransportEvent::SendComplete { connection, pending });
            }
            Endpoint::Compute(c) => {
                let to = connection.idx();
                if to >= net.input_inboxes.len() {
                    return Err(TransportError::NoRoute(connection));
                }
                if !net.dead_inputs[to] {
                    let event = TransportEvent::Received {
                        connection: ConnectionId(c as u32),
                        message,
                    };
                    net.input_inboxes[to].push_back(event);
                }
                net.compute_inboxes[c]
                    .push_back(TransportEvent::SendComplete { connection, pending });
            }
        }
        Ok(pending)
    }

    fn send_heartbeat(
        &mut self,
        connection: ConnectionId,
        seq: HeartbeatSeq,
    ) -> Result<(), TransportError> {
        let mut net = self.net.borrow_mut();
        match self.endpoint {
            Endpoint::Input(i) => {
                let to = connection.idx();
                if to >= net.compute_inboxes.len() {
                    return Err(TransportError::NoRoute(connection));
                }
                if !net.dead_computes[to] {
                    net.compute_inboxes[to]
                        .push_back(TransportEvent::Heartbeat { connection: ConnectionId(i as u32), seq });
                }
            }
            Endpoint::Compute(c) => {
                let to = connection.idx();
                if to >= net.input_inboxes.len() {
                    return Err(TransportError::NoRoute(connection));
                }
                if !net.dead_inputs[to] {
                    net.input_inboxes[to]
                        .push_back(TransportEvent::Heartbeat { connection: ConnectionId(c as u32), seq });
                }
            }
        }
        Ok(())
    }

    fn poll(&mut self) -> Option<TransportEvent> {
        let mut net = self.net.borrow_mut();
        match self.endpoint {
            Endpoint::Input(i) => net.input_inboxes[i].pop_front(),
            Endpoint::Compute(c) => net.compute_inboxes[c].pop_front(),
        }
    }
}

/// Constant-size contribution for every timeslice.
struct FixedSource(u64);

impl ContributionSource for FixedSource {
    fn contribution_size(&mut self, _ts: TimesliceIndex) -> u64 {
        self.0
    }
}

/// A whole pipeline driven on a simulated clock.
struct Pipeline {
    net: Rc<RefCell<Network>>,
    inputs: Vec<InputNode<Loopback, FixedSource>>,
    computes: Vec<ComputeNode<Loopback>>,
    now_us: u64,
}

impl Pipeline {
    fn new(config: &CoreConfig) -> Self {
        let net = Network::new(config.input_count as usize, config.compute_count as usize);
        let abort = Arc::new(AtomicBool::new(false));
        let inputs = (0..config.input_count)
            .map(|i| {
                InputNode::new(
                    config,
                    ConnectionId(i),
                    Loopback::new(net.clone(), Endpoint::Input(i as usize)),
                    FixedSource(64),
                    abort.clone(),
                    Timestamp::ZERO,
                )
            })
            .collect();
        let computes = (0..config.compute_count)
            .map(|c| {
                ComputeNode::new(
                    config,
                    ConnectionId(c),
                    Loopback::new(net.clone(), Endpoint::Compute(c as usize)),
                    abort.clone(),
                    Timestamp::ZERO,
                )
            })
            .collect();
        Self { net, inputs, computes, now_us: 0 }
    }

    /// Steps every live node forward until the simulated clock reaches
    /// `end_us`.
    fn run_until(&mut self, end_us: u64, step_us: u64) {
        while self.now_us < end_us {
            self.now_us += step_us;
            let now = Timestamp::from_micros(self.now_us);
            for (i, node) in self.inputs.iter_mut().enumerate() {
                let dead = self.net.borrow().dead_inputs[i];
                if !dead {
                    node.run_once(now);
                }
            }
            for (c, node) in self.computes.iter_mut().enumerate() {
                let dead = self.net.borrow().dead_computes[c];
                if !dead {
                    node.run_once(now);
                }
            }
        }
    }

    fn kill_compute(&mut self, c: usize) {
        let mut net = self.net.borrow_mut();
        net.dead_computes[c] = true;
        net.compute_inboxes[c].clear();
    }

    fn kill_input(&mut self, i: usize) {
        let mut net = self.net.borrow_mut();
        net.dead_inputs[i] = true;
        net.input_inboxes[i].clear();
    }
}

/// Short intervals and tight liveness so scenarios settle in simulated
/// milliseconds.
fn test_config(inputs: u32, computes: u32) -> CoreConfig {
    let mut config = CoreConfig::local(inputs, computes).with_rounds_per_interval(4);
    config.initial_interval_duration = TimeSpan::from_millis(2);
    config
}

const STEP_US: u64 = 250;

#[test]
fn steady_pipeline_converges_and_finalizes() {
    init_test_tracing();
    let mut p = Pipeline::new(&test_config(4, 3));
    p.run_until(100_000, STEP_US);

    // Every input worked through at least ten intervals, in lockstep.
    let indices: Vec<u64> = p.inputs.iter().map(InputNode::current_interval_index).collect();
    for &index in &indices {
        assert!(index >= 10, "interval index {index} after 100ms");
    }
    let spread = indices.iter().max().unwrap() - indices.iter().min().unwrap();
    assert!(spread <= 1, "inputs drifted apart: {indices:?}");

    // Each compute resolved the bulk of what the inputs sent, and its
    // watermark tracks the slowest sender to within two intervals' worth of
    // timeslices (4 rounds x 3 computes).
    let min_sent = p.inputs.iter().map(|i| i.sent_watermark().as_u64()).min().unwrap();
    assert!(min_sent >= 120, "only {min_sent} timeslices sent");
    for (c, compute) in p.computes.iter().enumerate() {
        let watermark = compute.watermark().expect("watermark advanced");
        assert!(watermark >= TimesliceIndex(100), "watermark stalled at {watermark}");
        assert!(
            watermark.as_u64() + 24 >= min_sent,
            "compute {c} watermark {watermark} trails the sent watermark {min_sent}"
        );
        assert!(compute.core().completed_count() >= 40);
    }

    // The pacing feedback loop converged: proposals track the measured
    // interval durations to within the speed-up margin, and the pace fell
    // well below the initial 2ms once the actuals showed it could.
    for (c, compute) in p.computes.iter().enumerate() {
        let actual = compute.core().last_interval_actual().expect("intervals aggregated");
        let proposed = compute
            .core()
            .proposal(IntervalIndex(actual.index.as_u64() + 2))
            .expect("every aggregation proposes two intervals ahead");
        let error = proposed.duration.as_micros().abs_diff(actual.duration.as_micros()) * 100
            / actual.duration.as_micros();
        assert!(
            error <= 15,
            "compute {c}: proposed {} vs actual {} ({error}% apart)",
            proposed.duration,
            actual.duration
        );
    }
    for (i, input) in p.inputs.iter().enumerate() {
        let pace = input.current_interval_duration_micros();
        assert!(pace <= 1_200, "input {i} pace stuck near the initial 2ms: {pace}us");
    }

    // Graceful shutdown: drain, then the terminal handshake on every
    // connection.
    for input in &mut p.inputs {
        input.request_finalize();
    }
    let end = p.now_us + 20_000;
    p.run_until(end, STEP_US);
    for (i, input) in p.inputs.iter().enumerate() {
        assert!(input.is_done(), "input {i} never finished its finalize handshake");
    }
    for (c, compute) in p.computes.iter().enumerate() {
        assert!(compute.is_done(), "compute {c} never finished its finalize handshake");
    }
}

#[test]
fn round_trips_refine_the_clock_skew_estimate() {
    init_test_tracing();
    let mut p = Pipeline::new(&test_config(1, 1));
    // The barrier seed claims the clocks agree, but the compute node's
    // clock actually runs 400us behind the input's. Only the echoed
    // heartbeats in the steady traffic can reveal that.
    p.inputs[0].seed_skew(Timestamp::ZERO, Timestamp::ZERO, Timestamp::ZERO);
    assert_eq!(p.inputs[0].skew_offset_micros(), 0);

    let skew = TimeSpan::from_micros(400);
    let mut now_us = 0;
    while now_us < 100_000 {
        now_us += STEP_US;
        let input_now = Timestamp::from_micros(now_us);
        p.inputs[0].run_once(input_now);
        p.computes[0].run_once(input_now - skew);
    }

    // The estimate moves from the bogus seed toward the true 400us offset.
    // The loopback delivers on the next pass, so the halved round trip
    // overstates the outbound leg by up to one step; accept that bias.
    let offset = p.inputs[0].skew_offset_micros();
    assert!(
        (300..=700).contains(&offset),
        "offset estimate {offset}us never converged toward the 400us skew"
    );
}

#[test]
fn silent_compute_is_timed_out_decided_and_dropped() {
    init_test_tracing();
    let mut p = Pipeline::new(&test_config(3, 2));
    p.run_until(30_000, STEP_US);
    let watermark_before = p.computes[0].watermark().expect("healthy phase completed slices");

    // Compute 1 crashes. Nobody is told; only its silence speaks.
    p.kill_compute(1);
    p.run_until(200_000, STEP_US);

    // Every input's heartbeat monitor timed the dead compute out, the
    // reports reached consensus on compute 0, and the decision came back.
    for (i, input) in p.inputs.iter().enumerate() {
        assert_eq!(input.live_targets(), &[ConnectionId(0)], "input {i} still targets the dead compute");
    }
    assert_eq!(p.computes[0].core().live_computes(), 1);
    assert!(
        p.computes[0].core().decisions_due(Timestamp::from_micros(p.now_us)).is_empty(),
        "decision still awaiting acks"
    );

    // The survivor keeps building timeslices alone.
    let watermark_after = p.computes[0].watermark().expect("watermark survived the failure");
    assert!(
        watermark_after > watermark_before,
        "watermark stuck: {watermark_before} -> {watermark_after}"
    );
}

#[test]
fn reported_input_failure_shrinks_the_contribution_set() {
    init_test_tracing();
    let mut p = Pipeline::new(&test_config(3, 2));
    p.run_until(30_000, STEP_US);
    let watermark_before = p.computes[0].watermark().expect("healthy phase completed slices");

    // Input 2 crashes; its peers notice through the data source and inject
    // reports (input-side peers exchange no heartbeats of their own).
    p.kill_input(2);
    let trigger = p.inputs[0].sent_watermark();
    for i in 0..2 {
        let report = FailureReport {
            reporter: ConnectionId(i),
            failed: ConnectionId(2),
            failed_role: Role::Input,
            last_completed_desc: DescIndex::ZERO,
            timeslice_trigger: trigger,
        };
        p.inputs[i as usize].report_failure(report);
    }
    p.run_until(200_000, STEP_US);

    // Both computes decided, shrank their contribution set, and kept
    // completing timeslices with the two survivors.
    for (c, compute) in p.computes.iter().enumerate() {
        assert_eq!(
            compute.core().live_inputs(),
            vec![ConnectionId(0), ConnectionId(1)],
            "compute {c} still waits on the dead input"
        );
        let watermark = compute.watermark().expect("watermark survived the failure");
        assert!(watermark > watermark_before, "compute {c} watermark stuck at {watermark}");
    }
    for i in 0..2 {
        assert!(
            p.inputs[i].current_interval_index() >= 10,
            "surviving input {i} stopped pacing"
        );
    }
}
