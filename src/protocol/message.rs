//! Status-message field definitions.
//!
//! One message family per direction. Input-to-compute carries write pointers
//! and measured interval actuals; compute-to-input carries acknowledge
//! pointers and interval proposals. Failure reports and decisions piggyback
//! on whichever direction needs them — consensus traffic never gets its own
//! message stream.

use serde::{Deserialize, Serialize};

use crate::failure::consensus::{FailureDecision, FailureReport};
use crate::flow::FlowPointers;
use crate::pacing::interval::{IntervalActual, IntervalInfo};
use crate::time::Timestamp;
use crate::types::{ConnectionId, DescIndex, HeartbeatSeq, IntervalIndex, Role, TimesliceIndex};

/// One newly-completed contribution, announced by an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorRecord {
    /// Position in the connection's descriptor stream.
    pub index: DescIndex,
    /// Timeslice this contribution belongs to.
    pub timeslice: TimesliceIndex,
    /// Payload offset in the data ring (free-running bytes).
    pub offset: u64,
    /// Payload size in bytes.
    pub size: u64,
}

/// Status message sent from an input node to a compute node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputStatus {
    /// Local write pointers for both streams.
    pub write: FlowPointers,
    /// Finalize handshake flag; with `abort`, drain is waived.
    pub finalize: bool,
    pub abort: bool,
    /// Newly-completed descriptor records, bounded per message.
    pub descriptors: Vec<DescriptorRecord>,
    /// This interval's measured metadata, once fully sent.
    pub interval_actual: Option<IntervalActual>,
    /// The interval whose proposal this input wants next.
    pub asking_interval: IntervalIndex,
    /// Heartbeat sequence id for liveness and round-trip correlation.
    pub heartbeat: HeartbeatSeq,
    /// Piggybacked failure report, when one is pending.
    pub failure_report: Option<FailureReport>,
    /// Acknowledges the broadcast failure decision about this connection.
    pub decision_ack: Option<(Role, ConnectionId)>,
}

/// Status message sent from a compute node to an input node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeStatus {
    /// Acknowledge pointers for both streams.
    pub ack: FlowPointers,
    /// Proposal for the interval the input is currently asking about.
    pub proposal: Option<IntervalInfo>,
    /// Finalize/abort echo.
    pub finalize: bool,
    pub abort: bool,
    /// Failure decision pending broadcast, when one is.
    pub decision: Option<FailureDecision>,
    /// Echo of the input's most recent heartbeat sequence.
    pub heartbeat_ack: HeartbeatSeq,
    /// Sender's clock when the message was built; paired with the echo it
    /// gives the input a skew-refinement sample.
    pub stamp: Timestamp,
}

/// Either direction's status message, as handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusMessage {
    Input(InputStatus),
    Compute(ComputeStatus),
}

impl StatusMessage {
    /// True when this is the connection's terminal message.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        match self {
            Self::Input(m) => m.finalize,
            Self::Compute(m) => m.finalize,
        }
    }
}
