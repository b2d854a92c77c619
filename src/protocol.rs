//! Status-message content exchanged between input and compute nodes.
//!
//! Serialization onto the wire is the transport collaborator's business; the
//! protocol is internal to the system, so only message *content* is defined
//! here.

pub mod message;

pub use message::{ComputeStatus, DescriptorRecord, InputStatus, StatusMessage};

use thiserror::Error;

use crate::types::ConnectionId;

/// A peer sent something the protocol does not admit.
///
/// Violations are logged and discarded by the event loops — a misbehaving
/// peer must never take down a healthy node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// A message referenced a connection index this node does not have.
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
    /// A failure report arrived for an already-decided failure.
    #[error("failure of {0} already decided")]
    AlreadyDecided(ConnectionId),
}
