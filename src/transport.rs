//! Transport collaborator seam.
//!
//! The coordination core never touches sockets. It hands fully-formed status
//! messages to a [`Transport`] implementation and consumes completion and
//! receive events from it. Every event carries its meaning in the variant
//! tag; nothing is packed into opaque id bit fields.

use thiserror::Error;

use crate::protocol::StatusMessage;
use crate::types::{ConnectionId, HeartbeatSeq};

/// Token identifying one in-flight send, echoed back in
/// [`TransportEvent::SendComplete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingSend(pub u64);

/// Transport-layer failure surfaced to the event loop.
///
/// Connection loss is deliberately *not* here: a dead peer shows up as
/// heartbeat silence and goes through failure consensus, never as a send
/// error.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no route for connection {0}")]
    NoRoute(ConnectionId),
    #[error("send queue full for connection {0}")]
    QueueFull(ConnectionId),
}

/// One completed transport operation, drained via [`Transport::poll`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// An earlier [`Transport::send`] finished; its buffers may be reused.
    SendComplete { connection: ConnectionId, pending: PendingSend },
    /// A peer's status message arrived.
    Received { connection: ConnectionId, message: StatusMessage },
    /// A bare heartbeat arrived (no status payload).
    Heartbeat { connection: ConnectionId, seq: HeartbeatSeq },
}

/// Message-level transport used by the node event loops.
///
/// Implementations are single-threaded collaborators owned by one event
/// loop; `poll` is non-blocking and returns events one at a time so the
/// loop stays in control of dispatch order.
pub trait Transport {
    /// Queues a status message to one connection.
    ///
    /// # Errors
    ///
    /// [`TransportError`] when the connection has no route or its send
    /// queue is full. The caller retries on the next loop iteration; flow
    /// control above this layer keeps queues shallow.
    fn send(
        &mut self,
        connection: ConnectionId,
        message: StatusMessage,
    ) -> Result<PendingSend, TransportError>;

    /// Queues a bare heartbeat probe to one connection.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Self::send`].
    fn send_heartbeat(
        &mut self,
        connection: ConnectionId,
        seq: HeartbeatSeq,
    ) -> Result<(), TransportError>;

    /// Drains the next completed event, if any. Never blocks.
    fn poll(&mut self) -> Option<TransportEvent>;
}
