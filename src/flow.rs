//! Credit-based flow control between one input/compute connection pair.

pub mod ledger;

pub use ledger::{FlowLedger, FlowPointers, StreamLedger};
