//! Coordination core for streaming acquisition pipelines.
//!
//! Input nodes stream fixed-cadence timeslice contributions to a set of
//! compute nodes; this crate provides the control plane that keeps that flow
//! healthy: credit-based flow accounting ([`flow`]), adaptive interval pacing
//! ([`pacing`]), ordered completion tracking ([`completion`]), leaderless
//! failure handling ([`failure`]), and the single-threaded node event loops
//! that tie them to a pluggable [`transport`].

pub mod completion;
pub mod config;
pub mod failure;
pub mod flow;
pub mod pacing;
pub mod protocol;
pub mod runtime;
pub mod time;
pub mod trace;
pub mod transport;
pub mod types;

#[doc(inline)]
pub use config::CoreConfig;
#[doc(inline)]
pub use runtime::{ComputeCore, ComputeNode, ContributionSource, InputNode};
#[doc(inline)]
pub use trace::init_tracing;

// Re-export serde traits for convenience
pub use serde::{Deserialize, Serialize};
