//! Single-threaded node event loops and their supporting plumbing.
//!
//! Each node role runs one cooperative loop: no parallel threads mutate a
//! connection's state, so none of this needs locks — only clear single-owner
//! semantics. The [`mediator::ComputeCore`] façade owns the compute-side
//! components and mediates their cross-component reactions; the
//! [`scheduler::TimerQueue`] turns every wait into a deadline.

pub mod compute;
pub mod input;
pub mod mediator;
pub mod scheduler;

pub use compute::ComputeNode;
pub use input::{ContributionSource, InputNode};
pub use mediator::ComputeCore;
pub use scheduler::{TimerHandle, TimerQueue};
