//! Experience storage.
//!
//! - `RolloutStorage` - fixed-horizon global-policy transitions with return computation
//! - `FifoMemory` - bounded replay ring of perception samples

mod replay;
mod rollout;

pub use replay::{FifoMemory, ReplaySample, ReplayTarget};
pub use rollout::{MiniBatch, RolloutStorage, Transition};
