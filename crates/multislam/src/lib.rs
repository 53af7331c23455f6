//! # multislam
//!
//! Training core for hierarchical multi-agent exploration.
//!
//! ## Overview
//!
//! multislam provides:
//! - A shared multi-channel spatial map with per-agent local windows (`map`)
//! - Multi-agent map fusion that keeps obstacle/exploration knowledge in sync
//! - Incremental-discovery rewards that never double-credit a cell (`reward`)
//! - A fixed-horizon rollout buffer and a FIFO replay buffer (`buffer`)
//! - The two-timescale training orchestrator (`training`)
//!
//! The environment, perception model, policies and optimizer are collaborators
//! behind the traits in `env` and `policy`.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use multislam::prelude::*;
//!
//! let config = TrainerConfig::default().with_num_agents(2);
//! let mut trainer = Trainer::new(config, collaborators)?;
//! trainer.run(&mut env)?;
//! ```

pub mod buffer;
pub mod checkpoint;
pub mod env;
pub mod log;
pub mod map;
pub mod policy;
pub mod reward;
pub mod training;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::buffer::{FifoMemory, ReplaySample, ReplayTarget, RolloutStorage};
    pub use crate::env::{ExplorationVecEnv, PlannerRequest, ShortTermGoal, StepInfo, VecStep};
    pub use crate::map::{compute_window, MapChannel, MapGeometry, MapState, Pose, Window};
    pub use crate::policy::{
        GlobalOptimizer, GlobalPolicy, LocalAction, LocalPolicy, PerceptionModel, PolicyOutput,
        UpdateMetrics,
    };
    pub use crate::reward::{calc_rewards, ExplorationTracker};
    pub use crate::training::{Collaborators, EpisodeCadence, Trainer, TrainerConfig};

    pub use crate::checkpoint::{Checkpointable, SnapshotConfig, SnapshotManager};
    pub use crate::log::{CompositeLogger, ConsoleLogger, MetricLogger};
    pub use crate::utils::RollingWindow;
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

use map::MapChannel;

/// Error types for the library
#[derive(Debug, thiserror::Error)]
pub enum SlamError {
    #[error("Contract violation by {component}: {detail}")]
    ContractViolation {
        component: &'static str,
        detail: String,
    },

    #[error("Shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Agent {agent} at cell ({row}, {col}) is outside the {width}x{height} map")]
    OutOfBounds {
        agent: usize,
        row: i64,
        col: i64,
        width: usize,
        height: usize,
    },

    #[error("Non-finite value in {0}")]
    NonFinite(&'static str),

    #[error("Channel {0:?} is synchronized and can only be written by fusion")]
    SynchronizedWrite(MapChannel),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SlamError {
    /// Numerical faults are skipped by the orchestrator; everything else ends the run.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SlamError::NonFinite(_))
    }

    pub(crate) fn contract(component: &'static str, detail: impl Into<String>) -> Self {
        SlamError::ContractViolation {
            component,
            detail: detail.into(),
        }
    }
}

pub type Result<T> = core::result::Result<T, SlamError>;

/// Fail with a `ShapeMismatch` unless `actual == expected`.
pub(crate) fn ensure_shape(context: &'static str, expected: &[usize], actual: &[usize]) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(SlamError::ShapeMismatch {
            context,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_numerical_faults_are_recoverable() {
        assert!(SlamError::NonFinite("reward").is_recoverable());
        assert!(!SlamError::contract("planner", "wrong count").is_recoverable());
        assert!(!SlamError::SynchronizedWrite(MapChannel::Obstacle).is_recoverable());
    }

    #[test]
    fn test_ensure_shape() {
        assert!(ensure_shape("map", &[2, 3], &[2, 3]).is_ok());
        let err = ensure_shape("map", &[2, 3], &[3, 2]).unwrap_err();
        assert!(err.to_string().contains("expected [2, 3]"));
    }
}
