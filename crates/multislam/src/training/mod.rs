//! Two-timescale training.
//!
//! - `EpisodeCadence` - local/global step schedule of one episode
//! - `Trainer` - the episode loop over environment, perception and both policies
//! - `EvalReport` - explored-area series written in evaluation mode

mod cadence;
mod config;
mod eval;
pub mod loss;
mod stats;
mod trainer;

pub use cadence::{ContinuationMask, EpisodeCadence, StepTick};
pub use config::TrainerConfig;
pub use eval::EvalReport;
pub use stats::{EpisodeRewards, TrainingStats};
pub use trainer::{Collaborators, RunSummary, Trainer};
