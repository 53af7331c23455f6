//! Built-in environment and scripted collaborators for multislam.
//!
//! - `GridWorld` - shared occupancy grid explored by several agents, with a BFS planner
//! - `OraclePerception` - writes the observed crop straight into the local map
//! - `PlannerFollower` - local policy that executes the planner's expert action
//! - `GaussianGoalPolicy` - global policy sampling long-term goals from a Gaussian
//! - `RolloutMonitor` - global optimizer that only reports rollout statistics

mod agents;
mod grid_world;

pub use agents::{GaussianGoalPolicy, OraclePerception, PlannerFollower, RolloutMonitor};
pub use grid_world::{
    action_towards, plan, GridWorld, GridWorldConfig, FORWARD, OBS_CHANNELS, TURN_LEFT, TURN_RIGHT,
};

use multislam::training::{Collaborators, TrainerConfig};
use multislam::Result;

/// Chance that the scripted local policy ignores the planner during training
pub const LOCAL_EPSILON: f64 = 0.1;

/// Minibatches the rollout monitor splits each update into
pub const MONITOR_MINI_BATCHES: usize = 4;

/// Scripted collaborators sized for `config`.
pub fn scripted_collaborators(config: &TrainerConfig) -> Result<Collaborators> {
    Ok(Collaborators {
        perception: Box::new(OraclePerception::new(config.map_resolution)),
        local_policy: Box::new(PlannerFollower::new(LOCAL_EPSILON, config.seed)),
        global_policy: Box::new(GaussianGoalPolicy::new(
            [0.0, 0.0],
            1.0,
            config.seed.wrapping_add(1),
        )?),
        optimizer: Box::new(RolloutMonitor::new(
            MONITOR_MINI_BATCHES,
            config.seed.wrapping_add(2),
        )),
    })
}
