//! Vectorized exploration environment contract.
//!
//! The environment steps every agent of one group at once and also hosts the
//! short-term planner that turns long-term goals into expert actions.

use crate::map::{PlannerPose, Pose};
use crate::{ensure_shape, Result, SlamError};
use ndarray::{Array1, Array2, Array4};

/// Per-agent information returned with every reset and step.
#[derive(Clone, Debug)]
pub struct StepInfo {
    /// Sensor pose change since the previous step
    pub sensor_pose: Pose,
    /// Area explored by this agent, ground-truth full-map frame
    pub explored_map: Array2<f32>,
    /// Area that can be explored at all, same frame
    pub explorable_map: Array2<f32>,
    /// Environment-side exploration reward
    pub exp_reward: f32,
    /// Environment-side explored ratio
    pub exp_ratio: f32,
    /// Ground-truth egocentric obstacle projection
    pub fp_proj: Array2<f32>,
    /// Ground-truth egocentric explored mask
    pub fp_explored: Array2<f32>,
    /// Ground-truth sensor pose error
    pub pose_err: Pose,
}

/// Result of one synchronous step over every agent.
#[derive(Clone, Debug)]
pub struct VecStep {
    /// `[agents, C, H, W]`
    pub obs: Array4<f32>,
    pub rewards: Array1<f32>,
    pub dones: Vec<bool>,
    pub infos: Vec<StepInfo>,
}

/// Planner input for one agent.
#[derive(Clone, Debug)]
pub struct PlannerRequest {
    /// Long-term goal `(row, col)` inside the local window
    pub goal: (usize, usize),
    /// Predicted obstacle channel of the local map
    pub map_pred: Array2<f32>,
    /// Predicted explored channel of the local map
    pub exp_pred: Array2<f32>,
    pub pose: PlannerPose,
}

/// Planner output for one agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShortTermGoal {
    /// Relative short-term goal fed to the local policy
    pub relative_goal: [i64; 2],
    /// Action the planner would take, used as the imitation target
    pub expert_action: usize,
}

/// Vectorized environment over one agent group.
pub trait ExplorationVecEnv {
    /// Number of agents stepped together
    fn num_envs(&self) -> usize;

    /// Observation shape `(C, H, W)` of a single agent
    fn obs_shape(&self) -> (usize, usize, usize);

    /// Size of the discrete local action space
    fn num_actions(&self) -> usize;

    /// Start a new episode.
    fn reset(&mut self) -> Result<(Array4<f32>, Vec<StepInfo>)>;

    /// Apply one local action per agent.
    fn step(&mut self, actions: &[usize]) -> Result<VecStep>;

    /// Plan one short-term goal per request.
    fn get_short_term_goal(&mut self, requests: &[PlannerRequest]) -> Result<Vec<ShortTermGoal>>;
}

/// Check a reset or step result against the environment's declared sizes.
pub(crate) fn validate_batch(
    env: &dyn ExplorationVecEnv,
    obs: &Array4<f32>,
    infos: &[StepInfo],
) -> Result<()> {
    let n = env.num_envs();
    let (c, h, w) = env.obs_shape();
    ensure_shape("environment observation", &[n, c, h, w], obs.shape())?;
    if infos.len() != n {
        return Err(SlamError::contract(
            "environment",
            format!("returned {} infos for {} agents", infos.len(), n),
        ));
    }
    let Some(first) = infos.first() else {
        return Ok(());
    };
    let map_shape = first.explorable_map.shape();
    let view_shape = first.fp_proj.shape();
    for info in infos {
        ensure_shape("explored map", map_shape, info.explored_map.shape())?;
        ensure_shape("explorable map", map_shape, info.explorable_map.shape())?;
        ensure_shape("projection target", view_shape, info.fp_proj.shape())?;
        ensure_shape("explored target", view_shape, info.fp_explored.shape())?;
        if !info.sensor_pose.is_finite() || !info.pose_err.is_finite() {
            return Err(SlamError::contract("environment", "non-finite sensor pose"));
        }
    }
    Ok(())
}

/// Check a step result, including the per-agent reward and done vectors.
pub(crate) fn validate_step(env: &dyn ExplorationVecEnv, step: &VecStep) -> Result<()> {
    validate_batch(env, &step.obs, &step.infos)?;
    let n = env.num_envs();
    if step.dones.len() != n || step.rewards.len() != n {
        return Err(SlamError::contract(
            "environment",
            format!(
                "returned {} done flags and {} rewards for {} agents",
                step.dones.len(),
                step.rewards.len(),
                n
            ),
        ));
    }
    Ok(())
}

/// Check planner output against the request batch.
pub(crate) fn validate_goals(
    goals: &[ShortTermGoal],
    requests: usize,
    num_actions: usize,
) -> Result<()> {
    if goals.len() != requests {
        return Err(SlamError::contract(
            "planner",
            format!("returned {} goals for {} requests", goals.len(), requests),
        ));
    }
    if let Some(bad) = goals.iter().find(|g| g.expert_action >= num_actions) {
        return Err(SlamError::contract(
            "planner",
            format!(
                "expert action {} outside {} actions",
                bad.expert_action, num_actions
            ),
        ));
    }
    Ok(())
}
