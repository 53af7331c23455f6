//! Scripted stand-ins for the learned collaborators.
//!
//! They let the orchestrator run end to end against [`GridWorld`](crate::GridWorld)
//! without any network: perception reads the egocentric crop straight into the
//! local map, the local policy follows the planner, and the global policy samples
//! goals from a fixed Gaussian.

use crate::grid_world::{action_towards, cell_index, TURN_LEFT};
use multislam::buffer::RolloutStorage;
use multislam::checkpoint::Checkpointable;
use multislam::map::{MapChannel, Pose};
use multislam::policy::{
    GlobalOptimizer, GlobalPolicy, LocalAction, LocalPolicy, MapEstimate, PerceptionInput,
    PerceptionModel, PerceptionOutput, PolicyOutput, UpdateMetrics,
};
use multislam::{Result, SlamError};
use ndarray::{
    s, Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, ArrayView4, ArrayViewMut2, Axis,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

/// Local actions of the grid world
const NUM_ACTIONS: usize = 3;

/// Score given to the chosen local action; the others get zero
const CHOSEN_LOGIT: f32 = 4.0;

fn rejected(component: &'static str, detail: String) -> SlamError {
    SlamError::ContractViolation { component, detail }
}

/// Wrap degrees into `(-180, 180]`
fn wrap_degrees(degrees: f32) -> f32 {
    let wrapped = degrees.rem_euclid(360.0);
    if wrapped > 180.0 {
        wrapped - 360.0
    } else {
        wrapped
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct TrainingState {
    updates: u64,
    last_loss: Option<f64>,
}

impl TrainingState {
    fn record(&mut self, loss: f64) {
        self.updates += 1;
        self.last_loss = Some(loss);
    }
}

/// Perception that trusts the observation.
///
/// Odometry is snapped to whole cells, so the small pose noise of the grid
/// world never accumulates. Its supervised predictions equal the targets.
#[derive(Clone, Debug)]
pub struct OraclePerception {
    cell_metres: f32,
    state: TrainingState,
}

impl OraclePerception {
    pub fn new(resolution_cm: usize) -> Self {
        Self {
            cell_metres: resolution_cm as f32 / 100.0,
            state: TrainingState::default(),
        }
    }

    /// Optimization steps taken so far
    pub fn updates(&self) -> u64 {
        self.state.updates
    }

    /// Move a local pose by a sensor delta, landing on a cell centre.
    pub fn integrate(&self, pose: Pose, delta: Pose) -> Pose {
        let m = self.cell_metres;
        let col = cell_index(pose.x, m) + (delta.x / m).round() as i64;
        let row = cell_index(pose.y, m) + (delta.y / m).round() as i64;
        Pose::new(
            (col as f32 + 0.5) * m,
            (row as f32 + 0.5) * m,
            wrap_degrees(pose.heading + delta.heading),
        )
    }

    /// Write one egocentric crop `[C, V, V]` around `pose` into the local channels.
    fn paint(
        &self,
        mut obstacle: ArrayViewMut2<'_, f32>,
        mut explored: ArrayViewMut2<'_, f32>,
        view: ArrayView3<'_, f32>,
        pose: Pose,
    ) {
        let (rows, cols) = obstacle.dim();
        let (_, v, _) = view.dim();
        let radius = (v / 2) as i64;
        let row = cell_index(pose.y, self.cell_metres);
        let col = cell_index(pose.x, self.cell_metres);
        for ((i, j), &visible) in view.index_axis(Axis(0), 1).indexed_iter() {
            if visible < 0.5 {
                continue;
            }
            let r = row + i as i64 - radius;
            let c = col + j as i64 - radius;
            if r < 0 || c < 0 || r >= rows as i64 || c >= cols as i64 {
                continue;
            }
            let cell = (r as usize, c as usize);
            explored[cell] = 1.0;
            obstacle[cell] = obstacle[cell].max(view[[0, i, j]]);
        }
    }
}

impl Checkpointable for OraclePerception {
    fn save_state(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.state)?)
    }

    fn load_state(&mut self, data: &[u8]) -> Result<()> {
        self.state = serde_json::from_slice(data)?;
        Ok(())
    }
}

impl PerceptionModel for OraclePerception {
    fn infer(&mut self, input: PerceptionInput<'_>, build_maps: bool) -> Result<PerceptionOutput> {
        let (b, c, _, _) = input.obs.dim();
        if c < 2 {
            return Err(rejected(
                "oracle perception",
                format!("needs obstacle and visibility channels, got {c}"),
            ));
        }
        let projection: Array3<f32> = input.obs.slice(s![.., 0, .., ..]).to_owned();
        let explored_view: Array3<f32> = input.obs.slice(s![.., 1, .., ..]).to_owned();

        let maps = match (build_maps, input.prior) {
            (true, Some(prior)) => {
                if prior.poses.len() != b || input.pose_delta.nrows() != b {
                    return Err(rejected(
                        "oracle perception",
                        format!(
                            "{} poses and {} deltas for {} observations",
                            prior.poses.len(),
                            input.pose_delta.nrows(),
                            b
                        ),
                    ));
                }
                let mut obstacle = prior.obstacle.to_owned();
                let mut explored = prior.explored.to_owned();
                let mut poses = Vec::with_capacity(b);
                for (e, &pose) in prior.poses.iter().enumerate() {
                    let row = input.pose_delta.row(e);
                    let next = self.integrate(pose, Pose::new(row[0], row[1], row[2]));
                    self.paint(
                        obstacle.index_axis_mut(Axis(0), e),
                        explored.index_axis_mut(Axis(0), e),
                        input.obs.index_axis(Axis(0), e),
                        next,
                    );
                    poses.push(next);
                }
                Some(MapEstimate {
                    obstacle,
                    explored,
                    poses,
                })
            }
            _ => None,
        };

        Ok(PerceptionOutput {
            projection,
            explored: explored_view,
            pose_error: Array2::zeros((b, 3)),
            maps,
        })
    }

    fn optimize(&mut self, loss: f64) -> Result<()> {
        self.state.record(loss);
        Ok(())
    }
}

/// Local policy that executes the planner's suggestion.
///
/// Outside deterministic mode it takes a uniformly random action with
/// probability `epsilon`.
#[derive(Clone, Debug)]
pub struct PlannerFollower {
    epsilon: f64,
    rng: ChaCha8Rng,
    state: TrainingState,
}

impl PlannerFollower {
    pub fn new(epsilon: f64, seed: u64) -> Self {
        Self {
            epsilon: if epsilon.is_nan() {
                0.0
            } else {
                epsilon.clamp(0.0, 1.0)
            },
            rng: ChaCha8Rng::seed_from_u64(seed),
            state: TrainingState::default(),
        }
    }

    pub fn updates(&self) -> u64 {
        self.state.updates
    }
}

impl Checkpointable for PlannerFollower {
    fn save_state(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.state)?)
    }

    fn load_state(&mut self, data: &[u8]) -> Result<()> {
        self.state = serde_json::from_slice(data)?;
        Ok(())
    }
}

impl LocalPolicy for PlannerFollower {
    fn rec_state_size(&self) -> usize {
        1
    }

    fn act(
        &mut self,
        _obs: ArrayView4<'_, f32>,
        rec_states: ArrayView2<'_, f32>,
        _masks: ArrayView1<'_, f32>,
        goals: ArrayView2<'_, i64>,
        deterministic: bool,
    ) -> Result<LocalAction> {
        let n = goals.nrows();
        let mut actions = Vec::with_capacity(n);
        let mut logits = Array2::zeros((n, NUM_ACTIONS));
        for (e, goal) in goals.rows().into_iter().enumerate() {
            let mut action = if goal[0] == 0 {
                TURN_LEFT
            } else {
                action_towards(goal[1] as i32)
            };
            if !deterministic && self.rng.gen_bool(self.epsilon) {
                action = self.rng.gen_range(0..NUM_ACTIONS);
            }
            logits[[e, action]] = CHOSEN_LOGIT;
            actions.push(action);
        }
        Ok(LocalAction {
            actions,
            logits,
            rec_states: rec_states.to_owned(),
        })
    }

    fn optimize(&mut self, loss: f64) -> Result<()> {
        self.state.record(loss);
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
struct GoalDistribution {
    mean: [f32; 2],
    std: f32,
}

/// Global policy drawing raw goals from an isotropic Gaussian.
///
/// Its value estimate is the explored fraction of each agent's local map.
#[derive(Clone, Debug)]
pub struct GaussianGoalPolicy {
    goals: GoalDistribution,
    noise: Normal<f32>,
    rng: ChaCha8Rng,
}

impl GaussianGoalPolicy {
    pub fn new(mean: [f32; 2], std: f32, seed: u64) -> Result<Self> {
        let noise = Normal::new(0.0, std)
            .map_err(|e| SlamError::InvalidConfig(format!("goal spread {std}: {e}")))?;
        if !(std > 0.0) {
            return Err(SlamError::InvalidConfig(format!(
                "goal spread must be positive, got {std}"
            )));
        }
        Ok(Self {
            goals: GoalDistribution { mean, std },
            noise,
            rng: ChaCha8Rng::seed_from_u64(seed),
        })
    }

    /// Gaussian log density of a raw action
    pub fn log_prob(&self, action: [f32; 2]) -> f32 {
        let std = self.goals.std;
        let norm = std.ln() + 0.5 * (2.0 * std::f32::consts::PI).ln();
        action
            .iter()
            .zip(self.goals.mean)
            .map(|(&a, mu)| -((a - mu).powi(2)) / (2.0 * std * std) - norm)
            .sum()
    }

    fn values(obs: ArrayView4<'_, f32>) -> Array1<f32> {
        obs.axis_iter(Axis(0))
            .map(|maps| {
                maps.index_axis(Axis(0), MapChannel::Explored.index())
                    .mean()
                    .unwrap_or(0.0)
            })
            .collect()
    }
}

impl Checkpointable for GaussianGoalPolicy {
    fn save_state(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.goals)?)
    }

    fn load_state(&mut self, data: &[u8]) -> Result<()> {
        let goals: GoalDistribution = serde_json::from_slice(data)?;
        *self = Self {
            rng: self.rng.clone(),
            ..Self::new(goals.mean, goals.std, 0)?
        };
        Ok(())
    }
}

impl GlobalPolicy for GaussianGoalPolicy {
    fn rec_state_size(&self) -> usize {
        1
    }

    fn act(
        &mut self,
        obs: ArrayView4<'_, f32>,
        rec_states: ArrayView2<'_, f32>,
        _masks: ArrayView1<'_, f32>,
        _extras: ArrayView1<'_, i64>,
        deterministic: bool,
    ) -> Result<PolicyOutput> {
        let n = obs.len_of(Axis(0));
        let mut actions = Array2::zeros((n, 2));
        let mut log_probs = Array1::zeros(n);
        for e in 0..n {
            let mut action = self.goals.mean;
            if !deterministic {
                for value in action.iter_mut() {
                    *value += self.noise.sample(&mut self.rng);
                }
            }
            actions[[e, 0]] = action[0];
            actions[[e, 1]] = action[1];
            log_probs[e] = self.log_prob(action);
        }
        Ok(PolicyOutput {
            values: Self::values(obs),
            actions,
            log_probs,
            rec_states: rec_states.to_owned(),
        })
    }

    fn get_value(
        &mut self,
        obs: ArrayView4<'_, f32>,
        _rec_states: ArrayView2<'_, f32>,
        _masks: ArrayView1<'_, f32>,
        _extras: ArrayView1<'_, i64>,
    ) -> Result<Array1<f32>> {
        Ok(Self::values(obs))
    }
}

/// Optimizer that leaves the policy untouched and reports PPO-style statistics
/// of each rollout.
#[derive(Clone, Debug)]
pub struct RolloutMonitor {
    num_mini_batch: usize,
    rng: ChaCha8Rng,
    updates: u64,
}

impl RolloutMonitor {
    pub fn new(num_mini_batch: usize, seed: u64) -> Self {
        Self {
            num_mini_batch: num_mini_batch.max(1),
            rng: ChaCha8Rng::seed_from_u64(seed),
            updates: 0,
        }
    }

    pub fn updates(&self) -> u64 {
        self.updates
    }
}

impl GlobalOptimizer for RolloutMonitor {
    fn update(
        &mut self,
        _policy: &mut dyn GlobalPolicy,
        rollouts: &RolloutStorage,
    ) -> Result<UpdateMetrics> {
        let samples = rollouts.num_steps() * rollouts.num_agents();
        let batches =
            rollouts.feed_forward_batches(self.num_mini_batch.min(samples).max(1), &mut self.rng)?;

        let mut metrics = UpdateMetrics::default();
        for batch in &batches {
            let errors = &batch.returns - &batch.value_preds;
            metrics.value_loss += 0.5 * errors.mapv(|d| d * d).mean().unwrap_or(0.0) as f64;
            metrics.action_loss -= batch.advantages.mean().unwrap_or(0.0) as f64;
            metrics.dist_entropy -= batch.old_log_probs.mean().unwrap_or(0.0) as f64;
        }
        let count = batches.len().max(1) as f64;
        metrics.value_loss /= count;
        metrics.action_loss /= count;
        metrics.dist_entropy /= count;
        self.updates += 1;
        tracing::debug!(
            value_loss = metrics.value_loss,
            batches = batches.len(),
            "Rollout statistics"
        );
        Ok(metrics)
    }
}
