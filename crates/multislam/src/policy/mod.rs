//! Learned collaborators: perception model, local and global policies, global optimizer.
//!
//! Network internals live outside this crate. The orchestrator only relies on
//! the shapes documented on each trait and aborts the run when they are violated.

use crate::buffer::RolloutStorage;
use crate::checkpoint::Checkpointable;
use crate::map::Pose;
use crate::Result;
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, ArrayView4};

/// Output of a global or local actor-critic step for every agent.
#[derive(Clone, Debug)]
pub struct PolicyOutput {
    /// `[agents]`
    pub values: Array1<f32>,
    /// Raw actions `[agents, action_dim]`
    pub actions: Array2<f32>,
    /// `[agents]`
    pub log_probs: Array1<f32>,
    /// `[agents, rec_state_size]`
    pub rec_states: Array2<f32>,
}

/// Local policy output for every agent.
#[derive(Clone, Debug)]
pub struct LocalAction {
    pub actions: Vec<usize>,
    /// Unnormalized action scores `[agents, num_actions]`
    pub logits: Array2<f32>,
    /// `[agents, rec_state_size]`
    pub rec_states: Array2<f32>,
}

/// Scalar diagnostics of one global optimization step.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct UpdateMetrics {
    pub value_loss: f64,
    pub action_loss: f64,
    pub dist_entropy: f64,
}

/// Prior map state fed to the perception model while building maps.
#[derive(Clone, Copy, Debug)]
pub struct MapPrior<'a> {
    /// `[agents, local_w, local_h]`
    pub obstacle: ArrayView3<'a, f32>,
    /// `[agents, local_w, local_h]`
    pub explored: ArrayView3<'a, f32>,
    pub poses: &'a [Pose],
}

/// Perception model input for a batch.
#[derive(Clone, Copy, Debug)]
pub struct PerceptionInput<'a> {
    /// `[batch, C, H, W]`
    pub prev_obs: ArrayView4<'a, f32>,
    /// `[batch, C, H, W]`
    pub obs: ArrayView4<'a, f32>,
    /// Sensor pose deltas `[batch, 3]`
    pub pose_delta: ArrayView2<'a, f32>,
    /// Present when maps are being built, absent for supervised training batches
    pub prior: Option<MapPrior<'a>>,
}

/// Updated local map channels and poses.
#[derive(Clone, Debug)]
pub struct MapEstimate {
    /// `[agents, local_w, local_h]`
    pub obstacle: Array3<f32>,
    /// `[agents, local_w, local_h]`
    pub explored: Array3<f32>,
    pub poses: Vec<Pose>,
}

/// Perception model output for a batch.
#[derive(Clone, Debug)]
pub struct PerceptionOutput {
    /// Predicted egocentric obstacle projection in `[0, 1]`, `[batch, V, V]`
    pub projection: Array3<f32>,
    /// Predicted egocentric explored mask in `[0, 1]`, `[batch, V, V]`
    pub explored: Array3<f32>,
    /// Predicted pose error `[batch, 3]`
    pub pose_error: Array2<f32>,
    /// Present when `build_maps` was requested
    pub maps: Option<MapEstimate>,
}

/// Learned mapping and pose estimation.
pub trait PerceptionModel: Checkpointable {
    fn infer(&mut self, input: PerceptionInput<'_>, build_maps: bool) -> Result<PerceptionOutput>;

    /// Apply one optimization step for the given training loss.
    fn optimize(&mut self, loss: f64) -> Result<()>;
}

/// Low-level policy that acts every local step.
pub trait LocalPolicy: Checkpointable {
    fn rec_state_size(&self) -> usize;

    /// `goals` holds each agent's relative short-term goal `[agents, 2]`.
    fn act(
        &mut self,
        obs: ArrayView4<'_, f32>,
        rec_states: ArrayView2<'_, f32>,
        masks: ArrayView1<'_, f32>,
        goals: ArrayView2<'_, i64>,
        deterministic: bool,
    ) -> Result<LocalAction>;

    /// Apply one optimization step for the accumulated imitation loss.
    fn optimize(&mut self, loss: f64) -> Result<()>;
}

/// High-level policy that picks a long-term goal every global step.
pub trait GlobalPolicy: Checkpointable {
    fn rec_state_size(&self) -> usize;

    /// Width of the raw action; the orchestrator reads the first two entries as the goal.
    fn action_dim(&self) -> usize {
        2
    }

    /// `extras` holds each agent's orientation bucket.
    fn act(
        &mut self,
        obs: ArrayView4<'_, f32>,
        rec_states: ArrayView2<'_, f32>,
        masks: ArrayView1<'_, f32>,
        extras: ArrayView1<'_, i64>,
        deterministic: bool,
    ) -> Result<PolicyOutput>;

    fn get_value(
        &mut self,
        obs: ArrayView4<'_, f32>,
        rec_states: ArrayView2<'_, f32>,
        masks: ArrayView1<'_, f32>,
        extras: ArrayView1<'_, i64>,
    ) -> Result<Array1<f32>>;
}

/// External optimization step for the global policy.
pub trait GlobalOptimizer {
    fn update(
        &mut self,
        policy: &mut dyn GlobalPolicy,
        rollouts: &RolloutStorage,
    ) -> Result<UpdateMetrics>;
}
