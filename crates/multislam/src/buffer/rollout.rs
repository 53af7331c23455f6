//! Rollout storage for the global policy.

use crate::{ensure_shape, Result, SlamError};
use ndarray::{s, Array1, Array2, Array3, Array4, Array5, ArrayView1, ArrayView2, ArrayView4, Axis, Zip};
use rand::seq::SliceRandom;
use rand::Rng;

/// One global step's worth of data for every agent.
#[derive(Clone, Copy, Debug)]
pub struct Transition<'a> {
    /// Observation reached after the step, `[agents, C, W, H]`
    pub obs: ArrayView4<'a, f32>,
    /// Recurrent state after the step, `[agents, R]`
    pub rec_states: ArrayView2<'a, f32>,
    /// Action taken, `[agents, A]`
    pub actions: ArrayView2<'a, f32>,
    pub log_probs: ArrayView1<'a, f32>,
    pub values: ArrayView1<'a, f32>,
    pub rewards: ArrayView1<'a, f32>,
    /// Continuation mask observed since the previous insert
    pub masks: ArrayView1<'a, f32>,
    /// Orientation bucket per agent
    pub extras: ArrayView1<'a, i64>,
}

/// Fixed-horizon circular buffer.
///
/// Holds `T + 1` observation, recurrent-state, mask, extras, value and return
/// slots and `T` action, log-probability and reward slots. Slot `t + 1` holds
/// the state reached by the action in slot `t`; `masks[t + 1] == 0` means that
/// transition ended an episode.
#[derive(Clone, Debug)]
pub struct RolloutStorage {
    pub obs: Array5<f32>,
    pub rec_states: Array3<f32>,
    pub actions: Array3<f32>,
    pub action_log_probs: Array2<f32>,
    pub value_preds: Array2<f32>,
    pub returns: Array2<f32>,
    pub rewards: Array2<f32>,
    pub masks: Array2<f32>,
    pub extras: Array2<i64>,
    num_steps: usize,
    num_agents: usize,
    step: usize,
}

impl RolloutStorage {
    /// Create storage for `num_steps` global steps of `num_agents` agents.
    ///
    /// Both counts must be positive.
    pub fn new(
        num_steps: usize,
        num_agents: usize,
        obs_shape: (usize, usize, usize),
        action_dim: usize,
        rec_state_size: usize,
    ) -> Result<Self> {
        if num_steps == 0 || num_agents == 0 {
            return Err(SlamError::InvalidConfig(format!(
                "rollout storage needs positive steps and agents, got {num_steps} x {num_agents}"
            )));
        }
        let (c, w, h) = obs_shape;
        Ok(Self {
            obs: Array5::zeros((num_steps + 1, num_agents, c, w, h)),
            rec_states: Array3::zeros((num_steps + 1, num_agents, rec_state_size)),
            actions: Array3::zeros((num_steps, num_agents, action_dim)),
            action_log_probs: Array2::zeros((num_steps, num_agents)),
            value_preds: Array2::zeros((num_steps + 1, num_agents)),
            returns: Array2::zeros((num_steps + 1, num_agents)),
            rewards: Array2::zeros((num_steps, num_agents)),
            masks: Array2::ones((num_steps + 1, num_agents)),
            extras: Array2::zeros((num_steps + 1, num_agents)),
            num_steps,
            num_agents,
            step: 0,
        })
    }

    pub fn num_steps(&self) -> usize {
        self.num_steps
    }

    pub fn num_agents(&self) -> usize {
        self.num_agents
    }

    /// Slot the next insert writes its action into
    pub fn step(&self) -> usize {
        self.step
    }

    /// Overwrite the slot the next action is taken from, used at episode start.
    pub fn set_current_obs(
        &mut self,
        obs: ArrayView4<'_, f32>,
        extras: ArrayView1<'_, i64>,
    ) -> Result<()> {
        ensure_shape("rollout observation", &self.obs.shape()[1..], obs.shape())?;
        ensure_shape("rollout extras", &[self.num_agents], extras.shape())?;
        let step = self.step;
        self.obs.index_axis_mut(Axis(0), step).assign(&obs);
        self.extras.index_axis_mut(Axis(0), step).assign(&extras);
        Ok(())
    }

    /// Write a transition at the current pointer and advance it modulo `T`.
    ///
    /// Non-finite rewards or values are rejected with `SlamError::NonFinite`
    /// and leave the storage untouched.
    pub fn insert(&mut self, t: Transition<'_>) -> Result<()> {
        let n = self.num_agents;
        ensure_shape("rollout observation", &self.obs.shape()[1..], t.obs.shape())?;
        ensure_shape(
            "rollout recurrent state",
            &self.rec_states.shape()[1..],
            t.rec_states.shape(),
        )?;
        ensure_shape("rollout actions", &self.actions.shape()[1..], t.actions.shape())?;
        for (context, len) in [
            ("rollout log probs", t.log_probs.len()),
            ("rollout values", t.values.len()),
            ("rollout rewards", t.rewards.len()),
            ("rollout masks", t.masks.len()),
            ("rollout extras", t.extras.len()),
        ] {
            ensure_shape(context, &[n], &[len])?;
        }
        if !t.rewards.iter().all(|r| r.is_finite()) {
            return Err(SlamError::NonFinite("global reward"));
        }
        if !t.values.iter().all(|v| v.is_finite()) {
            return Err(SlamError::NonFinite("value estimate"));
        }

        let step = self.step;
        self.obs.slice_mut(s![step + 1, .., .., .., ..]).assign(&t.obs);
        self.rec_states
            .slice_mut(s![step + 1, .., ..])
            .assign(&t.rec_states);
        self.actions.slice_mut(s![step, .., ..]).assign(&t.actions);
        self.action_log_probs
            .slice_mut(s![step, ..])
            .assign(&t.log_probs);
        self.value_preds.slice_mut(s![step, ..]).assign(&t.values);
        self.rewards.slice_mut(s![step, ..]).assign(&t.rewards);
        self.masks.slice_mut(s![step + 1, ..]).assign(&t.masks);
        self.extras.slice_mut(s![step + 1, ..]).assign(&t.extras);

        self.step = (self.step + 1) % self.num_steps;
        Ok(())
    }

    /// Rotate the final slot into slot 0 for the next collection epoch.
    pub fn after_update(&mut self) {
        let last = self.num_steps;
        let obs = self.obs.index_axis(Axis(0), last).to_owned();
        self.obs.index_axis_mut(Axis(0), 0).assign(&obs);
        let rec = self.rec_states.index_axis(Axis(0), last).to_owned();
        self.rec_states.index_axis_mut(Axis(0), 0).assign(&rec);
        let masks = self.masks.index_axis(Axis(0), last).to_owned();
        self.masks.index_axis_mut(Axis(0), 0).assign(&masks);
        let extras = self.extras.index_axis(Axis(0), last).to_owned();
        self.extras.index_axis_mut(Axis(0), 0).assign(&extras);
    }

    /// Fill `returns` by walking the buffer backwards from a bootstrap value.
    ///
    /// A zero mask at `t + 1` stops any value or advantage from `t + 1`
    /// onwards flowing into step `t`.
    pub fn compute_returns(
        &mut self,
        next_value: ArrayView1<'_, f32>,
        use_gae: bool,
        gamma: f32,
        tau: f32,
    ) -> Result<()> {
        ensure_shape("bootstrap value", &[self.num_agents], next_value.shape())?;
        if !next_value.iter().all(|v| v.is_finite()) {
            return Err(SlamError::NonFinite("bootstrap value"));
        }

        let last = self.num_steps;
        if use_gae {
            self.value_preds.row_mut(last).assign(&next_value);
            let mut gae = Array1::<f32>::zeros(self.num_agents);
            for step in (0..last).rev() {
                let reward = self.rewards.row(step);
                let value = self.value_preds.row(step);
                let next = self.value_preds.row(step + 1);
                let mask = self.masks.row(step + 1);
                let mut ret = self.returns.row_mut(step);
                Zip::from(&mut gae)
                    .and(&mut ret)
                    .and(&reward)
                    .and(&value)
                    .and(&next)
                    .and(&mask)
                    .for_each(|g, out, &r, &v, &nv, &m| {
                        let delta = r + gamma * nv * m - v;
                        *g = delta + gamma * tau * m * *g;
                        *out = *g + v;
                    });
            }
        } else {
            self.returns.row_mut(last).assign(&next_value);
            for step in (0..last).rev() {
                let next = self.returns.row(step + 1).to_owned();
                let reward = self.rewards.row(step);
                let mask = self.masks.row(step + 1);
                let mut ret = self.returns.row_mut(step);
                Zip::from(&mut ret)
                    .and(&next)
                    .and(&reward)
                    .and(&mask)
                    .for_each(|out, &nr, &r, &m| *out = nr * gamma * m + r);
            }
        }

        if !self.returns.iter().all(|r| r.is_finite()) {
            return Err(SlamError::NonFinite("returns"));
        }
        Ok(())
    }

    /// `returns - value_preds` over the first `T` slots, `[T, agents]`.
    pub fn advantages(&self) -> Array2<f32> {
        &self.returns.slice(s![..self.num_steps, ..]) - &self.value_preds.slice(s![..self.num_steps, ..])
    }

    /// Shuffle every (step, agent) pair into `num_mini_batch` equally sized minibatches.
    pub fn feed_forward_batches<R: Rng + ?Sized>(
        &self,
        num_mini_batch: usize,
        rng: &mut R,
    ) -> Result<Vec<MiniBatch>> {
        let batch_size = self.num_steps * self.num_agents;
        if num_mini_batch == 0 || batch_size < num_mini_batch {
            return Err(SlamError::InvalidConfig(format!(
                "{} steps x {} agents cannot be split into {} minibatches",
                self.num_steps, self.num_agents, num_mini_batch
            )));
        }
        let mini_batch_size = batch_size / num_mini_batch;

        let mut indices: Vec<usize> = (0..batch_size).collect();
        indices.shuffle(rng);

        let advantages = self.advantages();
        Ok(indices
            .chunks_exact(mini_batch_size)
            .map(|chunk| self.minibatch(chunk, &advantages))
            .collect())
    }

    /// Gather flat `step * agents + agent` indices into a minibatch.
    fn minibatch(&self, indices: &[usize], advantages: &Array2<f32>) -> MiniBatch {
        let (_, _, c, w, h) = self.obs.dim();
        let b = indices.len();
        let mut batch = MiniBatch {
            obs: Array4::zeros((b, c, w, h)),
            rec_states: Array2::zeros((b, self.rec_states.len_of(Axis(2)))),
            actions: Array2::zeros((b, self.actions.len_of(Axis(2)))),
            value_preds: Array1::zeros(b),
            returns: Array1::zeros(b),
            masks: Array1::zeros(b),
            old_log_probs: Array1::zeros(b),
            advantages: Array1::zeros(b),
            extras: Array1::zeros(b),
        };

        for (row, &flat) in indices.iter().enumerate() {
            let (t, e) = (flat / self.num_agents, flat % self.num_agents);
            batch
                .obs
                .index_axis_mut(Axis(0), row)
                .assign(&self.obs.slice(s![t, e, .., .., ..]));
            batch
                .rec_states
                .row_mut(row)
                .assign(&self.rec_states.slice(s![t, e, ..]));
            batch
                .actions
                .row_mut(row)
                .assign(&self.actions.slice(s![t, e, ..]));
            batch.value_preds[row] = self.value_preds[[t, e]];
            batch.returns[row] = self.returns[[t, e]];
            batch.masks[row] = self.masks[[t, e]];
            batch.old_log_probs[row] = self.action_log_probs[[t, e]];
            batch.advantages[row] = advantages[[t, e]];
            batch.extras[row] = self.extras[[t, e]];
        }
        batch
    }
}

/// A minibatch of global-policy experience for an external optimizer
#[derive(Clone, Debug)]
pub struct MiniBatch {
    pub obs: Array4<f32>,
    pub rec_states: Array2<f32>,
    pub actions: Array2<f32>,
    pub value_preds: Array1<f32>,
    pub returns: Array1<f32>,
    pub masks: Array1<f32>,
    pub old_log_probs: Array1<f32>,
    pub advantages: Array1<f32>,
    pub extras: Array1<i64>,
}
