//! Incremental-discovery rewards.
//!
//! A cell earns novelty credit for an agent only when that agent explored it
//! this step, no other agent explored it in the same step, and it was not
//! explored earlier in the episode. Every currently explored cell also earns a
//! small shaping term.

use crate::{ensure_shape, Result};
use ndarray::{Array1, Array2, Array3, ArrayView2, Axis, Zip};

/// Credit for a newly discovered cell
pub const NOVELTY_WEIGHT: f32 = 10.0;
/// Credit for any cell explored this step
pub const SHAPING_WEIGHT: f32 = 0.01;
/// Scale from summed cell credit to reward
pub const REWARD_SCALE: f32 = 0.0005;
/// Converts evaluation rewards into square metres of explored area
pub const EVAL_AREA_SCALE: f32 = 50.0;

/// Per-agent reward for this step's explored masks.
///
/// `current` is `[agents, H, W]`, `previous` is `[H, W]`.
///
/// "Explored by others" is computed as the batch sum minus the agent's own
/// mask, so a cell that two agents discover in the same step is novel for
/// neither of them.
pub fn calc_rewards(current: &Array3<f32>, previous: &Array2<f32>) -> Array1<f32> {
    let total = current.sum_axis(Axis(0));
    let mut rewards = Array1::zeros(current.len_of(Axis(0)));

    for (agent, mask) in current.axis_iter(Axis(0)).enumerate() {
        let mut score = 0.0f32;
        Zip::from(&mask)
            .and(&total)
            .and(previous)
            .for_each(|&own, &sum, &prev| {
                let others = if sum - own > 0.5 { 1.0 } else { 0.0 };
                let novel = if own - others - prev > 0.0 { 1.0 } else { 0.0 };
                score += novel * NOVELTY_WEIGHT + own * SHAPING_WEIGHT;
            });
        rewards[agent] = score * REWARD_SCALE;
    }
    rewards
}

/// Fraction of the explorable area covered by `explored`. Zero when nothing is explorable.
pub fn explored_ratio(explored: ArrayView2<'_, f32>, explorable: ArrayView2<'_, f32>) -> f32 {
    let total = explorable.sum();
    if total <= 0.0 {
        return 0.0;
    }
    cumulative_area(explored, explorable) / total
}

/// Number of explorable cells covered by `explored`
pub fn cumulative_area(explored: ArrayView2<'_, f32>, explorable: ArrayView2<'_, f32>) -> f32 {
    Zip::from(&explored)
        .and(&explorable)
        .fold(0.0, |acc, &e, &m| acc + e * m)
}

/// Owns the episode's previously-explored area and scores each global step.
#[derive(Clone, Debug)]
pub struct ExplorationTracker {
    previously_explored: Array2<f32>,
}

impl ExplorationTracker {
    pub fn new(shape: (usize, usize)) -> Self {
        Self {
            previously_explored: Array2::zeros(shape),
        }
    }

    /// Clear the accumulator at an episode boundary, adopting the environment's map shape.
    pub fn reset(&mut self, shape: (usize, usize)) {
        if self.previously_explored.dim() == shape {
            self.previously_explored.fill(0.0);
        } else {
            self.previously_explored = Array2::zeros(shape);
        }
    }

    pub fn previously_explored(&self) -> &Array2<f32> {
        &self.previously_explored
    }

    /// Reward each agent for its explored mask, then fold the masks into the accumulator.
    ///
    /// `explored` is `[agents, H, W]`; it is restricted to `explorable` before scoring.
    pub fn score(&mut self, explored: &Array3<f32>, explorable: &Array2<f32>) -> Result<Array1<f32>> {
        let (h, w) = self.previously_explored.dim();
        ensure_shape("explorable map", &[h, w], explorable.shape())?;
        ensure_shape(
            "explored maps",
            &[explored.len_of(Axis(0)), h, w],
            explored.shape(),
        )?;

        let masked = explored * &explorable.view().insert_axis(Axis(0));
        let rewards = calc_rewards(&masked, &self.previously_explored);

        for mask in masked.axis_iter(Axis(0)) {
            Zip::from(&mut self.previously_explored)
                .and(&mask)
                .for_each(|p, &m| *p = p.max(m));
        }
        Ok(rewards)
    }

    /// Explorable cells covered so far this episode
    pub fn cumulative_area(&self, explorable: &Array2<f32>) -> f32 {
        cumulative_area(self.previously_explored.view(), explorable.view())
    }

    /// Fraction of the explorable area covered so far this episode
    pub fn explored_ratio(&self, explorable: &Array2<f32>) -> f32 {
        explored_ratio(self.previously_explored.view(), explorable.view())
    }
}
