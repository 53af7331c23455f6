//! Rolling training statistics.

use crate::log::Metrics;
use crate::utils::RollingWindow;
use ndarray::{Array1, ArrayView1, Zip};

/// Every rolling window the trainer reports and gates snapshots on.
#[derive(Clone, Debug)]
pub struct TrainingStats {
    /// Mean global reward of each global step
    pub per_step_rewards: RollingWindow<f32>,
    /// Total global reward of each finished episode
    pub episode_rewards: RollingWindow<f32>,
    pub local_losses: RollingWindow<f64>,
    pub value_losses: RollingWindow<f64>,
    pub action_losses: RollingWindow<f64>,
    pub dist_entropies: RollingWindow<f64>,
    pub proj_costs: RollingWindow<f64>,
    pub exp_costs: RollingWindow<f64>,
    pub pose_costs: RollingWindow<f64>,
}

impl TrainingStats {
    pub fn new(capacity: usize) -> Self {
        Self {
            per_step_rewards: RollingWindow::new(capacity),
            episode_rewards: RollingWindow::new(capacity),
            local_losses: RollingWindow::new(capacity),
            value_losses: RollingWindow::new(capacity),
            action_losses: RollingWindow::new(capacity),
            dist_entropies: RollingWindow::new(capacity),
            proj_costs: RollingWindow::new(capacity),
            exp_costs: RollingWindow::new(capacity),
            pose_costs: RollingWindow::new(capacity),
        }
    }

    /// Summary metrics for the windows that hold data.
    pub fn metrics(&self) -> Metrics {
        let mut metrics = Metrics::new();
        if let Some(mean) = self.per_step_rewards.mean() {
            metrics.insert("reward/step_mean".into(), mean);
        }
        if let Some(mean) = self.episode_rewards.mean() {
            metrics.insert("reward/episode_mean".into(), mean);
            metrics.insert("reward/episode_median".into(), self.episode_rewards.median().unwrap_or(mean));
            if let (Some(min), Some(max)) = (self.episode_rewards.min(), self.episode_rewards.max()) {
                metrics.insert("reward/episode_min".into(), min as f64);
                metrics.insert("reward/episode_max".into(), max as f64);
            }
        }
        let losses = [
            ("loss/local", &self.local_losses),
            ("loss/value", &self.value_losses),
            ("loss/action", &self.action_losses),
            ("loss/entropy", &self.dist_entropies),
            ("loss/proj", &self.proj_costs),
            ("loss/exp", &self.exp_costs),
            ("loss/pose", &self.pose_costs),
        ];
        for (name, window) in losses {
            if let Some(mean) = window.mean() {
                metrics.insert(name.into(), mean);
            }
        }
        metrics
    }
}

/// Per-agent running global reward across global steps.
///
/// The running sum survives episode boundaries only where the continuation
/// mask is 1; a 0 mask closes the agent's episode and hands out its total.
#[derive(Clone, Debug)]
pub struct EpisodeRewards {
    running: Array1<f32>,
}

impl EpisodeRewards {
    pub fn new(num_agents: usize) -> Self {
        Self {
            running: Array1::zeros(num_agents),
        }
    }

    pub fn running(&self) -> &Array1<f32> {
        &self.running
    }

    /// Add this global step's rewards and return the totals of the episodes that just closed.
    ///
    /// A closed episode with a total of exactly zero is not reported.
    pub fn accumulate(&mut self, rewards: ArrayView1<'_, f32>, masks: ArrayView1<'_, f32>) -> Vec<f32> {
        self.running += &rewards;
        let mut finished = Vec::new();
        Zip::from(&mut self.running)
            .and(&masks)
            .for_each(|running, &mask| {
                let total = *running * (1.0 - mask);
                if total != 0.0 {
                    finished.push(total);
                }
                *running *= mask;
            });
        finished
    }
}
