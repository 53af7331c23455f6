//! Evaluation report of explored area over time.

use crate::Result;
use ndarray::{Array2, Array3, ArrayView1, Axis};
use std::fmt::Write as _;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Per-agent and team-wide exploration series, one column per global step.
#[derive(Clone, Debug)]
pub struct EvalReport {
    /// Running sum of each agent's area reward, `[agents, episodes, steps]`
    pub explored_area: Array3<f32>,
    /// Running sum of each agent's environment explored ratio, `[agents, episodes, steps]`
    pub explored_ratio: Array3<f32>,
    /// Team explored area, `[episodes, steps]`
    pub cumulative_area: Array2<f32>,
    /// Team explored ratio, `[episodes, steps]`
    pub cumulative_ratio: Array2<f32>,
}

impl EvalReport {
    pub fn new(num_agents: usize, num_episodes: usize, steps_per_episode: usize) -> Self {
        Self {
            explored_area: Array3::zeros((num_agents, num_episodes, steps_per_episode)),
            explored_ratio: Array3::zeros((num_agents, num_episodes, steps_per_episode)),
            cumulative_area: Array2::zeros((num_episodes, steps_per_episode)),
            cumulative_ratio: Array2::zeros((num_episodes, steps_per_episode)),
        }
    }

    pub fn steps_per_episode(&self) -> usize {
        self.cumulative_area.len_of(Axis(1))
    }

    /// Record one global step. Steps outside the report's extent are ignored.
    ///
    /// The first step of an episode accumulates onto zero.
    pub fn record(
        &mut self,
        episode: usize,
        step: usize,
        area_rewards: ArrayView1<'_, f32>,
        exp_ratios: ArrayView1<'_, f32>,
        cumulative_area: f32,
        cumulative_ratio: f32,
    ) {
        let (agents, episodes, steps) = self.explored_area.dim();
        if episode >= episodes || step >= steps {
            return;
        }
        for e in 0..agents.min(area_rewards.len()).min(exp_ratios.len()) {
            let (prev_area, prev_ratio) = if step == 0 {
                (0.0, 0.0)
            } else {
                (
                    self.explored_area[[e, episode, step - 1]],
                    self.explored_ratio[[e, episode, step - 1]],
                )
            };
            self.explored_area[[e, episode, step]] = prev_area + area_rewards[e];
            self.explored_ratio[[e, episode, step]] = prev_ratio + exp_ratios[e];
        }
        self.cumulative_area[[episode, step]] = cumulative_area;
        self.cumulative_ratio[[episode, step]] = cumulative_ratio;
    }

    /// Write `explored_area.txt` and `explored_ratio.txt` into `dir`.
    ///
    /// Each file holds one line per agent and episode, then one line per
    /// episode of the team-wide series. Values are space separated.
    pub fn write(&self, dir: impl AsRef<Path>) -> Result<(PathBuf, PathBuf)> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let area = dir.join("explored_area.txt");
        let ratio = dir.join("explored_ratio.txt");
        write_series(&area, &self.explored_area, &self.cumulative_area)?;
        write_series(&ratio, &self.explored_ratio, &self.cumulative_ratio)?;
        tracing::info!(dir = %dir.display(), "Wrote evaluation report");
        Ok((area, ratio))
    }

    /// Per-step means over agents and episodes, formatted for the console.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let sections = [
            ("Final Exp Area", step_means(self.explored_area.view().into_dyn())),
            ("Final Exp Ratio", step_means(self.explored_ratio.view().into_dyn())),
            (
                "Final Cumulative Exp Area",
                step_means(self.cumulative_area.view().into_dyn()),
            ),
            (
                "Final Cumulative Exp Ratio",
                step_means(self.cumulative_ratio.view().into_dyn()),
            ),
        ];
        for (title, means) in sections {
            let _ = writeln!(out, "{title}:");
            let line = means
                .iter()
                .map(|m| format!("{m:.5}"))
                .collect::<Vec<_>>()
                .join(", ");
            let _ = writeln!(out, "{line}");
        }
        out
    }
}

fn write_series(path: &Path, per_agent: &Array3<f32>, team: &Array2<f32>) -> Result<()> {
    let mut file = std::io::BufWriter::new(fs::File::create(path)?);
    for agent in per_agent.axis_iter(Axis(0)) {
        for row in agent.axis_iter(Axis(0)) {
            writeln!(file, "{}", join_row(row))?;
        }
    }
    for row in team.axis_iter(Axis(0)) {
        writeln!(file, "{}", join_row(row))?;
    }
    file.flush()?;
    Ok(())
}

fn join_row(row: ArrayView1<'_, f32>) -> String {
    row.iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Mean over every axis but the last.
fn step_means(series: ndarray::ArrayViewD<'_, f32>) -> Vec<f32> {
    let last = series.ndim() - 1;
    let steps = series.len_of(Axis(last));
    (0..steps)
        .map(|i| {
            let column = series.index_axis(Axis(last), i);
            if column.is_empty() {
                0.0
            } else {
                column.sum() / column.len() as f32
            }
        })
        .collect()
}
