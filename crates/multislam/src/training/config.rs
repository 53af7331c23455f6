//! Trainer configuration.

use crate::checkpoint::SnapshotConfig;
use crate::map::MapGeometry;
use crate::{Result, SlamError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for a training or evaluation run
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    // Run
    /// Random seed for replay sampling and synthetic collaborators
    pub seed: u64,
    /// Agents stepped together in one group
    pub num_agents: usize,
    pub num_episodes: usize,
    /// Local steps per episode
    pub max_episode_length: usize,
    /// Evaluation mode: rewards become square metres and nothing is saved as best
    pub eval: bool,

    // Cadence
    /// Local steps per global step
    pub num_local_steps: usize,
    /// Global steps per rollout horizon
    pub num_global_steps: usize,
    /// Local steps between local policy updates
    pub local_policy_update_freq: usize,

    // Map
    pub map_size_cm: usize,
    pub map_resolution: usize,
    pub global_downscaling: usize,

    // Global returns
    pub use_gae: bool,
    pub gamma: f32,
    pub tau: f32,

    // Perception training
    pub slam_memory_size: usize,
    pub slam_batch_size: usize,
    pub slam_iterations: usize,
    pub proj_loss_coeff: f64,
    pub exp_loss_coeff: f64,
    pub pose_loss_coeff: f64,

    // Switches
    pub train_slam: bool,
    pub train_local: bool,
    pub train_global: bool,
    pub use_deterministic_local: bool,

    // Logging and snapshots
    /// Local steps between console summaries
    pub log_interval: u64,
    /// Capacity of every rolling statistics window
    pub stats_window: usize,
    /// Agent-steps between best-model checks
    pub save_interval: u64,
    /// Agent-steps between periodic snapshots
    pub save_periodic: u64,
    pub dump_location: PathBuf,
    pub exp_name: String,

    // Warm starts
    pub load_slam: Option<PathBuf>,
    pub load_local: Option<PathBuf>,
    pub load_global: Option<PathBuf>,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            seed: 1,
            num_agents: 2,
            num_episodes: 1_000_000,
            max_episode_length: 1000,
            eval: false,

            num_local_steps: 25,
            num_global_steps: 40,
            local_policy_update_freq: 5,

            map_size_cm: 2400,
            map_resolution: 5,
            global_downscaling: 2,

            use_gae: false,
            gamma: 0.99,
            tau: 0.95,

            slam_memory_size: 500_000,
            slam_batch_size: 72,
            slam_iterations: 10,
            proj_loss_coeff: 1.0,
            exp_loss_coeff: 1.0,
            pose_loss_coeff: 10_000.0,

            train_slam: true,
            train_local: true,
            train_global: true,
            use_deterministic_local: false,

            log_interval: 10,
            stats_window: 1000,
            save_interval: 1,
            save_periodic: 500_000,
            dump_location: PathBuf::from("./tmp"),
            exp_name: "exp1".to_string(),

            load_slam: None,
            load_local: None,
            load_global: None,
        }
    }
}

impl TrainerConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Map sizes implied by this configuration
    pub fn geometry(&self) -> Result<MapGeometry> {
        MapGeometry::new(self.map_size_cm, self.map_resolution, self.global_downscaling)
    }

    /// Global steps in one episode
    pub fn global_steps_per_episode(&self) -> usize {
        self.max_episode_length / self.num_local_steps.max(1)
    }

    /// Best-model snapshots go to `<dump>/models/<exp>`, periodic ones to `<dump>/dump/<exp>`.
    pub fn snapshot_config(&self) -> SnapshotConfig {
        SnapshotConfig {
            log_dir: self.dump_location.join("models").join(&self.exp_name),
            dump_dir: self.dump_location.join("dump").join(&self.exp_name),
            save_interval: self.save_interval,
            save_periodic: self.save_periodic,
            keep_last: 0,
        }
    }

    /// Directory the evaluation report is written to
    pub fn dump_dir(&self) -> PathBuf {
        self.dump_location.join("dump").join(&self.exp_name)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("num_agents", self.num_agents),
            ("max_episode_length", self.max_episode_length),
            ("num_local_steps", self.num_local_steps),
            ("num_global_steps", self.num_global_steps),
            ("local_policy_update_freq", self.local_policy_update_freq),
            ("slam_batch_size", self.slam_batch_size),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(SlamError::InvalidConfig(format!("{name} must be positive")));
            }
        }
        if self.log_interval == 0 {
            return Err(SlamError::InvalidConfig("log_interval must be positive".into()));
        }
        for (name, value) in [("gamma", self.gamma), ("tau", self.tau)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(SlamError::InvalidConfig(format!(
                    "{name} must lie in [0, 1], got {value}"
                )));
            }
        }
        for (name, value) in [
            ("proj_loss_coeff", self.proj_loss_coeff),
            ("exp_loss_coeff", self.exp_loss_coeff),
            ("pose_loss_coeff", self.pose_loss_coeff),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(SlamError::InvalidConfig(format!(
                    "{name} must be a non-negative number"
                )));
            }
        }
        self.geometry()?;
        Ok(())
    }

    pub fn with_num_agents(mut self, n: usize) -> Self {
        self.num_agents = n;
        self
    }

    pub fn with_episodes(mut self, episodes: usize, max_episode_length: usize) -> Self {
        self.num_episodes = episodes;
        self.max_episode_length = max_episode_length;
        self
    }

    /// Set local steps per global step and global steps per horizon
    pub fn with_cadence(mut self, num_local_steps: usize, num_global_steps: usize) -> Self {
        self.num_local_steps = num_local_steps;
        self.num_global_steps = num_global_steps;
        self
    }

    pub fn with_map(mut self, map_size_cm: usize, resolution: usize, downscaling: usize) -> Self {
        self.map_size_cm = map_size_cm;
        self.map_resolution = resolution;
        self.global_downscaling = downscaling;
        self
    }

    pub fn with_eval(mut self, eval: bool) -> Self {
        self.eval = eval;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_dump_location(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dump_location = dir.into();
        self
    }

    /// Enable or disable training of the perception, local and global models
    pub fn with_training(mut self, slam: bool, local: bool, global: bool) -> Self {
        self.train_slam = slam;
        self.train_local = local;
        self.train_global = global;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = TrainerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.global_steps_per_episode(), 40);
        let geometry = config.geometry().unwrap();
        assert_eq!(geometry.full_size(), (480, 480));
        assert_eq!(geometry.local_size(), (240, 240));
    }

    #[test]
    fn test_rejects_zero_cadence() {
        let config = TrainerConfig::default().with_cadence(0, 4);
        assert!(matches!(config.validate(), Err(SlamError::InvalidConfig(_))));
        let config = TrainerConfig::default().with_num_agents(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_discount_and_map() {
        let mut config = TrainerConfig::default();
        config.gamma = 1.5;
        assert!(config.validate().is_err());

        let config = TrainerConfig::default().with_map(100, 5, 50);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: TrainerConfig =
            serde_json::from_str(r#"{"num_agents": 3, "eval": true, "load_local": "w.local"}"#)
                .unwrap();
        assert_eq!(config.num_agents, 3);
        assert!(config.eval);
        assert_eq!(config.load_local, Some(PathBuf::from("w.local")));
        assert_eq!(config.num_local_steps, 25);
    }

    #[test]
    fn test_json_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = TrainerConfig::default().with_seed(9).with_cadence(5, 3);
        std::fs::write(&path, serde_json::to_vec(&config).unwrap()).unwrap();
        assert_eq!(TrainerConfig::from_json_file(&path).unwrap(), config);
    }

    #[test]
    fn test_snapshot_dirs() {
        let config = TrainerConfig::default().with_dump_location("/data/run");
        let snapshots = config.snapshot_config();
        assert_eq!(snapshots.log_dir, PathBuf::from("/data/run/models/exp1"));
        assert_eq!(snapshots.dump_dir, PathBuf::from("/data/run/dump/exp1"));
        assert_eq!(config.dump_dir(), snapshots.dump_dir);
    }
}
