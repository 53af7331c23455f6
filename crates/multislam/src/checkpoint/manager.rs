//! Snapshot manager for best-model and periodic saves.

use super::state::{Checkpointable, ModelKind, SnapshotRecord};
use crate::Result;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Where and how often snapshots are written.
#[derive(Clone, Debug)]
pub struct SnapshotConfig {
    /// Directory for best-model snapshots
    pub log_dir: PathBuf,
    /// Directory for periodic snapshots
    pub dump_dir: PathBuf,
    /// Consider best-model saves every N agent-steps
    pub save_interval: u64,
    /// Write periodic snapshots every N agent-steps
    pub save_periodic: u64,
    /// Keep only the last N periodic snapshots per model (0 = keep all)
    pub keep_last: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("tmp/models"),
            dump_dir: PathBuf::from("tmp/dump"),
            save_interval: 1,
            save_periodic: 500_000,
            keep_last: 0,
        }
    }
}

impl SnapshotConfig {
    /// Best and periodic snapshots both under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            log_dir: root.join("models"),
            dump_dir: root.join("dump"),
            ..Default::default()
        }
    }

    pub fn save_interval(mut self, steps: u64) -> Self {
        self.save_interval = steps;
        self
    }

    pub fn save_periodic(mut self, steps: u64) -> Self {
        self.save_periodic = steps;
        self
    }

    pub fn keep_last(mut self, n: usize) -> Self {
        self.keep_last = n;
        self
    }
}

/// Tracks the best metric per model and writes snapshots.
///
/// ```ignore
/// let mut snapshots = SnapshotManager::new(SnapshotConfig::new("runs/exp1"));
/// if snapshots.is_best_step(step_index, num_agents) {
///     snapshots.consider_best(ModelKind::Global, &policy, mean, len, total)?;
/// }
/// ```
pub struct SnapshotManager {
    config: SnapshotConfig,
    best: HashMap<ModelKind, f64>,
}

impl SnapshotManager {
    pub fn new(config: SnapshotConfig) -> Self {
        for dir in [&config.log_dir, &config.dump_dir] {
            if let Err(e) = fs::create_dir_all(dir) {
                tracing::warn!(dir = %dir.display(), "Failed to create snapshot directory: {}", e);
            }
        }
        let best = ModelKind::ALL
            .iter()
            .map(|&kind| (kind, kind.initial_best()))
            .collect();
        Self { config, best }
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    /// Best metric seen so far for `kind`
    pub fn best(&self, kind: ModelKind) -> f64 {
        self.best
            .get(&kind)
            .copied()
            .unwrap_or_else(|| kind.initial_best())
    }

    /// Whether the step that just ran crossed a multiple of `every`.
    ///
    /// `step_index` counts vectorized steps from zero; each one advances
    /// `num_agents` agent-steps.
    pub fn crosses(step_index: u64, num_agents: u64, every: u64) -> bool {
        every > 0 && (step_index * num_agents) % every < num_agents
    }

    pub fn is_best_step(&self, step_index: u64, num_agents: u64) -> bool {
        Self::crosses(step_index, num_agents, self.config.save_interval)
    }

    pub fn is_periodic_step(&self, step_index: u64, num_agents: u64) -> bool {
        Self::crosses(step_index, num_agents, self.config.save_periodic)
    }

    pub fn best_path(&self, kind: ModelKind) -> PathBuf {
        self.config
            .log_dir
            .join(format!("model_best.{}", kind.extension()))
    }

    /// Save `model` as the best of its kind if the window has enough samples
    /// and its mean improves on the best so far.
    ///
    /// Returns the snapshot path when a save happened.
    pub fn consider_best<M: Checkpointable + ?Sized>(
        &mut self,
        kind: ModelKind,
        model: &M,
        window_mean: Option<f64>,
        window_len: usize,
        step: u64,
    ) -> Result<Option<PathBuf>> {
        let Some(mean) = window_mean else {
            return Ok(None);
        };
        if window_len < kind.min_samples() || !mean.is_finite() {
            return Ok(None);
        }
        if !kind.improves(mean, self.best(kind)) {
            return Ok(None);
        }

        let path = self.best_path(kind);
        fs::write(&path, model.save_state()?)?;
        let record = SnapshotRecord {
            kind,
            step,
            metric: mean,
            version: crate::VERSION.to_string(),
        };
        fs::write(
            path.with_extension(format!("{}.json", kind.extension())),
            serde_json::to_vec_pretty(&record)?,
        )?;
        self.best.insert(kind, mean);
        tracing::info!(path = %path.display(), metric = mean, "Current weights are the best so far");
        Ok(Some(path))
    }

    /// Write a periodic snapshot named after the agent-step count.
    pub fn save_periodic<M: Checkpointable + ?Sized>(
        &self,
        kind: ModelKind,
        model: &M,
        step: u64,
    ) -> Result<PathBuf> {
        let path = self
            .config
            .dump_dir
            .join(format!("periodic_{}.{}", step, kind.extension()));
        fs::write(&path, model.save_state()?)?;
        tracing::debug!(path = %path.display(), "Saved periodic snapshot");

        if self.config.keep_last > 0 {
            self.cleanup_periodic(kind)?;
        }
        Ok(path)
    }

    /// Restore `model` from a snapshot file.
    pub fn load_from_path<M: Checkpointable + ?Sized>(
        model: &mut M,
        path: impl AsRef<Path>,
    ) -> Result<()> {
        let data = fs::read(path.as_ref())?;
        model.load_state(&data)?;
        tracing::info!(path = %path.as_ref().display(), "Loaded snapshot");
        Ok(())
    }

    /// Periodic snapshots of `kind`, oldest first.
    pub fn list_periodic(&self, kind: ModelKind) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.config.dump_dir) {
            Ok(e) => e,
            Err(_) => return Ok(Vec::new()),
        };

        let mut snapshots: Vec<(u64, PathBuf)> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(kind.extension()))
            .filter_map(|p| periodic_step(&p).map(|step| (step, p)))
            .collect();

        snapshots.sort();
        Ok(snapshots.into_iter().map(|(_, p)| p).collect())
    }

    fn cleanup_periodic(&self, kind: ModelKind) -> Result<()> {
        let snapshots = self.list_periodic(kind)?;
        let excess = snapshots.len().saturating_sub(self.config.keep_last);
        for old in &snapshots[..excess] {
            if let Err(e) = fs::remove_file(old) {
                tracing::warn!(path = %old.display(), "Failed to remove old snapshot: {}", e);
            } else {
                tracing::debug!(path = %old.display(), "Removed old snapshot");
            }
        }
        Ok(())
    }
}

/// Step count encoded in a `periodic_<step>.<ext>` file name.
fn periodic_step(path: &Path) -> Option<u64> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.strip_prefix("periodic_"))
        .and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct MockModel {
        data: Vec<u8>,
    }

    impl Checkpointable for MockModel {
        fn save_state(&self) -> Result<Vec<u8>> {
            Ok(self.data.clone())
        }

        fn load_state(&mut self, data: &[u8]) -> Result<()> {
            self.data = data.to_vec();
            Ok(())
        }
    }

    fn manager(root: &Path) -> SnapshotManager {
        SnapshotManager::new(SnapshotConfig::new(root).save_periodic(10))
    }

    #[test]
    fn test_config_builder() {
        let config = SnapshotConfig::new("./runs")
            .save_interval(5)
            .save_periodic(50)
            .keep_last(3);
        assert_eq!(config.log_dir, PathBuf::from("./runs/models"));
        assert_eq!(config.dump_dir, PathBuf::from("./runs/dump"));
        assert_eq!(config.save_interval, 5);
        assert_eq!(config.save_periodic, 50);
        assert_eq!(config.keep_last, 3);
    }

    #[test]
    fn test_crosses_interval() {
        // 2 agents: step indices 0, 5, 10 reach multiples of 10 agent-steps
        let hits: Vec<u64> = (0..12)
            .filter(|&i| SnapshotManager::crosses(i, 2, 10))
            .collect();
        assert_eq!(hits, vec![0, 5, 10]);
        assert!(!SnapshotManager::crosses(3, 2, 0));
    }

    #[test]
    fn test_best_requires_enough_samples() {
        let dir = tempdir().unwrap();
        let mut snapshots = manager(dir.path());
        let model = MockModel { data: vec![1] };

        let saved = snapshots
            .consider_best(ModelKind::Global, &model, Some(5.0), 99, 10)
            .unwrap();
        assert!(saved.is_none());
        assert!(!snapshots.best_path(ModelKind::Global).exists());

        let saved = snapshots
            .consider_best(ModelKind::Global, &model, Some(5.0), 100, 10)
            .unwrap();
        assert!(saved.is_some());
        assert_eq!(snapshots.best(ModelKind::Global), 5.0);
    }

    #[test]
    fn test_best_tracks_direction_per_model() {
        let dir = tempdir().unwrap();
        let mut snapshots = manager(dir.path());
        let model = MockModel { data: vec![4, 2] };

        assert!(snapshots
            .consider_best(ModelKind::Perception, &model, Some(0.3), 1000, 1)
            .unwrap()
            .is_some());
        assert!(snapshots
            .consider_best(ModelKind::Perception, &model, Some(0.3), 1000, 2)
            .unwrap()
            .is_none());
        assert!(snapshots
            .consider_best(ModelKind::Perception, &model, Some(0.2), 1000, 3)
            .unwrap()
            .is_some());

        assert!(snapshots
            .consider_best(ModelKind::Local, &model, Some(1.0), 100, 1)
            .unwrap()
            .is_some());
        assert!(snapshots
            .consider_best(ModelKind::Local, &model, Some(1.0), 100, 2)
            .unwrap()
            .is_some());
        assert!(snapshots
            .consider_best(ModelKind::Local, &model, Some(1.1), 100, 3)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_best_writes_metadata() {
        let dir = tempdir().unwrap();
        let mut snapshots = manager(dir.path());
        let model = MockModel { data: vec![9] };
        let path = snapshots
            .consider_best(ModelKind::Local, &model, Some(0.25), 150, 42)
            .unwrap()
            .unwrap();

        assert_eq!(fs::read(&path).unwrap(), vec![9]);
        let meta = fs::read(dir.path().join("models/model_best.local.json")).unwrap();
        let record: SnapshotRecord = serde_json::from_slice(&meta).unwrap();
        assert_eq!(record.kind, ModelKind::Local);
        assert_eq!(record.step, 42);
        assert_eq!(record.metric, 0.25);
    }

    #[test]
    fn test_periodic_save_and_load() {
        let dir = tempdir().unwrap();
        let snapshots = manager(dir.path());
        let model = MockModel {
            data: vec![1, 2, 3],
        };

        let path = snapshots
            .save_periodic(ModelKind::Perception, &model, 20)
            .unwrap();
        assert!(path.ends_with("periodic_20.slam"));

        let mut restored = MockModel { data: vec![] };
        SnapshotManager::load_from_path(&mut restored, &path).unwrap();
        assert_eq!(restored.data, vec![1, 2, 3]);
    }

    #[test]
    fn test_periodic_rotation() {
        let dir = tempdir().unwrap();
        let snapshots = SnapshotManager::new(SnapshotConfig::new(dir.path()).keep_last(2));
        let model = MockModel { data: vec![0] };

        for step in [10, 20, 30, 100] {
            snapshots.save_periodic(ModelKind::Local, &model, step).unwrap();
        }
        snapshots.save_periodic(ModelKind::Global, &model, 10).unwrap();

        let local = snapshots.list_periodic(ModelKind::Local).unwrap();
        assert_eq!(local.len(), 2);
        assert!(local[0].ends_with("periodic_30.local"));
        assert!(local[1].ends_with("periodic_100.local"));
        assert_eq!(snapshots.list_periodic(ModelKind::Global).unwrap().len(), 1);
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let dir = tempdir().unwrap();
        let mut model = MockModel { data: vec![] };
        let err = SnapshotManager::load_from_path(&mut model, dir.path().join("nope.local"))
            .unwrap_err();
        assert!(matches!(err, crate::SlamError::Io(_)));
    }
}
