//! Snapshot trait and metadata.

use crate::Result;
use serde::{Deserialize, Serialize};

/// Components whose state can be written to and restored from bytes.
///
/// The byte format is owned by the implementor.
///
/// ```ignore
/// impl Checkpointable for MyPolicy {
///     fn save_state(&self) -> Result<Vec<u8>> {
///         Ok(serde_json::to_vec(&self.weights)?)
///     }
///
///     fn load_state(&mut self, data: &[u8]) -> Result<()> {
///         self.weights = serde_json::from_slice(data)?;
///         Ok(())
///     }
/// }
/// ```
pub trait Checkpointable {
    fn save_state(&self) -> Result<Vec<u8>>;

    fn load_state(&mut self, data: &[u8]) -> Result<()>;
}

/// The three trained models of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Perception,
    Local,
    Global,
}

impl ModelKind {
    pub const ALL: [ModelKind; 3] = [ModelKind::Perception, ModelKind::Local, ModelKind::Global];

    /// File extension of this model's snapshots
    pub fn extension(self) -> &'static str {
        match self {
            ModelKind::Perception => "slam",
            ModelKind::Local => "local",
            ModelKind::Global => "multi_global",
        }
    }

    /// Samples the tracked window needs before a best-model save is considered
    pub fn min_samples(self) -> usize {
        match self {
            ModelKind::Perception => 1000,
            ModelKind::Local | ModelKind::Global => 100,
        }
    }

    /// Starting value of the best metric
    pub(crate) fn initial_best(self) -> f64 {
        match self {
            ModelKind::Perception => 100_000.0,
            ModelKind::Local => f64::INFINITY,
            ModelKind::Global => f64::NEG_INFINITY,
        }
    }

    /// Perception cost must strictly drop, local loss may tie, global reward may tie.
    pub(crate) fn improves(self, candidate: f64, best: f64) -> bool {
        match self {
            ModelKind::Perception => candidate < best,
            ModelKind::Local => candidate <= best,
            ModelKind::Global => candidate >= best,
        }
    }
}

/// Metadata stored beside a best-model snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub kind: ModelKind,
    /// Environment steps summed over agents
    pub step: u64,
    /// Window mean that made this snapshot the best
    pub metric: f64,
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_improvement_rules() {
        assert!(ModelKind::Perception.improves(0.4, 0.5));
        assert!(!ModelKind::Perception.improves(0.5, 0.5));
        assert!(ModelKind::Local.improves(0.5, 0.5));
        assert!(!ModelKind::Local.improves(0.6, 0.5));
        assert!(ModelKind::Global.improves(3.0, 3.0));
        assert!(!ModelKind::Global.improves(2.0, 3.0));
    }

    #[test]
    fn test_initial_best_accepts_first_metric() {
        assert!(ModelKind::Perception.improves(1e4, ModelKind::Perception.initial_best()));
        assert!(ModelKind::Local.improves(1e9, ModelKind::Local.initial_best()));
        assert!(ModelKind::Global.improves(-1e9, ModelKind::Global.initial_best()));
    }

    #[test]
    fn test_record_serializes_kind_as_snake_case() {
        let record = SnapshotRecord {
            kind: ModelKind::Global,
            step: 10,
            metric: 1.5,
            version: "0.1.0".into(),
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"kind\":\"global\""));
        let back: SnapshotRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
