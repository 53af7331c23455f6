//! Model snapshots.
//!
//! - `Checkpointable` for collaborators whose weights can be saved and restored
//! - `SnapshotManager` for best-model and periodic snapshots
//! - `SnapshotRecord` metadata written next to every best-model snapshot

mod manager;
mod state;

pub use manager::{SnapshotConfig, SnapshotManager};
pub use state::{Checkpointable, ModelKind, SnapshotRecord};
