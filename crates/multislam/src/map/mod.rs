//! Shared map, local windows and pose bookkeeping.
//!
//! Provides:
//! - `compute_window` - fixed-size crop bounds clamped to the full map
//! - `MapState` - per-agent arena of shared-map slices, local maps and poses
//! - Fusion of local updates into the shared map (`MapState::recenter_and_fuse`)

mod fusion;
mod pose;
mod state;
mod window;

pub use pose::{MapGeometry, Pose};
pub use state::{AgentSlot, GlobalInput, MapChannel, MapState, PlannerPose};
pub use window::{compute_window, Window};
