//! Per-agent map and pose arena.

use super::{compute_window, MapGeometry, Pose, Window};
use crate::{ensure_shape, Result, SlamError};
use ndarray::{s, Array1, Array2, Array3, Array4, ArrayView2, ArrayView3, Axis};
use serde::{Deserialize, Serialize};

/// Channels of the shared map. Local maps carry the first four.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MapChannel {
    Obstacle = 0,
    Explored = 1,
    CurrentLocation = 2,
    PastTrajectory = 3,
    AllAgents = 4,
}

impl MapChannel {
    pub const ALL: [MapChannel; 5] = [
        MapChannel::Obstacle,
        MapChannel::Explored,
        MapChannel::CurrentLocation,
        MapChannel::PastTrajectory,
        MapChannel::AllAgents,
    ];

    /// Number of channels in the shared map
    pub const SHARED: usize = 5;
    /// Number of channels in a local map
    pub const LOCAL: usize = 4;

    pub fn index(self) -> usize {
        self as usize
    }

    /// Synchronized channels are identical across agents after every fusion.
    pub fn is_synchronized(self) -> bool {
        matches!(
            self,
            MapChannel::Obstacle | MapChannel::Explored | MapChannel::AllAgents
        )
    }
}

/// One agent's view: its slice of the shared map, its local crop and poses.
#[derive(Clone, Debug)]
pub struct AgentSlot {
    pub(super) shared: Array3<f32>,
    pub(super) local: Array3<f32>,
    pub(super) full_pose: Pose,
    pub(super) local_pose: Pose,
    pub(super) origin: Pose,
    pub(super) window: Window,
}

impl AgentSlot {
    fn new(full: (usize, usize), local: (usize, usize)) -> Self {
        Self {
            shared: Array3::zeros((MapChannel::SHARED, full.0, full.1)),
            local: Array3::zeros((MapChannel::LOCAL, local.0, local.1)),
            full_pose: Pose::default(),
            local_pose: Pose::default(),
            origin: Pose::default(),
            window: Window::default(),
        }
    }

    /// Shared-map slice (5 x full_w x full_h), read-only
    pub fn shared_map(&self) -> ArrayView3<'_, f32> {
        self.shared.view()
    }

    /// Local map (4 x local_w x local_h)
    pub fn local_map(&self) -> ArrayView3<'_, f32> {
        self.local.view()
    }

    pub fn full_pose(&self) -> Pose {
        self.full_pose
    }

    pub fn local_pose(&self) -> Pose {
        self.local_pose
    }

    pub fn origin(&self) -> Pose {
        self.origin
    }

    pub fn window(&self) -> Window {
        self.window
    }

    /// Re-crop the local map from the shared slice at the current window.
    pub(super) fn crop(&mut self) {
        let w = self.window;
        let crop = self
            .shared
            .slice(s![..MapChannel::LOCAL, w.x1..w.x2, w.y1..w.y2]);
        self.local.assign(&crop);
    }

    /// Write the local map back into the shared slice at the current window.
    pub(super) fn scatter(&mut self) {
        let w = self.window;
        self.shared
            .slice_mut(s![..MapChannel::LOCAL, w.x1..w.x2, w.y1..w.y2])
            .assign(&self.local);
    }
}

/// Pose input handed to the planner: full-frame pose and the agent's window.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlannerPose {
    pub pose: Pose,
    pub window: Window,
}

/// Global policy observation for every agent.
#[derive(Clone, Debug)]
pub struct GlobalInput {
    /// `[agents, 9, local_w, local_h]`: 4 local channels then 5 pooled shared channels
    pub maps: Array4<f32>,
    /// Heading bucket per agent
    pub orientation: Array1<i64>,
}

impl GlobalInput {
    pub const CHANNELS: usize = MapChannel::LOCAL + MapChannel::SHARED;
}

/// Owns the shared map, local maps and poses of an agent group.
#[derive(Clone, Debug)]
pub struct MapState {
    geometry: MapGeometry,
    pub(super) slots: Vec<AgentSlot>,
}

impl MapState {
    pub fn new(geometry: MapGeometry, num_agents: usize) -> Result<Self> {
        geometry.validate()?;
        if num_agents == 0 {
            return Err(SlamError::InvalidConfig("at least one agent is required".into()));
        }
        let full = geometry.full_size();
        let local = geometry.local_size();
        Ok(Self {
            geometry,
            slots: (0..num_agents).map(|_| AgentSlot::new(full, local)).collect(),
        })
    }

    pub fn geometry(&self) -> &MapGeometry {
        &self.geometry
    }

    pub fn num_agents(&self) -> usize {
        self.slots.len()
    }

    pub fn agent(&self, agent: usize) -> &AgentSlot {
        &self.slots[agent]
    }

    pub fn agents(&self) -> impl Iterator<Item = &AgentSlot> {
        self.slots.iter()
    }

    /// Zero every map and place all agents at the centre of the full map.
    pub fn reset(&mut self) {
        let geometry = self.geometry;
        let full = geometry.full_size();
        let local = geometry.local_size();
        let center = geometry.center_pose();
        let cell = geometry.cell_of(center);

        for slot in &mut self.slots {
            slot.shared.fill(0.0);
            slot.local.fill(0.0);
            slot.full_pose = center;
            mark_square(
                &mut slot.shared,
                MapChannel::CurrentLocation.index()..MapChannel::SHARED,
                cell,
                1,
            );
            slot.window = compute_window(
                (cell.0 as usize, cell.1 as usize),
                local,
                full,
                geometry.downscale,
            );
            slot.origin = geometry.origin_of(&slot.window);
        }

        self.synchronize();

        for slot in &mut self.slots {
            slot.crop();
            slot.local_pose = slot.full_pose.to_local(slot.origin);
        }
        tracing::debug!(agents = self.slots.len(), "Map state reset");
    }

    /// Accept the perception model's updated obstacle/explored channels and local poses.
    ///
    /// The shared map is not touched until the next fusion.
    pub fn update_local(
        &mut self,
        obstacle: &Array3<f32>,
        explored: &Array3<f32>,
        local_poses: &[Pose],
    ) -> Result<()> {
        let (lw, lh) = self.geometry.local_size();
        let expected = [self.slots.len(), lw, lh];
        ensure_shape("perception obstacle map", &expected, obstacle.shape())?;
        ensure_shape("perception explored map", &expected, explored.shape())?;
        if local_poses.len() != self.slots.len() {
            return Err(SlamError::contract(
                "perception",
                format!(
                    "returned {} poses for {} agents",
                    local_poses.len(),
                    self.slots.len()
                ),
            ));
        }
        if let Some(bad) = local_poses.iter().position(|p| !p.is_finite()) {
            return Err(SlamError::contract(
                "perception",
                format!("non-finite pose for agent {bad}"),
            ));
        }

        for (e, slot) in self.slots.iter_mut().enumerate() {
            slot.local
                .index_axis_mut(Axis(0), MapChannel::Obstacle.index())
                .assign(&obstacle.index_axis(Axis(0), e));
            slot.local
                .index_axis_mut(Axis(0), MapChannel::Explored.index())
                .assign(&explored.index_axis(Axis(0), e));
            slot.local_pose = local_poses[e];
        }
        Ok(())
    }

    /// Refresh the location channels of each local map from its local pose.
    pub fn mark_positions(&mut self) {
        let geometry = self.geometry;
        for slot in &mut self.slots {
            slot.local
                .index_axis_mut(Axis(0), MapChannel::CurrentLocation.index())
                .fill(0.0);
            let cell = geometry.cell_of(slot.local_pose);
            mark_square(
                &mut slot.local,
                MapChannel::CurrentLocation.index()..MapChannel::LOCAL,
                cell,
                2,
            );
        }
    }

    /// Mark a 3x3 neighbourhood around each local pose after the first
    /// perception pass of an episode. The current-location channel is kept.
    pub fn mark_initial_positions(&mut self) {
        let geometry = self.geometry;
        for slot in &mut self.slots {
            let cell = geometry.cell_of(slot.local_pose);
            mark_square(
                &mut slot.local,
                MapChannel::CurrentLocation.index()..MapChannel::LOCAL,
                cell,
                1,
            );
        }
    }

    /// One local channel for every agent, `[agents, local_w, local_h]`.
    pub fn local_channel(&self, channel: MapChannel) -> Array3<f32> {
        let (lw, lh) = self.geometry.local_size();
        let mut out = Array3::zeros((self.slots.len(), lw, lh));
        if channel.index() < MapChannel::LOCAL {
            for (e, slot) in self.slots.iter().enumerate() {
                out.index_axis_mut(Axis(0), e)
                    .assign(&slot.local.index_axis(Axis(0), channel.index()));
            }
        }
        out
    }

    pub fn local_poses(&self) -> Vec<Pose> {
        self.slots.iter().map(|slot| slot.local_pose).collect()
    }

    /// Write an agent-private channel of the shared map.
    ///
    /// Synchronized channels are only ever written by fusion.
    pub fn write_shared(
        &mut self,
        agent: usize,
        channel: MapChannel,
        values: ArrayView2<'_, f32>,
    ) -> Result<()> {
        if channel.is_synchronized() {
            return Err(SlamError::SynchronizedWrite(channel));
        }
        let (w, h) = self.geometry.full_size();
        ensure_shape("shared map write", &[w, h], values.shape())?;
        let slot = self.slots.get_mut(agent).ok_or_else(|| {
            SlamError::contract("map state", format!("no agent slot {agent}"))
        })?;
        slot.shared
            .index_axis_mut(Axis(0), channel.index())
            .assign(&values);
        Ok(())
    }

    /// Full-frame pose plus window for the planner.
    pub fn planner_pose(&self, agent: usize) -> PlannerPose {
        let slot = &self.slots[agent];
        PlannerPose {
            pose: slot.local_pose.to_full(slot.origin),
            window: slot.window,
        }
    }

    /// Build the global policy observation.
    pub fn global_input(&self) -> GlobalInput {
        let (lw, lh) = self.geometry.local_size();
        let n = self.slots.len();
        let pool = self.geometry.downscale.max(1);
        let mut maps = Array4::zeros((n, GlobalInput::CHANNELS, lw, lh));
        let mut orientation = Array1::zeros(n);

        for (e, slot) in self.slots.iter().enumerate() {
            maps.slice_mut(s![e, ..MapChannel::LOCAL, .., ..])
                .assign(&slot.local);
            for c in 0..MapChannel::SHARED {
                let pooled = max_pool(slot.shared.index_axis(Axis(0), c), pool, (lw, lh));
                maps.slice_mut(s![e, MapChannel::LOCAL + c, .., ..])
                    .assign(&pooled);
            }
            orientation[e] = slot.local_pose.orientation_bucket();
        }

        GlobalInput { maps, orientation }
    }

    /// Whether every synchronized channel agrees across agents.
    pub fn synchronized_channels_agree(&self) -> bool {
        let Some(first) = self.slots.first() else {
            return true;
        };
        MapChannel::ALL
            .iter()
            .filter(|c| c.is_synchronized())
            .all(|c| {
                let reference = first.shared.index_axis(Axis(0), c.index());
                self.slots[1..]
                    .iter()
                    .all(|slot| slot.shared.index_axis(Axis(0), c.index()) == reference)
            })
    }
}

/// Set a `(2 * radius + 1)` square around `center` to 1 on `channels`, clipped to the map.
fn mark_square(map: &mut Array3<f32>, channels: std::ops::Range<usize>, center: (i64, i64), radius: i64) {
    let rows = map.shape()[1] as i64;
    let cols = map.shape()[2] as i64;
    let r0 = (center.0 - radius).clamp(0, rows);
    let r1 = (center.0 + radius + 1).clamp(0, rows);
    let c0 = (center.1 - radius).clamp(0, cols);
    let c1 = (center.1 + radius + 1).clamp(0, cols);
    if r0 >= r1 || c0 >= c1 {
        return;
    }
    map.slice_mut(s![
        channels,
        r0 as usize..r1 as usize,
        c0 as usize..c1 as usize
    ])
    .fill(1.0);
}

/// Non-overlapping max pooling with window `k`, truncated to `out`.
fn max_pool(input: ArrayView2<'_, f32>, k: usize, out: (usize, usize)) -> Array2<f32> {
    if k == 1 {
        return input.slice(s![..out.0, ..out.1]).to_owned();
    }
    Array2::from_shape_fn(out, |(i, j)| {
        input
            .slice(s![i * k..(i + 1) * k, j * k..(j + 1) * k])
            .fold(f32::NEG_INFINITY, |acc, &v| acc.max(v))
    })
}
