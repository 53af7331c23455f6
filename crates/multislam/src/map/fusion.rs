//! Multi-agent map fusion.

use super::{compute_window, MapChannel, MapState};
use crate::{Result, SlamError};
use ndarray::{Array2, Axis, Zip};

impl MapState {
    /// Merge every agent's local map into the shared map and recenter the windows.
    ///
    /// 1. Scatter each local map into its agent's shared slice at the current window.
    /// 2. Recover full-frame poses from local poses and origins.
    /// 3. Max-reduce the synchronized channels across agents.
    /// 4. Recompute windows and origins, then re-crop the local maps.
    ///
    /// Called once per global step. An agent whose full-frame position falls
    /// outside the map is a caller error and aborts the fusion before any
    /// window is moved.
    pub fn recenter_and_fuse(&mut self) -> Result<()> {
        let geometry = *self.geometry();
        let (full_w, full_h) = geometry.full_size();

        for slot in &mut self.slots {
            slot.scatter();
            slot.full_pose = slot.local_pose.to_full(slot.origin);
        }

        let mut cells = Vec::with_capacity(self.slots.len());
        for (agent, slot) in self.slots.iter().enumerate() {
            let (row, col) = geometry.cell_of(slot.full_pose);
            if row < 0 || col < 0 || row >= full_w as i64 || col >= full_h as i64 {
                return Err(SlamError::OutOfBounds {
                    agent,
                    row,
                    col,
                    width: full_w,
                    height: full_h,
                });
            }
            cells.push((row as usize, col as usize));
        }

        self.synchronize();

        let local = geometry.local_size();
        for (slot, cell) in self.slots.iter_mut().zip(cells) {
            slot.window = compute_window(cell, local, (full_w, full_h), geometry.downscale);
            slot.origin = geometry.origin_of(&slot.window);
            slot.crop();
            slot.local_pose = slot.full_pose.to_local(slot.origin);
        }

        tracing::trace!(agents = self.slots.len(), "Fused local maps");
        Ok(())
    }

    /// Replace the synchronized channels of every slice with the max across agents.
    ///
    /// The all-agents channel is the union of every agent's current location.
    pub(super) fn synchronize(&mut self) {
        let pairs = [
            (MapChannel::Obstacle, MapChannel::Obstacle),
            (MapChannel::Explored, MapChannel::Explored),
            (MapChannel::CurrentLocation, MapChannel::AllAgents),
        ];

        for (source, target) in pairs {
            let mut merged: Option<Array2<f32>> = None;
            for slot in &self.slots {
                let view = slot.shared.index_axis(Axis(0), source.index());
                match merged.as_mut() {
                    None => merged = Some(view.to_owned()),
                    Some(acc) => Zip::from(acc).and(&view).for_each(|a, &v| *a = a.max(v)),
                }
            }
            if let Some(merged) = merged {
                for slot in &mut self.slots {
                    slot.shared
                        .index_axis_mut(Axis(0), target.index())
                        .assign(&merged);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::map::{MapChannel, MapGeometry, MapState, Pose};
    use crate::SlamError;
    use ndarray::{s, Array3};

    fn state(map_size_cm: usize, downscale: usize, agents: usize) -> MapState {
        let mut map =
            MapState::new(MapGeometry::new(map_size_cm, 5, downscale).unwrap(), agents).unwrap();
        map.reset();
        map
    }

    fn local_maps(map: &MapState) -> (Array3<f32>, Array3<f32>) {
        let (lw, lh) = map.geometry().local_size();
        let n = map.num_agents();
        (Array3::zeros((n, lw, lh)), Array3::zeros((n, lw, lh)))
    }

    #[test]
    fn test_fusion_shares_obstacles_and_exploration() {
        let mut map = state(100, 1, 2);
        let (mut obstacle, mut explored) = local_maps(&map);
        obstacle[[0, 1, 1]] = 1.0;
        explored[[1, 3, 4]] = 1.0;
        let poses: Vec<Pose> = map.agents().map(|a| a.local_pose()).collect();
        map.update_local(&obstacle, &explored, &poses).unwrap();

        map.recenter_and_fuse().unwrap();

        assert!(map.synchronized_channels_agree());
        for slot in map.agents() {
            assert_eq!(slot.shared_map()[[MapChannel::Obstacle.index(), 1, 1]], 1.0);
            assert_eq!(slot.shared_map()[[MapChannel::Explored.index(), 3, 4]], 1.0);
            assert_eq!(slot.local_map()[[MapChannel::Explored.index(), 3, 4]], 1.0);
        }
    }

    #[test]
    fn test_private_channels_stay_private() {
        let mut map = state(100, 1, 2);
        let (obstacle, explored) = local_maps(&map);
        let poses = vec![Pose::new(0.1, 0.1, 0.0), Pose::new(0.8, 0.8, 0.0)];
        map.update_local(&obstacle, &explored, &poses).unwrap();
        map.mark_positions();
        map.recenter_and_fuse().unwrap();

        let current = MapChannel::CurrentLocation.index();
        let all = MapChannel::AllAgents.index();
        let a = map.agent(0).shared_map();
        let b = map.agent(1).shared_map();
        // agent 0 sits at cell (2, 2), agent 1 at (16, 16)
        assert_eq!(a[[current, 2, 2]], 1.0);
        assert_eq!(a[[current, 16, 16]], 0.0);
        assert_eq!(b[[current, 16, 16]], 1.0);
        assert_eq!(b[[current, 2, 2]], 0.0);
        // both see both in the all-agents channel
        assert_eq!(a[[all, 2, 2]], 1.0);
        assert_eq!(a[[all, 16, 16]], 1.0);
        assert_eq!(a.slice(s![all, .., ..]), b.slice(s![all, .., ..]));
    }

    #[test]
    fn test_recenter_moves_window_and_keeps_full_pose() {
        // 40 x 40 cells, 20 x 20 local windows
        let mut map = state(200, 2, 1);
        assert_eq!(map.agent(0).window().as_array(), [10, 30, 10, 30]);
        let (obstacle, explored) = local_maps(&map);

        // local (0.125, 0.125) + origin (0.5, 0.5) == full cell (12, 12)
        map.update_local(&obstacle, &explored, &[Pose::new(0.125, 0.125, 45.0)])
            .unwrap();
        map.recenter_and_fuse().unwrap();
        let slot = map.agent(0);
        assert_eq!(slot.window().as_array(), [2, 22, 2, 22]);
        assert!((slot.full_pose().x - 0.625).abs() < 1e-5);
        assert!((slot.full_pose().y - 0.625).abs() < 1e-5);
        assert_eq!(slot.full_pose().heading, 45.0);
        assert!((slot.local_pose().x - 0.525).abs() < 1e-5);

        // full cell (2, 2): the centred window would start at -8, so it is shifted flush
        map.update_local(&obstacle, &explored, &[Pose::new(0.025, 0.025, 45.0)])
            .unwrap();
        map.recenter_and_fuse().unwrap();
        let slot = map.agent(0);
        assert_eq!(slot.window().as_array(), [0, 20, 0, 20]);
        assert_eq!(slot.origin(), Pose::new(0.0, 0.0, 0.0));
        assert!((slot.local_pose().x - 0.125).abs() < 1e-5);
    }

    #[test]
    fn test_scatter_preserves_discoveries_outside_new_window() {
        let mut map = state(200, 2, 1);
        let (obstacle, mut explored) = local_maps(&map);
        // explored local cell (0, 0) is full cell (10, 10)
        explored[[0, 0, 0]] = 1.0;
        map.update_local(&obstacle, &explored, &[Pose::new(0.925, 0.925, 0.0)])
            .unwrap();
        map.recenter_and_fuse().unwrap();

        let slot = map.agent(0);
        assert_eq!(slot.window().as_array(), [18, 38, 18, 38]);
        assert_eq!(slot.shared_map()[[MapChannel::Explored.index(), 10, 10]], 1.0);
    }

    #[test]
    fn test_out_of_bounds_position_is_fatal() {
        let mut map = state(100, 1, 2);
        let (obstacle, explored) = local_maps(&map);
        let poses = vec![Pose::new(0.5, 0.5, 0.0), Pose::new(-0.2, 0.5, 0.0)];
        map.update_local(&obstacle, &explored, &poses).unwrap();
        let err = map.recenter_and_fuse().unwrap_err();
        assert!(matches!(err, SlamError::OutOfBounds { agent: 1, .. }));
    }

    #[test]
    fn test_synchronized_after_every_fusion() {
        let mut map = state(200, 2, 3);
        let (lw, lh) = map.geometry().local_size();
        for round in 0..5 {
            let mut obstacle = Array3::zeros((3, lw, lh));
            let mut explored = Array3::zeros((3, lw, lh));
            for agent in 0..3 {
                obstacle[[agent, (agent * 3 + round) % lw, round % lh]] = 1.0;
                explored[[agent, round % lw, (agent + round) % lh]] = 1.0;
            }
            let poses: Vec<Pose> = (0..3)
                .map(|a| Pose::new(0.2 + 0.1 * a as f32, 0.3 + 0.05 * round as f32, 0.0))
                .collect();
            map.update_local(&obstacle, &explored, &poses).unwrap();
            map.mark_positions();
            map.recenter_and_fuse().unwrap();
            assert!(map.synchronized_channels_agree(), "round {round}");
        }
    }
}
