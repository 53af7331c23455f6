//! Shared occupancy-grid world explored by several agents at once.

use multislam::env::{ExplorationVecEnv, PlannerRequest, ShortTermGoal, StepInfo, VecStep};
use multislam::map::{MapGeometry, Pose};
use multislam::training::TrainerConfig;
use multislam::{Result, SlamError};
use ndarray::{Array1, Array2, Array4};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Bernoulli, Distribution, Normal};
use std::collections::VecDeque;

/// Move one cell along the current heading
pub const FORWARD: usize = 0;
/// Rotate 90 degrees counter-clockwise
pub const TURN_LEFT: usize = 1;
/// Rotate 90 degrees clockwise
pub const TURN_RIGHT: usize = 2;

/// Observation channels: obstacles, visible cells, other agents
pub const OBS_CHANNELS: usize = 3;

/// Tolerance when recovering a cell index from a pose in metres
const CELL_EPS: f32 = 1e-3;

#[derive(Clone, Debug, PartialEq)]
pub struct GridWorldConfig {
    pub num_agents: usize,
    pub map_size_cm: usize,
    pub resolution_cm: usize,
    /// Side of the square egocentric view in cells, odd
    pub view_size: usize,
    /// Probability that a cell away from the start is an obstacle
    pub obstacle_density: f64,
    /// Steps after which every agent reports done
    pub max_steps: usize,
    /// Standard deviation of the odometry noise in metres
    pub pose_noise_std: f32,
    pub seed: u64,
}

impl Default for GridWorldConfig {
    fn default() -> Self {
        Self {
            num_agents: 2,
            map_size_cm: 2400,
            resolution_cm: 5,
            view_size: 9,
            obstacle_density: 0.1,
            max_steps: 1000,
            pose_noise_std: 0.0,
            seed: 0,
        }
    }
}

impl GridWorldConfig {
    /// World matching a trainer's map geometry and episode length
    pub fn for_trainer(config: &TrainerConfig) -> Self {
        Self {
            num_agents: config.num_agents,
            map_size_cm: config.map_size_cm,
            resolution_cm: config.map_resolution,
            max_steps: config.max_episode_length,
            seed: config.seed,
            ..Self::default()
        }
    }

    pub fn with_view_size(mut self, view_size: usize) -> Self {
        self.view_size = view_size;
        self
    }

    pub fn with_obstacle_density(mut self, density: f64) -> Self {
        self.obstacle_density = density;
        self
    }

    pub fn with_pose_noise(mut self, std: f32) -> Self {
        self.pose_noise_std = std;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct AgentState {
    row: usize,
    col: usize,
    /// Degrees, one of -90, 0, 90, 180
    heading: i32,
}

/// Vectorized grid world with a breadth-first short-term planner.
///
/// Heading 0 faces increasing columns (`+x`), heading 90 increasing rows (`+y`).
/// Every episode regenerates the obstacles from the seeded RNG and starts all
/// agents at the centre cell.
pub struct GridWorld {
    config: GridWorldConfig,
    geometry: MapGeometry,
    /// `true` where a cell is blocked
    obstacles: Array2<bool>,
    explorable: Array2<f32>,
    explorable_total: f32,
    agents: Vec<AgentState>,
    /// Ground-truth explored area per agent
    explored: Vec<Array2<f32>>,
    tick: usize,
    rng: ChaCha8Rng,
    noise: Option<Normal<f32>>,
}

impl GridWorld {
    pub fn new(config: GridWorldConfig) -> Result<Self> {
        let geometry = MapGeometry::new(config.map_size_cm, config.resolution_cm, 1)?;
        if config.num_agents == 0 {
            return Err(SlamError::InvalidConfig("grid world needs an agent".into()));
        }
        if config.view_size % 2 == 0 {
            return Err(SlamError::InvalidConfig(format!(
                "view size must be odd, got {}",
                config.view_size
            )));
        }
        if !(0.0..1.0).contains(&config.obstacle_density) {
            return Err(SlamError::InvalidConfig(format!(
                "obstacle density must lie in [0, 1), got {}",
                config.obstacle_density
            )));
        }
        let noise = if config.pose_noise_std > 0.0 {
            let normal = Normal::new(0.0, config.pose_noise_std)
                .map_err(|e| SlamError::InvalidConfig(format!("pose noise: {e}")))?;
            Some(normal)
        } else {
            None
        };

        let shape = geometry.full_size();
        Ok(Self {
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            obstacles: Array2::from_elem(shape, false),
            explorable: Array2::zeros(shape),
            explorable_total: 0.0,
            agents: Vec::new(),
            explored: Vec::new(),
            tick: 0,
            noise,
            geometry,
            config,
        })
    }

    pub fn geometry(&self) -> &MapGeometry {
        &self.geometry
    }

    /// Cell and heading of every agent
    pub fn agent_cells(&self) -> Vec<(usize, usize, i32)> {
        self.agents
            .iter()
            .map(|a| (a.row, a.col, a.heading))
            .collect()
    }

    pub fn is_obstacle(&self, row: usize, col: usize) -> bool {
        self.obstacles.get((row, col)).copied().unwrap_or(true)
    }

    fn start_cell(&self) -> (usize, usize) {
        let (row, col) = self.geometry.cell_of(self.geometry.center_pose());
        (row.max(0) as usize, col.max(0) as usize)
    }

    fn generate(&mut self) -> Result<()> {
        let blocked = Bernoulli::new(self.config.obstacle_density)
            .map_err(|e| SlamError::InvalidConfig(format!("obstacle density: {e}")))?;
        let (start_row, start_col) = self.start_cell();
        let clearance = self.config.view_size / 2;
        for ((row, col), cell) in self.obstacles.indexed_iter_mut() {
            let near_start =
                row.abs_diff(start_row) <= clearance && col.abs_diff(start_col) <= clearance;
            *cell = !near_start && blocked.sample(&mut self.rng);
        }
        self.explorable = self.obstacles.mapv(|b| if b { 0.0 } else { 1.0 });
        self.explorable_total = self.explorable.sum();
        Ok(())
    }

    /// Visible square around an agent as `(view_i, view_j, row, col)` for in-bounds cells
    fn view_cells(&self, agent: &AgentState) -> Vec<(usize, usize, usize, usize)> {
        let (rows, cols) = self.obstacles.dim();
        let radius = (self.config.view_size / 2) as i64;
        let mut cells = Vec::with_capacity(self.config.view_size * self.config.view_size);
        for i in 0..self.config.view_size as i64 {
            for j in 0..self.config.view_size as i64 {
                let row = agent.row as i64 + i - radius;
                let col = agent.col as i64 + j - radius;
                if row >= 0 && col >= 0 && row < rows as i64 && col < cols as i64 {
                    cells.push((i as usize, j as usize, row as usize, col as usize));
                }
            }
        }
        cells
    }

    /// Mark each agent's view as explored and return the newly explored explorable cells
    fn reveal(&mut self) -> Vec<f32> {
        let mut fresh = vec![0.0; self.agents.len()];
        for e in 0..self.agents.len() {
            for (_, _, row, col) in self.view_cells(&self.agents[e]) {
                let cell = &mut self.explored[e][[row, col]];
                if *cell == 0.0 {
                    *cell = 1.0;
                    fresh[e] += self.explorable[[row, col]];
                }
            }
        }
        fresh
    }

    fn observe(&self) -> Array4<f32> {
        let v = self.config.view_size;
        let mut obs = Array4::zeros((self.agents.len(), OBS_CHANNELS, v, v));
        for (e, agent) in self.agents.iter().enumerate() {
            for (i, j, row, col) in self.view_cells(agent) {
                obs[[e, 0, i, j]] = if self.obstacles[[row, col]] { 1.0 } else { 0.0 };
                obs[[e, 1, i, j]] = 1.0;
                let occupied = self
                    .agents
                    .iter()
                    .enumerate()
                    .any(|(other, a)| other != e && a.row == row && a.col == col);
                if occupied {
                    obs[[e, 2, i, j]] = 1.0;
                }
            }
        }
        obs
    }

    fn infos(
        &self,
        obs: &Array4<f32>,
        deltas: &[Pose],
        errors: &[Pose],
        fresh: &[f32],
    ) -> Vec<StepInfo> {
        let area = self.geometry.cell_metres().powi(2);
        (0..self.agents.len())
            .map(|e| StepInfo {
                sensor_pose: deltas[e],
                explored_map: self.explored[e].clone(),
                explorable_map: self.explorable.clone(),
                exp_reward: fresh[e] * area,
                exp_ratio: if self.explorable_total > 0.0 {
                    fresh[e] / self.explorable_total
                } else {
                    0.0
                },
                fp_proj: obs.slice(ndarray::s![e, 0, .., ..]).to_owned(),
                fp_explored: obs.slice(ndarray::s![e, 1, .., ..]).to_owned(),
                pose_err: errors[e],
            })
            .collect()
    }

    fn advance(&mut self, agent: usize, action: usize) -> Pose {
        let state = self.agents[agent];
        let mut next = state;
        match action {
            FORWARD => {
                let (dr, dc) = heading_step(state.heading);
                let row = state.row as i64 + dr;
                let col = state.col as i64 + dc;
                if row >= 0 && col >= 0 && !self.is_obstacle(row as usize, col as usize) {
                    next.row = row as usize;
                    next.col = col as usize;
                }
            }
            TURN_LEFT => next.heading = normalize_heading(state.heading + 90),
            _ => next.heading = normalize_heading(state.heading - 90),
        }
        self.agents[agent] = next;

        let m = self.geometry.cell_metres();
        Pose::new(
            (next.col as f32 - state.col as f32) * m,
            (next.row as f32 - state.row as f32) * m,
            normalize_heading(next.heading - state.heading) as f32,
        )
    }

    /// Odometry as reported: the true delta plus noise, and the noise itself
    fn noisy(&mut self, delta: Pose) -> (Pose, Pose) {
        let Some(noise) = self.noise else {
            return (delta, Pose::default());
        };
        let error = Pose::new(noise.sample(&mut self.rng), noise.sample(&mut self.rng), 0.0);
        (delta + error, error)
    }
}

impl ExplorationVecEnv for GridWorld {
    fn num_envs(&self) -> usize {
        self.config.num_agents
    }

    fn obs_shape(&self) -> (usize, usize, usize) {
        (OBS_CHANNELS, self.config.view_size, self.config.view_size)
    }

    fn num_actions(&self) -> usize {
        3
    }

    fn reset(&mut self) -> Result<(Array4<f32>, Vec<StepInfo>)> {
        self.generate()?;
        let (row, col) = self.start_cell();
        let n = self.config.num_agents;
        self.agents = vec![AgentState { row, col, heading: 0 }; n];
        self.explored = vec![Array2::zeros(self.obstacles.dim()); n];
        self.tick = 0;

        let fresh = self.reveal();
        let obs = self.observe();
        let still = vec![Pose::default(); n];
        let infos = self.infos(&obs, &still, &still, &fresh);
        tracing::debug!(explorable = self.explorable_total, "Grid world reset");
        Ok((obs, infos))
    }

    fn step(&mut self, actions: &[usize]) -> Result<VecStep> {
        let n = self.config.num_agents;
        if actions.len() != n {
            return Err(rejected(format!(
                "got {} actions for {} agents",
                actions.len(),
                n
            )));
        }
        if let Some(bad) = actions.iter().find(|&&a| a >= self.num_actions()) {
            return Err(rejected(format!("unknown action {bad}")));
        }

        let mut deltas = Vec::with_capacity(n);
        let mut errors = Vec::with_capacity(n);
        for (e, &action) in actions.iter().enumerate() {
            let delta = self.advance(e, action);
            let (reported, error) = self.noisy(delta);
            deltas.push(reported);
            errors.push(error);
        }
        self.tick += 1;

        let fresh = self.reveal();
        let obs = self.observe();
        let infos = self.infos(&obs, &deltas, &errors, &fresh);
        let rewards: Array1<f32> = infos.iter().map(|info| info.exp_reward).collect();
        let done = self.tick >= self.config.max_steps;
        Ok(VecStep {
            obs,
            rewards,
            dones: vec![done; n],
            infos,
        })
    }

    fn get_short_term_goal(&mut self, requests: &[PlannerRequest]) -> Result<Vec<ShortTermGoal>> {
        let m = self.geometry.cell_metres();
        Ok(requests.iter().map(|request| plan(request, m)).collect())
    }
}

/// Breadth-first plan over the predicted obstacle map towards the goal.
///
/// When the goal is unreachable the agent heads for the reachable cell
/// closest to it. The relative goal is `[path length in cells, relative
/// heading in degrees]`.
pub fn plan(request: &PlannerRequest, cell_metres: f32) -> ShortTermGoal {
    let window = request.pose.window;
    let pose = request.pose.pose;
    let (rows, cols) = request.map_pred.dim();
    let full_row = cell_index(pose.y, cell_metres);
    let full_col = cell_index(pose.x, cell_metres);
    let start = (
        (full_row - window.x1 as i64).clamp(0, rows as i64 - 1) as usize,
        (full_col - window.y1 as i64).clamp(0, cols as i64 - 1) as usize,
    );
    let goal = (
        request.goal.0.min(rows.saturating_sub(1)),
        request.goal.1.min(cols.saturating_sub(1)),
    );

    let mut parent: Array2<Option<(usize, usize)>> = Array2::from_elem((rows, cols), None);
    let mut seen = Array2::from_elem((rows, cols), false);
    let mut queue = VecDeque::from([start]);
    seen[start] = true;
    let mut best = start;
    let distance = |cell: (usize, usize)| cell.0.abs_diff(goal.0) + cell.1.abs_diff(goal.1);

    while let Some(cell) = queue.pop_front() {
        if distance(cell) < distance(best) {
            best = cell;
        }
        if cell == goal {
            break;
        }
        for heading in [0, 90, 180, -90] {
            let (dr, dc) = heading_step(heading);
            let row = cell.0 as i64 + dr;
            let col = cell.1 as i64 + dc;
            if row < 0 || col < 0 || row >= rows as i64 || col >= cols as i64 {
                continue;
            }
            let next = (row as usize, col as usize);
            if seen[next] || request.map_pred[next] >= 0.5 {
                continue;
            }
            seen[next] = true;
            parent[next] = Some(cell);
            queue.push_back(next);
        }
    }

    let mut path_len = 0i64;
    let mut first = best;
    let mut cursor = best;
    while let Some(prev) = parent[cursor] {
        path_len += 1;
        first = cursor;
        cursor = prev;
    }

    if path_len == 0 {
        return ShortTermGoal {
            relative_goal: [0, 0],
            expert_action: TURN_LEFT,
        };
    }
    let direction = match (
        first.0 as i64 - start.0 as i64,
        first.1 as i64 - start.1 as i64,
    ) {
        (0, 1) => 0,
        (1, 0) => 90,
        (0, -1) => 180,
        _ => -90,
    };
    let heading = (pose.heading / 90.0).round() as i32 * 90;
    let relative = normalize_heading(direction - heading);
    ShortTermGoal {
        relative_goal: [path_len, relative as i64],
        expert_action: action_towards(relative),
    }
}

/// Action that turns towards, or moves along, a relative heading
pub fn action_towards(relative: i32) -> usize {
    match relative {
        0 => FORWARD,
        r if r > 0 => TURN_LEFT,
        _ => TURN_RIGHT,
    }
}

fn heading_step(heading: i32) -> (i64, i64) {
    match normalize_heading(heading) {
        0 => (0, 1),
        90 => (1, 0),
        180 => (0, -1),
        _ => (-1, 0),
    }
}

/// Wrap a heading in degrees into `(-180, 180]`
fn normalize_heading(degrees: i32) -> i32 {
    let wrapped = degrees.rem_euclid(360);
    if wrapped > 180 {
        wrapped - 360
    } else {
        wrapped
    }
}

fn rejected(detail: String) -> SlamError {
    SlamError::ContractViolation {
        component: "grid world",
        detail,
    }
}

/// Cell index of a coordinate in metres
pub fn cell_index(metres: f32, cell_metres: f32) -> i64 {
    (metres / cell_metres + CELL_EPS).floor() as i64
}
