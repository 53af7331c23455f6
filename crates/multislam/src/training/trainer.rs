//! Two-timescale training orchestrator.

use super::cadence::{ContinuationMask, EpisodeCadence, StepTick};
use super::config::TrainerConfig;
use super::eval::EvalReport;
use super::loss::{binary_cross_entropy, cross_entropy, mse};
use super::stats::{EpisodeRewards, TrainingStats};
use crate::buffer::{FifoMemory, ReplaySample, ReplayTarget, RolloutStorage, Transition};
use crate::checkpoint::{ModelKind, SnapshotManager};
use crate::env::{
    validate_batch, validate_goals, validate_step, ExplorationVecEnv, PlannerRequest,
    ShortTermGoal, StepInfo,
};
use crate::log::{ConsoleLogger, MetricLogger, Metrics};
use crate::map::{GlobalInput, MapChannel, MapState, Pose};
use crate::policy::{
    GlobalOptimizer, GlobalPolicy, LocalAction, LocalPolicy, MapPrior, PerceptionInput,
    PerceptionModel, PolicyOutput,
};
use crate::reward::{ExplorationTracker, EVAL_AREA_SCALE};
use crate::utils::{abbreviate, format_duration, sigmoid};
use crate::{ensure_shape, Result, SlamError};
use ndarray::{Array1, Array2, Array3, Array4, ArrayView4, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::time::Instant;

/// The learned components driven by the trainer.
pub struct Collaborators {
    pub perception: Box<dyn PerceptionModel>,
    pub local_policy: Box<dyn LocalPolicy>,
    pub global_policy: Box<dyn GlobalPolicy>,
    pub optimizer: Box<dyn GlobalOptimizer>,
}

/// Counters and final statistics of a finished run.
#[derive(Clone, Debug, Default)]
pub struct RunSummary {
    pub episodes: usize,
    /// Vectorized local steps taken
    pub steps: u64,
    pub global_updates: usize,
    /// Global steps whose transition was dropped for a non-finite reward or value
    pub skipped_inserts: usize,
    pub perception_updates: usize,
    pub local_updates: usize,
    /// Rolling statistics at the end of the run
    pub metrics: Metrics,
    /// Present in evaluation mode
    pub eval_report: Option<EvalReport>,
}

/// Per-episode loop state
struct EpisodeState {
    episode: usize,
    /// Current observation `[agents, C, H, W]`
    obs: Array4<f32>,
    local_rec_states: Array2<f32>,
    local_masks: Array1<f32>,
    /// Output of the most recent global act, inserted at the next boundary
    global_output: PolicyOutput,
    /// Long-term goal cell per agent
    goals: Vec<(usize, usize)>,
    /// Planner output feeding the next local act
    short_term: Vec<ShortTermGoal>,
}

/// Drives perception, the local and global policies and every buffer over
/// episodes of a vectorized environment.
pub struct Trainer {
    /// Configuration
    config: TrainerConfig,
    /// Shared and local maps
    map: MapState,
    /// Previously explored area of the current episode
    tracker: ExplorationTracker,
    /// Global policy experience
    rollouts: RolloutStorage,
    /// Perception supervision samples
    replay: FifoMemory<ReplaySample>,
    /// Replay sampling
    rng: StdRng,
    snapshots: SnapshotManager,
    logger: Box<dyn MetricLogger>,
    stats: TrainingStats,
    episode_rewards: EpisodeRewards,
    /// Continuation mask of the global step in progress
    global_mask: ContinuationMask,
    /// Terminations of global steps whose transition was not stored
    unstored_mask: ContinuationMask,
    /// Summed imitation loss since the last local update
    pending_local_loss: f64,
    perception: Box<dyn PerceptionModel>,
    local_policy: Box<dyn LocalPolicy>,
    global_policy: Box<dyn GlobalPolicy>,
    optimizer: Box<dyn GlobalOptimizer>,
    /// Vectorized steps since the run started
    step_index: u64,
    summary: RunSummary,
    start_time: Instant,
}

impl Trainer {
    /// Validate the configuration, size every buffer and apply warm starts.
    pub fn new(config: TrainerConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let Collaborators {
            mut perception,
            mut local_policy,
            mut global_policy,
            optimizer,
        } = collaborators;

        let geometry = config.geometry()?;
        let map = MapState::new(geometry, config.num_agents)?;
        let (lw, lh) = geometry.local_size();
        let action_dim = global_policy.action_dim();
        if action_dim < 2 {
            return Err(SlamError::contract(
                "global policy",
                format!("action dimension {action_dim} cannot encode a goal cell"),
            ));
        }
        let rollouts = RolloutStorage::new(
            config.num_global_steps,
            config.num_agents,
            (GlobalInput::CHANNELS, lw, lh),
            action_dim,
            global_policy.rec_state_size(),
        )?;

        if let Some(path) = &config.load_slam {
            SnapshotManager::load_from_path(&mut *perception, path)?;
        }
        if let Some(path) = &config.load_local {
            SnapshotManager::load_from_path(&mut *local_policy, path)?;
        }
        if let Some(path) = &config.load_global {
            SnapshotManager::load_from_path(&mut *global_policy, path)?;
        }

        tracing::info!(
            agents = config.num_agents,
            full = ?geometry.full_size(),
            local = ?geometry.local_size(),
            eval = config.eval,
            "Trainer ready"
        );

        Ok(Self {
            tracker: ExplorationTracker::new(geometry.full_size()),
            replay: FifoMemory::new(config.slam_memory_size),
            rng: StdRng::seed_from_u64(config.seed),
            snapshots: SnapshotManager::new(config.snapshot_config()),
            logger: Box::new(ConsoleLogger::new()),
            stats: TrainingStats::new(config.stats_window),
            episode_rewards: EpisodeRewards::new(config.num_agents),
            global_mask: ContinuationMask::new(config.num_agents),
            unstored_mask: ContinuationMask::new(config.num_agents),
            pending_local_loss: 0.0,
            map,
            rollouts,
            perception,
            local_policy,
            global_policy,
            optimizer,
            step_index: 0,
            summary: RunSummary::default(),
            start_time: Instant::now(),
            config,
        })
    }

    /// Replace the console summary sink
    pub fn with_logger(mut self, logger: Box<dyn MetricLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn map(&self) -> &MapState {
        &self.map
    }

    pub fn rollouts(&self) -> &RolloutStorage {
        &self.rollouts
    }

    pub fn replay(&self) -> &FifoMemory<ReplaySample> {
        &self.replay
    }

    pub fn stats(&self) -> &TrainingStats {
        &self.stats
    }

    pub fn snapshots(&self) -> &SnapshotManager {
        &self.snapshots
    }

    pub fn step_index(&self) -> u64 {
        self.step_index
    }

    /// Run every configured episode.
    ///
    /// In evaluation mode the explored-area report is written to the dump
    /// directory once all episodes are done.
    pub fn run(&mut self, env: &mut dyn ExplorationVecEnv) -> Result<RunSummary> {
        let n = self.config.num_agents;
        if env.num_envs() != n {
            return Err(SlamError::contract(
                "environment",
                format!("steps {} agents, configured for {}", env.num_envs(), n),
            ));
        }

        let mut report = self.config.eval.then(|| {
            EvalReport::new(
                n,
                self.config.num_episodes,
                self.config.global_steps_per_episode(),
            )
        });
        self.start_time = Instant::now();

        for episode in 0..self.config.num_episodes {
            let mut state = self.start_episode(env, episode)?;
            let cadence = EpisodeCadence::new(
                self.config.max_episode_length,
                self.config.num_local_steps,
            );
            for tick in cadence {
                self.local_step(env, &tick, &mut state, report.as_mut())?;
            }
            self.summary.episodes += 1;
            tracing::info!(episode, steps = self.step_index, "Episode finished");
        }

        if let Some(report) = &report {
            report.write(self.config.dump_dir())?;
            tracing::info!("\n{}", report.summary());
        }
        self.logger.close();

        let mut summary = self.summary.clone();
        summary.steps = self.step_index;
        summary.metrics = self.stats.metrics();
        summary.eval_report = report;
        Ok(summary)
    }

    /// Reset the environment and maps, build the first maps and pick the first goals.
    fn start_episode(
        &mut self,
        env: &mut dyn ExplorationVecEnv,
        episode: usize,
    ) -> Result<EpisodeState> {
        let (obs, infos) = env.reset()?;
        validate_batch(env, &obs, &infos)?;
        let shape = infos
            .first()
            .map(|info| info.explorable_map.dim())
            .ok_or_else(|| SlamError::contract("environment", "reset returned no infos"))?;
        self.tracker.reset(shape);
        self.map.reset();

        self.update_maps(obs.view(), obs.view(), &infos)?;
        self.map.mark_initial_positions();

        let input = self.map.global_input();
        self.rollouts
            .set_current_obs(input.maps.view(), input.orientation.view())?;
        let global_output = self.act_from_slot(self.rollouts.step())?;
        let goals = self.goal_cells(&global_output);
        let short_term = self.plan(env, &goals)?;

        let n = self.config.num_agents;
        Ok(EpisodeState {
            episode,
            obs,
            local_rec_states: Array2::zeros((n, self.local_policy.rec_state_size())),
            local_masks: Array1::zeros(n),
            global_output,
            goals,
            short_term,
        })
    }

    fn local_step(
        &mut self,
        env: &mut dyn ExplorationVecEnv,
        tick: &StepTick,
        state: &mut EpisodeState,
        report: Option<&mut EvalReport>,
    ) -> Result<()> {
        let relative_goals = Array2::from_shape_fn((state.short_term.len(), 2), |(e, k)| {
            state.short_term[e].relative_goal[k]
        });
        let action = self.local_policy.act(
            state.obs.view(),
            state.local_rec_states.view(),
            state.local_masks.view(),
            relative_goals.view(),
            self.config.use_deterministic_local,
        )?;
        self.check_local_action(&action, env.num_actions())?;
        if self.config.train_local {
            let targets: Vec<usize> = state.short_term.iter().map(|g| g.expert_action).collect();
            self.pending_local_loss += cross_entropy(action.logits.view(), &targets);
        }
        state.local_rec_states = action.rec_states;

        let step = env.step(&action.actions)?;
        validate_step(env, &step)?;
        state.local_masks = ContinuationMask::from_dones(&step.dones);
        self.global_mask.observe(&state.local_masks);

        let mut last_obs = std::mem::replace(&mut state.obs, step.obs);
        if tick.ends_episode() {
            self.map.reset();
            last_obs = state.obs.clone();
        }

        if self.config.train_slam {
            self.remember(&last_obs, &state.obs, &step.infos);
        }
        self.update_maps(last_obs.view(), state.obs.view(), &step.infos)?;
        self.map.mark_positions();

        let inserted = if tick.closes_global_step() {
            self.close_global_step(tick, state, &step.infos, report)?
        } else {
            false
        };

        state.short_term = self.plan(env, &state.goals)?;

        if self.config.train_slam && self.replay.len() > self.config.slam_batch_size {
            self.train_perception()?;
        }
        if self.config.train_local
            && tick.triggers_local_update(self.config.local_policy_update_freq)
        {
            self.update_local()?;
        }
        if inserted && self.rollouts.step() == 0 {
            self.update_global()?;
        }

        if self.step_index % self.config.log_interval == 0 {
            self.log_progress();
        }
        self.save_snapshots()?;
        self.step_index += 1;
        Ok(())
    }

    /// Fuse, reward, store the transition and pick new long-term goals.
    ///
    /// Returns whether the transition made it into the rollout buffer.
    fn close_global_step(
        &mut self,
        tick: &StepTick,
        state: &mut EpisodeState,
        infos: &[StepInfo],
        report: Option<&mut EvalReport>,
    ) -> Result<bool> {
        self.map.recenter_and_fuse()?;
        let input = self.map.global_input();

        let explorable = &infos[0].explorable_map;
        let (h, w) = explorable.dim();
        let mut explored = Array3::zeros((infos.len(), h, w));
        for (e, info) in infos.iter().enumerate() {
            explored
                .index_axis_mut(Axis(0), e)
                .assign(&info.explored_map);
        }
        let rewards = self.tracker.score(&explored, explorable)?;
        let masks = self.global_mask.consume();
        let finite = rewards.iter().all(|r| r.is_finite());

        // Scaled copy for stats and the report; the buffer keeps raw rewards.
        let reported = if self.config.eval {
            &rewards * EVAL_AREA_SCALE
        } else {
            rewards.clone()
        };

        if finite {
            for total in self.episode_rewards.accumulate(reported.view(), masks.view()) {
                self.stats.episode_rewards.push(total);
            }
            if let Some(mean) = reported.mean() {
                self.stats.per_step_rewards.push(mean);
            }
        } else {
            // Close ended episodes without adding the unusable rewards.
            let zeros = Array1::zeros(masks.len());
            for total in self.episode_rewards.accumulate(zeros.view(), masks.view()) {
                self.stats.episode_rewards.push(total);
            }
        }

        if let (Some(report), true) = (report, finite) {
            let ratios: Array1<f32> = infos.iter().map(|info| info.exp_ratio).collect();
            report.record(
                state.episode,
                tick.global_step,
                reported.view(),
                ratios.view(),
                self.tracker.cumulative_area(explorable),
                self.tracker.explored_ratio(explorable),
            );
        }

        let stored_masks = &masks * self.unstored_mask.values();
        let slot = self.rollouts.step();
        let previous = &state.global_output;
        let inserted = match self.rollouts.insert(Transition {
            obs: input.maps.view(),
            rec_states: previous.rec_states.view(),
            actions: previous.actions.view(),
            log_probs: previous.log_probs.view(),
            values: previous.values.view(),
            rewards: rewards.view(),
            masks: stored_masks.view(),
            extras: input.orientation.view(),
        }) {
            Ok(()) => {
                self.unstored_mask.consume();
                true
            }
            Err(e) if e.is_recoverable() => {
                tracing::warn!(step = self.step_index, "Skipping global transition: {}", e);
                self.summary.skipped_inserts += 1;
                // Terminations carry over to the next stored transition.
                self.unstored_mask.observe(&masks);
                false
            }
            Err(e) => return Err(e),
        };

        state.global_output = if inserted {
            self.act_from_slot(slot + 1)?
        } else {
            let output = self.global_policy.act(
                input.maps.view(),
                state.global_output.rec_states.view(),
                masks.view(),
                input.orientation.view(),
                false,
            )?;
            self.check_global_output(&output)?;
            output
        };
        state.goals = self.goal_cells(&state.global_output);
        Ok(inserted)
    }

    /// Run perception with map building and adopt its local maps and poses.
    fn update_maps(
        &mut self,
        prev_obs: ArrayView4<'_, f32>,
        obs: ArrayView4<'_, f32>,
        infos: &[StepInfo],
    ) -> Result<()> {
        let sensor_poses: Vec<Pose> = infos.iter().map(|info| info.sensor_pose).collect();
        let pose_delta = pose_rows(&sensor_poses);
        let obstacle = self.map.local_channel(MapChannel::Obstacle);
        let explored = self.map.local_channel(MapChannel::Explored);
        let poses = self.map.local_poses();

        let output = self.perception.infer(
            PerceptionInput {
                prev_obs: prev_obs.reborrow(),
                obs: obs.reborrow(),
                pose_delta: pose_delta.view(),
                prior: Some(MapPrior {
                    obstacle: obstacle.view(),
                    explored: explored.view(),
                    poses: &poses,
                }),
            },
            true,
        )?;
        let maps = output.maps.ok_or_else(|| {
            SlamError::contract("perception", "no map estimate while building maps")
        })?;
        self.map
            .update_local(&maps.obstacle, &maps.explored, &maps.poses)
    }

    /// Push one supervision sample per agent.
    fn remember(&mut self, last_obs: &Array4<f32>, obs: &Array4<f32>, infos: &[StepInfo]) {
        for (e, info) in infos.iter().enumerate() {
            self.replay.push(ReplaySample {
                prev_obs: last_obs.index_axis(Axis(0), e).to_owned(),
                obs: obs.index_axis(Axis(0), e).to_owned(),
                pose_delta: info.sensor_pose,
                target: ReplayTarget {
                    projection: info.fp_proj.clone(),
                    explored: info.fp_explored.clone(),
                    pose_error: info.pose_err,
                },
            });
        }
    }

    fn act_from_slot(&mut self, slot: usize) -> Result<PolicyOutput> {
        let rollouts = &self.rollouts;
        let output = self.global_policy.act(
            rollouts.obs.index_axis(Axis(0), slot),
            rollouts.rec_states.index_axis(Axis(0), slot),
            rollouts.masks.index_axis(Axis(0), slot),
            rollouts.extras.index_axis(Axis(0), slot),
            false,
        )?;
        self.check_global_output(&output)?;
        Ok(output)
    }

    fn goal_cells(&self, output: &PolicyOutput) -> Vec<(usize, usize)> {
        let (lw, lh) = self.map.geometry().local_size();
        output
            .actions
            .rows()
            .into_iter()
            .map(|action| (goal_cell(action[0], lw), goal_cell(action[1], lh)))
            .collect()
    }

    fn plan(
        &self,
        env: &mut dyn ExplorationVecEnv,
        goals: &[(usize, usize)],
    ) -> Result<Vec<ShortTermGoal>> {
        let requests: Vec<PlannerRequest> = goals
            .iter()
            .enumerate()
            .map(|(e, &goal)| {
                let local = self.map.agent(e).local_map();
                PlannerRequest {
                    goal,
                    map_pred: local
                        .index_axis(Axis(0), MapChannel::Obstacle.index())
                        .to_owned(),
                    exp_pred: local
                        .index_axis(Axis(0), MapChannel::Explored.index())
                        .to_owned(),
                    pose: self.map.planner_pose(e),
                }
            })
            .collect();
        let short_term = env.get_short_term_goal(&requests)?;
        validate_goals(&short_term, requests.len(), env.num_actions())?;
        Ok(short_term)
    }

    /// Supervised perception updates on replayed samples.
    fn train_perception(&mut self) -> Result<()> {
        for _ in 0..self.config.slam_iterations {
            let batch = stack_samples(
                &self
                    .replay
                    .sample(self.config.slam_batch_size, &mut self.rng),
            )?;
            let Some(batch) = batch else {
                return Ok(());
            };

            let output = self.perception.infer(
                PerceptionInput {
                    prev_obs: batch.prev_obs.view(),
                    obs: batch.obs.view(),
                    pose_delta: batch.pose_delta.view(),
                    prior: None,
                },
                false,
            )?;
            ensure_shape(
                "perception projection",
                batch.projection.shape(),
                output.projection.shape(),
            )?;
            ensure_shape(
                "perception explored",
                batch.explored.shape(),
                output.explored.shape(),
            )?;
            ensure_shape(
                "perception pose error",
                batch.pose_error.shape(),
                output.pose_error.shape(),
            )?;

            let config = &self.config;
            let proj = binary_cross_entropy(
                output.projection.view().into_dyn(),
                batch.projection.view().into_dyn(),
            );
            let exp = binary_cross_entropy(
                output.explored.view().into_dyn(),
                batch.explored.view().into_dyn(),
            );
            let pose = mse(
                output.pose_error.view().into_dyn(),
                batch.pose_error.view().into_dyn(),
            );

            let mut loss = 0.0;
            if config.proj_loss_coeff > 0.0 {
                loss += config.proj_loss_coeff * proj;
            }
            if config.exp_loss_coeff > 0.0 {
                loss += config.exp_loss_coeff * exp;
            }
            if config.pose_loss_coeff > 0.0 {
                loss += config.pose_loss_coeff * pose;
            }
            if !loss.is_finite() {
                tracing::warn!(step = self.step_index, "Skipping perception update with non-finite loss");
                continue;
            }

            if config.proj_loss_coeff > 0.0 {
                self.stats.proj_costs.push(proj);
            }
            if config.exp_loss_coeff > 0.0 {
                self.stats.exp_costs.push(exp);
            }
            if config.pose_loss_coeff > 0.0 {
                self.stats.pose_costs.push(config.pose_loss_coeff * pose);
            }
            self.perception.optimize(loss)?;
            self.summary.perception_updates += 1;
        }
        Ok(())
    }

    /// Flush the accumulated imitation loss into one local policy update.
    fn update_local(&mut self) -> Result<()> {
        let loss = std::mem::take(&mut self.pending_local_loss);
        if !loss.is_finite() {
            tracing::warn!(step = self.step_index, "Skipping local update with non-finite loss");
            return Ok(());
        }
        self.local_policy.optimize(loss)?;
        self.stats.local_losses.push(loss);
        self.summary.local_updates += 1;
        Ok(())
    }

    /// Bootstrap, compute returns and optimize once the horizon is full.
    fn update_global(&mut self) -> Result<()> {
        if self.config.train_global {
            let last = self.rollouts.num_steps();
            let rollouts = &self.rollouts;
            let next_value = self.global_policy.get_value(
                rollouts.obs.index_axis(Axis(0), last),
                rollouts.rec_states.index_axis(Axis(0), last),
                rollouts.masks.index_axis(Axis(0), last),
                rollouts.extras.index_axis(Axis(0), last),
            )?;

            match self.rollouts.compute_returns(
                next_value.view(),
                self.config.use_gae,
                self.config.gamma,
                self.config.tau,
            ) {
                Ok(()) => {
                    let metrics = self
                        .optimizer
                        .update(self.global_policy.as_mut(), &self.rollouts)?;
                    self.stats.value_losses.push(metrics.value_loss);
                    self.stats.action_losses.push(metrics.action_loss);
                    self.stats.dist_entropies.push(metrics.dist_entropy);
                    self.summary.global_updates += 1;
                    tracing::debug!(
                        value_loss = metrics.value_loss,
                        action_loss = metrics.action_loss,
                        "Global policy updated"
                    );
                }
                Err(e) if e.is_recoverable() => {
                    tracing::warn!(step = self.step_index, "Skipping global update: {}", e);
                }
                Err(e) => return Err(e),
            }
        }
        self.rollouts.after_update();
        Ok(())
    }

    fn log_progress(&self) {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        let steps = self.step_index * self.config.num_agents as u64;
        let fps = if elapsed > 0.0 { steps as f64 / elapsed } else { 0.0 };
        tracing::info!(
            "Time: {}, num timesteps {}, FPS {}",
            format_duration(elapsed),
            abbreviate(steps),
            fps as u64
        );

        let mut metrics = self.stats.metrics();
        metrics.insert("perf/fps".into(), fps);
        self.logger.log_metrics(&metrics, steps);
    }

    fn save_snapshots(&mut self) -> Result<()> {
        let n = self.config.num_agents as u64;
        let step = self.step_index * n;

        if !self.config.eval && self.snapshots.is_best_step(self.step_index, n) {
            let stats = &self.stats;
            self.snapshots.consider_best(
                ModelKind::Perception,
                &*self.perception,
                stats.proj_costs.mean(),
                stats.proj_costs.len(),
                step,
            )?;
            self.snapshots.consider_best(
                ModelKind::Local,
                &*self.local_policy,
                stats.local_losses.mean(),
                stats.local_losses.len(),
                step,
            )?;
            self.snapshots.consider_best(
                ModelKind::Global,
                &*self.global_policy,
                stats.episode_rewards.mean(),
                stats.episode_rewards.len(),
                step,
            )?;
        }

        if self.snapshots.is_periodic_step(self.step_index, n) {
            if self.config.train_slam {
                self.snapshots
                    .save_periodic(ModelKind::Perception, &*self.perception, step)?;
            }
            if self.config.train_local {
                self.snapshots
                    .save_periodic(ModelKind::Local, &*self.local_policy, step)?;
            }
            if self.config.train_global {
                self.snapshots
                    .save_periodic(ModelKind::Global, &*self.global_policy, step)?;
            }
        }
        Ok(())
    }

    fn check_local_action(&self, action: &LocalAction, num_actions: usize) -> Result<()> {
        let n = self.config.num_agents;
        if action.actions.len() != n {
            return Err(SlamError::contract(
                "local policy",
                format!("returned {} actions for {} agents", action.actions.len(), n),
            ));
        }
        if let Some(bad) = action.actions.iter().find(|&&a| a >= num_actions) {
            return Err(SlamError::contract(
                "local policy",
                format!("action {bad} outside {num_actions} actions"),
            ));
        }
        ensure_shape("local logits", &[n, num_actions], action.logits.shape())?;
        ensure_shape(
            "local recurrent state",
            &[n, self.local_policy.rec_state_size()],
            action.rec_states.shape(),
        )
    }

    fn check_global_output(&self, output: &PolicyOutput) -> Result<()> {
        let n = self.config.num_agents;
        ensure_shape("global values", &[n], output.values.shape())?;
        ensure_shape("global log probs", &[n], output.log_probs.shape())?;
        ensure_shape(
            "global actions",
            &[n, self.rollouts.actions.len_of(Axis(2))],
            output.actions.shape(),
        )?;
        ensure_shape(
            "global recurrent state",
            &[n, self.rollouts.rec_states.len_of(Axis(2))],
            output.rec_states.shape(),
        )
    }
}

/// Cell of a raw goal coordinate inside a window side of `extent` cells.
fn goal_cell(raw: f32, extent: usize) -> usize {
    ((sigmoid(raw) * extent as f32) as usize).min(extent.saturating_sub(1))
}

/// `[poses, 3]` matrix of `(x, y, heading)` rows
fn pose_rows(poses: &[Pose]) -> Array2<f32> {
    let mut rows = Array2::zeros((poses.len(), 3));
    for (i, pose) in poses.iter().enumerate() {
        for (j, value) in pose.to_array().into_iter().enumerate() {
            rows[[i, j]] = value;
        }
    }
    rows
}

/// A replay batch stacked along a leading batch axis
struct PerceptionBatch {
    prev_obs: Array4<f32>,
    obs: Array4<f32>,
    pose_delta: Array2<f32>,
    projection: Array3<f32>,
    explored: Array3<f32>,
    pose_error: Array2<f32>,
}

fn stack_samples(samples: &[&ReplaySample]) -> Result<Option<PerceptionBatch>> {
    let Some(first) = samples.first() else {
        return Ok(None);
    };
    let b = samples.len();
    let (c, h, w) = first.obs.dim();
    let (vh, vw) = first.target.projection.dim();
    let mut batch = PerceptionBatch {
        prev_obs: Array4::zeros((b, c, h, w)),
        obs: Array4::zeros((b, c, h, w)),
        pose_delta: Array2::zeros((b, 3)),
        projection: Array3::zeros((b, vh, vw)),
        explored: Array3::zeros((b, vh, vw)),
        pose_error: Array2::zeros((b, 3)),
    };

    for (i, sample) in samples.iter().enumerate() {
        ensure_shape("replay observation", &[c, h, w], sample.prev_obs.shape())?;
        ensure_shape("replay observation", &[c, h, w], sample.obs.shape())?;
        ensure_shape("replay target", &[vh, vw], sample.target.projection.shape())?;
        ensure_shape("replay target", &[vh, vw], sample.target.explored.shape())?;

        batch.prev_obs.index_axis_mut(Axis(0), i).assign(&sample.prev_obs);
        batch.obs.index_axis_mut(Axis(0), i).assign(&sample.obs);
        batch
            .projection
            .index_axis_mut(Axis(0), i)
            .assign(&sample.target.projection);
        batch
            .explored
            .index_axis_mut(Axis(0), i)
            .assign(&sample.target.explored);
        for (j, (delta, error)) in sample
            .pose_delta
            .to_array()
            .into_iter()
            .zip(sample.target.pose_error.to_array())
            .enumerate()
        {
            batch.pose_delta[[i, j]] = delta;
            batch.pose_error[[i, j]] = error;
        }
    }
    Ok(Some(batch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::Checkpointable;
    use crate::env::VecStep;
    use crate::policy::{MapEstimate, PerceptionOutput, UpdateMetrics};
    use ndarray::{ArrayView1, ArrayView2};
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    const AGENTS: usize = 2;
    const ACTIONS: usize = 3;
    const VIEW: usize = 4;
    const WORLD: usize = 8;

    #[derive(Default)]
    struct Calls {
        perception_losses: Vec<f64>,
        local_losses: Vec<f64>,
        global_updates: usize,
        training_batches: usize,
    }

    type Shared = Arc<Mutex<Calls>>;

    struct MockEnv {
        agents: usize,
        t: usize,
        nan_rewards: bool,
        /// Step at which every agent reports a non-finite explored map
        nan_at: Option<usize>,
        /// Step at which every agent reports done
        done_at: Option<usize>,
    }

    impl MockEnv {
        fn new(agents: usize) -> Self {
            Self {
                agents,
                t: 0,
                nan_rewards: false,
                nan_at: None,
                done_at: None,
            }
        }

        fn batch(&self) -> (Array4<f32>, Vec<StepInfo>) {
            let infos = (0..self.agents)
                .map(|e| {
                    let nan = self.nan_rewards || self.nan_at == Some(self.t);
                    let mut explored = Array2::zeros((WORLD, WORLD));
                    for col in 0..=self.t.min(WORLD - 1) {
                        explored[[e, col]] = if nan { f32::NAN } else { 1.0 };
                    }
                    StepInfo {
                        sensor_pose: Pose::default(),
                        explored_map: explored,
                        explorable_map: Array2::ones((WORLD, WORLD)),
                        exp_reward: 0.0,
                        exp_ratio: 0.1,
                        fp_proj: Array2::zeros((VIEW, VIEW)),
                        fp_explored: Array2::zeros((VIEW, VIEW)),
                        pose_err: Pose::default(),
                    }
                })
                .collect();
            (Array4::zeros((self.agents, 1, VIEW, VIEW)), infos)
        }
    }

    impl ExplorationVecEnv for MockEnv {
        fn num_envs(&self) -> usize {
            self.agents
        }
        fn obs_shape(&self) -> (usize, usize, usize) {
            (1, VIEW, VIEW)
        }
        fn num_actions(&self) -> usize {
            ACTIONS
        }
        fn reset(&mut self) -> Result<(Array4<f32>, Vec<StepInfo>)> {
            self.t = 0;
            Ok(self.batch())
        }
        fn step(&mut self, actions: &[usize]) -> Result<VecStep> {
            assert_eq!(actions.len(), self.agents);
            self.t += 1;
            let (obs, infos) = self.batch();
            Ok(VecStep {
                obs,
                rewards: Array1::zeros(self.agents),
                dones: vec![self.done_at == Some(self.t); self.agents],
                infos,
            })
        }
        fn get_short_term_goal(&mut self, requests: &[PlannerRequest]) -> Result<Vec<ShortTermGoal>> {
            Ok(requests
                .iter()
                .map(|_| ShortTermGoal {
                    relative_goal: [0, 0],
                    expert_action: 1,
                })
                .collect())
        }
    }

    struct MockPerception {
        calls: Shared,
        build_maps: bool,
    }

    impl Checkpointable for MockPerception {
        fn save_state(&self) -> Result<Vec<u8>> {
            Ok(b"perception".to_vec())
        }
        fn load_state(&mut self, _data: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    impl PerceptionModel for MockPerception {
        fn infer(&mut self, input: PerceptionInput<'_>, build_maps: bool) -> Result<PerceptionOutput> {
            let b = input.obs.len_of(Axis(0));
            if !build_maps {
                self.calls.lock().unwrap().training_batches += 1;
            }
            let maps = match (build_maps && self.build_maps, input.prior) {
                (true, Some(prior)) => Some(MapEstimate {
                    obstacle: prior.obstacle.to_owned(),
                    explored: prior.explored.to_owned(),
                    poses: prior.poses.to_vec(),
                }),
                _ => None,
            };
            Ok(PerceptionOutput {
                projection: Array3::zeros((b, VIEW, VIEW)),
                explored: Array3::zeros((b, VIEW, VIEW)),
                pose_error: Array2::zeros((b, 3)),
                maps,
            })
        }
        fn optimize(&mut self, loss: f64) -> Result<()> {
            self.calls.lock().unwrap().perception_losses.push(loss);
            Ok(())
        }
    }

    struct MockLocal {
        calls: Shared,
    }

    impl Checkpointable for MockLocal {
        fn save_state(&self) -> Result<Vec<u8>> {
            Ok(b"local".to_vec())
        }
        fn load_state(&mut self, _data: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    impl LocalPolicy for MockLocal {
        fn rec_state_size(&self) -> usize {
            1
        }
        fn act(
            &mut self,
            obs: ArrayView4<'_, f32>,
            _rec_states: ArrayView2<'_, f32>,
            _masks: ArrayView1<'_, f32>,
            goals: ArrayView2<'_, i64>,
            _deterministic: bool,
        ) -> Result<LocalAction> {
            let n = obs.len_of(Axis(0));
            assert_eq!(goals.dim(), (n, 2));
            Ok(LocalAction {
                actions: vec![0; n],
                logits: Array2::zeros((n, ACTIONS)),
                rec_states: Array2::zeros((n, 1)),
            })
        }
        fn optimize(&mut self, loss: f64) -> Result<()> {
            self.calls.lock().unwrap().local_losses.push(loss);
            Ok(())
        }
    }

    struct MockGlobal;

    impl Checkpointable for MockGlobal {
        fn save_state(&self) -> Result<Vec<u8>> {
            Ok(b"global".to_vec())
        }
        fn load_state(&mut self, _data: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    impl GlobalPolicy for MockGlobal {
        fn rec_state_size(&self) -> usize {
            1
        }
        fn act(
            &mut self,
            obs: ArrayView4<'_, f32>,
            _rec_states: ArrayView2<'_, f32>,
            _masks: ArrayView1<'_, f32>,
            _extras: ArrayView1<'_, i64>,
            _deterministic: bool,
        ) -> Result<PolicyOutput> {
            let n = obs.len_of(Axis(0));
            Ok(PolicyOutput {
                values: Array1::zeros(n),
                actions: Array2::zeros((n, 2)),
                log_probs: Array1::zeros(n),
                rec_states: Array2::zeros((n, 1)),
            })
        }
        fn get_value(
            &mut self,
            obs: ArrayView4<'_, f32>,
            _rec_states: ArrayView2<'_, f32>,
            _masks: ArrayView1<'_, f32>,
            _extras: ArrayView1<'_, i64>,
        ) -> Result<Array1<f32>> {
            Ok(Array1::zeros(obs.len_of(Axis(0))))
        }
    }

    struct MockOptimizer {
        calls: Shared,
    }

    impl GlobalOptimizer for MockOptimizer {
        fn update(
            &mut self,
            _policy: &mut dyn GlobalPolicy,
            rollouts: &RolloutStorage,
        ) -> Result<UpdateMetrics> {
            assert!(rollouts.returns.iter().all(|r| r.is_finite()));
            self.calls.lock().unwrap().global_updates += 1;
            Ok(UpdateMetrics {
                value_loss: 1.0,
                action_loss: 0.5,
                dist_entropy: 0.1,
            })
        }
    }

    fn collaborators(calls: &Shared, build_maps: bool) -> Collaborators {
        Collaborators {
            perception: Box::new(MockPerception {
                calls: calls.clone(),
                build_maps,
            }),
            local_policy: Box::new(MockLocal {
                calls: calls.clone(),
            }),
            global_policy: Box::new(MockGlobal),
            optimizer: Box::new(MockOptimizer {
                calls: calls.clone(),
            }),
        }
    }

    fn config(dir: &std::path::Path) -> TrainerConfig {
        let mut config = TrainerConfig::default()
            .with_num_agents(AGENTS)
            .with_episodes(1, 8)
            .with_cadence(2, 2)
            .with_map(100, 5, 1)
            .with_dump_location(dir);
        config.local_policy_update_freq = 1;
        config.slam_batch_size = 4;
        config.slam_iterations = 2;
        config
    }

    #[test]
    fn test_training_cadence() {
        let dir = tempdir().unwrap();
        let calls = Shared::default();
        let config = config(dir.path());
        let mut trainer = Trainer::new(config.clone(), collaborators(&calls, true)).unwrap();
        let summary = trainer.run(&mut MockEnv::new(AGENTS)).unwrap();

        assert_eq!(summary.episodes, 1);
        assert_eq!(summary.steps, 8);
        // 4 global steps with a horizon of 2
        assert_eq!(summary.global_updates, 2);
        assert_eq!(summary.skipped_inserts, 0);
        // every step from the third on has more than 4 replay samples
        assert_eq!(summary.perception_updates, 12);
        assert_eq!(summary.local_updates, 8);

        let calls = calls.lock().unwrap();
        assert_eq!(calls.global_updates, 2);
        assert_eq!(calls.training_batches, 12);
        assert!(calls.perception_losses.iter().all(|&l| l == 0.0));
        for loss in &calls.local_losses {
            assert!((loss - 3f64.ln()).abs() < 1e-9);
        }

        assert_eq!(trainer.replay().len(), 16);
        assert_eq!(trainer.rollouts().step(), 0);
        assert!(trainer.map().synchronized_channels_agree());
        assert_eq!(trainer.stats().per_step_rewards.len(), 4);
        assert!(summary.metrics.contains_key("loss/value"));

        let dump = config.snapshot_config().dump_dir;
        assert!(dump.join("periodic_0.slam").exists());
        assert!(dump.join("periodic_0.local").exists());
        assert!(dump.join("periodic_0.multi_global").exists());
    }

    #[test]
    fn test_frozen_models_are_not_trained() {
        let dir = tempdir().unwrap();
        let calls = Shared::default();
        let config = config(dir.path()).with_training(false, false, false);
        let mut trainer = Trainer::new(config.clone(), collaborators(&calls, true)).unwrap();
        let summary = trainer.run(&mut MockEnv::new(AGENTS)).unwrap();

        assert_eq!(summary.global_updates, 0);
        assert_eq!(summary.perception_updates, 0);
        assert_eq!(summary.local_updates, 0);
        assert!(trainer.replay().is_empty());
        // the horizon still rotates without an update
        assert_eq!(trainer.rollouts().step(), 0);
        assert!(!config.snapshot_config().dump_dir.join("periodic_0.slam").exists());
    }

    #[test]
    fn test_evaluation_writes_report() {
        let dir = tempdir().unwrap();
        let calls = Shared::default();
        let config = config(dir.path())
            .with_episodes(2, 4)
            .with_training(false, false, false)
            .with_eval(true);
        let mut trainer = Trainer::new(config.clone(), collaborators(&calls, true)).unwrap();
        let summary = trainer.run(&mut MockEnv::new(AGENTS)).unwrap();

        let report = summary.eval_report.unwrap();
        assert_eq!(report.steps_per_episode(), 2);
        for episode in 0..2 {
            let first = report.cumulative_area[[episode, 0]];
            let second = report.cumulative_area[[episode, 1]];
            assert!(first > 0.0);
            assert!(second >= first);
            // area series accumulate per agent
            assert!(report.explored_area[[0, episode, 1]] >= report.explored_area[[0, episode, 0]]);
            assert!((report.explored_ratio[[0, episode, 1]] - 0.2).abs() < 1e-6);
        }

        let area = std::fs::read_to_string(config.dump_dir().join("explored_area.txt")).unwrap();
        assert_eq!(area.lines().count(), AGENTS * 2 + 2);
        assert!(config.dump_dir().join("explored_ratio.txt").exists());
    }

    #[test]
    fn test_non_finite_rewards_skip_inserts() {
        let dir = tempdir().unwrap();
        let calls = Shared::default();
        let mut trainer = Trainer::new(config(dir.path()), collaborators(&calls, true)).unwrap();
        let mut env = MockEnv::new(AGENTS);
        env.nan_rewards = true;
        let summary = trainer.run(&mut env).unwrap();

        assert_eq!(summary.skipped_inserts, 4);
        assert_eq!(summary.global_updates, 0);
        assert_eq!(trainer.rollouts().step(), 0);
        assert!(trainer.stats().per_step_rewards.is_empty());
        assert!(trainer.stats().episode_rewards.is_empty());
    }

    #[test]
    fn test_done_zeroes_next_stored_mask() {
        let dir = tempdir().unwrap();
        let calls = Shared::default();
        let config = config(dir.path()).with_cadence(2, 4);
        let mut trainer = Trainer::new(config, collaborators(&calls, true)).unwrap();
        let mut env = MockEnv::new(AGENTS);
        // done inside the second global step
        env.done_at = Some(3);
        let summary = trainer.run(&mut env).unwrap();

        assert_eq!(summary.skipped_inserts, 0);
        assert_eq!(summary.global_updates, 1);
        let masks = &trainer.rollouts().masks;
        assert!(masks.row(1).iter().all(|&m| m == 1.0));
        assert!(masks.row(2).iter().all(|&m| m == 0.0));
        assert!(masks.row(3).iter().all(|&m| m == 1.0));

        // one closed episode per agent, holding the first two global rewards
        let totals: Vec<f32> = trainer.stats().episode_rewards.iter().copied().collect();
        assert_eq!(totals.len(), AGENTS);
        assert!(totals.iter().all(|&total| total > 0.0));
    }

    #[test]
    fn test_done_survives_skipped_insert() {
        let dir = tempdir().unwrap();
        let calls = Shared::default();
        let config = config(dir.path()).with_cadence(2, 4);
        let mut trainer = Trainer::new(config, collaborators(&calls, true)).unwrap();
        let mut env = MockEnv::new(AGENTS);
        env.done_at = Some(3);
        // the global step that saw the done cannot be stored
        env.nan_at = Some(4);
        let summary = trainer.run(&mut env).unwrap();

        assert_eq!(summary.skipped_inserts, 1);
        assert_eq!(summary.global_updates, 0);
        assert_eq!(trainer.rollouts().step(), 3);
        let masks = &trainer.rollouts().masks;
        assert!(masks.row(1).iter().all(|&m| m == 1.0));
        assert!(masks.row(2).iter().all(|&m| m == 0.0));
        assert!(masks.row(3).iter().all(|&m| m == 1.0));

        // the episode closes once, at the skipped step, with the first reward only
        let totals: Vec<f32> = trainer.stats().episode_rewards.iter().copied().collect();
        assert_eq!(totals.len(), AGENTS);
        assert!(totals.iter().all(|&total| total > 0.0));
        assert_eq!(trainer.stats().per_step_rewards.len(), 3);
    }

    #[test]
    fn test_evaluation_scaling_stays_out_of_rollouts() {
        let dir = tempdir().unwrap();
        let calls = Shared::default();
        let config = config(dir.path())
            .with_cadence(2, 4)
            .with_training(false, false, false);
        let mut plain = Trainer::new(config.clone(), collaborators(&calls, true)).unwrap();
        plain.run(&mut MockEnv::new(AGENTS)).unwrap();

        let eval_dir = tempdir().unwrap();
        let eval_config = config.with_eval(true).with_dump_location(eval_dir.path());
        let mut eval = Trainer::new(eval_config, collaborators(&calls, true)).unwrap();
        let summary = eval.run(&mut MockEnv::new(AGENTS)).unwrap();

        assert_eq!(plain.rollouts().rewards, eval.rollouts().rewards);
        let stored = eval.rollouts().rewards[[0, 0]];
        assert!(stored > 0.0);
        let report = summary.eval_report.unwrap();
        assert!((report.explored_area[[0, 0, 0]] - stored * EVAL_AREA_SCALE).abs() < 1e-4);
    }

    #[test]
    fn test_non_finite_rewards_stay_out_of_report() {
        let dir = tempdir().unwrap();
        let calls = Shared::default();
        let config = config(dir.path())
            .with_episodes(1, 4)
            .with_training(false, false, false)
            .with_eval(true);
        let mut trainer = Trainer::new(config, collaborators(&calls, true)).unwrap();
        let mut env = MockEnv::new(AGENTS);
        env.nan_at = Some(2);
        let summary = trainer.run(&mut env).unwrap();

        assert_eq!(summary.skipped_inserts, 1);
        let report = summary.eval_report.unwrap();
        assert!(report.explored_area.iter().all(|v| v.is_finite()));
        assert_eq!(report.explored_area[[0, 0, 0]], 0.0);
        assert!(report.explored_area[[0, 0, 1]] > 0.0);
    }

    #[test]
    fn test_agent_count_mismatch_is_fatal() {
        let dir = tempdir().unwrap();
        let calls = Shared::default();
        let mut trainer = Trainer::new(config(dir.path()), collaborators(&calls, true)).unwrap();
        let err = trainer.run(&mut MockEnv::new(3)).unwrap_err();
        assert!(matches!(err, SlamError::ContractViolation { .. }));
    }

    #[test]
    fn test_missing_map_estimate_is_fatal() {
        let dir = tempdir().unwrap();
        let calls = Shared::default();
        let mut trainer = Trainer::new(config(dir.path()), collaborators(&calls, false)).unwrap();
        let err = trainer.run(&mut MockEnv::new(AGENTS)).unwrap_err();
        assert!(matches!(
            err,
            SlamError::ContractViolation {
                component: "perception",
                ..
            }
        ));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let dir = tempdir().unwrap();
        let calls = Shared::default();
        let config = config(dir.path()).with_cadence(0, 2);
        assert!(matches!(
            Trainer::new(config, collaborators(&calls, true)),
            Err(SlamError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_goal_cells_stay_inside_window() {
        assert_eq!(goal_cell(0.0, 20), 10);
        assert_eq!(goal_cell(100.0, 20), 19);
        assert_eq!(goal_cell(-100.0, 20), 0);
        assert_eq!(goal_cell(f32::NAN, 20), 0);
    }
}
