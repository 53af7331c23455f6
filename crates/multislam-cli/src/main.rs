//! multislam CLI
//!
//! Command-line driver for multi-agent exploration training and evaluation
//! runs on the built-in grid world.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use multislam::log::{ConsoleLogger, MetricLogger};
use multislam::training::{RunSummary, Trainer, TrainerConfig};
use multislam_envs::{scripted_collaborators, GridWorld, GridWorldConfig};

mod progress;

use progress::ProgressLogger;

#[derive(Parser)]
#[command(name = "multislam")]
#[command(version, about = "multislam - Multi-agent exploration training", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train perception, local and global policies on the grid world
    Train(RunArgs),

    /// Evaluate without training and write the explored-area report
    Eval(RunArgs),

    /// Print the resolved configuration as JSON
    ShowConfig(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// JSON configuration file; missing fields keep their defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of agents
    #[arg(long)]
    agents: Option<usize>,

    /// Number of episodes
    #[arg(long)]
    episodes: Option<usize>,

    /// Local steps per episode
    #[arg(long)]
    max_episode_length: Option<usize>,

    /// Local steps per global step
    #[arg(long)]
    local_steps: Option<usize>,

    /// Global steps per rollout
    #[arg(long)]
    global_steps: Option<usize>,

    /// Full map side in centimetres
    #[arg(long)]
    map_size_cm: Option<usize>,

    /// Centimetres per map cell
    #[arg(long)]
    resolution: Option<usize>,

    /// Full-to-local map downscaling factor
    #[arg(long)]
    downscaling: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,

    /// Root directory for models, periodic snapshots and reports
    #[arg(long)]
    dump_location: Option<PathBuf>,

    /// Experiment name
    #[arg(long)]
    exp_name: Option<String>,

    /// Perception snapshot to start from
    #[arg(long)]
    load_slam: Option<PathBuf>,

    /// Local policy snapshot to start from
    #[arg(long)]
    load_local: Option<PathBuf>,

    /// Global policy snapshot to start from
    #[arg(long)]
    load_global: Option<PathBuf>,

    /// Side of each agent's square view in cells (odd)
    #[arg(long, default_value = "9")]
    view_size: usize,

    /// Obstacle probability of the generated world
    #[arg(long, default_value = "0.1")]
    obstacle_density: f64,

    /// Odometry noise standard deviation in metres
    #[arg(long, default_value = "0.0")]
    pose_noise: f32,

    /// Log metrics as lines instead of drawing a progress bar
    #[arg(long)]
    no_progress: bool,
}

impl RunArgs {
    fn resolve(&self) -> Result<TrainerConfig> {
        let mut config = match &self.config {
            Some(path) => TrainerConfig::from_json_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => TrainerConfig::default(),
        };

        if let Some(v) = self.agents {
            config.num_agents = v;
        }
        if let Some(v) = self.episodes {
            config.num_episodes = v;
        }
        if let Some(v) = self.max_episode_length {
            config.max_episode_length = v;
        }
        if let Some(v) = self.local_steps {
            config.num_local_steps = v;
        }
        if let Some(v) = self.global_steps {
            config.num_global_steps = v;
        }
        if let Some(v) = self.map_size_cm {
            config.map_size_cm = v;
        }
        if let Some(v) = self.resolution {
            config.map_resolution = v;
        }
        if let Some(v) = self.downscaling {
            config.global_downscaling = v;
        }
        if let Some(v) = self.seed {
            config.seed = v;
        }
        if let Some(v) = &self.dump_location {
            config.dump_location = v.clone();
        }
        if let Some(v) = &self.exp_name {
            config.exp_name = v.clone();
        }
        if let Some(v) = &self.load_slam {
            config.load_slam = Some(v.clone());
        }
        if let Some(v) = &self.load_local {
            config.load_local = Some(v.clone());
        }
        if let Some(v) = &self.load_global {
            config.load_global = Some(v.clone());
        }

        config.validate()?;
        Ok(config)
    }

    fn world(&self, config: &TrainerConfig) -> GridWorldConfig {
        GridWorldConfig::for_trainer(config)
            .with_view_size(self.view_size)
            .with_obstacle_density(self.obstacle_density)
            .with_pose_noise(self.pose_noise)
    }

    fn logger(&self, config: &TrainerConfig) -> Box<dyn MetricLogger> {
        if self.no_progress {
            return Box::new(ConsoleLogger::new());
        }
        let total = (config.num_episodes * config.max_episode_length * config.num_agents) as u64;
        Box::new(ProgressLogger::new(total))
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Train(args) => {
            init_logging()?;
            let config = args.resolve()?;
            tracing::info!(
                agents = config.num_agents,
                episodes = config.num_episodes,
                exp = %config.exp_name,
                "Starting training"
            );
            let summary = run(&args, config)?;
            report(&summary);
        }
        Commands::Eval(args) => {
            init_logging()?;
            let config = args
                .resolve()?
                .with_eval(true)
                .with_training(false, false, false);
            tracing::info!(
                agents = config.num_agents,
                episodes = config.num_episodes,
                "Starting evaluation"
            );
            let summary = run(&args, config)?;
            report(&summary);
        }
        Commands::ShowConfig(args) => {
            let config = args.resolve()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn init_logging() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();
    Ok(())
}

fn run(args: &RunArgs, config: TrainerConfig) -> Result<RunSummary> {
    let mut env = GridWorld::new(args.world(&config)).context("Failed to build grid world")?;
    let collaborators = scripted_collaborators(&config)?;
    let logger = args.logger(&config);
    let mut trainer = Trainer::new(config, collaborators)?.with_logger(logger);
    Ok(trainer.run(&mut env)?)
}

fn report(summary: &RunSummary) {
    tracing::info!(
        episodes = summary.episodes,
        steps = summary.steps,
        global_updates = summary.global_updates,
        perception_updates = summary.perception_updates,
        local_updates = summary.local_updates,
        skipped = summary.skipped_inserts,
        "Run finished"
    );
    for (name, value) in &summary.metrics {
        tracing::info!("{name}: {value:.4}");
    }
}
