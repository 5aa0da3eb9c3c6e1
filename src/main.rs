use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use dqn_replay::{
    config::{self, DqnConfig, PgConfig},
    device, environment,
    metrics::ScalarLog,
    pg::PgTrainer,
    trainer::DqnTrainer,
};

#[derive(Parser)]
#[command(name = "dqn-replay", about = "Replay-buffer DQN and policy-gradient trainers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Deep Q-learning with experience replay and a target network
    Dqn(CommonArgs),
    /// REINFORCE with baseline and entropy bonus
    Pg(CommonArgs),
}

#[derive(Args)]
struct CommonArgs {
    /// JSON file with hyperparameters; omitted fields keep their defaults
    #[arg(long)]
    config: Option<PathBuf>,
    /// Name of environment
    #[arg(long)]
    env: Option<String>,
    /// Mean reward boundary to stop training
    #[arg(long)]
    reward: Option<f32>,
    /// Enable CUDA
    #[arg(long, default_value_t = false)]
    gpu: bool,
    #[arg(long)]
    seed: Option<u64>,
    /// Stop after this many frames even if unsolved
    #[arg(long)]
    max_frames: Option<u64>,
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,
    #[arg(long, default_value = ".")]
    save_dir: PathBuf,
}

fn run_dqn(args: CommonArgs) -> Result<()> {
    let mut cfg: DqnConfig = match &args.config {
        Some(path) => config::load_json(path)?,
        None => DqnConfig::default(),
    };
    if let Some(env) = args.env {
        cfg.env_name = env;
    }
    if let Some(reward) = args.reward {
        cfg.mean_reward_bound = Some(reward);
    }
    cfg.seed = args.seed.or(cfg.seed);
    cfg.max_frames = args.max_frames.or(cfg.max_frames);

    let device = device::select(args.gpu);
    let env = environment::make(&cfg.env_name, cfg.seed)?;
    let metrics = ScalarLog::new(&args.log_dir, &format!("dqn-{}", cfg.env_name));
    std::fs::create_dir_all(&args.save_dir)?;

    let mut trainer = DqnTrainer::new(cfg, env, device, metrics, &args.save_dir)?;
    let result = trainer.run();
    trainer.metrics_mut().flush()?;
    let summary = result?;
    info!(?summary, "training finished");
    Ok(())
}

fn run_pg(args: CommonArgs) -> Result<()> {
    let mut cfg: PgConfig = match &args.config {
        Some(path) => config::load_json(path)?,
        None => PgConfig::default(),
    };
    if let Some(env) = args.env {
        cfg.env_name = env;
    }
    if let Some(reward) = args.reward {
        cfg.mean_reward_bound = Some(reward);
    }
    cfg.seed = args.seed.or(cfg.seed);
    cfg.max_frames = args.max_frames.or(cfg.max_frames);

    let device = device::select(args.gpu);
    let env = environment::make(&cfg.env_name, cfg.seed)?;
    let metrics = ScalarLog::new(&args.log_dir, &format!("pg-{}", cfg.env_name));

    let mut trainer = PgTrainer::new(cfg, env, device, metrics)?;
    let result = trainer.run();
    trainer.metrics_mut().flush()?;
    let summary = result?;
    info!(?summary, "training finished");
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Dqn(args) => run_dqn(args),
        Command::Pg(args) => run_pg(args),
    }
}
