use std::{fs, path::Path};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::environment;

/// Hyperparameters of the replay-buffer DQN trainer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DqnConfig {
    pub env_name: String,
    /// Training stops once the trailing-100 mean reward exceeds this.
    /// Unset means the environment's own threshold.
    pub mean_reward_bound: Option<f32>,
    pub gamma: f64,
    pub batch_size: usize,
    pub replay_size: usize,
    /// No gradient step happens before the buffer holds this many records.
    pub replay_start_size: usize,
    pub learning_rate: f64,
    pub sync_target_frames: u64,
    pub epsilon_start: f64,
    pub epsilon_final: f64,
    pub epsilon_decay_last_frame: u64,
    pub hidden_sizes: Vec<usize>,
    pub max_frames: Option<u64>,
    pub seed: Option<u64>,
}

impl Default for DqnConfig {
    fn default() -> Self {
        Self {
            env_name: "PongNoFrameskip-v4".to_string(),
            mean_reward_bound: None,
            gamma: 0.99,
            batch_size: 32,
            replay_size: 10_000,
            replay_start_size: 10_000,
            learning_rate: 1e-4,
            sync_target_frames: 1_000,
            epsilon_start: 1.0,
            epsilon_final: 0.02,
            epsilon_decay_last_frame: 100_000,
            hidden_sizes: vec![128],
            max_frames: None,
            seed: None,
        }
    }
}

impl DqnConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.gamma > 0.0 && self.gamma < 1.0,
            "gamma must lie in (0, 1), got {}",
            self.gamma
        );
        ensure!(self.batch_size > 0, "batch_size must be positive");
        ensure!(self.replay_size > 0, "replay_size must be positive");
        ensure!(
            self.replay_start_size >= self.batch_size,
            "replay_start_size ({}) must be at least batch_size ({})",
            self.replay_start_size,
            self.batch_size
        );
        ensure!(
            self.replay_start_size <= self.replay_size,
            "replay_start_size ({}) can never be reached with replay_size {}",
            self.replay_start_size,
            self.replay_size
        );
        ensure!(self.sync_target_frames > 0, "sync_target_frames must be positive");
        ensure!(
            self.epsilon_decay_last_frame > 0,
            "epsilon_decay_last_frame must be positive"
        );
        Ok(())
    }

    pub fn reward_bound(&self) -> Result<f32> {
        resolve_reward_bound(self.mean_reward_bound, &self.env_name)
    }
}

/// Hyperparameters of the CartPole policy-gradient trainer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PgConfig {
    pub env_name: String,
    pub mean_reward_bound: Option<f32>,
    pub gamma: f64,
    pub learning_rate: f64,
    pub entropy_beta: f64,
    pub batch_size: usize,
    /// Length of the n-step discounted reward window.
    pub reward_steps: usize,
    pub hidden_size: usize,
    pub max_frames: Option<u64>,
    pub seed: Option<u64>,
}

impl Default for PgConfig {
    fn default() -> Self {
        Self {
            env_name: "CartPole-v0".to_string(),
            mean_reward_bound: None,
            gamma: 0.99,
            learning_rate: 1e-4,
            entropy_beta: 0.01,
            batch_size: 8,
            reward_steps: 10,
            hidden_size: 128,
            max_frames: None,
            seed: None,
        }
    }
}

impl PgConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.gamma > 0.0 && self.gamma < 1.0,
            "gamma must lie in (0, 1), got {}",
            self.gamma
        );
        ensure!(self.batch_size > 0, "batch_size must be positive");
        ensure!(self.reward_steps > 0, "reward_steps must be positive");
        ensure!(self.hidden_size > 0, "hidden_size must be positive");
        Ok(())
    }

    pub fn reward_bound(&self) -> Result<f32> {
        resolve_reward_bound(self.mean_reward_bound, &self.env_name)
    }
}

fn resolve_reward_bound(explicit: Option<f32>, env_name: &str) -> Result<f32> {
    explicit
        .or_else(|| environment::reward_threshold(env_name))
        .with_context(|| {
            format!("no reward threshold known for {env_name}; set mean_reward_bound")
        })
}

/// Reads a JSON config; missing fields keep their defaults.
pub fn load_json<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config: {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse config: {}", path.display()))
}
