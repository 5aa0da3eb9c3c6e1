use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::Device;
use candle_nn::Optimizer;
use candle_optimisers::adam::{Adam, ParamsAdam};
use rand::{SeedableRng, rngs::StdRng};
use tracing::{debug, info};

use crate::{
    agent::Agent,
    buffer::ExperienceBuffer,
    config::DqnConfig,
    environment::Environment,
    loss::calc_loss,
    metrics::ScalarLog,
    network::{MultiLayerPerceptron, TargetNetwork},
    session::{EpsilonSchedule, TrainingSession, TrainingSummary},
};

/// What a single frame of training did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrameOutcome {
    /// Buffer still below the replay start size; no update was made.
    Collecting,
    Trained { loss: f32, synced: bool },
    Solved,
}

/// Frame-by-frame DQN loop: epsilon-greedy collection into the replay
/// buffer, one Adam step on a sampled batch per frame, and a full copy of
/// the online weights into the target network every `sync_target_frames`.
pub struct DqnTrainer<E> {
    config: DqnConfig,
    device: Device,
    net: MultiLayerPerceptron,
    tgt_net: TargetNetwork,
    optimizer: Adam,
    buffer: ExperienceBuffer,
    agent: Agent<E>,
    epsilon: EpsilonSchedule,
    session: TrainingSession,
    rng: StdRng,
    metrics: ScalarLog,
    save_dir: PathBuf,
    last_loss: Option<f32>,
}

impl<E: Environment> DqnTrainer<E> {
    pub fn new(
        config: DqnConfig,
        env: E,
        device: &Device,
        metrics: ScalarLog,
        save_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        config.validate()?;

        let mut topology = Vec::with_capacity(config.hidden_sizes.len() + 2);
        topology.push(env.observation_len());
        topology.extend_from_slice(&config.hidden_sizes);
        topology.push(env.action_space().n);

        let net = MultiLayerPerceptron::new(&topology, device)?;
        let tgt_net = TargetNetwork::from_online(&net)?;
        let optimizer = Adam::new(
            net.var_map.all_vars(),
            ParamsAdam {
                lr: config.learning_rate,
                ..Default::default()
            },
        )?;

        let buffer = ExperienceBuffer::new(config.replay_size)?;
        let agent = Agent::new(env, config.seed)?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(1)),
            None => StdRng::from_os_rng(),
        };
        let epsilon = EpsilonSchedule {
            start: config.epsilon_start,
            final_value: config.epsilon_final,
            decay_last_frame: config.epsilon_decay_last_frame,
        };
        let session = TrainingSession::new(config.reward_bound()?);

        info!(
            ?topology,
            env = %config.env_name,
            reward_bound = session.reward_bound(),
            "built DQN"
        );
        Ok(Self {
            config,
            device: device.clone(),
            net,
            tgt_net,
            optimizer,
            buffer,
            agent,
            epsilon,
            session,
            rng,
            metrics,
            save_dir: save_dir.into(),
            last_loss: None,
        })
    }

    pub fn net(&self) -> &MultiLayerPerceptron {
        &self.net
    }

    pub fn target(&self) -> &TargetNetwork {
        &self.tgt_net
    }

    pub fn buffer(&self) -> &ExperienceBuffer {
        &self.buffer
    }

    pub fn session(&self) -> &TrainingSession {
        &self.session
    }

    pub fn metrics(&self) -> &ScalarLog {
        &self.metrics
    }

    pub fn metrics_mut(&mut self) -> &mut ScalarLog {
        &mut self.metrics
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        checkpoint_path(&self.save_dir, &self.config.env_name)
    }

    /// Runs until the trailing mean reward clears the bound or the optional
    /// frame cap is hit.
    pub fn run(&mut self) -> Result<TrainingSummary> {
        loop {
            if let Some(max_frames) = self.config.max_frames {
                if self.session.frame_idx() >= max_frames {
                    info!(frames = max_frames, "frame limit reached");
                    return Ok(self.session.summary(false));
                }
            }
            if self.play_frame()? == FrameOutcome::Solved {
                info!("Solved in {} frames!", self.session.frame_idx());
                return Ok(self.session.summary(true));
            }
            self.metrics.flush_if_due()?;
        }
    }

    pub fn play_frame(&mut self) -> Result<FrameOutcome> {
        let frame_idx = self.session.advance_frame();
        let epsilon = self.epsilon.value(frame_idx);

        let done_reward = self
            .agent
            .step(&mut self.buffer, &self.net, epsilon, &self.device)?;
        if let Some(reward) = done_reward {
            if self.on_episode_end(reward, epsilon)? {
                return Ok(FrameOutcome::Solved);
            }
        }

        if self.buffer.len() < self.config.replay_start_size {
            return Ok(FrameOutcome::Collecting);
        }

        let synced = self.maybe_sync_target()?;
        let loss = self.train_step()?;
        Ok(FrameOutcome::Trained { loss, synced })
    }

    /// Logs the finished episode and checkpoints on a new best mean.
    /// Returns whether the run is solved.
    fn on_episode_end(&mut self, reward: f32, epsilon: f64) -> Result<bool> {
        let frame_idx = self.session.frame_idx();
        let report = self.session.record_episode(reward);
        info!(
            "{} frames, {} games, {:.3} mean reward, {:.2} epsilon",
            frame_idx, report.games, report.mean_reward, epsilon
        );

        self.metrics.add_scalar("epsilon", epsilon, frame_idx);
        self.metrics.add_scalar("reward_100", report.mean_reward as f64, frame_idx);
        self.metrics.add_scalar("reward", reward as f64, frame_idx);
        if let Some(loss) = self.last_loss {
            self.metrics.add_scalar("loss", loss as f64, frame_idx);
        }

        if report.improved {
            let path = self.checkpoint_path();
            self.net
                .save(&path)
                .with_context(|| format!("Failed to save checkpoint {}", path.display()))?;
            if let Some(previous) = report.previous_best {
                info!(
                    "Best mean reward: {:.3} --> {:.3}, saved {}",
                    previous,
                    report.mean_reward,
                    path.display()
                );
            }
        }
        Ok(report.solved)
    }

    /// Copies the online weights into the target network on sync frames.
    pub fn maybe_sync_target(&mut self) -> Result<bool> {
        if self.session.frame_idx() % self.config.sync_target_frames != 0 {
            return Ok(false);
        }
        self.sync_target()?;
        Ok(true)
    }

    pub fn sync_target(&mut self) -> Result<()> {
        self.tgt_net.sync_from(&self.net)?;
        debug!(frame = self.session.frame_idx(), "synced target network");
        Ok(())
    }

    /// One gradient step on a freshly sampled batch; returns the loss.
    pub fn train_step(&mut self) -> Result<f32> {
        let batch = self
            .buffer
            .sample(self.config.batch_size, &mut self.rng)?
            .to_tensors(&self.device)?;
        let loss = calc_loss(&batch, &self.net, &self.tgt_net, self.config.gamma)?;
        self.optimizer.backward_step(&loss)?;

        let loss = loss.to_scalar::<f32>()?;
        self.last_loss = Some(loss);
        Ok(loss)
    }
}

/// `<save_dir>/<env_name>-best.dat`
pub fn checkpoint_path(save_dir: &Path, env_name: &str) -> PathBuf {
    save_dir.join(format!("{env_name}-best.dat"))
}
