use std::collections::VecDeque;

use anyhow::{Context, Result};
use candle_core::{D, Device, Tensor, backprop::GradStore};
use candle_nn::{Optimizer, VarMap, ops};
use candle_optimisers::adam::{Adam, ParamsAdam};
use rand::{
    SeedableRng,
    distr::{Distribution, weighted::WeightedIndex},
    rngs::StdRng,
};
use tracing::info;

use crate::{
    config::PgConfig,
    environment::Environment,
    experience::Observation,
    metrics::ScalarLog,
    network::MultiLayerPerceptron,
    session::{TrainingSession, TrainingSummary},
};

/// Backward discounted sums: `out[i] = r[i] + gamma * out[i + 1]`.
pub fn discounted_returns(rewards: &[f32], gamma: f64) -> Vec<f32> {
    let mut res = vec![0.0; rewards.len()];
    let mut sum_r = 0.0f64;
    for (i, &r) in rewards.iter().enumerate().rev() {
        sum_r = sum_r * gamma + r as f64;
        res[i] = sum_r as f32;
    }
    res
}

/// State and action of one step, paired with the discounted reward of the
/// next `steps` transitions (fewer at the end of an episode).
#[derive(Debug, Clone, PartialEq)]
pub struct NStepExperience {
    pub state: Observation,
    pub action: usize,
    pub reward: f32,
}

/// Sliding window that turns single transitions into n-step experiences.
#[derive(Debug, Clone)]
pub struct NStepWindow {
    steps: usize,
    gamma: f64,
    pending: VecDeque<(Observation, usize, f32)>,
}

impl NStepWindow {
    pub fn new(steps: usize, gamma: f64) -> Self {
        Self {
            steps,
            gamma,
            pending: VecDeque::with_capacity(steps),
        }
    }

    /// Adds a transition and returns the experiences it completes. On `done`
    /// the whole window is drained.
    pub fn push(
        &mut self,
        state: Observation,
        action: usize,
        reward: f32,
        done: bool,
    ) -> Vec<NStepExperience> {
        self.pending.push_back((state, action, reward));
        let mut ready = Vec::new();
        if done {
            while let Some(exp) = self.pop_front() {
                ready.push(exp);
            }
        } else if self.pending.len() >= self.steps {
            ready.extend(self.pop_front());
        }
        ready
    }

    fn pop_front(&mut self) -> Option<NStepExperience> {
        let rewards: Vec<f32> = self.pending.iter().map(|(_, _, r)| *r).collect();
        let reward = discounted_returns(&rewards, self.gamma).first().copied()?;
        let (state, action, _) = self.pending.pop_front()?;
        Some(NStepExperience {
            state,
            action,
            reward,
        })
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchStats {
    pub loss_policy: f32,
    pub loss_entropy: f32,
    pub total_loss: f32,
    pub entropy: f32,
    pub kl: f32,
    pub grad_l2: f32,
    pub grad_max: f32,
}

/// Mean per-parameter gradient L2 and the largest absolute gradient.
fn gradient_stats(grad_store: &GradStore, var_map: &VarMap) -> candle_core::Result<(f32, f32)> {
    let mut grad_max = 0.0f32;
    let mut grad_means = 0.0f32;
    let mut grad_count = 0usize;

    for var in var_map.all_vars() {
        if let Some(grad) = grad_store.get(var.as_tensor()) {
            grad_max = grad_max.max(grad.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?);
            grad_means += grad.sqr()?.mean_all()?.sqrt()?.to_scalar::<f32>()?;
            grad_count += 1;
        }
    }
    let grad_l2 = if grad_count == 0 {
        0.0
    } else {
        grad_means / grad_count as f32
    };
    Ok((grad_l2, grad_max))
}

/// REINFORCE with a running-mean baseline and an entropy bonus.
pub struct PgTrainer<E> {
    config: PgConfig,
    device: Device,
    env: E,
    net: MultiLayerPerceptron,
    optimizer: Adam,
    rng: StdRng,
    window: NStepWindow,
    session: TrainingSession,
    metrics: ScalarLog,
    state: Observation,
    episode_reward: f32,
    reward_sum: f64,
    reward_count: u64,
    batch_states: Vec<Observation>,
    batch_actions: Vec<usize>,
    batch_scales: Vec<f32>,
}

impl<E: Environment> PgTrainer<E> {
    pub fn new(config: PgConfig, mut env: E, device: &Device, metrics: ScalarLog) -> Result<Self> {
        config.validate()?;
        let topology = [
            env.observation_len(),
            config.hidden_size,
            env.action_space().n,
        ];
        let net = MultiLayerPerceptron::new(&topology, device)?;
        let optimizer = Adam::new(
            net.var_map.all_vars(),
            ParamsAdam {
                lr: config.learning_rate,
                ..Default::default()
            },
        )?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let state = env.reset().context("initial environment reset")?;
        let session = TrainingSession::new(config.reward_bound()?);

        info!(
            ?topology,
            env = %config.env_name,
            reward_bound = session.reward_bound(),
            "built policy network"
        );
        Ok(Self {
            window: NStepWindow::new(config.reward_steps, config.gamma),
            session,
            config,
            device: device.clone(),
            env,
            net,
            optimizer,
            rng,
            metrics,
            state,
            episode_reward: 0.0,
            reward_sum: 0.0,
            reward_count: 0,
            batch_states: Vec::new(),
            batch_actions: Vec::new(),
            batch_scales: Vec::new(),
        })
    }

    pub fn net(&self) -> &MultiLayerPerceptron {
        &self.net
    }

    pub fn metrics(&self) -> &ScalarLog {
        &self.metrics
    }

    pub fn metrics_mut(&mut self) -> &mut ScalarLog {
        &mut self.metrics
    }

    /// Action probabilities for one state.
    pub fn action_probs(&self, state: &Observation) -> candle_core::Result<Vec<f32>> {
        let input = Tensor::from_slice(state, (1, state.len()), &self.device)?;
        let logits = self.net.output(&input)?;
        ops::softmax(&logits, D::Minus1)?.squeeze(0)?.to_vec1::<f32>()
    }

    fn sample_action(&mut self) -> Result<usize> {
        let probs = self.action_probs(&self.state)?;
        let dist = WeightedIndex::new(&probs).context("policy produced invalid probabilities")?;
        Ok(dist.sample(&mut self.rng))
    }

    pub fn run(&mut self) -> Result<TrainingSummary> {
        loop {
            if let Some(max_frames) = self.config.max_frames {
                if self.session.frame_idx() >= max_frames {
                    info!(frames = max_frames, "frame limit reached");
                    return Ok(self.session.summary(false));
                }
            }
            if self.play_step()? {
                info!(
                    "Completed in {} steps and {} episodes",
                    self.session.frame_idx(),
                    self.session.games()
                );
                return Ok(self.session.summary(true));
            }
            self.metrics.flush_if_due()?;
        }
    }

    /// One environment step plus, when the batch is full, one policy update.
    /// Returns whether the run is solved.
    pub fn play_step(&mut self) -> Result<bool> {
        let step_idx = self.session.advance_frame();
        let action = self.sample_action()?;
        let outcome = self
            .env
            .step(action)
            .with_context(|| format!("environment step with action {action}"))?;
        self.episode_reward += outcome.reward;

        let state = std::mem::replace(&mut self.state, outcome.observation);
        for exp in self.window.push(state, action, outcome.reward, outcome.done) {
            self.reward_sum += exp.reward as f64;
            self.reward_count += 1;
            let baseline = self.reward_sum / self.reward_count as f64;
            self.metrics.add_scalar("baseline", baseline, step_idx);
            self.batch_states.push(exp.state);
            self.batch_actions.push(exp.action);
            self.batch_scales.push(exp.reward - baseline as f32);
        }

        if outcome.done {
            let reward = self.episode_reward;
            let report = self.session.record_episode(reward);
            info!(
                "{} steps, {:.2}: reward, {:.2}: reward_100, {} episodes",
                step_idx, reward, report.mean_reward, report.games
            );
            self.metrics.add_scalar("reward", reward as f64, step_idx);
            self.metrics.add_scalar("reward_100", report.mean_reward as f64, step_idx);
            self.metrics.add_scalar("episodes", report.games as f64, step_idx);
            if report.solved {
                return Ok(true);
            }
            self.state = self.env.reset().context("environment reset")?;
            self.episode_reward = 0.0;
        }

        if self.batch_states.len() < self.config.batch_size {
            return Ok(false);
        }
        let stats = self.train_batch()?;
        self.log_batch(&stats, step_idx);
        Ok(false)
    }

    fn log_batch(&mut self, stats: &BatchStats, step_idx: u64) {
        let mean_scale =
            self.batch_scales.iter().sum::<f32>() / self.batch_scales.len().max(1) as f32;
        let m = &mut self.metrics;
        m.add_scalar("entropy", stats.entropy as f64, step_idx);
        m.add_scalar("batch_scales", mean_scale as f64, step_idx);
        m.add_scalar("loss_entropy", stats.loss_entropy as f64, step_idx);
        m.add_scalar("loss_policy", stats.loss_policy as f64, step_idx);
        m.add_scalar("total_loss", stats.total_loss as f64, step_idx);
        m.add_scalar("kl", stats.kl as f64, step_idx);
        m.add_scalar("grad_l2", stats.grad_l2 as f64, step_idx);
        m.add_scalar("grad_max", stats.grad_max as f64, step_idx);

        self.batch_states.clear();
        self.batch_actions.clear();
        self.batch_scales.clear();
    }

    /// Policy-gradient step on the accumulated batch.
    pub fn train_batch(&mut self) -> Result<BatchStats> {
        let n = self.batch_states.len();
        let obs_len = self.env.observation_len();
        let flat: Vec<f32> = self.batch_states.iter().flatten().copied().collect();
        let actions: Vec<u32> = self.batch_actions.iter().map(|&a| a as u32).collect();

        let states_v = Tensor::from_vec(flat, (n, obs_len), &self.device)?;
        let actions_v = Tensor::from_vec(actions, n, &self.device)?;
        let scales_v = Tensor::from_slice(&self.batch_scales, n, &self.device)?;

        let logits_v = self.net.output(&states_v)?;
        let log_prob_v = ops::log_softmax(&logits_v, D::Minus1)?;
        let log_prob_actions_v = log_prob_v.gather(&actions_v.unsqueeze(1)?, 1)?.squeeze(1)?;
        let loss_policy_v = (&scales_v * &log_prob_actions_v)?.mean_all()?.neg()?;

        let prob_v = ops::softmax(&logits_v, D::Minus1)?;
        let entropy_v = (&prob_v * &log_prob_v)?.sum(1)?.mean_all()?.neg()?;
        let entropy_loss_v = entropy_v.affine(-self.config.entropy_beta, 0.0)?;
        let loss_v = (&loss_policy_v + &entropy_loss_v)?;

        let grads = loss_v.backward()?;
        let (grad_l2, grad_max) = gradient_stats(&grads, &self.net.var_map)?;
        self.optimizer.step(&grads)?;

        let new_prob_v = ops::softmax(&self.net.output(&states_v)?, D::Minus1)?.detach();
        let prob_v = prob_v.detach();
        let kl_v = ((&new_prob_v / &prob_v)?.log()? * &prob_v)?
            .sum(1)?
            .mean_all()?
            .neg()?;

        Ok(BatchStats {
            loss_policy: loss_policy_v.to_scalar::<f32>()?,
            loss_entropy: entropy_loss_v.to_scalar::<f32>()?,
            total_loss: loss_v.to_scalar::<f32>()?,
            entropy: entropy_v.to_scalar::<f32>()?,
            kl: kl_v.to_scalar::<f32>()?,
            grad_l2,
            grad_max,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cartpole::CartPole;

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-5
    }

    #[test]
    fn discounted_returns_accumulate_backwards() {
        let out = discounted_returns(&[1.0, 1.0, 1.0], 0.5);
        assert_eq!(out, vec![1.75, 1.5, 1.0]);
        assert!(discounted_returns(&[], 0.9).is_empty());
    }

    #[test]
    fn window_emits_after_n_steps_and_drains_on_done() {
        let mut window = NStepWindow::new(2, 0.5);
        assert!(window.push(vec![0.0], 0, 1.0, false).is_empty());

        let first = window.push(vec![1.0], 1, 2.0, false);
        assert_eq!(
            first,
            vec![NStepExperience {
                state: vec![0.0],
                action: 0,
                reward: 2.0
            }]
        );
        assert_eq!(window.len(), 1);

        let tail = window.push(vec![2.0], 0, 4.0, true);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].state, vec![1.0]);
        assert!(approx(tail[0].reward, 4.0));
        assert_eq!(tail[1].state, vec![2.0]);
        assert!(approx(tail[1].reward, 4.0));
        assert!(window.is_empty());
    }

    #[test]
    fn single_step_window_passes_rewards_through() {
        let mut window = NStepWindow::new(1, 0.99);
        let out = window.push(vec![0.5], 1, 3.0, false);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].reward, 3.0);
    }

    fn trainer(max_frames: u64) -> PgTrainer<CartPole> {
        let config = PgConfig {
            hidden_size: 16,
            learning_rate: 1e-2,
            max_frames: Some(max_frames),
            seed: Some(4),
            ..Default::default()
        };
        let dir = std::env::temp_dir().join("dqn-replay-pg-unused");
        PgTrainer::new(
            config,
            CartPole::new(200, Some(4)),
            &Device::Cpu,
            ScalarLog::new(dir, "pg"),
        )
        .unwrap()
    }

    #[test]
    fn action_probs_form_a_distribution() {
        let t = trainer(1);
        let probs = t.action_probs(&vec![0.01, -0.02, 0.03, 0.0]).unwrap();
        assert_eq!(probs.len(), 2);
        assert!(approx(probs.iter().sum(), 1.0));
        assert!(probs.iter().all(|&p| p > 0.0));
    }

    #[test]
    fn run_updates_policy_and_logs_batch_stats() {
        let mut t = trainer(120);
        let before = t.net().named_parameters().unwrap();
        let summary = t.run().unwrap();

        assert_eq!(summary.frames, 120);
        assert!(!summary.solved);
        for tag in ["loss_policy", "entropy", "kl", "grad_l2", "grad_max", "baseline", "reward"] {
            assert!(t.metrics().last(tag).is_some(), "missing {tag}");
        }
        let entropy = t.metrics().last("entropy").unwrap();
        assert!(entropy > 0.0 && entropy <= 2f64.ln() + 1e-6);

        let after = t.net().named_parameters().unwrap();
        let changed = before.iter().zip(&after).any(|((_, a), (_, b))| {
            a.flatten_all().unwrap().to_vec1::<f32>().unwrap()
                != b.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        });
        assert!(changed);
    }
}
