use anyhow::{Context, Result};
use candle_core::{D, Device, Tensor};
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::{
    buffer::ExperienceBuffer,
    environment::Environment,
    experience::{Experience, Observation},
    network::QNetwork,
};

/// Plays one environment under an epsilon-greedy policy and feeds every
/// transition into the replay buffer. Epsilon is the caller's business.
pub struct Agent<E> {
    env: E,
    state: Observation,
    total_reward: f32,
    rng: StdRng,
}

impl<E: Environment> Agent<E> {
    pub fn new(mut env: E, seed: Option<u64>) -> Result<Self> {
        let state = env.reset().context("initial environment reset")?;
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Ok(Self {
            env,
            state,
            total_reward: 0.0,
            rng,
        })
    }

    fn reset(&mut self) -> Result<()> {
        self.state = self.env.reset().context("environment reset")?;
        self.total_reward = 0.0;
        Ok(())
    }

    pub fn state(&self) -> &Observation {
        &self.state
    }

    pub fn env(&self) -> &E {
        &self.env
    }

    /// Greedy action for the current state. Ties go to whatever index the
    /// backend's argmax reports, which is not guaranteed stable.
    fn greedy_action(&self, net: &impl QNetwork, device: &Device) -> candle_core::Result<usize> {
        let input = Tensor::from_slice(&self.state, (1, self.state.len()), device)?;
        let q_values = net.q_values(&input)?;
        let action_tensor = q_values.argmax(D::Minus1)?;
        Ok(action_tensor.get(0)?.to_scalar::<u32>()? as usize)
    }

    /// Advances the environment by one step. Returns the episode's total
    /// reward when this step finished it, `None` while it is still running.
    pub fn step(
        &mut self,
        buffer: &mut ExperienceBuffer,
        net: &impl QNetwork,
        epsilon: f64,
        device: &Device,
    ) -> Result<Option<f32>> {
        let action = if self.rng.random::<f64>() < epsilon {
            self.env.sample_action()
        } else {
            self.greedy_action(net, device)?
        };

        let outcome = self
            .env
            .step(action)
            .with_context(|| format!("environment step with action {action}"))?;
        self.total_reward += outcome.reward;

        let state = std::mem::replace(&mut self.state, outcome.observation.clone());
        buffer.append(Experience::new(
            state,
            action,
            outcome.reward,
            outcome.done,
            outcome.observation,
        ));

        if outcome.done {
            let done_reward = self.total_reward;
            self.reset()?;
            return Ok(Some(done_reward));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use anyhow::bail;

    use super::*;
    use crate::{
        environment::{DiscreteSpace, StepOutcome},
        network::tests::ConstantNetwork,
    };

    /// Episodes of fixed length; step `k` of an episode pays reward `k`
    /// unless `zero_reward` is set. Reset observations are negative counters.
    struct ScriptedEnv {
        episode_len: usize,
        zero_reward: bool,
        t: usize,
        resets: usize,
        sampled: usize,
        actions: Vec<usize>,
    }

    impl ScriptedEnv {
        fn new(episode_len: usize) -> Self {
            Self {
                episode_len,
                zero_reward: false,
                t: 0,
                resets: 0,
                sampled: 0,
                actions: Vec::new(),
            }
        }
    }

    impl Environment for ScriptedEnv {
        fn reset(&mut self) -> Result<Observation> {
            self.resets += 1;
            self.t = 0;
            Ok(vec![-(self.resets as f32), 0.0])
        }

        fn step(&mut self, action: usize) -> Result<StepOutcome> {
            if action >= 3 {
                bail!("bad action {action}");
            }
            self.actions.push(action);
            self.t += 1;
            Ok(StepOutcome {
                observation: vec![self.t as f32, action as f32],
                reward: if self.zero_reward { 0.0 } else { self.t as f32 },
                done: self.t == self.episode_len,
            })
        }

        fn sample_action(&mut self) -> usize {
            self.sampled += 1;
            2
        }

        fn action_space(&self) -> DiscreteSpace {
            DiscreteSpace { n: 3 }
        }

        fn observation_len(&self) -> usize {
            2
        }
    }

    struct CountingNetwork {
        calls: Cell<usize>,
        inner: ConstantNetwork,
    }

    impl QNetwork for CountingNetwork {
        fn q_values(&self, states: &Tensor) -> candle_core::Result<Tensor> {
            self.calls.set(self.calls.get() + 1);
            self.inner.q_values(states)
        }
    }

    fn counting(values: Vec<f32>) -> CountingNetwork {
        CountingNetwork {
            calls: Cell::new(0),
            inner: ConstantNetwork(values),
        }
    }

    #[test]
    fn full_exploration_never_consults_network() {
        let mut buffer = ExperienceBuffer::new(100).unwrap();
        let net = counting(vec![0.0, 9.0, 0.0]);
        let mut agent = Agent::new(ScriptedEnv::new(4), Some(1)).unwrap();

        for _ in 0..20 {
            agent.step(&mut buffer, &net, 1.0, &Device::Cpu).unwrap();
        }
        assert_eq!(net.calls.get(), 0);
        assert_eq!(agent.env().sampled, 20);
        assert!(agent.env().actions.iter().all(|&a| a == 2));
    }

    #[test]
    fn greedy_step_takes_argmax() {
        let mut buffer = ExperienceBuffer::new(100).unwrap();
        let net = counting(vec![0.0, 9.0, 0.5]);
        let mut agent = Agent::new(ScriptedEnv::new(4), Some(1)).unwrap();

        for _ in 0..5 {
            agent.step(&mut buffer, &net, 0.0, &Device::Cpu).unwrap();
        }
        assert_eq!(net.calls.get(), 5);
        assert_eq!(agent.env().sampled, 0);
        assert_eq!(agent.env().actions, vec![1; 5]);
    }

    #[test]
    fn reports_reward_only_when_episode_ends() {
        let mut buffer = ExperienceBuffer::new(100).unwrap();
        let net = ConstantNetwork(vec![1.0, 0.0, 0.0]);
        let mut agent = Agent::new(ScriptedEnv::new(3), Some(1)).unwrap();

        let results: Vec<Option<f32>> = (0..7)
            .map(|_| agent.step(&mut buffer, &net, 0.0, &Device::Cpu).unwrap())
            .collect();
        assert_eq!(
            results,
            vec![None, None, Some(6.0), None, None, Some(6.0), None]
        );
        assert_eq!(buffer.len(), 7);
    }

    #[test]
    fn state_is_fresh_reset_after_episode_end() {
        let mut buffer = ExperienceBuffer::new(100).unwrap();
        let net = ConstantNetwork(vec![0.0, 0.0, 1.0]);
        let mut agent = Agent::new(ScriptedEnv::new(2), Some(1)).unwrap();
        assert_eq!(agent.state(), &vec![-1.0, 0.0]);

        assert_eq!(agent.step(&mut buffer, &net, 0.0, &Device::Cpu).unwrap(), None);
        assert_eq!(agent.state(), &vec![1.0, 2.0]);
        assert_eq!(agent.step(&mut buffer, &net, 0.0, &Device::Cpu).unwrap(), Some(3.0));
        assert_eq!(agent.state(), &vec![-2.0, 0.0]);
    }

    #[test]
    fn transitions_chain_states() {
        let mut buffer = ExperienceBuffer::new(100).unwrap();
        let net = ConstantNetwork(vec![1.0, 0.0, 0.0]);
        let mut agent = Agent::new(ScriptedEnv::new(2), Some(1)).unwrap();
        for _ in 0..2 {
            agent.step(&mut buffer, &net, 0.0, &Device::Cpu).unwrap();
        }

        let stored: Vec<&Experience> = buffer.iter().collect();
        assert_eq!(
            *stored[0],
            Experience::new(vec![-1.0, 0.0], 0, 1.0, false, vec![1.0, 0.0])
        );
        assert_eq!(
            *stored[1],
            Experience::new(vec![1.0, 0.0], 0, 2.0, true, vec![2.0, 0.0])
        );
    }

    #[test]
    fn zero_reward_episode_is_not_the_sentinel() {
        let mut buffer = ExperienceBuffer::new(100).unwrap();
        let net = ConstantNetwork(vec![1.0, 0.0, 0.0]);
        let mut env = ScriptedEnv::new(1);
        env.zero_reward = true;
        let mut agent = Agent::new(env, Some(1)).unwrap();

        assert_eq!(agent.step(&mut buffer, &net, 0.0, &Device::Cpu).unwrap(), Some(0.0));
    }
}
