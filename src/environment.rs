use anyhow::{Result, bail};
use rand::Rng;

use crate::{cartpole::CartPole, experience::Observation};

/// Discrete action space `0..n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscreteSpace {
    pub n: usize,
}

impl DiscreteSpace {
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        rng.random_range(0..self.n)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub observation: Observation,
    pub reward: f32,
    pub done: bool,
}

pub trait Environment {
    fn reset(&mut self) -> Result<Observation>;

    fn step(&mut self, action: usize) -> Result<StepOutcome>;

    /// Uniformly random action drawn from the environment's own generator.
    fn sample_action(&mut self) -> usize;

    fn action_space(&self) -> DiscreteSpace;

    fn observation_len(&self) -> usize;
}

impl<E: Environment + ?Sized> Environment for Box<E> {
    fn reset(&mut self) -> Result<Observation> {
        (**self).reset()
    }

    fn step(&mut self, action: usize) -> Result<StepOutcome> {
        (**self).step(action)
    }

    fn sample_action(&mut self) -> usize {
        (**self).sample_action()
    }

    fn action_space(&self) -> DiscreteSpace {
        (**self).action_space()
    }

    fn observation_len(&self) -> usize {
        (**self).observation_len()
    }
}

/// Mean episode reward at which an environment counts as solved.
pub fn reward_threshold(name: &str) -> Option<f32> {
    match name {
        "CartPole-v0" => Some(195.0),
        "CartPole-v1" => Some(475.0),
        "PongNoFrameskip-v4" => Some(19.5),
        _ => None,
    }
}

/// Builds an environment by its registry name.
pub fn make(name: &str, seed: Option<u64>) -> Result<Box<dyn Environment>> {
    match name {
        "CartPole-v0" => Ok(Box::new(CartPole::new(200, seed))),
        "CartPole-v1" => Ok(Box::new(CartPole::new(500, seed))),
        other if other.contains("NoFrameskip") => bail!(
            "Atari environment {other} has no native backend; try --env CartPole-v0"
        ),
        other => bail!("unknown environment {other}"),
    }
}
