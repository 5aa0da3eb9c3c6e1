use std::f32::consts::PI;

use anyhow::{Result, bail};
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::{
    environment::{DiscreteSpace, Environment, StepOutcome},
    experience::Observation,
};

const GRAVITY: f32 = 9.8;
const MASS_CART: f32 = 1.0;
const MASS_POLE: f32 = 0.1;
const TOTAL_MASS: f32 = MASS_CART + MASS_POLE;
// half the pole's length
const LENGTH: f32 = 0.5;
const POLE_MASS_LENGTH: f32 = MASS_POLE * LENGTH;
const FORCE_MAG: f32 = 10.0;
const TAU: f32 = 0.02;
const THETA_THRESHOLD: f32 = 12.0 * 2.0 * PI / 360.0;
const X_THRESHOLD: f32 = 2.4;

/// Cart-pole balancing task with two actions (push left, push right) and
/// observation `[x, x_dot, theta, theta_dot]`.
pub struct CartPole {
    state: [f32; 4],
    steps: usize,
    max_steps: usize,
    rng: StdRng,
}

impl CartPole {
    pub fn new(max_steps: usize, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            state: [0.0; 4],
            steps: 0,
            max_steps,
            rng,
        }
    }

    fn failed(&self) -> bool {
        let [x, _, theta, _] = self.state;
        x.abs() > X_THRESHOLD || theta.abs() > THETA_THRESHOLD
    }
}

impl Environment for CartPole {
    fn reset(&mut self) -> Result<Observation> {
        for v in self.state.iter_mut() {
            *v = self.rng.random_range(-0.05..0.05);
        }
        self.steps = 0;
        Ok(self.state.to_vec())
    }

    fn step(&mut self, action: usize) -> Result<StepOutcome> {
        let force = match action {
            0 => -FORCE_MAG,
            1 => FORCE_MAG,
            other => bail!("invalid cart-pole action {other}"),
        };
        let [x, x_dot, theta, theta_dot] = self.state;
        let (sin_theta, cos_theta) = theta.sin_cos();

        let temp = (force + POLE_MASS_LENGTH * theta_dot * theta_dot * sin_theta) / TOTAL_MASS;
        let theta_acc = (GRAVITY * sin_theta - cos_theta * temp)
            / (LENGTH * (4.0 / 3.0 - MASS_POLE * cos_theta * cos_theta / TOTAL_MASS));
        let x_acc = temp - POLE_MASS_LENGTH * theta_acc * cos_theta / TOTAL_MASS;

        self.state = [
            x + TAU * x_dot,
            x_dot + TAU * x_acc,
            theta + TAU * theta_dot,
            theta_dot + TAU * theta_acc,
        ];
        self.steps += 1;

        Ok(StepOutcome {
            observation: self.state.to_vec(),
            reward: 1.0,
            done: self.failed() || self.steps >= self.max_steps,
        })
    }

    fn sample_action(&mut self) -> usize {
        self.action_space().sample(&mut self.rng)
    }

    fn action_space(&self) -> DiscreteSpace {
        DiscreteSpace { n: 2 }
    }

    fn observation_len(&self) -> usize {
        4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_is_near_upright() {
        let mut env = CartPole::new(200, Some(11));
        let obs = env.reset().unwrap();
        assert_eq!(obs.len(), 4);
        assert!(obs.iter().all(|v| v.abs() <= 0.05));
    }

    #[test]
    fn constant_push_topples_pole() {
        let mut env = CartPole::new(200, Some(5));
        env.reset().unwrap();
        let mut steps = 0;
        loop {
            let outcome = env.step(1).unwrap();
            steps += 1;
            assert_eq!(outcome.reward, 1.0);
            if outcome.done {
                break;
            }
        }
        // pushing one way cannot balance for long
        assert!(steps < 100, "took {steps} steps");
    }

    #[test]
    fn episode_is_truncated_at_step_limit() {
        let mut env = CartPole::new(3, Some(2));
        env.reset().unwrap();
        assert!(!env.step(0).unwrap().done);
        assert!(!env.step(1).unwrap().done);
        assert!(env.step(0).unwrap().done);
    }

    #[test]
    fn rejects_unknown_action() {
        let mut env = CartPole::new(200, Some(0));
        env.reset().unwrap();
        assert!(env.step(2).is_err());
    }

    #[test]
    fn same_seed_same_trajectory() {
        let mut a = CartPole::new(200, Some(9));
        let mut b = CartPole::new(200, Some(9));
        assert_eq!(a.reset().unwrap(), b.reset().unwrap());
        for _ in 0..5 {
            let (ua, ub) = (a.sample_action(), b.sample_action());
            assert_eq!(ua, ub);
            assert_eq!(a.step(ua).unwrap(), b.step(ub).unwrap());
        }
    }
}
