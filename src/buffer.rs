use std::collections::VecDeque;

use anyhow::{Result, bail, ensure};
use candle_core::{Device, Tensor};
use rand::{Rng, seq::index};

use crate::experience::{Experience, Observation};

/// Source of distinct buffer indices for [`ExperienceBuffer::sample`].
///
/// Every `rand::Rng` is a sampler. Tests can plug in a fixed index sequence
/// instead.
pub trait IndexSampler {
    /// Returns `amount` distinct indices in `0..len`, in draw order.
    fn sample_indices(&mut self, len: usize, amount: usize) -> Vec<usize>;
}

impl<R: Rng + ?Sized> IndexSampler for R {
    fn sample_indices(&mut self, len: usize, amount: usize) -> Vec<usize> {
        index::sample(self, len, amount).into_vec()
    }
}

/// Five parallel columns drawn from the buffer, in draw order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub states: Vec<Observation>,
    pub actions: Vec<usize>,
    pub rewards: Vec<f32>,
    pub dones: Vec<bool>,
    pub next_states: Vec<Observation>,
}

impl Batch {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            states: Vec::with_capacity(capacity),
            actions: Vec::with_capacity(capacity),
            rewards: Vec::with_capacity(capacity),
            dones: Vec::with_capacity(capacity),
            next_states: Vec::with_capacity(capacity),
        }
    }

    fn push(&mut self, experience: &Experience) {
        self.states.push(experience.state.clone());
        self.actions.push(experience.action);
        self.rewards.push(experience.reward);
        self.dones.push(experience.done);
        self.next_states.push(experience.next_state.clone());
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Packs the columns into tensors on `device`. States become `(B, obs)`
    /// f32, actions `(B,)` u32, rewards `(B,)` f32 and dones a `(B,)` u8 mask.
    pub fn to_tensors(&self, device: &Device) -> candle_core::Result<BatchTensors> {
        let batch_size = self.len();
        let obs_len = self.states.first().map_or(0, Vec::len);

        let mut states = Vec::with_capacity(batch_size * obs_len);
        let mut next_states = Vec::with_capacity(batch_size * obs_len);
        for (state, next_state) in self.states.iter().zip(&self.next_states) {
            states.extend_from_slice(state);
            next_states.extend_from_slice(next_state);
        }
        let actions: Vec<u32> = self.actions.iter().map(|&a| a as u32).collect();
        let dones: Vec<u8> = self.dones.iter().map(|&d| u8::from(d)).collect();

        Ok(BatchTensors {
            states: Tensor::from_vec(states, (batch_size, obs_len), device)?,
            actions: Tensor::from_vec(actions, batch_size, device)?,
            rewards: Tensor::from_slice(&self.rewards, batch_size, device)?,
            dones: Tensor::from_vec(dones, batch_size, device)?,
            next_states: Tensor::from_vec(next_states, (batch_size, obs_len), device)?,
        })
    }
}

pub struct BatchTensors {
    pub states: Tensor,
    pub actions: Tensor,
    pub rewards: Tensor,
    pub dones: Tensor,
    pub next_states: Tensor,
}

/// Fixed-capacity FIFO replay memory with uniform sampling without
/// replacement.
#[derive(Debug, Clone)]
pub struct ExperienceBuffer {
    buffer: VecDeque<Experience>,
    capacity: usize,
}

impl ExperienceBuffer {
    pub fn new(capacity: usize) -> Result<Self> {
        ensure!(capacity > 0, "experience buffer capacity must be positive");
        Ok(Self {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
        })
    }

    pub fn append(&mut self, experience: Experience) {
        if self.buffer.len() >= self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(experience);
    }

    pub fn sample(&self, batch_size: usize, sampler: &mut impl IndexSampler) -> Result<Batch> {
        let len = self.buffer.len();
        if batch_size > len {
            bail!("cannot sample {batch_size} experiences from a buffer holding {len}");
        }

        let indices = sampler.sample_indices(len, batch_size);
        ensure!(
            indices.len() == batch_size,
            "sampler returned {} indices, expected {batch_size}",
            indices.len()
        );

        let mut seen = vec![false; len];
        let mut batch = Batch::with_capacity(batch_size);
        for idx in indices {
            let Some(experience) = self.buffer.get(idx) else {
                bail!("sampled index {idx} out of range for buffer of length {len}");
            };
            ensure!(!seen[idx], "sampler repeated index {idx}");
            seen[idx] = true;
            batch.push(experience);
        }
        Ok(batch)
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Experience> {
        self.buffer.iter()
    }
}
