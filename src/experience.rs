/// Flat observation vector as produced by an [`crate::environment::Environment`].
pub type Observation = Vec<f32>;

/// One environment transition. Nothing hands out mutable access once it is
/// in the buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Experience {
    pub state: Observation,
    pub action: usize,
    pub reward: f32,
    pub done: bool,
    pub next_state: Observation,
}

impl Experience {
    pub fn new(
        state: Observation,
        action: usize,
        reward: f32,
        done: bool,
        next_state: Observation,
    ) -> Self {
        Self {
            state,
            action,
            reward,
            done,
            next_state,
        }
    }
}
