use candle_core::{D, Tensor};
use candle_nn::loss;

use crate::{
    buffer::BatchTensors,
    network::{Frozen, QNetwork, TargetNetwork},
};

/// Value of the action actually taken, `online(states)[i][actions[i]]`.
pub fn predicted_values(batch: &BatchTensors, online: &impl QNetwork) -> candle_core::Result<Tensor> {
    let q_values = online.q_values(&batch.states)?;
    q_values.gather(&batch.actions.unsqueeze(1)?, 1)?.squeeze(1)
}

/// One-step bootstrapped regression targets:
/// `reward + gamma * max_a target(next_state)[a]`, with the bootstrap forced
/// to zero on terminal transitions.
pub fn expected_values<N: QNetwork>(
    batch: &BatchTensors,
    target: &TargetNetwork<N>,
    gamma: f64,
) -> candle_core::Result<Frozen> {
    let next_q = target.evaluate(&batch.next_states)?;
    let bootstrap = next_q.map(|q| {
        let best = q.max(D::Minus1)?;
        batch.dones.where_cond(&best.zeros_like()?, &best)
    })?;
    bootstrap.map(|b| b.affine(gamma, 0.0)?.add(&batch.rewards))
}

/// Mean squared TD error between the online prediction and the frozen target.
pub fn calc_loss<N: QNetwork>(
    batch: &BatchTensors,
    online: &impl QNetwork,
    target: &TargetNetwork<N>,
    gamma: f64,
) -> candle_core::Result<Tensor> {
    let predicted = predicted_values(batch, online)?;
    let expected = expected_values(batch, target, gamma)?;
    loss::mse(&predicted, expected.tensor())
}
