//! Deep Q-learning with an experience-replay buffer and a periodically
//! synced target network, plus a policy-gradient trainer for CartPole.

pub mod agent;
pub mod buffer;
pub mod cartpole;
pub mod config;
pub mod device;
pub mod environment;
pub mod experience;
pub mod loss;
pub mod metrics;
pub mod network;
pub mod pg;
pub mod session;
pub mod trainer;
