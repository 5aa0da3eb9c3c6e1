/// Trailing window used for the mean episode reward.
pub const MEAN_WINDOW: usize = 100;

/// Linear decay from `start` to `final_value` over `decay_last_frame` frames,
/// then flat.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpsilonSchedule {
    pub start: f64,
    pub final_value: f64,
    pub decay_last_frame: u64,
}

impl EpsilonSchedule {
    pub fn value(&self, frame_idx: u64) -> f64 {
        let decayed = self.start - frame_idx as f64 / self.decay_last_frame as f64;
        decayed.max(self.final_value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpisodeReport {
    pub reward: f32,
    pub games: usize,
    pub mean_reward: f32,
    /// Previous best when this episode raised the trailing mean, or `None`
    /// for the very first measurement.
    pub previous_best: Option<f32>,
    pub improved: bool,
    pub solved: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingSummary {
    pub frames: u64,
    pub games: usize,
    pub best_mean_reward: Option<f32>,
    pub solved: bool,
}

/// Mutable state of one training run: frame counter and reward history.
#[derive(Debug, Clone)]
pub struct TrainingSession {
    frame_idx: u64,
    total_rewards: Vec<f32>,
    best_mean_reward: Option<f32>,
    reward_bound: f32,
}

impl TrainingSession {
    pub fn new(reward_bound: f32) -> Self {
        Self {
            frame_idx: 0,
            total_rewards: Vec::new(),
            best_mean_reward: None,
            reward_bound,
        }
    }

    pub fn summary(&self, solved: bool) -> TrainingSummary {
        TrainingSummary {
            frames: self.frame_idx,
            games: self.games(),
            best_mean_reward: self.best_mean_reward,
            solved,
        }
    }

    /// Moves to the next frame and returns its index (1-based).
    pub fn advance_frame(&mut self) -> u64 {
        self.frame_idx += 1;
        self.frame_idx
    }

    pub fn frame_idx(&self) -> u64 {
        self.frame_idx
    }

    pub fn reward_bound(&self) -> f32 {
        self.reward_bound
    }

    pub fn games(&self) -> usize {
        self.total_rewards.len()
    }

    pub fn best_mean_reward(&self) -> Option<f32> {
        self.best_mean_reward
    }

    pub fn mean_reward(&self) -> Option<f32> {
        trailing_mean(&self.total_rewards, MEAN_WINDOW)
    }

    pub fn record_episode(&mut self, reward: f32) -> EpisodeReport {
        self.total_rewards.push(reward);
        let mean_reward = self.mean_reward().unwrap_or(reward);
        let previous_best = self.best_mean_reward;
        let improved = previous_best.is_none_or(|best| best < mean_reward);
        if improved {
            self.best_mean_reward = Some(mean_reward);
        }
        EpisodeReport {
            reward,
            games: self.games(),
            mean_reward,
            previous_best,
            improved,
            solved: mean_reward > self.reward_bound,
        }
    }
}

/// Mean of the last `window` values.
pub fn trailing_mean(values: &[f32], window: usize) -> Option<f32> {
    if values.is_empty() || window == 0 {
        return None;
    }
    let tail = &values[values.len().saturating_sub(window)..];
    Some(tail.iter().sum::<f32>() / tail.len() as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule() -> EpsilonSchedule {
        EpsilonSchedule {
            start: 1.0,
            final_value: 0.02,
            decay_last_frame: 100_000,
        }
    }

    #[test]
    fn epsilon_decays_linearly_then_floors() {
        let s = schedule();
        assert_eq!(s.value(0), 1.0);
        assert!((s.value(50_000) - 0.5).abs() < 1e-12);
        assert!((s.value(98_000) - 0.02).abs() < 1e-12);
        assert!(s.value(98_000) >= 0.02);
        assert_eq!(s.value(99_000), 0.02);
        assert_eq!(s.value(1_000_000), 0.02);
    }

    #[test]
    fn trailing_mean_uses_last_window() {
        assert_eq!(trailing_mean(&[], 100), None);
        assert_eq!(trailing_mean(&[1.0, 3.0], 100), Some(2.0));
        assert_eq!(trailing_mean(&[100.0, 1.0, 3.0], 2), Some(2.0));
    }

    #[test]
    fn first_episode_sets_best() {
        let mut session = TrainingSession::new(10.0);
        let report = session.record_episode(-21.0);
        assert!(report.improved);
        assert_eq!(report.previous_best, None);
        assert_eq!(session.best_mean_reward(), Some(-21.0));
    }

    #[test]
    fn best_only_moves_on_improvement() {
        let mut session = TrainingSession::new(10.0);
        session.record_episode(4.0);
        let worse = session.record_episode(0.0);
        assert!(!worse.improved);
        assert_eq!(session.best_mean_reward(), Some(4.0));

        let better = session.record_episode(20.0);
        assert!(better.improved);
        assert_eq!(better.previous_best, Some(4.0));
        assert_eq!(better.mean_reward, 8.0);
        assert_eq!(better.games, 3);
        assert!(!better.solved);
    }

    #[test]
    fn solved_when_mean_exceeds_bound() {
        let mut session = TrainingSession::new(1.5);
        assert!(!session.record_episode(1.5).solved);
        assert!(session.record_episode(2.0).solved);
    }

    #[test]
    fn frames_count_from_one() {
        let mut session = TrainingSession::new(0.0);
        assert_eq!(session.frame_idx(), 0);
        assert_eq!(session.advance_frame(), 1);
        assert_eq!(session.advance_frame(), 2);
        assert_eq!(session.summary(false).frames, 2);
        assert_eq!(session.reward_bound(), 0.0);
    }
}
