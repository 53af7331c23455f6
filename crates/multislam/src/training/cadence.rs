//! Episode cadence: which local steps close a global step, flush the local
//! loss, or end the episode.
//!
//! The cadence is an explicit state machine over (global step, local step)
//! instead of modulo arithmetic on one raw counter.

use ndarray::Array1;

/// Position of one local step inside an episode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StepTick {
    /// Local steps since the episode started
    pub step: usize,
    /// Index of the enclosing global step within the episode
    pub global_step: usize,
    /// Index of this local step within its global step
    pub local_step: usize,
    num_local_steps: usize,
    max_episode_length: usize,
}

impl StepTick {
    /// The last local step of a global step: fuse, reward and pick a new goal.
    pub fn closes_global_step(&self) -> bool {
        self.local_step + 1 == self.num_local_steps
    }

    /// Whether the accumulated local loss is flushed after this step.
    pub fn triggers_local_update(&self, update_freq: usize) -> bool {
        update_freq > 0 && (self.local_step + 1) % update_freq == 0
    }

    /// The last local step of the episode: maps and poses are reinitialized.
    pub fn ends_episode(&self) -> bool {
        self.step + 1 == self.max_episode_length
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    /// Inside global step `global`, about to run local step `local`
    Running { global: usize, local: usize },
    Finished,
}

/// Iterator over the local steps of one episode.
#[derive(Clone, Debug)]
pub struct EpisodeCadence {
    num_local_steps: usize,
    max_episode_length: usize,
    step: usize,
    phase: Phase,
}

impl EpisodeCadence {
    pub fn new(max_episode_length: usize, num_local_steps: usize) -> Self {
        let phase = if max_episode_length == 0 || num_local_steps == 0 {
            Phase::Finished
        } else {
            Phase::Running { global: 0, local: 0 }
        };
        Self {
            num_local_steps,
            max_episode_length,
            step: 0,
            phase,
        }
    }
}

impl Iterator for EpisodeCadence {
    type Item = StepTick;

    fn next(&mut self) -> Option<StepTick> {
        let Phase::Running { global, local } = self.phase else {
            return None;
        };
        let tick = StepTick {
            step: self.step,
            global_step: global,
            local_step: local,
            num_local_steps: self.num_local_steps,
            max_episode_length: self.max_episode_length,
        };

        self.step += 1;
        self.phase = if tick.ends_episode() {
            Phase::Finished
        } else if tick.closes_global_step() {
            Phase::Running {
                global: global + 1,
                local: 0,
            }
        } else {
            Phase::Running {
                global,
                local: local + 1,
            }
        };
        Some(tick)
    }
}

/// Continuation mask carried across the local steps of one global step.
///
/// Every per-step mask is multiplied in; consuming the mask at a global
/// boundary hands out the product and resets it to ones.
#[derive(Clone, Debug, PartialEq)]
pub struct ContinuationMask {
    values: Array1<f32>,
}

impl ContinuationMask {
    pub fn new(num_agents: usize) -> Self {
        Self {
            values: Array1::ones(num_agents),
        }
    }

    /// Per-step mask: 0 where the environment reported done, else 1.
    pub fn from_dones(dones: &[bool]) -> Array1<f32> {
        dones.iter().map(|&d| if d { 0.0 } else { 1.0 }).collect()
    }

    pub fn observe(&mut self, step_masks: &Array1<f32>) {
        self.values *= step_masks;
    }

    pub fn values(&self) -> &Array1<f32> {
        &self.values
    }

    pub fn consume(&mut self) -> Array1<f32> {
        let ones = Array1::ones(self.values.len());
        std::mem::replace(&mut self.values, ones)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    #[test]
    fn test_cadence_walks_global_and_local_steps() {
        let ticks: Vec<StepTick> = EpisodeCadence::new(7, 3).collect();
        assert_eq!(ticks.len(), 7);

        let positions: Vec<(usize, usize)> =
            ticks.iter().map(|t| (t.global_step, t.local_step)).collect();
        assert_eq!(
            positions,
            vec![(0, 0), (0, 1), (0, 2), (1, 0), (1, 1), (1, 2), (2, 0)]
        );

        let closing: Vec<usize> = ticks
            .iter()
            .filter(|t| t.closes_global_step())
            .map(|t| t.step)
            .collect();
        assert_eq!(closing, vec![2, 5]);
        assert!(ticks[6].ends_episode());
        assert!(ticks[..6].iter().all(|t| !t.ends_episode()));
    }

    #[test]
    fn test_local_update_guard() {
        let flushes: Vec<usize> = EpisodeCadence::new(10, 5)
            .filter(|t| t.triggers_local_update(2))
            .map(|t| t.step)
            .collect();
        // local steps 1 and 3 of each global step
        assert_eq!(flushes, vec![1, 3, 6, 8]);
    }

    #[test]
    fn test_empty_cadence() {
        assert_eq!(EpisodeCadence::new(0, 3).count(), 0);
        assert_eq!(EpisodeCadence::new(4, 0).count(), 0);
    }

    #[test]
    fn test_continuation_mask_protocol() {
        let mut mask = ContinuationMask::new(3);
        mask.observe(&ContinuationMask::from_dones(&[false, true, false]));
        mask.observe(&ContinuationMask::from_dones(&[false, false, false]));
        assert_eq!(mask.values(), &arr1(&[1.0, 0.0, 1.0]));

        assert_eq!(mask.consume(), arr1(&[1.0, 0.0, 1.0]));
        assert_eq!(mask.values(), &arr1(&[1.0, 1.0, 1.0]));
    }
}
