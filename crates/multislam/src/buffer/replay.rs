//! Bounded FIFO replay memory for perception supervision.

use crate::map::Pose;
use ndarray::{Array2, Array3};
use rand::seq::index;
use rand::Rng;

/// Ground-truth targets for one perception sample
#[derive(Clone, Debug, PartialEq)]
pub struct ReplayTarget {
    /// Egocentric obstacle projection, `[V, V]`
    pub projection: Array2<f32>,
    /// Egocentric explored mask, `[V, V]`
    pub explored: Array2<f32>,
    /// Sensor pose error
    pub pose_error: Pose,
}

/// One supervised perception sample
#[derive(Clone, Debug, PartialEq)]
pub struct ReplaySample {
    /// Observation before the step, `[C, H, W]`
    pub prev_obs: Array3<f32>,
    /// Observation after the step, `[C, H, W]`
    pub obs: Array3<f32>,
    /// Sensor pose delta between the two observations
    pub pose_delta: Pose,
    pub target: ReplayTarget,
}

/// Ring of fixed capacity. Once full, each push overwrites the oldest entry.
#[derive(Clone, Debug)]
pub struct FifoMemory<T> {
    entries: Vec<T>,
    capacity: usize,
    /// Index of the oldest entry once the ring is full
    head: usize,
}

impl<T> FifoMemory<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            head: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() == self.capacity
    }

    /// Insert in O(1), evicting the oldest entry when full.
    ///
    /// A zero-capacity memory drops everything.
    pub fn push(&mut self, item: T) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() < self.capacity {
            self.entries.push(item);
        } else {
            self.entries[self.head] = item;
            self.head = (self.head + 1) % self.capacity;
        }
    }

    /// Draw up to `batch_size` distinct entries uniformly at random.
    ///
    /// Saturates at the current occupancy; an empty memory yields an empty batch.
    pub fn sample<R: Rng + ?Sized>(&self, batch_size: usize, rng: &mut R) -> Vec<&T> {
        let amount = batch_size.min(self.entries.len());
        index::sample(rng, self.entries.len(), amount)
            .into_iter()
            .map(|i| &self.entries[i])
            .collect()
    }

    /// Entries from oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        let (newer, older) = self.entries.split_at(self.head);
        older.iter().chain(newer.iter())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.head = 0;
    }
}
