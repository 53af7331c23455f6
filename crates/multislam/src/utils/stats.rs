//! Bounded rolling statistics.

use std::collections::VecDeque;

/// Keeps the most recent `capacity` values and reports windowed statistics.
///
/// Push is O(1); once full the oldest value is dropped.
#[derive(Clone, Debug)]
pub struct RollingWindow<T> {
    values: VecDeque<T>,
    capacity: usize,
}

impl<T: Copy + PartialOrd + Into<f64>> RollingWindow<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, value: T) {
        if self.capacity == 0 {
            return;
        }
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    pub fn extend(&mut self, values: impl IntoIterator<Item = T>) {
        for v in values {
            self.push(v);
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.values.iter()
    }

    pub fn mean(&self) -> Option<f64> {
        if self.values.is_empty() {
            return None;
        }
        let sum: f64 = self.values.iter().map(|&v| v.into()).sum();
        Some(sum / self.values.len() as f64)
    }

    /// Middle value; the mean of the two middle values for even lengths.
    pub fn median(&self) -> Option<f64> {
        if self.values.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = self.values.iter().map(|&v| v.into()).collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 0 {
            Some((sorted[mid - 1] + sorted[mid]) / 2.0)
        } else {
            Some(sorted[mid])
        }
    }

    pub fn min(&self) -> Option<T> {
        self.values
            .iter()
            .copied()
            .reduce(|a, b| if b < a { b } else { a })
    }

    pub fn max(&self) -> Option<T> {
        self.values
            .iter()
            .copied()
            .reduce(|a, b| if b > a { b } else { a })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_window() {
        let w: RollingWindow<f32> = RollingWindow::new(3);
        assert!(w.is_empty());
        assert_eq!(w.mean(), None);
        assert_eq!(w.median(), None);
        assert_eq!(w.min(), None);
        assert_eq!(w.max(), None);
    }

    #[test]
    fn test_window_drops_oldest() {
        let mut w = RollingWindow::new(3);
        w.extend([1.0f32, 2.0, 3.0, 10.0]);
        assert_eq!(w.len(), 3);
        assert_eq!(w.iter().copied().collect::<Vec<_>>(), vec![2.0, 3.0, 10.0]);
        assert_eq!(w.mean(), Some(5.0));
        assert_eq!(w.median(), Some(3.0));
        assert_eq!(w.min(), Some(2.0));
        assert_eq!(w.max(), Some(10.0));
    }

    #[test]
    fn test_even_median() {
        let mut w = RollingWindow::new(10);
        w.extend([4.0f64, 1.0, 3.0, 2.0]);
        assert_eq!(w.median(), Some(2.5));
    }

    #[test]
    fn test_zero_capacity() {
        let mut w = RollingWindow::new(0);
        w.push(1.0f32);
        assert!(w.is_empty());
    }
}
