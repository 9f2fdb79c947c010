use std::collections::VecDeque;

/// Fixed-capacity FIFO of samples whose mean is kept current on every push.
///
/// Samples are plain `f64`: both windows hold frame deltas or fps readings,
/// so there is nothing to gain from a type parameter.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    capacity: usize,
    samples: VecDeque<f64>,
    average: f64,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
            average: 0.0,
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
        self.average = self.samples.iter().sum::<f64>() / self.samples.len() as f64;
    }

    /// Mean of the retained samples, 0 when empty.
    pub fn average(&self) -> f64 {
        self.average
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.average = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_grows_past_capacity() {
        let mut window = RollingWindow::new(3);
        for value in 0..10 {
            window.push(value as f64);
            assert!(window.len() <= 3);
        }
        assert_eq!(window.len(), 3);
        assert!((window.average() - 8.0).abs() < 1e-9);
    }

    #[test]
    fn empty_window_averages_to_zero() {
        let mut window = RollingWindow::new(5);
        assert_eq!(window.average(), 0.0);
        window.push(12.0);
        window.clear();
        assert!(window.is_empty());
        assert_eq!(window.average(), 0.0);
    }

    #[test]
    fn zero_capacity_is_treated_as_one() {
        let mut window = RollingWindow::new(0);
        window.push(4.0);
        window.push(6.0);
        assert_eq!(window.capacity(), 1);
        assert_eq!(window.average(), 6.0);
    }
}
