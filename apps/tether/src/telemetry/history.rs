use std::collections::VecDeque;

use serde::Serialize;

pub const DEFAULT_HISTORY_CAPACITY: usize = 600;

/// One charted point. `timestamp` is seconds since the session's first sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PerformanceDataPoint {
    pub timestamp: f64,
    pub fps: f64,
    pub bitrate_kbps: f64,
    pub latency_ms: f64,
}

impl PerformanceDataPoint {
    pub fn zero(timestamp: f64) -> Self {
        Self {
            timestamp,
            fps: 0.0,
            bitrate_kbps: 0.0,
            latency_ms: 0.0,
        }
    }
}

/// Bounded time series with strictly increasing timestamps.
#[derive(Debug, Clone)]
pub struct PerformanceHistory {
    capacity: usize,
    points: VecDeque<PerformanceDataPoint>,
}

impl PerformanceHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            capacity,
            points: VecDeque::with_capacity(capacity),
        }
    }

    /// Appends `point`, seeding an all-zero point one second earlier when the
    /// history is empty so charts always have a baseline. Points that would
    /// not advance the timeline are rejected.
    pub fn push(&mut self, point: PerformanceDataPoint) -> bool {
        match self.points.back() {
            Some(last) if point.timestamp <= last.timestamp => return false,
            Some(_) => {}
            None => self
                .points
                .push_back(PerformanceDataPoint::zero(point.timestamp - 1.0)),
        }
        self.points.push_back(point);
        while self.points.len() > self.capacity {
            self.points.pop_front();
        }
        true
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn latest(&self) -> Option<&PerformanceDataPoint> {
        self.points.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PerformanceDataPoint> {
        self.points.iter()
    }

    pub fn to_vec(&self) -> Vec<PerformanceDataPoint> {
        self.points.iter().copied().collect()
    }
}

impl Default for PerformanceHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(timestamp: f64) -> PerformanceDataPoint {
        PerformanceDataPoint {
            timestamp,
            fps: 30.0,
            bitrate_kbps: 900.0,
            latency_ms: 12.0,
        }
    }

    #[test]
    fn first_point_is_preceded_by_zero_baseline() {
        let mut history = PerformanceHistory::default();
        assert!(history.push(point(0.0)));
        let points = history.to_vec();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0], PerformanceDataPoint::zero(-1.0));
        assert_eq!(points[1], point(0.0));
    }

    #[test]
    fn evicts_oldest_beyond_capacity_in_order() {
        let mut history = PerformanceHistory::default();
        for second in 0..700 {
            history.push(point(second as f64));
        }
        assert_eq!(history.len(), DEFAULT_HISTORY_CAPACITY);
        let points = history.to_vec();
        assert_eq!(points.first().map(|p| p.timestamp), Some(100.0));
        assert_eq!(points.last().map(|p| p.timestamp), Some(699.0));
        assert!(points.windows(2).all(|pair| pair[0].timestamp < pair[1].timestamp));
    }

    #[test]
    fn rejects_points_that_do_not_advance() {
        let mut history = PerformanceHistory::new(10);
        assert!(history.push(point(2.0)));
        assert!(!history.push(point(2.0)));
        assert!(!history.push(point(1.5)));
        assert_eq!(history.len(), 2);
        assert_eq!(history.latest().map(|p| p.timestamp), Some(2.0));
    }
}
