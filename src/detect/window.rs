//! Bounded numeric history for one (source, parameter) pair.

use std::collections::VecDeque;

/// Fixed-capacity sliding window; the oldest value is evicted first.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    max_size: usize,
    values: VecDeque<f64>,
}

impl SlidingWindow {
    pub fn new(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            max_size,
            values: VecDeque::with_capacity(max_size),
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.values.len() == self.max_size {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }

    /// Sample standard deviation (Bessel's correction), for parity with
    /// standard statistics libraries. Zero when fewer than 2 samples.
    pub fn std(&self) -> f64 {
        let n = self.values.len();
        if n < 2 {
            return 0.0;
        }
        let mean = self.mean();
        let sum_sq_diff: f64 = self.values.iter().map(|&v| (v - mean).powi(2)).sum();
        (sum_sq_diff / (n - 1) as f64).sqrt()
    }

    /// Z-score of a value against the current window contents.
    /// `None` when the baseline is degenerate (short window or zero std).
    pub fn z_score(&self, value: f64) -> Option<f64> {
        if self.values.len() < 2 {
            return None;
        }
        let std = self.std();
        if std == 0.0 {
            return None;
        }
        Some((value - self.mean()) / std)
    }
}
