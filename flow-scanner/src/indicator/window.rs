//! Fixed-size rolling accumulators used by the indicator engine.
//!
//! Every window has ring buffer semantics: inserting into a full window evicts the oldest value.

use std::collections::VecDeque;

/// Rolling window of values with a running sum.
///
/// The sum is recomputed from the values every time the window has turned over once, so
/// rounding error from evictions never outlives a full window.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    max_size: usize,
    values: VecDeque<f64>,
    total: f64,
    evictions: usize,
}

impl RollingWindow {
    pub fn new(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            max_size,
            values: VecDeque::with_capacity(max_size),
            total: 0.0,
            evictions: 0,
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.values.len() >= self.max_size {
            if let Some(oldest) = self.values.pop_front() {
                self.total -= oldest;
                self.evictions += 1;
            }
        }
        self.values.push_back(value);
        self.total += value;

        if self.evictions >= self.max_size {
            self.evictions = 0;
            self.total = self.values.iter().sum();
        }
    }

    pub fn mean(&self) -> Option<f64> {
        if self.values.is_empty() {
            None
        } else {
            Some(self.total / self.values.len() as f64)
        }
    }

    /// Percentile rank of `value` within the window in [0, 100]. Ties count half.
    pub fn percentile_rank(&self, value: f64) -> Option<f64> {
        if self.values.is_empty() {
            return None;
        }

        let (below, equal) = self.values.iter().fold((0usize, 0usize), |(b, e), v| {
            if *v < value {
                (b + 1, e)
            } else if *v == value {
                (b, e + 1)
            } else {
                (b, e)
            }
        });

        Some((below as f64 + 0.5 * equal as f64) / self.values.len() as f64 * 100.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &f64> + '_ {
        self.values.iter()
    }

    pub fn latest(&self) -> Option<f64> {
        self.values.back().copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.values.len() >= self.max_size
    }
}

/// Least-squares slope over the last `period` values of a series.
#[derive(Debug, Clone)]
pub struct SlopeWindow {
    window: RollingWindow,
}

impl SlopeWindow {
    pub fn new(period: usize) -> Self {
        Self {
            window: RollingWindow::new(period.max(2)),
        }
    }

    pub fn push(&mut self, value: f64) {
        self.window.push(value);
    }

    /// Slope in series units per step. Zero until two values are present.
    pub fn slope(&self) -> f64 {
        let n = self.window.len();
        if n < 2 {
            return 0.0;
        }

        let n_f = n as f64;
        let sum_x = n_f * (n_f - 1.0) / 2.0;
        let sum_x2 = (n_f - 1.0) * n_f * (2.0 * n_f - 1.0) / 6.0;
        let sum_y = self.window.total;
        let sum_xy = self
            .window
            .iter()
            .enumerate()
            .map(|(x, y)| x as f64 * y)
            .sum::<f64>();

        let denominator = n_f * sum_x2 - sum_x * sum_x;
        if denominator == 0.0 {
            0.0
        } else {
            (n_f * sum_xy - sum_x * sum_y) / denominator
        }
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }
}

/// Exponential Moving Average (EMA), simple average until `period` values are seen.
#[derive(Debug, Clone)]
pub struct Ema {
    period: usize,
    alpha: f64,
    value: Option<f64>,
    count: usize,
}

impl Ema {
    pub fn new(period: usize) -> Self {
        let period = period.max(1);
        Self {
            period,
            alpha: 2.0 / (period as f64 + 1.0),
            value: None,
            count: 0,
        }
    }

    pub fn update(&mut self, new_value: f64) {
        self.count += 1;
        self.value = match self.value {
            None => Some(new_value),
            Some(current) if self.count < self.period => {
                Some((current * (self.count - 1) as f64 + new_value) / self.count as f64)
            }
            Some(current) => Some(self.alpha * new_value + (1.0 - self.alpha) * current),
        };
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}
