use super::window::RollingWindow;
use crate::candle::Candle;

/// Ranges above this fraction of price are treated as bad data and skipped.
const MAX_TRUE_RANGE_FRACTION: f64 = 0.20;

/// Wilder-smoothed ATR with a simple-average bootstrap over the first `period` true ranges.
#[derive(Clone, Debug)]
pub struct AtrState {
    period: usize,
    atr: f64,
    prev_close: Option<f64>,
    tr_count: usize,
}

impl AtrState {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            atr: 0.0,
            prev_close: None,
            tr_count: 0,
        }
    }

    /// Fold a closed candle, returning its true range if it was accepted.
    pub fn update(&mut self, candle: &Candle) -> Option<f64> {
        let (mut high, mut low) = (candle.high, candle.low);
        if high < low {
            std::mem::swap(&mut high, &mut low);
        }
        if high <= 0.0 || low <= 0.0 {
            return None;
        }

        // True Range = max(H-L, |H-PrevClose|, |L-PrevClose|)
        let tr = match self.prev_close {
            Some(prev_close) => (high - low)
                .max((high - prev_close).abs())
                .max((low - prev_close).abs()),
            None => high - low,
        };

        let anchor = candle.close.max(candle.open).max(high);
        if tr / anchor > MAX_TRUE_RANGE_FRACTION {
            return None;
        }

        self.prev_close = Some(candle.close);
        self.tr_count += 1;

        if self.tr_count <= self.period {
            self.atr += (tr - self.atr) / self.tr_count as f64;
        } else {
            let n = self.period as f64;
            self.atr = (self.atr * (n - 1.0) + tr) / n;
        }

        Some(tr)
    }

    pub fn value(&self) -> Option<f64> {
        (self.tr_count > 0).then_some(self.atr)
    }

    /// Number of accepted true ranges.
    pub fn samples(&self) -> usize {
        self.tr_count
    }
}

/// Percentile of the current ATR within a rolling window of recent true ranges.
#[derive(Clone, Debug)]
pub struct AtrPercentile {
    true_ranges: RollingWindow,
}

impl AtrPercentile {
    pub fn new(window: usize) -> Self {
        Self {
            true_ranges: RollingWindow::new(window),
        }
    }

    pub fn push(&mut self, true_range: f64) {
        self.true_ranges.push(true_range);
    }

    pub fn percentile(&self, atr: f64) -> Option<f64> {
        self.true_ranges.percentile_rank(atr)
    }
}
