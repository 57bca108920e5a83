use crate::candle::Candle;
use chrono::{DateTime, Duration, NaiveDate, Utc};

/// Session-anchored accumulators: VWAP, session extremes and opening range.
///
/// The session rolls over at a fixed UTC hour. Rollover is decided by the candle open time,
/// never inferred from gaps in the data.
#[derive(Clone, Debug)]
pub struct SessionState {
    start_hour_utc: u32,
    opening_range_candles: usize,
    session: Option<NaiveDate>,
    sum_pv: f64,
    sum_v: f64,
    high: Option<f64>,
    low: Option<f64>,
    opening_high: Option<f64>,
    opening_low: Option<f64>,
    candles: usize,
}

/// Session levels before and after folding a candle.
#[derive(Copy, Clone, PartialEq, Debug, Default)]
pub struct SessionLevels {
    pub vwap: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub opening_high: Option<f64>,
    pub opening_low: Option<f64>,
    /// Session high/low before this candle, used to detect sweeps.
    pub prior_high: Option<f64>,
    pub prior_low: Option<f64>,
    pub candles_in_session: usize,
    /// This candle started a new session.
    pub rolled_over: bool,
}

impl SessionState {
    pub fn new(start_hour_utc: u32, opening_range_candles: usize) -> Self {
        Self {
            start_hour_utc: start_hour_utc.min(23),
            opening_range_candles,
            session: None,
            sum_pv: 0.0,
            sum_v: 0.0,
            high: None,
            low: None,
            opening_high: None,
            opening_low: None,
            candles: 0,
        }
    }

    /// Trading day a timestamp belongs to, shifted by the session start hour.
    pub fn session_of(&self, timestamp_ms: i64) -> Option<NaiveDate> {
        let time = DateTime::<Utc>::from_timestamp_millis(timestamp_ms)?;
        Some((time - Duration::hours(i64::from(self.start_hour_utc))).date_naive())
    }

    pub fn update(&mut self, candle: &Candle) -> SessionLevels {
        let session = self.session_of(candle.open_time_ms);
        let rolled_over = session != self.session;
        if rolled_over {
            self.reset(session);
        }

        let prior_high = self.high;
        let prior_low = self.low;

        if candle.vwap_volume > 0.0 {
            self.sum_pv += candle.vwap_pv;
            self.sum_v += candle.vwap_volume;
        }
        self.high = Some(self.high.map_or(candle.high, |h| h.max(candle.high)));
        self.low = Some(self.low.map_or(candle.low, |l| l.min(candle.low)));

        self.candles += 1;
        if self.candles <= self.opening_range_candles {
            self.opening_high = self.high;
            self.opening_low = self.low;
        }

        SessionLevels {
            vwap: self.vwap(),
            high: self.high,
            low: self.low,
            opening_high: self.opening_high,
            opening_low: self.opening_low,
            prior_high,
            prior_low,
            candles_in_session: self.candles,
            rolled_over,
        }
    }

    pub fn vwap(&self) -> Option<f64> {
        if self.sum_v > 0.0 {
            Some(self.sum_pv / self.sum_v)
        } else {
            None
        }
    }

    fn reset(&mut self, session: Option<NaiveDate>) {
        self.session = session;
        self.sum_pv = 0.0;
        self.sum_v = 0.0;
        self.high = None;
        self.low = None;
        self.opening_high = None;
        self.opening_low = None;
        self.candles = 0;
    }
}
