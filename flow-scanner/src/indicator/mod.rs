//! Incremental indicator engine.
//!
//! [`IndicatorState`] carries just enough running state per (symbol, timeframe) to produce the
//! next [`IndicatorSnapshot`] from one closed candle in constant time. History is only replayed
//! during the one-time warm-up fill.

use crate::{
    candle::Candle,
    config::IndicatorConfig,
    model::Direction,
    timeframe::Timeframe,
};
use serde::{Deserialize, Serialize};

pub mod atr;
pub mod vwap;
pub mod window;

use atr::{AtrPercentile, AtrState};
use vwap::SessionState;
use window::{Ema, RollingWindow, SlopeWindow};

/// Whether an indicator has seen enough closed candles to be trusted for decisions.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
pub enum Confidence {
    Low,
    Normal,
}

/// Warm-up confidence of the flow slopes and the ATR-derived thresholds.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
pub struct WarmUp {
    pub flow: Confidence,
    pub atr: Confidence,
}

impl WarmUp {
    pub fn flow_ready(&self) -> bool {
        self.flow == Confidence::Normal
    }

    pub fn atr_ready(&self) -> bool {
        self.atr == Confidence::Normal
    }

    pub fn is_ready(&self) -> bool {
        self.flow_ready() && self.atr_ready()
    }
}

/// Strongest candle in the recent lookback, measured in ATRs at the time it closed.
#[derive(Copy, Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct ImpulseMark {
    pub open_time_ms: i64,
    pub range_atr: f64,
    pub body_to_range: f64,
    pub direction: Option<Direction>,
}

/// Indicator outputs for one (symbol, timeframe) as of its latest closed candle.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct IndicatorSnapshot {
    pub timeframe: Timeframe,
    pub open_time_ms: i64,
    /// Session VWAP including this candle.
    pub vwap: Option<f64>,
    /// Session VWAP before this candle. None on the first candle of a session.
    pub prev_vwap: Option<f64>,
    /// VWAP change per candle over the slope period.
    pub vwap_slope: f64,
    pub atr: Option<f64>,
    /// ATR before this candle, the yardstick for this candle's range.
    pub prev_atr: Option<f64>,
    pub atr_percentile: Option<f64>,
    /// Mean ATR percentile of the candles preceding this one.
    pub recent_atr_percentile: Option<f64>,
    pub session_high: Option<f64>,
    pub session_low: Option<f64>,
    pub prior_session_high: Option<f64>,
    pub prior_session_low: Option<f64>,
    pub opening_range_high: Option<f64>,
    pub opening_range_low: Option<f64>,
    pub moving_average: Option<f64>,
    /// Mean volume of the candles preceding this one.
    pub avg_volume: Option<f64>,
    /// Mean volume of the last few candles preceding this one.
    pub recent_avg_volume: Option<f64>,
    pub cvd_slope: f64,
    pub spot_cvd_slope: f64,
    pub perp_cvd_slope: f64,
    /// Spot vs perp CVD slope disagreement in [0, 1].
    pub divergence: f64,
    pub recent_impulse: Option<ImpulseMark>,
    pub closed_candles: usize,
    pub warm_up: WarmUp,
}

impl IndicatorSnapshot {
    /// Distance of `price` from VWAP in ATRs.
    pub fn vwap_distance_atr(&self, price: f64) -> Option<f64> {
        let vwap = self.vwap?;
        let atr = self.atr.filter(|atr| *atr > 0.0)?;
        Some((price - vwap).abs() / atr)
    }
}

/// Spot/perp CVD slope disagreement normalised to [0, 1].
pub fn slope_divergence(spot_slope: f64, perp_slope: f64) -> f64 {
    let magnitude = spot_slope.abs() + perp_slope.abs();
    if magnitude == 0.0 {
        0.0
    } else {
        (spot_slope - perp_slope).abs() / magnitude
    }
}

/// Running indicator accumulators for one (symbol, timeframe) stream.
///
/// Cloning is cheap and bounded, which is what allows the last close to be re-derived after
/// reconciliation without replaying history.
#[derive(Clone, Debug)]
pub struct IndicatorState {
    config: IndicatorConfig,
    timeframe: Timeframe,
    session: SessionState,
    atr: AtrState,
    atr_percentile: AtrPercentile,
    recent_percentiles: RollingWindow,
    vwap_slope: SlopeWindow,
    volume: RollingWindow,
    recent_volume: RollingWindow,
    moving_average: Ema,
    cvd_total: f64,
    spot_cvd_total: f64,
    perp_cvd_total: f64,
    cvd_slope: SlopeWindow,
    spot_cvd_slope: SlopeWindow,
    perp_cvd_slope: SlopeWindow,
    impulses: std::collections::VecDeque<ImpulseMark>,
    closed_candles: usize,
}

impl IndicatorState {
    pub fn new(timeframe: Timeframe, config: &IndicatorConfig) -> Self {
        Self {
            config: config.clone(),
            timeframe,
            session: SessionState::new(
                config.session_start_hour_utc,
                config.opening_range_candles,
            ),
            atr: AtrState::new(config.atr_period),
            atr_percentile: AtrPercentile::new(config.atr_percentile_window),
            recent_percentiles: RollingWindow::new(config.slope_period),
            vwap_slope: SlopeWindow::new(config.slope_period),
            volume: RollingWindow::new(config.volume_window),
            recent_volume: RollingWindow::new(config.slope_period),
            moving_average: Ema::new(config.moving_average_period),
            cvd_total: 0.0,
            spot_cvd_total: 0.0,
            perp_cvd_total: 0.0,
            cvd_slope: SlopeWindow::new(config.slope_period),
            spot_cvd_slope: SlopeWindow::new(config.slope_period),
            perp_cvd_slope: SlopeWindow::new(config.slope_period),
            impulses: std::collections::VecDeque::with_capacity(config.impulse_lookback),
            closed_candles: 0,
        }
    }

    pub fn closed_candles(&self) -> usize {
        self.closed_candles
    }

    /// Fold a closed candle and produce the next snapshot.
    ///
    /// Unpriced candles (no perpetual trade and no previous close) are skipped.
    pub fn on_candle_closed(&mut self, candle: &Candle) -> Option<IndicatorSnapshot> {
        if !candle.priced {
            return None;
        }

        let prev_vwap = self.session.vwap();
        let prev_atr = self.atr.value();
        let avg_volume = self.volume.mean();
        let recent_avg_volume = self.recent_volume.mean();
        let recent_atr_percentile = self.recent_percentiles.mean();
        let recent_impulse = self.strongest_impulse();

        let levels = self.session.update(candle);
        let prev_vwap = if levels.rolled_over { None } else { prev_vwap };

        let true_range = self.atr.update(candle);
        if let Some(tr) = true_range {
            self.atr_percentile.push(tr);
        }
        let atr = self.atr.value();
        let atr_percentile = atr.and_then(|atr| self.atr_percentile.percentile(atr));
        if let Some(percentile) = atr_percentile {
            self.recent_percentiles.push(percentile);
        }

        if let Some(vwap) = levels.vwap {
            if levels.rolled_over {
                self.vwap_slope = SlopeWindow::new(self.config.slope_period);
            }
            self.vwap_slope.push(vwap);
        }

        self.volume.push(candle.volume);
        self.recent_volume.push(candle.volume);
        self.moving_average.update(candle.close);

        self.cvd_total += candle.cvd;
        self.spot_cvd_total += candle.spot_cvd;
        self.perp_cvd_total += candle.perp_cvd;
        self.cvd_slope.push(self.cvd_total);
        self.spot_cvd_slope.push(self.spot_cvd_total);
        self.perp_cvd_slope.push(self.perp_cvd_total);

        self.record_impulse(candle, prev_atr);
        self.closed_candles += 1;

        let spot_cvd_slope = self.spot_cvd_slope.slope();
        let perp_cvd_slope = self.perp_cvd_slope.slope();

        Some(IndicatorSnapshot {
            timeframe: self.timeframe,
            open_time_ms: candle.open_time_ms,
            vwap: levels.vwap,
            prev_vwap,
            vwap_slope: self.vwap_slope.slope(),
            atr,
            prev_atr,
            atr_percentile,
            recent_atr_percentile,
            session_high: levels.high,
            session_low: levels.low,
            prior_session_high: levels.prior_high,
            prior_session_low: levels.prior_low,
            opening_range_high: levels.opening_high,
            opening_range_low: levels.opening_low,
            moving_average: self.moving_average.value(),
            avg_volume,
            recent_avg_volume,
            cvd_slope: self.cvd_slope.slope(),
            spot_cvd_slope,
            perp_cvd_slope,
            divergence: slope_divergence(spot_cvd_slope, perp_cvd_slope),
            recent_impulse,
            closed_candles: self.closed_candles,
            warm_up: self.warm_up(),
        })
    }

    pub fn warm_up(&self) -> WarmUp {
        let flow = if self.closed_candles >= self.config.flow_warmup_candles {
            Confidence::Normal
        } else {
            Confidence::Low
        };
        let atr = if self.atr.samples() >= self.config.atr_warmup_candles {
            Confidence::Normal
        } else {
            Confidence::Low
        };
        WarmUp { flow, atr }
    }

    fn record_impulse(&mut self, candle: &Candle, prev_atr: Option<f64>) {
        let Some(atr) = prev_atr.filter(|atr| *atr > 0.0) else {
            return;
        };
        let range = candle.range();
        if range <= 0.0 {
            return;
        }

        if self.impulses.len() >= self.config.impulse_lookback.max(1) {
            self.impulses.pop_front();
        }
        self.impulses.push_back(ImpulseMark {
            open_time_ms: candle.open_time_ms,
            range_atr: range / atr,
            body_to_range: candle.body() / range,
            direction: if candle.is_green() {
                Some(Direction::Long)
            } else if candle.is_red() {
                Some(Direction::Short)
            } else {
                None
            },
        });
    }

    fn strongest_impulse(&self) -> Option<ImpulseMark> {
        self.impulses
            .iter()
            .copied()
            .max_by(|a, b| a.range_atr.total_cmp(&b.range_atr))
    }
}
