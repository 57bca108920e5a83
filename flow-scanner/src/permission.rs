//! Permission gate derived from the slow timeframe.
//!
//! The gate may only withhold or downgrade: it never promotes a symbol on its own.

use crate::{
    candle::Candle,
    config::PermissionConfig,
    indicator::IndicatorSnapshot,
    model::Direction,
    timeframe::Timeframe,
};
use serde::{Deserialize, Serialize};

/// Slow timeframe directional bias.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Bias {
    Bullish,
    Bearish,
    Neutral,
}

impl Bias {
    /// Bias points against `direction`.
    pub fn conflicts_with(&self, direction: Direction) -> bool {
        matches!(
            (self, direction),
            (Bias::Bullish, Direction::Short) | (Bias::Bearish, Direction::Long)
        )
    }
}

/// Slow timeframe volatility bucket.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VolatilityRegime {
    Low,
    Normal,
    High,
}

/// Read-only view of the gate consumed by the state machine.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct PermissionSnapshot {
    pub timeframe: Timeframe,
    pub bias: Bias,
    pub volatility: VolatilityRegime,
    pub allowed: bool,
    pub reason: String,
    /// Open time of the slow candle this was computed from. None before the first close.
    pub as_of_ms: Option<i64>,
}

impl PermissionSnapshot {
    /// Gate state before the permission timeframe has closed a candle.
    pub fn pending(timeframe: Timeframe) -> Self {
        Self {
            timeframe,
            bias: Bias::Neutral,
            volatility: VolatilityRegime::Normal,
            allowed: false,
            reason: format!("awaiting first {timeframe} close"),
            as_of_ms: None,
        }
    }
}

/// Compute the gate from a closed slow candle and its indicator snapshot.
pub fn evaluate(
    candle: &Candle,
    snapshot: &IndicatorSnapshot,
    config: &PermissionConfig,
) -> PermissionSnapshot {
    let bias = match snapshot.vwap {
        Some(vwap) if candle.close > vwap && snapshot.vwap_slope >= 0.0 => Bias::Bullish,
        Some(vwap) if candle.close < vwap && snapshot.vwap_slope <= 0.0 => Bias::Bearish,
        _ => Bias::Neutral,
    };

    let percentile = snapshot.atr_percentile.unwrap_or(0.0);
    let volatility = if percentile < config.min_atr_percentile {
        VolatilityRegime::Low
    } else if percentile > config.high_atr_percentile {
        VolatilityRegime::High
    } else {
        VolatilityRegime::Normal
    };

    let (allowed, reason) = if !snapshot.warm_up.atr_ready() {
        (
            false,
            format!(
                "{} ATR warming up ({} candles)",
                snapshot.timeframe, snapshot.closed_candles
            ),
        )
    } else if volatility == VolatilityRegime::Low {
        (
            false,
            format!(
                "{} volatility too low (ATR percentile {percentile:.1})",
                snapshot.timeframe
            ),
        )
    } else {
        (
            true,
            format!(
                "{} bias {:?}, volatility {:?}",
                snapshot.timeframe, bias, volatility
            ),
        )
    };

    PermissionSnapshot {
        timeframe: snapshot.timeframe,
        bias,
        volatility,
        allowed,
        reason,
        as_of_ms: Some(candle.open_time_ms),
    }
}
