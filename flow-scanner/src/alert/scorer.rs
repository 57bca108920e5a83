use crate::{
    config::ScoreWeights,
    flow::{FlowReading, FlowRegime},
    indicator::IndicatorSnapshot,
    pattern::{PatternKind, StructuralEvent},
};
use serde::{Deserialize, Serialize};

/// Range magnitude stops contributing beyond this many ATRs.
const MAGNITUDE_CAP_ATR: f64 = 3.0;

/// Percentile above which volatility is considered expanded.
const HIGH_PERCENTILE: f64 = 80.0;

/// Recent percentile below which an ignition counts as a true coil break.
const COIL_PERCENTILE: f64 = 20.0;

/// VWAP drift per candle, in ATRs, below which VWAP counts as flat.
const FLAT_VWAP_SLOPE_ATR: f64 = 0.02;

/// Additive score terms. Every term is bounded by its weight.
#[derive(Copy, Clone, PartialEq, Debug, Default, Deserialize, Serialize)]
pub struct ScoreBreakdown {
    pub base: f64,
    pub flow_alignment: f64,
    pub volatility: f64,
    pub context: f64,
    pub chop_penalty: f64,
    pub magnitude: f64,
}

impl ScoreBreakdown {
    /// Sum of the terms clamped to [0, 100].
    pub fn total(&self) -> f64 {
        (self.base + self.flow_alignment + self.volatility + self.context + self.magnitude
            - self.chop_penalty)
            .clamp(0.0, 100.0)
    }
}

/// Score a structural event against the flow reading and indicator snapshot of its close.
pub fn score(
    event: &StructuralEvent,
    flow: FlowReading,
    snapshot: &IndicatorSnapshot,
    weights: &ScoreWeights,
) -> ScoreBreakdown {
    ScoreBreakdown {
        base: weights.base,
        flow_alignment: flow_alignment(event, flow, weights),
        volatility: volatility(event, snapshot, weights),
        context: context(event, snapshot, weights),
        chop_penalty: chop_penalty(event, flow, snapshot, weights),
        magnitude: magnitude(event, weights),
    }
}

fn flow_alignment(event: &StructuralEvent, flow: FlowReading, weights: &ScoreWeights) -> f64 {
    match flow.regime {
        FlowRegime::Consensus if flow.direction == Some(event.direction) => weights.flow_alignment,
        FlowRegime::PerpDominant | FlowRegime::SpotDominant
            if flow.direction == Some(event.direction) =>
        {
            weights.flow_alignment * 0.75
        }
        // Markets disagreeing is what confirms a reversal
        FlowRegime::Conflict if event.pattern.is_reversal() => weights.flow_alignment,
        _ => 0.0,
    }
}

fn volatility(event: &StructuralEvent, snapshot: &IndicatorSnapshot, weights: &ScoreWeights) -> f64 {
    let expanded = snapshot
        .atr_percentile
        .is_some_and(|percentile| percentile > HIGH_PERCENTILE);
    let coiled = event.pattern == PatternKind::Ignition
        && snapshot
            .recent_atr_percentile
            .is_some_and(|percentile| percentile < COIL_PERCENTILE);

    if expanded || coiled {
        weights.volatility
    } else {
        0.0
    }
}

fn context(event: &StructuralEvent, snapshot: &IndicatorSnapshot, weights: &ScoreWeights) -> f64 {
    let sign = event.direction.sign();

    if event.pattern.is_reversal() {
        let Some(level) = event.level else {
            return 0.0;
        };
        let session_extreme = [snapshot.prior_session_high, snapshot.prior_session_low]
            .into_iter()
            .flatten()
            .any(|extreme| extreme == level);
        return if session_extreme {
            weights.context
        } else {
            weights.context * 0.5
        };
    }

    let mut context = 0.0;
    if snapshot.vwap_slope * sign > 0.0 {
        context += weights.context * 0.5;
    }
    if snapshot
        .moving_average
        .is_some_and(|average| (event.close - average) * sign > 0.0)
    {
        context += weights.context * 0.5;
    }
    context
}

/// Penalty for two-sided conditions. NEUTRAL flow takes the full weight. Continuation patterns
/// lose half of it when spot and perp disagree and half when VWAP is flat.
fn chop_penalty(
    event: &StructuralEvent,
    flow: FlowReading,
    snapshot: &IndicatorSnapshot,
    weights: &ScoreWeights,
) -> f64 {
    if flow.regime == FlowRegime::Neutral {
        return weights.chop;
    }
    if event.pattern.is_reversal() {
        return 0.0;
    }

    let mut penalty = 0.0;
    if flow.regime == FlowRegime::Conflict {
        penalty += weights.chop * 0.5;
    }
    let flat_vwap = snapshot
        .atr
        .filter(|atr| *atr > 0.0)
        .is_some_and(|atr| snapshot.vwap_slope.abs() < FLAT_VWAP_SLOPE_ATR * atr);
    if flat_vwap {
        penalty += weights.chop * 0.5;
    }
    penalty.min(weights.chop)
}

fn magnitude(event: &StructuralEvent, weights: &ScoreWeights) -> f64 {
    let Some(range_atr) = event.range_atr else {
        return 0.0;
    };
    let per_atr = match event.pattern {
        // Quiet candles are the point of these setups
        PatternKind::VwapReclaim | PatternKind::Pullback => weights.magnitude * 0.5,
        _ => weights.magnitude,
    };
    range_atr.clamp(0.0, MAGNITUDE_CAP_ATR) * per_atr
}
