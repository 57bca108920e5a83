use super::{PatternKind, StructuralEvent};
use crate::{
    candle::Candle,
    config::PatternConfig,
    flow::{FlowContext, FlowRegime},
    indicator::IndicatorSnapshot,
    model::Direction,
};

/// Trap top (short) or bottom (long).
///
/// The candle sweeps beyond the session extreme that stood before it, reverses back inside on
/// a volume spike, and either its own CVD leans against the sweep or spot and perp disagree.
pub fn detect(
    candle: &Candle,
    _prev: &Candle,
    snapshot: &IndicatorSnapshot,
    flow: &FlowContext,
    config: &PatternConfig,
) -> Option<StructuralEvent> {
    if !snapshot.warm_up.flow_ready() {
        return None;
    }

    let avg_volume = snapshot.avg_volume?;
    if candle.volume < avg_volume * config.volume_spike {
        return None;
    }

    let markets_disagree = matches!(
        flow.current.regime,
        FlowRegime::Conflict | FlowRegime::PerpDominant | FlowRegime::SpotDominant
    );

    let swept_high = snapshot.prior_session_high.filter(|high| {
        candle.high > high * (1.0 + config.sweep_excess) && candle.close < *high && candle.is_red()
    });
    if let Some(level) = swept_high {
        let cvd_diverges = candle.cvd < 0.0;
        if cvd_diverges || markets_disagree {
            return Some(StructuralEvent::new(
                PatternKind::Trap,
                Direction::Short,
                candle,
                snapshot,
                Some(level),
            ));
        }
    }

    let swept_low = snapshot.prior_session_low.filter(|low| {
        candle.low < low * (1.0 - config.sweep_excess) && candle.close > *low && candle.is_green()
    });
    if let Some(level) = swept_low {
        let cvd_diverges = candle.cvd > 0.0;
        if cvd_diverges || markets_disagree {
            return Some(StructuralEvent::new(
                PatternKind::Trap,
                Direction::Long,
                candle,
                snapshot,
                Some(level),
            ));
        }
    }

    None
}
