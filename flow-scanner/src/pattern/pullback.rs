use super::{PatternKind, StructuralEvent};
use crate::{
    candle::Candle,
    config::PatternConfig,
    flow::{FlowContext, FlowRegime},
    indicator::IndicatorSnapshot,
};

/// Post-impulse pullback.
///
/// A recent directional candle ranged beyond `impulse_atr_multiple` ATRs, the current candle is
/// compressed below `compression_atr_multiple` ATRs on light volume, and price sits near a VWAP
/// sloping with the impulse or near the short moving average. Flow must not be CONFLICT nor
/// consensus/dominant against the impulse.
pub fn detect(
    candle: &Candle,
    _prev: &Candle,
    snapshot: &IndicatorSnapshot,
    flow: &FlowContext,
    config: &PatternConfig,
) -> Option<StructuralEvent> {
    if !snapshot.warm_up.is_ready() {
        return None;
    }

    let impulse = snapshot.recent_impulse?;
    let direction = impulse.direction?;
    if impulse.range_atr < config.impulse_atr_multiple
        || impulse.body_to_range < config.min_body_to_range
    {
        return None;
    }

    let atr = snapshot.prev_atr.filter(|atr| *atr > 0.0)?;
    if candle.range() >= config.compression_atr_multiple * atr {
        return None;
    }

    let avg_volume = snapshot.avg_volume?;
    if candle.volume > avg_volume * config.pullback_max_volume {
        return None;
    }

    if flow.current.regime == FlowRegime::Conflict || flow.current.opposes(direction) {
        return None;
    }

    let max_distance = config.pullback_distance_atr * atr;
    let vwap_with_trend = snapshot.vwap_slope * direction.sign() > 0.0;
    let near_vwap = snapshot
        .vwap
        .filter(|_| vwap_with_trend)
        .is_some_and(|vwap| (candle.close - vwap).abs() <= max_distance);
    let near_average = snapshot
        .moving_average
        .is_some_and(|ma| (candle.close - ma).abs() <= max_distance);

    let level = if near_vwap {
        snapshot.vwap
    } else if near_average {
        snapshot.moving_average
    } else {
        return None;
    };

    Some(StructuralEvent::new(
        PatternKind::Pullback,
        direction,
        candle,
        snapshot,
        level,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        flow::FlowReading,
        indicator::{ImpulseMark, IndicatorSnapshot, test_utils::snapshot},
        model::Direction,
        pattern::test_utils::candle,
    };

    fn impulse_snapshot(direction: Direction, range_atr: f64) -> IndicatorSnapshot {
        let mut snapshot = snapshot();
        snapshot.vwap_slope = 0.2 * direction.sign();
        snapshot.moving_average = Some(103.0);
        snapshot.recent_impulse = Some(ImpulseMark {
            open_time_ms: 0,
            range_atr,
            body_to_range: 0.8,
            direction: Some(direction),
        });
        snapshot
    }

    fn flow(regime: FlowRegime, direction: Option<Direction>) -> FlowContext {
        FlowContext {
            current: FlowReading { regime, direction },
            previous: None,
        }
    }

    #[test]
    fn test_pullback() {
        struct TestCase {
            snapshot: IndicatorSnapshot,
            candle: Candle,
            flow: FlowContext,
            expected: Option<Direction>,
        }

        let tests = vec![
            TestCase {
                // TC0: quiet candle into rising VWAP after bullish impulse
                snapshot: impulse_snapshot(Direction::Long, 3.0),
                candle: candle(100.4, 100.5, 100.0, 100.2, 5.0),
                flow: flow(FlowRegime::Consensus, Some(Direction::Long)),
                expected: Some(Direction::Long),
            },
            TestCase {
                // TC1: impulse too small
                snapshot: impulse_snapshot(Direction::Long, 1.5),
                candle: candle(100.4, 100.5, 100.0, 100.2, 5.0),
                flow: flow(FlowRegime::Consensus, Some(Direction::Long)),
                expected: None,
            },
            TestCase {
                // TC2: candle not compressed
                snapshot: impulse_snapshot(Direction::Long, 3.0),
                candle: candle(100.9, 101.0, 99.9, 100.2, 5.0),
                flow: flow(FlowRegime::Consensus, Some(Direction::Long)),
                expected: None,
            },
            TestCase {
                // TC3: conflict flow
                snapshot: impulse_snapshot(Direction::Long, 3.0),
                candle: candle(100.4, 100.5, 100.0, 100.2, 5.0),
                flow: flow(FlowRegime::Conflict, None),
                expected: None,
            },
            TestCase {
                // TC4: distribution against the pullback direction
                snapshot: impulse_snapshot(Direction::Long, 3.0),
                candle: candle(100.4, 100.5, 100.0, 100.2, 5.0),
                flow: flow(FlowRegime::SpotDominant, Some(Direction::Short)),
                expected: None,
            },
            TestCase {
                // TC5: heavy volume is not a pullback
                snapshot: impulse_snapshot(Direction::Long, 3.0),
                candle: candle(100.4, 100.5, 100.0, 100.2, 15.0),
                flow: flow(FlowRegime::Consensus, Some(Direction::Long)),
                expected: None,
            },
            TestCase {
                // TC6: bearish pullback into falling VWAP under neutral flow
                snapshot: impulse_snapshot(Direction::Short, 2.5),
                candle: candle(99.7, 100.1, 99.6, 99.9, 5.0),
                flow: flow(FlowRegime::Neutral, None),
                expected: Some(Direction::Short),
            },
            TestCase {
                // TC7: far from VWAP and moving average
                snapshot: impulse_snapshot(Direction::Long, 3.0),
                candle: candle(101.7, 101.8, 101.4, 101.6, 5.0),
                flow: flow(FlowRegime::Consensus, Some(Direction::Long)),
                expected: None,
            },
        ];

        let config = PatternConfig::default();
        for (index, test) in tests.into_iter().enumerate() {
            let prev = candle(100.0, 100.0, 100.0, 100.0, 10.0);
            let actual = detect(&test.candle, &prev, &test.snapshot, &test.flow, &config)
                .map(|e| e.direction);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }
}
