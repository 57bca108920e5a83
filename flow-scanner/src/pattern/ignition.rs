use super::{PatternKind, StructuralEvent};
use crate::{
    candle::Candle,
    config::PatternConfig,
    flow::FlowContext,
    indicator::IndicatorSnapshot,
};

/// Ignition out of a volatility coil.
///
/// The preceding candles sat near the bottom of the ATR percentile window on compressed volume,
/// price is still near VWAP, and flow has just left NEUTRAL. Direction follows the new flow.
pub fn detect(
    candle: &Candle,
    _prev: &Candle,
    snapshot: &IndicatorSnapshot,
    flow: &FlowContext,
    config: &PatternConfig,
) -> Option<StructuralEvent> {
    if !snapshot.warm_up.is_ready() || !flow.left_neutral() {
        return None;
    }
    let direction = flow.current.direction?;

    let recent_percentile = snapshot.recent_atr_percentile?;
    if recent_percentile > config.ignition_max_percentile {
        return None;
    }

    let recent_volume = snapshot.recent_avg_volume?;
    let avg_volume = snapshot.avg_volume?;
    if recent_volume > avg_volume * config.ignition_volume_compression {
        return None;
    }

    let distance = snapshot.vwap_distance_atr(candle.close)?;
    if distance > config.ignition_vwap_distance_atr {
        return None;
    }

    Some(StructuralEvent::new(
        PatternKind::Ignition,
        direction,
        candle,
        snapshot,
        snapshot.vwap,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        flow::{FlowReading, FlowRegime},
        indicator::{IndicatorSnapshot, test_utils::snapshot},
        model::Direction,
        pattern::test_utils::candle,
    };

    fn coiled() -> IndicatorSnapshot {
        let mut snapshot = snapshot();
        snapshot.recent_atr_percentile = Some(15.0);
        snapshot.recent_avg_volume = Some(6.0);
        snapshot.avg_volume = Some(10.0);
        snapshot
    }

    fn waking(previous: FlowReading) -> FlowContext {
        FlowContext {
            current: FlowReading {
                regime: FlowRegime::PerpDominant,
                direction: Some(Direction::Short),
            },
            previous: Some(previous),
        }
    }

    #[test]
    fn test_ignition() {
        struct TestCase {
            snapshot: IndicatorSnapshot,
            close: f64,
            flow: FlowContext,
            expected: Option<Direction>,
        }

        let tests = vec![
            TestCase {
                // TC0: coil near VWAP, flow wakes up short
                snapshot: coiled(),
                close: 99.8,
                flow: waking(FlowReading::NEUTRAL),
                expected: Some(Direction::Short),
            },
            TestCase {
                // TC1: flow was already active
                snapshot: coiled(),
                close: 99.8,
                flow: waking(FlowReading {
                    regime: FlowRegime::Consensus,
                    direction: Some(Direction::Short),
                }),
                expected: None,
            },
            TestCase {
                // TC2: volatility was not coiled
                snapshot: {
                    let mut s = coiled();
                    s.recent_atr_percentile = Some(55.0);
                    s
                },
                close: 99.8,
                flow: waking(FlowReading::NEUTRAL),
                expected: None,
            },
            TestCase {
                // TC3: volume not compressed
                snapshot: {
                    let mut s = coiled();
                    s.recent_avg_volume = Some(9.5);
                    s
                },
                close: 99.8,
                flow: waking(FlowReading::NEUTRAL),
                expected: None,
            },
            TestCase {
                // TC4: price already far from VWAP
                snapshot: coiled(),
                close: 98.0,
                flow: waking(FlowReading::NEUTRAL),
                expected: None,
            },
        ];

        let config = PatternConfig::default();
        for (index, test) in tests.into_iter().enumerate() {
            let prev = candle(100.0, 100.0, 100.0, 100.0, 10.0);
            let curr = candle(100.0, 100.1, test.close - 0.1, test.close, 10.0);
            let actual = detect(&curr, &prev, &test.snapshot, &test.flow, &config)
                .map(|e| e.direction);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }
}
