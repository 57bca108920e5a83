use super::{PatternKind, StructuralEvent};
use crate::{
    candle::Candle,
    config::PatternConfig,
    flow::{FlowContext, FlowRegime},
    indicator::IndicatorSnapshot,
    model::Direction,
};

/// VWAP reclaim (long) or rejection (short).
///
/// Previous close and current close straddle VWAP by more than the tolerance band, volume
/// expands over its average and flow is not NEUTRAL.
pub fn detect(
    candle: &Candle,
    prev: &Candle,
    snapshot: &IndicatorSnapshot,
    flow: &FlowContext,
    config: &PatternConfig,
) -> Option<StructuralEvent> {
    if !snapshot.warm_up.flow_ready() || flow.current.regime == FlowRegime::Neutral {
        return None;
    }

    let vwap = snapshot.vwap?;
    let prev_vwap = snapshot.prev_vwap?;
    let avg_volume = snapshot.avg_volume?;
    if candle.volume < avg_volume * config.volume_expansion {
        return None;
    }

    let tolerance = config.vwap_tolerance;
    let direction = if prev.close < prev_vwap * (1.0 - tolerance)
        && candle.close > vwap * (1.0 + tolerance)
    {
        Direction::Long
    } else if prev.close > prev_vwap * (1.0 + tolerance)
        && candle.close < vwap * (1.0 - tolerance)
    {
        Direction::Short
    } else {
        return None;
    };

    Some(StructuralEvent::new(
        PatternKind::VwapReclaim,
        direction,
        candle,
        snapshot,
        Some(vwap),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        flow::FlowReading,
        indicator::test_utils::snapshot,
        pattern::test_utils::candle,
    };

    fn consensus() -> FlowContext {
        FlowContext {
            current: FlowReading {
                regime: FlowRegime::Consensus,
                direction: Some(Direction::Long),
            },
            previous: None,
        }
    }

    #[test]
    fn test_vwap_reclaim() {
        struct TestCase {
            prev_close: f64,
            close: f64,
            volume: f64,
            flow: FlowContext,
            expected: Option<Direction>,
        }

        let tests = vec![
            TestCase {
                // TC0: reclaim from below with expanding volume
                prev_close: 99.80,
                close: 100.20,
                volume: 20.0,
                flow: consensus(),
                expected: Some(Direction::Long),
            },
            TestCase {
                // TC1: rejection from above
                prev_close: 100.20,
                close: 99.80,
                volume: 20.0,
                flow: consensus(),
                expected: Some(Direction::Short),
            },
            TestCase {
                // TC2: no straddle
                prev_close: 100.20,
                close: 100.30,
                volume: 20.0,
                flow: consensus(),
                expected: None,
            },
            TestCase {
                // TC3: volume not expanding
                prev_close: 99.80,
                close: 100.20,
                volume: 10.0,
                flow: consensus(),
                expected: None,
            },
            TestCase {
                // TC4: neutral flow
                prev_close: 99.80,
                close: 100.20,
                volume: 20.0,
                flow: FlowContext {
                    current: FlowReading::NEUTRAL,
                    previous: None,
                },
                expected: None,
            },
            TestCase {
                // TC5: straddle inside the tolerance band
                prev_close: 99.99,
                close: 100.01,
                volume: 20.0,
                flow: consensus(),
                expected: None,
            },
        ];

        let config = PatternConfig::default();
        let snapshot = snapshot();

        for (index, test) in tests.into_iter().enumerate() {
            let prev = candle(test.prev_close, test.prev_close, test.prev_close, test.prev_close, 10.0);
            let curr = candle(test.prev_close, 100.4, 99.6, test.close, test.volume);
            let actual = detect(&curr, &prev, &snapshot, &test.flow, &config).map(|e| e.direction);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }
}
