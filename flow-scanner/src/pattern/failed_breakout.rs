use super::{PatternKind, StructuralEvent};
use crate::{
    candle::Candle,
    config::PatternConfig,
    flow::FlowContext,
    indicator::IndicatorSnapshot,
    model::Direction,
};

/// Failed breakout of a key level.
///
/// Key levels are the prior session extremes and the opening range. Price breaks the level and
/// closes back inside on the same candle, or the previous candle closed beyond it and this one
/// closes back inside. Flow must not confirm the breakout direction and volume must not be
/// explosive.
pub fn detect(
    candle: &Candle,
    prev: &Candle,
    snapshot: &IndicatorSnapshot,
    flow: &FlowContext,
    config: &PatternConfig,
) -> Option<StructuralEvent> {
    if !snapshot.warm_up.flow_ready() {
        return None;
    }

    if let Some(avg_volume) = snapshot.avg_volume {
        if candle.volume > avg_volume * config.breakout_max_volume {
            return None;
        }
    }

    let upper = [snapshot.prior_session_high, snapshot.opening_range_high];
    let failed_up = upper.into_iter().flatten().find(|level| {
        let broke = candle.high > *level || prev.close > *level;
        broke && candle.close < *level
    });
    if let Some(level) = failed_up {
        if !flow.current.supports(Direction::Long) {
            return Some(StructuralEvent::new(
                PatternKind::FailedBreakout,
                Direction::Short,
                candle,
                snapshot,
                Some(level),
            ));
        }
    }

    let lower = [snapshot.prior_session_low, snapshot.opening_range_low];
    let failed_down = lower.into_iter().flatten().find(|level| {
        let broke = candle.low < *level || prev.close < *level;
        broke && candle.close > *level
    });
    if let Some(level) = failed_down {
        if !flow.current.supports(Direction::Short) {
            return Some(StructuralEvent::new(
                PatternKind::FailedBreakout,
                Direction::Long,
                candle,
                snapshot,
                Some(level),
            ));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        flow::{FlowReading, FlowRegime},
        indicator::test_utils::snapshot,
        pattern::test_utils::candle,
    };

    fn flow(regime: FlowRegime, direction: Option<Direction>) -> FlowContext {
        FlowContext {
            current: FlowReading { regime, direction },
            previous: None,
        }
    }

    #[test]
    fn test_failed_breakout() {
        struct TestCase {
            prev: Candle,
            candle: Candle,
            flow: FlowContext,
            expected: Option<Direction>,
        }

        let tests = vec![
            TestCase {
                // TC0: same candle pokes above the opening range and closes back inside
                prev: candle(101.0, 101.5, 100.8, 101.4, 10.0),
                candle: candle(101.4, 102.4, 101.2, 101.6, 10.0),
                flow: flow(FlowRegime::Neutral, None),
                expected: Some(Direction::Short),
            },
            TestCase {
                // TC1: previous candle closed above, this one back below
                prev: candle(101.6, 102.6, 101.5, 102.5, 10.0),
                candle: candle(102.5, 102.5, 101.5, 101.7, 10.0),
                flow: flow(FlowRegime::Conflict, None),
                expected: Some(Direction::Short),
            },
            TestCase {
                // TC2: flow confirms the upside break
                prev: candle(101.0, 101.5, 100.8, 101.4, 10.0),
                candle: candle(101.4, 102.4, 101.2, 101.6, 10.0),
                flow: flow(FlowRegime::Consensus, Some(Direction::Long)),
                expected: None,
            },
            TestCase {
                // TC3: explosive volume
                prev: candle(101.0, 101.5, 100.8, 101.4, 10.0),
                candle: candle(101.4, 102.4, 101.2, 101.6, 30.0),
                flow: flow(FlowRegime::Neutral, None),
                expected: None,
            },
            TestCase {
                // TC4: breakdown below opening range low reclaimed
                prev: candle(98.5, 98.6, 98.1, 98.2, 10.0),
                candle: candle(98.2, 98.4, 97.6, 98.3, 10.0),
                flow: flow(FlowRegime::PerpDominant, Some(Direction::Long)),
                expected: Some(Direction::Long),
            },
            TestCase {
                // TC5: nothing broken
                prev: candle(100.0, 100.5, 99.5, 100.2, 10.0),
                candle: candle(100.2, 100.6, 99.8, 100.1, 10.0),
                flow: flow(FlowRegime::Neutral, None),
                expected: None,
            },
        ];

        let config = PatternConfig::default();
        for (index, test) in tests.into_iter().enumerate() {
            let actual = detect(&test.candle, &test.prev, &snapshot(), &test.flow, &config)
                .map(|e| e.direction);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }
}
