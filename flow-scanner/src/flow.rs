//! Flow regime classifier: the single shared interpretation of spot vs perpetual CVD.
//!
//! Detectors never derive their own flow label; they consult the [`FlowReading`] produced here.

use crate::{
    config::FlowConfig, indicator::IndicatorSnapshot, model::Direction, timeframe::Timeframe,
};
use serde::{Deserialize, Serialize};

/// Coarse spot vs perpetual agreement label.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowRegime {
    Consensus,
    PerpDominant,
    SpotDominant,
    Conflict,
    Neutral,
}

impl FlowRegime {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowRegime::Consensus => "CONSENSUS",
            FlowRegime::PerpDominant => "PERP_DOMINANT",
            FlowRegime::SpotDominant => "SPOT_DOMINANT",
            FlowRegime::Conflict => "CONFLICT",
            FlowRegime::Neutral => "NEUTRAL",
        }
    }

    pub fn is_dominant(&self) -> bool {
        matches!(self, FlowRegime::PerpDominant | FlowRegime::SpotDominant)
    }
}

impl std::fmt::Display for FlowRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Classifier inputs.
#[derive(Copy, Clone, PartialEq, Debug, Default)]
pub struct FlowInputs {
    pub spot_slope: f64,
    pub perp_slope: f64,
    pub divergence: f64,
    pub atr_percentile: f64,
}

impl FlowInputs {
    pub fn from_snapshot(snapshot: &IndicatorSnapshot) -> Option<Self> {
        Some(Self {
            spot_slope: snapshot.spot_cvd_slope,
            perp_slope: snapshot.perp_cvd_slope,
            divergence: snapshot.divergence,
            atr_percentile: snapshot.atr_percentile?,
        })
    }
}

/// Regime plus the direction of the market driving it, if any.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Deserialize, Serialize)]
pub struct FlowReading {
    pub regime: FlowRegime,
    pub direction: Option<Direction>,
}

impl FlowReading {
    pub const NEUTRAL: Self = Self {
        regime: FlowRegime::Neutral,
        direction: None,
    };

    /// Flow is consensus or dominant in `direction`.
    pub fn supports(&self, direction: Direction) -> bool {
        matches!(
            self.regime,
            FlowRegime::Consensus | FlowRegime::PerpDominant | FlowRegime::SpotDominant
        ) && self.direction == Some(direction)
    }

    /// Flow is consensus or dominant against `direction`.
    pub fn opposes(&self, direction: Direction) -> bool {
        self.supports(direction.opposite())
    }
}

/// Current reading and the reading of the previous close on the same stream.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct FlowContext {
    pub current: FlowReading,
    pub previous: Option<FlowReading>,
}

impl FlowContext {
    /// Regime left NEUTRAL on this close.
    pub fn left_neutral(&self) -> bool {
        self.current.regime != FlowRegime::Neutral
            && self
                .previous
                .is_none_or(|previous| previous.regime == FlowRegime::Neutral)
    }
}

fn sign(slope: f64, threshold: f64) -> Option<Direction> {
    if slope > threshold {
        Some(Direction::Long)
    } else if slope < -threshold {
        Some(Direction::Short)
    } else {
        None
    }
}

/// Classify flow. Deterministic and side-effect free.
///
/// Order: volatility gate, consensus, conflict, perp dominant, spot dominant, neutral. The flat
/// slope threshold scales with the `primary` timeframe.
pub fn classify(inputs: FlowInputs, config: &FlowConfig, primary: Timeframe) -> FlowReading {
    if !(inputs.atr_percentile >= config.min_atr_percentile) {
        return FlowReading::NEUTRAL;
    }

    let threshold = config.slope_threshold(primary);
    let spot = sign(inputs.spot_slope, threshold);
    let perp = sign(inputs.perp_slope, threshold);

    match (spot, perp) {
        (Some(spot), Some(perp)) if spot == perp => {
            if inputs.divergence < config.consensus_divergence {
                FlowReading {
                    regime: FlowRegime::Consensus,
                    direction: Some(perp),
                }
            } else if inputs.perp_slope.abs() >= inputs.spot_slope.abs() {
                FlowReading {
                    regime: FlowRegime::PerpDominant,
                    direction: Some(perp),
                }
            } else {
                FlowReading {
                    regime: FlowRegime::SpotDominant,
                    direction: Some(spot),
                }
            }
        }
        (Some(_), Some(_)) => FlowReading {
            regime: FlowRegime::Conflict,
            direction: None,
        },
        (None, Some(perp)) => FlowReading {
            regime: FlowRegime::PerpDominant,
            direction: Some(perp),
        },
        (Some(spot), None) => FlowReading {
            regime: FlowRegime::SpotDominant,
            direction: Some(spot),
        },
        (None, None) => FlowReading::NEUTRAL,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicator::slope_divergence;
    use rand::Rng;

    const PRIMARY: Timeframe = Timeframe::from_minutes(3);

    fn inputs(spot_slope: f64, perp_slope: f64, atr_percentile: f64) -> FlowInputs {
        FlowInputs {
            spot_slope,
            perp_slope,
            divergence: slope_divergence(spot_slope, perp_slope),
            atr_percentile,
        }
    }

    #[test]
    fn test_classify() {
        struct TestCase {
            input: FlowInputs,
            expected: FlowReading,
        }

        let tests = vec![
            TestCase {
                // TC0: both markets buying in step is bullish consensus
                input: inputs(3.0, 4.0, 50.0),
                expected: FlowReading {
                    regime: FlowRegime::Consensus,
                    direction: Some(Direction::Long),
                },
            },
            TestCase {
                // TC1: both markets selling in step is bearish consensus
                input: inputs(-3.0, -4.0, 50.0),
                expected: FlowReading {
                    regime: FlowRegime::Consensus,
                    direction: Some(Direction::Short),
                },
            },
            TestCase {
                // TC2: perp buying with flat spot
                input: inputs(0.5, 5.0, 50.0),
                expected: FlowReading {
                    regime: FlowRegime::PerpDominant,
                    direction: Some(Direction::Long),
                },
            },
            TestCase {
                // TC3: spot selling with flat perp
                input: inputs(-5.0, 1.0, 50.0),
                expected: FlowReading {
                    regime: FlowRegime::SpotDominant,
                    direction: Some(Direction::Short),
                },
            },
            TestCase {
                // TC4: opposite signs conflict
                input: inputs(5.0, -5.0, 50.0),
                expected: FlowReading {
                    regime: FlowRegime::Conflict,
                    direction: None,
                },
            },
            TestCase {
                // TC5: same sign but far apart resolves to the stronger market
                input: inputs(2.0, 20.0, 50.0),
                expected: FlowReading {
                    regime: FlowRegime::PerpDominant,
                    direction: Some(Direction::Long),
                },
            },
            TestCase {
                // TC6: both flat is neutral
                input: inputs(1.0, -1.0, 50.0),
                expected: FlowReading::NEUTRAL,
            },
            TestCase {
                // TC7: volatility gate overrides consensus
                input: inputs(3.0, 4.0, 19.9),
                expected: FlowReading::NEUTRAL,
            },
            TestCase {
                // TC8: NaN percentile is gated
                input: inputs(3.0, 4.0, f64::NAN),
                expected: FlowReading::NEUTRAL,
            },
        ];

        let config = FlowConfig::default();
        for (index, test) in tests.into_iter().enumerate() {
            let actual = classify(test.input, &config, PRIMARY);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_volatility_gate_holds_for_random_slopes() {
        let config = FlowConfig::default();
        let mut rng = rand::rng();

        for _ in 0..10_000 {
            let spot = rng.random_range(-1_000.0..1_000.0);
            let perp = rng.random_range(-1_000.0..1_000.0);
            let percentile = rng.random_range(0.0..config.min_atr_percentile);
            let divergence = rng.random_range(0.0..=1.0);

            let reading = classify(
                FlowInputs {
                    spot_slope: spot,
                    perp_slope: perp,
                    divergence,
                    atr_percentile: percentile,
                },
                &config,
                PRIMARY,
            );
            assert_eq!(reading.regime, FlowRegime::Neutral, "spot {spot} perp {perp} pct {percentile}");
        }
    }

    #[test]
    fn test_flat_threshold_scales_with_primary_timeframe() {
        let config = FlowConfig::default();
        let input = inputs(1.0, -1.0, 50.0);

        assert_eq!(classify(input, &config, PRIMARY), FlowReading::NEUTRAL);
        assert_eq!(
            classify(input, &config, Timeframe::from_minutes(1)).regime,
            FlowRegime::Conflict
        );
    }

    #[test]
    fn test_flow_context_left_neutral() {
        let bullish = FlowReading {
            regime: FlowRegime::Consensus,
            direction: Some(Direction::Long),
        };
        assert!(FlowContext { current: bullish, previous: Some(FlowReading::NEUTRAL) }.left_neutral());
        assert!(!FlowContext { current: bullish, previous: Some(bullish) }.left_neutral());
        assert!(!FlowContext { current: FlowReading::NEUTRAL, previous: None }.left_neutral());
        assert!(bullish.supports(Direction::Long));
        assert!(bullish.opposes(Direction::Short));
    }
}
