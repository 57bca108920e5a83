//! Structural pattern detectors.
//!
//! Each detector is a pure function of the closed candle, the previous closed candle, the
//! indicator snapshot for the close and the shared [`FlowContext`]. Detectors never mutate state.

use crate::{
    candle::Candle,
    config::PatternConfig,
    flow::FlowContext,
    indicator::IndicatorSnapshot,
    model::{Direction, Symbol},
    timeframe::Timeframe,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

pub mod failed_breakout;
pub mod ignition;
pub mod pullback;
pub mod trap;
pub mod vwap_reclaim;

/// Structural pattern families.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PatternKind {
    VwapReclaim,
    Pullback,
    Trap,
    Ignition,
    FailedBreakout,
}

impl PatternKind {
    pub const ALL: [PatternKind; 5] = [
        PatternKind::VwapReclaim,
        PatternKind::Pullback,
        PatternKind::Trap,
        PatternKind::Ignition,
        PatternKind::FailedBreakout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PatternKind::VwapReclaim => "VWAP_RECLAIM",
            PatternKind::Pullback => "PULLBACK",
            PatternKind::Trap => "TRAP",
            PatternKind::Ignition => "IGNITION",
            PatternKind::FailedBreakout => "FAILED_BREAKOUT",
        }
    }

    /// Reversal patterns that disqualify an ACT position held in the other direction.
    pub fn is_reversal(&self) -> bool {
        matches!(self, PatternKind::Trap | PatternKind::FailedBreakout)
    }
}

impl std::fmt::Display for PatternKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PatternKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PatternKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown pattern: {s}"))
    }
}

/// Typed output of a detector on one closed candle.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct StructuralEvent {
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    pub pattern: PatternKind,
    pub direction: Direction,
    pub candle_open_time_ms: i64,
    pub close: f64,
    /// Candle range in ATRs, where ATR is known.
    pub range_atr: Option<f64>,
    /// Level the pattern formed against (VWAP, session extreme, ...).
    pub level: Option<f64>,
}

impl StructuralEvent {
    pub(crate) fn new(
        pattern: PatternKind,
        direction: Direction,
        candle: &Candle,
        snapshot: &IndicatorSnapshot,
        level: Option<f64>,
    ) -> Self {
        Self {
            symbol: candle.symbol.clone(),
            timeframe: candle.timeframe,
            pattern,
            direction,
            candle_open_time_ms: candle.open_time_ms,
            close: candle.close,
            range_atr: snapshot
                .prev_atr
                .or(snapshot.atr)
                .filter(|atr| *atr > 0.0)
                .map(|atr| candle.range() / atr),
            level,
        }
    }

    /// This event argues against holding a position in `direction`.
    pub fn is_aggressor_against(&self, direction: Direction) -> bool {
        self.pattern.is_reversal() && self.direction != direction
    }
}

/// Run every detector on a closed state-driving candle.
///
/// A failed breakout is not reported alongside a trap in the same direction: the trap is the
/// stronger reading of the same sweep.
pub fn detect_all(
    candle: &Candle,
    prev: &Candle,
    snapshot: &IndicatorSnapshot,
    flow: &FlowContext,
    config: &PatternConfig,
) -> Vec<StructuralEvent> {
    if !candle.priced || !prev.priced {
        return Vec::new();
    }

    let mut events = Vec::with_capacity(2);
    events.extend(vwap_reclaim::detect(candle, prev, snapshot, flow, config));
    events.extend(pullback::detect(candle, prev, snapshot, flow, config));
    events.extend(ignition::detect(candle, prev, snapshot, flow, config));

    let trap = trap::detect(candle, prev, snapshot, flow, config);
    let failed = failed_breakout::detect(candle, prev, snapshot, flow, config)
        .filter(|failed| trap.as_ref().is_none_or(|t| t.direction != failed.direction));
    events.extend(trap);
    events.extend(failed);

    events
}
