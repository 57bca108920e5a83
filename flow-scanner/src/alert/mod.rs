//! Alert scoring, admission and deduplication.
//!
//! Structural events from one evaluation cycle (one closed candle of one symbol) are scored,
//! ranked and admitted through the [`AlertGate`]. The gate owns its own lock, which is only ever
//! taken after the symbol lock has been released.

use crate::{
    config::AlertConfig,
    flow::{FlowReading, FlowRegime},
    indicator::IndicatorSnapshot,
    model::{Direction, Symbol},
    pattern::{PatternKind, StructuralEvent},
    timeframe::Timeframe,
};
use chrono::{DateTime, Utc};
use derive_more::Display;
use fnv::FnvHashMap;
use itertools::Itertools;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub mod dedup;
pub mod scorer;

pub use dedup::{DedupKey, DedupStore};
pub use scorer::{ScoreBreakdown, score};

/// Structured alert delivered to downstream sinks.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct AlertRecord {
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    pub pattern: PatternKind,
    pub direction: Direction,
    pub flow_regime: FlowRegime,
    pub score: f64,
    pub candle_open_time_ms: i64,
    pub price: f64,
    pub level: Option<f64>,
    /// Produced by re-evaluating a reconciled candle rather than the live close.
    pub reconciled: bool,
    pub emitted_at: DateTime<Utc>,
}

impl AlertRecord {
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            symbol: self.symbol.clone(),
            pattern: self.pattern,
            candle_open_time_ms: self.candle_open_time_ms,
        }
    }
}

/// Why a scored event did not become an alert.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Deserialize, Serialize)]
pub enum Suppression {
    #[display("score below threshold")]
    BelowThreshold,
    #[display("flow regime NEUTRAL")]
    NeutralFlow,
    #[display("pattern cooldown")]
    Cooldown,
    #[display("duplicate alert key")]
    Duplicate,
}

/// Result of one admission pass.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct Admission {
    pub emitted: Vec<AlertRecord>,
    pub suppressed: Vec<(PatternKind, Suppression)>,
}

#[derive(Debug)]
struct GateState {
    dedup: DedupStore,
    /// Cooldown expiry per (symbol, pattern).
    cooldowns: FnvHashMap<(Symbol, PatternKind), i64>,
}

/// Admission filter shared by the live path and reconciliation re-evaluation.
#[derive(Debug)]
pub struct AlertGate {
    config: AlertConfig,
    state: Mutex<GateState>,
}

impl AlertGate {
    pub fn new(config: AlertConfig) -> Self {
        let dedup = DedupStore::new(config.dedup_retention_ms, config.dedup_capacity);
        Self {
            config,
            state: Mutex::new(GateState {
                dedup,
                cooldowns: FnvHashMap::default(),
            }),
        }
    }

    pub fn config(&self) -> &AlertConfig {
        &self.config
    }

    /// Score, rank and admit the events of one evaluation cycle.
    ///
    /// An event is admitted when its score reaches the threshold or it ranks in the top N of the
    /// cycle, flow is not NEUTRAL, no cooldown stands for (symbol, pattern), and its dedup key
    /// has not been emitted within the retention horizon.
    pub fn admit(
        &self,
        events: &[StructuralEvent],
        flow: FlowReading,
        snapshot: &IndicatorSnapshot,
        now_ms: i64,
        reconciled: bool,
    ) -> Admission {
        let mut admission = Admission::default();
        if events.is_empty() {
            return admission;
        }

        let ranked = events
            .iter()
            .map(|event| {
                let breakdown = score(event, flow, snapshot, &self.config.weights);
                (event, breakdown.total())
            })
            .sorted_by(|(_, a), (_, b)| b.total_cmp(a))
            .collect::<Vec<_>>();

        let emitted_at = DateTime::<Utc>::from_timestamp_millis(now_ms).unwrap_or_default();
        let mut state = self.state.lock();
        state.cooldowns.retain(|_, until| *until > now_ms);

        for (rank, (event, total)) in ranked.into_iter().enumerate() {
            let in_top_n = rank < self.config.top_n;
            let verdict = if total < self.config.min_score && !in_top_n {
                Err(Suppression::BelowThreshold)
            } else if flow.regime == FlowRegime::Neutral {
                Err(Suppression::NeutralFlow)
            } else if state
                .cooldowns
                .contains_key(&(event.symbol.clone(), event.pattern))
            {
                Err(Suppression::Cooldown)
            } else {
                let key = DedupKey {
                    symbol: event.symbol.clone(),
                    pattern: event.pattern,
                    candle_open_time_ms: event.candle_open_time_ms,
                };
                if state.dedup.insert(key, now_ms) {
                    Ok(())
                } else {
                    Err(Suppression::Duplicate)
                }
            };

            match verdict {
                Ok(()) => {
                    if self.config.cooldown_ms > 0 {
                        state.cooldowns.insert(
                            (event.symbol.clone(), event.pattern),
                            now_ms + self.config.cooldown_ms,
                        );
                    }
                    let record = AlertRecord {
                        symbol: event.symbol.clone(),
                        timeframe: event.timeframe,
                        pattern: event.pattern,
                        direction: event.direction,
                        flow_regime: flow.regime,
                        score: total,
                        candle_open_time_ms: event.candle_open_time_ms,
                        price: event.close,
                        level: event.level,
                        reconciled,
                        emitted_at,
                    };
                    info!(
                        symbol = %record.symbol,
                        pattern = %record.pattern,
                        direction = %record.direction,
                        flow = %record.flow_regime,
                        score = record.score,
                        candle = record.candle_open_time_ms,
                        reconciled,
                        "alert emitted"
                    );
                    admission.emitted.push(record);
                }
                Err(reason) => {
                    debug!(
                        symbol = %event.symbol,
                        pattern = %event.pattern,
                        score = total,
                        %reason,
                        "alert suppressed"
                    );
                    admission.suppressed.push((event.pattern, reason));
                }
            }
        }

        admission
    }

    /// Evict expired dedup keys and cooldowns.
    pub fn prune(&self, now_ms: i64) {
        let mut state = self.state.lock();
        state.dedup.prune(now_ms);
        state.cooldowns.retain(|_, until| *until > now_ms);
    }

    /// Number of dedup keys currently retained.
    pub fn retained_keys(&self) -> usize {
        self.state.lock().dedup.len()
    }
}
