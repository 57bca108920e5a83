use crate::{
    candle::{AggregateOutcome, AuthoritativeCandle, Candle, CandleAggregator, CandleHistory},
    config::ScannerConfig,
    error::ScannerError,
    flow::{self, FlowContext, FlowInputs, FlowReading},
    indicator::{IndicatorSnapshot, IndicatorState},
    metrics::{Metrics, TransitionCounts},
    model::{Symbol, Trade},
    pattern::{self, StructuralEvent},
    permission::{self, PermissionSnapshot},
    state::{SymbolState, Transition},
    timeframe::{Timeframe, TimeframeRegistry, TimeframeRole},
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Candle stream of one (symbol, timeframe).
#[derive(Clone, Debug)]
pub struct TimeframeStream {
    role: TimeframeRole,
    aggregator: CandleAggregator,
    history: CandleHistory,
    indicators: IndicatorState,
    /// Indicator state as it was before the latest close. Lets a reconciled latest candle be
    /// re-derived without a replay.
    checkpoint: Option<IndicatorState>,
    snapshot: Option<IndicatorSnapshot>,
    flow: Option<FlowReading>,
    /// Flow reading preceding the latest close.
    flow_before_last: Option<FlowReading>,
    /// The latest close produced a snapshot. Unpriced closes leave the flow readings untouched.
    last_close_published: bool,
    /// Newest anchor open time a reconciliation result has landed for.
    reconciled_through: Option<i64>,
    /// A whole window passed without trades since the last reconciliation.
    gap_pending: bool,
}

impl TimeframeStream {
    fn new(timeframe: Timeframe, role: TimeframeRole, config: &ScannerConfig) -> Self {
        Self {
            role,
            aggregator: CandleAggregator::new(timeframe),
            history: CandleHistory::new(config.history_len),
            indicators: IndicatorState::new(timeframe, &config.indicator),
            checkpoint: None,
            snapshot: None,
            flow: None,
            flow_before_last: None,
            last_close_published: false,
            reconciled_through: None,
            gap_pending: false,
        }
    }

    pub fn role(&self) -> TimeframeRole {
        self.role
    }

    pub fn open_candle(&self) -> Option<&Candle> {
        self.aggregator.open_candle()
    }

    pub fn history(&self) -> &CandleHistory {
        &self.history
    }

    pub fn snapshot(&self) -> Option<&IndicatorSnapshot> {
        self.snapshot.as_ref()
    }

    pub fn flow(&self) -> Option<FlowReading> {
        self.flow
    }

    pub fn reconciled_through(&self) -> Option<i64> {
        self.reconciled_through
    }

    pub fn gap_pending(&self) -> bool {
        self.gap_pending
    }

    /// Fold a closed candle into the indicators, keeping a checkpoint for the streams whose
    /// latest close can be re-derived after reconciliation.
    fn fold(&mut self, candle: &Candle, config: &ScannerConfig) -> Option<(IndicatorSnapshot, FlowContext)> {
        if self.role != TimeframeRole::Auxiliary {
            self.checkpoint = Some(self.indicators.clone());
        }
        self.last_close_published = false;
        let snapshot = self.indicators.on_candle_closed(candle)?;
        let published = self.publish(snapshot, config);
        self.last_close_published = true;
        Some(published)
    }

    fn publish(
        &mut self,
        snapshot: IndicatorSnapshot,
        config: &ScannerConfig,
    ) -> (IndicatorSnapshot, FlowContext) {
        let current = FlowInputs::from_snapshot(&snapshot)
            .map(|inputs| flow::classify(inputs, &config.flow, config.primary_timeframe))
            .unwrap_or(FlowReading::NEUTRAL);
        self.flow_before_last = self.flow.replace(current);
        self.snapshot = Some(snapshot.clone());
        (
            snapshot,
            FlowContext {
                current,
                previous: self.flow_before_last,
            },
        )
    }
}

/// Outcome of one closed candle on the primary or permission stream.
#[derive(Clone, PartialEq, Debug)]
pub struct CloseEvaluation {
    pub timeframe: Timeframe,
    pub role: TimeframeRole,
    pub candle: Candle,
    pub snapshot: IndicatorSnapshot,
    pub flow: FlowReading,
    pub events: Vec<StructuralEvent>,
    pub transition: Option<Transition>,
}

/// Result of applying authoritative candles to one stream.
#[derive(Clone, PartialEq, Debug)]
pub enum BookReconcile {
    /// A newer anchor already landed. Nothing was touched.
    Stale,
    Applied {
        replaced: usize,
        /// Re-derived evaluation of the latest close, when it was replaced.
        reevaluation: Option<CloseEvaluation>,
    },
}

/// Read-only copy of a symbol's decision state.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct SymbolView {
    pub symbol: Symbol,
    pub state: SymbolState,
    pub permission: PermissionSnapshot,
    pub flow: Option<FlowReading>,
    pub snapshot: Option<IndicatorSnapshot>,
    pub transitions: TransitionCounts,
    pub gap_pending: bool,
}

/// All mutable state of one symbol. Guarded by a single exclusive lock in the
/// [`Engine`](super::Engine).
#[derive(Debug)]
pub struct SymbolBook {
    symbol: Symbol,
    streams: IndexMap<Timeframe, TimeframeStream>,
    primary: Timeframe,
    state: SymbolState,
    permission: PermissionSnapshot,
    transitions: TransitionCounts,
}

impl SymbolBook {
    pub fn new(
        symbol: Symbol,
        registry: &TimeframeRegistry,
        config: &ScannerConfig,
        now_ms: i64,
    ) -> Self {
        let streams = registry
            .iter()
            .map(|(timeframe, role)| (timeframe, TimeframeStream::new(timeframe, role, config)))
            .collect();

        Self {
            state: SymbolState::new(symbol.clone(), &config.state, now_ms),
            symbol,
            streams,
            primary: registry.primary(),
            permission: PermissionSnapshot::pending(registry.permission()),
            transitions: TransitionCounts::default(),
        }
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn state(&self) -> &SymbolState {
        &self.state
    }

    pub fn permission(&self) -> &PermissionSnapshot {
        &self.permission
    }

    pub fn transitions(&self) -> TransitionCounts {
        self.transitions
    }

    pub fn stream(&self, timeframe: Timeframe) -> Result<&TimeframeStream, ScannerError> {
        self.streams
            .get(&timeframe)
            .ok_or_else(|| self.unknown_timeframe(timeframe))
    }

    fn stream_mut(&mut self, timeframe: Timeframe) -> Result<&mut TimeframeStream, ScannerError> {
        let symbol = &self.symbol;
        self.streams
            .get_mut(&timeframe)
            .ok_or_else(|| ScannerError::UnknownTimeframe {
                symbol: symbol.clone(),
                timeframe: timeframe.label(),
            })
    }

    fn unknown_timeframe(&self, timeframe: Timeframe) -> ScannerError {
        ScannerError::UnknownTimeframe {
            symbol: self.symbol.clone(),
            timeframe: timeframe.label(),
        }
    }

    pub fn view(&self) -> SymbolView {
        let primary = self.streams.get(&self.primary);
        SymbolView {
            symbol: self.symbol.clone(),
            state: self.state.clone(),
            permission: self.permission.clone(),
            flow: primary.and_then(TimeframeStream::flow),
            snapshot: primary.and_then(|stream| stream.snapshot().cloned()),
            transitions: self.transitions,
            gap_pending: self.streams.values().any(TimeframeStream::gap_pending),
        }
    }

    /// Route a validated trade to every timeframe stream.
    ///
    /// Streams are independent: a trade late for a short timeframe may still belong to the open
    /// window of a longer one. The trade is only rejected if no stream accepts it.
    pub fn ingest(
        &mut self,
        trade: &Trade,
        now_ms: i64,
        config: &ScannerConfig,
        metrics: &Metrics,
    ) -> Result<Vec<CloseEvaluation>, ScannerError> {
        let mut accepted = false;
        let mut late = None;
        let mut closed = Vec::new();

        for (timeframe, stream) in self.streams.iter_mut() {
            match stream.aggregator.ingest(trade) {
                Ok(AggregateOutcome::Rotated {
                    closed: candle,
                    skipped_windows,
                }) => {
                    accepted = true;
                    metrics.candle_closed();
                    if skipped_windows > 0 {
                        metrics.gap(skipped_windows);
                        stream.gap_pending = true;
                        warn!(
                            symbol = %self.symbol,
                            timeframe = %timeframe,
                            skipped_windows,
                            "trade gap, stream may be inaccurate until reconciled"
                        );
                    }
                    closed.push((*timeframe, stream.role, candle));
                }
                Ok(_) => accepted = true,
                Err(error) => late = Some(error),
            }
        }

        if !accepted {
            if let Some(error) = late {
                return Err(error);
            }
        }

        // Slow closes first so a primary close on the same boundary sees the fresh permission
        closed.sort_by_key(|(_, role, _)| match role {
            TimeframeRole::Permission => 0,
            TimeframeRole::Auxiliary => 1,
            TimeframeRole::Primary => 2,
        });

        let mut evaluations = Vec::new();
        for (timeframe, role, candle) in closed {
            if let Some(evaluation) = self.on_candle_closed(timeframe, role, candle, now_ms, config)? {
                evaluations.push(evaluation);
            }
        }
        Ok(evaluations)
    }

    fn on_candle_closed(
        &mut self,
        timeframe: Timeframe,
        role: TimeframeRole,
        candle: Candle,
        now_ms: i64,
        config: &ScannerConfig,
    ) -> Result<Option<CloseEvaluation>, ScannerError> {
        let stream = self.stream_mut(timeframe)?;
        if !stream.history.push(candle.clone()) {
            debug!(
                symbol = %candle.symbol,
                timeframe = %timeframe,
                open_time = candle.open_time_ms,
                "duplicate candle identity, close ignored"
            );
            return Ok(None);
        }

        let Some((snapshot, flow)) = stream.fold(&candle, config) else {
            debug!(
                symbol = %candle.symbol,
                timeframe = %timeframe,
                open_time = candle.open_time_ms,
                "unpriced candle skipped by indicators"
            );
            return Ok(None);
        };

        match role {
            TimeframeRole::Auxiliary => Ok(None),
            TimeframeRole::Permission => {
                self.permission = permission::evaluate(&candle, &snapshot, &config.permission);
                debug!(
                    symbol = %self.symbol,
                    allowed = self.permission.allowed,
                    reason = %self.permission.reason,
                    "permission updated"
                );
                Ok(Some(CloseEvaluation {
                    timeframe,
                    role,
                    candle,
                    snapshot,
                    flow: flow.current,
                    events: Vec::new(),
                    transition: None,
                }))
            }
            TimeframeRole::Primary => {
                let events = stream
                    .history
                    .previous()
                    .map(|prev| pattern::detect_all(&candle, prev, &snapshot, &flow, &config.pattern))
                    .unwrap_or_default();

                let transition =
                    self.state
                        .evaluate(&events, &self.permission, now_ms, &config.state);
                if let Some(transition) = &transition {
                    self.transitions.record(transition.to);
                }

                Ok(Some(CloseEvaluation {
                    timeframe,
                    role,
                    candle,
                    snapshot,
                    flow: flow.current,
                    events,
                    transition,
                }))
            }
        }
    }

    /// Wall clock timers: ACT expiry and WATCH idle decay.
    pub fn check_timers(&mut self, now_ms: i64, config: &ScannerConfig) -> Option<Transition> {
        let transition = self.state.check_timers(now_ms, &config.state)?;
        self.transitions.record(transition.to);
        Some(transition)
    }

    /// Fill a stream from authoritative closed candles. Updates history and indicators only.
    pub fn warm_up(
        &mut self,
        timeframe: Timeframe,
        mut candles: Vec<AuthoritativeCandle>,
        config: &ScannerConfig,
    ) -> Result<usize, ScannerError> {
        let symbol = self.symbol.clone();
        let stream = self.stream_mut(timeframe)?;
        let open_time = stream.open_candle().map(|open| open.open_time_ms);

        candles.sort_by_key(|candle| candle.open_time_ms);

        let mut filled = 0;
        let mut last = None;
        for kline in candles {
            if open_time.is_some_and(|open_time| kline.open_time_ms >= open_time) {
                break;
            }
            let candle = Candle::from_authoritative(symbol.clone(), timeframe, &kline);
            if !stream.history.push(candle.clone()) {
                continue;
            }
            filled += 1;
            if let Some((snapshot, _)) = stream.fold(&candle, config) {
                last = Some((candle, snapshot));
            }
        }

        if let Some((candle, snapshot)) = last {
            stream.aggregator.seed_last_close(candle.close);
            if stream.role == TimeframeRole::Permission {
                self.permission = permission::evaluate(&candle, &snapshot, &config.permission);
            }
        }

        debug!(symbol = %symbol, timeframe = %timeframe, filled, "warm-up fill applied");
        Ok(filled)
    }

    /// Overwrite closed candles with authoritative OHLCV, retaining local CVD.
    ///
    /// The open candle is never touched. When the latest closed candle is replaced its snapshot
    /// is re-derived from the checkpoint and detectors re-run. State transitions are not.
    pub fn reconcile(
        &mut self,
        timeframe: Timeframe,
        anchor_open_time_ms: i64,
        candles: &[AuthoritativeCandle],
        config: &ScannerConfig,
    ) -> Result<BookReconcile, ScannerError> {
        let symbol = self.symbol.clone();
        let stream = self.stream_mut(timeframe)?;

        if stream
            .reconciled_through
            .is_some_and(|through| through > anchor_open_time_ms)
        {
            return Ok(BookReconcile::Stale);
        }
        stream.reconciled_through = Some(anchor_open_time_ms);

        let open_time = stream.open_candle().map(|open| open.open_time_ms);
        let latest_open_time = stream.history.last().map(|last| last.open_time_ms);

        let mut replaced = 0;
        let mut latest_replaced = false;
        for kline in candles {
            if open_time.is_some_and(|open_time| kline.open_time_ms >= open_time) {
                continue;
            }
            if let Some(candle) = stream.history.get_mut(kline.open_time_ms) {
                candle.reconcile(kline);
                replaced += 1;
                latest_replaced |= Some(kline.open_time_ms) == latest_open_time;
            }
        }
        if replaced > 0 {
            stream.gap_pending = false;
        }

        if !latest_replaced {
            return Ok(BookReconcile::Applied {
                replaced,
                reevaluation: None,
            });
        }

        let reevaluation = self.reevaluate_latest(timeframe, config)?;
        debug!(
            symbol = %symbol,
            timeframe = %timeframe,
            replaced,
            reevaluated = reevaluation.is_some(),
            "reconciliation applied"
        );
        Ok(BookReconcile::Applied {
            replaced,
            reevaluation,
        })
    }

    fn reevaluate_latest(
        &mut self,
        timeframe: Timeframe,
        config: &ScannerConfig,
    ) -> Result<Option<CloseEvaluation>, ScannerError> {
        let stream = self.stream_mut(timeframe)?;
        let role = stream.role;
        let (Some(checkpoint), Some(candle)) = (stream.checkpoint.clone(), stream.history.last().cloned())
        else {
            return Ok(None);
        };

        let mut indicators = checkpoint;
        let Some(snapshot) = indicators.on_candle_closed(&candle) else {
            return Ok(None);
        };
        stream.indicators = indicators;

        // Restore the pre-close reading so the context matches the live evaluation
        if stream.last_close_published {
            stream.flow = stream.flow_before_last;
        }
        let (snapshot, flow) = stream.publish(snapshot, config);
        stream.last_close_published = true;

        let events = match role {
            TimeframeRole::Primary => stream
                .history
                .previous()
                .map(|prev| pattern::detect_all(&candle, prev, &snapshot, &flow, &config.pattern))
                .unwrap_or_default(),
            TimeframeRole::Permission => {
                self.permission = permission::evaluate(&candle, &snapshot, &config.permission);
                Vec::new()
            }
            TimeframeRole::Auxiliary => Vec::new(),
        };

        Ok(Some(CloseEvaluation {
            timeframe,
            role,
            candle,
            snapshot,
            flow: flow.current,
            events,
            transition: None,
        }))
    }
}
