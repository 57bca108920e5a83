//! Per-symbol books behind one exclusive lock each, plus the shared alert gate.
//!
//! Lock discipline: at most one symbol lock is held at any time, and the alert gate lock is only
//! taken after the symbol lock has been released. Network I/O never happens under either.

use crate::{
    alert::{AlertGate, AlertRecord},
    candle::{AuthoritativeCandle, Candle},
    config::ScannerConfig,
    error::ScannerError,
    metrics::{Metrics, MetricsSnapshot},
    model::{Symbol, Trade},
    pattern::StructuralEvent,
    reconcile::{ReconcileRequest, ReconcileResult},
    state::Transition,
    timeframe::{Timeframe, TimeframeRegistry, TimeframeRole},
};
use chrono::Utc;
use fnv::FnvHashMap;
use parking_lot::Mutex;
use std::{
    fmt::Debug,
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
};
use tokio::sync::broadcast;
use tracing::{debug, info};

pub mod book;

pub use book::{BookReconcile, CloseEvaluation, SymbolBook, SymbolView, TimeframeStream};

/// Source of wall clock time in epoch milliseconds.
pub trait Clock: Debug + Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Copy, Clone, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Manually driven clock for deterministic timer tests and replays.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self(AtomicI64::new(now_ms))
    }

    pub fn set(&self, now_ms: i64) {
        self.0.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: i64) {
        self.0.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything one trade caused.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct IngestOutcome {
    /// Closed candles that reached the indicators, keyed by timeframe.
    pub closed: Vec<(Timeframe, i64)>,
    pub events: Vec<StructuralEvent>,
    pub transitions: Vec<Transition>,
    pub alerts: Vec<AlertRecord>,
    /// Reconciliation to schedule for each closed state-driving candle.
    pub reconcile: Vec<ReconcileRequest>,
}

/// Result of applying one reconciliation result.
#[derive(Clone, PartialEq, Debug)]
pub enum ReconcileOutcome {
    /// A newer result already landed for the stream and this one was discarded.
    Stale,
    Applied {
        replaced: usize,
        events: Vec<StructuralEvent>,
        alerts: Vec<AlertRecord>,
    },
}

/// Streaming engine: trade ingestion, candle closes, state transitions and alert admission for
/// a fixed symbol universe.
#[derive(Debug)]
pub struct Engine {
    config: ScannerConfig,
    registry: TimeframeRegistry,
    books: FnvHashMap<Symbol, Arc<Mutex<SymbolBook>>>,
    gate: AlertGate,
    metrics: Metrics,
    alerts: broadcast::Sender<AlertRecord>,
    clock: Arc<dyn Clock>,
}

impl Engine {
    pub fn new(config: ScannerConfig) -> Result<Self, ScannerError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: ScannerConfig, clock: Arc<dyn Clock>) -> Result<Self, ScannerError> {
        config.validate()?;
        let registry = config.registry()?;
        let now_ms = clock.now_ms();

        let books = config
            .symbols
            .iter()
            .map(|symbol| {
                let book = SymbolBook::new(symbol.clone(), &registry, &config, now_ms);
                (symbol.clone(), Arc::new(Mutex::new(book)))
            })
            .collect();

        let (alerts, _) = broadcast::channel(config.alert.broadcast_capacity.max(1));

        info!(
            symbols = config.symbols.len(),
            primary = %registry.primary(),
            permission = %registry.permission(),
            timeframes = registry.len(),
            initial_state = %config.state.initial_state,
            "engine initialised"
        );

        Ok(Self {
            gate: AlertGate::new(config.alert.clone()),
            config,
            registry,
            books,
            metrics: Metrics::default(),
            alerts,
            clock,
        })
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    pub fn registry(&self) -> &TimeframeRegistry {
        &self.registry
    }

    pub fn symbols(&self) -> impl Iterator<Item = &Symbol> + '_ {
        self.books.keys()
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub fn metrics_handle(&self) -> &Metrics {
        &self.metrics
    }

    /// Subscribe to every alert emitted from now on.
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<AlertRecord> {
        self.alerts.subscribe()
    }

    fn book(&self, symbol: &Symbol) -> Result<&Arc<Mutex<SymbolBook>>, ScannerError> {
        self.books
            .get(symbol)
            .ok_or_else(|| ScannerError::UnknownSymbol(symbol.clone()))
    }

    /// Ingest one trade. Malformed, unknown-symbol and late trades are dropped and counted.
    pub fn ingest(&self, trade: &Trade) -> Result<IngestOutcome, ScannerError> {
        self.metrics.trade_received();
        let result = self.ingest_inner(trade);
        if let Err(error) = &result {
            self.metrics.trade_dropped(error);
            debug!(symbol = %trade.symbol, market = %trade.market, %error, "trade dropped");
        }
        result
    }

    fn ingest_inner(&self, trade: &Trade) -> Result<IngestOutcome, ScannerError> {
        trade
            .validate()
            .map_err(|reason| ScannerError::MalformedTrade {
                symbol: trade.symbol.clone(),
                reason: reason.to_string(),
            })?;
        let book = self.book(&trade.symbol)?;

        let now_ms = self.clock.now_ms();
        let evaluations = book.lock().ingest(trade, now_ms, &self.config, &self.metrics)?;

        let mut outcome = IngestOutcome::default();
        for evaluation in evaluations {
            outcome
                .closed
                .push((evaluation.timeframe, evaluation.candle.open_time_ms));
            if evaluation.role != TimeframeRole::Primary {
                continue;
            }

            outcome.reconcile.push(ReconcileRequest::new(
                evaluation.candle.symbol.clone(),
                evaluation.timeframe,
                evaluation.candle.open_time_ms,
                self.config.reconcile.lookback_candles,
            ));
            outcome
                .alerts
                .extend(self.admit(&evaluation, now_ms, false));
            outcome.transitions.extend(evaluation.transition);
            outcome.events.extend(evaluation.events);
        }

        Ok(outcome)
    }

    /// Admit the events of one evaluation cycle and publish the resulting alerts. Must be called
    /// without any symbol lock held.
    fn admit(&self, evaluation: &CloseEvaluation, now_ms: i64, reconciled: bool) -> Vec<AlertRecord> {
        let admission = self.gate.admit(
            &evaluation.events,
            evaluation.flow,
            &evaluation.snapshot,
            now_ms,
            reconciled,
        );
        self.metrics
            .alerts(admission.emitted.len(), admission.suppressed.len());
        for record in &admission.emitted {
            // No receivers is not an error
            let _ = self.alerts.send(record.clone());
        }
        admission.emitted
    }

    /// Fill a stream from authoritative candles before live ingestion. Runs no detectors and
    /// no state transitions.
    pub fn warm_up(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        candles: Vec<AuthoritativeCandle>,
    ) -> Result<usize, ScannerError> {
        let book = self.book(symbol)?;
        let filled = book.lock().warm_up(timeframe, candles, &self.config)?;
        info!(symbol = %symbol, timeframe = %timeframe, filled, "warm-up complete");
        Ok(filled)
    }

    /// Apply fetched authoritative candles. The fetch has already completed: only the in-memory
    /// replace runs under the symbol lock.
    pub fn apply_reconciliation(
        &self,
        result: ReconcileResult,
    ) -> Result<ReconcileOutcome, ScannerError> {
        let ReconcileResult { request, candles } = result;
        let book = self.book(&request.symbol)?;

        let applied = book.lock().reconcile(
            request.timeframe,
            request.anchor_open_time_ms,
            &candles,
            &self.config,
        )?;

        match applied {
            BookReconcile::Stale => {
                self.metrics.reconcile_stale();
                debug!(
                    symbol = %request.symbol,
                    timeframe = %request.timeframe,
                    anchor = request.anchor_open_time_ms,
                    "stale reconciliation result discarded"
                );
                Ok(ReconcileOutcome::Stale)
            }
            BookReconcile::Applied {
                replaced,
                reevaluation,
            } => {
                self.metrics.reconcile_applied();
                let Some(evaluation) = reevaluation else {
                    return Ok(ReconcileOutcome::Applied {
                        replaced,
                        events: Vec::new(),
                        alerts: Vec::new(),
                    });
                };

                let alerts = match evaluation.role {
                    TimeframeRole::Primary => self.admit(&evaluation, self.clock.now_ms(), true),
                    _ => Vec::new(),
                };
                Ok(ReconcileOutcome::Applied {
                    replaced,
                    events: evaluation.events,
                    alerts,
                })
            }
        }
    }

    /// Run wall clock timers for every symbol, one lock at a time.
    pub fn sweep_expired(&self) -> Vec<Transition> {
        let now_ms = self.clock.now_ms();
        let transitions = self
            .books
            .values()
            .filter_map(|book| book.lock().check_timers(now_ms, &self.config))
            .collect::<Vec<_>>();
        self.gate.prune(now_ms);
        transitions
    }

    /// Copy of the partially formed candle. Diagnostics only: never feeds a state decision.
    pub fn peek_open_candle(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
    ) -> Result<Option<Candle>, ScannerError> {
        if !self.config.open_candle_diagnostics {
            return Err(ScannerError::DiagnosticsDisabled);
        }
        let book = self.book(symbol)?.lock();
        Ok(book.stream(timeframe)?.open_candle().cloned())
    }

    /// Copy of the closed candle history of one stream, oldest first.
    pub fn history(&self, symbol: &Symbol, timeframe: Timeframe) -> Result<Vec<Candle>, ScannerError> {
        let book = self.book(symbol)?.lock();
        Ok(book.stream(timeframe)?.history().iter().cloned().collect())
    }

    pub fn state_view(&self, symbol: &Symbol) -> Result<SymbolView, ScannerError> {
        Ok(self.book(symbol)?.lock().view())
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        let transitions = self
            .books
            .iter()
            .map(|(symbol, book)| (symbol.clone(), book.lock().transitions()))
            .collect();
        self.metrics.snapshot(transitions)
    }
}
