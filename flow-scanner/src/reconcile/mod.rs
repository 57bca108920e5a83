//! Background reconciliation of closed candles against an authoritative source.
//!
//! Requests pass through a capacity-bounded queue with a reject-new policy, and at most one
//! request per symbol is queued or running at any time. Workers fetch without holding any lock,
//! then hand the result to [`Engine::apply_reconciliation`] for the in-memory replace.

use crate::{
    candle::AuthoritativeCandle,
    engine::{Engine, ReconcileOutcome},
    error::ScannerError,
    model::Symbol,
    timeframe::Timeframe,
};
use derive_more::Constructor;
use fnv::FnvHashSet;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub mod source;

pub use source::{BinanceKlineSource, CandleSource};

/// Re-fetch of the closed candles ending at an anchor candle.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Deserialize, Serialize)]
pub struct ReconcileRequest {
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    /// Newest candle covered. Results are ordered by this anchor, last writer wins.
    pub anchor_open_time_ms: i64,
    pub start_time_ms: i64,
    pub end_time_ms: i64,
}

impl ReconcileRequest {
    /// Cover `lookback_candles` closed candles ending at the anchor.
    pub fn new(
        symbol: Symbol,
        timeframe: Timeframe,
        anchor_open_time_ms: i64,
        lookback_candles: usize,
    ) -> Self {
        let lookback = lookback_candles.max(1) as i64;
        let duration = timeframe.duration_ms();
        Self {
            symbol,
            timeframe,
            anchor_open_time_ms,
            start_time_ms: anchor_open_time_ms - (lookback - 1) * duration,
            end_time_ms: anchor_open_time_ms + duration - 1,
        }
    }
}

/// Fetched candles for a request.
#[derive(Clone, PartialEq, Debug, Constructor)]
pub struct ReconcileResult {
    pub request: ReconcileRequest,
    pub candles: Vec<AuthoritativeCandle>,
}

/// Handle used to schedule reconciliation. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Reconciler {
    engine: Arc<Engine>,
    tx: mpsc::Sender<ReconcileRequest>,
    in_flight: Arc<Mutex<FnvHashSet<Symbol>>>,
}

impl Reconciler {
    /// Spawn the worker pool sized from the engine configuration.
    pub fn spawn<Source>(engine: Arc<Engine>, source: Arc<Source>) -> (Self, Vec<JoinHandle<()>>)
    where
        Source: CandleSource + 'static,
    {
        let config = engine.config().reconcile.clone();
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let in_flight = Arc::new(Mutex::new(FnvHashSet::default()));

        let handles = (0..config.workers.max(1))
            .map(|worker| {
                tokio::spawn(run_worker(
                    worker,
                    Arc::clone(&engine),
                    Arc::clone(&source),
                    Arc::clone(&rx),
                    Arc::clone(&in_flight),
                    config.fetch_timeout,
                ))
            })
            .collect();

        info!(
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            "reconciliation workers started"
        );

        (
            Self {
                engine,
                tx,
                in_flight,
            },
            handles,
        )
    }

    /// Schedule a request without waiting.
    ///
    /// Rejected if a request for the same symbol is already queued or running, or if the queue
    /// is full. Rejections are transient: the next closed candle schedules again.
    pub fn request(&self, request: ReconcileRequest) -> Result<(), ScannerError> {
        let result = self.try_request(request);
        if let Err(error) = &result {
            self.engine.metrics_handle().reconcile_rejected(error);
            debug!(%error, "reconciliation request rejected");
        }
        result
    }

    fn try_request(&self, request: ReconcileRequest) -> Result<(), ScannerError> {
        let symbol = request.symbol.clone();
        if !self.in_flight.lock().insert(symbol.clone()) {
            return Err(ScannerError::ReconcileInFlight(symbol));
        }

        match self.tx.try_send(request) {
            Ok(()) => {
                self.engine.metrics_handle().reconcile_enqueued();
                Ok(())
            }
            Err(error) => {
                self.in_flight.lock().remove(&symbol);
                match error {
                    TrySendError::Full(_) => Err(ScannerError::ReconcileQueueFull(symbol)),
                    TrySendError::Closed(_) => Err(ScannerError::ChannelClosed(
                        "reconciliation queue".to_string(),
                    )),
                }
            }
        }
    }

    /// Symbols with a request queued or running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }
}

async fn run_worker<Source>(
    worker: usize,
    engine: Arc<Engine>,
    source: Arc<Source>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<ReconcileRequest>>>,
    in_flight: Arc<Mutex<FnvHashSet<Symbol>>>,
    fetch_timeout: Duration,
) where
    Source: CandleSource + 'static,
{
    loop {
        let request = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(request) = request else {
            debug!(worker, "reconciliation queue closed, worker stopping");
            break;
        };
        engine.metrics_handle().reconcile_dequeued();

        let fetched = tokio::time::timeout(
            fetch_timeout,
            source.fetch(
                &request.symbol,
                request.timeframe,
                request.start_time_ms,
                request.end_time_ms,
            ),
        )
        .await
        .unwrap_or_else(|_| {
            Err(ScannerError::Fetch(format!(
                "timed out after {}ms",
                fetch_timeout.as_millis()
            )))
        });

        let symbol = request.symbol.clone();
        let applied = fetched
            .and_then(|candles| engine.apply_reconciliation(ReconcileResult::new(request, candles)));
        match applied {
            Ok(ReconcileOutcome::Applied {
                replaced, alerts, ..
            }) => {
                debug!(
                    worker,
                    symbol = %symbol,
                    replaced,
                    alerts = alerts.len(),
                    "reconciliation applied"
                );
            }
            Ok(ReconcileOutcome::Stale) => {}
            Err(error) => {
                engine.metrics_handle().reconcile_failed();
                warn!(
                    worker,
                    symbol = %symbol,
                    %error,
                    transient = error.is_transient(),
                    "reconciliation failed, local history stays authoritative"
                );
            }
        }

        in_flight.lock().remove(&symbol);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::ScannerConfig, engine::ManualClock};
    use async_trait::async_trait;
    use tokio::sync::Notify;

    /// Source that blocks every fetch until released.
    #[derive(Debug, Default)]
    struct GatedSource {
        release: Notify,
    }

    #[async_trait]
    impl CandleSource for GatedSource {
        async fn fetch(
            &self,
            _: &Symbol,
            _: Timeframe,
            _: i64,
            _: i64,
        ) -> Result<Vec<AuthoritativeCandle>, ScannerError> {
            self.release.notified().await;
            Ok(Vec::new())
        }
    }

    fn engine(workers: usize, queue_capacity: usize) -> Arc<Engine> {
        let mut config = ScannerConfig::default().with_symbols(["BTCUSDT", "ETHUSDT", "SOLUSDT"]);
        config.reconcile.workers = workers;
        config.reconcile.queue_capacity = queue_capacity;
        Arc::new(Engine::with_clock(config, Arc::new(ManualClock::new(0))).unwrap())
    }

    fn request(symbol: &str) -> ReconcileRequest {
        ReconcileRequest::new(Symbol::new(symbol), Timeframe::from_minutes(3), 180_000, 3)
    }

    #[test]
    fn test_reconcile_request_range() {
        let request = request("BTCUSDT");
        assert_eq!(request.start_time_ms, -180_000);
        assert_eq!(request.end_time_ms, 359_999);
    }

    #[tokio::test]
    async fn test_request_rejects_second_in_flight_for_symbol() {
        let engine = engine(1, 8);
        let (reconciler, _) = Reconciler::spawn(engine.clone(), Arc::new(GatedSource::default()));

        assert!(reconciler.request(request("BTCUSDT")).is_ok());
        assert_eq!(
            reconciler.request(request("BTCUSDT")),
            Err(ScannerError::ReconcileInFlight(Symbol::new("BTCUSDT")))
        );
        assert!(reconciler.request(request("ETHUSDT")).is_ok());
        assert_eq!(reconciler.in_flight(), 2);
        assert_eq!(engine.metrics().reconcile_rejected_in_flight, 1);
    }

    #[tokio::test]
    async fn test_request_rejects_when_queue_full() {
        // One worker parked on a fetch, one queue slot
        let engine = engine(1, 1);
        let source = Arc::new(GatedSource::default());
        let (reconciler, _) = Reconciler::spawn(engine.clone(), source.clone());

        reconciler.request(request("BTCUSDT")).unwrap();
        while engine.metrics().reconcile_queue_depth > 0 {
            tokio::task::yield_now().await;
        }
        reconciler.request(request("ETHUSDT")).unwrap();

        let rejected = reconciler.request(request("SOLUSDT"));
        assert_eq!(rejected, Err(ScannerError::ReconcileQueueFull(Symbol::new("SOLUSDT"))));
        assert!(rejected.unwrap_err().is_transient());
        assert_eq!(reconciler.in_flight(), 2);

        // A rejected symbol can be scheduled again once capacity frees up
        source.release.notify_one();
        while reconciler.in_flight() > 1 {
            tokio::task::yield_now().await;
        }
        while engine.metrics().reconcile_queue_depth > 0 {
            tokio::task::yield_now().await;
        }
        assert!(reconciler.request(request("SOLUSDT")).is_ok());
    }
}
