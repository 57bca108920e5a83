//! Flow Scanner
//!
//! Streaming engine that turns spot and perpetual trade flow into multi-timeframe candles,
//! incremental indicators, a shared flow regime reading and a per-symbol IGNORE / WATCH / ACT
//! attention state, emitting deduplicated alerts when structural patterns form while the slow
//! timeframe permission gate is open.
//!
//! The main entry point is [`Engine`](engine::Engine):
//! - [`Engine::ingest`](engine::Engine::ingest) folds one [`Trade`](model::Trade) into every
//!   registered timeframe. Closing a candle is the only trigger for indicators, detectors, state
//!   transitions and alerts.
//! - [`Engine::sweep_expired`](engine::Engine::sweep_expired) runs the wall clock timers.
//! - [`Reconciler`](reconcile::Reconciler) fetches authoritative candles in the background and
//!   overwrites local OHLCV while keeping locally derived CVD.
//!
//! State is volatile by design: nothing is persisted across restarts.

/// Alert scoring, admission and bounded deduplication.
pub mod alert;

/// Trade to candle aggregation and bounded candle history.
pub mod candle;

/// [`ScannerConfig`](config::ScannerConfig) and its groups.
pub mod config;

/// Per-symbol books, the [`Engine`](engine::Engine) and its clock.
pub mod engine;

/// All [`Error`](std::error::Error)s generated in Flow Scanner.
pub mod error;

/// Flow regime classification shared by every detector.
pub mod flow;

/// Incremental VWAP, ATR, percentile and CVD slope indicators.
pub mod indicator;

/// Lock-free counters and a serialisable snapshot.
pub mod metrics;

/// Core trade types.
pub mod model;

/// Structural pattern detectors.
pub mod pattern;

/// Slow timeframe permission gate.
pub mod permission;

/// Background reconciliation against an authoritative candle source.
pub mod reconcile;

/// IGNORE / WATCH / ACT state machine.
pub mod state;

/// Timeframes and the timeframe registry.
pub mod timeframe;

pub use alert::AlertRecord;
pub use config::ScannerConfig;
pub use engine::{Engine, IngestOutcome};
pub use error::ScannerError;
pub use model::{Direction, Side, SourceMarket, Symbol, Trade};
pub use state::AttentionState;
