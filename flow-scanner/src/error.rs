use crate::model::Symbol;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All errors generated in `flow-scanner`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Error)]
pub enum ScannerError {
    #[error("malformed trade for {symbol}: {reason}")]
    MalformedTrade { symbol: Symbol, reason: String },

    #[error("trade for unknown symbol: {0}")]
    UnknownSymbol(Symbol),

    #[error(
        "late trade for {symbol}: timestamp {timestamp_ms} precedes open candle at {open_time_ms}"
    )]
    LateTrade {
        symbol: Symbol,
        timestamp_ms: i64,
        open_time_ms: i64,
    },

    #[error("timeframe {timeframe} is not registered for {symbol}")]
    UnknownTimeframe { symbol: Symbol, timeframe: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("authoritative candle fetch failed: {0}")]
    Fetch(String),

    #[error("reconciliation queue full, rejected request for {0}")]
    ReconcileQueueFull(Symbol),

    #[error("reconciliation already in flight for {0}")]
    ReconcileInFlight(Symbol),

    #[error("open candle diagnostics are disabled")]
    DiagnosticsDisabled,

    #[error("channel closed: {0}")]
    ChannelClosed(String),
}

impl ScannerError {
    /// Determine if the failed operation may succeed when retried on the next scheduled cycle.
    ///
    /// Data integrity errors are never transient: the offending event is dropped.
    #[allow(clippy::match_like_matches_macro)]
    pub fn is_transient(&self) -> bool {
        match self {
            ScannerError::Fetch(_)
            | ScannerError::ReconcileQueueFull(_)
            | ScannerError::ReconcileInFlight(_) => true,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ScannerError {
    fn from(value: reqwest::Error) -> Self {
        Self::Fetch(value.to_string())
    }
}
