//! Trade to candle aggregation for a single (symbol, timeframe) stream.
//!
//! Uses trade timestamps (not wall clock) for window boundaries so replayed trades land in the
//! same candles as live ones.

use super::Candle;
use crate::{error::ScannerError, model::Trade, timeframe::Timeframe};

/// Result of folding one trade into a [`CandleAggregator`].
#[derive(Clone, PartialEq, Debug)]
pub enum AggregateOutcome {
    /// First trade of the stream opened a candle.
    Opened,
    /// Trade updated the open candle in place.
    Updated,
    /// Trade belongs to a later window: the previous candle closed and a new one opened.
    Rotated {
        closed: Candle,
        /// Whole windows between the closed candle and the new one that saw no trades.
        skipped_windows: i64,
    },
}

/// Owns the open candle of one (symbol, timeframe) stream.
#[derive(Clone, Debug)]
pub struct CandleAggregator {
    timeframe: Timeframe,
    open: Option<Candle>,
    last_close: Option<f64>,
}

impl CandleAggregator {
    pub fn new(timeframe: Timeframe) -> Self {
        Self {
            timeframe,
            open: None,
            last_close: None,
        }
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    /// Currently open (partially formed) candle.
    pub fn open_candle(&self) -> Option<&Candle> {
        self.open.as_ref()
    }

    /// Seed the close used to anchor a candle opened by a spot trade (eg/ after warm-up fill).
    pub fn seed_last_close(&mut self, close: f64) {
        if self.open.is_none() {
            self.last_close = Some(close);
        }
    }

    /// Fold a trade into the stream.
    ///
    /// Trades older than the open candle's window are rejected as late.
    pub fn ingest(&mut self, trade: &Trade) -> Result<AggregateOutcome, ScannerError> {
        let window = self.timeframe.align(trade.timestamp_ms);

        let Some(open) = self.open.as_mut() else {
            self.open = Some(Candle::open_with(
                self.timeframe,
                window,
                trade,
                self.last_close,
            ));
            return Ok(AggregateOutcome::Opened);
        };

        if window == open.open_time_ms {
            open.apply(trade);
            return Ok(AggregateOutcome::Updated);
        }

        if window < open.open_time_ms {
            return Err(ScannerError::LateTrade {
                symbol: trade.symbol.clone(),
                timestamp_ms: trade.timestamp_ms,
                open_time_ms: open.open_time_ms,
            });
        }

        let skipped_windows =
            (window - open.open_time_ms) / self.timeframe.duration_ms() - 1;

        let seed = if open.priced {
            Some(open.close)
        } else {
            self.last_close
        };

        let next = Candle::open_with(self.timeframe, window, trade, seed);
        let mut closed = std::mem::replace(open, next);
        closed.closed = true;
        if closed.priced {
            self.last_close = Some(closed.close);
        }

        Ok(AggregateOutcome::Rotated {
            closed,
            skipped_windows,
        })
    }
}
