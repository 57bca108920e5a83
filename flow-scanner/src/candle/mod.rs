//! Fixed-duration candles aggregated from spot and perpetual trades.
//!
//! Source segregation: OHLC is only ever moved by perpetual trades. Spot trades feed volume and
//! CVD so a basis spread between the two markets can never produce spurious level crossings.

use crate::{
    model::{Direction, SourceMarket, Symbol, Trade},
    timeframe::Timeframe,
};
use serde::{Deserialize, Serialize};

pub mod aggregator;
pub mod history;

pub use aggregator::{AggregateOutcome, CandleAggregator};
pub use history::CandleHistory;

/// OHLCV candle identified by (symbol, timeframe, open time).
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct Candle {
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    pub open_time_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Combined spot + perp volume.
    pub volume: f64,
    pub spot_volume: f64,
    pub perp_volume: f64,
    /// Combined signed volume delta (buy - sell) of both markets.
    pub cvd: f64,
    pub spot_cvd: f64,
    pub perp_cvd: f64,
    /// Σ(price × volume) over price-source trades.
    pub vwap_pv: f64,
    /// Σ(volume) over price-source trades.
    pub vwap_volume: f64,
    pub trade_count: u64,
    /// False until a price-source trade (or authoritative data) has set OHLC.
    pub priced: bool,
    pub closed: bool,
    /// OHLCV was overwritten from the authoritative source.
    pub reconciled: bool,
}

/// Authoritative kline: OHLCV only, the source has no CVD.
#[derive(Copy, Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct AuthoritativeCandle {
    pub open_time_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl AuthoritativeCandle {
    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }
}

impl Candle {
    /// Open a candle from the trade that starts its window.
    ///
    /// A spot trade cannot set price: the candle is seeded flat at `seed_close` (the previous
    /// close) and stays unpriced until the first perpetual trade arrives.
    pub fn open_with(
        timeframe: Timeframe,
        open_time_ms: i64,
        trade: &Trade,
        seed_close: Option<f64>,
    ) -> Self {
        let seed = seed_close.unwrap_or(0.0);
        let mut candle = Self {
            symbol: trade.symbol.clone(),
            timeframe,
            open_time_ms,
            open: seed,
            high: seed,
            low: seed,
            close: seed,
            volume: 0.0,
            spot_volume: 0.0,
            perp_volume: 0.0,
            cvd: 0.0,
            spot_cvd: 0.0,
            perp_cvd: 0.0,
            vwap_pv: 0.0,
            vwap_volume: 0.0,
            trade_count: 0,
            priced: false,
            closed: false,
            reconciled: false,
        };
        candle.apply(trade);
        candle
    }

    /// Build a closed candle from authoritative data (warm-up fill).
    pub fn from_authoritative(
        symbol: Symbol,
        timeframe: Timeframe,
        kline: &AuthoritativeCandle,
    ) -> Self {
        Self {
            symbol,
            timeframe,
            open_time_ms: kline.open_time_ms,
            open: kline.open,
            high: kline.high,
            low: kline.low,
            close: kline.close,
            volume: kline.volume,
            spot_volume: 0.0,
            perp_volume: kline.volume,
            cvd: 0.0,
            spot_cvd: 0.0,
            perp_cvd: 0.0,
            vwap_pv: kline.typical_price() * kline.volume,
            vwap_volume: kline.volume,
            trade_count: 0,
            priced: true,
            closed: true,
            reconciled: true,
        }
    }

    /// Fold a trade into this open candle.
    pub fn apply(&mut self, trade: &Trade) {
        let delta = trade.delta();
        self.volume += trade.quantity;
        self.cvd += delta;
        self.trade_count += 1;

        match trade.market {
            SourceMarket::Spot => {
                self.spot_volume += trade.quantity;
                self.spot_cvd += delta;
            }
            SourceMarket::Perp => {
                self.perp_volume += trade.quantity;
                self.perp_cvd += delta;
                self.vwap_pv += trade.price * trade.quantity;
                self.vwap_volume += trade.quantity;

                if self.priced {
                    self.high = self.high.max(trade.price);
                    self.low = self.low.min(trade.price);
                    self.close = trade.price;
                } else {
                    self.open = trade.price;
                    self.high = trade.price;
                    self.low = trade.price;
                    self.close = trade.price;
                    self.priced = true;
                }
            }
        }
    }

    /// Overwrite OHLCV from the authoritative source, retaining every locally derived flow field.
    pub fn reconcile(&mut self, kline: &AuthoritativeCandle) {
        self.open = kline.open;
        self.high = kline.high;
        self.low = kline.low;
        self.close = kline.close;
        self.volume = kline.volume;
        self.vwap_pv = kline.typical_price() * kline.volume;
        self.vwap_volume = kline.volume;
        self.priced = true;
        self.reconciled = true;
    }

    pub fn close_time_ms(&self) -> i64 {
        self.open_time_ms + self.timeframe.duration_ms()
    }

    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    pub fn body(&self) -> f64 {
        (self.close - self.open).abs()
    }

    pub fn is_green(&self) -> bool {
        self.close > self.open
    }

    pub fn is_red(&self) -> bool {
        self.close < self.open
    }

    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }

    /// Direction of a candle whose body is at least `min_body_to_range` of its range.
    pub fn directional(&self, min_body_to_range: f64) -> Option<Direction> {
        let range = self.range();
        if range <= 0.0 || self.body() / range < min_body_to_range {
            return None;
        }
        if self.is_green() {
            Some(Direction::Long)
        } else if self.is_red() {
            Some(Direction::Short)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Side, test_utils::trade};

    fn tf() -> Timeframe {
        Timeframe::from_minutes(3)
    }

    #[test]
    fn test_spot_trade_leaves_ohlc_unchanged() {
        let mut candle = Candle::open_with(
            tf(),
            0,
            &trade("BTCUSDT", SourceMarket::Perp, Side::Buy, 100.0, 1.0, 1),
            None,
        );
        let before = (candle.open, candle.high, candle.low, candle.close);

        candle.apply(&trade("BTCUSDT", SourceMarket::Spot, Side::Buy, 105.0, 2.0, 2));
        candle.apply(&trade("BTCUSDT", SourceMarket::Spot, Side::Buy, 95.0, 3.0, 3));

        assert_eq!((candle.open, candle.high, candle.low, candle.close), before);
        assert_eq!(candle.volume, 6.0);
        assert_eq!(candle.cvd, 6.0);
        assert_eq!(candle.spot_cvd, 5.0);
        assert_eq!(candle.perp_cvd, 1.0);
        assert_eq!(candle.vwap_volume, 1.0);
    }

    #[test]
    fn test_perp_trade_extends_range() {
        struct TestCase {
            input: Trade,
            expected_high: f64,
            expected_low: f64,
        }

        let tests = vec![
            TestCase {
                // TC0: perp trade above high raises high
                input: trade("BTCUSDT", SourceMarket::Perp, Side::Buy, 101.0, 1.0, 2),
                expected_high: 101.0,
                expected_low: 100.0,
            },
            TestCase {
                // TC1: perp trade below low lowers low
                input: trade("BTCUSDT", SourceMarket::Perp, Side::Sell, 99.0, 1.0, 2),
                expected_high: 100.0,
                expected_low: 99.0,
            },
            TestCase {
                // TC2: spot trade above high is ignored for price
                input: trade("BTCUSDT", SourceMarket::Spot, Side::Buy, 101.0, 1.0, 2),
                expected_high: 100.0,
                expected_low: 100.0,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let mut candle = Candle::open_with(
                tf(),
                0,
                &trade("BTCUSDT", SourceMarket::Perp, Side::Buy, 100.0, 1.0, 1),
                None,
            );
            candle.apply(&test.input);
            assert_eq!(candle.high, test.expected_high, "TC{} failed", index);
            assert_eq!(candle.low, test.expected_low, "TC{} failed", index);
        }
    }

    #[test]
    fn test_spot_opened_candle_is_priced_by_first_perp_trade() {
        let mut candle = Candle::open_with(
            tf(),
            0,
            &trade("BTCUSDT", SourceMarket::Spot, Side::Sell, 90.0, 1.0, 1),
            Some(100.0),
        );
        assert!(!candle.priced);
        assert_eq!(candle.close, 100.0);

        candle.apply(&trade("BTCUSDT", SourceMarket::Perp, Side::Buy, 102.0, 1.0, 2));
        assert!(candle.priced);
        assert_eq!((candle.open, candle.high, candle.low, candle.close), (102.0, 102.0, 102.0, 102.0));
    }

    #[test]
    fn test_reconcile_keeps_cvd() {
        let mut candle = Candle::open_with(
            tf(),
            0,
            &trade("BTCUSDT", SourceMarket::Perp, Side::Sell, 100.0, 4.0, 1),
            None,
        );
        candle.apply(&trade("BTCUSDT", SourceMarket::Spot, Side::Buy, 100.0, 1.0, 2));

        let kline = AuthoritativeCandle {
            open_time_ms: 0,
            open: 99.5,
            high: 101.25,
            low: 99.0,
            close: 100.75,
            volume: 42.0,
        };
        candle.reconcile(&kline);

        assert_eq!(
            (candle.open, candle.high, candle.low, candle.close, candle.volume),
            (99.5, 101.25, 99.0, 100.75, 42.0)
        );
        assert_eq!(candle.cvd, -3.0);
        assert_eq!(candle.spot_cvd, 1.0);
        assert_eq!(candle.perp_cvd, -4.0);
        assert!(candle.reconciled);
    }

    #[test]
    fn test_candle_directional() {
        let mut candle = Candle::open_with(
            tf(),
            0,
            &trade("BTCUSDT", SourceMarket::Perp, Side::Buy, 100.0, 1.0, 1),
            None,
        );
        candle.apply(&trade("BTCUSDT", SourceMarket::Perp, Side::Buy, 99.0, 1.0, 2));
        candle.apply(&trade("BTCUSDT", SourceMarket::Perp, Side::Buy, 102.0, 1.0, 3));
        assert_eq!(candle.directional(0.3), Some(Direction::Long));

        candle.apply(&trade("BTCUSDT", SourceMarket::Perp, Side::Buy, 100.1, 1.0, 4));
        assert_eq!(candle.directional(0.3), None);
    }
}
