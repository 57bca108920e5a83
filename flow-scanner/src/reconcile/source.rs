use crate::{candle::AuthoritativeCandle, error::ScannerError, model::Symbol, timeframe::Timeframe};
use async_trait::async_trait;
use serde::{Deserialize, de::IgnoredAny};
use std::time::Duration;
use tracing::debug;

/// Binance USD-M futures REST base url.
pub const BINANCE_FUTURES_BASE_URL: &str = "https://fapi.binance.com";

/// Maximum klines Binance returns per request.
const BINANCE_KLINE_LIMIT: i64 = 1500;

/// Authoritative closed candles by (symbol, timeframe, time range). No CVD.
#[async_trait]
pub trait CandleSource: Send + Sync {
    /// Closed candles with open times in `[start_ms, end_ms]`, ordered by open time.
    async fn fetch(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<AuthoritativeCandle>, ScannerError>;
}

/// Binance kline response row. Only the OHLCV prefix and close time are read.
#[derive(Debug, Deserialize)]
struct BinanceKline(
    i64,        // 0: Open time
    String,     // 1: Open
    String,     // 2: High
    String,     // 3: Low
    String,     // 4: Close
    String,     // 5: Volume
    i64,        // 6: Close time
    IgnoredAny, // 7: Quote asset volume
    IgnoredAny, // 8: Number of trades
    IgnoredAny, // 9: Taker buy base asset volume
    IgnoredAny, // 10: Taker buy quote asset volume
    IgnoredAny, // 11: Ignore
);

impl BinanceKline {
    fn parse(self) -> Option<AuthoritativeCandle> {
        Some(AuthoritativeCandle {
            open_time_ms: self.0,
            open: self.1.parse().ok()?,
            high: self.2.parse().ok()?,
            low: self.3.parse().ok()?,
            close: self.4.parse().ok()?,
            volume: self.5.parse().ok()?,
        })
    }
}

/// Binance kline interval for a timeframe, if Binance serves it.
pub fn binance_interval(timeframe: Timeframe) -> Option<&'static str> {
    const INTERVALS: [(i64, &str); 12] = [
        (1, "1m"),
        (3, "3m"),
        (5, "5m"),
        (15, "15m"),
        (30, "30m"),
        (60, "1h"),
        (120, "2h"),
        (240, "4h"),
        (360, "6h"),
        (480, "8h"),
        (720, "12h"),
        (1440, "1d"),
    ];
    INTERVALS
        .iter()
        .find(|(minutes, _)| Timeframe::from_minutes(*minutes) == timeframe)
        .map(|(_, interval)| *interval)
}

/// [`CandleSource`] backed by the Binance futures klines endpoint.
#[derive(Clone, Debug)]
pub struct BinanceKlineSource {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl BinanceKlineSource {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: BINANCE_FUTURES_BASE_URL.to_string(),
            timeout,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn url(&self, symbol: &Symbol, interval: &str, start_ms: i64, end_ms: i64, limit: i64) -> String {
        format!(
            "{}/fapi/v1/klines?symbol={}&interval={}&startTime={}&endTime={}&limit={}",
            self.base_url.trim_end_matches('/'),
            symbol,
            interval,
            start_ms,
            end_ms,
            limit
        )
    }
}

#[async_trait]
impl CandleSource for BinanceKlineSource {
    async fn fetch(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<AuthoritativeCandle>, ScannerError> {
        let interval = binance_interval(timeframe).ok_or_else(|| {
            ScannerError::Fetch(format!("no Binance kline interval for {timeframe}"))
        })?;
        let limit = ((end_ms - start_ms) / timeframe.duration_ms() + 1).clamp(1, BINANCE_KLINE_LIMIT);
        let url = self.url(symbol, interval, start_ms, end_ms, limit);

        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ScannerError::Fetch(format!("HTTP error: {}", response.status())));
        }

        let klines: Vec<BinanceKline> = response.json().await?;
        let total = klines.len();

        // Close time bounds the range so a still-forming kline is never returned
        let mut candles = klines
            .into_iter()
            .filter(|kline| kline.6 <= end_ms)
            .filter_map(BinanceKline::parse)
            .collect::<Vec<_>>();
        candles.sort_by_key(|candle| candle.open_time_ms);

        debug!(
            symbol = %symbol,
            timeframe = %timeframe,
            received = total,
            closed = candles.len(),
            "fetched authoritative klines"
        );
        Ok(candles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binance_interval() {
        struct TestCase {
            input: Timeframe,
            expected: Option<&'static str>,
        }

        let tests = vec![
            TestCase {
                // TC0: minutes
                input: Timeframe::from_minutes(3),
                expected: Some("3m"),
            },
            TestCase {
                // TC1: hours
                input: Timeframe::from_minutes(240),
                expected: Some("4h"),
            },
            TestCase {
                // TC2: day
                input: Timeframe::from_minutes(1440),
                expected: Some("1d"),
            },
            TestCase {
                // TC3: not served by Binance
                input: Timeframe::from_minutes(7),
                expected: None,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = binance_interval(test.input);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_parse_binance_kline() {
        let raw = r#"[
            [1700000000000,"100.0","101.5","99.5","101.0","12.5",1700000179999,"1262.5",42,"6.0","606.0","0"],
            [1700000180000,"oops","101.5","99.5","101.0","12.5",1700000359999,"1262.5",42,"6.0","606.0","0"]
        ]"#;
        let klines: Vec<BinanceKline> = serde_json::from_str(raw).unwrap();
        let parsed = klines
            .into_iter()
            .filter_map(BinanceKline::parse)
            .collect::<Vec<_>>();

        assert_eq!(
            parsed,
            vec![AuthoritativeCandle {
                open_time_ms: 1_700_000_000_000,
                open: 100.0,
                high: 101.5,
                low: 99.5,
                close: 101.0,
                volume: 12.5,
            }]
        );
    }

    #[test]
    fn test_kline_url() {
        let source = BinanceKlineSource::new(Duration::from_secs(1)).with_base_url("http://localhost:8080/");
        assert_eq!(
            source.url(&Symbol::new("BTCUSDT"), "3m", 0, 539_999, 3),
            "http://localhost:8080/fapi/v1/klines?symbol=BTCUSDT&interval=3m&startTime=0&endTime=539999&limit=3"
        );
    }
}
