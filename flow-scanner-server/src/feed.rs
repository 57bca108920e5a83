//! Binance aggregate trade feeds for the spot and USD-M perpetual markets.
//!
//! Each market runs one combined-stream connection covering every configured symbol, with
//! automatic reconnection. Parsed trades are forwarded to the ingestion task over an mpsc channel.

use flow_scanner::{Engine, Side, SourceMarket, Symbol, Trade, metrics::Metrics};
use futures::StreamExt;
use serde::{Deserialize, Deserializer};
use std::{fmt::Display, str::FromStr, sync::Arc, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

pub const BINANCE_SPOT_WS: &str = "wss://stream.binance.com:9443/stream";
pub const BINANCE_PERP_WS: &str = "wss://fstream.binance.com/stream";

/// Trade feed configuration for one market.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub market: SourceMarket,
    /// Combined-stream endpoint, without query.
    pub base_url: String,
    pub symbols: Vec<Symbol>,
    /// Reconnection delay after disconnect
    pub reconnect_delay: Duration,
}

impl FeedConfig {
    pub fn new(market: SourceMarket, symbols: Vec<Symbol>) -> Self {
        let base_url = match market {
            SourceMarket::Spot => BINANCE_SPOT_WS,
            SourceMarket::Perp => BINANCE_PERP_WS,
        };
        Self {
            market,
            base_url: base_url.to_string(),
            symbols,
            reconnect_delay: Duration::from_secs(2),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Combined-stream url subscribing to `<symbol>@aggTrade` for every symbol.
    pub fn stream_url(&self) -> Result<Url, url::ParseError> {
        let streams = self
            .symbols
            .iter()
            .map(|symbol| format!("{}@aggTrade", symbol.to_lowercase()))
            .collect::<Vec<_>>()
            .join("/");

        let mut url = Url::parse(&self.base_url)?;
        url.set_query(Some(&format!("streams={streams}")));
        Ok(url)
    }
}

/// Combined-stream envelope.
#[derive(Debug, Deserialize)]
struct CombinedMessage {
    data: serde_json::Value,
}

/// Binance aggregate trade payload, identical on spot and USD-M futures.
#[derive(Debug, Deserialize)]
struct BinanceAggTrade {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p", deserialize_with = "de_str")]
    price: f64,
    #[serde(rename = "q", deserialize_with = "de_str")]
    quantity: f64,
    #[serde(rename = "T")]
    trade_time: i64,
    /// Buyer was the maker, so the aggressor sold.
    #[serde(rename = "m")]
    buyer_is_maker: bool,
    #[serde(rename = "a")]
    aggregate_id: u64,
}

impl BinanceAggTrade {
    fn into_trade(self, market: SourceMarket) -> Trade {
        Trade {
            symbol: Symbol::from(self.symbol.to_uppercase()),
            price: self.price,
            quantity: self.quantity,
            side: if self.buyer_is_maker {
                Side::Sell
            } else {
                Side::Buy
            },
            market,
            timestamp_ms: self.trade_time,
            sequence: self.aggregate_id,
        }
    }
}

/// Deserialize a number Binance sends as a string.
fn de_str<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    let raw = String::deserialize(deserializer)?;
    raw.parse().map_err(serde::de::Error::custom)
}

/// Parse one combined-stream text frame. Frames that are not aggregate trades yield `None`.
pub fn parse_trade(text: &str, market: SourceMarket) -> Result<Option<Trade>, serde_json::Error> {
    let message = serde_json::from_str::<CombinedMessage>(text)?;
    if message.data.get("e").and_then(|event| event.as_str()) != Some("aggTrade") {
        return Ok(None);
    }
    serde_json::from_value::<BinanceAggTrade>(message.data)
        .map(|agg_trade| Some(agg_trade.into_trade(market)))
}

/// Parse a text frame, counting frames that fail to parse as dropped.
fn read_frame(text: &str, market: SourceMarket, metrics: &Metrics) -> Option<Trade> {
    match parse_trade(text, market) {
        Ok(trade) => trade,
        Err(error) => {
            metrics.frame_unparsed();
            debug!(%market, %error, payload = text, "failed to parse trade frame");
            None
        }
    }
}

/// Spawn the feed for one market. The task ends once the trade receiver is dropped.
pub fn spawn_trade_feed(
    config: FeedConfig,
    engine: Arc<Engine>,
    trade_tx: mpsc::Sender<Trade>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let url = match config.stream_url() {
            Ok(url) => url,
            Err(error) => {
                error!(market = %config.market, %error, "invalid trade feed url");
                return;
            }
        };
        info!(market = %config.market, symbols = config.symbols.len(), "starting trade feed");

        loop {
            match connect_async(url.as_str()).await {
                Ok((ws_stream, _)) => {
                    info!(market = %config.market, %url, "trade feed connected");
                    let (_, mut read) = ws_stream.split();

                    while let Some(message) = read.next().await {
                        match message {
                            Ok(Message::Text(text)) => {
                                let metrics = engine.metrics_handle();
                                let Some(trade) = read_frame(text.as_str(), config.market, metrics) else {
                                    continue;
                                };
                                if trade_tx.send(trade).await.is_err() {
                                    info!(market = %config.market, "trade receiver dropped, stopping feed");
                                    return;
                                }
                            }
                            Ok(Message::Close(frame)) => {
                                warn!(market = %config.market, ?frame, "trade feed closed by server");
                                break;
                            }
                            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                                // Heartbeat - tungstenite answers pings automatically
                            }
                            Err(error) => {
                                error!(market = %config.market, %error, "trade feed error");
                                break;
                            }
                            _ => {}
                        }
                    }
                }
                Err(error) => {
                    error!(market = %config.market, %url, %error, "failed to connect trade feed");
                }
            }

            if trade_tx.is_closed() {
                return;
            }
            debug!(
                market = %config.market,
                delay = ?config.reconnect_delay,
                "waiting before reconnecting trade feed"
            );
            tokio::time::sleep(config.reconnect_delay).await;
        }
    })
}
