use flow_scanner::{
    Engine, ScannerConfig, SourceMarket, Trade,
    reconcile::{BinanceKlineSource, CandleSource, Reconciler},
};
use rustls::crypto::ring::default_provider;
use std::{error::Error, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::mpsc, time::interval};
use tracing::{debug, info, warn};

mod feed;
mod server;

use feed::{FeedConfig, spawn_trade_feed};

/// Interval of the wall clock timer sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let _ = default_provider().install_default();
    init_logging();

    info!("Starting flow scanner");

    let config = ScannerConfig::from_env()?;
    let engine = Arc::new(Engine::new(config)?);
    let source = Arc::new(BinanceKlineSource::new(engine.config().reconcile.fetch_timeout));

    warm_up(&engine, source.as_ref()).await;

    let (reconciler, _workers) = Reconciler::spawn(Arc::clone(&engine), source);

    // Configurable via WS_ADDR env var (default: 0.0.0.0:9001)
    let server_addr = env_or("WS_ADDR", "0.0.0.0:9001".parse::<SocketAddr>()?);
    let listener = TcpListener::bind(server_addr).await?;
    info!(%server_addr, "alert WebSocket server listening");
    tokio::spawn(server::serve(listener, Arc::clone(&engine)));

    // Configurable via TRADE_BUFFER_SIZE env var (default: 10,000), per feed
    let buffer_size = env_or("TRADE_BUFFER_SIZE", 10_000);
    let reconnect_delay = Duration::from_secs(env_or("FEED_RECONNECT_SECS", 2));
    let symbols = engine.config().symbols.clone();
    let (feeds, ingests): (Vec<_>, Vec<_>) = [
        (SourceMarket::Spot, "BINANCE_SPOT_WS_URL"),
        (SourceMarket::Perp, "BINANCE_PERP_WS_URL"),
    ]
    .into_iter()
    .map(|(market, url_var)| {
        let mut config =
            FeedConfig::new(market, symbols.clone()).with_reconnect_delay(reconnect_delay);
        if let Ok(url) = std::env::var(url_var) {
            config = config.with_base_url(url);
        }
        let (trade_tx, trade_rx) = mpsc::channel::<Trade>(buffer_size);
        let feed = spawn_trade_feed(config, Arc::clone(&engine), trade_tx);
        let ingest = tokio::spawn(run_ingest(
            market,
            Arc::clone(&engine),
            reconciler.clone(),
            trade_rx,
        ));
        (feed, ingest)
    })
    .unzip();

    let timers = tokio::spawn(run_timers(
        Arc::clone(&engine),
        Duration::from_secs(env_or("METRICS_LOG_SECS", 60)),
    ));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping flow scanner");

    feeds.iter().chain(&ingests).for_each(|task| task.abort());
    timers.abort();
    let metrics = serde_json::to_string(&engine.metrics())?;
    info!(%metrics, "final metrics");

    Ok(())
}

/// Fill every stream with authoritative history so indicators start warm. Failures leave the
/// stream to warm up from live trades at low confidence.
async fn warm_up(engine: &Engine, source: &impl CandleSource) {
    let now_ms = engine.now_ms();
    let history_len = engine.config().history_len as i64;
    let timeframes = engine.registry().iter().collect::<Vec<_>>();

    for symbol in engine.symbols() {
        for (timeframe, role) in &timeframes {
            let duration = timeframe.duration_ms();
            let last_closed = timeframe.align(now_ms) - duration;
            let start_ms = last_closed - (history_len - 1) * duration;

            let filled = match source
                .fetch(symbol, *timeframe, start_ms, last_closed + duration - 1)
                .await
            {
                Ok(candles) => engine.warm_up(symbol, *timeframe, candles),
                Err(error) => Err(error),
            };
            if let Err(error) = filled {
                warn!(
                    symbol = %symbol,
                    timeframe = %timeframe,
                    ?role,
                    %error,
                    "warm-up failed, indicators start at low confidence"
                );
            }
        }
    }
}

/// Feed one market's trades to the engine and schedule reconciliation for every closed primary
/// candle.
async fn run_ingest(
    market: SourceMarket,
    engine: Arc<Engine>,
    reconciler: Reconciler,
    mut trade_rx: mpsc::Receiver<Trade>,
) {
    while let Some(trade) = trade_rx.recv().await {
        // Dropped trades are already counted and logged by the engine
        let Ok(outcome) = engine.ingest(&trade) else {
            continue;
        };
        for request in outcome.reconcile {
            // Rejections are transient, the next close schedules again
            let _ = reconciler.request(request);
        }
    }
    info!(%market, "trade channel closed, ingestion stopped");
}

/// Drive wall clock timers independently of trade arrival, and log metrics periodically.
async fn run_timers(engine: Arc<Engine>, metrics_every: Duration) {
    let mut sweep = interval(SWEEP_INTERVAL);
    let mut metrics = interval(metrics_every);

    loop {
        tokio::select! {
            _ = sweep.tick() => {
                let transitions = engine.sweep_expired();
                if !transitions.is_empty() {
                    debug!(transitions = transitions.len(), "timer sweep applied transitions");
                }
            }
            _ = metrics.tick() => {
                match serde_json::to_string(&engine.metrics()) {
                    Ok(json) => info!(metrics = %json, "scanner metrics"),
                    Err(error) => warn!(%error, "failed to serialise metrics"),
                }
            }
        }
    }
}

/// Parse an env var, falling back to `default` when unset or invalid.
fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

/// Initialize logging. JSON output when SCANNER_LOG_JSON is set to 1 or true.
fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let json = std::env::var("SCANNER_LOG_JSON")
        .is_ok_and(|value| value == "1" || value.eq_ignore_ascii_case("true"));
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
