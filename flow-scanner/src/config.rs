//! Scanner configuration.
//!
//! Every value has a default that matches the production scanner, so an empty environment
//! yields a working configuration. [`ScannerConfig::from_env`] overlays `SCANNER_*` variables.

use crate::{
    error::ScannerError,
    model::Symbol,
    pattern::PatternKind,
    state::AttentionState,
    timeframe::{Timeframe, TimeframeRegistry},
};
use serde::{Deserialize, Serialize};
use std::{str::FromStr, time::Duration};

/// Indicator engine windows and warm-up thresholds.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct IndicatorConfig {
    pub atr_period: usize,
    pub atr_percentile_window: usize,
    /// Candles in the CVD, VWAP and percentile slope windows.
    pub slope_period: usize,
    pub volume_window: usize,
    pub moving_average_period: usize,
    pub opening_range_candles: usize,
    pub session_start_hour_utc: u32,
    /// Candles scanned for a prior impulse.
    pub impulse_lookback: usize,
    pub flow_warmup_candles: usize,
    pub atr_warmup_candles: usize,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            atr_period: 14,
            atr_percentile_window: 100,
            slope_period: 5,
            volume_window: 20,
            moving_average_period: 9,
            opening_range_candles: 5,
            session_start_hour_utc: 0,
            impulse_lookback: 10,
            flow_warmup_candles: 5,
            atr_warmup_candles: 14,
        }
    }
}

/// Flow regime classifier thresholds.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Volatility gate: below this ATR percentile the regime is always NEUTRAL.
    pub min_atr_percentile: f64,
    /// Flat CVD slope threshold per minute of primary timeframe.
    pub slope_threshold_per_minute: f64,
    /// Explicit flat threshold (base units per candle), overriding the per-minute scaling.
    pub slope_threshold: Option<f64>,
    /// Maximum spot/perp divergence for CONSENSUS.
    pub consensus_divergence: f64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            min_atr_percentile: 20.0,
            slope_threshold_per_minute: 0.5,
            slope_threshold: None,
            consensus_divergence: 0.5,
        }
    }
}

impl FlowConfig {
    /// CVD slope magnitude below which a market is flat on candles of `primary`.
    pub fn slope_threshold(&self, primary: Timeframe) -> f64 {
        self.slope_threshold
            .unwrap_or(self.slope_threshold_per_minute * primary.minutes())
    }
}

/// Structural pattern thresholds.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct PatternConfig {
    /// Fractional band around VWAP a straddle has to clear.
    pub vwap_tolerance: f64,
    pub volume_expansion: f64,
    pub volume_spike: f64,
    pub impulse_atr_multiple: f64,
    pub compression_atr_multiple: f64,
    pub pullback_distance_atr: f64,
    pub pullback_max_volume: f64,
    pub min_body_to_range: f64,
    /// Fraction beyond a level a wick must reach to count as a sweep.
    pub sweep_excess: f64,
    /// Mean recent ATR percentile at or below which volatility is coiled.
    pub ignition_max_percentile: f64,
    pub ignition_volume_compression: f64,
    pub ignition_vwap_distance_atr: f64,
    /// Failed breakout volume above this multiple of average is not weak.
    pub breakout_max_volume: f64,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            vwap_tolerance: 0.0005,
            volume_expansion: 1.8 * 0.7,
            volume_spike: 1.8,
            impulse_atr_multiple: 2.0,
            compression_atr_multiple: 0.8,
            pullback_distance_atr: 0.5,
            pullback_max_volume: 0.9,
            min_body_to_range: 0.3,
            sweep_excess: 0.001,
            ignition_max_percentile: 20.0 + 10.0,
            ignition_volume_compression: 0.8,
            ignition_vwap_distance_atr: 0.5,
            breakout_max_volume: 1.8 * 0.9,
        }
    }
}

/// Permission gate thresholds.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct PermissionConfig {
    /// Slow ATR percentile below which volatility is LOW and promotion is withheld.
    pub min_atr_percentile: f64,
    pub high_atr_percentile: f64,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            min_atr_percentile: 20.0,
            high_atr_percentile: 80.0,
        }
    }
}

/// Attention state machine policy.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct StateConfig {
    /// State assigned on process start. WATCH is a deliberate fail-open default.
    pub initial_state: AttentionState,
    pub max_act_duration_ms: i64,
    /// WATCH decays to IGNORE after this long without a structural event. None disables.
    pub watch_idle_timeout_ms: Option<i64>,
    pub act_eligible: Vec<PatternKind>,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            initial_state: AttentionState::Watch,
            max_act_duration_ms: 15 * 60_000,
            watch_idle_timeout_ms: Some(2 * 60 * 60_000),
            act_eligible: vec![PatternKind::Pullback, PatternKind::VwapReclaim],
        }
    }
}

/// Additive scoring weights. Each term is bounded by its weight.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub base: f64,
    pub flow_alignment: f64,
    pub volatility: f64,
    pub context: f64,
    pub chop: f64,
    /// Per-ATR bump for range magnitude, capped at three ATRs.
    pub magnitude: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            base: 50.0,
            flow_alignment: 20.0,
            volatility: 15.0,
            context: 15.0,
            chop: 7.5,
            magnitude: 2.0,
        }
    }
}

/// Alert admission and deduplication.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct AlertConfig {
    pub min_score: f64,
    /// Events ranked in the top N of an evaluation cycle pass regardless of score. 0 disables.
    pub top_n: usize,
    /// Per (symbol, pattern) cooldown after an alert fires. 0 disables.
    pub cooldown_ms: i64,
    pub dedup_retention_ms: i64,
    pub dedup_capacity: usize,
    pub broadcast_capacity: usize,
    pub weights: ScoreWeights,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            min_score: 50.0,
            top_n: 0,
            cooldown_ms: 0,
            dedup_retention_ms: 6 * 60 * 60_000,
            dedup_capacity: 10_000,
            broadcast_capacity: 1_024,
            weights: ScoreWeights::default(),
        }
    }
}

/// Reconciliation worker pool.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub workers: usize,
    /// Pending task capacity. Requests beyond it are rejected.
    pub queue_capacity: usize,
    /// Closed candles re-fetched per task, ending at the candle that triggered it.
    pub lookback_candles: usize,
    #[serde(with = "duration_ms")]
    pub fetch_timeout: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 64,
            lookback_candles: 3,
            fetch_timeout: Duration::from_secs(10),
        }
    }
}

/// Top level configuration consumed by the [`Engine`](crate::engine::Engine).
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ScannerConfig {
    pub symbols: Vec<Symbol>,
    pub primary_timeframe: Timeframe,
    pub permission_timeframe: Timeframe,
    pub auxiliary_timeframes: Vec<Timeframe>,
    pub history_len: usize,
    /// Allow reading partially formed candles for non-stateful diagnostics.
    pub open_candle_diagnostics: bool,
    pub indicator: IndicatorConfig,
    pub flow: FlowConfig,
    pub pattern: PatternConfig,
    pub permission: PermissionConfig,
    pub state: StateConfig,
    pub alert: AlertConfig,
    pub reconcile: ReconcileConfig,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            symbols: ["BTCUSDT", "ETHUSDT", "SOLUSDT"]
                .into_iter()
                .map(Symbol::new)
                .collect(),
            primary_timeframe: Timeframe::from_minutes(3),
            permission_timeframe: Timeframe::from_minutes(15),
            auxiliary_timeframes: Vec::new(),
            history_len: 1000,
            open_candle_diagnostics: false,
            indicator: IndicatorConfig::default(),
            flow: FlowConfig::default(),
            pattern: PatternConfig::default(),
            permission: PermissionConfig::default(),
            state: StateConfig::default(),
            alert: AlertConfig::default(),
            reconcile: ReconcileConfig::default(),
        }
    }
}

impl ScannerConfig {
    /// Defaults overlaid with `SCANNER_*` environment variables.
    pub fn from_env() -> Result<Self, ScannerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`, eg/ a map in tests.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ScannerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(symbols) = lookup("SCANNER_SYMBOLS") {
            config.symbols = symbols
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .map(Symbol::from)
                .collect();
        }
        overlay(&lookup, "SCANNER_PRIMARY_TF", &mut config.primary_timeframe)?;
        overlay(&lookup, "SCANNER_PERMISSION_TF", &mut config.permission_timeframe)?;
        if let Some(extra) = lookup("SCANNER_AUX_TFS") {
            config.auxiliary_timeframes = extra
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(Timeframe::from_str)
                .collect::<Result<_, _>>()?;
        }
        overlay(&lookup, "SCANNER_HISTORY_LEN", &mut config.history_len)?;
        overlay(
            &lookup,
            "SCANNER_OPEN_CANDLE_DIAGNOSTICS",
            &mut config.open_candle_diagnostics,
        )?;
        overlay(&lookup, "SCANNER_MIN_ATR_PERCENTILE", &mut config.flow.min_atr_percentile)?;
        overlay(
            &lookup,
            "SCANNER_FLOW_SLOPE_PER_MINUTE",
            &mut config.flow.slope_threshold_per_minute,
        )?;
        if let Some(raw) = lookup("SCANNER_FLOW_SLOPE_THRESHOLD") {
            config.flow.slope_threshold = Some(parse("SCANNER_FLOW_SLOPE_THRESHOLD", &raw)?);
        }
        overlay(
            &lookup,
            "SCANNER_PERMISSION_MIN_ATR_PERCENTILE",
            &mut config.permission.min_atr_percentile,
        )?;
        overlay(&lookup, "SCANNER_INITIAL_STATE", &mut config.state.initial_state)?;
        overlay(&lookup, "SCANNER_MAX_ACT_MS", &mut config.state.max_act_duration_ms)?;
        overlay(&lookup, "SCANNER_MIN_ALERT_SCORE", &mut config.alert.min_score)?;
        overlay(&lookup, "SCANNER_ALERT_TOP_N", &mut config.alert.top_n)?;
        overlay(&lookup, "SCANNER_ALERT_COOLDOWN_MS", &mut config.alert.cooldown_ms)?;
        overlay(
            &lookup,
            "SCANNER_DEDUP_RETENTION_MS",
            &mut config.alert.dedup_retention_ms,
        )?;
        overlay(&lookup, "SCANNER_RECONCILE_WORKERS", &mut config.reconcile.workers)?;
        overlay(
            &lookup,
            "SCANNER_RECONCILE_QUEUE",
            &mut config.reconcile.queue_capacity,
        )?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ScannerError> {
        if self.symbols.is_empty() {
            return Err(ScannerError::Config("symbol universe is empty".to_string()));
        }
        if self.history_len == 0 {
            return Err(ScannerError::Config(
                "history length must be positive".to_string(),
            ));
        }
        if self.reconcile.queue_capacity == 0 || self.reconcile.workers == 0 {
            return Err(ScannerError::Config(
                "reconciliation queue capacity and worker count must be positive".to_string(),
            ));
        }
        if self.alert.dedup_capacity == 0 || self.alert.dedup_retention_ms <= 0 {
            return Err(ScannerError::Config(
                "alert dedup store must be bounded by a positive capacity and retention"
                    .to_string(),
            ));
        }
        if self.state.max_act_duration_ms <= 0 {
            return Err(ScannerError::Config(
                "ACT max duration must be positive".to_string(),
            ));
        }
        self.registry().map(|_| ())
    }

    /// Timeframe registry built from the configured primary, permission and auxiliary entries.
    pub fn registry(&self) -> Result<TimeframeRegistry, ScannerError> {
        let mut registry = TimeframeRegistry::new(self.primary_timeframe, self.permission_timeframe)?;
        for timeframe in &self.auxiliary_timeframes {
            registry.register(*timeframe);
        }
        Ok(registry)
    }

    pub fn with_symbols<I, S>(mut self, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Symbol>,
    {
        self.symbols = symbols.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeframes(mut self, primary: Timeframe, permission: Timeframe) -> Self {
        self.primary_timeframe = primary;
        self.permission_timeframe = permission;
        self
    }

    pub fn with_history_len(mut self, history_len: usize) -> Self {
        self.history_len = history_len;
        self
    }

    pub fn with_state(mut self, state: StateConfig) -> Self {
        self.state = state;
        self
    }

    pub fn with_alert(mut self, alert: AlertConfig) -> Self {
        self.alert = alert;
        self
    }

    pub fn with_open_candle_diagnostics(mut self, enabled: bool) -> Self {
        self.open_candle_diagnostics = enabled;
        self
    }
}

fn overlay<F, T>(lookup: &F, key: &str, target: &mut T) -> Result<(), ScannerError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        *target = parse(key, &raw)?;
    }
    Ok(())
}

fn parse<T: FromStr>(key: &str, raw: &str) -> Result<T, ScannerError> {
    raw.trim()
        .parse()
        .map_err(|_| ScannerError::Config(format!("invalid value for {key}: {raw:?}")))
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = ScannerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.primary_timeframe, Timeframe::from_minutes(3));
        assert_eq!(config.permission_timeframe, Timeframe::from_minutes(15));
        assert_eq!(config.state.initial_state, AttentionState::Watch);
        assert_eq!(config.flow.slope_threshold(config.primary_timeframe), 1.5);
    }

    #[test]
    fn test_flow_slope_threshold_follows_primary_timeframe() {
        struct TestCase {
            input: Vec<(&'static str, &'static str)>,
            expected: f64,
        }

        let tests = vec![
            TestCase {
                // TC0: 1m primary scales the threshold down
                input: vec![("SCANNER_PRIMARY_TF", "1m")],
                expected: 0.5,
            },
            TestCase {
                // TC1: 5m primary
                input: vec![("SCANNER_PRIMARY_TF", "5m")],
                expected: 2.5,
            },
            TestCase {
                // TC2: explicit threshold wins over scaling
                input: vec![
                    ("SCANNER_PRIMARY_TF", "1m"),
                    ("SCANNER_FLOW_SLOPE_THRESHOLD", "2.0"),
                ],
                expected: 2.0,
            },
            TestCase {
                // TC3: per-minute base is configurable
                input: vec![("SCANNER_FLOW_SLOPE_PER_MINUTE", "1.0")],
                expected: 3.0,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let config = ScannerConfig::from_lookup(lookup(&test.input)).unwrap();
            let actual = config.flow.slope_threshold(config.primary_timeframe);
            assert!((actual - test.expected).abs() < 1e-9, "TC{} failed", index);
        }

        let builder = ScannerConfig::default()
            .with_timeframes(Timeframe::from_minutes(1), Timeframe::from_minutes(5));
        assert_eq!(builder.flow.slope_threshold(builder.primary_timeframe), 0.5);
    }

    #[test]
    fn test_from_lookup() {
        struct TestCase {
            input: Vec<(&'static str, &'static str)>,
            expected: Result<(), ()>,
        }

        let tests = vec![
            TestCase {
                // TC0: empty environment uses defaults
                input: vec![],
                expected: Ok(()),
            },
            TestCase {
                // TC1: overrides parse
                input: vec![
                    ("SCANNER_SYMBOLS", "btcusdt, ethusdt"),
                    ("SCANNER_PRIMARY_TF", "5m"),
                    ("SCANNER_MAX_ACT_MS", "300000"),
                    ("SCANNER_INITIAL_STATE", "IGNORE"),
                ],
                expected: Ok(()),
            },
            TestCase {
                // TC2: unparseable number is a config error
                input: vec![("SCANNER_HISTORY_LEN", "lots")],
                expected: Err(()),
            },
            TestCase {
                // TC3: identical primary and permission timeframes are rejected
                input: vec![("SCANNER_PRIMARY_TF", "15m")],
                expected: Err(()),
            },
            TestCase {
                // TC4: zero history is rejected
                input: vec![("SCANNER_HISTORY_LEN", "0")],
                expected: Err(()),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = ScannerConfig::from_lookup(lookup(&test.input))
                .map(|_| ())
                .map_err(|_| ());
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_from_lookup_applies_overrides() {
        let config = ScannerConfig::from_lookup(lookup(&[
            ("SCANNER_SYMBOLS", "btcusdt, ethusdt"),
            ("SCANNER_AUX_TFS", "1m,1h"),
            ("SCANNER_INITIAL_STATE", "IGNORE"),
            ("SCANNER_ALERT_TOP_N", "2"),
        ]))
        .unwrap();

        assert_eq!(config.symbols, vec![Symbol::new("BTCUSDT"), Symbol::new("ETHUSDT")]);
        assert_eq!(config.auxiliary_timeframes.len(), 2);
        assert_eq!(config.state.initial_state, AttentionState::Ignore);
        assert_eq!(config.alert.top_n, 2);
        assert_eq!(config.registry().unwrap().len(), 4);
    }
}
