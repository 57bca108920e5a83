//! Timeframe identifiers and the registry mapping each timeframe to its role.
//!
//! Adding a timeframe is a registration: every [`SymbolBook`](crate::engine::SymbolBook) builds
//! one candle stream per registered entry.

use crate::error::ScannerError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

const MINUTE_MS: i64 = 60_000;
const HOUR_MS: i64 = 60 * MINUTE_MS;

/// Fixed candle duration, stored in milliseconds.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize, Serialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct Timeframe(i64);

impl Timeframe {
    pub const fn from_minutes(minutes: i64) -> Self {
        Self(minutes * MINUTE_MS)
    }

    pub fn from_millis(millis: i64) -> Result<Self, ScannerError> {
        if millis <= 0 {
            return Err(ScannerError::Config(format!(
                "timeframe duration must be positive, got {millis}ms"
            )));
        }
        Ok(Self(millis))
    }

    pub fn duration_ms(&self) -> i64 {
        self.0
    }

    pub fn minutes(&self) -> f64 {
        self.0 as f64 / MINUTE_MS as f64
    }

    /// Open time of the window containing `timestamp_ms`.
    #[inline]
    pub fn align(&self, timestamp_ms: i64) -> i64 {
        timestamp_ms.div_euclid(self.0) * self.0
    }

    /// Kline interval label, eg/ "3m", "15m", "1h".
    pub fn label(&self) -> String {
        if self.0 % HOUR_MS == 0 {
            format!("{}h", self.0 / HOUR_MS)
        } else if self.0 % MINUTE_MS == 0 {
            format!("{}m", self.0 / MINUTE_MS)
        } else {
            format!("{}ms", self.0)
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl FromStr for Timeframe {
    type Err = ScannerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || ScannerError::Config(format!("invalid timeframe: {s:?}"));

        let (value, unit) = if let Some(value) = s.strip_suffix("ms") {
            (value, 1)
        } else if let Some(value) = s.strip_suffix('m') {
            (value, MINUTE_MS)
        } else if let Some(value) = s.strip_suffix('h') {
            (value, HOUR_MS)
        } else {
            return Err(invalid());
        };

        let value = value.parse::<i64>().map_err(|_| invalid())?;
        Self::from_millis(value * unit)
    }
}

impl TryFrom<String> for Timeframe {
    type Error = ScannerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Timeframe> for String {
    fn from(value: Timeframe) -> Self {
        value.label()
    }
}

/// What a registered timeframe drives.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Deserialize, Serialize)]
pub enum TimeframeRole {
    /// State-driving timeframe: flow regime, detectors, state transitions and alerts.
    Primary,
    /// Slow timeframe feeding the permission gate.
    Permission,
    /// Candles and indicators only.
    Auxiliary,
}

/// Ordered mapping of timeframe to role. Exactly one primary and one permission entry.
#[derive(Clone, Debug, PartialEq)]
pub struct TimeframeRegistry {
    primary: Timeframe,
    permission: Timeframe,
    entries: IndexMap<Timeframe, TimeframeRole>,
}

impl TimeframeRegistry {
    pub fn new(primary: Timeframe, permission: Timeframe) -> Result<Self, ScannerError> {
        if primary == permission {
            return Err(ScannerError::Config(format!(
                "primary and permission timeframes must differ, both are {primary}"
            )));
        }

        let mut entries = IndexMap::new();
        entries.insert(primary, TimeframeRole::Primary);
        entries.insert(permission, TimeframeRole::Permission);
        Ok(Self {
            primary,
            permission,
            entries,
        })
    }

    /// Register an auxiliary timeframe. Re-registering an existing timeframe keeps its role.
    pub fn register(&mut self, timeframe: Timeframe) -> &mut Self {
        self.entries
            .entry(timeframe)
            .or_insert(TimeframeRole::Auxiliary);
        self
    }

    pub fn role(&self, timeframe: Timeframe) -> Option<TimeframeRole> {
        self.entries.get(&timeframe).copied()
    }

    pub fn primary(&self) -> Timeframe {
        self.primary
    }

    pub fn permission(&self) -> Timeframe {
        self.permission
    }

    pub fn iter(&self) -> impl Iterator<Item = (Timeframe, TimeframeRole)> + '_ {
        self.entries.iter().map(|(tf, role)| (*tf, *role))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
