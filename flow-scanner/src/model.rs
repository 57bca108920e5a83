//! Normalised trade input and the small shared vocabulary used across the engine.

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Instrument identifier, eg/ "BTCUSDT". Shared by the spot and perpetual market of an underlying.
pub type Symbol = SmolStr;

/// Market a [`Trade`] was printed on.
///
/// The perpetual market is the price source; spot only contributes volume and CVD.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMarket {
    Spot,
    Perp,
}

impl SourceMarket {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceMarket::Spot => "spot",
            SourceMarket::Perp => "perp",
        }
    }

    /// Only the primary market may move OHLC fields.
    pub fn is_price_source(&self) -> bool {
        matches!(self, SourceMarket::Perp)
    }
}

impl std::fmt::Display for SourceMarket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Aggressor side of a trade (Buy or Sell)
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Deserialize, Serialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "Buy",
            Side::Sell => "Sell",
        }
    }

    /// Signed volume contribution of a trade of `quantity` to CVD.
    pub fn signed(&self, quantity: f64) -> f64 {
        match self {
            Side::Buy => quantity,
            Side::Sell => -quantity,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Directional read attached to structural events, flow readings and ACT state.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "LONG",
            Direction::Short => "SHORT",
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }

    /// +1.0 for long, -1.0 for short.
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Normalised trade event delivered by a feed adapter. Immutable once received.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct Trade {
    pub symbol: Symbol,
    pub price: f64,
    pub quantity: f64,
    pub side: Side,
    pub market: SourceMarket,
    /// Exchange timestamp in epoch milliseconds.
    pub timestamp_ms: i64,
    /// Monotonic sequence hint from the venue (eg/ aggregate trade id).
    #[serde(default)]
    pub sequence: u64,
}

impl Trade {
    /// Reason this trade cannot be aggregated, if any.
    pub fn validate(&self) -> Result<(), &'static str> {
        if !self.price.is_finite() || self.price <= 0.0 {
            return Err("price is not a positive finite number");
        }
        if !self.quantity.is_finite() || self.quantity <= 0.0 {
            return Err("quantity is not a positive finite number");
        }
        if self.timestamp_ms <= 0 {
            return Err("timestamp is not positive");
        }
        Ok(())
    }

    /// Signed CVD contribution of this trade.
    pub fn delta(&self) -> f64 {
        self.side.signed(self.quantity)
    }
}
