use super::Candle;
use std::collections::VecDeque;

/// Append-only, bounded ring of closed candles ordered by open time.
///
/// Inserting beyond capacity evicts exactly the oldest entry.
#[derive(Clone, Debug)]
pub struct CandleHistory {
    capacity: usize,
    candles: VecDeque<Candle>,
}

impl CandleHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            candles: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    /// Append a closed candle.
    ///
    /// Returns `false` (and leaves the history untouched) if a candle with the same or a later
    /// open time is already present.
    pub fn push(&mut self, candle: Candle) -> bool {
        if let Some(last) = self.candles.back() {
            if candle.open_time_ms <= last.open_time_ms {
                return false;
            }
        }

        if self.candles.len() >= self.capacity {
            self.candles.pop_front();
        }
        self.candles.push_back(candle);
        true
    }

    /// Closed candle with the given open time.
    pub fn get_mut(&mut self, open_time_ms: i64) -> Option<&mut Candle> {
        let index = self
            .candles
            .binary_search_by_key(&open_time_ms, |candle| candle.open_time_ms)
            .ok()?;
        self.candles.get_mut(index)
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.back()
    }

    /// Closed candle before the latest one.
    pub fn previous(&self) -> Option<&Candle> {
        self.candles.len().checked_sub(2).and_then(|i| self.candles.get(i))
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Candle> + '_ {
        self.candles.iter()
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
