//! Process counters for external monitoring.
//!
//! Counters are lock-free atomics so the ingestion path never contends on them. The export
//! format is left to the consumer: [`MetricsSnapshot`] is plain serde.

use crate::{error::ScannerError, model::Symbol, state::AttentionState};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
};

/// Per-symbol count of transitions into each state.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default, Deserialize, Serialize)]
pub struct TransitionCounts {
    pub to_ignore: u64,
    pub to_watch: u64,
    pub to_act: u64,
}

impl TransitionCounts {
    pub fn record(&mut self, to: AttentionState) {
        match to {
            AttentionState::Ignore => self.to_ignore += 1,
            AttentionState::Watch => self.to_watch += 1,
            AttentionState::Act => self.to_act += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.to_ignore + self.to_watch + self.to_act
    }
}

#[derive(Debug, Default)]
pub struct Metrics {
    trades_received: AtomicU64,
    trades_malformed: AtomicU64,
    trades_unknown_symbol: AtomicU64,
    trades_late: AtomicU64,
    frames_unparsed: AtomicU64,
    candles_closed: AtomicU64,
    gaps: AtomicU64,
    reconcile_queue_depth: AtomicU64,
    reconcile_enqueued: AtomicU64,
    reconcile_rejected_full: AtomicU64,
    reconcile_rejected_in_flight: AtomicU64,
    reconcile_applied: AtomicU64,
    reconcile_stale: AtomicU64,
    reconcile_failures: AtomicU64,
    alerts_emitted: AtomicU64,
    alerts_suppressed: AtomicU64,
}

impl Metrics {
    pub fn trade_received(&self) {
        self.trades_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a dropped trade under the counter matching its error.
    pub fn trade_dropped(&self, error: &ScannerError) {
        let counter = match error {
            ScannerError::MalformedTrade { .. } => &self.trades_malformed,
            ScannerError::UnknownSymbol(_) => &self.trades_unknown_symbol,
            ScannerError::LateTrade { .. } => &self.trades_late,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a feed message that never became a trade.
    pub fn frame_unparsed(&self) {
        self.frames_unparsed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn candle_closed(&self) {
        self.candles_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn gap(&self, skipped_windows: i64) {
        if skipped_windows > 0 {
            self.gaps.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn reconcile_enqueued(&self) {
        self.reconcile_enqueued.fetch_add(1, Ordering::Relaxed);
        self.reconcile_queue_depth.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconcile_dequeued(&self) {
        // Saturating: a late decrement after a reset must not wrap
        let _ = self.reconcile_queue_depth.fetch_update(
            Ordering::Relaxed,
            Ordering::Relaxed,
            |depth| Some(depth.saturating_sub(1)),
        );
    }

    pub fn reconcile_rejected(&self, error: &ScannerError) {
        let counter = match error {
            ScannerError::ReconcileQueueFull(_) => &self.reconcile_rejected_full,
            ScannerError::ReconcileInFlight(_) => &self.reconcile_rejected_in_flight,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconcile_applied(&self) {
        self.reconcile_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconcile_stale(&self) {
        self.reconcile_stale.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconcile_failed(&self) {
        self.reconcile_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn alerts(&self, emitted: usize, suppressed: usize) {
        self.alerts_emitted
            .fetch_add(emitted as u64, Ordering::Relaxed);
        self.alerts_suppressed
            .fetch_add(suppressed as u64, Ordering::Relaxed);
    }

    pub fn reconcile_queue_depth(&self) -> u64 {
        self.reconcile_queue_depth.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, transitions: BTreeMap<Symbol, TransitionCounts>) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            trades_received: load(&self.trades_received),
            trades_dropped_malformed: load(&self.trades_malformed),
            trades_dropped_unknown_symbol: load(&self.trades_unknown_symbol),
            trades_dropped_late: load(&self.trades_late),
            frames_dropped_unparsed: load(&self.frames_unparsed),
            candles_closed: load(&self.candles_closed),
            gaps: load(&self.gaps),
            reconcile_queue_depth: load(&self.reconcile_queue_depth),
            reconcile_enqueued: load(&self.reconcile_enqueued),
            reconcile_rejected_full: load(&self.reconcile_rejected_full),
            reconcile_rejected_in_flight: load(&self.reconcile_rejected_in_flight),
            reconcile_applied: load(&self.reconcile_applied),
            reconcile_stale: load(&self.reconcile_stale),
            reconcile_failures: load(&self.reconcile_failures),
            alerts_emitted: load(&self.alerts_emitted),
            alerts_suppressed: load(&self.alerts_suppressed),
            transitions,
        }
    }
}

/// Point-in-time copy of every counter.
#[derive(Clone, PartialEq, Debug, Default, Deserialize, Serialize)]
pub struct MetricsSnapshot {
    pub trades_received: u64,
    pub trades_dropped_malformed: u64,
    pub trades_dropped_unknown_symbol: u64,
    pub trades_dropped_late: u64,
    /// Feed messages that failed to parse and never reached the engine.
    pub frames_dropped_unparsed: u64,
    pub candles_closed: u64,
    pub gaps: u64,
    pub reconcile_queue_depth: u64,
    pub reconcile_enqueued: u64,
    pub reconcile_rejected_full: u64,
    pub reconcile_rejected_in_flight: u64,
    pub reconcile_applied: u64,
    pub reconcile_stale: u64,
    pub reconcile_failures: u64,
    pub alerts_emitted: u64,
    pub alerts_suppressed: u64,
    pub transitions: BTreeMap<Symbol, TransitionCounts>,
}

impl MetricsSnapshot {
    pub fn trades_dropped(&self) -> u64 {
        self.trades_dropped_malformed
            + self.trades_dropped_unknown_symbol
            + self.trades_dropped_late
            + self.frames_dropped_unparsed
    }
}
