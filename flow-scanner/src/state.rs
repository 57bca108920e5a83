//! Per-symbol attention state machine: IGNORE, WATCH, ACT.
//!
//! A [`SymbolState`] is only ever mutated by its owning
//! [`SymbolBook`](crate::engine::SymbolBook) under that symbol's lock, so exactly one state
//! value holds per symbol at any instant.

use crate::{
    config::StateConfig,
    model::{Direction, Symbol},
    pattern::{PatternKind, StructuralEvent},
    permission::PermissionSnapshot,
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, str::FromStr};
use tracing::{debug, info};

/// Attention level of a symbol.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AttentionState {
    Ignore,
    Watch,
    Act,
}

impl AttentionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttentionState::Ignore => "IGNORE",
            AttentionState::Watch => "WATCH",
            AttentionState::Act => "ACT",
        }
    }
}

impl std::fmt::Display for AttentionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AttentionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "IGNORE" => Ok(AttentionState::Ignore),
            "WATCH" => Ok(AttentionState::Watch),
            "ACT" => Ok(AttentionState::Act),
            other => Err(format!("unknown attention state: {other}")),
        }
    }
}

/// A state change, returned to the caller and counted per symbol.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct Transition {
    pub symbol: Symbol,
    pub from: AttentionState,
    pub to: AttentionState,
    pub at_ms: i64,
    pub reason: String,
    pub direction: Option<Direction>,
    pub pattern: Option<PatternKind>,
}

/// Attention state of one symbol plus its timers and bookkeeping.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct SymbolState {
    symbol: Symbol,
    state: AttentionState,
    entered_at_ms: i64,
    /// Absolute ACT expiry.
    expires_at_ms: Option<i64>,
    act_direction: Option<Direction>,
    /// Patterns seen since entering the current state.
    active_patterns: BTreeSet<PatternKind>,
    demotion_reason: Option<String>,
    /// Reason the last promotion attempt was withheld.
    blocked_reason: Option<String>,
    last_event_at_ms: i64,
}

impl SymbolState {
    /// Fresh state on process start. ACT is never a valid starting point and falls back to WATCH.
    pub fn new(symbol: Symbol, config: &StateConfig, now_ms: i64) -> Self {
        let state = match config.initial_state {
            AttentionState::Act => AttentionState::Watch,
            other => other,
        };
        Self {
            symbol,
            state,
            entered_at_ms: now_ms,
            expires_at_ms: None,
            act_direction: None,
            active_patterns: BTreeSet::new(),
            demotion_reason: None,
            blocked_reason: None,
            last_event_at_ms: now_ms,
        }
    }

    pub fn state(&self) -> AttentionState {
        self.state
    }

    pub fn entered_at_ms(&self) -> i64 {
        self.entered_at_ms
    }

    pub fn expires_at_ms(&self) -> Option<i64> {
        self.expires_at_ms
    }

    pub fn act_direction(&self) -> Option<Direction> {
        self.act_direction
    }

    pub fn active_patterns(&self) -> &BTreeSet<PatternKind> {
        &self.active_patterns
    }

    pub fn demotion_reason(&self) -> Option<&str> {
        self.demotion_reason.as_deref()
    }

    pub fn blocked_reason(&self) -> Option<&str> {
        self.blocked_reason.as_deref()
    }

    /// Evaluate a closed state-driving candle's structural events against the permission gate.
    ///
    /// At most one transition is made per evaluation. A demotion is never followed by a
    /// promotion on the same close.
    pub fn evaluate(
        &mut self,
        events: &[StructuralEvent],
        permission: &PermissionSnapshot,
        now_ms: i64,
        config: &StateConfig,
    ) -> Option<Transition> {
        if !events.is_empty() {
            self.last_event_at_ms = now_ms;
            self.active_patterns
                .extend(events.iter().map(|event| event.pattern));
        }

        if let Some(transition) = self.check_timers(now_ms, config) {
            return Some(transition);
        }

        match self.state {
            AttentionState::Act => self.evaluate_act(events, permission, now_ms),
            AttentionState::Watch => self.evaluate_watch(events, permission, now_ms, config),
            AttentionState::Ignore => {
                let ignition = events
                    .iter()
                    .find(|event| event.pattern == PatternKind::Ignition)?;
                Some(self.transition(
                    AttentionState::Watch,
                    now_ms,
                    format!("ignition {}", ignition.direction),
                    Some(ignition.direction),
                    Some(ignition.pattern),
                ))
            }
        }
    }

    /// Wall clock checks: ACT expiry and WATCH idle decay. Independent of event arrival.
    pub fn check_timers(&mut self, now_ms: i64, config: &StateConfig) -> Option<Transition> {
        match self.state {
            AttentionState::Act => {
                let expires_at = self.expires_at_ms?;
                (now_ms >= expires_at).then(|| {
                    let reason = format!(
                        "ACT expired after {}ms",
                        now_ms - self.entered_at_ms
                    );
                    self.demote(AttentionState::Watch, now_ms, reason)
                })
            }
            AttentionState::Watch => {
                let timeout = config.watch_idle_timeout_ms?;
                (now_ms - self.last_event_at_ms >= timeout).then(|| {
                    let reason = format!("no structural event for {timeout}ms");
                    self.demote(AttentionState::Ignore, now_ms, reason)
                })
            }
            AttentionState::Ignore => None,
        }
    }

    fn evaluate_act(
        &mut self,
        events: &[StructuralEvent],
        permission: &PermissionSnapshot,
        now_ms: i64,
    ) -> Option<Transition> {
        if !permission.allowed {
            let reason = format!("permission withdrawn: {}", permission.reason);
            return Some(self.demote(AttentionState::Watch, now_ms, reason));
        }

        let direction = self.act_direction?;
        if permission.bias.conflicts_with(direction) {
            let reason = format!("bias conflict: {:?} vs {}", permission.bias, direction);
            return Some(self.demote(AttentionState::Watch, now_ms, reason));
        }

        let aggressor = events
            .iter()
            .find(|event| event.is_aggressor_against(direction))?;
        let reason = format!("aggressor {} {}", aggressor.pattern, aggressor.direction);
        Some(self.demote(AttentionState::Watch, now_ms, reason))
    }

    fn evaluate_watch(
        &mut self,
        events: &[StructuralEvent],
        permission: &PermissionSnapshot,
        now_ms: i64,
        config: &StateConfig,
    ) -> Option<Transition> {
        let trigger = events
            .iter()
            .find(|event| config.act_eligible.contains(&event.pattern))?;

        if !permission.allowed {
            let reason = format!("permission denied: {}", permission.reason);
            info!(
                symbol = %self.symbol,
                pattern = %trigger.pattern,
                direction = %trigger.direction,
                %reason,
                "blocked ACT promotion"
            );
            self.blocked_reason = Some(reason);
            return None;
        }

        if permission.bias.conflicts_with(trigger.direction) {
            let reason = format!(
                "bias conflict: {:?} vs {}",
                permission.bias, trigger.direction
            );
            info!(
                symbol = %self.symbol,
                pattern = %trigger.pattern,
                direction = %trigger.direction,
                %reason,
                "blocked ACT promotion"
            );
            self.blocked_reason = Some(reason);
            return None;
        }

        let direction = trigger.direction;
        let pattern = trigger.pattern;
        let transition = self.transition(
            AttentionState::Act,
            now_ms,
            format!("{pattern} {direction}"),
            Some(direction),
            Some(pattern),
        );
        self.act_direction = Some(direction);
        self.expires_at_ms = Some(now_ms + config.max_act_duration_ms);
        Some(transition)
    }

    fn demote(&mut self, to: AttentionState, now_ms: i64, reason: String) -> Transition {
        let direction = self.act_direction;
        let transition = self.transition(to, now_ms, reason.clone(), direction, None);
        self.demotion_reason = Some(reason);
        transition
    }

    fn transition(
        &mut self,
        to: AttentionState,
        now_ms: i64,
        reason: String,
        direction: Option<Direction>,
        pattern: Option<PatternKind>,
    ) -> Transition {
        let from = self.state;
        info!(
            symbol = %self.symbol,
            %from,
            %to,
            direction = ?direction,
            %reason,
            "attention state transition"
        );

        self.state = to;
        self.entered_at_ms = now_ms;
        self.expires_at_ms = None;
        self.act_direction = None;
        self.blocked_reason = None;
        self.active_patterns.clear();
        if to != AttentionState::Watch || from == AttentionState::Ignore {
            self.demotion_reason = None;
        }
        if to == AttentionState::Watch {
            // Idle decay counts from entry into WATCH
            self.last_event_at_ms = now_ms;
        }
        debug!(symbol = %self.symbol, state = %to, "state entered");

        Transition {
            symbol: self.symbol.clone(),
            from,
            to,
            at_ms: now_ms,
            reason,
            direction,
            pattern,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        permission::{Bias, VolatilityRegime},
        timeframe::Timeframe,
    };

    fn event(pattern: PatternKind, direction: Direction) -> StructuralEvent {
        StructuralEvent {
            symbol: Symbol::new("BTCUSDT"),
            timeframe: Timeframe::from_minutes(3),
            pattern,
            direction,
            candle_open_time_ms: 0,
            close: 100.0,
            range_atr: Some(1.0),
            level: None,
        }
    }

    fn permission(allowed: bool, bias: Bias) -> PermissionSnapshot {
        PermissionSnapshot {
            timeframe: Timeframe::from_minutes(15),
            bias,
            volatility: VolatilityRegime::Normal,
            allowed,
            reason: if allowed { "ok".into() } else { "volatility too low".into() },
            as_of_ms: Some(0),
        }
    }

    fn config() -> StateConfig {
        StateConfig {
            watch_idle_timeout_ms: None,
            max_act_duration_ms: 300_000,
            ..StateConfig::default()
        }
    }

    fn state_in(initial: AttentionState) -> SymbolState {
        let config = StateConfig {
            initial_state: initial,
            ..config()
        };
        SymbolState::new(Symbol::new("BTCUSDT"), &config, 0)
    }

    fn act_long(now_ms: i64) -> SymbolState {
        let mut state = state_in(AttentionState::Watch);
        state
            .evaluate(
                &[event(PatternKind::Pullback, Direction::Long)],
                &permission(true, Bias::Neutral),
                now_ms,
                &config(),
            )
            .unwrap();
        state
    }

    #[test]
    fn test_state_transitions() {
        struct TestCase {
            initial: SymbolState,
            events: Vec<StructuralEvent>,
            permission: PermissionSnapshot,
            now_ms: i64,
            expected: AttentionState,
        }

        let tests = vec![
            TestCase {
                // TC0: IGNORE to WATCH on ignition
                initial: state_in(AttentionState::Ignore),
                events: vec![event(PatternKind::Ignition, Direction::Long)],
                permission: permission(false, Bias::Neutral),
                now_ms: 1_000,
                expected: AttentionState::Watch,
            },
            TestCase {
                // TC1: IGNORE ignores pullback
                initial: state_in(AttentionState::Ignore),
                events: vec![event(PatternKind::Pullback, Direction::Long)],
                permission: permission(true, Bias::Neutral),
                now_ms: 1_000,
                expected: AttentionState::Ignore,
            },
            TestCase {
                // TC2: WATCH to ACT on eligible event with permission
                initial: state_in(AttentionState::Watch),
                events: vec![event(PatternKind::Pullback, Direction::Short)],
                permission: permission(true, Bias::Bearish),
                now_ms: 1_000,
                expected: AttentionState::Act,
            },
            TestCase {
                // TC3: WATCH stays WATCH without permission
                initial: state_in(AttentionState::Watch),
                events: vec![event(PatternKind::Pullback, Direction::Long)],
                permission: permission(false, Bias::Neutral),
                now_ms: 1_000,
                expected: AttentionState::Watch,
            },
            TestCase {
                // TC4: WATCH + ignition is a no-op
                initial: state_in(AttentionState::Watch),
                events: vec![event(PatternKind::Ignition, Direction::Long)],
                permission: permission(true, Bias::Neutral),
                now_ms: 1_000,
                expected: AttentionState::Watch,
            },
            TestCase {
                // TC5: promotion against the slow bias is withheld
                initial: state_in(AttentionState::Watch),
                events: vec![event(PatternKind::Pullback, Direction::Long)],
                permission: permission(true, Bias::Bearish),
                now_ms: 1_000,
                expected: AttentionState::Watch,
            },
            TestCase {
                // TC6: ACT demoted when permission is withdrawn
                initial: act_long(1_000),
                events: vec![],
                permission: permission(false, Bias::Neutral),
                now_ms: 2_000,
                expected: AttentionState::Watch,
            },
            TestCase {
                // TC7: ACT demoted by an aggressor trap
                initial: act_long(1_000),
                events: vec![event(PatternKind::Trap, Direction::Short)],
                permission: permission(true, Bias::Neutral),
                now_ms: 2_000,
                expected: AttentionState::Watch,
            },
            TestCase {
                // TC8: ACT demoted when bias flips against it
                initial: act_long(1_000),
                events: vec![],
                permission: permission(true, Bias::Bearish),
                now_ms: 2_000,
                expected: AttentionState::Watch,
            },
            TestCase {
                // TC9: repeated eligible event in ACT is a no-op
                initial: act_long(1_000),
                events: vec![event(PatternKind::Pullback, Direction::Long)],
                permission: permission(true, Bias::Bullish),
                now_ms: 2_000,
                expected: AttentionState::Act,
            },
        ];

        for (index, mut test) in tests.into_iter().enumerate() {
            test.initial
                .evaluate(&test.events, &test.permission, test.now_ms, &config());
            assert_eq!(test.initial.state(), test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_blocked_promotion_records_permission_denied() {
        let mut state = state_in(AttentionState::Watch);
        let transition = state.evaluate(
            &[event(PatternKind::Pullback, Direction::Long)],
            &permission(false, Bias::Neutral),
            1_000,
            &config(),
        );
        assert!(transition.is_none());
        assert!(state.blocked_reason().unwrap().starts_with("permission denied"));
    }

    #[test]
    fn test_act_sets_direction_and_expiry() {
        let state = act_long(10_000);
        assert_eq!(state.state(), AttentionState::Act);
        assert_eq!(state.act_direction(), Some(Direction::Long));
        assert_eq!(state.expires_at_ms(), Some(310_000));
        assert_eq!(state.entered_at_ms(), 10_000);
    }

    #[test]
    fn test_act_expiry_is_independent_of_events() {
        let mut state = act_long(0);
        assert!(state.check_timers(299_999, &config()).is_none());

        let transition = state.check_timers(300_001, &config()).unwrap();
        assert_eq!(transition.from, AttentionState::Act);
        assert_eq!(transition.to, AttentionState::Watch);
        assert_eq!(state.state(), AttentionState::Watch);
        assert!(state.demotion_reason().unwrap().contains("expired"));
        assert_eq!(state.act_direction(), None);
    }

    #[test]
    fn test_watch_idle_decay() {
        let config = StateConfig {
            watch_idle_timeout_ms: Some(60_000),
            ..config()
        };
        let mut state = SymbolState::new(Symbol::new("BTCUSDT"), &config, 0);

        assert!(state.check_timers(59_999, &config).is_none());
        state.evaluate(&[event(PatternKind::Trap, Direction::Long)], &permission(false, Bias::Neutral), 50_000, &config);
        assert!(state.check_timers(100_000, &config).is_none());
        assert!(state.check_timers(110_000, &config).is_some());
        assert_eq!(state.state(), AttentionState::Ignore);
    }

    #[test]
    fn test_initial_act_falls_back_to_watch() {
        assert_eq!(state_in(AttentionState::Act).state(), AttentionState::Watch);
    }
}
