use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as CandleInterval, Utc};
use tracing::{info, warn};

use common::{
    Candle, Config, Direction, EngineEvent, Error, ExitReason, IndicatorSnapshot, OrderResult,
    ParameterSet, ParameterStore, Position, RegimeCall, Result, Signal, SignalScore,
};
use indicators::{FeatureWindow, IndicatorEngine};
use ml::{RegimeClassifier, SignalQualityFilter};
use risk::RiskManager;

use crate::deadline::InferenceWorker;
use crate::state::{StateMachine, TradeState};

/// Candles retained for indicator replay after a regime switch changes the
/// active lookback periods. Covers the longest possible warmup (period 50).
const HISTORY_LEN: usize = 128;

/// DI+/DI- differences at or below this are a tie: no directional signal.
const DI_TIE_EPSILON: f64 = 1e-9;

/// An entry order with no fill after this many candles is treated as lost
/// and cancelled back to flat.
const ENTRY_TIMEOUT_CANDLES: usize = 3;

/// Per-instrument settings for the decision core.
#[derive(Debug, Clone)]
pub struct DecisionConfig {
    pub pair: String,
    /// Order size in quote currency notional.
    pub position_size: f64,
    pub candle_interval_secs: i64,
    /// ADX cross confirmation: require this many preceding ADX readings
    /// below the threshold before a signal counts. 0 disables.
    pub adx_previous_candles: usize,
    /// Inference deadline for the ML collaborators. `None` calls them
    /// inline, which keeps backtests deterministic.
    pub inference_deadline: Option<Duration>,
}

impl DecisionConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            pair: cfg.pair.clone(),
            position_size: cfg.position_size,
            candle_interval_secs: cfg.candle_interval_secs,
            adx_previous_candles: cfg.adx_previous_candles,
            inference_deadline: Some(Duration::from_millis(cfg.inference_deadline_ms)),
        }
    }
}

struct PendingEntry {
    signal: Signal,
    atr: f64,
}

/// Deterministic per-candle decision core.
///
/// Owns the trade state machine, the indicator and feature windows, and
/// the position bookkeeping for one instrument. Each `on_candle` call
/// returns the batch of events the candle produced; order placement and
/// fills stay with the caller, which reports back via `on_order_result`.
/// The same core drives both the live engine and the backtester.
pub struct DecisionEngine {
    config: DecisionConfig,
    params: Arc<ParameterStore>,
    classifier: Arc<RegimeClassifier>,
    filter: Arc<SignalQualityFilter>,
    inference: Option<InferenceWorker>,
    active: Arc<ParameterSet>,
    indicators: IndicatorEngine,
    features: FeatureWindow,
    machine: StateMachine,
    history: VecDeque<Candle>,
    adx_history: VecDeque<f64>,
    pending: Option<PendingEntry>,
    pending_age: usize,
    position: Option<Position>,
    exit_reason: Option<ExitReason>,
    last_open_time: Option<DateTime<Utc>>,
    last_close: f64,
}

impl DecisionEngine {
    pub fn new(
        config: DecisionConfig,
        params: Arc<ParameterStore>,
        classifier: Arc<RegimeClassifier>,
        filter: Arc<SignalQualityFilter>,
    ) -> Self {
        let active = params.baseline();
        let indicators = IndicatorEngine::new(&active);
        let inference = config
            .inference_deadline
            .map(|deadline| InferenceWorker::new(classifier.clone(), filter.clone(), deadline));
        Self {
            config,
            params,
            classifier,
            filter,
            inference,
            active,
            indicators,
            features: FeatureWindow::new(),
            machine: StateMachine::new(),
            history: VecDeque::with_capacity(HISTORY_LEN),
            adx_history: VecDeque::new(),
            pending: None,
            pending_age: 0,
            position: None,
            exit_reason: None,
            last_open_time: None,
            last_close: 0.0,
        }
    }

    pub fn pair(&self) -> &str {
        &self.config.pair
    }

    /// Order size in quote currency notional.
    pub fn order_size(&self) -> f64 {
        self.config.position_size
    }

    pub fn state(&self) -> TradeState {
        self.machine.state()
    }

    pub fn is_halted(&self) -> bool {
        self.machine.is_halted()
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    /// Candles needed before the first valid indicator snapshot.
    pub fn warmup_len(&self) -> usize {
        self.indicators.warmup_len()
    }

    /// Process one finalized candle and return the events it produced.
    pub fn on_candle(&mut self, candle: &Candle) -> Result<Vec<EngineEvent>> {
        let mut events = Vec::new();
        if self.machine.is_halted() {
            warn!(pair = %self.config.pair, "Engine halted, candle ignored");
            return Ok(events);
        }

        if let Some(last) = self.last_open_time {
            let expected = last + CandleInterval::seconds(self.config.candle_interval_secs);
            if candle.open_time != expected {
                warn!(
                    pair = %self.config.pair,
                    %expected,
                    actual = %candle.open_time,
                    "Candle gap, resetting indicator windows"
                );
                events.push(EngineEvent::GapDetected {
                    expected,
                    actual: candle.open_time,
                });
                self.reset_windows();
            }
        }
        self.last_open_time = Some(candle.open_time);
        self.last_close = candle.close;

        // Parameters for this candle come from the regime observed up to
        // the previous close.
        let call = self.classify(&mut events);
        let set = self.params.active(&call);
        self.apply_params(set);

        self.history.push_back(*candle);
        if self.history.len() > HISTORY_LEN {
            self.history.pop_front();
        }
        let snapshot = self.indicators.update(candle);
        self.features.push(*candle, snapshot);

        match self.machine.state() {
            TradeState::Open => self.manage_open(candle, &snapshot, &mut events)?,
            TradeState::Flat => self.evaluate_entry(candle, &snapshot, &mut events)?,
            // The close must land eventually; keep asking until it fills.
            TradeState::Exiting => self.reissue_exit(candle, &mut events)?,
            TradeState::PendingEntry => self.age_pending_entry(&mut events)?,
            TradeState::Evaluating => {}
        }

        if snapshot.valid {
            self.adx_history.push_back(snapshot.adx);
            let cap = self.config.adx_previous_candles.max(1);
            while self.adx_history.len() > cap {
                self.adx_history.pop_front();
            }
        }
        Ok(events)
    }

    /// Report the outcome of the order the last `EntryRequested` or
    /// `ExitRequested` event asked for.
    pub fn on_order_result(&mut self, result: &OrderResult) -> Result<Vec<EngineEvent>> {
        let mut events = Vec::new();
        match self.machine.state() {
            TradeState::PendingEntry => match result {
                OrderResult::Filled { price, timestamp } => {
                    let Some(pending) = self.pending.take() else {
                        self.machine.halt();
                        return Err(Error::InconsistentState {
                            from: "PendingEntry",
                            to: "Open",
                        });
                    };
                    let manager = RiskManager::from_params(&self.active);
                    let levels =
                        manager.initial_levels(pending.signal.direction, *price, pending.atr);
                    let position = Position {
                        id: uuid::Uuid::new_v4().to_string(),
                        pair: self.config.pair.clone(),
                        direction: pending.signal.direction,
                        entry_price: *price,
                        size: self.config.position_size / *price,
                        stop_price: levels.stop,
                        target_price: levels.target,
                        opened_at: *timestamp,
                    };
                    events.push(self.machine.transition(TradeState::Open)?);
                    info!(
                        pair = %position.pair,
                        direction = %position.direction,
                        entry = position.entry_price,
                        stop = position.stop_price,
                        target = position.target_price,
                        "Position opened"
                    );
                    self.position = Some(position.clone());
                    events.push(EngineEvent::PositionOpened { position });
                }
                OrderResult::Rejected { reason } => {
                    warn!(reason = %reason, "Entry order rejected, back to flat");
                    self.pending = None;
                    events.push(self.machine.transition(TradeState::Flat)?);
                }
                OrderResult::Pending => {}
            },
            TradeState::Exiting => match result {
                OrderResult::Filled { price, .. } => {
                    let Some(position) = self.position.take() else {
                        self.machine.halt();
                        return Err(Error::InconsistentState {
                            from: "Exiting",
                            to: "Flat",
                        });
                    };
                    let pnl =
                        (*price - position.entry_price) * position.direction.sign() * position.size;
                    self.exit_reason = None;
                    events.push(self.machine.transition(TradeState::Flat)?);
                    info!(pair = %position.pair, exit_price = price, pnl, "Position closed");
                    events.push(EngineEvent::PositionClosed {
                        position,
                        exit_price: *price,
                        pnl,
                    });
                }
                OrderResult::Rejected { reason } => {
                    // The machine stays in Exiting; the next candle
                    // re-requests the close.
                    warn!(reason = %reason, "Close order rejected");
                }
                OrderResult::Pending => {}
            },
            other => {
                self.machine.halt();
                return Err(Error::InconsistentState {
                    from: other.name(),
                    to: "Open",
                });
            }
        }
        Ok(events)
    }

    /// Close any open position via the standard exit path, cancel any
    /// pending entry, then idle.
    pub fn flatten(&mut self) -> Result<Vec<EngineEvent>> {
        let mut events = Vec::new();
        match self.machine.state() {
            TradeState::Open => {
                self.exit_reason = Some(ExitReason::Flatten);
                events.push(self.machine.transition(TradeState::Exiting)?);
                events.push(EngineEvent::ExitRequested {
                    reason: ExitReason::Flatten,
                    price: self.last_close,
                });
            }
            TradeState::PendingEntry => {
                info!("Flatten requested, pending entry cancelled");
                self.pending = None;
                events.push(self.machine.transition(TradeState::Flat)?);
            }
            _ => {}
        }
        Ok(events)
    }

    fn classify(&mut self, events: &mut Vec<EngineEvent>) -> RegimeCall {
        let Some(features) = self.features.compute() else {
            return RegimeCall::unclassified();
        };
        match &self.inference {
            Some(worker) => match worker.classify(&features) {
                Some(call) => call,
                None => {
                    warn!("Regime inference missed its deadline, baseline parameters apply");
                    events.push(EngineEvent::Degraded {
                        component: "regime_classifier",
                    });
                    RegimeCall::unclassified()
                }
            },
            None => self.classifier.classify(&features),
        }
    }

    fn apply_params(&mut self, set: Arc<ParameterSet>) {
        let periods_changed = set.adx_period != self.active.adx_period
            || set.di_plus_period != self.active.di_plus_period
            || set.di_minus_period != self.active.di_minus_period
            || set.atr_period != self.active.atr_period;
        self.active = set;
        if !periods_changed {
            return;
        }

        // New lookbacks invalidate the running windows; replay the retained
        // history so the snapshot stays consistent with the active set.
        info!(pair = %self.config.pair, "Lookback periods changed, replaying candle history");
        self.indicators = IndicatorEngine::new(&self.active);
        self.features.reset();
        self.adx_history.clear();
        let cap = self.config.adx_previous_candles.max(1);
        let history: Vec<Candle> = self.history.iter().copied().collect();
        for candle in &history {
            let snap = self.indicators.update(candle);
            self.features.push(*candle, snap);
            if snap.valid {
                self.adx_history.push_back(snap.adx);
                while self.adx_history.len() > cap {
                    self.adx_history.pop_front();
                }
            }
        }
    }

    fn evaluate_entry(
        &mut self,
        candle: &Candle,
        snapshot: &IndicatorSnapshot,
        events: &mut Vec<EngineEvent>,
    ) -> Result<()> {
        if !snapshot.valid {
            return Ok(());
        }
        let Some(direction) = self.raw_direction(snapshot) else {
            return Ok(());
        };
        if !self.adx_cross_confirmed() {
            return Ok(());
        }

        events.push(self.machine.transition(TradeState::Evaluating)?);
        let signal = Signal {
            direction,
            origin_time: candle.open_time,
            snapshot: *snapshot,
        };

        let score = self.score(&signal, events);
        if !score.accepted {
            info!(
                probability = score.probability,
                threshold = self.filter.threshold(),
                "Signal rejected by quality filter"
            );
            events.push(EngineEvent::SignalRejected { signal, score });
            events.push(self.machine.transition(TradeState::Flat)?);
            return Ok(());
        }

        let manager = RiskManager::from_params(&self.active);
        let levels = manager.initial_levels(direction, candle.close, snapshot.atr);
        if !manager.meets_reward_to_risk(direction, candle.close, levels) {
            info!("Entry vetoed, reward does not cover risk");
            events.push(self.machine.transition(TradeState::Flat)?);
            return Ok(());
        }

        events.push(self.machine.transition(TradeState::PendingEntry)?);
        self.pending = Some(PendingEntry {
            signal,
            atr: snapshot.atr,
        });
        self.pending_age = 0;
        events.push(EngineEvent::EntryRequested {
            signal,
            atr: snapshot.atr,
        });
        Ok(())
    }

    fn manage_open(
        &mut self,
        candle: &Candle,
        snapshot: &IndicatorSnapshot,
        events: &mut Vec<EngineEvent>,
    ) -> Result<()> {
        let Some(position) = self.position.clone() else {
            self.machine.halt();
            return Err(Error::InconsistentState {
                from: "Open",
                to: "Flat",
            });
        };

        let manager = RiskManager::from_params(&self.active);
        if let Some(reason) = manager.check_exit(&position, candle) {
            let price = manager.exit_price(&position, reason, candle.close);
            self.exit_reason = Some(reason);
            events.push(self.machine.transition(TradeState::Exiting)?);
            info!(pair = %position.pair, %reason, price, "Exit triggered");
            events.push(EngineEvent::ExitRequested { reason, price });
            return Ok(());
        }

        if snapshot.valid {
            if let Some(new_stop) = manager.trail(&position, candle.close, snapshot.atr) {
                let old_stop = position.stop_price;
                if let Some(pos) = self.position.as_mut() {
                    pos.stop_price = new_stop;
                }
                events.push(EngineEvent::StopTrailed { old_stop, new_stop });
            }
        }
        Ok(())
    }

    /// An outstanding close order was rejected or lost; ask again with the
    /// current candle's pricing so the position never sits unmanaged.
    fn reissue_exit(&mut self, candle: &Candle, events: &mut Vec<EngineEvent>) -> Result<()> {
        let Some(position) = self.position.as_ref() else {
            self.machine.halt();
            return Err(Error::InconsistentState {
                from: "Exiting",
                to: "Flat",
            });
        };
        let reason = self.exit_reason.unwrap_or(ExitReason::Flatten);
        let manager = RiskManager::from_params(&self.active);
        let price = manager.exit_price(position, reason, candle.close);
        warn!(
            pair = %position.pair,
            %reason,
            price,
            "Close order still outstanding, re-requesting exit"
        );
        events.push(EngineEvent::ExitRequested { reason, price });
        Ok(())
    }

    fn age_pending_entry(&mut self, events: &mut Vec<EngineEvent>) -> Result<()> {
        self.pending_age += 1;
        if self.pending_age < ENTRY_TIMEOUT_CANDLES {
            return Ok(());
        }
        warn!(
            pair = %self.config.pair,
            candles = self.pending_age,
            "Entry order unacknowledged, cancelling"
        );
        self.pending = None;
        events.push(self.machine.transition(TradeState::Flat)?);
        Ok(())
    }

    fn raw_direction(&self, snapshot: &IndicatorSnapshot) -> Option<Direction> {
        if snapshot.adx < self.active.adx_threshold {
            return None;
        }
        let diff = snapshot.di_plus - snapshot.di_minus;
        if diff.abs() <= DI_TIE_EPSILON {
            return None;
        }
        Some(if diff > 0.0 {
            Direction::Long
        } else {
            Direction::Short
        })
    }

    /// Cross confirmation: the preceding N ADX readings must sit below the
    /// threshold, so only a fresh cross above it triggers.
    fn adx_cross_confirmed(&self) -> bool {
        let n = self.config.adx_previous_candles;
        if n == 0 {
            return true;
        }
        if self.adx_history.len() < n {
            return false;
        }
        self.adx_history
            .iter()
            .rev()
            .take(n)
            .all(|adx| *adx < self.active.adx_threshold)
    }

    fn score(&self, signal: &Signal, events: &mut Vec<EngineEvent>) -> SignalScore {
        let features = self.features.compute().unwrap_or(FALLBACK_FEATURES);
        match &self.inference {
            Some(worker) => match worker.score(&features, signal) {
                Some(score) => score,
                None => {
                    warn!("Filter inference missed its deadline, signal rejected");
                    events.push(EngineEvent::Degraded {
                        component: "signal_filter",
                    });
                    SignalScore {
                        probability: 0.0,
                        accepted: false,
                    }
                }
            },
            None => self.filter.score(&features, signal),
        }
    }

    fn reset_windows(&mut self) {
        self.indicators.reset();
        self.features.reset();
        self.history.clear();
        self.adx_history.clear();
    }
}

/// Neutral features for the rare tick where a signal fires before the
/// feature window is full.
const FALLBACK_FEATURES: common::FeatureVector = common::FeatureVector {
    trend_strength: 0.0,
    volatility_ratio: 0.0,
    momentum: 0.0,
    volume_ratio: 1.0,
    ma_spread: 0.0,
};

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use common::{EngineEvent, OrderResult, RegimeLabel};
    use ml::ConstantFilterModel;

    const INTERVAL: i64 = 3600;

    fn candle(i: usize, close: f64) -> Candle {
        Candle {
            open_time: Utc
                .timestamp_opt(1_700_000_000 + i as i64 * INTERVAL, 0)
                .unwrap(),
            open: close - 1.0,
            high: close + 0.5,
            low: close - 1.5,
            close,
            volume: 100.0,
        }
    }

    /// Strongly trending fixture: +DM every candle, DI- pinned at zero.
    fn uptrend(n: usize) -> Vec<Candle> {
        (0..n).map(|i| candle(i, 100.0 + i as f64)).collect()
    }

    fn flat_market(n: usize) -> Vec<Candle> {
        (0..n).map(|i| candle(i, 100.0)).collect()
    }

    fn engine_with_filter(filter: SignalQualityFilter, adx_previous_candles: usize) -> DecisionEngine {
        let config = DecisionConfig {
            pair: "BTCUSDT".into(),
            position_size: 10.0,
            candle_interval_secs: INTERVAL,
            adx_previous_candles,
            inference_deadline: None,
        };
        DecisionEngine::new(
            config,
            Arc::new(ParameterStore::new(ParameterSet::default())),
            Arc::new(RegimeClassifier::unloaded()),
            Arc::new(filter),
        )
    }

    /// Drive candles through the engine, filling entry orders at the next
    /// candle's open and exit orders at the requested price.
    fn run(engine: &mut DecisionEngine, candles: &[Candle]) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        let mut fill_entry_at_open = false;
        let mut exit_price: Option<f64> = None;

        for candle in candles {
            if fill_entry_at_open {
                fill_entry_at_open = false;
                let result = OrderResult::Filled {
                    price: candle.open,
                    timestamp: candle.open_time,
                };
                events.extend(engine.on_order_result(&result).unwrap());
            }
            if let Some(price) = exit_price.take() {
                let result = OrderResult::Filled {
                    price,
                    timestamp: candle.open_time,
                };
                events.extend(engine.on_order_result(&result).unwrap());
            }

            let batch = engine.on_candle(candle).unwrap();
            for event in &batch {
                match event {
                    EngineEvent::EntryRequested { .. } => fill_entry_at_open = true,
                    EngineEvent::ExitRequested { price, .. } => exit_price = Some(*price),
                    _ => {}
                }
            }
            events.extend(batch);
        }
        events
    }

    fn transitions(events: &[EngineEvent]) -> Vec<(&'static str, &'static str)> {
        events
            .iter()
            .filter_map(|e| match e {
                EngineEvent::Transition { from, to } => Some((*from, *to)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn uptrend_opens_exactly_one_long_with_atr_levels() {
        // 32 candles: one entry completes, the target stays out of reach.
        let mut engine = engine_with_filter(SignalQualityFilter::disabled(), 0);
        let events = run(&mut engine, &uptrend(32));

        let entry_atr = events
            .iter()
            .find_map(|e| match e {
                EngineEvent::EntryRequested { signal, atr } => {
                    assert_eq!(signal.direction, Direction::Long);
                    Some(*atr)
                }
                _ => None,
            })
            .expect("uptrend must request an entry");

        let opened: Vec<&Position> = events
            .iter()
            .filter_map(|e| match e {
                EngineEvent::PositionOpened { position } => Some(position),
                _ => None,
            })
            .collect();
        assert_eq!(opened.len(), 1, "exactly one position in a clean uptrend");

        let position = opened[0];
        let params = ParameterSet::default();
        let expected_stop = position.entry_price - entry_atr * params.stop_multiplier;
        let expected_target = position.entry_price + entry_atr * params.gain_multiplier;
        assert!((position.stop_price - expected_stop).abs() < 1e-9);
        assert!((position.target_price - expected_target).abs() < 1e-9);

        let path = transitions(&events);
        assert_eq!(
            &path[..3],
            &[
                ("Flat", "Evaluating"),
                ("Evaluating", "PendingEntry"),
                ("PendingEntry", "Open"),
            ]
        );
        assert_eq!(engine.state(), TradeState::Open);
    }

    #[test]
    fn rejected_signal_never_passes_evaluating() {
        let filter = SignalQualityFilter::new(Arc::new(ConstantFilterModel(0.1)), 0.65);
        let mut engine = engine_with_filter(filter, 0);
        let events = run(&mut engine, &uptrend(50));

        assert!(events
            .iter()
            .any(|e| matches!(e, EngineEvent::SignalRejected { .. })));
        assert!(!events
            .iter()
            .any(|e| matches!(e, EngineEvent::EntryRequested { .. })));
        for (from, to) in transitions(&events) {
            assert!(
                (from, to) == ("Flat", "Evaluating") || (from, to) == ("Evaluating", "Flat"),
                "unexpected transition {from} -> {to}"
            );
        }
        assert_eq!(engine.state(), TradeState::Flat);
    }

    #[test]
    fn flat_market_stays_flat() {
        let mut engine = engine_with_filter(SignalQualityFilter::disabled(), 0);
        let events = run(&mut engine, &flat_market(50));
        assert!(transitions(&events).is_empty());
        assert_eq!(engine.state(), TradeState::Flat);
    }

    #[test]
    fn cross_requirement_blocks_persistently_strong_adx() {
        // ADX is above threshold from its first valid reading here, so a
        // fresh cross never happens.
        let mut engine = engine_with_filter(SignalQualityFilter::disabled(), 3);
        let events = run(&mut engine, &uptrend(60));
        assert!(!events
            .iter()
            .any(|e| matches!(e, EngineEvent::EntryRequested { .. })));
    }

    #[test]
    fn gap_resets_the_windows() {
        let mut engine = engine_with_filter(SignalQualityFilter::disabled(), 0);
        let mut candles = uptrend(20);
        // Drop one candle from the middle to break the cadence.
        candles.remove(10);
        let events = run(&mut engine, &candles);
        assert!(events
            .iter()
            .any(|e| matches!(e, EngineEvent::GapDetected { .. })));
        // Only 9 contiguous candles remain after the reset, below warmup.
        assert_eq!(engine.state(), TradeState::Flat);
    }

    #[test]
    fn unsolicited_fill_is_fatal() {
        let mut engine = engine_with_filter(SignalQualityFilter::disabled(), 0);
        let result = OrderResult::Filled {
            price: 100.0,
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        };
        let err = engine.on_order_result(&result).unwrap_err();
        assert!(err.is_fatal());
        assert!(engine.is_halted());
        // A halted engine ignores further candles.
        let events = engine.on_candle(&candle(0, 100.0)).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn entry_rejection_returns_to_flat() {
        let mut engine = engine_with_filter(SignalQualityFilter::disabled(), 0);
        let candles = uptrend(50);
        let mut requested = false;
        for c in &candles {
            if requested {
                let events = engine
                    .on_order_result(&OrderResult::Rejected {
                        reason: "insufficient margin".into(),
                    })
                    .unwrap();
                assert!(transitions(&events).contains(&("PendingEntry", "Flat")));
                assert_eq!(engine.state(), TradeState::Flat);
                assert!(!engine.is_halted());
                return;
            }
            let events = engine.on_candle(c).unwrap();
            requested = events
                .iter()
                .any(|e| matches!(e, EngineEvent::EntryRequested { .. }));
        }
        panic!("no entry was requested");
    }

    #[test]
    fn flatten_closes_the_open_position() {
        let mut engine = engine_with_filter(SignalQualityFilter::disabled(), 0);
        let candles = uptrend(32);
        run(&mut engine, &candles);
        assert_eq!(engine.state(), TradeState::Open);
        let entry = engine.position().unwrap().entry_price;

        let events = engine.flatten().unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            EngineEvent::ExitRequested {
                reason: ExitReason::Flatten,
                ..
            }
        )));
        assert_eq!(engine.state(), TradeState::Exiting);

        let exit_price = entry + 10.0;
        let events = engine
            .on_order_result(&OrderResult::Filled {
                price: exit_price,
                timestamp: Utc.timestamp_opt(1_700_400_000, 0).unwrap(),
            })
            .unwrap();
        let closed = events
            .iter()
            .find_map(|e| match e {
                EngineEvent::PositionClosed { pnl, .. } => Some(*pnl),
                _ => None,
            })
            .expect("close fill must emit PositionClosed");
        assert!(closed > 0.0, "long closed above entry must profit");
        assert_eq!(engine.state(), TradeState::Flat);
        assert!(engine.position().is_none());
    }

    #[test]
    fn rejected_close_is_rerequested_each_candle() {
        let mut engine = engine_with_filter(SignalQualityFilter::disabled(), 0);
        run(&mut engine, &uptrend(32));
        assert_eq!(engine.state(), TradeState::Open);

        engine.flatten().unwrap();
        let events = engine
            .on_order_result(&OrderResult::Rejected {
                reason: "venue busy".into(),
            })
            .unwrap();
        assert!(events.is_empty());
        assert_eq!(engine.state(), TradeState::Exiting);
        assert!(!engine.is_halted());

        // Every further candle asks for the close again, repriced at the
        // latest close, until a fill finally arrives.
        for i in 32..35 {
            let close = 100.0 + i as f64;
            let events = engine.on_candle(&candle(i, close)).unwrap();
            let price = events
                .iter()
                .find_map(|e| match e {
                    EngineEvent::ExitRequested {
                        reason: ExitReason::Flatten,
                        price,
                    } => Some(*price),
                    _ => None,
                })
                .expect("outstanding exit must be re-requested");
            assert!((price - close).abs() < 1e-9);
            assert_eq!(engine.state(), TradeState::Exiting);
        }

        let events = engine
            .on_order_result(&OrderResult::Filled {
                price: 134.0,
                timestamp: Utc.timestamp_opt(1_700_000_000 + 35 * INTERVAL, 0).unwrap(),
            })
            .unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e, EngineEvent::PositionClosed { .. })));
        assert_eq!(engine.state(), TradeState::Flat);
        assert!(engine.position().is_none());
    }

    #[test]
    fn unacknowledged_entry_is_cancelled_after_a_timeout() {
        let mut engine = engine_with_filter(SignalQualityFilter::disabled(), 0);
        let candles = uptrend(60);
        let mut i = 0;
        // Drive until the entry request fires, then never report a fill.
        loop {
            assert!(i < candles.len(), "no entry was requested");
            let events = engine.on_candle(&candles[i]).unwrap();
            i += 1;
            if events
                .iter()
                .any(|e| matches!(e, EngineEvent::EntryRequested { .. }))
            {
                break;
            }
        }
        assert_eq!(engine.state(), TradeState::PendingEntry);

        let mut cancelled = false;
        for _ in 0..ENTRY_TIMEOUT_CANDLES {
            let events = engine.on_candle(&candles[i]).unwrap();
            i += 1;
            if transitions(&events).contains(&("PendingEntry", "Flat")) {
                cancelled = true;
                break;
            }
        }
        assert!(cancelled, "stale entry must be cancelled");
        assert_eq!(engine.state(), TradeState::Flat);
        assert!(!engine.is_halted());
    }

    #[test]
    fn regime_override_sets_tuned_multipliers() {
        struct AlwaysUptrend;
        impl ml::RegimeModel for AlwaysUptrend {
            fn predict(&self, _features: &common::FeatureVector) -> [f64; 4] {
                [0.0, 1.0, 0.0, 0.0]
            }
        }

        let store = Arc::new(ParameterStore::new(ParameterSet::default()));
        let tuned = ParameterSet {
            stop_multiplier: 1.0,
            gain_multiplier: 5.0,
            ..ParameterSet::default()
        };
        store.update(RegimeLabel::Uptrend, tuned.clone()).unwrap();

        let config = DecisionConfig {
            pair: "BTCUSDT".into(),
            position_size: 10.0,
            candle_interval_secs: INTERVAL,
            adx_previous_candles: 0,
            inference_deadline: None,
        };
        let mut engine = DecisionEngine::new(
            config,
            store,
            Arc::new(RegimeClassifier::new(Arc::new(AlwaysUptrend))),
            Arc::new(SignalQualityFilter::disabled()),
        );

        // A flat head warms the indicators (ADX reads zero) before the
        // trend leg starts, so the classifier is already reporting Uptrend
        // when ADX finally crosses the threshold and the signal fires.
        let mut candles = flat_market(30);
        candles.extend((1..=8).map(|j| candle(30 + j - 1, 100.0 + j as f64)));
        let events = run(&mut engine, &candles);
        let (position, atr) = events
            .iter()
            .find_map(|e| match e {
                EngineEvent::PositionOpened { position } => Some(position),
                _ => None,
            })
            .zip(events.iter().find_map(|e| match e {
                EngineEvent::EntryRequested { atr, .. } => Some(*atr),
                _ => None,
            }))
            .expect("uptrend must open a position");

        let expected_stop = position.entry_price - atr * tuned.stop_multiplier;
        let expected_target = position.entry_price + atr * tuned.gain_multiplier;
        assert!((position.stop_price - expected_stop).abs() < 1e-9);
        assert!((position.target_price - expected_target).abs() < 1e-9);
    }
}
