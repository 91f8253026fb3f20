use std::collections::VecDeque;

use tracing::info;

use common::{Candle, Direction, EngineEvent, Error, ExitReason, OrderResult, Result};
use engine::DecisionEngine;

use crate::report::{BacktestReport, TradeRecord};

/// Fill-model settings for the replay.
#[derive(Debug, Clone)]
pub struct BacktestConfig {
    /// Slippage applied to entry fills, in basis points against the trade.
    pub slippage_bps: f64,
    /// Extra candles of order latency. 0 fills entries at the very next
    /// candle's open.
    pub entry_latency_candles: usize,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            slippage_bps: 0.0,
            entry_latency_candles: 0,
        }
    }
}

/// Deterministic candle replay over the decision core.
///
/// Entries fill at the next candle's open shifted by slippage; stop and
/// target exits fill at their level price. Identical candles, parameters,
/// and models always produce an identical report. Build the decision
/// engine with `inference_deadline: None` so model calls run inline.
pub struct Backtester {
    decision: DecisionEngine,
    config: BacktestConfig,
}

struct RunState {
    entry_due: Option<(usize, Direction)>,
    last_exit_reason: ExitReason,
    trades: Vec<TradeRecord>,
}

impl Backtester {
    pub fn new(decision: DecisionEngine, config: BacktestConfig) -> Self {
        Self { decision, config }
    }

    pub fn run(&mut self, candles: &[Candle]) -> Result<BacktestReport> {
        let need = self.decision.warmup_len();
        if candles.len() < need {
            return Err(Error::DataUnready {
                have: candles.len(),
                need,
            });
        }
        info!(candles = candles.len(), "Backtest starting");
        let mut state = RunState {
            entry_due: None,
            last_exit_reason: ExitReason::Flatten,
            trades: Vec::new(),
        };

        for (i, candle) in candles.iter().enumerate() {
            if let Some((due, direction)) = state.entry_due {
                if i >= due {
                    state.entry_due = None;
                    let price = candle.open
                        * (1.0 + direction.sign() * self.config.slippage_bps / 10_000.0);
                    let result = OrderResult::Filled {
                        price,
                        timestamp: candle.open_time,
                    };
                    let events = self.decision.on_order_result(&result)?;
                    self.process(events, i, candle, &mut state)?;
                }
            }

            let events = self.decision.on_candle(candle)?;
            self.process(events, i, candle, &mut state)?;
        }

        // Open positions are closed at the final close so the report
        // accounts for every fill.
        if let Some(last) = candles.last() {
            let events = self.decision.flatten()?;
            self.process(events, candles.len() - 1, last, &mut state)?;
        }

        let report = BacktestReport::from_trades(state.trades);
        report.log_summary();
        Ok(report)
    }

    fn process(
        &mut self,
        events: Vec<EngineEvent>,
        index: usize,
        candle: &Candle,
        state: &mut RunState,
    ) -> Result<()> {
        let mut queue: VecDeque<EngineEvent> = events.into();
        while let Some(event) = queue.pop_front() {
            match event {
                EngineEvent::EntryRequested { signal, .. } => {
                    state.entry_due =
                        Some((index + 1 + self.config.entry_latency_candles, signal.direction));
                }
                EngineEvent::ExitRequested { reason, price } => {
                    state.last_exit_reason = reason;
                    let result = OrderResult::Filled {
                        price,
                        timestamp: candle.open_time,
                    };
                    queue.extend(self.decision.on_order_result(&result)?);
                }
                EngineEvent::PositionClosed {
                    position,
                    exit_price,
                    pnl,
                } => {
                    state.trades.push(TradeRecord {
                        direction: position.direction,
                        entry_price: position.entry_price,
                        exit_price,
                        size: position.size,
                        pnl,
                        reason: state.last_exit_reason,
                        opened_at: position.opened_at,
                        closed_at: candle.open_time,
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }
}
