use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use common::{Direction, ExitReason};

/// One completed round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub direction: Direction,
    pub entry_price: f64,
    pub exit_price: f64,
    pub size: f64,
    pub pnl: f64,
    pub reason: ExitReason,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

/// Aggregate result of one backtest run.
///
/// Built once from the trade list; identical inputs produce a
/// byte-identical serialized report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestReport {
    pub trades: Vec<TradeRecord>,
    pub total_trades: usize,
    pub wins: usize,
    pub losses: usize,
    /// Winning fraction in [0, 1]. 0.0 with no trades.
    pub win_rate: f64,
    /// Gross profit / gross loss. `None` when there were no losing trades.
    pub profit_factor: Option<f64>,
    pub net_profit: f64,
    /// Mean profit per trade.
    pub expectancy: f64,
    /// Deepest peak-to-trough drop of the cumulative PnL curve, as a
    /// non-negative quote-currency amount.
    pub max_drawdown: f64,
    pub max_win_streak: usize,
    pub max_loss_streak: usize,
}

impl BacktestReport {
    pub fn from_trades(trades: Vec<TradeRecord>) -> Self {
        let total_trades = trades.len();
        let wins = trades.iter().filter(|t| t.pnl > 0.0).count();
        let losses = trades.iter().filter(|t| t.pnl < 0.0).count();
        let win_rate = if total_trades > 0 {
            wins as f64 / total_trades as f64
        } else {
            0.0
        };

        let gross_profit: f64 = trades.iter().filter(|t| t.pnl > 0.0).map(|t| t.pnl).sum();
        let gross_loss: f64 = trades
            .iter()
            .filter(|t| t.pnl < 0.0)
            .map(|t| -t.pnl)
            .sum();
        let profit_factor = if gross_loss > 0.0 {
            Some(gross_profit / gross_loss)
        } else {
            None
        };

        let net_profit: f64 = trades.iter().map(|t| t.pnl).sum();
        let expectancy = if total_trades > 0 {
            net_profit / total_trades as f64
        } else {
            0.0
        };

        let mut equity = 0.0;
        let mut peak = 0.0;
        let mut max_drawdown = 0.0f64;
        for trade in &trades {
            equity += trade.pnl;
            if equity > peak {
                peak = equity;
            }
            max_drawdown = max_drawdown.max(peak - equity);
        }

        let mut max_win_streak = 0usize;
        let mut max_loss_streak = 0usize;
        let mut win_streak = 0usize;
        let mut loss_streak = 0usize;
        for trade in &trades {
            if trade.pnl > 0.0 {
                win_streak += 1;
                loss_streak = 0;
            } else if trade.pnl < 0.0 {
                loss_streak += 1;
                win_streak = 0;
            } else {
                win_streak = 0;
                loss_streak = 0;
            }
            max_win_streak = max_win_streak.max(win_streak);
            max_loss_streak = max_loss_streak.max(loss_streak);
        }

        Self {
            trades,
            total_trades,
            wins,
            losses,
            win_rate,
            profit_factor,
            net_profit,
            expectancy,
            max_drawdown,
            max_win_streak,
            max_loss_streak,
        }
    }

    pub fn log_summary(&self) {
        info!(
            trades = self.total_trades,
            wins = self.wins,
            losses = self.losses,
            win_rate = self.win_rate,
            profit_factor = ?self.profit_factor,
            net_profit = self.net_profit,
            expectancy = self.expectancy,
            max_drawdown = self.max_drawdown,
            "Backtest finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn trade(pnl: f64) -> TradeRecord {
        let ts = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        TradeRecord {
            direction: Direction::Long,
            entry_price: 100.0,
            exit_price: 100.0 + pnl,
            size: 1.0,
            pnl,
            reason: if pnl >= 0.0 {
                ExitReason::TargetHit
            } else {
                ExitReason::StopHit
            },
            opened_at: ts,
            closed_at: ts,
        }
    }

    #[test]
    fn empty_run_yields_neutral_metrics() {
        let report = BacktestReport::from_trades(vec![]);
        assert_eq!(report.total_trades, 0);
        assert_eq!(report.win_rate, 0.0);
        assert_eq!(report.profit_factor, None);
        assert_eq!(report.net_profit, 0.0);
        assert_eq!(report.max_drawdown, 0.0);
    }

    #[test]
    fn metrics_match_hand_computed_values() {
        let report = BacktestReport::from_trades(vec![
            trade(10.0),
            trade(-4.0),
            trade(-6.0),
            trade(8.0),
            trade(2.0),
        ]);
        assert_eq!(report.total_trades, 5);
        assert_eq!(report.wins, 3);
        assert_eq!(report.losses, 2);
        assert!((report.win_rate - 0.6).abs() < 1e-12);
        assert!((report.profit_factor.unwrap() - 2.0).abs() < 1e-12);
        assert!((report.net_profit - 10.0).abs() < 1e-12);
        assert!((report.expectancy - 2.0).abs() < 1e-12);
        // Equity: 10, 6, 0, 8, 10. Deepest drop is 10 from the first peak.
        assert!((report.max_drawdown - 10.0).abs() < 1e-12);
        assert_eq!(report.max_win_streak, 2);
        assert_eq!(report.max_loss_streak, 2);
    }

    #[test]
    fn all_winning_run_has_no_profit_factor() {
        let report = BacktestReport::from_trades(vec![trade(1.0), trade(2.0)]);
        assert_eq!(report.profit_factor, None);
        assert_eq!(report.max_drawdown, 0.0);
    }
}
