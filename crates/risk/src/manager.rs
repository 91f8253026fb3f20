use tracing::{debug, info};

use common::{Candle, Direction, ExitReason, ParameterSet, Position};

/// Protective price levels for one position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskLevels {
    pub stop: f64,
    pub target: f64,
}

/// Sizes protective levels from volatility and enforces them per candle.
///
/// All level math is ATR-multiple based: the stop sits `stop_multiplier`
/// ATRs against the position and the target `gain_multiplier` ATRs in
/// favor. The manager holds no position state of its own; callers pass the
/// position in and apply the returned adjustments.
#[derive(Debug, Clone, Copy)]
pub struct RiskManager {
    stop_multiplier: f64,
    gain_multiplier: f64,
}

impl RiskManager {
    pub fn from_params(params: &ParameterSet) -> Self {
        Self {
            stop_multiplier: params.stop_multiplier,
            gain_multiplier: params.gain_multiplier,
        }
    }

    /// Stop and target for a fresh fill.
    pub fn initial_levels(&self, direction: Direction, entry_price: f64, atr: f64) -> RiskLevels {
        let sign = direction.sign();
        let levels = RiskLevels {
            stop: entry_price - sign * atr * self.stop_multiplier,
            target: entry_price + sign * atr * self.gain_multiplier,
        };
        info!(
            %direction,
            entry_price,
            atr,
            stop = levels.stop,
            target = levels.target,
            "Protective levels set"
        );
        levels
    }

    /// Expected reward per unit of risk at entry. Entries below 1.0 are
    /// not worth taking and are vetoed before any order is placed.
    pub fn reward_to_risk(&self, direction: Direction, entry_price: f64, levels: RiskLevels) -> f64 {
        let sign = direction.sign();
        let risk = sign * (entry_price - levels.stop);
        let reward = sign * (levels.target - entry_price);
        if risk <= 0.0 {
            return 0.0;
        }
        reward / risk
    }

    pub fn meets_reward_to_risk(
        &self,
        direction: Direction,
        entry_price: f64,
        levels: RiskLevels,
    ) -> bool {
        self.reward_to_risk(direction, entry_price, levels) >= 1.0
    }

    /// Candidate trailing stop from the latest close. Returns the new stop
    /// only when it tightens the position; the stop never loosens.
    pub fn trail(&self, position: &Position, close: f64, atr: f64) -> Option<f64> {
        let sign = position.direction.sign();
        let candidate = close - sign * atr * self.stop_multiplier;
        let tightens = match position.direction {
            Direction::Long => candidate > position.stop_price,
            Direction::Short => candidate < position.stop_price,
        };
        if tightens {
            debug!(
                old_stop = position.stop_price,
                new_stop = candidate,
                "Trailing stop tightened"
            );
            Some(candidate)
        } else {
            None
        }
    }

    /// Whether the candle's range touched the stop or target.
    ///
    /// When a single candle spans both levels the stop wins: intra-candle
    /// ordering is unknown, so the loss-bounding level is assumed first.
    pub fn check_exit(&self, position: &Position, candle: &Candle) -> Option<ExitReason> {
        match position.direction {
            Direction::Long => {
                if candle.low <= position.stop_price {
                    Some(ExitReason::StopHit)
                } else if candle.high >= position.target_price {
                    Some(ExitReason::TargetHit)
                } else {
                    None
                }
            }
            Direction::Short => {
                if candle.high >= position.stop_price {
                    Some(ExitReason::StopHit)
                } else if candle.low <= position.target_price {
                    Some(ExitReason::TargetHit)
                } else {
                    None
                }
            }
        }
    }

    /// Exit price for a level-triggered close, used by fill simulation.
    pub fn exit_price(&self, position: &Position, reason: ExitReason, close: f64) -> f64 {
        match reason {
            ExitReason::StopHit => position.stop_price,
            ExitReason::TargetHit => position.target_price,
            ExitReason::Flatten => close,
        }
    }
}
