use std::collections::VecDeque;

use common::{Candle, FeatureVector, IndicatorSnapshot};

/// Short / long moving-average lookbacks for the spread feature.
const MA_SHORT: usize = 8;
const MA_LONG: usize = 21;
/// Rate-of-change lookback for the momentum feature.
const MOMENTUM_WINDOW: usize = 14;
/// Rolling-mean lookback for the relative-volume feature.
const VOLUME_WINDOW: usize = 20;
/// ADX values averaged for the trend-strength feature.
const TREND_WINDOW: usize = 14;

/// Rolling candle/snapshot window that the feature schema is computed from.
///
/// Owned by the decision path and recomputed per tick; the classifier and
/// the signal filter both consume the resulting `FeatureVector`.
#[derive(Debug, Clone, Default)]
pub struct FeatureWindow {
    candles: VecDeque<Candle>,
    snapshots: VecDeque<IndicatorSnapshot>,
}

impl FeatureWindow {
    /// Longest lookback any feature needs.
    pub const LOOKBACK: usize = MA_LONG;

    pub fn new() -> Self {
        Self::default()
    }

    /// Append one tick. Invalid snapshots are not retained, so the trend
    /// feature only averages real ADX readings.
    pub fn push(&mut self, candle: Candle, snapshot: IndicatorSnapshot) {
        self.candles.push_back(candle);
        if self.candles.len() > Self::LOOKBACK {
            self.candles.pop_front();
        }
        if snapshot.valid {
            self.snapshots.push_back(snapshot);
            if self.snapshots.len() > TREND_WINDOW {
                self.snapshots.pop_front();
            }
        }
    }

    pub fn reset(&mut self) {
        self.candles.clear();
        self.snapshots.clear();
    }

    /// Assemble the feature schema, or `None` until the lookback is filled
    /// and at least one valid snapshot has been seen.
    pub fn compute(&self) -> Option<FeatureVector> {
        if self.candles.len() < Self::LOOKBACK || self.snapshots.is_empty() {
            return None;
        }

        let last = self.candles.back()?;
        let close = last.close;
        if close <= 0.0 {
            return None;
        }
        let snap = self.snapshots.back()?;

        let trend_strength =
            self.snapshots.iter().map(|s| s.adx).sum::<f64>() / self.snapshots.len() as f64;

        let volatility_ratio = snap.atr / close * 100.0;

        let momentum_base = self.candles[self.candles.len() - 1 - MOMENTUM_WINDOW].close;
        let momentum = if momentum_base > 0.0 {
            (close / momentum_base - 1.0) * 100.0
        } else {
            0.0
        };

        let vol_window = self
            .candles
            .iter()
            .rev()
            .take(VOLUME_WINDOW)
            .map(|c| c.volume)
            .collect::<Vec<_>>();
        let mean_volume = vol_window.iter().sum::<f64>() / vol_window.len() as f64;
        let volume_ratio = if mean_volume > 0.0 {
            last.volume / mean_volume
        } else {
            1.0
        };

        let ma = |n: usize| {
            self.candles.iter().rev().take(n).map(|c| c.close).sum::<f64>() / n as f64
        };
        let ma_spread = (ma(MA_SHORT) - ma(MA_LONG)) / close * 100.0;

        Some(FeatureVector {
            trend_strength,
            volatility_ratio,
            momentum,
            volume_ratio,
            ma_spread,
        })
    }
}
