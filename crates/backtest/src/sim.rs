//! File-backed candle replay and simulated order execution, used by the
//! backtest and paper-trading modes.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::info;

use common::{
    Candle, CandleFeed, ExecutionClient, OrderRequest, OrderResult, Position, Result,
};

/// Candle feed over a pre-loaded candle series.
pub struct ReplayFeed {
    candles: VecDeque<Candle>,
}

impl ReplayFeed {
    pub fn new(candles: Vec<Candle>) -> Self {
        Self {
            candles: candles.into(),
        }
    }

    /// Load a JSON array of candles.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let candles: Vec<Candle> = serde_json::from_str(&raw)?;
        info!(path = %path.display(), candles = candles.len(), "Loaded candle file");
        Ok(Self::new(candles))
    }

    pub fn remaining(&self) -> usize {
        self.candles.len()
    }

    pub fn into_candles(self) -> Vec<Candle> {
        self.candles.into()
    }
}

#[async_trait]
impl CandleFeed for ReplayFeed {
    async fn next_candle(&mut self) -> Result<Option<Candle>> {
        Ok(self.candles.pop_front())
    }
}

/// Wraps any feed and publishes the latest close as the reference price
/// for `SimExecution`.
pub struct TrackedFeed<F> {
    inner: F,
    price: Arc<RwLock<f64>>,
}

impl<F: CandleFeed> TrackedFeed<F> {
    pub fn new(inner: F) -> (Self, Arc<RwLock<f64>>) {
        let price = Arc::new(RwLock::new(0.0));
        (
            Self {
                inner,
                price: price.clone(),
            },
            price,
        )
    }
}

#[async_trait]
impl<F: CandleFeed> CandleFeed for TrackedFeed<F> {
    async fn next_candle(&mut self) -> Result<Option<Candle>> {
        let candle = self.inner.next_candle().await?;
        if let Some(c) = &candle {
            *self.price.write().expect("price lock poisoned") = c.close;
        }
        Ok(candle)
    }
}

/// Paper execution: fills market entries at the reference price shifted by
/// slippage, and closes at the hinted price.
pub struct SimExecution {
    price: Arc<RwLock<f64>>,
    slippage_bps: f64,
}

impl SimExecution {
    pub fn new(price: Arc<RwLock<f64>>, slippage_bps: f64) -> Self {
        Self {
            price,
            slippage_bps,
        }
    }
}

#[async_trait]
impl ExecutionClient for SimExecution {
    async fn place_order(&self, order: &OrderRequest) -> Result<OrderResult> {
        let reference = *self.price.read().expect("price lock poisoned");
        if reference <= 0.0 {
            return Ok(OrderResult::Rejected {
                reason: "no reference price yet".into(),
            });
        }
        let price = order
            .price
            .unwrap_or(reference * (1.0 + order.direction.sign() * self.slippage_bps / 10_000.0));
        Ok(OrderResult::Filled {
            price,
            timestamp: chrono::Utc::now(),
        })
    }

    async fn close_position(&self, _position: &Position, price_hint: f64) -> Result<OrderResult> {
        Ok(OrderResult::Filled {
            price: price_hint,
            timestamp: chrono::Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use common::Direction;

    fn candles(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| Candle {
                open_time: Utc
                    .timestamp_opt(1_700_000_000 + i as i64 * 3600, 0)
                    .unwrap(),
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.0 + i as f64,
                volume: 10.0,
            })
            .collect()
    }

    #[tokio::test]
    async fn replay_yields_all_candles_then_none() {
        let mut feed = ReplayFeed::new(candles(3));
        for i in 0..3 {
            let c = feed.next_candle().await.unwrap().unwrap();
            assert!((c.close - (100.0 + i as f64)).abs() < 1e-12);
        }
        assert!(feed.next_candle().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn candle_file_round_trips() {
        let dir = std::env::temp_dir().join(format!("candles-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("candles.json");
        std::fs::write(&path, serde_json::to_string(&candles(5)).unwrap()).unwrap();

        let feed = ReplayFeed::from_file(&path).unwrap();
        assert_eq!(feed.remaining(), 5);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn tracked_feed_publishes_the_latest_close() {
        let (mut feed, price) = TrackedFeed::new(ReplayFeed::new(candles(2)));
        assert_eq!(*price.read().unwrap(), 0.0);
        feed.next_candle().await.unwrap();
        assert_eq!(*price.read().unwrap(), 100.0);
        feed.next_candle().await.unwrap();
        assert_eq!(*price.read().unwrap(), 101.0);
    }

    #[tokio::test]
    async fn sim_execution_applies_entry_slippage() {
        let price = Arc::new(RwLock::new(200.0));
        let execution = SimExecution::new(price.clone(), 50.0);

        let order = OrderRequest::market("BTCUSDT", Direction::Long, 10.0);
        let result = execution.place_order(&order).await.unwrap();
        let OrderResult::Filled { price: fill, .. } = result else {
            panic!("expected a fill");
        };
        assert!((fill - 201.0).abs() < 1e-9);

        let order = OrderRequest::market("BTCUSDT", Direction::Short, 10.0);
        let OrderResult::Filled { price: fill, .. } =
            execution.place_order(&order).await.unwrap()
        else {
            panic!("expected a fill");
        };
        assert!((fill - 199.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn sim_execution_rejects_without_reference_price() {
        let price = Arc::new(RwLock::new(0.0));
        let execution = SimExecution::new(price, 0.0);
        let order = OrderRequest::market("BTCUSDT", Direction::Long, 10.0);
        let result = execution.place_order(&order).await.unwrap();
        assert!(matches!(result, OrderResult::Rejected { .. }));
    }
}
