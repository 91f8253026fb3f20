use async_trait::async_trait;

use crate::{Candle, OrderRequest, OrderResult, Position, Result};

/// Abstraction over the order execution collaborator.
///
/// Live venues and the backtest's simulated fills both implement this.
/// The decision engine treats every call as fallible: a rejection aborts
/// the pending entry (with an optional bounded retry), never leaves partial
/// position state behind.
#[async_trait]
pub trait ExecutionClient: Send + Sync {
    /// Submit an entry order.
    async fn place_order(&self, order: &OrderRequest) -> Result<OrderResult>;

    /// Close an open position at market. `price_hint` is the level that
    /// triggered the exit (stop or target) for venues that support it.
    async fn close_position(&self, position: &Position, price_hint: f64) -> Result<OrderResult>;
}

/// Ordered candle source.
///
/// Contract: candles arrive strictly increasing in `open_time` and gaps are
/// surfaced to the consumer (the engine compares consecutive open times and
/// invalidates its indicator window rather than smoothing across a hole).
/// `Ok(None)` means the stream is exhausted.
#[async_trait]
pub trait CandleFeed: Send + Sync {
    async fn next_candle(&mut self) -> Result<Option<Candle>>;
}
