pub mod report;
pub mod runner;
pub mod sim;

pub use report::{BacktestReport, TradeRecord};
pub use runner::{BacktestConfig, Backtester};
pub use sim::{ReplayFeed, SimExecution, TrackedFeed};
