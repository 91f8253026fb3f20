pub mod config;
pub mod error;
pub mod execution;
pub mod params;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use execution::{CandleFeed, ExecutionClient};
pub use params::{ParameterBounds, ParameterSet, ParameterStore};
pub use types::*;
