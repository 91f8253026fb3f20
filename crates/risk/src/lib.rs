pub mod manager;

pub use manager::{RiskLevels, RiskManager};
