pub mod adx;
pub mod features;

pub use adx::IndicatorEngine;
pub use features::FeatureWindow;
