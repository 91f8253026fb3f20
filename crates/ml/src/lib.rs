pub mod artifact;
pub mod filter;
pub mod regime;

pub use artifact::{FilterArtifact, RegimeArtifact};
pub use filter::{ConstantFilterModel, FilterModel, SignalQualityFilter};
pub use regime::{RegimeClassifier, RegimeModel, ThresholdRegimeModel};
