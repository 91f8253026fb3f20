use std::sync::Arc;

use tracing::{debug, warn};

use common::{FeatureVector, Signal, SignalScore};

/// Opaque pretrained quality model: probability in [0, 1] that a candidate
/// signal resembles historically profitable entries.
pub trait FilterModel: Send + Sync {
    fn probability(&self, features: &FeatureVector, signal: &Signal) -> f64;
}

/// Probability gate between raw signal generation and order placement.
///
/// Disabled means pass-through with probability 1.0. Enabled without a
/// loaded model auto-accepts with a warning rather than silencing the
/// strategy.
pub struct SignalQualityFilter {
    model: Option<Arc<dyn FilterModel>>,
    threshold: f64,
    enabled: bool,
}

impl SignalQualityFilter {
    pub fn new(model: Arc<dyn FilterModel>, threshold: f64) -> Self {
        Self {
            model: Some(model),
            threshold,
            enabled: true,
        }
    }

    /// A filter with no backing model. Signals are accepted as-is.
    pub fn unloaded(threshold: f64) -> Self {
        Self {
            model: None,
            threshold,
            enabled: true,
        }
    }

    pub fn disabled() -> Self {
        Self {
            model: None,
            threshold: 0.0,
            enabled: false,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn score(&self, features: &FeatureVector, signal: &Signal) -> SignalScore {
        if !self.enabled {
            return SignalScore {
                probability: 1.0,
                accepted: true,
            };
        }

        let Some(model) = &self.model else {
            warn!("Signal filter enabled but no model loaded, accepting signal unfiltered");
            return SignalScore {
                probability: 1.0,
                accepted: true,
            };
        };

        let probability = model.probability(features, signal).clamp(0.0, 1.0);
        let accepted = probability >= self.threshold;
        debug!(
            probability,
            threshold = self.threshold,
            accepted,
            direction = %signal.direction,
            "Signal scored"
        );
        SignalScore {
            probability,
            accepted,
        }
    }
}

/// Fixed-probability model for tests and dry runs.
#[derive(Debug, Clone, Copy)]
pub struct ConstantFilterModel(pub f64);

impl FilterModel for ConstantFilterModel {
    fn probability(&self, _features: &FeatureVector, _signal: &Signal) -> f64 {
        self.0
    }
}
