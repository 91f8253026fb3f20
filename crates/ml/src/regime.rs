use std::sync::Arc;

use tracing::debug;

use common::{FeatureVector, RegimeCall, RegimeLabel};

/// Opaque pretrained classification model: a probability vector over the
/// four regime classes, in `RegimeLabel::ALL` order, summing to 1.
///
/// The core never trains models; it only consumes this scoring contract.
pub trait RegimeModel: Send + Sync {
    fn predict(&self, features: &FeatureVector) -> [f64; 4];
}

/// Maps a feature snapshot to the prevailing market regime.
///
/// Deterministic given identical inputs and an identical loaded model.
/// Fails closed: with no model loaded it returns Sideways with confidence
/// 0.0, which callers must treat as "baseline parameters, no regime
/// overrides".
pub struct RegimeClassifier {
    model: Option<Arc<dyn RegimeModel>>,
}

impl RegimeClassifier {
    pub fn new(model: Arc<dyn RegimeModel>) -> Self {
        Self { model: Some(model) }
    }

    /// A classifier with no backing model (classification disabled or the
    /// artifact failed to load).
    pub fn unloaded() -> Self {
        Self { model: None }
    }

    pub fn has_model(&self) -> bool {
        self.model.is_some()
    }

    pub fn classify(&self, features: &FeatureVector) -> RegimeCall {
        let Some(model) = &self.model else {
            return RegimeCall::unclassified();
        };

        let probs = model.predict(features);
        let (idx, confidence) = probs
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, p)| (i, *p))
            .unwrap_or((0, 0.0));

        let label = RegimeLabel::ALL[idx];
        debug!(regime = %label, confidence, "Regime classified");
        RegimeCall { label, confidence }
    }
}

/// Rule-based stub mirroring the labeling heuristic the trained model was
/// fitted against. Used in tests and as a degraded-mode fallback.
///
/// Strong trend (mean ADX >= threshold) classifies by momentum sign;
/// otherwise an elevated ATR percentage reads as high volatility, else sideways.
#[derive(Debug, Clone)]
pub struct ThresholdRegimeModel {
    pub trend_threshold: f64,
    pub volatility_threshold: f64,
}

impl Default for ThresholdRegimeModel {
    fn default() -> Self {
        Self {
            trend_threshold: 25.0,
            volatility_threshold: 2.0,
        }
    }
}

impl RegimeModel for ThresholdRegimeModel {
    fn predict(&self, features: &FeatureVector) -> [f64; 4] {
        let dominant = if features.trend_strength >= self.trend_threshold {
            if features.momentum >= 0.0 {
                RegimeLabel::Uptrend
            } else {
                RegimeLabel::Downtrend
            }
        } else if features.volatility_ratio >= self.volatility_threshold {
            RegimeLabel::HighVolatility
        } else {
            RegimeLabel::Sideways
        };

        let mut probs = [0.05; 4];
        let idx = RegimeLabel::ALL
            .iter()
            .position(|r| *r == dominant)
            .unwrap_or(0);
        probs[idx] = 0.85;
        probs
    }
}
