//! Serialized model artifacts exported by the offline training pipeline.
//!
//! Both artifacts are plain JSON: standardization statistics plus linear
//! weights. Training happens elsewhere; this module only loads and scores.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use common::{Error, FeatureVector, Result, Signal};

use crate::filter::FilterModel;
use crate::regime::RegimeModel;

/// Multinomial logistic regime model: standardize features, apply one
/// weight row per regime class, softmax the logits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeArtifact {
    /// One row per regime class, in label order.
    pub weights: [[f64; FeatureVector::DIM]; 4],
    pub bias: [f64; 4],
    pub mean: [f64; FeatureVector::DIM],
    pub std: [f64; FeatureVector::DIM],
}

impl RegimeArtifact {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)?;
        let artifact: Self = serde_json::from_str(&raw)
            .map_err(|e| Error::ModelUnavailable(format!("{}: {e}", path.display())))?;
        artifact.validate()?;
        info!(path = %path.display(), "Loaded regime model artifact");
        Ok(artifact)
    }

    fn validate(&self) -> Result<()> {
        if self.std.iter().any(|s| *s <= 0.0) {
            return Err(Error::ModelUnavailable(
                "regime artifact has non-positive feature scale".into(),
            ));
        }
        Ok(())
    }

    fn standardize(&self, features: &FeatureVector) -> [f64; FeatureVector::DIM] {
        let raw = features.as_array();
        let mut scaled = [0.0; FeatureVector::DIM];
        for i in 0..FeatureVector::DIM {
            scaled[i] = (raw[i] - self.mean[i]) / self.std[i];
        }
        scaled
    }
}

impl RegimeModel for RegimeArtifact {
    fn predict(&self, features: &FeatureVector) -> [f64; 4] {
        let x = self.standardize(features);
        let mut logits = [0.0; 4];
        for (k, row) in self.weights.iter().enumerate() {
            logits[k] = self.bias[k] + row.iter().zip(x.iter()).map(|(w, v)| w * v).sum::<f64>();
        }

        // Softmax with max subtraction for numerical stability.
        let max = logits.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let mut probs = [0.0; 4];
        let mut denom = 0.0;
        for k in 0..4 {
            probs[k] = (logits[k] - max).exp();
            denom += probs[k];
        }
        for p in &mut probs {
            *p /= denom;
        }
        probs
    }
}

/// Binary logistic signal-quality model. The direction term lets the model
/// learn an asymmetry between long and short entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterArtifact {
    pub weights: [f64; FeatureVector::DIM],
    pub direction_weight: f64,
    pub bias: f64,
    pub mean: [f64; FeatureVector::DIM],
    pub std: [f64; FeatureVector::DIM],
}

impl FilterArtifact {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)?;
        let artifact: Self = serde_json::from_str(&raw)
            .map_err(|e| Error::ModelUnavailable(format!("{}: {e}", path.display())))?;
        if artifact.std.iter().any(|s| *s <= 0.0) {
            return Err(Error::ModelUnavailable(
                "filter artifact has non-positive feature scale".into(),
            ));
        }
        info!(path = %path.display(), "Loaded signal filter artifact");
        Ok(artifact)
    }
}

impl FilterModel for FilterArtifact {
    fn probability(&self, features: &FeatureVector, signal: &Signal) -> f64 {
        let raw = features.as_array();
        let mut z = self.bias + self.direction_weight * signal.direction.sign();
        for i in 0..FeatureVector::DIM {
            z += self.weights[i] * (raw[i] - self.mean[i]) / self.std[i];
        }
        1.0 / (1.0 + (-z).exp())
    }
}
